//! # prestart
//!
//! Tie-break window between invite acceptance and the first throw.
//!
//! Both participants pick `bull` or `skip`. Two skips start the match at
//! once; two bulls open a bull-up where each round both players throw one
//! dart and a round with exactly one bullseye decides who throws first.
//! Anything else waits for the countdown, which starts the match regardless.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::lobby::PendingMatch;
use crate::sessions::ConnId;
use crate::timer::Timer;

/// Score of a bull-up dart that counts as a hit.
pub const BULLSEYE: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TieBreak {
    Bull,
    Skip,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChoiceOutcome {
    /// The other participant has not chosen yet.
    Waiting,
    /// Both skipped.
    StartNow,
    /// Both want a bull-up; the first round begins.
    BeginBull,
    /// Mixed choices; the countdown decides.
    Mixed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ThrowOutcome {
    /// The other participant has not thrown this round.
    Waiting,
    Winner { winner: ConnId, round: usize },
    /// Both hit or both missed; `next_round` is the round now open.
    Tie { round: usize, next_round: usize },
}

pub struct PrestartSession {
    pub room_id: String,
    pub participants: [ConnId; 2],
    pub choices: HashMap<ConnId, TieBreak>,
    pub throws: HashMap<ConnId, Vec<u32>>,
    /// Zero-based index of the bull-up round in progress.
    pub round: usize,
    pub bull_started: bool,
    pub pending: PendingMatch,
    pub ends_at_ms: i64,
    pub countdown: Option<Timer>,
}

impl PrestartSession {
    pub fn new(room_id: String, participants: [ConnId; 2], pending: PendingMatch, ends_at_ms: i64) -> Self {
        Self {
            room_id,
            participants,
            choices: HashMap::new(),
            throws: HashMap::new(),
            round: 0,
            bull_started: false,
            pending,
            ends_at_ms,
            countdown: None,
        }
    }

    pub fn is_participant(&self, conn: ConnId) -> bool {
        self.participants.contains(&conn)
    }

    pub fn other(&self, conn: ConnId) -> Option<ConnId> {
        self.participants.iter().copied().find(|p| *p != conn)
    }

    pub fn cancel_countdown(&mut self) {
        if let Some(t) = self.countdown.take() {
            t.cancel();
        }
    }

    pub fn choice_snapshot(&self) -> BTreeMap<ConnId, TieBreak> {
        self.choices.iter().map(|(k, v)| (*k, *v)).collect()
    }

    pub fn throw_snapshot(&self) -> BTreeMap<ConnId, Vec<u32>> {
        self.participants
            .iter()
            .map(|p| (*p, self.throws.get(p).cloned().unwrap_or_default()))
            .collect()
    }

    /// Record (or change) a participant's tie-break choice.
    pub fn choose(&mut self, conn: ConnId, choice: TieBreak) -> Result<ChoiceOutcome, CoreError> {
        if !self.is_participant(conn) {
            return Err(CoreError::forbidden("not a participant of this prestart"));
        }
        if self.bull_started {
            return Err(CoreError::bad_request("bull-up already in progress"));
        }
        self.choices.insert(conn, choice);

        let [a, b] = self.participants;
        let outcome = match (self.choices.get(&a), self.choices.get(&b)) {
            (Some(TieBreak::Skip), Some(TieBreak::Skip)) => ChoiceOutcome::StartNow,
            (Some(TieBreak::Bull), Some(TieBreak::Bull)) => {
                self.bull_started = true;
                self.round = 0;
                ChoiceOutcome::BeginBull
            }
            (Some(_), Some(_)) => ChoiceOutcome::Mixed,
            _ => ChoiceOutcome::Waiting,
        };
        Ok(outcome)
    }

    /// Record one bull-up dart. Throw history is kept across tied rounds.
    pub fn throw(&mut self, conn: ConnId, score: u32) -> Result<ThrowOutcome, CoreError> {
        if !self.is_participant(conn) {
            return Err(CoreError::forbidden("not a participant of this prestart"));
        }
        if !self.bull_started {
            return Err(CoreError::bad_request("bull-up has not started"));
        }
        if score > 60 {
            return Err(CoreError::bad_request(format!("{score} is not a dart score")));
        }

        let round = self.round;
        let list = self.throws.entry(conn).or_default();
        if list.len() > round {
            return Err(CoreError::bad_request("already threw this round"));
        }
        list.push(score);

        let [a, b] = self.participants;
        let score_of = |p: ConnId| self.throws.get(&p).and_then(|l| l.get(round)).copied();
        let (Some(sa), Some(sb)) = (score_of(a), score_of(b)) else {
            return Ok(ThrowOutcome::Waiting);
        };

        match (sa == BULLSEYE, sb == BULLSEYE) {
            (true, false) => Ok(ThrowOutcome::Winner { winner: a, round }),
            (false, true) => Ok(ThrowOutcome::Winner { winner: b, round }),
            _ => {
                self.round += 1;
                Ok(ThrowOutcome::Tie {
                    round,
                    next_round: self.round,
                })
            }
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
