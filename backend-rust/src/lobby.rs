//! # lobby
//!
//! Advertised, not-yet-started matches and the timers attached to them:
//! the invite expiry armed when someone asks to join, and the reconnect
//! grace armed when the creator's connection drops.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::sessions::ConnId;
use crate::timer::Timer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    Bestof,
    Firstto,
}

/// Lobby entry as clients see it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMatch {
    pub id: String,
    pub creator_id: ConnId,
    pub creator_name: String,
    pub game: String,
    pub mode: MatchMode,
    pub value: u32,
    pub starting_score: u32,
    pub require_calibration: bool,
    pub allow_spectators: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub joiner_id: Option<ConnId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub joiner_name: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Normalized username/email of the creator, for reconnect matching.
    #[serde(skip)]
    pub creator_key: Option<String>,
}

pub struct LobbyEntry {
    pub info: PendingMatch,
    pub invite: Option<Timer>,
    pub grace: Option<Timer>,
}

impl LobbyEntry {
    pub fn new(info: PendingMatch) -> Self {
        Self {
            info,
            invite: None,
            grace: None,
        }
    }

    pub fn cancel_invite(&mut self) {
        if let Some(t) = self.invite.take() {
            t.cancel();
        }
    }

    pub fn cancel_grace(&mut self) {
        if let Some(t) = self.grace.take() {
            t.cancel();
        }
    }

    pub fn clear_joiner(&mut self) -> Option<ConnId> {
        self.cancel_invite();
        self.info.joiner_name = None;
        self.info.joiner_id.take()
    }

    pub fn creator_disconnected(&self) -> bool {
        self.grace.is_some()
    }
}

#[derive(Default)]
pub struct Lobby {
    entries: HashMap<String, LobbyEntry>,
}

impl Lobby {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, info: PendingMatch) {
        self.entries.insert(info.id.clone(), LobbyEntry::new(info));
    }

    /// Remove an entry, cancelling any timers it still holds.
    pub fn remove(&mut self, id: &str) -> Option<PendingMatch> {
        let mut entry = self.entries.remove(id)?;
        entry.cancel_invite();
        entry.cancel_grace();
        Some(entry.info)
    }

    pub fn get(&self, id: &str) -> Option<&LobbyEntry> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut LobbyEntry> {
        self.entries.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Authoritative listing, oldest first.
    pub fn snapshot(&self) -> Vec<PendingMatch> {
        let mut list: Vec<PendingMatch> = self.entries.values().map(|e| e.info.clone()).collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        list
    }

    pub fn created_by(&self, conn: ConnId) -> Vec<String> {
        self.entries
            .values()
            .filter(|e| e.info.creator_id == conn)
            .map(|e| e.info.id.clone())
            .collect()
    }

    pub fn joined_by(&self, conn: ConnId) -> Vec<String> {
        self.entries
            .values()
            .filter(|e| e.info.joiner_id == Some(conn))
            .map(|e| e.info.id.clone())
            .collect()
    }

    /// Entries whose creator announced the identity `key`.
    pub fn created_by_key(&self, key: &str) -> Vec<String> {
        self.entries
            .values()
            .filter(|e| e.info.creator_key.as_deref() == Some(key))
            .map(|e| e.info.id.clone())
            .collect()
    }

    pub fn due_invites(&self, now: Instant) -> Vec<(String, uuid::Uuid)> {
        self.entries
            .values()
            .filter_map(|e| e.invite.as_ref().filter(|t| t.is_due(now)).map(|t| (e.info.id.clone(), t.nonce)))
            .collect()
    }

    pub fn due_graces(&self, now: Instant) -> Vec<(String, uuid::Uuid)> {
        self.entries
            .values()
            .filter_map(|e| e.grace.as_ref().filter(|t| t.is_due(now)).map(|t| (e.info.id.clone(), t.nonce)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn pending(id: &str, creator: ConnId, age_secs: i64) -> PendingMatch {
        PendingMatch {
            id: id.to_string(),
            creator_id: creator,
            creator_name: "alice".into(),
            game: "X01".into(),
            mode: MatchMode::Bestof,
            value: 3,
            starting_score: 501,
            require_calibration: false,
            allow_spectators: true,
            joiner_id: None,
            joiner_name: None,
            created_at: Utc::now() - chrono::Duration::seconds(age_secs),
            creator_key: Some("alice".into()),
        }
    }

    #[test]
    fn snapshot_is_oldest_first() {
        let mut lobby = Lobby::new();
        let c = Uuid::new_v4();
        lobby.insert(pending("new", c, 1));
        lobby.insert(pending("old", c, 100));
        let ids: Vec<String> = lobby.snapshot().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["old", "new"]);
        assert_eq!(lobby.created_by(c).len(), 2);
        assert_eq!(lobby.created_by_key("alice").len(), 2);
        assert!(lobby.created_by_key("bob").is_empty());
    }

    #[test]
    fn wire_shape_hides_creator_key() {
        let m = pending("m1", Uuid::new_v4(), 0);
        let v = serde_json::to_value(&m).unwrap();
        assert_eq!(v["startingScore"], 501);
        assert_eq!(v["mode"], "bestof");
        assert!(v.get("creatorKey").is_none());
        assert!(v.get("joinerId").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn remove_cancels_timers() {
        let mut lobby = Lobby::new();
        let c = Uuid::new_v4();
        lobby.insert(pending("m1", c, 0));
        let entry = lobby.get_mut("m1").unwrap();
        entry.info.joiner_id = Some(Uuid::new_v4());
        entry.invite = Some(Timer::spawn(std::time::Duration::from_secs(60), |_| async {}));

        assert_eq!(lobby.joined_by(entry_joiner(&lobby)).len(), 1);
        assert!(lobby.remove("m1").is_some());
        assert!(lobby.remove("m1").is_none());
        assert!(lobby.is_empty());
    }

    fn entry_joiner(lobby: &Lobby) -> ConnId {
        lobby.get("m1").and_then(|e| e.info.joiner_id).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn due_invites_follow_deadline() {
        let mut lobby = Lobby::new();
        lobby.insert(pending("m1", Uuid::new_v4(), 0));
        lobby.get_mut("m1").unwrap().invite =
            Some(Timer::spawn(std::time::Duration::from_secs(60), |_| async {}));

        assert!(lobby.due_invites(Instant::now()).is_empty());
        let later = Instant::now() + std::time::Duration::from_secs(61);
        assert_eq!(lobby.due_invites(later).len(), 1);
    }
}
