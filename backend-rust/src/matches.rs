//! # matches
//!
//! Match lifecycle: `LOBBY → INVITED → PRESTART → (BULL_ROUND)* → STARTED`,
//! with decline, expiry and cancel as off-ramps before prestart.
//!
//! Every function here runs under the hub's state lock. Timer callbacks
//! arrive with the nonce of the timer that fired and act only if the entity
//! still holds that same timer, so a callback racing an accept, cancel or
//! newer timer is a no-op.

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::CoreError;
use crate::handlers::{enter_room, leave_room};
use crate::hub::Hub;
use crate::lobby::{MatchMode, PendingMatch};
use crate::persistence::StoreEvent;
use crate::prestart::{ChoiceOutcome, PrestartSession, ThrowOutcome, TieBreak};
use crate::protocol::ServerMessage;
use crate::rooms::Seat;
use crate::sessions::ConnId;
use crate::state::HubState;
use crate::timer::Timer;

pub struct NewMatch {
    pub game: String,
    pub mode: MatchMode,
    pub value: u32,
    pub starting_score: u32,
    pub require_calibration: bool,
    pub allow_spectators: bool,
}

// ── Lobby ────────────────────────────────────────────────────────────────────

pub fn broadcast_lobby(st: &HubState) {
    st.sessions.send_all(&ServerMessage::Matches {
        matches: st.lobby.snapshot(),
    });
}

pub fn list_matches(st: &HubState, conn: ConnId) {
    st.sessions.send(
        conn,
        ServerMessage::Matches {
            matches: st.lobby.snapshot(),
        },
    );
}

pub fn create_match(hub: &Hub, st: &mut HubState, conn: ConnId, req: NewMatch) -> Result<(), CoreError> {
    let game = req.game.trim().to_string();
    if game.is_empty() {
        return Err(CoreError::bad_request("game is required"));
    }
    if req.value == 0 || req.starting_score == 0 {
        return Err(CoreError::bad_request("value and startingScore must be positive"));
    }

    let identity = st.sessions.identity(conn).cloned();
    if hub.auth.is_premium_game(&game) && !hub.auth.is_premium(identity.as_ref()) {
        return Err(CoreError::PremiumRequired(game));
    }

    // One open match per creator.
    for old in st.lobby.created_by(conn) {
        if let Some(prev) = st.lobby.remove(&old) {
            if let Some(joiner) = prev.joiner_id {
                st.sessions.send(joiner, ServerMessage::Declined { match_id: prev.id.clone() });
            }
            hub.store.publish(StoreEvent::MatchRemoved(prev.id));
        }
    }

    let pending = PendingMatch {
        id: Uuid::new_v4().to_string(),
        creator_id: conn,
        creator_name: identity
            .as_ref()
            .map(|i| i.display_name())
            .unwrap_or_else(|| "Guest".to_string()),
        game,
        mode: req.mode,
        value: req.value,
        starting_score: req.starting_score,
        require_calibration: req.require_calibration,
        allow_spectators: req.allow_spectators,
        joiner_id: None,
        joiner_name: None,
        created_at: Utc::now(),
        creator_key: identity.as_ref().and_then(|i| i.key()),
    };
    info!("Match {} created by {} ({})", pending.id, pending.creator_name, pending.game);

    hub.store.publish(StoreEvent::MatchUpserted(pending.clone()));
    st.lobby.insert(pending);
    broadcast_lobby(st);
    Ok(())
}

/// The live connection of a match's creator, following a reconnect by
/// identity when the recorded connection is gone.
fn resolve_creator(st: &HubState, pending: &PendingMatch) -> Option<ConnId> {
    if st.sessions.contains(pending.creator_id) {
        return Some(pending.creator_id);
    }
    pending
        .creator_key
        .as_deref()
        .and_then(|key| st.sessions.lookup_by_username_or_email(key))
}

fn is_creator(st: &HubState, pending: &PendingMatch, conn: ConnId) -> bool {
    if pending.creator_id == conn {
        return true;
    }
    match (pending.creator_key.as_deref(), st.sessions.identity(conn)) {
        (Some(key), Some(identity)) => identity.matches(key),
        _ => false,
    }
}

pub fn join_match(
    hub: &Hub,
    st: &mut HubState,
    conn: ConnId,
    match_id: &str,
    calibrated: bool,
) -> Result<(), CoreError> {
    let entry = st.lobby.get(match_id).ok_or_else(|| CoreError::not_found("match"))?;
    let pending = &entry.info;

    if is_creator(st, pending, conn) {
        return Err(CoreError::bad_request("cannot join your own match"));
    }
    if pending.joiner_id.is_some_and(|j| j != conn) {
        return Err(CoreError::bad_request("match already has a pending joiner"));
    }
    let identity = st.sessions.identity(conn).cloned();
    if hub.auth.is_premium_game(&pending.game) && !hub.auth.is_premium(identity.as_ref()) {
        return Err(CoreError::PremiumRequired(pending.game.clone()));
    }
    if pending.require_calibration && !calibrated {
        return Err(CoreError::CalibrationRequired);
    }
    let creator = resolve_creator(st, pending)
        .ok_or_else(|| CoreError::UserOffline(pending.creator_name.clone()))?;

    let joiner_name = identity
        .as_ref()
        .map(|i| i.display_name())
        .unwrap_or_else(|| "Guest".to_string());

    let expiry = {
        let hub = hub.clone();
        let id = match_id.to_string();
        Timer::spawn(hub.config.invite_expiry(), move |nonce| async move {
            hub.on_invite_expired(id, nonce).await;
        })
    };

    let Some(entry) = st.lobby.get_mut(match_id) else {
        expiry.cancel();
        return Err(CoreError::not_found("match"));
    };
    entry.cancel_invite();
    entry.cancel_grace();
    entry.invite = Some(expiry);
    entry.info.creator_id = creator;
    entry.info.joiner_id = Some(conn);
    entry.info.joiner_name = Some(joiner_name.clone());
    let pending = entry.info.clone();

    st.sessions.send(
        creator,
        ServerMessage::Invite {
            match_id: pending.id.clone(),
            from_id: conn,
            from_name: joiner_name,
            game: pending.game.clone(),
            mode: pending.mode,
            value: pending.value,
            starting_score: pending.starting_score,
            calibrated,
        },
    );
    st.sessions.send(
        conn,
        ServerMessage::InviteWaiting {
            match_id: pending.id.clone(),
            creator_name: pending.creator_name.clone(),
        },
    );
    info!("Invite for match {} sent to {creator}", pending.id);

    hub.store.publish(StoreEvent::MatchUpserted(pending));
    broadcast_lobby(st);
    Ok(())
}

// ── Accept / Decline / Cancel ────────────────────────────────────────────────

pub fn accept_invite(hub: &Hub, st: &mut HubState, conn: ConnId, match_id: &str) -> Result<(), CoreError> {
    let entry = st.lobby.get(match_id).ok_or_else(|| CoreError::not_found("match"))?;
    if !is_creator(st, &entry.info, conn) {
        return Err(CoreError::forbidden("only the match creator can accept"));
    }
    let joiner = entry
        .info
        .joiner_id
        .ok_or_else(|| CoreError::bad_request("nobody has asked to join this match"))?;

    if !st.sessions.contains(joiner) {
        let name = entry.info.joiner_name.clone().unwrap_or_else(|| "Guest".to_string());
        if let Some(entry) = st.lobby.get_mut(match_id) {
            entry.clear_joiner();
            hub.store.publish(StoreEvent::MatchUpserted(entry.info.clone()));
        }
        broadcast_lobby(st);
        return Err(CoreError::UserOffline(name));
    }

    let Some(mut pending) = st.lobby.remove(match_id) else {
        return Err(CoreError::not_found("match"));
    };
    pending.creator_id = conn;
    hub.store.publish(StoreEvent::MatchRemoved(pending.id.clone()));

    let room_id = pending.id.clone();
    enter_room(st, conn, &room_id, false);
    enter_room(st, joiner, &room_id, false);
    seat_players(st, &room_id, conn, joiner);
    if let Some(room) = st.rooms.get_mut(&room_id) {
        room.allow_spectators = pending.allow_spectators;
    }

    if let Some(mut old) = st.prestart.remove(&room_id) {
        old.cancel_countdown();
    }
    let seconds = hub.config.prestart_seconds;
    let ends_at = crate::now_ms() + (seconds as i64) * 1000;
    let mut session = PrestartSession::new(room_id.clone(), [conn, joiner], pending.clone(), ends_at);
    session.countdown = Some({
        let hub = hub.clone();
        let id = room_id.clone();
        Timer::spawn(hub.config.prestart(), move |nonce| async move {
            hub.on_prestart_timeout(id, nonce).await;
        })
    });
    st.prestart.insert(room_id.clone(), session);

    let msg = ServerMessage::MatchPrestart {
        room_id: room_id.clone(),
        pending,
        participants: vec![conn, joiner],
        prestart_ends_at: ends_at,
        seconds,
    };
    send_to_match(st, &room_id, &[conn, joiner], &msg);
    info!("Match {room_id} accepted; prestart ends in {seconds}s");

    broadcast_lobby(st);
    Ok(())
}

/// Hands the match room to its creator and joiner. Anyone else already in
/// it as a player is moved out.
fn seat_players(st: &mut HubState, room_id: &str, creator: ConnId, joiner: ConnId) {
    let seat = |st: &HubState, conn: ConnId| Seat {
        conn,
        username: st.sessions.get(conn).and_then(|c| c.username()),
    };
    let owner = seat(st, creator);
    let players = vec![owner.clone(), seat(st, joiner)];
    st.rooms.seat(room_id, owner, players);

    let intruders: Vec<ConnId> = st
        .rooms
        .get(room_id)
        .map(|r| r.members().to_vec())
        .unwrap_or_default()
        .into_iter()
        .filter(|m| *m != creator && *m != joiner)
        .filter(|m| st.sessions.get(*m).is_some_and(|c| !c.spectator))
        .collect();
    for conn in intruders {
        info!("Moving {conn} out of match room {room_id}");
        leave_room(st, conn);
    }
}

/// `remove` drops the match entirely; otherwise only the joiner is cleared
/// and the match stays listed.
pub fn decline_invite(
    hub: &Hub,
    st: &mut HubState,
    conn: ConnId,
    match_id: &str,
    remove: bool,
) -> Result<(), CoreError> {
    let entry = st.lobby.get(match_id).ok_or_else(|| CoreError::not_found("match"))?;
    if !is_creator(st, &entry.info, conn) {
        return Err(CoreError::forbidden("only the match creator can decline"));
    }

    let joiner = if remove {
        let pending = st.lobby.remove(match_id);
        hub.store.publish(StoreEvent::MatchRemoved(match_id.to_string()));
        pending.and_then(|p| p.joiner_id)
    } else {
        st.lobby.get_mut(match_id).and_then(|entry| {
            let joiner = entry.clear_joiner();
            hub.store.publish(StoreEvent::MatchUpserted(entry.info.clone()));
            joiner
        })
    };

    if let Some(joiner) = joiner {
        st.sessions.send(joiner, ServerMessage::Declined { match_id: match_id.to_string() });
    }
    info!("Match {match_id} declined (removed: {remove})");
    broadcast_lobby(st);
    Ok(())
}

pub fn cancel_match(hub: &Hub, st: &mut HubState, conn: ConnId, match_id: &str) -> Result<(), CoreError> {
    let entry = st.lobby.get(match_id).ok_or_else(|| CoreError::not_found("match"))?;
    let admin = st.sessions.get(conn).is_some_and(|c| c.is_admin());
    if !admin && !is_creator(st, &entry.info, conn) {
        return Err(CoreError::forbidden("only the match creator can cancel"));
    }

    if let Some(pending) = st.lobby.remove(match_id) {
        if let Some(joiner) = pending.joiner_id {
            st.sessions.send(joiner, ServerMessage::Declined { match_id: pending.id.clone() });
        }
        hub.store.publish(StoreEvent::MatchRemoved(pending.id));
    }
    info!("Match {match_id} cancelled");
    broadcast_lobby(st);
    Ok(())
}

// ── Prestart ─────────────────────────────────────────────────────────────────

pub fn prestart_choice(st: &mut HubState, conn: ConnId, room_id: &str, choice: TieBreak) -> Result<(), CoreError> {
    let session = st
        .prestart
        .get_mut(room_id)
        .ok_or_else(|| CoreError::not_found("prestart session"))?;
    let outcome = session.choose(conn, choice)?;
    let participants = session.participants;
    let notify = ServerMessage::PrestartChoiceNotify {
        room_id: room_id.to_string(),
        choices: session.choice_snapshot(),
    };
    send_to_match(st, room_id, &participants, &notify);

    match outcome {
        ChoiceOutcome::StartNow => {
            start_match(st, room_id, None);
        }
        ChoiceOutcome::BeginBull => {
            debug!("Bull-up started in {room_id}");
            let msg = ServerMessage::PrestartBull {
                room_id: room_id.to_string(),
                round: 0,
            };
            send_to_match(st, room_id, &participants, &msg);
        }
        ChoiceOutcome::Waiting | ChoiceOutcome::Mixed => {}
    }
    Ok(())
}

pub fn prestart_bull_throw(st: &mut HubState, conn: ConnId, room_id: &str, score: u32) -> Result<(), CoreError> {
    let session = st
        .prestart
        .get_mut(room_id)
        .ok_or_else(|| CoreError::not_found("prestart session"))?;
    let outcome = session.throw(conn, score)?;
    let participants = session.participants;
    let scores = session.throw_snapshot();

    match outcome {
        ThrowOutcome::Waiting => {}
        ThrowOutcome::Winner { winner, round } => {
            let msg = ServerMessage::PrestartBullWinner {
                room_id: room_id.to_string(),
                winner_id: winner,
                round,
                scores,
            };
            send_to_match(st, room_id, &participants, &msg);
            start_match(st, room_id, Some(winner));
        }
        ThrowOutcome::Tie { round, next_round } => {
            debug!("Bull-up tie in {room_id}, round {round}");
            let tie = ServerMessage::PrestartBullTie {
                room_id: room_id.to_string(),
                round,
                scores,
            };
            send_to_match(st, room_id, &participants, &tie);
            let next = ServerMessage::PrestartBull {
                room_id: room_id.to_string(),
                round: next_round,
            };
            send_to_match(st, room_id, &participants, &next);
        }
    }
    Ok(())
}

/// Ends prestart for `room_id` and announces `match-start`. Returns false
/// when the session is already gone.
pub fn start_match(st: &mut HubState, room_id: &str, first_player: Option<ConnId>) -> bool {
    let Some(mut session) = st.prestart.remove(room_id) else {
        return false;
    };
    session.cancel_countdown();

    let msg = ServerMessage::MatchStart {
        room_id: room_id.to_string(),
        pending: session.pending,
        first_player_id: first_player,
    };
    send_to_match(st, room_id, &session.participants, &msg);
    info!("Match {room_id} started");
    true
}

pub fn prestart_timeout(st: &mut HubState, room_id: &str, nonce: Uuid) {
    let Some(session) = st.prestart.get_mut(room_id) else {
        return;
    };
    if session.countdown.as_ref().map(|t| t.nonce) != Some(nonce) {
        return;
    }
    // The firing task is this one; dropping the handle detaches it.
    drop(session.countdown.take());
    debug!("Prestart countdown elapsed for {room_id}");
    start_match(st, room_id, None);
}

/// Room members plus any participant no longer in the room.
fn send_to_match(st: &HubState, room_id: &str, participants: &[ConnId], msg: &ServerMessage) {
    st.rooms.broadcast(&st.sessions, room_id, msg, None);
    let members = st.rooms.get(room_id).map(|r| r.members()).unwrap_or_default();
    for p in participants.iter().filter(|p| !members.contains(p)) {
        st.sessions.send(*p, msg.clone());
    }
}

// ── Expiry & Reconnect ───────────────────────────────────────────────────────

pub fn expire_invite(hub: &Hub, st: &mut HubState, match_id: &str, nonce: Uuid) {
    let Some(entry) = st.lobby.get_mut(match_id) else {
        return;
    };
    if entry.invite.as_ref().map(|t| t.nonce) != Some(nonce) {
        return;
    }
    drop(entry.invite.take());

    let Some(pending) = st.lobby.remove(match_id) else {
        return;
    };
    let notice = ServerMessage::InviteExpired {
        match_id: pending.id.clone(),
    };
    st.sessions.send(pending.creator_id, notice.clone());
    if let Some(joiner) = pending.joiner_id {
        st.sessions.send(joiner, notice);
    }
    info!("Invite for match {} expired", pending.id);

    hub.store.publish(StoreEvent::MatchRemoved(pending.id));
    broadcast_lobby(st);
}

pub fn purge_after_grace(hub: &Hub, st: &mut HubState, match_id: &str, nonce: Uuid) {
    let Some(entry) = st.lobby.get_mut(match_id) else {
        return;
    };
    if entry.grace.as_ref().map(|t| t.nonce) != Some(nonce) {
        return;
    }
    drop(entry.grace.take());

    let Some(pending) = st.lobby.remove(match_id) else {
        return;
    };
    if let Some(joiner) = pending.joiner_id {
        st.sessions.send(joiner, ServerMessage::InviteExpired { match_id: pending.id.clone() });
    }
    info!("Creator of match {} did not return; purged", pending.id);

    hub.store.publish(StoreEvent::MatchRemoved(pending.id));
    broadcast_lobby(st);
}

/// Re-points lobby entries at a creator who came back under a new
/// connection, cancelling their reconnect grace.
pub fn rebind_creator(hub: &Hub, st: &mut HubState, conn: ConnId, key: &str) {
    let mut changed = false;
    for id in st.lobby.created_by_key(key) {
        let Some(entry) = st.lobby.get_mut(&id) else {
            continue;
        };
        let old = entry.info.creator_id;
        if old == conn || (!entry.creator_disconnected() && st.sessions.contains(old)) {
            continue;
        }
        entry.cancel_grace();
        entry.info.creator_id = conn;
        let pending = entry.info.clone();
        info!("Creator of match {id} reconnected as {conn}");

        if let (Some(joiner), Some(name)) = (pending.joiner_id, pending.joiner_name.clone()) {
            st.sessions.send(
                conn,
                ServerMessage::Invite {
                    match_id: pending.id.clone(),
                    from_id: joiner,
                    from_name: name,
                    game: pending.game.clone(),
                    mode: pending.mode,
                    value: pending.value,
                    starting_score: pending.starting_score,
                    calibrated: false,
                },
            );
        }
        hub.store.publish(StoreEvent::MatchUpserted(pending));
        changed = true;
    }
    if changed {
        broadcast_lobby(st);
    }
}

/// Match-side cleanup for a connection that is going away.
pub fn on_disconnect(hub: &Hub, st: &mut HubState, conn: ConnId) {
    let mut changed = false;

    let rooms: Vec<String> = st
        .prestart
        .iter()
        .filter(|(_, s)| s.is_participant(conn))
        .map(|(id, _)| id.clone())
        .collect();
    for room_id in rooms {
        if let Some(mut session) = st.prestart.remove(&room_id) {
            session.cancel_countdown();
            info!("Prestart for {room_id} abandoned: {conn} left");
        }
    }

    let key = st.sessions.identity(conn).and_then(|i| i.key());
    for id in st.lobby.created_by(conn) {
        let Some(entry) = st.lobby.get_mut(&id) else {
            continue;
        };
        if let Some(k) = &key {
            entry.info.creator_key = Some(k.clone());
        }
        if entry.info.creator_key.is_none() {
            if let Some(pending) = st.lobby.remove(&id) {
                if let Some(joiner) = pending.joiner_id {
                    st.sessions.send(joiner, ServerMessage::Declined { match_id: pending.id.clone() });
                }
                hub.store.publish(StoreEvent::MatchRemoved(pending.id));
                changed = true;
            }
            continue;
        }
        if entry.grace.is_none() {
            let hub2 = hub.clone();
            let match_id = id.clone();
            entry.grace = Some(Timer::spawn(hub.config.reconnect_grace(), move |nonce| async move {
                hub2.on_grace_elapsed(match_id, nonce).await;
            }));
            info!("Creator of match {id} disconnected; holding for {}s", hub.config.reconnect_grace_secs);
        }
    }

    for id in st.lobby.joined_by(conn) {
        if let Some(entry) = st.lobby.get_mut(&id) {
            entry.clear_joiner();
            hub.store.publish(StoreEvent::MatchUpserted(entry.info.clone()));
            changed = true;
        }
    }

    if changed {
        broadcast_lobby(st);
    }
}
