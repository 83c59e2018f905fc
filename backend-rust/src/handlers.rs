use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::autocommit::{CommitOutcome, SenderFacts, VisitClaim};
use crate::error::CoreError;
use crate::hub::Hub;
use crate::matches::{self, NewMatch};
use crate::persistence::StoreEvent;
use crate::protocol::{ClientMessage, PeerInfo, ServerMessage};
use crate::sessions::ConnId;
use crate::state::HubState;

const MAX_CHAT_CHARS: usize = 500;

// ─── Dispatch ─────────────────────────────────────────────────────────────────

pub fn dispatch(hub: &Hub, st: &mut HubState, conn: ConnId, msg: ClientMessage) -> Result<(), CoreError> {
    match msg {
        ClientMessage::Presence { username, email, token } => {
            on_presence(hub, st, conn, username, email, token);
            Ok(())
        }
        ClientMessage::Join { room_id } => on_join(st, conn, &room_id),
        ClientMessage::Spectate { room_id } => on_spectate(st, conn, &room_id),
        ClientMessage::State { payload } => on_state(st, conn, payload),
        ClientMessage::Chat { message } => on_chat(st, conn, message),
        ClientMessage::Celebration { payload } => on_celebration(st, conn, payload),
        ClientMessage::CreateMatch {
            game,
            mode,
            value,
            starting_score,
            require_calibration,
            allow_spectators,
        } => matches::create_match(
            hub,
            st,
            conn,
            NewMatch {
                game,
                mode,
                value,
                starting_score,
                require_calibration,
                allow_spectators,
            },
        ),
        ClientMessage::ListMatches => {
            matches::list_matches(st, conn);
            Ok(())
        }
        ClientMessage::JoinMatch { match_id, calibrated } => {
            matches::join_match(hub, st, conn, &match_id, calibrated)
        }
        ClientMessage::InviteAccept { match_id } => matches::accept_invite(hub, st, conn, &match_id),
        ClientMessage::InviteDecline { match_id } => {
            matches::decline_invite(hub, st, conn, &match_id, true)
        }
        ClientMessage::InviteResponse { match_id, accept: true } => {
            matches::accept_invite(hub, st, conn, &match_id)
        }
        ClientMessage::InviteResponse { match_id, accept: false } => {
            matches::decline_invite(hub, st, conn, &match_id, false)
        }
        ClientMessage::PrestartChoice { room_id, choice } => {
            matches::prestart_choice(st, conn, &room_id, choice)
        }
        ClientMessage::PrestartBullThrow { room_id, score } => {
            matches::prestart_bull_throw(st, conn, &room_id, score)
        }
        ClientMessage::CancelMatch { match_id } => matches::cancel_match(hub, st, conn, &match_id),
        ClientMessage::SetMatchAutocommit { room_id, allow } => {
            on_set_autocommit(st, conn, &room_id, allow)
        }
        ClientMessage::AutoVisit {
            room_id,
            value,
            darts,
            ring,
            sector,
            board_point,
            calibration_valid,
        } => on_auto_visit(
            hub,
            st,
            conn,
            &room_id,
            VisitClaim {
                value,
                darts,
                ring,
                sector,
                board_point,
                calibration_valid,
            },
        ),
        ClientMessage::CamCreate => {
            on_cam_create(hub, st, conn);
            Ok(())
        }
        ClientMessage::CamJoin { code } => on_cam_join(st, conn, &code),
        ClientMessage::CamSignal { code, payload } => on_cam_signal(st, conn, &code, payload),
    }
}

// ─── Presence ─────────────────────────────────────────────────────────────────

fn on_presence(
    hub: &Hub,
    st: &mut HubState,
    conn: ConnId,
    username: Option<String>,
    email: Option<String>,
    token: Option<String>,
) {
    let identity = hub.auth.resolve_identity(username, email, token.as_deref());
    if st.sessions.set_identity(conn, identity.clone()).is_none() {
        info!("{conn} is {}", identity.display_name());
    }

    st.sessions.send(
        conn,
        ServerMessage::Presence {
            id: conn,
            username: identity.username.clone(),
            email: identity.email.clone(),
            admin: identity.admin,
            online: true,
        },
    );
    let announce = ServerMessage::Presence {
        id: conn,
        username: identity.username.clone(),
        email: None,
        admin: identity.admin,
        online: true,
    };
    for id in st.sessions.ids().into_iter().filter(|id| *id != conn) {
        st.sessions.send(id, announce.clone());
    }

    let key = identity.key();
    hub.store.publish(StoreEvent::Online { identity, conn });
    if let Some(key) = key {
        matches::rebind_creator(hub, st, conn, &key);
    }
}

// ─── Rooms ────────────────────────────────────────────────────────────────────

/// Moves `conn` into `room_id`, telling the room it left and the room it
/// entered.
pub fn enter_room(st: &mut HubState, conn: ConnId, room_id: &str, spectator: bool) {
    let outcome = st.rooms.join(&mut st.sessions, conn, room_id, spectator);
    if let Some(left) = outcome.left {
        let msg = ServerMessage::PeerLeft {
            room_id: left.room_id.clone(),
            id: conn,
        };
        st.rooms.broadcast(&st.sessions, &left.room_id, &msg, None);
    }

    let members = st.rooms.peers(&st.sessions, room_id);
    let me = members.iter().find(|p| p.id == conn).cloned().unwrap_or(PeerInfo {
        id: conn,
        username: None,
        spectator,
    });
    st.sessions.send(
        conn,
        ServerMessage::Joined {
            room_id: room_id.to_string(),
            id: conn,
            spectator,
            members,
        },
    );
    let joined = ServerMessage::PeerJoined {
        room_id: room_id.to_string(),
        peer: me,
    };
    st.rooms.broadcast(&st.sessions, room_id, &joined, Some(conn));
}

/// Removes `conn` from its room, if any, and tells the remaining members.
pub fn leave_room(st: &mut HubState, conn: ConnId) {
    let Some(left) = st.rooms.leave(&mut st.sessions, conn) else {
        return;
    };
    if left.destroyed {
        return;
    }
    let msg = ServerMessage::PeerLeft {
        room_id: left.room_id.clone(),
        id: conn,
    };
    st.rooms.broadcast(&st.sessions, &left.room_id, &msg, None);
}

fn clean_room_id(room_id: &str) -> Result<&str, CoreError> {
    let id = room_id.trim();
    if id.is_empty() {
        return Err(CoreError::bad_request("roomId is required"));
    }
    Ok(id)
}

fn on_join(st: &mut HubState, conn: ConnId, room_id: &str) -> Result<(), CoreError> {
    let room_id = clean_room_id(room_id)?;
    if st.lobby.get(room_id).is_some() {
        return Err(CoreError::forbidden("this match has not been accepted yet"));
    }
    let username = st.sessions.get(conn).and_then(|c| c.username());
    if let Some(room) = st.rooms.get(room_id) {
        if !room.admits_player(conn, username.as_deref()) {
            return Err(CoreError::forbidden("room is reserved for the match players"));
        }
    }
    enter_room(st, conn, room_id, false);
    Ok(())
}

fn on_spectate(st: &mut HubState, conn: ConnId, room_id: &str) -> Result<(), CoreError> {
    let room_id = clean_room_id(room_id)?;
    let room = st.rooms.get(room_id).ok_or_else(|| CoreError::not_found("room"))?;
    if !room.allow_spectators {
        return Err(CoreError::SpectateNotAllowed);
    }
    enter_room(st, conn, room_id, true);
    Ok(())
}

// ─── Relay ────────────────────────────────────────────────────────────────────

/// The sender's room, or `BAD_REQUEST` when it is not in one.
fn current_room(st: &HubState, conn: ConnId) -> Result<(String, bool), CoreError> {
    let c = st.sessions.get(conn).ok_or_else(|| CoreError::not_found("connection"))?;
    let room = c
        .room
        .clone()
        .ok_or_else(|| CoreError::bad_request("join a room first"))?;
    Ok((room, c.spectator))
}

fn on_state(st: &mut HubState, conn: ConnId, payload: Value) -> Result<(), CoreError> {
    let (room_id, spectator) = current_room(st, conn)?;
    if spectator {
        return Err(CoreError::forbidden("spectators cannot send game state"));
    }
    let msg = ServerMessage::State {
        room_id: room_id.clone(),
        from: conn,
        payload,
    };
    st.rooms.broadcast(&st.sessions, &room_id, &msg, Some(conn));
    Ok(())
}

fn on_chat(st: &mut HubState, conn: ConnId, message: String) -> Result<(), CoreError> {
    let (room_id, _) = current_room(st, conn)?;
    let message = message.trim();
    if message.is_empty() {
        return Err(CoreError::bad_request("message is empty"));
    }
    let msg = ServerMessage::Chat {
        room_id: room_id.clone(),
        from: conn,
        username: st.sessions.get(conn).and_then(|c| c.username()),
        message: message.chars().take(MAX_CHAT_CHARS).collect(),
        ts: crate::now_ms(),
    };
    st.rooms.broadcast(&st.sessions, &room_id, &msg, Some(conn));
    Ok(())
}

fn on_celebration(st: &mut HubState, conn: ConnId, payload: Value) -> Result<(), CoreError> {
    let (room_id, _) = current_room(st, conn)?;
    let msg = ServerMessage::Celebration {
        room_id: room_id.clone(),
        from: conn,
        payload,
    };
    st.rooms.broadcast(&st.sessions, &room_id, &msg, Some(conn));
    Ok(())
}

// ─── Autocommit ───────────────────────────────────────────────────────────────

fn on_set_autocommit(st: &mut HubState, conn: ConnId, room_id: &str, allow: bool) -> Result<(), CoreError> {
    let (username, admin) = st
        .sessions
        .get(conn)
        .map(|c| (c.username(), c.is_admin()))
        .unwrap_or_default();
    let room = st.rooms.get_mut(room_id).ok_or_else(|| CoreError::not_found("room"))?;
    if !admin && !room.is_owner(conn, username.as_deref()) {
        return Err(CoreError::forbidden("only the room owner can change autocommit"));
    }
    room.autocommit_allowed = allow;
    let in_room = room.contains(conn);
    info!("Autocommit {} in room {room_id}", if allow { "enabled" } else { "disabled" });

    let msg = ServerMessage::MatchAutocommitUpdated {
        room_id: room_id.to_string(),
        allow,
    };
    st.rooms.broadcast(&st.sessions, room_id, &msg, None);
    if !in_room {
        st.sessions.send(conn, msg);
    }
    Ok(())
}

fn on_auto_visit(hub: &Hub, st: &mut HubState, conn: ConnId, room_id: &str, claim: VisitClaim) -> Result<(), CoreError> {
    let c = st.sessions.get(conn).ok_or_else(|| CoreError::not_found("connection"))?;
    if c.spectator && c.room.as_deref() == Some(room_id) {
        return Err(CoreError::forbidden("spectators cannot submit visits"));
    }
    let username = c.username();
    let is_admin = c.is_admin();
    let is_owner = st
        .rooms
        .get(room_id)
        .is_some_and(|r| r.is_owner(conn, username.as_deref()));
    let sender = SenderFacts { conn, is_owner, is_admin };

    let outcome = hub.validator.validate(
        st.rooms.get_mut(room_id),
        sender,
        username,
        &claim,
        Instant::now(),
        crate::now_ms(),
    )?;

    match outcome {
        CommitOutcome::Commit(visit) => {
            debug!("Visit committed in {room_id}: {} by {conn}", visit.value);
            let msg = ServerMessage::VisitCommit {
                room_id: room_id.to_string(),
                visit,
            };
            st.rooms.broadcast(&st.sessions, room_id, &msg, Some(conn));
            st.sessions.send(conn, msg);
        }
        CommitOutcome::Duplicate => {
            debug!("Dropped replayed visit from {conn} in {room_id}");
        }
    }
    Ok(())
}

// ─── Camera Pairing ───────────────────────────────────────────────────────────

fn on_cam_create(hub: &Hub, st: &mut HubState, conn: ConnId) {
    let ttl = hub.config.pairing_code_ttl();
    let expires_at = crate::now_ms() + ttl.as_millis() as i64;
    let code = st.pairing.create(conn, Instant::now(), expires_at);
    debug!("Pairing code {} issued to {conn}", code.code);
    st.sessions.send(
        conn,
        ServerMessage::CamCode {
            code: code.code,
            expires_at: code.expires_at_ms,
        },
    );
}

fn on_cam_join(st: &mut HubState, conn: ConnId, code: &str) -> Result<(), CoreError> {
    let desktop = st.pairing.join(code, conn)?;
    let msg = ServerMessage::CamPaired {
        code: code.trim().to_uppercase(),
    };
    st.sessions.send(desktop, msg.clone());
    st.sessions.send(conn, msg);
    Ok(())
}

fn on_cam_signal(st: &mut HubState, conn: ConnId, code: &str, payload: Value) -> Result<(), CoreError> {
    let peer = st.pairing.peer_of(code, conn)?;
    st.sessions.send(
        peer,
        ServerMessage::CamSignal {
            code: code.trim().to_uppercase(),
            from: conn,
            payload,
        },
    );
    Ok(())
}
