//! # rooms
//!
//! Room Manager: which connections share a match.
//!
//! A room never owns its members. The only link is `Connection::room`,
//! which this module keeps in sync so a connection is in at most one room.
//! Empty rooms are removed together with their room-scoped flags.
//!
//! A room opened for an accepted match is seated: its owner is the match
//! creator and only the two players may join it as non-spectators.

use std::collections::HashMap;

use tracing::debug;

use crate::autocommit::CommitKey;
use crate::protocol::{PeerInfo, ServerMessage};
use crate::sessions::{ConnId, SessionRegistry};

/// A connection with a claim on a room. The username lets the claim
/// survive a reconnect under a new connection id.
#[derive(Debug, Clone, PartialEq)]
pub struct Seat {
    pub conn: ConnId,
    pub username: Option<String>,
}

impl Seat {
    pub fn held_by(&self, conn: ConnId, username: Option<&str>) -> bool {
        if self.conn == conn {
            return true;
        }
        match (self.username.as_deref(), username) {
            (Some(seat), Some(name)) => seat.eq_ignore_ascii_case(name),
            _ => false,
        }
    }
}

#[derive(Debug)]
pub struct Room {
    pub id: String,
    /// Join order.
    members: Vec<ConnId>,
    pub autocommit_allowed: bool,
    pub allow_spectators: bool,
    pub owner: Seat,
    /// Match players. Empty for ad-hoc rooms.
    pub players: Vec<Seat>,
    pub last_commit: Option<CommitKey>,
}

impl Room {
    pub fn members(&self) -> &[ConnId] {
        &self.members
    }

    pub fn contains(&self, conn: ConnId) -> bool {
        self.members.contains(&conn)
    }

    pub fn is_owner(&self, conn: ConnId, username: Option<&str>) -> bool {
        self.owner.held_by(conn, username)
    }

    /// Whether `conn` may play here. Anyone may play in an unseated room.
    pub fn admits_player(&self, conn: ConnId, username: Option<&str>) -> bool {
        self.players.is_empty() || self.players.iter().any(|p| p.held_by(conn, username))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinOutcome {
    pub created: bool,
    /// Room the connection was moved out of, if any.
    pub left: Option<LeaveOutcome>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeaveOutcome {
    pub room_id: String,
    pub destroyed: bool,
    pub remaining: Vec<ConnId>,
}

#[derive(Default)]
pub struct RoomManager {
    rooms: HashMap<String, Room>,
}

impl RoomManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put `conn` into `room_id`, leaving any other room first. The first
    /// member of a new room becomes its owner.
    pub fn join(
        &mut self,
        sessions: &mut SessionRegistry,
        conn: ConnId,
        room_id: &str,
        spectator: bool,
    ) -> JoinOutcome {
        let current = sessions.get(conn).and_then(|c| c.room.clone());
        let left = match current {
            Some(ref r) if r != room_id => self.leave(sessions, conn),
            _ => None,
        };

        let username = sessions.get(conn).and_then(|c| c.username());
        let mut created = false;
        let room = self.rooms.entry(room_id.to_string()).or_insert_with(|| {
            created = true;
            Room {
                id: room_id.to_string(),
                members: Vec::new(),
                autocommit_allowed: false,
                allow_spectators: true,
                owner: Seat { conn, username },
                players: Vec::new(),
                last_commit: None,
            }
        });
        if !room.members.contains(&conn) {
            room.members.push(conn);
        }

        if let Some(c) = sessions.get_mut(conn) {
            c.room = Some(room_id.to_string());
            c.spectator = spectator;
        }
        debug!("{conn} joined room {room_id} (created: {created})");

        JoinOutcome { created, left }
    }

    /// Remove `conn` from its current room. Deletes the room when it
    /// becomes empty.
    pub fn leave(&mut self, sessions: &mut SessionRegistry, conn: ConnId) -> Option<LeaveOutcome> {
        let room_id = sessions.get_mut(conn).and_then(|c| {
            c.spectator = false;
            c.room.take()
        })?;

        let room = self.rooms.get_mut(&room_id)?;
        room.members.retain(|m| *m != conn);
        let remaining = room.members.clone();
        let destroyed = remaining.is_empty();
        if destroyed {
            self.rooms.remove(&room_id);
            debug!("Room {room_id} removed (empty)");
        }

        Some(LeaveOutcome {
            room_id,
            destroyed,
            remaining,
        })
    }

    /// Deliver `msg` to every member except `except`. Returns how many
    /// queues accepted it; dead sockets are left to the liveness sweeper.
    pub fn broadcast(
        &self,
        sessions: &SessionRegistry,
        room_id: &str,
        msg: &ServerMessage,
        except: Option<ConnId>,
    ) -> usize {
        let Some(room) = self.rooms.get(room_id) else {
            return 0;
        };
        room.members
            .iter()
            .filter(|m| Some(**m) != except)
            .filter(|m| sessions.send(**m, msg.clone()))
            .count()
    }

    pub fn peers(&self, sessions: &SessionRegistry, room_id: &str) -> Vec<PeerInfo> {
        self.rooms
            .get(room_id)
            .map(|room| {
                room.members
                    .iter()
                    .filter_map(|m| sessions.get(*m))
                    .map(|c| PeerInfo {
                        id: c.id,
                        username: c.username(),
                        spectator: c.spectator,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Hand `room_id` to a match: `owner` takes the creator's privileges and
    /// only `players` may join it other than as spectators.
    pub fn seat(&mut self, room_id: &str, owner: Seat, players: Vec<Seat>) {
        if let Some(room) = self.rooms.get_mut(room_id) {
            debug!("Room {room_id} seated for {}", owner.conn);
            room.owner = owner;
            room.players = players;
        }
    }

    pub fn get(&self, room_id: &str) -> Option<&Room> {
        self.rooms.get(room_id)
    }

    pub fn get_mut(&mut self, room_id: &str) -> Option<&mut Room> {
        self.rooms.get_mut(room_id)
    }

    pub fn contains(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::TokenBucket;
    use crate::sessions::{Outbound, OutboundRx};
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn setup(n: usize) -> (SessionRegistry, Vec<(ConnId, OutboundRx)>) {
        let mut reg = SessionRegistry::new();
        let mut out = Vec::new();
        for _ in 0..n {
            let (tx, rx) = mpsc::unbounded_channel();
            let id = Uuid::new_v4();
            reg.register(id, tx, TokenBucket::new(10, 10.0));
            out.push((id, rx));
        }
        (reg, out)
    }

    fn drain(rx: &mut OutboundRx) -> usize {
        let mut n = 0;
        while rx.try_recv().is_ok() {
            n += 1;
        }
        n
    }

    #[test]
    fn joining_second_room_leaves_first() {
        let (mut sessions, conns) = setup(2);
        let mut rooms = RoomManager::new();
        let (a, b) = (conns[0].0, conns[1].0);

        assert!(rooms.join(&mut sessions, a, "A", false).created);
        rooms.join(&mut sessions, b, "A", false);

        let outcome = rooms.join(&mut sessions, a, "B", false);
        let left = outcome.left.expect("moved out of A");
        assert_eq!(left.room_id, "A");
        assert!(!left.destroyed);
        assert_eq!(left.remaining, vec![b]);

        assert!(!rooms.get("A").unwrap().contains(a));
        assert!(rooms.get("B").unwrap().contains(a));
        assert_eq!(sessions.get(a).unwrap().room.as_deref(), Some("B"));
    }

    #[test]
    fn empty_room_is_removed_with_its_flags() {
        let (mut sessions, conns) = setup(1);
        let mut rooms = RoomManager::new();
        let a = conns[0].0;

        rooms.join(&mut sessions, a, "A", false);
        rooms.get_mut("A").unwrap().autocommit_allowed = true;

        rooms.join(&mut sessions, a, "B", false);
        assert!(!rooms.contains("A"));

        rooms.join(&mut sessions, a, "A", false);
        assert!(!rooms.get("A").unwrap().autocommit_allowed);
    }

    #[test]
    fn rejoining_same_room_is_a_no_op() {
        let (mut sessions, conns) = setup(1);
        let mut rooms = RoomManager::new();
        let a = conns[0].0;
        rooms.join(&mut sessions, a, "A", false);
        let again = rooms.join(&mut sessions, a, "A", false);
        assert!(!again.created);
        assert!(again.left.is_none());
        assert_eq!(rooms.get("A").unwrap().members(), &[a]);
    }

    #[test]
    fn broadcast_skips_excluded_member() {
        let (mut sessions, mut conns) = setup(3);
        let mut rooms = RoomManager::new();
        for (id, _) in &conns {
            rooms.join(&mut sessions, *id, "R", false);
        }
        let sender = conns[0].0;
        let msg = ServerMessage::PeerLeft { room_id: "R".into(), id: sender };
        assert_eq!(rooms.broadcast(&sessions, "R", &msg, Some(sender)), 2);

        assert_eq!(drain(&mut conns[0].1), 0);
        assert_eq!(drain(&mut conns[1].1), 1);
        assert!(matches!(conns[2].1.try_recv(), Ok(Outbound::Message(_))));
    }

    #[test]
    fn owner_survives_reconnect_by_username() {
        let (mut sessions, conns) = setup(2);
        let mut rooms = RoomManager::new();
        sessions.set_identity(
            conns[0].0,
            crate::sessions::Identity { username: Some("Alice".into()), ..Default::default() },
        );
        rooms.join(&mut sessions, conns[0].0, "R", false);
        let room = rooms.get("R").unwrap();
        assert!(room.is_owner(conns[0].0, None));
        assert!(room.is_owner(conns[1].0, Some("alice")));
        assert!(!room.is_owner(conns[1].0, Some("bob")));
        assert!(!room.is_owner(conns[1].0, None));
    }

    #[test]
    fn seating_replaces_first_member_as_owner() {
        let (mut sessions, conns) = setup(3);
        let mut rooms = RoomManager::new();
        let (early, creator, joiner) = (conns[0].0, conns[1].0, conns[2].0);
        rooms.join(&mut sessions, early, "M", false);
        assert!(rooms.get("M").unwrap().admits_player(creator, None));

        let seat = |conn, name: &str| Seat { conn, username: Some(name.to_string()) };
        rooms.seat("M", seat(creator, "alice"), vec![seat(creator, "alice"), seat(joiner, "bob")]);

        let room = rooms.get("M").unwrap();
        assert!(room.is_owner(creator, None));
        assert!(!room.is_owner(early, None));
        assert!(room.admits_player(joiner, None));
        assert!(room.admits_player(Uuid::new_v4(), Some("BOB")));
        assert!(!room.admits_player(early, Some("mallory")));
    }

    #[test]
    fn leave_without_room_is_none() {
        let (mut sessions, conns) = setup(1);
        let mut rooms = RoomManager::new();
        assert!(rooms.leave(&mut sessions, conns[0].0).is_none());
    }
}
