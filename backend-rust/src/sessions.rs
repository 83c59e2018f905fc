//! # sessions
//!
//! Session Registry: live connections keyed by their ephemeral `ConnId`,
//! plus the durable identity each one announces through `presence`.
//!
//! A connection id does not survive a reconnect; the username (or email)
//! does. Anything that must follow a person across reconnects stores the
//! identity key and resolves it back to a live connection through
//! [`SessionRegistry::lookup_by_username_or_email`].

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::protocol::ServerMessage;
use crate::rate_limit::TokenBucket;

pub type ConnId = Uuid;

/// Items queued for a connection's socket task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    Ping,
    Close,
}

pub type OutboundTx = mpsc::UnboundedSender<Outbound>;
pub type OutboundRx = mpsc::UnboundedReceiver<Outbound>;

// ─── Identity ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub username: Option<String>,
    pub email: Option<String>,
    pub admin: bool,
    pub premium: bool,
}

impl Identity {
    /// Stable lookup key: lower-cased username, else lower-cased email.
    pub fn key(&self) -> Option<String> {
        self.username
            .as_deref()
            .or(self.email.as_deref())
            .map(normalize_key)
    }

    /// True when `key` names this identity by username or email.
    pub fn matches(&self, key: &str) -> bool {
        let key = normalize_key(key);
        self.username.as_deref().map(normalize_key).as_deref() == Some(key.as_str())
            || self.email.as_deref().map(normalize_key).as_deref() == Some(key.as_str())
    }

    pub fn display_name(&self) -> String {
        self.username
            .clone()
            .or_else(|| self.email.clone())
            .unwrap_or_else(|| "Guest".to_string())
    }
}

pub fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase()
}

// ─── Connection ───────────────────────────────────────────────────────────────

pub struct Connection {
    pub id: ConnId,
    tx: OutboundTx,
    pub identity: Option<Identity>,
    pub room: Option<String>,
    pub spectator: bool,
    pub limiter: TokenBucket,
    pub alive: bool,
    pub connected_at: Instant,
    pub last_seen: Instant,
}

impl Connection {
    /// Queue a message. A closed queue means the socket task is gone; the
    /// liveness sweeper cleans that up, so failures are only reported.
    pub fn send(&self, msg: ServerMessage) -> bool {
        self.tx.send(Outbound::Message(msg)).is_ok()
    }

    pub fn ping(&self) -> bool {
        self.tx.send(Outbound::Ping).is_ok()
    }

    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }

    pub fn username(&self) -> Option<String> {
        self.identity.as_ref().and_then(|i| i.username.clone())
    }

    pub fn is_admin(&self) -> bool {
        self.identity.as_ref().is_some_and(|i| i.admin)
    }
}

// ─── Registry ─────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct SessionRegistry {
    conns: HashMap<ConnId, Connection>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: ConnId, tx: OutboundTx, limiter: TokenBucket) {
        let now = Instant::now();
        self.conns.insert(
            id,
            Connection {
                id,
                tx,
                identity: None,
                room: None,
                spectator: false,
                limiter,
                alive: true,
                connected_at: now,
                last_seen: now,
            },
        );
    }

    /// Bind (or re-bind) an identity to a connection. Returns the previous
    /// identity, if any. Unknown connections are ignored.
    pub fn set_identity(&mut self, id: ConnId, identity: Identity) -> Option<Identity> {
        let conn = self.conns.get_mut(&id)?;
        conn.last_seen = Instant::now();
        conn.identity.replace(identity)
    }

    /// Resolve a username or email to the most recently connected live
    /// connection announcing it.
    pub fn lookup_by_username_or_email(&self, key: &str) -> Option<ConnId> {
        self.conns
            .values()
            .filter(|c| c.identity.as_ref().is_some_and(|i| i.matches(key)))
            .max_by_key(|c| c.connected_at)
            .map(|c| c.id)
    }

    pub fn unregister(&mut self, id: ConnId) -> Option<Connection> {
        self.conns.remove(&id)
    }

    pub fn contains(&self, id: ConnId) -> bool {
        self.conns.contains_key(&id)
    }

    pub fn get(&self, id: ConnId) -> Option<&Connection> {
        self.conns.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.conns.get_mut(&id)
    }

    pub fn identity(&self, id: ConnId) -> Option<&Identity> {
        self.conns.get(&id).and_then(|c| c.identity.as_ref())
    }

    pub fn send(&self, id: ConnId, msg: ServerMessage) -> bool {
        self.conns.get(&id).is_some_and(|c| c.send(msg))
    }

    pub fn send_all(&self, msg: &ServerMessage) {
        for conn in self.conns.values() {
            conn.send(msg.clone());
        }
    }

    pub fn ids(&self) -> Vec<ConnId> {
        self.conns.keys().copied().collect()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.conns.values_mut()
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
