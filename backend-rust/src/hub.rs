//! # hub
//!
//! Entry point for everything that mutates shared state: inbound frames from
//! socket tasks, timer callbacks and the liveness sweep. Each entry point
//! takes the state lock once and runs a synchronous transition under it, so
//! a countdown firing can never interleave with a half-applied
//! `prestart-choice`.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::AuthEngine;
use crate::autocommit::AutocommitValidator;
use crate::config::ServerConfig;
use crate::handlers;
use crate::lobby::PendingMatch;
use crate::matches;
use crate::persistence::{StoreEvent, StoreHandle};
use crate::protocol::{parse_client, ParseFailure, ServerMessage};
use crate::rate_limit::TokenBucket;
use crate::sessions::{ConnId, OutboundRx};
use crate::state::{HubState, SharedState};

#[derive(Clone)]
pub struct Hub {
    pub(crate) state: SharedState,
    pub(crate) config: Arc<ServerConfig>,
    pub(crate) auth: Arc<AuthEngine>,
    pub(crate) validator: AutocommitValidator,
    pub(crate) store: StoreHandle,
}

impl Hub {
    pub fn new(config: ServerConfig, store: StoreHandle) -> Self {
        let auth = AuthEngine::new(&config);
        let validator = AutocommitValidator::new(
            config.autocommit_radius_tolerance_mm,
            config.autocommit_dedup(),
        );
        Self {
            state: HubState::shared(),
            config: Arc::new(config),
            auth: Arc::new(auth),
            validator,
            store,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    // ── Connection Lifecycle ─────────────────────────────────────────────────

    /// Registers a new connection and returns its id plus the queue the
    /// socket task drains.
    pub async fn connect(&self) -> (ConnId, OutboundRx) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        let limiter = TokenBucket::new(self.config.rate_limit_burst, self.config.rate_limit_per_sec);

        let mut st = self.state.write().await;
        st.sessions.register(id, tx, limiter);
        info!("Client connected: {id} ({} live)", st.sessions.len());
        (id, rx)
    }

    /// Handles one inbound text frame. Oversized, rate-limited and malformed
    /// frames are dropped without a reply; a known type with bad fields gets
    /// `BAD_REQUEST`.
    pub async fn handle_text(&self, conn: ConnId, text: &str) {
        if text.len() > self.config.max_payload_bytes {
            warn!("Dropping {} byte frame from {conn}", text.len());
            return;
        }

        let mut st = self.state.write().await;
        let Some(c) = st.sessions.get_mut(conn) else {
            return;
        };
        c.alive = true;
        c.last_seen = Instant::now();
        if !c.limiter.allow() {
            debug!("Rate limited {conn}");
            return;
        }

        let msg = match parse_client(text) {
            Ok(m) => m,
            Err(ParseFailure::Ignored(reason)) => {
                warn!("Ignoring malformed message from {conn}: {reason}");
                return;
            }
            Err(ParseFailure::Invalid(e)) => {
                debug!("Rejected message from {conn}: {e}");
                st.sessions.send(conn, ServerMessage::from(&e));
                return;
            }
        };

        if let Err(e) = handlers::dispatch(self, &mut st, conn, msg) {
            debug!("Rejected message from {conn}: {e}");
            st.sessions.send(conn, ServerMessage::from(&e));
        }
    }

    pub async fn mark_alive(&self, conn: ConnId) {
        let mut st = self.state.write().await;
        if let Some(c) = st.sessions.get_mut(conn) {
            c.alive = true;
            c.last_seen = Instant::now();
        }
    }

    /// Idempotent: the socket task and the sweeper may both call this.
    pub async fn disconnect(&self, conn: ConnId) {
        let mut st = self.state.write().await;
        cleanup_connection(self, &mut st, conn);
    }

    // ── Timers ───────────────────────────────────────────────────────────────

    pub(crate) async fn on_invite_expired(&self, match_id: String, nonce: Uuid) {
        let mut st = self.state.write().await;
        matches::expire_invite(self, &mut st, &match_id, nonce);
    }

    pub(crate) async fn on_grace_elapsed(&self, match_id: String, nonce: Uuid) {
        let mut st = self.state.write().await;
        matches::purge_after_grace(self, &mut st, &match_id, nonce);
    }

    pub(crate) async fn on_prestart_timeout(&self, room_id: String, nonce: Uuid) {
        let mut st = self.state.write().await;
        matches::prestart_timeout(&mut st, &room_id, nonce);
    }

    // ── Liveness ─────────────────────────────────────────────────────────────

    /// One liveness pass: terminate connections that stayed silent since the
    /// previous pass, ping the rest, and expire pairing codes, invites and
    /// reconnect graces that are past due.
    pub async fn sweep(&self) {
        let mut st = self.state.write().await;
        let now = Instant::now();

        let mut dead = Vec::new();
        for c in st.sessions.iter_mut() {
            if !c.alive || !c.ping() {
                dead.push(c.id);
            } else {
                c.alive = false;
            }
        }
        for id in dead {
            info!("Terminating unresponsive connection {id}");
            if let Some(c) = st.sessions.get(id) {
                c.close();
            }
            cleanup_connection(self, &mut st, id);
        }

        for code in st.pairing.expire(now, self.config.pairing_code_ttl()) {
            debug!("Pairing code {} expired", code.code);
        }
        for (id, nonce) in st.lobby.due_invites(now) {
            matches::expire_invite(self, &mut st, &id, nonce);
        }
        for (id, nonce) in st.lobby.due_graces(now) {
            matches::purge_after_grace(self, &mut st, &id, nonce);
        }
    }

    // ── Inspection ───────────────────────────────────────────────────────────

    pub async fn lobby_snapshot(&self) -> Vec<PendingMatch> {
        self.state.read().await.lobby.snapshot()
    }

    pub async fn has_prestart(&self, room_id: &str) -> bool {
        self.state.read().await.prestart.contains_key(room_id)
    }

    pub async fn room_members(&self, room_id: &str) -> Vec<ConnId> {
        self.state
            .read()
            .await
            .rooms
            .get(room_id)
            .map(|r| r.members().to_vec())
            .unwrap_or_default()
    }

    pub async fn room_autocommit(&self, room_id: &str) -> Option<bool> {
        self.state.read().await.rooms.get(room_id).map(|r| r.autocommit_allowed)
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.sessions.len()
    }
}

/// Tears down everything a connection owns. A connection that is already
/// gone is ignored.
fn cleanup_connection(hub: &Hub, st: &mut HubState, conn: ConnId) {
    if !st.sessions.contains(conn) {
        return;
    }
    let identity = st.sessions.identity(conn).cloned();

    matches::on_disconnect(hub, st, conn);
    handlers::leave_room(st, conn);
    st.pairing.remove_for(conn);
    st.sessions.unregister(conn);

    if let Some(identity) = identity {
        if let Some(key) = identity.key() {
            if st.sessions.lookup_by_username_or_email(&key).is_none() {
                hub.store.publish(StoreEvent::Offline { key });
            }
        }
        st.sessions.send_all(&ServerMessage::Presence {
            id: conn,
            username: identity.username,
            email: None,
            admin: identity.admin,
            online: false,
        });
    }
    info!("Client disconnected: {conn} ({} live)", st.sessions.len());
}
