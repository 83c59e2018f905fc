//! # persistence
//!
//! Outbound mirror of presence and lobby state for the REST side.
//!
//! Hub handlers publish a [`StoreEvent`] after their in-memory transition
//! has completed; a background worker owns the store connection and
//! applies events in order. Nothing in the protocol waits on the store.

use std::time::Duration;

use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::lobby::PendingMatch;
use crate::sessions::{ConnId, Identity};

const PRESENCE_TTL_SECS: u64 = 3600;
const MATCH_TTL_SECS: u64 = 3600;
const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    Online { identity: Identity, conn: ConnId },
    Offline { key: String },
    MatchUpserted(PendingMatch),
    MatchRemoved(String),
}

// ── Handle ───────────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct StoreHandle {
    tx: Option<mpsc::UnboundedSender<StoreEvent>>,
}

impl StoreHandle {
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// A handle whose events land in the returned receiver.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StoreEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn publish(&self, event: StoreEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                warn!("Store worker is gone; dropping event");
            }
        }
    }
}

/// Spawns the store worker: Redis when `redis_url` is set and parses,
/// otherwise a worker that only logs.
pub fn connect_store(redis_url: Option<&str>) -> StoreHandle {
    let (handle, rx) = StoreHandle::channel();
    match redis_url.map(redis::Client::open) {
        Some(Ok(client)) => {
            info!("Mirroring presence to Redis");
            tokio::spawn(run_redis_worker(client, rx));
        }
        Some(Err(e)) => {
            error!("Invalid REDIS_URL ({e}); presence will only be logged");
            tokio::spawn(run_log_worker(rx));
        }
        None => {
            info!("No REDIS_URL set; presence will only be logged");
            tokio::spawn(run_log_worker(rx));
        }
    }
    handle
}

async fn run_log_worker(mut rx: mpsc::UnboundedReceiver<StoreEvent>) {
    while let Some(event) = rx.recv().await {
        debug!("store event: {event:?}");
    }
}

// ── Redis Worker ─────────────────────────────────────────────────────────────

async fn run_redis_worker(client: redis::Client, mut rx: mpsc::UnboundedReceiver<StoreEvent>) {
    let mut conn: Option<MultiplexedConnection> = None;

    while let Some(event) = rx.recv().await {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match conn.as_mut() {
                Some(c) => apply(c, &event).await,
                None => match client.get_multiplexed_async_connection().await {
                    Ok(mut c) => {
                        let r = apply(&mut c, &event).await;
                        conn = Some(c);
                        r
                    }
                    Err(e) => Err(e),
                },
            };

            match result {
                Ok(()) => break,
                Err(e) if attempt < MAX_ATTEMPTS => {
                    warn!("Store write failed (attempt {attempt}): {e}");
                    conn = None;
                    tokio::time::sleep(Duration::from_millis(200 * 2u64.pow(attempt))).await;
                }
                Err(e) => {
                    error!("Store write dropped after {attempt} attempts: {e}");
                    conn = None;
                    break;
                }
            }
        }
    }
}

async fn apply(conn: &mut MultiplexedConnection, event: &StoreEvent) -> redis::RedisResult<()> {
    match event {
        StoreEvent::Online { identity, conn: id } => {
            let Some(key) = identity.key() else {
                return Ok(());
            };
            let value = json!({
                "id": id,
                "username": identity.username,
                "email": identity.email,
                "online": true,
                "ts": crate::now_ms(),
            });
            conn.set_ex::<_, _, ()>(format!("presence:{key}"), value.to_string(), PRESENCE_TTL_SECS)
                .await
        }
        StoreEvent::Offline { key } => conn.del::<_, ()>(format!("presence:{key}")).await,
        StoreEvent::MatchUpserted(m) => {
            let value = serde_json::to_string(m).unwrap_or_default();
            conn.set_ex::<_, _, ()>(format!("match:{}", m.id), value, MATCH_TTL_SECS)
                .await
        }
        StoreEvent::MatchRemoved(id) => conn.del::<_, ()>(format!("match:{id}")).await,
    }
}
