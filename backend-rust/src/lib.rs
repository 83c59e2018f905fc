//! Real-time match coordination for online darts: presence, rooms, the
//! invite → prestart → bull-up handshake, and server-side validation of
//! camera-scored visits.

pub mod auth;
pub mod autocommit;
pub mod config;
pub mod error;
pub mod handlers;
pub mod hub;
pub mod lobby;
pub mod matches;
pub mod pairing;
pub mod persistence;
pub mod prestart;
pub mod protocol;
pub mod rate_limit;
pub mod rooms;
pub mod sessions;
pub mod state;
pub mod sweeper;
pub mod timer;
pub mod ws;

use std::time::{SystemTime, UNIX_EPOCH};

use axum::routing::get;
use axum::Router;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

pub use config::ServerConfig;
pub use hub::Hub;

// ─── Helper: get unix ms ─────────────────────────────────────────────────────

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

// ─── Time Sync Endpoint ───────────────────────────────────────────────────────

async fn time_sync() -> axum::Json<serde_json::Value> {
    axum::Json(json!({ "serverTime": now_ms() }))
}

async fn health() -> &'static str {
    "ok"
}

pub fn router(hub: Hub) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(health))
        .route("/sync", get(time_sync))
        .layer(cors)
        .with_state(hub)
}
