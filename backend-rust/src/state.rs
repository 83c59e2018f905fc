use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::lobby::Lobby;
use crate::pairing::PairingCodes;
use crate::prestart::PrestartSession;
use crate::rooms::RoomManager;
use crate::sessions::SessionRegistry;

pub type SharedState = Arc<RwLock<HubState>>;

// ─── Hub State ───────────────────────────────────────────────────────────────

/// Everything mutated by client messages and timers. Held behind one lock so
/// a transition touching sessions, rooms and the lobby is never observed
/// half-applied.
#[derive(Default)]
pub struct HubState {
    pub sessions: SessionRegistry,
    pub rooms: RoomManager,
    pub lobby: Lobby,
    /// Keyed by room id; at most one per room.
    pub prestart: HashMap<String, PrestartSession>,
    pub pairing: PairingCodes,
}

impl HubState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }
}
