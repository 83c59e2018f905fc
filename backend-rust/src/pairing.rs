//! # pairing
//!
//! Short-lived codes that pair a desktop connection with a phone acting as
//! its camera. Once paired, `cam-signal` payloads are relayed between the
//! two connections and nobody else.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use crate::error::CoreError;
use crate::sessions::ConnId;

const CODE_LEN: usize = 6;

#[derive(Debug, Clone, PartialEq)]
pub struct PairingCode {
    pub code: String,
    pub desktop: ConnId,
    pub phone: Option<ConnId>,
    pub created_at: Instant,
    pub expires_at_ms: i64,
}

impl PairingCode {
    pub fn involves(&self, conn: ConnId) -> bool {
        self.desktop == conn || self.phone == Some(conn)
    }
}

#[derive(Default)]
pub struct PairingCodes {
    codes: HashMap<String, PairingCode>,
}

impl PairingCodes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a fresh code for `desktop`. Any earlier code it owned is replaced.
    pub fn create(&mut self, desktop: ConnId, now: Instant, expires_at_ms: i64) -> PairingCode {
        self.codes.retain(|_, c| c.desktop != desktop);
        let code = loop {
            let candidate: String = Uuid::new_v4()
                .simple()
                .to_string()
                .chars()
                .take(CODE_LEN)
                .collect::<String>()
                .to_uppercase();
            if !self.codes.contains_key(&candidate) {
                break candidate;
            }
        };
        let entry = PairingCode {
            code: code.clone(),
            desktop,
            phone: None,
            created_at: now,
            expires_at_ms,
        };
        self.codes.insert(code, entry.clone());
        entry
    }

    /// Attach `phone` to a code. Returns the desktop it is now paired with.
    pub fn join(&mut self, code: &str, phone: ConnId) -> Result<ConnId, CoreError> {
        let entry = self
            .codes
            .get_mut(&code.trim().to_uppercase())
            .ok_or_else(|| CoreError::not_found("pairing code"))?;
        if entry.desktop == phone {
            return Err(CoreError::bad_request("cannot pair a connection with itself"));
        }
        match entry.phone {
            Some(existing) if existing != phone => {
                Err(CoreError::forbidden("pairing code already in use"))
            }
            _ => {
                entry.phone = Some(phone);
                Ok(entry.desktop)
            }
        }
    }

    /// The other end of a paired code, if `conn` is one of its ends.
    pub fn peer_of(&self, code: &str, conn: ConnId) -> Result<ConnId, CoreError> {
        let entry = self
            .codes
            .get(&code.trim().to_uppercase())
            .ok_or_else(|| CoreError::not_found("pairing code"))?;
        if !entry.involves(conn) {
            return Err(CoreError::forbidden("not part of this pairing"));
        }
        let peer = if entry.desktop == conn { entry.phone } else { Some(entry.desktop) };
        peer.ok_or_else(|| CoreError::bad_request("pairing code has no phone yet"))
    }

    /// Drops codes no phone has claimed within `ttl`. A paired code lives
    /// until either end disconnects.
    pub fn expire(&mut self, now: Instant, ttl: Duration) -> Vec<PairingCode> {
        let expired: Vec<String> = self
            .codes
            .values()
            .filter(|c| c.phone.is_none() && now.saturating_duration_since(c.created_at) >= ttl)
            .map(|c| c.code.clone())
            .collect();
        expired.iter().filter_map(|k| self.codes.remove(k)).collect()
    }

    pub fn remove_for(&mut self, conn: ConnId) -> Vec<PairingCode> {
        let owned: Vec<String> = self
            .codes
            .values()
            .filter(|c| c.involves(conn))
            .map(|c| c.code.clone())
            .collect();
        owned.iter().filter_map(|k| self.codes.remove(k)).collect()
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}
