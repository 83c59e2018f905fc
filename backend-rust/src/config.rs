use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

// ── Server Config ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Inbound frames larger than this are dropped unread.
    pub max_payload_bytes: usize,
    pub rate_limit_burst: u32,
    pub rate_limit_per_sec: f64,
    pub prestart_seconds: u64,
    pub invite_expiry_secs: u64,
    pub reconnect_grace_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub pairing_code_ttl_secs: u64,
    /// How far past the outer double wire a board point may land before
    /// an autocommit claim is treated as spoofed.
    pub autocommit_radius_tolerance_mm: f64,
    pub autocommit_dedup_ms: u64,
    pub premium_games: Vec<String>,
    pub premium_users: Vec<String>,
    pub admin_users: Vec<String>,
    pub jwt_secret: Option<String>,
    pub redis_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3001".to_string(),
            max_payload_bytes: 128 * 1024,
            rate_limit_burst: 20,
            rate_limit_per_sec: 10.0,
            prestart_seconds: 20,
            invite_expiry_secs: 60,
            reconnect_grace_secs: 120,
            heartbeat_interval_secs: 30,
            pairing_code_ttl_secs: 120,
            autocommit_radius_tolerance_mm: 5.0,
            autocommit_dedup_ms: 1500,
            premium_games: ["Cricket", "Killer", "Shanghai", "Halve It"]
                .into_iter()
                .map(String::from)
                .collect(),
            premium_users: Vec::new(),
            admin_users: Vec::new(),
            jwt_secret: None,
            redis_url: None,
        }
    }
}

impl ServerConfig {
    /// Defaults, overlaid by the TOML file at `path` when given, then by the
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("reading config file {}", p.display()))?;
                let cfg = Self::from_toml(&raw)
                    .with_context(|| format!("parsing config file {}", p.display()))?;
                info!("Loaded config from {}", p.display());
                cfg
            }
            None => Self::default(),
        };
        cfg.apply_env(|k| std::env::var(k).ok());
        Ok(cfg)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// `PORT`, `DARTS_JWT_SECRET` and `REDIS_URL` win over file values.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(port) = var("PORT").and_then(|p| p.parse::<u16>().ok()) {
            self.set_port(port);
        }
        if let Some(secret) = var("DARTS_JWT_SECRET").filter(|s| !s.is_empty()) {
            self.jwt_secret = Some(secret);
        }
        if let Some(url) = var("REDIS_URL").filter(|s| !s.is_empty()) {
            self.redis_url = Some(url);
        }
    }

    pub fn set_port(&mut self, port: u16) {
        let host = self
            .bind_addr
            .rsplit_once(':')
            .map(|(h, _)| h.to_string())
            .unwrap_or_else(|| "0.0.0.0".to_string());
        self.bind_addr = format!("{host}:{port}");
    }

    pub fn prestart(&self) -> Duration {
        Duration::from_secs(self.prestart_seconds)
    }

    pub fn invite_expiry(&self) -> Duration {
        Duration::from_secs(self.invite_expiry_secs)
    }

    pub fn reconnect_grace(&self) -> Duration {
        Duration::from_secs(self.reconnect_grace_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn pairing_code_ttl(&self) -> Duration {
        Duration::from_secs(self.pairing_code_ttl_secs)
    }

    pub fn autocommit_dedup(&self) -> Duration {
        Duration::from_millis(self.autocommit_dedup_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_protocol_constants() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.max_payload_bytes, 131_072);
        assert_eq!(cfg.prestart(), Duration::from_secs(20));
        assert_eq!(cfg.invite_expiry(), Duration::from_secs(60));
        assert_eq!(cfg.reconnect_grace(), Duration::from_secs(120));
        assert!(cfg.premium_games.iter().any(|g| g == "Cricket"));
    }

    #[test]
    fn toml_overrides_only_named_fields() {
        let cfg = ServerConfig::from_toml(
            r#"
            prestart_seconds = 5
            admin_users = ["alice"]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.prestart_seconds, 5);
        assert_eq!(cfg.admin_users, vec!["alice".to_string()]);
        assert_eq!(cfg.invite_expiry_secs, 60);
        assert!(ServerConfig::from_toml("prestart_seconds = \"soon\"").is_err());
    }

    #[test]
    fn env_wins_over_file() {
        let env: HashMap<&str, &str> = [
            ("PORT", "4100"),
            ("DARTS_JWT_SECRET", "s3cret"),
            ("REDIS_URL", ""),
        ]
        .into_iter()
        .collect();
        let mut cfg = ServerConfig {
            bind_addr: "127.0.0.1:3001".into(),
            ..ServerConfig::default()
        };
        cfg.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.bind_addr, "127.0.0.1:4100");
        assert_eq!(cfg.jwt_secret.as_deref(), Some("s3cret"));
        assert_eq!(cfg.redis_url, None);
    }
}
