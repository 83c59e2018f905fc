//! # auth
//!
//! Turns a `presence` announcement into an [`Identity`].
//!
//! Without a configured secret the announced username/email are taken at
//! face value and admin/premium come from the configured allow-lists. With a
//! secret, a presence `token` is verified as an HS256 JWT and its claims win;
//! unverified announcements then never receive admin or premium rights.

use std::collections::HashSet;

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ServerConfig;
use crate::sessions::{normalize_key, Identity};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceClaims {
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub premium: bool,
    pub exp: u64,
}

pub struct AuthEngine {
    key: Option<DecodingKey>,
    admins: HashSet<String>,
    premium_users: HashSet<String>,
    premium_games: HashSet<String>,
}

impl AuthEngine {
    pub fn new(cfg: &ServerConfig) -> Self {
        Self {
            key: cfg
                .jwt_secret
                .as_deref()
                .map(|s| DecodingKey::from_secret(s.as_bytes())),
            admins: normalized(&cfg.admin_users),
            premium_users: normalized(&cfg.premium_users),
            premium_games: normalized(&cfg.premium_games),
        }
    }

    /// Verifies an HS256 presence token. `None` when no secret is configured
    /// or the token does not validate.
    pub fn verify_token(&self, token: &str) -> Option<PresenceClaims> {
        let key = self.key.as_ref()?;
        let validation = Validation::new(Algorithm::HS256);
        match decode::<PresenceClaims>(token, key, &validation) {
            Ok(data) => Some(data.claims),
            Err(e) => {
                warn!("Presence token rejected: {e}");
                None
            }
        }
    }

    pub fn resolve_identity(
        &self,
        username: Option<String>,
        email: Option<String>,
        token: Option<&str>,
    ) -> Identity {
        let clean = |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());

        if let Some(claims) = token.and_then(|t| self.verify_token(t)) {
            let mut identity = Identity {
                username: clean(claims.username.or(claims.sub)),
                email: clean(claims.email),
                admin: claims.admin,
                premium: claims.premium,
            };
            identity.admin |= self.listed(&self.admins, &identity);
            identity.premium |= self.listed(&self.premium_users, &identity);
            debug!("Verified presence for {}", identity.display_name());
            return identity;
        }

        let mut identity = Identity {
            username: clean(username),
            email: clean(email),
            admin: false,
            premium: false,
        };
        if self.key.is_none() {
            identity.admin = self.listed(&self.admins, &identity);
            identity.premium = self.listed(&self.premium_users, &identity);
        }
        identity
    }

    pub fn is_premium(&self, identity: Option<&Identity>) -> bool {
        identity.is_some_and(|i| i.premium || i.admin)
    }

    pub fn is_premium_game(&self, game: &str) -> bool {
        self.premium_games.contains(&normalize_key(game))
    }

    fn listed(&self, list: &HashSet<String>, identity: &Identity) -> bool {
        [identity.username.as_deref(), identity.email.as_deref()]
            .into_iter()
            .flatten()
            .any(|k| list.contains(&normalize_key(k)))
    }
}

fn normalized(list: &[String]) -> HashSet<String> {
    list.iter().map(|s| normalize_key(s)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token(secret: &str, claims: &PresenceClaims) -> String {
        encode(&Header::default(), claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    fn claims(username: &str, premium: bool) -> PresenceClaims {
        PresenceClaims {
            sub: None,
            username: Some(username.to_string()),
            email: None,
            admin: false,
            premium,
            exp: chrono::Utc::now().timestamp() as u64 + 3600,
        }
    }

    #[test]
    fn allow_lists_apply_without_secret() {
        let cfg = ServerConfig {
            admin_users: vec!["Root".into()],
            premium_users: vec!["pro@example.com".into()],
            ..ServerConfig::default()
        };
        let auth = AuthEngine::new(&cfg);
        let root = auth.resolve_identity(Some("root".into()), None, None);
        assert!(root.admin);
        let pro = auth.resolve_identity(Some("pro".into()), Some("PRO@example.com".into()), None);
        assert!(pro.premium && !pro.admin);
        assert!(auth.is_premium(Some(&pro)));
        assert!(!auth.is_premium(None));
    }

    #[test]
    fn verified_claims_override_announcement() {
        let cfg = ServerConfig {
            jwt_secret: Some("s3cret".into()),
            ..ServerConfig::default()
        };
        let auth = AuthEngine::new(&cfg);
        let t = token("s3cret", &claims("alice", true));
        let id = auth.resolve_identity(Some("mallory".into()), None, Some(&t));
        assert_eq!(id.username.as_deref(), Some("alice"));
        assert!(id.premium);
    }

    #[test]
    fn bad_token_gets_no_privileges() {
        let cfg = ServerConfig {
            jwt_secret: Some("s3cret".into()),
            admin_users: vec!["mallory".into()],
            ..ServerConfig::default()
        };
        let auth = AuthEngine::new(&cfg);
        let forged = token("wrong", &claims("mallory", true));
        let id = auth.resolve_identity(Some("mallory".into()), None, Some(&forged));
        assert_eq!(id.username.as_deref(), Some("mallory"));
        assert!(!id.admin && !id.premium);
    }

    #[test]
    fn premium_games_match_case_insensitively() {
        let auth = AuthEngine::new(&ServerConfig::default());
        assert!(auth.is_premium_game("cricket"));
        assert!(auth.is_premium_game("Halve It"));
        assert!(!auth.is_premium_game("X01"));
    }
}
