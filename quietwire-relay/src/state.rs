//! Shared application state.

use std::sync::Arc;

use quietwire_core::token::{Claims, TokenScope, TokenService};
use rand::RngCore;

use crate::audit::AuditLog;
use crate::config::RelayConfig;
use crate::error::ApiError;
use crate::rate_limit::RateLimiter;
use crate::storage::Store;
use crate::ws::registry::ConnectionRegistry;

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub tokens: Arc<TokenService>,
    pub registry: Arc<ConnectionRegistry>,
    pub audit: AuditLog,
    pub rate: RateLimiter,
    pub config: Arc<RelayConfig>,
}

impl AppState {
    pub fn new(store: Store, config: RelayConfig) -> Self {
        let secret = match &config.jwt_secret {
            Some(secret) => secret.as_bytes().to_vec(),
            None => {
                tracing::warn!(
                    "No jwt_secret configured; using a random per-boot secret, \
                     outstanding tokens will not survive a restart"
                );
                let mut bytes = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut bytes);
                bytes.to_vec()
            }
        };

        let tokens = TokenService::new(
            &secret,
            config.access_ttl_secs,
            config.scoped_ttl_secs,
            config.refresh_ttl_secs(),
        );
        let audit = AuditLog::open(config.audit_log_path.as_deref(), store.clone());
        let rate = RateLimiter::new(config.login_attempts_per_minute);

        AppState {
            store,
            tokens: Arc::new(tokens),
            registry: Arc::new(ConnectionRegistry::new()),
            audit,
            rate,
            config: Arc::new(config),
        }
    }

    /// Signature, expiry, and revocation checks; no scope pinning.
    pub fn validate_token(&self, token: &str) -> Result<Claims, ApiError> {
        let store = self.store.clone();
        let is_revoked = move |jti: &str| match store.is_token_revoked(jti) {
            Ok(revoked) => revoked,
            Err(e) => {
                // Fail closed: an unreachable store rejects tokens
                // rather than waving them through.
                tracing::error!("Revocation probe failed: {}", e);
                true
            }
        };
        Ok(self.tokens.validate(token, &is_revoked)?)
    }

    /// The check the protected-route middleware and the channel
    /// handshake share.
    pub fn validate_access(&self, token: &str) -> Result<Claims, ApiError> {
        let claims = self.validate_token(token)?;
        claims.require_scope(TokenScope::Access)?;
        Ok(claims)
    }

    /// Validate a stage token against the one scope its endpoint serves.
    pub fn validate_scoped(&self, token: &str, scope: TokenScope) -> Result<Claims, ApiError> {
        let claims = self.validate_token(token)?;
        claims.require_scope(scope)?;
        Ok(claims)
    }
}

#[cfg(test)]
impl AppState {
    /// In-memory fixture: permissive rate gate, no audit file, fixed
    /// signing secret.
    pub fn test_fixture() -> AppState {
        let store = Store::in_memory().unwrap();
        let config = RelayConfig {
            jwt_secret: Some("fixture-signing-secret".to_string()),
            audit_log_path: None,
            login_attempts_per_minute: 1000,
            ..RelayConfig::default()
        };
        AppState::new(store, config)
    }
}
