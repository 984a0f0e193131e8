//! Relay server configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub listen_addr: String,
    pub database_path: PathBuf,
    /// JSON-lines audit sink. Unset disables the file mirror; the audit
    /// table is written regardless.
    pub audit_log_path: Option<PathBuf>,
    /// HS256 signing secret. When unset a random per-boot secret is
    /// generated, which invalidates every outstanding token on restart.
    pub jwt_secret: Option<String>,
    pub access_ttl_secs: i64,
    pub scoped_ttl_secs: i64,
    pub refresh_ttl_days: i64,
    /// TOTP periods of clock skew tolerated either side of now.
    pub totp_skew_steps: u32,
    /// Terminated sessions older than this are purged.
    pub session_retention_days: i64,
    pub cleanup_interval_secs: u64,
    pub max_payload_size: usize,
    pub login_attempts_per_minute: u32,
    /// Seeded as a pending administrator on first boot against an empty
    /// user table.
    pub bootstrap_admin_email: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            listen_addr: "127.0.0.1:8640".to_string(),
            database_path: PathBuf::from("quietwire.db"),
            audit_log_path: Some(PathBuf::from("quietwire-audit.log")),
            jwt_secret: None,
            access_ttl_secs: 15 * 60,
            scoped_ttl_secs: 10 * 60,
            refresh_ttl_days: 30,
            totp_skew_steps: 1,
            session_retention_days: 30,
            cleanup_interval_secs: 3600,
            max_payload_size: 64 * 1024,
            login_attempts_per_minute: 10,
            bootstrap_admin_email: Some("admin@quietwire.local".to_string()),
        }
    }
}

impl RelayConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn refresh_ttl_secs(&self) -> i64 {
        self.refresh_ttl_days * 86_400
    }
}
