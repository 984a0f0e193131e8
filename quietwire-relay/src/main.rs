//! Quietwire relay server.
//!
//! Terminates authentication and session management, relays end-to-end
//! encrypted messages between registered users, and keeps the security
//! audit trail. Message payloads are opaque ciphertext; the relay never
//! holds a decryption key.

mod audit;
mod auth;
mod cleanup;
mod config;
mod error;
mod handlers;
mod rate_limit;
mod server;
mod state;
mod storage;
mod ws;

use std::path::PathBuf;

use clap::Parser;
use quietwire_core::model::{User, UserStatus};
use quietwire_core::password;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::state::AppState;
use crate::storage::Store;

#[derive(Parser, Debug)]
#[command(name = "quietwire-relay", about = "Quietwire secure message relay", version)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "quietwire.toml")]
    config: PathBuf,

    /// Override the configured listen address.
    #[arg(long)]
    listen: Option<String>,

    /// Override the configured database path.
    #[arg(long)]
    database: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = if cli.config.exists() {
        RelayConfig::load(&cli.config)?
    } else {
        info!(
            "No configuration at {}; using defaults",
            cli.config.display()
        );
        RelayConfig::default()
    };
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }
    if let Some(database) = cli.database {
        config.database_path = database;
    }

    let store = Store::open(&config.database_path)?;
    if let Some(email) = config.bootstrap_admin_email.clone() {
        bootstrap_admin(&store, &email)?;
    }

    let state = AppState::new(store, config);
    cleanup::spawn_cleanup_task(
        state.store.clone(),
        state.config.cleanup_interval_secs,
        state.config.session_retention_days,
    );

    let app = server::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(&state.config.listen_addr).await?;
    info!("Listening on {}", state.config.listen_addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Seed a pending administrator against an empty user table so the
/// first operator can sign in at all. The temporary password is printed
/// once and replaced on first login.
fn bootstrap_admin(store: &Store, email: &str) -> Result<(), error::ApiError> {
    if store.count_users()? > 0 {
        return Ok(());
    }

    let temp_password = password::generate_temp_password(16);
    let user = User {
        id: Uuid::new_v4(),
        email: email.trim().to_lowercase(),
        password_hash: password::hash_password(&temp_password)?,
        role: "administrator".to_string(),
        status: UserStatus::Pending,
        totp_secret: None,
        totp_pending: None,
        public_key: None,
        last_fingerprint: None,
        refresh_token: None,
        created_at: chrono::Utc::now().timestamp(),
    };
    store.create_user(&user)?;
    warn!(
        "Bootstrap administrator created: email={} temp_password={}",
        user.email, temp_password
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_runs_once_against_an_empty_table() {
        let store = Store::in_memory().unwrap();
        bootstrap_admin(&store, "Admin@Example.com").unwrap();
        bootstrap_admin(&store, "second@example.com").unwrap();

        let users = store.list_users().unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].email, "admin@example.com");
        assert_eq!(users[0].role, "administrator");
        assert_eq!(users[0].status, UserStatus::Pending);
    }
}
