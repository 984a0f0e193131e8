//! Periodic retention sweep: expired revocation entries, burned or
//! expired reset tokens, and terminated sessions past the retention
//! window.

use chrono::Utc;
use tracing::{debug, error};

use crate::storage::Store;

const MIN_INTERVAL_SECS: u64 = 60;

pub fn spawn_cleanup_task(store: Store, interval_secs: u64, session_retention_days: i64) {
    let period = std::time::Duration::from_secs(interval_secs.max(MIN_INTERVAL_SECS));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The first tick fires immediately; that initial sweep clears
        // anything left over from the previous run.
        loop {
            ticker.tick().await;
            run_cleanup(&store, session_retention_days);
        }
    });
}

fn run_cleanup(store: &Store, session_retention_days: i64) {
    let now = Utc::now().timestamp();
    let session_cutoff = now - session_retention_days * 86_400;

    match store.purge_expired_revocations(now) {
        Ok(removed) if removed > 0 => debug!(removed, "Purged expired revocation entries"),
        Ok(_) => {}
        Err(e) => error!("Revocation purge failed: {}", e),
    }
    match store.purge_reset_tokens(now) {
        Ok(removed) if removed > 0 => debug!(removed, "Purged spent reset tokens"),
        Ok(_) => {}
        Err(e) => error!("Reset token purge failed: {}", e),
    }
    match store.purge_stale_sessions(session_cutoff) {
        Ok(removed) if removed > 0 => debug!(removed, "Purged stale sessions"),
        Ok(_) => {}
        Err(e) => error!("Session purge failed: {}", e),
    }
}
