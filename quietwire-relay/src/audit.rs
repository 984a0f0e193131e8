//! Security event recording: tracing mirror, JSON-lines file, and an
//! audit table row per event.
//!
//! Recording is best effort by contract. A full disk or a locked table
//! must never fail the request that produced the event.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use quietwire_core::event::SecurityEvent;
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use crate::storage::Store;

#[derive(Clone)]
pub struct AuditLog {
    file: Option<Arc<Mutex<File>>>,
    store: Store,
}

impl AuditLog {
    /// `path = None` disables the file mirror; the table and tracing
    /// sinks stay on.
    pub fn open(path: Option<&Path>, store: Store) -> Self {
        let file = path.and_then(|p| {
            match OpenOptions::new().create(true).append(true).open(p) {
                Ok(file) => Some(Arc::new(Mutex::new(file))),
                Err(e) => {
                    warn!("Audit file {} unavailable: {}", p.display(), e);
                    None
                }
            }
        });
        AuditLog { file, store }
    }

    pub fn record(&self, event: &SecurityEvent, actor: Option<Uuid>, ip: Option<&str>) {
        let at = Utc::now().timestamp();
        let severity = event.severity();
        let detail = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());

        tracing::info!(
            event = event.name(),
            severity,
            actor = actor.map(|a| a.to_string()),
            "security event"
        );

        if let Err(e) = self
            .store
            .append_audit(at, event.name(), severity, actor, ip, &detail)
        {
            warn!("Audit row not persisted: {}", e);
        }

        if let Some(file) = &self.file {
            let line = json!({
                "at": at,
                "severity": severity,
                "actor": actor.map(|a| a.to_string()),
                "ip": ip,
                "event": event,
            });
            if let Ok(mut file) = file.lock() {
                if let Err(e) = writeln!(file, "{}", line) {
                    warn!("Audit file append failed: {}", e);
                }
            }
        }
    }
}
