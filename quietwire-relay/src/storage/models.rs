//! Store row types that exist only on the relay side.

use serde::Serialize;
use uuid::Uuid;

/// One audit trail entry as persisted.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRow {
    pub id: i64,
    pub created_at: i64,
    pub event: String,
    pub severity: u8,
    pub actor_id: Option<Uuid>,
    pub ip: Option<String>,
    /// Event payload as recorded, JSON.
    pub detail: String,
}

/// A page of conversation history plus whether older rows remain.
#[derive(Debug, Clone, Serialize)]
pub struct MessagePage {
    pub messages: Vec<quietwire_core::model::StoredMessage>,
    pub has_more: bool,
}
