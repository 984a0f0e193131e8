//! Channel event types, JSON-framed with a `type` tag.

use quietwire_core::model::StoredMessage;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Client-to-relay events.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// An opaque ciphertext for one recipient.
    DirectMessage { to: Uuid, payload: String },
    /// Platform-wide announcement; permission-gated.
    Broadcast { payload: String },
    /// Transient indicator, forwarded only while the peer is online.
    Typing { to: Uuid, is_typing: bool },
    Delivered { message_id: Uuid },
    Read { message_id: Uuid },
}

/// Relay-to-client events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// A direct message or broadcast addressed to this connection.
    Message { message: StoredMessage },
    /// Persistence confirmation echoed to the sender.
    MessageSent {
        message_id: Uuid,
        conversation_id: Option<String>,
        created_at: i64,
    },
    /// Full snapshot of who is online right now.
    Presence { online: Vec<Uuid> },
    Typing { from: Uuid, is_typing: bool },
    Delivered { message_id: Uuid, delivered_at: i64 },
    Read {
        message_id: Uuid,
        reader_id: Uuid,
        read_at: i64,
    },
    Error { message: String },
}
