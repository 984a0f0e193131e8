//! The persistent bidirectional channel: handshake authentication, the
//! per-connection reader/writer tasks, and message relay.
//!
//! Relay order is persist-then-push. The row is durable before any push
//! is attempted, and a push to a just-vanished connection is dropped
//! without retry; reconnecting clients pull what they missed over HTTP.

pub mod protocol;
pub mod registry;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use quietwire_core::authz::{authorize, Permission};
use quietwire_core::event::SecurityEvent;
use quietwire_core::model::{conversation_id, StoredMessage, UserStatus};
use quietwire_core::token::Claims;
use quietwire_core::Error as CoreError;
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::bearer_token;
use crate::error::ApiError;
use crate::state::AppState;
use protocol::{ClientEvent, ServerEvent};

#[derive(Deserialize)]
pub struct ChannelQuery {
    /// Browser WebSocket clients cannot set headers, so the token may
    /// ride in the query string instead.
    pub token: Option<String>,
}

/// Upgrade endpoint. The bearer token is checked before the upgrade
/// completes; a bad handshake never yields a half-open session.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ChannelQuery>,
) -> Response {
    match handshake_claims(&state, &headers, &query) {
        Ok(claims) => {
            let user_id = claims.sub;
            let role = claims.role.clone();
            ws.on_upgrade(move |socket| handle_connection(socket, state, user_id, role))
        }
        Err(rejection) => {
            state.audit.record(&SecurityEvent::ConnectionRejected, None, None);
            rejection.into_response()
        }
    }
}

fn handshake_claims(
    state: &AppState,
    headers: &HeaderMap,
    query: &ChannelQuery,
) -> Result<Claims, ApiError> {
    let token = query
        .token
        .clone()
        .or_else(|| bearer_token(headers))
        .ok_or(CoreError::ConnectionUnauthenticated)?;
    state
        .validate_access(&token)
        .map_err(|_| ApiError::from(CoreError::ConnectionUnauthenticated))
}

async fn handle_connection(socket: WebSocket, state: AppState, user_id: Uuid, role: String) {
    info!(user = %user_id, "Channel connected");
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (connection_id, mut outbox) = state.registry.register(user_id);
    push_presence(&state);

    let writer = async move {
        while let Some(event) = outbox.recv().await {
            let frame = match serde_json::to_string(&event) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Event serialization failed: {}", e);
                    continue;
                }
            };
            if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    };

    let reader = {
        let state = state.clone();
        async move {
            while let Some(frame) = ws_rx.next().await {
                let Ok(message) = frame else { break };
                match message {
                    Message::Text(text) => match serde_json::from_str::<ClientEvent>(&text) {
                        Ok(event) => handle_client_event(&state, user_id, &role, event),
                        Err(e) => {
                            debug!(user = %user_id, "Dropping malformed frame: {}", e);
                            state.registry.send_to(
                                user_id,
                                ServerEvent::Error {
                                    message: "Malformed event".to_string(),
                                },
                            );
                        }
                    },
                    Message::Close(_) => break,
                    // Ping/pong is answered by the library.
                    _ => {}
                }
            }
        }
    };

    // Either side ending (socket gone, or displacement dropping the
    // outbox sender) tears the whole connection down.
    tokio::select! {
        _ = writer => {}
        _ = reader => {}
    }

    if state.registry.unregister(user_id, connection_id) {
        push_presence(&state);
    }
    info!(user = %user_id, "Channel closed");
}

fn push_presence(state: &AppState) {
    let online = state.registry.online_users();
    state.registry.broadcast(&ServerEvent::Presence { online });
}

fn handle_client_event(state: &AppState, user_id: Uuid, role: &str, event: ClientEvent) {
    match event {
        ClientEvent::DirectMessage { to, payload } => {
            if let Err(e) = route_direct(state, user_id, to, payload) {
                debug!(user = %user_id, "Direct message not relayed: {}", e);
                state.registry.send_to(
                    user_id,
                    ServerEvent::Error {
                        message: client_facing(&e),
                    },
                );
            }
        }
        ClientEvent::Broadcast { payload } => {
            if let Err(e) = send_broadcast(state, user_id, role, payload) {
                debug!(user = %user_id, "Broadcast refused: {}", e);
                state.registry.send_to(
                    user_id,
                    ServerEvent::Error {
                        message: client_facing(&e),
                    },
                );
            }
        }
        ClientEvent::Typing { to, is_typing } => {
            // Transient by design: no row, no retry, dropped when the
            // peer is offline.
            state
                .registry
                .send_to(to, ServerEvent::Typing { from: user_id, is_typing });
        }
        ClientEvent::Delivered { message_id } => {
            if let Err(e) = apply_delivered(state, user_id, message_id) {
                debug!(user = %user_id, "Delivery ack dropped: {}", e);
            }
        }
        ClientEvent::Read { message_id } => {
            if let Err(e) = apply_read(state, user_id, message_id) {
                debug!(user = %user_id, "Read ack dropped: {}", e);
            }
        }
    }
}

/// What a channel error event may carry; server faults stay masked.
fn client_facing(error: &ApiError) -> String {
    match error {
        ApiError::Database(_) | ApiError::Internal(_) => "Message relay failed".to_string(),
        other => other.to_string(),
    }
}

/// Persist a direct message, confirm to the sender, push to the
/// recipient if connected.
pub fn route_direct(
    state: &AppState,
    sender_id: Uuid,
    recipient_id: Uuid,
    payload: String,
) -> Result<StoredMessage, ApiError> {
    let recipient = state
        .store
        .user_by_id(recipient_id)?
        .filter(|user| user.status == UserStatus::Active)
        .ok_or_else(|| ApiError::NotFound("Recipient not found".to_string()))?;

    let message = StoredMessage {
        id: Uuid::new_v4(),
        sender_id,
        recipient_id: Some(recipient.id),
        conversation_id: Some(conversation_id(sender_id, recipient.id)),
        payload,
        is_broadcast: false,
        created_at: Utc::now().timestamp_millis(),
        delivered_at: None,
        read_at: None,
    };
    state.store.insert_message(&message)?;

    state.registry.send_to(
        sender_id,
        ServerEvent::MessageSent {
            message_id: message.id,
            conversation_id: message.conversation_id.clone(),
            created_at: message.created_at,
        },
    );
    state.registry.send_to(
        recipient.id,
        ServerEvent::Message {
            message: message.clone(),
        },
    );
    Ok(message)
}

/// Persist a broadcast and push it to every live connection. Gated on
/// the broadcast permission atom of the caller's current role.
pub fn send_broadcast(
    state: &AppState,
    sender_id: Uuid,
    role_name: &str,
    payload: String,
) -> Result<StoredMessage, ApiError> {
    let role = state.store.role(role_name)?.ok_or(CoreError::Forbidden)?;
    authorize(&role, Permission::Broadcast)?;

    let message = StoredMessage {
        id: Uuid::new_v4(),
        sender_id,
        recipient_id: None,
        conversation_id: None,
        payload,
        is_broadcast: true,
        created_at: Utc::now().timestamp_millis(),
        delivered_at: None,
        read_at: None,
    };
    state.store.insert_message(&message)?;
    state.audit.record(
        &SecurityEvent::BroadcastSent { message_id: message.id },
        Some(sender_id),
        None,
    );

    let reached = state.registry.broadcast(&ServerEvent::Message {
        message: message.clone(),
    });
    debug!(message = %message.id, reached, "Broadcast relayed");
    Ok(message)
}

/// First delivery ack stamps the row and notifies the sender; repeats
/// and acks from anyone but the recipient change nothing.
pub fn apply_delivered(
    state: &AppState,
    acker_id: Uuid,
    message_id: Uuid,
) -> Result<(), ApiError> {
    let Some(message) = state.store.message_by_id(message_id)? else {
        return Ok(());
    };
    if message.is_broadcast || message.recipient_id != Some(acker_id) {
        return Ok(());
    }

    let (delivered_at, newly) = state
        .store
        .mark_delivered(message_id, Utc::now().timestamp_millis())?;
    if newly {
        if let Some(delivered_at) = delivered_at {
            state.registry.send_to(
                message.sender_id,
                ServerEvent::Delivered {
                    message_id,
                    delivered_at,
                },
            );
        }
    }
    Ok(())
}

/// Read acks: first one stamps a direct message and notifies the
/// sender; broadcast reads accumulate per reader.
pub fn apply_read(state: &AppState, reader_id: Uuid, message_id: Uuid) -> Result<(), ApiError> {
    let Some(message) = state.store.message_by_id(message_id)? else {
        return Ok(());
    };

    if message.is_broadcast {
        state
            .store
            .mark_read_broadcast(message_id, reader_id, Utc::now().timestamp_millis())?;
        return Ok(());
    }

    if message.recipient_id != Some(reader_id) {
        return Ok(());
    }
    let (read_at, newly) = state
        .store
        .mark_read_direct(message_id, Utc::now().timestamp_millis())?;
    if newly {
        if let Some(read_at) = read_at {
            state.registry.send_to(
                message.sender_id,
                ServerEvent::Read {
                    message_id,
                    reader_id,
                    read_at,
                },
            );
        }
    }
    Ok(())
}
