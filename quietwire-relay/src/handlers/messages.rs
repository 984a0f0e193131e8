//! Message history, receipt acknowledgment over HTTP, unread counters,
//! and the public-key directory.
//!
//! Receipts are idempotent here exactly as they are on the channel; the
//! HTTP surface differs only in that misuse is answered with an error
//! instead of being dropped.

use std::collections::HashMap;

use axum::extract::{Extension, Path, Query, State};
use axum::Json;
use chrono::Utc;
use quietwire_core::e2ee;
use quietwire_core::model::{conversation_id, UserStatus};
use quietwire_core::Error as CoreError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::error::ApiError;
use crate::state::AppState;
use crate::storage::models::MessagePage;
use crate::ws::protocol::ServerEvent;

const DEFAULT_PAGE: i64 = 50;
const MAX_PAGE: i64 = 200;

#[derive(Debug, Deserialize)]
pub struct PageParams {
    /// Exclusive upper bound on `created_at`, from the previous page.
    pub before: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct UnreadCounts {
    /// Unread direct messages keyed by conversation id.
    pub conversations: HashMap<String, i64>,
    pub direct_total: i64,
    pub broadcasts: i64,
}

#[derive(Debug, Deserialize)]
pub struct PublishKeyRequest {
    pub public_key: String,
}

#[derive(Debug, Serialize)]
pub struct UserKeyResponse {
    pub user_id: Uuid,
    pub public_key: String,
}

#[derive(Debug, Serialize)]
pub struct DirectoryEntry {
    pub id: Uuid,
    pub email: String,
    pub role: String,
    pub has_public_key: bool,
}

fn page_limit(params: &PageParams) -> i64 {
    params.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE)
}

/// GET /api/v1/messages/with/{user_id}
pub async fn conversation_history(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(peer_id): Path<Uuid>,
    Query(params): Query<PageParams>,
) -> Result<Json<MessagePage>, ApiError> {
    let conversation = conversation_id(ctx.user_id, peer_id);
    let (messages, has_more) =
        state
            .store
            .conversation_page(&conversation, params.before, page_limit(&params))?;
    Ok(Json(MessagePage { messages, has_more }))
}

/// GET /api/v1/messages/broadcasts
pub async fn broadcast_history(
    State(state): State<AppState>,
    Extension(_ctx): Extension<AuthContext>,
    Query(params): Query<PageParams>,
) -> Result<Json<MessagePage>, ApiError> {
    let (messages, has_more) = state
        .store
        .broadcast_page(params.before, page_limit(&params))?;
    Ok(Json(MessagePage { messages, has_more }))
}

/// POST /api/v1/messages/{id}/delivered
pub async fn mark_delivered(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(message_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let message = state
        .store
        .message_by_id(message_id)?
        .ok_or_else(|| ApiError::NotFound("Message not found".to_string()))?;
    if message.is_broadcast {
        return Err(ApiError::BadRequest(
            "Broadcasts use read receipts only".to_string(),
        ));
    }
    if message.recipient_id != Some(ctx.user_id) {
        return Err(CoreError::Forbidden.into());
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
    Ok(Json(json!({ "delivered_at": delivered_at })))
}

/// POST /api/v1/messages/{id}/read
pub async fn mark_read(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(message_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let message = state
        .store
        .message_by_id(message_id)?
        .ok_or_else(|| ApiError::NotFound("Message not found".to_string()))?;

    if message.is_broadcast {
        let (read_at, _) =
            state
                .store
                .mark_read_broadcast(message_id, ctx.user_id, Utc::now().timestamp_millis())?;
        return Ok(Json(json!({ "read_at": read_at })));
    }

    if message.recipient_id != Some(ctx.user_id) {
        return Err(CoreError::Forbidden.into());
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
                    reader_id: ctx.user_id,
                    read_at,
                },
            );
        }
    }
    Ok(Json(json!({ "read_at": read_at })))
}

/// GET /api/v1/messages/unread
pub async fn unread_counts(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<UnreadCounts>, ApiError> {
    let rows = state.store.unread_direct_counts(ctx.user_id)?;
    let direct_total = rows.iter().map(|(_, count)| count).sum();
    let conversations = rows.into_iter().collect();
    let broadcasts = state.store.unread_broadcast_count(ctx.user_id)?;
    Ok(Json(UnreadCounts {
        conversations,
        direct_total,
        broadcasts,
    }))
}

/// POST /api/v1/users/me/key
///
/// The relay stores whatever valid key the owner publishes; it never
/// generates or sees the private half.
pub async fn publish_key(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<PublishKeyRequest>,
) -> Result<Json<Value>, ApiError> {
    e2ee::public_from_b64(req.public_key.trim())?;
    state.store.set_public_key(ctx.user_id, req.public_key.trim())?;
    Ok(Json(json!({ "published": true })))
}

/// GET /api/v1/users/{id}/key
pub async fn user_key(
    State(state): State<AppState>,
    Extension(_ctx): Extension<AuthContext>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<UserKeyResponse>, ApiError> {
    let user = state
        .store
        .user_by_id(user_id)?
        .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;
    let public_key = user
        .public_key
        .ok_or_else(|| ApiError::NotFound("No published key".to_string()))?;
    Ok(Json(UserKeyResponse { user_id, public_key }))
}

/// GET /api/v1/users
pub async fn directory(
    State(state): State<AppState>,
    Extension(_ctx): Extension<AuthContext>,
) -> Result<Json<Vec<DirectoryEntry>>, ApiError> {
    let entries = state
        .store
        .list_users()?
        .into_iter()
        .filter(|user| user.status == UserStatus::Active)
        .map(|user| DirectoryEntry {
            id: user.id,
            email: user.email,
            role: user.role,
            has_public_key: user.public_key.is_some(),
        })
        .collect();
    Ok(Json(entries))
}
