//! Session visibility and termination for the signed-in account.
//!
//! The current session is whichever one the presented access token was
//! minted for; it can be ended only through logout.

use axum::extract::{Extension, Path, State};
use axum::http::HeaderMap;
use axum::Json;
use quietwire_core::event::SecurityEvent;
use quietwire_core::Error as CoreError;
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth::{client_ip, AuthContext};
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct SessionView {
    pub id: Uuid,
    pub device: String,
    pub ip: String,
    pub location: String,
    pub created_at: i64,
    pub last_activity: i64,
    pub is_current: bool,
}

/// GET /api/v1/sessions
pub async fn list(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<Vec<SessionView>>, ApiError> {
    let sessions = state.store.sessions_for_user(ctx.user_id)?;
    let views = sessions
        .into_iter()
        .map(|session| SessionView {
            is_current: ctx.claims.sid == Some(session.id),
            id: session.id,
            device: session.device,
            ip: session.ip,
            location: session.location,
            created_at: session.created_at,
            last_activity: session.last_activity,
        })
        .collect();
    Ok(Json(views))
}

/// POST /api/v1/sessions/{id}/terminate
///
/// Someone else's session id is indistinguishable from an unknown one.
pub async fn terminate(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    headers: HeaderMap,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let session = state
        .store
        .session_by_id(session_id)?
        .filter(|s| s.user_id == ctx.user_id && s.active)
        .ok_or_else(|| ApiError::NotFound("Session not found".to_string()))?;

    if ctx.claims.sid == Some(session.id) {
        return Err(CoreError::CannotTerminateCurrentSession.into());
    }

    state.store.terminate_session(session.id)?;
    let stored = state
        .store
        .user_by_id(ctx.user_id)?
        .and_then(|u| u.refresh_token);
    if stored.as_deref() == Some(session.refresh_token.as_str()) {
        state.store.set_refresh_token(ctx.user_id, None)?;
    }
    state.audit.record(
        &SecurityEvent::SessionTerminated { session_id: session.id },
        Some(ctx.user_id),
        Some(&client_ip(&headers)),
    );
    Ok(Json(json!({ "terminated": true })))
}

/// POST /api/v1/sessions/terminate-others
pub async fn terminate_others(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let current_id = ctx.claims.sid.ok_or(CoreError::InvalidToken)?;
    let current = state
        .store
        .session_by_id(current_id)?
        .ok_or_else(|| ApiError::NotFound("Session not found".to_string()))?;

    // Snapshot before the sweep so the stored refresh pointer can be
    // cleared if it belonged to a victim.
    let victims: Vec<String> = state
        .store
        .sessions_for_user(ctx.user_id)?
        .into_iter()
        .filter(|s| s.id != current_id)
        .map(|s| s.refresh_token)
        .collect();

    let count = state
        .store
        .terminate_other_sessions(ctx.user_id, &current.refresh_token)?;

    let stored = state
        .store
        .user_by_id(ctx.user_id)?
        .and_then(|u| u.refresh_token);
    if let Some(stored) = stored {
        if victims.iter().any(|victim| victim == &stored) {
            state.store.set_refresh_token(ctx.user_id, None)?;
        }
    }

    state.audit.record(
        &SecurityEvent::SessionsTerminatedBulk { count },
        Some(ctx.user_id),
        Some(&client_ip(&headers)),
    );
    Ok(Json(json!({ "terminated": count })))
}
