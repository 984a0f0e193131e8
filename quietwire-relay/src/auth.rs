//! Bearer authentication middleware and CSRF double-submit enforcement.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, Request};
use axum::middleware::Next;
use axum::response::Response;
use axum_extra::extract::cookie::CookieJar;
use quietwire_core::token::Claims;
use quietwire_core::Error as CoreError;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

/// Refresh cookie: HTTP-only, so script injection cannot exfiltrate it.
pub const REFRESH_COOKIE: &str = "qw_refresh";
/// CSRF cookie paired with the `x-csrf-token` header on mutating verbs.
pub const CSRF_COOKIE: &str = "qw_csrf";
pub const CSRF_HEADER: &str = "x-csrf-token";

/// Authenticated request context injected by the middleware.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: Uuid,
    pub claims: Claims,
}

/// Protected-route gate: an access-scoped, unrevoked, unexpired bearer
/// token, or a 401/403 before any handler runs.
pub async fn require_access(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(request.headers()).ok_or(CoreError::InvalidToken)?;
    let claims = state.validate_access(&token)?;

    // Best effort: bump the session's activity stamp.
    if let Some(session_id) = claims.sid {
        if let Err(e) = state.store.touch_session(session_id) {
            tracing::debug!("Session activity update skipped: {}", e);
        }
    }

    request.extensions_mut().insert(AuthContext {
        user_id: claims.sub,
        claims,
    });
    Ok(next.run(request).await)
}

pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|token| token.trim().to_string())
}

/// Double-submit check on mutating verbs: the `x-csrf-token` header must
/// equal the CSRF cookie. Reads pass untouched.
pub async fn require_csrf(request: Request<Body>, next: Next) -> Result<Response, ApiError> {
    let mutating = matches!(
        *request.method(),
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    );
    if mutating {
        let jar = CookieJar::from_headers(request.headers());
        let cookie = jar.get(CSRF_COOKIE).map(|c| c.value().to_string());
        let header = request
            .headers()
            .get(CSRF_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        match (cookie, header) {
            (Some(cookie), Some(header)) if !cookie.is_empty() && cookie == header => {}
            _ => return Err(ApiError::Csrf),
        }
    }
    Ok(next.run(request).await)
}

/// Client address for fingerprints and audit entries. Proxy headers
/// win; the relay is expected to sit behind one.
pub fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn user_agent(headers: &HeaderMap) -> String {
    headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string()
}
