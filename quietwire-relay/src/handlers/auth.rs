//! Authentication endpoints: the login state machine, token refresh,
//! logout, second-factor enrollment, and the forgot-password side entry.

use axum::extract::{Extension, State};
use axum::http::HeaderMap;
use axum::Json;
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::Utc;
use quietwire_core::event::SecurityEvent;
use quietwire_core::login::{self, reset, IssuedTokens, LoginOutcome};
use quietwire_core::model::{DeviceFingerprint, SessionRecord, User, UserStatus};
use quietwire_core::token::{revocation_entry, TokenScope};
use quietwire_core::{password, totp, Error as CoreError};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error};
use uuid::Uuid;

use crate::auth::{client_ip, user_agent, AuthContext, CSRF_COOKIE, REFRESH_COOKIE};
use crate::error::ApiError;
use crate::state::AppState;

/// Cookie scope for the refresh token: only the auth endpoints ever see
/// it, so a stolen access token cannot be laundered into a new pair.
const REFRESH_COOKIE_PATH: &str = "/api/v1/auth";
const TOTP_ISSUER: &str = "Quietwire";

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// What the client does next. Stage tokens are single-purpose; only the
/// `authenticated` stage carries an access token and sets the refresh
/// cookie.
#[derive(Debug, Serialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum LoginResponse {
    PasswordSetupRequired { token: String },
    TwoFactorRequired { token: String },
    Authenticated { access_token: String },
}

#[derive(Debug, Deserialize)]
pub struct SetInitialPasswordRequest {
    pub token: String,
    pub new_password: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyTwoFactorRequest {
    pub token: String,
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct TwoFactorSetupResponse {
    pub secret: String,
    pub otpauth_uri: String,
}

#[derive(Debug, Deserialize)]
pub struct EnableTwoFactorRequest {
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub access_token: String,
}

#[derive(Debug, Deserialize)]
pub struct ForgotPasswordRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordRequest {
    pub token: String,
    pub new_password: String,
}

#[derive(Debug, Deserialize)]
pub struct PasswordStrengthRequest {
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct CsrfResponse {
    pub token: String,
}

/// POST /api/v1/auth/login
pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    headers: HeaderMap,
    Json(req): Json<LoginRequest>,
) -> Result<(CookieJar, Json<LoginResponse>), ApiError> {
    let ip = client_ip(&headers);
    if !state.rate.check(&format!("login:{ip}")) {
        return Err(ApiError::RateLimited);
    }

    let email = req.email.trim().to_lowercase();
    let user = state.store.user_by_email(&email)?;
    let session_id = Uuid::new_v4();

    match login::evaluate(user.as_ref(), &req.password, session_id, &state.tokens)? {
        LoginOutcome::Rejected => {
            state.audit.record(
                &SecurityEvent::LoginFailed,
                user.as_ref().map(|u| u.id),
                Some(&ip),
            );
            Err(CoreError::InvalidCredentials.into())
        }
        LoginOutcome::NotActive => {
            state.audit.record(
                &SecurityEvent::LoginRejectedInactive,
                user.as_ref().map(|u| u.id),
                Some(&ip),
            );
            Err(CoreError::AccountNotActive("Account is deactivated".to_string()).into())
        }
        LoginOutcome::PendingActivation { token } => {
            Ok((jar, Json(LoginResponse::PasswordSetupRequired { token })))
        }
        LoginOutcome::TwoFactorRequired { token } => {
            Ok((jar, Json(LoginResponse::TwoFactorRequired { token })))
        }
        LoginOutcome::Authenticated(issued) => {
            let Some(user) = user else {
                return Err(CoreError::InvalidCredentials.into());
            };
            let (jar, access_token) =
                establish_session(&state, &user, session_id, issued, &headers, jar)?;
            Ok((jar, Json(LoginResponse::Authenticated { access_token })))
        }
    }
}

/// POST /api/v1/auth/initial-password
///
/// Closes the forced-activation stage. The stage token is burned on
/// success so it cannot mint a second session.
pub async fn set_initial_password(
    State(state): State<AppState>,
    jar: CookieJar,
    headers: HeaderMap,
    Json(req): Json<SetInitialPasswordRequest>,
) -> Result<(CookieJar, Json<LoginResponse>), ApiError> {
    let claims = state.validate_scoped(&req.token, TokenScope::SetInitialPassword)?;
    let user = state
        .store
        .user_by_id(claims.sub)?
        .ok_or(CoreError::InvalidToken)?;

    let session_id = Uuid::new_v4();
    let (hash, issued) =
        login::activate_with_password(&user, &req.new_password, session_id, &state.tokens)?;
    state
        .store
        .update_password(user.id, &hash, UserStatus::Active)?;

    let (jti, expires_at) = revocation_entry(&claims);
    state.store.revoke_token(&jti, expires_at)?;
    state.audit.record(
        &SecurityEvent::PasswordChanged,
        Some(user.id),
        Some(&client_ip(&headers)),
    );

    let (jar, access_token) = establish_session(&state, &user, session_id, issued, &headers, jar)?;
    Ok((jar, Json(LoginResponse::Authenticated { access_token })))
}

/// POST /api/v1/auth/2fa/verify
pub async fn verify_two_factor(
    State(state): State<AppState>,
    jar: CookieJar,
    headers: HeaderMap,
    Json(req): Json<VerifyTwoFactorRequest>,
) -> Result<(CookieJar, Json<LoginResponse>), ApiError> {
    let claims = state.validate_scoped(&req.token, TokenScope::TwoFactor)?;
    let user = state
        .store
        .user_by_id(claims.sub)?
        .ok_or(CoreError::InvalidToken)?;
    let ip = client_ip(&headers);

    let session_id = Uuid::new_v4();
    let issued = match login::complete_two_factor(
        &user,
        &req.code,
        state.config.totp_skew_steps,
        session_id,
        &state.tokens,
    ) {
        Ok(issued) => issued,
        Err(e) => {
            if matches!(e, CoreError::InvalidSecondFactor) {
                state
                    .audit
                    .record(&SecurityEvent::TwoFactorFailed, Some(user.id), Some(&ip));
            }
            return Err(e.into());
        }
    };

    let (jti, expires_at) = revocation_entry(&claims);
    state.store.revoke_token(&jti, expires_at)?;

    let (jar, access_token) = establish_session(&state, &user, session_id, issued, &headers, jar)?;
    Ok((jar, Json(LoginResponse::Authenticated { access_token })))
}

/// POST /api/v1/auth/2fa/setup
///
/// Stages a fresh secret without touching the enrolled one; nothing
/// changes at login until a live code confirms the enrollment.
pub async fn setup_two_factor(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<TwoFactorSetupResponse>, ApiError> {
    let user = state
        .store
        .user_by_id(ctx.user_id)?
        .ok_or(CoreError::InvalidToken)?;

    let secret = totp::generate_secret();
    state.store.set_totp_pending(user.id, &secret)?;
    let otpauth_uri = totp::provisioning_uri(&secret, &user.email, TOTP_ISSUER);
    Ok(Json(TwoFactorSetupResponse { secret, otpauth_uri }))
}

/// POST /api/v1/auth/2fa/enable
pub async fn enable_two_factor(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    headers: HeaderMap,
    Json(req): Json<EnableTwoFactorRequest>,
) -> Result<Json<Value>, ApiError> {
    let user = state
        .store
        .user_by_id(ctx.user_id)?
        .ok_or(CoreError::InvalidToken)?;
    let pending = user
        .totp_pending
        .as_deref()
        .ok_or_else(|| ApiError::BadRequest("No pending second-factor setup".to_string()))?;

    if !totp::verify(
        pending,
        &req.code,
        Utc::now().timestamp(),
        state.config.totp_skew_steps,
    )? {
        state.audit.record(
            &SecurityEvent::TwoFactorFailed,
            Some(user.id),
            Some(&client_ip(&headers)),
        );
        return Err(CoreError::InvalidSecondFactor.into());
    }

    if !state.store.enable_totp(user.id)? {
        return Err(ApiError::BadRequest(
            "No pending second-factor setup".to_string(),
        ));
    }
    state.audit.record(
        &SecurityEvent::TwoFactorEnabled,
        Some(user.id),
        Some(&client_ip(&headers)),
    );
    Ok(Json(json!({ "enabled": true })))
}

/// POST /api/v1/auth/refresh
///
/// Mints a fresh access token off the cookie. Rotation of the refresh
/// token itself happens only at login.
pub async fn refresh(
    State(state): State<AppState>,
    jar: CookieJar,
) -> Result<Json<RefreshResponse>, ApiError> {
    let presented = jar
        .get(REFRESH_COOKIE)
        .map(|c| c.value().to_string())
        .ok_or(CoreError::InvalidToken)?;

    let claims = state.validate_token(&presented)?;
    let user = state
        .store
        .user_by_id(claims.sub)?
        .ok_or(CoreError::InvalidToken)?;
    if user.status != UserStatus::Active {
        return Err(CoreError::AccountNotActive("Account is not active".to_string()).into());
    }

    let access_token =
        state
            .tokens
            .refresh_access(&claims, &presented, user.refresh_token.as_deref(), &user)?;

    if let Some(session_id) = claims.sid {
        if let Err(e) = state.store.touch_session(session_id) {
            debug!("Session touch failed: {}", e);
        }
    }
    Ok(Json(RefreshResponse { access_token }))
}

/// POST /api/v1/auth/logout
///
/// Revokes the presented access token, retires the session behind it,
/// and expires the refresh cookie.
pub async fn logout(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    jar: CookieJar,
    headers: HeaderMap,
) -> Result<(CookieJar, Json<Value>), ApiError> {
    let (jti, expires_at) = revocation_entry(&ctx.claims);
    state.store.revoke_token(&jti, expires_at)?;
    state.audit.record(
        &SecurityEvent::TokenRevoked,
        Some(ctx.user_id),
        Some(&client_ip(&headers)),
    );

    if let Some(session_id) = ctx.claims.sid {
        if let Some(session) = state.store.session_by_id(session_id)? {
            state.store.terminate_session(session_id)?;
            let stored = state
                .store
                .user_by_id(ctx.user_id)?
                .and_then(|u| u.refresh_token);
            if stored.as_deref() == Some(session.refresh_token.as_str()) {
                state.store.set_refresh_token(ctx.user_id, None)?;
            }
        }
    }

    let removal = Cookie::build((REFRESH_COOKIE, ""))
        .path(REFRESH_COOKIE_PATH)
        .build();
    Ok((jar.remove(removal), Json(json!({ "logged_out": true }))))
}

/// POST /api/v1/auth/forgot-password
///
/// The response never varies with account existence, and a storage
/// fault on the issuing path is logged rather than surfaced for the
/// same reason.
pub async fn forgot_password(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ForgotPasswordRequest>,
) -> Result<Json<Value>, ApiError> {
    let ip = client_ip(&headers);
    if !state.rate.check(&format!("reset:{ip}")) {
        return Err(ApiError::RateLimited);
    }

    let email = req.email.trim().to_lowercase();
    match state.store.user_by_email(&email) {
        Ok(Some(user)) if user.status != UserStatus::Deactivated => {
            let token = reset::issue();
            if let Err(e) = state
                .store
                .store_reset_token(&token.digest, user.id, token.expires_at)
            {
                error!("Reset token not stored: {}", e);
            } else {
                state.audit.record(
                    &SecurityEvent::PasswordResetRequested,
                    Some(user.id),
                    Some(&ip),
                );
            }
            // token.raw is handed to the out-of-band delivery channel
            // and dropped here.
        }
        Ok(_) => {}
        Err(e) => error!("Account lookup failed during reset request: {}", e),
    }

    Ok(Json(json!({
        "message": "If an account exists for that address, a reset token has been issued."
    })))
}

/// POST /api/v1/auth/reset-password
pub async fn reset_password(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ResetPasswordRequest>,
) -> Result<Json<Value>, ApiError> {
    password::check_strength(&req.new_password)?;

    let digest = reset::digest(req.token.trim());
    let user_id = state
        .store
        .consume_reset_token(&digest, Utc::now().timestamp())?
        .ok_or(CoreError::InvalidToken)?;

    let hash = password::hash_password(&req.new_password)?;
    state
        .store
        .update_password(user_id, &hash, UserStatus::Active)?;
    state.store.set_refresh_token(user_id, None)?;
    state.store.terminate_sessions_for_user(user_id)?;
    state.audit.record(
        &SecurityEvent::PasswordResetCompleted,
        Some(user_id),
        Some(&client_ip(&headers)),
    );

    Ok(Json(json!({ "message": "Password has been reset." })))
}

/// POST /api/v1/auth/password-strength
///
/// Gauge feed for client-side meters while a password is being chosen.
/// The candidate is scored and forgotten; nothing here persists or logs
/// it.
pub async fn password_strength(
    Json(req): Json<PasswordStrengthRequest>,
) -> Json<password::StrengthReport> {
    Json(password::estimate_strength(&req.password))
}

/// GET /api/v1/csrf
///
/// Double-submit seed: the value rides back as both the cookie and the
/// `x-csrf-token` header on mutating requests.
pub async fn csrf(jar: CookieJar) -> (CookieJar, Json<CsrfResponse>) {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let token = hex::encode(bytes);

    let cookie = Cookie::build((CSRF_COOKIE, token.clone()))
        .path("/")
        .http_only(true)
        .secure(true)
        .same_site(SameSite::Strict)
        .build();
    (jar.add(cookie), Json(CsrfResponse { token }))
}

/// Persist the session row, pin the refresh token, set the cookie, and
/// flag a device change if the fingerprint moved.
fn establish_session(
    state: &AppState,
    user: &User,
    session_id: Uuid,
    issued: IssuedTokens,
    headers: &HeaderMap,
    jar: CookieJar,
) -> Result<(CookieJar, String), ApiError> {
    let ip = client_ip(headers);
    let agent = user_agent(headers);
    let fingerprint = DeviceFingerprint::parse(&ip, &agent);

    if let Some(previous) = &user.last_fingerprint {
        if !previous.matches(&fingerprint) {
            state.audit.record(
                &SecurityEvent::DeviceFingerprintChanged {
                    previous: previous.label(),
                    current: fingerprint.label(),
                },
                Some(user.id),
                Some(&ip),
            );
        }
    }

    let now = Utc::now().timestamp();
    state.store.create_session(&SessionRecord {
        id: session_id,
        user_id: user.id,
        refresh_token: issued.refresh.clone(),
        device: fingerprint.label(),
        ip: ip.clone(),
        location: "unknown".to_string(),
        active: true,
        created_at: now,
        last_activity: now,
    })?;
    state
        .store
        .set_refresh_token(user.id, Some(&issued.refresh))?;
    state.store.set_last_fingerprint(user.id, &ip, &agent)?;
    state
        .audit
        .record(&SecurityEvent::LoginSucceeded, Some(user.id), Some(&ip));

    let cookie = Cookie::build((REFRESH_COOKIE, issued.refresh))
        .path(REFRESH_COOKIE_PATH)
        .http_only(true)
        .secure(true)
        .same_site(SameSite::Strict)
        .build();
    Ok((jar.add(cookie), issued.access))
}
