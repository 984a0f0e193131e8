//! Administrative surface: account provisioning, deactivation, forced
//! password resets, role management, broadcasts, and the audit trail.
//!
//! Every gate re-reads the caller's role from the store, so a demotion
//! takes effect on the next request rather than at token expiry.

use axum::extract::{Extension, Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use quietwire_core::authz::{Permission, Role};
use quietwire_core::event::SecurityEvent;
use quietwire_core::model::{User, UserStatus};
use quietwire_core::{password, Error as CoreError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::str::FromStr;
use uuid::Uuid;

use crate::auth::{client_ip, AuthContext};
use crate::error::ApiError;
use crate::handlers::require_permission;
use crate::state::AppState;
use crate::storage::models::AuditRow;
use crate::ws;

const TEMP_PASSWORD_LEN: usize = 16;

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub email: String,
    pub role: String,
}

#[derive(Debug, Serialize)]
pub struct CreateUserResponse {
    pub user_id: Uuid,
    pub email: String,
    /// Handed to the new user out of band; login forces a replacement.
    pub temp_password: String,
}

#[derive(Debug, Serialize)]
pub struct AdminUserView {
    pub id: Uuid,
    pub email: String,
    pub role: String,
    pub status: String,
    pub created_at: i64,
    pub has_public_key: bool,
}

#[derive(Debug, Deserialize)]
pub struct SetRoleRequest {
    pub role: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateRoleRequest {
    pub name: String,
    pub permissions: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct BroadcastRequest {
    pub payload: String,
}

#[derive(Debug, Deserialize)]
pub struct AuditParams {
    /// Exclusive upper bound on the audit row id, from the previous
    /// page.
    pub before: Option<i64>,
    pub limit: Option<i64>,
}

fn caller(state: &AppState, ctx: &AuthContext) -> Result<User, ApiError> {
    state
        .store
        .user_by_id(ctx.user_id)?
        .ok_or_else(|| CoreError::InvalidToken.into())
}

/// POST /api/v1/admin/users
pub async fn create_user(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    headers: HeaderMap,
    Json(req): Json<CreateUserRequest>,
) -> Result<Json<CreateUserResponse>, ApiError> {
    let admin = caller(&state, &ctx)?;
    require_permission(&state, &admin.role, Permission::CreateUser)?;

    let email = req.email.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(CoreError::InvalidInput("Invalid email address".to_string()).into());
    }
    if state.store.role(&req.role)?.is_none() {
        return Err(ApiError::BadRequest(format!("Unknown role '{}'", req.role)));
    }

    let temp_password = password::generate_temp_password(TEMP_PASSWORD_LEN);
    let user = User {
        id: Uuid::new_v4(),
        email: email.clone(),
        password_hash: password::hash_password(&temp_password)?,
        role: req.role,
        status: UserStatus::Pending,
        totp_secret: None,
        totp_pending: None,
        public_key: None,
        last_fingerprint: None,
        refresh_token: None,
        created_at: chrono::Utc::now().timestamp(),
    };
    state.store.create_user(&user)?;
    state.audit.record(
        &SecurityEvent::UserCreated { user_id: user.id },
        Some(admin.id),
        Some(&client_ip(&headers)),
    );

    Ok(Json(CreateUserResponse {
        user_id: user.id,
        email,
        temp_password,
    }))
}

/// GET /api/v1/admin/users
pub async fn list_users(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<Vec<AdminUserView>>, ApiError> {
    let admin = caller(&state, &ctx)?;
    require_permission(&state, &admin.role, Permission::CreateUser)?;

    let views = state
        .store
        .list_users()?
        .into_iter()
        .map(|user| AdminUserView {
            id: user.id,
            email: user.email,
            role: user.role,
            status: user.status.as_str().to_string(),
            created_at: user.created_at,
            has_public_key: user.public_key.is_some(),
        })
        .collect();
    Ok(Json(views))
}

/// POST /api/v1/admin/users/{id}/deactivate
pub async fn deactivate_user(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    headers: HeaderMap,
    Path(user_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let admin = caller(&state, &ctx)?;
    require_permission(&state, &admin.role, Permission::DeactivateUser)?;

    if user_id == admin.id {
        return Err(ApiError::BadRequest(
            "Cannot deactivate your own account".to_string(),
        ));
    }
    let target = state
        .store
        .user_by_id(user_id)?
        .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;

    state.store.set_status(target.id, UserStatus::Deactivated)?;
    state.store.terminate_sessions_for_user(target.id)?;
    state.store.set_refresh_token(target.id, None)?;
    state.audit.record(
        &SecurityEvent::UserDeactivated { user_id: target.id },
        Some(admin.id),
        Some(&client_ip(&headers)),
    );
    Ok(Json(json!({ "deactivated": true })))
}

/// POST /api/v1/admin/users/{id}/reset-password
///
/// Moves the account back to pending with a fresh temporary password;
/// the next login forces the user through initial password setup.
pub async fn reset_user_password(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    headers: HeaderMap,
    Path(user_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let admin = caller(&state, &ctx)?;
    require_permission(&state, &admin.role, Permission::ResetPassword)?;

    let target = state
        .store
        .user_by_id(user_id)?
        .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;
    if target.status == UserStatus::Deactivated {
        return Err(ApiError::BadRequest("Account is deactivated".to_string()));
    }

    let temp_password = password::generate_temp_password(TEMP_PASSWORD_LEN);
    let hash = password::hash_password(&temp_password)?;
    state
        .store
        .update_password(target.id, &hash, UserStatus::Pending)?;
    state.store.set_refresh_token(target.id, None)?;
    state.store.terminate_sessions_for_user(target.id)?;
    state.audit.record(
        &SecurityEvent::PasswordChanged,
        Some(target.id),
        Some(&client_ip(&headers)),
    );
    Ok(Json(json!({ "temp_password": temp_password })))
}

/// POST /api/v1/admin/users/{id}/role
pub async fn set_role(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    headers: HeaderMap,
    Path(user_id): Path<Uuid>,
    Json(req): Json<SetRoleRequest>,
) -> Result<Json<Value>, ApiError> {
    let admin = caller(&state, &ctx)?;
    require_permission(&state, &admin.role, Permission::ManageRoles)?;

    if state.store.role(&req.role)?.is_none() {
        return Err(ApiError::BadRequest(format!("Unknown role '{}'", req.role)));
    }
    if !state.store.set_role(user_id, &req.role)? {
        return Err(ApiError::NotFound("User not found".to_string()));
    }
    state.audit.record(
        &SecurityEvent::RoleChanged {
            user_id,
            role: req.role.clone(),
        },
        Some(admin.id),
        Some(&client_ip(&headers)),
    );
    Ok(Json(json!({ "role": req.role })))
}

/// GET /api/v1/admin/roles
pub async fn list_roles(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<Vec<Role>>, ApiError> {
    let admin = caller(&state, &ctx)?;
    require_permission(&state, &admin.role, Permission::ManageRoles)?;
    Ok(Json(state.store.list_roles()?))
}

/// POST /api/v1/admin/roles
pub async fn create_role(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<CreateRoleRequest>,
) -> Result<Json<Role>, ApiError> {
    let admin = caller(&state, &ctx)?;
    require_permission(&state, &admin.role, Permission::ManageRoles)?;

    let name = req.name.trim().to_lowercase();
    if name.is_empty() {
        return Err(CoreError::InvalidInput("Role name must not be empty".to_string()).into());
    }
    let mut permissions = BTreeSet::new();
    for atom in &req.permissions {
        let permission = Permission::from_str(atom)
            .map_err(|_| ApiError::BadRequest(format!("Unknown permission '{}'", atom)))?;
        permissions.insert(permission);
    }

    let role = Role { name, permissions };
    state.store.upsert_role(&role)?;
    Ok(Json(role))
}

/// DELETE /api/v1/admin/roles/{name}
pub async fn delete_role(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let admin = caller(&state, &ctx)?;
    require_permission(&state, &admin.role, Permission::ManageRoles)?;
    state.store.delete_role(&name)?;
    Ok(Json(json!({ "deleted": name })))
}

/// POST /api/v1/admin/broadcast
pub async fn broadcast(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<BroadcastRequest>,
) -> Result<Json<Value>, ApiError> {
    let admin = caller(&state, &ctx)?;
    let message = ws::send_broadcast(&state, admin.id, &admin.role, req.payload)?;
    Ok(Json(json!({
        "message_id": message.id,
        "created_at": message.created_at,
    })))
}

/// GET /api/v1/admin/audit
pub async fn audit_trail(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Query(params): Query<AuditParams>,
) -> Result<Json<Vec<AuditRow>>, ApiError> {
    let admin = caller(&state, &ctx)?;
    require_permission(&state, &admin.role, Permission::ViewLogs)?;

    let limit = params.limit.unwrap_or(50).clamp(1, 500);
    Ok(Json(state.store.audit_page(limit, params.before)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::auth::{login, LoginRequest, LoginResponse};
    use axum_extra::extract::cookie::CookieJar;
    use quietwire_core::token::Claims;

    const PASSWORD: &str = "Correct-Horse-42";

    fn seed_user(state: &AppState, email: &str, role: &str, status: UserStatus) -> User {
        let user = User {
            id: Uuid::new_v4(),
            email: email.to_string(),
            password_hash: password::hash_password(PASSWORD).unwrap(),
            role: role.to_string(),
            status,
            totp_secret: None,
            totp_pending: None,
            public_key: None,
            last_fingerprint: None,
            refresh_token: None,
            created_at: 0,
        };
        state.store.create_user(&user).unwrap();
        user
    }

    fn context_for(state: &AppState, user: &User) -> AuthContext {
        let token = state.tokens.issue_access(user, Uuid::new_v4()).unwrap();
        let claims: Claims = state.validate_access(&token).unwrap();
        AuthContext {
            user_id: claims.sub,
            claims,
        }
    }

    async fn try_login(
        state: &AppState,
        email: &str,
        password: &str,
    ) -> Result<LoginResponse, ApiError> {
        let (_, Json(body)) = login(
            State(state.clone()),
            CookieJar::new(),
            HeaderMap::new(),
            Json(LoginRequest {
                email: email.to_string(),
                password: password.to_string(),
            }),
        )
        .await?;
        Ok(body)
    }

    #[tokio::test]
    async fn members_are_shut_out_of_the_admin_surface() {
        let state = AppState::test_fixture();
        let member = seed_user(&state, "m@example.com", "member", UserStatus::Active);
        let ctx = context_for(&state, &member);

        let create = create_user(
            State(state.clone()),
            Extension(ctx.clone()),
            HeaderMap::new(),
            Json(CreateUserRequest {
                email: "x@example.com".to_string(),
                role: "member".to_string(),
            }),
        )
        .await;
        assert!(matches!(create, Err(ApiError::Core(CoreError::Forbidden))));

        let audit = audit_trail(
            State(state.clone()),
            Extension(ctx.clone()),
            Query(AuditParams {
                before: None,
                limit: None,
            }),
        )
        .await;
        assert!(matches!(audit, Err(ApiError::Core(CoreError::Forbidden))));

        let roles = list_roles(State(state.clone()), Extension(ctx)).await;
        assert!(matches!(roles, Err(ApiError::Core(CoreError::Forbidden))));
    }

    #[tokio::test]
    async fn provisioning_hands_out_a_forced_temp_password() {
        let state = AppState::test_fixture();
        let admin = seed_user(&state, "root@example.com", "administrator", UserStatus::Active);
        let ctx = context_for(&state, &admin);

        let Json(created) = create_user(
            State(state.clone()),
            Extension(ctx.clone()),
            HeaderMap::new(),
            Json(CreateUserRequest {
                email: "New.Hire@Example.com ".to_string(),
                role: "member".to_string(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(created.email, "new.hire@example.com");

        // The temp password logs in but lands in forced setup.
        let body = try_login(&state, &created.email, &created.temp_password)
            .await
            .unwrap();
        assert!(matches!(body, LoginResponse::PasswordSetupRequired { .. }));

        let duplicate = create_user(
            State(state.clone()),
            Extension(ctx.clone()),
            HeaderMap::new(),
            Json(CreateUserRequest {
                email: "new.hire@example.com".to_string(),
                role: "member".to_string(),
            }),
        )
        .await;
        assert!(matches!(duplicate, Err(ApiError::Conflict(_))));

        let bad_role = create_user(
            State(state.clone()),
            Extension(ctx),
            HeaderMap::new(),
            Json(CreateUserRequest {
                email: "other@example.com".to_string(),
                role: "overlord".to_string(),
            }),
        )
        .await;
        assert!(matches!(bad_role, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn deactivation_locks_the_account_out() {
        let state = AppState::test_fixture();
        let admin = seed_user(&state, "root@example.com", "administrator", UserStatus::Active);
        let bob = seed_user(&state, "bob@example.com", "member", UserStatus::Active);
        let _ = try_login(&state, "bob@example.com", PASSWORD).await.unwrap();
        let ctx = context_for(&state, &admin);

        deactivate_user(
            State(state.clone()),
            Extension(ctx),
            HeaderMap::new(),
            Path(bob.id),
        )
        .await
        .unwrap();

        let result = try_login(&state, "bob@example.com", PASSWORD).await;
        assert!(matches!(
            result,
            Err(ApiError::Core(CoreError::AccountNotActive(_)))
        ));
        assert!(state.store.sessions_for_user(bob.id).unwrap().is_empty());
        let stored = state.store.user_by_id(bob.id).unwrap().unwrap();
        assert_eq!(stored.refresh_token, None);
    }

    #[tokio::test]
    async fn self_deactivation_is_refused() {
        let state = AppState::test_fixture();
        let admin = seed_user(&state, "root@example.com", "administrator", UserStatus::Active);
        let ctx = context_for(&state, &admin);

        let result = deactivate_user(
            State(state.clone()),
            Extension(ctx),
            HeaderMap::new(),
            Path(admin.id),
        )
        .await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn forced_reset_sends_the_user_back_through_setup() {
        let state = AppState::test_fixture();
        let admin = seed_user(&state, "root@example.com", "administrator", UserStatus::Active);
        let bob = seed_user(&state, "bob@example.com", "member", UserStatus::Active);
        let ctx = context_for(&state, &admin);

        let Json(body) = reset_user_password(
            State(state.clone()),
            Extension(ctx),
            HeaderMap::new(),
            Path(bob.id),
        )
        .await
        .unwrap();
        let temp = body["temp_password"].as_str().unwrap().to_string();

        let old = try_login(&state, "bob@example.com", PASSWORD).await;
        assert!(matches!(
            old,
            Err(ApiError::Core(CoreError::InvalidCredentials))
        ));
        let fresh = try_login(&state, "bob@example.com", &temp).await.unwrap();
        assert!(matches!(fresh, LoginResponse::PasswordSetupRequired { .. }));
    }

    #[tokio::test]
    async fn role_lifecycle_create_assign_delete() {
        let state = AppState::test_fixture();
        let admin = seed_user(&state, "root@example.com", "administrator", UserStatus::Active);
        let bob = seed_user(&state, "bob@example.com", "member", UserStatus::Active);
        let ctx = context_for(&state, &admin);

        let unknown_atom = create_role(
            State(state.clone()),
            Extension(ctx.clone()),
            Json(CreateRoleRequest {
                name: "auditor".to_string(),
                permissions: vec!["view-logs".to_string(), "launch-missiles".to_string()],
            }),
        )
        .await;
        assert!(matches!(unknown_atom, Err(ApiError::BadRequest(_))));

        let Json(role) = create_role(
            State(state.clone()),
            Extension(ctx.clone()),
            Json(CreateRoleRequest {
                name: "Auditor".to_string(),
                permissions: vec!["view-logs".to_string()],
            }),
        )
        .await
        .unwrap();
        assert_eq!(role.name, "auditor");
        assert!(role.permissions.contains(&Permission::ViewLogs));

        set_role(
            State(state.clone()),
            Extension(ctx.clone()),
            HeaderMap::new(),
            Path(bob.id),
            Json(SetRoleRequest {
                role: "auditor".to_string(),
            }),
        )
        .await
        .unwrap();
        let stored = state.store.user_by_id(bob.id).unwrap().unwrap();
        assert_eq!(stored.role, "auditor");

        let referenced = delete_role(
            State(state.clone()),
            Extension(ctx.clone()),
            Path("auditor".to_string()),
        )
        .await;
        assert!(matches!(referenced, Err(ApiError::Conflict(_))));

        set_role(
            State(state.clone()),
            Extension(ctx.clone()),
            HeaderMap::new(),
            Path(bob.id),
            Json(SetRoleRequest {
                role: "member".to_string(),
            }),
        )
        .await
        .unwrap();
        delete_role(
            State(state.clone()),
            Extension(ctx.clone()),
            Path("auditor".to_string()),
        )
        .await
        .unwrap();

        let missing = delete_role(
            State(state.clone()),
            Extension(ctx),
            Path("auditor".to_string()),
        )
        .await;
        assert!(matches!(missing, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn a_demoted_admin_loses_access_immediately() {
        let state = AppState::test_fixture();
        let admin = seed_user(&state, "root@example.com", "administrator", UserStatus::Active);
        let ctx = context_for(&state, &admin);

        // Token still says administrator; the store now says member.
        state.store.set_role(admin.id, "member").unwrap();

        let result = list_users(State(state.clone()), Extension(ctx)).await;
        assert!(matches!(result, Err(ApiError::Core(CoreError::Forbidden))));
    }

    #[tokio::test]
    async fn broadcast_endpoint_persists_and_is_gated() {
        let state = AppState::test_fixture();
        let admin = seed_user(&state, "root@example.com", "administrator", UserStatus::Active);
        let member = seed_user(&state, "m@example.com", "member", UserStatus::Active);

        let refused = broadcast(
            State(state.clone()),
            Extension(context_for(&state, &member)),
            Json(BroadcastRequest {
                payload: "nope".to_string(),
            }),
        )
        .await;
        assert!(matches!(refused, Err(ApiError::Core(CoreError::Forbidden))));

        let Json(body) = broadcast(
            State(state.clone()),
            Extension(context_for(&state, &admin)),
            Json(BroadcastRequest {
                payload: "maintenance at noon".to_string(),
            }),
        )
        .await
        .unwrap();
        assert!(body["message_id"].is_string());

        let (page, _) = state.store.broadcast_page(None, 10).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].payload, "maintenance at noon");
    }

    #[tokio::test]
    async fn audit_trail_pages_by_row_id() {
        let state = AppState::test_fixture();
        let admin = seed_user(&state, "root@example.com", "administrator", UserStatus::Active);
        let ctx = context_for(&state, &admin);
        for i in 0..5 {
            state.audit.record(
                &SecurityEvent::UserCreated { user_id: Uuid::new_v4() },
                Some(admin.id),
                Some(&format!("198.51.100.{i}")),
            );
        }

        let Json(first) = audit_trail(
            State(state.clone()),
            Extension(ctx.clone()),
            Query(AuditParams {
                before: None,
                limit: Some(2),
            }),
        )
        .await
        .unwrap();
        assert_eq!(first.len(), 2);
        assert!(first[0].id > first[1].id);

        let Json(rest) = audit_trail(
            State(state.clone()),
            Extension(ctx),
            Query(AuditParams {
                before: Some(first[1].id),
                limit: Some(50),
            }),
        )
        .await
        .unwrap();
        assert_eq!(rest.len(), 3);
        assert!(rest.iter().all(|row| row.id < first[1].id));
    }
}
