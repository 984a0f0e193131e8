//! Route table and middleware stack.

use axum::routing::{delete, get, post};
use axum::{middleware, Json, Router};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::auth::{require_access, require_csrf};
use crate::handlers::auth as auth_routes;
use crate::handlers::{admin, messages, sessions};
use crate::state::AppState;
use crate::ws;

pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/v1/auth/logout", post(auth_routes::logout))
        .route("/api/v1/auth/2fa/setup", post(auth_routes::setup_two_factor))
        .route("/api/v1/auth/2fa/enable", post(auth_routes::enable_two_factor))
        .route("/api/v1/sessions", get(sessions::list))
        .route("/api/v1/sessions/{id}/terminate", post(sessions::terminate))
        .route(
            "/api/v1/sessions/terminate-others",
            post(sessions::terminate_others),
        )
        .route("/api/v1/users", get(messages::directory))
        .route("/api/v1/users/me/key", post(messages::publish_key))
        .route("/api/v1/users/{id}/key", get(messages::user_key))
        .route("/api/v1/messages/unread", get(messages::unread_counts))
        .route("/api/v1/messages/broadcasts", get(messages::broadcast_history))
        .route(
            "/api/v1/messages/with/{user_id}",
            get(messages::conversation_history),
        )
        .route("/api/v1/messages/{id}/delivered", post(messages::mark_delivered))
        .route("/api/v1/messages/{id}/read", post(messages::mark_read))
        .route(
            "/api/v1/admin/users",
            get(admin::list_users).post(admin::create_user),
        )
        .route(
            "/api/v1/admin/users/{id}/deactivate",
            post(admin::deactivate_user),
        )
        .route(
            "/api/v1/admin/users/{id}/reset-password",
            post(admin::reset_user_password),
        )
        .route("/api/v1/admin/users/{id}/role", post(admin::set_role))
        .route(
            "/api/v1/admin/roles",
            get(admin::list_roles).post(admin::create_role),
        )
        .route("/api/v1/admin/roles/{name}", delete(admin::delete_role))
        .route("/api/v1/admin/broadcast", post(admin::broadcast))
        .route("/api/v1/admin/audit", get(admin::audit_trail))
        .layer(middleware::from_fn_with_state(state.clone(), require_access));

    let public = Router::new()
        .route("/health", get(health))
        .route("/api/v1/csrf", get(auth_routes::csrf))
        .route("/api/v1/auth/login", post(auth_routes::login))
        .route(
            "/api/v1/auth/initial-password",
            post(auth_routes::set_initial_password),
        )
        .route("/api/v1/auth/2fa/verify", post(auth_routes::verify_two_factor))
        .route("/api/v1/auth/refresh", post(auth_routes::refresh))
        .route(
            "/api/v1/auth/forgot-password",
            post(auth_routes::forgot_password),
        )
        .route(
            "/api/v1/auth/reset-password",
            post(auth_routes::reset_password),
        )
        .route(
            "/api/v1/auth/password-strength",
            post(auth_routes::password_strength),
        );

    let max_payload = state.config.max_payload_size;
    protected
        .merge(public)
        .layer(middleware::from_fn(require_csrf))
        // The channel upgrade is a GET and carries no body, so it sits
        // outside the CSRF gate.
        .route("/api/v1/channel", get(ws::ws_handler))
        .layer(RequestBodyLimitLayer::new(max_payload))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{CSRF_COOKIE, CSRF_HEADER};
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use quietwire_core::model::{User, UserStatus};
    use quietwire_core::password;
    use tower::ServiceExt;
    use uuid::Uuid;

    fn seed_user(state: &AppState, email: &str, role: &str) -> User {
        let user = User {
            id: Uuid::new_v4(),
            email: email.to_string(),
            password_hash: password::hash_password("Correct-Horse-42").unwrap(),
            role: role.to_string(),
            status: UserStatus::Active,
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

    async fn fetch_csrf(app: &Router) -> (String, String) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/csrf")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let set_cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        let cookie_pair = set_cookie.split(';').next().unwrap().to_string();

        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        let token = body["token"].as_str().unwrap().to_string();
        (cookie_pair, token)
    }

    #[tokio::test]
    async fn health_answers_without_authentication() {
        let app = build_router(AppState::test_fixture());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn protected_routes_require_a_bearer_token() {
        let state = AppState::test_fixture();
        let app = build_router(state.clone());

        let bare = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/sessions")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(bare.status(), StatusCode::UNAUTHORIZED);

        let user = seed_user(&state, "alice@example.com", "member");
        let access = state.tokens.issue_access(&user, Uuid::new_v4()).unwrap();
        let authed = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/sessions")
                    .header(header::AUTHORIZATION, format!("Bearer {access}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(authed.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn mutating_requests_need_the_csrf_pair() {
        let state = AppState::test_fixture();
        seed_user(&state, "alice@example.com", "member");
        let app = build_router(state);

        let login_body = r#"{"email":"alice@example.com","password":"Correct-Horse-42"}"#;
        let no_csrf = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/auth/login")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(login_body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(no_csrf.status(), StatusCode::FORBIDDEN);

        let (cookie, token) = fetch_csrf(&app).await;
        assert!(cookie.starts_with(CSRF_COOKIE));

        let mismatched = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/auth/login")
                    .header(header::CONTENT_TYPE, "application/json")
                    .header(header::COOKIE, cookie.clone())
                    .header(CSRF_HEADER, "somebody-elses-token")
                    .body(Body::from(login_body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(mismatched.status(), StatusCode::FORBIDDEN);

        let paired = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/auth/login")
                    .header(header::CONTENT_TYPE, "application/json")
                    .header(header::COOKIE, cookie)
                    .header(CSRF_HEADER, token)
                    .body(Body::from(login_body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(paired.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn oversized_payloads_are_cut_off() {
        let app = build_router(AppState::test_fixture());
        let (cookie, token) = fetch_csrf(&app).await;

        // Fixture config caps bodies at 64 KiB.
        let huge = format!(
            r#"{{"email":"a@example.com","password":"{}"}}"#,
            "x".repeat(80 * 1024)
        );
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/auth/login")
                    .header(header::CONTENT_TYPE, "application/json")
                    .header(header::COOKIE, cookie)
                    .header(CSRF_HEADER, token)
                    .body(Body::from(huge))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn unknown_routes_fall_through_to_404() {
        let app = build_router(AppState::test_fixture());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
