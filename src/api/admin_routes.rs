//! Admin control-plane router.

use axum::middleware::from_fn_with_state;
use axum::routing::{delete, get, post, put};
use axum::Router;

use crate::api::admin_handlers::{self, AdminState};
use crate::api::middleware::{auth_middleware, cors_layer, request_id_middleware, AuthState};

/// Build the `/api/v1` router for the Admin service.
///
/// Token endpoints, login, and health are open; everything else requires
/// a bearer token.
pub fn create_router(state: AdminState, auth: AuthState) -> Router {
    let protected = Router::new()
        // Admin-user session
        .route("/admin-auth/logout", post(admin_handlers::admin_logout))
        .route("/admin-auth/me", get(admin_handlers::admin_me))
        .route(
            "/admin-auth/change-password",
            post(admin_handlers::admin_change_password),
        )
        // Service accounts
        .route("/service-accounts", post(admin_handlers::create_account))
        .route("/service-accounts", get(admin_handlers::list_accounts))
        .route("/service-accounts/:id", get(admin_handlers::get_account))
        .route("/service-accounts/:id", put(admin_handlers::update_account))
        .route("/service-accounts/:id", delete(admin_handlers::delete_account))
        .route(
            "/service-accounts/:id/rotate-secret",
            post(admin_handlers::rotate_account_secret),
        )
        // Admin users
        .route("/admin-users", post(admin_handlers::create_user))
        .route("/admin-users", get(admin_handlers::list_users))
        .route("/admin-users/:id", get(admin_handlers::get_user))
        .route("/admin-users/:id", put(admin_handlers::update_user))
        .route("/admin-users/:id", delete(admin_handlers::delete_user))
        .route(
            "/admin-users/:id/reset-password",
            post(admin_handlers::reset_user_password),
        )
        // Storage elements
        .route(
            "/storage-elements/discover",
            post(admin_handlers::discover_element),
        )
        .route("/storage-elements", get(admin_handlers::list_elements))
        .route(
            "/storage-elements/stats/summary",
            get(admin_handlers::element_stats),
        )
        .route(
            "/storage-elements/sync-all",
            post(admin_handlers::sync_all_elements),
        )
        .route(
            "/storage-elements/sync/:element_id",
            post(admin_handlers::sync_element),
        )
        .route(
            "/storage-elements/:element_id",
            get(admin_handlers::get_element),
        )
        .route(
            "/storage-elements/:element_id",
            delete(admin_handlers::delete_element),
        )
        // Signing keys
        .route("/jwt-keys/status", get(admin_handlers::key_status))
        .route("/jwt-keys/active", get(admin_handlers::active_keys))
        .route("/jwt-keys/rotate", post(admin_handlers::rotate_keys))
        .route("/jwt-keys/history", get(admin_handlers::key_history))
        // Registry-outage fallback for placement consumers
        .route(
            "/internal/storage-elements/available",
            get(admin_handlers::internal_available),
        )
        .route(
            "/internal/storage-elements/:element_id",
            get(admin_handlers::internal_get_element),
        )
        .layer(from_fn_with_state(auth, auth_middleware));

    let open = Router::new()
        .route("/auth/token", post(admin_handlers::oauth_token))
        .route("/auth/refresh", post(admin_handlers::oauth_refresh))
        .route("/admin-auth/login", post(admin_handlers::admin_login))
        .route("/admin-auth/refresh", post(admin_handlers::admin_refresh))
        .route("/health/live", get(admin_handlers::health_live))
        .route("/health/ready", get(admin_handlers::health_ready));

    Router::new()
        .nest("/api/v1", protected.merge(open).with_state(state))
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(cors_layer())
}
