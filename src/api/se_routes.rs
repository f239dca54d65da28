//! Storage Element router.

use axum::extract::DefaultBodyLimit;
use axum::middleware::from_fn_with_state;
use axum::routing::{delete, get, patch, post};
use axum::Router;

use crate::api::middleware::{auth_middleware, cors_layer, request_id_middleware, AuthState};
use crate::api::se_handlers::{self, SeState};

/// Build the `/api/v1` router for a Storage Element.
///
/// Discovery (`/info`, `/capacity`) and health endpoints are
/// unauthenticated; everything else requires a bearer token.
pub fn create_router(state: SeState, auth: AuthState) -> Router {
    let protected = Router::new()
        // File operations
        .route("/files/upload", post(se_handlers::upload_file))
        .route("/files", get(se_handlers::search_files))
        .route("/files/:id", get(se_handlers::get_file))
        .route("/files/:id/download", get(se_handlers::download_file))
        .route("/files/:id", patch(se_handlers::update_file))
        .route("/files/:id", delete(se_handlers::delete_file))
        .route(
            "/files/restore/:ticket_id",
            get(se_handlers::restore_ticket_status),
        )
        // Cache maintenance
        .route("/cache/rebuild", post(se_handlers::cache_rebuild))
        .route(
            "/cache/rebuild/incremental",
            post(se_handlers::cache_rebuild_incremental),
        )
        .route("/cache/consistency", get(se_handlers::cache_consistency))
        .route(
            "/cache/cleanup-expired",
            post(se_handlers::cache_cleanup_expired),
        )
        // GC surface
        .route("/gc/:id", delete(se_handlers::gc_delete))
        .route("/gc/:id/exists", get(se_handlers::gc_exists))
        .layer(from_fn_with_state(auth, auth_middleware));

    let open = Router::new()
        .route("/info", get(se_handlers::info))
        .route("/capacity", get(se_handlers::capacity))
        .route("/health/live", get(se_handlers::health_live))
        .route("/health/ready", get(se_handlers::health_ready));

    // The engine enforces the per-file ceiling while streaming; the
    // framework default of 2 MiB would reject real uploads first.
    let max_body = state.config.max_file_size_bytes as usize + 1024 * 1024;

    Router::new()
        .nest("/api/v1", protected.merge(open).with_state(state))
        .layer(DefaultBodyLimit::max(max_body))
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(cors_layer())
}
