//! Admin control-plane request handlers.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::admin::admin_users::{AdminRole, AdminUserStore, LoginOutcome};
use crate::admin::elements::{ElementStore, ElementSync, SeClient};
use crate::admin::keys::{KeyRotator, KeySet, KeyStore};
use crate::admin::service_accounts::{SaRole, SaStatus, ServiceAccountStore};
use crate::admin::tokens::{PrincipalType, TokenService, TokenSubject};
use crate::api::middleware::{AuthContext, RequestId};
use crate::api::responses::{ApiError, ApiResult};
use crate::core::config::AdminConfig;
use crate::core::error::{EngineError, ErrorKind};
use crate::registry::client::RegistryClient;
use crate::storage::mode::SeMode;

/// Shared state for the Admin router.
#[derive(Clone)]
pub struct AdminState {
    pub config: Arc<AdminConfig>,
    pub pool: sqlx::PgPool,
    pub tokens: Arc<TokenService>,
    pub keys: Arc<KeySet>,
    pub key_store: KeyStore,
    pub rotator: Arc<KeyRotator>,
    pub accounts: ServiceAccountStore,
    pub users: AdminUserStore,
    pub elements: ElementStore,
    pub sync: Arc<ElementSync>,
    pub se_client: SeClient,
    pub registry: RegistryClient,
}

fn correlated(e: EngineError, correlation: &RequestId) -> ApiError {
    let api: ApiError = e.into();
    api.with_correlation(&correlation.0)
}

fn require_admin(auth: &AuthContext, correlation: &RequestId) -> ApiResult<()> {
    if auth.is_admin() {
        Ok(())
    } else {
        Err(ApiError::forbidden("admin role required").with_correlation(&correlation.0))
    }
}

// ============================================================================
// OAuth2 client credentials
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
}

/// `POST /auth/token`.
pub async fn oauth_token(
    State(state): State<AdminState>,
    Extension(correlation): Extension<RequestId>,
    Json(body): Json<ClientCredentials>,
) -> ApiResult<Response> {
    let account = state
        .accounts
        .authenticate(&body.client_id, &body.client_secret)
        .await
        .map_err(|e| correlated(e, &correlation))?;

    let pair = state
        .tokens
        .issue_pair(&TokenSubject {
            sub: account.id.to_string(),
            principal_type: PrincipalType::ServiceAccount,
            role: account.role.as_str().to_string(),
            client_id: Some(account.client_id.clone()),
            name: Some(account.name.clone()),
            rate_limit: Some(account.rate_limit),
        })
        .map_err(|e| correlated(e, &correlation))?;
    Ok(Json(pair).into_response())
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// `POST /auth/refresh`.
pub async fn oauth_refresh(
    State(state): State<AdminState>,
    Extension(correlation): Extension<RequestId>,
    Json(body): Json<RefreshRequest>,
) -> ApiResult<Response> {
    let (_, pair) = state
        .tokens
        .refresh(&body.refresh_token)
        .map_err(|e| correlated(e, &correlation))?;
    Ok(Json(pair).into_response())
}

// ============================================================================
// Admin-user authentication
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// `POST /admin-auth/login`.
pub async fn admin_login(
    State(state): State<AdminState>,
    Extension(correlation): Extension<RequestId>,
    Json(body): Json<LoginRequest>,
) -> ApiResult<Response> {
    match state
        .users
        .login(&body.username, &body.password)
        .await
        .map_err(|e| correlated(e, &correlation))?
    {
        LoginOutcome::Success(user) => {
            let pair = state
                .tokens
                .issue_pair(&TokenSubject {
                    sub: user.username.clone(),
                    principal_type: PrincipalType::AdminUser,
                    role: user.role.as_str().to_string(),
                    client_id: None,
                    name: Some(user.username.clone()),
                    rate_limit: None,
                })
                .map_err(|e| correlated(e, &correlation))?;
            Ok(Json(pair).into_response())
        }
        LoginOutcome::Locked { until } => Err(ApiError::locked(format!(
            "account locked until {}",
            until.to_rfc3339()
        ))
        .with_correlation(&correlation.0)),
        LoginOutcome::Disabled => {
            Err(ApiError::forbidden("account disabled").with_correlation(&correlation.0))
        }
        LoginOutcome::InvalidCredentials => {
            Err(ApiError::unauthorized("invalid credentials").with_correlation(&correlation.0))
        }
    }
}

/// `POST /admin-auth/refresh`.
pub async fn admin_refresh(
    state: State<AdminState>,
    correlation: Extension<RequestId>,
    body: Json<RefreshRequest>,
) -> ApiResult<Response> {
    oauth_refresh(state, correlation, body).await
}

/// `POST /admin-auth/logout`. Token revocation is handled by expiry; the
/// endpoint exists so clients have a definite logout signal.
pub async fn admin_logout() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// `GET /admin-auth/me`.
pub async fn admin_me(
    State(state): State<AdminState>,
    Extension(auth): Extension<AuthContext>,
    Extension(correlation): Extension<RequestId>,
) -> ApiResult<Response> {
    if auth.claims.principal_type != PrincipalType::AdminUser {
        return Err(ApiError::forbidden("admin-user token required")
            .with_correlation(&correlation.0));
    }
    let user = state
        .users
        .find_by_username(&auth.claims.sub)
        .await
        .map_err(|e| correlated(e, &correlation))?
        .ok_or_else(|| ApiError::not_found("user no longer exists"))?;
    Ok(Json(json!({
        "id": user.id,
        "username": user.username,
        "email": user.email,
        "role": user.role.as_str(),
        "enabled": user.enabled,
        "last_login_at": user.last_login_at,
        "is_system": user.is_system,
    }))
    .into_response())
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

/// `POST /admin-auth/change-password`.
pub async fn admin_change_password(
    State(state): State<AdminState>,
    Extension(auth): Extension<AuthContext>,
    Extension(correlation): Extension<RequestId>,
    Json(body): Json<ChangePasswordRequest>,
) -> ApiResult<StatusCode> {
    if auth.claims.principal_type != PrincipalType::AdminUser {
        return Err(ApiError::forbidden("admin-user token required")
            .with_correlation(&correlation.0));
    }
    let user = state
        .users
        .find_by_username(&auth.claims.sub)
        .await
        .map_err(|e| correlated(e, &correlation))?
        .ok_or_else(|| ApiError::not_found("user no longer exists"))?;
    state
        .users
        .change_password(user.id, &body.current_password, &body.new_password)
        .await
        .map_err(|e| correlated(e, &correlation))?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Service accounts
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateAccountRequest {
    pub name: String,
    pub role: SaRole,
    #[serde(default = "default_rate_limit")]
    pub rate_limit: i32,
}

fn default_rate_limit() -> i32 {
    100
}

fn account_view(account: &crate::admin::service_accounts::ServiceAccount) -> serde_json::Value {
    json!({
        "id": account.id,
        "name": account.name,
        "client_id": account.client_id,
        "role": account.role.as_str(),
        "status": account.status.as_str(),
        "rate_limit": account.rate_limit,
        "secret_expires_at": account.secret_expires_at,
        "is_system": account.is_system,
        "created_at": account.created_at,
    })
}

/// `POST /service-accounts`.
pub async fn create_account(
    State(state): State<AdminState>,
    Extension(auth): Extension<AuthContext>,
    Extension(correlation): Extension<RequestId>,
    Json(body): Json<CreateAccountRequest>,
) -> ApiResult<Response> {
    require_admin(&auth, &correlation)?;
    let (account, secret) = state
        .accounts
        .create(
            &state.config.environment,
            &body.name,
            body.role,
            body.rate_limit,
            false,
            None,
        )
        .await
        .map_err(|e| correlated(e, &correlation))?;
    let mut view = account_view(&account);
    // The plaintext secret appears exactly once, in this response.
    view["client_secret"] = json!(secret);
    Ok((StatusCode::CREATED, Json(view)).into_response())
}

/// `GET /service-accounts`.
pub async fn list_accounts(
    State(state): State<AdminState>,
    Extension(auth): Extension<AuthContext>,
    Extension(correlation): Extension<RequestId>,
) -> ApiResult<Response> {
    require_admin(&auth, &correlation)?;
    let accounts = state
        .accounts
        .list()
        .await
        .map_err(|e| correlated(e, &correlation))?;
    Ok(Json(accounts.iter().map(account_view).collect::<Vec<_>>()).into_response())
}

/// `GET /service-accounts/{id}`.
pub async fn get_account(
    State(state): State<AdminState>,
    Extension(auth): Extension<AuthContext>,
    Extension(correlation): Extension<RequestId>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    require_admin(&auth, &correlation)?;
    let account = state
        .accounts
        .find_by_id(id)
        .await
        .map_err(|e| correlated(e, &correlation))?
        .ok_or_else(|| ApiError::not_found("service account not found"))?;
    Ok(Json(account_view(&account)).into_response())
}

#[derive(Debug, Deserialize)]
pub struct UpdateAccountRequest {
    pub status: Option<SaStatus>,
}

/// `PUT /service-accounts/{id}` (status changes: suspend/reactivate).
pub async fn update_account(
    State(state): State<AdminState>,
    Extension(auth): Extension<AuthContext>,
    Extension(correlation): Extension<RequestId>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateAccountRequest>,
) -> ApiResult<Response> {
    require_admin(&auth, &correlation)?;
    if let Some(status) = body.status {
        if status == SaStatus::Deleted {
            return Err(ApiError::validation("use DELETE for removal")
                .with_correlation(&correlation.0));
        }
        state
            .accounts
            .set_status(id, status)
            .await
            .map_err(|e| correlated(e, &correlation))?;
    }
    let account = state
        .accounts
        .find_by_id(id)
        .await
        .map_err(|e| correlated(e, &correlation))?
        .ok_or_else(|| ApiError::not_found("service account not found"))?;
    Ok(Json(account_view(&account)).into_response())
}

/// `DELETE /service-accounts/{id}` (soft delete).
pub async fn delete_account(
    State(state): State<AdminState>,
    Extension(auth): Extension<AuthContext>,
    Extension(correlation): Extension<RequestId>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    require_admin(&auth, &correlation)?;
    state
        .accounts
        .delete(id)
        .await
        .map_err(|e| correlated(e, &correlation))?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /service-accounts/{id}/rotate-secret`.
pub async fn rotate_account_secret(
    State(state): State<AdminState>,
    Extension(auth): Extension<AuthContext>,
    Extension(correlation): Extension<RequestId>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    require_admin(&auth, &correlation)?;
    let (account, secret) = state
        .accounts
        .rotate_secret(id)
        .await
        .map_err(|e| correlated(e, &correlation))?;
    let mut view = account_view(&account);
    view["client_secret"] = json!(secret);
    Ok(Json(view).into_response())
}

// ============================================================================
// Admin users
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    pub role: AdminRole,
}

fn user_view(user: &crate::admin::admin_users::AdminUser) -> serde_json::Value {
    json!({
        "id": user.id,
        "username": user.username,
        "email": user.email,
        "role": user.role.as_str(),
        "enabled": user.enabled,
        "locked_until": user.locked_until,
        "last_login_at": user.last_login_at,
        "is_system": user.is_system,
        "created_at": user.created_at,
    })
}

/// `POST /admin-users`.
pub async fn create_user(
    State(state): State<AdminState>,
    Extension(auth): Extension<AuthContext>,
    Extension(correlation): Extension<RequestId>,
    Json(body): Json<CreateUserRequest>,
) -> ApiResult<Response> {
    require_admin(&auth, &correlation)?;
    let user = state
        .users
        .create(&body.username, &body.email, &body.password, body.role, false)
        .await
        .map_err(|e| correlated(e, &correlation))?;
    Ok((StatusCode::CREATED, Json(user_view(&user))).into_response())
}

/// `GET /admin-users`.
pub async fn list_users(
    State(state): State<AdminState>,
    Extension(auth): Extension<AuthContext>,
    Extension(correlation): Extension<RequestId>,
) -> ApiResult<Response> {
    require_admin(&auth, &correlation)?;
    let users = state
        .users
        .list()
        .await
        .map_err(|e| correlated(e, &correlation))?;
    Ok(Json(users.iter().map(user_view).collect::<Vec<_>>()).into_response())
}

/// `GET /admin-users/{id}`.
pub async fn get_user(
    State(state): State<AdminState>,
    Extension(auth): Extension<AuthContext>,
    Extension(correlation): Extension<RequestId>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    require_admin(&auth, &correlation)?;
    let user = state
        .users
        .find_by_id(id)
        .await
        .map_err(|e| correlated(e, &correlation))?
        .ok_or_else(|| ApiError::not_found("admin user not found"))?;
    Ok(Json(user_view(&user)).into_response())
}

#[derive(Debug, Deserialize)]
pub struct UpdateUserRequest {
    pub role: Option<AdminRole>,
    pub enabled: Option<bool>,
}

/// `PUT /admin-users/{id}`.
pub async fn update_user(
    State(state): State<AdminState>,
    Extension(auth): Extension<AuthContext>,
    Extension(correlation): Extension<RequestId>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateUserRequest>,
) -> ApiResult<Response> {
    require_admin(&auth, &correlation)?;
    if let Some(role) = body.role {
        state
            .users
            .set_role(id, role)
            .await
            .map_err(|e| correlated(e, &correlation))?;
    }
    if let Some(enabled) = body.enabled {
        state
            .users
            .set_enabled(id, enabled)
            .await
            .map_err(|e| correlated(e, &correlation))?;
    }
    let user = state
        .users
        .find_by_id(id)
        .await
        .map_err(|e| correlated(e, &correlation))?
        .ok_or_else(|| ApiError::not_found("admin user not found"))?;
    Ok(Json(user_view(&user)).into_response())
}

/// `DELETE /admin-users/{id}`.
pub async fn delete_user(
    State(state): State<AdminState>,
    Extension(auth): Extension<AuthContext>,
    Extension(correlation): Extension<RequestId>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    require_admin(&auth, &correlation)?;
    state
        .users
        .delete(id)
        .await
        .map_err(|e| correlated(e, &correlation))?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordRequest {
    pub new_password: String,
}

/// `POST /admin-users/{id}/reset-password`.
pub async fn reset_user_password(
    State(state): State<AdminState>,
    Extension(auth): Extension<AuthContext>,
    Extension(correlation): Extension<RequestId>,
    Path(id): Path<Uuid>,
    Json(body): Json<ResetPasswordRequest>,
) -> ApiResult<StatusCode> {
    require_admin(&auth, &correlation)?;
    state
        .users
        .reset_password(id, &body.new_password)
        .await
        .map_err(|e| correlated(e, &correlation))?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Storage elements
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct DiscoverRequest {
    pub endpoint: String,
    #[serde(default = "default_priority")]
    pub priority: i64,
}

fn default_priority() -> i64 {
    100
}

/// `POST /storage-elements/discover`: poll `/info` and register.
pub async fn discover_element(
    State(state): State<AdminState>,
    Extension(auth): Extension<AuthContext>,
    Extension(correlation): Extension<RequestId>,
    Json(body): Json<DiscoverRequest>,
) -> ApiResult<Response> {
    require_admin(&auth, &correlation)?;
    let info = state
        .se_client
        .get_info(&body.endpoint)
        .await
        .map_err(|e| correlated(e, &correlation))?;
    let record = state
        .elements
        .register(&body.endpoint, body.priority, &info)
        .await
        .map_err(|e| correlated(e, &correlation))?;
    Ok((StatusCode::CREATED, Json(record)).into_response())
}

/// `GET /storage-elements`.
pub async fn list_elements(
    State(state): State<AdminState>,
    Extension(auth): Extension<AuthContext>,
    Extension(correlation): Extension<RequestId>,
) -> ApiResult<Response> {
    require_admin(&auth, &correlation)?;
    let elements = state
        .elements
        .list()
        .await
        .map_err(|e| correlated(e, &correlation))?;
    Ok(Json(elements).into_response())
}

/// `GET /storage-elements/{element_id}`.
pub async fn get_element(
    State(state): State<AdminState>,
    Extension(auth): Extension<AuthContext>,
    Extension(correlation): Extension<RequestId>,
    Path(element_id): Path<String>,
) -> ApiResult<Response> {
    require_admin(&auth, &correlation)?;
    let record = state
        .elements
        .find(&element_id)
        .await
        .map_err(|e| correlated(e, &correlation))?
        .ok_or_else(|| ApiError::not_found("storage element not found"))?;
    Ok(Json(record).into_response())
}

/// `DELETE /storage-elements/{element_id}`: super_admin only, and only
/// once the element holds no files.
pub async fn delete_element(
    State(state): State<AdminState>,
    Extension(auth): Extension<AuthContext>,
    Extension(correlation): Extension<RequestId>,
    Path(element_id): Path<String>,
) -> ApiResult<StatusCode> {
    if !auth.is_super_admin() {
        return Err(ApiError::forbidden("super_admin role required")
            .with_correlation(&correlation.0));
    }
    state
        .elements
        .delete(&element_id)
        .await
        .map_err(|e| correlated(e, &correlation))?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /storage-elements/sync/{element_id}`.
pub async fn sync_element(
    State(state): State<AdminState>,
    Extension(auth): Extension<AuthContext>,
    Extension(correlation): Extension<RequestId>,
    Path(element_id): Path<String>,
) -> ApiResult<Response> {
    require_admin(&auth, &correlation)?;
    let record = state
        .elements
        .find(&element_id)
        .await
        .map_err(|e| correlated(e, &correlation))?
        .ok_or_else(|| ApiError::not_found("storage element not found"))?;
    let refreshed = state
        .sync
        .sync_one(&record)
        .await
        .map_err(|e| correlated(e, &correlation))?;
    Ok(Json(refreshed).into_response())
}

/// `POST /storage-elements/sync-all`.
pub async fn sync_all_elements(
    State(state): State<AdminState>,
    Extension(auth): Extension<AuthContext>,
    Extension(correlation): Extension<RequestId>,
) -> ApiResult<Response> {
    require_admin(&auth, &correlation)?;
    let synced = state
        .sync
        .sync_all()
        .await
        .map_err(|e| correlated(e, &correlation))?;
    Ok(Json(json!({"synced": synced})).into_response())
}

/// `GET /storage-elements/stats/summary`.
pub async fn element_stats(
    State(state): State<AdminState>,
    Extension(auth): Extension<AuthContext>,
    Extension(correlation): Extension<RequestId>,
) -> ApiResult<Response> {
    require_admin(&auth, &correlation)?;
    let summary = state
        .elements
        .summary()
        .await
        .map_err(|e| correlated(e, &correlation))?;
    Ok(Json(summary).into_response())
}

// ============================================================================
// JWT keys
// ============================================================================

/// `GET /jwt-keys/status`.
pub async fn key_status(
    State(state): State<AdminState>,
    Extension(auth): Extension<AuthContext>,
    Extension(correlation): Extension<RequestId>,
) -> ApiResult<Response> {
    require_admin(&auth, &correlation)?;
    let primary = state
        .keys
        .primary()
        .map_err(|e| correlated(e, &correlation))?;
    Ok(Json(json!({
        "primary_version": primary.version,
        "primary_expires_at": primary.expires_at,
        "key_count": state.keys.len(),
        "rotation_interval_hours": state.rotator.rotation_interval.as_secs() / 3600,
    }))
    .into_response())
}

/// `GET /jwt-keys/active`: public halves only, for token validators.
pub async fn active_keys(
    State(state): State<AdminState>,
    Extension(auth): Extension<AuthContext>,
    Extension(correlation): Extension<RequestId>,
) -> ApiResult<Response> {
    require_admin(&auth, &correlation)?;
    let keys: Vec<_> = state
        .keys
        .validation_keys(state.config.clock_skew)
        .into_iter()
        .map(|k| {
            json!({
                "version": k.version,
                "algorithm": "RS256",
                "public_key_pem": k.public_key_pem,
                "expires_at": k.expires_at,
                "is_active": k.is_active,
            })
        })
        .collect();
    Ok(Json(keys).into_response())
}

/// `POST /jwt-keys/rotate`. A concurrent rotation answers 409.
pub async fn rotate_keys(
    State(state): State<AdminState>,
    Extension(auth): Extension<AuthContext>,
    Extension(correlation): Extension<RequestId>,
) -> ApiResult<Response> {
    require_admin(&auth, &correlation)?;
    match state.rotator.rotate().await {
        Ok(version) => Ok(Json(json!({"rotated_to": version})).into_response()),
        Err(e) if e.kind() == ErrorKind::RebuildInProgress => Err(ApiError::new(
            StatusCode::CONFLICT,
            "rotation_in_progress",
            "another rotation holds the lock",
        )
        .with_correlation(&correlation.0)),
        Err(e) => Err(correlated(e, &correlation)),
    }
}

/// `GET /jwt-keys/history`.
pub async fn key_history(
    State(state): State<AdminState>,
    Extension(auth): Extension<AuthContext>,
    Extension(correlation): Extension<RequestId>,
) -> ApiResult<Response> {
    require_admin(&auth, &correlation)?;
    let history = state
        .key_store
        .history()
        .await
        .map_err(|e| correlated(e, &correlation))?;
    let view: Vec<_> = history
        .into_iter()
        .map(|(version, created_at, expires_at, is_active)| {
            json!({
                "version": version,
                "created_at": created_at,
                "expires_at": expires_at,
                "is_active": is_active,
            })
        })
        .collect();
    Ok(Json(view).into_response())
}

// ============================================================================
// Internal fallback (registry outage)
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct AvailableParams {
    pub mode: SeMode,
    #[serde(default)]
    pub min_free_bytes: u64,
}

/// `GET /internal/storage-elements/available`: DB-backed placement list
/// for when Redis is down. Tries the registry first so the answer matches
/// normal selection when it is up.
pub async fn internal_available(
    State(state): State<AdminState>,
    Extension(auth): Extension<AuthContext>,
    Extension(correlation): Extension<RequestId>,
    Query(params): Query<AvailableParams>,
) -> ApiResult<Response> {
    if !auth.is_service_account() {
        return Err(ApiError::forbidden("service account required")
            .with_correlation(&correlation.0));
    }
    if let Ok(Some(record)) = state
        .registry
        .select_element(params.mode, params.min_free_bytes)
        .await
    {
        return Ok(Json(json!({"source": "registry", "elements": [record]})).into_response());
    }
    let elements = state
        .elements
        .available(params.mode, params.min_free_bytes)
        .await
        .map_err(|e| correlated(e, &correlation))?;
    Ok(Json(json!({"source": "database", "elements": elements})).into_response())
}

/// `GET /internal/storage-elements/{element_id}`.
pub async fn internal_get_element(
    State(state): State<AdminState>,
    Extension(auth): Extension<AuthContext>,
    Extension(correlation): Extension<RequestId>,
    Path(element_id): Path<String>,
) -> ApiResult<Response> {
    if !auth.is_service_account() {
        return Err(ApiError::forbidden("service account required")
            .with_correlation(&correlation.0));
    }
    let record = state
        .elements
        .find(&element_id)
        .await
        .map_err(|e| correlated(e, &correlation))?
        .ok_or_else(|| ApiError::not_found("storage element not found"))?;
    Ok(Json(record).into_response())
}

// ============================================================================
// Health
// ============================================================================

/// `GET /health/live`.
pub async fn health_live() -> StatusCode {
    StatusCode::OK
}

/// `GET /health/ready`.
pub async fn health_ready(State(state): State<AdminState>) -> Response {
    match sqlx::query("SELECT 1").execute(&state.pool).await {
        Ok(_) => StatusCode::OK.into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error_code": "backend_unavailable", "message": e.to_string()})),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rate_limit() {
        assert_eq!(default_rate_limit(), 100);
        assert_eq!(default_priority(), 100);
    }
}
