//! API middleware: request correlation, bearer authentication, and scope
//! checks.
//!
//! Every request gets an `X-Request-ID` (client-supplied or generated)
//! that rides through extensions into error bodies. Authentication
//! validates the bearer JWT against the shared key set and parks an
//! [`AuthContext`] in extensions; per-route scope checks read it from
//! there.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::admin::tokens::{PrincipalType, TokenClaims, TokenService};
use crate::api::responses::ApiError;
use crate::storage::engine::Principal;

/// Request ID header name.
pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

/// Correlation id stored in request extensions.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Attach a request id to every request and response.
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    request.extensions_mut().insert(RequestId(request_id.clone()));

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Authenticated caller, parked in request extensions.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub claims: TokenClaims,
}

impl AuthContext {
    /// Whether the caller is an admin-grade identity: an ADMIN service
    /// account or an admin/super_admin user.
    pub fn is_admin(&self) -> bool {
        match self.claims.principal_type {
            PrincipalType::ServiceAccount => self.claims.role == "ADMIN",
            PrincipalType::AdminUser => {
                self.claims.role == "admin" || self.claims.role == "super_admin"
            }
        }
    }

    pub fn is_super_admin(&self) -> bool {
        self.claims.principal_type == PrincipalType::AdminUser
            && self.claims.role == "super_admin"
    }

    /// Whether the caller is a service account at all (the GC endpoints
    /// are machine-only).
    pub fn is_service_account(&self) -> bool {
        self.claims.principal_type == PrincipalType::ServiceAccount
    }

    /// File-operation scopes derived from the role.
    pub fn has_scope(&self, scope: &str) -> bool {
        match self.claims.principal_type {
            PrincipalType::ServiceAccount => match self.claims.role.as_str() {
                "ADMIN" | "USER" => true,
                "AUDITOR" | "READONLY" => scope == "file:read",
                _ => false,
            },
            PrincipalType::AdminUser => match self.claims.role.as_str() {
                "super_admin" | "admin" => true,
                "readonly" => scope == "file:read",
                _ => false,
            },
        }
    }

    /// Engine-level principal for this caller.
    pub fn principal(&self) -> Principal {
        Principal {
            name: self
                .claims
                .name
                .clone()
                .unwrap_or_else(|| self.claims.sub.clone()),
            is_admin: self.is_admin(),
        }
    }
}

/// Shared authentication state.
#[derive(Clone)]
pub struct AuthState {
    pub tokens: Arc<TokenService>,
}

/// Bearer authentication middleware.
pub async fn auth_middleware(
    State(state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let correlation = request
        .extensions()
        .get::<RequestId>()
        .map(|r| r.0.clone())
        .unwrap_or_default();

    let token = extract_bearer_token(request.headers()).ok_or_else(|| {
        ApiError::unauthorized("missing bearer token").with_correlation(&correlation)
    })?;

    let claims = state.tokens.validate_access(&token).map_err(|e| {
        let api: ApiError = e.into();
        api.with_correlation(&correlation)
    })?;

    request.extensions_mut().insert(AuthContext { claims });
    Ok(next.run(request).await)
}

fn extract_bearer_token(headers: &axum::http::HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::to_string)
}

/// Permissive CORS for the API surface; the services sit behind the
/// ingress that enforces origins in production.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(principal_type: PrincipalType, role: &str) -> TokenClaims {
        TokenClaims {
            sub: "x".into(),
            exp: 0,
            iat: 0,
            nbf: 0,
            jti: "j".into(),
            principal_type,
            token_use: "access".into(),
            role: role.into(),
            client_id: None,
            name: Some("alice".into()),
            rate_limit: None,
        }
    }

    #[test]
    fn test_scope_matrix() {
        let admin_sa = AuthContext {
            claims: claims(PrincipalType::ServiceAccount, "ADMIN"),
        };
        assert!(admin_sa.has_scope("file:delete"));
        assert!(admin_sa.is_admin());
        assert!(admin_sa.is_service_account());

        let readonly_sa = AuthContext {
            claims: claims(PrincipalType::ServiceAccount, "READONLY"),
        };
        assert!(readonly_sa.has_scope("file:read"));
        assert!(!readonly_sa.has_scope("file:create"));
        assert!(!readonly_sa.is_admin());

        let readonly_user = AuthContext {
            claims: claims(PrincipalType::AdminUser, "readonly"),
        };
        assert!(readonly_user.has_scope("file:read"));
        assert!(!readonly_user.has_scope("file:update"));

        let super_admin = AuthContext {
            claims: claims(PrincipalType::AdminUser, "super_admin"),
        };
        assert!(super_admin.is_super_admin());
        assert!(super_admin.is_admin());
        assert!(!super_admin.is_service_account());
    }

    #[test]
    fn test_principal_resolution() {
        let ctx = AuthContext {
            claims: claims(PrincipalType::ServiceAccount, "ADMIN"),
        };
        let principal = ctx.principal();
        assert_eq!(principal.name, "alice");
        assert!(principal.is_admin);
    }

    #[test]
    fn test_bearer_extraction() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer abc.def.ghi".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers).as_deref(), Some("abc.def.ghi"));

        headers.insert(header::AUTHORIZATION, "Basic xyz".parse().unwrap());
        assert!(extract_bearer_token(&headers).is_none());
    }
}
