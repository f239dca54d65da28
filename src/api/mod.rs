//! HTTP surfaces for both services: routers, handlers, middleware, and
//! the response envelope.

pub mod admin_handlers;
pub mod admin_routes;
pub mod middleware;
pub mod responses;
pub mod se_handlers;
pub mod se_routes;

pub use admin_handlers::AdminState;
pub use middleware::{AuthContext, AuthState, RequestId};
pub use responses::{ApiError, ApiResult};
pub use se_handlers::SeState;
