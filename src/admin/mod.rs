//! Admin control plane: identity, tokens, key rotation, fleet sync, and
//! garbage collection.

pub mod admin_users;
pub mod elements;
pub mod gc;
pub mod keys;
pub mod scheduler;
pub mod service_accounts;
pub mod tokens;

pub use admin_users::{AdminRole, AdminUser, AdminUserStore, LoginOutcome};
pub use elements::{ElementRecord, ElementStore, ElementSync, InfoPayload, SeClient};
pub use gc::{FileRegistry, GarbageCollector, GcReport};
pub use keys::{JwtKey, KeyRotator, KeySet, KeyStore};
pub use scheduler::{BackgroundJob, JobSchedule, Scheduler};
pub use service_accounts::{SaRole, SaStatus, ServiceAccount, ServiceAccountStore};
pub use tokens::{PrincipalType, TokenClaims, TokenPair, TokenService, TokenSubject};
