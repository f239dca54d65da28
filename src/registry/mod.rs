//! Service discovery registry and distributed coordination primitives.

pub mod breaker;
pub mod client;
pub mod lock;

pub use breaker::CircuitBreaker;
pub use client::{HealthStatus, RegistryClient, RegistryRecord};
pub use lock::{CacheLock, CacheLockGuard, LockAttempt, LockPriority};
