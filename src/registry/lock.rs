//! Priority-tagged distributed lock for cache operations.
//!
//! One lock per element, `se:{id}:cache_lock`, taken with `SET NX EX` and
//! renewed by a heartbeat while held. The stored value is
//! `{priority}:{owner}` so a contender can tell what outranks it: nothing
//! preempts a live holder, and a P1 attempt against a P1 holder is the
//! caller-visible `rebuild_in_progress` case. A dead holder's lock simply
//! expires and the next contender takes over.

use std::time::Duration;

use redis::aio::ConnectionManager;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::error::{EngineError, EngineResult};

/// Lock priorities, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockPriority {
    /// Full / incremental rebuild (exclusive).
    P1 = 1,
    /// Consistency check.
    P2 = 2,
    /// Lazy per-entry rebuild.
    P3 = 3,
    /// Expired-row cleanup.
    P4 = 4,
}

impl LockPriority {
    fn tag(&self) -> &'static str {
        match self {
            LockPriority::P1 => "p1",
            LockPriority::P2 => "p2",
            LockPriority::P3 => "p3",
            LockPriority::P4 => "p4",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "p1" => Some(LockPriority::P1),
            "p2" => Some(LockPriority::P2),
            "p3" => Some(LockPriority::P3),
            "p4" => Some(LockPriority::P4),
            _ => None,
        }
    }
}

/// Outcome of a non-blocking acquisition attempt.
pub enum LockAttempt {
    Acquired(CacheLockGuard),
    /// Held by a P1 operation; callers surface `rebuild_in_progress` when
    /// they are P1 themselves, or skip quietly otherwise.
    HeldByRebuild,
    /// Held by a lower-priority operation; not preempted.
    Held,
}

/// Distributed lock handle for one element's cache.
#[derive(Clone)]
pub struct CacheLock {
    redis: ConnectionManager,
    key: String,
    lease: Duration,
}

impl CacheLock {
    pub fn new(redis: ConnectionManager, element_id: &str, lease: Duration) -> Self {
        Self {
            redis,
            key: format!("se:{element_id}:cache_lock"),
            lease,
        }
    }

    /// Try to take the lock at `priority` without blocking.
    pub async fn try_acquire(&self, priority: LockPriority) -> EngineResult<LockAttempt> {
        let owner = Uuid::new_v4().simple().to_string();
        let value = format!("{}:{owner}", priority.tag());

        let acquired: Option<String> = redis::cmd("SET")
            .arg(&self.key)
            .arg(&value)
            .arg("NX")
            .arg("EX")
            .arg(self.lease.as_secs().max(1))
            .query_async(&mut self.redis.clone())
            .await?;

        if acquired.is_some() {
            debug!(key = %self.key, priority = priority.tag(), "cache lock acquired");
            let guard = CacheLockGuard::start(
                self.redis.clone(),
                self.key.clone(),
                value,
                self.lease,
            );
            return Ok(LockAttempt::Acquired(guard));
        }

        // Somebody holds it; inspect the priority tag.
        let holder: Option<String> = redis::cmd("GET")
            .arg(&self.key)
            .query_async(&mut self.redis.clone())
            .await?;
        let holder_priority = holder
            .as_deref()
            .and_then(|v| v.split(':').next())
            .and_then(LockPriority::from_tag);
        match holder_priority {
            Some(LockPriority::P1) => Ok(LockAttempt::HeldByRebuild),
            _ => Ok(LockAttempt::Held),
        }
    }

    /// Acquire at P1 or fail with `rebuild_in_progress` / lock contention.
    pub async fn acquire_exclusive(&self) -> EngineResult<CacheLockGuard> {
        match self.try_acquire(LockPriority::P1).await? {
            LockAttempt::Acquired(guard) => Ok(guard),
            LockAttempt::HeldByRebuild | LockAttempt::Held => Err(EngineError::RebuildInProgress),
        }
    }
}

/// Held lock. Renewed by a background heartbeat; released explicitly or,
/// failing that, by lease expiry.
pub struct CacheLockGuard {
    redis: ConnectionManager,
    key: String,
    value: String,
    heartbeat: Option<JoinHandle<()>>,
}

impl CacheLockGuard {
    fn start(
        redis: ConnectionManager,
        key: String,
        value: String,
        lease: Duration,
    ) -> Self {
        let heartbeat = {
            let mut conn = redis.clone();
            let key = key.clone();
            let value = value.clone();
            let interval = lease / 3;
            let lease_secs = lease.as_secs().max(1);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    // Renew only while we still own the key.
                    let script = r#"
                        if redis.call('GET', KEYS[1]) == ARGV[1] then
                            return redis.call('EXPIRE', KEYS[1], ARGV[2])
                        end
                        return 0
                    "#;
                    let renewed: Result<i64, _> = redis::cmd("EVAL")
                        .arg(script)
                        .arg(1)
                        .arg(&key)
                        .arg(&value)
                        .arg(lease_secs)
                        .query_async(&mut conn)
                        .await;
                    match renewed {
                        Ok(1) => {}
                        Ok(_) => {
                            warn!(key = %key, "cache lock lost before release");
                            break;
                        }
                        Err(e) => {
                            warn!(key = %key, error = %e, "cache lock heartbeat failed");
                        }
                    }
                }
            })
        };
        Self {
            redis,
            key,
            value,
            heartbeat: Some(heartbeat),
        }
    }

    /// Release the lock if still owned. Always stops the heartbeat.
    pub async fn release(mut self) {
        if let Some(hb) = self.heartbeat.take() {
            hb.abort();
        }
        let script = r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                return redis.call('DEL', KEYS[1])
            end
            return 0
        "#;
        let result: Result<i64, _> = redis::cmd("EVAL")
            .arg(script)
            .arg(1)
            .arg(&self.key)
            .arg(&self.value)
            .query_async(&mut self.redis.clone())
            .await;
        if let Err(e) = result {
            // Lease expiry will reclaim it.
            warn!(key = %self.key, error = %e, "cache lock release failed");
        }
    }
}

impl Drop for CacheLockGuard {
    fn drop(&mut self) {
        if let Some(hb) = self.heartbeat.take() {
            hb.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(LockPriority::P1 < LockPriority::P2);
        assert!(LockPriority::P3 < LockPriority::P4);
    }

    #[test]
    fn test_tag_round_trip() {
        for p in [
            LockPriority::P1,
            LockPriority::P2,
            LockPriority::P3,
            LockPriority::P4,
        ] {
            assert_eq!(LockPriority::from_tag(p.tag()).unwrap(), p);
        }
        assert!(LockPriority::from_tag("p9").is_none());
    }
}
