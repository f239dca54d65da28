//! Storage backend driver contract.
//!
//! A backend owns the physical bytes and the sidecar files under a single
//! base (a directory tree or a bucket). The engine talks to it through this
//! capability set and never touches paths directly, so local-filesystem and
//! S3/MinIO variants are interchangeable.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::io::AsyncRead;

use crate::core::error::{EngineError, EngineResult};

/// Inclusive byte range, resolved against a known object size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    /// Inclusive end offset.
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes covered; a resolved range is never empty.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Result of `stat_object`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectStat {
    pub size_bytes: u64,
}

/// Streamed object body.
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

/// In-flight upload handle.
///
/// Bytes land in a temporary location; `finalize` makes them durable and
/// visible atomically, `abort` removes every trace. Exactly one of the two
/// must be called.
#[async_trait]
pub trait ObjectUpload: Send {
    async fn write_chunk(&mut self, chunk: &[u8]) -> EngineResult<()>;

    /// Flush, fsync, and atomically move the temp into its final key.
    async fn finalize(self: Box<Self>) -> EngineResult<()>;

    /// Discard the temp data.
    async fn abort(self: Box<Self>) -> EngineResult<()>;
}

/// Capability set every backend variant implements.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Begin a streamed upload for `key`. The hour-bucket directory is
    /// created on demand.
    async fn begin_upload(&self, key: &str) -> EngineResult<Box<dyn ObjectUpload>>;

    /// Open the object for reading, optionally restricted to a resolved
    /// byte range.
    async fn read_object(&self, key: &str, range: Option<ByteRange>) -> EngineResult<ObjectReader>;

    async fn stat_object(&self, key: &str) -> EngineResult<Option<ObjectStat>>;

    async fn delete_object(&self, key: &str) -> EngineResult<()>;

    /// List object keys under a prefix, sidecars included.
    async fn list_prefix(&self, prefix: &str) -> EngineResult<Vec<String>>;

    /// Write a sidecar atomically: temp + fsync + rename on local, a single
    /// PUT on S3 (where object replacement is already atomic).
    async fn write_sidecar_atomic(&self, key: &str, bytes: &[u8]) -> EngineResult<()>;

    /// Read a sidecar in full; `None` when absent.
    async fn read_sidecar(&self, key: &str) -> EngineResult<Option<Vec<u8>>>;

    /// Measure `(total, used)` bytes for this backend.
    async fn capacity(&self) -> EngineResult<(u64, u64)>;
}

/// Retry policy for transient backend errors inside a single operation.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

/// Run `op` up to `policy.attempts` times, backing off exponentially with
/// jitter between attempts. Only transient errors are retried.
pub async fn with_retries<T, F, Fut>(policy: RetryPolicy, mut op: F) -> EngineResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = EngineResult<T>>,
{
    let mut last: Option<EngineError> = None;
    for attempt in 0..policy.attempts {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt + 1 < policy.attempts => {
                let backoff = policy.base_delay * 2u32.saturating_pow(attempt);
                let jitter = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 2);
                tokio::time::sleep(backoff + Duration::from_millis(jitter)).await;
                last = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last.unwrap_or_else(|| EngineError::Internal("retry loop exhausted".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_byte_range_len() {
        assert_eq!(ByteRange { start: 0, end: 0 }.len(), 1);
        assert_eq!(ByteRange { start: 10, end: 19 }.len(), 10);
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(1),
        };
        let result = with_retries(policy, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(EngineError::BackendUnavailable("flaky".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_transient_not_retried() {
        let calls = AtomicU32::new(0);
        let result: EngineResult<()> = with_retries(RetryPolicy::default(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(EngineError::NotFound("x".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
