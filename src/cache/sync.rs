//! Cache synchronization: manual rebuilds, consistency checks, cleanup,
//! and the lazy per-entry refresh.
//!
//! All operations funnel through the element's distributed cache lock.
//! Rebuilds (P1) take it exclusively; the consistency check (P2) and the
//! expired cleanup (P4) take it when free; the lazy refresh (P3) is
//! strictly non-blocking and backs off to serving stale rows whenever a
//! rebuild holds the lock. The sidecars on disk are the truth the cache
//! converges to, so a timed-out rebuild leaves partial progress behind
//! rather than rolling anything back.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::store::MetadataCache;
use crate::core::error::{EngineError, EngineResult};
use crate::registry::lock::{CacheLock, LockAttempt, LockPriority};
use crate::storage::backend::StorageBackend;
use crate::storage::naming::SIDECAR_SUFFIX;
use crate::storage::sidecar::FileAttributes;

/// Counters from a rebuild pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RebuildReport {
    pub scanned: u64,
    pub created: u64,
    pub updated: u64,
    pub deleted: u64,
    /// Per-file parse or upsert failures; the pass continues past them.
    pub errors: Vec<String>,
    pub timed_out: bool,
}

/// Dry-run consistency findings.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsistencyReport {
    /// Cache rows without a sidecar on disk.
    pub orphan_cache: u64,
    /// Sidecars on disk without a cache row.
    pub orphan_attr: u64,
    /// Rows past their TTL.
    pub expired_cache: u64,
    /// Sampled ids for each bucket, capped.
    pub orphan_cache_sample: Vec<Uuid>,
    pub orphan_attr_sample: Vec<String>,
}

const SAMPLE_CAP: usize = 20;

/// Synchronizer for one element's cache.
pub struct CacheSynchronizer {
    cache: MetadataCache,
    backend: Arc<dyn StorageBackend>,
    lock: CacheLock,
    rebuild_timeout: Duration,
}

impl CacheSynchronizer {
    pub fn new(
        cache: MetadataCache,
        backend: Arc<dyn StorageBackend>,
        lock: CacheLock,
        rebuild_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            backend,
            lock,
            rebuild_timeout,
        }
    }

    /// Sidecar keys currently on disk.
    async fn sidecar_keys(&self) -> EngineResult<Vec<String>> {
        let keys = self.backend.list_prefix("").await?;
        Ok(keys
            .into_iter()
            .filter(|k| k.ends_with(SIDECAR_SUFFIX))
            .collect())
    }

    async fn read_attrs(&self, sidecar_key: &str) -> EngineResult<FileAttributes> {
        let bytes = self
            .backend
            .read_sidecar(sidecar_key)
            .await?
            .ok_or_else(|| EngineError::NotFound(sidecar_key.to_string()))?;
        FileAttributes::from_bytes(&bytes)
    }

    // ------------------------------------------------------------------
    // P1: full rebuild
    // ------------------------------------------------------------------

    /// Truncate and repopulate the cache from the sidecar tree.
    ///
    /// Holds the exclusive lock for the duration. On timeout the pass
    /// stops where it is; the rows written so far stay (the cache is
    /// eventually consistent under sidecar truth).
    pub async fn full_rebuild(&self) -> EngineResult<RebuildReport> {
        let guard = self.lock.acquire_exclusive().await?;
        let started = std::time::Instant::now();

        let result = tokio::time::timeout(self.rebuild_timeout, async {
            let pre_ids: HashSet<Uuid> = self.cache.all_file_ids().await?.into_iter().collect();
            self.cache.truncate().await?;

            let mut report = RebuildReport::default();
            let mut seen: HashSet<Uuid> = HashSet::new();
            for key in self.sidecar_keys().await? {
                report.scanned += 1;
                match self.read_attrs(&key).await {
                    Ok(attrs) => {
                        let file_id = attrs.file_id;
                        match self.cache.upsert(&attrs, Utc::now()).await {
                            Ok(_) => {
                                seen.insert(file_id);
                                if pre_ids.contains(&file_id) {
                                    report.updated += 1;
                                } else {
                                    report.created += 1;
                                }
                            }
                            Err(e) => report.errors.push(format!("{key}: {e}")),
                        }
                    }
                    Err(e) => report.errors.push(format!("{key}: {e}")),
                }
            }
            report.deleted = pre_ids.difference(&seen).count() as u64;
            Ok::<_, EngineError>(report)
        })
        .await;

        guard.release().await;

        match result {
            Ok(Ok(report)) => {
                info!(
                    scanned = report.scanned,
                    created = report.created,
                    updated = report.updated,
                    deleted = report.deleted,
                    errors = report.errors.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "full cache rebuild finished"
                );
                Ok(report)
            }
            Ok(Err(e)) => Err(e),
            Err(_elapsed) => {
                warn!(
                    timeout_secs = self.rebuild_timeout.as_secs(),
                    "full cache rebuild timed out; partial progress kept"
                );
                Ok(RebuildReport {
                    timed_out: true,
                    ..Default::default()
                })
            }
        }
    }

    // ------------------------------------------------------------------
    // P1: incremental rebuild
    // ------------------------------------------------------------------

    /// Add rows for sidecars that lack one. Never deletes; running it
    /// twice in a row is a no-op the second time.
    pub async fn incremental_rebuild(&self) -> EngineResult<RebuildReport> {
        let guard = self.lock.acquire_exclusive().await?;

        let result = async {
            let existing: HashSet<Uuid> = self.cache.all_file_ids().await?.into_iter().collect();
            let mut report = RebuildReport::default();
            for key in self.sidecar_keys().await? {
                report.scanned += 1;
                match self.read_attrs(&key).await {
                    Ok(attrs) if !existing.contains(&attrs.file_id) => {
                        match self.cache.upsert(&attrs, Utc::now()).await {
                            Ok(_) => report.created += 1,
                            Err(e) => report.errors.push(format!("{key}: {e}")),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => report.errors.push(format!("{key}: {e}")),
                }
            }
            Ok::<_, EngineError>(report)
        }
        .await;

        guard.release().await;
        result
    }

    // ------------------------------------------------------------------
    // P2: consistency check (dry run)
    // ------------------------------------------------------------------

    /// Compare cache rows against the sidecar tree without mutating
    /// either side.
    pub async fn consistency_check(&self) -> EngineResult<ConsistencyReport> {
        let guard = match self.lock.try_acquire(LockPriority::P2).await? {
            LockAttempt::Acquired(g) => g,
            LockAttempt::HeldByRebuild | LockAttempt::Held => {
                return Err(EngineError::RebuildInProgress)
            }
        };

        let result = async {
            let mut report = ConsistencyReport::default();

            let cached: HashSet<Uuid> = self.cache.all_file_ids().await?.into_iter().collect();
            let mut on_disk: HashSet<Uuid> = HashSet::new();
            for key in self.sidecar_keys().await? {
                match self.read_attrs(&key).await {
                    Ok(attrs) => {
                        if !cached.contains(&attrs.file_id) {
                            report.orphan_attr += 1;
                            if report.orphan_attr_sample.len() < SAMPLE_CAP {
                                report.orphan_attr_sample.push(key);
                            }
                        }
                        on_disk.insert(attrs.file_id);
                    }
                    Err(_) => {
                        // Unparseable sidecar counts as an attr orphan.
                        report.orphan_attr += 1;
                        if report.orphan_attr_sample.len() < SAMPLE_CAP {
                            report.orphan_attr_sample.push(key);
                        }
                    }
                }
            }
            for id in cached.difference(&on_disk) {
                report.orphan_cache += 1;
                if report.orphan_cache_sample.len() < SAMPLE_CAP {
                    report.orphan_cache_sample.push(*id);
                }
            }
            report.expired_cache = self.cache.expired_ids(i64::MAX).await?.len() as u64;
            Ok::<_, EngineError>(report)
        }
        .await;

        guard.release().await;
        result
    }

    // ------------------------------------------------------------------
    // P4: expired cleanup
    // ------------------------------------------------------------------

    /// Delete rows past their TTL. Informational; sidecars are never
    /// touched and the rows come back on the next read of those files.
    pub async fn cleanup_expired(&self) -> EngineResult<u64> {
        let guard = match self.lock.try_acquire(LockPriority::P4).await? {
            LockAttempt::Acquired(g) => g,
            LockAttempt::HeldByRebuild | LockAttempt::Held => {
                return Err(EngineError::RebuildInProgress)
            }
        };
        let result = self.cache.delete_expired().await;
        guard.release().await;
        result
    }

    // ------------------------------------------------------------------
    // P3: lazy per-entry rebuild
    // ------------------------------------------------------------------

    /// Refresh one row from its sidecar, non-blocking.
    ///
    /// Returns `false` when the lock is held (graceful degradation: the
    /// caller keeps serving the stale row) or when the sidecar is gone.
    pub async fn lazy_rebuild(&self, file_id: Uuid, sidecar_key: &str) -> EngineResult<bool> {
        let guard = match self.lock.try_acquire(LockPriority::P3).await? {
            LockAttempt::Acquired(g) => g,
            LockAttempt::HeldByRebuild | LockAttempt::Held => return Ok(false),
        };

        let result = async {
            match self.backend.read_sidecar(sidecar_key).await? {
                Some(bytes) => {
                    let attrs = FileAttributes::from_bytes(&bytes)?;
                    if attrs.file_id != file_id {
                        return Err(EngineError::Internal(format!(
                            "sidecar {sidecar_key} holds file_id {}, expected {file_id}",
                            attrs.file_id
                        )));
                    }
                    self.cache.upsert(&attrs, Utc::now()).await?;
                    Ok(true)
                }
                None => Ok(false),
            }
        }
        .await;

        guard.release().await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rebuild_report_serializes() {
        let report = RebuildReport {
            scanned: 10,
            created: 7,
            updated: 2,
            deleted: 1,
            errors: vec!["2025/11/08/10/x.attr.json: parse".into()],
            timed_out: false,
        };
        let v = serde_json::to_value(&report).unwrap();
        assert_eq!(v["scanned"], 10);
        assert_eq!(v["errors"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_consistency_report_defaults_empty() {
        let report = ConsistencyReport::default();
        assert_eq!(report.orphan_cache, 0);
        assert!(report.orphan_attr_sample.is_empty());
    }
}
