//! Garbage collection over the fleet.
//!
//! Three strategies per cycle, in order: expired temporary files, edit
//! copies of finalized files, and orphan objects with no registry entry.
//! Deletion is conservative: an orphan needs two "missing" observations
//! separated by the safety margin before its bytes go, and every failure
//! backs off exponentially to the next cycles instead of retrying inline.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::PgPool;
use sqlx::Row;
use tracing::{info, warn};
use uuid::Uuid;

use crate::admin::elements::{ElementStore, SeClient};
use crate::core::error::EngineResult;

/// Base backoff after a failed deletion; doubles per attempt.
const BACKOFF_BASE_SECS: i64 = 600;

/// Page size when sweeping an element's file listing.
const ORPHAN_PAGE: i64 = 500;

/// Counters from one GC cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GcReport {
    pub ttl_deleted: u64,
    pub finalized_deleted: u64,
    pub orphans_observed: u64,
    pub orphans_deleted: u64,
    pub failures: u64,
}

/// Admin-side file registry and orphan-observation bookkeeping.
#[derive(Clone)]
pub struct FileRegistry {
    pool: PgPool,
}

/// A registry row due for TTL deletion.
#[derive(Debug)]
pub struct ExpiredEntry {
    pub file_id: Uuid,
    pub element_id: String,
    pub gc_attempts: i32,
}

/// A finalized row whose edit copy is due for deletion.
#[derive(Debug)]
pub struct FinalizedEntry {
    pub file_id: Uuid,
    pub edit_element_id: String,
    pub gc_attempts: i32,
}

impl FileRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> EngineResult<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS file_registry (
                file_id UUID PRIMARY KEY,
                element_id TEXT NOT NULL,
                retention_policy TEXT NOT NULL DEFAULT 'permanent',
                ttl_expires_at TIMESTAMPTZ,
                state TEXT NOT NULL DEFAULT 'active',
                finalized_at TIMESTAMPTZ,
                edit_element_id TEXT,
                gc_attempts INT NOT NULL DEFAULT 0,
                next_attempt_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                soft_deleted_at TIMESTAMPTZ
            )"#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS gc_orphans (
                element_id TEXT NOT NULL,
                file_id UUID NOT NULL,
                first_observed_missing TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (element_id, file_id)
            )"#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Temporary entries past their TTL and past any backoff.
    pub async fn expired_temporaries(&self) -> EngineResult<Vec<ExpiredEntry>> {
        let rows = sqlx::query(
            r#"SELECT file_id, element_id, gc_attempts FROM file_registry
               WHERE retention_policy = 'temporary'
                 AND ttl_expires_at < now()
                 AND state <> 'soft_deleted'
                 AND (next_attempt_at IS NULL OR next_attempt_at <= now())"#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| ExpiredEntry {
                file_id: r.get("file_id"),
                element_id: r.get("element_id"),
                gc_attempts: r.get("gc_attempts"),
            })
            .collect())
    }

    /// Finalized entries still holding an edit copy past the margin.
    pub async fn finalized_with_edit_copy(
        &self,
        margin: Duration,
    ) -> EngineResult<Vec<FinalizedEntry>> {
        let rows = sqlx::query(
            r#"SELECT file_id, edit_element_id, gc_attempts FROM file_registry
               WHERE state = 'finalized'
                 AND edit_element_id IS NOT NULL
                 AND finalized_at < now() - make_interval(secs => $1)
                 AND (next_attempt_at IS NULL OR next_attempt_at <= now())"#,
        )
        .bind(margin.as_secs() as f64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| FinalizedEntry {
                file_id: r.get("file_id"),
                edit_element_id: r.get("edit_element_id"),
                gc_attempts: r.get("gc_attempts"),
            })
            .collect())
    }

    pub async fn mark_soft_deleted(&self, file_id: Uuid) -> EngineResult<()> {
        sqlx::query(
            r#"UPDATE file_registry
               SET state = 'soft_deleted', soft_deleted_at = now(),
                   gc_attempts = 0, next_attempt_at = NULL
               WHERE file_id = $1"#,
        )
        .bind(file_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn clear_edit_copy(&self, file_id: Uuid) -> EngineResult<()> {
        sqlx::query(
            r#"UPDATE file_registry
               SET edit_element_id = NULL, gc_attempts = 0, next_attempt_at = NULL
               WHERE file_id = $1"#,
        )
        .bind(file_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a deletion failure and schedule the retry.
    pub async fn record_failure(&self, file_id: Uuid, attempts: i32) -> EngineResult<()> {
        let delay = backoff_secs(attempts);
        sqlx::query(
            r#"UPDATE file_registry
               SET gc_attempts = $1,
                   next_attempt_at = now() + make_interval(secs => $2)
               WHERE file_id = $3"#,
        )
        .bind(attempts + 1)
        .bind(delay as f64)
        .bind(file_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn is_registered(&self, file_id: Uuid) -> EngineResult<bool> {
        let row = sqlx::query("SELECT 1 AS one FROM file_registry WHERE file_id = $1")
            .bind(file_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Record or fetch the first "missing from registry" observation.
    pub async fn observe_orphan(
        &self,
        element_id: &str,
        file_id: Uuid,
    ) -> EngineResult<DateTime<Utc>> {
        let row = sqlx::query(
            r#"INSERT INTO gc_orphans (element_id, file_id)
               VALUES ($1, $2)
               ON CONFLICT (element_id, file_id) DO UPDATE
                   SET element_id = EXCLUDED.element_id
               RETURNING first_observed_missing"#,
        )
        .bind(element_id)
        .bind(file_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("first_observed_missing"))
    }

    pub async fn forget_orphan(&self, element_id: &str, file_id: Uuid) -> EngineResult<()> {
        sqlx::query("DELETE FROM gc_orphans WHERE element_id = $1 AND file_id = $2")
            .bind(element_id)
            .bind(file_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Exponential backoff with a ceiling of one day.
pub fn backoff_secs(attempts: i32) -> i64 {
    let shift = attempts.clamp(0, 7) as u32;
    (BACKOFF_BASE_SECS << shift).min(86_400)
}

/// The garbage collector.
pub struct GarbageCollector {
    registry: FileRegistry,
    elements: ElementStore,
    client: SeClient,
    finalized_margin: Duration,
    orphan_margin: Duration,
    /// Bearer token provider for element calls; a fresh short-lived token
    /// per cycle.
    token_provider: Box<dyn Fn() -> EngineResult<String> + Send + Sync>,
}

impl GarbageCollector {
    pub fn new(
        registry: FileRegistry,
        elements: ElementStore,
        client: SeClient,
        finalized_margin: Duration,
        orphan_margin: Duration,
        token_provider: Box<dyn Fn() -> EngineResult<String> + Send + Sync>,
    ) -> Self {
        Self {
            registry,
            elements,
            client,
            finalized_margin,
            orphan_margin,
            token_provider,
        }
    }

    /// Run one full cycle: (a) TTL, (b) finalized, (c) orphans.
    pub async fn run_cycle(&self) -> EngineResult<GcReport> {
        let mut report = GcReport::default();
        let token = (self.token_provider)()?;

        self.collect_expired(&token, &mut report).await;
        self.collect_finalized(&token, &mut report).await;
        self.collect_orphans(&token, &mut report).await;

        info!(
            ttl_deleted = report.ttl_deleted,
            finalized_deleted = report.finalized_deleted,
            orphans_observed = report.orphans_observed,
            orphans_deleted = report.orphans_deleted,
            failures = report.failures,
            "gc cycle finished"
        );
        Ok(report)
    }

    /// Strategy (a): expired temporary files.
    async fn collect_expired(&self, token: &str, report: &mut GcReport) {
        let entries = match self.registry.expired_temporaries().await {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "gc: expired query failed");
                report.failures += 1;
                return;
            }
        };
        for entry in entries {
            let endpoint = match self.elements.find(&entry.element_id).await {
                Ok(Some(r)) => r.endpoint,
                _ => {
                    report.failures += 1;
                    continue;
                }
            };
            match self.client.gc_delete(&endpoint, entry.file_id, token).await {
                Ok(()) => {
                    if self.registry.mark_soft_deleted(entry.file_id).await.is_ok() {
                        report.ttl_deleted += 1;
                    }
                }
                Err(e) => {
                    warn!(file_id = %entry.file_id, error = %e, "gc: ttl delete failed");
                    let _ = self
                        .registry
                        .record_failure(entry.file_id, entry.gc_attempts)
                        .await;
                    report.failures += 1;
                }
            }
        }
    }

    /// Strategy (b): edit copies of finalized files past the margin.
    async fn collect_finalized(&self, token: &str, report: &mut GcReport) {
        let entries = match self
            .registry
            .finalized_with_edit_copy(self.finalized_margin)
            .await
        {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "gc: finalized query failed");
                report.failures += 1;
                return;
            }
        };
        for entry in entries {
            let endpoint = match self.elements.find(&entry.edit_element_id).await {
                Ok(Some(r)) => r.endpoint,
                _ => {
                    report.failures += 1;
                    continue;
                }
            };
            match self.client.gc_delete(&endpoint, entry.file_id, token).await {
                Ok(()) => {
                    if self.registry.clear_edit_copy(entry.file_id).await.is_ok() {
                        report.finalized_deleted += 1;
                    }
                }
                Err(e) => {
                    warn!(file_id = %entry.file_id, error = %e, "gc: edit copy delete failed");
                    let _ = self
                        .registry
                        .record_failure(entry.file_id, entry.gc_attempts)
                        .await;
                    report.failures += 1;
                }
            }
        }
    }

    /// Strategy (c): objects on an element with no registry entry.
    ///
    /// First sighting only records an observation; deletion happens on a
    /// later cycle, after the margin, once the entry is confirmed still
    /// missing. Files younger than the margin are skipped outright.
    async fn collect_orphans(&self, token: &str, report: &mut GcReport) {
        let elements = match self.elements.list().await {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "gc: element list failed");
                report.failures += 1;
                return;
            }
        };
        let margin = chrono::Duration::from_std(self.orphan_margin).unwrap_or_else(|_| chrono::Duration::zero());
        let now = Utc::now();

        for element in elements
            .iter()
            .filter(|e| e.status == crate::admin::elements::ElementStatus::Operational)
        {
            let mut offset = 0i64;
            loop {
                let page = match self
                    .client
                    .list_files(&element.endpoint, token, ORPHAN_PAGE, offset)
                    .await
                {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(element_id = %element.element_id, error = %e, "gc: file page failed");
                        report.failures += 1;
                        break;
                    }
                };
                let page_len = page.len() as i64;
                for (file_id, uploaded_at) in page {
                    if now - uploaded_at < margin {
                        continue; // too young to judge
                    }
                    match self.registry.is_registered(file_id).await {
                        Ok(true) => {
                            let _ = self.registry.forget_orphan(&element.element_id, file_id).await;
                        }
                        Ok(false) => {
                            report.orphans_observed += 1;
                            let first = match self
                                .registry
                                .observe_orphan(&element.element_id, file_id)
                                .await
                            {
                                Ok(t) => t,
                                Err(_) => continue,
                            };
                            // Second observation, separated by the margin.
                            if now - first >= margin {
                                match self
                                    .client
                                    .gc_delete(&element.endpoint, file_id, token)
                                    .await
                                {
                                    Ok(()) => {
                                        let _ = self
                                            .registry
                                            .forget_orphan(&element.element_id, file_id)
                                            .await;
                                        report.orphans_deleted += 1;
                                    }
                                    Err(e) => {
                                        warn!(file_id = %file_id, error = %e, "gc: orphan delete failed");
                                        report.failures += 1;
                                    }
                                }
                            }
                        }
                        Err(_) => report.failures += 1,
                    }
                }
                if page_len < ORPHAN_PAGE {
                    break;
                }
                offset += ORPHAN_PAGE;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(backoff_secs(0), 600);
        assert_eq!(backoff_secs(1), 1200);
        assert_eq!(backoff_secs(2), 2400);
        // Capped at a day regardless of attempt count.
        assert_eq!(backoff_secs(10), 76_800.min(86_400));
        assert!(backoff_secs(30) <= 86_400);
    }

    #[test]
    fn test_gc_report_serializes() {
        let report = GcReport {
            ttl_deleted: 3,
            finalized_deleted: 1,
            orphans_observed: 7,
            orphans_deleted: 2,
            failures: 0,
        };
        let v = serde_json::to_value(&report).unwrap();
        assert_eq!(v["ttl_deleted"], 3);
        assert_eq!(v["orphans_deleted"], 2);
    }
}
