//! Storage-element records and the Admin-side sync loop.
//!
//! The Admin polls each element's unauthenticated `/info` endpoint; the
//! element never pushes. Mode is stored as reported and never written
//! back. An element that misses enough consecutive polls is marked
//! offline and published as such so consumers stop selecting it; the
//! first successful poll brings it back to operational.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use sqlx::Row;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::error::{EngineError, EngineResult};
use crate::registry::client::{HealthStatus, RegistryClient, RegistryRecord};
use crate::storage::capacity::CapacitySnapshot;
use crate::storage::mode::SeMode;

/// Discovery payload served by `GET /api/v1/info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoPayload {
    pub name: String,
    pub display_name: String,
    pub version: String,
    pub mode: SeMode,
    pub storage_type: String,
    pub base_path: String,
    pub capacity_bytes: u64,
    pub used_bytes: u64,
    pub file_count: u64,
    pub status: ElementStatus,
}

/// Operational status as tracked by the Admin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementStatus {
    Operational,
    Degraded,
    Offline,
}

impl ElementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementStatus::Operational => "operational",
            ElementStatus::Degraded => "degraded",
            ElementStatus::Offline => "offline",
        }
    }
}

impl std::str::FromStr for ElementStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "operational" => Ok(ElementStatus::Operational),
            "degraded" => Ok(ElementStatus::Degraded),
            "offline" => Ok(ElementStatus::Offline),
            other => Err(format!("unknown element status: {other}")),
        }
    }
}

/// A registered storage element.
#[derive(Debug, Clone, Serialize)]
pub struct ElementRecord {
    pub id: Uuid,
    pub element_id: String,
    pub display_name: String,
    pub endpoint: String,
    pub mode: SeMode,
    pub storage_type: String,
    pub capacity_bytes: u64,
    pub used_bytes: u64,
    pub file_count: u64,
    pub priority: i64,
    pub status: ElementStatus,
    pub consecutive_failures: i32,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
}

/// Fleet totals for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct FleetSummary {
    pub element_count: u64,
    pub operational_count: u64,
    pub offline_count: u64,
    pub capacity_bytes: u64,
    pub used_bytes: u64,
    pub file_count: u64,
}

/// HTTP client for element endpoints.
#[derive(Clone)]
pub struct SeClient {
    http: reqwest::Client,
}

impl SeClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("reqwest client build"),
        }
    }

    pub async fn get_info(&self, endpoint: &str) -> EngineResult<InfoPayload> {
        let url = format!("{}/api/v1/info", endpoint.trim_end_matches('/'));
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::BackendUnavailable(format!("info poll failed: {e}")))?;
        if !response.status().is_success() {
            return Err(EngineError::BackendUnavailable(format!(
                "info poll returned {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| EngineError::BackendUnavailable(format!("info payload: {e}")))
    }

    /// Physical delete on behalf of the garbage collector.
    pub async fn gc_delete(
        &self,
        endpoint: &str,
        file_id: Uuid,
        bearer: &str,
    ) -> EngineResult<()> {
        let url = format!("{}/api/v1/gc/{file_id}", endpoint.trim_end_matches('/'));
        let response = self
            .http
            .delete(&url)
            .bearer_auth(bearer)
            .send()
            .await
            .map_err(|e| EngineError::BackendUnavailable(format!("gc delete failed: {e}")))?;
        match response.status().as_u16() {
            204 | 404 => Ok(()),
            other => Err(EngineError::BackendUnavailable(format!(
                "gc delete returned {other}"
            ))),
        }
    }

    pub async fn gc_exists(
        &self,
        endpoint: &str,
        file_id: Uuid,
        bearer: &str,
    ) -> EngineResult<bool> {
        let url = format!(
            "{}/api/v1/gc/{file_id}/exists",
            endpoint.trim_end_matches('/')
        );
        let response = self
            .http
            .get(&url)
            .bearer_auth(bearer)
            .send()
            .await
            .map_err(|e| EngineError::BackendUnavailable(format!("gc exists failed: {e}")))?;
        if !response.status().is_success() {
            return Err(EngineError::BackendUnavailable(format!(
                "gc exists returned {}",
                response.status()
            )));
        }
        #[derive(Deserialize)]
        struct Exists {
            exists: bool,
        }
        let body: Exists = response
            .json()
            .await
            .map_err(|e| EngineError::BackendUnavailable(format!("gc exists payload: {e}")))?;
        Ok(body.exists)
    }

    /// Page file ids and upload instants from an element's search surface.
    pub async fn list_files(
        &self,
        endpoint: &str,
        bearer: &str,
        limit: i64,
        offset: i64,
    ) -> EngineResult<Vec<(Uuid, DateTime<Utc>)>> {
        let url = format!(
            "{}/api/v1/files?limit={limit}&offset={offset}",
            endpoint.trim_end_matches('/')
        );
        let response = self
            .http
            .get(&url)
            .bearer_auth(bearer)
            .send()
            .await
            .map_err(|e| EngineError::BackendUnavailable(format!("file list failed: {e}")))?;
        if !response.status().is_success() {
            return Err(EngineError::BackendUnavailable(format!(
                "file list returned {}",
                response.status()
            )));
        }
        #[derive(Deserialize)]
        struct Page {
            items: Vec<Item>,
        }
        #[derive(Deserialize)]
        struct Item {
            file_id: Uuid,
            uploaded_at: DateTime<Utc>,
        }
        let page: Page = response
            .json()
            .await
            .map_err(|e| EngineError::BackendUnavailable(format!("file list payload: {e}")))?;
        Ok(page.items.into_iter().map(|i| (i.file_id, i.uploaded_at)).collect())
    }
}

/// Store over the `storage_elements` table.
#[derive(Clone)]
pub struct ElementStore {
    pool: PgPool,
}

impl ElementStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> EngineResult<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS storage_elements (
                id UUID PRIMARY KEY,
                element_id TEXT NOT NULL UNIQUE,
                display_name TEXT NOT NULL,
                endpoint TEXT NOT NULL,
                mode TEXT NOT NULL,
                storage_type TEXT NOT NULL,
                capacity_bytes BIGINT NOT NULL DEFAULT 0,
                used_bytes BIGINT NOT NULL DEFAULT 0,
                file_count BIGINT NOT NULL DEFAULT 0,
                priority BIGINT NOT NULL DEFAULT 100,
                status TEXT NOT NULL DEFAULT 'operational',
                consecutive_failures INT NOT NULL DEFAULT 0,
                last_seen_at TIMESTAMPTZ,
                registered_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )"#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Register or refresh an element from its discovery payload.
    pub async fn register(
        &self,
        endpoint: &str,
        priority: i64,
        info: &InfoPayload,
    ) -> EngineResult<ElementRecord> {
        sqlx::query(
            r#"INSERT INTO storage_elements
                   (id, element_id, display_name, endpoint, mode, storage_type,
                    capacity_bytes, used_bytes, file_count, priority, status,
                    consecutive_failures, last_seen_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'operational', 0, now())
               ON CONFLICT (element_id) DO UPDATE SET
                   display_name = EXCLUDED.display_name,
                   endpoint = EXCLUDED.endpoint,
                   mode = EXCLUDED.mode,
                   storage_type = EXCLUDED.storage_type,
                   capacity_bytes = EXCLUDED.capacity_bytes,
                   used_bytes = EXCLUDED.used_bytes,
                   file_count = EXCLUDED.file_count,
                   priority = EXCLUDED.priority,
                   status = 'operational',
                   consecutive_failures = 0,
                   last_seen_at = now()"#,
        )
        .bind(Uuid::new_v4())
        .bind(&info.name)
        .bind(&info.display_name)
        .bind(endpoint)
        .bind(info.mode.as_str())
        .bind(&info.storage_type)
        .bind(info.capacity_bytes as i64)
        .bind(info.used_bytes as i64)
        .bind(info.file_count as i64)
        .bind(priority)
        .execute(&self.pool)
        .await?;

        self.find(&info.name)
            .await?
            .ok_or_else(|| EngineError::Internal("element vanished after register".into()))
    }

    pub async fn find(&self, element_id: &str) -> EngineResult<Option<ElementRecord>> {
        let row = sqlx::query("SELECT * FROM storage_elements WHERE element_id = $1")
            .bind(element_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::row_to_record).transpose()
    }

    pub async fn list(&self) -> EngineResult<Vec<ElementRecord>> {
        let rows = sqlx::query("SELECT * FROM storage_elements ORDER BY priority, element_id")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Self::row_to_record).collect()
    }

    /// Record a successful poll.
    pub async fn mark_seen(&self, element_id: &str, info: &InfoPayload) -> EngineResult<()> {
        sqlx::query(
            r#"UPDATE storage_elements
               SET mode = $1, capacity_bytes = $2, used_bytes = $3, file_count = $4,
                   status = 'operational', consecutive_failures = 0, last_seen_at = now()
               WHERE element_id = $5"#,
        )
        .bind(info.mode.as_str())
        .bind(info.capacity_bytes as i64)
        .bind(info.used_bytes as i64)
        .bind(info.file_count as i64)
        .bind(element_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a failed poll; flips to offline at the threshold. Returns
    /// the new failure count and whether the element just went offline.
    pub async fn mark_failure(
        &self,
        element_id: &str,
        offline_threshold: u32,
    ) -> EngineResult<(i32, bool)> {
        let row = sqlx::query(
            r#"UPDATE storage_elements
               SET consecutive_failures = consecutive_failures + 1,
                   status = CASE
                       WHEN consecutive_failures + 1 >= $1 THEN 'offline'
                       ELSE status
                   END
               WHERE element_id = $2
               RETURNING consecutive_failures, status"#,
        )
        .bind(offline_threshold as i32)
        .bind(element_id)
        .fetch_one(&self.pool)
        .await?;
        let failures: i32 = row.get("consecutive_failures");
        let status: String = row.get("status");
        Ok((failures, status == "offline" && failures == offline_threshold as i32))
    }

    /// Delete; only allowed once the element is empty.
    pub async fn delete(&self, element_id: &str) -> EngineResult<()> {
        let record = self
            .find(element_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(element_id.to_string()))?;
        if record.file_count > 0 {
            return Err(EngineError::Validation(format!(
                "element holds {} files; empty it first",
                record.file_count
            )));
        }
        sqlx::query("DELETE FROM storage_elements WHERE element_id = $1")
            .bind(element_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn summary(&self) -> EngineResult<FleetSummary> {
        let row = sqlx::query(
            r#"SELECT count(*) AS element_count,
                      count(*) FILTER (WHERE status = 'operational') AS operational_count,
                      count(*) FILTER (WHERE status = 'offline') AS offline_count,
                      COALESCE(sum(capacity_bytes), 0) AS capacity_bytes,
                      COALESCE(sum(used_bytes), 0) AS used_bytes,
                      COALESCE(sum(file_count), 0) AS file_count
               FROM storage_elements"#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(FleetSummary {
            element_count: row.get::<i64, _>("element_count") as u64,
            operational_count: row.get::<i64, _>("operational_count") as u64,
            offline_count: row.get::<i64, _>("offline_count") as u64,
            capacity_bytes: row.get::<i64, _>("capacity_bytes") as u64,
            used_bytes: row.get::<i64, _>("used_bytes") as u64,
            file_count: row.get::<i64, _>("file_count") as u64,
        })
    }

    /// DB-backed fallback for placement when the registry is down:
    /// operational elements of a mode with enough free space, best
    /// priority first.
    pub async fn available(
        &self,
        mode: SeMode,
        min_free_bytes: u64,
    ) -> EngineResult<Vec<ElementRecord>> {
        let rows = sqlx::query(
            r#"SELECT * FROM storage_elements
               WHERE mode = $1 AND status = 'operational'
                 AND capacity_bytes - used_bytes >= $2
               ORDER BY priority, element_id"#,
        )
        .bind(mode.as_str())
        .bind(min_free_bytes as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Self::row_to_record).collect()
    }

    fn row_to_record(row: sqlx::postgres::PgRow) -> EngineResult<ElementRecord> {
        let mode: String = row.get("mode");
        let status: String = row.get("status");
        Ok(ElementRecord {
            id: row.get("id"),
            element_id: row.get("element_id"),
            display_name: row.get("display_name"),
            endpoint: row.get("endpoint"),
            mode: mode.parse().map_err(EngineError::Internal)?,
            storage_type: row.get("storage_type"),
            capacity_bytes: row.get::<i64, _>("capacity_bytes") as u64,
            used_bytes: row.get::<i64, _>("used_bytes") as u64,
            file_count: row.get::<i64, _>("file_count") as u64,
            priority: row.get("priority"),
            status: status.parse().map_err(EngineError::Internal)?,
            consecutive_failures: row.get("consecutive_failures"),
            last_seen_at: row.get("last_seen_at"),
            registered_at: row.get("registered_at"),
        })
    }
}

/// Periodic fleet synchronization.
pub struct ElementSync {
    store: ElementStore,
    client: SeClient,
    registry: RegistryClient,
    interval: Duration,
    offline_threshold: u32,
}

impl ElementSync {
    pub fn new(
        store: ElementStore,
        client: SeClient,
        registry: RegistryClient,
        interval: Duration,
        offline_threshold: u32,
    ) -> Self {
        Self {
            store,
            client,
            registry,
            interval,
            offline_threshold,
        }
    }

    /// Sync one element; returns its refreshed record.
    pub async fn sync_one(&self, record: &ElementRecord) -> EngineResult<ElementRecord> {
        match self.client.get_info(&record.endpoint).await {
            Ok(info) => {
                if info.name != record.element_id {
                    warn!(
                        expected = %record.element_id,
                        reported = %info.name,
                        "element identity mismatch during sync"
                    );
                }
                self.store.mark_seen(&record.element_id, &info).await?;
            }
            Err(e) => {
                let (failures, went_offline) = self
                    .store
                    .mark_failure(&record.element_id, self.offline_threshold)
                    .await?;
                warn!(
                    element_id = %record.element_id,
                    failures,
                    error = %e,
                    "element sync failed"
                );
                if went_offline {
                    info!(element_id = %record.element_id, "element marked offline");
                    self.publish_offline(record).await;
                }
            }
        }
        self.store
            .find(&record.element_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(record.element_id.clone()))
    }

    /// Publish an offline record so registry consumers stop selecting the
    /// element even before its own TTL lapses.
    async fn publish_offline(&self, record: &ElementRecord) {
        let snapshot =
            CapacitySnapshot::new(record.mode, record.capacity_bytes, record.used_bytes);
        let registry_record = RegistryRecord::from_snapshot(
            &record.element_id,
            record.mode,
            &record.endpoint,
            record.priority,
            HealthStatus::Offline,
            &snapshot,
            Utc::now(),
        );
        if let Err(e) = self
            .registry
            .publish(&registry_record, self.interval.as_secs() * 3)
            .await
        {
            warn!(element_id = %record.element_id, error = %e, "offline publish failed");
        }
    }

    pub async fn sync_all(&self) -> EngineResult<u64> {
        let mut synced = 0;
        for record in self.store.list().await? {
            if self.sync_one(&record).await.is_ok() {
                synced += 1;
            }
        }
        Ok(synced)
    }

    /// Long-running sync loop.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(interval_secs = self.interval.as_secs(), "element sync loop started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sync_all().await {
                        warn!(error = %e, "element sync round failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_payload_round_trip() {
        let payload = InfoPayload {
            name: "se-1".into(),
            display_name: "SE One".into(),
            version: "0.3.0".into(),
            mode: SeMode::Rw,
            storage_type: "local".into(),
            base_path: "/var/lib/artstore".into(),
            capacity_bytes: 1 << 40,
            used_bytes: 1 << 30,
            file_count: 1200,
            status: ElementStatus::Operational,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["mode"], "rw");
        assert_eq!(json["status"], "operational");
        let parsed: InfoPayload = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.name, "se-1");
        assert_eq!(parsed.mode, SeMode::Rw);
    }

    #[test]
    fn test_element_status_parse() {
        assert_eq!(
            "offline".parse::<ElementStatus>().unwrap(),
            ElementStatus::Offline
        );
        assert!("down".parse::<ElementStatus>().is_err());
    }
}
