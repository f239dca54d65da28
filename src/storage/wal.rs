//! Write-Ahead Log for mutating file operations.
//!
//! Every upload, metadata update, and delete opens a WAL row before
//! touching bytes and closes it (committed or rolled back) afterwards. The
//! partial unique index on active rows gives the per-file serialization
//! guarantee: a second mutation on the same file fails fast instead of
//! interleaving.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::postgres::PgPool;
use sqlx::Row;
use uuid::Uuid;

use crate::cache::tables::TableNames;
use crate::core::error::{EngineError, EngineResult};

/// Mutation classes recorded in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalOperation {
    Upload,
    Delete,
    UpdateMetadata,
    ModeChange,
}

impl WalOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            WalOperation::Upload => "upload",
            WalOperation::Delete => "delete",
            WalOperation::UpdateMetadata => "update_metadata",
            WalOperation::ModeChange => "mode_change",
        }
    }
}

impl std::str::FromStr for WalOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upload" => Ok(WalOperation::Upload),
            "delete" => Ok(WalOperation::Delete),
            "update_metadata" => Ok(WalOperation::UpdateMetadata),
            "mode_change" => Ok(WalOperation::ModeChange),
            other => Err(format!("unknown wal operation: {other}")),
        }
    }
}

/// Row lifecycle. `Committed`, `RolledBack`, and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalStatus {
    Pending,
    InProgress,
    Committed,
    RolledBack,
    Failed,
}

impl WalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WalStatus::Pending => "pending",
            WalStatus::InProgress => "in_progress",
            WalStatus::Committed => "committed",
            WalStatus::RolledBack => "rolled_back",
            WalStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WalStatus::Committed | WalStatus::RolledBack | WalStatus::Failed
        )
    }
}

impl std::str::FromStr for WalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WalStatus::Pending),
            "in_progress" => Ok(WalStatus::InProgress),
            "committed" => Ok(WalStatus::Committed),
            "rolled_back" => Ok(WalStatus::RolledBack),
            "failed" => Ok(WalStatus::Failed),
            other => Err(format!("unknown wal status: {other}")),
        }
    }
}

/// A materialized WAL row.
#[derive(Debug, Clone)]
pub struct WalEntry {
    pub wal_id: i64,
    pub transaction_id: Uuid,
    pub saga_id: Option<Uuid>,
    pub operation_type: WalOperation,
    pub status: WalStatus,
    pub file_id: Option<Uuid>,
    pub payload: Value,
    pub compensation_data: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub committed_at: Option<DateTime<Utc>>,
}

/// WAL store over the `{prefix}_wal` table.
#[derive(Clone)]
pub struct WalStore {
    pool: PgPool,
    tables: TableNames,
    enabled: bool,
}

impl WalStore {
    pub fn new(pool: PgPool, tables: TableNames, enabled: bool) -> Self {
        Self {
            pool,
            tables,
            enabled,
        }
    }

    /// Create the table and the active-row exclusivity index.
    pub async fn ensure_schema(&self) -> EngineResult<()> {
        let wal = &self.tables.wal;
        sqlx::query(&format!(
            r#"CREATE TABLE IF NOT EXISTS {wal} (
                wal_id BIGSERIAL PRIMARY KEY,
                transaction_id UUID NOT NULL,
                saga_id UUID,
                operation_type TEXT NOT NULL,
                status TEXT NOT NULL,
                file_id UUID,
                payload JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                compensation_data JSONB,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                committed_at TIMESTAMPTZ
            )"#
        ))
        .execute(&self.pool)
        .await?;

        // At most one non-terminal row per file.
        sqlx::query(&format!(
            r#"CREATE UNIQUE INDEX IF NOT EXISTS {wal}_active_file_idx
               ON {wal} (file_id)
               WHERE status IN ('pending', 'in_progress') AND file_id IS NOT NULL"#
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {wal}_status_idx ON {wal} (status, created_at)"
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Open a pending entry. Fails with `conflict_wal_in_flight` when the
    /// file already has an active row.
    pub async fn open(
        &self,
        operation: WalOperation,
        file_id: Option<Uuid>,
        payload: Value,
    ) -> EngineResult<Option<i64>> {
        if !self.enabled {
            return Ok(None);
        }
        let wal = &self.tables.wal;
        let result = sqlx::query(&format!(
            r#"INSERT INTO {wal}
                   (transaction_id, operation_type, status, file_id, payload)
               VALUES ($1, $2, 'pending', $3, $4)
               RETURNING wal_id"#
        ))
        .bind(Uuid::new_v4())
        .bind(operation.as_str())
        .bind(file_id)
        .bind(&payload)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => Ok(Some(row.get::<i64, _>("wal_id"))),
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some("23505") => Err(
                EngineError::ConflictWalInFlight(
                    file_id.map(|id| id.to_string()).unwrap_or_default(),
                ),
            ),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn mark_in_progress(&self, wal_id: Option<i64>) -> EngineResult<()> {
        self.set_status(wal_id, WalStatus::InProgress, None).await
    }

    pub async fn commit(&self, wal_id: Option<i64>) -> EngineResult<()> {
        self.set_status(wal_id, WalStatus::Committed, None).await
    }

    /// Roll back, recording what was removed so an operator can audit the
    /// compensation.
    pub async fn roll_back(
        &self,
        wal_id: Option<i64>,
        compensation: Option<Value>,
    ) -> EngineResult<()> {
        self.set_status(wal_id, WalStatus::RolledBack, compensation)
            .await
    }

    pub async fn fail(&self, wal_id: Option<i64>, compensation: Option<Value>) -> EngineResult<()> {
        self.set_status(wal_id, WalStatus::Failed, compensation).await
    }

    async fn set_status(
        &self,
        wal_id: Option<i64>,
        status: WalStatus,
        compensation: Option<Value>,
    ) -> EngineResult<()> {
        let Some(wal_id) = wal_id else {
            return Ok(()); // WAL disabled
        };
        let wal = &self.tables.wal;
        let committed_at = if status == WalStatus::Committed {
            Some(Utc::now())
        } else {
            None
        };
        sqlx::query(&format!(
            r#"UPDATE {wal}
               SET status = $1,
                   committed_at = COALESCE($2, committed_at),
                   compensation_data = COALESCE($3, compensation_data)
               WHERE wal_id = $4"#
        ))
        .bind(status.as_str())
        .bind(committed_at)
        .bind(compensation)
        .bind(wal_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All non-terminal rows, oldest first. Used by the startup recovery
    /// sweep.
    pub async fn non_terminal(&self) -> EngineResult<Vec<WalEntry>> {
        if !self.enabled {
            return Ok(Vec::new());
        }
        let wal = &self.tables.wal;
        let rows = sqlx::query(&format!(
            r#"SELECT wal_id, transaction_id, saga_id, operation_type, status,
                      file_id, payload, compensation_data, created_at, committed_at
               FROM {wal}
               WHERE status IN ('pending', 'in_progress')
               ORDER BY wal_id"#
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_entry).collect()
    }

    fn row_to_entry(row: sqlx::postgres::PgRow) -> EngineResult<WalEntry> {
        let operation: String = row.get("operation_type");
        let status: String = row.get("status");
        Ok(WalEntry {
            wal_id: row.get("wal_id"),
            transaction_id: row.get("transaction_id"),
            saga_id: row.get("saga_id"),
            operation_type: operation
                .parse()
                .map_err(EngineError::Internal)?,
            status: status.parse().map_err(EngineError::Internal)?,
            file_id: row.get("file_id"),
            payload: row.get("payload"),
            compensation_data: row.get("compensation_data"),
            created_at: row.get("created_at"),
            committed_at: row.get("committed_at"),
        })
    }

    /// Drop terminal rows older than the retention window. Returns the
    /// number of rows removed.
    pub async fn gc_terminal(&self, retention_days: u32) -> EngineResult<u64> {
        if !self.enabled {
            return Ok(0);
        }
        let wal = &self.tables.wal;
        let cutoff = Utc::now() - Duration::days(retention_days as i64);
        let result = sqlx::query(&format!(
            r#"DELETE FROM {wal}
               WHERE status IN ('committed', 'rolled_back', 'failed')
                 AND created_at < $1"#
        ))
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// Forward data recorded when an upload opens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadPayload {
    pub storage_path: String,
    pub storage_filename: String,
    pub declared_size: u64,
    pub uploaded_by: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_terminality() {
        assert!(!WalStatus::Pending.is_terminal());
        assert!(!WalStatus::InProgress.is_terminal());
        assert!(WalStatus::Committed.is_terminal());
        assert!(WalStatus::RolledBack.is_terminal());
        assert!(WalStatus::Failed.is_terminal());
    }

    #[test]
    fn test_operation_round_trip() {
        for op in [
            WalOperation::Upload,
            WalOperation::Delete,
            WalOperation::UpdateMetadata,
            WalOperation::ModeChange,
        ] {
            assert_eq!(op.as_str().parse::<WalOperation>().unwrap(), op);
        }
    }

    #[test]
    fn test_upload_payload_serializes_flat() {
        let payload = UploadPayload {
            storage_path: "2025/11/08/10".into(),
            storage_filename: "f.pdf".into(),
            declared_size: 1024,
            uploaded_by: "alice".into(),
        };
        let v = serde_json::to_value(&payload).unwrap();
        assert_eq!(v["declared_size"], 1024);
        assert_eq!(v["storage_path"], "2025/11/08/10");
    }
}
