//! PostgreSQL metadata cache.
//!
//! The `{prefix}_files` table is a disposable projection of the sidecars on
//! disk: every row can be rebuilt from its sidecar at any time, and rows
//! carry the TTL bookkeeping that drives lazy rebuild. Writes follow a
//! last-writer-wins policy keyed by the WAL commit instant so an out-of-
//! order upsert from a slow request cannot clobber newer state.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::cache::tables::TableNames;
use crate::core::error::{EngineError, EngineResult};
use crate::storage::mode::SeMode;
use crate::storage::sidecar::{DigitalSignature, FileAttributes};

/// Major schema version for the table group; a mismatch aborts startup.
pub const SCHEMA_MAJOR: i32 = 2;

/// A cache row joined with its TTL bookkeeping.
#[derive(Debug, Clone)]
pub struct CachedFile {
    pub attributes: FileAttributes,
    pub committed_at: DateTime<Utc>,
    pub cache_updated_at: DateTime<Utc>,
    pub cache_ttl_hours: i32,
}

impl CachedFile {
    /// Whether the row has outlived its TTL and should be lazily rebuilt.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.cache_updated_at + chrono::Duration::hours(self.cache_ttl_hours as i64) < now
    }
}

/// Search filters; all optional, combined with AND.
#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    /// Full-text query over filename, description, and tags.
    pub text: Option<String>,
    /// Every tag listed must be present.
    pub tags: Vec<String>,
    pub uploaded_by: Option<String>,
    pub min_size: Option<i64>,
    pub max_size: Option<i64>,
    pub uploaded_after: Option<DateTime<Utc>>,
    pub uploaded_before: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

impl SearchQuery {
    pub fn clamped(mut self) -> Self {
        self.limit = self.limit.clamp(1, 500);
        self.offset = self.offset.max(0);
        self
    }
}

/// Result of a search: matching rows plus expired ids seen along the way
/// (the caller may fire a lazy rebuild for those).
#[derive(Debug)]
pub struct SearchResult {
    pub items: Vec<CachedFile>,
    pub expired_ids: Vec<Uuid>,
}

/// Metadata cache store over the `{prefix}_files` table group.
#[derive(Clone)]
pub struct MetadataCache {
    pool: PgPool,
    tables: TableNames,
    default_ttl_hours: i32,
}

impl MetadataCache {
    pub fn new(pool: PgPool, tables: TableNames, default_ttl_hours: u32) -> Self {
        Self {
            pool,
            tables,
            default_ttl_hours: default_ttl_hours as i32,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn tables(&self) -> &TableNames {
        &self.tables
    }

    // ------------------------------------------------------------------
    // Schema
    // ------------------------------------------------------------------

    /// Create the table group and indexes. Identifiers are composed at
    /// bootstrap from the validated prefix.
    pub async fn ensure_schema(&self) -> EngineResult<()> {
        let files = &self.tables.files;
        sqlx::query(&format!(
            r#"CREATE TABLE IF NOT EXISTS {files} (
                file_id UUID PRIMARY KEY,
                original_filename TEXT NOT NULL,
                storage_filename TEXT NOT NULL,
                storage_path TEXT NOT NULL,
                size_bytes BIGINT NOT NULL,
                mime_type TEXT,
                sha256_hash TEXT NOT NULL,
                md5_hash TEXT,
                uploaded_by TEXT NOT NULL,
                uploaded_at TIMESTAMPTZ NOT NULL,
                retention_days INT NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL,
                version INT NOT NULL,
                schema_version TEXT NOT NULL,
                description TEXT,
                tags TEXT[] NOT NULL DEFAULT '{{}}',
                custom JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                digital_signature JSONB,
                committed_at TIMESTAMPTZ NOT NULL,
                cache_updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                cache_ttl_hours INT NOT NULL,
                search_vector TSVECTOR NOT NULL DEFAULT ''::tsvector
            )"#
        ))
        .execute(&self.pool)
        .await?;

        for ddl in [
            format!("CREATE INDEX IF NOT EXISTS {files}_uploaded_at_idx ON {files} (uploaded_at DESC)"),
            format!("CREATE INDEX IF NOT EXISTS {files}_uploaded_by_idx ON {files} (uploaded_by)"),
            format!("CREATE INDEX IF NOT EXISTS {files}_expires_at_idx ON {files} (expires_at)"),
            format!("CREATE INDEX IF NOT EXISTS {files}_tags_idx ON {files} USING GIN (tags)"),
            format!("CREATE INDEX IF NOT EXISTS {files}_search_idx ON {files} USING GIN (search_vector)"),
        ] {
            sqlx::query(&ddl).execute(&self.pool).await?;
        }

        let schema = &self.tables.schema_version;
        sqlx::query(&format!(
            r#"CREATE TABLE IF NOT EXISTS {schema} (
                major INT NOT NULL,
                minor INT NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )"#
        ))
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(&format!(
            "SELECT major FROM {schema} ORDER BY applied_at DESC LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await?;
        match row {
            None => {
                sqlx::query(&format!(
                    "INSERT INTO {schema} (major, minor) VALUES ($1, 0)"
                ))
                .bind(SCHEMA_MAJOR)
                .execute(&self.pool)
                .await?;
            }
            Some(row) => {
                let major: i32 = row.get("major");
                if major != SCHEMA_MAJOR {
                    return Err(EngineError::Internal(format!(
                        "schema major {major} does not match supported {SCHEMA_MAJOR}"
                    )));
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Element config persistence (previous-mode check across restarts)
    // ------------------------------------------------------------------

    /// Create the singleton config table and return the previously
    /// persisted mode, if any.
    pub async fn load_previous_mode(&self) -> EngineResult<Option<SeMode>> {
        let config = &self.tables.config;
        sqlx::query(&format!(
            r#"CREATE TABLE IF NOT EXISTS {config} (
                singleton BOOL PRIMARY KEY DEFAULT true CHECK (singleton),
                element_id TEXT NOT NULL,
                mode TEXT NOT NULL,
                storage_type TEXT NOT NULL,
                capacity_total_bytes BIGINT NOT NULL,
                retention_days INT NOT NULL,
                priority BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )"#
        ))
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(&format!("SELECT mode FROM {config}"))
            .fetch_optional(&self.pool)
            .await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let mode: String = row.get("mode");
                mode.parse().map(Some).map_err(EngineError::Internal)
            }
        }
    }

    /// Persist the current process configuration.
    pub async fn save_config(
        &self,
        element_id: &str,
        mode: SeMode,
        storage_type: &str,
        capacity_total_bytes: u64,
        retention_days: u32,
        priority: i64,
    ) -> EngineResult<()> {
        let config = &self.tables.config;
        sqlx::query(&format!(
            r#"INSERT INTO {config}
                   (singleton, element_id, mode, storage_type,
                    capacity_total_bytes, retention_days, priority, updated_at)
               VALUES (true, $1, $2, $3, $4, $5, $6, now())
               ON CONFLICT (singleton) DO UPDATE SET
                   element_id = EXCLUDED.element_id,
                   mode = EXCLUDED.mode,
                   storage_type = EXCLUDED.storage_type,
                   capacity_total_bytes = EXCLUDED.capacity_total_bytes,
                   retention_days = EXCLUDED.retention_days,
                   priority = EXCLUDED.priority,
                   updated_at = now()"#
        ))
        .bind(element_id)
        .bind(mode.as_str())
        .bind(storage_type)
        .bind(capacity_total_bytes as i64)
        .bind(retention_days as i32)
        .bind(priority)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Row operations
    // ------------------------------------------------------------------

    /// Text fed into the search vector; must match what search expects.
    fn search_text(attrs: &FileAttributes) -> String {
        let mut text = attrs.original_filename.clone();
        if let Some(desc) = &attrs.description {
            text.push(' ');
            text.push_str(desc);
        }
        for tag in &attrs.tags {
            text.push(' ');
            text.push_str(tag);
        }
        text
    }

    /// Upsert a row from sidecar content. Stale writes (older
    /// `committed_at` than the stored row) are dropped.
    pub async fn upsert(
        &self,
        attrs: &FileAttributes,
        committed_at: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let files = &self.tables.files;
        let signature = attrs
            .digital_signature
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        let custom = serde_json::to_value(&attrs.custom)?;
        let result = sqlx::query(&format!(
            r#"INSERT INTO {files}
                   (file_id, original_filename, storage_filename, storage_path,
                    size_bytes, mime_type, sha256_hash, md5_hash, uploaded_by,
                    uploaded_at, retention_days, expires_at, version,
                    schema_version, description, tags, custom, digital_signature,
                    committed_at, cache_updated_at, cache_ttl_hours, search_vector)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                       $14, $15, $16, $17, $18, $19, now(), $20,
                       to_tsvector('english', $21))
               ON CONFLICT (file_id) DO UPDATE SET
                   original_filename = EXCLUDED.original_filename,
                   storage_filename = EXCLUDED.storage_filename,
                   storage_path = EXCLUDED.storage_path,
                   size_bytes = EXCLUDED.size_bytes,
                   mime_type = EXCLUDED.mime_type,
                   sha256_hash = EXCLUDED.sha256_hash,
                   md5_hash = EXCLUDED.md5_hash,
                   uploaded_by = EXCLUDED.uploaded_by,
                   uploaded_at = EXCLUDED.uploaded_at,
                   retention_days = EXCLUDED.retention_days,
                   expires_at = EXCLUDED.expires_at,
                   version = EXCLUDED.version,
                   schema_version = EXCLUDED.schema_version,
                   description = EXCLUDED.description,
                   tags = EXCLUDED.tags,
                   custom = EXCLUDED.custom,
                   digital_signature = EXCLUDED.digital_signature,
                   committed_at = EXCLUDED.committed_at,
                   cache_updated_at = now(),
                   cache_ttl_hours = EXCLUDED.cache_ttl_hours,
                   search_vector = EXCLUDED.search_vector
               WHERE {files}.committed_at <= EXCLUDED.committed_at"#
        ))
        .bind(attrs.file_id)
        .bind(&attrs.original_filename)
        .bind(&attrs.storage_filename)
        .bind(&attrs.storage_path)
        .bind(attrs.size_bytes as i64)
        .bind(&attrs.mime_type)
        .bind(&attrs.sha256_hash)
        .bind(&attrs.md5_hash)
        .bind(&attrs.uploaded_by)
        .bind(attrs.uploaded_at)
        .bind(attrs.retention_days as i32)
        .bind(attrs.expires_at)
        .bind(attrs.version as i32)
        .bind(&attrs.schema_version)
        .bind(&attrs.description)
        .bind(&attrs.tags)
        .bind(custom)
        .bind(signature)
        .bind(committed_at)
        .bind(self.default_ttl_hours)
        .bind(Self::search_text(attrs))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get(&self, file_id: Uuid) -> EngineResult<Option<CachedFile>> {
        let files = &self.tables.files;
        let row = sqlx::query(&format!(
            "SELECT * FROM {files} WHERE file_id = $1"
        ))
        .bind(file_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Self::row_to_cached).transpose()
    }

    pub async fn delete(&self, file_id: Uuid) -> EngineResult<bool> {
        let files = &self.tables.files;
        let result = sqlx::query(&format!("DELETE FROM {files} WHERE file_id = $1"))
            .bind(file_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Remove every row. Used only by the P1 full rebuild while it holds
    /// the exclusive cache lock.
    pub async fn truncate(&self) -> EngineResult<()> {
        let files = &self.tables.files;
        sqlx::query(&format!("TRUNCATE {files}")).execute(&self.pool).await?;
        Ok(())
    }

    /// Number of cached files; feeds the discovery payload.
    pub async fn count(&self) -> EngineResult<i64> {
        let files = &self.tables.files;
        let row = sqlx::query(&format!("SELECT count(*) AS n FROM {files}"))
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    /// All cached file ids; drives the consistency check.
    pub async fn all_file_ids(&self) -> EngineResult<Vec<Uuid>> {
        let files = &self.tables.files;
        let rows = sqlx::query(&format!("SELECT file_id FROM {files}"))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("file_id")).collect())
    }

    /// Ids of rows whose TTL has lapsed.
    pub async fn expired_ids(&self, limit: i64) -> EngineResult<Vec<Uuid>> {
        let files = &self.tables.files;
        let rows = sqlx::query(&format!(
            r#"SELECT file_id FROM {files}
               WHERE cache_updated_at + make_interval(hours => cache_ttl_hours) < now()
               LIMIT $1"#
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("file_id")).collect())
    }

    /// Delete expired rows (P4 cleanup). Sidecars are untouched.
    pub async fn delete_expired(&self) -> EngineResult<u64> {
        let files = &self.tables.files;
        let result = sqlx::query(&format!(
            r#"DELETE FROM {files}
               WHERE cache_updated_at + make_interval(hours => cache_ttl_hours) < now()"#
        ))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------
    // Search
    // ------------------------------------------------------------------

    /// Execute a search. Ordering is stable (`uploaded_at DESC, file_id
    /// ASC`) so a concurrent rebuild cannot reorder a page mid-request.
    pub async fn search(&self, query: &SearchQuery) -> EngineResult<SearchResult> {
        let files = &self.tables.files;
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT * FROM {files} WHERE TRUE"));

        if let Some(text) = query.text.as_deref().filter(|t| !t.trim().is_empty()) {
            builder.push(" AND search_vector @@ plainto_tsquery('english', ");
            builder.push_bind(text.to_string());
            builder.push(")");
        }
        if !query.tags.is_empty() {
            builder.push(" AND tags @> ");
            builder.push_bind(query.tags.clone());
        }
        if let Some(principal) = &query.uploaded_by {
            builder.push(" AND uploaded_by = ");
            builder.push_bind(principal.clone());
        }
        if let Some(min) = query.min_size {
            builder.push(" AND size_bytes >= ");
            builder.push_bind(min);
        }
        if let Some(max) = query.max_size {
            builder.push(" AND size_bytes <= ");
            builder.push_bind(max);
        }
        if let Some(after) = query.uploaded_after {
            builder.push(" AND uploaded_at >= ");
            builder.push_bind(after);
        }
        if let Some(before) = query.uploaded_before {
            builder.push(" AND uploaded_at <= ");
            builder.push_bind(before);
        }
        builder.push(" ORDER BY uploaded_at DESC, file_id ASC LIMIT ");
        builder.push_bind(query.limit);
        builder.push(" OFFSET ");
        builder.push_bind(query.offset);

        let rows = builder.build().fetch_all(&self.pool).await?;
        let now = Utc::now();
        let mut items = Vec::with_capacity(rows.len());
        let mut expired_ids = Vec::new();
        for row in rows {
            let cached = Self::row_to_cached(row)?;
            if cached.is_expired(now) {
                expired_ids.push(cached.attributes.file_id);
            }
            items.push(cached);
        }
        Ok(SearchResult { items, expired_ids })
    }

    fn row_to_cached(row: PgRow) -> EngineResult<CachedFile> {
        let custom: Value = row.get("custom");
        let signature: Option<Value> = row.get("digital_signature");
        let attributes = FileAttributes {
            file_id: row.get("file_id"),
            original_filename: row.get("original_filename"),
            storage_filename: row.get("storage_filename"),
            storage_path: row.get("storage_path"),
            size_bytes: row.get::<i64, _>("size_bytes") as u64,
            mime_type: row.get("mime_type"),
            sha256_hash: row.get("sha256_hash"),
            md5_hash: row.get("md5_hash"),
            uploaded_by: row.get("uploaded_by"),
            uploaded_at: row.get("uploaded_at"),
            retention_days: row.get::<i32, _>("retention_days") as u32,
            expires_at: row.get("expires_at"),
            version: row.get::<i32, _>("version") as u32,
            schema_version: row.get("schema_version"),
            description: row.get("description"),
            tags: row.get("tags"),
            custom: serde_json::from_value(custom)?,
            digital_signature: signature
                .map(serde_json::from_value::<DigitalSignature>)
                .transpose()?,
        };
        Ok(CachedFile {
            attributes,
            committed_at: row.get("committed_at"),
            cache_updated_at: row.get("cache_updated_at"),
            cache_ttl_hours: row.get("cache_ttl_hours"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn attrs() -> FileAttributes {
        FileAttributes {
            file_id: Uuid::new_v4(),
            original_filename: "report.pdf".into(),
            storage_filename: "report_alice_x.pdf".into(),
            storage_path: "2025/11/08/10".into(),
            size_bytes: 10,
            mime_type: None,
            sha256_hash: "a".repeat(64),
            md5_hash: None,
            uploaded_by: "alice".into(),
            uploaded_at: Utc.with_ymd_and_hms(2025, 11, 8, 10, 30, 45).unwrap(),
            retention_days: 30,
            expires_at: Utc.with_ymd_and_hms(2025, 12, 8, 10, 30, 45).unwrap(),
            version: 1,
            schema_version: "2.0".into(),
            description: Some("Quarterly report".into()),
            tags: vec!["q3".into(), "2025".into()],
            custom: BTreeMap::new(),
            digital_signature: None,
        }
    }

    #[test]
    fn test_search_text_concatenation() {
        let text = MetadataCache::search_text(&attrs());
        assert_eq!(text, "report.pdf Quarterly report q3 2025");
    }

    #[test]
    fn test_cached_file_expiry_math() {
        let cached = CachedFile {
            attributes: attrs(),
            committed_at: Utc::now(),
            cache_updated_at: Utc::now() - chrono::Duration::hours(25),
            cache_ttl_hours: 24,
        };
        assert!(cached.is_expired(Utc::now()));

        let fresh = CachedFile {
            cache_updated_at: Utc::now() - chrono::Duration::hours(1),
            ..cached
        };
        assert!(!fresh.is_expired(Utc::now()));
    }

    #[test]
    fn test_search_query_clamping() {
        let q = SearchQuery {
            limit: 100_000,
            offset: -5,
            ..Default::default()
        }
        .clamped();
        assert_eq!(q.limit, 500);
        assert_eq!(q.offset, 0);

        let q = SearchQuery {
            limit: 0,
            ..Default::default()
        }
        .clamped();
        assert_eq!(q.limit, 1);
    }
}
