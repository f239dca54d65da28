//! The file engine: upload, download, update, delete, search.
//!
//! Every mutation runs the same shape: open a WAL row, touch the bytes,
//! write the sidecar atomically, mirror into the cache, commit the WAL
//! row. Compensation deletes whatever was made visible before the failure
//! and leaves the WAL row rolled back, so the startup sweep and the
//! garbage collector can always converge the element without manual help.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::store::{CachedFile, MetadataCache, SearchQuery, SearchResult};
use crate::cache::sync::CacheSynchronizer;
use crate::core::error::{EngineError, EngineResult};
use crate::storage::backend::{
    with_retries, ByteRange, ObjectReader, RetryPolicy, StorageBackend,
};
use crate::storage::mode::SeMode;
use crate::storage::naming;
use crate::storage::sidecar::FileAttributes;
use crate::storage::wal::{UploadPayload, WalOperation, WalStore};

/// Caller identity, resolved from the bearer token by the API layer.
#[derive(Debug, Clone)]
pub struct Principal {
    pub name: String,
    /// Admin-role service account; unlocks delete in `rw` mode.
    pub is_admin: bool,
}

/// Client-supplied upload metadata.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UploadMetadata {
    pub original_filename: String,
    /// Size the client intends to send; checked against free capacity.
    pub declared_size: u64,
    pub mime_type: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub retention_days: Option<u32>,
    #[serde(default)]
    pub custom: BTreeMap<String, Value>,
    /// Expected digest; a mismatch after the bytes land aborts the upload.
    pub expected_sha256: Option<String>,
}

/// Successful upload summary.
#[derive(Debug, Clone, Serialize)]
pub struct UploadReceipt {
    pub file_id: Uuid,
    pub storage_filename: String,
    pub size_bytes: u64,
    pub sha256: String,
}

/// Mutable subset for metadata updates. Absent fields stay untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetadataPatch {
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
    pub retention_days: Option<u32>,
    #[serde(default)]
    pub custom: BTreeMap<String, Value>,
}

/// Open download: attributes plus the byte stream.
pub struct Download {
    pub attributes: FileAttributes,
    pub reader: ObjectReader,
    /// The range actually served, when the request asked for one.
    pub range: Option<ByteRange>,
}

/// Restore ticket issued by an archive element.
#[derive(Debug, Clone, Serialize)]
pub struct RestoreTicket {
    pub ticket_id: Uuid,
    pub file_id: Uuid,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Restore ticket TTL once the bytes land on the designated restore
/// element.
pub const RESTORE_TICKET_TTL_DAYS: i64 = 30;

/// In-process ticket book for `ar` mode.
#[derive(Default)]
pub struct RestoreTickets {
    tickets: DashMap<Uuid, RestoreTicket>,
}

impl RestoreTickets {
    pub fn issue(&self, file_id: Uuid) -> RestoreTicket {
        // One open ticket per file; re-requesting returns the same one.
        if let Some(existing) = self
            .tickets
            .iter()
            .find(|t| t.file_id == file_id && t.expires_at > Utc::now())
        {
            return existing.clone();
        }
        let now = Utc::now();
        let ticket = RestoreTicket {
            ticket_id: Uuid::new_v4(),
            file_id,
            issued_at: now,
            expires_at: now + chrono::Duration::days(RESTORE_TICKET_TTL_DAYS),
        };
        self.tickets.insert(ticket.ticket_id, ticket.clone());
        ticket
    }

    pub fn get(&self, ticket_id: Uuid) -> Option<RestoreTicket> {
        self.tickets
            .get(&ticket_id)
            .filter(|t| t.expires_at > Utc::now())
            .map(|t| t.clone())
    }

    pub fn prune(&self) {
        let now = Utc::now();
        self.tickets.retain(|_, t| t.expires_at > now);
    }
}

/// Engine configuration distilled from [`crate::core::SeConfig`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub element_id: String,
    pub mode: SeMode,
    pub max_file_size_bytes: u64,
    pub default_retention_days: u32,
    pub wal_retention_days: u32,
}

/// The file engine for one Storage Element.
pub struct FileEngine {
    settings: EngineSettings,
    backend: Arc<dyn StorageBackend>,
    wal: WalStore,
    cache: MetadataCache,
    sync: Arc<CacheSynchronizer>,
    tickets: RestoreTickets,
}

impl FileEngine {
    pub fn new(
        settings: EngineSettings,
        backend: Arc<dyn StorageBackend>,
        wal: WalStore,
        cache: MetadataCache,
        sync: Arc<CacheSynchronizer>,
    ) -> Self {
        Self {
            settings,
            backend,
            wal,
            cache,
            sync,
            tickets: RestoreTickets::default(),
        }
    }

    pub fn mode(&self) -> SeMode {
        self.settings.mode
    }

    pub fn synchronizer(&self) -> &Arc<CacheSynchronizer> {
        &self.sync
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn tickets(&self) -> &RestoreTickets {
        &self.tickets
    }

    // ------------------------------------------------------------------
    // Upload
    // ------------------------------------------------------------------

    /// Stream an upload to durable storage.
    pub async fn upload<S>(
        &self,
        principal: &Principal,
        metadata: UploadMetadata,
        stream: S,
    ) -> EngineResult<UploadReceipt>
    where
        S: Stream<Item = EngineResult<Bytes>> + Send,
    {
        let mut stream = std::pin::pin!(stream);
        if !self.settings.mode.allows_create() {
            return Err(EngineError::ModeDenied {
                mode: self.settings.mode.to_string(),
                operation: "upload".into(),
            });
        }
        if metadata.original_filename.is_empty() {
            return Err(EngineError::Validation("original_filename is required".into()));
        }
        if metadata.declared_size == 0 {
            return Err(EngineError::Validation("declared_size must be > 0".into()));
        }
        if metadata.declared_size > self.settings.max_file_size_bytes {
            return Err(EngineError::FileTooLarge {
                limit: self.settings.max_file_size_bytes,
            });
        }

        // Capacity reservation: a declared size equal to free space is
        // accepted; one byte more is not.
        let (total, used) = self.backend.capacity().await?;
        let free = total.saturating_sub(used);
        if free < metadata.declared_size {
            return Err(EngineError::InsufficientStorage {
                requested: metadata.declared_size,
                free,
            });
        }

        let uploaded_at = Utc::now();
        let file_id = Uuid::new_v4();
        let storage_filename =
            naming::storage_filename(&metadata.original_filename, &principal.name, uploaded_at);
        let storage_path = naming::storage_path(uploaded_at);
        let object_key = format!("{storage_path}/{storage_filename}");

        let wal_id = self
            .wal
            .open(
                WalOperation::Upload,
                Some(file_id),
                serde_json::to_value(UploadPayload {
                    storage_path: storage_path.clone(),
                    storage_filename: storage_filename.clone(),
                    declared_size: metadata.declared_size,
                    uploaded_by: principal.name.clone(),
                })?,
            )
            .await?;
        self.wal.mark_in_progress(wal_id).await?;

        // Stream the bytes into a temp file, hashing as we go.
        let mut upload = match self.backend.begin_upload(&object_key).await {
            Ok(u) => u,
            Err(e) => {
                self.wal
                    .roll_back(wal_id, Some(json!({"stage": "begin_upload"})))
                    .await?;
                return Err(e);
            }
        };

        let mut sha256 = Sha256::new();
        let mut md5 = md5::Context::new();
        let mut received: u64 = 0;
        let stream_result: EngineResult<()> = async {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                received += chunk.len() as u64;
                if received > self.settings.max_file_size_bytes {
                    return Err(EngineError::FileTooLarge {
                        limit: self.settings.max_file_size_bytes,
                    });
                }
                sha256.update(&chunk);
                md5.consume(&chunk);
                upload.write_chunk(&chunk).await?;
            }
            Ok(())
        }
        .await;

        if let Err(e) = stream_result {
            let _ = upload.abort().await;
            self.wal
                .roll_back(wal_id, Some(json!({"stage": "stream", "removed": "temp"})))
                .await?;
            return Err(e);
        }
        if received == 0 {
            let _ = upload.abort().await;
            self.wal
                .roll_back(wal_id, Some(json!({"stage": "stream", "removed": "temp"})))
                .await?;
            return Err(EngineError::Validation("empty upload body".into()));
        }

        let sha256_hex = hex::encode(sha256.finalize());
        let md5_hex = format!("{:x}", md5.compute());

        if let Some(expected) = metadata
            .expected_sha256
            .as_deref()
            .map(str::to_ascii_lowercase)
        {
            if expected != sha256_hex {
                let _ = upload.abort().await;
                self.wal
                    .roll_back(wal_id, Some(json!({"stage": "checksum", "removed": "temp"})))
                    .await?;
                return Err(EngineError::ChecksumMismatch {
                    expected,
                    actual: sha256_hex,
                });
            }
        }

        // Make the object visible.
        if let Err(e) = upload.finalize().await {
            self.wal
                .roll_back(wal_id, Some(json!({"stage": "finalize", "removed": "temp"})))
                .await?;
            return Err(e);
        }

        // Sidecar: build, bound, write atomically. A failure here deletes
        // the object we just published.
        let mut attrs = FileAttributes::for_upload(
            metadata.original_filename,
            storage_filename.clone(),
            storage_path,
            received,
            metadata.mime_type,
            sha256_hex.clone(),
            Some(md5_hex),
            principal.name.clone(),
            uploaded_at,
            metadata
                .retention_days
                .unwrap_or(self.settings.default_retention_days),
        );
        attrs.file_id = file_id;
        attrs.description = metadata.description;
        attrs.tags = metadata.tags;
        attrs.custom = metadata.custom;

        let sidecar_result = match attrs.validate().and_then(|_| attrs.to_bytes()) {
            Ok(bytes) => {
                let sidecar_key = attrs.sidecar_key();
                with_retries(RetryPolicy::default(), || {
                    let bytes = bytes.clone();
                    let key = sidecar_key.clone();
                    async move { self.backend.write_sidecar_atomic(&key, &bytes).await }
                })
                .await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = sidecar_result {
            let _ = self.backend.delete_object(&object_key).await;
            self.wal
                .roll_back(
                    wal_id,
                    Some(json!({"stage": "sidecar", "removed": object_key})),
                )
                .await?;
            return Err(e);
        }

        // Cache mirror. Never rolls the upload back: the sidecar is the
        // truth and lazy rebuild repairs a missing row.
        let committed_at = Utc::now();
        if let Err(e) = self.cache.upsert(&attrs, committed_at).await {
            warn!(
                file_id = %file_id,
                error = %e,
                "cache upsert failed after upload; row left to lazy rebuild"
            );
        }

        self.wal.commit(wal_id).await?;
        info!(
            element_id = %self.settings.element_id,
            file_id = %file_id,
            size_bytes = received,
            uploaded_by = %principal.name,
            "upload committed"
        );

        Ok(UploadReceipt {
            file_id,
            storage_filename,
            size_bytes: received,
            sha256: sha256_hex,
        })
    }

    // ------------------------------------------------------------------
    // Metadata lookup
    // ------------------------------------------------------------------

    /// Resolve attributes for a file: cache row first, sidecar fallback.
    ///
    /// An expired row is served as-is while a lazy refresh runs in the
    /// background; the projection is identical either way.
    pub async fn get_metadata(&self, file_id: Uuid) -> EngineResult<FileAttributes> {
        match self.cache.get(file_id).await {
            Ok(Some(cached)) => {
                if cached.is_expired(Utc::now()) {
                    self.spawn_lazy_rebuild(&cached);
                }
                Ok(cached.attributes)
            }
            Ok(None) => self.attrs_from_disk(file_id).await,
            Err(e) => {
                // Degraded cache: fall through to the sidecar.
                warn!(file_id = %file_id, error = %e, "cache read failed; using sidecar");
                self.attrs_from_disk(file_id).await
            }
        }
    }

    /// Scan the sidecar tree for a file id. The cache makes this path
    /// rare; it exists so a wiped cache never makes objects unreachable.
    async fn attrs_from_disk(&self, file_id: Uuid) -> EngineResult<FileAttributes> {
        for key in self.backend.list_prefix("").await? {
            if !key.ends_with(naming::SIDECAR_SUFFIX) {
                continue;
            }
            if let Some(bytes) = self.backend.read_sidecar(&key).await? {
                if let Ok(attrs) = FileAttributes::from_bytes(&bytes) {
                    if attrs.file_id == file_id {
                        return Ok(attrs);
                    }
                }
            }
        }
        Err(EngineError::NotFound(file_id.to_string()))
    }

    fn spawn_lazy_rebuild(&self, cached: &CachedFile) {
        let sync = self.sync.clone();
        let file_id = cached.attributes.file_id;
        let sidecar_key = cached.attributes.sidecar_key();
        tokio::spawn(async move {
            match sync.lazy_rebuild(file_id, &sidecar_key).await {
                Ok(true) => debug!(file_id = %file_id, "lazy cache rebuild applied"),
                Ok(false) => debug!(file_id = %file_id, "lazy cache rebuild skipped"),
                Err(e) => warn!(file_id = %file_id, error = %e, "lazy cache rebuild failed"),
            }
        });
    }

    // ------------------------------------------------------------------
    // Download
    // ------------------------------------------------------------------

    /// Open a download, honoring mode and an optional resolved range.
    pub async fn download(
        &self,
        file_id: Uuid,
        range: Option<ByteRange>,
    ) -> EngineResult<Download> {
        let attributes = self.get_metadata(file_id).await?;

        if self.settings.mode == SeMode::Ar {
            let ticket = self.tickets.issue(file_id);
            return Err(EngineError::GoneArchived {
                restore_hint: Some(ticket.ticket_id.to_string()),
            });
        }

        let reader = self
            .backend
            .read_object(&attributes.object_key(), range)
            .await?;
        Ok(Download {
            attributes,
            reader,
            range,
        })
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Apply a metadata patch. Identity fields are immutable; the sidecar
    /// version is bumped on every successful update.
    pub async fn update_metadata(
        &self,
        file_id: Uuid,
        patch: MetadataPatch,
    ) -> EngineResult<FileAttributes> {
        if !self.settings.mode.allows_update() {
            return Err(EngineError::ModeDenied {
                mode: self.settings.mode.to_string(),
                operation: "update".into(),
            });
        }

        let mut attrs = self.get_metadata(file_id).await?;
        let previous = serde_json::to_value(&attrs)?;

        let wal_id = self
            .wal
            .open(
                WalOperation::UpdateMetadata,
                Some(file_id),
                json!({"patch": "metadata"}),
            )
            .await?;
        self.wal.mark_in_progress(wal_id).await?;

        apply_patch(&mut attrs, patch);
        attrs.version += 1;

        let result = async {
            let bytes = attrs.to_bytes()?;
            self.backend
                .write_sidecar_atomic(&attrs.sidecar_key(), &bytes)
                .await
        }
        .await;

        if let Err(e) = result {
            self.wal.roll_back(wal_id, Some(previous)).await?;
            return Err(e);
        }

        let committed_at = Utc::now();
        if let Err(e) = self.cache.upsert(&attrs, committed_at).await {
            warn!(file_id = %file_id, error = %e, "cache upsert failed after update");
        }
        self.wal.commit(wal_id).await?;
        Ok(attrs)
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Delete a file. Cache row first, then sidecar, then object, so a
    /// partial failure leaves an orphan object for the garbage collector
    /// rather than a sidecar pointing at nothing.
    pub async fn delete(&self, file_id: Uuid, principal: &Principal) -> EngineResult<()> {
        if !self.settings.mode.allows_delete(principal.is_admin) {
            return Err(EngineError::ModeDenied {
                mode: self.settings.mode.to_string(),
                operation: "delete".into(),
            });
        }

        let attrs = self.get_metadata(file_id).await?;
        let compensation = json!({
            "object_key": attrs.object_key(),
            "sidecar": serde_json::to_value(&attrs)?,
        });

        let wal_id = self
            .wal
            .open(WalOperation::Delete, Some(file_id), compensation.clone())
            .await?;
        self.wal.mark_in_progress(wal_id).await?;

        if let Err(e) = self.cache.delete(file_id).await {
            self.wal.roll_back(wal_id, None).await?;
            return Err(e);
        }
        let sidecar_key = attrs.sidecar_key();
        let sidecar_delete = with_retries(RetryPolicy::default(), || {
            let key = sidecar_key.clone();
            async move { self.backend.delete_object(&key).await }
        })
        .await;
        if let Err(e) = sidecar_delete {
            // Cache row is gone but the sidecar remains; incremental
            // rebuild restores the row, nothing is lost.
            self.wal.roll_back(wal_id, None).await?;
            return Err(e);
        }
        let object_key = attrs.object_key();
        let object_delete = with_retries(RetryPolicy::default(), || {
            let key = object_key.clone();
            async move { self.backend.delete_object(&key).await }
        })
        .await;
        if let Err(e) = object_delete {
            // Sidecar already removed: the object is now an orphan and the
            // GC orphan sweep owns it.
            warn!(
                file_id = %file_id,
                error = %e,
                "object delete failed after sidecar removal; orphan left for gc"
            );
            self.wal.fail(wal_id, Some(compensation)).await?;
            return Err(e);
        }

        self.wal.commit(wal_id).await?;
        info!(file_id = %file_id, deleted_by = %principal.name, "file deleted");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Search
    // ------------------------------------------------------------------

    /// Cache-backed search. Expired rows encountered in the page trigger
    /// background refreshes but are served unchanged within this request.
    pub async fn search(&self, query: SearchQuery) -> EngineResult<SearchResult> {
        let result = self.cache.search(&query.clamped()).await?;
        for cached in result
            .items
            .iter()
            .filter(|c| result.expired_ids.contains(&c.attributes.file_id))
        {
            self.spawn_lazy_rebuild(cached);
        }
        Ok(result)
    }

    // ------------------------------------------------------------------
    // GC surface (service-account admin only, enforced by the API layer)
    // ------------------------------------------------------------------

    /// Whether any trace of the file exists on this element.
    pub async fn exists(&self, file_id: Uuid) -> EngineResult<bool> {
        match self.get_metadata(file_id).await {
            Ok(_) => Ok(true),
            Err(EngineError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Physical removal on behalf of the garbage collector. Bypasses the
    /// mode matrix; authorization happens at the HTTP boundary.
    pub async fn physical_delete(&self, file_id: Uuid) -> EngineResult<()> {
        let attrs = self.get_metadata(file_id).await?;
        let _ = self.cache.delete(file_id).await;
        self.backend.delete_object(&attrs.sidecar_key()).await?;
        self.backend.delete_object(&attrs.object_key()).await?;
        info!(file_id = %file_id, "physical delete by gc");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Startup recovery
    // ------------------------------------------------------------------

    /// Sweep non-terminal WAL rows left by a crash. Upload leftovers are
    /// removed unless their sidecar made it to disk (in which case the
    /// upload is considered complete); everything else is marked failed.
    pub async fn recover(&self) -> EngineResult<u64> {
        let mut swept = 0u64;
        for entry in self.wal.non_terminal().await? {
            swept += 1;
            match entry.operation_type {
                WalOperation::Upload => {
                    let payload: Option<UploadPayload> =
                        serde_json::from_value(entry.payload.clone()).ok();
                    if let Some(p) = payload {
                        let object_key = format!("{}/{}", p.storage_path, p.storage_filename);
                        let sidecar_key =
                            format!("{object_key}{}", naming::SIDECAR_SUFFIX);
                        if self.backend.read_sidecar(&sidecar_key).await?.is_some() {
                            // Sidecar landed: the upload finished, only the
                            // commit record was lost.
                            self.wal.commit(Some(entry.wal_id)).await?;
                            continue;
                        }
                        let _ = self.backend.delete_object(&object_key).await;
                    }
                    self.wal
                        .roll_back(
                            Some(entry.wal_id),
                            Some(json!({"stage": "recovery", "removed": "object"})),
                        )
                        .await?;
                }
                _ => {
                    self.wal
                        .fail(Some(entry.wal_id), Some(json!({"stage": "recovery"})))
                        .await?;
                }
            }
        }
        if swept > 0 {
            info!(swept, "wal recovery sweep finished");
        }
        Ok(swept)
    }

    /// Periodic WAL housekeeping; returns rows dropped.
    pub async fn gc_wal(&self) -> EngineResult<u64> {
        self.wal.gc_terminal(self.settings.wal_retention_days).await
    }

    /// Prune expired restore tickets; called from the health loop.
    pub fn prune_tickets(&self) {
        self.tickets.prune();
    }
}

/// Apply the mutable fields of a patch. `file_id`, hashes, sizes, and the
/// storage identity never change after upload.
fn apply_patch(attrs: &mut FileAttributes, patch: MetadataPatch) {
    if let Some(description) = patch.description {
        attrs.description = if description.is_empty() {
            None
        } else {
            Some(description)
        };
    }
    if let Some(tags) = patch.tags {
        attrs.tags = tags;
    }
    if let Some(retention_days) = patch.retention_days {
        attrs.set_retention_days(retention_days.max(1));
    }
    for (key, value) in patch.custom {
        if value.is_null() {
            attrs.custom.remove(&key);
        } else {
            attrs.custom.insert(key, value);
        }
    }
}

/// Retry wrapper used by backend-facing loops that tolerate transient
/// failures (downloads resolve this at the API layer instead).
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> EngineResult<T>
where
    F: std::future::Future<Output = EngineResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::BackendUnavailable(format!(
            "operation exceeded {}s",
            limit.as_secs()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn attrs() -> FileAttributes {
        FileAttributes::for_upload(
            "report.pdf".into(),
            "report_alice_x.pdf".into(),
            "2025/11/08/10".into(),
            1024,
            None,
            "e".repeat(64),
            None,
            "alice".into(),
            Utc.with_ymd_and_hms(2025, 11, 8, 10, 30, 45).unwrap(),
            30,
        )
    }

    #[test]
    fn test_patch_updates_mutable_fields() {
        let mut a = attrs();
        apply_patch(
            &mut a,
            MetadataPatch {
                description: Some("Q3 report".into()),
                tags: Some(vec!["q3".into()]),
                retention_days: Some(90),
                custom: BTreeMap::from([("dept".into(), json!("finance"))]),
            },
        );
        assert_eq!(a.description.as_deref(), Some("Q3 report"));
        assert_eq!(a.tags, vec!["q3"]);
        assert_eq!(a.retention_days, 90);
        assert_eq!(
            a.expires_at,
            a.uploaded_at + chrono::Duration::days(90)
        );
        assert_eq!(a.custom["dept"], json!("finance"));
    }

    #[test]
    fn test_patch_null_custom_removes_key() {
        let mut a = attrs();
        a.custom.insert("stale".into(), json!(1));
        apply_patch(
            &mut a,
            MetadataPatch {
                custom: BTreeMap::from([("stale".into(), Value::Null)]),
                ..Default::default()
            },
        );
        assert!(!a.custom.contains_key("stale"));
    }

    #[test]
    fn test_patch_leaves_identity_untouched() {
        let mut a = attrs();
        let id = a.file_id;
        let hash = a.sha256_hash.clone();
        apply_patch(&mut a, MetadataPatch::default());
        assert_eq!(a.file_id, id);
        assert_eq!(a.sha256_hash, hash);
        assert_eq!(a.size_bytes, 1024);
    }

    #[test]
    fn test_empty_description_clears() {
        let mut a = attrs();
        a.description = Some("old".into());
        apply_patch(
            &mut a,
            MetadataPatch {
                description: Some(String::new()),
                ..Default::default()
            },
        );
        assert!(a.description.is_none());
    }

    #[test]
    fn test_restore_tickets_dedupe_per_file() {
        let tickets = RestoreTickets::default();
        let file_id = Uuid::new_v4();
        let a = tickets.issue(file_id);
        let b = tickets.issue(file_id);
        assert_eq!(a.ticket_id, b.ticket_id);

        let other = tickets.issue(Uuid::new_v4());
        assert_ne!(a.ticket_id, other.ticket_id);
    }

    #[test]
    fn test_restore_ticket_ttl() {
        let tickets = RestoreTickets::default();
        let t = tickets.issue(Uuid::new_v4());
        assert_eq!(
            (t.expires_at - t.issued_at).num_days(),
            RESTORE_TICKET_TTL_DAYS
        );
        assert!(tickets.get(t.ticket_id).is_some());
    }
}
