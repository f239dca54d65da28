//! Storage Element request handlers.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::Row;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::admin::elements::{ElementStatus, InfoPayload};
use crate::api::middleware::{AuthContext, RequestId};
use crate::api::responses::{ApiError, ApiResult};
use crate::cache::store::{MetadataCache, SearchQuery};
use crate::core::config::{SeConfig, StorageType};
use crate::core::error::EngineError;
use crate::storage::backend::ByteRange;
use crate::storage::capacity::CapacitySnapshot;
use crate::storage::engine::{FileEngine, MetadataPatch, UploadMetadata};

/// Shared state for the SE router.
#[derive(Clone)]
pub struct SeState {
    pub engine: Arc<FileEngine>,
    pub cache: MetadataCache,
    pub config: Arc<SeConfig>,
}

// ============================================================================
// Range handling
// ============================================================================

/// Parse a `Range` header against a known object size.
///
/// Single-range only, inclusive end (RFC 7233). `bytes=0-` is the full
/// body served as a 206; `bytes={size}-` is unsatisfiable.
pub fn parse_range(header_value: &str, size: u64) -> Result<ByteRange, RangeError> {
    let spec = header_value
        .strip_prefix("bytes=")
        .ok_or(RangeError::Malformed)?;
    if spec.contains(',') {
        return Err(RangeError::MultipleRanges);
    }
    let (start_s, end_s) = spec.split_once('-').ok_or(RangeError::Malformed)?;

    if start_s.is_empty() {
        // Suffix form: last N bytes.
        let n: u64 = end_s.parse().map_err(|_| RangeError::Malformed)?;
        if n == 0 || size == 0 {
            return Err(RangeError::Unsatisfiable);
        }
        let start = size.saturating_sub(n);
        return Ok(ByteRange {
            start,
            end: size - 1,
        });
    }

    let start: u64 = start_s.parse().map_err(|_| RangeError::Malformed)?;
    if start >= size {
        return Err(RangeError::Unsatisfiable);
    }
    let end = if end_s.is_empty() {
        size - 1
    } else {
        let end: u64 = end_s.parse().map_err(|_| RangeError::Malformed)?;
        if end < start {
            return Err(RangeError::Malformed);
        }
        end.min(size - 1)
    };
    Ok(ByteRange { start, end })
}

#[derive(Debug, PartialEq, Eq)]
pub enum RangeError {
    Malformed,
    MultipleRanges,
    Unsatisfiable,
}

// ============================================================================
// Files
// ============================================================================

fn require_scope(auth: &AuthContext, correlation: &RequestId, scope: &str) -> ApiResult<()> {
    if auth.has_scope(scope) {
        Ok(())
    } else {
        Err(ApiError::forbidden(format!("{scope} scope required"))
            .with_correlation(&correlation.0))
    }
}

/// `POST /files/upload` (multipart: `metadata` JSON part + `file` part).
pub async fn upload_file(
    State(state): State<SeState>,
    Extension(auth): Extension<AuthContext>,
    Extension(correlation): Extension<RequestId>,
    mut multipart: Multipart,
) -> ApiResult<Response> {
    require_scope(&auth, &correlation, "file:create")?;

    let mut metadata: Option<UploadMetadata> = None;
    let mut receipt = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::validation(format!("multipart: {e}")))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("metadata") => {
                let raw = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::validation(format!("metadata part: {e}")))?;
                metadata = Some(
                    serde_json::from_slice(&raw)
                        .map_err(|e| ApiError::validation(format!("metadata json: {e}")))?,
                );
            }
            Some("file") => {
                let meta = metadata.take().ok_or_else(|| {
                    ApiError::validation("metadata part must precede the file part")
                })?;
                let stream = field.map_err(|e| {
                    EngineError::BackendUnavailable(format!("upload stream: {e}"))
                });
                let principal = auth.principal();
                let result = state.engine.upload(&principal, meta, stream).await;
                receipt = Some(result.map_err(|e| {
                    let api: ApiError = e.into();
                    api.with_correlation(&correlation.0)
                })?);
            }
            _ => {}
        }
    }

    match receipt {
        Some(receipt) => Ok((StatusCode::CREATED, Json(receipt)).into_response()),
        None => Err(ApiError::validation("multipart body must carry metadata and file parts")
            .with_correlation(&correlation.0)),
    }
}

/// `GET /files/{id}`.
pub async fn get_file(
    State(state): State<SeState>,
    Extension(auth): Extension<AuthContext>,
    Extension(correlation): Extension<RequestId>,
    Path(file_id): Path<Uuid>,
) -> ApiResult<Response> {
    require_scope(&auth, &correlation, "file:read")?;
    let attrs = state.engine.get_metadata(file_id).await.map_err(|e| {
        let api: ApiError = e.into();
        api.with_correlation(&correlation.0)
    })?;
    Ok(Json(attrs).into_response())
}

/// `GET /files/{id}/download`. Supports single-range requests; an archive
/// element answers 202 with a restore ticket instead of bytes.
pub async fn download_file(
    State(state): State<SeState>,
    Extension(auth): Extension<AuthContext>,
    Extension(correlation): Extension<RequestId>,
    Path(file_id): Path<Uuid>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    require_scope(&auth, &correlation, "file:read")?;

    // Resolve the range against the authoritative size first.
    let attrs = state.engine.get_metadata(file_id).await.map_err(|e| {
        let api: ApiError = e.into();
        api.with_correlation(&correlation.0)
    })?;

    let range = match headers.get(header::RANGE).and_then(|v| v.to_str().ok()) {
        None => None,
        Some(value) => match parse_range(value, attrs.size_bytes) {
            Ok(range) => Some(range),
            Err(RangeError::Unsatisfiable) => {
                return Ok((
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    [(header::CONTENT_RANGE, format!("bytes */{}", attrs.size_bytes))],
                )
                    .into_response())
            }
            Err(_) => {
                return Err(ApiError::validation("malformed Range header")
                    .with_correlation(&correlation.0))
            }
        },
    };

    let download = match state.engine.download(file_id, range).await {
        Ok(d) => d,
        Err(EngineError::GoneArchived { restore_hint }) => {
            let ticket = restore_hint.unwrap_or_default();
            return Ok((
                StatusCode::ACCEPTED,
                Json(json!({
                    "status": "restore_queued",
                    "restore_ticket": ticket,
                    "message": "object is archived; poll the restore ticket",
                })),
            )
                .into_response());
        }
        Err(e) => {
            let api: ApiError = e.into();
            return Err(api.with_correlation(&correlation.0));
        }
    };

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::ETAG,
        format!("\"{}\"", download.attributes.sha256_hash)
            .parse()
            .expect("hex etag is ascii"),
    );
    response_headers.insert(header::ACCEPT_RANGES, "bytes".parse().expect("static"));
    if let Some(mime) = &download.attributes.mime_type {
        if let Ok(value) = mime.parse() {
            response_headers.insert(header::CONTENT_TYPE, value);
        }
    }

    let body = Body::from_stream(ReaderStream::new(download.reader));
    match download.range {
        Some(r) => {
            response_headers.insert(
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", r.start, r.end, download.attributes.size_bytes)
                    .parse()
                    .expect("ascii"),
            );
            response_headers.insert(
                header::CONTENT_LENGTH,
                r.len().to_string().parse().expect("ascii"),
            );
            Ok((StatusCode::PARTIAL_CONTENT, response_headers, body).into_response())
        }
        None => {
            response_headers.insert(
                header::CONTENT_LENGTH,
                download
                    .attributes
                    .size_bytes
                    .to_string()
                    .parse()
                    .expect("ascii"),
            );
            Ok((StatusCode::OK, response_headers, body).into_response())
        }
    }
}

/// `PATCH /files/{id}`.
pub async fn update_file(
    State(state): State<SeState>,
    Extension(auth): Extension<AuthContext>,
    Extension(correlation): Extension<RequestId>,
    Path(file_id): Path<Uuid>,
    Json(patch): Json<MetadataPatch>,
) -> ApiResult<Response> {
    require_scope(&auth, &correlation, "file:update")?;
    let attrs = state.engine.update_metadata(file_id, patch).await.map_err(|e| {
        let api: ApiError = e.into();
        api.with_correlation(&correlation.0)
    })?;
    Ok(Json(attrs).into_response())
}

/// `DELETE /files/{id}`.
pub async fn delete_file(
    State(state): State<SeState>,
    Extension(auth): Extension<AuthContext>,
    Extension(correlation): Extension<RequestId>,
    Path(file_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    require_scope(&auth, &correlation, "file:delete")?;
    state
        .engine
        .delete(file_id, &auth.principal())
        .await
        .map_err(|e| {
            let api: ApiError = e.into();
            api.with_correlation(&correlation.0)
        })?;
    Ok(StatusCode::NO_CONTENT)
}

/// Search query parameters.
#[derive(Debug, Default, Deserialize)]
pub struct SearchParams {
    pub q: Option<String>,
    /// Comma-separated tag list; every tag must match.
    pub tags: Option<String>,
    pub uploaded_by: Option<String>,
    pub min_size: Option<i64>,
    pub max_size: Option<i64>,
    pub uploaded_after: Option<DateTime<Utc>>,
    pub uploaded_before: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Search response page.
#[derive(Debug, Serialize)]
pub struct SearchPage<T> {
    pub items: Vec<T>,
    pub limit: i64,
    pub offset: i64,
}

/// `GET /files`.
pub async fn search_files(
    State(state): State<SeState>,
    Extension(auth): Extension<AuthContext>,
    Extension(correlation): Extension<RequestId>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Response> {
    require_scope(&auth, &correlation, "file:read")?;

    let query = SearchQuery {
        text: params.q,
        tags: params
            .tags
            .map(|t| {
                t.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        uploaded_by: params.uploaded_by,
        min_size: params.min_size,
        max_size: params.max_size,
        uploaded_after: params.uploaded_after,
        uploaded_before: params.uploaded_before,
        limit: params.limit.unwrap_or(50),
        offset: params.offset.unwrap_or(0),
    }
    .clamped();
    let limit = query.limit;
    let offset = query.offset;

    let result = state.engine.search(query).await.map_err(|e| {
        let api: ApiError = e.into();
        api.with_correlation(&correlation.0)
    })?;

    let items: Vec<_> = result.items.into_iter().map(|c| c.attributes).collect();
    Ok(Json(SearchPage {
        items,
        limit,
        offset,
    })
    .into_response())
}

/// `GET /files/restore/{ticket_id}`: restore ticket status.
pub async fn restore_ticket_status(
    State(state): State<SeState>,
    Extension(auth): Extension<AuthContext>,
    Extension(correlation): Extension<RequestId>,
    Path(ticket_id): Path<Uuid>,
) -> ApiResult<Response> {
    require_scope(&auth, &correlation, "file:read")?;
    match state.engine.tickets().get(ticket_id) {
        Some(ticket) => Ok(Json(ticket).into_response()),
        None => Err(ApiError::not_found("restore ticket unknown or expired")
            .with_correlation(&correlation.0)),
    }
}

// ============================================================================
// Discovery and capacity
// ============================================================================

/// `GET /info` (unauthenticated discovery payload).
pub async fn info(State(state): State<SeState>) -> ApiResult<Json<InfoPayload>> {
    let (total, used) = state.engine.backend().capacity().await.map_err(ApiError::from)?;
    let file_count = state.cache.count().await.unwrap_or(0);
    Ok(Json(InfoPayload {
        name: state.config.element_id.clone(),
        display_name: state.config.display_name.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        mode: state.config.mode,
        storage_type: match state.config.storage_type {
            StorageType::Local => "local".to_string(),
            StorageType::S3 => "s3".to_string(),
        },
        base_path: state.config.base_path.display().to_string(),
        capacity_bytes: total,
        used_bytes: used,
        file_count: file_count.max(0) as u64,
        status: ElementStatus::Operational,
    }))
}

/// `GET /capacity` (unauthenticated compact view).
pub async fn capacity(State(state): State<SeState>) -> ApiResult<Json<CapacitySnapshot>> {
    let (total, used) = state.engine.backend().capacity().await.map_err(ApiError::from)?;
    Ok(Json(CapacitySnapshot::new(state.config.mode, total, used)))
}

// ============================================================================
// Cache maintenance (service-account admin only)
// ============================================================================

fn require_sa_admin(auth: &AuthContext, correlation: &RequestId) -> ApiResult<()> {
    if auth.is_service_account() && auth.is_admin() {
        Ok(())
    } else {
        Err(ApiError::forbidden("admin service account required")
            .with_correlation(&correlation.0))
    }
}

/// `POST /cache/rebuild`.
pub async fn cache_rebuild(
    State(state): State<SeState>,
    Extension(auth): Extension<AuthContext>,
    Extension(correlation): Extension<RequestId>,
) -> ApiResult<Response> {
    require_sa_admin(&auth, &correlation)?;
    let report = state.engine.synchronizer().full_rebuild().await.map_err(|e| {
        let api: ApiError = e.into();
        api.with_correlation(&correlation.0)
    })?;
    Ok(Json(report).into_response())
}

/// `POST /cache/rebuild/incremental`.
pub async fn cache_rebuild_incremental(
    State(state): State<SeState>,
    Extension(auth): Extension<AuthContext>,
    Extension(correlation): Extension<RequestId>,
) -> ApiResult<Response> {
    require_sa_admin(&auth, &correlation)?;
    let report = state
        .engine
        .synchronizer()
        .incremental_rebuild()
        .await
        .map_err(|e| {
            let api: ApiError = e.into();
            api.with_correlation(&correlation.0)
        })?;
    Ok(Json(report).into_response())
}

/// `GET /cache/consistency`.
pub async fn cache_consistency(
    State(state): State<SeState>,
    Extension(auth): Extension<AuthContext>,
    Extension(correlation): Extension<RequestId>,
) -> ApiResult<Response> {
    require_sa_admin(&auth, &correlation)?;
    let report = state
        .engine
        .synchronizer()
        .consistency_check()
        .await
        .map_err(|e| {
            let api: ApiError = e.into();
            api.with_correlation(&correlation.0)
        })?;
    Ok(Json(report).into_response())
}

/// `POST /cache/cleanup-expired`.
pub async fn cache_cleanup_expired(
    State(state): State<SeState>,
    Extension(auth): Extension<AuthContext>,
    Extension(correlation): Extension<RequestId>,
) -> ApiResult<Response> {
    require_sa_admin(&auth, &correlation)?;
    let deleted = state
        .engine
        .synchronizer()
        .cleanup_expired()
        .await
        .map_err(|e| {
            let api: ApiError = e.into();
            api.with_correlation(&correlation.0)
        })?;
    Ok(Json(json!({"deleted": deleted})).into_response())
}

// ============================================================================
// GC surface
// ============================================================================

/// `DELETE /gc/{id}`: physical delete for the garbage collector.
pub async fn gc_delete(
    State(state): State<SeState>,
    Extension(auth): Extension<AuthContext>,
    Extension(correlation): Extension<RequestId>,
    Path(file_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    require_sa_admin(&auth, &correlation)?;
    state.engine.physical_delete(file_id).await.map_err(|e| {
        let api: ApiError = e.into();
        api.with_correlation(&correlation.0)
    })?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /gc/{id}/exists`.
pub async fn gc_exists(
    State(state): State<SeState>,
    Extension(auth): Extension<AuthContext>,
    Extension(correlation): Extension<RequestId>,
    Path(file_id): Path<Uuid>,
) -> ApiResult<Response> {
    if !auth.is_service_account() {
        return Err(ApiError::forbidden("service account required")
            .with_correlation(&correlation.0));
    }
    let exists = state.engine.exists(file_id).await.map_err(|e| {
        let api: ApiError = e.into();
        api.with_correlation(&correlation.0)
    })?;
    Ok(Json(json!({"exists": exists})).into_response())
}

// ============================================================================
// Health
// ============================================================================

/// `GET /health/live`.
pub async fn health_live() -> StatusCode {
    StatusCode::OK
}

/// `GET /health/ready`: readiness requires the metadata database.
pub async fn health_ready(State(state): State<SeState>) -> Response {
    match sqlx::query("SELECT 1 AS one").fetch_one(state.cache.pool()).await {
        Ok(row) => {
            let _: i32 = row.get("one");
            StatusCode::OK.into_response()
        }
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error_code": "backend_unavailable", "message": e.to_string()})),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range_full_open() {
        // bytes=0- covers the whole object (served as 206 by the handler).
        let r = parse_range("bytes=0-", 100).unwrap();
        assert_eq!(r, ByteRange { start: 0, end: 99 });
    }

    #[test]
    fn test_parse_range_bounded() {
        let r = parse_range("bytes=10-19", 100).unwrap();
        assert_eq!(r, ByteRange { start: 10, end: 19 });
        assert_eq!(r.len(), 10);
    }

    #[test]
    fn test_parse_range_end_clamped_to_size() {
        let r = parse_range("bytes=90-500", 100).unwrap();
        assert_eq!(r, ByteRange { start: 90, end: 99 });
    }

    #[test]
    fn test_parse_range_start_at_size_unsatisfiable() {
        // bytes={size}- must 416.
        assert_eq!(
            parse_range("bytes=100-", 100).unwrap_err(),
            RangeError::Unsatisfiable
        );
    }

    #[test]
    fn test_parse_range_suffix() {
        let r = parse_range("bytes=-10", 100).unwrap();
        assert_eq!(r, ByteRange { start: 90, end: 99 });

        // Suffix longer than the object: whole object.
        let r = parse_range("bytes=-500", 100).unwrap();
        assert_eq!(r, ByteRange { start: 0, end: 99 });

        assert_eq!(
            parse_range("bytes=-0", 100).unwrap_err(),
            RangeError::Unsatisfiable
        );
    }

    #[test]
    fn test_parse_range_rejects_garbage() {
        assert_eq!(parse_range("units=0-1", 100).unwrap_err(), RangeError::Malformed);
        assert_eq!(
            parse_range("bytes=0-1,5-9", 100).unwrap_err(),
            RangeError::MultipleRanges
        );
        assert_eq!(parse_range("bytes=9-3", 100).unwrap_err(), RangeError::Malformed);
        assert_eq!(parse_range("bytes=a-b", 100).unwrap_err(), RangeError::Malformed);
    }

    proptest::proptest! {
        #[test]
        fn parse_range_never_panics(spec in "bytes=[0-9,-]{0,16}", size in 1u64..100_000) {
            let _ = parse_range(&spec, size);
        }

        #[test]
        fn accepted_ranges_stay_within_object(
            start in 0u64..6_000,
            end in 0u64..12_000,
            size in 1u64..6_000,
        ) {
            if let Ok(r) = parse_range(&format!("bytes={start}-{end}"), size) {
                proptest::prop_assert!(r.start <= r.end);
                proptest::prop_assert!(r.end < size);
            }
        }
    }
}
