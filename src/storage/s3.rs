//! S3/MinIO backend.
//!
//! Talks to the bucket over the S3 REST API with SigV4 request signing.
//! Uploads spool to a local temp file so partially received streams never
//! reach the bucket; the final PUT is atomic on the S3 side. Capacity is a
//! tracked counter reconciled against a full prefix listing on a timer,
//! since buckets have no statvfs.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio_util::io::StreamReader;
use uuid::Uuid;

use crate::core::config::S3Config;
use crate::core::error::{EngineError, EngineResult};
use crate::storage::backend::{
    ByteRange, ObjectReader, ObjectStat, ObjectUpload, StorageBackend,
};

type HmacSha256 = Hmac<Sha256>;

const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";
const EMPTY_PAYLOAD_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Signing context shared by the backend and its in-flight uploads.
#[derive(Clone)]
struct S3Signer {
    config: S3Config,
    client: Client,
}

impl S3Signer {
    fn object_url(&self, key: &str) -> String {
        format!(
            "{}/{}/{}",
            self.config.endpoint.trim_end_matches('/'),
            self.config.bucket,
            key
        )
    }

    fn host(&self) -> String {
        self.config
            .endpoint
            .trim_start_matches("http://")
            .trim_start_matches("https://")
            .trim_end_matches('/')
            .to_string()
    }

    /// Percent-encode a URI path, keeping `/` separators.
    fn uri_encode_path(path: &str) -> String {
        path.bytes()
            .map(|b| match b {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'/' => {
                    (b as char).to_string()
                }
                other => format!("%{other:02X}"),
            })
            .collect()
    }

    fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }

    /// Build the SigV4 header set for one request.
    fn sign(
        &self,
        method: &Method,
        canonical_path: &str,
        canonical_query: &str,
        payload_hash: &str,
        extra_headers: &[(&str, &str)],
    ) -> HeaderMap {
        let now = Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let scope = format!("{date}/{}/s3/aws4_request", self.config.region);

        // Canonical headers must be sorted by name.
        let mut headers: Vec<(String, String)> = vec![
            ("host".into(), self.host()),
            ("x-amz-content-sha256".into(), payload_hash.to_string()),
            ("x-amz-date".into(), amz_date.clone()),
        ];
        for (k, v) in extra_headers {
            headers.push((k.to_lowercase(), v.to_string()));
        }
        headers.sort();

        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{k}:{}\n", v.trim()))
            .collect();
        let signed_headers: String = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method.as_str(),
            Self::uri_encode_path(canonical_path),
            canonical_query,
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let k_date = Self::hmac(
            format!("AWS4{}", self.config.secret_key).as_bytes(),
            date.as_bytes(),
        );
        let k_region = Self::hmac(&k_date, self.config.region.as_bytes());
        let k_service = Self::hmac(&k_region, b"s3");
        let k_signing = Self::hmac(&k_service, b"aws4_request");
        let signature = hex::encode(Self::hmac(&k_signing, string_to_sign.as_bytes()));

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            self.config.access_key
        );

        let mut out = HeaderMap::new();
        out.insert(
            "authorization",
            HeaderValue::from_str(&authorization).expect("signature is ascii"),
        );
        out.insert(
            "x-amz-date",
            HeaderValue::from_str(&amz_date).expect("date is ascii"),
        );
        out.insert(
            "x-amz-content-sha256",
            HeaderValue::from_str(payload_hash).expect("hash is ascii"),
        );
        for (k, v) in extra_headers {
            if let Ok(value) = HeaderValue::from_str(v) {
                if let Ok(name) = reqwest::header::HeaderName::from_bytes(k.as_bytes()) {
                    out.insert(name, value);
                }
            }
        }
        out
    }

    /// Send a signed object-level request.
    async fn send_object(
        &self,
        method: Method,
        key: &str,
        payload_hash: &str,
        body: Option<reqwest::Body>,
        extra_headers: &[(&str, &str)],
    ) -> EngineResult<reqwest::Response> {
        let path = format!("/{}/{}", self.config.bucket, key);
        let headers = self.sign(&method, &path, "", payload_hash, extra_headers);
        let mut req = self
            .client
            .request(method, self.object_url(key))
            .headers(headers);
        if let Some(body) = body {
            req = req.body(body);
        }
        req.send()
            .await
            .map_err(|e| EngineError::BackendUnavailable(format!("s3 request failed: {e}")))
    }

    /// Send a signed bucket-level list request and parse the result.
    async fn send_list(&self, query: &str) -> EngineResult<ListBucketResult> {
        let path = format!("/{}", self.config.bucket);
        let headers = self.sign(&Method::GET, &path, query, EMPTY_PAYLOAD_SHA256, &[]);
        let url = format!(
            "{}/{}?{}",
            self.config.endpoint.trim_end_matches('/'),
            self.config.bucket,
            query
        );
        let response = self
            .client
            .get(&url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| EngineError::BackendUnavailable(format!("s3 list failed: {e}")))?;
        if !response.status().is_success() {
            return Err(EngineError::BackendUnavailable(format!(
                "s3 list returned {}",
                response.status()
            )));
        }
        let body = response
            .text()
            .await
            .map_err(|e| EngineError::BackendUnavailable(format!("s3 list body: {e}")))?;
        quick_xml::de::from_str(&body)
            .map_err(|e| EngineError::Internal(format!("s3 list parse: {e}")))
    }
}

/// S3-backed driver.
pub struct S3Backend {
    signer: S3Signer,
    capacity_total: u64,
    /// Tracked used bytes; authoritative between reconciliations.
    used: Arc<AtomicU64>,
}

impl S3Backend {
    pub fn new(config: S3Config, capacity_total: u64) -> Self {
        Self {
            signer: S3Signer {
                config,
                client: Client::new(),
            },
            capacity_total,
            used: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Recompute the tracked used counter from a full listing. Run on a
    /// timer by the health reporter so drift never outlives a few cycles.
    pub async fn reconcile_used(&self) -> EngineResult<u64> {
        let mut total = 0u64;
        let mut token: Option<String> = None;
        loop {
            let query = match &token {
                Some(t) => format!("continuation-token={t}&list-type=2"),
                None => "list-type=2".to_string(),
            };
            let parsed = self.signer.send_list(&query).await?;
            total += parsed.contents.iter().map(|c| c.size).sum::<u64>();
            if !parsed.is_truncated {
                break;
            }
            token = parsed.next_continuation_token;
            if token.is_none() {
                break;
            }
        }
        self.used.store(total, Ordering::Relaxed);
        Ok(total)
    }
}

/// Spooled upload: chunks land in a local temp file, pushed to the bucket
/// in a single signed PUT on finalize.
struct S3Upload {
    key: String,
    spool_path: PathBuf,
    spool: Option<tokio::fs::File>,
    written: u64,
    signer: S3Signer,
    used: Arc<AtomicU64>,
}

#[async_trait]
impl ObjectUpload for S3Upload {
    async fn write_chunk(&mut self, chunk: &[u8]) -> EngineResult<()> {
        let spool = self
            .spool
            .as_mut()
            .ok_or_else(|| EngineError::Internal("upload already closed".into()))?;
        spool.write_all(chunk).await?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    async fn finalize(mut self: Box<Self>) -> EngineResult<()> {
        let mut spool = self
            .spool
            .take()
            .ok_or_else(|| EngineError::Internal("upload already closed".into()))?;
        spool.flush().await?;
        spool.sync_all().await?;
        drop(spool);

        let file = tokio::fs::File::open(&self.spool_path).await?;
        let stream = tokio_util::io::ReaderStream::new(file);
        let body = reqwest::Body::wrap_stream(stream);
        let length = self.written.to_string();
        let response = self
            .signer
            .send_object(
                Method::PUT,
                &self.key,
                UNSIGNED_PAYLOAD,
                Some(body),
                &[("content-length", length.as_str())],
            )
            .await;
        let _ = tokio::fs::remove_file(&self.spool_path).await;
        let response = response?;
        if !response.status().is_success() {
            return Err(EngineError::BackendUnavailable(format!(
                "s3 put returned {} for {}",
                response.status(),
                self.key
            )));
        }
        self.used.fetch_add(self.written, Ordering::Relaxed);
        Ok(())
    }

    async fn abort(mut self: Box<Self>) -> EngineResult<()> {
        self.spool.take();
        let _ = tokio::fs::remove_file(&self.spool_path).await;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListBucketResult {
    #[serde(default)]
    contents: Vec<ListEntry>,
    #[serde(default)]
    is_truncated: bool,
    next_continuation_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListEntry {
    key: String,
    size: u64,
}

#[async_trait]
impl StorageBackend for S3Backend {
    async fn begin_upload(&self, key: &str) -> EngineResult<Box<dyn ObjectUpload>> {
        let spool_path =
            std::env::temp_dir().join(format!("artstore-s3-{}", Uuid::new_v4().simple()));
        let spool = tokio::fs::File::create(&spool_path).await?;
        Ok(Box::new(S3Upload {
            key: key.to_string(),
            spool_path,
            spool: Some(spool),
            written: 0,
            signer: self.signer.clone(),
            used: self.used.clone(),
        }))
    }

    async fn read_object(&self, key: &str, range: Option<ByteRange>) -> EngineResult<ObjectReader> {
        let range_header = range.map(|r| format!("bytes={}-{}", r.start, r.end));
        let extra: Vec<(&str, &str)> = match &range_header {
            Some(h) => vec![("range", h.as_str())],
            None => Vec::new(),
        };
        let response = self
            .signer
            .send_object(Method::GET, key, EMPTY_PAYLOAD_SHA256, None, &extra)
            .await?;
        match response.status() {
            StatusCode::OK | StatusCode::PARTIAL_CONTENT => {}
            StatusCode::NOT_FOUND => return Err(EngineError::NotFound(key.to_string())),
            other => {
                return Err(EngineError::BackendUnavailable(format!(
                    "s3 get returned {other} for {key}"
                )))
            }
        }
        let stream = response
            .bytes_stream()
            .map(|r| r.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)));
        Ok(Box::new(StreamReader::new(stream)))
    }

    async fn stat_object(&self, key: &str) -> EngineResult<Option<ObjectStat>> {
        let response = self
            .signer
            .send_object(Method::HEAD, key, EMPTY_PAYLOAD_SHA256, None, &[])
            .await?;
        match response.status() {
            StatusCode::OK => {
                let size = response
                    .headers()
                    .get(reqwest::header::CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                Ok(Some(ObjectStat { size_bytes: size }))
            }
            StatusCode::NOT_FOUND => Ok(None),
            other => Err(EngineError::BackendUnavailable(format!(
                "s3 head returned {other} for {key}"
            ))),
        }
    }

    async fn delete_object(&self, key: &str) -> EngineResult<()> {
        let size = self
            .stat_object(key)
            .await
            .ok()
            .flatten()
            .map(|s| s.size_bytes)
            .unwrap_or(0);
        let response = self
            .signer
            .send_object(Method::DELETE, key, EMPTY_PAYLOAD_SHA256, None, &[])
            .await?;
        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::OK | StatusCode::NOT_FOUND => {
                if size > 0 {
                    self.used
                        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |u| {
                            Some(u.saturating_sub(size))
                        })
                        .ok();
                }
                Ok(())
            }
            other => Err(EngineError::BackendUnavailable(format!(
                "s3 delete returned {other} for {key}"
            ))),
        }
    }

    async fn list_prefix(&self, prefix: &str) -> EngineResult<Vec<String>> {
        let encoded_prefix = S3Signer::uri_encode_path(prefix).replace('/', "%2F");
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let query = match &token {
                Some(t) => format!("continuation-token={t}&list-type=2&prefix={encoded_prefix}"),
                None => format!("list-type=2&prefix={encoded_prefix}"),
            };
            let parsed = self.signer.send_list(&query).await?;
            keys.extend(parsed.contents.iter().map(|c| c.key.clone()));
            if !parsed.is_truncated {
                break;
            }
            token = parsed.next_continuation_token;
            if token.is_none() {
                break;
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn write_sidecar_atomic(&self, key: &str, bytes: &[u8]) -> EngineResult<()> {
        // Object replacement is atomic on S3; a single PUT suffices.
        let payload_hash = hex::encode(Sha256::digest(bytes));
        let length = bytes.len().to_string();
        let response = self
            .signer
            .send_object(
                Method::PUT,
                key,
                &payload_hash,
                Some(reqwest::Body::from(bytes.to_vec())),
                &[("content-length", length.as_str())],
            )
            .await?;
        if !response.status().is_success() {
            return Err(EngineError::BackendUnavailable(format!(
                "s3 sidecar put returned {} for {key}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn read_sidecar(&self, key: &str) -> EngineResult<Option<Vec<u8>>> {
        let response = self
            .signer
            .send_object(Method::GET, key, EMPTY_PAYLOAD_SHA256, None, &[])
            .await?;
        match response.status() {
            StatusCode::OK => {
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| EngineError::BackendUnavailable(format!("s3 body: {e}")))?;
                Ok(Some(bytes.to_vec()))
            }
            StatusCode::NOT_FOUND => Ok(None),
            other => Err(EngineError::BackendUnavailable(format!(
                "s3 sidecar get returned {other} for {key}"
            ))),
        }
    }

    async fn capacity(&self) -> EngineResult<(u64, u64)> {
        Ok((self.capacity_total, self.used.load(Ordering::Relaxed)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> S3Backend {
        S3Backend::new(
            S3Config {
                endpoint: "http://localhost:9000".into(),
                region: "us-east-1".into(),
                bucket: "artstore".into(),
                access_key: "AKIDEXAMPLE".into(),
                secret_key: "secret".into(),
            },
            1 << 40,
        )
    }

    #[test]
    fn test_uri_encode_keeps_separators() {
        assert_eq!(
            S3Signer::uri_encode_path("/bucket/2025/11/08/10/f.pdf"),
            "/bucket/2025/11/08/10/f.pdf"
        );
        assert_eq!(S3Signer::uri_encode_path("/b/a b"), "/b/a%20b");
    }

    #[test]
    fn test_sign_produces_authorization_header() {
        let b = backend();
        let headers = b
            .signer
            .sign(&Method::GET, "/artstore/k", "", EMPTY_PAYLOAD_SHA256, &[]);
        let auth = headers.get("authorization").unwrap().to_str().unwrap();
        assert!(auth.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/"));
        assert!(auth.contains("SignedHeaders=host;x-amz-content-sha256;x-amz-date"));
        assert!(auth.contains("Signature="));
    }

    #[test]
    fn test_list_response_parsing() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
            <ListBucketResult>
                <IsTruncated>false</IsTruncated>
                <Contents><Key>2025/11/08/10/a.pdf</Key><Size>100</Size></Contents>
                <Contents><Key>2025/11/08/10/a.pdf.attr.json</Key><Size>512</Size></Contents>
            </ListBucketResult>"#;
        let parsed: ListBucketResult = quick_xml::de::from_str(xml).unwrap();
        assert_eq!(parsed.contents.len(), 2);
        assert_eq!(parsed.contents[0].key, "2025/11/08/10/a.pdf");
        assert_eq!(parsed.contents[1].size, 512);
        assert!(!parsed.is_truncated);
    }

    #[tokio::test]
    async fn test_tracked_capacity() {
        let b = backend();
        b.used.store(42, Ordering::Relaxed);
        let (total, used) = b.capacity().await.unwrap();
        assert_eq!(total, 1 << 40);
        assert_eq!(used, 42);
    }
}
