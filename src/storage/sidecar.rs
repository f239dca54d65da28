//! Attribute sidecar: the authoritative metadata record for an object.
//!
//! Every object `f` has a colocated `f.attr.json`, a UTF-8 JSON document of
//! at most 4096 bytes. The SQL cache is a disposable mirror of these files;
//! whenever the two disagree, the sidecar wins.
//!
//! Two schema versions exist on disk. Readers accept "1.0" and "2.0";
//! writers always produce "2.0". The v1 top-level `template` field is
//! carried verbatim under `custom.template` and never interpreted.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::core::error::{EngineError, EngineResult};

/// Hard ceiling on the serialized sidecar, in bytes.
pub const MAX_SIDECAR_BYTES: usize = 4096;

/// Maximum accepted original filename, in bytes.
pub const MAX_ORIGINAL_FILENAME_BYTES: usize = 500;

/// Schema version written by this engine.
pub const SCHEMA_VERSION_CURRENT: &str = "2.0";

/// Optional detached-signature reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigitalSignature {
    pub algorithm: String,
    pub signature_file: String,
}

/// The sidecar record.
///
/// Closed set of known fields plus an open `custom` map. `BTreeMap` keeps
/// key order stable so serialize(parse(x)) is byte-identical modulo the
/// original's key order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAttributes {
    pub file_id: Uuid,
    pub original_filename: String,
    pub storage_filename: String,
    /// Hour-bucket prefix relative to the backend base, `YYYY/MM/DD/HH`.
    pub storage_path: String,
    pub size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub sha256_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub md5_hash: Option<String>,
    pub uploaded_by: String,
    pub uploaded_at: DateTime<Utc>,
    pub retention_days: u32,
    pub expires_at: DateTime<Utc>,
    pub version: u32,
    pub schema_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digital_signature: Option<DigitalSignature>,
}

impl FileAttributes {
    /// Assemble a fresh record for an upload.
    #[allow(clippy::too_many_arguments)]
    pub fn for_upload(
        original_filename: String,
        storage_filename: String,
        storage_path: String,
        size_bytes: u64,
        mime_type: Option<String>,
        sha256_hash: String,
        md5_hash: Option<String>,
        uploaded_by: String,
        uploaded_at: DateTime<Utc>,
        retention_days: u32,
    ) -> Self {
        FileAttributes {
            file_id: Uuid::new_v4(),
            original_filename,
            storage_filename,
            storage_path,
            size_bytes,
            mime_type,
            sha256_hash,
            md5_hash,
            uploaded_by,
            uploaded_at,
            retention_days,
            expires_at: uploaded_at + Duration::days(retention_days as i64),
            version: 1,
            schema_version: SCHEMA_VERSION_CURRENT.to_string(),
            description: None,
            tags: Vec::new(),
            custom: BTreeMap::new(),
            digital_signature: None,
        }
    }

    /// Validate invariants that must hold before the record is persisted.
    pub fn validate(&self) -> EngineResult<()> {
        if self.original_filename.is_empty()
            || self.original_filename.len() > MAX_ORIGINAL_FILENAME_BYTES
        {
            return Err(EngineError::Validation(format!(
                "original_filename must be 1..={MAX_ORIGINAL_FILENAME_BYTES} bytes"
            )));
        }
        if self.size_bytes == 0 {
            return Err(EngineError::Validation("size_bytes must be > 0".into()));
        }
        if self.sha256_hash.len() != 64
            || !self.sha256_hash.chars().all(|c| c.is_ascii_hexdigit())
            || self.sha256_hash.chars().any(|c| c.is_ascii_uppercase())
        {
            return Err(EngineError::Validation(
                "sha256_hash must be 64 lowercase hex chars".into(),
            ));
        }
        if self.retention_days == 0 {
            return Err(EngineError::Validation("retention_days must be > 0".into()));
        }
        if self.version == 0 {
            return Err(EngineError::Validation("version must be >= 1".into()));
        }
        Ok(())
    }

    /// Serialize to the on-disk form, enforcing the size ceiling.
    pub fn to_bytes(&self) -> EngineResult<Vec<u8>> {
        let bytes = serde_json::to_vec(self)?;
        if bytes.len() > MAX_SIDECAR_BYTES {
            return Err(EngineError::AttrTooLarge {
                limit: MAX_SIDECAR_BYTES,
                actual: bytes.len(),
            });
        }
        Ok(bytes)
    }

    /// Parse a sidecar, accepting both schema versions.
    ///
    /// v1 documents carry `template` at the top level; it is moved under
    /// `custom.template` untouched. The record is reported as "2.0" so a
    /// subsequent write migrates the file.
    pub fn from_bytes(bytes: &[u8]) -> EngineResult<Self> {
        let mut raw: serde_json::Map<String, Value> = serde_json::from_slice(bytes)?;

        let schema_version = raw
            .get("schema_version")
            .and_then(Value::as_str)
            .unwrap_or("1.0")
            .to_string();
        match schema_version.as_str() {
            "1.0" | "2.0" => {}
            other => {
                return Err(EngineError::Validation(format!(
                    "unsupported sidecar schema_version: {other}"
                )))
            }
        }

        if schema_version == "1.0" {
            if let Some(template) = raw.remove("template") {
                let custom = raw
                    .entry("custom".to_string())
                    .or_insert_with(|| Value::Object(serde_json::Map::new()));
                if let Value::Object(map) = custom {
                    map.entry("template".to_string()).or_insert(template);
                }
            }
            raw.insert(
                "schema_version".to_string(),
                Value::String(SCHEMA_VERSION_CURRENT.to_string()),
            );
        }

        let attrs: FileAttributes = serde_json::from_value(Value::Object(raw))?;
        Ok(attrs)
    }

    /// Recompute `expires_at` after a retention change.
    pub fn set_retention_days(&mut self, retention_days: u32) {
        self.retention_days = retention_days;
        self.expires_at = self.uploaded_at + Duration::days(retention_days as i64);
    }

    /// Relative object path under the backend base.
    pub fn object_key(&self) -> String {
        format!("{}/{}", self.storage_path, self.storage_filename)
    }

    /// Relative sidecar path under the backend base.
    pub fn sidecar_key(&self) -> String {
        format!("{}{}", self.object_key(), super::naming::SIDECAR_SUFFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> FileAttributes {
        FileAttributes::for_upload(
            "report.pdf".into(),
            "report_alice_20251108T103045_1a2b3c4d.pdf".into(),
            "2025/11/08/10".into(),
            1_048_576,
            Some("application/pdf".into()),
            "30e14955ebf1352266dc2ff8067e68104607e750abb9d3b36582b8af909fcb58".into(),
            None,
            "alice".into(),
            Utc.with_ymd_and_hms(2025, 11, 8, 10, 30, 45).unwrap(),
            365,
        )
    }

    #[test]
    fn test_expires_at_derivation() {
        let attrs = sample();
        assert_eq!(
            attrs.expires_at,
            Utc.with_ymd_and_hms(2026, 11, 8, 10, 30, 45).unwrap()
        );
    }

    #[test]
    fn test_round_trip_is_identity() {
        let mut attrs = sample();
        attrs.description = Some("Q3".into());
        attrs.tags = vec!["2025".into(), "Q3".into()];
        attrs
            .custom
            .insert("department".into(), Value::String("finance".into()));

        let bytes = attrs.to_bytes().unwrap();
        let parsed = FileAttributes::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, attrs);
        // Reserialization of a parsed record is byte-identical.
        assert_eq!(parsed.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn test_v1_template_moves_under_custom() {
        let attrs = sample();
        let mut raw: serde_json::Map<String, Value> =
            serde_json::from_slice(&attrs.to_bytes().unwrap()).unwrap();
        raw.insert("schema_version".into(), Value::String("1.0".into()));
        raw.insert(
            "template".into(),
            serde_json::json!({"layout": "invoice", "v": 3}),
        );
        let v1_bytes = serde_json::to_vec(&raw).unwrap();

        let parsed = FileAttributes::from_bytes(&v1_bytes).unwrap();
        assert_eq!(parsed.schema_version, "2.0");
        assert_eq!(
            parsed.custom.get("template").unwrap(),
            &serde_json::json!({"layout": "invoice", "v": 3})
        );
    }

    #[test]
    fn test_unknown_schema_version_rejected() {
        let attrs = sample();
        let mut raw: serde_json::Map<String, Value> =
            serde_json::from_slice(&attrs.to_bytes().unwrap()).unwrap();
        raw.insert("schema_version".into(), Value::String("3.0".into()));
        let bytes = serde_json::to_vec(&raw).unwrap();
        assert!(FileAttributes::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_size_ceiling_enforced() {
        let mut attrs = sample();
        let baseline = attrs.to_bytes().unwrap().len();
        // Pad custom until serialization crosses the ceiling.
        let filler = "x".repeat(MAX_SIDECAR_BYTES - baseline);
        attrs.custom.insert("filler".into(), Value::String(filler));
        let err = attrs.to_bytes().unwrap_err();
        assert!(matches!(err, EngineError::AttrTooLarge { .. }));
    }

    #[test]
    fn test_exactly_at_ceiling_succeeds() {
        let mut attrs = sample();
        // Each 'x' adds exactly one serialized byte once the entry exists.
        attrs.custom.insert("filler".into(), Value::String(String::new()));
        let pad = MAX_SIDECAR_BYTES - attrs.to_bytes().unwrap().len();
        attrs
            .custom
            .insert("filler".into(), Value::String("x".repeat(pad)));
        let bytes = attrs.to_bytes().unwrap();
        assert_eq!(bytes.len(), MAX_SIDECAR_BYTES);

        // One byte more fails.
        attrs
            .custom
            .insert("filler".into(), Value::String("x".repeat(pad + 1)));
        assert!(matches!(
            attrs.to_bytes().unwrap_err(),
            EngineError::AttrTooLarge { .. }
        ));
    }

    #[test]
    fn test_validate_rejects_bad_hash() {
        let mut attrs = sample();
        attrs.sha256_hash = "ABCD".into();
        assert!(attrs.validate().is_err());

        let mut attrs = sample();
        attrs.sha256_hash = attrs.sha256_hash.to_uppercase();
        assert!(attrs.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_long_filename() {
        let mut attrs = sample();
        attrs.original_filename = "x".repeat(MAX_ORIGINAL_FILENAME_BYTES + 1);
        assert!(attrs.validate().is_err());
    }

    #[test]
    fn test_object_and_sidecar_keys() {
        let attrs = sample();
        assert_eq!(
            attrs.object_key(),
            "2025/11/08/10/report_alice_20251108T103045_1a2b3c4d.pdf"
        );
        assert!(attrs.sidecar_key().ends_with(".pdf.attr.json"));
    }
}
