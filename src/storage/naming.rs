//! Deterministic file naming and hour-bucketed placement.
//!
//! Storage filenames are `{stem}_{username}_{YYYYMMDDTHHMMSS}_{uuid8}.{ext}`
//! truncated so the whole name stays within 200 bytes, and objects land in
//! `base/YYYY/MM/DD/HH/`. First writes into a fresh hour directory are
//! fenced per directory so concurrent uploads do not race `mkdir`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Datelike, Timelike, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::core::error::EngineResult;

/// Maximum generated filename length in bytes.
pub const MAX_STORAGE_FILENAME_BYTES: usize = 200;

/// Suffix appended to an object path to locate its sidecar.
pub const SIDECAR_SUFFIX: &str = ".attr.json";

/// Split a client-supplied filename into (stem, extension).
/// The extension excludes the dot and may be empty.
fn split_filename(original: &str) -> (&str, &str) {
    match original.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, ext),
        _ => (original, ""),
    }
}

/// Replace path separators and control characters so a client filename can
/// never escape the hour bucket.
fn sanitize_component(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '/' | '\\' | '\0' | '\n' | '\r' | '\t' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

/// Truncate a string to at most `max` bytes on a char boundary.
fn truncate_bytes(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Build the storage filename for an upload.
///
/// The stem is truncated first so the username, timestamp, and uuid8
/// components always survive intact.
pub fn storage_filename(original: &str, username: &str, uploaded_at: DateTime<Utc>) -> String {
    let (stem, ext) = split_filename(original);
    let stem = sanitize_component(stem);
    // Principal names and extensions are bounded so the timestamp and
    // uuid components always survive the 200-byte cap.
    let username = sanitize_component(username);
    let username = truncate_bytes(&username, 64).to_string();
    let ext = sanitize_component(ext);
    let ext = truncate_bytes(&ext, 32).to_string();

    let timestamp = uploaded_at.format("%Y%m%dT%H%M%S").to_string();
    let uuid8 = &Uuid::new_v4().simple().to_string()[..8];

    // `_user_timestamp_uuid8` plus `.ext` must fit in the budget.
    let fixed = 1 + username.len() + 1 + timestamp.len() + 1 + uuid8.len()
        + if ext.is_empty() { 0 } else { 1 + ext.len() };
    let stem_budget = MAX_STORAGE_FILENAME_BYTES.saturating_sub(fixed).max(1);
    let stem = truncate_bytes(&stem, stem_budget);

    if ext.is_empty() {
        format!("{stem}_{username}_{timestamp}_{uuid8}")
    } else {
        format!("{stem}_{username}_{timestamp}_{uuid8}.{ext}")
    }
}

/// Relative hour-bucket prefix: `YYYY/MM/DD/HH`.
pub fn storage_path(uploaded_at: DateTime<Utc>) -> String {
    format!(
        "{:04}/{:02}/{:02}/{:02}",
        uploaded_at.year(),
        uploaded_at.month(),
        uploaded_at.day(),
        uploaded_at.hour()
    )
}

/// Sidecar path for an object path.
pub fn sidecar_path(object_path: &Path) -> PathBuf {
    let mut os = object_path.as_os_str().to_owned();
    os.push(SIDECAR_SUFFIX);
    PathBuf::from(os)
}

/// Per-directory creation fence.
///
/// `create_dir_all` is not atomic with respect to sibling file creation on
/// all backends, so the first writer into a fresh hour bucket holds a local
/// lock while it creates the directory. The guard releases on drop, so a
/// panicking holder cannot wedge the fence.
#[derive(Default)]
pub struct DirFence {
    fences: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl DirFence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensure `dir` exists, holding the per-directory fence across the
    /// existence check and creation.
    pub async fn ensure_dir(&self, dir: &Path) -> EngineResult<()> {
        let fence = self
            .fences
            .entry(dir.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = fence.lock().await;
        if tokio::fs::try_exists(dir).await? {
            return Ok(());
        }
        tokio::fs::create_dir_all(dir).await?;
        Ok(())
    }

    /// Drop fences for directories that already exist; keeps the map from
    /// growing one entry per hour forever.
    pub fn prune(&self) {
        self.fences.retain(|dir, _| !dir.exists());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 8, 10, 30, 45).unwrap()
    }

    #[test]
    fn test_storage_filename_pattern() {
        let name = storage_filename("report.pdf", "alice", at());
        assert!(name.starts_with("report_alice_20251108T103045_"));
        assert!(name.ends_with(".pdf"));
        assert!(name.len() <= MAX_STORAGE_FILENAME_BYTES);

        // uuid8 component is 8 hex chars
        let uuid8 = name
            .trim_end_matches(".pdf")
            .rsplit('_')
            .next()
            .unwrap();
        assert_eq!(uuid8.len(), 8);
        assert!(uuid8.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_storage_filename_truncates_long_stem() {
        let long = "x".repeat(400) + ".bin";
        let name = storage_filename(&long, "bob", at());
        assert!(name.len() <= MAX_STORAGE_FILENAME_BYTES);
        assert!(name.ends_with(".bin"));
        assert!(name.contains("_bob_"));
    }

    #[test]
    fn test_storage_filename_no_extension() {
        let name = storage_filename("Makefile", "carol", at());
        assert!(name.starts_with("Makefile_carol_"));
        assert!(!name.contains('.'));
    }

    #[test]
    fn test_filename_sanitizes_separators() {
        let name = storage_filename("../../etc/passwd", "eve", at());
        assert!(!name.contains('/'));
        assert!(!name.contains(".."));

        let name = storage_filename("a\\b.txt", "eve", at());
        assert!(!name.contains('\\'));
    }

    #[test]
    fn test_storage_path_layout() {
        assert_eq!(storage_path(at()), "2025/11/08/10");
    }

    #[test]
    fn test_sidecar_path() {
        let p = sidecar_path(Path::new("/base/2025/11/08/10/f.pdf"));
        assert_eq!(p, PathBuf::from("/base/2025/11/08/10/f.pdf.attr.json"));
    }

    proptest::proptest! {
        #[test]
        fn storage_filename_always_bounded(
            original in ".{0,300}",
            username in "[a-zA-Z0-9._-]{1,40}",
        ) {
            let name = storage_filename(&original, &username, at());
            proptest::prop_assert!(name.len() <= MAX_STORAGE_FILENAME_BYTES);
            proptest::prop_assert!(!name.contains('/'));
            proptest::prop_assert!(!name.contains('\\'));
        }
    }

    #[tokio::test]
    async fn test_dir_fence_concurrent_creation() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("2025/11/08/10");
        let fence = Arc::new(DirFence::new());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let fence = fence.clone();
            let dir = dir.clone();
            handles.push(tokio::spawn(async move { fence.ensure_dir(&dir).await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert!(dir.is_dir());
    }
}
