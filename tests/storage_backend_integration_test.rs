//! Integration tests for the local backend, naming, and sidecar layers
//! working together: the durable-upload path minus the SQL mirror.

use chrono::{TimeZone, Utc};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use artstore::storage::backend::{ByteRange, StorageBackend};
use artstore::storage::local::LocalBackend;
use artstore::storage::naming;
use artstore::storage::sidecar::FileAttributes;

fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[tokio::test]
async fn upload_object_with_sidecar_and_read_back() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = LocalBackend::new(tmp.path().to_path_buf(), 0);

    let uploaded_at = Utc.with_ymd_and_hms(2025, 11, 8, 10, 30, 45).unwrap();
    let payload = vec![0u8; 1_048_576];
    let sha256 = hex_sha256(&payload);
    // Known digest of 1 MiB of zeros.
    assert_eq!(
        sha256,
        "30e14955ebf1352266dc2ff8067e68104607e750abb9d3b36582b8af909fcb58"
    );

    let storage_filename = naming::storage_filename("report.pdf", "alice", uploaded_at);
    let storage_path = naming::storage_path(uploaded_at);
    assert_eq!(storage_path, "2025/11/08/10");
    assert!(storage_filename.len() <= naming::MAX_STORAGE_FILENAME_BYTES);

    let object_key = format!("{storage_path}/{storage_filename}");

    // Stream the object in chunks, then make it visible.
    let mut upload = backend.begin_upload(&object_key).await.unwrap();
    for chunk in payload.chunks(64 * 1024) {
        upload.write_chunk(chunk).await.unwrap();
    }
    upload.finalize().await.unwrap();

    // Sidecar beside it.
    let attrs = FileAttributes::for_upload(
        "report.pdf".into(),
        storage_filename.clone(),
        storage_path.clone(),
        payload.len() as u64,
        Some("application/pdf".into()),
        sha256.clone(),
        None,
        "alice".into(),
        uploaded_at,
        365,
    );
    attrs.validate().unwrap();
    let sidecar_bytes = attrs.to_bytes().unwrap();
    backend
        .write_sidecar_atomic(&attrs.sidecar_key(), &sidecar_bytes)
        .await
        .unwrap();

    // Object bytes round-trip.
    let mut reader = backend.read_object(&object_key, None).await.unwrap();
    let mut read_back = Vec::new();
    reader.read_to_end(&mut read_back).await.unwrap();
    assert_eq!(read_back.len(), payload.len());
    assert_eq!(hex_sha256(&read_back), sha256);

    // Sidecar parses back to an identical record.
    let raw = backend
        .read_sidecar(&attrs.sidecar_key())
        .await
        .unwrap()
        .expect("sidecar present");
    let parsed = FileAttributes::from_bytes(&raw).unwrap();
    assert_eq!(parsed, attrs);
    assert_eq!(parsed.size_bytes, 1_048_576);
    assert_eq!(parsed.schema_version, "2.0");

    // The listing shows exactly the object and its sidecar.
    let keys = backend.list_prefix("").await.unwrap();
    assert_eq!(keys.len(), 2);
    assert!(keys.contains(&object_key));
    assert!(keys.contains(&attrs.sidecar_key()));
}

#[tokio::test]
async fn range_reads_match_rfc_semantics() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = LocalBackend::new(tmp.path().to_path_buf(), 0);

    let key = "2025/01/01/00/digits.txt";
    let mut upload = backend.begin_upload(key).await.unwrap();
    upload.write_chunk(b"0123456789").await.unwrap();
    upload.finalize().await.unwrap();

    // Inclusive-end range.
    let mut reader = backend
        .read_object(key, Some(ByteRange { start: 3, end: 6 }))
        .await
        .unwrap();
    let mut buf = String::new();
    reader.read_to_string(&mut buf).await.unwrap();
    assert_eq!(buf, "3456");

    // Single trailing byte.
    let mut reader = backend
        .read_object(key, Some(ByteRange { start: 9, end: 9 }))
        .await
        .unwrap();
    let mut buf = String::new();
    reader.read_to_string(&mut buf).await.unwrap();
    assert_eq!(buf, "9");
}

#[tokio::test]
async fn delete_removes_object_and_sidecar_independently() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = LocalBackend::new(tmp.path().to_path_buf(), 0);

    let key = "2025/01/01/00/doomed.bin";
    let sidecar_key = format!("{key}{}", naming::SIDECAR_SUFFIX);
    let mut upload = backend.begin_upload(key).await.unwrap();
    upload.write_chunk(b"bytes").await.unwrap();
    upload.finalize().await.unwrap();
    backend
        .write_sidecar_atomic(&sidecar_key, b"{}")
        .await
        .unwrap();

    // Sidecar first (the delete protocol order), then the object.
    backend.delete_object(&sidecar_key).await.unwrap();
    assert!(backend.read_sidecar(&sidecar_key).await.unwrap().is_none());
    assert!(backend.stat_object(key).await.unwrap().is_some());

    backend.delete_object(key).await.unwrap();
    assert!(backend.stat_object(key).await.unwrap().is_none());
    assert!(backend.list_prefix("").await.unwrap().is_empty());
}

#[tokio::test]
async fn interrupted_upload_stays_invisible() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = LocalBackend::new(tmp.path().to_path_buf(), 0);

    let key = "2025/01/01/00/partial.bin";
    let mut upload = backend.begin_upload(key).await.unwrap();
    upload.write_chunk(b"half written").await.unwrap();

    // Before finalize the object is not observable.
    assert!(backend.stat_object(key).await.unwrap().is_none());
    assert!(backend.list_prefix("").await.unwrap().is_empty());

    upload.abort().await.unwrap();
    assert!(backend.stat_object(key).await.unwrap().is_none());
}
