//! Local-filesystem backend.
//!
//! Objects live under `base/YYYY/MM/DD/HH/`. Uploads stream into a hidden
//! temp file in the final directory and are renamed into place after fsync,
//! so a crash never leaves a partially visible object. Capacity comes from
//! the filesystem hosting the base directory (statvfs equivalent).

use std::io::SeekFrom;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::Mutex;
use sysinfo::Disks;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use uuid::Uuid;

use crate::core::error::{EngineError, EngineResult};
use crate::storage::backend::{
    ByteRange, ObjectReader, ObjectStat, ObjectUpload, StorageBackend,
};
use crate::storage::naming::DirFence;

/// Filesystem-backed driver.
pub struct LocalBackend {
    base: PathBuf,
    /// Configured capacity ceiling; caps whatever the disk reports.
    capacity_total: u64,
    fence: DirFence,
    /// Disk probe is blocking and not Sync; guard it.
    disks: Mutex<Disks>,
}

impl LocalBackend {
    pub fn new(base: PathBuf, capacity_total: u64) -> Self {
        Self {
            base,
            capacity_total,
            fence: DirFence::new(),
            disks: Mutex::new(Disks::new_with_refreshed_list()),
        }
    }

    fn abs(&self, key: &str) -> PathBuf {
        self.base.join(key)
    }

    /// Available bytes on the filesystem that hosts the base directory.
    fn disk_available(&self) -> Option<(u64, u64)> {
        let mut disks = self.disks.lock();
        disks.refresh();
        disks
            .iter()
            .filter(|d| self.base.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .map(|d| (d.total_space(), d.available_space()))
    }
}

/// Streamed upload into a temp file beside the final location.
struct LocalUpload {
    temp_path: PathBuf,
    final_path: PathBuf,
    file: Option<File>,
}

#[async_trait]
impl ObjectUpload for LocalUpload {
    async fn write_chunk(&mut self, chunk: &[u8]) -> EngineResult<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| EngineError::Internal("upload already closed".into()))?;
        file.write_all(chunk).await?;
        Ok(())
    }

    async fn finalize(mut self: Box<Self>) -> EngineResult<()> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| EngineError::Internal("upload already closed".into()))?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&self.temp_path, &self.final_path).await?;
        Ok(())
    }

    async fn abort(mut self: Box<Self>) -> EngineResult<()> {
        self.file.take();
        match tokio::fs::remove_file(&self.temp_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    async fn begin_upload(&self, key: &str) -> EngineResult<Box<dyn ObjectUpload>> {
        let final_path = self.abs(key);
        let dir = final_path
            .parent()
            .ok_or_else(|| EngineError::Validation(format!("key has no parent: {key}")))?
            .to_path_buf();
        self.fence.ensure_dir(&dir).await?;

        let temp_name = format!(
            ".{}.tmp-{}",
            final_path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("upload"),
            Uuid::new_v4().simple()
        );
        let temp_path = dir.join(temp_name);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .await?;

        Ok(Box::new(LocalUpload {
            temp_path,
            final_path,
            file: Some(file),
        }))
    }

    async fn read_object(&self, key: &str, range: Option<ByteRange>) -> EngineResult<ObjectReader> {
        let path = self.abs(key);
        let mut file = match File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EngineError::NotFound(key.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        match range {
            None => Ok(Box::new(file)),
            Some(r) => {
                file.seek(SeekFrom::Start(r.start)).await?;
                Ok(Box::new(file.take(r.len())))
            }
        }
    }

    async fn stat_object(&self, key: &str) -> EngineResult<Option<ObjectStat>> {
        match tokio::fs::metadata(self.abs(key)).await {
            Ok(meta) => Ok(Some(ObjectStat {
                size_bytes: meta.len(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_object(&self, key: &str) -> EngineResult<()> {
        match tokio::fs::remove_file(self.abs(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_prefix(&self, prefix: &str) -> EngineResult<Vec<String>> {
        let root = if prefix.is_empty() {
            self.base.clone()
        } else {
            self.abs(prefix)
        };
        if !tokio::fs::try_exists(&root).await? {
            return Ok(Vec::new());
        }

        // Iterative walk; the hour-bucket tree is four levels deep at most
        // plus the leaf files.
        let mut keys = Vec::new();
        let mut stack = vec![root];
        while let Some(dir) = stack.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(path);
                } else if file_type.is_file() {
                    // Temp files are private to in-flight uploads.
                    if path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .map(|n| n.starts_with('.'))
                        .unwrap_or(false)
                    {
                        continue;
                    }
                    if let Ok(rel) = path.strip_prefix(&self.base) {
                        keys.push(rel.to_string_lossy().replace('\\', "/"));
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn write_sidecar_atomic(&self, key: &str, bytes: &[u8]) -> EngineResult<()> {
        let final_path = self.abs(key);
        let dir = final_path
            .parent()
            .ok_or_else(|| EngineError::Validation(format!("key has no parent: {key}")))?
            .to_path_buf();
        self.fence.ensure_dir(&dir).await?;

        let temp_path = dir.join(format!(".attr.tmp-{}", Uuid::new_v4().simple()));
        let mut file = File::create(&temp_path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = tokio::fs::rename(&temp_path, &final_path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn read_sidecar(&self, key: &str) -> EngineResult<Option<Vec<u8>>> {
        match tokio::fs::read(self.abs(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn capacity(&self) -> EngineResult<(u64, u64)> {
        let (disk_total, disk_avail) = self
            .disk_available()
            .unwrap_or((self.capacity_total, self.capacity_total));
        let total = if self.capacity_total > 0 {
            self.capacity_total.min(disk_total.max(1))
        } else {
            disk_total
        };
        let free = disk_avail.min(total);
        Ok((total, total - free))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> (tempfile::TempDir, LocalBackend) {
        let tmp = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(tmp.path().to_path_buf(), 0);
        (tmp, backend)
    }

    #[tokio::test]
    async fn test_upload_finalize_and_read_back() {
        let (_tmp, backend) = backend();
        let key = "2025/11/08/10/hello.txt";

        let mut upload = backend.begin_upload(key).await.unwrap();
        upload.write_chunk(b"hello ").await.unwrap();
        upload.write_chunk(b"world").await.unwrap();
        upload.finalize().await.unwrap();

        let mut reader = backend.read_object(key, None).await.unwrap();
        let mut buf = String::new();
        reader.read_to_string(&mut buf).await.unwrap();
        assert_eq!(buf, "hello world");

        let stat = backend.stat_object(key).await.unwrap().unwrap();
        assert_eq!(stat.size_bytes, 11);
    }

    #[tokio::test]
    async fn test_abort_leaves_nothing_behind() {
        let (tmp, backend) = backend();
        let key = "2025/11/08/10/gone.bin";

        let mut upload = backend.begin_upload(key).await.unwrap();
        upload.write_chunk(b"partial").await.unwrap();
        upload.abort().await.unwrap();

        assert!(backend.stat_object(key).await.unwrap().is_none());
        // The hour directory may exist but must hold no stray files.
        let listed = backend.list_prefix("").await.unwrap();
        assert!(listed.is_empty(), "unexpected leftovers: {listed:?}");
        drop(tmp);
    }

    #[tokio::test]
    async fn test_range_read() {
        let (_tmp, backend) = backend();
        let key = "2025/11/08/10/range.txt";
        let mut upload = backend.begin_upload(key).await.unwrap();
        upload.write_chunk(b"0123456789").await.unwrap();
        upload.finalize().await.unwrap();

        let mut reader = backend
            .read_object(key, Some(ByteRange { start: 2, end: 5 }))
            .await
            .unwrap();
        let mut buf = String::new();
        reader.read_to_string(&mut buf).await.unwrap();
        assert_eq!(buf, "2345");
    }

    #[tokio::test]
    async fn test_sidecar_atomic_write_and_read() {
        let (_tmp, backend) = backend();
        let key = "2025/11/08/10/f.pdf.attr.json";
        backend
            .write_sidecar_atomic(key, br#"{"k":"v"}"#)
            .await
            .unwrap();
        let read = backend.read_sidecar(key).await.unwrap().unwrap();
        assert_eq!(read, br#"{"k":"v"}"#);

        // Overwrite replaces content atomically.
        backend
            .write_sidecar_atomic(key, br#"{"k":"v2"}"#)
            .await
            .unwrap();
        let read = backend.read_sidecar(key).await.unwrap().unwrap();
        assert_eq!(read, br#"{"k":"v2"}"#);
    }

    #[tokio::test]
    async fn test_list_prefix_skips_temp_files() {
        let (tmp, backend) = backend();
        let key = "2025/11/08/10/a.txt";
        let mut upload = backend.begin_upload(key).await.unwrap();
        upload.write_chunk(b"x").await.unwrap();
        upload.finalize().await.unwrap();

        // Plant a fake in-flight temp file.
        std::fs::write(tmp.path().join("2025/11/08/10/.b.tmp-123"), b"junk").unwrap();

        let keys = backend.list_prefix("2025").await.unwrap();
        assert_eq!(keys, vec!["2025/11/08/10/a.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_missing_is_idempotent() {
        let (_tmp, backend) = backend();
        backend.delete_object("2025/01/01/00/nope.bin").await.unwrap();
    }
}
