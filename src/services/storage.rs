//! Chunk blob storage.
//!
//! `ChunkStorage` is the substitution seam for blob backends. The local
//! filesystem implementation writes through a temp file with fsync and an
//! atomic rename, and implements the optional multipart set by staging
//! parts and concatenating them on commit.

use async_trait::async_trait;
use bytes::Bytes;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom},
};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("blob `{0}` not found")]
    NotFound(String),
    #[error("invalid storage key `{0}`")]
    InvalidKey(String),
    /// Worth retrying within the task's retry budget.
    #[error("transient storage failure: {0}")]
    Transient(String),
    /// Not retryable.
    #[error("storage failure: {0}")]
    Permanent(String),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Classify an I/O error for the retry policy. Interruptions and broken
/// streams are retryable; everything else is not.
fn classify_io(err: io::Error) -> StorageError {
    match err.kind() {
        ErrorKind::Interrupted
        | ErrorKind::TimedOut
        | ErrorKind::WouldBlock
        | ErrorKind::BrokenPipe
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::UnexpectedEof => StorageError::Transient(err.to_string()),
        _ => StorageError::Permanent(err.to_string()),
    }
}

/// Blob storage capabilities used by the chunk pipeline.
///
/// `put` must be idempotent: re-writing a key with identical bytes yields
/// the same observable state. Backends without multipart leave the default
/// implementations in place.
#[async_trait]
pub trait ChunkStorage: Send + Sync {
    /// Blob key for a chunk: `uploads/<upload_id>/chunk_<index>`.
    fn chunk_key(&self, upload_id: &str, chunk_index: i64) -> String {
        format!("uploads/{}/chunk_{}", upload_id, chunk_index)
    }

    /// Write a blob, returning the backend etag when the backend has one.
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<Option<String>>;

    /// Read a blob, optionally a sub-range of it.
    async fn get(&self, key: &str, offset: Option<u64>, length: Option<u64>)
        -> StorageResult<Bytes>;

    /// Delete a blob. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Keys currently stored under a prefix. Used by maintenance only.
    async fn list_keys(&self, prefix: &str) -> StorageResult<Vec<String>>;

    fn supports_multipart(&self) -> bool {
        false
    }

    /// Open a multipart session for an upload, returning an opaque handle.
    async fn begin_multipart(&self, _upload_id: &str) -> StorageResult<Option<String>> {
        Ok(None)
    }

    /// Stage one part under a multipart handle, returning its part etag.
    async fn put_part(
        &self,
        _handle: &str,
        _chunk_index: i64,
        _data: Bytes,
    ) -> StorageResult<String> {
        Err(StorageError::Permanent(
            "backend does not support multipart".into(),
        ))
    }

    /// Commit staged parts, in index order, into the assembled object.
    async fn commit_multipart(
        &self,
        _upload_id: &str,
        _handle: &str,
        _parts: &[(i64, String)],
    ) -> StorageResult<Option<String>> {
        Err(StorageError::Permanent(
            "backend does not support multipart".into(),
        ))
    }

    /// Discard staged parts for a handle.
    async fn abort_multipart(&self, _upload_id: &str, _handle: &str) -> StorageResult<()> {
        Ok(())
    }

    /// Key of the assembled whole-file object for multipart uploads.
    fn assembled_key(&self, upload_id: &str) -> String {
        format!("uploads/{}/assembled", upload_id)
    }
}

/// Local-disk chunk storage rooted at `base_path`.
pub struct LocalChunkStorage {
    base_path: PathBuf,
}

impl LocalChunkStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Rejects keys that could escape the storage root.
    fn ensure_key_safe(&self, key: &str) -> StorageResult<()> {
        if key.is_empty() || key.starts_with('/') || key.contains("..") {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(())
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.base_path.join(key)
    }

    fn staging_dir(&self, handle: &str) -> PathBuf {
        self.base_path.join(".multipart").join(handle)
    }

    /// Durable write: temp file, flush, fsync, atomic rename.
    async fn write_durably(&self, path: &Path, data: &Bytes) -> StorageResult<()> {
        let parent = path
            .parent()
            .ok_or_else(|| StorageError::Permanent("blob path missing parent".into()))?;
        fs::create_dir_all(parent).await.map_err(classify_io)?;

        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await.map_err(classify_io)?;

        let write_result: io::Result<()> = async {
            file.write_all(data).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        if let Err(err) = write_result {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(classify_io(err));
        }

        if let Err(err) = fs::rename(&tmp_path, path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(path).await.map_err(classify_io)?;
                fs::rename(&tmp_path, path).await.map_err(classify_io)?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(classify_io(err));
            }
        }
        Ok(())
    }

    /// Remove empty directories up to (not including) the storage root.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.base_path) && current != self.base_path {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(_) => break,
            }
        }
    }
}

#[async_trait]
impl ChunkStorage for LocalChunkStorage {
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<Option<String>> {
        self.ensure_key_safe(key)?;
        let path = self.blob_path(key);
        self.write_durably(&path, &data).await?;
        let etag = format!("{:x}", md5::compute(&data));
        Ok(Some(etag))
    }

    async fn get(
        &self,
        key: &str,
        offset: Option<u64>,
        length: Option<u64>,
    ) -> StorageResult<Bytes> {
        self.ensure_key_safe(key)?;
        let path = self.blob_path(key);
        let mut file = match File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StorageError::NotFound(key.to_string()))
            }
            Err(err) => return Err(classify_io(err)),
        };

        if let Some(offset) = offset {
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(classify_io)?;
        }

        let mut buf = Vec::new();
        match length {
            Some(length) => {
                let mut limited = file.take(length);
                limited.read_to_end(&mut buf).await.map_err(classify_io)?;
            }
            None => {
                file.read_to_end(&mut buf).await.map_err(classify_io)?;
            }
        }
        Ok(Bytes::from(buf))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.ensure_key_safe(key)?;
        let path = self.blob_path(key);
        match fs::remove_file(&path).await {
            Ok(_) => debug!("removed blob {}", path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("blob {} already missing", path.display());
            }
            Err(err) => return Err(classify_io(err)),
        }
        if let Some(parent) = path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let base = if prefix.is_empty() {
            self.base_path.clone()
        } else {
            self.ensure_key_safe(prefix)?;
            self.base_path.join(prefix)
        };
        if !base.exists() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        let mut pending = vec![base];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await.map_err(classify_io)?;
            while let Some(entry) = entries.next_entry().await.map_err(classify_io)? {
                let path = entry.path();
                let file_type = entry.file_type().await.map_err(classify_io)?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if let Ok(relative) = path.strip_prefix(&self.base_path) {
                    keys.push(relative.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn supports_multipart(&self) -> bool {
        true
    }

    async fn begin_multipart(&self, _upload_id: &str) -> StorageResult<Option<String>> {
        let handle = format!("mp-{}", Uuid::new_v4());
        fs::create_dir_all(self.staging_dir(&handle))
            .await
            .map_err(classify_io)?;
        Ok(Some(handle))
    }

    async fn put_part(&self, handle: &str, chunk_index: i64, data: Bytes) -> StorageResult<String> {
        let path = self.staging_dir(handle).join(format!("part_{}", chunk_index));
        self.write_durably(&path, &data).await?;
        Ok(format!("{:x}", md5::compute(&data)))
    }

    async fn commit_multipart(
        &self,
        upload_id: &str,
        handle: &str,
        parts: &[(i64, String)],
    ) -> StorageResult<Option<String>> {
        let staging = self.staging_dir(handle);
        let assembled_path = self.blob_path(&self.assembled_key(upload_id));
        let parent = assembled_path
            .parent()
            .ok_or_else(|| StorageError::Permanent("assembled path missing parent".into()))?;
        fs::create_dir_all(parent).await.map_err(classify_io)?;

        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut out = File::create(&tmp_path).await.map_err(classify_io)?;
        let mut digest = md5::Context::new();
        for (chunk_index, _etag) in parts {
            let part_path = staging.join(format!("part_{}", chunk_index));
            let data = fs::read(&part_path).await.map_err(|err| {
                if err.kind() == ErrorKind::NotFound {
                    StorageError::NotFound(format!("{}/part_{}", handle, chunk_index))
                } else {
                    classify_io(err)
                }
            })?;
            digest.consume(&data);
            if let Err(err) = out.write_all(&data).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(classify_io(err));
            }
        }
        if let Err(err) = out.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(classify_io(err));
        }
        fs::rename(&tmp_path, &assembled_path)
            .await
            .map_err(classify_io)?;

        let _ = fs::remove_dir_all(&staging).await;
        Ok(Some(format!("{:x}", digest.compute())))
    }

    async fn abort_multipart(&self, _upload_id: &str, handle: &str) -> StorageResult<()> {
        let _ = fs::remove_dir_all(self.staging_dir(handle)).await;
        Ok(())
    }
}
