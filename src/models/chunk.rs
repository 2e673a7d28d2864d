//! Represents one chunk of an upload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

/// Status of a chunk row.
///
/// Only UPLOADED chunks are visible to complete and download; the unique
/// (upload_id, chunk_index) constraint serializes concurrent writers.
#[derive(Serialize, Deserialize, sqlx::Type, Clone, Copy, Debug, PartialEq, Eq)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChunkStatus {
    Pending,
    Uploading,
    Uploaded,
    Failed,
}

impl ChunkStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ChunkStatus::Pending => "PENDING",
            ChunkStatus::Uploading => "UPLOADING",
            ChunkStatus::Uploaded => "UPLOADED",
            ChunkStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A chunk row, created lazily when an index is first accepted.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Chunk {
    /// Internal row id.
    pub id: i64,

    /// Parent upload.
    pub upload_id: String,

    /// 0-based index, strictly less than the upload's total_chunks.
    pub chunk_index: i64,

    /// Actual byte size; equals chunk_size except possibly for the last index.
    pub size_bytes: i64,

    /// SHA-256 of the chunk body (lowercase hex).
    pub chunk_checksum_sha256: Option<String>,

    /// Blob key in the storage backend.
    pub storage_key: String,

    /// Backend etag, when the backend reports one.
    pub storage_etag: Option<String>,

    pub status: ChunkStatus,

    /// Attempts consumed before the chunk reached a terminal status.
    pub retry_count: i64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
