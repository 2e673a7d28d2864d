//! Represents an upload: one client file being transferred in chunks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

/// Lifecycle status of an upload.
///
/// Transitions are driven exclusively through the CAS helpers in the
/// metadata service; COMPLETED, FAILED and ABORTED are terminal.
#[derive(Serialize, Deserialize, sqlx::Type, Clone, Copy, Debug, PartialEq, Eq)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadStatus {
    Initiated,
    InProgress,
    Completed,
    Failed,
    Aborted,
}

impl UploadStatus {
    /// Whether chunk uploads are currently accepted.
    pub fn accepts_chunks(self) -> bool {
        matches!(self, UploadStatus::Initiated | UploadStatus::InProgress)
    }

    /// Whether this status admits no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UploadStatus::Completed | UploadStatus::Failed | UploadStatus::Aborted
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UploadStatus::Initiated => "INITIATED",
            UploadStatus::InProgress => "IN_PROGRESS",
            UploadStatus::Completed => "COMPLETED",
            UploadStatus::Failed => "FAILED",
            UploadStatus::Aborted => "ABORTED",
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single upload session.
///
/// `chunk_size` and `total_chunks` are fixed at init time; the status column
/// only moves along the upload state machine.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Upload {
    /// Upload identifier (UUID string, returned to the client).
    pub id: String,

    /// Principal that created the upload. Only this principal (or an admin
    /// on maintenance endpoints) may observe or mutate it.
    pub owner_id: String,

    /// Original file name, advertised again on download.
    pub file_name: String,

    /// Total file size in bytes.
    pub file_size: i64,

    /// Size of every chunk except possibly the last.
    pub chunk_size: i64,

    /// ceil(file_size / chunk_size); zero only for an empty file.
    pub total_chunks: i64,

    /// Optional expected whole-file SHA-256 (lowercase hex).
    pub file_checksum_sha256: Option<String>,

    /// Lifecycle status.
    pub status: UploadStatus,

    /// Opaque multipart handle from the storage backend, if multipart is
    /// active for this upload.
    pub multipart_upload_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Upload {
    /// Byte size expected for a given chunk index.
    pub fn expected_chunk_size(&self, chunk_index: i64) -> i64 {
        if chunk_index + 1 < self.total_chunks {
            self.chunk_size
        } else {
            let remainder = self.file_size - chunk_index * self.chunk_size;
            remainder.min(self.chunk_size)
        }
    }
}
