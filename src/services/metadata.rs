//! Metadata store: transactional CRUD over uploads, chunks and idempotency
//! rows, backed by SQLite through sqlx.
//!
//! All upload status changes go through CAS helpers ("set status to X iff
//! current status is in ..."), so contending writers serialize on the
//! database and at most one complete can win.

use crate::models::{
    chunk::{Chunk, ChunkStatus},
    idempotency::{IdempotencyKind, IdempotencyRecord},
    upload::{Upload, UploadStatus},
};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("upload `{0}` not found")]
    UploadNotFound(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type MetadataResult<T> = Result<T, MetadataError>;

/// Outcome of an idempotency-key reservation.
#[derive(Debug)]
pub enum Reservation {
    /// Key was unused; the caller proceeds and stores the result afterwards.
    Fresh,
    /// Same key, same fingerprint: return the stored prior result. `None`
    /// while the original request is still in flight.
    Replay(Option<serde_json::Value>),
    /// Same key, different request fingerprint.
    Conflict,
}

/// Outcome of the transactional complete attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum CompleteOutcome {
    Completed,
    /// Fewer UPLOADED chunks than total_chunks at decision time.
    MissingChunks { uploaded: i64 },
    /// Another writer reached a terminal state first.
    LostRace,
}

#[derive(Clone)]
pub struct MetadataStore {
    pub db: Arc<SqlitePool>,
}

impl MetadataStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Apply the embedded schema. Statements are idempotent, so this runs
    /// unconditionally at startup and in tests.
    pub async fn apply_migrations(db: &SqlitePool) -> MetadataResult<()> {
        let sql = include_str!("../../migrations/0001_init.sql");
        for statement in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement).execute(db).await?;
        }
        Ok(())
    }

    pub async fn insert_upload(&self, upload: &Upload) -> MetadataResult<()> {
        sqlx::query(
            "INSERT INTO uploads (id, owner_id, file_name, file_size, chunk_size, total_chunks,
                                  file_checksum_sha256, status, multipart_upload_id,
                                  created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&upload.id)
        .bind(&upload.owner_id)
        .bind(&upload.file_name)
        .bind(upload.file_size)
        .bind(upload.chunk_size)
        .bind(upload.total_chunks)
        .bind(&upload.file_checksum_sha256)
        .bind(upload.status)
        .bind(&upload.multipart_upload_id)
        .bind(upload.created_at)
        .bind(upload.updated_at)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    pub async fn get_upload(&self, upload_id: &str) -> MetadataResult<Option<Upload>> {
        let upload = sqlx::query_as::<_, Upload>(
            "SELECT id, owner_id, file_name, file_size, chunk_size, total_chunks,
                    file_checksum_sha256, status, multipart_upload_id, created_at, updated_at
             FROM uploads WHERE id = ?",
        )
        .bind(upload_id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(upload)
    }

    /// Fetch an upload or fail with UploadNotFound.
    pub async fn fetch_upload(&self, upload_id: &str) -> MetadataResult<Upload> {
        self.get_upload(upload_id)
            .await?
            .ok_or_else(|| MetadataError::UploadNotFound(upload_id.to_string()))
    }

    /// CAS the upload status: set `to` iff the current status is in `from`.
    /// Returns whether this call performed the transition.
    pub async fn cas_upload_status(
        &self,
        upload_id: &str,
        from: &[UploadStatus],
        to: UploadStatus,
    ) -> MetadataResult<bool> {
        let mut builder = sqlx::QueryBuilder::<sqlx::Sqlite>::new(
            "UPDATE uploads SET status = ",
        );
        builder.push_bind(to);
        builder.push(", updated_at = ");
        builder.push_bind(Utc::now());
        builder.push(" WHERE id = ");
        builder.push_bind(upload_id);
        builder.push(" AND status IN (");
        let mut separated = builder.separated(", ");
        for status in from {
            separated.push_bind(*status);
        }
        builder.push(")");

        let result = builder.build().execute(&*self.db).await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_multipart_handle(
        &self,
        upload_id: &str,
        handle: Option<&str>,
    ) -> MetadataResult<()> {
        sqlx::query("UPDATE uploads SET multipart_upload_id = ?, updated_at = ? WHERE id = ?")
            .bind(handle)
            .bind(Utc::now())
            .bind(upload_id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    /// Claim a chunk for execution: create the row as UPLOADING, or flip an
    /// existing non-UPLOADED row to UPLOADING. Returns false when the chunk
    /// is already UPLOADED, in which case the caller short-circuits.
    pub async fn claim_chunk(
        &self,
        upload_id: &str,
        chunk_index: i64,
        storage_key: &str,
        retry_count: i64,
    ) -> MetadataResult<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO chunks (upload_id, chunk_index, size_bytes, storage_key, status,
                                 retry_count, created_at, updated_at)
             VALUES (?, ?, 0, ?, ?, ?, ?, ?)
             ON CONFLICT (upload_id, chunk_index) DO UPDATE SET
                 status = excluded.status,
                 retry_count = excluded.retry_count,
                 updated_at = excluded.updated_at
             WHERE chunks.status != ?",
        )
        .bind(upload_id)
        .bind(chunk_index)
        .bind(storage_key)
        .bind(ChunkStatus::Uploading)
        .bind(retry_count)
        .bind(now)
        .bind(now)
        .bind(ChunkStatus::Uploaded)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record a successful chunk write.
    pub async fn mark_chunk_uploaded(
        &self,
        upload_id: &str,
        chunk_index: i64,
        size_bytes: i64,
        checksum_sha256: &str,
        storage_key: &str,
        storage_etag: Option<&str>,
        retry_count: i64,
    ) -> MetadataResult<()> {
        sqlx::query(
            "UPDATE chunks SET status = ?, size_bytes = ?, chunk_checksum_sha256 = ?,
                    storage_key = ?, storage_etag = ?, retry_count = ?, updated_at = ?
             WHERE upload_id = ? AND chunk_index = ?",
        )
        .bind(ChunkStatus::Uploaded)
        .bind(size_bytes)
        .bind(checksum_sha256)
        .bind(storage_key)
        .bind(storage_etag)
        .bind(retry_count)
        .bind(Utc::now())
        .bind(upload_id)
        .bind(chunk_index)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// Record retry exhaustion or a permanent failure for a chunk. The
    /// parent upload stays as-is so the client can resume.
    pub async fn mark_chunk_failed(
        &self,
        upload_id: &str,
        chunk_index: i64,
        retry_count: i64,
    ) -> MetadataResult<()> {
        sqlx::query(
            "UPDATE chunks SET status = ?, retry_count = ?, updated_at = ?
             WHERE upload_id = ? AND chunk_index = ? AND status != ?",
        )
        .bind(ChunkStatus::Failed)
        .bind(retry_count)
        .bind(Utc::now())
        .bind(upload_id)
        .bind(chunk_index)
        .bind(ChunkStatus::Uploaded)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    pub async fn get_chunk(
        &self,
        upload_id: &str,
        chunk_index: i64,
    ) -> MetadataResult<Option<Chunk>> {
        let chunk = sqlx::query_as::<_, Chunk>(
            "SELECT id, upload_id, chunk_index, size_bytes, chunk_checksum_sha256,
                    storage_key, storage_etag, status, retry_count, created_at, updated_at
             FROM chunks WHERE upload_id = ? AND chunk_index = ?",
        )
        .bind(upload_id)
        .bind(chunk_index)
        .fetch_optional(&*self.db)
        .await?;
        Ok(chunk)
    }

    /// All chunk rows for an upload, ordered by index.
    pub async fn list_chunks_ordered(&self, upload_id: &str) -> MetadataResult<Vec<Chunk>> {
        let chunks = sqlx::query_as::<_, Chunk>(
            "SELECT id, upload_id, chunk_index, size_bytes, chunk_checksum_sha256,
                    storage_key, storage_etag, status, retry_count, created_at, updated_at
             FROM chunks WHERE upload_id = ? ORDER BY chunk_index ASC",
        )
        .bind(upload_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(chunks)
    }

    /// Indices in 0..total_chunks with no UPLOADED row.
    pub async fn missing_indices(
        &self,
        upload_id: &str,
        total_chunks: i64,
    ) -> MetadataResult<Vec<i64>> {
        let uploaded: Vec<i64> = sqlx::query_scalar(
            "SELECT chunk_index FROM chunks WHERE upload_id = ? AND status = ?",
        )
        .bind(upload_id)
        .bind(ChunkStatus::Uploaded)
        .fetch_all(&*self.db)
        .await?;
        let uploaded: std::collections::HashSet<i64> = uploaded.into_iter().collect();
        Ok((0..total_chunks).filter(|i| !uploaded.contains(i)).collect())
    }

    /// The complete decision: recount UPLOADED chunks and CAS the upload to
    /// COMPLETED inside one transaction, so contending completes serialize
    /// deterministically.
    pub async fn finalize_complete(&self, upload: &Upload) -> MetadataResult<CompleteOutcome> {
        let mut tx = self.db.begin().await?;

        let uploaded: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chunks WHERE upload_id = ? AND status = ?",
        )
        .bind(&upload.id)
        .bind(ChunkStatus::Uploaded)
        .fetch_one(&mut *tx)
        .await?;
        if uploaded != upload.total_chunks {
            tx.rollback().await?;
            return Ok(CompleteOutcome::MissingChunks { uploaded });
        }

        // An empty upload may complete straight from INITIATED.
        let result = sqlx::query(
            "UPDATE uploads SET status = ?, updated_at = ?
             WHERE id = ? AND (status = ? OR (status = ? AND total_chunks = 0))",
        )
        .bind(UploadStatus::Completed)
        .bind(Utc::now())
        .bind(&upload.id)
        .bind(UploadStatus::InProgress)
        .bind(UploadStatus::Initiated)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        if result.rows_affected() > 0 {
            Ok(CompleteOutcome::Completed)
        } else {
            Ok(CompleteOutcome::LostRace)
        }
    }

    /// Atomically reserve an idempotency key for an operation kind.
    pub async fn reserve_idempotency(
        &self,
        kind: IdempotencyKind,
        key: &str,
        fingerprint: &str,
    ) -> MetadataResult<Reservation> {
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO idempotency (kind, idempotency_key, request_fingerprint,
                                                result, created_at)
             VALUES (?, ?, ?, NULL, ?)",
        )
        .bind(kind)
        .bind(key)
        .bind(fingerprint)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;
        if inserted.rows_affected() > 0 {
            return Ok(Reservation::Fresh);
        }

        let record = sqlx::query_as::<_, IdempotencyRecord>(
            "SELECT kind, idempotency_key, request_fingerprint, result, created_at
             FROM idempotency WHERE kind = ? AND idempotency_key = ?",
        )
        .bind(kind)
        .bind(key)
        .fetch_one(&*self.db)
        .await?;

        if record.request_fingerprint != fingerprint {
            return Ok(Reservation::Conflict);
        }
        let prior = record
            .result
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok());
        Ok(Reservation::Replay(prior))
    }

    /// Store the result for a reserved key so replays can return it.
    pub async fn store_idempotency_result(
        &self,
        kind: IdempotencyKind,
        key: &str,
        result: &serde_json::Value,
    ) -> MetadataResult<()> {
        sqlx::query("UPDATE idempotency SET result = ? WHERE kind = ? AND idempotency_key = ?")
            .bind(result.to_string())
            .bind(kind)
            .bind(key)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    /// Drop a reservation whose operation did not finish, so a later retry
    /// with the same key starts fresh.
    pub async fn release_idempotency(
        &self,
        kind: IdempotencyKind,
        key: &str,
    ) -> MetadataResult<()> {
        sqlx::query(
            "DELETE FROM idempotency WHERE kind = ? AND idempotency_key = ? AND result IS NULL",
        )
        .bind(kind)
        .bind(key)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    pub async fn gc_idempotency(&self, created_before: DateTime<Utc>) -> MetadataResult<u64> {
        let result = sqlx::query("DELETE FROM idempotency WHERE created_at < ?")
            .bind(created_before)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected())
    }

    /// Non-terminal uploads whose updated_at is older than the cutoff.
    pub async fn stale_uploads(
        &self,
        updated_before: DateTime<Utc>,
    ) -> MetadataResult<Vec<Upload>> {
        let uploads = sqlx::query_as::<_, Upload>(
            "SELECT id, owner_id, file_name, file_size, chunk_size, total_chunks,
                    file_checksum_sha256, status, multipart_upload_id, created_at, updated_at
             FROM uploads WHERE status IN (?, ?) AND updated_at < ?",
        )
        .bind(UploadStatus::Initiated)
        .bind(UploadStatus::InProgress)
        .bind(updated_before)
        .fetch_all(&*self.db)
        .await?;
        Ok(uploads)
    }

    pub async fn delete_chunk_rows(&self, upload_id: &str) -> MetadataResult<u64> {
        let result = sqlx::query("DELETE FROM chunks WHERE upload_id = ?")
            .bind(upload_id)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected())
    }

    /// Every storage key referenced by a chunk row. Used by the orphan scan.
    pub async fn referenced_storage_keys(&self) -> MetadataResult<Vec<String>> {
        let keys = sqlx::query_scalar("SELECT storage_key FROM chunks")
            .fetch_all(&*self.db)
            .await?;
        Ok(keys)
    }

    pub async fn all_upload_ids(&self) -> MetadataResult<Vec<String>> {
        let ids = sqlx::query_scalar("SELECT id FROM uploads")
            .fetch_all(&*self.db)
            .await?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::idempotency::fingerprint;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> MetadataStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        MetadataStore::apply_migrations(&pool).await.unwrap();
        MetadataStore::new(Arc::new(pool))
    }

    fn upload(id: &str, total_chunks: i64) -> Upload {
        let now = Utc::now();
        Upload {
            id: id.into(),
            owner_id: "owner".into(),
            file_name: "data.bin".into(),
            file_size: total_chunks * 4,
            chunk_size: 4,
            total_chunks,
            file_checksum_sha256: None,
            status: UploadStatus::Initiated,
            multipart_upload_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn cas_only_moves_from_allowed_states() {
        let store = store().await;
        store.insert_upload(&upload("u1", 2)).await.unwrap();

        let moved = store
            .cas_upload_status("u1", &[UploadStatus::Initiated], UploadStatus::InProgress)
            .await
            .unwrap();
        assert!(moved);

        // Already IN_PROGRESS; the same CAS must refuse.
        let moved_again = store
            .cas_upload_status("u1", &[UploadStatus::Initiated], UploadStatus::InProgress)
            .await
            .unwrap();
        assert!(!moved_again);
    }

    #[tokio::test]
    async fn claim_chunk_short_circuits_on_uploaded() {
        let store = store().await;
        store.insert_upload(&upload("u1", 2)).await.unwrap();

        assert!(store.claim_chunk("u1", 0, "uploads/u1/chunk_0", 0).await.unwrap());
        store
            .mark_chunk_uploaded("u1", 0, 4, "cafe", "uploads/u1/chunk_0", None, 0)
            .await
            .unwrap();
        // Uploaded rows are never reclaimed.
        assert!(!store.claim_chunk("u1", 0, "uploads/u1/chunk_0", 0).await.unwrap());
    }

    #[tokio::test]
    async fn missing_indices_reports_gaps() {
        let store = store().await;
        store.insert_upload(&upload("u1", 3)).await.unwrap();
        for index in [0, 2] {
            store
                .claim_chunk("u1", index, &format!("uploads/u1/chunk_{}", index), 0)
                .await
                .unwrap();
            store
                .mark_chunk_uploaded(
                    "u1",
                    index,
                    4,
                    "cafe",
                    &format!("uploads/u1/chunk_{}", index),
                    None,
                    0,
                )
                .await
                .unwrap();
        }
        assert_eq!(store.missing_indices("u1", 3).await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn finalize_complete_requires_all_chunks() {
        let store = store().await;
        store.insert_upload(&upload("u1", 1)).await.unwrap();
        store
            .cas_upload_status("u1", &[UploadStatus::Initiated], UploadStatus::InProgress)
            .await
            .unwrap();

        let outcome = store.finalize_complete(&store.fetch_upload("u1").await.unwrap()).await.unwrap();
        assert_eq!(outcome, CompleteOutcome::MissingChunks { uploaded: 0 });

        store.claim_chunk("u1", 0, "uploads/u1/chunk_0", 0).await.unwrap();
        store
            .mark_chunk_uploaded("u1", 0, 4, "cafe", "uploads/u1/chunk_0", None, 0)
            .await
            .unwrap();
        let outcome = store.finalize_complete(&store.fetch_upload("u1").await.unwrap()).await.unwrap();
        assert_eq!(outcome, CompleteOutcome::Completed);

        // A second completer loses the race instead of double-completing.
        let outcome = store.finalize_complete(&store.fetch_upload("u1").await.unwrap()).await.unwrap();
        assert_eq!(outcome, CompleteOutcome::LostRace);
    }

    #[tokio::test]
    async fn empty_upload_completes_from_initiated() {
        let store = store().await;
        store.insert_upload(&upload("u0", 0)).await.unwrap();
        let outcome = store.finalize_complete(&store.fetch_upload("u0").await.unwrap()).await.unwrap();
        assert_eq!(outcome, CompleteOutcome::Completed);
    }

    #[tokio::test]
    async fn idempotency_reserve_replay_conflict() {
        let store = store().await;
        let fp = fingerprint(&json!({"file_size": 100}));

        let first = store
            .reserve_idempotency(IdempotencyKind::Init, "k1", &fp)
            .await
            .unwrap();
        assert!(matches!(first, Reservation::Fresh));

        // Replay before the result is stored: no prior result yet.
        let pending = store
            .reserve_idempotency(IdempotencyKind::Init, "k1", &fp)
            .await
            .unwrap();
        assert!(matches!(pending, Reservation::Replay(None)));

        store
            .store_idempotency_result(IdempotencyKind::Init, "k1", &json!({"upload_id": "u1"}))
            .await
            .unwrap();
        let replay = store
            .reserve_idempotency(IdempotencyKind::Init, "k1", &fp)
            .await
            .unwrap();
        match replay {
            Reservation::Replay(Some(result)) => assert_eq!(result["upload_id"], "u1"),
            other => panic!("expected replay with result, got {:?}", other),
        }

        let other_fp = fingerprint(&json!({"file_size": 200}));
        let conflict = store
            .reserve_idempotency(IdempotencyKind::Init, "k1", &other_fp)
            .await
            .unwrap();
        assert!(matches!(conflict, Reservation::Conflict));

        // The same key under a different kind is independent.
        let fresh = store
            .reserve_idempotency(IdempotencyKind::Complete, "k1", &other_fp)
            .await
            .unwrap();
        assert!(matches!(fresh, Reservation::Fresh));
    }

    #[tokio::test]
    async fn idempotency_gc_removes_expired_rows() {
        let store = store().await;
        let fp = fingerprint(&json!({"a": 1}));
        store
            .reserve_idempotency(IdempotencyKind::Chunk, "old", &fp)
            .await
            .unwrap();
        let removed = store
            .gc_idempotency(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn stale_uploads_excludes_terminal_states() {
        let store = store().await;
        store.insert_upload(&upload("live", 1)).await.unwrap();
        store.insert_upload(&upload("done", 1)).await.unwrap();
        store
            .cas_upload_status(
                "done",
                &[UploadStatus::Initiated],
                UploadStatus::Aborted,
            )
            .await
            .unwrap();

        let stale = store
            .stale_uploads(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        let ids: Vec<&str> = stale.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["live"]);
    }
}
