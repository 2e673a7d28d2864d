//! Periodic maintenance: abort stale uploads, expire idempotency rows and
//! sweep orphaned blobs. The admin endpoint runs the same pass on demand.

use crate::models::upload::UploadStatus;
use crate::services::metadata::{MetadataResult, MetadataStore};
use crate::services::storage::ChunkStorage;
use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Serialize, Debug, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub stale_uploads_aborted: u64,
    pub chunk_rows_deleted: u64,
    pub idempotency_rows_deleted: u64,
    pub storage_keys_deleted: u64,
}

/// One full maintenance pass. Storage deletes are best-effort; database
/// cleanup keeps moving past individual blob failures.
pub async fn cleanup_once(
    metadata: &MetadataStore,
    storage: &Arc<dyn ChunkStorage>,
    stale_upload_ttl: Duration,
    idempotency_ttl: Duration,
) -> MetadataResult<CleanupStats> {
    let now = Utc::now();
    let stale_before = now - to_chrono(stale_upload_ttl);
    let idempotency_before = now - to_chrono(idempotency_ttl);
    let mut stats = CleanupStats::default();

    for upload in metadata.stale_uploads(stale_before).await? {
        let aborted = metadata
            .cas_upload_status(
                &upload.id,
                &[UploadStatus::Initiated, UploadStatus::InProgress],
                UploadStatus::Aborted,
            )
            .await?;
        if !aborted {
            // Raced with a live complete or abort; leave it alone.
            continue;
        }
        stats.stale_uploads_aborted += 1;

        for chunk in metadata.list_chunks_ordered(&upload.id).await? {
            match storage.delete(&chunk.storage_key).await {
                Ok(()) => stats.storage_keys_deleted += 1,
                Err(err) => debug!(
                    upload_id = %upload.id,
                    "stale chunk blob delete failed: {}",
                    err
                ),
            }
        }
        if let Some(handle) = &upload.multipart_upload_id {
            if let Err(err) = storage.abort_multipart(&upload.id, handle).await {
                debug!(upload_id = %upload.id, "multipart abort failed: {}", err);
            }
        }
        stats.chunk_rows_deleted += metadata.delete_chunk_rows(&upload.id).await?;
    }

    stats.idempotency_rows_deleted = metadata.gc_idempotency(idempotency_before).await?;

    // Orphan sweep: blobs under uploads/ that no chunk row references.
    let mut referenced: HashSet<String> =
        metadata.referenced_storage_keys().await?.into_iter().collect();
    for upload_id in metadata.all_upload_ids().await? {
        referenced.insert(storage.assembled_key(&upload_id));
    }
    match storage.list_keys("uploads").await {
        Ok(keys) => {
            for key in keys {
                if !referenced.contains(&key) {
                    match storage.delete(&key).await {
                        Ok(()) => stats.storage_keys_deleted += 1,
                        Err(err) => debug!("orphan blob delete failed for {}: {}", key, err),
                    }
                }
            }
        }
        Err(err) => debug!("orphan scan skipped, listing unavailable: {}", err),
    }

    Ok(stats)
}

fn to_chrono(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::seconds(86_400))
}

/// Background cleanup loop.
pub async fn run_cleanup_loop(
    metadata: MetadataStore,
    storage: Arc<dyn ChunkStorage>,
    interval: Duration,
    stale_upload_ttl: Duration,
    idempotency_ttl: Duration,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(interval.max(Duration::from_secs(1))) => {}
        }
        match cleanup_once(&metadata, &storage, stale_upload_ttl, idempotency_ttl).await {
            Ok(stats) => debug!(?stats, "cleanup pass finished"),
            Err(err) => warn!("cleanup pass failed: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::upload::Upload;
    use crate::services::storage::LocalChunkStorage;
    use bytes::Bytes;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn fixture() -> (tempfile::TempDir, MetadataStore, Arc<dyn ChunkStorage>) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        MetadataStore::apply_migrations(&pool).await.unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let storage: Arc<dyn ChunkStorage> = Arc::new(LocalChunkStorage::new(tmp.path()));
        (tmp, MetadataStore::new(Arc::new(pool)), storage)
    }

    async fn seed(metadata: &MetadataStore, id: &str) {
        let now = Utc::now();
        metadata
            .insert_upload(&Upload {
                id: id.into(),
                owner_id: "owner".into(),
                file_name: "data.bin".into(),
                file_size: 4,
                chunk_size: 4,
                total_chunks: 1,
                file_checksum_sha256: None,
                status: UploadStatus::Initiated,
                multipart_upload_id: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stale_upload_is_aborted_and_emptied() {
        let (_tmp, metadata, storage) = fixture().await;
        seed(&metadata, "stale").await;
        metadata.claim_chunk("stale", 0, "uploads/stale/chunk_0", 0).await.unwrap();
        metadata
            .mark_chunk_uploaded("stale", 0, 4, "cafe", "uploads/stale/chunk_0", None, 0)
            .await
            .unwrap();
        storage
            .put("uploads/stale/chunk_0", Bytes::from_static(b"abcd"))
            .await
            .unwrap();

        // TTL of zero: everything non-terminal counts as stale.
        let stats = cleanup_once(
            &metadata,
            &storage,
            Duration::from_secs(0),
            Duration::from_secs(3600),
        )
        .await
        .unwrap();

        assert_eq!(stats.stale_uploads_aborted, 1);
        assert_eq!(stats.chunk_rows_deleted, 1);
        assert!(stats.storage_keys_deleted >= 1);

        let upload = metadata.fetch_upload("stale").await.unwrap();
        assert_eq!(upload.status, UploadStatus::Aborted);
        assert!(metadata.list_chunks_ordered("stale").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fresh_uploads_survive_cleanup() {
        let (_tmp, metadata, storage) = fixture().await;
        seed(&metadata, "fresh").await;

        let stats = cleanup_once(
            &metadata,
            &storage,
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        )
        .await
        .unwrap();
        assert_eq!(stats.stale_uploads_aborted, 0);
        assert_eq!(
            metadata.fetch_upload("fresh").await.unwrap().status,
            UploadStatus::Initiated
        );
    }

    #[tokio::test]
    async fn orphan_blobs_are_swept() {
        let (_tmp, metadata, storage) = fixture().await;
        storage
            .put("uploads/ghost/chunk_0", Bytes::from_static(b"orphan"))
            .await
            .unwrap();

        let stats = cleanup_once(
            &metadata,
            &storage,
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        )
        .await
        .unwrap();
        assert_eq!(stats.storage_keys_deleted, 1);
        assert!(storage.list_keys("uploads").await.unwrap().is_empty());
    }
}
