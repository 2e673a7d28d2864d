//! Worker pool and chunk-task executor.
//!
//! A bounded channel feeds a resizable set of workers. The same executor
//! function also runs under the durable-queue consumer loops, so both modes
//! share one code path: claim the chunk row, write the blob, flip the row
//! to UPLOADED, publish the outcome. Retire messages shrink the pool
//! without ever cancelling a task that is already executing.

use crate::metrics::{
    BYTES_UPLOADED_TOTAL, CHUNKS_UPLOADED_TOTAL, CHUNK_UPLOAD_FAILURES_TOTAL,
    DB_UPDATE_LATENCY_SECONDS, RETRIES_TOTAL, STORAGE_PUT_LATENCY_SECONDS, WORKER_BUSY_COUNT,
    WORKER_COUNT,
};
use crate::models::upload::UploadStatus;
use crate::services::limits::AdmissionPermit;
use crate::services::metadata::MetadataStore;
use crate::services::queue::{ChunkWriteTask, DurableQueue, ResultRegistry, TaskOutcome};
use crate::services::storage::ChunkStorage;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Everything the executor needs, shared by workers and queue consumers.
pub struct ExecutorContext {
    pub metadata: MetadataStore,
    pub storage: Arc<dyn ChunkStorage>,
    pub results: Arc<ResultRegistry>,
    pub max_retries: i64,
}

/// Terminal or retryable disposition of one execution attempt.
pub enum ExecuteOutcome {
    /// Blob written, chunk row UPLOADED, outcome published.
    Completed,
    /// The chunk was already UPLOADED; no storage write happened.
    ShortCircuited,
    /// Transient storage failure with retry budget remaining. The caller
    /// re-submits; nothing has been published yet.
    Transient(String),
    /// Terminal failure: chunk marked FAILED, outcome published.
    Failed(String),
}

/// Run one chunk-write attempt. Direct workers and durable-queue consumers
/// both call this, so the two modes cannot drift apart.
pub async fn execute_chunk_task(ctx: &ExecutorContext, task: &ChunkWriteTask) -> ExecuteOutcome {
    let storage_key = ctx.storage.chunk_key(&task.upload_id, task.chunk_index);

    let data = match task.data() {
        Ok(data) => data,
        Err(err) => return fail_task(ctx, task, err.to_string()).await,
    };

    // Step 1: claim the row. A false claim means another writer already
    // landed this index; duplicates short-circuit without touching storage.
    match ctx
        .metadata
        .claim_chunk(&task.upload_id, task.chunk_index, &storage_key, task.retry_count)
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            debug!(
                upload_id = %task.upload_id,
                chunk_index = task.chunk_index,
                "chunk already uploaded, skipping storage write"
            );
            ctx.results.publish(
                &task.task_id,
                TaskOutcome::Uploaded {
                    storage_key,
                    storage_etag: None,
                },
            );
            return ExecuteOutcome::ShortCircuited;
        }
        Err(err) => return fail_task(ctx, task, err.to_string()).await,
    }

    let checksum = format!("{:x}", Sha256::digest(&data));

    // Steps 3: blob write, plus a staged part when multipart is active.
    let put_started = Instant::now();
    let put_result = ctx.storage.put(&storage_key, data.clone()).await;
    STORAGE_PUT_LATENCY_SECONDS.observe(put_started.elapsed().as_secs_f64());

    let mut storage_etag = match put_result {
        Ok(etag) => etag,
        Err(err) if err.is_transient() && task.retry_count < ctx.max_retries => {
            return ExecuteOutcome::Transient(err.to_string());
        }
        Err(err) => return fail_task(ctx, task, err.to_string()).await,
    };

    if let Some(handle) = &task.multipart_upload_id {
        match ctx
            .storage
            .put_part(handle, task.chunk_index, data.clone())
            .await
        {
            Ok(part_etag) => storage_etag = Some(part_etag),
            Err(err) if err.is_transient() && task.retry_count < ctx.max_retries => {
                return ExecuteOutcome::Transient(err.to_string());
            }
            Err(err) => return fail_task(ctx, task, err.to_string()).await,
        }
    }

    // Step 4: commit the row and move the upload out of INITIATED on the
    // first accepted chunk.
    let db_started = Instant::now();
    let update = ctx
        .metadata
        .mark_chunk_uploaded(
            &task.upload_id,
            task.chunk_index,
            data.len() as i64,
            &checksum,
            &storage_key,
            storage_etag.as_deref(),
            task.retry_count,
        )
        .await;
    DB_UPDATE_LATENCY_SECONDS.observe(db_started.elapsed().as_secs_f64());
    if let Err(err) = update {
        return fail_task(ctx, task, err.to_string()).await;
    }
    if let Err(err) = ctx
        .metadata
        .cas_upload_status(
            &task.upload_id,
            &[UploadStatus::Initiated],
            UploadStatus::InProgress,
        )
        .await
    {
        warn!(upload_id = %task.upload_id, "failed to advance upload status: {}", err);
    }

    CHUNKS_UPLOADED_TOTAL.inc();
    BYTES_UPLOADED_TOTAL.inc_by(data.len() as u64);
    ctx.results.publish(
        &task.task_id,
        TaskOutcome::Uploaded {
            storage_key,
            storage_etag,
        },
    );
    ExecuteOutcome::Completed
}

async fn fail_task(ctx: &ExecutorContext, task: &ChunkWriteTask, detail: String) -> ExecuteOutcome {
    warn!(
        upload_id = %task.upload_id,
        chunk_index = task.chunk_index,
        retry_count = task.retry_count,
        "chunk task failed: {}",
        detail
    );
    if let Err(err) = ctx
        .metadata
        .mark_chunk_failed(&task.upload_id, task.chunk_index, task.retry_count)
        .await
    {
        warn!(upload_id = %task.upload_id, "failed to mark chunk FAILED: {}", err);
    }
    CHUNK_UPLOAD_FAILURES_TOTAL.inc();
    ctx.results
        .publish(&task.task_id, TaskOutcome::Failed { detail: detail.clone() });
    ExecuteOutcome::Failed(detail)
}

enum WorkerMessage {
    Task(PoolTask),
    Retire,
}

/// A task travelling through the direct-mode pool together with its
/// admission permit; dropping the task at a terminal outcome releases the
/// limiter gates exactly once.
pub struct PoolTask {
    pub task: ChunkWriteTask,
    pub permit: AdmissionPermit,
}

/// Resizable worker pool over a bounded in-process queue.
pub struct WorkerPool {
    sender: async_channel::Sender<WorkerMessage>,
    receiver: async_channel::Receiver<WorkerMessage>,
    ctx: Arc<ExecutorContext>,
    workers: Arc<AtomicUsize>,
    busy: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub fn new(
        ctx: Arc<ExecutorContext>,
        queue_capacity: usize,
        initial_workers: usize,
        workers: Arc<AtomicUsize>,
    ) -> Arc<Self> {
        let (sender, receiver) = async_channel::bounded(queue_capacity.max(1));
        let pool = Arc::new(Self {
            sender,
            receiver,
            ctx,
            workers,
            busy: Arc::new(AtomicUsize::new(0)),
        });
        for _ in 0..initial_workers {
            pool.spawn_worker();
        }
        pool.workers.store(initial_workers, Ordering::SeqCst);
        WORKER_COUNT.set(initial_workers as i64);
        pool
    }

    fn spawn_worker(&self) {
        let receiver = self.receiver.clone();
        let ctx = Arc::clone(&self.ctx);
        let busy = Arc::clone(&self.busy);
        tokio::spawn(async move {
            while let Ok(message) = receiver.recv().await {
                match message {
                    WorkerMessage::Retire => break,
                    WorkerMessage::Task(mut pool_task) => {
                        pool_task.permit.mark_started();
                        busy.fetch_add(1, Ordering::SeqCst);
                        WORKER_BUSY_COUNT.set(busy.load(Ordering::SeqCst) as i64);

                        loop {
                            match execute_chunk_task(&ctx, &pool_task.task).await {
                                ExecuteOutcome::Transient(detail) => {
                                    // Immediate re-submission; the retry
                                    // budget is enforced in the executor.
                                    pool_task.task.retry_count += 1;
                                    RETRIES_TOTAL.inc();
                                    debug!(
                                        upload_id = %pool_task.task.upload_id,
                                        chunk_index = pool_task.task.chunk_index,
                                        retry_count = pool_task.task.retry_count,
                                        "retrying chunk task: {}",
                                        detail
                                    );
                                }
                                _ => break,
                            }
                        }

                        busy.fetch_sub(1, Ordering::SeqCst);
                        WORKER_BUSY_COUNT.set(busy.load(Ordering::SeqCst) as i64);
                        // pool_task drops here, releasing the permit.
                    }
                }
            }
        });
    }

    /// Hand an admitted task to the pool.
    pub async fn submit(&self, task: ChunkWriteTask, permit: AdmissionPermit) {
        // Admission already bounded the queue; a send only waits while a
        // worker is between recv calls.
        let _ = self
            .sender
            .send(WorkerMessage::Task(PoolTask { task, permit }))
            .await;
    }

    /// (queued, busy, worker_count) for the autoscaler tick.
    pub fn snapshot(&self) -> (usize, usize, usize) {
        (
            self.receiver.len(),
            self.busy.load(Ordering::SeqCst),
            self.workers.load(Ordering::SeqCst),
        )
    }

    pub fn worker_count(&self) -> usize {
        self.workers.load(Ordering::SeqCst)
    }

    /// Grow or shrink to `target`. Shrinking retires idle workers via the
    /// message queue and never cancels in-flight tasks.
    pub async fn resize(&self, target: usize) {
        let current = self.workers.load(Ordering::SeqCst);
        if target > current {
            for _ in current..target {
                self.spawn_worker();
            }
        } else {
            for _ in target..current {
                let _ = self.sender.send(WorkerMessage::Retire).await;
            }
        }
        self.workers.store(target, Ordering::SeqCst);
        WORKER_COUNT.set(target as i64);
    }
}

/// Consumer loop for durable mode: identical executor logic, retry via
/// nack-with-redelivery, ack only after the outcome is published.
pub async fn run_queue_consumer(
    consumer_id: usize,
    ctx: Arc<ExecutorContext>,
    queue: Arc<dyn DurableQueue>,
    poll_timeout: Duration,
    stop: tokio_util::sync::CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = stop.cancelled() => return,
            message = queue.dequeue(poll_timeout) => message,
        };
        let mut message = match message {
            Ok(Some(message)) => message,
            Ok(None) => continue,
            Err(err) => {
                warn!(consumer_id, "queue consumer dequeue failed: {}", err);
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        match execute_chunk_task(&ctx, &message.task).await {
            ExecuteOutcome::Transient(detail) => {
                message.task.retry_count += 1;
                RETRIES_TOTAL.inc();
                debug!(
                    consumer_id,
                    upload_id = %message.task.upload_id,
                    retry_count = message.task.retry_count,
                    "re-enqueueing chunk task: {}",
                    detail
                );
                if let Err(err) = queue.nack(&message, true).await {
                    warn!(consumer_id, "nack failed: {}", err);
                }
            }
            _ => {
                if let Err(err) = queue.ack(&message).await {
                    warn!(consumer_id, "ack failed: {}", err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::upload::Upload;
    use crate::services::limits::Limiters;
    use crate::services::storage::{LocalChunkStorage, StorageError, StorageResult};
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::Utc;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn metadata() -> MetadataStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        MetadataStore::apply_migrations(&pool).await.unwrap();
        MetadataStore::new(Arc::new(pool))
    }

    async fn seed_upload(store: &MetadataStore, id: &str, total_chunks: i64) {
        let now = Utc::now();
        store
            .insert_upload(&Upload {
                id: id.into(),
                owner_id: "owner".into(),
                file_name: "data.bin".into(),
                file_size: total_chunks * 4,
                chunk_size: 4,
                total_chunks,
                file_checksum_sha256: None,
                status: crate::models::upload::UploadStatus::Initiated,
                multipart_upload_id: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
    }

    fn context(metadata: MetadataStore, storage: Arc<dyn ChunkStorage>) -> Arc<ExecutorContext> {
        Arc::new(ExecutorContext {
            metadata,
            storage,
            results: Arc::new(ResultRegistry::new()),
            max_retries: 3,
        })
    }

    /// Storage wrapper that fails the first N puts transiently.
    struct FlakyStorage {
        inner: LocalChunkStorage,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl ChunkStorage for FlakyStorage {
        async fn put(&self, key: &str, data: Bytes) -> StorageResult<Option<String>> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StorageError::Transient("simulated outage".into()));
            }
            self.inner.put(key, data).await
        }

        async fn get(
            &self,
            key: &str,
            offset: Option<u64>,
            length: Option<u64>,
        ) -> StorageResult<Bytes> {
            self.inner.get(key, offset, length).await
        }

        async fn delete(&self, key: &str) -> StorageResult<()> {
            self.inner.delete(key).await
        }

        async fn list_keys(&self, prefix: &str) -> StorageResult<Vec<String>> {
            self.inner.list_keys(prefix).await
        }
    }

    #[tokio::test]
    async fn pool_executes_task_and_releases_permit() {
        let tmp = tempfile::tempdir().unwrap();
        let store = metadata().await;
        seed_upload(&store, "u1", 1).await;

        let workers = Arc::new(AtomicUsize::new(0));
        let limiters = Arc::new(Limiters::new(16, 16, 16, 0, Arc::clone(&workers)));
        let ctx = context(store.clone(), Arc::new(LocalChunkStorage::new(tmp.path())));
        let pool = WorkerPool::new(Arc::clone(&ctx), 16, 2, Arc::clone(&workers));

        let task = ChunkWriteTask::from_bytes("u1", 0, &Bytes::from_static(b"abcd"), None);
        let receiver = ctx.results.register(&task.task_id);
        let permit = limiters.acquire("u1").unwrap();
        pool.submit(task, permit).await;

        match receiver.await.unwrap() {
            TaskOutcome::Uploaded { storage_key, .. } => {
                assert_eq!(storage_key, "uploads/u1/chunk_0");
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let chunk = store.get_chunk("u1", 0).await.unwrap().unwrap();
        assert_eq!(chunk.status, crate::models::chunk::ChunkStatus::Uploaded);
        assert_eq!(chunk.size_bytes, 4);

        // Terminal outcome released the gates.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(limiters.inflight(), 0);
        assert_eq!(limiters.queued(), 0);

        let upload = store.fetch_upload("u1").await.unwrap();
        assert_eq!(upload.status, crate::models::upload::UploadStatus::InProgress);
    }

    #[tokio::test]
    async fn transient_failures_retry_until_success() {
        let tmp = tempfile::tempdir().unwrap();
        let store = metadata().await;
        seed_upload(&store, "u1", 1).await;

        let storage = Arc::new(FlakyStorage {
            inner: LocalChunkStorage::new(tmp.path()),
            failures_left: AtomicUsize::new(2),
        });
        let ctx = context(store.clone(), storage);

        let mut task = ChunkWriteTask::from_bytes("u1", 0, &Bytes::from_static(b"abcd"), None);
        loop {
            match execute_chunk_task(&ctx, &task).await {
                ExecuteOutcome::Transient(_) => task.retry_count += 1,
                ExecuteOutcome::Completed => break,
                _ => panic!("expected eventual completion, retry {}", task.retry_count),
            }
        }
        assert_eq!(task.retry_count, 2);
        let chunk = store.get_chunk("u1", 0).await.unwrap().unwrap();
        assert_eq!(chunk.status, crate::models::chunk::ChunkStatus::Uploaded);
    }

    #[tokio::test]
    async fn retry_exhaustion_marks_chunk_failed() {
        let tmp = tempfile::tempdir().unwrap();
        let store = metadata().await;
        seed_upload(&store, "u1", 1).await;

        let storage = Arc::new(FlakyStorage {
            inner: LocalChunkStorage::new(tmp.path()),
            failures_left: AtomicUsize::new(100),
        });
        let ctx = context(store.clone(), storage);

        let mut task = ChunkWriteTask::from_bytes("u1", 0, &Bytes::from_static(b"abcd"), None);
        loop {
            match execute_chunk_task(&ctx, &task).await {
                ExecuteOutcome::Transient(_) => task.retry_count += 1,
                ExecuteOutcome::Failed(_) => break,
                _ => panic!("expected failure"),
            }
        }
        assert_eq!(task.retry_count, ctx.max_retries);
        let chunk = store.get_chunk("u1", 0).await.unwrap().unwrap();
        assert_eq!(chunk.status, crate::models::chunk::ChunkStatus::Failed);
        // The upload itself is not failed; the client can resume.
        let upload = store.fetch_upload("u1").await.unwrap();
        assert_eq!(upload.status, crate::models::upload::UploadStatus::Initiated);
    }

    #[tokio::test]
    async fn duplicate_execution_short_circuits_without_second_write() {
        let tmp = tempfile::tempdir().unwrap();
        let store = metadata().await;
        seed_upload(&store, "u1", 1).await;
        let ctx = context(store.clone(), Arc::new(LocalChunkStorage::new(tmp.path())));

        let task = ChunkWriteTask::from_bytes("u1", 0, &Bytes::from_static(b"abcd"), None);
        assert!(matches!(
            execute_chunk_task(&ctx, &task).await,
            ExecuteOutcome::Completed
        ));
        let replay = ChunkWriteTask::from_bytes("u1", 0, &Bytes::from_static(b"abcd"), None);
        assert!(matches!(
            execute_chunk_task(&ctx, &replay).await,
            ExecuteOutcome::ShortCircuited
        ));
    }

    #[tokio::test]
    async fn resize_grows_and_shrinks_worker_count() {
        let tmp = tempfile::tempdir().unwrap();
        let store = metadata().await;
        let workers = Arc::new(AtomicUsize::new(0));
        let ctx = context(store, Arc::new(LocalChunkStorage::new(tmp.path())));
        let pool = WorkerPool::new(ctx, 16, 2, workers);

        pool.resize(4).await;
        assert_eq!(pool.worker_count(), 4);
        pool.resize(1).await;
        assert_eq!(pool.worker_count(), 1);
    }

    #[tokio::test]
    async fn interleaved_and_duplicated_executions_converge() {
        // Several execution orders, with duplicates, must all end with the
        // same UPLOADED set as the in-order run.
        let orders: [&[i64]; 4] = [
            &[0, 1, 2],
            &[2, 0, 1, 0],
            &[1, 1, 2, 0, 2],
            &[2, 2, 1, 0, 1, 0],
        ];
        for order in orders {
            let tmp = tempfile::tempdir().unwrap();
            let store = metadata().await;
            seed_upload(&store, "u1", 3).await;
            let ctx = context(store.clone(), Arc::new(LocalChunkStorage::new(tmp.path())));

            let payloads: [&[u8]; 3] = [b"aaaa", b"bbbb", b"cc"];
            for &index in order {
                let task = ChunkWriteTask::from_bytes(
                    "u1",
                    index,
                    &Bytes::copy_from_slice(payloads[index as usize]),
                    None,
                );
                match execute_chunk_task(&ctx, &task).await {
                    ExecuteOutcome::Completed | ExecuteOutcome::ShortCircuited => {}
                    _ => panic!("unexpected terminal outcome in order {:?}", order),
                }
            }

            let chunks = store.list_chunks_ordered("u1").await.unwrap();
            assert_eq!(chunks.len(), 3, "order {:?}", order);
            for chunk in &chunks {
                assert_eq!(chunk.status, crate::models::chunk::ChunkStatus::Uploaded);
                assert_eq!(
                    chunk.size_bytes,
                    payloads[chunk.chunk_index as usize].len() as i64
                );
            }
            assert!(store.missing_indices("u1", 3).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn queue_consumer_processes_and_acks() {
        let tmp = tempfile::tempdir().unwrap();
        let store = metadata().await;
        seed_upload(&store, "u1", 1).await;
        let ctx = context(store.clone(), Arc::new(LocalChunkStorage::new(tmp.path())));

        let queue: Arc<dyn DurableQueue> =
            Arc::new(crate::services::queue::MemoryDurableQueue::new(8));
        let stop = tokio_util::sync::CancellationToken::new();
        let consumer = tokio::spawn(run_queue_consumer(
            0,
            Arc::clone(&ctx),
            Arc::clone(&queue),
            Duration::from_millis(50),
            stop.clone(),
        ));

        let task = ChunkWriteTask::from_bytes("u1", 0, &Bytes::from_static(b"abcd"), None);
        let receiver = ctx.results.register(&task.task_id);
        queue.enqueue(task).await.unwrap();

        match receiver.await.unwrap() {
            TaskOutcome::Uploaded { .. } => {}
            other => panic!("unexpected outcome {:?}", other),
        }
        stop.cancel();
        let _ = consumer.await;
    }
}
