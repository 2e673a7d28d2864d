//! Durable queue for chunk-write tasks.
//!
//! Two backends: a bounded in-process FIFO, and a table on the metadata
//! database with a visibility timeout, where dequeue leases a row, `ack`
//! deletes it and `nack` releases it for redelivery. Consumers run the same executor
//! path as the direct worker pool, and the accepting request waits for the
//! per-task outcome through `ResultRegistry`.

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue backend failure: {0}")]
    Backend(String),
    #[error("task payload codec failure: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type QueueResult<T> = Result<T, QueueError>;

impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        QueueError::Backend(err.to_string())
    }
}

/// One chunk write, self-contained so it can cross a process boundary.
/// Chunk bytes ride base64-encoded inside the JSON payload.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ChunkWriteTask {
    pub task_id: String,
    pub upload_id: String,
    pub chunk_index: i64,
    pub multipart_upload_id: Option<String>,
    pub retry_count: i64,
    pub data_b64: String,
}

impl ChunkWriteTask {
    pub fn from_bytes(
        upload_id: &str,
        chunk_index: i64,
        data: &Bytes,
        multipart_upload_id: Option<String>,
    ) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            upload_id: upload_id.to_string(),
            chunk_index,
            multipart_upload_id,
            retry_count: 0,
            data_b64: general_purpose::STANDARD.encode(data),
        }
    }

    pub fn data(&self) -> QueueResult<Bytes> {
        general_purpose::STANDARD
            .decode(&self.data_b64)
            .map(Bytes::from)
            .map_err(|err| QueueError::Backend(format!("invalid task payload: {}", err)))
    }

    pub fn to_json(&self) -> QueueResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(payload: &str) -> QueueResult<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}

/// A leased task plus the receipt needed to ack or nack it.
#[derive(Debug)]
pub struct QueueMessage {
    pub receipt: String,
    pub task: ChunkWriteTask,
}

#[async_trait]
pub trait DurableQueue: Send + Sync {
    /// Add a task. Durable once this returns for database-backed variants;
    /// the memory variant blocks while the queue is at capacity.
    async fn enqueue(&self, task: ChunkWriteTask) -> QueueResult<()>;

    /// Next task, or None once the timeout elapses with nothing available.
    async fn dequeue(&self, timeout: Duration) -> QueueResult<Option<QueueMessage>>;

    /// Terminal success: the task will not be delivered again.
    async fn ack(&self, message: &QueueMessage) -> QueueResult<()>;

    /// Release the task. With `retry`, it becomes deliverable again with
    /// the message's (updated) payload; without, it is discarded.
    async fn nack(&self, message: &QueueMessage, retry: bool) -> QueueResult<()>;
}

/// Bounded in-process FIFO. Ack and nack collapse to in-process disposal.
pub struct MemoryDurableQueue {
    sender: async_channel::Sender<ChunkWriteTask>,
    receiver: async_channel::Receiver<ChunkWriteTask>,
}

impl MemoryDurableQueue {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = async_channel::bounded(capacity.max(1));
        Self { sender, receiver }
    }
}

#[async_trait]
impl DurableQueue for MemoryDurableQueue {
    async fn enqueue(&self, task: ChunkWriteTask) -> QueueResult<()> {
        self.sender
            .send(task)
            .await
            .map_err(|_| QueueError::Backend("queue closed".into()))
    }

    async fn dequeue(&self, timeout: Duration) -> QueueResult<Option<QueueMessage>> {
        match tokio::time::timeout(timeout, self.receiver.recv()).await {
            Ok(Ok(task)) => Ok(Some(QueueMessage {
                receipt: task.task_id.clone(),
                task,
            })),
            Ok(Err(_)) => Err(QueueError::Backend("queue closed".into())),
            Err(_) => Ok(None),
        }
    }

    async fn ack(&self, _message: &QueueMessage) -> QueueResult<()> {
        Ok(())
    }

    async fn nack(&self, message: &QueueMessage, retry: bool) -> QueueResult<()> {
        if retry {
            self.enqueue(message.task.clone()).await?;
        }
        Ok(())
    }
}

/// Queue rows live on the metadata database. A dequeue leases the oldest
/// unlocked row for `visibility`; a crashed consumer's lease simply expires
/// and the task is redelivered.
pub struct SqliteDurableQueue {
    db: Arc<SqlitePool>,
    visibility: Duration,
}

impl SqliteDurableQueue {
    const POLL_INTERVAL: Duration = Duration::from_millis(100);

    pub fn new(db: Arc<SqlitePool>, visibility: Duration) -> Self {
        Self { db, visibility }
    }

    async fn lease_one(&self) -> QueueResult<Option<QueueMessage>> {
        let now = Utc::now();
        let locked_until = now
            + ChronoDuration::from_std(self.visibility)
                .unwrap_or_else(|_| ChronoDuration::seconds(30));

        let row: Option<(String, String)> = sqlx::query_as(
            "UPDATE queue_tasks SET locked_until = ?
             WHERE task_id = (
                 SELECT task_id FROM queue_tasks
                 WHERE locked_until IS NULL OR locked_until < ?
                 ORDER BY created_at ASC LIMIT 1
             )
             RETURNING task_id, payload",
        )
        .bind(locked_until)
        .bind(now)
        .fetch_optional(&*self.db)
        .await?;

        match row {
            Some((task_id, payload)) => Ok(Some(QueueMessage {
                receipt: task_id,
                task: ChunkWriteTask::from_json(&payload)?,
            })),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl DurableQueue for SqliteDurableQueue {
    async fn enqueue(&self, task: ChunkWriteTask) -> QueueResult<()> {
        sqlx::query(
            "INSERT INTO queue_tasks (task_id, payload, locked_until, created_at)
             VALUES (?, ?, NULL, ?)",
        )
        .bind(&task.task_id)
        .bind(task.to_json()?)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> QueueResult<Option<QueueMessage>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(message) = self.lease_one().await? {
                return Ok(Some(message));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Self::POLL_INTERVAL.min(timeout)).await;
        }
    }

    async fn ack(&self, message: &QueueMessage) -> QueueResult<()> {
        sqlx::query("DELETE FROM queue_tasks WHERE task_id = ?")
            .bind(&message.receipt)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    async fn nack(&self, message: &QueueMessage, retry: bool) -> QueueResult<()> {
        if retry {
            sqlx::query(
                "UPDATE queue_tasks SET payload = ?, locked_until = NULL WHERE task_id = ?",
            )
            .bind(message.task.to_json()?)
            .bind(&message.receipt)
            .execute(&*self.db)
            .await?;
        } else {
            self.ack(message).await?;
        }
        Ok(())
    }
}

/// Terminal outcome of one chunk-write task.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Uploaded {
        storage_key: String,
        storage_etag: Option<String>,
    },
    Failed {
        detail: String,
    },
}

/// Hands the acceptance path a one-shot channel keyed by task id; the
/// executor publishes the outcome when the task reaches a terminal state.
/// A publish with no registered waiter (the client gave up) is dropped.
#[derive(Default)]
pub struct ResultRegistry {
    waiters: Mutex<HashMap<String, oneshot::Sender<TaskOutcome>>>,
}

impl ResultRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, task_id: &str) -> oneshot::Receiver<TaskOutcome> {
        let (sender, receiver) = oneshot::channel();
        self.waiters
            .lock()
            .unwrap()
            .insert(task_id.to_string(), sender);
        receiver
    }

    pub fn publish(&self, task_id: &str, outcome: TaskOutcome) {
        if let Some(sender) = self.waiters.lock().unwrap().remove(task_id) {
            let _ = sender.send(outcome);
        }
    }

    /// Drop the waiter after a timed-out wait; the task keeps running.
    pub fn forget(&self, task_id: &str) {
        self.waiters.lock().unwrap().remove(task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::metadata::MetadataStore;
    use sqlx::sqlite::SqlitePoolOptions;

    fn task(upload_id: &str, index: i64) -> ChunkWriteTask {
        ChunkWriteTask::from_bytes(upload_id, index, &Bytes::from_static(b"payload"), None)
    }

    #[test]
    fn task_json_roundtrip_preserves_bytes() {
        let original = task("u1", 3);
        let decoded = ChunkWriteTask::from_json(&original.to_json().unwrap()).unwrap();
        assert_eq!(decoded.upload_id, "u1");
        assert_eq!(decoded.chunk_index, 3);
        assert_eq!(&decoded.data().unwrap()[..], b"payload");
    }

    #[tokio::test]
    async fn memory_queue_is_fifo_and_times_out_empty() {
        let queue = MemoryDurableQueue::new(8);
        queue.enqueue(task("u1", 0)).await.unwrap();
        queue.enqueue(task("u1", 1)).await.unwrap();

        let first = queue.dequeue(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(first.task.chunk_index, 0);
        let second = queue.dequeue(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(second.task.chunk_index, 1);
        assert!(queue.dequeue(Duration::from_millis(20)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_nack_with_retry_redelivers() {
        let queue = MemoryDurableQueue::new(8);
        queue.enqueue(task("u1", 0)).await.unwrap();
        let message = queue.dequeue(Duration::from_millis(50)).await.unwrap().unwrap();
        queue.nack(&message, true).await.unwrap();
        let redelivered = queue.dequeue(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(redelivered.task.task_id, message.task.task_id);
    }

    async fn sqlite_queue(visibility: Duration) -> SqliteDurableQueue {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        MetadataStore::apply_migrations(&pool).await.unwrap();
        SqliteDurableQueue::new(Arc::new(pool), visibility)
    }

    #[tokio::test]
    async fn sqlite_queue_ack_removes_the_task() {
        let queue = sqlite_queue(Duration::from_secs(30)).await;
        queue.enqueue(task("u1", 0)).await.unwrap();

        let message = queue.dequeue(Duration::from_millis(200)).await.unwrap().unwrap();
        // Leased: a second consumer sees nothing.
        assert!(queue.dequeue(Duration::from_millis(20)).await.unwrap().is_none());
        queue.ack(&message).await.unwrap();
        assert!(queue.dequeue(Duration::from_millis(20)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sqlite_queue_nack_redelivers_updated_payload() {
        let queue = sqlite_queue(Duration::from_secs(30)).await;
        queue.enqueue(task("u1", 0)).await.unwrap();

        let mut message = queue.dequeue(Duration::from_millis(200)).await.unwrap().unwrap();
        message.task.retry_count += 1;
        queue.nack(&message, true).await.unwrap();

        let redelivered = queue.dequeue(Duration::from_millis(200)).await.unwrap().unwrap();
        assert_eq!(redelivered.task.retry_count, 1);
    }

    #[tokio::test]
    async fn sqlite_queue_lease_expires() {
        let queue = sqlite_queue(Duration::from_millis(50)).await;
        queue.enqueue(task("u1", 0)).await.unwrap();

        let _leased = queue.dequeue(Duration::from_millis(200)).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        // Lease lapsed without an ack: the task is deliverable again.
        let redelivered = queue.dequeue(Duration::from_millis(200)).await.unwrap();
        assert!(redelivered.is_some());
    }

    #[tokio::test]
    async fn result_registry_delivers_to_waiter() {
        let registry = ResultRegistry::new();
        let receiver = registry.register("t1");
        registry.publish(
            "t1",
            TaskOutcome::Uploaded {
                storage_key: "k".into(),
                storage_etag: None,
            },
        );
        match receiver.await.unwrap() {
            TaskOutcome::Uploaded { storage_key, .. } => assert_eq!(storage_key, "k"),
            other => panic!("unexpected outcome {:?}", other),
        }
        // Publishing without a waiter must not panic.
        registry.publish("t2", TaskOutcome::Failed { detail: "x".into() });
    }
}
