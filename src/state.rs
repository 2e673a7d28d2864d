//! Shared application state threaded through the router, and its builder.

use crate::auth::{AuthMode, Authenticator};
use crate::config::AppConfig;
use crate::services::limits::Limiters;
use crate::services::metadata::MetadataStore;
use crate::services::queue::{
    DurableQueue, MemoryDurableQueue, ResultRegistry, SqliteDurableQueue,
};
use crate::services::storage::{ChunkStorage, LocalChunkStorage};
use crate::services::worker::{ExecutorContext, WorkerPool};
use anyhow::Result;
use sqlx::SqlitePool;
use std::str::FromStr;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub metadata: MetadataStore,
    pub storage: Arc<dyn ChunkStorage>,
    pub limiters: Arc<Limiters>,
    pub pool: Arc<WorkerPool>,
    pub executor: Arc<ExecutorContext>,
    pub queue: Arc<dyn DurableQueue>,
    /// True when chunk writes route through the durable queue instead of
    /// the direct worker pool.
    pub durable_route: bool,
    pub results: Arc<ResultRegistry>,
    pub auth: Arc<Authenticator>,
}

impl AppState {
    /// Wire every subsystem from configuration. Background loops are
    /// spawned by the caller, not here.
    pub fn build(config: AppConfig, db: Arc<SqlitePool>) -> Result<Self> {
        if config.chunk_size_bytes > config.max_chunk_size_bytes {
            anyhow::bail!(
                "chunk_size_bytes ({}) exceeds max_chunk_size_bytes ({})",
                config.chunk_size_bytes,
                config.max_chunk_size_bytes
            );
        }
        let metadata = MetadataStore::new(db.clone());
        let storage: Arc<dyn ChunkStorage> = match config.storage_backend.to_lowercase().as_str() {
            "local" => Arc::new(LocalChunkStorage::new(&config.storage_root)),
            other => anyhow::bail!("unsupported storage backend: {}", other),
        };

        let auth = Arc::new(Authenticator::new(
            AuthMode::from_str(&config.auth_mode)?,
            &config.api_key_mappings,
            &config.admin_user_ids,
            config.api_rate_limit_per_minute,
            &config.jwt_secret,
            &config.jwt_algorithm,
            &config.jwt_audience,
            &config.jwt_issuer,
        )?);

        let workers = Arc::new(AtomicUsize::new(0));
        let limiters = Arc::new(Limiters::new(
            config.task_queue_maxsize,
            config.max_global_inflight_chunks,
            config.max_inflight_chunks_per_upload,
            config.fair_share_cap(),
            Arc::clone(&workers),
        ));
        let results = Arc::new(ResultRegistry::new());
        let executor = Arc::new(ExecutorContext {
            metadata: metadata.clone(),
            storage: Arc::clone(&storage),
            results: Arc::clone(&results),
            max_retries: config.max_retries,
        });

        let initial_workers = if config.autoscale_enabled {
            config
                .worker_count
                .clamp(config.min_workers.max(1), config.max_workers.max(1))
        } else {
            config.worker_count.max(1)
        };
        let pool = WorkerPool::new(
            Arc::clone(&executor),
            config.task_queue_maxsize,
            initial_workers,
            workers,
        );

        let queue: Arc<dyn DurableQueue> = match config.queue_backend.to_lowercase().as_str() {
            "memory" => Arc::new(MemoryDurableQueue::new(config.task_queue_maxsize)),
            "sqlite" => Arc::new(SqliteDurableQueue::new(
                db,
                Duration::from_secs(config.queue_task_timeout_seconds.max(1)),
            )),
            other => anyhow::bail!("unsupported queue backend: {}", other),
        };
        let durable_route = config.use_durable_route();

        Ok(Self {
            config: Arc::new(config),
            metadata,
            storage,
            limiters,
            pool,
            executor,
            queue,
            durable_route,
            results,
            auth,
        })
    }
}
