//! Centralized application configuration.
//! Combines environment variables (`TRANSFER_STORE_*`) and CLI arguments.

use anyhow::{Context, Result};
use clap::Parser;
use std::env;
use std::fmt::Display;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub app_name: String,
    pub app_version: String,
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub storage_backend: String,
    pub storage_root: String,

    pub auth_mode: String,
    pub api_key_mappings: String,
    pub admin_user_ids: String,
    pub api_rate_limit_per_minute: u32,
    pub jwt_secret: String,
    pub jwt_algorithm: String,
    pub jwt_audience: String,
    pub jwt_issuer: String,

    pub chunk_size_bytes: i64,
    /// Ceiling on the chunk size a client may negotiate at init; also
    /// sizes the HTTP body limit.
    pub max_chunk_size_bytes: i64,
    pub max_retries: i64,
    pub max_inflight_chunks_per_upload: usize,
    /// 0 selects the automatic cap of max(1, worker_count / 2).
    pub max_fair_inflight_chunks_per_upload: usize,
    pub max_global_inflight_chunks: usize,
    pub task_queue_maxsize: usize,
    pub worker_count: usize,

    pub autoscale_enabled: bool,
    pub min_workers: usize,
    pub max_workers: usize,
    pub autoscale_cooldown_seconds: u64,
    pub scale_up_queue_threshold: usize,
    pub scale_up_utilization_threshold: f64,
    pub scale_down_utilization_threshold: f64,

    pub queue_backend: String,
    pub queue_consumer_count: usize,
    pub queue_poll_timeout_seconds: u64,
    pub queue_task_timeout_seconds: u64,

    pub cleanup_enabled: bool,
    pub cleanup_interval_seconds: u64,
    pub stale_upload_ttl_seconds: u64,
    pub idempotency_ttl_seconds: u64,

    pub tracing_enabled: bool,
    pub otlp_endpoint: String,
}

/// Command-line overrides for the most commonly changed options.
#[derive(Parser, Debug)]
#[command(author, version, about = "Resumable chunked file transfer API")]
pub struct Args {
    /// Host to bind to (overrides TRANSFER_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides TRANSFER_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where chunk blobs are stored (overrides TRANSFER_STORE_STORAGE_ROOT)
    #[arg(long)]
    pub storage_root: Option<String>,

    /// Database URL (overrides TRANSFER_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr + Display,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and the
    /// migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let (cfg, migrate) = Self::from_env(args)?;
        Ok((cfg, migrate))
    }

    fn from_env(args: Args) -> Result<(Self, bool)> {
        let cfg = Self {
            app_name: env_string("TRANSFER_STORE_APP_NAME", "transfer-store"),
            app_version: env_string("TRANSFER_STORE_APP_VERSION", env!("CARGO_PKG_VERSION")),
            host: args
                .host
                .unwrap_or_else(|| env_string("TRANSFER_STORE_HOST", "0.0.0.0")),
            port: match args.port {
                Some(port) => port,
                None => env_parse("TRANSFER_STORE_PORT", 8000)?,
            },
            database_url: args.database_url.unwrap_or_else(|| {
                env_string(
                    "TRANSFER_STORE_DATABASE_URL",
                    "sqlite://./data/transfer_store.db",
                )
            }),
            storage_backend: env_string("TRANSFER_STORE_STORAGE_BACKEND", "local"),
            storage_root: args
                .storage_root
                .unwrap_or_else(|| env_string("TRANSFER_STORE_STORAGE_ROOT", "./data/chunks")),

            auth_mode: env_string("TRANSFER_STORE_AUTH_MODE", "api_key"),
            api_key_mappings: env_string("TRANSFER_STORE_API_KEY_MAPPINGS", "dev-key:dev-user"),
            admin_user_ids: env_string("TRANSFER_STORE_ADMIN_USER_IDS", "dev-user"),
            api_rate_limit_per_minute: env_parse("TRANSFER_STORE_API_RATE_LIMIT_PER_MINUTE", 0)?,
            jwt_secret: env_string("TRANSFER_STORE_JWT_SECRET", ""),
            jwt_algorithm: env_string("TRANSFER_STORE_JWT_ALGORITHM", "HS256"),
            jwt_audience: env_string("TRANSFER_STORE_JWT_AUDIENCE", ""),
            jwt_issuer: env_string("TRANSFER_STORE_JWT_ISSUER", ""),

            chunk_size_bytes: env_parse("TRANSFER_STORE_CHUNK_SIZE_BYTES", 5 * 1024 * 1024)?,
            max_chunk_size_bytes: env_parse(
                "TRANSFER_STORE_MAX_CHUNK_SIZE_BYTES",
                64 * 1024 * 1024,
            )?,
            max_retries: env_parse("TRANSFER_STORE_MAX_RETRIES", 3)?,
            max_inflight_chunks_per_upload: env_parse(
                "TRANSFER_STORE_MAX_INFLIGHT_CHUNKS_PER_UPLOAD",
                8,
            )?,
            max_fair_inflight_chunks_per_upload: env_parse(
                "TRANSFER_STORE_MAX_FAIR_INFLIGHT_CHUNKS_PER_UPLOAD",
                0,
            )?,
            max_global_inflight_chunks: env_parse(
                "TRANSFER_STORE_MAX_GLOBAL_INFLIGHT_CHUNKS",
                128,
            )?,
            task_queue_maxsize: env_parse("TRANSFER_STORE_TASK_QUEUE_MAXSIZE", 512)?,
            worker_count: env_parse("TRANSFER_STORE_WORKER_COUNT", 16)?,

            autoscale_enabled: env_parse("TRANSFER_STORE_AUTOSCALE_ENABLED", false)?,
            min_workers: env_parse("TRANSFER_STORE_MIN_WORKERS", 8)?,
            max_workers: env_parse("TRANSFER_STORE_MAX_WORKERS", 32)?,
            autoscale_cooldown_seconds: env_parse("TRANSFER_STORE_AUTOSCALE_COOLDOWN_SECONDS", 15)?,
            scale_up_queue_threshold: env_parse("TRANSFER_STORE_SCALE_UP_QUEUE_THRESHOLD", 1)?,
            scale_up_utilization_threshold: env_parse(
                "TRANSFER_STORE_SCALE_UP_UTILIZATION_THRESHOLD",
                0.8,
            )?,
            scale_down_utilization_threshold: env_parse(
                "TRANSFER_STORE_SCALE_DOWN_UTILIZATION_THRESHOLD",
                0.2,
            )?,

            queue_backend: env_string("TRANSFER_STORE_QUEUE_BACKEND", "memory"),
            queue_consumer_count: env_parse("TRANSFER_STORE_QUEUE_CONSUMER_COUNT", 4)?,
            queue_poll_timeout_seconds: env_parse("TRANSFER_STORE_QUEUE_POLL_TIMEOUT_SECONDS", 5)?,
            queue_task_timeout_seconds: env_parse("TRANSFER_STORE_QUEUE_TASK_TIMEOUT_SECONDS", 45)?,

            cleanup_enabled: env_parse("TRANSFER_STORE_CLEANUP_ENABLED", false)?,
            cleanup_interval_seconds: env_parse("TRANSFER_STORE_CLEANUP_INTERVAL_SECONDS", 900)?,
            stale_upload_ttl_seconds: env_parse("TRANSFER_STORE_STALE_UPLOAD_TTL_SECONDS", 86_400)?,
            idempotency_ttl_seconds: env_parse("TRANSFER_STORE_IDEMPOTENCY_TTL_SECONDS", 86_400)?,

            tracing_enabled: env_parse("TRANSFER_STORE_TRACING_ENABLED", false)?,
            otlp_endpoint: env_string("TRANSFER_STORE_OTLP_ENDPOINT", "localhost:4317"),
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Fair-share cap with the 0 = auto rule applied.
    pub fn fair_share_cap(&self) -> usize {
        if self.max_fair_inflight_chunks_per_upload > 0 {
            self.max_fair_inflight_chunks_per_upload
        } else {
            (self.worker_count / 2).max(1)
        }
    }

    pub fn use_durable_route(&self) -> bool {
        self.queue_backend.eq_ignore_ascii_case("sqlite")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fair_share_cap_auto_rule() {
        let args = Args {
            host: None,
            port: None,
            storage_root: None,
            database_url: None,
            migrate: false,
        };
        let (mut cfg, _) = AppConfig::from_env(args).unwrap();
        cfg.worker_count = 16;
        cfg.max_fair_inflight_chunks_per_upload = 0;
        assert_eq!(cfg.fair_share_cap(), 8);
        cfg.max_fair_inflight_chunks_per_upload = 3;
        assert_eq!(cfg.fair_share_cap(), 3);
        cfg.worker_count = 1;
        cfg.max_fair_inflight_chunks_per_upload = 0;
        assert_eq!(cfg.fair_share_cap(), 1);
    }
}
