use anyhow::Result;
use sqlx::sqlite::SqlitePoolOptions;
use std::{fs, path::Path, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use transfer_store::config::AppConfig;
use transfer_store::routes;
use transfer_store::services::{autoscaler, maintenance, metadata::MetadataStore, worker};
use transfer_store::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;
    tracing::info!(
        "Starting {} v{} (storage={}, queue={})",
        cfg.app_name,
        cfg.app_version,
        cfg.storage_backend,
        cfg.queue_backend
    );
    if cfg.tracing_enabled {
        tracing::info!(
            "tracing export requested to {}; exporter wiring is external to this service",
            cfg.otlp_endpoint
        );
    }

    // --- Ensure storage directory exists ---
    if cfg.storage_backend.eq_ignore_ascii_case("local")
        && !Path::new(&cfg.storage_root).exists()
    {
        fs::create_dir_all(&cfg.storage_root)?;
        tracing::info!("Created storage directory at {}", cfg.storage_root);
    }

    // --- Initialize SQLite connection ---
    let db_path = cfg
        .database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("file:");
    if db_path != ":memory:" {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        // SQLx will not create the database file itself.
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(db_path)?;
    }

    let db: Arc<sqlx::Pool<sqlx::Sqlite>> = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&cfg.database_url)
            .await?,
    );

    MetadataStore::apply_migrations(&db).await?;
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    // --- Wire subsystems ---
    let addr = cfg.addr();
    let state = AppState::build(cfg, db)?;
    let stop = CancellationToken::new();

    // --- Background loops ---
    if state.config.cleanup_enabled {
        tokio::spawn(maintenance::run_cleanup_loop(
            state.metadata.clone(),
            Arc::clone(&state.storage),
            Duration::from_secs(state.config.cleanup_interval_seconds),
            Duration::from_secs(state.config.stale_upload_ttl_seconds),
            Duration::from_secs(state.config.idempotency_ttl_seconds),
            stop.clone(),
        ));
    }
    if state.config.autoscale_enabled {
        tokio::spawn(autoscaler::run_autoscaler(
            Arc::clone(&state.pool),
            autoscaler::AutoscaleConfig {
                min_workers: state.config.min_workers,
                max_workers: state.config.max_workers,
                cooldown: Duration::from_secs(state.config.autoscale_cooldown_seconds),
                scale_up_queue_threshold: state.config.scale_up_queue_threshold,
                scale_up_utilization_threshold: state.config.scale_up_utilization_threshold,
                scale_down_utilization_threshold: state.config.scale_down_utilization_threshold,
            },
            stop.clone(),
        ));
    }
    if state.durable_route {
        for consumer_id in 0..state.config.queue_consumer_count.max(1) {
            tokio::spawn(worker::run_queue_consumer(
                consumer_id,
                Arc::clone(&state.executor),
                Arc::clone(&state.queue),
                Duration::from_secs(state.config.queue_poll_timeout_seconds.max(1)),
                stop.clone(),
            ));
        }
    }

    // --- Build router and serve ---
    let app = routes::routes::routes(state);
    tracing::info!("Server listening on http://{}", addr);
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    stop.cancel();
    Ok(())
}
