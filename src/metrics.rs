//! Prometheus instruments, registered in a crate-local registry so the
//! `/metrics` endpoint only exposes what this service owns.

use once_cell::sync::Lazy;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntGauge, Opts, Registry, TextEncoder,
};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

fn counter(name: &str, help: &str) -> IntCounter {
    let c = IntCounter::with_opts(Opts::new(name, help)).unwrap();
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
}

fn gauge(name: &str, help: &str) -> IntGauge {
    let g = IntGauge::with_opts(Opts::new(name, help)).unwrap();
    REGISTRY.register(Box::new(g.clone())).unwrap();
    g
}

fn histogram(name: &str, help: &str) -> Histogram {
    let h = Histogram::with_opts(HistogramOpts::new(name, help)).unwrap();
    REGISTRY.register(Box::new(h.clone())).unwrap();
    h
}

pub static CHUNKS_UPLOADED_TOTAL: Lazy<IntCounter> =
    Lazy::new(|| counter("chunks_uploaded_total", "Total chunks uploaded"));
pub static BYTES_UPLOADED_TOTAL: Lazy<IntCounter> =
    Lazy::new(|| counter("bytes_uploaded_total", "Total bytes uploaded"));
pub static CHUNK_UPLOAD_FAILURES_TOTAL: Lazy<IntCounter> =
    Lazy::new(|| counter("chunk_upload_failures_total", "Total failed chunk uploads"));
pub static RETRIES_TOTAL: Lazy<IntCounter> =
    Lazy::new(|| counter("retries_total", "Total retry attempts for chunk uploads"));
pub static THROTTLED_REQUESTS_TOTAL: Lazy<IntCounter> =
    Lazy::new(|| counter("throttled_requests_total", "Total throttled requests"));

pub static TASK_QUEUE_DEPTH: Lazy<IntGauge> =
    Lazy::new(|| gauge("task_queue_depth", "Current task queue depth"));
pub static INFLIGHT_CHUNKS: Lazy<IntGauge> =
    Lazy::new(|| gauge("inflight_chunks", "Current inflight chunk uploads"));
pub static WORKER_COUNT: Lazy<IntGauge> =
    Lazy::new(|| gauge("worker_count", "Configured worker count"));
pub static WORKER_BUSY_COUNT: Lazy<IntGauge> =
    Lazy::new(|| gauge("worker_busy_count", "Workers currently executing a task"));

pub static STORAGE_PUT_LATENCY_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    histogram(
        "storage_put_latency_seconds",
        "Chunk storage write latency in seconds",
    )
});
pub static DB_UPDATE_LATENCY_SECONDS: Lazy<Histogram> =
    Lazy::new(|| histogram("db_update_latency_seconds", "DB update latency in seconds"));

pub static HTTP_REQUEST_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let h = HistogramVec::new(
        HistogramOpts::new(
            "http_request_duration_seconds",
            "HTTP request latency in seconds",
        ),
        &["method", "route", "status_code"],
    )
    .unwrap();
    REGISTRY.register(Box::new(h.clone())).unwrap();
    h
});

/// Render the registry in the Prometheus text exposition format.
pub fn render() -> String {
    TextEncoder::new()
        .encode_to_string(&REGISTRY.gather())
        .unwrap_or_default()
}
