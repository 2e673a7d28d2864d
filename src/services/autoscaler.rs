//! Adaptive worker autoscaling.
//!
//! A periodic tick reads the pool snapshot and grows on queue depth or
//! high utilization, shrinks when idle with an empty queue. Distinct up and
//! down thresholds give hysteresis; a shared cooldown keeps the pool from
//! oscillating.

use crate::services::worker::WorkerPool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Clone, Debug)]
pub struct AutoscaleConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub cooldown: Duration,
    pub scale_up_queue_threshold: usize,
    pub scale_up_utilization_threshold: f64,
    pub scale_down_utilization_threshold: f64,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ScaleDecision {
    Grow(usize),
    Shrink(usize),
    Hold,
}

/// One tick's decision. Pure so the rules are testable without a pool.
pub fn decide(
    queued: usize,
    busy: usize,
    worker_count: usize,
    last_scale: Option<Instant>,
    now: Instant,
    config: &AutoscaleConfig,
) -> ScaleDecision {
    let in_cooldown = last_scale
        .map(|at| now.duration_since(at) < config.cooldown)
        .unwrap_or(false);
    if in_cooldown {
        return ScaleDecision::Hold;
    }

    let utilization = busy as f64 / worker_count.max(1) as f64;

    if (queued >= config.scale_up_queue_threshold
        || utilization >= config.scale_up_utilization_threshold)
        && worker_count < config.max_workers
    {
        return ScaleDecision::Grow(worker_count + 1);
    }

    if queued == 0
        && utilization <= config.scale_down_utilization_threshold
        && worker_count > config.min_workers
    {
        return ScaleDecision::Shrink(worker_count - 1);
    }

    ScaleDecision::Hold
}

/// Periodic autoscaler loop over the direct-mode worker pool.
pub async fn run_autoscaler(
    pool: Arc<WorkerPool>,
    config: AutoscaleConfig,
    stop: CancellationToken,
) {
    let mut last_scale: Option<Instant> = None;
    let tick = Duration::from_secs(1);
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(tick) => {}
        }

        let (queued, busy, count) = pool.snapshot();
        match decide(queued, busy, count, last_scale, Instant::now(), &config) {
            ScaleDecision::Grow(target) | ScaleDecision::Shrink(target) => {
                pool.resize(target).await;
                last_scale = Some(Instant::now());
                info!(
                    from_workers = count,
                    to_workers = target,
                    queued,
                    busy,
                    "worker pool scaled"
                );
            }
            ScaleDecision::Hold => {}
        }
    }
}
