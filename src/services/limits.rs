//! Layered admission control for the chunk pipeline.
//!
//! Four gates guard a chunk write, acquired strictly in this order:
//! queue-slot, global inflight, per-upload inflight, per-upload fair-share.
//! A refusal releases whatever was already acquired, in reverse. The first
//! two gates are lock-free counters; the per-upload map sits behind its own
//! mutex so the gates never share one critical section.

use crate::metrics::{INFLIGHT_CHUNKS, TASK_QUEUE_DEPTH, THROTTLED_REQUESTS_TOTAL};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Which gate refused admission. Returned to the client in the
/// `X-Backpressure-Reason` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefusalReason {
    QueueFull,
    GlobalFull,
    PerUploadFull,
    FairShareFull,
}

impl RefusalReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RefusalReason::QueueFull => "queue-full",
            RefusalReason::GlobalFull => "global-full",
            RefusalReason::PerUploadFull => "per-upload-full",
            RefusalReason::FairShareFull => "fair-share-full",
        }
    }

    pub fn detail(self) -> &'static str {
        match self {
            RefusalReason::QueueFull => "task queue is full",
            RefusalReason::GlobalFull => "global inflight chunk limit reached",
            RefusalReason::PerUploadFull => "per-upload inflight chunk limit reached",
            RefusalReason::FairShareFull => "per-upload fair-share limit reached",
        }
    }
}

/// Shared admission state. Cheap to clone via `Arc`.
#[derive(Debug)]
pub struct Limiters {
    queue_capacity: usize,
    global_limit: usize,
    per_upload_limit: usize,
    fair_share_limit: usize,
    queued: AtomicUsize,
    global: AtomicUsize,
    per_upload: Mutex<HashMap<String, usize>>,
    /// Current worker count, shared with the pool; defines contention for
    /// the fair-share gate.
    workers: Arc<AtomicUsize>,
}

impl Limiters {
    pub fn new(
        queue_capacity: usize,
        global_limit: usize,
        per_upload_limit: usize,
        fair_share_limit: usize,
        workers: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            queue_capacity,
            global_limit,
            per_upload_limit,
            fair_share_limit,
            queued: AtomicUsize::new(0),
            global: AtomicUsize::new(0),
            per_upload: Mutex::new(HashMap::new()),
            workers,
        }
    }

    /// Acquire all four gates for one chunk task.
    pub fn acquire(self: &Arc<Self>, upload_id: &str) -> Result<AdmissionPermit, RefusalReason> {
        if !try_increment(&self.queued, self.queue_capacity) {
            return Err(self.refuse(RefusalReason::QueueFull));
        }
        if !try_increment(&self.global, self.global_limit) {
            self.release_queued();
            return Err(self.refuse(RefusalReason::GlobalFull));
        }

        {
            let mut counts = self.per_upload.lock().unwrap();
            let current = counts.get(upload_id).copied().unwrap_or(0);
            if current >= self.per_upload_limit {
                drop(counts);
                self.release_global();
                self.release_queued();
                return Err(self.refuse(RefusalReason::PerUploadFull));
            }
            if self.fair_share_limit > 0
                && self.under_contention()
                && current >= self.fair_share_limit
            {
                drop(counts);
                self.release_global();
                self.release_queued();
                return Err(self.refuse(RefusalReason::FairShareFull));
            }
            counts.insert(upload_id.to_string(), current + 1);
        }

        self.publish_gauges();
        Ok(AdmissionPermit {
            limiters: Arc::clone(self),
            upload_id: upload_id.to_string(),
            started: AtomicBool::new(false),
        })
    }

    /// Tasks admitted but not yet picked up by a worker.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Tasks past admission that have not reached a terminal outcome.
    pub fn inflight(&self) -> usize {
        self.global.load(Ordering::SeqCst)
    }

    /// Contention holds once admitted work exceeds the worker count;
    /// only then may the fair-share gate refuse.
    fn under_contention(&self) -> bool {
        self.global.load(Ordering::SeqCst) > self.workers.load(Ordering::SeqCst).max(1)
    }

    fn refuse(&self, reason: RefusalReason) -> RefusalReason {
        THROTTLED_REQUESTS_TOTAL.inc();
        reason
    }

    fn release_queued(&self) {
        decrement_floor(&self.queued);
        TASK_QUEUE_DEPTH.set(self.queued.load(Ordering::SeqCst) as i64);
    }

    fn reacquire_queued(&self) {
        // Requeue of already-admitted work bypasses the capacity check.
        self.queued.fetch_add(1, Ordering::SeqCst);
        TASK_QUEUE_DEPTH.set(self.queued.load(Ordering::SeqCst) as i64);
    }

    fn release_global(&self) {
        decrement_floor(&self.global);
        INFLIGHT_CHUNKS.set(self.global.load(Ordering::SeqCst) as i64);
    }

    fn release_per_upload(&self, upload_id: &str) {
        let mut counts = self.per_upload.lock().unwrap();
        match counts.get_mut(upload_id) {
            Some(n) if *n > 1 => *n -= 1,
            Some(_) => {
                counts.remove(upload_id);
            }
            None => {}
        }
    }

    fn publish_gauges(&self) {
        TASK_QUEUE_DEPTH.set(self.queued.load(Ordering::SeqCst) as i64);
        INFLIGHT_CHUNKS.set(self.global.load(Ordering::SeqCst) as i64);
    }
}

/// RAII handle for an admitted task. Travels inside the task; dropping it at
/// any terminal outcome releases the gates exactly once, in reverse order.
#[derive(Debug)]
pub struct AdmissionPermit {
    limiters: Arc<Limiters>,
    upload_id: String,
    started: AtomicBool,
}

impl AdmissionPermit {
    /// Called by the executor when a worker picks the task up: the queue
    /// slot is freed while the inflight gates stay held.
    pub fn mark_started(&self) {
        if !self.started.swap(true, Ordering::SeqCst) {
            self.limiters.release_queued();
        }
    }

    /// Called when a transiently-failed task goes back on the queue.
    pub fn requeue(&self) {
        if self.started.swap(false, Ordering::SeqCst) {
            self.limiters.reacquire_queued();
        }
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.limiters.release_per_upload(&self.upload_id);
        self.limiters.release_global();
        if !self.started.load(Ordering::SeqCst) {
            self.limiters.release_queued();
        }
        self.limiters.publish_gauges();
    }
}

fn try_increment(counter: &AtomicUsize, cap: usize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
            if n < cap {
                Some(n + 1)
            } else {
                None
            }
        })
        .is_ok()
}

fn decrement_floor(counter: &AtomicUsize) {
    let _ = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiters(queue: usize, global: usize, per_upload: usize, fair: usize, workers: usize) -> Arc<Limiters> {
        Arc::new(Limiters::new(
            queue,
            global,
            per_upload,
            fair,
            Arc::new(AtomicUsize::new(workers)),
        ))
    }

    #[test]
    fn global_cap_refuses_and_releases_queue_slot() {
        let l = limiters(10, 2, 10, 0, 4);
        let _a = l.acquire("u1").unwrap();
        let _b = l.acquire("u2").unwrap();
        assert_eq!(l.acquire("u3").unwrap_err(), RefusalReason::GlobalFull);
        // The refused request must not leak its queue slot.
        assert_eq!(l.queued(), 2);
    }

    #[test]
    fn queue_cap_refuses_first() {
        let l = limiters(1, 10, 10, 0, 4);
        let _a = l.acquire("u1").unwrap();
        assert_eq!(l.acquire("u2").unwrap_err(), RefusalReason::QueueFull);
    }

    #[test]
    fn per_upload_cap_is_per_upload() {
        let l = limiters(10, 10, 1, 0, 4);
        let _a = l.acquire("u1").unwrap();
        assert_eq!(l.acquire("u1").unwrap_err(), RefusalReason::PerUploadFull);
        assert!(l.acquire("u2").is_ok());
    }

    #[test]
    fn fair_share_only_applies_under_contention() {
        let l = limiters(64, 64, 10, 1, 2);
        // Two tasks: inflight == workers, still headroom.
        let _a = l.acquire("u1").unwrap();
        let _b = l.acquire("u1").unwrap();
        // Third pushes inflight past the worker count: contention, and u1
        // already holds more than its fair share.
        assert_eq!(l.acquire("u1").unwrap_err(), RefusalReason::FairShareFull);
        // A different upload is still admitted.
        assert!(l.acquire("u2").is_ok());
    }

    #[test]
    fn drop_releases_everything_exactly_once() {
        let l = limiters(10, 10, 10, 0, 4);
        let permit = l.acquire("u1").unwrap();
        assert_eq!(l.inflight(), 1);
        drop(permit);
        assert_eq!(l.inflight(), 0);
        assert_eq!(l.queued(), 0);
        assert!(l.per_upload.lock().unwrap().is_empty());
    }

    #[test]
    fn mark_started_frees_queue_slot_but_not_inflight() {
        let l = limiters(10, 10, 10, 0, 4);
        let permit = l.acquire("u1").unwrap();
        permit.mark_started();
        assert_eq!(l.queued(), 0);
        assert_eq!(l.inflight(), 1);
        drop(permit);
        assert_eq!(l.inflight(), 0);
        assert_eq!(l.queued(), 0);
    }

    #[test]
    fn requeue_restores_queue_accounting() {
        let l = limiters(10, 10, 10, 0, 4);
        let permit = l.acquire("u1").unwrap();
        permit.mark_started();
        permit.requeue();
        assert_eq!(l.queued(), 1);
        permit.mark_started();
        drop(permit);
        assert_eq!(l.queued(), 0);
        assert_eq!(l.inflight(), 0);
    }

    #[test]
    fn counters_never_go_negative_under_churn() {
        let l = limiters(8, 8, 8, 0, 4);
        for round in 0..100 {
            let mut permits = Vec::new();
            for i in 0..8 {
                permits.push(l.acquire(&format!("u{}", i % 3)).unwrap());
            }
            assert!(l.acquire("extra").is_err());
            if round % 2 == 0 {
                for p in &permits {
                    p.mark_started();
                }
            }
            drop(permits);
            assert_eq!(l.inflight(), 0);
            assert_eq!(l.queued(), 0);
        }
    }
}
