//! In-process counters for control-plane observability.
//!
//! Deliberately lightweight: lock-free atomics updated on hot paths, read by
//! the status log loop and by tests. No external metrics service.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    pub store_heartbeats: AtomicU64,
    pub region_heartbeats: AtomicU64,
    pub region_heartbeats_rejected: AtomicU64,
    pub region_cache_updates: AtomicU64,
    pub region_kv_saves: AtomicU64,
    pub region_sync_dropped: AtomicU64,
    pub bucket_reports: AtomicU64,
    pub bucket_version_conflicts: AtomicU64,
    pub operators_created: AtomicU64,
    pub operators_finished: AtomicU64,
    pub operators_timeout: AtomicU64,
    pub operators_cancelled: AtomicU64,
    pub checker_operators: AtomicU64,
    pub scheduler_operators: AtomicU64,
    pub patrol_cycles: AtomicU64,
    /// Milliseconds of the most recent full patrol sweep.
    pub patrol_last_cycle_ms: AtomicU64,
    pub tso_requests: AtomicU64,
    pub tso_errors: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set(counter: &AtomicU64, v: u64) {
        counter.store(v, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Point-in-time snapshot for the status log.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            store_heartbeats: Self::get(&self.store_heartbeats),
            region_heartbeats: Self::get(&self.region_heartbeats),
            region_heartbeats_rejected: Self::get(&self.region_heartbeats_rejected),
            operators_created: Self::get(&self.operators_created),
            operators_finished: Self::get(&self.operators_finished),
            patrol_cycles: Self::get(&self.patrol_cycles),
            patrol_last_cycle_ms: Self::get(&self.patrol_last_cycle_ms),
            tso_requests: Self::get(&self.tso_requests),
            tso_errors: Self::get(&self.tso_errors),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MetricsSnapshot {
    pub store_heartbeats: u64,
    pub region_heartbeats: u64,
    pub region_heartbeats_rejected: u64,
    pub operators_created: u64,
    pub operators_finished: u64,
    pub patrol_cycles: u64,
    pub patrol_last_cycle_ms: u64,
    pub tso_requests: u64,
    pub tso_errors: u64,
}
