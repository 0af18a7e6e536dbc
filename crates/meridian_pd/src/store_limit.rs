//! Per-store admission control for snapshot-moving operator steps.
//!
//! Each store carries two token buckets, one per step class. Rates are
//! "regions per minute" scaled by a fixed influence so differently-sized
//! regions can charge proportionally; burst equals one minute of rate.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::store::{StoreId, StoreStats};

/// Token cost of one typical region move.
pub const REGION_INFLUENCE: f64 = 1000.0;
/// Cost charged for small regions (below the merge threshold).
pub const SMALL_REGION_INFLUENCE: f64 = 200.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreLimitType {
    AddPeer,
    RemovePeer,
}

pub const STORE_LIMIT_TYPES: [StoreLimitType; 2] =
    [StoreLimitType::AddPeer, StoreLimitType::RemovePeer];

#[derive(Debug)]
struct Bucket {
    /// Regions per minute; `None` = unlimited.
    rate_per_min: Option<f64>,
    tokens: f64,
    last_refill: Instant,
    /// Rate to fall back to once the TTL lapses.
    expires: Option<(Instant, f64)>,
}

impl Bucket {
    fn new(rate_per_min: f64) -> Self {
        Self {
            rate_per_min: Some(rate_per_min),
            tokens: rate_per_min * REGION_INFLUENCE,
            last_refill: Instant::now(),
            expires: None,
        }
    }

    fn capacity(rate: f64) -> f64 {
        rate * REGION_INFLUENCE
    }

    fn refill(&mut self) {
        if let Some((deadline, revert_rate)) = self.expires {
            if Instant::now() >= deadline {
                self.expires = None;
                self.set_rate(Some(revert_rate));
            }
        }
        let Some(rate) = self.rate_per_min else {
            return;
        };
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        self.last_refill = Instant::now();
        self.tokens = (self.tokens + elapsed / 60.0 * Self::capacity(rate)).min(Self::capacity(rate));
    }

    fn set_rate(&mut self, rate: Option<f64>) {
        self.rate_per_min = rate;
        if let Some(rate) = rate {
            self.tokens = self.tokens.min(Self::capacity(rate));
        }
        self.last_refill = Instant::now();
    }

    fn available(&mut self, cost: f64) -> bool {
        self.refill();
        self.rate_per_min.is_none() || self.tokens >= cost
    }

    fn take(&mut self, cost: f64) {
        self.refill();
        if self.rate_per_min.is_some() {
            self.tokens -= cost;
        }
    }
}

#[derive(Default)]
struct LimiterInner {
    buckets: HashMap<(StoreId, StoreLimitType), Bucket>,
    /// Rates stashed when a store went into removal, restored on `UpStore`.
    saved: HashMap<(StoreId, StoreLimitType), f64>,
}

/// Cluster-wide registry of per-store limits.
pub struct StoreLimiter {
    inner: RwLock<LimiterInner>,
    default_add_peer: f64,
    default_remove_peer: f64,
}

impl StoreLimiter {
    pub fn new(default_add_peer: f64, default_remove_peer: f64) -> Self {
        Self {
            inner: RwLock::new(LimiterInner::default()),
            default_add_peer,
            default_remove_peer,
        }
    }

    fn default_rate(&self, kind: StoreLimitType) -> f64 {
        match kind {
            StoreLimitType::AddPeer => self.default_add_peer,
            StoreLimitType::RemovePeer => self.default_remove_peer,
        }
    }

    fn with_bucket<R>(
        &self,
        store_id: StoreId,
        kind: StoreLimitType,
        f: impl FnOnce(&mut Bucket) -> R,
    ) -> R {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let bucket = inner
            .buckets
            .entry((store_id, kind))
            .or_insert_with(|| Bucket::new(self.default_rate(kind)));
        f(bucket)
    }

    pub fn available(&self, store_id: StoreId, kind: StoreLimitType, cost: f64) -> bool {
        self.with_bucket(store_id, kind, |b| b.available(cost))
    }

    pub fn take(&self, store_id: StoreId, kind: StoreLimitType, cost: f64) {
        self.with_bucket(store_id, kind, |b| b.take(cost))
    }

    /// Admin override, optionally reverting to the previous rate after `ttl`.
    pub fn set_limit(
        &self,
        store_id: StoreId,
        kind: StoreLimitType,
        rate_per_min: f64,
        ttl: Option<Duration>,
    ) {
        self.with_bucket(store_id, kind, |b| {
            let prior = b.rate_per_min.unwrap_or(0.0);
            b.set_rate(Some(rate_per_min));
            b.expires = ttl.map(|ttl| (Instant::now() + ttl, prior));
        })
    }

    pub fn rate(&self, store_id: StoreId, kind: StoreLimitType) -> Option<f64> {
        self.with_bucket(store_id, kind, |b| {
            b.refill();
            b.rate_per_min
        })
    }

    /// A store being drained gets unlimited remove-peer; the previous rate
    /// is stashed for `restore_removing_store`.
    pub fn set_removing_store(&self, store_id: StoreId) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let bucket = inner
            .buckets
            .entry((store_id, StoreLimitType::RemovePeer))
            .or_insert_with(|| Bucket::new(self.default_rate(StoreLimitType::RemovePeer)));
        let prior = bucket
            .rate_per_min
            .unwrap_or_else(|| self.default_rate(StoreLimitType::RemovePeer));
        bucket.set_rate(None);
        inner
            .saved
            .insert((store_id, StoreLimitType::RemovePeer), prior);
    }

    pub fn restore_removing_store(&self, store_id: StoreId) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(rate) = inner.saved.remove(&(store_id, StoreLimitType::RemovePeer)) {
            if let Some(bucket) = inner.buckets.get_mut(&(store_id, StoreLimitType::RemovePeer)) {
                bucket.set_rate(Some(rate));
            }
        }
    }

    pub fn remove_store(&self, store_id: StoreId) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.buckets.retain(|(id, _), _| *id != store_id);
        inner.saved.retain(|(id, _), _| *id != store_id);
    }
}

/// Influence charged for a region of `approximate_size` MiB.
pub fn region_influence(approximate_size: u64, small_region_threshold: u64) -> f64 {
    if approximate_size < small_region_threshold {
        SMALL_REGION_INFLUENCE
    } else {
        REGION_INFLUENCE
    }
}

/// Coarse cluster load classification driven by store heartbeats in "auto"
/// limit mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadScene {
    Idle,
    Low,
    Normal,
    High,
}

/// Tracks recent snapshot pressure to classify the cluster load scene.
#[derive(Default)]
pub struct SceneTracker {
    snapshots: RwLock<HashMap<StoreId, u64>>,
}

impl SceneTracker {
    pub fn collect(&self, stats: &StoreStats) {
        let pressure = stats.sending_snap_count as u64
            + stats.receiving_snap_count as u64
            + stats.applying_snap_count as u64;
        self.snapshots
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(stats.store_id, pressure);
    }

    pub fn scene(&self) -> LoadScene {
        let snapshots = self.snapshots.read().unwrap_or_else(|e| e.into_inner());
        let total: u64 = snapshots.values().sum();
        let stores = snapshots.len().max(1) as u64;
        match total / stores {
            0 => LoadScene::Idle,
            1..=4 => LoadScene::Low,
            5..=16 => LoadScene::Normal,
            _ => LoadScene::High,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_enforces_burst_and_refuses_when_empty() {
        let limiter = StoreLimiter::new(2.0, 2.0);
        // Burst = rate, i.e. two region moves.
        assert!(limiter.available(1, StoreLimitType::AddPeer, REGION_INFLUENCE));
        limiter.take(1, StoreLimitType::AddPeer, REGION_INFLUENCE);
        assert!(limiter.available(1, StoreLimitType::AddPeer, REGION_INFLUENCE));
        limiter.take(1, StoreLimitType::AddPeer, REGION_INFLUENCE);
        assert!(!limiter.available(1, StoreLimitType::AddPeer, REGION_INFLUENCE));
    }

    #[test]
    fn removing_store_is_unlimited_until_restored() {
        let limiter = StoreLimiter::new(1.0, 1.0);
        limiter.take(2, StoreLimitType::RemovePeer, REGION_INFLUENCE);
        assert!(!limiter.available(2, StoreLimitType::RemovePeer, REGION_INFLUENCE));

        limiter.set_removing_store(2);
        for _ in 0..10 {
            assert!(limiter.available(2, StoreLimitType::RemovePeer, REGION_INFLUENCE));
            limiter.take(2, StoreLimitType::RemovePeer, REGION_INFLUENCE);
        }

        limiter.restore_removing_store(2);
        assert_eq!(limiter.rate(2, StoreLimitType::RemovePeer), Some(1.0));
        assert!(!limiter.available(2, StoreLimitType::RemovePeer, REGION_INFLUENCE));
    }

    #[test]
    fn small_regions_charge_less() {
        assert_eq!(region_influence(10, 20), SMALL_REGION_INFLUENCE);
        assert_eq!(region_influence(100, 20), REGION_INFLUENCE);
    }
}
