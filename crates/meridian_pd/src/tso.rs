//! Timestamp oracle: monotonic (physical, logical) timestamps bound to
//! leadership.
//!
//! A timestamp is `(physical_ms << 18) | logical`. The allocator persists an
//! upper bound through the MetaStore that always leads wall-clock use, so a
//! new leader (or a restart after a clock jump backwards) can only continue
//! forward. Followers fail fast; they never wait out a sync.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use meridian_meta::{Election, MetaStore};
use tokio::sync::Mutex;

use crate::config::TsoConfig;
use crate::error::{Error, Result};

pub const LOGICAL_BITS: u32 = 18;
pub const MAX_LOGICAL: u64 = 1 << LOGICAL_BITS;

/// The reserved dc-location name of the global allocator.
pub const GLOBAL_DC_LOCATION: &str = "global";

const SYNC_MAX_RETRY: usize = 10;
const SYNC_RETRY_WAIT: Duration = Duration::from_millis(50);

pub fn compose(physical_ms: u64, logical: u64) -> u64 {
    (physical_ms << LOGICAL_BITS) | logical
}

pub fn decompose(ts: u64) -> (u64, u64) {
    (ts >> LOGICAL_BITS, ts & (MAX_LOGICAL - 1))
}

/// One allocated timestamp range; the client fans `count` values out from
/// `(physical, logical)` upward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TsoResponse {
    pub physical_ms: u64,
    pub logical: u64,
    pub count: u32,
}

impl TsoResponse {
    pub fn first(&self) -> u64 {
        compose(self.physical_ms, self.logical)
    }

    pub fn last(&self) -> u64 {
        compose(self.physical_ms, self.logical + self.count as u64 - 1)
    }
}

/// Test-only injection seams; every hook defaults to off and the allocator
/// never sets one itself.
#[derive(Debug, Default)]
pub struct TsoHooks {
    /// Slow down the post-election sync, as a laggy MetaStore would.
    pub delay_sync_timestamp: AtomicBool,
    /// Pretend the wall clock fell an hour behind.
    pub system_time_slow: AtomicBool,
}

struct TsoState {
    physical_ms: u64,
    logical: u64,
    /// Persisted upper bound (ms); issuing may never cross it un-persisted.
    max_persisted_ms: u64,
    /// Election term this state was synced under; a new term must re-sync.
    synced_term: u64,
}

pub struct TsoAllocator {
    dc_location: String,
    store: Arc<dyn MetaStore>,
    election: Arc<dyn Election>,
    key: String,
    cfg: TsoConfig,
    state: Mutex<TsoState>,
    pub hooks: Arc<TsoHooks>,
}

impl TsoAllocator {
    pub fn new(
        dc_location: impl Into<String>,
        store: Arc<dyn MetaStore>,
        election: Arc<dyn Election>,
        key: String,
        cfg: TsoConfig,
    ) -> Self {
        Self {
            dc_location: dc_location.into(),
            store,
            election,
            key,
            cfg,
            state: Mutex::new(TsoState {
                physical_ms: 0,
                logical: 0,
                max_persisted_ms: 0,
                synced_term: 0,
            }),
            hooks: Arc::new(TsoHooks::default()),
        }
    }

    pub fn dc_location(&self) -> &str {
        &self.dc_location
    }

    fn wall_ms(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        if self.hooks.system_time_slow.load(Ordering::Relaxed) {
            now.saturating_sub(3600 * 1000)
        } else {
            now
        }
    }

    async fn load_persisted(&self) -> Result<u64> {
        let raw = self.store.get(&self.key).await?;
        Ok(raw
            .as_deref()
            .and_then(|b| std::str::from_utf8(b).ok())
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0))
    }

    async fn persist_max(&self, max_ms: u64) -> Result<()> {
        self.store
            .put(&self.key, max_ms.to_string().into_bytes())
            .await?;
        Ok(())
    }

    /// Post-election sync: continue strictly after whatever any previous
    /// leader may have issued, even when our clock is behind.
    async fn sync(&self) -> Result<()> {
        if !self.election.is_leader() {
            return Err(Error::TsoFromFollower);
        }
        let term = self.election.term();
        if self.hooks.delay_sync_timestamp.load(Ordering::Relaxed) {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        let persisted = self.load_persisted().await?;
        let now = self.wall_ms();
        let next = if now > persisted { now } else { persisted + 1 };
        let new_max = next + self.cfg.save_interval.as_millis() as u64;
        self.persist_max(new_max).await?;

        let mut state = self.state.lock().await;
        state.physical_ms = next;
        state.logical = 0;
        state.max_persisted_ms = new_max;
        state.synced_term = term;
        tracing::info!(
            dc = %self.dc_location,
            physical_ms = next,
            term,
            "timestamp oracle synced"
        );
        Ok(())
    }

    pub async fn is_synced(&self) -> bool {
        self.election.is_leader()
            && self.state.lock().await.synced_term == self.election.term()
    }

    /// Issue `count` timestamps.
    pub async fn get_ts(&self, count: u32) -> Result<TsoResponse> {
        self.get_ts_floored(count, 0).await
    }

    /// Issue `count` timestamps at a physical time of at least
    /// `floor_physical_ms`. The global allocator uses the floor to dominate
    /// every local allocator's output.
    pub async fn get_ts_floored(&self, count: u32, floor_physical_ms: u64) -> Result<TsoResponse> {
        if count == 0 {
            return Err(Error::GenerateTimestampFailed("zero tso count"));
        }
        if count as u64 >= MAX_LOGICAL {
            return Err(Error::TsoExhausted);
        }
        if !self.election.is_leader() {
            return Err(Error::TsoFromFollower);
        }

        for attempt in 0..SYNC_MAX_RETRY {
            if !self.election.is_leader() {
                return Err(Error::TsoFromFollower);
            }
            if self.is_synced().await {
                break;
            }
            if let Err(err) = self.sync().await {
                tracing::warn!(dc = %self.dc_location, error = %err, "timestamp sync failed");
            }
            if self.is_synced().await {
                break;
            }
            if attempt + 1 == SYNC_MAX_RETRY {
                return Err(Error::GenerateTimestampFailed("timestamp not synced"));
            }
            tokio::time::sleep(SYNC_RETRY_WAIT).await;
        }

        let mut state = self.state.lock().await;
        if state.synced_term != self.election.term() {
            return Err(Error::GenerateTimestampFailed("timestamp not synced"));
        }

        let now = self.wall_ms().max(floor_physical_ms);
        if now > state.physical_ms {
            state.physical_ms = now;
            state.logical = 0;
        }
        if state.logical + count as u64 >= MAX_LOGICAL {
            state.physical_ms += 1;
            state.logical = 0;
        }
        // Never hand out timestamps past the persisted bound; push the bound
        // ahead first so a crash cannot re-issue them.
        if state.physical_ms >= state.max_persisted_ms {
            let new_max =
                state.physical_ms.max(self.wall_ms()) + self.cfg.save_interval.as_millis() as u64;
            self.persist_max(new_max).await?;
            state.max_persisted_ms = new_max;
        }

        let response = TsoResponse {
            physical_ms: state.physical_ms,
            logical: state.logical,
            count,
        };
        state.logical += count as u64;
        Ok(response)
    }

    /// Admin reset. Accepts only strictly-forward targets within
    /// `max_reset_ts_gap` of the wall clock.
    pub async fn reset_ts(&self, ts: u64) -> Result<()> {
        if !self.election.is_leader() {
            return Err(Error::TsoFromFollower);
        }
        let (target_physical, target_logical) = decompose(ts);
        let gap_ms = self.cfg.max_reset_ts_gap.as_millis() as u64;

        let mut state = self.state.lock().await;
        let current = compose(state.physical_ms, state.logical);
        if ts <= current {
            return Err(Error::TsoDelta("too small"));
        }
        let now = self.wall_ms();
        if target_physical.abs_diff(now) > gap_ms {
            return Err(Error::TsoDelta("too large"));
        }
        let new_max = target_physical + self.cfg.save_interval.as_millis() as u64;
        self.persist_max(new_max).await?;
        state.physical_ms = target_physical;
        state.logical = target_logical;
        state.max_persisted_ms = new_max;
        state.synced_term = self.election.term();
        tracing::info!(dc = %self.dc_location, physical_ms = target_physical, "timestamp reset");
        Ok(())
    }

    /// Current high-water mark without allocating.
    pub async fn current(&self) -> u64 {
        let state = self.state.lock().await;
        compose(state.physical_ms, state.logical)
    }

    /// Raise this allocator's physical time to at least `physical_ms`
    /// (global/local coupling).
    pub async fn advance_to(&self, physical_ms: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        if physical_ms <= state.physical_ms {
            return Ok(());
        }
        state.physical_ms = physical_ms;
        state.logical = 0;
        if state.physical_ms >= state.max_persisted_ms {
            let new_max = state.physical_ms + self.cfg.save_interval.as_millis() as u64;
            self.persist_max(new_max).await?;
            state.max_persisted_ms = new_max;
        }
        Ok(())
    }

    /// Background tick: keep physical tracking the wall clock and the
    /// persisted bound comfortably ahead.
    pub async fn maintain(&self) {
        if !self.is_synced().await {
            return;
        }
        let mut state = self.state.lock().await;
        let now = self.wall_ms();
        if now > state.physical_ms {
            state.physical_ms = now;
            state.logical = 0;
        }
        let save_ms = self.cfg.save_interval.as_millis() as u64;
        if state.physical_ms + save_ms / 2 >= state.max_persisted_ms {
            let new_max = state.physical_ms.max(now) + save_ms;
            if let Err(err) = self.persist_max(new_max).await {
                tracing::warn!(dc = %self.dc_location, error = %err, "failed to persist tso bound");
                return;
            }
            state.max_persisted_ms = new_max;
        }
    }
}

/// Routes timestamp requests to the global allocator or a per-DC local one,
/// and keeps global timestamps ahead of every local allocator.
pub struct TsoAllocatorManager {
    global: Arc<TsoAllocator>,
    locals: RwLock<HashMap<String, Arc<TsoAllocator>>>,
}

impl TsoAllocatorManager {
    pub fn new(global: Arc<TsoAllocator>) -> Self {
        Self {
            global,
            locals: RwLock::new(HashMap::new()),
        }
    }

    pub fn global(&self) -> &Arc<TsoAllocator> {
        &self.global
    }

    pub fn register_local(&self, allocator: Arc<TsoAllocator>) {
        self.locals
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(allocator.dc_location().to_string(), allocator);
    }

    pub fn local(&self, dc_location: &str) -> Option<Arc<TsoAllocator>> {
        self.locals
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(dc_location)
            .cloned()
    }

    pub async fn get_ts(&self, dc_location: &str, count: u32) -> Result<TsoResponse> {
        if dc_location.is_empty() || dc_location == GLOBAL_DC_LOCATION {
            // A global timestamp must dominate anything a local allocator
            // has handed out.
            let locals: Vec<Arc<TsoAllocator>> = {
                let locals = self.locals.read().unwrap_or_else(|e| e.into_inner());
                locals.values().cloned().collect()
            };
            let mut max_local_physical = 0;
            for local in locals {
                let (physical, _) = decompose(local.current().await);
                max_local_physical = max_local_physical.max(physical);
            }
            return self
                .global
                .get_ts_floored(count, max_local_physical.saturating_add(1))
                .await;
        }
        match self.local(dc_location) {
            Some(local) => local.get_ts(count).await,
            None => Err(Error::DcLocationNotFound(dc_location.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_meta::{MemElection, MemStore};

    async fn leader_allocator(store: Arc<MemStore>) -> (Arc<TsoAllocator>, Arc<MemElection>) {
        let election = Arc::new(MemElection::new("pd-1"));
        election.campaign(Duration::from_secs(3)).await.unwrap();
        let allocator = Arc::new(TsoAllocator::new(
            GLOBAL_DC_LOCATION,
            store,
            election.clone() as Arc<dyn Election>,
            "/1/tso/global/timestamp".into(),
            TsoConfig::default(),
        ));
        (allocator, election)
    }

    #[tokio::test]
    async fn timestamps_strictly_increase() {
        let (allocator, _) = leader_allocator(Arc::new(MemStore::new())).await;
        let mut last = 0;
        for _ in 0..2000 {
            let resp = allocator.get_ts(1).await.unwrap();
            assert!(resp.first() > last);
            last = resp.last();
        }
    }

    #[tokio::test]
    async fn zero_count_is_rejected() {
        let (allocator, _) = leader_allocator(Arc::new(MemStore::new())).await;
        assert!(matches!(
            allocator.get_ts(0).await.unwrap_err(),
            Error::GenerateTimestampFailed(_)
        ));
    }

    #[tokio::test]
    async fn follower_fails_fast() {
        let store = Arc::new(MemStore::new());
        let election = Arc::new(MemElection::new("pd-2"));
        let allocator = TsoAllocator::new(
            GLOBAL_DC_LOCATION,
            store,
            election as Arc<dyn Election>,
            "/1/tso/global/timestamp".into(),
            TsoConfig::default(),
        );
        let started = std::time::Instant::now();
        assert!(matches!(
            allocator.get_ts(1).await.unwrap_err(),
            Error::TsoFromFollower
        ));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn logical_overflow_advances_physical() {
        let (allocator, _) = leader_allocator(Arc::new(MemStore::new())).await;
        let first = allocator.get_ts(1).await.unwrap();
        // Drain most of the logical space in one call.
        let big = allocator.get_ts((MAX_LOGICAL - 8) as u32).await.unwrap();
        assert!(big.first() > first.last());
        let after = allocator.get_ts(16).await.unwrap();
        assert!(after.physical_ms >= big.physical_ms);
        assert!(after.first() > big.last());
    }

    #[tokio::test]
    async fn new_leadership_continues_after_old() {
        let store = Arc::new(MemStore::new());
        let (allocator, election) = leader_allocator(store.clone()).await;
        let before = allocator.get_ts(1).await.unwrap().last();

        election.resign().await.unwrap();
        assert!(matches!(
            allocator.get_ts(1).await.unwrap_err(),
            Error::TsoFromFollower
        ));

        election.campaign(Duration::from_secs(3)).await.unwrap();
        let after = allocator.get_ts(1).await.unwrap().first();
        assert!(after > before);
    }

    #[tokio::test]
    async fn delayed_sync_still_serves_with_retry() {
        let store = Arc::new(MemStore::new());
        let (allocator, election) = leader_allocator(store.clone()).await;
        let before = allocator.get_ts(1).await.unwrap().last();

        allocator
            .hooks
            .delay_sync_timestamp
            .store(true, Ordering::Relaxed);
        election.resign().await.unwrap();
        election.campaign(Duration::from_secs(3)).await.unwrap();
        let after = allocator.get_ts(1).await.unwrap().first();
        assert!(after > before);
    }

    #[tokio::test]
    async fn slow_clock_cold_start_stays_monotonic() {
        let store = Arc::new(MemStore::new());
        {
            let (allocator, _) = leader_allocator(store.clone()).await;
            allocator.get_ts(1).await.unwrap();
        }
        // A future bound is already persisted; restart with a slow clock.
        let election = Arc::new(MemElection::new("pd-1"));
        election.campaign(Duration::from_secs(3)).await.unwrap();
        let allocator = TsoAllocator::new(
            GLOBAL_DC_LOCATION,
            store.clone(),
            election as Arc<dyn Election>,
            "/1/tso/global/timestamp".into(),
            TsoConfig::default(),
        );
        allocator
            .hooks
            .system_time_slow
            .store(true, Ordering::Relaxed);
        let persisted: u64 = String::from_utf8(store.get("/1/tso/global/timestamp").await.unwrap().unwrap())
            .unwrap()
            .parse()
            .unwrap();
        let resp = allocator.get_ts(1).await.unwrap();
        assert!(resp.physical_ms > persisted);
    }

    #[tokio::test]
    async fn reset_rejects_small_and_far_targets() {
        let (allocator, _) = leader_allocator(Arc::new(MemStore::new())).await;
        let current = allocator.get_ts(1).await.unwrap();

        let too_small = compose(current.physical_ms.saturating_sub(1000), 0);
        assert!(matches!(
            allocator.reset_ts(too_small).await.unwrap_err(),
            Error::TsoDelta("too small")
        ));

        let too_large = compose(current.physical_ms + 32 * 3600 * 1000, 0);
        assert!(matches!(
            allocator.reset_ts(too_large).await.unwrap_err(),
            Error::TsoDelta("too large")
        ));

        let fine = compose(current.physical_ms + 3600 * 1000, 0);
        allocator.reset_ts(fine).await.unwrap();
        let next = allocator.get_ts(1).await.unwrap();
        assert!(next.first() >= fine);
    }

    #[tokio::test]
    async fn concurrent_resets_keep_monotonicity() {
        let (allocator, _) = leader_allocator(Arc::new(MemStore::new())).await;
        let base = allocator.get_ts(1).await.unwrap().physical_ms;

        let mut handles = Vec::new();
        for worker in 0..2u64 {
            let allocator = Arc::clone(&allocator);
            handles.push(tokio::spawn(async move {
                let mut greatest = 0;
                for i in 0..100u64 {
                    let target = compose(base + 1000 + worker * 7 + i * 13, 0);
                    match allocator.reset_ts(target).await {
                        Ok(()) => greatest = greatest.max(target),
                        Err(Error::TsoDelta(_)) => {}
                        Err(err) => panic!("unexpected reset error: {err}"),
                    }
                    let ts = allocator.get_ts(1).await.unwrap();
                    assert!(ts.first() > 0);
                }
                greatest
            }));
        }
        let mut max_target = 0;
        for handle in handles {
            max_target = max_target.max(handle.await.unwrap());
        }
        let final_ts = allocator.get_ts(1).await.unwrap().first();
        assert!(final_ts >= max_target);
    }

    #[tokio::test]
    async fn global_dominates_local_allocators() {
        let store = Arc::new(MemStore::new());
        let election = Arc::new(MemElection::new("pd-1"));
        election.campaign(Duration::from_secs(3)).await.unwrap();
        let cfg = TsoConfig::default();
        let global = Arc::new(TsoAllocator::new(
            GLOBAL_DC_LOCATION,
            store.clone() as Arc<dyn MetaStore>,
            election.clone() as Arc<dyn Election>,
            "/1/tso/global/timestamp".into(),
            cfg.clone(),
        ));
        let local = Arc::new(TsoAllocator::new(
            "dc-1",
            store.clone() as Arc<dyn MetaStore>,
            election.clone() as Arc<dyn Election>,
            "/1/tso/dc-1/timestamp".into(),
            cfg,
        ));
        let manager = TsoAllocatorManager::new(global);
        manager.register_local(local.clone());

        // Push the local allocator into the future via reset.
        let ahead = compose(local.get_ts(1).await.unwrap().physical_ms + 60_000, 0);
        local.reset_ts(ahead).await.unwrap();
        let local_ts = manager.get_ts("dc-1", 1).await.unwrap();

        let global_ts = manager.get_ts(GLOBAL_DC_LOCATION, 1).await.unwrap();
        assert!(global_ts.first() > local_ts.last());

        assert!(matches!(
            manager.get_ts("dc-9", 1).await.unwrap_err(),
            Error::DcLocationNotFound(_)
        ));
    }
}
