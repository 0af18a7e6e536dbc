//! Hot peer statistics: turns heartbeat flow samples into a smoothed,
//! time-windowed load model per (region, store, kind).
//!
//! Read flow arrives with store heartbeats (leader-side accounting), write
//! flow with region heartbeats. Updates for each kind are serialised through
//! a bounded single-consumer queue; producers are fire-and-forget and drop
//! on full rather than ever blocking a heartbeat.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::region::{RegionId, RegionInfo};
use crate::smoothing::{AvgOverTime, TimeMedian};
use crate::store::StoreId;
pub use crate::store::STORE_HEARTBEAT_INTERVAL;

pub const REGION_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// A peer is reported hot when any dimension clears
/// `max(min_threshold, topN_value * HOT_THRESHOLD_RATIO)`.
pub const HOT_THRESHOLD_RATIO: f64 = 0.8;
pub const TOP_N: usize = 60;

/// Scheduling treats a peer as hot from this degree on.
pub const HOT_REGION_MIN_DEGREE: i32 = 3;

pub const DIM_BYTES: usize = 0;
pub const DIM_KEYS: usize = 1;
pub const DIM_QUERY: usize = 2;
pub const DIM_LEN: usize = 3;

const MEDIAN_FILTER_SIZE: usize = 5;
const HULL_SIZE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RwKind {
    Read,
    Write,
}

impl RwKind {
    /// Cadence at which this kind's flow samples arrive.
    pub fn report_interval(&self) -> Duration {
        match self {
            RwKind::Read => STORE_HEARTBEAT_INTERVAL,
            RwKind::Write => REGION_HEARTBEAT_INTERVAL,
        }
    }

    /// Cool-down budget a hot peer gets before eviction. Read samples come
    /// once per store heartbeat, so the count scales by the interval ratio.
    pub fn default_anti_count(&self) -> i32 {
        match self {
            RwKind::Read => {
                2 * (REGION_HEARTBEAT_INTERVAL.as_secs() / STORE_HEARTBEAT_INTERVAL.as_secs())
                    as i32
            }
            RwKind::Write => 2,
        }
    }

    pub fn min_thresholds(&self) -> [f64; DIM_LEN] {
        match self {
            RwKind::Read => [8.0 * 1024.0, 128.0, 7.0],
            RwKind::Write => [1024.0, 32.0, 32.0],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotAction {
    Add,
    Update,
    Remove,
}

/// Rolling estimator for one load dimension: a per-report accumulator plus
/// the long-window smoothed rate.
#[derive(Debug, Clone)]
struct DimStat {
    last_average: AvgOverTime,
    rolling: TimeMedian,
}

impl DimStat {
    fn new(report_interval: Duration) -> Self {
        Self {
            last_average: AvgOverTime::new(report_interval),
            rolling: TimeMedian::new(report_interval, MEDIAN_FILTER_SIZE, HULL_SIZE),
        }
    }

    fn add(&mut self, delta: f64, interval: Duration) {
        self.last_average.add(delta, interval);
        self.rolling.add(delta, interval);
    }

    fn is_full(&self) -> bool {
        self.last_average.is_full()
    }

    fn last_average_hot(&self, threshold: f64) -> bool {
        self.last_average.get() >= threshold
    }

    fn clear_last_average(&mut self) {
        self.last_average.clear();
    }

    fn get(&self) -> f64 {
        self.rolling.get()
    }
}

/// One (region, store, kind) hot entry.
#[derive(Debug, Clone)]
pub struct HotPeerStat {
    pub region_id: RegionId,
    pub store_id: StoreId,
    pub kind: RwKind,
    /// Smoothed rates per dimension.
    pub loads: [f64; DIM_LEN],
    pub thresholds: [f64; DIM_LEN],
    pub hot_degree: i32,
    pub anti_count: i32,
    pub action: HotAction,
    pub is_leader: bool,
    interval_sum: Duration,
    rolling: Option<[DimStat; DIM_LEN]>,
    last_transfer_leader: Option<Instant>,
}

impl HotPeerStat {
    pub fn is_hot(&self) -> bool {
        self.hot_degree >= HOT_REGION_MIN_DEGREE
    }

    pub fn interval_sum(&self) -> Duration {
        self.interval_sum
    }

    /// Suppress read-hot reporting for `intervals` region heartbeats after
    /// a leader transfer, so scheduling does not chase the switch.
    pub fn is_need_cool_down_transfer_leader(&self, intervals: i32) -> bool {
        if self.hot_degree < intervals {
            return true;
        }
        match self.last_transfer_leader {
            None => false,
            Some(at) => {
                at.elapsed() < REGION_HEARTBEAT_INTERVAL * intervals as u32
            }
        }
    }

    fn inherit_degree(&mut self, old: &HotPeerStat) {
        self.hot_degree = old.hot_degree;
        self.anti_count = old.anti_count;
    }

    fn mark_hot(&mut self, old: &HotPeerStat) {
        self.hot_degree = old.hot_degree + 1;
        self.anti_count = self.kind.default_anti_count();
    }

    fn mark_cold(&mut self, old: &HotPeerStat) {
        self.hot_degree = old.hot_degree - 1;
        self.anti_count = old.anti_count - 1;
        if self.anti_count <= 0 {
            self.anti_count = 0;
            self.action = HotAction::Remove;
        }
    }

    fn refresh_loads(&mut self) {
        if let Some(rolling) = &self.rolling {
            for i in 0..DIM_LEN {
                self.loads[i] = rolling[i].get();
            }
            self.interval_sum = rolling[0].last_average.interval_sum();
        }
    }
}

/// Flow sample for one peer, deltas over `interval`.
#[derive(Debug, Clone)]
pub struct PeerLoad {
    pub region_id: RegionId,
    pub store_id: StoreId,
    pub deltas: [f64; DIM_LEN],
    pub interval: Duration,
}

/// Per-kind cache of hot peers. Not internally locked; the owning queue
/// consumer serialises updates, readers go through `HotCache`.
pub struct HotPeerCache {
    kind: RwKind,
    peers_of_store: HashMap<StoreId, HashMap<RegionId, HotPeerStat>>,
    stores_of_region: HashMap<RegionId, HashSet<StoreId>>,
}

impl HotPeerCache {
    pub fn new(kind: RwKind) -> Self {
        Self {
            kind,
            peers_of_store: HashMap::new(),
            stores_of_region: HashMap::new(),
        }
    }

    pub fn get(&self, region_id: RegionId, store_id: StoreId) -> Option<&HotPeerStat> {
        self.peers_of_store
            .get(&store_id)
            .and_then(|peers| peers.get(&region_id))
    }

    /// Per-store thresholds: `max(min, topN_value * ratio)` per dimension
    /// once the store tracks at least `TOP_N` peers.
    pub fn calc_hot_thresholds(&self, store_id: StoreId) -> [f64; DIM_LEN] {
        let mins = self.kind.min_thresholds();
        let peers = match self.peers_of_store.get(&store_id) {
            Some(peers) if peers.len() >= TOP_N => peers,
            _ => return mins,
        };
        let mut thresholds = mins;
        for dim in 0..DIM_LEN {
            let mut loads: Vec<f64> = peers.values().map(|p| p.loads[dim]).collect();
            loads.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
            let top_n_value = loads[TOP_N - 1];
            thresholds[dim] = (top_n_value * HOT_THRESHOLD_RATIO).max(mins[dim]);
        }
        thresholds
    }

    fn just_transfer_leader(&self, region: &RegionInfo) -> bool {
        let Some(stores) = self.stores_of_region.get(&region.id) else {
            return false;
        };
        for &store_id in stores {
            if let Some(old) = self.get(region.id, store_id) {
                if old.is_leader {
                    return Some(old.store_id) != region.leader_store_id();
                }
            }
        }
        false
    }

    /// Entries for peers the region no longer has, marked for removal.
    pub fn collect_expired_items(&self, region: &RegionInfo) -> Vec<HotPeerStat> {
        let Some(stores) = self.stores_of_region.get(&region.id) else {
            return Vec::new();
        };
        let mut expired = Vec::new();
        for &store_id in stores {
            if region.get_store_peer(store_id).is_none() {
                if let Some(old) = self.get(region.id, store_id) {
                    let mut item = old.clone();
                    item.action = HotAction::Remove;
                    expired.push(item);
                }
            }
        }
        expired
    }

    /// Evaluate one flow sample. Returns the updated stat to apply via
    /// [`HotPeerCache::update_stat`], or `None` when there is nothing to
    /// track.
    pub fn check_peer_flow(&self, load: &PeerLoad, region: &RegionInfo) -> Option<HotPeerStat> {
        let old = self.get(load.region_id, load.store_id);
        let thresholds = self.calc_hot_thresholds(load.store_id);
        let just_transfer_leader = self.just_transfer_leader(region);
        let mut new_item = HotPeerStat {
            region_id: load.region_id,
            store_id: load.store_id,
            kind: self.kind,
            loads: [0.0; DIM_LEN],
            thresholds,
            hot_degree: 0,
            anti_count: 0,
            action: HotAction::Update,
            is_leader: region.leader_store_id() == Some(load.store_id),
            interval_sum: Duration::ZERO,
            rolling: None,
            last_transfer_leader: None,
        };

        match old {
            None => self.update_new_peer(&mut new_item, load),
            Some(old) => {
                self.update_existing_peer(&mut new_item, old, load, just_transfer_leader);
                Some(new_item)
            }
        }
    }

    fn update_new_peer(&self, new_item: &mut HotPeerStat, load: &PeerLoad) -> Option<HotPeerStat> {
        if load.interval.is_zero() {
            return None;
        }
        let secs = load.interval.as_secs_f64();
        let is_hot = (0..DIM_LEN).any(|i| load.deltas[i] / secs >= new_item.thresholds[i]);
        if !is_hot {
            return None;
        }
        if load.interval >= self.kind.report_interval() {
            new_item.hot_degree = 1;
            new_item.anti_count = self.kind.default_anti_count();
        }
        new_item.action = HotAction::Add;
        let mut rolling: [DimStat; DIM_LEN] = std::array::from_fn(|_| DimStat::new(self.kind.report_interval()));
        for (i, dim) in rolling.iter_mut().enumerate() {
            dim.add(load.deltas[i], load.interval);
            if dim.is_full() {
                dim.clear_last_average();
            }
        }
        new_item.rolling = Some(rolling);
        new_item.refresh_loads();
        Some(new_item.clone())
    }

    fn update_existing_peer(
        &self,
        new_item: &mut HotPeerStat,
        old: &HotPeerStat,
        load: &PeerLoad,
        just_transfer_leader: bool,
    ) {
        new_item.rolling = old.rolling.clone();
        new_item.hot_degree = old.hot_degree;
        new_item.anti_count = old.anti_count;

        if just_transfer_leader {
            new_item.last_transfer_leader = Some(Instant::now());
            // Write flow moves with the leader; skip the first sample after
            // the switch so the new leader does not double-count it.
            if self.kind == RwKind::Write {
                new_item.refresh_loads();
                return;
            }
        } else {
            new_item.last_transfer_leader = old.last_transfer_leader;
        }

        if let Some(rolling) = &mut new_item.rolling {
            for (i, dim) in rolling.iter_mut().enumerate() {
                dim.add(load.deltas[i], load.interval);
            }
        }

        let is_full = new_item
            .rolling
            .as_ref()
            .map(|r| r[0].is_full())
            .unwrap_or(false);
        if !is_full {
            // Still warming up within the report window; carry the verdict.
            new_item.inherit_degree(old);
        } else {
            let hot = new_item
                .rolling
                .as_ref()
                .map(|r| {
                    (0..DIM_LEN).any(|i| r[i].last_average_hot(new_item.thresholds[i]))
                })
                .unwrap_or(false);
            if hot {
                new_item.mark_hot(old);
            } else {
                new_item.mark_cold(old);
            }
            new_item.refresh_loads();
            if let Some(rolling) = &mut new_item.rolling {
                for dim in rolling.iter_mut() {
                    dim.clear_last_average();
                }
            }
            return;
        }
        new_item.refresh_loads();
    }

    /// Zero-flow updates for tracked peers of `store_id` that the heartbeat
    /// did not mention; keeps their cool-down ticking without needing the
    /// region snapshot.
    pub fn collect_unreported_peers(
        &self,
        store_id: StoreId,
        reported: &HashSet<RegionId>,
        interval: Duration,
    ) -> Vec<HotPeerStat> {
        let Some(peers) = self.peers_of_store.get(&store_id) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for (&region_id, old) in peers {
            if reported.contains(&region_id) {
                continue;
            }
            let mut new_item = HotPeerStat {
                region_id,
                store_id,
                kind: self.kind,
                loads: [0.0; DIM_LEN],
                thresholds: self.calc_hot_thresholds(store_id),
                hot_degree: 0,
                anti_count: 0,
                action: HotAction::Update,
                is_leader: old.is_leader,
                interval_sum: Duration::ZERO,
                rolling: None,
                last_transfer_leader: None,
            };
            let load = PeerLoad {
                region_id,
                store_id,
                deltas: [0.0; DIM_LEN],
                interval,
            };
            self.update_existing_peer(&mut new_item, old, &load, false);
            out.push(new_item);
        }
        out
    }

    /// Apply a stat produced by the check functions.
    pub fn update_stat(&mut self, item: HotPeerStat) {
        match item.action {
            HotAction::Remove => {
                if let Some(peers) = self.peers_of_store.get_mut(&item.store_id) {
                    peers.remove(&item.region_id);
                }
                if let Some(stores) = self.stores_of_region.get_mut(&item.region_id) {
                    stores.remove(&item.store_id);
                    if stores.is_empty() {
                        self.stores_of_region.remove(&item.region_id);
                    }
                }
            }
            HotAction::Add | HotAction::Update => {
                self.stores_of_region
                    .entry(item.region_id)
                    .or_default()
                    .insert(item.store_id);
                self.peers_of_store
                    .entry(item.store_id)
                    .or_default()
                    .insert(item.region_id, item);
            }
        }
    }

    /// Hot peers per store at or above `min_degree`.
    pub fn region_stats(&self, min_degree: i32) -> HashMap<StoreId, Vec<HotPeerStat>> {
        let mut out = HashMap::new();
        for (&store_id, peers) in &self.peers_of_store {
            let hot: Vec<HotPeerStat> = peers
                .values()
                .filter(|p| p.hot_degree >= min_degree)
                .cloned()
                .collect();
            if !hot.is_empty() {
                out.insert(store_id, hot);
            }
        }
        out
    }

    pub fn is_region_hot(&self, region_id: RegionId, min_degree: i32) -> bool {
        let Some(stores) = self.stores_of_region.get(&region_id) else {
            return false;
        };
        stores.iter().any(|&store_id| {
            self.get(region_id, store_id)
                .map(|p| p.hot_degree >= min_degree)
                .unwrap_or(false)
        })
    }

    pub fn tracked_stores_of_region(&self, region_id: RegionId) -> usize {
        self.stores_of_region
            .get(&region_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

/// Work items for the per-kind consumer.
enum HotTask {
    CheckPeer {
        load: PeerLoad,
        region: Arc<RegionInfo>,
    },
    CollectExpired {
        region: Arc<RegionInfo>,
    },
    CollectUnreported {
        store_id: StoreId,
        reported: HashSet<RegionId>,
        interval: Duration,
    },
}

const HOT_QUEUE_CAPACITY: usize = 1024;

/// Read+write hot caches behind their single-consumer queues.
pub struct HotCache {
    read: Arc<RwLock<HotPeerCache>>,
    write: Arc<RwLock<HotPeerCache>>,
    read_tx: mpsc::Sender<HotTask>,
    write_tx: mpsc::Sender<HotTask>,
}

impl HotCache {
    /// Spawns the two consumer tasks on the current tokio runtime.
    pub fn new() -> Self {
        let read = Arc::new(RwLock::new(HotPeerCache::new(RwKind::Read)));
        let write = Arc::new(RwLock::new(HotPeerCache::new(RwKind::Write)));
        let read_tx = Self::spawn_consumer(Arc::clone(&read));
        let write_tx = Self::spawn_consumer(Arc::clone(&write));
        Self {
            read,
            write,
            read_tx,
            write_tx,
        }
    }

    fn spawn_consumer(cache: Arc<RwLock<HotPeerCache>>) -> mpsc::Sender<HotTask> {
        let (tx, mut rx) = mpsc::channel::<HotTask>(HOT_QUEUE_CAPACITY);
        tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                let mut cache = cache.write().unwrap_or_else(|e| e.into_inner());
                match task {
                    HotTask::CheckPeer { load, region } => {
                        if let Some(item) = cache.check_peer_flow(&load, &region) {
                            cache.update_stat(item);
                        }
                    }
                    HotTask::CollectExpired { region } => {
                        for item in cache.collect_expired_items(&region) {
                            cache.update_stat(item);
                        }
                    }
                    HotTask::CollectUnreported {
                        store_id,
                        reported,
                        interval,
                    } => {
                        for item in cache.collect_unreported_peers(store_id, &reported, interval) {
                            cache.update_stat(item);
                        }
                    }
                }
            }
        });
        tx
    }

    fn sender(&self, kind: RwKind) -> &mpsc::Sender<HotTask> {
        match kind {
            RwKind::Read => &self.read_tx,
            RwKind::Write => &self.write_tx,
        }
    }

    /// Fire-and-forget; drops the sample when the queue is full.
    pub fn check_async(&self, kind: RwKind, load: PeerLoad, region: Arc<RegionInfo>) {
        if self
            .sender(kind)
            .try_send(HotTask::CheckPeer { load, region })
            .is_err()
        {
            tracing::debug!(?kind, "hot cache queue full, dropping flow sample");
        }
    }

    pub fn collect_expired_async(&self, kind: RwKind, region: Arc<RegionInfo>) {
        let _ = self.sender(kind).try_send(HotTask::CollectExpired { region });
    }

    pub fn collect_unreported_async(
        &self,
        store_id: StoreId,
        reported: HashSet<RegionId>,
        interval: Duration,
    ) {
        let _ = self.read_tx.try_send(HotTask::CollectUnreported {
            store_id,
            reported,
            interval,
        });
    }

    fn cache(&self, kind: RwKind) -> &Arc<RwLock<HotPeerCache>> {
        match kind {
            RwKind::Read => &self.read,
            RwKind::Write => &self.write,
        }
    }

    pub fn region_stats(&self, kind: RwKind, min_degree: i32) -> HashMap<StoreId, Vec<HotPeerStat>> {
        self.cache(kind)
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .region_stats(min_degree)
    }

    pub fn is_region_hot(&self, region_id: RegionId, min_degree: i32) -> bool {
        [RwKind::Read, RwKind::Write].iter().any(|&kind| {
            self.cache(kind)
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .is_region_hot(region_id, min_degree)
        })
    }

    pub fn get_stat(&self, kind: RwKind, region_id: RegionId, store_id: StoreId) -> Option<HotPeerStat> {
        self.cache(kind)
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(region_id, store_id)
            .cloned()
    }

    /// Direct synchronous application, for deterministic tests.
    pub fn apply_sync(&self, kind: RwKind, load: PeerLoad, region: &RegionInfo) {
        let mut cache = self
            .cache(kind)
            .write()
            .unwrap_or_else(|e| e.into_inner());
        for item in cache.collect_expired_items(region) {
            cache.update_stat(item);
        }
        if let Some(item) = cache.check_peer_flow(&load, region) {
            cache.update_stat(item);
        }
    }
}

impl Default for HotCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::Peer;

    fn region(id: RegionId, stores: &[StoreId], leader: StoreId) -> RegionInfo {
        let peers: Vec<Peer> = stores
            .iter()
            .map(|&s| Peer::voter(id * 100 + s, s))
            .collect();
        let mut r = RegionInfo::new(id, vec![], vec![], peers.clone());
        r.leader = peers.iter().find(|p| p.store_id == leader).copied();
        r
    }

    fn check_and_update(cache: &mut HotPeerCache, load: PeerLoad, region: &RegionInfo) -> Option<HotPeerStat> {
        let item = cache.check_peer_flow(&load, region)?;
        cache.update_stat(item.clone());
        Some(item)
    }

    fn hot_load(region_id: RegionId, store_id: StoreId, interval: Duration) -> PeerLoad {
        let secs = interval.as_secs_f64();
        PeerLoad {
            region_id,
            store_id,
            // Far above every write minimum.
            deltas: [1_000_000.0 * secs, 10_000.0 * secs, 1_000.0 * secs],
            interval,
        }
    }

    #[test]
    fn zero_interval_new_peer_is_dropped() {
        let cache = HotPeerCache::new(RwKind::Write);
        let r = region(1, &[1, 2, 3], 1);
        let load = PeerLoad {
            region_id: 1,
            store_id: 1,
            deltas: [1000.0, 10.0, 10.0],
            interval: Duration::ZERO,
        };
        assert!(cache.check_peer_flow(&load, &r).is_none());
    }

    #[test]
    fn cold_new_peer_is_not_tracked() {
        let cache = HotPeerCache::new(RwKind::Write);
        let r = region(1, &[1, 2, 3], 1);
        let load = PeerLoad {
            region_id: 1,
            store_id: 1,
            deltas: [0.0, 0.0, 0.0],
            interval: Duration::from_secs(60),
        };
        assert!(cache.check_peer_flow(&load, &r).is_none());
    }

    #[test]
    fn hot_peer_gains_degree_per_full_interval() {
        let mut cache = HotPeerCache::new(RwKind::Write);
        let r = region(1, &[1, 2, 3], 1);

        let first = check_and_update(&mut cache, hot_load(1, 1, Duration::from_secs(60)), &r)
            .expect("hot peer tracked");
        assert_eq!(first.action, HotAction::Add);
        assert_eq!(first.hot_degree, 1);
        assert_eq!(first.anti_count, RwKind::Write.default_anti_count());

        let second = check_and_update(&mut cache, hot_load(1, 1, Duration::from_secs(60)), &r)
            .expect("update");
        assert_eq!(second.hot_degree, 2);
    }

    #[test]
    fn warming_peer_inherits_degree_until_window_full() {
        let mut cache = HotPeerCache::new(RwKind::Write);
        let r = region(1, &[1, 2, 3], 1);

        check_and_update(&mut cache, hot_load(1, 1, Duration::from_secs(60)), &r).unwrap();
        // Partial window: degree must not move.
        let partial = check_and_update(&mut cache, hot_load(1, 1, Duration::from_secs(20)), &r)
            .expect("tracked");
        assert_eq!(partial.hot_degree, 1);
        // Window completes: degree advances.
        let full = check_and_update(&mut cache, hot_load(1, 1, Duration::from_secs(40)), &r)
            .expect("tracked");
        assert_eq!(full.hot_degree, 2);
    }

    #[test]
    fn cold_peer_decays_and_is_removed() {
        let mut cache = HotPeerCache::new(RwKind::Write);
        let r = region(1, &[1, 2, 3], 1);
        check_and_update(&mut cache, hot_load(1, 1, Duration::from_secs(60)), &r).unwrap();

        let cold = PeerLoad {
            region_id: 1,
            store_id: 1,
            deltas: [0.0, 0.0, 0.0],
            interval: Duration::from_secs(60),
        };
        let mut last = None;
        for _ in 0..RwKind::Write.default_anti_count() {
            last = check_and_update(&mut cache, cold.clone(), &r);
        }
        let last = last.expect("still reported");
        assert_eq!(last.action, HotAction::Remove);
        assert_eq!(last.anti_count, 0);
        assert!(last.hot_degree < 1);
        assert!(cache.get(1, 1).is_none());
        assert_eq!(cache.tracked_stores_of_region(1), 0);
    }

    #[test]
    fn expired_items_cover_removed_peers() {
        let mut cache = HotPeerCache::new(RwKind::Write);
        let r = region(1, &[1, 2, 3], 1);
        for store in [1u64, 2, 3] {
            check_and_update(&mut cache, hot_load(1, store, Duration::from_secs(60)), &r).unwrap();
        }
        // Peer moves off store 3.
        let moved = region(1, &[1, 2, 4], 1);
        let expired = cache.collect_expired_items(&moved);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].store_id, 3);
        assert_eq!(expired[0].action, HotAction::Remove);
    }

    #[test]
    fn thresholds_stay_at_min_below_top_n() {
        let mut cache = HotPeerCache::new(RwKind::Write);
        let mins = RwKind::Write.min_thresholds();
        assert_eq!(cache.calc_hot_thresholds(1), mins);

        // Track more than TOP_N hot peers on one store.
        for id in 1..=(TOP_N as u64 + 10) {
            let r = region(id, &[1], 1);
            check_and_update(&mut cache, hot_load(id, 1, Duration::from_secs(60)), &r);
        }
        let thresholds = cache.calc_hot_thresholds(1);
        assert!(thresholds[DIM_BYTES] > mins[DIM_BYTES]);
    }

    #[test]
    fn transfer_leader_triggers_cool_down() {
        let mut cache = HotPeerCache::new(RwKind::Read);
        let r = region(1, &[1, 2, 3], 1);
        // Make the leader peer decidedly hot over several full windows.
        for _ in 0..4 {
            for store in [1u64, 2, 3] {
                check_and_update(&mut cache, hot_load(1, store, Duration::from_secs(10)), &r);
            }
        }
        let before = cache.get(1, 1).unwrap();
        assert!(!before.is_need_cool_down_transfer_leader(3));

        // The new leader's sample lands first, while the old leader's entry
        // still carries the stale leader flag.
        let moved = region(1, &[1, 2, 3], 2);
        for store in [2u64, 1, 3] {
            check_and_update(&mut cache, hot_load(1, store, Duration::from_secs(10)), &moved);
        }
        let after = cache.get(1, 2).unwrap();
        assert!(after.is_need_cool_down_transfer_leader(3));
    }
}
