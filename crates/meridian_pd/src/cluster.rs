//! In-memory cluster topology: the authoritative store and region indexes.
//!
//! This structure exclusively owns the store/region maps; every other
//! subsystem works on `Arc` snapshots obtained here. All mutation happens
//! under one write lock with memory-only critical sections, so readers
//! (samplers included) stay safe under concurrent heartbeats.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::{Arc, RwLock};

use rand::seq::SliceRandom;

use crate::error::{Error, Result};
use crate::region::{RegionId, RegionInfo};
use crate::store::{StoreId, StoreInfo};

/// Half-open key range `[start, end)`; empty end means unbounded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyRange {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
}

impl KeyRange {
    pub fn new(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    /// The full keyspace.
    pub fn everything() -> Self {
        Self::default()
    }

    fn contains_region(&self, region: &RegionInfo) -> bool {
        let start_ok = region.start_key.as_slice() >= self.start.as_slice();
        let end_ok = self.end.is_empty()
            || (!region.end_key.is_empty() && region.end_key.as_slice() <= self.end.as_slice());
        start_ok && end_ok
    }
}

#[derive(Default)]
struct Core {
    stores: HashMap<StoreId, Arc<StoreInfo>>,
    regions: HashMap<RegionId, Arc<RegionInfo>>,
    /// start_key -> region id, the authoritative range partition.
    tree: BTreeMap<Vec<u8>, RegionId>,
    /// Per-store role indexes.
    leaders: HashMap<StoreId, BTreeSet<RegionId>>,
    followers: HashMap<StoreId, BTreeSet<RegionId>>,
    learners: HashMap<StoreId, BTreeSet<RegionId>>,
    pending: HashMap<StoreId, BTreeSet<RegionId>>,
    /// All regions with any peer on the store.
    store_regions: HashMap<StoreId, BTreeSet<RegionId>>,
}

impl Core {
    fn index_region(&mut self, region: &Arc<RegionInfo>) {
        let id = region.id;
        let leader_store = region.leader_store_id();
        for peer in &region.peers {
            self.store_regions
                .entry(peer.store_id)
                .or_default()
                .insert(id);
            if Some(peer.store_id) == leader_store {
                self.leaders.entry(peer.store_id).or_default().insert(id);
            } else if peer.is_learner() {
                self.learners.entry(peer.store_id).or_default().insert(id);
            } else {
                self.followers.entry(peer.store_id).or_default().insert(id);
            }
        }
        for peer in &region.pending_peers {
            self.pending.entry(peer.store_id).or_default().insert(id);
        }
        self.tree.insert(region.start_key.clone(), id);
    }

    fn unindex_region(&mut self, region: &Arc<RegionInfo>) {
        let id = region.id;
        for index in [
            &mut self.leaders,
            &mut self.followers,
            &mut self.learners,
            &mut self.pending,
            &mut self.store_regions,
        ] {
            for set in index.values_mut() {
                set.remove(&id);
            }
        }
        if self.tree.get(&region.start_key) == Some(&id) {
            self.tree.remove(&region.start_key);
        }
    }

    /// Regions whose range intersects `[start, end)`.
    fn overlapping_ids(&self, start: &[u8], end: &[u8]) -> Vec<RegionId> {
        let mut out = Vec::new();
        // The region starting at or before `start` may reach into the range.
        if let Some((_, &id)) = self
            .tree
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(start)))
            .next_back()
        {
            if let Some(region) = self.regions.get(&id) {
                if region.overlaps(start, end) {
                    out.push(id);
                }
            }
        }
        for (key, &id) in self.tree.range::<[u8], _>((Bound::Excluded(start), Bound::Unbounded)) {
            if !end.is_empty() && key.as_slice() >= end {
                break;
            }
            out.push(id);
        }
        out
    }

    fn region_containing(&self, key: &[u8]) -> Option<Arc<RegionInfo>> {
        let (_, &id) = self
            .tree
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
            .next_back()?;
        let region = self.regions.get(&id)?;
        region.contains_key(key).then(|| Arc::clone(region))
    }

    fn pre_check(&self, region: &RegionInfo) -> Result<Option<Arc<RegionInfo>>> {
        if let Some(origin) = self.regions.get(&region.id) {
            if region.epoch.is_stale_against(&origin.epoch) {
                return Err(Error::EpochStale {
                    region_id: region.id,
                    msg: format!(
                        "reported {:?} older than cached {:?}",
                        region.epoch, origin.epoch
                    ),
                });
            }
            return Ok(Some(Arc::clone(origin)));
        }
        for id in self.overlapping_ids(&region.start_key, &region.end_key) {
            let overlap = &self.regions[&id];
            if region.epoch.is_stale_against(&overlap.epoch) {
                return Err(Error::RegionOverlap(overlap.id));
            }
        }
        Ok(None)
    }
}

/// Shared, lock-protected cluster topology.
#[derive(Default)]
pub struct BasicCluster {
    core: RwLock<Core>,
}

impl BasicCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Core> {
        self.core.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Core> {
        self.core.write().unwrap_or_else(|e| e.into_inner())
    }

    // Stores.

    pub fn put_store(&self, store: StoreInfo) {
        self.write().stores.insert(store.id(), Arc::new(store));
    }

    pub fn get_store(&self, store_id: StoreId) -> Option<Arc<StoreInfo>> {
        self.read().stores.get(&store_id).cloned()
    }

    pub fn delete_store(&self, store_id: StoreId) {
        self.write().stores.remove(&store_id);
    }

    pub fn get_stores(&self) -> Vec<Arc<StoreInfo>> {
        self.read().stores.values().cloned().collect()
    }

    pub fn store_count(&self) -> usize {
        self.read().stores.len()
    }

    // Regions.

    pub fn get_region(&self, region_id: RegionId) -> Option<Arc<RegionInfo>> {
        self.read().regions.get(&region_id).cloned()
    }

    pub fn get_regions(&self) -> Vec<Arc<RegionInfo>> {
        self.read().regions.values().cloned().collect()
    }

    pub fn region_count(&self) -> usize {
        self.read().regions.len()
    }

    /// Validate an incoming region against the cache without mutating it.
    /// Returns the cached origin when the id is known.
    pub fn pre_check_put_region(&self, region: &RegionInfo) -> Result<Option<Arc<RegionInfo>>> {
        self.read().pre_check(region)
    }

    /// Insert or replace a region after re-validating the epoch under the
    /// write lock. Evicts overlapping stale regions and returns them so the
    /// caller can clear derived statistics.
    pub fn check_and_put_region(&self, region: RegionInfo) -> Result<Vec<Arc<RegionInfo>>> {
        let mut core = self.write();
        core.pre_check(&region)?;
        Ok(Self::put_locked(&mut core, region))
    }

    /// Unconditional insert, still evicting overlaps. For bootstrap and
    /// tests.
    pub fn put_region(&self, region: RegionInfo) -> Vec<Arc<RegionInfo>> {
        let mut core = self.write();
        Self::put_locked(&mut core, region)
    }

    fn put_locked(core: &mut Core, region: RegionInfo) -> Vec<Arc<RegionInfo>> {
        let mut evicted = Vec::new();
        if let Some(old) = core.regions.get(&region.id).cloned() {
            core.unindex_region(&old);
        }
        for id in core.overlapping_ids(&region.start_key, &region.end_key) {
            if id == region.id {
                continue;
            }
            if let Some(old) = core.regions.remove(&id) {
                core.unindex_region(&old);
                evicted.push(old);
            }
        }
        let region = Arc::new(region);
        core.index_region(&region);
        core.regions.insert(region.id, region);
        evicted
    }

    /// Drop a region from the cache (admin surface).
    pub fn remove_region(&self, region_id: RegionId) -> Option<Arc<RegionInfo>> {
        let mut core = self.write();
        let region = core.regions.remove(&region_id)?;
        core.unindex_region(&region);
        Some(region)
    }

    pub fn clear_regions(&self) {
        let mut core = self.write();
        core.regions.clear();
        core.tree.clear();
        core.leaders.clear();
        core.followers.clear();
        core.learners.clear();
        core.pending.clear();
        core.store_regions.clear();
    }

    /// Swap a region's bucket stats iff the cached bucket version still is
    /// `expected_version`. The heartbeat path retries on contention.
    pub fn cas_buckets(
        &self,
        region_id: RegionId,
        expected_version: u64,
        buckets: crate::region::BucketStat,
    ) -> Result<bool> {
        let mut core = self.write();
        let region = core
            .regions
            .get(&region_id)
            .ok_or(Error::RegionNotFound(region_id))?;
        let current = region.buckets.as_ref().map(|b| b.version).unwrap_or(0);
        if current != expected_version {
            return Ok(false);
        }
        let updated = region.with_buckets(Some(Arc::new(buckets)));
        let updated = Arc::new(updated);
        core.regions.insert(region_id, updated);
        Ok(true)
    }

    // Lookups.

    pub fn get_region_by_key(&self, key: &[u8]) -> Option<Arc<RegionInfo>> {
        self.read().region_containing(key)
    }

    /// The region immediately before the one containing `key` in tree order.
    pub fn get_prev_region(&self, key: &[u8]) -> Option<Arc<RegionInfo>> {
        let core = self.read();
        let current = core.region_containing(key)?;
        let (_, &id) = core
            .tree
            .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(current.start_key.as_slice())))
            .next_back()?;
        core.regions.get(&id).cloned()
    }

    /// Tree neighbors of `region`; callers verify actual key adjacency.
    pub fn get_adjacent_regions(
        &self,
        region: &RegionInfo,
    ) -> (Option<Arc<RegionInfo>>, Option<Arc<RegionInfo>>) {
        let core = self.read();
        let prev = core
            .tree
            .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(region.start_key.as_slice())))
            .next_back()
            .and_then(|(_, &id)| core.regions.get(&id).cloned());
        let next = core
            .tree
            .range::<[u8], _>((Bound::Excluded(region.start_key.as_slice()), Bound::Unbounded))
            .next()
            .and_then(|(_, &id)| core.regions.get(&id).cloned());
        (prev, next)
    }

    /// Scan regions covering `[start, end)` in key order, starting with the
    /// region containing `start`. `limit == 0` means unlimited.
    pub fn scan_range(&self, start: &[u8], end: &[u8], limit: usize) -> Vec<Arc<RegionInfo>> {
        let core = self.read();
        let mut out = Vec::new();
        if let Some(region) = core.region_containing(start) {
            out.push(region);
        }
        let from = out
            .first()
            .map(|r| r.start_key.clone())
            .unwrap_or_else(|| start.to_vec());
        for (key, &id) in core.tree.range::<[u8], _>((Bound::Excluded(from.as_slice()), Bound::Unbounded)) {
            if limit != 0 && out.len() >= limit {
                break;
            }
            if !end.is_empty() && key.as_slice() >= end {
                break;
            }
            if key.as_slice() < start {
                continue;
            }
            if let Some(region) = core.regions.get(&id) {
                out.push(Arc::clone(region));
            }
        }
        if limit != 0 {
            out.truncate(limit);
        }
        out
    }

    // Random samplers. Never return a region missing from the map: the ids
    // come straight from the live indexes under the read lock.

    fn sample(
        &self,
        index: impl Fn(&Core) -> Option<BTreeSet<RegionId>>,
        ranges: &[KeyRange],
        n: usize,
    ) -> Vec<Arc<RegionInfo>> {
        let core = self.read();
        let ids = match index(&core) {
            Some(ids) => ids,
            None => return Vec::new(),
        };
        let candidates: Vec<Arc<RegionInfo>> = ids
            .iter()
            .filter_map(|id| core.regions.get(id).cloned())
            .filter(|r| {
                ranges.is_empty() || ranges.iter().any(|range| range.contains_region(r))
            })
            .collect();
        drop(core);
        let mut rng = rand::thread_rng();
        candidates
            .choose_multiple(&mut rng, n.max(1))
            .cloned()
            .collect()
    }

    pub fn rand_leader_regions(&self, store_id: StoreId, ranges: &[KeyRange]) -> Vec<Arc<RegionInfo>> {
        self.sample(|c| c.leaders.get(&store_id).cloned(), ranges, 4)
    }

    pub fn rand_follower_regions(
        &self,
        store_id: StoreId,
        ranges: &[KeyRange],
    ) -> Vec<Arc<RegionInfo>> {
        self.sample(|c| c.followers.get(&store_id).cloned(), ranges, 4)
    }

    pub fn rand_learner_regions(
        &self,
        store_id: StoreId,
        ranges: &[KeyRange],
    ) -> Vec<Arc<RegionInfo>> {
        self.sample(|c| c.learners.get(&store_id).cloned(), ranges, 4)
    }

    pub fn rand_pending_regions(
        &self,
        store_id: StoreId,
        ranges: &[KeyRange],
    ) -> Vec<Arc<RegionInfo>> {
        self.sample(|c| c.pending.get(&store_id).cloned(), ranges, 4)
    }

    // Per-store aggregates.

    pub fn store_leader_count(&self, store_id: StoreId) -> usize {
        self.read()
            .leaders
            .get(&store_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    pub fn store_region_count(&self, store_id: StoreId) -> usize {
        self.read()
            .store_regions
            .get(&store_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    pub fn store_pending_peer_count(&self, store_id: StoreId) -> usize {
        self.read()
            .pending
            .get(&store_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    pub fn store_leader_region_size(&self, store_id: StoreId) -> u64 {
        let core = self.read();
        core.leaders
            .get(&store_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| core.regions.get(id))
                    .map(|r| r.approximate_size)
                    .sum()
            })
            .unwrap_or(0)
    }

    pub fn store_region_size(&self, store_id: StoreId) -> u64 {
        let core = self.read();
        core.store_regions
            .get(&store_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| core.regions.get(id))
                    .map(|r| r.approximate_size)
                    .sum()
            })
            .unwrap_or(0)
    }

    pub fn get_store_regions(&self, store_id: StoreId) -> Vec<Arc<RegionInfo>> {
        let core = self.read();
        core.store_regions
            .get(&store_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| core.regions.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Refresh the derived counters cached on the store record.
    pub fn update_store_status(&self, store_id: StoreId) {
        let leader_count = self.store_leader_count(store_id);
        let region_count = self.store_region_count(store_id);
        let pending = self.store_pending_peer_count(store_id);
        let leader_size = self.store_leader_region_size(store_id);
        let region_size = self.store_region_size(store_id);
        let mut core = self.write();
        if let Some(store) = core.stores.get(&store_id) {
            let updated =
                store.with_counts(leader_count, region_count, pending, leader_size, region_size);
            core.stores.insert(store_id, Arc::new(updated));
        }
    }

    pub fn region_size_by_range(&self, start: &[u8], end: &[u8]) -> u64 {
        let core = self.read();
        core.overlapping_ids(start, end)
            .iter()
            .filter_map(|id| core.regions.get(id))
            .map(|r| r.approximate_size)
            .sum()
    }

    pub fn average_region_size(&self) -> u64 {
        let core = self.read();
        if core.regions.is_empty() {
            return 0;
        }
        let total: u64 = core.regions.values().map(|r| r.approximate_size).sum();
        total / core.regions.len() as u64
    }

    /// Gaps in range coverage, for diagnostics.
    pub fn range_holes(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        let core = self.read();
        let mut holes = Vec::new();
        let mut last_end: Vec<u8> = Vec::new();
        let mut saw_unbounded = false;
        for (_, id) in core.tree.iter() {
            let region = match core.regions.get(id) {
                Some(r) => r,
                None => continue,
            };
            if region.start_key != last_end {
                holes.push((last_end.clone(), region.start_key.clone()));
            }
            if region.end_key.is_empty() {
                saw_unbounded = true;
            }
            last_end = region.end_key.clone();
        }
        if !core.tree.is_empty() && !saw_unbounded && !last_end.is_empty() {
            holes.push((last_end, Vec::new()));
        }
        holes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::{Peer, RegionEpoch};
    use crate::store::StoreMeta;

    fn region(id: RegionId, start: &[u8], end: &[u8], stores: &[StoreId]) -> RegionInfo {
        let peers: Vec<Peer> = stores
            .iter()
            .enumerate()
            .map(|(i, &s)| Peer::voter(id * 100 + i as u64, s))
            .collect();
        let mut r = RegionInfo::new(id, start.to_vec(), end.to_vec(), peers.clone());
        r.leader = peers.first().copied();
        r.epoch = RegionEpoch::new(1, 1);
        r.approximate_size = 10;
        r
    }

    #[test]
    fn put_region_evicts_stale_overlaps() {
        let cluster = BasicCluster::new();
        cluster.put_region(region(1, b"", b"m", &[1, 2, 3]));
        cluster.put_region(region(2, b"m", b"", &[1, 2, 3]));
        assert_eq!(cluster.region_count(), 2);

        // A split bumps the version and replaces region 2's range.
        let mut left = region(3, b"m", b"t", &[1, 2, 3]);
        left.epoch = RegionEpoch::new(1, 2);
        let evicted = cluster.check_and_put_region(left).unwrap();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, 2);
        assert!(cluster.get_region(2).is_none());
    }

    #[test]
    fn stale_epoch_is_rejected_without_mutation() {
        let cluster = BasicCluster::new();
        let mut r = region(1, b"a", b"c", &[1]);
        r.epoch = RegionEpoch::new(100, 100);
        cluster.put_region(r);

        let mut stale = region(1, b"a", b"c", &[1]);
        stale.epoch = RegionEpoch::new(50, 50);
        let err = cluster.check_and_put_region(stale).unwrap_err();
        assert!(matches!(err, Error::EpochStale { region_id: 1, .. }));
        let cached = cluster.get_region(1).unwrap();
        assert_eq!(cached.epoch, RegionEpoch::new(100, 100));
    }

    #[test]
    fn overlapping_newcomer_with_lesser_epoch_is_rejected() {
        let cluster = BasicCluster::new();
        let mut r = region(1, b"a", b"z", &[1]);
        r.epoch = RegionEpoch::new(5, 5);
        cluster.put_region(r);

        let mut intruder = region(2, b"c", b"d", &[1]);
        intruder.epoch = RegionEpoch::new(1, 1);
        assert!(matches!(
            cluster.check_and_put_region(intruder).unwrap_err(),
            Error::RegionOverlap(1)
        ));
    }

    #[test]
    fn key_lookup_and_scan() {
        let cluster = BasicCluster::new();
        cluster.put_region(region(1, b"", b"g", &[1]));
        cluster.put_region(region(2, b"g", b"p", &[1]));
        cluster.put_region(region(3, b"p", b"", &[1]));

        assert_eq!(cluster.get_region_by_key(b"h").unwrap().id, 2);
        assert_eq!(cluster.get_region_by_key(b"").unwrap().id, 1);
        assert_eq!(cluster.get_prev_region(b"h").unwrap().id, 1);
        assert!(cluster.get_prev_region(b"a").is_none());

        let scanned = cluster.scan_range(b"h", b"", 0);
        assert_eq!(
            scanned.iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![2, 3]
        );
        let limited = cluster.scan_range(b"", b"", 2);
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn samplers_track_roles() {
        let cluster = BasicCluster::new();
        cluster.put_store(StoreInfo::new(StoreMeta::new(1, "s1")));
        cluster.put_store(StoreInfo::new(StoreMeta::new(2, "s2")));
        cluster.put_region(region(1, b"", b"m", &[1, 2]));
        cluster.put_region(region(2, b"m", b"", &[2, 1]));

        // Store 1 leads region 1, follows region 2.
        let leaders = cluster.rand_leader_regions(1, &[]);
        assert!(leaders.iter().all(|r| r.id == 1));
        let followers = cluster.rand_follower_regions(1, &[]);
        assert!(followers.iter().all(|r| r.id == 2));
        assert_eq!(cluster.store_leader_count(1), 1);
        assert_eq!(cluster.store_region_count(1), 2);

        // Range filter excludes everything outside [m, ∞).
        let ranged = cluster.rand_leader_regions(1, &[KeyRange::new(b"m".to_vec(), vec![])]);
        assert!(ranged.is_empty());
    }

    #[test]
    fn store_status_refresh_updates_counters() {
        let cluster = BasicCluster::new();
        cluster.put_store(StoreInfo::new(StoreMeta::new(1, "s1")));
        cluster.put_region(region(1, b"", b"m", &[1]));
        cluster.put_region(region(2, b"m", b"", &[1]));
        cluster.update_store_status(1);
        let store = cluster.get_store(1).unwrap();
        assert_eq!(store.leader_count, 2);
        assert_eq!(store.region_size, 20);
    }

    #[test]
    fn range_holes_reports_gaps() {
        let cluster = BasicCluster::new();
        cluster.put_region(region(1, b"", b"g", &[1]));
        cluster.put_region(region(3, b"p", b"", &[1]));
        let holes = cluster.range_holes();
        assert_eq!(holes, vec![(b"g".to_vec(), b"p".to_vec())]);
    }
}
