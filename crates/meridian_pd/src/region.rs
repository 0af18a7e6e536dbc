//! Region (key-range shard) model. Key ranges are lexicographic and
//! end-exclusive; an empty end key means "to the end of the keyspace".

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::store::{StoreId, TimeInterval};

pub type RegionId = u64;
pub type PeerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRole {
    Voter,
    Learner,
    /// Joint-consensus roles; a region carrying either is mid ChangePeerV2.
    IncomingVoter,
    DemotingVoter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    pub store_id: StoreId,
    pub role: PeerRole,
}

impl Peer {
    pub fn voter(id: PeerId, store_id: StoreId) -> Self {
        Self {
            id,
            store_id,
            role: PeerRole::Voter,
        }
    }

    pub fn learner(id: PeerId, store_id: StoreId) -> Self {
        Self {
            id,
            store_id,
            role: PeerRole::Learner,
        }
    }

    pub fn is_voter(&self) -> bool {
        matches!(self.role, PeerRole::Voter | PeerRole::IncomingVoter)
    }

    pub fn is_learner(&self) -> bool {
        self.role == PeerRole::Learner
    }

    pub fn in_joint_state(&self) -> bool {
        matches!(self.role, PeerRole::IncomingVoter | PeerRole::DemotingVoter)
    }
}

/// `conf_ver` increments on membership change, `version` on split/merge.
/// Ordered lexicographically; a heartbeat may never regress either field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionEpoch {
    pub conf_ver: u64,
    pub version: u64,
}

impl RegionEpoch {
    pub fn new(conf_ver: u64, version: u64) -> Self {
        Self { conf_ver, version }
    }

    /// True when `self` is older than `other` in either dimension.
    pub fn is_stale_against(&self, other: &RegionEpoch) -> bool {
        self.version < other.version || self.conf_ver < other.conf_ver
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownPeer {
    pub peer: Peer,
    pub down_seconds: u64,
}

/// Sub-shard statistics reported separately from the region heartbeat, with
/// their own version for optimistic concurrency.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketStat {
    pub region_id: RegionId,
    pub version: u64,
    /// Bucket boundary keys, ordered.
    pub keys: Vec<Vec<u8>>,
    pub read_bytes: Vec<u64>,
    pub write_bytes: Vec<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationStatus {
    pub state: String,
    pub state_id: u64,
}

/// Load dimensions carried by heartbeats, as deltas over the report
/// interval.
pub const LOAD_READ_BYTES: usize = 0;
pub const LOAD_READ_KEYS: usize = 1;
pub const LOAD_READ_QUERY: usize = 2;
pub const LOAD_WRITE_BYTES: usize = 3;
pub const LOAD_WRITE_KEYS: usize = 4;
pub const LOAD_WRITE_QUERY: usize = 5;
pub const LOAD_DIMS: usize = 6;

/// In-memory region record. Immutable once inserted into the cluster: every
/// update builds a modified clone (`with_*`) and swaps it in under the
/// cluster write lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionInfo {
    pub id: RegionId,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub epoch: RegionEpoch,
    pub peers: Vec<Peer>,
    pub leader: Option<Peer>,
    pub pending_peers: Vec<Peer>,
    pub down_peers: Vec<DownPeer>,
    /// Approximate MiB.
    pub approximate_size: u64,
    pub approximate_keys: u64,
    pub loads: [u64; LOAD_DIMS],
    pub interval: TimeInterval,
    #[serde(skip)]
    pub buckets: Option<Arc<BucketStat>>,
    pub replication_status: Option<ReplicationStatus>,
}

impl RegionInfo {
    pub fn new(id: RegionId, start_key: Vec<u8>, end_key: Vec<u8>, peers: Vec<Peer>) -> Self {
        Self {
            id,
            start_key,
            end_key,
            epoch: RegionEpoch::default(),
            peers,
            leader: None,
            pending_peers: Vec::new(),
            down_peers: Vec::new(),
            approximate_size: 0,
            approximate_keys: 0,
            loads: [0; LOAD_DIMS],
            interval: TimeInterval::default(),
            buckets: None,
            replication_status: None,
        }
    }

    pub fn get_peer(&self, peer_id: PeerId) -> Option<&Peer> {
        self.peers.iter().find(|p| p.id == peer_id)
    }

    pub fn get_store_peer(&self, store_id: StoreId) -> Option<&Peer> {
        self.peers.iter().find(|p| p.store_id == store_id)
    }

    pub fn voters(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter().filter(|p| p.is_voter())
    }

    pub fn learners(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter().filter(|p| p.is_learner())
    }

    pub fn followers(&self) -> impl Iterator<Item = &Peer> {
        let leader_id = self.leader.map(|l| l.id);
        self.peers
            .iter()
            .filter(move |p| p.is_voter() && Some(p.id) != leader_id)
    }

    pub fn leader_store_id(&self) -> Option<StoreId> {
        self.leader.map(|l| l.store_id)
    }

    pub fn store_ids(&self) -> impl Iterator<Item = StoreId> + '_ {
        self.peers.iter().map(|p| p.store_id)
    }

    pub fn in_joint_state(&self) -> bool {
        self.peers.iter().any(|p| p.in_joint_state())
    }

    pub fn is_pending_peer(&self, peer_id: PeerId) -> bool {
        self.pending_peers.iter().any(|p| p.id == peer_id)
    }

    pub fn is_down_peer(&self, peer_id: PeerId) -> bool {
        self.down_peers.iter().any(|d| d.peer.id == peer_id)
    }

    /// Whether `key` falls inside `[start_key, end_key)`.
    pub fn contains_key(&self, key: &[u8]) -> bool {
        key >= self.start_key.as_slice() && (self.end_key.is_empty() || key < self.end_key.as_slice())
    }

    /// Whether the two key ranges intersect.
    pub fn overlaps(&self, start: &[u8], end: &[u8]) -> bool {
        let this_ends_after = self.end_key.is_empty() || self.end_key.as_slice() > start;
        let other_ends_after = end.is_empty() || end > self.start_key.as_slice();
        this_ends_after && other_ends_after
    }

    pub fn write_loads(&self) -> [f64; 3] {
        [
            self.loads[LOAD_WRITE_BYTES] as f64,
            self.loads[LOAD_WRITE_KEYS] as f64,
            self.loads[LOAD_WRITE_QUERY] as f64,
        ]
    }

    /// Carry forward cached state the heartbeat does not re-report.
    pub fn inherit(&mut self, origin: &RegionInfo) {
        if self.approximate_size == 0 {
            self.approximate_size = origin.approximate_size;
        }
        if self.approximate_keys == 0 {
            self.approximate_keys = origin.approximate_keys;
        }
        if self.buckets.is_none() {
            self.buckets = origin.buckets.clone();
        }
    }

    // Clone-and-modify builders.

    pub fn with_epoch(&self, epoch: RegionEpoch) -> Self {
        let mut next = self.clone();
        next.epoch = epoch;
        next
    }

    pub fn with_leader(&self, leader: Option<Peer>) -> Self {
        let mut next = self.clone();
        next.leader = leader;
        next
    }

    pub fn with_add_peer(&self, peer: Peer) -> Self {
        let mut next = self.clone();
        next.peers.push(peer);
        next.epoch.conf_ver += 1;
        next
    }

    pub fn with_remove_store_peer(&self, store_id: StoreId) -> Self {
        let mut next = self.clone();
        next.peers.retain(|p| p.store_id != store_id);
        next.pending_peers.retain(|p| p.store_id != store_id);
        next.down_peers.retain(|d| d.peer.store_id != store_id);
        if next.leader.map(|l| l.store_id) == Some(store_id) {
            next.leader = None;
        }
        next.epoch.conf_ver += 1;
        next
    }

    pub fn with_pending_peers(&self, pending: Vec<Peer>) -> Self {
        let mut next = self.clone();
        next.pending_peers = pending;
        next
    }

    pub fn with_down_peers(&self, down: Vec<DownPeer>) -> Self {
        let mut next = self.clone();
        next.down_peers = down;
        next
    }

    pub fn with_buckets(&self, buckets: Option<Arc<BucketStat>>) -> Self {
        let mut next = self.clone();
        next.buckets = buckets;
        next
    }
}

/// What a freshly-arrived heartbeat requires of the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionGuide {
    /// The cache had no usable entry (no origin, or origin without leader).
    pub is_new: bool,
    /// Region meta changed: persist to the MetaStore.
    pub save_kv: bool,
    /// Anything scheduling-relevant changed: refresh the cache.
    pub save_cache: bool,
    /// Leader or health changed: notify region-sync subscribers.
    pub need_sync: bool,
}

fn peers_equal(a: &[Peer], b: &[Peer]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a_sorted: Vec<&Peer> = a.iter().collect();
    let mut b_sorted: Vec<&Peer> = b.iter().collect();
    a_sorted.sort_by_key(|p| p.id);
    b_sorted.sort_by_key(|p| p.id);
    a_sorted
        .iter()
        .zip(b_sorted.iter())
        .all(|(x, y)| x == y)
}

fn down_peers_equal(a: &[DownPeer], b: &[DownPeer]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a_sorted: Vec<&DownPeer> = a.iter().collect();
    let mut b_sorted: Vec<&DownPeer> = b.iter().collect();
    a_sorted.sort_by_key(|d| d.peer.id);
    b_sorted.sort_by_key(|d| d.peer.id);
    a_sorted
        .iter()
        .zip(b_sorted.iter())
        .all(|(x, y)| x.peer == y.peer)
}

/// Decide what to do with an incoming region against the cached origin.
///
/// Saving to the KV store is reserved for meta changes; the cache refreshes
/// on anything scheduling-relevant; sync fires only for changes replicas of
/// the driver itself must learn promptly.
pub fn region_guide(region: &RegionInfo, origin: Option<&RegionInfo>) -> RegionGuide {
    let mut guide = RegionGuide::default();
    let origin = match origin {
        None => {
            return RegionGuide {
                is_new: true,
                save_kv: true,
                save_cache: true,
                need_sync: true,
            };
        }
        Some(origin) => origin,
    };

    if region.epoch.version > origin.epoch.version
        || region.epoch.conf_ver > origin.epoch.conf_ver
    {
        guide.save_kv = true;
        guide.save_cache = true;
    }
    if region.leader.map(|l| l.id) != origin.leader.map(|l| l.id) {
        if origin.leader.is_none() {
            guide.is_new = true;
        }
        guide.save_cache = true;
        guide.need_sync = true;
    }
    if !down_peers_equal(&region.down_peers, &origin.down_peers) {
        guide.save_cache = true;
        guide.need_sync = true;
    }
    if !peers_equal(&region.pending_peers, &origin.pending_peers) {
        guide.save_cache = true;
        guide.need_sync = true;
    }
    if !peers_equal(&region.peers, &origin.peers) {
        guide.save_kv = true;
        guide.save_cache = true;
    }
    if region.approximate_size != origin.approximate_size
        || region.approximate_keys != origin.approximate_keys
        || region.loads != origin.loads
        || region.replication_status != origin.replication_status
    {
        guide.save_cache = true;
    }
    guide
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(id: RegionId, start: &[u8], end: &[u8]) -> RegionInfo {
        let peers = vec![Peer::voter(id * 10 + 1, 1), Peer::voter(id * 10 + 2, 2)];
        let mut r = RegionInfo::new(id, start.to_vec(), end.to_vec(), peers);
        r.leader = Some(r.peers[0]);
        r
    }

    #[test]
    fn contains_key_is_end_exclusive() {
        let r = region(1, b"b", b"d");
        assert!(!r.contains_key(b"a"));
        assert!(r.contains_key(b"b"));
        assert!(r.contains_key(b"c"));
        assert!(!r.contains_key(b"d"));

        let unbounded = region(2, b"d", b"");
        assert!(unbounded.contains_key(b"zzz"));
    }

    #[test]
    fn overlap_detection() {
        let r = region(1, b"b", b"d");
        assert!(r.overlaps(b"c", b"e"));
        assert!(r.overlaps(b"a", b"c"));
        assert!(!r.overlaps(b"d", b"e"));
        assert!(!r.overlaps(b"a", b"b"));
        assert!(r.overlaps(b"a", b""));
    }

    #[test]
    fn guide_flags_new_region() {
        let r = region(1, b"", b"");
        let guide = region_guide(&r, None);
        assert!(guide.is_new && guide.save_kv && guide.save_cache && guide.need_sync);
    }

    #[test]
    fn guide_flags_leader_change_as_sync_only() {
        let old = region(1, b"", b"");
        let new = old.with_leader(Some(old.peers[1]));
        let guide = region_guide(&new, Some(&old));
        assert!(!guide.save_kv);
        assert!(guide.save_cache);
        assert!(guide.need_sync);
        assert!(!guide.is_new);
    }

    #[test]
    fn guide_flags_epoch_bump_as_save_kv() {
        let old = region(1, b"", b"");
        let new = old.with_epoch(RegionEpoch::new(1, 2));
        let guide = region_guide(&new, Some(&old));
        assert!(guide.save_kv && guide.save_cache);
        assert!(!guide.need_sync);
    }

    #[test]
    fn guide_ignores_identical_report() {
        let old = region(1, b"", b"");
        let guide = region_guide(&old.clone(), Some(&old));
        assert_eq!(guide, RegionGuide::default());
    }

    #[test]
    fn inherit_carries_size_and_buckets() {
        let mut old = region(1, b"", b"");
        old.approximate_size = 64;
        old.approximate_keys = 1000;
        old.buckets = Some(Arc::new(BucketStat {
            region_id: 1,
            version: 3,
            ..Default::default()
        }));
        let mut new = region(1, b"", b"");
        new.inherit(&old);
        assert_eq!(new.approximate_size, 64);
        assert_eq!(new.buckets.as_ref().unwrap().version, 3);
    }
}
