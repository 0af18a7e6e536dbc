//! Store (storage node) model: descriptor, lifecycle state machine, and
//! heartbeat-derived statistics.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::smoothing::{Hma, MaxFilter};

pub type StoreId = u64;

/// Reporting cadence the storage nodes follow.
pub const STORE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
/// A store missing two heartbeats is treated as disconnected.
pub const STORE_DISCONNECT_DURATION: Duration = Duration::from_secs(20);
/// Store meta is re-persisted at most this often on the heartbeat path.
const STORE_PERSIST_INTERVAL: Duration = Duration::from_secs(3 * 60);

const MAX_SCORE: f64 = 1024.0 * 1024.0 * 1024.0;
const MIN_WEIGHT: f64 = 1e-6;

/// Lifecycle of a store.
///
/// ```text
/// Preparing -> Serving -> Removing -> Tombstone
/// ```
/// `Removing` with `physically_destroyed` can never return to `Serving`;
/// `Tombstone` is terminal until the store record is deleted outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    Preparing,
    Serving,
    Removing { physically_destroyed: bool },
    Tombstone,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreLabel {
    pub key: String,
    pub value: String,
}

/// Persisted store descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreMeta {
    pub id: StoreId,
    pub address: String,
    pub labels: Vec<StoreLabel>,
    pub version: String,
    pub state: NodeState,
    /// Unix seconds when the store process started.
    pub start_timestamp: u64,
}

impl StoreMeta {
    pub fn new(id: StoreId, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
            labels: Vec::new(),
            version: String::new(),
            state: NodeState::Preparing,
            start_timestamp: unix_now(),
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Interval covered by one heartbeat report, unix seconds.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TimeInterval {
    pub start: u64,
    pub end: u64,
}

impl TimeInterval {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.end.saturating_sub(self.start))
    }
}

/// Per-peer read load carried in a store heartbeat. Read flow is accounted
/// on the leader peer only, so it arrives with the store report rather than
/// the region report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerStat {
    pub region_id: u64,
    pub read_bytes: u64,
    pub read_keys: u64,
    pub read_query: u64,
}

/// Node-level statistics reported by a store heartbeat.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub store_id: StoreId,
    pub capacity: u64,
    pub available: u64,
    pub used_size: u64,
    pub region_count: u64,
    pub sending_snap_count: u32,
    pub receiving_snap_count: u32,
    pub applying_snap_count: u32,
    pub is_busy: bool,
    pub bytes_written: u64,
    pub keys_written: u64,
    pub bytes_read: u64,
    pub keys_read: u64,
    pub cpu_usage: u64,
    /// Lower bound on data this store has made durable and consistent.
    pub min_resolved_ts: u64,
    pub interval: TimeInterval,
    pub peer_stats: Vec<PeerStat>,
}

/// Smoothed view of available space. Shared across `StoreInfo` clones so a
/// heartbeat updates the same window every reader sees.
#[derive(Debug)]
struct SmoothedStats {
    avg_available: Hma,
    max_available_deviation: MaxFilter,
    avg_max_available_deviation: Hma,
}

impl SmoothedStats {
    fn new() -> Self {
        Self {
            // 10 minutes of samples at the 10s store heartbeat rate.
            avg_available: Hma::new(60),
            // 20 minutes for the deviation envelope.
            max_available_deviation: MaxFilter::new(120),
            avg_max_available_deviation: Hma::new(60),
        }
    }

    fn observe(&mut self, available: u64) {
        self.avg_available.add(available as f64);
        let deviation = (available as f64 - self.avg_available.get()).abs();
        self.max_available_deviation.add(deviation);
        self.avg_max_available_deviation
            .add(self.max_available_deviation.get());
    }
}

/// In-memory store record: persisted meta plus volatile runtime state.
///
/// Updates follow the clone-and-replace idiom: readers hold an
/// `Arc<StoreInfo>` snapshot, writers build a modified clone and swap it
/// into the cluster map. The smoothing windows are deliberately shared
/// between clones.
#[derive(Debug, Clone)]
pub struct StoreInfo {
    pub meta: StoreMeta,
    pub stats: StoreStats,
    smoothed: Arc<RwLock<SmoothedStats>>,
    pub last_heartbeat: Option<Instant>,
    pub last_persist: Option<Instant>,
    pub leader_count: usize,
    pub region_count: usize,
    pub pending_peer_count: usize,
    /// Approximate MiB.
    pub leader_size: u64,
    pub region_size: u64,
    pub leader_weight: f64,
    pub region_weight: f64,
    pub pause_leader_transfer: bool,
    pub slow_store_evicted: bool,
}

impl StoreInfo {
    pub fn new(meta: StoreMeta) -> Self {
        Self {
            meta,
            stats: StoreStats::default(),
            smoothed: Arc::new(RwLock::new(SmoothedStats::new())),
            last_heartbeat: None,
            last_persist: None,
            leader_count: 0,
            region_count: 0,
            pending_peer_count: 0,
            leader_size: 0,
            region_size: 0,
            leader_weight: 1.0,
            region_weight: 1.0,
            pause_leader_transfer: false,
            slow_store_evicted: false,
        }
    }

    pub fn id(&self) -> StoreId {
        self.meta.id
    }

    // Lifecycle predicates.

    pub fn is_preparing(&self) -> bool {
        self.meta.state == NodeState::Preparing
    }

    pub fn is_serving(&self) -> bool {
        self.meta.state == NodeState::Serving
    }

    /// Preparing or Serving: the store participates in placement.
    pub fn is_up(&self) -> bool {
        self.is_preparing() || self.is_serving()
    }

    pub fn is_removing(&self) -> bool {
        matches!(self.meta.state, NodeState::Removing { .. })
    }

    pub fn is_removed(&self) -> bool {
        self.meta.state == NodeState::Tombstone
    }

    pub fn is_physically_destroyed(&self) -> bool {
        matches!(
            self.meta.state,
            NodeState::Removing {
                physically_destroyed: true
            }
        )
    }

    pub fn is_disconnected(&self) -> bool {
        match self.last_heartbeat {
            None => true,
            Some(at) => at.elapsed() >= STORE_DISCONNECT_DURATION,
        }
    }

    pub fn is_down(&self, max_store_down_time: Duration) -> bool {
        match self.last_heartbeat {
            None => true,
            Some(at) => at.elapsed() >= max_store_down_time,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.stats.is_busy
    }

    pub fn uptime(&self) -> Duration {
        Duration::from_secs(unix_now().saturating_sub(self.meta.start_timestamp))
    }

    pub fn snapshot_count(&self) -> u64 {
        self.stats.sending_snap_count as u64
            + self.stats.receiving_snap_count as u64
            + self.stats.applying_snap_count as u64
    }

    // Space accounting.

    pub fn capacity(&self) -> u64 {
        self.stats.capacity
    }

    pub fn available(&self) -> u64 {
        self.stats.available
    }

    pub fn used_size(&self) -> u64 {
        self.stats.used_size
    }

    /// Available size with heartbeat spikes smoothed away.
    pub fn avg_available(&self) -> u64 {
        let smoothed = self.smoothed.read().unwrap_or_else(|e| e.into_inner());
        if smoothed.avg_available.is_empty() {
            return self.stats.available;
        }
        clamp0(smoothed.avg_available.get())
    }

    /// Approximate magnitude of recent available-space swings.
    pub fn available_deviation(&self) -> u64 {
        let smoothed = self.smoothed.read().unwrap_or_else(|e| e.into_inner());
        clamp0(smoothed.avg_max_available_deviation.get())
    }

    pub fn is_low_space(&self, low_space_ratio: f64) -> bool {
        if self.stats.capacity == 0 {
            return false;
        }
        let ratio = self.stats.available as f64 / self.stats.capacity as f64;
        ratio < 1.0 - low_space_ratio
    }

    // Scores.

    pub fn leader_score(&self, delta: i64) -> f64 {
        (self.leader_count as i64 + delta) as f64 / self.leader_weight.max(MIN_WEIGHT)
    }

    /// Size-based placement score, amplified as the store approaches its
    /// space bounds so nearly-full stores shed regions aggressively.
    pub fn region_score(&self, high_space_ratio: f64, low_space_ratio: f64, delta: i64) -> f64 {
        let capacity = mib(self.stats.capacity);
        let used = mib(self.stats.used_size);
        let available = mib(self.avg_available());

        let amplification = if self.region_size == 0 || used == 0.0 {
            1.0
        } else {
            self.region_size as f64 / used
        };

        let high_bound = (1.0 - high_space_ratio) * capacity;
        let low_bound = (1.0 - low_space_ratio) * capacity;
        let projected = available - delta as f64 / amplification.max(MIN_WEIGHT);

        let score = if projected >= high_bound {
            (self.region_size as i64 + delta) as f64
        } else if projected <= low_bound {
            MAX_SCORE - projected
        } else {
            // Linear bridge between the two regimes to keep the score
            // continuous as a store crosses the space bounds.
            let at_high = (self.region_size as i64 + delta) as f64;
            let at_low = MAX_SCORE - low_bound;
            at_high + (high_bound - projected) / (high_bound - low_bound) * (at_low - at_high)
        };
        score / self.region_weight.max(MIN_WEIGHT)
    }

    // Heartbeat updates (clone-and-replace).

    pub fn with_stats(&self, stats: StoreStats) -> Self {
        {
            let mut smoothed = self.smoothed.write().unwrap_or_else(|e| e.into_inner());
            smoothed.observe(stats.available);
        }
        let mut next = self.clone();
        next.stats = stats;
        next
    }

    pub fn with_last_heartbeat(&self, at: Instant) -> Self {
        let mut next = self.clone();
        next.last_heartbeat = Some(at);
        next
    }

    pub fn with_persisted_now(&self) -> Self {
        let mut next = self.clone();
        next.last_persist = Some(Instant::now());
        next
    }

    pub fn with_state(&self, state: NodeState) -> Self {
        let mut next = self.clone();
        next.meta.state = state;
        next
    }

    pub fn with_labels(&self, labels: Vec<StoreLabel>) -> Self {
        let mut next = self.clone();
        next.meta.labels = labels;
        next
    }

    pub fn with_weights(&self, leader_weight: f64, region_weight: f64) -> Self {
        let mut next = self.clone();
        next.leader_weight = leader_weight;
        next.region_weight = region_weight;
        next
    }

    pub fn with_counts(
        &self,
        leader_count: usize,
        region_count: usize,
        pending_peer_count: usize,
        leader_size: u64,
        region_size: u64,
    ) -> Self {
        let mut next = self.clone();
        next.leader_count = leader_count;
        next.region_count = region_count;
        next.pending_peer_count = pending_peer_count;
        next.leader_size = leader_size;
        next.region_size = region_size;
        next
    }

    pub fn with_pause_leader_transfer(&self, paused: bool) -> Self {
        let mut next = self.clone();
        next.pause_leader_transfer = paused;
        next
    }

    pub fn with_slow_store_evicted(&self, evicted: bool) -> Self {
        let mut next = self.clone();
        next.slow_store_evicted = evicted;
        next
    }

    pub fn need_persist(&self) -> bool {
        match self.last_persist {
            None => true,
            Some(at) => at.elapsed() >= STORE_PERSIST_INTERVAL,
        }
    }

    pub fn label_value(&self, key: &str) -> Option<&str> {
        self.meta
            .labels
            .iter()
            .find(|l| l.key == key)
            .map(|l| l.value.as_str())
    }

    /// Compares topology position under `location_labels`. Returns the index
    /// of the first differing label, or `None` when the stores share the
    /// whole location (or no labels are configured).
    pub fn compare_location(&self, other: &StoreInfo, location_labels: &[String]) -> Option<usize> {
        for (i, key) in location_labels.iter().enumerate() {
            // Missing labels count as different locations, matching the
            // conservative reading used throughout placement.
            if self.label_value(key).is_none()
                || self.label_value(key) != other.label_value(key)
            {
                return Some(i);
            }
        }
        None
    }
}

fn mib(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

fn clamp0(v: f64) -> u64 {
    if v <= 0.0 {
        0
    } else {
        v as u64
    }
}

// Label key consists of alphanumerics, '-', '_', '.' or '/', must start and
// end with an alphanumeric, and may carry a leading '$'. Value may be empty
// to mark a label deleted.
const LABEL_KEY_FORMAT: &str = r"^[$]?[A-Za-z0-9]([-A-Za-z0-9_./]*[A-Za-z0-9])?$";
const LABEL_VALUE_FORMAT: &str = r"^[-A-Za-z0-9_./]*$";

fn label_key_re() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(LABEL_KEY_FORMAT).unwrap())
}

fn label_value_re() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(LABEL_VALUE_FORMAT).unwrap())
}

pub fn validate_labels(labels: &[StoreLabel]) -> Result<()> {
    for label in labels {
        if !label_key_re().is_match(&label.key) {
            return Err(Error::InvalidStoreLabel(format!(
                "key {:?} does not match format {:?}",
                label.key, LABEL_KEY_FORMAT
            )));
        }
        if !label_value_re().is_match(&label.value) {
            return Err(Error::InvalidStoreLabel(format!(
                "value {:?} does not match format {:?}",
                label.value, LABEL_VALUE_FORMAT
            )));
        }
    }
    Ok(())
}

/// Merge `update` into `current`, dropping labels whose updated value is
/// empty. Used by `SetStoreLabels` without `force`.
pub fn merge_labels(current: &[StoreLabel], update: &[StoreLabel]) -> Vec<StoreLabel> {
    let mut merged: Vec<StoreLabel> = current.to_vec();
    for label in update {
        match merged.iter_mut().find(|l| l.key == label.key) {
            Some(existing) => existing.value = label.value.clone(),
            None => merged.push(label.clone()),
        }
    }
    merged.retain(|l| !l.value.is_empty());
    merged
}
