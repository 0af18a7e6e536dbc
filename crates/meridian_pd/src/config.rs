//! Runtime configuration for the driver subsystems.
//!
//! Each background manager takes its own small config struct; the binary
//! builds them from CLI/env arguments. Values that influence persisted
//! behavior carry serde derives so they round-trip through scheduler
//! configs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Replication policy knobs used when placement rules are disabled, and as
/// the source of the default placement rule when they are enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    pub max_replicas: usize,
    /// Topology label keys ordered from outermost to innermost.
    pub location_labels: Vec<String>,
    /// Peers must be isolated at least at this label level ("" = off).
    pub isolation_level: String,
    pub enable_placement_rules: bool,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            max_replicas: 3,
            location_labels: Vec::new(),
            isolation_level: String::new(),
            enable_placement_rules: true,
        }
    }
}

/// Scheduling thresholds and rate limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Max regions a merge candidate may hold, in MiB of approximate size.
    pub max_merge_region_size: u64,
    pub max_merge_region_keys: u64,
    /// Cool-down after a split before either side can merge again.
    pub split_merge_interval: Duration,
    pub patrol_region_interval: Duration,
    pub max_store_down_time: Duration,
    pub max_store_preparing_time: Duration,
    pub leader_schedule_limit: u64,
    pub region_schedule_limit: u64,
    pub replica_schedule_limit: u64,
    pub merge_schedule_limit: u64,
    pub hot_region_schedule_limit: u64,
    pub max_snapshot_count: u64,
    pub max_pending_peer_count: u64,
    pub low_space_ratio: f64,
    pub high_space_ratio: f64,
    /// 0 means "derive from average region size".
    pub tolerant_size_ratio: f64,
    /// Default per-store limits, applied until overridden per store.
    pub store_limit_add_peer: f64,
    pub store_limit_remove_peer: f64,
    /// "manual" or "auto".
    pub store_limit_mode: String,
    pub min_resolved_ts_persistence_interval: Duration,
    pub enable_remove_down_replica: bool,
    pub enable_replace_offline_replica: bool,
    pub enable_make_up_replica: bool,
    pub enable_remove_extra_replica: bool,
    pub enable_location_replacement: bool,
    pub enable_cross_table_merge: bool,
    pub enable_joint_consensus: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            max_merge_region_size: 20,
            max_merge_region_keys: 200_000,
            split_merge_interval: Duration::from_secs(3600),
            patrol_region_interval: Duration::from_millis(10),
            max_store_down_time: Duration::from_secs(30 * 60),
            max_store_preparing_time: Duration::from_secs(48 * 3600),
            leader_schedule_limit: 4,
            region_schedule_limit: 2048,
            replica_schedule_limit: 64,
            merge_schedule_limit: 8,
            hot_region_schedule_limit: 4,
            max_snapshot_count: 64,
            max_pending_peer_count: 64,
            low_space_ratio: 0.8,
            high_space_ratio: 0.7,
            tolerant_size_ratio: 0.0,
            store_limit_add_peer: 15.0,
            store_limit_remove_peer: 15.0,
            store_limit_mode: "manual".to_string(),
            min_resolved_ts_persistence_interval: Duration::from_secs(1),
            enable_remove_down_replica: true,
            enable_replace_offline_replica: true,
            enable_make_up_replica: true,
            enable_remove_extra_replica: true,
            enable_location_replacement: true,
            enable_cross_table_merge: true,
            enable_joint_consensus: true,
        }
    }
}

impl ScheduleConfig {
    pub fn schedule_limit(&self, kind: crate::operator::OpKind) -> u64 {
        use crate::operator::OpKind;
        match kind {
            OpKind::Leader => self.leader_schedule_limit,
            OpKind::Region => self.region_schedule_limit,
            OpKind::Replica => self.replica_schedule_limit,
            OpKind::Merge => self.merge_schedule_limit,
            OpKind::HotRegion => self.hot_region_schedule_limit,
        }
    }
}

/// Timestamp oracle knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TsoConfig {
    /// The persisted watermark always leads wall-clock use by this much.
    pub save_interval: Duration,
    /// Tick driving the background physical-time advance.
    pub update_physical_interval: Duration,
    /// Reject admin resets further than this from the wall clock.
    pub max_reset_ts_gap: Duration,
}

impl Default for TsoConfig {
    fn default() -> Self {
        Self {
            save_interval: Duration::from_secs(3),
            update_physical_interval: Duration::from_millis(50),
            max_reset_ts_gap: Duration::from_secs(24 * 3600),
        }
    }
}

/// Top-level driver configuration assembled by the binary.
#[derive(Debug, Clone, Default)]
pub struct PdConfig {
    pub cluster_id: u64,
    pub name: String,
    pub dc_locations: Vec<String>,
    pub replication: ReplicationConfig,
    pub schedule: ScheduleConfig,
    pub tso: TsoConfig,
}
