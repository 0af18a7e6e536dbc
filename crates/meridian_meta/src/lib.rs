//! Capability contracts the placement driver builds on.
//!
//! The driver itself owns no durable storage and no election machinery. It
//! talks to a linearizable key-value store through [`MetaStore`] and to a
//! leader-election service through [`Election`]. Production deployments wrap
//! etcd (or any linearizable KV with leases); tests and the single-binary dev
//! mode use the in-process implementations in this crate.

mod election;
mod metastore;

pub use election::{Election, LeadershipState, MemElection};
pub use metastore::{load_json, save_json, MemStore, MetaStore, TxnCompare, TxnOp, WatchEvent};

use thiserror::Error;

/// Errors surfaced by the MetaStore/Election contracts.
#[derive(Debug, Error)]
pub enum MetaError {
    #[error("meta store key not found: {0}")]
    KeyNotFound(String),
    #[error("meta store transaction conflict")]
    TxnConflict,
    #[error("meta store internal error: {0}")]
    Internal(String),
    #[error("election leader not found")]
    LeaderNotFound,
    #[error("move leader failed: {0}")]
    MoveLeaderFailed(String),
}

pub type Result<T> = std::result::Result<T, MetaError>;

/// Key layout for persisted placement-driver state, rooted at the cluster id.
///
/// The driver persists everything under `/<cluster_id>/`; keeping the layout
/// in one place makes the on-disk (or on-etcd) contract reviewable.
#[derive(Debug, Clone)]
pub struct KeyLayout {
    root: String,
}

impl KeyLayout {
    pub fn new(cluster_id: u64) -> Self {
        Self {
            root: format!("/{cluster_id}"),
        }
    }

    pub fn cluster_meta(&self) -> String {
        format!("{}/raft", self.root)
    }

    pub fn store(&self, store_id: u64) -> String {
        format!("{}/raft/s/{store_id:020}", self.root)
    }

    pub fn store_prefix(&self) -> String {
        format!("{}/raft/s/", self.root)
    }

    pub fn region(&self, region_id: u64) -> String {
        format!("{}/raft/r/{region_id:020}", self.root)
    }

    pub fn region_prefix(&self) -> String {
        format!("{}/raft/r/", self.root)
    }

    pub fn min_resolved_ts(&self) -> String {
        format!("{}/raft/min_resolved_ts", self.root)
    }

    pub fn scheduler_config(&self, name: &str) -> String {
        format!("{}/schedulers/{name}", self.root)
    }

    pub fn scheduler_prefix(&self) -> String {
        format!("{}/schedulers/", self.root)
    }

    pub fn rule(&self, group_id: &str, id: &str) -> String {
        format!("{}/rules/{group_id}#{id}", self.root)
    }

    pub fn rule_prefix(&self) -> String {
        format!("{}/rules/", self.root)
    }

    pub fn id_alloc(&self) -> String {
        format!("{}/alloc_id", self.root)
    }

    pub fn leader(&self) -> String {
        format!("{}/leader", self.root)
    }

    pub fn tso_timestamp(&self, dc_location: &str) -> String {
        format!("{}/tso/{dc_location}/timestamp", self.root)
    }

    pub fn dc_location(&self, member_id: u64) -> String {
        format!("{}/dc-location/{member_id}", self.root)
    }

    pub fn member(&self, member_id: u64, field: &str) -> String {
        format!("{}/member/{member_id}/{field}", self.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout_is_rooted_at_cluster_id() {
        let layout = KeyLayout::new(7);
        assert_eq!(layout.cluster_meta(), "/7/raft");
        assert_eq!(layout.store(3), "/7/raft/s/00000000000000000003");
        assert_eq!(layout.tso_timestamp("global"), "/7/tso/global/timestamp");
        assert!(layout.region(9).starts_with(&layout.region_prefix()));
    }
}
