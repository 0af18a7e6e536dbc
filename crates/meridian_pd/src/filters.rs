//! Store selection pipeline shared by schedulers and checkers.
//!
//! A filter judges a store as a move source or a move target; pipelines are
//! just slices of boxed filters. Judgements are pure against a snapshot of
//! the topology, so schedulers can evaluate candidates without holding any
//! cluster lock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::config::ScheduleConfig;
use crate::region::RegionInfo;
use crate::rules::{match_label_constraints, LabelConstraint, RuleManager};
use crate::rules::compare_region_fit;
use crate::store::{StoreId, StoreInfo};
use crate::store_limit::{StoreLimitType, StoreLimiter, REGION_INFLUENCE};

pub trait Filter: Send + Sync {
    fn name(&self) -> &'static str;

    fn source(&self, _cfg: &ScheduleConfig, _store: &StoreInfo) -> bool {
        true
    }

    fn target(&self, _cfg: &ScheduleConfig, _store: &StoreInfo) -> bool {
        true
    }
}

pub fn select_source_stores(
    stores: &[Arc<StoreInfo>],
    filters: &[Box<dyn Filter>],
    cfg: &ScheduleConfig,
) -> Vec<Arc<StoreInfo>> {
    stores
        .iter()
        .filter(|s| filters.iter().all(|f| f.source(cfg, s)))
        .cloned()
        .collect()
}

pub fn select_target_stores(
    stores: &[Arc<StoreInfo>],
    filters: &[Box<dyn Filter>],
    cfg: &ScheduleConfig,
) -> Vec<Arc<StoreInfo>> {
    stores
        .iter()
        .filter(|s| filters.iter().all(|f| f.target(cfg, s)))
        .cloned()
        .collect()
}

/// Rejects explicitly excluded stores.
pub struct ExcludedFilter {
    sources: HashSet<StoreId>,
    targets: HashSet<StoreId>,
}

impl ExcludedFilter {
    pub fn new(sources: HashSet<StoreId>, targets: HashSet<StoreId>) -> Self {
        Self { sources, targets }
    }

    pub fn targets_only(targets: HashSet<StoreId>) -> Self {
        Self {
            sources: HashSet::new(),
            targets,
        }
    }
}

impl Filter for ExcludedFilter {
    fn name(&self) -> &'static str {
        "exclude-filter"
    }

    fn source(&self, _: &ScheduleConfig, store: &StoreInfo) -> bool {
        !self.sources.contains(&store.id())
    }

    fn target(&self, _: &ScheduleConfig, store: &StoreInfo) -> bool {
        !self.targets.contains(&store.id())
    }
}

/// Rejects targets that are running out of disk.
pub struct StorageThresholdFilter;

impl Filter for StorageThresholdFilter {
    fn name(&self) -> &'static str {
        "storage-threshold-filter"
    }

    fn target(&self, cfg: &ScheduleConfig, store: &StoreInfo) -> bool {
        !store.is_low_space(cfg.low_space_ratio)
    }
}

/// Which lifecycle/health conditions to hold a store against.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreStateFilter {
    /// The candidate move is a leader transfer.
    pub transfer_leader: bool,
    /// The candidate move ships a region snapshot.
    pub move_region: bool,
    /// Permit states that are merely temporary (busy, overloaded); scatter
    /// needs this to keep working on a stressed cluster.
    pub allow_temporary_states: bool,
}

impl StoreStateFilter {
    fn removed_or_removing(&self, store: &StoreInfo) -> bool {
        store.is_removed() || store.is_removing()
    }

    fn common_source_reject(&self, cfg: &ScheduleConfig, store: &StoreInfo) -> bool {
        if store.is_removed() {
            return true;
        }
        if self.transfer_leader && (store.is_disconnected() || store.is_busy()) {
            return true;
        }
        if self.move_region && !self.allow_temporary_states && store.is_busy() {
            return true;
        }
        let _ = cfg;
        false
    }

    fn common_target_reject(&self, cfg: &ScheduleConfig, store: &StoreInfo) -> bool {
        if self.removed_or_removing(store) || store.is_down(cfg.max_store_down_time) {
            return true;
        }
        if store.is_disconnected() {
            return true;
        }
        if self.transfer_leader
            && (store.pause_leader_transfer || store.slow_store_evicted || store.is_busy())
        {
            return true;
        }
        if self.move_region && !self.allow_temporary_states {
            if store.is_busy() {
                return true;
            }
            if store.snapshot_count() > cfg.max_snapshot_count {
                return true;
            }
            if store.pending_peer_count as u64 > cfg.max_pending_peer_count {
                return true;
            }
        }
        false
    }
}

impl Filter for StoreStateFilter {
    fn name(&self) -> &'static str {
        "store-state-filter"
    }

    fn source(&self, cfg: &ScheduleConfig, store: &StoreInfo) -> bool {
        if self.transfer_leader && store.pause_leader_transfer {
            return false;
        }
        !self.common_source_reject(cfg, store)
    }

    fn target(&self, cfg: &ScheduleConfig, store: &StoreInfo) -> bool {
        !self.common_target_reject(cfg, store)
    }
}

/// Rejects stores whose admission bucket for the relevant step class is
/// exhausted.
pub struct StoreLimitFilter {
    pub limiter: Arc<StoreLimiter>,
}

impl Filter for StoreLimitFilter {
    fn name(&self) -> &'static str {
        "store-limit-filter"
    }

    fn source(&self, _: &ScheduleConfig, store: &StoreInfo) -> bool {
        self.limiter
            .available(store.id(), StoreLimitType::RemovePeer, REGION_INFLUENCE)
    }

    fn target(&self, _: &ScheduleConfig, store: &StoreInfo) -> bool {
        self.limiter
            .available(store.id(), StoreLimitType::AddPeer, REGION_INFLUENCE)
    }
}

/// Keeps only stores matching a set of label constraints.
pub struct LabelConstraintFilter {
    pub constraints: Vec<LabelConstraint>,
}

impl Filter for LabelConstraintFilter {
    fn name(&self) -> &'static str {
        "label-constraint-filter"
    }

    fn source(&self, _: &ScheduleConfig, store: &StoreInfo) -> bool {
        match_label_constraints(store, &self.constraints)
    }

    fn target(&self, _: &ScheduleConfig, store: &StoreInfo) -> bool {
        match_label_constraints(store, &self.constraints)
    }
}

const REPLICA_BASE_SCORE: f64 = 100.0;

/// How well `candidate` spreads against `coexisting` under `labels`: stores
/// differing at an outer level contribute more.
pub fn distinct_score(labels: &[String], coexisting: &[Arc<StoreInfo>], candidate: &StoreInfo) -> f64 {
    let mut score = 0.0;
    for store in coexisting {
        if store.id() == candidate.id() {
            continue;
        }
        if let Some(index) = store.compare_location(candidate, labels) {
            score += REPLICA_BASE_SCORE.powi((labels.len() - index - 1) as i32);
        }
    }
    score
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistinctScorePolicy {
    /// Target must keep the isolation at least as good as the source's.
    Safeguard,
    /// Target must strictly improve isolation.
    Improve,
}

/// Classic (non-rule) topology guard for replica moves.
pub struct DistinctScoreFilter {
    labels: Vec<String>,
    coexisting: Vec<Arc<StoreInfo>>,
    safe_score: f64,
    policy: DistinctScorePolicy,
}

impl DistinctScoreFilter {
    pub fn safeguard(
        labels: Vec<String>,
        region_stores: Vec<Arc<StoreInfo>>,
        source: &StoreInfo,
    ) -> Self {
        let coexisting: Vec<Arc<StoreInfo>> = region_stores
            .iter()
            .filter(|s| s.id() != source.id())
            .cloned()
            .collect();
        let safe_score = distinct_score(&labels, &coexisting, source);
        Self {
            labels,
            coexisting,
            safe_score,
            policy: DistinctScorePolicy::Safeguard,
        }
    }

    pub fn improver(
        labels: Vec<String>,
        region_stores: Vec<Arc<StoreInfo>>,
        source: &StoreInfo,
    ) -> Self {
        let mut filter = Self::safeguard(labels, region_stores, source);
        filter.policy = DistinctScorePolicy::Improve;
        filter
    }
}

impl Filter for DistinctScoreFilter {
    fn name(&self) -> &'static str {
        "distinct-score-filter"
    }

    fn target(&self, _: &ScheduleConfig, store: &StoreInfo) -> bool {
        let score = distinct_score(&self.labels, &self.coexisting, store);
        match self.policy {
            DistinctScorePolicy::Safeguard => score >= self.safe_score,
            DistinctScorePolicy::Improve => score > self.safe_score,
        }
    }
}

/// Rule-mode guard: moving the peer from `source_store` to the candidate
/// must not regress the region's rule fit.
pub struct RuleFitFilter {
    rule_manager: Arc<RuleManager>,
    stores: HashMap<StoreId, Arc<StoreInfo>>,
    region: RegionInfo,
    source_store: StoreId,
}

impl RuleFitFilter {
    pub fn new(
        rule_manager: Arc<RuleManager>,
        stores: HashMap<StoreId, Arc<StoreInfo>>,
        region: RegionInfo,
        source_store: StoreId,
    ) -> Self {
        Self {
            rule_manager,
            stores,
            region,
            source_store,
        }
    }
}

impl Filter for RuleFitFilter {
    fn name(&self) -> &'static str {
        "rule-fit-filter"
    }

    fn target(&self, _: &ScheduleConfig, store: &StoreInfo) -> bool {
        if self.region.get_store_peer(store.id()).is_some() {
            return false;
        }
        let old_fit = self.rule_manager.fit_region(&self.region, &self.stores);
        let peer_id = self
            .region
            .get_store_peer(self.source_store)
            .map(|p| p.id)
            .unwrap_or(0);
        let hypothetical = self
            .region
            .with_remove_store_peer(self.source_store)
            .with_add_peer(crate::region::Peer::voter(peer_id, store.id()));
        let new_fit = self.rule_manager.fit_region(&hypothetical, &self.stores);
        compare_region_fit(&new_fit, &old_fit) != std::cmp::Ordering::Less
    }
}

/// Rule-mode guard for leader transfers: the candidate must already hold a
/// peer and taking the leader there must not regress the fit.
pub struct RuleLeaderFitFilter {
    rule_manager: Arc<RuleManager>,
    stores: HashMap<StoreId, Arc<StoreInfo>>,
    region: RegionInfo,
}

impl RuleLeaderFitFilter {
    pub fn new(
        rule_manager: Arc<RuleManager>,
        stores: HashMap<StoreId, Arc<StoreInfo>>,
        region: RegionInfo,
    ) -> Self {
        Self {
            rule_manager,
            stores,
            region,
        }
    }
}

impl Filter for RuleLeaderFitFilter {
    fn name(&self) -> &'static str {
        "rule-fit-leader-filter"
    }

    fn target(&self, _: &ScheduleConfig, store: &StoreInfo) -> bool {
        let Some(peer) = self.region.get_store_peer(store.id()) else {
            return false;
        };
        if peer.is_learner() {
            return false;
        }
        let old_fit = self.rule_manager.fit_region(&self.region, &self.stores);
        let hypothetical = self.region.with_leader(Some(*peer));
        let new_fit = self.rule_manager.fit_region(&hypothetical, &self.stores);
        compare_region_fit(&new_fit, &old_fit) != std::cmp::Ordering::Less
    }
}

/// Chooses the placement guard appropriate for the active mode: rule fit
/// when placement rules are on, location safeguard otherwise.
pub fn placement_safeguard(
    rule_manager: &Arc<RuleManager>,
    stores: &HashMap<StoreId, Arc<StoreInfo>>,
    location_labels: &[String],
    region: &RegionInfo,
    source: &StoreInfo,
) -> Box<dyn Filter> {
    if rule_manager.is_enabled() {
        Box::new(RuleFitFilter::new(
            Arc::clone(rule_manager),
            stores.clone(),
            region.clone(),
            source.id(),
        ))
    } else {
        let region_stores: Vec<Arc<StoreInfo>> = region
            .store_ids()
            .filter_map(|id| stores.get(&id).cloned())
            .collect();
        Box::new(DistinctScoreFilter::safeguard(
            location_labels.to_vec(),
            region_stores,
            source,
        ))
    }
}

/// The label key marking a store as dedicated to a non-default engine.
pub const ENGINE_KEY: &str = "engine";
/// The label key reserving a store for special workloads.
pub const SPECIAL_USE_KEY: &str = "specialUse";

/// Keeps ordinary stores; engine-labelled stores only pass when their
/// engine is allowed.
pub struct EngineFilter {
    pub allowed_engines: Vec<String>,
}

impl EngineFilter {
    fn pass(&self, store: &StoreInfo) -> bool {
        match store.label_value(ENGINE_KEY) {
            None => true,
            Some(engine) => self.allowed_engines.iter().any(|e| e == engine),
        }
    }
}

impl Filter for EngineFilter {
    fn name(&self) -> &'static str {
        "engine-filter"
    }

    fn source(&self, _: &ScheduleConfig, store: &StoreInfo) -> bool {
        self.pass(store)
    }

    fn target(&self, _: &ScheduleConfig, store: &StoreInfo) -> bool {
        self.pass(store)
    }
}

/// Keeps stores not reserved for special use, unless the use is allowed.
pub struct SpecialUseFilter {
    pub allowed_uses: Vec<String>,
}

impl SpecialUseFilter {
    fn pass(&self, store: &StoreInfo) -> bool {
        match store.label_value(SPECIAL_USE_KEY) {
            None => true,
            Some(use_) => self.allowed_uses.iter().any(|u| u == use_),
        }
    }
}

impl Filter for SpecialUseFilter {
    fn name(&self) -> &'static str {
        "special-use-filter"
    }

    fn source(&self, _: &ScheduleConfig, store: &StoreInfo) -> bool {
        self.pass(store)
    }

    fn target(&self, _: &ScheduleConfig, store: &StoreInfo) -> bool {
        self.pass(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{NodeState, StoreLabel, StoreMeta};
    use std::time::Instant;

    fn store(id: StoreId) -> Arc<StoreInfo> {
        Arc::new(
            StoreInfo::new(StoreMeta::new(id, format!("s{id}")))
                .with_state(NodeState::Serving)
                .with_last_heartbeat(Instant::now()),
        )
    }

    fn labelled(id: StoreId, labels: &[(&str, &str)]) -> Arc<StoreInfo> {
        Arc::new(store(id).with_labels(
            labels
                .iter()
                .map(|(k, v)| StoreLabel {
                    key: k.to_string(),
                    value: v.to_string(),
                })
                .collect(),
        ))
    }

    #[test]
    fn state_filter_rejects_disconnected_target() {
        let cfg = ScheduleConfig::default();
        let filter = StoreStateFilter {
            move_region: true,
            ..Default::default()
        };
        let healthy = store(1);
        assert!(filter.target(&cfg, &healthy));

        let silent = StoreInfo::new(StoreMeta::new(2, "s2")).with_state(NodeState::Serving);
        assert!(filter.source(&cfg, &silent));
        assert!(!filter.target(&cfg, &silent));
    }

    #[test]
    fn state_filter_rejects_removing_target_but_keeps_source() {
        let cfg = ScheduleConfig::default();
        let filter = StoreStateFilter {
            move_region: true,
            ..Default::default()
        };
        let removing = Arc::new(store(1).with_state(NodeState::Removing {
            physically_destroyed: false,
        }));
        assert!(filter.source(&cfg, &removing));
        assert!(!filter.target(&cfg, &removing));
    }

    #[test]
    fn paused_leader_transfer_blocks_both_directions() {
        let cfg = ScheduleConfig::default();
        let filter = StoreStateFilter {
            transfer_leader: true,
            ..Default::default()
        };
        let paused = Arc::new(store(1).with_pause_leader_transfer(true));
        assert!(!filter.source(&cfg, &paused));
        assert!(!filter.target(&cfg, &paused));
    }

    #[test]
    fn distinct_score_safeguard_refuses_worse_zone() {
        let labels = vec!["zone".to_string()];
        let s1 = labelled(1, &[("zone", "z1")]);
        let s2 = labelled(2, &[("zone", "z2")]);
        let s3 = labelled(3, &[("zone", "z3")]);
        let s4 = labelled(4, &[("zone", "z2")]);
        let region_stores = vec![s1.clone(), s2.clone(), s3.clone()];
        // Replacing the z3 store...
        let filter = DistinctScoreFilter::safeguard(labels, region_stores, &s3);
        let cfg = ScheduleConfig::default();
        // ...with another z2 store stacks two replicas in one zone.
        assert!(!filter.target(&cfg, &s4));
        let s5 = labelled(5, &[("zone", "z4")]);
        assert!(filter.target(&cfg, &s5));
    }

    #[test]
    fn engine_and_special_use_fence_off_dedicated_stores() {
        let cfg = ScheduleConfig::default();
        let ordinary = store(1);
        let dedicated = labelled(2, &[("engine", "columnar")]);
        let reserved = labelled(3, &[("specialUse", "reserved")]);

        let engine = EngineFilter {
            allowed_engines: vec![],
        };
        assert!(engine.target(&cfg, &ordinary));
        assert!(!engine.target(&cfg, &dedicated));

        let special = SpecialUseFilter { allowed_uses: vec![] };
        assert!(special.target(&cfg, &ordinary));
        assert!(!special.target(&cfg, &reserved));
    }

    #[test]
    fn select_helpers_apply_whole_pipeline() {
        let cfg = ScheduleConfig::default();
        let stores = vec![store(1), store(2), store(3)];
        let filters: Vec<Box<dyn Filter>> = vec![
            Box::new(StoreStateFilter::default()),
            Box::new(ExcludedFilter::targets_only([2].into_iter().collect())),
        ];
        let targets = select_target_stores(&stores, &filters, &cfg);
        assert_eq!(targets.len(), 2);
        assert!(targets.iter().all(|s| s.id() != 2));
    }
}
