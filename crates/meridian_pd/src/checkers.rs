//! Repair checkers: turn a (region, fit) pair into at most one corrective
//! operator, plus the suspect bookkeeping the patrol loop consumes.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::cluster::BasicCluster;
use crate::config::{ReplicationConfig, ScheduleConfig};
use crate::error::Result;
use crate::filters::{
    distinct_score, select_target_stores, EngineFilter, ExcludedFilter, Filter,
    LabelConstraintFilter, SpecialUseFilter, StoreStateFilter, StorageThresholdFilter,
};
use crate::id_alloc::IdAllocator;
use crate::operator::{OpKind, OpPriority, OpStep, Operator};
use crate::region::{Peer, PeerId, RegionEpoch, RegionId, RegionInfo};
use crate::rules::{RegionFit, Rule, RuleManager, RuleRole};
use crate::store::{StoreId, StoreInfo};

/// Move-peer step sequence: stage a learner, promote it, shift leadership
/// off the outgoing store if needed, then drop the old peer.
fn move_peer_steps(
    region: &RegionInfo,
    old_store: StoreId,
    new_store: StoreId,
    new_peer_id: PeerId,
) -> Vec<OpStep> {
    let mut steps = vec![
        OpStep::AddLearner {
            store_id: new_store,
            peer_id: new_peer_id,
        },
        OpStep::PromoteLearner {
            store_id: new_store,
            peer_id: new_peer_id,
        },
    ];
    if region.leader_store_id() == Some(old_store) {
        steps.push(OpStep::TransferLeader {
            from_store: old_store,
            to_store: new_store,
        });
    }
    steps.push(OpStep::RemovePeer {
        store_id: old_store,
    });
    steps
}

fn stores_map(cluster: &BasicCluster) -> HashMap<StoreId, Arc<StoreInfo>> {
    cluster
        .get_stores()
        .into_iter()
        .map(|s| (s.id(), s))
        .collect()
}

/// Cache key for a clean rule-check verdict; any mismatch re-runs the fit.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RuleCheckKey {
    epoch: RegionEpoch,
    rule_version: u64,
    down_peers: Vec<PeerId>,
    leader_store: Option<StoreId>,
}

impl RuleCheckKey {
    fn of(region: &RegionInfo, rule_version: u64) -> Self {
        let mut down_peers: Vec<PeerId> = region.down_peers.iter().map(|d| d.peer.id).collect();
        down_peers.sort_unstable();
        Self {
            epoch: region.epoch,
            rule_version,
            down_peers,
            leader_store: region.leader_store_id(),
        }
    }
}

pub struct CheckerController {
    cluster: Arc<BasicCluster>,
    rule_manager: Arc<RuleManager>,
    id_alloc: Arc<IdAllocator>,
    cfg: ScheduleConfig,
    replication: ReplicationConfig,
    suspect_regions: Mutex<BTreeSet<RegionId>>,
    suspect_ranges: Mutex<VecDeque<(Vec<u8>, Vec<u8>)>>,
    waiting_regions: Mutex<BTreeSet<RegionId>>,
    /// Regions that currently lack enough stores to repair.
    pending_regions: Mutex<HashSet<RegionId>>,
    clean_cache: Mutex<HashMap<RegionId, RuleCheckKey>>,
    recent_splits: Mutex<HashMap<RegionId, Instant>>,
}

impl CheckerController {
    pub fn new(
        cluster: Arc<BasicCluster>,
        rule_manager: Arc<RuleManager>,
        id_alloc: Arc<IdAllocator>,
        cfg: ScheduleConfig,
        replication: ReplicationConfig,
    ) -> Self {
        Self {
            cluster,
            rule_manager,
            id_alloc,
            cfg,
            replication,
            suspect_regions: Mutex::new(BTreeSet::new()),
            suspect_ranges: Mutex::new(VecDeque::new()),
            waiting_regions: Mutex::new(BTreeSet::new()),
            pending_regions: Mutex::new(HashSet::new()),
            clean_cache: Mutex::new(HashMap::new()),
            recent_splits: Mutex::new(HashMap::new()),
        }
    }

    // Suspect bookkeeping.

    pub fn add_suspect_regions(&self, ids: impl IntoIterator<Item = RegionId>) {
        let mut suspects = self.suspect_regions.lock().unwrap_or_else(|e| e.into_inner());
        suspects.extend(ids);
    }

    pub fn get_suspect_regions(&self) -> Vec<RegionId> {
        self.suspect_regions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .copied()
            .collect()
    }

    pub fn remove_suspect_region(&self, id: RegionId) {
        self.suspect_regions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    pub fn add_suspect_key_range(&self, start: Vec<u8>, end: Vec<u8>) {
        self.suspect_ranges
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back((start, end));
    }

    pub fn pop_one_suspect_key_range(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        self.suspect_ranges
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    pub fn clear_suspect_key_ranges(&self) {
        self.suspect_ranges
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn add_waiting_region(&self, id: RegionId) {
        self.waiting_regions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id);
    }

    pub fn get_waiting_regions(&self) -> Vec<RegionId> {
        self.waiting_regions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .copied()
            .collect()
    }

    pub fn remove_waiting_region(&self, id: RegionId) {
        self.waiting_regions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    pub fn pending_region_count(&self) -> usize {
        self.pending_regions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Remember a split so the merge checker leaves both sides alone for
    /// `split-merge-interval`.
    pub fn record_split(&self, ids: impl IntoIterator<Item = RegionId>) {
        let mut splits = self.recent_splits.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        for id in ids {
            splits.insert(id, now);
        }
    }

    fn recently_split(&self, id: RegionId) -> bool {
        let mut splits = self.recent_splits.lock().unwrap_or_else(|e| e.into_inner());
        let interval = self.cfg.split_merge_interval;
        splits.retain(|_, at| at.elapsed() < interval);
        splits.contains_key(&id)
    }

    /// Run every checker against one region. At most one operator results,
    /// except for merges which pair the two sides.
    pub async fn check_region(&self, region: &RegionInfo) -> Result<Vec<Operator>> {
        if let Some(op) = self.check_joint_state(region) {
            return Ok(vec![op]);
        }
        if let Some(op) = self.check_rule_boundary_split(region) {
            return Ok(vec![op]);
        }
        if self.rule_manager.is_enabled() {
            if let Some(op) = self.check_rules(region).await? {
                return Ok(vec![op]);
            }
        } else if let Some(op) = self.check_replicas(region).await? {
            return Ok(vec![op]);
        }
        Ok(self.check_merge(region))
    }

    // Joint-state checker: finalise any region stuck mid ChangePeerV2.

    fn check_joint_state(&self, region: &RegionInfo) -> Option<Operator> {
        if !region.in_joint_state() {
            return None;
        }
        Some(
            Operator::new(
                "fix-joint-state",
                region,
                OpKind::Replica,
                vec![OpStep::ChangePeerV2Leave],
            )
            .with_priority(OpPriority::High),
        )
    }

    // Split checker: a region straddling a rule boundary must split before
    // the rules can be evaluated per range.

    fn check_rule_boundary_split(&self, region: &RegionInfo) -> Option<Operator> {
        let keys = self
            .rule_manager
            .get_split_keys(&region.start_key, &region.end_key);
        if keys.is_empty() {
            return None;
        }
        Some(Operator::new(
            "split-rule-boundary",
            region,
            OpKind::Region,
            vec![OpStep::SplitRegion { split_keys: keys }],
        ))
    }

    // Rule checker.

    async fn check_rules(&self, region: &RegionInfo) -> Result<Option<Operator>> {
        let key = RuleCheckKey::of(region, self.rule_manager.version());
        {
            let cache = self.clean_cache.lock().unwrap_or_else(|e| e.into_inner());
            if cache.get(&region.id) == Some(&key) {
                return Ok(None);
            }
        }
        // A fresh check starts from a clean slate; the fix path re-registers
        // the region if stores are still short.
        self.pending_regions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&region.id);

        let stores = stores_map(&self.cluster);
        let fit = self.rule_manager.fit_region(region, &stores);
        let op = self.fix_rule_fit(region, &fit, &stores).await?;
        if op.is_none() {
            let still_pending = self
                .pending_regions
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .contains(&region.id);
            if !still_pending {
                self.clean_cache
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(region.id, key);
            }
        }
        Ok(op)
    }

    async fn fix_rule_fit(
        &self,
        region: &RegionInfo,
        fit: &RegionFit,
        stores: &HashMap<StoreId, Arc<StoreInfo>>,
    ) -> Result<Option<Operator>> {
        for rule_fit in &fit.rule_fits {
            // Unhealthy bound peers take precedence over missing ones: a
            // replacement both repairs and completes the rule.
            for peer in &rule_fit.peers {
                if self.is_peer_on_offline_store(peer, stores) {
                    if !self.cfg.enable_replace_offline_replica {
                        continue;
                    }
                    return self
                        .replace_peer(region, &rule_fit.rule, peer, stores, "replace-rule-offline-peer")
                        .await;
                }
                if self.is_peer_down(region, peer, stores) {
                    if !self.cfg.enable_remove_down_replica {
                        continue;
                    }
                    return self
                        .replace_peer(region, &rule_fit.rule, peer, stores, "replace-rule-down-peer")
                        .await;
                }
            }
            if rule_fit.peers.len() < rule_fit.rule.count {
                let missing =
                    rule_fit.rule.count - rule_fit.peers.len() - rule_fit.peers_with_different_role.len();
                if missing > 0 {
                    return self.add_rule_peer(region, &rule_fit.rule, stores).await;
                }
            }
            if let Some(peer) = rule_fit.peers_with_different_role.first() {
                if let Some(op) = self.fix_peer_role(region, &rule_fit.rule, peer) {
                    return Ok(Some(op));
                }
            }
        }

        // Surplus peers go only once every rule is satisfied, and never
        // while the doomed peer is pending or down.
        if !fit.orphan_peers.is_empty()
            && fit.rule_fits.iter().all(|rf| rf.is_satisfied())
            && self.cfg.enable_remove_extra_replica
        {
            for orphan in &fit.orphan_peers {
                if region.is_pending_peer(orphan.id) || region.is_down_peer(orphan.id) {
                    continue;
                }
                return Ok(Some(Operator::new(
                    "remove-orphan-peer",
                    region,
                    OpKind::Replica,
                    vec![OpStep::RemovePeer {
                        store_id: orphan.store_id,
                    }],
                )));
            }
        }

        if self.cfg.enable_location_replacement {
            if let Some(op) = self.move_to_better_location(region, fit, stores).await? {
                return Ok(Some(op));
            }
        }
        Ok(None)
    }

    async fn add_rule_peer(
        &self,
        region: &RegionInfo,
        rule: &Rule,
        stores: &HashMap<StoreId, Arc<StoreInfo>>,
    ) -> Result<Option<Operator>> {
        let Some(target) = self.select_store_to_add(region, rule, stores, None) else {
            self.pending_regions
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(region.id);
            tracing::debug!(region_id = region.id, rule = %rule.id, "no store to add rule peer");
            return Ok(None);
        };
        let peer_id = self.id_alloc.alloc().await?;
        let step = match rule.role {
            RuleRole::Learner => OpStep::AddLearner {
                store_id: target,
                peer_id,
            },
            _ => OpStep::AddPeer {
                store_id: target,
                peer_id,
            },
        };
        Ok(Some(
            Operator::new("add-rule-peer", region, OpKind::Replica, vec![step])
                .with_priority(OpPriority::High),
        ))
    }

    async fn replace_peer(
        &self,
        region: &RegionInfo,
        rule: &Rule,
        peer: &Peer,
        stores: &HashMap<StoreId, Arc<StoreInfo>>,
        desc: &str,
    ) -> Result<Option<Operator>> {
        let Some(target) = self.select_store_to_add(region, rule, stores, Some(peer.store_id))
        else {
            self.pending_regions
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(region.id);
            return Ok(None);
        };
        let peer_id = self.id_alloc.alloc().await?;
        let steps = match rule.role {
            RuleRole::Learner => vec![
                OpStep::AddLearner {
                    store_id: target,
                    peer_id,
                },
                OpStep::RemovePeer {
                    store_id: peer.store_id,
                },
            ],
            _ => move_peer_steps(region, peer.store_id, target, peer_id),
        };
        Ok(Some(
            Operator::new(desc, region, OpKind::Replica, steps).with_priority(OpPriority::High),
        ))
    }

    fn fix_peer_role(&self, region: &RegionInfo, rule: &Rule, peer: &Peer) -> Option<Operator> {
        let is_leader = region.leader_store_id() == Some(peer.store_id);
        match rule.role {
            RuleRole::Learner if peer.is_voter() => Some(Operator::new(
                "fix-demote-voter",
                region,
                OpKind::Replica,
                vec![OpStep::DemoteVoter {
                    store_id: peer.store_id,
                    peer_id: peer.id,
                }],
            )),
            RuleRole::Voter | RuleRole::Follower | RuleRole::Leader if peer.is_learner() => {
                Some(Operator::new(
                    "fix-peer-role",
                    region,
                    OpKind::Replica,
                    vec![OpStep::PromoteLearner {
                        store_id: peer.store_id,
                        peer_id: peer.id,
                    }],
                ))
            }
            RuleRole::Leader if !is_leader => Some(Operator::new(
                "fix-leader-role",
                region,
                OpKind::Leader,
                vec![OpStep::TransferLeader {
                    from_store: region.leader_store_id().unwrap_or(0),
                    to_store: peer.store_id,
                }],
            )),
            RuleRole::Follower if is_leader => {
                let target = region
                    .followers()
                    .map(|p| p.store_id)
                    .next()?;
                Some(Operator::new(
                    "fix-follower-role",
                    region,
                    OpKind::Leader,
                    vec![OpStep::TransferLeader {
                        from_store: peer.store_id,
                        to_store: target,
                    }],
                ))
            }
            _ => None,
        }
    }

    async fn move_to_better_location(
        &self,
        region: &RegionInfo,
        fit: &RegionFit,
        stores: &HashMap<StoreId, Arc<StoreInfo>>,
    ) -> Result<Option<Operator>> {
        for rule_fit in &fit.rule_fits {
            if !rule_fit.is_satisfied() || rule_fit.rule.location_labels.is_empty() {
                continue;
            }
            let coexisting: Vec<Arc<StoreInfo>> = rule_fit
                .peers
                .iter()
                .filter_map(|p| stores.get(&p.store_id).cloned())
                .collect();
            for peer in &rule_fit.peers {
                if region.is_pending_peer(peer.id) || region.is_down_peer(peer.id) {
                    continue;
                }
                let Some(source) = stores.get(&peer.store_id) else {
                    continue;
                };
                let others: Vec<Arc<StoreInfo>> = coexisting
                    .iter()
                    .filter(|s| s.id() != peer.store_id)
                    .cloned()
                    .collect();
                let current = distinct_score(&rule_fit.rule.location_labels, &others, source);
                let Some(target) =
                    self.select_store_to_add(region, &rule_fit.rule, stores, Some(peer.store_id))
                else {
                    continue;
                };
                let candidate = stores.get(&target).cloned();
                let Some(candidate) = candidate else { continue };
                let improved = distinct_score(&rule_fit.rule.location_labels, &others, &candidate);
                if improved > current {
                    let peer_id = self.id_alloc.alloc().await?;
                    return Ok(Some(Operator::new(
                        "move-to-better-location",
                        region,
                        OpKind::Replica,
                        move_peer_steps(region, peer.store_id, target, peer_id),
                    )));
                }
            }
        }
        Ok(None)
    }

    // Replica checker (classic mode).

    async fn check_replicas(&self, region: &RegionInfo) -> Result<Option<Operator>> {
        let stores = stores_map(&self.cluster);
        let max_replicas = self.replication.max_replicas;

        for peer in region.peers.clone() {
            if self.is_peer_on_offline_store(&peer, &stores)
                && self.cfg.enable_replace_offline_replica
            {
                return self
                    .replace_classic_peer(region, &peer, &stores, "replace-offline-replica")
                    .await;
            }
            if self.is_peer_down(region, &peer, &stores) && self.cfg.enable_remove_down_replica {
                return self
                    .replace_classic_peer(region, &peer, &stores, "replace-down-replica")
                    .await;
            }
        }

        let voters = region.voters().count();
        if voters < max_replicas && self.cfg.enable_make_up_replica {
            let rule = crate::rules::default_rule(&self.replication);
            let Some(target) = self.select_store_to_add(region, &rule, &stores, None) else {
                self.pending_regions
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(region.id);
                return Ok(None);
            };
            let peer_id = self.id_alloc.alloc().await?;
            return Ok(Some(
                Operator::new(
                    "make-up-replica",
                    region,
                    OpKind::Replica,
                    vec![OpStep::AddPeer {
                        store_id: target,
                        peer_id,
                    }],
                )
                .with_priority(OpPriority::High),
            ));
        }

        if voters > max_replicas && self.cfg.enable_remove_extra_replica {
            // Shed the replica with the worst isolation, never the leader
            // and never an unhealthy peer mid-recovery.
            let labels = &self.replication.location_labels;
            let region_stores: Vec<Arc<StoreInfo>> = region
                .store_ids()
                .filter_map(|id| stores.get(&id).cloned())
                .collect();
            let victim = region
                .voters()
                .filter(|p| region.leader_store_id() != Some(p.store_id))
                .filter(|p| !region.is_pending_peer(p.id) && !region.is_down_peer(p.id))
                .min_by(|a, b| {
                    let sa = stores
                        .get(&a.store_id)
                        .map(|s| distinct_score(labels, &region_stores, s))
                        .unwrap_or(0.0);
                    let sb = stores
                        .get(&b.store_id)
                        .map(|s| distinct_score(labels, &region_stores, s))
                        .unwrap_or(0.0);
                    sa.partial_cmp(&sb).unwrap_or(std::cmp::Ordering::Equal)
                });
            if let Some(victim) = victim {
                return Ok(Some(Operator::new(
                    "remove-extra-replica",
                    region,
                    OpKind::Replica,
                    vec![OpStep::RemovePeer {
                        store_id: victim.store_id,
                    }],
                )));
            }
        }
        Ok(None)
    }

    async fn replace_classic_peer(
        &self,
        region: &RegionInfo,
        peer: &Peer,
        stores: &HashMap<StoreId, Arc<StoreInfo>>,
        desc: &str,
    ) -> Result<Option<Operator>> {
        let rule = crate::rules::default_rule(&self.replication);
        let Some(target) = self.select_store_to_add(region, &rule, stores, Some(peer.store_id))
        else {
            self.pending_regions
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(region.id);
            return Ok(None);
        };
        let peer_id = self.id_alloc.alloc().await?;
        Ok(Some(
            Operator::new(
                desc,
                region,
                OpKind::Replica,
                move_peer_steps(region, peer.store_id, target, peer_id),
            )
            .with_priority(OpPriority::High),
        ))
    }

    // Merge checker.

    fn check_merge(&self, region: &RegionInfo) -> Vec<Operator> {
        if self.cfg.max_merge_region_size == 0 {
            return Vec::new();
        }
        if !self.merge_side_healthy(region) || !self.small_enough(region) {
            return Vec::new();
        }
        if self.recently_split(region.id) {
            return Vec::new();
        }

        let (prev, next) = self.cluster.get_adjacent_regions(region);
        let prev = prev.filter(|p| p.end_key == region.start_key);
        let next = next.filter(|n| !region.end_key.is_empty() && n.start_key == region.end_key);

        // Prefer absorbing into the smaller healthy neighbor.
        let mut candidates: Vec<Arc<RegionInfo>> = [prev, next].into_iter().flatten().collect();
        candidates.retain(|c| self.merge_side_healthy(c) && !self.recently_split(c.id));
        candidates.sort_by_key(|c| c.approximate_size);
        let Some(target) = candidates.into_iter().next() else {
            return Vec::new();
        };

        // Both sides must live under one rule regime after the merge.
        let merged_start = region.start_key.clone().min(target.start_key.clone());
        let merged_end = if region.end_key.is_empty() || target.end_key.is_empty() {
            Vec::new()
        } else {
            region.end_key.clone().max(target.end_key.clone())
        };
        if !self
            .rule_manager
            .get_split_keys(&merged_start, &merged_end)
            .is_empty()
        {
            return Vec::new();
        }

        let source_op = Operator::new(
            "merge-region",
            region,
            OpKind::Merge,
            vec![OpStep::MergeRegion {
                from_region: region.id,
                target_region: target.id,
                is_passive: true,
            }],
        );
        let target_op = Operator::new(
            "merge-region",
            &target,
            OpKind::Merge,
            vec![OpStep::MergeRegion {
                from_region: region.id,
                target_region: target.id,
                is_passive: false,
            }],
        );
        vec![source_op, target_op]
    }

    fn small_enough(&self, region: &RegionInfo) -> bool {
        region.approximate_size > 0
            && region.approximate_size < self.cfg.max_merge_region_size
            && region.approximate_keys < self.cfg.max_merge_region_keys
    }

    fn merge_side_healthy(&self, region: &RegionInfo) -> bool {
        region.leader.is_some()
            && region.down_peers.is_empty()
            && region.pending_peers.is_empty()
            && !region.in_joint_state()
    }

    // Shared predicates and target selection.

    fn is_peer_down(
        &self,
        region: &RegionInfo,
        peer: &Peer,
        stores: &HashMap<StoreId, Arc<StoreInfo>>,
    ) -> bool {
        let store_down = match stores.get(&peer.store_id) {
            None => true,
            Some(store) => store.is_down(self.cfg.max_store_down_time),
        };
        let reported_down = region.down_peers.iter().any(|d| {
            d.peer.id == peer.id && d.down_seconds >= self.cfg.max_store_down_time.as_secs()
        });
        store_down || reported_down
    }

    fn is_peer_on_offline_store(
        &self,
        peer: &Peer,
        stores: &HashMap<StoreId, Arc<StoreInfo>>,
    ) -> bool {
        match stores.get(&peer.store_id) {
            None => false,
            Some(store) => store.is_removing() || store.is_removed(),
        }
    }

    fn select_store_to_add(
        &self,
        region: &RegionInfo,
        rule: &Rule,
        stores: &HashMap<StoreId, Arc<StoreInfo>>,
        replacing: Option<StoreId>,
    ) -> Option<StoreId> {
        let all: Vec<Arc<StoreInfo>> = stores.values().cloned().collect();
        let mut excluded: HashSet<StoreId> = region.store_ids().collect();
        if let Some(old) = replacing {
            excluded.insert(old);
        }
        let filters: Vec<Box<dyn Filter>> = vec![
            Box::new(StoreStateFilter {
                move_region: true,
                ..Default::default()
            }),
            Box::new(ExcludedFilter::targets_only(excluded)),
            Box::new(StorageThresholdFilter),
            Box::new(LabelConstraintFilter {
                constraints: rule.label_constraints.clone(),
            }),
            Box::new(EngineFilter {
                allowed_engines: vec![],
            }),
            Box::new(SpecialUseFilter {
                allowed_uses: vec![],
            }),
        ];
        let candidates = select_target_stores(&all, &filters, &self.cfg);

        // Coexisting replicas minus the one being replaced.
        let coexisting: Vec<Arc<StoreInfo>> = region
            .store_ids()
            .filter(|id| Some(*id) != replacing)
            .filter_map(|id| stores.get(&id).cloned())
            .collect();
        candidates
            .into_iter()
            .max_by(|a, b| {
                let score_a = distinct_score(&rule.location_labels, &coexisting, a);
                let score_b = distinct_score(&rule.location_labels, &coexisting, b);
                score_a
                    .partial_cmp(&score_b)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    // Lower region score wins the tie: emptier store.
                    .then_with(|| {
                        b.region_score(self.cfg.high_space_ratio, self.cfg.low_space_ratio, 0)
                            .partial_cmp(&a.region_score(
                                self.cfg.high_space_ratio,
                                self.cfg.low_space_ratio,
                                0,
                            ))
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
            })
            .map(|s| s.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{NodeState, StoreLabel, StoreMeta};
    use meridian_meta::MemStore;

    struct Harness {
        cluster: Arc<BasicCluster>,
        checker: CheckerController,
    }

    fn harness(enable_rules: bool) -> Harness {
        let cluster = Arc::new(BasicCluster::new());
        let replication = ReplicationConfig {
            enable_placement_rules: enable_rules,
            location_labels: vec!["zone".into()],
            ..Default::default()
        };
        let rule_manager = Arc::new(RuleManager::new(&replication));
        let id_alloc = Arc::new(IdAllocator::new(
            Arc::new(MemStore::new()),
            "/1/alloc_id".into(),
        ));
        let checker = CheckerController::new(
            Arc::clone(&cluster),
            rule_manager,
            id_alloc,
            ScheduleConfig::default(),
            replication,
        );
        Harness { cluster, checker }
    }

    fn add_store(h: &Harness, id: StoreId, zone: &str) {
        let store = StoreInfo::new(StoreMeta::new(id, format!("s{id}")))
            .with_state(NodeState::Serving)
            .with_labels(vec![StoreLabel {
                key: "zone".into(),
                value: zone.into(),
            }])
            .with_last_heartbeat(Instant::now());
        h.cluster.put_store(store);
    }

    fn add_region(h: &Harness, id: RegionId, start: &[u8], end: &[u8], stores: &[StoreId]) -> RegionInfo {
        let peers: Vec<Peer> = stores
            .iter()
            .enumerate()
            .map(|(i, &s)| Peer::voter(id * 100 + i as u64 + 1, s))
            .collect();
        let mut region = RegionInfo::new(id, start.to_vec(), end.to_vec(), peers.clone());
        region.leader = peers.first().copied();
        region.epoch = RegionEpoch::new(1, 1);
        region.approximate_size = 10;
        h.cluster.put_region(region.clone());
        region
    }

    #[tokio::test]
    async fn adds_missing_rule_peer() {
        let h = harness(true);
        for (id, zone) in [(1, "z1"), (2, "z2"), (3, "z3")] {
            add_store(&h, id, zone);
        }
        let region = add_region(&h, 1, b"", b"", &[1, 2]);
        let ops = h.checker.check_region(&region).await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].desc, "add-rule-peer");
        assert!(matches!(
            ops[0].steps[0],
            OpStep::AddPeer { store_id: 3, .. }
        ));
    }

    #[tokio::test]
    async fn no_store_available_goes_to_pending_list() {
        let h = harness(true);
        add_store(&h, 1, "z1");
        add_store(&h, 2, "z2");
        let region = add_region(&h, 1, b"", b"", &[1, 2]);
        let ops = h.checker.check_region(&region).await.unwrap();
        assert!(ops.is_empty());
        assert_eq!(h.checker.pending_region_count(), 1);
    }

    #[tokio::test]
    async fn removes_orphan_only_when_rules_satisfied_and_peer_healthy() {
        let h = harness(true);
        for (id, zone) in [(1, "z1"), (2, "z2"), (3, "z3"), (4, "z4")] {
            add_store(&h, id, zone);
        }
        let region = add_region(&h, 1, b"", b"", &[1, 2, 3, 4]);
        let ops = h.checker.check_region(&region).await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].desc, "remove-orphan-peer");

        // The same surplus peer pending: no removal.
        let orphan_peer = match ops[0].steps[0] {
            OpStep::RemovePeer { store_id } => region.get_store_peer(store_id).copied().unwrap(),
            _ => panic!("expected remove step"),
        };
        let pending = region.with_pending_peers(vec![orphan_peer]);
        h.cluster.put_region(pending.clone());
        let ops = h.checker.check_region(&pending).await.unwrap();
        assert!(ops.iter().all(|op| op.desc != "remove-orphan-peer"));
    }

    #[tokio::test]
    async fn replaces_peer_on_offline_store() {
        let h = harness(true);
        for (id, zone) in [(1, "z1"), (2, "z2"), (3, "z3"), (4, "z4")] {
            add_store(&h, id, zone);
        }
        let region = add_region(&h, 1, b"", b"", &[1, 2, 3]);
        // Store 3 starts draining.
        let store3 = h.cluster.get_store(3).unwrap();
        h.cluster.put_store(store3.with_state(NodeState::Removing {
            physically_destroyed: false,
        }));

        let ops = h.checker.check_region(&region).await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].desc, "replace-rule-offline-peer");
        assert!(matches!(
            ops[0].steps[0],
            OpStep::AddLearner { store_id: 4, .. }
        ));
        assert!(matches!(
            *ops[0].steps.last().unwrap(),
            OpStep::RemovePeer { store_id: 3 }
        ));
    }

    #[tokio::test]
    async fn clean_region_verdict_is_cached() {
        let h = harness(true);
        for (id, zone) in [(1, "z1"), (2, "z2"), (3, "z3")] {
            add_store(&h, id, zone);
        }
        let region = add_region(&h, 1, b"", b"", &[1, 2, 3]);
        assert!(h.checker.check_region(&region).await.unwrap().is_empty());
        {
            let cache = h.checker.clean_cache.lock().unwrap();
            assert!(cache.contains_key(&1));
        }
        // An epoch change invalidates the cached verdict.
        let bumped = region.with_epoch(RegionEpoch::new(2, 1));
        h.cluster.put_region(bumped.clone());
        assert!(h.checker.check_region(&bumped).await.unwrap().is_empty());
        let cache = h.checker.clean_cache.lock().unwrap();
        assert_eq!(cache.get(&1).unwrap().epoch, RegionEpoch::new(2, 1));
    }

    #[tokio::test]
    async fn joint_state_is_finalised_first() {
        let h = harness(true);
        for (id, zone) in [(1, "z1"), (2, "z2"), (3, "z3")] {
            add_store(&h, id, zone);
        }
        let mut region = add_region(&h, 1, b"", b"", &[1, 2, 3]);
        region.peers[2].role = crate::region::PeerRole::DemotingVoter;
        let ops = h.checker.check_region(&region).await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].desc, "fix-joint-state");
        assert_eq!(ops[0].steps, vec![OpStep::ChangePeerV2Leave]);
    }

    #[tokio::test]
    async fn classic_mode_makes_up_replicas() {
        let h = harness(false);
        for (id, zone) in [(1, "z1"), (2, "z2"), (3, "z3")] {
            add_store(&h, id, zone);
        }
        let region = add_region(&h, 1, b"", b"", &[1]);
        let ops = h.checker.check_region(&region).await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].desc, "make-up-replica");
    }

    #[tokio::test]
    async fn small_adjacent_regions_merge_into_smaller_neighbor() {
        let h = harness(true);
        for (id, zone) in [(1, "z1"), (2, "z2"), (3, "z3")] {
            add_store(&h, id, zone);
        }
        let mut left = add_region(&h, 1, b"", b"g", &[1, 2, 3]);
        left.approximate_size = 5;
        h.cluster.put_region(left.clone());
        let mut mid = add_region(&h, 2, b"g", b"p", &[1, 2, 3]);
        mid.approximate_size = 4;
        h.cluster.put_region(mid.clone());
        let mut right = add_region(&h, 3, b"p", b"", &[1, 2, 3]);
        right.approximate_size = 100;
        h.cluster.put_region(right.clone());

        let ops = h.checker.check_region(&mid).await.unwrap();
        assert_eq!(ops.len(), 2);
        match &ops[0].steps[0] {
            OpStep::MergeRegion {
                from_region,
                target_region,
                is_passive,
            } => {
                assert_eq!(*from_region, 2);
                assert_eq!(*target_region, 1);
                assert!(*is_passive);
            }
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[tokio::test]
    async fn recent_split_blocks_merge() {
        let h = harness(true);
        for (id, zone) in [(1, "z1"), (2, "z2"), (3, "z3")] {
            add_store(&h, id, zone);
        }
        let mut left = add_region(&h, 1, b"", b"g", &[1, 2, 3]);
        left.approximate_size = 5;
        h.cluster.put_region(left.clone());
        let mut mid = add_region(&h, 2, b"g", b"", &[1, 2, 3]);
        mid.approximate_size = 4;
        h.cluster.put_region(mid.clone());

        h.checker.record_split([1, 2]);
        assert!(h.checker.check_region(&mid).await.unwrap().is_empty());
    }
}
