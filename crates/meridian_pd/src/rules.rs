//! Declarative placement rules and the fit engine.
//!
//! Rules in the same group merge by ascending index; an `override` rule
//! discards the lower-index rules of its group. `fit_region` binds each
//! region peer to at most one rule and scores how well the binding isolates
//! replicas across the configured location labels. Checkers compare fits to
//! refuse replacements that would regress placement.

use std::collections::{BTreeMap, HashMap};
use std::cmp::Ordering;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::config::ReplicationConfig;
use crate::error::{Error, Result};
use crate::region::{Peer, RegionInfo};
use crate::store::{validate_labels, StoreId, StoreInfo, StoreLabel};

/// The built-in rule group every cluster starts with.
pub const DEFAULT_GROUP: &str = "pd";
pub const DEFAULT_RULE_ID: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LabelConstraintOp {
    In,
    NotIn,
    Exists,
    NotExists,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelConstraint {
    pub key: String,
    pub op: LabelConstraintOp,
    #[serde(default)]
    pub values: Vec<String>,
}

impl LabelConstraint {
    pub fn matches(&self, store: &StoreInfo) -> bool {
        let value = store.label_value(&self.key);
        match self.op {
            LabelConstraintOp::In => {
                value.map_or(false, |v| self.values.iter().any(|x| x == v))
            }
            LabelConstraintOp::NotIn => {
                value.map_or(true, |v| !self.values.iter().any(|x| x == v))
            }
            LabelConstraintOp::Exists => value.is_some(),
            LabelConstraintOp::NotExists => value.is_none(),
        }
    }
}

pub fn match_label_constraints(store: &StoreInfo, constraints: &[LabelConstraint]) -> bool {
    constraints.iter().all(|c| c.matches(store))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleRole {
    Voter,
    Leader,
    Follower,
    Learner,
}

impl RuleRole {
    /// Whether a peer currently playing `(is_voter, is_leader)` can satisfy
    /// this role without a role-change step.
    pub fn accepts(&self, peer: &Peer, is_leader: bool) -> bool {
        match self {
            RuleRole::Voter => peer.is_voter(),
            RuleRole::Leader => peer.is_voter() && is_leader,
            RuleRole::Follower => peer.is_voter() && !is_leader,
            RuleRole::Learner => peer.is_learner(),
        }
    }
}

/// One placement clause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub group_id: String,
    pub id: String,
    #[serde(default)]
    pub index: u32,
    #[serde(default, rename = "override")]
    pub override_: bool,
    #[serde(default)]
    pub start_key: Vec<u8>,
    #[serde(default)]
    pub end_key: Vec<u8>,
    pub role: RuleRole,
    pub count: usize,
    #[serde(default)]
    pub label_constraints: Vec<LabelConstraint>,
    #[serde(default)]
    pub location_labels: Vec<String>,
    #[serde(default)]
    pub isolation_level: String,
}

impl Rule {
    pub fn key(&self) -> (String, String) {
        (self.group_id.clone(), self.id.clone())
    }

    pub fn applies_to(&self, region: &RegionInfo) -> bool {
        region.overlaps(&self.start_key, &self.end_key)
            || (self.start_key.is_empty() && self.end_key.is_empty())
    }

    fn validate(&self) -> Result<()> {
        if self.group_id.is_empty() || self.id.is_empty() {
            return Err(Error::InvalidRule("empty group or id".into()));
        }
        if self.count == 0 {
            return Err(Error::InvalidRule("count must be positive".into()));
        }
        if self.role == RuleRole::Leader && self.count != 1 {
            return Err(Error::InvalidRule("leader rule must have count 1".into()));
        }
        let labels: Vec<StoreLabel> = self
            .label_constraints
            .iter()
            .flat_map(|c| {
                c.values.iter().map(|v| StoreLabel {
                    key: c.key.clone(),
                    value: v.clone(),
                })
            })
            .collect();
        validate_labels(&labels).map_err(|e| Error::InvalidRule(e.to_string()))
    }
}

/// Default rule derived from the replication config.
pub fn default_rule(replication: &ReplicationConfig) -> Rule {
    Rule {
        group_id: DEFAULT_GROUP.to_string(),
        id: DEFAULT_RULE_ID.to_string(),
        index: 0,
        override_: false,
        start_key: Vec::new(),
        end_key: Vec::new(),
        role: RuleRole::Voter,
        count: replication.max_replicas,
        label_constraints: Vec::new(),
        location_labels: replication.location_labels.clone(),
        isolation_level: replication.isolation_level.clone(),
    }
}

/// Binding of peers to one rule.
#[derive(Debug, Clone)]
pub struct RuleFit {
    pub rule: Rule,
    pub peers: Vec<Peer>,
    /// Lexicographic isolation score over the rule's location labels,
    /// outermost level most significant.
    pub isolation_score: f64,
    /// Peers bound with a role mismatch (satisfiable via a role fix).
    pub peers_with_different_role: Vec<Peer>,
}

impl RuleFit {
    pub fn is_satisfied(&self) -> bool {
        self.peers.len() == self.rule.count && self.peers_with_different_role.is_empty()
    }
}

/// Verdict for a whole region.
#[derive(Debug, Clone)]
pub struct RegionFit {
    pub rule_fits: Vec<RuleFit>,
    /// Peers no rule claimed.
    pub orphan_peers: Vec<Peer>,
}

impl RegionFit {
    pub fn is_satisfied(&self) -> bool {
        !self.rule_fits.is_empty()
            && self.rule_fits.iter().all(|rf| rf.is_satisfied())
            && self.orphan_peers.is_empty()
    }

    pub fn rule_fit(&self, group_id: &str, id: &str) -> Option<&RuleFit> {
        self.rule_fits
            .iter()
            .find(|rf| rf.rule.group_id == group_id && rf.rule.id == id)
    }
}

/// `Greater` when `new` places the region strictly better than `old`,
/// `Equal` when neither regresses; checkers reject `Less`.
pub fn compare_region_fit(new: &RegionFit, old: &RegionFit) -> Ordering {
    for (new_rf, old_rf) in new.rule_fits.iter().zip(old.rule_fits.iter()) {
        match new_rf.peers.len().cmp(&old_rf.peers.len()) {
            Ordering::Equal => {}
            other => return other,
        }
        match new_rf
            .isolation_score
            .partial_cmp(&old_rf.isolation_score)
            .unwrap_or(Ordering::Equal)
        {
            Ordering::Equal => {}
            other => return other,
        }
    }
    // Fewer orphans is better.
    old.orphan_peers.len().cmp(&new.orphan_peers.len())
}

/// Lexicographic isolation score: at each label level (outermost first) the
/// number of distinct locations among `stores`, folded base-1024 so an
/// outer-level improvement always dominates.
fn isolation_score(stores: &[&StoreInfo], location_labels: &[String]) -> f64 {
    if location_labels.is_empty() || stores.len() <= 1 {
        return 0.0;
    }
    let mut score = 0.0;
    for depth in 1..=location_labels.len() {
        let mut prefixes: Vec<Vec<&str>> = Vec::new();
        for store in stores {
            let prefix: Vec<&str> = location_labels[..depth]
                .iter()
                .map(|k| store.label_value(k).unwrap_or(""))
                .collect();
            if !prefixes.contains(&prefix) {
                prefixes.push(prefix);
            }
        }
        score = score * 1024.0 + prefixes.len() as f64;
    }
    score
}

/// Stores satisfy `isolation_level` when every pair differs at or before
/// that label.
fn satisfies_isolation_level(
    stores: &[&StoreInfo],
    location_labels: &[String],
    isolation_level: &str,
) -> bool {
    if isolation_level.is_empty() {
        return true;
    }
    let Some(level) = location_labels.iter().position(|l| l == isolation_level) else {
        return true;
    };
    for (i, a) in stores.iter().enumerate() {
        for b in stores.iter().skip(i + 1) {
            match a.compare_location(b, location_labels) {
                Some(diff) if diff <= level => {}
                // Same location through the isolation level.
                _ => return false,
            }
        }
    }
    true
}

/// Merge rule groups: within a group ascending by index, an `override` rule
/// discards what came before it in that group.
pub fn prepare_rules_for_apply(mut rules: Vec<Rule>) -> Vec<Rule> {
    rules.sort_by(|a, b| {
        a.group_id
            .cmp(&b.group_id)
            .then(a.index.cmp(&b.index))
            .then(a.id.cmp(&b.id))
    });
    let mut out: Vec<Rule> = Vec::with_capacity(rules.len());
    for rule in rules {
        if rule.override_ {
            out.retain(|r| r.group_id != rule.group_id);
        }
        out.push(rule);
    }
    out
}

/// Bind region peers to rules.
///
/// Greedy, rule-priority order: each rule takes the healthiest matching
/// peers that maximise location diversity; a peer binds at most once. Peers
/// whose role mismatches but could be converted are tracked separately so
/// the checker can emit role fixes instead of replacements.
pub fn fit_region(
    region: &RegionInfo,
    stores: &HashMap<StoreId, Arc<StoreInfo>>,
    rules: &[Rule],
) -> RegionFit {
    let applicable: Vec<&Rule> = rules.iter().filter(|r| r.applies_to(region)).collect();
    let mut unbound: Vec<Peer> = region.peers.clone();
    let mut rule_fits = Vec::with_capacity(applicable.len());

    for rule in applicable {
        let mut exact: Vec<Peer> = Vec::new();
        let mut convertible: Vec<Peer> = Vec::new();
        for peer in &unbound {
            let Some(store) = stores.get(&peer.store_id) else {
                continue;
            };
            if !match_label_constraints(store, &rule.label_constraints) {
                continue;
            }
            let is_leader = region.leader_store_id() == Some(peer.store_id);
            if rule.role.accepts(peer, is_leader) {
                exact.push(*peer);
            } else {
                convertible.push(*peer);
            }
        }

        // Prefer healthy peers, then maximise isolation greedily.
        let mut selected: Vec<Peer> = Vec::new();
        let mut pool = exact;
        pool.sort_by_key(|p| {
            (region.is_down_peer(p.id), region.is_pending_peer(p.id), p.id)
        });
        while selected.len() < rule.count && !pool.is_empty() {
            let mut best = 0;
            let mut best_score = f64::MIN;
            for (i, candidate) in pool.iter().enumerate() {
                let mut chosen: Vec<&StoreInfo> = selected
                    .iter()
                    .chain(std::iter::once(candidate))
                    .filter_map(|p| stores.get(&p.store_id).map(|s| s.as_ref()))
                    .collect();
                chosen.dedup_by_key(|s| s.id());
                let score = isolation_score(&chosen, &rule.location_labels);
                if score > best_score {
                    best_score = score;
                    best = i;
                }
            }
            selected.push(pool.remove(best));
        }

        let mut peers_with_different_role = Vec::new();
        if selected.len() < rule.count {
            // Fill with role-mismatched matches; the checker will fix roles.
            convertible.sort_by_key(|p| p.id);
            for peer in convertible {
                if selected.len() + peers_with_different_role.len() >= rule.count {
                    break;
                }
                peers_with_different_role.push(peer);
            }
        }

        let chosen_stores: Vec<&StoreInfo> = selected
            .iter()
            .filter_map(|p| stores.get(&p.store_id).map(|s| s.as_ref()))
            .collect();
        let mut score = isolation_score(&chosen_stores, &rule.location_labels);
        if !satisfies_isolation_level(&chosen_stores, &rule.location_labels, &rule.isolation_level)
        {
            score = -1.0;
        }

        for peer in selected.iter().chain(peers_with_different_role.iter()) {
            unbound.retain(|p| p.id != peer.id);
        }
        rule_fits.push(RuleFit {
            rule: rule.clone(),
            peers: selected,
            isolation_score: score,
            peers_with_different_role,
        });
    }

    RegionFit {
        rule_fits,
        orphan_peers: unbound,
    }
}

struct RuleInner {
    rules: BTreeMap<(String, String), Rule>,
    version: u64,
    enabled: bool,
}

/// Owns the rule table. Version bumps on every change so checker caches can
/// invalidate.
pub struct RuleManager {
    inner: RwLock<RuleInner>,
}

impl RuleManager {
    pub fn new(replication: &ReplicationConfig) -> Self {
        let mut rules = BTreeMap::new();
        let rule = default_rule(replication);
        rules.insert(rule.key(), rule);
        Self {
            inner: RwLock::new(RuleInner {
                rules,
                version: 0,
                enabled: replication.enable_placement_rules,
            }),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RuleInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RuleInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_enabled(&self) -> bool {
        self.read().enabled
    }

    pub fn version(&self) -> u64 {
        self.read().version
    }

    pub fn set_rule(&self, rule: Rule) -> Result<()> {
        rule.validate()?;
        let mut inner = self.write();
        inner.rules.insert(rule.key(), rule);
        inner.version += 1;
        Ok(())
    }

    pub fn delete_rule(&self, group_id: &str, id: &str) -> Result<()> {
        let mut inner = self.write();
        if group_id == DEFAULT_GROUP && id == DEFAULT_RULE_ID && inner.rules.len() == 1 {
            return Err(Error::InvalidRule(
                "cannot delete the last default rule".into(),
            ));
        }
        inner
            .rules
            .remove(&(group_id.to_string(), id.to_string()))
            .ok_or_else(|| Error::InvalidRule(format!("rule {group_id}/{id} not found")))?;
        inner.version += 1;
        Ok(())
    }

    /// Replace the whole table (startup load from the MetaStore).
    pub fn load_rules(&self, rules: Vec<Rule>) -> Result<()> {
        for rule in &rules {
            rule.validate()?;
        }
        let mut inner = self.write();
        inner.rules = rules.into_iter().map(|r| (r.key(), r)).collect();
        inner.version += 1;
        Ok(())
    }

    pub fn get_rules(&self) -> Vec<Rule> {
        self.read().rules.values().cloned().collect()
    }

    /// Merged rule list in application order.
    pub fn rules_for_apply(&self) -> Vec<Rule> {
        prepare_rules_for_apply(self.get_rules())
    }

    pub fn fit_region(
        &self,
        region: &RegionInfo,
        stores: &HashMap<StoreId, Arc<StoreInfo>>,
    ) -> RegionFit {
        fit_region(region, stores, &self.rules_for_apply())
    }

    /// Rule boundary keys strictly inside `(start, end)`, sorted; the
    /// warm-up threshold calculation splits its size accounting on these.
    pub fn get_split_keys(&self, start: &[u8], end: &[u8]) -> Vec<Vec<u8>> {
        let inner = self.read();
        let mut keys: Vec<Vec<u8>> = Vec::new();
        for rule in inner.rules.values() {
            for key in [&rule.start_key, &rule.end_key] {
                if key.is_empty() {
                    continue;
                }
                let after_start = key.as_slice() > start;
                let before_end = end.is_empty() || key.as_slice() < end;
                if after_start && before_end && !keys.contains(key) {
                    keys.push(key.clone());
                }
            }
        }
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::{Peer, PeerRole};
    use crate::store::StoreMeta;

    fn store_with_labels(id: StoreId, labels: &[(&str, &str)]) -> Arc<StoreInfo> {
        let store = StoreInfo::new(StoreMeta::new(id, format!("s{id}"))).with_labels(
            labels
                .iter()
                .map(|(k, v)| StoreLabel {
                    key: k.to_string(),
                    value: v.to_string(),
                })
                .collect(),
        );
        Arc::new(store)
    }

    fn three_zone_stores() -> HashMap<StoreId, Arc<StoreInfo>> {
        let mut stores = HashMap::new();
        stores.insert(1, store_with_labels(1, &[("zone", "z1")]));
        stores.insert(2, store_with_labels(2, &[("zone", "z2")]));
        stores.insert(3, store_with_labels(3, &[("zone", "z3")]));
        stores.insert(4, store_with_labels(4, &[("zone", "z1")]));
        stores
    }

    fn region_on(stores: &[StoreId]) -> RegionInfo {
        let peers: Vec<Peer> = stores.iter().map(|&s| Peer::voter(s * 10, s)).collect();
        let mut r = RegionInfo::new(1, vec![], vec![], peers.clone());
        r.leader = peers.first().copied();
        r
    }

    fn voter_rule(count: usize) -> Rule {
        Rule {
            group_id: DEFAULT_GROUP.into(),
            id: DEFAULT_RULE_ID.into(),
            index: 0,
            override_: false,
            start_key: vec![],
            end_key: vec![],
            role: RuleRole::Voter,
            count,
            label_constraints: vec![],
            location_labels: vec!["zone".into()],
            isolation_level: String::new(),
        }
    }

    #[test]
    fn full_fit_is_satisfied() {
        let stores = three_zone_stores();
        let region = region_on(&[1, 2, 3]);
        let fit = fit_region(&region, &stores, &[voter_rule(3)]);
        assert!(fit.is_satisfied());
        assert!(fit.orphan_peers.is_empty());
    }

    #[test]
    fn missing_peer_leaves_rule_unsatisfied() {
        let stores = three_zone_stores();
        let region = region_on(&[1, 2]);
        let fit = fit_region(&region, &stores, &[voter_rule(3)]);
        assert!(!fit.is_satisfied());
        assert_eq!(fit.rule_fits[0].peers.len(), 2);
    }

    #[test]
    fn extra_peer_becomes_orphan() {
        let stores = three_zone_stores();
        let region = region_on(&[1, 2, 3, 4]);
        let fit = fit_region(&region, &stores, &[voter_rule(3)]);
        assert!(!fit.is_satisfied());
        assert_eq!(fit.orphan_peers.len(), 1);
        // The duplicate-zone peer is the one left over.
        let orphan_store = fit.orphan_peers[0].store_id;
        assert!(orphan_store == 1 || orphan_store == 4);
    }

    #[test]
    fn learner_rule_binds_learners_only() {
        let stores = three_zone_stores();
        let mut region = region_on(&[1, 2]);
        region.peers.push(Peer {
            id: 30,
            store_id: 3,
            role: PeerRole::Learner,
        });
        let mut learner_rule = voter_rule(1);
        learner_rule.id = "learner".into();
        learner_rule.index = 1;
        learner_rule.role = RuleRole::Learner;
        let fit = fit_region(&region, &stores, &[voter_rule(2), learner_rule]);
        assert!(fit.is_satisfied());
        assert_eq!(fit.rule_fits[1].peers[0].store_id, 3);
    }

    #[test]
    fn better_isolation_compares_greater() {
        let stores = three_zone_stores();
        // Stores 1 and 4 share a zone; 1-2-3 spread three zones.
        let spread = fit_region(&region_on(&[1, 2, 3]), &stores, &[voter_rule(3)]);
        let packed = fit_region(&region_on(&[1, 4, 2]), &stores, &[voter_rule(3)]);
        assert_eq!(compare_region_fit(&spread, &packed), Ordering::Greater);
        assert_eq!(compare_region_fit(&packed, &spread), Ordering::Less);
        assert_eq!(compare_region_fit(&spread, &spread), Ordering::Equal);
    }

    #[test]
    fn override_discards_lower_index_group_rules() {
        let mut base = voter_rule(3);
        base.index = 0;
        let mut replacement = voter_rule(5);
        replacement.id = "big".into();
        replacement.index = 1;
        replacement.override_ = true;
        let merged = prepare_rules_for_apply(vec![base, replacement]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].count, 5);
    }

    #[test]
    fn label_constraints_filter_candidates() {
        let stores = three_zone_stores();
        let mut rule = voter_rule(1);
        rule.label_constraints = vec![LabelConstraint {
            key: "zone".into(),
            op: LabelConstraintOp::In,
            values: vec!["z2".into()],
        }];
        let fit = fit_region(&region_on(&[1, 2, 3]), &stores, &[rule]);
        assert_eq!(fit.rule_fits[0].peers[0].store_id, 2);
        assert_eq!(fit.orphan_peers.len(), 2);
    }

    #[test]
    fn manager_versions_changes_and_guards_default() {
        let manager = RuleManager::new(&ReplicationConfig::default());
        let v0 = manager.version();
        let mut rule = voter_rule(3);
        rule.id = "extra".into();
        rule.index = 2;
        manager.set_rule(rule).unwrap();
        assert!(manager.version() > v0);
        manager.delete_rule(DEFAULT_GROUP, "extra").unwrap();
        assert!(manager
            .delete_rule(DEFAULT_GROUP, DEFAULT_RULE_ID)
            .is_err());
    }

    #[test]
    fn leader_rule_requires_count_one() {
        let manager = RuleManager::new(&ReplicationConfig::default());
        let mut rule = voter_rule(2);
        rule.id = "leader".into();
        rule.role = RuleRole::Leader;
        assert!(manager.set_rule(rule).is_err());
    }
}
