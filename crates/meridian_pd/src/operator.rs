//! Operators: multi-step placement plans and their lifecycle.
//!
//! An operator owns a region's mutation until it reaches a terminal status.
//! Steps are dispatched to the storage node through the region-heartbeat
//! response; progress is observed as heartbeat deltas, never assumed.
//! Admission is gated per store by the add/remove-peer token buckets and
//! globally by per-kind schedule limits.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::ScheduleConfig;
use crate::region::{PeerId, PeerRole, RegionEpoch, RegionId, RegionInfo};
use crate::store::StoreId;
use crate::store_limit::{region_influence, StoreLimitType, StoreLimiter};

/// Floor for quick steps: leader transfers, peer removals, splits.
pub const FAST_OPERATOR_WAIT: Duration = Duration::from_secs(10);
/// Floor for snapshot-moving steps.
pub const SLOW_OPERATOR_WAIT: Duration = Duration::from_secs(10 * 60);
/// A created operator not started within this window expires.
pub const OPERATOR_EXPIRE_TIME: Duration = Duration::from_secs(3);

const FAST_SECONDS_PER_MIB: f64 = 1.0;
const SLOW_SECONDS_PER_MIB: f64 = 6.0;

const OPERATOR_RECORD_CAPACITY: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpStep {
    AddPeer { store_id: StoreId, peer_id: PeerId },
    AddLearner { store_id: StoreId, peer_id: PeerId },
    PromoteLearner { store_id: StoreId, peer_id: PeerId },
    RemovePeer { store_id: StoreId },
    TransferLeader { from_store: StoreId, to_store: StoreId },
    DemoteVoter { store_id: StoreId, peer_id: PeerId },
    MergeRegion {
        from_region: RegionId,
        target_region: RegionId,
        /// The absorbed side carries the passive half of the pair.
        is_passive: bool,
    },
    SplitRegion { split_keys: Vec<Vec<u8>> },
    ChangePeerV2Enter {
        promote_learners: Vec<(StoreId, PeerId)>,
        demote_voters: Vec<(StoreId, PeerId)>,
    },
    ChangePeerV2Leave,
}

impl fmt::Display for OpStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpStep::AddPeer { store_id, peer_id } => {
                write!(f, "add peer {peer_id} on store {store_id}")
            }
            OpStep::AddLearner { store_id, peer_id } => {
                write!(f, "add learner {peer_id} on store {store_id}")
            }
            OpStep::PromoteLearner { store_id, peer_id } => {
                write!(f, "promote learner {peer_id} on store {store_id}")
            }
            OpStep::RemovePeer { store_id } => write!(f, "remove peer on store {store_id}"),
            OpStep::TransferLeader { to_store, .. } => {
                write!(f, "transfer leader to store {to_store}")
            }
            OpStep::DemoteVoter { store_id, peer_id } => {
                write!(f, "demote voter {peer_id} on store {store_id}")
            }
            OpStep::MergeRegion {
                from_region,
                target_region,
                ..
            } => write!(f, "merge region {from_region} into {target_region}"),
            OpStep::SplitRegion { split_keys } => {
                write!(f, "split region into {} parts", split_keys.len() + 1)
            }
            OpStep::ChangePeerV2Enter { .. } => write!(f, "enter joint state"),
            OpStep::ChangePeerV2Leave => write!(f, "leave joint state"),
        }
    }
}

impl OpStep {
    /// Whether the region already reflects this step.
    pub fn is_finished(&self, region: &RegionInfo, start_epoch: &RegionEpoch) -> bool {
        match self {
            OpStep::AddPeer { store_id, .. } => region
                .get_store_peer(*store_id)
                .map(|p| p.is_voter() && !region.is_pending_peer(p.id))
                .unwrap_or(false),
            OpStep::AddLearner { store_id, .. } => region
                .get_store_peer(*store_id)
                .map(|p| p.is_learner() && !region.is_pending_peer(p.id))
                .unwrap_or(false),
            OpStep::PromoteLearner { store_id, .. } => region
                .get_store_peer(*store_id)
                .map(|p| p.is_voter())
                .unwrap_or(false),
            OpStep::RemovePeer { store_id } => region.get_store_peer(*store_id).is_none(),
            OpStep::TransferLeader { to_store, .. } => {
                region.leader_store_id() == Some(*to_store)
            }
            OpStep::DemoteVoter { store_id, .. } => region
                .get_store_peer(*store_id)
                .map(|p| p.is_learner())
                .unwrap_or(false),
            // A merge target finishes when its range grows (version bump);
            // the absorbed side disappears from the cache instead.
            OpStep::MergeRegion { is_passive, .. } => {
                !*is_passive && region.epoch.version > start_epoch.version
            }
            OpStep::SplitRegion { .. } => region.epoch.version > start_epoch.version,
            OpStep::ChangePeerV2Enter {
                promote_learners,
                demote_voters,
            } => {
                promote_learners.iter().all(|(store_id, _)| {
                    region
                        .get_store_peer(*store_id)
                        .map(|p| p.role == PeerRole::IncomingVoter || p.is_voter())
                        .unwrap_or(false)
                }) && demote_voters.iter().all(|(store_id, _)| {
                    region
                        .get_store_peer(*store_id)
                        .map(|p| p.role == PeerRole::DemotingVoter || p.is_learner())
                        .unwrap_or(false)
                })
            }
            OpStep::ChangePeerV2Leave => !region.in_joint_state(),
        }
    }

    /// Region-size-aware execution deadline for this step.
    pub fn timeout(&self, region_size_mib: u64) -> Duration {
        let fast = FAST_OPERATOR_WAIT
            .max(Duration::from_secs_f64(region_size_mib as f64 * FAST_SECONDS_PER_MIB));
        let slow = SLOW_OPERATOR_WAIT
            .max(Duration::from_secs_f64(region_size_mib as f64 * SLOW_SECONDS_PER_MIB));
        match self {
            OpStep::TransferLeader { .. }
            | OpStep::RemovePeer { .. }
            | OpStep::SplitRegion { .. }
            | OpStep::PromoteLearner { .. }
            | OpStep::DemoteVoter { .. } => fast,
            OpStep::AddPeer { .. } | OpStep::AddLearner { .. } => slow,
            OpStep::ChangePeerV2Enter { .. } | OpStep::ChangePeerV2Leave => slow * 3,
            OpStep::MergeRegion { .. } => slow * 10,
        }
    }

    /// (store, bucket) charges this step needs admitted.
    fn influences(&self) -> Vec<(StoreId, StoreLimitType)> {
        match self {
            OpStep::AddPeer { store_id, .. } | OpStep::AddLearner { store_id, .. } => {
                vec![(*store_id, StoreLimitType::AddPeer)]
            }
            OpStep::RemovePeer { store_id } => vec![(*store_id, StoreLimitType::RemovePeer)],
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    Created,
    Started,
    Success,
    Cancelled,
    Replaced,
    Expired,
    Timeout,
}

impl OpStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OpStatus::Created | OpStatus::Started)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OpPriority {
    Low,
    Normal,
    High,
}

/// Classification used for the global per-kind schedule limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Leader,
    Region,
    Replica,
    Merge,
    HotRegion,
}

#[derive(Debug)]
pub struct Operator {
    pub region_id: RegionId,
    pub desc: String,
    pub epoch: RegionEpoch,
    pub kind: OpKind,
    pub priority: OpPriority,
    pub steps: Vec<OpStep>,
    pub region_size: u64,
    pub current_step: usize,
    pub status: OpStatus,
    pub create_time: Instant,
    pub start_time: Option<Instant>,
    step_time: Option<Instant>,
}

impl Operator {
    pub fn new(
        desc: impl Into<String>,
        region: &RegionInfo,
        kind: OpKind,
        steps: Vec<OpStep>,
    ) -> Self {
        Self {
            region_id: region.id,
            desc: desc.into(),
            epoch: region.epoch,
            kind,
            priority: OpPriority::Normal,
            steps,
            region_size: region.approximate_size,
            current_step: 0,
            status: OpStatus::Created,
            create_time: Instant::now(),
            start_time: None,
            step_time: None,
        }
    }

    pub fn with_priority(mut self, priority: OpPriority) -> Self {
        self.priority = priority;
        self
    }

    fn start(&mut self) {
        if self.status == OpStatus::Created {
            self.status = OpStatus::Started;
            let now = Instant::now();
            self.start_time = Some(now);
            self.step_time = Some(now);
        }
    }

    /// Advance through finished steps and return the one to execute next.
    /// Flips the status to `Success` when every step has been observed.
    pub fn check(&mut self, region: &RegionInfo) -> Option<OpStep> {
        if self.status.is_terminal() {
            return None;
        }
        self.start();
        while self.current_step < self.steps.len() {
            if self.steps[self.current_step].is_finished(region, &self.epoch) {
                self.current_step += 1;
                self.step_time = Some(Instant::now());
            } else {
                return Some(self.steps[self.current_step].clone());
            }
        }
        self.status = OpStatus::Success;
        None
    }

    /// Expired: created but never dispatched in time. Timeout: the current
    /// step overstayed its size-scaled deadline.
    pub fn check_timeout(&mut self) -> bool {
        match self.status {
            OpStatus::Created => {
                if self.create_time.elapsed() >= OPERATOR_EXPIRE_TIME {
                    self.status = OpStatus::Expired;
                    return true;
                }
                false
            }
            OpStatus::Started => {
                let step = match self.steps.get(self.current_step) {
                    Some(step) => step,
                    None => return false,
                };
                let started = self.step_time.unwrap_or(self.create_time);
                if started.elapsed() >= step.timeout(self.region_size) {
                    self.status = OpStatus::Timeout;
                    return true;
                }
                false
            }
            _ => false,
        }
    }

    pub fn cancel(&mut self, status: OpStatus) {
        if !self.status.is_terminal() {
            self.status = status;
        }
    }

    /// Membership changes the already-finished steps account for. Heartbeats
    /// carrying a `conf_ver` beyond creation plus this budget mean someone
    /// else mutated the region and the plan is stale.
    fn conf_changes_done(&self) -> u64 {
        self.steps[..self.current_step.min(self.steps.len())]
            .iter()
            .map(|step| match step {
                OpStep::AddPeer { .. }
                | OpStep::AddLearner { .. }
                | OpStep::PromoteLearner { .. }
                | OpStep::RemovePeer { .. }
                | OpStep::DemoteVoter { .. } => 1,
                OpStep::ChangePeerV2Enter {
                    promote_learners,
                    demote_voters,
                } => (promote_learners.len() + demote_voters.len()) as u64,
                OpStep::ChangePeerV2Leave => 1,
                _ => 0,
            })
            .sum()
    }

    fn changes_region_version(&self) -> bool {
        self.steps
            .iter()
            .any(|s| matches!(s, OpStep::MergeRegion { .. } | OpStep::SplitRegion { .. }))
    }

    /// Whether the reported region has moved past what this plan assumed.
    pub fn is_stale_against(&self, region: &RegionInfo) -> bool {
        if region.epoch.conf_ver > self.epoch.conf_ver + self.conf_changes_done() {
            return true;
        }
        region.epoch.version > self.epoch.version && !self.changes_region_version()
    }

    /// Whether `other` may replace this operator: strictly higher priority,
    /// or same priority with a strictly newer epoch.
    pub fn replaceable_by(&self, other: &Operator) -> bool {
        if other.priority > self.priority {
            return true;
        }
        other.priority == self.priority
            && (other.epoch.version > self.epoch.version
                || other.epoch.conf_ver > self.epoch.conf_ver)
    }

    fn influences(&self) -> Vec<(StoreId, StoreLimitType, f64)> {
        let cost = region_influence(self.region_size, 20);
        self.steps
            .iter()
            .flat_map(|s| s.influences())
            .map(|(store, kind)| (store, kind, cost))
            .collect()
    }

    /// For test construction: pin the creation time into the past.
    #[cfg(test)]
    pub fn set_create_time(&mut self, at: Instant) {
        self.create_time = at;
    }

    #[cfg(test)]
    pub fn set_step_time(&mut self, at: Instant) {
        self.step_time = Some(at);
    }
}

/// Terminal-operator record kept for the admin surface after the operator
/// itself is gone.
#[derive(Debug, Clone)]
pub struct OperatorRecord {
    pub region_id: RegionId,
    pub desc: String,
    pub status: OpStatus,
    pub finished_at: Instant,
}

/// Priority buckets with weighted random draw, so high-priority operators
/// go first but lower buckets cannot starve outright.
#[derive(Default)]
struct WaitingOperators {
    high: VecDeque<Operator>,
    normal: VecDeque<Operator>,
    low: VecDeque<Operator>,
}

impl WaitingOperators {
    fn push(&mut self, op: Operator) {
        match op.priority {
            OpPriority::High => self.high.push_back(op),
            OpPriority::Normal => self.normal.push_back(op),
            OpPriority::Low => self.low.push_back(op),
        }
    }

    fn pop(&mut self) -> Option<Operator> {
        let weights = [
            (6u32, !self.high.is_empty()),
            (3u32, !self.normal.is_empty()),
            (1u32, !self.low.is_empty()),
        ];
        let total: u32 = weights
            .iter()
            .filter(|(_, nonempty)| *nonempty)
            .map(|(w, _)| w)
            .sum();
        if total == 0 {
            return None;
        }
        let mut pick = rand::thread_rng().gen_range(0..total);
        for (i, (weight, nonempty)) in weights.iter().enumerate() {
            if !nonempty {
                continue;
            }
            if pick < *weight {
                return match i {
                    0 => self.high.pop_front(),
                    1 => self.normal.pop_front(),
                    _ => self.low.pop_front(),
                };
            }
            pick -= weight;
        }
        None
    }

    fn len(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }
}

struct ControllerInner {
    operators: HashMap<RegionId, Operator>,
    waiting: WaitingOperators,
    records: VecDeque<OperatorRecord>,
}

/// Owns every live operator and the admission gates in front of them.
pub struct OperatorController {
    inner: Mutex<ControllerInner>,
    limiter: Arc<StoreLimiter>,
    cfg: ScheduleConfig,
}

impl OperatorController {
    pub fn new(cfg: ScheduleConfig, limiter: Arc<StoreLimiter>) -> Self {
        Self {
            inner: Mutex::new(ControllerInner {
                operators: HashMap::new(),
                waiting: WaitingOperators::default(),
                records: VecDeque::with_capacity(OPERATOR_RECORD_CAPACITY),
            }),
            limiter,
            cfg,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ControllerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether admitting `op` would overdraw any store bucket it charges.
    pub fn exceed_store_limit(&self, op: &Operator) -> bool {
        op.influences()
            .iter()
            .any(|(store, kind, cost)| !self.limiter.available(*store, *kind, *cost))
    }

    fn operator_count(inner: &ControllerInner, kind: OpKind) -> u64 {
        inner
            .operators
            .values()
            .filter(|op| op.kind == kind && !op.status.is_terminal())
            .count() as u64
    }

    fn record(records: &mut VecDeque<OperatorRecord>, op: &Operator) {
        if records.len() == OPERATOR_RECORD_CAPACITY {
            records.pop_front();
        }
        records.push_back(OperatorRecord {
            region_id: op.region_id,
            desc: op.desc.clone(),
            status: op.status,
            finished_at: Instant::now(),
        });
    }

    /// Queue an operator; it becomes active as soon as the global kind limit
    /// and the store buckets admit it. Returns false when it was rejected
    /// outright (an active operator for the region refuses replacement).
    pub fn add_operator(&self, op: Operator) -> bool {
        {
            let mut inner = self.lock();
            if let Some(existing) = inner.operators.get(&op.region_id) {
                if !existing.status.is_terminal() && !existing.replaceable_by(&op) {
                    tracing::debug!(
                        region_id = op.region_id,
                        desc = %op.desc,
                        "operator rejected, region already has one"
                    );
                    return false;
                }
            }
            inner.waiting.push(op);
        }
        self.promote_waiting();
        true
    }

    /// Move waiting operators into the active set while limits allow.
    pub fn promote_waiting(&self) {
        let mut inner = self.lock();
        let mut requeue = Vec::new();
        while let Some(op) = inner.waiting.pop() {
            if Self::operator_count(&inner, op.kind) >= self.cfg.schedule_limit(op.kind) {
                requeue.push(op);
                break;
            }
            if let Some(existing) = inner.operators.get(&op.region_id) {
                // The region picked up a competing operator while this one
                // waited; only a legitimate replacement may proceed.
                if !existing.status.is_terminal() && !existing.replaceable_by(&op) {
                    continue;
                }
            }
            if self.exceed_store_limit(&op) {
                requeue.push(op);
                continue;
            }
            for (store, kind, cost) in op.influences() {
                self.limiter.take(store, kind, cost);
            }
            if let Some(mut old) = inner.operators.remove(&op.region_id) {
                if !old.status.is_terminal() {
                    old.cancel(OpStatus::Replaced);
                    tracing::info!(
                        region_id = old.region_id,
                        desc = %old.desc,
                        "operator replaced"
                    );
                }
                Self::record(&mut inner.records, &old);
            }
            tracing::info!(region_id = op.region_id, desc = %op.desc, "operator admitted");
            inner.operators.insert(op.region_id, op);
        }
        for op in requeue {
            inner.waiting.push(op);
        }
    }

    /// Heartbeat-driven progress: returns the step the storage node should
    /// execute next for this region, if any.
    pub fn dispatch(&self, region: &RegionInfo) -> Option<OpStep> {
        let mut inner = self.lock();
        let (step, remove) = {
            let op = inner.operators.get_mut(&region.id)?;
            if op.check_timeout() {
                (None, true)
            } else {
                let step = op.check(region);
                if op.status.is_terminal() {
                    (None, true)
                } else if op.is_stale_against(region) {
                    op.cancel(OpStatus::Cancelled);
                    (None, true)
                } else {
                    (step, false)
                }
            }
        };
        if remove {
            if let Some(op) = inner.operators.remove(&region.id) {
                match op.status {
                    OpStatus::Success => {
                        tracing::info!(region_id = region.id, desc = %op.desc, "operator finished")
                    }
                    OpStatus::Timeout | OpStatus::Expired => {
                        tracing::warn!(region_id = region.id, desc = %op.desc, "operator timed out")
                    }
                    _ => tracing::info!(
                        region_id = region.id,
                        desc = %op.desc,
                        status = ?op.status,
                        "operator discarded"
                    ),
                }
                Self::record(&mut inner.records, &op);
            }
            drop(inner);
            self.promote_waiting();
            return None;
        }
        step
    }

    /// Sweep timeouts; the drive-push loop calls this between heartbeats.
    /// Returns the steps that still want execution, for re-notification.
    pub fn push_operators(&self) -> Vec<(RegionId, OpStep)> {
        let mut inner = self.lock();
        let mut timed_out = Vec::new();
        let mut pending = Vec::new();
        for (&region_id, op) in inner.operators.iter_mut() {
            if op.check_timeout() {
                timed_out.push(region_id);
            } else if let Some(step) = op.steps.get(op.current_step) {
                if op.status == OpStatus::Started {
                    pending.push((region_id, step.clone()));
                }
            }
        }
        for region_id in timed_out {
            if let Some(op) = inner.operators.remove(&region_id) {
                tracing::warn!(region_id, desc = %op.desc, "operator timed out");
                Self::record(&mut inner.records, &op);
            }
        }
        drop(inner);
        self.promote_waiting();
        pending
    }

    pub fn get_operator(&self, region_id: RegionId) -> Option<(String, OpStatus, usize)> {
        let inner = self.lock();
        inner
            .operators
            .get(&region_id)
            .map(|op| (op.desc.clone(), op.status, op.current_step))
    }

    pub fn has_operator(&self, region_id: RegionId) -> bool {
        self.lock().operators.contains_key(&region_id)
    }

    pub fn cancel_operator(&self, region_id: RegionId) -> bool {
        let mut inner = self.lock();
        match inner.operators.remove(&region_id) {
            Some(mut op) => {
                op.cancel(OpStatus::Cancelled);
                Self::record(&mut inner.records, &op);
                true
            }
            None => false,
        }
    }

    /// Drop the operator for a region that vanished (merged away or evicted
    /// from the cache).
    pub fn on_region_removed(&self, region_id: RegionId) {
        let mut inner = self.lock();
        if let Some(mut op) = inner.operators.remove(&region_id) {
            // A merge source completing is the plan working as intended.
            let passive_merge = op
                .steps
                .iter()
                .any(|s| matches!(s, OpStep::MergeRegion { is_passive: true, .. }));
            op.cancel(if passive_merge {
                OpStatus::Success
            } else {
                OpStatus::Cancelled
            });
            Self::record(&mut inner.records, &op);
        }
    }

    /// Cancel everything in flight (cluster shutdown).
    pub fn cancel_all(&self) {
        let mut inner = self.lock();
        let ids: Vec<RegionId> = inner.operators.keys().copied().collect();
        for id in ids {
            if let Some(mut op) = inner.operators.remove(&id) {
                op.cancel(OpStatus::Cancelled);
                Self::record(&mut inner.records, &op);
            }
        }
    }

    pub fn operator_counts(&self) -> HashMap<OpKind, u64> {
        let inner = self.lock();
        let mut counts = HashMap::new();
        for op in inner.operators.values() {
            *counts.entry(op.kind).or_insert(0) += 1;
        }
        counts
    }

    pub fn waiting_count(&self) -> usize {
        self.lock().waiting.len()
    }

    pub fn records(&self) -> Vec<OperatorRecord> {
        self.lock().records.iter().cloned().collect()
    }

    pub fn schedule_allowed(&self, kind: OpKind) -> bool {
        let inner = self.lock();
        Self::operator_count(&inner, kind) < self.cfg.schedule_limit(kind)
    }
}
