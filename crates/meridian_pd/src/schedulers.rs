//! Balance and maintenance schedulers.
//!
//! Each scheduler proposes operators against a topology snapshot; the
//! coordinator drives them on their own intervals, which back off
//! exponentially while a scheduler has nothing to do and reset on success.
//! Scheduler instances come from an explicit registry so tests can build
//! their own without process-wide state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::cluster::{BasicCluster, KeyRange};
use crate::config::{ReplicationConfig, ScheduleConfig};
use crate::error::{Error, Result};
use crate::filters::{
    select_target_stores, Filter, RuleLeaderFitFilter, StoreStateFilter, StorageThresholdFilter,
};
use crate::hot_stats::{HotCache, RwKind, HOT_REGION_MIN_DEGREE};
use crate::id_alloc::IdAllocator;
use crate::operator::{OpKind, OpStep, Operator, OperatorController};
use crate::region::RegionInfo;
use crate::rules::RuleManager;
use crate::store::{StoreId, StoreInfo};
use crate::store_limit::StoreLimiter;

pub const MIN_SCHEDULE_INTERVAL: Duration = Duration::from_millis(10);
pub const MAX_SCHEDULE_INTERVAL: Duration = Duration::from_secs(5);
const INTERVAL_GROW_FACTOR: f64 = 1.3;

/// Everything a scheduler may consult. A snapshot handle, not an owner: the
/// cluster and controllers are shared.
pub struct SchedContext {
    pub cluster: Arc<BasicCluster>,
    pub cfg: ScheduleConfig,
    pub replication: ReplicationConfig,
    pub rule_manager: Arc<RuleManager>,
    pub op_controller: Arc<OperatorController>,
    pub hot_cache: Arc<HotCache>,
    pub limiter: Arc<StoreLimiter>,
    pub id_alloc: Arc<IdAllocator>,
}

#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Instance name, unique within the cluster ("balance-leader-scheduler").
    fn name(&self) -> &str;

    /// Scheduler type ("balance-leader").
    fn kind(&self) -> &'static str;

    fn op_kind(&self) -> OpKind;

    fn is_schedule_allowed(&self, ctx: &SchedContext) -> bool {
        ctx.op_controller.schedule_allowed(self.op_kind())
    }

    async fn schedule(&self, ctx: &SchedContext) -> Vec<Operator>;
}

/// Persisted per-scheduler state under `schedulers/<name>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub kind: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub disabled: bool,
    /// Unix seconds; 0 = not paused.
    #[serde(default)]
    pub paused_until: i64,
}

impl SchedulerConfig {
    pub fn new(kind: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            kind: kind.into(),
            args,
            disabled: false,
            paused_until: 0,
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Wraps one scheduler with its run cadence and pause/disable state.
pub struct ScheduleController {
    scheduler: Box<dyn Scheduler>,
    interval: Mutex<Duration>,
    next_run: Mutex<Instant>,
    paused_until: AtomicI64,
    disabled: AtomicBool,
}

impl ScheduleController {
    pub fn new(scheduler: Box<dyn Scheduler>) -> Self {
        Self {
            scheduler,
            interval: Mutex::new(MIN_SCHEDULE_INTERVAL),
            next_run: Mutex::new(Instant::now()),
            paused_until: AtomicI64::new(0),
            disabled: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        self.scheduler.name()
    }

    pub fn kind(&self) -> &'static str {
        self.scheduler.kind()
    }

    pub fn is_paused(&self) -> bool {
        unix_now() < self.paused_until.load(Ordering::Relaxed)
    }

    pub fn paused_until(&self) -> i64 {
        self.paused_until.load(Ordering::Relaxed)
    }

    /// `seconds == 0` resumes.
    pub fn pause_for(&self, seconds: u64) {
        let until = if seconds == 0 {
            0
        } else {
            unix_now() + seconds as i64
        };
        self.paused_until.store(until, Ordering::Relaxed);
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::Relaxed);
    }

    pub fn restore(&self, cfg: &SchedulerConfig) {
        self.disabled.store(cfg.disabled, Ordering::Relaxed);
        self.paused_until.store(cfg.paused_until, Ordering::Relaxed);
    }

    fn due(&self) -> bool {
        *self.next_run.lock().unwrap_or_else(|e| e.into_inner()) <= Instant::now()
    }

    fn back_off(&self) {
        let mut interval = self.interval.lock().unwrap_or_else(|e| e.into_inner());
        *interval = Duration::from_secs_f64(
            (interval.as_secs_f64() * INTERVAL_GROW_FACTOR)
                .min(MAX_SCHEDULE_INTERVAL.as_secs_f64()),
        );
        *self.next_run.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now() + *interval;
    }

    fn reset_interval(&self) {
        let mut interval = self.interval.lock().unwrap_or_else(|e| e.into_inner());
        *interval = MIN_SCHEDULE_INTERVAL;
        *self.next_run.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now() + *interval;
    }

    pub fn current_interval(&self) -> Duration {
        *self.interval.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// One scheduling round, honoring cadence, pause, disable, and the
    /// per-kind operator limits.
    pub async fn run_once(&self, ctx: &SchedContext) -> Vec<Operator> {
        if self.is_disabled() || self.is_paused() || !self.due() {
            return Vec::new();
        }
        if !self.scheduler.is_schedule_allowed(ctx) {
            self.back_off();
            return Vec::new();
        }
        let ops = self.scheduler.schedule(ctx).await;
        if ops.is_empty() {
            self.back_off();
        } else {
            self.reset_interval();
        }
        ops
    }
}

/// Explicit scheduler factory; no process-wide registration.
type SchedulerBuilder = fn(&[String]) -> Result<Box<dyn Scheduler>>;

pub struct SchedulerRegistry {
    builders: HashMap<&'static str, SchedulerBuilder>,
}

impl SchedulerRegistry {
    pub fn empty() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    pub fn register(&mut self, kind: &'static str, builder: SchedulerBuilder) {
        self.builders.insert(kind, builder);
    }

    pub fn build(&self, kind: &str, args: &[String]) -> Result<Box<dyn Scheduler>> {
        match self.builders.get(kind) {
            Some(builder) => builder(args),
            None => Err(Error::SchedulerNotFound(kind.to_string())),
        }
    }

    pub fn known_kinds(&self) -> Vec<&'static str> {
        self.builders.keys().copied().collect()
    }
}

impl Default for SchedulerRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("balance-leader", |_| Ok(Box::new(BalanceLeaderScheduler)));
        registry.register("balance-region", |_| Ok(Box::new(BalanceRegionScheduler)));
        registry.register("hot-region", |_| Ok(Box::new(HotRegionScheduler)));
        registry.register("shuffle-leader", |_| Ok(Box::new(ShuffleLeaderScheduler)));
        registry.register("shuffle-region", |_| Ok(Box::new(ShuffleRegionScheduler)));
        registry.register("shuffle-hot-region", |_| {
            Ok(Box::new(ShuffleHotRegionScheduler))
        });
        registry.register("evict-leader", |args| {
            Ok(Box::new(EvictLeaderScheduler::from_args(args)?))
        });
        registry.register("grant-leader", |args| {
            Ok(Box::new(GrantLeaderScheduler::from_args(args)?))
        });
        registry.register("label", |_| Ok(Box::new(LabelScheduler)));
        registry.register("scatter-range", |args| {
            Ok(Box::new(ScatterRangeScheduler::from_args(args)?))
        });
        registry.register("split-bucket", |_| Ok(Box::new(SplitBucketScheduler)));
        registry
    }
}

/// Schedulers every cluster runs unless told otherwise.
pub fn default_scheduler_configs() -> Vec<(String, SchedulerConfig)> {
    [
        "balance-leader",
        "balance-region",
        "hot-region",
        "split-bucket",
    ]
    .iter()
    .map(|kind| {
        (
            format!("{kind}-scheduler"),
            SchedulerConfig::new(*kind, Vec::new()),
        )
    })
    .collect()
}

// Shared helpers.

fn region_healthy(region: &RegionInfo) -> bool {
    region.leader.is_some()
        && region.down_peers.is_empty()
        && region.pending_peers.is_empty()
        && !region.in_joint_state()
}

fn stores_map(cluster: &BasicCluster) -> HashMap<StoreId, Arc<StoreInfo>> {
    cluster
        .get_stores()
        .into_iter()
        .map(|s| (s.id(), s))
        .collect()
}

/// Moving `size` from `source` to `target` must not just swap the
/// imbalance; the tolerated delta scales with average region size.
fn should_balance(source_score: f64, target_score: f64, tolerance: f64) -> bool {
    source_score - tolerance > target_score
}

fn size_tolerance(ctx: &SchedContext) -> f64 {
    if ctx.cfg.tolerant_size_ratio > 0.0 {
        ctx.cfg.tolerant_size_ratio * ctx.cluster.average_region_size().max(1) as f64
    } else {
        2.0 * ctx.cluster.average_region_size().max(1) as f64
    }
}

// balance-leader

pub struct BalanceLeaderScheduler;

#[async_trait]
impl Scheduler for BalanceLeaderScheduler {
    fn name(&self) -> &str {
        "balance-leader-scheduler"
    }

    fn kind(&self) -> &'static str {
        "balance-leader"
    }

    fn op_kind(&self) -> OpKind {
        OpKind::Leader
    }

    async fn schedule(&self, ctx: &SchedContext) -> Vec<Operator> {
        let stores = ctx.cluster.get_stores();
        let state = StoreStateFilter {
            transfer_leader: true,
            ..Default::default()
        };
        let mut sources: Vec<Arc<StoreInfo>> = stores
            .iter()
            .filter(|s| s.is_up() && state.source(&ctx.cfg, s))
            .cloned()
            .collect();
        sources.sort_by(|a, b| {
            b.leader_score(0)
                .partial_cmp(&a.leader_score(0))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let stores_by_id = stores_map(&ctx.cluster);
        for source in sources {
            for region in ctx.cluster.rand_leader_regions(source.id(), &[]) {
                if !region_healthy(&region) {
                    continue;
                }
                if let Some(op) = transfer_leader_out(ctx, &region, &source, &stores_by_id, "balance-leader")
                {
                    return vec![op];
                }
            }
        }
        Vec::new()
    }
}

/// Pick the best follower store to take the region's leadership off
/// `source`, honoring state filters and the placement leader safeguard.
fn transfer_leader_out(
    ctx: &SchedContext,
    region: &RegionInfo,
    source: &StoreInfo,
    stores_by_id: &HashMap<StoreId, Arc<StoreInfo>>,
    desc: &str,
) -> Option<Operator> {
    let state = StoreStateFilter {
        transfer_leader: true,
        ..Default::default()
    };
    let filters: Vec<Box<dyn Filter>> = vec![
        Box::new(state),
        Box::new(RuleLeaderFitFilter::new(
            Arc::clone(&ctx.rule_manager),
            stores_by_id.clone(),
            region.clone(),
        )),
    ];
    let followers: Vec<Arc<StoreInfo>> = region
        .followers()
        .filter_map(|p| stores_by_id.get(&p.store_id).cloned())
        .collect();
    let candidates = select_target_stores(&followers, &filters, &ctx.cfg);
    let target = candidates.into_iter().min_by(|a, b| {
        a.leader_score(0)
            .partial_cmp(&b.leader_score(0))
            .unwrap_or(std::cmp::Ordering::Equal)
    })?;
    if !should_balance(source.leader_score(0), target.leader_score(1), 1.0) {
        return None;
    }
    Some(Operator::new(
        desc,
        region,
        OpKind::Leader,
        vec![OpStep::TransferLeader {
            from_store: source.id(),
            to_store: target.id(),
        }],
    ))
}

// balance-region

pub struct BalanceRegionScheduler;

#[async_trait]
impl Scheduler for BalanceRegionScheduler {
    fn name(&self) -> &str {
        "balance-region-scheduler"
    }

    fn kind(&self) -> &'static str {
        "balance-region"
    }

    fn op_kind(&self) -> OpKind {
        OpKind::Region
    }

    async fn schedule(&self, ctx: &SchedContext) -> Vec<Operator> {
        let stores = ctx.cluster.get_stores();
        let state = StoreStateFilter {
            move_region: true,
            ..Default::default()
        };
        let mut sources: Vec<Arc<StoreInfo>> = stores
            .iter()
            .filter(|s| s.is_up() && state.source(&ctx.cfg, s))
            .cloned()
            .collect();
        sources.sort_by(|a, b| {
            b.region_score(ctx.cfg.high_space_ratio, ctx.cfg.low_space_ratio, 0)
                .partial_cmp(&a.region_score(ctx.cfg.high_space_ratio, ctx.cfg.low_space_ratio, 0))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let stores_by_id = stores_map(&ctx.cluster);
        for source in sources {
            let mut candidates = ctx.cluster.rand_follower_regions(source.id(), &[]);
            candidates.extend(ctx.cluster.rand_leader_regions(source.id(), &[]));
            for region in candidates {
                if !region_healthy(&region) {
                    continue;
                }
                if let Some(op) = move_region_peer(ctx, &region, &source, &stores_by_id).await {
                    return vec![op];
                }
            }
        }
        Vec::new()
    }
}

async fn move_region_peer(
    ctx: &SchedContext,
    region: &RegionInfo,
    source: &StoreInfo,
    stores_by_id: &HashMap<StoreId, Arc<StoreInfo>>,
) -> Option<Operator> {
    let all: Vec<Arc<StoreInfo>> = stores_by_id.values().cloned().collect();
    let mut filters: Vec<Box<dyn Filter>> = vec![
        Box::new(StoreStateFilter {
            move_region: true,
            ..Default::default()
        }),
        Box::new(StorageThresholdFilter),
        Box::new(crate::filters::ExcludedFilter::targets_only(
            region.store_ids().collect(),
        )),
    ];
    filters.push(crate::filters::placement_safeguard(
        &ctx.rule_manager,
        stores_by_id,
        &ctx.replication.location_labels,
        region,
        source,
    ));
    let candidates = select_target_stores(&all, &filters, &ctx.cfg);
    let target = candidates.into_iter().min_by(|a, b| {
        a.region_score(ctx.cfg.high_space_ratio, ctx.cfg.low_space_ratio, 0)
            .partial_cmp(&b.region_score(ctx.cfg.high_space_ratio, ctx.cfg.low_space_ratio, 0))
            .unwrap_or(std::cmp::Ordering::Equal)
    })?;

    let size = region.approximate_size as i64;
    if !should_balance(
        source.region_score(ctx.cfg.high_space_ratio, ctx.cfg.low_space_ratio, -size),
        target.region_score(ctx.cfg.high_space_ratio, ctx.cfg.low_space_ratio, size),
        size_tolerance(ctx),
    ) {
        return None;
    }

    let peer_id = ctx.id_alloc.alloc().await.ok()?;
    let mut steps = vec![
        OpStep::AddLearner {
            store_id: target.id(),
            peer_id,
        },
        OpStep::PromoteLearner {
            store_id: target.id(),
            peer_id,
        },
    ];
    if region.leader_store_id() == Some(source.id()) {
        steps.push(OpStep::TransferLeader {
            from_store: source.id(),
            to_store: target.id(),
        });
    }
    steps.push(OpStep::RemovePeer {
        store_id: source.id(),
    });
    Some(Operator::new("balance-region", region, OpKind::Region, steps))
}

// hot-region

pub struct HotRegionScheduler;

#[async_trait]
impl Scheduler for HotRegionScheduler {
    fn name(&self) -> &str {
        "hot-region-scheduler"
    }

    fn kind(&self) -> &'static str {
        "hot-region"
    }

    fn op_kind(&self) -> OpKind {
        OpKind::HotRegion
    }

    async fn schedule(&self, ctx: &SchedContext) -> Vec<Operator> {
        // Writes move data (as-peer), reads move leadership (as-leader).
        if let Some(op) = self.balance_hot_write(ctx).await {
            return vec![op];
        }
        if let Some(op) = self.balance_hot_read(ctx) {
            return vec![op];
        }
        Vec::new()
    }
}

impl HotRegionScheduler {
    async fn balance_hot_write(&self, ctx: &SchedContext) -> Option<Operator> {
        let stats = ctx.hot_cache.region_stats(RwKind::Write, HOT_REGION_MIN_DEGREE);
        let (hot_store, peers) = stats
            .iter()
            .max_by_key(|(_, peers)| peers.len())?;
        let stores_by_id = stores_map(&ctx.cluster);
        let source = stores_by_id.get(hot_store)?.clone();
        let mut peers = peers.clone();
        peers.sort_by(|a, b| {
            b.loads[0]
                .partial_cmp(&a.loads[0])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for peer in peers {
            let Some(region) = ctx.cluster.get_region(peer.region_id) else {
                continue;
            };
            if !region_healthy(&region) {
                continue;
            }
            if let Some(op) = move_region_peer(ctx, &region, &source, &stores_by_id).await {
                return Some(Operator::new(
                    "hot-region-move-peer",
                    &region,
                    OpKind::HotRegion,
                    op.steps,
                ));
            }
        }
        None
    }

    fn balance_hot_read(&self, ctx: &SchedContext) -> Option<Operator> {
        let stats = ctx.hot_cache.region_stats(RwKind::Read, HOT_REGION_MIN_DEGREE);
        let stores_by_id = stores_map(&ctx.cluster);
        let (hot_store, peers) = stats
            .iter()
            .max_by_key(|(_, peers)| peers.len())?;
        let source = stores_by_id.get(hot_store)?.clone();
        for peer in peers {
            if !peer.is_leader {
                continue;
            }
            // A freshly transferred leader absorbs the switch before it may
            // move again.
            if peer.is_need_cool_down_transfer_leader(3) {
                continue;
            }
            let Some(region) = ctx.cluster.get_region(peer.region_id) else {
                continue;
            };
            if !region_healthy(&region) || region.leader_store_id() != Some(*hot_store) {
                continue;
            }
            if let Some(op) =
                transfer_leader_out(ctx, &region, &source, &stores_by_id, "hot-region-transfer-leader")
            {
                return Some(Operator::new(
                    "hot-region-transfer-leader",
                    &region,
                    OpKind::HotRegion,
                    op.steps,
                ));
            }
        }
        None
    }
}

// shuffle-* (test/chaos)

pub struct ShuffleLeaderScheduler;

#[async_trait]
impl Scheduler for ShuffleLeaderScheduler {
    fn name(&self) -> &str {
        "shuffle-leader-scheduler"
    }

    fn kind(&self) -> &'static str {
        "shuffle-leader"
    }

    fn op_kind(&self) -> OpKind {
        OpKind::Leader
    }

    async fn schedule(&self, ctx: &SchedContext) -> Vec<Operator> {
        let mut stores = ctx.cluster.get_stores();
        stores.retain(|s| s.is_up());
        stores.shuffle(&mut rand::thread_rng());
        for store in stores {
            for region in ctx.cluster.rand_leader_regions(store.id(), &[]) {
                if !region_healthy(&region) {
                    continue;
                }
                let followers: Vec<StoreId> = region.followers().map(|p| p.store_id).collect();
                if let Some(&target) = followers.choose(&mut rand::thread_rng()) {
                    return vec![Operator::new(
                        "shuffle-leader",
                        &region,
                        OpKind::Leader,
                        vec![OpStep::TransferLeader {
                            from_store: store.id(),
                            to_store: target,
                        }],
                    )];
                }
            }
        }
        Vec::new()
    }
}

pub struct ShuffleRegionScheduler;

#[async_trait]
impl Scheduler for ShuffleRegionScheduler {
    fn name(&self) -> &str {
        "shuffle-region-scheduler"
    }

    fn kind(&self) -> &'static str {
        "shuffle-region"
    }

    fn op_kind(&self) -> OpKind {
        OpKind::Region
    }

    async fn schedule(&self, ctx: &SchedContext) -> Vec<Operator> {
        let stores_by_id = stores_map(&ctx.cluster);
        let mut stores = ctx.cluster.get_stores();
        stores.retain(|s| s.is_up());
        stores.shuffle(&mut rand::thread_rng());
        for store in stores {
            let mut regions = ctx.cluster.rand_follower_regions(store.id(), &[]);
            regions.extend(ctx.cluster.rand_leader_regions(store.id(), &[]));
            for region in regions {
                if !region_healthy(&region) {
                    continue;
                }
                if let Some(op) = move_region_peer(ctx, &region, &store, &stores_by_id).await {
                    return vec![Operator::new(
                        "shuffle-region",
                        &region,
                        OpKind::Region,
                        op.steps,
                    )];
                }
            }
        }
        Vec::new()
    }
}

pub struct ShuffleHotRegionScheduler;

#[async_trait]
impl Scheduler for ShuffleHotRegionScheduler {
    fn name(&self) -> &str {
        "shuffle-hot-region-scheduler"
    }

    fn kind(&self) -> &'static str {
        "shuffle-hot-region"
    }

    fn op_kind(&self) -> OpKind {
        OpKind::HotRegion
    }

    async fn schedule(&self, ctx: &SchedContext) -> Vec<Operator> {
        let stores_by_id = stores_map(&ctx.cluster);
        for kind in [RwKind::Write, RwKind::Read] {
            let stats = ctx.hot_cache.region_stats(kind, HOT_REGION_MIN_DEGREE);
            let mut entries: Vec<_> = stats.into_iter().collect();
            entries.shuffle(&mut rand::thread_rng());
            for (store_id, peers) in entries {
                let Some(source) = stores_by_id.get(&store_id).cloned() else {
                    continue;
                };
                for peer in peers {
                    let Some(region) = ctx.cluster.get_region(peer.region_id) else {
                        continue;
                    };
                    if !region_healthy(&region) {
                        continue;
                    }
                    if let Some(op) = move_region_peer(ctx, &region, &source, &stores_by_id).await {
                        return vec![Operator::new(
                            "shuffle-hot-region",
                            &region,
                            OpKind::HotRegion,
                            op.steps,
                        )];
                    }
                }
            }
        }
        Vec::new()
    }
}

// evict-leader / grant-leader

pub struct EvictLeaderScheduler {
    store_id: StoreId,
    name: String,
}

impl EvictLeaderScheduler {
    pub fn new(store_id: StoreId) -> Self {
        Self {
            store_id,
            name: format!("evict-leader-scheduler-{store_id}"),
        }
    }

    fn from_args(args: &[String]) -> Result<Self> {
        let store_id = args
            .first()
            .and_then(|s| s.parse::<StoreId>().ok())
            .ok_or_else(|| Error::SchedulerNotFound("evict-leader needs a store id".into()))?;
        Ok(Self::new(store_id))
    }
}

#[async_trait]
impl Scheduler for EvictLeaderScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "evict-leader"
    }

    fn op_kind(&self) -> OpKind {
        OpKind::Leader
    }

    async fn schedule(&self, ctx: &SchedContext) -> Vec<Operator> {
        let stores_by_id = stores_map(&ctx.cluster);
        let Some(source) = stores_by_id.get(&self.store_id).cloned() else {
            return Vec::new();
        };
        let mut ops = Vec::new();
        for region in ctx.cluster.rand_leader_regions(self.store_id, &[]) {
            if !region_healthy(&region) {
                continue;
            }
            // Eviction ignores balance; any healthy follower will do.
            let followers: Vec<Arc<StoreInfo>> = region
                .followers()
                .filter_map(|p| stores_by_id.get(&p.store_id).cloned())
                .collect();
            let state = StoreStateFilter {
                transfer_leader: true,
                ..Default::default()
            };
            let filters: Vec<Box<dyn Filter>> = vec![Box::new(state)];
            let candidates = select_target_stores(&followers, &filters, &ctx.cfg);
            if let Some(target) = candidates.into_iter().min_by(|a, b| {
                a.leader_score(0)
                    .partial_cmp(&b.leader_score(0))
                    .unwrap_or(std::cmp::Ordering::Equal)
            }) {
                ops.push(Operator::new(
                    "evict-leader",
                    &region,
                    OpKind::Leader,
                    vec![OpStep::TransferLeader {
                        from_store: source.id(),
                        to_store: target.id(),
                    }],
                ));
                break;
            }
        }
        ops
    }
}

pub struct GrantLeaderScheduler {
    store_id: StoreId,
    name: String,
}

impl GrantLeaderScheduler {
    pub fn new(store_id: StoreId) -> Self {
        Self {
            store_id,
            name: format!("grant-leader-scheduler-{store_id}"),
        }
    }

    fn from_args(args: &[String]) -> Result<Self> {
        let store_id = args
            .first()
            .and_then(|s| s.parse::<StoreId>().ok())
            .ok_or_else(|| Error::SchedulerNotFound("grant-leader needs a store id".into()))?;
        Ok(Self::new(store_id))
    }
}

#[async_trait]
impl Scheduler for GrantLeaderScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "grant-leader"
    }

    fn op_kind(&self) -> OpKind {
        OpKind::Leader
    }

    async fn schedule(&self, ctx: &SchedContext) -> Vec<Operator> {
        for region in ctx.cluster.rand_follower_regions(self.store_id, &[]) {
            if !region_healthy(&region) {
                continue;
            }
            let Some(from_store) = region.leader_store_id() else {
                continue;
            };
            return vec![Operator::new(
                "grant-leader",
                &region,
                OpKind::Leader,
                vec![OpStep::TransferLeader {
                    from_store,
                    to_store: self.store_id,
                }],
            )];
        }
        Vec::new()
    }
}

// label

/// Stores labelled `reject-leader` shed their leaders.
pub const REJECT_LEADER_KEY: &str = "reject-leader";

pub struct LabelScheduler;

#[async_trait]
impl Scheduler for LabelScheduler {
    fn name(&self) -> &str {
        "label-scheduler"
    }

    fn kind(&self) -> &'static str {
        "label"
    }

    fn op_kind(&self) -> OpKind {
        OpKind::Leader
    }

    async fn schedule(&self, ctx: &SchedContext) -> Vec<Operator> {
        let stores_by_id = stores_map(&ctx.cluster);
        let rejecting: Vec<Arc<StoreInfo>> = ctx
            .cluster
            .get_stores()
            .into_iter()
            .filter(|s| s.label_value(REJECT_LEADER_KEY).is_some())
            .collect();
        for store in rejecting {
            for region in ctx.cluster.rand_leader_regions(store.id(), &[]) {
                if !region_healthy(&region) {
                    continue;
                }
                if let Some(op) =
                    transfer_leader_out(ctx, &region, &store, &stores_by_id, "label-reject-leader")
                {
                    return vec![op];
                }
            }
        }
        Vec::new()
    }
}

// scatter-range

pub struct ScatterRangeScheduler {
    range: KeyRange,
    name: String,
}

impl ScatterRangeScheduler {
    pub fn new(range_name: &str, range: KeyRange) -> Self {
        Self {
            range,
            name: format!("scatter-range-{range_name}"),
        }
    }

    fn from_args(args: &[String]) -> Result<Self> {
        if args.len() < 3 {
            return Err(Error::SchedulerNotFound(
                "scatter-range needs start, end, name".into(),
            ));
        }
        let range = KeyRange::new(args[0].as_bytes().to_vec(), args[1].as_bytes().to_vec());
        Ok(Self::new(&args[2], range))
    }
}

#[async_trait]
impl Scheduler for ScatterRangeScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "scatter-range"
    }

    fn op_kind(&self) -> OpKind {
        OpKind::Region
    }

    async fn schedule(&self, ctx: &SchedContext) -> Vec<Operator> {
        let ranges = [self.range.clone()];
        let stores_by_id = stores_map(&ctx.cluster);
        let mut stores = ctx.cluster.get_stores();
        stores.sort_by(|a, b| {
            b.leader_score(0)
                .partial_cmp(&a.leader_score(0))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for source in stores {
            for region in ctx.cluster.rand_leader_regions(source.id(), &ranges) {
                if !region_healthy(&region) {
                    continue;
                }
                if let Some(op) =
                    transfer_leader_out(ctx, &region, &source, &stores_by_id, "scatter-range-leader")
                {
                    return vec![op];
                }
            }
        }
        Vec::new()
    }
}

// split-bucket

pub struct SplitBucketScheduler;

#[async_trait]
impl Scheduler for SplitBucketScheduler {
    fn name(&self) -> &str {
        "split-bucket-scheduler"
    }

    fn kind(&self) -> &'static str {
        "split-bucket"
    }

    fn op_kind(&self) -> OpKind {
        OpKind::Region
    }

    async fn schedule(&self, ctx: &SchedContext) -> Vec<Operator> {
        // Split a region at the boundary of its hottest bucket, so the hot
        // range can move independently afterwards.
        for region in ctx.cluster.get_regions() {
            if !region_healthy(&region) {
                continue;
            }
            let Some(buckets) = region.buckets.as_ref() else {
                continue;
            };
            if buckets.keys.len() < 3 {
                continue;
            }
            let loads: Vec<u64> = buckets
                .read_bytes
                .iter()
                .zip(buckets.write_bytes.iter())
                .map(|(r, w)| r + w)
                .collect();
            let total: u64 = loads.iter().sum();
            if total == 0 {
                continue;
            }
            let (hottest, load) = loads
                .iter()
                .enumerate()
                .max_by_key(|(_, load)| **load)
                .map(|(i, load)| (i, *load))
                .unwrap_or((0, 0));
            // One bucket dominating means splitting it off pays.
            if load * 2 < total {
                continue;
            }
            let mut split_keys = Vec::new();
            if hottest > 0 {
                if let Some(key) = buckets.keys.get(hottest) {
                    split_keys.push(key.clone());
                }
            }
            if let Some(key) = buckets.keys.get(hottest + 1) {
                if !region.end_key.is_empty() && key < &region.end_key || region.end_key.is_empty()
                {
                    split_keys.push(key.clone());
                }
            }
            split_keys.retain(|k| !k.is_empty() && k.as_slice() != region.start_key.as_slice());
            if split_keys.is_empty() {
                continue;
            }
            return vec![Operator::new(
                "split-hot-bucket",
                &region,
                OpKind::Region,
                vec![OpStep::SplitRegion { split_keys }],
            )];
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::{Peer, RegionEpoch};
    use crate::store::{StoreMeta, StoreStats};
    use meridian_meta::MemStore;

    fn context() -> SchedContext {
        let cluster = Arc::new(BasicCluster::new());
        let replication = ReplicationConfig::default();
        let cfg = ScheduleConfig::default();
        let limiter = Arc::new(StoreLimiter::new(
            cfg.store_limit_add_peer,
            cfg.store_limit_remove_peer,
        ));
        SchedContext {
            cluster,
            cfg: cfg.clone(),
            replication: replication.clone(),
            rule_manager: Arc::new(RuleManager::new(&replication)),
            op_controller: Arc::new(OperatorController::new(cfg, Arc::clone(&limiter))),
            hot_cache: Arc::new(HotCache::new()),
            limiter,
            id_alloc: Arc::new(IdAllocator::new(
                Arc::new(MemStore::new()),
                "/1/alloc_id".into(),
            )),
        }
    }

    fn add_store(ctx: &SchedContext, id: StoreId) {
        let store = StoreInfo::new(StoreMeta::new(id, format!("s{id}")))
            .with_state(crate::store::NodeState::Serving)
            .with_last_heartbeat(Instant::now())
            .with_stats(StoreStats {
                store_id: id,
                capacity: 100 << 30,
                available: 80 << 30,
                used_size: 20 << 30,
                ..Default::default()
            });
        ctx.cluster.put_store(store);
    }

    fn add_region(ctx: &SchedContext, id: u64, stores: &[StoreId], leader: StoreId) {
        let peers: Vec<Peer> = stores.iter().map(|&s| Peer::voter(id * 100 + s, s)).collect();
        let mut region = RegionInfo::new(
            id,
            format!("k{id:04}").into_bytes(),
            format!("k{:04}", id + 1).into_bytes(),
            peers.clone(),
        );
        region.leader = peers.iter().find(|p| p.store_id == leader).copied();
        region.epoch = RegionEpoch::new(1, 1);
        region.approximate_size = 10;
        ctx.cluster.put_region(region);
    }

    #[tokio::test]
    async fn balance_leader_moves_from_crowded_store() {
        let ctx = context();
        for id in 1..=3 {
            add_store(&ctx, id);
        }
        // Store 1 leads everything.
        for id in 1..=8 {
            add_region(&ctx, id, &[1, 2, 3], 1);
        }
        for id in 1..=3 {
            ctx.cluster.update_store_status(id);
        }

        let ops = BalanceLeaderScheduler.schedule(&ctx).await;
        assert_eq!(ops.len(), 1);
        match &ops[0].steps[0] {
            OpStep::TransferLeader { from_store, to_store } => {
                assert_eq!(*from_store, 1);
                assert!(*to_store == 2 || *to_store == 3);
            }
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[tokio::test]
    async fn balance_leader_is_idle_when_even() {
        let ctx = context();
        for id in 1..=3 {
            add_store(&ctx, id);
        }
        for id in 1..=3u64 {
            add_region(&ctx, id, &[1, 2, 3], id);
        }
        for id in 1..=3 {
            ctx.cluster.update_store_status(id);
        }
        assert!(BalanceLeaderScheduler.schedule(&ctx).await.is_empty());
    }

    #[tokio::test]
    async fn evict_leader_drains_the_named_store() {
        let ctx = context();
        for id in 1..=3 {
            add_store(&ctx, id);
        }
        add_region(&ctx, 1, &[1, 2, 3], 2);
        for id in 1..=3 {
            ctx.cluster.update_store_status(id);
        }
        let scheduler = EvictLeaderScheduler::new(2);
        let ops = scheduler.schedule(&ctx).await;
        assert_eq!(ops.len(), 1);
        match &ops[0].steps[0] {
            OpStep::TransferLeader { from_store, .. } => assert_eq!(*from_store, 2),
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[tokio::test]
    async fn controller_backs_off_on_empty_schedule() {
        let ctx = context();
        let controller = ScheduleController::new(Box::new(BalanceLeaderScheduler));
        let initial = controller.current_interval();
        controller.run_once(&ctx).await;
        assert!(controller.current_interval() > initial);
    }

    #[tokio::test]
    async fn paused_controller_schedules_nothing() {
        let ctx = context();
        for id in 1..=3 {
            add_store(&ctx, id);
        }
        for id in 1..=8 {
            add_region(&ctx, id, &[1, 2, 3], 1);
        }
        for id in 1..=3 {
            ctx.cluster.update_store_status(id);
        }
        let controller = ScheduleController::new(Box::new(BalanceLeaderScheduler));
        controller.pause_for(60);
        assert!(controller.is_paused());
        assert!(controller.run_once(&ctx).await.is_empty());
        controller.pause_for(0);
        assert!(!controller.is_paused());
        assert_eq!(controller.run_once(&ctx).await.len(), 1);
    }

    #[test]
    fn registry_builds_known_kinds_and_rejects_unknown() {
        let registry = SchedulerRegistry::default();
        assert!(registry.build("balance-leader", &[]).is_ok());
        assert!(registry
            .build("evict-leader", &["5".to_string()])
            .is_ok());
        assert!(registry.build("evict-leader", &[]).is_err());
        assert!(registry.build("no-such", &[]).is_err());
    }
}
