//! Scheduling coordinator: drives checkers and schedulers over the cluster.
//!
//! Three cooperative loops run under one shutdown signal: the region patrol
//! (checkers), the suspect-range drain, and the operator drive-push tick.
//! Scheduler configs load from the MetaStore at start with bounded retries;
//! a total load failure aborts startup rather than running half-configured.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use anyhow::Context;
use meridian_meta::MetaStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::checkers::CheckerController;
use crate::config::{ReplicationConfig, ScheduleConfig};
use crate::controller::ClusterController;
use crate::error::Error;
use crate::metrics::Metrics;
use crate::operator::OperatorController;
use crate::region::RegionInfo;
use crate::schedulers::{
    default_scheduler_configs, SchedContext, ScheduleController, SchedulerConfig,
    SchedulerRegistry,
};

const PATROL_SCAN_REGION_LIMIT: usize = 128;
const CHECK_SUSPECT_RANGES_INTERVAL: Duration = Duration::from_millis(100);
const SUSPECT_RANGE_SCAN_LIMIT: usize = 1024;
const PUSH_OPERATOR_TICK: Duration = Duration::from_millis(500);
const RUN_SCHEDULER_CHECK_INTERVAL: Duration = Duration::from_secs(3);
const SCHEDULER_DRIVE_TICK: Duration = Duration::from_millis(50);
const MAX_LOAD_CONFIG_RETRIES: usize = 10;
const PERSIST_CONFIG_RETRIES: usize = 10;
const PERSIST_RETRY_BACKOFF: Duration = Duration::from_millis(100);
/// Fraction of known regions that must heartbeat before scheduling starts.
const PREPARE_COLLECT_FACTOR: f64 = 0.9;
const PREPARE_COLLECT_TIMEOUT: Duration = Duration::from_secs(300);

pub struct Coordinator {
    pub controller: Arc<ClusterController>,
    pub checkers: Arc<CheckerController>,
    pub op_controller: Arc<OperatorController>,
    schedulers: RwLock<HashMap<String, Arc<ScheduleController>>>,
    registry: SchedulerRegistry,
    meta_store: Arc<dyn MetaStore>,
    sched_ctx: Arc<SchedContext>,
    cfg: ScheduleConfig,
    metrics: Arc<Metrics>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    unsafe_recovery: AtomicBool,
    reported_regions: AtomicUsize,
    started_at: Mutex<Option<Instant>>,
    /// Per-region replica isolation level, refreshed by patrol.
    label_stats: Mutex<HashMap<crate::region::RegionId, String>>,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        controller: Arc<ClusterController>,
        checkers: Arc<CheckerController>,
        op_controller: Arc<OperatorController>,
        registry: SchedulerRegistry,
        meta_store: Arc<dyn MetaStore>,
        id_alloc: Arc<crate::id_alloc::IdAllocator>,
        cfg: ScheduleConfig,
        replication: ReplicationConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let metrics = Arc::clone(&controller.metrics);
        let sched_ctx = Arc::new(SchedContext {
            cluster: Arc::clone(&controller.cluster),
            cfg: cfg.clone(),
            replication,
            rule_manager: Arc::clone(&controller.rule_manager),
            op_controller: Arc::clone(&op_controller),
            hot_cache: Arc::clone(&controller.hot_cache),
            limiter: Arc::clone(&controller.limiter),
            id_alloc,
        });
        Self {
            controller,
            checkers,
            op_controller,
            schedulers: RwLock::new(HashMap::new()),
            registry,
            meta_store,
            sched_ctx,
            cfg,
            metrics,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            unsafe_recovery: AtomicBool::new(false),
            reported_regions: AtomicUsize::new(0),
            started_at: Mutex::new(None),
            label_stats: Mutex::new(HashMap::new()),
        }
    }

    /// Regions per isolation level ("none", or the outermost location label
    /// at which every replica pair is separated).
    pub fn label_level_stats(&self) -> HashMap<String, usize> {
        let stats = self.label_stats.lock().unwrap_or_else(|e| e.into_inner());
        let mut counts = HashMap::new();
        for level in stats.values() {
            *counts.entry(level.clone()).or_insert(0) += 1;
        }
        counts
    }

    fn update_label_stats(&self, regions: &[Arc<RegionInfo>]) {
        let labels = &self.sched_ctx.replication.location_labels;
        if labels.is_empty() {
            return;
        }
        let mut stats = self.label_stats.lock().unwrap_or_else(|e| e.into_inner());
        for region in regions {
            let stores: Vec<_> = region
                .store_ids()
                .filter_map(|id| self.controller.cluster.get_store(id))
                .collect();
            let mut level = labels.len();
            for (i, a) in stores.iter().enumerate() {
                for b in stores.iter().skip(i + 1) {
                    let diff = a.compare_location(b, labels).unwrap_or(labels.len());
                    level = level.min(diff);
                }
            }
            let key = if stores.len() <= 1 || level >= labels.len() {
                "none".to_string()
            } else {
                labels[level].clone()
            };
            stats.insert(region.id, key);
        }
    }

    pub fn set_unsafe_recovery(&self, running: bool) {
        self.unsafe_recovery.store(running, Ordering::Release);
    }

    pub fn is_unsafe_recovery(&self) -> bool {
        self.unsafe_recovery.load(Ordering::Acquire)
    }

    /// Heartbeat intake tells the prepare checker how much of the cluster
    /// has reported in.
    pub fn collect_new_region(&self) {
        self.reported_regions.fetch_add(1, Ordering::Relaxed);
    }

    /// Whether enough topology is known for scheduling to be meaningful.
    pub fn should_run(&self) -> bool {
        if self.controller.prepared.load(Ordering::Acquire) {
            return true;
        }
        let total = self.controller.cluster.region_count();
        if total == 0 {
            return false;
        }
        let reported = self.reported_regions.load(Ordering::Relaxed);
        let collected = reported as f64 >= total as f64 * PREPARE_COLLECT_FACTOR;
        let timed_out = self
            .started_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map(|at| at.elapsed() >= PREPARE_COLLECT_TIMEOUT)
            .unwrap_or(false);
        if collected || timed_out {
            self.controller.prepared.store(true, Ordering::Release);
            return true;
        }
        false
    }

    // Scheduler lifecycle.

    async fn persist_scheduler_config(&self, name: &str, cfg: &SchedulerConfig) {
        let key = self.controller.layout().scheduler_config(name);
        let raw = match serde_json::to_vec(cfg) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::error!(name, error = %err, "failed to encode scheduler config");
                return;
            }
        };
        for attempt in 0..PERSIST_CONFIG_RETRIES {
            match self.meta_store.put(&key, raw.clone()).await {
                Ok(()) => return,
                Err(err) if attempt + 1 == PERSIST_CONFIG_RETRIES => {
                    // The in-memory change stands; reconciliation happens on
                    // the next restart.
                    tracing::error!(name, error = %err, "failed to persist scheduler config");
                }
                Err(_) => tokio::time::sleep(PERSIST_RETRY_BACKOFF).await,
            }
        }
    }

    async fn load_scheduler_configs(&self) -> anyhow::Result<Vec<(String, SchedulerConfig)>> {
        let prefix = self.controller.layout().scheduler_prefix();
        let mut last_err = None;
        for _ in 0..MAX_LOAD_CONFIG_RETRIES {
            match self.meta_store.range(&prefix, "", 0).await {
                Ok(entries) => {
                    let mut configs = Vec::new();
                    for (key, raw) in entries {
                        let name = key.trim_start_matches(&prefix).to_string();
                        match serde_json::from_slice::<SchedulerConfig>(&raw) {
                            Ok(cfg) => configs.push((name, cfg)),
                            Err(err) => {
                                tracing::error!(name, error = %err, "undecodable scheduler config")
                            }
                        }
                    }
                    return Ok(configs);
                }
                Err(err) => {
                    last_err = Some(err);
                    tokio::time::sleep(PERSIST_RETRY_BACKOFF).await;
                }
            }
        }
        Err(last_err.unwrap()).context("loading scheduler configs")
    }

    pub async fn add_scheduler(&self, kind: &str, args: Vec<String>) -> crate::error::Result<String> {
        let scheduler = self.registry.build(kind, &args)?;
        let name = scheduler.name().to_string();
        {
            let mut schedulers = self.schedulers.write().unwrap_or_else(|e| e.into_inner());
            if schedulers.contains_key(&name) {
                return Err(Error::SchedulerExisted(name));
            }
            schedulers.insert(name.clone(), Arc::new(ScheduleController::new(scheduler)));
        }
        self.persist_scheduler_config(&name, &SchedulerConfig::new(kind, args))
            .await;
        tracing::info!(name, "scheduler added");
        Ok(name)
    }

    pub async fn remove_scheduler(&self, name: &str) -> crate::error::Result<()> {
        {
            let mut schedulers = self.schedulers.write().unwrap_or_else(|e| e.into_inner());
            if schedulers.remove(name).is_none() {
                return Err(Error::SchedulerNotFound(name.to_string()));
            }
        }
        let key = self.controller.layout().scheduler_config(name);
        if let Err(err) = self.meta_store.delete(&key).await {
            tracing::error!(name, error = %err, "failed to delete scheduler config");
        }
        tracing::info!(name, "scheduler removed");
        Ok(())
    }

    pub async fn pause_scheduler(&self, name: &str, seconds: u64) -> crate::error::Result<()> {
        let controller = {
            let schedulers = self.schedulers.read().unwrap_or_else(|e| e.into_inner());
            schedulers
                .get(name)
                .cloned()
                .ok_or_else(|| Error::SchedulerNotFound(name.to_string()))?
        };
        controller.pause_for(seconds);
        // Read-modify-write so the scheduler's args survive the state flip.
        let key = self.controller.layout().scheduler_config(name);
        let mut cfg = match self.meta_store.get(&key).await {
            Ok(Some(raw)) => serde_json::from_slice::<SchedulerConfig>(&raw)
                .unwrap_or_else(|_| SchedulerConfig::new(controller.kind(), Vec::new())),
            _ => SchedulerConfig::new(controller.kind(), Vec::new()),
        };
        cfg.paused_until = controller.paused_until();
        cfg.disabled = controller.is_disabled();
        self.persist_scheduler_config(name, &cfg).await;
        Ok(())
    }

    pub fn scheduler_names(&self) -> Vec<String> {
        let schedulers = self.schedulers.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = schedulers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_scheduler_paused(&self, name: &str) -> crate::error::Result<bool> {
        let schedulers = self.schedulers.read().unwrap_or_else(|e| e.into_inner());
        schedulers
            .get(name)
            .map(|c| c.is_paused())
            .ok_or_else(|| Error::SchedulerNotFound(name.to_string()))
    }

    pub fn is_scheduler_disabled(&self, name: &str) -> crate::error::Result<bool> {
        let schedulers = self.schedulers.read().unwrap_or_else(|e| e.into_inner());
        schedulers
            .get(name)
            .map(|c| c.is_disabled())
            .ok_or_else(|| Error::SchedulerNotFound(name.to_string()))
    }

    // Startup and loops.

    /// Load persisted schedulers (falling back to the defaults on first
    /// start) and spawn the background loops. Fatal if configs stay
    /// unloadable after every retry.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        *self.started_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());

        let mut configs = self.load_scheduler_configs().await?;
        if configs.is_empty() {
            configs = default_scheduler_configs();
            for (name, cfg) in &configs {
                self.persist_scheduler_config(name, cfg).await;
            }
        }
        for (name, cfg) in configs {
            match self.registry.build(&cfg.kind, &cfg.args) {
                Ok(scheduler) => {
                    let controller = ScheduleController::new(scheduler);
                    controller.restore(&cfg);
                    self.schedulers
                        .write()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(name, Arc::new(controller));
                }
                Err(err) => {
                    tracing::error!(name, kind = %cfg.kind, error = %err, "unknown scheduler kind")
                }
            }
        }

        self.spawn_patrol();
        self.spawn_suspect_ranges();
        self.spawn_drive_push();
        self.spawn_schedulers();
        tracing::info!("coordinator started");
        Ok(())
    }

    /// Signal every loop and join them.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
        self.op_controller.cancel_all();
        tracing::info!("coordinator stopped");
    }

    fn spawn(&self, task: JoinHandle<()>) {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).push(task);
    }

    fn spawn_patrol(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.cfg.patrol_region_interval);
            let mut key: Vec<u8> = Vec::new();
            let mut cycle_start = Instant::now();
            tracing::info!("coordinator starts patrol regions");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => {
                        tracing::info!("patrol regions has been stopped");
                        return;
                    }
                }
                if this.is_unsafe_recovery() || !this.should_run() {
                    continue;
                }
                key = this.patrol_round(key).await;
                if key.is_empty() {
                    Metrics::incr(&this.metrics.patrol_cycles);
                    Metrics::set(
                        &this.metrics.patrol_last_cycle_ms,
                        cycle_start.elapsed().as_millis() as u64,
                    );
                    cycle_start = Instant::now();
                }
            }
        });
        self.spawn(task);
    }

    /// One patrol batch starting at `key`; returns the key to resume from
    /// (empty when the scan wrapped).
    async fn patrol_round(&self, key: Vec<u8>) -> Vec<u8> {
        // Suspects drain ahead of the ordered scan.
        self.check_suspect_regions().await;
        self.check_waiting_regions().await;

        let regions = self
            .controller
            .cluster
            .scan_range(&key, b"", PATROL_SCAN_REGION_LIMIT);
        if regions.is_empty() {
            return Vec::new();
        }
        let mut next_key = key;
        for region in &regions {
            next_key = region.end_key.clone();
            if self.op_controller.has_operator(region.id) {
                continue;
            }
            self.check_one_region(region).await;
        }
        self.update_label_stats(&regions);
        next_key
    }

    async fn check_one_region(&self, region: &RegionInfo) {
        let ops = match self.checkers.check_region(region).await {
            Ok(ops) => ops,
            Err(err) => {
                tracing::warn!(region_id = region.id, error = %err, "checker failed");
                return;
            }
        };
        if ops.is_empty() {
            return;
        }
        let within_limit = ops.iter().all(|op| !self.op_controller.exceed_store_limit(op));
        if within_limit {
            for op in ops {
                Metrics::incr(&self.metrics.checker_operators);
                Metrics::incr(&self.metrics.operators_created);
                self.op_controller.add_operator(op);
            }
            self.checkers.remove_waiting_region(region.id);
            self.checkers.remove_suspect_region(region.id);
        } else {
            self.checkers.add_waiting_region(region.id);
        }
    }

    async fn check_suspect_regions(&self) {
        for id in self.checkers.get_suspect_regions() {
            let Some(region) = self.controller.cluster.get_region(id) else {
                // Possibly a recent split; keep waiting for its heartbeat.
                continue;
            };
            if self.op_controller.has_operator(id) {
                self.checkers.remove_suspect_region(id);
                continue;
            }
            self.check_one_region(&region).await;
        }
    }

    async fn check_waiting_regions(&self) {
        for id in self.checkers.get_waiting_regions() {
            let Some(region) = self.controller.cluster.get_region(id) else {
                continue;
            };
            if self.op_controller.has_operator(id) {
                self.checkers.remove_waiting_region(id);
                continue;
            }
            self.check_one_region(&region).await;
        }
    }

    fn spawn_suspect_ranges(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CHECK_SUSPECT_RANGES_INTERVAL);
            tracing::info!("coordinator begins to check suspect key ranges");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => {
                        tracing::info!("check suspect key ranges has been stopped");
                        return;
                    }
                }
                let Some((start, end)) = this.checkers.pop_one_suspect_key_range() else {
                    continue;
                };
                let regions = this
                    .controller
                    .cluster
                    .scan_range(&start, &end, SUSPECT_RANGE_SCAN_LIMIT);
                if regions.is_empty() {
                    continue;
                }
                // A partial scan leaves the tail re-queued for later.
                let last = &regions[regions.len() - 1];
                if !last.end_key.is_empty() && (end.is_empty() || last.end_key < end) {
                    this.checkers.add_suspect_key_range(last.end_key.clone(), end);
                }
                this.checkers
                    .add_suspect_regions(regions.iter().map(|r| r.id));
            }
        });
        self.spawn(task);
    }

    fn spawn_drive_push(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PUSH_OPERATOR_TICK);
            tracing::info!("coordinator begins to actively drive push operator");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => {
                        tracing::info!("drive push operator has been stopped");
                        return;
                    }
                }
                // Re-notification is idempotent; the interesting side effect
                // is the timeout sweep.
                let _ = this.op_controller.push_operators();
            }
        });
        self.spawn(task);
    }

    fn spawn_schedulers(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let task = tokio::spawn(async move {
            // Wait for cluster information before the first schedule.
            let mut ready_ticker = tokio::time::interval(RUN_SCHEDULER_CHECK_INTERVAL);
            loop {
                tokio::select! {
                    _ = ready_ticker.tick() => {}
                    _ = shutdown.changed() => return,
                }
                if this.should_run() {
                    tracing::info!("coordinator has finished cluster information preparation");
                    break;
                }
            }
            let mut ticker = tokio::time::interval(SCHEDULER_DRIVE_TICK);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => {
                        tracing::info!("schedulers have been stopped");
                        return;
                    }
                }
                if this.is_unsafe_recovery() {
                    continue;
                }
                let controllers: Vec<Arc<ScheduleController>> = {
                    let schedulers = this.schedulers.read().unwrap_or_else(|e| e.into_inner());
                    schedulers.values().cloned().collect()
                };
                for controller in controllers {
                    for op in controller.run_once(&this.sched_ctx).await {
                        Metrics::incr(&this.metrics.scheduler_operators);
                        Metrics::incr(&this.metrics.operators_created);
                        this.op_controller.add_operator(op);
                    }
                }
            }
        });
        self.spawn(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::BasicCluster;
    use crate::controller::ClusterMeta;
    use crate::hot_stats::HotCache;
    use crate::id_alloc::IdAllocator;
    use crate::region::{Peer, RegionEpoch};
    use crate::rules::RuleManager;
    use crate::store::{NodeState, StoreId, StoreInfo, StoreMeta};
    use crate::store_limit::StoreLimiter;
    use meridian_meta::MemStore;

    async fn build() -> (Arc<Coordinator>, Arc<MemStore>) {
        let meta_store = Arc::new(MemStore::new());
        build_with_store(meta_store).await
    }

    async fn build_with_store(meta_store: Arc<MemStore>) -> (Arc<Coordinator>, Arc<MemStore>) {
        let replication = ReplicationConfig::default();
        let cfg = ScheduleConfig::default();
        let cluster = Arc::new(BasicCluster::new());
        let limiter = Arc::new(StoreLimiter::new(
            cfg.store_limit_add_peer,
            cfg.store_limit_remove_peer,
        ));
        let rule_manager = Arc::new(RuleManager::new(&replication));
        let id_alloc = Arc::new(IdAllocator::new(
            meta_store.clone() as Arc<dyn MetaStore>,
            "/1/alloc_id".into(),
        ));
        let controller = Arc::new(ClusterController::new(
            1,
            meta_store.clone(),
            Arc::clone(&cluster),
            Arc::new(HotCache::new()),
            Arc::clone(&limiter),
            Arc::clone(&rule_manager),
            Arc::new(Metrics::new()),
            cfg.clone(),
            replication.clone(),
        ));
        let checkers = Arc::new(CheckerController::new(
            cluster,
            rule_manager,
            Arc::clone(&id_alloc),
            cfg.clone(),
            replication.clone(),
        ));
        let op_controller = Arc::new(OperatorController::new(cfg.clone(), limiter));
        let coordinator = Arc::new(Coordinator::new(
            controller,
            checkers,
            op_controller,
            SchedulerRegistry::default(),
            meta_store.clone(),
            id_alloc,
            cfg,
            replication,
        ));
        (coordinator, meta_store)
    }

    async fn bootstrap_with_stores(coordinator: &Arc<Coordinator>, stores: &[StoreId]) {
        let peers = vec![Peer::voter(100, stores[0])];
        let mut region = RegionInfo::new(1, vec![], vec![], peers.clone());
        region.leader = Some(peers[0]);
        region.epoch = RegionEpoch::new(1, 1);
        coordinator
            .controller
            .bootstrap(
                ClusterMeta {
                    cluster_id: 1,
                    max_replicas: 3,
                },
                StoreMeta::new(stores[0], format!("s{}", stores[0])),
                region,
            )
            .await
            .unwrap();
        for &id in &stores[1..] {
            coordinator
                .controller
                .put_store(StoreMeta::new(id, format!("s{id}")))
                .await
                .unwrap();
        }
        for &id in stores {
            let store = coordinator.controller.cluster.get_store(id).unwrap();
            coordinator.controller.cluster.put_store(
                store
                    .with_state(NodeState::Serving)
                    .with_last_heartbeat(Instant::now()),
            );
        }
    }

    #[tokio::test]
    async fn start_installs_default_schedulers_and_persists_them() {
        let (coordinator, meta_store) = build().await;
        bootstrap_with_stores(&coordinator, &[1, 2, 3]).await;
        coordinator.start().await.unwrap();

        let names = coordinator.scheduler_names();
        assert!(names.contains(&"balance-leader-scheduler".to_string()));
        assert!(names.contains(&"balance-region-scheduler".to_string()));
        assert!(names.contains(&"hot-region-scheduler".to_string()));

        let persisted = meta_store.range("/1/schedulers/", "", 0).await.unwrap();
        assert_eq!(persisted.len(), names.len());
        coordinator.stop().await;
    }

    #[tokio::test]
    async fn scheduler_state_survives_restart() {
        let (coordinator, meta_store) = build().await;
        bootstrap_with_stores(&coordinator, &[1, 2, 3]).await;
        coordinator.start().await.unwrap();
        coordinator
            .pause_scheduler("balance-leader-scheduler", 3600)
            .await
            .unwrap();
        coordinator.stop().await;

        let (restarted, _) = build_with_store(meta_store).await;
        restarted.controller.load_cluster_info().await.unwrap();
        restarted.start().await.unwrap();
        assert!(restarted
            .is_scheduler_paused("balance-leader-scheduler")
            .unwrap());
        restarted.stop().await;
    }

    #[tokio::test]
    async fn add_remove_pause_schedulers() {
        let (coordinator, _) = build().await;
        bootstrap_with_stores(&coordinator, &[1, 2, 3]).await;
        coordinator.start().await.unwrap();

        let name = coordinator
            .add_scheduler("evict-leader", vec!["2".to_string()])
            .await
            .unwrap();
        assert!(matches!(
            coordinator
                .add_scheduler("evict-leader", vec!["2".to_string()])
                .await
                .unwrap_err(),
            Error::SchedulerExisted(_)
        ));
        coordinator.pause_scheduler(&name, 60).await.unwrap();
        assert!(coordinator.is_scheduler_paused(&name).unwrap());
        coordinator.pause_scheduler(&name, 0).await.unwrap();
        assert!(!coordinator.is_scheduler_paused(&name).unwrap());
        coordinator.remove_scheduler(&name).await.unwrap();
        assert!(matches!(
            coordinator.remove_scheduler(&name).await.unwrap_err(),
            Error::SchedulerNotFound(_)
        ));
        coordinator.stop().await;
    }

    #[tokio::test]
    async fn patrol_repairs_underreplicated_region() {
        let (coordinator, _) = build().await;
        bootstrap_with_stores(&coordinator, &[1, 2, 3]).await;
        // One-replica region in a three-store cluster wants two more peers.
        let region = coordinator.controller.cluster.get_region(1).unwrap();
        coordinator.collect_new_region();
        assert!(coordinator.should_run());
        coordinator.check_one_region(&region).await;
        assert!(coordinator.op_controller.has_operator(1));
        let (desc, _, _) = coordinator.op_controller.get_operator(1).unwrap();
        assert_eq!(desc, "add-rule-peer");
    }

    #[tokio::test]
    async fn suspect_range_scan_enqueues_regions() {
        let (coordinator, _) = build().await;
        bootstrap_with_stores(&coordinator, &[1, 2, 3]).await;
        coordinator
            .checkers
            .add_suspect_key_range(Vec::new(), Vec::new());
        let (start, end) = coordinator.checkers.pop_one_suspect_key_range().unwrap();
        let regions = coordinator.controller.cluster.scan_range(&start, &end, 1024);
        coordinator
            .checkers
            .add_suspect_regions(regions.iter().map(|r| r.id));
        assert_eq!(coordinator.checkers.get_suspect_regions(), vec![1]);
    }

    #[tokio::test]
    async fn unsafe_recovery_suppresses_patrol() {
        let (coordinator, _) = build().await;
        bootstrap_with_stores(&coordinator, &[1, 2, 3]).await;
        coordinator.set_unsafe_recovery(true);
        assert!(coordinator.is_unsafe_recovery());
        coordinator.set_unsafe_recovery(false);
        assert!(!coordinator.is_unsafe_recovery());
    }

    #[tokio::test]
    async fn stop_joins_all_loops() {
        let (coordinator, _) = build().await;
        bootstrap_with_stores(&coordinator, &[1, 2, 3]).await;
        coordinator.start().await.unwrap();
        // Must return promptly, with every loop observing the signal.
        tokio::time::timeout(Duration::from_secs(5), coordinator.stop())
            .await
            .expect("stop timed out");
    }

    #[tokio::test]
    async fn prepare_checker_gates_on_reported_share() {
        let (coordinator, _) = build().await;
        bootstrap_with_stores(&coordinator, &[1, 2, 3]).await;
        // Several regions, none reported yet.
        for id in 2..=10u64 {
            let peers = vec![Peer::voter(id * 10, 1)];
            let mut region = RegionInfo::new(
                id,
                format!("k{id:03}").into_bytes(),
                format!("k{:03}", id + 1).into_bytes(),
                peers.clone(),
            );
            region.leader = Some(peers[0]);
            region.epoch = RegionEpoch::new(1, 1);
            coordinator.controller.cluster.put_region(region);
        }
        assert!(!coordinator.should_run());
        for _ in 0..10 {
            coordinator.collect_new_region();
        }
        assert!(coordinator.should_run());
    }
}
