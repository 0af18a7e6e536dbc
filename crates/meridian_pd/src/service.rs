//! The driver's service surface and process assembly.
//!
//! `PdServer` wires the subsystems together and exposes the RPC operations
//! as in-process async methods; the wire transport is an external
//! collaborator that calls straight into these. Admin operations return
//! HTTP-status-shaped results so the admin surface can map them 1:1.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use meridian_meta::{save_json, Election, MetaStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::checkers::CheckerController;
use crate::cluster::BasicCluster;
use crate::config::PdConfig;
use crate::controller::{ClusterController, ClusterMeta, HeartbeatOutcome};
use crate::coordinator::Coordinator;
use crate::error::{Error, Result};
use crate::hot_stats::HotCache;
use crate::id_alloc::IdAllocator;
use crate::metrics::Metrics;
use crate::operator::{OpStatus, OpStep, OperatorController};
use crate::region::{BucketStat, PeerId, RegionId, RegionInfo};
use crate::rules::{Rule, RuleManager};
use crate::schedulers::SchedulerRegistry;
use crate::store::{StoreId, StoreInfo, StoreLabel, StoreMeta, StoreStats};
use crate::store_limit::{StoreLimitType, StoreLimiter};
use crate::tso::{TsoAllocator, TsoAllocatorManager, TsoResponse, GLOBAL_DC_LOCATION};

const CHECK_STORES_INTERVAL: Duration = Duration::from_secs(10);
const ELECTION_LEASE_TTL: Duration = Duration::from_secs(3);

/// Per-store limits piggybacked on the store-heartbeat response.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoreLimitsToApply {
    /// Regions per minute; `None` = unlimited.
    pub add_peer: Option<f64>,
    pub remove_peer: Option<f64>,
}

/// New ids granted for one half of a split.
#[derive(Debug, Clone)]
pub struct SplitArm {
    pub region_id: RegionId,
    pub peer_ids: Vec<PeerId>,
}

/// Status-shaped admin result, mirroring the HTTP admin surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminResponse {
    pub status: u16,
    pub body: String,
}

impl AdminResponse {
    fn ok() -> Self {
        Self {
            status: 200,
            body: String::new(),
        }
    }
}

/// Aggregate statistics over a key range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionStats {
    pub count: usize,
    pub storage_size: u64,
    pub storage_keys: u64,
}

pub struct PdServer {
    pub cfg: PdConfig,
    pub meta_store: Arc<dyn MetaStore>,
    pub election: Arc<dyn Election>,
    pub controller: Arc<ClusterController>,
    pub coordinator: Arc<Coordinator>,
    pub op_controller: Arc<OperatorController>,
    pub tso: Arc<TsoAllocatorManager>,
    pub id_alloc: Arc<IdAllocator>,
    pub metrics: Arc<Metrics>,
    replication_status: RwLock<String>,
    shutdown_tx: watch::Sender<bool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl PdServer {
    pub fn new(
        cfg: PdConfig,
        meta_store: Arc<dyn MetaStore>,
        election: Arc<dyn Election>,
    ) -> Arc<Self> {
        let layout = meridian_meta::KeyLayout::new(cfg.cluster_id);
        let metrics = Arc::new(Metrics::new());
        let cluster = Arc::new(BasicCluster::new());
        let hot_cache = Arc::new(HotCache::new());
        let limiter = Arc::new(StoreLimiter::new(
            cfg.schedule.store_limit_add_peer,
            cfg.schedule.store_limit_remove_peer,
        ));
        let rule_manager = Arc::new(RuleManager::new(&cfg.replication));
        let id_alloc = Arc::new(IdAllocator::new(
            Arc::clone(&meta_store),
            layout.id_alloc(),
        ));
        let controller = Arc::new(ClusterController::new(
            cfg.cluster_id,
            Arc::clone(&meta_store),
            Arc::clone(&cluster),
            Arc::clone(&hot_cache),
            Arc::clone(&limiter),
            Arc::clone(&rule_manager),
            Arc::clone(&metrics),
            cfg.schedule.clone(),
            cfg.replication.clone(),
        ));
        let checkers = Arc::new(CheckerController::new(
            cluster,
            Arc::clone(&rule_manager),
            Arc::clone(&id_alloc),
            cfg.schedule.clone(),
            cfg.replication.clone(),
        ));
        let op_controller = Arc::new(OperatorController::new(
            cfg.schedule.clone(),
            Arc::clone(&limiter),
        ));
        let coordinator = Arc::new(Coordinator::new(
            Arc::clone(&controller),
            checkers,
            Arc::clone(&op_controller),
            SchedulerRegistry::default(),
            Arc::clone(&meta_store),
            Arc::clone(&id_alloc),
            cfg.schedule.clone(),
            cfg.replication.clone(),
        ));

        let global = Arc::new(TsoAllocator::new(
            GLOBAL_DC_LOCATION,
            Arc::clone(&meta_store),
            Arc::clone(&election),
            layout.tso_timestamp(GLOBAL_DC_LOCATION),
            cfg.tso.clone(),
        ));
        let tso = Arc::new(TsoAllocatorManager::new(global));
        for dc in &cfg.dc_locations {
            tso.register_local(Arc::new(TsoAllocator::new(
                dc.clone(),
                Arc::clone(&meta_store),
                Arc::clone(&election),
                layout.tso_timestamp(dc),
                cfg.tso.clone(),
            )));
        }

        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            cfg,
            meta_store,
            election,
            controller,
            coordinator,
            op_controller,
            tso,
            id_alloc,
            metrics,
            replication_status: RwLock::new(String::new()),
            shutdown_tx,
            tasks: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Campaign, reload persisted state, start the coordinator and the
    /// background jobs.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        self.election.campaign(ELECTION_LEASE_TTL).await?;
        self.controller.load_cluster_info().await?;
        self.load_rules().await?;
        self.coordinator.start().await?;
        self.spawn_background_jobs();
        tracing::info!(cluster_id = self.cfg.cluster_id, "placement driver started");
        Ok(())
    }

    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
        self.coordinator.stop().await;
        tracing::info!("placement driver stopped");
    }

    fn spawn_background_jobs(self: &Arc<Self>) {
        // TSO physical-time maintenance.
        {
            let tso = Arc::clone(&self.tso);
            let interval = self.cfg.tso.update_physical_interval;
            let mut shutdown = self.shutdown_tx.subscribe();
            self.spawn(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = shutdown.changed() => return,
                    }
                    tso.global().maintain().await;
                }
            }));
        }
        // Store lifecycle sweep.
        {
            let controller = Arc::clone(&self.controller);
            let mut shutdown = self.shutdown_tx.subscribe();
            self.spawn(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(CHECK_STORES_INTERVAL);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = shutdown.changed() => return,
                    }
                    controller.check_stores().await;
                }
            }));
        }
        // Min-resolved-ts persistence.
        let interval = self.cfg.schedule.min_resolved_ts_persistence_interval;
        if !interval.is_zero() {
            let controller = Arc::clone(&self.controller);
            let mut shutdown = self.shutdown_tx.subscribe();
            self.spawn(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = shutdown.changed() => return,
                    }
                    if let Err(err) = controller.persist_min_resolved_ts().await {
                        tracing::warn!(error = %err, "failed to persist min resolved ts");
                    }
                }
            }));
        }
    }

    fn spawn(&self, task: JoinHandle<()>) {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).push(task);
    }

    async fn load_rules(&self) -> Result<()> {
        let prefix = self.controller.layout().rule_prefix();
        let entries = self.meta_store.range(&prefix, "", 0).await?;
        if entries.is_empty() {
            return Ok(());
        }
        let mut rules = Vec::new();
        for (key, raw) in entries {
            match serde_json::from_slice::<Rule>(&raw) {
                Ok(rule) => rules.push(rule),
                Err(err) => tracing::error!(key, error = %err, "undecodable placement rule"),
            }
        }
        self.controller.rule_manager.load_rules(rules)
    }

    // Core RPC surface.

    pub async fn bootstrap(
        &self,
        first_store: StoreMeta,
        first_region: RegionInfo,
    ) -> Result<()> {
        let meta = ClusterMeta {
            cluster_id: self.cfg.cluster_id,
            max_replicas: self.cfg.replication.max_replicas,
        };
        // Ids named by the bootstrapper are spoken for.
        let max_used = first_region
            .peers
            .iter()
            .map(|p| p.id)
            .chain([first_store.id, first_region.id])
            .max()
            .unwrap_or(0);
        self.id_alloc.advance_to(max_used + 1).await?;
        self.controller
            .bootstrap(meta, first_store, first_region)
            .await
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.controller.is_bootstrapped()
    }

    pub async fn alloc_id(&self) -> Result<u64> {
        self.id_alloc.alloc().await
    }

    pub async fn get_tso(&self, dc_location: &str, count: u32) -> Result<TsoResponse> {
        Metrics::incr(&self.metrics.tso_requests);
        let result = self.tso.get_ts(dc_location, count).await;
        if result.is_err() {
            Metrics::incr(&self.metrics.tso_errors);
        }
        result
    }

    pub async fn store_heartbeat(&self, stats: StoreStats) -> Result<StoreLimitsToApply> {
        let store_id = stats.store_id;
        self.controller.handle_store_heartbeat(stats).await?;
        Ok(StoreLimitsToApply {
            add_peer: self
                .controller
                .limiter
                .rate(store_id, StoreLimitType::AddPeer),
            remove_peer: self
                .controller
                .limiter
                .rate(store_id, StoreLimitType::RemovePeer),
        })
    }

    /// Region heartbeat: ingest, then answer with the next operator step
    /// for the region, if one is pending.
    pub async fn region_heartbeat(&self, region: RegionInfo) -> Result<Option<OpStep>> {
        let HeartbeatOutcome {
            is_new,
            evicted_overlaps,
        } = self.controller.process_region_heartbeat(region.clone()).await?;
        if is_new {
            self.coordinator.collect_new_region();
        }
        for evicted in evicted_overlaps {
            self.op_controller.on_region_removed(evicted);
        }
        Ok(self.op_controller.dispatch(&region))
    }

    pub fn report_buckets(&self, buckets: BucketStat) -> Result<()> {
        self.controller.process_report_buckets(buckets)
    }

    // Splits.

    pub async fn ask_split(&self, region: &RegionInfo) -> Result<SplitArm> {
        let mut arms = self.ask_batch_split(region, 1).await?;
        Ok(arms.remove(0))
    }

    /// Grant ids for `split_count` new regions. The node executes the split
    /// and reports back; the originals and the newborns all become suspects
    /// so the checkers revisit them promptly.
    pub async fn ask_batch_split(
        &self,
        region: &RegionInfo,
        split_count: u32,
    ) -> Result<Vec<SplitArm>> {
        if !self.is_bootstrapped() {
            return Err(Error::NotBootstrapped);
        }
        if split_count == 0 {
            return Err(Error::InvalidArgument("zero split count".into()));
        }
        if self
            .controller
            .cluster
            .get_region(region.id)
            .is_none()
        {
            return Err(Error::RegionNotFound(region.id));
        }
        let mut arms = Vec::with_capacity(split_count as usize);
        for _ in 0..split_count {
            let region_id = self.id_alloc.alloc().await?;
            let peer_ids = self.id_alloc.alloc_batch(region.peers.len()).await?;
            arms.push(SplitArm {
                region_id,
                peer_ids,
            });
        }
        let new_ids: Vec<RegionId> = arms.iter().map(|a| a.region_id).collect();
        self.coordinator
            .checkers
            .record_split(new_ids.iter().copied().chain([region.id]));
        self.coordinator
            .checkers
            .add_suspect_regions(new_ids.into_iter().chain([region.id]));
        Ok(arms)
    }

    pub fn report_split(&self, left: &RegionInfo, right: &RegionInfo) {
        self.report_batch_split(&[left.clone(), right.clone()]);
    }

    pub fn report_batch_split(&self, regions: &[RegionInfo]) {
        let ids: Vec<RegionId> = regions.iter().map(|r| r.id).collect();
        tracing::info!(?ids, "batch split reported");
        self.coordinator.checkers.record_split(ids.iter().copied());
        self.coordinator.checkers.add_suspect_regions(ids);
    }

    // Region queries.

    pub fn get_region(&self, key: &[u8]) -> Option<Arc<RegionInfo>> {
        self.controller.cluster.get_region_by_key(key)
    }

    pub fn get_prev_region(&self, key: &[u8]) -> Option<Arc<RegionInfo>> {
        self.controller.cluster.get_prev_region(key)
    }

    pub fn get_region_by_id(&self, region_id: RegionId) -> Option<Arc<RegionInfo>> {
        self.controller.cluster.get_region(region_id)
    }

    pub fn scan_regions(&self, start: &[u8], end: &[u8], limit: usize) -> Vec<Arc<RegionInfo>> {
        self.controller.cluster.scan_range(start, end, limit)
    }

    pub fn get_region_stats(&self, start: &[u8], end: &[u8]) -> RegionStats {
        let regions = self.controller.cluster.scan_range(start, end, 0);
        let mut stats = RegionStats {
            count: regions.len(),
            ..Default::default()
        };
        for region in regions {
            stats.storage_size += region.approximate_size;
            stats.storage_keys += region.approximate_keys;
        }
        stats
    }

    // Store operations.

    pub fn get_store(&self, store_id: StoreId) -> Result<Arc<StoreInfo>> {
        self.controller
            .cluster
            .get_store(store_id)
            .ok_or(Error::StoreNotFound(store_id))
    }

    pub fn get_all_stores(&self, exclude_tombstone: bool) -> Vec<Arc<StoreInfo>> {
        let mut stores = self.controller.cluster.get_stores();
        if exclude_tombstone {
            stores.retain(|s| !s.is_removed());
        }
        stores.sort_by_key(|s| s.id());
        stores
    }

    pub async fn put_store(&self, meta: StoreMeta) -> Result<()> {
        self.controller.put_store(meta).await
    }

    pub async fn remove_store(&self, store_id: StoreId, physically_destroyed: bool) -> Result<()> {
        self.controller
            .remove_store(store_id, physically_destroyed)
            .await
    }

    pub async fn bury_store(&self, store_id: StoreId, force: bool) -> Result<()> {
        self.controller.bury_store(store_id, force).await
    }

    pub async fn up_store(&self, store_id: StoreId) -> Result<()> {
        self.controller.up_store(store_id).await
    }

    pub async fn set_store_labels(
        &self,
        store_id: StoreId,
        labels: Vec<StoreLabel>,
        force: bool,
    ) -> Result<()> {
        self.controller
            .set_store_labels(store_id, labels, force)
            .await
    }

    pub fn set_store_limit(
        &self,
        store_id: StoreId,
        kind: StoreLimitType,
        rate_per_min: f64,
        ttl: Option<Duration>,
    ) -> Result<()> {
        self.get_store(store_id)?;
        self.controller
            .limiter
            .set_limit(store_id, kind, rate_per_min, ttl);
        Ok(())
    }

    pub fn min_resolved_ts(&self) -> u64 {
        self.controller.min_resolved_ts()
    }

    pub fn set_replication_status(&self, status: impl Into<String>) {
        *self
            .replication_status
            .write()
            .unwrap_or_else(|e| e.into_inner()) = status.into();
    }

    pub fn replication_status(&self) -> String {
        self.replication_status
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    // Operators and schedulers.

    pub fn get_operator(&self, region_id: RegionId) -> Result<(String, OpStatus, usize)> {
        if let Some(found) = self.op_controller.get_operator(region_id) {
            return Ok(found);
        }
        // Fall back to the finished-operator records.
        self.op_controller
            .records()
            .iter()
            .rev()
            .find(|r| r.region_id == region_id)
            .map(|r| (r.desc.clone(), r.status, 0))
            .ok_or(Error::OperatorNotFound(region_id))
    }

    pub fn cancel_operator(&self, region_id: RegionId) -> Result<()> {
        if self.op_controller.cancel_operator(region_id) {
            Ok(())
        } else {
            Err(Error::OperatorNotFound(region_id))
        }
    }

    pub async fn add_scheduler(&self, kind: &str, args: Vec<String>) -> Result<String> {
        self.coordinator.add_scheduler(kind, args).await
    }

    pub async fn remove_scheduler(&self, name: &str) -> Result<()> {
        self.coordinator.remove_scheduler(name).await
    }

    pub async fn pause_scheduler(&self, name: &str, seconds: u64) -> Result<()> {
        self.coordinator.pause_scheduler(name, seconds).await
    }

    // Placement rules.

    pub async fn set_rule(&self, rule: Rule) -> Result<()> {
        self.controller.rule_manager.set_rule(rule.clone())?;
        let key = self
            .controller
            .layout()
            .rule(&rule.group_id, &rule.id);
        save_json(self.meta_store.as_ref(), &key, &rule).await?;
        Ok(())
    }

    pub async fn delete_rule(&self, group_id: &str, id: &str) -> Result<()> {
        self.controller.rule_manager.delete_rule(group_id, id)?;
        let key = self.controller.layout().rule(group_id, id);
        self.meta_store.delete(&key).await?;
        Ok(())
    }

    pub fn get_rules(&self) -> Vec<Rule> {
        self.controller.rule_manager.get_rules()
    }

    // Admin surface.

    /// `POST /admin/reset-ts`.
    pub async fn admin_reset_ts(&self, body: &str) -> AdminResponse {
        #[derive(serde::Deserialize)]
        struct ResetTsBody {
            tso: String,
        }
        let parsed: ResetTsBody = match serde_json::from_str(body) {
            Ok(parsed) => parsed,
            Err(_) => {
                return AdminResponse {
                    status: 400,
                    body: "invalid json".to_string(),
                }
            }
        };
        let ts: u64 = match parsed.tso.parse() {
            Ok(ts) => ts,
            Err(_) => {
                return AdminResponse {
                    status: 400,
                    body: "invalid tso value".to_string(),
                }
            }
        };
        match self.tso.global().reset_ts(ts).await {
            Ok(()) => AdminResponse::ok(),
            Err(Error::TsoDelta(reason)) => AdminResponse {
                status: 403,
                body: reason.to_string(),
            },
            Err(err) => AdminResponse {
                status: 500,
                body: err.to_string(),
            },
        }
    }

    /// `DELETE /admin/cache/region/{id}`.
    pub fn admin_drop_region_cache(&self, region_id: RegionId) -> AdminResponse {
        self.controller.cluster.remove_region(region_id);
        self.op_controller.on_region_removed(region_id);
        AdminResponse::ok()
    }

    /// `DELETE /admin/cache/regions`.
    pub fn admin_drop_all_region_cache(&self) -> AdminResponse {
        self.controller.cluster.clear_regions();
        self.op_controller.cancel_all();
        AdminResponse::ok()
    }

    /// `POST /admin/persist-file/{name}`; only JSON content is accepted.
    pub async fn admin_persist_file(&self, name: &str, content: &[u8]) -> AdminResponse {
        if serde_json::from_slice::<serde_json::Value>(content).is_err() {
            return AdminResponse {
                status: 400,
                body: "body is not json".to_string(),
            };
        }
        let key = format!("/{}/persist-file/{name}", self.cfg.cluster_id);
        match self.meta_store.put(&key, content.to_vec()).await {
            Ok(()) => AdminResponse::ok(),
            Err(err) => AdminResponse {
                status: 500,
                body: err.to_string(),
            },
        }
    }
}
