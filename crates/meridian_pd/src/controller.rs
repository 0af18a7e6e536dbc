//! Cluster controller: heartbeat intake, the store lifecycle state machine,
//! warm-up/drain progress, and min-resolved-ts tracking.
//!
//! The controller owns no scheduling decisions; it keeps the topology view
//! consistent and persists what must survive a restart. Heartbeat paths
//! recover locally: persistence failures are logged and the cache stays
//! authoritative (a restart rebuilds from whatever made it to the
//! MetaStore).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use meridian_meta::{save_json, KeyLayout, MetaStore};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::cluster::BasicCluster;
use crate::config::{ReplicationConfig, ScheduleConfig};
use crate::error::{Error, Result};
use crate::hot_stats::{HotCache, PeerLoad, RwKind, DIM_LEN};
use crate::metrics::Metrics;
use crate::region::{region_guide, BucketStat, RegionId, RegionInfo};
use crate::rules::{match_label_constraints, RuleManager};
use crate::store::{
    merge_labels, validate_labels, NodeState, StoreId, StoreInfo, StoreLabel, StoreMeta,
    StoreStats,
};
use crate::store_limit::{SceneTracker, StoreLimiter};

/// Below this region count the cluster is too young for warm-up gating.
const INIT_CLUSTER_REGION_THRESHOLD: usize = 100;
/// Fraction of the expected share a preparing store must hold to serve.
const COLLECT_FACTOR: f64 = 0.9;
const BUCKET_CAS_RETRIES: usize = 3;
const CHANGED_REGION_QUEUE: usize = 1024;

/// Persisted cluster descriptor under `raft`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMeta {
    pub cluster_id: u64,
    pub max_replicas: usize,
}

#[derive(Debug, Clone)]
struct ProgressEntry {
    action: &'static str,
    total: f64,
    remaining: f64,
    started: Instant,
}

pub struct ClusterController {
    pub cluster: Arc<BasicCluster>,
    pub hot_cache: Arc<HotCache>,
    pub limiter: Arc<StoreLimiter>,
    pub rule_manager: Arc<RuleManager>,
    pub metrics: Arc<Metrics>,
    store: Arc<dyn MetaStore>,
    layout: KeyLayout,
    cfg: ScheduleConfig,
    replication: ReplicationConfig,
    scene: SceneTracker,
    bootstrapped: AtomicBool,
    meta: RwLock<Option<ClusterMeta>>,
    /// Set by the coordinator once enough regions have reported.
    pub prepared: Arc<AtomicBool>,
    progress: Mutex<HashMap<String, ProgressEntry>>,
    min_resolved_ts: AtomicU64,
    changed_tx: mpsc::Sender<Arc<RegionInfo>>,
    changed_rx: Mutex<Option<mpsc::Receiver<Arc<RegionInfo>>>>,
}

/// What a region heartbeat did, so the caller can clean up derived state.
#[derive(Debug, Default)]
pub struct HeartbeatOutcome {
    pub is_new: bool,
    pub evicted_overlaps: Vec<RegionId>,
}

impl ClusterController {
    pub fn new(
        cluster_id: u64,
        store: Arc<dyn MetaStore>,
        cluster: Arc<BasicCluster>,
        hot_cache: Arc<HotCache>,
        limiter: Arc<StoreLimiter>,
        rule_manager: Arc<RuleManager>,
        metrics: Arc<Metrics>,
        cfg: ScheduleConfig,
        replication: ReplicationConfig,
    ) -> Self {
        let (changed_tx, changed_rx) = mpsc::channel(CHANGED_REGION_QUEUE);
        Self {
            cluster,
            hot_cache,
            limiter,
            rule_manager,
            metrics,
            store,
            layout: KeyLayout::new(cluster_id),
            cfg,
            replication,
            scene: SceneTracker::default(),
            bootstrapped: AtomicBool::new(false),
            meta: RwLock::new(None),
            prepared: Arc::new(AtomicBool::new(false)),
            progress: Mutex::new(HashMap::new()),
            min_resolved_ts: AtomicU64::new(0),
            changed_tx,
            changed_rx: Mutex::new(Some(changed_rx)),
        }
    }

    pub fn layout(&self) -> &KeyLayout {
        &self.layout
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrapped.load(Ordering::Acquire)
    }

    fn ensure_bootstrapped(&self) -> Result<()> {
        if self.is_bootstrapped() {
            Ok(())
        } else {
            Err(Error::NotBootstrapped)
        }
    }

    /// The region-sync subscriber side; can be taken once.
    pub fn take_changed_regions(&self) -> Option<mpsc::Receiver<Arc<RegionInfo>>> {
        self.changed_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    // Bootstrap and reload.

    pub async fn bootstrap(
        &self,
        meta: ClusterMeta,
        first_store: StoreMeta,
        first_region: RegionInfo,
    ) -> Result<()> {
        if self.is_bootstrapped() {
            return Err(Error::AlreadyBootstrapped);
        }
        save_json(self.store.as_ref(), &self.layout.cluster_meta(), &meta).await?;
        save_json(
            self.store.as_ref(),
            &self.layout.store(first_store.id),
            &first_store,
        )
        .await?;
        save_json(
            self.store.as_ref(),
            &self.layout.region(first_region.id),
            &first_region,
        )
        .await?;

        self.cluster.put_store(StoreInfo::new(first_store));
        self.cluster.put_region(first_region);
        *self.meta.write().unwrap_or_else(|e| e.into_inner()) = Some(meta);
        self.bootstrapped.store(true, Ordering::Release);
        tracing::info!("cluster bootstrapped");
        Ok(())
    }

    /// Rebuild the in-memory view from persisted state after a restart or
    /// leadership hand-over.
    pub async fn load_cluster_info(&self) -> Result<()> {
        let meta_raw = self.store.get(&self.layout.cluster_meta()).await?;
        let Some(meta_raw) = meta_raw else {
            return Ok(());
        };
        let meta: ClusterMeta = serde_json::from_slice(&meta_raw)
            .map_err(|e| meridian_meta::MetaError::Internal(e.to_string()))?;

        for (_, raw) in self
            .store
            .range(&self.layout.store_prefix(), "", 0)
            .await?
        {
            match serde_json::from_slice::<StoreMeta>(&raw) {
                Ok(store_meta) => self.cluster.put_store(StoreInfo::new(store_meta)),
                Err(err) => tracing::error!(error = %err, "skipping undecodable store record"),
            }
        }
        for (_, raw) in self
            .store
            .range(&self.layout.region_prefix(), "", 0)
            .await?
        {
            match serde_json::from_slice::<RegionInfo>(&raw) {
                Ok(region) => {
                    self.cluster.put_region(region);
                }
                Err(err) => tracing::error!(error = %err, "skipping undecodable region record"),
            }
        }
        if let Some(raw) = self.store.get(&self.layout.min_resolved_ts()).await? {
            if let Some(ts) = std::str::from_utf8(&raw).ok().and_then(|s| s.parse().ok()) {
                self.min_resolved_ts.store(ts, Ordering::Release);
            }
        }
        tracing::info!(
            stores = self.cluster.store_count(),
            regions = self.cluster.region_count(),
            "cluster info loaded"
        );
        *self.meta.write().unwrap_or_else(|e| e.into_inner()) = Some(meta);
        self.bootstrapped.store(true, Ordering::Release);
        Ok(())
    }

    /// A cluster counts as initialized once it has split at least once, or
    /// its first region is fully replicated and settled.
    pub fn is_initialized(&self) -> bool {
        let regions = self.cluster.get_regions();
        if regions.len() > 1 {
            return true;
        }
        match regions.first() {
            None => false,
            Some(region) => {
                region.voters().count() >= self.replication.max_replicas
                    && region.pending_peers.is_empty()
            }
        }
    }

    // Store heartbeat path.

    pub async fn handle_store_heartbeat(&self, stats: StoreStats) -> Result<()> {
        self.ensure_bootstrapped()?;
        Metrics::incr(&self.metrics.store_heartbeats);
        let store_id = stats.store_id;
        let store = self
            .cluster
            .get_store(store_id)
            .ok_or(Error::StoreNotFound(store_id))?;

        let mut updated = store
            .with_stats(stats.clone())
            .with_last_heartbeat(Instant::now());
        if updated.is_low_space(self.cfg.low_space_ratio) {
            tracing::warn!(
                store_id,
                capacity = updated.capacity(),
                available = updated.available(),
                "store does not have enough disk space"
            );
        }
        if updated.need_persist() {
            match save_json(
                self.store.as_ref(),
                &self.layout.store(store_id),
                &updated.meta,
            )
            .await
            {
                Ok(()) => updated = updated.with_persisted_now(),
                Err(err) => tracing::error!(store_id, error = %err, "failed to persist store"),
            }
        }
        self.cluster.put_store(updated);

        if self.cfg.store_limit_mode == "auto" {
            self.scene.collect(&stats);
        }

        // Per-peer read flow feeds the hot cache off the heartbeat path.
        let interval = stats.interval.duration();
        let mut reported: HashSet<RegionId> = HashSet::new();
        for peer_stat in &stats.peer_stats {
            let region_id = peer_stat.region_id;
            reported.insert(region_id);
            let Some(region) = self.cluster.get_region(region_id) else {
                tracing::warn!(region_id, store_id, "discard hot peer stat for unknown region");
                continue;
            };
            if region.get_store_peer(store_id).is_none() {
                tracing::warn!(region_id, store_id, "discard hot peer stat for unknown peer");
                continue;
            }
            let mut deltas = [0.0; DIM_LEN];
            deltas[0] = peer_stat.read_bytes as f64;
            deltas[1] = peer_stat.read_keys as f64;
            deltas[2] = peer_stat.read_query as f64;
            self.hot_cache.check_async(
                RwKind::Read,
                PeerLoad {
                    region_id,
                    store_id,
                    deltas,
                    interval,
                },
                region,
            );
        }
        // Previously-hot peers the report skipped still cool down.
        self.hot_cache
            .collect_unreported_async(store_id, reported, interval);
        Ok(())
    }

    pub fn load_scene(&self) -> crate::store_limit::LoadScene {
        self.scene.scene()
    }

    // Region heartbeat path.

    pub async fn process_region_heartbeat(
        &self,
        mut region: RegionInfo,
    ) -> Result<HeartbeatOutcome> {
        self.ensure_bootstrapped()?;
        Metrics::incr(&self.metrics.region_heartbeats);

        let origin = match self.cluster.pre_check_put_region(&region) {
            Ok(origin) => origin,
            Err(err) => {
                Metrics::incr(&self.metrics.region_heartbeats_rejected);
                return Err(err);
            }
        };
        if let Some(origin) = &origin {
            region.inherit(origin);
        }

        // Write flow and expiry feed the hot caches asynchronously.
        let region_arc = Arc::new(region.clone());
        self.hot_cache
            .collect_expired_async(RwKind::Write, Arc::clone(&region_arc));
        self.hot_cache
            .collect_expired_async(RwKind::Read, Arc::clone(&region_arc));
        let interval = region.interval.duration();
        let write_loads = region.write_loads();
        for peer in &region.peers {
            let mut deltas = [0.0; DIM_LEN];
            deltas.copy_from_slice(&write_loads);
            self.hot_cache.check_async(
                RwKind::Write,
                PeerLoad {
                    region_id: region.id,
                    store_id: peer.store_id,
                    deltas,
                    interval,
                },
                Arc::clone(&region_arc),
            );
        }

        let guide = region_guide(&region, origin.as_deref());
        if !guide.save_kv && !guide.save_cache && !guide.is_new {
            return Ok(HeartbeatOutcome::default());
        }

        let mut outcome = HeartbeatOutcome {
            is_new: guide.is_new,
            ..Default::default()
        };
        let mut overlaps = Vec::new();
        if guide.save_cache {
            // Re-checked under the write lock: a concurrent heartbeat for an
            // overlapping region may have advanced the cache since pre-check.
            overlaps = self.cluster.check_and_put_region(region.clone())?;
            let mut touched: HashSet<StoreId> = region.store_ids().collect();
            if let Some(origin) = &origin {
                touched.extend(origin.store_ids());
            }
            for store_id in touched {
                self.cluster.update_store_status(store_id);
            }
            Metrics::incr(&self.metrics.region_cache_updates);
            outcome.evicted_overlaps = overlaps.iter().map(|r| r.id).collect();
        }

        if guide.save_kv || guide.need_sync {
            match self.changed_tx.try_send(Arc::clone(&region_arc)) {
                Ok(()) => {}
                Err(_) => Metrics::incr(&self.metrics.region_sync_dropped),
            }
        }

        // Storage writes are opportunistic; the cache remains authoritative.
        for overlap in &overlaps {
            if let Err(err) = self.store.delete(&self.layout.region(overlap.id)).await {
                tracing::error!(region_id = overlap.id, error = %err, "failed to delete region");
            }
        }
        if guide.save_kv {
            match save_json(self.store.as_ref(), &self.layout.region(region.id), &region).await {
                Ok(()) => Metrics::incr(&self.metrics.region_kv_saves),
                Err(err) => {
                    tracing::error!(region_id = region.id, error = %err, "failed to save region")
                }
            }
        }
        Ok(outcome)
    }

    /// Bucket reports race against each other; version-gated CAS with a few
    /// retries keeps the freshest one.
    pub fn process_report_buckets(&self, buckets: BucketStat) -> Result<()> {
        self.ensure_bootstrapped()?;
        Metrics::incr(&self.metrics.bucket_reports);
        let region_id = buckets.region_id;
        for _ in 0..BUCKET_CAS_RETRIES {
            let region = self
                .cluster
                .get_region(region_id)
                .ok_or(Error::RegionNotFound(region_id))?;
            let current = region.buckets.as_ref().map(|b| b.version).unwrap_or(0);
            if buckets.version <= current {
                Metrics::incr(&self.metrics.bucket_version_conflicts);
                return Ok(());
            }
            if self.cluster.cas_buckets(region_id, current, buckets.clone())? {
                return Ok(());
            }
        }
        Metrics::incr(&self.metrics.bucket_version_conflicts);
        Ok(())
    }

    // Store lifecycle operations.

    pub async fn put_store(&self, meta: StoreMeta) -> Result<()> {
        self.ensure_bootstrapped()?;
        validate_labels(&meta.labels)?;
        if let Some(existing) = self.cluster.get_store(meta.id) {
            if existing.is_removed() {
                return Err(Error::StoreRemoved(meta.id));
            }
        }
        // An address may only be reused by the store that owned it or after
        // its owner is buried.
        for other in self.cluster.get_stores() {
            if other.id() != meta.id && other.meta.address == meta.address && !other.is_removed() {
                return Err(Error::StoreServing(other.id()));
            }
        }
        let info = match self.cluster.get_store(meta.id) {
            Some(existing) => {
                let mut updated = (*existing).clone();
                updated.meta.address = meta.address;
                updated.meta.labels = meta.labels;
                updated.meta.version = meta.version;
                updated.meta.start_timestamp = meta.start_timestamp;
                updated
            }
            None => StoreInfo::new(meta),
        };
        save_json(self.store.as_ref(), &self.layout.store(info.id()), &info.meta).await?;
        self.cluster.put_store(info);
        Ok(())
    }

    pub async fn remove_store(&self, store_id: StoreId, physically_destroyed: bool) -> Result<()> {
        self.ensure_bootstrapped()?;
        let store = self
            .cluster
            .get_store(store_id)
            .ok_or(Error::StoreNotFound(store_id))?;
        if store.is_removed() {
            return Err(Error::StoreRemoved(store_id));
        }
        if store.is_physically_destroyed() {
            return Err(Error::StoreDestroyed(store_id));
        }
        if store.is_removing() && !physically_destroyed {
            return Ok(());
        }
        // Refuse to drain below the replication requirement.
        let up_stores = self
            .cluster
            .get_stores()
            .iter()
            .filter(|s| s.is_up() && s.id() != store_id)
            .count();
        if up_stores < self.replication.max_replicas {
            return Err(Error::StoresNotEnough(self.replication.max_replicas as u64));
        }

        let updated = store.with_state(NodeState::Removing {
            physically_destroyed,
        });
        save_json(self.store.as_ref(), &self.layout.store(store_id), &updated.meta).await?;
        self.cluster.put_store(updated);
        self.limiter.set_removing_store(store_id);
        let region_size = self.cluster.store_region_size(store_id) as f64;
        self.update_progress(store_id, "removing", region_size, region_size);
        tracing::info!(store_id, physically_destroyed, "store marked for removal");
        Ok(())
    }

    pub async fn bury_store(&self, store_id: StoreId, force: bool) -> Result<()> {
        self.ensure_bootstrapped()?;
        let store = self
            .cluster
            .get_store(store_id)
            .ok_or(Error::StoreNotFound(store_id))?;
        if store.is_removed() {
            return Ok(());
        }
        if store.is_up() {
            if !(force && store.is_disconnected()) {
                return Err(Error::StoreServing(store_id));
            }
            tracing::warn!(store_id, "force burying a disconnected store");
        }
        let updated = store.with_state(NodeState::Tombstone);
        save_json(self.store.as_ref(), &self.layout.store(store_id), &updated.meta).await?;
        self.cluster.put_store(updated);
        self.limiter.remove_store(store_id);
        self.reset_progress(store_id);
        tracing::info!(store_id, "store buried");
        Ok(())
    }

    pub async fn up_store(&self, store_id: StoreId) -> Result<()> {
        self.ensure_bootstrapped()?;
        let store = self
            .cluster
            .get_store(store_id)
            .ok_or(Error::StoreNotFound(store_id))?;
        if store.is_removed() {
            return Err(Error::StoreRemoved(store_id));
        }
        if store.is_physically_destroyed() {
            return Err(Error::StoreDestroyed(store_id));
        }
        if store.is_up() {
            return Err(Error::StoreIsUp(store_id));
        }
        let updated = store.with_state(NodeState::Serving);
        save_json(self.store.as_ref(), &self.layout.store(store_id), &updated.meta).await?;
        self.cluster.put_store(updated);
        self.limiter.restore_removing_store(store_id);
        self.reset_progress(store_id);
        tracing::info!(store_id, "store back up");
        Ok(())
    }

    async fn ready_to_serve(&self, store_id: StoreId) -> Result<()> {
        let store = self
            .cluster
            .get_store(store_id)
            .ok_or(Error::StoreNotFound(store_id))?;
        if !store.is_preparing() {
            return Err(Error::StoreIsUp(store_id));
        }
        let updated = store.with_state(NodeState::Serving);
        save_json(self.store.as_ref(), &self.layout.store(store_id), &updated.meta).await?;
        self.cluster.put_store(updated);
        self.reset_progress(store_id);
        tracing::info!(store_id, "store finished preparing");
        Ok(())
    }

    /// Delete a tombstone store record outright.
    pub async fn delete_store(&self, store_id: StoreId) -> Result<()> {
        self.ensure_bootstrapped()?;
        let store = self
            .cluster
            .get_store(store_id)
            .ok_or(Error::StoreNotFound(store_id))?;
        if !store.is_removed() {
            return Err(Error::StoreServing(store_id));
        }
        self.store.delete(&self.layout.store(store_id)).await?;
        self.cluster.delete_store(store_id);
        Ok(())
    }

    pub async fn set_store_labels(
        &self,
        store_id: StoreId,
        labels: Vec<StoreLabel>,
        force: bool,
    ) -> Result<()> {
        self.ensure_bootstrapped()?;
        validate_labels(&labels)?;
        let store = self
            .cluster
            .get_store(store_id)
            .ok_or(Error::StoreNotFound(store_id))?;
        let merged = if force {
            labels
        } else {
            merge_labels(&store.meta.labels, &labels)
        };
        let updated = store.with_labels(merged);
        save_json(self.store.as_ref(), &self.layout.store(store_id), &updated.meta).await?;
        self.cluster.put_store(updated);
        Ok(())
    }

    pub fn set_store_weight(
        &self,
        store_id: StoreId,
        leader_weight: f64,
        region_weight: f64,
    ) -> Result<()> {
        let store = self
            .cluster
            .get_store(store_id)
            .ok_or(Error::StoreNotFound(store_id))?;
        self.cluster
            .put_store(store.with_weights(leader_weight, region_weight));
        Ok(())
    }

    pub fn pause_leader_transfer(&self, store_id: StoreId, paused: bool) -> Result<()> {
        let store = self
            .cluster
            .get_store(store_id)
            .ok_or(Error::StoreNotFound(store_id))?;
        self.cluster
            .put_store(store.with_pause_leader_transfer(paused));
        Ok(())
    }

    pub fn set_slow_store_evicted(&self, store_id: StoreId, evicted: bool) -> Result<()> {
        let store = self
            .cluster
            .get_store(store_id)
            .ok_or(Error::StoreNotFound(store_id))?;
        self.cluster
            .put_store(store.with_slow_store_evicted(evicted));
        Ok(())
    }

    // Periodic store maintenance.

    /// Drive store lifecycle transitions from observed state: warm-up
    /// completion, drained removals, and replica-capacity warnings.
    pub async fn check_stores(&self) {
        let stores = self.cluster.get_stores();
        let mut up_count = 0;
        let mut stuck_removing: Vec<StoreId> = Vec::new();

        for store in &stores {
            if store.is_removed() {
                continue;
            }
            let store_id = store.id();

            if store.is_preparing() {
                let warmed = store.uptime() >= self.cfg.max_store_preparing_time
                    || self.cluster.region_count() < INIT_CLUSTER_REGION_THRESHOLD;
                if warmed {
                    if let Err(err) = self.ready_to_serve(store_id).await {
                        tracing::error!(store_id, error = %err, "failed to finish preparing");
                    }
                } else if self.prepared.load(Ordering::Acquire) {
                    let threshold = self.serving_threshold(&stores, store);
                    let region_size = self.cluster.store_region_size(store_id) as f64;
                    if region_size >= threshold {
                        if let Err(err) = self.ready_to_serve(store_id).await {
                            tracing::error!(store_id, error = %err, "failed to finish preparing");
                        }
                    } else {
                        self.update_progress(
                            store_id,
                            "preparing",
                            threshold,
                            threshold - region_size,
                        );
                    }
                }
            }

            if store.is_serving() || store.is_preparing() {
                if !store.is_low_space(self.cfg.low_space_ratio) {
                    up_count += 1;
                }
                continue;
            }

            if store.is_removing() {
                let region_count = self.cluster.store_region_count(store_id);
                if region_count == 0 {
                    if let Err(err) = self.bury_store(store_id, false).await {
                        tracing::error!(store_id, error = %err, "failed to bury drained store");
                    }
                } else {
                    let region_size = self.cluster.store_region_size(store_id) as f64;
                    self.update_progress(store_id, "removing", region_size, region_size);
                    stuck_removing.push(store_id);
                }
            }
        }

        if !stuck_removing.is_empty()
            && !self.rule_manager.is_enabled()
            && up_count < self.replication.max_replicas
        {
            for store_id in stuck_removing {
                tracing::warn!(
                    store_id,
                    "store may not reach tombstone, not enough up stores for replicas"
                );
            }
        }
    }

    /// Expected region-size share of a preparing store: how much data the
    /// rules would assign it, dampened for same-location peers.
    fn serving_threshold(&self, stores: &[Arc<StoreInfo>], store: &StoreInfo) -> f64 {
        if !self.rule_manager.is_enabled() {
            let total = self.cluster.region_size_by_range(b"", b"") as f64
                * self.replication.max_replicas as f64;
            let weight = store_topo_weight(store, stores, &self.replication.location_labels);
            return total * weight * COLLECT_FACTOR;
        }

        let keys = self.rule_manager.get_split_keys(b"", b"");
        if keys.is_empty() {
            return self.calculate_range_size(stores, store, b"", b"") * COLLECT_FACTOR;
        }
        let mut size = 0.0;
        let mut start: Vec<u8> = Vec::new();
        for key in &keys {
            size += self.calculate_range_size(stores, store, &start, key);
            start = key.clone();
        }
        size += self.calculate_range_size(stores, store, &start, b"");
        size * COLLECT_FACTOR
    }

    fn calculate_range_size(
        &self,
        stores: &[Arc<StoreInfo>],
        store: &StoreInfo,
        start: &[u8],
        end: &[u8],
    ) -> f64 {
        let mut total = 0.0;
        for rule in self.rule_manager.rules_for_apply() {
            if !rule.start_key.is_empty() || !rule.end_key.is_empty() {
                let intersects = (end.is_empty()
                    || rule.start_key.is_empty()
                    || rule.start_key.as_slice() < end)
                    && (rule.end_key.is_empty() || rule.end_key.as_slice() > start);
                if !intersects {
                    continue;
                }
            }
            if !match_label_constraints(store, &rule.label_constraints) {
                continue;
            }
            let matched: Vec<Arc<StoreInfo>> = stores
                .iter()
                .filter(|s| !s.is_removing() && !s.is_removed())
                .filter(|s| match_label_constraints(s, &rule.label_constraints))
                .cloned()
                .collect();
            let region_size = self.cluster.region_size_by_range(start, end) as f64 * rule.count as f64;
            let weight = store_topo_weight(store, &matched, &rule.location_labels);
            total += region_size * weight;
        }
        total
    }

    // Progress.

    fn progress_key(store_id: StoreId, action: &str) -> String {
        format!("{action}-{store_id}")
    }

    fn update_progress(&self, store_id: StoreId, action: &'static str, total: f64, remaining: f64) {
        let mut progress = self.progress.lock().unwrap_or_else(|e| e.into_inner());
        let key = Self::progress_key(store_id, action);
        let entry = progress.entry(key).or_insert(ProgressEntry {
            action,
            total,
            remaining,
            started: Instant::now(),
        });
        entry.total = entry.total.max(total);
        entry.remaining = remaining;
    }

    fn reset_progress(&self, store_id: StoreId) {
        let mut progress = self.progress.lock().unwrap_or_else(|e| e.into_inner());
        progress.retain(|key, _| {
            key != &Self::progress_key(store_id, "preparing")
                && key != &Self::progress_key(store_id, "removing")
        });
    }

    /// (action, percent done, seconds elapsed) for a store's transition.
    pub fn store_progress(&self, store_id: StoreId) -> Result<(String, f64, f64)> {
        let progress = self.progress.lock().unwrap_or_else(|e| e.into_inner());
        for action in ["preparing", "removing"] {
            if let Some(entry) = progress.get(&Self::progress_key(store_id, action)) {
                let done = if entry.total <= 0.0 {
                    1.0
                } else {
                    (1.0 - entry.remaining / entry.total).clamp(0.0, 1.0)
                };
                return Ok((
                    entry.action.to_string(),
                    done,
                    entry.started.elapsed().as_secs_f64(),
                ));
            }
        }
        Err(Error::ProgressNotFound(format!("store {store_id}")))
    }

    /// The cluster runs at the lowest version any participating store
    /// reports; feature gates key off this.
    pub fn cluster_version(&self) -> Option<String> {
        self.cluster
            .get_stores()
            .iter()
            .filter(|s| s.is_up() && !s.meta.version.is_empty())
            .map(|s| s.meta.version.clone())
            .min_by(|a, b| compare_versions(a, b))
    }

    // Min-resolved-ts.

    pub fn min_resolved_ts(&self) -> u64 {
        self.min_resolved_ts.load(Ordering::Acquire)
    }

    /// Take the minimum across serving stores; persist only strict
    /// advances.
    pub async fn persist_min_resolved_ts(&self) -> Result<()> {
        let mut min_ts: Option<u64> = None;
        for store in self.cluster.get_stores() {
            if !store.is_serving() {
                continue;
            }
            let ts = store.stats.min_resolved_ts;
            if ts == 0 {
                continue;
            }
            min_ts = Some(min_ts.map_or(ts, |m| m.min(ts)));
        }
        let Some(min_ts) = min_ts else {
            return Ok(());
        };
        let current = self.min_resolved_ts.load(Ordering::Acquire);
        if min_ts <= current {
            return Ok(());
        }
        self.store
            .put(
                &self.layout.min_resolved_ts(),
                min_ts.to_string().into_bytes(),
            )
            .await?;
        self.min_resolved_ts.store(min_ts, Ordering::Release);
        Ok(())
    }
}

/// Dotted-numeric version comparison; non-numeric segments compare
/// lexicographically after the numeric prefix.
fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.trim_start_matches('v')
            .split(|c: char| c == '.' || c == '-')
            .map_while(|part| part.parse::<u64>().ok())
            .collect()
    };
    parse(a).cmp(&parse(b)).then_with(|| a.cmp(b))
}

/// Weight of one store inside the location topology: walk the nested label
/// map dividing by the branching factor at each level the store's label
/// value exists, stop at the first miss, then dampen by the number of
/// same-location stores.
fn store_topo_weight(store: &StoreInfo, stores: &[Arc<StoreInfo>], location_labels: &[String]) -> f64 {
    #[derive(Default)]
    struct TopoNode {
        children: HashMap<String, TopoNode>,
    }

    let mut topology = TopoNode::default();
    let mut same_location = 1.0;
    for other in stores {
        if other.is_serving() || other.is_preparing() {
            let mut node = &mut topology;
            for label in location_labels {
                let value = other.label_value(label).unwrap_or("").to_string();
                node = node.children.entry(value).or_default();
            }
        }
        if other.id() == store.id() {
            continue;
        }
        if store.compare_location(other, location_labels).is_none() && !location_labels.is_empty() {
            same_location += 1.0;
        }
    }

    let mut weight = 1.0;
    let mut node = &topology;
    for label in location_labels {
        let value = store.label_value(label).unwrap_or("");
        if node.children.contains_key(value) {
            weight /= node.children.len() as f64;
            node = &node.children[value];
        } else {
            break;
        }
    }
    weight / same_location
}
