//! Shared helpers for integration tests: an in-process driver over the
//! in-memory MetaStore/Election capabilities.

use std::sync::Arc;
use std::time::Duration;

use meridian_meta::{Election, MemElection, MemStore, MetaStore};
use meridian_pd::config::{PdConfig, ReplicationConfig, ScheduleConfig, TsoConfig};
use meridian_pd::region::{Peer, RegionEpoch, RegionInfo};
use meridian_pd::store::{NodeState, StoreId, StoreMeta, StoreStats, TimeInterval};
use meridian_pd::PdServer;

pub struct TestEnv {
    pub server: Arc<PdServer>,
    pub meta_store: Arc<MemStore>,
    pub election: Arc<MemElection>,
}

pub fn test_config() -> PdConfig {
    PdConfig {
        cluster_id: 1,
        name: "pd-1".to_string(),
        dc_locations: vec!["dc-1".to_string()],
        replication: ReplicationConfig::default(),
        schedule: ScheduleConfig::default(),
        tso: TsoConfig::default(),
    }
}

/// Build a server without starting the coordinator loops; tests drive the
/// pieces they exercise. The election is won immediately.
pub async fn new_env() -> TestEnv {
    new_env_with(test_config()).await
}

pub async fn new_env_with(config: PdConfig) -> TestEnv {
    let meta_store = Arc::new(MemStore::new());
    let election = Arc::new(MemElection::new(config.name.clone()));
    let server = PdServer::new(
        config,
        meta_store.clone() as Arc<dyn MetaStore>,
        election.clone() as Arc<dyn Election>,
    );
    election
        .campaign(Duration::from_secs(3))
        .await
        .expect("campaign");
    TestEnv {
        server,
        meta_store,
        election,
    }
}

pub fn region_with_peers(id: u64, start: &[u8], end: &[u8], stores: &[StoreId]) -> RegionInfo {
    let peers: Vec<Peer> = stores
        .iter()
        .enumerate()
        .map(|(i, &s)| Peer::voter(id * 100 + i as u64 + 1, s))
        .collect();
    let mut region = RegionInfo::new(id, start.to_vec(), end.to_vec(), peers.clone());
    region.leader = peers.first().copied();
    region.epoch = RegionEpoch::new(1, 1);
    region.approximate_size = 10;
    region
}

/// Bootstrap with one full-range region on the first store and bring every
/// store up to Serving with a heartbeat behind it.
pub async fn bootstrap_cluster(env: &TestEnv, stores: &[StoreId]) {
    let first_region = region_with_peers(1, b"", b"", &stores[..1]);
    env.server
        .bootstrap(StoreMeta::new(stores[0], format!("s{}", stores[0])), first_region)
        .await
        .expect("bootstrap");
    for &id in &stores[1..] {
        env.server
            .put_store(StoreMeta::new(id, format!("s{id}")))
            .await
            .expect("put store");
    }
    for &id in stores {
        let store = env.server.controller.cluster.get_store(id).expect("store");
        env.server
            .controller
            .cluster
            .put_store(store.with_state(NodeState::Serving));
        env.server
            .store_heartbeat(healthy_stats(id))
            .await
            .expect("store heartbeat");
    }
}

pub fn healthy_stats(store_id: StoreId) -> StoreStats {
    StoreStats {
        store_id,
        capacity: 100 << 30,
        available: 80 << 30,
        used_size: 20 << 30,
        interval: TimeInterval { start: 0, end: 10 },
        ..Default::default()
    }
}
