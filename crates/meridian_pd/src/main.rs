// Meridian placement-driver binary entry point.
//
// Wires configuration, logging, the MetaStore/Election capabilities, and the
// server assembly, then parks until shutdown. The standalone binary runs on
// the in-process capabilities; production deployments embed the server
// behind their own MetaStore/Election implementations.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use meridian_meta::{Election, MemElection, MemStore, MetaStore};
use meridian_pd::config::{PdConfig, ReplicationConfig, ScheduleConfig, TsoConfig};
use meridian_pd::PdServer;

#[derive(Parser, Debug)]
#[command(name = "meridian-pd", about = "Meridian placement driver")]
struct NodeArgs {
    /// Numeric cluster identity; all persisted keys live under it.
    #[arg(long, env = "MERIDIAN_CLUSTER_ID", default_value_t = 1)]
    cluster_id: u64,

    /// Member name used in the election.
    #[arg(long, env = "MERIDIAN_NAME", default_value = "pd-1")]
    name: String,

    /// Comma-separated dc-locations served by local timestamp allocators.
    #[arg(long, env = "MERIDIAN_DC_LOCATIONS", default_value = "")]
    dc_locations: String,

    /// Replicas per region.
    #[arg(long, env = "MERIDIAN_MAX_REPLICAS", default_value_t = 3)]
    max_replicas: usize,

    /// Comma-separated topology label keys, outermost first.
    #[arg(long, env = "MERIDIAN_LOCATION_LABELS", default_value = "")]
    location_labels: String,

    /// Evaluate placement with declarative rules instead of plain counts.
    #[arg(long, env = "MERIDIAN_PLACEMENT_RULES", default_value_t = true)]
    placement_rules: bool,

    /// Default per-store add-peer rate, regions per minute.
    #[arg(long, env = "MERIDIAN_STORE_LIMIT_ADD_PEER", default_value_t = 15.0)]
    store_limit_add_peer: f64,

    /// Default per-store remove-peer rate, regions per minute.
    #[arg(long, env = "MERIDIAN_STORE_LIMIT_REMOVE_PEER", default_value_t = 15.0)]
    store_limit_remove_peer: f64,

    /// Upper size bound for merge candidates, MiB.
    #[arg(long, env = "MERIDIAN_MAX_MERGE_REGION_SIZE", default_value_t = 20)]
    max_merge_region_size: u64,

    /// Milliseconds between patrol batches.
    #[arg(long, env = "MERIDIAN_PATROL_INTERVAL_MS", default_value_t = 10)]
    patrol_interval_ms: u64,

    /// Seconds a silent store may stay up before counting as down.
    #[arg(long, env = "MERIDIAN_MAX_STORE_DOWN_SECS", default_value_t = 1800)]
    max_store_down_secs: u64,

    /// Seconds between min-resolved-ts persists; 0 disables the job.
    #[arg(long, env = "MERIDIAN_MIN_RESOLVED_TS_INTERVAL_SECS", default_value_t = 1)]
    min_resolved_ts_interval_secs: u64,
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl NodeArgs {
    fn into_config(self) -> PdConfig {
        let replication = ReplicationConfig {
            max_replicas: self.max_replicas,
            location_labels: split_csv(&self.location_labels),
            isolation_level: String::new(),
            enable_placement_rules: self.placement_rules,
        };
        let schedule = ScheduleConfig {
            store_limit_add_peer: self.store_limit_add_peer,
            store_limit_remove_peer: self.store_limit_remove_peer,
            max_merge_region_size: self.max_merge_region_size,
            patrol_region_interval: Duration::from_millis(self.patrol_interval_ms.max(1)),
            max_store_down_time: Duration::from_secs(self.max_store_down_secs),
            min_resolved_ts_persistence_interval: Duration::from_secs(
                self.min_resolved_ts_interval_secs,
            ),
            ..Default::default()
        };
        PdConfig {
            cluster_id: self.cluster_id,
            name: self.name,
            dc_locations: split_csv(&self.dc_locations),
            replication,
            schedule,
            tso: TsoConfig::default(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = NodeArgs::parse();
    let config = args.into_config();
    tracing::info!(
        cluster_id = config.cluster_id,
        name = %config.name,
        "starting meridian placement driver"
    );

    let meta_store: Arc<dyn MetaStore> = Arc::new(MemStore::new());
    let election: Arc<dyn Election> = Arc::new(MemElection::new(config.name.clone()));
    let server = PdServer::new(config, meta_store, election);
    server.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    server.stop().await;
    Ok(())
}
