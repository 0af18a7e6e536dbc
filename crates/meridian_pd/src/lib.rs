//! Meridian placement driver.
//!
//! The control plane of a sharded, Raft-replicated key-value store: it
//! allocates ids and timestamps, ingests store and region heartbeats into a
//! consistent topology view, and schedules replica movement to keep the
//! fleet balanced and policy-compliant. Durable state and leader election
//! go through the contracts in `meridian_meta`.

pub mod checkers;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod coordinator;
pub mod error;
pub mod filters;
pub mod hot_stats;
pub mod id_alloc;
pub mod metrics;
pub mod operator;
pub mod region;
pub mod rules;
pub mod schedulers;
pub mod service;
pub mod smoothing;
pub mod store;
pub mod store_limit;
pub mod tso;

pub use config::PdConfig;
pub use error::{Error, Result};
pub use service::PdServer;
