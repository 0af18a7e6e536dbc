//! Stable error kinds surfaced by the driver.
//!
//! Heartbeat and scheduler paths recover locally (log and keep running);
//! timestamp and election errors always propagate to the caller.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cluster is not bootstrapped")]
    NotBootstrapped,
    #[error("cluster is already bootstrapped")]
    AlreadyBootstrapped,

    #[error("store {0} not found")]
    StoreNotFound(u64),
    #[error("store {0} has been removed")]
    StoreRemoved(u64),
    #[error("store {0} has been physically destroyed")]
    StoreDestroyed(u64),
    #[error("store {0} is still serving")]
    StoreServing(u64),
    #[error("store {0} is already up")]
    StoreIsUp(u64),
    #[error("remaining stores are not enough to hold {0} replicas")]
    StoresNotEnough(u64),
    #[error("no store left to place the leader of region {0}")]
    NoStoreForRegionLeader(u64),
    #[error("invalid store label: {0}")]
    InvalidStoreLabel(String),

    #[error("region {0} not found")]
    RegionNotFound(u64),
    #[error("region {region_id} epoch is stale: {msg}")]
    EpochStale { region_id: u64, msg: String },
    #[error("region {0} overlaps a newer region")]
    RegionOverlap(u64),

    #[error("scheduler {0} already exists")]
    SchedulerExisted(String),
    #[error("scheduler {0} not found")]
    SchedulerNotFound(String),
    #[error("scheduler config for {0} does not exist")]
    ScheduleConfigNotExist(String),

    #[error("invalid placement rule: {0}")]
    InvalidRule(String),

    #[error("tso logical part exhausted")]
    TsoExhausted,
    #[error("requested timestamp from a non-leader")]
    TsoFromFollower,
    #[error("reset timestamp is {0}")]
    TsoDelta(&'static str),
    #[error("generate-timestamp-failed: {0}")]
    GenerateTimestampFailed(&'static str),
    #[error("dc-location {0} is not configured")]
    DcLocationNotFound(String),

    #[error("progress for {0} not found")]
    ProgressNotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("operator for region {0} not found")]
    OperatorNotFound(u64),

    #[error(transparent)]
    Meta(#[from] meridian_meta::MetaError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Stable machine-readable code for the RPC surface.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotBootstrapped => "NotBootstrapped",
            Error::AlreadyBootstrapped => "AlreadyBootstrapped",
            Error::StoreNotFound(_) => "StoreNotFound",
            Error::StoreRemoved(_) => "StoreRemoved",
            Error::StoreDestroyed(_) => "StoreDestroyed",
            Error::StoreServing(_) => "StoreServing",
            Error::StoreIsUp(_) => "StoreIsUp",
            Error::StoresNotEnough(_) => "StoresNotEnough",
            Error::NoStoreForRegionLeader(_) => "NoStoreForRegionLeader",
            Error::InvalidStoreLabel(_) => "InvalidStoreLabel",
            Error::RegionNotFound(_) => "RegionNotFound",
            Error::EpochStale { .. } => "EpochStale",
            Error::RegionOverlap(_) => "RegionOverlap",
            Error::SchedulerExisted(_) => "SchedulerExisted",
            Error::SchedulerNotFound(_) => "SchedulerNotFound",
            Error::ScheduleConfigNotExist(_) => "ScheduleConfigNotExist",
            Error::InvalidRule(_) => "InvalidRule",
            Error::TsoExhausted => "TSOExhausted",
            Error::TsoFromFollower => "TSOFromFollower",
            Error::TsoDelta(_) => "TSODelta",
            Error::GenerateTimestampFailed(_) => "GenerateTimestampFailed",
            Error::DcLocationNotFound(_) => "DcLocationNotFound",
            Error::ProgressNotFound(_) => "ProgressNotFound",
            Error::InvalidArgument(_) => "InvalidArgument",
            Error::OperatorNotFound(_) => "OperatorNotFound",
            Error::Meta(meridian_meta::MetaError::TxnConflict) => "EtcdTxnConflict",
            Error::Meta(meridian_meta::MetaError::LeaderNotFound) => "EtcdLeaderNotFound",
            Error::Meta(meridian_meta::MetaError::MoveLeaderFailed(_)) => "MoveLeaderFailed",
            Error::Meta(_) => "EtcdTxnInternal",
        }
    }
}
