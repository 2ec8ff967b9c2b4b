//! Cluster metadata: the copy-on-write snapshot and its client facade.

use std::path::PathBuf;

use thiserror::Error;

pub mod client;
pub mod data;

pub use client::{FsSnapshotStore, MetaClient, NullSnapshotStore, SnapshotStore};
pub use data::{
    Data, DatabaseInfo, NodeInfo, Privilege, RetentionPolicyInfo, RetentionPolicySpec,
    RetentionPolicyUpdate, ShardGroupInfo, ShardInfo, Source, SubscriptionInfo, SubscriptionMode,
    Timestamp, UserInfo, DEFAULT_RETENTION_POLICY_NAME, MIN_RETENTION_POLICY_DURATION,
};

pub type MetaResult<T> = Result<T, MetaError>;

#[derive(Debug, Error)]
pub enum MetaError {
    #[error("database not found: {name}")]
    DatabaseNotFound { name: String },
    #[error("database already exists: {name}")]
    DatabaseExists { name: String },
    #[error("database name required")]
    DatabaseNameRequired,
    #[error("retention policy not found: {name}")]
    RetentionPolicyNotFound { name: String },
    #[error("retention policy already exists: {name}")]
    RetentionPolicyExists { name: String },
    #[error("retention policy name required")]
    RetentionPolicyNameRequired,
    #[error("retention policy duration must be 0 or at least one hour")]
    RetentionPolicyDurationTooLow,
    #[error("retention policy conflicts with an existing policy")]
    RetentionPolicyConflict,
    #[error("retention policy duration must be greater than the shard group duration")]
    IncompatibleDurations,
    #[error("replication factor must be greater than 0")]
    InvalidReplicationFactor,
    #[error("shard group already exists for timestamp {timestamp}")]
    ShardGroupExists { timestamp: Timestamp },
    #[error("shard group not found: {id}")]
    ShardGroupNotFound { id: u64 },
    #[error("node not found: {id}")]
    NodeNotFound { id: u64 },
    #[error("node already exists: {addr}")]
    NodeExists { addr: String },
    #[error("user not found: {name}")]
    UserNotFound { name: String },
    #[error("user already exists: {name}")]
    UserExists { name: String },
    #[error("username required")]
    UsernameRequired,
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("continuous query not found: {name}")]
    ContinuousQueryNotFound { name: String },
    #[error("continuous query already exists: {name}")]
    ContinuousQueryExists { name: String },
    #[error("subscription not found: {name}")]
    SubscriptionNotFound { name: String },
    #[error("subscription already exists: {name}")]
    SubscriptionExists { name: String },
    #[error("invalid subscription mode: {mode}")]
    InvalidSubscriptionMode { mode: String },
    #[error("subscription requires at least one destination")]
    SubscriptionDestinationsRequired,
    #[error("snapshot encode failed: {source}")]
    Marshal {
        #[source]
        source: serde_json::Error,
    },
    #[error("snapshot decode failed: {source}")]
    Unmarshal {
        #[source]
        source: serde_json::Error,
    },
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
