#![forbid(unsafe_code)]

pub mod config;
pub mod hh;
pub mod line;
pub mod meta;
pub mod metrics;

pub use config::{ConfigError, HintedHandoffConfig, MetaConfig, NodeConfig};
pub use hh::{
    set_max_active_processors, ClusterView, HhError, HintedHandoff, NodeProcessor, Queue,
    QueueError, ShardWriter,
};
pub use line::{parse_points, LineError, Point};
pub use meta::{
    Data, DatabaseInfo, FsSnapshotStore, MetaClient, MetaError, NodeInfo, NullSnapshotStore,
    Privilege, RetentionPolicyInfo, RetentionPolicySpec, ShardGroupInfo, ShardInfo, SnapshotStore,
    Source, SubscriptionMode, UserInfo,
};
