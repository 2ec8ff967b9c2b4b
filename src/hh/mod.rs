//! Hinted handoff: durable per-remote-node buffering of shard writes.
//!
//! When a shard owner is unreachable, its writes land in an on-disk queue and
//! a background processor replays them with retry backoff once the owner
//! returns.

use std::path::PathBuf;

use thiserror::Error;

use crate::line::{LineError, Point};
use crate::meta::{MetaClient, MetaError, NodeInfo};

pub mod codec;
pub mod limiter;
pub mod node_processor;
pub mod queue;
pub mod service;

pub use codec::{marshal_write, unmarshal_write};
pub use limiter::RateLimiter;
pub use node_processor::{set_max_active_processors, NodeProcessor, NodeProcessorStatistics};
pub use queue::{DiskQueue, Queue, QueueError, QueuePosition};
pub use service::HintedHandoff;

pub type HhResult<T> = Result<T, HhError>;

#[derive(Debug, Error)]
pub enum HhError {
    #[error("node processor is closed")]
    Closed,
    #[error("node processor is open")]
    Open,
    #[error("remote node {node_id} is not active")]
    NodeInactive { node_id: u64 },
    #[error("queue: {0}")]
    Queue(#[from] QueueError),
    #[error("write frame too short: len = {len}")]
    FrameTooShort { len: usize },
    #[error("invalid point payload: {0}")]
    Line(#[from] LineError),
    #[error("meta: {0}")]
    Meta(#[from] MetaError),
    #[error("shard write to node {node_id} failed: {reason}")]
    WriteFailed { node_id: u64, reason: String },
    #[error("invalid hinted-handoff directory entry: {name}")]
    InvalidNodeDir { name: String },
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl HhError {
    /// Errors meaning "nothing to send right now" rather than a fault; the
    /// send loop resets to its base interval instead of backing off.
    pub fn is_drained(&self) -> bool {
        matches!(
            self,
            HhError::NodeInactive { .. } | HhError::Queue(QueueError::Empty)
        )
    }
}

/// The slice of cluster metadata the processors need: whether a remote node
/// still exists.
pub trait ClusterView: Send + Sync {
    fn data_node(&self, id: u64) -> Result<NodeInfo, MetaError>;
}

impl ClusterView for MetaClient {
    fn data_node(&self, id: u64) -> Result<NodeInfo, MetaError> {
        MetaClient::data_node(self, id)
    }
}

/// Delivers one shard write to a remote node. Error classification is opaque
/// here; any failure triggers a retry of the same frame.
pub trait ShardWriter: Send + Sync {
    fn write_shard(&self, shard_id: u64, node_id: u64, points: &[Point]) -> HhResult<()>;
}
