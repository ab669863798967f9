use std::fmt;

pub mod config;
pub mod error;
pub mod publish;
pub mod storage;
pub mod telemetry;

pub use config::{ConfigLoader, HintedHandoffConfig};
pub use error::HhError;
pub use publish::{PubStore, PublishError};
pub use storage::{DiskService, HintedHandoff, Queue, QueueStats, SyncMode};

// Re-export logging macros for consistent usage across the crate
pub use log::{debug, error, info, trace, warn};

/// A delivery destination: one topic on one cluster. Each has its own queue.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct ClusterTopic {
    pub cluster: String,
    pub topic: String,
}

impl ClusterTopic {
    pub fn new(cluster: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            topic: topic.into(),
        }
    }
}

impl fmt::Display for ClusterTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.cluster, self.topic)
    }
}
