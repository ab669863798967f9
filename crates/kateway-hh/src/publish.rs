//! The destination side of hinted handoff: whatever eventually accepts a
//! block on behalf of the original producer.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The topic does not exist; retrying cannot help.
    InvalidTopic(String),
    /// The cluster is unknown; retrying cannot help.
    InvalidCluster(String),
    Unavailable(String),
    Timeout,
    Other(String),
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishError::InvalidTopic(topic) => write!(f, "Invalid topic: {topic}"),
            PublishError::InvalidCluster(cluster) => write!(f, "Invalid cluster: {cluster}"),
            PublishError::Unavailable(reason) => write!(f, "Destination unavailable: {reason}"),
            PublishError::Timeout => write!(f, "Publish timed out"),
            PublishError::Other(reason) => write!(f, "Publish failed: {reason}"),
        }
    }
}

impl std::error::Error for PublishError {}

impl PublishError {
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            PublishError::InvalidTopic(_) | PublishError::InvalidCluster(_)
        )
    }
}

/// Synchronous publisher the pumps deliver through. Shared by every pump
/// thread, so implementations must be thread safe.
pub trait PubStore: Send + Sync {
    /// Publish one message and return the (partition, offset) it landed at.
    fn sync_pub(
        &self,
        cluster: &str,
        topic: &str,
        key: &[u8],
        value: &[u8],
    ) -> Result<(i32, i64), PublishError>;
}
