use crate::error::HhError;

/// What the gateway needs from hinted handoff: park messages that could not
/// be published and report how much is still pending.
pub trait HintedHandoff: Send + Sync {
    /// Recover queues left on disk and start delivering them.
    fn start(&self) -> Result<(), HhError>;

    /// Stop every pump and checkpoint every queue. Pending blocks stay on disk.
    fn stop(&self);

    fn append(&self, cluster: &str, topic: &str, key: &[u8], value: &[u8])
    -> Result<(), HhError>;

    /// True when nothing is pending for the destination, including when it
    /// has never been used.
    fn empty(&self, cluster: &str, topic: &str) -> bool;

    /// Blocks appended but not yet consumed, across all destinations.
    fn inflights(&self) -> u64;
}
