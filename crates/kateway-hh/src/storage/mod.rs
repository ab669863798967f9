pub mod disk;
pub mod r#trait;

pub use disk::{DiskService, Queue, QueueStats, SyncMode};
pub use r#trait::HintedHandoff;
