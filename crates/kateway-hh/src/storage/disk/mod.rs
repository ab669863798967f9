pub mod block;
pub mod common;
pub mod cursor;
pub mod file_io;
pub mod lock;
pub mod pump;
pub mod queue;
pub mod segment;
pub mod service;

pub use block::Block;
pub use common::{CURSOR_FILE, SEGMENT_EXTENSION, SyncMode};
pub use cursor::{Cursor, Position};
pub use file_io::FileIo;
pub use lock::{DirectoryLock, LOCK_FILE};
pub use pump::{Pump, PumpSettings, backoff_delay};
pub use queue::{Queue, QueueStats};
pub use segment::{Segment, SegmentReader};
pub use service::DiskService;
