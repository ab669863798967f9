use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum HhError {
    /// No durable data past the read head.
    EndOfQueue,
    /// Read offset equals the durable size of the segment.
    EndOfSegment,
    SegmentCorrupt {
        context: String,
        details: String,
    },
    CursorOutOfRange {
        segment: u64,
        offset: u64,
    },
    CheckpointCorrupt {
        path: String,
        details: String,
    },
    QueueNotOpen,
    Io {
        context: String,
        source: String,
    },
    ShortWrite {
        expected: usize,
        written: usize,
    },
    ShortRead {
        expected: usize,
        got: usize,
    },
    BlockTooLarge {
        len: usize,
        max: u32,
    },
    RollbackRejected {
        capacity: usize,
    },
    DirectoryLocked {
        context: String,
        pid: Option<u32>,
    },
    InvalidConfig {
        field: String,
        reason: String,
    },
}

impl fmt::Display for HhError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HhError::EndOfQueue => write!(f, "End of queue"),
            HhError::EndOfSegment => write!(f, "End of segment"),
            HhError::SegmentCorrupt { context, details } => {
                write!(f, "Segment corrupt in {context}: {details}")
            }
            HhError::CursorOutOfRange { segment, offset } => {
                write!(f, "Cursor out of range: segment {segment} offset {offset}")
            }
            HhError::CheckpointCorrupt { path, details } => {
                write!(f, "Checkpoint corrupt at {path}: {details}")
            }
            HhError::QueueNotOpen => write!(f, "Queue not open"),
            HhError::Io { context, source } => write!(f, "IO error in {context}: {source}"),
            HhError::ShortWrite { expected, written } => {
                write!(f, "Short write: expected {expected} bytes, wrote {written}")
            }
            HhError::ShortRead { expected, got } => {
                write!(f, "Short read: expected {expected} bytes, got {got}")
            }
            HhError::BlockTooLarge { len, max } => {
                write!(f, "Block field of {len} bytes exceeds max block size {max}")
            }
            HhError::RollbackRejected { capacity } => {
                write!(f, "Rollback staging full (capacity {capacity})")
            }
            HhError::DirectoryLocked { context, pid } => match pid {
                Some(pid) => write!(f, "Directory locked in {context} (PID: {pid})"),
                None => write!(f, "Directory locked in {context}"),
            },
            HhError::InvalidConfig { field, reason } => {
                write!(f, "Invalid config field '{field}': {reason}")
            }
        }
    }
}

impl std::error::Error for HhError {}

impl HhError {
    pub fn from_io_error(e: std::io::Error, context: &str) -> Self {
        HhError::Io {
            context: context.to_string(),
            source: e.to_string(),
        }
    }

    pub fn corrupt(context: &str, details: impl fmt::Display) -> Self {
        HhError::SegmentCorrupt {
            context: context.to_string(),
            details: details.to_string(),
        }
    }

    /// End-of-data conditions that drive polling rather than signal failure.
    pub fn is_boundary(&self) -> bool {
        matches!(self, HhError::EndOfQueue | HhError::EndOfSegment)
    }

    /// Conditions that make a queue unusable until an operator intervenes.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HhError::CursorOutOfRange { .. } | HhError::CheckpointCorrupt { .. }
        )
    }
}
