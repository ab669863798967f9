use std::fmt;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::HhError;
use crate::storage::disk::common::{CURSOR_FILE, SyncMode};
use crate::storage::disk::file_io::FileIo;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Position {
    pub segment: u64,
    pub offset: u64,
}

impl Position {
    pub fn new(segment: u64, offset: u64) -> Self {
        Self { segment, offset }
    }

    pub fn segment_start(segment: u64) -> Self {
        Self { segment, offset: 0 }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment, self.offset)
    }
}

/// Read progress through a queue's segments.
///
/// `read` is where the next block comes from; `committed` trails it and only
/// moves once a block is fully processed; `persisted` is what the checkpoint
/// file on disk currently says.
pub struct Cursor {
    path: PathBuf,
    read: Position,
    committed: Position,
    persisted: Option<Position>,
    sync_mode: SyncMode,
}

impl Cursor {
    /// Load the checkpoint from `dir`, or start at `first_segment` when there is none.
    #[tracing::instrument(level = "info", skip(dir), fields(dir = %dir.display()))]
    pub fn load(dir: &Path, sync_mode: SyncMode, first_segment: u64) -> Result<Self, HhError> {
        let path = dir.join(CURSOR_FILE);
        let persisted = Self::read_checkpoint(&path)?;

        let start = match persisted {
            Some(position) => {
                info!("Loaded cursor {position} from {}", path.display());
                position
            }
            None => {
                debug!("No checkpoint at {}, starting at segment {first_segment}", path.display());
                Position::segment_start(first_segment)
            }
        };

        Ok(Cursor {
            path,
            read: start,
            committed: start,
            persisted,
            sync_mode,
        })
    }

    fn read_checkpoint(path: &Path) -> Result<Option<Position>, HhError> {
        if !path.exists() {
            return Ok(None);
        }

        let contents = std::fs::read_to_string(path)
            .map_err(|e| HhError::from_io_error(e, "Failed to read cursor checkpoint"))?;

        serde_json::from_str::<Position>(&contents)
            .map(Some)
            .map_err(|e| HhError::CheckpointCorrupt {
                path: path.display().to_string(),
                details: e.to_string(),
            })
    }

    /// Overwrite the checkpoint in `dir` with `position`. Operator use only;
    /// the queue must not be open.
    pub fn reset(dir: &Path, position: Position, sync_mode: SyncMode) -> Result<(), HhError> {
        write_checkpoint(&dir.join(CURSOR_FILE), position, sync_mode)
    }

    pub fn read_position(&self) -> Position {
        self.read
    }

    pub fn committed_position(&self) -> Position {
        self.committed
    }

    pub fn persisted_position(&self) -> Option<Position> {
        self.persisted
    }

    pub fn advance_read(&mut self, position: Position) {
        self.read = position;
    }

    /// Mark everything up to the read head as processed.
    pub fn commit_position(&mut self) {
        self.committed = self.read;
    }

    /// Abandon the rest of the current segment.
    pub fn skip_segment(&mut self, next_segment: u64) {
        let next = Position::segment_start(next_segment);
        self.read = next;
        self.committed = next;
    }

    /// Persist the committed position; no-op when it is already on disk.
    #[tracing::instrument(level = "debug", skip(self), fields(position = %self.committed))]
    pub fn dump(&mut self) -> Result<(), HhError> {
        if self.persisted == Some(self.committed) {
            return Ok(());
        }
        write_checkpoint(&self.path, self.committed, self.sync_mode)?;
        self.persisted = Some(self.committed);
        Ok(())
    }
}

fn write_checkpoint(path: &Path, position: Position, sync_mode: SyncMode) -> Result<(), HhError> {
    let json = serde_json::to_string_pretty(&position).map_err(|e| HhError::Io {
        context: "serialize cursor".to_string(),
        source: e.to_string(),
    })?;
    FileIo::atomic_replace(path, json.as_bytes(), sync_mode != SyncMode::None)
}
