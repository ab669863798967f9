//! Hinted-handoff configuration and file loading.

use crate::error::HhError;
use crate::storage::disk::SyncMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_MAX_BLOCK_SIZE: u32 = 1 << 20;
pub const DEFAULT_MAX_SEGMENT_SIZE: u64 = 10 << 20;
pub const DEFAULT_DUMP_PER_BLOCKS: u64 = 100;
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 1_000;
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 31_000;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_ROLLBACK_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HintedHandoffConfig {
    pub data_dir: PathBuf,
    /// Upper bound for each of a block's key and value.
    pub max_block_size: u32,
    /// Segment size that triggers rollover to the next segment.
    pub max_segment_size: u64,
    /// Successful deliveries between cursor checkpoints.
    pub dump_per_blocks: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Total delivery attempts for a block, first try included.
    pub max_attempts: u32,
    pub poll_interval_ms: u64,
    /// Blocks that may sit in a queue's rollback staging area.
    pub rollback_capacity: usize,
    pub sync_mode: SyncMode,
}

impl Default for HintedHandoffConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./hh"),
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            dump_per_blocks: DEFAULT_DUMP_PER_BLOCKS,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            rollback_capacity: DEFAULT_ROLLBACK_CAPACITY,
            sync_mode: SyncMode::Periodic,
        }
    }
}

impl HintedHandoffConfig {
    pub fn with_data_dir<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<(), HhError> {
        if self.max_block_size == 0 {
            return Err(invalid("max_block_size", "must be greater than zero"));
        }
        // A segment must hold at least one maximal block plus its two length prefixes.
        let min_segment = 2 * (self.max_block_size as u64 + 4);
        if self.max_segment_size < min_segment {
            return Err(invalid(
                "max_segment_size",
                format!(
                    "must be at least {min_segment} for max_block_size {}",
                    self.max_block_size
                ),
            ));
        }
        if self.dump_per_blocks == 0 {
            return Err(invalid("dump_per_blocks", "must be greater than zero"));
        }
        if self.max_attempts == 0 {
            return Err(invalid("max_attempts", "must be greater than zero"));
        }
        if self.initial_backoff_ms == 0 {
            return Err(invalid("initial_backoff_ms", "must be greater than zero"));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(invalid(
                "max_backoff_ms",
                "must not be smaller than initial_backoff_ms",
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(invalid("poll_interval_ms", "must be greater than zero"));
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> HhError {
    HhError::InvalidConfig {
        field: field.to_string(),
        reason: reason.into(),
    }
}

/// Reads a [`HintedHandoffConfig`] from disk.
pub struct ConfigLoader;

impl ConfigLoader {
    /// JSON (.json) or YAML (.yaml/.yml) by extension; anything else tries JSON then YAML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<HintedHandoffConfig, HhError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| HhError::from_io_error(e, "config loading"))?;

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("");

        let config: HintedHandoffConfig = match extension.to_lowercase().as_str() {
            "json" => serde_json::from_str(&content)
                .map_err(|e| invalid("<json>", e.to_string()))?,
            "yaml" | "yml" => serde_yaml::from_str(&content)
                .map_err(|e| invalid("<yaml>", e.to_string()))?,
            _ => serde_json::from_str(&content)
                .or_else(|_| serde_yaml::from_str(&content))
                .map_err(|e| invalid("<config>", format!("tried both JSON and YAML: {e}")))?,
        };

        config.validate()?;
        Ok(config)
    }
}
