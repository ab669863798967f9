use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Leave flushing to the OS.
    None,
    /// fsync every append and every checkpoint.
    Immediate,
    /// fsync checkpoints, segment rollover and close.
    Periodic,
}

pub const SEGMENT_EXTENSION: &str = "log";
pub const CURSOR_FILE: &str = "cursor.json";

// ================================================================================================
// FILE SYSTEM UTILITIES
// ================================================================================================

pub fn ensure_directory_exists<P: AsRef<Path>>(dir: P) -> Result<(), std::io::Error> {
    let dir = dir.as_ref();
    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}

pub fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{id:020}.{SEGMENT_EXTENSION}"))
}

pub fn extract_segment_id(file_path: &Path) -> Option<u64> {
    let file_name = file_path.file_name()?.to_str()?;
    let id = file_name.strip_suffix(&format!(".{SEGMENT_EXTENSION}"))?;
    id.parse::<u64>().ok()
}

/// Sorted ids of every segment file in `dir`.
pub fn list_segment_ids(dir: &Path) -> Result<Vec<u64>, std::io::Error> {
    let mut ids = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        if let Some(id) = extract_segment_id(&path) {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}
