use crate::error::HhError;
use crate::storage::disk::common::ensure_directory_exists;
use fs4::fs_std::FileExt;
use log::{debug, warn};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use sysinfo::{ProcessesToUpdate, System};

pub const LOCK_FILE: &str = ".hh.lock";

/// Exclusive ownership of a hinted-handoff data directory. Released, and the
/// lock file removed, on drop.
#[derive(Debug)]
pub struct DirectoryLock {
    path: PathBuf,
    _file: File,
}

impl DirectoryLock {
    pub fn acquire<P: AsRef<Path>>(data_dir: P) -> Result<Self, HhError> {
        let data_dir = data_dir.as_ref();
        ensure_directory_exists(data_dir)
            .map_err(|e| HhError::from_io_error(e, "Failed to create data directory"))?;

        let lock_path = data_dir.join(LOCK_FILE);
        let file = acquire_lock_file(&lock_path, true)?;
        debug!("Locked {}", data_dir.display());
        Ok(DirectoryLock {
            path: lock_path,
            _file: file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DirectoryLock {
    fn drop(&mut self) {
        if self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!("Failed to remove lock file {:?}: {e}", self.path);
            }
        }
    }
}

fn acquire_lock_file(lock_path: &Path, retry_stale: bool) -> Result<File, HhError> {
    let lock_file = create_lock_file(lock_path)?;

    if attempt_to_acquire_lock(&lock_file) {
        write_lock_metadata(&lock_file)?;
        return Ok(lock_file);
    }

    match extract_pid_from_lock_file(lock_path) {
        Some(pid) if is_process_alive(pid) => Err(HhError::DirectoryLocked {
            context: "Hinted handoff directory is already in use".to_string(),
            pid: Some(pid),
        }),
        // The holder is gone; take over its lock file once.
        _ if retry_stale && std::fs::remove_file(lock_path).is_ok() => {
            acquire_lock_file(lock_path, false)
        }
        _ => Err(HhError::DirectoryLocked {
            context: "Hinted handoff directory is already in use".to_string(),
            pid: None,
        }),
    }
}

fn create_lock_file(lock_path: &Path) -> Result<File, HhError> {
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path)
        .map_err(|e| HhError::from_io_error(e, "Failed to open lock file"))
}

fn attempt_to_acquire_lock(lock_file: &File) -> bool {
    matches!(lock_file.try_lock_exclusive(), Ok(true))
}

fn write_lock_metadata(lock_file: &File) -> Result<(), HhError> {
    let pid = std::process::id();
    let timestamp = chrono::Utc::now().to_rfc3339();
    let lock_info = format!("PID: {pid}\nTimestamp: {timestamp}\n");

    let _ = lock_file.set_len(0);
    (&*lock_file)
        .write_all(lock_info.as_bytes())
        .map_err(|e| HhError::from_io_error(e, "Failed to write lock metadata"))
}

fn extract_pid_from_lock_file(lock_path: &Path) -> Option<u32> {
    std::fs::read_to_string(lock_path).ok().and_then(|content| {
        content
            .lines()
            .find(|line| line.starts_with("PID:"))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|pid_str| pid_str.parse::<u32>().ok())
    })
}

fn is_process_alive(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, false);
    system
        .processes()
        .get(&sysinfo::Pid::from(pid as usize))
        .is_some()
}
