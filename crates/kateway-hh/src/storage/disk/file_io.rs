use crate::error::HhError;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Seek, SeekFrom, Write};
use std::path::Path;

/// Thin wrappers over `std::fs::File` that translate failures into [`HhError`].
pub struct FileIo;

impl FileIo {
    #[tracing::instrument(level = "debug", skip(path), fields(path = %path.display()))]
    pub fn create_with_append_and_read_permissions(path: &Path) -> Result<File, HhError> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)
            .map_err(|e| {
                HhError::from_io_error(
                    e,
                    &format!("Failed to create file with append+read permissions: {path:?}"),
                )
            })
    }

    #[tracing::instrument(level = "debug", skip(path), fields(path = %path.display()))]
    pub fn create_with_write_truncate_permissions(path: &Path) -> Result<File, HhError> {
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|e| {
                HhError::from_io_error(
                    e,
                    &format!("Failed to create file with write+truncate permissions: {path:?}"),
                )
            })
    }

    #[tracing::instrument(level = "debug", skip(path), fields(path = %path.display()))]
    pub fn open_with_read_only_permissions(path: &Path) -> Result<File, HhError> {
        File::open(path).map_err(|e| {
            HhError::from_io_error(
                e,
                &format!("Failed to open file with read-only permissions: {path:?}"),
            )
        })
    }

    /// Writes the whole buffer, reporting a sink that stops accepting bytes as `ShortWrite`.
    pub fn write_fully<W: Write>(sink: &mut W, data: &[u8]) -> Result<(), HhError> {
        let mut written = 0;
        while written < data.len() {
            match sink.write(&data[written..]) {
                Ok(0) => {
                    return Err(HhError::ShortWrite {
                        expected: data.len(),
                        written,
                    });
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(HhError::from_io_error(e, "Failed to write data")),
            }
        }
        Ok(())
    }

    /// Appends `data` and returns the file position it starts at.
    #[tracing::instrument(level = "debug", skip(handle, data), fields(len = data.len()))]
    pub fn append_data_to_end(handle: &mut File, data: &[u8]) -> Result<u64, HhError> {
        let current_position = handle
            .seek(SeekFrom::End(0))
            .map_err(|e| HhError::from_io_error(e, "Failed to seek to end of file"))?;

        Self::write_fully(handle, data)?;

        Ok(current_position)
    }

    #[tracing::instrument(level = "debug", skip(handle))]
    pub fn synchronize_to_disk(handle: &mut File) -> Result<(), HhError> {
        handle
            .sync_all()
            .map_err(|e| HhError::from_io_error(e, "Failed to sync file to disk"))
    }

    #[tracing::instrument(level = "debug", skip(handle))]
    pub fn get_file_size(handle: &File) -> Result<u64, HhError> {
        let file_metadata = handle
            .metadata()
            .map_err(|e| HhError::from_io_error(e, "Failed to get file metadata"))?;

        Ok(file_metadata.len())
    }

    /// Replaces `path` with `data` so that readers see either the old or the new
    /// contents in full: write a sibling temp file, fsync it, rename over `path`,
    /// then fsync the directory so the rename itself is durable.
    #[tracing::instrument(level = "debug", skip(path, data), fields(path = %path.display(), len = data.len()))]
    pub fn atomic_replace(path: &Path, data: &[u8], sync: bool) -> Result<(), HhError> {
        let tmp_path = path.with_extension("tmp");
        {
            let mut tmp = Self::create_with_write_truncate_permissions(&tmp_path)?;
            Self::write_fully(&mut tmp, data)?;
            if sync {
                Self::synchronize_to_disk(&mut tmp)?;
            }
        }

        std::fs::rename(&tmp_path, path).map_err(|e| {
            HhError::from_io_error(e, &format!("Failed to rename {tmp_path:?} to {path:?}"))
        })?;

        if sync {
            if let Some(parent) = path.parent() {
                // Directory fsync is not supported everywhere; the rename already happened.
                if let Ok(dir) = File::open(parent) {
                    let _ = dir.sync_all();
                }
            }
        }
        Ok(())
    }
}
