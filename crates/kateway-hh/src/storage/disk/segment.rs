use crate::error::HhError;
use crate::storage::disk::block::Block;
use crate::storage::disk::common::{SyncMode, segment_path};
use crate::storage::disk::file_io::FileIo;
use log::warn;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// An append-only file of framed blocks.
///
/// Readers only ever look at bytes below `durable_size`, which is published
/// after an append has fully reached the file, so a reader positioned earlier
/// in the segment can run alongside the writer.
pub struct Segment {
    pub id: u64,
    pub path: PathBuf,
    writer: Mutex<Option<SegmentWriter>>,
    durable_size: AtomicU64,
    broken: AtomicBool,
    sync_mode: SyncMode,
    max_block_size: u32,
}

struct SegmentWriter {
    file: File,
    buf: Vec<u8>,
}

impl Segment {
    /// Create (or reopen for append) the segment `id` in `dir`.
    #[tracing::instrument(level = "info", skip(dir), fields(dir = %dir.display()))]
    pub fn create(
        dir: &Path,
        id: u64,
        sync_mode: SyncMode,
        max_block_size: u32,
    ) -> Result<Arc<Self>, HhError> {
        let path = segment_path(dir, id);
        let file = FileIo::create_with_append_and_read_permissions(&path)?;
        let size = FileIo::get_file_size(&file)?;

        Ok(Arc::new(Segment {
            id,
            path,
            writer: Mutex::new(Some(SegmentWriter {
                file,
                buf: Vec::new(),
            })),
            durable_size: AtomicU64::new(size),
            broken: AtomicBool::new(false),
            sync_mode,
            max_block_size,
        }))
    }

    /// Open an existing segment read-only. Everything on disk counts as
    /// durable; a torn tail surfaces as corruption when read.
    #[tracing::instrument(level = "info", skip(dir), fields(dir = %dir.display()))]
    pub fn open(
        dir: &Path,
        id: u64,
        sync_mode: SyncMode,
        max_block_size: u32,
    ) -> Result<Arc<Self>, HhError> {
        let path = segment_path(dir, id);
        let file = FileIo::open_with_read_only_permissions(&path)?;
        let size = FileIo::get_file_size(&file)?;

        Ok(Arc::new(Segment {
            id,
            path,
            writer: Mutex::new(None),
            durable_size: AtomicU64::new(size),
            broken: AtomicBool::new(false),
            sync_mode,
            max_block_size,
        }))
    }

    pub fn size(&self) -> u64 {
        self.durable_size.load(Ordering::Acquire)
    }

    pub fn is_sealed(&self) -> bool {
        self.writer.lock().is_none()
    }

    /// Set after a failed append; the tail may hold a partial record.
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    pub fn max_block_size(&self) -> u32 {
        self.max_block_size
    }

    /// Append one block and return the new segment size.
    #[tracing::instrument(level = "debug", skip(self, block), fields(segment = self.id, len = block.encoded_len()))]
    pub fn append(&self, block: &Block) -> Result<u64, HhError> {
        block.check_size(self.max_block_size)?;

        let mut guard = self.writer.lock();
        let writer = guard.as_mut().ok_or_else(|| HhError::Io {
            context: format!("append to segment {}", self.id),
            source: "segment is sealed".to_string(),
        })?;

        writer.buf.clear();
        block.encode_into(&mut writer.buf);

        let result = FileIo::append_data_to_end(&mut writer.file, &writer.buf).and_then(|_| {
            if self.sync_mode == SyncMode::Immediate {
                FileIo::synchronize_to_disk(&mut writer.file)
            } else {
                Ok(())
            }
        });

        if let Err(e) = result {
            warn!(
                "Append to segment {} failed, segment abandoned: {e}",
                self.path.display()
            );
            self.broken.store(true, Ordering::Release);
            return Err(e);
        }

        let new_size = self.size() + writer.buf.len() as u64;
        self.durable_size.store(new_size, Ordering::Release);
        Ok(new_size)
    }

    /// Flush the writer to disk, if there still is one.
    pub fn sync(&self) -> Result<(), HhError> {
        if let Some(writer) = self.writer.lock().as_mut() {
            FileIo::synchronize_to_disk(&mut writer.file)?;
        }
        Ok(())
    }

    /// Stop accepting appends; the segment becomes immutable.
    #[tracing::instrument(level = "debug", skip(self), fields(segment = self.id))]
    pub fn seal(&self) -> Result<(), HhError> {
        let writer = self.writer.lock().take();
        if let Some(mut writer) = writer {
            if self.sync_mode != SyncMode::None {
                FileIo::synchronize_to_disk(&mut writer.file)?;
            }
        }
        Ok(())
    }

    pub fn reader(self: &Arc<Self>, offset: u64) -> Result<SegmentReader, HhError> {
        SegmentReader::new(Arc::clone(self), offset)
    }

    /// Fails unless `offset` is where a block starts or the end of the segment,
    /// found by walking every block in front of it.
    pub fn check_block_boundary(self: &Arc<Self>, offset: u64) -> Result<(), HhError> {
        let out_of_range = HhError::CursorOutOfRange {
            segment: self.id,
            offset,
        };
        let mut reader = self.reader(0)?;
        let mut block = Block::default();
        while reader.position() < offset {
            match reader.read_block(&mut block) {
                Ok(_) => {}
                Err(HhError::EndOfSegment) => return Err(out_of_range),
                Err(e) => return Err(e),
            }
        }
        if reader.position() == offset {
            Ok(())
        } else {
            Err(out_of_range)
        }
    }

    /// Decode exactly one block at `offset` and return the offset that follows it.
    pub fn read_at(self: &Arc<Self>, offset: u64, block: &mut Block) -> Result<u64, HhError> {
        self.reader(offset)?.read_block(block)
    }
}

/// Sequential reader over one segment, kept open across reads.
pub struct SegmentReader {
    segment: Arc<Segment>,
    reader: BufReader<File>,
    pos: u64,
}

impl SegmentReader {
    fn new(segment: Arc<Segment>, offset: u64) -> Result<Self, HhError> {
        let size = segment.size();
        if offset > size {
            return Err(HhError::CursorOutOfRange {
                segment: segment.id,
                offset,
            });
        }

        let mut file = FileIo::open_with_read_only_permissions(&segment.path)?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| HhError::from_io_error(e, "Failed to seek in segment"))?;

        Ok(SegmentReader {
            segment,
            reader: BufReader::new(file),
            pos: offset,
        })
    }

    pub fn segment_id(&self) -> u64 {
        self.segment.id
    }

    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Read the next block. After an error other than `EndOfSegment` the reader
    /// is out of step with the file and must be dropped.
    pub fn read_block(&mut self, block: &mut Block) -> Result<u64, HhError> {
        let durable = self.segment.size();
        if self.pos == durable {
            return Err(HhError::EndOfSegment);
        }
        if self.pos > durable {
            return Err(HhError::CursorOutOfRange {
                segment: self.segment.id,
                offset: self.pos,
            });
        }

        let mut limited = (&mut self.reader).take(durable - self.pos);
        match block.read_from(&mut limited, self.segment.max_block_size) {
            Ok(()) => {
                self.pos += block.encoded_len();
                Ok(self.pos)
            }
            Err(HhError::EndOfSegment) | Err(HhError::ShortRead { .. }) => Err(HhError::corrupt(
                &format!("segment {}", self.segment.path.display()),
                format!("partial block at offset {} of {durable}", self.pos),
            )),
            Err(HhError::SegmentCorrupt { details, .. }) => Err(HhError::corrupt(
                &format!("segment {}", self.segment.path.display()),
                format!("{details} at offset {}", self.pos),
            )),
            Err(e) => Err(e),
        }
    }
}
