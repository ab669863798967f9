//! On-disk framing of a single hinted-handoff record.
//!
//! ```text
//! [4B key_len BE][key][4B value_len BE][value]
//! ```
//!
//! There is no checksum: a torn tail is detected by the reader running out of
//! bytes mid-record, and garbage is bounded by the maximum block size.

use crate::error::HhError;
use crate::storage::disk::file_io::FileIo;
use std::io::{ErrorKind, Read, Write};

const LEN_PREFIX: usize = 4;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Block {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Block {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Bytes this block occupies in a segment.
    pub fn encoded_len(&self) -> u64 {
        (self.key.len() + self.value.len() + 2 * LEN_PREFIX) as u64
    }

    /// Rejects blocks the reader would later treat as corruption.
    pub fn check_size(&self, max_block_size: u32) -> Result<(), HhError> {
        for len in [self.key.len(), self.value.len()] {
            if len > max_block_size as usize {
                return Err(HhError::BlockTooLarge {
                    len,
                    max: max_block_size,
                });
            }
        }
        Ok(())
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.reserve(self.encoded_len() as usize);
        buf.extend_from_slice(&(self.key.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&(self.value.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.value);
    }

    /// Streams the framed block into `sink`, returning the bytes written.
    ///
    /// A failure part-way leaves a partial record behind; segments rely on the
    /// reader to detect it.
    pub fn write_to<W: Write>(&self, sink: &mut W) -> Result<usize, HhError> {
        FileIo::write_fully(sink, &(self.key.len() as u32).to_be_bytes())?;
        FileIo::write_fully(sink, &self.key)?;
        FileIo::write_fully(sink, &(self.value.len() as u32).to_be_bytes())?;
        FileIo::write_fully(sink, &self.value)?;
        Ok(self.encoded_len() as usize)
    }

    /// Decodes the next block from `source` into `self`, recycling the existing
    /// key/value allocations.
    ///
    /// `EndOfSegment` means the source ended cleanly on a record boundary.
    pub fn read_from<R: Read>(
        &mut self,
        source: &mut R,
        max_block_size: u32,
    ) -> Result<(), HhError> {
        let key_len = match read_len(source)? {
            Some(len) => len,
            None => return Err(HhError::EndOfSegment),
        };
        read_field(source, &mut self.key, key_len, max_block_size, "key")?;

        let value_len = read_len(source)?.ok_or(HhError::ShortRead {
            expected: LEN_PREFIX,
            got: 0,
        })?;
        read_field(source, &mut self.value, value_len, max_block_size, "value")?;

        Ok(())
    }
}

/// `None` when the source is exhausted before the first byte.
fn read_len<R: Read>(source: &mut R) -> Result<Option<u32>, HhError> {
    let mut bytes = [0u8; LEN_PREFIX];
    let got = read_full(source, &mut bytes)?;
    match got {
        0 => Ok(None),
        LEN_PREFIX => Ok(Some(u32::from_be_bytes(bytes))),
        got => Err(HhError::ShortRead {
            expected: LEN_PREFIX,
            got,
        }),
    }
}

fn read_field<R: Read>(
    source: &mut R,
    buf: &mut Vec<u8>,
    len: u32,
    max_block_size: u32,
    field: &str,
) -> Result<(), HhError> {
    if len > max_block_size {
        return Err(HhError::corrupt(
            "block read",
            format!("{field} length {len} exceeds max block size {max_block_size}"),
        ));
    }

    let len = len as usize;
    buf.clear();
    buf.resize(len, 0);
    let got = read_full(source, buf)?;
    if got != len {
        return Err(HhError::ShortRead { expected: len, got });
    }
    Ok(())
}

/// Like `read_exact`, but reports how far it got instead of failing on EOF.
fn read_full<R: Read>(source: &mut R, buf: &mut [u8]) -> Result<usize, HhError> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(HhError::from_io_error(e, "block read")),
        }
    }
    Ok(filled)
}
