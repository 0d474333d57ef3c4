//! Buffered stream writer and loaded-byte cursor for segment streams
//!
//! Writers append through a bounded flush buffer and track their logical
//! offset; readers operate over fully loaded (mmappable) stream bytes with
//! a slice cursor. Bulk IO reports through the [`Throttle`] policy hook so
//! indexing can be rate-limited against concurrent query IO; the policy
//! itself lives outside this crate.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use crate::error::Result;
use crate::index::varint::{decode_vlb, decode_vlb_u32, encode_vlb};

/// Rate-limit policy consulted before bulk reads and writes.
pub trait Throttle: Send + Sync {
    fn on_io(&self, bytes: usize);
}

/// Default policy: no pacing.
pub struct NoThrottle;

impl Throttle for NoThrottle {
    fn on_io(&self, _bytes: usize) {}
}

/// Gate consulted before every physical flush of a [`StreamWriter`].
///
/// Used by the in-place spill strategy to relocate unread raw-block data
/// out of the way before the write cursor reaches it.
pub trait WriteGate {
    fn before_write(&mut self, offset: u64, len: usize) -> Result<()>;
}

const DEFAULT_WRITE_BUFFER: usize = 256 * 1024;

/// Append-only buffered writer over one segment stream file.
pub struct StreamWriter {
    file: File,
    buf: Vec<u8>,
    cap: usize,
    /// Physical bytes flushed so far (equals the file cursor position).
    written: u64,
    gate: Option<Box<dyn WriteGate>>,
    throttle: Arc<dyn Throttle>,
}

impl StreamWriter {
    /// Create (truncate) a stream file.
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self::from_file(file, 0))
    }

    /// Open an existing file for writing, positioned at `offset`. Bytes
    /// before `offset` are preserved.
    pub fn open_at(path: &Path, offset: u64) -> Result<Self> {
        let mut file = OpenOptions::new().write(true).open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(Self::from_file(file, offset))
    }

    fn from_file(file: File, written: u64) -> Self {
        Self {
            file,
            buf: Vec::with_capacity(DEFAULT_WRITE_BUFFER),
            cap: DEFAULT_WRITE_BUFFER,
            written,
            gate: None,
            throttle: Arc::new(NoThrottle),
        }
    }

    pub fn set_gate(&mut self, gate: Box<dyn WriteGate>) {
        self.gate = Some(gate);
    }

    /// Shrink or grow the flush buffer. The in-place build uses this to
    /// flush at relocation-buffer granularity so the write gate sees the
    /// cursor advance in small steps.
    pub fn set_capacity(&mut self, cap: usize) {
        self.cap = cap.max(1);
    }

    pub fn set_throttle(&mut self, throttle: Arc<dyn Throttle>) {
        self.throttle = throttle;
    }

    /// Logical offset: flushed bytes plus buffered bytes.
    pub fn offset(&self) -> u64 {
        self.written + self.buf.len() as u64
    }

    pub fn write_byte(&mut self, byte: u8) -> Result<()> {
        self.buf.push(byte);
        self.maybe_flush()
    }

    pub fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(bytes);
        self.maybe_flush()
    }

    pub fn write_vlb(&mut self, value: u64) -> Result<()> {
        encode_vlb(value, &mut self.buf);
        self.maybe_flush()
    }

    fn maybe_flush(&mut self) -> Result<()> {
        if self.buf.len() >= self.cap {
            self.flush_buf()?;
        }
        Ok(())
    }

    fn flush_buf(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        if let Some(gate) = self.gate.as_mut() {
            gate.before_write(self.written, self.buf.len())?;
        }
        self.throttle.on_io(self.buf.len());
        self.file.write_all(&self.buf)?;
        self.written += self.buf.len() as u64;
        self.buf.clear();
        Ok(())
    }

    /// Flush remaining bytes and truncate the file to the logical length
    /// (drops any stale tail left behind by in-place relocation). Returns
    /// the final stream length.
    pub fn finish(mut self) -> Result<u64> {
        self.flush_buf()?;
        self.file.set_len(self.written)?;
        self.file.flush()?;
        Ok(self.written)
    }
}

/// Read cursor over fully loaded stream bytes.
#[derive(Clone)]
pub struct ByteCursor {
    data: Arc<Vec<u8>>,
    pos: usize,
}

impl ByteCursor {
    pub fn new(data: Arc<Vec<u8>>) -> Self {
        Self { data, pos: 0 }
    }

    pub fn at(data: Arc<Vec<u8>>, offset: u64) -> Self {
        Self {
            data,
            pos: offset as usize,
        }
    }

    pub fn offset(&self) -> u64 {
        self.pos as u64
    }

    pub fn seek(&mut self, offset: u64) {
        self.pos = offset as usize;
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn read_vlb(&mut self) -> std::io::Result<u64> {
        decode_vlb(&self.data, &mut self.pos)
    }

    pub fn read_vlb_u32(&mut self) -> std::io::Result<u32> {
        decode_vlb_u32(&self.data, &mut self.pos)
    }

    pub fn read_bytes(&mut self, len: usize) -> std::io::Result<&[u8]> {
        if self.pos + len > self.data.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "read past end of stream",
            ));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }
}
