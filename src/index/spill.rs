//! Windowed readers over the spilled raw-block file
//!
//! During the external-sort replay every raw block gets one [`SpillBuffer`]
//! reading its byte range of the shared temp file through a fixed-size
//! buffer. All buffers interleave reads on one descriptor, so the file
//! position is owned by a [`SharedCursor`]: before any refill a buffer
//! compares the cursor to its own expected position and reseeks if another
//! buffer (or the in-place relocator) moved it.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::DictKind;
use crate::error::{Error, Result};
use crate::index::hit::{AggregateHit, Term};
use crate::index::stream::Throttle;

/// Longest keyword accepted when decoding a raw block. Anything larger is
/// stream corruption, not a real keyword.
pub const MAX_KEYWORD_LEN: u64 = 1024;

const MIN_BIN_SIZE: usize = 8 * 1024;
const BIN_PAGE: usize = 4 * 1024;
const BIN_WARN_SIZE: usize = 256 * 1024;

/// Per-block spill buffer size for a memory budget split across `blocks`
/// readers. At least 8 KiB, rounded down to 4 KiB pages; sizes under
/// 256 KiB are allowed but seek overhead starts to dominate there, so a
/// warning is logged.
pub fn bin_size_for(memory_limit: usize, blocks: usize) -> usize {
    let per_block = memory_limit / blocks.max(1);
    let size = (per_block / BIN_PAGE * BIN_PAGE).max(MIN_BIN_SIZE);
    if size < BIN_WARN_SIZE {
        tracing::warn!(
            memory_limit,
            blocks,
            bin_size = size,
            "spill buffers under 256KiB; raise the memory limit to reduce IO overhead"
        );
    }
    size
}

/// The shared read position of the spill file descriptor.
#[derive(Clone)]
pub struct SharedCursor(Arc<Mutex<u64>>);

impl SharedCursor {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(0)))
    }

    /// Read exactly `buf.len()` bytes at `pos`, seeking only when some
    /// other reader moved the descriptor since our last read.
    pub fn read_exact_at(&self, file: &File, pos: u64, buf: &mut [u8]) -> std::io::Result<()> {
        let mut cur = self.0.lock();
        if *cur != pos {
            (&*file).seek(SeekFrom::Start(pos))?;
        }
        (&*file).read_exact(buf)?;
        *cur = pos + buf.len() as u64;
        Ok(())
    }
}

impl Default for SharedCursor {
    fn default() -> Self {
        Self::new()
    }
}

/// The unread byte range of one raw block. Shared with the in-place
/// relocator, which may move the range to a new file position while the
/// block is being consumed.
#[derive(Clone, Copy, Debug)]
pub struct BinWindow {
    pub file_pos: u64,
    pub file_left: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BinState {
    Word,
    Doc,
    Pos,
}

/// Decoder for one spilled raw block.
pub struct SpillBuffer {
    file: Arc<File>,
    cursor: SharedCursor,
    window: Arc<Mutex<BinWindow>>,
    throttle: Arc<dyn Throttle>,
    buf: Vec<u8>,
    pos: usize,
    cap: usize,
    dict_kind: DictKind,
    state: BinState,
    done: bool,
    term_id: u64,
    keyword: Vec<u8>,
    last_row_plus1: u32,
    last_word_pos: u32,
}

impl SpillBuffer {
    pub fn new(
        file: Arc<File>,
        cursor: SharedCursor,
        range_start: u64,
        range_len: u64,
        cap: usize,
        dict_kind: DictKind,
        throttle: Arc<dyn Throttle>,
    ) -> Self {
        Self {
            file,
            cursor,
            window: Arc::new(Mutex::new(BinWindow {
                file_pos: range_start,
                file_left: range_len,
            })),
            throttle,
            buf: Vec::new(),
            pos: 0,
            cap,
            dict_kind,
            state: BinState::Word,
            done: false,
            term_id: 0,
            keyword: Vec::new(),
            last_row_plus1: 0,
            last_word_pos: 0,
        }
    }

    /// Handle to this block's unread window, for the relocation registry.
    pub fn window(&self) -> Arc<Mutex<BinWindow>> {
        self.window.clone()
    }

    /// Slurp the remaining declared range into memory when it fits the
    /// buffer, skipping any further seeks on the shared descriptor.
    /// Returns whether the block is now fully resident.
    pub fn precache(&mut self) -> Result<bool> {
        let (file_pos, file_left) = {
            let w = self.window.lock();
            (w.file_pos, w.file_left)
        };
        if file_left == 0 {
            return Ok(true);
        }
        let unconsumed = self.buf.len() - self.pos;
        if unconsumed + file_left as usize > self.cap {
            return Ok(false);
        }

        self.buf.drain(..self.pos);
        self.pos = 0;
        let old_len = self.buf.len();
        self.buf.resize(old_len + file_left as usize, 0);
        self.throttle.on_io(file_left as usize);
        self.cursor
            .read_exact_at(&self.file, file_pos, &mut self.buf[old_len..])?;

        let mut w = self.window.lock();
        w.file_pos += file_left;
        w.file_left = 0;
        Ok(true)
    }

    fn refill(&mut self) -> Result<()> {
        let (file_pos, file_left) = {
            let w = self.window.lock();
            (w.file_pos, w.file_left)
        };
        if file_left == 0 {
            return Err(Error::corrupt(
                "raw block ended before its stream terminator",
            ));
        }

        let n = (file_left as usize).min(self.cap);
        self.buf.resize(n, 0);
        self.pos = 0;
        self.throttle.on_io(n);
        self.cursor
            .read_exact_at(&self.file, file_pos, &mut self.buf[..n])?;

        let mut w = self.window.lock();
        w.file_pos += n as u64;
        w.file_left -= n as u64;
        Ok(())
    }

    fn read_byte(&mut self) -> Result<u8> {
        if self.pos >= self.buf.len() {
            self.refill()?;
        }
        let byte = self.buf[self.pos];
        self.pos += 1;
        Ok(byte)
    }

    fn read_vlb(&mut self) -> Result<u64> {
        let mut result: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.read_byte()?;
            result |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
            if shift > 63 {
                return Err(Error::corrupt("vlb value overflows 64 bits in raw block"));
            }
        }
    }

    fn read_keyword(&mut self, len: usize) -> Result<()> {
        self.keyword.clear();
        self.keyword.reserve(len);
        for _ in 0..len {
            let byte = self.read_byte()?;
            self.keyword.push(byte);
        }
        Ok(())
    }

    fn current_term(&self) -> Term {
        match self.dict_kind {
            DictKind::Crc => Term::Id(self.term_id),
            DictKind::Keyword => Term::Keyword(self.keyword.clone()),
        }
    }

    /// Decode the next hit, or `None` at the block's declared end.
    pub fn read_hit(&mut self) -> Result<Option<AggregateHit>> {
        if self.done {
            return Ok(None);
        }

        loop {
            match self.state {
                BinState::Word => {
                    let token = self.read_vlb()?;
                    if token == 0 {
                        self.done = true;
                        return Ok(None);
                    }
                    match self.dict_kind {
                        DictKind::Crc => self.term_id += token,
                        DictKind::Keyword => {
                            if token > MAX_KEYWORD_LEN {
                                return Err(Error::corrupt(format!(
                                    "keyword length {} out of range in raw block",
                                    token
                                )));
                            }
                            self.read_keyword(token as usize)?;
                        }
                    }
                    self.last_row_plus1 = 0;
                    self.state = BinState::Doc;
                }
                BinState::Doc => {
                    let delta = self.read_vlb()?;
                    if delta == 0 {
                        self.state = BinState::Word;
                        continue;
                    }
                    self.last_row_plus1 = self
                        .last_row_plus1
                        .checked_add(u32::try_from(delta).map_err(|_| {
                            Error::corrupt("row delta overflows 32 bits in raw block")
                        })?)
                        .ok_or_else(|| Error::corrupt("row id overflows 32 bits in raw block"))?;
                    self.last_word_pos = 0;
                    self.state = BinState::Pos;
                }
                BinState::Pos => {
                    let token = self.read_vlb()?;
                    if token == 0 {
                        self.state = BinState::Doc;
                        continue;
                    }
                    let row_id = self.last_row_plus1 - 1;
                    if token & 1 == 1 {
                        // hitless aggregate: count plus a field mask token
                        let count = (token >> 1) as u32;
                        let mask = self.read_vlb()? as u32;
                        return Ok(Some(AggregateHit::aggregate(
                            self.current_term(),
                            row_id,
                            count,
                            mask,
                        )));
                    }
                    self.last_word_pos += (token >> 1) as u32;
                    return Ok(Some(AggregateHit::position(
                        self.current_term(),
                        row_id,
                        self.last_word_pos,
                    )));
                }
            }
        }
    }
}
