//! External-sort segment builder
//!
//! Collects raw hits under a memory budget, sorts and spills full runs as
//! delta blocks, then replays every block through spill buffers and the
//! merge heap into the postings encoder. Two spill strategies:
//!
//! - two-file (default): blocks go to a private temp file that is deleted
//!   after the replay;
//! - in-place: blocks are written into the hitlist file itself, and a
//!   relocation gate moves each block's unread tail toward the end of the
//!   file before the encoder's write cursor would overwrite it. Saves a
//!   temp file's worth of disk at the cost of extra copying.

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::IndexConfig;
use crate::error::{Error, Result};
use crate::index::heap::MergeHeap;
use crate::index::hit::{RawHit, Term};
use crate::index::raw_block::RawBlockWriter;
use crate::index::segment::{seal_segment, SegmentHeader, SegmentStreams, HITLIST_FILE};
use crate::index::spill::{bin_size_for, BinWindow, SharedCursor, SpillBuffer};
use crate::index::encoder::PostingsEncoder;
use crate::index::stream::{NoThrottle, StreamWriter, Throttle, WriteGate};

const RAW_BLOCK_FILE: &str = "rawhits.tmp";

/// Smallest workable memory budget; anything lower is clamped with a
/// warning rather than rejected.
const MIN_MEMORY_LIMIT: usize = 64 * 1024;

fn hit_cost(hit: &RawHit) -> usize {
    std::mem::size_of::<RawHit>()
        + match &hit.term {
            Term::Keyword(bytes) => bytes.capacity(),
            Term::Id(_) => 0,
        }
}

pub struct IndexBuilder {
    cfg: IndexConfig,
    dir: PathBuf,
    segment_id: u64,
    throttle: Arc<dyn Throttle>,

    hits: Vec<RawHit>,
    accum_bytes: usize,

    spill_out: StreamWriter,
    spill_path: PathBuf,
    blocks_start: u64,
    block_lens: Vec<u64>,
}

impl IndexBuilder {
    pub fn create(dir: &Path, mut cfg: IndexConfig, segment_id: u64) -> Result<Self> {
        fs::create_dir_all(dir)?;
        if cfg.memory_limit < MIN_MEMORY_LIMIT {
            tracing::warn!(
                configured = cfg.memory_limit,
                clamped = MIN_MEMORY_LIMIT,
                "memory limit below the minimum viable size, clamping"
            );
            cfg.memory_limit = MIN_MEMORY_LIMIT;
        }
        cfg.skiplist_block_size = cfg.skiplist_block_size.max(1);

        let (spill_path, blocks_start, spill_out) = if cfg.inplace_relocation {
            // raw blocks live in the hitlist file, after its dummy byte
            let path = dir.join(HITLIST_FILE);
            let mut out = StreamWriter::create(&path)?;
            out.write_byte(0)?;
            (path, 1, out)
        } else {
            let path = dir.join(RAW_BLOCK_FILE);
            let out = StreamWriter::create(&path)?;
            (path, 0, out)
        };

        Ok(Self {
            cfg,
            dir: dir.to_path_buf(),
            segment_id,
            throttle: Arc::new(NoThrottle),
            hits: Vec::new(),
            accum_bytes: 0,
            spill_out,
            spill_path,
            blocks_start,
            block_lens: Vec::new(),
        })
    }

    pub fn set_throttle(&mut self, throttle: Arc<dyn Throttle>) {
        self.spill_out.set_throttle(throttle.clone());
        self.throttle = throttle;
    }

    /// Queue one raw hit; spills a sorted run when the accumulator hits
    /// the memory budget.
    pub fn push(&mut self, hit: RawHit) -> Result<()> {
        self.accum_bytes += hit_cost(&hit);
        self.hits.push(hit);
        if self.accum_bytes >= self.cfg.memory_limit {
            self.spill_run()?;
        }
        Ok(())
    }

    pub fn push_hits<I: IntoIterator<Item = RawHit>>(&mut self, hits: I) -> Result<()> {
        for hit in hits {
            self.push(hit)?;
        }
        Ok(())
    }

    fn spill_run(&mut self) -> Result<()> {
        if self.hits.is_empty() {
            return Ok(());
        }
        self.hits.sort_unstable_by(RawHit::sort_cmp);
        let len =
            RawBlockWriter::new(&mut self.spill_out, &self.cfg.hitless_mode).write_run(&self.hits)?;
        self.block_lens.push(len);
        self.hits.clear();
        self.accum_bytes = 0;
        Ok(())
    }

    /// Replay all spilled blocks in global posting order and write the
    /// final segment. Returns the sealed header.
    pub fn finish(mut self) -> Result<SegmentHeader> {
        self.spill_run()?;
        let spill_len = self.spill_out.finish()?;

        let blocks = self.block_lens.len();
        tracing::debug!(
            segment_id = self.segment_id,
            blocks,
            spill_bytes = spill_len,
            "raw hit spill complete, starting replay"
        );

        if blocks == 0 {
            // no hits at all; emit a valid empty segment
            let mut streams = SegmentStreams::create(&self.dir, self.cfg.dict_kind)?;
            let encoder = PostingsEncoder::new(
                &mut streams,
                self.cfg.skiplist_block_size,
                self.cfg.hit_format,
                self.cfg.hitless_mode.clone(),
            );
            let counters = encoder.finalize()?;
            let footer = streams.close()?;
            if !self.cfg.inplace_relocation {
                fs::remove_file(&self.spill_path)?;
            }
            return seal_segment(
                &self.dir,
                self.segment_id,
                self.cfg.dict_kind,
                self.cfg.hit_format,
                self.cfg.skiplist_block_size,
                counters,
                footer,
            );
        }

        let bin_size = bin_size_for(self.cfg.memory_limit, blocks);
        let read_file = Arc::new(File::open(&self.spill_path)?);
        let cursor = SharedCursor::new();

        let mut bins = Vec::with_capacity(blocks);
        let mut offset = self.blocks_start;
        for &len in &self.block_lens {
            bins.push(SpillBuffer::new(
                read_file.clone(),
                cursor.clone(),
                offset,
                len,
                bin_size,
                self.cfg.dict_kind,
                self.throttle.clone(),
            ));
            offset += len;
        }
        for bin in &mut bins {
            bin.precache()?;
        }

        let mut streams = if self.cfg.inplace_relocation {
            let mut hitlist = StreamWriter::open_at(&self.spill_path, 1)?;
            hitlist.set_throttle(self.throttle.clone());
            hitlist.set_capacity(self.cfg.relocation_buffer.max(4096));
            let gate = RelocationGate::new(
                bins.iter().map(|b| b.window()).collect(),
                read_file.clone(),
                cursor.clone(),
                OpenOptions::new().write(true).open(&self.spill_path)?,
                spill_len,
                self.cfg.relocation_buffer,
            );
            hitlist.set_gate(Box::new(gate));
            SegmentStreams::with_hitlist(&self.dir, self.cfg.dict_kind, hitlist)?
        } else {
            SegmentStreams::create(&self.dir, self.cfg.dict_kind)?
        };

        let mut encoder = PostingsEncoder::new(
            &mut streams,
            self.cfg.skiplist_block_size,
            self.cfg.hit_format,
            self.cfg.hitless_mode.clone(),
        );

        let mut heap = MergeHeap::with_capacity(blocks);
        for (i, bin) in bins.iter_mut().enumerate() {
            if let Some(hit) = bin.read_hit()? {
                heap.push(hit, i);
            }
        }
        while let Some(entry) = heap.pop() {
            encoder.push(entry.hit)?;
            if let Some(next) = bins[entry.bin].read_hit()? {
                heap.push(next, entry.bin);
            }
        }

        let counters = encoder.finalize()?;
        let footer = streams.close()?;
        if !self.cfg.inplace_relocation {
            fs::remove_file(&self.spill_path)?;
        }

        seal_segment(
            &self.dir,
            self.segment_id,
            self.cfg.dict_kind,
            self.cfg.hit_format,
            self.cfg.skiplist_block_size,
            counters,
            footer,
        )
    }
}

/// Write gate for the in-place strategy. Before the hitlist writer's
/// physical flush may land on still-unread raw-block bytes, the block
/// whose unread data starts earliest is copied to the end of the file and
/// its window retargeted. The `consumer >= producer` invariant is checked
/// after every relocation round; a violation means the strategy's
/// bookkeeping broke and the build must die rather than corrupt data.
struct RelocationGate {
    windows: Vec<Arc<Mutex<BinWindow>>>,
    read_file: Arc<File>,
    cursor: SharedCursor,
    write_file: File,
    tail: u64,
    buf: Vec<u8>,
}

impl RelocationGate {
    fn new(
        windows: Vec<Arc<Mutex<BinWindow>>>,
        read_file: Arc<File>,
        cursor: SharedCursor,
        write_file: File,
        file_end: u64,
        buf_size: usize,
    ) -> Self {
        Self {
            windows,
            read_file,
            cursor,
            write_file,
            tail: file_end,
            buf: vec![0u8; buf_size.max(4096)],
        }
    }

    fn earliest_unread(&self) -> Option<(u64, usize)> {
        self.windows
            .iter()
            .enumerate()
            .filter_map(|(i, w)| {
                let g = w.lock();
                if g.file_left > 0 {
                    Some((g.file_pos, i))
                } else {
                    None
                }
            })
            .min()
    }

    fn relocate(&mut self, idx: usize) -> Result<()> {
        let (mut src, left) = {
            let g = self.windows[idx].lock();
            (g.file_pos, g.file_left)
        };
        let new_pos = self.tail;
        let mut dst = new_pos;
        let mut remaining = left;
        while remaining > 0 {
            let n = (remaining as usize).min(self.buf.len());
            self.cursor
                .read_exact_at(&self.read_file, src, &mut self.buf[..n])?;
            (&self.write_file).seek(SeekFrom::Start(dst))?;
            (&self.write_file).write_all(&self.buf[..n])?;
            src += n as u64;
            dst += n as u64;
            remaining -= n as u64;
        }
        {
            let mut g = self.windows[idx].lock();
            g.file_pos = new_pos;
        }
        self.tail = dst;
        tracing::debug!(block = idx, bytes = left, to = new_pos, "relocated raw block tail");
        Ok(())
    }
}

impl WriteGate for RelocationGate {
    fn before_write(&mut self, offset: u64, len: usize) -> Result<()> {
        let end = offset + len as u64;
        while let Some((start, idx)) = self.earliest_unread() {
            if end <= start {
                break;
            }
            // relocated data must land past everything this write covers
            self.tail = self.tail.max(end);
            self.relocate(idx)?;
        }

        for window in &self.windows {
            let g = window.lock();
            if g.file_left > 0 && g.file_pos < end {
                return Err(Error::corrupt(
                    "in-place relocation left unread data behind the write cursor",
                ));
            }
        }
        Ok(())
    }
}
