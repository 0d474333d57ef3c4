//! Skip-list codec and the shared decoded-skip cache
//!
//! Every `skiplist_block_size` documents of a word get one skip entry
//! holding the doclist decoder state at that block boundary, so a reader
//! can jump straight to a block and resume delta decoding without the
//! preceding stream. Entries are delta-coded against the previous entry;
//! the row and doclist deltas are biased down by the block size, which
//! every block trivially exceeds, keeping the stored values small.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::index::hit::RowId;
use crate::index::stream::{ByteCursor, StreamWriter};

/// Decoder state at one skip-block boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SkipEntry {
    /// Row-id delta baseline: (last row of the previous block) + 1, or 0
    /// for the first block.
    pub base_row_id_plus1: u32,
    /// Absolute doclist offset of the block's first entry.
    pub doclist_offset: u64,
    /// Hitlist-offset delta baseline at the block boundary.
    pub base_hitlist_pos: u64,
}

/// Encode a word's skip entries. The first entry is delta-coded against
/// the word's stream origins; later entries against their predecessor with
/// the block-size bias.
pub fn encode_skiplist(
    entries: &[SkipEntry],
    block_size: u32,
    word_doclist_start: u64,
    out: &mut StreamWriter,
) -> Result<()> {
    let mut prev: Option<&SkipEntry> = None;
    for entry in entries {
        match prev {
            None => {
                out.write_vlb(entry.base_row_id_plus1 as u64)?;
                out.write_vlb(entry.doclist_offset - word_doclist_start)?;
                out.write_vlb(entry.base_hitlist_pos)?;
            }
            Some(p) => {
                out.write_vlb((entry.base_row_id_plus1 - p.base_row_id_plus1 - block_size) as u64)?;
                out.write_vlb(entry.doclist_offset - p.doclist_offset - block_size as u64)?;
                out.write_vlb(entry.base_hitlist_pos - p.base_hitlist_pos)?;
            }
        }
        prev = Some(entry);
    }
    Ok(())
}

/// Decode `count` skip entries written by [`encode_skiplist`].
pub fn decode_skiplist(
    cursor: &mut ByteCursor,
    count: usize,
    block_size: u32,
    word_doclist_start: u64,
) -> std::io::Result<Vec<SkipEntry>> {
    let mut entries = Vec::with_capacity(count);
    let mut prev: Option<SkipEntry> = None;
    for _ in 0..count {
        let row = cursor.read_vlb_u32()?;
        let doc = cursor.read_vlb()?;
        let hit = cursor.read_vlb()?;
        let entry = match prev {
            None => SkipEntry {
                base_row_id_plus1: row,
                doclist_offset: word_doclist_start + doc,
                base_hitlist_pos: hit,
            },
            Some(p) => SkipEntry {
                base_row_id_plus1: p.base_row_id_plus1 + row + block_size,
                doclist_offset: p.doclist_offset + doc + block_size as u64,
                base_hitlist_pos: p.base_hitlist_pos + hit,
            },
        };
        entries.push(entry);
        prev = Some(entry);
    }
    Ok(entries)
}

/// One word's decoded skip entries, shared across readers.
#[derive(Debug)]
pub struct SkipData {
    pub entries: Vec<SkipEntry>,
}

impl SkipData {
    pub fn decoded_bytes(&self) -> usize {
        self.entries.len() * std::mem::size_of::<SkipEntry>()
    }

    /// Deepest block whose delta baseline does not exceed `target`; the
    /// first row with id >= target can only live in this block or later
    /// linear decoding from it.
    pub fn find_block(&self, target: RowId) -> usize {
        self.entries
            .partition_point(|e| e.base_row_id_plus1 <= target)
            .saturating_sub(1)
    }
}

/// Lists this short are cheaper to re-decode than to track in the cache.
const CACHE_MIN_ENTRIES: usize = 4;

struct CacheSlot {
    data: Arc<SkipData>,
    bytes: usize,
    last_access: u64,
}

struct CacheInner {
    map: HashMap<(u64, u64), CacheSlot>,
    total_bytes: usize,
    access: u64,
}

/// Shared cache of decoded skip lists, keyed by (segment id, word hash)
/// and bounded by total decoded bytes across all open segments.
///
/// Entries are `Arc`ed: eviction only drops the cache's reference, so a
/// reader holding a list keeps it valid. Releasing is dropping the `Arc`.
pub struct SkipCache {
    inner: Mutex<CacheInner>,
    max_bytes: usize,
}

impl SkipCache {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                total_bytes: 0,
                access: 0,
            }),
            max_bytes,
        }
    }

    pub fn find(&self, segment_id: u64, word_hash: u64) -> Option<Arc<SkipData>> {
        let mut inner = self.inner.lock();
        inner.access += 1;
        let access = inner.access;
        let slot = inner.map.get_mut(&(segment_id, word_hash))?;
        slot.last_access = access;
        Some(slot.data.clone())
    }

    /// Insert a freshly decoded list. Short lists and lists that can never
    /// fit are silently skipped; a failed insert just forgoes caching.
    pub fn insert(&self, segment_id: u64, word_hash: u64, data: Arc<SkipData>) {
        if data.entries.len() <= CACHE_MIN_ENTRIES {
            return;
        }
        let bytes = data.decoded_bytes();
        if bytes > self.max_bytes {
            return;
        }

        let mut inner = self.inner.lock();
        if inner.map.contains_key(&(segment_id, word_hash)) {
            return;
        }
        while inner.total_bytes + bytes > self.max_bytes {
            let lru_key = inner
                .map
                .iter()
                .min_by_key(|(_, slot)| slot.last_access)
                .map(|(&k, _)| k);
            match lru_key {
                Some(key) => {
                    if let Some(slot) = inner.map.remove(&key) {
                        inner.total_bytes -= slot.bytes;
                    }
                }
                None => break,
            }
        }

        inner.access += 1;
        let access = inner.access;
        inner.total_bytes += bytes;
        inner.map.insert(
            (segment_id, word_hash),
            CacheSlot {
                data,
                bytes,
                last_access: access,
            },
        );
    }

    pub fn cached_bytes(&self) -> usize {
        self.inner.lock().total_bytes
    }
}
