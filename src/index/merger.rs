//! Two-segment merge: row remapping, kill-list and filter application,
//! and the lock-step dictionary merge
//!
//! Surviving rows from the destination side are assigned new dense row
//! ids first, then the source side's, so the two sides occupy disjoint
//! new ranges and a word present in both dictionaries can be re-emitted
//! as simple concatenation. All output goes to a fresh directory; the
//! header is sealed last, so a failed or cancelled merge never leaves an
//! openable segment and never touches the inputs.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use roaring::{RoaringBitmap, RoaringTreemap};

use crate::config::HitlessMode;
use crate::error::{Error, Result};
use crate::index::dictionary::WordMeta;
use crate::index::encoder::PostingsEncoder;
use crate::index::hit::{AggregateHit, RowId, Term, INVALID_ROWID};
use crate::index::segment::{seal_segment, Segment, SegmentHeader, SegmentStreams};
use crate::index::skiplist::SkipCache;

/// Cooperative cancellation flag, polled between words and between
/// documents. A single word's postings are never interrupted mid-word.
#[derive(Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, AtomicOrdering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(AtomicOrdering::Relaxed)
    }
}

/// Row acceptance predicate evaluated against the caller's attribute
/// storage; rows it rejects are dropped from the merged segment.
pub trait RowFilter {
    fn accept(&self, row_id: RowId) -> bool;
}

impl<F: Fn(RowId) -> bool> RowFilter for F {
    fn accept(&self, row_id: RowId) -> bool {
        self(row_id)
    }
}

/// One side of a merge. `doc_ids` is the dense row-to-document-id table
/// from the attribute store; `kill_list` holds document ids this side
/// kills on the opposite side.
pub struct MergeSide<'a> {
    pub segment: &'a Segment,
    pub doc_ids: &'a [u64],
    pub dead_rows: &'a RoaringBitmap,
    pub kill_list: &'a RoaringTreemap,
    pub filter: Option<&'a dyn RowFilter>,
}

/// Dense old-row to new-row mapping for one side of a merge.
#[derive(Debug)]
pub struct RowIdMap {
    map: Vec<RowId>,
}

impl RowIdMap {
    pub fn get(&self, old: RowId) -> Option<RowId> {
        match self.map.get(old as usize) {
            Some(&new) if new != INVALID_ROWID => Some(new),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Assign new dense row ids to the rows that survive the dead-row set,
/// the opposite side's kill list, and the filter. Fails before anything
/// is written if the id space would overflow.
pub(crate) fn assign_rows(
    doc_ids: &[u64],
    dead_rows: &RoaringBitmap,
    opposite_kill_list: &RoaringTreemap,
    filter: Option<&dyn RowFilter>,
    start: u64,
) -> Result<(RowIdMap, u64)> {
    let mut map = vec![INVALID_ROWID; doc_ids.len()];
    let mut next = start;

    for (row, &doc_id) in doc_ids.iter().enumerate() {
        if dead_rows.contains(row as u32) {
            continue;
        }
        if opposite_kill_list.contains(doc_id) {
            continue;
        }
        if let Some(filter) = filter {
            if !filter.accept(row as RowId) {
                continue;
            }
        }
        if next > (u32::MAX - 1) as u64 {
            return Err(Error::TooManyRows { rows: next + 1 });
        }
        map[row] = next as RowId;
        next += 1;
    }

    Ok((RowIdMap { map }, next))
}

fn build_row_map(side: &MergeSide<'_>, other: &MergeSide<'_>, start: u64) -> Result<(RowIdMap, u64)> {
    assign_rows(
        side.doc_ids,
        side.dead_rows,
        other.kill_list,
        side.filter,
        start,
    )
}

pub struct SegmentMerger<'a> {
    dst: MergeSide<'a>,
    src: MergeSide<'a>,
    out_dir: PathBuf,
    stop: StopFlag,
    skip_cache: Option<Arc<SkipCache>>,
}

impl<'a> SegmentMerger<'a> {
    /// `dst` and `src` may reference the same segment, in which case the
    /// merge degenerates to compacting that one segment.
    pub fn new(dst: MergeSide<'a>, src: MergeSide<'a>, out_dir: &Path, stop: StopFlag) -> Self {
        Self {
            dst,
            src,
            out_dir: out_dir.to_path_buf(),
            stop,
            skip_cache: None,
        }
    }

    pub fn set_skip_cache(&mut self, cache: Arc<SkipCache>) {
        self.skip_cache = Some(cache);
    }

    fn check_stop(&self) -> Result<()> {
        if self.stop.is_stopped() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn merge(self, segment_id: u64) -> Result<SegmentHeader> {
        self.check_stop()?;
        let header = self.dst.segment.header().clone();
        let compaction = std::ptr::eq(self.dst.segment, self.src.segment);
        if !compaction && self.src.segment.header().dict_kind != header.dict_kind {
            return Err(Error::corrupt(
                "cannot merge segments with different dictionary kinds",
            ));
        }

        // row maps come first; overflow must abort before any output IO
        let (dst_map, survivors) = build_row_map(&self.dst, &self.src, 0)?;
        let src_map = if compaction {
            None
        } else {
            Some(build_row_map(&self.src, &self.dst, survivors)?.0)
        };
        tracing::debug!(segment_id, survivors, compaction, "merge row maps built");

        let mut streams = SegmentStreams::create(&self.out_dir, header.dict_kind)?;
        let mut encoder = PostingsEncoder::new(
            &mut streams,
            header.skiplist_block_size,
            header.hit_format,
            HitlessMode::None,
        );

        match &src_map {
            None => self.compact(&dst_map, &mut encoder)?,
            Some(src_map) => self.merge_dictionaries(&dst_map, src_map, &mut encoder)?,
        }

        let counters = encoder.finalize()?;
        let footer = streams.close()?;
        seal_segment(
            &self.out_dir,
            segment_id,
            header.dict_kind,
            header.hit_format,
            header.skiplist_block_size,
            counters,
            footer,
        )
    }

    fn compact(&self, dst_map: &RowIdMap, encoder: &mut PostingsEncoder<'_>) -> Result<()> {
        let mut cursor = self.dst.segment.dict_cursor();
        while let Some((term, meta)) = cursor.next()? {
            self.check_stop()?;
            let hitless = meta.hitless;
            self.transfer_word(self.dst.segment, &term, meta, dst_map, hitless, encoder)?;
        }
        Ok(())
    }

    fn merge_dictionaries(
        &self,
        dst_map: &RowIdMap,
        src_map: &RowIdMap,
        encoder: &mut PostingsEncoder<'_>,
    ) -> Result<()> {
        let mut dst_cursor = self.dst.segment.dict_cursor();
        let mut src_cursor = self.src.segment.dict_cursor();
        let mut dst_word = dst_cursor.next()?;
        let mut src_word = src_cursor.next()?;

        loop {
            self.check_stop()?;
            match (dst_word.take(), src_word.take()) {
                (None, None) => break,
                (Some((term, meta)), None) => {
                    let hitless = meta.hitless;
                    self.transfer_word(self.dst.segment, &term, meta, dst_map, hitless, encoder)?;
                    dst_word = dst_cursor.next()?;
                }
                (None, Some((term, meta))) => {
                    let hitless = meta.hitless;
                    self.transfer_word(self.src.segment, &term, meta, src_map, hitless, encoder)?;
                    src_word = src_cursor.next()?;
                }
                (Some((dst_term, dst_meta)), Some((src_term, src_meta))) => {
                    match dst_term.cmp(&src_term) {
                        Ordering::Less => {
                            let hitless = dst_meta.hitless;
                            self.transfer_word(
                                self.dst.segment,
                                &dst_term,
                                dst_meta,
                                dst_map,
                                hitless,
                                encoder,
                            )?;
                            dst_word = dst_cursor.next()?;
                            src_word = Some((src_term, src_meta));
                        }
                        Ordering::Greater => {
                            let hitless = src_meta.hitless;
                            self.transfer_word(
                                self.src.segment,
                                &src_term,
                                src_meta,
                                src_map,
                                hitless,
                                encoder,
                            )?;
                            src_word = src_cursor.next()?;
                            dst_word = Some((dst_term, dst_meta));
                        }
                        Ordering::Equal => {
                            // both sides carry the word; dst rows all map
                            // below src rows, so plain concatenation keeps
                            // the output ordered
                            let hitless = dst_meta.hitless || src_meta.hitless;
                            if dst_meta.hitless != src_meta.hitless {
                                tracing::warn!(
                                    term = ?dst_term,
                                    "sides disagree on hitless mode; merged word degrades to \
                                     hitless and drops position data"
                                );
                            }
                            self.transfer_word(
                                self.dst.segment,
                                &dst_term,
                                dst_meta,
                                dst_map,
                                hitless,
                                encoder,
                            )?;
                            self.transfer_word(
                                self.src.segment,
                                &src_term,
                                src_meta,
                                src_map,
                                hitless,
                                encoder,
                            )?;
                            dst_word = dst_cursor.next()?;
                            src_word = src_cursor.next()?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Stream one side's postings for one word through the encoder,
    /// remapping rows and dropping the removed ones. When the merged word
    /// is hitless, each document's stored count and field mask are
    /// re-emitted as an aggregate and positions are never decoded.
    fn transfer_word(
        &self,
        segment: &Segment,
        term: &Term,
        meta: WordMeta,
        map: &RowIdMap,
        merged_hitless: bool,
        encoder: &mut PostingsEncoder<'_>,
    ) -> Result<()> {
        let mut reader = segment.postings_for(term, meta, self.skip_cache.as_ref());
        loop {
            self.check_stop()?;
            let m = match reader.get_next_doc()? {
                Some(m) => *m,
                None => break,
            };
            let new_row = match map.get(m.row_id) {
                Some(new_row) => new_row,
                None => continue,
            };

            if merged_hitless {
                encoder.push(AggregateHit::aggregate(
                    term.clone(),
                    new_row,
                    m.hit_count,
                    m.field_mask,
                ))?;
            } else {
                while let Some(pos) = reader.get_next_hit()? {
                    encoder.push(AggregateHit::position(term.clone(), new_row, pos))?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assign_rows_applies_all_three_predicates() {
        let doc_ids = [100u64, 200, 300, 400, 500];
        let mut dead = RoaringBitmap::new();
        dead.insert(0);
        let mut kills = RoaringTreemap::new();
        kills.insert(300);
        let filter = |row: RowId| row != 4;

        let (map, next) =
            assign_rows(&doc_ids, &dead, &kills, Some(&filter), 0).unwrap();
        assert_eq!(next, 2);
        assert_eq!(map.get(0), None); // dead row
        assert_eq!(map.get(1), Some(0));
        assert_eq!(map.get(2), None); // killed by doc id
        assert_eq!(map.get(3), Some(1));
        assert_eq!(map.get(4), None); // filtered out
        assert_eq!(map.get(9), None); // out of range
    }

    #[test]
    fn test_assign_rows_continues_from_start() {
        let doc_ids = [1u64, 2];
        let dead = RoaringBitmap::new();
        let kills = RoaringTreemap::new();
        let (map, next) = assign_rows(&doc_ids, &dead, &kills, None, 10).unwrap();
        assert_eq!(map.get(0), Some(10));
        assert_eq!(map.get(1), Some(11));
        assert_eq!(next, 12);
    }

    #[test]
    fn test_assign_rows_rejects_row_id_overflow() {
        let doc_ids = [1u64, 2, 3];
        let dead = RoaringBitmap::new();
        let kills = RoaringTreemap::new();

        // two ids left in the space: u32::MAX - 2 and u32::MAX - 1
        let start = (u32::MAX - 2) as u64;
        let err = assign_rows(&doc_ids, &dead, &kills, None, start).unwrap_err();
        assert!(matches!(err, Error::TooManyRows { .. }));
    }

    #[test]
    fn test_stop_flag() {
        let flag = StopFlag::new();
        assert!(!flag.is_stopped());
        let clone = flag.clone();
        clone.stop();
        assert!(flag.is_stopped());
    }
}
