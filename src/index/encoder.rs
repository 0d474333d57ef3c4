//! Final-format postings encoder
//!
//! Consumes the globally ordered hit stream (from the merge heap during a
//! build, or from two readers during a segment merge) and writes the
//! doclist, hitlist, skiplist, and dictionary streams. Ordering violations
//! in the input are caller bugs and only checked by debug assertions; the
//! encoder trusts its feed in release builds.

use crate::config::{HitFormat, HitlessMode};
use crate::error::Result;
use crate::index::dictionary::WordMeta;
use crate::index::hit::{
    field_mask_bit, field_of, pure_pos, AggregateHit, RowId, Term, FIELD_END,
};
use crate::index::segment::SegmentStreams;
use crate::index::skiplist::{encode_skiplist, SkipEntry};

/// Totals accumulated over one encode run, returned to the segment header.
#[derive(Clone, Copy, Debug, Default)]
pub struct SegmentCounters {
    pub word_count: u64,
    pub doc_entry_count: u64,
    pub hit_count: u64,
}

pub struct PostingsEncoder<'a> {
    streams: &'a mut SegmentStreams,
    block_size: u32,
    hit_format: HitFormat,
    hitless_mode: HitlessMode,

    totals: SegmentCounters,
    finished: bool,

    // per-word state
    cur_term: Option<Term>,
    word_hitless: bool,
    word_doclist_start: u64,
    word_doc_count: u32,
    word_hit_count: u64,
    last_row_plus1: u32,
    last_hitlist_pos: u64,
    skip_entries: Vec<SkipEntry>,

    // per-document state
    doc_open: bool,
    doc_row: RowId,
    doc_field_mask: u32,
    doc_hit_count: u32,
    doc_hits_offset: u64,
    doc_emitted: bool,
    pending_pos: Option<u32>,
    last_written_pos: u32,
    agg_count: u32,
    agg_mask: u32,
}

impl<'a> PostingsEncoder<'a> {
    pub fn new(
        streams: &'a mut SegmentStreams,
        block_size: u32,
        hit_format: HitFormat,
        hitless_mode: HitlessMode,
    ) -> Self {
        Self {
            streams,
            block_size: block_size.max(1),
            hit_format,
            hitless_mode,
            totals: SegmentCounters::default(),
            finished: false,
            cur_term: None,
            word_hitless: false,
            word_doclist_start: 0,
            word_doc_count: 0,
            word_hit_count: 0,
            last_row_plus1: 0,
            last_hitlist_pos: 0,
            skip_entries: Vec::new(),
            doc_open: false,
            doc_row: 0,
            doc_field_mask: 0,
            doc_hit_count: 0,
            doc_hits_offset: 0,
            doc_emitted: false,
            pending_pos: None,
            last_written_pos: 0,
            agg_count: 0,
            agg_mask: 0,
        }
    }

    /// Feed the next hit in global posting order. A sentinel term closes
    /// the run the same way [`finalize`](Self::finalize) does.
    pub fn push(&mut self, hit: AggregateHit) -> Result<()> {
        debug_assert!(!self.finished, "push after finalize");
        if hit.term.is_sentinel() {
            self.close_word()?;
            self.finished = true;
            return Ok(());
        }

        if self.cur_term.as_ref() != Some(&hit.term) {
            debug_assert!(
                self.cur_term.as_ref().map_or(true, |t| *t < hit.term),
                "terms must arrive in ascending order"
            );
            self.close_word()?;
            self.open_word(hit.term.clone(), hit.is_aggregate());
        }

        if !self.doc_open || self.doc_row != hit.row_id {
            debug_assert!(
                !self.doc_open || hit.row_id > self.doc_row,
                "row ids must strictly increase within a word"
            );
            self.close_doc()?;
            self.open_doc(hit.row_id);
        }

        self.add_hit(&hit)
    }

    /// Close the last word and return the run's totals. The caller owns
    /// stream closing and header assembly.
    pub fn finalize(mut self) -> Result<SegmentCounters> {
        self.close_word()?;
        self.finished = true;
        tracing::debug!(
            words = self.totals.word_count,
            docs = self.totals.doc_entry_count,
            hits = self.totals.hit_count,
            "postings encode complete"
        );
        Ok(self.totals)
    }

    fn open_word(&mut self, term: Term, first_is_aggregate: bool) {
        self.word_hitless = self.hitless_mode.covers(&term) || first_is_aggregate;
        self.word_doclist_start = self.streams.doclist.offset();
        self.word_doc_count = 0;
        self.word_hit_count = 0;
        self.last_row_plus1 = 0;
        self.last_hitlist_pos = 0;
        self.skip_entries.clear();
        self.cur_term = Some(term);
    }

    fn open_doc(&mut self, row_id: RowId) {
        self.doc_open = true;
        self.doc_row = row_id;
        self.doc_field_mask = 0;
        self.doc_hit_count = 0;
        self.doc_hits_offset = 0;
        self.doc_emitted = false;
        self.pending_pos = None;
        self.last_written_pos = 0;
        self.agg_count = 0;
        self.agg_mask = 0;
    }

    fn add_hit(&mut self, hit: &AggregateHit) -> Result<()> {
        if self.word_hitless {
            if hit.is_aggregate() {
                self.agg_count += hit.word_pos;
                self.agg_mask |= hit.field_mask;
            } else {
                // positional input folded into the aggregate
                let pure = pure_pos(hit.word_pos);
                if self.pending_pos != Some(pure) {
                    self.pending_pos = Some(pure);
                    self.agg_count += 1;
                    self.agg_mask |= field_mask_bit(field_of(hit.word_pos));
                }
            }
            return Ok(());
        }

        debug_assert!(
            !hit.is_aggregate(),
            "aggregate hit fed to a positional word"
        );
        match self.pending_pos {
            Some(p) if p == hit.word_pos => {
                // exact duplicate
            }
            Some(p) if pure_pos(p) == pure_pos(hit.word_pos) => {
                // only the field-end flag differs: merge into the pending
                // emission instead of duplicating the position
                self.pending_pos = Some(p | (hit.word_pos & FIELD_END));
            }
            Some(p) => {
                debug_assert!(
                    pure_pos(hit.word_pos) > pure_pos(p),
                    "positions must strictly increase within a document"
                );
                self.emit_hit(p)?;
                self.pending_pos = Some(hit.word_pos);
                self.doc_hit_count += 1;
                self.doc_field_mask |= field_mask_bit(field_of(hit.word_pos));
            }
            None => {
                self.pending_pos = Some(hit.word_pos);
                self.doc_hit_count = 1;
                self.doc_field_mask = field_mask_bit(field_of(hit.word_pos));
            }
        }
        Ok(())
    }

    fn emit_hit(&mut self, wordpos: u32) -> Result<()> {
        if !self.doc_emitted {
            self.doc_hits_offset = self.streams.hitlist.offset();
            self.last_written_pos = 0;
            self.doc_emitted = true;
        }
        let delta = wordpos - self.last_written_pos;
        self.streams.hitlist.write_vlb(delta as u64)?;
        self.last_written_pos = wordpos;
        Ok(())
    }

    fn close_doc(&mut self) -> Result<()> {
        if !self.doc_open {
            return Ok(());
        }

        // one skip entry per block of documents, recorded before the
        // block's first doclist entry is written
        if self.word_doc_count % self.block_size == 0 {
            self.skip_entries.push(SkipEntry {
                base_row_id_plus1: self.last_row_plus1,
                doclist_offset: self.streams.doclist.offset(),
                base_hitlist_pos: self.last_hitlist_pos,
            });
        }

        let doc_delta = (self.doc_row + 1) - self.last_row_plus1;
        self.streams.doclist.write_vlb(doc_delta as u64)?;

        if self.word_hitless {
            self.streams.doclist.write_vlb(self.agg_count as u64)?;
            self.streams.doclist.write_vlb(self.agg_mask as u64)?;
            self.word_hit_count += self.agg_count as u64;
            self.totals.hit_count += self.agg_count as u64;
        } else {
            let pending = self.pending_pos.take();
            debug_assert!(pending.is_some(), "document closed without hits");
            if let Some(p) = pending {
                if !self.doc_emitted
                    && self.doc_hit_count == 1
                    && self.hit_format == HitFormat::Inline
                {
                    // single hit folded into the doclist entry
                    self.streams.doclist.write_vlb(1)?;
                    self.streams.doclist.write_vlb(p as u64)?;
                } else {
                    self.emit_hit(p)?;
                    self.streams.hitlist.write_vlb(0)?;
                    self.streams.doclist.write_vlb(self.doc_hit_count as u64)?;
                    self.streams.doclist.write_vlb(self.doc_field_mask as u64)?;
                    self.streams
                        .doclist
                        .write_vlb(self.doc_hits_offset - self.last_hitlist_pos)?;
                    self.last_hitlist_pos = self.doc_hits_offset;
                }
            }
            self.word_hit_count += self.doc_hit_count as u64;
            self.totals.hit_count += self.doc_hit_count as u64;
        }

        self.last_row_plus1 = self.doc_row + 1;
        self.word_doc_count += 1;
        self.totals.doc_entry_count += 1;
        self.doc_open = false;
        Ok(())
    }

    fn close_word(&mut self) -> Result<()> {
        let term = match self.cur_term.take() {
            Some(term) => term,
            None => return Ok(()),
        };
        self.close_doc()?;

        // doclist terminator
        self.streams.doclist.write_vlb(0)?;
        let doclist_length = self.streams.doclist.offset() - self.word_doclist_start;

        let skiplist_offset = if self.word_doc_count > self.block_size {
            let offset = self.streams.skiplist.offset();
            encode_skiplist(
                &self.skip_entries,
                self.block_size,
                self.word_doclist_start,
                &mut self.streams.skiplist,
            )?;
            Some(offset)
        } else {
            None
        };

        let meta = WordMeta {
            doclist_offset: self.word_doclist_start,
            doclist_length,
            doc_count: self.word_doc_count,
            hitless: self.word_hitless,
            hit_count: self.word_hit_count,
            skiplist_offset,
        };
        self.streams.dict.add(&term, &meta)?;
        self.totals.word_count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DictKind;
    use crate::index::hit::pack_pos;
    use tempfile::TempDir;

    #[test]
    fn test_counters_and_sentinel_handling() {
        let tmp = TempDir::new().unwrap();
        let mut streams = SegmentStreams::create(tmp.path(), DictKind::Crc).unwrap();
        let mut encoder =
            PostingsEncoder::new(&mut streams, 4, HitFormat::Inline, HitlessMode::None);

        encoder
            .push(AggregateHit::position(Term::Id(3), 0, pack_pos(0, 1)))
            .unwrap();
        encoder
            .push(AggregateHit::position(Term::Id(3), 1, pack_pos(0, 2)))
            .unwrap();
        encoder
            .push(AggregateHit::position(Term::Id(9), 0, pack_pos(0, 5)))
            .unwrap();
        // the sentinel closes the run exactly like finalize does
        encoder
            .push(AggregateHit::position(Term::Id(0), 0, 0))
            .unwrap();

        let counters = encoder.finalize().unwrap();
        assert_eq!(counters.word_count, 2);
        assert_eq!(counters.doc_entry_count, 3);
        assert_eq!(counters.hit_count, 3);

        let footer = streams.close().unwrap();
        assert_eq!(footer.entry_count, 2);
        assert_eq!(footer.checkpoint_count, 1);
    }

    #[test]
    fn test_empty_run_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let mut streams = SegmentStreams::create(tmp.path(), DictKind::Crc).unwrap();
        let encoder = PostingsEncoder::new(&mut streams, 4, HitFormat::Inline, HitlessMode::None);

        let counters = encoder.finalize().unwrap();
        assert_eq!(counters.word_count, 0);
        assert_eq!(counters.hit_count, 0);

        let footer = streams.close().unwrap();
        assert_eq!(footer.entry_count, 0);
        assert_eq!(footer.checkpoint_count, 0);
    }
}
