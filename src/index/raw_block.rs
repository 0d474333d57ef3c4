//! Phase-1 raw block encoder
//!
//! Takes one in-memory run of hits already sorted in posting order and
//! spills it as a compact delta stream:
//!
//! ```text
//! block := (word (doc pos* 0)+ 0)* 0
//! word  := id delta | keyword length + bytes     (nonzero)
//! doc   := (row_id + 1) delta                    (nonzero)
//! pos   := (wordpos delta << 1)                  (positions)
//!        | (hit count << 1 | 1), field mask      (hitless aggregate)
//! ```
//!
//! The stream is self-terminated by three zero tokens (end of positions,
//! end of doclist, end of words). Exact duplicate hits are dropped; a hit
//! that differs from the previous one only by the field-end flag replaces
//! it instead of appending. For hitless words, hits for one (word, doc)
//! fold into a running (count, field mask) pair flushed on the next
//! transition.

use crate::config::HitlessMode;
use crate::error::Result;
use crate::index::hit::{field_mask_bit, field_of, pure_pos, RawHit, RowId, Term, FIELD_END};
use crate::index::stream::StreamWriter;

pub struct RawBlockWriter<'a> {
    out: &'a mut StreamWriter,
    hitless: &'a HitlessMode,
}

impl<'a> RawBlockWriter<'a> {
    pub fn new(out: &'a mut StreamWriter, hitless: &'a HitlessMode) -> Self {
        Self { out, hitless }
    }

    /// Spill one sorted run. Returns the block's byte length, which the
    /// caller must record: blocks are not self-describing.
    pub fn write_run(&mut self, run: &[RawHit]) -> Result<u64> {
        let start = self.out.offset();

        let mut cur_term: Option<&Term> = None;
        let mut word_hitless = false;
        let mut last_id: u64 = 0;
        let mut last_row_plus1: u32 = 0;

        let mut doc_open = false;
        let mut last_emitted_pos: u32 = 0;
        let mut pending: Option<u32> = None;
        let mut agg_count: u32 = 0;
        let mut agg_mask: u32 = 0;
        let mut last_pure: Option<u32> = None;

        for (i, hit) in run.iter().enumerate() {
            if i > 0 {
                debug_assert!(
                    RawHit::sort_cmp(&run[i - 1], hit) != std::cmp::Ordering::Greater,
                    "raw block input must be sorted in posting order"
                );
            }

            let new_word = cur_term != Some(&hit.term);
            let new_doc = new_word || !doc_open || last_row_plus1 != hit.row_id + 1;

            if new_doc {
                if doc_open {
                    self.close_doc(word_hitless, pending.take(), last_emitted_pos, agg_count, agg_mask)?;
                }
                if new_word {
                    if cur_term.is_some() {
                        // end of the previous word's doclist
                        self.out.write_vlb(0)?;
                    }
                    self.write_word_token(&hit.term, &mut last_id)?;
                    cur_term = Some(&hit.term);
                    word_hitless = self.hitless.covers(&hit.term);
                    last_row_plus1 = 0;
                }
                self.write_doc_token(hit.row_id, &mut last_row_plus1)?;
                doc_open = true;
                last_emitted_pos = 0;
                pending = None;
                agg_count = 0;
                agg_mask = 0;
                last_pure = None;
            }

            let pure = pure_pos(hit.word_pos);
            if word_hitless {
                if last_pure == Some(pure) {
                    continue;
                }
                last_pure = Some(pure);
                agg_count += 1;
                agg_mask |= field_mask_bit(field_of(hit.word_pos));
            } else {
                match pending {
                    Some(p) if p == hit.word_pos => {
                        // exact duplicate
                    }
                    Some(p) if pure_pos(p) == pure => {
                        // differs only by the field-end flag; replace the
                        // pending emission instead of appending
                        pending = Some(p | (hit.word_pos & FIELD_END));
                    }
                    Some(p) => {
                        last_emitted_pos = self.emit_pos(p, last_emitted_pos)?;
                        pending = Some(hit.word_pos);
                    }
                    None => pending = Some(hit.word_pos),
                }
            }
        }

        if doc_open {
            self.close_doc(word_hitless, pending.take(), last_emitted_pos, agg_count, agg_mask)?;
        }
        if cur_term.is_some() {
            self.out.write_vlb(0)?;
        }
        // end of words
        self.out.write_vlb(0)?;

        let bytes = self.out.offset() - start;
        tracing::debug!(hits = run.len(), bytes, "spilled raw block");
        Ok(bytes)
    }

    fn write_word_token(&mut self, term: &Term, last_id: &mut u64) -> Result<()> {
        match term {
            Term::Id(id) => {
                debug_assert!(*id > *last_id, "word ids must be nonzero and increasing");
                self.out.write_vlb(*id - *last_id)?;
                *last_id = *id;
            }
            Term::Keyword(bytes) => {
                debug_assert!(!bytes.is_empty(), "keywords must be non-empty");
                self.out.write_vlb(bytes.len() as u64)?;
                self.out.write_all(bytes)?;
            }
        }
        Ok(())
    }

    fn write_doc_token(&mut self, row_id: RowId, last_row_plus1: &mut u32) -> Result<()> {
        let delta = (row_id + 1) - *last_row_plus1;
        debug_assert!(delta > 0, "row ids must be strictly increasing per word");
        self.out.write_vlb(delta as u64)?;
        *last_row_plus1 = row_id + 1;
        Ok(())
    }

    fn emit_pos(&mut self, wordpos: u32, last: u32) -> Result<u32> {
        let delta = wordpos - last;
        debug_assert!(delta > 0);
        self.out.write_vlb((delta as u64) << 1)?;
        Ok(wordpos)
    }

    fn close_doc(
        &mut self,
        word_hitless: bool,
        pending: Option<u32>,
        last_emitted_pos: u32,
        agg_count: u32,
        agg_mask: u32,
    ) -> Result<()> {
        if word_hitless {
            self.out.write_vlb(((agg_count as u64) << 1) | 1)?;
            self.out.write_vlb(agg_mask as u64)?;
        } else if let Some(p) = pending {
            self.emit_pos(p, last_emitted_pos)?;
        }
        // end of this document's positions
        self.out.write_vlb(0)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::hit::pack_pos;
    use tempfile::TempDir;

    fn spill(hits: &[RawHit], hitless: &HitlessMode) -> (Vec<u8>, u64) {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("block.bin");
        let mut out = StreamWriter::create(&path).unwrap();
        let mut writer = RawBlockWriter::new(&mut out, hitless);
        let len = writer.write_run(hits).unwrap();
        out.finish().unwrap();
        (std::fs::read(&path).unwrap(), len)
    }

    #[test]
    fn test_empty_run_is_one_terminator() {
        let (data, len) = spill(&[], &HitlessMode::None);
        assert_eq!(data, vec![0]);
        assert_eq!(len, 1);
    }

    #[test]
    fn test_reported_length_matches_file() {
        let hits = vec![
            RawHit::new(Term::Id(3), 0, pack_pos(0, 1)),
            RawHit::new(Term::Id(3), 0, pack_pos(0, 5)),
            RawHit::new(Term::Id(3), 4, pack_pos(1, 2)),
            RawHit::new(Term::Id(9), 1, pack_pos(0, 1)),
        ];
        let (data, len) = spill(&hits, &HitlessMode::None);
        assert_eq!(data.len() as u64, len);
        // stream ends with pos/doclist/word terminators
        assert_eq!(&data[data.len() - 3..], &[0, 0, 0]);
    }

    #[test]
    fn test_exact_duplicates_are_dropped() {
        let pos = pack_pos(0, 5);
        let once = spill(&[RawHit::new(Term::Id(1), 1, pos)], &HitlessMode::None);
        let twice = spill(
            &[
                RawHit::new(Term::Id(1), 1, pos),
                RawHit::new(Term::Id(1), 1, pos),
            ],
            &HitlessMode::None,
        );
        assert_eq!(once.0, twice.0);
    }

    #[test]
    fn test_field_end_twin_replaces_bare_hit() {
        let pos = pack_pos(0, 5);
        let flagged_only = spill(
            &[RawHit::new(Term::Id(1), 1, pos | FIELD_END)],
            &HitlessMode::None,
        );
        let both = spill(
            &[
                RawHit::new(Term::Id(1), 1, pos),
                RawHit::new(Term::Id(1), 1, pos | FIELD_END),
            ],
            &HitlessMode::None,
        );
        assert_eq!(flagged_only.0, both.0);
    }

    #[test]
    fn test_hitless_folds_to_count_and_mask() {
        let hits = vec![
            RawHit::new(Term::Id(1), 2, pack_pos(0, 1)),
            RawHit::new(Term::Id(1), 2, pack_pos(0, 7)),
            RawHit::new(Term::Id(1), 2, pack_pos(2, 3)),
        ];
        let (data, _) = spill(&hits, &HitlessMode::All);
        // word delta 1, doc delta 3, aggregate (3 << 1 | 1), mask 0b101,
        // then the three terminators
        assert_eq!(data, vec![1, 3, 7, 5, 0, 0, 0]);
    }
}
