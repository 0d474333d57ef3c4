//! Query- and merge-time postings decoder
//!
//! One reader decodes one word's postings, driven externally by query
//! execution or the segment merger. Document stepping is linear over the
//! doclist; `hint_rowid` consults the word's skip entries to jump the
//! cursor forward, and `advance_to` combines the two. Hit emission mirrors
//! exactly what the encoder chose to inline.

use std::sync::Arc;

use crate::config::HitFormat;
use crate::error::Result;
use crate::index::dictionary::WordMeta;
use crate::index::hit::{field_mask_bit, field_of, RowId};
use crate::index::skiplist::{decode_skiplist, SkipCache, SkipData};
use crate::index::stream::ByteCursor;

/// One decoded doclist entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DocMatch {
    pub row_id: RowId,
    pub field_mask: u32,
    /// Hit count; for hitless words this is the stored aggregate count.
    pub hit_count: u32,
    /// The packed position when the encoder inlined this document's
    /// single hit into the doclist.
    pub inlined_pos: Option<u32>,
    /// Absolute hitlist offset of this document's positions. `None` for
    /// hitless words and inlined documents.
    pub hits_offset: Option<u64>,
}

#[derive(Clone, Copy, Debug)]
enum HitState {
    /// No current document, or its hits are exhausted.
    Idle,
    /// The single inlined hit has not been emitted yet.
    Inlined(u32),
    /// Decoding from the hitlist; `primed` once the cursor points at the
    /// current document's first position.
    Hitlist { primed: bool },
    Done,
}

pub struct PostingsReader {
    doclist: ByteCursor,
    hitlist: ByteCursor,
    skiplist_data: Arc<Vec<u8>>,
    meta: WordMeta,
    block_size: u32,
    hit_format: HitFormat,
    cache_key: (u64, u64),
    cache: Option<Arc<SkipCache>>,
    skip: Option<Arc<SkipData>>,

    last_row_plus1: u32,
    last_hitlist_pos: u64,
    cur: Option<DocMatch>,
    eof: bool,
    hit_state: HitState,
    last_word_pos: u32,
}

impl PostingsReader {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        doclist: Arc<Vec<u8>>,
        hitlist: Arc<Vec<u8>>,
        skiplist: Arc<Vec<u8>>,
        meta: WordMeta,
        block_size: u32,
        hit_format: HitFormat,
        cache_key: (u64, u64),
        cache: Option<Arc<SkipCache>>,
    ) -> Self {
        let doclist = ByteCursor::at(doclist, meta.doclist_offset);
        Self {
            doclist,
            hitlist: ByteCursor::new(hitlist),
            skiplist_data: skiplist,
            meta,
            block_size,
            hit_format,
            cache_key,
            cache,
            skip: None,
            last_row_plus1: 0,
            last_hitlist_pos: 0,
            cur: None,
            eof: false,
            hit_state: HitState::Idle,
            last_word_pos: 0,
        }
    }

    pub fn meta(&self) -> &WordMeta {
        &self.meta
    }

    pub fn doc_count(&self) -> u32 {
        self.meta.doc_count
    }

    pub fn is_hitless(&self) -> bool {
        self.meta.hitless
    }

    /// The last decoded document, if any.
    pub fn current(&self) -> Option<&DocMatch> {
        self.cur.as_ref()
    }

    /// Decode the next document, or `None` past the word's terminator.
    pub fn get_next_doc(&mut self) -> Result<Option<&DocMatch>> {
        self.step_doc()?;
        Ok(self.cur.as_ref())
    }

    fn step_doc(&mut self) -> Result<()> {
        self.cur = None;
        self.hit_state = HitState::Idle;
        if self.eof {
            return Ok(());
        }

        let delta = self.doclist.read_vlb_u32()?;
        if delta == 0 {
            self.eof = true;
            return Ok(());
        }
        self.last_row_plus1 += delta;
        let row_id = self.last_row_plus1 - 1;

        let hit_count = self.doclist.read_vlb_u32()?;
        let m = if self.meta.hitless {
            let field_mask = self.doclist.read_vlb_u32()?;
            DocMatch {
                row_id,
                field_mask,
                hit_count,
                inlined_pos: None,
                hits_offset: None,
            }
        } else if hit_count == 1 && self.hit_format == HitFormat::Inline {
            let pos = self.doclist.read_vlb_u32()?;
            DocMatch {
                row_id,
                field_mask: field_mask_bit(field_of(pos)),
                hit_count,
                inlined_pos: Some(pos),
                hits_offset: None,
            }
        } else {
            let field_mask = self.doclist.read_vlb_u32()?;
            let offset_delta = self.doclist.read_vlb()?;
            let offset = self.last_hitlist_pos + offset_delta;
            self.last_hitlist_pos = offset;
            DocMatch {
                row_id,
                field_mask,
                hit_count,
                inlined_pos: None,
                hits_offset: Some(offset),
            }
        };

        self.hit_state = match (m.inlined_pos, m.hits_offset) {
            (Some(pos), _) => HitState::Inlined(pos),
            (None, Some(_)) => HitState::Hitlist { primed: false },
            (None, None) => HitState::Done,
        };
        self.cur = Some(m);
        Ok(())
    }

    /// Jump the doclist cursor to the deepest skip block not past
    /// `target`, if that block is strictly ahead of the current position.
    /// Never seeks backward: a later hint may resolve to the same block a
    /// previous one already landed in. Returns whether a seek occurred.
    pub fn hint_rowid(&mut self, target: RowId) -> Result<bool> {
        let offset = match self.meta.skiplist_offset {
            Some(offset) => offset,
            None => return Ok(false),
        };
        let skip = self.ensure_skip(offset)?;
        let entry = skip.entries[skip.find_block(target)];

        if entry.doclist_offset > self.doclist.offset() {
            self.doclist.seek(entry.doclist_offset);
            self.last_row_plus1 = entry.base_row_id_plus1;
            self.last_hitlist_pos = entry.base_hitlist_pos;
            self.cur = None;
            self.hit_state = HitState::Idle;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// First document with `row_id >= target`, skip-accelerated. No-op if
    /// the current document already qualifies.
    pub fn advance_to(&mut self, target: RowId) -> Result<Option<RowId>> {
        if let Some(c) = &self.cur {
            if c.row_id >= target {
                return Ok(Some(c.row_id));
            }
        }
        self.hint_rowid(target)?;
        loop {
            self.step_doc()?;
            match &self.cur {
                None => return Ok(None),
                Some(c) if c.row_id >= target => return Ok(Some(c.row_id)),
                Some(_) => {}
            }
        }
    }

    /// Next hit of the current document: the inlined position, the next
    /// hitlist position, or `None` as the end-of-document marker.
    pub fn get_next_hit(&mut self) -> Result<Option<u32>> {
        match self.hit_state {
            HitState::Idle | HitState::Done => Ok(None),
            HitState::Inlined(pos) => {
                self.hit_state = HitState::Done;
                Ok(Some(pos))
            }
            HitState::Hitlist { primed } => {
                if !primed {
                    let offset = self.cur.as_ref().and_then(|m| m.hits_offset);
                    match offset {
                        Some(offset) => self.seek_hitlist(offset),
                        None => {
                            self.hit_state = HitState::Done;
                            return Ok(None);
                        }
                    }
                }
                let delta = self.hitlist.read_vlb_u32()?;
                if delta == 0 {
                    self.hit_state = HitState::Done;
                    return Ok(None);
                }
                self.last_word_pos += delta;
                Ok(Some(self.last_word_pos))
            }
        }
    }

    /// Position the hitlist cursor at an absolute offset.
    pub fn seek_hitlist(&mut self, offset: u64) {
        self.hitlist.seek(offset);
        self.last_word_pos = 0;
        self.hit_state = HitState::Hitlist { primed: true };
    }

    /// Rewind to the word's start for re-iteration.
    pub fn reset(&mut self) {
        self.doclist.seek(self.meta.doclist_offset);
        self.last_row_plus1 = 0;
        self.last_hitlist_pos = 0;
        self.cur = None;
        self.eof = false;
        self.hit_state = HitState::Idle;
        self.last_word_pos = 0;
    }

    fn ensure_skip(&mut self, offset: u64) -> Result<Arc<SkipData>> {
        if let Some(skip) = &self.skip {
            return Ok(skip.clone());
        }
        if let Some(cache) = &self.cache {
            if let Some(found) = cache.find(self.cache_key.0, self.cache_key.1) {
                self.skip = Some(found.clone());
                return Ok(found);
            }
        }

        let count = self.meta.doc_count.div_ceil(self.block_size) as usize;
        let mut cursor = ByteCursor::at(self.skiplist_data.clone(), offset);
        let entries = decode_skiplist(&mut cursor, count, self.block_size, self.meta.doclist_offset)?;
        let data = Arc::new(SkipData { entries });
        if let Some(cache) = &self.cache {
            cache.insert(self.cache_key.0, self.cache_key.1, data.clone());
        }
        self.skip = Some(data.clone());
        Ok(data)
    }
}
