//! Dictionary stream: one delta-coded entry per distinct word, ordered by
//! term, with a checkpoint every 1024 entries enabling binary-search entry
//! into the sorted word list
//!
//! Delta baselines (term id, doclist offset, skiplist offset) reset at
//! every checkpoint boundary so a lookup can start decoding at any
//! checkpoint without the preceding stream. The flat checkpoint table is
//! appended after the entry terminator; its offset and count live in the
//! segment header.

use std::sync::Arc;

use crate::config::DictKind;
use crate::error::{Error, Result};
use crate::index::hit::Term;
use crate::index::spill::MAX_KEYWORD_LEN;
use crate::index::stream::{ByteCursor, StreamWriter};

/// Dictionary entries between checkpoints.
pub const CHECKPOINT_EVERY: u64 = 1024;

const FLAG_HITLESS: u64 = 1;
const FLAG_HAS_SKIPLIST: u64 = 1 << 1;

/// Per-word metadata stored in the dictionary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WordMeta {
    pub doclist_offset: u64,
    pub doclist_length: u64,
    pub doc_count: u32,
    /// Explicit hitless flag; the doc count above is a plain count with no
    /// bits stolen from it.
    pub hitless: bool,
    pub hit_count: u64,
    /// Present iff the word's doc count exceeds the skip block size.
    pub skiplist_offset: Option<u64>,
}

/// Offsets of the checkpoint table, returned to the segment header.
#[derive(Clone, Copy, Debug)]
pub struct DictFooter {
    pub entry_count: u64,
    pub checkpoint_offset: u64,
    pub checkpoint_count: u32,
}

/// Streaming dictionary writer. Terms must be added in ascending order.
pub struct DictWriter {
    out: StreamWriter,
    kind: DictKind,
    entries: u64,
    last_id: u64,
    last_doclist_offset: u64,
    last_skiplist_offset: u64,
    #[cfg(debug_assertions)]
    last_term: Option<Term>,
    checkpoints: Vec<(Term, u64)>,
}

impl DictWriter {
    pub fn new(out: StreamWriter, kind: DictKind) -> Self {
        Self {
            out,
            kind,
            entries: 0,
            last_id: 0,
            last_doclist_offset: 0,
            last_skiplist_offset: 0,
            #[cfg(debug_assertions)]
            last_term: None,
            checkpoints: Vec::new(),
        }
    }

    pub fn add(&mut self, term: &Term, meta: &WordMeta) -> Result<()> {
        #[cfg(debug_assertions)]
        {
            debug_assert!(
                self.last_term.as_ref().map_or(true, |last| last < term),
                "dictionary terms must be added in ascending order"
            );
            self.last_term = Some(term.clone());
        }

        if self.entries % CHECKPOINT_EVERY == 0 {
            self.last_id = 0;
            self.last_doclist_offset = 0;
            self.last_skiplist_offset = 0;
            self.checkpoints.push((term.clone(), self.out.offset()));
        }

        match (self.kind, term) {
            (DictKind::Crc, Term::Id(id)) => {
                self.out.write_vlb(id - self.last_id)?;
                self.last_id = *id;
            }
            (DictKind::Keyword, Term::Keyword(bytes)) => {
                self.out.write_vlb(bytes.len() as u64)?;
                self.out.write_all(bytes)?;
            }
            _ => {
                return Err(Error::corrupt(
                    "term kind does not match the segment's dictionary kind",
                ))
            }
        }

        self.out
            .write_vlb(meta.doclist_offset - self.last_doclist_offset)?;
        self.last_doclist_offset = meta.doclist_offset;
        self.out.write_vlb(meta.doclist_length)?;
        self.out.write_vlb(meta.doc_count as u64)?;
        self.out.write_vlb(meta.hit_count)?;

        let mut flags = 0u64;
        if meta.hitless {
            flags |= FLAG_HITLESS;
        }
        if meta.skiplist_offset.is_some() {
            flags |= FLAG_HAS_SKIPLIST;
        }
        self.out.write_vlb(flags)?;
        if let Some(offset) = meta.skiplist_offset {
            self.out.write_vlb(offset - self.last_skiplist_offset)?;
            self.last_skiplist_offset = offset;
        }

        self.entries += 1;
        Ok(())
    }

    /// Terminate the entry stream, append the checkpoint table, and close
    /// the file.
    pub fn finish(mut self) -> Result<DictFooter> {
        self.out.write_vlb(0)?;
        let checkpoint_offset = self.out.offset();

        for (term, offset) in &self.checkpoints {
            match term {
                Term::Id(id) => self.out.write_vlb(*id)?,
                Term::Keyword(bytes) => {
                    self.out.write_vlb(bytes.len() as u64)?;
                    self.out.write_all(bytes)?;
                }
            }
            self.out.write_vlb(*offset)?;
        }

        let footer = DictFooter {
            entry_count: self.entries,
            checkpoint_offset,
            checkpoint_count: self.checkpoints.len() as u32,
        };
        self.out.finish()?;
        Ok(footer)
    }
}

/// Shared decode of one entry's fields past the term token.
struct EntryDecoder {
    last_id: u64,
    last_doclist_offset: u64,
    last_skiplist_offset: u64,
}

impl EntryDecoder {
    fn fresh() -> Self {
        Self {
            last_id: 0,
            last_doclist_offset: 0,
            last_skiplist_offset: 0,
        }
    }

    /// Decode the next entry, or `None` at the terminator.
    fn read(
        &mut self,
        cursor: &mut ByteCursor,
        kind: DictKind,
    ) -> Result<Option<(Term, WordMeta)>> {
        let token = cursor.read_vlb()?;
        if token == 0 {
            return Ok(None);
        }

        let term = match kind {
            DictKind::Crc => {
                self.last_id += token;
                Term::Id(self.last_id)
            }
            DictKind::Keyword => {
                if token > MAX_KEYWORD_LEN {
                    return Err(Error::corrupt(format!(
                        "keyword length {} out of range in dictionary",
                        token
                    )));
                }
                Term::Keyword(cursor.read_bytes(token as usize)?.to_vec())
            }
        };

        self.last_doclist_offset += cursor.read_vlb()?;
        let doclist_offset = self.last_doclist_offset;
        let doclist_length = cursor.read_vlb()?;
        let doc_count = cursor.read_vlb_u32()?;
        let hit_count = cursor.read_vlb()?;
        let flags = cursor.read_vlb()?;

        let skiplist_offset = if flags & FLAG_HAS_SKIPLIST != 0 {
            self.last_skiplist_offset += cursor.read_vlb()?;
            Some(self.last_skiplist_offset)
        } else {
            None
        };

        Ok(Some((
            term,
            WordMeta {
                doclist_offset,
                doclist_length,
                doc_count,
                hitless: flags & FLAG_HITLESS != 0,
                hit_count,
                skiplist_offset,
            },
        )))
    }
}

/// Loaded dictionary stream of one finished segment.
#[derive(Debug)]
pub struct Dictionary {
    data: Arc<Vec<u8>>,
    kind: DictKind,
    checkpoints: Vec<(Term, u64)>,
    entry_count: u64,
}

impl Dictionary {
    pub fn open(
        data: Arc<Vec<u8>>,
        kind: DictKind,
        footer: DictFooter,
    ) -> Result<Self> {
        let mut cursor = ByteCursor::at(data.clone(), footer.checkpoint_offset);
        let mut checkpoints = Vec::with_capacity(footer.checkpoint_count as usize);
        for _ in 0..footer.checkpoint_count {
            let term = match kind {
                DictKind::Crc => Term::Id(cursor.read_vlb()?),
                DictKind::Keyword => {
                    let len = cursor.read_vlb()?;
                    if len > MAX_KEYWORD_LEN {
                        return Err(Error::corrupt(
                            "keyword length out of range in checkpoint table",
                        ));
                    }
                    Term::Keyword(cursor.read_bytes(len as usize)?.to_vec())
                }
            };
            let offset = cursor.read_vlb()?;
            checkpoints.push((term, offset));
        }
        Ok(Self {
            data,
            kind,
            checkpoints,
            entry_count: footer.entry_count,
        })
    }

    pub fn kind(&self) -> DictKind {
        self.kind
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    pub fn checkpoints(&self) -> &[(Term, u64)] {
        &self.checkpoints
    }

    /// Sequential cursor over all entries in term order.
    pub fn cursor(&self) -> DictCursor<'_> {
        DictCursor {
            dict: self,
            cursor: ByteCursor::at(self.data.clone(), 1),
            decoder: EntryDecoder::fresh(),
            index: 0,
            done: self.entry_count == 0,
        }
    }

    /// Binary-search the checkpoint table, then scan at most one
    /// checkpoint span of entries.
    pub fn lookup(&self, term: &Term) -> Result<Option<WordMeta>> {
        let idx = self.checkpoints.partition_point(|(t, _)| t <= term);
        if idx == 0 {
            return Ok(None);
        }
        let (_, offset) = &self.checkpoints[idx - 1];

        let mut cursor = ByteCursor::at(self.data.clone(), *offset);
        let mut decoder = EntryDecoder::fresh();
        for _ in 0..CHECKPOINT_EVERY {
            match decoder.read(&mut cursor, self.kind)? {
                None => return Ok(None),
                Some((t, meta)) => {
                    if &t == term {
                        return Ok(Some(meta));
                    }
                    if &t > term {
                        return Ok(None);
                    }
                }
            }
        }
        Ok(None)
    }
}

/// Lock-step iteration cursor used by the merge walk.
pub struct DictCursor<'a> {
    dict: &'a Dictionary,
    cursor: ByteCursor,
    decoder: EntryDecoder,
    index: u64,
    done: bool,
}

impl<'a> DictCursor<'a> {
    pub fn next(&mut self) -> Result<Option<(Term, WordMeta)>> {
        if self.done {
            return Ok(None);
        }
        if self.index % CHECKPOINT_EVERY == 0 && self.index > 0 {
            self.decoder = EntryDecoder::fresh();
        }
        match self.decoder.read(&mut self.cursor, self.dict.kind)? {
            None => {
                self.done = true;
                Ok(None)
            }
            Some(entry) => {
                self.index += 1;
                Ok(Some(entry))
            }
        }
    }
}
