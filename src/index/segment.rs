//! Segment file set: four streams plus a bincode header
//!
//! A finalized segment is `doclist.bin`, `hitlist.bin`, `skiplist.bin`,
//! and `dictionary.bin` — each starting with one dummy byte so offset 0
//! never collides with a valid reference — plus `segment.meta`, a
//! serialized [`SegmentHeader`] carrying the encoder counters, the format
//! knobs baked into the streams, and a CRC32 over all four stream files.
//! Segments are immutable once sealed; opening verifies the checksum and
//! loads the streams into memory.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{DictKind, HitFormat};
use crate::error::{Error, Result};
use crate::index::dictionary::{DictCursor, DictFooter, DictWriter, Dictionary, WordMeta};
use crate::index::encoder::SegmentCounters;
use crate::index::hit::Term;
use crate::index::reader::PostingsReader;
use crate::index::skiplist::SkipCache;
use crate::index::stream::StreamWriter;

pub const DOCLIST_FILE: &str = "doclist.bin";
pub const HITLIST_FILE: &str = "hitlist.bin";
pub const SKIPLIST_FILE: &str = "skiplist.bin";
pub const DICTIONARY_FILE: &str = "dictionary.bin";
pub const META_FILE: &str = "segment.meta";

/// Header fields persisted in `segment.meta`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SegmentHeader {
    pub segment_id: u64,
    pub dict_kind: DictKind,
    pub hit_format: HitFormat,
    pub skiplist_block_size: u32,
    pub word_count: u64,
    pub doc_entry_count: u64,
    pub hit_count: u64,
    pub checkpoint_offset: u64,
    pub checkpoint_count: u32,
    pub checksum: u64,
}

/// The write half of a segment: one open writer per stream.
pub struct SegmentStreams {
    pub doclist: StreamWriter,
    pub hitlist: StreamWriter,
    pub skiplist: StreamWriter,
    pub dict: DictWriter,
}

impl SegmentStreams {
    pub fn create(dir: &Path, dict_kind: DictKind) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let mut hitlist = StreamWriter::create(&dir.join(HITLIST_FILE))?;
        hitlist.write_byte(0)?;
        Self::with_hitlist(dir, dict_kind, hitlist)
    }

    /// Variant for the in-place spill strategy: the caller hands over a
    /// hitlist writer positioned past the dummy byte of the shared file.
    pub fn with_hitlist(dir: &Path, dict_kind: DictKind, hitlist: StreamWriter) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let mut doclist = StreamWriter::create(&dir.join(DOCLIST_FILE))?;
        doclist.write_byte(0)?;
        let mut skiplist = StreamWriter::create(&dir.join(SKIPLIST_FILE))?;
        skiplist.write_byte(0)?;
        let mut dict_out = StreamWriter::create(&dir.join(DICTIONARY_FILE))?;
        dict_out.write_byte(0)?;

        Ok(Self {
            doclist,
            hitlist,
            skiplist,
            dict: DictWriter::new(dict_out, dict_kind),
        })
    }

    /// Flush and close all streams, returning the dictionary footer.
    pub fn close(self) -> Result<DictFooter> {
        self.doclist.finish()?;
        self.hitlist.finish()?;
        self.skiplist.finish()?;
        self.dict.finish()
    }
}

fn stream_checksum(dir: &Path) -> Result<u64> {
    let mut hasher = crc32fast::Hasher::new();
    for name in [DOCLIST_FILE, HITLIST_FILE, SKIPLIST_FILE, DICTIONARY_FILE] {
        hasher.update(&fs::read(dir.join(name))?);
    }
    Ok(hasher.finalize() as u64)
}

/// Checksum the finished streams and persist the header. This is the last
/// step of a build or merge; nothing earlier touches `segment.meta`, so an
/// aborted operation never leaves a segment that opens.
pub fn seal_segment(
    dir: &Path,
    segment_id: u64,
    dict_kind: DictKind,
    hit_format: HitFormat,
    skiplist_block_size: u32,
    counters: SegmentCounters,
    footer: DictFooter,
) -> Result<SegmentHeader> {
    let header = SegmentHeader {
        segment_id,
        dict_kind,
        hit_format,
        skiplist_block_size,
        word_count: counters.word_count,
        doc_entry_count: counters.doc_entry_count,
        hit_count: counters.hit_count,
        checkpoint_offset: footer.checkpoint_offset,
        checkpoint_count: footer.checkpoint_count,
        checksum: stream_checksum(dir)?,
    };
    fs::write(dir.join(META_FILE), bincode::serialize(&header)?)?;
    tracing::debug!(
        segment_id,
        words = header.word_count,
        docs = header.doc_entry_count,
        hits = header.hit_count,
        "sealed segment"
    );
    Ok(header)
}

/// One immutable, finalized segment with its streams loaded.
#[derive(Debug)]
pub struct Segment {
    header: SegmentHeader,
    doclist: Arc<Vec<u8>>,
    hitlist: Arc<Vec<u8>>,
    skiplist: Arc<Vec<u8>>,
    dictionary: Dictionary,
}

impl Segment {
    pub fn open(dir: &Path) -> Result<Self> {
        let header: SegmentHeader = bincode::deserialize(&fs::read(dir.join(META_FILE))?)?;

        let doclist = Arc::new(fs::read(dir.join(DOCLIST_FILE))?);
        let hitlist = Arc::new(fs::read(dir.join(HITLIST_FILE))?);
        let skiplist = Arc::new(fs::read(dir.join(SKIPLIST_FILE))?);
        let dict_data = Arc::new(fs::read(dir.join(DICTIONARY_FILE))?);

        let actual = stream_checksum(dir)?;
        if actual != header.checksum {
            return Err(Error::corrupt(format!(
                "segment {} checksum mismatch: header {:x}, streams {:x}",
                header.segment_id, header.checksum, actual
            )));
        }

        let dictionary = Dictionary::open(
            dict_data,
            header.dict_kind,
            DictFooter {
                entry_count: header.word_count,
                checkpoint_offset: header.checkpoint_offset,
                checkpoint_count: header.checkpoint_count,
            },
        )?;

        Ok(Self {
            header,
            doclist,
            hitlist,
            skiplist,
            dictionary,
        })
    }

    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    pub fn id(&self) -> u64 {
        self.header.segment_id
    }

    pub fn dictionary(&self) -> &Dictionary {
        &self.dictionary
    }

    /// Lock-step dictionary cursor, in term order.
    pub fn dict_cursor(&self) -> DictCursor<'_> {
        self.dictionary.cursor()
    }

    /// Open a postings reader for a term, if present.
    pub fn postings(
        &self,
        term: &Term,
        cache: Option<&Arc<SkipCache>>,
    ) -> Result<Option<PostingsReader>> {
        match self.dictionary.lookup(term)? {
            None => Ok(None),
            Some(meta) => Ok(Some(self.postings_for(term, meta, cache))),
        }
    }

    /// Open a postings reader from an already-resolved dictionary entry
    /// (the merge walk has these in hand).
    pub fn postings_for(
        &self,
        term: &Term,
        meta: WordMeta,
        cache: Option<&Arc<SkipCache>>,
    ) -> PostingsReader {
        PostingsReader::new(
            self.doclist.clone(),
            self.hitlist.clone(),
            self.skiplist.clone(),
            meta,
            self.header.skiplist_block_size,
            self.header.hit_format,
            (self.header.segment_id, term.cache_hash()),
            cache.cloned(),
        )
    }
}
