use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::index::Term;

/// On-disk layout for per-document hit data
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HitFormat {
    /// Documents with a single hit fold the packed position into the
    /// doclist entry itself, avoiding a hitlist seek at read time.
    Inline,
    /// Every document carries an offset and count into the hitlist.
    Plain,
}

/// Dictionary key kind baked into a segment
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DictKind {
    /// Words keyed by a hashed 64-bit word identifier.
    Crc,
    /// Words keyed by literal keyword bytes.
    Keyword,
}

/// Which words store aggregate hit counts instead of positions
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HitlessMode {
    /// All words keep full position data.
    None,
    /// Only the listed words are hitless.
    Words(HashSet<Term>),
    /// The whole segment is hitless.
    All,
}

impl HitlessMode {
    pub fn covers(&self, term: &Term) -> bool {
        match self {
            HitlessMode::None => false,
            HitlessMode::Words(set) => set.contains(term),
            HitlessMode::All => true,
        }
    }
}

/// Configuration for segment builds
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Documents per skip-list entry
    pub skiplist_block_size: u32,
    /// Doclist layout for single-hit documents
    pub hit_format: HitFormat,
    /// Hitless indexing mode
    pub hitless_mode: HitlessMode,
    /// Memory budget for the build pipeline (hit accumulator and spill
    /// buffers); undersized limits are clamped, not rejected
    pub memory_limit: usize,
    /// Reuse the hitlist file for raw-hit spill blocks instead of a
    /// separate temp file, relocating unread block tails as the final
    /// write cursor advances
    pub inplace_relocation: bool,
    /// Chunk size for in-place relocation copies
    pub relocation_buffer: usize,
    /// Dictionary key kind
    pub dict_kind: DictKind,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            skiplist_block_size: 32,
            hit_format: HitFormat::Inline,
            hitless_mode: HitlessMode::None,
            // 128MB
            memory_limit: 128 * 1024 * 1024,
            inplace_relocation: false,
            // 256KB
            relocation_buffer: 256 * 1024,
            dict_kind: DictKind::Crc,
        }
    }
}
