//! Hit and term types shared by the build pipeline, encoder, and readers
//!
//! A hit position is packed into a u32: bits 0..=22 hold the 1-based
//! in-field position, bit 23 marks the last hit in its field, bits 24..=31
//! hold the field id. Packed values are strictly increasing within a
//! document (the field id dominates the flag bit), so delta coding over the
//! full packed value stays positive.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// Dense, zero-based, per-segment document ordinal
pub type RowId = u32;

/// Marker for rows removed during a merge
pub const INVALID_ROWID: RowId = u32::MAX;

/// Flag bit marking the last hit in its field
pub const FIELD_END: u32 = 1 << 23;

/// Mask for the in-field position bits
pub const POS_MASK: u32 = FIELD_END - 1;

const FIELD_SHIFT: u32 = 24;

/// Pack a field id and 1-based in-field position.
pub fn pack_pos(field: u8, pos: u32) -> u32 {
    debug_assert!(pos > 0 && pos <= POS_MASK);
    ((field as u32) << FIELD_SHIFT) | pos
}

/// Strip the field-end flag, keeping field id and position.
pub fn pure_pos(wordpos: u32) -> u32 {
    wordpos & !FIELD_END
}

pub fn field_of(wordpos: u32) -> u8 {
    (wordpos >> FIELD_SHIFT) as u8
}

pub fn is_field_end(wordpos: u32) -> bool {
    wordpos & FIELD_END != 0
}

/// Bit for a field in a 32-bit field mask (fields past 31 saturate into
/// the top bit).
pub fn field_mask_bit(field: u8) -> u32 {
    1 << (field as u32).min(31)
}

/// Dictionary key for one word: a hashed 64-bit id (CRC dictionaries) or
/// the literal keyword bytes (keyword dictionaries). A segment uses
/// exactly one kind; id 0 and the empty keyword are reserved as stream
/// sentinels.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Term {
    Id(u64),
    Keyword(Vec<u8>),
}

impl Term {
    pub fn keyword(s: &str) -> Self {
        Term::Keyword(s.as_bytes().to_vec())
    }

    pub fn is_sentinel(&self) -> bool {
        match self {
            Term::Id(id) => *id == 0,
            Term::Keyword(bytes) => bytes.is_empty(),
        }
    }

    /// Stable 64-bit hash for cache keys.
    pub fn cache_hash(&self) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

/// A single term occurrence as produced by tokenization. Transient; never
/// persisted in this form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawHit {
    pub term: Term,
    pub row_id: RowId,
    pub word_pos: u32,
}

impl RawHit {
    pub fn new(term: Term, row_id: RowId, word_pos: u32) -> Self {
        Self {
            term,
            row_id,
            word_pos,
        }
    }

    /// Build-pipeline sort order: term, then row, then field-stripped
    /// position, then the full packed value (so a bare hit sorts before
    /// its field-end twin and the two collapse adjacently).
    pub fn sort_cmp(a: &RawHit, b: &RawHit) -> Ordering {
        a.term
            .cmp(&b.term)
            .then(a.row_id.cmp(&b.row_id))
            .then(pure_pos(a.word_pos).cmp(&pure_pos(b.word_pos)))
            .then(a.word_pos.cmp(&b.word_pos))
    }
}

/// The in-flight decode/encode unit of the build pipeline.
///
/// `field_mask == 0`: `word_pos` is a packed position. `field_mask != 0`:
/// this is a hitless aggregate and `word_pos` carries the hit count.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AggregateHit {
    pub term: Term,
    pub row_id: RowId,
    pub word_pos: u32,
    pub field_mask: u32,
}

impl AggregateHit {
    pub fn position(term: Term, row_id: RowId, word_pos: u32) -> Self {
        Self {
            term,
            row_id,
            word_pos,
            field_mask: 0,
        }
    }

    pub fn aggregate(term: Term, row_id: RowId, count: u32, field_mask: u32) -> Self {
        debug_assert!(field_mask != 0);
        Self {
            term,
            row_id,
            word_pos: count,
            field_mask,
        }
    }

    pub fn is_aggregate(&self) -> bool {
        self.field_mask != 0
    }

    /// Global posting order: term, row, field-stripped position.
    pub fn order_cmp(a: &AggregateHit, b: &AggregateHit) -> Ordering {
        a.term
            .cmp(&b.term)
            .then(a.row_id.cmp(&b.row_id))
            .then(pure_pos(a.word_pos).cmp(&pure_pos(b.word_pos)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_packing() {
        let pos = pack_pos(3, 17);
        assert_eq!(field_of(pos), 3);
        assert_eq!(pos & POS_MASK, 17);
        assert!(!is_field_end(pos));

        let end = pos | FIELD_END;
        assert!(is_field_end(end));
        assert_eq!(pure_pos(end), pos);
        assert_eq!(field_of(end), 3);
    }

    #[test]
    fn test_packed_values_increase_across_fields() {
        // Last hit of field 0 (with the flag) still sorts below the first
        // hit of field 1.
        let last_in_field0 = pack_pos(0, 100) | FIELD_END;
        let first_in_field1 = pack_pos(1, 1);
        assert!(last_in_field0 < first_in_field1);
    }

    #[test]
    fn test_field_mask_saturation() {
        assert_eq!(field_mask_bit(0), 1);
        assert_eq!(field_mask_bit(31), 1 << 31);
        assert_eq!(field_mask_bit(200), 1 << 31);
    }

    #[test]
    fn test_term_ordering_and_sentinels() {
        assert!(Term::Id(1) < Term::Id(2));
        assert!(Term::keyword("apple") < Term::keyword("banana"));
        assert!(Term::Id(0).is_sentinel());
        assert!(Term::Keyword(Vec::new()).is_sentinel());
        assert!(!Term::Id(1).is_sentinel());
    }

    #[test]
    fn test_sort_order_places_bare_hit_before_field_end_twin() {
        let bare = RawHit::new(Term::Id(1), 5, pack_pos(0, 9));
        let flagged = RawHit::new(Term::Id(1), 5, pack_pos(0, 9) | FIELD_END);
        assert_eq!(RawHit::sort_cmp(&bare, &flagged), Ordering::Less);
    }

    #[test]
    fn test_cache_hash_is_stable() {
        let a = Term::keyword("cat");
        let b = Term::keyword("cat");
        assert_eq!(a.cache_hash(), b.cache_hash());
        assert_ne!(a.cache_hash(), Term::keyword("dog").cache_hash());
    }
}
