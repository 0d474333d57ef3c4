//! Bounded k-way merge heap over spill buffers
//!
//! A fixed-capacity binary min-heap ordered by final posting order (term,
//! row id, field-stripped position). Capacity equals the number of raw
//! blocks, so the replay's memory stays O(blocks) regardless of how many
//! postings flow through it.

use std::cmp::Ordering;

use crate::index::hit::AggregateHit;

pub struct HeapEntry {
    pub hit: AggregateHit,
    /// Index of the spill buffer that produced this hit; the drive loop
    /// pulls the replacement from the same buffer after a pop.
    pub bin: usize,
}

pub struct MergeHeap {
    entries: Vec<HeapEntry>,
}

impl MergeHeap {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(&mut self, hit: AggregateHit, bin: usize) {
        debug_assert!(
            self.entries.len() < self.entries.capacity(),
            "merge heap capacity is fixed at the block count"
        );
        self.entries.push(HeapEntry { hit, bin });
        self.sift_up(self.entries.len() - 1);
    }

    /// Remove and return the smallest entry; the last element moves to the
    /// root and sifts back down.
    pub fn pop(&mut self) -> Option<HeapEntry> {
        if self.entries.is_empty() {
            return None;
        }
        let top = self.entries.swap_remove(0);
        if !self.entries.is_empty() {
            self.sift_down(0);
        }
        Some(top)
    }

    fn less(&self, a: usize, b: usize) -> bool {
        AggregateHit::order_cmp(&self.entries[a].hit, &self.entries[b].hit) == Ordering::Less
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if !self.less(idx, parent) {
                break;
            }
            self.entries.swap(idx, parent);
            idx = parent;
        }
    }

    fn sift_down(&mut self, mut idx: usize) {
        let len = self.entries.len();
        loop {
            let left = 2 * idx + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let mut smallest = left;
            if right < len && self.less(right, left) {
                smallest = right;
            }
            if !self.less(smallest, idx) {
                break;
            }
            self.entries.swap(idx, smallest);
            idx = smallest;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::hit::{pack_pos, Term, FIELD_END};

    fn hit(word: u64, row: u32, pos: u32) -> AggregateHit {
        AggregateHit::position(Term::Id(word), row, pos)
    }

    #[test]
    fn test_pops_in_posting_order() {
        let mut heap = MergeHeap::with_capacity(4);
        heap.push(hit(2, 0, pack_pos(0, 1)), 0);
        heap.push(hit(1, 9, pack_pos(0, 1)), 1);
        heap.push(hit(1, 2, pack_pos(0, 5)), 2);
        heap.push(hit(1, 2, pack_pos(0, 3)), 3);

        let order: Vec<(u64, u32, u32)> = std::iter::from_fn(|| heap.pop())
            .map(|e| match e.hit.term {
                Term::Id(id) => (id, e.hit.row_id, e.hit.word_pos),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(
            order,
            vec![
                (1, 2, pack_pos(0, 3)),
                (1, 2, pack_pos(0, 5)),
                (1, 9, pack_pos(0, 1)),
                (2, 0, pack_pos(0, 1)),
            ]
        );
    }

    #[test]
    fn test_field_end_flag_does_not_affect_order() {
        let mut heap = MergeHeap::with_capacity(2);
        heap.push(hit(1, 0, pack_pos(0, 7) | FIELD_END), 0);
        heap.push(hit(1, 0, pack_pos(0, 2)), 1);

        assert_eq!(heap.pop().unwrap().hit.word_pos, pack_pos(0, 2));
        assert_eq!(heap.pop().unwrap().hit.word_pos, pack_pos(0, 7) | FIELD_END);
    }

    #[test]
    fn test_refill_cycle_keeps_capacity() {
        let mut heap = MergeHeap::with_capacity(2);
        heap.push(hit(1, 0, pack_pos(0, 1)), 0);
        heap.push(hit(1, 1, pack_pos(0, 1)), 1);

        let first = heap.pop().unwrap();
        assert_eq!(first.bin, 0);
        heap.push(hit(5, 3, pack_pos(0, 1)), first.bin);
        assert_eq!(heap.len(), 2);

        assert_eq!(heap.pop().unwrap().bin, 1);
        assert_eq!(heap.pop().unwrap().bin, 0);
        assert!(heap.pop().is_none());
    }

    #[test]
    fn test_keyword_terms_order_lexicographically() {
        let mut heap = MergeHeap::with_capacity(3);
        heap.push(
            AggregateHit::position(Term::keyword("pear"), 0, pack_pos(0, 1)),
            0,
        );
        heap.push(
            AggregateHit::position(Term::keyword("apple"), 5, pack_pos(0, 1)),
            1,
        );
        heap.push(
            AggregateHit::position(Term::keyword("apple"), 1, pack_pos(0, 1)),
            2,
        );

        assert_eq!(heap.pop().unwrap().hit.row_id, 1);
        assert_eq!(heap.pop().unwrap().hit.row_id, 5);
        assert_eq!(heap.pop().unwrap().hit.term, Term::keyword("pear"));
    }
}
