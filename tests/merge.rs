use std::path::Path;

use roaring::{RoaringBitmap, RoaringTreemap};
use tempfile::TempDir;

use cuttlefish::index::{pack_pos, MergeSide, RowFilter};
use cuttlefish::{
    Error, HitlessMode, IndexBuilder, IndexConfig, RawHit, Segment, SegmentMerger, StopFlag, Term,
};

fn build_segment(dir: &Path, cfg: IndexConfig, segment_id: u64, hits: Vec<RawHit>) -> Segment {
    let mut builder = IndexBuilder::create(dir, cfg, segment_id).unwrap();
    builder.push_hits(hits).unwrap();
    builder.finish().unwrap();
    Segment::open(dir).unwrap()
}

/// Decoded postings of one word: (row, hit count, positions).
fn decode_word(segment: &Segment, term: &Term) -> Vec<(u32, u32, Vec<u32>)> {
    let mut reader = match segment.postings(term, None).unwrap() {
        Some(reader) => reader,
        None => return Vec::new(),
    };
    let mut out = Vec::new();
    loop {
        let m = match reader.get_next_doc().unwrap() {
            Some(m) => *m,
            None => break,
        };
        let mut positions = Vec::new();
        while let Some(pos) = reader.get_next_hit().unwrap() {
            positions.push(pos);
        }
        out.push((m.row_id, m.hit_count, positions));
    }
    out
}

struct Fixtures {
    doc_ids: Vec<u64>,
    dead: RoaringBitmap,
    kills: RoaringTreemap,
}

impl Fixtures {
    fn new(doc_ids: Vec<u64>) -> Self {
        Self {
            doc_ids,
            dead: RoaringBitmap::new(),
            kills: RoaringTreemap::new(),
        }
    }

    fn side<'a>(&'a self, segment: &'a Segment, filter: Option<&'a dyn RowFilter>) -> MergeSide<'a> {
        MergeSide {
            segment,
            doc_ids: &self.doc_ids,
            dead_rows: &self.dead,
            kill_list: &self.kills,
            filter,
        }
    }
}

#[test]
fn merge_preserves_and_remaps_postings() {
    let tmp_a = TempDir::new().unwrap();
    let seg_a = build_segment(
        tmp_a.path(),
        IndexConfig::default(),
        1,
        vec![
            RawHit::new(Term::Id(1), 0, pack_pos(0, 2)),
            RawHit::new(Term::Id(1), 2, pack_pos(0, 5)),
            RawHit::new(Term::Id(2), 1, pack_pos(0, 3)),
            RawHit::new(Term::Id(2), 1, pack_pos(0, 8)),
        ],
    );
    let tmp_b = TempDir::new().unwrap();
    let seg_b = build_segment(
        tmp_b.path(),
        IndexConfig::default(),
        2,
        vec![
            RawHit::new(Term::Id(2), 0, pack_pos(1, 4)),
            RawHit::new(Term::Id(3), 1, pack_pos(0, 1)),
        ],
    );

    let fix_a = Fixtures::new(vec![100, 101, 102]);
    let fix_b = Fixtures::new(vec![200, 201]);

    let tmp_out = TempDir::new().unwrap();
    let merger = SegmentMerger::new(
        fix_a.side(&seg_a, None),
        fix_b.side(&seg_b, None),
        tmp_out.path(),
        StopFlag::new(),
    );
    let header = merger.merge(3).unwrap();
    assert_eq!(header.word_count, 3);

    let merged = Segment::open(tmp_out.path()).unwrap();
    // dst rows keep 0..3, src rows shift to 3..5
    assert_eq!(
        decode_word(&merged, &Term::Id(1)),
        vec![(0, 1, vec![pack_pos(0, 2)]), (2, 1, vec![pack_pos(0, 5)])]
    );
    assert_eq!(
        decode_word(&merged, &Term::Id(2)),
        vec![
            (1, 2, vec![pack_pos(0, 3), pack_pos(0, 8)]),
            (3, 1, vec![pack_pos(1, 4)]),
        ]
    );
    assert_eq!(
        decode_word(&merged, &Term::Id(3)),
        vec![(4, 1, vec![pack_pos(0, 1)])]
    );
}

#[test]
fn kill_lists_remove_opposite_side_documents() {
    let tmp_a = TempDir::new().unwrap();
    let seg_a = build_segment(
        tmp_a.path(),
        IndexConfig::default(),
        1,
        vec![
            RawHit::new(Term::Id(1), 0, pack_pos(0, 1)),
            RawHit::new(Term::Id(1), 1, pack_pos(0, 2)),
            RawHit::new(Term::Id(1), 2, pack_pos(0, 3)),
        ],
    );
    let tmp_b = TempDir::new().unwrap();
    let seg_b = build_segment(
        tmp_b.path(),
        IndexConfig::default(),
        2,
        vec![
            RawHit::new(Term::Id(1), 0, pack_pos(0, 4)),
            RawHit::new(Term::Id(1), 1, pack_pos(0, 5)),
        ],
    );

    let fix_a = Fixtures::new(vec![100, 101, 102]);
    // src kills dst's doc 101; dst kills src's doc 200
    let mut fix_b = Fixtures::new(vec![200, 201]);
    fix_b.kills.insert(101);
    let mut fix_a = fix_a;
    fix_a.kills.insert(200);

    let tmp_out = TempDir::new().unwrap();
    let merger = SegmentMerger::new(
        fix_a.side(&seg_a, None),
        fix_b.side(&seg_b, None),
        tmp_out.path(),
        StopFlag::new(),
    );
    merger.merge(3).unwrap();

    let merged = Segment::open(tmp_out.path()).unwrap();
    // dst survivors: rows 0 and 2 -> 0, 1; src survivor: row 1 -> 2
    assert_eq!(
        decode_word(&merged, &Term::Id(1)),
        vec![
            (0, 1, vec![pack_pos(0, 1)]),
            (1, 1, vec![pack_pos(0, 3)]),
            (2, 1, vec![pack_pos(0, 5)]),
        ]
    );
}

#[test]
fn dead_rows_and_filters_drop_rows() {
    let tmp_a = TempDir::new().unwrap();
    let seg_a = build_segment(
        tmp_a.path(),
        IndexConfig::default(),
        1,
        (0..6u32)
            .map(|row| RawHit::new(Term::Id(9), row, pack_pos(0, row + 1)))
            .collect(),
    );
    let tmp_b = TempDir::new().unwrap();
    let seg_b = build_segment(tmp_b.path(), IndexConfig::default(), 2, Vec::new());

    let mut fix_a = Fixtures::new(vec![10, 11, 12, 13, 14, 15]);
    fix_a.dead.insert(0);
    let fix_b = Fixtures::new(Vec::new());
    let reject_row_3 = |row: u32| row != 3;

    let tmp_out = TempDir::new().unwrap();
    let merger = SegmentMerger::new(
        fix_a.side(&seg_a, Some(&reject_row_3)),
        fix_b.side(&seg_b, None),
        tmp_out.path(),
        StopFlag::new(),
    );
    merger.merge(3).unwrap();

    let merged = Segment::open(tmp_out.path()).unwrap();
    // rows 1, 2, 4, 5 survive as 0..4
    assert_eq!(
        decode_word(&merged, &Term::Id(9)),
        vec![
            (0, 1, vec![pack_pos(0, 2)]),
            (1, 1, vec![pack_pos(0, 3)]),
            (2, 1, vec![pack_pos(0, 5)]),
            (3, 1, vec![pack_pos(0, 6)]),
        ]
    );
}

#[test]
fn self_merge_with_filter_is_a_compaction() {
    let tmp = TempDir::new().unwrap();
    let mut hits = Vec::new();
    for row in 0..10u32 {
        hits.push(RawHit::new(Term::Id(1), row, pack_pos(0, 1)));
        hits.push(RawHit::new(Term::Id(1), row, pack_pos(0, 2)));
        if row % 2 == 0 {
            hits.push(RawHit::new(Term::Id(2), row, pack_pos(1, 4)));
        }
    }
    let segment = build_segment(tmp.path(), IndexConfig::default(), 1, hits);

    let mut fix = Fixtures::new((0..10).map(|i| 1000 + i as u64).collect());
    fix.kills.insert(1007); // kills row 7 through the opposite-side lookup
    let keep_under_6 = |row: u32| row < 6;

    let tmp_out = TempDir::new().unwrap();
    let merger = SegmentMerger::new(
        fix.side(&segment, Some(&keep_under_6)),
        fix.side(&segment, Some(&keep_under_6)),
        tmp_out.path(),
        StopFlag::new(),
    );
    let header = merger.merge(2).unwrap();

    // survivors: rows 0..6 (filter) minus row 7 (already out) -> 6 rows,
    // each word's counts restricted to those rows, emitted exactly once
    let merged = Segment::open(tmp_out.path()).unwrap();
    assert_eq!(header.word_count, 2);
    assert_eq!(
        decode_word(&merged, &Term::Id(1))
            .iter()
            .map(|(row, count, _)| (*row, *count))
            .collect::<Vec<_>>(),
        (0..6u32).map(|row| (row, 2)).collect::<Vec<_>>()
    );
    assert_eq!(
        decode_word(&merged, &Term::Id(2))
            .iter()
            .map(|(row, _, _)| *row)
            .collect::<Vec<_>>(),
        vec![0, 2, 4]
    );
}

#[test]
fn hitless_mismatch_degrades_merged_word_to_hitless() {
    let tmp_a = TempDir::new().unwrap();
    let seg_a = build_segment(
        tmp_a.path(),
        IndexConfig::default(),
        1,
        vec![
            RawHit::new(Term::Id(7), 0, pack_pos(0, 3)),
            RawHit::new(Term::Id(7), 0, pack_pos(0, 9)),
            RawHit::new(Term::Id(7), 1, pack_pos(1, 2)),
        ],
    );
    let tmp_b = TempDir::new().unwrap();
    let cfg_hitless = IndexConfig {
        hitless_mode: HitlessMode::All,
        ..IndexConfig::default()
    };
    let seg_b = build_segment(
        tmp_b.path(),
        cfg_hitless,
        2,
        vec![
            RawHit::new(Term::Id(7), 0, pack_pos(0, 5)),
            RawHit::new(Term::Id(7), 0, pack_pos(2, 1)),
        ],
    );

    let fix_a = Fixtures::new(vec![100, 101]);
    let fix_b = Fixtures::new(vec![200]);

    let tmp_out = TempDir::new().unwrap();
    let merger = SegmentMerger::new(
        fix_a.side(&seg_a, None),
        fix_b.side(&seg_b, None),
        tmp_out.path(),
        StopFlag::new(),
    );
    merger.merge(3).unwrap();

    let merged = Segment::open(tmp_out.path()).unwrap();
    let meta = merged.dictionary().lookup(&Term::Id(7)).unwrap().unwrap();
    assert!(meta.hitless);
    // positions dropped everywhere, counts kept
    assert_eq!(
        decode_word(&merged, &Term::Id(7)),
        vec![(0, 2, vec![]), (1, 1, vec![]), (2, 2, vec![])]
    );
}

#[test]
fn cancelled_merge_writes_no_segment() {
    let tmp_a = TempDir::new().unwrap();
    let seg_a = build_segment(
        tmp_a.path(),
        IndexConfig::default(),
        1,
        vec![RawHit::new(Term::Id(1), 0, pack_pos(0, 1))],
    );
    let tmp_b = TempDir::new().unwrap();
    let seg_b = build_segment(
        tmp_b.path(),
        IndexConfig::default(),
        2,
        vec![RawHit::new(Term::Id(2), 0, pack_pos(0, 1))],
    );

    let fix_a = Fixtures::new(vec![100]);
    let fix_b = Fixtures::new(vec![200]);

    let stop = StopFlag::new();
    stop.stop();

    let tmp_out = TempDir::new().unwrap();
    let merger = SegmentMerger::new(
        fix_a.side(&seg_a, None),
        fix_b.side(&seg_b, None),
        tmp_out.path(),
        stop,
    );
    let err = merger.merge(3).unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert!(!tmp_out.path().join("segment.meta").exists());
}

#[test]
fn merged_segment_can_be_merged_again() {
    let tmp_a = TempDir::new().unwrap();
    let seg_a = build_segment(
        tmp_a.path(),
        IndexConfig::default(),
        1,
        vec![RawHit::new(Term::Id(1), 0, pack_pos(0, 1))],
    );
    let tmp_b = TempDir::new().unwrap();
    let seg_b = build_segment(
        tmp_b.path(),
        IndexConfig::default(),
        2,
        vec![RawHit::new(Term::Id(1), 0, pack_pos(0, 7))],
    );

    let fix_a = Fixtures::new(vec![100]);
    let fix_b = Fixtures::new(vec![200]);
    let tmp_ab = TempDir::new().unwrap();
    SegmentMerger::new(
        fix_a.side(&seg_a, None),
        fix_b.side(&seg_b, None),
        tmp_ab.path(),
        StopFlag::new(),
    )
    .merge(3)
    .unwrap();
    let seg_ab = Segment::open(tmp_ab.path()).unwrap();

    let tmp_c = TempDir::new().unwrap();
    let seg_c = build_segment(
        tmp_c.path(),
        IndexConfig::default(),
        4,
        vec![RawHit::new(Term::Id(1), 0, pack_pos(0, 9))],
    );

    let fix_ab = Fixtures::new(vec![100, 200]);
    let fix_c = Fixtures::new(vec![300]);
    let tmp_abc = TempDir::new().unwrap();
    SegmentMerger::new(
        fix_ab.side(&seg_ab, None),
        fix_c.side(&seg_c, None),
        tmp_abc.path(),
        StopFlag::new(),
    )
    .merge(5)
    .unwrap();

    let merged = Segment::open(tmp_abc.path()).unwrap();
    assert_eq!(
        decode_word(&merged, &Term::Id(1)),
        vec![
            (0, 1, vec![pack_pos(0, 1)]),
            (1, 1, vec![pack_pos(0, 7)]),
            (2, 1, vec![pack_pos(0, 9)]),
        ]
    );
}
