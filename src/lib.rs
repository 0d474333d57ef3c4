pub mod config;
pub mod error;
pub mod index;

pub use config::{DictKind, HitFormat, HitlessMode, IndexConfig};
pub use error::{Error, Result};
pub use index::{
    AggregateHit, IndexBuilder, PostingsReader, RawHit, RowId, Segment, SegmentHeader,
    SegmentMerger, SkipCache, StopFlag, Term,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
