use thiserror::Error;

/// Main error type for index build, merge, and read operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal-consistency failure in a segment or raw-hit stream.
    ///
    /// The on-disk format is closed and produced only by this crate, so a
    /// decode failure means a bug or bitrot, never a version mismatch.
    #[error("corrupt index data: {0}")]
    Corrupt(String),

    #[error("merge would assign {rows} row ids, exceeding the 32-bit row id space")]
    TooManyRows { rows: u64 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("metadata error: {0}")]
    Meta(#[from] bincode::Error),
}

/// Result type alias for index operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        Error::Corrupt(msg.into())
    }

    /// Check if this error aborts cleanly without partial output
    /// (the caller may retry with different inputs).
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::TooManyRows { .. } | Error::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::TooManyRows { rows: 5_000_000_000 };
        assert_eq!(
            err.to_string(),
            "merge would assign 5000000000 row ids, exceeding the 32-bit row id space"
        );
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(Error::TooManyRows { rows: 0 }.is_recoverable());
        assert!(Error::Cancelled.is_recoverable());
        assert!(!Error::corrupt("bad").is_recoverable());
    }
}
