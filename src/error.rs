//! Unified error handling for the trajectory search library.
//!
//! Recoverable data problems (out-of-bbox points, corrupt posting blocks,
//! ring ceilings) are logged and never surface here. This type carries the
//! failures a caller has to act on.

use std::path::PathBuf;
use thiserror::Error;

/// Unified error type for index and query operations.
#[derive(Error, Debug)]
pub enum SearchError {
    /// I/O failure while reading or writing index files
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A persisted index file exists but cannot be parsed
    #[error("Malformed index file {path} (line {line}): {message}")]
    MalformedIndex {
        path: PathBuf,
        line: usize,
        message: String,
    },

    /// Compressed posting data failed to decode
    #[error("Codec error: {0}")]
    Codec(#[from] crate::codec::CodecError),

    /// The query cannot be answered as given
    #[error("Invalid query: {message}")]
    InvalidQuery { message: String },

    /// Configuration values are out of range
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    /// Nothing to index
    #[error("Corpus has no trajectories with valid points")]
    EmptyCorpus,

    /// A backend required by the query has not been built or loaded
    #[error("Index '{index}' has not been built")]
    NotBuilt { index: String },

    /// Generic internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl SearchError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SearchError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn malformed(path: impl Into<PathBuf>, line: usize, message: impl Into<String>) -> Self {
        SearchError::MalformedIndex {
            path: path.into(),
            line,
            message: message.into(),
        }
    }

    pub(crate) fn invalid_query(message: impl Into<String>) -> Self {
        SearchError::InvalidQuery {
            message: message.into(),
        }
    }
}

/// Result type alias for search operations.
pub type Result<T> = std::result::Result<T, SearchError>;

/// Extension trait for converting Option to SearchError.
pub trait OptionExt<T> {
    /// Convert Option to Result with a not-built error for the named index.
    fn ok_or_not_built(self, index: &str) -> Result<T>;

    /// Convert Option to Result with generic internal error.
    fn ok_or_internal(self, message: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_not_built(self, index: &str) -> Result<T> {
        self.ok_or_else(|| SearchError::NotBuilt {
            index: index.to_string(),
        })
    }

    fn ok_or_internal(self, message: &str) -> Result<T> {
        self.ok_or_else(|| SearchError::Internal {
            message: message.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SearchError::malformed("/tmp/node.ids", 3, "expected integer");
        let text = err.to_string();
        assert!(text.contains("node.ids"));
        assert!(text.contains("line 3"));
    }

    #[test]
    fn test_option_ext() {
        let none: Option<i32> = None;
        let result = none.ok_or_not_built("edge");
        assert!(matches!(result, Err(SearchError::NotBuilt { ref index }) if index == "edge"));
    }
}
