//! Error types for the perch engine.

use thiserror::Error;

/// All possible errors from the perch engine.
///
/// The cache itself has no failure paths for reads and merges; these errors
/// come from misuse of the copy workflow, malformed queries, and snapshots.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Misuse
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // Lookup
    #[error("record not found: {0}")]
    RecordNotFound(String),

    // State
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

impl Error {
    pub(crate) fn invalid_operation(message: impl Into<String>) -> Self {
        Error::InvalidOperation(message.into())
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Error::InvalidArgument(message.into())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::InvalidOperation("cannot clone a copy".into());
        assert_eq!(err.to_string(), "invalid operation: cannot clone a copy");

        let err = Error::InvalidArgument("count requires a query".into());
        assert_eq!(err.to_string(), "invalid argument: count requires a query");

        let err = Error::RecordNotFound("permanent:42".into());
        assert_eq!(err.to_string(), "record not found: permanent:42");
    }
}
