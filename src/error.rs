//! Error types for the hybrid hash join.
//!
//! Three kinds of failure can surface from a join instance:
//!
//! - [`JoinError::InvalidArgument`]: a configuration invariant was violated
//!   at construction time. Not recoverable at this layer.
//! - [`JoinError::Io`]: a spill write failed, a record exceeded the segment
//!   size, or the driver was cancelled while waiting for a write-behind
//!   buffer. Surfaced as fatal so the enclosing runtime can restart the
//!   task.
//! - [`JoinError::Corrupt`] / [`JoinError::Internal`]: engine bugs, not
//!   environmental failures. Carried with diagnostic context.
//!
//! Inside the build loop the only expected negative signal is a full
//! buffer, which is communicated as `Option::None` rather than an error and
//! handled locally through the pool/spill cycle.

use std::io;

/// Result alias for join operations.
pub type Result<T> = std::result::Result<T, JoinError>;

/// Error surfaced by a hash join instance.
#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    /// A constructor argument violated the join's configuration invariants.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An I/O failure during spilling or write-behind buffer recycling.
    #[error("hash join i/o failure: {0}")]
    Io(#[from] io::Error),

    /// The in-memory hash structures are corrupt.
    #[error("hash table corrupt: {0}")]
    Corrupt(String),

    /// An internal invariant of the join engine was violated.
    #[error("hybrid hash join bug: {0}")]
    Internal(String),
}

impl JoinError {
    /// Shorthand for an invalid-argument error.
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Shorthand for a structural-bug error.
    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let e = JoinError::invalid("too few memory segments");
        assert_eq!(e.to_string(), "invalid argument: too few memory segments");

        let e = JoinError::internal("spill of a spilled partition");
        assert!(e.to_string().contains("bug"));
    }

    #[test]
    fn test_io_conversion() {
        let io_err = io::Error::new(io::ErrorKind::Interrupted, "interrupted");
        let e = JoinError::from(io_err);
        assert!(matches!(e, JoinError::Io(_)));
        assert!(e.to_string().contains("interrupted"));
    }
}
