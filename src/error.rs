//! Status taxonomy for the engine.
//!
//! Error plumbing is nominally an external concern, but the core must surface
//! these exact kinds at every fallible boundary, so the taxonomy lives here
//! rather than behind a trait the core only consumes.

use std::fmt;

/// Why an operation was aborted without being a true failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// Transient condition; the same call may succeed if retried.
    Retry,
    /// Allocation failed.
    NoMemory,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::Retry => write!(f, "retry"),
            AbortReason::NoMemory => write!(f, "no memory"),
        }
    }
}

/// All ways a core operation can fail.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("corruption: {0}")]
    Corruption(String),

    #[error("not found")]
    NotFound,

    #[error("busy")]
    Busy,

    #[error("aborted: {0}")]
    Aborted(AbortReason),
}

impl Error {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    pub fn not_supported(msg: impl Into<String>) -> Self {
        Error::NotSupported(msg.into())
    }

    /// Busy and `Aborted(Retry)` share retry semantics.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Busy | Error::Aborted(AbortReason::Retry))
    }

    /// `not_found` and `invalid_argument` are non-fatal: they never latch the
    /// Pager into Error mode.
    pub fn is_benign(&self) -> bool {
        matches!(self, Error::NotFound | Error::InvalidArgument(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
