//! Error type shared across the crate.

use thiserror::Error;

/// Catch-all error for this crate. Invariant violations do not surface here;
/// they abort with a diagnostic, as contention and corruption must never be
/// silently recovered from.
#[derive(Debug, Error)]
pub enum Error {
    /// An error that originates in this crate.
    #[error("{0}")]
    General(String),
    /// A packed image that cannot be decoded.
    #[error("failed to decode packed image: {0}")]
    Decode(#[from] bincode::Error),
    /// Snapshot file I/O.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// A rank transport endpoint that has been torn down.
    #[error("transport endpoint disconnected")]
    Disconnected,
    /// Error that does not originate from this crate.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Shorthand for results produced by this crate.
pub type Result<T> = std::result::Result<T, Error>;
