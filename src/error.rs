//! Crate-wide error type.
//!
//! All operations here are recoverable: none of the algorithms in this
//! crate panic on well-formed input. Callers should match on the variant
//! they can act on and propagate the rest.

use thiserror::Error;

/// Errors produced by the Elias-Fano codec, the BPS-tree, and the
/// committed-domain subsystem.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// An ordinal was requested that is `>= count` for an Elias-Fano vector
    /// or a BPS-tree.
    #[error("ordinal {ordinal} out of bounds, count is {count}")]
    OutOfBounds {
        /// The requested ordinal.
        ordinal: u64,
        /// The number of entries actually present.
        count: u64,
    },

    /// A serialized record was shorter than its format requires, or an
    /// Elias-Fano build was asked to accept a non-monotone sequence.
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),

    /// An operation was invoked against an adapter variant, or a commitment
    /// mode, that does not support it.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// An archive cursor read or compressor write failed.
    #[error("archive I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Ambient cancellation was observed during a long-running merge.
    #[error("operation cancelled")]
    Cancelled,

    /// A shortened-key reference did not resolve to any file covering its
    /// step. Callers generally log this at `warn` and fall back to the
    /// original key rather than propagating it.
    #[error("shortened key reference not found: {0}")]
    KeyNotFound(String),
}

/// Result alias used throughout the crate.
pub type ArchiveResult<T> = Result<T, ArchiveError>;
