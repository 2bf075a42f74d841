//! Centralized error handling types for the library.
//!
//! This module leverages the `thiserror` crate to provide a unified [`Error`] enum
//! that aggregates user-input problems (Format, Conflict), remote-memory failures
//! (Win32, Allocation, OutOfRange) and loader-sequencing surprises (Protocol).

/// A convenience alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// The exhaustive list of failure modes for an import-rewriting session.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Wraps standard Input/Output failures (e.g., the target image could not be read).
    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// A raw Operating System API failure.
    ///
    /// Contains the name of the failed function and the raw error code (decimal).
    #[error("Win32 API '{0}' failed with error code: {1}")]
    Win32(&'static str, u32),

    /// An import update or forwarding string does not follow the
    /// `dll!function`, `dll#ordinal` or `spec:spec` mini-language.
    #[error("Invalid import update: {0}")]
    Format(String),

    /// A forwarding request contradicts the import table it is applied to.
    ///
    /// (e.g., forwarding an import that does not exist, or forwarding an
    /// import that is itself a forwarding target.)
    #[error("Import conflict: {0}")]
    Conflict(String),

    /// No free region close enough to the image base could be reserved for
    /// the new import directory.
    #[error("Allocation failed: {0}")]
    Allocation(String),

    /// A candidate allocation lies farther than 4 GiB from the image base,
    /// which 32-bit RVA fields cannot express.
    #[error("Address {address:#x} is more than 4 GiB away from image base {image_base:#x}")]
    OutOfRange { address: u64, image_base: u64 },

    /// The target image is malformed or truncated.
    ///
    /// (e.g., missing PE magic bytes, an RVA pointing outside every section.)
    #[error("Invalid image format: {0}")]
    InvalidImage(String),

    /// The debugged process signaled an unexpected event sequence.
    #[error("Unexpected loader event: {0}")]
    Protocol(String),

    /// An internal invariant was violated; always a bug, never user input.
    #[error("Internal error: {0}")]
    Internal(String),
}
