//! Error types surfaced by the collector.
//!
//! Only initialization failures and exhausted mutator allocations reach
//! callers. Evacuation OOM and promotion failure are handled inside the
//! collector and never appear here.

use std::io;

use thiserror::Error;

/// Errors returned by heap construction and mutator operations.
#[derive(Debug, Error)]
pub enum GcError {
    /// The heap's address range could not be reserved.
    #[error("failed to reserve {bytes} bytes of heap address space")]
    Reserve {
        /// Requested reservation size.
        bytes: usize,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// A region could not be committed.
    #[error("failed to commit region {region}")]
    Commit {
        /// Index of the region.
        region: usize,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// Unknown GC mode name.
    #[error("unknown GC mode `{0}` (expected satb, iu, passive or generational)")]
    InvalidMode(String),

    /// Inconsistent configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// Allocation failed after every collection, including full GC.
    #[error("out of memory: could not allocate {requested_bytes} bytes")]
    OutOfMemory {
        /// Size of the failed request.
        requested_bytes: usize,
    },

    /// Object shape cannot be represented in a header.
    #[error("object shape too large: {0}")]
    ShapeTooLarge(&'static str),

    /// A local handle was used outside the scope that created it.
    #[error("local handle used outside its scope")]
    InvalidHandle,
}

/// Result alias for collector operations.
pub type Result<T> = std::result::Result<T, GcError>;
