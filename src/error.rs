//! Error types for the composite cache engine

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the cache engine
///
/// A miss is never an error: lookups return `Ok(None)`. Auxiliary failures
/// are logged and absorbed into zombie buffering on the hot path; they only
/// appear here so backends and management calls have something to report.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad region or attribute configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Auxiliary backend unreachable or in error state
    #[error("Auxiliary cache '{name}' unavailable: {reason}")]
    AuxiliaryUnavailable { name: String, reason: String },

    /// Auxiliary backend exceeded its operation bound
    #[error("Auxiliary cache '{name}' timed out after {after:?}")]
    AuxiliaryTimeout { name: String, after: Duration },

    /// Value could not be encoded or decoded for a disk/remote tier
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Explicit dispose/configure failure
    #[error("Management error: {0}")]
    Management(String),

    /// Operation issued against a disposed region
    #[error("Region '{0}' has been disposed")]
    RegionDisposed(String),

    /// The single-flight leader's supplier failed
    #[error("Value loader failed: {0}")]
    LoaderFailed(String),

    /// The single-flight leader was cancelled before publishing a result
    #[error("Value loader was abandoned before completing")]
    LoadAbandoned,

    // =========================================================================
    // Compression Errors
    // =========================================================================
    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },
}

impl Error {
    /// True for failures that should push an auxiliary into zombie mode
    /// rather than be dropped.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::AuxiliaryUnavailable { .. } | Error::AuxiliaryTimeout { .. } | Error::Io(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
