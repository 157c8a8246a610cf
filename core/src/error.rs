//! Crate-level error type and the category used by the orchestrator (§7) to
//! decide whether to restart, fail, or leave a cancellation in place.

use thiserror::Error;

use crate::model::ConfigurationError;

/// How the orchestrator should react to a [`CoreError`] surfacing from a
/// worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad input; no amount of retrying helps. Upload moves to `Failed`.
    Validation,
    /// A referenced row disappeared underneath a worker. Treated as
    /// transient: restart.
    NotFound,
    /// I/O hiccup (disk, network). Restart.
    TransientIo,
    /// Stored bytes don't hash to the CID on record. Restart once; if it
    /// recurs the run exhausts its restart budget and fails.
    DataIntegrity,
    /// A wire-format invariant was violated by our own encoder. Fail: this
    /// is a bug, not a transient condition.
    Protocol,
    /// The upload was cancelled by the caller. Not a failure.
    Cancellation,
    /// The restart budget in the active `Configuration` has been spent.
    Exhaustion,
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration invalid: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("io error at {path}: {source}")]
    Io { path: String, #[source] source: std::io::Error },

    #[error("repository error: {0}")]
    Repository(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("block for cid {cid} hashes to {actual} instead")]
    CidMismatch { cid: String, actual: String },

    #[error("wire format violation: {0}")]
    Protocol(String),

    /// A remote upload/blob-add call was rejected. Treated as a protocol
    /// violation rather than a transient hiccup: the remote told us the
    /// request itself is bad, so restarting would repeat the same rejection.
    #[error("upload server returned an error: {0}")]
    Upload(String),

    #[error("upload was cancelled")]
    Cancelled,

    #[error("maximum number of restarts reached")]
    RestartsExhausted { attempts: u32, last: String },
}

impl CoreError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            CoreError::Configuration(_) => ErrorCategory::Validation,
            CoreError::Io { .. } => ErrorCategory::TransientIo,
            CoreError::Repository(_) => ErrorCategory::TransientIo,
            CoreError::NotFound { .. } => ErrorCategory::NotFound,
            CoreError::CidMismatch { .. } => ErrorCategory::DataIntegrity,
            CoreError::Protocol(_) => ErrorCategory::Protocol,
            CoreError::Upload(_) => ErrorCategory::Protocol,
            CoreError::Cancelled => ErrorCategory::Cancellation,
            CoreError::RestartsExhausted { .. } => ErrorCategory::Exhaustion,
        }
    }
}
