//! Errors of benchmark and scanner runs.

use thiserror::Error;

use crate::concurrency::GateError;

/// Errors that end a benchmark or scan.
///
/// Failures of individual reads are contained at the task boundary and only ever reported through
/// [`ObjectError`]; this type covers the conditions that stop a whole run.
#[derive(Debug, Error)]
pub enum Error {
    /// Writing an object failed, so the key set of the round is incomplete.
    #[error("failed to write object `{key}`")]
    WriteFailed {
        /// The key that could not be written.
        key: String,
        /// The error reported by the storage backend.
        #[source]
        source: s3perf_service::Error,
    },

    /// Listing the bucket failed before the final page was reached.
    #[error("failed to list objects")]
    ListFailed(#[source] s3perf_service::Error),

    /// The admission gate was closed while work was still being submitted.
    #[error(transparent)]
    Gate(#[from] GateError),

    /// The run was cancelled from the outside before it completed.
    #[error("run was cancelled")]
    Cancelled,

    /// A background task panicked.
    #[error("background task failed")]
    Join(#[from] tokio::task::JoinError),
}

/// Result type for benchmark and scanner runs.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors while reading a single object.
///
/// These are logged together with the object key and never abort a run.
#[derive(Debug, Error)]
pub enum ObjectError {
    /// The storage backend failed to serve the object.
    #[error("storage error")]
    Storage(#[from] s3perf_service::Error),

    /// Reading or decompressing the object body failed.
    #[error("i/o error while reading object body")]
    Io(#[from] std::io::Error),

    /// The object disappeared between listing or writing and reading it.
    #[error("object not found")]
    NotFound,
}
