//! Errors returned by the storage backends.

use thiserror::Error;

/// Errors that can occur while talking to a storage backend.
#[derive(Debug, Error)]
pub enum Error {
    /// IO errors related to payload streaming or file operations.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors returned by the S3 client, either from the transport or from the API itself.
    #[error("s3 error: {context}")]
    S3 {
        /// The operation that failed.
        context: String,
        /// The error reported by the client.
        #[source]
        cause: s3::error::S3Error,
    },

    /// The backend answered with a status code that does not indicate success.
    #[error("unexpected status {status}: {context}")]
    Status {
        /// The operation that failed.
        context: String,
        /// The HTTP status code of the response.
        status: u16,
    },

    /// The object key cannot be mapped onto the backend.
    #[error("invalid object key `{0}`")]
    InvalidKey(String),

    /// An object write was rejected by the backend.
    ///
    /// The in-memory backend uses this to simulate failing writes.
    #[error("write rejected for `{0}`")]
    WriteRejected(String),

    /// Any other error stemming from one of the storage backends.
    #[error("storage backend error: {context}")]
    Generic {
        /// Description of what went wrong.
        context: String,
        /// The underlying error.
        #[source]
        cause: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl Error {
    pub(crate) fn s3(context: impl Into<String>, cause: s3::error::S3Error) -> Self {
        Self::S3 {
            context: context.into(),
            cause,
        }
    }
}

/// Result type for storage operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;
