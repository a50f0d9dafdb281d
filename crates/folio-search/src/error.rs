//! Pipeline error types.
//!
//! Every failure the pipeline can surface goes through [`SearchError`].
//! Variants are split by what the caller can do about them: fatal request
//! problems, retryable transport problems, and queue admission problems.

use std::time::Duration;

use folio_store::StoreError;

/// Unified error type for the query pipeline.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    // -- Request errors (fatal, never retried) --------------------------------
    /// The configured provider endpoint is not a valid URL.
    #[error("invalid provider url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The provider answered with a non-success status.
    #[error("provider returned {status}: {body}")]
    InvalidResponse { status: u16, body: String },

    /// No API key was supplied.
    #[error("missing api key for provider")]
    MissingApiKey,

    // -- Stream errors -------------------------------------------------------
    /// The connection dropped or timed out before the terminal frame.
    #[error("transport failure: {reason}")]
    TransportFailure { reason: String },

    /// A frame did not have the expected shape.  Streams skip these.
    #[error("could not decode frame: {reason}")]
    DecodeFailure { reason: String },

    /// Every reconnection attempt failed.
    #[error("gave up after {attempts} attempts: {last_error}")]
    ExhaustedRetries { attempts: u32, last_error: String },

    // -- Queue errors --------------------------------------------------------
    /// The request queue is at capacity.
    #[error("request queue is full ({capacity} waiting)")]
    QueueFull { capacity: usize },

    /// The request waited in the queue longer than allowed.
    #[error("request expired after waiting {waited:?} in queue")]
    QueueExpired { waited: Duration },

    /// The pipeline shut down while the request was pending.
    #[error("request cancelled")]
    Cancelled,

    // -- Configuration -------------------------------------------------------
    /// Configuration validation or loading failed.
    #[error("config error: {reason}")]
    Config { reason: String },

    // -- Upstream crate errors -----------------------------------------------
    /// An error propagated from the store crate.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SearchError {
    /// Whether the stream processor should reconnect after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransportFailure { .. })
    }
}

/// Convenience alias used throughout the pipeline crate.
pub type Result<T> = std::result::Result<T, SearchError>;

impl From<reqwest::Error> for SearchError {
    fn from(err: reqwest::Error) -> Self {
        Self::TransportFailure {
            reason: err.to_string(),
        }
    }
}
