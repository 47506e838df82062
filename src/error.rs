//! Typed error kinds shared across the download engine and driver.

use std::fmt;

use url::Url;

/// An error produced somewhere in the download pipeline, tagged by kind rather
/// than by exception class, per the error-handling design.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    /// The user aborted a download while it was `Fetching`.
    #[error("download of {url} was aborted")]
    Aborted {
        /// The URL that was being fetched.
        url: Url,
    },

    /// The server delivered a different number of bytes than `expected_size`.
    #[error("download of {url} failed: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// The URL that was being fetched.
        url: Url,
        /// The size announced at `Download` construction time.
        expected: u64,
        /// The size actually received.
        actual: u64,
    },

    /// The server returned a status other than 200, 304, or a redirect, or
    /// the HTTP layer raised an error that carries a status code.
    #[error("download of {url} failed: {reason} (status {status})")]
    HttpStatus {
        /// The URL that was being fetched.
        url: Url,
        /// The HTTP status code.
        status: u16,
        /// A human-readable reason string.
        reason: String,
    },

    /// A socket, DNS, or HTTP-library error with no associated status.
    #[error("download of {url} failed: {source}")]
    Transport {
        /// The URL that was being fetched.
        url: Url,
        /// The underlying transport error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl DownloadError {
    /// Returns the URL this error pertains to.
    pub fn url(&self) -> &Url {
        match self {
            DownloadError::Aborted { url }
            | DownloadError::SizeMismatch { url, .. }
            | DownloadError::HttpStatus { url, .. }
            | DownloadError::Transport { url, .. } => url,
        }
    }
}

/// Errors raised by the [`RequestsQueue`](crate::queue::RequestsQueue) and
/// [`ConnectionPool`](crate::pool::ConnectionPool).
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The queue has been shut down and can no longer accept work.
    #[error("download engine is shutting down")]
    ShuttingDown,

    /// A request for `url` was pushed while one was already pending or in flight.
    #[error("a request for {0} is already pending")]
    AlreadyPending(Url),
}

/// Errors surfaced by [`Driver`](crate::driver::Driver) operations.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// The solver could not produce a ready set of selections after
    /// exhausting every feed fetch it asked for.
    #[error("dependency solve failed: {reason}")]
    SolverNotReady {
        /// The solver-provided human-readable reason.
        reason: String,
    },

    /// A feed fetch failed and the failure was not recoverable (i.e. it was
    /// returned to the overall task rather than merely reported). Covers
    /// engine-level rejections too: [`EngineError`] always reaches callers
    /// wrapped as a [`DownloadError::Transport`], never bare.
    #[error(transparent)]
    Download(#[from] DownloadError),
}

/// A minimal `(status, reason)` pair mirroring the wire-level outcome of one
/// HTTP attempt, independent of whether it ultimately succeeded.
#[derive(Debug, Clone, Default)]
pub struct Outcome {
    /// The HTTP status code, or `None` if no response was obtained at all.
    pub status: Option<u16>,
    /// A human-readable reason string, when available.
    pub reason: Option<String>,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.status, &self.reason) {
            (Some(status), Some(reason)) => write!(f, "{status} {reason}"),
            (Some(status), None) => write!(f, "{status}"),
            (None, Some(reason)) => write!(f, "{reason}"),
            (None, None) => write!(f, "no response"),
        }
    }
}
