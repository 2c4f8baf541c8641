//! Error types for confcache
//!
//! One taxonomy is shared across all components so the HTTP front end can
//! map error kinds to response statuses. Variants carry rendered messages
//! instead of source errors: a load result is published to every caller
//! coalesced onto the same in-flight fetch, so errors must be `Clone`.

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in confcache
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The requested file does not exist in the backend
    #[error("not found: {0}")]
    NotFound(String),

    /// The upstream backend answered with a non-2xx status
    #[error("upstream status {status}: {msg}")]
    Upstream { status: u16, msg: String },

    /// Network or I/O failure talking to a backend or peer
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed payload (bus message, peer response metadata)
    #[error("decode error: {0}")]
    Decode(String),

    /// Infrastructure dependency unreachable (bus, cluster API)
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        // A typed not-found from the filesystem maps to the cache's NotFound
        // kind; every other I/O failure is a transport problem.
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NotFound(e.to_string())
        } else {
            Error::Transport(e.to_string())
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        Error::Unavailable(format!("kubernetes API: {e}"))
    }
}

impl From<lapin::Error> for Error {
    fn from(e: lapin::Error) -> Self {
        Error::Unavailable(format!("amqp: {e}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Decode(e.to_string())
    }
}

// =============================================================================
// Tests
// =============================================================================
