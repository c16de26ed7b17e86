//! Error types for the client.

use rookdb_wire::WireError;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors raised by the connection pool and client channels.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Wire framing error.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Socket error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No free channel became available in time.
    #[error("timed out after {waited:?} waiting for a free channel to '{url}'")]
    PoolTimeout {
        /// The URL whose pool was exhausted.
        url: String,
        /// How long the caller waited.
        waited: Duration,
    },

    /// The pool was shut down.
    #[error("connection pool is closed")]
    PoolClosed,

    /// A channel was handed back but its pool no longer exists.
    #[error("connection cannot be released because the pool for '{url}' does not exist anymore")]
    PoolMissing {
        /// URL the channel was created for.
        url: String,
    },

    /// The URL could not be parsed or resolved.
    #[error("invalid server URL '{url}': {message}")]
    InvalidUrl {
        /// The offending URL.
        url: String,
        /// What was wrong with it.
        message: String,
    },

    /// The channel is not connected.
    #[error("channel to '{url}' is not connected")]
    NotConnected {
        /// The peer URL.
        url: String,
    },

    /// The server answered with an error frame.
    #[error("server error [{class}]: {message}")]
    Server {
        /// Error class from the frame.
        class: String,
        /// Error message from the frame.
        message: String,
    },
}

impl ClientError {
    /// Creates an invalid-URL error.
    pub fn invalid_url(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            message: message.into(),
        }
    }
}
