//! Error types for the protocol server.

use rookdb_core::CoreError;
use rookdb_wire::WireError;
use std::io;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors raised while serving a connection.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Record engine error.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Wire framing error.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Socket error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A request named a session the server does not know.
    #[error("found unknown session {0}")]
    UnknownSession(i32),

    /// The opcode is not part of the protocol.
    #[error("command not supported: {0}")]
    NotSupported(u8),

    /// The opcode exists but was retired.
    #[error("operation '{0}' has been deprecated")]
    Deprecated(&'static str),

    /// The request body violated the protocol.
    #[error("invalid request: {message}")]
    InvalidRequest {
        /// Description of the violation.
        message: String,
    },

    /// A server-level resource was accessed without authorisation.
    #[error("user '{user}' cannot access the server resource '{resource}'")]
    ServerAccess {
        /// Server user, or "<anonymous>".
        user: String,
        /// Server resource key.
        resource: String,
    },

    /// A distributed-only request reached a standalone server.
    #[error("no distributed manager configured")]
    NoDistributedManager,

    /// No command processor is installed.
    #[error("no command processor configured")]
    NoCommandProcessor,

    /// The session must be bound to a database for this request.
    #[error("no database bound to session {0}")]
    NoDatabase(i32),
}

impl ServerError {
    /// Creates an invalid-request error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Stable identifier written as the "class" of an error frame.
    #[must_use]
    pub fn class_name(&self) -> &'static str {
        match self {
            Self::Core(e) => e.class_name(),
            Self::Wire(_) => "ProtocolError",
            Self::Io(_) => "IoError",
            Self::UnknownSession(_) => "UnknownSessionError",
            Self::NotSupported(_) => "RequestNotSupportedError",
            Self::Deprecated(_) => "RequestNotSupportedError",
            Self::InvalidRequest { .. } => "ProtocolError",
            Self::ServerAccess { .. } => "SecurityAccessError",
            Self::NoDistributedManager => "ConfigurationError",
            Self::NoCommandProcessor => "ConfigurationError",
            Self::NoDatabase(_) => "DatabaseClosedError",
        }
    }

    /// True when the connection is beyond saving and must be dropped.
    ///
    /// A request that needs a bound database but has none is fatal too:
    /// its body cannot be decoded, so the stream is desynchronised.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::UnknownSession(_) => true,
            Self::Wire(e) => e.is_disconnect(),
            Self::Io(_) => true,
            Self::NoDatabase(_) => true,
            _ => false,
        }
    }
}
