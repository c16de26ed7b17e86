//! Error types for wire framing.

use std::io;
use thiserror::Error;

/// Result type for wire operations.
pub type WireResult<T> = Result<T, WireError>;

/// Errors that can occur while framing or parsing wire data.
#[derive(Debug, Error)]
pub enum WireError {
    /// Underlying socket or stream error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The stream ended inside a frame.
    #[error("unexpected end of stream")]
    UnexpectedEof,

    /// A length-prefixed string was not valid UTF-8.
    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,

    /// A length prefix exceeded the allowed maximum.
    ///
    /// Guards against allocation from untrusted length prefixes.
    #[error("frame of {claimed} bytes exceeds the {max_allowed} byte limit")]
    SizeLimitExceeded {
        /// Length claimed by the prefix.
        claimed: u64,
        /// Maximum the channel accepts.
        max_allowed: u64,
    },

    /// A frame carried a value outside its legal range.
    #[error("malformed frame: {message}")]
    MalformedFrame {
        /// Description of the violation.
        message: String,
    },
}

impl WireError {
    /// Creates a malformed-frame error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedFrame {
            message: message.into(),
        }
    }

    /// True when the error means the peer went away rather than sent garbage.
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::UnexpectedEof => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}
