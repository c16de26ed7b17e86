//! Error types for the record engine.

use rookdb_wire::{Rid, WireError};
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors surfaced by the record engine.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Wire framing error bubbling up from a storage proxy.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Operation attempted on a closed database.
    #[error("database '{name}' is closed")]
    DatabaseClosed {
        /// Database name.
        name: String,
    },

    /// A database with this name already exists.
    #[error("database '{name}' already exists")]
    DatabaseExists {
        /// Database name.
        name: String,
    },

    /// No database with this name.
    #[error("database '{name}' does not exist")]
    DatabaseNotFound {
        /// Database name.
        name: String,
    },

    /// The writer's expected version does not match the stored one.
    #[error("version conflict on record {rid}: expected v{expected}, stored v{actual}")]
    MvccConflict {
        /// The record being written.
        rid: Rid,
        /// Version the writer carried.
        expected: i32,
        /// Version storage holds.
        actual: i32,
    },

    /// The RID does not resolve to a stored record.
    #[error("record {rid} not found")]
    RecordNotFound {
        /// The missing record.
        rid: Rid,
    },

    /// The cluster does not exist.
    #[error("cluster '{cluster}' not found")]
    ClusterNotFound {
        /// Cluster name or `#id` form.
        cluster: String,
    },

    /// The user's rules do not grant the operation.
    #[error("user '{user}' has no '{operation}' permission on resource '{resource}'")]
    AccessDenied {
        /// Authenticated user.
        user: String,
        /// Operation name (read/create/update/delete).
        operation: String,
        /// Resource key that was checked.
        resource: String,
    },

    /// Authentication failed.
    #[error("invalid credentials for user '{user}'")]
    InvalidCredentials {
        /// The user that failed to authenticate.
        user: String,
    },

    /// A new record's class does not match the class bound to its cluster.
    #[error(
        "record in cluster '{cluster}' must carry class '{expected}' but carries '{actual}'"
    )]
    ClassMismatch {
        /// Cluster the record was saved into.
        cluster: String,
        /// Class bound to the cluster ("<none>" when unbound).
        expected: String,
        /// Class the record declared ("<none>" when absent).
        actual: String,
    },

    /// The storage is frozen and rejects writes.
    #[error("storage is frozen")]
    StorageFrozen,

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of the violation.
        message: String,
    },

    /// Unexpected failure wrapped with its record context.
    #[error("internal error: {message}")]
    Internal {
        /// Description with RID/cluster context where known.
        message: String,
    },
}

impl CoreError {
    /// Creates an invalid-operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a cluster-not-found error from an id.
    pub fn cluster_not_found_id(id: i16) -> Self {
        Self::ClusterNotFound {
            cluster: format!("#{id}"),
        }
    }

    /// Stable identifier written as the "class" of an error frame.
    #[must_use]
    pub fn class_name(&self) -> &'static str {
        match self {
            Self::Wire(_) => "ProtocolError",
            Self::Io(_) => "IoError",
            Self::DatabaseClosed { .. } => "DatabaseClosedError",
            Self::DatabaseExists { .. } => "DatabaseExistsError",
            Self::DatabaseNotFound { .. } => "DatabaseNotFoundError",
            Self::MvccConflict { .. } => "ConcurrentModificationError",
            Self::RecordNotFound { .. } => "RecordNotFoundError",
            Self::ClusterNotFound { .. } => "ClusterNotFoundError",
            Self::AccessDenied { .. } => "SecurityAccessError",
            Self::InvalidCredentials { .. } => "SecurityAccessError",
            Self::ClassMismatch { .. } => "SchemaError",
            Self::StorageFrozen => "StorageFrozenError",
            Self::InvalidOperation { .. } => "InvalidOperationError",
            Self::Internal { .. } => "DatabaseError",
        }
    }
}
