//! The command execution seam.
//!
//! Compiling and running query/command text is the job of an external
//! collaborator; the dispatcher only frames its results. Deployments
//! install a processor on the server context, tests plug in stubs.

use crate::error::ServerResult;
use rookdb_core::{Database, Record};
use std::time::Duration;

/// Result shapes a command can produce.
#[derive(Debug, Clone)]
pub enum CommandOutcome {
    /// No result.
    Null,
    /// A single record.
    Record(Record),
    /// A list of records.
    Collection(Vec<Record>),
    /// A scalar rendered as text.
    Text(String),
}

/// Executes serialized command requests against a database.
pub trait CommandProcessor: Send + Sync {
    /// Runs the command carried by `request` within `timeout`.
    ///
    /// The request bytes are the client serializer's representation of
    /// the command text and its parameters.
    fn execute(
        &self,
        db: &Database,
        request: &[u8],
        timeout: Duration,
    ) -> ServerResult<CommandOutcome>;
}
