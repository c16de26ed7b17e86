//! # RookDB Wire
//!
//! Fixed-endian framing primitives shared by the RookDB server and client:
//! the binary channel with its length-prefixed readers and writers, the
//! per-channel response write lock, protocol opcodes and version gates, and
//! the wire-level record types (RID, record version, cluster position).

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod channel;
mod error;
pub mod protocol;
mod types;

pub use channel::{BinaryChannel, ChannelLock};
pub use error::{WireError, WireResult};
pub use types::{ClusterPosition, RecordVersion, Rid};
