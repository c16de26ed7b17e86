//! # RookDB Core
//!
//! The record engine behind the RookDB wire protocol:
//! - the database facade with MVCC-guarded record CRUD
//! - the ordered hook pipeline with reentrancy protection
//! - the per-session local record cache
//! - the transaction buffer replayed at commit
//! - the `Storage`, `IndexManager` and `CollectionManager` contracts the
//!   engine consumes, with in-memory implementations for tests and
//!   embedded use

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod collections;
mod database;
mod error;
mod hook;
mod index;
mod record;
mod security;
mod storage;
mod tx;

pub use cache::LocalRecordCache;
pub use collections::{BonsaiPointer, CollectionManager, MemoryCollectionManager};
pub use database::{CommitOutcome, Database, DatabaseListener, SaveResult, DEFAULT_SERIALIZER};
pub use error::{CoreError, CoreResult};
pub use hook::{
    DistributedMode, HookDecision, HookKind, HookPosition, HookRegistry, RecordHook, RunMode,
};
pub use index::{Index, IndexManager, MemoryIndexManager};
pub use record::{Record, RecordStatus};
pub use security::{permission, resource, Role, SecurityManager, User, ADMIN};
pub use storage::{
    ClusterInfo, LockingStrategy, MemoryStorage, MemoryStorageRegistry, OperationMode,
    OperationResult, PhysicalPosition, RawBuffer, RecordMetadata, Storage, StorageRegistry,
};
pub use tx::{TxBuffer, TxLookup};
