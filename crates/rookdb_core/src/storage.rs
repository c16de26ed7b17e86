//! The storage contract consumed by the database facade, plus the
//! in-memory implementation used by tests and embedded deployments.

use crate::collections::{CollectionManager, MemoryCollectionManager};
use crate::error::{CoreError, CoreResult};
use parking_lot::RwLock;
use rookdb_wire::{ClusterPosition, RecordVersion, Rid};
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

/// Raw record image returned by a storage read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBuffer {
    /// Serialized payload.
    pub bytes: Vec<u8>,
    /// Stored version.
    pub version: RecordVersion,
    /// Record kind byte.
    pub kind: u8,
}

/// Result of a storage mutation.
///
/// `moved` is set when the operation was rerouted to another node; it
/// drives the replicated-hook selection and the cache-update policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationResult<T> {
    /// The operation's payload.
    pub result: T,
    /// True when the write was executed elsewhere.
    pub moved: bool,
}

impl<T> OperationResult<T> {
    /// A locally-executed result.
    pub fn local(result: T) -> Self {
        Self {
            result,
            moved: false,
        }
    }
}

/// How a read interacts with record-level locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockingStrategy {
    /// Storage decides; no lock survives the read.
    #[default]
    Default,
    /// Explicitly lock-free.
    None,
    /// Keep a shared lock on the record after the read.
    KeepShared,
    /// Keep an exclusive lock on the record after the read.
    KeepExclusive,
}

/// Synchronicity of a mutation, as requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationMode {
    /// Reply after the operation completes.
    Synchronous,
    /// Reply before the operation completes.
    Asynchronous,
    /// No reply at all.
    NoResponse,
}

impl OperationMode {
    /// Decodes the wire byte.
    #[must_use]
    pub fn from_wire(raw: u8) -> Self {
        match raw {
            1 => Self::Asynchronous,
            2 => Self::NoResponse,
            _ => Self::Synchronous,
        }
    }

    /// True when the client expects a response frame.
    #[must_use]
    pub fn expects_response(self) -> bool {
        !matches!(self, Self::NoResponse)
    }
}

/// Record metadata without the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordMetadata {
    /// Record identity.
    pub rid: Rid,
    /// Stored version.
    pub version: RecordVersion,
}

/// A physical slot inside a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalPosition {
    /// Position within the cluster.
    pub position: ClusterPosition,
    /// Stored payload size in bytes.
    pub record_size: i32,
    /// Stored version.
    pub version: RecordVersion,
}

/// Static description of a cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterInfo {
    /// Cluster id.
    pub id: i16,
    /// Cluster name.
    pub name: String,
    /// Class bound to the cluster, when the storage variant binds one.
    pub class: Option<String>,
}

/// The on-disk engine, consumed through this contract only.
///
/// Implementations supply their own locking; the facade calls in from any
/// session thread.
pub trait Storage: Send + Sync {
    /// Reads a record image. Tombstoned slots surface only when
    /// `load_tombstones` is set, as a buffer with a tombstone version and
    /// empty payload.
    fn read(&self, rid: Rid, load_tombstones: bool) -> CoreResult<Option<RawBuffer>>;

    /// Creates or updates a record under MVCC and returns the assigned
    /// identity and the new version.
    fn save(
        &self,
        rid: Rid,
        bytes: &[u8],
        version: RecordVersion,
        kind: u8,
        force_create: bool,
    ) -> CoreResult<OperationResult<(Rid, RecordVersion)>>;

    /// Deletes a record under MVCC, leaving a tombstone.
    fn delete(&self, rid: Rid, version: RecordVersion) -> CoreResult<OperationResult<bool>>;

    /// Hides a record: it disappears from reads but keeps its slot.
    fn hide(&self, rid: Rid) -> CoreResult<OperationResult<bool>>;

    /// Physically removes a record, leaving no tombstone.
    fn clean_out(&self, rid: Rid, version: RecordVersion) -> CoreResult<OperationResult<bool>>;

    /// Metadata for a record, if it exists.
    fn metadata(&self, rid: Rid) -> CoreResult<Option<RecordMetadata>>;

    /// Keeps a shared or exclusive lock on a record.
    fn lock_record(&self, rid: Rid, exclusive: bool) -> CoreResult<()>;

    /// Releases a kept record lock.
    fn unlock_record(&self, rid: Rid) -> CoreResult<()>;

    /// Total live record count.
    fn count_records(&self) -> CoreResult<i64>;

    /// Total size in bytes.
    fn size(&self) -> CoreResult<i64>;

    /// All clusters, in id order.
    fn clusters(&self) -> Vec<ClusterInfo>;

    /// Resolves a cluster name to its id.
    fn cluster_id_by_name(&self, name: &str) -> Option<i16>;

    /// Resolves a cluster id to its name.
    fn cluster_name_by_id(&self, id: i16) -> Option<String>;

    /// The cluster new records land in when none is named.
    fn default_cluster_id(&self) -> i16;

    /// Adds a cluster, optionally with a caller-chosen id.
    fn add_cluster(&self, name: &str, requested_id: Option<i16>) -> CoreResult<i16>;

    /// Drops a cluster by id.
    fn drop_cluster(&self, id: i16) -> CoreResult<bool>;

    /// Counts elements across clusters, optionally including tombstones.
    fn count_cluster_elements(&self, ids: &[i16], count_tombstones: bool) -> CoreResult<i64>;

    /// First and last allocated positions of a cluster.
    fn cluster_data_range(&self, id: i16) -> CoreResult<(ClusterPosition, ClusterPosition)>;

    /// Positions strictly above `position`.
    fn higher_positions(&self, id: i16, position: ClusterPosition)
        -> CoreResult<Vec<PhysicalPosition>>;

    /// Positions at or above `position`.
    fn ceiling_positions(
        &self,
        id: i16,
        position: ClusterPosition,
    ) -> CoreResult<Vec<PhysicalPosition>>;

    /// Positions strictly below `position`.
    fn lower_positions(&self, id: i16, position: ClusterPosition)
        -> CoreResult<Vec<PhysicalPosition>>;

    /// Positions at or below `position`.
    fn floor_positions(&self, id: i16, position: ClusterPosition)
        -> CoreResult<Vec<PhysicalPosition>>;

    /// Suspends writes.
    fn freeze(&self) -> CoreResult<()>;

    /// Resumes writes.
    fn release(&self) -> CoreResult<()>;

    /// Suspends writes on one cluster.
    fn freeze_cluster(&self, id: i16) -> CoreResult<()>;

    /// Resumes writes on one cluster.
    fn release_cluster(&self, id: i16) -> CoreResult<()>;

    /// The bonsai collection manager owned by this storage, if it
    /// supports disk-backed collections.
    fn collection_manager(&self) -> Option<Arc<dyn CollectionManager>>;

    /// True when writes may be rerouted to other nodes.
    fn is_distributed(&self) -> bool {
        false
    }

    /// True for network proxies of a remote storage.
    fn is_remote(&self) -> bool {
        false
    }

    /// True when the storage variant binds record classes to clusters.
    fn classes_detected_by_cluster_id(&self) -> bool {
        false
    }
}

/// Creates, opens and drops storages by database name.
pub trait StorageRegistry: Send + Sync {
    /// Opens an existing storage.
    fn open(&self, name: &str) -> CoreResult<Arc<dyn Storage>>;

    /// Creates a new storage.
    fn create(&self, name: &str) -> CoreResult<Arc<dyn Storage>>;

    /// Existence check.
    fn exists(&self, name: &str) -> bool;

    /// Drops a storage.
    fn drop_storage(&self, name: &str) -> CoreResult<()>;

    /// Names of all known storages.
    fn list(&self) -> Vec<String>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StoredRecord {
    bytes: Vec<u8>,
    version: i32,
    kind: u8,
    tombstone: bool,
}

#[derive(Debug, Default)]
struct MemoryCluster {
    name: String,
    class: Option<String>,
    records: BTreeMap<i64, StoredRecord>,
    next_position: i64,
    frozen: bool,
}

impl MemoryCluster {
    fn live_count(&self) -> i64 {
        self.records.values().filter(|r| !r.tombstone).count() as i64
    }

    fn tombstone_count(&self) -> i64 {
        self.records.values().filter(|r| r.tombstone).count() as i64
    }
}

#[derive(Default)]
struct MemoryStorageInner {
    clusters: BTreeMap<i16, MemoryCluster>,
    next_cluster_id: i16,
    default_cluster: i16,
    frozen: bool,
    locked_records: HashMap<Rid, bool>,
}

/// Heap-backed storage honouring the full contract, including MVCC
/// version checks and tombstones. Not durable.
pub struct MemoryStorage {
    inner: RwLock<MemoryStorageInner>,
    collections: Arc<MemoryCollectionManager>,
}

impl MemoryStorage {
    /// Creates a storage with a single default cluster.
    #[must_use]
    pub fn new() -> Self {
        let storage = Self {
            inner: RwLock::new(MemoryStorageInner::default()),
            collections: Arc::new(MemoryCollectionManager::new()),
        };
        let default_id = storage
            .add_cluster("default", None)
            .unwrap_or(0);
        storage.inner.write().default_cluster = default_id;
        storage
    }

    /// Binds a class to a cluster; subsequent new records in the cluster
    /// must carry that class.
    pub fn bind_cluster_class(&self, id: i16, class: impl Into<String>) -> CoreResult<()> {
        let mut inner = self.inner.write();
        let cluster = inner
            .clusters
            .get_mut(&id)
            .ok_or_else(|| CoreError::cluster_not_found_id(id))?;
        cluster.class = Some(class.into());
        Ok(())
    }

    fn with_cluster<T>(
        &self,
        id: i16,
        f: impl FnOnce(&MemoryCluster) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let inner = self.inner.read();
        let cluster = inner
            .clusters
            .get(&id)
            .ok_or_else(|| CoreError::cluster_not_found_id(id))?;
        f(cluster)
    }

    fn check_version(rid: Rid, expected: RecordVersion, stored: i32) -> CoreResult<()> {
        if let RecordVersion::Tracked(expected) = expected {
            if expected != stored {
                return Err(CoreError::MvccConflict {
                    rid,
                    expected,
                    actual: stored,
                });
            }
        }
        Ok(())
    }

    fn positions_where(
        &self,
        id: i16,
        pred: impl Fn(i64) -> bool,
    ) -> CoreResult<Vec<PhysicalPosition>> {
        self.with_cluster(id, |cluster| {
            Ok(cluster
                .records
                .iter()
                .filter(|(pos, rec)| !rec.tombstone && pred(**pos))
                .map(|(pos, rec)| PhysicalPosition {
                    position: ClusterPosition::new(*pos),
                    record_size: rec.bytes.len() as i32,
                    version: RecordVersion::Tracked(rec.version),
                })
                .collect())
        })
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    fn read(&self, rid: Rid, load_tombstones: bool) -> CoreResult<Option<RawBuffer>> {
        self.with_cluster(rid.cluster_id, |cluster| {
            Ok(cluster.records.get(&rid.position.as_i64()).and_then(|rec| {
                if rec.tombstone {
                    if load_tombstones {
                        Some(RawBuffer {
                            bytes: Vec::new(),
                            version: RecordVersion::Tombstone,
                            kind: rec.kind,
                        })
                    } else {
                        None
                    }
                } else {
                    Some(RawBuffer {
                        bytes: rec.bytes.clone(),
                        version: RecordVersion::Tracked(rec.version),
                        kind: rec.kind,
                    })
                }
            }))
        })
    }

    fn save(
        &self,
        rid: Rid,
        bytes: &[u8],
        version: RecordVersion,
        kind: u8,
        force_create: bool,
    ) -> CoreResult<OperationResult<(Rid, RecordVersion)>> {
        let mut inner = self.inner.write();
        if inner.frozen {
            return Err(CoreError::StorageFrozen);
        }
        let cluster = inner
            .clusters
            .get_mut(&rid.cluster_id)
            .ok_or_else(|| CoreError::cluster_not_found_id(rid.cluster_id))?;
        if cluster.frozen {
            return Err(CoreError::StorageFrozen);
        }

        if rid.position.is_valid() && !force_create {
            let position = rid.position.as_i64();
            let stored = cluster
                .records
                .get_mut(&position)
                .filter(|rec| !rec.tombstone)
                .ok_or(CoreError::RecordNotFound { rid })?;
            Self::check_version(rid, version, stored.version)?;
            stored.bytes = bytes.to_vec();
            stored.version += 1;
            let new_version = RecordVersion::Tracked(stored.version);
            return Ok(OperationResult::local((rid, new_version)));
        }

        if force_create && rid.position.is_valid() {
            if cluster.records.contains_key(&rid.position.as_i64()) {
                return Err(CoreError::invalid_operation(format!(
                    "record {rid} already exists and creation was forced"
                )));
            }
            cluster.next_position = cluster.next_position.max(rid.position.as_i64() + 1);
            cluster.records.insert(
                rid.position.as_i64(),
                StoredRecord {
                    bytes: bytes.to_vec(),
                    version: 1,
                    kind,
                    tombstone: false,
                },
            );
            return Ok(OperationResult::local((rid, RecordVersion::Tracked(1))));
        }

        let position = cluster.next_position;
        cluster.next_position += 1;
        cluster.records.insert(
            position,
            StoredRecord {
                bytes: bytes.to_vec(),
                version: 1,
                kind,
                tombstone: false,
            },
        );
        let assigned = Rid::new(rid.cluster_id, ClusterPosition::new(position));
        Ok(OperationResult::local((assigned, RecordVersion::Tracked(1))))
    }

    fn delete(&self, rid: Rid, version: RecordVersion) -> CoreResult<OperationResult<bool>> {
        let mut inner = self.inner.write();
        if inner.frozen {
            return Err(CoreError::StorageFrozen);
        }
        let cluster = inner
            .clusters
            .get_mut(&rid.cluster_id)
            .ok_or_else(|| CoreError::cluster_not_found_id(rid.cluster_id))?;
        match cluster.records.get_mut(&rid.position.as_i64()) {
            Some(rec) if !rec.tombstone => {
                Self::check_version(rid, version, rec.version)?;
                rec.tombstone = true;
                rec.bytes.clear();
                Ok(OperationResult::local(true))
            }
            _ => Ok(OperationResult::local(false)),
        }
    }

    fn hide(&self, rid: Rid) -> CoreResult<OperationResult<bool>> {
        let mut inner = self.inner.write();
        let cluster = inner
            .clusters
            .get_mut(&rid.cluster_id)
            .ok_or_else(|| CoreError::cluster_not_found_id(rid.cluster_id))?;
        match cluster.records.get_mut(&rid.position.as_i64()) {
            Some(rec) if !rec.tombstone => {
                rec.tombstone = true;
                rec.bytes.clear();
                Ok(OperationResult::local(true))
            }
            _ => Ok(OperationResult::local(false)),
        }
    }

    fn clean_out(&self, rid: Rid, version: RecordVersion) -> CoreResult<OperationResult<bool>> {
        let mut inner = self.inner.write();
        let cluster = inner
            .clusters
            .get_mut(&rid.cluster_id)
            .ok_or_else(|| CoreError::cluster_not_found_id(rid.cluster_id))?;
        match cluster.records.get(&rid.position.as_i64()) {
            Some(rec) if !rec.tombstone => {
                Self::check_version(rid, version, rec.version)?;
                cluster.records.remove(&rid.position.as_i64());
                Ok(OperationResult::local(true))
            }
            Some(_) => {
                cluster.records.remove(&rid.position.as_i64());
                Ok(OperationResult::local(true))
            }
            None => Ok(OperationResult::local(false)),
        }
    }

    fn metadata(&self, rid: Rid) -> CoreResult<Option<RecordMetadata>> {
        self.with_cluster(rid.cluster_id, |cluster| {
            Ok(cluster
                .records
                .get(&rid.position.as_i64())
                .map(|rec| RecordMetadata {
                    rid,
                    version: if rec.tombstone {
                        RecordVersion::Tombstone
                    } else {
                        RecordVersion::Tracked(rec.version)
                    },
                }))
        })
    }

    fn lock_record(&self, rid: Rid, exclusive: bool) -> CoreResult<()> {
        let mut inner = self.inner.write();
        match inner.locked_records.get(&rid) {
            Some(true) => Err(CoreError::invalid_operation(format!(
                "record {rid} is exclusively locked"
            ))),
            Some(false) if exclusive => Err(CoreError::invalid_operation(format!(
                "record {rid} is share-locked"
            ))),
            _ => {
                inner.locked_records.insert(rid, exclusive);
                Ok(())
            }
        }
    }

    fn unlock_record(&self, rid: Rid) -> CoreResult<()> {
        self.inner.write().locked_records.remove(&rid);
        Ok(())
    }

    fn count_records(&self) -> CoreResult<i64> {
        let inner = self.inner.read();
        Ok(inner.clusters.values().map(MemoryCluster::live_count).sum())
    }

    fn size(&self) -> CoreResult<i64> {
        let inner = self.inner.read();
        Ok(inner
            .clusters
            .values()
            .flat_map(|c| c.records.values())
            .map(|r| r.bytes.len() as i64)
            .sum())
    }

    fn clusters(&self) -> Vec<ClusterInfo> {
        let inner = self.inner.read();
        inner
            .clusters
            .iter()
            .map(|(id, cluster)| ClusterInfo {
                id: *id,
                name: cluster.name.clone(),
                class: cluster.class.clone(),
            })
            .collect()
    }

    fn cluster_id_by_name(&self, name: &str) -> Option<i16> {
        let inner = self.inner.read();
        inner
            .clusters
            .iter()
            .find(|(_, c)| c.name.eq_ignore_ascii_case(name))
            .map(|(id, _)| *id)
    }

    fn cluster_name_by_id(&self, id: i16) -> Option<String> {
        let inner = self.inner.read();
        inner.clusters.get(&id).map(|c| c.name.clone())
    }

    fn default_cluster_id(&self) -> i16 {
        self.inner.read().default_cluster
    }

    fn add_cluster(&self, name: &str, requested_id: Option<i16>) -> CoreResult<i16> {
        let mut inner = self.inner.write();
        if inner
            .clusters
            .values()
            .any(|c| c.name.eq_ignore_ascii_case(name))
        {
            return Err(CoreError::invalid_operation(format!(
                "cluster '{name}' already exists"
            )));
        }
        let id = match requested_id {
            Some(id) if id >= 0 => {
                if inner.clusters.contains_key(&id) {
                    return Err(CoreError::invalid_operation(format!(
                        "cluster id {id} is already in use"
                    )));
                }
                inner.next_cluster_id = inner.next_cluster_id.max(id + 1);
                id
            }
            _ => {
                let id = inner.next_cluster_id;
                inner.next_cluster_id += 1;
                id
            }
        };
        inner.clusters.insert(
            id,
            MemoryCluster {
                name: name.to_string(),
                ..MemoryCluster::default()
            },
        );
        Ok(id)
    }

    fn drop_cluster(&self, id: i16) -> CoreResult<bool> {
        let mut inner = self.inner.write();
        if inner.default_cluster == id {
            return Err(CoreError::invalid_operation(
                "the default cluster cannot be dropped",
            ));
        }
        Ok(inner.clusters.remove(&id).is_some())
    }

    fn count_cluster_elements(&self, ids: &[i16], count_tombstones: bool) -> CoreResult<i64> {
        let inner = self.inner.read();
        let mut total = 0;
        for id in ids {
            let cluster = inner
                .clusters
                .get(id)
                .ok_or_else(|| CoreError::cluster_not_found_id(*id))?;
            total += cluster.live_count();
            if count_tombstones {
                total += cluster.tombstone_count();
            }
        }
        Ok(total)
    }

    fn cluster_data_range(&self, id: i16) -> CoreResult<(ClusterPosition, ClusterPosition)> {
        self.with_cluster(id, |cluster| {
            let live: Vec<i64> = cluster
                .records
                .iter()
                .filter(|(_, r)| !r.tombstone)
                .map(|(pos, _)| *pos)
                .collect();
            match (live.first(), live.last()) {
                (Some(first), Some(last)) => Ok((
                    ClusterPosition::new(*first),
                    ClusterPosition::new(*last),
                )),
                _ => Ok((ClusterPosition::INVALID, ClusterPosition::INVALID)),
            }
        })
    }

    fn higher_positions(
        &self,
        id: i16,
        position: ClusterPosition,
    ) -> CoreResult<Vec<PhysicalPosition>> {
        self.positions_where(id, |pos| pos > position.as_i64())
    }

    fn ceiling_positions(
        &self,
        id: i16,
        position: ClusterPosition,
    ) -> CoreResult<Vec<PhysicalPosition>> {
        self.positions_where(id, |pos| pos >= position.as_i64())
    }

    fn lower_positions(
        &self,
        id: i16,
        position: ClusterPosition,
    ) -> CoreResult<Vec<PhysicalPosition>> {
        self.positions_where(id, |pos| pos < position.as_i64())
    }

    fn floor_positions(
        &self,
        id: i16,
        position: ClusterPosition,
    ) -> CoreResult<Vec<PhysicalPosition>> {
        self.positions_where(id, |pos| pos <= position.as_i64())
    }

    fn freeze(&self) -> CoreResult<()> {
        self.inner.write().frozen = true;
        Ok(())
    }

    fn release(&self) -> CoreResult<()> {
        self.inner.write().frozen = false;
        Ok(())
    }

    fn freeze_cluster(&self, id: i16) -> CoreResult<()> {
        let mut inner = self.inner.write();
        let cluster = inner
            .clusters
            .get_mut(&id)
            .ok_or_else(|| CoreError::cluster_not_found_id(id))?;
        cluster.frozen = true;
        Ok(())
    }

    fn release_cluster(&self, id: i16) -> CoreResult<()> {
        let mut inner = self.inner.write();
        let cluster = inner
            .clusters
            .get_mut(&id)
            .ok_or_else(|| CoreError::cluster_not_found_id(id))?;
        cluster.frozen = false;
        Ok(())
    }

    fn collection_manager(&self) -> Option<Arc<dyn CollectionManager>> {
        Some(Arc::clone(&self.collections) as Arc<dyn CollectionManager>)
    }
}

/// In-memory registry of named storages.
pub struct MemoryStorageRegistry {
    storages: RwLock<HashMap<String, Arc<MemoryStorage>>>,
}

impl MemoryStorageRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            storages: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStorageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageRegistry for MemoryStorageRegistry {
    fn open(&self, name: &str) -> CoreResult<Arc<dyn Storage>> {
        self.storages
            .read()
            .get(name)
            .cloned()
            .map(|s| s as Arc<dyn Storage>)
            .ok_or_else(|| CoreError::DatabaseNotFound {
                name: name.to_string(),
            })
    }

    fn create(&self, name: &str) -> CoreResult<Arc<dyn Storage>> {
        let mut storages = self.storages.write();
        if storages.contains_key(name) {
            return Err(CoreError::DatabaseExists {
                name: name.to_string(),
            });
        }
        let storage = Arc::new(MemoryStorage::new());
        storages.insert(name.to_string(), Arc::clone(&storage));
        Ok(storage as Arc<dyn Storage>)
    }

    fn exists(&self, name: &str) -> bool {
        self.storages.read().contains_key(name)
    }

    fn drop_storage(&self, name: &str) -> CoreResult<()> {
        if self.storages.write().remove(name).is_none() {
            return Err(CoreError::DatabaseNotFound {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.storages.read().keys().cloned().collect();
        names.sort();
        names
    }
}
