//! Disk-backed collection contract (bonsai trees) and change tracking.
//!
//! Large rid-bag edges live in storage-owned trees addressed by an opaque
//! pointer. The engine only routes reads to them and tracks which
//! pointers changed during a request so write responses can ship the new
//! pointers back to the client.

use crate::error::{CoreError, CoreResult};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use uuid::Uuid;

/// Opaque handle to a disk-backed collection tree.
///
/// Wire form: file id (i64), page index (i64), page offset (i32).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BonsaiPointer {
    /// File the tree root lives in.
    pub file_id: i64,
    /// Page of the root node.
    pub page_index: i64,
    /// Offset of the root node within its page.
    pub page_offset: i32,
}

impl BonsaiPointer {
    /// Creates a pointer.
    #[must_use]
    pub const fn new(file_id: i64, page_index: i64, page_offset: i32) -> Self {
        Self {
            file_id,
            page_index,
            page_offset,
        }
    }
}

/// The collection store contract.
///
/// Keys and values are opaque byte strings; their serializers belong to
/// the record layer.
pub trait CollectionManager: Send + Sync {
    /// Creates a tree for a cluster and returns its pointer.
    fn create(&self, cluster_id: i32) -> CoreResult<BonsaiPointer>;

    /// Point lookup.
    fn get(&self, pointer: BonsaiPointer, key: &[u8]) -> CoreResult<Option<Vec<u8>>>;

    /// Smallest key in the tree.
    fn first_key(&self, pointer: BonsaiPointer) -> CoreResult<Option<Vec<u8>>>;

    /// Entries with key >= (or > when not inclusive) the given key, up to
    /// `page_size` of them.
    fn entries_major(
        &self,
        pointer: BonsaiPointer,
        key: &[u8],
        inclusive: bool,
        page_size: i32,
    ) -> CoreResult<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Real size of a rid-bag: materialised entries plus the delta carried
    /// by the pending change stream (leading big-endian i32, when present).
    fn rid_bag_size(&self, pointer: BonsaiPointer, changes: &[u8]) -> CoreResult<i32>;

    /// Pointers changed since the last clear, keyed by their tracking id.
    fn changed_ids(&self) -> Vec<(Uuid, BonsaiPointer)>;

    /// Forgets accumulated changes.
    fn clear_changed_ids(&self);

    /// Records a pointer change under a tracking id.
    fn record_change(&self, id: Uuid, pointer: BonsaiPointer);
}

/// Heap-backed collection store for tests and embedded use.
pub struct MemoryCollectionManager {
    trees: RwLock<HashMap<BonsaiPointer, BTreeMap<Vec<u8>, Vec<u8>>>>,
    next_file_id: AtomicI64,
    changed: Mutex<Vec<(Uuid, BonsaiPointer)>>,
}

impl MemoryCollectionManager {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            trees: RwLock::new(HashMap::new()),
            next_file_id: AtomicI64::new(1),
            changed: Mutex::new(Vec::new()),
        }
    }

    /// Inserts an entry directly; test seam for populating trees.
    pub fn put(&self, pointer: BonsaiPointer, key: Vec<u8>, value: Vec<u8>) -> CoreResult<()> {
        let mut trees = self.trees.write();
        let tree = trees
            .get_mut(&pointer)
            .ok_or_else(|| CoreError::invalid_operation("unknown collection pointer"))?;
        tree.insert(key, value);
        Ok(())
    }

    fn with_tree<T>(
        &self,
        pointer: BonsaiPointer,
        f: impl FnOnce(&BTreeMap<Vec<u8>, Vec<u8>>) -> T,
    ) -> CoreResult<T> {
        let trees = self.trees.read();
        let tree = trees
            .get(&pointer)
            .ok_or_else(|| CoreError::invalid_operation("unknown collection pointer"))?;
        Ok(f(tree))
    }
}

impl Default for MemoryCollectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CollectionManager for MemoryCollectionManager {
    fn create(&self, _cluster_id: i32) -> CoreResult<BonsaiPointer> {
        let pointer = BonsaiPointer::new(self.next_file_id.fetch_add(1, Ordering::SeqCst), 0, 0);
        self.trees.write().insert(pointer, BTreeMap::new());
        Ok(pointer)
    }

    fn get(&self, pointer: BonsaiPointer, key: &[u8]) -> CoreResult<Option<Vec<u8>>> {
        self.with_tree(pointer, |tree| tree.get(key).cloned())
    }

    fn first_key(&self, pointer: BonsaiPointer) -> CoreResult<Option<Vec<u8>>> {
        self.with_tree(pointer, |tree| tree.keys().next().cloned())
    }

    fn entries_major(
        &self,
        pointer: BonsaiPointer,
        key: &[u8],
        inclusive: bool,
        page_size: i32,
    ) -> CoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.with_tree(pointer, |tree| {
            tree.range(key.to_vec()..)
                .filter(|(k, _)| inclusive || k.as_slice() != key)
                .take(page_size.max(0) as usize)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
    }

    fn rid_bag_size(&self, pointer: BonsaiPointer, changes: &[u8]) -> CoreResult<i32> {
        let base = self.with_tree(pointer, |tree| tree.len() as i32)?;
        let delta = changes
            .get(..4)
            .map(|b| i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            .unwrap_or(0);
        Ok(base + delta)
    }

    fn changed_ids(&self) -> Vec<(Uuid, BonsaiPointer)> {
        self.changed.lock().clone()
    }

    fn clear_changed_ids(&self) {
        self.changed.lock().clear();
    }

    fn record_change(&self, id: Uuid, pointer: BonsaiPointer) {
        self.changed.lock().push((id, pointer));
    }
}
