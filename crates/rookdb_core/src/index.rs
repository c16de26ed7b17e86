//! Index manager contract and modification locking.
//!
//! Index internals (trees, key types, rebuilds) belong to an external
//! collaborator. The engine only needs to know which indexes cover a
//! cluster so it can serialise record writes against index rebuilds:
//! locks are taken in lexicographic index-name order so that two
//! concurrent saves can never deadlock against each other.

use parking_lot::{Mutex, MutexGuard};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// A named index with a modification lock.
#[derive(Debug)]
pub struct Index {
    name: String,
    modification_lock: Mutex<()>,
}

impl Index {
    /// Creates an index.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            modification_lock: Mutex::new(()),
        }
    }

    /// Index name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Blocks until the modification lock is granted.
    pub fn lock_modification(&self) -> MutexGuard<'_, ()> {
        self.modification_lock.lock()
    }
}

/// Supplies the indexes covering a cluster.
pub trait IndexManager: Send + Sync {
    /// Indexes that must be locked while a record in the cluster changes.
    fn indexes_for_cluster(&self, cluster_id: i16) -> Vec<Arc<Index>>;
}

/// In-memory index registry.
pub struct MemoryIndexManager {
    by_cluster: RwLock<HashMap<i16, Vec<Arc<Index>>>>,
}

impl MemoryIndexManager {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_cluster: RwLock::new(HashMap::new()),
        }
    }

    /// Registers an index over a cluster.
    pub fn register(&self, cluster_id: i16, index: Arc<Index>) {
        self.by_cluster
            .write()
            .entry(cluster_id)
            .or_default()
            .push(index);
    }
}

impl Default for MemoryIndexManager {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexManager for MemoryIndexManager {
    fn indexes_for_cluster(&self, cluster_id: i16) -> Vec<Arc<Index>> {
        self.by_cluster
            .read()
            .get(&cluster_id)
            .cloned()
            .unwrap_or_default()
    }
}

/// Sorts indexes into the canonical locking order.
pub(crate) fn lock_order(mut indexes: Vec<Arc<Index>>) -> Vec<Arc<Index>> {
    indexes.sort_by(|a, b| a.name().cmp(b.name()));
    indexes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_order_is_lexicographic() {
        let indexes = vec![
            Arc::new(Index::new("users.name")),
            Arc::new(Index::new("accounts.id")),
            Arc::new(Index::new("users.email")),
        ];

        let ordered = lock_order(indexes);
        let names: Vec<&str> = ordered.iter().map(|i| i.name()).collect();
        assert_eq!(names, ["accounts.id", "users.email", "users.name"]);

        for pair in names.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
    }

    #[test]
    fn registry_returns_cluster_indexes() {
        let manager = MemoryIndexManager::new();
        manager.register(9, Arc::new(Index::new("demo.k")));

        assert_eq!(manager.indexes_for_cluster(9).len(), 1);
        assert!(manager.indexes_for_cluster(4).is_empty());
    }

    #[test]
    fn modification_lock_is_exclusive() {
        let index = Arc::new(Index::new("demo.k"));
        let guard = index.lock_modification();

        let contender = Arc::clone(&index);
        let handle = std::thread::spawn(move || {
            let _guard = contender.lock_modification();
        });

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!handle.is_finished());

        drop(guard);
        handle.join().unwrap();
    }
}
