//! The local record cache.
//!
//! A bounded RID-to-image map holding the most recent record seen per
//! identity. It is a hint, never authoritative: storage remains the
//! source of truth and the dispatcher clears the cache after every
//! request.

use crate::record::Record;
use parking_lot::Mutex;
use rookdb_wire::Rid;
use std::collections::HashMap;

/// Default capacity in entries.
const DEFAULT_CAPACITY: usize = 5_000;

struct CacheInner {
    records: HashMap<Rid, Record>,
    capacity: usize,
    enabled: bool,
}

/// Bounded map of the most recent record image per RID.
pub struct LocalRecordCache {
    inner: Mutex<CacheInner>,
}

impl LocalRecordCache {
    /// Creates a cache with the default capacity. Starts disabled until
    /// [`startup`](Self::startup) runs.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a cache bounded to `capacity` entries.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                records: HashMap::new(),
                capacity,
                enabled: false,
            }),
        }
    }

    /// Enables the cache.
    pub fn startup(&self) {
        self.inner.lock().enabled = true;
    }

    /// Clears and disables the cache.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.records.clear();
        inner.enabled = false;
    }

    /// Returns the cached image for a RID.
    #[must_use]
    pub fn find_record(&self, rid: Rid) -> Option<Record> {
        let inner = self.inner.lock();
        if !inner.enabled {
            return None;
        }
        inner.records.get(&rid).cloned()
    }

    /// Stores the image of a persistent record, evicting an arbitrary
    /// entry when full.
    pub fn update_record(&self, record: &Record) {
        if record.rid().is_new() {
            return;
        }
        let mut inner = self.inner.lock();
        if !inner.enabled {
            return;
        }
        if !inner.records.contains_key(&record.rid()) && inner.records.len() >= inner.capacity {
            if let Some(victim) = inner.records.keys().next().copied() {
                inner.records.remove(&victim);
            }
        }
        inner.records.insert(record.rid(), record.clone());
    }

    /// Drops the image for a RID.
    pub fn delete_record(&self, rid: Rid) {
        self.inner.lock().records.remove(&rid);
    }

    /// Drops every image.
    pub fn clear(&self) {
        self.inner.lock().records.clear();
    }

    /// Number of cached images.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    /// True when nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LocalRecordCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rookdb_wire::{ClusterPosition, RecordVersion};

    fn record_at(cluster: i16, position: i64) -> Record {
        let mut record = Record::with_bytes(Record::KIND_DOCUMENT, vec![position as u8]);
        record.fill(
            Rid::new(cluster, ClusterPosition::new(position)),
            RecordVersion::Tracked(1),
            vec![position as u8],
            false,
        );
        record
    }

    fn started_cache(capacity: usize) -> LocalRecordCache {
        let cache = LocalRecordCache::with_capacity(capacity);
        cache.startup();
        cache
    }

    #[test]
    fn disabled_cache_stores_nothing() {
        let cache = LocalRecordCache::new();
        cache.update_record(&record_at(1, 0));
        assert!(cache.find_record(Rid::new(1, ClusterPosition::new(0))).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn update_then_find() {
        let cache = started_cache(16);
        let record = record_at(1, 0);
        cache.update_record(&record);

        let found = cache.find_record(record.rid()).unwrap();
        assert_eq!(found.bytes(), record.bytes());
    }

    #[test]
    fn new_records_are_not_cached() {
        let cache = started_cache(16);
        cache.update_record(&Record::with_bytes(Record::KIND_DOCUMENT, vec![1]));
        assert!(cache.is_empty());
    }

    #[test]
    fn delete_evicts() {
        let cache = started_cache(16);
        let record = record_at(1, 0);
        cache.update_record(&record);
        cache.delete_record(record.rid());
        assert!(cache.find_record(record.rid()).is_none());
    }

    #[test]
    fn capacity_is_never_exceeded() {
        let cache = started_cache(4);
        for i in 0..32 {
            cache.update_record(&record_at(1, i));
            assert!(cache.len() <= 4);
        }
    }

    #[test]
    fn shutdown_clears_and_disables() {
        let cache = started_cache(16);
        cache.update_record(&record_at(1, 0));
        cache.shutdown();
        assert!(cache.is_empty());

        cache.update_record(&record_at(1, 1));
        assert!(cache.is_empty());
    }
}
