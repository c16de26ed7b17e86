//! The transaction buffer.
//!
//! Buffers created, updated and deleted records by RID until commit
//! replays them against storage. Creates keep their enqueue order so the
//! server assigns identities deterministically; an update that follows a
//! create of the same RID collapses into the create, which then carries
//! the final payload.

use crate::record::Record;
use rookdb_wire::{RecordVersion, Rid};
use std::collections::{HashMap, HashSet};

/// A buffered create, in enqueue order.
#[derive(Debug, Clone)]
pub(crate) struct CreatedEntry {
    /// Client-side identity at enqueue time.
    pub client_rid: Rid,
    /// The record to store.
    pub record: Record,
    /// True when an update collapsed into this create.
    pub also_updated: bool,
}

/// A buffered update.
#[derive(Debug, Clone)]
pub(crate) struct UpdatedEntry {
    pub record: Record,
}

/// Result of looking a RID up in the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxLookup {
    /// The RID is untouched by this transaction.
    Miss,
    /// The RID was written in this transaction; here is its image.
    Found(Record),
    /// The RID was deleted in this transaction.
    Deleted,
}

/// In-memory buffer of one transaction's operations.
#[derive(Debug, Default)]
pub struct TxBuffer {
    id: i32,
    active: bool,
    created: Vec<CreatedEntry>,
    created_index: HashMap<Rid, usize>,
    updated: HashMap<Rid, UpdatedEntry>,
    updated_order: Vec<Rid>,
    deleted: HashMap<Rid, RecordVersion>,
}

impl TxBuffer {
    /// Creates an inactive buffer.
    #[must_use]
    pub fn new(id: i32) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// Transaction id as sent by the client.
    #[must_use]
    pub fn id(&self) -> i32 {
        self.id
    }

    /// Starts the transaction.
    pub fn begin(&mut self) {
        self.active = true;
    }

    /// True between `begin` and commit/rollback.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Marks the transaction finished.
    pub(crate) fn finish(&mut self) {
        self.active = false;
    }

    /// Looks up a RID against the buffer.
    #[must_use]
    pub fn record(&self, rid: Rid) -> TxLookup {
        if self.deleted.contains_key(&rid) {
            return TxLookup::Deleted;
        }
        if let Some(index) = self.created_index.get(&rid) {
            return TxLookup::Found(self.created[*index].record.clone());
        }
        if let Some(entry) = self.updated.get(&rid) {
            return TxLookup::Found(entry.record.clone());
        }
        TxLookup::Miss
    }

    /// Buffers a create. The record's RID at enqueue time is the
    /// client-side identity reported back after commit.
    pub fn create(&mut self, record: Record) {
        let rid = record.rid();
        self.deleted.remove(&rid);
        self.created_index.insert(rid, self.created.len());
        self.created.push(CreatedEntry {
            client_rid: rid,
            record,
            also_updated: false,
        });
    }

    /// Buffers an update. An update of a RID created in this transaction
    /// collapses into the create.
    pub fn update(&mut self, record: Record) {
        let rid = record.rid();
        if let Some(index) = self.created_index.get(&rid) {
            let entry = &mut self.created[*index];
            entry.record.set_bytes(record.bytes().to_vec());
            entry.also_updated = true;
            return;
        }
        if !self.updated.contains_key(&rid) {
            self.updated_order.push(rid);
        }
        self.updated.insert(rid, UpdatedEntry { record });
    }

    /// Buffers a delete. Deleting a RID created in this transaction
    /// cancels the create instead.
    pub fn delete(&mut self, rid: Rid, version: RecordVersion) {
        if let Some(index) = self.created_index.remove(&rid) {
            self.created.remove(index);
            for slot in self.created_index.values_mut() {
                if *slot > index {
                    *slot -= 1;
                }
            }
            return;
        }
        if self.updated.remove(&rid).is_some() {
            self.updated_order.retain(|r| *r != rid);
        }
        self.deleted.insert(rid, version);
    }

    /// Buffered creates in enqueue order.
    pub(crate) fn created_entries(&self) -> &[CreatedEntry] {
        &self.created
    }

    /// Buffered updates in enqueue order.
    pub(crate) fn updated_entries(&self) -> Vec<(Rid, Record)> {
        self.updated_order
            .iter()
            .filter_map(|rid| self.updated.get(rid).map(|e| (*rid, e.record.clone())))
            .collect()
    }

    /// Buffered deletes with the versions the client carried.
    pub(crate) fn deleted_entries(&self) -> Vec<(Rid, RecordVersion)> {
        self.deleted.iter().map(|(r, v)| (*r, *v)).collect()
    }

    /// Number of buffered operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }

    /// True when nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discards every buffered operation and deactivates the buffer.
    pub fn clear(&mut self) {
        self.created.clear();
        self.created_index.clear();
        self.updated.clear();
        self.updated_order.clear();
        self.deleted.clear();
        self.active = false;
    }

    /// RIDs deleted by this transaction.
    #[must_use]
    pub fn deleted_rids(&self) -> HashSet<Rid> {
        self.deleted.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rookdb_wire::ClusterPosition;

    fn new_record(cluster: i16, temp_position: i64, bytes: Vec<u8>) -> Record {
        let mut record = Record::with_bytes(Record::KIND_DOCUMENT, bytes);
        record.set_identity(Rid::new(cluster, ClusterPosition::new(temp_position)));
        record
    }

    #[test]
    fn deleted_lookup_short_circuits() {
        let mut tx = TxBuffer::new(1);
        tx.begin();
        let rid = Rid::new(9, ClusterPosition::new(4));
        tx.delete(rid, RecordVersion::Tracked(1));

        assert_eq!(tx.record(rid), TxLookup::Deleted);
    }

    #[test]
    fn created_lookup_returns_image() {
        let mut tx = TxBuffer::new(1);
        tx.begin();
        let record = new_record(9, -2, vec![1, 2]);
        let rid = record.rid();
        tx.create(record);

        match tx.record(rid) {
            TxLookup::Found(found) => assert_eq!(found.bytes(), &[1, 2]),
            other => panic!("expected Found, got {other:?}"),
        }
    }

    #[test]
    fn update_after_create_collapses() {
        let mut tx = TxBuffer::new(1);
        tx.begin();
        let record = new_record(9, -2, vec![1]);
        let rid = record.rid();
        tx.create(record);

        let mut updated = new_record(9, -2, vec![9, 9]);
        updated.set_identity(rid);
        tx.update(updated);

        assert_eq!(tx.created_entries().len(), 1);
        assert!(tx.updated_entries().is_empty());
        let entry = &tx.created_entries()[0];
        assert!(entry.also_updated);
        assert_eq!(entry.record.bytes(), &[9, 9]);
    }

    #[test]
    fn delete_after_create_cancels() {
        let mut tx = TxBuffer::new(1);
        tx.begin();
        let record = new_record(9, -2, vec![1]);
        let rid = record.rid();
        tx.create(record);
        tx.delete(rid, RecordVersion::Untracked);

        assert!(tx.created_entries().is_empty());
        // Not reported as deleted either: storage never saw it.
        assert_eq!(tx.record(rid), TxLookup::Miss);
    }

    #[test]
    fn creates_keep_enqueue_order() {
        let mut tx = TxBuffer::new(1);
        tx.begin();
        for i in 0..4 {
            tx.create(new_record(9, -(i + 2), vec![i as u8]));
        }

        let order: Vec<i64> = tx
            .created_entries()
            .iter()
            .map(|e| e.client_rid.position.as_i64())
            .collect();
        assert_eq!(order, vec![-2, -3, -4, -5]);
    }

    #[test]
    fn clear_resets_everything() {
        let mut tx = TxBuffer::new(1);
        tx.begin();
        tx.create(new_record(9, -2, vec![1]));
        tx.delete(Rid::new(9, ClusterPosition::new(1)), RecordVersion::Tracked(1));

        tx.clear();
        assert!(tx.is_empty());
        assert!(!tx.is_active());
    }
}
