//! The in-memory record representation.

use rookdb_wire::{ClusterPosition, RecordVersion, Rid};

/// Lifecycle status of a record instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    /// Identity known, payload not fetched.
    NotLoaded,
    /// Payload present and consistent with storage.
    Loaded,
    /// Being serialized for a save; transient.
    Marshalling,
}

/// A record: identity, version, kind byte and raw payload.
///
/// The payload bytes are opaque to the engine; the record serializer that
/// produces and interprets them is an external collaborator. A dirty
/// record must carry a non-empty payload before it can be saved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    rid: Rid,
    version: RecordVersion,
    kind: u8,
    bytes: Vec<u8>,
    class: Option<String>,
    dirty: bool,
    content_changed: bool,
    status: RecordStatus,
}

impl Record {
    /// Kind byte for schemaless flat records.
    pub const KIND_FLAT: u8 = b'b';
    /// Kind byte for document records.
    pub const KIND_DOCUMENT: u8 = b'd';

    /// Creates an empty, unplaced record of the given kind.
    #[must_use]
    pub fn new(kind: u8) -> Self {
        Self {
            rid: Rid::invalid(),
            version: RecordVersion::NEW,
            kind,
            bytes: Vec::new(),
            class: None,
            dirty: false,
            content_changed: false,
            status: RecordStatus::NotLoaded,
        }
    }

    /// Creates a dirty record carrying a payload, ready to be saved.
    #[must_use]
    pub fn with_bytes(kind: u8, bytes: Vec<u8>) -> Self {
        let mut record = Self::new(kind);
        record.bytes = bytes;
        record.dirty = true;
        record.content_changed = true;
        record.status = RecordStatus::Loaded;
        record
    }

    /// Fills identity, version and payload in one shot, clearing or setting
    /// the dirty flag as requested.
    pub fn fill(&mut self, rid: Rid, version: RecordVersion, bytes: Vec<u8>, dirty: bool) {
        self.rid = rid;
        self.version = version;
        self.bytes = bytes;
        self.dirty = dirty;
        if !dirty {
            self.content_changed = false;
        }
        self.status = RecordStatus::Loaded;
    }

    /// Returns the record identity.
    #[must_use]
    pub fn rid(&self) -> Rid {
        self.rid
    }

    /// Rebinds the identity. Used when storage assigns the final RID.
    pub fn set_identity(&mut self, rid: Rid) {
        self.rid = rid;
    }

    /// Rebinds the identity from parts.
    pub fn set_identity_parts(&mut self, cluster_id: i16, position: ClusterPosition) {
        self.rid = Rid::new(cluster_id, position);
    }

    /// Returns the record version.
    #[must_use]
    pub fn version(&self) -> RecordVersion {
        self.version
    }

    /// Sets the record version.
    pub fn set_version(&mut self, version: RecordVersion) {
        self.version = version;
    }

    /// Returns the kind byte.
    #[must_use]
    pub fn kind(&self) -> u8 {
        self.kind
    }

    /// Returns the raw payload.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Replaces the payload and marks the record dirty.
    pub fn set_bytes(&mut self, bytes: Vec<u8>) {
        self.bytes = bytes;
        self.dirty = true;
        self.content_changed = true;
    }

    /// Declared class of a document record, if any.
    #[must_use]
    pub fn class(&self) -> Option<&str> {
        self.class.as_deref()
    }

    /// Declares the class of a document record.
    pub fn set_class(&mut self, class: impl Into<String>) {
        self.class = Some(class.into());
    }

    /// True when the record has unsaved changes.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Marks the record dirty.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Clears the dirty flag without touching the payload.
    pub fn unset_dirty(&mut self) {
        self.dirty = false;
    }

    /// True when the payload itself changed (as opposed to metadata only).
    #[must_use]
    pub fn is_content_changed(&self) -> bool {
        self.content_changed
    }

    /// Sets the content-changed flag.
    pub fn set_content_changed(&mut self, changed: bool) {
        self.content_changed = changed;
    }

    /// Returns the lifecycle status.
    #[must_use]
    pub fn status(&self) -> RecordStatus {
        self.status
    }

    /// Sets the lifecycle status.
    pub fn set_status(&mut self, status: RecordStatus) {
        self.status = status;
    }

    /// True when the version marks this record deleted.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.version.is_tombstone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_record_is_unplaced() {
        let record = Record::new(Record::KIND_DOCUMENT);
        assert!(record.rid().is_new());
        assert_eq!(record.version(), RecordVersion::Tracked(0));
        assert!(!record.is_dirty());
        assert_eq!(record.status(), RecordStatus::NotLoaded);
    }

    #[test]
    fn with_bytes_is_dirty() {
        let record = Record::with_bytes(Record::KIND_DOCUMENT, vec![1, 2]);
        assert!(record.is_dirty());
        assert!(record.is_content_changed());
        assert_eq!(record.bytes(), &[1, 2]);
    }

    #[test]
    fn fill_clears_dirty() {
        let mut record = Record::with_bytes(Record::KIND_FLAT, vec![1]);
        let rid = Rid::new(3, ClusterPosition::new(7));
        record.fill(rid, RecordVersion::Tracked(1), vec![9], false);

        assert_eq!(record.rid(), rid);
        assert_eq!(record.version(), RecordVersion::Tracked(1));
        assert_eq!(record.bytes(), &[9]);
        assert!(!record.is_dirty());
        assert!(!record.is_content_changed());
        assert_eq!(record.status(), RecordStatus::Loaded);
    }

    #[test]
    fn set_bytes_marks_dirty() {
        let mut record = Record::new(Record::KIND_DOCUMENT);
        record.fill(
            Rid::new(1, ClusterPosition::new(1)),
            RecordVersion::Tracked(1),
            vec![1],
            false,
        );
        record.set_bytes(vec![2]);
        assert!(record.is_dirty());
    }
}
