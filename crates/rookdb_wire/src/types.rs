//! Wire-level record types.

use std::fmt;

/// Position of a record inside its cluster.
///
/// Positions are fixed-width on the wire (8 bytes, big-endian). A negative
/// position marks a record that has not been assigned storage yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClusterPosition(pub i64);

impl ClusterPosition {
    /// Sentinel for records not yet placed in a cluster.
    pub const INVALID: Self = Self(-1);

    /// Serialized width in bytes.
    pub const SERIALIZED_SIZE: usize = 8;

    /// Creates a position from its raw value.
    #[must_use]
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self.0
    }

    /// True when the position refers to an allocated slot.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl fmt::Display for ClusterPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Record identifier: cluster id plus position within the cluster.
///
/// A RID with a non-negative cluster id and a valid position is persistent;
/// anything else identifies a record that has not been stored yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rid {
    /// Cluster the record lives in. `-1` when unassigned.
    pub cluster_id: i16,
    /// Position inside the cluster.
    pub position: ClusterPosition,
}

impl Rid {
    /// Cluster id sentinel for unassigned records.
    pub const CLUSTER_ID_INVALID: i16 = -1;

    /// Serialized width in bytes (i16 cluster + fixed-width position).
    pub const SERIALIZED_SIZE: usize = 2 + ClusterPosition::SERIALIZED_SIZE;

    /// Creates a RID.
    #[must_use]
    pub const fn new(cluster_id: i16, position: ClusterPosition) -> Self {
        Self {
            cluster_id,
            position,
        }
    }

    /// A RID that identifies nothing.
    #[must_use]
    pub const fn invalid() -> Self {
        Self::new(Self::CLUSTER_ID_INVALID, ClusterPosition::INVALID)
    }

    /// A new-record RID bound to a cluster but without a position yet.
    #[must_use]
    pub const fn for_cluster(cluster_id: i16) -> Self {
        Self::new(cluster_id, ClusterPosition::INVALID)
    }

    /// True when the RID refers to a stored record.
    #[must_use]
    pub const fn is_persistent(self) -> bool {
        self.cluster_id >= 0 && self.position.is_valid()
    }

    /// True when the record has not been stored yet.
    #[must_use]
    pub const fn is_new(self) -> bool {
        !self.is_persistent()
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}:{}", self.cluster_id, self.position)
    }
}

/// Version of a record, as checked by the MVCC write path.
///
/// Tracked counters start at zero for a fresh record and are bumped by
/// storage on every successful save. `Untracked` bypasses the MVCC check;
/// `Tombstone` marks a deleted record whose identity is retained.
///
/// Wire form is a single big-endian i32: counters are non-negative, `-1`
/// is untracked, `-2` is tombstone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordVersion {
    /// A counter participating in MVCC checks.
    Tracked(i32),
    /// Bypasses the MVCC check entirely.
    Untracked,
    /// Deletion marker; the record data is gone but the slot remembers it.
    Tombstone,
}

const WIRE_UNTRACKED: i32 = -1;
const WIRE_TOMBSTONE: i32 = -2;

impl RecordVersion {
    /// The version of a record that has never been saved.
    pub const NEW: Self = Self::Tracked(0);

    /// Decodes the wire representation.
    #[must_use]
    pub fn from_wire(raw: i32) -> Self {
        match raw {
            WIRE_TOMBSTONE => Self::Tombstone,
            n if n < 0 => Self::Untracked,
            n => Self::Tracked(n),
        }
    }

    /// Encodes to the wire representation.
    #[must_use]
    pub const fn to_wire(self) -> i32 {
        match self {
            Self::Tracked(n) => n,
            Self::Untracked => WIRE_UNTRACKED,
            Self::Tombstone => WIRE_TOMBSTONE,
        }
    }

    /// Returns the counter for tracked versions.
    #[must_use]
    pub const fn counter(self) -> Option<i32> {
        match self {
            Self::Tracked(n) => Some(n),
            _ => None,
        }
    }

    /// True for tracked counters.
    #[must_use]
    pub const fn is_tracked(self) -> bool {
        matches!(self, Self::Tracked(_))
    }

    /// True for the untracked marker.
    #[must_use]
    pub const fn is_untracked(self) -> bool {
        matches!(self, Self::Untracked)
    }

    /// True for the tombstone marker.
    #[must_use]
    pub const fn is_tombstone(self) -> bool {
        matches!(self, Self::Tombstone)
    }

    /// The version after one more successful save.
    #[must_use]
    pub const fn bumped(self) -> Self {
        match self {
            Self::Tracked(n) => Self::Tracked(n + 1),
            Self::Untracked => Self::Tracked(0),
            Self::Tombstone => Self::Tombstone,
        }
    }
}

impl fmt::Display for RecordVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tracked(n) => write!(f, "v{n}"),
            Self::Untracked => write!(f, "v?"),
            Self::Tombstone => write!(f, "v\u{2020}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rid_persistence() {
        assert!(Rid::new(9, ClusterPosition::new(4)).is_persistent());
        assert!(Rid::for_cluster(9).is_new());
        assert!(Rid::invalid().is_new());
        assert!(Rid::new(-1, ClusterPosition::new(3)).is_new());
    }

    #[test]
    fn rid_display() {
        let rid = Rid::new(9, ClusterPosition::new(12));
        assert_eq!(format!("{rid}"), "#9:12");
    }

    #[test]
    fn version_wire_roundtrip() {
        for v in [
            RecordVersion::Tracked(0),
            RecordVersion::Tracked(41),
            RecordVersion::Untracked,
            RecordVersion::Tombstone,
        ] {
            assert_eq!(RecordVersion::from_wire(v.to_wire()), v);
        }
    }

    #[test]
    fn version_bump() {
        assert_eq!(
            RecordVersion::Tracked(1).bumped(),
            RecordVersion::Tracked(2)
        );
        assert_eq!(RecordVersion::Untracked.bumped(), RecordVersion::Tracked(0));
        assert_eq!(RecordVersion::Tombstone.bumped(), RecordVersion::Tombstone);
    }
}
