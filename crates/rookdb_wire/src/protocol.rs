//! Protocol constants: opcodes, response statuses and version gates.
//!
//! Opcode numbers are stable; removing or renumbering one breaks every
//! deployed client.

/// Protocol version sent by the server as the first two bytes of a
/// connection, before any request is read.
pub const PROTOCOL_VERSION_CURRENT: i16 = 24;

/// Oldest protocol version the dispatcher still understands.
pub const PROTOCOL_VERSION_MIN: i16 = 7;

/// Request opcodes.
pub mod opcode {
    /// Authenticated server shutdown.
    pub const SHUTDOWN: u8 = 1;
    /// Server-level login without binding a database.
    pub const CONNECT: u8 = 2;
    /// Open a database and bind it to the session.
    pub const DB_OPEN: u8 = 3;
    /// Create a database.
    pub const DB_CREATE: u8 = 4;
    /// Close the bound database and end the session.
    pub const DB_CLOSE: u8 = 5;
    /// Existence check by name.
    pub const DB_EXIST: u8 = 6;
    /// Drop a database by name.
    pub const DB_DROP: u8 = 7;
    /// Size in bytes of the bound database.
    pub const DB_SIZE: u8 = 8;
    /// Record count of the bound database.
    pub const DB_COUNTRECORDS: u8 = 9;
    /// Add a cluster.
    pub const DATACLUSTER_ADD: u8 = 10;
    /// Drop a cluster by id.
    pub const DATACLUSTER_DROP: u8 = 11;
    /// Count elements of a set of clusters.
    pub const DATACLUSTER_COUNT: u8 = 12;
    /// First/last position range of a cluster.
    pub const DATACLUSTER_DATARANGE: u8 = 13;
    /// Record metadata (rid + version) without the payload.
    pub const RECORD_METADATA: u8 = 29;
    /// Load one record.
    pub const RECORD_LOAD: u8 = 30;
    /// Create one record.
    pub const RECORD_CREATE: u8 = 31;
    /// Update one record under MVCC.
    pub const RECORD_UPDATE: u8 = 32;
    /// Delete one record under MVCC.
    pub const RECORD_DELETE: u8 = 33;
    /// Positions strictly above a given one.
    pub const POSITIONS_HIGHER: u8 = 36;
    /// Positions strictly below a given one.
    pub const POSITIONS_LOWER: u8 = 37;
    /// Physically remove a record, leaving no tombstone.
    pub const RECORD_CLEAN_OUT: u8 = 38;
    /// Positions at or below a given one.
    pub const POSITIONS_FLOOR: u8 = 39;
    /// Legacy count request, rejected as deprecated.
    pub const COUNT: u8 = 40;
    /// Execute a compiled command.
    pub const COMMAND: u8 = 41;
    /// Positions at or above a given one.
    pub const POSITIONS_CEILING: u8 = 42;
    /// Hide a record without firing hooks.
    pub const RECORD_HIDE: u8 = 43;
    /// Commit a buffered transaction.
    pub const TX_COMMIT: u8 = 60;
    /// Read one server configuration key.
    pub const CONFIG_GET: u8 = 70;
    /// Write one server configuration key.
    pub const CONFIG_SET: u8 = 71;
    /// List all server configuration keys.
    pub const CONFIG_LIST: u8 = 72;
    /// Re-send the cluster layout of the bound database.
    pub const DB_RELOAD: u8 = 73;
    /// List databases known to the server.
    pub const DB_LIST: u8 = 74;
    /// Copy a database to a remote server.
    pub const DB_COPY: u8 = 90;
    /// Replication control (distributed deployments only).
    pub const REPLICATION: u8 = 91;
    /// Distributed cluster status.
    pub const CLUSTER: u8 = 92;
    /// Freeze the bound database.
    pub const DB_FREEZE: u8 = 94;
    /// Release a frozen database.
    pub const DB_RELEASE: u8 = 95;
    /// Freeze one cluster.
    pub const DATACLUSTER_FREEZE: u8 = 96;
    /// Release one frozen cluster.
    pub const DATACLUSTER_RELEASE: u8 = 97;
    /// Create a bonsai collection tree.
    pub const CREATE_SBTREE_BONSAI: u8 = 110;
    /// Point lookup in a bonsai tree.
    pub const SBTREE_BONSAI_GET: u8 = 111;
    /// First key of a bonsai tree.
    pub const SBTREE_BONSAI_FIRST_KEY: u8 = 112;
    /// Range scan of a bonsai tree from a key upward.
    pub const SBTREE_BONSAI_GET_ENTRIES_MAJOR: u8 = 113;
    /// Real size of a rid-bag given its pending change stream.
    pub const RIDBAG_GET_SIZE: u8 = 114;
}

/// Response status bytes.
pub mod status {
    /// Request succeeded; body follows.
    pub const OK: u8 = 0;
    /// Request failed; an error chain follows.
    pub const ERROR: u8 = 1;
}

/// Sub-frame markers for serialized identifiables inside result sets.
pub mod identifiable {
    /// A null entry.
    pub const NULL: i16 = -2;
    /// A bare RID without a record body.
    pub const RID_ONLY: i16 = -3;
    /// A full record: kind byte, RID, version, payload.
    pub const RECORD: i16 = 0;
}

/// Minimum protocol versions at which optional fields appear.
///
/// Each gate is load-bearing for bytewise compatibility: both encode and
/// decode must branch on the session's negotiated version.
pub mod proto {
    /// DB_OPEN/DB_CREATE carry a database type string.
    pub const DB_TYPE: i16 = 8;
    /// RECORD_LOAD carries the ignore-cache flag.
    pub const IGNORE_CACHE: i16 = 9;
    /// RECORD_CREATE carries a data-segment id (dropped again at 24).
    pub const DATA_SEGMENT_LOW: i16 = 10;
    /// First version without the data-segment id.
    pub const DATA_SEGMENT_HIGH: i16 = 24;
    /// RECORD_CREATE responses carry the new version.
    pub const CREATE_VERSION: i16 = 11;
    /// Cluster listings carry a legacy type/segment pair (dropped at 24).
    pub const CLUSTER_TYPE_LOW: i16 = 12;
    /// First version without the legacy cluster type/segment pair.
    pub const CLUSTER_TYPE_HIGH: i16 = 24;
    /// Tombstone flags on loads and cluster counts.
    pub const TOMBSTONES: i16 = 13;
    /// DB_OPEN responses carry the server version string.
    pub const SERVER_VERSION: i16 = 14;
    /// Database-management requests carry a storage type string.
    pub const STORAGE_TYPE: i16 = 16;
    /// Command responses carry a prefetched-record trailer.
    pub const COMMAND_PREFETCH: i16 = 17;
    /// Cluster adds may request an explicit cluster id.
    pub const CLUSTER_REQUESTED_ID: i16 = 18;
    /// Error frames carry a serialized exception blob.
    pub const ERROR_BLOB: i16 = 19;
    /// Write responses carry collection-pointer changes.
    pub const COLLECTION_CHANGES: i16 = 20;
    /// Bonsai range scans carry an explicit page size.
    pub const BONSAI_PAGE_SIZE: i16 = 21;
    /// Connection metadata carries the serializer name.
    pub const SERIALIZER_NAME: i16 = 22;
    /// RECORD_UPDATE carries the update-content flag.
    pub const UPDATE_CONTENT: i16 = 23;
}
