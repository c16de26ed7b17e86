//! Per-connection session state.

use parking_lot::{Mutex, RwLock};
use rookdb_core::Database;
use rookdb_wire::protocol::PROTOCOL_VERSION_CURRENT;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Connection metadata and per-request counters.
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    /// Client driver name.
    pub driver_name: String,
    /// Client driver version.
    pub driver_version: String,
    /// Negotiated protocol version.
    pub protocol_version: i16,
    /// Client-supplied identifier.
    pub client_id: Option<String>,
    /// Record serializer negotiated for this connection.
    pub serializer: String,
    /// Requests served on this session.
    pub total_requests: u64,
    /// What the session is doing right now.
    pub command_info: String,
    /// Free-form detail of the current command.
    pub command_detail: String,
    /// Info of the previously completed command.
    pub last_command_info: String,
    /// Detail of the previously completed command.
    pub last_command_detail: String,
    /// When the current command arrived.
    pub last_command_received: Option<Instant>,
    /// How long the previous command took.
    pub last_command_duration: Option<Duration>,
    /// Total time spent in commands.
    pub total_command_duration: Duration,
}

impl Default for ConnectionStats {
    fn default() -> Self {
        Self {
            driver_name: String::new(),
            driver_version: String::new(),
            protocol_version: PROTOCOL_VERSION_CURRENT,
            client_id: None,
            serializer: rookdb_core::DEFAULT_SERIALIZER.to_string(),
            total_requests: 0,
            command_info: "Listening".to_string(),
            command_detail: "-".to_string(),
            last_command_info: String::new(),
            last_command_detail: String::new(),
            last_command_received: None,
            last_command_duration: None,
            total_command_duration: Duration::ZERO,
        }
    }
}

/// One client connection's server-side state.
pub struct Session {
    id: i32,
    /// Connection metadata and counters.
    pub stats: ConnectionStats,
    /// Database bound by DB_OPEN, if any.
    pub database: Option<Arc<Database>>,
    /// Server-level principal established by CONNECT.
    pub server_user: Option<String>,
}

impl Session {
    fn new(id: i32) -> Self {
        Self {
            id,
            stats: ConnectionStats::default(),
            database: None,
            server_user: None,
        }
    }

    /// Session id, as carried in every request envelope.
    #[must_use]
    pub fn id(&self) -> i32 {
        self.id
    }
}

/// Registry of live sessions. Ids are positive and never reused.
pub struct SessionManager {
    sessions: RwLock<HashMap<i32, Arc<Mutex<Session>>>>,
    next_id: AtomicI32,
}

impl SessionManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicI32::new(1),
        }
    }

    /// Creates and registers a new session.
    pub fn connect(&self) -> Arc<Mutex<Session>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(Mutex::new(Session::new(id)));
        self.sessions.write().insert(id, Arc::clone(&session));
        session
    }

    /// Looks a session up by id.
    #[must_use]
    pub fn get(&self, id: i32) -> Option<Arc<Mutex<Session>>> {
        self.sessions.read().get(&id).cloned()
    }

    /// Removes a session, closing its database.
    pub fn disconnect(&self, id: i32) -> bool {
        let removed = self.sessions.write().remove(&id);
        if let Some(session) = &removed {
            if let Some(db) = session.lock().database.take() {
                db.close();
            }
        }
        removed.is_some()
    }

    /// Forcefully removes a session after a fatal connection error.
    pub fn kill(&self, id: i32) {
        self.disconnect(id);
    }

    /// Number of live sessions.
    #[must_use]
    pub fn count(&self) -> usize {
        self.sessions.read().len()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}
