//! The protocol dispatcher: one instance per accepted connection.
//!
//! The dispatcher announces the server protocol version, then loops
//! reading `[opcode][session id][body]` request envelopes. Responses are
//! composed under the channel write lock and flushed before the lock is
//! released; handler failures become error frames, socket failures drop
//! the connection.

use crate::command::CommandOutcome;
use crate::error::{ServerError, ServerResult};
use crate::server::ServerContext;
use crate::session::Session;
use parking_lot::Mutex;
use rookdb_core::{
    BonsaiPointer, CollectionManager, Database, LockingStrategy, OperationMode, Record, TxBuffer,
};
use rookdb_wire::protocol::{identifiable, opcode, proto, status, PROTOCOL_VERSION_CURRENT};
use rookdb_wire::{BinaryChannel, ChannelLock, Rid, WireError};
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Transaction operation codes inside a TX_COMMIT body.
const TX_OP_UPDATED: u8 = 1;
const TX_OP_DELETED: u8 = 2;
const TX_OP_CREATED: u8 = 3;

/// Serves the binary protocol over one duplex stream.
pub struct Dispatcher<S> {
    context: Arc<ServerContext>,
    channel: BinaryChannel<S>,
    lock: Arc<ChannelLock>,
    session: Option<Arc<Mutex<Session>>>,
    request_session_id: i32,
    disconnect: bool,
}

impl<S: Read + Write> Dispatcher<S> {
    /// Wraps a connection.
    pub fn new(context: Arc<ServerContext>, stream: S) -> Self {
        Self {
            context,
            channel: BinaryChannel::new(stream),
            lock: Arc::new(ChannelLock::new()),
            session: None,
            request_session_id: -1,
            disconnect: false,
        }
    }

    /// Runs the connection until the peer disconnects, the session is
    /// closed, or a fatal error occurs.
    pub fn serve(&mut self) -> ServerResult<()> {
        // The protocol version goes out before any request is read.
        self.channel.write_short(PROTOCOL_VERSION_CURRENT)?;
        self.channel.flush()?;

        loop {
            if self.disconnect || self.context.is_shutdown() {
                return Ok(());
            }

            let request_type = match self.channel.read_byte() {
                Ok(byte) => byte,
                Err(e) if e.is_disconnect() => return Ok(()),
                Err(e) => return Err(self.abort_connection(e.into())),
            };
            self.request_session_id = match self.channel.read_int() {
                Ok(id) => id,
                Err(e) => return Err(self.abort_connection(e.into())),
            };
            let started = Instant::now();

            if let Err(e) = self.on_before_request(request_type) {
                let _ = self.send_error(&e);
                return Err(e);
            }

            match self.execute_request(request_type) {
                Ok(true) => {}
                Ok(false) => {
                    self.set_command_info("Command not supported");
                    self.send_error(&ServerError::NotSupported(request_type))?;
                }
                Err(e) if e.is_fatal() => return Err(self.abort_connection(e)),
                Err(e) => {
                    self.clear_collection_changes();
                    debug!(opcode = request_type, error = %e, "request failed");
                    self.send_error(&e)?;
                }
            }

            self.on_after_request(started);
        }
    }

    /// A socket-level failure: roll back request residue, release the
    /// write lock if this thread still holds it, and surface the error.
    fn abort_connection(&mut self, e: ServerError) -> ServerError {
        self.clear_collection_changes();
        if self.lock.held_by_current_thread() {
            self.lock.release();
        }
        if let Some(session) = &self.session {
            let id = session.lock().id();
            self.context.sessions.kill(id);
        }
        warn!(error = %e, "connection aborted");
        e
    }

    // Request envelope ------------------------------------------------------

    fn on_before_request(&mut self, request_type: u8) -> ServerResult<()> {
        self.context.wait_node_online();

        if self.request_session_id >= 0 {
            match self.context.sessions.get(self.request_session_id) {
                Some(session) => self.session = Some(session),
                None => {
                    if request_type != opcode::DB_CLOSE && request_type != opcode::SHUTDOWN {
                        debug!(
                            session = self.request_session_id,
                            "unknown session, dropping connection"
                        );
                        self.disconnect = true;
                        return Err(ServerError::UnknownSession(self.request_session_id));
                    }
                    self.session = None;
                }
            }
        } else {
            // A handshake request: establish a session, carrying over the
            // protocol version negotiated by an earlier handshake on this
            // connection if any.
            let prior_proto = self
                .session
                .as_ref()
                .map(|s| s.lock().stats.protocol_version);
            let session = self.context.sessions.connect();
            if let Some(proto_version) = prior_proto {
                session.lock().stats.protocol_version = proto_version;
            }
            self.session = Some(session);
        }

        if let Some(session) = &self.session {
            let mut session = session.lock();
            session.stats.total_requests += 1;
            session.stats.command_info = "Listening".to_string();
            session.stats.command_detail = "-".to_string();
            session.stats.last_command_received = Some(Instant::now());
        }
        Ok(())
    }

    fn on_after_request(&mut self, started: Instant) {
        if let Some(session) = &self.session {
            let mut session = session.lock();
            if let Some(db) = &session.database {
                if db.is_open() {
                    // Command results are per-request; a reused connection
                    // must not observe a previous request's cache.
                    db.local_cache().clear();
                }
            }
            let elapsed = started.elapsed();
            session.stats.last_command_duration = Some(elapsed);
            session.stats.total_command_duration += elapsed;
            session.stats.last_command_info = session.stats.command_info.clone();
            session.stats.last_command_detail = session.stats.command_detail.clone();
            session.stats.command_info = "Listening".to_string();
            session.stats.command_detail = "-".to_string();
        }
    }

    fn execute_request(&mut self, request_type: u8) -> ServerResult<bool> {
        match request_type {
            opcode::SHUTDOWN => self.shutdown_server()?,
            opcode::CONNECT => self.connect()?,
            opcode::DB_LIST => self.list_databases()?,
            opcode::DB_OPEN => self.open_database()?,
            opcode::DB_RELOAD => self.reload_database()?,
            opcode::DB_CREATE => self.create_database()?,
            opcode::DB_CLOSE => self.close_database()?,
            opcode::DB_EXIST => self.exists_database()?,
            opcode::DB_DROP => self.drop_database()?,
            opcode::DB_SIZE => self.size_database()?,
            opcode::DB_COUNTRECORDS => self.count_database_records()?,
            opcode::DB_COPY => self.copy_database()?,
            opcode::REPLICATION => self.replication()?,
            opcode::CLUSTER => self.distributed_cluster()?,
            opcode::DATACLUSTER_COUNT => self.count_clusters()?,
            opcode::DATACLUSTER_DATARANGE => self.range_cluster()?,
            opcode::DATACLUSTER_ADD => self.add_cluster()?,
            opcode::DATACLUSTER_DROP => self.remove_cluster()?,
            opcode::RECORD_METADATA => self.read_record_metadata()?,
            opcode::RECORD_LOAD => self.read_record()?,
            opcode::RECORD_CREATE => self.create_record()?,
            opcode::RECORD_UPDATE => self.update_record()?,
            opcode::RECORD_DELETE => self.delete_record()?,
            opcode::RECORD_HIDE => self.hide_record()?,
            opcode::POSITIONS_HIGHER => self.positions(PositionQuery::Higher)?,
            opcode::POSITIONS_CEILING => self.positions(PositionQuery::Ceiling)?,
            opcode::POSITIONS_LOWER => self.positions(PositionQuery::Lower)?,
            opcode::POSITIONS_FLOOR => self.positions(PositionQuery::Floor)?,
            opcode::COUNT => return Err(ServerError::Deprecated("COUNT")),
            opcode::COMMAND => self.command()?,
            opcode::TX_COMMIT => self.commit_transaction()?,
            opcode::CONFIG_GET => self.config_get()?,
            opcode::CONFIG_SET => self.config_set()?,
            opcode::CONFIG_LIST => self.config_list()?,
            opcode::DB_FREEZE => self.freeze_database()?,
            opcode::DB_RELEASE => self.release_database()?,
            opcode::DATACLUSTER_FREEZE => self.freeze_cluster()?,
            opcode::DATACLUSTER_RELEASE => self.release_cluster()?,
            opcode::RECORD_CLEAN_OUT => self.clean_out_record()?,
            opcode::CREATE_SBTREE_BONSAI => self.create_sbtree_bonsai()?,
            opcode::SBTREE_BONSAI_GET => self.sbtree_bonsai_get()?,
            opcode::SBTREE_BONSAI_FIRST_KEY => self.sbtree_bonsai_first_key()?,
            opcode::SBTREE_BONSAI_GET_ENTRIES_MAJOR => self.sbtree_bonsai_entries_major()?,
            opcode::RIDBAG_GET_SIZE => self.rid_bag_size()?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    // Response framing ------------------------------------------------------

    fn respond(&mut self, f: impl FnOnce(&mut Self) -> ServerResult<()>) -> ServerResult<()> {
        let lock = Arc::clone(&self.lock);
        lock.acquire();
        let result = f(self);
        let flushed = self.channel.flush().map_err(ServerError::from);
        lock.release();
        result.and(flushed)
    }

    fn send_ok(&mut self) -> ServerResult<()> {
        self.channel.write_byte(status::OK)?;
        self.channel.write_int(self.request_session_id)?;
        Ok(())
    }

    fn send_error(&mut self, error: &ServerError) -> ServerResult<()> {
        let lock = Arc::clone(&self.lock);
        lock.acquire();
        let result: Result<(), WireError> = (|| {
            self.channel.write_byte(status::ERROR)?;
            self.channel.write_int(self.request_session_id)?;

            self.channel.write_byte(1)?;
            self.channel.write_string(error.class_name())?;
            self.channel.write_string(&error.to_string())?;

            let mut cause = std::error::Error::source(error);
            while let Some(current) = cause {
                self.channel.write_byte(1)?;
                self.channel.write_string("DatabaseError")?;
                self.channel.write_string(&current.to_string())?;
                cause = current.source();
            }
            self.channel.write_byte(0)?;

            if self.proto() >= proto::ERROR_BLOB {
                self.channel.write_bytes(error.to_string().as_bytes())?;
            }
            self.channel.flush()
        })();
        lock.release();
        result.map_err(ServerError::from)
    }

    // Session helpers -------------------------------------------------------

    fn proto(&self) -> i16 {
        self.session
            .as_ref()
            .map(|s| s.lock().stats.protocol_version)
            .unwrap_or(PROTOCOL_VERSION_CURRENT)
    }

    fn set_command_info(&self, info: &str) {
        if let Some(session) = &self.session {
            session.lock().stats.command_info = info.to_string();
        }
    }

    fn session(&self) -> ServerResult<Arc<Mutex<Session>>> {
        self.session
            .clone()
            .ok_or(ServerError::UnknownSession(self.request_session_id))
    }

    fn database(&self) -> ServerResult<Arc<Database>> {
        let session = self.session()?;
        let id = session.lock().id();
        let database = session.lock().database.clone();
        database.ok_or(ServerError::NoDatabase(id))
    }

    fn check_server_access(&self, resource: &str) -> ServerResult<()> {
        let session = self.session()?;
        let user = session.lock().server_user.clone();
        match user {
            Some(_) => Ok(()),
            None => Err(ServerError::ServerAccess {
                user: "<anonymous>".to_string(),
                resource: resource.to_string(),
            }),
        }
    }

    fn clear_collection_changes(&self) {
        if let Some(session) = &self.session {
            if let Some(db) = &session.lock().database {
                if let Some(cm) = db.collection_manager() {
                    cm.clear_changed_ids();
                }
            }
        }
    }

    fn read_connection_data(&mut self) -> ServerResult<()> {
        let driver_name = self.channel.read_string()?.unwrap_or_default();
        let driver_version = self.channel.read_string()?.unwrap_or_default();
        let protocol_version = self.channel.read_short()?;
        let client_id = self.channel.read_string()?;
        let serializer = if protocol_version >= proto::SERIALIZER_NAME {
            self.channel
                .read_string()?
                .unwrap_or_else(|| rookdb_core::DEFAULT_SERIALIZER.to_string())
        } else {
            rookdb_core::DEFAULT_SERIALIZER.to_string()
        };

        let session = self.session()?;
        let mut session = session.lock();
        session.stats.driver_name = driver_name;
        session.stats.driver_version = driver_version;
        session.stats.protocol_version = protocol_version;
        session.stats.client_id = client_id.filter(|id| !id.is_empty());
        session.stats.serializer = serializer;
        Ok(())
    }

    fn require_string(&mut self, field: &str) -> ServerResult<String> {
        self.channel
            .read_string()?
            .ok_or_else(|| ServerError::invalid_request(format!("missing {field}")))
    }

    // Connection handlers ---------------------------------------------------

    fn shutdown_server(&mut self) -> ServerResult<()> {
        self.set_command_info("Shutdowning");

        let user = self.require_string("user")?;
        let password = self.require_string("password")?;

        if user != self.context.config.root_user || password != self.context.config.root_password {
            warn!("authentication error on shutdown request, aborting");
            return Err(ServerError::ServerAccess {
                user,
                resource: "shutdown".to_string(),
            });
        }

        info!("received shutdown command from an authenticated client");
        self.respond(Self::send_ok)?;
        self.context.request_shutdown();
        self.disconnect = true;
        Ok(())
    }

    fn connect(&mut self) -> ServerResult<()> {
        self.set_command_info("Connect");
        self.read_connection_data()?;

        let user = self.require_string("user")?;
        let password = self.require_string("password")?;
        self.context.server_login(&user, &password, "connect")?;

        let session = self.session()?;
        let session_id = {
            let mut session = session.lock();
            session.server_user = Some(user);
            session.id()
        };

        self.respond(|d| {
            d.send_ok()?;
            d.channel.write_int(session_id)?;
            Ok(())
        })
    }

    fn open_database(&mut self) -> ServerResult<()> {
        self.set_command_info("Open database");
        self.read_connection_data()?;

        let db_name = self.require_string("database name")?;
        let _db_type = if self.proto() >= proto::DB_TYPE {
            self.channel.read_string()?
        } else {
            None
        };
        let user = self.require_string("user")?;
        let password = self.require_string("password")?;

        let db = self.context.open_database(&db_name)?;
        db.open(&user, &password)?;

        let session = self.session()?;
        let session_id = {
            let mut session = session.lock();
            db.set_serializer(session.stats.serializer.clone());
            session.database = Some(Arc::clone(&db));
            session.id()
        };

        self.respond(|d| {
            d.send_ok()?;
            d.channel.write_int(session_id)?;
            d.send_database_info(&db)?;
            // Distributed configuration: none on a standalone server.
            d.channel.write_opt_bytes(None)?;
            if d.proto() >= proto::SERVER_VERSION {
                d.channel.write_string(env!("CARGO_PKG_VERSION"))?;
            }
            Ok(())
        })
    }

    fn send_database_info(&mut self, db: &Database) -> ServerResult<()> {
        let clusters = db.storage().clusters();
        let version = self.proto();
        if version >= 7 {
            self.channel.write_short(clusters.len() as i16)?;
        } else {
            self.channel.write_int(clusters.len() as i32)?;
        }
        for cluster in clusters {
            self.channel.write_string(&cluster.name)?;
            self.channel.write_short(cluster.id)?;
            if (proto::CLUSTER_TYPE_LOW..proto::CLUSTER_TYPE_HIGH).contains(&version) {
                self.channel.write_string("none")?;
                self.channel.write_short(-1)?;
            }
        }
        Ok(())
    }

    fn reload_database(&mut self) -> ServerResult<()> {
        self.set_command_info("Reload database information");
        let db = self.database()?;
        self.respond(move |d| {
            d.send_ok()?;
            d.send_database_info(&db)
        })
    }

    fn create_database(&mut self) -> ServerResult<()> {
        self.set_command_info("Create database");

        let db_name = self.require_string("database name")?;
        let _db_type = if self.proto() >= proto::DB_TYPE {
            self.channel.read_string()?
        } else {
            None
        };
        let _storage_type = self.require_string("storage type")?;

        self.check_server_access("database.create")?;

        let db = self.context.create_database(&db_name)?;
        db.create()?;
        info!(database = db_name, "database created");

        let session = self.session()?;
        session.lock().database = Some(db);

        self.respond(Self::send_ok)
    }

    fn close_database(&mut self) -> ServerResult<()> {
        self.set_command_info("Close Database");

        if let Some(session) = self.session.clone() {
            let version = self.proto();
            if (1..proto::IGNORE_CACHE).contains(&version) {
                // Old clients wait for an acknowledgement.
                self.respond(Self::send_ok)?;
            }
            let id = session.lock().id();
            self.context.sessions.disconnect(id);
        }
        self.disconnect = true;
        Ok(())
    }

    fn exists_database(&mut self) -> ServerResult<()> {
        self.set_command_info("Exists database");

        let db_name = self.require_string("database name")?;
        let _storage_type = if self.proto() >= proto::STORAGE_TYPE {
            self.channel.read_string()?
        } else {
            None
        };

        self.check_server_access("database.exists")?;

        let exists = self.context.registry.exists(&db_name);
        self.respond(move |d| {
            d.send_ok()?;
            d.channel.write_byte(u8::from(exists))?;
            Ok(())
        })
    }

    fn drop_database(&mut self) -> ServerResult<()> {
        self.set_command_info("Drop database");

        let db_name = self.require_string("database name")?;
        let _storage_type = if self.proto() >= proto::STORAGE_TYPE {
            self.channel.read_string()?
        } else {
            None
        };

        self.check_server_access("database.delete")?;

        self.context.registry.drop_storage(&db_name)?;
        info!(database = db_name, "database dropped");

        if let Some(session) = &self.session {
            let mut session = session.lock();
            if let Some(db) = &session.database {
                if db.name() == db_name {
                    db.close();
                    session.database = None;
                }
            }
        }

        self.respond(Self::send_ok)
    }

    fn size_database(&mut self) -> ServerResult<()> {
        self.set_command_info("Database size");
        let db = self.database()?;
        let size = db.storage().size()?;
        self.respond(move |d| {
            d.send_ok()?;
            d.channel.write_long(size)?;
            Ok(())
        })
    }

    fn count_database_records(&mut self) -> ServerResult<()> {
        self.set_command_info("Database count records");
        let db = self.database()?;
        let count = db.storage().count_records()?;
        self.respond(move |d| {
            d.send_ok()?;
            d.channel.write_long(count)?;
            Ok(())
        })
    }

    fn copy_database(&mut self) -> ServerResult<()> {
        self.set_command_info("Copy the database to a remote server");

        let db_url = self.require_string("database url")?;
        let db_user = self.require_string("user")?;
        let db_password = self.require_string("password")?;
        let _remote_server_name = self.require_string("remote server")?;
        let _remote_server_engine = self.require_string("remote engine")?;

        self.check_server_access("database.copy")?;

        let db_name = db_url.rsplit('/').next().unwrap_or(&db_url);
        let db = self.context.open_database(db_name)?;
        db.open(&db_user, &db_password)?;
        // TODO: wire the actual remote transfer once a replication target
        // transport exists; for now the source is only validated.

        self.respond(Self::send_ok)
    }

    fn list_databases(&mut self) -> ServerResult<()> {
        self.check_server_access("server.dblist")?;
        self.set_command_info("List databases");

        // The response body is a serialized document with a single
        // "databases" field, like any flat document record.
        let mut document = String::from("{\"databases\":[");
        for (i, name) in self.context.registry.list().iter().enumerate() {
            if i > 0 {
                document.push(',');
            }
            document.push('"');
            document.push_str(name);
            document.push('"');
        }
        document.push_str("]}");

        self.respond(move |d| {
            d.send_ok()?;
            d.channel.write_bytes(document.as_bytes())?;
            Ok(())
        })
    }

    fn replication(&mut self) -> ServerResult<()> {
        self.set_command_info("Replication command");
        let _request = self.channel.read_bytes()?;
        Err(ServerError::NoDistributedManager)
    }

    fn distributed_cluster(&mut self) -> ServerResult<()> {
        self.set_command_info("Cluster status");
        let _request = self.channel.read_bytes()?;
        // Standalone server: no cluster plugin, no configuration to report.
        self.respond(|d| {
            d.send_ok()?;
            d.channel.write_opt_bytes(None)?;
            Ok(())
        })
    }

    // Cluster handlers ------------------------------------------------------

    fn add_cluster(&mut self) -> ServerResult<()> {
        self.set_command_info("Add cluster");
        let db = self.database()?;
        let version = self.proto();

        let mut cluster_type = String::new();
        if version < proto::DATA_SEGMENT_HIGH {
            cluster_type = self.channel.read_string()?.unwrap_or_default();
        }

        let name = self.require_string("cluster name")?;

        if (version >= proto::DATA_SEGMENT_LOW && version < proto::DATA_SEGMENT_HIGH)
            || cluster_type.eq_ignore_ascii_case("PHYSICAL")
        {
            let _location = self.channel.read_string()?;
        }

        if version < proto::DATA_SEGMENT_HIGH {
            if version >= proto::DATA_SEGMENT_LOW {
                let _data_segment_name = self.channel.read_string()?;
            } else {
                let _init_size = self.channel.read_int()?;
            }
        }

        let mut requested_id = None;
        if version >= proto::CLUSTER_REQUESTED_ID {
            let id = self.channel.read_short()?;
            if id >= 0 {
                requested_id = Some(id);
            }
        }

        let id = db.add_cluster(&name, requested_id)?;
        self.respond(move |d| {
            d.send_ok()?;
            d.channel.write_short(id)?;
            Ok(())
        })
    }

    fn remove_cluster(&mut self) -> ServerResult<()> {
        self.set_command_info("Remove cluster");
        let db = self.database()?;

        let id = self.channel.read_short()?;
        if db.storage().cluster_name_by_id(id).is_none() {
            return Err(ServerError::invalid_request(format!(
                "cluster {id} does not exist anymore; reload the database structure"
            )));
        }

        let dropped = db.drop_cluster(id)?;
        self.respond(move |d| {
            d.send_ok()?;
            d.channel.write_byte(u8::from(dropped))?;
            Ok(())
        })
    }

    fn count_clusters(&mut self) -> ServerResult<()> {
        self.set_command_info("Count cluster elements");
        let db = self.database()?;

        let count = self.channel.read_short()?;
        let mut ids = Vec::with_capacity(count.max(0) as usize);
        for _ in 0..count {
            ids.push(self.channel.read_short()?);
        }
        let count_tombstones = if self.proto() >= proto::TOMBSTONES {
            self.channel.read_byte()? > 0
        } else {
            false
        };

        let total = db.count_cluster_elements(&ids, count_tombstones)?;
        self.respond(move |d| {
            d.send_ok()?;
            d.channel.write_long(total)?;
            Ok(())
        })
    }

    fn range_cluster(&mut self) -> ServerResult<()> {
        self.set_command_info("Get the begin/end range of data in cluster");
        let db = self.database()?;

        let id = self.channel.read_short()?;
        let (begin, end) = db.storage().cluster_data_range(id)?;
        self.respond(move |d| {
            d.send_ok()?;
            d.channel.write_cluster_position(begin)?;
            d.channel.write_cluster_position(end)?;
            Ok(())
        })
    }

    fn freeze_database(&mut self) -> ServerResult<()> {
        self.set_command_info("Freeze database");
        let db_name = self.require_string("database name")?;
        self.check_server_access("database.freeze")?;
        let _storage_type = if self.proto() >= proto::STORAGE_TYPE {
            self.channel.read_string()?
        } else {
            None
        };

        let storage = self.context.registry.open(&db_name)?;
        info!(database = db_name, "freezing database");
        storage.freeze()?;
        self.respond(Self::send_ok)
    }

    fn release_database(&mut self) -> ServerResult<()> {
        self.set_command_info("Release database");
        let db_name = self.require_string("database name")?;
        self.check_server_access("database.release")?;
        let _storage_type = if self.proto() >= proto::STORAGE_TYPE {
            self.channel.read_string()?
        } else {
            None
        };

        let storage = self.context.registry.open(&db_name)?;
        info!(database = db_name, "releasing database");
        storage.release()?;
        self.respond(Self::send_ok)
    }

    fn freeze_cluster(&mut self) -> ServerResult<()> {
        self.set_command_info("Freeze cluster");
        let db_name = self.require_string("database name")?;
        let cluster_id = self.channel.read_short()?;
        self.check_server_access("database.freeze")?;
        let _storage_type = if self.proto() >= proto::STORAGE_TYPE {
            self.channel.read_string()?
        } else {
            None
        };

        let storage = self.context.registry.open(&db_name)?;
        info!(database = db_name, cluster = cluster_id, "freezing cluster");
        storage.freeze_cluster(cluster_id)?;
        self.respond(Self::send_ok)
    }

    fn release_cluster(&mut self) -> ServerResult<()> {
        self.set_command_info("Release cluster");
        let db_name = self.require_string("database name")?;
        let cluster_id = self.channel.read_short()?;
        self.check_server_access("database.release")?;
        let _storage_type = if self.proto() >= proto::STORAGE_TYPE {
            self.channel.read_string()?
        } else {
            None
        };

        let storage = self.context.registry.open(&db_name)?;
        info!(database = db_name, cluster = cluster_id, "releasing cluster");
        storage.release_cluster(cluster_id)?;
        self.respond(Self::send_ok)
    }

    // Record handlers -------------------------------------------------------

    fn read_record_metadata(&mut self) -> ServerResult<()> {
        self.set_command_info("Record metadata");
        let db = self.database()?;

        let rid = self.channel.read_rid()?;
        let metadata = db
            .record_metadata(rid)?
            .ok_or(ServerError::Core(rookdb_core::CoreError::RecordNotFound {
                rid,
            }))?;

        self.respond(move |d| {
            d.send_ok()?;
            d.channel.write_rid(metadata.rid)?;
            d.channel.write_version(metadata.version)?;
            Ok(())
        })
    }

    fn read_record(&mut self) -> ServerResult<()> {
        self.set_command_info("Load record");
        let db = self.database()?;
        let version = self.proto();

        let rid = self.channel.read_rid()?;
        let fetch_plan = self.channel.read_string()?.unwrap_or_default();
        let ignore_cache = if version >= proto::IGNORE_CACHE {
            self.channel.read_byte()? == 1
        } else {
            false
        };
        let load_tombstones = if version >= proto::TOMBSTONES {
            self.channel.read_byte()? > 0
        } else {
            false
        };

        let plan = (!fetch_plan.is_empty()).then_some(fetch_plan.as_str());
        let record = db.load(
            rid,
            plan,
            ignore_cache,
            load_tombstones,
            LockingStrategy::Default,
            None,
        )?;

        self.respond(move |d| {
            d.send_ok()?;
            if let Some(record) = &record {
                d.channel.write_byte(1)?;
                d.channel.write_bytes(record.bytes())?;
                d.channel.write_version(record.version())?;
                d.channel.write_byte(record.kind())?;
                // Fetch-plan side records would follow here with marker 2;
                // deep fetching belongs to the record layer.
            }
            d.channel.write_byte(0)?;
            Ok(())
        })
    }

    fn create_record(&mut self) -> ServerResult<()> {
        self.set_command_info("Create record");
        let db = self.database()?;
        let version = self.proto();

        if (proto::DATA_SEGMENT_LOW..proto::DATA_SEGMENT_HIGH).contains(&version) {
            let _data_segment_id = self.channel.read_int()?;
        }
        let cluster_id = self.channel.read_short()?;
        let bytes = self.channel.read_bytes()?.unwrap_or_default();
        let kind = self.channel.read_byte()?;
        let mode = OperationMode::from_wire(self.channel.read_byte()?);

        let mut record = Record::with_bytes(kind, bytes);
        record.set_identity(Rid::for_cluster(cluster_id));
        db.save(&mut record, None, mode, false, None, None)?;

        if !mode.expects_response() {
            return Ok(());
        }
        self.respond(move |d| {
            d.send_ok()?;
            d.channel.write_cluster_position(record.rid().position)?;
            if d.proto() >= proto::CREATE_VERSION {
                d.channel.write_version(record.version())?;
            }
            if d.proto() >= proto::COLLECTION_CHANGES {
                d.send_live_collection_changes(&db)?;
            }
            Ok(())
        })
    }

    fn update_record(&mut self) -> ServerResult<()> {
        self.set_command_info("Update record");
        let db = self.database()?;
        let version = self.proto();

        let rid = self.channel.read_rid()?;
        let update_content = if version >= proto::UPDATE_CONTENT {
            self.channel.read_bool()?
        } else {
            true
        };
        let bytes = self.channel.read_bytes()?.unwrap_or_default();
        let expected_version = self.channel.read_version()?;
        let kind = self.channel.read_byte()?;
        let mode = OperationMode::from_wire(self.channel.read_byte()?);

        let mut record = Record::with_bytes(kind, bytes);
        record.set_identity(rid);
        record.set_version(expected_version);
        record.set_content_changed(update_content);
        db.save(&mut record, None, mode, false, None, None)?;

        if !mode.expects_response() {
            return Ok(());
        }
        self.respond(move |d| {
            d.send_ok()?;
            d.channel.write_version(record.version())?;
            if d.proto() >= proto::COLLECTION_CHANGES {
                d.send_live_collection_changes(&db)?;
            }
            Ok(())
        })
    }

    fn delete_record(&mut self) -> ServerResult<()> {
        self.set_command_info("Delete record");
        let db = self.database()?;

        let rid = self.channel.read_rid()?;
        let version = self.channel.read_version()?;
        let mode = OperationMode::from_wire(self.channel.read_byte()?);

        let deleted = db.delete(rid, version, false, true, mode, false)?;

        if !mode.expects_response() {
            return Ok(());
        }
        self.respond(move |d| {
            d.send_ok()?;
            d.channel.write_byte(u8::from(deleted))?;
            Ok(())
        })
    }

    fn hide_record(&mut self) -> ServerResult<()> {
        self.set_command_info("Hide record");
        let db = self.database()?;

        let rid = self.channel.read_rid()?;
        let mode = OperationMode::from_wire(self.channel.read_byte()?);

        let hidden = db.hide(rid, mode)?;

        if !mode.expects_response() {
            return Ok(());
        }
        self.respond(move |d| {
            d.send_ok()?;
            d.channel.write_byte(u8::from(hidden))?;
            Ok(())
        })
    }

    fn clean_out_record(&mut self) -> ServerResult<()> {
        self.set_command_info("Clean out record");
        let db = self.database()?;

        let rid = self.channel.read_rid()?;
        let version = self.channel.read_version()?;
        let mode = OperationMode::from_wire(self.channel.read_byte()?);

        let removed = db.delete(rid, version, false, true, mode, true)?;

        if !mode.expects_response() {
            return Ok(());
        }
        self.respond(move |d| {
            d.send_ok()?;
            d.channel.write_byte(u8::from(removed))?;
            Ok(())
        })
    }

    fn positions(&mut self, query: PositionQuery) -> ServerResult<()> {
        self.set_command_info(query.command_info());
        let db = self.database()?;

        let cluster_id = self.channel.read_int()? as i16;
        let position = self.channel.read_cluster_position()?;

        let storage = db.storage();
        let positions = match query {
            PositionQuery::Higher => storage.higher_positions(cluster_id, position)?,
            PositionQuery::Ceiling => storage.ceiling_positions(cluster_id, position)?,
            PositionQuery::Lower => storage.lower_positions(cluster_id, position)?,
            PositionQuery::Floor => storage.floor_positions(cluster_id, position)?,
        };

        self.respond(move |d| {
            d.send_ok()?;
            d.channel.write_int(positions.len() as i32)?;
            for slot in &positions {
                d.channel.write_cluster_position(slot.position)?;
                d.channel.write_int(slot.record_size)?;
                d.channel.write_version(slot.version)?;
            }
            Ok(())
        })
    }

    // Command handler -------------------------------------------------------

    fn command(&mut self) -> ServerResult<()> {
        self.set_command_info("Execute remote command");
        let db = self.database()?;

        let asynch = self.channel.read_byte()? == b'a';
        let request = self.channel.read_bytes()?.unwrap_or_default();

        let processor = self
            .context
            .command_processor()
            .ok_or(ServerError::NoCommandProcessor)?;
        let outcome = processor.execute(&db, &request, self.context.config.command_timeout)?;

        self.respond(move |d| {
            d.send_ok()?;
            if asynch {
                match &outcome {
                    CommandOutcome::Record(record) => {
                        d.channel.write_byte(1)?;
                        d.write_identifiable(Some(record))?;
                    }
                    CommandOutcome::Collection(records) => {
                        for record in records {
                            d.channel.write_byte(1)?;
                            d.write_identifiable(Some(record))?;
                        }
                    }
                    CommandOutcome::Null | CommandOutcome::Text(_) => {}
                }
                d.channel.write_byte(0)?;
            } else {
                match &outcome {
                    CommandOutcome::Null => d.channel.write_byte(b'n')?,
                    CommandOutcome::Record(record) => {
                        d.channel.write_byte(b'r')?;
                        d.write_identifiable(Some(record))?;
                    }
                    CommandOutcome::Collection(records) => {
                        d.channel.write_byte(b'l')?;
                        d.channel.write_int(records.len() as i32)?;
                        for record in records {
                            d.write_identifiable(Some(record))?;
                        }
                    }
                    CommandOutcome::Text(text) => {
                        d.channel.write_byte(b'a')?;
                        d.channel.write_string(text)?;
                    }
                }
                if d.proto() >= proto::COMMAND_PREFETCH {
                    // Prefetched records for the client cache would carry
                    // marker 2 here.
                    d.channel.write_byte(0)?;
                }
            }
            Ok(())
        })
    }

    fn write_identifiable(&mut self, record: Option<&Record>) -> ServerResult<()> {
        match record {
            None => self.channel.write_short(identifiable::NULL)?,
            Some(record) => {
                self.channel.write_short(identifiable::RECORD)?;
                self.channel.write_byte(record.kind())?;
                self.channel.write_rid(record.rid())?;
                self.channel.write_version(record.version())?;
                self.channel.write_bytes(record.bytes())?;
            }
        }
        Ok(())
    }

    // Transaction handler ---------------------------------------------------

    fn commit_transaction(&mut self) -> ServerResult<()> {
        self.set_command_info("Transaction commit");
        let db = self.database()?;
        let version = self.proto();

        let tx_id = self.channel.read_int()?;
        let _using_log = self.channel.read_bool()?;

        let mut tx = TxBuffer::new(tx_id);
        tx.begin();

        loop {
            let marker = self.channel.read_byte()?;
            if marker != 1 {
                break;
            }
            let op = self.channel.read_byte()?;
            let rid = self.channel.read_rid()?;
            let kind = self.channel.read_byte()?;

            match op {
                TX_OP_CREATED => {
                    let bytes = self.channel.read_bytes()?.unwrap_or_default();
                    let mut record = Record::with_bytes(kind, bytes);
                    record.set_identity(rid);
                    tx.create(record);
                }
                TX_OP_UPDATED => {
                    let expected = self.channel.read_version()?;
                    let update_content = if version >= proto::UPDATE_CONTENT {
                        self.channel.read_bool()?
                    } else {
                        true
                    };
                    let bytes = self.channel.read_bytes()?.unwrap_or_default();
                    let mut record = Record::with_bytes(kind, bytes);
                    record.set_identity(rid);
                    record.set_version(expected);
                    record.set_content_changed(update_content);
                    tx.update(record);
                }
                TX_OP_DELETED => {
                    let expected = self.channel.read_version()?;
                    tx.delete(rid, expected);
                }
                other => {
                    return Err(ServerError::invalid_request(format!(
                        "unknown transaction operation {other}"
                    )))
                }
            }
        }
        // Index change stream: replayed by the index manager collaborator.
        let _index_changes = self.channel.read_bytes()?;

        // A failed commit rolls the buffer back and clears collection
        // change tracking before surfacing the error.
        let outcome = db.commit(&mut tx)?;

        self.respond(move |d| {
            d.send_ok()?;
            d.channel.write_int(outcome.created.len() as i32)?;
            for (client_rid, server_rid) in &outcome.created {
                d.channel.write_rid(*client_rid)?;
                d.channel.write_rid(*server_rid)?;
            }
            d.channel.write_int(outcome.updated.len() as i32)?;
            for (rid, new_version) in &outcome.updated {
                d.channel.write_rid(*rid)?;
                d.channel.write_version(*new_version)?;
            }
            if d.proto() >= proto::COLLECTION_CHANGES {
                d.write_collection_changes(&outcome.collection_changes)?;
            }
            Ok(())
        })
    }

    fn send_live_collection_changes(&mut self, db: &Database) -> ServerResult<()> {
        let changes = match db.collection_manager() {
            Some(cm) => {
                let changes = cm.changed_ids();
                cm.clear_changed_ids();
                changes
            }
            None => Vec::new(),
        };
        self.write_collection_changes(&changes)
    }

    fn write_collection_changes(
        &mut self,
        changes: &[(Uuid, BonsaiPointer)],
    ) -> ServerResult<()> {
        self.channel.write_int(changes.len() as i32)?;
        for (id, pointer) in changes {
            let (hi, lo) = id.as_u64_pair();
            self.channel.write_long(hi as i64)?;
            self.channel.write_long(lo as i64)?;
            self.write_collection_pointer(*pointer)?;
        }
        Ok(())
    }

    fn write_collection_pointer(&mut self, pointer: BonsaiPointer) -> ServerResult<()> {
        self.channel.write_long(pointer.file_id)?;
        self.channel.write_long(pointer.page_index)?;
        self.channel.write_int(pointer.page_offset)?;
        Ok(())
    }

    fn read_collection_pointer(&mut self) -> ServerResult<BonsaiPointer> {
        let file_id = self.channel.read_long()?;
        let page_index = self.channel.read_long()?;
        let page_offset = self.channel.read_int()?;
        Ok(BonsaiPointer::new(file_id, page_index, page_offset))
    }

    // Configuration handlers ------------------------------------------------

    fn config_get(&mut self) -> ServerResult<()> {
        self.set_command_info("Get config");
        self.check_server_access("server.config.get")?;

        let key = self.require_string("configuration key")?;
        let value = self.context.config_registry.get(&key);
        self.respond(move |d| {
            d.send_ok()?;
            d.channel.write_string(&value)?;
            Ok(())
        })
    }

    fn config_set(&mut self) -> ServerResult<()> {
        self.set_command_info("Set config");
        self.check_server_access("server.config.set")?;

        let key = self.require_string("configuration key")?;
        let value = self.require_string("configuration value")?;
        self.context.config_registry.set(key, value);
        self.respond(Self::send_ok)
    }

    fn config_list(&mut self) -> ServerResult<()> {
        self.set_command_info("List config");
        self.check_server_access("server.config.get")?;

        let entries = self.context.config_registry.list();
        self.respond(move |d| {
            d.send_ok()?;
            d.channel.write_short(entries.len() as i16)?;
            for (key, value) in &entries {
                d.channel.write_string(key)?;
                d.channel.write_string(value)?;
            }
            Ok(())
        })
    }

    // Bonsai collection handlers --------------------------------------------

    fn collection_manager(&self) -> ServerResult<Arc<dyn CollectionManager>> {
        let db = self.database()?;
        db.collection_manager()
            .ok_or_else(|| ServerError::invalid_request("storage has no collection manager"))
    }

    fn create_sbtree_bonsai(&mut self) -> ServerResult<()> {
        self.set_command_info("Create SB-Tree bonsai instance");
        let cm = self.collection_manager()?;

        let cluster_id = self.channel.read_int()?;
        let pointer = cm.create(cluster_id)?;
        self.respond(move |d| {
            d.send_ok()?;
            d.write_collection_pointer(pointer)?;
            Ok(())
        })
    }

    fn sbtree_bonsai_get(&mut self) -> ServerResult<()> {
        self.set_command_info("SB-Tree bonsai get");
        let cm = self.collection_manager()?;

        let pointer = self.read_collection_pointer()?;
        let key = self.channel.read_bytes()?.unwrap_or_default();
        let value = cm.get(pointer, &key)?;
        self.respond(move |d| {
            d.send_ok()?;
            d.channel.write_opt_bytes(value.as_deref())?;
            Ok(())
        })
    }

    fn sbtree_bonsai_first_key(&mut self) -> ServerResult<()> {
        self.set_command_info("SB-Tree bonsai get first key");
        let cm = self.collection_manager()?;

        let pointer = self.read_collection_pointer()?;
        let first = cm.first_key(pointer)?;
        self.respond(move |d| {
            d.send_ok()?;
            d.channel.write_opt_bytes(first.as_deref())?;
            Ok(())
        })
    }

    fn sbtree_bonsai_entries_major(&mut self) -> ServerResult<()> {
        self.set_command_info("SB-Tree bonsai get values major");
        let cm = self.collection_manager()?;

        let pointer = self.read_collection_pointer()?;
        let key = self.channel.read_bytes()?.unwrap_or_default();
        let inclusive = self.channel.read_bool()?;
        let page_size = if self.proto() >= proto::BONSAI_PAGE_SIZE {
            self.channel.read_int()?
        } else {
            128
        };

        let entries = cm.entries_major(pointer, &key, inclusive, page_size)?;
        let mut blob = Vec::new();
        blob.extend_from_slice(&(entries.len() as i32).to_be_bytes());
        for (entry_key, entry_value) in &entries {
            blob.extend_from_slice(&(entry_key.len() as i32).to_be_bytes());
            blob.extend_from_slice(entry_key);
            blob.extend_from_slice(&(entry_value.len() as i32).to_be_bytes());
            blob.extend_from_slice(entry_value);
        }

        self.respond(move |d| {
            d.send_ok()?;
            d.channel.write_bytes(&blob)?;
            Ok(())
        })
    }

    fn rid_bag_size(&mut self) -> ServerResult<()> {
        self.set_command_info("RidBag get size");
        let cm = self.collection_manager()?;

        let pointer = self.read_collection_pointer()?;
        let changes = self.channel.read_bytes()?.unwrap_or_default();
        let size = cm.rid_bag_size(pointer, &changes)?;
        self.respond(move |d| {
            d.send_ok()?;
            d.channel.write_int(size)?;
            Ok(())
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum PositionQuery {
    Higher,
    Ceiling,
    Lower,
    Floor,
}

impl PositionQuery {
    fn command_info(self) -> &'static str {
        match self {
            Self::Higher => "Retrieve higher positions",
            Self::Ceiling => "Retrieve ceiling positions",
            Self::Lower => "Retrieve lower positions",
            Self::Floor => "Retrieve floor positions",
        }
    }
}
