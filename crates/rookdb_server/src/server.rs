//! The TCP listener and shared server state.

use crate::command::CommandProcessor;
use crate::config::{ConfigRegistry, ServerConfig};
use crate::dispatcher::Dispatcher;
use crate::error::ServerResult;
use crate::session::SessionManager;
use parking_lot::{Condvar, Mutex, RwLock};
use rookdb_core::{Database, IndexManager, MemoryIndexManager, SecurityManager, StorageRegistry};
use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{error, info};

/// State shared by every connection of one server.
pub struct ServerContext {
    /// Server configuration.
    pub config: ServerConfig,
    /// Live sessions.
    pub sessions: SessionManager,
    /// Storages by database name.
    pub registry: Arc<dyn StorageRegistry>,
    /// Runtime configuration registry.
    pub config_registry: ConfigRegistry,
    securities: RwLock<HashMap<String, Arc<SecurityManager>>>,
    index_managers: RwLock<HashMap<String, Arc<MemoryIndexManager>>>,
    command_processor: RwLock<Option<Arc<dyn CommandProcessor>>>,
    shutdown: AtomicBool,
    node_online: Mutex<bool>,
    node_online_changed: Condvar,
}

impl ServerContext {
    /// Creates the shared state.
    pub fn new(config: ServerConfig, registry: Arc<dyn StorageRegistry>) -> Arc<Self> {
        let config_registry = ConfigRegistry::new(&config);
        Arc::new(Self {
            config,
            sessions: SessionManager::new(),
            registry,
            config_registry,
            securities: RwLock::new(HashMap::new()),
            index_managers: RwLock::new(HashMap::new()),
            command_processor: RwLock::new(None),
            shutdown: AtomicBool::new(false),
            node_online: Mutex::new(true),
            node_online_changed: Condvar::new(),
        })
    }

    /// The security registry of a database, created on first touch.
    pub fn security_for(&self, db_name: &str) -> Arc<SecurityManager> {
        if let Some(existing) = self.securities.read().get(db_name) {
            return Arc::clone(existing);
        }
        let mut securities = self.securities.write();
        Arc::clone(
            securities
                .entry(db_name.to_string())
                .or_insert_with(|| Arc::new(SecurityManager::with_admin())),
        )
    }

    /// The index manager of a database, created on first touch.
    pub fn index_manager_for(&self, db_name: &str) -> Arc<MemoryIndexManager> {
        if let Some(existing) = self.index_managers.read().get(db_name) {
            return Arc::clone(existing);
        }
        let mut managers = self.index_managers.write();
        Arc::clone(
            managers
                .entry(db_name.to_string())
                .or_insert_with(|| Arc::new(MemoryIndexManager::new())),
        )
    }

    /// Builds a session-scoped database over the shared storage.
    pub fn open_database(&self, db_name: &str) -> ServerResult<Arc<Database>> {
        let storage = self.registry.open(db_name)?;
        Ok(Arc::new(Database::new(
            db_name,
            storage,
            self.security_for(db_name),
            self.index_manager_for(db_name) as Arc<dyn IndexManager>,
        )))
    }

    /// Creates the storage and builds a database over it.
    pub fn create_database(&self, db_name: &str) -> ServerResult<Arc<Database>> {
        let storage = self.registry.create(db_name)?;
        Ok(Arc::new(Database::new(
            db_name,
            storage,
            self.security_for(db_name),
            self.index_manager_for(db_name) as Arc<dyn IndexManager>,
        )))
    }

    /// Authenticates a server-level principal.
    pub fn server_login(
        &self,
        user: &str,
        password: &str,
        _resource: &str,
    ) -> ServerResult<String> {
        if user == self.config.root_user && password == self.config.root_password {
            Ok(user.to_string())
        } else {
            Err(crate::error::ServerError::ServerAccess {
                user: user.to_string(),
                resource: "connect".to_string(),
            })
        }
    }

    /// Installs the command processor.
    pub fn set_command_processor(&self, processor: Arc<dyn CommandProcessor>) {
        *self.command_processor.write() = Some(processor);
    }

    /// The installed command processor, if any.
    #[must_use]
    pub fn command_processor(&self) -> Option<Arc<dyn CommandProcessor>> {
        self.command_processor.read().clone()
    }

    /// Requests server shutdown; the accept loop stops handing out
    /// connections.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// True once shutdown was requested.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Marks the node online or offline; requests block while offline.
    pub fn set_node_online(&self, online: bool) {
        let mut state = self.node_online.lock();
        *state = online;
        self.node_online_changed.notify_all();
    }

    /// Blocks until the node is online.
    pub fn wait_node_online(&self) {
        let mut state = self.node_online.lock();
        while !*state {
            self.node_online_changed.wait(&mut state);
        }
    }
}

/// The binary protocol server: a TCP accept loop handing each connection
/// to a dispatcher on its own thread.
pub struct Server {
    context: Arc<ServerContext>,
}

impl Server {
    /// Creates a server over shared context.
    pub fn new(context: Arc<ServerContext>) -> Self {
        Self { context }
    }

    /// The shared context.
    #[must_use]
    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    /// Binds the configured address and serves until shutdown. Blocks the
    /// calling thread.
    pub fn serve(&self) -> ServerResult<()> {
        let listener = TcpListener::bind(self.context.config.bind_addr)?;
        self.serve_on(listener)
    }

    /// Binds an ephemeral port and serves on a background thread.
    pub fn spawn(self) -> ServerResult<ServerHandle> {
        let listener = TcpListener::bind(self.context.config.bind_addr)?;
        let addr = listener.local_addr()?;
        let context = Arc::clone(&self.context);
        let handle = std::thread::spawn(move || {
            if let Err(e) = self.serve_on(listener) {
                error!(error = %e, "server loop failed");
            }
        });
        Ok(ServerHandle {
            addr,
            context,
            handle: Some(handle),
        })
    }

    fn serve_on(&self, listener: TcpListener) -> ServerResult<()> {
        info!(addr = %listener.local_addr()?, "listening");
        for stream in listener.incoming() {
            if self.context.is_shutdown() {
                break;
            }
            match stream {
                Ok(stream) => self.handle_connection(stream),
                Err(e) => error!(error = %e, "accept failed"),
            }
        }
        info!("server stopped");
        Ok(())
    }

    fn handle_connection(&self, stream: TcpStream) {
        let context = Arc::clone(&self.context);
        std::thread::spawn(move || {
            let peer = stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "?".to_string());
            info!(peer, "client connected");
            let mut dispatcher = Dispatcher::new(context, stream);
            if let Err(e) = dispatcher.serve() {
                info!(peer, error = %e, "connection closed with error");
            } else {
                info!(peer, "client disconnected");
            }
        });
    }
}

/// Handle to a server running on a background thread.
pub struct ServerHandle {
    addr: SocketAddr,
    context: Arc<ServerContext>,
    handle: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// The bound address.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The shared context.
    #[must_use]
    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    /// Stops the accept loop and joins the server thread.
    pub fn shutdown(mut self) {
        self.context.request_shutdown();
        // Unblock the accept loop.
        let _ = TcpStream::connect(self.addr);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.context.request_shutdown();
        let _ = TcpStream::connect(self.addr);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rookdb_core::MemoryStorageRegistry;

    fn context() -> Arc<ServerContext> {
        ServerContext::new(
            ServerConfig::default(),
            Arc::new(MemoryStorageRegistry::new()),
        )
    }

    #[test]
    fn security_registry_is_shared_per_database() {
        let ctx = context();
        let a = ctx.security_for("demo");
        let b = ctx.security_for("demo");
        assert!(Arc::ptr_eq(&a, &b));

        let other = ctx.security_for("other");
        assert!(!Arc::ptr_eq(&a, &other));
    }

    #[test]
    fn server_login_checks_root() {
        let ctx = context();
        assert!(ctx.server_login("root", "root", "connect").is_ok());
        assert!(ctx.server_login("root", "wrong", "connect").is_err());
        assert!(ctx.server_login("guest", "root", "connect").is_err());
    }

    #[test]
    fn node_online_gate() {
        let ctx = context();
        // Online by default: returns immediately.
        ctx.wait_node_online();

        ctx.set_node_online(false);
        let waiter = Arc::clone(&ctx);
        let handle = std::thread::spawn(move || waiter.wait_node_online());
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!handle.is_finished());

        ctx.set_node_online(true);
        handle.join().unwrap();
    }

    #[test]
    fn shutdown_flag() {
        let ctx = context();
        assert!(!ctx.is_shutdown());
        ctx.request_shutdown();
        assert!(ctx.is_shutdown());
    }
}
