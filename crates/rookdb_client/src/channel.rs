//! The authenticated client channel.

use crate::error::{ClientError, ClientResult};
use crate::pool::{ConnectionManager, PoolResource};
use parking_lot::{Mutex, MutexGuard};
use rookdb_wire::{BinaryChannel, ChannelLock};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::debug;

/// Client-side configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// How long `acquire` waits for a free pooled channel.
    pub pool_timeout: Duration,
    /// Maximum live channels per server URL.
    pub max_pool: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            pool_timeout: Duration::from_secs(5),
            max_pool: 50,
        }
    }
}

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// One TCP channel to a server, speaking the binary protocol.
///
/// The channel remembers the protocol version the server announced on
/// connect and the session id bound by the last handshake. Its pool is
/// reachable only through a weak reference so that channel and pool
/// never own each other.
pub struct ClientChannel {
    id: u64,
    url: String,
    channel: Mutex<BinaryChannel<TcpStream>>,
    lock: Arc<ChannelLock>,
    server_protocol: i16,
    session_id: AtomicI32,
    connected: AtomicBool,
    retired: AtomicBool,
    manager: Weak<ConnectionManager>,
}

impl ClientChannel {
    /// Connects to `url` (`host:port` with an optional `/database`
    /// suffix) and reads the server's protocol version.
    pub fn connect(
        url: &str,
        config: &ClientConfig,
        manager: Weak<ConnectionManager>,
    ) -> ClientResult<Self> {
        let server_part = url.split('/').next().unwrap_or(url);
        let addr = server_part
            .to_socket_addrs()
            .map_err(|e| ClientError::invalid_url(url, e.to_string()))?
            .next()
            .ok_or_else(|| ClientError::invalid_url(url, "no address resolved"))?;

        debug!(url, "connecting");
        let stream = TcpStream::connect_timeout(&addr, config.connect_timeout)?;
        stream.set_nodelay(true)?;

        let mut channel = BinaryChannel::new(stream);
        let server_protocol = channel.read_short()?;

        Ok(Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            url: url.to_string(),
            channel: Mutex::new(channel),
            lock: Arc::new(ChannelLock::new()),
            server_protocol,
            session_id: AtomicI32::new(-1),
            connected: AtomicBool::new(true),
            retired: AtomicBool::new(false),
            manager,
        })
    }

    /// Unique channel id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The URL this channel was created for.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Protocol version announced by the server.
    #[must_use]
    pub fn server_protocol(&self) -> i16 {
        self.server_protocol
    }

    /// Session id bound to this channel, `-1` before a handshake.
    #[must_use]
    pub fn session_id(&self) -> i32 {
        self.session_id.load(Ordering::SeqCst)
    }

    /// Binds a session id after CONNECT or DB_OPEN.
    pub fn set_session_id(&self, id: i32) {
        self.session_id.store(id, Ordering::SeqCst);
    }

    /// Exclusive access to the framing layer for composing a request or
    /// reading a response.
    pub fn channel(&self) -> MutexGuard<'_, BinaryChannel<TcpStream>> {
        self.channel.lock()
    }

    /// The channel's write lock; one request/response exchange at a time.
    #[must_use]
    pub fn write_lock(&self) -> Arc<ChannelLock> {
        Arc::clone(&self.lock)
    }

    /// True until the channel is closed.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Marks the channel dead without notifying the pool; the next
    /// `release` discards it.
    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Closes the socket and tells the owning pool to evict this channel.
    pub fn close(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.shutdown_socket();
            if let Some(manager) = self.manager.upgrade() {
                manager.on_channel_close(self);
            }
        }
    }

    pub(crate) fn shutdown_socket(&self) {
        let channel = self.channel.lock();
        let _ = channel.get_ref().shutdown(Shutdown::Both);
    }

    pub(crate) fn force_unlock(&self) {
        self.lock.release();
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }
}

impl PoolResource for ClientChannel {
    fn mark_retired(&self) -> bool {
        !self.retired.swap(true, Ordering::SeqCst)
    }
}

impl Drop for ClientChannel {
    fn drop(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
        self.shutdown_socket();
    }
}

impl std::fmt::Debug for ClientChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientChannel")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}
