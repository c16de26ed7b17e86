//! The per-URL bounded connection pool.
//!
//! `ResourcePool` is the generic bounded pool with timed acquire;
//! `ConnectionManager` maps server URLs to pools of client channels. A
//! channel that closes reports back to its manager through a weak
//! reference, which evicts it from the bookkeeping.

use crate::channel::{ClientChannel, ClientConfig};
use crate::error::{ClientError, ClientResult};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::debug;

/// A resource that can be permanently retired from its pool exactly once.
pub trait PoolResource {
    /// Marks the resource retired. Returns true only for the first call;
    /// pool bookkeeping runs once no matter how many paths retire it.
    fn mark_retired(&self) -> bool;
}

/// Creates and vets pool resources.
pub trait ResourceFactory<T>: Send + Sync {
    /// Creates a resource for a pool key.
    fn create(&self, key: &str) -> ClientResult<T>;

    /// Decides whether an idle resource is still fit for reuse.
    fn reuse(&self, _key: &str, _resource: &T) -> bool {
        true
    }
}

struct PoolInner<T> {
    idle: Vec<T>,
    created: usize,
    closed: bool,
}

/// A bounded pool of resources with a timed acquire.
pub struct ResourcePool<T> {
    max: usize,
    inner: Mutex<PoolInner<T>>,
    freed: Condvar,
}

impl<T: PoolResource> ResourcePool<T> {
    /// Creates a pool bounded to `max` live resources.
    #[must_use]
    pub fn new(max: usize) -> Self {
        Self {
            max,
            inner: Mutex::new(PoolInner {
                idle: Vec::new(),
                created: 0,
                closed: false,
            }),
            freed: Condvar::new(),
        }
    }

    /// Acquires a resource, waiting up to `timeout` when the pool is at
    /// capacity with nothing idle.
    pub fn acquire(
        &self,
        key: &str,
        timeout: Duration,
        factory: &dyn ResourceFactory<T>,
    ) -> ClientResult<T> {
        let deadline = Instant::now() + timeout;
        loop {
            enum Decision<T> {
                Candidate(T),
                Create,
                Retry,
            }

            let decision = {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return Err(ClientError::PoolClosed);
                }
                if let Some(resource) = inner.idle.pop() {
                    Decision::Candidate(resource)
                } else if inner.created < self.max {
                    inner.created += 1;
                    Decision::Create
                } else {
                    let timed_out = self.freed.wait_until(&mut inner, deadline).timed_out();
                    if timed_out && inner.idle.is_empty() && inner.created >= self.max {
                        return Err(ClientError::PoolTimeout {
                            url: key.to_string(),
                            waited: timeout,
                        });
                    }
                    Decision::Retry
                }
            };

            match decision {
                Decision::Candidate(resource) => {
                    if factory.reuse(key, &resource) {
                        return Ok(resource);
                    }
                    // Stale: retire it and look again.
                    self.retire(&resource);
                    drop(resource);
                }
                Decision::Create => match factory.create(key) {
                    Ok(resource) => return Ok(resource),
                    Err(e) => {
                        self.forget_one();
                        return Err(e);
                    }
                },
                Decision::Retry => {}
            }
        }
    }

    /// Returns a resource to the idle set.
    pub fn put_back(&self, resource: T) {
        let mut inner = self.inner.lock();
        if inner.closed {
            drop(inner);
            self.retire(&resource);
            return;
        }
        inner.idle.push(resource);
        drop(inner);
        self.freed.notify_one();
    }

    /// Retires a resource permanently; the slot frees up for a new one.
    pub fn retire(&self, resource: &T) {
        if resource.mark_retired() {
            self.forget_one();
        }
    }

    fn forget_one(&self) {
        let mut inner = self.inner.lock();
        inner.created = inner.created.saturating_sub(1);
        drop(inner);
        self.freed.notify_one();
    }

    /// Closes the pool and hands back the idle resources for disposal.
    pub fn close(&self) -> Vec<T> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        let idle = std::mem::take(&mut inner.idle);
        inner.created = inner.created.saturating_sub(idle.len());
        drop(inner);
        self.freed.notify_all();
        idle
    }

    /// Capacity of the pool.
    #[must_use]
    pub fn max_resources(&self) -> usize {
        self.max
    }

    /// Idle resources ready for reuse.
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.lock().idle.len()
    }

    /// Live resources, idle plus borrowed.
    #[must_use]
    pub fn created(&self) -> usize {
        self.inner.lock().created
    }
}

/// Manages pools of authenticated channels, one pool per server URL.
pub struct ConnectionManager {
    config: ClientConfig,
    pools: RwLock<HashMap<String, Arc<ResourcePool<ClientChannel>>>>,
    self_ref: Weak<Self>,
}

struct ChannelFactory {
    manager: Weak<ConnectionManager>,
    config: ClientConfig,
}

impl ResourceFactory<ClientChannel> for ChannelFactory {
    fn create(&self, key: &str) -> ClientResult<ClientChannel> {
        ClientChannel::connect(key, &self.config, Weak::clone(&self.manager))
    }

    fn reuse(&self, _key: &str, resource: &ClientChannel) -> bool {
        resource.is_connected()
    }
}

impl ConnectionManager {
    /// Creates a manager.
    pub fn new(config: ClientConfig) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            config,
            pools: RwLock::new(HashMap::new()),
            self_ref: Weak::clone(self_ref),
        })
    }

    fn pool_for(&self, url: &str) -> Arc<ResourcePool<ClientChannel>> {
        if let Some(pool) = self.pools.read().get(url) {
            return Arc::clone(pool);
        }
        let fresh = Arc::new(ResourcePool::new(self.config.max_pool));
        let mut pools = self.pools.write();
        match pools.entry(url.to_string()) {
            // Lost the race: the spare pool is empty, dropping it is the
            // whole cleanup.
            Entry::Occupied(existing) => Arc::clone(existing.get()),
            Entry::Vacant(slot) => Arc::clone(slot.insert(fresh)),
        }
    }

    /// Acquires a channel to `url`, creating the pool and the channel as
    /// needed. On failure the per-URL pool is dropped so the next caller
    /// starts from a clean slate.
    pub fn acquire(&self, url: &str) -> ClientResult<ClientChannel> {
        let pool = self.pool_for(url);
        let factory = ChannelFactory {
            manager: Weak::clone(&self.self_ref),
            config: self.config.clone(),
        };

        match pool.acquire(url, self.config.pool_timeout, &factory) {
            Ok(channel) => Ok(channel),
            Err(e) => {
                debug!(url, error = %e, "acquire failed, dropping pool entry");
                self.pools.write().remove(url);
                Err(e)
            }
        }
    }

    /// Returns a channel to its pool. Disconnected channels are
    /// discarded instead of being reused.
    pub fn release(&self, channel: ClientChannel) {
        let Some(pool) = self.pools.read().get(channel.url()).cloned() else {
            // Pool already gone; the channel just dies.
            return;
        };
        if !channel.is_connected() || channel.is_retired() {
            debug!(url = channel.url(), "discarding dead channel on release");
            pool.retire(&channel);
            return;
        }
        pool.put_back(channel);
    }

    /// Unlocks, closes and evicts a channel. Fails when the channel's
    /// pool no longer exists.
    pub fn remove(&self, channel: ClientChannel) -> ClientResult<()> {
        channel.force_unlock();
        channel.mark_disconnected();
        channel.shutdown_socket();

        let Some(pool) = self.pools.read().get(channel.url()).cloned() else {
            return Err(ClientError::PoolMissing {
                url: channel.url().to_string(),
            });
        };
        pool.retire(&channel);
        Ok(())
    }

    /// Channel-close callback: a channel that noticed its peer going away
    /// reports in and is evicted from the bookkeeping.
    pub fn on_channel_close(&self, channel: &ClientChannel) {
        debug!(url = channel.url(), id = channel.id(), "channel closed");
        if let Some(pool) = self.pools.read().get(channel.url()).cloned() {
            pool.retire(channel);
        }
    }

    /// Closes every pool and every idle channel.
    pub fn close(&self) {
        let pools: Vec<Arc<ResourcePool<ClientChannel>>> =
            self.pools.write().drain().map(|(_, pool)| pool).collect();
        for pool in pools {
            for channel in pool.close() {
                channel.mark_disconnected();
                channel.shutdown_socket();
            }
        }
    }

    /// Capacity of the pool serving `url`; 0 when no pool exists.
    #[must_use]
    pub fn max_resources(&self, url: &str) -> usize {
        self.pools
            .read()
            .get(url)
            .map(|p| p.max_resources())
            .unwrap_or(0)
    }

    /// Idle channels for `url`.
    #[must_use]
    pub fn available(&self, url: &str) -> usize {
        self.pools.read().get(url).map(|p| p.available()).unwrap_or(0)
    }

    /// Live channels for `url`.
    #[must_use]
    pub fn created(&self, url: &str) -> usize {
        self.pools.read().get(url).map(|p| p.created()).unwrap_or(0)
    }

    /// URLs with an active pool.
    #[must_use]
    pub fn urls(&self) -> Vec<String> {
        self.pools.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Dummy {
        healthy: AtomicBool,
        retired: AtomicBool,
    }

    impl Dummy {
        fn new(healthy: bool) -> Self {
            Self {
                healthy: AtomicBool::new(healthy),
                retired: AtomicBool::new(false),
            }
        }
    }

    impl PoolResource for Dummy {
        fn mark_retired(&self) -> bool {
            !self.retired.swap(true, Ordering::SeqCst)
        }
    }

    struct DummyFactory {
        built: AtomicUsize,
        fail: AtomicBool,
    }

    impl DummyFactory {
        fn new() -> Self {
            Self {
                built: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
            }
        }
    }

    impl ResourceFactory<Dummy> for DummyFactory {
        fn create(&self, _key: &str) -> ClientResult<Dummy> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(ClientError::PoolClosed);
            }
            self.built.fetch_add(1, Ordering::SeqCst);
            Ok(Dummy::new(true))
        }

        fn reuse(&self, _key: &str, resource: &Dummy) -> bool {
            resource.healthy.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn acquire_creates_up_to_max() {
        let pool = ResourcePool::new(2);
        let factory = DummyFactory::new();

        let a = pool.acquire("k", Duration::from_millis(10), &factory).unwrap();
        let _b = pool.acquire("k", Duration::from_millis(10), &factory).unwrap();
        assert_eq!(pool.created(), 2);

        // Full and nothing idle: times out.
        let err = pool
            .acquire("k", Duration::from_millis(20), &factory)
            .unwrap_err();
        assert!(matches!(err, ClientError::PoolTimeout { .. }));

        // Releasing frees a slot for the next acquire.
        pool.put_back(a);
        assert_eq!(pool.available(), 1);
        let again = pool.acquire("k", Duration::from_millis(10), &factory).unwrap();
        assert_eq!(pool.created(), 2);
        drop(again);
    }

    #[test]
    fn stale_idle_resource_is_replaced() {
        let pool = ResourcePool::new(2);
        let factory = DummyFactory::new();

        let a = pool.acquire("k", Duration::from_millis(10), &factory).unwrap();
        a.healthy.store(false, Ordering::SeqCst);
        pool.put_back(a);
        assert_eq!(pool.available(), 1);

        // The stale resource is retired and a fresh one is built.
        let fresh = pool.acquire("k", Duration::from_millis(10), &factory).unwrap();
        assert!(fresh.healthy.load(Ordering::SeqCst));
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.created(), 1);
        assert_eq!(factory.built.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failed_create_frees_the_slot() {
        let pool = ResourcePool::new(1);
        let factory = DummyFactory::new();

        factory.fail.store(true, Ordering::SeqCst);
        assert!(pool.acquire("k", Duration::from_millis(10), &factory).is_err());
        assert_eq!(pool.created(), 0);

        factory.fail.store(false, Ordering::SeqCst);
        assert!(pool.acquire("k", Duration::from_millis(10), &factory).is_ok());
    }

    #[test]
    fn retire_is_idempotent() {
        let pool = ResourcePool::new(2);
        let factory = DummyFactory::new();
        let a = pool.acquire("k", Duration::from_millis(10), &factory).unwrap();
        assert_eq!(pool.created(), 1);

        pool.retire(&a);
        pool.retire(&a);
        assert_eq!(pool.created(), 0);
    }

    #[test]
    fn blocked_acquire_wakes_on_release() {
        let pool = Arc::new(ResourcePool::new(1));
        let factory = Arc::new(DummyFactory::new());

        let held = pool
            .acquire("k", Duration::from_millis(10), factory.as_ref())
            .unwrap();

        let pool2 = Arc::clone(&pool);
        let factory2 = Arc::clone(&factory);
        let waiter = std::thread::spawn(move || {
            pool2
                .acquire("k", Duration::from_secs(5), factory2.as_ref())
                .is_ok()
        });

        std::thread::sleep(Duration::from_millis(30));
        pool.put_back(held);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn close_drains_idle() {
        let pool = ResourcePool::new(4);
        let factory = DummyFactory::new();
        let a = pool.acquire("k", Duration::from_millis(10), &factory).unwrap();
        let b = pool.acquire("k", Duration::from_millis(10), &factory).unwrap();
        pool.put_back(a);
        pool.put_back(b);

        let drained = pool.close();
        assert_eq!(drained.len(), 2);
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.created(), 0);

        assert!(matches!(
            pool.acquire("k", Duration::from_millis(10), &factory),
            Err(ClientError::PoolClosed)
        ));
    }

    #[test]
    fn manager_introspection_without_pool() {
        let manager = ConnectionManager::new(ClientConfig::default());
        assert_eq!(manager.max_resources("nowhere:1"), 0);
        assert_eq!(manager.available("nowhere:1"), 0);
        assert_eq!(manager.created("nowhere:1"), 0);
    }

    #[test]
    fn manager_acquire_failure_removes_pool_entry() {
        let manager = ConnectionManager::new(ClientConfig {
            connect_timeout: Duration::from_millis(50),
            pool_timeout: Duration::from_millis(50),
            max_pool: 2,
        });

        // Nothing listens on this port.
        let err = manager.acquire("127.0.0.1:1").unwrap_err();
        assert!(!matches!(err, ClientError::PoolTimeout { .. }));
        assert!(manager.urls().is_empty());
    }
}
