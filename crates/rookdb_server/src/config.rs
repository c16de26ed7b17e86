//! Server configuration and the runtime configuration registry.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for the binary protocol server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Root user for server-level operations (connect, create/drop
    /// databases, shutdown).
    pub root_user: String,
    /// Root password.
    pub root_password: String,
    /// Hard ceiling applied to client-requested command timeouts.
    pub command_timeout: Duration,
    /// Maximum channels a client pool should open per URL; advertised
    /// only, the server does not enforce it.
    pub client_max_pool: u32,
}

impl ServerConfig {
    /// Creates a configuration bound to an address.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            root_user: "root".to_string(),
            root_password: "root".to_string(),
            command_timeout: Duration::from_secs(60),
            client_max_pool: 50,
        }
    }

    /// Sets the root credentials.
    #[must_use]
    pub fn with_root(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.root_user = user.into();
        self.root_password = password.into();
        self
    }

    /// Sets the command timeout ceiling.
    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], 2424)))
    }
}

/// Mutable key/value registry behind the CONFIG_GET/SET/LIST opcodes.
pub struct ConfigRegistry {
    values: RwLock<BTreeMap<String, String>>,
}

impl ConfigRegistry {
    /// Creates a registry seeded with the server defaults.
    #[must_use]
    pub fn new(config: &ServerConfig) -> Self {
        let mut values = BTreeMap::new();
        values.insert(
            "command.timeout".to_string(),
            config.command_timeout.as_millis().to_string(),
        );
        values.insert(
            "client.channel.maxPool".to_string(),
            config.client_max_pool.to_string(),
        );
        values.insert("cache.local.capacity".to_string(), "5000".to_string());
        Self {
            values: RwLock::new(values),
        }
    }

    /// Reads a key; missing keys read as the empty string.
    #[must_use]
    pub fn get(&self, key: &str) -> String {
        self.values.read().get(key).cloned().unwrap_or_default()
    }

    /// Writes a key. Unknown keys are created.
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.values.write().insert(key.into(), value.into());
    }

    /// All entries in key order.
    #[must_use]
    pub fn list(&self) -> Vec<(String, String)> {
        self.values
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), 2424);
        assert_eq!(config.root_user, "root");
    }

    #[test]
    fn registry_get_set_list() {
        let registry = ConfigRegistry::new(&ServerConfig::default());
        assert_eq!(registry.get("missing"), "");

        registry.set("network.retry", "5");
        assert_eq!(registry.get("network.retry"), "5");

        let listed = registry.list();
        assert!(listed.iter().any(|(k, _)| k == "command.timeout"));
        assert!(listed.iter().any(|(k, v)| k == "network.retry" && v == "5"));
    }
}
