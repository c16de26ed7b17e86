//! Users, roles and resource-rule permission checks.

use crate::error::{CoreError, CoreResult};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Permission bits.
pub mod permission {
    /// Read records and metadata.
    pub const READ: u8 = 1;
    /// Create new records.
    pub const CREATE: u8 = 2;
    /// Update existing records.
    pub const UPDATE: u8 = 4;
    /// Delete records.
    pub const DELETE: u8 = 8;
    /// Every permission bit.
    pub const ALL: u8 = READ | CREATE | UPDATE | DELETE;

    /// Human name for a permission bit, used in error messages.
    #[must_use]
    pub fn name(op: u8) -> &'static str {
        match op {
            READ => "read",
            CREATE => "create",
            UPDATE => "update",
            DELETE => "delete",
            _ => "access",
        }
    }
}

/// Well-known resource keys.
pub mod resource {
    /// The database as a whole.
    pub const DATABASE: &str = "database";
    /// Cluster-scoped rules: `cluster.<name>`.
    pub const CLUSTER: &str = "cluster";
    /// Command execution.
    pub const COMMAND: &str = "command";
    /// Wildcard suffix matching every specific target.
    pub const ALL: &str = "*";
}

/// A named set of resource rules.
#[derive(Debug, Clone)]
pub struct Role {
    name: String,
    rules: HashMap<String, u8>,
    allow_all: bool,
}

impl Role {
    /// Creates a role with no rules.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rules: HashMap::new(),
            allow_all: false,
        }
    }

    /// Creates a role that allows every operation on every resource.
    #[must_use]
    pub fn allow_all(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rules: HashMap::new(),
            allow_all: true,
        }
    }

    /// Role name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a rule granting `ops` on `resource`.
    #[must_use]
    pub fn with_rule(mut self, resource: impl Into<String>, ops: u8) -> Self {
        self.rules.insert(resource.into(), ops);
        self
    }

    /// True when a rule is defined for the exact resource key.
    #[must_use]
    pub fn is_rule_defined(&self, resource: &str) -> bool {
        self.rules.contains_key(resource)
    }

    /// True when the role grants the operation on the resource key.
    #[must_use]
    pub fn allows(&self, resource: &str, op: u8) -> bool {
        if self.allow_all {
            return true;
        }
        self.rules
            .get(resource)
            .map(|granted| granted & op == op)
            .unwrap_or(false)
    }
}

/// An authenticated principal.
#[derive(Debug, Clone)]
pub struct User {
    name: String,
    password_hash: String,
    roles: Vec<Role>,
}

impl User {
    /// Creates a user with a hashed password and roles.
    #[must_use]
    pub fn new(name: impl Into<String>, password: &str, roles: Vec<Role>) -> Self {
        Self {
            name: name.into(),
            password_hash: hash_password(password),
            roles,
        }
    }

    /// A passthrough user for remote storages: schema security does not
    /// apply, every operation is allowed.
    #[must_use]
    pub fn passthrough(name: impl Into<String>, password: &str) -> Self {
        Self::new(name, password, vec![Role::allow_all("passthrough")])
    }

    /// User name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The user's roles.
    #[must_use]
    pub fn roles(&self) -> &[Role] {
        &self.roles
    }

    /// Verifies a cleartext password.
    #[must_use]
    pub fn check_password(&self, password: &str) -> bool {
        self.password_hash == hash_password(password)
    }

    /// True when any role defines a rule for the exact resource key.
    #[must_use]
    pub fn is_rule_defined(&self, resource: &str) -> bool {
        self.roles.iter().any(|r| r.is_rule_defined(resource))
    }

    /// Checks the operation against the user's rule set.
    pub fn allow(&self, resource: &str, op: u8) -> CoreResult<()> {
        if self.roles.iter().any(|r| r.allows(resource, op)) {
            Ok(())
        } else {
            Err(CoreError::AccessDenied {
                user: self.name.clone(),
                operation: permission::name(op).to_string(),
                resource: resource.to_string(),
            })
        }
    }
}

fn hash_password(password: &str) -> String {
    let digest = Sha256::digest(password.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Per-database user registry.
pub struct SecurityManager {
    users: RwLock<HashMap<String, User>>,
}

/// Default administrator name and password installed on create and on
/// repair.
pub const ADMIN: &str = "admin";

impl SecurityManager {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a registry holding the default admin user.
    #[must_use]
    pub fn with_admin() -> Self {
        let manager = Self::new();
        manager.put_user(User::new(
            ADMIN,
            ADMIN,
            vec![Role::allow_all("admin")],
        ));
        manager
    }

    /// Inserts or replaces a user.
    pub fn put_user(&self, user: User) {
        self.users.write().insert(user.name().to_string(), user);
    }

    /// Looks up a user by name.
    #[must_use]
    pub fn user(&self, name: &str) -> Option<User> {
        self.users.read().get(name).cloned()
    }

    /// Authenticates against the registry.
    pub fn authenticate(&self, name: &str, password: &str) -> CoreResult<User> {
        match self.users.read().get(name) {
            Some(user) if user.check_password(password) => Ok(user.clone()),
            _ => Err(CoreError::InvalidCredentials {
                user: name.to_string(),
            }),
        }
    }

    /// Reinstalls the default admin user and returns it. Recovery path for
    /// broken security metadata.
    pub fn repair(&self) -> User {
        let admin = User::new(ADMIN, ADMIN, vec![Role::allow_all("admin")]);
        self.put_user(admin.clone());
        admin
    }
}

impl Default for SecurityManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader() -> User {
        User::new(
            "reader",
            "secret",
            vec![Role::new("reader")
                .with_rule("database", permission::READ)
                .with_rule("cluster.*", permission::READ)],
        )
    }

    #[test]
    fn password_check() {
        let user = reader();
        assert!(user.check_password("secret"));
        assert!(!user.check_password("wrong"));
    }

    #[test]
    fn rule_grants_and_denies() {
        let user = reader();
        assert!(user.allow("database", permission::READ).is_ok());
        assert!(user.allow("database", permission::DELETE).is_err());
        assert!(user.allow("cluster.*", permission::READ).is_ok());
    }

    #[test]
    fn allow_all_role() {
        let user = User::passthrough("svc", "pw");
        assert!(user.allow("anything.at.all", permission::DELETE).is_ok());
    }

    #[test]
    fn authenticate_paths() {
        let manager = SecurityManager::with_admin();
        assert!(manager.authenticate(ADMIN, ADMIN).is_ok());
        assert!(matches!(
            manager.authenticate(ADMIN, "nope"),
            Err(CoreError::InvalidCredentials { .. })
        ));
        assert!(manager.authenticate("ghost", "x").is_err());
    }

    #[test]
    fn repair_reinstalls_admin() {
        let manager = SecurityManager::new();
        assert!(manager.authenticate(ADMIN, ADMIN).is_err());
        let admin = manager.repair();
        assert_eq!(admin.name(), ADMIN);
        assert!(manager.authenticate(ADMIN, ADMIN).is_ok());
    }
}
