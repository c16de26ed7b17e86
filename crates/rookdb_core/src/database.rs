//! The database facade.
//!
//! One `Database` instance per session, composed over the shared storage
//! handle. It owns the hook pipeline, the local record cache and the
//! security context, and funnels every record operation through the MVCC
//! and permission checks.

use crate::cache::LocalRecordCache;
use crate::collections::{BonsaiPointer, CollectionManager};
use crate::error::{CoreError, CoreResult};
use crate::hook::{HookDecision, HookKind, HookPosition, HookRegistry, RecordHook, RunMode};
use crate::index::{self, IndexManager};
use crate::record::{Record, RecordStatus};
use crate::security::{permission, resource, SecurityManager, User};
use crate::storage::{LockingStrategy, OperationMode, Storage};
use crate::tx::{TxBuffer, TxLookup};
use parking_lot::RwLock;
use rookdb_wire::{ClusterPosition, RecordVersion, Rid};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Serializer installed when the storage configuration names none.
pub const DEFAULT_SERIALIZER: &str = "rook_binary";

/// Observer of database lifecycle events.
pub trait DatabaseListener: Send + Sync {
    /// The database finished opening.
    fn on_open(&self, _db: &Database) {}

    /// The database is closing.
    fn on_close(&self, _db: &Database) {}

    /// The database was created.
    fn on_create(&self, _db: &Database) {}

    /// Security metadata is broken; return true to authorise the repair
    /// described by `remedy`.
    fn on_corruption_repair(&self, _db: &Database, _message: &str, _remedy: &str) -> bool {
        false
    }
}

/// Outcome of a facade save.
#[derive(Debug, PartialEq, Eq)]
pub enum SaveResult {
    /// The record was written (or had nothing to write).
    Saved,
    /// A hook absorbed the operation; storage was not touched.
    SkippedIo,
    /// A hook substituted the record; storage was not touched and the
    /// caller gets the replacement.
    Replaced(Record),
}

/// What a committed transaction reports back to the client.
#[derive(Debug, Default, Clone)]
pub struct CommitOutcome {
    /// Client RID to server-assigned RID, one pair per created record.
    pub created: Vec<(Rid, Rid)>,
    /// New versions, one pair per updated record. A record created and
    /// updated in the same transaction appears here under its server RID.
    pub updated: Vec<(Rid, RecordVersion)>,
    /// Collection pointers changed while the transaction ran.
    pub collection_changes: Vec<(Uuid, BonsaiPointer)>,
}

/// A session's view of one database.
pub struct Database {
    name: String,
    storage: Arc<dyn Storage>,
    security: Arc<SecurityManager>,
    index_manager: Arc<dyn IndexManager>,
    collections: RwLock<Option<Arc<dyn CollectionManager>>>,
    hooks: HookRegistry,
    cache: LocalRecordCache,
    listeners: RwLock<Vec<Arc<dyn DatabaseListener>>>,
    default_hooks: RwLock<Vec<(Arc<dyn RecordHook>, HookPosition)>>,
    user: RwLock<Option<User>>,
    serializer: RwLock<String>,
    record_type: AtomicU8,
    mvcc: AtomicBool,
    validation: AtomicBool,
    open: AtomicBool,
}

impl Database {
    /// Creates a closed database over a storage handle.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        storage: Arc<dyn Storage>,
        security: Arc<SecurityManager>,
        index_manager: Arc<dyn IndexManager>,
    ) -> Self {
        Self {
            name: name.into(),
            storage,
            security,
            index_manager,
            collections: RwLock::new(None),
            hooks: HookRegistry::new(),
            cache: LocalRecordCache::new(),
            listeners: RwLock::new(Vec::new()),
            default_hooks: RwLock::new(Vec::new()),
            user: RwLock::new(None),
            serializer: RwLock::new(DEFAULT_SERIALIZER.to_string()),
            record_type: AtomicU8::new(Record::KIND_DOCUMENT),
            mvcc: AtomicBool::new(true),
            validation: AtomicBool::new(true),
            open: AtomicBool::new(false),
        }
    }

    // Lifecycle -------------------------------------------------------------

    /// Opens the database: wires the collection manager from the storage,
    /// starts the cache, installs the configured default hooks and
    /// authenticates.
    ///
    /// A user whose role set is empty indicates broken security metadata;
    /// registered listeners are asked to authorise reinstalling the
    /// default admin. With no approval the role-less user is kept and the
    /// open fails the database read-permission check that follows.
    pub fn open(&self, username: &str, password: &str) -> CoreResult<()> {
        if self.is_open() {
            return Ok(());
        }

        *self.collections.write() = self.storage.collection_manager();
        self.cache.startup();

        let user = if self.storage.is_remote() {
            // Schema security lives on the remote node.
            User::passthrough(username, password)
        } else {
            for (hook, position) in self.default_hooks.read().iter() {
                self.hooks.register(Arc::clone(hook), *position);
            }

            let user = self.security.authenticate(username, password)?;
            if user.roles().is_empty() {
                self.repair_roleless_user(user)
            } else {
                user
            }
        };

        *self.user.write() = Some(user);
        self.open.store(true, Ordering::SeqCst);

        if let Err(e) = self.check_security(resource::DATABASE, permission::READ) {
            self.close();
            return Err(e);
        }

        for listener in self.listeners_snapshot() {
            listener.on_open(self);
        }
        Ok(())
    }

    fn repair_roleless_user(&self, user: User) -> User {
        let message = format!("user '{}' has no roles defined", user.name());
        for listener in self.listeners_snapshot() {
            if listener.on_corruption_repair(
                self,
                &message,
                "reinstall the default admin user with the default password",
            ) {
                warn!(database = %self.name, "security metadata repaired, default admin reinstalled");
                return self.security.repair();
            }
        }
        warn!(database = %self.name, user = user.name(), "opening with a role-less user");
        user
    }

    /// Creates the database content: installs the default admin and opens
    /// as that user.
    pub fn create(&self) -> CoreResult<()> {
        *self.collections.write() = self.storage.collection_manager();
        self.cache.startup();
        // Fresh databases hold document records.
        self.record_type
            .store(Record::KIND_DOCUMENT, Ordering::Relaxed);

        let admin = self.security.repair();
        *self.user.write() = Some(admin);
        self.open.store(true, Ordering::SeqCst);

        for listener in self.listeners_snapshot() {
            listener.on_create(self);
        }
        Ok(())
    }

    /// Closes the database: notifies listeners, unregisters hooks, shuts
    /// the cache down and forgets the user.
    pub fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        for listener in self.listeners_snapshot() {
            listener.on_close(self);
        }
        self.hooks.clear();
        self.cache.shutdown();
        *self.user.write() = None;
    }

    /// Permission gate for dropping the database; closes it when granted.
    /// The registry owning the storage performs the actual removal.
    pub fn prepare_drop(&self) -> CoreResult<()> {
        self.ensure_open()?;
        self.check_security(resource::DATABASE, permission::DELETE)?;
        self.close();
        Ok(())
    }

    /// True while the database is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(CoreError::DatabaseClosed {
                name: self.name.clone(),
            })
        }
    }

    // Accessors -------------------------------------------------------------

    /// Database name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The shared storage handle.
    #[must_use]
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// The session's record cache.
    #[must_use]
    pub fn local_cache(&self) -> &LocalRecordCache {
        &self.cache
    }

    /// The bonsai collection manager, when the storage provides one.
    #[must_use]
    pub fn collection_manager(&self) -> Option<Arc<dyn CollectionManager>> {
        self.collections.read().clone()
    }

    /// The authenticated user.
    #[must_use]
    pub fn user(&self) -> Option<User> {
        self.user.read().clone()
    }

    /// Name of the active record serializer.
    #[must_use]
    pub fn serializer(&self) -> String {
        self.serializer.read().clone()
    }

    /// Replaces the active record serializer name.
    pub fn set_serializer(&self, name: impl Into<String>) {
        *self.serializer.write() = name.into();
    }

    /// Kind byte of records created through this database.
    #[must_use]
    pub fn record_type(&self) -> u8 {
        self.record_type.load(Ordering::Relaxed)
    }

    /// Configures the record kind; takes effect for records created
    /// afterwards.
    pub fn set_record_type(&self, kind: u8) {
        self.record_type.store(kind, Ordering::Relaxed);
    }

    /// Creates an empty record of the configured kind.
    #[must_use]
    pub fn new_record(&self) -> Record {
        Record::new(self.record_type())
    }

    /// True when MVCC version checks are enabled.
    #[must_use]
    pub fn is_mvcc(&self) -> bool {
        self.mvcc.load(Ordering::Relaxed)
    }

    /// Toggles MVCC version checks.
    pub fn set_mvcc(&self, enabled: bool) {
        self.mvcc.store(enabled, Ordering::Relaxed);
    }

    /// True when record validation is enabled.
    #[must_use]
    pub fn is_validation_enabled(&self) -> bool {
        self.validation.load(Ordering::Relaxed)
    }

    /// Toggles record validation.
    pub fn set_validation(&self, enabled: bool) {
        self.validation.store(enabled, Ordering::Relaxed);
    }

    /// Registers a lifecycle listener.
    pub fn add_listener(&self, listener: Arc<dyn DatabaseListener>) {
        self.listeners.write().push(listener);
    }

    fn listeners_snapshot(&self) -> Vec<Arc<dyn DatabaseListener>> {
        self.listeners.read().clone()
    }

    /// Hooks registered on every non-remote open, before authentication.
    /// Schema-driven triggers from the metadata layer plug in here.
    pub fn set_default_hooks(&self, hooks: Vec<(Arc<dyn RecordHook>, HookPosition)>) {
        *self.default_hooks.write() = hooks;
    }

    // Hooks -----------------------------------------------------------------

    /// Registers a record hook.
    pub fn register_hook(&self, hook: Arc<dyn RecordHook>, position: HookPosition) {
        self.hooks.register(hook, position);
    }

    /// Unregisters a record hook.
    pub fn unregister_hook(&self, hook: &Arc<dyn RecordHook>) {
        self.hooks.unregister(hook);
    }

    /// Invokes the hook pipeline for an event.
    pub fn callback_hooks(&self, kind: HookKind, record: &mut Record) -> HookDecision {
        self.callback_hooks_with_mode(kind, record, RunMode::Default)
    }

    /// Invokes the hook pipeline under an explicit run mode.
    pub fn callback_hooks_with_mode(
        &self,
        kind: HookKind,
        record: &mut Record,
        run_mode: RunMode,
    ) -> HookDecision {
        self.hooks
            .callback(kind, record, run_mode, self.storage.is_distributed())
    }

    // Security --------------------------------------------------------------

    /// Checks one operation against one resource key.
    pub fn check_security(&self, resource_key: &str, op: u8) -> CoreResult<()> {
        let Some(user) = self.user() else {
            return Ok(());
        };
        user.allow(resource_key, op).map_err(|e| {
            debug!(
                user = user.name(),
                resource = resource_key,
                operation = permission::name(op),
                "access denied"
            );
            e
        })
    }

    /// Checks an operation against specific targets of a generic
    /// resource. A rule defined for any specific target wins over the
    /// generic `<resource>.*` fallback.
    pub fn check_security_specific(
        &self,
        generic: &str,
        op: u8,
        specifics: &[&str],
    ) -> CoreResult<()> {
        let Some(user) = self.user() else {
            return Ok(());
        };

        let mut rule_found = false;
        for target in specifics {
            let key = format!("{generic}.{target}");
            if user.is_rule_defined(&key) {
                rule_found = true;
                user.allow(&key, op)?;
            }
        }
        if !rule_found {
            user.allow(&format!("{generic}.{}", resource::ALL), op)?;
        }
        Ok(())
    }

    fn check_cluster_permission(&self, cluster: Option<&str>, op: u8) -> CoreResult<()> {
        match cluster {
            Some(name) => self.check_security_specific(resource::CLUSTER, op, &[name]),
            None => self.check_security_specific(resource::CLUSTER, op, &[]),
        }
    }

    // Reads -----------------------------------------------------------------

    /// Loads a record.
    ///
    /// Resolution order: the transaction buffer (a delete there
    /// short-circuits to `None` without touching storage or cache), then
    /// the cache unless ignored, then storage. Tombstones skip hooks and
    /// materialisation. `BEFORE_READ` may veto the load.
    pub fn load(
        &self,
        rid: Rid,
        fetch_plan: Option<&str>,
        ignore_cache: bool,
        load_tombstones: bool,
        locking: LockingStrategy,
        tx: Option<&TxBuffer>,
    ) -> CoreResult<Option<Record>> {
        self.ensure_open()?;

        let cluster_name = self.storage.cluster_name_by_id(rid.cluster_id);
        self.check_cluster_permission(cluster_name.as_deref(), permission::READ)?;

        if let Some(plan) = fetch_plan {
            validate_fetch_plan(plan)?;
        }

        if let Some(tx) = tx {
            match tx.record(rid) {
                TxLookup::Deleted => return Ok(None),
                TxLookup::Found(record) => {
                    return self.finish_read(record, rid, locking, ignore_cache, false)
                }
                TxLookup::Miss => {}
            }
        }

        if !ignore_cache {
            if let Some(record) = self.cache.find_record(rid) {
                return self.finish_read(record, rid, locking, ignore_cache, false);
            }
        }

        let Some(buffer) = self.storage.read(rid, load_tombstones)? else {
            return Ok(None);
        };

        let mut record = Record::new(buffer.kind);
        record.fill(rid, buffer.version, buffer.bytes, false);

        if record.is_tombstone() {
            // Tombstones are opaque: no hooks, no cache entry.
            return Ok(Some(record));
        }

        self.finish_read(record, rid, locking, ignore_cache, true)
    }

    fn finish_read(
        &self,
        mut record: Record,
        rid: Rid,
        locking: LockingStrategy,
        ignore_cache: bool,
        update_cache: bool,
    ) -> CoreResult<Option<Record>> {
        if self.callback_hooks(HookKind::BeforeRead, &mut record) == HookDecision::Skip {
            return Ok(None);
        }

        match locking {
            LockingStrategy::KeepShared => self.storage.lock_record(rid, false)?,
            LockingStrategy::KeepExclusive => self.storage.lock_record(rid, true)?,
            LockingStrategy::Default | LockingStrategy::None => {}
        }

        self.callback_hooks(HookKind::AfterRead, &mut record);

        if update_cache && !ignore_cache {
            self.cache.update_record(&record);
        }
        Ok(Some(record))
    }

    /// Re-reads a record from storage into the given instance, bypassing
    /// the cache.
    pub fn reload(&self, record: &mut Record) -> CoreResult<bool> {
        match self.load(
            record.rid(),
            None,
            true,
            false,
            LockingStrategy::Default,
            None,
        )? {
            Some(fresh) => {
                record.fill(fresh.rid(), fresh.version(), fresh.bytes().to_vec(), false);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Record metadata without the payload.
    pub fn record_metadata(&self, rid: Rid) -> CoreResult<Option<crate::storage::RecordMetadata>> {
        self.ensure_open()?;
        self.storage.metadata(rid)
    }

    /// Releases a record lock kept by an earlier load.
    pub fn unlock_record(&self, rid: Rid) -> CoreResult<()> {
        self.storage.unlock_record(rid)
    }

    // Writes ----------------------------------------------------------------

    /// Saves a dirty record.
    ///
    /// Returns without touching storage when the record is clean. New
    /// records get a cluster assigned from `cluster` or the storage
    /// default. `BEFORE_CREATE`/`BEFORE_UPDATE` hooks may mutate, absorb
    /// or substitute the operation. MVCC uses the record's version when
    /// tracking is on, the untracked marker otherwise.
    pub fn save(
        &self,
        record: &mut Record,
        cluster: Option<&str>,
        mode: OperationMode,
        force_create: bool,
        mut created_cb: Option<&mut dyn FnMut(Rid, ClusterPosition)>,
        mut updated_cb: Option<&mut dyn FnMut(Rid, RecordVersion)>,
    ) -> CoreResult<SaveResult> {
        let _ = mode;
        self.ensure_open()?;

        if !record.is_dirty() {
            return Ok(SaveResult::Saved);
        }

        let was_new = force_create || record.rid().is_new();
        if was_new && record.rid().cluster_id < 0 {
            let cluster_id = match cluster {
                Some(name) => {
                    self.storage
                        .cluster_id_by_name(name)
                        .ok_or_else(|| CoreError::ClusterNotFound {
                            cluster: name.to_string(),
                        })?
                }
                None => self.storage.default_cluster_id(),
            };
            record.set_identity_parts(cluster_id, record.rid().position);
        }

        if !was_new && record.bytes().is_empty() {
            // Already created and waiting for the real payload.
            return Ok(SaveResult::Saved);
        }

        let cluster_name = match cluster {
            Some(name) => Some(name.to_string()),
            None => self.storage.cluster_name_by_id(record.rid().cluster_id),
        };

        record.set_status(RecordStatus::Marshalling);
        let result = self.save_locked(
            record,
            was_new,
            cluster_name.as_deref(),
            force_create,
            &mut created_cb,
            &mut updated_cb,
        );
        record.set_status(RecordStatus::Loaded);

        result.map_err(|e| match e {
            e @ (CoreError::MvccConflict { .. }
            | CoreError::AccessDenied { .. }
            | CoreError::RecordNotFound { .. }
            | CoreError::ClusterNotFound { .. }
            | CoreError::ClassMismatch { .. }
            | CoreError::StorageFrozen) => e,
            other => CoreError::internal(format!(
                "error saving record {}: {other}",
                record.rid()
            )),
        })
    }

    fn save_locked(
        &self,
        record: &mut Record,
        was_new: bool,
        cluster_name: Option<&str>,
        force_create: bool,
        created_cb: &mut Option<&mut dyn FnMut(Rid, ClusterPosition)>,
        updated_cb: &mut Option<&mut dyn FnMut(Rid, RecordVersion)>,
    ) -> CoreResult<SaveResult> {
        // Index modification locks, lexicographic by name, held until the
        // end of the save.
        let indexes = index::lock_order(self.index_manager.indexes_for_cluster(record.rid().cluster_id));
        let _guards: Vec<_> = indexes.iter().map(|i| i.lock_modification()).collect();

        self.check_record_class(record, was_new, cluster_name)?;
        self.check_cluster_permission(
            cluster_name,
            if was_new {
                permission::CREATE
            } else {
                permission::UPDATE
            },
        )?;

        if !record.bytes().is_empty() {
            let kind = if was_new {
                HookKind::BeforeCreate
            } else {
                HookKind::BeforeUpdate
            };
            match self.callback_hooks(kind, record) {
                HookDecision::SkipIo => return Ok(SaveResult::SkippedIo),
                HookDecision::Replaced(substitute) => {
                    return Ok(SaveResult::Replaced(substitute))
                }
                // Skip only stops the remaining hooks; the save proceeds.
                HookDecision::Skip | HookDecision::Changed | HookDecision::Unchanged => {}
            }
        }

        if !record.is_dirty() {
            return Ok(SaveResult::Saved);
        }

        let real_version = if self.is_mvcc() && record.version().is_tracked() {
            record.version()
        } else {
            RecordVersion::Untracked
        };

        let operation = match self.storage.save(
            record.rid(),
            record.bytes(),
            real_version,
            record.kind(),
            force_create,
        ) {
            Ok(op) => op,
            Err(e) => {
                let kind = if was_new {
                    HookKind::CreateFailed
                } else {
                    HookKind::UpdateFailed
                };
                self.callback_hooks(kind, record);
                return Err(e);
            }
        };

        let (assigned, new_version) = operation.result;
        if was_new {
            record.set_identity(assigned);
            if let Some(cb) = created_cb.as_mut() {
                cb(assigned, assigned.position);
            }
        } else if let Some(cb) = updated_cb.as_mut() {
            cb(assigned, new_version);
        }

        let bytes = record.bytes().to_vec();
        record.fill(assigned, new_version, bytes, false);

        let success_kind = match (operation.moved, was_new) {
            (false, true) => HookKind::AfterCreate,
            (false, false) => HookKind::AfterUpdate,
            (true, true) => HookKind::CreateReplicated,
            (true, false) => HookKind::UpdateReplicated,
        };
        self.callback_hooks(success_kind, record);

        if !operation.moved {
            self.cache.update_record(record);
        }
        Ok(SaveResult::Saved)
    }

    fn check_record_class(
        &self,
        record: &Record,
        was_new: bool,
        cluster_name: Option<&str>,
    ) -> CoreResult<()> {
        if !was_new || !self.storage.classes_detected_by_cluster_id() {
            return Ok(());
        }
        let bound = self
            .storage
            .clusters()
            .into_iter()
            .find(|c| c.id == record.rid().cluster_id)
            .and_then(|c| c.class);
        match (record.class(), bound.as_deref()) {
            (None, None) => Ok(()),
            (Some(actual), Some(expected)) if actual == expected => Ok(()),
            (actual, expected) => Err(CoreError::ClassMismatch {
                cluster: cluster_name.unwrap_or("?").to_string(),
                expected: expected.unwrap_or("<none>").to_string(),
                actual: actual.unwrap_or("<none>").to_string(),
            }),
        }
    }

    /// Deletes a record.
    ///
    /// `prohibit_tombstones` removes the slot entirely instead of leaving
    /// a tombstone. Returns false when the record does not exist and
    /// `require_exists` is off.
    pub fn delete(
        &self,
        rid: Rid,
        version: RecordVersion,
        require_exists: bool,
        call_hooks: bool,
        mode: OperationMode,
        prohibit_tombstones: bool,
    ) -> CoreResult<bool> {
        let _ = mode;
        self.ensure_open()?;
        if rid.is_new() {
            return Ok(false);
        }

        let cluster_name = self.storage.cluster_name_by_id(rid.cluster_id);
        self.check_cluster_permission(cluster_name.as_deref(), permission::DELETE)?;

        let Some(buffer) = self.storage.read(rid, false)? else {
            return if require_exists {
                Err(CoreError::RecordNotFound { rid })
            } else {
                Ok(false)
            };
        };

        let mut record = Record::new(buffer.kind);
        record.fill(rid, buffer.version, buffer.bytes, false);

        if call_hooks {
            match self.callback_hooks(HookKind::BeforeDelete, &mut record) {
                HookDecision::Skip | HookDecision::SkipIo => return Ok(false),
                _ => {}
            }
        }

        let real_version = if self.is_mvcc() {
            version
        } else {
            RecordVersion::Untracked
        };

        let operation = {
            let attempt = if prohibit_tombstones {
                self.storage.clean_out(rid, real_version)
            } else {
                self.storage.delete(rid, real_version)
            };
            match attempt {
                Ok(op) => op,
                Err(e) => {
                    if call_hooks {
                        self.callback_hooks(HookKind::DeleteFailed, &mut record);
                    }
                    return Err(e);
                }
            }
        };

        if call_hooks {
            let kind = if operation.moved {
                HookKind::DeleteReplicated
            } else {
                HookKind::AfterDelete
            };
            self.callback_hooks(kind, &mut record);
        }

        if !operation.moved {
            self.cache.delete_record(rid);
        }
        Ok(operation.result)
    }

    /// Hides a record. No hooks fire.
    pub fn hide(&self, rid: Rid, mode: OperationMode) -> CoreResult<bool> {
        let _ = mode;
        self.ensure_open()?;
        if rid.is_new() {
            return Ok(false);
        }

        let cluster_name = self.storage.cluster_name_by_id(rid.cluster_id);
        self.check_cluster_permission(cluster_name.as_deref(), permission::DELETE)?;

        let operation = self.storage.hide(rid)?;
        if !operation.moved {
            self.cache.delete_record(rid);
        }
        Ok(operation.result)
    }

    // Transactions ----------------------------------------------------------

    /// Commits a buffered transaction: creates first (storage assigns the
    /// final identities), then updates, then deletes. On failure the
    /// buffer is rolled back and collection-change tracking cleared.
    pub fn commit(&self, tx: &mut TxBuffer) -> CoreResult<CommitOutcome> {
        self.ensure_open()?;
        if !tx.is_active() {
            return Err(CoreError::invalid_operation("transaction not active"));
        }

        match self.commit_replay(tx) {
            Ok(outcome) => {
                tx.finish();
                Ok(outcome)
            }
            Err(e) => {
                self.rollback(tx);
                Err(e)
            }
        }
    }

    fn commit_replay(&self, tx: &TxBuffer) -> CoreResult<CommitOutcome> {
        let mut outcome = CommitOutcome::default();

        for entry in tx.created_entries().to_vec() {
            let mut record = entry.record;
            match self.save(
                &mut record,
                None,
                OperationMode::Synchronous,
                false,
                None,
                None,
            )? {
                SaveResult::Saved => {
                    outcome.created.push((entry.client_rid, record.rid()));
                    if entry.also_updated {
                        outcome.updated.push((record.rid(), record.version()));
                    }
                }
                SaveResult::SkippedIo | SaveResult::Replaced(_) => {}
            }
        }

        for (rid, mut record) in tx.updated_entries() {
            match self.save(
                &mut record,
                None,
                OperationMode::Synchronous,
                false,
                None,
                None,
            )? {
                SaveResult::Saved => outcome.updated.push((rid, record.version())),
                SaveResult::SkippedIo | SaveResult::Replaced(_) => {}
            }
        }

        for (rid, version) in tx.deleted_entries() {
            self.delete(rid, version, false, true, OperationMode::Synchronous, false)?;
        }

        if let Some(cm) = self.collection_manager() {
            outcome.collection_changes = cm.changed_ids();
            cm.clear_changed_ids();
        }
        Ok(outcome)
    }

    /// Discards a transaction and clears collection-change tracking.
    pub fn rollback(&self, tx: &mut TxBuffer) {
        tx.clear();
        if let Some(cm) = self.collection_manager() {
            cm.clear_changed_ids();
        }
    }

    // Clusters --------------------------------------------------------------

    /// Counts elements across clusters, checking read permission on each.
    pub fn count_cluster_elements(&self, ids: &[i16], count_tombstones: bool) -> CoreResult<i64> {
        self.ensure_open()?;
        for id in ids {
            let name = self.storage.cluster_name_by_id(*id);
            self.check_cluster_permission(name.as_deref(), permission::READ)?;
        }
        self.storage.count_cluster_elements(ids, count_tombstones)
    }

    /// Loads the records of a cluster within an optional position range.
    pub fn browse_cluster(
        &self,
        cluster: &str,
        range: Option<(ClusterPosition, ClusterPosition)>,
        load_tombstones: bool,
    ) -> CoreResult<Vec<Record>> {
        self.ensure_open()?;
        self.check_security_specific(resource::CLUSTER, permission::READ, &[cluster])?;

        let id = self
            .storage
            .cluster_id_by_name(cluster)
            .ok_or_else(|| CoreError::ClusterNotFound {
                cluster: cluster.to_string(),
            })?;

        let (from, to) = match range {
            Some(bounds) => bounds,
            None => self.storage.cluster_data_range(id)?,
        };
        if !from.is_valid() || !to.is_valid() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        for slot in self.storage.ceiling_positions(id, from)? {
            if slot.position > to {
                break;
            }
            let rid = Rid::new(id, slot.position);
            if let Some(record) = self.load(
                rid,
                None,
                false,
                load_tombstones,
                LockingStrategy::Default,
                None,
            )? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Adds a cluster.
    pub fn add_cluster(&self, name: &str, requested_id: Option<i16>) -> CoreResult<i16> {
        self.ensure_open()?;
        self.check_security(resource::DATABASE, permission::UPDATE)?;
        self.storage.add_cluster(name, requested_id)
    }

    /// Drops a cluster by id.
    pub fn drop_cluster(&self, id: i16) -> CoreResult<bool> {
        self.ensure_open()?;
        self.check_security(resource::DATABASE, permission::UPDATE)?;
        self.storage.drop_cluster(id)
    }

    // Freeze ----------------------------------------------------------------

    /// Suspends writes on the storage.
    pub fn freeze(&self) -> CoreResult<()> {
        self.ensure_open()?;
        self.storage.freeze()
    }

    /// Resumes writes on the storage.
    pub fn release(&self) -> CoreResult<()> {
        self.ensure_open()?;
        self.storage.release()
    }

    /// Suspends writes on one cluster.
    pub fn freeze_cluster(&self, id: i16) -> CoreResult<()> {
        self.ensure_open()?;
        self.storage.freeze_cluster(id)
    }

    /// Resumes writes on one cluster.
    pub fn release_cluster(&self, id: i16) -> CoreResult<()> {
        self.ensure_open()?;
        self.storage.release_cluster(id)
    }

    /// Internal seam for tests: the canonical index lock order for a
    /// cluster.
    #[doc(hidden)]
    pub fn index_lock_plan(&self, cluster_id: i16) -> Vec<String> {
        index::lock_order(self.index_manager.indexes_for_cluster(cluster_id))
            .iter()
            .map(|i| i.name().to_string())
            .collect()
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name)
            .field("is_open", &self.is_open())
            .finish_non_exhaustive()
    }
}

fn validate_fetch_plan(plan: &str) -> CoreResult<()> {
    for item in plan.split_whitespace() {
        let Some((field, depth)) = item.rsplit_once(':') else {
            return Err(CoreError::invalid_operation(format!(
                "fetch plan item '{item}' is not of the form field:depth"
            )));
        };
        if field.is_empty() || depth.parse::<i32>().map(|d| d < -2).unwrap_or(true) {
            return Err(CoreError::invalid_operation(format!(
                "fetch plan item '{item}' has an invalid depth"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{Index, MemoryIndexManager};
    use crate::security::Role;
    use crate::storage::MemoryStorage;
    use parking_lot::Mutex;

    struct Harness {
        db: Database,
        storage: Arc<MemoryStorage>,
        cluster: i16,
    }

    fn open_db() -> Harness {
        let storage = Arc::new(MemoryStorage::new());
        let cluster = storage.add_cluster("demo", None).unwrap();
        let db = Database::new(
            "test",
            Arc::clone(&storage) as Arc<dyn Storage>,
            Arc::new(SecurityManager::with_admin()),
            Arc::new(MemoryIndexManager::new()),
        );
        db.open("admin", "admin").unwrap();
        Harness {
            db,
            storage,
            cluster,
        }
    }

    fn dirty_record(bytes: Vec<u8>) -> Record {
        Record::with_bytes(Record::KIND_DOCUMENT, bytes)
    }

    #[test]
    fn create_save_load_roundtrip() {
        let h = open_db();
        let mut record = dirty_record(vec![1, 2, 3]);

        let result = h
            .db
            .save(
                &mut record,
                Some("demo"),
                OperationMode::Synchronous,
                false,
                None,
                None,
            )
            .unwrap();
        assert_eq!(result, SaveResult::Saved);
        assert!(record.rid().is_persistent());
        assert_eq!(record.rid().cluster_id, h.cluster);
        assert_eq!(record.version(), RecordVersion::Tracked(1));

        let loaded = h
            .db
            .load(record.rid(), None, false, false, LockingStrategy::Default, None)
            .unwrap()
            .unwrap();
        assert_eq!(loaded.bytes(), &[1, 2, 3]);
        assert_eq!(loaded.version(), record.version());
    }

    #[test]
    fn record_type_is_configurable() {
        let h = open_db();
        assert_eq!(h.db.record_type(), Record::KIND_DOCUMENT);

        let mut record = h.db.new_record();
        assert_eq!(record.kind(), Record::KIND_DOCUMENT);
        record.set_bytes(vec![7]);
        h.db.save(
            &mut record,
            Some("demo"),
            OperationMode::Synchronous,
            false,
            None,
            None,
        )
        .unwrap();
        assert!(record.rid().is_persistent());

        h.db.set_record_type(Record::KIND_FLAT);
        assert_eq!(h.db.new_record().kind(), Record::KIND_FLAT);
    }

    #[test]
    fn clean_record_save_is_a_no_op() {
        let h = open_db();
        let mut record = Record::new(Record::KIND_DOCUMENT);
        let result = h
            .db
            .save(
                &mut record,
                Some("demo"),
                OperationMode::Synchronous,
                false,
                None,
                None,
            )
            .unwrap();
        assert_eq!(result, SaveResult::Saved);
        assert!(record.rid().is_new());
        assert_eq!(h.storage.count_records().unwrap(), 0);
    }

    #[test]
    fn created_callback_fires_with_assigned_identity() {
        let h = open_db();
        let mut record = dirty_record(vec![5]);
        let seen = Mutex::new(None);
        let mut cb = |rid: Rid, pos: ClusterPosition| {
            *seen.lock() = Some((rid, pos));
        };

        h.db.save(
            &mut record,
            Some("demo"),
            OperationMode::Synchronous,
            false,
            Some(&mut cb),
            None,
        )
        .unwrap();

        let (rid, pos) = seen.lock().unwrap();
        assert_eq!(rid, record.rid());
        assert_eq!(pos, record.rid().position);
    }

    #[test]
    fn mvcc_conflict_leaves_cache_clean() {
        let h = open_db();
        let mut record = dirty_record(vec![1]);
        h.db.save(
            &mut record,
            Some("demo"),
            OperationMode::Synchronous,
            false,
            None,
            None,
        )
        .unwrap();
        let rid = record.rid();

        // Writer A: v1 -> v2.
        let mut a = dirty_record(vec![2]);
        a.set_identity(rid);
        a.set_version(RecordVersion::Tracked(1));
        h.db.save(&mut a, None, OperationMode::Synchronous, false, None, None)
            .unwrap();

        // Writer B still carries v1 and must fail.
        let mut b = dirty_record(vec![3]);
        b.set_identity(rid);
        b.set_version(RecordVersion::Tracked(1));
        let err = h
            .db
            .save(&mut b, None, OperationMode::Synchronous, false, None, None)
            .unwrap_err();
        assert!(matches!(err, CoreError::MvccConflict { .. }));

        // Neither the cache nor storage reflects B's payload.
        let cached = h.db.local_cache().find_record(rid).unwrap();
        assert_eq!(cached.bytes(), &[2]);
        let stored = h.storage.read(rid, false).unwrap().unwrap();
        assert_eq!(stored.bytes, vec![2]);
    }

    struct DecisionHook {
        kind: HookKind,
        decision: Mutex<Option<HookDecision>>,
    }

    impl DecisionHook {
        fn once(kind: HookKind, decision: HookDecision) -> Arc<Self> {
            Arc::new(Self {
                kind,
                decision: Mutex::new(Some(decision)),
            })
        }
    }

    impl RecordHook for DecisionHook {
        fn on_trigger(&self, kind: HookKind, _record: &mut Record) -> HookDecision {
            if kind == self.kind {
                if let Some(decision) = self.decision.lock().take() {
                    return decision;
                }
            }
            HookDecision::Unchanged
        }
    }

    #[test]
    fn skip_io_bypasses_storage_and_cache() {
        let h = open_db();
        h.db.register_hook(
            DecisionHook::once(HookKind::BeforeCreate, HookDecision::SkipIo),
            HookPosition::Regular,
        );

        let mut record = dirty_record(vec![1]);
        let result = h
            .db
            .save(
                &mut record,
                Some("demo"),
                OperationMode::Synchronous,
                false,
                None,
                None,
            )
            .unwrap();

        assert_eq!(result, SaveResult::SkippedIo);
        assert_eq!(h.storage.count_records().unwrap(), 0);
        assert!(h.db.local_cache().is_empty());
    }

    #[test]
    fn replaced_record_reaches_caller_not_storage() {
        let h = open_db();
        let mut original = dirty_record(vec![1]);
        h.db.save(
            &mut original,
            Some("demo"),
            OperationMode::Synchronous,
            false,
            None,
            None,
        )
        .unwrap();
        let rid = original.rid();

        let substitute = dirty_record(vec![42]);
        h.db.register_hook(
            DecisionHook::once(HookKind::BeforeUpdate, HookDecision::Replaced(substitute)),
            HookPosition::Regular,
        );

        let mut update = dirty_record(vec![7]);
        update.set_identity(rid);
        update.set_version(RecordVersion::Tracked(1));
        let result = h
            .db
            .save(&mut update, None, OperationMode::Synchronous, false, None, None)
            .unwrap();

        match result {
            SaveResult::Replaced(record) => assert_eq!(record.bytes(), &[42]),
            other => panic!("expected replacement, got {other:?}"),
        }
        // The stored image is still the original.
        let stored = h.storage.read(rid, false).unwrap().unwrap();
        assert_eq!(stored.bytes, vec![1]);
    }

    #[test]
    fn tx_deleted_lookup_short_circuits_load() {
        let h = open_db();
        let mut record = dirty_record(vec![1]);
        h.db.save(
            &mut record,
            Some("demo"),
            OperationMode::Synchronous,
            false,
            None,
            None,
        )
        .unwrap();
        let rid = record.rid();

        let mut tx = TxBuffer::new(7);
        tx.begin();
        tx.delete(rid, record.version());

        let loaded = h
            .db
            .load(rid, None, false, false, LockingStrategy::Default, Some(&tx))
            .unwrap();
        assert!(loaded.is_none());
        // Storage still holds the record; only the tx view hides it.
        assert!(h.storage.read(rid, false).unwrap().is_some());
    }

    #[test]
    fn delete_fires_hooks_and_evicts_cache() {
        let h = open_db();
        let mut record = dirty_record(vec![1]);
        h.db.save(
            &mut record,
            Some("demo"),
            OperationMode::Synchronous,
            false,
            None,
            None,
        )
        .unwrap();
        let rid = record.rid();
        assert!(h.db.local_cache().find_record(rid).is_some());

        let deleted = h
            .db
            .delete(
                rid,
                record.version(),
                true,
                true,
                OperationMode::Synchronous,
                false,
            )
            .unwrap();
        assert!(deleted);
        assert!(h.db.local_cache().find_record(rid).is_none());
        assert!(h
            .db
            .load(rid, None, false, false, LockingStrategy::Default, None)
            .unwrap()
            .is_none());
    }

    #[test]
    fn hide_removes_without_hooks() {
        let h = open_db();
        let fired = Arc::new(Mutex::new(false));

        struct AnyHook(Arc<Mutex<bool>>);
        impl RecordHook for AnyHook {
            fn on_trigger(&self, _: HookKind, _: &mut Record) -> HookDecision {
                *self.0.lock() = true;
                HookDecision::Unchanged
            }
        }

        let mut record = dirty_record(vec![1]);
        h.db.save(
            &mut record,
            Some("demo"),
            OperationMode::Synchronous,
            false,
            None,
            None,
        )
        .unwrap();

        h.db.register_hook(Arc::new(AnyHook(Arc::clone(&fired))), HookPosition::Regular);
        assert!(h.db.hide(record.rid(), OperationMode::Synchronous).unwrap());
        assert!(!*fired.lock());
        assert!(h
            .db
            .load(record.rid(), None, false, false, LockingStrategy::Default, None)
            .unwrap()
            .is_none());
    }

    #[test]
    fn commit_reports_created_and_collapsed_update() {
        let h = open_db();

        let mut created = dirty_record(vec![1]);
        created.set_identity(Rid::new(h.cluster, ClusterPosition::new(-2)));

        let mut tx = TxBuffer::new(3);
        tx.begin();
        let client_rid = created.rid();
        tx.create(created);

        let mut updated = dirty_record(vec![9, 9]);
        updated.set_identity(client_rid);
        tx.update(updated);

        let outcome = h.db.commit(&mut tx).unwrap();
        assert_eq!(outcome.created.len(), 1);
        assert_eq!(outcome.updated.len(), 1);

        let (reported_client, server_rid) = outcome.created[0];
        assert_eq!(reported_client, client_rid);
        assert!(server_rid.is_persistent());
        // The collapsed update reports the server identity.
        assert_eq!(outcome.updated[0].0, server_rid);

        // The stored payload is the updated one.
        let stored = h.storage.read(server_rid, false).unwrap().unwrap();
        assert_eq!(stored.bytes, vec![9, 9]);
    }

    #[test]
    fn commit_collects_collection_changes() {
        let h = open_db();
        let cm = h.db.collection_manager().unwrap();
        let pointer = cm.create(i32::from(h.cluster)).unwrap();
        cm.record_change(Uuid::new_v4(), pointer);

        let mut tx = TxBuffer::new(4);
        tx.begin();
        let mut record = dirty_record(vec![1]);
        record.set_identity(Rid::new(h.cluster, ClusterPosition::new(-2)));
        tx.create(record);

        let outcome = h.db.commit(&mut tx).unwrap();
        assert_eq!(outcome.collection_changes.len(), 1);
        assert_eq!(outcome.collection_changes[0].1, pointer);
        // Collected changes are cleared.
        assert!(cm.changed_ids().is_empty());
    }

    #[test]
    fn failed_commit_rolls_back() {
        let h = open_db();

        // An update of a missing record fails the replay.
        let mut tx = TxBuffer::new(5);
        tx.begin();
        let mut ghost = dirty_record(vec![1]);
        ghost.set_identity(Rid::new(h.cluster, ClusterPosition::new(555)));
        ghost.set_version(RecordVersion::Tracked(1));
        tx.update(ghost);

        assert!(h.db.commit(&mut tx).is_err());
        assert!(!tx.is_active());
        assert!(tx.is_empty());
    }

    #[test]
    fn index_lock_plan_is_sorted() {
        let storage = Arc::new(MemoryStorage::new());
        let cluster = storage.add_cluster("demo", None).unwrap();
        let indexes = MemoryIndexManager::new();
        indexes.register(cluster, Arc::new(Index::new("demo.zeta")));
        indexes.register(cluster, Arc::new(Index::new("demo.alpha")));
        indexes.register(cluster, Arc::new(Index::new("demo.mid")));

        let db = Database::new(
            "test",
            storage as Arc<dyn Storage>,
            Arc::new(SecurityManager::with_admin()),
            Arc::new(indexes),
        );
        db.open("admin", "admin").unwrap();

        let plan = db.index_lock_plan(cluster);
        assert_eq!(plan, vec!["demo.alpha", "demo.mid", "demo.zeta"]);
        for pair in plan.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
    }

    #[test]
    fn cluster_read_permission_is_enforced() {
        let storage = Arc::new(MemoryStorage::new());
        let cluster = storage.add_cluster("secret", None).unwrap();
        let security = SecurityManager::with_admin();
        security.put_user(User::new(
            "reader",
            "pw",
            vec![Role::new("reader")
                .with_rule("database", permission::READ)
                .with_rule("cluster.public", permission::READ)],
        ));

        let db = Database::new(
            "test",
            storage as Arc<dyn Storage>,
            Arc::new(security),
            Arc::new(MemoryIndexManager::new()),
        );
        db.open("reader", "pw").unwrap();

        let err = db
            .load(
                Rid::new(cluster, ClusterPosition::new(0)),
                None,
                false,
                false,
                LockingStrategy::Default,
                None,
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::AccessDenied { .. }));
    }

    #[test]
    fn specific_rule_wins_over_generic() {
        let storage = Arc::new(MemoryStorage::new());
        storage.add_cluster("open", None).unwrap();
        let security = SecurityManager::new();
        // The wildcard grants everything, but "locked" carries its own
        // narrower rule that must win.
        security.put_user(User::new(
            "mixed",
            "pw",
            vec![Role::new("mixed")
                .with_rule("database", permission::READ)
                .with_rule("cluster.*", permission::ALL)
                .with_rule("cluster.locked", permission::READ)],
        ));

        let db = Database::new(
            "test",
            storage as Arc<dyn Storage>,
            Arc::new(security),
            Arc::new(MemoryIndexManager::new()),
        );
        db.open("mixed", "pw").unwrap();

        // Specific rule grants read.
        db.check_security_specific(resource::CLUSTER, permission::READ, &["locked"])
            .unwrap();
        // Specific rule denies delete even though the wildcard allows it.
        assert!(db
            .check_security_specific(resource::CLUSTER, permission::DELETE, &["locked"])
            .is_err());
        // Unlisted target falls back to the wildcard.
        db.check_security_specific(resource::CLUSTER, permission::DELETE, &["open"])
            .unwrap();
    }

    #[test]
    fn roleless_user_repair_requires_listener_consent() {
        struct Approve;
        impl DatabaseListener for Approve {
            fn on_corruption_repair(&self, _: &Database, _: &str, _: &str) -> bool {
                true
            }
        }

        // Without a listener the role-less user is kept, and then fails
        // the read-permission check: the open errors out.
        let storage = Arc::new(MemoryStorage::new());
        let security = SecurityManager::new();
        security.put_user(User::new("broken", "pw", vec![]));
        let db = Database::new(
            "test",
            Arc::clone(&storage) as Arc<dyn Storage>,
            Arc::new(security),
            Arc::new(MemoryIndexManager::new()),
        );
        assert!(matches!(
            db.open("broken", "pw"),
            Err(CoreError::AccessDenied { .. })
        ));
        assert!(!db.is_open());

        // With an approving listener the default admin is reinstalled.
        let security = SecurityManager::new();
        security.put_user(User::new("broken", "pw", vec![]));
        let db = Database::new(
            "test",
            storage as Arc<dyn Storage>,
            Arc::new(security),
            Arc::new(MemoryIndexManager::new()),
        );
        db.add_listener(Arc::new(Approve));
        db.open("broken", "pw").unwrap();
        assert_eq!(db.user().unwrap().name(), "admin");
    }

    #[test]
    fn closed_database_rejects_operations() {
        let h = open_db();
        h.db.close();
        let err = h
            .db
            .load(
                Rid::new(h.cluster, ClusterPosition::new(0)),
                None,
                false,
                false,
                LockingStrategy::Default,
                None,
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::DatabaseClosed { .. }));
    }

    #[test]
    fn browse_cluster_returns_live_records_in_order() {
        let h = open_db();
        for i in 0..3u8 {
            let mut record = dirty_record(vec![i]);
            h.db.save(
                &mut record,
                Some("demo"),
                OperationMode::Synchronous,
                false,
                None,
                None,
            )
            .unwrap();
        }

        let records = h.db.browse_cluster("demo", None, false).unwrap();
        assert_eq!(records.len(), 3);
        let payloads: Vec<u8> = records.iter().map(|r| r.bytes()[0]).collect();
        assert_eq!(payloads, vec![0, 1, 2]);
    }

    #[test]
    fn tombstone_load_is_opaque() {
        let h = open_db();
        let mut record = dirty_record(vec![1]);
        h.db.save(
            &mut record,
            Some("demo"),
            OperationMode::Synchronous,
            false,
            None,
            None,
        )
        .unwrap();
        let rid = record.rid();
        h.db.delete(
            rid,
            record.version(),
            true,
            false,
            OperationMode::Synchronous,
            false,
        )
        .unwrap();

        assert!(h
            .db
            .load(rid, None, false, false, LockingStrategy::Default, None)
            .unwrap()
            .is_none());

        let tombstone = h
            .db
            .load(rid, None, false, true, LockingStrategy::Default, None)
            .unwrap()
            .unwrap();
        assert!(tombstone.is_tombstone());
        // Tombstones never land in the cache.
        assert!(h.db.local_cache().find_record(rid).is_none());
    }

    #[test]
    fn keep_exclusive_lock_escalates() {
        let h = open_db();
        let mut record = dirty_record(vec![1]);
        h.db.save(
            &mut record,
            Some("demo"),
            OperationMode::Synchronous,
            false,
            None,
            None,
        )
        .unwrap();
        let rid = record.rid();

        h.db.load(
            rid,
            None,
            true,
            false,
            LockingStrategy::KeepExclusive,
            None,
        )
        .unwrap();
        // A second keep-lock read conflicts until the lock is released.
        assert!(h
            .db
            .load(rid, None, true, false, LockingStrategy::KeepShared, None)
            .is_err());
        h.db.unlock_record(rid).unwrap();
        assert!(h
            .db
            .load(rid, None, true, false, LockingStrategy::KeepShared, None)
            .is_ok());
    }

    #[test]
    fn fetch_plan_validation() {
        let h = open_db();
        let rid = Rid::new(h.cluster, ClusterPosition::new(0));
        assert!(h
            .db
            .load(rid, Some("*:-1"), false, false, LockingStrategy::Default, None)
            .is_ok());
        assert!(h
            .db
            .load(rid, Some("nonsense"), false, false, LockingStrategy::Default, None)
            .is_err());
    }
}
