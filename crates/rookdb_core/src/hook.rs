//! The record hook pipeline.
//!
//! Hooks observe and steer record lifecycle events. Dispatch is stable:
//! by position first, then by registration order within a position. A
//! per-thread reentrancy set stops a hook that touches records from
//! re-triggering the pipeline for the same record.

use crate::record::Record;
use parking_lot::RwLock;
use rookdb_wire::Rid;
use std::cell::RefCell;
use std::collections::HashSet;
use std::sync::Arc;

/// Dispatch slot of a hook. Lower positions fire first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HookPosition {
    /// Before everything else.
    First,
    /// After the first wave.
    Early,
    /// The default slot.
    Regular,
    /// After the regular wave.
    Late,
    /// After everything else.
    Last,
}

/// Lifecycle event a hook is invoked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    /// About to create.
    BeforeCreate,
    /// Created locally.
    AfterCreate,
    /// Creation failed.
    CreateFailed,
    /// Created, but the write was rerouted to another node.
    CreateReplicated,
    /// About to materialise a read.
    BeforeRead,
    /// Read completed.
    AfterRead,
    /// About to update.
    BeforeUpdate,
    /// Updated locally.
    AfterUpdate,
    /// Update failed.
    UpdateFailed,
    /// Updated, but the write was rerouted to another node.
    UpdateReplicated,
    /// About to delete.
    BeforeDelete,
    /// Deleted locally.
    AfterDelete,
    /// Deletion failed.
    DeleteFailed,
    /// Deleted, but the write was rerouted to another node.
    DeleteReplicated,
}

/// What a hook (or the whole pipeline) decided about the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookDecision {
    /// Nothing changed; continue.
    Unchanged,
    /// The hook mutated the record; the caller must reserialise.
    Changed,
    /// Stop the pipeline and skip the record.
    Skip,
    /// Stop the pipeline and skip the I/O, reporting success.
    SkipIo,
    /// Stop the pipeline; the caller gets this record instead.
    Replaced(Record),
}

/// Where a hook runs in a distributed deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributedMode {
    /// Runs on both the source and the target node.
    Both,
    /// Runs only on the node that stores the record.
    TargetNode,
    /// Runs only on the node the client talked to.
    SourceNode,
}

/// Execution mode of the current request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// A plain request, possibly proxied.
    #[default]
    Default,
    /// Executing on behalf of another node.
    RunningDistributed,
}

/// A record lifecycle callback.
pub trait RecordHook: Send + Sync {
    /// Invoked for each lifecycle event.
    fn on_trigger(&self, kind: HookKind, record: &mut Record) -> HookDecision;

    /// Distributed placement of this hook.
    fn distributed_mode(&self) -> DistributedMode {
        DistributedMode::Both
    }

    /// Invoked when the hook is removed from its registry.
    fn on_unregister(&self) {}
}

struct HookEntry {
    hook: Arc<dyn RecordHook>,
    position: HookPosition,
}

/// Ordered hook registry, copy-on-write under structural change.
pub struct HookRegistry {
    entries: RwLock<Arc<Vec<HookEntry>>>,
}

thread_local! {
    static ACTIVE_RECORDS: RefCell<HashSet<(i16, i64)>> = RefCell::new(HashSet::new());
}

fn identity_key(record: &Record) -> (i16, i64) {
    let rid = record.rid();
    if rid.is_persistent() {
        (rid.cluster_id, rid.position.as_i64())
    } else {
        // Unplaced records have no stable identity; key on the instance.
        (Rid::CLUSTER_ID_INVALID, record as *const Record as i64)
    }
}

struct ReentrancyGuard {
    key: (i16, i64),
}

impl ReentrancyGuard {
    fn enter(key: (i16, i64)) -> Option<Self> {
        let entered = ACTIVE_RECORDS.with(|set| set.borrow_mut().insert(key));
        entered.then_some(Self { key })
    }
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        ACTIVE_RECORDS.with(|set| {
            set.borrow_mut().remove(&self.key);
        });
    }
}

impl HookRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Registers a hook at a position. Re-registering an already-known
    /// hook moves it to the new position, keeping dispatch stable.
    pub fn register(&self, hook: Arc<dyn RecordHook>, position: HookPosition) {
        let mut entries = self.entries.write();
        let mut next: Vec<HookEntry> = entries
            .iter()
            .filter(|e| !Arc::ptr_eq(&e.hook, &hook))
            .map(|e| HookEntry {
                hook: Arc::clone(&e.hook),
                position: e.position,
            })
            .collect();
        next.push(HookEntry { hook, position });
        next.sort_by_key(|e| e.position);
        *entries = Arc::new(next);
    }

    /// Removes a hook, notifying it.
    pub fn unregister(&self, hook: &Arc<dyn RecordHook>) {
        let mut entries = self.entries.write();
        let next: Vec<HookEntry> = entries
            .iter()
            .filter(|e| !Arc::ptr_eq(&e.hook, hook))
            .map(|e| HookEntry {
                hook: Arc::clone(&e.hook),
                position: e.position,
            })
            .collect();
        if next.len() != entries.len() {
            hook.on_unregister();
        }
        *entries = Arc::new(next);
    }

    /// Removes every hook, notifying each.
    pub fn clear(&self) {
        let mut entries = self.entries.write();
        for entry in entries.iter() {
            entry.hook.on_unregister();
        }
        *entries = Arc::new(Vec::new());
    }

    /// Number of registered hooks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when no hook is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invokes the pipeline for an event.
    ///
    /// Returns the first short-circuiting decision, `Changed` when any
    /// hook mutated the record, `Unchanged` otherwise. Re-entry for the
    /// same record on the same thread returns `Unchanged` without
    /// invoking anything.
    pub fn callback(
        &self,
        kind: HookKind,
        record: &mut Record,
        run_mode: RunMode,
        distributed_storage: bool,
    ) -> HookDecision {
        let snapshot = Arc::clone(&self.entries.read());
        if snapshot.is_empty() {
            return HookDecision::Unchanged;
        }

        let Some(_guard) = ReentrancyGuard::enter(identity_key(record)) else {
            return HookDecision::Unchanged;
        };

        let mut changed = false;
        for entry in snapshot.iter() {
            match run_mode {
                RunMode::Default => {
                    if distributed_storage
                        && entry.hook.distributed_mode() == DistributedMode::TargetNode
                    {
                        continue;
                    }
                }
                RunMode::RunningDistributed => {
                    if entry.hook.distributed_mode() == DistributedMode::SourceNode {
                        continue;
                    }
                }
            }

            match entry.hook.on_trigger(kind, record) {
                HookDecision::Unchanged => {}
                HookDecision::Changed => changed = true,
                decision @ (HookDecision::Skip
                | HookDecision::SkipIo
                | HookDecision::Replaced(_)) => return decision,
            }
        }

        if changed {
            HookDecision::Changed
        } else {
            HookDecision::Unchanged
        }
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rookdb_wire::ClusterPosition;

    struct TraceHook {
        label: &'static str,
        trace: Arc<Mutex<Vec<&'static str>>>,
        decision: HookDecision,
        mode: DistributedMode,
    }

    impl TraceHook {
        fn new(
            label: &'static str,
            trace: Arc<Mutex<Vec<&'static str>>>,
            decision: HookDecision,
        ) -> Arc<Self> {
            Arc::new(Self {
                label,
                trace,
                decision,
                mode: DistributedMode::Both,
            })
        }
    }

    impl RecordHook for TraceHook {
        fn on_trigger(&self, _kind: HookKind, _record: &mut Record) -> HookDecision {
            self.trace.lock().push(self.label);
            self.decision.clone()
        }

        fn distributed_mode(&self) -> DistributedMode {
            self.mode
        }
    }

    fn persistent_record() -> Record {
        let mut record = Record::with_bytes(Record::KIND_DOCUMENT, vec![1]);
        record.set_identity(Rid::new(3, ClusterPosition::new(4)));
        record
    }

    #[test]
    fn dispatch_orders_by_position_then_insertion() {
        let registry = HookRegistry::new();
        let trace = Arc::new(Mutex::new(Vec::new()));

        registry.register(
            TraceHook::new("late", Arc::clone(&trace), HookDecision::Unchanged),
            HookPosition::Late,
        );
        registry.register(
            TraceHook::new("first", Arc::clone(&trace), HookDecision::Unchanged),
            HookPosition::First,
        );
        registry.register(
            TraceHook::new("regular-a", Arc::clone(&trace), HookDecision::Unchanged),
            HookPosition::Regular,
        );
        registry.register(
            TraceHook::new("regular-b", Arc::clone(&trace), HookDecision::Unchanged),
            HookPosition::Regular,
        );

        let mut record = persistent_record();
        registry.callback(HookKind::BeforeUpdate, &mut record, RunMode::Default, false);

        assert_eq!(
            *trace.lock(),
            vec!["first", "regular-a", "regular-b", "late"]
        );
    }

    #[test]
    fn skip_io_short_circuits() {
        let registry = HookRegistry::new();
        let trace = Arc::new(Mutex::new(Vec::new()));

        registry.register(
            TraceHook::new("skipper", Arc::clone(&trace), HookDecision::SkipIo),
            HookPosition::Regular,
        );
        registry.register(
            TraceHook::new("never", Arc::clone(&trace), HookDecision::Unchanged),
            HookPosition::Last,
        );

        let mut record = persistent_record();
        let decision =
            registry.callback(HookKind::BeforeCreate, &mut record, RunMode::Default, false);

        assert_eq!(decision, HookDecision::SkipIo);
        assert_eq!(*trace.lock(), vec!["skipper"]);
    }

    #[test]
    fn changed_accumulates_without_stopping() {
        let registry = HookRegistry::new();
        let trace = Arc::new(Mutex::new(Vec::new()));

        registry.register(
            TraceHook::new("mutator", Arc::clone(&trace), HookDecision::Changed),
            HookPosition::Early,
        );
        registry.register(
            TraceHook::new("watcher", Arc::clone(&trace), HookDecision::Unchanged),
            HookPosition::Late,
        );

        let mut record = persistent_record();
        let decision =
            registry.callback(HookKind::BeforeUpdate, &mut record, RunMode::Default, false);

        assert_eq!(decision, HookDecision::Changed);
        assert_eq!(*trace.lock(), vec!["mutator", "watcher"]);
    }

    #[test]
    fn distributed_filter_skips_target_node_hooks() {
        let registry = HookRegistry::new();
        let trace = Arc::new(Mutex::new(Vec::new()));

        let hook = Arc::new(TraceHook {
            label: "target-only",
            trace: Arc::clone(&trace),
            decision: HookDecision::Unchanged,
            mode: DistributedMode::TargetNode,
        });
        registry.register(hook, HookPosition::Regular);

        let mut record = persistent_record();
        registry.callback(HookKind::BeforeUpdate, &mut record, RunMode::Default, true);
        assert!(trace.lock().is_empty());

        // Same hook runs when the storage is not distributed.
        registry.callback(HookKind::BeforeUpdate, &mut record, RunMode::Default, false);
        assert_eq!(*trace.lock(), vec!["target-only"]);
    }

    #[test]
    fn distributed_run_skips_source_node_hooks() {
        let registry = HookRegistry::new();
        let trace = Arc::new(Mutex::new(Vec::new()));

        let hook = Arc::new(TraceHook {
            label: "source-only",
            trace: Arc::clone(&trace),
            decision: HookDecision::Unchanged,
            mode: DistributedMode::SourceNode,
        });
        registry.register(hook, HookPosition::Regular);

        let mut record = persistent_record();
        registry.callback(
            HookKind::BeforeUpdate,
            &mut record,
            RunMode::RunningDistributed,
            true,
        );
        assert!(trace.lock().is_empty());
    }

    struct ReentrantHook {
        registry: Arc<HookRegistry>,
        inner_decisions: Mutex<Vec<HookDecision>>,
    }

    impl RecordHook for ReentrantHook {
        fn on_trigger(&self, kind: HookKind, record: &mut Record) -> HookDecision {
            // A second record instance with the same identity re-enters the
            // pipeline; the guard must suppress it.
            let mut alias = record.clone();
            let inner = self
                .registry
                .callback(kind, &mut alias, RunMode::Default, false);
            self.inner_decisions.lock().push(inner);
            HookDecision::Changed
        }
    }

    #[test]
    fn reentrancy_guard_suppresses_nested_dispatch() {
        let registry = Arc::new(HookRegistry::new());
        let hook = Arc::new(ReentrantHook {
            registry: Arc::clone(&registry),
            inner_decisions: Mutex::new(Vec::new()),
        });
        registry.register(Arc::clone(&hook) as Arc<dyn RecordHook>, HookPosition::Regular);

        let mut record = persistent_record();
        let outer = registry.callback(HookKind::BeforeUpdate, &mut record, RunMode::Default, false);

        assert_eq!(outer, HookDecision::Changed);
        assert_eq!(*hook.inner_decisions.lock(), vec![HookDecision::Unchanged]);
    }

    #[test]
    fn unregister_notifies_hook() {
        struct Flagged(Mutex<bool>);
        impl RecordHook for Flagged {
            fn on_trigger(&self, _: HookKind, _: &mut Record) -> HookDecision {
                HookDecision::Unchanged
            }
            fn on_unregister(&self) {
                *self.0.lock() = true;
            }
        }

        let registry = HookRegistry::new();
        let hook = Arc::new(Flagged(Mutex::new(false)));
        let as_dyn: Arc<dyn RecordHook> = hook.clone();
        registry.register(Arc::clone(&as_dyn), HookPosition::Regular);

        registry.unregister(&as_dyn);
        assert!(*hook.0.lock());
        assert!(registry.is_empty());
    }
}
