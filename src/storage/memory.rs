use crate::error::ContextError;
use crate::path::{PathExpr, ValueTree};
use crate::quota::{PathMutation, QuotaAccountant, tree_size};
use crate::scope::ScopeName;
use crate::storage::{BulkImport, CommitOutcome, Entry, ScopeStore, lookup_entries};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// In-process store: project → scope → value tree.
///
/// Each scope has its own mutex covering the evaluate → reserve → apply
/// sequence of a batch. The project ledger is an atomic that is re-checked
/// against the limit while it is advanced, so batches on different scopes of
/// one project cannot jointly overshoot the quota. Map locks are only held
/// for lookup, insert and removal.
#[derive(Debug, Default)]
pub struct MemoryStore {
    projects: RwLock<HashMap<String, Arc<ProjectState>>>,
}

#[derive(Debug, Default)]
struct ProjectState {
    scopes: RwLock<BTreeMap<String, Arc<Mutex<ScopeSlot>>>>,
    used_bytes: AtomicU64,
}

#[derive(Debug, Default)]
struct ScopeSlot {
    tree: ValueTree,
    size: u64,
    /// Set once the slot has been unlinked from its project; writers that
    /// raced the removal must fetch a fresh slot.
    retired: bool,
    /// False until a batch or import changes the slot.
    written: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn project(&self, project_id: &str) -> Option<Arc<ProjectState>> {
        self.projects.read().get(project_id).cloned()
    }

    fn project_or_create(&self, project_id: &str) -> Arc<ProjectState> {
        if let Some(project) = self.project(project_id) {
            return project;
        }
        Arc::clone(
            self.projects
                .write()
                .entry(project_id.to_string())
                .or_default(),
        )
    }
}

impl ProjectState {
    fn slot(&self, scope: &str) -> Option<Arc<Mutex<ScopeSlot>>> {
        self.scopes.read().get(scope).cloned()
    }

    fn slot_or_create(&self, scope: &str) -> Arc<Mutex<ScopeSlot>> {
        if let Some(slot) = self.slot(scope) {
            return slot;
        }
        Arc::clone(self.scopes.write().entry(scope.to_string()).or_default())
    }

    fn with_live_slot<T>(&self, scope: &str, f: impl FnOnce(&mut ScopeSlot) -> T) -> T {
        loop {
            let slot = self.slot_or_create(scope);
            let mut guard = slot.lock();
            if !guard.retired {
                return f(&mut guard);
            }
        }
    }

    /// Unlinks a slot that a rejected or no-op write created.
    fn retire_if_unwritten(&self, scope: &str) {
        let mut scopes = self.scopes.write();
        let Some(slot) = scopes.get(scope).cloned() else {
            return;
        };
        let mut guard = slot.lock();
        if !guard.written {
            guard.retired = true;
            scopes.remove(scope);
        }
    }

    fn retire(&self, scope: &str) {
        let Some(slot) = self.scopes.write().remove(scope) else {
            return;
        };
        let mut guard = slot.lock();
        guard.retired = true;
        adjust_ledger(&self.used_bytes, -(guard.size as i64));
        guard.size = 0;
    }
}

fn adjust_ledger(ledger: &AtomicU64, delta: i64) -> u64 {
    let previous = ledger
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            Some(current.saturating_add_signed(delta))
        })
        .unwrap_or_else(|current| current);
    previous.saturating_add_signed(delta)
}

impl ScopeStore for MemoryStore {
    fn driver_name(&self) -> &'static str {
        "memory"
    }

    fn get(
        &self,
        project_id: &str,
        scope: &ScopeName,
        paths: &[PathExpr],
    ) -> Result<Vec<Entry>, ContextError> {
        let slot = self
            .project(project_id)
            .and_then(|project| project.slot(scope.as_str()));
        Ok(match slot {
            Some(slot) => lookup_entries(Some(&slot.lock().tree), paths),
            None => lookup_entries(None, paths),
        })
    }

    fn set(
        &self,
        project_id: &str,
        scope: &ScopeName,
        batch: &[PathMutation],
        quota: &QuotaAccountant,
    ) -> Result<CommitOutcome, ContextError> {
        if batch.is_empty() {
            let scope_bytes = self
                .project(project_id)
                .and_then(|project| project.slot(scope.as_str()))
                .map_or(0, |slot| slot.lock().size);
            return Ok(CommitOutcome {
                delta: 0,
                scope_bytes,
                project_bytes: self.usage(project_id)?,
            });
        }
        let project = self.project_or_create(project_id);
        let result = project.with_live_slot(scope.as_str(), |slot| {
            let eval = quota.evaluate(
                project.used_bytes.load(Ordering::Acquire),
                &slot.tree,
                batch,
            );
            let delta = eval.delta;
            let previous = project
                .used_bytes
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                    quota.admit(current, delta).ok()
                })
                .map_err(|current| {
                    warn!(
                        project = project_id,
                        scope = %scope,
                        delta,
                        used = current,
                        "context batch over quota"
                    );
                    quota.rejection(current, delta)
                })?;
            if eval.plan.is_noop(&slot.tree) {
                let outcome = CommitOutcome {
                    delta,
                    scope_bytes: slot.size,
                    project_bytes: previous,
                };
                return Ok((outcome, false));
            }
            eval.plan.apply(&mut slot.tree);
            slot.size = slot.size.saturating_add_signed(delta);
            slot.written = true;
            debug!(project = project_id, scope = %scope, delta, "context batch committed");
            let outcome = CommitOutcome {
                delta,
                scope_bytes: slot.size,
                project_bytes: previous.saturating_add_signed(delta),
            };
            Ok((outcome, true))
        });
        match result {
            Ok((outcome, true)) => Ok(outcome),
            Ok((outcome, false)) => {
                project.retire_if_unwritten(scope.as_str());
                Ok(outcome)
            }
            Err(err) => {
                project.retire_if_unwritten(scope.as_str());
                Err(err)
            }
        }
    }

    fn keys(&self, project_id: &str, scope: &ScopeName) -> Result<Vec<String>, ContextError> {
        let slot = self
            .project(project_id)
            .and_then(|project| project.slot(scope.as_str()));
        Ok(slot
            .map(|slot| slot.lock().tree.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn delete(&self, project_id: &str, scope: &ScopeName) -> Result<(), ContextError> {
        if let Some(project) = self.project(project_id) {
            project.retire(scope.as_str());
        }
        Ok(())
    }

    fn list_scopes(&self, project_id: &str) -> Result<Vec<String>, ContextError> {
        Ok(self
            .project(project_id)
            .map(|project| project.scopes.read().keys().cloned().collect())
            .unwrap_or_default())
    }

    fn usage(&self, project_id: &str) -> Result<u64, ContextError> {
        Ok(self
            .project(project_id)
            .map_or(0, |project| project.used_bytes.load(Ordering::Acquire)))
    }

    fn importer(&self) -> Option<&dyn BulkImport> {
        Some(self)
    }
}

impl BulkImport for MemoryStore {
    fn import_bulk(
        &self,
        project_id: &str,
        scope: &ScopeName,
        values: ValueTree,
    ) -> Result<CommitOutcome, ContextError> {
        let project = self.project_or_create(project_id);
        Ok(project.with_live_slot(scope.as_str(), |slot| {
            let size = tree_size(&values);
            let delta = size as i64 - slot.size as i64;
            let project_bytes = adjust_ledger(&project.used_bytes, delta);
            slot.tree = values;
            slot.size = size;
            slot.written = true;
            CommitOutcome {
                delta,
                scope_bytes: size,
                project_bytes,
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryStore;
    use crate::path::PathExpr;
    use crate::quota::{PathMutation, QuotaAccountant};
    use crate::scope::ScopeName;
    use crate::storage::{BulkImport, ScopeStore};
    use serde_json::{Map, json};
    use std::sync::Arc;

    fn scope(name: &str) -> ScopeName {
        ScopeName::parse(name).expect("scope")
    }

    fn write(key: &str, value: serde_json::Value) -> Vec<PathMutation> {
        vec![PathMutation::set(PathExpr::parse(key).expect("key"), value)]
    }

    #[test]
    fn delete_returns_scope_bytes_to_ledger() {
        let store = MemoryStore::new();
        let quota = QuotaAccountant::unlimited();
        store
            .set("p", &scope("flow-1"), &write("a", json!("abc")), &quota)
            .expect("set flow");
        store
            .set("p", &scope("global"), &write("b", json!(12)), &quota)
            .expect("set global");
        assert_eq!(store.usage("p").expect("usage"), 7);

        store.delete("p", &scope("flow-1")).expect("delete");
        store.delete("p", &scope("flow-1")).expect("delete twice");
        assert_eq!(store.usage("p").expect("usage"), 2);
        assert_eq!(store.list_scopes("p").expect("list"), ["global"]);
    }

    #[test]
    fn rejected_or_empty_batch_creates_no_scope() {
        let store = MemoryStore::new();
        let quota = QuotaAccountant::new(Some(4));
        let err = store
            .set("p", &scope("flow-1"), &write("a", json!("too long")), &quota)
            .expect_err("over quota");
        assert_eq!(err.code_str(), "over_quota");
        store
            .set("p", &scope("flow-2"), &[], &quota)
            .expect("empty batch");
        assert!(store.list_scopes("p").expect("list").is_empty());
        assert_eq!(store.usage("p").expect("usage"), 0);
    }

    #[test]
    fn deleting_missing_key_creates_no_scope() {
        let store = MemoryStore::new();
        let quota = QuotaAccountant::unlimited();
        let batch = vec![PathMutation::delete(PathExpr::parse("missing").expect("key"))];
        let outcome = store
            .set("p", &scope("flow-9"), &batch, &quota)
            .expect("delete missing");
        assert_eq!(outcome.delta, 0);
        assert!(store.list_scopes("p").expect("list").is_empty());

        // A scope emptied by a committed delete stays listed.
        store
            .set("p", &scope("flow-1"), &write("a", json!(1)), &quota)
            .expect("set");
        store
            .set(
                "p",
                &scope("flow-1"),
                &[PathMutation::delete(PathExpr::parse("a").expect("key"))],
                &quota,
            )
            .expect("delete");
        assert_eq!(store.list_scopes("p").expect("list"), ["flow-1"]);
        assert_eq!(store.usage("p").expect("usage"), 0);
    }

    #[test]
    fn import_replaces_tree_and_adjusts_ledger() {
        let store = MemoryStore::new();
        let global = scope("global");
        let quota = QuotaAccountant::unlimited();
        store
            .set("p", &global, &write("old", json!("0123456789")), &quota)
            .expect("set");
        let mut values = Map::new();
        values.insert("test".into(), json!("x"));
        let outcome = store.import_bulk("p", &global, values).expect("import");
        assert_eq!(outcome.delta, 3 - 12);
        assert_eq!(store.usage("p").expect("usage"), 3);
        assert_eq!(store.keys("p", &global).expect("keys"), ["test"]);
    }

    #[test]
    fn concurrent_batches_never_overshoot_quota() {
        let store = Arc::new(MemoryStore::new());
        let quota = QuotaAccountant::new(Some(1000));
        let value = json!("a".repeat(98));
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = Arc::clone(&store);
                let value = value.clone();
                std::thread::spawn(move || {
                    let scope = scope(&format!("node-{i}:flow-1"));
                    store.set("p", &scope, &write("k", value), &quota).is_ok()
                })
            })
            .collect();
        let committed = handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .filter(|ok| *ok)
            .count();
        assert_eq!(committed, 10);
        assert_eq!(store.usage("p").expect("usage"), 1000);
    }
}
