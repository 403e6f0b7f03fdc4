//! Byte accounting for context writes.
//!
//! Sizes are the compact JSON encoding length of a value. A scope weighs the
//! sum of its top-level values, and a project's ledger is the sum of its
//! scopes. Batches are measured per affected top-level key so a write never
//! re-serializes untouched parts of the tree.

use crate::error::ContextError;
use crate::path::{PathExpr, ValueTree, delete_steps, set_steps};
use serde_json::{Map, Value};
use std::io;

/// One write in a batch: `value: None` deletes the addressed leaf.
#[derive(Debug, Clone, PartialEq)]
pub struct PathMutation {
    pub path: PathExpr,
    pub value: Option<Value>,
}

impl PathMutation {
    pub fn set(path: PathExpr, value: Value) -> Self {
        Self {
            path,
            value: Some(value),
        }
    }

    pub fn delete(path: PathExpr) -> Self {
        Self { path, value: None }
    }
}

struct ByteCounter(u64);

impl io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn value_size(value: &Value) -> u64 {
    let mut counter = ByteCounter(0);
    // Writing a Value into an infallible sink cannot fail.
    let _ = serde_json::to_writer(&mut counter, value);
    counter.0
}

pub fn tree_size(tree: &ValueTree) -> u64 {
    tree.values().map(value_size).sum()
}

/// Staged replacement values for the top-level keys a batch touches.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchPlan {
    staged: Vec<(String, Option<Value>)>,
    delta: i64,
}

impl BatchPlan {
    pub fn build(tree: &ValueTree, batch: &[PathMutation]) -> Self {
        let mut staged: Vec<(String, Option<Value>)> = Vec::new();
        for mutation in batch {
            let head = mutation.path.head();
            let idx = match staged.iter().position(|(key, _)| key == head) {
                Some(idx) => idx,
                None => {
                    staged.push((head.to_string(), tree.get(head).cloned()));
                    staged.len() - 1
                }
            };
            stage_mutation(&mut staged[idx].1, mutation);
        }

        let delta = staged
            .iter()
            .map(|(key, new)| {
                let old = tree.get(key.as_str()).map_or(0, value_size) as i64;
                let new = new.as_ref().map_or(0, value_size) as i64;
                new - old
            })
            .sum();
        Self { staged, delta }
    }

    pub fn delta(&self) -> i64 {
        self.delta
    }

    pub fn touched_keys(&self) -> impl Iterator<Item = &str> {
        self.staged.iter().map(|(key, _)| key.as_str())
    }

    /// True when applying the plan would leave `tree` unchanged.
    pub fn is_noop(&self, tree: &ValueTree) -> bool {
        self.staged
            .iter()
            .all(|(key, value)| tree.get(key.as_str()) == value.as_ref())
    }

    pub fn apply(self, tree: &mut ValueTree) {
        for (key, value) in self.staged {
            match value {
                Some(value) => {
                    tree.insert(key, value);
                }
                None => {
                    tree.shift_remove(key.as_str());
                }
            }
        }
    }
}

fn stage_mutation(top: &mut Option<Value>, mutation: &PathMutation) {
    let tail = mutation.path.tail();
    if tail.is_empty() {
        *top = mutation.value.clone();
        return;
    }
    match &mutation.value {
        Some(value) => {
            if !matches!(top, Some(Value::Object(_))) {
                *top = Some(Value::Object(Map::new()));
            }
            if let Some(Value::Object(map)) = top {
                set_steps(map, tail, value.clone());
            }
        }
        None => {
            if let Some(Value::Object(map)) = top {
                delete_steps(map, tail);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub plan: BatchPlan,
    pub delta: i64,
    pub would_exceed: bool,
}

/// Compares a batch's size delta against the project limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QuotaAccountant {
    limit: Option<u64>,
}

impl QuotaAccountant {
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            limit: limit.filter(|limit| *limit > 0),
        }
    }

    pub fn unlimited() -> Self {
        Self { limit: None }
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    pub fn would_exceed(&self, ledger_total: u64, delta: i64) -> bool {
        match self.limit {
            Some(limit) => ledger_total.saturating_add_signed(delta) > limit,
            None => false,
        }
    }

    pub fn evaluate(
        &self,
        ledger_total: u64,
        tree: &ValueTree,
        batch: &[PathMutation],
    ) -> Evaluation {
        let plan = BatchPlan::build(tree, batch);
        let delta = plan.delta();
        Evaluation {
            would_exceed: self.would_exceed(ledger_total, delta),
            plan,
            delta,
        }
    }

    /// Ledger value after the delta, or the over-quota rejection.
    pub fn admit(&self, ledger_total: u64, delta: i64) -> Result<u64, ContextError> {
        if self.would_exceed(ledger_total, delta) {
            return Err(self.rejection(ledger_total, delta));
        }
        Ok(ledger_total.saturating_add_signed(delta))
    }

    pub fn rejection(&self, ledger_total: u64, delta: i64) -> ContextError {
        ContextError::OverQuota {
            limit: self.limit.unwrap_or_default(),
            used: ledger_total,
            delta,
        }
    }
}
