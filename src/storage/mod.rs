//! Backend-agnostic scope storage contract.
//!
//! Every driver implements [`ScopeStore`]. Pagination and bulk import are
//! optional and advertised through [`ScopeStore::exporter`] and
//! [`ScopeStore::importer`]; callers probe them instead of assuming support.

pub mod memory;
pub mod sqlite;

use crate::error::ContextError;
use crate::path::{PathExpr, ValueTree};
use crate::quota::{PathMutation, QuotaAccountant};
use crate::scope::ScopeName;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use tracing::warn;

/// Wire form of a write: a missing `value` field deletes the key, an
/// explicit `null` stores null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub key: String,
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub value: Option<Value>,
}

impl Mutation {
    pub fn set(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value: Some(value),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }
}

/// One result of a `get`; `value` is omitted when the key is absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub key: String,
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub value: Option<Value>,
}

fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default = "default_page_limit")]
    pub limit: usize,
}

fn default_page_limit() -> usize {
    20
}

impl PageRequest {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            cursor: None,
        }
    }

    pub fn with_cursor(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeExport {
    pub scope: String,
    pub values: ValueTree,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportPage {
    pub data: Vec<ScopeExport>,
    /// Number of scopes stored for the project, across all pages.
    pub count: u64,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitOutcome {
    pub delta: i64,
    pub scope_bytes: u64,
    pub project_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanReport {
    pub removed: Vec<String>,
}

pub trait ScopeStore: Send + Sync {
    fn driver_name(&self) -> &'static str;

    fn get(
        &self,
        project_id: &str,
        scope: &ScopeName,
        paths: &[PathExpr],
    ) -> Result<Vec<Entry>, ContextError>;

    /// Applies the whole batch or nothing. The quota check and the ledger
    /// update happen in the same exclusive section as the tree write.
    fn set(
        &self,
        project_id: &str,
        scope: &ScopeName,
        batch: &[PathMutation],
        quota: &QuotaAccountant,
    ) -> Result<CommitOutcome, ContextError>;

    fn keys(&self, project_id: &str, scope: &ScopeName) -> Result<Vec<String>, ContextError>;

    /// Idempotent: deleting an absent scope succeeds.
    fn delete(&self, project_id: &str, scope: &ScopeName) -> Result<(), ContextError>;

    fn list_scopes(&self, project_id: &str) -> Result<Vec<String>, ContextError>;

    /// Ledger value for the project.
    fn usage(&self, project_id: &str) -> Result<u64, ContextError>;

    fn clean(&self, project_id: &str, live_ids: &[String]) -> Result<CleanReport, ContextError> {
        let stale = stale_scopes(self.list_scopes(project_id)?, live_ids);
        let mut report = CleanReport::default();
        for scope in stale {
            self.delete(project_id, &scope)?;
            report.removed.push(scope.as_str().to_string());
        }
        Ok(report)
    }

    fn exporter(&self) -> Option<&dyn ExportPages> {
        None
    }

    fn importer(&self) -> Option<&dyn BulkImport> {
        None
    }
}

pub trait ExportPages {
    fn export_page(&self, project_id: &str, page: &PageRequest)
    -> Result<ExportPage, ContextError>;
}

pub trait BulkImport {
    /// Replaces the scope's whole tree without a quota check; the ledger
    /// moves by the new tree size minus the old one.
    fn import_bulk(
        &self,
        project_id: &str,
        scope: &ScopeName,
        values: ValueTree,
    ) -> Result<CommitOutcome, ContextError>;
}

/// Stored scope names a clean sweep should remove. Names that no longer
/// parse are left alone.
pub(crate) fn stale_scopes(names: Vec<String>, live_ids: &[String]) -> Vec<ScopeName> {
    let live: HashSet<&str> = live_ids.iter().map(String::as_str).collect();
    names
        .into_iter()
        .filter_map(|name| match ScopeName::parse(&name) {
            Ok(scope) => Some(scope),
            Err(err) => {
                warn!(scope = %name, error = %err, "skipping unparseable stored scope");
                None
            }
        })
        .filter(|scope| scope.is_stale(&live))
        .collect()
}

pub(crate) fn lookup_entries(tree: Option<&ValueTree>, paths: &[PathExpr]) -> Vec<Entry> {
    paths
        .iter()
        .map(|path| Entry {
            key: path.as_str().to_string(),
            value: tree.and_then(|tree| path.get(tree)).cloned(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{Entry, Mutation, stale_scopes};
    use serde_json::json;

    #[test]
    fn missing_value_field_is_a_delete() {
        let batch: Vec<Mutation> =
            serde_json::from_str(r#"[{"key":"a"},{"key":"b","value":null},{"key":"c","value":1}]"#)
                .expect("parse");
        assert_eq!(batch[0], Mutation::delete("a"));
        assert_eq!(batch[1], Mutation::set("b", json!(null)));
        assert_eq!(batch[2], Mutation::set("c", json!(1)));
    }

    #[test]
    fn absent_entry_serializes_without_value() {
        let absent = Entry {
            key: "flow-key-2.unknown".into(),
            value: None,
        };
        assert_eq!(
            serde_json::to_value(&absent).expect("encode"),
            json!({"key": "flow-key-2.unknown"})
        );
    }

    #[test]
    fn stale_scopes_keeps_global_and_live_nodes() {
        let names = vec![
            "flow-1".to_string(),
            "global".to_string(),
            "node-1:flow-1".to_string(),
            "node-3:flow-2".to_string(),
            "bad name".to_string(),
        ];
        let stale: Vec<_> = stale_scopes(names, &["node-3".to_string()])
            .into_iter()
            .map(|s| s.as_str().to_string())
            .collect();
        assert_eq!(stale, ["flow-1", "node-1:flow-1"]);
    }
}
