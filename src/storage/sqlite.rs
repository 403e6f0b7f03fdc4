use crate::error::ContextError;
use crate::path::{PathExpr, ValueTree};
use crate::quota::{PathMutation, QuotaAccountant, tree_size};
use crate::scope::ScopeName;
use crate::storage::{
    BulkImport, CleanReport, CommitOutcome, Entry, ExportPage, ExportPages, PageRequest,
    ScopeExport, ScopeStore, lookup_entries, stale_scopes,
};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

const SCHEMA_VERSION: i64 = 1;
const MAX_IDLE_CONNECTIONS: usize = 8;

/// Relational store: one `context_scopes` row per scope holding the
/// serialized tree and its size.
///
/// The project ledger is `SUM(size_bytes)` over a project's rows, so the
/// tree and its contribution to the ledger are always written by the same
/// statement. Writes run read → evaluate → write inside one `IMMEDIATE`
/// transaction.
///
/// Each call checks a connection out of a small idle pool (opening a new one
/// when the pool is empty), so readers and the single WAL writer proceed in
/// parallel and writers queue on SQLite's own lock under `busy_timeout`.
#[derive(Debug)]
pub struct SqliteStore {
    target: PathBuf,
    busy_timeout: Duration,
    idle: Mutex<Vec<Connection>>,
    anchor: Option<Mutex<Connection>>,
}

struct StoredScope {
    id: i64,
    tree: ValueTree,
    size: u64,
}

impl SqliteStore {
    pub fn open(path: &Path, busy_timeout_ms: u64) -> Result<Self, ContextError> {
        let store = Self {
            target: path.to_path_buf(),
            busy_timeout: Duration::from_millis(busy_timeout_ms),
            idle: Mutex::new(Vec::new()),
            anchor: None,
        };
        let mut conn = store.connect()?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        initialize_schema(&mut conn)?;
        store.release(conn);
        info!(path = %path.display(), "opened sqlite context store");
        Ok(store)
    }

    /// An in-memory database lives on a single connection, so calls on it
    /// are serialized.
    pub fn open_in_memory() -> Result<Self, ContextError> {
        let mut anchor = Connection::open_in_memory()?;
        initialize_schema(&mut anchor)?;
        Ok(Self {
            target: PathBuf::new(),
            busy_timeout: Duration::ZERO,
            idle: Mutex::new(Vec::new()),
            anchor: Some(Mutex::new(anchor)),
        })
    }

    fn connect(&self) -> Result<Connection, ContextError> {
        let conn = Connection::open(&self.target)?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
        Ok(conn)
    }

    fn release(&self, conn: Connection) {
        if !conn.is_autocommit() {
            return;
        }
        let mut idle = self.idle.lock();
        if idle.len() < MAX_IDLE_CONNECTIONS {
            idle.push(conn);
        }
    }

    /// Runs `f` on a pooled connection. The pool lock is held only for the
    /// checkout and the return, never while SQL runs.
    pub(crate) fn with_connection<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, ContextError>,
    ) -> Result<T, ContextError> {
        if let Some(anchor) = &self.anchor {
            return f(&mut *anchor.lock());
        }
        let pooled = self.idle.lock().pop();
        let mut conn = match pooled {
            Some(conn) => conn,
            None => self.connect()?,
        };
        let result = f(&mut conn);
        self.release(conn);
        result
    }
}

fn initialize_schema(conn: &mut Connection) -> Result<(), ContextError> {
    let tx = conn.transaction()?;
    tx.execute_batch("CREATE TABLE IF NOT EXISTS store_meta (version INTEGER NOT NULL);")?;
    let version: Option<i64> = tx
        .query_row("SELECT version FROM store_meta LIMIT 1", [], |row| row.get(0))
        .optional()?;
    match version {
        None => {
            tx.execute(
                "INSERT INTO store_meta (version) VALUES (?1)",
                params![SCHEMA_VERSION],
            )?;
            tx.execute_batch(
                "CREATE TABLE IF NOT EXISTS context_projects (
                    project TEXT PRIMARY KEY,
                    created_at INTEGER NOT NULL
                );
                CREATE TABLE IF NOT EXISTS context_scopes (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project TEXT NOT NULL,
                    scope TEXT NOT NULL,
                    values_json TEXT NOT NULL,
                    size_bytes INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    UNIQUE (project, scope)
                );
                CREATE INDEX IF NOT EXISTS idx_context_scopes_project
                    ON context_scopes (project, id);",
            )?;
        }
        Some(SCHEMA_VERSION) => {}
        Some(other) => {
            return Err(ContextError::InvalidConfig {
                message: format!(
                    "sqlite context schema version {other} is not supported (expected {SCHEMA_VERSION})"
                ),
            });
        }
    }
    tx.commit()?;
    Ok(())
}

fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as i64
}

fn decode_tree(json: &str) -> Result<ValueTree, ContextError> {
    serde_json::from_str(json).map_err(|e| ContextError::Decode(e.to_string()))
}

fn encode_tree(tree: &ValueTree) -> Result<String, ContextError> {
    serde_json::to_string(tree).map_err(|e| ContextError::Encode(e.to_string()))
}

fn load_scope(
    conn: &Connection,
    project_id: &str,
    scope: &str,
) -> Result<Option<StoredScope>, ContextError> {
    let row: Option<(i64, String, i64)> = conn
        .query_row(
            "SELECT id, values_json, size_bytes FROM context_scopes \
             WHERE project = ?1 AND scope = ?2",
            params![project_id, scope],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    row.map(|(id, json, size)| {
        Ok(StoredScope {
            id,
            tree: decode_tree(&json)?,
            size: size.max(0) as u64,
        })
    })
    .transpose()
}

fn project_usage(conn: &Connection, project_id: &str) -> Result<u64, ContextError> {
    let used: i64 = conn.query_row(
        "SELECT COALESCE(SUM(size_bytes), 0) FROM context_scopes WHERE project = ?1",
        params![project_id],
        |row| row.get(0),
    )?;
    Ok(used.max(0) as u64)
}

fn write_scope(
    conn: &Connection,
    project_id: &str,
    scope: &str,
    existing_id: Option<i64>,
    tree: &ValueTree,
    size: u64,
) -> Result<(), ContextError> {
    let json = encode_tree(tree)?;
    let now = now_micros();
    match existing_id {
        Some(id) => {
            conn.execute(
                "UPDATE context_scopes SET values_json = ?1, size_bytes = ?2, updated_at = ?3 \
                 WHERE id = ?4",
                params![json, size as i64, now, id],
            )?;
        }
        None => {
            conn.execute(
                "INSERT INTO context_scopes (project, scope, values_json, size_bytes, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![project_id, scope, json, size as i64, now],
            )?;
        }
    }
    conn.execute(
        "INSERT OR IGNORE INTO context_projects (project, created_at) VALUES (?1, ?2)",
        params![project_id, now],
    )?;
    Ok(())
}

fn scope_names(conn: &Connection, project_id: &str) -> Result<Vec<String>, ContextError> {
    let mut stmt =
        conn.prepare("SELECT scope FROM context_scopes WHERE project = ?1 ORDER BY id")?;
    let names = stmt
        .query_map(params![project_id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(names)
}

fn parse_cursor(cursor: Option<&str>) -> Result<i64, ContextError> {
    match cursor {
        None => Ok(0),
        Some(raw) => match raw.parse::<i64>() {
            Ok(id) if id >= 0 => Ok(id),
            _ => Err(ContextError::InvalidCursor(raw.to_string())),
        },
    }
}

impl ScopeStore for SqliteStore {
    fn driver_name(&self) -> &'static str {
        "sqlite"
    }

    fn get(
        &self,
        project_id: &str,
        scope: &ScopeName,
        paths: &[PathExpr],
    ) -> Result<Vec<Entry>, ContextError> {
        self.with_connection(|conn| {
            let stored = load_scope(conn, project_id, scope.as_str())?;
            Ok(lookup_entries(stored.as_ref().map(|s| &s.tree), paths))
        })
    }

    fn set(
        &self,
        project_id: &str,
        scope: &ScopeName,
        batch: &[PathMutation],
        quota: &QuotaAccountant,
    ) -> Result<CommitOutcome, ContextError> {
        self.with_connection(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let stored = load_scope(&tx, project_id, scope.as_str())?;
            let used = project_usage(&tx, project_id)?;
            let (existing_id, mut tree, old_size) = match stored {
                Some(stored) => (Some(stored.id), stored.tree, stored.size),
                None => (None, ValueTree::new(), 0),
            };

            let eval = quota.evaluate(used, &tree, batch);
            if eval.would_exceed {
                warn!(
                    project = project_id,
                    scope = %scope,
                    delta = eval.delta,
                    used,
                    "context batch over quota"
                );
                return Err(quota.rejection(used, eval.delta));
            }
            let delta = eval.delta;
            if eval.plan.is_noop(&tree) {
                return Ok(CommitOutcome {
                    delta,
                    scope_bytes: old_size,
                    project_bytes: used,
                });
            }
            eval.plan.apply(&mut tree);
            let scope_bytes = old_size.saturating_add_signed(delta);
            write_scope(&tx, project_id, scope.as_str(), existing_id, &tree, scope_bytes)?;
            tx.commit()?;
            debug!(project = project_id, scope = %scope, delta, "context batch committed");
            Ok(CommitOutcome {
                delta,
                scope_bytes,
                project_bytes: used.saturating_add_signed(delta),
            })
        })
    }

    fn keys(&self, project_id: &str, scope: &ScopeName) -> Result<Vec<String>, ContextError> {
        self.with_connection(|conn| {
            Ok(load_scope(conn, project_id, scope.as_str())?
                .map(|stored| stored.tree.keys().cloned().collect())
                .unwrap_or_default())
        })
    }

    fn delete(&self, project_id: &str, scope: &ScopeName) -> Result<(), ContextError> {
        self.with_connection(|conn| {
            conn.execute(
                "DELETE FROM context_scopes WHERE project = ?1 AND scope = ?2",
                params![project_id, scope.as_str()],
            )?;
            Ok(())
        })
    }

    fn list_scopes(&self, project_id: &str) -> Result<Vec<String>, ContextError> {
        self.with_connection(|conn| scope_names(conn, project_id))
    }

    fn usage(&self, project_id: &str) -> Result<u64, ContextError> {
        self.with_connection(|conn| project_usage(conn, project_id))
    }

    fn clean(&self, project_id: &str, live_ids: &[String]) -> Result<CleanReport, ContextError> {
        self.with_connection(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let names = scope_names(&tx, project_id)?;
            let mut report = CleanReport::default();
            for scope in stale_scopes(names, live_ids) {
                tx.execute(
                    "DELETE FROM context_scopes WHERE project = ?1 AND scope = ?2",
                    params![project_id, scope.as_str()],
                )?;
                report.removed.push(scope.as_str().to_string());
            }
            tx.commit()?;
            Ok(report)
        })
    }

    fn exporter(&self) -> Option<&dyn ExportPages> {
        Some(self)
    }

    fn importer(&self) -> Option<&dyn BulkImport> {
        Some(self)
    }
}

impl ExportPages for SqliteStore {
    fn export_page(
        &self,
        project_id: &str,
        page: &PageRequest,
    ) -> Result<ExportPage, ContextError> {
        let after = parse_cursor(page.cursor.as_deref())?;
        let limit = page.limit.max(1);
        let (count, mut rows) = self.with_connection(|conn| {
            let tx = conn.transaction()?;
            let known: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM context_projects WHERE project = ?1",
                    params![project_id],
                    |row| row.get(0),
                )
                .optional()?;
            if known.is_none() {
                return Err(ContextError::ProjectNotFound {
                    project_id: project_id.to_string(),
                });
            }

            let count: i64 = tx.query_row(
                "SELECT COUNT(*) FROM context_scopes WHERE project = ?1",
                params![project_id],
                |row| row.get(0),
            )?;
            let rows = {
                let mut stmt = tx.prepare(
                    "SELECT id, scope, values_json FROM context_scopes \
                     WHERE project = ?1 AND id > ?2 ORDER BY id LIMIT ?3",
                )?;
                stmt.query_map(params![project_id, after, limit as i64 + 1], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?
            };
            tx.commit()?;
            Ok((count, rows))
        })?;

        let next_cursor = if rows.len() > limit {
            rows.truncate(limit);
            rows.last().map(|(id, _, _)| id.to_string())
        } else {
            None
        };
        let data = rows
            .into_iter()
            .map(|(_, scope, json)| {
                Ok(ScopeExport {
                    scope,
                    values: decode_tree(&json)?,
                })
            })
            .collect::<Result<Vec<_>, ContextError>>()?;
        Ok(ExportPage {
            data,
            count: count.max(0) as u64,
            next_cursor,
        })
    }
}

impl BulkImport for SqliteStore {
    fn import_bulk(
        &self,
        project_id: &str,
        scope: &ScopeName,
        values: ValueTree,
    ) -> Result<CommitOutcome, ContextError> {
        self.with_connection(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let stored = load_scope(&tx, project_id, scope.as_str())?;
            let used = project_usage(&tx, project_id)?;
            let (existing_id, old_size) = match &stored {
                Some(stored) => (Some(stored.id), stored.size),
                None => (None, 0),
            };
            let size = tree_size(&values);
            write_scope(&tx, project_id, scope.as_str(), existing_id, &values, size)?;
            tx.commit()?;
            let delta = size as i64 - old_size as i64;
            debug!(project = project_id, scope = %scope, delta, "context scope imported");
            Ok(CommitOutcome {
                delta,
                scope_bytes: size,
                project_bytes: used.saturating_add_signed(delta),
            })
        })
    }
}
