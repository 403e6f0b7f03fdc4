pub mod api;
pub mod config;
pub mod error;
pub mod path;
pub mod quota;
pub mod scope;
pub mod storage;

use crate::api::{ContextRequest, ContextResponse, Operation};
use crate::config::{ContextConfig, DriverConfig};
use crate::error::{Capability, ContextError};
use crate::path::{PathExpr, ValueTree, parse_all};
use crate::quota::{PathMutation, QuotaAccountant};
use crate::scope::ScopeName;
use crate::storage::memory::MemoryStore;
use crate::storage::sqlite::SqliteStore;
use crate::storage::{
    CleanReport, CommitOutcome, Entry, ExportPage, Mutation, PageRequest, ScopeStore,
};
use std::sync::Arc;
use tracing::{debug, info};

/// The project a call acts for, as resolved by the tenant layer in front of
/// the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tenant {
    pub project_id: String,
    /// Per-tenant context quota. Takes precedence over the configured quota
    /// when set to a non-zero value.
    pub context_quota: Option<u64>,
}

impl Tenant {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            context_quota: None,
        }
    }

    pub fn with_context_quota(mut self, quota_bytes: u64) -> Self {
        self.context_quota = Some(quota_bytes);
        self
    }
}

#[derive(Clone)]
pub struct ContextService {
    config: ContextConfig,
    store: Arc<dyn ScopeStore>,
}

impl std::fmt::Debug for ContextService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextService")
            .field("config", &self.config)
            .field("driver", &self.store.driver_name())
            .finish()
    }
}

impl ContextService {
    pub fn open(config: ContextConfig) -> Result<Self, ContextError> {
        config.validate()?;
        let store: Arc<dyn ScopeStore> = match &config.driver {
            DriverConfig::Memory => Arc::new(MemoryStore::new()),
            DriverConfig::Sqlite {
                path: Some(path),
                busy_timeout_ms,
            } => Arc::new(SqliteStore::open(path, *busy_timeout_ms)?),
            DriverConfig::Sqlite { path: None, .. } => Arc::new(SqliteStore::open_in_memory()?),
        };
        info!(
            driver = store.driver_name(),
            quota_bytes = ?config.effective_quota(),
            max_key_bytes = config.max_key_bytes,
            max_batch_keys = config.max_batch_keys,
            "opened context service"
        );
        Ok(Self { config, store })
    }

    pub fn with_store(config: ContextConfig, store: Arc<dyn ScopeStore>) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn driver_name(&self) -> &'static str {
        self.store.driver_name()
    }

    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::ExportPage => self.store.exporter().is_some(),
            Capability::ImportBulk => self.store.importer().is_some(),
        }
    }

    /// Quota enforced for the tenant: its own override, else the configured
    /// one. A zero value on either side means "not set".
    pub fn quota_for(&self, tenant: &Tenant) -> QuotaAccountant {
        let limit = tenant
            .context_quota
            .filter(|limit| *limit > 0)
            .or_else(|| self.config.effective_quota());
        QuotaAccountant::new(limit)
    }

    pub async fn get(
        &self,
        tenant: &Tenant,
        scope: &str,
        keys: &[String],
    ) -> Result<Vec<Entry>, ContextError> {
        check_tenant(tenant)?;
        let scope = ScopeName::parse(scope)?;
        let paths = self.parse_keys(keys)?;
        let project_id = tenant.project_id.clone();
        self.run(move |store| store.get(&project_id, &scope, &paths))
            .await
    }

    /// Applies a batch of writes to one scope. Either every mutation lands
    /// and the ledger moves by the batch delta, or nothing changes.
    pub async fn set(
        &self,
        tenant: &Tenant,
        scope: &str,
        batch: Vec<Mutation>,
    ) -> Result<CommitOutcome, ContextError> {
        check_tenant(tenant)?;
        let scope = ScopeName::parse(scope)?;
        let keys: Vec<&str> = batch.iter().map(|m| m.key.as_str()).collect();
        let paths = self.parse_keys(&keys)?;
        let mutations: Vec<PathMutation> = paths
            .into_iter()
            .zip(batch)
            .map(|(path, mutation)| PathMutation {
                path,
                value: mutation.value,
            })
            .collect();
        let quota = self.quota_for(tenant);
        let project_id = tenant.project_id.clone();
        let outcome = self
            .run(move |store| store.set(&project_id, &scope, &mutations, &quota))
            .await?;
        debug!(
            project = %tenant.project_id,
            delta = outcome.delta,
            project_bytes = outcome.project_bytes,
            "context set"
        );
        Ok(outcome)
    }

    pub async fn keys(&self, tenant: &Tenant, scope: &str) -> Result<Vec<String>, ContextError> {
        check_tenant(tenant)?;
        let scope = ScopeName::parse(scope)?;
        let project_id = tenant.project_id.clone();
        self.run(move |store| store.keys(&project_id, &scope)).await
    }

    pub async fn delete(&self, tenant: &Tenant, scope: &str) -> Result<(), ContextError> {
        check_tenant(tenant)?;
        let scope = ScopeName::parse(scope)?;
        let project_id = tenant.project_id.clone();
        self.run(move |store| store.delete(&project_id, &scope))
            .await
    }

    /// Removes every flow and node scope whose id is not among `live_ids`.
    /// `global` always survives.
    pub async fn clean(
        &self,
        tenant: &Tenant,
        live_ids: Vec<String>,
    ) -> Result<CleanReport, ContextError> {
        check_tenant(tenant)?;
        let project_id = tenant.project_id.clone();
        let live = live_ids.len();
        let report = self
            .run(move |store| store.clean(&project_id, &live_ids))
            .await?;
        info!(
            project = %tenant.project_id,
            live,
            removed = report.removed.len(),
            "context clean sweep"
        );
        Ok(report)
    }

    pub async fn usage(&self, tenant: &Tenant) -> Result<u64, ContextError> {
        check_tenant(tenant)?;
        let project_id = tenant.project_id.clone();
        self.run(move |store| store.usage(&project_id)).await
    }

    pub async fn export_page(
        &self,
        tenant: &Tenant,
        page: PageRequest,
    ) -> Result<ExportPage, ContextError> {
        check_tenant(tenant)?;
        if !self.supports(Capability::ExportPage) {
            return Err(self.unsupported(Capability::ExportPage));
        }
        let project_id = tenant.project_id.clone();
        self.run(move |store| {
            let driver = store.driver_name();
            store
                .exporter()
                .ok_or(ContextError::CapabilityUnsupported {
                    driver,
                    capability: Capability::ExportPage,
                })?
                .export_page(&project_id, &page)
        })
        .await
    }

    /// Replaces a scope's whole tree. Quota is not checked; the ledger is
    /// adjusted to the new size.
    pub async fn import_bulk(
        &self,
        tenant: &Tenant,
        scope: &str,
        values: ValueTree,
    ) -> Result<CommitOutcome, ContextError> {
        check_tenant(tenant)?;
        let scope = ScopeName::parse(scope)?;
        if !self.supports(Capability::ImportBulk) {
            return Err(self.unsupported(Capability::ImportBulk));
        }
        let project_id = tenant.project_id.clone();
        let outcome = self
            .run(move |store| {
                let driver = store.driver_name();
                store
                    .importer()
                    .ok_or(ContextError::CapabilityUnsupported {
                        driver,
                        capability: Capability::ImportBulk,
                    })?
                    .import_bulk(&project_id, &scope, values)
            })
            .await?;
        debug!(
            project = %tenant.project_id,
            delta = outcome.delta,
            scope_bytes = outcome.scope_bytes,
            "context import"
        );
        Ok(outcome)
    }

    pub async fn dispatch(&self, request: ContextRequest) -> Result<ContextResponse, ContextError> {
        let (tenant, operation) = request.into_operation()?;
        let response = match operation {
            Operation::Get { scope, keys } => {
                ContextResponse::Entries(self.get(&tenant, &scope, &keys).await?)
            }
            Operation::Set { scope, batch } => {
                self.set(&tenant, &scope, batch).await?;
                ContextResponse::Empty {}
            }
            Operation::Delete { scope } => {
                self.delete(&tenant, &scope).await?;
                ContextResponse::Empty {}
            }
            Operation::Keys { scope } => ContextResponse::Keys(self.keys(&tenant, &scope).await?),
            Operation::Clean { live_ids } => {
                self.clean(&tenant, live_ids).await?;
                ContextResponse::Empty {}
            }
            Operation::ExportPage(page) => {
                ContextResponse::Page(self.export_page(&tenant, page).await?.into())
            }
            Operation::ImportBulk { scope, values } => {
                self.import_bulk(&tenant, &scope, values).await?;
                ContextResponse::Empty {}
            }
            Operation::Usage => ContextResponse::Usage {
                used: self.usage(&tenant).await?,
            },
        };
        Ok(response)
    }

    fn parse_keys<S: AsRef<str>>(&self, keys: &[S]) -> Result<Vec<PathExpr>, ContextError> {
        if keys.len() > self.config.max_batch_keys {
            return Err(ContextError::Validation(format!(
                "batch of {} keys exceeds limit of {}",
                keys.len(),
                self.config.max_batch_keys
            )));
        }
        for key in keys {
            let key: &str = key.as_ref();
            if key.len() > self.config.max_key_bytes {
                return Err(ContextError::Validation(format!(
                    "key of {} bytes exceeds limit of {}",
                    key.len(),
                    self.config.max_key_bytes
                )));
            }
        }
        parse_all(keys)
    }

    fn unsupported(&self, capability: Capability) -> ContextError {
        ContextError::CapabilityUnsupported {
            driver: self.store.driver_name(),
            capability,
        }
    }

    async fn run<T, F>(&self, f: F) -> Result<T, ContextError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn ScopeStore) -> Result<T, ContextError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| ContextError::Unavailable {
                message: format!("context driver task failed: {e}"),
            })?
    }
}

fn check_tenant(tenant: &Tenant) -> Result<(), ContextError> {
    if tenant.project_id.is_empty() {
        return Err(ContextError::Validation("project id must not be empty".into()));
    }
    Ok(())
}
