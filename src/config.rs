use crate::error::ContextError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_MAX_KEY_BYTES: usize = 1024;
const DEFAULT_MAX_BATCH_KEYS: usize = 1024;

/// Persistence backend selection, tagged by `type` the way the deployment
/// config names it (`memory` or `sqlite`).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DriverConfig {
    #[default]
    Memory,
    Sqlite {
        /// Database file. `None` opens a private in-memory database.
        #[serde(default)]
        path: Option<PathBuf>,
        #[serde(default = "default_busy_timeout_ms")]
        busy_timeout_ms: u64,
    },
}

fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

fn default_max_key_bytes() -> usize {
    DEFAULT_MAX_KEY_BYTES
}

fn default_max_batch_keys() -> usize {
    DEFAULT_MAX_BATCH_KEYS
}

/// Runtime configuration for a context service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default)]
    pub driver: DriverConfig,
    /// Project-wide context quota in bytes. `None` or `0` disables
    /// enforcement.
    #[serde(default)]
    pub quota_bytes: Option<u64>,
    #[serde(default = "default_max_key_bytes")]
    pub max_key_bytes: usize,
    #[serde(default = "default_max_batch_keys")]
    pub max_batch_keys: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            driver: DriverConfig::Memory,
            quota_bytes: None,
            max_key_bytes: DEFAULT_MAX_KEY_BYTES,
            max_batch_keys: DEFAULT_MAX_BATCH_KEYS,
        }
    }
}

impl ContextConfig {
    /// In-process store, no quota. Intended for tests and short-lived runs.
    pub fn development() -> Self {
        Self::default()
    }

    pub fn sqlite(path: impl Into<PathBuf>) -> Self {
        Self {
            driver: DriverConfig::Sqlite {
                path: Some(path.into()),
                busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            },
            ..Self::default()
        }
    }

    pub fn sqlite_in_memory() -> Self {
        Self {
            driver: DriverConfig::Sqlite {
                path: None,
                busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            },
            ..Self::default()
        }
    }

    pub fn with_quota(mut self, quota_bytes: u64) -> Self {
        self.quota_bytes = Some(quota_bytes);
        self
    }

    /// The configured quota if it is enforceable.
    pub fn effective_quota(&self) -> Option<u64> {
        self.quota_bytes.filter(|limit| *limit > 0)
    }

    pub fn validate(&self) -> Result<(), ContextError> {
        if self.max_key_bytes == 0 {
            return Err(ContextError::InvalidConfig {
                message: "max_key_bytes must be > 0".into(),
            });
        }
        if self.max_batch_keys == 0 {
            return Err(ContextError::InvalidConfig {
                message: "max_batch_keys must be > 0".into(),
            });
        }
        if let DriverConfig::Sqlite {
            path: Some(path), ..
        } = &self.driver
        {
            if path.is_dir() {
                return Err(ContextError::InvalidConfig {
                    message: format!("sqlite path is a directory: {}", path.display()),
                });
            }
        }
        Ok(())
    }
}
