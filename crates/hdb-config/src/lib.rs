//! Configuration management for hdb
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. Environment variables (`HDB_<SECTION>__<KEY>`, highest precedence)
//! 2. hdb.local.toml (local overrides, written by `set_configuration`)
//! 3. hdb.toml (project config)
//! 4. ~/.config/hdb/config.toml (user defaults)
//! 5. Built-in defaults (lowest precedence)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::{ConfigLoader, write_local_overrides};
pub use paths::{ConfigFiles, LOCAL_CONFIG_FILE, PROJECT_CONFIG_FILE};

/// Main hdb configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HdbConfig {
    pub storage: StorageConfig,
    pub operations: OperationsConfig,
    pub jobs: JobsConfig,
    pub logging: LoggingConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// Save the schema catalog to `<data_dir>/catalog.json` after every
    /// structural change.
    pub persist_catalog: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".hdb/data"),
            persist_catalog: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationsConfig {
    /// Database for unqualified table names in SQL.
    pub default_database: Option<String>,
    pub max_batch_records: usize,
}

impl Default for OperationsConfig {
    fn default() -> Self {
        Self {
            default_database: None,
            max_batch_records: 100_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub max_concurrent_jobs: usize,
    pub job_retention_days: u32,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            job_retention_days: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` filter directive, e.g. `info` or `hdb=debug`.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Name of the super user created on first start.
    pub default_super_user: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            default_super_user: "admin".to_string(),
        }
    }
}

impl HdbConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Load configuration from specific project directory
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }

    /// Configuration for tests and embedded use: nothing persisted.
    pub fn in_memory() -> Self {
        Self {
            storage: StorageConfig {
                persist_catalog: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Resolve relative paths to absolute
    pub fn resolve_paths(&mut self, base_dir: impl AsRef<Path>) {
        let base = base_dir.as_ref();

        if self.storage.data_dir.is_relative() {
            self.storage.data_dir = base.join(&self.storage.data_dir);
        }
    }

    /// Path of the persisted catalog snapshot.
    pub fn catalog_file(&self) -> PathBuf {
        self.storage.data_dir.join("catalog.json")
    }

    /// Rejects values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.operations.max_batch_records == 0 {
            return Err(ConfigError::ValidationError(
                "operations.max_batch_records must be greater than 0".to_string(),
            ));
        }
        if self.jobs.max_concurrent_jobs == 0 {
            return Err(ConfigError::ValidationError(
                "jobs.max_concurrent_jobs must be greater than 0".to_string(),
            ));
        }
        if self.auth.default_super_user.is_empty() {
            return Err(ConfigError::ValidationError(
                "auth.default_super_user cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}
