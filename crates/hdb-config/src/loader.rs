//! Configuration loader with multi-source merging

use crate::{ConfigError, ConfigFiles, HdbConfig};
use anyhow::{Context, Result};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Configuration loader with builder pattern
pub struct ConfigLoader {
    project_dir: PathBuf,
    env_prefix: String,
    user_config: bool,
}

impl ConfigLoader {
    /// Create a new config loader with default project directory (current dir)
    pub fn new() -> Self {
        Self {
            project_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_prefix: "HDB".to_string(),
            user_config: true,
        }
    }

    /// Set the project directory
    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Set the environment variable prefix (default: "HDB")
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Skip ~/.config/hdb/config.toml
    pub fn without_user_config(mut self) -> Self {
        self.user_config = false;
        self
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    /// Load configuration from all sources with proper precedence
    pub fn load(self) -> Result<HdbConfig> {
        let mut builder = config::Config::builder();

        // 1. Start with built-in defaults
        let defaults = HdbConfig::default();
        builder = builder.add_source(config::Config::try_from(&defaults)?);

        // 2. ~/.config/hdb/config.toml, 3. hdb.toml, 4. hdb.local.toml
        let mut files = ConfigFiles::for_project(&self.project_dir);
        if !self.user_config {
            files = files.without_user();
        }
        for file in files.existing() {
            builder = builder.add_source(
                config::File::from(file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        // 5. Environment variables (HDB_OPERATIONS__DEFAULT_DATABASE=dev)
        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;

        let mut hdb_config: HdbConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        hdb_config.resolve_paths(&self.project_dir);
        hdb_config.validate()?;

        Ok(hdb_config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default(self) -> HdbConfig {
        self.load().unwrap_or_default()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Merges `overrides` (section → key → value) into hdb.local.toml and
/// returns the file written. Existing keys not named are kept.
pub fn write_local_overrides(
    project_dir: impl AsRef<Path>,
    overrides: &toml::Table,
) -> Result<PathBuf, ConfigError> {
    let path = ConfigFiles::for_project(project_dir).local;
    let mut table = if path.exists() {
        let text = fs::read_to_string(&path).map_err(|source| ConfigError::ReadError {
            path: path.clone(),
            source,
        })?;
        text.parse::<toml::Table>()
            .map_err(|source| ConfigError::ParseError {
                path: path.clone(),
                source,
            })?
    } else {
        toml::Table::new()
    };

    merge(&mut table, overrides);

    let text = toml::to_string_pretty(&table)?;
    fs::write(&path, text).map_err(|source| ConfigError::WriteError {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}

fn merge(target: &mut toml::Table, overrides: &toml::Table) {
    for (key, value) in overrides {
        match (target.get_mut(key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(nested)) => {
                merge(existing, nested);
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}
