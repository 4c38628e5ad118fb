//! Catalog snapshots on disk.

use std::{collections::BTreeMap, fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    error::{CatalogError, Result},
    schema::DatabaseDef,
};

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Serialized form of the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    pub version: u32,
    pub databases: Vec<DatabaseDef>,
}

impl CatalogSnapshot {
    pub fn from_databases(databases: &BTreeMap<String, DatabaseDef>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            databases: databases.values().cloned().collect(),
        }
    }

    pub fn into_databases(self) -> BTreeMap<String, DatabaseDef> {
        self.databases
            .into_iter()
            .map(|db| (db.name.clone(), db))
            .collect()
    }

    /// Loads a snapshot, returning `None` if the file does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path).map_err(|source| CatalogError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Writes the snapshot through a temporary file so a crash never leaves
    /// a truncated catalog behind.
    pub fn save(&self, path: &Path) -> Result<()> {
        let write_err = |source| CatalogError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content).map_err(write_err)?;
        fs::rename(&tmp, path).map_err(write_err)
    }
}
