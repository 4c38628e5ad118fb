//! Catalog error types

use std::path::PathBuf;

use hdb_types::{NameError, TableRef};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("database '{0}' does not exist")]
    DatabaseNotFound(String),

    #[error("Table '{0}' does not exist")]
    TableNotFound(TableRef),

    #[error("Attribute '{attribute}' does not exist on '{table}'")]
    AttributeNotFound { attribute: String, table: TableRef },

    #[error("database '{0}' already exists")]
    DatabaseExists(String),

    #[error("Table '{}' already exists in '{}'", .0.table, .0.database)]
    TableExists(TableRef),

    #[error("attribute '{attribute}' already exists in {table}")]
    AttributeExists { attribute: String, table: TableRef },

    #[error("You cannot drop a hash attribute")]
    DropHashAttribute,

    #[error("You cannot drop the internal timestamp attribute '{0}'")]
    DropTimestampAttribute(String),

    #[error(transparent)]
    InvalidName(#[from] NameError),

    #[error("Failed to read catalog at {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write catalog at {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to decode catalog snapshot: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("catalog lock poisoned")]
    Poisoned,
}

impl CatalogError {
    /// Returns true for the not-found family of errors.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CatalogError::DatabaseNotFound(_)
                | CatalogError::TableNotFound(_)
                | CatalogError::AttributeNotFound { .. }
        )
    }

    /// Returns true for the already-exists family of errors.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            CatalogError::DatabaseExists(_)
                | CatalogError::TableExists(_)
                | CatalogError::AttributeExists { .. }
        )
    }
}

/// Result type for catalog operations.
pub type Result<T> = std::result::Result<T, CatalogError>;
