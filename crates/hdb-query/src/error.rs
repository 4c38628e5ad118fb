//! Error types for query parsing, planning and execution.

use hdb_catalog::CatalogError;
use hdb_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("SQL parse error: {0}")]
    Parse(String),

    #[error("unsupported SQL: {0}")]
    Unsupported(String),

    #[error("schema not defined for table {0}")]
    SchemaNotDefined(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("computed attribute callback '{0}' is not registered")]
    UnknownCallback(String),

    #[error("{0}")]
    Evaluation(String),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl QueryError {
    pub(crate) fn evaluation(message: impl Into<String>) -> Self {
        QueryError::Evaluation(message.into())
    }

    pub(crate) fn unsupported(message: impl Into<String>) -> Self {
        QueryError::Unsupported(message.into())
    }
}

/// Result type for query operations.
pub type Result<T> = std::result::Result<T, QueryError>;
