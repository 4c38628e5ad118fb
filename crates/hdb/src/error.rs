//! Error types for the operations engine.
//!
//! Every error maps to an HTTP-style status code and a JSON body with at
//! least an `error` string.

use hdb_catalog::CatalogError;
use hdb_config::ConfigError;
use hdb_query::QueryError;
use hdb_rbac::{RoleValidationError, UNAUTHORIZED_MESSAGE, Verdict};
use hdb_store::StoreError;
use hdb_types::{HashKeyError, NameError, SYSTEM_DATABASE};
use serde_json::{Value, json};
use thiserror::Error;

use crate::jobs::TransportError;

/// Fixed message for mutations of the `system` database.
pub const SYSTEM_PROTECTED_MESSAGE: &str = "The 'system' database, tables and records are used internally by HarperDB and cannot be updated or removed.";

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, HdbError>;

#[derive(Debug, Error)]
pub enum HdbError {
    /// Malformed request or invalid value.
    #[error("{0}")]
    Validation(String),

    /// A request field has the wrong JSON type for an array parameter.
    #[error("{0}")]
    TypeMismatch(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Authentication(String),

    #[error("{UNAUTHORIZED_MESSAGE}")]
    Unauthorized(Verdict),

    /// Non-super user asked for metadata of the `system` database.
    #[error("Your role does not have permission to view database metadata for '{SYSTEM_DATABASE}'")]
    SystemMetadata,

    #[error("{SYSTEM_PROTECTED_MESSAGE}")]
    ProtectedSystem,

    #[error(
        "Internal timestamp attributes - '__createdtime__' and '__updatedtime__' - cannot be inserted to or updated by HDB users."
    )]
    ProtectedTimestamps,

    #[error(transparent)]
    RoleValidation(#[from] RoleValidationError),

    #[error("Operation '{0}' not found")]
    UnknownOperation(String),

    #[error("Operation '{0}' is not supported by this engine")]
    UnsupportedOperation(String),

    #[error(transparent)]
    InvalidName(#[from] NameError),

    #[error(transparent)]
    HashKey(#[from] HashKeyError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Query(QueryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("{0}")]
    Internal(String),
}

impl From<QueryError> for HdbError {
    fn from(err: QueryError) -> Self {
        // Surface catalog and store failures with their own status codes.
        match err {
            QueryError::Catalog(inner) => HdbError::Catalog(inner),
            QueryError::Store(inner) => HdbError::Store(inner),
            other => HdbError::Query(other),
        }
    }
}

impl HdbError {
    pub fn validation(message: impl Into<String>) -> Self {
        HdbError::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        HdbError::NotFound(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        HdbError::Internal(message.into())
    }

    /// HTTP-style status code.
    pub fn status(&self) -> u16 {
        match self {
            HdbError::Validation(_)
            | HdbError::RoleValidation(_)
            | HdbError::UnknownOperation(_)
            | HdbError::UnsupportedOperation(_)
            | HdbError::InvalidName(_)
            | HdbError::HashKey(_)
            | HdbError::Query(_) => 400,
            HdbError::Authentication(_) => 401,
            HdbError::Unauthorized(_)
            | HdbError::SystemMetadata
            | HdbError::ProtectedSystem
            | HdbError::ProtectedTimestamps => 403,
            HdbError::NotFound(_) => 404,
            HdbError::Conflict(_) => 409,
            HdbError::Catalog(err) => match err {
                e if e.is_not_found() => 404,
                CatalogError::Read { .. }
                | CatalogError::Write { .. }
                | CatalogError::Decode(_)
                | CatalogError::Poisoned => 500,
                _ => 400,
            },
            HdbError::Store(StoreError::TableNotFound(_)) => 404,
            HdbError::Config(ConfigError::ValidationError(_)) => 400,
            HdbError::TypeMismatch(_)
            | HdbError::Store(_)
            | HdbError::Config(_)
            | HdbError::Transport(_)
            | HdbError::Internal(_) => 500,
        }
    }

    /// JSON error body.
    pub fn to_body(&self) -> Value {
        match self {
            HdbError::Unauthorized(verdict) => verdict.to_body(),
            HdbError::RoleValidation(err) => err.to_body(),
            other => json!({ "error": other.to_string() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hdb_rbac::UnauthorizedAccess;
    use hdb_types::TableRef;

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(HdbError::validation("'table' is required").status(), 400);
        assert_eq!(HdbError::TypeMismatch("x".into()).status(), 500);
        assert_eq!(HdbError::ProtectedSystem.status(), 403);
        assert_eq!(HdbError::Conflict("dup".into()).status(), 409);
        assert_eq!(
            HdbError::from(CatalogError::TableNotFound(TableRef::new("dev", "dog"))).status(),
            404
        );
        assert_eq!(
            HdbError::from(CatalogError::DatabaseExists("dev".into())).status(),
            400
        );
        assert_eq!(HdbError::from(NameError::AttributeCharacters).status(), 400);
    }

    #[test]
    fn query_errors_unwrap_catalog_errors() {
        let err = HdbError::from(QueryError::Catalog(CatalogError::DatabaseNotFound(
            "nope".into(),
        )));
        assert_eq!(err.status(), 404);
        assert_eq!(err.to_body(), json!({"error": "database 'nope' does not exist"}));
    }

    #[test]
    fn unauthorized_body_is_structured() {
        let err = HdbError::Unauthorized(Verdict {
            unauthorized_access: vec![UnauthorizedAccess::super_user_only("create_table")],
            invalid_schema_items: Vec::new(),
        });
        let body = err.to_body();
        assert_eq!(body["error"], UNAUTHORIZED_MESSAGE);
        assert_eq!(
            body["unauthorized_access"][0],
            "Operation 'create_table' is restricted to 'super_user' roles"
        );
        assert_eq!(body["invalid_schema_items"], json!([]));
    }
}
