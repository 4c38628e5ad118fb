//! Authorization verdicts.
//!
//! Two reporting channels: `unauthorized_access` names denied tables and
//! operations in full detail, while `invalid_schema_items` uses not-found
//! wording for both missing items and items hidden from the role.

use std::fmt;

use hdb_types::TableRef;
use serde::{Serialize, Serializer};
use serde_json::{Value, json};

use crate::permissions::Permission;

/// Fixed error text for every authorization failure.
pub const UNAUTHORIZED_MESSAGE: &str =
    "This operation is not authorized due to role restrictions and/or invalid database items";

/// A schema item named by an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaItem {
    Database(String),
    Table(TableRef),
    Attribute { attribute: String, table: TableRef },
}

impl fmt::Display for SchemaItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaItem::Database(db) => write!(f, "database '{db}' does not exist"),
            SchemaItem::Table(table) => write!(f, "Table '{table}' does not exist"),
            SchemaItem::Attribute { attribute, table } => {
                write!(f, "Attribute '{attribute}' does not exist on '{table}'")
            }
        }
    }
}

/// An invalid schema item.
///
/// `Masked` items exist but are hidden from the role; both variants render
/// the same not-found message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaItemError {
    NotFound(SchemaItem),
    Masked(SchemaItem),
}

impl SchemaItemError {
    pub fn item(&self) -> &SchemaItem {
        match self {
            SchemaItemError::NotFound(item) | SchemaItemError::Masked(item) => item,
        }
    }

    pub fn is_masked(&self) -> bool {
        matches!(self, SchemaItemError::Masked(_))
    }
}

impl fmt::Display for SchemaItemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.item().fmt(f)
    }
}

impl Serialize for SchemaItemError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttributeDenial {
    pub attribute_name: String,
    pub required_permissions: Vec<Permission>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableDenial {
    pub schema: String,
    pub table: String,
    pub required_table_permissions: Vec<Permission>,
    pub required_attribute_permissions: Vec<AttributeDenial>,
}

/// An `unauthorized_access` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum UnauthorizedAccess {
    /// Rendered as `"Operation 'x' is restricted to 'super_user' roles"`.
    Operation(String),
    Table(TableDenial),
}

impl UnauthorizedAccess {
    pub fn super_user_only(operation: &str) -> Self {
        UnauthorizedAccess::Operation(format!(
            "Operation '{operation}' is restricted to 'super_user' roles"
        ))
    }
}

/// Result of evaluating an access request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub unauthorized_access: Vec<UnauthorizedAccess>,
    pub invalid_schema_items: Vec<SchemaItemError>,
}

impl Verdict {
    pub fn allowed() -> Self {
        Self::default()
    }

    pub fn is_authorized(&self) -> bool {
        self.unauthorized_access.is_empty() && self.invalid_schema_items.is_empty()
    }

    pub fn merge(&mut self, other: Verdict) {
        self.unauthorized_access.extend(other.unauthorized_access);
        for item in other.invalid_schema_items {
            if !self.invalid_schema_items.contains(&item) {
                self.invalid_schema_items.push(item);
            }
        }
    }

    /// The 403 body.
    pub fn to_body(&self) -> Value {
        json!({
            "error": UNAUTHORIZED_MESSAGE,
            "unauthorized_access": self.unauthorized_access,
            "invalid_schema_items": self.invalid_schema_items,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masked_and_not_found_render_identically() {
        let table = TableRef::new("dev", "dog");
        let item = SchemaItem::Attribute {
            attribute: "age".into(),
            table: table.clone(),
        };
        let masked = SchemaItemError::Masked(item.clone());
        let missing = SchemaItemError::NotFound(item);
        assert_eq!(masked.to_string(), missing.to_string());
        assert_eq!(
            serde_json::to_value(&masked).unwrap(),
            "Attribute 'age' does not exist on 'dev.dog'"
        );
        assert!(masked.is_masked() && !missing.is_masked());
    }

    #[test]
    fn body_shape() {
        let verdict = Verdict {
            unauthorized_access: vec![
                UnauthorizedAccess::super_user_only("create_table"),
                UnauthorizedAccess::Table(TableDenial {
                    schema: "dev".into(),
                    table: "dog".into(),
                    required_table_permissions: vec![],
                    required_attribute_permissions: vec![AttributeDenial {
                        attribute_name: "age".into(),
                        required_permissions: vec![Permission::Insert],
                    }],
                }),
            ],
            invalid_schema_items: vec![],
        };
        let body = verdict.to_body();
        assert_eq!(body["error"], UNAUTHORIZED_MESSAGE);
        assert_eq!(
            body["unauthorized_access"][0],
            "Operation 'create_table' is restricted to 'super_user' roles"
        );
        assert_eq!(
            body["unauthorized_access"][1]["required_attribute_permissions"][0],
            json!({"attribute_name": "age", "required_permissions": ["insert"]})
        );
        assert_eq!(body["invalid_schema_items"], json!([]));
    }
}
