//! Role permission validation.
//!
//! Validation is a pure function over the submitted permission JSON and the
//! schema. Every problem is collected, not just the first: global problems
//! go to `main_permissions`, per-table problems to `schema_permissions`
//! keyed `<database>_<table>`.

use std::collections::BTreeMap;

use hdb_types::TableRef;
use serde::Serialize;
use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::{
    lookup::SchemaLookup,
    permissions::{AttributePermission, Permission, RolePermissions, StructureUser, TablePermissions},
};

const SUPER_USER: &str = "super_user";
const CLUSTER_USER: &str = "cluster_user";
const STRUCTURE_USER: &str = "structure_user";
const ATTRIBUTE_PERMISSIONS: &str = "attribute_permissions";

/// Aggregated role validation failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Error, Serialize)]
#[error("Errors in the role permissions JSON provided")]
pub struct RoleValidationError {
    pub main_permissions: Vec<String>,
    pub schema_permissions: BTreeMap<String, Vec<String>>,
}

impl RoleValidationError {
    pub fn is_empty(&self) -> bool {
        self.main_permissions.is_empty() && self.schema_permissions.is_empty()
    }

    /// JSON error body.
    pub fn to_body(&self) -> Value {
        json!({
            "error": self.to_string(),
            "main_permissions": self.main_permissions,
            "schema_permissions": self.schema_permissions,
        })
    }
}

/// Validates a role's `permission` object against the schema.
pub fn validate_permissions(
    permission: &Value,
    schema: &impl SchemaLookup,
) -> Result<RolePermissions, RoleValidationError> {
    let mut errors = RoleValidationError::default();
    let mut role = RolePermissions::default();

    let Some(object) = permission.as_object() else {
        errors
            .main_permissions
            .push("'permission' must be an object".to_string());
        return Err(errors);
    };

    role.super_user = flag(object, SUPER_USER, &mut errors);
    role.cluster_user = flag(object, CLUSTER_USER, &mut errors);
    role.structure_user = structure_user(object, schema, &mut errors);

    if role.super_user && role.cluster_user {
        errors.main_permissions.push(
            "Roles cannot have both 'super_user' and 'cluster_user' values included in their permissions set."
                .to_string(),
        );
    }

    let database_keys: Vec<&String> = object
        .keys()
        .filter(|key| ![SUPER_USER, CLUSTER_USER, STRUCTURE_USER].contains(&key.as_str()))
        .collect();
    let has_other = !database_keys.is_empty() || role.structure_user != StructureUser::None;
    for (name, set) in [(SUPER_USER, role.super_user), (CLUSTER_USER, role.cluster_user)] {
        if set && has_other {
            errors.main_permissions.push(format!(
                "Roles with '{name}' set to true cannot have other permissions set."
            ));
        }
    }

    for database in database_keys {
        if !schema.has_database(database) {
            errors
                .main_permissions
                .push(format!("database '{database}' does not exist"));
            continue;
        }
        let Some(tables) = object[database].get("tables").and_then(Value::as_object) else {
            errors.main_permissions.push(format!(
                "Permissions for database '{database}' must include a 'tables' object"
            ));
            continue;
        };
        for (table, grants) in tables {
            let table_ref = TableRef::new(database, table);
            if !schema.table_exists(&table_ref) {
                errors
                    .main_permissions
                    .push(format!("Table '{table_ref}' does not exist"));
                continue;
            }
            match table_permissions(&table_ref, grants, schema) {
                Ok(perms) => {
                    role.databases
                        .entry(database.clone())
                        .or_default()
                        .insert(table.clone(), perms);
                }
                Err(table_errors) => {
                    errors
                        .schema_permissions
                        .insert(format!("{database}_{table}"), table_errors);
                }
            }
        }
    }

    if errors.is_empty() {
        Ok(role)
    } else {
        Err(errors)
    }
}

fn flag(object: &Map<String, Value>, name: &str, errors: &mut RoleValidationError) -> bool {
    match object.get(name) {
        None => false,
        Some(Value::Bool(value)) => *value,
        Some(_) => {
            errors
                .main_permissions
                .push(format!("Value for '{name}' permission must be a boolean"));
            false
        }
    }
}

fn structure_user(
    object: &Map<String, Value>,
    schema: &impl SchemaLookup,
    errors: &mut RoleValidationError,
) -> StructureUser {
    let invalid = "Value for 'structure_user' permission must be a boolean or Array of database names";
    match object.get(STRUCTURE_USER) {
        None | Some(Value::Bool(false)) => StructureUser::None,
        Some(Value::Bool(true)) => StructureUser::All,
        Some(Value::Array(items)) => {
            let mut databases = Vec::with_capacity(items.len());
            for item in items {
                match item.as_str() {
                    Some(db) if schema.has_database(db) => databases.push(db.to_string()),
                    Some(db) => errors
                        .main_permissions
                        .push(format!("database '{db}' does not exist")),
                    None => {
                        errors.main_permissions.push(invalid.to_string());
                        return StructureUser::None;
                    }
                }
            }
            StructureUser::Databases(databases)
        }
        Some(_) => {
            errors.main_permissions.push(invalid.to_string());
            StructureUser::None
        }
    }
}

fn table_permissions(
    table: &TableRef,
    grants: &Value,
    schema: &impl SchemaLookup,
) -> Result<TablePermissions, Vec<String>> {
    let mut errors = Vec::new();
    let Some(grants) = grants.as_object() else {
        return Err(vec![format!(
            "Permissions for table '{table}' must be an object"
        )]);
    };

    for key in grants.keys() {
        let known = key == ATTRIBUTE_PERMISSIONS
            || Permission::TABLE.iter().any(|p| p.as_str() == key.as_str());
        if !known {
            errors.push(format!("Invalid table permission key value '{key}'"));
        }
    }

    let mut perms = TablePermissions::default();
    for permission in Permission::TABLE {
        let value = match grants.get(permission.as_str()) {
            None => {
                errors.push(format!("Missing table {permission} permission"));
                false
            }
            Some(Value::Bool(value)) => *value,
            Some(_) => {
                errors.push(format!("Table {permission} permission must be a boolean"));
                false
            }
        };
        match permission {
            Permission::Read => perms.read = value,
            Permission::Insert => perms.insert = value,
            Permission::Update => perms.update = value,
            Permission::Delete => perms.delete = value,
        }
    }

    match grants.get(ATTRIBUTE_PERMISSIONS) {
        None | Some(Value::Null) => {}
        Some(Value::Array(entries)) => {
            for entry in entries {
                if let Some(attribute) = attribute_permission(table, entry, schema, &mut errors) {
                    perms.attribute_permissions.push(attribute);
                }
            }
        }
        Some(_) => errors.push("Value for 'attribute_permissions' must be an array".to_string()),
    }

    let conflict = Permission::ATTRIBUTE.iter().any(|permission| {
        !perms.allows(*permission)
            && perms.attribute_permissions.iter().any(|attr| match permission {
                Permission::Read => attr.read,
                Permission::Insert => attr.insert,
                Permission::Update => attr.update,
                Permission::Delete => false,
            })
    });
    if conflict {
        errors.push(format!(
            "You have a conflict with TABLE permissions for '{table}' being false and ATTRIBUTE permissions being true"
        ));
    }

    if errors.is_empty() {
        Ok(perms)
    } else {
        Err(errors)
    }
}

fn attribute_permission(
    table: &TableRef,
    entry: &Value,
    schema: &impl SchemaLookup,
    errors: &mut Vec<String>,
) -> Option<AttributePermission> {
    let Some(name) = entry.get("attribute_name").and_then(Value::as_str) else {
        errors.push(
            "Permission object in 'attribute_permissions' missing an 'attribute_name'".to_string(),
        );
        return None;
    };
    if !schema.attribute_exists(table, name) {
        errors.push(format!("Invalid attribute '{name}' in 'attribute_permissions'"));
    }

    let mut grant = |permission: Permission| -> bool {
        let label = permission.as_str().to_uppercase();
        match entry.get(permission.as_str()) {
            None => {
                errors.push(format!("{label} attribute permission missing for '{name}'"));
                false
            }
            Some(Value::Bool(value)) => *value,
            Some(_) => {
                errors.push(format!(
                    "{label} attribute permission for '{name}' must be a boolean"
                ));
                false
            }
        }
    };
    let read = grant(Permission::Read);
    let insert = grant(Permission::Insert);
    let update = grant(Permission::Update);

    Some(AttributePermission {
        attribute_name: name.to_string(),
        read,
        insert,
        update,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::AnySchema;
    use hdb_catalog::{AttributeDef, Catalog};
    use serde_json::json;
    use test_case::test_case;

    fn catalog() -> Catalog {
        let catalog = Catalog::new();
        catalog
            .create_table(
                &TableRef::new("dev", "dog"),
                "id",
                vec![AttributeDef::plain("name"), AttributeDef::plain("age")],
            )
            .unwrap();
        catalog
    }

    #[test]
    fn valid_table_role() {
        let perms = validate_permissions(
            &json!({
                "dev": {"tables": {"dog": {
                    "read": true, "insert": true, "update": true, "delete": false,
                    "attribute_permissions": [
                        {"attribute_name": "age", "read": true, "insert": false, "update": true}
                    ]
                }}}
            }),
            &catalog(),
        )
        .unwrap();
        let dog = perms.table(&TableRef::new("dev", "dog")).unwrap();
        assert!(!dog.delete);
        assert_eq!(dog.attribute_permissions.len(), 1);
    }

    #[test]
    fn super_user_with_tables_is_rejected() {
        let err = validate_permissions(
            &json!({
                "super_user": true,
                "dev": {"tables": {"dog": {"read": true, "insert": true, "update": true, "delete": true}}}
            }),
            &catalog(),
        )
        .unwrap_err();
        assert_eq!(
            err.main_permissions,
            vec!["Roles with 'super_user' set to true cannot have other permissions set."]
        );
    }

    #[test]
    fn super_and_cluster_user_conflict() {
        let err = validate_permissions(
            &json!({"super_user": true, "cluster_user": true}),
            &catalog(),
        )
        .unwrap_err();
        assert_eq!(
            err.main_permissions,
            vec![
                "Roles cannot have both 'super_user' and 'cluster_user' values included in their permissions set."
            ]
        );
    }

    #[test_case(json!({"super_user": "yes"}), "Value for 'super_user' permission must be a boolean" ; "super user type")]
    #[test_case(json!({"cluster_user": 1}), "Value for 'cluster_user' permission must be a boolean" ; "cluster user type")]
    #[test_case(json!({"structure_user": "dev"}), "Value for 'structure_user' permission must be a boolean or Array of database names" ; "structure user type")]
    #[test_case(json!({"nope": {"tables": {}}}), "database 'nope' does not exist" ; "missing database")]
    #[test_case(json!({"dev": {"tables": {"cat": {}}}}), "Table 'dev.cat' does not exist" ; "missing table")]
    fn main_permission_errors(permission: Value, expected: &str) {
        let err = validate_permissions(&permission, &catalog()).unwrap_err();
        assert_eq!(err.main_permissions, vec![expected.to_string()]);
        assert!(err.schema_permissions.is_empty());
    }

    #[test]
    fn table_errors_are_itemized() {
        let err = validate_permissions(
            &json!({
                "dev": {"tables": {"dog": {
                    "read": false, "insert": "true", "update": true, "fly": true,
                    "attribute_permissions": [
                        {"attribute_name": "age", "read": true, "insert": false},
                        {"attribute_name": "wings", "read": false, "insert": false, "update": false},
                        {"read": true}
                    ]
                }}}
            }),
            &catalog(),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "Errors in the role permissions JSON provided");
        assert!(err.main_permissions.is_empty());
        assert_eq!(
            err.schema_permissions["dev_dog"],
            vec![
                "Invalid table permission key value 'fly'",
                "Table insert permission must be a boolean",
                "Missing table delete permission",
                "UPDATE attribute permission missing for 'age'",
                "Invalid attribute 'wings' in 'attribute_permissions'",
                "Permission object in 'attribute_permissions' missing an 'attribute_name'",
                "You have a conflict with TABLE permissions for 'dev.dog' being false and ATTRIBUTE permissions being true",
            ]
        );
    }

    #[test]
    fn attribute_permissions_must_be_array() {
        let err = validate_permissions(
            &json!({"dev": {"tables": {"dog": {
                "read": true, "insert": true, "update": true, "delete": true,
                "attribute_permissions": {"attribute_name": "age"}
            }}}}),
            &catalog(),
        )
        .unwrap_err();
        assert_eq!(
            err.schema_permissions["dev_dog"],
            vec!["Value for 'attribute_permissions' must be an array"]
        );
    }

    #[test]
    fn stored_roles_load_without_schema() {
        let perms = validate_permissions(
            &json!({"gone": {"tables": {"t": {"read": true, "insert": false, "update": false, "delete": false}}}}),
            &AnySchema,
        )
        .unwrap();
        assert!(perms.table(&TableRef::new("gone", "t")).unwrap().read);
    }

    #[test]
    fn error_body_shape() {
        let err = validate_permissions(&json!({"super_user": 3}), &catalog()).unwrap_err();
        let body = err.to_body();
        assert_eq!(body["error"], "Errors in the role permissions JSON provided");
        assert_eq!(body["schema_permissions"], json!({}));
    }
}
