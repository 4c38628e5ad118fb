//! Permission types for access control.
//!
//! A role either carries one of the exclusive flags (`super_user`,
//! `cluster_user`) or a per-database, per-table grant map with optional
//! per-attribute overrides.

use std::{collections::BTreeMap, fmt};

use hdb_catalog::TableDef;
use hdb_types::{TableRef, is_timestamp_attribute};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// A table or attribute level permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Insert,
    Update,
    Delete,
}

impl Permission {
    /// Permissions that apply at the table level.
    pub const TABLE: [Permission; 4] = [
        Permission::Read,
        Permission::Insert,
        Permission::Update,
        Permission::Delete,
    ];

    /// Permissions that may be overridden per attribute.
    pub const ATTRIBUTE: [Permission; 3] = [Permission::Read, Permission::Insert, Permission::Update];

    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Read => "read",
            Permission::Insert => "insert",
            Permission::Update => "update",
            Permission::Delete => "delete",
        }
    }

    pub fn is_write(&self) -> bool {
        !matches!(self, Permission::Read)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Attribute grants
// ============================================================================

/// An `attribute_permissions` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributePermission {
    pub attribute_name: String,
    pub read: bool,
    pub insert: bool,
    pub update: bool,
}

/// Effective grants on one attribute after resolving overrides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttributeGrant {
    pub read: bool,
    pub insert: bool,
    pub update: bool,
}

impl AttributeGrant {
    pub fn allows(&self, permission: Permission) -> bool {
        match permission {
            Permission::Read => self.read,
            Permission::Insert => self.insert,
            Permission::Update => self.update,
            // Delete is table-level only.
            Permission::Delete => true,
        }
    }

    /// An attribute is visible to the role when any grant is set.
    pub fn describable(&self) -> bool {
        self.read || self.insert || self.update
    }
}

// ============================================================================
// Table grants
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TablePermissions {
    pub read: bool,
    pub insert: bool,
    pub update: bool,
    pub delete: bool,
    #[serde(default)]
    pub attribute_permissions: Vec<AttributePermission>,
}

impl TablePermissions {
    /// Full table access, no attribute overrides.
    pub fn all() -> Self {
        Self {
            read: true,
            insert: true,
            update: true,
            delete: true,
            attribute_permissions: Vec::new(),
        }
    }

    pub fn allows(&self, permission: Permission) -> bool {
        match permission {
            Permission::Read => self.read,
            Permission::Insert => self.insert,
            Permission::Update => self.update,
            Permission::Delete => self.delete,
        }
    }

    /// Returns true when at least one table-level grant is set.
    pub fn has_any(&self) -> bool {
        self.read || self.insert || self.update || self.delete
    }

    pub fn has_attribute_overrides(&self) -> bool {
        !self.attribute_permissions.is_empty()
    }

    /// Resolves the effective grant for `attribute`.
    ///
    /// Without overrides every attribute inherits the table grants. With
    /// overrides only listed attributes are granted, except the hash and
    /// timestamp attributes, which follow the table grants (read only when
    /// some listed attribute is readable).
    pub fn attribute_grant(&self, table: &TableDef, attribute: &str) -> AttributeGrant {
        let inherited = AttributeGrant {
            read: self.read,
            insert: self.insert,
            update: self.update,
        };
        if self.attribute_permissions.is_empty() {
            return inherited;
        }
        if let Some(entry) = self
            .attribute_permissions
            .iter()
            .find(|p| p.attribute_name == attribute)
        {
            return AttributeGrant {
                read: entry.read,
                insert: entry.insert,
                update: entry.update,
            };
        }
        if attribute == table.hash_attribute || is_timestamp_attribute(attribute) {
            let any_read = self.attribute_permissions.iter().any(|p| p.read);
            return AttributeGrant {
                read: self.read && any_read,
                ..inherited
            };
        }
        AttributeGrant::default()
    }
}

// ============================================================================
// Roles
// ============================================================================

/// The `structure_user` flag: none, every database, or a list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StructureUser {
    #[default]
    None,
    All,
    Databases(Vec<String>),
}

impl StructureUser {
    pub fn covers(&self, database: &str) -> bool {
        match self {
            StructureUser::None => false,
            StructureUser::All => true,
            StructureUser::Databases(dbs) => dbs.iter().any(|db| db == database),
        }
    }

    pub fn to_json(&self) -> Option<Value> {
        match self {
            StructureUser::None => None,
            StructureUser::All => Some(Value::Bool(true)),
            StructureUser::Databases(dbs) => Some(json!(dbs)),
        }
    }
}

/// Validated permission set of a role.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RolePermissions {
    pub super_user: bool,
    pub cluster_user: bool,
    pub structure_user: StructureUser,
    /// database → table → grants
    pub databases: BTreeMap<String, BTreeMap<String, TablePermissions>>,
}

impl RolePermissions {
    pub fn super_user() -> Self {
        Self {
            super_user: true,
            ..Self::default()
        }
    }

    /// Adds a table grant (builder style).
    pub fn with_table(mut self, table: &TableRef, permissions: TablePermissions) -> Self {
        self.databases
            .entry(table.database.clone())
            .or_default()
            .insert(table.table.clone(), permissions);
        self
    }

    pub fn table(&self, table: &TableRef) -> Option<&TablePermissions> {
        self.databases.get(&table.database)?.get(&table.table)
    }

    /// Renders the permissions in the JSON role format.
    pub fn to_json(&self) -> Value {
        let mut out = Map::new();
        if self.super_user {
            out.insert("super_user".into(), Value::Bool(true));
        }
        if self.cluster_user {
            out.insert("cluster_user".into(), Value::Bool(true));
        }
        if let Some(structure) = self.structure_user.to_json() {
            out.insert("structure_user".into(), structure);
        }
        for (db, tables) in &self.databases {
            let tables: Map<String, Value> = tables
                .iter()
                .map(|(name, perms)| (name.clone(), json!(perms)))
                .collect();
            out.insert(db.clone(), json!({ "tables": tables }));
        }
        Value::Object(out)
    }
}

/// A named role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Role {
    pub id: String,
    pub name: String,
    pub permissions: RolePermissions,
}

impl Role {
    pub fn new(id: impl Into<String>, name: impl Into<String>, permissions: RolePermissions) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            permissions,
        }
    }

    pub fn is_super_user(&self) -> bool {
        self.permissions.super_user
    }

    pub fn is_cluster_user(&self) -> bool {
        self.permissions.cluster_user
    }

    /// Stored/listed representation: `{id, role, permission}`.
    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "role": self.name,
            "permission": self.permissions.to_json(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hdb_catalog::AttributeDef;
    use hdb_types::Timestamp;

    fn dog() -> TableDef {
        let mut attributes = BTreeMap::new();
        for attr in ["id", "name", "age", "__createdtime__", "__updatedtime__"] {
            attributes.insert(attr.to_string(), AttributeDef::plain(attr));
        }
        TableDef {
            database: "dev".into(),
            name: "dog".into(),
            hash_attribute: "id".into(),
            attributes,
            created: Timestamp::EPOCH,
        }
    }

    fn restricted() -> TablePermissions {
        TablePermissions {
            read: true,
            insert: true,
            update: true,
            delete: false,
            attribute_permissions: vec![
                AttributePermission {
                    attribute_name: "name".into(),
                    read: true,
                    insert: true,
                    update: false,
                },
                AttributePermission {
                    attribute_name: "age".into(),
                    read: false,
                    insert: false,
                    update: false,
                },
            ],
        }
    }

    #[test]
    fn attributes_inherit_without_overrides() {
        let perms = TablePermissions::all();
        let grant = perms.attribute_grant(&dog(), "anything");
        assert!(grant.read && grant.insert && grant.update);
    }

    #[test]
    fn overrides_apply_to_listed_attributes() {
        let perms = restricted();
        let name = perms.attribute_grant(&dog(), "name");
        assert!(name.read && name.insert && !name.update);
        let age = perms.attribute_grant(&dog(), "age");
        assert!(!age.describable());
    }

    #[test]
    fn hash_and_timestamps_follow_table_grants() {
        let perms = restricted();
        assert!(perms.attribute_grant(&dog(), "id").read);
        assert!(perms.attribute_grant(&dog(), "id").insert);
        assert!(perms.attribute_grant(&dog(), "__createdtime__").read);
        // Unlisted regular attribute under overrides: nothing.
        assert_eq!(
            perms.attribute_grant(&dog(), "breed"),
            AttributeGrant::default()
        );
    }

    #[test]
    fn structure_user_coverage() {
        assert!(StructureUser::All.covers("dev"));
        assert!(StructureUser::Databases(vec!["dev".into()]).covers("dev"));
        assert!(!StructureUser::Databases(vec!["dev".into()]).covers("other"));
        assert!(!StructureUser::None.covers("dev"));
    }

    #[test]
    fn permissions_render_in_role_format() {
        let perms = RolePermissions::default()
            .with_table(&TableRef::new("dev", "dog"), TablePermissions::all());
        let json = perms.to_json();
        assert_eq!(json["dev"]["tables"]["dog"]["read"], true);
        assert_eq!(json["dev"]["tables"]["dog"]["attribute_permissions"], json!([]));
        assert!(json.get("super_user").is_none());
    }
}
