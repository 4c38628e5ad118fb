//! Access requests: what an operation needs before it may run.

use std::collections::{BTreeMap, BTreeSet};

use hdb_types::TableRef;

use crate::permissions::Permission;

/// Access needed on one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableAccess {
    pub table: TableRef,
    /// Table-level permissions required.
    pub permissions: BTreeSet<Permission>,
    /// Referenced attributes and the permissions each one needs.
    pub attributes: BTreeMap<String, BTreeSet<Permission>>,
    /// The operation reads every attribute (`*`). Masked attributes are
    /// dropped from the result instead of being reported.
    pub wildcard_read: bool,
}

impl TableAccess {
    pub fn new(table: TableRef) -> Self {
        Self {
            table,
            permissions: BTreeSet::new(),
            attributes: BTreeMap::new(),
            wildcard_read: false,
        }
    }

    /// Requires a table-level permission.
    pub fn require(mut self, permission: Permission) -> Self {
        self.permissions.insert(permission);
        self
    }

    /// Requires a permission on an attribute.
    pub fn attribute(mut self, name: impl Into<String>, permission: Permission) -> Self {
        self.add_attribute(name, permission);
        self
    }

    pub fn add_attribute(&mut self, name: impl Into<String>, permission: Permission) {
        self.attributes
            .entry(name.into())
            .or_default()
            .insert(permission);
    }

    pub fn wildcard(mut self) -> Self {
        self.wildcard_read = true;
        self
    }

    /// Returns true when the access writes to the table.
    pub fn is_write(&self) -> bool {
        self.permissions.iter().any(Permission::is_write)
    }

    /// Merges another access to the same table (self-joins, subqueries).
    pub fn merge(&mut self, other: TableAccess) {
        self.permissions.extend(other.permissions);
        for (name, perms) in other.attributes {
            self.attributes.entry(name).or_default().extend(perms);
        }
        self.wildcard_read |= other.wildcard_read;
    }
}

/// What an operation requires from the caller's role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessRequest {
    /// Restricted to super users whatever the grants.
    SuperUser { operation: String },
    /// Structure changes inside a database (`structure_user` may run them).
    /// `database: None` is a database-level change (create/drop database).
    Structure {
        operation: String,
        database: Option<String>,
    },
    /// Data access on one or more tables.
    Data {
        operation: String,
        tables: Vec<TableAccess>,
    },
}

impl AccessRequest {
    pub fn super_user(operation: impl Into<String>) -> Self {
        AccessRequest::SuperUser {
            operation: operation.into(),
        }
    }

    pub fn structure(operation: impl Into<String>, database: Option<String>) -> Self {
        AccessRequest::Structure {
            operation: operation.into(),
            database,
        }
    }

    /// Builds a data request, merging accesses to the same table.
    pub fn data(operation: impl Into<String>, accesses: impl IntoIterator<Item = TableAccess>) -> Self {
        let mut tables: Vec<TableAccess> = Vec::new();
        for access in accesses {
            match tables.iter_mut().find(|t| t.table == access.table) {
                Some(existing) => existing.merge(access),
                None => tables.push(access),
            }
        }
        AccessRequest::Data {
            operation: operation.into(),
            tables,
        }
    }

    pub fn operation(&self) -> &str {
        match self {
            AccessRequest::SuperUser { operation }
            | AccessRequest::Structure { operation, .. }
            | AccessRequest::Data { operation, .. } => operation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_requests_merge_same_table() {
        let dog = TableRef::new("dev", "dog");
        let request = AccessRequest::data(
            "sql",
            [
                TableAccess::new(dog.clone())
                    .require(Permission::Read)
                    .attribute("name", Permission::Read),
                TableAccess::new(dog.clone())
                    .require(Permission::Read)
                    .attribute("age", Permission::Read)
                    .wildcard(),
            ],
        );
        let AccessRequest::Data { tables, .. } = request else {
            panic!("expected data request");
        };
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].attributes.len(), 2);
        assert!(tables[0].wildcard_read);
        assert!(!tables[0].is_write());
    }
}
