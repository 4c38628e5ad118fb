//! Permission evaluation.
//!
//! Evaluates an [`AccessRequest`] against a role and the schema before any
//! record is read or written.

use std::collections::BTreeSet;

use hdb_catalog::{DatabaseDef, TableDef};
use hdb_types::{SYSTEM_DATABASE, TableRef};
use tracing::{info, warn};

use crate::{
    lookup::SchemaLookup,
    mask::ReadMask,
    permissions::{Permission, Role, StructureUser, TablePermissions},
    request::{AccessRequest, TableAccess},
    verdict::{
        AttributeDenial, SchemaItem, SchemaItemError, TableDenial, UnauthorizedAccess, Verdict,
    },
};

/// Permission evaluator for one role.
///
/// Rules:
/// - super users are authorized for everything
/// - tables the role has no grant on are reported as nonexistent
/// - a missing table-level grant is reported in `unauthorized_access`
/// - reading a non-readable attribute reports it as nonexistent, unless the
///   read came from `*`, in which case the attribute is dropped by the
///   [`ReadMask`]
/// - writing an attribute the role cannot see at all reports it as
///   nonexistent; a visible attribute lacking the grant is reported under
///   `required_attribute_permissions`
pub struct PermissionEvaluator<'a, S: SchemaLookup> {
    role: &'a Role,
    schema: &'a S,
    audit_enabled: bool,
}

impl<'a, S: SchemaLookup> PermissionEvaluator<'a, S> {
    pub fn new(role: &'a Role, schema: &'a S) -> Self {
        Self {
            role,
            schema,
            audit_enabled: true,
        }
    }

    /// Disables access logging (for testing).
    pub fn without_audit(mut self) -> Self {
        self.audit_enabled = false;
        self
    }

    /// Evaluates `request`.
    pub fn authorize(&self, request: &AccessRequest) -> Verdict {
        let verdict = if self.role.is_super_user() {
            Verdict::allowed()
        } else {
            match request {
                AccessRequest::SuperUser { operation } => Verdict {
                    unauthorized_access: vec![UnauthorizedAccess::super_user_only(operation)],
                    invalid_schema_items: Vec::new(),
                },
                AccessRequest::Structure {
                    operation,
                    database,
                } => self.authorize_structure(operation, database.as_deref()),
                AccessRequest::Data { tables, .. } => {
                    let mut verdict = Verdict::allowed();
                    for access in tables {
                        verdict.merge(self.authorize_table(access));
                    }
                    verdict
                }
            }
        };

        if self.audit_enabled {
            if verdict.is_authorized() {
                info!(
                    role = %self.role.name,
                    operation = %request.operation(),
                    "Operation authorized"
                );
            } else {
                warn!(
                    role = %self.role.name,
                    operation = %request.operation(),
                    unauthorized = verdict.unauthorized_access.len(),
                    invalid_items = verdict.invalid_schema_items.len(),
                    "Operation denied"
                );
            }
        }
        verdict
    }

    fn authorize_structure(&self, operation: &str, database: Option<&str>) -> Verdict {
        let structure = &self.role.permissions.structure_user;
        let allowed = match database {
            Some(db) => db != SYSTEM_DATABASE && structure.covers(db),
            None => *structure == StructureUser::All,
        };
        if allowed {
            Verdict::allowed()
        } else {
            Verdict {
                unauthorized_access: vec![UnauthorizedAccess::super_user_only(operation)],
                invalid_schema_items: Vec::new(),
            }
        }
    }

    fn authorize_table(&self, access: &TableAccess) -> Verdict {
        let mut verdict = Verdict::allowed();
        let table = &access.table;

        let Some(def) = self.schema.lookup_table(table) else {
            verdict
                .invalid_schema_items
                .push(SchemaItemError::NotFound(SchemaItem::Table(table.clone())));
            return verdict;
        };
        let Some(perms) = self.table_permissions(table) else {
            verdict
                .invalid_schema_items
                .push(SchemaItemError::Masked(SchemaItem::Table(table.clone())));
            return verdict;
        };

        let missing_table: Vec<Permission> = access
            .permissions
            .iter()
            .copied()
            .filter(|p| !perms.allows(*p))
            .collect();

        let mut attribute_denials = Vec::new();
        for (attribute, required) in &access.attributes {
            let item = || SchemaItem::Attribute {
                attribute: attribute.clone(),
                table: table.clone(),
            };
            if !def.has_attribute(attribute) {
                // Writers may introduce new attributes unless the role is
                // limited to specific attributes.
                let write_only = required.iter().all(Permission::is_write);
                if !(write_only && !perms.has_attribute_overrides()) {
                    verdict
                        .invalid_schema_items
                        .push(SchemaItemError::NotFound(item()));
                }
                continue;
            }

            let grant = perms.attribute_grant(&def, attribute);
            let read_denied = !missing_table.contains(&Permission::Read) && !grant.read;
            if required.contains(&Permission::Read) && read_denied {
                verdict
                    .invalid_schema_items
                    .push(SchemaItemError::Masked(item()));
                continue;
            }
            // Permissions already missing at table level are reported once,
            // on the table.
            let missing: Vec<Permission> = required
                .iter()
                .copied()
                .filter(|p| p.is_write() && !missing_table.contains(p) && !grant.allows(*p))
                .collect();
            if missing.is_empty() {
                continue;
            }
            if grant.describable() {
                attribute_denials.push(AttributeDenial {
                    attribute_name: attribute.clone(),
                    required_permissions: missing,
                });
            } else {
                verdict
                    .invalid_schema_items
                    .push(SchemaItemError::Masked(item()));
            }
        }

        if !missing_table.is_empty() || !attribute_denials.is_empty() {
            verdict
                .unauthorized_access
                .push(UnauthorizedAccess::Table(TableDenial {
                    schema: table.database.clone(),
                    table: table.table.clone(),
                    required_table_permissions: missing_table,
                    required_attribute_permissions: attribute_denials,
                }));
        }
        verdict
    }

    /// Grants on `table`, or `None` when the role has no grant at all.
    fn table_permissions(&self, table: &TableRef) -> Option<&'a TablePermissions> {
        self.role
            .permissions
            .table(table)
            .filter(|perms| perms.has_any())
    }

    // ========================================================================
    // Read masks and describe filtering
    // ========================================================================

    /// Builds the read mask for the given tables.
    pub fn read_mask<'t>(&self, tables: impl IntoIterator<Item = &'t TableDef>) -> ReadMask {
        let mut mask = ReadMask::unrestricted();
        if self.role.is_super_user() {
            return mask;
        }
        for def in tables {
            let table = def.table_ref();
            let readable: BTreeSet<String> = match self.table_permissions(&table) {
                Some(perms) if perms.read => def
                    .attribute_names()
                    .filter(|attr| perms.attribute_grant(def, attr).read)
                    .map(str::to_string)
                    .collect(),
                _ => BTreeSet::new(),
            };
            mask.restrict(table, readable);
        }
        mask
    }

    /// Returns true if the role may see metadata of `database`.
    pub fn can_view_database(&self, database: &str) -> bool {
        if self.role.is_super_user() {
            return true;
        }
        if database == SYSTEM_DATABASE {
            return false;
        }
        self.role.permissions.structure_user.covers(database)
            || self
                .role
                .permissions
                .databases
                .get(database)
                .is_some_and(|tables| tables.values().any(TablePermissions::has_any))
    }

    /// Returns true if the role may see the table in describe output.
    pub fn can_describe_table(&self, table: &TableDef) -> bool {
        if self.role.is_super_user() {
            return true;
        }
        if table.database == SYSTEM_DATABASE {
            return false;
        }
        self.role.permissions.structure_user.covers(&table.database)
            || self.table_permissions(&table.table_ref()).is_some()
    }

    /// Returns true if the attribute is listed in describe output.
    pub fn can_describe_attribute(&self, table: &TableDef, attribute: &str) -> bool {
        if self.role.is_super_user() || self.role.permissions.structure_user.covers(&table.database)
        {
            return true;
        }
        self.table_permissions(&table.table_ref())
            .is_some_and(|perms| perms.attribute_grant(table, attribute).describable())
    }

    /// Tables of `database` the role may describe.
    pub fn describable_tables<'d>(&self, database: &'d DatabaseDef) -> Vec<&'d TableDef> {
        database
            .tables
            .values()
            .filter(|table| self.can_describe_table(table))
            .collect()
    }
}
