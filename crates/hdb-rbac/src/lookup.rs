//! Schema lookups needed by role validation and the evaluator.

use hdb_catalog::{Catalog, TableDef};
use hdb_types::TableRef;

/// Read-only view of the schema catalog.
pub trait SchemaLookup {
    fn has_database(&self, database: &str) -> bool;

    fn lookup_table(&self, table: &TableRef) -> Option<TableDef>;

    fn table_exists(&self, table: &TableRef) -> bool {
        self.lookup_table(table).is_some()
    }

    fn attribute_exists(&self, table: &TableRef, attribute: &str) -> bool {
        self.lookup_table(table)
            .is_some_and(|def| def.has_attribute(attribute))
    }
}

impl SchemaLookup for Catalog {
    fn has_database(&self, database: &str) -> bool {
        Catalog::has_database(self, database)
    }

    fn lookup_table(&self, table: &TableRef) -> Option<TableDef> {
        self.table(table).ok()
    }
}

/// Accepts every database and table. Used when loading stored roles, whose
/// referenced tables may have been dropped since the role was written.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnySchema;

impl SchemaLookup for AnySchema {
    fn has_database(&self, _database: &str) -> bool {
        true
    }

    fn lookup_table(&self, _table: &TableRef) -> Option<TableDef> {
        None
    }

    fn table_exists(&self, _table: &TableRef) -> bool {
        true
    }

    fn attribute_exists(&self, _table: &TableRef, _attribute: &str) -> bool {
        true
    }
}
