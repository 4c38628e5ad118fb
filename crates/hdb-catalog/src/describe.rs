//! `describe_*` views of the catalog.
//!
//! Views take a visibility predicate so callers can hide attributes or
//! tables the requesting role may not see.

use std::collections::BTreeMap;

use hdb_types::Timestamp;
use serde::Serialize;

use crate::schema::{DatabaseDef, TableDef};

/// Runtime statistics the catalog does not track itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableStats {
    pub record_count: usize,
    pub last_updated_record: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributeDescription {
    pub attribute: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub indexed: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_primary_key: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub computed: Option<String>,
}

/// Output of `describe_table`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableDescription {
    pub schema: String,
    pub name: String,
    pub hash_attribute: String,
    pub attributes: Vec<AttributeDescription>,
    pub record_count: usize,
    pub last_updated_record: Option<Timestamp>,
}

/// Output of `describe_database`: table name to description.
pub type DatabaseDescription = BTreeMap<String, TableDescription>;

impl TableDescription {
    /// Describes `table`, listing only attributes for which `visible`
    /// returns true.
    pub fn new(table: &TableDef, stats: TableStats, visible: impl Fn(&str) -> bool) -> Self {
        let attributes = table
            .attributes
            .values()
            .filter(|attr| visible(&attr.name))
            .map(|attr| AttributeDescription {
                attribute: attr.name.clone(),
                indexed: attr.indexed,
                is_primary_key: attr.name == table.hash_attribute,
                computed: attr.computed.as_ref().map(|source| source.describe()),
            })
            .collect();
        Self {
            schema: table.database.clone(),
            name: table.name.clone(),
            hash_attribute: table.hash_attribute.clone(),
            attributes,
            record_count: stats.record_count,
            last_updated_record: stats.last_updated_record,
        }
    }
}

/// Describes every table of `database` accepted by `describe`.
pub fn describe_database(
    database: &DatabaseDef,
    mut describe: impl FnMut(&TableDef) -> Option<TableDescription>,
) -> DatabaseDescription {
    database
        .tables
        .values()
        .filter_map(|table| describe(table).map(|desc| (table.name.clone(), desc)))
        .collect()
}
