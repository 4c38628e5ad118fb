//! Catalog definitions: databases, tables, attributes.

use std::collections::BTreeMap;

use hdb_types::{TableRef, Timestamp, is_timestamp_attribute};
use serde::{Deserialize, Serialize};

// ============================================================================
// Computed Attributes
// ============================================================================

/// Where a computed attribute's value comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputedSource {
    /// An expression over other attributes, e.g. `price + (price * taxRate)`.
    Formula(String),
    /// A function registered with the query engine under this name.
    Callback(String),
}

impl ComputedSource {
    /// Human readable form used by describe output.
    pub fn describe(&self) -> String {
        match self {
            ComputedSource::Formula(formula) => formula.clone(),
            ComputedSource::Callback(name) => format!("callback:{name}"),
        }
    }
}

/// When a computed attribute is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputedMode {
    /// Evaluated on every read, never stored.
    Lazy,
    /// Evaluated at write time and stored, so it can be indexed.
    Materialized,
}

/// A computed attribute declared on a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputedAttribute {
    pub name: String,
    pub source: ComputedSource,
    pub indexed: bool,
}

impl ComputedAttribute {
    pub fn mode(&self) -> ComputedMode {
        if self.indexed {
            ComputedMode::Materialized
        } else {
            ComputedMode::Lazy
        }
    }
}

// ============================================================================
// Attributes
// ============================================================================

/// A declared attribute of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDef {
    pub name: String,
    #[serde(default)]
    pub indexed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub computed: Option<ComputedSource>,
}

impl AttributeDef {
    /// A plain, unindexed attribute.
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            indexed: false,
            computed: None,
        }
    }

    /// An attribute backed by a secondary index.
    pub fn indexed(name: impl Into<String>) -> Self {
        Self {
            indexed: true,
            ..Self::plain(name)
        }
    }

    /// A computed attribute.
    pub fn computed(name: impl Into<String>, source: ComputedSource, indexed: bool) -> Self {
        Self {
            name: name.into(),
            indexed,
            computed: Some(source),
        }
    }
}

// ============================================================================
// Tables
// ============================================================================

/// A table definition.
///
/// `attributes` always includes the hash attribute and both timestamp
/// attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDef {
    pub database: String,
    pub name: String,
    pub hash_attribute: String,
    pub attributes: BTreeMap<String, AttributeDef>,
    pub created: Timestamp,
}

impl TableDef {
    pub fn table_ref(&self) -> TableRef {
        TableRef::new(&self.database, &self.name)
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.contains_key(name)
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeDef> {
        self.attributes.get(name)
    }

    /// Attribute names in catalog order.
    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys().map(String::as_str)
    }

    /// Computed attributes declared on this table.
    pub fn computed_attributes(&self) -> Vec<ComputedAttribute> {
        self.attributes
            .values()
            .filter_map(|attr| {
                attr.computed.as_ref().map(|source| ComputedAttribute {
                    name: attr.name.clone(),
                    source: source.clone(),
                    indexed: attr.indexed,
                })
            })
            .collect()
    }

    pub fn is_computed(&self, name: &str) -> bool {
        self.attributes
            .get(name)
            .is_some_and(|attr| attr.computed.is_some())
    }

    /// Attributes with a secondary index, excluding the hash attribute and
    /// lazy computed attributes (which are never stored).
    pub fn secondary_indexes(&self) -> Vec<String> {
        self.attributes
            .values()
            .filter(|attr| attr.indexed && attr.name != self.hash_attribute)
            .map(|attr| attr.name.clone())
            .collect()
    }

    /// Returns true if the attribute is managed by the system rather than by
    /// callers.
    pub fn is_system_attribute(&self, name: &str) -> bool {
        is_timestamp_attribute(name)
    }
}

// ============================================================================
// Databases
// ============================================================================

/// A database: a named container of tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseDef {
    pub name: String,
    pub tables: BTreeMap<String, TableDef>,
}

impl DatabaseDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> TableDef {
        let mut attributes = BTreeMap::new();
        for attr in [
            AttributeDef::indexed("id"),
            AttributeDef::plain("price"),
            AttributeDef::computed(
                "total",
                ComputedSource::Formula("price * 2".into()),
                false,
            ),
            AttributeDef::computed("tax", ComputedSource::Callback("tax".into()), true),
            AttributeDef::indexed("owner_id"),
        ] {
            attributes.insert(attr.name.clone(), attr);
        }
        TableDef {
            database: "dev".into(),
            name: "product".into(),
            hash_attribute: "id".into(),
            attributes,
            created: Timestamp::EPOCH,
        }
    }

    #[test]
    fn computed_attribute_modes() {
        let table = table();
        let computed = table.computed_attributes();
        assert_eq!(computed.len(), 2);
        let tax = computed.iter().find(|c| c.name == "tax").unwrap();
        assert_eq!(tax.mode(), ComputedMode::Materialized);
        let total = computed.iter().find(|c| c.name == "total").unwrap();
        assert_eq!(total.mode(), ComputedMode::Lazy);
    }

    #[test]
    fn secondary_indexes_exclude_hash_attribute() {
        let table = table();
        assert_eq!(table.secondary_indexes(), vec!["owner_id", "tax"]);
        assert!(table.is_computed("total"));
        assert!(!table.is_computed("price"));
    }
}
