//! Read masks: which attributes of which tables a role may read.
//!
//! The executor consults the mask when expanding `*` so hidden attributes
//! are silently left out of results.

use std::collections::{BTreeSet, HashMap};

use hdb_types::TableRef;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadMask {
    /// Tables absent from the map are unrestricted.
    restricted: HashMap<TableRef, BTreeSet<String>>,
}

impl ReadMask {
    /// A mask that hides nothing (super users).
    pub fn unrestricted() -> Self {
        Self::default()
    }

    /// Limits `table` to the given readable attributes.
    pub fn restrict(&mut self, table: TableRef, readable: BTreeSet<String>) {
        self.restricted.insert(table, readable);
    }

    pub fn allows(&self, table: &TableRef, attribute: &str) -> bool {
        self.restricted
            .get(table)
            .is_none_or(|readable| readable.contains(attribute))
    }

    pub fn is_unrestricted(&self) -> bool {
        self.restricted.is_empty()
    }
}
