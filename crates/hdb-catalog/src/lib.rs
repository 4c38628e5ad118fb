//! # hdb-catalog: Schema catalog for `hdb`
//!
//! The catalog is the registry of databases → tables → attributes that every
//! other component resolves names against:
//! - [`Catalog`]: thread-safe registry with create/drop operations and
//!   schema-on-write attribute registration
//! - [`schema`]: table and attribute definitions, including computed
//!   attributes
//! - [`describe`]: `describe_table` / `describe_database` views
//! - [`persistence`]: JSON snapshots so the catalog survives restarts
//!
//! ## Example
//!
//! ```
//! use hdb_catalog::{AttributeDef, Catalog};
//! use hdb_types::TableRef;
//!
//! let catalog = Catalog::new();
//! let dog = TableRef::new("dev", "dog");
//! catalog.create_table(&dog, "id", vec![AttributeDef::indexed("owner_id")]).unwrap();
//!
//! let added = catalog.ensure_attributes(&dog, ["name", "owner_id"]).unwrap();
//! assert_eq!(added, vec!["name"]);
//! ```

mod catalog;
pub mod describe;
mod error;
pub mod persistence;
pub mod schema;

pub use catalog::Catalog;
pub use describe::{DatabaseDescription, TableDescription, TableStats};
pub use error::{CatalogError, Result};
pub use persistence::CatalogSnapshot;
pub use schema::{
    AttributeDef, ComputedAttribute, ComputedMode, ComputedSource, DatabaseDef, TableDef,
};
