//! The schema catalog.
//!
//! A registry of databases, tables and attributes shared by every request.
//! Structural changes take the catalog write lock, so a table created by one
//! request is visible to the next request immediately.

use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use hdb_types::{
    INFO_TABLE, JOB_TABLE, NODES_TABLE, ROLE_TABLE, SYSTEM_DATABASE, TIMESTAMP_ATTRIBUTES,
    TableRef, Timestamp, USER_TABLE, is_timestamp_attribute, validate_attribute_name,
    validate_identifier,
};
use tracing::{debug, info};

use crate::{
    error::{CatalogError, Result},
    persistence::CatalogSnapshot,
    schema::{AttributeDef, DatabaseDef, TableDef},
};

type Databases = BTreeMap<String, DatabaseDef>;

/// Hash attributes of the system tables.
const SYSTEM_TABLES: [(&str, &str); 5] = [
    (ROLE_TABLE, "id"),
    (USER_TABLE, "username"),
    (JOB_TABLE, "id"),
    (NODES_TABLE, "name"),
    (INFO_TABLE, "info_id"),
];

/// Registry of databases, tables and attributes.
#[derive(Debug, Default)]
pub struct Catalog {
    databases: RwLock<Databases>,
    snapshot_path: Option<PathBuf>,
}

impl Catalog {
    /// Creates an empty, in-memory catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a catalog persisted at `path`, restoring the snapshot if one
    /// exists. Every structural change is written back to `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let databases = match CatalogSnapshot::load(&path)? {
            Some(snapshot) => {
                info!(path = %path.display(), databases = snapshot.databases.len(), "Catalog restored");
                snapshot.into_databases()
            }
            None => Databases::new(),
        };
        Ok(Self {
            databases: RwLock::new(databases),
            snapshot_path: Some(path),
        })
    }

    /// Creates the `system` database and its tables if they are missing.
    pub fn ensure_system_tables(&self) -> Result<()> {
        let mut dbs = self.write()?;
        let system = dbs
            .entry(SYSTEM_DATABASE.to_string())
            .or_insert_with(|| DatabaseDef::new(SYSTEM_DATABASE));
        let mut changed = false;
        for (table, hash_attribute) in SYSTEM_TABLES {
            if !system.tables.contains_key(table) {
                system.tables.insert(
                    table.to_string(),
                    new_table(SYSTEM_DATABASE, table, hash_attribute, Vec::new()),
                );
                changed = true;
            }
        }
        if changed {
            self.persist(&dbs)?;
        }
        Ok(())
    }

    // ========================================================================
    // Databases
    // ========================================================================

    pub fn create_database(&self, name: &str) -> Result<()> {
        validate_identifier("Database", name)?;
        let mut dbs = self.write()?;
        if dbs.contains_key(name) {
            return Err(CatalogError::DatabaseExists(name.to_string()));
        }
        dbs.insert(name.to_string(), DatabaseDef::new(name));
        self.persist(&dbs)?;
        info!(database = %name, "Database created");
        Ok(())
    }

    /// Drops a database, returning its definition so callers can release
    /// the tables' storage.
    pub fn drop_database(&self, name: &str) -> Result<DatabaseDef> {
        let mut dbs = self.write()?;
        let dropped = dbs
            .remove(name)
            .ok_or_else(|| CatalogError::DatabaseNotFound(name.to_string()))?;
        self.persist(&dbs)?;
        info!(database = %name, tables = dropped.tables.len(), "Database dropped");
        Ok(dropped)
    }

    pub fn has_database(&self, name: &str) -> bool {
        self.read().is_ok_and(|dbs| dbs.contains_key(name))
    }

    pub fn database(&self, name: &str) -> Result<DatabaseDef> {
        self.read()?
            .get(name)
            .cloned()
            .ok_or_else(|| CatalogError::DatabaseNotFound(name.to_string()))
    }

    /// All databases, cloned.
    pub fn databases(&self) -> Result<Vec<DatabaseDef>> {
        Ok(self.read()?.values().cloned().collect())
    }

    // ========================================================================
    // Tables
    // ========================================================================

    /// Creates a table. The database is created if it does not exist yet.
    pub fn create_table(
        &self,
        table: &TableRef,
        hash_attribute: &str,
        attributes: Vec<AttributeDef>,
    ) -> Result<TableDef> {
        validate_identifier("Database", &table.database)?;
        validate_identifier("Table", &table.table)?;
        validate_attribute_name(hash_attribute)?;
        for attr in &attributes {
            validate_attribute_name(&attr.name)?;
        }

        let mut dbs = self.write()?;
        let db = dbs.entry(table.database.clone()).or_insert_with(|| {
            debug!(database = %table.database, "Database created implicitly by create_table");
            DatabaseDef::new(&table.database)
        });
        if db.tables.contains_key(&table.table) {
            return Err(CatalogError::TableExists(table.clone()));
        }
        let def = new_table(&table.database, &table.table, hash_attribute, attributes);
        db.tables.insert(table.table.clone(), def.clone());
        self.persist(&dbs)?;
        info!(table = %table, hash_attribute = %hash_attribute, "Table created");
        Ok(def)
    }

    pub fn drop_table(&self, table: &TableRef) -> Result<TableDef> {
        let mut dbs = self.write()?;
        let db = dbs
            .get_mut(&table.database)
            .ok_or_else(|| CatalogError::DatabaseNotFound(table.database.clone()))?;
        let dropped = db
            .tables
            .remove(&table.table)
            .ok_or_else(|| CatalogError::TableNotFound(table.clone()))?;
        self.persist(&dbs)?;
        info!(table = %table, "Table dropped");
        Ok(dropped)
    }

    pub fn table(&self, table: &TableRef) -> Result<TableDef> {
        let dbs = self.read()?;
        let db = dbs
            .get(&table.database)
            .ok_or_else(|| CatalogError::DatabaseNotFound(table.database.clone()))?;
        db.tables
            .get(&table.table)
            .cloned()
            .ok_or_else(|| CatalogError::TableNotFound(table.clone()))
    }

    // ========================================================================
    // Attributes
    // ========================================================================

    pub fn create_attribute(&self, table: &TableRef, attribute: AttributeDef) -> Result<()> {
        validate_attribute_name(&attribute.name)?;
        let mut dbs = self.write()?;
        let def = table_mut(&mut dbs, table)?;
        if def.attributes.contains_key(&attribute.name) {
            return Err(CatalogError::AttributeExists {
                attribute: attribute.name,
                table: table.clone(),
            });
        }
        info!(table = %table, attribute = %attribute.name, indexed = attribute.indexed, "Attribute created");
        def.attributes.insert(attribute.name.clone(), attribute);
        self.persist(&dbs)
    }

    pub fn drop_attribute(&self, table: &TableRef, attribute: &str) -> Result<()> {
        let mut dbs = self.write()?;
        let def = table_mut(&mut dbs, table)?;
        if def.hash_attribute == attribute {
            return Err(CatalogError::DropHashAttribute);
        }
        if TIMESTAMP_ATTRIBUTES.contains(&attribute) {
            return Err(CatalogError::DropTimestampAttribute(attribute.to_string()));
        }
        if def.attributes.remove(attribute).is_none() {
            return Err(CatalogError::AttributeNotFound {
                attribute: attribute.to_string(),
                table: table.clone(),
            });
        }
        self.persist(&dbs)?;
        info!(table = %table, attribute = %attribute, "Attribute dropped");
        Ok(())
    }

    /// Registers any attributes not yet declared on the table.
    ///
    /// Every name is validated before anything is registered, and the whole
    /// call runs under one write lock, so concurrent writers introducing the
    /// same attribute converge on a single registration. Returns the names
    /// that were newly added.
    pub fn ensure_attributes<'a>(
        &self,
        table: &TableRef,
        names: impl IntoIterator<Item = &'a str>,
    ) -> Result<Vec<String>> {
        let names: Vec<&str> = names.into_iter().collect();
        for name in &names {
            validate_attribute_name(name)?;
        }

        // Fast path: nothing new.
        {
            let dbs = self.read()?;
            let def = table_ref(&dbs, table)?;
            if names.iter().all(|name| def.attributes.contains_key(*name)) {
                return Ok(Vec::new());
            }
        }

        let mut dbs = self.write()?;
        let def = table_mut(&mut dbs, table)?;
        let mut added = Vec::new();
        for name in names {
            if !def.attributes.contains_key(name) {
                def.attributes
                    .insert(name.to_string(), AttributeDef::plain(name));
                added.push(name.to_string());
            }
        }
        if !added.is_empty() {
            debug!(table = %table, attributes = ?added, "Attributes registered on write");
            self.persist(&dbs)?;
        }
        Ok(added)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn read(&self) -> Result<RwLockReadGuard<'_, Databases>> {
        self.databases.read().map_err(|_| CatalogError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Databases>> {
        self.databases.write().map_err(|_| CatalogError::Poisoned)
    }

    fn persist(&self, dbs: &Databases) -> Result<()> {
        match &self.snapshot_path {
            Some(path) => CatalogSnapshot::from_databases(dbs).save(path),
            None => Ok(()),
        }
    }
}

fn new_table(
    database: &str,
    table: &str,
    hash_attribute: &str,
    attributes: Vec<AttributeDef>,
) -> TableDef {
    let mut defs = BTreeMap::new();
    defs.insert(hash_attribute.to_string(), AttributeDef::indexed(hash_attribute));
    for name in TIMESTAMP_ATTRIBUTES {
        defs.insert(name.to_string(), AttributeDef::plain(name));
    }
    for attr in attributes {
        if attr.name == hash_attribute || is_timestamp_attribute(&attr.name) {
            continue;
        }
        defs.insert(attr.name.clone(), attr);
    }
    TableDef {
        database: database.to_string(),
        name: table.to_string(),
        hash_attribute: hash_attribute.to_string(),
        attributes: defs,
        created: Timestamp::now(),
    }
}

fn table_ref<'a>(dbs: &'a Databases, table: &TableRef) -> Result<&'a TableDef> {
    dbs.get(&table.database)
        .ok_or_else(|| CatalogError::DatabaseNotFound(table.database.clone()))?
        .tables
        .get(&table.table)
        .ok_or_else(|| CatalogError::TableNotFound(table.clone()))
}

fn table_mut<'a>(dbs: &'a mut Databases, table: &TableRef) -> Result<&'a mut TableDef> {
    dbs.get_mut(&table.database)
        .ok_or_else(|| CatalogError::DatabaseNotFound(table.database.clone()))?
        .tables
        .get_mut(&table.table)
        .ok_or_else(|| CatalogError::TableNotFound(table.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ComputedSource;
    use proptest::prelude::*;
    use std::collections::BTreeSet;
    use test_case::test_case;

    fn dog() -> TableRef {
        TableRef::new("dev", "dog")
    }

    #[test]
    fn create_table_registers_hash_and_timestamps() {
        let catalog = Catalog::new();
        let def = catalog.create_table(&dog(), "id", Vec::new()).unwrap();
        assert_eq!(def.hash_attribute, "id");
        let names: Vec<&str> = def.attribute_names().collect();
        assert_eq!(names, vec!["__createdtime__", "__updatedtime__", "id"]);
        assert!(catalog.has_database("dev"));
    }

    #[test]
    fn duplicate_structures_conflict() {
        let catalog = Catalog::new();
        catalog.create_database("dev").unwrap();
        let err = catalog.create_database("dev").unwrap_err();
        assert!(err.is_conflict());

        catalog.create_table(&dog(), "id", Vec::new()).unwrap();
        let err = catalog.create_table(&dog(), "id", Vec::new()).unwrap_err();
        assert_eq!(err.to_string(), "Table 'dog' already exists in 'dev'");

        catalog
            .create_attribute(&dog(), AttributeDef::plain("name"))
            .unwrap();
        assert!(
            catalog
                .create_attribute(&dog(), AttributeDef::plain("name"))
                .unwrap_err()
                .is_conflict()
        );
    }

    #[test]
    fn not_found_messages() {
        let catalog = Catalog::new();
        let err = catalog.table(&TableRef::new("nope", "dog")).unwrap_err();
        assert_eq!(err.to_string(), "database 'nope' does not exist");

        catalog.create_database("dev").unwrap();
        let err = catalog.table(&dog()).unwrap_err();
        assert_eq!(err.to_string(), "Table 'dev.dog' does not exist");
    }

    #[test_case("123" ; "numeric")]
    #[test_case("4" ; "single digit")]
    #[test_case("call" ; "reserved word")]
    fn numeric_looking_identifiers_are_opaque(name: &str) {
        let catalog = Catalog::new();
        catalog
            .create_table(&TableRef::new(name, name), "id", Vec::new())
            .unwrap();
        assert!(catalog.table(&TableRef::new(name, name)).is_ok());
    }

    #[test]
    fn drop_attribute_rules() {
        let catalog = Catalog::new();
        catalog
            .create_table(&dog(), "id", vec![AttributeDef::plain("age")])
            .unwrap();

        assert!(matches!(
            catalog.drop_attribute(&dog(), "id"),
            Err(CatalogError::DropHashAttribute)
        ));
        assert!(matches!(
            catalog.drop_attribute(&dog(), "__createdtime__"),
            Err(CatalogError::DropTimestampAttribute(_))
        ));
        catalog.drop_attribute(&dog(), "age").unwrap();
        assert!(!catalog.table(&dog()).unwrap().has_attribute("age"));
        assert!(catalog.drop_attribute(&dog(), "age").unwrap_err().is_not_found());

        // Re-provided on write: recreated.
        let added = catalog.ensure_attributes(&dog(), ["age"]).unwrap();
        assert_eq!(added, vec!["age"]);
    }

    #[test]
    fn ensure_attributes_validates_before_registering() {
        let catalog = Catalog::new();
        catalog.create_table(&dog(), "id", Vec::new()).unwrap();

        let err = catalog
            .ensure_attributes(&dog(), ["good", "bad/name"])
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Attribute names cannot include backticks or forward slashes"
        );
        assert!(!catalog.table(&dog()).unwrap().has_attribute("good"));

        let added = catalog.ensure_attributes(&dog(), ["good", "id"]).unwrap();
        assert_eq!(added, vec!["good"]);
        assert!(catalog.ensure_attributes(&dog(), ["good"]).unwrap().is_empty());
    }

    #[test]
    fn concurrent_registration_converges() {
        let catalog = std::sync::Arc::new(Catalog::new());
        catalog.create_table(&dog(), "id", Vec::new()).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let catalog = catalog.clone();
                std::thread::spawn(move || catalog.ensure_attributes(&dog(), ["color"]).unwrap())
            })
            .collect();
        let added: usize = handles.into_iter().map(|h| h.join().unwrap().len()).sum();
        assert_eq!(added, 1);
    }

    #[test]
    fn system_tables_bootstrap_is_idempotent() {
        let catalog = Catalog::new();
        catalog.ensure_system_tables().unwrap();
        catalog.ensure_system_tables().unwrap();
        let system = catalog.database(SYSTEM_DATABASE).unwrap();
        assert_eq!(system.tables.len(), 5);
        assert_eq!(system.tables[USER_TABLE].hash_attribute, "username");
    }

    #[test]
    fn computed_attributes_survive_creation() {
        let catalog = Catalog::new();
        let def = catalog
            .create_table(
                &TableRef::new("dev", "product"),
                "id",
                vec![AttributeDef::computed(
                    "total",
                    ComputedSource::Formula("price + (price * taxRate)".into()),
                    true,
                )],
            )
            .unwrap();
        assert!(def.is_computed("total"));
        assert_eq!(def.secondary_indexes(), vec!["total"]);
    }

    proptest! {
        #[test]
        fn ensure_attributes_adds_each_new_name_once(
            first in proptest::collection::vec("[a-z][a-z0-9_]{0,7}", 0..6),
            second in proptest::collection::vec("[a-z][a-z0-9_]{0,7}", 0..6),
        ) {
            let catalog = Catalog::new();
            catalog.create_table(&dog(), "id", Vec::new()).unwrap();

            let names = |catalog: &Catalog| -> BTreeSet<String> {
                catalog
                    .table(&dog())
                    .unwrap()
                    .attribute_names()
                    .map(str::to_string)
                    .collect()
            };
            let mut known = names(&catalog);
            for batch in [&first, &second] {
                let expected: BTreeSet<String> = batch
                    .iter()
                    .filter(|name| !known.contains(*name))
                    .cloned()
                    .collect();
                let added = catalog
                    .ensure_attributes(&dog(), batch.iter().map(String::as_str))
                    .unwrap();
                prop_assert_eq!(added.len(), expected.len());
                prop_assert_eq!(added.into_iter().collect::<BTreeSet<_>>(), expected.clone());
                known.extend(expected);
            }

            prop_assert_eq!(names(&catalog), known);
            let again = catalog
                .ensure_attributes(&dog(), first.iter().map(String::as_str))
                .unwrap();
            prop_assert!(again.is_empty());
        }

        #[test]
        fn one_invalid_name_registers_nothing(
            valid in proptest::collection::vec("[a-z]{1,6}", 1..5),
            position in any::<prop::sample::Index>(),
        ) {
            let catalog = Catalog::new();
            catalog.create_table(&dog(), "id", Vec::new()).unwrap();

            let mut names: Vec<&str> = valid.iter().map(String::as_str).collect();
            names.insert(position.index(names.len() + 1), "bad/name");
            prop_assert!(catalog.ensure_attributes(&dog(), names).is_err());
            prop_assert_eq!(catalog.table(&dog()).unwrap().attribute_names().count(), 3);
        }
    }
}
