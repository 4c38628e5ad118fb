//! In-memory record store.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use hdb_types::{HashKey, Record, TableRef, Timestamp, UPDATED_TIME_ATTRIBUTE};
use serde_json::Value;
use tracing::debug;

use crate::{RecordStore, Result, StoreError, UpsertOutcome};

/// Index key: canonical JSON text of the value.
type IndexKey = String;

#[derive(Debug, Default)]
struct TableData {
    records: BTreeMap<HashKey, Record>,
    indexes: HashMap<String, BTreeMap<IndexKey, BTreeSet<HashKey>>>,
}

impl TableData {
    fn index_record(&mut self, key: &HashKey, record: &Record) {
        for (attribute, index) in &mut self.indexes {
            if let Some(value) = record.get(attribute) {
                index
                    .entry(index_key(value))
                    .or_default()
                    .insert(key.clone());
            }
        }
    }

    fn unindex_record(&mut self, key: &HashKey, record: &Record) {
        for (attribute, index) in &mut self.indexes {
            if let Some(value) = record.get(attribute) {
                let entry_key = index_key(value);
                if let Some(keys) = index.get_mut(&entry_key) {
                    keys.remove(key);
                    if keys.is_empty() {
                        index.remove(&entry_key);
                    }
                }
            }
        }
    }

    fn put(&mut self, key: HashKey, record: Record) {
        if let Some(old) = self.records.remove(&key) {
            self.unindex_record(&key, &old);
        }
        self.index_record(&key, &record);
        self.records.insert(key, record);
    }
}

fn index_key(value: &Value) -> IndexKey {
    value.to_string()
}

/// Record store keeping every table in memory.
///
/// Each table holds its records in a `BTreeMap` keyed by hash value plus one
/// equality index per indexed attribute. The whole store sits behind one
/// `RwLock`; per-key atomicity follows from mutations holding the write lock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<TableRef, TableData>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<TableRef, TableData>>> {
        self.tables.read().map_err(|_| StoreError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<TableRef, TableData>>> {
        self.tables.write().map_err(|_| StoreError::Poisoned)
    }
}

fn table<'a>(
    tables: &'a HashMap<TableRef, TableData>,
    table: &TableRef,
) -> Result<&'a TableData> {
    tables
        .get(table)
        .ok_or_else(|| StoreError::TableNotFound(table.clone()))
}

fn table_mut<'a>(
    tables: &'a mut HashMap<TableRef, TableData>,
    table: &TableRef,
) -> Result<&'a mut TableData> {
    tables
        .get_mut(table)
        .ok_or_else(|| StoreError::TableNotFound(table.clone()))
}

impl RecordStore for MemoryStore {
    fn create_table(&self, table: &TableRef, indexes: &[String]) -> Result<()> {
        let mut tables = self.write()?;
        if tables.contains_key(table) {
            return Err(StoreError::TableExists(table.clone()));
        }
        let data = TableData {
            records: BTreeMap::new(),
            indexes: indexes
                .iter()
                .map(|attr| (attr.clone(), BTreeMap::new()))
                .collect(),
        };
        tables.insert(table.clone(), data);
        debug!(table = %table, indexes = ?indexes, "Table storage created");
        Ok(())
    }

    fn drop_table(&self, table: &TableRef) -> Result<()> {
        self.write()?.remove(table);
        Ok(())
    }

    fn create_index(&self, table: &TableRef, attribute: &str) -> Result<()> {
        let mut tables = self.write()?;
        let data = table_mut(&mut tables, table)?;
        if data.indexes.contains_key(attribute) {
            return Ok(());
        }
        let mut index: BTreeMap<IndexKey, BTreeSet<HashKey>> = BTreeMap::new();
        for (key, record) in &data.records {
            if let Some(value) = record.get(attribute) {
                index.entry(index_key(value)).or_default().insert(key.clone());
            }
        }
        data.indexes.insert(attribute.to_string(), index);
        Ok(())
    }

    fn drop_attribute(&self, table: &TableRef, attribute: &str) -> Result<usize> {
        let mut tables = self.write()?;
        let data = table_mut(&mut tables, table)?;
        data.indexes.remove(attribute);
        let mut stripped = 0;
        for record in data.records.values_mut() {
            if record.remove(attribute).is_some() {
                stripped += 1;
            }
        }
        Ok(stripped)
    }

    fn get(&self, table_ref: &TableRef, key: &HashKey) -> Result<Option<Record>> {
        let tables = self.read()?;
        Ok(table(&tables, table_ref)?.records.get(key).cloned())
    }

    fn scan(&self, table_ref: &TableRef) -> Result<Vec<(HashKey, Record)>> {
        let tables = self.read()?;
        Ok(table(&tables, table_ref)?
            .records
            .iter()
            .map(|(k, r)| (k.clone(), r.clone()))
            .collect())
    }

    fn index_lookup(
        &self,
        table_ref: &TableRef,
        attribute: &str,
        value: &Value,
    ) -> Result<Option<Vec<(HashKey, Record)>>> {
        let tables = self.read()?;
        let data = table(&tables, table_ref)?;
        let Some(index) = data.indexes.get(attribute) else {
            return Ok(None);
        };
        let rows = index
            .get(&index_key(value))
            .map(|keys| {
                keys.iter()
                    .filter_map(|k| data.records.get(k).map(|r| (k.clone(), r.clone())))
                    .collect()
            })
            .unwrap_or_default();
        Ok(Some(rows))
    }

    fn insert_if_absent(&self, table_ref: &TableRef, key: HashKey, record: Record) -> Result<bool> {
        let mut tables = self.write()?;
        let data = table_mut(&mut tables, table_ref)?;
        if data.records.contains_key(&key) {
            return Ok(false);
        }
        data.put(key, record);
        Ok(true)
    }

    fn update_with(
        &self,
        table_ref: &TableRef,
        key: &HashKey,
        apply: &mut dyn FnMut(&mut Record),
    ) -> Result<Option<Record>> {
        let mut tables = self.write()?;
        let data = table_mut(&mut tables, table_ref)?;
        let Some(mut record) = data.records.get(key).cloned() else {
            return Ok(None);
        };
        apply(&mut record);
        data.put(key.clone(), record.clone());
        Ok(Some(record))
    }

    fn upsert_with(
        &self,
        table_ref: &TableRef,
        key: HashKey,
        build: &mut dyn FnMut(Option<&Record>) -> Record,
    ) -> Result<UpsertOutcome> {
        let mut tables = self.write()?;
        let data = table_mut(&mut tables, table_ref)?;
        let existing = data.records.get(&key);
        let outcome = if existing.is_some() {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Inserted
        };
        let record = build(existing);
        data.put(key, record);
        Ok(outcome)
    }

    fn delete(&self, table_ref: &TableRef, key: &HashKey) -> Result<Option<Record>> {
        let mut tables = self.write()?;
        let data = table_mut(&mut tables, table_ref)?;
        let removed = data.records.remove(key);
        if let Some(record) = &removed {
            data.unindex_record(key, record);
        }
        Ok(removed)
    }

    fn count(&self, table_ref: &TableRef) -> Result<usize> {
        let tables = self.read()?;
        Ok(table(&tables, table_ref)?.records.len())
    }

    fn last_updated(&self, table_ref: &TableRef) -> Result<Option<Timestamp>> {
        let tables = self.read()?;
        Ok(table(&tables, table_ref)?
            .records
            .values()
            .filter_map(|r| r.get(UPDATED_TIME_ATTRIBUTE).and_then(Value::as_i64))
            .max()
            .map(Timestamp::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use test_case::test_case;

    fn dog() -> TableRef {
        TableRef::new("dev", "dog")
    }

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn store() -> MemoryStore {
        let store = MemoryStore::new();
        store.create_table(&dog(), &["owner_id".to_string()]).unwrap();
        store
    }

    #[test]
    fn insert_if_absent_rejects_duplicates() {
        let store = store();
        let key = HashKey::Int(212);
        assert!(store.insert_if_absent(&dog(), key.clone(), record(json!({"id": 212}))).unwrap());
        assert!(!store.insert_if_absent(&dog(), key, record(json!({"id": 212, "x": 1}))).unwrap());
        assert_eq!(store.count(&dog()).unwrap(), 1);
    }

    #[test]
    fn representation_sensitive_keys() {
        let store = store();
        for (key, id) in [
            (HashKey::Int(0), json!(0)),
            (HashKey::from("011"), json!("011")),
            (HashKey::from("00011"), json!("00011")),
        ] {
            assert!(store.insert_if_absent(&dog(), key, record(json!({"id": id}))).unwrap());
        }
        assert_eq!(store.count(&dog()).unwrap(), 3);
        assert!(store.get(&dog(), &HashKey::Int(11)).unwrap().is_none());
        assert_eq!(
            store.get(&dog(), &HashKey::from("011")).unwrap().unwrap()["id"],
            json!("011")
        );
    }

    #[test]
    fn index_follows_updates_and_deletes() {
        let store = store();
        store
            .insert_if_absent(&dog(), HashKey::Int(1), record(json!({"id": 1, "owner_id": 7})))
            .unwrap();
        store
            .insert_if_absent(&dog(), HashKey::Int(2), record(json!({"id": 2, "owner_id": 7})))
            .unwrap();

        let hits = store.index_lookup(&dog(), "owner_id", &json!(7)).unwrap().unwrap();
        assert_eq!(hits.len(), 2);

        store
            .update_with(&dog(), &HashKey::Int(1), &mut |r| {
                r.insert("owner_id".into(), json!(8));
            })
            .unwrap();
        store.delete(&dog(), &HashKey::Int(2)).unwrap();

        assert!(store.index_lookup(&dog(), "owner_id", &json!(7)).unwrap().unwrap().is_empty());
        assert_eq!(
            store.index_lookup(&dog(), "owner_id", &json!(8)).unwrap().unwrap()[0].0,
            HashKey::Int(1)
        );
        assert!(store.index_lookup(&dog(), "name", &json!("x")).unwrap().is_none());
    }

    #[test_case(json!(7), json!(7), 1 ; "same integer")]
    #[test_case(json!(7), json!("7"), 0 ; "integer against text")]
    #[test_case(json!(7), json!(7.0), 0 ; "integer against float")]
    #[test_case(json!("011"), json!("011"), 1 ; "same text")]
    #[test_case(json!("011"), json!("11"), 0 ; "leading zero")]
    #[test_case(json!([1, 2]), json!([1, 2]), 1 ; "same array")]
    fn index_lookups_match_exact_values(stored: Value, lookup: Value, hits: usize) {
        let store = store();
        store
            .insert_if_absent(&dog(), HashKey::Int(1), record(json!({"id": 1, "owner_id": stored})))
            .unwrap();
        let rows = store.index_lookup(&dog(), "owner_id", &lookup).unwrap().unwrap();
        assert_eq!(rows.len(), hits);
    }

    #[test]
    fn update_missing_key_is_none() {
        let store = store();
        let updated = store
            .update_with(&dog(), &HashKey::Int(99), &mut |_| {})
            .unwrap();
        assert!(updated.is_none());
    }

    #[test]
    fn upsert_reports_outcome() {
        let store = store();
        let mut build = |existing: Option<&Record>| {
            let mut r = existing.cloned().unwrap_or_default();
            r.insert("n".into(), json!(r.len()));
            r
        };
        assert_eq!(
            store.upsert_with(&dog(), HashKey::Int(1), &mut build).unwrap(),
            UpsertOutcome::Inserted
        );
        assert_eq!(
            store.upsert_with(&dog(), HashKey::Int(1), &mut build).unwrap(),
            UpsertOutcome::Updated
        );
        assert_eq!(store.count(&dog()).unwrap(), 1);
    }

    #[test]
    fn drop_attribute_strips_records() {
        let store = store();
        store
            .insert_if_absent(&dog(), HashKey::Int(1), record(json!({"id": 1, "owner_id": 3})))
            .unwrap();
        assert_eq!(store.drop_attribute(&dog(), "owner_id").unwrap(), 1);
        assert!(store.get(&dog(), &HashKey::Int(1)).unwrap().unwrap().get("owner_id").is_none());
        assert!(store.index_lookup(&dog(), "owner_id", &json!(3)).unwrap().is_none());
    }

    #[test]
    fn missing_table() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.scan(&dog()),
            Err(StoreError::TableNotFound(_))
        ));
    }

    proptest! {
        #[test]
        fn scan_is_in_key_order(keys in proptest::collection::btree_set(any::<i64>(), 0..20)) {
            let store = store();
            for k in keys.iter().rev() {
                store.insert_if_absent(&dog(), HashKey::Int(*k), Record::new()).unwrap();
            }
            let scanned: Vec<HashKey> = store.scan(&dog()).unwrap().into_iter().map(|(k, _)| k).collect();
            let expected: Vec<HashKey> = keys.into_iter().map(HashKey::Int).collect();
            prop_assert_eq!(scanned, expected);
        }
    }
}
