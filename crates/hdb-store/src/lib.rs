//! # hdb-store: Record store adapter
//!
//! The engine consumes storage through the [`RecordStore`] trait: point
//! lookups by hash key, full scans in hash order, secondary-index equality
//! lookups and per-key atomic mutations. [`MemoryStore`] is the in-process
//! implementation.
//!
//! Every mutation of a single key is atomic with respect to other mutations
//! of the same key. There are no cross-key transactions.

mod memory;

pub use memory::MemoryStore;

use hdb_types::{HashKey, Record, TableRef, Timestamp};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Table '{0}' does not exist in the record store")]
    TableNotFound(TableRef),

    #[error("Table '{0}' already exists in the record store")]
    TableExists(TableRef),

    #[error("record store lock poisoned")]
    Poisoned,
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Outcome of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Abstract record storage.
pub trait RecordStore: Send + Sync {
    /// Creates storage for a table with secondary indexes on `indexes`.
    fn create_table(&self, table: &TableRef, indexes: &[String]) -> Result<()>;

    /// Drops a table and all its records. Dropping a missing table is a no-op.
    fn drop_table(&self, table: &TableRef) -> Result<()>;

    /// Adds a secondary index, indexing existing records.
    fn create_index(&self, table: &TableRef, attribute: &str) -> Result<()>;

    /// Removes an attribute from every record and drops its index.
    fn drop_attribute(&self, table: &TableRef, attribute: &str) -> Result<usize>;

    fn get(&self, table: &TableRef, key: &HashKey) -> Result<Option<Record>>;

    /// All records in hash-key order.
    fn scan(&self, table: &TableRef) -> Result<Vec<(HashKey, Record)>>;

    /// Records whose indexed `attribute` equals `value`, in hash-key order.
    /// Returns `None` when the attribute is not indexed.
    fn index_lookup(
        &self,
        table: &TableRef,
        attribute: &str,
        value: &Value,
    ) -> Result<Option<Vec<(HashKey, Record)>>>;

    /// Inserts `record` unless `key` is already present. Returns true when
    /// the record was inserted.
    fn insert_if_absent(&self, table: &TableRef, key: HashKey, record: Record) -> Result<bool>;

    /// Applies `apply` to the record under `key`, returning the updated
    /// record, or `None` when the key is absent.
    fn update_with(
        &self,
        table: &TableRef,
        key: &HashKey,
        apply: &mut dyn FnMut(&mut Record),
    ) -> Result<Option<Record>>;

    /// Replaces or creates the record under `key` with the output of
    /// `build`, which receives the current record if any.
    fn upsert_with(
        &self,
        table: &TableRef,
        key: HashKey,
        build: &mut dyn FnMut(Option<&Record>) -> Record,
    ) -> Result<UpsertOutcome>;

    /// Removes the record under `key`, returning it.
    fn delete(&self, table: &TableRef, key: &HashKey) -> Result<Option<Record>>;

    fn count(&self, table: &TableRef) -> Result<usize>;

    /// The most recent `__updatedtime__` in the table.
    fn last_updated(&self, table: &TableRef) -> Result<Option<Timestamp>>;
}
