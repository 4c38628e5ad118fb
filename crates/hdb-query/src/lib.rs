//! # hdb-query: Query layer for hdb
//!
//! This crate evaluates read queries and prepares SQL mutations against the
//! schema catalog and a record store.
//!
//! ## SQL Subset
//!
//! - `SELECT` with `*`, `table.*`, expressions and `AS` aliases
//! - `FROM` one table, `JOIN` (INNER, LEFT, CROSS), across databases
//! - `WHERE` with `=`, `!=`, `<`, `<=`, `>`, `>=`, `IN`, `BETWEEN`, `LIKE`,
//!   `IS [NOT] NULL`, `AND`, `OR`, `NOT`
//! - `GROUP BY` with `COUNT`, `SUM`, `AVG`, `MIN`, `MAX`; `HAVING`
//! - `ORDER BY`, `LIMIT`, `OFFSET`, `DISTINCT`, `UNION [ALL]`
//! - `INSERT ... VALUES`, `UPDATE ... SET ... WHERE`, `DELETE ... WHERE`
//! - Built-in date, string, JSON path and geospatial functions
//!
//! Not supported: subqueries, `WITH`, window functions, `CASE`.
//!
//! ## NoSQL
//!
//! `search_by_hash`, `search_by_value` and `search_by_conditions` share the
//! access paths and projection rules of SQL.
//!
//! ## Usage
//!
//! ```ignore
//! use hdb_query::QueryEngine;
//!
//! let engine = QueryEngine::new(catalog, store).with_default_database("dev");
//! let statement = engine.parse("SELECT name FROM dog WHERE id = 1")?;
//! let request = engine.access_request(&statement)?;
//! // ... authorize `request`, build the read mask ...
//! if let Statement::Query(query) = &statement {
//!     let rows = engine.query(query, &mask)?;
//! }
//! ```

mod error;
mod executor;
pub mod expr;
pub mod formula;
pub mod functions;
pub mod nosql;
pub mod planner;
pub mod sql;
pub mod value;
pub mod wildcard;

pub use error::{QueryError, Result};
pub use expr::{Expr, Scope};
pub use formula::{ComputedFn, ComputedRegistry};
pub use nosql::{Condition, SearchByConditions, SearchByHash, SearchByValue, SearchType, SortKey};
pub use sql::{Statement, parse_expression, parse_statement};

use std::sync::Arc;

use hdb_catalog::{Catalog, ComputedMode, TableDef};
use hdb_rbac::{AccessRequest, ReadMask, TableAccess};
use hdb_store::RecordStore;
use hdb_types::{HashKey, Record, TableRef};

use executor::Executor;
use sql::{Insert, Query, TableName};

/// Query engine over a catalog and a record store.
///
/// Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct QueryEngine {
    catalog: Arc<Catalog>,
    store: Arc<dyn RecordStore>,
    computed: Arc<ComputedRegistry>,
    default_database: Option<String>,
}

impl std::fmt::Debug for QueryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryEngine")
            .field("default_database", &self.default_database)
            .field("computed", &self.computed)
            .finish_non_exhaustive()
    }
}

impl QueryEngine {
    pub fn new(catalog: Arc<Catalog>, store: Arc<dyn RecordStore>) -> Self {
        Self {
            catalog,
            store,
            computed: Arc::new(ComputedRegistry::new()),
            default_database: None,
        }
    }

    /// Sets the database used for unqualified table names.
    pub fn with_default_database(mut self, database: impl Into<String>) -> Self {
        self.default_database = Some(database.into());
        self
    }

    pub fn with_computed(mut self, computed: Arc<ComputedRegistry>) -> Self {
        self.computed = computed;
        self
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn store(&self) -> &dyn RecordStore {
        self.store.as_ref()
    }

    /// Computed attribute callbacks and formulas.
    pub fn computed(&self) -> &ComputedRegistry {
        &self.computed
    }

    pub fn default_database(&self) -> Option<&str> {
        self.default_database.as_deref()
    }

    fn executor(&self) -> Executor<'_> {
        Executor {
            catalog: &self.catalog,
            store: self.store.as_ref(),
            computed: &self.computed,
            default_database: self.default_database.as_deref(),
        }
    }

    // ========================================================================
    // Planning
    // ========================================================================

    /// Parses one SQL statement.
    pub fn parse(&self, sql: &str) -> Result<Statement> {
        parse_statement(sql)
    }

    /// Resolves a table name as written in SQL.
    pub fn resolve_table(&self, name: &TableName) -> Result<TableRef> {
        planner::resolve_table(name, self.default_database())
    }

    /// What the statement needs from the caller's role.
    pub fn access_request(&self, statement: &Statement) -> Result<AccessRequest> {
        planner::access_request(&self.catalog, statement, self.default_database())
    }

    /// Access needed by a NoSQL search.
    pub fn search_access(&self, table: &TableRef, get_attributes: &[String], condition: Option<&Condition>) -> TableAccess {
        let attributes = condition.map(planner::condition_attributes).unwrap_or_default();
        planner::search_access(table.clone(), get_attributes, attributes)
    }

    /// Existing definitions of the tables a statement reads, for building
    /// the read mask.
    pub fn read_tables(&self, statement: &Statement) -> Result<Vec<TableDef>> {
        let Statement::Query(query) = statement else {
            return Ok(Vec::new());
        };
        let mut defs: Vec<TableDef> = Vec::new();
        for select in query.body.selects() {
            for source in planner::sources(&self.catalog, select, self.default_database())? {
                if let Some(def) = source.def {
                    if !defs.iter().any(|d| d.table_ref() == def.table_ref()) {
                        defs.push(def);
                    }
                }
            }
        }
        Ok(defs)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Runs a `SELECT` / `UNION` query.
    pub fn query(&self, query: &Query, mask: &ReadMask) -> Result<Vec<Record>> {
        self.executor().query(query, mask)
    }

    pub fn search_by_hash(&self, table: &TableRef, search: &SearchByHash, mask: &ReadMask) -> Result<Vec<Record>> {
        self.executor().search_by_hash(table, search, mask)
    }

    pub fn search_by_value(&self, table: &TableRef, search: &SearchByValue, mask: &ReadMask) -> Result<Vec<Record>> {
        self.executor().search_by_value(table, search, mask)
    }

    pub fn search_by_conditions(
        &self,
        table: &TableRef,
        search: &SearchByConditions,
        mask: &ReadMask,
    ) -> Result<Vec<Record>> {
        self.executor().search_by_conditions(table, search, mask)
    }

    // ========================================================================
    // Mutation support
    // ========================================================================

    /// Stored records matching an `UPDATE`/`DELETE` predicate.
    pub fn matching_records(&self, table: &TableRef, selection: Option<&Expr>) -> Result<Vec<(HashKey, Record)>> {
        self.executor().matching(table, selection)
    }

    /// Records described by an `INSERT ... VALUES` statement.
    pub fn insert_records(&self, insert: &Insert) -> Result<Vec<Record>> {
        Executor::insert_records(insert)
    }

    /// Changed attributes produced by `SET` assignments on `record`.
    pub fn assignments(&self, record: &Record, assignments: &[(String, Expr)]) -> Result<Record> {
        Executor::assignments(record, assignments)
    }

    /// Evaluates materialized computed attributes before a write.
    pub fn materialize(&self, table: &TableDef, record: &mut Record) -> Result<()> {
        self.computed.apply(table, record, ComputedMode::Materialized)
    }

    /// Evaluates lazy computed attributes on a stored record.
    pub fn compute_lazy(&self, table: &TableDef, record: &mut Record) -> Result<()> {
        self.computed.apply(table, record, ComputedMode::Lazy)
    }
}
