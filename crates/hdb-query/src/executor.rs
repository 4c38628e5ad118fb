//! Query execution.
//!
//! Execution model:
//! 1. Fetch the first table through the cheapest access path (hash-key
//!    lookup, secondary-index lookup, or a full scan), then nested-loop join
//!    every other table.
//! 2. Filter with `WHERE`. The access path only narrows the candidates; the
//!    full predicate is always re-evaluated.
//! 3. Group and aggregate, then filter with `HAVING`.
//! 4. Project, de-duplicate (`DISTINCT`), sort, then apply `OFFSET`/`LIMIT`.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

use hdb_catalog::{Catalog, ComputedMode, TableDef};
use hdb_rbac::ReadMask;
use hdb_store::RecordStore;
use hdb_types::{HashKey, Record, TableRef};
use serde_json::{Number, Value};
use tracing::{debug, trace};

use crate::error::Result;
use crate::expr::{Aggregate, BinaryOp, ColumnRef, EmptyScope, Expr, RecordScope, Scope};
use crate::formula::ComputedRegistry;
use crate::nosql::{
    ALL_ATTRIBUTES, Condition, SearchByConditions, SearchByHash, SearchByValue, sort_records,
};
use crate::planner::{Source, bind_column, sources};
use crate::sql::{Insert, JoinKind, OrderItem, Query, QueryBody, Select, SelectItem};
use crate::value::total_cmp;

/// One joined row: a record per source, `None` for an unmatched left join.
type Row = Vec<Option<Record>>;

// ============================================================================
// Scopes
// ============================================================================

struct RowScope<'a> {
    sources: &'a [Source],
    row: &'a [Option<Record>],
}

impl Scope for RowScope<'_> {
    fn column(&self, column: &ColumnRef) -> Value {
        let index = bind_column(self.sources, column).or_else(|| {
            // Bare columns not declared anywhere bind to the first record
            // holding them.
            if column.qualifier.is_some() {
                return None;
            }
            self.row
                .iter()
                .position(|r| r.as_ref().is_some_and(|r| r.contains_key(&column.name)))
        });
        index
            .and_then(|i| self.row.get(i))
            .and_then(Option::as_ref)
            .and_then(|record| record.get(&column.name))
            .cloned()
            .unwrap_or(Value::Null)
    }
}

struct GroupScope<'a> {
    sources: &'a [Source],
    rows: &'a [Row],
}

impl Scope for GroupScope<'_> {
    fn column(&self, column: &ColumnRef) -> Value {
        self.rows.first().map_or(Value::Null, |row| {
            RowScope {
                sources: self.sources,
                row,
            }
            .column(column)
        })
    }

    fn aggregate(&self, aggregate: &Aggregate) -> Result<Value> {
        let values = match &aggregate.arg {
            Some(arg) => self
                .rows
                .iter()
                .map(|row| {
                    arg.evaluate(&RowScope {
                        sources: self.sources,
                        row,
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };
        Ok(aggregate.fold(values, self.rows.len()))
    }
}

/// Resolves bare names against the projected output first, so `HAVING`
/// and `ORDER BY` can use select aliases.
struct OutputScope<'a> {
    output: &'a Record,
    inner: &'a dyn Scope,
}

impl Scope for OutputScope<'_> {
    fn column(&self, column: &ColumnRef) -> Value {
        if column.qualifier.is_none() {
            if let Some(value) = self.output.get(&column.name) {
                return value.clone();
            }
        }
        self.inner.column(column)
    }

    fn aggregate(&self, aggregate: &Aggregate) -> Result<Value> {
        self.inner.aggregate(aggregate)
    }
}

// ============================================================================
// Projection
// ============================================================================

enum Projected {
    /// An attribute expanded from `*`; omitted when the record lacks it.
    Wildcard { source: usize, attribute: String },
    Expr(Expr),
}

struct OutputColumn {
    label: String,
    value: Projected,
}

fn unique_label(used: &mut HashSet<String>, label: &str) -> String {
    if used.insert(label.to_string()) {
        return label.to_string();
    }
    let mut suffix = 1usize;
    loop {
        let candidate = format!("{label}{suffix}");
        if used.insert(candidate.clone()) {
            return candidate;
        }
        suffix += 1;
    }
}

fn projection_plan(select: &Select, sources: &[Source], mask: &ReadMask) -> Vec<OutputColumn> {
    let mut used = HashSet::new();
    let mut columns = Vec::new();
    let expand = |index: usize, columns: &mut Vec<OutputColumn>, used: &mut HashSet<String>| {
        let source = &sources[index];
        let Some(def) = &source.def else { return };
        for attribute in def.attribute_names() {
            if mask.allows(&source.table, attribute) {
                columns.push(OutputColumn {
                    label: unique_label(used, attribute),
                    value: Projected::Wildcard {
                        source: index,
                        attribute: attribute.to_string(),
                    },
                });
            }
        }
    };
    for item in &select.projection {
        match item {
            SelectItem::Wildcard => {
                for index in 0..sources.len() {
                    expand(index, &mut columns, &mut used);
                }
            }
            SelectItem::QualifiedWildcard(qualifier) => {
                let column = ColumnRef::qualified(qualifier.as_str(), ALL_ATTRIBUTES);
                if let Some(index) = bind_column(sources, &column) {
                    expand(index, &mut columns, &mut used);
                }
            }
            SelectItem::Expr { expr, label, .. } => columns.push(OutputColumn {
                label: unique_label(&mut used, label),
                value: Projected::Expr(expr.clone()),
            }),
        }
    }
    columns
}

fn project(columns: &[OutputColumn], scope: &dyn Scope, first_row: Option<&Row>) -> Result<Record> {
    let mut output = Record::new();
    for column in columns {
        match &column.value {
            Projected::Wildcard { source, attribute } => {
                let value = first_row
                    .and_then(|row| row.get(*source))
                    .and_then(Option::as_ref)
                    .and_then(|record| record.get(attribute));
                if let Some(value) = value {
                    output.insert(column.label.clone(), value.clone());
                }
            }
            Projected::Expr(expr) => {
                output.insert(column.label.clone(), expr.evaluate(scope)?);
            }
        }
    }
    Ok(output)
}

fn order_keys(order_by: &[OrderItem], scope: &dyn Scope) -> Result<Vec<Value>> {
    order_by.iter().map(|item| item.expr.evaluate(scope)).collect()
}

fn sort_by_keys(rows: &mut [(Record, Vec<Value>)], order_by: &[OrderItem]) {
    if order_by.is_empty() {
        return;
    }
    rows.sort_by(|(_, a), (_, b)| {
        for ((x, y), item) in a.iter().zip(b).zip(order_by) {
            let ordering = total_cmp(x, y);
            let ordering = if item.descending {
                ordering.reverse()
            } else {
                ordering
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

fn dedupe(records: &mut Vec<Record>) {
    let mut seen = HashSet::new();
    records.retain(|record| seen.insert(Value::Object(record.clone()).to_string()));
}

fn paginate<T>(items: Vec<T>, offset: usize, limit: Option<usize>) -> Vec<T> {
    items
        .into_iter()
        .skip(offset)
        .take(limit.unwrap_or(usize::MAX))
        .collect()
}

// ============================================================================
// Access paths
// ============================================================================

enum AccessPath {
    Keys(Vec<Value>),
    Index { attribute: String, values: Vec<Value> },
    Scan,
}

/// `column = literal` or `column IN (literals)`.
fn equality(expr: &Expr) -> Option<(&ColumnRef, Vec<Value>)> {
    match expr {
        Expr::Binary {
            left,
            op: BinaryOp::Eq,
            right,
        } => match (left.as_ref(), right.as_ref()) {
            (Expr::Column(column), Expr::Literal(value))
            | (Expr::Literal(value), Expr::Column(column)) => Some((column, vec![value.clone()])),
            _ => None,
        },
        Expr::InList {
            expr,
            list,
            negated: false,
        } => {
            let Expr::Column(column) = expr.as_ref() else {
                return None;
            };
            let values = list
                .iter()
                .map(|e| e.as_literal().cloned())
                .collect::<Option<Vec<_>>>()?;
            Some((column, values))
        }
        _ => None,
    }
}

fn choose_path<'a>(
    def: &TableDef,
    candidates: impl IntoIterator<Item = (&'a str, Vec<Value>)>,
) -> AccessPath {
    let mut index = None;
    for (attribute, values) in candidates {
        if attribute == def.hash_attribute {
            return AccessPath::Keys(values);
        }
        let indexed = def.attribute(attribute).is_some_and(|a| a.indexed);
        if indexed && index.is_none() {
            index = Some(AccessPath::Index {
                attribute: attribute.to_string(),
                values,
            });
        }
    }
    index.unwrap_or(AccessPath::Scan)
}

/// Values stored under other index keys that still compare equal.
fn equivalent_values(value: &Value) -> Vec<Value> {
    let mut out = vec![value.clone()];
    if let Ok(key) = HashKey::from_json(value) {
        if let Some(alternative) = key.loose_alternative() {
            out.push(alternative.to_json());
        }
    }
    if let Value::Number(n) = value {
        match n.as_i64() {
            Some(i) => out.extend(Number::from_f64(i as f64).map(Value::Number)),
            None => {
                let f = n.as_f64().unwrap_or_default();
                if f.fract() == 0.0 && f.abs() < 9.0e15 {
                    out.push(Value::from(f as i64));
                }
            }
        }
    }
    out
}

// ============================================================================
// Executor
// ============================================================================

/// Runs queries against the catalog and a record store.
pub struct Executor<'a> {
    pub(crate) catalog: &'a Catalog,
    pub(crate) store: &'a dyn RecordStore,
    pub(crate) computed: &'a ComputedRegistry,
    pub(crate) default_database: Option<&'a str>,
}

impl Executor<'_> {
    // ========================================================================
    // Fetching
    // ========================================================================

    /// Records under the given hash values, in request order, each key once.
    fn lookup_keys(&self, table: &TableRef, values: &[Value]) -> Result<Vec<(HashKey, Record)>> {
        let mut seen: Vec<HashKey> = Vec::new();
        let mut out = Vec::new();
        for value in values {
            let Ok(key) = HashKey::from_json(value) else {
                continue;
            };
            let alternative = key.loose_alternative();
            for key in std::iter::once(key).chain(alternative) {
                if seen.contains(&key) {
                    continue;
                }
                if let Some(record) = self.store.get(table, &key)? {
                    out.push((key.clone(), record));
                }
                seen.push(key);
            }
        }
        Ok(out)
    }

    fn fetch(&self, def: &TableDef, path: AccessPath) -> Result<Vec<(HashKey, Record)>> {
        let table = def.table_ref();
        let records = match path {
            AccessPath::Keys(values) => {
                trace!(table = %table, keys = values.len(), "hash lookup");
                self.lookup_keys(&table, &values)?
            }
            AccessPath::Index { attribute, values } => {
                let mut found = BTreeMap::new();
                let mut indexed = true;
                for value in values.iter().flat_map(equivalent_values) {
                    match self.store.index_lookup(&table, &attribute, &value)? {
                        Some(records) => found.extend(records),
                        None => {
                            indexed = false;
                            break;
                        }
                    }
                }
                if indexed {
                    trace!(table = %table, attribute = %attribute, "index lookup");
                    found.into_iter().collect()
                } else {
                    self.store.scan(&table)?
                }
            }
            AccessPath::Scan => {
                trace!(table = %table, "full scan");
                self.store.scan(&table)?
            }
        };
        Ok(records)
    }

    /// Fetches and adds lazily computed attributes.
    fn fetch_computed(&self, def: &TableDef, path: AccessPath) -> Result<Vec<(HashKey, Record)>> {
        let mut records = self.fetch(def, path)?;
        for (_, record) in &mut records {
            self.computed.apply(def, record, ComputedMode::Lazy)?;
        }
        Ok(records)
    }

    fn sql_path(sources: &[Source], def: &TableDef, selection: Option<&Expr>) -> AccessPath {
        let Some(selection) = selection else {
            return AccessPath::Scan;
        };
        let candidates = selection
            .conjuncts()
            .into_iter()
            .filter_map(equality)
            .filter(|(column, _)| bind_column(sources, column) == Some(0))
            .map(|(column, values)| (column.name.as_str(), values));
        choose_path(def, candidates)
    }

    // ========================================================================
    // SELECT
    // ========================================================================

    /// Runs a query, returning the projected records.
    pub fn query(&self, query: &Query, mask: &ReadMask) -> Result<Vec<Record>> {
        let records = match &query.body {
            QueryBody::Select(select) => {
                let mut rows = self.select(select, &query.order_by, mask)?;
                sort_by_keys(&mut rows, &query.order_by);
                rows.into_iter().map(|(record, _)| record).collect()
            }
            body => {
                let records = self.body(body, mask)?;
                let mut rows = records
                    .into_iter()
                    .map(|record| {
                        let scope = OutputScope {
                            output: &record,
                            inner: &EmptyScope,
                        };
                        let keys = order_keys(&query.order_by, &scope)?;
                        Ok((record, keys))
                    })
                    .collect::<Result<Vec<_>>>()?;
                sort_by_keys(&mut rows, &query.order_by);
                rows.into_iter().map(|(record, _)| record).collect()
            }
        };
        Ok(paginate(records, query.offset, query.limit))
    }

    fn body(&self, body: &QueryBody, mask: &ReadMask) -> Result<Vec<Record>> {
        match body {
            QueryBody::Select(select) => Ok(self
                .select(select, &[], mask)?
                .into_iter()
                .map(|(record, _)| record)
                .collect()),
            QueryBody::Union { left, right, all } => {
                let mut records = self.body(left, mask)?;
                records.extend(self.body(right, mask)?);
                if !all {
                    dedupe(&mut records);
                }
                Ok(records)
            }
        }
    }

    /// Evaluates one `SELECT`, returning each output record with its sort
    /// keys.
    fn select(
        &self,
        select: &Select,
        order_by: &[OrderItem],
        mask: &ReadMask,
    ) -> Result<Vec<(Record, Vec<Value>)>> {
        let sources = sources(self.catalog, select, self.default_database)?;
        for source in &sources {
            source.require_def(self.catalog)?;
        }

        let rows = self.join(select, &sources)?;
        let rows = match &select.selection {
            Some(selection) => {
                let mut kept = Vec::with_capacity(rows.len());
                for row in rows {
                    if selection.matches(&RowScope {
                        sources: &sources,
                        row: &row,
                    })? {
                        kept.push(row);
                    }
                }
                kept
            }
            None => rows,
        };
        debug!(tables = sources.len(), rows = rows.len(), "rows selected");

        let columns = projection_plan(select, &sources, mask);
        let mut output = Vec::new();
        if select.is_aggregate() {
            for group in group_rows(select, &sources, rows)? {
                let scope = GroupScope {
                    sources: &sources,
                    rows: &group,
                };
                let record = project(&columns, &scope, group.first())?;
                let outer = OutputScope {
                    output: &record,
                    inner: &scope,
                };
                if let Some(having) = &select.having {
                    if !having.matches(&outer)? {
                        continue;
                    }
                }
                let keys = order_keys(order_by, &outer)?;
                output.push((record, keys));
            }
        } else {
            for row in &rows {
                let scope = RowScope {
                    sources: &sources,
                    row,
                };
                let record = project(&columns, &scope, Some(row))?;
                let keys = order_keys(
                    order_by,
                    &OutputScope {
                        output: &record,
                        inner: &scope,
                    },
                )?;
                output.push((record, keys));
            }
        }

        if select.distinct {
            let mut seen = HashSet::new();
            output.retain(|(record, _)| seen.insert(Value::Object(record.clone()).to_string()));
        }
        Ok(output)
    }

    fn join(&self, select: &Select, sources: &[Source]) -> Result<Vec<Row>> {
        let Some(first) = sources.first() else {
            // Table-less select: one empty row.
            return Ok(vec![Vec::new()]);
        };
        let def = first.require_def(self.catalog)?;
        let path = Self::sql_path(sources, def, select.selection.as_ref());
        let mut rows: Vec<Row> = self
            .fetch_computed(def, path)?
            .into_iter()
            .map(|(_, record)| vec![Some(record)])
            .collect();

        for (offset, join) in select.joins.iter().enumerate() {
            let index = offset + 1;
            let def = sources[index].require_def(self.catalog)?;
            let right: Vec<Record> = self
                .fetch_computed(def, AccessPath::Scan)?
                .into_iter()
                .map(|(_, record)| record)
                .collect();
            let bound = &sources[..=index];

            let mut joined = Vec::new();
            for row in rows {
                let mut matched = false;
                for candidate in &right {
                    let mut next = row.clone();
                    next.push(Some(candidate.clone()));
                    let keep = match &join.on {
                        Some(on) => on.matches(&RowScope {
                            sources: bound,
                            row: &next,
                        })?,
                        None => true,
                    };
                    if keep {
                        matched = true;
                        joined.push(next);
                    }
                }
                if !matched && join.kind == JoinKind::Left {
                    let mut padded = row;
                    padded.push(None);
                    joined.push(padded);
                }
            }
            rows = joined;
        }
        Ok(rows)
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Stored records of `table` matching `selection`, for `UPDATE` and
    /// `DELETE`. Lazily computed attributes are visible to the predicate but
    /// not included in the returned records.
    pub fn matching(&self, table: &TableRef, selection: Option<&Expr>) -> Result<Vec<(HashKey, Record)>> {
        let def = self.catalog.table(table)?;
        let sources = [Source {
            qualifier: table.table.clone(),
            table: table.clone(),
            def: Some(def.clone()),
        }];
        let path = Self::sql_path(&sources, &def, selection);
        let records = self.fetch(&def, path)?;
        let Some(selection) = selection else {
            return Ok(records);
        };
        let mut matched = Vec::new();
        for (key, record) in records {
            let mut visible = record.clone();
            self.computed.apply(&def, &mut visible, ComputedMode::Lazy)?;
            let row = [Some(visible)];
            if selection.matches(&RowScope {
                sources: &sources,
                row: &row,
            })? {
                matched.push((key, record));
            }
        }
        Ok(matched)
    }

    /// Evaluates the `VALUES` rows of an `INSERT` into records.
    pub fn insert_records(insert: &Insert) -> Result<Vec<Record>> {
        insert
            .rows
            .iter()
            .map(|row| {
                insert
                    .columns
                    .iter()
                    .zip(row)
                    .map(|(column, expr)| Ok((column.clone(), expr.evaluate(&EmptyScope)?)))
                    .collect::<Result<Record>>()
            })
            .collect()
    }

    /// Evaluates `SET` assignments against the current record, returning the
    /// changed attributes.
    pub fn assignments(record: &Record, assignments: &[(String, Expr)]) -> Result<Record> {
        let scope = RecordScope::new(record);
        assignments
            .iter()
            .map(|(attribute, expr)| Ok((attribute.clone(), expr.evaluate(&scope)?)))
            .collect()
    }

    // ========================================================================
    // NoSQL
    // ========================================================================

    fn condition_path(def: &TableDef, condition: &Condition) -> AccessPath {
        choose_path(
            def,
            condition
                .required_equalities()
                .into_iter()
                .map(|(attribute, value)| (attribute, vec![value.clone()])),
        )
    }

    fn search(&self, def: &TableDef, condition: &Condition) -> Result<Vec<Record>> {
        let records = self.fetch_computed(def, Self::condition_path(def, condition))?;
        Ok(records
            .into_iter()
            .map(|(_, record)| record)
            .filter(|record| condition.matches(record))
            .collect())
    }

    pub fn search_by_hash(&self, table: &TableRef, search: &SearchByHash, mask: &ReadMask) -> Result<Vec<Record>> {
        let def = self.catalog.table(table)?;
        let records = self.fetch_computed(&def, AccessPath::Keys(search.hash_values.clone()))?;
        Ok(records
            .into_iter()
            .map(|(_, record)| select_attributes(table, &record, &search.get_attributes, mask))
            .collect())
    }

    pub fn search_by_value(&self, table: &TableRef, search: &SearchByValue, mask: &ReadMask) -> Result<Vec<Record>> {
        let def = self.catalog.table(table)?;
        let mut records = self.search(&def, &search.condition())?;
        if search.reverse {
            records.reverse();
        }
        Ok(paginate(records, search.offset, search.limit)
            .iter()
            .map(|record| select_attributes(table, record, &search.get_attributes, mask))
            .collect())
    }

    pub fn search_by_conditions(
        &self,
        table: &TableRef,
        search: &SearchByConditions,
        mask: &ReadMask,
    ) -> Result<Vec<Record>> {
        let def = self.catalog.table(table)?;
        let root = search.root();
        root.validate()?;
        let mut records = self.search(&def, &root)?;
        if search.reverse {
            records.reverse();
        }
        sort_records(&mut records, &search.sort_keys());
        Ok(paginate(records, search.offset, search.limit)
            .iter()
            .map(|record| select_attributes(table, record, &search.get_attributes, mask))
            .collect())
    }
}

/// Applies a NoSQL `get_attributes` list. `*` keeps every readable
/// attribute; named attributes missing from the record come back as null.
fn select_attributes(table: &TableRef, record: &Record, get_attributes: &[String], mask: &ReadMask) -> Record {
    if get_attributes.iter().any(|a| a == ALL_ATTRIBUTES) {
        return record
            .iter()
            .filter(|(attribute, _)| mask.allows(table, attribute))
            .map(|(attribute, value)| (attribute.clone(), value.clone()))
            .collect();
    }
    get_attributes
        .iter()
        .map(|attribute| {
            (
                attribute.clone(),
                record.get(attribute).cloned().unwrap_or(Value::Null),
            )
        })
        .collect()
}

/// Splits rows into groups in first-seen order. Without `GROUP BY` every row
/// falls into one group, which exists even when there are no rows.
fn group_rows(select: &Select, sources: &[Source], rows: Vec<Row>) -> Result<Vec<Vec<Row>>> {
    if select.group_by.is_empty() {
        return Ok(vec![rows]);
    }
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<Row>> = HashMap::new();
    for row in rows {
        let key = select
            .group_by
            .iter()
            .map(|expr| expr.evaluate(&RowScope { sources, row: &row }))
            .collect::<Result<Vec<_>>>()?;
        let key = Value::Array(key).to_string();
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(row);
    }
    Ok(order
        .into_iter()
        .filter_map(|key| groups.remove(&key))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::{Statement, parse_statement};
    use hdb_catalog::AttributeDef;
    use hdb_store::MemoryStore;
    use serde_json::json;

    struct Fixture {
        catalog: Catalog,
        store: MemoryStore,
        computed: ComputedRegistry,
    }

    impl Fixture {
        fn new() -> Self {
            let catalog = Catalog::new();
            let store = MemoryStore::new();
            let dog = TableRef::new("dev", "dog");
            catalog
                .create_table(&dog, "id", vec![AttributeDef::indexed("breed")])
                .unwrap();
            store.create_table(&dog, &["breed".to_string()]).unwrap();
            let rows = [
                json!({"id": 1, "name": "Penny", "breed": "Whippet", "age": 5, "owner_id": 1}),
                json!({"id": 2, "name": "Kato", "breed": "Mutt", "age": 7, "owner_id": 2}),
                json!({"id": 3, "name": "Riley", "breed": "Whippet", "age": 9, "owner_id": 1}),
                json!({"id": "011", "name": "Gemma", "breed": "Mutt", "age": 3}),
            ];
            let owner = TableRef::new("other", "owner");
            catalog.create_table(&owner, "id", Vec::new()).unwrap();
            store.create_table(&owner, &[]).unwrap();
            let fixture = Self {
                catalog,
                store,
                computed: ComputedRegistry::new(),
            };
            for row in rows {
                fixture.put(&dog, row);
            }
            fixture.put(&owner, json!({"id": 1, "name": "Kyle"}));
            fixture.put(&owner, json!({"id": 2, "name": "David"}));
            fixture
        }

        fn put(&self, table: &TableRef, value: Value) {
            let record = value.as_object().cloned().unwrap();
            let key = HashKey::from_json(&record["id"]).unwrap();
            self.catalog
                .ensure_attributes(table, record.keys().map(String::as_str))
                .unwrap();
            self.store.insert_if_absent(table, key, record).unwrap();
        }

        fn executor(&self) -> Executor<'_> {
            Executor {
                catalog: &self.catalog,
                store: &self.store,
                computed: &self.computed,
                default_database: Some("dev"),
            }
        }

        fn sql(&self, sql: &str) -> Vec<Value> {
            let Statement::Query(query) = parse_statement(sql).unwrap() else {
                panic!("expected query");
            };
            self.executor()
                .query(&query, &ReadMask::unrestricted())
                .unwrap()
                .into_iter()
                .map(Value::Object)
                .collect()
        }
    }

    #[test]
    fn hash_lookup_preserves_representation() {
        let fx = Fixture::new();
        assert_eq!(fx.sql("SELECT name FROM dog WHERE id = '011'"), vec![json!({"name": "Gemma"})]);
        assert!(fx.sql("SELECT name FROM dog WHERE id = 011").is_empty());
        assert_eq!(fx.sql("SELECT name FROM dog WHERE id = '1'"), vec![json!({"name": "Penny"})]);
    }

    #[test]
    fn index_lookup_and_scan_agree() {
        let fx = Fixture::new();
        let indexed = fx.sql("SELECT id FROM dog WHERE breed = 'Whippet' ORDER BY id");
        let scanned = fx.sql("SELECT id FROM dog WHERE UPPER(breed) = 'WHIPPET' ORDER BY id");
        assert_eq!(indexed, vec![json!({"id": 1}), json!({"id": 3})]);
        assert_eq!(indexed, scanned);
    }

    #[test]
    fn cross_database_join_suffixes_colliding_labels() {
        let fx = Fixture::new();
        let rows = fx.sql(
            "SELECT d.id, o.id FROM dev.dog d JOIN other.owner o ON d.owner_id = o.id ORDER BY d.id",
        );
        assert_eq!(
            rows,
            vec![
                json!({"id": 1, "id1": 1}),
                json!({"id": 2, "id1": 2}),
                json!({"id": 3, "id1": 1}),
            ]
        );
    }

    #[test]
    fn left_join_pads_missing_rows() {
        let fx = Fixture::new();
        let rows = fx.sql(
            "SELECT d.name, o.name AS owner FROM dev.dog d LEFT JOIN other.owner o ON d.owner_id = o.id WHERE d.age < 4",
        );
        assert_eq!(rows, vec![json!({"name": "Gemma", "owner": null})]);
    }

    #[test]
    fn alias_replaces_attribute_name() {
        let fx = Fixture::new();
        let rows = fx.sql("SELECT name AS dname FROM dog WHERE id = 2");
        assert_eq!(rows, vec![json!({"dname": "Kato"})]);
    }

    #[test]
    fn group_by_having_and_order_by_alias() {
        let fx = Fixture::new();
        let rows = fx.sql(
            "SELECT breed, COUNT(*) AS total, MAX(age) AS oldest FROM dog GROUP BY breed HAVING total > 1 ORDER BY oldest DESC",
        );
        assert_eq!(
            rows,
            vec![
                json!({"breed": "Whippet", "total": 2, "oldest": 9}),
                json!({"breed": "Mutt", "total": 2, "oldest": 7}),
            ]
        );
        let empty = fx.sql("SELECT COUNT(*) AS c FROM dog WHERE age > 100");
        assert_eq!(empty, vec![json!({"c": 0})]);
    }

    #[test]
    fn limit_and_offset_apply_after_sort() {
        let fx = Fixture::new();
        let rows = fx.sql("SELECT name FROM dog ORDER BY age DESC LIMIT 2 OFFSET 1");
        assert_eq!(rows, vec![json!({"name": "Kato"}), json!({"name": "Penny"})]);
    }

    #[test]
    fn distinct_and_union() {
        let fx = Fixture::new();
        assert_eq!(fx.sql("SELECT DISTINCT breed FROM dog ORDER BY breed").len(), 2);
        let union = fx.sql("SELECT name FROM dev.dog UNION SELECT name FROM other.owner ORDER BY name");
        assert_eq!(union.len(), 6);
        assert_eq!(union[0], json!({"name": "David"}));
        let all = fx.sql("SELECT breed FROM dog UNION ALL SELECT breed FROM dog");
        assert_eq!(all.len(), 8);
    }

    #[test]
    fn wildcard_respects_read_mask() {
        let fx = Fixture::new();
        let mut mask = ReadMask::unrestricted();
        mask.restrict(
            TableRef::new("dev", "dog"),
            ["id", "name"].into_iter().map(String::from).collect(),
        );
        let Statement::Query(query) = parse_statement("SELECT * FROM dog WHERE id = 1").unwrap() else {
            panic!("expected query");
        };
        let rows = fx.executor().query(&query, &mask).unwrap();
        assert_eq!(Value::Object(rows[0].clone()), json!({"id": 1, "name": "Penny"}));
    }

    #[test]
    fn table_less_select_evaluates_once() {
        let fx = Fixture::new();
        let rows = fx.sql("SELECT UPPER('a') AS up");
        assert_eq!(rows, vec![json!({"up": "A"})]);
    }

    #[test]
    fn missing_table_reports_catalog_error() {
        let fx = Fixture::new();
        let Statement::Query(query) = parse_statement("SELECT * FROM dev.cat").unwrap() else {
            panic!("expected query");
        };
        let err = fx.executor().query(&query, &ReadMask::unrestricted()).unwrap_err();
        assert_eq!(err.to_string(), "Table 'dev.cat' does not exist");
    }

    #[test]
    fn matching_and_assignments() {
        let fx = Fixture::new();
        let Statement::Update(update) = parse_statement("UPDATE dog SET age = age + 1 WHERE breed = 'Mutt'").unwrap() else {
            panic!("expected update");
        };
        let matched = fx
            .executor()
            .matching(&TableRef::new("dev", "dog"), update.selection.as_ref())
            .unwrap();
        assert_eq!(matched.len(), 2);
        let changes = Executor::assignments(&matched[0].1, &update.assignments).unwrap();
        assert_eq!(changes["age"], json!(8));
    }

    #[test]
    fn insert_values_become_records() {
        let Statement::Insert(insert) =
            parse_statement("INSERT INTO dev.dog (id, name, age) VALUES (9, 'Zoe', 1 + 1)").unwrap()
        else {
            panic!("expected insert");
        };
        let records = Executor::insert_records(&insert).unwrap();
        assert_eq!(Value::Object(records[0].clone()), json!({"id": 9, "name": "Zoe", "age": 2}));
    }

    #[test]
    fn nosql_searches() {
        let fx = Fixture::new();
        let dog = TableRef::new("dev", "dog");
        let mask = ReadMask::unrestricted();
        let by_hash: SearchByHash = serde_json::from_value(json!({
            "hash_values": ["011", 3, 42],
            "get_attributes": ["name", "missing"]
        }))
        .unwrap();
        let rows = fx.executor().search_by_hash(&dog, &by_hash, &mask).unwrap();
        assert_eq!(
            rows.into_iter().map(Value::Object).collect::<Vec<_>>(),
            vec![json!({"name": "Gemma", "missing": null}), json!({"name": "Riley", "missing": null})]
        );

        let by_value: SearchByValue = serde_json::from_value(json!({
            "search_attribute": "name",
            "search_value": "*e*",
            "get_attributes": ["id"],
            "reverse": true,
            "limit": 2
        }))
        .unwrap();
        let rows = fx.executor().search_by_value(&dog, &by_value, &mask).unwrap();
        assert_eq!(
            rows.into_iter().map(Value::Object).collect::<Vec<_>>(),
            vec![json!({"id": "011"}), json!({"id": 3})]
        );

        let by_conditions: SearchByConditions = serde_json::from_value(json!({
            "operator": "and",
            "get_attributes": ["name"],
            "sort": {"attribute": "age", "descending": true},
            "conditions": [
                {"search_attribute": "breed", "search_type": "equals", "search_value": "Whippet"},
                {"search_attribute": "age", "search_type": "greater_than_equal", "search_value": 5}
            ]
        }))
        .unwrap();
        let rows = fx
            .executor()
            .search_by_conditions(&dog, &by_conditions, &mask)
            .unwrap();
        assert_eq!(
            rows.into_iter().map(Value::Object).collect::<Vec<_>>(),
            vec![json!({"name": "Riley"}), json!({"name": "Penny"})]
        );
    }
}
