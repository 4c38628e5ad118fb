//! Query planning: table resolution, column binding and access requests.
//!
//! Planning runs before any record is read. It resolves every table a
//! statement touches, binds column references to tables and emits the
//! [`AccessRequest`] the permission evaluator checks.

use hdb_catalog::{Catalog, TableDef};
use hdb_rbac::{AccessRequest, Permission, TableAccess};
use hdb_types::TableRef;

use crate::error::{QueryError, Result};
use crate::expr::{ColumnRef, Expr};
use crate::nosql::{ALL_ATTRIBUTES, Condition};
use crate::sql::{Select, SelectItem, Statement, TableName};

/// A table taking part in a query, with the name columns bind through.
#[derive(Debug, Clone)]
pub struct Source {
    pub qualifier: String,
    pub table: TableRef,
    /// `None` when the table does not exist; only planning tolerates that.
    pub def: Option<TableDef>,
}

impl Source {
    pub fn has_attribute(&self, attribute: &str) -> bool {
        self.def.as_ref().is_some_and(|def| def.has_attribute(attribute))
    }

    /// Returns the definition, or the catalog's not-found error.
    pub fn require_def(&self, catalog: &Catalog) -> Result<&TableDef> {
        match &self.def {
            Some(def) => Ok(def),
            None => Err(catalog.table(&self.table).err().map_or_else(
                || QueryError::SchemaNotDefined(self.table.to_string()),
                QueryError::from,
            )),
        }
    }
}

/// Resolves `db.table` or a bare `table` against the default database.
pub fn resolve_table(name: &TableName, default_database: Option<&str>) -> Result<TableRef> {
    match (&name.database, default_database) {
        (Some(database), _) => Ok(TableRef::new(database, &name.table)),
        (None, Some(database)) => Ok(TableRef::new(database, &name.table)),
        (None, None) => Err(QueryError::SchemaNotDefined(name.table.clone())),
    }
}

/// Resolves the tables of a `SELECT` in join order.
pub fn sources(catalog: &Catalog, select: &Select, default_database: Option<&str>) -> Result<Vec<Source>> {
    select
        .tables()
        .map(|name| {
            let table = resolve_table(name, default_database)?;
            Ok(Source {
                qualifier: name.qualifier().to_string(),
                def: catalog.table(&table).ok(),
                table,
            })
        })
        .collect()
}

/// Finds the source a column binds to.
///
/// Qualified columns bind through the alias or the table name. Bare columns
/// bind to the first table declaring the attribute.
pub fn bind_column(sources: &[Source], column: &ColumnRef) -> Option<usize> {
    match &column.qualifier {
        Some(qualifier) => sources
            .iter()
            .position(|s| s.qualifier == *qualifier)
            .or_else(|| sources.iter().position(|s| s.table.table == *qualifier)),
        None => sources.iter().position(|s| s.has_attribute(&column.name)),
    }
}

// ============================================================================
// Access requests
// ============================================================================

/// Builds the access request for a parsed statement.
pub fn access_request(
    catalog: &Catalog,
    statement: &Statement,
    default_database: Option<&str>,
) -> Result<AccessRequest> {
    let operation = statement.operation();
    let accesses = match statement {
        Statement::Query(query) => {
            let mut accesses = Vec::new();
            let selects = query.body.selects();
            let order_by: Vec<&Expr> = query.order_by.iter().map(|item| &item.expr).collect();
            for (i, select) in selects.iter().enumerate() {
                // ORDER BY binds to the first select of a union.
                let order_by: &[&Expr] = if i == 0 { &order_by } else { &[] };
                accesses.extend(select_access(catalog, select, order_by, default_database)?);
            }
            accesses
        }
        Statement::Insert(insert) => {
            let table = resolve_table(&insert.table, default_database)?;
            let mut access = TableAccess::new(table).require(Permission::Insert);
            for column in &insert.columns {
                access.add_attribute(column, Permission::Insert);
            }
            vec![access]
        }
        Statement::Update(update) => {
            let table = resolve_table(&update.table, default_database)?;
            let mut access = TableAccess::new(table).require(Permission::Update);
            for (attribute, _) in &update.assignments {
                access.add_attribute(attribute, Permission::Update);
            }
            let read = update
                .assignments
                .iter()
                .map(|(_, value)| value)
                .chain(update.selection.iter());
            add_read_columns(&mut access, read);
            vec![access]
        }
        Statement::Delete(delete) => {
            let table = resolve_table(&delete.table, default_database)?;
            let mut access = TableAccess::new(table).require(Permission::Delete);
            add_read_columns(&mut access, delete.selection.iter());
            vec![access]
        }
    };
    Ok(AccessRequest::data(operation, accesses))
}

/// Charges a read of every column an UPDATE or DELETE evaluates.
fn add_read_columns<'a>(access: &mut TableAccess, expressions: impl Iterator<Item = &'a Expr>) {
    for expr in expressions {
        for column in expr.columns() {
            access.add_attribute(&column.name, Permission::Read);
        }
    }
}

fn select_access(
    catalog: &Catalog,
    select: &Select,
    order_by: &[&Expr],
    default_database: Option<&str>,
) -> Result<Vec<TableAccess>> {
    let sources = sources(catalog, select, default_database)?;
    let mut accesses: Vec<TableAccess> = sources
        .iter()
        .map(|s| TableAccess::new(s.table.clone()).require(Permission::Read))
        .collect();

    let aliases = select.aliases();
    let mut expressions: Vec<&Expr> = Vec::new();
    for item in &select.projection {
        match item {
            SelectItem::Wildcard => {
                for access in &mut accesses {
                    access.wildcard_read = true;
                }
            }
            SelectItem::QualifiedWildcard(qualifier) => {
                let column = ColumnRef::qualified(qualifier.as_str(), "*");
                let index = bind_column(&sources, &column).ok_or_else(|| unknown_table(qualifier))?;
                accesses[index].wildcard_read = true;
            }
            SelectItem::Expr { expr, .. } => expressions.push(expr),
        }
    }
    expressions.extend(select.selection.iter());
    expressions.extend(select.joins.iter().filter_map(|join| join.on.as_ref()));
    expressions.extend(select.group_by.iter());
    expressions.extend(select.having.iter());
    expressions.extend(order_by.iter().copied());

    for expr in expressions {
        for column in expr.columns() {
            if column.qualifier.is_none() && aliases.contains(&column.name.as_str()) {
                continue;
            }
            let index = match bind_column(&sources, column) {
                Some(index) => index,
                None if column.qualifier.is_none() => 0,
                None => return Err(unknown_table(column.qualifier.as_deref().unwrap_or_default())),
            };
            accesses[index].add_attribute(&column.name, Permission::Read);
        }
    }
    Ok(accesses)
}

fn unknown_table(qualifier: &str) -> QueryError {
    QueryError::InvalidArgument(format!("unknown table or alias '{qualifier}'"))
}

/// Access needed by a NoSQL search on one table.
pub fn search_access<'a>(
    table: TableRef,
    get_attributes: &[String],
    condition_attributes: impl IntoIterator<Item = &'a str>,
) -> TableAccess {
    let mut access = TableAccess::new(table).require(Permission::Read);
    for attribute in get_attributes {
        if attribute == ALL_ATTRIBUTES {
            access.wildcard_read = true;
        } else {
            access.add_attribute(attribute, Permission::Read);
        }
    }
    for attribute in condition_attributes {
        access.add_attribute(attribute, Permission::Read);
    }
    access
}

/// Attributes referenced by a condition tree, for [`search_access`].
pub fn condition_attributes(condition: &Condition) -> Vec<&str> {
    let mut attributes = condition.attributes();
    attributes.sort_unstable();
    attributes.dedup();
    attributes
}
