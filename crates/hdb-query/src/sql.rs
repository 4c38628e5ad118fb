//! SQL parsing.
//!
//! Wraps `sqlparser` and lowers its AST into the engine's statement and
//! expression types. Supported:
//! - `SELECT` with `*`, `table.*`, expressions and aliases
//! - `FROM` one table with `INNER`/`LEFT`/`CROSS` joins, across databases
//! - `WHERE`, `GROUP BY`, `HAVING`, `ORDER BY`, `LIMIT`, `OFFSET`, `DISTINCT`
//! - `UNION` / `UNION ALL`
//! - `INSERT ... VALUES`, `UPDATE ... SET ... WHERE`, `DELETE ... WHERE`
//!
//! Identifiers may be quoted with backticks or, for reserved words, with
//! brackets (`[ALL]`).

use serde_json::{Number, Value};
use sqlparser::ast::{
    self as sql, BinaryOperator, DuplicateTreatment, FunctionArg, FunctionArgExpr,
    FunctionArguments, GroupByExpr, JoinConstraint, JoinOperator, ObjectName, SetExpr, SetOperator,
    SetQuantifier, TableFactor, UnaryOperator, Value as SqlValue,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use crate::error::{QueryError, Result};
use crate::expr::{Aggregate, AggregateFunc, BinaryOp, ColumnRef, Expr, UnaryOp};

// ============================================================================
// Statement Types
// ============================================================================

/// A parsed SQL statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Query(Query),
    Insert(Insert),
    Update(Update),
    Delete(Delete),
}

impl Statement {
    /// The operation name used for authorization and audit.
    pub fn operation(&self) -> &'static str {
        match self {
            Statement::Query(_) => "select",
            Statement::Insert(_) => "insert",
            Statement::Update(_) => "update",
            Statement::Delete(_) => "delete",
        }
    }
}

/// A table reference as written: `db.table [AS alias]` or `table`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName {
    pub database: Option<String>,
    pub table: String,
    pub alias: Option<String>,
}

impl TableName {
    /// Name columns may be qualified with: the alias, else the table name.
    pub fn qualifier(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.table)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub body: QueryBody,
    pub order_by: Vec<OrderItem>,
    pub limit: Option<usize>,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryBody {
    Select(Box<Select>),
    Union {
        left: Box<QueryBody>,
        right: Box<QueryBody>,
        all: bool,
    },
}

impl QueryBody {
    /// Every `SELECT` in the body, left to right.
    pub fn selects(&self) -> Vec<&Select> {
        match self {
            QueryBody::Select(select) => vec![select],
            QueryBody::Union { left, right, .. } => {
                let mut out = left.selects();
                out.extend(right.selects());
                out
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub distinct: bool,
    pub projection: Vec<SelectItem>,
    /// `None` for table-less selects such as `SELECT NOW()`.
    pub from: Option<TableName>,
    pub joins: Vec<Join>,
    pub selection: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
}

impl Select {
    /// All tables in join order.
    pub fn tables(&self) -> impl Iterator<Item = &TableName> {
        self.from
            .iter()
            .chain(self.joins.iter().map(|j| &j.table))
    }

    /// Aliases introduced by the projection.
    pub fn aliases(&self) -> Vec<&str> {
        self.projection
            .iter()
            .filter_map(|item| match item {
                SelectItem::Expr {
                    alias: Some(alias), ..
                } => Some(alias.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Returns true when the select aggregates rows.
    pub fn is_aggregate(&self) -> bool {
        !self.group_by.is_empty()
            || self.having.is_some()
            || self.projection.iter().any(|item| match item {
                SelectItem::Expr { expr, .. } => expr.contains_aggregate(),
                _ => false,
            })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    /// `*`
    Wildcard,
    /// `alias.*`
    QualifiedWildcard(String),
    Expr {
        expr: Expr,
        alias: Option<String>,
        /// Output column name before collision suffixing.
        label: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
    Cross,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub table: TableName,
    pub kind: JoinKind,
    pub on: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderItem {
    pub expr: Expr,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Insert {
    pub table: TableName,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Expr>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub table: TableName,
    pub assignments: Vec<(String, Expr)>,
    pub selection: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delete {
    pub table: TableName,
    pub selection: Option<Expr>,
}

// ============================================================================
// Parser
// ============================================================================

/// Parses one SQL statement.
pub fn parse_statement(sql: &str) -> Result<Statement> {
    let dialect = GenericDialect {};
    let source = quote_brackets(sql);
    let statements =
        Parser::parse_sql(&dialect, &source).map_err(|e| QueryError::Parse(e.to_string()))?;

    let [statement] = statements.as_slice() else {
        return Err(QueryError::Parse(format!(
            "expected exactly 1 statement, got {}",
            statements.len()
        )));
    };

    match statement {
        sql::Statement::Query(query) => Ok(Statement::Query(lower_query(query)?)),
        sql::Statement::Insert(insert) => Ok(Statement::Insert(lower_insert(insert)?)),
        sql::Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => {
            let table = table_factor_name(&table.relation)?;
            let assignments = assignments
                .iter()
                .map(|a| Ok((unquote(&a.target.to_string()), lower_expr(&a.value)?)))
                .collect::<Result<Vec<_>>>()?;
            Ok(Statement::Update(Update {
                table,
                assignments,
                selection: selection.as_ref().map(lower_expr).transpose()?,
            }))
        }
        sql::Statement::Delete(delete) => {
            let tables = match &delete.from {
                sql::FromTable::WithFromKeyword(tables) | sql::FromTable::WithoutKeyword(tables) => tables,
            };
            let [table] = tables.as_slice() else {
                return Err(QueryError::Parse(
                    "expected exactly 1 table in DELETE".to_string(),
                ));
            };
            Ok(Statement::Delete(Delete {
                table: table_factor_name(&table.relation)?,
                selection: delete.selection.as_ref().map(lower_expr).transpose()?,
            }))
        }
        other => Err(QueryError::unsupported(format!(
            "statement type not supported: {}",
            first_word(&other.to_string())
        ))),
    }
}

/// Parses a standalone expression, as used by computed attribute formulas.
pub fn parse_expression(text: &str) -> Result<Expr> {
    let dialect = GenericDialect {};
    let source = quote_brackets(text);
    let expr = Parser::new(&dialect)
        .try_with_sql(&source)
        .and_then(|mut parser| parser.parse_expr())
        .map_err(|e| QueryError::Parse(e.to_string()))?;
    lower_expr(&expr)
}

fn first_word(text: &str) -> &str {
    text.split_whitespace().next().unwrap_or(text)
}

/// Rewrites `[name]` to `` `name` `` outside of string literals.
fn quote_brackets(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut quote: Option<char> = None;
    for c in sql.chars() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
                out.push(c);
            }
            None => match c {
                '\'' | '"' | '`' => {
                    quote = Some(c);
                    out.push(c);
                }
                '[' | ']' => out.push('`'),
                _ => out.push(c),
            },
        }
    }
    out
}

/// Strips identifier quotes from a rendered name.
fn unquote(name: &str) -> String {
    let trimmed = name.trim();
    for (open, close) in [('`', '`'), ('"', '"'), ('[', ']')] {
        if let Some(inner) = trimmed.strip_prefix(open).and_then(|s| s.strip_suffix(close)) {
            return inner.to_string();
        }
    }
    trimmed.to_string()
}

/// Splits a rendered `db.table` name on dots outside of quotes.
fn split_rendered_name(rendered: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for c in rendered.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None => match c {
                '`' | '"' => quote = Some(c),
                '.' => parts.push(std::mem::take(&mut current)),
                _ => current.push(c),
            },
        }
    }
    parts.push(current);
    parts
}

fn name_parts(parts: Vec<String>, alias: Option<String>) -> Result<TableName> {
    match parts.as_slice() {
        [table] => Ok(TableName {
            database: None,
            table: table.clone(),
            alias,
        }),
        [database, table] => Ok(TableName {
            database: Some(database.clone()),
            table: table.clone(),
            alias,
        }),
        _ => Err(QueryError::Parse(format!(
            "invalid table reference '{}'",
            parts.join(".")
        ))),
    }
}

fn object_name(name: &ObjectName) -> Vec<String> {
    name.0.iter().map(|ident| ident.value.clone()).collect()
}

fn table_factor_name(factor: &TableFactor) -> Result<TableName> {
    match factor {
        TableFactor::Table { name, alias, .. } => name_parts(
            object_name(name),
            alias.as_ref().map(|a| a.name.value.clone()),
        ),
        other => Err(QueryError::unsupported(format!(
            "unsupported table expression: {other}"
        ))),
    }
}

// ============================================================================
// Queries
// ============================================================================

fn lower_query(query: &sql::Query) -> Result<Query> {
    if query.with.is_some() {
        return Err(QueryError::unsupported("WITH clauses are not supported"));
    }
    let body = lower_body(&query.body)?;
    let order_by = match &query.order_by {
        Some(order_by) => order_by
            .exprs
            .iter()
            .map(|item| {
                Ok(OrderItem {
                    expr: lower_expr(&item.expr)?,
                    descending: item.asc == Some(false),
                })
            })
            .collect::<Result<Vec<_>>>()?,
        None => Vec::new(),
    };
    let limit = query.limit.as_ref().map(|e| count_literal(e, "LIMIT")).transpose()?;
    let offset = query
        .offset
        .as_ref()
        .map(|o| count_literal(&o.value, "OFFSET"))
        .transpose()?
        .unwrap_or(0);
    Ok(Query {
        body,
        order_by,
        limit,
        offset,
    })
}

fn count_literal(expr: &sql::Expr, clause: &str) -> Result<usize> {
    match expr {
        sql::Expr::Value(SqlValue::Number(n, _)) => n
            .parse()
            .map_err(|_| QueryError::Parse(format!("invalid {clause} value: {n}"))),
        other => Err(QueryError::unsupported(format!(
            "unsupported {clause} expression: {other}"
        ))),
    }
}

fn lower_body(body: &SetExpr) -> Result<QueryBody> {
    match body {
        SetExpr::Select(select) => Ok(QueryBody::Select(Box::new(lower_select(select)?))),
        SetExpr::Query(query) => {
            let inner = lower_query(query)?;
            if !inner.order_by.is_empty() || inner.limit.is_some() || inner.offset > 0 {
                return Err(QueryError::unsupported(
                    "ORDER BY / LIMIT inside a UNION operand is not supported",
                ));
            }
            Ok(inner.body)
        }
        SetExpr::SetOperation {
            op,
            set_quantifier,
            left,
            right,
        } => {
            if !matches!(op, SetOperator::Union) {
                return Err(QueryError::unsupported(format!(
                    "set operation not supported: {op} (only UNION is supported)"
                )));
            }
            Ok(QueryBody::Union {
                left: Box::new(lower_body(left)?),
                right: Box::new(lower_body(right)?),
                all: matches!(set_quantifier, SetQuantifier::All),
            })
        }
        other => Err(QueryError::unsupported(format!(
            "unsupported query: {}",
            first_word(&other.to_string())
        ))),
    }
}

fn lower_select(select: &sql::Select) -> Result<Select> {
    let from = match select.from.as_slice() {
        [] => None,
        [from] => Some(from),
        _ => {
            return Err(QueryError::unsupported(format!(
                "expected at most 1 table in FROM clause, got {} (use JOIN)",
                select.from.len()
            )));
        }
    };

    let joins = from
        .map(|from| from.joins.as_slice())
        .unwrap_or_default()
        .iter()
        .map(|join| {
            let (kind, constraint) = match &join.join_operator {
                JoinOperator::Inner(c) => (JoinKind::Inner, Some(c)),
                JoinOperator::LeftOuter(c) => (JoinKind::Left, Some(c)),
                JoinOperator::CrossJoin => (JoinKind::Cross, None),
                other => {
                    return Err(QueryError::unsupported(format!(
                        "join type not supported: {other:?}"
                    )));
                }
            };
            let on = match constraint {
                Some(JoinConstraint::On(expr)) => Some(lower_expr(expr)?),
                Some(JoinConstraint::None) | None => None,
                Some(_) => {
                    return Err(QueryError::unsupported(
                        "only ON join constraints are supported",
                    ));
                }
            };
            Ok(Join {
                table: table_factor_name(&join.relation)?,
                kind,
                on,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let projection = select
        .projection
        .iter()
        .map(lower_select_item)
        .collect::<Result<Vec<_>>>()?;

    let group_by = match &select.group_by {
        GroupByExpr::Expressions(exprs, _) => {
            exprs.iter().map(lower_expr).collect::<Result<Vec<_>>>()?
        }
        GroupByExpr::All(_) => {
            return Err(QueryError::unsupported("GROUP BY ALL is not supported"));
        }
    };

    Ok(Select {
        distinct: select.distinct.is_some(),
        projection,
        from: from.map(|f| table_factor_name(&f.relation)).transpose()?,
        joins,
        selection: select.selection.as_ref().map(lower_expr).transpose()?,
        group_by,
        having: select.having.as_ref().map(lower_expr).transpose()?,
    })
}

fn lower_select_item(item: &sql::SelectItem) -> Result<SelectItem> {
    match item {
        sql::SelectItem::Wildcard(_) => Ok(SelectItem::Wildcard),
        sql::SelectItem::QualifiedWildcard(name, _) => {
            let parts = split_rendered_name(&name.to_string());
            let qualifier = parts.last().cloned().unwrap_or_default();
            Ok(SelectItem::QualifiedWildcard(qualifier))
        }
        sql::SelectItem::UnnamedExpr(expr) => {
            let label = match expr {
                sql::Expr::Identifier(ident) => ident.value.clone(),
                sql::Expr::CompoundIdentifier(idents) => idents
                    .last()
                    .map(|i| i.value.clone())
                    .unwrap_or_default(),
                other => other.to_string(),
            };
            Ok(SelectItem::Expr {
                expr: lower_expr(expr)?,
                alias: None,
                label,
            })
        }
        sql::SelectItem::ExprWithAlias { expr, alias } => Ok(SelectItem::Expr {
            expr: lower_expr(expr)?,
            alias: Some(alias.value.clone()),
            label: alias.value.clone(),
        }),
    }
}

// ============================================================================
// DML
// ============================================================================

fn lower_insert(insert: &sql::Insert) -> Result<Insert> {
    let table = name_parts(split_rendered_name(&insert.table.to_string()), None)?;
    let columns: Vec<String> = insert.columns.iter().map(|c| c.value.clone()).collect();

    let rows = match insert.source.as_ref().map(|s| s.body.as_ref()) {
        Some(SetExpr::Values(values)) => values
            .rows
            .iter()
            .map(|row| row.iter().map(lower_expr).collect::<Result<Vec<_>>>())
            .collect::<Result<Vec<_>>>()?,
        _ => {
            return Err(QueryError::unsupported(
                "only VALUES clause is supported in INSERT",
            ));
        }
    };

    for row in &rows {
        if row.len() != columns.len() {
            return Err(QueryError::Parse(format!(
                "INSERT has {} columns but {} values",
                columns.len(),
                row.len()
            )));
        }
    }

    Ok(Insert {
        table,
        columns,
        rows,
    })
}

// ============================================================================
// Expressions
// ============================================================================

fn lower_value(value: &SqlValue) -> Result<Value> {
    match value {
        SqlValue::Number(n, _) => {
            if let Ok(i) = n.parse::<i64>() {
                return Ok(Value::from(i));
            }
            n.parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| QueryError::Parse(format!("invalid number: {n}")))
        }
        SqlValue::SingleQuotedString(s) | SqlValue::DoubleQuotedString(s) => {
            Ok(Value::String(s.clone()))
        }
        SqlValue::Boolean(b) => Ok(Value::Bool(*b)),
        SqlValue::Null => Ok(Value::Null),
        other => Err(QueryError::unsupported(format!(
            "unsupported literal: {other}"
        ))),
    }
}

fn lower_binary_op(op: &BinaryOperator) -> Result<BinaryOp> {
    Ok(match op {
        BinaryOperator::Eq => BinaryOp::Eq,
        BinaryOperator::NotEq => BinaryOp::NotEq,
        BinaryOperator::Lt => BinaryOp::Lt,
        BinaryOperator::LtEq => BinaryOp::LtEq,
        BinaryOperator::Gt => BinaryOp::Gt,
        BinaryOperator::GtEq => BinaryOp::GtEq,
        BinaryOperator::And => BinaryOp::And,
        BinaryOperator::Or => BinaryOp::Or,
        BinaryOperator::Plus => BinaryOp::Plus,
        BinaryOperator::Minus => BinaryOp::Minus,
        BinaryOperator::Multiply => BinaryOp::Multiply,
        BinaryOperator::Divide => BinaryOp::Divide,
        BinaryOperator::Modulo => BinaryOp::Modulo,
        BinaryOperator::StringConcat => BinaryOp::Concat,
        other => {
            return Err(QueryError::unsupported(format!(
                "unsupported operator: {other}"
            )));
        }
    })
}

/// Lowers a `sqlparser` expression.
pub(crate) fn lower_expr(expr: &sql::Expr) -> Result<Expr> {
    match expr {
        sql::Expr::Identifier(ident) => Ok(Expr::Column(ColumnRef::bare(&ident.value))),
        sql::Expr::CompoundIdentifier(idents) => match idents.as_slice() {
            [.., qualifier, name] => Ok(Expr::Column(ColumnRef::qualified(
                &qualifier.value,
                &name.value,
            ))),
            [name] => Ok(Expr::Column(ColumnRef::bare(&name.value))),
            [] => Err(QueryError::Parse("empty identifier".to_string())),
        },
        sql::Expr::Value(value) => Ok(Expr::Literal(lower_value(value)?)),
        sql::Expr::Nested(inner) => lower_expr(inner),
        sql::Expr::UnaryOp { op, expr } => {
            let inner = lower_expr(expr)?;
            match op {
                UnaryOperator::Not => Ok(Expr::Unary {
                    op: UnaryOp::Not,
                    expr: Box::new(inner),
                }),
                UnaryOperator::Minus => Ok(match inner {
                    Expr::Literal(Value::Number(n)) => Expr::Literal(negate(&n)),
                    other => Expr::Unary {
                        op: UnaryOp::Neg,
                        expr: Box::new(other),
                    },
                }),
                UnaryOperator::Plus => Ok(inner),
                other => Err(QueryError::unsupported(format!(
                    "unsupported operator: {other}"
                ))),
            }
        }
        sql::Expr::BinaryOp { left, op, right } => Ok(Expr::binary(
            lower_expr(left)?,
            lower_binary_op(op)?,
            lower_expr(right)?,
        )),
        sql::Expr::IsNull(inner) => Ok(Expr::IsNull {
            expr: Box::new(lower_expr(inner)?),
            negated: false,
        }),
        sql::Expr::IsNotNull(inner) => Ok(Expr::IsNull {
            expr: Box::new(lower_expr(inner)?),
            negated: true,
        }),
        sql::Expr::InList {
            expr,
            list,
            negated,
        } => Ok(Expr::InList {
            expr: Box::new(lower_expr(expr)?),
            list: list.iter().map(lower_expr).collect::<Result<Vec<_>>>()?,
            negated: *negated,
        }),
        sql::Expr::Between {
            expr,
            negated,
            low,
            high,
        } => Ok(Expr::Between {
            expr: Box::new(lower_expr(expr)?),
            low: Box::new(lower_expr(low)?),
            high: Box::new(lower_expr(high)?),
            negated: *negated,
        }),
        sql::Expr::Like {
            negated,
            expr,
            pattern,
            ..
        } => Ok(like(expr, pattern, *negated, false)?),
        sql::Expr::ILike {
            negated,
            expr,
            pattern,
            ..
        } => Ok(like(expr, pattern, *negated, true)?),
        sql::Expr::Function(function) => lower_function(function),
        other => Err(QueryError::unsupported(format!(
            "unsupported expression: {other}"
        ))),
    }
}

fn negate(n: &Number) -> Value {
    match n.as_i64() {
        Some(i) => Value::from(-i),
        None => Number::from_f64(-n.as_f64().unwrap_or_default()).map_or(Value::Null, Value::Number),
    }
}

fn like(expr: &sql::Expr, pattern: &sql::Expr, negated: bool, case_insensitive: bool) -> Result<Expr> {
    Ok(Expr::Like {
        expr: Box::new(lower_expr(expr)?),
        pattern: Box::new(lower_expr(pattern)?),
        negated,
        case_insensitive,
        escape: None,
    })
}

fn lower_function(function: &sql::Function) -> Result<Expr> {
    let name = object_name(&function.name).join(".").to_ascii_uppercase();
    let (args, distinct) = match &function.args {
        FunctionArguments::None => (Vec::new(), false),
        FunctionArguments::List(list) => (
            list.args.iter().collect::<Vec<_>>(),
            matches!(list.duplicate_treatment, Some(DuplicateTreatment::Distinct)),
        ),
        FunctionArguments::Subquery(_) => {
            return Err(QueryError::unsupported("subqueries are not supported"));
        }
    };

    if let Some(func) = AggregateFunc::from_name(&name) {
        let arg = match args.as_slice() {
            [FunctionArg::Unnamed(FunctionArgExpr::Wildcard)] if func == AggregateFunc::Count => None,
            [FunctionArg::Unnamed(FunctionArgExpr::Expr(expr))] => Some(Box::new(lower_expr(expr)?)),
            _ => {
                return Err(QueryError::Parse(format!(
                    "{name} expects exactly 1 argument"
                )));
            }
        };
        return Ok(Expr::Aggregate(Aggregate {
            func,
            arg,
            distinct,
        }));
    }

    let args = args
        .into_iter()
        .map(|arg| match arg {
            FunctionArg::Unnamed(FunctionArgExpr::Expr(expr)) => lower_expr(expr),
            other => Err(QueryError::unsupported(format!(
                "unsupported argument to {name}: {other}"
            ))),
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Expr::Function { name, args })
}
