//! Expression trees and their evaluation.
//!
//! SQL `WHERE`/`ON`/`HAVING` clauses, projections, `UPDATE ... SET` values
//! and computed attribute formulas all compile to [`Expr`]. Evaluation runs
//! against a [`Scope`], which resolves columns for the row at hand and, for
//! grouped queries, aggregate calls over the group.

use std::collections::HashSet;
use std::fmt;

use serde_json::Value;

use crate::error::{QueryError, Result};
use crate::functions;
use crate::value::{as_f64, compare, is_truthy, number_value, to_text, total_cmp, values_equal};
use crate::wildcard::Pattern;

// ============================================================================
// Expression Types
// ============================================================================

/// A column reference, optionally qualified by a table name or alias.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnRef {
    pub qualifier: Option<String>,
    pub name: String,
}

impl ColumnRef {
    pub fn bare(name: impl Into<String>) -> Self {
        Self {
            qualifier: None,
            name: name.into(),
        }
    }

    pub fn qualified(qualifier: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            qualifier: Some(qualifier.into()),
            name: name.into(),
        }
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.qualifier {
            Some(q) => write!(f, "{q}.{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    Plus,
    Minus,
    Multiply,
    Divide,
    Modulo,
    Concat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFunc {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "COUNT" => Some(AggregateFunc::Count),
            "SUM" => Some(AggregateFunc::Sum),
            "AVG" => Some(AggregateFunc::Avg),
            "MIN" => Some(AggregateFunc::Min),
            "MAX" => Some(AggregateFunc::Max),
            _ => None,
        }
    }
}

impl fmt::Display for AggregateFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AggregateFunc::Count => "COUNT",
            AggregateFunc::Sum => "SUM",
            AggregateFunc::Avg => "AVG",
            AggregateFunc::Min => "MIN",
            AggregateFunc::Max => "MAX",
        })
    }
}

/// An aggregate call. `arg: None` is `COUNT(*)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub func: AggregateFunc,
    pub arg: Option<Box<Expr>>,
    pub distinct: bool,
}

impl Aggregate {
    /// Folds the argument values of a group (one per row) into the result.
    pub fn fold(&self, values: Vec<Value>, row_count: usize) -> Value {
        if self.arg.is_none() {
            return Value::from(row_count);
        }
        let mut present: Vec<Value> = values.into_iter().filter(|v| !v.is_null()).collect();
        if self.distinct {
            let mut seen = HashSet::new();
            present.retain(|v| seen.insert(v.to_string()));
        }
        match self.func {
            AggregateFunc::Count => Value::from(present.len()),
            AggregateFunc::Sum => sum(&present).unwrap_or(Value::Null),
            AggregateFunc::Avg => {
                let numbers: Vec<f64> = present.iter().filter_map(as_f64).collect();
                if numbers.is_empty() {
                    Value::Null
                } else {
                    number_value(numbers.iter().sum::<f64>() / numbers.len() as f64)
                }
            }
            AggregateFunc::Min => present.into_iter().min_by(total_cmp).unwrap_or(Value::Null),
            AggregateFunc::Max => present.into_iter().max_by(total_cmp).unwrap_or(Value::Null),
        }
    }
}

fn sum(values: &[Value]) -> Option<Value> {
    let mut int_total: Option<i64> = Some(0);
    let mut float_total = 0.0;
    let mut any = false;
    for value in values {
        let Some(f) = as_f64(value) else { continue };
        any = true;
        float_total += f;
        int_total = match (int_total, value.as_i64()) {
            (Some(acc), Some(i)) => acc.checked_add(i),
            _ => None,
        };
    }
    if !any {
        return None;
    }
    Some(int_total.map_or_else(|| number_value(float_total), Value::from))
}

/// An expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column(ColumnRef),
    Literal(Value),
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    InList {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    Between {
        expr: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
        negated: bool,
    },
    Like {
        expr: Box<Expr>,
        pattern: Box<Expr>,
        negated: bool,
        case_insensitive: bool,
        escape: Option<char>,
    },
    /// A scalar function call; `name` is upper-cased.
    Function {
        name: String,
        args: Vec<Expr>,
    },
    Aggregate(Aggregate),
}

// ============================================================================
// Scopes
// ============================================================================

/// Resolves the names an expression refers to.
pub trait Scope {
    /// Value of a column for the current row; `Null` when absent.
    fn column(&self, column: &ColumnRef) -> Value;

    /// Value of an aggregate over the current group.
    fn aggregate(&self, aggregate: &Aggregate) -> Result<Value> {
        Err(QueryError::evaluation(format!(
            "aggregate function {} is not allowed here",
            aggregate.func
        )))
    }
}

/// Scope over no row at all, for constant expressions.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyScope;

impl Scope for EmptyScope {
    fn column(&self, _column: &ColumnRef) -> Value {
        Value::Null
    }
}

/// Scope over a single record. Qualifiers are ignored.
#[derive(Debug, Clone, Copy)]
pub struct RecordScope<'a> {
    record: &'a hdb_types::Record,
}

impl<'a> RecordScope<'a> {
    pub fn new(record: &'a hdb_types::Record) -> Self {
        Self { record }
    }
}

impl Scope for RecordScope<'_> {
    fn column(&self, column: &ColumnRef) -> Value {
        self.record.get(&column.name).cloned().unwrap_or(Value::Null)
    }
}

// ============================================================================
// Evaluation
// ============================================================================

/// Three-valued truth of a value: `None` for null.
fn truth(value: &Value) -> Option<bool> {
    (!value.is_null()).then(|| is_truthy(value))
}

fn from_truth(truth: Option<bool>) -> Value {
    truth.map_or(Value::Null, Value::Bool)
}

impl Expr {
    pub fn column(name: impl Into<String>) -> Self {
        Expr::Column(ColumnRef::bare(name))
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    pub fn binary(left: Expr, op: BinaryOp, right: Expr) -> Self {
        Expr::Binary {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    pub fn evaluate(&self, scope: &dyn Scope) -> Result<Value> {
        match self {
            Expr::Column(column) => Ok(scope.column(column)),
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Unary { op, expr } => {
                let value = expr.evaluate(scope)?;
                Ok(match op {
                    UnaryOp::Not => from_truth(truth(&value).map(|b| !b)),
                    UnaryOp::Neg => match value {
                        Value::Null => Value::Null,
                        Value::Number(n) => match n.as_i64() {
                            Some(i) => i.checked_neg().map_or_else(|| number_value(-(i as f64)), Value::from),
                            None => number_value(-n.as_f64().unwrap_or_default()),
                        },
                        other => as_f64(&other).map_or(Value::Null, |f| number_value(-f)),
                    },
                })
            }
            Expr::Binary { left, op, right } => evaluate_binary(left, *op, right, scope),
            Expr::IsNull { expr, negated } => {
                let value = expr.evaluate(scope)?;
                Ok(Value::Bool(value.is_null() != *negated))
            }
            Expr::InList {
                expr,
                list,
                negated,
            } => {
                let value = expr.evaluate(scope)?;
                if value.is_null() {
                    return Ok(Value::Null);
                }
                let mut found = false;
                for item in list {
                    if values_equal(&value, &item.evaluate(scope)?) {
                        found = true;
                        break;
                    }
                }
                Ok(Value::Bool(found != *negated))
            }
            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => {
                let value = expr.evaluate(scope)?;
                let low = low.evaluate(scope)?;
                let high = high.evaluate(scope)?;
                let (Some(lo), Some(hi)) = (compare(&value, &low), compare(&value, &high)) else {
                    return Ok(if value.is_null() {
                        Value::Null
                    } else {
                        Value::Bool(*negated)
                    });
                };
                let inside = lo.is_ge() && hi.is_le();
                Ok(Value::Bool(inside != *negated))
            }
            Expr::Like {
                expr,
                pattern,
                negated,
                case_insensitive,
                escape,
            } => {
                let value = expr.evaluate(scope)?;
                let pattern = pattern.evaluate(scope)?;
                let (Some(text), Some(pattern)) = (to_text(&value), to_text(&pattern)) else {
                    return Ok(Value::Null);
                };
                let matched = if *case_insensitive {
                    Pattern::like(&pattern.to_lowercase(), *escape).matches(&text.to_lowercase())
                } else {
                    Pattern::like(&pattern, *escape).matches(&text)
                };
                Ok(Value::Bool(matched != *negated))
            }
            Expr::Function { name, args } => {
                let args = args
                    .iter()
                    .map(|arg| arg.evaluate(scope))
                    .collect::<Result<Vec<_>>>()?;
                functions::call(name, &args)
            }
            Expr::Aggregate(aggregate) => scope.aggregate(aggregate),
        }
    }

    /// Evaluates the expression as a predicate; null counts as false.
    pub fn matches(&self, scope: &dyn Scope) -> Result<bool> {
        Ok(is_truthy(&self.evaluate(scope)?))
    }

    pub fn contains_aggregate(&self) -> bool {
        let mut found = false;
        self.visit(&mut |expr| found |= matches!(expr, Expr::Aggregate(_)));
        found
    }

    /// Column references in evaluation order.
    pub fn columns(&self) -> Vec<&ColumnRef> {
        let mut out = Vec::new();
        self.visit_columns(&mut out);
        out
    }

    fn visit_columns<'a>(&'a self, out: &mut Vec<&'a ColumnRef>) {
        match self {
            Expr::Column(column) => out.push(column),
            Expr::Literal(_) => {}
            Expr::Unary { expr, .. } | Expr::IsNull { expr, .. } => expr.visit_columns(out),
            Expr::Binary { left, right, .. } => {
                left.visit_columns(out);
                right.visit_columns(out);
            }
            Expr::InList { expr, list, .. } => {
                expr.visit_columns(out);
                for e in list {
                    e.visit_columns(out);
                }
            }
            Expr::Between {
                expr, low, high, ..
            } => {
                expr.visit_columns(out);
                low.visit_columns(out);
                high.visit_columns(out);
            }
            Expr::Like { expr, pattern, .. } => {
                expr.visit_columns(out);
                pattern.visit_columns(out);
            }
            Expr::Function { args, .. } => {
                for e in args {
                    e.visit_columns(out);
                }
            }
            Expr::Aggregate(aggregate) => {
                if let Some(arg) = &aggregate.arg {
                    arg.visit_columns(out);
                }
            }
        }
    }

    /// Calls `f` on this node and every descendant.
    pub fn visit(&self, f: &mut dyn FnMut(&Expr)) {
        f(self);
        match self {
            Expr::Column(_) | Expr::Literal(_) => {}
            Expr::Unary { expr, .. } | Expr::IsNull { expr, .. } => expr.visit(f),
            Expr::Binary { left, right, .. } => {
                left.visit(f);
                right.visit(f);
            }
            Expr::InList { expr, list, .. } => {
                expr.visit(f);
                for e in list {
                    e.visit(f);
                }
            }
            Expr::Between {
                expr, low, high, ..
            } => {
                expr.visit(f);
                low.visit(f);
                high.visit(f);
            }
            Expr::Like { expr, pattern, .. } => {
                expr.visit(f);
                pattern.visit(f);
            }
            Expr::Function { args, .. } => {
                for e in args {
                    e.visit(f);
                }
            }
            Expr::Aggregate(aggregate) => {
                if let Some(arg) = &aggregate.arg {
                    arg.visit(f);
                }
            }
        }
    }

    /// Splits a predicate into its top-level `AND` conjuncts.
    pub fn conjuncts(&self) -> Vec<&Expr> {
        match self {
            Expr::Binary {
                left,
                op: BinaryOp::And,
                right,
            } => {
                let mut out = left.conjuncts();
                out.extend(right.conjuncts());
                out
            }
            other => vec![other],
        }
    }

    /// Returns the literal value when the expression is constant.
    pub fn as_literal(&self) -> Option<&Value> {
        match self {
            Expr::Literal(value) => Some(value),
            _ => None,
        }
    }
}

fn evaluate_binary(left: &Expr, op: BinaryOp, right: &Expr, scope: &dyn Scope) -> Result<Value> {
    // Short-circuit logic first.
    match op {
        BinaryOp::And => {
            let l = truth(&left.evaluate(scope)?);
            if l == Some(false) {
                return Ok(Value::Bool(false));
            }
            let r = truth(&right.evaluate(scope)?);
            return Ok(match (l, r) {
                (_, Some(false)) => Value::Bool(false),
                (Some(true), Some(true)) => Value::Bool(true),
                _ => Value::Null,
            });
        }
        BinaryOp::Or => {
            let l = truth(&left.evaluate(scope)?);
            if l == Some(true) {
                return Ok(Value::Bool(true));
            }
            let r = truth(&right.evaluate(scope)?);
            return Ok(match (l, r) {
                (_, Some(true)) => Value::Bool(true),
                (Some(false), Some(false)) => Value::Bool(false),
                _ => Value::Null,
            });
        }
        _ => {}
    }

    let l = left.evaluate(scope)?;
    let r = right.evaluate(scope)?;
    if l.is_null() || r.is_null() {
        return Ok(Value::Null);
    }
    Ok(match op {
        BinaryOp::Eq => Value::Bool(values_equal(&l, &r)),
        BinaryOp::NotEq => Value::Bool(!values_equal(&l, &r)),
        BinaryOp::Lt => Value::Bool(compare(&l, &r).is_some_and(|o| o.is_lt())),
        BinaryOp::LtEq => Value::Bool(compare(&l, &r).is_some_and(|o| o.is_le())),
        BinaryOp::Gt => Value::Bool(compare(&l, &r).is_some_and(|o| o.is_gt())),
        BinaryOp::GtEq => Value::Bool(compare(&l, &r).is_some_and(|o| o.is_ge())),
        BinaryOp::Concat => {
            let mut text = to_text(&l).unwrap_or_default();
            text.push_str(&to_text(&r).unwrap_or_default());
            Value::String(text)
        }
        BinaryOp::Plus
            if (l.is_string() && as_f64(&l).is_none()) || (r.is_string() && as_f64(&r).is_none()) =>
        {
            let mut text = to_text(&l).unwrap_or_default();
            text.push_str(&to_text(&r).unwrap_or_default());
            Value::String(text)
        }
        BinaryOp::Plus | BinaryOp::Minus | BinaryOp::Multiply | BinaryOp::Divide | BinaryOp::Modulo => {
            arithmetic(&l, op, &r)
        }
        BinaryOp::And | BinaryOp::Or => Value::Null,
    })
}

fn arithmetic(l: &Value, op: BinaryOp, r: &Value) -> Value {
    if let (Some(a), Some(b)) = (l.as_i64(), r.as_i64()) {
        let exact = match op {
            BinaryOp::Plus => a.checked_add(b),
            BinaryOp::Minus => a.checked_sub(b),
            BinaryOp::Multiply => a.checked_mul(b),
            BinaryOp::Modulo if b != 0 => a.checked_rem(b),
            BinaryOp::Divide if b != 0 && a % b == 0 => a.checked_div(b),
            _ => None,
        };
        if let Some(v) = exact {
            return Value::from(v);
        }
    }
    let (Some(a), Some(b)) = (as_f64(l), as_f64(r)) else {
        return Value::Null;
    };
    let result = match op {
        BinaryOp::Plus => a + b,
        BinaryOp::Minus => a - b,
        BinaryOp::Multiply => a * b,
        BinaryOp::Divide if b != 0.0 => a / b,
        BinaryOp::Modulo if b != 0.0 => a % b,
        _ => return Value::Null,
    };
    number_value(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hdb_types::Record;
    use serde_json::json;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => Record::new(),
        }
    }

    fn eval(expr: &Expr, rec: &Record) -> Value {
        expr.evaluate(&RecordScope::new(rec)).unwrap()
    }

    #[test]
    fn comparison_and_logic() {
        let rec = record(json!({"age": 5, "name": "Penny", "flag": false}));
        let expr = Expr::binary(
            Expr::binary(Expr::column("age"), BinaryOp::Gt, Expr::literal(3)),
            BinaryOp::And,
            Expr::binary(Expr::column("name"), BinaryOp::Eq, Expr::literal("Penny")),
        );
        assert_eq!(eval(&expr, &rec), json!(true));

        let missing = Expr::binary(Expr::column("nope"), BinaryOp::Eq, Expr::literal(1));
        assert_eq!(eval(&missing, &rec), Value::Null);
        assert!(!missing.matches(&RecordScope::new(&rec)).unwrap());

        let flag = Expr::binary(Expr::column("flag"), BinaryOp::Eq, Expr::literal(false));
        assert_eq!(eval(&flag, &rec), json!(true));
    }

    #[test]
    fn arithmetic_keeps_integers() {
        let rec = record(json!({"price": 10, "taxRate": 0.5}));
        let formula = Expr::binary(
            Expr::column("price"),
            BinaryOp::Plus,
            Expr::binary(Expr::column("price"), BinaryOp::Multiply, Expr::column("taxRate")),
        );
        assert_eq!(eval(&formula, &rec), json!(15));
        let div = Expr::binary(Expr::literal(7), BinaryOp::Divide, Expr::literal(2));
        assert_eq!(eval(&div, &rec), json!(3.5));
        let zero = Expr::binary(Expr::literal(7), BinaryOp::Divide, Expr::literal(0));
        assert_eq!(eval(&zero, &rec), Value::Null);
    }

    #[test]
    fn between_is_inclusive_and_reversed_bounds_match_nothing() {
        let rec = record(json!({"age": 5}));
        let between = |lo: i64, hi: i64| Expr::Between {
            expr: Box::new(Expr::column("age")),
            low: Box::new(Expr::literal(lo)),
            high: Box::new(Expr::literal(hi)),
            negated: false,
        };
        assert_eq!(eval(&between(5, 5), &rec), json!(true));
        assert_eq!(eval(&between(1, 5), &rec), json!(true));
        assert_eq!(eval(&between(9, 1), &rec), json!(false));
    }

    #[test]
    fn like_and_in_list() {
        let rec = record(json!({"name": "Harper", "id": "011"}));
        let like = Expr::Like {
            expr: Box::new(Expr::column("name")),
            pattern: Box::new(Expr::literal("Har%")),
            negated: false,
            case_insensitive: false,
            escape: None,
        };
        assert_eq!(eval(&like, &rec), json!(true));
        let in_list = Expr::InList {
            expr: Box::new(Expr::column("id")),
            list: vec![Expr::literal(11), Expr::literal("011")],
            negated: false,
        };
        assert_eq!(eval(&in_list, &rec), json!(true));
        let not_in = Expr::InList {
            expr: Box::new(Expr::column("id")),
            list: vec![Expr::literal(11)],
            negated: true,
        };
        assert_eq!(eval(&not_in, &rec), json!(true));
    }

    #[test]
    fn aggregates_fold_non_null_values() {
        let sum = Aggregate {
            func: AggregateFunc::Sum,
            arg: Some(Box::new(Expr::column("x"))),
            distinct: false,
        };
        assert_eq!(sum.fold(vec![json!(1), json!(null), json!(2)], 3), json!(3));
        let avg = Aggregate {
            func: AggregateFunc::Avg,
            ..sum.clone()
        };
        assert_eq!(avg.fold(vec![json!(1), json!(2)], 2), json!(1.5));
        let count_star = Aggregate {
            func: AggregateFunc::Count,
            arg: None,
            distinct: false,
        };
        assert_eq!(count_star.fold(Vec::new(), 4), json!(4));
        let count_distinct = Aggregate {
            func: AggregateFunc::Count,
            arg: Some(Box::new(Expr::column("x"))),
            distinct: true,
        };
        assert_eq!(count_distinct.fold(vec![json!(1), json!(1), json!(2)], 3), json!(2));
        let max = Aggregate {
            func: AggregateFunc::Max,
            ..sum
        };
        assert_eq!(max.fold(Vec::new(), 0), Value::Null);
    }

    #[test]
    fn aggregates_outside_groups_are_errors() {
        let expr = Expr::Aggregate(Aggregate {
            func: AggregateFunc::Count,
            arg: None,
            distinct: false,
        });
        assert!(expr.contains_aggregate());
        assert!(expr.evaluate(&EmptyScope).is_err());
    }
}
