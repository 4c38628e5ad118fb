//! JSON value semantics for queries.
//!
//! Records hold plain JSON. These helpers give the comparison, coercion and
//! rendering rules used by predicates, sorting and functions.

use std::cmp::Ordering;

use hdb_types::HashKey;
use serde_json::{Number, Value};

/// Rank of a value's type in the sort order.
fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order used by `ORDER BY` and `sort`.
///
/// `null < booleans < numbers < strings < arrays < objects`; numbers
/// compare numerically, strings lexically.
pub fn total_cmp(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => cmp_numbers(x, y),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y) {
                let ord = total_cmp(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(_), Value::Object(_)) => a.to_string().cmp(&b.to_string()),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn cmp_numbers(x: &Number, y: &Number) -> Ordering {
    match (x.as_i64(), y.as_i64()) {
        (Some(a), Some(b)) => a.cmp(&b),
        _ => x
            .as_f64()
            .unwrap_or_default()
            .total_cmp(&y.as_f64().unwrap_or_default()),
    }
}

/// Equality used by `=` and `IN`.
///
/// Numbers compare by value. A number equals a string only when the string
/// is the number's canonical rendering, so `11 = '11'` but `11 != '011'`.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::Number(x), Value::Number(y)) => cmp_numbers(x, y) == Ordering::Equal,
        (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
            match (HashKey::from_json(a), HashKey::from_json(b)) {
                (Ok(key), Ok(other)) => key.loose_alternative().is_some_and(|alt| alt == other),
                _ => false,
            }
        }
        _ => a == b,
    }
}

/// Ordering used by `<`, `<=`, `>`, `>=` and `BETWEEN`.
///
/// Returns `None` when either side is null or the types cannot be compared.
/// A numeric string is compared numerically against a number.
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Number(x), Value::Number(y)) => Some(cmp_numbers(x, y)),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Number(_), Value::String(s)) => {
            let n = s.trim().parse::<f64>().ok()?;
            as_f64(a).map(|x| x.total_cmp(&n))
        }
        (Value::String(s), Value::Number(_)) => {
            let n = s.trim().parse::<f64>().ok()?;
            as_f64(b).map(|y| n.total_cmp(&y))
        }
        _ => None,
    }
}

/// Numeric view of a value: numbers, numeric strings and booleans.
pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Converts a float to JSON, using an integer when the value is integral.
pub fn number_value(n: f64) -> Value {
    const MAX_SAFE: f64 = 9_007_199_254_740_991.0;
    if n.is_finite() && n.fract() == 0.0 && n.abs() <= MAX_SAFE {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

/// Text form used by string functions, `LIKE` and wildcard search.
pub fn to_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// SQL truthiness: `null`, `false`, `0` and `""` are false.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    #[test_case(json!(11), json!("11"), true ; "canonical numeric string")]
    #[test_case(json!(11), json!("011"), false ; "leading zero string")]
    #[test_case(json!(0), json!("011"), false ; "zero against text")]
    #[test_case(json!(1), json!(1.0), true ; "int against float")]
    #[test_case(json!(null), json!(null), false ; "null never equals")]
    #[test_case(json!(false), json!(0), false ; "false is not zero")]
    fn equality(a: Value, b: Value, expected: bool) {
        assert_eq!(values_equal(&a, &b), expected);
    }

    #[test]
    fn sort_order_across_types() {
        let mut values = vec![json!("b"), json!(2), json!(null), json!(true), json!("a"), json!(1.5)];
        values.sort_by(total_cmp);
        assert_eq!(
            values,
            vec![json!(null), json!(true), json!(1.5), json!(2), json!("a"), json!("b")]
        );
    }

    #[test]
    fn comparison_coerces_numeric_strings() {
        assert_eq!(compare(&json!(10), &json!("9")), Some(Ordering::Greater));
        assert_eq!(compare(&json!(10), &json!("abc")), None);
        assert_eq!(compare(&json!(null), &json!(1)), None);
    }

    #[test]
    fn integral_floats_render_as_integers() {
        assert_eq!(number_value(4.0), json!(4));
        assert_eq!(number_value(4.5), json!(4.5));
        assert_eq!(number_value(f64::NAN), Value::Null);
    }
}
