//! String and numeric functions.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::Value;

use super::{arg, require_args};
use crate::error::Result;
use crate::value::{as_f64, number_value, to_text};

fn map_text(args: &[Value], f: impl Fn(&str) -> String) -> Result<Value> {
    Ok(to_text(arg(args, 0)).map_or(Value::Null, |s| Value::String(f(&s))))
}

pub(super) fn upper(args: &[Value]) -> Result<Value> {
    map_text(args, str::to_uppercase)
}

pub(super) fn lower(args: &[Value]) -> Result<Value> {
    map_text(args, str::to_lowercase)
}

pub(super) fn trim(args: &[Value]) -> Result<Value> {
    map_text(args, |s| s.trim().to_string())
}

pub(super) fn length(args: &[Value]) -> Result<Value> {
    Ok(match arg(args, 0) {
        Value::Null => Value::Null,
        Value::Array(items) => Value::from(items.len()),
        other => to_text(other).map_or(Value::Null, |s| Value::from(s.chars().count())),
    })
}

pub(super) fn concat(args: &[Value]) -> Result<Value> {
    Ok(Value::String(args.iter().filter_map(to_text).collect()))
}

/// `SUBSTRING(text, start, length?)` with a 1-based `start`.
pub(super) fn substring(args: &[Value]) -> Result<Value> {
    require_args("SUBSTRING", args, 2)?;
    let Some(text) = to_text(arg(args, 0)) else {
        return Ok(Value::Null);
    };
    let Some(start) = as_f64(arg(args, 1)) else {
        return Ok(Value::Null);
    };
    let chars: Vec<char> = text.chars().collect();
    let start = (start as i64 - 1).max(0) as usize;
    let end = match as_f64(arg(args, 2)) {
        Some(len) if len >= 0.0 => start.saturating_add(len as usize).min(chars.len()),
        Some(_) => start,
        None => chars.len(),
    };
    Ok(Value::String(chars.get(start..end).map(|c| c.iter().collect()).unwrap_or_default()))
}

pub(super) fn replace(args: &[Value]) -> Result<Value> {
    require_args("REPLACE", args, 3)?;
    match (to_text(arg(args, 0)), to_text(arg(args, 1)), to_text(arg(args, 2))) {
        (Some(text), Some(from), Some(to)) if !from.is_empty() => Ok(Value::String(text.replace(&from, &to))),
        (Some(text), Some(_), Some(_)) => Ok(Value::String(text)),
        _ => Ok(Value::Null),
    }
}

/// `ROUND(x, digits?)`, rounding half away from zero. Negative digits
/// round to tens, hundreds and so on.
pub(super) fn round(args: &[Value]) -> Result<Value> {
    require_args("ROUND", args, 1)?;
    let Some(x) = as_f64(arg(args, 0)) else {
        return Ok(Value::Null);
    };
    let digits = as_f64(arg(args, 1)).map_or(0, |d| d as i32);
    if digits < 0 {
        let factor = 10f64.powi(-digits);
        return Ok(number_value(round_decimal(x / factor, 0) * factor));
    }
    Ok(number_value(round_decimal(x, digits.unsigned_abs())))
}

fn round_decimal(x: f64, digits: u32) -> f64 {
    Decimal::from_f64(x)
        .map(|d| d.round_dp_with_strategy(digits, RoundingStrategy::MidpointAwayFromZero))
        .and_then(|d| d.to_f64())
        .unwrap_or_else(|| {
            let factor = 10f64.powi(digits as i32);
            (x * factor).round() / factor
        })
}

fn map_number(args: &[Value], f: impl Fn(f64) -> f64) -> Result<Value> {
    Ok(as_f64(arg(args, 0)).map_or(Value::Null, |x| number_value(f(x))))
}

pub(super) fn abs(args: &[Value]) -> Result<Value> {
    map_number(args, f64::abs)
}

pub(super) fn floor(args: &[Value]) -> Result<Value> {
    map_number(args, f64::floor)
}

pub(super) fn ceil(args: &[Value]) -> Result<Value> {
    map_number(args, f64::ceil)
}

pub(super) fn coalesce(args: &[Value]) -> Value {
    args.iter().find(|v| !v.is_null()).cloned().unwrap_or(Value::Null)
}
