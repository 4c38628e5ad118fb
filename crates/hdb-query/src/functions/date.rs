//! Date and time functions.
//!
//! Dates are accepted as epoch milliseconds, RFC 3339 strings, or
//! `YYYY-MM-DD[ HH:mm:ss[.SSS]]` strings interpreted as UTC. Instants are
//! returned as epoch milliseconds unless the function formats text.

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, Months, NaiveDate, NaiveDateTime, SecondsFormat,
    Timelike, Utc,
};
use serde_json::Value;

use super::{arg, require_args};
use crate::error::{QueryError, Result};
use crate::value::{as_f64, number_value};

const MS_PER_SECOND: f64 = 1_000.0;
const MS_PER_MINUTE: f64 = 60.0 * MS_PER_SECOND;
const MS_PER_HOUR: f64 = 60.0 * MS_PER_MINUTE;
const MS_PER_DAY: f64 = 24.0 * MS_PER_HOUR;
const MS_PER_WEEK: f64 = 7.0 * MS_PER_DAY;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unit {
    Years,
    Quarters,
    Months,
    Weeks,
    Days,
    Hours,
    Minutes,
    Seconds,
    Milliseconds,
}

impl Unit {
    fn parse(value: &Value) -> Result<Self> {
        let Value::String(raw) = value else {
            return Err(QueryError::InvalidArgument(format!("invalid date unit {value}")));
        };
        // Short forms are case-sensitive: `M` is months, `m` minutes.
        let unit = match raw.as_str() {
            "y" => Unit::Years,
            "Q" => Unit::Quarters,
            "M" => Unit::Months,
            "w" => Unit::Weeks,
            "d" => Unit::Days,
            "h" => Unit::Hours,
            "m" => Unit::Minutes,
            "s" => Unit::Seconds,
            "ms" => Unit::Milliseconds,
            other => match other.to_ascii_lowercase().as_str() {
                "years" | "year" => Unit::Years,
                "quarters" | "quarter" => Unit::Quarters,
                "months" | "month" => Unit::Months,
                "weeks" | "week" => Unit::Weeks,
                "days" | "day" => Unit::Days,
                "hours" | "hour" => Unit::Hours,
                "minutes" | "minute" => Unit::Minutes,
                "seconds" | "second" => Unit::Seconds,
                "milliseconds" | "millisecond" => Unit::Milliseconds,
                _ => return Err(QueryError::InvalidArgument(format!("invalid date unit '{raw}'"))),
            },
        };
        Ok(unit)
    }

    /// Calendar units counted in months.
    fn months(self) -> Option<u32> {
        match self {
            Unit::Years => Some(12),
            Unit::Quarters => Some(3),
            Unit::Months => Some(1),
            _ => None,
        }
    }

    fn millis(self) -> f64 {
        match self {
            Unit::Weeks => MS_PER_WEEK,
            Unit::Days => MS_PER_DAY,
            Unit::Hours => MS_PER_HOUR,
            Unit::Minutes => MS_PER_MINUTE,
            Unit::Seconds => MS_PER_SECOND,
            Unit::Milliseconds => 1.0,
            // Average lengths, used only for fractional month differences.
            Unit::Years => 365.25 * MS_PER_DAY,
            Unit::Quarters => 91.3125 * MS_PER_DAY,
            Unit::Months => 30.4375 * MS_PER_DAY,
        }
    }
}

/// Parses a date argument. Returns `None` for null or unparseable input.
fn parse_date(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => DateTime::from_timestamp_millis(n.as_f64()? as i64),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
                if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
                    return Some(naive.and_utc());
                }
            }
            if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
                return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
            }
            s.parse::<f64>()
                .ok()
                .and_then(|ms| DateTime::from_timestamp_millis(ms as i64))
        }
        _ => None,
    }
}

/// Date argument `index`, defaulting to now when absent.
fn date_or_now(args: &[Value], index: usize) -> Option<DateTime<Utc>> {
    match args.get(index) {
        None => Some(Utc::now()),
        Some(value) => parse_date(value),
    }
}

fn millis(dt: DateTime<Utc>) -> Value {
    Value::from(dt.timestamp_millis())
}

pub(super) fn now(_args: &[Value]) -> Result<Value> {
    Ok(millis(Utc::now()))
}

pub(super) fn current_date(_args: &[Value]) -> Result<Value> {
    Ok(Value::String(Utc::now().format("%Y-%m-%d").to_string()))
}

pub(super) fn current_time(_args: &[Value]) -> Result<Value> {
    Ok(Value::String(Utc::now().format("%H:%M:%S%.3f").to_string()))
}

/// `DATE(value?)` as an ISO-8601 string.
pub(super) fn date(args: &[Value]) -> Result<Value> {
    Ok(date_or_now(args, 0).map_or(Value::Null, |dt| {
        Value::String(dt.to_rfc3339_opts(SecondsFormat::Millis, true))
    }))
}

/// `DATE_ADD(date, amount, unit)`; `sign` is -1 for `DATE_SUB`.
pub(super) fn date_add(args: &[Value], sign: i64) -> Result<Value> {
    require_args(if sign < 0 { "DATE_SUB" } else { "DATE_ADD" }, args, 3)?;
    let unit = Unit::parse(arg(args, 2))?;
    let (Some(dt), Some(amount)) = (parse_date(arg(args, 0)), as_f64(arg(args, 1))) else {
        return Ok(Value::Null);
    };
    let shifted = shift(dt, amount, unit, sign);
    Ok(shifted.map_or(Value::Null, millis))
}

/// Converts an integral `f64` to `i64`, or `None` when it does not fit.
fn whole(value: f64) -> Option<i64> {
    const LIMIT: f64 = 9_223_372_036_854_775_808.0; // 2^63
    (value.is_finite() && (-LIMIT..LIMIT).contains(&value)).then_some(value as i64)
}

/// `dt` moved by `amount` units; `None` when the result leaves the
/// representable range.
fn shift(dt: DateTime<Utc>, amount: f64, unit: Unit, sign: i64) -> Option<DateTime<Utc>> {
    match unit.months() {
        Some(per) => {
            let months = whole(amount.trunc())?
                .checked_mul(sign)?
                .checked_mul(i64::from(per))?;
            let delta = Months::new(u32::try_from(months.unsigned_abs()).ok()?);
            if months >= 0 {
                dt.checked_add_months(delta)
            } else {
                dt.checked_sub_months(delta)
            }
        }
        None => {
            let ms = whole((amount * unit.millis()).round())?.checked_mul(sign)?;
            dt.checked_add_signed(Duration::try_milliseconds(ms)?)
        }
    }
}

/// `DATE_DIFF(a, b, unit?)`: `a - b` in `unit` (milliseconds by default).
pub(super) fn date_diff(args: &[Value]) -> Result<Value> {
    require_args("DATE_DIFF", args, 2)?;
    let unit = match args.get(2) {
        Some(value) if !value.is_null() => Unit::parse(value)?,
        _ => Unit::Milliseconds,
    };
    let (Some(a), Some(b)) = (parse_date(arg(args, 0)), parse_date(arg(args, 1))) else {
        return Ok(Value::Null);
    };
    if let Some(per) = unit.months() {
        return Ok(Value::from(month_difference(a, b) / i64::from(per)));
    }
    let ms = (a - b).num_milliseconds() as f64;
    Ok(number_value(ms / unit.millis()))
}

/// Whole calendar months from `b` to `a`.
fn month_difference(a: DateTime<Utc>, b: DateTime<Utc>) -> i64 {
    let mut months = (i64::from(a.year()) - i64::from(b.year())) * 12 + i64::from(a.month())
        - i64::from(b.month());
    let a_rest = (a.day(), a.num_seconds_from_midnight(), a.nanosecond());
    let b_rest = (b.day(), b.num_seconds_from_midnight(), b.nanosecond());
    if months > 0 && a_rest < b_rest {
        months -= 1;
    } else if months < 0 && a_rest > b_rest {
        months += 1;
    }
    months
}

/// `DATE_FORMAT(date, pattern)` with moment-style tokens.
pub(super) fn date_format(args: &[Value]) -> Result<Value> {
    require_args("DATE_FORMAT", args, 2)?;
    let Some(dt) = parse_date(arg(args, 0)) else {
        return Ok(Value::Null);
    };
    let Value::String(pattern) = arg(args, 1) else {
        return Err(QueryError::InvalidArgument(
            "DATE_FORMAT pattern must be a string".to_string(),
        ));
    };
    Ok(Value::String(format_moment(&dt, pattern)))
}

const FORMAT_TOKENS: [&str; 18] = [
    "YYYY", "SSS", "YY", "MM", "DD", "HH", "hh", "mm", "ss", "M", "D", "H", "h", "m", "s", "A",
    "a", "Z",
];

fn format_moment<Tz: chrono::TimeZone>(dt: &DateTime<Tz>, pattern: &str) -> String
where
    Tz::Offset: std::fmt::Display,
{
    let mut out = String::with_capacity(pattern.len() + 8);
    let mut rest = pattern;
    while !rest.is_empty() {
        if let Some(stripped) = rest.strip_prefix('[') {
            // Bracketed text is copied verbatim.
            let end = stripped.find(']').unwrap_or(stripped.len());
            out.push_str(&stripped[..end]);
            rest = stripped.get(end + 1..).unwrap_or("");
            continue;
        }
        let Some(token) = FORMAT_TOKENS.iter().find(|t| rest.starts_with(**t)) else {
            let mut chars = rest.chars();
            if let Some(c) = chars.next() {
                out.push(c);
            }
            rest = chars.as_str();
            continue;
        };
        let hour12 = match dt.hour() % 12 {
            0 => 12,
            h => h,
        };
        let rendered = match *token {
            "YYYY" => format!("{:04}", dt.year()),
            "YY" => format!("{:02}", dt.year().rem_euclid(100)),
            "MM" => format!("{:02}", dt.month()),
            "M" => dt.month().to_string(),
            "DD" => format!("{:02}", dt.day()),
            "D" => dt.day().to_string(),
            "HH" => format!("{:02}", dt.hour()),
            "H" => dt.hour().to_string(),
            "hh" => format!("{hour12:02}"),
            "h" => hour12.to_string(),
            "mm" => format!("{:02}", dt.minute()),
            "m" => dt.minute().to_string(),
            "ss" => format!("{:02}", dt.second()),
            "s" => dt.second().to_string(),
            "SSS" => format!("{:03}", dt.timestamp_subsec_millis()),
            "A" => if dt.hour() < 12 { "AM" } else { "PM" }.to_string(),
            "a" => if dt.hour() < 12 { "am" } else { "pm" }.to_string(),
            _ => dt.offset().to_string(),
        };
        out.push_str(&rendered);
        rest = &rest[token.len()..];
    }
    out
}

/// `OFFSET_UTC(date, offset)`: the date rendered at a UTC offset given in
/// minutes, or in hours when `|offset| < 16`.
pub(super) fn offset_utc(args: &[Value]) -> Result<Value> {
    require_args("OFFSET_UTC", args, 2)?;
    let (Some(dt), Some(offset)) = (parse_date(arg(args, 0)), as_f64(arg(args, 1))) else {
        return Ok(Value::Null);
    };
    let minutes = if offset.abs() < 16.0 { offset * 60.0 } else { offset };
    let Some(zone) = FixedOffset::east_opt((minutes * 60.0).round() as i32) else {
        return Err(QueryError::InvalidArgument(format!("invalid UTC offset {offset}")));
    };
    Ok(Value::String(
        dt.with_timezone(&zone)
            .to_rfc3339_opts(SecondsFormat::Millis, false),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    const JAN_1_2020: i64 = 1_577_836_800_000;

    #[test_case(json!(JAN_1_2020) ; "millis")]
    #[test_case(json!("2020-01-01") ; "date only")]
    #[test_case(json!("2020-01-01T00:00:00Z") ; "rfc3339")]
    #[test_case(json!("2020-01-01 00:00:00.000") ; "sql datetime")]
    fn parses_date_inputs(input: Value) {
        assert_eq!(parse_date(&input).map(|d| d.timestamp_millis()), Some(JAN_1_2020));
    }

    #[test]
    fn add_and_subtract() {
        let day = date_add(&[json!(JAN_1_2020), json!(1), json!("days")], 1).unwrap();
        assert_eq!(day, json!(JAN_1_2020 + 86_400_000));
        let month = date_add(&[json!("2020-01-31"), json!(1), json!("M")], 1).unwrap();
        // Clamped to the end of February.
        assert_eq!(month, json!(1_582_934_400_000_i64));
        let back = date_sub_hours(2);
        assert_eq!(back, json!(JAN_1_2020 - 2 * 3_600_000));
        assert_eq!(
            date_add(&[json!(null), json!(1), json!("days")], 1).unwrap(),
            Value::Null
        );
        assert!(date_add(&[json!(JAN_1_2020), json!(1), json!("fortnights")], 1).is_err());
    }

    #[test_case(json!(1e300), "years", 1 ; "huge years")]
    #[test_case(json!(-1e300), "days", 1 ; "huge negative days")]
    #[test_case(json!(-1e300), "days", -1 ; "huge negative days subtracted")]
    #[test_case(json!(i64::MAX), "ms", -1 ; "max millis subtracted")]
    #[test_case(json!(i64::MIN), "ms", 1 ; "min millis")]
    #[test_case(json!(1e20), "months", -1 ; "months beyond range")]
    fn out_of_range_shifts_are_null(amount: Value, unit: &str, sign: i64) {
        assert_eq!(date_add(&[json!(0), amount, json!(unit)], sign).unwrap(), Value::Null);
    }

    fn date_sub_hours(hours: i64) -> Value {
        date_add(&[json!(JAN_1_2020), json!(hours), json!("hours")], -1).unwrap()
    }

    #[test]
    fn differences() {
        let a = json!("2020-03-15");
        let b = json!("2020-01-20");
        assert_eq!(date_diff(&[a.clone(), b.clone(), json!("months")]).unwrap(), json!(1));
        assert_eq!(date_diff(&[a.clone(), b.clone(), json!("days")]).unwrap(), json!(55));
        assert_eq!(date_diff(&[json!(2000), json!(500)]).unwrap(), json!(1500));
    }

    #[test]
    fn formatting() {
        let formatted = date_format(&[json!("2020-07-04T15:05:09.007Z"), json!("YYYY-MM-DD HH:mm:ss.SSS A [at] h")])
            .unwrap();
        assert_eq!(formatted, json!("2020-07-04 15:05:09.007 PM at 3"));
    }

    #[test]
    fn offsets_in_hours_and_minutes() {
        let hours = offset_utc(&[json!(JAN_1_2020), json!(5)]).unwrap();
        assert_eq!(hours, json!("2020-01-01T05:00:00.000+05:00"));
        let minutes = offset_utc(&[json!(JAN_1_2020), json!(-90)]).unwrap();
        assert_eq!(minutes, json!("2019-12-31T22:30:00.000-01:30"));
    }

    #[test]
    fn current_date_shape() {
        let Value::String(today) = current_date(&[]).unwrap() else {
            panic!("expected string");
        };
        assert_eq!(today.len(), 10);
        assert!(now(&[]).unwrap().is_i64());
    }
}
