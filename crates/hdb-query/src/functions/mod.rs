//! Built-in scalar functions.
//!
//! Names are matched case-insensitively; the parser upper-cases them, so
//! `geoDistance` and `GEODISTANCE` are the same function.

mod date;
mod geo;
mod json;
mod scalar;

use serde_json::Value;

use crate::error::{QueryError, Result};

/// Calls the built-in function `name` with already evaluated arguments.
pub fn call(name: &str, args: &[Value]) -> Result<Value> {
    let upper = name.to_ascii_uppercase();
    match upper.as_str() {
        // Strings and numbers
        "UPPER" | "UCASE" => scalar::upper(args),
        "LOWER" | "LCASE" => scalar::lower(args),
        "TRIM" => scalar::trim(args),
        "LENGTH" | "LEN" | "CHAR_LENGTH" => scalar::length(args),
        "CONCAT" => scalar::concat(args),
        "SUBSTRING" | "SUBSTR" => scalar::substring(args),
        "REPLACE" => scalar::replace(args),
        "ROUND" => scalar::round(args),
        "ABS" => scalar::abs(args),
        "FLOOR" => scalar::floor(args),
        "CEIL" | "CEILING" => scalar::ceil(args),
        "COALESCE" | "IFNULL" => Ok(scalar::coalesce(args)),

        // Dates
        "CURRENT_DATE" => date::current_date(args),
        "CURRENT_TIME" => date::current_time(args),
        "CURRENT_TIMESTAMP" | "NOW" | "GETDATE" | "GET_SERVER_TIME" => date::now(args),
        "DATE" => date::date(args),
        "DATE_ADD" => date::date_add(args, 1),
        "DATE_SUB" => date::date_add(args, -1),
        "DATE_DIFF" | "DATEDIFF" => date::date_diff(args),
        "DATE_FORMAT" => date::date_format(args),
        "OFFSET_UTC" => date::offset_utc(args),

        // JSON
        "SEARCH_JSON" => json::search_json(args),

        // Geospatial
        "GEOAREA" => geo::area(args),
        "GEOLENGTH" => geo::length(args),
        "GEODISTANCE" => geo::distance(args),
        "GEONEAR" => geo::near(args),
        "GEOCONTAINS" => geo::contains(args),
        "GEOEQUAL" => geo::equal(args),
        "GEOCROSSES" => geo::crosses(args),
        "GEODIFFERENCE" => geo::difference(args),
        "GEOCONVERT" => geo::convert(args),

        _ => Err(QueryError::UnknownFunction(name.to_string())),
    }
}

/// Returns true if `name` is a built-in function.
pub fn is_builtin(name: &str) -> bool {
    !matches!(
        call(name, &[]),
        Err(QueryError::UnknownFunction(_))
    )
}

/// Fetches argument `index`, or `Null` when it was not supplied.
fn arg(args: &[Value], index: usize) -> &Value {
    args.get(index).unwrap_or(&Value::Null)
}

fn require_args(function: &str, args: &[Value], min: usize) -> Result<()> {
    if args.len() < min {
        return Err(QueryError::InvalidArgument(format!(
            "{function} requires at least {min} argument{}",
            if min == 1 { "" } else { "s" }
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dispatch_is_case_insensitive() {
        assert_eq!(call("upper", &[json!("dog")]).unwrap(), json!("DOG"));
        assert_eq!(call("Upper", &[json!("dog")]).unwrap(), json!("DOG"));
    }

    #[test]
    fn unknown_functions_are_reported() {
        let err = call("NOPE", &[]).unwrap_err();
        assert!(matches!(err, QueryError::UnknownFunction(name) if name == "NOPE"));
        assert!(is_builtin("geoArea"));
        assert!(!is_builtin("nope"));
    }
}
