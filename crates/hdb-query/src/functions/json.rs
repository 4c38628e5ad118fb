//! `SEARCH_JSON(path, document)`.

use serde_json::Value;

use super::{arg, require_args};
use crate::error::{QueryError, Result};

/// Evaluates a JSONPath expression against a document.
///
/// Paths without a leading `$` are rooted automatically (`name` becomes
/// `$.name`, `[0]` becomes `$[0]`). A document given as a JSON string is
/// parsed first. One match returns the value itself, several return an
/// array, none return `null`.
pub(super) fn search_json(args: &[Value]) -> Result<Value> {
    require_args("SEARCH_JSON", args, 2)?;
    let Value::String(path) = arg(args, 0) else {
        return Err(QueryError::InvalidArgument(
            "SEARCH_JSON path must be a string".to_string(),
        ));
    };
    let parsed;
    let document = match arg(args, 1) {
        Value::Null => return Ok(Value::Null),
        Value::String(text) => match serde_json::from_str::<Value>(text) {
            Ok(value) => {
                parsed = value;
                &parsed
            }
            Err(_) => return Ok(Value::Null),
        },
        other => other,
    };

    let path = root_path(path.trim());
    let matches = jsonpath_lib::select(document, &path)
        .map_err(|e| QueryError::InvalidArgument(format!("invalid SEARCH_JSON path '{path}': {e:?}")))?;
    Ok(match matches.as_slice() {
        [] => Value::Null,
        [single] => (*single).clone(),
        many => Value::Array(many.iter().map(|v| (*v).clone()).collect()),
    })
}

fn root_path(path: &str) -> String {
    if path.starts_with('$') {
        path.to_string()
    } else if path.starts_with('.') || path.starts_with('[') {
        format!("${path}")
    } else {
        format!("$.{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> Value {
        json!({
            "name": "Harper",
            "friends": [
                {"name": "Penny", "age": 5},
                {"name": "Kato", "age": 9}
            ]
        })
    }

    #[test]
    fn scalar_match() {
        assert_eq!(search_json(&[json!("name"), doc()]).unwrap(), json!("Harper"));
        assert_eq!(search_json(&[json!("$.friends[0].age"), doc()]).unwrap(), json!(5));
    }

    #[test]
    fn multiple_matches_become_an_array() {
        let names = search_json(&[json!("friends[*].name"), doc()]).unwrap();
        assert_eq!(names, json!(["Penny", "Kato"]));
        let filtered = search_json(&[json!("$.friends[?(@.age > 6)].name"), doc()]).unwrap();
        assert_eq!(filtered, json!("Kato"));
    }

    #[test]
    fn documents_may_be_json_text() {
        let text = Value::String(doc().to_string());
        assert_eq!(search_json(&[json!(".name"), text]).unwrap(), json!("Harper"));
        assert_eq!(search_json(&[json!("missing"), doc()]).unwrap(), Value::Null);
        assert_eq!(search_json(&[json!("name"), Value::Null]).unwrap(), Value::Null);
    }
}
