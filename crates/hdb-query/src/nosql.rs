//! NoSQL search descriptors.
//!
//! `search_by_hash`, `search_by_value` and `search_by_conditions` are
//! described by plain serde structs decoded from the operation body. The
//! matching logic lives here; access paths and projection are shared with
//! SQL in the executor.

use std::cmp::Ordering;

use hdb_types::Record;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{QueryError, Result};
use crate::value::{compare, to_text, total_cmp, values_equal};
use crate::wildcard::Pattern;

/// The attribute list meaning "every readable attribute".
pub const ALL_ATTRIBUTES: &str = "*";

// ============================================================================
// Descriptors
// ============================================================================

/// Point lookup of records by hash value.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SearchByHash {
    #[serde(alias = "ids")]
    pub hash_values: Vec<Value>,
    pub get_attributes: Vec<String>,
}

/// Records whose `search_attribute` matches `search_value`, which may
/// contain `*` wildcards.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SearchByValue {
    pub search_attribute: String,
    pub search_value: Value,
    pub get_attributes: Vec<String>,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub reverse: bool,
}

impl SearchByValue {
    pub fn condition(&self) -> Condition {
        match self.search_value.as_str() {
            Some(text) if text.contains('*') => Condition::Leaf(Comparison {
                search_attribute: self.search_attribute.clone(),
                search_type: SearchType::Wildcard,
                search_value: Value::String(text.to_string()),
            }),
            _ => Condition::Leaf(Comparison {
                search_attribute: self.search_attribute.clone(),
                search_type: SearchType::Equals,
                search_value: self.search_value.clone(),
            }),
        }
    }
}

/// A multi-predicate search combined with `AND` / `OR`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SearchByConditions {
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub operator: Operator,
    #[serde(default = "all_attributes")]
    pub get_attributes: Vec<String>,
    #[serde(default)]
    pub sort: Option<SortSpec>,
    #[serde(default)]
    pub sort_attributes: Option<Vec<SortKey>>,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub reverse: bool,
}

fn all_attributes() -> Vec<String> {
    vec![ALL_ATTRIBUTES.to_string()]
}

impl SearchByConditions {
    /// The whole search as one condition group.
    pub fn root(&self) -> Condition {
        Condition::Group {
            operator: self.operator,
            conditions: self.conditions.clone(),
        }
    }

    /// Sort keys in priority order. `sort_attributes` wins over `sort`.
    pub fn sort_keys(&self) -> Vec<SortKey> {
        if let Some(keys) = &self.sort_attributes {
            return keys.clone();
        }
        self.sort.as_ref().map(SortSpec::keys).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum Operator {
    #[default]
    #[serde(rename = "AND", alias = "and", alias = "And")]
    And,
    #[serde(rename = "OR", alias = "or", alias = "Or")]
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchType {
    Equals,
    Contains,
    StartsWith,
    EndsWith,
    GreaterThan,
    GreaterThanEqual,
    LessThan,
    LessThanEqual,
    Between,
    /// `*` pattern, used by `search_by_value`.
    #[serde(skip)]
    Wildcard,
}

/// One attribute comparison.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Comparison {
    pub search_attribute: String,
    pub search_type: SearchType,
    pub search_value: Value,
}

/// A leaf comparison or a nested group of conditions.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    Group {
        #[serde(default)]
        operator: Operator,
        conditions: Vec<Condition>,
    },
    Leaf(Comparison),
}

// ============================================================================
// Sorting
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SortKey {
    pub attribute: String,
    #[serde(default, alias = "desc")]
    pub descending: bool,
}

/// `sort` accepts either a chained object (`{attribute, descending, next}`)
/// or a list of keys.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum SortSpec {
    Chain(SortChain),
    List(Vec<SortKey>),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SortChain {
    pub attribute: String,
    #[serde(default, alias = "desc")]
    pub descending: bool,
    #[serde(default)]
    pub next: Option<Box<SortChain>>,
}

impl SortSpec {
    pub fn keys(&self) -> Vec<SortKey> {
        match self {
            SortSpec::List(keys) => keys.clone(),
            SortSpec::Chain(chain) => {
                let mut keys = Vec::new();
                let mut current = Some(chain);
                while let Some(link) = current {
                    keys.push(SortKey {
                        attribute: link.attribute.clone(),
                        descending: link.descending,
                    });
                    current = link.next.as_deref();
                }
                keys
            }
        }
    }
}

/// Stable multi-key sort of records. Missing attributes sort as null.
pub fn sort_records(records: &mut [Record], keys: &[SortKey]) {
    if keys.is_empty() {
        return;
    }
    records.sort_by(|a, b| {
        for key in keys {
            let left = a.get(&key.attribute).unwrap_or(&Value::Null);
            let right = b.get(&key.attribute).unwrap_or(&Value::Null);
            let ordering = total_cmp(left, right);
            let ordering = if key.descending {
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

// ============================================================================
// Matching
// ============================================================================

impl Condition {
    /// Checks the descriptor for malformed values before any record is read.
    pub fn validate(&self) -> Result<()> {
        match self {
            Condition::Group { conditions, .. } => conditions.iter().try_for_each(Condition::validate),
            Condition::Leaf(comparison) => comparison.validate(),
        }
    }

    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Condition::Group {
                operator: Operator::And,
                conditions,
            } => conditions.iter().all(|c| c.matches(record)),
            Condition::Group {
                operator: Operator::Or,
                conditions,
            } => conditions.iter().any(|c| c.matches(record)),
            Condition::Leaf(comparison) => comparison.matches(record),
        }
    }

    /// Attributes referenced anywhere in the condition.
    pub fn attributes(&self) -> Vec<&str> {
        match self {
            Condition::Group { conditions, .. } => {
                conditions.iter().flat_map(Condition::attributes).collect()
            }
            Condition::Leaf(comparison) => vec![comparison.search_attribute.as_str()],
        }
    }

    /// Equality comparisons every matching record must satisfy, usable as
    /// an access path.
    pub fn required_equalities(&self) -> Vec<(&str, &Value)> {
        match self {
            Condition::Leaf(Comparison {
                search_attribute,
                search_type: SearchType::Equals,
                search_value,
            }) => vec![(search_attribute.as_str(), search_value)],
            Condition::Group {
                operator: Operator::And,
                conditions,
            } => conditions
                .iter()
                .flat_map(Condition::required_equalities)
                .collect(),
            Condition::Group {
                operator: Operator::Or,
                conditions,
            } if conditions.len() == 1 => conditions[0].required_equalities(),
            _ => Vec::new(),
        }
    }
}

impl Comparison {
    fn validate(&self) -> Result<()> {
        if self.search_type == SearchType::Between {
            let valid = self
                .search_value
                .as_array()
                .is_some_and(|bounds| bounds.len() == 2);
            if !valid {
                return Err(QueryError::InvalidArgument(format!(
                    "'search_value' for between on '{}' must be an array of two values",
                    self.search_attribute
                )));
            }
        }
        Ok(())
    }

    pub fn matches(&self, record: &Record) -> bool {
        let Some(actual) = record.get(&self.search_attribute) else {
            return false;
        };
        if actual.is_null() && self.search_type != SearchType::Equals {
            return false;
        }
        let expected = &self.search_value;
        match self.search_type {
            SearchType::Equals => {
                if actual.is_null() {
                    expected.is_null()
                } else {
                    values_equal(actual, expected)
                }
            }
            SearchType::Contains => text_test(actual, expected, |a, e| a.contains(e)),
            SearchType::StartsWith => text_test(actual, expected, |a, e| a.starts_with(e)),
            SearchType::EndsWith => text_test(actual, expected, |a, e| a.ends_with(e)),
            SearchType::GreaterThan => compare(actual, expected) == Some(Ordering::Greater),
            SearchType::GreaterThanEqual => matches!(
                compare(actual, expected),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            SearchType::LessThan => compare(actual, expected) == Some(Ordering::Less),
            SearchType::LessThanEqual => matches!(
                compare(actual, expected),
                Some(Ordering::Less | Ordering::Equal)
            ),
            SearchType::Between => match expected.as_array().map(Vec::as_slice) {
                Some([low, high]) => {
                    matches!(
                        compare(actual, low),
                        Some(Ordering::Greater | Ordering::Equal)
                    ) && matches!(
                        compare(actual, high),
                        Some(Ordering::Less | Ordering::Equal)
                    )
                }
                _ => false,
            },
            SearchType::Wildcard => {
                let pattern = Pattern::search(expected.as_str().unwrap_or_default());
                if pattern.matches_all() {
                    return true;
                }
                to_text(actual).is_some_and(|text| pattern.matches(&text))
            }
        }
    }
}

fn text_test(actual: &Value, expected: &Value, test: impl Fn(&str, &str) -> bool) -> bool {
    match (to_text(actual), to_text(expected)) {
        (Some(a), Some(e)) => test(&a, &e),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn leaf(attribute: &str, search_type: SearchType, value: Value) -> Condition {
        Condition::Leaf(Comparison {
            search_attribute: attribute.into(),
            search_type,
            search_value: value,
        })
    }

    #[test_case(SearchType::Equals, json!("Penny"), true; "equals")]
    #[test_case(SearchType::Contains, json!("enn"), true; "contains")]
    #[test_case(SearchType::StartsWith, json!("Pe"), true; "starts with")]
    #[test_case(SearchType::EndsWith, json!("ny"), true; "ends with")]
    #[test_case(SearchType::EndsWith, json!("Pe"), false; "ends with miss")]
    fn text_comparisons(search_type: SearchType, value: Value, expected: bool) {
        let dog = record(json!({"id": 1, "name": "Penny"}));
        assert_eq!(leaf("name", search_type, value).matches(&dog), expected);
    }

    #[test_case(SearchType::GreaterThan, json!(5), true)]
    #[test_case(SearchType::GreaterThan, json!(7), false)]
    #[test_case(SearchType::GreaterThanEqual, json!(7), true)]
    #[test_case(SearchType::LessThan, json!(7), false)]
    #[test_case(SearchType::LessThanEqual, json!(7), true)]
    #[test_case(SearchType::Between, json!([5, 7]), true)]
    #[test_case(SearchType::Between, json!([7, 7]), true)]
    #[test_case(SearchType::Between, json!([9, 5]), false)]
    fn range_comparisons(search_type: SearchType, value: Value, expected: bool) {
        let dog = record(json!({"age": 7}));
        assert_eq!(leaf("age", search_type, value).matches(&dog), expected);
    }

    #[test]
    fn wildcards_collapse_and_render_numbers() {
        let zero = record(json!({"id": 0}));
        let text = record(json!({"id": "011"}));
        let other = record(json!({"id": 11}));
        let search = |value: &str| SearchByValue {
            search_attribute: "id".into(),
            search_value: json!(value),
            get_attributes: all_attributes(),
            offset: 0,
            limit: None,
            reverse: false,
        };
        let prefix = search("0*").condition();
        assert!(prefix.matches(&zero));
        assert!(prefix.matches(&text));
        assert!(!prefix.matches(&other));

        let remarks = record(json!({"remarks": "Spacious home"}));
        let condition = SearchByValue {
            search_attribute: "remarks".into(),
            ..search("***home")
        }
        .condition();
        assert!(condition.matches(&remarks));
    }

    #[test]
    fn bare_wildcard_needs_the_attribute() {
        let search = SearchByValue {
            search_attribute: "remarks".into(),
            search_value: json!("*"),
            get_attributes: all_attributes(),
            offset: 0,
            limit: None,
            reverse: false,
        };
        assert!(search.condition().matches(&record(json!({"remarks": ""}))));
        assert!(!search.condition().matches(&record(json!({"id": 1}))));
        assert!(!search.condition().matches(&record(json!({"remarks": null}))));
    }

    #[test]
    fn hash_representation_is_preserved() {
        let text = record(json!({"id": "011"}));
        assert!(leaf("id", SearchType::Equals, json!("011")).matches(&text));
        assert!(!leaf("id", SearchType::Equals, json!(11)).matches(&text));
        assert!(leaf("id", SearchType::Equals, json!(11)).matches(&record(json!({"id": "11"}))));
    }

    #[test]
    fn decodes_descriptor_with_operator_and_sort_chain() {
        let search: SearchByConditions = serde_json::from_value(json!({
            "operation": "search_by_conditions",
            "operator": "or",
            "get_attributes": ["*"],
            "sort": {"attribute": "age", "descending": true, "next": {"attribute": "name"}},
            "conditions": [
                {"search_attribute": "age", "search_type": "between", "search_value": [5, 8]},
                {"operator": "and", "conditions": [
                    {"search_attribute": "name", "search_type": "starts_with", "search_value": "K"}
                ]}
            ]
        }))
        .unwrap();
        assert_eq!(search.operator, Operator::Or);
        assert_eq!(
            search.sort_keys(),
            vec![
                SortKey { attribute: "age".into(), descending: true },
                SortKey { attribute: "name".into(), descending: false },
            ]
        );
        let root = search.root();
        root.validate().unwrap();
        assert!(root.matches(&record(json!({"name": "Kato", "age": 1}))));
        assert!(root.matches(&record(json!({"name": "Penny", "age": 6}))));
        assert!(!root.matches(&record(json!({"name": "Penny", "age": 9}))));
        assert_eq!(root.attributes(), vec!["age", "name"]);
    }

    #[test]
    fn sort_attributes_list_takes_precedence() {
        let search: SearchByConditions = serde_json::from_value(json!({
            "conditions": [],
            "sort": {"attribute": "age"},
            "sort_attributes": [{"attribute": "name", "desc": true}]
        }))
        .unwrap();
        assert_eq!(
            search.sort_keys(),
            vec![SortKey { attribute: "name".into(), descending: true }]
        );
    }

    #[test]
    fn between_requires_two_bounds() {
        let condition = leaf("age", SearchType::Between, json!(5));
        assert!(matches!(condition.validate(), Err(QueryError::InvalidArgument(_))));
    }

    #[test]
    fn required_equalities_only_from_conjunctions() {
        let and = Condition::Group {
            operator: Operator::And,
            conditions: vec![
                leaf("id", SearchType::Equals, json!(1)),
                leaf("age", SearchType::GreaterThan, json!(1)),
            ],
        };
        assert_eq!(and.required_equalities(), vec![("id", &json!(1))]);
        let or = Condition::Group {
            operator: Operator::Or,
            conditions: vec![
                leaf("id", SearchType::Equals, json!(1)),
                leaf("id", SearchType::Equals, json!(2)),
            ],
        };
        assert!(or.required_equalities().is_empty());
    }

    #[test]
    fn multi_key_sort_is_stable() {
        let mut records = vec![
            record(json!({"id": 1, "age": 5, "name": "b"})),
            record(json!({"id": 2, "age": 7, "name": "a"})),
            record(json!({"id": 3, "age": 5, "name": "a"})),
            record(json!({"id": 4})),
        ];
        sort_records(
            &mut records,
            &[
                SortKey { attribute: "age".into(), descending: true },
                SortKey { attribute: "name".into(), descending: false },
            ],
        );
        let ids: Vec<_> = records.iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!(2), json!(3), json!(1), json!(4)]);
    }
}
