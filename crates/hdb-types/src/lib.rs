//! # hdb-types: Core types for `hdb`
//!
//! This crate contains shared types used across the `hdb` workspace:
//! - Record identity ([`HashKey`], [`TableRef`])
//! - Temporal types ([`Timestamp`])
//! - Records ([`Record`])
//! - Reserved names (system database, timestamp attributes, system tables)
//! - Identifier validation ([`validate_attribute_name`], [`validate_identifier`])

use std::{
    cmp::Ordering,
    fmt::{self, Display},
    sync::atomic::{AtomicI64, Ordering as AtomicOrdering},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Number, Value};
use thiserror::Error;

// ============================================================================
// Reserved Names
// ============================================================================

/// Name of the internal database holding roles, users, jobs and nodes.
pub const SYSTEM_DATABASE: &str = "system";

/// System-managed creation timestamp, set once per record.
pub const CREATED_TIME_ATTRIBUTE: &str = "__createdtime__";

/// System-managed modification timestamp, refreshed on every mutation.
pub const UPDATED_TIME_ATTRIBUTE: &str = "__updatedtime__";

/// Both timestamp attributes, in the order they are reported.
pub const TIMESTAMP_ATTRIBUTES: [&str; 2] = [CREATED_TIME_ATTRIBUTE, UPDATED_TIME_ATTRIBUTE];

/// System table holding role definitions.
pub const ROLE_TABLE: &str = "hdb_role";
/// System table holding user accounts.
pub const USER_TABLE: &str = "hdb_user";
/// System table holding bulk job state.
pub const JOB_TABLE: &str = "hdb_job";
/// System table holding cluster node definitions.
pub const NODES_TABLE: &str = "hdb_nodes";
/// System table holding installation info.
pub const INFO_TABLE: &str = "hdb_info";

/// System tables that super users may write new rows into directly.
pub const WRITABLE_SYSTEM_TABLES: [&str; 1] = [NODES_TABLE];

/// Maximum attribute name length in bytes.
pub const MAX_ATTRIBUTE_NAME_BYTES: usize = 250;

/// Returns true if the attribute is one of the system timestamps.
pub fn is_timestamp_attribute(name: &str) -> bool {
    TIMESTAMP_ATTRIBUTES.contains(&name)
}

// ============================================================================
// Records
// ============================================================================

/// A stored record: attribute name to JSON value.
///
/// Attributes that were never set are absent from the map; an explicit
/// `null`, `false` or `0` is a present value.
pub type Record = serde_json::Map<String, Value>;

// ============================================================================
// Identifier Validation
// ============================================================================

/// Errors raised by identifier validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    #[error("Attribute names cannot include backticks or forward slashes")]
    AttributeCharacters,

    #[error(
        "transaction aborted due to attribute name {0} being too long. Attribute names cannot be longer than {MAX_ATTRIBUTE_NAME_BYTES} bytes."
    )]
    AttributeTooLong(String),

    #[error("{kind} names cannot include backticks or forward slashes")]
    IdentifierCharacters { kind: &'static str },

    #[error("{kind} names cannot be longer than {MAX_ATTRIBUTE_NAME_BYTES} bytes")]
    IdentifierTooLong { kind: &'static str },

    #[error("{kind} name cannot be empty")]
    Empty { kind: &'static str },
}

/// Validates an attribute name.
///
/// Backticks and forward slashes are rejected anywhere in the name, and the
/// name may not exceed [`MAX_ATTRIBUTE_NAME_BYTES`] bytes.
///
/// # Examples
///
/// ```
/// use hdb_types::validate_attribute_name;
///
/// assert!(validate_attribute_name("owner_id").is_ok());
/// assert!(validate_attribute_name("bad/name").is_err());
/// assert!(validate_attribute_name("bad`name").is_err());
/// ```
pub fn validate_attribute_name(name: &str) -> Result<(), NameError> {
    if name.contains('`') || name.contains('/') {
        return Err(NameError::AttributeCharacters);
    }
    if name.len() > MAX_ATTRIBUTE_NAME_BYTES {
        return Err(NameError::AttributeTooLong(name.to_string()));
    }
    Ok(())
}

/// Validates a database or table identifier.
///
/// Numeric-looking names (`"123"`) are valid: identifiers are opaque strings.
pub fn validate_identifier(kind: &'static str, name: &str) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty { kind });
    }
    if name.contains('`') || name.contains('/') {
        return Err(NameError::IdentifierCharacters { kind });
    }
    if name.len() > MAX_ATTRIBUTE_NAME_BYTES {
        return Err(NameError::IdentifierTooLong { kind });
    }
    Ok(())
}

// ============================================================================
// TableRef
// ============================================================================

/// Fully qualified table reference: `database.table`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub database: String,
    pub table: String,
}

impl TableRef {
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
        }
    }

    /// Returns true if the table lives in the system database.
    pub fn is_system(&self) -> bool {
        self.database == SYSTEM_DATABASE
    }
}

impl Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.table)
    }
}

// ============================================================================
// Timestamp - milliseconds since Unix epoch
// ============================================================================

/// Wall-clock timestamp in milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(i64);

/// Last timestamp handed out by [`Timestamp::now_monotonic`].
static LAST_MONOTONIC: AtomicI64 = AtomicI64::new(0);

impl Timestamp {
    /// The Unix epoch (1970-01-01 00:00:00 UTC).
    pub const EPOCH: Timestamp = Timestamp(0);

    pub fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    pub fn as_millis(&self) -> i64 {
        self.0
    }

    /// Creates a timestamp for the current time.
    ///
    /// A clock set before the Unix epoch reads as the epoch.
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        Self(millis)
    }

    /// Creates a timestamp strictly greater than any previously returned by
    /// this function in the current process: `max(now, last + 1ms)`.
    ///
    /// Mutations stamp `__updatedtime__` with this so that two writes to the
    /// same record in the same millisecond still advance the timestamp.
    pub fn now_monotonic() -> Self {
        let now = Self::now().0;
        let mut last = LAST_MONOTONIC.load(AtomicOrdering::Relaxed);
        loop {
            let next = if now > last { now } else { last + 1 };
            match LAST_MONOTONIC.compare_exchange_weak(
                last,
                next,
                AtomicOrdering::AcqRel,
                AtomicOrdering::Relaxed,
            ) {
                Ok(_) => return Self(next),
                Err(observed) => last = observed,
            }
        }
    }

    pub fn to_json(self) -> Value {
        Value::Number(Number::from(self.0))
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Timestamp {
    fn from(millis: i64) -> Self {
        Self(millis)
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.0)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let millis = f64::deserialize(deserializer)?;
        Ok(Self(millis as i64))
    }
}

// ============================================================================
// HashKey - representation-sensitive primary key
// ============================================================================

/// Errors converting a JSON value into a [`HashKey`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HashKeyError {
    #[error("hash value cannot be null")]
    Null,

    #[error("invalid hash value '{0}': must be a string or a number")]
    InvalidType(String),
}

/// Primary key value of a record.
///
/// Keys keep the representation they were written with: the text `"011"`,
/// the text `"11"` and the number `11` are three different keys. Numbers sort
/// before text; numbers compare numerically and text lexically.
#[derive(Debug, Clone)]
pub enum HashKey {
    Int(i64),
    Float(f64),
    Text(String),
}

impl HashKey {
    /// Converts a JSON scalar into a key.
    pub fn from_json(value: &Value) -> Result<Self, HashKeyError> {
        match value {
            Value::Number(n) => Ok(n
                .as_i64()
                .map(HashKey::Int)
                .unwrap_or_else(|| HashKey::Float(n.as_f64().unwrap_or_default()))),
            Value::String(s) => Ok(HashKey::Text(s.clone())),
            Value::Null => Err(HashKeyError::Null),
            other => Err(HashKeyError::InvalidType(other.to_string())),
        }
    }

    /// Returns the key as a JSON value with its original representation.
    pub fn to_json(&self) -> Value {
        match self {
            HashKey::Int(i) => Value::Number(Number::from(*i)),
            HashKey::Float(f) => Number::from_f64(*f).map_or(Value::Null, Value::Number),
            HashKey::Text(s) => Value::String(s.clone()),
        }
    }

    /// Returns the counterpart of this key in the other representation, but
    /// only when the text form is the canonical rendering of the number.
    ///
    /// `"11"` and `11` are alternatives of each other; `"011"` has no
    /// alternative because `11` renders as `"11"`.
    pub fn loose_alternative(&self) -> Option<HashKey> {
        match self {
            HashKey::Int(i) => Some(HashKey::Text(i.to_string())),
            HashKey::Float(f) => Number::from_f64(*f).map(|n| HashKey::Text(n.to_string())),
            HashKey::Text(s) => {
                if let Ok(i) = s.parse::<i64>() {
                    return (i.to_string() == *s).then_some(HashKey::Int(i));
                }
                let f = s.parse::<f64>().ok()?;
                let canonical = Number::from_f64(f)?;
                (canonical.to_string() == *s).then_some(HashKey::Float(f))
            }
        }
    }

    /// Returns true for the empty string key, which callers treat as absent.
    pub fn is_empty_text(&self) -> bool {
        matches!(self, HashKey::Text(s) if s.is_empty())
    }

    fn numeric(&self) -> Option<f64> {
        match self {
            HashKey::Int(i) => Some(*i as f64),
            HashKey::Float(f) => Some(*f),
            HashKey::Text(_) => None,
        }
    }
}

impl PartialEq for HashKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HashKey {}

impl PartialOrd for HashKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HashKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (HashKey::Int(a), HashKey::Int(b)) => a.cmp(b),
            (HashKey::Text(a), HashKey::Text(b)) => a.cmp(b),
            (HashKey::Text(_), _) => Ordering::Greater,
            (_, HashKey::Text(_)) => Ordering::Less,
            (a, b) => {
                let (a, b) = (a.numeric().unwrap_or_default(), b.numeric().unwrap_or_default());
                a.total_cmp(&b)
            }
        }
    }
}

impl Display for HashKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashKey::Int(i) => write!(f, "{i}"),
            HashKey::Float(v) => write!(f, "{v}"),
            HashKey::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<&str> for HashKey {
    fn from(value: &str) -> Self {
        HashKey::Text(value.to_string())
    }
}

impl From<String> for HashKey {
    fn from(value: String) -> Self {
        HashKey::Text(value)
    }
}

impl From<i64> for HashKey {
    fn from(value: i64) -> Self {
        HashKey::Int(value)
    }
}

impl Serialize for HashKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for HashKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        HashKey::from_json(&value).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use test_case::test_case;

    #[test]
    fn leading_zero_keys_are_distinct() {
        let zero = HashKey::from_json(&json!(0)).unwrap();
        let text = HashKey::from_json(&json!("011")).unwrap();
        let longer = HashKey::from_json(&json!("00011")).unwrap();
        let eleven = HashKey::from_json(&json!(11)).unwrap();

        assert_ne!(zero, text);
        assert_ne!(text, longer);
        assert_ne!(text, eleven);
        assert_eq!(text.to_json(), json!("011"));
    }

    #[test_case("11", Some(HashKey::Int(11)) ; "canonical integer text")]
    #[test_case("011", None ; "leading zero has no alternative")]
    #[test_case("1.5", Some(HashKey::Float(1.5)) ; "canonical float text")]
    #[test_case("abc", None ; "plain text")]
    fn loose_alternative_of_text(text: &str, expected: Option<HashKey>) {
        assert_eq!(HashKey::from(text).loose_alternative(), expected);
    }

    #[test]
    fn numbers_sort_before_text() {
        let mut keys = vec![
            HashKey::from("b"),
            HashKey::Int(10),
            HashKey::from("a"),
            HashKey::Float(2.5),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                HashKey::Float(2.5),
                HashKey::Int(10),
                HashKey::from("a"),
                HashKey::from("b"),
            ]
        );
    }

    #[test]
    fn null_and_objects_are_not_keys() {
        assert_eq!(HashKey::from_json(&Value::Null), Err(HashKeyError::Null));
        assert!(HashKey::from_json(&json!({"a": 1})).is_err());
        assert!(HashKey::from_json(&json!(true)).is_err());
    }

    #[test_case("name" ; "plain")]
    #[test_case("123" ; "numeric looking")]
    #[test_case("with space" ; "space")]
    fn valid_attribute_names(name: &str) {
        assert!(validate_attribute_name(name).is_ok());
    }

    #[test]
    fn attribute_name_violations() {
        assert_eq!(
            validate_attribute_name("a/b").unwrap_err().to_string(),
            "Attribute names cannot include backticks or forward slashes"
        );
        assert_eq!(
            validate_attribute_name("`a").unwrap_err(),
            NameError::AttributeCharacters
        );
        let long = "x".repeat(MAX_ATTRIBUTE_NAME_BYTES + 1);
        assert!(matches!(
            validate_attribute_name(&long),
            Err(NameError::AttributeTooLong(_))
        ));
        assert!(validate_attribute_name(&"x".repeat(MAX_ATTRIBUTE_NAME_BYTES)).is_ok());
    }

    #[test]
    fn monotonic_timestamps_strictly_increase() {
        let a = Timestamp::now_monotonic();
        let b = Timestamp::now_monotonic();
        let c = Timestamp::now_monotonic();
        assert!(a < b && b < c);
    }

    #[test]
    fn table_ref_display() {
        let table = TableRef::new("dev", "dog");
        assert_eq!(table.to_string(), "dev.dog");
        assert!(!table.is_system());
        assert!(TableRef::new(SYSTEM_DATABASE, ROLE_TABLE).is_system());
    }

    proptest! {
        #[test]
        fn integer_keys_round_trip_through_json(i in any::<i64>()) {
            let key = HashKey::from_json(&json!(i)).unwrap();
            prop_assert_eq!(key.to_json(), json!(i));
            prop_assert_eq!(key.loose_alternative(), Some(HashKey::Text(i.to_string())));
        }

        #[test]
        fn key_ordering_is_total(a in any::<i64>(), b in "[a-z0-9]{0,6}") {
            let int = HashKey::Int(a);
            let text = HashKey::Text(b);
            prop_assert!(int < text);
        }
    }
}
