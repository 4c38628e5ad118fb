//! Administrative operations: system information, configuration and the
//! audit log.

use hdb_config::{HdbConfig, write_local_overrides};
use hdb_types::{SYSTEM_DATABASE, Timestamp};
use serde_json::{Map, Value, json};
use tracing::info;

use crate::{
    audit::AuditFilter,
    engine::Hdb,
    error::{HdbError, Result},
    jobs::parse_date,
    operation::OperationRequest,
    users::Caller,
};

const RESTART_REQUIRED: &str =
    "Configuration successfully set. You must restart HarperDB for new config settings to take effect.";

/// Splits a flattened key such as `jobs_max_concurrent_jobs` into its
/// section and field, using the sections present in `current`.
fn split_flat_key<'a>(current: &Map<String, Value>, key: &'a str) -> Option<(&'a str, &'a str)> {
    current.keys().find_map(|section| {
        key.strip_prefix(section.as_str())
            .and_then(|rest| rest.strip_prefix('_'))
            .map(|field| (&key[..section.len()], field))
    })
}

/// Collects `set_configuration` changes as section → field → value,
/// accepting nested sections and flattened `section_field` keys. Unknown
/// sections or fields are rejected.
fn collect_changes(
    current: &Map<String, Value>,
    body: &Map<String, Value>,
) -> Result<Map<String, Value>> {
    let mut changes: Map<String, Value> = Map::new();
    let mut set = |section: &str, field: &str, value: &Value| -> Result<()> {
        let known = current
            .get(section)
            .and_then(Value::as_object)
            .is_some_and(|fields| fields.contains_key(field));
        if !known {
            return Err(HdbError::validation(format!(
                "Unknown configuration setting '{section}.{field}'"
            )));
        }
        if value.is_null() {
            return Err(HdbError::validation(format!(
                "Configuration setting '{section}.{field}' cannot be null"
            )));
        }
        if let Value::Object(fields) = changes
            .entry(section.to_string())
            .or_insert_with(|| Value::Object(Map::new()))
        {
            fields.insert(field.to_string(), value.clone());
        }
        Ok(())
    };

    for (key, value) in body {
        if key == "operation" {
            continue;
        }
        match value {
            Value::Object(fields) if current.contains_key(key) => {
                for (field, value) in fields {
                    set(key, field, value)?;
                }
            }
            _ => {
                let (section, field) = split_flat_key(current, key).ok_or_else(|| {
                    HdbError::validation(format!("Unknown configuration setting '{key}'"))
                })?;
                set(section, field, value)?;
            }
        }
    }
    if changes.is_empty() {
        return Err(HdbError::validation("No configuration settings were provided"));
    }
    Ok(changes)
}

/// Applies `changes` to the current configuration and checks the result.
fn apply_changes(current: &Map<String, Value>, changes: &Map<String, Value>) -> Result<HdbConfig> {
    let mut merged = current.clone();
    for (section, fields) in changes {
        if let (Some(Value::Object(target)), Value::Object(fields)) = (merged.get_mut(section), fields) {
            for (field, value) in fields {
                target.insert(field.clone(), value.clone());
            }
        }
    }
    let config: HdbConfig = serde_json::from_value(Value::Object(merged))
        .map_err(|err| HdbError::validation(format!("Invalid configuration value: {err}")))?;
    config.validate()?;
    Ok(config)
}

fn audit_filter(request: &OperationRequest) -> Result<AuditFilter> {
    let Some(search_type) = request.str_field("search_type") else {
        return Ok(AuditFilter::All);
    };
    let values = request
        .array_field("search_values")?
        .cloned()
        .unwrap_or_default();
    match search_type {
        "hash_value" => Ok(AuditFilter::HashValues(values)),
        "username" => Ok(AuditFilter::Usernames(
            values
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
        )),
        "timestamp" => {
            let from = match values.first() {
                Some(value) => parse_date(value)?,
                None => Timestamp::EPOCH,
            };
            let to = values.get(1).map(parse_date).transpose()?;
            Ok(AuditFilter::Timestamps { from, to })
        }
        other => Err(HdbError::validation(format!(
            "Invalid search_type '{other}', must be one of 'hash_value', 'username' or 'timestamp'"
        ))),
    }
}

impl Hdb {
    fn config_json(&self) -> Result<Map<String, Value>> {
        match serde_json::to_value(self.config()) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(HdbError::internal("configuration did not serialize to an object")),
            Err(err) => Err(HdbError::internal(format!("Failed to encode configuration: {err}"))),
        }
    }

    pub(crate) fn op_system_information(&self, _caller: &Caller, _request: &OperationRequest) -> Result<Value> {
        let databases = self.catalog().databases()?;
        let user_databases: Vec<_> = databases
            .iter()
            .filter(|database| database.name != SYSTEM_DATABASE)
            .collect();
        let table_count: usize = user_databases.iter().map(|database| database.tables.len()).sum();
        Ok(json!({
            "system": {
                "platform": std::env::consts::OS,
                "arch": std::env::consts::ARCH,
                "family": std::env::consts::FAMILY,
            },
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_seconds": self.inner.started.elapsed().as_secs(),
            "database_metrics": {
                "databases": user_databases.len(),
                "tables": table_count,
            },
            "config": {
                "persist_catalog": self.config().storage.persist_catalog,
                "max_concurrent_jobs": self.config().jobs.max_concurrent_jobs,
            },
        }))
    }

    pub(crate) fn op_get_configuration(&self, _caller: &Caller, _request: &OperationRequest) -> Result<Value> {
        Ok(Value::Object(self.config_json()?))
    }

    pub(crate) fn op_set_configuration(&self, caller: &Caller, request: &OperationRequest) -> Result<Value> {
        let project_dir = self.inner.project_dir.as_ref().ok_or_else(|| {
            HdbError::validation("Configuration cannot be changed: no project directory is configured")
        })?;
        let current = self.config_json()?;
        let changes = collect_changes(&current, &request.body)?;
        apply_changes(&current, &changes)?;

        let overrides = match toml::Value::try_from(&changes) {
            Ok(toml::Value::Table(table)) => table,
            Ok(_) => return Err(HdbError::internal("configuration changes must form a table")),
            Err(err) => {
                return Err(HdbError::validation(format!("Invalid configuration value: {err}")));
            }
        };
        let path = write_local_overrides(project_dir, &overrides)?;
        info!(
            user = %caller.username,
            path = %path.display(),
            sections = ?changes.keys().collect::<Vec<_>>(),
            "Configuration overrides written"
        );
        Ok(json!({ "message": RESTART_REQUIRED }))
    }

    pub(crate) fn op_read_audit_log(&self, _caller: &Caller, request: &OperationRequest) -> Result<Value> {
        let table = request.table_ref(self.default_database())?;
        self.catalog().table(&table)?;
        let filter = audit_filter(request)?;
        let records = self.audit().read(&table, &filter);
        serde_json::to_value(records).map_err(|err| HdbError::internal(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn current() -> Map<String, Value> {
        match serde_json::to_value(HdbConfig::default()).unwrap() {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn body(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn flattened_and_nested_keys_collect() {
        let changes = collect_changes(
            &current(),
            &body(json!({
                "operation": "set_configuration",
                "jobs_max_concurrent_jobs": 8,
                "logging": {"level": "debug"},
            })),
        )
        .unwrap();
        assert_eq!(changes["jobs"]["max_concurrent_jobs"], 8);
        assert_eq!(changes["logging"]["level"], "debug");
        let config = apply_changes(&current(), &changes).unwrap();
        assert_eq!(config.jobs.max_concurrent_jobs, 8);
    }

    #[test]
    fn unknown_settings_are_rejected() {
        let err = collect_changes(&current(), &body(json!({"clustering_enabled": true}))).unwrap_err();
        assert_eq!(err.status(), 400);
        assert!(collect_changes(&current(), &body(json!({"jobs": {"nope": 1}}))).is_err());
        assert!(collect_changes(&current(), &body(json!({"operation": "set_configuration"}))).is_err());
    }

    #[test]
    fn invalid_values_fail_validation() {
        let changes =
            collect_changes(&current(), &body(json!({"operations_max_batch_records": 0}))).unwrap();
        assert_eq!(apply_changes(&current(), &changes).unwrap_err().status(), 400);

        let changes =
            collect_changes(&current(), &body(json!({"jobs_max_concurrent_jobs": "many"}))).unwrap();
        assert!(apply_changes(&current(), &changes).is_err());
    }

    #[test]
    fn audit_filters_decode() {
        let request = OperationRequest::decode(json!({
            "operation": "read_audit_log",
            "table": "dog",
            "search_type": "timestamp",
            "search_values": [1000],
        }))
        .unwrap();
        assert_eq!(
            audit_filter(&request).unwrap(),
            AuditFilter::Timestamps {
                from: Timestamp::from_millis(1000),
                to: None,
            }
        );
        let request = OperationRequest::decode(json!({
            "operation": "read_audit_log",
            "table": "dog",
            "search_type": "color",
        }))
        .unwrap();
        assert!(audit_filter(&request).is_err());
    }
}
