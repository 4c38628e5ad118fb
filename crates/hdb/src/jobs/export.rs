//! Exports of search results and time-based purges.

use std::{fs, path::PathBuf};

use hdb_types::{CREATED_TIME_ATTRIBUTE, TableRef};
use serde_json::{Map, Value};
use tracing::info;

use super::{ObjectLocation, S3Location, TransportError, required_date};
use crate::{
    engine::Hdb,
    error::{HdbError, Result},
    mutation::ensure_writable,
    operation::{OperationKind, OperationRequest},
    users::Caller,
};

const SEARCH_OPERATIONS: [OperationKind; 4] = [
    OperationKind::SearchByHash,
    OperationKind::SearchByValue,
    OperationKind::SearchByConditions,
    OperationKind::Sql,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    fn parse(format: Option<&str>) -> Result<Self> {
        match format {
            None | Some("json") => Ok(ExportFormat::Json),
            Some("csv") => Ok(ExportFormat::Csv),
            Some(other) => Err(HdbError::validation(format!(
                "Invalid format '{other}', must be one of 'json' or 'csv'"
            ))),
        }
    }

    fn extension(self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        }
    }
}

/// Decodes the nested `search_operation` of an export request.
fn search_operation(request: &OperationRequest) -> Result<OperationRequest> {
    let body = match request.get("search_operation") {
        Some(body @ Value::Object(_)) => body.clone(),
        Some(_) => return Err(HdbError::validation("'search_operation' must be an object")),
        None => return Err(HdbError::validation("'search_operation' is required")),
    };
    let search = OperationRequest::decode(body)?;
    if !SEARCH_OPERATIONS.contains(&search.kind) {
        return Err(HdbError::validation(format!(
            "Operation '{}' is not allowed for export. Allowed values are 'search_by_hash', 'search_by_value', 'search_by_conditions' or 'sql'",
            search.name
        )));
    }
    Ok(search)
}

/// Renders rows as CSV. Headers are every attribute in first-seen order;
/// non-string values are written as JSON text.
fn render_csv(rows: &[Map<String, Value>]) -> Result<Vec<u8>> {
    let mut headers: Vec<&str> = Vec::new();
    for row in rows {
        for name in row.keys() {
            if !headers.contains(&name.as_str()) {
                headers.push(name);
            }
        }
    }
    let failed = |err: csv::Error| HdbError::internal(format!("Failed to write CSV: {err}"));
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(&headers).map_err(failed)?;
    for row in rows {
        let cells = headers.iter().map(|name| match row.get(*name) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
        });
        writer.write_record(cells).map_err(failed)?;
    }
    writer
        .into_inner()
        .map_err(|err| HdbError::internal(format!("Failed to write CSV: {err}")))
}

fn render(format: ExportFormat, results: Value) -> Result<Vec<u8>> {
    match format {
        ExportFormat::Json => serde_json::to_vec(&results)
            .map_err(|err| HdbError::internal(format!("Failed to write JSON: {err}"))),
        ExportFormat::Csv => {
            let rows: Vec<Map<String, Value>> = match results {
                Value::Array(values) => values
                    .into_iter()
                    .filter_map(|value| match value {
                        Value::Object(row) => Some(row),
                        _ => None,
                    })
                    .collect(),
                _ => Vec::new(),
            };
            render_csv(&rows)
        }
    }
}

impl Hdb {
    /// Runs the nested search as `caller` and renders its rows.
    fn export_rows(
        &self,
        caller: &Caller,
        search: &OperationRequest,
        format: ExportFormat,
    ) -> Result<(usize, Vec<u8>)> {
        let results = self.dispatch(caller, search)?;
        let count = results.as_array().map_or(0, Vec::len);
        Ok((count, render(format, results)?))
    }

    pub(crate) fn op_export_local(&self, caller: &Caller, request: &OperationRequest) -> Result<Value> {
        let format = ExportFormat::parse(request.str_field("format"))?;
        let search = search_operation(request)?;
        let dir = PathBuf::from(request.required_str("path")?);
        let filename = request.str_field("filename").map(str::to_string);
        let owner = caller.clone();
        self.start_job(
            caller,
            request,
            Box::new(move |hdb, job_id| {
                let (count, body) = hdb.export_rows(&owner, &search, format)?;
                let path = dir.join(
                    filename.unwrap_or_else(|| format!("{job_id}.{}", format.extension())),
                );
                fs::create_dir_all(&dir)
                    .and_then(|()| fs::write(&path, body))
                    .map_err(|err| {
                        HdbError::internal(format!("Failed to write export to {}: {err}", path.display()))
                    })?;
                info!(path = %path.display(), records = count, "Export written");
                Ok(Value::String(format!(
                    "Successfully exported {count} records to {}",
                    path.display()
                )))
            }),
        )
    }

    pub(crate) fn op_export_to_s3(&self, caller: &Caller, request: &OperationRequest) -> Result<Value> {
        let format = ExportFormat::parse(request.str_field("format"))?;
        let search = search_operation(request)?;
        let mut s3: S3Location = serde_json::from_value(
            request
                .get("s3")
                .cloned()
                .ok_or_else(|| HdbError::validation("'s3' is required"))?,
        )
        .map_err(|err| HdbError::validation(format!("Invalid 's3' parameters: {err}")))?;
        let extension = format!(".{}", format.extension());
        if !s3.key.ends_with(&extension) {
            s3.key.push_str(&extension);
        }
        let owner = caller.clone();
        self.start_job(
            caller,
            request,
            Box::new(move |hdb, _| {
                let location = ObjectLocation::S3(s3);
                let transport = hdb
                    .inner
                    .transport
                    .clone()
                    .ok_or_else(|| TransportError::NotConfigured(location.to_string()))?;
                let (count, body) = hdb.export_rows(&owner, &search, format)?;
                transport.put(&location, body)?;
                info!(location = %location, records = count, "Export uploaded");
                Ok(Value::String(format!(
                    "Successfully exported {count} records to {location}"
                )))
            }),
        )
    }

    // ========================================================================
    // Purges
    // ========================================================================

    pub(crate) fn op_delete_files_before(&self, caller: &Caller, request: &OperationRequest) -> Result<Value> {
        let before = required_date(request, "date")?;
        let table = request.table_ref(self.default_database())?;
        ensure_writable(&table, false)?;
        self.catalog().table(&table)?;
        let owner = caller.clone();
        self.start_job(
            caller,
            request,
            Box::new(move |hdb, _| {
                let hashes = hdb.created_before(&table, before.as_millis())?;
                let summary = hdb.delete_hashes(&owner, &table, &hashes)?;
                Ok(Value::String(format!(
                    "{} records successfully deleted",
                    summary.deleted.len()
                )))
            }),
        )
    }

    /// Hash values of records created strictly before `before`.
    fn created_before(&self, table: &TableRef, before: i64) -> Result<Vec<Value>> {
        Ok(self
            .store()
            .scan(table)?
            .into_iter()
            .filter(|(_, record)| {
                record
                    .get(CREATED_TIME_ATTRIBUTE)
                    .and_then(Value::as_i64)
                    .is_some_and(|created| created < before)
            })
            .map(|(key, _)| key.to_json())
            .collect())
    }

    pub(crate) fn op_delete_audit_logs_before(
        &self,
        caller: &Caller,
        request: &OperationRequest,
    ) -> Result<Value> {
        let key = if request.get("timestamp").is_some() { "timestamp" } else { "date" };
        let before = required_date(request, key)?;
        let table = request.table_ref(self.default_database())?;
        self.catalog().table(&table)?;
        self.start_job(
            caller,
            request,
            Box::new(move |hdb, _| {
                let purged = hdb.audit().purge_before(&table, before);
                info!(table = %table, purged, "Audit records purged");
                Ok(Value::String(format!(
                    "{purged} audit records successfully deleted"
                )))
            }),
        )
    }
}
