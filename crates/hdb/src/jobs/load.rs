//! Bulk loads: inline CSV, local files, URLs and S3 objects.

use std::fs;

use hdb_types::{Record, TableRef};
use serde_json::{Number, Value, json};
use tracing::info;

use super::{ObjectLocation, S3Location};
use crate::{
    engine::Hdb,
    error::{HdbError, Result},
    mutation::WriteAction,
    operation::OperationRequest,
    users::Caller,
};

/// Types a CSV cell. Only canonical renderings become numbers, so `011`
/// and `1.50` stay strings; `true`/`false` become booleans and cells that
/// parse as JSON objects or arrays become JSON.
fn typed_cell(cell: &str) -> Value {
    match cell {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if cell.starts_with('{') || cell.starts_with('[') {
        if let Ok(value @ (Value::Object(_) | Value::Array(_))) = serde_json::from_str(cell) {
            return value;
        }
    }
    if let Ok(int) = cell.parse::<i64>() {
        if int.to_string() == cell {
            return json!(int);
        }
    }
    if let Some(number) = cell.parse::<f64>().ok().and_then(Number::from_f64) {
        if number.to_string() == cell {
            return Value::Number(number);
        }
    }
    Value::String(cell.to_string())
}

/// Parses CSV text with a header row into records. Empty cells are left
/// out of the record.
pub fn parse_csv(data: &str) -> Result<Vec<Record>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(data.as_bytes());
    let headers: Vec<String> = reader
        .headers()
        .map_err(|err| HdbError::validation(format!("Invalid CSV: {err}")))?
        .iter()
        .map(str::to_string)
        .collect();
    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.map_err(|err| HdbError::validation(format!("Invalid CSV: {err}")))?;
        let record: Record = headers
            .iter()
            .zip(row.iter())
            .filter(|(_, cell)| !cell.is_empty())
            .map(|(header, cell)| (header.clone(), typed_cell(cell)))
            .collect();
        if !record.is_empty() {
            records.push(record);
        }
    }
    Ok(records)
}

/// Parses a JSON document holding an array of objects (or one object).
fn parse_json_records(data: &str) -> Result<Vec<Record>> {
    let value: Value = serde_json::from_str(data)
        .map_err(|err| HdbError::validation(format!("Invalid JSON: {err}")))?;
    let values = match value {
        Value::Array(values) => values,
        object @ Value::Object(_) => vec![object],
        _ => return Err(HdbError::validation("JSON data must be an array of objects")),
    };
    values
        .into_iter()
        .map(|value| match value {
            Value::Object(record) => Ok(record),
            _ => Err(HdbError::validation("JSON data must be an array of objects")),
        })
        .collect()
}

fn utf8(bytes: Vec<u8>, source: &str) -> Result<String> {
    String::from_utf8(bytes).map_err(|_| HdbError::validation(format!("{source} is not valid UTF-8")))
}

/// Decoded fields shared by every load operation.
struct LoadTarget {
    caller: Caller,
    action: WriteAction,
    table: TableRef,
}

impl Hdb {
    fn load_target(&self, caller: &Caller, request: &OperationRequest) -> Result<LoadTarget> {
        Ok(LoadTarget {
            caller: caller.clone(),
            action: WriteAction::parse(request.str_field("action"))?,
            table: request.table_ref(self.default_database())?,
        })
    }

    /// Validates the whole batch, then applies it in chunks of
    /// `operations.max_batch_records`.
    fn load_records(&self, target: &LoadTarget, records: Vec<Record>) -> Result<Value> {
        self.check_write(&target.caller, target.action, &target.table, &records)?;
        let total = records.len();
        let chunk_size = self.config().operations.max_batch_records.max(1);
        let mut loaded = 0;
        let mut records = records.into_iter().peekable();
        while records.peek().is_some() {
            let chunk: Vec<Record> = records.by_ref().take(chunk_size).collect();
            let summary = self.write_records(&target.caller, target.action, &target.table, chunk)?;
            loaded += summary.applied.len();
        }
        info!(table = %target.table, action = target.action.name(), loaded, total, "Bulk load finished");
        Ok(Value::String(format!("successfully loaded {loaded} of {total} records")))
    }

    fn transport_get(&self, location: &ObjectLocation) -> Result<Vec<u8>> {
        let transport = self
            .inner
            .transport
            .as_ref()
            .ok_or_else(|| super::TransportError::NotConfigured(location.to_string()))?;
        Ok(transport.get(location)?)
    }

    // ========================================================================
    // Operations
    // ========================================================================

    pub(crate) fn op_csv_data_load(&self, caller: &Caller, request: &OperationRequest) -> Result<Value> {
        let target = self.load_target(caller, request)?;
        let data = request.required_str("data")?.to_string();
        self.start_job(
            caller,
            request,
            Box::new(move |hdb, _| hdb.load_records(&target, parse_csv(&data)?)),
        )
    }

    pub(crate) fn op_csv_file_load(&self, caller: &Caller, request: &OperationRequest) -> Result<Value> {
        let target = self.load_target(caller, request)?;
        let path = request.required_str("file_path")?.to_string();
        self.start_job(
            caller,
            request,
            Box::new(move |hdb, _| {
                let data = fs::read_to_string(&path).map_err(|err| {
                    HdbError::validation(format!("Unable to read file '{path}': {err}"))
                })?;
                hdb.load_records(&target, parse_csv(&data)?)
            }),
        )
    }

    pub(crate) fn op_csv_url_load(&self, caller: &Caller, request: &OperationRequest) -> Result<Value> {
        let target = self.load_target(caller, request)?;
        let url = request.required_str("csv_url")?.to_string();
        self.start_job(
            caller,
            request,
            Box::new(move |hdb, _| {
                let bytes = hdb.transport_get(&ObjectLocation::Url(url.clone()))?;
                hdb.load_records(&target, parse_csv(&utf8(bytes, &url)?)?)
            }),
        )
    }

    pub(crate) fn op_import_from_s3(&self, caller: &Caller, request: &OperationRequest) -> Result<Value> {
        let target = self.load_target(caller, request)?;
        let s3: S3Location = serde_json::from_value(
            request
                .get("s3")
                .cloned()
                .ok_or_else(|| HdbError::validation("'s3' is required"))?,
        )
        .map_err(|err| HdbError::validation(format!("Invalid 's3' parameters: {err}")))?;
        let is_json = if s3.key.ends_with(".csv") {
            false
        } else if s3.key.ends_with(".json") {
            true
        } else {
            return Err(HdbError::validation(
                "S3 key must include one of the following valid file extensions - '.csv', '.json'",
            ));
        };
        self.start_job(
            caller,
            request,
            Box::new(move |hdb, _| {
                let location = ObjectLocation::S3(s3);
                let data = utf8(hdb.transport_get(&location)?, &location.to_string())?;
                let records = if is_json {
                    parse_json_records(&data)?
                } else {
                    parse_csv(&data)?
                };
                hdb.load_records(&target, records)
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    #[test_case("12", json!(12) ; "integer")]
    #[test_case("011", json!("011") ; "leading zero")]
    #[test_case("1.5", json!(1.5) ; "float")]
    #[test_case("1.50", json!("1.50") ; "non canonical float")]
    #[test_case("true", json!(true) ; "boolean")]
    #[test_case("[1,2]", json!([1, 2]) ; "json array")]
    #[test_case("{\"a\":1}", json!({"a": 1}) ; "json object")]
    #[test_case("{oops", json!("{oops") ; "broken json")]
    #[test_case("Penny", json!("Penny") ; "text")]
    fn cells_are_typed(cell: &str, expected: Value) {
        assert_eq!(typed_cell(cell), expected);
    }

    #[test]
    fn csv_rows_become_records() {
        let records = parse_csv("id,name,age\n1,Penny,5\n2,,7\n").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(Value::Object(records[0].clone()), json!({"id": 1, "name": "Penny", "age": 5}));
        assert!(records[1].get("name").is_none());
    }

    #[test]
    fn quoted_cells_keep_commas() {
        let records = parse_csv("id,remarks\n1,\"big, friendly\"\n").unwrap();
        assert_eq!(records[0]["remarks"], "big, friendly");
    }

    #[test]
    fn json_documents_must_hold_objects() {
        assert_eq!(parse_json_records(r#"[{"id": 1}, {"id": 2}]"#).unwrap().len(), 2);
        assert_eq!(parse_json_records(r#"{"id": 1}"#).unwrap().len(), 1);
        assert!(parse_json_records("[1, 2]").is_err());
        assert!(parse_json_records("nope").is_err());
    }

    proptest! {
        #[test]
        fn canonical_integers_become_numbers(int in any::<i64>()) {
            prop_assert_eq!(typed_cell(&int.to_string()), json!(int));
        }

        #[test]
        fn zero_padded_digits_stay_text(digits in "0[0-9]{1,8}") {
            prop_assert_eq!(typed_cell(&digits), json!(digits));
        }

        #[test]
        fn every_non_empty_row_is_loaded(
            rows in proptest::collection::vec((any::<u32>(), "[A-Za-z]{1,10}"), 0..20),
        ) {
            let mut data = String::from("id,name\n");
            for (id, name) in &rows {
                data.push_str(&format!("{id},{name}\n"));
            }
            let records = parse_csv(&data).unwrap();
            prop_assert_eq!(records.len(), rows.len());
            for (record, (id, name)) in records.iter().zip(&rows) {
                prop_assert_eq!(&record["id"], &json!(id));
                prop_assert_eq!(&record["name"], &typed_cell(name));
            }
        }
    }
}
