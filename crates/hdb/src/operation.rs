//! Operation descriptors.
//!
//! Every request is a flat JSON object with an `operation` discriminator.
//! The discriminator is decoded once into an [`OperationKind`]; handlers
//! read their fields through [`OperationRequest`].

use hdb_types::{Record, TableRef};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{HdbError, Result};

// ============================================================================
// Operation kinds
// ============================================================================

macro_rules! operations {
    ($($variant:ident => $name:literal $(| $alias:literal)*),+ $(,)?) => {
        /// Operations the engine executes.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum OperationKind {
            $($variant),+
        }

        impl OperationKind {
            /// Every operation, in declaration order.
            pub const ALL: &'static [OperationKind] = &[$(OperationKind::$variant),+];

            /// Canonical operation name.
            pub fn name(self) -> &'static str {
                match self {
                    $(OperationKind::$variant => $name),+
                }
            }

            /// Decodes an operation name, accepting the `schema`/`database`
            /// synonyms.
            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $($name $(| $alias)* => Some(OperationKind::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

operations! {
    Sql => "sql",
    Insert => "insert",
    Update => "update",
    Upsert => "upsert",
    Delete => "delete",
    SearchByHash => "search_by_hash" | "search_by_id",
    SearchByValue => "search_by_value",
    SearchByConditions => "search_by_conditions",
    CreateDatabase => "create_database" | "create_schema",
    DropDatabase => "drop_database" | "drop_schema",
    CreateTable => "create_table",
    DropTable => "drop_table",
    CreateAttribute => "create_attribute",
    DropAttribute => "drop_attribute",
    DescribeTable => "describe_table",
    DescribeDatabase => "describe_database" | "describe_schema",
    DescribeAll => "describe_all",
    AddRole => "add_role",
    AlterRole => "alter_role",
    DropRole => "drop_role",
    ListRoles => "list_roles",
    AddUser => "add_user",
    AlterUser => "alter_user",
    DropUser => "drop_user",
    ListUsers => "list_users",
    UserInfo => "user_info",
    CsvDataLoad => "csv_data_load",
    CsvFileLoad => "csv_file_load",
    CsvUrlLoad => "csv_url_load",
    ImportFromS3 => "import_from_s3",
    ExportToS3 => "export_to_s3",
    ExportLocal => "export_local",
    GetJob => "get_job",
    SearchJobsByStartDate => "search_jobs_by_start_date",
    DeleteFilesBefore => "delete_files_before" | "delete_records_before",
    DeleteAuditLogsBefore => "delete_audit_logs_before",
    ReadAuditLog => "read_audit_log",
    SystemInformation => "system_information",
    GetConfiguration => "get_configuration",
    SetConfiguration => "set_configuration",
}

/// Operations recognised by name that this engine does not implement:
/// clustering, components, licensing, token issuance, restarts and logs.
pub const UNSUPPORTED_OPERATIONS: &[&str] = &[
    "restart",
    "restart_service",
    "get_fingerprint",
    "set_license",
    "registration_info",
    "read_log",
    "cluster_set_routes",
    "cluster_get_routes",
    "cluster_delete_routes",
    "cluster_status",
    "add_node",
    "update_node",
    "remove_node",
    "deploy_component",
    "add_component",
    "drop_component",
    "package_component",
    "get_components",
    "set_component_file",
    "get_component_file",
    "get_custom_functions",
    "get_custom_function",
    "set_custom_function",
    "drop_custom_function",
    "add_custom_function_project",
    "drop_custom_function_project",
    "package_custom_function_project",
    "deploy_custom_function_project",
    "create_authentication_tokens",
    "refresh_operation_token",
];

impl OperationKind {
    /// Operations that start an asynchronous job.
    pub fn is_job(self) -> bool {
        matches!(
            self,
            OperationKind::CsvDataLoad
                | OperationKind::CsvFileLoad
                | OperationKind::CsvUrlLoad
                | OperationKind::ImportFromS3
                | OperationKind::ExportToS3
                | OperationKind::ExportLocal
                | OperationKind::DeleteFilesBefore
                | OperationKind::DeleteAuditLogsBefore
        )
    }
}

// ============================================================================
// Requests
// ============================================================================

/// A decoded operation request.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationRequest {
    pub kind: OperationKind,
    /// Name the caller used, e.g. `create_schema` for `create_database`.
    pub name: String,
    pub body: Map<String, Value>,
}

impl OperationRequest {
    /// Decodes a request body.
    pub fn decode(body: Value) -> Result<Self> {
        let Value::Object(body) = body else {
            return Err(HdbError::validation("Request body must be a JSON object"));
        };
        let name = match body.get("operation") {
            Some(Value::String(name)) => name.clone(),
            Some(_) => return Err(HdbError::validation("'operation' must be a string")),
            None => return Err(HdbError::validation("'operation' is required")),
        };
        match OperationKind::from_name(&name) {
            Some(kind) => Ok(Self { kind, name, body }),
            None if UNSUPPORTED_OPERATIONS.contains(&name.as_str()) => {
                Err(HdbError::UnsupportedOperation(name))
            }
            None => Err(HdbError::UnknownOperation(name)),
        }
    }

    /// Builds a request from a kind and body fields (used by jobs that run
    /// nested search operations).
    pub fn new(kind: OperationKind, body: Map<String, Value>) -> Self {
        Self {
            kind,
            name: kind.name().to_string(),
            body,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    /// A string field; absent, `null` and empty strings read as `None`.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.body
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// A required string field, failing with `'<key>' is required`.
    pub fn required_str(&self, key: &str) -> Result<&str> {
        self.str_field(key)
            .ok_or_else(|| HdbError::validation(format!("'{key}' is required")))
    }

    pub fn bool_field(&self, key: &str) -> Result<Option<bool>> {
        match self.body.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(_) => Err(HdbError::validation(format!("'{key}' must be a boolean"))),
        }
    }

    /// The `database` (or legacy `schema`) field.
    pub fn database(&self) -> Option<&str> {
        self.str_field("database").or_else(|| self.str_field("schema"))
    }

    /// Resolves `database`/`schema` + `table`, falling back to the default
    /// database.
    pub fn table_ref(&self, default_database: Option<&str>) -> Result<TableRef> {
        let table = self.required_str("table")?;
        let database = self
            .database()
            .or(default_database)
            .ok_or_else(|| HdbError::validation(format!("schema not defined for table {table}")))?;
        Ok(TableRef::new(database, table))
    }

    /// The `records` array of objects.
    pub fn records(&self) -> Result<Vec<Record>> {
        let records = match self.body.get("records") {
            None | Some(Value::Null) => return Err(HdbError::validation("'records' is required")),
            Some(Value::Array(records)) => records,
            Some(_) => return Err(HdbError::validation("'records' must be an array")),
        };
        records
            .iter()
            .map(|record| match record {
                Value::Object(record) => Ok(record.clone()),
                _ => Err(HdbError::validation("'records' must be an array of objects")),
            })
            .collect()
    }

    /// An array field. A non-array value is a type error (500), matching how
    /// array parameters fail in the search API.
    pub fn array_field(&self, key: &str) -> Result<Option<&Vec<Value>>> {
        match self.body.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Array(values)) => Ok(Some(values)),
            Some(_) => Err(HdbError::TypeMismatch(format!("{key} must be an array"))),
        }
    }

    /// Deserializes the whole body into a descriptor.
    pub fn descriptor<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.body.clone()))
            .map_err(|err| HdbError::validation(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    #[test_case("create_schema", OperationKind::CreateDatabase ; "schema synonym")]
    #[test_case("describe_schema", OperationKind::DescribeDatabase ; "describe synonym")]
    #[test_case("search_by_id", OperationKind::SearchByHash ; "search by id")]
    #[test_case("sql", OperationKind::Sql ; "sql")]
    fn names_decode(name: &str, kind: OperationKind) {
        assert_eq!(OperationKind::from_name(name), Some(kind));
    }

    #[test]
    fn every_kind_round_trips_its_name() {
        for kind in OperationKind::ALL {
            assert_eq!(OperationKind::from_name(kind.name()), Some(*kind));
        }
    }

    #[test]
    fn unknown_and_unsupported_operations() {
        let err = OperationRequest::decode(json!({"operation": "cluster_set_routes"})).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Operation 'cluster_set_routes' is not supported by this engine"
        );
        let err = OperationRequest::decode(json!({"operation": "make_coffee"})).unwrap_err();
        assert_eq!(err.to_string(), "Operation 'make_coffee' not found");
    }

    #[test]
    fn table_and_records_are_required() {
        let request = OperationRequest::decode(json!({"operation": "insert", "schema": "dev"})).unwrap();
        assert_eq!(request.table_ref(None).unwrap_err().to_string(), "'table' is required");
        assert_eq!(request.records().unwrap_err().to_string(), "'records' is required");
    }

    #[test]
    fn schema_and_database_are_synonyms() {
        let a = OperationRequest::decode(json!({"operation": "insert", "schema": "dev", "table": "dog"})).unwrap();
        let b = OperationRequest::decode(json!({"operation": "insert", "database": "dev", "table": "dog"})).unwrap();
        assert_eq!(a.table_ref(None).unwrap(), b.table_ref(None).unwrap());
        let c = OperationRequest::decode(json!({"operation": "insert", "table": "dog"})).unwrap();
        assert_eq!(c.table_ref(Some("data")).unwrap(), TableRef::new("data", "dog"));
    }

    #[test]
    fn non_array_parameters_are_type_errors() {
        let request = OperationRequest::decode(json!({
            "operation": "search_by_hash", "hash_values": "1"
        }))
        .unwrap();
        let err = request.array_field("hash_values").unwrap_err();
        assert_eq!(err.status(), 500);
    }
}
