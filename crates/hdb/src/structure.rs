//! Schema management: databases, tables, attributes and describe views.

use std::collections::BTreeMap;

use hdb_catalog::{
    AttributeDef, ComputedSource, DatabaseDescription, TableDef, TableDescription, TableStats,
    describe::describe_database,
};
use hdb_rbac::{PermissionEvaluator, Role};
use hdb_types::{Record, SYSTEM_DATABASE, TableRef};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::{
    engine::Hdb,
    error::{HdbError, Result},
    operation::OperationRequest,
    users::Caller,
};

fn ensure_not_system(table: &TableRef) -> Result<()> {
    if table.is_system() {
        return Err(HdbError::ProtectedSystem);
    }
    Ok(())
}

fn to_json(value: &impl Serialize) -> Result<Value> {
    serde_json::to_value(value).map_err(|err| HdbError::internal(err.to_string()))
}

/// Decodes the computed part of an attribute declaration: a formula
/// string or `{"callback": name}`.
fn computed_source(value: Option<&Value>) -> Result<Option<ComputedSource>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(formula)) if !formula.trim().is_empty() => {
            Ok(Some(ComputedSource::Formula(formula.clone())))
        }
        Some(Value::Object(spec)) => match spec.get("callback").and_then(Value::as_str) {
            Some(name) => Ok(Some(ComputedSource::Callback(name.to_string()))),
            None => Err(HdbError::validation(
                "computed attribute must be a formula string or {\"callback\": name}",
            )),
        },
        Some(_) => Err(HdbError::validation(
            "computed attribute must be a formula string or {\"callback\": name}",
        )),
    }
}

/// Decodes one entry of `create_table`'s `attributes`: a bare name or
/// `{name, indexed?, computed?}`.
fn attribute_declaration(value: &Value) -> Result<AttributeDef> {
    match value {
        Value::String(name) => Ok(AttributeDef::plain(name.clone())),
        Value::Object(spec) => {
            let name = spec
                .get("name")
                .or_else(|| spec.get("attribute"))
                .and_then(Value::as_str)
                .ok_or_else(|| HdbError::validation("attribute declarations require a 'name'"))?;
            let indexed = spec.get("indexed").and_then(Value::as_bool).unwrap_or(false);
            Ok(match computed_source(spec.get("computed"))? {
                Some(source) => AttributeDef::computed(name, source, indexed),
                None if indexed => AttributeDef::indexed(name),
                None => AttributeDef::plain(name),
            })
        }
        _ => Err(HdbError::validation(
            "'attributes' must be an array of names or attribute objects",
        )),
    }
}

impl Hdb {
    fn table_stats(&self, table: &TableRef) -> TableStats {
        let record_count = self.store().count(table).unwrap_or_else(|err| {
            warn!(table = %table, error = %err, "Failed to count records");
            0
        });
        let last_updated_record = self.store().last_updated(table).unwrap_or_else(|err| {
            warn!(table = %table, error = %err, "Failed to read last update time");
            None
        });
        TableStats {
            record_count,
            last_updated_record,
        }
    }

    fn describe(&self, role: &Role, table: &TableDef) -> TableDescription {
        let evaluator = PermissionEvaluator::new(role, self.catalog());
        TableDescription::new(table, self.table_stats(&table.table_ref()), |attribute| {
            evaluator.can_describe_attribute(table, attribute)
        })
    }

    // ========================================================================
    // Databases
    // ========================================================================

    pub(crate) fn op_create_database(&self, _caller: &Caller, request: &OperationRequest) -> Result<Value> {
        let name = request
            .database()
            .ok_or_else(|| HdbError::validation("'database' is required"))?;
        self.catalog().create_database(name)?;
        Ok(json!({ "message": format!("database '{name}' successfully created") }))
    }

    pub(crate) fn op_drop_database(&self, _caller: &Caller, request: &OperationRequest) -> Result<Value> {
        let name = request
            .database()
            .ok_or_else(|| HdbError::validation("'database' is required"))?;
        if name == SYSTEM_DATABASE {
            return Err(HdbError::ProtectedSystem);
        }
        let dropped = self.catalog().drop_database(name)?;
        for table in dropped.tables.values() {
            self.store().drop_table(&table.table_ref())?;
        }
        Ok(json!({ "message": format!("successfully deleted '{name}'") }))
    }

    // ========================================================================
    // Tables
    // ========================================================================

    pub(crate) fn op_create_table(&self, _caller: &Caller, request: &OperationRequest) -> Result<Value> {
        let table = request.table_ref(self.default_database())?;
        ensure_not_system(&table)?;
        let hash_attribute = request
            .str_field("hash_attribute")
            .or_else(|| request.str_field("primary_key"))
            .ok_or_else(|| HdbError::validation("'hash_attribute' is required"))?;
        let attributes = request
            .array_field("attributes")?
            .map(|values| values.iter().map(attribute_declaration).collect::<Result<Vec<_>>>())
            .transpose()?
            .unwrap_or_default();
        for attribute in &attributes {
            if let Some(source) = &attribute.computed {
                self.query_engine().computed().validate(source)?;
            }
        }

        let def = self.catalog().create_table(&table, hash_attribute, attributes)?;
        self.store().create_table(&table, &def.secondary_indexes())?;
        Ok(json!({ "message": format!("table '{table}' successfully created.") }))
    }

    pub(crate) fn op_drop_table(&self, _caller: &Caller, request: &OperationRequest) -> Result<Value> {
        let table = request.table_ref(self.default_database())?;
        ensure_not_system(&table)?;
        self.catalog().drop_table(&table)?;
        self.store().drop_table(&table)?;
        Ok(json!({ "message": format!("successfully deleted table '{table}'") }))
    }

    // ========================================================================
    // Attributes
    // ========================================================================

    pub(crate) fn op_create_attribute(&self, _caller: &Caller, request: &OperationRequest) -> Result<Value> {
        let table = request.table_ref(self.default_database())?;
        ensure_not_system(&table)?;
        let name = request.required_str("attribute")?;
        let indexed = request.bool_field("indexed")?.unwrap_or(false);
        let attribute = match computed_source(request.get("computed"))? {
            Some(source) => {
                self.query_engine().computed().validate(&source)?;
                AttributeDef::computed(name, source, indexed)
            }
            None if indexed => AttributeDef::indexed(name),
            None => AttributeDef::plain(name),
        };
        let materialized = attribute.computed.is_some() && indexed;

        self.catalog().create_attribute(&table, attribute)?;
        if materialized {
            self.backfill(&self.catalog().table(&table)?)?;
        }
        if indexed {
            self.store().create_index(&table, name)?;
        }
        Ok(json!({ "message": format!("attribute '{table}.{name}' successfully created.") }))
    }

    /// Stores materialized computed values on every existing record.
    fn backfill(&self, def: &TableDef) -> Result<()> {
        let table = def.table_ref();
        let mut failed = 0usize;
        for (key, _) in self.store().scan(&table)? {
            self.store().update_with(&table, &key, &mut |record: &mut Record| {
                let mut next = record.clone();
                match self.query_engine().materialize(def, &mut next) {
                    Ok(()) => *record = next,
                    Err(_) => failed += 1,
                }
            })?;
        }
        if failed > 0 {
            warn!(table = %table, failed, "Computed attribute could not be evaluated for some records");
        }
        Ok(())
    }

    pub(crate) fn op_drop_attribute(&self, _caller: &Caller, request: &OperationRequest) -> Result<Value> {
        let table = request.table_ref(self.default_database())?;
        ensure_not_system(&table)?;
        let name = request.required_str("attribute")?;
        self.catalog().drop_attribute(&table, name)?;
        let stripped = self.store().drop_attribute(&table, name)?;
        info!(table = %table, attribute = %name, records = stripped, "Attribute removed from records");
        Ok(json!({ "message": format!("successfully deleted attribute '{name}'") }))
    }

    // ========================================================================
    // Describe
    // ========================================================================

    pub(crate) fn op_describe_table(&self, caller: &Caller, request: &OperationRequest) -> Result<Value> {
        let table = request.table_ref(self.default_database())?;
        if table.is_system() && !caller.is_super_user() {
            return Err(HdbError::SystemMetadata);
        }
        let def = if caller.is_super_user() {
            self.catalog().table(&table)?
        } else {
            let evaluator = PermissionEvaluator::new(&caller.role, self.catalog());
            self.catalog()
                .table(&table)
                .ok()
                .filter(|def| evaluator.can_describe_table(def))
                .ok_or_else(|| HdbError::not_found(format!("Table '{table}' does not exist")))?
        };
        to_json(&self.describe(&caller.role, &def))
    }

    fn describe_visible_database(&self, caller: &Caller, database: &str) -> Result<DatabaseDescription> {
        let def = self.catalog().database(database)?;
        let evaluator = PermissionEvaluator::new(&caller.role, self.catalog());
        Ok(describe_database(&def, |table| {
            evaluator
                .can_describe_table(table)
                .then(|| self.describe(&caller.role, table))
        }))
    }

    pub(crate) fn op_describe_database(&self, caller: &Caller, request: &OperationRequest) -> Result<Value> {
        let database = request
            .database()
            .or(self.default_database())
            .ok_or_else(|| HdbError::validation("'database' is required"))?;
        if database == SYSTEM_DATABASE && !caller.is_super_user() {
            return Err(HdbError::SystemMetadata);
        }
        if !caller.is_super_user()
            && !PermissionEvaluator::new(&caller.role, self.catalog()).can_view_database(database)
        {
            return Err(HdbError::not_found(format!("database '{database}' does not exist")));
        }
        to_json(&self.describe_visible_database(caller, database)?)
    }

    pub(crate) fn op_describe_all(&self, caller: &Caller, _request: &OperationRequest) -> Result<Value> {
        let evaluator = PermissionEvaluator::new(&caller.role, self.catalog());
        let mut all: BTreeMap<String, DatabaseDescription> = BTreeMap::new();
        for database in self.catalog().databases()? {
            if database.name == SYSTEM_DATABASE || !evaluator.can_view_database(&database.name) {
                continue;
            }
            all.insert(
                database.name.clone(),
                self.describe_visible_database(caller, &database.name)?,
            );
        }
        to_json(&all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribute_declarations_decode() {
        assert_eq!(
            attribute_declaration(&json!("name")).unwrap(),
            AttributeDef::plain("name")
        );
        assert_eq!(
            attribute_declaration(&json!({"name": "age", "indexed": true})).unwrap(),
            AttributeDef::indexed("age")
        );
        assert_eq!(
            attribute_declaration(&json!({"name": "total", "computed": "price * 2", "indexed": true}))
                .unwrap(),
            AttributeDef::computed("total", ComputedSource::Formula("price * 2".into()), true)
        );
        assert_eq!(
            attribute_declaration(&json!({"name": "slug", "computed": {"callback": "slugify"}}))
                .unwrap(),
            AttributeDef::computed("slug", ComputedSource::Callback("slugify".into()), false)
        );
        assert!(attribute_declaration(&json!(3)).is_err());
        assert!(attribute_declaration(&json!({"indexed": true})).is_err());
    }
}
