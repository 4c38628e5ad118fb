//! `sql` and the NoSQL search operations.

use hdb_query::{SearchByConditions, SearchByHash, SearchByValue, Statement};
use hdb_rbac::{AccessRequest, PermissionEvaluator, ReadMask, TableAccess};
use hdb_types::{Record, TableRef, validate_attribute_name};
use serde_json::Value;
use tracing::debug;

use crate::{
    engine::Hdb,
    error::{HdbError, Result},
    mutation::{WriteAction, ensure_writable},
    operation::OperationRequest,
    users::Caller,
};

const SQL_MISSING: &str = "The 'sql' parameter is missing from the request body";

fn rows(records: Vec<Record>) -> Value {
    Value::Array(records.into_iter().map(Value::Object).collect())
}

impl Hdb {
    pub(crate) fn op_sql(&self, caller: &Caller, request: &OperationRequest) -> Result<Value> {
        let sql = request
            .str_field("sql")
            .ok_or_else(|| HdbError::validation(SQL_MISSING))?;
        let statement = self.query_engine().parse(sql)?;
        debug!(user = %caller.username, statement = statement.operation(), "SQL statement parsed");

        match &statement {
            Statement::Query(query) => {
                let access = self.query_engine().access_request(&statement)?;
                self.authorize(caller, &access)?;
                let tables = self.query_engine().read_tables(&statement)?;
                let mask = PermissionEvaluator::new(&caller.role, self.catalog()).read_mask(&tables);
                Ok(rows(self.query_engine().query(query, &mask)?))
            }
            Statement::Insert(insert) => {
                let table = self.query_engine().resolve_table(&insert.table)?;
                let records = self.query_engine().insert_records(insert)?;
                Ok(self
                    .write_records(caller, WriteAction::Insert, &table, records)?
                    .to_json())
            }
            Statement::Update(update) => {
                let table = self.query_engine().resolve_table(&update.table)?;
                ensure_writable(&table, true)?;
                for (attribute, _) in &update.assignments {
                    validate_attribute_name(attribute)?;
                }
                let access = self.query_engine().access_request(&statement)?;
                self.authorize(caller, &access)?;
                let def = self.catalog().table(&table)?;
                let mut changes = Vec::new();
                for (key, record) in self
                    .query_engine()
                    .matching_records(&table, update.selection.as_ref())?
                {
                    let mut changed = self.query_engine().assignments(&record, &update.assignments)?;
                    changed.insert(def.hash_attribute.clone(), key.to_json());
                    changes.push(changed);
                }
                Ok(self
                    .write_records(caller, WriteAction::Update, &table, changes)?
                    .to_json())
            }
            Statement::Delete(delete) => {
                let table = self.query_engine().resolve_table(&delete.table)?;
                ensure_writable(&table, false)?;
                let access = self.query_engine().access_request(&statement)?;
                self.authorize(caller, &access)?;
                let hashes: Vec<Value> = self
                    .query_engine()
                    .matching_records(&table, delete.selection.as_ref())?
                    .into_iter()
                    .map(|(key, _)| key.to_json())
                    .collect();
                Ok(self.delete_hashes(caller, &table, &hashes)?.to_json())
            }
        }
    }

    /// Authorizes a NoSQL search and returns the caller's read mask.
    fn authorize_search(
        &self,
        caller: &Caller,
        request: &OperationRequest,
        access: TableAccess,
    ) -> Result<ReadMask> {
        let table = access.table.clone();
        self.authorize(caller, &AccessRequest::data(request.name.clone(), [access]))?;
        let def = self.catalog().table(&table)?;
        Ok(PermissionEvaluator::new(&caller.role, self.catalog()).read_mask([&def]))
    }

    fn search_table(&self, request: &OperationRequest) -> Result<TableRef> {
        request.array_field("get_attributes")?;
        request.table_ref(self.default_database())
    }

    pub(crate) fn op_search_by_hash(&self, caller: &Caller, request: &OperationRequest) -> Result<Value> {
        request.array_field("hash_values")?;
        request.array_field("ids")?;
        let table = self.search_table(request)?;
        let search: SearchByHash = request.descriptor()?;
        let access = self
            .query_engine()
            .search_access(&table, &search.get_attributes, None);
        let mask = self.authorize_search(caller, request, access)?;
        Ok(rows(self.query_engine().search_by_hash(&table, &search, &mask)?))
    }

    pub(crate) fn op_search_by_value(&self, caller: &Caller, request: &OperationRequest) -> Result<Value> {
        let table = self.search_table(request)?;
        let search: SearchByValue = request.descriptor()?;
        let condition = search.condition();
        let access = self
            .query_engine()
            .search_access(&table, &search.get_attributes, Some(&condition));
        let mask = self.authorize_search(caller, request, access)?;
        Ok(rows(self.query_engine().search_by_value(&table, &search, &mask)?))
    }

    pub(crate) fn op_search_by_conditions(
        &self,
        caller: &Caller,
        request: &OperationRequest,
    ) -> Result<Value> {
        let table = self.search_table(request)?;
        request.array_field("conditions")?;
        let search: SearchByConditions = request.descriptor()?;
        let condition = search.root();
        condition.validate()?;
        let access = self
            .query_engine()
            .search_access(&table, &search.get_attributes, Some(&condition));
        let mask = self.authorize_search(caller, request, access)?;
        Ok(rows(self.query_engine().search_by_conditions(&table, &search, &mask)?))
    }
}
