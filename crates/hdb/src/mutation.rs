//! Mutation coordinator: insert, update, upsert and delete.
//!
//! Every write runs the same pipeline before touching the store:
//!
//! 1. `system` protection
//! 2. attribute-name validation over the whole batch
//! 3. timestamp protection
//! 4. authorization of the table and every written attribute
//! 5. hash-key resolution and schema-on-write registration
//!
//! Any failure in these steps aborts the request with nothing applied.
//! Records are then applied one key at a time; per-record outcomes
//! (duplicates, missing update targets) are reported in `skipped_hashes`.

use hdb_catalog::TableDef;
use hdb_query::QueryError;
use hdb_rbac::{AccessRequest, Permission, TableAccess};
use hdb_store::UpsertOutcome;
use hdb_types::{
    CREATED_TIME_ATTRIBUTE, HashKey, Record, TIMESTAMP_ATTRIBUTES, TableRef, Timestamp,
    UPDATED_TIME_ATTRIBUTE, WRITABLE_SYSTEM_TABLES, is_timestamp_attribute,
    validate_attribute_name,
};
use serde_json::{Map, Value, json};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    audit::AuditRecord,
    engine::Hdb,
    error::{HdbError, Result},
    operation::OperationRequest,
    users::Caller,
};

// ============================================================================
// Write actions
// ============================================================================

/// The three record-writing actions shared by NoSQL, SQL and bulk loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAction {
    Insert,
    Update,
    Upsert,
}

impl WriteAction {
    /// Parses a bulk-load `action` field; absent means insert.
    pub fn parse(action: Option<&str>) -> Result<Self> {
        match action {
            None | Some("insert") => Ok(WriteAction::Insert),
            Some("update") => Ok(WriteAction::Update),
            Some("upsert") => Ok(WriteAction::Upsert),
            Some(other) => Err(HdbError::validation(format!(
                "Invalid action '{other}', must be one of insert, update or upsert"
            ))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            WriteAction::Insert => "insert",
            WriteAction::Update => "update",
            WriteAction::Upsert => "upsert",
        }
    }

    fn past_tense(self) -> &'static str {
        match self {
            WriteAction::Insert => "inserted",
            WriteAction::Update => "updated",
            WriteAction::Upsert => "upserted",
        }
    }

    fn hashes_key(self) -> &'static str {
        match self {
            WriteAction::Insert => "inserted_hashes",
            WriteAction::Update => "update_hashes",
            WriteAction::Upsert => "upserted_hashes",
        }
    }

    /// Table and attribute permissions the action needs.
    fn permissions(self) -> &'static [Permission] {
        match self {
            WriteAction::Insert => &[Permission::Insert],
            WriteAction::Update => &[Permission::Update],
            WriteAction::Upsert => &[Permission::Insert, Permission::Update],
        }
    }
}

/// Outcome of one write request.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteSummary {
    pub action: WriteAction,
    pub applied: Vec<Value>,
    pub skipped: Vec<Value>,
    /// Denominator of the message. For updates only records that existed
    /// count.
    pub total: usize,
}

impl WriteSummary {
    pub fn message(&self) -> String {
        format!(
            "{} {} of {} records",
            self.action.past_tense(),
            self.applied.len(),
            self.total
        )
    }

    pub fn to_json(&self) -> Value {
        let mut body = Map::new();
        body.insert("message".into(), json!(self.message()));
        body.insert(self.action.hashes_key().into(), json!(self.applied));
        if self.action != WriteAction::Upsert || !self.skipped.is_empty() {
            body.insert("skipped_hashes".into(), json!(self.skipped));
        }
        Value::Object(body)
    }
}

/// Outcome of a delete request.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteSummary {
    pub deleted: Vec<Value>,
    pub skipped: Vec<Value>,
}

impl DeleteSummary {
    pub fn message(&self) -> String {
        let total = self.deleted.len() + self.skipped.len();
        let noun = if total == 1 { "record" } else { "records" };
        format!("{} of {total} {noun} successfully deleted", self.deleted.len())
    }

    pub fn to_json(&self) -> Value {
        json!({
            "message": self.message(),
            "deleted_hashes": self.deleted,
            "skipped_hashes": self.skipped,
        })
    }
}

/// Rejects writes to `system` tables outside the writable allowlist.
pub(crate) fn ensure_writable(table: &TableRef, allow_listed: bool) -> Result<()> {
    if table.is_system() && !(allow_listed && WRITABLE_SYSTEM_TABLES.contains(&table.table.as_str())) {
        return Err(HdbError::ProtectedSystem);
    }
    Ok(())
}

const UPDATE_HASH_REQUIRED: &str = "a valid hash attribute must be provided with update record";

/// The key a record is written under. `None` asks for a generated key:
/// the hash attribute is absent, null or empty. The text `"null"` is
/// rejected rather than generated.
fn write_key(hash_attribute: &str, record: &Record) -> Result<Option<HashKey>> {
    match record.get(hash_attribute) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) if text == "null" => Err(HdbError::validation(format!(
            "Invalid hash value for '{hash_attribute}': the string 'null' is not allowed"
        ))),
        Some(value) => Ok(Some(HashKey::from_json(value)?).filter(|key| !key.is_empty_text())),
    }
}

/// Copies `changes` onto `target`, leaving the hash attribute and both
/// timestamps to the caller.
fn merge_changes(target: &mut Record, changes: &Record, hash_attribute: &str) {
    for (name, value) in changes {
        if name == hash_attribute || is_timestamp_attribute(name) {
            continue;
        }
        target.insert(name.clone(), value.clone());
    }
}

// ============================================================================
// Pipeline
// ============================================================================

impl Hdb {
    /// Runs the request-level checks of a write without applying it:
    /// `system` protection, attribute names, timestamp protection and
    /// authorization. Returns the table definition.
    pub(crate) fn check_write(
        &self,
        caller: &Caller,
        action: WriteAction,
        table: &TableRef,
        records: &[Record],
    ) -> Result<TableDef> {
        ensure_writable(table, true)?;

        for record in records {
            for name in record.keys() {
                validate_attribute_name(name)?;
            }
        }
        if action == WriteAction::Insert
            && records
                .iter()
                .any(|record| record.keys().any(|name| is_timestamp_attribute(name)))
        {
            return Err(HdbError::ProtectedTimestamps);
        }

        let mut access = TableAccess::new(table.clone());
        for permission in action.permissions() {
            access.permissions.insert(*permission);
        }
        for record in records {
            for name in record.keys().filter(|name| !is_timestamp_attribute(name)) {
                for permission in action.permissions() {
                    access.add_attribute(name, *permission);
                }
            }
        }
        self.authorize(caller, &AccessRequest::data(action.name(), [access]))?;

        let def = self.catalog().table(table)?;
        for record in records {
            if write_key(&def.hash_attribute, record)?.is_none() && action == WriteAction::Update {
                return Err(HdbError::validation(UPDATE_HASH_REQUIRED));
            }
        }
        Ok(def)
    }

    /// Validates and authorizes a batch, registering new attributes.
    /// Returns the table definition and the keyed records.
    fn prepare_write(
        &self,
        caller: &Caller,
        action: WriteAction,
        table: &TableRef,
        mut records: Vec<Record>,
    ) -> Result<(TableDef, Vec<(HashKey, Record)>)> {
        let limit = self.config().operations.max_batch_records;
        if records.len() > limit {
            return Err(HdbError::validation(format!(
                "Batch of {} records exceeds the limit of {limit} records",
                records.len()
            )));
        }
        let def = self.check_write(caller, action, table, &records)?;
        if action != WriteAction::Insert {
            for record in &mut records {
                for name in TIMESTAMP_ATTRIBUTES {
                    record.remove(name);
                }
            }
        }

        let mut keyed = Vec::with_capacity(records.len());
        for mut record in records {
            let key = match (write_key(&def.hash_attribute, &record)?, action) {
                (Some(key), _) => key,
                (None, WriteAction::Update) => return Err(HdbError::validation(UPDATE_HASH_REQUIRED)),
                (None, _) => HashKey::Text(Uuid::new_v4().to_string()),
            };
            record.insert(def.hash_attribute.clone(), key.to_json());
            keyed.push((key, record));
        }

        let added = self.catalog().ensure_attributes(
            table,
            keyed
                .iter()
                .flat_map(|(_, record)| record.keys().map(String::as_str))
                .chain(TIMESTAMP_ATTRIBUTES.iter().copied()),
        )?;
        if !added.is_empty() {
            debug!(table = %table, attributes = ?added, "Attributes registered on write");
        }
        let def = self.catalog().table(table)?;
        for (_, record) in &mut keyed {
            record.retain(|name, _| !def.is_computed(name));
        }
        Ok((def, keyed))
    }

    /// Resolves `key` to the stored key, trying the loose numeric/text
    /// alternative when the exact key is absent.
    fn stored_key(&self, table: &TableRef, key: HashKey) -> Result<Option<HashKey>> {
        if self.store().get(table, &key)?.is_some() {
            return Ok(Some(key));
        }
        if let Some(alternative) = key.loose_alternative() {
            if self.store().get(table, &alternative)?.is_some() {
                return Ok(Some(alternative));
            }
        }
        Ok(None)
    }

    /// Runs the full write pipeline for a batch.
    pub(crate) fn write_records(
        &self,
        caller: &Caller,
        action: WriteAction,
        table: &TableRef,
        records: Vec<Record>,
    ) -> Result<WriteSummary> {
        let (def, keyed) = self.prepare_write(caller, action, table, records)?;
        let total = keyed.len();
        let mut summary = WriteSummary {
            action,
            applied: Vec::new(),
            skipped: Vec::new(),
            total,
        };
        let mut written = Vec::new();

        for (key, record) in keyed {
            let hash = key.to_json();
            let stored = match action {
                WriteAction::Insert => self.apply_insert(&def, key, record)?,
                WriteAction::Update => match self.stored_key(table, key)? {
                    Some(key) => self.apply_update(&def, &key, &record)?,
                    None => {
                        summary.total -= 1;
                        None
                    }
                },
                WriteAction::Upsert => {
                    let key = self.stored_key(table, key.clone())?.unwrap_or(key);
                    Some(self.apply_upsert(&def, key, &record)?)
                }
            };
            match stored {
                Some(record) => {
                    summary.applied.push(hash);
                    written.push(record);
                }
                None => summary.skipped.push(hash),
            }
        }

        info!(
            table = %table,
            action = action.name(),
            user = %caller.username,
            applied = summary.applied.len(),
            skipped = summary.skipped.len(),
            "Records written"
        );
        if !summary.applied.is_empty() {
            self.audit().emit(AuditRecord {
                timestamp: Timestamp::now(),
                user: caller.username.clone(),
                operation: action.name().to_string(),
                table: table.clone(),
                hash_values: summary.applied.clone(),
                records: Some(written),
            });
        }
        Ok(summary)
    }

    fn apply_insert(&self, def: &TableDef, key: HashKey, mut record: Record) -> Result<Option<Record>> {
        let table = def.table_ref();
        if key
            .loose_alternative()
            .map(|alt| self.store().get(&table, &alt))
            .transpose()?
            .flatten()
            .is_some()
        {
            return Ok(None);
        }
        let now = Timestamp::now_monotonic().to_json();
        record.insert(CREATED_TIME_ATTRIBUTE.to_string(), now.clone());
        record.insert(UPDATED_TIME_ATTRIBUTE.to_string(), now);
        self.query_engine().materialize(def, &mut record)?;
        let inserted = self.store().insert_if_absent(&table, key, record.clone())?;
        Ok(inserted.then_some(record))
    }

    fn apply_update(&self, def: &TableDef, key: &HashKey, changes: &Record) -> Result<Option<Record>> {
        let mut failure: Option<QueryError> = None;
        let updated = self.store().update_with(&def.table_ref(), key, &mut |current: &mut Record| {
            let mut next = current.clone();
            merge_changes(&mut next, changes, &def.hash_attribute);
            next.insert(
                UPDATED_TIME_ATTRIBUTE.to_string(),
                Timestamp::now_monotonic().to_json(),
            );
            match self.query_engine().materialize(def, &mut next) {
                Ok(()) => *current = next,
                Err(err) => failure = Some(err),
            }
        })?;
        if let Some(err) = failure {
            return Err(err.into());
        }
        Ok(updated)
    }

    fn apply_upsert(&self, def: &TableDef, key: HashKey, changes: &Record) -> Result<Record> {
        let table = def.table_ref();
        let mut failure: Option<QueryError> = None;
        let mut result = Record::new();
        let outcome = self.store().upsert_with(&table, key.clone(), &mut |existing: Option<&Record>| {
            let now = Timestamp::now_monotonic().to_json();
            let mut next = existing.cloned().unwrap_or_default();
            merge_changes(&mut next, changes, &def.hash_attribute);
            next.insert(def.hash_attribute.clone(), key.to_json());
            let created = existing
                .and_then(|record| record.get(CREATED_TIME_ATTRIBUTE).cloned())
                .unwrap_or_else(|| now.clone());
            next.insert(CREATED_TIME_ATTRIBUTE.to_string(), created);
            next.insert(UPDATED_TIME_ATTRIBUTE.to_string(), now);
            if let Err(err) = self.query_engine().materialize(def, &mut next) {
                failure = Some(err);
                return existing.cloned().unwrap_or(next);
            }
            result = next.clone();
            next
        })?;
        if let Some(err) = failure {
            if outcome == UpsertOutcome::Inserted {
                self.store().delete(&table, &key)?;
            }
            return Err(err.into());
        }
        Ok(result)
    }

    /// Deletes records by hash value. The caller has been authorized.
    pub(crate) fn delete_hashes(
        &self,
        caller: &Caller,
        table: &TableRef,
        hashes: &[Value],
    ) -> Result<DeleteSummary> {
        let mut summary = DeleteSummary {
            deleted: Vec::new(),
            skipped: Vec::new(),
        };
        let mut removed = Vec::new();
        for hash in hashes {
            let key = match HashKey::from_json(hash) {
                Ok(key) => self.stored_key(table, key)?,
                Err(_) => None,
            };
            match key.map(|key| self.store().delete(table, &key)).transpose()?.flatten() {
                Some(record) => {
                    summary.deleted.push(hash.clone());
                    removed.push(record);
                }
                None => summary.skipped.push(hash.clone()),
            }
        }
        info!(
            table = %table,
            user = %caller.username,
            deleted = summary.deleted.len(),
            skipped = summary.skipped.len(),
            "Records deleted"
        );
        if !summary.deleted.is_empty() {
            self.audit().emit(AuditRecord {
                timestamp: Timestamp::now(),
                user: caller.username.clone(),
                operation: "delete".to_string(),
                table: table.clone(),
                hash_values: summary.deleted.clone(),
                records: Some(removed),
            });
        }
        Ok(summary)
    }

    // ========================================================================
    // Operations
    // ========================================================================

    fn op_write(&self, caller: &Caller, request: &OperationRequest, action: WriteAction) -> Result<Value> {
        let table = request.table_ref(self.default_database())?;
        let records = request.records()?;
        Ok(self.write_records(caller, action, &table, records)?.to_json())
    }

    pub(crate) fn op_insert(&self, caller: &Caller, request: &OperationRequest) -> Result<Value> {
        self.op_write(caller, request, WriteAction::Insert)
    }

    pub(crate) fn op_update(&self, caller: &Caller, request: &OperationRequest) -> Result<Value> {
        self.op_write(caller, request, WriteAction::Update)
    }

    pub(crate) fn op_upsert(&self, caller: &Caller, request: &OperationRequest) -> Result<Value> {
        self.op_write(caller, request, WriteAction::Upsert)
    }

    pub(crate) fn op_delete(&self, caller: &Caller, request: &OperationRequest) -> Result<Value> {
        let table = request.table_ref(self.default_database())?;
        ensure_writable(&table, false)?;
        let hashes = match request.array_field("hash_values")? {
            Some(values) => values,
            None => request
                .array_field("ids")?
                .ok_or_else(|| HdbError::validation("'hash_values' is required"))?,
        };
        let access = TableAccess::new(table.clone()).require(Permission::Delete);
        self.authorize(caller, &AccessRequest::data(request.name.clone(), [access]))?;
        self.catalog().table(&table)?;
        Ok(self.delete_hashes(caller, &table, hashes)?.to_json())
    }
}
