//! Users, roles and caller identity.
//!
//! Roles live in `system.hdb_role`, users in `system.hdb_user`. Passwords
//! are stored as salted SHA-256 digests and never returned.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use hdb_rbac::{AnySchema, Role, RolePermissions, validate_permissions};
use hdb_types::{
    CREATED_TIME_ATTRIBUTE, HashKey, ROLE_TABLE, Record, SYSTEM_DATABASE, TableRef, Timestamp,
    UPDATED_TIME_ATTRIBUTE, USER_TABLE,
};
use rand::RngCore;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;

use crate::{
    engine::Hdb,
    error::{HdbError, Result},
    operation::OperationRequest,
};

const SUPER_USER_ROLE: &str = "super_user";
const PASSWORD_SCHEME: &str = "sha256";
const LOGIN_FAILED: &str = "Login failed";

// ============================================================================
// Caller identity
// ============================================================================

/// The authenticated identity an operation runs as.
#[derive(Debug, Clone, PartialEq)]
pub struct Caller {
    pub username: String,
    pub role: Role,
}

impl Caller {
    pub fn new(username: impl Into<String>, role: Role) -> Self {
        Self {
            username: username.into(),
            role,
        }
    }

    pub fn is_super_user(&self) -> bool {
        self.role.is_super_user()
    }
}

// ============================================================================
// Passwords
// ============================================================================

fn digest(salt: &[u8], password: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hasher.finalize().to_vec()
}

/// Hashes a password as `sha256$<salt>$<digest>` (base64 parts).
pub(crate) fn hash_password(password: &str) -> String {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    format!(
        "{PASSWORD_SCHEME}${}${}",
        STANDARD.encode(salt),
        STANDARD.encode(digest(&salt, password))
    )
}

pub(crate) fn verify_password(stored: &str, password: &str) -> bool {
    let mut parts = stored.split('$');
    let (Some(PASSWORD_SCHEME), Some(salt), Some(expected), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    let (Ok(salt), Ok(expected)) = (STANDARD.decode(salt), STANDARD.decode(expected)) else {
        return false;
    };
    let actual = digest(&salt, password);
    actual.len() == expected.len()
        && actual
            .iter()
            .zip(&expected)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

fn role_table() -> TableRef {
    TableRef::new(SYSTEM_DATABASE, ROLE_TABLE)
}

fn user_table() -> TableRef {
    TableRef::new(SYSTEM_DATABASE, USER_TABLE)
}

fn without_password(mut user: Record) -> Record {
    user.remove("password");
    user
}

// ============================================================================
// System record access
// ============================================================================

impl Hdb {
    /// Creates or merges a system record, stamping its timestamps.
    pub(crate) fn put_system_record(&self, table: &TableRef, key: HashKey, mut record: Record) -> Result<()> {
        let names: Vec<String> = record.keys().cloned().collect();
        self.catalog()
            .ensure_attributes(table, names.iter().map(String::as_str))?;
        let now = Timestamp::now_monotonic();
        self.store().upsert_with(table, key, &mut |existing: Option<&Record>| {
            let created = existing
                .and_then(|old| old.get(CREATED_TIME_ATTRIBUTE).cloned())
                .unwrap_or_else(|| now.to_json());
            let mut next = existing.cloned().unwrap_or_default();
            for (name, value) in std::mem::take(&mut record) {
                next.insert(name, value);
            }
            next.insert(CREATED_TIME_ATTRIBUTE.to_string(), created);
            next.insert(UPDATED_TIME_ATTRIBUTE.to_string(), now.to_json());
            next
        })?;
        Ok(())
    }

    fn system_records(&self, table: &TableRef) -> Result<Vec<Record>> {
        Ok(self
            .store()
            .scan(table)?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }

    fn find_role_by_name(&self, name: &str) -> Result<Option<Record>> {
        Ok(self
            .system_records(&role_table())?
            .into_iter()
            .find(|role| role.get("role").and_then(Value::as_str) == Some(name)))
    }

    fn role_record(&self, id: &str) -> Result<Option<Record>> {
        Ok(self
            .store()
            .get(&role_table(), &HashKey::Text(id.to_string()))?)
    }

    fn user_record(&self, username: &str) -> Result<Option<Record>> {
        Ok(self
            .store()
            .get(&user_table(), &HashKey::Text(username.to_string()))?)
    }

    /// Rebuilds a role from its stored record. Stored permissions were
    /// validated when written; tables dropped since then are tolerated.
    fn role_from_record(record: &Record) -> Result<Role> {
        let id = record.get("id").and_then(Value::as_str).unwrap_or_default();
        let name = record.get("role").and_then(Value::as_str).unwrap_or_default();
        let permission = record.get("permission").cloned().unwrap_or(Value::Null);
        let permissions = validate_permissions(&permission, &AnySchema)
            .map_err(|err| HdbError::internal(format!("stored role '{name}' is invalid: {err}")))?;
        Ok(Role::new(id, name, permissions))
    }

    /// Expands a user record's role id into the role object.
    fn user_view(&self, user: Record) -> Result<Value> {
        let mut user = without_password(user);
        if let Some(role_id) = user.get("role").and_then(Value::as_str).map(str::to_string) {
            if let Some(role) = self.role_record(&role_id)? {
                user.insert("role".into(), Value::Object(role));
            }
        }
        Ok(Value::Object(user))
    }

    // ========================================================================
    // Bootstrap and identity
    // ========================================================================

    /// Creates the `super_user` role and the default super user when missing.
    pub(crate) fn bootstrap_users(&self) -> Result<()> {
        let role_id = match self.find_role_by_name(SUPER_USER_ROLE)? {
            Some(role) => role
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or(SUPER_USER_ROLE)
                .to_string(),
            None => {
                let role = Role::new(SUPER_USER_ROLE, SUPER_USER_ROLE, RolePermissions::super_user());
                let Value::Object(record) = role.to_json() else {
                    return Err(HdbError::internal("role did not render as an object"));
                };
                self.put_system_record(&role_table(), HashKey::Text(role.id.clone()), record)?;
                role.id
            }
        };
        let username = self.config().auth.default_super_user.clone();
        if self.user_record(&username)?.is_none() {
            let mut user = Record::new();
            user.insert("username".into(), json!(username));
            user.insert("role".into(), json!(role_id));
            user.insert("active".into(), json!(true));
            self.put_system_record(&user_table(), HashKey::Text(username.clone()), user)?;
            info!(username = %username, "Default super user created");
        }
        Ok(())
    }

    /// Resolves a stored user into a caller, without checking a password.
    /// Used by transports that authenticated the caller themselves.
    pub fn caller(&self, username: &str) -> Result<Caller> {
        let user = self
            .user_record(username)?
            .ok_or_else(|| HdbError::Authentication(LOGIN_FAILED.to_string()))?;
        if user.get("active").and_then(Value::as_bool) == Some(false) {
            return Err(HdbError::Authentication(LOGIN_FAILED.to_string()));
        }
        let role_id = user.get("role").and_then(Value::as_str).unwrap_or_default();
        let role = self
            .role_record(role_id)?
            .ok_or_else(|| HdbError::Authentication(LOGIN_FAILED.to_string()))?;
        Ok(Caller::new(username, Self::role_from_record(&role)?))
    }

    /// Validates basic credentials.
    pub fn authenticate(&self, username: &str, password: &str) -> Result<Caller> {
        let user = self
            .user_record(username)?
            .ok_or_else(|| HdbError::Authentication(LOGIN_FAILED.to_string()))?;
        let stored = user.get("password").and_then(Value::as_str).unwrap_or_default();
        if !verify_password(stored, password) {
            return Err(HdbError::Authentication(LOGIN_FAILED.to_string()));
        }
        self.caller(username)
    }

    /// The default super user.
    pub fn super_user(&self) -> Result<Caller> {
        self.caller(&self.config().auth.default_super_user)
    }

    // ========================================================================
    // Roles
    // ========================================================================

    pub(crate) fn op_add_role(&self, _caller: &Caller, request: &OperationRequest) -> Result<Value> {
        let name = request.required_str("role")?;
        let permission = request
            .get("permission")
            .ok_or_else(|| HdbError::validation("'permission' is required"))?;
        let permissions = validate_permissions(permission, self.catalog())?;
        if self.find_role_by_name(name)?.is_some() {
            return Err(HdbError::Conflict(format!(
                "A role with name '{name}' already exists"
            )));
        }
        let id = request
            .str_field("id")
            .map_or_else(|| Uuid::new_v4().to_string(), str::to_string);
        let role = Role::new(id, name, permissions);
        let Value::Object(record) = role.to_json() else {
            return Err(HdbError::internal("role did not render as an object"));
        };
        let key = HashKey::Text(role.id.clone());
        self.put_system_record(&role_table(), key.clone(), record)?;
        info!(role = %name, "Role added");
        let stored = self.store().get(&role_table(), &key)?.unwrap_or_default();
        Ok(Value::Object(stored))
    }

    pub(crate) fn op_alter_role(&self, _caller: &Caller, request: &OperationRequest) -> Result<Value> {
        let id = request.required_str("id")?;
        let existing = self
            .role_record(id)?
            .ok_or_else(|| HdbError::not_found(format!("Role with id '{id}' not found")))?;
        let permission = request
            .get("permission")
            .ok_or_else(|| HdbError::validation("'permission' is required"))?;
        let permissions = validate_permissions(permission, self.catalog())?;
        let current_name = existing.get("role").and_then(Value::as_str).unwrap_or_default();
        let name = request.str_field("role").unwrap_or(current_name).to_string();
        if name != current_name {
            if let Some(other) = self.find_role_by_name(&name)? {
                if other.get("id").and_then(Value::as_str) != Some(id) {
                    return Err(HdbError::Conflict(format!(
                        "A role with name '{name}' already exists"
                    )));
                }
            }
        }
        let role = Role::new(id, &name, permissions);
        let Value::Object(record) = role.to_json() else {
            return Err(HdbError::internal("role did not render as an object"));
        };
        let key = HashKey::Text(id.to_string());
        self.put_system_record(&role_table(), key.clone(), record)?;
        info!(role = %name, "Role altered");
        let stored = self.store().get(&role_table(), &key)?.unwrap_or_default();
        Ok(Value::Object(stored))
    }

    pub(crate) fn op_drop_role(&self, _caller: &Caller, request: &OperationRequest) -> Result<Value> {
        let id = request.required_str("id")?;
        let role = self
            .role_record(id)?
            .ok_or_else(|| HdbError::not_found(format!("Role with id '{id}' not found")))?;
        let name = role.get("role").and_then(Value::as_str).unwrap_or_default();
        let users = self
            .system_records(&user_table())?
            .into_iter()
            .filter(|user| user.get("role").and_then(Value::as_str) == Some(id))
            .count();
        if users > 0 {
            return Err(HdbError::Conflict(format!(
                "Cannot drop role '{name}' as it has {users} associated user(s)"
            )));
        }
        self.store().delete(&role_table(), &HashKey::Text(id.to_string()))?;
        info!(role = %name, "Role dropped");
        Ok(json!({ "message": format!("{name} successfully deleted") }))
    }

    pub(crate) fn op_list_roles(&self, _caller: &Caller, _request: &OperationRequest) -> Result<Value> {
        Ok(Value::Array(
            self.system_records(&role_table())?
                .into_iter()
                .map(Value::Object)
                .collect(),
        ))
    }

    // ========================================================================
    // Users
    // ========================================================================

    fn role_id_by_name(&self, name: &str) -> Result<String> {
        self.find_role_by_name(name)?
            .and_then(|role| role.get("id").and_then(Value::as_str).map(str::to_string))
            .ok_or_else(|| HdbError::not_found(format!("Role '{name}' not found")))
    }

    pub(crate) fn op_add_user(&self, _caller: &Caller, request: &OperationRequest) -> Result<Value> {
        let username = request.required_str("username")?;
        let password = request.required_str("password")?;
        let role_id = self.role_id_by_name(request.required_str("role")?)?;
        let active = request.bool_field("active")?.unwrap_or(true);
        if self.user_record(username)?.is_some() {
            return Err(HdbError::Conflict(format!("User {username} already exists")));
        }
        let mut user = Record::new();
        user.insert("username".into(), json!(username));
        user.insert("password".into(), json!(hash_password(password)));
        user.insert("role".into(), json!(role_id));
        user.insert("active".into(), json!(active));
        self.put_system_record(&user_table(), HashKey::Text(username.to_string()), user)?;
        info!(username = %username, "User added");
        Ok(json!({ "message": format!("{username} successfully added") }))
    }

    pub(crate) fn op_alter_user(&self, _caller: &Caller, request: &OperationRequest) -> Result<Value> {
        let username = request.required_str("username")?;
        if self.user_record(username)?.is_none() {
            return Err(HdbError::not_found(format!("User '{username}' not found")));
        }
        let mut changes = Record::new();
        if let Some(password) = request.str_field("password") {
            changes.insert("password".into(), json!(hash_password(password)));
        }
        if let Some(role) = request.str_field("role") {
            changes.insert("role".into(), json!(self.role_id_by_name(role)?));
        }
        if let Some(active) = request.bool_field("active")? {
            changes.insert("active".into(), json!(active));
        }
        self.put_system_record(&user_table(), HashKey::Text(username.to_string()), changes)?;
        info!(username = %username, "User altered");
        Ok(json!({
            "message": "updated 1 of 1 records",
            "update_hashes": [username],
            "skipped_hashes": [],
        }))
    }

    pub(crate) fn op_drop_user(&self, _caller: &Caller, request: &OperationRequest) -> Result<Value> {
        let username = request.required_str("username")?;
        if self
            .store()
            .delete(&user_table(), &HashKey::Text(username.to_string()))?
            .is_none()
        {
            return Err(HdbError::not_found(format!("User '{username}' not found")));
        }
        info!(username = %username, "User dropped");
        Ok(json!({ "message": format!("{username} successfully deleted") }))
    }

    pub(crate) fn op_list_users(&self, _caller: &Caller, _request: &OperationRequest) -> Result<Value> {
        self.system_records(&user_table())?
            .into_iter()
            .map(|user| self.user_view(user))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array)
    }

    pub(crate) fn op_user_info(&self, caller: &Caller, _request: &OperationRequest) -> Result<Value> {
        match self.user_record(&caller.username)? {
            Some(user) => self.user_view(user),
            None => Ok(json!({
                "username": caller.username,
                "role": caller.role.to_json(),
            })),
        }
    }
}
