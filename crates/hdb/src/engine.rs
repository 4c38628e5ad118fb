//! The `Hdb` engine: construction, request execution and dispatch.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use hdb_catalog::Catalog;
use hdb_config::HdbConfig;
use hdb_query::{ComputedFn, ComputedRegistry, QueryEngine};
use hdb_rbac::{AccessRequest, PermissionEvaluator};
use hdb_store::{MemoryStore, RecordStore, StoreError};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    audit::{AuditSink, MemoryAuditSink},
    error::{HdbError, Result},
    jobs::{JobHandle, JobRunner, ObjectTransport},
    operation::{OperationKind, OperationRequest},
    users::Caller,
};

// ============================================================================
// Responses
// ============================================================================

/// Result of one operation: an HTTP-style status and a JSON body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationResponse {
    pub status: u16,
    pub body: Value,
}

impl OperationResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    pub fn error(err: &HdbError) -> Self {
        Self {
            status: err.status(),
            body: err.to_body(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == 200
    }
}

// ============================================================================
// Engine
// ============================================================================

pub(crate) struct Inner {
    pub(crate) config: HdbConfig,
    pub(crate) project_dir: Option<PathBuf>,
    pub(crate) catalog: Arc<Catalog>,
    pub(crate) store: Arc<dyn RecordStore>,
    pub(crate) engine: QueryEngine,
    pub(crate) audit: Arc<dyn AuditSink>,
    pub(crate) transport: Option<Arc<dyn ObjectTransport>>,
    pub(crate) jobs: JobRunner,
    pub(crate) started: Instant,
}

/// The operations engine.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Hdb {
    pub(crate) inner: Arc<Inner>,
}

impl std::fmt::Debug for Hdb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hdb")
            .field("project_dir", &self.inner.project_dir)
            .field("engine", &self.inner.engine)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Hdb`].
pub struct HdbBuilder {
    config: HdbConfig,
    project_dir: Option<PathBuf>,
    store: Option<Arc<dyn RecordStore>>,
    audit: Option<Arc<dyn AuditSink>>,
    transport: Option<Arc<dyn ObjectTransport>>,
    callbacks: Vec<(String, ComputedFn)>,
}

impl HdbBuilder {
    /// Directory whose `hdb.local.toml` receives `set_configuration` changes.
    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Uses `store` instead of a fresh [`MemoryStore`].
    pub fn with_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Transport for `csv_url_load`, `import_from_s3` and `export_to_s3`.
    pub fn with_transport(mut self, transport: Arc<dyn ObjectTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Registers a computed attribute callback.
    pub fn with_computed_callback(mut self, name: impl Into<String>, callback: ComputedFn) -> Self {
        self.callbacks.push((name.into(), callback));
        self
    }

    pub fn build(self) -> Result<Hdb> {
        let config = self.config;
        config.validate()?;

        let catalog = if config.storage.persist_catalog {
            fs::create_dir_all(&config.storage.data_dir).map_err(|err| {
                HdbError::internal(format!(
                    "Failed to create data directory {}: {err}",
                    config.storage.data_dir.display()
                ))
            })?;
            Catalog::open(config.catalog_file())?
        } else {
            Catalog::new()
        };
        catalog.ensure_system_tables()?;
        let catalog = Arc::new(catalog);

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn RecordStore>);
        for database in catalog.databases()? {
            for table in database.tables.values() {
                match store.create_table(&table.table_ref(), &table.secondary_indexes()) {
                    Ok(()) | Err(StoreError::TableExists(_)) => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }

        let computed = ComputedRegistry::new();
        for (name, callback) in self.callbacks {
            computed.register(name, callback);
        }
        let mut engine =
            QueryEngine::new(Arc::clone(&catalog), Arc::clone(&store)).with_computed(Arc::new(computed));
        if let Some(database) = &config.operations.default_database {
            engine = engine.with_default_database(database.clone());
        }

        let jobs = JobRunner::new(config.jobs.max_concurrent_jobs);
        let hdb = Hdb {
            inner: Arc::new(Inner {
                config,
                project_dir: self.project_dir,
                catalog,
                store,
                engine,
                audit: self
                    .audit
                    .unwrap_or_else(|| Arc::new(MemoryAuditSink::new()) as Arc<dyn AuditSink>),
                transport: self.transport,
                jobs,
                started: Instant::now(),
            }),
        };
        hdb.bootstrap_users()?;
        info!(
            default_database = ?hdb.inner.config.operations.default_database,
            persist_catalog = hdb.inner.config.storage.persist_catalog,
            "hdb started"
        );
        Ok(hdb)
    }
}

/// Handler signature shared by every operation.
type Handler = fn(&Hdb, &Caller, &OperationRequest) -> Result<Value>;

impl Hdb {
    pub fn builder(config: HdbConfig) -> HdbBuilder {
        HdbBuilder {
            config,
            project_dir: None,
            store: None,
            audit: None,
            transport: None,
            callbacks: Vec::new(),
        }
    }

    pub fn open(config: HdbConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// An engine with in-memory catalog and store.
    pub fn in_memory() -> Result<Self> {
        Self::open(HdbConfig::in_memory())
    }

    pub fn config(&self) -> &HdbConfig {
        &self.inner.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.inner.catalog
    }

    pub fn store(&self) -> &dyn RecordStore {
        self.inner.store.as_ref()
    }

    pub fn query_engine(&self) -> &QueryEngine {
        &self.inner.engine
    }

    pub fn audit(&self) -> &dyn AuditSink {
        self.inner.audit.as_ref()
    }

    pub(crate) fn default_database(&self) -> Option<&str> {
        self.inner.engine.default_database()
    }

    /// Handle of a job started by this engine, for awaiting its end.
    pub fn job(&self, id: &str) -> Option<JobHandle> {
        self.inner.jobs.handle(id)
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Executes one operation on behalf of `caller`.
    ///
    /// The operation runs on the blocking pool. Job operations return as
    /// soon as the job is registered.
    pub async fn execute(&self, caller: &Caller, request: Value) -> OperationResponse {
        let hdb = self.clone();
        let caller = caller.clone();
        match tokio::task::spawn_blocking(move || hdb.execute_blocking(&caller, request)).await {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "Operation task failed");
                OperationResponse::error(&HdbError::internal(format!("operation failed: {err}")))
            }
        }
    }

    /// Synchronous form of [`Hdb::execute`]. Job operations still need a
    /// tokio runtime.
    pub fn execute_blocking(&self, caller: &Caller, request: Value) -> OperationResponse {
        let result = OperationRequest::decode(request).and_then(|request| {
            debug!(operation = %request.name, user = %caller.username, "Executing operation");
            self.dispatch(caller, &request)
        });
        match result {
            Ok(body) => OperationResponse::ok(body),
            Err(err) => {
                let status = err.status();
                if status >= 500 {
                    warn!(user = %caller.username, status, error = %err, "Operation failed");
                } else {
                    debug!(user = %caller.username, status, error = %err, "Operation rejected");
                }
                OperationResponse::error(&err)
            }
        }
    }

    /// Runs a decoded request: operation-level gate, then the handler.
    pub(crate) fn dispatch(&self, caller: &Caller, request: &OperationRequest) -> Result<Value> {
        self.gate(caller, request)?;
        handler(request.kind)(self, caller, request)
    }

    /// Checks operations restricted to super users or structure users.
    /// Data operations are authorized by their handlers.
    fn gate(&self, caller: &Caller, request: &OperationRequest) -> Result<()> {
        use OperationKind as Op;

        let name = request.name.clone();
        let access = match request.kind {
            Op::CreateDatabase | Op::DropDatabase => AccessRequest::structure(name, None),
            Op::CreateTable | Op::DropTable | Op::CreateAttribute | Op::DropAttribute => {
                let database = request
                    .database()
                    .or(self.default_database())
                    .map(str::to_string);
                AccessRequest::structure(name, database)
            }
            Op::AddRole
            | Op::AlterRole
            | Op::DropRole
            | Op::ListRoles
            | Op::AddUser
            | Op::AlterUser
            | Op::DropUser
            | Op::ListUsers
            | Op::SystemInformation
            | Op::GetConfiguration
            | Op::SetConfiguration
            | Op::SearchJobsByStartDate
            | Op::DeleteFilesBefore
            | Op::DeleteAuditLogsBefore
            | Op::ReadAuditLog
            | Op::ExportLocal => AccessRequest::super_user(name),
            _ => return Ok(()),
        };
        self.authorize(caller, &access)
    }

    /// Evaluates `access` for `caller`.
    pub(crate) fn authorize(&self, caller: &Caller, access: &AccessRequest) -> Result<()> {
        let verdict = PermissionEvaluator::new(&caller.role, self.catalog()).authorize(access);
        if verdict.is_authorized() {
            Ok(())
        } else {
            Err(HdbError::Unauthorized(verdict))
        }
    }
}

/// Dispatch table from operation to handler.
fn handler(kind: OperationKind) -> Handler {
    use OperationKind as Op;

    match kind {
        Op::Sql => Hdb::op_sql,
        Op::Insert => Hdb::op_insert,
        Op::Update => Hdb::op_update,
        Op::Upsert => Hdb::op_upsert,
        Op::Delete => Hdb::op_delete,
        Op::SearchByHash => Hdb::op_search_by_hash,
        Op::SearchByValue => Hdb::op_search_by_value,
        Op::SearchByConditions => Hdb::op_search_by_conditions,
        Op::CreateDatabase => Hdb::op_create_database,
        Op::DropDatabase => Hdb::op_drop_database,
        Op::CreateTable => Hdb::op_create_table,
        Op::DropTable => Hdb::op_drop_table,
        Op::CreateAttribute => Hdb::op_create_attribute,
        Op::DropAttribute => Hdb::op_drop_attribute,
        Op::DescribeTable => Hdb::op_describe_table,
        Op::DescribeDatabase => Hdb::op_describe_database,
        Op::DescribeAll => Hdb::op_describe_all,
        Op::AddRole => Hdb::op_add_role,
        Op::AlterRole => Hdb::op_alter_role,
        Op::DropRole => Hdb::op_drop_role,
        Op::ListRoles => Hdb::op_list_roles,
        Op::AddUser => Hdb::op_add_user,
        Op::AlterUser => Hdb::op_alter_user,
        Op::DropUser => Hdb::op_drop_user,
        Op::ListUsers => Hdb::op_list_users,
        Op::UserInfo => Hdb::op_user_info,
        Op::CsvDataLoad => Hdb::op_csv_data_load,
        Op::CsvFileLoad => Hdb::op_csv_file_load,
        Op::CsvUrlLoad => Hdb::op_csv_url_load,
        Op::ImportFromS3 => Hdb::op_import_from_s3,
        Op::ExportToS3 => Hdb::op_export_to_s3,
        Op::ExportLocal => Hdb::op_export_local,
        Op::GetJob => Hdb::op_get_job,
        Op::SearchJobsByStartDate => Hdb::op_search_jobs_by_start_date,
        Op::DeleteFilesBefore => Hdb::op_delete_files_before,
        Op::DeleteAuditLogsBefore => Hdb::op_delete_audit_logs_before,
        Op::ReadAuditLog => Hdb::op_read_audit_log,
        Op::SystemInformation => Hdb::op_system_information,
        Op::GetConfiguration => Hdb::op_get_configuration,
        Op::SetConfiguration => Hdb::op_set_configuration,
    }
}
