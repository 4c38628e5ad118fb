//! Bulk job pipeline.
//!
//! Job operations validate their request shape synchronously, record an
//! `IN_PROGRESS` job in `system.hdb_job` and return its id at once. The work
//! then runs on the blocking pool, bounded by `jobs.max_concurrent_jobs`,
//! and ends in `COMPLETE` or `ERROR`. Terminal states are final.
//!
//! Callers outside the engine poll `get_job`; in-process callers can await
//! [`JobHandle::wait`].

mod export;
mod load;
mod transport;

pub use load::parse_csv;
pub use transport::{MemoryTransport, ObjectLocation, ObjectTransport, S3Location, TransportError};

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use hdb_types::{HashKey, JOB_TABLE, Record, SYSTEM_DATABASE, TableRef, Timestamp};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::{
    runtime::Handle,
    sync::{Semaphore, watch},
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    engine::Hdb,
    error::{HdbError, Result},
    operation::OperationRequest,
    users::Caller,
};

const DAY_MILLIS: i64 = 24 * 60 * 60 * 1000;

// ============================================================================
// Job state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    InProgress,
    Complete,
    Error,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::Complete => "COMPLETE",
            JobStatus::Error => "ERROR",
        }
    }
}

/// Terminal state of a job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub id: String,
    pub status: JobStatus,
    /// A message string on success; on failure the error body.
    pub message: Value,
}

/// Awaitable handle of a running or finished job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: String,
    state: watch::Receiver<Option<JobOutcome>>,
}

impl JobHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Waits for the job's terminal state.
    pub async fn wait(mut self) -> JobOutcome {
        let outcome = match self.state.wait_for(Option::is_some).await {
            Ok(state) => state.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| JobOutcome {
            id: self.id.clone(),
            status: JobStatus::Error,
            message: Value::String("job ended without reporting a result".into()),
        })
    }
}

/// Concurrency limit and handles of the engine's jobs.
pub(crate) struct JobRunner {
    permits: Arc<Semaphore>,
    handles: Mutex<HashMap<String, watch::Receiver<Option<JobOutcome>>>>,
}

impl JobRunner {
    pub(crate) fn new(max_concurrent_jobs: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent_jobs.max(1))),
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn handle(&self, id: &str) -> Option<JobHandle> {
        let handles = self.handles.lock().ok()?;
        handles.get(id).map(|state| JobHandle {
            id: id.to_string(),
            state: state.clone(),
        })
    }

    fn register(&self, id: &str, state: watch::Receiver<Option<JobOutcome>>) {
        if let Ok(mut handles) = self.handles.lock() {
            handles.insert(id.to_string(), state);
        }
    }

    fn forget(&self, ids: &[String]) {
        if let Ok(mut handles) = self.handles.lock() {
            for id in ids {
                handles.remove(id);
            }
        }
    }
}

fn job_table() -> TableRef {
    TableRef::new(SYSTEM_DATABASE, JOB_TABLE)
}

/// Renders a failed job's message: structured bodies stay structured.
fn failure_message(err: &HdbError) -> Value {
    match err {
        HdbError::Unauthorized(_) | HdbError::RoleValidation(_) => err.to_body(),
        other => Value::String(other.to_string()),
    }
}

/// Parses a date given as epoch milliseconds, RFC 3339, `YYYY-MM-DD` or
/// `YYYY-MM-DD[T ]HH:MM:SS[.fff]` (UTC).
pub fn parse_date(value: &Value) -> Result<Timestamp> {
    let invalid = || HdbError::validation(format!("Invalid date '{}'", value_text(value)));
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .map(Timestamp::from_millis)
            .ok_or_else(invalid),
        Value::String(text) => {
            let text = text.trim();
            if let Ok(millis) = text.parse::<i64>() {
                return Ok(Timestamp::from_millis(millis));
            }
            if let Ok(date) = DateTime::parse_from_rfc3339(text) {
                return Ok(Timestamp::from_millis(date.timestamp_millis()));
            }
            for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
                if let Ok(date) = NaiveDateTime::parse_from_str(text, format) {
                    return Ok(Timestamp::from_millis(date.and_utc().timestamp_millis()));
                }
            }
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
                .map(|date| Timestamp::from_millis(date.and_utc().timestamp_millis()))
                .ok_or_else(invalid)
        }
        _ => Err(invalid()),
    }
}

fn value_text(value: &Value) -> String {
    value
        .as_str()
        .map_or_else(|| value.to_string(), str::to_string)
}

fn required_date(request: &OperationRequest, key: &str) -> Result<Timestamp> {
    match request.get(key) {
        None | Some(Value::Null) => Err(HdbError::validation(format!("'{key}' is required"))),
        Some(value) => parse_date(value),
    }
}

/// Work run by a job on the blocking pool. Receives the job id.
type JobWork = Box<dyn FnOnce(&Hdb, &str) -> Result<Value> + Send + 'static>;

impl Hdb {
    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Records a new job and schedules `work`.
    pub(crate) fn start_job(
        &self,
        caller: &Caller,
        request: &OperationRequest,
        work: JobWork,
    ) -> Result<Value> {
        let runtime = Handle::try_current()
            .map_err(|_| HdbError::internal("job operations require a tokio runtime"))?;
        self.purge_expired_jobs();

        let id = Uuid::new_v4().to_string();
        let job_type = request.kind.name();
        let mut record = Record::new();
        record.insert("id".into(), json!(id));
        record.insert("type".into(), json!(job_type));
        record.insert("status".into(), json!(JobStatus::InProgress.as_str()));
        record.insert("user".into(), json!(caller.username));
        record.insert("start_datetime".into(), Timestamp::now().to_json());
        self.put_system_record(&job_table(), HashKey::Text(id.clone()), record)?;

        let (sender, state) = watch::channel(None);
        self.inner.jobs.register(&id, state);

        let hdb = self.clone();
        let permits = Arc::clone(&self.inner.jobs.permits);
        let job_id = id.clone();
        runtime.spawn(async move {
            let _permit = permits.acquire_owned().await.ok();
            let worker = hdb.clone();
            let worker_id = job_id.clone();
            let result = match tokio::task::spawn_blocking(move || work(&worker, &worker_id)).await {
                Ok(result) => result,
                Err(err) => Err(HdbError::internal(format!("job task failed: {err}"))),
            };
            let outcome = hdb.finish_job(&job_id, job_type, result);
            sender.send_replace(Some(outcome));
        });

        info!(job_id = %id, job_type, user = %caller.username, "Job started");
        Ok(json!({
            "message": format!("Starting job with id {id}"),
            "job_id": id,
        }))
    }

    fn finish_job(&self, id: &str, job_type: &str, result: Result<Value>) -> JobOutcome {
        let (status, message) = match result {
            Ok(message) => {
                info!(job_id = %id, job_type, "Job complete");
                (JobStatus::Complete, message)
            }
            Err(err) => {
                warn!(job_id = %id, job_type, error = %err, "Job failed");
                (JobStatus::Error, failure_message(&err))
            }
        };
        let mut record = Record::new();
        record.insert("status".into(), json!(status.as_str()));
        record.insert("end_datetime".into(), Timestamp::now().to_json());
        record.insert("message".into(), message.clone());
        if let Err(err) = self.put_system_record(&job_table(), HashKey::Text(id.to_string()), record) {
            warn!(job_id = %id, error = %err, "Failed to record job result");
        }
        JobOutcome {
            id: id.to_string(),
            status,
            message,
        }
    }

    /// Drops finished jobs older than `jobs.job_retention_days`.
    fn purge_expired_jobs(&self) {
        let days = i64::from(self.config().jobs.job_retention_days);
        let cutoff = Timestamp::now().as_millis().saturating_sub(days.saturating_mul(DAY_MILLIS));
        let table = job_table();
        let Ok(jobs) = self.store().scan(&table) else {
            return;
        };
        let mut purged = Vec::new();
        for (key, job) in jobs {
            let finished = job.get("status").and_then(Value::as_str) != Some(JobStatus::InProgress.as_str());
            let started = job.get("start_datetime").and_then(Value::as_i64).unwrap_or(i64::MAX);
            if finished && started < cutoff && self.store().delete(&table, &key).is_ok() {
                if let HashKey::Text(id) = key {
                    purged.push(id);
                }
            }
        }
        if !purged.is_empty() {
            self.inner.jobs.forget(&purged);
            info!(jobs = purged.len(), "Expired jobs purged");
        }
    }

    // ========================================================================
    // Job queries
    // ========================================================================

    /// Jobs of other users read as not found unless the caller is a super
    /// user.
    pub(crate) fn op_get_job(&self, caller: &Caller, request: &OperationRequest) -> Result<Value> {
        let id = request.required_str("id")?;
        let not_found = || HdbError::not_found(format!("Job with id '{id}' not found"));
        let job = self
            .store()
            .get(&job_table(), &HashKey::Text(id.to_string()))?
            .ok_or_else(not_found)?;
        let owned = job.get("user").and_then(Value::as_str) == Some(caller.username.as_str());
        if !owned && !caller.role.is_super_user() {
            warn!(job_id = %id, user = %caller.username, "Job read by another user refused");
            return Err(not_found());
        }
        Ok(json!([job]))
    }

    pub(crate) fn op_search_jobs_by_start_date(
        &self,
        _caller: &Caller,
        request: &OperationRequest,
    ) -> Result<Value> {
        let from = required_date(request, "from_date")?.as_millis();
        let to = required_date(request, "to_date")?.as_millis();
        let mut jobs: Vec<Record> = self
            .store()
            .scan(&job_table())?
            .into_iter()
            .map(|(_, job)| job)
            .filter(|job| {
                job.get("start_datetime")
                    .and_then(Value::as_i64)
                    .is_some_and(|start| (from..=to).contains(&start))
            })
            .collect();
        jobs.sort_by_key(|job| job.get("start_datetime").and_then(Value::as_i64));
        Ok(Value::Array(jobs.into_iter().map(Value::Object).collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(json!(1_000), 1_000 ; "millis")]
    #[test_case(json!("1000"), 1_000 ; "millis text")]
    #[test_case(json!("1970-01-02"), 86_400_000 ; "date")]
    #[test_case(json!("1970-01-01T00:00:01Z"), 1_000 ; "rfc3339")]
    #[test_case(json!("1970-01-01 00:00:01.500"), 1_500 ; "naive datetime")]
    fn dates_parse(value: Value, millis: i64) {
        assert_eq!(parse_date(&value).unwrap().as_millis(), millis);
    }

    #[test]
    fn invalid_dates_are_validation_errors() {
        let err = parse_date(&json!("yesterday")).unwrap_err();
        assert_eq!(err.status(), 400);
        assert_eq!(err.to_string(), "Invalid date 'yesterday'");
        assert!(parse_date(&json!(true)).is_err());
    }

    #[test]
    fn statuses_serialize_in_upper_case() {
        assert_eq!(serde_json::to_value(JobStatus::InProgress).unwrap(), json!("IN_PROGRESS"));
        assert_eq!(JobStatus::Error.as_str(), "ERROR");
    }

    #[tokio::test]
    async fn handles_resolve_on_terminal_state() {
        let runner = JobRunner::new(1);
        let (sender, state) = watch::channel(None);
        runner.register("job-1", state);
        let handle = runner.handle("job-1").unwrap();
        assert_eq!(handle.id(), "job-1");
        sender.send_replace(Some(JobOutcome {
            id: "job-1".into(),
            status: JobStatus::Complete,
            message: json!("done"),
        }));
        assert_eq!(handle.wait().await.status, JobStatus::Complete);
        runner.forget(&["job-1".to_string()]);
        assert!(runner.handle("job-1").is_none());
    }
}
