//! Bulk job pipeline: loads, exports, purges and job queries.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use hdb::{Caller, Hdb, HdbConfig, JobOutcome, JobStatus, MemoryTransport, TableRef};
use serde_json::{Value, json};
use tempfile::tempdir;

const UNAUTHORIZED: &str =
    "This operation is not authorized due to role restrictions and/or invalid database items";

async fn ok(hdb: &Hdb, caller: &Caller, body: Value) -> Value {
    let response = hdb.execute(caller, body.clone()).await;
    assert_eq!(response.status, 200, "{body} -> {}", response.body);
    response.body
}

async fn with_dog_table(hdb: &Hdb) -> Caller {
    let admin = hdb.super_user().unwrap();
    ok(
        hdb,
        &admin,
        json!({"operation": "create_table", "database": "dev", "table": "dog", "hash_attribute": "id"}),
    )
    .await;
    admin
}

/// Starts a job and waits for its terminal state.
async fn run_job(hdb: &Hdb, caller: &Caller, body: Value) -> JobOutcome {
    let started = ok(hdb, caller, body).await;
    let id = started["job_id"].as_str().unwrap();
    assert_eq!(started["message"], format!("Starting job with id {id}"));
    hdb.job(id).unwrap().wait().await
}

async fn dogs(hdb: &Hdb, caller: &Caller) -> Vec<Value> {
    ok(hdb, caller, json!({"operation": "sql", "sql": "SELECT * FROM dev.dog ORDER BY id"}))
        .await
        .as_array()
        .unwrap()
        .clone()
}

fn s3(key: &str) -> Value {
    json!({
        "aws_access_key_id": "AKIA",
        "aws_secret_access_key": "secret",
        "bucket": "harper",
        "key": key,
        "region": "us-east-2"
    })
}

// ============================================================================
// Loads
// ============================================================================

#[tokio::test]
async fn csv_data_load_completes_and_is_recorded() {
    let hdb = Hdb::in_memory().unwrap();
    let admin = with_dog_table(&hdb).await;

    let outcome = run_job(
        &hdb,
        &admin,
        json!({"operation": "csv_data_load", "database": "dev", "table": "dog",
               "data": "id,name,age\n1,Penny,5\n2,Kato,\n"}),
    )
    .await;
    assert_eq!(outcome.status, JobStatus::Complete);
    assert_eq!(outcome.message, "successfully loaded 2 of 2 records");

    let rows = dogs(&hdb, &admin).await;
    assert_eq!(rows[0]["age"], 5);
    assert!(rows[1].get("age").is_none() || rows[1]["age"].is_null());

    let job = ok(&hdb, &admin, json!({"operation": "get_job", "id": outcome.id})).await;
    assert_eq!(job[0]["status"], "COMPLETE");
    assert_eq!(job[0]["type"], "csv_data_load");
    assert_eq!(job[0]["user"], "admin");
    assert!(job[0]["end_datetime"].is_i64());
}

#[tokio::test]
async fn csv_upsert_without_attribute_insert_grant_fails_the_job() {
    let hdb = Hdb::in_memory().unwrap();
    let admin = with_dog_table(&hdb).await;
    ok(
        &hdb,
        &admin,
        json!({"operation": "insert", "database": "dev", "table": "dog",
               "records": [{"id": 1, "name": "Penny", "age": 5}]}),
    )
    .await;
    ok(
        &hdb,
        &admin,
        json!({
            "operation": "add_role",
            "role": "loader",
            "permission": {"dev": {"tables": {"dog": {
                "read": true, "insert": true, "update": true, "delete": false,
                "attribute_permissions": [
                    {"attribute_name": "name", "read": true, "insert": true, "update": true},
                    {"attribute_name": "age", "read": true, "insert": false, "update": true}
                ]
            }}}}
        }),
    )
    .await;
    ok(
        &hdb,
        &admin,
        json!({"operation": "add_user", "username": "loader", "password": "pw", "role": "loader"}),
    )
    .await;
    let loader = hdb.authenticate("loader", "pw").unwrap();

    let outcome = run_job(
        &hdb,
        &loader,
        json!({"operation": "csv_data_load", "action": "upsert", "database": "dev", "table": "dog",
               "data": "id,name,age\n2,Kato,3\n"}),
    )
    .await;
    assert_eq!(outcome.status, JobStatus::Error);
    assert_eq!(outcome.message["error"], UNAUTHORIZED);
    assert_eq!(
        outcome.message["unauthorized_access"][0]["required_attribute_permissions"],
        json!([{"attribute_name": "age", "required_permissions": ["insert"]}])
    );
    assert_eq!(dogs(&hdb, &admin).await.len(), 1);

    let job = ok(&hdb, &loader, json!({"operation": "get_job", "id": outcome.id})).await;
    assert_eq!(job[0]["status"], "ERROR");
}

#[tokio::test]
async fn invalid_load_requests_fail_before_a_job_starts() {
    let hdb = Hdb::in_memory().unwrap();
    let admin = with_dog_table(&hdb).await;

    let response = hdb
        .execute(
            &admin,
            json!({"operation": "csv_data_load", "action": "merge", "database": "dev", "table": "dog", "data": "id\n1\n"}),
        )
        .await;
    assert_eq!(response.status, 400);

    let response = hdb
        .execute(
            &admin,
            json!({"operation": "import_from_s3", "database": "dev", "table": "dog", "s3": s3("dogs.txt")}),
        )
        .await;
    assert_eq!(response.status, 400);
    assert_eq!(
        response.body["error"],
        "S3 key must include one of the following valid file extensions - '.csv', '.json'"
    );
}

#[tokio::test]
async fn csv_file_load_reads_local_files() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("dogs.csv");
    std::fs::write(&path, "id,name\n1,Penny\n2,Kato\n3,Riley\n").unwrap();

    let hdb = Hdb::in_memory().unwrap();
    let admin = with_dog_table(&hdb).await;
    let outcome = run_job(
        &hdb,
        &admin,
        json!({"operation": "csv_file_load", "database": "dev", "table": "dog",
               "file_path": path.to_str().unwrap()}),
    )
    .await;
    assert_eq!(outcome.status, JobStatus::Complete);
    assert_eq!(dogs(&hdb, &admin).await.len(), 3);

    let outcome = run_job(
        &hdb,
        &admin,
        json!({"operation": "csv_file_load", "database": "dev", "table": "dog",
               "file_path": dir.path().join("missing.csv").to_str().unwrap()}),
    )
    .await;
    assert_eq!(outcome.status, JobStatus::Error);
}

#[tokio::test]
async fn url_load_without_transport_ends_in_error() {
    let hdb = Hdb::in_memory().unwrap();
    let admin = with_dog_table(&hdb).await;
    let outcome = run_job(
        &hdb,
        &admin,
        json!({"operation": "csv_url_load", "database": "dev", "table": "dog",
               "csv_url": "https://example.com/dogs.csv"}),
    )
    .await;
    assert_eq!(outcome.status, JobStatus::Error);
    assert!(outcome.message.as_str().unwrap().contains("No object transport is configured"));
}

#[tokio::test]
async fn transport_backed_loads_and_exports() {
    let transport = Arc::new(MemoryTransport::new());
    transport.insert("https://example.com/dogs.csv", "id,name\n1,Penny\n");
    transport.insert("s3://harper/dogs.json", r#"[{"id": 2, "name": "Kato"}]"#);
    let hdb = Hdb::builder(HdbConfig::in_memory())
        .with_transport(transport.clone())
        .build()
        .unwrap();
    let admin = with_dog_table(&hdb).await;

    let outcome = run_job(
        &hdb,
        &admin,
        json!({"operation": "csv_url_load", "database": "dev", "table": "dog",
               "csv_url": "https://example.com/dogs.csv"}),
    )
    .await;
    assert_eq!(outcome.status, JobStatus::Complete);

    let outcome = run_job(
        &hdb,
        &admin,
        json!({"operation": "import_from_s3", "database": "dev", "table": "dog", "s3": s3("dogs.json")}),
    )
    .await;
    assert_eq!(outcome.status, JobStatus::Complete);
    assert_eq!(dogs(&hdb, &admin).await.len(), 2);

    let outcome = run_job(
        &hdb,
        &admin,
        json!({
            "operation": "export_to_s3",
            "format": "csv",
            "s3": s3("export"),
            "search_operation": {"operation": "sql", "sql": "SELECT id, name FROM dev.dog ORDER BY id"}
        }),
    )
    .await;
    assert_eq!(outcome.status, JobStatus::Complete);
    let exported = String::from_utf8(transport.object("s3://harper/export.csv").unwrap()).unwrap();
    assert_eq!(exported, "id,name\n1,Penny\n2,Kato\n");
}

// ============================================================================
// Exports and purges
// ============================================================================

#[tokio::test]
async fn export_local_writes_search_results() {
    let dir = tempdir().unwrap();
    let hdb = Hdb::in_memory().unwrap();
    let admin = with_dog_table(&hdb).await;
    ok(
        &hdb,
        &admin,
        json!({"operation": "insert", "database": "dev", "table": "dog",
               "records": [{"id": 1, "name": "Penny"}, {"id": 2, "name": "Kato"}]}),
    )
    .await;

    let outcome = run_job(
        &hdb,
        &admin,
        json!({
            "operation": "export_local",
            "path": dir.path().to_str().unwrap(),
            "filename": "dogs.json",
            "search_operation": {"operation": "search_by_value", "database": "dev", "table": "dog",
                                 "search_attribute": "name", "search_value": "*", "get_attributes": ["id"]}
        }),
    )
    .await;
    assert_eq!(outcome.status, JobStatus::Complete);
    let written: Value =
        serde_json::from_slice(&std::fs::read(dir.path().join("dogs.json")).unwrap()).unwrap();
    assert_eq!(written.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn delete_files_before_removes_older_records() {
    let hdb = Hdb::in_memory().unwrap();
    let admin = with_dog_table(&hdb).await;
    ok(
        &hdb,
        &admin,
        json!({"operation": "insert", "database": "dev", "table": "dog",
               "records": [{"id": 1}, {"id": 2}]}),
    )
    .await;

    let outcome = run_job(
        &hdb,
        &admin,
        json!({"operation": "delete_files_before", "database": "dev", "table": "dog", "date": "1970-01-02"}),
    )
    .await;
    assert_eq!(outcome.message, "0 records successfully deleted");

    let outcome = run_job(
        &hdb,
        &admin,
        json!({"operation": "delete_files_before", "database": "dev", "table": "dog", "date": "2999-01-01"}),
    )
    .await;
    assert_eq!(outcome.status, JobStatus::Complete);
    assert_eq!(outcome.message, "2 records successfully deleted");
    assert!(dogs(&hdb, &admin).await.is_empty());
}

#[tokio::test]
async fn audit_log_is_readable_and_purgeable() {
    let hdb = Hdb::in_memory().unwrap();
    let admin = with_dog_table(&hdb).await;
    ok(
        &hdb,
        &admin,
        json!({"operation": "insert", "database": "dev", "table": "dog", "records": [{"id": 1}]}),
    )
    .await;

    let read = json!({"operation": "read_audit_log", "database": "dev", "table": "dog",
                      "search_type": "hash_value", "search_values": [1]});
    let entries = ok(&hdb, &admin, read.clone()).await;
    assert_eq!(entries[0]["operation"], "insert");
    assert_eq!(entries[0]["user"], "admin");

    let outcome = run_job(
        &hdb,
        &admin,
        json!({"operation": "delete_audit_logs_before", "database": "dev", "table": "dog",
               "timestamp": "2999-01-01"}),
    )
    .await;
    assert_eq!(outcome.status, JobStatus::Complete);
    assert_eq!(ok(&hdb, &admin, read).await, json!([]));
    assert!(hdb.audit().read(&TableRef::new("dev", "dog"), &hdb::AuditFilter::All).is_empty());
}

// ============================================================================
// Job queries and configuration
// ============================================================================

#[tokio::test]
async fn jobs_are_searchable_by_start_date() {
    let hdb = Hdb::in_memory().unwrap();
    let admin = with_dog_table(&hdb).await;
    let outcome = run_job(
        &hdb,
        &admin,
        json!({"operation": "csv_data_load", "database": "dev", "table": "dog", "data": "id\n1\n"}),
    )
    .await;

    let jobs = ok(
        &hdb,
        &admin,
        json!({"operation": "search_jobs_by_start_date", "from_date": "2000-01-01", "to_date": "2999-01-01"}),
    )
    .await;
    assert!(jobs.as_array().unwrap().iter().any(|job| job["id"] == outcome.id));

    let jobs = ok(
        &hdb,
        &admin,
        json!({"operation": "search_jobs_by_start_date", "from_date": "1990-01-01", "to_date": "1990-01-02"}),
    )
    .await;
    assert_eq!(jobs, json!([]));

    let response = hdb.execute(&admin, json!({"operation": "get_job", "id": "nope"})).await;
    assert_eq!(response.status, 404);
}

#[tokio::test]
async fn jobs_are_private_to_their_user() {
    let hdb = Hdb::in_memory().unwrap();
    let admin = with_dog_table(&hdb).await;
    ok(
        &hdb,
        &admin,
        json!({"operation": "add_role", "role": "dog_loader",
               "permission": {"dev": {"tables": {"dog": {
                   "read": true, "insert": true, "update": false, "delete": false
               }}}}}),
    )
    .await;
    ok(
        &hdb,
        &admin,
        json!({"operation": "add_user", "username": "loader", "password": "pw", "role": "dog_loader"}),
    )
    .await;
    let loader = hdb.authenticate("loader", "pw").unwrap();
    let load = json!({"operation": "csv_data_load", "database": "dev", "table": "dog", "data": "id\n1\n"});

    let admin_job = run_job(&hdb, &admin, load.clone()).await;
    let response = hdb
        .execute(&loader, json!({"operation": "get_job", "id": admin_job.id}))
        .await;
    assert_eq!(response.status, 404);

    let loader_job = run_job(&hdb, &loader, load).await;
    let job = ok(&hdb, &loader, json!({"operation": "get_job", "id": loader_job.id})).await;
    assert_eq!(job[0]["user"], "loader");
    let job = ok(&hdb, &admin, json!({"operation": "get_job", "id": loader_job.id})).await;
    assert_eq!(job[0]["id"], loader_job.id);
}

#[tokio::test]
async fn invalid_hash_in_a_later_chunk_fails_the_whole_load() {
    let mut config = HdbConfig::in_memory();
    config.operations.max_batch_records = 1;
    let hdb = Hdb::builder(config).build().unwrap();
    let admin = with_dog_table(&hdb).await;

    let outcome = run_job(
        &hdb,
        &admin,
        json!({"operation": "csv_data_load", "database": "dev", "table": "dog",
               "data": "id,name\n1,Penny\ntrue,Kato\n"}),
    )
    .await;
    assert_eq!(outcome.status, JobStatus::Error);
    assert!(dogs(&hdb, &admin).await.is_empty());
}

#[tokio::test]
async fn set_configuration_writes_local_overrides() {
    let dir = tempdir().unwrap();
    let hdb = Hdb::builder(HdbConfig::in_memory())
        .with_project_dir(dir.path())
        .build()
        .unwrap();
    let admin = hdb.super_user().unwrap();

    let body = ok(
        &hdb,
        &admin,
        json!({"operation": "set_configuration", "jobs_max_concurrent_jobs": 8}),
    )
    .await;
    assert!(body["message"].as_str().unwrap().contains("restart"));
    let written = std::fs::read_to_string(dir.path().join("hdb.local.toml")).unwrap();
    assert!(written.contains("max_concurrent_jobs = 8"));

    let current = ok(&hdb, &admin, json!({"operation": "get_configuration"})).await;
    assert_eq!(current["jobs"]["max_concurrent_jobs"], 4);

    let response = hdb
        .execute(&admin, json!({"operation": "set_configuration", "jobs_max_concurrent_jobs": 0}))
        .await;
    assert_eq!(response.status, 400);
}
