//! # hdb
//!
//! Operations engine for a schema-on-write document database: SQL and
//! NoSQL queries, role-based access control, mutations and bulk jobs.
//!
//! Every request is a JSON object with an `operation` field. The engine
//! decodes it, checks the caller's role, runs it and answers with an
//! HTTP-style status and a JSON body.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                              Hdb                               │
//! │  ┌───────────┐   ┌────────────┐   ┌───────────┐   ┌─────────┐  │
//! │  │ Operation │ → │ Permission │ → │  Query /  │ → │ Record  │  │
//! │  │  decode   │   │ evaluator  │   │ Mutation  │   │  store  │  │
//! │  └───────────┘   └────────────┘   └───────────┘   └─────────┘  │
//! │                        Jobs ─────────┘     Audit ←─────┘       │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use hdb::Hdb;
//! use serde_json::json;
//!
//! let hdb = Hdb::in_memory()?;
//! let admin = hdb.super_user()?;
//!
//! hdb.execute(&admin, json!({"operation": "create_table", "database": "dev", "table": "dog", "hash_attribute": "id"})).await;
//! hdb.execute(&admin, json!({"operation": "insert", "database": "dev", "table": "dog", "records": [{"id": 1, "name": "Penny"}]})).await;
//!
//! let response = hdb.execute(&admin, json!({"operation": "sql", "sql": "SELECT * FROM dev.dog"})).await;
//! assert_eq!(response.status, 200);
//! ```

mod admin;
mod audit;
mod engine;
mod error;
mod jobs;
mod mutation;
mod operation;
mod query;
mod structure;
mod users;

pub use audit::{AuditFilter, AuditRecord, AuditSink, MemoryAuditSink};
pub use engine::{Hdb, HdbBuilder, OperationResponse};
pub use error::{HdbError, Result, SYSTEM_PROTECTED_MESSAGE};
pub use jobs::{
    JobHandle, JobOutcome, JobStatus, MemoryTransport, ObjectLocation, ObjectTransport, S3Location,
    TransportError, parse_csv, parse_date,
};
pub use mutation::{DeleteSummary, WriteAction, WriteSummary};
pub use operation::{OperationKind, OperationRequest, UNSUPPORTED_OPERATIONS};
pub use users::Caller;

// Re-export the building blocks embedders configure the engine with.
pub use hdb_config::HdbConfig;
pub use hdb_query::ComputedFn;
pub use hdb_store::{MemoryStore, RecordStore};
pub use hdb_types::{HashKey, Record, TableRef, Timestamp};
