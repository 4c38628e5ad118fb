//! Audit channel.
//!
//! Every applied mutation emits an [`AuditRecord`]. The engine does not
//! write audit logs itself; it hands records to an [`AuditSink`].

use std::sync::Mutex;

use hdb_types::{Record, TableRef, Timestamp};
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRecord {
    pub timestamp: Timestamp,
    pub user: String,
    pub operation: String,
    #[serde(skip)]
    pub table: TableRef,
    pub hash_values: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records: Option<Vec<Record>>,
}

/// Filters accepted by `read_audit_log`.
#[derive(Debug, Clone, PartialEq)]
pub enum AuditFilter {
    All,
    HashValues(Vec<Value>),
    Usernames(Vec<String>),
    /// Inclusive range; `None` leaves the end open.
    Timestamps {
        from: Timestamp,
        to: Option<Timestamp>,
    },
}

impl AuditFilter {
    pub fn matches(&self, record: &AuditRecord) -> bool {
        match self {
            AuditFilter::All => true,
            AuditFilter::HashValues(values) => {
                record.hash_values.iter().any(|hash| values.contains(hash))
            }
            AuditFilter::Usernames(users) => users.contains(&record.user),
            AuditFilter::Timestamps { from, to } => {
                record.timestamp >= *from && to.is_none_or(|to| record.timestamp <= to)
            }
        }
    }
}

/// Receiver of audit records.
pub trait AuditSink: Send + Sync {
    fn emit(&self, record: AuditRecord);

    /// Records of `table` accepted by `filter`, oldest first.
    fn read(&self, table: &TableRef, filter: &AuditFilter) -> Vec<AuditRecord>;

    /// Removes records of `table` older than `before`, returning how many
    /// were removed.
    fn purge_before(&self, table: &TableRef, before: Timestamp) -> usize;
}

/// In-process audit sink.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map_or(0, |records| records.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditSink for MemoryAuditSink {
    fn emit(&self, record: AuditRecord) {
        match self.records.lock() {
            Ok(mut records) => records.push(record),
            Err(_) => warn!(table = %record.table, "Audit sink poisoned, record dropped"),
        }
    }

    fn read(&self, table: &TableRef, filter: &AuditFilter) -> Vec<AuditRecord> {
        let Ok(records) = self.records.lock() else {
            return Vec::new();
        };
        records
            .iter()
            .filter(|record| &record.table == table && filter.matches(record))
            .cloned()
            .collect()
    }

    fn purge_before(&self, table: &TableRef, before: Timestamp) -> usize {
        let Ok(mut records) = self.records.lock() else {
            return 0;
        };
        let len = records.len();
        records.retain(|record| &record.table != table || record.timestamp >= before);
        len - records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(table: &TableRef, user: &str, at: i64, hash: Value) -> AuditRecord {
        AuditRecord {
            timestamp: Timestamp::from_millis(at),
            user: user.into(),
            operation: "insert".into(),
            table: table.clone(),
            hash_values: vec![hash],
            records: None,
        }
    }

    #[test]
    fn filters_and_purges_per_table() {
        let dog = TableRef::new("dev", "dog");
        let cat = TableRef::new("dev", "cat");
        let sink = MemoryAuditSink::new();
        sink.emit(record(&dog, "admin", 10, json!(1)));
        sink.emit(record(&dog, "bob", 20, json!(2)));
        sink.emit(record(&cat, "admin", 5, json!(1)));

        assert_eq!(sink.read(&dog, &AuditFilter::All).len(), 2);
        assert_eq!(
            sink.read(&dog, &AuditFilter::Usernames(vec!["bob".into()]))[0].hash_values,
            vec![json!(2)]
        );
        assert_eq!(
            sink.read(&dog, &AuditFilter::HashValues(vec![json!(1)])).len(),
            1
        );
        let range = AuditFilter::Timestamps {
            from: Timestamp::from_millis(15),
            to: None,
        };
        assert_eq!(sink.read(&dog, &range).len(), 1);

        assert_eq!(sink.purge_before(&dog, Timestamp::from_millis(15)), 1);
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.read(&cat, &AuditFilter::All).len(), 1);
    }
}
