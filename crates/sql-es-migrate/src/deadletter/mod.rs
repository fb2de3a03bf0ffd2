//! Dead-letter store for records that failed transform or load.
//!
//! A record keeps the original source rows, so it can be reprocessed later
//! without re-querying the source. Records are removed only after a
//! successful reprocessing attempt.

mod file;
mod memory;

pub use file::FileDeadLetterStore;
pub use memory::MemoryDeadLetterStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::Row;
use crate::error::Result;
use crate::state::JobId;

/// Pipeline stage at which a record failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Transform,
    Load,
}

impl std::fmt::Display for FailureStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            FailureStage::Transform => "transform",
            FailureStage::Load => "load",
        })
    }
}

/// One failed record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub id: String,
    pub mapping_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    pub stage: FailureStage,
    /// Source rows of the record; several for a grouped join record.
    pub rows: Vec<Row>,
    /// Transformed document, present for load-stage failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<Value>,
    pub error_message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
}

impl DeadLetterRecord {
    pub fn new(
        mapping_id: &str,
        job_id: Option<JobId>,
        stage: FailureStage,
        rows: Vec<Row>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            mapping_id: mapping_id.to_string(),
            job_id,
            stage,
            rows,
            document: None,
            error_message: error_message.into(),
            timestamp: Utc::now(),
            retry_count: 0,
        }
    }

    pub fn with_document(mut self, document: Value) -> Self {
        self.document = Some(document);
        self
    }

    /// Record a failed reprocessing attempt.
    pub fn record_retry(&mut self, error_message: impl Into<String>) {
        self.retry_count += 1;
        self.error_message = error_message.into();
    }
}

/// Durable holding area for failed records; safe for concurrent jobs.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn add(&self, record: DeadLetterRecord) -> Result<()>;

    /// Records for one mapping (or all), oldest first.
    async fn list(&self, mapping: Option<&str>) -> Result<Vec<DeadLetterRecord>>;

    /// Replace a stored record (retry metadata).
    async fn update(&self, record: &DeadLetterRecord) -> Result<()>;

    /// Remove a record. Returns false when it was not stored.
    async fn remove(&self, id: &str) -> Result<bool>;
}

fn sort_oldest_first(records: &mut [DeadLetterRecord]) {
    records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SqlValue;

    #[test]
    fn test_record_round_trips_typed_rows() {
        let row = Row::from_pairs([
            ("ORDER_ID", SqlValue::I64(2)),
            ("AMOUNT", SqlValue::Text("abc".into())),
        ]);
        let record = DeadLetterRecord::new("orders", Some(JobId(3)), FailureStage::Transform, vec![row], "bad amount");
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"stage\":\"transform\""));
        let back: DeadLetterRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_record_retry() {
        let mut record = DeadLetterRecord::new("orders", None, FailureStage::Load, vec![], "503");
        record.record_retry("still failing");
        assert_eq!(record.retry_count, 1);
        assert_eq!(record.error_message, "still failing");
    }
}
