//! Job and watermark state.
//!
//! [`MigrationJob`] carries the job state machine; the Job Controller is the
//! only writer of a job's mutable fields. Persistence goes through the
//! [`JobRepository`] and [`WatermarkStore`] traits, with in-memory and
//! JSON-file backends.

mod file;
mod locks;
mod memory;

pub use file::{FileJobRepository, FileWatermarkStore};
pub use locks::MappingLocks;
pub use memory::{MemoryJobRepository, MemoryWatermarkStore};

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

use crate::core::SqlValue;
use crate::error::{MigrateError, Result};

/// Monotonically assigned job identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<u64>()
            .map(JobId)
            .map_err(|_| MigrateError::Config(format!("Invalid job id: {}", s)))
    }
}

/// Job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Stopped)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One migration job and its progress.
///
/// Serializes with the derived `progress_percentage`; the field is ignored
/// when a stored job is read back.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MigrationJob {
    pub id: JobId,

    pub mapping_configuration_id: String,

    pub status: JobStatus,

    /// Records the source reported up front; 0 when unknown.
    pub total_records: u64,

    /// Records attempted (loaded or dead-lettered).
    pub processed_records: u64,

    /// Dead-lettered subset of `processed_records`.
    pub failed_records: u64,

    pub start_time: Option<DateTime<Utc>>,

    /// Null while running.
    pub end_time: Option<DateTime<Utc>>,

    /// Set only when failed.
    pub error_message: Option<String>,

    pub created_at: DateTime<Utc>,

    /// Executions so far; retry starts the next one.
    #[serde(default)]
    pub attempt: u32,
}

impl Serialize for MigrationJob {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut job = serializer.serialize_struct("MigrationJob", 12)?;
        job.serialize_field("id", &self.id)?;
        job.serialize_field("mapping_configuration_id", &self.mapping_configuration_id)?;
        job.serialize_field("status", &self.status)?;
        job.serialize_field("total_records", &self.total_records)?;
        job.serialize_field("processed_records", &self.processed_records)?;
        job.serialize_field("failed_records", &self.failed_records)?;
        job.serialize_field("progress_percentage", &self.progress_percentage())?;
        job.serialize_field("start_time", &self.start_time)?;
        job.serialize_field("end_time", &self.end_time)?;
        job.serialize_field("error_message", &self.error_message)?;
        job.serialize_field("created_at", &self.created_at)?;
        job.serialize_field("attempt", &self.attempt)?;
        job.end()
    }
}

/// Derived job metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMetrics {
    pub progress_percentage: f64,
    pub elapsed_secs: f64,
    pub records_per_second: f64,
    /// Estimated seconds to completion; unknown without a total or throughput.
    pub eta_secs: Option<f64>,
}

impl MigrationJob {
    /// A pending job.
    pub fn new(id: JobId, mapping_configuration_id: &str) -> Self {
        Self {
            id,
            mapping_configuration_id: mapping_configuration_id.to_string(),
            status: JobStatus::Pending,
            total_records: 0,
            processed_records: 0,
            failed_records: 0,
            start_time: None,
            end_time: None,
            error_message: None,
            created_at: Utc::now(),
            attempt: 0,
        }
    }

    fn invalid(&self, action: &str) -> MigrateError {
        MigrateError::InvalidTransition {
            job: self.id,
            from: self.status.to_string(),
            action: action.to_string(),
        }
    }

    /// pending → running.
    pub fn start(&mut self, total_records: Option<u64>) -> Result<()> {
        if self.status != JobStatus::Pending {
            return Err(self.invalid("start"));
        }
        self.begin_execution();
        self.total_records = total_records.unwrap_or(0);
        Ok(())
    }

    /// failed → running with reset counters; id and mapping are preserved.
    pub fn restart(&mut self) -> Result<()> {
        if self.status != JobStatus::Failed {
            return Err(self.invalid("retry"));
        }
        self.begin_execution();
        self.total_records = 0;
        Ok(())
    }

    fn begin_execution(&mut self) {
        self.status = JobStatus::Running;
        self.processed_records = 0;
        self.failed_records = 0;
        self.start_time = Some(Utc::now());
        self.end_time = None;
        self.error_message = None;
        self.attempt += 1;
    }

    /// Add one batch's counts. Counters never decrease.
    pub fn record_batch(&mut self, processed: u64, failed: u64) {
        self.processed_records = self.processed_records.saturating_add(processed);
        self.failed_records = self.failed_records.saturating_add(failed);
    }

    /// running → completed.
    pub fn complete(&mut self) -> Result<()> {
        self.finish(JobStatus::Completed, "complete", None)
    }

    /// running → failed.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<()> {
        self.finish(JobStatus::Failed, "fail", Some(message.into()))
    }

    /// running → stopped.
    pub fn stop(&mut self) -> Result<()> {
        self.finish(JobStatus::Stopped, "stop", None)
    }

    fn finish(&mut self, status: JobStatus, action: &str, error: Option<String>) -> Result<()> {
        if self.status != JobStatus::Running {
            return Err(self.invalid(action));
        }
        self.status = status;
        self.end_time = Some(Utc::now());
        self.error_message = error;
        Ok(())
    }

    /// processed / total × 100; 0 when the total is unknown.
    pub fn progress_percentage(&self) -> f64 {
        if self.total_records == 0 {
            return 0.0;
        }
        (self.processed_records as f64 / self.total_records as f64 * 100.0).min(100.0)
    }

    /// `end_time − start_time`, or `now − start_time` while running.
    pub fn duration(&self) -> Option<chrono::Duration> {
        let start = self.start_time?;
        Some(self.end_time.unwrap_or_else(Utc::now) - start)
    }

    pub fn metrics(&self) -> JobMetrics {
        let elapsed_secs = self
            .duration()
            .map(|d| d.num_milliseconds().max(0) as f64 / 1000.0)
            .unwrap_or(0.0);
        let records_per_second = if elapsed_secs > 0.0 {
            self.processed_records as f64 / elapsed_secs
        } else {
            0.0
        };
        let eta_secs = match self.status {
            JobStatus::Running if self.total_records > 0 && records_per_second > 0.0 => {
                let remaining = self.total_records.saturating_sub(self.processed_records);
                Some(remaining as f64 / records_per_second)
            }
            _ => None,
        };
        JobMetrics {
            progress_percentage: self.progress_percentage(),
            elapsed_secs,
            records_per_second,
            eta_secs,
        }
    }
}

/// Job table persistence.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Allocate the next job id. Ids are never reused.
    async fn next_id(&self) -> Result<JobId>;

    /// Insert or replace a job.
    async fn save(&self, job: &MigrationJob) -> Result<()>;

    async fn get(&self, id: JobId) -> Result<Option<MigrationJob>>;

    /// All jobs, ordered by id.
    async fn list(&self) -> Result<Vec<MigrationJob>>;

    fn backend_type(&self) -> &'static str;
}

/// Per-mapping CDC watermark persistence.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn get(&self, mapping: &str) -> Result<Option<SqlValue>>;

    async fn set(&self, mapping: &str, value: &SqlValue) -> Result<()>;
}

/// Serialize `value` to `path` through a temp file and rename.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)
        .map_err(|e| MigrateError::State(format!("Failed to serialize state: {}", e)))?;
    let temp_path = path.with_extension("tmp");
    std::fs::write(&temp_path, &content)?;
    std::fs::rename(&temp_path, path)?;
    Ok(())
}
