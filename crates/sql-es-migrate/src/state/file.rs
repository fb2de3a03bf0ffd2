//! JSON-file state backends (`jobs.json`, `watermarks.json`).
//!
//! Each save rewrites the whole file atomically.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{write_json_atomic, JobId, JobRepository, JobStatus, MigrationJob, WatermarkStore};
use crate::core::SqlValue;
use crate::error::{MigrateError, Result};

#[derive(Debug, Default, Serialize, Deserialize)]
struct JobFile {
    last_id: u64,
    jobs: BTreeMap<JobId, MigrationJob>,
}

/// Job table persisted to `<dir>/jobs.json`.
pub struct FileJobRepository {
    path: PathBuf,
    state: Mutex<JobFile>,
}

impl FileJobRepository {
    /// Open or create the job file. Jobs left pending or running by a
    /// previous process are marked failed so they can be retried.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join("jobs.json");
        let mut state: JobFile = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content)
                .map_err(|e| MigrateError::State(format!("{}: {}", path.display(), e)))?
        } else {
            JobFile::default()
        };

        let mut interrupted = 0;
        for job in state.jobs.values_mut() {
            if matches!(job.status, JobStatus::Pending | JobStatus::Running) {
                if job.status == JobStatus::Pending {
                    job.status = JobStatus::Running;
                }
                let _ = job.fail("interrupted: process exited before the job finished");
                interrupted += 1;
            }
        }
        if interrupted > 0 {
            warn!("Marked {} interrupted job(s) as failed", interrupted);
            write_json_atomic(&path, &state)?;
        }
        info!("Job state file: {} ({} jobs)", path.display(), state.jobs.len());

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }
}

#[async_trait]
impl JobRepository for FileJobRepository {
    async fn next_id(&self) -> Result<JobId> {
        let mut state = self.state.lock().await;
        let floor = state.jobs.keys().next_back().map(|id| id.0).unwrap_or(0);
        state.last_id = state.last_id.max(floor) + 1;
        let id = JobId(state.last_id);
        write_json_atomic(&self.path, &*state)?;
        Ok(id)
    }

    async fn save(&self, job: &MigrationJob) -> Result<()> {
        let mut state = self.state.lock().await;
        state.jobs.insert(job.id, job.clone());
        write_json_atomic(&self.path, &*state)
    }

    async fn get(&self, id: JobId) -> Result<Option<MigrationJob>> {
        Ok(self.state.lock().await.jobs.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<MigrationJob>> {
        Ok(self.state.lock().await.jobs.values().cloned().collect())
    }

    fn backend_type(&self) -> &'static str {
        "file"
    }
}

/// Watermarks persisted to `<dir>/watermarks.json`.
pub struct FileWatermarkStore {
    path: PathBuf,
    marks: Mutex<BTreeMap<String, SqlValue>>,
}

impl FileWatermarkStore {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join("watermarks.json");
        let marks = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content)
                .map_err(|e| MigrateError::State(format!("{}: {}", path.display(), e)))?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path,
            marks: Mutex::new(marks),
        })
    }
}

#[async_trait]
impl WatermarkStore for FileWatermarkStore {
    async fn get(&self, mapping: &str) -> Result<Option<SqlValue>> {
        Ok(self.marks.lock().await.get(mapping).cloned())
    }

    async fn set(&self, mapping: &str, value: &SqlValue) -> Result<()> {
        let mut marks = self.marks.lock().await;
        marks.insert(mapping.to_string(), value.clone());
        write_json_atomic(&self.path, &*marks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_jobs_survive_reopen() {
        let dir = tempdir().unwrap();
        let repo = FileJobRepository::open(dir.path()).unwrap();
        let id = repo.next_id().await.unwrap();
        let mut job = MigrationJob::new(id, "orders");
        job.start(Some(3)).unwrap();
        job.record_batch(3, 0);
        job.complete().unwrap();
        repo.save(&job).await.unwrap();
        drop(repo);

        let repo = FileJobRepository::open(dir.path()).unwrap();
        assert_eq!(repo.get(id).await.unwrap(), Some(job));
        assert!(repo.next_id().await.unwrap() > id);
    }

    #[tokio::test]
    async fn test_ids_not_reused_after_reopen() {
        let dir = tempdir().unwrap();
        let repo = FileJobRepository::open(dir.path()).unwrap();
        let first = repo.next_id().await.unwrap();
        drop(repo);
        let repo = FileJobRepository::open(dir.path()).unwrap();
        assert_eq!(repo.next_id().await.unwrap(), JobId(first.0 + 1));
    }

    #[tokio::test]
    async fn test_interrupted_jobs_marked_failed() {
        let dir = tempdir().unwrap();
        let repo = FileJobRepository::open(dir.path()).unwrap();
        let mut job = MigrationJob::new(repo.next_id().await.unwrap(), "orders");
        job.start(None).unwrap();
        repo.save(&job).await.unwrap();
        drop(repo);

        let repo = FileJobRepository::open(dir.path()).unwrap();
        let reloaded = repo.get(job.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, JobStatus::Failed);
        assert!(reloaded.error_message.unwrap().contains("interrupted"));
    }

    #[tokio::test]
    async fn test_watermarks_survive_reopen() {
        let dir = tempdir().unwrap();
        let store = FileWatermarkStore::open(dir.path()).unwrap();
        let ts = chrono::NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        store.set("orders", &SqlValue::DateTime(ts)).await.unwrap();
        drop(store);

        let store = FileWatermarkStore::open(dir.path()).unwrap();
        assert_eq!(store.get("orders").await.unwrap(), Some(SqlValue::DateTime(ts)));
        assert!(store.get("customers").await.unwrap().is_none());
    }
}
