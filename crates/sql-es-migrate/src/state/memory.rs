//! In-memory state backends.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{JobId, JobRepository, MigrationJob, WatermarkStore};
use crate::core::SqlValue;
use crate::error::Result;

/// Job table held in process memory.
#[derive(Default)]
pub struct MemoryJobRepository {
    jobs: RwLock<BTreeMap<JobId, MigrationJob>>,
    last_id: AtomicU64,
}

impl MemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobRepository for MemoryJobRepository {
    async fn next_id(&self) -> Result<JobId> {
        Ok(JobId(self.last_id.fetch_add(1, Ordering::SeqCst) + 1))
    }

    async fn save(&self, job: &MigrationJob) -> Result<()> {
        self.jobs.write().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<MigrationJob>> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<MigrationJob>> {
        Ok(self.jobs.read().await.values().cloned().collect())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

/// Watermarks held in process memory.
#[derive(Default)]
pub struct MemoryWatermarkStore {
    marks: RwLock<HashMap<String, SqlValue>>,
}

impl MemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WatermarkStore for MemoryWatermarkStore {
    async fn get(&self, mapping: &str) -> Result<Option<SqlValue>> {
        Ok(self.marks.read().await.get(mapping).cloned())
    }

    async fn set(&self, mapping: &str, value: &SqlValue) -> Result<()> {
        self.marks
            .write()
            .await
            .insert(mapping.to_string(), value.clone());
        Ok(())
    }
}
