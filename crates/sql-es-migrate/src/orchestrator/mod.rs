//! Job Controller: job lifecycle and the control operations built on it.
//!
//! Every job runs on its own task. The task is the only writer of its job's
//! status and counters; control calls signal it through a stop token and
//! read snapshots from the job repository.

mod runner;
mod tools;

pub use tools::{
    ConnectionHealth, CountValidation, HealthReport, PreviewError, PreviewResult, ReprocessReport,
};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cdc::{CdcSynchronizer, ColumnChangeSource};
use crate::config::{Config, EngineConfig};
use crate::connections::{ConfiguredConnections, ConnectionResolver};
use crate::deadletter::{DeadLetterStore, FileDeadLetterStore, MemoryDeadLetterStore};
use crate::error::{MigrateError, Result};
use crate::mapping::{MappingConfiguration, MappingStore, MemoryMappingStore, MigrationStrategy};
use crate::state::{
    FileJobRepository, FileWatermarkStore, JobId, JobRepository, JobStatus, MappingLocks,
    MemoryJobRepository, MemoryWatermarkStore, MigrationJob, WatermarkStore,
};
use crate::transform::TransformEngine;
use crate::typemap::TypeMapper;

/// Signals for one executing job.
struct ActiveJob {
    attempt: u32,
    stop: CancellationToken,
    status: watch::Sender<JobStatus>,
}

type ActiveJobs = Arc<Mutex<HashMap<JobId, ActiveJob>>>;

/// Owns the job table and starts, stops and retries jobs.
pub struct JobController {
    resolver: Arc<dyn ConnectionResolver>,
    mappings: Arc<dyn MappingStore>,
    jobs: Arc<dyn JobRepository>,
    watermarks: Arc<dyn WatermarkStore>,
    dead_letters: Arc<dyn DeadLetterStore>,
    locks: Arc<MappingLocks>,
    engine: EngineConfig,
    type_mapper: TypeMapper,
    active: ActiveJobs,
    shutdown: CancellationToken,
}

impl JobController {
    /// A controller with in-memory job, watermark and dead-letter stores.
    pub fn new(
        resolver: Arc<dyn ConnectionResolver>,
        mappings: Arc<dyn MappingStore>,
        engine: EngineConfig,
    ) -> Self {
        let type_mapper = TypeMapper::new(engine.type_mapper.clone());
        Self {
            resolver,
            mappings,
            jobs: Arc::new(MemoryJobRepository::new()),
            watermarks: Arc::new(MemoryWatermarkStore::new()),
            dead_letters: Arc::new(MemoryDeadLetterStore::new()),
            locks: Arc::new(MappingLocks::new()),
            engine,
            type_mapper,
            active: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    /// Build connections, stores and the mapping store from a loaded config.
    pub fn from_config(config: &Config) -> Result<Self> {
        let resolver = Arc::new(ConfiguredConnections::new(config.connections.clone()));
        let mappings = Arc::new(MemoryMappingStore::new(config.mappings.iter().cloned()));
        let mut controller = Self::new(resolver, mappings, config.engine.clone());

        if let Some(dir) = &config.state.dir {
            controller = controller
                .with_job_repository(Arc::new(FileJobRepository::open(dir)?))
                .with_watermark_store(Arc::new(FileWatermarkStore::open(dir)?));
        }
        if let Some(dir) = &config.dead_letter.dir {
            controller = controller.with_dead_letter_store(Arc::new(FileDeadLetterStore::open(dir)?));
        }
        info!(
            "Job controller ready (jobs: {}, config hash {})",
            controller.jobs.backend_type(),
            config.hash()
        );
        Ok(controller)
    }

    pub fn with_job_repository(mut self, jobs: Arc<dyn JobRepository>) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn with_watermark_store(mut self, watermarks: Arc<dyn WatermarkStore>) -> Self {
        self.watermarks = watermarks;
        self
    }

    pub fn with_dead_letter_store(mut self, dead_letters: Arc<dyn DeadLetterStore>) -> Self {
        self.dead_letters = dead_letters;
        self
    }

    /// Token that aborts retry backoff in every job, for process shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn engine_config(&self) -> &EngineConfig {
        &self.engine
    }

    pub fn dead_letter_store(&self) -> Arc<dyn DeadLetterStore> {
        self.dead_letters.clone()
    }

    /// A CDC synchronizer sharing this controller's stores and mapping locks.
    pub fn synchronizer(&self) -> CdcSynchronizer {
        CdcSynchronizer::new(
            self.resolver.clone(),
            self.mappings.clone(),
            self.watermarks.clone(),
            self.dead_letters.clone(),
            self.locks.clone(),
            self.engine.clone(),
        )
    }

    async fn load_mapping(&self, name: &str) -> Result<MappingConfiguration> {
        let name = name.trim();
        self.mappings
            .get(name)
            .await?
            .ok_or_else(|| MigrateError::Config(format!("mapping '{}' not found", name)))
    }

    /// Everything that makes a mapping unrunnable. Checked before a job exists.
    fn check_runnable(&self, mapping: &MappingConfiguration) -> Result<()> {
        mapping.validate()?;
        TransformEngine::new(mapping.clone(), &self.engine.transform)?;
        if mapping.strategy == MigrationStrategy::Incremental {
            ColumnChangeSource::for_mapping(mapping)?;
        }
        Ok(())
    }

    /// Create a pending job for a mapping and start it. Configuration errors
    /// are returned without creating a job. The job runs on a snapshot of the
    /// mapping taken here.
    pub async fn submit_job(&self, mapping: &str) -> Result<JobId> {
        let mapping = self.load_mapping(mapping).await?;
        self.check_runnable(&mapping)?;

        let id = self.jobs.next_id().await?;
        let job = MigrationJob::new(id, &mapping.name);
        self.jobs.save(&job).await?;
        info!("Submitted job {} for mapping '{}'", id, mapping.name);
        self.spawn(job, mapping);
        Ok(id)
    }

    pub async fn get_job(&self, id: JobId) -> Result<MigrationJob> {
        self.jobs.get(id).await?.ok_or(MigrateError::JobNotFound(id))
    }

    pub async fn list_jobs(&self) -> Result<Vec<MigrationJob>> {
        self.jobs.list().await
    }

    /// Ask a running job to stop at its next batch boundary. A no-op for jobs
    /// in any other status. Returns the job as it is now; the status turns
    /// `stopped` once the in-flight batch has completed.
    pub async fn stop_job(&self, id: JobId) -> Result<MigrationJob> {
        let job = self.get_job(id).await?;
        if job.status != JobStatus::Running {
            info!("Job {} is {}, nothing to stop", id, job.status);
            return Ok(job);
        }
        let signalled = self
            .lock_active()
            .get(&id)
            .map(|active| active.stop.cancel())
            .is_some();
        if signalled {
            info!("Stop requested for job {}", id);
        }
        Ok(job)
    }

    /// Start a fresh execution of a failed job under the same id. The job is
    /// `running` with reset counters when this returns.
    pub async fn retry_job(&self, id: JobId) -> Result<MigrationJob> {
        let mut job = self.get_job(id).await?;
        if job.status != JobStatus::Failed {
            return Err(MigrateError::InvalidTransition {
                job: id,
                from: job.status.to_string(),
                action: "retry".into(),
            });
        }
        let mapping = self.load_mapping(&job.mapping_configuration_id).await?;
        self.check_runnable(&mapping)?;

        job.restart()?;
        self.jobs.save(&job).await?;
        info!("Retrying job {} (attempt {})", id, job.attempt);
        self.spawn(job.clone(), mapping);
        Ok(job)
    }

    /// Wait until a job reaches a terminal status and return it.
    pub async fn wait_for(&self, id: JobId) -> Result<MigrationJob> {
        let receiver = self.lock_active().get(&id).map(|a| a.status.subscribe());
        if let Some(mut receiver) = receiver {
            // A dropped sender means the runner has finished.
            let _ = receiver.wait_for(|status| status.is_terminal()).await;
        }
        self.get_job(id).await
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, ActiveJob>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn spawn(&self, job: MigrationJob, mapping: MappingConfiguration) {
        let stop = CancellationToken::new();
        let (status, _) = watch::channel(job.status);
        let attempt = job.attempt;
        let id = job.id;
        self.lock_active().insert(
            id,
            ActiveJob {
                attempt,
                stop: stop.clone(),
                status: status.clone(),
            },
        );

        let runner = runner::JobRunner {
            resolver: self.resolver.clone(),
            jobs: self.jobs.clone(),
            watermarks: self.watermarks.clone(),
            dead_letters: self.dead_letters.clone(),
            locks: self.locks.clone(),
            engine: self.engine.clone(),
            shutdown: self.shutdown.clone(),
            status,
        };
        let active = self.active.clone();
        tokio::spawn(async move {
            runner.run(job, mapping, stop).await;
            let mut active = match active.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            // A retry may already have registered the next execution.
            if active.get(&id).is_some_and(|a| a.attempt == attempt) {
                active.remove(&id);
            }
        });
    }
}
