//! Execution of one job from lock acquisition to its terminal status.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cdc::{ChangeSource, ColumnChangeSource};
use crate::config::EngineConfig;
use crate::connections::ConnectionResolver;
use crate::deadletter::DeadLetterStore;
use crate::error::{MigrateError, Result};
use crate::mapping::{index_mapping, MappingConfiguration, MigrationStrategy};
use crate::pipeline::{BatchOutcome, Pipeline, ProgressReporter, RunSummary};
use crate::source::SourceQuery;
use crate::state::{JobRepository, JobStatus, MappingLocks, MigrationJob, WatermarkStore};

pub(super) struct JobRunner {
    pub resolver: Arc<dyn ConnectionResolver>,
    pub jobs: Arc<dyn JobRepository>,
    pub watermarks: Arc<dyn WatermarkStore>,
    pub dead_letters: Arc<dyn DeadLetterStore>,
    pub locks: Arc<MappingLocks>,
    pub engine: EngineConfig,
    pub shutdown: CancellationToken,
    pub status: watch::Sender<JobStatus>,
}

/// The job's single writer while it executes. Applies per-batch counts and
/// persists the snapshot.
struct JobProgress {
    job: Mutex<MigrationJob>,
    jobs: Arc<dyn JobRepository>,
    status: watch::Sender<JobStatus>,
}

impl JobProgress {
    async fn update<F>(&self, apply: F) -> Result<MigrationJob>
    where
        F: FnOnce(&mut MigrationJob) -> Result<()> + Send,
    {
        let mut job = self.job.lock().await;
        apply(&mut job)?;
        self.jobs.save(&job).await?;
        self.status.send_replace(job.status);
        Ok(job.clone())
    }

    async fn snapshot(&self) -> MigrationJob {
        self.job.lock().await.clone()
    }
}

#[async_trait]
impl ProgressReporter for JobProgress {
    async fn report(&self, outcome: &BatchOutcome) -> Result<()> {
        let job = self
            .update(|job| {
                job.record_batch(outcome.processed, outcome.failed);
                Ok(())
            })
            .await?;
        debug!(
            "Job {}: {}/{} records ({:.1}%), {} failed",
            job.id,
            job.processed_records,
            job.total_records,
            job.progress_percentage(),
            job.failed_records
        );
        Ok(())
    }
}

impl JobRunner {
    pub async fn run(self, job: MigrationJob, mapping: MappingConfiguration, stop: CancellationToken) {
        let id = job.id;
        let progress = JobProgress {
            job: Mutex::new(job),
            jobs: self.jobs.clone(),
            status: self.status.clone(),
        };

        // Jobs on the same mapping, and CDC cycles, run one at a time.
        let guard = tokio::select! {
            guard = self.locks.lock(&mapping.name) => Some(guard),
            _ = self.shutdown.cancelled() => None,
        };

        let result = match guard {
            Some(_guard) => self.execute(&progress, mapping, &stop).await,
            None => Err(MigrateError::Cancelled),
        };

        let finished = match result {
            Ok(summary) if summary.stopped => progress.update(|job| job.stop()).await,
            Ok(_) => progress.update(|job| job.complete()).await,
            Err(e) => {
                error!("Job {} failed: {}", id, e);
                let message = e.to_string();
                progress
                    .update(move |job| {
                        if job.status == JobStatus::Pending {
                            job.start(None)?;
                        }
                        job.fail(message)
                    })
                    .await
            }
        };

        match finished {
            Ok(job) => info!(
                "Job {} {}: {} processed, {} failed in {:.1}s",
                id,
                job.status,
                job.processed_records,
                job.failed_records,
                job.metrics().elapsed_secs
            ),
            Err(e) => error!("Job {}: could not record final status: {}", id, e),
        }
    }

    async fn execute(
        &self,
        progress: &JobProgress,
        mapping: MappingConfiguration,
        stop: &CancellationToken,
    ) -> Result<RunSummary> {
        let id = progress.snapshot().await.id;
        progress
            .update(|job| match job.status {
                JobStatus::Pending => job.start(None),
                // A retry is already running.
                _ => Ok(()),
            })
            .await?;
        info!("Job {}: starting mapping '{}'", id, mapping.name);

        info!("Phase 1: Connecting to source and target");
        let source = self.resolver.source(&mapping.source_connection).await?;
        let target = self.resolver.target(&mapping.target_connection).await?;
        source.ping().await?;
        if target
            .ensure_index(&mapping.target_index, &index_mapping(&mapping))
            .await?
        {
            info!("Created index {}", mapping.target_index);
        }

        info!("Phase 2: Planning extraction");
        let base = mapping.query()?;
        let changes = match mapping.strategy {
            MigrationStrategy::Incremental => Some(ColumnChangeSource::for_mapping(&mapping)?),
            MigrationStrategy::Full => None,
        };
        let query = match &changes {
            Some(changes) => {
                let mark = self.watermarks.get(&mapping.name).await?;
                if let Some(mark) = &mark {
                    changes.check(mark)?;
                }
                info!(
                    "Incremental run from watermark {}",
                    mark.as_ref().map_or_else(|| "<start>".to_string(), |m| m.to_string())
                );
                changes.changes_since(&base, mark.as_ref())
            }
            None => SourceQuery::new(base),
        };
        let query = query.counting_distinct(mapping.grouping.as_ref().map(|g| g.parent_key.as_str()));

        let name = mapping.name.clone();
        let pipeline = Pipeline::for_mapping(
            mapping,
            source,
            target,
            self.dead_letters.clone(),
            &self.engine,
            Some(id),
        )?;
        let total = pipeline.count(&query).await;
        match total {
            Some(n) => info!("Job {}: {} records to migrate", id, n),
            None => warn!("Job {}: record count unavailable, progress will stay at 0%", id),
        }
        progress
            .update(|job| {
                job.total_records = total.unwrap_or(0);
                Ok(())
            })
            .await?;

        info!("Phase 3: Transferring records");
        let summary = pipeline.run(query, stop, &self.shutdown, progress).await?;

        if let (Some(changes), false) = (&changes, summary.stopped) {
            if let Some(mark) = &summary.max_indicator {
                changes.check(mark)?;
                self.watermarks.set(&name, mark).await?;
                info!("Advanced watermark of '{}' to {}", name, mark);
            }
        }
        Ok(summary)
    }
}
