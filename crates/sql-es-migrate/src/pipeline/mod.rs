//! Extract → transform → load as a bounded producer/consumer chain.
//!
//! Extraction of the next chunk overlaps transform and load of the current
//! one. Stop requests are honored between batches; an in-flight batch always
//! completes and is reported before the run returns.

mod batch;
mod extract;
mod load;

pub use batch::{BatchOutcome, BatchProcessor};
pub(crate) use batch::raise;
pub use extract::{ExtractionStream, Extractor};
pub use load::{LoadItem, LoadOutcome, Loader};

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::core::SqlValue;
use crate::deadletter::DeadLetterStore;
use crate::error::Result;
use crate::mapping::MappingConfiguration;
use crate::retry::RetryPolicy;
use crate::source::{SourceQuery, SourceSystem};
use crate::state::JobId;
use crate::target::TargetSystem;
use crate::transform::{SourceRecord, TransformEngine};

/// Receives the counts of every completed batch.
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    async fn report(&self, outcome: &BatchOutcome) -> Result<()>;
}

/// Reporter that discards progress.
pub struct NoProgress;

#[async_trait]
impl ProgressReporter for NoProgress {
    async fn report(&self, _outcome: &BatchOutcome) -> Result<()> {
        Ok(())
    }
}

/// Totals for one pipeline run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub processed: u64,
    pub failed: u64,
    pub batches: u64,
    pub max_indicator: Option<SqlValue>,
    /// The run ended early on a stop request.
    pub stopped: bool,
}

impl RunSummary {
    fn add(&mut self, outcome: &BatchOutcome) {
        self.processed += outcome.processed;
        self.failed += outcome.failed;
        self.batches += 1;
        if let Some(v) = &outcome.max_indicator {
            raise(&mut self.max_indicator, v);
        }
    }
}

/// One mapping's extraction and processing.
pub struct Pipeline {
    extractor: Extractor,
    processor: BatchProcessor,
}

impl Pipeline {
    pub fn new(extractor: Extractor, processor: BatchProcessor) -> Self {
        Self { extractor, processor }
    }

    /// Wire a pipeline for one mapping with the engine's sizing and retry
    /// settings.
    pub fn for_mapping(
        mapping: MappingConfiguration,
        source: Arc<dyn SourceSystem>,
        target: Arc<dyn TargetSystem>,
        dead_letters: Arc<dyn DeadLetterStore>,
        engine: &EngineConfig,
        job_id: Option<JobId>,
    ) -> Result<Self> {
        let retry = RetryPolicy::from(&engine.retry);
        let loader = Loader::new(
            target,
            &mapping.target_index,
            retry.clone(),
            engine.get_bulk_batch_size(),
            dead_letters.clone(),
            &mapping.name,
        );
        let transform = Arc::new(TransformEngine::new(mapping, &engine.transform)?);
        let mut processor = BatchProcessor::new(transform, loader, dead_letters);
        if let Some(id) = job_id {
            processor = processor.for_job(id);
        }
        let extractor = Extractor::new(source, engine.get_chunk_size(), engine.get_queue_depth(), retry);
        Ok(Self::new(extractor, processor))
    }

    pub fn engine(&self) -> &TransformEngine {
        self.processor.engine()
    }

    /// Up-front record count; `None` when the source cannot count cheaply.
    pub async fn count(&self, query: &SourceQuery) -> Option<u64> {
        self.extractor.count(query).await
    }

    /// Run `query` to completion or until `stop` is requested.
    ///
    /// `abort` interrupts retry backoff and is meant for process shutdown;
    /// a stop request never interrupts an in-flight batch.
    pub async fn run(
        &self,
        query: SourceQuery,
        stop: &CancellationToken,
        abort: &CancellationToken,
        reporter: &dyn ProgressReporter,
    ) -> Result<RunSummary> {
        let mapping = self.processor.engine().mapping().name.clone();
        let producer = CancellationToken::new();
        let mut stream = self.extractor.spawn(query, producer.clone());
        let mut grouper = self.processor.engine().grouper();
        let mut summary = RunSummary::default();

        loop {
            let batch = tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    summary.stopped = true;
                    break;
                }
                batch = stream.next() => batch,
            };
            let Some(batch) = batch else {
                break;
            };

            let sequence = batch.sequence;
            let records = grouper.push_batch(batch.rows);
            let outcome = match self.process_batch(records, abort, reporter).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    producer.cancel();
                    if let Err(extract_err) = stream.finish().await {
                        debug!("Extraction ended with: {}", extract_err);
                    }
                    return Err(e);
                }
            };
            summary.add(&outcome);
            debug!(
                "{}: batch {} processed {} ({} failed), held back {} rows",
                mapping,
                sequence,
                outcome.processed,
                outcome.failed,
                grouper.pending_rows()
            );

            if stop.is_cancelled() {
                summary.stopped = true;
                break;
            }
        }

        producer.cancel();
        if summary.stopped {
            if let Err(e) = stream.finish().await {
                debug!("Extraction ended with: {}", e);
            }
            if grouper.pending_rows() > 0 {
                warn!(
                    "{}: stop requested, {} rows of an incomplete group were not processed",
                    mapping,
                    grouper.pending_rows()
                );
            }
            info!("{}: stopped after {} records", mapping, summary.processed);
            return Ok(summary);
        }

        let rows_read = stream.finish().await?;
        if let Some(record) = grouper.finish() {
            let outcome = self.process_batch(vec![record], abort, reporter).await?;
            summary.add(&outcome);
        }
        info!(
            "{}: read {} rows, processed {} records ({} failed)",
            mapping, rows_read, summary.processed, summary.failed
        );
        Ok(summary)
    }

    /// Process and report one batch. A batch that fails part-way still
    /// reports the records it settled before the error is returned.
    async fn process_batch(
        &self,
        records: Vec<SourceRecord>,
        abort: &CancellationToken,
        reporter: &dyn ProgressReporter,
    ) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        match self.processor.process_into(records, abort, &mut outcome).await {
            Ok(()) => {
                reporter.report(&outcome).await?;
                Ok(outcome)
            }
            Err(e) => {
                if !outcome.is_empty() {
                    if let Err(report_err) = reporter.report(&outcome).await {
                        warn!("Could not report partial batch: {}", report_err);
                    }
                }
                Err(e)
            }
        }
    }
}
