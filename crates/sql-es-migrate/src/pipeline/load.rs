//! Load: bulk writes with whole-request retry and per-document dead-lettering.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::{Document, Row};
use crate::deadletter::{DeadLetterRecord, DeadLetterStore, FailureStage};
use crate::error::{MigrateError, Result};
use crate::retry::RetryPolicy;
use crate::state::JobId;
use crate::target::TargetSystem;

/// A transformed document and the source rows it came from.
#[derive(Debug, Clone)]
pub struct LoadItem {
    pub document: Document,
    pub rows: Vec<Row>,
}

/// Counts for one `load` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOutcome {
    pub loaded: u64,
    pub failed: u64,
}

/// Writes documents to one target index.
pub struct Loader {
    target: Arc<dyn TargetSystem>,
    index: String,
    retry: RetryPolicy,
    bulk_batch_size: usize,
    dead_letters: Arc<dyn DeadLetterStore>,
    mapping_id: String,
    job_id: Option<JobId>,
}

impl Loader {
    pub fn new(
        target: Arc<dyn TargetSystem>,
        index: &str,
        retry: RetryPolicy,
        bulk_batch_size: usize,
        dead_letters: Arc<dyn DeadLetterStore>,
        mapping_id: &str,
    ) -> Self {
        Self {
            target,
            index: index.to_string(),
            retry,
            bulk_batch_size: bulk_batch_size.max(1),
            dead_letters,
            mapping_id: mapping_id.to_string(),
            job_id: None,
        }
    }

    /// Tag dead letters with the job that produced them.
    pub fn for_job(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    /// Write `items` in bulk requests of at most `bulk_batch_size`.
    ///
    /// A request that fails as a whole is retried with backoff; exhausting
    /// the attempts is a fatal `LoadBatch` error. Documents rejected
    /// individually are dead-lettered and never retried here. `abort` only
    /// interrupts backoff sleeps.
    pub async fn load(&self, items: Vec<LoadItem>, abort: &CancellationToken) -> Result<LoadOutcome> {
        let mut outcome = LoadOutcome::default();
        self.load_into(items, abort, &mut outcome).await?;
        Ok(outcome)
    }

    /// Like [`load`](Self::load), accumulating into `outcome` as each bulk
    /// request settles. On error `outcome` still holds the counts of the
    /// requests written before the failing one.
    pub async fn load_into(
        &self,
        items: Vec<LoadItem>,
        abort: &CancellationToken,
        outcome: &mut LoadOutcome,
    ) -> Result<()> {
        let mut items = items.into_iter().peekable();
        while items.peek().is_some() {
            let chunk: Vec<LoadItem> = items.by_ref().take(self.bulk_batch_size).collect();
            let documents: Vec<Document> = chunk.iter().map(|i| i.document.clone()).collect();

            let response = self
                .retry
                .run(&format!("bulk write to {}", self.index), abort, |_| {
                    self.target.bulk_write(&self.index, &documents)
                })
                .await
                .map_err(|e| self.exhausted(e))?;

            if response.items.len() != chunk.len() {
                return Err(MigrateError::load_batch(
                    &self.index,
                    1,
                    format!(
                        "bulk response has {} items for {} documents",
                        response.items.len(),
                        chunk.len()
                    ),
                ));
            }

            for (item, result) in chunk.into_iter().zip(response.items) {
                match result.error {
                    None => outcome.loaded += 1,
                    Some(reason) => {
                        warn!(
                            "Document {} rejected by {} (status {}): {}",
                            item.document.id.as_deref().unwrap_or("<auto>"),
                            self.index,
                            result.status,
                            reason
                        );
                        let record = DeadLetterRecord::new(
                            &self.mapping_id,
                            self.job_id,
                            FailureStage::Load,
                            item.rows,
                            reason,
                        )
                        .with_document(item.document.to_value());
                        self.dead_letters.add(record).await?;
                        outcome.failed += 1;
                    }
                }
            }
            debug!(
                "Bulk write to {}: {} loaded, {} failed so far",
                self.index, outcome.loaded, outcome.failed
            );
        }
        Ok(())
    }

    /// Normalize a retryable error that ran out of attempts into `LoadBatch`.
    fn exhausted(&self, e: MigrateError) -> MigrateError {
        match e {
            MigrateError::LoadBatch { index, message, .. } => MigrateError::LoadBatch {
                index,
                attempts: self.retry.max_attempts,
                message,
            },
            MigrateError::Connectivity { system, message } => MigrateError::load_batch(
                &self.index,
                self.retry.max_attempts,
                format!("{} connectivity error: {}", system, message),
            ),
            other => other,
        }
    }
}
