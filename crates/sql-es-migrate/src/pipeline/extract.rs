//! Extraction: a producer task streaming source chunks into a bounded queue.
//!
//! The queue applies backpressure: the producer suspends once `queue_depth`
//! chunks are waiting. The stream is forward-only; a new run re-executes the
//! query.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::Batch;
use crate::error::{MigrateError, Result};
use crate::retry::RetryPolicy;
use crate::source::{SourceQuery, SourceSystem};

/// Reads one query from a source.
#[derive(Clone)]
pub struct Extractor {
    source: Arc<dyn SourceSystem>,
    chunk_size: usize,
    queue_depth: usize,
    retry: RetryPolicy,
}

impl Extractor {
    pub fn new(source: Arc<dyn SourceSystem>, chunk_size: usize, queue_depth: usize, retry: RetryPolicy) -> Self {
        Self {
            source,
            chunk_size: chunk_size.max(1),
            queue_depth: queue_depth.max(1),
            retry,
        }
    }

    /// Up-front record count. Any failure degrades to "unknown".
    pub async fn count(&self, query: &SourceQuery) -> Option<u64> {
        match self.source.count(query).await {
            Ok(count) => count,
            Err(e) => {
                warn!("Source count unavailable: {}", e);
                None
            }
        }
    }

    /// Start the producer. Opening the cursor is retried with the policy;
    /// a failure after rows have flowed is fatal because the cursor
    /// cannot be restarted.
    pub fn spawn(&self, query: SourceQuery, cancel: CancellationToken) -> ExtractionStream {
        let (tx, rx) = mpsc::channel::<Batch>(self.queue_depth);
        let source = self.source.clone();
        let retry = self.retry.clone();
        let chunk_size = self.chunk_size;

        let handle = tokio::spawn(async move {
            let mut cursor = retry
                .run("opening source cursor", &cancel, |_| source.open_cursor(&query, chunk_size))
                .await?;

            let mut sequence = 0u64;
            let mut rows = 0u64;
            loop {
                if cancel.is_cancelled() {
                    debug!("Extraction stopped after {} chunks", sequence);
                    break;
                }
                let Some(chunk) = cursor.next_chunk().await? else {
                    break;
                };
                rows += chunk.len() as u64;
                let batch = Batch::new(chunk, sequence);
                sequence += 1;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = tx.send(batch) => {
                        if sent.is_err() {
                            // Consumer went away (stop or failure).
                            break;
                        }
                    }
                }
            }
            debug!("Extraction read {} rows in {} chunks", rows, sequence);
            Ok(rows)
        });

        ExtractionStream { rx, handle }
    }
}

/// Consumer side of a running extraction.
pub struct ExtractionStream {
    rx: mpsc::Receiver<Batch>,
    handle: JoinHandle<Result<u64>>,
}

impl ExtractionStream {
    /// Next chunk, or `None` when the producer finished or failed.
    pub async fn next(&mut self) -> Option<Batch> {
        self.rx.recv().await
    }

    /// Close the queue and collect the producer's result (rows read).
    pub async fn finish(mut self) -> Result<u64> {
        self.rx.close();
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(MigrateError::connectivity(
                "source",
                format!("extraction task failed: {}", e),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SqlValue;
    use crate::source::{MemorySource, SourceField};

    fn source(n: i64) -> Arc<MemorySource> {
        let src = MemorySource::new(vec![SourceField::new("ID", "INTEGER")], vec![]);
        for id in 1..=n {
            src.upsert_row("ID", src.row([("ID", SqlValue::I64(id))]));
        }
        Arc::new(src)
    }

    #[tokio::test]
    async fn test_streams_all_chunks_in_order() {
        let extractor = Extractor::new(source(5), 2, 1, RetryPolicy::none());
        let mut stream = extractor.spawn(SourceQuery::new("q"), CancellationToken::new());
        let mut sizes = Vec::new();
        let mut sequences = Vec::new();
        while let Some(batch) = stream.next().await {
            sizes.push(batch.len());
            sequences.push(batch.sequence);
        }
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(sequences, vec![0, 1, 2]);
        assert_eq!(stream.finish().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_bounded_queue_holds_producer() {
        let src = source(10);
        let extractor = Extractor::new(src.clone(), 1, 2, RetryPolicy::none());
        let mut stream = extractor.spawn(SourceQuery::new("q"), CancellationToken::new());
        let first = stream.next().await.unwrap();
        assert_eq!(first.sequence, 0);
        // Producer cannot run ahead of the queue; closing it ends the run early.
        let read = stream.finish().await.unwrap();
        assert!(read < 10, "producer read {} rows past a closed queue", read);
    }

    #[tokio::test]
    async fn test_cursor_failure_surfaces_in_finish() {
        let src = source(4);
        src.fail_after_chunks(Some(1));
        let extractor = Extractor::new(src, 2, 4, RetryPolicy::none());
        let mut stream = extractor.spawn(SourceQuery::new("q"), CancellationToken::new());
        let mut batches = 0;
        while stream.next().await.is_some() {
            batches += 1;
        }
        assert_eq!(batches, 1);
        assert!(matches!(stream.finish().await, Err(MigrateError::Connectivity { .. })));
    }

    #[tokio::test]
    async fn test_count_degrades_to_unknown() {
        let src = MemorySource::new(vec![SourceField::new("ID", "INTEGER")], vec![]).without_count();
        let extractor = Extractor::new(Arc::new(src), 10, 1, RetryPolicy::none());
        assert_eq!(extractor.count(&SourceQuery::new("q")).await, None);
    }
}
