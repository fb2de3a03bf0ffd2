//! Transform + load for one batch of source records.

use std::cmp::Ordering;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::load::{LoadItem, LoadOutcome, Loader};
use crate::core::SqlValue;
use crate::deadletter::{DeadLetterRecord, DeadLetterStore, FailureStage};
use crate::error::Result;
use crate::state::JobId;
use crate::transform::{SourceRecord, TransformEngine};

/// Counts reported upward for one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    /// Records attempted: loaded plus dead-lettered.
    pub processed: u64,
    /// Records dead-lettered at either stage.
    pub failed: u64,
    /// Highest change indicator among the batch's rows, when tracked.
    pub max_indicator: Option<SqlValue>,
    /// Highest indicator strictly below `max_indicator`. Rows sharing the
    /// maximum may continue in the next batch; every row at or below this
    /// value has been written.
    pub settled_indicator: Option<SqlValue>,
}

impl BatchOutcome {
    pub fn is_empty(&self) -> bool {
        self.processed == 0
    }
}

/// Runs records through the transform engine and the loader. Transform
/// failures are dead-lettered and never abort the batch.
pub struct BatchProcessor {
    engine: Arc<TransformEngine>,
    loader: Loader,
    dead_letters: Arc<dyn DeadLetterStore>,
    job_id: Option<JobId>,
}

impl BatchProcessor {
    pub fn new(engine: Arc<TransformEngine>, loader: Loader, dead_letters: Arc<dyn DeadLetterStore>) -> Self {
        Self {
            engine,
            loader,
            dead_letters,
            job_id: None,
        }
    }

    pub fn for_job(mut self, job_id: JobId) -> Self {
        self.loader = self.loader.for_job(job_id);
        self.job_id = Some(job_id);
        self
    }

    pub fn engine(&self) -> &TransformEngine {
        &self.engine
    }

    pub async fn process(&self, records: Vec<SourceRecord>, abort: &CancellationToken) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        self.process_into(records, abort, &mut outcome).await?;
        Ok(outcome)
    }

    /// Process a batch, counting each record into `outcome` once its fate
    /// is settled. When the load fails, `outcome` holds the records already
    /// dead-lettered or written, and no indicators.
    pub async fn process_into(
        &self,
        records: Vec<SourceRecord>,
        abort: &CancellationToken,
        outcome: &mut BatchOutcome,
    ) -> Result<()> {
        let mapping = self.engine.mapping();
        let indicator = mapping.change_tracking.as_ref().map(|c| c.column.as_str());

        let mut indicators = Vec::new();
        let mut items = Vec::with_capacity(records.len());
        for record in records {
            if let Some(column) = indicator {
                indicators.extend(record.rows.iter().filter_map(|r| r.get(column)).cloned());
            }
            match self.engine.transform(&record) {
                Ok(document) => items.push(LoadItem {
                    document,
                    rows: record.rows,
                }),
                Err(e) => {
                    warn!("Record dead-lettered by mapping '{}': {}", mapping.name, e);
                    let letter = DeadLetterRecord::new(
                        &mapping.name,
                        self.job_id,
                        FailureStage::Transform,
                        record.rows,
                        e.to_string(),
                    );
                    self.dead_letters.add(letter).await?;
                    outcome.processed += 1;
                    outcome.failed += 1;
                }
            }
        }

        if !items.is_empty() {
            let mut loaded = LoadOutcome::default();
            let result = self.loader.load_into(items, abort, &mut loaded).await;
            outcome.processed += loaded.loaded + loaded.failed;
            outcome.failed += loaded.failed;
            result?;
        }

        let (max, settled) = indicator_bounds(&indicators);
        outcome.max_indicator = max;
        outcome.settled_indicator = settled;
        Ok(())
    }
}

/// The highest value, and the highest value strictly below it.
fn indicator_bounds(values: &[SqlValue]) -> (Option<SqlValue>, Option<SqlValue>) {
    let mut max = None;
    for value in values {
        raise(&mut max, value);
    }
    let mut settled = None;
    if let Some(top) = &max {
        for value in values {
            if value.compare(top) == Some(Ordering::Less) {
                raise(&mut settled, value);
            }
        }
    }
    (max, settled)
}

/// Keep the larger of `current` and `candidate`; nulls never win.
pub(crate) fn raise(current: &mut Option<SqlValue>, candidate: &SqlValue) {
    if candidate.is_null() {
        return;
    }
    let replace = match current {
        None => true,
        Some(existing) => candidate.compare(existing) == Some(Ordering::Greater),
    };
    if replace {
        *current = Some(candidate.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Row;
    use crate::deadletter::MemoryDeadLetterStore;
    use crate::mapping::{ChangeTracking, FieldMapping, IndicatorKind, MappingConfiguration, TransformationRule};
    use crate::retry::RetryPolicy;
    use crate::target::MemoryTarget;
    use crate::transform::TransformConfig;
    use crate::typemap::FieldType;

    fn mapping() -> MappingConfiguration {
        let mut cfg = MappingConfiguration::new("orders", "db", "SELECT * FROM orders", "es", "orders");
        cfg.identity_key = Some("ORDER_ID".into());
        cfg.set_field_mapping(FieldMapping::new("ORDER_ID", "order_id", FieldType::Long));
        cfg.set_field_mapping(FieldMapping::new("AMOUNT", "amount", FieldType::Double));
        cfg.set_field_mapping(FieldMapping::new("ORDER_DATE", "order_date", FieldType::Date));
        cfg.transformation_rules
            .push(TransformationRule::new("order_date", "date_normalize"));
        cfg.change_tracking = Some(ChangeTracking {
            column: "ORDER_ID".into(),
            kind: IndicatorKind::LogPosition,
        });
        cfg
    }

    fn row(id: i64, amount: &str) -> SourceRecord {
        SourceRecord::single(Row::from_pairs([
            ("ORDER_ID", SqlValue::I64(id)),
            ("AMOUNT", SqlValue::from(amount)),
            ("ORDER_DATE", SqlValue::from("2024-01-15")),
        ]))
    }

    fn processor(target: Arc<MemoryTarget>, dlq: Arc<MemoryDeadLetterStore>) -> BatchProcessor {
        let engine = Arc::new(TransformEngine::new(mapping(), &TransformConfig::default()).unwrap());
        let loader = Loader::new(target, "orders", RetryPolicy::none(), 100, dlq.clone(), "orders");
        BatchProcessor::new(engine, loader, dlq).for_job(JobId(1))
    }

    #[tokio::test]
    async fn test_non_numeric_amount_is_dead_lettered() {
        let target = Arc::new(MemoryTarget::new());
        let dlq = Arc::new(MemoryDeadLetterStore::new());
        let outcome = processor(target.clone(), dlq.clone())
            .process(vec![row(1, "19.99"), row(2, "abc")], &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.processed, 2);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.max_indicator, Some(SqlValue::I64(2)));
        assert_eq!(outcome.settled_indicator, Some(SqlValue::I64(1)));
        assert_eq!(target.doc_count("orders"), 1);

        let letters = dlq.list(Some("orders")).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].stage, FailureStage::Transform);
        assert_eq!(letters[0].job_id, Some(JobId(1)));
        assert!(letters[0].error_message.contains("amount"));
    }

    #[tokio::test]
    async fn test_empty_batch_skips_target() {
        let target = Arc::new(MemoryTarget::new());
        let dlq = Arc::new(MemoryDeadLetterStore::new());
        let outcome = processor(target.clone(), dlq)
            .process(Vec::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.is_empty());
        assert_eq!(target.bulk_calls(), 0);
    }

    #[tokio::test]
    async fn test_load_failure_keeps_dead_letter_counts() {
        let target = Arc::new(MemoryTarget::new());
        target.fail_next_bulk(10);
        let dlq = Arc::new(MemoryDeadLetterStore::new());
        let mut outcome = BatchOutcome::default();
        let err = processor(target.clone(), dlq.clone())
            .process_into(vec![row(1, "10.50"), row(2, "abc")], &CancellationToken::new(), &mut outcome)
            .await
            .unwrap_err();

        assert!(matches!(err, crate::error::MigrateError::LoadBatch { .. }), "{}", err);
        assert_eq!((outcome.processed, outcome.failed), (1, 1));
        assert_eq!(outcome.failed, dlq.list(Some("orders")).await.unwrap().len() as u64);
        assert_eq!(outcome.max_indicator, None);
        assert_eq!(target.doc_count("orders"), 0);
    }

    #[test]
    fn test_settled_indicator_stops_below_ties() {
        let values = [SqlValue::I64(5), SqlValue::I64(7), SqlValue::I64(7)];
        assert_eq!(
            indicator_bounds(&values),
            (Some(SqlValue::I64(7)), Some(SqlValue::I64(5)))
        );
        let tied = [SqlValue::I64(7), SqlValue::I64(7)];
        assert_eq!(indicator_bounds(&tied), (Some(SqlValue::I64(7)), None));
        assert_eq!(indicator_bounds(&[]), (None, None));
    }

    #[test]
    fn test_raise_ignores_nulls_and_smaller_values() {
        let mut max = None;
        raise(&mut max, &SqlValue::Null);
        assert_eq!(max, None);
        raise(&mut max, &SqlValue::I64(5));
        raise(&mut max, &SqlValue::I64(3));
        assert_eq!(max, Some(SqlValue::I64(5)));
    }
}
