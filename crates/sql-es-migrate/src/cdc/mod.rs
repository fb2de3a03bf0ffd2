//! Change data capture: re-sync rows changed since a per-mapping watermark.
//!
//! Each cycle selects rows whose change indicator is greater than the stored
//! watermark, ascending, and loads them as upserts keyed by the mapping's
//! identity. After each written batch the watermark advances to the highest
//! indicator whose rows are all written: rows tied with a batch's last value
//! may continue in the next batch, so they are held back until the stream
//! ends. A stop or crash replays them and the upserts make the replay
//! harmless.

mod change;

pub use change::{ChangeSource, ColumnChangeSource};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::connections::ConnectionResolver;
use crate::core::SqlValue;
use crate::deadletter::DeadLetterStore;
use crate::error::{MigrateError, Result};
use crate::mapping::{index_mapping, MappingConfiguration, MappingStore};
use crate::pipeline::{raise, BatchOutcome, Pipeline, ProgressReporter};
use crate::state::{MappingLocks, WatermarkStore};

/// Result of one completed sync cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub mapping: String,
    pub processed: u64,
    pub failed: u64,
    pub previous_watermark: Option<SqlValue>,
    pub watermark: Option<SqlValue>,
}

/// What a sync request did.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Synced(SyncReport),
    /// Another job or cycle held the mapping.
    Skipped,
}

/// Keeps target indices in step with source changes.
pub struct CdcSynchronizer {
    resolver: Arc<dyn ConnectionResolver>,
    mappings: Arc<dyn MappingStore>,
    watermarks: Arc<dyn WatermarkStore>,
    dead_letters: Arc<dyn DeadLetterStore>,
    locks: Arc<MappingLocks>,
    engine: EngineConfig,
}

impl CdcSynchronizer {
    pub fn new(
        resolver: Arc<dyn ConnectionResolver>,
        mappings: Arc<dyn MappingStore>,
        watermarks: Arc<dyn WatermarkStore>,
        dead_letters: Arc<dyn DeadLetterStore>,
        locks: Arc<MappingLocks>,
        engine: EngineConfig,
    ) -> Self {
        Self {
            resolver,
            mappings,
            watermarks,
            dead_letters,
            locks,
            engine,
        }
    }

    /// Run one cycle for a mapping. The cycle is skipped when a job or
    /// another cycle holds the mapping. `cancel` ends the cycle at the next
    /// batch boundary.
    pub async fn sync_once(&self, mapping: &str, cancel: &CancellationToken) -> Result<SyncOutcome> {
        let config = self
            .mappings
            .get(mapping)
            .await?
            .ok_or_else(|| MigrateError::Config(format!("mapping '{}' not found", mapping)))?;
        check_syncable(&config)?;
        let changes = ColumnChangeSource::for_mapping(&config)?;

        let Some(_guard) = self.locks.try_lock(&config.name) else {
            info!("{}: mapping busy, skipping sync cycle", config.name);
            return Ok(SyncOutcome::Skipped);
        };

        let previous = self.watermarks.get(&config.name).await?;
        if let Some(mark) = &previous {
            changes.check(mark)?;
        }
        let query = changes.changes_since(&config.query()?, previous.as_ref());
        debug!(
            "{}: syncing changes after {}",
            config.name,
            previous.as_ref().map_or_else(|| "<start>".to_string(), |m| m.to_string())
        );

        let source = self.resolver.source(&config.source_connection).await?;
        let target = self.resolver.target(&config.target_connection).await?;
        target
            .ensure_index(&config.target_index, &index_mapping(&config))
            .await?;

        let name = config.name.clone();
        let pipeline = Pipeline::for_mapping(
            config,
            source,
            target,
            self.dead_letters.clone(),
            &self.engine,
            None,
        )?;
        let advancer = WatermarkAdvancer {
            store: self.watermarks.clone(),
            mapping: name.clone(),
            changes,
            current: Mutex::new(previous.clone()),
        };
        let summary = pipeline.run(query, cancel, cancel, &advancer).await?;
        if !summary.stopped {
            if let Some(max) = &summary.max_indicator {
                advancer.advance(max).await?;
            }
        }
        if summary.processed > 0 && summary.max_indicator.is_none() {
            warn!("{}: changed rows carried no change indicator values", name);
        }
        let watermark = advancer.current.into_inner();

        if summary.processed > 0 {
            info!(
                "{}: synced {} changed records ({} failed), watermark {}",
                name,
                summary.processed,
                summary.failed,
                watermark.as_ref().map_or_else(|| "-".to_string(), |m| m.to_string())
            );
        } else {
            debug!("{}: no changes", name);
        }

        Ok(SyncOutcome::Synced(SyncReport {
            mapping: name,
            processed: summary.processed,
            failed: summary.failed,
            previous_watermark: previous,
            watermark,
        }))
    }

    /// Run cycles for `mappings` every `interval` until `cancel` fires.
    ///
    /// A failed cycle is logged and retried on the next tick; configuration
    /// errors end the loop.
    pub async fn run_scheduled(
        &self,
        mappings: &[String],
        interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        info!(
            "Starting scheduled sync of {} mapping(s) every {:?}",
            mappings.len(),
            interval
        );
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            for mapping in mappings {
                if cancel.is_cancelled() {
                    break;
                }
                match self.sync_once(mapping, cancel).await {
                    Ok(_) => {}
                    Err(e @ MigrateError::Config(_)) => return Err(e),
                    Err(MigrateError::Cancelled) => break,
                    Err(e) => error!("{}: sync cycle failed: {}", mapping, e),
                }
            }
        }
        info!("Scheduled sync stopped");
        Ok(())
    }
}

/// Mappings CDC can keep in sync: upserts need an identity, and changed
/// rows of a join group are not contiguous in indicator order.
fn check_syncable(config: &MappingConfiguration) -> Result<()> {
    if config.grouping.is_some() {
        return Err(MigrateError::Config(format!(
            "mapping '{}': grouped mappings cannot be synced incrementally; run a full job",
            config.name
        )));
    }
    if config.identity_key.is_none() {
        return Err(MigrateError::Config(format!(
            "mapping '{}': sync requires an identity_key for upserts",
            config.name
        )));
    }
    Ok(())
}

/// Persists the highest indicator known to be fully written.
struct WatermarkAdvancer {
    store: Arc<dyn WatermarkStore>,
    mapping: String,
    changes: ColumnChangeSource,
    current: Mutex<Option<SqlValue>>,
}

impl WatermarkAdvancer {
    /// Move the watermark forward to `candidate`; never backwards.
    async fn advance(&self, candidate: &SqlValue) -> Result<()> {
        self.changes.check(candidate)?;
        let mut current = self.current.lock().await;
        let before = current.clone();
        raise(&mut current, candidate);
        if *current != before {
            if let Some(mark) = current.as_ref() {
                self.store.set(&self.mapping, mark).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ProgressReporter for WatermarkAdvancer {
    async fn report(&self, outcome: &BatchOutcome) -> Result<()> {
        if let Some(max) = &outcome.max_indicator {
            self.changes.check(max)?;
        }
        match &outcome.settled_indicator {
            Some(settled) => self.advance(settled).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::StaticConnections;
    use crate::deadletter::MemoryDeadLetterStore;
    use crate::mapping::{ChangeTracking, FieldMapping, IndicatorKind, MemoryMappingStore};
    use crate::source::{MemorySource, SourceField};
    use crate::state::MemoryWatermarkStore;
    use crate::target::MemoryTarget;
    use crate::typemap::FieldType;

    fn mapping() -> MappingConfiguration {
        let mut cfg = MappingConfiguration::new("customers", "db", "SELECT * FROM customers", "es", "customers");
        cfg.identity_key = Some("ID".into());
        cfg.set_field_mapping(FieldMapping::new("ID", "id", FieldType::Long));
        cfg.set_field_mapping(FieldMapping::new("NAME", "name", FieldType::Keyword));
        cfg.change_tracking = Some(ChangeTracking {
            column: "VERSION".into(),
            kind: IndicatorKind::LogPosition,
        });
        cfg
    }

    struct Fixture {
        source: Arc<MemorySource>,
        target: Arc<MemoryTarget>,
        watermarks: Arc<MemoryWatermarkStore>,
        locks: Arc<MappingLocks>,
        sync: CdcSynchronizer,
    }

    fn fixture(config: MappingConfiguration) -> Fixture {
        let source = Arc::new(MemorySource::new(
            vec![
                SourceField::new("ID", "INTEGER"),
                SourceField::new("NAME", "VARCHAR(50)"),
                SourceField::new("VERSION", "BIGINT"),
            ],
            vec![],
        ));
        let target = Arc::new(MemoryTarget::new());
        let watermarks = Arc::new(MemoryWatermarkStore::new());
        let locks = Arc::new(MappingLocks::new());
        let connections = StaticConnections::new()
            .with_source("db", source.clone())
            .with_target("es", target.clone());
        let sync = CdcSynchronizer::new(
            Arc::new(connections),
            Arc::new(MemoryMappingStore::new([config])),
            watermarks.clone(),
            Arc::new(MemoryDeadLetterStore::new()),
            locks.clone(),
            EngineConfig::default(),
        );
        Fixture {
            source,
            target,
            watermarks,
            locks,
            sync,
        }
    }

    fn put(f: &Fixture, id: i64, name: &str, version: i64) {
        f.source.upsert_row(
            "ID",
            f.source.row([
                ("ID", SqlValue::I64(id)),
                ("NAME", SqlValue::from(name)),
                ("VERSION", SqlValue::I64(version)),
            ]),
        );
    }

    fn synced(outcome: SyncOutcome) -> SyncReport {
        match outcome {
            SyncOutcome::Synced(report) => report,
            SyncOutcome::Skipped => panic!("cycle was skipped"),
        }
    }

    #[tokio::test]
    async fn test_only_changes_after_watermark_are_synced() {
        let f = fixture(mapping());
        put(&f, 1, "ada", 1);
        put(&f, 2, "bob", 2);
        let first = synced(f.sync.sync_once("customers", &CancellationToken::new()).await.unwrap());
        assert_eq!(first.processed, 2);
        assert_eq!(first.watermark, Some(SqlValue::I64(2)));

        put(&f, 2, "bobby", 3);
        let second = synced(f.sync.sync_once("customers", &CancellationToken::new()).await.unwrap());
        assert_eq!(second.processed, 1);
        assert_eq!(second.previous_watermark, Some(SqlValue::I64(2)));
        assert_eq!(f.watermarks.get("customers").await.unwrap(), Some(SqlValue::I64(3)));

        assert_eq!(f.target.doc_count("customers"), 2);
        assert_eq!(
            f.target.get("customers", "2").unwrap().get("name"),
            Some(&serde_json::json!("bobby"))
        );
    }

    #[tokio::test]
    async fn test_replay_after_lost_watermark_does_not_duplicate() {
        let f = fixture(mapping());
        put(&f, 1, "ada", 1);
        put(&f, 2, "bob", 2);
        synced(f.sync.sync_once("customers", &CancellationToken::new()).await.unwrap());

        // Simulate a crash between load and watermark advance.
        f.watermarks.set("customers", &SqlValue::I64(0)).await.unwrap();
        let replay = synced(f.sync.sync_once("customers", &CancellationToken::new()).await.unwrap());
        assert_eq!(replay.processed, 2);
        assert_eq!(f.target.doc_count("customers"), 2);
    }

    fn with_chunk_size(f: Fixture, chunk_size: usize) -> Fixture {
        let engine = EngineConfig {
            chunk_size: Some(chunk_size),
            ..Default::default()
        };
        Fixture {
            sync: CdcSynchronizer { engine, ..f.sync },
            ..f
        }
    }

    /// Cancel `token` as soon as the target receives document `id`.
    fn cancel_on_write(f: &Fixture, id: &'static str, token: &CancellationToken) {
        let token = token.clone();
        f.target.reject_when(move |doc| {
            if doc.id.as_deref() == Some(id) {
                token.cancel();
            }
            None
        });
    }

    #[tokio::test]
    async fn test_stop_between_tied_rows_replays_them() {
        let f = with_chunk_size(fixture(mapping()), 1);
        put(&f, 1, "ada", 7);
        put(&f, 2, "bob", 7);

        let cancel = CancellationToken::new();
        cancel_on_write(&f, "1", &cancel);
        let first = synced(f.sync.sync_once("customers", &cancel).await.unwrap());
        assert_eq!(first.processed, 1);
        assert_eq!(first.watermark, None);
        assert_eq!(f.watermarks.get("customers").await.unwrap(), None);

        f.target.clear_rejections();
        let second = synced(f.sync.sync_once("customers", &CancellationToken::new()).await.unwrap());
        assert_eq!(second.processed, 2);
        assert_eq!(second.watermark, Some(SqlValue::I64(7)));
        assert_eq!(f.target.doc_count("customers"), 2);
    }

    #[tokio::test]
    async fn test_stop_advances_to_last_settled_indicator() {
        let f = with_chunk_size(fixture(mapping()), 2);
        put(&f, 1, "ada", 5);
        put(&f, 2, "bob", 7);
        put(&f, 3, "cy", 7);

        let cancel = CancellationToken::new();
        cancel_on_write(&f, "1", &cancel);
        let first = synced(f.sync.sync_once("customers", &cancel).await.unwrap());
        assert_eq!(first.processed, 2);
        assert_eq!(first.watermark, Some(SqlValue::I64(5)));
        assert_eq!(f.watermarks.get("customers").await.unwrap(), Some(SqlValue::I64(5)));

        f.target.clear_rejections();
        let second = synced(f.sync.sync_once("customers", &CancellationToken::new()).await.unwrap());
        assert_eq!(second.processed, 2);
        assert_eq!(second.watermark, Some(SqlValue::I64(7)));
        assert_eq!(f.target.doc_count("customers"), 3);
    }

    #[tokio::test]
    async fn test_busy_mapping_skips_cycle() {
        let f = fixture(mapping());
        put(&f, 1, "ada", 1);
        let _held = f.locks.lock("customers").await;
        let outcome = f.sync.sync_once("customers", &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Skipped);
        assert_eq!(f.source.cursors_opened(), 0);
    }

    #[tokio::test]
    async fn test_failed_load_keeps_watermark() {
        let f = fixture(mapping());
        put(&f, 1, "ada", 1);
        f.target.set_unreachable(true);
        let mut engine = EngineConfig::default();
        engine.retry.max_attempts = 1;
        let sync = CdcSynchronizer { engine, ..f.sync };
        let err = sync.sync_once("customers", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, MigrateError::Connectivity { .. } | MigrateError::LoadBatch { .. }));
        assert_eq!(f.watermarks.get("customers").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_requires_identity_key() {
        let mut cfg = mapping();
        cfg.identity_key = None;
        let f = fixture(cfg);
        let err = f.sync.sync_once("customers", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, MigrateError::Config(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_loop_stops_on_cancel() {
        let f = fixture(mapping());
        put(&f, 1, "ada", 1);
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(150)).await;
            stopper.cancel();
        });
        f.sync
            .run_scheduled(&["customers".to_string()], Duration::from_secs(60), &cancel)
            .await
            .unwrap();
        assert_eq!(f.source.cursors_opened(), 3);
        assert_eq!(f.target.doc_count("customers"), 1);
    }
}
