//! End-to-end tests of the job controller against in-memory connections.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sql_es_migrate::config::RetryConfig;
use sql_es_migrate::mapping::{ChangeTracking, IndicatorKind, MigrationStrategy};
use sql_es_migrate::state::{MemoryWatermarkStore, WatermarkStore};
use sql_es_migrate::{
    EngineConfig, FailureStage, FieldMapping, FieldType, JobController, JobId, JobStatus,
    MappingConfiguration, MemoryMappingStore, MemorySource, MemoryTarget, MigrateError, SourceField,
    SqlValue, StaticConnections, TransformationRule,
};

struct Fixture {
    source: Arc<MemorySource>,
    target: Arc<MemoryTarget>,
    controller: JobController,
}

fn engine(chunk_size: usize) -> EngineConfig {
    EngineConfig {
        chunk_size: Some(chunk_size),
        queue_depth: Some(2),
        bulk_batch_size: Some(100),
        retry: RetryConfig {
            max_attempts: 2,
            base_delay_ms: 1,
            max_delay_ms: 2,
            jitter: 0.0,
        },
        ..Default::default()
    }
}

fn orders_mapping() -> MappingConfiguration {
    let mut cfg = MappingConfiguration::new("orders", "db", "SELECT * FROM orders", "es", "orders");
    cfg.identity_key = Some("id".into());
    cfg.set_field_mapping(FieldMapping::new("id", "id", FieldType::Long));
    cfg.set_field_mapping(FieldMapping::new("name", "customer.name", FieldType::Keyword));
    cfg.set_field_mapping(FieldMapping::new("amount", "amount", FieldType::Double));
    cfg
}

fn fixture_with(mappings: Vec<MappingConfiguration>, engine: EngineConfig) -> Fixture {
    let source = Arc::new(MemorySource::new(
        vec![
            SourceField::new("id", "INTEGER"),
            SourceField::new("name", "VARCHAR(50)"),
            SourceField::new("amount", "VARCHAR(20)"),
            SourceField::new("version", "BIGINT"),
        ],
        vec![],
    ));
    let target = Arc::new(MemoryTarget::new());
    let connections = StaticConnections::new()
        .with_source("db", source.clone())
        .with_target("es", target.clone());
    let controller = JobController::new(
        Arc::new(connections),
        Arc::new(MemoryMappingStore::new(mappings)),
        engine,
    );
    Fixture {
        source,
        target,
        controller,
    }
}

fn fixture() -> Fixture {
    fixture_with(vec![orders_mapping()], engine(10))
}

fn put(f: &Fixture, id: i64, name: &str, amount: &str, version: i64) {
    f.source.upsert_row(
        "id",
        f.source.row([
            ("id", SqlValue::I64(id)),
            ("name", SqlValue::from(name)),
            ("amount", SqlValue::from(amount)),
            ("version", SqlValue::I64(version)),
        ]),
    );
}

async fn wait_until_running(controller: &JobController, id: JobId) {
    for _ in 0..500 {
        if controller.get_job(id).await.unwrap().status == JobStatus::Running {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("job {} never started", id);
}

#[tokio::test]
async fn test_submit_completes_and_dead_letters_bad_record() {
    let f = fixture();
    put(&f, 1, "Alice", "10.50", 1);
    put(&f, 2, "Bob", "abc", 2);

    let id = f.controller.submit_job("orders").await.unwrap();
    let job = f.controller.wait_for(id).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.total_records, 2);
    assert_eq!(job.processed_records, 2);
    assert_eq!(job.failed_records, 1);
    assert!(job.end_time.is_some());
    assert!(job.error_message.is_none());

    let doc = f.target.get("orders", "1").unwrap();
    assert_eq!(doc.get("customer"), Some(&json!({"name": "Alice"})));
    assert_eq!(doc.get("amount"), Some(&json!(10.5)));
    assert!(f.target.get("orders", "2").is_none());

    let dead = f.controller.list_dead_letters(Some("orders")).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].stage, FailureStage::Transform);
    assert_eq!(dead[0].job_id, Some(id));
    assert!(dead[0].error_message.contains("amount"));
}

#[tokio::test]
async fn test_submit_unknown_mapping_creates_no_job() {
    let f = fixture();
    let err = f.controller.submit_job("customers").await.unwrap_err();
    assert!(matches!(err, MigrateError::Config(_)));
    assert!(f.controller.list_jobs().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_submit_invalid_rule_creates_no_job() {
    let mut mapping = orders_mapping();
    mapping
        .transformation_rules
        .push(TransformationRule::new("amount", "no_such_function($)"));
    let f = fixture_with(vec![mapping], engine(10));

    let err = f.controller.submit_job("orders").await.unwrap_err();
    assert!(matches!(err, MigrateError::Config(_)));
    assert!(f.controller.list_jobs().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_job_ids_are_monotonic() {
    let f = fixture();
    put(&f, 1, "Alice", "1", 1);
    let a = f.controller.submit_job("orders").await.unwrap();
    f.controller.wait_for(a).await.unwrap();
    let b = f.controller.submit_job("orders").await.unwrap();
    f.controller.wait_for(b).await.unwrap();
    assert!(b > a);
    assert_eq!(f.controller.list_jobs().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_get_unknown_job_is_not_found() {
    let f = fixture();
    let err = f.controller.get_job(JobId(99)).await.unwrap_err();
    assert!(matches!(err, MigrateError::JobNotFound(JobId(99))));
}

#[tokio::test]
async fn test_failed_job_retries_under_same_id() {
    let f = fixture();
    put(&f, 1, "Alice", "1", 1);
    put(&f, 2, "Bob", "2", 2);
    f.source.fail_open(Some("connection refused"));

    let id = f.controller.submit_job("orders").await.unwrap();
    let failed = f.controller.wait_for(id).await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.error_message.as_deref().unwrap().contains("connection refused"));
    assert!(failed.end_time.is_some());

    f.source.fail_open(None);
    let retried = f.controller.retry_job(id).await.unwrap();
    assert_eq!(retried.id, id);
    assert_eq!(retried.status, JobStatus::Running);
    assert_eq!(retried.processed_records, 0);
    assert!(retried.error_message.is_none());
    assert!(retried.end_time.is_none());
    assert!(retried.attempt > failed.attempt);

    let done = f.controller.wait_for(id).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.processed_records, 2);
    assert_eq!(f.target.doc_count("orders"), 2);
    assert_eq!(f.controller.list_jobs().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_retry_completed_job_is_invalid_transition() {
    let f = fixture();
    put(&f, 1, "Alice", "1", 1);
    let id = f.controller.submit_job("orders").await.unwrap();
    f.controller.wait_for(id).await.unwrap();

    let err = f.controller.retry_job(id).await.unwrap_err();
    assert!(matches!(err, MigrateError::InvalidTransition { .. }));
    assert_eq!(f.controller.get_job(id).await.unwrap().status, JobStatus::Completed);
}

#[tokio::test]
async fn test_stop_running_job_ends_stopped() {
    // One row per batch, and a slow retry on the first bulk write keeps the
    // job running long enough to be stopped.
    let mut engine = engine(1);
    engine.retry = RetryConfig {
        max_attempts: 3,
        base_delay_ms: 300,
        max_delay_ms: 300,
        jitter: 0.0,
    };
    let f = fixture_with(vec![orders_mapping()], engine);
    for i in 0..50 {
        put(&f, i, "name", "1", i);
    }
    f.target.fail_next_bulk(1);

    let id = f.controller.submit_job("orders").await.unwrap();
    wait_until_running(&f.controller, id).await;

    let snapshot = f.controller.stop_job(id).await.unwrap();
    assert_eq!(snapshot.status, JobStatus::Running);

    let job = f.controller.wait_for(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Stopped);
    assert!(job.processed_records < 50);
    assert!(job.end_time.is_some());
    assert!(job.error_message.is_none());

    // Stop on a terminal job changes nothing.
    let again = f.controller.stop_job(id).await.unwrap();
    assert_eq!(again.status, JobStatus::Stopped);
    // Only failed jobs can be retried.
    assert!(f.controller.retry_job(id).await.is_err());
}

#[tokio::test]
async fn test_stop_completed_job_is_noop() {
    let f = fixture();
    put(&f, 1, "Alice", "1", 1);
    let id = f.controller.submit_job("orders").await.unwrap();
    let done = f.controller.wait_for(id).await.unwrap();

    let after = f.controller.stop_job(id).await.unwrap();
    assert_eq!(after, done);
}

#[tokio::test]
async fn test_bulk_failure_after_retries_fails_job() {
    let f = fixture();
    put(&f, 1, "Alice", "1", 1);
    f.target.fail_next_bulk(5);

    let id = f.controller.submit_job("orders").await.unwrap();
    let job = f.controller.wait_for(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.unwrap().contains("2 attempt(s)"));
    assert_eq!(f.target.bulk_calls(), 2);
}

#[tokio::test]
async fn test_failed_job_counts_match_dead_letters() {
    let f = fixture();
    put(&f, 1, "Alice", "10.50", 1);
    put(&f, 2, "Bob", "abc", 2);
    f.target.fail_next_bulk(10);

    let id = f.controller.submit_job("orders").await.unwrap();
    let job = f.controller.wait_for(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);

    let dead = f.controller.list_dead_letters(Some("orders")).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(job.failed_records, dead.len() as u64);
    assert_eq!(job.processed_records, 1);
}

#[tokio::test]
async fn test_failed_job_keeps_counts_of_written_chunks() {
    let f = fixture_with(vec![orders_mapping()], engine(1));
    put(&f, 1, "Alice", "10.50", 1);
    put(&f, 2, "Bob", "abc", 2);
    put(&f, 3, "Cleo", "3", 3);
    f.target.refuse_bulk_after(1);

    let id = f.controller.submit_job("orders").await.unwrap();
    let job = f.controller.wait_for(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.processed_records, 2);
    assert_eq!(f.target.doc_count("orders"), 1);

    let dead = f.controller.list_dead_letters(Some("orders")).await.unwrap();
    assert_eq!(job.failed_records, dead.len() as u64);
}

#[tokio::test]
async fn test_preview_does_not_load_or_dead_letter() {
    let f = fixture();
    put(&f, 1, "Alice", "10.50", 1);
    put(&f, 2, "Bob", "abc", 2);
    put(&f, 3, "Cleo", "3", 3);

    let preview = f.controller.preview("orders", 2).await.unwrap();
    assert_eq!(preview.original_rows.len(), 2);
    assert_eq!(preview.transformed_documents.len(), 1);
    assert_eq!(preview.transformed_documents[0]["customer"]["name"], "Alice");
    assert_eq!(preview.errors.len(), 1);
    assert_eq!(preview.errors[0].record, 1);
    assert_eq!(preview.errors[0].field, "amount");

    assert!(f.controller.list_dead_letters(None).await.unwrap().is_empty());
    assert_eq!(f.target.doc_count("orders"), 0);
    assert!(f.controller.list_jobs().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_suggest_mapping_for_new_index() {
    let f = fixture();
    let suggestion = f
        .controller
        .suggest_mapping("db", "es", "SELECT * FROM orders", "orders")
        .await
        .unwrap();

    assert_eq!(suggestion.field_mappings.len(), 4);
    let sources: Vec<&str> = suggestion
        .field_mappings
        .iter()
        .map(|m| m.source_field.as_str())
        .collect();
    assert_eq!(sources, ["id", "name", "amount", "version"]);
    assert!(suggestion.index_mapping["mappings"]["properties"]["id"].is_object());

    let report = f
        .controller
        .validate_mapping(&suggestion.field_mappings, &suggestion.transformation_rules);
    assert!(report.valid, "{:?}", report.errors);
}

#[tokio::test]
async fn test_validate_mapping_reports_duplicate_targets() {
    let f = fixture();
    let mappings = vec![
        FieldMapping::new("id", "id", FieldType::Long),
        FieldMapping::new("other_id", "id", FieldType::Long),
    ];
    let report = f.controller.validate_mapping(&mappings, &[]);
    assert!(!report.valid);
    assert!(!report.errors.is_empty());
}

#[tokio::test]
async fn test_reprocess_removes_fixed_records() {
    let f = fixture();
    put(&f, 1, "Alice", "10", 1);
    put(&f, 2, "Bob", "500", 2);
    f.target.reject_when(|doc| {
        let amount = doc.body.get("amount").and_then(|v| v.as_f64())?;
        (amount > 100.0).then(|| "mapper_parsing_exception: amount limit".to_string())
    });

    let id = f.controller.submit_job("orders").await.unwrap();
    let job = f.controller.wait_for(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.failed_records, 1);

    let dead = f.controller.list_dead_letters(Some("orders")).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].stage, FailureStage::Load);
    assert!(dead[0].document.is_some());

    // Still rejected: retry count goes up, record stays.
    let report = f.controller.reprocess_dead_letters("orders").await.unwrap();
    assert_eq!((report.attempted, report.succeeded, report.failed), (1, 0, 1));
    let dead = f.controller.list_dead_letters(Some("orders")).await.unwrap();
    assert_eq!(dead[0].retry_count, 1);

    f.target.clear_rejections();
    let report = f.controller.reprocess_dead_letters("orders").await.unwrap();
    assert_eq!((report.attempted, report.succeeded, report.failed), (1, 1, 0));
    assert!(f.controller.list_dead_letters(Some("orders")).await.unwrap().is_empty());
    assert_eq!(f.target.doc_count("orders"), 2);
}

#[tokio::test]
async fn test_incremental_job_advances_watermark() {
    let mut mapping = orders_mapping();
    mapping.strategy = MigrationStrategy::Incremental;
    mapping.change_tracking = Some(ChangeTracking {
        column: "version".into(),
        kind: IndicatorKind::LogPosition,
    });
    let watermarks = Arc::new(MemoryWatermarkStore::new());
    let mut f = fixture_with(vec![mapping], engine(10));
    f.controller = f.controller.with_watermark_store(watermarks.clone());

    put(&f, 1, "Alice", "1", 1);
    put(&f, 2, "Bob", "2", 2);
    let first = f.controller.submit_job("orders").await.unwrap();
    let job = f.controller.wait_for(first).await.unwrap();
    assert_eq!(job.processed_records, 2);
    assert_eq!(watermarks.get("orders").await.unwrap(), Some(SqlValue::I64(2)));

    put(&f, 2, "Bobby", "2", 3);
    let second = f.controller.submit_job("orders").await.unwrap();
    let job = f.controller.wait_for(second).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.processed_records, 1);
    assert_eq!(watermarks.get("orders").await.unwrap(), Some(SqlValue::I64(3)));
    assert_eq!(f.target.doc_count("orders"), 2);
}

#[tokio::test]
async fn test_incremental_without_change_tracking_is_rejected() {
    let mut mapping = orders_mapping();
    mapping.strategy = MigrationStrategy::Incremental;
    let f = fixture_with(vec![mapping], engine(10));

    let err = f.controller.submit_job("orders").await.unwrap_err();
    assert!(matches!(err, MigrateError::Config(_)));
}

#[tokio::test]
async fn test_cdc_sync_shares_controller_watermarks() {
    let mut mapping = orders_mapping();
    mapping.change_tracking = Some(ChangeTracking {
        column: "version".into(),
        kind: IndicatorKind::LogPosition,
    });
    let f = fixture_with(vec![mapping], engine(10));
    let sync = f.controller.synchronizer();
    let cancel = tokio_util::sync::CancellationToken::new();

    put(&f, 1, "Alice", "1", 1);
    put(&f, 2, "Bob", "2", 2);
    sync.sync_once("orders", &cancel).await.unwrap();
    put(&f, 1, "Alicia", "1", 3);
    sync.sync_once("orders", &cancel).await.unwrap();
    // Nothing changed since the last cycle.
    sync.sync_once("orders", &cancel).await.unwrap();

    assert_eq!(f.target.doc_count("orders"), 2);
    assert_eq!(
        f.target.get("orders", "1").unwrap().get("customer"),
        Some(&json!({"name": "Alicia"}))
    );
}

#[tokio::test]
async fn test_validate_counts() {
    let f = fixture();
    put(&f, 1, "Alice", "1", 1);
    put(&f, 2, "Bob", "abc", 2);
    let id = f.controller.submit_job("orders").await.unwrap();
    f.controller.wait_for(id).await.unwrap();

    let counts = f.controller.validate_counts("orders").await.unwrap();
    assert_eq!(counts.source_count, Some(2));
    assert_eq!(counts.target_count, Some(1));
    assert!(!counts.matches);

    f.source.upsert_row(
        "id",
        f.source.row([
            ("id", SqlValue::I64(2)),
            ("name", SqlValue::from("Bob")),
            ("amount", SqlValue::from("2")),
            ("version", SqlValue::I64(3)),
        ]),
    );
    let id = f.controller.submit_job("orders").await.unwrap();
    f.controller.wait_for(id).await.unwrap();
    assert!(f.controller.validate_counts("orders").await.unwrap().matches);
}

#[tokio::test]
async fn test_health_check_reports_unreachable_target() {
    let f = fixture();
    let report = f.controller.health_check().await.unwrap();
    assert!(report.healthy);
    assert_eq!(report.sources.len(), 1);
    assert_eq!(report.targets[0].system.as_deref(), Some("memory"));

    f.target.set_unreachable(true);
    let report = f.controller.health_check().await.unwrap();
    assert!(!report.healthy);
    assert!(report.sources[0].ok);
    assert!(!report.targets[0].ok);
    assert!(report.targets[0].error.is_some());
}
