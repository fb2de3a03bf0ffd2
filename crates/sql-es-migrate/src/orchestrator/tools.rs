//! Control operations that do not create jobs: preview, suggestion,
//! validation, dead-letter reprocessing, count validation and health.

use std::collections::BTreeSet;

use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::JobController;
use crate::deadletter::DeadLetterRecord;
use crate::error::{MigrateError, Result};
use crate::mapping::{validate_mapping, FieldMapping, TransformationRule, ValidationReport};
use crate::retry::RetryPolicy;
use crate::source::SourceQuery;
use crate::suggest::{MappingSuggestion, Suggester};
use crate::transform::{SourceRecord, TransformEngine};

/// Sample rows and what the mapping makes of them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreviewResult {
    pub mapping: String,
    pub original_rows: Vec<Value>,
    pub transformed_documents: Vec<Value>,
    /// Records that would be dead-lettered, by position in the sample.
    pub errors: Vec<PreviewError>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreviewError {
    pub record: usize,
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReprocessReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountValidation {
    pub mapping: String,
    pub source_count: Option<u64>,
    pub target_count: Option<u64>,
    pub matches: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionHealth {
    pub name: String,
    pub system: Option<String>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub sources: Vec<ConnectionHealth>,
    pub targets: Vec<ConnectionHealth>,
}

fn health(name: &str, result: Result<String>) -> ConnectionHealth {
    match result {
        Ok(system) => ConnectionHealth {
            name: name.to_string(),
            system: Some(system),
            ok: true,
            error: None,
        },
        Err(e) => ConnectionHealth {
            name: name.to_string(),
            system: None,
            ok: false,
            error: Some(e.to_string()),
        },
    }
}

impl JobController {
    /// Transform up to `limit` records without loading them. No job is
    /// created and the dead-letter store is not touched.
    pub async fn preview(&self, mapping: &str, limit: usize) -> Result<PreviewResult> {
        let mapping = self.load_mapping(mapping).await?;
        mapping.validate()?;
        let source = self.resolver.source(&mapping.source_connection).await?;
        let query = SourceQuery::new(mapping.query()?);
        let name = mapping.name.clone();
        let engine = TransformEngine::new(mapping, &self.engine.transform)?;

        let limit = limit.max(1);
        let mut grouper = engine.grouper();
        let mut records: Vec<SourceRecord> = Vec::new();
        let mut cursor = source.open_cursor(&query, limit).await?;
        while records.len() < limit {
            match cursor.next_chunk().await? {
                Some(rows) => records.extend(grouper.push_batch(rows)),
                None => {
                    records.extend(grouper.finish());
                    break;
                }
            }
        }
        records.truncate(limit);

        let mut result = PreviewResult {
            mapping: name,
            original_rows: Vec::new(),
            transformed_documents: Vec::new(),
            errors: Vec::new(),
        };
        for (i, record) in records.iter().enumerate() {
            result
                .original_rows
                .extend(record.rows.iter().map(|r| r.to_json()));
            match engine.transform(record) {
                Ok(doc) => result.transformed_documents.push(doc.to_value()),
                Err(e) => result.errors.push(PreviewError {
                    record: i,
                    field: e.field,
                    message: e.message,
                }),
            }
        }
        Ok(result)
    }

    /// Propose field mappings and rules for a query/index pair.
    pub async fn suggest_mapping(
        &self,
        source_connection: &str,
        target_connection: &str,
        query: &str,
        index: &str,
    ) -> Result<MappingSuggestion> {
        let source = self.resolver.source(source_connection).await?;
        let target = self.resolver.target(target_connection).await?;
        let source_fields = source.describe(query).await?;
        let target_fields = target.discover_fields(index).await?;
        info!(
            "Suggesting mappings for {} source fields against {} existing fields of {}",
            source_fields.len(),
            target_fields.len(),
            index
        );
        Ok(Suggester::new(self.type_mapper.clone()).suggest(&source_fields, &target_fields))
    }

    /// Check a field mapping set and its rules. Never fails; problems are in
    /// the report.
    pub fn validate_mapping(
        &self,
        field_mappings: &[FieldMapping],
        rules: &[TransformationRule],
    ) -> ValidationReport {
        validate_mapping(field_mappings, rules)
    }

    pub async fn list_dead_letters(&self, mapping: Option<&str>) -> Result<Vec<DeadLetterRecord>> {
        self.dead_letters.list(mapping).await
    }

    /// Re-transform and re-load a mapping's dead letters, oldest first.
    /// Successes are removed from the store; failures get their retry count
    /// and message updated. Stops early when the target is unreachable.
    pub async fn reprocess_dead_letters(&self, mapping: &str) -> Result<ReprocessReport> {
        let mapping = self.load_mapping(mapping).await?;
        mapping.validate()?;
        let _guard = self.locks.lock(&mapping.name).await;

        let target = self.resolver.target(&mapping.target_connection).await?;
        let index = mapping.target_index.clone();
        let name = mapping.name.clone();
        let engine = TransformEngine::new(mapping, &self.engine.transform)?;
        let retry = RetryPolicy::from(&self.engine.retry);
        let cancel: &CancellationToken = &self.shutdown;

        let mut report = ReprocessReport::default();
        for mut record in self.dead_letters.list(Some(&name)).await? {
            report.attempted += 1;
            let outcome = match engine.transform(&SourceRecord {
                rows: record.rows.clone(),
            }) {
                Err(e) => Err(MigrateError::from(e)),
                Ok(doc) => {
                    retry
                        .run("reprocessing dead letter", cancel, |_| target.upsert(&index, &doc))
                        .await
                }
            };
            match outcome {
                Ok(()) => {
                    self.dead_letters.remove(&record.id).await?;
                    report.succeeded += 1;
                }
                Err(e) => {
                    report.failed += 1;
                    warn!("Dead letter {} still failing: {}", record.id, e);
                    record.record_retry(e.to_string());
                    self.dead_letters.update(&record).await?;
                    if matches!(e, MigrateError::Connectivity { .. } | MigrateError::Cancelled) {
                        return Err(e);
                    }
                }
            }
        }
        info!(
            "{}: reprocessed {} dead letters ({} succeeded, {} still failing)",
            name, report.attempted, report.succeeded, report.failed
        );
        Ok(report)
    }

    /// Compare the source record count with the target document count.
    pub async fn validate_counts(&self, mapping: &str) -> Result<CountValidation> {
        let mapping = self.load_mapping(mapping).await?;
        let source = self.resolver.source(&mapping.source_connection).await?;
        let target = self.resolver.target(&mapping.target_connection).await?;
        let query = SourceQuery::new(mapping.query()?)
            .counting_distinct(mapping.grouping.as_ref().map(|g| g.parent_key.as_str()));

        let source_count = source.count(&query).await?;
        let target_count = target.count(&mapping.target_index).await?;
        let matches = source_count.is_some() && source_count == target_count;
        if matches {
            info!("{}: {} records (match)", mapping.name, source_count.unwrap_or(0));
        } else {
            warn!(
                "{}: source={:?} target={:?} (MISMATCH)",
                mapping.name, source_count, target_count
            );
        }
        Ok(CountValidation {
            mapping: mapping.name,
            source_count,
            target_count,
            matches,
        })
    }

    /// Ping every connection some mapping refers to.
    pub async fn health_check(&self) -> Result<HealthReport> {
        let mappings = self.mappings.list().await?;
        let sources: BTreeSet<&str> = mappings.iter().map(|m| m.source_connection.as_str()).collect();
        let targets: BTreeSet<&str> = mappings.iter().map(|m| m.target_connection.as_str()).collect();

        let mut report = HealthReport {
            healthy: true,
            sources: Vec::new(),
            targets: Vec::new(),
        };
        for name in sources {
            let result = match self.resolver.source(name).await {
                Ok(source) => source.ping().await.map(|_| source.system_type().to_string()),
                Err(e) => Err(e),
            };
            report.sources.push(health(name, result));
        }
        for name in targets {
            let result = match self.resolver.target(name).await {
                Ok(target) => target.ping().await.map(|_| target.system_type().to_string()),
                Err(e) => Err(e),
            };
            report.targets.push(health(name, result));
        }
        report.healthy = report.sources.iter().chain(&report.targets).all(|c| c.ok);
        Ok(report)
    }
}
