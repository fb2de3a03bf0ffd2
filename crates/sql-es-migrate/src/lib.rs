//! # sql-es-migrate
//!
//! Relational-to-search-index migration engine.
//!
//! Rows from a relational source are mapped, transformed into documents
//! and bulk-loaded into a search index, with:
//!
//! - **Auto-mapping** of source columns to index fields with confidence scores
//! - **Join denormalization** of one-to-many rows into nested lists
//! - **Bounded streaming** with backpressure between extraction and load
//! - **Retry with backoff and jitter** for bulk writes and connectivity
//! - **Dead-letter store** for records that fail transform or load
//! - **Controllable jobs** with cooperative stop and retry
//! - **CDC sync** from a per-mapping watermark with upsert semantics
//!
//! ## Example
//!
//! ```rust,no_run
//! use sql_es_migrate::{Config, JobController};
//!
//! #[tokio::main]
//! async fn main() -> sql_es_migrate::Result<()> {
//!     let config = Config::load("config.yaml")?.with_auto_tuning();
//!     let controller = JobController::from_config(&config)?;
//!     let id = controller.submit_job("orders").await?;
//!     let job = controller.wait_for(id).await?;
//!     println!("{}: {} processed, {} failed", job.status, job.processed_records, job.failed_records);
//!     Ok(())
//! }
//! ```

pub mod cdc;
pub mod config;
pub mod connections;
pub mod core;
pub mod deadletter;
pub mod error;
pub mod mapping;
pub mod orchestrator;
pub mod pipeline;
pub mod retry;
pub mod source;
pub mod state;
pub mod suggest;
pub mod target;
pub mod transform;
pub mod typemap;

// Re-exports for convenient access
pub use cdc::{CdcSynchronizer, SyncOutcome, SyncReport};
pub use config::{Config, EngineConfig};
pub use connections::{ConfiguredConnections, ConnectionResolver, StaticConnections};
pub use crate::core::{Document, Row, SqlValue};
pub use deadletter::{DeadLetterRecord, DeadLetterStore, FailureStage};
pub use error::{MigrateError, Result, TransformError};
pub use mapping::{
    FieldMapping, MappingConfiguration, MappingStore, MemoryMappingStore, TransformationRule,
    ValidationReport,
};
pub use orchestrator::JobController;
pub use retry::RetryPolicy;
pub use source::{MemorySource, PostgresSource, SourceField, SourceSystem};
pub use state::{JobId, JobStatus, MigrationJob};
pub use suggest::{MappingSuggestion, Suggester};
pub use target::{ElasticsearchTarget, MemoryTarget, TargetField, TargetSystem};
pub use transform::TransformEngine;
pub use typemap::{FieldType, TypeMapper};
