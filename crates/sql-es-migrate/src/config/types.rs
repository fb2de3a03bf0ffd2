//! Configuration type definitions with auto-tuning based on system resources.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::info;

use crate::mapping::MappingConfiguration;
use crate::transform::TransformConfig;
use crate::typemap::TypeMapperConfig;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in bytes.
    pub total_memory_bytes: u64,
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        let total_memory_bytes = sys.total_memory();
        let total_memory_gb = total_memory_bytes as f64 / (1024.0 * 1024.0 * 1024.0);
        let cpu_cores = sys.cpus().len();

        Self {
            total_memory_bytes,
            total_memory_gb,
            cpu_cores,
        }
    }

    /// Log detected system resources.
    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Named source and target connections referenced by mappings.
    #[serde(default)]
    pub connections: ConnectionsConfig,

    /// Pipeline tuning.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Job and watermark persistence.
    #[serde(default)]
    pub state: StateConfig,

    /// Dead-letter persistence.
    #[serde(default)]
    pub dead_letter: DeadLetterConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Mapping configurations seeding the configuration store.
    #[serde(default)]
    pub mappings: Vec<MappingConfiguration>,
}

impl Config {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set in the config file.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.engine = self.engine.with_auto_tuning(&resources);
        self
    }

    /// Look up a mapping by name.
    pub fn mapping(&self, name: &str) -> Option<&MappingConfiguration> {
        self.mappings.iter().find(|m| m.name == name)
    }
}

/// Source and target connections by reference name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionsConfig {
    #[serde(default)]
    pub sources: BTreeMap<String, SourceConnection>,

    #[serde(default)]
    pub targets: BTreeMap<String, TargetConnection>,
}

/// A relational source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConnection {
    Postgres(PostgresConfig),
    /// Inline rows; for demos and tests.
    Memory(MemorySourceConfig),
}

impl SourceConnection {
    pub fn system_type(&self) -> &'static str {
        match self {
            SourceConnection::Postgres(_) => "postgres",
            SourceConnection::Memory(_) => "memory",
        }
    }
}

/// A search-index target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TargetConnection {
    Elasticsearch(ElasticsearchConfig),
    /// In-process index; for demos and tests.
    Memory,
}

impl TargetConnection {
    pub fn system_type(&self) -> &'static str {
        match self {
            TargetConnection::Elasticsearch(_) => "elasticsearch",
            TargetConnection::Memory => "memory",
        }
    }
}

/// PostgreSQL source configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// SSL mode: disable, require, verify-ca, verify-full (default: "require").
    #[serde(default = "default_require")]
    pub ssl_mode: String,

    /// Maximum pooled connections (default: 4).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,
}

impl PostgresConfig {
    pub fn get_max_connections(&self) -> usize {
        self.max_connections.unwrap_or(4)
    }
}

impl fmt::Debug for PostgresConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("ssl_mode", &self.ssl_mode)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// Inline source rows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemorySourceConfig {
    /// Column names and declared types, in row order.
    #[serde(default)]
    pub columns: Vec<ColumnDecl>,

    /// Row values, positionally matching `columns`.
    #[serde(default)]
    pub rows: Vec<Vec<serde_json::Value>>,
}

/// A declared column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDecl {
    pub name: String,
    #[serde(rename = "type", default = "default_column_type")]
    pub declared_type: String,
}

/// Elasticsearch target configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct ElasticsearchConfig {
    /// Base URL, e.g. `http://localhost:9200`.
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Request timeout in seconds (default: 30).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Refresh the index after each bulk request (default: false).
    #[serde(default)]
    pub refresh: bool,
}

impl ElasticsearchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl fmt::Debug for ElasticsearchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElasticsearchConfig")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("timeout_secs", &self.timeout_secs)
            .field("refresh", &self.refresh)
            .finish()
    }
}

/// Pipeline behavior configuration.
/// Performance-related fields use Option<T> to distinguish between
/// "not set" (use auto-tuned default) and "explicitly set" (use provided value).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Rows per extraction chunk. Auto-tuned based on RAM if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<usize>,

    /// Chunks buffered between extraction and load. Auto-tuned based on RAM if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_depth: Option<usize>,

    /// Documents per bulk request. Auto-tuned based on RAM if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bulk_batch_size: Option<usize>,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Large-text thresholds, flattened into `engine:`.
    #[serde(flatten)]
    pub transform: TransformConfig,

    #[serde(default)]
    pub type_mapper: TypeMapperConfig,

    /// Seconds between scheduled CDC cycles (default: 60).
    #[serde(default = "default_cdc_interval")]
    pub cdc_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: None,
            queue_depth: None,
            bulk_batch_size: None,
            retry: RetryConfig::default(),
            transform: TransformConfig::default(),
            type_mapper: TypeMapperConfig::default(),
            cdc_interval_secs: default_cdc_interval(),
        }
    }
}

impl EngineConfig {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that are None (not explicitly set).
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        let ram_gb = resources.total_memory_gb;

        // Chunk size: 2K rows, +1K per 8GB of RAM, cap at 20K
        if self.chunk_size.is_none() {
            let chunk = 2_000 + (ram_gb / 8.0) as usize * 1_000;
            self.chunk_size = Some(chunk.clamp(2_000, 20_000));
        }

        // Queue depth: more RAM = deeper read-ahead
        if self.queue_depth.is_none() {
            self.queue_depth = Some(((ram_gb / 4.0) as usize).clamp(2, 16));
        }

        // Bulk batch size: scale with RAM
        if self.bulk_batch_size.is_none() {
            let batch = 500 + (ram_gb / 8.0) as usize * 250;
            self.bulk_batch_size = Some(batch.clamp(500, 5_000));
        }

        info!(
            "Auto-tuned config: chunk_size={}, queue_depth={}, bulk_batch_size={}",
            self.get_chunk_size(),
            self.get_queue_depth(),
            self.get_bulk_batch_size(),
        );

        self
    }

    // Accessor methods that return the effective value (with fallback defaults)
    // These are used when the config hasn't been auto-tuned yet

    pub fn get_chunk_size(&self) -> usize {
        self.chunk_size.unwrap_or(5_000)
    }

    pub fn get_queue_depth(&self) -> usize {
        self.queue_depth.unwrap_or(4)
    }

    pub fn get_bulk_batch_size(&self) -> usize {
        self.bulk_batch_size.unwrap_or(1_000)
    }

    pub fn cdc_interval(&self) -> Duration {
        Duration::from_secs(self.cdc_interval_secs)
    }
}

/// Backoff settings applied to bulk writes and connectivity operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first (default: 5).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Fraction of each delay randomized, 0.0 to 1.0 (default: 0.2).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

/// Where jobs and watermarks are persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateConfig {
    /// Directory for `jobs.json` and `watermarks.json`. In-memory when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

/// Where dead-letter records are persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeadLetterConfig {
    /// One JSON file per record. In-memory when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

/// Logging defaults; CLI flags take precedence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions for serde

fn default_pg_port() -> u16 {
    5432
}

fn default_require() -> String {
    "require".to_string()
}

fn default_column_type() -> String {
    "text".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_cdc_interval() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_jitter() -> f64 {
    0.2
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}
