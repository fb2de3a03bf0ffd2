//! Resolve source and target connections by reference name.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::{ConnectionsConfig, SourceConnection, TargetConnection};
use crate::error::{MigrateError, Result};
use crate::source::{MemorySource, PostgresSource, SourceSystem};
use crate::target::{ElasticsearchTarget, MemoryTarget, TargetSystem};

/// Hands out shared connections for the names mappings refer to.
#[async_trait]
pub trait ConnectionResolver: Send + Sync {
    async fn source(&self, name: &str) -> Result<Arc<dyn SourceSystem>>;

    async fn target(&self, name: &str) -> Result<Arc<dyn TargetSystem>>;
}

fn normalize_name(value: &str) -> Result<String> {
    let name = value.trim();
    if name.is_empty() {
        return Err(MigrateError::Config("connection name is required".into()));
    }
    Ok(name.to_string())
}

/// Pre-built connections, registered by name.
#[derive(Default, Clone)]
pub struct StaticConnections {
    sources: HashMap<String, Arc<dyn SourceSystem>>,
    targets: HashMap<String, Arc<dyn TargetSystem>>,
}

impl StaticConnections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, name: &str, source: Arc<dyn SourceSystem>) -> Self {
        self.sources.insert(name.to_string(), source);
        self
    }

    pub fn with_target(mut self, name: &str, target: Arc<dyn TargetSystem>) -> Self {
        self.targets.insert(name.to_string(), target);
        self
    }
}

#[async_trait]
impl ConnectionResolver for StaticConnections {
    async fn source(&self, name: &str) -> Result<Arc<dyn SourceSystem>> {
        let name = normalize_name(name)?;
        self.sources
            .get(&name)
            .cloned()
            .ok_or_else(|| MigrateError::Config(format!("source connection '{}' not found", name)))
    }

    async fn target(&self, name: &str) -> Result<Arc<dyn TargetSystem>> {
        let name = normalize_name(name)?;
        self.targets
            .get(&name)
            .cloned()
            .ok_or_else(|| MigrateError::Config(format!("target connection '{}' not found", name)))
    }
}

/// Connections built from the YAML `connections:` section on first use and
/// cached, so every job on a connection shares one pool.
pub struct ConfiguredConnections {
    config: ConnectionsConfig,
    sources: Mutex<HashMap<String, Arc<dyn SourceSystem>>>,
    targets: Mutex<HashMap<String, Arc<dyn TargetSystem>>>,
}

impl ConfiguredConnections {
    pub fn new(config: ConnectionsConfig) -> Self {
        Self {
            config,
            sources: Mutex::new(HashMap::new()),
            targets: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ConnectionResolver for ConfiguredConnections {
    async fn source(&self, name: &str) -> Result<Arc<dyn SourceSystem>> {
        let name = normalize_name(name)?;
        let mut cache = self.sources.lock().await;
        if let Some(existing) = cache.get(&name) {
            return Ok(existing.clone());
        }
        let built: Arc<dyn SourceSystem> = match self.config.sources.get(&name) {
            Some(SourceConnection::Postgres(pg)) => Arc::new(PostgresSource::new(pg).await?),
            Some(SourceConnection::Memory(mem)) => Arc::new(MemorySource::from_config(mem)?),
            None => {
                return Err(MigrateError::Config(format!(
                    "source connection '{}' not found",
                    name
                )))
            }
        };
        debug!("Opened source connection {} ({})", name, built.system_type());
        cache.insert(name, built.clone());
        Ok(built)
    }

    async fn target(&self, name: &str) -> Result<Arc<dyn TargetSystem>> {
        let name = normalize_name(name)?;
        let mut cache = self.targets.lock().await;
        if let Some(existing) = cache.get(&name) {
            return Ok(existing.clone());
        }
        let built: Arc<dyn TargetSystem> = match self.config.targets.get(&name) {
            Some(TargetConnection::Elasticsearch(es)) => Arc::new(ElasticsearchTarget::new(es)?),
            Some(TargetConnection::Memory) => Arc::new(MemoryTarget::new()),
            None => {
                return Err(MigrateError::Config(format!(
                    "target connection '{}' not found",
                    name
                )))
            }
        };
        debug!("Opened target connection {} ({})", name, built.system_type());
        cache.insert(name, built.clone());
        Ok(built)
    }
}
