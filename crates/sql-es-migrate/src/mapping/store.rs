//! Configuration store contract.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::MappingConfiguration;
use crate::error::Result;

/// Get/list/save mapping configurations by name.
#[async_trait]
pub trait MappingStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<MappingConfiguration>>;

    async fn list(&self) -> Result<Vec<MappingConfiguration>>;

    async fn save(&self, config: MappingConfiguration) -> Result<()>;
}

/// In-process store, seeded from the YAML config.
#[derive(Default)]
pub struct MemoryMappingStore {
    mappings: RwLock<BTreeMap<String, MappingConfiguration>>,
}

impl MemoryMappingStore {
    pub fn new(mappings: impl IntoIterator<Item = MappingConfiguration>) -> Self {
        Self {
            mappings: RwLock::new(
                mappings
                    .into_iter()
                    .map(|m| (m.name.clone(), m))
                    .collect(),
            ),
        }
    }
}

#[async_trait]
impl MappingStore for MemoryMappingStore {
    async fn get(&self, name: &str) -> Result<Option<MappingConfiguration>> {
        Ok(self.mappings.read().await.get(name).cloned())
    }

    async fn list(&self) -> Result<Vec<MappingConfiguration>> {
        Ok(self.mappings.read().await.values().cloned().collect())
    }

    async fn save(&self, config: MappingConfiguration) -> Result<()> {
        self.mappings
            .write()
            .await
            .insert(config.name.clone(), config);
        Ok(())
    }
}
