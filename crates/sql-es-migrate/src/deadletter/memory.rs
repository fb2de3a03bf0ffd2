use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{sort_oldest_first, DeadLetterRecord, DeadLetterStore};
use crate::error::{MigrateError, Result};

/// Dead letters held in process memory.
#[derive(Default)]
pub struct MemoryDeadLetterStore {
    records: RwLock<HashMap<String, DeadLetterRecord>>,
}

impl MemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeadLetterStore for MemoryDeadLetterStore {
    async fn add(&self, record: DeadLetterRecord) -> Result<()> {
        self.records.write().await.insert(record.id.clone(), record);
        Ok(())
    }

    async fn list(&self, mapping: Option<&str>) -> Result<Vec<DeadLetterRecord>> {
        let mut records: Vec<_> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| mapping.map_or(true, |m| r.mapping_id == m))
            .cloned()
            .collect();
        sort_oldest_first(&mut records);
        Ok(records)
    }

    async fn update(&self, record: &DeadLetterRecord) -> Result<()> {
        match self.records.write().await.get_mut(&record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(MigrateError::DeadLetter(format!("record {} not found", record.id))),
        }
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        Ok(self.records.write().await.remove(id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deadletter::FailureStage;

    #[tokio::test]
    async fn test_list_filters_by_mapping() {
        let store = MemoryDeadLetterStore::new();
        store
            .add(DeadLetterRecord::new("orders", None, FailureStage::Transform, vec![], "a"))
            .await
            .unwrap();
        store
            .add(DeadLetterRecord::new("customers", None, FailureStage::Load, vec![], "b"))
            .await
            .unwrap();
        assert_eq!(store.list(Some("orders")).await.unwrap().len(), 1);
        assert_eq!(store.list(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_update_and_remove() {
        let store = MemoryDeadLetterStore::new();
        let mut record = DeadLetterRecord::new("orders", None, FailureStage::Load, vec![], "503");
        store.add(record.clone()).await.unwrap();
        record.record_retry("504");
        store.update(&record).await.unwrap();
        assert_eq!(store.list(None).await.unwrap()[0].retry_count, 1);
        assert!(store.remove(&record.id).await.unwrap());
        assert!(!store.remove(&record.id).await.unwrap());
        assert!(store.update(&record).await.is_err());
    }
}
