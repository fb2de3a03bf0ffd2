//! One JSON file per dead-letter record: `<dir>/<mapping>_<timestamp>_<id>.json`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{sort_oldest_first, DeadLetterRecord, DeadLetterStore};
use crate::error::{MigrateError, Result};
use crate::state::write_json_atomic;

/// Dead letters persisted as individual files in a directory.
pub struct FileDeadLetterStore {
    dir: PathBuf,
}

impl FileDeadLetterStore {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn file_name(record: &DeadLetterRecord) -> String {
        let mapping: String = record
            .mapping_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        format!(
            "{}_{}_{}.json",
            mapping,
            record.timestamp.format("%Y%m%dT%H%M%S%.6f"),
            record.id
        )
    }

    fn read_all(&self) -> Result<Vec<(PathBuf, DeadLetterRecord)>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = std::fs::read_to_string(&path)
                .map_err(MigrateError::from)
                .and_then(|content| serde_json::from_str::<DeadLetterRecord>(&content).map_err(MigrateError::from));
            match parsed {
                Ok(record) => out.push((path, record)),
                Err(e) => warn!("Skipping unreadable dead-letter file {}: {}", path.display(), e),
            }
        }
        Ok(out)
    }

    fn find(&self, id: &str) -> Result<Option<PathBuf>> {
        let suffix = format!("_{}.json", id);
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(&suffix))
            {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl DeadLetterStore for FileDeadLetterStore {
    async fn add(&self, record: DeadLetterRecord) -> Result<()> {
        let path = self.dir.join(Self::file_name(&record));
        write_json_atomic(&path, &record)
            .map_err(|e| MigrateError::DeadLetter(format!("writing {}: {}", path.display(), e)))?;
        debug!("Dead-lettered record to {}", path.display());
        Ok(())
    }

    async fn list(&self, mapping: Option<&str>) -> Result<Vec<DeadLetterRecord>> {
        let mut records: Vec<_> = self
            .read_all()?
            .into_iter()
            .map(|(_, r)| r)
            .filter(|r| mapping.map_or(true, |m| r.mapping_id == m))
            .collect();
        sort_oldest_first(&mut records);
        Ok(records)
    }

    async fn update(&self, record: &DeadLetterRecord) -> Result<()> {
        let path = self
            .find(&record.id)?
            .ok_or_else(|| MigrateError::DeadLetter(format!("record {} not found", record.id)))?;
        write_json_atomic(&path, record)
            .map_err(|e| MigrateError::DeadLetter(format!("writing {}: {}", path.display(), e)))
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        match self.find(id)? {
            Some(path) => {
                std::fs::remove_file(&path)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Row, SqlValue};
    use crate::deadletter::FailureStage;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_file_store_lifecycle() {
        let dir = tempdir().unwrap();
        let store = FileDeadLetterStore::open(dir.path()).unwrap();
        let row = Row::from_pairs([("ID", SqlValue::I64(1))]);
        let mut record =
            DeadLetterRecord::new("orders/eu", None, FailureStage::Transform, vec![row], "bad");
        store.add(record.clone()).await.unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("orders_eu_"));

        record.record_retry("still bad");
        store.update(&record).await.unwrap();
        let listed = store.list(Some("orders/eu")).await.unwrap();
        assert_eq!(listed, vec![record.clone()]);

        assert!(store.remove(&record.id).await.unwrap());
        assert!(store.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_files_are_skipped() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("junk.json"), "{not json").unwrap();
        let store = FileDeadLetterStore::open(dir.path()).unwrap();
        assert!(store.list(None).await.unwrap().is_empty());
    }
}
