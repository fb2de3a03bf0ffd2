//! In-memory target.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{flatten_properties, BulkItem, BulkResponse, TargetField, TargetSystem};
use crate::core::Document;
use crate::error::{MigrateError, Result};

type RejectFn = Box<dyn Fn(&Document) -> Option<String> + Send + Sync>;

#[derive(Default)]
struct IndexState {
    docs: BTreeMap<String, Map<String, Value>>,
    mapping: Option<Value>,
    fields: Option<Vec<TargetField>>,
    next_auto_id: u64,
}

/// Documents kept per index, keyed by id. Failures can be scripted per
/// document or per request.
#[derive(Default)]
pub struct MemoryTarget {
    indices: Mutex<HashMap<String, IndexState>>,
    reject: Mutex<Option<RejectFn>>,
    fail_next: AtomicU32,
    refuse_after: Mutex<Option<usize>>,
    unreachable: AtomicBool,
    bulk_calls: AtomicUsize,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the fields `discover_fields` reports for an index.
    pub fn with_fields(self, index: &str, fields: Vec<TargetField>) -> Self {
        if let Ok(mut indices) = self.indices.lock() {
            indices.entry(index.to_string()).or_default().fields = Some(fields);
        }
        self
    }

    /// Reject documents for which `predicate` returns an error message.
    pub fn reject_when<F>(&self, predicate: F)
    where
        F: Fn(&Document) -> Option<String> + Send + Sync + 'static,
    {
        if let Ok(mut reject) = self.reject.lock() {
            *reject = Some(Box::new(predicate));
        }
    }

    pub fn clear_rejections(&self) {
        if let Ok(mut reject) = self.reject.lock() {
            *reject = None;
        }
    }

    /// Fail the next `n` bulk requests as a whole (HTTP 503).
    pub fn fail_next_bulk(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Accept the first `requests` bulk requests, then fail every later one
    /// as a whole (HTTP 503).
    pub fn refuse_bulk_after(&self, requests: usize) {
        if let Ok(mut limit) = self.refuse_after.lock() {
            *limit = Some(requests);
        }
    }

    /// Fail every request with a connectivity error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Number of bulk requests received, including failed ones.
    pub fn bulk_calls(&self) -> usize {
        self.bulk_calls.load(Ordering::SeqCst)
    }

    /// Stored document bodies, ordered by id.
    pub fn documents(&self, index: &str) -> Vec<Map<String, Value>> {
        self.indices
            .lock()
            .ok()
            .and_then(|indices| indices.get(index).map(|s| s.docs.values().cloned().collect()))
            .unwrap_or_default()
    }

    pub fn get(&self, index: &str, id: &str) -> Option<Map<String, Value>> {
        self.indices
            .lock()
            .ok()
            .and_then(|indices| indices.get(index).and_then(|s| s.docs.get(id).cloned()))
    }

    pub fn doc_count(&self, index: &str) -> usize {
        self.indices
            .lock()
            .ok()
            .and_then(|indices| indices.get(index).map(|s| s.docs.len()))
            .unwrap_or(0)
    }

    /// Mapping the index was created with, if any.
    pub fn mapping(&self, index: &str) -> Option<Value> {
        self.indices
            .lock()
            .ok()
            .and_then(|indices| indices.get(index).and_then(|s| s.mapping.clone()))
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(MigrateError::connectivity("target", "connection refused"));
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, IndexState>>> {
        self.indices
            .lock()
            .map_err(|_| MigrateError::connectivity("target", "memory target poisoned"))
    }

    fn rejection(&self, doc: &Document) -> Option<String> {
        self.reject
            .lock()
            .ok()
            .and_then(|reject| reject.as_ref().and_then(|f| f(doc)))
    }
}

fn store(state: &mut IndexState, doc: &Document) -> String {
    let id = match &doc.id {
        Some(id) => id.clone(),
        None => {
            state.next_auto_id += 1;
            format!("auto-{}", state.next_auto_id)
        }
    };
    state.docs.insert(id.clone(), doc.body.clone());
    id
}

#[async_trait]
impl TargetSystem for MemoryTarget {
    async fn bulk_write(&self, index: &str, documents: &[Document]) -> Result<BulkResponse> {
        let call = self.bulk_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.check_reachable()?;
        let refused = self
            .refuse_after
            .lock()
            .ok()
            .and_then(|limit| *limit)
            .is_some_and(|limit| call > limit);
        let scripted = refused
            || self
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if scripted {
            return Err(MigrateError::load_batch(index, 1, "HTTP 503: service unavailable"));
        }

        let rejections: Vec<Option<String>> = documents.iter().map(|d| self.rejection(d)).collect();
        let mut indices = self.lock()?;
        let state = indices.entry(index.to_string()).or_default();
        let items = documents
            .iter()
            .zip(rejections)
            .map(|(doc, rejected)| match rejected {
                Some(reason) => BulkItem::failed(doc.id.clone(), 400, reason),
                None => BulkItem::ok(Some(store(state, doc))),
            })
            .collect();
        Ok(BulkResponse { items })
    }

    async fn upsert(&self, index: &str, document: &Document) -> Result<()> {
        self.check_reachable()?;
        if let Some(reason) = self.rejection(document) {
            return Err(MigrateError::load_batch(index, 1, reason));
        }
        let mut indices = self.lock()?;
        store(indices.entry(index.to_string()).or_default(), document);
        Ok(())
    }

    async fn discover_fields(&self, index: &str) -> Result<Vec<TargetField>> {
        self.check_reachable()?;
        let indices = self.lock()?;
        let Some(state) = indices.get(index) else {
            return Ok(Vec::new());
        };
        if let Some(fields) = &state.fields {
            let mut fields = fields.clone();
            fields.sort_by(|a, b| a.name.cmp(&b.name));
            return Ok(fields);
        }
        Ok(state
            .mapping
            .as_ref()
            .and_then(|m| m.get("properties"))
            .map(flatten_properties)
            .unwrap_or_default())
    }

    async fn count(&self, index: &str) -> Result<Option<u64>> {
        self.check_reachable()?;
        Ok(self.lock()?.get(index).map(|s| s.docs.len() as u64))
    }

    async fn ensure_index(&self, index: &str, mapping: &Value) -> Result<bool> {
        self.check_reachable()?;
        let mut indices = self.lock()?;
        let state = indices.entry(index.to_string()).or_default();
        if state.mapping.is_some() {
            return Ok(false);
        }
        state.mapping = Some(mapping.clone());
        Ok(true)
    }

    async fn ping(&self) -> Result<()> {
        self.check_reachable()
    }

    fn system_type(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(id: &str, n: i64) -> Document {
        let mut body = Map::new();
        body.insert("n".into(), json!(n));
        Document::new(Some(id.to_string()), body)
    }

    #[tokio::test]
    async fn test_bulk_write_replaces_by_id() {
        let target = MemoryTarget::new();
        target.bulk_write("idx", &[doc("1", 1), doc("2", 2)]).await.unwrap();
        target.bulk_write("idx", &[doc("1", 10)]).await.unwrap();
        assert_eq!(target.doc_count("idx"), 2);
        assert_eq!(target.get("idx", "1").unwrap()["n"], json!(10));
        assert_eq!(target.count("idx").await.unwrap(), Some(2));
        assert_eq!(target.count("other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rejections_are_per_document() {
        let target = MemoryTarget::new();
        target.reject_when(|d| (d.body["n"] == json!(2)).then(|| "bad n".to_string()));
        let resp = target.bulk_write("idx", &[doc("1", 1), doc("2", 2)]).await.unwrap();
        assert_eq!(resp.succeeded(), 1);
        assert_eq!(resp.items[1].error.as_deref(), Some("bad n"));
        assert_eq!(target.doc_count("idx"), 1);
    }

    #[tokio::test]
    async fn test_scripted_request_failures() {
        let target = MemoryTarget::new();
        target.fail_next_bulk(2);
        assert!(target.bulk_write("idx", &[doc("1", 1)]).await.is_err());
        assert!(target.bulk_write("idx", &[doc("1", 1)]).await.is_err());
        assert!(target.bulk_write("idx", &[doc("1", 1)]).await.is_ok());
        assert_eq!(target.bulk_calls(), 3);

        target.set_unreachable(true);
        assert!(target.ping().await.is_err());
    }

    #[tokio::test]
    async fn test_ensure_index_and_discovery() {
        let target = MemoryTarget::new();
        let mapping = json!({ "properties": { "a": { "type": "keyword" } } });
        assert!(target.ensure_index("idx", &mapping).await.unwrap());
        assert!(!target.ensure_index("idx", &mapping).await.unwrap());
        let fields = target.discover_fields("idx").await.unwrap();
        assert_eq!(fields, vec![TargetField::new("a", "keyword")]);
        assert!(target.discover_fields("missing").await.unwrap().is_empty());
    }
}
