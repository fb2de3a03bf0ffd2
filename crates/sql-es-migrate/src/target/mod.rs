//! Search-index target operations.

mod elasticsearch;
mod memory;

pub use elasticsearch::ElasticsearchTarget;
pub use memory::MemoryTarget;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::Document;
use crate::error::Result;

/// A field declared in the target index mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetField {
    /// Dotted path for fields under object properties.
    pub name: String,
    pub field_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

impl TargetField {
    pub fn new(name: &str, field_type: &str) -> Self {
        Self {
            name: name.to_string(),
            field_type: field_type.to_string(),
            format: None,
        }
    }
}

/// Outcome of one document in a bulk request.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkItem {
    pub id: Option<String>,
    pub status: u16,
    pub error: Option<String>,
}

impl BulkItem {
    pub fn ok(id: Option<String>) -> Self {
        Self { id, status: 200, error: None }
    }

    pub fn failed(id: Option<String>, status: u16, error: impl Into<String>) -> Self {
        Self {
            id,
            status,
            error: Some(error.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-document results of a bulk write, in request order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkResponse {
    pub items: Vec<BulkItem>,
}

impl BulkResponse {
    pub fn succeeded(&self) -> usize {
        self.items.iter().filter(|i| i.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.items.len() - self.succeeded()
    }

    pub fn has_failures(&self) -> bool {
        self.items.iter().any(|i| !i.is_ok())
    }
}

/// Trait for target system operations.
#[async_trait]
pub trait TargetSystem: Send + Sync {
    /// Write documents in one request. Documents with an id replace any
    /// existing document with that id. Transport failures are `Err`;
    /// per-document rejections are reported in the response.
    async fn bulk_write(&self, index: &str, documents: &[Document]) -> Result<BulkResponse>;

    /// Insert or replace one document by its id.
    async fn upsert(&self, index: &str, document: &Document) -> Result<()>;

    /// Fields declared in the index mapping, sorted by name. Empty when the
    /// index does not exist.
    async fn discover_fields(&self, index: &str) -> Result<Vec<TargetField>>;

    /// Number of documents in the index, `None` when the index does not exist.
    async fn count(&self, index: &str) -> Result<Option<u64>>;

    /// Create the index with the given mapping when absent. Returns true if created.
    async fn ensure_index(&self, index: &str, mapping: &Value) -> Result<bool>;

    /// Check that the target is reachable.
    async fn ping(&self) -> Result<()>;

    /// Get the system type.
    fn system_type(&self) -> &str;
}

/// Flatten a mapping's `properties` into dotted field names.
pub fn flatten_properties(properties: &Value) -> Vec<TargetField> {
    fn walk(properties: &Value, prefix: &str, out: &mut Vec<TargetField>) {
        let Some(props) = properties.as_object() else {
            return;
        };
        for (name, config) in props {
            let full = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{}.{}", prefix, name)
            };
            let field_type = config
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("object")
                .to_string();
            out.push(TargetField {
                name: full.clone(),
                field_type,
                format: config.get("format").and_then(Value::as_str).map(str::to_string),
            });
            if let Some(nested) = config.get("properties") {
                walk(nested, &full, out);
            }
        }
    }

    let mut out = Vec::new();
    walk(properties, "", &mut out);
    out.sort_by(|a, b| a.name.cmp(&b.name));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flatten_properties() {
        let props = json!({
            "order_id": { "type": "long" },
            "placed_at": { "type": "date", "format": "yyyy-MM-dd" },
            "customer": { "properties": { "name": { "type": "text" } } }
        });
        let fields = flatten_properties(&props);
        let names: Vec<_> = fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["customer", "customer.name", "order_id", "placed_at"]);
        assert_eq!(fields[0].field_type, "object");
        assert_eq!(fields[3].format.as_deref(), Some("yyyy-MM-dd"));
    }

    #[test]
    fn test_bulk_response_counts() {
        let resp = BulkResponse {
            items: vec![
                BulkItem::ok(Some("1".into())),
                BulkItem::failed(Some("2".into()), 400, "mapper_parsing_exception"),
            ],
        };
        assert_eq!(resp.succeeded(), 1);
        assert_eq!(resp.failed(), 1);
        assert!(resp.has_failures());
    }
}
