//! Elasticsearch target over the REST API.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{flatten_properties, BulkItem, BulkResponse, TargetField, TargetSystem};
use crate::config::ElasticsearchConfig;
use crate::core::Document;
use crate::error::{MigrateError, Result};

/// Elasticsearch (or OpenSearch) cluster reached with reqwest.
pub struct ElasticsearchTarget {
    client: Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
    refresh: bool,
}

impl ElasticsearchTarget {
    pub fn new(config: &ElasticsearchConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| MigrateError::connectivity("target", format!("building HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            refresh: config.refresh,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn auth(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.username {
            Some(user) => request.basic_auth(user, self.password.as_ref()),
            None => request,
        }
    }

    /// Turn a non-success status into a retryable load error carrying the body.
    async fn check(index: &str, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(MigrateError::load_batch(
            index,
            1,
            format!("HTTP {}: {}", status, truncate(&body, 512)),
        ))
    }
}

/// Build the NDJSON body of a `_bulk` request.
fn bulk_body(index: &str, documents: &[Document]) -> Result<String> {
    let mut body = String::new();
    for doc in documents {
        let action = match &doc.id {
            Some(id) => json!({ "index": { "_index": index, "_id": id } }),
            None => json!({ "index": { "_index": index } }),
        };
        body.push_str(&serde_json::to_string(&action)?);
        body.push('\n');
        body.push_str(&serde_json::to_string(&doc.body)?);
        body.push('\n');
    }
    Ok(body)
}

/// Map `_bulk` response items back onto the request documents.
fn parse_bulk_items(documents: &[Document], response: &Value) -> BulkResponse {
    let items = response
        .get("items")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let results = documents
        .iter()
        .enumerate()
        .map(|(i, doc)| {
            let Some(item) = items.get(i).and_then(|item| item.get("index")) else {
                return BulkItem::failed(doc.id.clone(), 0, "missing item in bulk response");
            };
            let status = item.get("status").and_then(Value::as_u64).unwrap_or(0) as u16;
            match item.get("error") {
                Some(error) => {
                    let kind = error.get("type").and_then(Value::as_str).unwrap_or("error");
                    let reason = error.get("reason").and_then(Value::as_str).unwrap_or("");
                    BulkItem::failed(doc.id.clone(), status, format!("{}: {}", kind, reason))
                }
                None => BulkItem {
                    id: item
                        .get("_id")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .or_else(|| doc.id.clone()),
                    status,
                    error: None,
                },
            }
        })
        .collect();
    BulkResponse { items: results }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[async_trait]
impl TargetSystem for ElasticsearchTarget {
    async fn bulk_write(&self, index: &str, documents: &[Document]) -> Result<BulkResponse> {
        if documents.is_empty() {
            return Ok(BulkResponse::default());
        }
        let body = bulk_body(index, documents)?;
        let path = if self.refresh { "_bulk?refresh=wait_for" } else { "_bulk" };
        let response = self
            .auth(self.client.post(self.url(path)))
            .header("Content-Type", "application/x-ndjson")
            .body(body)
            .send()
            .await?;
        let response = Self::check(index, response).await?;
        let parsed: Value = response.json().await?;
        let result = parse_bulk_items(documents, &parsed);
        debug!(
            "Bulk wrote {} documents to {} ({} rejected)",
            result.succeeded(),
            index,
            result.failed()
        );
        Ok(result)
    }

    async fn upsert(&self, index: &str, document: &Document) -> Result<()> {
        let request = match &document.id {
            Some(id) => self.client.put(self.url(&format!("{}/_doc/{}", index, id))),
            None => self.client.post(self.url(&format!("{}/_doc", index))),
        };
        let response = self.auth(request).json(&document.body).send().await?;
        Self::check(index, response).await?;
        Ok(())
    }

    async fn discover_fields(&self, index: &str) -> Result<Vec<TargetField>> {
        let response = self
            .auth(self.client.get(self.url(&format!("{}/_mapping", index))))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let parsed: Value = Self::check(index, response).await?.json().await?;
        let properties = parsed
            .as_object()
            .and_then(|indices| indices.values().next())
            .and_then(|m| m.pointer("/mappings/properties"))
            .cloned()
            .unwrap_or(Value::Null);
        Ok(flatten_properties(&properties))
    }

    async fn count(&self, index: &str) -> Result<Option<u64>> {
        let response = self
            .auth(self.client.get(self.url(&format!("{}/_count", index))))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let parsed: Value = Self::check(index, response).await?.json().await?;
        Ok(parsed.get("count").and_then(Value::as_u64))
    }

    async fn ensure_index(&self, index: &str, mapping: &Value) -> Result<bool> {
        let exists = self.auth(self.client.head(self.url(index))).send().await?;
        if exists.status().is_success() {
            return Ok(false);
        }
        let response = self
            .auth(self.client.put(self.url(index)))
            .json(&json!({ "mappings": mapping }))
            .send()
            .await?;
        if response.status() == StatusCode::BAD_REQUEST {
            let body = response.text().await.unwrap_or_default();
            if body.contains("resource_already_exists_exception") {
                return Ok(false);
            }
            return Err(MigrateError::Config(format!(
                "creating index {} rejected: {}",
                index,
                truncate(&body, 512)
            )));
        }
        Self::check(index, response).await?;
        info!("Created index {}", index);
        Ok(true)
    }

    async fn ping(&self) -> Result<()> {
        let response = self.auth(self.client.get(self.url("/"))).send().await?;
        if !response.status().is_success() {
            return Err(MigrateError::connectivity(
                "target",
                format!("{} returned HTTP {}", self.base_url, response.status()),
            ));
        }
        Ok(())
    }

    fn system_type(&self) -> &str {
        "elasticsearch"
    }
}
