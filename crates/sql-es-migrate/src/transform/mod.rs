//! Transform engine: one source record (a row, or a correlated group of rows
//! from a one-to-many join) into one target document.
//!
//! Order of operations for a record:
//!
//! 1. Field mappings are copied from the first (parent) row and cast to the
//!    target type. NULL values are omitted.
//! 2. Nested fields are built from every row of the group, one element per row.
//! 3. Transformation rules run in configuration order, each writing one path.
//!
//! Failures are per record ([`TransformError`]) and never abort a batch.

mod cast;
mod group;
mod rules;

pub use cast::{cast_json, cast_sql, normalize_date};
pub use group::{RowGrouper, SourceRecord};
pub use rules::{EvalContext, Func, RuleExpr};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::core::{remove_path, set_path, Document, Row};
use crate::error::{MigrateError, Result, TransformError};
use crate::mapping::{FieldMapping, MappingConfiguration, TransformationRule};

/// Large-text handling thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformConfig {
    /// Strings longer than this (UTF-8 bytes) are replaced by a marker.
    #[serde(default = "default_large_text_threshold")]
    pub large_text_threshold_bytes: usize,

    /// Bytes of the original kept in the marker's preview; never more than
    /// the threshold.
    #[serde(default = "default_large_text_preview")]
    pub large_text_preview_bytes: usize,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            large_text_threshold_bytes: default_large_text_threshold(),
            large_text_preview_bytes: default_large_text_preview(),
        }
    }
}

impl TransformConfig {
    /// Preview length actually used: the configured preview, capped at the
    /// threshold.
    pub fn preview_bytes(&self) -> usize {
        self.large_text_preview_bytes.min(self.large_text_threshold_bytes)
    }
}

fn default_large_text_threshold() -> usize {
    32 * 1024
}

fn default_large_text_preview() -> usize {
    1024
}

/// Replaces oversized strings with `{preview, externalRef, truncated: true}`.
#[derive(Debug, Clone)]
pub struct LargeText {
    threshold: usize,
    preview: usize,
}

impl LargeText {
    pub fn new(threshold: usize, preview: usize) -> Self {
        Self {
            threshold,
            preview: preview.min(threshold),
        }
    }

    /// Marker for oversized strings, the string itself otherwise.
    pub fn apply(&self, s: String) -> Value {
        if s.len() <= self.threshold {
            return Value::String(s);
        }
        let mut end = self.preview.min(s.len());
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        let digest = Sha256::digest(s.as_bytes());
        json!({
            "preview": &s[..end],
            "externalRef": format!("sha256:{}", hex::encode(digest)),
            "truncated": true,
        })
    }
}

impl From<&TransformConfig> for LargeText {
    fn from(config: &TransformConfig) -> Self {
        Self::new(config.large_text_threshold_bytes, config.preview_bytes())
    }
}

/// Applies one mapping configuration to source records.
#[derive(Debug, Clone)]
pub struct TransformEngine {
    mapping: MappingConfiguration,
    rules: Vec<(TransformationRule, RuleExpr)>,
    large_text: LargeText,
}

impl TransformEngine {
    /// Build an engine, parsing every rule up front.
    pub fn new(mapping: MappingConfiguration, config: &TransformConfig) -> Result<Self> {
        let rules = mapping
            .transformation_rules
            .iter()
            .map(|rule| {
                RuleExpr::parse(&rule.rule)
                    .map(|expr| (rule.clone(), expr))
                    .map_err(|e| {
                        MigrateError::Config(format!(
                            "mapping '{}': rule for '{}': {}",
                            mapping.name, rule.target, e
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            mapping,
            rules,
            large_text: LargeText::from(config),
        })
    }

    pub fn mapping(&self) -> &MappingConfiguration {
        &self.mapping
    }

    /// A grouper matching this mapping's grouping settings.
    pub fn grouper(&self) -> RowGrouper {
        RowGrouper::new(self.mapping.grouping.as_ref().map(|g| g.parent_key.clone()))
    }

    /// Transform a single row.
    pub fn transform_row(&self, row: &Row) -> std::result::Result<Document, TransformError> {
        self.transform_rows(std::slice::from_ref(row))
    }

    /// Transform a record.
    pub fn transform(&self, record: &SourceRecord) -> std::result::Result<Document, TransformError> {
        self.transform_rows(&record.rows)
    }

    fn transform_rows(&self, rows: &[Row]) -> std::result::Result<Document, TransformError> {
        let parent = rows
            .first()
            .ok_or_else(|| TransformError::new("<record>", "record has no rows"))?;

        let mut body = Map::new();
        self.apply_mappings(&mut body, &self.mapping.field_mappings, parent)?;

        if let Some(grouping) = &self.mapping.grouping {
            for nested in &grouping.nested {
                let mut elements = Vec::with_capacity(rows.len());
                for row in rows {
                    let mut element = Map::new();
                    self.apply_mappings(&mut element, &nested.field_mappings, row)
                        .map_err(|e| TransformError::new(
                            format!("{}.{}", nested.target_field, e.field),
                            e.message,
                        ))?;
                    // Left-join padding rows produce no element.
                    if !element.is_empty() {
                        elements.push(Value::Object(element));
                    }
                }
                set_path(&mut body, &nested.target_field, Value::Array(elements))
                    .map_err(|e| TransformError::new(&nested.target_field, e))?;
            }
        }

        for (rule, expr) in &self.rules {
            let ctx = EvalContext {
                row: parent,
                document: &body,
                target: &rule.target,
                lookups: &self.mapping.lookups,
                large_text: &self.large_text,
            };
            let value = expr
                .eval(&ctx)
                .map_err(|e| TransformError::new(&rule.target, e))?;
            if value.is_null() {
                remove_path(&mut body, &rule.target);
            } else {
                set_path(&mut body, &rule.target, value)
                    .map_err(|e| TransformError::new(&rule.target, e))?;
            }
        }

        let id = self.identity(parent)?;
        Ok(Document::new(id, body))
    }

    fn apply_mappings(
        &self,
        body: &mut Map<String, Value>,
        mappings: &[FieldMapping],
        row: &Row,
    ) -> std::result::Result<(), TransformError> {
        for m in mappings {
            let source = match row.get(&m.source_field) {
                Some(v) => v,
                None if m.required => {
                    return Err(TransformError::new(
                        &m.target_field,
                        format!("source column '{}' not present", m.source_field),
                    ))
                }
                None => continue,
            };
            if source.is_null() {
                continue;
            }
            let value = match cast_sql(source, m.target_type) {
                Ok(Value::String(s)) => self.large_text.apply(s),
                Ok(v) => v,
                Err(e) if m.required => return Err(TransformError::new(&m.target_field, e)),
                Err(e) => {
                    debug!("{}: dropping optional field: {}", m.target_field, e);
                    continue;
                }
            };
            if value.is_null() {
                continue;
            }
            set_path(body, &m.target_field, value)
                .map_err(|e| TransformError::new(&m.target_field, e))?;
        }
        Ok(())
    }

    /// Document identity from the identity key, or the grouping key.
    pub fn identity(&self, row: &Row) -> std::result::Result<Option<String>, TransformError> {
        let key = match (&self.mapping.identity_key, &self.mapping.grouping) {
            (Some(key), _) => key,
            (None, Some(grouping)) => &grouping.parent_key,
            (None, None) => return Ok(None),
        };
        match row.get(key).and_then(|v| v.key_string()) {
            Some(id) => Ok(Some(id)),
            None => Err(TransformError::new(
                "_id",
                format!("identity key '{}' is missing or null", key),
            )),
        }
    }
}
