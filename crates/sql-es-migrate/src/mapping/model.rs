//! Mapping configuration types.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::is_valid_path;
use crate::error::{MigrateError, Result};
use crate::transform::RuleExpr;
use crate::typemap::{ColumnType, FieldType};

/// How a field mapping was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingType {
    /// Proposed by the auto-mapping suggester.
    Auto,
    /// Set by a user. Always wins over an auto mapping for the same target.
    #[default]
    Manual,
}

/// One source column to one target field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub source_field: String,

    /// Declared source type, e.g. `NUMBER(10,2)`. Empty when unknown.
    #[serde(default)]
    pub source_type: String,

    /// Dotted target path.
    pub target_field: String,

    pub target_type: FieldType,

    /// Informational only; never gates execution.
    #[serde(default = "default_confidence")]
    pub confidence: u8,

    #[serde(default)]
    pub mapping_type: MappingType,

    /// A value that cannot be cast fails the record when required,
    /// and is dropped from the document otherwise.
    #[serde(default = "default_true")]
    pub required: bool,
}

impl FieldMapping {
    /// Manual mapping with full confidence.
    pub fn new(source_field: &str, target_field: &str, target_type: FieldType) -> Self {
        Self {
            source_field: source_field.to_string(),
            source_type: String::new(),
            target_field: target_field.to_string(),
            target_type,
            confidence: 100,
            mapping_type: MappingType::Manual,
            required: true,
        }
    }

    pub fn with_source_type(mut self, source_type: &str) -> Self {
        self.source_type = source_type.to_string();
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Parsed source type, if one was declared.
    pub fn column_type(&self) -> Option<ColumnType> {
        if self.source_type.trim().is_empty() {
            None
        } else {
            Some(ColumnType::parse(&self.source_type))
        }
    }
}

/// A rule applied to one target path after field copying.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformationRule {
    /// Dotted target path the rule writes.
    pub target: String,
    /// Rule expression, e.g. `date_normalize` or `concat(first_name, " ", last_name)`.
    pub rule: String,
    /// Free text; no behavioral effect.
    #[serde(default)]
    pub description: String,
}

impl TransformationRule {
    pub fn new(target: &str, rule: &str) -> Self {
        Self {
            target: target.to_string(),
            rule: rule.to_string(),
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }
}

/// Correlated rows from a one-to-many join folded into one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupingConfig {
    /// Source column identifying the parent record.
    pub parent_key: String,
    /// Repeated child fields materialized as ordered lists.
    #[serde(default)]
    pub nested: Vec<NestedField>,
}

/// One list-valued target field built from child rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NestedField {
    /// Dotted target path of the list.
    pub target_field: String,
    /// Mappings whose `target_field` is relative to each list element.
    pub field_mappings: Vec<FieldMapping>,
}

/// Which change indicator a CDC cycle reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorKind {
    /// A last-modified timestamp column.
    #[default]
    Timestamp,
    /// A monotonically increasing log position (SCN, LSN, sequence).
    LogPosition,
}

/// Change tracking settings for incremental runs and CDC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeTracking {
    /// Source column holding the change indicator.
    pub column: String,
    #[serde(default)]
    pub kind: IndicatorKind,
}

/// Full or incremental one-shot runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStrategy {
    #[default]
    Full,
    /// Start from the stored watermark and advance it on success.
    Incremental,
}

/// A named source-query-to-index mapping. Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingConfiguration {
    /// Unique, user-chosen identity.
    pub name: String,

    /// Source connection reference.
    pub source_connection: String,

    /// Source query. Takes precedence over `source_table`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_query: Option<String>,

    /// Source table, used with `source_columns` when no query is given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_table: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_columns: Vec<String>,

    /// Target connection reference.
    pub target_connection: String,

    pub target_index: String,

    #[serde(default)]
    pub field_mappings: Vec<FieldMapping>,

    #[serde(default)]
    pub transformation_rules: Vec<TransformationRule>,

    /// Source column used as the document identity (upsert key).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grouping: Option<GroupingConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_tracking: Option<ChangeTracking>,

    #[serde(default)]
    pub strategy: MigrationStrategy,

    /// Named lookup tables for the `lookup` rule.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub lookups: BTreeMap<String, BTreeMap<String, Value>>,
}

impl MappingConfiguration {
    /// Empty configuration for a query/index pair.
    pub fn new(
        name: &str,
        source_connection: &str,
        source_query: &str,
        target_connection: &str,
        target_index: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            source_connection: source_connection.to_string(),
            source_query: Some(source_query.to_string()),
            source_table: None,
            source_columns: Vec::new(),
            target_connection: target_connection.to_string(),
            target_index: target_index.to_string(),
            field_mappings: Vec::new(),
            transformation_rules: Vec::new(),
            identity_key: None,
            grouping: None,
            change_tracking: None,
            strategy: MigrationStrategy::Full,
            lookups: BTreeMap::new(),
        }
    }

    /// The effective source query.
    pub fn query(&self) -> Result<String> {
        if let Some(q) = self.source_query.as_deref().map(str::trim) {
            if !q.is_empty() {
                return Ok(q.to_string());
            }
        }
        match self.source_table.as_deref().map(str::trim) {
            Some(table) if !table.is_empty() => {
                let columns = if self.source_columns.is_empty() {
                    "*".to_string()
                } else {
                    self.source_columns.join(", ")
                };
                Ok(format!("SELECT {} FROM {}", columns, table))
            }
            _ => Err(MigrateError::Config(format!(
                "mapping '{}' has neither source_query nor source_table",
                self.name
            ))),
        }
    }

    /// Add or replace the mapping for `mapping.target_field`.
    ///
    /// A manual mapping is never replaced by an auto mapping; otherwise the
    /// last write wins and keeps the original position. Returns whether the
    /// mapping was applied.
    pub fn set_field_mapping(&mut self, mapping: FieldMapping) -> bool {
        match self
            .field_mappings
            .iter_mut()
            .find(|m| m.target_field == mapping.target_field)
        {
            Some(existing) => {
                if existing.mapping_type == MappingType::Manual
                    && mapping.mapping_type == MappingType::Auto
                {
                    return false;
                }
                *existing = mapping;
                true
            }
            None => {
                self.field_mappings.push(mapping);
                true
            }
        }
    }

    /// Remove the mapping for a target field.
    pub fn remove_field_mapping(&mut self, target_field: &str) -> Option<FieldMapping> {
        let idx = self
            .field_mappings
            .iter()
            .position(|m| m.target_field == target_field)?;
        Some(self.field_mappings.remove(idx))
    }

    /// Submission-time checks. Failures are configuration errors.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(MigrateError::Config(format!("mapping '{}': {}", self.name, msg)));

        if self.name.trim().is_empty() {
            return Err(MigrateError::Config("mapping name is required".into()));
        }
        if self.source_connection.trim().is_empty() {
            return fail("source_connection is required".into());
        }
        if self.target_connection.trim().is_empty() {
            return fail("target_connection is required".into());
        }
        if self.target_index.trim().is_empty() {
            return fail("target_index is required".into());
        }
        self.query()?;
        if self.field_mappings.is_empty() {
            return fail("at least one field mapping is required".into());
        }

        let report = super::validate_field_mappings(&self.field_mappings);
        if let Some(first) = report.errors.first() {
            return fail(first.clone());
        }

        let mut targets: HashSet<&str> = self
            .field_mappings
            .iter()
            .map(|m| m.target_field.as_str())
            .collect();

        if let Some(grouping) = &self.grouping {
            if grouping.parent_key.trim().is_empty() {
                return fail("grouping.parent_key is required".into());
            }
            for nested in &grouping.nested {
                if !is_valid_path(&nested.target_field) {
                    return fail(format!("invalid nested target '{}'", nested.target_field));
                }
                if !targets.insert(nested.target_field.as_str()) {
                    return fail(format!("duplicate target field '{}'", nested.target_field));
                }
                let nested_report = super::validate_field_mappings(&nested.field_mappings);
                if let Some(first) = nested_report.errors.first() {
                    return fail(format!("{}: {}", nested.target_field, first));
                }
            }
        }

        for rule in &self.transformation_rules {
            if !is_valid_path(&rule.target) {
                return fail(format!("invalid rule target '{}'", rule.target));
            }
            let expr = RuleExpr::parse(&rule.rule)
                .map_err(|e| MigrateError::Config(format!(
                    "mapping '{}': rule for '{}': {}",
                    self.name, rule.target, e
                )))?;
            for table in expr.lookup_tables() {
                if !self.lookups.contains_key(table) {
                    return fail(format!("rule for '{}' references unknown lookup '{}'", rule.target, table));
                }
            }
        }

        if let Some(tracking) = &self.change_tracking {
            if tracking.column.trim().is_empty() {
                return fail("change_tracking.column is required".into());
            }
        }
        if self.strategy == MigrationStrategy::Incremental {
            if self.change_tracking.is_none() {
                return fail("incremental strategy requires change_tracking".into());
            }
            if self.identity_key.is_none() {
                return fail("incremental strategy requires identity_key".into());
            }
        }
        Ok(())
    }
}

fn default_confidence() -> u8 {
    100
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders() -> MappingConfiguration {
        let mut cfg = MappingConfiguration::new(
            "orders",
            "oltp",
            "SELECT * FROM orders",
            "search",
            "orders",
        );
        cfg.set_field_mapping(FieldMapping::new("ORDER_ID", "order_id", FieldType::Long));
        cfg.set_field_mapping(FieldMapping::new("AMOUNT", "amount", FieldType::Double));
        cfg
    }

    fn auto(source: &str, target: &str, ft: FieldType) -> FieldMapping {
        FieldMapping {
            mapping_type: MappingType::Auto,
            confidence: 70,
            ..FieldMapping::new(source, target, ft)
        }
    }

    #[test]
    fn test_manual_mapping_wins_over_auto() {
        let mut cfg = orders();
        assert!(!cfg.set_field_mapping(auto("TOTAL", "amount", FieldType::Float)));
        assert_eq!(cfg.field_mappings[1].source_field, "AMOUNT");
    }

    #[test]
    fn test_last_manual_write_wins_in_place() {
        let mut cfg = orders();
        assert!(cfg.set_field_mapping(FieldMapping::new("TOTAL", "amount", FieldType::Float)));
        assert_eq!(cfg.field_mappings.len(), 2);
        assert_eq!(cfg.field_mappings[1].source_field, "TOTAL");
    }

    #[test]
    fn test_auto_replaced_by_manual() {
        let mut cfg = orders();
        cfg.set_field_mapping(auto("STATUS", "status", FieldType::Keyword));
        assert!(cfg.set_field_mapping(FieldMapping::new("STATE", "status", FieldType::Keyword)));
        assert_eq!(cfg.field_mappings[2].mapping_type, MappingType::Manual);
    }

    #[test]
    fn test_query_from_table_and_columns() {
        let mut cfg = orders();
        cfg.source_query = None;
        cfg.source_table = Some("sales.orders".into());
        cfg.source_columns = vec!["ORDER_ID".into(), "AMOUNT".into()];
        assert_eq!(cfg.query().unwrap(), "SELECT ORDER_ID, AMOUNT FROM sales.orders");
        cfg.source_table = None;
        assert!(cfg.query().is_err());
    }

    #[test]
    fn test_validate_accepts_valid_mapping() {
        let mut cfg = orders();
        cfg.transformation_rules
            .push(TransformationRule::new("order_date", "date_normalize"));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_rule_and_unknown_lookup() {
        let mut cfg = orders();
        cfg.transformation_rules
            .push(TransformationRule::new("x", "concat(a,"));
        assert!(matches!(cfg.validate(), Err(MigrateError::Config(_))));

        let mut cfg = orders();
        cfg.transformation_rules
            .push(TransformationRule::new("status", "lookup(STATUS, \"codes\")"));
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("unknown lookup 'codes'"));
    }

    #[test]
    fn test_validate_incremental_requires_tracking() {
        let mut cfg = orders();
        cfg.strategy = MigrationStrategy::Incremental;
        assert!(cfg.validate().is_err());
        cfg.change_tracking = Some(ChangeTracking {
            column: "UPDATED_AT".into(),
            kind: IndicatorKind::Timestamp,
        });
        cfg.identity_key = Some("ORDER_ID".into());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_yaml_defaults() {
        let yaml = r#"
name: orders
source_connection: oltp
source_query: SELECT * FROM orders
target_connection: search
target_index: orders
field_mappings:
  - source_field: ORDER_ID
    target_field: order_id
    target_type: long
"#;
        let cfg: MappingConfiguration = serde_yaml::from_str(yaml).unwrap();
        let m = &cfg.field_mappings[0];
        assert_eq!(m.mapping_type, MappingType::Manual);
        assert_eq!(m.confidence, 100);
        assert!(m.required);
        assert_eq!(cfg.strategy, MigrationStrategy::Full);
    }
}
