//! Field mapping validation.
//!
//! Errors make a mapping unusable; warnings are advisory and never block a run.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::{FieldMapping, MappingType, TransformationRule};
use crate::core::is_valid_path;
use crate::transform::{Func, RuleExpr};
use crate::typemap::{is_compatible, FieldType, TypeClass};

/// Confidence below which auto mappings are flagged for review.
const LOW_CONFIDENCE: u8 = 50;

/// Non-fatal finding on a field mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
}

impl ValidationWarning {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Result of validate-mapping.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<ValidationWarning>,
}

/// Validate a field mapping set.
pub fn validate_field_mappings(mappings: &[FieldMapping]) -> ValidationReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();

    for (idx, m) in mappings.iter().enumerate() {
        let label = if m.target_field.is_empty() {
            format!("#{}", idx + 1)
        } else {
            m.target_field.clone()
        };

        if m.source_field.trim().is_empty() {
            errors.push(format!("{}: source field is required", label));
        }
        if m.target_field.trim().is_empty() {
            errors.push(format!("{}: target field is required", label));
            continue;
        }
        if !is_valid_path(&m.target_field) {
            errors.push(format!("{}: invalid target field path", label));
        }
        if !seen.insert(m.target_field.as_str()) {
            errors.push(format!("{}: duplicate target field", label));
        }

        if let Some(column) = m.column_type() {
            if !is_compatible(&column, m.target_type) {
                warnings.push(ValidationWarning::new(
                    &label,
                    format!(
                        "source type {} may not convert cleanly to {}",
                        column, m.target_type
                    ),
                ));
            }
            if matches!(column.class(), TypeClass::LargeText | TypeClass::LargeBinary) {
                warnings.push(ValidationWarning::new(
                    &label,
                    "large object source; review manually",
                ));
            }
        }
        if m.mapping_type == MappingType::Auto && m.confidence < LOW_CONFIDENCE {
            warnings.push(ValidationWarning::new(
                &label,
                format!("low confidence auto mapping ({})", m.confidence),
            ));
        }
    }

    // A field cannot be both a leaf and the parent of another field.
    let mut targets: Vec<&str> = seen.iter().copied().collect();
    targets.sort_unstable();
    for child in targets {
        for (pos, _) in child.match_indices('.') {
            let parent = &child[..pos];
            if seen.contains(parent) {
                errors.push(format!("{}: conflicts with nested field {}", parent, child));
            }
        }
    }

    ValidationReport {
        valid: errors.is_empty(),
        errors,
        warnings,
    }
}

/// Validate field mappings together with the rules that follow them.
///
/// Adds rule errors (bad target path, unparsable expression) and warns on
/// date fields fed from non-temporal columns without a normalization rule.
pub fn validate_mapping(mappings: &[FieldMapping], rules: &[TransformationRule]) -> ValidationReport {
    let mut report = validate_field_mappings(mappings);
    let mut normalized: HashSet<&str> = HashSet::new();

    for rule in rules {
        if !is_valid_path(&rule.target) {
            report
                .errors
                .push(format!("rule '{}': invalid target path", rule.target));
            continue;
        }
        match RuleExpr::parse(&rule.rule) {
            Ok(expr) => {
                if matches!(expr, RuleExpr::Call { func: Func::DateNormalize, .. }) {
                    normalized.insert(rule.target.as_str());
                }
            }
            Err(e) => report
                .errors
                .push(format!("rule '{}': {}", rule.target, e)),
        }
    }

    for m in mappings.iter().filter(|m| m.target_type == FieldType::Date) {
        let temporal = m
            .column_type()
            .is_some_and(|c| c.class() == TypeClass::Temporal);
        if !temporal && !normalized.contains(m.target_field.as_str()) {
            report.warnings.push(ValidationWarning::new(
                &m.target_field,
                "date field has no date_normalize rule",
            ));
        }
    }

    report.valid = report.errors.is_empty();
    report
}
