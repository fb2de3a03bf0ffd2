//! Auto-mapping suggester.
//!
//! Pairs source columns with existing target fields by normalized name, and
//! proposes new target fields from the type mapper when nothing matches.
//! Pure and deterministic: identical inputs give byte-identical output.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strsim::normalized_levenshtein;

use crate::mapping::{
    index_mapping, FieldMapping, MappingConfiguration, MappingType, TransformationRule,
};
use crate::source::SourceField;
use crate::target::TargetField;
use crate::typemap::{
    is_compatible, name_tokens, ColumnType, FieldType, TypeCandidate, TypeClass, TypeMapper,
};

/// Name similarity below this is not a match.
const MIN_NAME_SCORE: u8 = 80;
const EXACT_NAME_SCORE: u8 = 100;
const CONTAINMENT_SCORE: u8 = 75;

/// Proposed field mappings and rules for a query/index pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingSuggestion {
    pub field_mappings: Vec<FieldMapping>,
    pub transformation_rules: Vec<TransformationRule>,
    /// Index mapping the proposed fields would create.
    pub index_mapping: Value,
    /// Type mapper notes keyed by target field.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<(String, String)>,
}

impl MappingSuggestion {
    /// Merge into a configuration through the one `set_field_mapping` path,
    /// so existing manual mappings are kept. Rules are added for targets that
    /// have none yet. Returns the number of field mappings applied.
    pub fn apply_to(&self, config: &mut MappingConfiguration) -> usize {
        let applied = self
            .field_mappings
            .iter()
            .filter(|m| config.set_field_mapping((*m).clone()))
            .count();
        for rule in &self.transformation_rules {
            if !config
                .transformation_rules
                .iter()
                .any(|r| r.target == rule.target)
            {
                config.transformation_rules.push(rule.clone());
            }
        }
        applied
    }
}

/// Auto-mapping suggester.
#[derive(Debug, Clone, Default)]
pub struct Suggester {
    type_mapper: TypeMapper,
}

impl Suggester {
    pub fn new(type_mapper: TypeMapper) -> Self {
        Self { type_mapper }
    }

    /// Propose a mapping set. `target` is empty for a fresh index.
    pub fn suggest(&self, source: &[SourceField], target: &[TargetField]) -> MappingSuggestion {
        let mut used = vec![false; target.len()];
        let mut taken: Vec<String> = target.iter().map(|t| t.name.clone()).collect();
        let mut field_mappings = Vec::with_capacity(source.len());
        let mut rules = Vec::new();
        let mut notes = Vec::new();

        for field in source {
            let column = ColumnType::parse(&field.declared_type);
            let candidates = self.type_mapper.map(&column, Some(&field.name));
            let top = candidates
                .first()
                .cloned()
                .unwrap_or_else(|| TypeCandidate::new(FieldType::Text, 10));

            let mapping = match best_target(&field.name, target, &used) {
                Some((idx, name_score)) => {
                    used[idx] = true;
                    let existing = &target[idx];
                    let target_type = existing
                        .field_type
                        .parse::<FieldType>()
                        .unwrap_or(top.field_type);
                    let type_score = type_score(&column, &candidates, target_type);
                    suggested(field, &existing.name, target_type, blend(name_score, type_score))
                }
                None => {
                    let name = unique_name(&snake_case(&field.name), &taken);
                    taken.push(name.clone());
                    suggested(field, &name, top.field_type, top.confidence)
                }
            };

            if let Some(note) = &top.note {
                notes.push((mapping.target_field.clone(), note.clone()));
            }
            rules.extend(default_rules(&column, &mapping));
            field_mappings.push(mapping);
        }

        let mut scratch = MappingConfiguration::new("suggestion", "", "", "", "");
        scratch.field_mappings = field_mappings.clone();
        MappingSuggestion {
            field_mappings,
            transformation_rules: rules,
            index_mapping: index_mapping(&scratch),
            notes,
        }
    }
}

fn suggested(field: &SourceField, target: &str, target_type: FieldType, confidence: u8) -> FieldMapping {
    FieldMapping {
        confidence,
        mapping_type: MappingType::Auto,
        ..FieldMapping::new(&field.name, target, target_type).with_source_type(&field.declared_type)
    }
}

/// Highest-scoring unused target; first in target order on ties.
fn best_target(source_name: &str, target: &[TargetField], used: &[bool]) -> Option<(usize, u8)> {
    let normalized = normalize(source_name);
    let mut best: Option<(usize, u8)> = None;
    for (idx, t) in target.iter().enumerate() {
        if used[idx] || matches!(t.field_type.as_str(), "object" | "nested") {
            continue;
        }
        let score = name_score(&normalized, &normalize(&t.name));
        if score >= CONTAINMENT_SCORE && best.map_or(true, |(_, s)| score > s) {
            best = Some((idx, score));
        }
    }
    best
}

/// Lowercase, separators removed, camel case folded: `ORDER_ID`, `orderId`
/// and `order-id` all become `orderid`.
pub fn normalize(name: &str) -> String {
    name_tokens(name).concat()
}

fn name_score(a: &str, b: &str) -> u8 {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    if a == b {
        return EXACT_NAME_SCORE;
    }
    let similarity = (normalized_levenshtein(a, b) * 100.0).round() as u8;
    if similarity >= MIN_NAME_SCORE {
        return similarity;
    }
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    if short.len() >= 3 && long.contains(short) {
        return CONTAINMENT_SCORE;
    }
    0
}

/// How well the mapper agrees with an existing target type.
fn type_score(column: &ColumnType, candidates: &[TypeCandidate], target_type: FieldType) -> u8 {
    if let Some(c) = candidates.iter().find(|c| c.field_type == target_type) {
        return c.confidence;
    }
    if is_compatible(column, target_type) {
        60
    } else {
        20
    }
}

fn blend(name_score: u8, type_score: u8) -> u8 {
    let blended = f64::from(name_score) * 0.6 + f64::from(type_score) * 0.4;
    blended.round().clamp(0.0, 100.0) as u8
}

fn snake_case(name: &str) -> String {
    let joined = name_tokens(name).join("_");
    if joined.is_empty() {
        "field".to_string()
    } else {
        joined
    }
}

fn unique_name(base: &str, taken: &[String]) -> String {
    if !taken.iter().any(|t| t == base) {
        return base.to_string();
    }
    (2..)
        .map(|n| format!("{}_{}", base, n))
        .find(|candidate| !taken.iter().any(|t| t == candidate))
        .unwrap_or_else(|| base.to_string())
}

/// Rules for representations that need a non-identity conversion.
fn default_rules(column: &ColumnType, mapping: &FieldMapping) -> Vec<TransformationRule> {
    let target = mapping.target_field.as_str();
    let mut rules = Vec::new();
    match (column.class(), mapping.target_type) {
        (_, FieldType::Date) => rules.push(
            TransformationRule::new(target, "date_normalize")
                .with_description("normalize to RFC 3339 UTC"),
        ),
        (TypeClass::Numeric, t) if t.is_integer() => {
            if let Some(factor) = column.scaling_factor() {
                rules.push(
                    TransformationRule::new(
                        target,
                        &format!(
                            "cast(scale({}, {}), \"{}\")",
                            mapping.source_field,
                            factor,
                            t.as_str()
                        ),
                    )
                    .with_description("fixed-point decimal stored as scaled integer"),
                );
            }
        }
        (TypeClass::LargeText, t) if t.is_string() => rules.push(
            TransformationRule::new(target, "truncate")
                .with_description("large text replaced by a preview marker"),
        ),
        _ => {}
    }
    rules
}

#[cfg(test)]
mod tests {
    use super::*;

    fn src(name: &str, ty: &str) -> SourceField {
        SourceField {
            name: name.to_string(),
            declared_type: ty.to_string(),
        }
    }

    fn tgt(name: &str, ty: &str) -> TargetField {
        TargetField {
            name: name.to_string(),
            field_type: ty.to_string(),
            format: None,
        }
    }

    fn orders_source() -> Vec<SourceField> {
        vec![
            src("ORDER_ID", "NUMBER(10)"),
            src("CUSTOMER_NAME", "VARCHAR2(50)"),
            src("ORDER_DATE", "DATE"),
            src("AMOUNT", "NUMBER(10,2)"),
            src("NOTES", "CLOB"),
        ]
    }

    #[test]
    fn test_fresh_index_uses_type_mapper() {
        let s = Suggester::default().suggest(&orders_source(), &[]);
        let targets: Vec<_> = s
            .field_mappings
            .iter()
            .map(|m| (m.target_field.as_str(), m.target_type))
            .collect();
        assert_eq!(
            targets,
            vec![
                ("order_id", FieldType::Long),
                ("customer_name", FieldType::Keyword),
                ("order_date", FieldType::Date),
                ("amount", FieldType::ScaledFloat),
                ("notes", FieldType::Text),
            ]
        );
        assert!(s.field_mappings.iter().all(|m| m.mapping_type == MappingType::Auto));
        let rules: Vec<_> = s.transformation_rules.iter().map(|r| (r.target.as_str(), r.rule.as_str())).collect();
        assert_eq!(rules, vec![("order_date", "date_normalize"), ("notes", "truncate")]);
        assert_eq!(s.index_mapping["mappings"]["properties"]["order_date"]["type"], "date");
        assert!(s.notes.iter().any(|(f, n)| f == "order_date" && n.contains("UTC")));
    }

    #[test]
    fn test_pairs_with_existing_fields_by_normalized_name() {
        let target = vec![tgt("orderId", "long"), tgt("customerName", "text"), tgt("total", "long")];
        let s = Suggester::default().suggest(&orders_source(), &target);
        assert_eq!(s.field_mappings[0].target_field, "orderId");
        // Exact name (100) blended with the mapper's long confidence (95).
        assert_eq!(s.field_mappings[0].confidence, 98);
        assert_eq!(s.field_mappings[1].target_field, "customerName");
        assert_eq!(s.field_mappings[1].target_type, FieldType::Text);
        // No corroborating target: confidence comes from the type mapper alone.
        assert_eq!(s.field_mappings[3].target_field, "amount");
    }

    #[test]
    fn test_scaled_integer_target_gets_scale_rule() {
        let s = Suggester::default().suggest(&[src("AMOUNT", "NUMBER(10,2)")], &[tgt("amount", "long")]);
        assert_eq!(s.field_mappings[0].target_type, FieldType::Long);
        assert_eq!(s.transformation_rules[0].rule, "cast(scale(AMOUNT, 100), \"long\")");
    }

    #[test]
    fn test_suggestion_is_deterministic() {
        let target = vec![tgt("order_id", "long"), tgt("notes", "text")];
        let a = serde_json::to_string(&Suggester::default().suggest(&orders_source(), &target)).unwrap();
        let b = serde_json::to_string(&Suggester::default().suggest(&orders_source(), &target)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_apply_keeps_manual_mappings() {
        let mut cfg = MappingConfiguration::new("orders", "db", "SELECT 1", "es", "orders");
        cfg.set_field_mapping(FieldMapping::new("ORDER_NO", "order_id", FieldType::Keyword));
        let s = Suggester::default().suggest(&orders_source(), &[]);
        let applied = s.apply_to(&mut cfg);
        assert_eq!(applied, 4);
        assert_eq!(cfg.field_mappings[0].source_field, "ORDER_NO");
        assert_eq!(cfg.transformation_rules.len(), 2);
    }

    #[test]
    fn test_name_normalization() {
        assert_eq!(normalize("ORDER_ID"), "orderid");
        assert_eq!(normalize("orderId"), "orderid");
        assert_eq!(name_score("customername", "customer"), CONTAINMENT_SCORE);
        assert_eq!(name_score("amount", "zip"), 0);
    }
}
