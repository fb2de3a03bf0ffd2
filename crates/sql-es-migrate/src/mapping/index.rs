//! Target index mapping generation.

use serde_json::{json, Map, Value};

use super::{FieldMapping, MappingConfiguration};
use crate::typemap::FieldType;

const DATE_FORMAT: &str = "strict_date_optional_time||yyyy-MM-dd HH:mm:ss||yyyy-MM-dd||epoch_millis";
const DEFAULT_SCALING_FACTOR: f64 = 100.0;

/// Build the index creation body (`{"mappings": {"properties": ...}}`).
pub fn index_mapping(config: &MappingConfiguration) -> Value {
    let mut properties = Map::new();
    add_fields(&mut properties, &config.field_mappings);

    if let Some(grouping) = &config.grouping {
        for nested in &grouping.nested {
            let mut inner = Map::new();
            add_fields(&mut inner, &nested.field_mappings);
            insert_property(
                &mut properties,
                &nested.target_field,
                json!({"type": "nested", "properties": Value::Object(inner)}),
            );
        }
    }

    json!({ "mappings": { "properties": Value::Object(properties) } })
}

fn add_fields(properties: &mut Map<String, Value>, mappings: &[FieldMapping]) {
    for m in mappings {
        insert_property(properties, &m.target_field, field_property(m));
    }
}

fn field_property(m: &FieldMapping) -> Value {
    match m.target_type {
        FieldType::Date => json!({"type": "date", "format": DATE_FORMAT}),
        FieldType::Text => json!({
            "type": "text",
            "analyzer": "standard",
            "fields": {"keyword": {"type": "keyword", "ignore_above": 256}}
        }),
        FieldType::ScaledFloat => {
            let factor = m
                .column_type()
                .and_then(|c| c.scaling_factor())
                .unwrap_or(DEFAULT_SCALING_FACTOR);
            json!({"type": "scaled_float", "scaling_factor": factor})
        }
        other => json!({"type": other.as_str()}),
    }
}

/// Insert at a dotted path, creating intermediate `object` properties.
fn insert_property(properties: &mut Map<String, Value>, path: &str, property: Value) {
    match path.split_once('.') {
        None => {
            properties.insert(path.to_string(), property);
        }
        Some((head, rest)) => {
            let parent = properties
                .entry(head.to_string())
                .or_insert_with(|| json!({"properties": {}}));
            if let Some(obj) = parent.as_object_mut() {
                let inner = obj
                    .entry("properties".to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
                if let Some(inner) = inner.as_object_mut() {
                    insert_property(inner, rest, property);
                }
            }
        }
    }
}
