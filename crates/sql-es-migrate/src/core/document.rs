//! Target documents and dotted field paths.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One target document ready for a bulk write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Identity key. Writes with an id replace any existing document with that id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Document body (always a JSON object).
    pub body: Map<String, Value>,
}

impl Document {
    pub fn new(id: Option<String>, body: Map<String, Value>) -> Self {
        Self { id, body }
    }

    /// Body as a JSON value.
    pub fn to_value(&self) -> Value {
        Value::Object(self.body.clone())
    }
}

/// A dotted path is valid when every segment is non-empty and free of whitespace.
pub fn is_valid_path(path: &str) -> bool {
    !path.is_empty()
        && path
            .split('.')
            .all(|seg| !seg.is_empty() && !seg.chars().any(char::is_whitespace))
}

/// Read the value at `path`.
pub fn get_path<'a>(root: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = root.get(first)?;
    for seg in segments {
        current = current.as_object()?.get(seg)?;
    }
    Some(current)
}

/// Write `value` at `path`, creating intermediate objects as needed.
///
/// Fails when an intermediate segment already holds a non-object value.
pub fn set_path(root: &mut Map<String, Value>, path: &str, value: Value) -> Result<(), String> {
    let segments: Vec<&str> = path.split('.').collect();
    let (leaf, parents) = match segments.split_last() {
        Some(split) => split,
        None => return Err("empty path".to_string()),
    };

    let mut current = root;
    for seg in parents {
        let entry = current
            .entry(seg.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        current = match entry {
            Value::Object(map) => map,
            other => {
                return Err(format!(
                    "cannot set '{}': '{}' already holds a {} value",
                    path,
                    seg,
                    json_kind(other)
                ))
            }
        };
    }
    current.insert(leaf.to_string(), value);
    Ok(())
}

/// Remove the value at `path`, pruning parent objects left empty.
pub fn remove_path(root: &mut Map<String, Value>, path: &str) -> Option<Value> {
    match path.split_once('.') {
        None => root.remove(path),
        Some((head, rest)) => {
            let child = root.get_mut(head)?.as_object_mut()?;
            let removed = remove_path(child, rest);
            if child.is_empty() {
                root.remove(head);
            }
            removed
        }
    }
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_path_creates_nested_objects() {
        let mut doc = Map::new();
        set_path(&mut doc, "customer.address.city", json!("Oslo")).unwrap();
        set_path(&mut doc, "customer.name", json!("Kari")).unwrap();
        assert_eq!(
            Value::Object(doc),
            json!({"customer": {"address": {"city": "Oslo"}, "name": "Kari"}})
        );
    }

    #[test]
    fn test_set_path_rejects_scalar_parent() {
        let mut doc = Map::new();
        set_path(&mut doc, "status", json!("open")).unwrap();
        let err = set_path(&mut doc, "status.code", json!(1)).unwrap_err();
        assert!(err.contains("string"));
    }

    #[test]
    fn test_remove_path_prunes_empty_parents() {
        let mut doc = Map::new();
        set_path(&mut doc, "a.b.c", json!(1)).unwrap();
        set_path(&mut doc, "x", json!(2)).unwrap();
        assert_eq!(remove_path(&mut doc, "a.b.c"), Some(json!(1)));
        assert_eq!(Value::Object(doc), json!({"x": 2}));
    }

    #[test]
    fn test_get_path() {
        let mut doc = Map::new();
        set_path(&mut doc, "a.b", json!(true)).unwrap();
        assert_eq!(get_path(&doc, "a.b"), Some(&json!(true)));
        assert_eq!(get_path(&doc, "a.c"), None);
        assert_eq!(get_path(&doc, "a.b.c"), None);
    }

    #[test]
    fn test_path_validity() {
        assert!(is_valid_path("customer.name"));
        assert!(!is_valid_path("customer..name"));
        assert!(!is_valid_path("customer name"));
        assert!(!is_valid_path(""));
    }
}
