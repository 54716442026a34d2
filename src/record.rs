//! Record representation shared across the engine
//!
//! A record is an identified document with an arbitrary JSON payload.
//! The engine never interprets payloads beyond the field paths named in
//! its configuration, so any document shape round-trips unchanged.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The field map of a record document.
pub type Fields = Map<String, Value>;

/// An identified document in a named collection.
///
/// Field access supports dotted paths (`address.city`) into nested
/// objects. Mutation happens only through the embedding and golden-record
/// services; ingestion is external.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Stable identifier, unique within the record's collection.
    pub id: String,
    /// Document payload.
    pub fields: Fields,
}

impl Record {
    /// Create a record from an id and a field map.
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Create a record from an id and a JSON object value.
    ///
    /// Non-object values produce an empty field map.
    pub fn from_value(id: impl Into<String>, value: Value) -> Self {
        let fields = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self::new(id, fields)
    }

    /// Resolve a dotted field path into the payload.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut current: &Value = self.fields.get(path.split('.').next()?)?;
        for segment in path.split('.').skip(1) {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// Resolve a dotted field path to a string slice, if the value is a string.
    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }

    /// Resolve a dotted field path to comparable text.
    ///
    /// Strings pass through; numbers and booleans are rendered; null,
    /// arrays, and objects yield `None`.
    pub fn text(&self, path: &str) -> Option<String> {
        match self.get(path)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Set a top-level field, replacing any existing value.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.fields.insert(name.into(), value);
    }

    /// Reduce the payload to the given dotted paths (plus nothing else).
    ///
    /// Used by batch fetches that only need the fields being scored.
    pub fn project(&self, paths: &[String]) -> Record {
        let mut fields = Map::new();
        for path in paths {
            if let Some(value) = self.get(path) {
                insert_path(&mut fields, path, value.clone());
            }
        }
        Record {
            id: self.id.clone(),
            fields,
        }
    }
}

/// Insert a value at a dotted path, creating intermediate objects.
///
/// Overlapping dotted paths are legal (`address` and `address.street`
/// may both be configured), so a scalar sitting where an intermediate
/// object is needed is replaced rather than treated as an error.
fn insert_path(target: &mut Fields, path: &str, value: Value) {
    let mut segments = path.split('.').peekable();
    let mut current = target;
    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            current.insert(segment.to_string(), value);
            return;
        }
        let slot = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        current = slot.as_object_mut().expect("slot was just made an object");
    }
}

/// Whether a field name is reserved for engine or store internals.
///
/// System fields (`_id`, `_key`, `_rev`, audit fields) and attached
/// embedding fields are excluded from golden-record synthesis and
/// from serializer output.
pub fn is_system_field(name: &str) -> bool {
    name.starts_with('_') || name == "embedding" || name.starts_with("embedding_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> Record {
        Record::from_value(
            "r1",
            json!({
                "name": "John Smith",
                "age": 42,
                "address": { "city": "Oakland", "state": "CA" }
            }),
        )
    }

    #[test]
    fn dotted_paths_resolve_into_nested_objects() {
        let r = record();
        assert_eq!(r.get_str("name"), Some("John Smith"));
        assert_eq!(r.get_str("address.city"), Some("Oakland"));
        assert_eq!(r.get("address.zip"), None);
        assert_eq!(r.get("missing"), None);
    }

    #[test]
    fn text_renders_scalars_only() {
        let r = record();
        assert_eq!(r.text("age").as_deref(), Some("42"));
        assert_eq!(r.text("address"), None);
    }

    #[test]
    fn projection_keeps_nested_structure() {
        let r = record();
        let p = r.project(&["name".to_string(), "address.state".to_string()]);
        assert_eq!(p.get_str("name"), Some("John Smith"));
        assert_eq!(p.get_str("address.state"), Some("CA"));
        assert_eq!(p.get("address.city"), None);
        assert_eq!(p.get("age"), None);
    }

    #[test]
    fn projection_tolerates_overlapping_paths() {
        let r = record();
        // A field and one of its own sub-paths may both be requested.
        let p = r.project(&["address".to_string(), "address.city".to_string()]);
        assert_eq!(p.get_str("address.city"), Some("Oakland"));

        // Shorter path last: the object value wins the slot.
        let p = r.project(&["address.city".to_string(), "address".to_string()]);
        assert_eq!(p.get_str("address.city"), Some("Oakland"));
        assert_eq!(p.get_str("address.state"), Some("CA"));
    }

    #[test]
    fn system_fields_are_recognized() {
        assert!(is_system_field("_key"));
        assert!(is_system_field("embedding"));
        assert!(is_system_field("embedding_meta"));
        assert!(!is_system_field("email"));
    }
}
