//! Tuple serializer: deterministic record → text for embedding
//!
//! The embedding encoder sees one line of text per record. The same
//! record always serializes to the same bytes, so re-embedding an
//! unchanged record yields the same vector (and the same content hash).

use crate::record::{is_system_field, Record};
use serde_json::Value;
use std::collections::BTreeMap;

/// What to emit for a configured field the record does not carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingField {
    /// Leave the field out of the output entirely.
    #[default]
    Skip,
    /// Substitute the empty string, keeping separator positions stable.
    Empty,
}

/// Serializes records into the text an embedding model encodes.
///
/// Field weights are recorded as metadata only; they do not alter the
/// serialized string. Dotted paths resolve into nested objects.
#[derive(Debug, Clone)]
pub struct TupleSerializer {
    /// Ordered field list; `None` means all non-system top-level fields
    /// in alphabetical order.
    fields: Option<Vec<String>>,
    separator: String,
    missing: MissingField,
    /// Recorded for provenance; never applied to the output string.
    field_weights: BTreeMap<String, f64>,
}

impl Default for TupleSerializer {
    fn default() -> Self {
        Self {
            fields: None,
            separator: " ".to_string(),
            missing: MissingField::default(),
            field_weights: BTreeMap::new(),
        }
    }
}

impl TupleSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an explicit ordered field list instead of the alphabetical default.
    pub fn with_fields(mut self, fields: Vec<String>) -> Self {
        self.fields = Some(fields);
        self
    }

    /// Set the separator placed between field values.
    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }

    /// Set the missing-field policy.
    pub fn with_missing(mut self, missing: MissingField) -> Self {
        self.missing = missing;
        self
    }

    /// Record field weights as serializer metadata.
    pub fn with_field_weights(mut self, weights: BTreeMap<String, f64>) -> Self {
        self.field_weights = weights;
        self
    }

    /// The recorded field weights (metadata only).
    pub fn field_weights(&self) -> &BTreeMap<String, f64> {
        &self.field_weights
    }

    /// Serialize a record to embedding text.
    pub fn serialize(&self, record: &Record) -> String {
        let fields: Vec<String> = match &self.fields {
            Some(fields) => fields.clone(),
            None => {
                // Alphabetical over the record's own non-system fields.
                let mut names: Vec<String> = record
                    .fields
                    .keys()
                    .filter(|k| !is_system_field(k))
                    .cloned()
                    .collect();
                names.sort();
                names
            }
        };

        let mut parts: Vec<String> = Vec::with_capacity(fields.len());
        for field in &fields {
            match record.get(field).and_then(value_text) {
                Some(text) => parts.push(text),
                None => {
                    if self.missing == MissingField::Empty {
                        parts.push(String::new());
                    }
                }
            }
        }
        parts.join(&self.separator)
    }
}

/// Render a JSON value as embedding text.
///
/// Scalars render plainly; arrays of scalars join with spaces; objects
/// and nulls are omitted.
fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(value_text).collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join(" "))
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> Record {
        Record::from_value(
            "r1",
            json!({
                "name": "Acme Corp",
                "city": "Austin",
                "address": { "street": "1 Main St", "zip": "78701" },
                "tags": ["hw", "vendor"],
                "_rev": "x",
                "embedding": [0.1, 0.2]
            }),
        )
    }

    #[test]
    fn default_order_is_alphabetical_and_skips_system_fields() {
        let serializer = TupleSerializer::new();
        // address (object) contributes nothing; alphabetical: address, city, name, tags
        assert_eq!(serializer.serialize(&record()), "Austin Acme Corp hw vendor");
    }

    #[test]
    fn explicit_field_order_and_dotted_paths() {
        let serializer = TupleSerializer::new()
            .with_fields(vec![
                "name".to_string(),
                "address.street".to_string(),
                "address.zip".to_string(),
            ])
            .with_separator(" | ");
        assert_eq!(
            serializer.serialize(&record()),
            "Acme Corp | 1 Main St | 78701"
        );
    }

    #[test]
    fn missing_field_policy() {
        let fields = vec!["name".to_string(), "phone".to_string(), "city".to_string()];
        let skip = TupleSerializer::new().with_fields(fields.clone());
        assert_eq!(skip.serialize(&record()), "Acme Corp Austin");

        let empty = TupleSerializer::new()
            .with_fields(fields)
            .with_missing(MissingField::Empty)
            .with_separator("|");
        assert_eq!(empty.serialize(&record()), "Acme Corp||Austin");
    }

    // === Serializer determinism: same record, identical bytes ===

    #[test]
    fn serialization_is_deterministic() {
        let serializer = TupleSerializer::new();
        let r = record();
        let first = serializer.serialize(&r);
        for _ in 0..20 {
            assert_eq!(serializer.serialize(&r), first);
        }
    }

    #[test]
    fn weights_are_metadata_only() {
        let plain = TupleSerializer::new();
        let weighted = TupleSerializer::new().with_field_weights(
            [("name".to_string(), 5.0), ("unused".to_string(), 2.0)]
                .into_iter()
                .collect(),
        );
        assert_eq!(plain.serialize(&record()), weighted.serialize(&record()));
    }
}
