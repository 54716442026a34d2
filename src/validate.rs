//! Name validation and string normalization
//!
//! Every collection, view, field, and index name interpolated into a
//! query template passes through these validators first; all value
//! bindings are parameterized at the storage layer. A name that fails
//! validation never reaches the database.

use thiserror::Error;

/// Maximum length for collection and view names.
const MAX_COLLECTION_NAME: usize = 256;
/// Maximum length for a (possibly dotted) field name.
const MAX_FIELD_NAME: usize = 128;

/// Query keywords that may not be used as field-name segments.
const RESERVED_KEYWORDS: &[&str] = &[
    "for", "return", "filter", "sort", "limit", "let", "collect", "insert", "update", "replace",
    "remove", "upsert", "with", "into", "in", "outbound", "inbound", "any", "graph",
];

/// Errors raised when a name or value fails validation.
///
/// Each variant names the offending input and the rule violated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid collection name {name:?}: {rule}")]
    CollectionName { name: String, rule: &'static str },

    #[error("invalid field name {name:?}: {rule}")]
    FieldName { name: String, rule: &'static str },

    #[error("invalid index name {name:?}: {rule}")]
    IndexName { name: String, rule: &'static str },

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Validate a collection name: 1–256 characters of letters, digits,
/// underscore, or dash.
pub fn validate_collection_name(name: &str) -> Result<(), ValidationError> {
    let fail = |rule| {
        Err(ValidationError::CollectionName {
            name: name.to_string(),
            rule,
        })
    };
    if name.is_empty() {
        return fail("must not be empty");
    }
    if name.len() > MAX_COLLECTION_NAME {
        return fail("exceeds 256 characters");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return fail("only letters, digits, underscore, and dash are allowed");
    }
    Ok(())
}

/// Validate a full-text view name. Same rules as collection names.
pub fn validate_view_name(name: &str) -> Result<(), ValidationError> {
    validate_collection_name(name)
}

/// Validate an index name: 1–256 characters of letters, digits,
/// underscore, or dash.
pub fn validate_index_name(name: &str) -> Result<(), ValidationError> {
    if let Err(ValidationError::CollectionName { name, rule }) = validate_collection_name(name) {
        return Err(ValidationError::IndexName { name, rule });
    }
    Ok(())
}

/// Validate a field name: dot-separated identifier segments, each
/// starting with a letter or underscore, 1–128 characters total, and
/// no segment equal to a reserved query keyword.
pub fn validate_field_name(name: &str) -> Result<(), ValidationError> {
    let fail = |rule| {
        Err(ValidationError::FieldName {
            name: name.to_string(),
            rule,
        })
    };
    if name.is_empty() {
        return fail("must not be empty");
    }
    if name.len() > MAX_FIELD_NAME {
        return fail("exceeds 128 characters");
    }
    for segment in name.split('.') {
        let mut chars = segment.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
            _ => return fail("each segment must start with a letter or underscore"),
        }
        if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return fail("segments may contain only letters, digits, and underscore");
        }
        if RESERVED_KEYWORDS.contains(&segment.to_ascii_lowercase().as_str()) {
            return fail("segment is a reserved query keyword");
        }
    }
    Ok(())
}

/// Collapse runs of whitespace to single spaces and trim the ends.
/// Idempotent.
pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalize a value for comparison: lower-case, drop everything that is
/// not alphanumeric or whitespace, collapse whitespace. Idempotent.
pub fn normalize_for_comparison(s: &str) -> String {
    let kept: String = s
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect();
    collapse_whitespace(&kept)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_collection_names() {
        assert!(validate_collection_name("customers").is_ok());
        assert!(validate_collection_name("similar-to_2").is_ok());
    }

    #[test]
    fn rejects_metacharacters_in_collection_names() {
        // Injection attempts must fail before any query assembly.
        for bad in [
            "",
            "customers; DROP",
            "c`ollection",
            "a b",
            "x'y",
            "q\"r",
            "FOR d IN x",
        ] {
            assert!(
                validate_collection_name(bad).is_err(),
                "{bad:?} should be rejected"
            );
        }
        let long = "a".repeat(257);
        assert!(validate_collection_name(&long).is_err());
    }

    #[test]
    fn field_names_allow_dotted_paths() {
        assert!(validate_field_name("name").is_ok());
        assert!(validate_field_name("address.city").is_ok());
        assert!(validate_field_name("_internal.flag").is_ok());
    }

    #[test]
    fn field_names_reject_bad_segments() {
        for bad in ["", "1name", "a..b", "a.b-c", "name; --", "a.RETURN"] {
            assert!(validate_field_name(bad).is_err(), "{bad:?} should be rejected");
        }
        let long = format!("a.{}", "b".repeat(128));
        assert!(validate_field_name(&long).is_err());
    }

    #[test]
    fn reserved_keywords_rejected_case_insensitively() {
        assert!(validate_field_name("filter").is_err());
        assert!(validate_field_name("Filter").is_err());
        assert!(validate_field_name("filtered").is_ok());
    }

    #[test]
    fn normalization_is_idempotent() {
        let once = normalize_for_comparison("  Acme,   Corp.  (HQ) ");
        let twice = normalize_for_comparison(&once);
        assert_eq!(once, "acme corp hq");
        assert_eq!(once, twice);

        let ws_once = collapse_whitespace(" a \t b \n c ");
        assert_eq!(ws_once, "a b c");
        assert_eq!(collapse_whitespace(&ws_once), ws_once);
    }
}
