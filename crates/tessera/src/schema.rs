//! Versioned envelope for every persisted typed document.
//!
//! Policies, limits, identities, manifests and redirection tables are all
//! written as:
//!
//! ```json
//! { "schema": 1, "kind": "policy", "body": { ... } }
//! ```
//!
//! Readers reject unknown schema versions and mismatched kinds, then run the
//! document's own validation before handing it out.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Current schema version written by this crate.
pub const SCHEMA_VERSION: u32 = 1;

/// Errors raised while reading or writing a versioned document.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("malformed document: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unsupported schema version {found} (supported: {SCHEMA_VERSION})")]
    UnsupportedVersion { found: u32 },

    #[error("document kind mismatch: expected {expected}, found {found}")]
    KindMismatch { expected: &'static str, found: String },

    #[error("invalid {kind} document: {reason}")]
    Invalid { kind: &'static str, reason: String },
}

/// A strongly-typed document persisted through the versioned envelope.
pub trait Document: Serialize + DeserializeOwned {
    /// Stable kind tag stored next to the body.
    const KIND: &'static str;

    /// Semantic validation run on every encode and decode.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    schema: u32,
    kind: String,
    body: Value,
}

/// Serialize a document into its envelope.
pub fn encode<T: Document>(doc: &T) -> Result<String, SchemaError> {
    check(doc)?;
    wrap_value(T::KIND, serde_json::to_value(doc)?)
}

/// Parse and validate a document from its envelope.
pub fn decode<T: Document>(text: &str) -> Result<T, SchemaError> {
    let body = unwrap_value(T::KIND, text)?;
    let doc: T = serde_json::from_value(body)?;
    check(&doc)?;
    Ok(doc)
}

/// Wrap an already-serialized body. Used when the body is post-processed
/// (for example with sealed fields) before it is written.
pub fn wrap_value(kind: &'static str, body: Value) -> Result<String, SchemaError> {
    let envelope = Envelope {
        schema: SCHEMA_VERSION,
        kind: kind.to_string(),
        body,
    };
    Ok(serde_json::to_string_pretty(&envelope)?)
}

/// Check version and kind and return the raw body.
pub fn unwrap_value(kind: &'static str, text: &str) -> Result<Value, SchemaError> {
    let envelope: Envelope = serde_json::from_str(text)?;
    if envelope.schema != SCHEMA_VERSION {
        return Err(SchemaError::UnsupportedVersion {
            found: envelope.schema,
        });
    }
    if envelope.kind != kind {
        return Err(SchemaError::KindMismatch {
            expected: kind,
            found: envelope.kind,
        });
    }
    Ok(envelope.body)
}

/// Run a document's validation, tagging failures with its kind.
pub fn check<T: Document>(doc: &T) -> Result<(), SchemaError> {
    doc.validate().map_err(|reason| SchemaError::Invalid {
        kind: T::KIND,
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        size: u64,
    }

    impl Document for Sample {
        const KIND: &'static str = "sample";

        fn validate(&self) -> Result<(), String> {
            if self.name.is_empty() {
                return Err("name must not be empty".to_string());
            }
            Ok(())
        }
    }

    #[test]
    fn test_envelope_carries_version_and_kind() {
        let text = encode(&Sample {
            name: "a".into(),
            size: 3,
        })
        .unwrap();
        let raw: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(raw["schema"], 1);
        assert_eq!(raw["kind"], "sample");
        assert_eq!(raw["body"]["size"], 3);
    }

    #[test]
    fn test_rejects_unsupported_version() {
        let text = r#"{"schema": 7, "kind": "sample", "body": {"name": "a", "size": 1}}"#;
        let err = decode::<Sample>(text).unwrap_err();
        assert!(matches!(err, SchemaError::UnsupportedVersion { found: 7 }));
    }

    #[test]
    fn test_rejects_wrong_kind() {
        let text = r#"{"schema": 1, "kind": "policy", "body": {"name": "a", "size": 1}}"#;
        let err = decode::<Sample>(text).unwrap_err();
        assert!(matches!(err, SchemaError::KindMismatch { .. }));
    }

    #[test]
    fn test_validation_runs_on_read() {
        let text = r#"{"schema": 1, "kind": "sample", "body": {"name": "", "size": 1}}"#;
        let err = decode::<Sample>(text).unwrap_err();
        assert!(err.to_string().contains("name must not be empty"));
    }

    #[test]
    fn test_validation_runs_on_write() {
        let err = encode(&Sample {
            name: String::new(),
            size: 0,
        })
        .unwrap_err();
        assert!(matches!(err, SchemaError::Invalid { kind: "sample", .. }));
    }
}
