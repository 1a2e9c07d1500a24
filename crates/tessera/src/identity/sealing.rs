//! Field-level sealing of identity documents.
//!
//! Sensitive fields are named by dotted path (`identifiers.device_id`). A
//! sealed field is replaced in place by its encoded [`SealedEnvelope`] with
//! associated data `<sandbox_key>/<path>`, which pins the ciphertext to one
//! sandbox and one field.

use serde_json::Value;

use crate::crypto::{CryptoError, KeyHandle, SealedEnvelope, Sealer};

use super::IdentityError;

fn aad_for(sandbox_key: &str, path: &str) -> Vec<u8> {
    format!("{sandbox_key}/{path}").into_bytes()
}

fn lookup_mut<'a>(body: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    path.split('.').try_fold(body, |node, segment| node.get_mut(segment))
}

/// Seal every string field named in `paths`. Unknown paths are skipped.
pub(crate) fn seal_paths(
    body: &mut Value,
    paths: &[String],
    sandbox_key: &str,
    key: &KeyHandle,
    sealer: &dyn Sealer,
) -> Result<usize, IdentityError> {
    let mut sealed = 0;
    for path in paths {
        let Some(slot) = lookup_mut(body, path) else {
            continue;
        };
        let Some(plain) = slot.as_str() else {
            continue;
        };
        if SealedEnvelope::is_sealed(plain) {
            continue;
        }
        let envelope = sealer.seal(plain.as_bytes(), key, Some(&aad_for(sandbox_key, path)))?;
        *slot = Value::String(envelope.encode());
        sealed += 1;
    }
    Ok(sealed)
}

/// Whether any string leaf in `body` is a sealed envelope.
pub(crate) fn has_sealed(body: &Value) -> bool {
    match body {
        Value::String(s) => SealedEnvelope::is_sealed(s),
        Value::Object(map) => map.values().any(has_sealed),
        Value::Array(items) => items.iter().any(has_sealed),
        _ => false,
    }
}

/// Open every sealed leaf in place.
pub(crate) fn open_all(
    body: &mut Value,
    sandbox_key: &str,
    key: &KeyHandle,
    sealer: &dyn Sealer,
) -> Result<(), IdentityError> {
    open_at(body, String::new(), sandbox_key, key, sealer)
}

fn open_at(
    node: &mut Value,
    path: String,
    sandbox_key: &str,
    key: &KeyHandle,
    sealer: &dyn Sealer,
) -> Result<(), IdentityError> {
    match node {
        Value::Object(map) => {
            for (name, child) in map.iter_mut() {
                let child_path = if path.is_empty() {
                    name.clone()
                } else {
                    format!("{path}.{name}")
                };
                open_at(child, child_path, sandbox_key, key, sealer)?;
            }
            Ok(())
        }
        Value::String(text) => {
            let Ok(envelope) = SealedEnvelope::decode(text) else {
                return Ok(());
            };
            if envelope.aad.as_deref() != Some(aad_for(sandbox_key, &path).as_slice()) {
                return Err(CryptoError::Open.into());
            }
            let plain = sealer.open(&envelope, key)?;
            let plain = String::from_utf8(plain)
                .map_err(|_| IdentityError::Invalid(format!("sealed field {path} is not utf-8")))?;
            *node = Value::String(plain);
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{AesGcmSealer, KEY_LEN};
    use serde_json::json;

    fn key() -> KeyHandle {
        KeyHandle::new("sandbox.t", [3; KEY_LEN])
    }

    #[test]
    fn test_seal_and_open_named_paths() {
        let original = json!({
            "identifiers": {"device_id": "ABCDEF0123456789", "serial_number": "X1"},
            "hardware": {"model": "Pixel 7"}
        });
        let mut body = original.clone();
        let paths = vec![
            "identifiers.device_id".to_string(),
            "identifiers.missing".to_string(),
        ];
        let count = seal_paths(&mut body, &paths, "sb", &key(), &AesGcmSealer).unwrap();
        assert_eq!(count, 1);
        assert!(has_sealed(&body));
        assert_ne!(body["identifiers"]["device_id"], original["identifiers"]["device_id"]);
        assert_eq!(body["identifiers"]["serial_number"], "X1");

        // Sealing twice does not double-wrap.
        assert_eq!(seal_paths(&mut body, &paths, "sb", &key(), &AesGcmSealer).unwrap(), 0);

        open_all(&mut body, "sb", &key(), &AesGcmSealer).unwrap();
        assert_eq!(body, original);
        assert!(!has_sealed(&body));
    }

    #[test]
    fn test_ciphertext_bound_to_sandbox() {
        let mut body = json!({"identifiers": {"device_id": "ABCDEF0123456789"}});
        let paths = vec!["identifiers.device_id".to_string()];
        seal_paths(&mut body, &paths, "sb-one", &key(), &AesGcmSealer).unwrap();
        let err = open_all(&mut body, "sb-two", &key(), &AesGcmSealer).unwrap_err();
        assert!(matches!(err, IdentityError::Crypto(CryptoError::Open)));
    }
}
