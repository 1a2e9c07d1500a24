//! Sealing of sensitive fields at rest.
//!
//! Two seams are consumed here: a [`KeyProvider`] that hands out symmetric
//! key material by alias, and a [`Sealer`] that performs authenticated
//! encryption. The persisted form is a [`SealedEnvelope`], a self-describing
//! versioned tuple so readers can reject malformed or unknown versions.

mod aes;
mod envelope;
mod keys;

pub use aes::AesGcmSealer;
pub use envelope::{ENVELOPE_VERSION, SealedEnvelope};
pub use keys::{FileKeyProvider, MemoryKeyProvider};

use async_trait::async_trait;
use thiserror::Error;

/// Length in bytes of every key handed out by a provider.
pub const KEY_LEN: usize = 32;

/// Errors raised by key providers and sealers.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Envelope text could not be parsed.
    #[error("malformed sealed envelope: {0}")]
    Malformed(String),

    /// Envelope carries a version tag this build cannot read.
    #[error("unsupported sealed envelope version: {0}")]
    UnsupportedVersion(String),

    /// Encryption failed.
    #[error("sealing failed")]
    Seal,

    /// Authentication or decryption failed.
    #[error("opening sealed value failed (wrong key or tampered data)")]
    Open,

    /// Key alias is unusable.
    #[error("invalid key alias: {0}")]
    InvalidAlias(String),

    /// Key material on disk is unreadable.
    #[error("corrupt key material for alias {0}")]
    CorruptKey(String),

    #[error("key store io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Opaque symmetric key material.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyHandle {
    alias: String,
    bytes: [u8; KEY_LEN],
}

impl KeyHandle {
    pub fn new(alias: impl Into<String>, bytes: [u8; KEY_LEN]) -> Self {
        Self {
            alias: alias.into(),
            bytes,
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub(crate) fn bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl std::fmt::Debug for KeyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyHandle")
            .field("alias", &self.alias)
            .field("bytes", &"<redacted>")
            .finish()
    }
}

/// Source of per-alias key material.
#[async_trait]
pub trait KeyProvider: Send + Sync {
    /// Return the key for `alias`, creating it on first use.
    async fn get_or_create_key(&self, alias: &str) -> Result<KeyHandle, CryptoError>;

    /// Forget the key for `alias`. Deleting a missing key is not an error.
    async fn delete_key(&self, alias: &str) -> Result<(), CryptoError>;

    /// Whether a key exists for `alias`.
    async fn has_key(&self, alias: &str) -> Result<bool, CryptoError>;
}

/// Authenticated encryption service.
pub trait Sealer: Send + Sync {
    fn seal(
        &self,
        plaintext: &[u8],
        key: &KeyHandle,
        aad: Option<&[u8]>,
    ) -> Result<SealedEnvelope, CryptoError>;

    fn open(&self, sealed: &SealedEnvelope, key: &KeyHandle) -> Result<Vec<u8>, CryptoError>;
}

/// Key alias used for a sandbox's sealed identity fields.
pub fn sandbox_key_alias(sandbox_key: &str) -> String {
    format!("sandbox.{sandbox_key}")
}

/// Aliases are used as file names, so keep them to a safe alphabet.
pub(crate) fn validate_alias(alias: &str) -> Result<(), CryptoError> {
    let ok = !alias.is_empty()
        && alias.len() <= 128
        && !alias.starts_with('.')
        && alias
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if ok {
        Ok(())
    } else {
        Err(CryptoError::InvalidAlias(alias.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alias_validation() {
        assert!(validate_alias("sandbox.app-1_x").is_ok());
        assert!(validate_alias("").is_err());
        assert!(validate_alias("../escape").is_err());
        assert!(validate_alias(".hidden").is_err());
        assert!(validate_alias("a/b").is_err());
    }

    #[test]
    fn test_key_handle_debug_redacts_material() {
        let handle = KeyHandle::new("k", [7u8; KEY_LEN]);
        let rendered = format!("{handle:?}");
        assert!(rendered.contains("redacted"));
        assert!(!rendered.contains('7'));
    }
}
