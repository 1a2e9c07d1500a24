use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};

use super::envelope::IV_LEN;
use super::{CryptoError, ENVELOPE_VERSION, KeyHandle, SealedEnvelope, Sealer};

/// AES-256-GCM with a random 96-bit nonce per seal.
#[derive(Debug, Clone, Copy, Default)]
pub struct AesGcmSealer;

impl AesGcmSealer {
    pub fn new() -> Self {
        Self
    }

    fn cipher(key: &KeyHandle) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.bytes()))
    }
}

impl Sealer for AesGcmSealer {
    fn seal(
        &self,
        plaintext: &[u8],
        key: &KeyHandle,
        aad: Option<&[u8]>,
    ) -> Result<SealedEnvelope, CryptoError> {
        let iv: [u8; IV_LEN] = rand::random();
        let payload = Payload {
            msg: plaintext,
            aad: aad.unwrap_or_default(),
        };
        let ciphertext = Self::cipher(key)
            .encrypt(Nonce::from_slice(&iv), payload)
            .map_err(|_| CryptoError::Seal)?;

        Ok(SealedEnvelope {
            version: ENVELOPE_VERSION.to_string(),
            iv: iv.to_vec(),
            ciphertext,
            aad: aad.map(<[u8]>::to_vec),
        })
    }

    fn open(&self, sealed: &SealedEnvelope, key: &KeyHandle) -> Result<Vec<u8>, CryptoError> {
        if sealed.version != ENVELOPE_VERSION {
            return Err(CryptoError::UnsupportedVersion(sealed.version.clone()));
        }
        if sealed.iv.len() != IV_LEN {
            return Err(CryptoError::Malformed("bad iv length".to_string()));
        }
        let payload = Payload {
            msg: sealed.ciphertext.as_slice(),
            aad: sealed.aad.as_deref().unwrap_or_default(),
        };
        Self::cipher(key)
            .decrypt(Nonce::from_slice(&sealed.iv), payload)
            .map_err(|_| CryptoError::Open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KEY_LEN;

    fn key(byte: u8) -> KeyHandle {
        KeyHandle::new("test", [byte; KEY_LEN])
    }

    #[test]
    fn test_seal_then_open() {
        let sealer = AesGcmSealer::new();
        let sealed = sealer.seal(b"351234567890123", &key(1), Some(b"sb/identifiers.serial")).unwrap();
        assert_ne!(sealed.ciphertext, b"351234567890123");
        let opened = sealer.open(&sealed, &key(1)).unwrap();
        assert_eq!(opened, b"351234567890123");
    }

    #[test]
    fn test_fresh_nonce_per_seal() {
        let sealer = AesGcmSealer::new();
        let a = sealer.seal(b"same", &key(1), None).unwrap();
        let b = sealer.seal(b"same", &key(1), None).unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealer = AesGcmSealer::new();
        let sealed = sealer.seal(b"secret", &key(1), None).unwrap();
        assert!(matches!(sealer.open(&sealed, &key(2)), Err(CryptoError::Open)));
    }

    #[test]
    fn test_tampered_aad_fails() {
        let sealer = AesGcmSealer::new();
        let mut sealed = sealer.seal(b"secret", &key(1), Some(b"a")).unwrap();
        sealed.aad = Some(b"b".to_vec());
        assert!(matches!(sealer.open(&sealed, &key(1)), Err(CryptoError::Open)));
    }
}
