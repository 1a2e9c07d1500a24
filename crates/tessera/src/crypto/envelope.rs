use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

use super::CryptoError;

/// Version tag written by this build.
pub const ENVELOPE_VERSION: &str = "v1";

/// Nonce length for the v1 format.
pub(crate) const IV_LEN: usize = 12;

/// Sealed value: `v1.<iv>.<ciphertext>[.<aad>]`, base64url without padding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedEnvelope {
    pub version: String,
    pub iv: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub aad: Option<Vec<u8>>,
}

impl SealedEnvelope {
    pub fn encode(&self) -> String {
        let mut out = format!(
            "{}.{}.{}",
            self.version,
            URL_SAFE_NO_PAD.encode(&self.iv),
            URL_SAFE_NO_PAD.encode(&self.ciphertext)
        );
        if let Some(aad) = &self.aad {
            out.push('.');
            out.push_str(&URL_SAFE_NO_PAD.encode(aad));
        }
        out
    }

    pub fn decode(text: &str) -> Result<Self, CryptoError> {
        let parts: Vec<&str> = text.split('.').collect();
        let version = parts[0];
        if version != ENVELOPE_VERSION {
            let looks_versioned = version.len() > 1
                && version.starts_with('v')
                && version[1..].chars().all(|c| c.is_ascii_digit());
            return Err(if looks_versioned {
                CryptoError::UnsupportedVersion(version.to_string())
            } else {
                CryptoError::Malformed("missing version tag".to_string())
            });
        }
        if !(3..=4).contains(&parts.len()) {
            return Err(CryptoError::Malformed(format!(
                "expected 3 or 4 segments, found {}",
                parts.len()
            )));
        }

        let field = |name: &str, value: &str| {
            URL_SAFE_NO_PAD
                .decode(value)
                .map_err(|e| CryptoError::Malformed(format!("{name}: {e}")))
        };

        let iv = field("iv", parts[1])?;
        if iv.len() != IV_LEN {
            return Err(CryptoError::Malformed(format!(
                "iv must be {IV_LEN} bytes, found {}",
                iv.len()
            )));
        }
        let ciphertext = field("ciphertext", parts[2])?;
        if ciphertext.is_empty() {
            return Err(CryptoError::Malformed("empty ciphertext".to_string()));
        }
        let aad = match parts.get(3) {
            Some(raw) => Some(field("aad", raw)?),
            None => None,
        };

        Ok(Self {
            version: version.to_string(),
            iv,
            ciphertext,
            aad,
        })
    }

    /// Whether `text` looks like an encoded envelope of any version.
    pub fn is_sealed(text: &str) -> bool {
        Self::decode(text).is_ok()
    }
}
