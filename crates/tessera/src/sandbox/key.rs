//! Sandbox key generation.
//!
//! Format: `<slug>-<millis>-<random>` where `slug` is derived from the target
//! application, `millis` is the creation time in hex and `random` is 64 bits
//! from the OS CSPRNG. Keys are valid directory names.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::storage::layout::validate_key;

const MAX_SLUG_LEN: usize = 32;

/// Last millisecond value handed out, so keys from one process never go
/// backwards even if the wall clock does.
static LAST_MILLIS: AtomicU64 = AtomicU64::new(0);

fn next_millis() -> u64 {
    let now = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0);
    let previous = LAST_MILLIS
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(now.max(last)))
        .unwrap_or(now);
    now.max(previous)
}

/// Reduce a target reference to `[a-z0-9-]`.
pub fn slug(target_app_ref: &str) -> String {
    let mut out = String::with_capacity(MAX_SLUG_LEN);
    let mut last_dash = true;
    for c in target_app_ref.chars() {
        if out.len() >= MAX_SLUG_LEN {
            break;
        }
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    let trimmed = out.trim_end_matches('-');
    if trimmed.is_empty() {
        "sandbox".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Unique key joining every isolation dimension of one sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SandboxKey(String);

impl SandboxKey {
    /// Fresh key for `target_app_ref`.
    pub fn generate(target_app_ref: &str) -> Self {
        let nonce: u64 = rand::random();
        Self(format!("{}-{:x}-{:016x}", slug(target_app_ref), next_millis(), nonce))
    }

    /// Accept any string that is usable as a key.
    pub fn parse(text: &str) -> Result<Self, String> {
        validate_key(text).map_err(|e| e.to_string())?;
        Ok(Self(text.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SandboxKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SandboxKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
