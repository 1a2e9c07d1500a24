//! Synthetic device identities.
//!
//! Each sandbox owns exactly one [`IdentityRecord`]: a mutually consistent
//! bundle of hardware, OS, locale and network descriptors plus a set of
//! unique identifiers. Records are drawn by [`generator`], persisted by
//! [`IdentityRepository`] and managed through [`IdentityGenerator`].

pub mod catalog;
pub mod generator;
pub mod identifiers;
mod repository;
mod sealing;

pub use generator::IdentityGenerator;
pub use repository::IdentityRepository;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::crypto::CryptoError;
use crate::schema::{Document, SchemaError};

/// Errors from identity generation and persistence.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity not found for sandbox {0}")]
    NotFound(String),

    #[error("identity already exists for sandbox {0}")]
    AlreadyExists(String),

    #[error("invalid identity: {0}")]
    Invalid(String),

    /// A unique identifier value is already owned by another sandbox.
    #[error("identifier {0} is already in use")]
    ClaimConflict(String),

    #[error("could not allocate unique identifiers after {0} attempts")]
    Exhausted(u32),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Database(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareProfile {
    pub manufacturer: String,
    pub brand: String,
    pub model: String,
    pub device: String,
    pub product: String,
    pub board: String,
    pub hardware: String,
    pub cpu_abi: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsProfile {
    pub release: String,
    pub api_level: u32,
    pub build_id: String,
    pub fingerprint: String,
    pub security_patch: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocaleProfile {
    pub language: String,
    pub country: String,
    pub locale: String,
    pub timezone: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkProfile {
    pub carrier: String,
    pub mcc: String,
    pub mnc: String,
}

/// Values that must never be shared between two sandboxes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifiers {
    pub device_id: String,
    pub platform_id: String,
    pub hardware_serial: String,
    pub serial_number: String,
    pub mac_address: String,
    pub bluetooth_address: String,
}

/// A sandbox's synthetic device identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub sandbox_key: String,
    /// Bumped on every regenerate.
    pub generation: u32,
    pub hardware: HardwareProfile,
    pub os: OsProfile,
    pub locale: LocaleProfile,
    pub network: NetworkProfile,
    pub identifiers: Identifiers,
    pub created_at: String,
    pub updated_at: String,
}

impl Document for IdentityRecord {
    const KIND: &'static str = "identity";

    fn validate(&self) -> Result<(), String> {
        let ids = &self.identifiers;
        if self.sandbox_key.is_empty() {
            return Err("sandbox_key must not be empty".to_string());
        }
        if !identifiers::is_hex_of_len(&ids.device_id, 16) {
            return Err("device_id must be 16 hex characters".to_string());
        }
        if !identifiers::is_hex_of_len(&ids.platform_id, 16) {
            return Err("platform_id must be 16 hex characters".to_string());
        }
        if ids.hardware_serial.len() != 15 || !identifiers::luhn_valid(&ids.hardware_serial) {
            return Err("hardware_serial must be 15 digits with a valid check digit".to_string());
        }
        if ids.serial_number.is_empty() || !ids.serial_number.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err("serial_number must be alphanumeric".to_string());
        }
        if !identifiers::is_valid_sandbox_mac(&ids.mac_address) {
            return Err("mac_address must be a unicast, locally administered address".to_string());
        }
        match identifiers::parse_mac(&ids.bluetooth_address) {
            Some(bytes) if !identifiers::is_multicast(&bytes) => {}
            _ => return Err("bluetooth_address must be a unicast address".to_string()),
        }
        if self.hardware.model.is_empty() || self.hardware.brand.is_empty() {
            return Err("hardware model and brand are required".to_string());
        }
        if self.os.api_level == 0 {
            return Err("os api_level must be positive".to_string());
        }
        if self.network.mcc.len() != 3 || !self.network.mcc.chars().all(|c| c.is_ascii_digit()) {
            return Err("mcc must be 3 digits".to_string());
        }
        if self.locale.timezone.is_empty() {
            return Err("timezone is required".to_string());
        }
        Ok(())
    }
}

impl IdentityRecord {
    /// Unique identifier values as `(field, value)` pairs.
    pub fn unique_values(&self) -> Vec<(&'static str, &str)> {
        let ids = &self.identifiers;
        vec![
            ("device_id", ids.device_id.as_str()),
            ("platform_id", ids.platform_id.as_str()),
            ("hardware_serial", ids.hardware_serial.as_str()),
            ("serial_number", ids.serial_number.as_str()),
            ("mac_address", ids.mac_address.as_str()),
            ("bluetooth_address", ids.bluetooth_address.as_str()),
        ]
    }

    /// SHA-256 digests under which the unique values are claimed.
    pub fn claims(&self) -> Vec<String> {
        self.unique_values()
            .into_iter()
            .map(|(field, value)| claim_digest(field, value))
            .collect()
    }

    /// Non-sensitive summary for statistics.
    pub fn summary(&self) -> IdentitySummary {
        IdentitySummary {
            brand: self.hardware.brand.clone(),
            model: self.hardware.model.clone(),
            os_release: self.os.release.clone(),
            api_level: self.os.api_level,
            locale: self.locale.locale.clone(),
            timezone: self.locale.timezone.clone(),
            carrier: self.network.carrier.clone(),
            generation: self.generation,
        }
    }

    /// System property overlay consumed by the interception layer.
    pub fn properties(&self) -> BTreeMap<String, String> {
        let hw = &self.hardware;
        let os = &self.os;
        let pairs = [
            ("ro.product.manufacturer", hw.manufacturer.as_str()),
            ("ro.product.brand", hw.brand.as_str()),
            ("ro.product.model", hw.model.as_str()),
            ("ro.product.device", hw.device.as_str()),
            ("ro.product.name", hw.product.as_str()),
            ("ro.product.board", hw.board.as_str()),
            ("ro.product.cpu.abi", hw.cpu_abi.as_str()),
            ("ro.hardware", hw.hardware.as_str()),
            ("ro.build.id", os.build_id.as_str()),
            ("ro.build.fingerprint", os.fingerprint.as_str()),
            ("ro.build.version.release", os.release.as_str()),
            ("ro.build.version.security_patch", os.security_patch.as_str()),
            ("ro.serialno", self.identifiers.serial_number.as_str()),
            ("persist.sys.locale", self.locale.locale.as_str()),
            ("persist.sys.timezone", self.locale.timezone.as_str()),
            ("gsm.operator.alpha", self.network.carrier.as_str()),
        ];
        let mut map: BTreeMap<String, String> = pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        map.insert("ro.build.version.sdk".into(), os.api_level.to_string());
        map.insert(
            "gsm.operator.numeric".into(),
            format!("{}{}", self.network.mcc, self.network.mnc),
        );
        map.insert(
            "gsm.sim.operator.iso-country".into(),
            self.locale.country.to_lowercase(),
        );
        map
    }
}

/// Identity fields exposed in statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySummary {
    pub brand: String,
    pub model: String,
    pub os_release: String,
    pub api_level: u32,
    pub locale: String,
    pub timezone: String,
    pub carrier: String,
    pub generation: u32,
}

/// Partial overwrite of an identity. Absent fields are left as they are.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IdentityUpdate {
    pub device_id: Option<String>,
    pub platform_id: Option<String>,
    pub hardware_serial: Option<String>,
    pub serial_number: Option<String>,
    pub mac_address: Option<String>,
    pub bluetooth_address: Option<String>,
    pub carrier: Option<String>,
    pub timezone: Option<String>,
}

impl IdentityUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply onto `record`. Validation is the caller's job.
    pub fn apply_to(&self, record: &mut IdentityRecord) {
        let ids = &mut record.identifiers;
        let fields = [
            (&self.device_id, &mut ids.device_id),
            (&self.platform_id, &mut ids.platform_id),
            (&self.hardware_serial, &mut ids.hardware_serial),
            (&self.serial_number, &mut ids.serial_number),
            (&self.mac_address, &mut ids.mac_address),
            (&self.bluetooth_address, &mut ids.bluetooth_address),
            (&self.carrier, &mut record.network.carrier),
            (&self.timezone, &mut record.locale.timezone),
        ];
        for (new, slot) in fields {
            if let Some(value) = new {
                *slot = value.clone();
            }
        }
    }
}

/// Digest under which one unique value is claimed.
pub fn claim_digest(field: &str, value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(field.as_bytes());
    hasher.update(b"=");
    hasher.update(value.to_ascii_uppercase().as_bytes());
    hex::encode(hasher.finalize())
}
