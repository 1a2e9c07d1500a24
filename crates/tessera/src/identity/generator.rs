//! Identity drawing and the identity service.

use std::sync::Arc;

use log::{debug, info, warn};
use rand::Rng;
use rand::seq::IndexedRandom;

use crate::crypto::{KeyHandle, KeyProvider, Sealer, sandbox_key_alias};
use crate::schema::{self, Document};

use super::catalog::{self, DEVICES, OS_RELEASES, REGIONS};
use super::identifiers;
use super::sealing;
use super::{
    HardwareProfile, IdentityError, IdentityRecord, IdentityRepository, IdentityUpdate, Identifiers,
    LocaleProfile, NetworkProfile, OsProfile,
};

/// Default bound on identifier redraws when a claim collides.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 8;

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Fresh unique identifiers for a device model.
pub fn draw_identifiers(tac: &str) -> Identifiers {
    Identifiers {
        device_id: identifiers::device_id(),
        platform_id: identifiers::platform_id(),
        hardware_serial: identifiers::hardware_serial(tac),
        serial_number: identifiers::serial_number(),
        mac_address: identifiers::format_mac(&identifiers::random_mac()),
        bluetooth_address: identifiers::format_mac(&identifiers::random_bluetooth()),
    }
}

/// Draw a complete, self-consistent identity. Nothing is persisted.
pub fn draw(sandbox_key: &str, generation: u32) -> IdentityRecord {
    let mut rng = rand::rng();
    let device = &DEVICES[rng.random_range(0..DEVICES.len())];
    let release = catalog::releases_for(device)
        .choose(&mut rng)
        .copied()
        .unwrap_or(&OS_RELEASES[OS_RELEASES.len() - 1]);
    let region = &REGIONS[rng.random_range(0..REGIONS.len())];

    let build_id = identifiers::build_id(release.build_prefix);
    let incremental: u32 = rng.random_range(1_000_000..10_000_000);
    let fingerprint = format!(
        "{}/{}/{}:{}/{}/{}:user/release-keys",
        device.brand, device.device, device.device, release.release, build_id, incremental
    );
    let stamp = now();

    IdentityRecord {
        sandbox_key: sandbox_key.to_string(),
        generation,
        hardware: HardwareProfile {
            manufacturer: device.manufacturer.to_string(),
            brand: device.brand.to_string(),
            model: device.model.to_string(),
            device: device.device.to_string(),
            product: device.device.to_string(),
            board: device.board.to_string(),
            hardware: device.hardware.to_string(),
            cpu_abi: device.cpu_abi.to_string(),
        },
        os: OsProfile {
            release: release.release.to_string(),
            api_level: release.api_level,
            build_id,
            fingerprint,
            security_patch: release.security_patch.to_string(),
        },
        locale: LocaleProfile {
            language: region.language.to_string(),
            country: region.country.to_string(),
            locale: region.locale(),
            timezone: region.timezone.to_string(),
        },
        network: NetworkProfile {
            carrier: region.carrier.to_string(),
            mcc: region.mcc.to_string(),
            mnc: region.mnc.to_string(),
        },
        identifiers: draw_identifiers(device.tac),
        created_at: stamp.clone(),
        updated_at: stamp,
    }
}

fn tac_of(record: &IdentityRecord) -> String {
    catalog::find_device(&record.hardware.model)
        .map(|d| d.tac.to_string())
        .unwrap_or_else(|| record.identifiers.hardware_serial.chars().take(8).collect())
}

/// Generates, persists and maintains sandbox identities.
///
/// Sensitive fields (dotted paths from the sandbox's policy) are sealed
/// before they reach the database and opened again on read.
#[derive(Clone)]
pub struct IdentityGenerator {
    repo: IdentityRepository,
    keys: Arc<dyn KeyProvider>,
    sealer: Arc<dyn Sealer>,
    max_attempts: u32,
}

impl IdentityGenerator {
    pub fn new(repo: IdentityRepository, keys: Arc<dyn KeyProvider>, sealer: Arc<dyn Sealer>) -> Self {
        Self {
            repo,
            keys,
            sealer,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    async fn key_for(&self, sandbox_key: &str) -> Result<KeyHandle, IdentityError> {
        Ok(self.keys.get_or_create_key(&sandbox_key_alias(sandbox_key)).await?)
    }

    async fn encode(&self, record: &IdentityRecord, sensitive: &[String]) -> Result<String, IdentityError> {
        schema::check(record).map_err(|e| IdentityError::Invalid(e.to_string()))?;
        let mut body = serde_json::to_value(record).map_err(schema::SchemaError::from)?;
        if !sensitive.is_empty() {
            let key = self.key_for(&record.sandbox_key).await?;
            sealing::seal_paths(&mut body, sensitive, &record.sandbox_key, &key, self.sealer.as_ref())?;
        }
        Ok(schema::wrap_value(IdentityRecord::KIND, body)?)
    }

    async fn decode(&self, sandbox_key: &str, text: &str) -> Result<IdentityRecord, IdentityError> {
        let mut body = schema::unwrap_value(IdentityRecord::KIND, text)?;
        if sealing::has_sealed(&body) {
            let key = self.key_for(sandbox_key).await?;
            sealing::open_all(&mut body, sandbox_key, &key, self.sealer.as_ref())?;
        }
        let record: IdentityRecord = serde_json::from_value(body).map_err(schema::SchemaError::from)?;
        schema::check(&record)?;
        Ok(record)
    }

    /// Generate and persist the identity for a new sandbox.
    ///
    /// Identifier collisions with other sandboxes are redrawn up to the
    /// configured attempt limit.
    pub async fn generate(&self, sandbox_key: &str, sensitive: &[String]) -> Result<IdentityRecord, IdentityError> {
        let mut record = draw(sandbox_key, 1);
        for attempt in 1..=self.max_attempts {
            let document = self.encode(&record, sensitive).await?;
            match self
                .repo
                .insert(sandbox_key, &document, &record.claims(), &record.created_at)
                .await
            {
                Ok(()) => {
                    debug!(
                        "Generated identity for {}: {} {} (API {})",
                        sandbox_key, record.hardware.brand, record.hardware.model, record.os.api_level
                    );
                    return Ok(record);
                }
                Err(IdentityError::ClaimConflict(claim)) => {
                    warn!(
                        "Identifier collision for {} on claim {} (attempt {}/{}), redrawing",
                        sandbox_key, claim, attempt, self.max_attempts
                    );
                    record.identifiers = draw_identifiers(&tac_of(&record));
                }
                Err(e) => return Err(e),
            }
        }
        Err(IdentityError::Exhausted(self.max_attempts))
    }

    pub async fn find(&self, sandbox_key: &str) -> Result<Option<IdentityRecord>, IdentityError> {
        match self.repo.get(sandbox_key).await? {
            Some(text) => Ok(Some(self.decode(sandbox_key, &text).await?)),
            None => Ok(None),
        }
    }

    pub async fn get(&self, sandbox_key: &str) -> Result<IdentityRecord, IdentityError> {
        self.find(sandbox_key)
            .await?
            .ok_or_else(|| IdentityError::NotFound(sandbox_key.to_string()))
    }

    /// Overwrite some fields, leaving every other field untouched.
    pub async fn update(
        &self,
        sandbox_key: &str,
        update: &IdentityUpdate,
        sensitive: &[String],
    ) -> Result<IdentityRecord, IdentityError> {
        let current = self.get(sandbox_key).await?;
        if update.is_empty() {
            return Ok(current);
        }

        let mut record = current.clone();
        update.apply_to(&mut record);
        record.validate().map_err(IdentityError::Invalid)?;
        record.updated_at = now();

        let document = self.encode(&record, sensitive).await?;
        if record.claims() == current.claims() {
            self.repo.rewrite(sandbox_key, &document, &record.updated_at).await?;
        } else {
            self.repo
                .replace(sandbox_key, &document, &record.claims(), &record.updated_at)
                .await?;
        }
        info!("Updated identity for {}", sandbox_key);
        Ok(record)
    }

    /// Replace the whole identity with a freshly drawn one.
    pub async fn regenerate(&self, sandbox_key: &str, sensitive: &[String]) -> Result<IdentityRecord, IdentityError> {
        let current = self.get(sandbox_key).await?;
        let mut record = draw(sandbox_key, current.generation + 1);
        record.created_at = current.created_at.clone();

        for attempt in 1..=self.max_attempts {
            let document = self.encode(&record, sensitive).await?;
            match self
                .repo
                .replace(sandbox_key, &document, &record.claims(), &record.updated_at)
                .await
            {
                Ok(()) => {
                    info!(
                        "Regenerated identity for {} (generation {})",
                        sandbox_key, record.generation
                    );
                    return Ok(record);
                }
                Err(IdentityError::ClaimConflict(claim)) => {
                    warn!(
                        "Identifier collision for {} on claim {} (attempt {}/{}), redrawing",
                        sandbox_key, claim, attempt, self.max_attempts
                    );
                    record.identifiers = draw_identifiers(&tac_of(&record));
                }
                Err(e) => return Err(e),
            }
        }
        Err(IdentityError::Exhausted(self.max_attempts))
    }

    /// Rewrite the stored document with a new set of sensitive fields.
    pub async fn reseal(&self, sandbox_key: &str, sensitive: &[String]) -> Result<(), IdentityError> {
        let record = self.get(sandbox_key).await?;
        let document = self.encode(&record, sensitive).await?;
        self.repo.rewrite(sandbox_key, &document, &now()).await?;
        debug!("Resealed identity for {} ({} sensitive fields)", sandbox_key, sensitive.len());
        Ok(())
    }

    /// Delete the identity, its claims and its sealing key.
    pub async fn delete(&self, sandbox_key: &str) -> Result<bool, IdentityError> {
        let existed = self.repo.delete(sandbox_key).await?;
        self.keys.delete_key(&sandbox_key_alias(sandbox_key)).await?;
        Ok(existed)
    }

    /// Whether the sandbox has sealing key material.
    pub async fn has_sealing_key(&self, sandbox_key: &str) -> Result<bool, IdentityError> {
        Ok(self.keys.has_key(&sandbox_key_alias(sandbox_key)).await?)
    }

    /// Raw stored document, sealed fields left sealed.
    pub async fn stored_document(&self, sandbox_key: &str) -> Result<Option<String>, IdentityError> {
        self.repo.get(sandbox_key).await
    }
}

impl std::fmt::Debug for IdentityGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityGenerator")
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{AesGcmSealer, MemoryKeyProvider};
    use crate::db::Database;
    use std::collections::HashSet;

    async fn generator() -> IdentityGenerator {
        let db = Database::in_memory().await.unwrap();
        IdentityGenerator::new(
            IdentityRepository::new(db.pool().clone()),
            Arc::new(MemoryKeyProvider::new()),
            Arc::new(AesGcmSealer::new()),
        )
    }

    fn sensitive() -> Vec<String> {
        vec![
            "identifiers.hardware_serial".to_string(),
            "identifiers.device_id".to_string(),
            "identifiers.mac_address".to_string(),
        ]
    }

    #[test]
    fn test_draw_is_consistent() {
        for _ in 0..300 {
            let rec = draw("sb", 1);
            let device = catalog::find_device(&rec.hardware.model).unwrap();
            assert!((device.min_api..=device.max_api).contains(&rec.os.api_level));
            assert!(rec.identifiers.hardware_serial.starts_with(device.tac));
            let region = REGIONS
                .iter()
                .find(|r| r.carrier == rec.network.carrier && r.timezone == rec.locale.timezone)
                .unwrap();
            assert_eq!(region.country, rec.locale.country);
            assert_eq!(region.mcc, rec.network.mcc);
            assert!(rec.os.fingerprint.contains(&rec.os.build_id));
        }
    }

    #[test]
    fn test_draws_do_not_share_identifiers() {
        let mut seen = HashSet::new();
        for i in 0..500 {
            let rec = draw(&format!("sb{i}"), 1);
            // Hardware serials only carry six random digits per model and
            // are left to the claim table.
            for (field, value) in rec.unique_values() {
                if field != "hardware_serial" {
                    assert!(seen.insert(format!("{field}={value}")));
                }
            }
        }
    }

    #[tokio::test]
    async fn test_generate_seals_sensitive_fields_at_rest() {
        let generator = generator().await;
        let record = generator.generate("sb1", &sensitive()).await.unwrap();

        let stored = generator.stored_document("sb1").await.unwrap().unwrap();
        assert!(!stored.contains(&record.identifiers.hardware_serial));
        assert!(!stored.contains(&record.identifiers.mac_address));
        assert!(stored.contains(&record.identifiers.serial_number));
        assert!(generator.has_sealing_key("sb1").await.unwrap());

        assert_eq!(generator.get("sb1").await.unwrap(), record);
    }

    #[tokio::test]
    async fn test_generate_without_sensitive_fields_is_plain() {
        let generator = generator().await;
        let record = generator.generate("sb1", &[]).await.unwrap();
        let stored = generator.stored_document("sb1").await.unwrap().unwrap();
        assert!(stored.contains(&record.identifiers.device_id));
        assert!(!generator.has_sealing_key("sb1").await.unwrap());
    }

    #[tokio::test]
    async fn test_update_is_partial_and_validated() {
        let generator = generator().await;
        let before = generator.generate("sb1", &sensitive()).await.unwrap();

        let after = generator
            .update(
                "sb1",
                &IdentityUpdate {
                    mac_address: Some("06:11:22:33:44:55".into()),
                    ..Default::default()
                },
                &sensitive(),
            )
            .await
            .unwrap();
        assert_eq!(after.identifiers.mac_address, "06:11:22:33:44:55");
        assert_eq!(after.identifiers.device_id, before.identifiers.device_id);
        assert_eq!(after.hardware, before.hardware);

        let err = generator
            .update(
                "sb1",
                &IdentityUpdate {
                    mac_address: Some("01:11:22:33:44:55".into()),
                    ..Default::default()
                },
                &sensitive(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, IdentityError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_update_rejects_identifier_owned_elsewhere() {
        let generator = generator().await;
        let first = generator.generate("sb1", &[]).await.unwrap();
        generator.generate("sb2", &[]).await.unwrap();

        let err = generator
            .update(
                "sb2",
                &IdentityUpdate {
                    device_id: Some(first.identifiers.device_id.clone()),
                    ..Default::default()
                },
                &[],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, IdentityError::ClaimConflict(_)));
    }

    #[tokio::test]
    async fn test_regenerate_bumps_generation() {
        let generator = generator().await;
        let first = generator.generate("sb1", &sensitive()).await.unwrap();
        let second = generator.regenerate("sb1", &sensitive()).await.unwrap();
        assert_eq!(second.generation, first.generation + 1);
        assert_eq!(second.created_at, first.created_at);
        assert_ne!(second.identifiers.device_id, first.identifiers.device_id);
        assert_eq!(generator.get("sb1").await.unwrap(), second);
    }

    #[tokio::test]
    async fn test_reseal_with_fewer_fields() {
        let generator = generator().await;
        let record = generator.generate("sb1", &sensitive()).await.unwrap();
        generator.reseal("sb1", &[]).await.unwrap();
        let stored = generator.stored_document("sb1").await.unwrap().unwrap();
        assert!(stored.contains(&record.identifiers.hardware_serial));
        assert_eq!(generator.get("sb1").await.unwrap().identifiers, record.identifiers);
    }

    #[tokio::test]
    async fn test_delete_removes_key_material() {
        let generator = generator().await;
        generator.generate("sb1", &sensitive()).await.unwrap();
        assert!(generator.delete("sb1").await.unwrap());
        assert!(!generator.has_sealing_key("sb1").await.unwrap());
        assert!(!generator.delete("sb1").await.unwrap());
        assert!(matches!(
            generator.get("sb1").await,
            Err(IdentityError::NotFound(_))
        ));
    }
}
