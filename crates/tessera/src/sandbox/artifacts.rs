//! Per-sandbox config artifacts kept outside the live storage root.
//!
//! `<dir>/<sandbox_key>/` holds `manifest.json`, `redirects.json`,
//! `policy.json` and `properties.json`, each in the versioned envelope.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::policy::PolicyDocument;
use crate::schema::{self, Document, SchemaError};
use crate::storage::{LAYOUT_VERSION, RedirectionTable};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const REDIRECTS_FILE: &str = "redirects.json";
pub const POLICY_FILE: &str = "policy.json";
pub const PROPERTIES_FILE: &str = "properties.json";

/// Number of artifacts a fully configured sandbox has.
pub const EXPECTED_ARTIFACTS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxManifest {
    pub sandbox_key: String,
    pub target_app_ref: String,
    pub layout_version: u32,
    pub storage_root: PathBuf,
    pub created_at: String,
}

impl SandboxManifest {
    pub fn new(sandbox_key: &str, target_app_ref: &str, storage_root: &Path, created_at: &str) -> Self {
        Self {
            sandbox_key: sandbox_key.to_string(),
            target_app_ref: target_app_ref.to_string(),
            layout_version: LAYOUT_VERSION,
            storage_root: storage_root.to_path_buf(),
            created_at: created_at.to_string(),
        }
    }
}

impl Document for SandboxManifest {
    const KIND: &'static str = "manifest";

    fn validate(&self) -> Result<(), String> {
        if self.layout_version != LAYOUT_VERSION {
            return Err(format!("unsupported layout version {}", self.layout_version));
        }
        if self.sandbox_key.is_empty() || self.target_app_ref.is_empty() {
            return Err("sandbox key and target are required".to_string());
        }
        Ok(())
    }
}

/// System properties the interception layer overlays for one sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyOverlay {
    pub sandbox_key: String,
    pub properties: BTreeMap<String, String>,
}

impl Document for PropertyOverlay {
    const KIND: &'static str = "properties";

    fn validate(&self) -> Result<(), String> {
        if self.properties.keys().any(|k| k.is_empty()) {
            return Err("property names must not be empty".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<ArtifactError> for crate::error::EngineError {
    fn from(error: ArtifactError) -> Self {
        match error {
            ArtifactError::Io(e) => crate::storage::StorageError::Io(e).into(),
            ArtifactError::Schema(e) => anyhow::Error::new(e).context("encoding config artifact").into(),
        }
    }
}

/// Reads and writes config artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir_for(&self, sandbox_key: &str) -> PathBuf {
        self.dir.join(sandbox_key)
    }

    async fn write<T: Document>(&self, sandbox_key: &str, name: &str, doc: &T) -> Result<(), ArtifactError> {
        let text = schema::encode(doc)?;
        let dir = self.dir_for(sandbox_key);
        tokio::fs::create_dir_all(&dir).await?;
        let tmp = dir.join(format!(".{name}.tmp"));
        tokio::fs::write(&tmp, text).await?;
        tokio::fs::rename(&tmp, dir.join(name)).await?;
        Ok(())
    }

    async fn read<T: Document>(&self, sandbox_key: &str, name: &str) -> Result<Option<T>, ArtifactError> {
        let path = self.dir_for(sandbox_key).join(name);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(Some(schema::decode(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn write_manifest(&self, manifest: &SandboxManifest) -> Result<(), ArtifactError> {
        self.write(&manifest.sandbox_key, MANIFEST_FILE, manifest).await
    }

    pub async fn write_redirects(&self, table: &RedirectionTable) -> Result<(), ArtifactError> {
        self.write(&table.sandbox_key, REDIRECTS_FILE, table).await
    }

    pub async fn write_policy(&self, sandbox_key: &str, policy: &PolicyDocument) -> Result<(), ArtifactError> {
        self.write(sandbox_key, POLICY_FILE, policy).await
    }

    pub async fn write_properties(&self, overlay: &PropertyOverlay) -> Result<(), ArtifactError> {
        self.write(&overlay.sandbox_key, PROPERTIES_FILE, overlay).await
    }

    pub async fn manifest(&self, sandbox_key: &str) -> Result<Option<SandboxManifest>, ArtifactError> {
        self.read(sandbox_key, MANIFEST_FILE).await
    }

    pub async fn redirects(&self, sandbox_key: &str) -> Result<Option<RedirectionTable>, ArtifactError> {
        self.read(sandbox_key, REDIRECTS_FILE).await
    }

    pub async fn properties(&self, sandbox_key: &str) -> Result<Option<PropertyOverlay>, ArtifactError> {
        self.read(sandbox_key, PROPERTIES_FILE).await
    }

    /// How many artifacts exist and decode cleanly.
    pub async fn count_valid(&self, sandbox_key: &str) -> usize {
        let checks = [
            self.manifest(sandbox_key).await.map(|d| d.is_some()),
            self.redirects(sandbox_key).await.map(|d| d.is_some()),
            self.read::<PolicyDocument>(sandbox_key, POLICY_FILE)
                .await
                .map(|d| d.is_some()),
            self.properties(sandbox_key).await.map(|d| d.is_some()),
        ];
        checks
            .into_iter()
            .filter(|check| match check {
                Ok(present) => *present,
                Err(e) => {
                    warn!("Unreadable config artifact for {}: {}", sandbox_key, e);
                    false
                }
            })
            .count()
    }

    /// Delete all artifacts of a sandbox. Returns whether anything existed.
    pub async fn remove(&self, sandbox_key: &str) -> Result<bool, ArtifactError> {
        match tokio::fs::remove_dir_all(self.dir_for(sandbox_key)).await {
            Ok(()) => {
                debug!("Removed config artifacts for {}", sandbox_key);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Keys that have an artifact directory.
    pub async fn list_keys(&self) -> Result<Vec<String>, ArtifactError> {
        let mut keys = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                keys.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn overlay(key: &str) -> PropertyOverlay {
        PropertyOverlay {
            sandbox_key: key.to_string(),
            properties: BTreeMap::from([("ro.product.model".to_string(), "Pixel 7".to_string())]),
        }
    }

    #[tokio::test]
    async fn test_write_and_count() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        assert_eq!(store.count_valid("sb").await, 0);

        let root = dir.path().join("roots/sb");
        store
            .write_manifest(&SandboxManifest::new("sb", "app.example", &root, "t0"))
            .await
            .unwrap();
        store
            .write_redirects(&RedirectionTable::build("sb", "app.example", &root))
            .await
            .unwrap();
        store.write_policy("sb", &PolicyDocument::default()).await.unwrap();
        store.write_properties(&overlay("sb")).await.unwrap();

        assert_eq!(store.count_valid("sb").await, EXPECTED_ARTIFACTS);
        assert_eq!(store.properties("sb").await.unwrap().unwrap(), overlay("sb"));
        assert_eq!(store.list_keys().await.unwrap(), vec!["sb".to_string()]);
    }

    #[tokio::test]
    async fn test_corrupt_artifact_not_counted() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        store.write_properties(&overlay("sb")).await.unwrap();
        std::fs::write(store.dir_for("sb").join(POLICY_FILE), "{not json").unwrap();
        assert_eq!(store.count_valid("sb").await, 1);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        store.write_properties(&overlay("sb")).await.unwrap();
        assert!(store.remove("sb").await.unwrap());
        assert!(!store.remove("sb").await.unwrap());
        assert!(store.list_keys().await.unwrap().is_empty());
    }
}
