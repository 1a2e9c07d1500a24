use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use log::debug;

use super::{CryptoError, KEY_LEN, KeyHandle, KeyProvider, validate_alias};

/// Keys stored as hex files under a private directory, one file per alias.
#[derive(Debug, Clone)]
pub struct FileKeyProvider {
    dir: PathBuf,
}

impl FileKeyProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn key_path(&self, alias: &str) -> PathBuf {
        self.dir.join(format!("{alias}.key"))
    }

    fn parse(alias: &str, text: &str) -> Result<KeyHandle, CryptoError> {
        let raw = hex::decode(text.trim()).map_err(|_| CryptoError::CorruptKey(alias.to_string()))?;
        let bytes: [u8; KEY_LEN] = raw
            .try_into()
            .map_err(|_| CryptoError::CorruptKey(alias.to_string()))?;
        Ok(KeyHandle::new(alias, bytes))
    }
}

#[async_trait]
impl KeyProvider for FileKeyProvider {
    async fn get_or_create_key(&self, alias: &str) -> Result<KeyHandle, CryptoError> {
        validate_alias(alias)?;
        let path = self.key_path(alias);

        match tokio::fs::read_to_string(&path).await {
            Ok(text) => return Self::parse(alias, &text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let dir = self.dir.clone();
        let alias_owned = alias.to_string();
        let created = tokio::task::spawn_blocking(move || -> Result<Option<KeyHandle>, CryptoError> {
            std::fs::create_dir_all(&dir)?;
            let bytes: [u8; KEY_LEN] = rand::random();
            // tempfile creates 0600 files on unix.
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(hex::encode(bytes).as_bytes())?;
            tmp.as_file().sync_all()?;
            match tmp.persist_noclobber(&path) {
                Ok(_) => Ok(Some(KeyHandle::new(alias_owned, bytes))),
                // Another caller won the race; its key is authoritative.
                Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
                Err(e) => Err(e.error.into()),
            }
        })
        .await
        .map_err(|e| CryptoError::Io(std::io::Error::other(e)))??;

        match created {
            Some(handle) => {
                debug!("Created key for alias {}", alias);
                Ok(handle)
            }
            None => {
                let text = tokio::fs::read_to_string(self.key_path(alias)).await?;
                Self::parse(alias, &text)
            }
        }
    }

    async fn delete_key(&self, alias: &str) -> Result<(), CryptoError> {
        validate_alias(alias)?;
        match tokio::fs::remove_file(self.key_path(alias)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn has_key(&self, alias: &str) -> Result<bool, CryptoError> {
        validate_alias(alias)?;
        Ok(tokio::fs::try_exists(self.key_path(alias)).await?)
    }
}

/// Process-local key store, used by tests and ephemeral engines.
#[derive(Debug, Default)]
pub struct MemoryKeyProvider {
    keys: DashMap<String, KeyHandle>,
}

impl MemoryKeyProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Aliases currently holding key material.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[async_trait]
impl KeyProvider for MemoryKeyProvider {
    async fn get_or_create_key(&self, alias: &str) -> Result<KeyHandle, CryptoError> {
        validate_alias(alias)?;
        let handle = self
            .keys
            .entry(alias.to_string())
            .or_insert_with(|| KeyHandle::new(alias, rand::random()))
            .clone();
        Ok(handle)
    }

    async fn delete_key(&self, alias: &str) -> Result<(), CryptoError> {
        self.keys.remove(alias);
        Ok(())
    }

    async fn has_key(&self, alias: &str) -> Result<bool, CryptoError> {
        Ok(self.keys.contains_key(alias))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_provider_is_stable_across_instances() {
        let dir = TempDir::new().unwrap();
        let first = FileKeyProvider::new(dir.path().join("keys"));
        let key = first.get_or_create_key("sandbox.a").await.unwrap();
        assert!(first.has_key("sandbox.a").await.unwrap());

        let second = FileKeyProvider::new(dir.path().join("keys"));
        let again = second.get_or_create_key("sandbox.a").await.unwrap();
        assert_eq!(key, again);
    }

    #[tokio::test]
    async fn test_file_provider_delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let provider = FileKeyProvider::new(dir.path());
        provider.get_or_create_key("k").await.unwrap();
        provider.delete_key("k").await.unwrap();
        provider.delete_key("k").await.unwrap();
        assert!(!provider.has_key("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_file_provider_rejects_corrupt_key() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("bad.key"), "zz").unwrap();
        let provider = FileKeyProvider::new(dir.path());
        assert!(matches!(
            provider.get_or_create_key("bad").await,
            Err(CryptoError::CorruptKey(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_provider_distinct_aliases() {
        let provider = MemoryKeyProvider::new();
        let a = provider.get_or_create_key("a").await.unwrap();
        let b = provider.get_or_create_key("b").await.unwrap();
        assert_ne!(a, b);
        assert_eq!(a, provider.get_or_create_key("a").await.unwrap());
        assert_eq!(provider.len(), 2);
        provider.delete_key("a").await.unwrap();
        assert!(!provider.has_key("a").await.unwrap());
        assert_eq!(provider.len(), 1);
    }
}
