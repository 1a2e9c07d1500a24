//! Per-sandbox directory trees.
//!
//! Every sandbox gets `<base>/<sandbox_key>/` with a fixed, versioned set of
//! category subdirectories. Trees are assembled in a hidden staging
//! directory and renamed into place so a half-built tree is never visible
//! under the sandbox's root.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::error::{StorageError, StorageResult};

/// Version of the subdirectory set below.
pub const LAYOUT_VERSION: u32 = 1;

const STAGING_PREFIX: &str = ".staging-";
const RESTORE_PREFIX: &str = ".restore-";
const RETIRED_PREFIX: &str = ".retired-";

/// One isolated storage area inside a sandbox root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageCategory {
    /// Structured application data and databases.
    Data,
    Cache,
    /// Preferences.
    Settings,
    /// Cookies and web session state.
    Session,
    /// Key material.
    Keys,
    Logs,
    Downloads,
    Media,
}

impl StorageCategory {
    pub const ALL: [StorageCategory; 8] = [
        StorageCategory::Data,
        StorageCategory::Cache,
        StorageCategory::Settings,
        StorageCategory::Session,
        StorageCategory::Keys,
        StorageCategory::Logs,
        StorageCategory::Downloads,
        StorageCategory::Media,
    ];

    pub fn dir_name(self) -> &'static str {
        match self {
            StorageCategory::Data => "data",
            StorageCategory::Cache => "cache",
            StorageCategory::Settings => "settings",
            StorageCategory::Session => "session",
            StorageCategory::Keys => "keys",
            StorageCategory::Logs => "logs",
            StorageCategory::Downloads => "downloads",
            StorageCategory::Media => "media",
        }
    }

    pub fn from_dir_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.dir_name() == name)
    }
}

impl std::fmt::Display for StorageCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Sandbox keys double as directory names.
pub fn validate_key(key: &str) -> StorageResult<()> {
    let ok = !key.is_empty()
        && key.len() <= 128
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(StorageError::InvalidPath(key.to_string()))
    }
}

fn scratch_name(prefix: &str, key: &str) -> String {
    format!("{prefix}{key}-{:016x}", rand::random::<u64>())
}

/// Key a scratch directory name was made for, if it is one.
fn scratch_key(name: &str) -> Option<&str> {
    let rest = [STAGING_PREFIX, RESTORE_PREFIX, RETIRED_PREFIX]
        .iter()
        .find_map(|prefix| name.strip_prefix(prefix))?;
    rest.rsplit_once('-').map(|(key, _)| key)
}

/// Builder and janitor for sandbox storage trees under one base directory.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    base: PathBuf,
}

impl StorageLayout {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Root directory for a sandbox key.
    pub fn root_for(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        Ok(self.base.join(key))
    }

    pub(crate) fn scratch_dir(&self, prefix: &str, key: &str) -> PathBuf {
        self.base.join(scratch_name(prefix, key))
    }

    pub(crate) fn restore_scratch(&self, key: &str) -> PathBuf {
        self.scratch_dir(RESTORE_PREFIX, key)
    }

    pub(crate) fn retired_scratch(&self, key: &str) -> PathBuf {
        self.scratch_dir(RETIRED_PREFIX, key)
    }

    /// Create the full tree for `key`. Fails with `AlreadyExists` if the
    /// root is already present; on any other failure nothing is left behind.
    pub async fn build(&self, key: &str) -> StorageResult<PathBuf> {
        let root = self.root_for(key)?;
        let staging = self.scratch_dir(STAGING_PREFIX, key);
        let base = self.base.clone();
        let key_owned = key.to_string();

        let root = tokio::task::spawn_blocking(move || build_blocking(&base, &staging, root, &key_owned))
            .await
            .map_err(|e| StorageError::Io(std::io::Error::other(e)))??;

        info!(sandbox_key = key, root = %root.display(), "built storage tree");
        Ok(root)
    }

    /// Delete the whole tree. Returns whether anything was removed.
    pub async fn clear(&self, key: &str) -> StorageResult<bool> {
        let root = self.root_for(key)?;
        match tokio::fs::remove_dir_all(&root).await {
            Ok(()) => {
                info!(sandbox_key = key, "cleared storage tree");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn exists(&self, key: &str) -> StorageResult<bool> {
        let root = self.root_for(key)?;
        Ok(tokio::fs::try_exists(&root).await?)
    }

    /// Categories whose directory is missing.
    pub async fn missing_categories(&self, key: &str) -> StorageResult<Vec<StorageCategory>> {
        let root = self.root_for(key)?;
        let mut missing = Vec::new();
        for category in StorageCategory::ALL {
            let is_dir = tokio::fs::metadata(root.join(category.dir_name()))
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false);
            if !is_dir {
                missing.push(category);
            }
        }
        Ok(missing)
    }

    pub async fn is_complete(&self, key: &str) -> StorageResult<bool> {
        Ok(self.exists(key).await? && self.missing_categories(key).await?.is_empty())
    }

    /// Recreate missing category directories of an existing tree.
    pub async fn repair(&self, key: &str) -> StorageResult<Vec<StorageCategory>> {
        let root = self.root_for(key)?;
        if !tokio::fs::try_exists(&root).await? {
            return Err(StorageError::NotFound(key.to_string()));
        }
        let missing = self.missing_categories(key).await?;
        for category in &missing {
            tokio::fs::create_dir_all(root.join(category.dir_name())).await?;
        }
        if !missing.is_empty() {
            warn!(sandbox_key = key, repaired = missing.len(), "repaired storage tree");
        }
        Ok(missing)
    }

    /// Keys of every visible tree under the base directory.
    pub async fn list_roots(&self) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.base).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if validate_key(&name).is_ok() {
                keys.push(name);
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Remove scratch directories left behind by interrupted operations.
    ///
    /// Scratch directories of keys for which `in_use` is true belong to an
    /// operation still in flight and are kept.
    pub async fn sweep_scratch<F>(&self, in_use: F) -> StorageResult<usize>
    where
        F: Fn(&str) -> bool,
    {
        let mut removed = 0;
        let mut entries = match tokio::fs::read_dir(&self.base).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(key) = scratch_key(&name) else {
                continue;
            };
            if in_use(key) {
                debug!(dir = %name, key, "kept scratch directory of a running operation");
                continue;
            }
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            // The operation that made it may have just finished with it.
            match tokio::fs::remove_dir_all(entry.path()).await {
                Ok(()) => {
                    debug!(dir = %name, "removed scratch directory");
                    removed += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }
}

fn build_blocking(base: &Path, staging: &Path, root: PathBuf, key: &str) -> StorageResult<PathBuf> {
    std::fs::create_dir_all(base)?;
    if root.exists() {
        return Err(StorageError::AlreadyExists(key.to_string()));
    }

    let populate = || -> std::io::Result<()> {
        std::fs::create_dir(staging)?;
        for category in StorageCategory::ALL {
            std::fs::create_dir(staging.join(category.dir_name()))?;
        }
        Ok(())
    };

    if let Err(e) = populate() {
        let _ = std::fs::remove_dir_all(staging);
        return Err(e.into());
    }

    // Callers serialize per key, so nothing else can create `root` between
    // the check above and this rename.
    if let Err(e) = std::fs::rename(staging, &root) {
        let _ = std::fs::remove_dir_all(staging);
        if root.exists() {
            return Err(StorageError::AlreadyExists(key.to_string()));
        }
        return Err(e.into());
    }

    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_build_creates_every_category() {
        let dir = TempDir::new().unwrap();
        let layout = StorageLayout::new(dir.path());
        let root = layout.build("sb-1").await.unwrap();

        assert_eq!(root, dir.path().join("sb-1"));
        for category in StorageCategory::ALL {
            assert!(root.join(category.dir_name()).is_dir(), "{category} missing");
        }
        assert!(layout.is_complete("sb-1").await.unwrap());
        // No scratch left behind.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_build_refuses_existing_root() {
        let dir = TempDir::new().unwrap();
        let layout = StorageLayout::new(dir.path());
        layout.build("sb-1").await.unwrap();
        std::fs::write(dir.path().join("sb-1/data/keep.db"), b"x").unwrap();

        let err = layout.build("sb-1").await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(_)));
        assert!(dir.path().join("sb-1/data/keep.db").exists());
    }

    #[tokio::test]
    async fn test_build_failure_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        // Base is a file, so nothing can be created under it.
        let base = dir.path().join("not-a-dir");
        std::fs::write(&base, b"").unwrap();
        let layout = StorageLayout::new(&base);
        assert!(layout.build("sb-1").await.is_err());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_rejects_unsafe_keys() {
        let layout = StorageLayout::new("/tmp/unused");
        for key in ["", "..", "../x", "a/b", ".staging-x"] {
            assert!(matches!(
                layout.build(key).await,
                Err(StorageError::InvalidPath(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let layout = StorageLayout::new(dir.path());
        layout.build("sb-1").await.unwrap();
        assert!(layout.clear("sb-1").await.unwrap());
        assert!(!layout.clear("sb-1").await.unwrap());
        assert!(!layout.exists("sb-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_repair_recreates_missing_dirs() {
        let dir = TempDir::new().unwrap();
        let layout = StorageLayout::new(dir.path());
        let root = layout.build("sb-1").await.unwrap();
        std::fs::remove_dir(root.join("cache")).unwrap();
        std::fs::remove_dir(root.join("media")).unwrap();

        assert!(!layout.is_complete("sb-1").await.unwrap());
        let repaired = layout.repair("sb-1").await.unwrap();
        assert_eq!(repaired, vec![StorageCategory::Cache, StorageCategory::Media]);
        assert!(layout.is_complete("sb-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_roots_and_sweep() {
        let dir = TempDir::new().unwrap();
        let layout = StorageLayout::new(dir.path());
        layout.build("b").await.unwrap();
        layout.build("a").await.unwrap();
        std::fs::create_dir(dir.path().join(".staging-c-0000")).unwrap();
        std::fs::write(dir.path().join("stray.txt"), b"").unwrap();

        assert_eq!(layout.list_roots().await.unwrap(), vec!["a", "b"]);
        assert_eq!(layout.sweep_scratch(|_| false).await.unwrap(), 1);
        assert!(!dir.path().join(".staging-c-0000").exists());
    }

    #[tokio::test]
    async fn test_sweep_keeps_scratch_of_busy_keys() {
        let dir = TempDir::new().unwrap();
        let layout = StorageLayout::new(dir.path());
        let busy = layout.scratch_dir(STAGING_PREFIX, "app-1700000000000-ab12");
        let idle = layout.restore_scratch("app-1700000000001-cd34");
        std::fs::create_dir_all(&busy).unwrap();
        std::fs::create_dir_all(&idle).unwrap();

        let removed = layout
            .sweep_scratch(|key| key == "app-1700000000000-ab12")
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(busy.is_dir());
        assert!(!idle.exists());
    }

    #[test]
    fn test_scratch_key() {
        assert_eq!(scratch_key(".staging-app-17-ab-00ff00ff00ff00ff"), Some("app-17-ab"));
        assert_eq!(scratch_key(".retired-c-0000"), Some("c"));
        assert_eq!(scratch_key("app-17-ab"), None);
    }
}
