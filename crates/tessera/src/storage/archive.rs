//! Snapshot and restore of sandbox storage trees.
//!
//! Archives are deflate zip files under `<archive_dir>/<sandbox_key>/`, named
//! by UTC timestamp. Each carries a manifest entry binding it to one sandbox.
//! Snapshots are written to a temp file and renamed into place, restores are
//! extracted into a scratch tree and swapped in, so a cancelled or failed
//! operation never replaces the current state.

use std::io::{Seek, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use super::error::{ArchiveError, StorageError};
use super::layout::{LAYOUT_VERSION, StorageCategory, StorageLayout};
use super::usage::{self, WalkBudget};

/// Name of the manifest entry inside every archive.
pub const MANIFEST_ENTRY: &str = ".tessera-archive.json";

/// Archive format written by this build.
pub const ARCHIVE_FORMAT: u32 = 1;

const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%.3fZ";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveManifest {
    pub format: u32,
    pub sandbox_key: String,
    pub layout_version: u32,
    pub created_at: String,
}

/// A stored archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveHandle {
    pub sandbox_key: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Timestamp taken from the file name.
    pub created_at: String,
}

/// Archive settings.
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    pub archive_dir: PathBuf,
    /// Snapshots are refused above this many bytes of live usage.
    pub max_bytes: u64,
    pub timeout: Option<Duration>,
}

/// Snapshot/restore service over a [`StorageLayout`].
#[derive(Debug, Clone)]
pub struct ArchiveService {
    layout: StorageLayout,
    config: ArchiveConfig,
}

fn join_error(e: tokio::task::JoinError) -> ArchiveError {
    ArchiveError::Io(std::io::Error::other(e))
}

fn cancelled(e: StorageError) -> ArchiveError {
    match e {
        StorageError::Cancelled(reason) => ArchiveError::Cancelled(reason),
        other => ArchiveError::Storage(other),
    }
}

impl ArchiveService {
    pub fn new(layout: StorageLayout, config: ArchiveConfig) -> Self {
        Self { layout, config }
    }

    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    fn dir_for(&self, key: &str) -> Result<PathBuf, ArchiveError> {
        super::layout::validate_key(key)?;
        Ok(self.config.archive_dir.join(key))
    }

    pub async fn snapshot(&self, key: &str) -> Result<ArchiveHandle, ArchiveError> {
        self.snapshot_with(key, CancellationToken::new()).await
    }

    /// Serialize the live tree into a new archive.
    pub async fn snapshot_with(&self, key: &str, cancel: CancellationToken) -> Result<ArchiveHandle, ArchiveError> {
        let root = self.layout.root_for(key)?;
        if !tokio::fs::try_exists(&root).await? {
            return Err(StorageError::NotFound(key.to_string()).into());
        }
        let budget = WalkBudget::new(cancel, self.config.timeout);

        let report = usage::measure(root.clone(), budget.clone()).await.map_err(cancelled)?;
        if report.total_bytes > self.config.max_bytes {
            return Err(ArchiveError::TooLarge {
                usage: report.total_bytes,
                ceiling: self.config.max_bytes,
            });
        }

        let dir = self.dir_for(key)?;
        let manifest = ArchiveManifest {
            format: ARCHIVE_FORMAT,
            sandbox_key: key.to_string(),
            layout_version: LAYOUT_VERSION,
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        let key_owned = key.to_string();
        let handle = tokio::task::spawn_blocking(move || {
            write_archive_blocking(&root, &dir, &key_owned, &manifest, &budget)
        })
        .await
        .map_err(join_error)??;

        info!(
            sandbox_key = key,
            archive = %handle.path.display(),
            bytes = handle.size_bytes,
            "snapshot written"
        );
        Ok(handle)
    }

    pub async fn restore(&self, key: &str, archive: &Path) -> Result<(), ArchiveError> {
        self.restore_with(key, archive, CancellationToken::new()).await
    }

    /// Replace the live tree with the archive's contents.
    ///
    /// The archive is fully validated before anything is touched, then
    /// extracted into a scratch tree that is swapped in at the end.
    pub async fn restore_with(&self, key: &str, archive: &Path, cancel: CancellationToken) -> Result<(), ArchiveError> {
        let root = self.layout.root_for(key)?;
        let scratch = self.layout.restore_scratch(key);
        let retired = self.layout.retired_scratch(key);
        let base = self.layout.base().to_path_buf();
        let archive = archive.to_path_buf();
        let key_owned = key.to_string();
        let budget = WalkBudget::new(cancel, self.config.timeout);

        tokio::task::spawn_blocking(move || -> Result<(), ArchiveError> {
            let entries = validate_archive_blocking(&archive, &key_owned)?;
            debug!(sandbox_key = %key_owned, entries, "archive validated");

            std::fs::create_dir_all(&base)?;
            if let Err(e) = extract_blocking(&archive, &scratch, &budget) {
                let _ = std::fs::remove_dir_all(&scratch);
                return Err(e);
            }
            swap_in_blocking(&root, &scratch, &retired)
        })
        .await
        .map_err(join_error)??;

        info!(sandbox_key = key, "storage restored from archive");
        Ok(())
    }

    /// Archives for a key, oldest first.
    pub async fn list(&self, key: &str) -> Result<Vec<ArchiveHandle>, ArchiveError> {
        let dir = self.dir_for(key)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut handles = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(stem) = name.strip_suffix(".zip") else {
                continue;
            };
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            handles.push(ArchiveHandle {
                sandbox_key: key.to_string(),
                path: entry.path(),
                size_bytes: meta.len(),
                created_at: stem.split('_').next().unwrap_or(stem).to_string(),
            });
        }
        handles.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(handles)
    }

    /// Delete every archive for a key.
    pub async fn purge(&self, key: &str) -> Result<usize, ArchiveError> {
        let count = self.list(key).await?.len();
        match tokio::fs::remove_dir_all(self.dir_for(key)?).await {
            Ok(()) => Ok(count),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

fn relative_name(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

fn write_archive_blocking(
    root: &Path,
    dir: &Path,
    key: &str,
    manifest: &ArchiveManifest,
    budget: &WalkBudget,
) -> Result<ArchiveHandle, ArchiveError> {
    std::fs::create_dir_all(dir)?;
    // Dropping the temp file on any early return deletes it.
    let tmp = tempfile::NamedTempFile::new_in(dir)?;
    let mut zip = ZipWriter::new(tmp.reopen()?);
    let options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(0o644);

    zip.start_file(MANIFEST_ENTRY, options)?;
    zip.write_all(&serde_json::to_vec_pretty(manifest).map_err(std::io::Error::other)?)?;

    let walker = WalkDir::new(root).min_depth(1).sort_by_file_name();
    for entry in walker {
        budget.check().map_err(cancelled)?;
        let entry = entry.map_err(|e| ArchiveError::Io(std::io::Error::other(e)))?;
        let Some(name) = relative_name(root, entry.path()) else {
            continue;
        };
        if entry.file_type().is_dir() {
            zip.add_directory(format!("{name}/"), options.unix_permissions(0o755))?;
        } else if entry.file_type().is_file() {
            zip.start_file(name, options)?;
            let mut input = std::fs::File::open(entry.path())?;
            std::io::copy(&mut input, &mut zip)?;
        }
    }

    let mut file = zip.finish()?;
    file.flush()?;
    file.sync_all()?;
    let size_bytes = file.seek(std::io::SeekFrom::End(0))?;

    let stamp = chrono::Utc::now().format(TIMESTAMP_FORMAT).to_string();
    let mut tmp = tmp;
    let mut counter = 0u32;
    loop {
        let name = if counter == 0 {
            format!("{stamp}.zip")
        } else {
            format!("{stamp}_{counter:03}.zip")
        };
        let path = dir.join(&name);
        match tmp.persist_noclobber(&path) {
            Ok(_) => {
                return Ok(ArchiveHandle {
                    sandbox_key: key.to_string(),
                    path,
                    size_bytes,
                    created_at: stamp,
                });
            }
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists && counter < 1000 => {
                tmp = e.file;
                counter += 1;
            }
            Err(e) => return Err(e.error.into()),
        }
    }
}

/// Check an archive without touching any live data. Returns the entry count.
fn validate_archive_blocking(path: &Path, key: &str) -> Result<usize, ArchiveError> {
    let meta = match std::fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ArchiveError::NotFound(path.display().to_string()));
        }
        Err(e) => return Err(e.into()),
    };
    if !meta.is_file() || meta.len() == 0 {
        return Err(ArchiveError::Invalid("archive is empty".to_string()));
    }

    let file = std::fs::File::open(path)?;
    let mut archive = ZipArchive::new(file).map_err(|e| ArchiveError::Invalid(e.to_string()))?;
    if archive.is_empty() {
        return Err(ArchiveError::Invalid("archive has no entries".to_string()));
    }

    let manifest: ArchiveManifest = {
        let entry = archive
            .by_name(MANIFEST_ENTRY)
            .map_err(|_| ArchiveError::Invalid("archive manifest missing".to_string()))?;
        serde_json::from_reader(entry)
            .map_err(|e| ArchiveError::Invalid(format!("archive manifest unreadable: {e}")))?
    };
    if manifest.format != ARCHIVE_FORMAT {
        return Err(ArchiveError::Invalid(format!(
            "unsupported archive format {}",
            manifest.format
        )));
    }
    if manifest.sandbox_key != key {
        return Err(ArchiveError::Invalid(format!(
            "archive belongs to sandbox {}",
            manifest.sandbox_key
        )));
    }

    for i in 0..archive.len() {
        let entry = archive
            .by_index_raw(i)
            .map_err(|e| ArchiveError::Invalid(e.to_string()))?;
        if entry.enclosed_name().is_none() {
            return Err(ArchiveError::Invalid(format!(
                "entry {} escapes the storage root",
                entry.name()
            )));
        }
    }
    Ok(archive.len())
}

fn extract_blocking(path: &Path, scratch: &Path, budget: &WalkBudget) -> Result<(), ArchiveError> {
    let file = std::fs::File::open(path)?;
    let mut archive = ZipArchive::new(file)?;
    std::fs::create_dir(scratch)?;

    for i in 0..archive.len() {
        budget.check().map_err(cancelled)?;
        let mut entry = archive.by_index(i)?;
        if entry.name() == MANIFEST_ENTRY {
            continue;
        }
        let Some(rel) = entry.enclosed_name() else {
            return Err(ArchiveError::Invalid(format!("unsafe entry {}", entry.name())));
        };
        let out = scratch.join(rel);
        if entry.is_dir() {
            std::fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut target = std::fs::File::create(&out)?;
        std::io::copy(&mut entry, &mut target)?;
    }

    for category in StorageCategory::ALL {
        std::fs::create_dir_all(scratch.join(category.dir_name()))?;
    }
    Ok(())
}

/// Swap `scratch` in as `root`, keeping the old tree until the swap is done.
fn swap_in_blocking(root: &Path, scratch: &Path, retired: &Path) -> Result<(), ArchiveError> {
    let had_root = root.exists();
    if had_root {
        if let Err(e) = std::fs::rename(root, retired) {
            let _ = std::fs::remove_dir_all(scratch);
            return Err(e.into());
        }
    }

    if let Err(e) = std::fs::rename(scratch, root) {
        if had_root {
            if let Err(undo) = std::fs::rename(retired, root) {
                warn!(error = %undo, "failed to put previous tree back after restore failure");
            }
        }
        let _ = std::fs::remove_dir_all(scratch);
        return Err(e.into());
    }

    if had_root {
        if let Err(e) = std::fs::remove_dir_all(retired) {
            warn!(error = %e, dir = %retired.display(), "failed to remove previous tree");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        layout: StorageLayout,
        service: ArchiveService,
    }

    async fn fixture(max_bytes: u64) -> Fixture {
        let dir = TempDir::new().unwrap();
        let layout = StorageLayout::new(dir.path().join("sandboxes"));
        let service = ArchiveService::new(
            layout.clone(),
            ArchiveConfig {
                archive_dir: dir.path().join("archives"),
                max_bytes,
                timeout: None,
            },
        );
        layout.build("sb-1").await.unwrap();
        Fixture {
            _dir: dir,
            layout,
            service,
        }
    }

    fn contents(root: &Path) -> BTreeMap<String, Option<Vec<u8>>> {
        WalkDir::new(root)
            .min_depth(1)
            .into_iter()
            .map(|e| e.unwrap())
            .map(|e| {
                let name = relative_name(root, e.path()).unwrap();
                let data = e.file_type().is_file().then(|| std::fs::read(e.path()).unwrap());
                (name, data)
            })
            .collect()
    }

    fn populate(root: &Path) {
        std::fs::create_dir_all(root.join("data/databases")).unwrap();
        std::fs::write(root.join("data/databases/main.db"), vec![7u8; 4096]).unwrap();
        std::fs::write(root.join("settings/prefs.xml"), b"<map/>").unwrap();
        std::fs::write(root.join("session/cookies"), b"sid=1").unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_restore_is_byte_identical() {
        let fx = fixture(10 * 1024 * 1024).await;
        let root = fx.layout.root_for("sb-1").unwrap();
        populate(&root);
        let before = contents(&root);

        let handle = fx.service.snapshot("sb-1").await.unwrap();
        assert!(handle.path.exists());
        assert!(handle.size_bytes > 0);

        fx.service.restore("sb-1", &handle.path).await.unwrap();
        assert_eq!(contents(&root), before);
    }

    #[tokio::test]
    async fn test_restore_replaces_modified_tree() {
        let fx = fixture(10 * 1024 * 1024).await;
        let root = fx.layout.root_for("sb-1").unwrap();
        populate(&root);
        let before = contents(&root);
        let handle = fx.service.snapshot("sb-1").await.unwrap();

        std::fs::write(root.join("data/new.txt"), b"later").unwrap();
        std::fs::remove_file(root.join("session/cookies")).unwrap();

        fx.service.restore("sb-1", &handle.path).await.unwrap();
        assert_eq!(contents(&root), before);
    }

    #[tokio::test]
    async fn test_snapshot_rejects_oversized_tree() {
        let fx = fixture(100).await;
        let root = fx.layout.root_for("sb-1").unwrap();
        std::fs::write(root.join("data/big"), vec![0u8; 101]).unwrap();

        let err = fx.service.snapshot("sb-1").await.unwrap_err();
        assert!(matches!(err, ArchiveError::TooLarge { usage: 101, ceiling: 100 }));
        assert!(fx.service.list("sb-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_zero_byte_archive_is_invalid_and_harmless() {
        let fx = fixture(1024).await;
        let root = fx.layout.root_for("sb-1").unwrap();
        populate(&root);
        let before = contents(&root);

        let empty = fx.layout.base().join("empty.zip");
        std::fs::write(&empty, b"").unwrap();
        let err = fx.service.restore("sb-1", &empty).await.unwrap_err();
        assert!(matches!(err, ArchiveError::Invalid(_)));
        assert_eq!(contents(&root), before);
    }

    #[tokio::test]
    async fn test_garbage_archive_is_invalid() {
        let fx = fixture(1024).await;
        let bogus = fx.layout.base().join("bogus.zip");
        std::fs::write(&bogus, b"definitely not a zip file").unwrap();
        let err = fx.service.restore("sb-1", &bogus).await.unwrap_err();
        assert!(matches!(err, ArchiveError::Invalid(_)));
        assert!(fx.layout.is_complete("sb-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_archive_for_other_sandbox_rejected() {
        let fx = fixture(10 * 1024).await;
        fx.layout.build("sb-2").await.unwrap();
        let handle = fx.service.snapshot("sb-2").await.unwrap();
        let err = fx.service.restore("sb-1", &handle.path).await.unwrap_err();
        assert!(matches!(err, ArchiveError::Invalid(msg) if msg.contains("sb-2")));
    }

    #[tokio::test]
    async fn test_archive_without_manifest_rejected() {
        let fx = fixture(1024).await;
        let path = fx.layout.base().join("plain.zip");
        let mut zip = ZipWriter::new(std::fs::File::create(&path).unwrap());
        zip.start_file("data/x", SimpleFileOptions::default()).unwrap();
        zip.write_all(b"x").unwrap();
        zip.finish().unwrap();

        let err = fx.service.restore("sb-1", &path).await.unwrap_err();
        assert!(matches!(err, ArchiveError::Invalid(msg) if msg.contains("manifest")));
    }

    #[tokio::test]
    async fn test_cancelled_snapshot_leaves_no_archive() {
        let fx = fixture(1024 * 1024).await;
        populate(&fx.layout.root_for("sb-1").unwrap());
        let token = CancellationToken::new();
        token.cancel();
        let err = fx.service.snapshot_with("sb-1", token).await.unwrap_err();
        assert!(matches!(err, ArchiveError::Cancelled(_)));
        assert!(fx.service.list("sb-1").await.unwrap().is_empty());
        let dir = fx.service.config().archive_dir.join("sb-1");
        let leftovers = std::fs::read_dir(&dir).map(|d| d.count()).unwrap_or(0);
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_cancelled_restore_keeps_live_tree() {
        let fx = fixture(1024 * 1024).await;
        let root = fx.layout.root_for("sb-1").unwrap();
        populate(&root);
        let handle = fx.service.snapshot("sb-1").await.unwrap();
        std::fs::write(root.join("data/after.txt"), b"newer").unwrap();
        let live = contents(&root);

        let token = CancellationToken::new();
        token.cancel();
        let err = fx
            .service
            .restore_with("sb-1", &handle.path, token)
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Cancelled(_)));
        assert_eq!(contents(&root), live);
        assert_eq!(fx.layout.list_roots().await.unwrap(), vec!["sb-1"]);
    }

    #[tokio::test]
    async fn test_list_orders_archives() {
        let fx = fixture(1024 * 1024).await;
        let first = fx.service.snapshot("sb-1").await.unwrap();
        let second = fx.service.snapshot("sb-1").await.unwrap();
        let listed = fx.service.list("sb-1").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].path, first.path);
        assert_eq!(listed[1].path, second.path);

        assert_eq!(fx.service.purge("sb-1").await.unwrap(), 2);
        assert!(fx.service.list("sb-1").await.unwrap().is_empty());
    }
}
