//! Recursive size accounting for storage trees.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use walkdir::WalkDir;

use super::error::{StorageError, StorageResult};

/// Bucket for files sitting directly in the root or in unknown folders.
pub const OTHER_CATEGORY: &str = "other";

/// Cancellation and deadline for a long filesystem walk.
#[derive(Debug, Clone)]
pub struct WalkBudget {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl WalkBudget {
    pub fn new(cancel: CancellationToken, timeout: Option<Duration>) -> Self {
        Self {
            cancel,
            deadline: timeout.map(|t| Instant::now() + t),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(CancellationToken::new(), None)
    }

    pub fn check(&self) -> StorageResult<()> {
        if self.cancel.is_cancelled() {
            return Err(StorageError::Cancelled("cancelled by caller".to_string()));
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(StorageError::Cancelled("deadline exceeded".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryUsage {
    pub bytes: u64,
    pub files: u64,
}

/// Result of walking one tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageReport {
    pub total_bytes: u64,
    pub file_count: u64,
    /// Directories below the root, not counting the root itself.
    pub dir_count: u64,
    pub categories: BTreeMap<String, CategoryUsage>,
    /// Entries that could not be read and are missing from the totals.
    #[serde(default)]
    pub skipped: u64,
}

/// Walk `root` on the blocking pool.
pub async fn measure(root: PathBuf, budget: WalkBudget) -> StorageResult<UsageReport> {
    tokio::task::spawn_blocking(move || measure_blocking(&root, &budget))
        .await
        .map_err(|e| StorageError::Io(std::io::Error::other(e)))?
}

pub fn measure_blocking(root: &Path, budget: &WalkBudget) -> StorageResult<UsageReport> {
    if !root.is_dir() {
        return Err(StorageError::NotFound(root.display().to_string()));
    }

    let mut report = UsageReport::default();
    for entry in WalkDir::new(root).min_depth(1) {
        budget.check()?;
        // Entries can vanish or be unreadable mid-walk; count and skip them.
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(root = %root.display(), error = %e, "skipping unreadable entry");
                report.skipped += 1;
                continue;
            }
        };
        let file_type = entry.file_type();
        if file_type.is_dir() {
            report.dir_count += 1;
            continue;
        }
        if !file_type.is_file() {
            continue;
        }
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "cannot stat file");
                report.skipped += 1;
                continue;
            }
        };

        let category = entry
            .path()
            .strip_prefix(root)
            .ok()
            .and_then(|rel| {
                let mut parts = rel.components();
                let first = parts.next()?;
                // A file directly in the root has no category directory.
                parts.next()?;
                Some(first.as_os_str().to_string_lossy().to_string())
            })
            .filter(|name| super::StorageCategory::from_dir_name(name).is_some())
            .unwrap_or_else(|| OTHER_CATEGORY.to_string());

        let bucket = report.categories.entry(category).or_default();
        bucket.bytes += meta.len();
        bucket.files += 1;
        report.total_bytes += meta.len();
        report.file_count += 1;
    }
    Ok(report)
}
