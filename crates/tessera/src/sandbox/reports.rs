//! Statistics, health and maintenance operations of the engine.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::error::{EngineError, EngineResult};
use crate::identity::IdentitySummary;
use crate::policy::{AccountingRecord, ResourceLimits, optimization_state};
use crate::storage::{StorageCategory, UsageReport, WalkBudget, usage};

use super::artifacts::EXPECTED_ARTIFACTS;
use super::engine::{SandboxEngine, walk_error};
use super::health::{HealthInputs, HealthReport};
use super::models::{Sandbox, SandboxFilter};
use super::store::count_by_status;

/// Per-sandbox statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxStats {
    pub sandbox: Sandbox,
    pub usage: UsageReport,
    pub limits: ResourceLimits,
    /// Usage as a fraction of the storage ceiling.
    pub storage_ratio: f64,
    pub identity: Option<IdentitySummary>,
    pub policy_present: bool,
    pub policy_applied_at: Option<String>,
    pub encryption_key_present: bool,
    pub artifacts_present: usize,
    pub artifacts_expected: usize,
    pub archive_count: usize,
    pub session_count: usize,
    pub accounting: AccountingRecord,
    pub needs_optimization: bool,
}

/// Totals across the registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalStats {
    pub total: u64,
    pub by_status: BTreeMap<String, u64>,
    /// Keys of removed sandboxes.
    pub retired: u64,
    pub total_launches: i64,
    pub total_runtime_secs: i64,
    pub total_storage_bytes: u64,
    /// Sandboxes whose storage could not be measured.
    pub unmeasured: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizeReport {
    pub sandbox_key: String,
    pub purged_files: u64,
    pub purged_bytes: u64,
    /// Entries that could not be inspected or removed. Logged, not fatal.
    pub failures: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub stopped: Vec<String>,
    pub torn_down: Vec<String>,
    pub repaired: Vec<String>,
    pub artifacts_rewritten: Vec<String>,
    pub orphans_removed: Vec<String>,
    pub scratch_removed: usize,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.stopped.is_empty()
            && self.torn_down.is_empty()
            && self.repaired.is_empty()
            && self.artifacts_rewritten.is_empty()
            && self.orphans_removed.is_empty()
            && self.scratch_removed == 0
    }
}

#[derive(Debug, Default)]
struct PurgeOutcome {
    files: u64,
    bytes: u64,
    failures: u64,
}

/// Delete regular files under `cache` last modified more than `max_age` ago.
fn purge_stale_blocking(cache: &Path, max_age: Duration) -> PurgeOutcome {
    let mut outcome = PurgeOutcome::default();
    if !cache.is_dir() {
        debug!("Cache directory {} missing, nothing to purge", cache.display());
        return outcome;
    }
    let now = SystemTime::now();

    for entry in WalkDir::new(cache).min_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable cache entry: {}", e);
                outcome.failures += 1;
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(e) => {
                warn!("Cannot stat {}: {}", entry.path().display(), e);
                outcome.failures += 1;
                continue;
            }
        };
        let stale = meta
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .is_some_and(|age| age > max_age);
        if !stale {
            continue;
        }
        match std::fs::remove_file(entry.path()) {
            Ok(()) => {
                outcome.files += 1;
                outcome.bytes += meta.len();
            }
            Err(e) => {
                warn!("Cannot purge {}: {}", entry.path().display(), e);
                outcome.failures += 1;
            }
        }
    }
    outcome
}

impl SandboxEngine {
    async fn measure(&self, key: &str, cancel: CancellationToken) -> EngineResult<UsageReport> {
        let root = self.layout.root_for(key)?;
        let budget = WalkBudget::new(cancel, self.config.usage_timeout());
        usage::measure(root, budget).await.map_err(walk_error)
    }

    /// Record a measurement without failing the caller.
    async fn note_usage(&self, key: &str, bytes: u64) {
        if let Err(e) = self.policies.record_usage(key, bytes).await {
            warn!("Failed to record usage of {}: {}", key, e);
        }
    }

    pub async fn usage(&self, key: &str) -> EngineResult<UsageReport> {
        self.usage_with(key, CancellationToken::new()).await
    }

    /// Storage usage with a per-category breakdown.
    pub async fn usage_with(&self, key: &str, cancel: CancellationToken) -> EngineResult<UsageReport> {
        let _guard = self.locks.lock(key).await;
        self.require(key).await?;
        let report = self.measure(key, cancel).await?;
        self.note_usage(key, report.total_bytes).await;
        Ok(report)
    }

    pub async fn statistics(&self, key: &str) -> EngineResult<SandboxStats> {
        let _guard = self.locks.lock(key).await;
        let sandbox = self.require(key).await?;
        let usage = self.measure(key, CancellationToken::new()).await?;
        self.note_usage(key, usage.total_bytes).await;

        let identity = self.identities.find(key).await?.map(|record| record.summary());
        let policy = self.policies.get(key).await?;
        let encryption_key_present = self.identities.has_sealing_key(key).await?;
        let artifacts_present = self.artifacts.count_valid(key).await;
        let archive_count = self.archives.list(key).await?.len();
        let session_count = self.store.sessions(key).await?.len();
        let accounting = self.policies.accounting(key).await?;
        let limits = sandbox.limits();
        let state = optimization_state(
            &accounting,
            usage.total_bytes,
            &limits,
            self.config.staleness(),
            Utc::now(),
        );

        Ok(SandboxStats {
            sandbox,
            limits,
            storage_ratio: state.storage_ratio,
            identity,
            policy_present: policy.is_some(),
            policy_applied_at: policy.map(|p| p.applied_at),
            encryption_key_present,
            artifacts_present,
            artifacts_expected: EXPECTED_ARTIFACTS,
            archive_count,
            session_count,
            accounting,
            needs_optimization: state.needs_optimization,
            usage,
        })
    }

    /// Composite 0-100 health score. Derived on every call.
    pub async fn health_report(&self, key: &str) -> EngineResult<HealthReport> {
        let _guard = self.locks.lock(key).await;
        let sandbox = self.require(key).await?;
        let usage = self.measure(key, CancellationToken::new()).await?;
        self.note_usage(key, usage.total_bytes).await;

        let accounting = self.policies.accounting(key).await?;
        let limits = sandbox.limits();
        let state = optimization_state(
            &accounting,
            usage.total_bytes,
            &limits,
            self.config.staleness(),
            Utc::now(),
        );
        let inputs = HealthInputs {
            usage_bytes: usage.total_bytes,
            storage_ceiling: limits.storage_bytes,
            artifacts_present: self.artifacts.count_valid(key).await,
            artifacts_expected: EXPECTED_ARTIFACTS,
            optimized: state.optimized,
            fresh: state.fresh,
            policy_present: self.policies.get(key).await?.is_some(),
            encryption_key_present: self.identities.has_sealing_key(key).await?,
        };
        let report = self.config.health.evaluate(key, &inputs);
        debug!("Health of {}: {} ({})", key, report.score, report.grade);
        Ok(report)
    }

    /// Purge stale cache files and record the pass. Filesystem trouble
    /// during the purge is logged and counted, never returned.
    pub async fn optimize(&self, key: &str) -> EngineResult<OptimizeReport> {
        let _guard = self.locks.lock(key).await;
        self.require(key).await?;

        let cache = self.layout.root_for(key)?.join(StorageCategory::Cache.dir_name());
        let max_age = Duration::from_secs(self.config.cache_max_age_secs);
        let outcome = match tokio::task::spawn_blocking(move || purge_stale_blocking(&cache, max_age)).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Cache purge of {} aborted: {}", key, e);
                PurgeOutcome {
                    failures: 1,
                    ..Default::default()
                }
            }
        };

        self.policies.record_optimization(key, outcome.bytes).await?;
        info!(
            "Optimized {}: purged {} files ({} bytes), {} failures",
            key, outcome.files, outcome.bytes, outcome.failures
        );
        Ok(OptimizeReport {
            sandbox_key: key.to_string(),
            purged_files: outcome.files,
            purged_bytes: outcome.bytes,
            failures: outcome.failures,
        })
    }

    pub async fn global_statistics(&self) -> EngineResult<GlobalStats> {
        let sandboxes = self.store.get_all(&SandboxFilter::default()).await?;
        let mut stats = GlobalStats {
            total: sandboxes.len() as u64,
            by_status: count_by_status(&sandboxes),
            retired: self.store.retired_count().await?,
            ..Default::default()
        };

        for sandbox in &sandboxes {
            stats.total_launches += sandbox.launch_count;
            stats.total_runtime_secs += sandbox.total_runtime_secs;
            match self.measure(&sandbox.sandbox_key, CancellationToken::new()).await {
                Ok(usage) => stats.total_storage_bytes += usage.total_bytes,
                Err(EngineError::Cancelled(reason)) => {
                    warn!("Usage walk of {} cancelled: {}", sandbox.sandbox_key, reason);
                    stats.unmeasured += 1;
                }
                Err(e) => {
                    warn!("Cannot measure {}: {}", sandbox.sandbox_key, e);
                    stats.unmeasured += 1;
                }
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn age(path: &Path, by: Duration) {
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - by).unwrap();
    }

    #[test]
    fn test_purge_removes_only_stale_files() {
        let dir = TempDir::new().unwrap();
        let cache = dir.path().join("cache");
        std::fs::create_dir_all(cache.join("http")).unwrap();
        std::fs::write(cache.join("http/old.bin"), vec![0u8; 100]).unwrap();
        std::fs::write(cache.join("fresh.bin"), vec![0u8; 10]).unwrap();
        age(&cache.join("http/old.bin"), Duration::from_secs(3 * 24 * 3600));

        let outcome = purge_stale_blocking(&cache, Duration::from_secs(24 * 3600));
        assert_eq!(outcome.files, 1);
        assert_eq!(outcome.bytes, 100);
        assert_eq!(outcome.failures, 0);
        assert!(!cache.join("http/old.bin").exists());
        assert!(cache.join("fresh.bin").exists());
        assert!(cache.join("http").is_dir());
    }

    #[test]
    fn test_purge_of_missing_cache_is_quiet() {
        let dir = TempDir::new().unwrap();
        let outcome = purge_stale_blocking(&dir.path().join("nope"), Duration::from_secs(1));
        assert_eq!(outcome.files, 0);
        assert_eq!(outcome.failures, 0);
    }

    #[test]
    fn test_reconcile_report_clean() {
        assert!(ReconcileReport::default().is_clean());
        let report = ReconcileReport {
            scratch_removed: 1,
            ..Default::default()
        };
        assert!(!report.is_clean());
    }
}
