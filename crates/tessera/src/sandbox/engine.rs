//! Sandbox lifecycle engine.
//!
//! The engine composes storage, identity, registry and policy into one
//! per-sandbox contract. Every operation on a key runs under that key's
//! lock, so a `remove` racing a `launch` leaves the loser with a clean
//! `NotFound`. Registry status only advances after the filesystem and
//! identity steps it stands for have completed.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::crypto::{AesGcmSealer, KeyProvider, Sealer};
use crate::db::Database;
use crate::error::{EngineError, EngineResult};
use crate::identity::{IdentityError, IdentityGenerator, IdentityRecord, IdentityRepository, IdentityUpdate};
use crate::launch::{LaunchContext, Launcher};
use crate::policy::{
    AppliedPolicy, PolicyAccountant, PolicyDocument, PolicyRepository, PolicyVerdict, ResourceLimits,
};
use crate::storage::{
    ArchiveConfig, ArchiveError, ArchiveHandle, ArchiveService, RedirectionTable, StorageError, StorageLayout,
};

use super::artifacts::{ArtifactStore, EXPECTED_ARTIFACTS, PropertyOverlay, SandboxManifest};
use super::health::HealthConfig;
use super::key::SandboxKey;
use super::locks::KeyLocks;
use super::models::{Sandbox, SandboxFilter, SandboxStatus, SandboxUpdate, SessionRecord};
use super::reports::ReconcileReport;
use super::store::{SandboxStore, SqliteSandboxStore, StoreError};

const MIB: u64 = 1024 * 1024;

/// Engine tunables. None of the defaults are load-bearing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Limits given to every new sandbox.
    pub default_limits: ResourceLimits,
    /// Policy applied at creation.
    pub default_policy: PolicyDocument,
    /// Snapshots are refused above this much live usage.
    pub archive_max_bytes: u64,
    /// Cache files older than this are purged by `optimize`.
    pub cache_max_age_secs: u64,
    /// An optimization older than this no longer counts as fresh.
    pub optimization_staleness_days: u32,
    /// Attempts at finding an unused sandbox key.
    pub key_retry_limit: u32,
    /// Attempts at drawing identifiers nobody else holds.
    pub identity_attempts: u32,
    pub usage_timeout_secs: u64,
    pub archive_timeout_secs: u64,
    /// Snapshot storage before tearing a sandbox down.
    pub archive_on_remove: bool,
    pub health: HealthConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_limits: ResourceLimits::default(),
            default_policy: PolicyDocument::default(),
            archive_max_bytes: 100 * MIB,
            cache_max_age_secs: 24 * 60 * 60,
            optimization_staleness_days: 7,
            key_retry_limit: 8,
            identity_attempts: crate::identity::generator::DEFAULT_MAX_ATTEMPTS,
            usage_timeout_secs: 30,
            archive_timeout_secs: 300,
            archive_on_remove: false,
            health: HealthConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn usage_timeout(&self) -> Option<Duration> {
        (self.usage_timeout_secs > 0).then(|| Duration::from_secs(self.usage_timeout_secs))
    }

    pub fn archive_timeout(&self) -> Option<Duration> {
        (self.archive_timeout_secs > 0).then(|| Duration::from_secs(self.archive_timeout_secs))
    }

    pub fn staleness(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.optimization_staleness_days))
    }
}

/// Where the engine keeps things on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnginePaths {
    /// One storage root per sandbox.
    pub storage_dir: PathBuf,
    pub archive_dir: PathBuf,
    /// Config artifacts, outside the live roots.
    pub artifact_dir: PathBuf,
    /// Sealing keys for [`crate::crypto::FileKeyProvider`].
    pub key_dir: PathBuf,
}

impl EnginePaths {
    pub fn under(data_dir: &Path) -> Self {
        Self {
            storage_dir: data_dir.join("sandboxes"),
            archive_dir: data_dir.join("archives"),
            artifact_dir: data_dir.join("artifacts"),
            key_dir: data_dir.join("keys"),
        }
    }
}

/// Collaborators the engine is built from.
pub struct EngineParts {
    pub store: Arc<dyn SandboxStore>,
    pub identities: IdentityRepository,
    pub policies: PolicyRepository,
    pub keys: Arc<dyn KeyProvider>,
    pub sealer: Arc<dyn Sealer>,
    pub launcher: Arc<dyn Launcher>,
}

impl EngineParts {
    /// Everything backed by one SQLite database and the AES-GCM sealer.
    pub fn sqlite(db: &Database, keys: Arc<dyn KeyProvider>, launcher: Arc<dyn Launcher>) -> Self {
        let pool = db.pool().clone();
        Self {
            store: Arc::new(SqliteSandboxStore::new(pool.clone())),
            identities: IdentityRepository::new(pool.clone()),
            policies: PolicyRepository::new(pool),
            keys,
            sealer: Arc::new(AesGcmSealer::new()),
            launcher,
        }
    }
}

/// Steps of a creation that must be undone if a later step fails.
#[derive(Debug, Default)]
struct Rollback {
    storage: bool,
    identity: bool,
    registry: bool,
    policy: bool,
    artifacts: bool,
}

enum Allocation {
    /// The key turned out to be taken; try another.
    Collision(String),
    Failed(EngineError),
}

pub(crate) fn now() -> String {
    Utc::now().to_rfc3339()
}

pub(crate) fn walk_error(error: StorageError) -> EngineError {
    match error {
        StorageError::Cancelled(reason) => EngineError::Cancelled(reason),
        other => EngineError::Storage(other),
    }
}

/// Creates, launches, stops and removes sandboxes.
pub struct SandboxEngine {
    pub(crate) config: EngineConfig,
    pub(crate) store: Arc<dyn SandboxStore>,
    pub(crate) layout: StorageLayout,
    pub(crate) archives: ArchiveService,
    pub(crate) artifacts: ArtifactStore,
    pub(crate) identities: IdentityGenerator,
    pub(crate) policies: PolicyAccountant,
    pub(crate) launcher: Arc<dyn Launcher>,
    pub(crate) locks: KeyLocks,
}

impl std::fmt::Debug for SandboxEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxEngine")
            .field("config", &self.config)
            .field("layout", &self.layout)
            .field("artifacts", &self.artifacts)
            .finish_non_exhaustive()
    }
}

impl SandboxEngine {
    pub fn new(config: EngineConfig, paths: &EnginePaths, parts: EngineParts) -> Self {
        let layout = StorageLayout::new(&paths.storage_dir);
        let archives = ArchiveService::new(
            layout.clone(),
            ArchiveConfig {
                archive_dir: paths.archive_dir.clone(),
                max_bytes: config.archive_max_bytes,
                timeout: config.archive_timeout(),
            },
        );
        let identities = IdentityGenerator::new(parts.identities, parts.keys, parts.sealer)
            .with_max_attempts(config.identity_attempts);
        let policies = PolicyAccountant::new(parts.policies).with_default_policy(config.default_policy.clone());

        Self {
            store: parts.store,
            layout,
            archives,
            artifacts: ArtifactStore::new(&paths.artifact_dir),
            identities,
            policies,
            launcher: parts.launcher,
            locks: KeyLocks::new(),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) async fn require(&self, key: &str) -> EngineResult<Sandbox> {
        self.store
            .get_by_id(key)
            .await?
            .ok_or_else(|| EngineError::NotFound(key.to_string()))
    }

    pub(crate) async fn current_policy(&self, key: &str) -> EngineResult<PolicyDocument> {
        Ok(match self.policies.get(key).await? {
            Some(applied) => applied.document,
            None => self.policies.default_policy().clone(),
        })
    }

    /// Stored routing table, or a recomputed one if the artifact is gone.
    pub(crate) async fn redirects_for(&self, sandbox: &Sandbox) -> EngineResult<RedirectionTable> {
        let key = &sandbox.sandbox_key;
        match self.artifacts.redirects(key).await {
            Ok(Some(table)) => return Ok(table),
            Ok(None) => debug!("No stored redirection table for {}, recomputing", key),
            Err(e) => warn!("Unreadable redirection table for {}, recomputing: {}", key, e),
        }
        let root = self.layout.root_for(key)?;
        Ok(RedirectionTable::build(key, &sandbox.target_app_ref, &root))
    }

    async fn write_properties(&self, identity: &IdentityRecord) -> EngineResult<()> {
        let overlay = PropertyOverlay {
            sandbox_key: identity.sandbox_key.clone(),
            properties: identity.properties(),
        };
        self.artifacts.write_properties(&overlay).await?;
        Ok(())
    }

    async fn write_artifacts(
        &self,
        sandbox: &Sandbox,
        identity: &IdentityRecord,
        policy: &PolicyDocument,
    ) -> EngineResult<()> {
        let key = &sandbox.sandbox_key;
        let root = self.layout.root_for(key)?;
        self.artifacts
            .write_manifest(&SandboxManifest::new(key, &sandbox.target_app_ref, &root, &sandbox.created_at))
            .await?;
        self.artifacts
            .write_redirects(&RedirectionTable::build(key, &sandbox.target_app_ref, &root))
            .await?;
        self.artifacts.write_policy(key, policy).await?;
        self.write_properties(identity).await
    }

    // ========== Create ==========

    /// Allocate a fully configured sandbox for `target_app_ref`.
    ///
    /// Any partial work is rolled back before an error is returned.
    pub async fn create(&self, target_app_ref: &str, label: Option<&str>) -> EngineResult<Sandbox> {
        let target = target_app_ref.trim();
        if target.is_empty() {
            return Err(EngineError::Invalid(
                "target application reference must not be empty".to_string(),
            ));
        }

        let attempts = self.config.key_retry_limit.max(1);
        for attempt in 1..=attempts {
            let key = SandboxKey::generate(target);
            let _guard = self.locks.lock(key.as_str()).await;
            match self.allocate(key.as_str(), target, label).await {
                Ok(sandbox) => {
                    info!("Created sandbox {} for {}", sandbox.sandbox_key, target);
                    return Ok(sandbox);
                }
                Err(Allocation::Collision(reason)) => {
                    warn!(
                        "Sandbox key {} unusable ({}), attempt {}/{}",
                        key, reason, attempt, attempts
                    );
                }
                Err(Allocation::Failed(e)) => {
                    error!("Failed to create sandbox for {}: {}", target, e);
                    return Err(match e {
                        EngineError::AllocationFailed(reason) => EngineError::AllocationFailed(reason),
                        other => EngineError::AllocationFailed(format!("{other:#}")),
                    });
                }
            }
        }
        Err(EngineError::AllocationFailed(format!(
            "no unused sandbox key after {attempts} attempts"
        )))
    }

    async fn allocate(&self, key: &str, target: &str, label: Option<&str>) -> Result<Sandbox, Allocation> {
        match self.store.is_retired(key).await {
            Ok(true) => return Err(Allocation::Collision("key was retired".to_string())),
            Ok(false) => {}
            Err(e) => return Err(Allocation::Failed(e.into())),
        }

        let mut done = Rollback::default();

        let (storage, identity) = tokio::join!(
            self.layout.build(key),
            self.identities
                .generate(key, &self.policies.default_policy().sensitive_fields)
        );
        done.storage = storage.is_ok();
        // A failed generate may still have created key material.
        done.identity = !matches!(identity, Err(IdentityError::AlreadyExists(_)));

        let (root, identity) = match (storage, identity) {
            (Ok(root), Ok(identity)) => (root, identity),
            (storage, identity) => {
                let collision = matches!(storage, Err(StorageError::AlreadyExists(_)))
                    || matches!(identity, Err(IdentityError::AlreadyExists(_)));
                self.undo(key, &done).await;
                if collision {
                    return Err(Allocation::Collision("storage root or identity exists".to_string()));
                }
                let error = match (storage.err(), identity.err()) {
                    (Some(e), _) => EngineError::from(e),
                    (None, Some(e)) => EngineError::from(e),
                    (None, None) => EngineError::Internal(anyhow::anyhow!("allocation step failed")),
                };
                return Err(Allocation::Failed(error));
            }
        };

        let created_at = now();
        let limits = self.config.default_limits;
        let display_label = label
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .unwrap_or(target)
            .to_string();
        let mut sandbox = Sandbox {
            sandbox_key: key.to_string(),
            target_app_ref: target.to_string(),
            display_label,
            storage_root: root.to_string_lossy().to_string(),
            status: SandboxStatus::Created,
            memory_ceiling_bytes: i64::try_from(limits.memory_bytes).unwrap_or(i64::MAX),
            storage_ceiling_bytes: i64::try_from(limits.storage_bytes).unwrap_or(i64::MAX),
            concurrency_ceiling: i64::from(limits.max_concurrency),
            launch_count: 0,
            total_runtime_secs: 0,
            created_at: created_at.clone(),
            last_active_at: created_at,
            last_launched_at: None,
        };

        match self.store.insert(&sandbox).await {
            Ok(_) => done.registry = true,
            Err(StoreError::Duplicate(_)) => {
                self.undo(key, &done).await;
                return Err(Allocation::Collision("registry row exists".to_string()));
            }
            Err(e) => {
                self.undo(key, &done).await;
                return Err(Allocation::Failed(e.into()));
            }
        }

        if let Err(e) = self.configure(&sandbox, &identity, &mut done).await {
            self.undo(key, &done).await;
            return Err(Allocation::Failed(e));
        }

        sandbox.status = SandboxStatus::Configured;
        Ok(sandbox)
    }

    async fn configure(
        &self,
        sandbox: &Sandbox,
        identity: &IdentityRecord,
        done: &mut Rollback,
    ) -> EngineResult<()> {
        let key = &sandbox.sandbox_key;
        done.policy = true;
        let policy = self.policies.apply_default(key).await?;

        done.artifacts = true;
        self.write_artifacts(sandbox, identity, &policy).await?;

        if !self.layout.is_complete(key).await? {
            return Err(EngineError::AllocationFailed(format!(
                "storage tree for {key} is incomplete"
            )));
        }
        self.store
            .update(key, &SandboxUpdate::status(SandboxStatus::Configured, &now()))
            .await?;
        Ok(())
    }

    /// Undo creation steps in reverse. Failures are logged; the caller is
    /// already returning an error.
    async fn undo(&self, key: &str, done: &Rollback) {
        warn!("Rolling back partial sandbox {}", key);
        if done.registry {
            if let Err(e) = self.store.delete(key).await {
                error!("Rollback of registry row {} failed: {}", key, e);
            }
        }
        if done.artifacts {
            if let Err(e) = self.artifacts.remove(key).await {
                error!("Rollback of config artifacts for {} failed: {}", key, e);
            }
        }
        if done.policy {
            if let Err(e) = self.policies.remove(key).await {
                error!("Rollback of policy for {} failed: {}", key, e);
            }
        }
        if done.identity {
            if let Err(e) = self.identities.delete(key).await {
                error!("Rollback of identity for {} failed: {}", key, e);
            }
        }
        if done.storage {
            if let Err(e) = self.layout.clear(key).await {
                error!("Rollback of storage tree for {} failed: {}", key, e);
            }
        }
    }

    // ========== Launch / stop / remove ==========

    /// Move a configured or stopped sandbox to `Running` and return what a
    /// launch primitive needs to start it.
    pub async fn launch(&self, key: &str) -> EngineResult<LaunchContext> {
        let _guard = self.locks.lock(key).await;
        let sandbox = self.require(key).await?;
        match sandbox.status {
            SandboxStatus::Running => return Err(EngineError::AlreadyRunning(key.to_string())),
            SandboxStatus::Created => {
                return Err(EngineError::Invalid(format!("sandbox {key} is not configured")));
            }
            _ => {}
        }

        let entry_point = self
            .launcher
            .resolve_entry_point(&sandbox.target_app_ref)
            .await
            .ok_or_else(|| {
                EngineError::Invalid(format!("no entry point for {}", sandbox.target_app_ref))
            })?;

        let repaired = self.layout.repair(key).await?;
        if !repaired.is_empty() {
            warn!("Recreated {} missing storage areas for {}", repaired.len(), key);
        }
        let identity = self.identities.get(key).await?;
        let policy = self.current_policy(key).await?;
        let redirects = self.redirects_for(&sandbox).await?;

        let started_at = now();
        let session_id = self.store.open_session(key, &started_at).await?;
        let update = SandboxUpdate {
            status: Some(SandboxStatus::Running),
            last_active_at: Some(started_at.clone()),
            last_launched_at: Some(started_at.clone()),
            launches: Some(1),
            ..Default::default()
        };
        if let Err(e) = self.store.update(key, &update).await {
            if let Err(close) = self.store.close_session(key, &started_at).await {
                error!("Failed to close session {} of {}: {}", session_id, key, close);
            }
            return Err(e.into());
        }

        let sandbox = self.require(key).await?;
        info!(
            "Launched sandbox {} ({} via {}, session {})",
            key, sandbox.target_app_ref, entry_point.command, session_id
        );
        Ok(LaunchContext {
            storage_root: self.layout.root_for(key)?,
            limits: sandbox.limits(),
            properties: identity.properties(),
            sandbox,
            entry_point,
            session_id,
            redirects,
            identity,
            policy,
        })
    }

    async fn finish_session(&self, key: &str) -> EngineResult<()> {
        let ended_at = now();
        let duration = self.store.close_session(key, &ended_at).await?;
        self.store
            .update(key, &SandboxUpdate::status(SandboxStatus::Stopped, &ended_at))
            .await?;
        info!("Stopped sandbox {} after {}s", key, duration.unwrap_or(0));
        Ok(())
    }

    /// Stop a running sandbox. Stopping anything else is a no-op.
    pub async fn stop(&self, key: &str) -> EngineResult<Sandbox> {
        let _guard = self.locks.lock(key).await;
        let sandbox = self.require(key).await?;
        if !sandbox.is_running() {
            debug!("Stop of {} in status {} is a no-op", key, sandbox.status);
            return Ok(sandbox);
        }
        self.finish_session(key).await?;
        self.require(key).await
    }

    /// Delete storage, identity, policy, artifacts and finally the registry
    /// row. Each step tolerates already having happened.
    async fn teardown(&self, key: &str) -> EngineResult<()> {
        if self.layout.clear(key).await? {
            debug!("Cleared storage of {}", key);
        }
        self.identities.delete(key).await?;
        self.policies.remove(key).await?;
        self.artifacts.remove(key).await?;
        Ok(())
    }

    async fn delete_row(&self, key: &str) -> EngineResult<()> {
        match self.store.delete(key).await {
            Ok(()) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Tear a sandbox down completely. A second call returns `NotFound`.
    pub async fn remove(&self, key: &str) -> EngineResult<()> {
        let _guard = self.locks.lock(key).await;
        let sandbox = match self.store.get_by_id(key).await? {
            Some(sandbox) => sandbox,
            None => {
                debug!("Remove of unknown or removed sandbox {}", key);
                return Err(EngineError::NotFound(key.to_string()));
            }
        };

        if sandbox.is_running() {
            self.finish_session(key).await?;
        }

        // A failed archive never blocks removal; the sandbox is already stopped.
        if self.config.archive_on_remove {
            match self.archives.snapshot(key).await {
                Ok(handle) => info!("Archived {} to {} before removal", key, handle.path.display()),
                Err(ArchiveError::Storage(StorageError::NotFound(_))) => {
                    debug!("No storage to archive for {}", key)
                }
                Err(e) => error!("Removing {} without an archive: {}", key, e),
            }
        }

        self.teardown(key).await?;
        self.delete_row(key).await?;
        info!("Removed sandbox {}", key);
        Ok(())
    }

    // ========== Archives ==========

    pub async fn snapshot(&self, key: &str) -> EngineResult<ArchiveHandle> {
        self.snapshot_with(key, CancellationToken::new()).await
    }

    pub async fn snapshot_with(&self, key: &str, cancel: CancellationToken) -> EngineResult<ArchiveHandle> {
        let _guard = self.locks.lock(key).await;
        self.require(key).await?;
        Ok(self.archives.snapshot_with(key, cancel).await?)
    }

    pub async fn restore(&self, key: &str, archive: &Path) -> EngineResult<()> {
        self.restore_with(key, archive, CancellationToken::new()).await
    }

    /// Replace live storage with an archive. The live tree is untouched
    /// unless the archive validates and extracts completely.
    pub async fn restore_with(&self, key: &str, archive: &Path, cancel: CancellationToken) -> EngineResult<()> {
        let _guard = self.locks.lock(key).await;
        let sandbox = self.require(key).await?;
        if sandbox.is_running() {
            return Err(EngineError::AlreadyRunning(key.to_string()));
        }
        self.archives.restore_with(key, archive, cancel).await?;
        self.store
            .update(
                key,
                &SandboxUpdate {
                    last_active_at: Some(now()),
                    ..Default::default()
                },
            )
            .await?;
        info!("Restored sandbox {} from {}", key, archive.display());
        Ok(())
    }

    pub async fn list_archives(&self, key: &str) -> EngineResult<Vec<ArchiveHandle>> {
        let _guard = self.locks.lock(key).await;
        self.require(key).await?;
        Ok(self.archives.list(key).await?)
    }

    /// Delete stored archives. Works for removed sandboxes too, since their
    /// archives outlive them.
    pub async fn purge_archives(&self, key: &str) -> EngineResult<usize> {
        if self.store.get_by_id(key).await?.is_none() && !self.store.is_retired(key).await? {
            return Err(EngineError::NotFound(key.to_string()));
        }
        let purged = self.archives.purge(key).await?;
        info!("Purged {} archives of {}", purged, key);
        Ok(purged)
    }

    // ========== Registry queries ==========

    pub async fn get(&self, key: &str) -> EngineResult<Sandbox> {
        self.require(key).await
    }

    pub async fn list(&self, filter: &SandboxFilter) -> EngineResult<Vec<Sandbox>> {
        Ok(self.store.get_all(filter).await?)
    }

    /// Lifecycle status, `Removed` for retired keys.
    pub async fn status(&self, key: &str) -> EngineResult<SandboxStatus> {
        if let Some(sandbox) = self.store.get_by_id(key).await? {
            return Ok(sandbox.status);
        }
        if self.store.is_retired(key).await? {
            return Ok(SandboxStatus::Removed);
        }
        Err(EngineError::NotFound(key.to_string()))
    }

    pub async fn rename(&self, key: &str, label: &str) -> EngineResult<Sandbox> {
        let label = label.trim();
        if label.is_empty() {
            return Err(EngineError::Invalid("label must not be empty".to_string()));
        }
        let _guard = self.locks.lock(key).await;
        let update = SandboxUpdate {
            display_label: Some(label.to_string()),
            ..Default::default()
        };
        self.store.update(key, &update).await?;
        self.require(key).await
    }

    pub async fn set_limits(&self, key: &str, limits: ResourceLimits) -> EngineResult<Sandbox> {
        self.policies.check_limits(&limits)?;
        let _guard = self.locks.lock(key).await;
        let update = SandboxUpdate {
            limits: Some(limits),
            ..Default::default()
        };
        self.store.update(key, &update).await?;
        info!(
            "Set limits of {}: memory {} storage {} concurrency {}",
            key, limits.memory_bytes, limits.storage_bytes, limits.max_concurrency
        );
        self.require(key).await
    }

    pub async fn sessions(&self, key: &str) -> EngineResult<Vec<SessionRecord>> {
        let _guard = self.locks.lock(key).await;
        self.require(key).await?;
        Ok(self.store.sessions(key).await?)
    }

    pub async fn redirection_table(&self, key: &str) -> EngineResult<RedirectionTable> {
        let _guard = self.locks.lock(key).await;
        let sandbox = self.require(key).await?;
        self.redirects_for(&sandbox).await
    }

    /// Map a host path onto the sandbox's private tree.
    pub async fn resolve_path(&self, key: &str, host_path: &str) -> EngineResult<Option<PathBuf>> {
        Ok(self.redirection_table(key).await?.resolve(host_path))
    }

    // ========== Policy and identity ==========

    pub async fn policy(&self, key: &str) -> EngineResult<Option<AppliedPolicy>> {
        let _guard = self.locks.lock(key).await;
        self.require(key).await?;
        Ok(self.policies.get(key).await?)
    }

    /// Evaluate the sandbox's effective policy (attached, else default) for a
    /// host and a permission class.
    pub async fn check_policy(
        &self,
        key: &str,
        host: Option<&str>,
        permission_class: Option<&str>,
    ) -> EngineResult<PolicyVerdict> {
        let _guard = self.locks.lock(key).await;
        self.require(key).await?;
        let policy = self.current_policy(key).await?;
        Ok(policy.evaluate(host, permission_class))
    }

    /// Replace the policy wholesale. If the set of sensitive identity
    /// fields changed, the stored identity is resealed.
    ///
    /// The policy row, `policy.json` and the sealing change together: if a
    /// step fails, the earlier ones are put back before the error returns.
    pub async fn apply_policy(&self, key: &str, policy: &PolicyDocument) -> EngineResult<()> {
        let _guard = self.locks.lock(key).await;
        self.require(key).await?;
        self.policies.check_policy(policy)?;

        let previous = self.policies.get(key).await?.map(|applied| applied.document);
        let reseal = previous
            .as_ref()
            .is_none_or(|p| p.sensitive_set() != policy.sensitive_set());
        if reseal {
            self.identities.reseal(key, &policy.sensitive_fields).await?;
        }

        if let Err(e) = self.commit_policy(key, policy).await {
            self.revert_policy(key, previous.as_ref(), reseal).await;
            return Err(e);
        }
        info!("Applied policy to {}{}", key, if reseal { " (identity resealed)" } else { "" });
        Ok(())
    }

    async fn commit_policy(&self, key: &str, policy: &PolicyDocument) -> EngineResult<()> {
        self.policies.apply(key, policy).await?;
        self.artifacts.write_policy(key, policy).await?;
        Ok(())
    }

    /// Put back what a failed `apply_policy` changed. Failures are logged;
    /// the caller is already returning an error.
    async fn revert_policy(&self, key: &str, previous: Option<&PolicyDocument>, resealed: bool) {
        warn!("Reverting policy change of {}", key);
        let restored = match previous {
            Some(document) => self.policies.apply(key, document).await.map(|_| ()),
            None => self.policies.remove(key).await.map(|_| ()),
        };
        if let Err(e) = restored {
            error!("Failed to restore the policy of {}: {}", key, e);
        }

        let effective = previous.unwrap_or(self.policies.default_policy());
        if let Err(e) = self.artifacts.write_policy(key, effective).await {
            error!("Failed to restore policy.json of {}: {}", key, e);
        }
        if resealed {
            if let Err(e) = self.identities.reseal(key, &effective.sensitive_fields).await {
                error!("Failed to restore the sealing of {}: {}", key, e);
            }
        }
    }

    pub async fn identity(&self, key: &str) -> EngineResult<IdentityRecord> {
        let _guard = self.locks.lock(key).await;
        self.require(key).await?;
        Ok(self.identities.get(key).await?)
    }

    fn refuse_while_running(sandbox: &Sandbox) -> EngineResult<()> {
        if sandbox.is_running() {
            return Err(EngineError::Invalid(format!(
                "stop sandbox {} before changing its identity",
                sandbox.sandbox_key
            )));
        }
        Ok(())
    }

    pub async fn regenerate_identity(&self, key: &str) -> EngineResult<IdentityRecord> {
        let _guard = self.locks.lock(key).await;
        let sandbox = self.require(key).await?;
        Self::refuse_while_running(&sandbox)?;
        let sensitive = self.policies.sensitive_fields(key).await?;
        let record = self.identities.regenerate(key, &sensitive).await?;
        self.write_properties(&record).await?;
        Ok(record)
    }

    pub async fn update_identity(&self, key: &str, update: &IdentityUpdate) -> EngineResult<IdentityRecord> {
        let _guard = self.locks.lock(key).await;
        let sandbox = self.require(key).await?;
        Self::refuse_while_running(&sandbox)?;
        let sensitive = self.policies.sensitive_fields(key).await?;
        let record = self.identities.update(key, update, &sensitive).await?;
        self.write_properties(&record).await?;
        Ok(record)
    }

    // ========== Reconcile ==========

    /// Bring disk and registry back in line after a crash.
    ///
    /// Running rows are stopped, rows stuck in `Created` are torn down,
    /// configured trees get missing areas and artifacts back, and trees or
    /// artifacts without a registry row are deleted.
    pub async fn reconcile(&self) -> EngineResult<ReconcileReport> {
        let scratch_removed = self.layout.sweep_scratch(|key| self.locks.is_held(key)).await?;
        let mut report = ReconcileReport {
            scratch_removed,
            ..Default::default()
        };

        for listed in self.store.get_all(&SandboxFilter::default()).await? {
            let key = listed.sandbox_key;
            let _guard = self.locks.lock(&key).await;
            // The listing predates the lock; act only on the row as it is now.
            let Some(sandbox) = self.store.get_by_id(&key).await? else {
                debug!("Sandbox {} was removed while reconciling", key);
                continue;
            };
            match sandbox.status {
                SandboxStatus::Running => {
                    self.finish_session(&key).await?;
                    report.stopped.push(key);
                }
                SandboxStatus::Created => {
                    self.teardown(&key).await?;
                    self.delete_row(&key).await?;
                    warn!("Tore down half-created sandbox {}", key);
                    report.torn_down.push(key);
                }
                _ => {
                    if self.layout.exists(&key).await? {
                        if !self.layout.repair(&key).await?.is_empty() {
                            report.repaired.push(key.clone());
                        }
                    } else {
                        warn!("Storage of {} is missing, rebuilding an empty tree", key);
                        self.layout.build(&key).await?;
                        report.repaired.push(key.clone());
                    }
                    if self.artifacts.count_valid(&key).await < EXPECTED_ARTIFACTS {
                        let identity = self.identities.get(&key).await?;
                        let policy = self.current_policy(&key).await?;
                        self.write_artifacts(&sandbox, &identity, &policy).await?;
                        report.artifacts_rewritten.push(key);
                    }
                }
            }
        }

        let mut orphans: Vec<String> = self.layout.list_roots().await?;
        orphans.extend(self.artifacts.list_keys().await?);
        let orphans: HashSet<String> = orphans.into_iter().collect();
        let mut orphans: Vec<String> = orphans.into_iter().collect();
        orphans.sort();

        for key in orphans {
            let _guard = self.locks.lock(&key).await;
            if self.store.get_by_id(&key).await?.is_some() {
                continue;
            }
            self.teardown(&key).await?;
            warn!("Removed orphaned storage of {}", key);
            report.orphans_removed.push(key);
        }

        info!(
            "Reconciled: {} stopped, {} torn down, {} repaired, {} artifacts rewritten, {} orphans, {} scratch dirs",
            report.stopped.len(),
            report.torn_down.len(),
            report.repaired.len(),
            report.artifacts_rewritten.len(),
            report.orphans_removed.len(),
            report.scratch_removed
        );
        Ok(report)
    }
}
