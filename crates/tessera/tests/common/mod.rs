//! Shared harness for engine integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;
use tessera::crypto::MemoryKeyProvider;
use tessera::db::Database;
use tessera::launch::ConfiguredLauncher;
use tessera::sandbox::{EngineConfig, EngineParts, EnginePaths, Sandbox, SandboxEngine, SandboxStore};
use tessera::storage::StorageCategory;

pub struct Harness {
    pub engine: Arc<SandboxEngine>,
    pub paths: EnginePaths,
    pub db: Database,
    pub keys: Arc<MemoryKeyProvider>,
    pub dir: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(EngineConfig::default()).await
    }

    pub async fn with_config(config: EngineConfig) -> Self {
        Self::build(config, ConfiguredLauncher::new(true)).await
    }

    pub async fn build(config: EngineConfig, launcher: ConfiguredLauncher) -> Self {
        let dir = TempDir::new().unwrap();
        let db = Database::in_memory().await.unwrap();
        Self::assemble(config, launcher, dir, db, None)
    }

    /// Engine over a WAL database file with a multi-connection pool, as the
    /// CLI opens it.
    pub async fn on_disk(config: EngineConfig) -> Self {
        let dir = TempDir::new().unwrap();
        let db = Database::new(&dir.path().join("state").join("tessera.db"))
            .await
            .unwrap();
        Self::assemble(config, ConfiguredLauncher::new(true), dir, db, None)
    }

    /// Engine whose registry is `make_store` applied to the SQLite store.
    pub async fn with_store<F>(make_store: F) -> Self
    where
        F: FnOnce(Arc<dyn SandboxStore>) -> Arc<dyn SandboxStore>,
    {
        let dir = TempDir::new().unwrap();
        let db = Database::in_memory().await.unwrap();
        Self::assemble(
            EngineConfig::default(),
            ConfiguredLauncher::new(true),
            dir,
            db,
            Some(Box::new(make_store)),
        )
    }

    fn assemble(
        config: EngineConfig,
        launcher: ConfiguredLauncher,
        dir: TempDir,
        db: Database,
        wrap_store: Option<Box<dyn FnOnce(Arc<dyn SandboxStore>) -> Arc<dyn SandboxStore> + '_>>,
    ) -> Self {
        let paths = EnginePaths::under(dir.path());
        let keys = Arc::new(MemoryKeyProvider::new());
        let mut parts = EngineParts::sqlite(&db, keys.clone(), Arc::new(launcher));
        if let Some(wrap) = wrap_store {
            parts.store = wrap(parts.store);
        }
        let engine = Arc::new(SandboxEngine::new(config, &paths, parts));
        Self {
            engine,
            paths,
            db,
            keys,
            dir,
        }
    }

    pub async fn create(&self, target: &str) -> Sandbox {
        self.engine.create(target, None).await.unwrap()
    }

    pub fn root(&self, sandbox: &Sandbox) -> PathBuf {
        PathBuf::from(&sandbox.storage_root)
    }

    pub fn category(&self, sandbox: &Sandbox, category: StorageCategory) -> PathBuf {
        self.root(sandbox).join(category.dir_name())
    }

    pub fn artifact_dir(&self, key: &str) -> PathBuf {
        self.paths.artifact_dir.join(key)
    }

    /// Rows in a registry table.
    pub async fn rows(&self, table: &str) -> i64 {
        let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(self.db.pool())
            .await
            .unwrap();
        count
    }
}

/// Entries directly under `dir`, zero if it does not exist.
pub fn entries(dir: &Path) -> usize {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries.count(),
        Err(_) => 0,
    }
}

/// Write `len` bytes at `path`, creating parents.
pub fn write_bytes(path: &Path, len: usize) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, vec![0x5au8; len]).unwrap();
}
