//! Sandbox registry persistence.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use thiserror::Error;

use crate::db::WRITE_TRANSACTION;

use super::models::{Sandbox, SandboxFilter, SandboxStatus, SandboxUpdate, SessionRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    /// Key or storage root already taken, or the key was retired.
    #[error("duplicate sandbox: {0}")]
    Duplicate(String),

    #[error("sandbox not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Database(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// CRUD interface over the registry. The engine sequences calls; the store
/// only guarantees each call is atomic.
#[async_trait]
pub trait SandboxStore: Send + Sync {
    /// Insert a new row. Returns its key.
    async fn insert(&self, sandbox: &Sandbox) -> StoreResult<String>;

    async fn get_by_id(&self, sandbox_key: &str) -> StoreResult<Option<Sandbox>>;

    async fn get_all(&self, filter: &SandboxFilter) -> StoreResult<Vec<Sandbox>>;

    async fn update(&self, sandbox_key: &str, update: &SandboxUpdate) -> StoreResult<()>;

    /// Delete a row and retire its key.
    async fn delete(&self, sandbox_key: &str) -> StoreResult<()>;

    /// Whether the key belonged to a removed sandbox.
    async fn is_retired(&self, sandbox_key: &str) -> StoreResult<bool>;

    async fn retired_count(&self) -> StoreResult<u64>;

    /// Start a session. Returns the session id.
    async fn open_session(&self, sandbox_key: &str, started_at: &str) -> StoreResult<i64>;

    /// Close the open session, if any, and add its duration to the row's
    /// runtime. Returns the closed session's duration.
    async fn close_session(&self, sandbox_key: &str, ended_at: &str) -> StoreResult<Option<i64>>;

    async fn sessions(&self, sandbox_key: &str) -> StoreResult<Vec<SessionRecord>>;
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn seconds_between(start: &str, end: &str) -> i64 {
    match (
        DateTime::parse_from_rfc3339(start),
        DateTime::parse_from_rfc3339(end),
    ) {
        (Ok(start), Ok(end)) => (end.with_timezone(&Utc) - start.with_timezone(&Utc))
            .num_seconds()
            .max(0),
        _ => 0,
    }
}

const SELECT_SANDBOX: &str = r#"
    SELECT sandbox_key, target_app_ref, display_label, storage_root, status,
           memory_ceiling_bytes, storage_ceiling_bytes, concurrency_ceiling,
           launch_count, total_runtime_secs, created_at, last_active_at, last_launched_at
    FROM sandboxes
"#;

/// SQLite-backed registry.
#[derive(Debug, Clone)]
pub struct SqliteSandboxStore {
    pool: SqlitePool,
}

impl SqliteSandboxStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SandboxStore for SqliteSandboxStore {
    async fn insert(&self, sandbox: &Sandbox) -> StoreResult<String> {
        let mut tx = self
            .pool
            .begin_with(WRITE_TRANSACTION)
            .await
            .context("beginning insert")?;

        let retired: Option<(String,)> =
            sqlx::query_as("SELECT sandbox_key FROM retired_sandbox_keys WHERE sandbox_key = ?")
                .bind(&sandbox.sandbox_key)
                .fetch_optional(&mut *tx)
                .await
                .context("checking retired keys")?;
        if retired.is_some() {
            return Err(StoreError::Duplicate(sandbox.sandbox_key.clone()));
        }

        let result = sqlx::query(
            r#"
            INSERT INTO sandboxes (
                sandbox_key, target_app_ref, display_label, storage_root, status,
                memory_ceiling_bytes, storage_ceiling_bytes, concurrency_ceiling,
                launch_count, total_runtime_secs, created_at, last_active_at, last_launched_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&sandbox.sandbox_key)
        .bind(&sandbox.target_app_ref)
        .bind(&sandbox.display_label)
        .bind(&sandbox.storage_root)
        .bind(sandbox.status.to_string())
        .bind(sandbox.memory_ceiling_bytes)
        .bind(sandbox.storage_ceiling_bytes)
        .bind(sandbox.concurrency_ceiling)
        .bind(sandbox.launch_count)
        .bind(sandbox.total_runtime_secs)
        .bind(&sandbox.created_at)
        .bind(&sandbox.last_active_at)
        .bind(&sandbox.last_launched_at)
        .execute(&mut *tx)
        .await;

        match result {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(StoreError::Duplicate(sandbox.sandbox_key.clone()));
            }
            Err(e) => return Err(anyhow::Error::new(e).context("inserting sandbox").into()),
        }

        tx.commit().await.context("committing insert")?;
        debug!("Inserted registry row {}", sandbox.sandbox_key);
        Ok(sandbox.sandbox_key.clone())
    }

    async fn get_by_id(&self, sandbox_key: &str) -> StoreResult<Option<Sandbox>> {
        let sandbox = sqlx::query_as::<_, Sandbox>(&format!("{SELECT_SANDBOX} WHERE sandbox_key = ?"))
            .bind(sandbox_key)
            .fetch_optional(&self.pool)
            .await
            .context("fetching sandbox")?;
        Ok(sandbox)
    }

    async fn get_all(&self, filter: &SandboxFilter) -> StoreResult<Vec<Sandbox>> {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(SELECT_SANDBOX);
        let mut joiner = " WHERE ";
        if let Some(target) = &filter.target_app_ref {
            query.push(joiner).push("target_app_ref = ").push_bind(target);
            joiner = " AND ";
        }
        if let Some(status) = filter.status {
            query.push(joiner).push("status = ").push_bind(status.to_string());
        }
        query.push(" ORDER BY created_at, sandbox_key");

        let sandboxes = query
            .build_query_as::<Sandbox>()
            .fetch_all(&self.pool)
            .await
            .context("listing sandboxes")?;
        Ok(sandboxes)
    }

    async fn update(&self, sandbox_key: &str, update: &SandboxUpdate) -> StoreResult<()> {
        if update.is_empty() {
            return match self.get_by_id(sandbox_key).await? {
                Some(_) => Ok(()),
                None => Err(StoreError::NotFound(sandbox_key.to_string())),
            };
        }

        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE sandboxes SET ");
        {
            let mut set = query.separated(", ");
            if let Some(label) = &update.display_label {
                set.push("display_label = ").push_bind_unseparated(label.clone());
            }
            if let Some(status) = update.status {
                set.push("status = ").push_bind_unseparated(status.to_string());
            }
            if let Some(limits) = &update.limits {
                set.push("memory_ceiling_bytes = ")
                    .push_bind_unseparated(i64::try_from(limits.memory_bytes).unwrap_or(i64::MAX));
                set.push("storage_ceiling_bytes = ")
                    .push_bind_unseparated(i64::try_from(limits.storage_bytes).unwrap_or(i64::MAX));
                set.push("concurrency_ceiling = ")
                    .push_bind_unseparated(i64::from(limits.max_concurrency));
            }
            if let Some(at) = &update.last_active_at {
                set.push("last_active_at = ").push_bind_unseparated(at.clone());
            }
            if let Some(at) = &update.last_launched_at {
                set.push("last_launched_at = ").push_bind_unseparated(at.clone());
            }
            if let Some(launches) = update.launches {
                set.push("launch_count = launch_count + ")
                    .push_bind_unseparated(launches);
            }
        }
        query.push(" WHERE sandbox_key = ").push_bind(sandbox_key);

        let result = query
            .build()
            .execute(&self.pool)
            .await
            .context("updating sandbox")?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(sandbox_key.to_string()));
        }
        Ok(())
    }

    async fn delete(&self, sandbox_key: &str) -> StoreResult<()> {
        let mut tx = self
            .pool
            .begin_with(WRITE_TRANSACTION)
            .await
            .context("beginning delete")?;

        let result = sqlx::query("DELETE FROM sandboxes WHERE sandbox_key = ?")
            .bind(sandbox_key)
            .execute(&mut *tx)
            .await
            .context("deleting sandbox")?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(sandbox_key.to_string()));
        }

        sqlx::query(
            "INSERT INTO retired_sandbox_keys (sandbox_key, removed_at) VALUES (?, ?) ON CONFLICT(sandbox_key) DO NOTHING",
        )
        .bind(sandbox_key)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await
        .context("retiring sandbox key")?;

        sqlx::query("DELETE FROM sandbox_sessions WHERE sandbox_key = ?")
            .bind(sandbox_key)
            .execute(&mut *tx)
            .await
            .context("deleting sandbox sessions")?;

        tx.commit().await.context("committing delete")?;
        debug!("Deleted registry row {} and retired its key", sandbox_key);
        Ok(())
    }

    async fn is_retired(&self, sandbox_key: &str) -> StoreResult<bool> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT sandbox_key FROM retired_sandbox_keys WHERE sandbox_key = ?")
                .bind(sandbox_key)
                .fetch_optional(&self.pool)
                .await
                .context("checking retired key")?;
        Ok(row.is_some())
    }

    async fn retired_count(&self) -> StoreResult<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM retired_sandbox_keys")
            .fetch_one(&self.pool)
            .await
            .context("counting retired keys")?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn open_session(&self, sandbox_key: &str, started_at: &str) -> StoreResult<i64> {
        let result = sqlx::query("INSERT INTO sandbox_sessions (sandbox_key, started_at) VALUES (?, ?)")
            .bind(sandbox_key)
            .bind(started_at)
            .execute(&self.pool)
            .await
            .context("opening session")?;
        Ok(result.last_insert_rowid())
    }

    async fn close_session(&self, sandbox_key: &str, ended_at: &str) -> StoreResult<Option<i64>> {
        let mut tx = self
            .pool
            .begin_with(WRITE_TRANSACTION)
            .await
            .context("beginning session close")?;

        let open: Option<(i64, String)> = sqlx::query_as(
            r#"
            SELECT id, started_at FROM sandbox_sessions
            WHERE sandbox_key = ? AND ended_at IS NULL
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(sandbox_key)
        .fetch_optional(&mut *tx)
        .await
        .context("finding open session")?;

        let Some((id, started_at)) = open else {
            return Ok(None);
        };
        let duration = seconds_between(&started_at, ended_at);

        // Any older dangling sessions are closed with zero runtime.
        sqlx::query(
            "UPDATE sandbox_sessions SET ended_at = ?, duration_secs = 0 WHERE sandbox_key = ? AND ended_at IS NULL AND id <> ?",
        )
        .bind(ended_at)
        .bind(sandbox_key)
        .bind(id)
        .execute(&mut *tx)
        .await
        .context("closing dangling sessions")?;

        sqlx::query("UPDATE sandbox_sessions SET ended_at = ?, duration_secs = ? WHERE id = ?")
            .bind(ended_at)
            .bind(duration)
            .bind(id)
            .execute(&mut *tx)
            .await
            .context("closing session")?;

        sqlx::query("UPDATE sandboxes SET total_runtime_secs = total_runtime_secs + ? WHERE sandbox_key = ?")
            .bind(duration)
            .bind(sandbox_key)
            .execute(&mut *tx)
            .await
            .context("adding session runtime")?;

        tx.commit().await.context("committing session close")?;
        Ok(Some(duration))
    }

    async fn sessions(&self, sandbox_key: &str) -> StoreResult<Vec<SessionRecord>> {
        let sessions = sqlx::query_as::<_, SessionRecord>(
            r#"
            SELECT id, sandbox_key, started_at, ended_at, duration_secs
            FROM sandbox_sessions
            WHERE sandbox_key = ?
            ORDER BY id
            "#,
        )
        .bind(sandbox_key)
        .fetch_all(&self.pool)
        .await
        .context("listing sessions")?;
        Ok(sessions)
    }
}

/// Count rows per status, including zero entries for every stored status.
pub fn count_by_status(sandboxes: &[Sandbox]) -> std::collections::BTreeMap<String, u64> {
    let mut counts: std::collections::BTreeMap<String, u64> = SandboxStatus::ALL
        .iter()
        .filter(|s| **s != SandboxStatus::Removed)
        .map(|s| (s.to_string(), 0))
        .collect();
    for sandbox in sandboxes {
        *counts.entry(sandbox.status.to_string()).or_default() += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn sample(key: &str, target: &str) -> Sandbox {
        let now = Utc::now().to_rfc3339();
        Sandbox {
            sandbox_key: key.to_string(),
            target_app_ref: target.to_string(),
            display_label: target.to_string(),
            storage_root: format!("/srv/tessera/{key}"),
            status: SandboxStatus::Created,
            memory_ceiling_bytes: 1,
            storage_ceiling_bytes: 1,
            concurrency_ceiling: 1,
            launch_count: 0,
            total_runtime_secs: 0,
            created_at: now.clone(),
            last_active_at: now,
            last_launched_at: None,
        }
    }

    async fn store() -> SqliteSandboxStore {
        let db = Database::in_memory().await.unwrap();
        SqliteSandboxStore::new(db.pool().clone())
    }

    #[tokio::test]
    async fn test_insert_get_and_duplicate() {
        let store = store().await;
        assert_eq!(store.insert(&sample("a", "app")).await.unwrap(), "a");
        assert_eq!(store.get_by_id("a").await.unwrap().unwrap().target_app_ref, "app");
        assert!(matches!(
            store.insert(&sample("a", "app")).await,
            Err(StoreError::Duplicate(_))
        ));
        assert!(store.get_by_id("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_storage_root_rejected() {
        let store = store().await;
        store.insert(&sample("a", "app")).await.unwrap();
        let mut clash = sample("b", "app");
        clash.storage_root = "/srv/tessera/a".into();
        assert!(matches!(store.insert(&clash).await, Err(StoreError::Duplicate(_))));
    }

    #[tokio::test]
    async fn test_delete_retires_key() {
        let store = store().await;
        store.insert(&sample("a", "app")).await.unwrap();
        store.delete("a").await.unwrap();
        assert!(store.is_retired("a").await.unwrap());
        assert!(matches!(store.delete("a").await, Err(StoreError::NotFound(_))));
        assert!(matches!(
            store.insert(&sample("a", "app")).await,
            Err(StoreError::Duplicate(_))
        ));
        assert_eq!(store.retired_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_filtered_listing() {
        let store = store().await;
        store.insert(&sample("a", "one")).await.unwrap();
        store.insert(&sample("b", "two")).await.unwrap();
        store.insert(&sample("c", "one")).await.unwrap();
        store
            .update("c", &SandboxUpdate::status(SandboxStatus::Configured, "t"))
            .await
            .unwrap();

        assert_eq!(store.get_all(&SandboxFilter::default()).await.unwrap().len(), 3);
        assert_eq!(store.get_all(&SandboxFilter::by_target("one")).await.unwrap().len(), 2);
        let both = SandboxFilter {
            target_app_ref: Some("one".into()),
            status: Some(SandboxStatus::Configured),
        };
        let rows = store.get_all(&both).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].sandbox_key, "c");
    }

    #[tokio::test]
    async fn test_partial_update() {
        let store = store().await;
        store.insert(&sample("a", "app")).await.unwrap();
        let update = SandboxUpdate {
            display_label: Some("Work".into()),
            launches: Some(1),
            ..Default::default()
        };
        store.update("a", &update).await.unwrap();
        store.update("a", &update).await.unwrap();
        let row = store.get_by_id("a").await.unwrap().unwrap();
        assert_eq!(row.display_label, "Work");
        assert_eq!(row.launch_count, 2);
        assert_eq!(row.status, SandboxStatus::Created);

        assert!(matches!(
            store.update("missing", &update).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.update("missing", &SandboxUpdate::default()).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_sessions_accumulate_runtime() {
        let store = store().await;
        store.insert(&sample("a", "app")).await.unwrap();

        assert_eq!(store.close_session("a", "2026-01-01T00:00:00Z").await.unwrap(), None);

        store.open_session("a", "2026-01-01T00:00:00Z").await.unwrap();
        let duration = store.close_session("a", "2026-01-01T00:01:30Z").await.unwrap();
        assert_eq!(duration, Some(90));

        store.open_session("a", "2026-01-01T01:00:00Z").await.unwrap();
        store.close_session("a", "2026-01-01T01:00:10Z").await.unwrap();

        let row = store.get_by_id("a").await.unwrap().unwrap();
        assert_eq!(row.total_runtime_secs, 100);
        let sessions = store.sessions("a").await.unwrap();
        assert_eq!(sessions.len(), 2);
        assert!(sessions.iter().all(|s| s.ended_at.is_some()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_on_file_database() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Database::new(&dir.path().join("registry.db")).await.unwrap();
        let store = SqliteSandboxStore::new(db.pool().clone());

        let tasks: Vec<_> = (0..40)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    let key = format!("sb-{i}");
                    store.insert(&sample(&key, "app")).await?;
                    store.open_session(&key, "2026-01-01T00:00:00Z").await?;
                    store.close_session(&key, "2026-01-01T00:00:05Z").await?;
                    if i % 2 == 0 {
                        store.delete(&key).await?;
                    }
                    Ok::<_, StoreError>(())
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let rows = store.get_all(&SandboxFilter::default()).await.unwrap();
        assert_eq!(rows.len(), 20);
        assert!(rows.iter().all(|row| row.total_runtime_secs == 5));
        assert_eq!(store.retired_count().await.unwrap(), 20);
    }

    #[test]
    fn test_count_by_status() {
        let mut running = sample("b", "app");
        running.status = SandboxStatus::Running;
        let counts = count_by_status(&[sample("a", "app"), running]);
        assert_eq!(counts["created"], 1);
        assert_eq!(counts["running"], 1);
        assert_eq!(counts["stopped"], 0);
        assert!(!counts.contains_key("removed"));
    }
}
