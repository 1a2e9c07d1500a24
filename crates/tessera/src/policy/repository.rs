//! Policy and accounting database repository.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use super::models::AccountingRecord;

/// Repository for policy documents and accounting rows.
#[derive(Debug, Clone)]
pub struct PolicyRepository {
    pool: SqlitePool,
}

impl PolicyRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace the policy document of a sandbox.
    pub async fn upsert(&self, sandbox_key: &str, document: &str, applied_at: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO policies (sandbox_key, document, applied_at)
            VALUES (?, ?, ?)
            ON CONFLICT(sandbox_key) DO UPDATE SET
                document = excluded.document,
                applied_at = excluded.applied_at
            "#,
        )
        .bind(sandbox_key)
        .bind(document)
        .bind(applied_at)
        .execute(&self.pool)
        .await
        .context("upserting policy")?;
        Ok(())
    }

    /// Stored document and when it was applied.
    pub async fn get(&self, sandbox_key: &str) -> Result<Option<(String, String)>> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT document, applied_at FROM policies WHERE sandbox_key = ?")
                .bind(sandbox_key)
                .fetch_optional(&self.pool)
                .await
                .context("fetching policy")?;
        Ok(row)
    }

    pub async fn delete(&self, sandbox_key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM policies WHERE sandbox_key = ?")
            .bind(sandbox_key)
            .execute(&self.pool)
            .await
            .context("deleting policy")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn accounting(&self, sandbox_key: &str) -> Result<Option<AccountingRecord>> {
        let record = sqlx::query_as::<_, AccountingRecord>(
            r#"
            SELECT sandbox_key, optimization_count, purged_bytes_total,
                   last_optimized_at, last_usage_bytes, last_measured_at
            FROM accounting
            WHERE sandbox_key = ?
            "#,
        )
        .bind(sandbox_key)
        .fetch_optional(&self.pool)
        .await
        .context("fetching accounting")?;
        Ok(record)
    }

    /// Count one optimization pass and the bytes it purged.
    pub async fn record_optimization(&self, sandbox_key: &str, purged_bytes: i64, at: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO accounting (sandbox_key, optimization_count, purged_bytes_total, last_optimized_at)
            VALUES (?, 1, ?, ?)
            ON CONFLICT(sandbox_key) DO UPDATE SET
                optimization_count = optimization_count + 1,
                purged_bytes_total = purged_bytes_total + excluded.purged_bytes_total,
                last_optimized_at = excluded.last_optimized_at
            "#,
        )
        .bind(sandbox_key)
        .bind(purged_bytes)
        .bind(at)
        .execute(&self.pool)
        .await
        .context("recording optimization")?;
        Ok(())
    }

    /// Remember the most recent usage measurement.
    pub async fn record_usage(&self, sandbox_key: &str, bytes: i64, at: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO accounting (sandbox_key, last_usage_bytes, last_measured_at)
            VALUES (?, ?, ?)
            ON CONFLICT(sandbox_key) DO UPDATE SET
                last_usage_bytes = excluded.last_usage_bytes,
                last_measured_at = excluded.last_measured_at
            "#,
        )
        .bind(sandbox_key)
        .bind(bytes)
        .bind(at)
        .execute(&self.pool)
        .await
        .context("recording usage")?;
        Ok(())
    }

    pub async fn delete_accounting(&self, sandbox_key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM accounting WHERE sandbox_key = ?")
            .bind(sandbox_key)
            .execute(&self.pool)
            .await
            .context("deleting accounting")?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn repo() -> PolicyRepository {
        let db = Database::in_memory().await.unwrap();
        PolicyRepository::new(db.pool().clone())
    }

    #[tokio::test]
    async fn test_upsert_replaces_document() {
        let repo = repo().await;
        repo.upsert("sb", "one", "t0").await.unwrap();
        repo.upsert("sb", "two", "t1").await.unwrap();
        assert_eq!(
            repo.get("sb").await.unwrap(),
            Some(("two".to_string(), "t1".to_string()))
        );
        assert!(repo.delete("sb").await.unwrap());
        assert!(!repo.delete("sb").await.unwrap());
    }

    #[tokio::test]
    async fn test_accounting_accumulates() {
        let repo = repo().await;
        assert!(repo.accounting("sb").await.unwrap().is_none());

        repo.record_usage("sb", 500, "t0").await.unwrap();
        repo.record_optimization("sb", 100, "t1").await.unwrap();
        repo.record_optimization("sb", 50, "t2").await.unwrap();

        let record = repo.accounting("sb").await.unwrap().unwrap();
        assert_eq!(record.optimization_count, 2);
        assert_eq!(record.purged_bytes_total, 150);
        assert_eq!(record.last_optimized_at.as_deref(), Some("t2"));
        assert_eq!(record.last_usage_bytes, Some(500));

        assert!(repo.delete_accounting("sb").await.unwrap());
    }
}
