//! Identity database repository.

use anyhow::Context;
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::db::WRITE_TRANSACTION;

use super::IdentityError;

/// Repository for identity documents and their uniqueness claims.
#[derive(Debug, Clone)]
pub struct IdentityRepository {
    pool: SqlitePool,
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

impl IdentityRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn claim_all(
        tx: &mut Transaction<'_, Sqlite>,
        sandbox_key: &str,
        claims: &[String],
    ) -> Result<(), IdentityError> {
        for claim in claims {
            let result = sqlx::query("INSERT INTO identity_claims (claim, sandbox_key) VALUES (?, ?)")
                .bind(claim)
                .bind(sandbox_key)
                .execute(&mut **tx)
                .await;
            match result {
                Ok(_) => {}
                Err(e) if is_unique_violation(&e) => {
                    return Err(IdentityError::ClaimConflict(claim.chars().take(12).collect()));
                }
                Err(e) => return Err(anyhow::Error::new(e).context("claiming identifier").into()),
            }
        }
        Ok(())
    }

    /// Insert a new identity together with its claims. Either all of it
    /// lands or none of it does.
    pub async fn insert(
        &self,
        sandbox_key: &str,
        document: &str,
        claims: &[String],
        now: &str,
    ) -> Result<(), IdentityError> {
        let mut tx = self
            .pool
            .begin_with(WRITE_TRANSACTION)
            .await
            .context("beginning identity insert")?;

        Self::claim_all(&mut tx, sandbox_key, claims).await?;

        let result = sqlx::query(
            r#"
            INSERT INTO identities (sandbox_key, document, created_at, updated_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(sandbox_key)
        .bind(document)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await;

        match result {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(IdentityError::AlreadyExists(sandbox_key.to_string()));
            }
            Err(e) => return Err(anyhow::Error::new(e).context("inserting identity").into()),
        }

        tx.commit().await.context("committing identity insert")?;
        Ok(())
    }

    /// Replace the stored document and swap its claims.
    pub async fn replace(
        &self,
        sandbox_key: &str,
        document: &str,
        claims: &[String],
        now: &str,
    ) -> Result<(), IdentityError> {
        let mut tx = self
            .pool
            .begin_with(WRITE_TRANSACTION)
            .await
            .context("beginning identity update")?;

        sqlx::query("DELETE FROM identity_claims WHERE sandbox_key = ?")
            .bind(sandbox_key)
            .execute(&mut *tx)
            .await
            .context("releasing identity claims")?;

        Self::claim_all(&mut tx, sandbox_key, claims).await?;

        let updated = sqlx::query("UPDATE identities SET document = ?, updated_at = ? WHERE sandbox_key = ?")
            .bind(document)
            .bind(now)
            .bind(sandbox_key)
            .execute(&mut *tx)
            .await
            .context("updating identity")?;

        if updated.rows_affected() == 0 {
            return Err(IdentityError::NotFound(sandbox_key.to_string()));
        }

        tx.commit().await.context("committing identity update")?;
        Ok(())
    }

    /// Replace the stored document without touching claims.
    pub async fn rewrite(&self, sandbox_key: &str, document: &str, now: &str) -> Result<bool, IdentityError> {
        let updated = sqlx::query("UPDATE identities SET document = ?, updated_at = ? WHERE sandbox_key = ?")
            .bind(document)
            .bind(now)
            .bind(sandbox_key)
            .execute(&self.pool)
            .await
            .context("rewriting identity")?;
        Ok(updated.rows_affected() > 0)
    }

    pub async fn get(&self, sandbox_key: &str) -> Result<Option<String>, IdentityError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT document FROM identities WHERE sandbox_key = ?")
            .bind(sandbox_key)
            .fetch_optional(&self.pool)
            .await
            .context("fetching identity")?;
        Ok(row.map(|(doc,)| doc))
    }

    pub async fn exists(&self, sandbox_key: &str) -> Result<bool, IdentityError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM identities WHERE sandbox_key = ?")
            .bind(sandbox_key)
            .fetch_one(&self.pool)
            .await
            .context("checking identity")?;
        Ok(count > 0)
    }

    /// Delete the identity and release its claims. Returns whether a row existed.
    pub async fn delete(&self, sandbox_key: &str) -> Result<bool, IdentityError> {
        let mut tx = self
            .pool
            .begin_with(WRITE_TRANSACTION)
            .await
            .context("beginning identity delete")?;

        sqlx::query("DELETE FROM identity_claims WHERE sandbox_key = ?")
            .bind(sandbox_key)
            .execute(&mut *tx)
            .await
            .context("releasing identity claims")?;

        let deleted = sqlx::query("DELETE FROM identities WHERE sandbox_key = ?")
            .bind(sandbox_key)
            .execute(&mut *tx)
            .await
            .context("deleting identity")?;

        tx.commit().await.context("committing identity delete")?;
        Ok(deleted.rows_affected() > 0)
    }

    /// Number of claims owned by a sandbox.
    pub async fn claim_count(&self, sandbox_key: &str) -> Result<i64, IdentityError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM identity_claims WHERE sandbox_key = ?")
            .bind(sandbox_key)
            .fetch_one(&self.pool)
            .await
            .context("counting identity claims")?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn repo() -> IdentityRepository {
        let db = Database::in_memory().await.unwrap();
        IdentityRepository::new(db.pool().clone())
    }

    fn claims(prefix: &str) -> Vec<String> {
        (0..3).map(|i| format!("{prefix}{i:0>20}")).collect()
    }

    #[tokio::test]
    async fn test_insert_get_delete() {
        let repo = repo().await;
        repo.insert("sb1", "{}", &claims("a"), "t0").await.unwrap();
        assert_eq!(repo.get("sb1").await.unwrap().as_deref(), Some("{}"));
        assert_eq!(repo.claim_count("sb1").await.unwrap(), 3);
        assert!(repo.delete("sb1").await.unwrap());
        assert!(!repo.delete("sb1").await.unwrap());
        assert_eq!(repo.claim_count("sb1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_conflicting_claim_rolls_back() {
        let repo = repo().await;
        repo.insert("sb1", "{}", &claims("a"), "t0").await.unwrap();

        let mut overlapping = claims("b");
        overlapping.push(claims("a")[1].clone());
        let err = repo.insert("sb2", "{}", &overlapping, "t0").await.unwrap_err();
        assert!(matches!(err, IdentityError::ClaimConflict(_)));
        assert!(repo.get("sb2").await.unwrap().is_none());
        assert_eq!(repo.claim_count("sb2").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_identity_rejected() {
        let repo = repo().await;
        repo.insert("sb1", "{}", &claims("a"), "t0").await.unwrap();
        let err = repo.insert("sb1", "{}", &claims("c"), "t0").await.unwrap_err();
        assert!(matches!(err, IdentityError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_replace_swaps_claims() {
        let repo = repo().await;
        repo.insert("sb1", "{}", &claims("a"), "t0").await.unwrap();
        repo.replace("sb1", "{\"v\":2}", &claims("d"), "t1").await.unwrap();
        // Old claims are free again.
        repo.insert("sb2", "{}", &claims("a"), "t1").await.unwrap();
        assert_eq!(repo.get("sb1").await.unwrap().as_deref(), Some("{\"v\":2}"));
    }

    #[tokio::test]
    async fn test_replace_missing_identity() {
        let repo = repo().await;
        let err = repo.replace("nope", "{}", &claims("a"), "t0").await.unwrap_err();
        assert!(matches!(err, IdentityError::NotFound(_)));
        // The failed transaction released nothing and claimed nothing.
        assert_eq!(repo.claim_count("nope").await.unwrap(), 0);
    }
}
