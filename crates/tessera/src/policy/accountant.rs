//! Policy attachment and resource accounting.

use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use serde::Serialize;

use crate::schema;

use super::PolicyError;
use super::models::{AccountingRecord, OptimizationState, PolicyDocument, ResourceLimits};
use super::repository::PolicyRepository;

/// A stored policy with its application time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedPolicy {
    pub document: PolicyDocument,
    pub applied_at: String,
}

/// Attaches policy documents to sandboxes and keeps their accounting.
#[derive(Debug, Clone)]
pub struct PolicyAccountant {
    repo: PolicyRepository,
    default_policy: PolicyDocument,
}

impl PolicyAccountant {
    pub fn new(repo: PolicyRepository) -> Self {
        Self {
            repo,
            default_policy: PolicyDocument::default(),
        }
    }

    pub fn with_default_policy(mut self, policy: PolicyDocument) -> Self {
        self.default_policy = policy;
        self
    }

    pub fn default_policy(&self) -> &PolicyDocument {
        &self.default_policy
    }

    /// Attach the default policy.
    pub async fn apply_default(&self, sandbox_key: &str) -> Result<PolicyDocument, PolicyError> {
        let policy = self.default_policy.clone();
        self.apply(sandbox_key, &policy).await?;
        Ok(policy)
    }

    /// Replace the policy wholesale. Returns the policy it replaced.
    pub async fn apply(
        &self,
        sandbox_key: &str,
        policy: &PolicyDocument,
    ) -> Result<Option<PolicyDocument>, PolicyError> {
        let document = schema::encode(policy).map_err(|e| PolicyError::Invalid(e.to_string()))?;
        let previous = self.get(sandbox_key).await?.map(|p| p.document);
        self.repo
            .upsert(sandbox_key, &document, &Utc::now().to_rfc3339())
            .await?;
        info!(
            "Applied policy to {} (network default {}, {} sensitive fields)",
            sandbox_key,
            policy.network.default,
            policy.sensitive_fields.len()
        );
        Ok(previous)
    }

    pub async fn get(&self, sandbox_key: &str) -> Result<Option<AppliedPolicy>, PolicyError> {
        match self.repo.get(sandbox_key).await? {
            Some((text, applied_at)) => Ok(Some(AppliedPolicy {
                document: schema::decode(&text)?,
                applied_at,
            })),
            None => Ok(None),
        }
    }

    /// Sensitive identity fields for a sandbox, or the default set when no
    /// policy is attached.
    pub async fn sensitive_fields(&self, sandbox_key: &str) -> Result<Vec<String>, PolicyError> {
        Ok(match self.get(sandbox_key).await? {
            Some(applied) => applied.document.sensitive_fields,
            None => self.default_policy.sensitive_fields.clone(),
        })
    }

    /// Delete policy and accounting. Returns whether a policy existed.
    pub async fn remove(&self, sandbox_key: &str) -> Result<bool, PolicyError> {
        let existed = self.repo.delete(sandbox_key).await?;
        self.repo.delete_accounting(sandbox_key).await?;
        debug!("Removed policy and accounting for {}", sandbox_key);
        Ok(existed)
    }

    pub fn check_policy(&self, policy: &PolicyDocument) -> Result<(), PolicyError> {
        schema::check(policy).map_err(|e| PolicyError::Invalid(e.to_string()))
    }

    pub fn check_limits(&self, limits: &ResourceLimits) -> Result<(), PolicyError> {
        schema::check(limits).map_err(|e| PolicyError::Invalid(e.to_string()))
    }

    /// Accounting row, zeroed if none has been written yet.
    pub async fn accounting(&self, sandbox_key: &str) -> Result<AccountingRecord, PolicyError> {
        Ok(self
            .repo
            .accounting(sandbox_key)
            .await?
            .unwrap_or_else(|| AccountingRecord {
                sandbox_key: sandbox_key.to_string(),
                ..Default::default()
            }))
    }

    pub async fn record_optimization(&self, sandbox_key: &str, purged_bytes: u64) -> Result<(), PolicyError> {
        let purged = i64::try_from(purged_bytes).unwrap_or(i64::MAX);
        self.repo
            .record_optimization(sandbox_key, purged, &Utc::now().to_rfc3339())
            .await?;
        Ok(())
    }

    pub async fn record_usage(&self, sandbox_key: &str, bytes: u64) -> Result<(), PolicyError> {
        let bytes = i64::try_from(bytes).unwrap_or(i64::MAX);
        self.repo
            .record_usage(sandbox_key, bytes, &Utc::now().to_rfc3339())
            .await?;
        Ok(())
    }
}

/// Derive optimization state from accounting, usage and limits.
pub fn optimization_state(
    accounting: &AccountingRecord,
    usage_bytes: u64,
    limits: &ResourceLimits,
    staleness: Duration,
    now: DateTime<Utc>,
) -> OptimizationState {
    let storage_ratio = if limits.storage_bytes == 0 {
        f64::INFINITY
    } else {
        usage_bytes as f64 / limits.storage_bytes as f64
    };
    let last = accounting
        .last_optimized_at
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc));
    let optimized = last.is_some();
    let fresh = last.is_some_and(|t| now - t <= staleness);

    OptimizationState {
        storage_ratio,
        optimized,
        fresh,
        needs_optimization: !fresh || storage_ratio >= 0.5,
    }
}
