//! Engine error taxonomy and the stable outcome kinds callers see.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::IdentityError;
use crate::policy::PolicyError;
use crate::sandbox::StoreError;
use crate::storage::{ArchiveError, StorageError};

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Every error the engine's public operations return.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No live sandbox has this key (never existed or already removed).
    #[error("sandbox not found: {0}")]
    NotFound(String),

    /// The sandbox is already running. Callers may treat this as success.
    #[error("sandbox already running: {0}")]
    AlreadyRunning(String),

    /// A creation step failed; partial work was rolled back.
    #[error("allocation failed: {0}")]
    AllocationFailed(String),

    #[error("storage usage of {usage} bytes exceeds the archive ceiling of {ceiling} bytes")]
    TooLarge { usage: u64, ceiling: u64 },

    /// Malformed archive, policy, identity update or request.
    #[error("invalid: {0}")]
    Invalid(String),

    /// Cancelled or timed out; prior state is intact.
    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// The small, stable set of outcomes presented to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    NotFound,
    AllocationFailed,
    TooLarge,
    Invalid,
    Failed,
}

impl std::fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutcomeKind::Success => write!(f, "success"),
            OutcomeKind::NotFound => write!(f, "not_found"),
            OutcomeKind::AllocationFailed => write!(f, "allocation_failed"),
            OutcomeKind::TooLarge => write!(f, "too_large"),
            OutcomeKind::Invalid => write!(f, "invalid"),
            OutcomeKind::Failed => write!(f, "failed"),
        }
    }
}

impl EngineError {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            EngineError::NotFound(_) => OutcomeKind::NotFound,
            EngineError::AlreadyRunning(_) => OutcomeKind::Success,
            EngineError::AllocationFailed(_) => OutcomeKind::AllocationFailed,
            EngineError::TooLarge { .. } => OutcomeKind::TooLarge,
            EngineError::Invalid(_) => OutcomeKind::Invalid,
            EngineError::Cancelled(_) | EngineError::Storage(_) | EngineError::Internal(_) => {
                OutcomeKind::Failed
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }
}

/// Outcome of an engine call, for callers that only care about the kind.
pub fn outcome<T>(result: &EngineResult<T>) -> OutcomeKind {
    match result {
        Ok(_) => OutcomeKind::Success,
        Err(e) => e.kind(),
    }
}

impl From<ArchiveError> for EngineError {
    fn from(error: ArchiveError) -> Self {
        match error {
            ArchiveError::TooLarge { usage, ceiling } => EngineError::TooLarge { usage, ceiling },
            ArchiveError::Invalid(reason) => EngineError::Invalid(reason),
            ArchiveError::NotFound(path) => EngineError::Invalid(format!("archive not found: {path}")),
            ArchiveError::Cancelled(reason) => EngineError::Cancelled(reason),
            ArchiveError::Storage(e) => e.into(),
            ArchiveError::Io(e) => EngineError::Storage(StorageError::Io(e)),
        }
    }
}

impl From<IdentityError> for EngineError {
    fn from(error: IdentityError) -> Self {
        match error {
            IdentityError::NotFound(key) => EngineError::NotFound(key),
            IdentityError::Invalid(reason) => EngineError::Invalid(reason),
            IdentityError::ClaimConflict(claim) => {
                EngineError::Invalid(format!("identifier {claim} is already in use"))
            }
            IdentityError::Exhausted(n) => {
                EngineError::AllocationFailed(format!("no unique identifiers after {n} attempts"))
            }
            IdentityError::Database(e) => EngineError::Internal(e),
            other => EngineError::Internal(anyhow::Error::new(other)),
        }
    }
}

impl From<PolicyError> for EngineError {
    fn from(error: PolicyError) -> Self {
        match error {
            PolicyError::Invalid(reason) => EngineError::Invalid(reason),
            PolicyError::Database(e) => EngineError::Internal(e),
            other => EngineError::Internal(anyhow::Error::new(other)),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(key) => EngineError::NotFound(key),
            StoreError::Duplicate(key) => {
                EngineError::AllocationFailed(format!("sandbox key {key} already taken"))
            }
            StoreError::Database(e) => EngineError::Internal(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_kinds() {
        assert_eq!(EngineError::NotFound("x".into()).kind(), OutcomeKind::NotFound);
        assert_eq!(EngineError::AlreadyRunning("x".into()).kind(), OutcomeKind::Success);
        assert_eq!(
            EngineError::TooLarge { usage: 2, ceiling: 1 }.kind(),
            OutcomeKind::TooLarge
        );
        assert_eq!(
            EngineError::Internal(anyhow::anyhow!("boom")).kind(),
            OutcomeKind::Failed
        );
        assert_eq!(outcome::<()>(&Ok(())), OutcomeKind::Success);
    }

    #[test]
    fn test_archive_errors_map_to_outcomes() {
        let err: EngineError = ArchiveError::Invalid("empty".into()).into();
        assert_eq!(err.kind(), OutcomeKind::Invalid);
        let err: EngineError = ArchiveError::TooLarge { usage: 5, ceiling: 1 }.into();
        assert!(matches!(err, EngineError::TooLarge { usage: 5, ceiling: 1 }));
        let err: EngineError = ArchiveError::Cancelled("deadline".into()).into();
        assert_eq!(err.kind(), OutcomeKind::Failed);
    }

    #[test]
    fn test_identity_errors_map_to_outcomes() {
        let err: EngineError = IdentityError::NotFound("sb".into()).into();
        assert!(err.is_not_found());
        let err: EngineError = IdentityError::Exhausted(3).into();
        assert_eq!(err.kind(), OutcomeKind::AllocationFailed);
    }

    #[test]
    fn test_store_errors_map_to_outcomes() {
        let err: EngineError = StoreError::NotFound("sb".into()).into();
        assert!(err.is_not_found());
        let err: EngineError = StoreError::Duplicate("sb".into()).into();
        assert_eq!(err.kind(), OutcomeKind::AllocationFailed);
    }

    #[test]
    fn test_outcome_display_is_stable() {
        assert_eq!(OutcomeKind::AllocationFailed.to_string(), "allocation_failed");
        assert_eq!(
            serde_json::to_string(&OutcomeKind::TooLarge).unwrap(),
            "\"too_large\""
        );
    }
}
