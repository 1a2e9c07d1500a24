//! Security policy documents, resource limits and accounting.

pub mod accountant;
pub mod models;
mod repository;

pub use accountant::{AppliedPolicy, PolicyAccountant, optimization_state};
pub use models::{
    AccountingRecord, NetworkPolicy, OptimizationState, PermissionRule, PolicyDocument, PolicyVerdict,
    ResourceLimits, RuleAction, SEALABLE_FIELDS,
};
pub use repository::PolicyRepository;

use thiserror::Error;

use crate::schema::SchemaError;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("invalid policy: {0}")]
    Invalid(String),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Database(#[from] anyhow::Error),
}
