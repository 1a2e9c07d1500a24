//! Sandbox registry and lifecycle engine.

pub mod artifacts;
pub mod engine;
pub mod health;
pub mod key;
pub mod locks;
pub mod models;
pub mod reports;
pub mod store;

pub use artifacts::{ArtifactStore, PropertyOverlay, SandboxManifest};
pub use engine::{EngineConfig, EngineParts, EnginePaths, SandboxEngine};
pub use health::{HealthConfig, HealthGrade, HealthReport};
pub use key::SandboxKey;
pub use models::{Sandbox, SandboxFilter, SandboxStatus, SandboxUpdate, SessionRecord};
pub use reports::{GlobalStats, OptimizeReport, ReconcileReport, SandboxStats};
pub use store::{SandboxStore, SqliteSandboxStore, StoreError};
