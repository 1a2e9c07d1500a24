//! Tessera
//!
//! Sandbox lifecycle and isolation engine: many isolated instances of one
//! application on one host, each with private storage, a synthetic device
//! identity, a security policy and resource ceilings.

pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod identity;
pub mod launch;
pub mod policy;
pub mod sandbox;
pub mod schema;
pub mod storage;

pub use error::{EngineError, EngineResult, OutcomeKind};
pub use sandbox::SandboxEngine;
