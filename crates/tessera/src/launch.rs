//! Launch seam.
//!
//! The engine never starts processes. `launch` resolves an entry point for
//! the target through a [`Launcher`] and hands back a [`LaunchContext`] with
//! everything the platform's launch primitive needs.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::identity::IdentityRecord;
use crate::policy::{PolicyDocument, ResourceLimits};
use crate::sandbox::Sandbox;
use crate::storage::RedirectionTable;

/// How to start a target application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPoint {
    pub target_app_ref: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Resolves entry points for target applications.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn resolve_entry_point(&self, target_app_ref: &str) -> Option<EntryPoint>;
}

/// One `[launch.entries.<target>]` table in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchEntry {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// `[launch]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Targets without an entry launch with their own name as the command.
    pub allow_unlisted: bool,
    pub entries: BTreeMap<String, LaunchEntry>,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            allow_unlisted: true,
            entries: BTreeMap::new(),
        }
    }
}

/// Launcher backed by the config file's entry table.
#[derive(Debug, Clone, Default)]
pub struct ConfiguredLauncher {
    entries: HashMap<String, EntryPoint>,
    allow_unlisted: bool,
}

impl ConfiguredLauncher {
    pub fn new(allow_unlisted: bool) -> Self {
        Self {
            entries: HashMap::new(),
            allow_unlisted,
        }
    }

    pub fn from_config(config: &LaunchConfig) -> Self {
        let mut launcher = Self::new(config.allow_unlisted);
        for (target, entry) in &config.entries {
            launcher = launcher.with_entry(target, &entry.command, entry.args.clone());
        }
        launcher
    }

    pub fn with_entry(mut self, target_app_ref: &str, command: &str, args: Vec<String>) -> Self {
        self.entries.insert(
            target_app_ref.to_string(),
            EntryPoint {
                target_app_ref: target_app_ref.to_string(),
                command: command.to_string(),
                args,
            },
        );
        self
    }
}

#[async_trait]
impl Launcher for ConfiguredLauncher {
    async fn resolve_entry_point(&self, target_app_ref: &str) -> Option<EntryPoint> {
        if let Some(entry) = self.entries.get(target_app_ref) {
            return Some(entry.clone());
        }
        if self.allow_unlisted && !target_app_ref.trim().is_empty() {
            return Some(EntryPoint {
                target_app_ref: target_app_ref.to_string(),
                command: target_app_ref.to_string(),
                args: Vec::new(),
            });
        }
        None
    }
}

/// Everything a caller needs to start a sandboxed session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchContext {
    pub sandbox: Sandbox,
    pub entry_point: EntryPoint,
    pub session_id: i64,
    pub storage_root: PathBuf,
    pub redirects: RedirectionTable,
    pub identity: IdentityRecord,
    /// System property overlay derived from the identity.
    pub properties: BTreeMap<String, String>,
    pub policy: PolicyDocument,
    pub limits: ResourceLimits,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_listed_entry_wins() {
        let launcher = ConfiguredLauncher::new(false).with_entry("app.example", "/opt/app/run", vec!["--fast".into()]);
        let entry = launcher.resolve_entry_point("app.example").await.unwrap();
        assert_eq!(entry.command, "/opt/app/run");
        assert_eq!(entry.args, vec!["--fast".to_string()]);
        assert!(launcher.resolve_entry_point("other").await.is_none());
    }

    #[tokio::test]
    async fn test_unlisted_targets() {
        let launcher = ConfiguredLauncher::new(true);
        let entry = launcher.resolve_entry_point("com.example").await.unwrap();
        assert_eq!(entry.command, "com.example");
        assert!(launcher.resolve_entry_point("  ").await.is_none());
    }

    #[tokio::test]
    async fn test_from_config() {
        let mut config = LaunchConfig {
            allow_unlisted: false,
            ..Default::default()
        };
        config.entries.insert(
            "app".into(),
            LaunchEntry {
                command: "run-app".into(),
                args: Vec::new(),
            },
        );
        let launcher = ConfiguredLauncher::from_config(&config);
        assert!(launcher.resolve_entry_point("app").await.is_some());
        assert!(launcher.resolve_entry_point("nope").await.is_none());
    }
}
