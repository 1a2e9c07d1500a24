//! Sandbox data models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::policy::ResourceLimits;

/// Lifecycle status of a sandbox.
///
/// `Removed` is never stored: a removed sandbox has no registry row and its
/// key sits in the retired table instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    /// Registry row exists, setup not finished.
    Created,
    /// Storage, identity and policy are in place.
    Configured,
    Running,
    Stopped,
    Removed,
}

impl SandboxStatus {
    pub const ALL: [SandboxStatus; 5] = [
        SandboxStatus::Created,
        SandboxStatus::Configured,
        SandboxStatus::Running,
        SandboxStatus::Stopped,
        SandboxStatus::Removed,
    ];

    /// Whether `launch` may move a sandbox out of this status.
    pub fn is_launchable(self) -> bool {
        matches!(self, SandboxStatus::Configured | SandboxStatus::Stopped)
    }
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxStatus::Created => write!(f, "created"),
            SandboxStatus::Configured => write!(f, "configured"),
            SandboxStatus::Running => write!(f, "running"),
            SandboxStatus::Stopped => write!(f, "stopped"),
            SandboxStatus::Removed => write!(f, "removed"),
        }
    }
}

impl std::str::FromStr for SandboxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "created" => Ok(SandboxStatus::Created),
            "configured" => Ok(SandboxStatus::Configured),
            "running" => Ok(SandboxStatus::Running),
            "stopped" => Ok(SandboxStatus::Stopped),
            "removed" => Ok(SandboxStatus::Removed),
            _ => Err(format!("unknown sandbox status: {}", s)),
        }
    }
}

impl TryFrom<String> for SandboxStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A registry row.
///
/// The identity record and policy document are keyed by `sandbox_key` in
/// their own tables and owned by this sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Sandbox {
    pub sandbox_key: String,
    /// Application being sandboxed.
    pub target_app_ref: String,
    pub display_label: String,
    pub storage_root: String,
    #[sqlx(try_from = "String")]
    pub status: SandboxStatus,
    pub memory_ceiling_bytes: i64,
    pub storage_ceiling_bytes: i64,
    pub concurrency_ceiling: i64,
    pub launch_count: i64,
    pub total_runtime_secs: i64,
    pub created_at: String,
    pub last_active_at: String,
    pub last_launched_at: Option<String>,
}

impl Sandbox {
    pub fn limits(&self) -> ResourceLimits {
        ResourceLimits {
            memory_bytes: u64::try_from(self.memory_ceiling_bytes).unwrap_or(0),
            storage_bytes: u64::try_from(self.storage_ceiling_bytes).unwrap_or(0),
            max_concurrency: u32::try_from(self.concurrency_ceiling).unwrap_or(0),
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == SandboxStatus::Running
    }
}

/// Registry query filter. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxFilter {
    pub target_app_ref: Option<String>,
    pub status: Option<SandboxStatus>,
}

impl SandboxFilter {
    pub fn by_target(target: impl Into<String>) -> Self {
        Self {
            target_app_ref: Some(target.into()),
            status: None,
        }
    }

    pub fn by_status(status: SandboxStatus) -> Self {
        Self {
            target_app_ref: None,
            status: Some(status),
        }
    }
}

/// Partial registry update. `None` leaves a column untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxUpdate {
    pub display_label: Option<String>,
    pub status: Option<SandboxStatus>,
    pub limits: Option<ResourceLimits>,
    pub last_active_at: Option<String>,
    pub last_launched_at: Option<String>,
    /// Added to `launch_count`.
    pub launches: Option<i64>,
}

impl SandboxUpdate {
    pub fn status(status: SandboxStatus, at: &str) -> Self {
        Self {
            status: Some(status),
            last_active_at: Some(at.to_string()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// One launch-to-stop interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct SessionRecord {
    pub id: i64,
    pub sandbox_key: String,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub duration_secs: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_text() {
        for status in SandboxStatus::ALL {
            assert_eq!(status.to_string().parse::<SandboxStatus>(), Ok(status));
        }
        assert_eq!("RUNNING".parse::<SandboxStatus>(), Ok(SandboxStatus::Running));
        assert!("paused".parse::<SandboxStatus>().is_err());
    }

    #[test]
    fn test_launchable_states() {
        assert!(SandboxStatus::Configured.is_launchable());
        assert!(SandboxStatus::Stopped.is_launchable());
        assert!(!SandboxStatus::Created.is_launchable());
        assert!(!SandboxStatus::Running.is_launchable());
        assert!(!SandboxStatus::Removed.is_launchable());
    }

    #[test]
    fn test_negative_ceilings_clamp_to_zero() {
        let sandbox = Sandbox {
            sandbox_key: "k".into(),
            target_app_ref: "app".into(),
            display_label: "app".into(),
            storage_root: "/tmp/k".into(),
            status: SandboxStatus::Configured,
            memory_ceiling_bytes: -1,
            storage_ceiling_bytes: 10,
            concurrency_ceiling: 2,
            launch_count: 0,
            total_runtime_secs: 0,
            created_at: String::new(),
            last_active_at: String::new(),
            last_launched_at: None,
        };
        let limits = sandbox.limits();
        assert_eq!(limits.memory_bytes, 0);
        assert_eq!(limits.storage_bytes, 10);
        assert_eq!(limits.max_concurrency, 2);
    }
}
