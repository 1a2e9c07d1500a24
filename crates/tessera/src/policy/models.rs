//! Policy and resource limit models.

use serde::{Deserialize, Serialize};

use crate::schema::Document;

const MIB: u64 = 1024 * 1024;

/// Identity fields that may be sealed at rest.
pub const SEALABLE_FIELDS: &[&str] = &[
    "identifiers.device_id",
    "identifiers.platform_id",
    "identifiers.hardware_serial",
    "identifiers.serial_number",
    "identifiers.mac_address",
    "identifiers.bluetooth_address",
];

/// Allow or deny.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Allow,
    Deny,
}

impl std::fmt::Display for RuleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleAction::Allow => write!(f, "allow"),
            RuleAction::Deny => write!(f, "deny"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkPolicy {
    /// Action for hosts matched by neither list.
    pub default: RuleAction,
    pub allow_hosts: Vec<String>,
    pub deny_hosts: Vec<String>,
}

impl Default for NetworkPolicy {
    fn default() -> Self {
        Self {
            default: RuleAction::Allow,
            allow_hosts: Vec::new(),
            deny_hosts: Vec::new(),
        }
    }
}

/// Rule for one permission class (camera, location, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRule {
    pub class: String,
    pub action: RuleAction,
}

/// Security and network policy of one sandbox. Replaced wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyDocument {
    pub network: NetworkPolicy,
    pub permissions: Vec<PermissionRule>,
    /// Dotted identity paths sealed at rest.
    pub sensitive_fields: Vec<String>,
    pub encrypt_storage: bool,
}

impl Default for PolicyDocument {
    fn default() -> Self {
        Self {
            network: NetworkPolicy::default(),
            permissions: vec![
                PermissionRule {
                    class: "contacts".to_string(),
                    action: RuleAction::Deny,
                },
                PermissionRule {
                    class: "location".to_string(),
                    action: RuleAction::Deny,
                },
                PermissionRule {
                    class: "phone_state".to_string(),
                    action: RuleAction::Deny,
                },
            ],
            sensitive_fields: vec![
                "identifiers.hardware_serial".to_string(),
                "identifiers.device_id".to_string(),
                "identifiers.mac_address".to_string(),
            ],
            encrypt_storage: true,
        }
    }
}

fn valid_host(host: &str) -> bool {
    !host.is_empty()
        && host.len() <= 253
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '*'))
}

/// `example.com` matches itself and any subdomain.
fn host_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.trim_start_matches("*.");
    host.eq_ignore_ascii_case(pattern)
        || (host.len() > pattern.len()
            && host.to_ascii_lowercase().ends_with(&format!(".{}", pattern.to_ascii_lowercase())))
}

impl Document for PolicyDocument {
    const KIND: &'static str = "policy";

    fn validate(&self) -> Result<(), String> {
        for host in self.network.allow_hosts.iter().chain(&self.network.deny_hosts) {
            if !valid_host(host) {
                return Err(format!("invalid host pattern {host:?}"));
            }
        }
        if let Some(host) = self
            .network
            .allow_hosts
            .iter()
            .find(|h| self.network.deny_hosts.contains(h))
        {
            return Err(format!("host {host} is both allowed and denied"));
        }

        let mut classes = std::collections::HashSet::new();
        for rule in &self.permissions {
            if rule.class.trim().is_empty() {
                return Err("permission class must not be empty".to_string());
            }
            if !classes.insert(rule.class.as_str()) {
                return Err(format!("duplicate permission class {}", rule.class));
            }
        }

        for field in &self.sensitive_fields {
            if !SEALABLE_FIELDS.contains(&field.as_str()) {
                return Err(format!("field {field} cannot be marked sensitive"));
            }
        }
        Ok(())
    }
}

/// How a policy treats one host and one permission class.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyVerdict {
    pub host: Option<String>,
    pub network: Option<RuleAction>,
    pub permission_class: Option<String>,
    /// `None` when the policy does not name the class.
    pub permission: Option<RuleAction>,
}

impl PolicyDocument {
    /// Verdicts for whichever of `host` and `permission_class` are given.
    pub fn evaluate(&self, host: Option<&str>, permission_class: Option<&str>) -> PolicyVerdict {
        PolicyVerdict {
            host: host.map(str::to_string),
            network: host.map(|h| {
                if self.network_allows(h) {
                    RuleAction::Allow
                } else {
                    RuleAction::Deny
                }
            }),
            permission_class: permission_class.map(str::to_string),
            permission: permission_class.and_then(|class| self.permission(class)),
        }
    }

    /// Evaluate the network rules for a host. Deny beats allow.
    pub fn network_allows(&self, host: &str) -> bool {
        if self.network.deny_hosts.iter().any(|p| host_matches(p, host)) {
            return false;
        }
        if self.network.allow_hosts.iter().any(|p| host_matches(p, host)) {
            return true;
        }
        self.network.default == RuleAction::Allow
    }

    /// Action for a permission class, if the policy names it.
    pub fn permission(&self, class: &str) -> Option<RuleAction> {
        self.permissions
            .iter()
            .find(|r| r.class == class)
            .map(|r| r.action)
    }

    /// Sensitive fields in a stable order, for comparing policies.
    pub fn sensitive_set(&self) -> Vec<String> {
        let mut fields = self.sensitive_fields.clone();
        fields.sort();
        fields.dedup();
        fields
    }
}

/// Ceilings a sandbox runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub memory_bytes: u64,
    pub storage_bytes: u64,
    pub max_concurrency: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 512 * MIB,
            storage_bytes: 2048 * MIB,
            max_concurrency: 4,
        }
    }
}

impl Document for ResourceLimits {
    const KIND: &'static str = "limits";

    fn validate(&self) -> Result<(), String> {
        if self.memory_bytes == 0 {
            return Err("memory ceiling must be positive".to_string());
        }
        if self.storage_bytes == 0 {
            return Err("storage ceiling must be positive".to_string());
        }
        if self.max_concurrency == 0 {
            return Err("concurrency ceiling must be positive".to_string());
        }
        if self.memory_bytes > i64::MAX as u64 || self.storage_bytes > i64::MAX as u64 {
            return Err("ceiling out of range".to_string());
        }
        Ok(())
    }
}

/// Optimization and usage bookkeeping for one sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct AccountingRecord {
    pub sandbox_key: String,
    pub optimization_count: i64,
    pub purged_bytes_total: i64,
    pub last_optimized_at: Option<String>,
    pub last_usage_bytes: Option<i64>,
    pub last_measured_at: Option<String>,
}

/// Derived optimization state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OptimizationState {
    /// Usage as a fraction of the storage ceiling.
    pub storage_ratio: f64,
    pub optimized: bool,
    /// Optimized within the staleness window.
    pub fresh: bool,
    pub needs_optimization: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema;

    #[test]
    fn test_default_policy_validates() {
        assert_eq!(PolicyDocument::default().validate(), Ok(()));
        assert_eq!(ResourceLimits::default().validate(), Ok(()));
    }

    #[test]
    fn test_rejects_unknown_sensitive_field() {
        let policy = PolicyDocument {
            sensitive_fields: vec!["hardware.model".into()],
            ..Default::default()
        };
        assert!(policy.validate().unwrap_err().contains("hardware.model"));
    }

    #[test]
    fn test_rejects_conflicting_hosts() {
        let mut policy = PolicyDocument::default();
        policy.network.allow_hosts = vec!["example.com".into()];
        policy.network.deny_hosts = vec!["example.com".into()];
        assert!(policy.validate().is_err());

        policy.network.deny_hosts = vec!["bad host".into()];
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_network_evaluation() {
        let mut policy = PolicyDocument::default();
        policy.network.default = RuleAction::Deny;
        policy.network.allow_hosts = vec!["example.com".into()];
        policy.network.deny_hosts = vec!["ads.example.com".into()];

        assert!(policy.network_allows("example.com"));
        assert!(policy.network_allows("api.example.com"));
        assert!(!policy.network_allows("ads.example.com"));
        assert!(!policy.network_allows("x.ads.example.com"));
        assert!(!policy.network_allows("notexample.com"));
        assert!(!policy.network_allows("other.org"));
    }

    #[test]
    fn test_permission_lookup() {
        let policy = PolicyDocument::default();
        assert_eq!(policy.permission("location"), Some(RuleAction::Deny));
        assert_eq!(policy.permission("camera"), None);
    }

    #[test]
    fn test_evaluate_combines_host_and_permission() {
        let mut policy = PolicyDocument::default();
        policy.network.deny_hosts = vec!["tracker.net".into()];

        let verdict = policy.evaluate(Some("cdn.tracker.net"), Some("contacts"));
        assert_eq!(verdict.network, Some(RuleAction::Deny));
        assert_eq!(verdict.permission, Some(RuleAction::Deny));
        assert_eq!(verdict.host.as_deref(), Some("cdn.tracker.net"));

        let verdict = policy.evaluate(Some("example.com"), None);
        assert_eq!(verdict.network, Some(RuleAction::Allow));
        assert!(verdict.permission_class.is_none());
        assert_eq!(policy.evaluate(None, None), PolicyVerdict::default());
    }

    #[test]
    fn test_partial_policy_fills_defaults() {
        let text = r#"{"schema": 1, "kind": "policy", "body": {"encrypt_storage": false}}"#;
        let policy: PolicyDocument = schema::decode(text).unwrap();
        assert!(!policy.encrypt_storage);
        assert_eq!(policy.sensitive_fields.len(), 3);
    }

    #[test]
    fn test_zero_limits_rejected() {
        let limits = ResourceLimits {
            max_concurrency: 0,
            ..Default::default()
        };
        assert!(limits.validate().is_err());
    }
}
