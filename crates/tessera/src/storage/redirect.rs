//! Canonical-path to sandbox-path routing table.
//!
//! The interception layer consumes this table to make a running instance
//! observe its private tree. Lookups are longest-prefix on whole path
//! components, so `/data/data/app/cache/x` resolves through the cache entry
//! rather than the broader data entry, and `/data/data/app2` never matches
//! `/data/data/app`.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::layout::StorageCategory;
use crate::schema::Document;

/// Placeholder for the target application in canonical templates.
const APP: &str = "{app}";

/// Canonical host prefixes per category, most specific last.
const CANONICAL: &[(&str, StorageCategory)] = &[
    ("/data/data/{app}", StorageCategory::Data),
    ("/data/user/0/{app}", StorageCategory::Data),
    ("/data/data/{app}/databases", StorageCategory::Data),
    ("/data/data/{app}/cache", StorageCategory::Cache),
    ("/data/data/{app}/code_cache", StorageCategory::Cache),
    ("/data/data/{app}/shared_prefs", StorageCategory::Settings),
    ("/data/data/{app}/app_webview", StorageCategory::Session),
    ("/data/misc/keystore/{app}", StorageCategory::Keys),
    ("/data/log/{app}", StorageCategory::Logs),
    ("/sdcard/Download", StorageCategory::Downloads),
    ("/storage/emulated/0/Download", StorageCategory::Downloads),
    ("/sdcard/Android/media/{app}", StorageCategory::Media),
    ("/storage/emulated/0/Android/media/{app}", StorageCategory::Media),
];

/// One routing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redirect {
    pub canonical: String,
    pub target: PathBuf,
    pub category: StorageCategory,
}

/// Routing table for one sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectionTable {
    pub sandbox_key: String,
    pub target_app_ref: String,
    pub storage_root: PathBuf,
    pub entries: Vec<Redirect>,
}

impl Document for RedirectionTable {
    const KIND: &'static str = "redirects";

    fn validate(&self) -> Result<(), String> {
        if self.entries.is_empty() {
            return Err("table has no entries".to_string());
        }
        let mut seen = std::collections::HashSet::new();
        for entry in &self.entries {
            if !entry.canonical.starts_with('/') {
                return Err(format!("canonical path {} is not absolute", entry.canonical));
            }
            if !seen.insert(entry.canonical.as_str()) {
                return Err(format!("duplicate canonical path {}", entry.canonical));
            }
            if !entry.target.starts_with(&self.storage_root) {
                return Err(format!(
                    "target {} escapes the storage root",
                    entry.target.display()
                ));
            }
        }
        Ok(())
    }
}

fn normalize(path: &str) -> Option<Vec<String>> {
    let path = Path::new(path);
    if !path.is_absolute() {
        return None;
    }
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::RootDir => {}
            Component::CurDir => {}
            Component::Normal(part) => parts.push(part.to_string_lossy().to_string()),
            // Parent references could climb out of a prefix.
            Component::ParentDir | Component::Prefix(_) => return None,
        }
    }
    Some(parts)
}

impl RedirectionTable {
    /// Build the table for a storage root. Pure, so recomputing it always
    /// yields the same table.
    pub fn build(sandbox_key: &str, target_app_ref: &str, storage_root: &Path) -> Self {
        let entries = CANONICAL
            .iter()
            .map(|(template, category)| {
                let canonical = template.replace(APP, target_app_ref);
                let mut target = storage_root.join(category.dir_name());
                // Keep the sub-path below the category's primary prefix.
                if let Some(suffix) = template
                    .strip_prefix("/data/data/{app}/")
                    .filter(|s| !matches!(*s, "cache" | "shared_prefs" | "app_webview"))
                {
                    target = target.join(suffix);
                }
                Redirect {
                    canonical,
                    target,
                    category: *category,
                }
            })
            .collect();

        Self {
            sandbox_key: sandbox_key.to_string(),
            target_app_ref: target_app_ref.to_string(),
            storage_root: storage_root.to_path_buf(),
            entries,
        }
    }

    /// Longest-prefix lookup on whole components.
    pub fn resolve(&self, host_path: &str) -> Option<PathBuf> {
        let wanted = normalize(host_path)?;
        let mut best: Option<(usize, &Redirect)> = None;
        for entry in &self.entries {
            let Some(prefix) = normalize(&entry.canonical) else {
                continue;
            };
            if wanted.len() >= prefix.len()
                && wanted[..prefix.len()] == prefix[..]
                && best.is_none_or(|(len, _)| prefix.len() > len)
            {
                best = Some((prefix.len(), entry));
            }
        }
        let (len, entry) = best?;
        let mut resolved = entry.target.clone();
        for part in &wanted[len..] {
            resolved.push(part);
        }
        Some(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema;

    fn table() -> RedirectionTable {
        RedirectionTable::build("sb-1", "com.example.app", Path::new("/srv/sandboxes/sb-1"))
    }

    #[test]
    fn test_every_category_is_routed() {
        let table = table();
        for category in StorageCategory::ALL {
            assert!(
                table.entries.iter().any(|e| e.category == category),
                "{category} not routed"
            );
        }
        assert_eq!(table.validate(), Ok(()));
    }

    #[test]
    fn test_longest_prefix_wins() {
        let table = table();
        assert_eq!(
            table.resolve("/data/data/com.example.app/cache/img/1.png"),
            Some(PathBuf::from("/srv/sandboxes/sb-1/cache/img/1.png"))
        );
        assert_eq!(
            table.resolve("/data/data/com.example.app/files/a.txt"),
            Some(PathBuf::from("/srv/sandboxes/sb-1/data/files/a.txt"))
        );
        assert_eq!(
            table.resolve("/data/data/com.example.app/databases/main.db"),
            Some(PathBuf::from("/srv/sandboxes/sb-1/data/databases/main.db"))
        );
        assert_eq!(
            table.resolve("/data/data/com.example.app/shared_prefs/p.xml"),
            Some(PathBuf::from("/srv/sandboxes/sb-1/settings/p.xml"))
        );
    }

    #[test]
    fn test_component_boundaries() {
        let table = table();
        assert_eq!(table.resolve("/data/data/com.example.app2/files"), None);
        assert_eq!(table.resolve("/data/data/com.example.app/cachefile"),
            Some(PathBuf::from("/srv/sandboxes/sb-1/data/cachefile")));
        assert_eq!(
            table.resolve("/data/data/com.example.app"),
            Some(PathBuf::from("/srv/sandboxes/sb-1/data"))
        );
    }

    #[test]
    fn test_rejects_relative_and_parent_paths() {
        let table = table();
        assert_eq!(table.resolve("data/data/com.example.app"), None);
        assert_eq!(table.resolve("/data/data/com.example.app/../other/x"), None);
        assert_eq!(table.resolve("/etc/passwd"), None);
    }

    #[test]
    fn test_build_is_pure() {
        assert_eq!(table(), table());
        let text = schema::encode(&table()).unwrap();
        assert_eq!(schema::decode::<RedirectionTable>(&text).unwrap(), table());
    }
}
