//! TOML configuration for page groups, the WAL, transactions, and replay.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::primitives::pager::PageMemory;
use crate::primitives::wal::{WalOptions, WalSyncMode};
use crate::storage::{ReplayPolicy, WalStateRegistry, MIN_PAGE_SIZE};
use crate::types::{GroupId, Lsn};

/// Per-group settings.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct GroupOptions {
    pub id: i32,
    /// Overrides [`StorageOptions::default_page_size`].
    #[serde(default)]
    pub page_size: Option<u32>,
    #[serde(default = "default_true")]
    pub wal_enabled: bool,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct WalSection {
    #[serde(default)]
    pub sync: WalSyncMode,
    #[serde(default)]
    pub salt: u64,
}

#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct TxSection {
    /// Bound on waiting for a transaction to finish before acknowledging
    /// its rollback. Unset waits indefinitely.
    #[serde(default)]
    pub ack_timeout_ms: Option<u64>,
    #[serde(default = "default_update_wait_ms")]
    pub update_wait_timeout_ms: u64,
}

impl Default for TxSection {
    fn default() -> Self {
        Self {
            ack_timeout_ms: None,
            update_wait_timeout_ms: default_update_wait_ms(),
        }
    }
}

impl TxSection {
    pub fn ack_timeout(&self) -> Option<Duration> {
        self.ack_timeout_ms.map(Duration::from_millis)
    }

    pub fn update_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.update_wait_timeout_ms)
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct RecoverySection {
    #[serde(default)]
    pub policy: ReplayPolicy,
}

/// Top-level configuration file.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct StorageOptions {
    #[serde(default = "default_page_size")]
    pub default_page_size: u32,
    #[serde(default)]
    pub groups: Vec<GroupOptions>,
    #[serde(default)]
    pub wal: WalSection,
    #[serde(default)]
    pub tx: TxSection,
    #[serde(default)]
    pub recovery: RecoverySection,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            default_page_size: default_page_size(),
            groups: Vec::new(),
            wal: WalSection::default(),
            tx: TxSection::default(),
            recovery: RecoverySection::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_page_size() -> u32 {
    4096
}

fn default_update_wait_ms() -> u64 {
    30_000
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to serialize config: {source}")]
    Serialize { source: toml::ser::Error },
    #[error("invalid config: {reason}")]
    Invalid { reason: String },
}

impl StorageOptions {
    /// Reads and validates `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let options: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        options.validate()?;
        Ok(options)
    }

    /// Like [`StorageOptions::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) if path.exists() => Self::load(path),
            _ => Ok(Self::default()),
        }
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let options: Self = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        options.validate()?;
        Ok(options)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|source| ConfigError::Serialize { source })
    }

    /// Checks page sizes and rejects duplicate group ids.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| Err(ConfigError::Invalid { reason });
        if (self.default_page_size as usize) < MIN_PAGE_SIZE {
            return invalid(format!(
                "default_page_size {} is below the minimum of {MIN_PAGE_SIZE}",
                self.default_page_size
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for group in &self.groups {
            if !seen.insert(group.id) {
                return invalid(format!("group {} is configured twice", group.id));
            }
            if let Some(size) = group.page_size {
                if (size as usize) < MIN_PAGE_SIZE {
                    return invalid(format!(
                        "group {} page_size {size} is below the minimum of {MIN_PAGE_SIZE}",
                        group.id
                    ));
                }
            }
        }
        Ok(())
    }

    /// Page size for `group`, falling back to the default.
    pub fn page_size(&self, group: GroupId) -> usize {
        self.groups
            .iter()
            .find(|g| g.id == group.0)
            .and_then(|g| g.page_size)
            .unwrap_or(self.default_page_size) as usize
    }

    /// Page memory with every configured group registered.
    pub fn page_memory(&self) -> crate::types::Result<PageMemory> {
        let pages = PageMemory::default();
        for group in &self.groups {
            pages.register_group(GroupId(group.id), self.page_size(GroupId(group.id)))?;
        }
        Ok(pages)
    }

    /// WAL state registry seeded from the per-group flags.
    pub fn wal_state(&self) -> WalStateRegistry {
        let registry = WalStateRegistry::new();
        for group in &self.groups {
            registry.register(GroupId(group.id), group.wal_enabled);
        }
        registry
    }

    pub fn wal_options(&self, start_lsn: Lsn) -> WalOptions {
        WalOptions::new(self.wal.salt, start_lsn, self.wal.sync)
    }
}

/// `<config dir>/kindle/kindle.toml`, if the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("kindle").join("kindle.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
default_page_size = 1024

[[groups]]
id = 1
page_size = 256

[[groups]]
id = 2
wal_enabled = false

[wal]
sync = "deferred"
salt = 77

[tx]
ack_timeout_ms = 500

[recovery]
policy = "quarantine"
"#;

    #[test]
    fn parses_every_section() {
        let opts = StorageOptions::from_toml_str(SAMPLE).unwrap();
        assert_eq!(opts.page_size(GroupId(1)), 256);
        assert_eq!(opts.page_size(GroupId(2)), 1024);
        assert_eq!(opts.page_size(GroupId(9)), 1024);
        assert_eq!(opts.wal.sync, WalSyncMode::Deferred);
        assert_eq!(opts.tx.ack_timeout(), Some(Duration::from_millis(500)));
        assert_eq!(opts.tx.update_wait_timeout(), Duration::from_secs(30));
        assert_eq!(opts.recovery.policy, ReplayPolicy::Quarantine);
        assert!(opts.wal_state().is_enabled(GroupId(1)));
        assert!(!opts.wal_state().is_enabled(GroupId(2)));
    }

    #[test]
    fn empty_file_gives_defaults() {
        let opts = StorageOptions::from_toml_str("").unwrap();
        assert_eq!(opts, StorageOptions::default());
        assert_eq!(opts.wal.sync, WalSyncMode::Immediate);
    }

    #[test]
    fn rejects_bad_values() {
        let err = StorageOptions::from_toml_str("default_page_size = 16").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
        let dup = "[[groups]]\nid = 1\n[[groups]]\nid = 1\n";
        assert!(StorageOptions::from_toml_str(dup).is_err());
        assert!(matches!(
            StorageOptions::from_toml_str("[recovery]\npolicy = \"guess\"").unwrap_err(),
            ConfigError::Parse { .. }
        ));
    }

    #[test]
    fn file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kindle.toml");
        let opts = StorageOptions::from_toml_str(SAMPLE).unwrap();
        fs::write(&path, opts.to_toml_string().unwrap()).unwrap();
        assert_eq!(StorageOptions::load(&path).unwrap(), opts);
        let missing = dir.path().join("absent.toml");
        assert_eq!(
            StorageOptions::load_or_default(Some(&missing)).unwrap(),
            StorageOptions::default()
        );
    }

    #[test]
    fn page_memory_registers_groups() {
        let opts = StorageOptions::from_toml_str(SAMPLE).unwrap();
        let pages = opts.page_memory().unwrap();
        assert_eq!(pages.groups().len(), 2);
    }
}
