#![forbid(unsafe_code)]

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::info;

use crate::types::GroupId;

/// Outcome of a request to turn WAL logging on or off for a group.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct WalStateResult {
    /// Group the request targeted.
    pub group: GroupId,
    /// Whether the state actually changed.
    pub changed: bool,
    /// Why the request was refused, if it was.
    pub error: Option<String>,
}

/// Per-group switch deciding whether page deltas are logged before they are applied.
#[derive(Debug, Default)]
pub struct WalStateRegistry {
    groups: RwLock<HashMap<GroupId, bool>>,
}

impl WalStateRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a group with its initial logging state. Redeclaring keeps the current state.
    pub fn register(&self, group: GroupId, enabled: bool) {
        self.groups.write().entry(group).or_insert(enabled);
    }

    /// Whether deltas for `group` are logged. Undeclared groups log.
    pub fn is_enabled(&self, group: GroupId) -> bool {
        self.groups.read().get(&group).copied().unwrap_or(true)
    }

    /// Requests a state change for `group`.
    pub fn propose(&self, group: GroupId, enabled: bool) -> WalStateResult {
        let mut groups = self.groups.write();
        let Some(current) = groups.get_mut(&group) else {
            return WalStateResult {
                group,
                changed: false,
                error: Some(format!("cache group {group} is not registered")),
            };
        };
        let changed = *current != enabled;
        *current = enabled;
        if changed {
            info!(group = group.0, enabled, "wal.state.changed");
        }
        WalStateResult {
            group,
            changed,
            error: None,
        }
    }
}
