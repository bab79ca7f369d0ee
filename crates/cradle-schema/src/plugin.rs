//! Plugin (custom node) inventory records, diffs, and restore reports.

use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

/// How a plugin got into the plugin directory.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PluginKind {
    /// Installed from the node registry; carries registry metadata and a version.
    Registry,
    /// Version-control checkout; versioned by commit hash.
    Git,
    /// A single loose source file.
    File,
    /// A directory with none of the known markers.
    Unknown,
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginKind::Registry => write!(f, "registry"),
            PluginKind::Git => write!(f, "git"),
            PluginKind::File => write!(f, "file"),
            PluginKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// One entry of a plugin inventory. Produced fresh by every scan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginRecord {
    pub id: NodeId,
    pub kind: PluginKind,
    /// Registry version string or full commit hash, when known.
    #[serde(default)]
    pub version: Option<String>,
    pub enabled: bool,
    pub path: PathBuf,
}

/// A single field that differs between the snapshot and the live tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "field", rename_all = "snake_case")]
pub enum NodeDelta {
    Enabled {
        from: bool,
        to: bool,
    },
    Version {
        from: Option<String>,
        to: Option<String>,
    },
    Kind {
        from: PluginKind,
        to: PluginKind,
    },
}

/// A plugin present both in the snapshot and now, with at least one delta.
/// `from` values come from the snapshot, `to` values from the live tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangedNode {
    pub id: NodeId,
    pub snapshot: PluginRecord,
    pub current: PluginRecord,
    pub deltas: Vec<NodeDelta>,
}

impl ChangedNode {
    pub fn enabled_delta(&self) -> Option<(bool, bool)> {
        self.deltas.iter().find_map(|d| match d {
            NodeDelta::Enabled { from, to } => Some((*from, *to)),
            _ => None,
        })
    }

    pub fn version_delta(&self) -> Option<(Option<&str>, Option<&str>)> {
        self.deltas.iter().find_map(|d| match d {
            NodeDelta::Version { from, to } => Some((from.as_deref(), to.as_deref())),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginDiff {
    /// Present now, absent from the snapshot.
    pub added: Vec<PluginRecord>,
    /// Present in the snapshot, absent now.
    pub removed: Vec<PluginRecord>,
    pub changed: Vec<ChangedNode>,
}

impl PluginDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    /// Every identifier mentioned by the diff.
    pub fn ids(&self) -> BTreeSet<NodeId> {
        self.added
            .iter()
            .map(|r| r.id.clone())
            .chain(self.removed.iter().map(|r| r.id.clone()))
            .chain(self.changed.iter().map(|c| c.id.clone()))
            .collect()
    }
}

/// An identifier plus a human-readable reason.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeNote {
    pub id: NodeId,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckedOutNode {
    pub id: NodeId,
    pub commit: String,
    /// The target commit was only reachable after a fetch.
    pub fetched: bool,
}

/// Outcome of applying a [`PluginDiff`]. Every identifier lands in exactly
/// one bucket.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RestoreReport {
    pub disabled: Vec<NodeId>,
    pub enabled: Vec<NodeId>,
    pub checked_out: Vec<CheckedOutNode>,
    pub skipped: Vec<NodeNote>,
    pub failed: Vec<NodeNote>,
}

impl RestoreReport {
    pub fn skip(&mut self, id: &NodeId, detail: impl Into<String>) {
        self.skipped.push(NodeNote {
            id: id.clone(),
            detail: detail.into(),
        });
    }

    pub fn fail(&mut self, id: &NodeId, detail: impl Into<String>) {
        self.failed.push(NodeNote {
            id: id.clone(),
            detail: detail.into(),
        });
    }

    /// Name of the bucket holding `id`, if any.
    pub fn bucket_of(&self, id: &NodeId) -> Option<&'static str> {
        if self.disabled.contains(id) {
            Some("disabled")
        } else if self.enabled.contains(id) {
            Some("enabled")
        } else if self.checked_out.iter().any(|c| c.id == *id) {
            Some("checked_out")
        } else if self.skipped.iter().any(|n| n.id == *id) {
            Some("skipped")
        } else if self.failed.iter().any(|n| n.id == *id) {
            Some("failed")
        } else {
            None
        }
    }

    pub fn total(&self) -> usize {
        self.disabled.len()
            + self.enabled.len()
            + self.checked_out.len()
            + self.skipped.len()
            + self.failed.len()
    }
}
