//! Install-source variants.
//!
//! Each installation was produced by exactly one kind of source. The set is
//! closed: behaviour per kind is chosen by matching on [`InstallSource`],
//! never by looking up methods dynamically.

use crate::manifest::ReleaseDescriptor;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InstallSource {
    /// Portable release archive: application code plus a bundled master
    /// interpreter environment (`standalone-env/`).
    Standalone,
    /// Application code is a version-controlled checkout that is updated in
    /// place; the runtime still comes from the master environment.
    Git {
        repo_url: String,
        #[serde(default = "default_branch")]
        branch: String,
    },
    /// Hosted instance reached over HTTP; nothing is managed locally.
    Cloud { endpoint: String },
    /// Reference to an instance running elsewhere on the network.
    Remote { url: String },
}

fn default_branch() -> String {
    "master".to_owned()
}

impl InstallSource {
    /// Whether this source owns a local directory tree the core may mutate.
    pub fn is_local(&self) -> bool {
        matches!(self, InstallSource::Standalone | InstallSource::Git { .. })
    }
}

impl fmt::Display for InstallSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallSource::Standalone => write!(f, "standalone"),
            InstallSource::Git { .. } => write!(f, "git"),
            InstallSource::Cloud { .. } => write!(f, "cloud"),
            InstallSource::Remote { .. } => write!(f, "remote"),
        }
    }
}

/// Operations a launcher can request on an installation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum InstallAction {
    Launch,
    /// Standalone installations need a release; version-controlled ones
    /// update from their remote and ignore it.
    Update {
        #[serde(default)]
        release: Option<ReleaseDescriptor>,
    },
    Snapshot { label: String },
    RestoreNodes { snapshot: String },
    CreateEnv { name: String },
    DeleteEnv { name: String },
    ActivateEnv { name: String },
}

impl fmt::Display for InstallAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallAction::Launch => write!(f, "launch"),
            InstallAction::Update { .. } => write!(f, "update"),
            InstallAction::Snapshot { .. } => write!(f, "snapshot"),
            InstallAction::RestoreNodes { .. } => write!(f, "restore-nodes"),
            InstallAction::CreateEnv { .. } => write!(f, "create-env"),
            InstallAction::DeleteEnv { .. } => write!(f, "delete-env"),
            InstallAction::ActivateEnv { .. } => write!(f, "activate-env"),
        }
    }
}
