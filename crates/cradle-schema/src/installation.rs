use crate::source::InstallSource;
use crate::types::{EnvName, InstallationId};
use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Name given to the first environment of a fresh installation.
pub const DEFAULT_ENV_NAME: &str = "default";

/// How an environment under `envs/` came to exist.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnvMethod {
    /// Bare interpreter environment populated by copying the master
    /// environment's packages. Recreated after every runtime upgrade.
    Copy,
    /// Found on disk without a record of how it was made. Never recreated.
    Adopted,
}

impl fmt::Display for EnvMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvMethod::Copy => write!(f, "copy"),
            EnvMethod::Adopted => write!(f, "adopted"),
        }
    }
}

/// Update-tracking metadata shown by the launcher ("last update failed: ...").
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<String>,
    /// Release tag that was live before the most recent successful update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_release: Option<String>,
    /// Snapshot file captured right before the most recent update attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety_snapshot: Option<String>,
    /// Set when the pre-update snapshot could not be taken.
    #[serde(default)]
    pub snapshot_failed: bool,
}

/// One user-visible installation, as stored by the installation registry.
///
/// The core receives this by value and never writes it back itself; every
/// mutating operation returns an [`InstallationPatch`] instead.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Installation {
    pub id: InstallationId,
    #[serde(default)]
    pub name: String,
    pub root: PathBuf,
    pub source: InstallSource,
    #[serde(default)]
    pub active_env: Option<EnvName>,
    #[serde(default)]
    pub env_methods: BTreeMap<EnvName, EnvMethod>,
    #[serde(default)]
    pub release_tag: Option<String>,
    /// Platform + accelerator identifier, e.g. `linux-x64-cu128`.
    #[serde(default)]
    pub variant: Option<String>,
    /// Snapshot files that captured each environment's plugin state.
    #[serde(default)]
    pub node_snapshots: BTreeMap<EnvName, Vec<String>>,
    #[serde(default)]
    pub update_info: UpdateInfo,
}

impl Installation {
    pub fn new(id: impl Into<InstallationId>, root: impl Into<PathBuf>, source: InstallSource) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            root: root.into(),
            source,
            active_env: None,
            env_methods: BTreeMap::new(),
            release_tag: None,
            variant: None,
            node_snapshots: BTreeMap::new(),
            update_info: UpdateInfo::default(),
        }
    }

    /// Apply a patch in place. Used by registry implementations; the core
    /// itself only produces patches.
    pub fn apply(&mut self, patch: &InstallationPatch) {
        for name in &patch.env_methods_removed {
            self.env_methods.remove(name);
            self.node_snapshots.remove(name);
            if self.active_env.as_ref() == Some(name) {
                self.active_env = None;
            }
        }
        for (name, method) in &patch.env_methods_set {
            self.env_methods.insert(name.clone(), *method);
        }
        if let Some(ref env) = patch.active_env {
            self.active_env = Some(env.clone());
        }
        if let Some(ref tag) = patch.release_tag {
            self.release_tag = Some(tag.clone());
        }
        if let Some(ref variant) = patch.variant {
            self.variant = Some(variant.clone());
        }
        for (env, file) in &patch.node_snapshots_added {
            self.node_snapshots
                .entry(env.clone())
                .or_default()
                .push(file.clone());
        }
        for file in &patch.node_snapshots_removed {
            for refs in self.node_snapshots.values_mut() {
                refs.retain(|f| f != file);
            }
        }
        if let Some(ref info) = patch.update_info {
            self.update_info = info.clone();
        }
    }
}

/// Partial update of an [`Installation`] returned by core operations.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstallationPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_env: Option<EnvName>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env_methods_set: BTreeMap<EnvName, EnvMethod>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env_methods_removed: Vec<EnvName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_snapshots_added: Vec<(EnvName, String)>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_snapshots_removed: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_info: Option<UpdateInfo>,
}

impl InstallationPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Fold a later patch into this one. Fields set by `later` win.
    pub fn merge(&mut self, later: InstallationPatch) {
        if later.active_env.is_some() {
            self.active_env = later.active_env;
        }
        for name in later.env_methods_removed {
            self.env_methods_set.remove(&name);
            self.env_methods_removed.push(name);
        }
        self.env_methods_set.extend(later.env_methods_set);
        if later.release_tag.is_some() {
            self.release_tag = later.release_tag;
        }
        if later.variant.is_some() {
            self.variant = later.variant;
        }
        self.node_snapshots_added.extend(later.node_snapshots_added);
        self.node_snapshots_removed
            .extend(later.node_snapshots_removed);
        if later.update_info.is_some() {
            self.update_info = later.update_info;
        }
    }
}

pub fn validate_env_name(name: &str) -> Result<(), SchemaError> {
    if name.is_empty() || name.len() > 64 {
        return Err(SchemaError::InvalidName(
            "environment name must be 1-64 characters".to_owned(),
        ));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return Err(SchemaError::InvalidName(format!(
            "'{name}' must match [a-zA-Z0-9_-]"
        )));
    }
    Ok(())
}
