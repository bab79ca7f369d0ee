//! Data model for Cradle installations.
//!
//! This crate defines the schema layer shared by every other crate: the
//! installation record and the partial-update patches the core hands back
//! (`Installation`, `InstallationPatch`), install-source variants,
//! the `manifest.json` describing the installed release, plugin inventory
//! records and diffs, snapshot payloads and summaries, and the TOML
//! configuration file (`CradleConfig`).

pub mod config;
pub mod installation;
pub mod manifest;
pub mod plugin;
pub mod snapshot;
pub mod source;
pub mod types;

pub use config::{
    default_config_path, CopySection, CradleConfig, ToolsSection, UpdateSection,
    DEFAULT_BATCH_SIZE,
};
pub use installation::{
    validate_env_name, EnvMethod, Installation, InstallationPatch, UpdateInfo, DEFAULT_ENV_NAME,
};
pub use manifest::{InstallManifest, ReleaseDescriptor};
pub use plugin::{
    ChangedNode, CheckedOutNode, NodeDelta, NodeNote, PluginDiff, PluginKind, PluginRecord,
    RestoreReport,
};
pub use snapshot::{parse_pip_list, PackageRef, Snapshot, SnapshotSummary};
pub use source::{InstallAction, InstallSource};
pub use types::{EnvName, InstallationId, NodeId};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to read file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid environment name: {0}")]
    InvalidName(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid release: {0}")]
    InvalidRelease(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_error_display_invalid_name() {
        let e = SchemaError::InvalidName("bad name".to_owned());
        assert!(e.to_string().contains("invalid environment name"));
        assert!(e.to_string().contains("bad name"));
    }

    #[test]
    fn schema_error_display_invalid_config() {
        let e = SchemaError::InvalidConfig("batch_size must be > 0".to_owned());
        assert!(e.to_string().contains("batch_size"));
    }
}
