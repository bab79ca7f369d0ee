//! Orchestration engine for Cradle installations.
//!
//! This crate ties the store primitives and external collaborators together
//! into the `Engine`: the environment manager (create, list, activate,
//! delete, recreate), the snapshot manager, the plugin scanner, differ and
//! restorer, and the update orchestrator that sequences snapshot, download,
//! extraction, the crash-safe apply and environment recreation. It also
//! provides install-source dispatch, the installation repository interface,
//! the per-installation lock and Ctrl-C handling.

pub mod concurrency;
pub mod engine;
pub mod envs;
pub mod plugins;
pub mod repository;
pub mod restore;
pub mod snapshot;
pub mod sources;
pub mod update;

pub use concurrency::{install_signal_handler, InstallLock};
pub use engine::{Collaborators, Engine};
pub use envs::EnvManager;
pub use plugins::{diff, disabled_name, node_id, scan};
pub use repository::{InstallationRepository, MemoryRepository};
pub use restore::{checkout_node_commit, NodeRestorer, RestoreOutcome};
pub use snapshot::{snapshot_filename, SnapshotManager, MASTER_SNAPSHOT_ENV};
pub use sources::{
    build_installation, handle_action, launch_command, supported_actions, ActionOutcome,
    LaunchCommand,
};
pub use update::{EnvFailure, GitUpdateReport, UpdateFailure, UpdateOrchestrator, UpdateReport};

use cradle_runtime::RuntimeError;
use cradle_schema::SchemaError;
use cradle_store::StoreError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("environment not found: {0}")]
    EnvNotFound(String),
    #[error("environment already exists: {0}")]
    EnvExists(String),
    #[error("environment '{0}' is active and cannot be deleted")]
    EnvActive(String),
    #[error("master environment not found at {0}")]
    MasterEnvMissing(PathBuf),
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),
    #[error("invalid snapshot file name: {0}")]
    InvalidSnapshotName(String),
    #[error("{kind} installations do not support {action}")]
    Unsupported { kind: String, action: String },
    #[error("updating a standalone installation needs a release descriptor")]
    ReleaseRequired,
    #[error("invalid release payload: {0}")]
    InvalidPayload(String),
    #[error("installation not found: {0}")]
    InstallationNotFound(String),
    #[error("installation at {0} is locked by another operation")]
    Locked(PathBuf),
    #[error(transparent)]
    Update(#[from] Box<UpdateFailure>),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// Whether the operation stopped because cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        match self {
            CoreError::Store(e) => e.is_cancelled(),
            CoreError::Runtime(e) => e.is_cancelled(),
            CoreError::Update(f) => f.error.is_cancelled(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_seen_through_wrappers() {
        assert!(CoreError::Store(StoreError::Cancelled).is_cancelled());
        assert!(CoreError::Runtime(RuntimeError::Store(StoreError::Cancelled)).is_cancelled());
        assert!(!CoreError::EnvNotFound("x".to_owned()).is_cancelled());
    }

    #[test]
    fn unsupported_message_names_kind_and_action() {
        let e = CoreError::Unsupported {
            kind: "cloud".to_owned(),
            action: "create-env".to_owned(),
        };
        assert_eq!(e.to_string(), "cloud installations do not support create-env");
    }
}
