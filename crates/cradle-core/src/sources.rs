//! Per-source behaviour of installations.
//!
//! The set of install sources is closed, so every capability here is a
//! `match` on [`InstallSource`]. Standalone and version-controlled
//! installations own a local tree and support every action; cloud and
//! remote ones can only be launched.

use crate::engine::Engine;
use crate::restore::RestoreOutcome;
use crate::update::{GitUpdateReport, UpdateReport};
use crate::CoreError;
use cradle_schema::{
    EnvMethod, EnvName, InstallAction, InstallSource, Installation, InstallationId,
    InstallationPatch, SnapshotSummary,
};
use cradle_store::{python_executable, read_manifest, CancelToken, ProgressSink};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info};

const ENTRY_POINT: &str = "main.py";

const LOCAL_ACTIONS: &[&str] = &[
    "launch",
    "update",
    "snapshot",
    "restore-nodes",
    "create-env",
    "delete-env",
    "activate-env",
];

const LAUNCH_ONLY: &[&str] = &["launch"];

/// How to start or reach an installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LaunchCommand {
    Process {
        program: PathBuf,
        args: Vec<String>,
        cwd: PathBuf,
    },
    Url { url: String },
}

/// Result of [`handle_action`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ActionOutcome {
    Launch(LaunchCommand),
    Updated(UpdateReport),
    GitUpdated(GitUpdateReport),
    Snapshot(SnapshotSummary),
    Restored(RestoreOutcome),
    Env(InstallationPatch),
}

impl ActionOutcome {
    /// The change to persist on the installation record.
    pub fn patch(&self) -> InstallationPatch {
        match self {
            ActionOutcome::Updated(report) => report.patch.clone(),
            ActionOutcome::GitUpdated(report) => report.patch.clone(),
            ActionOutcome::Snapshot(summary) => InstallationPatch {
                node_snapshots_added: vec![(summary.env_name.clone(), summary.filename.clone())],
                ..InstallationPatch::default()
            },
            ActionOutcome::Env(patch) => patch.clone(),
            ActionOutcome::Launch(_) | ActionOutcome::Restored(_) => InstallationPatch::default(),
        }
    }
}

pub fn supported_actions(source: &InstallSource) -> &'static [&'static str] {
    match source {
        InstallSource::Standalone | InstallSource::Git { .. } => LOCAL_ACTIONS,
        InstallSource::Cloud { .. } | InstallSource::Remote { .. } => LAUNCH_ONLY,
    }
}

fn unsupported(source: &InstallSource, action: &InstallAction) -> CoreError {
    CoreError::Unsupported {
        kind: source.to_string(),
        action: action.to_string(),
    }
}

/// Build the record for an installation found at the engine's root.
/// Local sources pick up the installed release from `manifest.json` and
/// adopt every environment already on disk.
pub fn build_installation(
    engine: &Engine,
    id: impl Into<InstallationId>,
    source: InstallSource,
) -> Result<Installation, CoreError> {
    let root = engine.layout().root();
    let mut installation = Installation::new(id, root, source);
    installation.name = root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if !installation.source.is_local() {
        return Ok(installation);
    }
    if !engine.layout().comfyui_dir().is_dir() {
        return Err(CoreError::InstallationNotFound(root.display().to_string()));
    }

    if let Some(manifest) = read_manifest(engine.layout())? {
        installation.release_tag = Some(manifest.release_tag);
        installation.variant = Some(manifest.variant);
    }
    let envs = engine.envs();
    for name in envs.list()? {
        debug!("adopting environment '{name}'");
        installation
            .env_methods
            .insert(EnvName::from(name), EnvMethod::Adopted);
    }
    installation.active_env = envs.resolve_active(&installation)?;
    info!(
        "built {} installation '{}' with {} environment(s)",
        installation.source,
        installation.name,
        installation.env_methods.len()
    );
    Ok(installation)
}

/// Local installations run the application's entry point with the active
/// environment's interpreter, or the master interpreter when there is no
/// environment.
pub fn launch_command(
    engine: &Engine,
    installation: &Installation,
) -> Result<LaunchCommand, CoreError> {
    match installation.source {
        InstallSource::Cloud { ref endpoint } => Ok(LaunchCommand::Url {
            url: endpoint.clone(),
        }),
        InstallSource::Remote { ref url } => Ok(LaunchCommand::Url { url: url.clone() }),
        InstallSource::Standalone | InstallSource::Git { .. } => {
            let layout = engine.layout();
            let app = layout.comfyui_dir();
            if !app.join(ENTRY_POINT).is_file() {
                return Err(CoreError::InstallationNotFound(format!(
                    "{} has no {ENTRY_POINT}",
                    app.display()
                )));
            }
            let envs = engine.envs();
            let program = match envs.resolve_active(installation)? {
                Some(env) => python_executable(&layout.env_path(&env)),
                None => envs.master_python()?,
            };
            Ok(LaunchCommand::Process {
                program,
                args: vec![ENTRY_POINT.to_owned()],
                cwd: app,
            })
        }
    }
}

/// Run `action` against `installation`. The returned outcome's
/// [`patch`](ActionOutcome::patch) must be persisted by the caller; a
/// failed update carries its own patch inside [`CoreError::Update`].
pub fn handle_action(
    engine: &Engine,
    installation: &Installation,
    action: &InstallAction,
    progress: &dyn ProgressSink,
    cancel: &CancelToken,
) -> Result<ActionOutcome, CoreError> {
    let name = action.to_string();
    if !supported_actions(&installation.source).contains(&name.as_str()) {
        return Err(unsupported(&installation.source, action));
    }
    debug!("{name} on installation {}", installation.id);

    match action {
        InstallAction::Launch => launch_command(engine, installation).map(ActionOutcome::Launch),
        InstallAction::Update { release } => match installation.source {
            InstallSource::Standalone => {
                let release = release.as_ref().ok_or(CoreError::ReleaseRequired)?;
                let report = engine
                    .updater()
                    .run(installation, release, progress, cancel)?;
                Ok(ActionOutcome::Updated(report))
            }
            InstallSource::Git { .. } => {
                let report = engine
                    .updater()
                    .git_update(installation, false, progress, cancel)?;
                Ok(ActionOutcome::GitUpdated(report))
            }
            InstallSource::Cloud { .. } | InstallSource::Remote { .. } => {
                Err(unsupported(&installation.source, action))
            }
        },
        InstallAction::Snapshot { label } => {
            let active = engine.envs().resolve_active(installation)?;
            engine
                .snapshots()
                .save_active(active.as_ref(), label, cancel)
                .map(ActionOutcome::Snapshot)
        }
        InstallAction::RestoreNodes { snapshot } => engine
            .restore_from_snapshot(snapshot, progress, cancel)
            .map(ActionOutcome::Restored),
        InstallAction::CreateEnv { name } => engine
            .envs()
            .create(name, progress, cancel)
            .map(ActionOutcome::Env),
        InstallAction::DeleteEnv { name } => engine
            .envs()
            .delete(installation, name, progress, cancel)
            .map(ActionOutcome::Env),
        InstallAction::ActivateEnv { name } => {
            engine.envs().activate(name).map(ActionOutcome::Env)
        }
    }
}
