//! Release upgrades of standalone installations, and in-place updates of
//! version-controlled ones.
//!
//! A release upgrade runs five phases strictly in order: safety snapshot,
//! download, extraction, apply and environment recreation. Download and
//! extraction only touch the scratch directory. Apply is the one phase that
//! mutates the live tree; it is journalled in the WAL step by step and runs
//! with cancellation deferred, so the installation ends up either wholly on
//! the old release or wholly on the new one, even across a crash.
//!
//! Apply in detail:
//!
//! 1. every preserved directory of the live application is moved into the
//!    extracted application (whatever the release shipped there is parked
//!    under the scratch directory and discarded);
//! 2. the application directory and the master environment are staged
//!    swaps, so both backups still exist;
//! 3. `manifest.json` is backed up and rewritten;
//! 4. a `Cleanup` WAL entry listing the backups is opened and only then is
//!    the update entry committed.
//!
//! Rolling back the update entry puts the backups in place and moves the
//! preserved directories home again. Rolling back the cleanup entry just
//! deletes the backups.

use crate::envs::EnvManager;
use crate::snapshot::SnapshotManager;
use crate::CoreError;
use cradle_runtime::{Downloader, Extractor, PythonTooling, RepoUpdateReport, RuntimeError, Vcs};
use cradle_schema::{
    CradleConfig, EnvMethod, EnvName, InstallManifest, InstallSource, Installation,
    InstallationPatch, ReleaseDescriptor, SnapshotSummary, UpdateInfo,
};
use cradle_store::{
    backup_path, python_executable, read_manifest, remove_tree, stage_swap, write_atomic,
    write_manifest, CancelToken, CopyOptions, CopyProgress, InstallLayout, Phase, ProgressEvent,
    ProgressSink, RollbackStep, StagedSwap, StoreError, WalOpKind, WriteAheadLog,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

const ARCHIVE_NAME: &str = "release.tar";

/// An environment that could not be rebuilt on the new runtime. It keeps
/// its previous contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvFailure {
    pub name: EnvName,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateReport {
    pub release_tag: String,
    pub previous_release: Option<String>,
    pub safety_snapshot: Option<String>,
    pub snapshot_failed: bool,
    pub recreated: Vec<EnvName>,
    pub env_failures: Vec<EnvFailure>,
    /// Cancellation was asked for while it could not be honored.
    pub cancel_requested: bool,
    pub patch: InstallationPatch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitUpdateReport {
    pub safety_snapshot: Option<String>,
    pub snapshot_failed: bool,
    pub repo: RepoUpdateReport,
    pub patch: InstallationPatch,
}

/// A failed update. `patch` records the failure on the installation's
/// update-tracking metadata and must still be applied by the caller.
#[derive(Debug)]
pub struct UpdateFailure {
    /// `None` when the request was rejected before any phase started.
    pub phase: Option<Phase>,
    pub error: CoreError,
    pub patch: InstallationPatch,
}

impl fmt::Display for UpdateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.phase {
            Some(phase) => write!(f, "update failed during {phase}: {}", self.error),
            None => write!(f, "update rejected: {}", self.error),
        }
    }
}

impl std::error::Error for UpdateFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Update-tracking state accumulated over one attempt.
struct Attempt {
    info: UpdateInfo,
    snapshot: Option<(EnvName, String)>,
}

impl Attempt {
    fn new(installation: &Installation) -> Self {
        Self {
            info: installation.update_info.clone(),
            snapshot: None,
        }
    }

    fn record_snapshot(&mut self, summary: Option<SnapshotSummary>) {
        match summary {
            Some(s) => {
                self.info.safety_snapshot = Some(s.filename.clone());
                self.info.snapshot_failed = false;
                self.snapshot = Some((s.env_name, s.filename));
            }
            None => {
                self.info.safety_snapshot = None;
                self.info.snapshot_failed = true;
            }
        }
    }

    fn patch(&self) -> InstallationPatch {
        InstallationPatch {
            update_info: Some(self.info.clone()),
            node_snapshots_added: self.snapshot.iter().cloned().collect(),
            ..InstallationPatch::default()
        }
    }

    fn reject(error: CoreError) -> Box<UpdateFailure> {
        Box::new(UpdateFailure {
            phase: None,
            error,
            patch: InstallationPatch::default(),
        })
    }

    fn fail(mut self, phase: Phase, error: CoreError) -> Box<UpdateFailure> {
        error!("update failed during {phase}: {error}");
        self.info.last_error = Some(error.to_string());
        self.info.last_error_at = Some(chrono::Utc::now().to_rfc3339());
        Box::new(UpdateFailure {
            phase: Some(phase),
            patch: self.patch(),
            error,
        })
    }

    fn succeed(mut self, previous_release: Option<String>) -> InstallationPatch {
        self.info.last_error = None;
        self.info.last_error_at = None;
        self.info.last_success_at = Some(chrono::Utc::now().to_rfc3339());
        self.info.previous_release = previous_release;
        self.patch()
    }
}

/// Swaps and backups of an apply whose update entry is still open.
struct StagedApply {
    swaps: Vec<StagedSwap>,
    manifest_backup: Option<PathBuf>,
}

pub struct UpdateOrchestrator<'a> {
    layout: &'a InstallLayout,
    wal: &'a WriteAheadLog,
    config: &'a CradleConfig,
    tooling: &'a dyn PythonTooling,
    downloader: &'a dyn Downloader,
    extractor: &'a dyn Extractor,
    vcs: &'a dyn Vcs,
}

impl<'a> UpdateOrchestrator<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        layout: &'a InstallLayout,
        wal: &'a WriteAheadLog,
        config: &'a CradleConfig,
        tooling: &'a dyn PythonTooling,
        downloader: &'a dyn Downloader,
        extractor: &'a dyn Extractor,
        vcs: &'a dyn Vcs,
    ) -> Self {
        Self {
            layout,
            wal,
            config,
            tooling,
            downloader,
            extractor,
            vcs,
        }
    }

    fn env_manager(&self) -> EnvManager<'a> {
        EnvManager::new(
            self.layout,
            self.wal,
            self.tooling,
            CopyOptions::with_batch_size(self.config.copy.batch_size),
            self.config.tools.python.as_deref(),
        )
    }

    /// Upgrade a standalone installation to `release`.
    pub fn run(
        &self,
        installation: &Installation,
        release: &ReleaseDescriptor,
        progress: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<UpdateReport, Box<UpdateFailure>> {
        if installation.source != InstallSource::Standalone {
            return Err(Attempt::reject(CoreError::Unsupported {
                kind: installation.source.to_string(),
                action: "release update".to_owned(),
            }));
        }
        release
            .validate()
            .map_err(|e| Attempt::reject(e.into()))?;
        info!("updating installation {} to {}", installation.id, release.tag);

        let mut attempt = Attempt::new(installation);
        let label = format!("before update to {}", release.tag);
        match self.safety_snapshot(installation, &label, progress, cancel) {
            Ok(summary) => attempt.record_snapshot(summary),
            Err(e) => return Err(attempt.fail(Phase::Snapshot, e)),
        }

        let previous_release = match read_manifest(self.layout) {
            Ok(Some(m)) => Some(m.release_tag),
            Ok(None) => installation.release_tag.clone(),
            Err(e) => {
                warn!("current manifest is unreadable: {e}");
                installation.release_tag.clone()
            }
        };

        let tmp = self.layout.update_tmp_dir();
        let applied = self.fetch_and_apply(release, &tmp, progress, cancel);
        self.remove_scratch(&tmp);
        if let Err((phase, e)) = applied {
            return Err(attempt.fail(phase, e));
        }
        let cancel_requested = cancel.is_requested();
        info!("release {} applied", release.tag);

        let (recreated, env_failures) = self.recreate_envs(installation, progress, cancel);

        let safety_snapshot = attempt.info.safety_snapshot.clone();
        let snapshot_failed = attempt.info.snapshot_failed;
        let mut patch = attempt.succeed(previous_release.clone());
        patch.release_tag = Some(release.tag.clone());
        patch.variant = Some(release.variant.clone());

        Ok(UpdateReport {
            release_tag: release.tag.clone(),
            previous_release,
            safety_snapshot,
            snapshot_failed,
            recreated,
            env_failures,
            cancel_requested,
            patch,
        })
    }

    /// Update a version-controlled installation from its remote. With
    /// `stable` (or `update.stable_only`), the newest release tag is
    /// checked out afterwards.
    pub fn git_update(
        &self,
        installation: &Installation,
        stable: bool,
        progress: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<GitUpdateReport, Box<UpdateFailure>> {
        let InstallSource::Git { ref branch, .. } = installation.source else {
            return Err(Attempt::reject(CoreError::Unsupported {
                kind: installation.source.to_string(),
                action: "git update".to_owned(),
            }));
        };
        let repo = self.layout.comfyui_dir();
        if !repo.join(".git").exists() {
            return Err(Attempt::reject(
                RuntimeError::NotFound(format!("git checkout at {}", repo.display())).into(),
            ));
        }
        let stable = stable || self.config.update.stable_only;

        let mut attempt = Attempt::new(installation);
        match self.safety_snapshot(installation, "before git update", progress, cancel) {
            Ok(summary) => attempt.record_snapshot(summary),
            Err(e) => return Err(attempt.fail(Phase::Snapshot, e)),
        }

        progress.emit(ProgressEvent::indeterminate(
            Phase::GitUpdate,
            format!("updating from origin/{branch}"),
        ));
        let report = match self.vcs.update_repository(&repo, branch, stable, cancel) {
            Ok(report) => report,
            Err(e) => return Err(attempt.fail(Phase::GitUpdate, e.into())),
        };
        info!(
            "repository updated {} -> {} ({:?})",
            report.pre_head, report.post_head, report.merge
        );
        progress.emit(ProgressEvent::new(Phase::GitUpdate, 100, "repository updated"));

        let safety_snapshot = attempt.info.safety_snapshot.clone();
        let snapshot_failed = attempt.info.snapshot_failed;
        let mut patch = attempt.succeed(Some(report.pre_head.clone()));
        patch.release_tag.clone_from(&report.checked_out_tag);

        Ok(GitUpdateReport {
            safety_snapshot,
            snapshot_failed,
            repo: report,
            patch,
        })
    }

    /// Snapshot the active environment, or the master environment when
    /// there is none. Only cancellation is an error; any other failure is
    /// logged and yields `None`.
    fn safety_snapshot(
        &self,
        installation: &Installation,
        label: &str,
        progress: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<Option<SnapshotSummary>, CoreError> {
        progress.emit(ProgressEvent::indeterminate(
            Phase::Snapshot,
            "capturing safety snapshot",
        ));
        let snapshots = SnapshotManager::new(self.layout, self.tooling);
        let saved = self
            .env_manager()
            .resolve_active(installation)
            .and_then(|active| snapshots.save_active(active.as_ref(), label, cancel));
        match saved {
            Ok(summary) => {
                progress.emit(ProgressEvent::new(Phase::Snapshot, 100, "snapshot saved"));
                Ok(Some(summary))
            }
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                warn!("safety snapshot failed, continuing without one: {e}");
                Ok(None)
            }
        }
    }

    fn fetch_and_apply(
        &self,
        release: &ReleaseDescriptor,
        tmp: &Path,
        progress: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<InstallManifest, (Phase, CoreError)> {
        let at = |phase: Phase| move |e: CoreError| (phase, e);

        if tmp.exists() {
            debug!("removing stale scratch directory {}", tmp.display());
            fs::remove_dir_all(tmp).map_err(|e| (Phase::Download, e.into()))?;
        }
        let archive = tmp.join("download").join(ARCHIVE_NAME);
        progress.emit(ProgressEvent::indeterminate(
            Phase::Download,
            format!("downloading {}", release.tag),
        ));
        let bytes = self
            .downloader
            .download(&release.urls, &archive, progress, cancel)
            .map_err(|e| (Phase::Download, e.into()))?;
        debug!("downloaded {bytes} bytes in {} part(s)", release.urls.len());

        let unpacked = tmp.join("payload");
        progress.emit(ProgressEvent::indeterminate(
            Phase::Extract,
            "extracting release",
        ));
        self.extractor
            .extract(&archive, &unpacked, progress, cancel)
            .map_err(|e| (Phase::Extract, e.into()))?;
        if let Err(e) = fs::remove_file(&archive) {
            warn!("failed to remove {}: {e}", archive.display());
        }
        let payload = locate_payload(&unpacked).map_err(at(Phase::Extract))?;
        let python_version = self
            .payload_python_version(release, &payload, cancel)
            .map_err(at(Phase::Extract))?;
        let mut manifest = InstallManifest::new(&release.tag, &release.variant, &python_version);
        manifest.comfyui_ref.clone_from(&release.comfyui_ref);

        cancel.check().map_err(|e| (Phase::Extract, e.into()))?;
        self.apply(&payload, tmp, &manifest, progress, &cancel.deferred())
            .map_err(at(Phase::Apply))?;
        Ok(manifest)
    }

    fn payload_python_version(
        &self,
        release: &ReleaseDescriptor,
        payload: &InstallLayout,
        cancel: &CancelToken,
    ) -> Result<String, CoreError> {
        if let Some(ref version) = release.python_version {
            return Ok(version.clone());
        }
        let python = python_executable(&payload.master_env_dir());
        match self.tooling.python_version(&python, cancel) {
            Ok(version) => Ok(version),
            Err(e) if e.is_cancelled() => Err(e.into()),
            Err(e) => {
                warn!("could not determine the release's interpreter version: {e}");
                Ok("unknown".to_owned())
            }
        }
    }

    fn apply(
        &self,
        payload: &InstallLayout,
        tmp: &Path,
        manifest: &InstallManifest,
        progress: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<(), CoreError> {
        self.remove_stale_backups()?;
        self.wal.initialize()?;
        let op = self.wal.begin(WalOpKind::Update, &manifest.release_tag)?;
        let mut cleanup_op = None;

        let staged = (|| -> Result<StagedApply, CoreError> {
            let staged = self.apply_staged(&op, payload, tmp, manifest, progress)?;
            let cleanup = self.wal.begin(WalOpKind::Cleanup, &manifest.release_tag)?;
            cleanup_op = Some(cleanup.clone());
            for swap in &staged.swaps {
                if let Some(backup) = swap.backup() {
                    self.wal
                        .add_rollback_step(&cleanup, RollbackStep::RemoveDir(backup.to_path_buf()))?;
                }
            }
            if let Some(ref backup) = staged.manifest_backup {
                self.wal
                    .add_rollback_step(&cleanup, RollbackStep::RemoveFile(backup.clone()))?;
            }
            self.wal
                .add_rollback_step(&cleanup, RollbackStep::RemoveDir(tmp.to_path_buf()))?;
            self.wal.commit(&op)?;
            Ok(staged)
        })();

        let staged = match staged {
            Ok(staged) => staged,
            Err(e) => {
                warn!("apply failed, rolling back: {e}");
                match self.wal.rollback(&op) {
                    // The cleanup entry deletes the backups, so it only runs
                    // once the originals are back in place.
                    Err(undo) => {
                        error!("rolling back the update failed, recovery will retry: {undo}");
                    }
                    Ok(()) => {
                        if let Some(cleanup) = cleanup_op {
                            if let Err(undo) = self.wal.rollback(&cleanup) {
                                warn!("discarding the cleanup entry failed: {undo}");
                            }
                        }
                    }
                }
                return Err(e);
            }
        };

        progress.emit(ProgressEvent::indeterminate(Phase::Apply, "removing backups"));
        let mut leftovers = false;
        for swap in staged.swaps {
            if let Some(backup) = swap.backup().map(Path::to_path_buf) {
                if let Err(e) = remove_tree(
                    &backup,
                    &|p: CopyProgress| progress.emit(p.to_event(Phase::Apply, "removed")),
                    cancel,
                ) {
                    warn!("removing {} failed: {e}", backup.display());
                }
            }
            if let Err(e) = swap.commit() {
                warn!("{e}");
                leftovers = true;
            }
        }
        if let Some(backup) = staged.manifest_backup {
            if let Err(e) = fs::remove_file(&backup) {
                warn!("failed to remove {}: {e}", backup.display());
                leftovers = true;
            }
        }
        if let Err(e) = fs::remove_dir_all(tmp) {
            warn!("failed to remove {}: {e}", tmp.display());
            leftovers = true;
        }
        if let Some(cleanup) = cleanup_op {
            if leftovers {
                warn!("cleanup entry left open, recovery will finish removing backups");
            } else if let Err(e) = self.wal.commit(&cleanup) {
                warn!("cleanup entry left open, recovery will finish it: {e}");
            }
        }
        progress.emit(ProgressEvent::new(Phase::Apply, 100, "release applied"));
        Ok(())
    }

    /// Steps 1 to 3 of the apply. Every side effect is preceded by the
    /// rollback step that undoes it.
    fn apply_staged(
        &self,
        op: &str,
        payload: &InstallLayout,
        tmp: &Path,
        manifest: &InstallManifest,
        progress: &dyn ProgressSink,
    ) -> Result<StagedApply, CoreError> {
        self.wal
            .add_rollback_step(op, RollbackStep::RemoveDir(tmp.to_path_buf()))?;

        let app = self.layout.comfyui_dir();
        let new_app = payload.comfyui_dir();
        progress.emit(ProgressEvent::indeterminate(
            Phase::Apply,
            "moving preserved directories",
        ));
        let discarded = tmp.join("incoming");
        for name in &self.config.update.preserved_dirs {
            let current = app.join(name);
            if !exists(&current) {
                continue;
            }
            let parked = new_app.join(name);
            if exists(&parked) {
                fs::create_dir_all(&discarded)?;
                fs::rename(&parked, discarded.join(name))?;
            }
            self.wal.add_rollback_step(
                op,
                RollbackStep::MoveBack {
                    from: parked.clone(),
                    to: current.clone(),
                },
            )?;
            fs::rename(&current, &parked)?;
            debug!("preserving {name}");
        }

        progress.emit(ProgressEvent::indeterminate(Phase::Apply, "swapping application"));
        self.wal.add_rollback_step(
            op,
            RollbackStep::RestoreBackup {
                backup: backup_path(&app),
                target: app.clone(),
                return_to: Some(new_app.clone()),
            },
        )?;
        let app_swap = stage_swap(&app, &new_app)?;

        progress.emit(ProgressEvent::indeterminate(Phase::Apply, "swapping runtime"));
        let runtime = self.layout.master_env_dir();
        self.wal.add_rollback_step(
            op,
            RollbackStep::RestoreBackup {
                backup: backup_path(&runtime),
                target: runtime.clone(),
                return_to: None,
            },
        )?;
        let runtime_swap = stage_swap(&runtime, &payload.master_env_dir())?;

        progress.emit(ProgressEvent::indeterminate(Phase::Apply, "writing manifest"));
        let manifest_path = self.layout.manifest_path();
        let manifest_backup = if manifest_path.is_file() {
            let backup = backup_path(&manifest_path);
            self.wal.add_rollback_step(
                op,
                RollbackStep::RestoreBackup {
                    backup: backup.clone(),
                    target: manifest_path.clone(),
                    return_to: None,
                },
            )?;
            write_atomic(&backup, &fs::read(&manifest_path)?)?;
            Some(backup)
        } else {
            self.wal
                .add_rollback_step(op, RollbackStep::RemoveFile(manifest_path.clone()))?;
            None
        };
        write_manifest(self.layout, manifest)?;

        Ok(StagedApply {
            swaps: vec![app_swap, runtime_swap],
            manifest_backup,
        })
    }

    /// A backup at apply start belongs to no open WAL entry (recovery ran
    /// when the engine was built), so restoring it later would be wrong.
    fn remove_stale_backups(&self) -> Result<(), CoreError> {
        for stale in [
            backup_path(&self.layout.comfyui_dir()),
            backup_path(&self.layout.master_env_dir()),
            backup_path(&self.layout.manifest_path()),
        ] {
            if exists(&stale) {
                warn!("removing stale backup {}", stale.display());
                remove_path(&stale)?;
            }
        }
        Ok(())
    }

    /// Remove the scratch directory unless an open update entry may still
    /// need what was moved into it.
    fn remove_scratch(&self, tmp: &Path) {
        if !tmp.exists() {
            return;
        }
        let claimed = self.wal.list_incomplete().map_or(true, |entries| {
            entries.iter().any(|e| e.kind == WalOpKind::Update)
        });
        if claimed {
            warn!(
                "keeping {} for recovery of an unfinished update",
                tmp.display()
            );
            return;
        }
        if let Err(e) = fs::remove_dir_all(tmp) {
            warn!("failed to remove {}: {e}", tmp.display());
        }
    }

    /// Rebuild every copy-method environment on the new master
    /// environment. Failures are collected, not raised: the release is
    /// already live and a failed environment keeps its old contents.
    fn recreate_envs(
        &self,
        installation: &Installation,
        progress: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> (Vec<EnvName>, Vec<EnvFailure>) {
        let envs = self.env_manager();
        let mut recreated = Vec::new();
        let mut failures = Vec::new();
        for (name, method) in &installation.env_methods {
            if *method != EnvMethod::Copy {
                debug!("not recreating {method} environment '{name}'");
                continue;
            }
            if !envs.exists(name) {
                debug!("environment '{name}' is gone, not recreating");
                continue;
            }
            if cancel.is_cancelled() {
                failures.push(EnvFailure {
                    name: name.clone(),
                    error: StoreError::Cancelled.to_string(),
                });
                continue;
            }
            match envs.recreate(name, progress, cancel) {
                Ok(report) => {
                    info!("environment '{name}' recreated ({} files)", report.files);
                    recreated.push(name.clone());
                }
                Err(e) => {
                    warn!("environment '{name}' could not be recreated: {e}");
                    failures.push(EnvFailure {
                        name: name.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        (recreated, failures)
    }
}

fn exists(path: &Path) -> bool {
    path.symlink_metadata().is_ok()
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    match path.symlink_metadata() {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn is_release_root(dir: &Path) -> bool {
    let layout = InstallLayout::new(dir);
    layout.comfyui_dir().is_dir() && layout.master_env_dir().is_dir()
}

/// The extracted release root: `dir` itself, or its only subdirectory when
/// the archive wraps everything in one top-level folder.
fn locate_payload(dir: &Path) -> Result<InstallLayout, CoreError> {
    if is_release_root(dir) {
        return Ok(InstallLayout::new(dir));
    }
    let mut subdirs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            subdirs.push(path);
        }
    }
    if let [only] = subdirs.as_slice() {
        if is_release_root(only) {
            return Ok(InstallLayout::new(only));
        }
    }
    Err(CoreError::InvalidPayload(
        "archive has no ComfyUI/ and standalone-env/ directories".to_owned(),
    ))
}
