//! Applying a plugin diff to the live tree.
//!
//! The snapshot is the target state. Every identifier in the diff ends up
//! in exactly one bucket of the [`RestoreReport`]; a failure on one entry
//! is recorded and the remaining entries are still processed. Each move is
//! a single rename registered in the WAL, so an interrupted restore is
//! undone on the next start.

use crate::plugins::disabled_name;
use crate::CoreError;
use cradle_runtime::{RuntimeError, Vcs};
use cradle_schema::{ChangedNode, PluginDiff, PluginKind, PluginRecord, RestoreReport};
use cradle_store::{
    CancelToken, InstallLayout, Phase, ProgressEvent, ProgressSink, RollbackStep, WalOpKind,
    WriteAheadLog,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Diff and report of a restore from a snapshot file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreOutcome {
    pub snapshot: String,
    pub diff: PluginDiff,
    pub report: RestoreReport,
}

/// Check out `commit` in `repo`, fetching once if it is not available
/// locally. Returns whether a fetch was needed.
pub fn checkout_node_commit(
    vcs: &dyn Vcs,
    repo: &Path,
    commit: &str,
    cancel: &CancelToken,
) -> Result<bool, RuntimeError> {
    match vcs.checkout(repo, commit, cancel) {
        Ok(()) => Ok(false),
        Err(e) if e.is_cancelled() => Err(e),
        Err(e) => {
            debug!("checkout of {commit} failed, fetching: {e}");
            vcs.fetch(repo, cancel)?;
            vcs.checkout(repo, commit, cancel)?;
            Ok(true)
        }
    }
}

pub struct NodeRestorer<'a> {
    layout: &'a InstallLayout,
    wal: &'a WriteAheadLog,
    vcs: &'a dyn Vcs,
}

enum Applied {
    Disabled,
    Enabled,
    CheckedOut { commit: String, fetched: bool },
    Skipped(String),
}

impl<'a> NodeRestorer<'a> {
    pub fn new(layout: &'a InstallLayout, wal: &'a WriteAheadLog, vcs: &'a dyn Vcs) -> Self {
        Self { layout, wal, vcs }
    }

    pub fn restore(
        &self,
        diff: &PluginDiff,
        progress: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<RestoreReport, CoreError> {
        let mut report = RestoreReport::default();
        let total = diff.added.len() + diff.removed.len() + diff.changed.len();
        info!("restoring plugin state: {total} entries");

        self.wal.initialize()?;
        let op = self.wal.begin(WalOpKind::RestoreNodes, "custom_nodes")?;
        let mut done = 0;
        let mut step = |report_status: &str| {
            done += 1;
            let percent = i32::try_from(done * 100 / total.max(1)).unwrap_or(100);
            progress.emit(ProgressEvent::new(Phase::RestoreNodes, percent, report_status));
        };

        let result = (|| -> Result<(), CoreError> {
            for record in &diff.added {
                cancel.check()?;
                let outcome = if record.kind == PluginKind::File {
                    Ok(Applied::Skipped(
                        "loose files are not moved".to_owned(),
                    ))
                } else if !record.enabled {
                    Ok(Applied::Skipped("already disabled".to_owned()))
                } else {
                    self.disable(&op, record).map(|_| Applied::Disabled)
                };
                record_outcome(&mut report, record, outcome)?;
                step(&record.id);
            }
            for record in &diff.removed {
                report.skip(&record.id, "no longer present");
                step(&record.id);
            }
            for changed in &diff.changed {
                cancel.check()?;
                let outcome = self.apply_change(&op, changed, cancel);
                record_outcome(&mut report, &changed.current, outcome)?;
                step(&changed.id);
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                self.wal.commit(&op)?;
                info!(
                    "restore finished: {} disabled, {} enabled, {} checked out, {} skipped, {} failed",
                    report.disabled.len(),
                    report.enabled.len(),
                    report.checked_out.len(),
                    report.skipped.len(),
                    report.failed.len()
                );
                Ok(report)
            }
            Err(e) => {
                warn!("restore interrupted, undoing moves: {e}");
                if let Err(undo) = self.wal.rollback(&op) {
                    warn!("undoing restore moves failed: {undo}");
                }
                Err(e)
            }
        }
    }

    fn apply_change(
        &self,
        op: &str,
        changed: &ChangedNode,
        cancel: &CancelToken,
    ) -> Result<Applied, CoreError> {
        let target_commit = match (changed.current.kind, changed.version_delta()) {
            (PluginKind::Git, Some((Some(commit), _))) => Some(commit.to_owned()),
            _ => None,
        };

        if let Some((was_enabled, _)) = changed.enabled_delta() {
            let (applied, moved_to) = if was_enabled {
                (Applied::Enabled, self.enable(op, &changed.current)?)
            } else {
                (Applied::Disabled, self.disable(op, &changed.current)?)
            };
            if let Some(commit) = target_commit {
                match checkout_node_commit(self.vcs, &moved_to, &commit, cancel) {
                    Ok(_) => {}
                    Err(e) if e.is_cancelled() => return Err(e.into()),
                    Err(e) => {
                        return Err(CoreError::Runtime(RuntimeError::ToolFailed {
                            tool: "checkout after move".to_owned(),
                            detail: format!("moved to {}, but {e}", moved_to.display()),
                        }));
                    }
                }
            }
            return Ok(applied);
        }

        if let Some((from, _)) = changed.version_delta() {
            return match changed.current.kind {
                PluginKind::Git => match from {
                    Some(commit) => {
                        let fetched =
                            checkout_node_commit(self.vcs, &changed.current.path, commit, cancel)?;
                        Ok(Applied::CheckedOut {
                            commit: commit.to_owned(),
                            fetched,
                        })
                    }
                    None => Ok(Applied::Skipped(
                        "snapshot has no commit recorded".to_owned(),
                    )),
                },
                PluginKind::Registry => Ok(Applied::Skipped(
                    "registry version switches are not supported".to_owned(),
                )),
                _ => Ok(Applied::Skipped("version change on unversioned plugin".to_owned())),
            };
        }

        Ok(Applied::Skipped("plugin kind changed".to_owned()))
    }

    /// Move an enabled plugin into the holding area. Returns its new path.
    fn disable(&self, op: &str, record: &PluginRecord) -> Result<PathBuf, CoreError> {
        let holding = self.layout.disabled_nodes_dir();
        fs::create_dir_all(&holding)?;
        let dest = holding.join(disabled_name(record));
        self.rename(op, &record.path, &dest)?;
        debug!("disabled {}", record.id);
        Ok(dest)
    }

    /// Move a parked plugin back into the plugin directory under its bare id.
    fn enable(&self, op: &str, record: &PluginRecord) -> Result<PathBuf, CoreError> {
        let dest = self.layout.custom_nodes_dir().join(record.id.as_str());
        self.rename(op, &record.path, &dest)?;
        debug!("enabled {}", record.id);
        Ok(dest)
    }

    fn rename(&self, op: &str, from: &Path, to: &Path) -> Result<(), CoreError> {
        if to.symlink_metadata().is_ok() {
            return Err(CoreError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("{} already exists", to.display()),
            )));
        }
        self.wal.add_rollback_step(
            op,
            RollbackStep::MoveBack {
                from: to.to_path_buf(),
                to: from.to_path_buf(),
            },
        )?;
        fs::rename(from, to)?;
        Ok(())
    }
}

/// File an entry's outcome. Cancellation and WAL failures abort the whole
/// restore; anything else is a per-entry failure.
fn record_outcome(
    report: &mut RestoreReport,
    record: &PluginRecord,
    outcome: Result<Applied, CoreError>,
) -> Result<(), CoreError> {
    match outcome {
        Ok(Applied::Disabled) => report.disabled.push(record.id.clone()),
        Ok(Applied::Enabled) => report.enabled.push(record.id.clone()),
        Ok(Applied::CheckedOut { commit, fetched }) => {
            report.checked_out.push(cradle_schema::CheckedOutNode {
                id: record.id.clone(),
                commit,
                fetched,
            });
        }
        Ok(Applied::Skipped(reason)) => report.skip(&record.id, reason),
        Err(e) if e.is_cancelled() || matches!(e, CoreError::Store(_)) => return Err(e),
        Err(e) => {
            warn!("restoring {} failed: {e}", record.id);
            report.fail(&record.id, e.to_string());
        }
    }
    Ok(())
}
