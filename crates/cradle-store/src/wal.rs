use crate::layout::InstallLayout;
use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A single rollback step that can undo part of an operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RollbackStep {
    /// Remove a directory tree (e.g. a half-built environment).
    RemoveDir(PathBuf),
    /// Remove a single file.
    RemoveFile(PathBuf),
    /// Undo a staged swap. When `backup` still exists it is renamed back to
    /// `target`; whatever occupies `target` is first moved to `return_to`
    /// (so later steps can recover things moved into it) or deleted.
    RestoreBackup {
        backup: PathBuf,
        target: PathBuf,
        return_to: Option<PathBuf>,
    },
    /// Move `from` back to `to` if it is still at `from` and `to` is free.
    MoveBack { from: PathBuf, to: PathBuf },
}

/// The type of mutating operation being tracked.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WalOpKind {
    CreateEnv,
    DeleteEnv,
    RecreateEnv,
    Update,
    /// Post-commit removal of backups and scratch space. Rolling it back
    /// finishes the cleanup.
    Cleanup,
    RestoreNodes,
    GitUpdate,
}

impl std::fmt::Display for WalOpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WalOpKind::CreateEnv => write!(f, "create-env"),
            WalOpKind::DeleteEnv => write!(f, "delete-env"),
            WalOpKind::RecreateEnv => write!(f, "recreate-env"),
            WalOpKind::Update => write!(f, "update"),
            WalOpKind::Cleanup => write!(f, "cleanup"),
            WalOpKind::RestoreNodes => write!(f, "restore-nodes"),
            WalOpKind::GitUpdate => write!(f, "git-update"),
        }
    }
}

/// A WAL entry representing an in-flight operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    pub op_id: String,
    pub kind: WalOpKind,
    /// Environment name or installation id the operation works on.
    pub subject: String,
    pub timestamp: String,
    pub rollback_steps: Vec<RollbackStep>,
}

/// Write-ahead log for crash recovery.
///
/// Mutating operations create a WAL entry before starting work,
/// append rollback steps before each side effect, and remove the entry
/// on completion. On startup, incomplete entries are rolled back.
pub struct WriteAheadLog {
    wal_dir: PathBuf,
}

impl WriteAheadLog {
    pub fn new(layout: &InstallLayout) -> Self {
        Self {
            wal_dir: layout.wal_dir(),
        }
    }

    /// Ensure the WAL directory exists.
    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.wal_dir)?;
        Ok(())
    }

    /// Begin a new WAL entry for an operation. Returns the op_id.
    pub fn begin(&self, kind: WalOpKind, subject: &str) -> Result<String, StoreError> {
        let now = chrono::Utc::now();
        let seed = format!("{kind}:{subject}:{}", now.timestamp_nanos_opt().unwrap_or(0));
        let op_id = format!(
            "{}-{}",
            now.format("%Y%m%d%H%M%S%6f"),
            &blake3::hash(seed.as_bytes()).to_hex()[..8]
        );
        let entry = WalEntry {
            op_id: op_id.clone(),
            kind,
            subject: subject.to_owned(),
            timestamp: now.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
            rollback_steps: Vec::new(),
        };
        self.write_entry(&entry)?;
        debug!("WAL begin: {kind} for {subject} (op_id={op_id})");
        Ok(op_id)
    }

    /// Append a rollback step to an existing WAL entry.
    pub fn add_rollback_step(&self, op_id: &str, step: RollbackStep) -> Result<(), StoreError> {
        let mut entry = self.read_entry(op_id)?;
        entry.rollback_steps.push(step);
        self.write_entry(&entry)?;
        Ok(())
    }

    /// Commit (remove) a WAL entry after the operation finished or was
    /// cleaned up in-process.
    pub fn commit(&self, op_id: &str) -> Result<(), StoreError> {
        let path = self.entry_path(op_id);
        if path.exists() {
            fs::remove_file(&path)?;
            crate::fsync_dir(&self.wal_dir)?;
            debug!("WAL commit: {op_id}");
        }
        Ok(())
    }

    /// Run an entry's rollback steps now and remove it. Used when an
    /// operation fails in-process and wants the same cleanup recovery
    /// would perform. If any step fails the entry is kept, so the next
    /// recovery retries it.
    pub fn rollback(&self, op_id: &str) -> Result<(), StoreError> {
        let entry = self.read_entry(op_id)?;
        let failed = rollback_entry(&entry);
        if failed > 0 {
            return Err(StoreError::RollbackIncomplete {
                op_id: op_id.to_owned(),
                failed,
            });
        }
        self.commit(op_id)
    }

    /// List all incomplete WAL entries, oldest first.
    pub fn list_incomplete(&self) -> Result<Vec<WalEntry>, StoreError> {
        if !self.wal_dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for dir_entry in fs::read_dir(&self.wal_dir)? {
            let dir_entry = dir_entry?;
            let path = dir_entry.path();
            if path.extension().is_some_and(|e| e == "json") {
                match fs::read_to_string(&path) {
                    Ok(content) => match serde_json::from_str::<WalEntry>(&content) {
                        Ok(entry) => entries.push(entry),
                        Err(e) => {
                            warn!("corrupt WAL entry {}: {e}", path.display());
                            let _ = fs::remove_file(&path);
                        }
                    },
                    Err(e) => {
                        warn!("unreadable WAL entry {}: {e}", path.display());
                        let _ = fs::remove_file(&path);
                    }
                }
            }
        }
        entries.sort_by(|a, b| a.op_id.cmp(&b.op_id));
        Ok(entries)
    }

    /// Roll back all incomplete WAL entries, oldest first.
    /// Returns the number of entries rolled back.
    ///
    /// An entry with a failed step stays in the log and recovery stops
    /// there: later entries (such as the cleanup that follows an update)
    /// must not run against a tree the earlier one failed to restore.
    pub fn recover(&self) -> Result<usize, StoreError> {
        let entries = self.list_incomplete()?;
        let mut count = 0;
        for entry in &entries {
            info!(
                "WAL recovery: rolling back {} on {} (op_id={})",
                entry.kind, entry.subject, entry.op_id
            );
            let failed = rollback_entry(entry);
            if failed > 0 {
                warn!(
                    "WAL recovery: {failed} step(s) of {} failed; keeping the entry",
                    entry.op_id
                );
                return Err(StoreError::RollbackIncomplete {
                    op_id: entry.op_id.clone(),
                    failed,
                });
            }
            self.commit(&entry.op_id)?;
            count += 1;
        }
        if count > 0 {
            info!("WAL recovery complete: {count} entries rolled back");
        }
        Ok(count)
    }

    fn entry_path(&self, op_id: &str) -> PathBuf {
        self.wal_dir.join(format!("{op_id}.json"))
    }

    fn write_entry(&self, entry: &WalEntry) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(entry)?;
        crate::write_atomic(&self.entry_path(&entry.op_id), content.as_bytes())
    }

    fn read_entry(&self, op_id: &str) -> Result<WalEntry, StoreError> {
        let content = fs::read_to_string(self.entry_path(op_id))?;
        let entry: WalEntry = serde_json::from_str(&content)?;
        Ok(entry)
    }
}

fn exists(path: &Path) -> bool {
    path.symlink_metadata().is_ok()
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Run the steps of `entry` in reverse order and return how many failed.
/// Every step is idempotent, so a failed entry can be run again.
fn rollback_entry(entry: &WalEntry) -> usize {
    let mut failed = 0;
    for step in entry.rollback_steps.iter().rev() {
        match step {
            RollbackStep::RemoveDir(path) => {
                if path.exists() {
                    if let Err(e) = fs::remove_dir_all(path) {
                        failed += 1;
                        warn!("WAL rollback: failed to remove dir {}: {e}", path.display());
                    } else {
                        debug!("WAL rollback: removed dir {}", path.display());
                    }
                }
            }
            RollbackStep::RemoveFile(path) => {
                if exists(path) {
                    if let Err(e) = fs::remove_file(path) {
                        failed += 1;
                        warn!(
                            "WAL rollback: failed to remove file {}: {e}",
                            path.display()
                        );
                    } else {
                        debug!("WAL rollback: removed file {}", path.display());
                    }
                }
            }
            RollbackStep::RestoreBackup {
                backup,
                target,
                return_to,
            } => {
                if !exists(backup) {
                    continue;
                }
                if exists(target) {
                    let cleared = match return_to {
                        Some(dest) if !exists(dest) => fs::rename(target, dest),
                        _ => remove_path(target),
                    };
                    if let Err(e) = cleared {
                        failed += 1;
                        warn!(
                            "WAL rollback: failed to clear {} before restore: {e}",
                            target.display()
                        );
                        continue;
                    }
                }
                if let Err(e) = fs::rename(backup, target) {
                    failed += 1;
                    warn!(
                        "WAL rollback: failed to restore {} from {}: {e}",
                        target.display(),
                        backup.display()
                    );
                } else {
                    debug!("WAL rollback: restored {}", target.display());
                }
            }
            RollbackStep::MoveBack { from, to } => {
                if !exists(from) || exists(to) {
                    continue;
                }
                if let Err(e) = fs::rename(from, to) {
                    failed += 1;
                    warn!(
                        "WAL rollback: failed to move {} back to {}: {e}",
                        from.display(),
                        to.display()
                    );
                } else {
                    debug!("WAL rollback: moved back {}", to.display());
                }
            }
        }
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, WriteAheadLog) {
        let dir = tempfile::tempdir().unwrap();
        let layout = InstallLayout::new(dir.path());
        layout.initialize().unwrap();
        let wal = WriteAheadLog::new(&layout);
        wal.initialize().unwrap();
        (dir, wal)
    }

    #[test]
    fn begin_creates_entry() {
        let (_dir, wal) = setup();
        let op_id = wal.begin(WalOpKind::CreateEnv, "default").unwrap();
        assert!(!op_id.is_empty());
        let entries = wal.list_incomplete().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].subject, "default");
        assert_eq!(entries[0].kind, WalOpKind::CreateEnv);
    }

    #[test]
    fn commit_removes_entry() {
        let (_dir, wal) = setup();
        let op_id = wal.begin(WalOpKind::Update, "inst").unwrap();
        assert_eq!(wal.list_incomplete().unwrap().len(), 1);
        wal.commit(&op_id).unwrap();
        assert!(wal.list_incomplete().unwrap().is_empty());
    }

    #[test]
    fn successive_begins_are_ordered() {
        let (_dir, wal) = setup();
        let first = wal.begin(WalOpKind::Update, "inst").unwrap();
        let second = wal.begin(WalOpKind::Cleanup, "inst").unwrap();
        assert_ne!(first, second);
        let entries = wal.list_incomplete().unwrap();
        assert_eq!(entries[0].op_id, first);
        assert_eq!(entries[1].op_id, second);
    }

    #[test]
    fn recover_rolls_back_incomplete() {
        let (dir, wal) = setup();
        let op_id = wal.begin(WalOpKind::CreateEnv, "env1").unwrap();

        let orphan_dir = dir.path().join("envs").join("env1");
        fs::create_dir_all(&orphan_dir).unwrap();
        fs::write(orphan_dir.join("file.txt"), "data").unwrap();

        wal.add_rollback_step(&op_id, RollbackStep::RemoveDir(orphan_dir.clone()))
            .unwrap();

        // Simulate crash: don't call commit. Recovery should clean up.
        let count = wal.recover().unwrap();
        assert_eq!(count, 1);
        assert!(
            !orphan_dir.exists(),
            "orphan dir must be removed by recovery"
        );
        assert!(wal.list_incomplete().unwrap().is_empty());
    }

    #[test]
    fn recover_removes_file_rollback_step() {
        let (dir, wal) = setup();
        let op_id = wal.begin(WalOpKind::Update, "inst").unwrap();
        let orphan_file = dir.path().join("orphan.json");
        fs::write(&orphan_file, "{}").unwrap();
        wal.add_rollback_step(&op_id, RollbackStep::RemoveFile(orphan_file.clone()))
            .unwrap();
        assert_eq!(wal.recover().unwrap(), 1);
        assert!(!orphan_file.exists());
    }

    #[test]
    fn recover_with_no_entries_is_noop() {
        let (_dir, wal) = setup();
        assert_eq!(wal.recover().unwrap(), 0);
    }

    #[test]
    fn restore_backup_over_missing_target() {
        let (dir, wal) = setup();
        let target = dir.path().join("ComfyUI");
        let backup = dir.path().join("ComfyUI.bak");
        fs::create_dir_all(&backup).unwrap();
        fs::write(backup.join("main.py"), "old").unwrap();

        let op_id = wal.begin(WalOpKind::Update, "inst").unwrap();
        wal.add_rollback_step(
            &op_id,
            RollbackStep::RestoreBackup {
                backup: backup.clone(),
                target: target.clone(),
                return_to: None,
            },
        )
        .unwrap();
        wal.recover().unwrap();
        assert_eq!(fs::read_to_string(target.join("main.py")).unwrap(), "old");
        assert!(!backup.exists());
    }

    #[test]
    fn restore_backup_returns_new_content_then_moves_back_user_dir() {
        let (dir, wal) = setup();
        // State after: user models moved into the payload, payload swapped in.
        let target = dir.path().join("ComfyUI");
        let backup = dir.path().join("ComfyUI.bak");
        let payload = dir.path().join(".update-tmp/payload/ComfyUI");
        fs::create_dir_all(&backup).unwrap();
        fs::write(backup.join("main.py"), "old").unwrap();
        fs::create_dir_all(target.join("models")).unwrap();
        fs::write(target.join("models/ckpt.safetensors"), "weights").unwrap();
        fs::write(target.join("main.py"), "new").unwrap();
        fs::create_dir_all(payload.parent().unwrap()).unwrap();

        let op_id = wal.begin(WalOpKind::Update, "inst").unwrap();
        wal.add_rollback_step(&op_id, RollbackStep::RemoveDir(dir.path().join(".update-tmp")))
            .unwrap();
        wal.add_rollback_step(
            &op_id,
            RollbackStep::MoveBack {
                from: payload.join("models"),
                to: target.join("models"),
            },
        )
        .unwrap();
        wal.add_rollback_step(
            &op_id,
            RollbackStep::RestoreBackup {
                backup: backup.clone(),
                target: target.clone(),
                return_to: Some(payload.clone()),
            },
        )
        .unwrap();
        wal.recover().unwrap();

        assert_eq!(fs::read_to_string(target.join("main.py")).unwrap(), "old");
        assert_eq!(
            fs::read_to_string(target.join("models/ckpt.safetensors")).unwrap(),
            "weights",
            "user data must survive recovery"
        );
        assert!(!dir.path().join(".update-tmp").exists());
    }

    #[test]
    fn restore_backup_without_backup_is_noop() {
        let (dir, wal) = setup();
        let target = dir.path().join("ComfyUI");
        fs::create_dir_all(&target).unwrap();
        let op_id = wal.begin(WalOpKind::Update, "inst").unwrap();
        wal.add_rollback_step(
            &op_id,
            RollbackStep::RestoreBackup {
                backup: dir.path().join("ComfyUI.bak"),
                target: target.clone(),
                return_to: None,
            },
        )
        .unwrap();
        wal.recover().unwrap();
        assert!(target.exists());
    }

    #[test]
    fn move_back_skips_when_destination_occupied() {
        let (dir, wal) = setup();
        let from = dir.path().join("a");
        let to = dir.path().join("b");
        fs::create_dir_all(&from).unwrap();
        fs::create_dir_all(&to).unwrap();
        let op_id = wal.begin(WalOpKind::RestoreNodes, "inst").unwrap();
        wal.add_rollback_step(
            &op_id,
            RollbackStep::MoveBack {
                from: from.clone(),
                to: to.clone(),
            },
        )
        .unwrap();
        wal.recover().unwrap();
        assert!(from.exists());
        assert!(to.exists());
    }

    #[test]
    fn in_process_rollback_runs_steps_and_commits() {
        let (dir, wal) = setup();
        let orphan = dir.path().join("half-built");
        fs::create_dir_all(&orphan).unwrap();
        let op_id = wal.begin(WalOpKind::CreateEnv, "x").unwrap();
        wal.add_rollback_step(&op_id, RollbackStep::RemoveDir(orphan.clone()))
            .unwrap();
        wal.rollback(&op_id).unwrap();
        assert!(!orphan.exists());
        assert!(wal.list_incomplete().unwrap().is_empty());
    }

    fn half_swapped(dir: &Path) -> (PathBuf, PathBuf, RollbackStep) {
        let target = dir.join("ComfyUI");
        let backup = dir.join("ComfyUI.bak");
        fs::create_dir_all(&backup).unwrap();
        fs::write(backup.join("main.py"), "old").unwrap();
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("main.py"), "new").unwrap();
        let step = RollbackStep::RestoreBackup {
            backup: backup.clone(),
            target: target.clone(),
            // The parent does not exist, so moving the target aside fails.
            return_to: Some(dir.join("missing/parent/ComfyUI")),
        };
        (target, backup, step)
    }

    #[test]
    fn failed_rollback_step_keeps_entry() {
        let (dir, wal) = setup();
        let (target, backup, step) = half_swapped(dir.path());
        let op_id = wal.begin(WalOpKind::Update, "inst").unwrap();
        wal.add_rollback_step(&op_id, step).unwrap();

        let err = wal.rollback(&op_id).unwrap_err();
        assert!(matches!(
            err,
            StoreError::RollbackIncomplete { op_id: ref id, failed: 1 } if *id == op_id
        ));
        assert_eq!(fs::read_to_string(target.join("main.py")).unwrap(), "new");
        assert!(backup.exists());
        let entries = wal.list_incomplete().unwrap();
        assert_eq!(entries.len(), 1, "entry must survive for the next recovery");
        assert_eq!(entries[0].op_id, op_id);

        // Once the obstacle is gone, recovery finishes the job.
        fs::create_dir_all(dir.path().join("missing/parent")).unwrap();
        assert_eq!(wal.recover().unwrap(), 1);
        assert_eq!(fs::read_to_string(target.join("main.py")).unwrap(), "old");
        assert!(!backup.exists());
        assert!(wal.list_incomplete().unwrap().is_empty());
    }

    #[test]
    fn recovery_stops_at_failed_entry() {
        let (dir, wal) = setup();
        let (_target, backup, step) = half_swapped(dir.path());
        let update = wal.begin(WalOpKind::Update, "inst").unwrap();
        wal.add_rollback_step(&update, step).unwrap();
        let cleanup = wal.begin(WalOpKind::Cleanup, "inst").unwrap();
        wal.add_rollback_step(&cleanup, RollbackStep::RemoveDir(backup.clone()))
            .unwrap();

        assert!(matches!(
            wal.recover(),
            Err(StoreError::RollbackIncomplete { failed: 1, .. })
        ));
        assert!(backup.exists(), "cleanup must not delete the only original");
        assert_eq!(wal.list_incomplete().unwrap().len(), 2);
    }

    #[test]
    fn op_kind_display() {
        assert_eq!(WalOpKind::CreateEnv.to_string(), "create-env");
        assert_eq!(WalOpKind::DeleteEnv.to_string(), "delete-env");
        assert_eq!(WalOpKind::RecreateEnv.to_string(), "recreate-env");
        assert_eq!(WalOpKind::Update.to_string(), "update");
        assert_eq!(WalOpKind::Cleanup.to_string(), "cleanup");
        assert_eq!(WalOpKind::RestoreNodes.to_string(), "restore-nodes");
        assert_eq!(WalOpKind::GitUpdate.to_string(), "git-update");
    }

    #[test]
    fn recover_corrupt_wal_entry_is_removed() {
        let (dir, wal) = setup();
        let wal_dir = dir.path().join(".cradle").join("wal");
        fs::write(wal_dir.join("corrupt-op.json"), "THIS IS NOT JSON{{{").unwrap();

        let op_id = wal.begin(WalOpKind::CreateEnv, "env1").unwrap();
        let orphan = dir.path().join("orphan_from_valid");
        fs::create_dir_all(&orphan).unwrap();
        wal.add_rollback_step(&op_id, RollbackStep::RemoveDir(orphan.clone()))
            .unwrap();

        let count = wal.recover().unwrap();
        assert_eq!(
            count, 1,
            "only the valid entry should be counted as rolled back"
        );
        assert!(!orphan.exists(), "valid rollback must still execute");
        assert!(
            !wal_dir.join("corrupt-op.json").exists(),
            "corrupt WAL entry must be removed during recovery"
        );
        assert!(wal.list_incomplete().unwrap().is_empty());
    }

    #[test]
    fn recover_leaves_version_file_unchanged() {
        let (dir, wal) = setup();
        let version_path = dir.path().join(".cradle").join("version");
        let before = fs::read_to_string(&version_path).unwrap();
        let op = wal.begin(WalOpKind::DeleteEnv, "env1").unwrap();
        wal.add_rollback_step(&op, RollbackStep::RemoveDir(dir.path().join("x")))
            .unwrap();
        wal.recover().unwrap();
        assert_eq!(before, fs::read_to_string(&version_path).unwrap());
    }
}
