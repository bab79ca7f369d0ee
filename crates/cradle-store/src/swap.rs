//! Backup-rename-restore directory swap.
//!
//! Replacing `old` with `new` is done with two renames on the same
//! filesystem: `old -> old.bak`, then `new -> old`. If the second rename
//! fails the backup is renamed back, so `old` always holds either the
//! previous or the replacement content. A [`StagedSwap`] keeps the backup
//! around until the caller commits, which lets several swaps be reverted
//! together.

use crate::StoreError;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// `<old>.bak` next to `old`.
pub fn backup_path(old: &Path) -> PathBuf {
    let mut name = old
        .file_name()
        .map_or_else(OsString::new, std::ffi::OsStr::to_os_string);
    name.push(".bak");
    old.with_file_name(name)
}

fn remove_any(path: &Path) -> std::io::Result<()> {
    match path.symlink_metadata() {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Err(e) = crate::fsync_dir(parent) {
            warn!("failed to fsync {}: {e}", parent.display());
        }
    }
}

/// A swap whose backup still exists.
#[must_use = "a staged swap must be committed or reverted"]
#[derive(Debug)]
pub struct StagedSwap {
    target: PathBuf,
    backup: Option<PathBuf>,
}

impl StagedSwap {
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Backup of the previous content; `None` when the target did not exist.
    pub fn backup(&self) -> Option<&Path> {
        self.backup.as_deref()
    }

    /// Delete the backup. The swap itself is already in place; a backup
    /// that cannot be removed is reported as [`StoreError::BackupLeft`].
    pub fn commit(self) -> Result<(), StoreError> {
        self.commit_with(remove_any)
    }

    fn commit_with(
        self,
        remove: impl FnOnce(&Path) -> std::io::Result<()>,
    ) -> Result<(), StoreError> {
        let Some(backup) = self.backup else {
            return Ok(());
        };
        match remove(&backup) {
            Ok(()) => {
                debug!("swap committed: {}", self.target.display());
                Ok(())
            }
            Err(e) => {
                warn!("failed to remove swap backup {}: {e}", backup.display());
                Err(StoreError::BackupLeft {
                    path: backup,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Put the previous content back, discarding the replacement.
    pub fn revert(self) -> Result<(), StoreError> {
        remove_any(&self.target)?;
        if let Some(ref backup) = self.backup {
            fs::rename(backup, &self.target)?;
        }
        sync_parent(&self.target);
        debug!("swap reverted: {}", self.target.display());
        Ok(())
    }
}

/// Move `new` into place at `old`, keeping the previous content at
/// [`backup_path`] until the returned [`StagedSwap`] is committed.
///
/// A stale backup from an earlier interrupted run is removed first. On
/// error, `old` holds its previous content whenever the restore rename
/// succeeded; the `restored` flag of [`StoreError::SwapFailed`] says which.
pub fn stage_swap(old: &Path, new: &Path) -> Result<StagedSwap, StoreError> {
    let backup = backup_path(old);
    remove_any(&backup)?;

    let had_old = old.symlink_metadata().is_ok();
    if had_old {
        fs::rename(old, &backup).map_err(|e| StoreError::SwapFailed {
            target: old.to_path_buf(),
            reason: format!("could not move current content aside: {e}"),
            restored: true,
        })?;
    }

    if let Err(e) = fs::rename(new, old) {
        let reason = format!("could not move {} into place: {e}", new.display());
        if !had_old {
            return Err(StoreError::SwapFailed {
                target: old.to_path_buf(),
                reason,
                restored: true,
            });
        }
        let restored = match fs::rename(&backup, old) {
            Ok(()) => true,
            Err(restore_err) => {
                warn!(
                    "failed to restore {} from {}: {restore_err}",
                    old.display(),
                    backup.display()
                );
                false
            }
        };
        sync_parent(old);
        return Err(StoreError::SwapFailed {
            target: old.to_path_buf(),
            reason,
            restored,
        });
    }

    sync_parent(old);
    debug!("swap staged: {} <- {}", old.display(), new.display());
    Ok(StagedSwap {
        target: old.to_path_buf(),
        backup: had_old.then_some(backup),
    })
}

/// Replace `old` with `new` and delete the previous content.
///
/// Returns [`StoreError::BackupLeft`] when the new content is in place but
/// the backup could not be deleted.
pub fn swap(old: &Path, new: &Path) -> Result<(), StoreError> {
    stage_swap(old, new)?.commit()
}
