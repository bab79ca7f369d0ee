//! Filesystem layer for Cradle installations.
//!
//! This crate owns everything that touches an installation's directory tree
//! without knowing what the tree means: `InstallLayout` for path conventions,
//! the concurrent copy engine and counting delete (`copy_tree`, `remove_tree`),
//! the backup-rename-restore swap primitive (`swap`, `stage_swap`), the
//! write-ahead log used for crash recovery, cancellation tokens, progress
//! types, and atomic persistence of `manifest.json`.

pub mod cancel;
pub mod copy;
pub mod layout;
pub mod manifest;
pub mod progress;
pub mod swap;
pub mod wal;

pub use cancel::CancelToken;
pub use copy::{copy_tree, list_files, remove_tree, CopyOptions, CopyReport, FileEntry};
pub use layout::{find_site_packages, python_executable, InstallLayout, LAYOUT_FORMAT_VERSION};
pub use manifest::{read_manifest, read_manifest_at, write_manifest};
pub use progress::{ChannelSink, CopyProgress, NoProgress, Phase, ProgressEvent, ProgressSink};
pub use swap::{backup_path, stage_swap, swap, StagedSwap};
pub use wal::{RollbackStep, WalEntry, WalOpKind, WriteAheadLog};

use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

/// Fsync a directory to ensure that a preceding `rename()` is durable.
///
/// On Linux with ext4 `data=ordered` (the default), renames are usually
/// durable without an explicit dir fsync, but POSIX does not guarantee this.
/// Calling `fsync()` on the parent directory makes the rename durable on
/// all filesystems and mount configurations.
pub fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    #[cfg(unix)]
    {
        let f = std::fs::File::open(dir)?;
        f.sync_all()
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
        Ok(())
    }
}

/// Write `content` to `dest` through a synced temp file in the same directory.
pub fn write_atomic(dest: &Path, content: &[u8]) -> Result<(), StoreError> {
    let dir = dest
        .parent()
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    std::fs::create_dir_all(&dir)?;
    let mut tmp = NamedTempFile::new_in(&dir)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| StoreError::Io(e.error))?;
    fsync_dir(&dir)?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to copy {}: {source}", path.display())]
    Copy {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to remove {}: {source}", path.display())]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("operation cancelled")]
    Cancelled,
    #[error("not a directory: {}", .0.display())]
    NotADirectory(PathBuf),
    #[error("swap of {} failed ({reason}); original {}", target.display(), if *restored { "restored" } else { "left at backup" })]
    SwapFailed {
        target: PathBuf,
        reason: String,
        restored: bool,
    },
    #[error("rollback of {op_id} left {failed} step(s) undone; the entry is kept for recovery")]
    RollbackIncomplete { op_id: String, failed: usize },
    #[error("backup {} could not be removed after the swap: {reason}", path.display())]
    BackupLeft { path: PathBuf, reason: String },
    #[error("layout format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("schema error: {0}")]
    Schema(#[from] cradle_schema::SchemaError),
}

impl StoreError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StoreError::Cancelled)
    }
}
