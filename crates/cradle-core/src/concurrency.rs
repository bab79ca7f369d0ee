use crate::CoreError;
use cradle_store::{CancelToken, InstallLayout};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;
use tracing::debug;

/// Exclusive advisory lock on an installation (`.cradle/.lock`).
///
/// The operation dispatcher holds one of these around every mutating
/// operation so a single installation tree has at most one writer.
pub struct InstallLock {
    lock_file: File,
}

fn open_lock_file(lock_path: &Path) -> Result<File, CoreError> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(lock_path)?)
}

impl InstallLock {
    /// Block until the lock is available.
    pub fn acquire(layout: &InstallLayout) -> Result<Self, CoreError> {
        let lock_path = layout.lock_file();
        let file = open_lock_file(&lock_path)?;
        file.lock_exclusive()
            .map_err(|e| CoreError::Io(std::io::Error::new(std::io::ErrorKind::WouldBlock, e)))?;
        debug!("acquired {}", lock_path.display());
        Ok(Self { lock_file: file })
    }

    pub fn try_acquire(layout: &InstallLayout) -> Result<Option<Self>, CoreError> {
        let file = open_lock_file(&layout.lock_file())?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { lock_file: file })),
            Err(_) => Ok(None),
        }
    }

    /// Like [`try_acquire`](Self::try_acquire), but a held lock is an error.
    pub fn acquire_or_fail(layout: &InstallLayout) -> Result<Self, CoreError> {
        Self::try_acquire(layout)?.ok_or_else(|| CoreError::Locked(layout.root().to_path_buf()))
    }
}

impl Drop for InstallLock {
    fn drop(&mut self) {
        let _ = self.lock_file.unlock();
    }
}

/// Route Ctrl-C into a cancellation token. A second Ctrl-C exits at once.
pub fn install_signal_handler() -> CancelToken {
    let token = CancelToken::new();
    let handler_token = token.clone();
    let _ = ctrlc::set_handler(move || {
        if handler_token.is_requested() {
            std::process::exit(130);
        }
        handler_token.cancel();
        eprintln!("\ncancellation requested, finishing current step...");
    });
    token
}
