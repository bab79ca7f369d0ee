//! Concurrent tree copy and counting delete.
//!
//! `copy_tree` enumerates every file under the source first, then copies in
//! fixed-size batches. All files of a batch are copied on scoped threads and
//! the next batch starts only when the whole batch has finished, which keeps
//! the number of open file handles bounded. Progress is reported through a
//! single mutex so the reported count never goes backwards even though
//! files within a batch complete in any order.

use crate::cancel::CancelToken;
use crate::progress::CopyProgress;
use crate::StoreError;
use cradle_schema::DEFAULT_BATCH_SIZE;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Instant;
use tracing::{debug, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy)]
pub struct CopyOptions {
    pub batch_size: usize,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl CopyOptions {
    pub fn with_batch_size(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyReport {
    pub files: usize,
    pub bytes: u64,
}

/// A file found by enumeration, relative to the tree root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub rel: PathBuf,
    pub is_symlink: bool,
}

/// Enumerate regular files and symlinks under `root`, sorted by path.
/// Directories are implied by the files they contain.
pub fn list_files(root: &Path) -> Result<Vec<FileEntry>, StoreError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).min_depth(1) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(root).to_path_buf();
            StoreError::Copy {
                path,
                source: e
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("filesystem loop")),
            }
        })?;
        let ft = entry.file_type();
        if ft.is_dir() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| std::io::Error::other(e.to_string()))?
            .to_path_buf();
        files.push(FileEntry {
            rel,
            is_symlink: ft.is_symlink(),
        });
    }
    files.sort_by(|a, b| a.rel.cmp(&b.rel));
    Ok(files)
}

/// Serializes progress callbacks and drops any report that would move the
/// count backwards.
struct Reporter<'a> {
    total: usize,
    step: usize,
    start: Instant,
    last: Mutex<Option<usize>>,
    sink: &'a (dyn Fn(CopyProgress) + Sync),
}

impl<'a> Reporter<'a> {
    fn new(total: usize, sink: &'a (dyn Fn(CopyProgress) + Sync)) -> Self {
        Self {
            total,
            step: (total / 100).max(1),
            start: Instant::now(),
            last: Mutex::new(None),
            sink,
        }
    }

    fn due(&self, done: usize) -> bool {
        done % self.step == 0 || done == self.total
    }

    fn report(&self, done: usize) {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        if last.is_some_and(|prev| done <= prev) {
            return;
        }
        *last = Some(done);
        (self.sink)(CopyProgress::new(
            done,
            self.total,
            self.start.elapsed().as_secs_f64(),
        ));
    }

    fn tick(&self, done: usize) {
        if self.due(done) {
            self.report(done);
        }
    }
}

/// Copy every file under `src` into `dst`, preserving relative paths.
///
/// `dst` is created if missing and existing files in it are overwritten.
/// A failure on any file aborts the whole copy with [`StoreError::Copy`]
/// naming that file; a cancelled copy returns [`StoreError::Cancelled`].
/// In both cases `dst` is left partially populated for the caller to clean up.
pub fn copy_tree(
    src: &Path,
    dst: &Path,
    options: &CopyOptions,
    progress: &(dyn Fn(CopyProgress) + Sync),
    cancel: &CancelToken,
) -> Result<CopyReport, StoreError> {
    if !src.is_dir() {
        return Err(StoreError::NotADirectory(src.to_path_buf()));
    }
    fs::create_dir_all(dst)?;

    let files = list_files(src)?;
    let total = files.len();
    let reporter = Reporter::new(total, progress);
    reporter.report(0);
    debug!(
        "copying {total} files from {} to {} in batches of {}",
        src.display(),
        dst.display(),
        options.batch_size
    );

    let copied = AtomicUsize::new(0);
    let bytes = AtomicU64::new(0);
    let created_dirs: Mutex<HashSet<PathBuf>> = Mutex::new(HashSet::new());
    created_dirs
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(dst.to_path_buf());

    for batch in files.chunks(options.batch_size.max(1)) {
        cancel.check()?;

        let results: Vec<Result<(), StoreError>> = thread::scope(|s| {
            let handles: Vec<_> = batch
                .iter()
                .map(|entry| {
                    let copied = &copied;
                    let bytes = &bytes;
                    let created_dirs = &created_dirs;
                    let reporter = &reporter;
                    s.spawn(move || {
                        cancel.check()?;
                        let n = copy_one(src, dst, entry, created_dirs)?;
                        bytes.fetch_add(n, Ordering::Relaxed);
                        let done = copied.fetch_add(1, Ordering::SeqCst) + 1;
                        reporter.tick(done);
                        Ok(())
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join().unwrap_or_else(|_| {
                        Err(StoreError::Io(std::io::Error::other(
                            "copy worker panicked",
                        )))
                    })
                })
                .collect()
        });

        // A real failure outranks a cancellation observed by a sibling.
        let mut cancelled = false;
        for result in results {
            match result {
                Ok(()) => {}
                Err(StoreError::Cancelled) => cancelled = true,
                Err(e) => {
                    warn!("copy aborted: {e}");
                    return Err(e);
                }
            }
        }
        if cancelled {
            return Err(StoreError::Cancelled);
        }
    }

    Ok(CopyReport {
        files: copied.load(Ordering::SeqCst),
        bytes: bytes.load(Ordering::Relaxed),
    })
}

fn ensure_dir(dir: &Path, created: &Mutex<HashSet<PathBuf>>) -> std::io::Result<()> {
    let mut created = created.lock().unwrap_or_else(PoisonError::into_inner);
    if created.contains(dir) {
        return Ok(());
    }
    fs::create_dir_all(dir)?;
    created.insert(dir.to_path_buf());
    Ok(())
}

fn copy_one(
    src_root: &Path,
    dst_root: &Path,
    entry: &FileEntry,
    created_dirs: &Mutex<HashSet<PathBuf>>,
) -> Result<u64, StoreError> {
    let from = src_root.join(&entry.rel);
    let to = dst_root.join(&entry.rel);
    let wrap = |source: std::io::Error| StoreError::Copy {
        path: from.clone(),
        source,
    };

    if let Some(parent) = to.parent() {
        ensure_dir(parent, created_dirs).map_err(wrap)?;
    }

    if entry.is_symlink {
        copy_symlink(&from, &to).map_err(wrap)?;
        return Ok(0);
    }
    fs::copy(&from, &to).map_err(wrap)
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> std::io::Result<()> {
    let target = fs::read_link(from)?;
    if to.symlink_metadata().is_ok() {
        fs::remove_file(to)?;
    }
    std::os::unix::fs::symlink(target, to)
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, to: &Path) -> std::io::Result<()> {
    fs::copy(from, to).map(|_| ())
}

/// Delete `path` and everything under it, reporting per-file progress with
/// the same cadence as [`copy_tree`]. Returns the number of files removed;
/// a missing path removes nothing.
pub fn remove_tree(
    path: &Path,
    progress: &(dyn Fn(CopyProgress) + Sync),
    cancel: &CancelToken,
) -> Result<usize, StoreError> {
    if path.symlink_metadata().is_err() {
        return Ok(0);
    }
    if !path.is_dir() {
        fs::remove_file(path).map_err(|source| StoreError::Remove {
            path: path.to_path_buf(),
            source,
        })?;
        return Ok(1);
    }

    let files = list_files(path)?;
    let reporter = Reporter::new(files.len(), progress);
    reporter.report(0);

    for (i, entry) in files.iter().enumerate() {
        let done = i + 1;
        let file = path.join(&entry.rel);
        fs::remove_file(&file).map_err(|source| StoreError::Remove { path: file, source })?;
        reporter.tick(done);
        if reporter.due(done) {
            cancel.check()?;
        }
    }

    let mut dirs: Vec<PathBuf> = WalkDir::new(path)
        .contents_first(true)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_dir())
        .map(walkdir::DirEntry::into_path)
        .collect();
    // contents_first already yields children before parents; keep the root last.
    dirs.retain(|d| d != path);
    for dir in dirs {
        fs::remove_dir(&dir).map_err(|source| StoreError::Remove { path: dir, source })?;
    }
    fs::remove_dir(path).map_err(|source| StoreError::Remove {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(files.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_tree(root: &Path, count: usize) {
        for i in 0..count {
            let dir = root.join(format!("pkg{}", i % 7)).join("sub");
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join(format!("mod{i}.py")), format!("# {i}\n")).unwrap();
        }
    }

    #[test]
    fn copies_every_file_with_same_paths_and_bytes() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        make_tree(src.path(), 230);
        fs::write(src.path().join("top.txt"), "top").unwrap();

        let report = copy_tree(
            src.path(),
            &dst.path().join("out"),
            &CopyOptions::with_batch_size(50),
            &|_| {},
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(report.files, 231);

        let src_files = list_files(src.path()).unwrap();
        let dst_files = list_files(&dst.path().join("out")).unwrap();
        assert_eq!(src_files, dst_files);
        for f in &src_files {
            assert_eq!(
                fs::read(src.path().join(&f.rel)).unwrap(),
                fs::read(dst.path().join("out").join(&f.rel)).unwrap()
            );
        }
    }

    #[test]
    fn progress_is_monotonic_and_ends_at_total() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        make_tree(src.path(), 500);

        let seen = Mutex::new(Vec::new());
        copy_tree(
            src.path(),
            dst.path(),
            &CopyOptions::with_batch_size(50),
            &|p| seen.lock().unwrap().push(p),
            &CancelToken::new(),
        )
        .unwrap();

        let seen = seen.into_inner().unwrap();
        assert!(!seen.is_empty());
        assert_eq!(seen[0].copied, 0);
        assert!(seen[0].eta_secs < 0.0, "no ETA before the first file");
        for pair in seen.windows(2) {
            assert!(pair[1].copied > pair[0].copied);
        }
        let last = seen.last().unwrap();
        assert_eq!(last.copied, 500);
        assert_eq!(last.total, 500);
    }

    #[test]
    fn empty_source_reports_zero_of_zero() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let seen = Mutex::new(Vec::new());
        let report = copy_tree(
            src.path(),
            &dst.path().join("empty"),
            &CopyOptions::default(),
            &|p| seen.lock().unwrap().push(p),
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(report.files, 0);
        assert!(dst.path().join("empty").is_dir());
        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!((seen[0].copied, seen[0].total), (0, 0));
    }

    #[test]
    fn missing_source_is_not_a_directory() {
        let dst = tempfile::tempdir().unwrap();
        let err = copy_tree(
            Path::new("/nonexistent/cradle-src"),
            dst.path(),
            &CopyOptions::default(),
            &|_| {},
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::NotADirectory(_)));
    }

    #[test]
    fn cancelled_before_start_copies_nothing() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        make_tree(src.path(), 20);
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = copy_tree(
            src.path(),
            dst.path(),
            &CopyOptions::default(),
            &|_| {},
            &cancel,
        )
        .unwrap_err();
        assert!(err.is_cancelled());
        assert!(list_files(dst.path()).unwrap().is_empty());
    }

    #[test]
    fn cancel_mid_copy_stops_at_batch_boundary() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        make_tree(src.path(), 400);
        let cancel = CancelToken::new();
        let err = copy_tree(
            src.path(),
            dst.path(),
            &CopyOptions::with_batch_size(10),
            &|p| {
                if p.copied >= 40 {
                    cancel.cancel();
                }
            },
            &cancel,
        )
        .unwrap_err();
        assert!(err.is_cancelled());
        let copied = list_files(dst.path()).unwrap().len();
        assert!(copied >= 40, "copied {copied}");
        assert!(copied < 400, "copied {copied}");
    }

    #[test]
    fn failing_file_aborts_with_its_path() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        make_tree(src.path(), 30);
        // A directory where a file must go makes that one copy fail.
        fs::create_dir_all(dst.path().join("pkg0/sub/mod0.py")).unwrap();
        let err = copy_tree(
            src.path(),
            dst.path(),
            &CopyOptions::with_batch_size(5),
            &|_| {},
            &CancelToken::new(),
        )
        .unwrap_err();
        match err {
            StoreError::Copy { path, .. } => assert!(path.ends_with("pkg0/sub/mod0.py")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn batch_size_one_still_copies_everything() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        make_tree(src.path(), 12);
        let report = copy_tree(
            src.path(),
            dst.path(),
            &CopyOptions::with_batch_size(1),
            &|_| {},
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(report.files, 12);
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_recreated() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("bin")).unwrap();
        fs::write(src.path().join("bin/python3.12"), "elf").unwrap();
        std::os::unix::fs::symlink("python3.12", src.path().join("bin/python3")).unwrap();
        copy_tree(
            src.path(),
            dst.path(),
            &CopyOptions::default(),
            &|_| {},
            &CancelToken::new(),
        )
        .unwrap();
        let link = fs::read_link(dst.path().join("bin/python3")).unwrap();
        assert_eq!(link, PathBuf::from("python3.12"));
    }

    #[test]
    fn remove_tree_counts_and_removes() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("env");
        make_tree(&target, 150);
        let seen = Mutex::new(Vec::new());
        let removed = remove_tree(
            &target,
            &|p| seen.lock().unwrap().push(p.copied),
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(removed, 150);
        assert!(!target.exists());
        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.last().copied(), Some(150));
    }

    #[test]
    fn remove_tree_missing_path_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let removed =
            remove_tree(&dir.path().join("absent"), &|_| {}, &CancelToken::new()).unwrap();
        assert_eq!(removed, 0);
    }

    #[test]
    fn remove_tree_cancelled_leaves_rest() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("env");
        make_tree(&target, 300);
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = remove_tree(&target, &|_| {}, &cancel).unwrap_err();
        assert!(err.is_cancelled());
        assert!(target.exists());
        let left = list_files(&target).unwrap().len();
        assert!(left > 0 && left < 300);
    }
}
