//! In-process stand-ins for the external collaborators.
//!
//! `MockTooling` lays out a believable environment directory without
//! running an interpreter, `MockVcs` keeps per-repository commit sets in
//! memory and mirrors `HEAD` into `.git/HEAD` so the plugin scanner sees
//! it, and `MockDownloader` serves archive bytes from a map.

use crate::download::Downloader;
use crate::tools::PythonTooling;
use crate::vcs::{backup_branch_name, MergeOutcome, RepoUpdateReport, Vcs};
use crate::RuntimeError;
use cradle_schema::PackageRef;
use cradle_store::{CancelToken, Phase, ProgressEvent, ProgressSink};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Interpreter path inside an environment created by [`MockTooling`].
pub fn mock_python_rel() -> &'static str {
    if cfg!(windows) {
        "python.exe"
    } else {
        "bin/python3"
    }
}

/// Package directory inside an environment created by [`MockTooling`].
pub fn mock_site_packages_rel() -> &'static str {
    if cfg!(windows) {
        "Lib/site-packages"
    } else {
        "lib/python3.12/site-packages"
    }
}

#[derive(Default)]
struct ToolingState {
    created: Vec<PathBuf>,
    packages: Vec<PackageRef>,
    fail_create: bool,
    poison: Option<PathBuf>,
}

#[derive(Default)]
pub struct MockTooling {
    state: Mutex<ToolingState>,
}

impl MockTooling {
    pub fn new() -> Self {
        Self::default()
    }

    /// Packages reported by [`PythonTooling::list_packages`].
    pub fn with_packages(self, packages: Vec<PackageRef>) -> Self {
        lock(&self.state).packages = packages;
        self
    }

    /// Make every `create_venv` call fail.
    pub fn failing_create(self) -> Self {
        lock(&self.state).fail_create = true;
        self
    }

    /// Pre-create a directory at `rel` (relative to site-packages) in every
    /// new environment, so copying a file to that path fails.
    pub fn poison_site_packages(self, rel: impl Into<PathBuf>) -> Self {
        lock(&self.state).poison = Some(rel.into());
        self
    }

    /// Environment directories created so far, in call order.
    pub fn created(&self) -> Vec<PathBuf> {
        lock(&self.state).created.clone()
    }
}

impl PythonTooling for MockTooling {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn create_venv(
        &self,
        base_python: &Path,
        env_dir: &Path,
        cancel: &CancelToken,
    ) -> Result<(), RuntimeError> {
        cancel.check()?;
        let mut state = lock(&self.state);
        if state.fail_create {
            return Err(RuntimeError::ToolFailed {
                tool: "mock venv".to_owned(),
                detail: format!("refusing to create {}", env_dir.display()),
            });
        }

        let python = env_dir.join(mock_python_rel());
        if let Some(parent) = python.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&python, "#!/bin/sh\n")?;
        let site = env_dir.join(mock_site_packages_rel());
        fs::create_dir_all(&site)?;
        fs::write(
            env_dir.join("pyvenv.cfg"),
            format!("home = {}\nversion = 3.12.9\n", base_python.display()),
        )?;
        if let Some(ref rel) = state.poison {
            fs::create_dir_all(site.join(rel))?;
        }
        state.created.push(env_dir.to_path_buf());
        Ok(())
    }

    fn list_packages(
        &self,
        _python: &Path,
        cancel: &CancelToken,
    ) -> Result<Vec<PackageRef>, RuntimeError> {
        cancel.check()?;
        Ok(lock(&self.state).packages.clone())
    }

    fn python_version(
        &self,
        _python: &Path,
        cancel: &CancelToken,
    ) -> Result<String, RuntimeError> {
        cancel.check()?;
        Ok("3.12.9".to_owned())
    }
}

#[derive(Debug, Clone, Default)]
struct MockRepo {
    head: String,
    local: BTreeSet<String>,
    remote: BTreeSet<String>,
    upstream: Option<String>,
    conflict: bool,
}

/// Git stand-in. A commit can be checked out once it is local; `fetch`
/// makes the remote commits local.
#[derive(Default)]
pub struct MockVcs {
    repos: Mutex<HashMap<PathBuf, MockRepo>>,
    calls: Mutex<Vec<String>>,
}

fn write_head(repo: &Path, commit: &str) -> Result<(), RuntimeError> {
    let git = repo.join(".git");
    fs::create_dir_all(&git)?;
    fs::write(git.join("HEAD"), format!("{commit}\n"))?;
    Ok(())
}

impl MockVcs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a checkout at `repo` with `head` checked out. `head` is
    /// always local; `remote` commits become local after a fetch.
    pub fn add_repo(
        &self,
        repo: &Path,
        head: &str,
        remote: &[&str],
    ) -> Result<(), RuntimeError> {
        write_head(repo, head)?;
        let mut local = BTreeSet::new();
        local.insert(head.to_owned());
        lock(&self.repos).insert(
            repo.to_path_buf(),
            MockRepo {
                head: head.to_owned(),
                local,
                remote: remote.iter().map(|s| (*s).to_owned()).collect(),
                ..MockRepo::default()
            },
        );
        Ok(())
    }

    /// Make a commit available without fetching.
    pub fn add_local_commit(&self, repo: &Path, commit: &str) {
        if let Some(r) = lock(&self.repos).get_mut(repo) {
            r.local.insert(commit.to_owned());
        }
    }

    /// Commit `update_repository` moves to.
    pub fn set_upstream(&self, repo: &Path, commit: &str) {
        if let Some(r) = lock(&self.repos).get_mut(repo) {
            r.upstream = Some(commit.to_owned());
        }
    }

    /// Make `update_repository` fail as if the merge conflicted.
    pub fn set_conflict(&self, repo: &Path) {
        if let Some(r) = lock(&self.repos).get_mut(repo) {
            r.conflict = true;
        }
    }

    /// Calls recorded as `"<op> <repo dir name> [<rev>]"`.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    fn record(&self, op: &str, repo: &Path, rev: Option<&str>) {
        let name = repo
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let entry = match rev {
            Some(rev) => format!("{op} {name} {rev}"),
            None => format!("{op} {name}"),
        };
        lock(&self.calls).push(entry);
    }

    fn unknown(repo: &Path) -> RuntimeError {
        RuntimeError::ToolFailed {
            tool: "git".to_owned(),
            detail: format!("not a git repository: {}", repo.display()),
        }
    }
}

impl Vcs for MockVcs {
    fn head(&self, repo: &Path, cancel: &CancelToken) -> Result<String, RuntimeError> {
        cancel.check()?;
        lock(&self.repos)
            .get(repo)
            .map(|r| r.head.clone())
            .ok_or_else(|| Self::unknown(repo))
    }

    fn checkout(&self, repo: &Path, rev: &str, cancel: &CancelToken) -> Result<(), RuntimeError> {
        cancel.check()?;
        self.record("checkout", repo, Some(rev));
        let mut repos = lock(&self.repos);
        let r = repos.get_mut(repo).ok_or_else(|| Self::unknown(repo))?;
        if !r.local.contains(rev) {
            return Err(RuntimeError::ToolFailed {
                tool: "git checkout".to_owned(),
                detail: format!("fatal: reference is not a tree: {rev}"),
            });
        }
        r.head = rev.to_owned();
        write_head(repo, rev)
    }

    fn fetch(&self, repo: &Path, cancel: &CancelToken) -> Result<(), RuntimeError> {
        cancel.check()?;
        self.record("fetch", repo, None);
        let mut repos = lock(&self.repos);
        let r = repos.get_mut(repo).ok_or_else(|| Self::unknown(repo))?;
        let remote = r.remote.clone();
        r.local.extend(remote);
        Ok(())
    }

    fn update_repository(
        &self,
        repo: &Path,
        branch: &str,
        _stable: bool,
        cancel: &CancelToken,
    ) -> Result<RepoUpdateReport, RuntimeError> {
        cancel.check()?;
        self.record("update", repo, Some(branch));
        let mut repos = lock(&self.repos);
        let r = repos.get_mut(repo).ok_or_else(|| Self::unknown(repo))?;
        if r.conflict {
            return Err(RuntimeError::ToolFailed {
                tool: "git merge".to_owned(),
                detail: "merge conflicts detected in: main.py".to_owned(),
            });
        }
        let pre_head = r.head.clone();
        let merge = match r.upstream.take() {
            Some(next) if next != pre_head => {
                r.local.insert(next.clone());
                r.head = next;
                MergeOutcome::FastForward
            }
            _ => MergeOutcome::UpToDate,
        };
        write_head(repo, &r.head)?;
        Ok(RepoUpdateReport {
            pre_head,
            post_head: r.head.clone(),
            backup_branch: Some(backup_branch_name(chrono::Local::now())),
            merge,
            checked_out_tag: None,
        })
    }
}

/// Serves registered URLs from memory.
#[derive(Default)]
pub struct MockDownloader {
    files: HashMap<String, Vec<u8>>,
}

impl MockDownloader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, url: &str, bytes: Vec<u8>) -> Self {
        self.files.insert(url.to_owned(), bytes);
        self
    }
}

impl Downloader for MockDownloader {
    fn download(
        &self,
        urls: &[String],
        dest: &Path,
        progress: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<u64, RuntimeError> {
        let mut content = Vec::new();
        for (i, url) in urls.iter().enumerate() {
            cancel.check()?;
            let bytes = self
                .files
                .get(url)
                .ok_or_else(|| RuntimeError::NotFound(url.clone()))?;
            content.extend_from_slice(bytes);
            let percent = i32::try_from((i + 1) * 100 / urls.len()).unwrap_or(100);
            progress.emit(ProgressEvent::new(
                Phase::Download,
                percent,
                format!("downloaded part {} of {}", i + 1, urls.len()),
            ));
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(dest, &content)?;
        Ok(content.len() as u64)
    }
}
