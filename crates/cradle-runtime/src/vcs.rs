//! Version control through the `git` command line.

use crate::command::{diagnostic, run_tool, stdout_string};
use crate::RuntimeError;
use chrono::{DateTime, Local};
use cradle_store::CancelToken;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeOutcome {
    UpToDate,
    FastForward,
    Merged,
}

/// What [`Vcs::update_repository`] did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoUpdateReport {
    pub pre_head: String,
    pub post_head: String,
    /// `None` when the backup branch could not be created.
    pub backup_branch: Option<String>,
    pub merge: MergeOutcome,
    pub checked_out_tag: Option<String>,
}

pub trait Vcs: Send + Sync {
    /// Full commit hash of `HEAD`.
    fn head(&self, repo: &Path, cancel: &CancelToken) -> Result<String, RuntimeError>;

    fn checkout(&self, repo: &Path, rev: &str, cancel: &CancelToken) -> Result<(), RuntimeError>;

    /// Fetch everything from the default remote, including history a
    /// shallow clone lacks.
    fn fetch(&self, repo: &Path, cancel: &CancelToken) -> Result<(), RuntimeError>;

    /// Bring an application checkout up to date with `origin/<branch>`:
    /// stash local changes, keep a backup branch, fast-forward or merge,
    /// and with `stable` check out the newest `vX.Y.Z` tag.
    fn update_repository(
        &self,
        repo: &Path,
        branch: &str,
        stable: bool,
        cancel: &CancelToken,
    ) -> Result<RepoUpdateReport, RuntimeError>;
}

/// `backup_branch_<YYYY-mm-dd_HH_MM_SS>` in local time.
pub fn backup_branch_name(now: DateTime<Local>) -> String {
    format!("backup_branch_{}", now.format("%Y-%m-%d_%H_%M_%S"))
}

/// Pick the highest `vX.Y.Z` tag by numeric components. Tags with any
/// non-numeric component are ignored. Accepts bare names or `refs/tags/`
/// paths and returns the bare name.
pub fn latest_stable_tag<S: AsRef<str>>(tags: &[S]) -> Option<String> {
    tags.iter()
        .filter_map(|t| {
            let name = t.as_ref().trim();
            let name = name.strip_prefix("refs/tags/").unwrap_or(name);
            let numbers = name.strip_prefix('v')?;
            let parts: Result<Vec<u64>, _> = numbers.split('.').map(str::parse).collect();
            parts.ok().map(|p| (p, name.to_owned()))
        })
        .max_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, name)| name)
}

/// Shells out to `git`.
pub struct GitCli {
    git: PathBuf,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new("git")
    }
}

impl GitCli {
    pub fn new(git: impl Into<PathBuf>) -> Self {
        Self { git: git.into() }
    }

    fn base_command(&self, repo: &Path) -> Command {
        let mut command = Command::new(&self.git);
        command
            .arg("-c")
            .arg("user.name=cradle")
            .arg("-c")
            .arg("user.email=cradle@localhost")
            .arg("-c")
            .arg("safe.directory=*");
        if cfg!(windows) {
            command.arg("-c").arg("core.longpaths=true");
        }
        command.current_dir(repo).env("GIT_TERMINAL_PROMPT", "0");
        command
    }

    fn run(
        &self,
        repo: &Path,
        args: &[&str],
        cancel: &CancelToken,
    ) -> Result<String, RuntimeError> {
        let tool = format!("git {}", args.first().copied().unwrap_or_default());
        let output = run_tool(self.base_command(repo).args(args), &tool, cancel)?;
        stdout_string(&output, &tool)
    }

    /// Like [`run`](Self::run) but a non-zero exit is a `false`, not an error.
    fn probe(
        &self,
        repo: &Path,
        args: &[&str],
        cancel: &CancelToken,
    ) -> Result<bool, RuntimeError> {
        cancel.check()?;
        let output = self.base_command(repo).args(args).output()?;
        Ok(output.status.success())
    }

    /// Stash tracked changes only. Untracked files (user workflows, local
    /// configuration) stay where they are.
    fn stash(&self, repo: &Path, cancel: &CancelToken) -> Result<(), RuntimeError> {
        match self.run(repo, &["stash", "push"], cancel) {
            Ok(out) => {
                debug!("git stash: {out}");
                Ok(())
            }
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                warn!("could not stash, resetting index and retrying: {e}");
                let _ = self.run(repo, &["merge", "--abort"], cancel);
                self.run(repo, &["reset", "--mixed", "HEAD"], cancel)?;
                self.run(repo, &["stash", "push"], cancel)?;
                Ok(())
            }
        }
    }

    fn pull(
        &self,
        repo: &Path,
        branch: &str,
        cancel: &CancelToken,
    ) -> Result<MergeOutcome, RuntimeError> {
        let remote_ref = format!("refs/remotes/origin/{branch}");
        let local = self.run(repo, &["rev-parse", "HEAD"], cancel)?;
        let remote = self.run(repo, &["rev-parse", &remote_ref], cancel)?;
        if local == remote
            || self.probe(
                repo,
                &["merge-base", "--is-ancestor", &remote_ref, "HEAD"],
                cancel,
            )?
        {
            info!("already up to date");
            return Ok(MergeOutcome::UpToDate);
        }
        if self.probe(
            repo,
            &["merge-base", "--is-ancestor", "HEAD", &remote_ref],
            cancel,
        )? {
            self.run(repo, &["merge", "--ff-only", &remote_ref], cancel)?;
            return Ok(MergeOutcome::FastForward);
        }

        cancel.check()?;
        let output = self
            .base_command(repo)
            .args(["merge", "--no-edit", "-m", "Merge!", &remote_ref])
            .output()?;
        if !output.status.success() {
            let conflicts = self
                .run(repo, &["diff", "--name-only", "--diff-filter=U"], cancel)
                .unwrap_or_default();
            let _ = self.run(repo, &["merge", "--abort"], cancel);
            let detail = if conflicts.is_empty() {
                diagnostic(&output)
            } else {
                format!(
                    "merge conflicts detected in: {}",
                    conflicts.lines().collect::<Vec<_>>().join(", ")
                )
            };
            return Err(RuntimeError::ToolFailed {
                tool: "git merge".to_owned(),
                detail,
            });
        }
        Ok(MergeOutcome::Merged)
    }
}

impl Vcs for GitCli {
    fn head(&self, repo: &Path, cancel: &CancelToken) -> Result<String, RuntimeError> {
        self.run(repo, &["rev-parse", "HEAD"], cancel)
    }

    fn checkout(&self, repo: &Path, rev: &str, cancel: &CancelToken) -> Result<(), RuntimeError> {
        self.run(repo, &["checkout", "--quiet", rev], cancel)?;
        Ok(())
    }

    fn fetch(&self, repo: &Path, cancel: &CancelToken) -> Result<(), RuntimeError> {
        let shallow = self
            .run(repo, &["rev-parse", "--is-shallow-repository"], cancel)
            .is_ok_and(|s| s == "true");
        if shallow {
            self.run(repo, &["fetch", "--unshallow", "--tags", "origin"], cancel)?;
        } else {
            self.run(repo, &["fetch", "--tags", "origin"], cancel)?;
        }
        Ok(())
    }

    fn update_repository(
        &self,
        repo: &Path,
        branch: &str,
        stable: bool,
        cancel: &CancelToken,
    ) -> Result<RepoUpdateReport, RuntimeError> {
        let pre_head = self.head(repo, cancel)?;
        info!("updating {} from {pre_head}", repo.display());

        self.stash(repo, cancel)?;

        let backup = backup_branch_name(Local::now());
        let backup_branch = match self.run(repo, &["branch", &backup, "HEAD"], cancel) {
            Ok(_) => Some(backup),
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                warn!("could not create backup branch: {e}");
                None
            }
        };

        let mut refspecs = vec![format!("+refs/heads/{branch}:refs/remotes/origin/{branch}")];
        if stable {
            refspecs.push("+refs/tags/*:refs/tags/*".to_owned());
        }
        let mut fetch_args = vec!["fetch", "origin"];
        fetch_args.extend(refspecs.iter().map(String::as_str));
        self.run(repo, &fetch_args, cancel)?;

        let local_ref = format!("refs/heads/{branch}");
        if self.probe(
            repo,
            &["rev-parse", "--verify", "--quiet", &local_ref],
            cancel,
        )? {
            self.run(repo, &["checkout", "--quiet", branch], cancel)?;
        } else {
            let start = format!("origin/{branch}");
            self.run(repo, &["checkout", "--quiet", "-b", branch, &start], cancel)?;
        }

        let merge = self.pull(repo, branch, cancel)?;

        let mut checked_out_tag = None;
        if stable {
            let tags = self.run(repo, &["tag", "--list", "v*"], cancel)?;
            let tags: Vec<&str> = tags.lines().collect();
            match latest_stable_tag(&tags) {
                Some(tag) => {
                    info!("checking out stable tag {tag}");
                    let rev = format!("refs/tags/{tag}");
                    self.run(repo, &["checkout", "--quiet", &rev], cancel)?;
                    checked_out_tag = Some(tag);
                }
                None => info!("no stable tags found, staying on {branch}"),
            }
        }

        let post_head = self.head(repo, cancel)?;
        Ok(RepoUpdateReport {
            pre_head,
            post_head,
            backup_branch,
            merge,
            checked_out_tag,
        })
    }
}
