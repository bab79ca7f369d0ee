//! External collaborators of the Cradle engine.
//!
//! Everything the engine delegates to another program or to the network is
//! reached through a trait defined here: `PythonTooling` for creating
//! interpreter environments and listing installed packages, `Vcs` for git
//! checkouts and repository updates, `Downloader` for fetching release
//! archives, and `Extractor` for unpacking them. Real implementations shell
//! out (`uv`, `python -m venv`, `git`, `codesign`) or use `ureq` and `tar`;
//! the `mock` module provides in-process stand-ins for tests.

pub mod codesign;
pub mod command;
pub mod download;
pub mod extract;
pub mod mock;
pub mod prereq;
pub mod tools;
pub mod vcs;

pub use codesign::resign_binaries;
pub use download::{Downloader, HttpDownloader};
pub use extract::{Extractor, TarExtractor};
pub use prereq::{check_prereqs, format_missing, MissingPrereq};
pub use tools::{select_tooling, PythonTooling, UvTooling, VenvTooling};
pub use vcs::{
    backup_branch_name, latest_stable_tag, GitCli, MergeOutcome, RepoUpdateReport, Vcs,
};

use cradle_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("required tool '{0}' was not found")]
    ToolNotFound(String),
    #[error("{tool} failed: {detail}")]
    ToolFailed { tool: String, detail: String },
    #[error("unexpected output from {tool}: {detail}")]
    InvalidOutput { tool: String, detail: String },
    #[error("tooling '{0}' is not available")]
    ToolingUnavailable(String),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("archive error: {0}")]
    Archive(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Schema(#[from] cradle_schema::SchemaError),
}

impl RuntimeError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RuntimeError::Store(StoreError::Cancelled))
    }
}
