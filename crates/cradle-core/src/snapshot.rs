//! Point-in-time captures of an environment's packages and the plugin
//! inventory, stored as one JSON file each under `<root>/snapshots/`.

use crate::plugins::scan;
use crate::CoreError;
use cradle_runtime::PythonTooling;
use cradle_schema::{EnvName, Snapshot, SnapshotSummary};
use cradle_store::{python_executable, write_atomic, CancelToken, InstallLayout};
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const MAX_SLUG_LEN: usize = 40;

/// Environment name recorded on snapshots of the master environment.
pub const MASTER_SNAPSHOT_ENV: &str = "master";

fn slug(label: &str) -> String {
    let mut out = String::new();
    let mut dash = false;
    for c in label.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            dash = false;
        } else if !dash && !out.is_empty() {
            out.push('-');
            dash = true;
        }
        if out.len() >= MAX_SLUG_LEN {
            break;
        }
    }
    let trimmed = out.trim_end_matches('-');
    if trimmed.is_empty() {
        "snapshot".to_owned()
    } else {
        trimmed.to_owned()
    }
}

/// `<YYYYmmddTHHMMSS>-<slug(label)>-<hash8>.json`, where the hash covers
/// the serialized payload so equal labels in the same second still differ.
pub fn snapshot_filename(snapshot: &Snapshot, payload: &[u8]) -> String {
    let stamp = chrono::DateTime::parse_from_rfc3339(&snapshot.created_at)
        .map_or_else(
            |_| chrono::Utc::now().format("%Y%m%dT%H%M%S").to_string(),
            |t| t.format("%Y%m%dT%H%M%S").to_string(),
        );
    let hash = blake3::hash(payload).to_hex();
    format!("{stamp}-{}-{}.json", slug(&snapshot.label), &hash[..8])
}

pub struct SnapshotManager<'a> {
    layout: &'a InstallLayout,
    tooling: &'a dyn PythonTooling,
}

impl<'a> SnapshotManager<'a> {
    pub fn new(layout: &'a InstallLayout, tooling: &'a dyn PythonTooling) -> Self {
        Self { layout, tooling }
    }

    /// Capture environment `env_name` under `envs/`.
    pub fn save(
        &self,
        env_name: &str,
        label: &str,
        cancel: &CancelToken,
    ) -> Result<SnapshotSummary, CoreError> {
        cradle_schema::validate_env_name(env_name)?;
        let env_dir = self.layout.env_path(env_name);
        if !env_dir.is_dir() {
            return Err(CoreError::EnvNotFound(env_name.to_owned()));
        }
        self.save_at(EnvName::from(env_name), &env_dir, label, cancel)
    }

    /// Capture `active`, or the master environment when there is none.
    pub fn save_active(
        &self,
        active: Option<&EnvName>,
        label: &str,
        cancel: &CancelToken,
    ) -> Result<SnapshotSummary, CoreError> {
        match active {
            Some(env) => self.save(env, label, cancel),
            None => self.save_at(
                EnvName::from(MASTER_SNAPSHOT_ENV),
                &self.layout.master_env_dir(),
                label,
                cancel,
            ),
        }
    }

    /// Capture the environment rooted at `env_dir`, recorded as `env_name`.
    pub fn save_at(
        &self,
        env_name: EnvName,
        env_dir: &Path,
        label: &str,
        cancel: &CancelToken,
    ) -> Result<SnapshotSummary, CoreError> {
        cancel.check()?;
        let python = python_executable(env_dir);
        let packages = self.tooling.list_packages(&python, cancel)?;
        let nodes = scan(self.layout)?;
        let snapshot = Snapshot::new(label, env_name, packages, nodes);

        let payload = serde_json::to_vec_pretty(&snapshot)?;
        let filename = snapshot_filename(&snapshot, &payload);
        let dir = self.layout.snapshots_dir();
        fs::create_dir_all(&dir)?;
        write_atomic(&dir.join(&filename), &payload)?;
        info!(
            "snapshot '{label}' saved as {filename}: {} packages, {} plugins",
            snapshot.package_count, snapshot.node_count
        );

        Ok(SnapshotSummary {
            label: snapshot.label,
            created_at: snapshot.created_at,
            env_name: snapshot.env_name,
            node_count: snapshot.node_count,
            package_count: snapshot.package_count,
            filename,
        })
    }

    /// Summaries of every readable snapshot, newest first.
    pub fn list(&self) -> Result<Vec<SnapshotSummary>, CoreError> {
        let dir = self.layout.snapshots_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut summaries = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if !path.extension().is_some_and(|e| e == "json") {
                continue;
            }
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let parsed = fs::read_to_string(&path)
                .map_err(CoreError::from)
                .and_then(|c| serde_json::from_str::<SnapshotSummary>(&c).map_err(CoreError::from));
            match parsed {
                Ok(mut summary) => {
                    summary.filename = filename;
                    summaries.push(summary);
                }
                Err(e) => warn!("skipping unreadable snapshot {}: {e}", path.display()),
            }
        }
        summaries.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.filename.cmp(&a.filename))
        });
        Ok(summaries)
    }

    pub fn load(&self, filename: &str) -> Result<Snapshot, CoreError> {
        let path = self.resolve(filename)?;
        let content = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn delete(&self, filename: &str) -> Result<(), CoreError> {
        let path = self.resolve(filename)?;
        fs::remove_file(&path)?;
        debug!("deleted snapshot {filename}");
        Ok(())
    }

    /// Map a file name to a snapshot file directly inside the snapshots
    /// directory, rejecting anything that would escape it.
    fn resolve(&self, filename: &str) -> Result<PathBuf, CoreError> {
        let invalid = || CoreError::InvalidSnapshotName(filename.to_owned());
        if filename.is_empty()
            || filename.contains(['/', '\\'])
            || Path::new(filename).file_name() != Some(OsStr::new(filename))
        {
            return Err(invalid());
        }
        let dir = self.layout.snapshots_dir();
        let path = dir.join(filename);
        if !path.is_file() {
            return Err(CoreError::SnapshotNotFound(filename.to_owned()));
        }
        let canonical_dir = dir.canonicalize()?;
        let canonical = path.canonicalize()?;
        if canonical.parent() != Some(canonical_dir.as_path()) {
            return Err(invalid());
        }
        Ok(path)
    }
}
