//! Plugin (custom node) inventory: scanning and diffing.
//!
//! A scan reads the immediate children of `ComfyUI/custom_nodes/` and of
//! its `.disabled/` holding area and classifies each by the markers it
//! carries. Nothing is cached; every call reads the tree again.

use crate::CoreError;
use cradle_schema::{ChangedNode, NodeDelta, NodeId, PluginDiff, PluginKind, PluginRecord};
use cradle_store::InstallLayout;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Registry installs drop this file next to the plugin sources.
const TRACKING_FILE: &str = ".tracking";

/// Suffix used in disabled names of version-control plugins.
const NIGHTLY_SUFFIX: &str = "nightly";

/// Identifier of a plugin directory or file name: the name with any
/// `@<version>` suffix removed.
pub fn node_id(file_name: &str) -> NodeId {
    let id = file_name
        .split_once('@')
        .map_or(file_name, |(id, _)| id);
    NodeId::from(id)
}

/// Name a plugin gets when moved into the holding area.
pub fn disabled_name(record: &PluginRecord) -> String {
    match (record.kind, record.version.as_deref()) {
        (PluginKind::Registry, Some(version)) => {
            format!("{}@{}", record.id, version.replace('.', "_"))
        }
        (PluginKind::Git, _) => format!("{}@{NIGHTLY_SUFFIX}", record.id),
        _ => record.id.to_string(),
    }
}

fn is_ignored(name: &str) -> bool {
    name.starts_with('.') || name == "__pycache__"
}

/// Read `[project] version` from a plugin's `pyproject.toml`.
fn pyproject_version(dir: &Path) -> Option<String> {
    let content = fs::read_to_string(dir.join("pyproject.toml")).ok()?;
    let table: toml::Table = toml::from_str(&content).ok()?;
    table
        .get("project")?
        .get("version")?
        .as_str()
        .map(str::to_owned)
}

/// The git directory of a checkout, following a `gitdir:` file.
fn git_dir(repo: &Path) -> Option<PathBuf> {
    let dot_git = repo.join(".git");
    if dot_git.is_dir() {
        return Some(dot_git);
    }
    let content = fs::read_to_string(&dot_git).ok()?;
    let target = content.trim().strip_prefix("gitdir:")?.trim();
    let path = Path::new(target);
    Some(if path.is_absolute() {
        path.to_path_buf()
    } else {
        repo.join(path)
    })
}

fn packed_ref(git: &Path, name: &str) -> Option<String> {
    let packed = fs::read_to_string(git.join("packed-refs")).ok()?;
    packed
        .lines()
        .filter(|l| !l.starts_with('#') && !l.starts_with('^'))
        .find_map(|l| {
            let (hash, refname) = l.split_once(' ')?;
            (refname.trim() == name).then(|| hash.to_owned())
        })
}

/// Resolve `HEAD` of a checkout to a commit hash by reading the git
/// directory directly: a detached `HEAD`, a loose ref, or `packed-refs`.
pub fn resolve_git_head(repo: &Path) -> Option<String> {
    let git = git_dir(repo)?;
    let head = fs::read_to_string(git.join("HEAD")).ok()?;
    let head = head.trim();
    let Some(refname) = head.strip_prefix("ref:") else {
        return (!head.is_empty()).then(|| head.to_owned());
    };
    let refname = refname.trim();
    if let Ok(loose) = fs::read_to_string(git.join(refname)) {
        let loose = loose.trim();
        if !loose.is_empty() {
            return Some(loose.to_owned());
        }
    }
    packed_ref(&git, refname)
}

fn classify(path: &Path, name: &str, enabled: bool) -> Option<PluginRecord> {
    let (kind, version) = if path.is_dir() {
        if path.join(TRACKING_FILE).is_file() {
            (PluginKind::Registry, pyproject_version(path))
        } else if path.join(".git").exists() {
            (PluginKind::Git, resolve_git_head(path))
        } else {
            (PluginKind::Unknown, None)
        }
    } else if Path::new(name).extension().is_some_and(|e| e == "py") {
        (PluginKind::File, None)
    } else {
        return None;
    };
    Some(PluginRecord {
        id: node_id(name),
        kind,
        version,
        enabled,
        path: path.to_path_buf(),
    })
}

fn scan_dir(dir: &Path, enabled: bool, out: &mut Vec<PluginRecord>) -> Result<(), CoreError> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_ignored(&name) {
            continue;
        }
        if let Some(record) = classify(&entry.path(), &name, enabled) {
            out.push(record);
        }
    }
    Ok(())
}

/// Current plugin inventory, enabled entries first within an identifier,
/// sorted by identifier.
pub fn scan(layout: &InstallLayout) -> Result<Vec<PluginRecord>, CoreError> {
    let mut records = Vec::new();
    scan_dir(&layout.custom_nodes_dir(), true, &mut records)?;
    scan_dir(&layout.disabled_nodes_dir(), false, &mut records)?;
    records.sort_by(|a, b| a.id.cmp(&b.id).then(b.enabled.cmp(&a.enabled)));
    debug!("scanned {} plugins", records.len());
    Ok(records)
}

fn by_id(records: &[PluginRecord]) -> BTreeMap<&NodeId, &PluginRecord> {
    let mut map = BTreeMap::new();
    for r in records {
        // An id both enabled and parked in the holding area counts as enabled.
        map.entry(&r.id).or_insert(r);
    }
    map
}

/// Compare a snapshot inventory with the current one.
pub fn diff(snapshot: &[PluginRecord], current: &[PluginRecord]) -> PluginDiff {
    let then = by_id(snapshot);
    let now = by_id(current);
    let mut result = PluginDiff::default();

    for (id, cur) in &now {
        match then.get(id) {
            None => result.added.push((*cur).clone()),
            Some(snap) => {
                let mut deltas = Vec::new();
                if snap.enabled != cur.enabled {
                    deltas.push(NodeDelta::Enabled {
                        from: snap.enabled,
                        to: cur.enabled,
                    });
                }
                if snap.version != cur.version {
                    deltas.push(NodeDelta::Version {
                        from: snap.version.clone(),
                        to: cur.version.clone(),
                    });
                }
                if snap.kind != cur.kind {
                    deltas.push(NodeDelta::Kind {
                        from: snap.kind,
                        to: cur.kind,
                    });
                }
                if !deltas.is_empty() {
                    result.changed.push(ChangedNode {
                        id: (*id).clone(),
                        snapshot: (*snap).clone(),
                        current: (*cur).clone(),
                        deltas,
                    });
                }
            }
        }
    }
    for (id, snap) in &then {
        if !now.contains_key(id) {
            result.removed.push((*snap).clone());
        }
    }
    result
}
