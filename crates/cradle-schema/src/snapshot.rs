use crate::plugin::PluginRecord;
use crate::types::EnvName;
use crate::SchemaError;
use serde::{Deserialize, Serialize};

/// One installed Python distribution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct PackageRef {
    pub name: String,
    pub version: String,
}

/// Full snapshot payload as written to `<root>/snapshots/<file>.json`.
///
/// Header fields come first so a reader that only wants the summary can
/// stop caring after them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Snapshot {
    pub label: String,
    pub created_at: String,
    pub env_name: EnvName,
    pub package_count: usize,
    pub node_count: usize,
    pub packages: Vec<PackageRef>,
    pub nodes: Vec<PluginRecord>,
}

impl Snapshot {
    pub fn new(
        label: &str,
        env_name: EnvName,
        packages: Vec<PackageRef>,
        nodes: Vec<PluginRecord>,
    ) -> Self {
        Self {
            label: label.to_owned(),
            created_at: chrono::Utc::now().to_rfc3339(),
            env_name,
            package_count: packages.len(),
            node_count: nodes.len(),
            packages,
            nodes,
        }
    }
}

/// Snapshot metadata without the package and plugin payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotSummary {
    pub label: String,
    pub created_at: String,
    pub env_name: EnvName,
    pub node_count: usize,
    pub package_count: usize,
    /// File name inside the snapshots directory; filled in by the reader.
    #[serde(default)]
    pub filename: String,
}

#[derive(Deserialize)]
struct PipListEntry {
    name: String,
    version: String,
}

/// Parse the output of `pip list --format=json` (also emitted by
/// `uv pip list --format json`). Result is sorted by lowercase name.
pub fn parse_pip_list(json: &str) -> Result<Vec<PackageRef>, SchemaError> {
    let entries: Vec<PipListEntry> = serde_json::from_str(json.trim())?;
    let mut packages: Vec<PackageRef> = entries
        .into_iter()
        .map(|e| PackageRef {
            name: e.name,
            version: e.version,
        })
        .collect();
    packages.sort_by(|a, b| {
        a.name
            .to_ascii_lowercase()
            .cmp(&b.name.to_ascii_lowercase())
    });
    Ok(packages)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_pip_list_sorts_case_insensitively() {
        let json = r#"[
            {"name": "torch", "version": "2.5.1"},
            {"name": "Pillow", "version": "11.0.0"},
            {"name": "aiohttp", "version": "3.11.2", "editable_project_location": "/x"}
        ]"#;
        let pkgs = parse_pip_list(json).unwrap();
        let names: Vec<_> = pkgs.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["aiohttp", "Pillow", "torch"]);
        assert_eq!(pkgs[2].version, "2.5.1");
    }

    #[test]
    fn parse_pip_list_empty_array() {
        assert!(parse_pip_list("[]\n").unwrap().is_empty());
    }

    #[test]
    fn parse_pip_list_rejects_garbage() {
        assert!(parse_pip_list("Package Version\n------- -------").is_err());
    }

    #[test]
    fn summary_reads_from_full_payload() {
        let snap = Snapshot::new(
            "before upgrade",
            EnvName::from("default"),
            vec![PackageRef {
                name: "numpy".to_owned(),
                version: "2.1.0".to_owned(),
            }],
            Vec::new(),
        );
        let json = serde_json::to_string(&snap).unwrap();
        let summary: SnapshotSummary = serde_json::from_str(&json).unwrap();
        assert_eq!(summary.label, "before upgrade");
        assert_eq!(summary.package_count, 1);
        assert_eq!(summary.node_count, 0);
        assert!(summary.filename.is_empty());
    }
}
