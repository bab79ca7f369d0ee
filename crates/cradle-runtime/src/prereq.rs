use cradle_schema::ToolsSection;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

/// A missing prerequisite with actionable install instructions.
#[derive(Debug)]
pub struct MissingPrereq {
    pub name: String,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

fn command_runs(program: &Path) -> bool {
    Command::new(program)
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Check the external tools the engine shells out to.
///
/// `master_python` is the interpreter of the installation's master
/// environment, when one is known. Returns an empty list when everything
/// needed is present.
pub fn check_prereqs(tools: &ToolsSection, master_python: Option<&Path>) -> Vec<MissingPrereq> {
    let mut missing = Vec::new();

    let git = tools.git.clone().unwrap_or_else(|| PathBuf::from("git"));
    if !command_runs(&git) {
        missing.push(MissingPrereq {
            name: git.display().to_string(),
            purpose: "plugin checkouts and version-controlled installations",
            install_hint: "https://git-scm.com/downloads, or your package manager",
        });
    }

    if let Some(ref uv) = tools.uv {
        if !command_runs(uv) {
            missing.push(MissingPrereq {
                name: uv.display().to_string(),
                purpose: "creating environments (configured in [tools] uv)",
                install_hint: "https://docs.astral.sh/uv/, or remove the setting to use venv",
            });
        }
    }

    let python = tools.python.as_deref().or(master_python);
    if let Some(python) = python {
        if !command_runs(python) {
            missing.push(MissingPrereq {
                name: python.display().to_string(),
                purpose: "master interpreter for new environments",
                install_hint: "reinstall the release, or set [tools] python",
            });
        }
    }

    missing
}

/// Format a list of missing prerequisites into a user-friendly error message.
pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str("\nCradle needs these tools to manage environments and plugins.");
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_prereq_display() {
        let m = MissingPrereq {
            name: "git".to_owned(),
            purpose: "plugin checkouts",
            install_hint: "apt install git",
        };
        let s = format!("{m}");
        assert!(s.contains("git"));
        assert!(s.contains("plugin checkouts"));
        assert!(s.contains("apt install git"));
    }

    #[test]
    fn format_missing_produces_readable_output() {
        let items = vec![
            MissingPrereq {
                name: "git".to_owned(),
                purpose: "checkouts",
                install_hint: "apt install git",
            },
            MissingPrereq {
                name: "uv".to_owned(),
                purpose: "environments",
                install_hint: "pipx install uv",
            },
        ];
        let output = format_missing(&items);
        assert!(output.contains("missing prerequisites:"));
        assert!(output.contains("git"));
        assert!(output.contains("uv"));
    }

    #[test]
    fn configured_but_missing_tools_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let tools = ToolsSection {
            uv: Some(dir.path().join("no-uv")),
            git: Some(dir.path().join("no-git")),
            python: Some(dir.path().join("no-python")),
        };
        let missing = check_prereqs(&tools, None);
        assert_eq!(missing.len(), 3);
    }
}
