use crate::command::{run_tool, stdout_string};
use crate::RuntimeError;
use cradle_schema::{parse_pip_list, PackageRef, ToolsSection};
use cradle_store::CancelToken;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Interpreter tooling used to materialize and inspect environments.
pub trait PythonTooling: Send + Sync {
    fn name(&self) -> &str;

    /// Create a bare environment at `env_dir` whose interpreter is
    /// `base_python`. No packages are installed; the caller fills the
    /// package directory itself.
    fn create_venv(
        &self,
        base_python: &Path,
        env_dir: &Path,
        cancel: &CancelToken,
    ) -> Result<(), RuntimeError>;

    /// Exact installed distributions of the environment owning `python`.
    fn list_packages(
        &self,
        python: &Path,
        cancel: &CancelToken,
    ) -> Result<Vec<PackageRef>, RuntimeError>;

    /// Full interpreter version, e.g. `3.12.9`.
    fn python_version(&self, python: &Path, cancel: &CancelToken)
        -> Result<String, RuntimeError>;
}

/// Environments via `uv venv`, packages via `uv pip list`.
pub struct UvTooling {
    uv: PathBuf,
}

impl UvTooling {
    pub fn new(uv: impl Into<PathBuf>) -> Self {
        Self { uv: uv.into() }
    }
}

impl PythonTooling for UvTooling {
    fn name(&self) -> &'static str {
        "uv"
    }

    fn create_venv(
        &self,
        base_python: &Path,
        env_dir: &Path,
        cancel: &CancelToken,
    ) -> Result<(), RuntimeError> {
        run_tool(
            Command::new(&self.uv)
                .arg("venv")
                .arg("--python")
                .arg(base_python)
                .arg(env_dir),
            "uv venv",
            cancel,
        )?;
        Ok(())
    }

    fn list_packages(
        &self,
        python: &Path,
        cancel: &CancelToken,
    ) -> Result<Vec<PackageRef>, RuntimeError> {
        let output = run_tool(
            Command::new(&self.uv)
                .args(["pip", "list", "--format", "json", "--python"])
                .arg(python),
            "uv pip list",
            cancel,
        )?;
        Ok(parse_pip_list(&stdout_string(&output, "uv pip list")?)?)
    }

    fn python_version(
        &self,
        python: &Path,
        cancel: &CancelToken,
    ) -> Result<String, RuntimeError> {
        interpreter_version(python, cancel)
    }
}

/// Environments via the standard library `venv` module of the master
/// interpreter, packages via `pip`.
#[derive(Default)]
pub struct VenvTooling;

impl PythonTooling for VenvTooling {
    fn name(&self) -> &'static str {
        "venv"
    }

    fn create_venv(
        &self,
        base_python: &Path,
        env_dir: &Path,
        cancel: &CancelToken,
    ) -> Result<(), RuntimeError> {
        run_tool(
            Command::new(base_python)
                .args(["-m", "venv", "--without-pip"])
                .arg(env_dir),
            "python -m venv",
            cancel,
        )?;
        Ok(())
    }

    fn list_packages(
        &self,
        python: &Path,
        cancel: &CancelToken,
    ) -> Result<Vec<PackageRef>, RuntimeError> {
        let output = run_tool(
            Command::new(python).args([
                "-m",
                "pip",
                "list",
                "--format=json",
                "--disable-pip-version-check",
            ]),
            "pip list",
            cancel,
        )?;
        Ok(parse_pip_list(&stdout_string(&output, "pip list")?)?)
    }

    fn python_version(
        &self,
        python: &Path,
        cancel: &CancelToken,
    ) -> Result<String, RuntimeError> {
        interpreter_version(python, cancel)
    }
}

fn interpreter_version(python: &Path, cancel: &CancelToken) -> Result<String, RuntimeError> {
    let output = run_tool(
        Command::new(python).arg("--version"),
        "python --version",
        cancel,
    )?;
    // Older interpreters print the version on stderr.
    let text = if output.stdout.is_empty() {
        String::from_utf8_lossy(&output.stderr).into_owned()
    } else {
        String::from_utf8_lossy(&output.stdout).into_owned()
    };
    parse_version_line(&text).ok_or_else(|| RuntimeError::InvalidOutput {
        tool: "python --version".to_owned(),
        detail: text.trim().to_owned(),
    })
}

/// `"Python 3.12.9\n"` -> `"3.12.9"`.
pub fn parse_version_line(text: &str) -> Option<String> {
    let version = text.trim().strip_prefix("Python ")?.trim();
    if version.is_empty() || !version.starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }
    Some(version.to_owned())
}

/// Choose interpreter tooling by name: `uv`, `venv`, or `mock`.
/// `auto` picks `uv` when a path is configured, `venv` otherwise.
pub fn select_tooling(
    name: &str,
    tools: &ToolsSection,
) -> Result<Box<dyn PythonTooling>, RuntimeError> {
    match name {
        "auto" => Ok(match tools.uv {
            Some(ref uv) => Box::new(UvTooling::new(uv)),
            None => Box::new(VenvTooling),
        }),
        "uv" => Ok(Box::new(UvTooling::new(
            tools.uv.clone().unwrap_or_else(|| PathBuf::from("uv")),
        ))),
        "venv" => Ok(Box::new(VenvTooling)),
        "mock" => Ok(Box::new(crate::mock::MockTooling::new())),
        other => Err(RuntimeError::ToolingUnavailable(other.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_version_line_variants() {
        assert_eq!(parse_version_line("Python 3.12.9\n").as_deref(), Some("3.12.9"));
        assert_eq!(parse_version_line("Python 3.13.0rc1").as_deref(), Some("3.13.0rc1"));
        assert_eq!(parse_version_line("pypy 7"), None);
        assert_eq!(parse_version_line("Python "), None);
    }

    #[test]
    fn select_known_toolings() {
        let tools = ToolsSection::default();
        assert_eq!(select_tooling("venv", &tools).unwrap().name(), "venv");
        assert_eq!(select_tooling("uv", &tools).unwrap().name(), "uv");
        assert_eq!(select_tooling("mock", &tools).unwrap().name(), "mock");
        assert_eq!(select_tooling("auto", &tools).unwrap().name(), "venv");
    }

    #[test]
    fn auto_prefers_configured_uv() {
        let tools = ToolsSection {
            uv: Some(PathBuf::from("/opt/uv")),
            ..ToolsSection::default()
        };
        assert_eq!(select_tooling("auto", &tools).unwrap().name(), "uv");
    }

    #[test]
    fn select_unknown_tooling_fails() {
        assert!(select_tooling("conda", &ToolsSection::default()).is_err());
    }

    #[test]
    fn missing_uv_binary_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let uv = UvTooling::new(dir.path().join("no-uv-here"));
        let err = uv
            .create_venv(Path::new("python3"), &dir.path().join("env"), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, RuntimeError::ToolNotFound(_)));
    }
}
