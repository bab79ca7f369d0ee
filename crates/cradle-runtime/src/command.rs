use crate::RuntimeError;
use cradle_store::CancelToken;
use std::process::{Command, Output};
use tracing::debug;

/// Run an external tool to completion and require a zero exit status.
///
/// Cancellation is checked before the process starts. A missing binary
/// becomes [`RuntimeError::ToolNotFound`]; a non-zero exit becomes
/// [`RuntimeError::ToolFailed`] with the tool's stderr (or stdout when
/// stderr is empty) attached.
pub fn run_tool(
    command: &mut Command,
    tool: &str,
    cancel: &CancelToken,
) -> Result<Output, RuntimeError> {
    cancel.check()?;
    debug!("running {tool}: {command:?}");
    let output = command.output().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            RuntimeError::ToolNotFound(command.get_program().to_string_lossy().into_owned())
        } else {
            RuntimeError::Io(e)
        }
    })?;
    if !output.status.success() {
        return Err(RuntimeError::ToolFailed {
            tool: tool.to_owned(),
            detail: diagnostic(&output),
        });
    }
    Ok(output)
}

/// Trimmed stderr, falling back to stdout, then to the exit status.
pub fn diagnostic(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
    if !stderr.is_empty() {
        return stderr;
    }
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_owned();
    if !stdout.is_empty() {
        return stdout;
    }
    format!("exited with {}", output.status)
}

pub fn stdout_string(output: &Output, tool: &str) -> Result<String, RuntimeError> {
    String::from_utf8(output.stdout.clone())
        .map(|s| s.trim().to_owned())
        .map_err(|_| RuntimeError::InvalidOutput {
            tool: tool.to_owned(),
            detail: "non-UTF-8 output".to_owned(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_binary_is_tool_not_found() {
        let mut cmd = Command::new("cradle-definitely-not-a-real-tool");
        let err = run_tool(&mut cmd, "fake", &CancelToken::new()).unwrap_err();
        assert!(matches!(err, RuntimeError::ToolNotFound(_)));
    }

    #[test]
    fn cancelled_before_spawn() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut cmd = Command::new("cradle-definitely-not-a-real-tool");
        let err = run_tool(&mut cmd, "fake", &cancel).unwrap_err();
        assert!(err.is_cancelled());
    }

    #[cfg(unix)]
    #[test]
    fn failing_tool_reports_stderr() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo boom >&2; exit 3"]);
        let err = run_tool(&mut cmd, "sh", &CancelToken::new()).unwrap_err();
        match err {
            RuntimeError::ToolFailed { tool, detail } => {
                assert_eq!(tool, "sh");
                assert_eq!(detail, "boom");
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn successful_tool_returns_stdout() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo hello"]);
        let out = run_tool(&mut cmd, "sh", &CancelToken::new()).unwrap();
        assert_eq!(stdout_string(&out, "sh").unwrap(), "hello");
    }
}
