use crate::error::{OvnError, Result};
use crate::traits::CommandExecutor;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Output from a command execution
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code,
        }
    }
}

/// Render a command line for logs and error messages
pub fn command_line(program: &str, args: &[String]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}

/// Executes commands as child processes with a per-call timeout
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    timeout: Duration,
}

impl ProcessExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let line = command_line(program, args);
        debug!("Executing: {}", line);

        // kill_on_drop reaps the child when the timeout drops the future
        let child = tokio::process::Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| OvnError::timeout(&line, self.timeout.as_secs()))?
            .map_err(|e| OvnError::command_failed(&line, -1, e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code().unwrap_or(-1);

        debug!("Command exited with code {}: {}", exit_code, line);

        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line() {
        let args = vec!["--timeout=15".to_string(), "show".to_string()];
        assert_eq!(command_line("ovn-nbctl", &args), "ovn-nbctl --timeout=15 show");
        assert_eq!(command_line("ovn-nbctl", &[]), "ovn-nbctl");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_executor_captures_output() {
        let exec = ProcessExecutor::new(Duration::from_secs(5));
        let output = exec
            .run("sh", &["-c".to_string(), "echo out; echo err >&2; exit 3".to_string()])
            .await
            .unwrap();
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
        assert_eq!(output.exit_code, 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_executor_times_out() {
        let exec = ProcessExecutor::new(Duration::from_millis(50));
        let err = exec
            .run("sleep", &["5".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, OvnError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_process_executor_missing_program() {
        let exec = ProcessExecutor::new(Duration::from_secs(5));
        let err = exec
            .run("podnet-definitely-not-a-binary", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, OvnError::CommandFailed { exit_code: -1, .. }));
    }
}
