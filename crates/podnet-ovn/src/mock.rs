use crate::command::{command_line, CommandOutput};
use crate::error::{OvnError, Result};
use crate::traits::CommandExecutor;
use async_trait::async_trait;
use regex::Regex;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// How an expected command is matched against the rendered command line
#[derive(Debug, Clone)]
pub enum CmdMatcher {
    Exact(String),
    Pattern(Regex),
}

impl CmdMatcher {
    fn matches(&self, line: &str) -> bool {
        match self {
            CmdMatcher::Exact(expected) => expected == line,
            CmdMatcher::Pattern(re) => re.is_match(line),
        }
    }
}

impl std::fmt::Display for CmdMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CmdMatcher::Exact(s) => write!(f, "{}", s),
            CmdMatcher::Pattern(re) => write!(f, "/{}/", re.as_str()),
        }
    }
}

/// One queued expectation with its canned result
#[derive(Debug, Clone)]
pub struct ExpectedCmd {
    pub matcher: CmdMatcher,
    pub output: CommandOutput,
}

impl ExpectedCmd {
    /// Expect exactly this command line and answer with `stdout`
    pub fn new(cmd: impl Into<String>, stdout: impl Into<String>) -> Self {
        Self {
            matcher: CmdMatcher::Exact(cmd.into()),
            output: CommandOutput::success(stdout),
        }
    }

    /// Expect a command line matching `pattern`
    pub fn pattern(pattern: &str, stdout: impl Into<String>) -> Result<Self> {
        let re = Regex::new(pattern).map_err(|e| {
            OvnError::invalid_config(
                format!("Invalid command pattern '{}': {}", pattern, e),
                "Use a valid regular expression",
            )
        })?;
        Ok(Self {
            matcher: CmdMatcher::Pattern(re),
            output: CommandOutput::success(stdout),
        })
    }

    /// Answer with a non-zero exit code instead
    pub fn failing(mut self, exit_code: i32, stderr: impl Into<String>) -> Self {
        self.output = CommandOutput::failure(exit_code, stderr);
        self
    }
}

#[derive(Debug, Default)]
struct FakeExecState {
    expected: VecDeque<ExpectedCmd>,
    executed: Vec<String>,
    unexpected: Vec<String>,
}

/// Fake command executor for tests
///
/// Holds an ordered queue of expected command lines. Each call must match the
/// head of the queue; the canned output is returned and the expectation is
/// consumed. Anything else is recorded as unexpected and fails the call.
#[derive(Debug, Default)]
pub struct FakeExec {
    state: Mutex<FakeExecState>,
}

impl FakeExec {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeExecState> {
        // A panicking test thread must not hide the queue from the assertions
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_cmd(&self, cmd: ExpectedCmd) {
        self.lock().expected.push_back(cmd);
    }

    /// Queue commands that succeed with no output
    pub fn add_cmds_no_output<I, S>(&self, cmds: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.lock();
        for cmd in cmds {
            state.expected.push_back(ExpectedCmd::new(cmd, ""));
        }
    }

    /// True when every queued expectation ran and nothing unexpected did
    pub fn called_matches_expected(&self) -> bool {
        let state = self.lock();
        state.expected.is_empty() && state.unexpected.is_empty()
    }

    /// Number of expectations not yet consumed
    pub fn pending(&self) -> usize {
        self.lock().expected.len()
    }

    /// Command lines executed so far, in order
    pub fn executed(&self) -> Vec<String> {
        self.lock().executed.clone()
    }

    pub fn unexpected(&self) -> Vec<String> {
        self.lock().unexpected.clone()
    }

    /// Wait until the queue drains or `timeout` elapses
    pub async fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.called_matches_expected() {
                return true;
            }
            if !self.unexpected().is_empty() || tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl CommandExecutor for FakeExec {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let line = command_line(program, args);
        let mut state = self.lock();

        let matched = state
            .expected
            .front()
            .map(|head| head.matcher.matches(&line))
            .unwrap_or(false);

        if !matched {
            let expected = state
                .expected
                .front()
                .map(|head| head.matcher.to_string())
                .unwrap_or_else(|| "<nothing>".to_string());
            debug!("FakeExec: unexpected command: {}", line);
            state.unexpected.push(line.clone());
            return Err(OvnError::unexpected_command(line, expected));
        }

        let head = state
            .expected
            .pop_front()
            .ok_or_else(|| OvnError::internal_error("FakeExec queue emptied while locked"))?;
        debug!("FakeExec: {}", line);
        state.executed.push(line);
        Ok(head.output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(line: &str) -> Vec<String> {
        line.split(' ').map(String::from).collect()
    }

    #[tokio::test]
    async fn test_exact_match_consumes_in_order() {
        let fexec = FakeExec::new();
        fexec.add_cmd(ExpectedCmd::new("ovn-nbctl --timeout=15 show", "switch"));
        fexec.add_cmds_no_output(["ovn-nbctl --timeout=15 lsp-del p"]);

        let out = fexec
            .run("ovn-nbctl", &args("--timeout=15 show"))
            .await
            .unwrap();
        assert_eq!(out.stdout, "switch");
        assert!(!fexec.called_matches_expected());

        fexec
            .run("ovn-nbctl", &args("--timeout=15 lsp-del p"))
            .await
            .unwrap();
        assert!(fexec.called_matches_expected());
        assert_eq!(fexec.executed().len(), 2);
    }

    #[tokio::test]
    async fn test_out_of_order_command_is_rejected() {
        let fexec = FakeExec::new();
        fexec.add_cmds_no_output(["ovn-nbctl --timeout=15 lsp-del a"]);

        let err = fexec
            .run("ovn-nbctl", &args("--timeout=15 lsp-del b"))
            .await
            .unwrap_err();
        assert!(matches!(err, OvnError::UnexpectedCommand { .. }));
        assert_eq!(fexec.pending(), 1);
        assert!(!fexec.called_matches_expected());
    }

    #[tokio::test]
    async fn test_pattern_match_and_failure_output() {
        let fexec = FakeExec::new();
        fexec.add_cmd(
            ExpectedCmd::pattern(r"^ovn-nbctl --timeout=\d+ lsp-del \S+$", "")
                .unwrap()
                .failing(1, "ovn-nbctl: database connection failed"),
        );

        let out = fexec
            .run("ovn-nbctl", &args("--timeout=15 lsp-del anything"))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 1);
        assert!(fexec.called_matches_expected());
    }

    #[tokio::test]
    async fn test_wait_drained_times_out() {
        let fexec = FakeExec::new();
        fexec.add_cmds_no_output(["ovn-nbctl --timeout=15 show"]);
        assert!(!fexec.wait_drained(Duration::from_millis(20)).await);
    }
}
