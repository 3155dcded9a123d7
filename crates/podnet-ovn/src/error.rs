use miette::Diagnostic;
use thiserror::Error;

/// Error type for control-plane commands and pod reconciliation
///
/// Every variant is scoped to a single pod or command; none of them is fatal
/// to the controller process.
#[derive(Error, Debug, Diagnostic)]
pub enum OvnError {
    /// A northbound command exited non-zero
    #[error("Command '{command}' failed with exit code {exit_code}")]
    #[diagnostic(code(podnet::ovn::command_failed), help("stderr: {stderr}"))]
    CommandFailed {
        #[allow(unused)]
        command: String,
        #[allow(unused)]
        exit_code: i32,
        #[allow(unused)]
        stderr: String,
    },

    /// A northbound command did not complete in time
    #[error("Command '{command}' timed out after {timeout_secs}s")]
    #[diagnostic(
        code(podnet::ovn::timeout),
        help("Check that the northbound database is reachable. The pod will be retried on its next event or resync")
    )]
    Timeout {
        #[allow(unused)]
        command: String,
        #[allow(unused)]
        timeout_secs: u64,
    },

    /// The fake executor received a command it was not told to expect
    #[error("Unexpected command '{command}' (expected: {expected})")]
    #[diagnostic(
        code(podnet::ovn::unexpected_command),
        help("Queue the command on the FakeExec before driving the controller")
    )]
    UnexpectedCommand {
        #[allow(unused)]
        command: String,
        #[allow(unused)]
        expected: String,
    },

    /// The control plane returned data that violates an invariant
    #[error("Inconsistent control-plane state for '{subject}': {message}")]
    #[diagnostic(
        code(podnet::ovn::inconsistent),
        help("The pod will be retried with full inventory context on its next event or resync")
    )]
    Inconsistent {
        #[allow(unused)]
        subject: String,
        #[allow(unused)]
        message: String,
    },

    /// No free address left in a node subnet
    #[error("Address pool exhausted: no free addresses in {cidr}")]
    #[diagnostic(
        code(podnet::ovn::pool_exhausted),
        help("Expand the node subnet or delete unused pods to free addresses")
    )]
    PoolExhausted {
        #[allow(unused)]
        cidr: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    #[diagnostic(code(podnet::ovn::invalid_config), help("{suggestion}"))]
    InvalidConfig {
        #[allow(unused)]
        message: String,
        #[allow(unused)]
        suggestion: String,
    },

    /// Optimistic-concurrency conflict writing a pod
    #[error("Conflict updating pod {pod}")]
    #[diagnostic(
        code(podnet::ovn::conflict),
        help("The pod was modified concurrently. Re-read it and reapply the change")
    )]
    Conflict {
        #[allow(unused)]
        pod: String,
    },

    /// Pod does not exist in the orchestration API
    #[error("Pod not found: {pod}")]
    #[diagnostic(
        code(podnet::ovn::pod_not_found),
        help("The pod may have been deleted while it was being reconciled")
    )]
    PodNotFound {
        #[allow(unused)]
        pod: String,
    },

    /// Orchestration API request failed
    #[error("API request failed: {message}")]
    #[diagnostic(
        code(podnet::ovn::api_error),
        help("Check that the API server URL is correct and the server is running")
    )]
    ApiError {
        #[allow(unused)]
        message: String,
    },

    /// Core library error
    #[error(transparent)]
    #[diagnostic(transparent)]
    Core(#[from] podnet_core::PodnetError),

    /// Internal error
    #[error("Internal controller error: {message}")]
    #[diagnostic(
        code(podnet::ovn::internal_error),
        help("This is likely a bug in podnet-ovn. Please report it with the full error details")
    )]
    InternalError {
        #[allow(unused)]
        message: String,
    },
}

/// Result type alias for control-plane operations
pub type Result<T> = std::result::Result<T, OvnError>;

impl OvnError {
    pub fn command_failed(
        command: impl Into<String>,
        exit_code: i32,
        stderr: impl Into<String>,
    ) -> Self {
        Self::CommandFailed {
            command: command.into(),
            exit_code,
            stderr: stderr.into(),
        }
    }

    pub fn timeout(command: impl Into<String>, timeout_secs: u64) -> Self {
        Self::Timeout {
            command: command.into(),
            timeout_secs,
        }
    }

    pub fn unexpected_command(command: impl Into<String>, expected: impl Into<String>) -> Self {
        Self::UnexpectedCommand {
            command: command.into(),
            expected: expected.into(),
        }
    }

    pub fn inconsistent(subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Inconsistent {
            subject: subject.into(),
            message: message.into(),
        }
    }

    pub fn invalid_config(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    pub fn conflict(pod: impl Into<String>) -> Self {
        Self::Conflict { pod: pod.into() }
    }

    pub fn pod_not_found(pod: impl Into<String>) -> Self {
        Self::PodNotFound { pod: pod.into() }
    }

    pub fn api_error(message: impl Into<String>) -> Self {
        Self::ApiError {
            message: message.into(),
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }

    /// Round-trip failures that may succeed when the pod is retried later
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OvnError::CommandFailed { .. }
                | OvnError::Timeout { .. }
                | OvnError::Conflict { .. }
                | OvnError::ApiError { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(OvnError::timeout("ovn-nbctl --timeout=15 show", 15).is_transient());
        assert!(OvnError::conflict("default/nginx").is_transient());
        assert!(!OvnError::inconsistent("default_nginx", "no addresses").is_transient());
        assert!(!OvnError::PoolExhausted {
            cidr: "10.0.0.0/30".to_string()
        }
        .is_transient());
    }

    #[test]
    fn test_command_failed_message() {
        let err = OvnError::command_failed("ovn-nbctl --timeout=15 lsp-del x", 1, "boom");
        assert_eq!(
            err.to_string(),
            "Command 'ovn-nbctl --timeout=15 lsp-del x' failed with exit code 1"
        );
    }
}
