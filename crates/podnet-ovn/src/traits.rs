use crate::command::CommandOutput;
use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;

/// Trait for executing control-plane CLI invocations
///
/// This is the seam between the northbound client and process execution.
/// `ProcessExecutor` runs real processes; `FakeExec` replays an ordered
/// expectation queue in tests.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run `program` with `args` and return its output regardless of exit code.
    ///
    /// Errors are reserved for failures to run the program at all, including
    /// timeouts.
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;
}

/// Trait for the orchestration API operations the controller needs on pods
#[async_trait]
pub trait PodStore: Send + Sync {
    /// List all pods in all namespaces
    async fn list_pods(&self) -> Result<Vec<Pod>>;

    /// Fetch the current state of one pod
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod>;

    /// Replace a pod, guarded by its `metadata.resourceVersion`.
    ///
    /// Returns `OvnError::Conflict` if the stored version has moved on.
    async fn update_pod(&self, pod: &Pod) -> Result<Pod>;
}
