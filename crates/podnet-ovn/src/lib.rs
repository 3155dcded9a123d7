// Allow unused assignments for diagnostic fields - they're used by the thiserror/miette macros
#![allow(unused_assignments)]

//! Podnet OVN - logical switch port reconciliation for pods
//!
//! Pods are mirrored into the northbound database as logical switch ports by
//! driving `ovn-nbctl`. The committed addressing is published back on the pod
//! as an annotation for the node agent.

pub mod annotation;
pub mod api_client;
pub mod command;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod memory_store;
pub mod mock;
pub mod nbctl;
pub mod network;
pub mod queue;
pub mod reconciler;
pub mod traits;

// Re-export primary types
pub use annotation::AnnotationManager;
pub use api_client::ApiClient;
pub use command::{CommandOutput, ProcessExecutor};
pub use config::{AddressMode, ControllerConfig, DEFAULT_ANNOTATION_KEY};
pub use dispatcher::PodDispatcher;
pub use error::{OvnError, Result};
pub use memory_store::MemoryPodStore;
pub use mock::{ExpectedCmd, FakeExec};
pub use nbctl::{NbClient, NbCommand, PortAddress, SwitchConfig};
pub use network::{AddressAllocator, CidrConfig, ExcludeSet};
pub use queue::{PodWork, WorkQueue};
pub use reconciler::{PodOutcome, Reconciler, ResyncReport, SkipReason};
pub use traits::{CommandExecutor, PodStore};
