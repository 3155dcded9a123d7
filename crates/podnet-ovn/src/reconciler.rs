//! Logical switch port reconciliation
//!
//! The reconciler compares a pod against the control plane and the addressing
//! it already committed, then issues the northbound commands that converge the
//! two. Every command is idempotent (`--may-exist`, `--if-exists`), so a pass
//! interrupted halfway is repaired by simply running it again.
//!
//! Per-pod states:
//!
//! - *Unscheduled*: no node yet, nothing to do.
//! - *Scheduled, no port*: create the port with a dynamic address request.
//! - *Committing*: look up the gateway, read back the committed `MAC IP`,
//!   restrict the port to it with port security.
//! - *Committed*: the pod annotation matches the address recorded in this
//!   process; no commands are issued.
//! - *Committed, stale annotation*: after a restart the record is empty, so
//!   the port is re-bound with the address the pod already carries and the
//!   commit steps are repeated before the annotation is rewritten if needed.
//! - *Deleted*: the port is removed unconditionally.

use crate::annotation::AnnotationManager;
use crate::config::{AddressMode, ControllerConfig};
use crate::error::{OvnError, Result};
use crate::nbctl::{NbClient, NbCommand, PortAddress, SwitchConfig};
use crate::network::AddressAllocator;
use crate::traits::PodStore;
use k8s_openapi::api::core::v1::Pod;
use podnet_core::{is_terminal_phase, PodKey, PodNetworkAnnotation};
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, error, info, warn};

/// Why a pod was left alone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoSpec,
    HostNetwork,
    Unscheduled,
    Terminal,
}

/// Result of reconciling one pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodOutcome {
    /// The pod needs no logical port
    Skipped(SkipReason),
    /// Annotation already matches the committed port; nothing was issued
    InSync,
    /// The port was (re)committed with this addressing
    Committed(PodNetworkAnnotation),
}

/// Summary of a full resync pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResyncReport {
    pub orphans_deleted: usize,
    pub pods_committed: usize,
    pub pods_failed: usize,
}

/// How the port is created and where its address is read back from
enum PortPlan {
    Dynamic,
    Known(PortAddress),
    Allocated(PortAddress),
}

/// Drives logical switch ports from pod state
pub struct Reconciler {
    nb: NbClient,
    store: Arc<dyn PodStore>,
    annotations: AnnotationManager,
    allocator: AddressAllocator,
    config: ControllerConfig,
    /// One-time per-node setup, keyed by logical switch
    switches: Mutex<HashMap<String, Arc<OnceCell<SwitchConfig>>>>,
    /// Addressing committed by this process, keyed by port name
    committed: RwLock<HashMap<String, PodNetworkAnnotation>>,
}

impl Reconciler {
    pub fn new(nb: NbClient, store: Arc<dyn PodStore>, config: ControllerConfig) -> Self {
        Self {
            nb,
            store,
            annotations: AnnotationManager::new(
                config.annotation_key.clone(),
                config.annotation_retries,
            ),
            allocator: AddressAllocator::new(),
            config,
            switches: Mutex::new(HashMap::new()),
            committed: RwLock::new(HashMap::new()),
        }
    }

    pub fn annotations(&self) -> &AnnotationManager {
        &self.annotations
    }

    pub fn allocator(&self) -> &AddressAllocator {
        &self.allocator
    }

    /// Addressing this process committed for a port, if any
    pub async fn committed(&self, port: &str) -> Option<PodNetworkAnnotation> {
        self.committed.read().await.get(port).cloned()
    }

    /// Bring the pod's logical port and annotation in line
    pub async fn ensure_pod(&self, pod: &Pod) -> Result<PodOutcome> {
        let key = PodKey::from_pod(pod)?;

        let spec = match &pod.spec {
            Some(s) => s,
            None => return Ok(PodOutcome::Skipped(SkipReason::NoSpec)),
        };
        if is_host_network(pod) {
            debug!(pod = %key, "Skipping host-network pod");
            return Ok(PodOutcome::Skipped(SkipReason::HostNetwork));
        }
        let switch = match spec.node_name.as_deref().filter(|n| !n.is_empty()) {
            Some(n) => n,
            None => {
                debug!(pod = %key, "Skipping pod, not yet scheduled");
                return Ok(PodOutcome::Skipped(SkipReason::Unscheduled));
            }
        };
        let phase = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or("");
        if is_terminal_phase(phase) {
            debug!(pod = %key, phase, "Skipping pod in terminal phase");
            return Ok(PodOutcome::Skipped(SkipReason::Terminal));
        }

        let port = key.port_name();
        let current = match self.annotations.read(pod) {
            Ok(a) => a,
            Err(e) => {
                warn!(pod = %key, error = %e, "Ignoring unreadable network annotation");
                None
            }
        };

        if let Some(have) = &current {
            if self.committed.read().await.get(&port) == Some(have) {
                debug!(pod = %key, port = %port, "Logical port already committed");
                return Ok(PodOutcome::InSync);
            }
        }

        let switch_config = self.ensure_switch(switch).await?;

        let known = match current.as_ref().map(|a| known_address(&port, a)) {
            Some(Ok(addr)) => Some(addr),
            Some(Err(e)) => {
                warn!(pod = %key, error = %e, "Ignoring network annotation, requesting a fresh address");
                None
            }
            None => None,
        };

        let plan = match (known, self.config.address_mode) {
            (Some(addr), _) => PortPlan::Known(addr),
            (None, AddressMode::ControlPlane) => PortPlan::Dynamic,
            (None, AddressMode::Controller) => {
                PortPlan::Allocated(self.allocator.allocate(switch, &switch_config, &key)?)
            }
        };

        let (create, readback) = match &plan {
            PortPlan::Dynamic => (
                NbCommand::ensure_port_dynamic(switch, &port, &key.namespace),
                vec![NbCommand::port_dynamic_addresses(&port)],
            ),
            PortPlan::Known(addr) => (
                NbCommand::ensure_port_static(
                    switch,
                    &port,
                    &key.namespace,
                    &addr.mac,
                    &addr.ip.to_string(),
                ),
                vec![
                    NbCommand::port_dynamic_addresses(&port),
                    NbCommand::port_addresses(&port),
                ],
            ),
            PortPlan::Allocated(addr) => (
                NbCommand::ensure_port_static(
                    switch,
                    &port,
                    &key.namespace,
                    &addr.mac,
                    &addr.ip.to_string(),
                ),
                vec![NbCommand::port_addresses(&port)],
            ),
        };

        info!(pod = %key, port = %port, switch, "Ensuring logical switch port");
        self.nb.run(&create).await?;

        let gateway = self.nb.gateway(switch).await?;
        let address = self.read_committed(&port, &readback).await?;
        self.nb
            .run(&NbCommand::set_port_security(
                &port,
                &address.mac,
                address.ip,
                gateway.prefix_len,
            ))
            .await?;

        if let PortPlan::Known(known) = &plan {
            if known != &address {
                warn!(
                    pod = %key,
                    port = %port,
                    previous = %known.ip,
                    committed = %address.ip,
                    "Control plane committed a different address than the pod carried"
                );
            }
        }
        self.allocator.reserve(switch, &key, address.ip);

        let annotation = PodNetworkAnnotation::new(
            format!("{}/{}", address.ip, gateway.prefix_len),
            address.mac.clone(),
            gateway.ip.to_string(),
        );
        self.committed
            .write()
            .await
            .insert(port.clone(), annotation.clone());

        if self.annotations.is_stale(pod, &annotation) {
            self.annotations
                .write(self.store.as_ref(), &key, &annotation)
                .await?;
        }

        info!(
            pod = %key,
            port = %port,
            ip = %annotation.ip_address,
            mac = %annotation.mac_address,
            "Logical switch port committed"
        );
        Ok(PodOutcome::Committed(annotation))
    }

    /// Remove the pod's logical port. Absence is not an error.
    pub async fn delete_pod(&self, pod: &Pod) -> Result<()> {
        let key = PodKey::from_pod(pod)?;
        if is_host_network(pod) {
            return Ok(());
        }
        self.delete_port(&key.port_name()).await
    }

    async fn delete_port(&self, port: &str) -> Result<()> {
        info!(port = %port, "Deleting logical switch port");
        self.nb.run(&NbCommand::delete_port(port)).await?;
        self.committed.write().await.remove(port);
        if let Some(key) = PodKey::from_port_name(port) {
            self.allocator.release(&key);
        }
        Ok(())
    }

    /// Delete every controller-owned port with no matching pod
    pub async fn cleanup_orphans(&self, pods: &[Pod]) -> Result<usize> {
        let expected: HashSet<String> = pods
            .iter()
            .filter(|p| !is_host_network(p))
            .filter_map(|p| PodKey::from_pod(p).ok())
            .map(|k| k.port_name())
            .collect();

        let mut deleted = 0;
        for port in self.nb.owned_ports().await? {
            if expected.contains(&port) {
                continue;
            }
            // The list may predate a pod whose port a worker already created
            if let Some(key) = PodKey::from_port_name(&port) {
                match self.store.get_pod(&key.namespace, &key.name).await {
                    Ok(pod) if !is_host_network(&pod) => {
                        debug!(port = %port, "Pod appeared after listing, keeping port");
                        continue;
                    }
                    Ok(_) | Err(OvnError::PodNotFound { .. }) => {}
                    Err(e) => {
                        warn!(port = %port, error = %e, "Cannot confirm port is orphaned, keeping it");
                        continue;
                    }
                }
            }
            match self.delete_port(&port).await {
                Ok(()) => deleted += 1,
                Err(e) => error!(port = %port, error = %e, "Failed to delete orphaned port"),
            }
        }
        Ok(deleted)
    }

    /// Full reconciliation of the current pod list against the control plane.
    ///
    /// Orphaned ports are removed first, then allocator state is rebuilt from
    /// pod annotations and every pod is ensured. Failures are counted per pod
    /// and never abort the pass.
    pub async fn resync(&self, pods: &[Pod]) -> Result<ResyncReport> {
        info!("Resyncing {} pods against the northbound database", pods.len());
        let mut report = ResyncReport {
            orphans_deleted: self.cleanup_orphans(pods).await?,
            ..Default::default()
        };

        self.allocator.clear();
        self.seed_allocator(pods);

        for pod in pods {
            match self.ensure_pod(pod).await {
                Ok(PodOutcome::Committed(_)) => report.pods_committed += 1,
                Ok(_) => {}
                Err(e) => {
                    report.pods_failed += 1;
                    let name = PodKey::from_pod(pod)
                        .map(|k| k.to_string())
                        .unwrap_or_else(|_| "<unknown>".to_string());
                    error!(pod = %name, error = %e, "Failed to reconcile pod during resync");
                }
            }
        }

        info!(
            orphans_deleted = report.orphans_deleted,
            pods_committed = report.pods_committed,
            pods_failed = report.pods_failed,
            "Resync complete"
        );
        Ok(report)
    }

    /// Reserve every address pods already carry so fresh allocations avoid them
    fn seed_allocator(&self, pods: &[Pod]) {
        for pod in pods {
            let Some(switch) = pod.spec.as_ref().and_then(|s| s.node_name.as_deref()) else {
                continue;
            };
            let (Ok(key), Ok(Some(annotation))) = (PodKey::from_pod(pod), self.annotations.read(pod))
            else {
                continue;
            };
            if let Ok(ip) = annotation.ip().parse::<Ipv4Addr>() {
                self.allocator.reserve(switch, &key, ip);
            }
        }
    }

    /// Run the one-time node setup for `switch`, or return its cached result.
    /// A failed setup is retried by the next pod on that node.
    async fn ensure_switch(&self, switch: &str) -> Result<SwitchConfig> {
        let cell = {
            let mut switches = self.switches.lock().unwrap_or_else(|e| e.into_inner());
            switches.entry(switch.to_string()).or_default().clone()
        };
        cell.get_or_try_init(|| self.setup_switch(switch))
            .await
            .cloned()
    }

    async fn setup_switch(&self, switch: &str) -> Result<SwitchConfig> {
        let config = self.nb.switch_config(switch).await?;
        let subnet = self.nb.switch_subnet(switch).await?;
        self.nb
            .run(&NbCommand::allow_from_node(switch, subnet.management_ip))
            .await?;
        info!(
            switch,
            subnet = %config.subnet,
            management_ip = %subnet.management_ip,
            "Logical switch ready"
        );
        Ok(config)
    }

    /// Read the port's committed pair, trying each query in turn and polling
    /// while the control plane has not assigned one yet.
    async fn read_committed(&self, port: &str, queries: &[NbCommand]) -> Result<PortAddress> {
        let attempts = self.config.address_poll_attempts.max(1);
        for attempt in 1..=attempts {
            for query in queries {
                if let Some(address) = self.nb.port_address(query, port).await? {
                    return Ok(address);
                }
            }
            if attempt < attempts {
                debug!(port = %port, attempt, "Port has no committed address yet");
                tokio::time::sleep(self.config.address_poll_interval).await;
            }
        }
        Err(OvnError::inconsistent(
            port,
            format!("no committed address after {} polls", attempts),
        ))
    }
}

fn is_host_network(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.host_network)
        .unwrap_or(false)
}

/// The `MAC IP` pair recorded in a pod annotation
fn known_address(port: &str, annotation: &PodNetworkAnnotation) -> Result<PortAddress> {
    let ip = annotation.ip().parse::<Ipv4Addr>().map_err(|_| {
        OvnError::inconsistent(
            port,
            format!("annotation address '{}' is not IPv4", annotation.ip_address),
        )
    })?;
    Ok(PortAddress {
        mac: annotation.mac_address.clone(),
        ip,
    })
}
