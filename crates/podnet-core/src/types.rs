use crate::error::{PodnetError, Result};
use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator between namespace and pod name in logical switch port names.
/// Neither DNS labels nor DNS subdomains may contain it.
pub const PORT_NAME_SEPARATOR: char = '_';

/// PodKey uniquely identifies a pod: (namespace, name)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PodKey {
    pub namespace: String,
    pub name: String,
}

impl PodKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Build the key for a pod object. Pods without a namespace live in "default".
    pub fn from_pod(pod: &Pod) -> Result<Self> {
        let name = pod.metadata.name.as_deref().ok_or_else(|| {
            PodnetError::invalid_pod("Pod has no name", "Set metadata.name on the pod")
        })?;
        let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
        Ok(Self::new(namespace, name))
    }

    /// Name of the logical switch port owned by this pod: `{namespace}_{name}`
    pub fn port_name(&self) -> String {
        format!("{}{}{}", self.namespace, PORT_NAME_SEPARATOR, self.name)
    }

    /// Invert [`PodKey::port_name`]. Returns `None` for names that were not
    /// produced by it.
    pub fn from_port_name(port_name: &str) -> Option<Self> {
        let (namespace, name) = port_name.split_once(PORT_NAME_SEPARATOR)?;
        if namespace.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::new(namespace, name))
    }
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Addressing published on the pod for the node agent and other controllers
///
/// Equality is structural, so two annotations with different JSON field order
/// compare equal once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodNetworkAnnotation {
    /// Pod address with the subnet prefix length, e.g. `10.128.1.4/24`
    pub ip_address: String,
    pub mac_address: String,
    /// Bare gateway address, e.g. `10.128.1.1`
    pub gateway_ip: String,
}

impl PodNetworkAnnotation {
    pub fn new(
        ip_address: impl Into<String>,
        mac_address: impl Into<String>,
        gateway_ip: impl Into<String>,
    ) -> Self {
        Self {
            ip_address: ip_address.into(),
            mac_address: mac_address.into(),
            gateway_ip: gateway_ip.into(),
        }
    }

    /// The address part of `ip_address` without the prefix length
    pub fn ip(&self) -> &str {
        self.ip_address
            .split_once('/')
            .map(|(ip, _)| ip)
            .unwrap_or(&self.ip_address)
    }
}

/// Pod phases that never need a network attachment again
pub fn is_terminal_phase(phase: &str) -> bool {
    matches!(phase, "Succeeded" | "Failed")
}
