use crate::error::{OvnError, Result};
use crate::nbctl::{PortAddress, SwitchConfig};
use crate::network::cidr::next_ip;
use podnet_core::PodKey;
use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::Mutex;
use tracing::debug;

/// Derive the port MAC from its IPv4 address: `0a:58:` followed by the
/// four address octets.
pub fn mac_for_ip(ip: Ipv4Addr) -> String {
    let o = ip.octets();
    format!("0a:58:{:02x}:{:02x}:{:02x}:{:02x}", o[0], o[1], o[2], o[3])
}

/// Controller-side address allocator
///
/// Used only when the controller, not the control plane, picks port
/// addresses. State lives in memory and is rebuilt from pod annotations on
/// every resync, so the control plane and the pods stay the source of truth.
///
/// Per switch: `{ip} -> {namespace}/{pod_name}`
#[derive(Debug, Default)]
pub struct AddressAllocator {
    switches: Mutex<HashMap<String, BTreeMap<Ipv4Addr, PodKey>>>,
}

impl AddressAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, BTreeMap<Ipv4Addr, PodKey>>> {
        self.switches.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocate a pair for a pod. Idempotent: returns the existing allocation
    /// if the pod already holds one on this switch.
    pub fn allocate(
        &self,
        switch: &str,
        config: &SwitchConfig,
        pod: &PodKey,
    ) -> Result<PortAddress> {
        let mut switches = self.lock();
        let allocated = switches.entry(switch.to_string()).or_default();

        if let Some((ip, _)) = allocated.iter().find(|(_, owner)| *owner == pod) {
            debug!("Allocator: returning existing allocation {} for {}", ip, pod);
            return Ok(PortAddress {
                mac: mac_for_ip(*ip),
                ip: *ip,
            });
        }

        let subnet = &config.subnet;
        let mut candidate = next_ip(subnet.network);
        while candidate < subnet.broadcast {
            if !subnet.is_reserved(candidate)
                && !config.exclude_ips.contains(candidate)
                && !allocated.contains_key(&candidate)
            {
                allocated.insert(candidate, pod.clone());
                debug!("Allocator: allocated {} for {} on {}", candidate, pod, switch);
                return Ok(PortAddress {
                    mac: mac_for_ip(candidate),
                    ip: candidate,
                });
            }
            candidate = next_ip(candidate);
        }

        Err(OvnError::PoolExhausted {
            cidr: subnet.to_string(),
        })
    }

    /// Record an address already committed for a pod
    pub fn reserve(&self, switch: &str, pod: &PodKey, ip: Ipv4Addr) {
        let mut switches = self.lock();
        let allocated = switches.entry(switch.to_string()).or_default();
        allocated.retain(|_, owner| owner != pod);
        allocated.insert(ip, pod.clone());
    }

    /// Release whatever address the pod holds on any switch
    pub fn release(&self, pod: &PodKey) -> Option<Ipv4Addr> {
        let mut switches = self.lock();
        for allocated in switches.values_mut() {
            let found = allocated
                .iter()
                .find(|(_, owner)| *owner == pod)
                .map(|(ip, _)| *ip);
            if let Some(ip) = found {
                allocated.remove(&ip);
                debug!("Allocator: released {} for {}", ip, pod);
                return Some(ip);
            }
        }
        None
    }

    /// Drop all state; a full resync reseeds it from pod annotations
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Current allocations on one switch
    pub fn allocations(&self, switch: &str) -> BTreeMap<Ipv4Addr, PodKey> {
        self.lock().get(switch).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nbctl::parse_switch_config;

    fn switch_config(out: &str) -> SwitchConfig {
        parse_switch_config("node1", out).unwrap()
    }

    #[test]
    fn test_mac_for_ip() {
        assert_eq!(mac_for_ip(Ipv4Addr::new(10, 128, 1, 4)), "0a:58:0a:80:01:04");
    }

    #[test]
    fn test_allocate_skips_reserved_and_excluded() {
        let alloc = AddressAllocator::new();
        let config = switch_config(r#"{exclude_ips="10.128.1.3", subnet="10.128.1.0/24"}"#);

        let a = alloc
            .allocate("node1", &config, &PodKey::new("default", "pod-a"))
            .unwrap();
        // .1 gateway, .2 management, .3 excluded
        assert_eq!(a.ip, Ipv4Addr::new(10, 128, 1, 4));
        assert_eq!(a.mac, "0a:58:0a:80:01:04");

        let b = alloc
            .allocate("node1", &config, &PodKey::new("default", "pod-b"))
            .unwrap();
        assert_eq!(b.ip, Ipv4Addr::new(10, 128, 1, 5));
    }

    #[test]
    fn test_allocate_idempotent() {
        let alloc = AddressAllocator::new();
        let config = switch_config(r#"{subnet="10.128.1.0/24"}"#);
        let pod = PodKey::new("default", "pod-a");

        let first = alloc.allocate("node1", &config, &pod).unwrap();
        let second = alloc.allocate("node1", &config, &pod).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_reserve_then_allocate_avoids_committed_address() {
        let alloc = AddressAllocator::new();
        let config = switch_config(r#"{subnet="10.128.1.0/24"}"#);
        alloc.reserve(
            "node1",
            &PodKey::new("default", "existing"),
            Ipv4Addr::new(10, 128, 1, 3),
        );

        let fresh = alloc
            .allocate("node1", &config, &PodKey::new("default", "fresh"))
            .unwrap();
        assert_eq!(fresh.ip, Ipv4Addr::new(10, 128, 1, 4));
    }

    #[test]
    fn test_release_and_reallocate() {
        let alloc = AddressAllocator::new();
        let config = switch_config(r#"{subnet="10.128.1.0/24"}"#);

        let a = alloc
            .allocate("node1", &config, &PodKey::new("default", "pod-a"))
            .unwrap();
        alloc
            .allocate("node1", &config, &PodKey::new("default", "pod-b"))
            .unwrap();

        assert_eq!(alloc.release(&PodKey::new("default", "pod-a")), Some(a.ip));
        assert_eq!(alloc.release(&PodKey::new("default", "pod-a")), None);

        let c = alloc
            .allocate("node1", &config, &PodKey::new("default", "pod-c"))
            .unwrap();
        assert_eq!(c.ip, a.ip);
    }

    #[test]
    fn test_pool_exhaustion() {
        // /30: network .0, gateway .1, management .2, broadcast .3
        let alloc = AddressAllocator::new();
        let config = switch_config(r#"{subnet="10.0.0.0/30"}"#);

        let result = alloc.allocate("node1", &config, &PodKey::new("default", "pod-a"));
        assert!(matches!(
            result.unwrap_err(),
            OvnError::PoolExhausted { .. }
        ));
    }

    #[test]
    fn test_allocations_are_per_switch() {
        let alloc = AddressAllocator::new();
        let n1 = switch_config(r#"{subnet="10.128.1.0/24"}"#);
        let n2 = switch_config(r#"{subnet="10.128.2.0/24"}"#);

        alloc
            .allocate("node1", &n1, &PodKey::new("default", "a"))
            .unwrap();
        let b = alloc
            .allocate("node2", &n2, &PodKey::new("default", "b"))
            .unwrap();
        assert_eq!(b.ip, Ipv4Addr::new(10, 128, 2, 3));
        assert_eq!(alloc.allocations("node1").len(), 1);
        assert_eq!(alloc.allocations("node2").len(), 1);
    }
}
