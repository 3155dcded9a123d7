use crate::error::{OvnError, Result};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;

/// Parsed node subnet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CidrConfig {
    /// Base network address
    pub network: Ipv4Addr,
    /// CIDR prefix length
    pub prefix_len: u8,
    /// Gateway address (network + 1)
    pub gateway: Ipv4Addr,
    /// Node management port address (network + 2), never handed to a pod
    pub management_ip: Ipv4Addr,
    /// Broadcast address (last in range)
    pub broadcast: Ipv4Addr,
}

impl CidrConfig {
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let ip = u32::from(ip);
        ip >= u32::from(self.network) && ip <= u32::from(self.broadcast)
    }

    /// Whether `ip` is one of the addresses no pod may receive
    pub fn is_reserved(&self, ip: Ipv4Addr) -> bool {
        ip == self.network || ip == self.gateway || ip == self.management_ip || ip == self.broadcast
    }
}

impl std::fmt::Display for CidrConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

/// Parse a CIDR string like "10.128.1.0/24" into a CidrConfig
///
/// Host bits in the address are masked off, so "10.128.1.7/24" describes the
/// same subnet as "10.128.1.0/24".
pub fn parse_cidr(cidr_str: &str) -> Result<CidrConfig> {
    let parts: Vec<&str> = cidr_str.trim().split('/').collect();
    if parts.len() != 2 {
        return Err(OvnError::invalid_config(
            format!("Invalid CIDR format: '{}'", cidr_str),
            "Use format like '10.128.1.0/24'",
        ));
    }

    let address: Ipv4Addr = parts[0].parse().map_err(|_| {
        OvnError::invalid_config(
            format!("Invalid network address: '{}'", parts[0]),
            "Use a valid IPv4 address like '10.128.1.0'",
        )
    })?;

    let prefix_len: u8 = parts[1].parse().map_err(|_| {
        OvnError::invalid_config(
            format!("Invalid prefix length: '{}'", parts[1]),
            "Use a number between 0 and 30",
        )
    })?;

    // Network, gateway, management and broadcast need four addresses
    if prefix_len > 30 {
        return Err(OvnError::invalid_config(
            format!("Prefix length {} is too long for a node subnet", prefix_len),
            "Use a number between 0 and 30",
        ));
    }

    let host_bits = 32 - u32::from(prefix_len);
    let mask = if prefix_len == 0 {
        0u32
    } else {
        !((1u32 << host_bits) - 1)
    };
    let network_u32 = u32::from(address) & mask;
    let broadcast_u32 = network_u32 | !mask;

    Ok(CidrConfig {
        network: Ipv4Addr::from(network_u32),
        prefix_len,
        gateway: Ipv4Addr::from(network_u32 + 1),
        management_ip: Ipv4Addr::from(network_u32 + 2),
        broadcast: Ipv4Addr::from(broadcast_u32),
    })
}

/// Addresses a switch excludes from dynamic assignment
///
/// Parsed from the `exclude_ips` value: whitespace-separated addresses and
/// `first..last` ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExcludeSet {
    singles: BTreeSet<Ipv4Addr>,
    ranges: Vec<(Ipv4Addr, Ipv4Addr)>,
}

impl ExcludeSet {
    pub fn parse(value: &str) -> Result<Self> {
        let mut set = ExcludeSet::default();
        for token in value.split_whitespace() {
            let parse = |s: &str| -> Result<Ipv4Addr> {
                s.parse().map_err(|_| {
                    OvnError::invalid_config(
                        format!("Invalid exclude_ips entry: '{}'", token),
                        "Use addresses or ranges like '10.128.1.2 10.128.1.10..10.128.1.20'",
                    )
                })
            };
            match token.split_once("..") {
                Some((first, last)) => set.ranges.push((parse(first)?, parse(last)?)),
                None => {
                    set.singles.insert(parse(token)?);
                }
            }
        }
        Ok(set)
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.singles.contains(&ip)
            || self
                .ranges
                .iter()
                .any(|(first, last)| ip >= *first && ip <= *last)
    }
}

/// Increment an IPv4 address by one
pub(crate) fn next_ip(ip: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip).wrapping_add(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cidr_slash24() {
        let cidr = parse_cidr("10.128.1.0/24").unwrap();
        assert_eq!(cidr.network, Ipv4Addr::new(10, 128, 1, 0));
        assert_eq!(cidr.gateway, Ipv4Addr::new(10, 128, 1, 1));
        assert_eq!(cidr.management_ip, Ipv4Addr::new(10, 128, 1, 2));
        assert_eq!(cidr.broadcast, Ipv4Addr::new(10, 128, 1, 255));
        assert_eq!(cidr.to_string(), "10.128.1.0/24");
    }

    #[test]
    fn test_parse_cidr_masks_host_bits() {
        let cidr = parse_cidr("10.128.1.7/24").unwrap();
        assert_eq!(cidr.network, Ipv4Addr::new(10, 128, 1, 0));
    }

    #[test]
    fn test_parse_cidr_invalid() {
        assert!(parse_cidr("not-a-cidr").is_err());
        assert!(parse_cidr("10.128.1.0").is_err());
        assert!(parse_cidr("10.128.1.0/31").is_err());
        assert!(parse_cidr("bad/24").is_err());
    }

    #[test]
    fn test_reserved_addresses() {
        let cidr = parse_cidr("10.128.1.0/24").unwrap();
        assert!(cidr.is_reserved(Ipv4Addr::new(10, 128, 1, 2)));
        assert!(!cidr.is_reserved(Ipv4Addr::new(10, 128, 1, 3)));
        assert!(cidr.contains(Ipv4Addr::new(10, 128, 1, 200)));
        assert!(!cidr.contains(Ipv4Addr::new(10, 128, 2, 1)));
    }

    #[test]
    fn test_exclude_set_ranges() {
        let set = ExcludeSet::parse("10.128.1.2 10.128.1.10..10.128.1.20").unwrap();
        assert!(set.contains(Ipv4Addr::new(10, 128, 1, 2)));
        assert!(set.contains(Ipv4Addr::new(10, 128, 1, 15)));
        assert!(!set.contains(Ipv4Addr::new(10, 128, 1, 21)));
        assert!(ExcludeSet::parse("10.128.1.x").is_err());
    }
}
