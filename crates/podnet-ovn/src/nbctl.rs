//! Northbound database command client
//!
//! Every control-plane operation the controller performs is expressed as an
//! [`NbCommand`]: one `ovn-nbctl` invocation, possibly chaining several
//! sub-commands with `--`. [`NbClient::execute`] runs a sequence of them in
//! order and stops at the first failure.

use crate::command::command_line;
use crate::error::{OvnError, Result};
use crate::network::{parse_cidr, CidrConfig, ExcludeSet};
use crate::traits::CommandExecutor;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Priority of the per-node admission ACL
pub const NODE_ACL_PRIORITY: &str = "1001";

/// Ownership tags stamped on every controller-managed port
pub const POD_OWNER_TAG: &str = "external_ids:pod=true";

/// One northbound invocation, without the program name and timeout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NbCommand {
    args: Vec<String>,
}

impl NbCommand {
    fn from_args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// `get logical_switch <switch> other-config`
    pub fn switch_config(switch: &str) -> Self {
        Self::from_args(["get", "logical_switch", switch, "other-config"])
    }

    /// `get logical_switch <switch> other-config:subnet`
    pub fn switch_subnet(switch: &str) -> Self {
        Self::from_args(["get", "logical_switch", switch, "other-config:subnet"])
    }

    /// `--if-exists get logical_switch <switch> external_ids:gateway_ip`
    pub fn switch_gateway(switch: &str) -> Self {
        Self::from_args([
            "--if-exists",
            "get",
            "logical_switch",
            switch,
            "external_ids:gateway_ip",
        ])
    }

    /// Admit traffic from the node's management address into its switch
    pub fn allow_from_node(switch: &str, mgmt_ip: Ipv4Addr) -> Self {
        Self::from_args([
            "--may-exist".to_string(),
            "acl-add".to_string(),
            switch.to_string(),
            "to-lport".to_string(),
            NODE_ACL_PRIORITY.to_string(),
            format!("ip4.src=={}", mgmt_ip),
            "allow-related".to_string(),
        ])
    }

    /// Create the port if missing with a dynamic address request, bound to
    /// `switch` and tagged as controller-owned. Waits for the southbound
    /// database so the dynamic address is assigned on return.
    pub fn ensure_port_dynamic(switch: &str, port: &str, namespace: &str) -> Self {
        let mut args: Vec<String> = ["--wait=sb", "--", "--may-exist", "lsp-add", switch, port]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.extend(["--", "lsp-set-addresses", port, "dynamic"].map(String::from));
        args.extend(owner_tags(switch, port, namespace));
        Self { args }
    }

    /// Create or re-bind the port with a known `MAC IP` pair and clear any
    /// leftover dynamic assignment so the committed pair is not reassigned.
    pub fn ensure_port_static(
        switch: &str,
        port: &str,
        namespace: &str,
        mac: &str,
        ip: &str,
    ) -> Self {
        let mut args: Vec<String> = ["--may-exist", "lsp-add", switch, port]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.extend([
            "--".to_string(),
            "lsp-set-addresses".to_string(),
            port.to_string(),
            format!("{} {}", mac, ip),
        ]);
        args.extend(owner_tags(switch, port, namespace));
        args.extend(
            [
                "--",
                "--if-exists",
                "clear",
                "logical_switch_port",
                port,
                "dynamic_addresses",
            ]
            .map(String::from),
        );
        Self { args }
    }

    /// `get logical_switch_port <port> dynamic_addresses`
    pub fn port_dynamic_addresses(port: &str) -> Self {
        Self::from_args(["get", "logical_switch_port", port, "dynamic_addresses"])
    }

    /// `get logical_switch_port <port> addresses`
    pub fn port_addresses(port: &str) -> Self {
        Self::from_args(["get", "logical_switch_port", port, "addresses"])
    }

    /// Restrict the port to exactly one `MAC IP/prefix` pair
    pub fn set_port_security(port: &str, mac: &str, ip: Ipv4Addr, prefix_len: u8) -> Self {
        Self::from_args([
            "lsp-set-port-security".to_string(),
            port.to_string(),
            format!("{} {}/{}", mac, ip, prefix_len),
        ])
    }

    /// Names of every port carrying the `pod=true` ownership tag
    pub fn list_owned_ports() -> Self {
        Self::from_args([
            "--data=bare",
            "--no-heading",
            "--columns=name",
            "find",
            "logical_switch_port",
            POD_OWNER_TAG,
        ])
    }

    /// `--if-exists lsp-del <port>`
    pub fn delete_port(port: &str) -> Self {
        Self::from_args(["--if-exists", "lsp-del", port])
    }
}

fn owner_tags(switch: &str, port: &str, namespace: &str) -> Vec<String> {
    vec![
        "--".to_string(),
        "set".to_string(),
        "logical_switch_port".to_string(),
        port.to_string(),
        format!("external-ids:namespace={}", namespace),
        format!("external-ids:logical_switch={}", switch),
        "external-ids:pod=true".to_string(),
    ]
}

/// Switch-level configuration read from `other-config`
#[derive(Debug, Clone)]
pub struct SwitchConfig {
    pub subnet: CidrConfig,
    pub exclude_ips: ExcludeSet,
}

/// Gateway of a node switch with its prefix length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gateway {
    pub ip: Ipv4Addr,
    pub prefix_len: u8,
}

/// A committed `MAC IP` pair of a logical switch port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortAddress {
    pub mac: String,
    pub ip: Ipv4Addr,
}

/// Client for the northbound database CLI
pub struct NbClient {
    executor: Arc<dyn CommandExecutor>,
    program: String,
    timeout: Duration,
}

impl NbClient {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        program: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            executor,
            program: program.into(),
            timeout,
        }
    }

    fn render(&self, cmd: &NbCommand) -> Vec<String> {
        let mut args = Vec::with_capacity(cmd.args.len() + 1);
        args.push(format!("--timeout={}", self.timeout.as_secs()));
        args.extend(cmd.args.iter().cloned());
        args
    }

    /// Run one command and return its trimmed stdout
    pub async fn run(&self, cmd: &NbCommand) -> Result<String> {
        let args = self.render(cmd);
        let output = self.executor.run(&self.program, &args).await?;
        if output.exit_code != 0 {
            return Err(OvnError::command_failed(
                command_line(&self.program, &args),
                output.exit_code,
                output.stderr.trim(),
            ));
        }
        Ok(output.stdout.trim().to_string())
    }

    /// Run a command sequence in order, collecting per-command output.
    ///
    /// The first failure aborts the rest of the sequence. Nothing is retried.
    pub async fn execute(&self, cmds: &[NbCommand]) -> Result<Vec<String>> {
        let mut outputs = Vec::with_capacity(cmds.len());
        for cmd in cmds {
            outputs.push(self.run(cmd).await?);
        }
        Ok(outputs)
    }

    pub async fn switch_config(&self, switch: &str) -> Result<SwitchConfig> {
        let out = self.run(&NbCommand::switch_config(switch)).await?;
        parse_switch_config(switch, &out)
    }

    pub async fn switch_subnet(&self, switch: &str) -> Result<CidrConfig> {
        let out = self.run(&NbCommand::switch_subnet(switch)).await?;
        let subnet = unquote(&out);
        if subnet.is_empty() {
            return Err(OvnError::inconsistent(
                switch,
                "logical switch has no subnet configured",
            ));
        }
        parse_cidr(subnet)
    }

    pub async fn gateway(&self, switch: &str) -> Result<Gateway> {
        let out = self.run(&NbCommand::switch_gateway(switch)).await?;
        parse_gateway(switch, &out)
    }

    /// Read a port's `MAC IP` pair with one of the address queries.
    /// `Ok(None)` while the control plane has not assigned one.
    pub async fn port_address(&self, cmd: &NbCommand, port: &str) -> Result<Option<PortAddress>> {
        let out = self.run(cmd).await?;
        parse_port_address(port, &out)
    }

    /// Names of all controller-owned ports
    pub async fn owned_ports(&self) -> Result<Vec<String>> {
        let out = self.run(&NbCommand::list_owned_ports()).await?;
        let ports: Vec<String> = out.split_whitespace().map(String::from).collect();
        debug!("Found {} controller-owned logical switch ports", ports.len());
        Ok(ports)
    }
}

/// Strip one layer of surrounding double quotes
fn unquote(s: &str) -> &str {
    let s = s.trim();
    s.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(s)
}

/// Parse an OVSDB map like `{exclude_ips="10.128.1.2", subnet="10.128.1.0/24"}`
fn parse_ovsdb_map(s: &str) -> Vec<(String, String)> {
    let inner = s
        .trim()
        .trim_start_matches('{')
        .trim_end_matches('}');
    let mut pairs = Vec::new();
    let mut rest = inner;
    while !rest.trim().is_empty() {
        let Some((key, after)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().trim_start_matches(',').trim().to_string();
        let after = after.trim_start();
        let (value, remaining) = if let Some(quoted) = after.strip_prefix('"') {
            match quoted.split_once('"') {
                Some((v, r)) => (v.to_string(), r),
                None => (quoted.to_string(), ""),
            }
        } else {
            match after.split_once(',') {
                Some((v, r)) => (v.trim().to_string(), r),
                None => (after.trim().to_string(), ""),
            }
        };
        pairs.push((unquote(&key).to_string(), value));
        rest = remaining.trim_start().trim_start_matches(',');
    }
    pairs
}

pub fn parse_switch_config(switch: &str, out: &str) -> Result<SwitchConfig> {
    let pairs = parse_ovsdb_map(out);
    let lookup = |k: &str| pairs.iter().find(|(key, _)| key == k).map(|(_, v)| v.as_str());

    let subnet = lookup("subnet").ok_or_else(|| {
        OvnError::inconsistent(switch, "logical switch other-config has no subnet yet")
    })?;
    let subnet = parse_cidr(subnet)?;
    let exclude_ips = match lookup("exclude_ips") {
        Some(v) => ExcludeSet::parse(v)?,
        None => ExcludeSet::default(),
    };

    Ok(SwitchConfig {
        subnet,
        exclude_ips,
    })
}

/// Parse `10.128.1.1/24` (optionally quoted) into a gateway
pub fn parse_gateway(switch: &str, out: &str) -> Result<Gateway> {
    let raw = unquote(out);
    if raw.is_empty() {
        return Err(OvnError::inconsistent(
            switch,
            "logical switch has no gateway_ip",
        ));
    }
    let (ip, prefix) = raw.split_once('/').ok_or_else(|| {
        OvnError::inconsistent(switch, format!("gateway_ip '{}' has no prefix length", raw))
    })?;
    let ip: Ipv4Addr = ip.parse().map_err(|_| {
        OvnError::inconsistent(switch, format!("gateway_ip '{}' is not an IPv4 address", raw))
    })?;
    let prefix_len: u8 = prefix
        .parse()
        .ok()
        .filter(|p| *p <= 32)
        .ok_or_else(|| {
            OvnError::inconsistent(switch, format!("gateway_ip '{}' has a bad prefix", raw))
        })?;
    Ok(Gateway { ip, prefix_len })
}

/// Parse `"0a:58:0a:80:01:04 10.128.1.4"`, tolerating list brackets.
/// Empty output or `[]` means nothing is assigned yet.
pub fn parse_port_address(port: &str, out: &str) -> Result<Option<PortAddress>> {
    let trimmed = out.trim().trim_start_matches('[').trim_end_matches(']');
    let raw = unquote(trimmed);
    if raw.is_empty() || raw == "dynamic" {
        return Ok(None);
    }

    let fields: Vec<&str> = raw.split_whitespace().collect();
    if fields.len() != 2 {
        return Err(OvnError::inconsistent(
            port,
            format!("expected 'MAC IP', got '{}'", raw),
        ));
    }
    let ip: Ipv4Addr = fields[1].parse().map_err(|_| {
        OvnError::inconsistent(port, format!("'{}' is not an IPv4 address", fields[1]))
    })?;
    Ok(Some(PortAddress {
        mac: fields[0].to_string(),
        ip,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{ExpectedCmd, FakeExec};

    fn client(fexec: Arc<FakeExec>) -> NbClient {
        NbClient::new(fexec, "ovn-nbctl", Duration::from_secs(15))
    }

    #[test]
    fn test_ensure_port_dynamic_rendering() {
        let cmd = NbCommand::ensure_port_dynamic("node1", "namespace_myPod", "namespace");
        assert_eq!(
            cmd.args().join(" "),
            "--wait=sb -- --may-exist lsp-add node1 namespace_myPod -- lsp-set-addresses namespace_myPod dynamic -- set logical_switch_port namespace_myPod external-ids:namespace=namespace external-ids:logical_switch=node1 external-ids:pod=true"
        );
    }

    #[test]
    fn test_ensure_port_static_keeps_pair_in_one_argument() {
        let cmd = NbCommand::ensure_port_static(
            "node1",
            "namespace_myPod",
            "namespace",
            "11:22:33:44:55:66",
            "10.128.1.4",
        );
        assert!(cmd
            .args()
            .contains(&"11:22:33:44:55:66 10.128.1.4".to_string()));
        assert!(cmd
            .args()
            .join(" ")
            .ends_with("-- --if-exists clear logical_switch_port namespace_myPod dynamic_addresses"));
    }

    #[test]
    fn test_parse_switch_config() {
        let config = parse_switch_config(
            "node1",
            r#"{exclude_ips="10.128.1.2", subnet="10.128.1.0/24"}"#,
        )
        .unwrap();
        assert_eq!(config.subnet.network, Ipv4Addr::new(10, 128, 1, 0));
        assert_eq!(config.subnet.prefix_len, 24);
        assert!(config.exclude_ips.contains(Ipv4Addr::new(10, 128, 1, 2)));
        assert!(!config.exclude_ips.contains(Ipv4Addr::new(10, 128, 1, 3)));
    }

    #[test]
    fn test_parse_switch_config_without_subnet() {
        let err = parse_switch_config("node1", "{}").unwrap_err();
        assert!(matches!(err, OvnError::Inconsistent { .. }));
    }

    #[test]
    fn test_parse_gateway() {
        let gw = parse_gateway("node1", "10.128.1.1/24").unwrap();
        assert_eq!(gw.ip, Ipv4Addr::new(10, 128, 1, 1));
        assert_eq!(gw.prefix_len, 24);
        assert!(parse_gateway("node1", "").is_err());
        assert!(parse_gateway("node1", "10.128.1.1").is_err());
    }

    #[test]
    fn test_parse_port_address() {
        let addr = parse_port_address("p", r#""11:22:33:44:55:66 10.128.1.4""#)
            .unwrap()
            .unwrap();
        assert_eq!(addr.mac, "11:22:33:44:55:66");
        assert_eq!(addr.ip, Ipv4Addr::new(10, 128, 1, 4));

        let listed = parse_port_address("p", r#"["11:22:33:44:55:66 10.128.1.4"]"#).unwrap();
        assert_eq!(listed, Some(addr));

        assert_eq!(parse_port_address("p", "[]").unwrap(), None);
        assert!(parse_port_address("p", r#""garbage""#).is_err());
    }

    #[tokio::test]
    async fn test_execute_prefixes_timeout_and_stops_on_failure() {
        let fexec = Arc::new(FakeExec::new());
        fexec.add_cmd(ExpectedCmd::new(
            "ovn-nbctl --timeout=15 --if-exists lsp-del a",
            "",
        ));
        fexec.add_cmd(
            ExpectedCmd::new("ovn-nbctl --timeout=15 --if-exists lsp-del b", "")
                .failing(1, "ovn-nbctl: transaction error"),
        );
        let nb = client(fexec.clone());

        let err = nb
            .execute(&[
                NbCommand::delete_port("a"),
                NbCommand::delete_port("b"),
                NbCommand::delete_port("c"),
            ])
            .await
            .unwrap_err();

        match err {
            OvnError::CommandFailed {
                command, stderr, ..
            } => {
                assert_eq!(command, "ovn-nbctl --timeout=15 --if-exists lsp-del b");
                assert_eq!(stderr, "ovn-nbctl: transaction error");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(fexec.called_matches_expected());
        assert_eq!(fexec.executed().len(), 2);
    }

    #[tokio::test]
    async fn test_owned_ports() {
        let fexec = Arc::new(FakeExec::new());
        fexec.add_cmd(ExpectedCmd::new(
            "ovn-nbctl --timeout=15 --data=bare --no-heading --columns=name find logical_switch_port external_ids:pod=true",
            "ns_a\nns_b\n",
        ));
        let ports = client(fexec).owned_ports().await.unwrap();
        assert_eq!(ports, vec!["ns_a", "ns_b"]);
    }
}
