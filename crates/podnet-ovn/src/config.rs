use crate::error::{OvnError, Result};
use std::str::FromStr;
use std::time::Duration;

/// Default annotation key carrying the pod network addressing
pub const DEFAULT_ANNOTATION_KEY: &str = "ovn";

/// Who picks the MAC/IP pair of a new logical switch port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressMode {
    /// Ports are created with `dynamic` addressing and the control plane's
    /// assignment is read back
    #[default]
    ControlPlane,
    /// The controller allocates the pair from the node subnet
    Controller,
}

impl AddressMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressMode::ControlPlane => "control-plane",
            AddressMode::Controller => "controller",
        }
    }
}

impl std::fmt::Display for AddressMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AddressMode {
    type Err = OvnError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "control-plane" => Ok(AddressMode::ControlPlane),
            "controller" => Ok(AddressMode::Controller),
            other => Err(OvnError::invalid_config(
                format!("Unknown address mode '{}'", other),
                "Use 'control-plane' or 'controller'",
            )),
        }
    }
}

/// Configuration for the pod network controller
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Path or name of the northbound CLI (e.g., "ovn-nbctl")
    pub nbctl_path: String,
    /// Bound on every northbound round trip, also passed as `--timeout`
    pub command_timeout: Duration,
    /// Pod annotation key holding the addressing JSON
    pub annotation_key: String,
    pub address_mode: AddressMode,
    /// Number of reconcile workers draining the pod work queue
    pub workers: usize,
    /// Attempts for an annotation write that keeps hitting conflicts
    pub annotation_retries: u32,
    /// Polls of the committed address while the control plane reports none
    pub address_poll_attempts: u32,
    pub address_poll_interval: Duration,
    /// Period of the background resync that retries failed pods; `None`
    /// disables it
    pub resync_interval: Option<Duration>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            nbctl_path: "ovn-nbctl".to_string(),
            command_timeout: Duration::from_secs(15),
            annotation_key: DEFAULT_ANNOTATION_KEY.to_string(),
            address_mode: AddressMode::ControlPlane,
            workers: 4,
            annotation_retries: 5,
            address_poll_attempts: 30,
            address_poll_interval: Duration::from_millis(100),
            resync_interval: Some(Duration::from_secs(300)),
        }
    }
}

impl ControllerConfig {
    /// Reject values the controller cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.nbctl_path.is_empty() {
            return Err(OvnError::invalid_config(
                "nbctl path is empty",
                "Pass --nbctl with the path to ovn-nbctl",
            ));
        }
        if self.command_timeout.as_secs() == 0 {
            return Err(OvnError::invalid_config(
                "command timeout must be at least one second",
                "ovn-nbctl only accepts whole seconds for --timeout",
            ));
        }
        if self.workers == 0 {
            return Err(OvnError::invalid_config(
                "worker count must be positive",
                "Use --workers 1 or more",
            ));
        }
        if self.annotation_key.is_empty() {
            return Err(OvnError::invalid_config(
                "annotation key is empty",
                "Use the default key 'ovn' unless the node agent reads a different one",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ControllerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.command_timeout.as_secs(), 15);
        assert_eq!(config.annotation_key, "ovn");
        assert_eq!(config.address_mode, AddressMode::ControlPlane);
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let config = ControllerConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            OvnError::InvalidConfig { .. }
        ));
    }

    #[test]
    fn test_address_mode_parse() {
        assert_eq!(
            "controller".parse::<AddressMode>().unwrap(),
            AddressMode::Controller
        );
        assert_eq!(
            AddressMode::ControlPlane.to_string().parse::<AddressMode>().unwrap(),
            AddressMode::ControlPlane
        );
        assert!("static".parse::<AddressMode>().is_err());
    }
}
