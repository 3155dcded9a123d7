//! Podnet Core - data model shared by the pod network controller
//!
//! This crate provides:
//! - Pod identity and logical switch port naming
//! - The pod network annotation published for the node agent
//! - Pod lifecycle events
//! - Error types with miette diagnostics

pub mod error;
pub mod events;
pub mod types;

// Re-export commonly used types
pub use error::{PodnetError, Result};
pub use events::{PodEvent, WatchEventType};
pub use types::{is_terminal_phase, PodKey, PodNetworkAnnotation, PORT_NAME_SEPARATOR};

// Re-export k8s-openapi types for convenience
pub use k8s_openapi;
pub use k8s_openapi::api::core::v1::Pod;
pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Serialize a value to JSON
pub fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| {
        PodnetError::serialization_error(
            format!("Failed to serialize to JSON: {}", e),
            Some(Box::new(e)),
        )
    })
}

/// Deserialize a value from JSON
pub fn from_json<T: for<'de> serde::Deserialize<'de>>(data: &str) -> Result<T> {
    serde_json::from_str(data).map_err(|e| {
        PodnetError::serialization_error(
            format!("Failed to deserialize from JSON: {}", e),
            Some(Box::new(e)),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_serialization() {
        let mut pod = Pod::default();
        pod.metadata.name = Some("nginx".to_string());

        let json = to_json(&pod).unwrap();
        assert!(json.contains("nginx"));

        let deserialized: Pod = from_json(&json).unwrap();
        assert_eq!(deserialized.metadata.name, Some("nginx".to_string()));
    }

    #[test]
    fn test_annotation_serializes_in_field_order() {
        let annotation =
            PodNetworkAnnotation::new("10.128.1.4/24", "11:22:33:44:55:66", "10.128.1.1");
        assert_eq!(
            to_json(&annotation).unwrap(),
            r#"{"ip_address":"10.128.1.4/24","mac_address":"11:22:33:44:55:66","gateway_ip":"10.128.1.1"}"#
        );
    }
}
