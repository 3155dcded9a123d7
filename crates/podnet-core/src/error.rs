// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Core error type for podnet data model operations
#[derive(Error, Debug, Diagnostic)]
pub enum PodnetError {
    /// Pod object is missing a field the network core depends on
    #[error("Invalid pod: {reason}")]
    #[diagnostic(
        code(podnet::invalid_pod),
        help("{suggestion}")
    )]
    InvalidPod {
        #[allow(unused)]
        reason: String,
        #[allow(unused)]
        suggestion: String,
    },

    /// The pod network annotation could not be parsed
    #[error("Malformed network annotation on pod {pod}: {message}")]
    #[diagnostic(
        code(podnet::malformed_annotation),
        help("The annotation must be a JSON object with string fields ip_address, mac_address and gateway_ip. It will be rewritten on the next reconcile")
    )]
    MalformedAnnotation {
        #[allow(unused)]
        pod: String,
        #[allow(unused)]
        message: String,
    },

    /// Serialization error
    #[error("Serialization error: {message}")]
    #[diagnostic(
        code(podnet::serialization_error),
        help("Ensure the object is valid JSON")
    )]
    SerializationError {
        #[allow(unused)]
        message: String,
        #[source]
        #[allow(unused)]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Internal error
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(podnet::internal_error),
        help("This is likely a bug. Please report it with the full error details")
    )]
    InternalError {
        #[allow(unused)]
        message: String,
    },
}

/// Result type alias for podnet core operations
pub type Result<T> = std::result::Result<T, PodnetError>;

impl PodnetError {
    /// Create an InvalidPod error
    pub fn invalid_pod(reason: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::InvalidPod {
            reason: reason.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a MalformedAnnotation error
    pub fn malformed_annotation(pod: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedAnnotation {
            pod: pod.into(),
            message: message.into(),
        }
    }

    /// Create a SerializationError
    pub fn serialization_error(
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::SerializationError {
            message: message.into(),
            source,
        }
    }

    /// Create an InternalError
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = PodnetError::invalid_pod("Pod has no name", "Set metadata.name");
        assert!(matches!(err, PodnetError::InvalidPod { .. }));

        let err = PodnetError::malformed_annotation("default/nginx", "expected value");
        assert_eq!(
            err.to_string(),
            "Malformed network annotation on pod default/nginx: expected value"
        );
    }
}
