use crate::error::{OvnError, Result};
use crate::traits::PodStore;
use k8s_openapi::api::core::v1::Pod;
use podnet_core::{PodKey, PodNetworkAnnotation, PodnetError};
use tracing::{debug, warn};

/// Reads and writes the pod network annotation
#[derive(Debug, Clone)]
pub struct AnnotationManager {
    key: String,
    max_attempts: u32,
}

impl AnnotationManager {
    pub fn new(key: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            key: key.into(),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Parse the annotation off a pod. `Ok(None)` when absent.
    pub fn read(&self, pod: &Pod) -> Result<Option<PodNetworkAnnotation>> {
        let raw = match pod
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(&self.key))
        {
            Some(raw) => raw,
            None => return Ok(None),
        };

        serde_json::from_str(raw).map(Some).map_err(|e| {
            let pod = PodKey::from_pod(pod)
                .map(|k| k.to_string())
                .unwrap_or_else(|_| "<unknown>".to_string());
            OvnError::Core(PodnetError::malformed_annotation(pod, e.to_string()))
        })
    }

    /// True unless the pod carries exactly `want`. A malformed annotation is
    /// stale.
    pub fn is_stale(&self, pod: &Pod, want: &PodNetworkAnnotation) -> bool {
        !matches!(self.read(pod), Ok(Some(ref have)) if have == want)
    }

    /// Set the annotation on the stored pod, leaving every other annotation
    /// untouched.
    ///
    /// Conflicting concurrent writers are handled by re-reading the pod and
    /// reapplying only this key, up to the configured attempt budget.
    pub async fn write(
        &self,
        store: &dyn PodStore,
        key: &PodKey,
        annotation: &PodNetworkAnnotation,
    ) -> Result<Pod> {
        let value = podnet_core::to_json(annotation)?;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let mut pod = store.get_pod(&key.namespace, &key.name).await?;

            if !self.is_stale(&pod, annotation) {
                debug!(pod = %key, "Network annotation already current");
                return Ok(pod);
            }

            pod.metadata
                .annotations
                .get_or_insert_with(Default::default)
                .insert(self.key.clone(), value.clone());

            match store.update_pod(&pod).await {
                Ok(updated) => {
                    debug!(pod = %key, annotation = %value, "Wrote network annotation");
                    return Ok(updated);
                }
                Err(OvnError::Conflict { .. }) if attempt < self.max_attempts => {
                    warn!(
                        pod = %key,
                        attempt,
                        "Conflict writing network annotation, retrying with fresh pod"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }
}
