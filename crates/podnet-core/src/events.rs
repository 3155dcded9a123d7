use crate::error::Result;
use crate::types::PodKey;
use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};

/// Watch event type as it appears on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
    Bookmark,
    Error,
}

/// A pod lifecycle notification delivered by the watch mechanism
#[derive(Debug, Clone)]
pub enum PodEvent {
    Added(Pod),
    Modified(Pod),
    Deleted(Pod),
}

impl PodEvent {
    /// Build a pod event from a wire event type. Bookmark and error events
    /// carry no pod state and map to `None`.
    pub fn from_watch(event_type: WatchEventType, pod: Pod) -> Option<Self> {
        match event_type {
            WatchEventType::Added => Some(PodEvent::Added(pod)),
            WatchEventType::Modified => Some(PodEvent::Modified(pod)),
            WatchEventType::Deleted => Some(PodEvent::Deleted(pod)),
            WatchEventType::Bookmark | WatchEventType::Error => None,
        }
    }

    /// The pod object carried by this event
    pub fn pod(&self) -> &Pod {
        match self {
            PodEvent::Added(pod) | PodEvent::Modified(pod) | PodEvent::Deleted(pod) => pod,
        }
    }

    /// Identity of the pod this event refers to
    pub fn key(&self) -> Result<PodKey> {
        PodKey::from_pod(self.pod())
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, PodEvent::Deleted(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_event_type_serde() {
        let t: WatchEventType = serde_json::from_str("\"MODIFIED\"").unwrap();
        assert_eq!(t, WatchEventType::Modified);
    }

    #[test]
    fn test_from_watch_skips_bookmarks() {
        let mut pod = Pod::default();
        pod.metadata.name = Some("nginx".to_string());
        pod.metadata.namespace = Some("web".to_string());

        assert!(PodEvent::from_watch(WatchEventType::Bookmark, pod.clone()).is_none());

        let event = PodEvent::from_watch(WatchEventType::Deleted, pod).unwrap();
        assert!(event.is_delete());
        assert_eq!(event.key().unwrap(), PodKey::new("web", "nginx"));
    }
}
