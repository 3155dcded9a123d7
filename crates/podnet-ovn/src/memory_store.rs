use crate::error::{OvnError, Result};
use crate::traits::PodStore;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use podnet_core::{PodEvent, PodKey};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

/// Capacity of the pod event broadcast channel
const EVENT_CAPACITY: usize = 1024;

/// In-memory pod store with watch events
///
/// Mirrors the orchestration API closely enough for the controller: every
/// write bumps `metadata.resourceVersion`, updates carrying a stale version
/// are rejected with `OvnError::Conflict`, and each mutation is broadcast as a
/// `PodEvent`.
pub struct MemoryPodStore {
    pods: RwLock<BTreeMap<PodKey, Pod>>,
    next_version: AtomicU64,
    forced_conflicts: AtomicU32,
    event_tx: broadcast::Sender<PodEvent>,
}

impl Default for MemoryPodStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPodStore {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            pods: RwLock::new(BTreeMap::new()),
            next_version: AtomicU64::new(1),
            forced_conflicts: AtomicU32::new(0),
            event_tx,
        }
    }

    /// Store pre-populated with `pods`, without emitting events
    pub fn with_pods(pods: impl IntoIterator<Item = Pod>) -> Result<Self> {
        let store = Self::new();
        {
            let mut map = store.pods.try_write().map_err(|_| {
                OvnError::internal_error("fresh MemoryPodStore is already locked")
            })?;
            for mut pod in pods {
                let key = PodKey::from_pod(&pod)?;
                pod.metadata.resource_version = Some(store.bump());
                map.insert(key, pod);
            }
        }
        Ok(store)
    }

    fn bump(&self) -> String {
        self.next_version.fetch_add(1, Ordering::SeqCst).to_string()
    }

    /// Subscribe to pod mutation events
    pub fn subscribe(&self) -> broadcast::Receiver<PodEvent> {
        self.event_tx.subscribe()
    }

    pub fn event_sender(&self) -> broadcast::Sender<PodEvent> {
        self.event_tx.clone()
    }

    /// Make the next `n` updates fail with a conflict
    pub fn inject_conflicts(&self, n: u32) {
        self.forced_conflicts.store(n, Ordering::SeqCst);
    }

    fn publish(&self, event: PodEvent) {
        // No subscribers is fine; nobody is watching yet
        let _ = self.event_tx.send(event);
    }

    pub async fn create(&self, mut pod: Pod) -> Result<Pod> {
        let key = PodKey::from_pod(&pod)?;
        let mut pods = self.pods.write().await;
        if pods.contains_key(&key) {
            return Err(OvnError::api_error(format!("pod {} already exists", key)));
        }
        pod.metadata.resource_version = Some(self.bump());
        pods.insert(key.clone(), pod.clone());
        debug!("MemoryPodStore: created {}", key);
        self.publish(PodEvent::Added(pod.clone()));
        Ok(pod)
    }

    pub async fn delete(&self, namespace: &str, name: &str) -> Result<Pod> {
        let key = PodKey::new(namespace, name);
        let pod = self
            .pods
            .write()
            .await
            .remove(&key)
            .ok_or_else(|| OvnError::pod_not_found(key.to_string()))?;
        debug!("MemoryPodStore: deleted {}", key);
        self.publish(PodEvent::Deleted(pod.clone()));
        Ok(pod)
    }
}

#[async_trait]
impl PodStore for MemoryPodStore {
    async fn list_pods(&self) -> Result<Vec<Pod>> {
        Ok(self.pods.read().await.values().cloned().collect())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        let key = PodKey::new(namespace, name);
        self.pods
            .read()
            .await
            .get(&key)
            .cloned()
            .ok_or_else(|| OvnError::pod_not_found(key.to_string()))
    }

    async fn update_pod(&self, pod: &Pod) -> Result<Pod> {
        let key = PodKey::from_pod(pod)?;

        let forced = self
            .forced_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if forced {
            return Err(OvnError::conflict(key.to_string()));
        }

        let mut pods = self.pods.write().await;
        let stored = pods
            .get(&key)
            .ok_or_else(|| OvnError::pod_not_found(key.to_string()))?;

        // An update without a version is unconditional, as with the API server
        if let Some(version) = &pod.metadata.resource_version {
            if stored.metadata.resource_version.as_ref() != Some(version) {
                return Err(OvnError::conflict(key.to_string()));
            }
        }

        let mut updated = pod.clone();
        updated.metadata.resource_version = Some(self.bump());
        pods.insert(key.clone(), updated.clone());
        debug!("MemoryPodStore: updated {}", key);
        self.publish(PodEvent::Modified(updated.clone()));
        Ok(updated)
    }
}
