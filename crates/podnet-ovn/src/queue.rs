use k8s_openapi::api::core::v1::Pod;
use podnet_core::PodKey;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use tokio::sync::Notify;

/// Work pending for one pod
#[derive(Debug, Clone)]
pub enum PodWork {
    /// Converge the port with this latest observed pod state
    Ensure(Pod),
    /// The pod is gone; remove its port
    Delete(Pod),
    /// A pod was deleted and a new one created under the same name before
    /// either was processed: remove the old port, then converge the new pod
    Replace { delete: Pod, ensure: Pod },
}

impl PodWork {
    /// Fold newly observed work into what is already pending for a key.
    ///
    /// A delete is never dropped in favour of a later ensure, since the new
    /// pod may land on another switch. An ensure carrying the deleted pod's
    /// own UID is stale and is discarded.
    fn coalesce(pending: Option<PodWork>, work: PodWork) -> PodWork {
        match (pending, work) {
            (Some(PodWork::Delete(deleted)), PodWork::Ensure(pod))
            | (Some(PodWork::Replace { delete: deleted, .. }), PodWork::Ensure(pod)) => {
                if same_instance(&deleted, &pod) {
                    PodWork::Delete(deleted)
                } else {
                    PodWork::Replace {
                        delete: deleted,
                        ensure: pod,
                    }
                }
            }
            (_, work) => work,
        }
    }
}

fn same_instance(a: &Pod, b: &Pod) -> bool {
    match (&a.metadata.uid, &b.metadata.uid) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

#[derive(Debug, Default)]
struct QueueState {
    order: VecDeque<PodKey>,
    pending: HashMap<PodKey, PodWork>,
    in_flight: HashSet<PodKey>,
    shut_down: bool,
}

/// Per-pod coalescing work queue
///
/// Only the latest work for a key is kept, except that a pending delete
/// survives a later ensure for the same name. A key is handed to at most one
/// worker at a time; work that arrives while its key is in flight is held
/// back until [`WorkQueue::done`] is called for it.
#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue work for `key`, merging it with anything not yet started
    pub fn add(&self, key: PodKey, work: PodWork) {
        let mut state = self.lock();
        if state.shut_down {
            return;
        }
        let pending = state.pending.remove(&key);
        let already_queued = pending.is_some();
        state
            .pending
            .insert(key.clone(), PodWork::coalesce(pending, work));
        if !already_queued && !state.in_flight.contains(&key) {
            state.order.push_back(key);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Wait for the next key to process. `None` once the queue is shut down.
    pub async fn next(&self) -> Option<(PodKey, PodWork)> {
        loop {
            {
                let mut state = self.lock();
                if state.shut_down {
                    drop(state);
                    // pass the wakeup on to the next idle worker
                    self.notify.notify_one();
                    return None;
                }
                while let Some(key) = state.order.pop_front() {
                    if let Some(work) = state.pending.remove(&key) {
                        state.in_flight.insert(key.clone());
                        let more = !state.order.is_empty();
                        drop(state);
                        if more {
                            self.notify.notify_one();
                        }
                        return Some((key, work));
                    }
                }
            }
            self.notify.notified().await;
        }
    }

    /// Mark `key` finished; re-queue it if newer work arrived meanwhile
    pub fn done(&self, key: &PodKey) {
        let mut state = self.lock();
        state.in_flight.remove(key);
        if state.pending.contains_key(key) && !state.shut_down {
            state.order.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop handing out work and wake every waiting worker
    pub fn shutdown(&self) {
        self.lock().shut_down = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Keys waiting to be processed
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when nothing is queued and nothing is being processed
    pub fn is_idle(&self) -> bool {
        let state = self.lock();
        state.pending.is_empty() && state.in_flight.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn pod(name: &str, node: Option<&str>) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.name = Some(name.to_string());
        pod.metadata.namespace = Some("default".to_string());
        pod.spec = Some(k8s_openapi::api::core::v1::PodSpec {
            node_name: node.map(String::from),
            ..Default::default()
        });
        pod
    }

    fn key(name: &str) -> PodKey {
        PodKey::new("default", name)
    }

    #[tokio::test]
    async fn test_coalesces_to_latest_work() {
        let queue = WorkQueue::new();
        queue.add(key("a"), PodWork::Ensure(pod("a", None)));
        queue.add(key("a"), PodWork::Ensure(pod("a", Some("node1"))));
        assert_eq!(queue.len(), 1);

        let (k, work) = queue.next().await.unwrap();
        assert_eq!(k, key("a"));
        match work {
            PodWork::Ensure(p) => {
                assert_eq!(p.spec.unwrap().node_name.as_deref(), Some("node1"))
            }
            other => panic!("unexpected work: {:?}", other),
        }
    }

    fn with_uid(mut pod: Pod, uid: &str) -> Pod {
        pod.metadata.uid = Some(uid.to_string());
        pod
    }

    #[tokio::test]
    async fn test_ensure_after_delete_keeps_the_delete() {
        let queue = WorkQueue::new();
        queue.add(key("a"), PodWork::Delete(pod("a", Some("node1"))));
        queue.add(key("a"), PodWork::Ensure(pod("a", None)));
        queue.add(key("a"), PodWork::Ensure(pod("a", Some("node2"))));
        assert_eq!(queue.len(), 1);

        let (_, work) = queue.next().await.unwrap();
        match work {
            PodWork::Replace { delete, ensure } => {
                assert_eq!(delete.spec.unwrap().node_name.as_deref(), Some("node1"));
                assert_eq!(ensure.spec.unwrap().node_name.as_deref(), Some("node2"));
            }
            other => panic!("unexpected work: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stale_ensure_for_deleted_pod_is_dropped() {
        let queue = WorkQueue::new();
        let deleted = with_uid(pod("a", Some("node1")), "uid-1");
        queue.add(key("a"), PodWork::Delete(deleted.clone()));
        queue.add(key("a"), PodWork::Ensure(deleted));

        let (_, work) = queue.next().await.unwrap();
        assert!(matches!(work, PodWork::Delete(_)));
    }

    #[tokio::test]
    async fn test_delete_supersedes_pending_replace() {
        let queue = WorkQueue::new();
        queue.add(key("a"), PodWork::Delete(pod("a", Some("node1"))));
        queue.add(key("a"), PodWork::Ensure(pod("a", Some("node2"))));
        queue.add(key("a"), PodWork::Delete(pod("a", Some("node2"))));

        let (_, work) = queue.next().await.unwrap();
        match work {
            PodWork::Delete(p) => {
                assert_eq!(p.spec.unwrap().node_name.as_deref(), Some("node2"))
            }
            other => panic!("unexpected work: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_in_flight_key_is_held_back() {
        let queue = WorkQueue::new();
        queue.add(key("a"), PodWork::Ensure(pod("a", Some("node1"))));
        let (k, _) = queue.next().await.unwrap();

        // arrives while "a" is being processed
        queue.add(key("a"), PodWork::Delete(pod("a", Some("node1"))));
        queue.add(key("b"), PodWork::Ensure(pod("b", Some("node1"))));

        let (next, _) = queue.next().await.unwrap();
        assert_eq!(next, key("b"));

        queue.done(&k);
        let (again, work) = queue.next().await.unwrap();
        assert_eq!(again, key("a"));
        assert!(matches!(work, PodWork::Delete(_)));

        queue.done(&again);
        queue.done(&next);
        assert!(queue.is_idle());
    }

    #[tokio::test]
    async fn test_shutdown_releases_waiting_workers() {
        let queue = Arc::new(WorkQueue::new());
        let mut handles = Vec::new();
        for _ in 0..3 {
            let q = queue.clone();
            handles.push(tokio::spawn(async move { q.next().await }));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.shutdown();

        for handle in handles {
            let result = tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .unwrap()
                .unwrap();
            assert!(result.is_none());
        }
    }
}
