use crate::config::ControllerConfig;
use crate::error::Result;
use crate::queue::{PodWork, WorkQueue};
use crate::reconciler::{Reconciler, ResyncReport};
use crate::traits::PodStore;
use k8s_openapi::api::core::v1::Pod;
use podnet_core::PodEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Routes pod events to the reconciler
///
/// Live events go through a per-pod coalescing [`WorkQueue`] drained by a
/// fixed pool of workers, so work for one pod is never processed twice at the
/// same time while different pods proceed in parallel.
pub struct PodDispatcher {
    reconciler: Arc<Reconciler>,
    store: Arc<dyn PodStore>,
    queue: Arc<WorkQueue>,
    workers: usize,
    resync_interval: Option<Duration>,
}

impl PodDispatcher {
    pub fn new(
        reconciler: Arc<Reconciler>,
        store: Arc<dyn PodStore>,
        config: &ControllerConfig,
    ) -> Self {
        Self {
            reconciler,
            store,
            queue: Arc::new(WorkQueue::new()),
            workers: config.workers.max(1),
            resync_interval: config.resync_interval,
        }
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Startup pass: reconcile every existing pod and drop orphaned ports.
    ///
    /// Must complete before live events are handled.
    pub async fn start(&self) -> Result<ResyncReport> {
        let pods = self.store.list_pods().await?;
        self.start_with(&pods).await
    }

    /// Startup pass over a pod list the caller already fetched, for callers
    /// that need the list's resourceVersion to begin watching from
    pub async fn start_with(&self, pods: &[Pod]) -> Result<ResyncReport> {
        self.reconciler.resync(pods).await
    }

    /// Handle one event inline, bypassing the queue
    pub async fn handle(&self, event: PodEvent) -> Result<()> {
        match event {
            PodEvent::Added(pod) | PodEvent::Modified(pod) => {
                self.reconciler.ensure_pod(&pod).await.map(|_| ())
            }
            PodEvent::Deleted(pod) => self.reconciler.delete_pod(&pod).await,
        }
    }

    /// Queue an event for the workers, replacing older work for the same pod
    pub fn enqueue(&self, event: PodEvent) {
        enqueue_event(&self.queue, event);
    }

    /// Re-list pods, delete orphaned ports and queue every pod again.
    ///
    /// Used when events may have been missed and on the periodic resync.
    /// Ensures go through the queue so they never race live work for the
    /// same pod.
    pub async fn requeue_all(&self) -> Result<()> {
        requeue_all(&self.store, &self.reconciler, &self.queue).await
    }

    /// Process live events until cancelled or the event stream closes.
    ///
    /// Subscribe `events` before calling [`PodDispatcher::start`] so nothing
    /// published during the startup pass is lost; buffered events are
    /// processed once this loop begins. Resyncs run on their own task, at
    /// most one at a time, so event intake never waits on them.
    pub async fn run(
        &self,
        mut events: broadcast::Receiver<PodEvent>,
        token: CancellationToken,
    ) -> Result<()> {
        info!(workers = self.workers, "Starting pod dispatcher");

        let handles: Vec<_> = (0..self.workers)
            .map(|id| {
                tokio::spawn(worker(
                    id,
                    Arc::clone(&self.reconciler),
                    Arc::clone(&self.queue),
                ))
            })
            .collect();

        let mut resync = self.resync_interval.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let mut sweep: Option<JoinHandle<()>> = None;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Pod dispatcher shutting down");
                    break;
                }
                _ = tick(&mut resync) => {
                    debug!("Periodic resync");
                    self.spawn_sweep(&mut sweep, "Periodic resync");
                }
                event = events.recv() => match event {
                    Ok(event) => self.enqueue(event),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Pod event receiver lagged, resyncing");
                        self.spawn_sweep(&mut sweep, "Resync after lag");
                    }
                    Err(RecvError::Closed) => {
                        info!("Pod event stream closed");
                        break;
                    }
                },
            }
        }

        if let Some(handle) = sweep.take() {
            handle.abort();
        }
        self.queue.shutdown();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Pod worker exited abnormally: {}", e);
            }
        }
        Ok(())
    }

    /// Start a resync task unless one is still running
    fn spawn_sweep(&self, sweep: &mut Option<JoinHandle<()>>, what: &'static str) {
        if sweep.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!("{} skipped, previous resync still running", what);
            return;
        }
        let store = Arc::clone(&self.store);
        let reconciler = Arc::clone(&self.reconciler);
        let queue = Arc::clone(&self.queue);
        *sweep = Some(tokio::spawn(async move {
            if let Err(e) = requeue_all(&store, &reconciler, &queue).await {
                error!("{} failed: {}", what, e);
            }
        }));
    }
}

fn enqueue_event(queue: &WorkQueue, event: PodEvent) {
    let key = match event.key() {
        Ok(k) => k,
        Err(e) => {
            warn!("Dropping pod event without identity: {}", e);
            return;
        }
    };
    let work = match event {
        PodEvent::Added(pod) | PodEvent::Modified(pod) => PodWork::Ensure(pod),
        PodEvent::Deleted(pod) => PodWork::Delete(pod),
    };
    debug!(pod = %key, "Queued pod work");
    queue.add(key, work);
}

async fn requeue_all(
    store: &Arc<dyn PodStore>,
    reconciler: &Reconciler,
    queue: &WorkQueue,
) -> Result<()> {
    let pods = store.list_pods().await?;
    let orphans = reconciler.cleanup_orphans(&pods).await?;
    info!(
        pods = pods.len(),
        orphans_deleted = orphans,
        "Requeueing all pods"
    );
    for pod in pods {
        enqueue_event(queue, PodEvent::Modified(pod));
    }
    Ok(())
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn worker(id: usize, reconciler: Arc<Reconciler>, queue: Arc<WorkQueue>) {
    debug!(worker = id, "Pod worker started");
    while let Some((key, work)) = queue.next().await {
        let result = match &work {
            PodWork::Ensure(pod) => reconciler.ensure_pod(pod).await.map(|_| ()),
            PodWork::Delete(pod) => reconciler.delete_pod(pod).await,
            PodWork::Replace { delete, ensure } => {
                match reconciler.delete_pod(delete).await {
                    Ok(()) => reconciler.ensure_pod(ensure).await.map(|_| ()),
                    Err(e) => Err(e),
                }
            }
        };
        if let Err(e) = result {
            error!(
                pod = %key,
                transient = e.is_transient(),
                "Failed to reconcile pod: {}",
                e
            );
        }
        queue.done(&key);
    }
    debug!(worker = id, "Pod worker stopped");
}
