//! Reconcile loops
//!
//! Every long-lived component runs either as a [`Controller`] (watch-driven
//! work queue feeding a [`Reconciler`]) or as a fixed-period poller
//! ([`run_periodic`]). Errors are turned into requeue decisions through
//! [`Error::action`](crate::error::Error::action).

mod queue;

pub use queue::WorkQueue;

use crate::error::{ErrorAction, Result};
use crate::metrics::Metrics;
use crate::store::{ListSelector, ObjectKey, ResourceStoreRef, WatchEvent};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of a successful reconcile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing more to do until the next event
    Done,
    /// Reconcile again after the delay
    Requeue(Duration),
}

/// A level-triggered reconciler for one primary kind
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Name used in logs and metrics
    fn name(&self) -> &str;

    /// Primary kind, listed on startup
    fn kind(&self) -> &str;

    /// Restrict the primary kind to one namespace
    fn namespace(&self) -> Option<&str> {
        None
    }

    /// Keys to reconcile for a store change. Defaults to the object itself
    /// when it is of the primary kind.
    async fn map_event(&self, event: &WatchEvent) -> Vec<ObjectKey> {
        if event.kind() != Some(self.kind()) {
            return Vec::new();
        }
        ObjectKey::of(event.object()).ok().into_iter().collect()
    }

    /// Drive one object towards its desired state
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action>;
}

/// Controller tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ControllerConfig {
    /// Concurrent workers
    pub workers: usize,
    /// First retry delay for failing keys
    #[serde(with = "crate::config::duration_millis")]
    pub base_backoff: Duration,
    /// Retry delay cap
    #[serde(with = "crate::config::duration_secs")]
    pub max_backoff: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(300),
        }
    }
}

/// Watch-driven work-queue loop around a [`Reconciler`]
pub struct Controller<R: Reconciler> {
    reconciler: Arc<R>,
    store: ResourceStoreRef,
    config: ControllerConfig,
    metrics: Option<Arc<Metrics>>,
    relist_trigger: Option<watch::Receiver<u64>>,
}

impl<R: Reconciler> Controller<R> {
    pub fn new(reconciler: Arc<R>, store: ResourceStoreRef) -> Self {
        Self {
            reconciler,
            store,
            config: ControllerConfig::default(),
            metrics: None,
            relist_trigger: None,
        }
    }

    /// Relist every primary object whenever `trigger` changes
    pub fn with_relist_trigger(mut self, trigger: watch::Receiver<u64>) -> Self {
        self.relist_trigger = Some(trigger);
        self
    }

    pub fn with_config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run until `shutdown` is cancelled
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        let name = self.reconciler.name().to_string();
        info!(controller = %name, workers = self.config.workers, "Starting controller");

        let queue = WorkQueue::new(
            self.config.base_backoff,
            self.config.max_backoff,
            shutdown.child_token(),
        );

        // Subscribe before the initial list so nothing falls in between
        let mut events = self.store.watch();
        self.enqueue_all(&queue).await?;

        let watch_task = {
            let reconciler = Arc::clone(&self.reconciler);
            let queue = Arc::clone(&queue);
            let shutdown = shutdown.clone();
            let this = self.relister();
            let mut trigger = self.relist_trigger.take();
            tokio::spawn(async move {
                loop {
                    let event = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        open = trigger_changed(&mut trigger) => {
                            if !open {
                                trigger = None;
                                continue;
                            }
                            debug!(controller = %reconciler.name(), "Relist triggered");
                            if let Err(e) = this.enqueue_all(&queue).await {
                                error!(controller = %reconciler.name(), error = %e, "Relist failed");
                            }
                            continue;
                        }
                        event = events.recv() => event,
                    };
                    match event {
                        Ok(event) => {
                            for key in reconciler.map_event(&event).await {
                                if accepts(reconciler.as_ref(), &key) {
                                    queue.add(key);
                                }
                            }
                        }
                        Err(RecvError::Lagged(missed)) => {
                            warn!(controller = %reconciler.name(), missed, "Watch lagged, relisting");
                            if let Err(e) = this.enqueue_all(&queue).await {
                                error!(controller = %reconciler.name(), error = %e, "Relist failed");
                            }
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            })
        };

        let workers: Vec<_> = (0..self.config.workers.max(1))
            .map(|_| {
                let reconciler = Arc::clone(&self.reconciler);
                let queue = Arc::clone(&queue);
                let metrics = self.metrics.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    loop {
                        let key = tokio::select! {
                            _ = shutdown.cancelled() => break,
                            key = queue.next() => match key {
                                Some(key) => key,
                                None => break,
                            },
                        };
                        process(reconciler.as_ref(), &queue, metrics.as_deref(), key).await;
                    }
                })
            })
            .collect();

        for worker in workers {
            let _ = worker.await;
        }
        let _ = watch_task.await;

        info!(controller = %name, "Controller stopped");
        Ok(())
    }

    fn relister(&self) -> Relister<R> {
        Relister {
            reconciler: Arc::clone(&self.reconciler),
            store: Arc::clone(&self.store),
        }
    }

    async fn enqueue_all(&self, queue: &Arc<WorkQueue>) -> Result<()> {
        self.relister().enqueue_all(queue).await
    }
}

/// Lists the primary kind into the queue
struct Relister<R: Reconciler> {
    reconciler: Arc<R>,
    store: ResourceStoreRef,
}

impl<R: Reconciler> Relister<R> {
    async fn enqueue_all(&self, queue: &Arc<WorkQueue>) -> Result<()> {
        let objects = self
            .store
            .list(self.reconciler.kind(), self.reconciler.namespace(), &ListSelector::all())
            .await?;
        debug!(controller = %self.reconciler.name(), count = objects.len(), "Listed primary objects");
        for obj in &objects {
            if let Ok(key) = ObjectKey::of(obj) {
                queue.add(key);
            }
        }
        Ok(())
    }
}

/// Wait for the next trigger change; `false` once the sender is gone.
/// Never resolves without a trigger.
async fn trigger_changed(trigger: &mut Option<watch::Receiver<u64>>) -> bool {
    match trigger {
        Some(rx) => rx.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}

fn accepts<R: Reconciler>(reconciler: &R, key: &ObjectKey) -> bool {
    key.kind == reconciler.kind()
        && match reconciler.namespace() {
            Some(ns) => key.namespace.as_deref() == Some(ns),
            None => true,
        }
}

async fn process<R: Reconciler>(
    reconciler: &R,
    queue: &Arc<WorkQueue>,
    metrics: Option<&Metrics>,
    key: ObjectKey,
) {
    let started = Instant::now();
    let result = reconciler.reconcile(&key).await;
    let outcome = match &result {
        Ok(Action::Done) => {
            queue.forget(&key);
            "done"
        }
        Ok(Action::Requeue(delay)) => {
            queue.forget(&key);
            queue.add_after(key.clone(), *delay);
            "requeue"
        }
        Err(e) => {
            match e.action() {
                ErrorAction::RequeueWithBackoff => {
                    let delay = queue.backoff(&key);
                    warn!(controller = %reconciler.name(), key = %key, error = %e, retry_in = ?delay, "Reconcile failed");
                    queue.add_after(key.clone(), delay);
                }
                ErrorAction::RequeueAfter(delay) => {
                    info!(controller = %reconciler.name(), key = %key, error = %e, retry_in = ?delay, "Reconcile deferred");
                    queue.add_after(key.clone(), delay);
                }
                ErrorAction::NoRequeue => {
                    debug!(controller = %reconciler.name(), key = %key, error = %e, "Reconcile stopped");
                    queue.forget(&key);
                }
            }
            "error"
        }
    };
    queue.done(&key);

    if let Some(metrics) = metrics {
        metrics.observe_reconcile(reconciler.name(), outcome, started.elapsed().as_secs_f64());
    }
}

/// Run `tick` every `period` until cancelled. Ticks never overlap; a slow
/// tick delays the next one instead of bunching.
pub async fn run_periodic<F, Fut>(name: &str, period: Duration, shutdown: CancellationToken, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(poller = name, period = ?period, "Starting poller");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = tick().await {
                    warn!(poller = name, error = %e, "Periodic run failed");
                }
            }
        }
    }
    info!(poller = name, "Poller stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::store::{MemoryStore, ResourceStore};
    use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recording {
        seen: Mutex<Vec<String>>,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl Reconciler for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        fn kind(&self) -> &str {
            "Volume"
        }

        async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
            self.seen.lock().push(key.name.clone());
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::Conflict {
                    kind: "Volume".into(),
                    name: key.name.clone(),
                });
            }
            Ok(Action::Done)
        }
    }

    fn volume(name: &str) -> DynamicObject {
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("pool-broker.io", "v1alpha1", "Volume"));
        let mut obj = DynamicObject::new(name, &ar).within("default");
        obj.data = serde_json::json!({"spec": {}});
        obj
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_controller_lists_watches_and_retries() {
        let store = Arc::new(MemoryStore::new());
        store.create(volume("existing")).await.unwrap();

        let reconciler = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
            failures_left: AtomicUsize::new(1),
        });
        let shutdown = CancellationToken::new();
        let controller = Controller::new(reconciler.clone(), store.clone()).with_config(ControllerConfig {
            workers: 2,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
        });
        let handle = tokio::spawn(controller.run(shutdown.clone()));

        wait_until(|| reconciler.seen.lock().len() >= 2).await;
        store.create(volume("fresh")).await.unwrap();
        wait_until(|| reconciler.seen.lock().iter().any(|n| n == "fresh")).await;

        shutdown.cancel();
        handle.await.unwrap().unwrap();

        let seen = reconciler.seen.lock();
        // First attempt on "existing" conflicted and was retried
        assert_eq!(seen.iter().filter(|n| *n == "existing").count(), 2);
    }

    #[tokio::test]
    async fn test_relist_trigger_reconciles_everything_again() {
        let store = Arc::new(MemoryStore::new());
        store.create(volume("parked")).await.unwrap();

        let reconciler = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
            failures_left: AtomicUsize::new(0),
        });
        let (trigger, rx) = watch::channel(0u64);
        let shutdown = CancellationToken::new();
        let controller = Controller::new(reconciler.clone(), store.clone()).with_relist_trigger(rx);
        let handle = tokio::spawn(controller.run(shutdown.clone()));

        wait_until(|| reconciler.seen.lock().len() == 1).await;
        trigger.send_modify(|generation| *generation += 1);
        wait_until(|| reconciler.seen.lock().len() == 2).await;

        // A dropped trigger leaves the controller running on watch events
        drop(trigger);
        store.create(volume("later")).await.unwrap();
        wait_until(|| reconciler.seen.lock().iter().any(|n| n == "later")).await;

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_run_periodic_stops_on_cancel() {
        let count = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();
        let handle = {
            let count = count.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                run_periodic("test", Duration::from_millis(5), shutdown, || {
                    let count = count.clone();
                    async move {
                        count.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .await
            })
        };
        wait_until(|| count.load(Ordering::SeqCst) >= 3).await;
        shutdown.cancel();
        handle.await.unwrap();
    }
}
