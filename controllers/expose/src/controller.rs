//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the pipeline
//! together: change feed -> event router -> retry queue -> worker pool ->
//! reconciler. It owns every handle explicitly (queue, cache, cluster
//! client, metrics); there is no ambient state.

use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use kube::{Api, Client};
use kube_runtime::reflector::{self, Store};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backoff::ExponentialBackoff;
use crate::cluster::{ClusterApi, KubeClusterApi};
use crate::error::{ControllerError, ErrorKind};
use crate::metrics::Metrics;
use crate::queue::RetryQueue;
use crate::reconciler::Reconciler;
use crate::router::EventRouter;
use crate::watcher::Watcher;

/// Consecutive failures of one key before it is dropped instead of
/// requeued.
const MAX_RETRIES: u32 = 15;

/// Runtime configuration, read from the environment in `main`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Namespace to watch; `None` watches all namespaces
    pub namespace: Option<String>,
    /// Number of worker tasks draining the queue
    pub workers: usize,
}

/// Main controller for Deployment exposure.
pub struct Controller {
    queue: Arc<RetryQueue>,
    reconciler: Arc<Reconciler<KubeClusterApi>>,
    store: Store<Deployment>,
    metrics: Metrics,
    watcher_handle: JoinHandle<Result<(), ControllerError>>,
    workers: usize,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Creates a new controller instance and starts the change feed.
    pub async fn new(config: Config) -> Result<Self, ControllerError> {
        info!("Initializing Expose Controller");

        let kube_client = Client::try_default().await?;

        let deployment_api: Api<Deployment> = match config.namespace.as_deref() {
            Some(ns) => Api::namespaced(kube_client.clone(), ns),
            None => Api::all(kube_client.clone()),
        };

        let metrics = Metrics::new()?;
        let queue = Arc::new(RetryQueue::new(
            Box::new(ExponentialBackoff::default()),
            MAX_RETRIES,
        ));

        // The store is the local primary cache; the writer half belongs to
        // the watcher task.
        let (store, writer) = reflector::store();

        let router = EventRouter::new(Arc::clone(&queue), metrics.clone());
        let watcher_instance = Watcher::new(deployment_api, router);
        let watcher_handle = tokio::spawn(async move {
            watcher_instance.watch_deployments(writer).await
        });

        let cluster = Arc::new(KubeClusterApi::new(kube_client));
        let reconciler = Arc::new(Reconciler::new(cluster, store.clone()));

        Ok(Self {
            queue,
            reconciler,
            store,
            metrics,
            watcher_handle,
            workers: config.workers,
        })
    }

    /// Runs the controller until a termination signal or watcher failure.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        // Cache sync barrier: no worker starts before the initial listing
        // is cached, so early reconciles never act on an empty cache.
        info!("Waiting for Deployment cache to sync");
        tokio::select! {
            synced = self.store.wait_until_ready() => {
                synced.map_err(|e| ControllerError::Watch(format!("Cache sync failed: {e}")))?;
                info!("Deployment cache synced");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Termination signal during cache sync, shutting down");
                self.queue.shut_down();
                self.watcher_handle.abort();
                return Ok(());
            }
        }

        info!(workers = self.workers, "Expose Controller running");
        let mut worker_handles = Vec::with_capacity(self.workers);
        for id in 0..self.workers {
            worker_handles.push(tokio::spawn(worker_loop(
                id,
                Arc::clone(&self.queue),
                Arc::clone(&self.reconciler),
                self.metrics.clone(),
            )));
        }

        let outcome = tokio::select! {
            result = &mut self.watcher_handle => {
                result
                    .map_err(|e| ControllerError::Watch(format!("Deployment watcher panicked: {e}")))
                    .and_then(|r| r.map_err(|e| ControllerError::Watch(format!("Deployment watcher error: {e}"))))
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Termination signal received, shutting down");
                Ok(())
            }
        };

        // Broadcast shutdown; queued keys are abandoned, in-flight
        // reconciles finish their current pass but are not waited on
        // beyond worker join.
        self.watcher_handle.abort();
        self.queue.shut_down();
        for handle in worker_handles {
            if let Err(e) = handle.await {
                error!("Worker panicked: {e}");
            }
        }
        self.metrics.report();
        outcome
    }
}

/// One worker: drain the queue, reconcile each key, record the outcome.
///
/// The queue guarantees a key is never handed to two workers at once, so
/// reconciles for one key are strictly serialized while distinct keys
/// proceed in parallel.
pub(crate) async fn worker_loop<C: ClusterApi>(
    id: usize,
    queue: Arc<RetryQueue>,
    reconciler: Arc<Reconciler<C>>,
    metrics: Metrics,
) {
    debug!(worker = id, "worker started");
    while let Some(key) = queue.get().await {
        let result = reconciler.reconcile(&key).await;
        queue.done(&key);
        match result {
            Ok(()) => {
                queue.forget(&key);
                metrics.converges.inc();
                info!(worker = id, key = %key, "converged");
            }
            Err(e) => match e.kind() {
                ErrorKind::Transient => {
                    if Arc::clone(&queue).add_rate_limited(key.clone()) {
                        metrics.retries.inc();
                        warn!(worker = id, key = %key, error = %e, "retry scheduled");
                    } else {
                        metrics.drops.inc();
                        error!(worker = id, key = %key, error = %e, "dropped after exhausting retries");
                    }
                }
                ErrorKind::Terminal => {
                    queue.forget(&key);
                    metrics.drops.inc();
                    error!(worker = id, key = %key, error = %e, "terminal reconcile error, dropped");
                }
            },
        }
    }
    debug!(worker = id, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::FixedBackoff;
    use crate::test_utils::{seeded_store, test_deployment, test_key, MockClusterApi};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn labels(app: &str) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), app.to_string());
        labels
    }

    fn pipeline(
        cluster: &Arc<MockClusterApi>,
        cached: Vec<k8s_openapi::api::apps::v1::Deployment>,
    ) -> (Arc<RetryQueue>, Arc<Reconciler<MockClusterApi>>, Metrics) {
        let queue = Arc::new(RetryQueue::new(Box::new(FixedBackoff(Duration::ZERO)), 5));
        let reconciler = Arc::new(Reconciler::new(Arc::clone(cluster), seeded_store(cached)));
        let metrics = Metrics::new().expect("fresh registry");
        (queue, reconciler, metrics)
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached within timeout");
    }

    #[tokio::test]
    async fn test_transient_failure_requeued_then_converges() {
        let dep = test_deployment("web", "default", labels("web"));
        let cluster = Arc::new(MockClusterApi::default());
        cluster.put_deployment(dep.clone());
        cluster.fail_creates(1);

        let (queue, reconciler, metrics) = pipeline(&cluster, vec![dep]);
        queue.add(test_key("default", "web"));

        let worker = tokio::spawn(worker_loop(
            0,
            Arc::clone(&queue),
            reconciler,
            metrics.clone(),
        ));

        {
            let cluster = Arc::clone(&cluster);
            wait_for(move || cluster.service("default", "web").is_some()).await;
        }
        queue.shut_down();
        worker.await.expect("worker exits cleanly");

        // One failed create, one successful retry; retry state forgotten
        assert_eq!(cluster.create_calls(), 2);
        assert_eq!(metrics.retries.get(), 1);
        assert_eq!(metrics.converges.get(), 1);
        assert_eq!(queue.retries(&test_key("default", "web")), 0);
    }

    #[tokio::test]
    async fn test_terminal_failure_dropped_without_retry() {
        let dep = test_deployment("web", "default", BTreeMap::new());
        let cluster = Arc::new(MockClusterApi::default());
        cluster.put_deployment(dep.clone());

        let (queue, reconciler, metrics) = pipeline(&cluster, vec![dep]);
        queue.add(test_key("default", "web"));

        let worker = tokio::spawn(worker_loop(
            0,
            Arc::clone(&queue),
            reconciler,
            metrics.clone(),
        ));

        {
            let metrics = metrics.clone();
            wait_for(move || metrics.drops.get() == 1).await;
        }
        queue.shut_down();
        worker.await.expect("worker exits cleanly");

        assert_eq!(metrics.retries.get(), 0, "terminal errors are not requeued");
        assert_eq!(cluster.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_workers_drain_distinct_keys() {
        let web = test_deployment("web", "default", labels("web"));
        let api = test_deployment("api", "default", labels("api"));
        let cluster = Arc::new(MockClusterApi::default());
        cluster.put_deployment(web.clone());
        cluster.put_deployment(api.clone());

        let (queue, reconciler, metrics) = pipeline(&cluster, vec![web, api]);
        queue.add(test_key("default", "web"));
        queue.add(test_key("default", "api"));

        let workers: Vec<_> = (0..2)
            .map(|id| {
                tokio::spawn(worker_loop(
                    id,
                    Arc::clone(&queue),
                    Arc::clone(&reconciler),
                    metrics.clone(),
                ))
            })
            .collect();

        {
            let cluster = Arc::clone(&cluster);
            wait_for(move || {
                cluster.service("default", "web").is_some()
                    && cluster.service("default", "api").is_some()
            })
            .await;
        }
        queue.shut_down();
        for worker in workers {
            worker.await.expect("workers exit cleanly");
        }

        assert_eq!(metrics.converges.get(), 2);
    }

    #[tokio::test]
    async fn test_workers_exit_on_shutdown() {
        let cluster = Arc::new(MockClusterApi::default());
        let (queue, reconciler, metrics) = pipeline(&cluster, vec![]);

        let worker = tokio::spawn(worker_loop(0, Arc::clone(&queue), reconciler, metrics));
        tokio::task::yield_now().await;
        queue.shut_down();

        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .expect("worker exits promptly on shutdown")
            .expect("worker exits cleanly");
    }
}
