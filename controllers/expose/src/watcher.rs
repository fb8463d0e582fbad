//! Deployment change feed.
//!
//! This module consumes the watch stream for Deployments, keeps the local
//! reflector cache up to date, and hands every notification to the event
//! router. Slow reconciles never block delivery: routing is a key
//! extraction plus an enqueue.

use futures::TryStreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::Api;
use kube_runtime::reflector::store::Writer;
use kube_runtime::{reflector, watcher};
use tracing::{debug, info};

use crate::error::ControllerError;
use crate::router::EventRouter;

/// Watches Deployments and feeds the router.
pub struct Watcher {
    api: Api<Deployment>,
    router: EventRouter,
}

impl Watcher {
    /// Creates a new watcher instance.
    pub fn new(api: Api<Deployment>, router: EventRouter) -> Self {
        Self { api, router }
    }

    /// Runs the watch loop until the stream fails or the process exits.
    ///
    /// The `writer` half of the reflector store is applied before events
    /// reach the router, so by the time a worker picks up a key the cache
    /// already reflects the notification that queued it.
    pub async fn watch_deployments(self, writer: Writer<Deployment>) -> Result<(), ControllerError> {
        info!("Starting Deployment watcher");

        let stream = reflector::reflector(writer, watcher(self.api.clone(), watcher::Config::default()));
        let mut stream = Box::pin(stream);

        while let Some(event) = stream
            .try_next()
            .await
            .map_err(|e| ControllerError::Watch(format!("Watcher stream error: {e}")))?
        {
            match event {
                watcher::Event::Apply(dep) => {
                    self.router.on_apply(&dep);
                }
                watcher::Event::Delete(dep) => {
                    self.router.on_delete(&dep);
                }
                watcher::Event::Init => {
                    debug!("Deployment watcher initialized");
                }
                watcher::Event::InitApply(dep) => {
                    // Initial listing: reconcile everything that already exists
                    self.router.on_apply(&dep);
                }
                watcher::Event::InitDone => {
                    info!("Initial Deployment listing cached");
                }
            }
        }

        Ok(())
    }
}
