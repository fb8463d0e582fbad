//! Event router.
//!
//! Pure translation stage between the change feed and the retry queue:
//! each notification is reduced to a reconcile key and enqueued. No
//! decision logic lives here; the reconciler recomputes desired state
//! from current cached data, never from the event payload, so adds,
//! updates and deletes are all routed identically.

use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::ControllerError;
use crate::metrics::Metrics;
use crate::queue::{ReconcileKey, RetryQueue};

/// Routes change notifications into the retry queue.
#[derive(Debug, Clone)]
pub struct EventRouter {
    queue: Arc<RetryQueue>,
    metrics: Metrics,
}

/// Extracts the stable reconcile key from a notified object.
///
/// Fails if the object lacks a name or namespace; such notifications are
/// dropped by the router.
pub fn reconcile_key(dep: &Deployment) -> Result<ReconcileKey, ControllerError> {
    let name = dep
        .metadata
        .name
        .clone()
        .ok_or_else(|| ControllerError::KeyExtraction("object has no name".to_string()))?;
    let namespace = dep.namespace().ok_or_else(|| {
        ControllerError::KeyExtraction(format!("object {name} has no namespace"))
    })?;
    Ok(ReconcileKey::new(namespace, name))
}

impl EventRouter {
    /// Creates a router feeding the given queue.
    pub fn new(queue: Arc<RetryQueue>, metrics: Metrics) -> Self {
        Self { queue, metrics }
    }

    /// Handles an add or update notification.
    pub fn on_apply(&self, dep: &Deployment) {
        self.enqueue(dep);
    }

    /// Handles a delete notification. The key is enqueued like any other;
    /// the reconciler discovers the deletion through its authoritative
    /// read.
    pub fn on_delete(&self, dep: &Deployment) {
        self.enqueue(dep);
    }

    fn enqueue(&self, dep: &Deployment) {
        match reconcile_key(dep) {
            Ok(key) => {
                debug!(key = %key, "queued");
                self.queue.add(key);
                self.metrics.queued.inc();
            }
            Err(e) => {
                // Unrecoverable: nothing to requeue without a key
                warn!(error = %e, "dropping malformed notification");
                self.metrics.drops.inc();
            }
        }
    }
}
