//! Reconciliation decision core.
//!
//! Given a reconcile key, this module decides the desired state of the
//! managed Service from the current Deployment state and issues the
//! minimal mutation to converge. The decision is level-triggered: it only
//! looks at current state, never at the event that queued the key, so
//! repeated or out-of-order notifications converge to the same result.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube_runtime::reflector::{ObjectRef, Store};
use tracing::{debug, info};

use crate::cluster::ClusterApi;
use crate::error::ControllerError;
use crate::queue::ReconcileKey;

/// Port every managed Service exposes.
const EXPOSED_PORT: i32 = 80;
/// Name of the exposed port.
const PORT_NAME: &str = "http";

/// Computes and applies the desired Service for one Deployment key.
pub struct Reconciler<C: ClusterApi> {
    cluster: Arc<C>,
    cache: Store<Deployment>,
}

impl<C: ClusterApi> std::fmt::Debug for Reconciler<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler").finish_non_exhaustive()
    }
}

/// The label set governing a Deployment's pods, used as the Service
/// selector.
fn governing_labels(dep: &Deployment) -> Option<&BTreeMap<String, String>> {
    dep.spec
        .as_ref()?
        .template
        .metadata
        .as_ref()?
        .labels
        .as_ref()
}

/// The Service this controller wants to exist for the given key.
fn desired_service(key: &ReconcileKey, selector: BTreeMap<String, String>) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(key.name.clone()),
            namespace: Some(key.namespace.clone()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(selector),
            ports: Some(vec![ServicePort {
                name: Some(PORT_NAME.to_string()),
                port: EXPOSED_PORT,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

impl<C: ClusterApi> Reconciler<C> {
    /// Creates a reconciler over a cluster API handle and the locally
    /// synced Deployment cache.
    pub fn new(cluster: Arc<C>, cache: Store<Deployment>) -> Self {
        Self { cluster, cache }
    }

    /// Drives the Service for `key` toward the state derived from its
    /// Deployment, or removes it if the Deployment is gone.
    ///
    /// Idempotent: re-running against unchanged cluster state performs no
    /// further mutations and returns success.
    pub async fn reconcile(&self, key: &ReconcileKey) -> Result<(), ControllerError> {
        debug!(key = %key, "reconciling");

        // Authoritative existence check; the local cache may still hold an
        // object that was just deleted.
        let Some(primary) = self.cluster.get_deployment(key).await? else {
            self.cluster.delete_service(key).await?;
            info!(key = %key, "primary absent, service removed");
            return Ok(());
        };

        // Desired state comes from the cached view; staleness is fine, the
        // next notification queues another pass. On a cache miss, the
        // authoritative object from the existence check serves instead.
        let cached = self
            .cache
            .get(&ObjectRef::new(&key.name).within(&key.namespace));
        let dep = cached.as_deref().unwrap_or(&primary);

        let selector = governing_labels(dep)
            .filter(|labels| !labels.is_empty())
            .cloned()
            .ok_or_else(|| {
                ControllerError::InvalidSpec(format!(
                    "Deployment {key} has no pod template labels to select on"
                ))
            })?;

        match self.cluster.get_service(key).await? {
            None => {
                self.cluster
                    .create_service(desired_service(key, selector))
                    .await?;
                info!(key = %key, "service created");
            }
            Some(existing) => {
                let current = existing.spec.as_ref().and_then(|s| s.selector.as_ref());
                if current == Some(&selector) {
                    debug!(key = %key, "service already converged");
                } else {
                    self.cluster.patch_service_selector(key, &selector).await?;
                    info!(key = %key, "service selector repaired");
                }
            }
        }
        Ok(())
    }
}
