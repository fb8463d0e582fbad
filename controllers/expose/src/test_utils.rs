//! Test utilities for unit testing the pipeline.
//!
//! This module provides fixture constructors and an in-memory
//! `MockClusterApi` that stands in for the real cluster, with scripted
//! failure injection for retry tests.

#[cfg(test)]
use std::collections::{BTreeMap, HashMap};
#[cfg(test)]
use std::sync::atomic::{AtomicUsize, Ordering};
#[cfg(test)]
use std::sync::{Mutex, MutexGuard, PoisonError};

#[cfg(test)]
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
#[cfg(test)]
use k8s_openapi::api::core::v1::{PodTemplateSpec, Service};
#[cfg(test)]
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
#[cfg(test)]
use kube_runtime::reflector::Store;
#[cfg(test)]
use kube_runtime::watcher;

#[cfg(test)]
use crate::cluster::ClusterApi;
#[cfg(test)]
use crate::error::ControllerError;
#[cfg(test)]
use crate::queue::ReconcileKey;

/// Helper to create a test Deployment with the given pod template labels.
#[cfg(test)]
pub fn test_deployment(name: &str, namespace: &str, labels: BTreeMap<String, String>) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: None,
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// Helper to create a reconcile key.
#[cfg(test)]
pub fn test_key(namespace: &str, name: &str) -> ReconcileKey {
    ReconcileKey::new(namespace, name)
}

/// Builds a reflector store pre-populated with the given Deployments, as
/// the change feed would after its initial listing.
#[cfg(test)]
pub fn seeded_store(deployments: Vec<Deployment>) -> Store<Deployment> {
    let (reader, mut writer) = kube_runtime::reflector::store();
    for dep in deployments {
        writer.apply_watcher_event(&watcher::Event::Apply(dep));
    }
    reader
}

/// A transient cluster failure (HTTP 503) for scripting retry scenarios.
#[cfg(test)]
pub fn transient_error() -> ControllerError {
    ControllerError::Kube(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: "the server is currently unable to handle the request".to_string(),
        reason: "ServiceUnavailable".to_string(),
        code: 503,
    }))
}

/// In-memory `ClusterApi` with call counting and scripted create failures.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MockClusterApi {
    deployments: Mutex<HashMap<(String, String), Deployment>>,
    services: Mutex<HashMap<(String, String), Service>>,
    /// Remaining number of create calls that fail transiently
    failing_creates: Mutex<usize>,
    create_calls: AtomicUsize,
    patch_calls: AtomicUsize,
    delete_calls: AtomicUsize,
}

#[cfg(test)]
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
impl MockClusterApi {
    /// Registers a Deployment as existing in the cluster.
    pub fn put_deployment(&self, dep: Deployment) {
        let ns = dep.metadata.namespace.clone().unwrap_or_default();
        let name = dep.metadata.name.clone().unwrap_or_default();
        lock(&self.deployments).insert((ns, name), dep);
    }

    /// Removes a Deployment, simulating its deletion.
    pub fn remove_deployment(&self, namespace: &str, name: &str) {
        lock(&self.deployments).remove(&(namespace.to_string(), name.to_string()));
    }

    /// Registers a pre-existing Service.
    pub fn put_service(&self, svc: Service) {
        let ns = svc.metadata.namespace.clone().unwrap_or_default();
        let name = svc.metadata.name.clone().unwrap_or_default();
        lock(&self.services).insert((ns, name), svc);
    }

    /// Current Service state, if any.
    pub fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        lock(&self.services)
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Makes the next `n` create calls fail with a transient error.
    pub fn fail_creates(&self, n: usize) {
        *lock(&self.failing_creates) = n;
    }

    /// Number of create calls issued (including failed ones).
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Number of selector patch calls issued.
    pub fn patch_calls(&self) -> usize {
        self.patch_calls.load(Ordering::SeqCst)
    }

    /// Number of delete calls issued.
    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
#[async_trait::async_trait]
impl ClusterApi for MockClusterApi {
    async fn get_deployment(&self, key: &ReconcileKey) -> Result<Option<Deployment>, ControllerError> {
        Ok(lock(&self.deployments)
            .get(&(key.namespace.clone(), key.name.clone()))
            .cloned())
    }

    async fn get_service(&self, key: &ReconcileKey) -> Result<Option<Service>, ControllerError> {
        Ok(self.service(&key.namespace, &key.name))
    }

    async fn create_service(&self, service: Service) -> Result<(), ControllerError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut failing = lock(&self.failing_creates);
            if *failing > 0 {
                *failing -= 1;
                return Err(transient_error());
            }
        }
        self.put_service(service);
        Ok(())
    }

    async fn patch_service_selector(
        &self,
        key: &ReconcileKey,
        selector: &BTreeMap<String, String>,
    ) -> Result<(), ControllerError> {
        self.patch_calls.fetch_add(1, Ordering::SeqCst);
        let mut services = lock(&self.services);
        if let Some(svc) = services.get_mut(&(key.namespace.clone(), key.name.clone())) {
            if let Some(spec) = svc.spec.as_mut() {
                spec.selector = Some(selector.clone());
            }
        }
        Ok(())
    }

    async fn delete_service(&self, key: &ReconcileKey) -> Result<(), ControllerError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        // Deleting an absent Service is a no-op, as in the real impl
        lock(&self.services).remove(&(key.namespace.clone(), key.name.clone()));
        Ok(())
    }
}
