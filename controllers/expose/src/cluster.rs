//! Authoritative cluster API access.
//!
//! This module abstracts the point reads and mutations the reconciler
//! issues against the cluster, behind a trait so unit tests can swap in a
//! mock. The kube-backed implementation folds the idempotency rules into
//! the call surface: deleting an absent Service and creating a Service
//! that already exists are both success, because delete notifications and
//! concurrent passes can race for the same transition.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};

use crate::error::ControllerError;
use crate::queue::ReconcileKey;

/// Cluster operations the reconciler depends on.
#[async_trait::async_trait]
pub trait ClusterApi: Send + Sync {
    /// Authoritative point read of a Deployment. `None` means not found,
    /// which the reconciler treats as a deletion signal.
    async fn get_deployment(&self, key: &ReconcileKey) -> Result<Option<Deployment>, ControllerError>;

    /// Point read of the managed Service. `None` means not found.
    async fn get_service(&self, key: &ReconcileKey) -> Result<Option<Service>, ControllerError>;

    /// Creates a Service. An AlreadyExists response is success: another
    /// pass won the race and a later pass repairs any selector drift.
    async fn create_service(&self, service: Service) -> Result<(), ControllerError>;

    /// Merge-patches the selector of an existing Service.
    async fn patch_service_selector(
        &self,
        key: &ReconcileKey,
        selector: &BTreeMap<String, String>,
    ) -> Result<(), ControllerError>;

    /// Deletes a Service. Deleting an absent Service is success.
    async fn delete_service(&self, key: &ReconcileKey) -> Result<(), ControllerError>;
}

/// True if the error is a Kubernetes API status with the given code.
fn is_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == code)
}

/// `ClusterApi` backed by a real `kube::Client`.
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    /// Wraps a Kubernetes client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait::async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get_deployment(&self, key: &ReconcileKey) -> Result<Option<Deployment>, ControllerError> {
        let dep = self.deployments(&key.namespace).get_opt(&key.name).await?;
        Ok(dep)
    }

    async fn get_service(&self, key: &ReconcileKey) -> Result<Option<Service>, ControllerError> {
        let svc = self.services(&key.namespace).get_opt(&key.name).await?;
        Ok(svc)
    }

    async fn create_service(&self, service: Service) -> Result<(), ControllerError> {
        let namespace = service.namespace().ok_or_else(|| {
            ControllerError::InvalidSpec("Service is missing a namespace".to_string())
        })?;
        match self
            .services(&namespace)
            .create(&PostParams::default(), &service)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_status(&e, 409) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_service_selector(
        &self,
        key: &ReconcileKey,
        selector: &BTreeMap<String, String>,
    ) -> Result<(), ControllerError> {
        let patch = serde_json::json!({
            "spec": { "selector": selector }
        });
        self.services(&key.namespace)
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn delete_service(&self, key: &ReconcileKey) -> Result<(), ControllerError> {
        match self
            .services(&key.namespace)
            .delete(&key.name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_status(&e, 404) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
