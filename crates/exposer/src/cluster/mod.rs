//! Access to the Kubernetes objects the controller reads and writes.
//!
//! Strategies never talk to the API server directly; they go through the
//! [`Cluster`] trait so that the reconciliation logic can run against an
//! in-memory cluster in tests.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;

mod client;
#[cfg(test)]
pub(crate) mod fake;

pub use client::KubeCluster;

/// The operations the controller performs against the cluster.
///
/// Lookups return `Ok(None)` when the object does not exist. Deleting an
/// object that is already gone succeeds.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Applies a JSON patch to a service.
    async fn patch_service(
        &self,
        namespace: &str,
        name: &str,
        patch: json_patch::Patch,
    ) -> anyhow::Result<()>;

    /// Lists ingresses of one namespace, or of every namespace when `None`.
    async fn list_ingresses(&self, namespace: Option<&str>) -> anyhow::Result<Vec<Ingress>>;

    /// Fetches an ingress.
    async fn get_ingress(&self, namespace: &str, name: &str) -> anyhow::Result<Option<Ingress>>;

    /// Creates an ingress.
    async fn create_ingress(&self, namespace: &str, ingress: &Ingress) -> anyhow::Result<()>;

    /// Replaces an ingress. The resource version of `ingress` guards the write.
    async fn replace_ingress(&self, namespace: &str, ingress: &Ingress) -> anyhow::Result<()>;

    /// Deletes an ingress.
    async fn delete_ingress(&self, namespace: &str, name: &str) -> anyhow::Result<()>;

    /// Lists nodes matching the label selector.
    async fn list_nodes(&self, label_selector: &str) -> anyhow::Result<Vec<Node>>;

    /// Fetches a pod.
    async fn get_pod(&self, namespace: &str, name: &str) -> anyhow::Result<Option<Pod>>;

    /// Fetches a config map.
    async fn get_config_map(&self, namespace: &str, name: &str)
        -> anyhow::Result<Option<ConfigMap>>;

    /// Lists every config map of a namespace.
    async fn list_config_maps(&self, namespace: &str) -> anyhow::Result<Vec<ConfigMap>>;

    /// Replaces a config map. The resource version of `config_map` guards the write.
    async fn replace_config_map(&self, namespace: &str, config_map: &ConfigMap)
        -> anyhow::Result<()>;
}
