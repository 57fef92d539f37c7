use anyhow::Context;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::error::ErrorResponse;
use kube::Error;
use tracing::debug;

use super::Cluster;

/// [`Cluster`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeCluster {
    client: kube::Client,
}

impl KubeCluster {
    /// Wraps a client.
    pub fn new(client: kube::Client) -> Self {
        KubeCluster { client }
    }
}

// Maps a 404 to `None`.
fn found<T>(result: Result<T, Error>) -> Result<Option<T>, Error> {
    match result {
        Ok(object) => Ok(Some(object)),
        Err(Error::Api(ErrorResponse { code: 404, .. })) => Ok(None),
        Err(e) => Err(e),
    }
}

fn list_params(label_selector: &str) -> ListParams {
    if label_selector.is_empty() {
        ListParams::default()
    } else {
        ListParams::default().labels(label_selector)
    }
}

fn object_name(meta: &kube::api::ObjectMeta) -> anyhow::Result<&str> {
    meta.name
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("object has no name"))
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn patch_service(
        &self,
        namespace: &str,
        name: &str,
        patch: json_patch::Patch,
    ) -> anyhow::Result<()> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        debug!(%namespace, %name, ?patch, "Patching service");
        api.patch(name, &PatchParams::default(), &Patch::Json::<()>(patch))
            .await
            .with_context(|| format!("failed to send patch {}/{}", namespace, name))?;
        Ok(())
    }

    async fn list_ingresses(&self, namespace: Option<&str>) -> anyhow::Result<Vec<Ingress>> {
        let api: Api<Ingress> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let list = api
            .list(&ListParams::default())
            .await
            .context("failed to list ingresses")?;
        Ok(list.items)
    }

    async fn get_ingress(&self, namespace: &str, name: &str) -> anyhow::Result<Option<Ingress>> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        found(api.get(name).await)
            .with_context(|| format!("could not check for existing ingress {}/{}", namespace, name))
    }

    async fn create_ingress(&self, namespace: &str, ingress: &Ingress) -> anyhow::Result<()> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        let name = object_name(&ingress.metadata)?;
        api.create(&PostParams::default(), ingress)
            .await
            .with_context(|| format!("failed to create ingress {}/{}", namespace, name))?;
        Ok(())
    }

    async fn replace_ingress(&self, namespace: &str, ingress: &Ingress) -> anyhow::Result<()> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        let name = object_name(&ingress.metadata)?;
        api.replace(name, &PostParams::default(), ingress)
            .await
            .with_context(|| format!("failed to update ingress {}/{}", namespace, name))?;
        Ok(())
    }

    async fn delete_ingress(&self, namespace: &str, name: &str) -> anyhow::Result<()> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            // Already deleted, nothing left to clean up.
            Err(Error::Api(ErrorResponse { code: 404, .. })) => Ok(()),
            Err(e) => Err(e)
                .with_context(|| format!("failed to delete ingress {}/{}", namespace, name)),
        }
    }

    async fn list_nodes(&self, label_selector: &str) -> anyhow::Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let list = api
            .list(&list_params(label_selector))
            .await
            .context("failed to list nodes")?;
        Ok(list.items)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> anyhow::Result<Option<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        found(api.get(name).await)
            .with_context(|| format!("failed to get pod {}/{}", namespace, name))
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> anyhow::Result<Option<ConfigMap>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        found(api.get(name).await)
            .with_context(|| format!("failed to get config map {}/{}", namespace, name))
    }

    async fn list_config_maps(&self, namespace: &str) -> anyhow::Result<Vec<ConfigMap>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let list = api
            .list(&ListParams::default())
            .await
            .with_context(|| format!("failed to list config maps in {}", namespace))?;
        Ok(list.items)
    }

    async fn replace_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> anyhow::Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let name = object_name(&config_map.metadata)?;
        api.replace(name, &PostParams::default(), config_map)
            .await
            .with_context(|| format!("failed to update config map {}/{}", namespace, name))?;
        Ok(())
    }
}
