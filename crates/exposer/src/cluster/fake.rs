//! In-memory cluster used by the unit tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::ObjectMeta;

use super::Cluster;

type Key = (String, String);

#[derive(Default)]
struct State {
    services: BTreeMap<Key, Service>,
    ingresses: BTreeMap<Key, Ingress>,
    nodes: Vec<Node>,
    pods: BTreeMap<Key, Pod>,
    config_maps: BTreeMap<Key, ConfigMap>,
    writes: Vec<String>,
    fail_writes: bool,
    version: u64,
}

impl State {
    fn write(&mut self, what: String) -> anyhow::Result<String> {
        if self.fail_writes {
            anyhow::bail!("the server rejected {}", what);
        }
        self.writes.push(what);
        self.version += 1;
        Ok(self.version.to_string())
    }
}

#[derive(Default)]
pub(crate) struct FakeCluster {
    state: Mutex<State>,
}

fn key(meta: &ObjectMeta) -> Key {
    (
        meta.namespace.clone().unwrap_or_default(),
        meta.name.clone().unwrap_or_default(),
    )
}

// Supports equality selectors (`a=b,c=d`) and existence selectors (`a`).
fn matches(selector: &str, labels: Option<&BTreeMap<String, String>>) -> bool {
    selector
        .split(',')
        .filter(|s| !s.is_empty())
        .all(|requirement| {
            let labels = match labels {
                Some(l) => l,
                None => return false,
            };
            match requirement.split_once('=') {
                Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
                None => labels.contains_key(requirement),
            }
        })
}

impl FakeCluster {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_service(&self, svc: Service) {
        let mut state = self.state.lock().unwrap();
        state.services.insert(key(&svc.metadata), svc);
    }

    pub(crate) fn add_ingress(&self, mut ingress: Ingress) {
        let mut state = self.state.lock().unwrap();
        state.version += 1;
        ingress.metadata.resource_version = Some(state.version.to_string());
        state.ingresses.insert(key(&ingress.metadata), ingress);
    }

    pub(crate) fn add_node(&self, node: Node) {
        self.state.lock().unwrap().nodes.push(node);
    }

    pub(crate) fn add_pod(&self, pod: Pod) {
        let mut state = self.state.lock().unwrap();
        state.pods.insert(key(&pod.metadata), pod);
    }

    pub(crate) fn add_config_map(&self, config_map: ConfigMap) {
        let mut state = self.state.lock().unwrap();
        state.config_maps.insert(key(&config_map.metadata), config_map);
    }

    pub(crate) fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        let state = self.state.lock().unwrap();
        state
            .services
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned()
    }

    pub(crate) fn ingress(&self, namespace: &str, name: &str) -> Option<Ingress> {
        let state = self.state.lock().unwrap();
        state
            .ingresses
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned()
    }

    pub(crate) fn ingress_names(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .ingresses
            .keys()
            .map(|(ns, name)| format!("{}/{}", ns, name))
            .collect()
    }

    pub(crate) fn config_map(&self, namespace: &str, name: &str) -> Option<ConfigMap> {
        let state = self.state.lock().unwrap();
        state
            .config_maps
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned()
    }

    /// Every write performed so far, as `verb kind ns/name`.
    pub(crate) fn writes(&self) -> Vec<String> {
        self.state.lock().unwrap().writes.clone()
    }

    pub(crate) fn clear_writes(&self) {
        self.state.lock().unwrap().writes.clear();
    }

    pub(crate) fn set_fail_writes(&self, fail: bool) {
        self.state.lock().unwrap().fail_writes = fail;
    }
}

#[async_trait]
impl Cluster for FakeCluster {
    async fn patch_service(
        &self,
        namespace: &str,
        name: &str,
        patch: json_patch::Patch,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        let k = (namespace.to_owned(), name.to_owned());
        let svc = state
            .services
            .get(&k)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("service {}/{} not found", namespace, name))?;
        let mut doc = serde_json::to_value(&svc)?;
        json_patch::patch(&mut doc, &patch)?;
        let mut patched: Service = serde_json::from_value(doc)?;
        let version = state.write(format!("patch service {}/{}", namespace, name))?;
        patched.metadata.resource_version = Some(version);
        state.services.insert(k, patched);
        Ok(())
    }

    async fn list_ingresses(&self, namespace: Option<&str>) -> anyhow::Result<Vec<Ingress>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .ingresses
            .iter()
            .filter(|((ns, _), _)| namespace.map(|n| n == ns).unwrap_or(true))
            .map(|(_, i)| i.clone())
            .collect())
    }

    async fn get_ingress(&self, namespace: &str, name: &str) -> anyhow::Result<Option<Ingress>> {
        Ok(self.ingress(namespace, name))
    }

    async fn create_ingress(&self, namespace: &str, ingress: &Ingress) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        let mut ingress = ingress.clone();
        ingress.metadata.namespace = Some(namespace.to_owned());
        let k = key(&ingress.metadata);
        if state.ingresses.contains_key(&k) {
            anyhow::bail!("ingress {}/{} already exists", k.0, k.1);
        }
        let version = state.write(format!("create ingress {}/{}", k.0, k.1))?;
        ingress.metadata.resource_version = Some(version);
        state.ingresses.insert(k, ingress);
        Ok(())
    }

    async fn replace_ingress(&self, namespace: &str, ingress: &Ingress) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        let mut ingress = ingress.clone();
        ingress.metadata.namespace = Some(namespace.to_owned());
        let k = key(&ingress.metadata);
        let current = state
            .ingresses
            .get(&k)
            .ok_or_else(|| anyhow::anyhow!("ingress {}/{} not found", k.0, k.1))?;
        if current.metadata.resource_version != ingress.metadata.resource_version {
            anyhow::bail!("conflict updating ingress {}/{}", k.0, k.1);
        }
        let version = state.write(format!("replace ingress {}/{}", k.0, k.1))?;
        ingress.metadata.resource_version = Some(version);
        state.ingresses.insert(k, ingress);
        Ok(())
    }

    async fn delete_ingress(&self, namespace: &str, name: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        let k = (namespace.to_owned(), name.to_owned());
        if state.ingresses.contains_key(&k) {
            state.write(format!("delete ingress {}/{}", namespace, name))?;
            state.ingresses.remove(&k);
        }
        Ok(())
    }

    async fn list_nodes(&self, label_selector: &str) -> anyhow::Result<Vec<Node>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .nodes
            .iter()
            .filter(|n| matches(label_selector, n.metadata.labels.as_ref()))
            .cloned()
            .collect())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> anyhow::Result<Option<Pod>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .pods
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned())
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> anyhow::Result<Option<ConfigMap>> {
        Ok(self.config_map(namespace, name))
    }

    async fn list_config_maps(&self, namespace: &str) -> anyhow::Result<Vec<ConfigMap>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .config_maps
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, cm)| cm.clone())
            .collect())
    }

    async fn replace_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        let mut config_map = config_map.clone();
        config_map.metadata.namespace = Some(namespace.to_owned());
        let k = key(&config_map.metadata);
        let version = state.write(format!("replace configmap {}/{}", k.0, k.1))?;
        config_map.metadata.resource_version = Some(version);
        state.config_maps.insert(k, config_map);
        Ok(())
    }
}
