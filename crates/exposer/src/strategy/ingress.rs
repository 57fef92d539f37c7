//! Exposure through generated `networking.k8s.io/v1` ingresses.
//!
//! Every generated ingress is labelled `provider=fabric8`, annotated
//! `fabric8.io/generated-by=exposecontroller` and owned by exactly one service.
//! The strategy keeps an index from service key to the names of the ingresses
//! attributed to that service, so that an ingress left behind by a rename is
//! still found and deleted.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{auto, first_port, patch_service, ExposeStrategy, StrategyError, UrlTemplate};
use crate::annotations::{self, annotation, label, service_key, EXPOSE_PORT_ANNOTATION};
use crate::cluster::Cluster;
use crate::config::Config;

/// Path mode sharing the domain between services, routed on `/<namespace>/<app>/`.
pub const PATH_MODE_USE_PATH: &str = "path";

/// Label carried by every generated ingress.
pub const PROVIDER_LABEL: (&str, &str) = ("provider", "fabric8");
/// Annotation carried by every generated ingress.
pub const GENERATED_BY_ANNOTATION: (&str, &str) = ("fabric8.io/generated-by", "exposecontroller");

const INGRESS_NAME_ANNOTATION: &str = "fabric8.io/ingress.name";
pub(super) const HOST_NAME_ANNOTATION: &str = "fabric8.io/host.name";
const USE_INTERNAL_DOMAIN_ANNOTATION: &str = "fabric8.io/use.internal.domain";
pub(super) const INGRESS_PATH_ANNOTATION: &str = "fabric8.io/ingress.path";
pub(super) const PATH_MODE_ANNOTATION: &str = "fabric8.io/path.mode";
pub(super) const SKIP_TLS_ANNOTATION: &str = "jenkins-x.io/skip.tls";
const INGRESS_ANNOTATIONS_ANNOTATION: &str = "fabric8.io/ingress.annotations";
const RELEASE_LABEL: &str = "release";

const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";
const NGINX_INGRESS_CLASS_ANNOTATION: &str = "nginx.ingress.kubernetes.io/ingress.class";
const TLS_ACME_ANNOTATION: &str = "kubernetes.io/tls-acme";
const DEFAULT_PATH_MODE_CLASS: &str = "nginx";

/// Finds the service owning a generated ingress.
///
/// Returns the `namespace/name` of the owning service, and whether the ingress
/// must be deleted on sight. Ingresses without the `generated-by` annotation
/// yield `(None, false)`, whatever their labels. Annotated ingresses whose
/// owner references are not exactly one service yield `(None, true)`.
pub fn ingress_owner(ingress: &Ingress) -> (Option<String>, bool) {
    let meta = &ingress.metadata;
    let (key, value) = GENERATED_BY_ANNOTATION;
    let generated = meta
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
        == Some(value);
    if !generated {
        return (None, false);
    }
    match meta.owner_references.as_deref() {
        Some([owner]) if owner.api_version == "v1" && owner.kind == "Service" => (
            Some(format!(
                "{}/{}",
                meta.namespace.as_deref().unwrap_or_default(),
                owner.name
            )),
            false,
        ),
        _ => (None, true),
    }
}

// What `add` computes before touching the cluster.
struct Route {
    ingress: Ingress,
    name: String,
    url_host: String,
    url_path: String,
    tls: bool,
}

/// Exposes services through generated ingresses.
pub struct IngressStrategy {
    cluster: Arc<dyn Cluster>,
    namespace: Option<String>,
    domain: String,
    internal_domain: String,
    template: UrlTemplate,
    path_mode: String,
    tls_acme: bool,
    tls_secret_name: String,
    tls_use_wildcard: bool,
    ingress_class: String,
    name_prefix: String,
    owned: HashMap<String, Vec<String>>,
}

impl IngressStrategy {
    /// Creates the strategy, detecting the domain when none is configured.
    pub async fn new(config: &Config, cluster: Arc<dyn Cluster>) -> anyhow::Result<Self> {
        let domain = if config.domain.is_empty() {
            auto::detect_domain(cluster.as_ref()).await?
        } else {
            config.domain.clone()
        };
        info!(%domain, "Using domain");
        Ok(Self::with_domain(config, cluster, domain)?)
    }

    fn with_domain(
        config: &Config,
        cluster: Arc<dyn Cluster>,
        domain: String,
    ) -> Result<Self, StrategyError> {
        let template = UrlTemplate::parse(&config.url_template)?;
        Ok(IngressStrategy {
            cluster,
            namespace: Some(config.namespace.clone()).filter(|ns| !ns.is_empty()),
            domain,
            internal_domain: config.internal_domain.clone(),
            template,
            path_mode: config.path_mode.clone(),
            tls_acme: config.tls_acme,
            tls_secret_name: config.tls_secret_name.clone(),
            tls_use_wildcard: config.tls_use_wildcard,
            ingress_class: config.ingress_class.clone(),
            name_prefix: config.name_prefix.clone(),
            owned: HashMap::new(),
        })
    }

    fn tls_enabled(&self, svc: &Service) -> bool {
        annotation(svc, SKIP_TLS_ANNOTATION) != Some("true")
            && (!self.tls_secret_name.is_empty() || self.tls_acme)
    }

    fn route(&self, svc: &Service) -> anyhow::Result<Route> {
        let svc_name = svc.metadata.name.as_deref().unwrap_or_default();
        let namespace = svc.metadata.namespace.as_deref().unwrap_or_default();
        let app = app_name(svc);
        let name = if self.name_prefix.is_empty() {
            app.clone()
        } else {
            format!("{}-{}", self.name_prefix, app)
        };

        let domain = if annotation(svc, USE_INTERNAL_DOMAIN_ANNOTATION) == Some("true") {
            &self.internal_domain
        } else {
            &self.domain
        };
        let host_name = annotation(svc, HOST_NAME_ANNOTATION).unwrap_or(app.as_str());
        let mut host = self.template.render(host_name, namespace, domain);
        let tls_host = if self.tls_use_wildcard {
            format!("*.{}", domain)
        } else {
            host.clone()
        };

        let path_mode = annotation(svc, PATH_MODE_ANNOTATION).unwrap_or(self.path_mode.as_str());
        let mut path = annotation(svc, INGRESS_PATH_ANNOTATION)
            .unwrap_or_default()
            .to_owned();
        if path_mode == PATH_MODE_USE_PATH {
            let suffix = if path.is_empty() { "/" } else { path.as_str() };
            path = annotations::join_paths(&["/", namespace, app.as_str(), suffix]);
            host = domain.clone();
        } else if !path.is_empty() && !path.starts_with('/') {
            path.insert(0, '/');
        }

        let port = backend_port(svc)?;
        debug!(service = %service_key(svc), port, "Exposing port of service");

        let mut ingress_annotations = BTreeMap::new();
        if !self.ingress_class.is_empty() {
            ingress_annotations.insert(INGRESS_CLASS_ANNOTATION.to_owned(), self.ingress_class.clone());
            ingress_annotations.insert(
                NGINX_INGRESS_CLASS_ANNOTATION.to_owned(),
                self.ingress_class.clone(),
            );
        } else if path_mode == PATH_MODE_USE_PATH {
            ingress_annotations.insert(INGRESS_CLASS_ANNOTATION.to_owned(), DEFAULT_PATH_MODE_CLASS.to_owned());
            ingress_annotations.insert(
                NGINX_INGRESS_CLASS_ANNOTATION.to_owned(),
                DEFAULT_PATH_MODE_CLASS.to_owned(),
            );
        }
        if self.tls_acme {
            ingress_annotations.insert(TLS_ACME_ANNOTATION.to_owned(), "true".to_owned());
        }
        if let Some(extra) = annotation(svc, INGRESS_ANNOTATIONS_ANNOTATION) {
            match parse_extra_annotations(extra) {
                Ok(extra) => ingress_annotations.extend(extra),
                Err(error) => warn!(
                    service = %service_key(svc),
                    ?error,
                    "Ignoring unparsable annotation {}", INGRESS_ANNOTATIONS_ANNOTATION
                ),
            }
        }
        ingress_annotations.insert(
            GENERATED_BY_ANNOTATION.0.to_owned(),
            GENERATED_BY_ANNOTATION.1.to_owned(),
        );

        let tls = self.tls_enabled(svc);
        let mut http_path = json!({
            "pathType": "ImplementationSpecific",
            "backend": {
                "service": {
                    "name": svc_name,
                    "port": {"number": port},
                },
            },
        });
        if !path.is_empty() {
            http_path["path"] = Value::String(path.clone());
        }
        let mut spec = json!({
            "rules": [{
                "host": host,
                "http": {"paths": [http_path]},
            }],
        });
        if tls {
            let secret = if self.tls_secret_name.is_empty() {
                format!("tls-{}", app)
            } else {
                self.tls_secret_name.clone()
            };
            spec["tls"] = json!([{"hosts": [tls_host], "secretName": secret}]);
        }

        let ingress: Ingress = serde_json::from_value(json!({
            "apiVersion": "networking.k8s.io/v1",
            "kind": "Ingress",
            "metadata": {
                "name": name,
                "namespace": namespace,
                "labels": {PROVIDER_LABEL.0: PROVIDER_LABEL.1},
                "annotations": ingress_annotations,
                "ownerReferences": [{
                    "apiVersion": "v1",
                    "kind": "Service",
                    "name": svc_name,
                    "uid": svc.metadata.uid.as_deref().unwrap_or_default(),
                }],
            },
            "spec": spec,
        }))?;

        Ok(Route {
            ingress,
            name,
            url_host: host,
            url_path: path,
            tls,
        })
    }

    // Deletes the ingress if it is still attributed to `key`, or corrupt.
    async fn delete_owned(&self, namespace: &str, name: &str, key: &str) -> anyhow::Result<()> {
        let existing = match self.cluster.get_ingress(namespace, name).await? {
            Some(i) => i,
            None => return Ok(()),
        };
        match ingress_owner(&existing) {
            (_, true) => {
                info!(%namespace, %name, "Deleting ingress with invalid owner");
            }
            (Some(owner), false) if owner == key => {
                info!(%namespace, %name, service = %key, "Deleting ingress of service");
            }
            _ => {
                debug!(%namespace, %name, service = %key, "Ingress is no longer owned by service, leaving it");
                return Ok(());
            }
        }
        self.cluster.delete_ingress(namespace, name).await
    }

    async fn delete_attributed(&mut self, svc: &Service) -> anyhow::Result<()> {
        let key = service_key(svc);
        let namespace = svc.metadata.namespace.as_deref().unwrap_or_default();
        if let Some(names) = self.owned.get(&key) {
            for name in names {
                self.delete_owned(namespace, name, &key).await?;
            }
        }
        self.owned.remove(&key);
        Ok(())
    }
}

/// The application name of a service: its ingress name override, else its
/// name without the release prefix.
pub(super) fn app_name(svc: &Service) -> String {
    if let Some(name) = annotation(svc, INGRESS_NAME_ANNOTATION) {
        return name.to_owned();
    }
    let name = svc.metadata.name.clone().unwrap_or_default();
    match label(svc, RELEASE_LABEL) {
        Some(release) => name.replacen(&format!("{}-", release), "", 1),
        None => name,
    }
}

// The exposed port override when it is valid and declared, else the first port.
pub(super) fn backend_port(svc: &Service) -> Result<i32, StrategyError> {
    let (first, _) = first_port(svc).ok_or_else(|| StrategyError::NoPorts(service_key(svc)))?;
    let requested = match annotation(svc, EXPOSE_PORT_ANNOTATION) {
        Some(p) => p,
        None => return Ok(first),
    };
    let port = match requested.parse::<i32>() {
        Ok(port) => port,
        Err(error) => {
            warn!(
                service = %service_key(svc),
                port = requested,
                %error,
                "Port of annotation {} is not a valid number", EXPOSE_PORT_ANNOTATION
            );
            return Ok(first);
        }
    };
    let declared = svc
        .spec
        .iter()
        .flat_map(|s| s.ports.iter().flatten())
        .any(|p| p.port == port);
    if declared {
        Ok(port)
    } else {
        warn!(
            service = %service_key(svc),
            port,
            "Port of annotation {} is not available in the ports of the service", EXPOSE_PORT_ANNOTATION
        );
        Ok(first)
    }
}

fn parse_extra_annotations(yaml: &str) -> anyhow::Result<BTreeMap<String, String>> {
    let parsed: BTreeMap<String, serde_yaml::Value> = serde_yaml::from_str(yaml)?;
    let mut extra = BTreeMap::new();
    for (key, value) in parsed {
        let value = match value {
            serde_yaml::Value::String(s) => s,
            serde_yaml::Value::Bool(b) => b.to_string(),
            serde_yaml::Value::Number(n) => n.to_string(),
            serde_yaml::Value::Null => String::new(),
            other => anyhow::bail!("annotation {} is not a scalar: {:?}", key, other),
        };
        extra.insert(key, value);
    }
    Ok(extra)
}

fn same_ingress(a: &Ingress, b: &Ingress) -> bool {
    a.metadata.labels == b.metadata.labels
        && a.metadata.annotations == b.metadata.annotations
        && a.metadata.owner_references == b.metadata.owner_references
        && a.spec == b.spec
}

#[async_trait]
impl ExposeStrategy for IngressStrategy {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn sync(&mut self) -> anyhow::Result<()> {
        let ingresses = self.cluster.list_ingresses(self.namespace.as_deref()).await?;

        let mut owned: HashMap<String, Vec<String>> = HashMap::new();
        for ingress in ingresses {
            let namespace = ingress.metadata.namespace.clone().unwrap_or_default();
            let name = ingress.metadata.name.clone().unwrap_or_default();
            match ingress_owner(&ingress) {
                (_, true) => {
                    info!(%namespace, %name, "Deleting ingress with invalid owner");
                    self.cluster.delete_ingress(&namespace, &name).await?;
                }
                (Some(owner), false) => owned.entry(owner).or_default().push(name),
                (None, false) => (),
            }
        }
        debug!(services = owned.len(), "Rebuilt ingress ownership index");
        self.owned = owned;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, svc), fields(service = %service_key(svc)))]
    async fn add(&mut self, svc: &Service) -> anyhow::Result<()> {
        let key = service_key(svc);
        let namespace = svc.metadata.namespace.clone().unwrap_or_default();
        let Route {
            mut ingress,
            name,
            url_host,
            url_path,
            tls,
        } = self.route(svc)?;

        if let Some(previous) = self.owned.get(&key) {
            for old in previous.iter().filter(|n| **n != name) {
                self.delete_owned(&namespace, old, &key).await?;
            }
        }

        match self.cluster.get_ingress(&namespace, &name).await? {
            Some(existing) if same_ingress(&existing, &ingress) => {
                debug!(%namespace, %name, "Ingress already up to date");
            }
            Some(existing) => {
                if let (Some(owner), false) = ingress_owner(&existing) {
                    if owner != key {
                        info!(%namespace, %name, previous_owner = %owner, "Taking over ingress");
                    }
                }
                ingress.metadata.resource_version = existing.metadata.resource_version;
                info!(%namespace, %name, "Updating ingress");
                self.cluster.replace_ingress(&namespace, &ingress).await?;
            }
            None => {
                info!(%namespace, %name, "Creating ingress");
                self.cluster.create_ingress(&namespace, &ingress).await?;
            }
        }
        self.owned.insert(key, vec![name]);

        let mut exposed = svc.clone();
        annotations::add_exposure_annotation(&mut exposed, &url_host, &url_path, tls);
        patch_service(self.cluster.as_ref(), svc, &exposed).await
    }

    #[tracing::instrument(level = "debug", skip(self, svc), fields(service = %service_key(svc)))]
    async fn clean(&mut self, svc: &Service) -> anyhow::Result<()> {
        self.delete_attributed(svc).await?;

        let mut cleaned = svc.clone();
        if annotations::remove_exposure_annotation(&mut cleaned) {
            patch_service(self.cluster.as_ref(), svc, &cleaned).await?;
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, svc), fields(service = %service_key(svc)))]
    async fn delete(&mut self, svc: &Service) -> anyhow::Result<()> {
        self.delete_attributed(svc).await
    }
}
