//! Propagation of exposed URLs into ConfigMaps.
//!
//! Two kinds of ConfigMaps receive values derived from the URL of a service:
//!
//! * the ConfigMap named like the service, whose own annotations name the data
//!   keys to fill with the URL, host, path and cluster address;
//! * any ConfigMap of the namespace annotated with
//!   `expose.service-key.config.fabric8.io/<service>` (or one of its variants),
//!   whose value lists the data keys to fill.
//!
//! A ConfigMap is only written when one of its values changed.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::annotations::{annotation, service_key, EXPOSE_URL_ANNOTATION};
use crate::cluster::Cluster;
use crate::config::Config;

/// Annotation naming the data key receiving the URL.
pub const URL_KEY_ANNOTATION: &str = "expose.config.fabric8.io/url-key";
/// Annotation naming the data key receiving the host, with its port if any.
pub const HOST_KEY_ANNOTATION: &str = "expose.config.fabric8.io/host-key";
/// Annotation naming the data key receiving the path of the URL.
pub const PATH_KEY_ANNOTATION: &str = "expose.config.fabric8.io/path-key";
/// Annotation naming the data key receiving the cluster IP.
pub const CLUSTER_IP_KEY_ANNOTATION: &str = "expose.config.fabric8.io/clusterip-key";
/// Annotation naming the data key receiving the cluster IP and port.
pub const CLUSTER_IP_PORT_KEY_ANNOTATION: &str = "expose.config.fabric8.io/clusterip-port-key";
/// Like [`CLUSTER_IP_PORT_KEY_ANNOTATION`], but only fills an empty value.
pub const CLUSTER_IP_PORT_IF_EMPTY_KEY_ANNOTATION: &str =
    "expose.config.fabric8.io/clusterip-port-if-empty-key";
/// Service annotation holding line rewrite rules for the service's ConfigMap.
pub const CONFIG_YAML_ANNOTATION: &str = "expose.config.fabric8.io/config-yaml";
/// Annotation naming the data keys receiving the URL scheme.
pub const URL_PROTOCOL_ANNOTATION: &str = "expose.config.fabric8.io/url-protocol";

const SERVICE_KEY_SUFFIX: &str = ".service-key.config.fabric8.io/";

// How the URL is written under each annotation family.
#[derive(Clone, Copy, Debug, PartialEq)]
enum UrlForm {
    Plain,
    Full,
    NoPath,
    NoProtocol,
    FullNoProtocol,
}

const URL_FORMS: [(&str, UrlForm); 5] = [
    ("expose", UrlForm::Plain),
    ("expose-full", UrlForm::Full),
    ("expose-no-path", UrlForm::NoPath),
    ("expose-no-protocol", UrlForm::NoProtocol),
    ("expose-full-no-protocol", UrlForm::FullNoProtocol),
];

/// A rule rewriting the lines of a ConfigMap value that start with `prefix`.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConfigYaml {
    /// The data key holding the text to rewrite.
    pub key: String,
    /// The value spliced in: `host` or `url`.
    pub expression: String,
    /// Lines starting with this are replaced.
    pub prefix: String,
    /// Appended after the value.
    pub suffix: String,
}

impl ConfigYaml {
    /// Rewrites the matching lines. Returns true when the data changed.
    ///
    /// Every line of the rewritten value ends with a newline.
    pub fn apply(&self, data: &mut BTreeMap<String, String>, host: &str, url: &str) -> bool {
        if self.key.is_empty() {
            warn!(rule = ?self, "Config yaml rule has no key");
            return false;
        }
        let value = match self.expression.as_str() {
            "host" => host,
            "url" => url,
            _ => "",
        };
        if value.is_empty() {
            warn!(rule = ?self, "Could not calculate expression of config yaml rule");
            return false;
        }
        let current = match data.get(&self.key).filter(|v| !v.is_empty()) {
            Some(c) => c,
            None => {
                warn!(key = %self.key, "ConfigMap has no value to apply config yaml rule to");
                return false;
            }
        };
        let rewritten: String = current
            .lines()
            .map(|line| {
                if line.starts_with(&self.prefix) {
                    format!("{}{}{}\n", self.prefix, value, self.suffix)
                } else {
                    format!("{}\n", line)
                }
            })
            .collect();
        if rewritten == *current {
            return false;
        }
        data.insert(self.key.clone(), rewritten);
        true
    }
}

/// Writes the URL of exposed services into the ConfigMaps asking for it.
pub struct RelatedResources {
    cluster: Arc<dyn Cluster>,
    http: bool,
}

impl RelatedResources {
    /// Creates the propagator.
    pub fn new(config: &Config, cluster: Arc<dyn Cluster>) -> Self {
        RelatedResources {
            cluster,
            http: config.http,
        }
    }

    /// Updates the service's own ConfigMap, then every ConfigMap of the
    /// namespace subscribed to the service's URL.
    #[tracing::instrument(level = "debug", skip(self, svc), fields(service = %service_key(svc)))]
    pub async fn update(&self, svc: &Service) -> anyhow::Result<()> {
        let own = self.update_service_config_map(svc).await;
        if let Some(url) = annotation(svc, EXPOSE_URL_ANNOTATION) {
            self.update_other_config_maps(svc, url).await?;
        }
        own
    }

    async fn update_service_config_map(&self, svc: &Service) -> anyhow::Result<()> {
        let namespace = svc.metadata.namespace.as_deref().unwrap_or_default();
        let name = svc.metadata.name.as_deref().unwrap_or_default();
        let mut cm = match self.cluster.get_config_map(namespace, name).await? {
            Some(cm) => cm,
            None => return Ok(()),
        };
        if fill_service_config_map(svc, &mut cm) {
            info!(%namespace, %name, "Updating ConfigMap of service");
            self.cluster.replace_config_map(namespace, &cm).await?;
        } else {
            debug!(%namespace, %name, "ConfigMap of service already up to date");
        }
        Ok(())
    }

    async fn update_other_config_maps(&self, svc: &Service, url: &str) -> anyhow::Result<()> {
        let namespace = svc.metadata.namespace.as_deref().unwrap_or_default();
        let name = svc.metadata.name.as_deref().unwrap_or_default();
        let protocol = if self.http { "http" } else { "https" };
        for mut cm in self.cluster.list_config_maps(namespace).await? {
            if fill_subscribed_config_map(&mut cm, name, url, protocol) {
                info!(
                    %namespace,
                    config_map = cm.metadata.name.as_deref().unwrap_or_default(),
                    service = %name,
                    "Updating ConfigMap with the URL of service"
                );
                self.cluster.replace_config_map(namespace, &cm).await?;
            }
        }
        Ok(())
    }
}

// Sets `data[key] = value` and reports whether that was a change.
fn set(data: &mut BTreeMap<String, String>, key: &str, value: &str) -> bool {
    if data.get(key).map(String::as_str) == Some(value) {
        return false;
    }
    data.insert(key.to_owned(), value.to_owned());
    true
}

fn first_value<'a>(key: &str, maps: &[Option<&'a BTreeMap<String, String>>]) -> Option<&'a str> {
    maps.iter()
        .flatten()
        .copied()
        .filter_map(|m| m.get(key))
        .map(String::as_str)
        .find(|v| !v.is_empty())
}

/// The target port of the first service port declaring one.
pub fn service_target_port(svc: &Service) -> Option<String> {
    svc.spec
        .iter()
        .flat_map(|s| s.ports.iter().flatten())
        .find_map(|p| match &p.target_port {
            Some(IntOrString::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(IntOrString::Int(i)) if *i > 0 => Some(i.to_string()),
            _ => None,
        })
}

/// The path of a URL, always starting with `/`.
pub fn url_path(url: &str) -> String {
    match Url::parse(url) {
        Ok(u) if !u.path().is_empty() => {
            let path = u.path();
            if path.starts_with('/') {
                path.to_owned()
            } else {
                format!("/{}", path)
            }
        }
        Ok(_) => "/".to_owned(),
        Err(error) => {
            warn!(%url, %error, "Could not parse exposed URL");
            "/".to_owned()
        }
    }
}

fn url_host(url: &str) -> Option<String> {
    match Url::parse(url) {
        Ok(u) => u.host_str().map(|host| match u.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_owned(),
        }),
        Err(error) => {
            warn!(%url, %error, "Could not parse exposed URL");
            None
        }
    }
}

fn strip_scheme(url: &str) -> &str {
    url.strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .unwrap_or(url)
}

fn url_form(url: &str, form: UrlForm) -> Option<String> {
    let base = url.trim_end_matches('/');
    match form {
        UrlForm::Plain => Some(base.to_owned()),
        UrlForm::Full => Some(format!("{}/", base)),
        UrlForm::NoProtocol => Some(strip_scheme(base).to_owned()),
        UrlForm::FullNoProtocol => Some(format!("{}/", strip_scheme(base))),
        UrlForm::NoPath => match Url::parse(url) {
            Ok(mut u) => {
                u.set_path("/");
                Some(u.to_string())
            }
            Err(error) => {
                warn!(%url, %error, "Could not parse exposed URL");
                None
            }
        },
    }
}

fn keys(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|k| !k.is_empty())
}

// Fills the ConfigMap named like the service. Returns true when it changed.
fn fill_service_config_map(svc: &Service, cm: &mut ConfigMap) -> bool {
    let cm_annotations = cm.metadata.annotations.clone().unwrap_or_default();
    let data = cm.data.get_or_insert_with(BTreeMap::new);
    let mut updated = false;

    let cluster_ip = svc
        .spec
        .as_ref()
        .and_then(|s| s.cluster_ip.as_deref())
        .filter(|ip| !ip.is_empty());
    if let Some(cluster_ip) = cluster_ip {
        let maps = [svc.metadata.annotations.as_ref(), Some(&cm_annotations)];
        if let Some(key) = first_value(CLUSTER_IP_KEY_ANNOTATION, &maps) {
            updated |= set(data, key, cluster_ip);
        }
        if let Some(port) = service_target_port(svc) {
            let address = format!("{}:{}", cluster_ip, port);
            if let Some(key) = first_value(CLUSTER_IP_PORT_KEY_ANNOTATION, &maps) {
                updated |= set(data, key, &address);
            }
            if let Some(key) = first_value(CLUSTER_IP_PORT_IF_EMPTY_KEY_ANNOTATION, &maps) {
                if data.get(key).map(String::is_empty).unwrap_or(true) {
                    updated |= set(data, key, &address);
                }
            }
        }
    }

    let url = match annotation(svc, EXPOSE_URL_ANNOTATION) {
        Some(url) => url,
        None => return updated,
    };
    let host = url_host(url).unwrap_or_default();
    let cm_key = |name: &str| cm_annotations.get(name).filter(|k| !k.is_empty());
    if let Some(key) = cm_key(URL_KEY_ANNOTATION) {
        updated |= set(data, key, url);
    }
    if let Some(key) = cm_key(HOST_KEY_ANNOTATION) {
        if !host.is_empty() {
            updated |= set(data, key, &host);
        }
    }
    if let Some(key) = cm_key(PATH_KEY_ANNOTATION) {
        updated |= set(data, key, &url_path(url));
    }

    if let Some(rules) = annotation(svc, CONFIG_YAML_ANNOTATION) {
        match serde_yaml::from_str::<Vec<ConfigYaml>>(rules) {
            Ok(rules) => {
                for rule in rules {
                    updated |= rule.apply(data, &host, url);
                }
            }
            Err(error) => warn!(
                service = %service_key(svc),
                %error,
                "Ignoring unparsable annotation {}", CONFIG_YAML_ANNOTATION
            ),
        }
    }
    updated
}

// Fills a ConfigMap subscribed to the URL of `service`. Returns true when it changed.
fn fill_subscribed_config_map(cm: &mut ConfigMap, service: &str, url: &str, protocol: &str) -> bool {
    let cm_annotations = match cm.metadata.annotations.clone() {
        Some(a) => a,
        None => return false,
    };
    let data = cm.data.get_or_insert_with(BTreeMap::new);
    let mut updated = false;

    for (family, form) in URL_FORMS.iter() {
        let annotation_key = format!("{}{}{}", family, SERVICE_KEY_SUFFIX, service);
        let list = match cm_annotations.get(&annotation_key) {
            Some(list) => list,
            None => continue,
        };
        let value = match url_form(url, *form) {
            Some(v) => v,
            None => continue,
        };
        for key in keys(list) {
            updated |= set(data, key, &value);
        }
    }
    if let Some(list) = cm_annotations.get(URL_PROTOCOL_ANNOTATION) {
        for key in keys(list) {
            updated |= set(data, key, protocol);
        }
    }
    updated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::FakeCluster;
    use crate::strategy::test_utils::{map, service, with_annotations};
    use kube::api::ObjectMeta;

    fn config_map(name: &str, annotations: &[(&str, &str)], data: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some("main".to_owned()),
                annotations: Some(map(annotations)),
                ..Default::default()
            },
            data: Some(map(data)),
            ..Default::default()
        }
    }

    fn exposed(url: &str) -> Service {
        let mut svc = with_annotations(service("svc", &[80]), &[(EXPOSE_URL_ANNOTATION, url)]);
        let spec = svc.spec.as_mut().unwrap();
        spec.cluster_ip = Some("10.0.0.7".to_owned());
        spec.ports.as_mut().unwrap()[0].target_port = Some(IntOrString::Int(8080));
        svc
    }

    #[test]
    fn test_url_forms() {
        let url = "https://svc.main.example.com/docs/";
        assert_eq!(url_form(url, UrlForm::Plain).unwrap(), "https://svc.main.example.com/docs");
        assert_eq!(url_form(url, UrlForm::Full).unwrap(), "https://svc.main.example.com/docs/");
        assert_eq!(url_form(url, UrlForm::NoPath).unwrap(), "https://svc.main.example.com/");
        assert_eq!(url_form(url, UrlForm::NoProtocol).unwrap(), "svc.main.example.com/docs");
        assert_eq!(
            url_form(url, UrlForm::FullNoProtocol).unwrap(),
            "svc.main.example.com/docs/"
        );
        assert_eq!(url_form("not a url", UrlForm::NoPath), None);
    }

    #[test]
    fn test_url_path_and_host() {
        assert_eq!(url_path("http://host"), "/");
        assert_eq!(url_path("http://host/a/b"), "/a/b");
        assert_eq!(url_path("::"), "/");
        assert_eq!(url_host("http://10.0.0.1:30080/x").as_deref(), Some("10.0.0.1:30080"));
        assert_eq!(url_host("https://svc.example.com").as_deref(), Some("svc.example.com"));
    }

    #[test]
    fn test_service_target_port() {
        let mut svc = service("svc", &[80, 81]);
        assert_eq!(service_target_port(&svc), None);
        svc.spec.as_mut().unwrap().ports.as_mut().unwrap()[1].target_port =
            Some(IntOrString::String("web".to_owned()));
        assert_eq!(service_target_port(&svc).as_deref(), Some("web"));
        svc.spec.as_mut().unwrap().ports.as_mut().unwrap()[0].target_port = Some(IntOrString::Int(8080));
        assert_eq!(service_target_port(&svc).as_deref(), Some("8080"));
    }

    #[test]
    fn test_config_yaml_rewrites_lines() {
        let rule = ConfigYaml {
            key: "app.yml".to_owned(),
            expression: "url".to_owned(),
            prefix: "  url: ".to_owned(),
            suffix: "/api".to_owned(),
        };
        let mut data = map(&[("app.yml", "server:\n  url: old\n  port: 80")]);
        assert!(rule.apply(&mut data, "host", "http://new"));
        assert_eq!(data["app.yml"], "server:\n  url: http://new/api\n  port: 80\n");
        assert!(!rule.apply(&mut data, "host", "http://new"));

        let unknown = ConfigYaml {
            expression: "apiserver".to_owned(),
            ..rule.clone()
        };
        assert!(!unknown.apply(&mut data, "host", "http://new"));

        let missing = ConfigYaml {
            key: "other".to_owned(),
            ..rule
        };
        assert!(!missing.apply(&mut data, "host", "http://new"));
    }

    #[tokio::test]
    async fn test_service_config_map() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.add_config_map(config_map(
            "svc",
            &[
                (URL_KEY_ANNOTATION, "url"),
                (HOST_KEY_ANNOTATION, "host"),
                (PATH_KEY_ANNOTATION, "path"),
                (CLUSTER_IP_KEY_ANNOTATION, "ip"),
                (CLUSTER_IP_PORT_IF_EMPTY_KEY_ANNOTATION, "kept"),
            ],
            &[("kept", "1.1.1.1:1"), ("config", "base: x\n")],
        ));
        let svc = with_annotations(
            exposed("http://svc.main.example.com/ui"),
            &[
                (CLUSTER_IP_PORT_KEY_ANNOTATION, "address"),
                (
                    CONFIG_YAML_ANNOTATION,
                    "- key: config\n  expression: host\n  prefix: 'base: '\n",
                ),
            ],
        );
        let related = RelatedResources::new(&Config::default(), cluster.clone());
        related.update(&svc).await.unwrap();

        let data = cluster.config_map("main", "svc").unwrap().data.unwrap();
        assert_eq!(
            data,
            map(&[
                ("url", "http://svc.main.example.com/ui"),
                ("host", "svc.main.example.com"),
                ("path", "/ui"),
                ("ip", "10.0.0.7"),
                ("address", "10.0.0.7:8080"),
                ("kept", "1.1.1.1:1"),
                ("config", "base: svc.main.example.com\n"),
            ])
        );
        assert_eq!(cluster.writes(), vec!["replace configmap main/svc"]);

        cluster.clear_writes();
        related.update(&svc).await.unwrap();
        assert!(cluster.writes().is_empty());
    }

    #[tokio::test]
    async fn test_unexposed_service_fills_cluster_address_only() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.add_config_map(config_map(
            "svc",
            &[(URL_KEY_ANNOTATION, "url"), (CLUSTER_IP_PORT_KEY_ANNOTATION, "address")],
            &[],
        ));
        cluster.add_config_map(config_map(
            "subscriber",
            &[("expose.service-key.config.fabric8.io/svc", "url")],
            &[],
        ));
        let mut svc = exposed("");
        svc.metadata.annotations = None;
        RelatedResources::new(&Config::default(), cluster.clone())
            .update(&svc)
            .await
            .unwrap();

        assert_eq!(
            cluster.config_map("main", "svc").unwrap().data,
            Some(map(&[("address", "10.0.0.7:8080")]))
        );
        assert_eq!(cluster.writes(), vec!["replace configmap main/svc"]);
    }

    #[tokio::test]
    async fn test_subscribed_config_maps() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.add_config_map(config_map(
            "subscriber",
            &[
                ("expose.service-key.config.fabric8.io/svc", "a, b"),
                ("expose-full.service-key.config.fabric8.io/svc", "full"),
                ("expose-no-path.service-key.config.fabric8.io/svc", "root"),
                ("expose-no-protocol.service-key.config.fabric8.io/svc", "bare"),
                ("expose-full-no-protocol.service-key.config.fabric8.io/svc", "bare-full"),
                (URL_PROTOCOL_ANNOTATION, "scheme"),
            ],
            &[("a", "stale"), ("unrelated", "x")],
        ));
        cluster.add_config_map(config_map(
            "other-service",
            &[("expose.service-key.config.fabric8.io/svc2", "url")],
            &[],
        ));
        let related = RelatedResources::new(
            &Config {
                http: true,
                ..Default::default()
            },
            cluster.clone(),
        );
        related.update(&exposed("http://svc.main.example.com/app/")).await.unwrap();

        assert_eq!(
            cluster.config_map("main", "subscriber").unwrap().data,
            Some(map(&[
                ("a", "http://svc.main.example.com/app"),
                ("b", "http://svc.main.example.com/app"),
                ("full", "http://svc.main.example.com/app/"),
                ("root", "http://svc.main.example.com/"),
                ("bare", "svc.main.example.com/app"),
                ("bare-full", "svc.main.example.com/app/"),
                ("scheme", "http"),
                ("unrelated", "x"),
            ]))
        );
        assert_eq!(cluster.writes(), vec!["replace configmap main/subscriber"]);

        cluster.clear_writes();
        related.update(&exposed("http://svc.main.example.com/app/")).await.unwrap();
        assert!(cluster.writes().is_empty());
    }
}
