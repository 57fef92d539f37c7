use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use serde::Serialize;
use tracing::{debug, info};

use super::ingress::{
    app_name, backend_port, HOST_NAME_ANNOTATION, INGRESS_PATH_ANNOTATION, PATH_MODE_ANNOTATION,
    PATH_MODE_USE_PATH, SKIP_TLS_ANNOTATION,
};
use super::{auto, patch_service, ExposeStrategy, StrategyError, UrlTemplate};
use crate::annotations::{self, annotation, service_key};
use crate::cluster::Cluster;
use crate::config::Config;

/// Annotation read by the Ambassador API gateway.
pub const AMBASSADOR_CONFIG_ANNOTATION: &str = "getambassador.io/config";

const AMBASSADOR_API_VERSION: &str = "ambassador/v1";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Mapping<'a> {
    api_version: &'a str,
    kind: &'a str,
    host: &'a str,
    name: String,
    service: String,
    prefix: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TlsModule<'a> {
    api_version: &'a str,
    kind: &'a str,
    name: &'a str,
    config: TlsModuleConfig<'a>,
}

#[derive(Serialize)]
struct TlsModuleConfig<'a> {
    server: TlsServer<'a>,
}

#[derive(Serialize)]
struct TlsServer<'a> {
    enabled: bool,
    secret: &'a str,
}

/// Exposes services by annotating them with Ambassador mappings.
pub struct AmbassadorStrategy {
    cluster: Arc<dyn Cluster>,
    domain: String,
    template: UrlTemplate,
    path_mode: String,
    tls_acme: bool,
    tls_secret_name: String,
    name_prefix: String,
}

impl AmbassadorStrategy {
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
        Ok(AmbassadorStrategy {
            cluster,
            domain,
            template: UrlTemplate::parse(&config.url_template)?,
            path_mode: config.path_mode.clone(),
            tls_acme: config.tls_acme,
            tls_secret_name: config.tls_secret_name.clone(),
            name_prefix: config.name_prefix.clone(),
        })
    }

    fn app_name(&self, svc: &Service) -> String {
        let app = app_name(svc);
        if self.name_prefix.is_empty() {
            return app;
        }
        match app.strip_prefix(&format!("{}-", self.name_prefix)) {
            Some(stripped) => stripped.to_owned(),
            None => app,
        }
    }

    // The TLS secret for the service, `None` when TLS is off for it.
    fn tls_secret(&self, svc: &Service, app: &str) -> Option<String> {
        if annotation(svc, SKIP_TLS_ANNOTATION) == Some("true") {
            return None;
        }
        if !self.tls_secret_name.is_empty() {
            Some(self.tls_secret_name.clone())
        } else if self.tls_acme {
            Some(format!("tls-{}", app))
        } else {
            None
        }
    }
}

#[async_trait]
impl ExposeStrategy for AmbassadorStrategy {
    #[tracing::instrument(level = "debug", skip(self, svc), fields(service = %service_key(svc)))]
    async fn add(&mut self, svc: &Service) -> anyhow::Result<()> {
        let svc_name = svc.metadata.name.as_deref().unwrap_or_default();
        let namespace = svc.metadata.namespace.as_deref().unwrap_or_default();
        let app = self.app_name(svc);

        let host_name = annotation(svc, HOST_NAME_ANNOTATION).unwrap_or(app.as_str());
        let mut host = self.template.render(host_name, namespace, &self.domain);
        let mut path = annotation(svc, INGRESS_PATH_ANNOTATION)
            .unwrap_or_default()
            .to_owned();
        let path_mode = annotation(svc, PATH_MODE_ANNOTATION).unwrap_or(self.path_mode.as_str());
        if path_mode == PATH_MODE_USE_PATH {
            let suffix = if path.is_empty() { "/" } else { path.as_str() };
            path = annotations::join_paths(&["/", namespace, app.as_str(), suffix]);
            host = self.domain.clone();
        } else if !path.is_empty() && !path.starts_with('/') {
            path.insert(0, '/');
        }

        let port = backend_port(svc)?;
        info!(service = %service_key(svc), port, "Exposing port of service");

        let mapping = Mapping {
            api_version: AMBASSADOR_API_VERSION,
            kind: "Mapping",
            host: &host,
            name: format!("{}_{}_mapping", app, namespace),
            service: format!("{}.{}:{}", svc_name, namespace, port),
            prefix: if path.is_empty() { "/" } else { path.as_str() },
        };
        let mut documents = vec![yaml_document(&mapping)?];
        let secret = self.tls_secret(svc, &app);
        if let Some(secret) = secret.as_deref() {
            let module = TlsModule {
                api_version: AMBASSADOR_API_VERSION,
                kind: "Module",
                name: "tls",
                config: TlsModuleConfig {
                    server: TlsServer {
                        enabled: true,
                        secret,
                    },
                },
            };
            documents.push(yaml_document(&module)?);
        }

        let mut exposed = svc.clone();
        exposed
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(AMBASSADOR_CONFIG_ANNOTATION.to_owned(), documents.join("---\n"));
        annotations::add_exposure_annotation(&mut exposed, &host, &path, secret.is_some());
        patch_service(self.cluster.as_ref(), svc, &exposed).await
    }

    async fn clean(&mut self, svc: &Service) -> anyhow::Result<()> {
        if annotation(svc, annotations::EXPOSE_URL_ANNOTATION).is_none() {
            debug!(service = %service_key(svc), "Service was not exposed, nothing to clean");
            return Ok(());
        }
        let mut cleaned = svc.clone();
        annotations::remove_exposure_annotation(&mut cleaned);
        if let Some(a) = cleaned.metadata.annotations.as_mut() {
            a.remove(AMBASSADOR_CONFIG_ANNOTATION);
        }
        patch_service(self.cluster.as_ref(), svc, &cleaned).await
    }

    async fn delete(&mut self, _svc: &Service) -> anyhow::Result<()> {
        Ok(())
    }
}

// One YAML document, without the leading document marker.
fn yaml_document<T: Serialize>(value: &T) -> anyhow::Result<String> {
    let yaml = serde_yaml::to_string(value)?;
    let yaml = yaml.strip_prefix("---\n").unwrap_or(&yaml);
    if yaml.ends_with('\n') {
        Ok(yaml.to_owned())
    } else {
        Ok(format!("{}\n", yaml))
    }
}
