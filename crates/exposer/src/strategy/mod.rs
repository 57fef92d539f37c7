//! Strategies exposing a single service outside of the cluster.
//!
//! A strategy is selected once at startup by [`new_strategy`] and then driven
//! by the controller, one event at a time. Because calls never overlap, the
//! caches a strategy keeps are plain owned maps mutated through `&mut self`.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use thiserror::Error;
use tracing::{debug, info};

use crate::annotations;
use crate::cluster::Cluster;
use crate::config::Config;

mod ambassador;
pub mod auto;
pub mod ingress;
mod load_balancer;
mod node_port;
mod template;

pub use ambassador::AmbassadorStrategy;
pub use ingress::IngressStrategy;
pub use load_balancer::LoadBalancerStrategy;
pub use node_port::NodePortStrategy;
pub use template::UrlTemplate;

/// The life-cycle every exposure strategy implements.
///
/// None of the operations retry. A failed call is reported to the caller and
/// the next event for the same service brings a fresh attempt, so every
/// operation must be safe to repeat.
///
/// **Note**: this trait is defined using [async-trait](https://crates.io/crates/async-trait).
#[async_trait]
pub trait ExposeStrategy: Send {
    /// Rebuilds the caches of the strategy from the objects in the cluster.
    async fn sync(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// True when no asynchronous work requested by the strategy is outstanding.
    fn has_synced(&self) -> bool {
        true
    }

    /// Ensures the service is exposed and its URL annotation is current.
    ///
    /// Nothing is written when the cluster already matches.
    async fn add(&mut self, svc: &Service) -> anyhow::Result<()>;

    /// Undoes the exposure of a service that is still present but no longer marked.
    async fn clean(&mut self, svc: &Service) -> anyhow::Result<()>;

    /// Releases whatever the strategy still holds for a deleted service.
    async fn delete(&mut self, svc: &Service) -> anyhow::Result<()>;
}

/// Errors classifying why a strategy refused to do its job.
#[derive(Error, Debug, PartialEq)]
pub enum StrategyError {
    /// The configured strategy name is not known.
    #[error("unknown expose strategy '{0}', must be one of Ambassador, Ingress, LoadBalancer, NodePort")]
    UnknownStrategy(String),
    /// No external domain was configured and none could be detected.
    #[error("no known automatic ways to get an external ip to use with nip.io, please configure the domain")]
    DomainDetection,
    /// No node address was configured and none could be detected.
    #[error("could not find the node IP: {0}")]
    NodeIpDetection(String),
    /// The URL template is not usable.
    #[error("invalid url template '{template}': {reason}")]
    InvalidUrlTemplate {
        /// The template as configured
        template: String,
        /// What is wrong with it
        reason: String,
    },
    /// The service declares no port to expose.
    #[error("service {0} has no ports")]
    NoPorts(String),
    /// The service declares more than one port, which a node port URL cannot represent.
    #[error("service {0} has more than one port, cannot expose it through a node port")]
    MultiplePorts(String),
}

/// Builds the strategy named by the configuration.
///
/// An empty name picks one from the shape of the cluster with
/// [`auto::detect_strategy`].
pub async fn new_strategy(
    config: &Config,
    cluster: Arc<dyn Cluster>,
) -> anyhow::Result<Box<dyn ExposeStrategy>> {
    let name = if config.exposer.is_empty() {
        let detected = auto::detect_strategy(cluster.as_ref()).await?;
        info!(strategy = detected, "Using automatically detected exposer strategy");
        detected.to_owned()
    } else {
        config.exposer.to_lowercase()
    };

    let strategy: Box<dyn ExposeStrategy> = match name.as_str() {
        auto::AMBASSADOR => Box::new(AmbassadorStrategy::new(config, cluster).await?),
        auto::INGRESS => Box::new(IngressStrategy::new(config, cluster).await?),
        auto::LOAD_BALANCER => Box::new(LoadBalancerStrategy::new(cluster)),
        auto::NODE_PORT => Box::new(NodePortStrategy::new(config, cluster).await?),
        _ => return Err(StrategyError::UnknownStrategy(config.exposer.clone()).into()),
    };
    info!(strategy = %name, "Created exposer strategy");
    Ok(strategy)
}

// The first declared service port, as (port, ports declared).
pub(crate) fn first_port(svc: &Service) -> Option<(i32, usize)> {
    let ports = svc.spec.as_ref()?.ports.as_ref()?;
    ports.first().map(|p| (p.port, ports.len()))
}

// Writes the difference between the two versions of the service, if any.
pub(crate) async fn patch_service(
    cluster: &dyn Cluster,
    original: &Service,
    modified: &Service,
) -> anyhow::Result<()> {
    let namespace = original.metadata.namespace.as_deref().unwrap_or_default();
    let name = original.metadata.name.as_deref().unwrap_or_default();
    match annotations::service_patch(original, modified)? {
        Some(patch) => {
            info!(%namespace, %name, "Patching service");
            cluster.patch_service(namespace, name, patch).await
        }
        None => {
            debug!(%namespace, %name, "Service already up to date");
            Ok(())
        }
    }
}

// Returns a copy of the service as a plain cluster IP service without
// exposure annotations, or `None` when it carried no exposure annotation.
pub(crate) fn restore_cluster_ip(svc: &Service) -> Option<Service> {
    let mut cleaned = svc.clone();
    if !annotations::remove_exposure_annotation(&mut cleaned) {
        return None;
    }
    if let Some(spec) = cleaned.spec.as_mut() {
        spec.type_ = Some("ClusterIP".to_owned());
        for port in spec.ports.iter_mut().flatten() {
            port.node_port = None;
        }
    }
    Some(cleaned)
}

#[cfg(test)]
pub(crate) mod test_utils {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
    use kube::api::ObjectMeta;

    pub(crate) fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    /// A service in `main` with the given ports, exposed through its label.
    pub(crate) fn service(name: &str, ports: &[i32]) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some("main".to_owned()),
                uid: Some(format!("uid-{}", name)),
                labels: Some(map(&[("expose", "true")])),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_owned()),
                ports: Some(
                    ports
                        .iter()
                        .map(|p| ServicePort {
                            port: *p,
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub(crate) fn with_annotations(mut svc: Service, pairs: &[(&str, &str)]) -> Service {
        svc.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .extend(map(pairs));
        svc
    }

    pub(crate) fn exposed_url(svc: &Service) -> Option<String> {
        svc.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(crate::annotations::EXPOSE_URL_ANNOTATION))
            .cloned()
    }
}
