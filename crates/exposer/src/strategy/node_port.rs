use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use tracing::{debug, info};

use super::{auto, patch_service, restore_cluster_ip, ExposeStrategy, StrategyError};
use crate::annotations::{self, service_key};
use crate::cluster::Cluster;
use crate::config::Config;

const NODE_PORT_TYPE: &str = "NodePort";

/// Exposes services on a port of the cluster's single node.
pub struct NodePortStrategy {
    cluster: Arc<dyn Cluster>,
    node_ip: String,
    pending: HashSet<String>,
}

impl NodePortStrategy {
    /// Creates the strategy, looking up the node address unless one is configured.
    pub async fn new(config: &Config, cluster: Arc<dyn Cluster>) -> anyhow::Result<Self> {
        let node_ip = if config.node_ip.is_empty() {
            detect_node_ip(cluster.as_ref()).await?
        } else {
            config.node_ip.clone()
        };
        info!(%node_ip, "Exposing services on node ports");
        Ok(NodePortStrategy {
            cluster,
            node_ip,
            pending: HashSet::new(),
        })
    }
}

async fn detect_node_ip(cluster: &dyn Cluster) -> anyhow::Result<String> {
    let nodes = cluster.list_nodes("").await?;
    let node = match nodes.as_slice() {
        [node] => node,
        _ => {
            return Err(StrategyError::NodeIpDetection(format!(
                "node port strategy can only be used with single node clusters, found {} nodes",
                nodes.len()
            ))
            .into())
        }
    };
    let labelled = node
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(auto::EXTERNAL_IP_LABEL))
        .filter(|ip| !ip.is_empty());
    match labelled {
        Some(ip) => Ok(ip.clone()),
        None => Ok(auto::node_external_ip(node)?),
    }
}

// `host:port`, with IPv6 addresses in brackets.
fn join_host_port(host: &str, port: i32) -> String {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => format!("[{}]:{}", host, port),
        _ => format!("{}:{}", host, port),
    }
}

#[async_trait]
impl ExposeStrategy for NodePortStrategy {
    async fn sync(&mut self) -> anyhow::Result<()> {
        self.pending.clear();
        Ok(())
    }

    fn has_synced(&self) -> bool {
        self.pending.is_empty()
    }

    #[tracing::instrument(level = "debug", skip(self, svc), fields(service = %service_key(svc)))]
    async fn add(&mut self, svc: &Service) -> anyhow::Result<()> {
        let key = service_key(svc);
        let node_port = {
            let ports = svc
                .spec
                .as_ref()
                .and_then(|s| s.ports.as_deref())
                .unwrap_or_default();
            match ports {
                [] => return Err(StrategyError::NoPorts(key).into()),
                [port] => port.node_port.filter(|p| *p > 0),
                _ => return Err(StrategyError::MultiplePorts(key).into()),
            }
        };

        let mut exposed = svc.clone();
        let spec = exposed.spec.get_or_insert_with(Default::default);
        spec.type_ = Some(NODE_PORT_TYPE.to_owned());
        spec.external_ips = None;

        match node_port {
            Some(port) => {
                let host = join_host_port(&self.node_ip, port);
                annotations::add_exposure_annotation(&mut exposed, &host, "", false);
                patch_service(self.cluster.as_ref(), svc, &exposed).await?;
                if self.pending.remove(&key) {
                    info!(service = %key, %host, "Node port assigned");
                }
            }
            None => {
                debug!(service = %key, "Waiting for a node port");
                self.pending.insert(key);
                annotations::set_pending_exposure(&mut exposed);
                patch_service(self.cluster.as_ref(), svc, &exposed).await?;
            }
        }
        Ok(())
    }

    async fn clean(&mut self, svc: &Service) -> anyhow::Result<()> {
        self.pending.remove(&service_key(svc));
        match restore_cluster_ip(svc) {
            Some(cleaned) => patch_service(self.cluster.as_ref(), svc, &cleaned).await,
            None => Ok(()),
        }
    }

    async fn delete(&mut self, svc: &Service) -> anyhow::Result<()> {
        self.pending.remove(&service_key(svc));
        Ok(())
    }
}
