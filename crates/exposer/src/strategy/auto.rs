//! Detection of the strategy and of the external domain from the shape of the cluster.

use k8s_openapi::api::core::v1::Node;
use tracing::{debug, info};

use super::StrategyError;
use crate::cluster::Cluster;

/// Name of the ambassador strategy.
pub const AMBASSADOR: &str = "ambassador";
/// Name of the ingress strategy.
pub const INGRESS: &str = "ingress";
/// Name of the load balancer strategy.
pub const LOAD_BALANCER: &str = "loadbalancer";
/// Name of the node port strategy.
pub const NODE_PORT: &str = "nodeport";

/// Label marking the node whose address serves external traffic.
pub const EXTERNAL_IP_LABEL: &str = "fabric8.io/externalIP";

const DOMAIN_SUFFIX: &str = ".nip.io";
const STACKPOINT_NAMESPACE: &str = "stackpoint-system";
const STACKPOINT_BALANCER: &str = "spc-balancer";
const STACKPOINT_IP_ENV: &str = "BALANCER_IP";
const PROVIDED_NODE_IP_ANNOTATION_SUFFIX: &str = "kubernetes.io/provided-node-ip";

fn is_local_cluster_node(node: &Node) -> bool {
    matches!(
        node.metadata.name.as_deref(),
        Some("minikube") | Some("minishift")
    )
}

/// Picks node port on single node minikube and minishift clusters, ingress everywhere else.
pub async fn detect_strategy(cluster: &dyn Cluster) -> anyhow::Result<&'static str> {
    let nodes = cluster.list_nodes("").await?;
    match nodes.as_slice() {
        [node] if is_local_cluster_node(node) => Ok(NODE_PORT),
        _ => Ok(INGRESS),
    }
}

/// Finds a wildcard DNS domain resolving to the cluster's entry point.
///
/// The candidates, in order, are the address of a single minikube or minishift
/// node, the address of the single node labelled as external, and the address
/// of a stackpoint balancer. The address is suffixed with `.nip.io`.
pub async fn detect_domain(cluster: &dyn Cluster) -> anyhow::Result<String> {
    let nodes = cluster.list_nodes("").await?;
    if let [node] = nodes.as_slice() {
        if is_local_cluster_node(node) {
            let ip = node_external_ip(node)?;
            info!(%ip, "Using the address of the local cluster node as domain");
            return Ok(format!("{}{}", ip, DOMAIN_SUFFIX));
        }
    }

    let labelled = cluster
        .list_nodes(&format!("{}=true", EXTERNAL_IP_LABEL))
        .await?;
    if let [node] = labelled.as_slice() {
        let ip = node_external_ip(node)?;
        info!(%ip, "Using the address of the labelled node as domain");
        return Ok(format!("{}{}", ip, DOMAIN_SUFFIX));
    }

    match cluster
        .get_pod(STACKPOINT_NAMESPACE, STACKPOINT_BALANCER)
        .await
    {
        Ok(Some(pod)) => {
            let ip = pod
                .spec
                .iter()
                .flat_map(|s| s.containers.iter())
                .filter(|c| c.name == STACKPOINT_BALANCER)
                .flat_map(|c| c.env.iter().flatten())
                .find(|e| e.name == STACKPOINT_IP_ENV)
                .and_then(|e| e.value.clone());
            if let Some(ip) = ip {
                info!(%ip, "Using the address of the stackpoint balancer as domain");
                return Ok(format!("{}{}", ip, DOMAIN_SUFFIX));
            }
        }
        Ok(None) => debug!("No stackpoint balancer found"),
        Err(error) => debug!(?error, "Unable to look up the stackpoint balancer"),
    }

    Err(StrategyError::DomainDetection.into())
}

/// The externally reachable address of a node.
///
/// A provided node IP annotation wins over an `ExternalIP` address, which wins
/// over an `InternalIP` address.
pub fn node_external_ip(node: &Node) -> Result<String, StrategyError> {
    let provided = node.metadata.annotations.iter().flatten().find(|(k, v)| {
        !v.is_empty() && k.ends_with(PROVIDED_NODE_IP_ANNOTATION_SUFFIX)
    });
    if let Some((_, ip)) = provided {
        return Ok(ip.clone());
    }

    let addresses = node
        .status
        .as_ref()
        .and_then(|s| s.addresses.as_ref())
        .map(Vec::as_slice)
        .unwrap_or_default();
    addresses
        .iter()
        .find(|a| a.type_ == "ExternalIP")
        .or_else(|| addresses.iter().find(|a| a.type_ == "InternalIP"))
        .map(|a| a.address.clone())
        .ok_or_else(|| {
            StrategyError::NodeIpDetection(format!(
                "no ExternalIP found on node {}",
                node.metadata.name.as_deref().unwrap_or_default()
            ))
        })
}
