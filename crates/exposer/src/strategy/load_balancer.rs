use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use tracing::{debug, info};

use super::{patch_service, restore_cluster_ip, ExposeStrategy};
use crate::annotations::{self, service_key};
use crate::cluster::Cluster;

const LOAD_BALANCER_TYPE: &str = "LoadBalancer";

/// Exposes services by switching them to the `LoadBalancer` type.
///
/// Services whose load balancer has no address yet are remembered until a
/// later `add` sees the address; the strategy has not synced while any remain.
pub struct LoadBalancerStrategy {
    cluster: Arc<dyn Cluster>,
    pending: HashSet<String>,
}

impl LoadBalancerStrategy {
    /// Creates the strategy.
    pub fn new(cluster: Arc<dyn Cluster>) -> Self {
        LoadBalancerStrategy {
            cluster,
            pending: HashSet::new(),
        }
    }
}

// The address assigned by the cloud provider, else the requested one.
fn load_balancer_address(svc: &Service) -> Option<String> {
    let assigned = svc
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .and_then(|ingress| ingress.first())
        .and_then(|i| i.ip.clone().or_else(|| i.hostname.clone()));
    assigned
        .or_else(|| svc.spec.as_ref().and_then(|s| s.load_balancer_ip.clone()))
        .filter(|a| !a.is_empty())
}

#[async_trait]
impl ExposeStrategy for LoadBalancerStrategy {
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
        let mut exposed = svc.clone();
        exposed.spec.get_or_insert_with(Default::default).type_ = Some(LOAD_BALANCER_TYPE.to_owned());

        match load_balancer_address(svc) {
            Some(address) => {
                annotations::add_exposure_annotation(&mut exposed, &address, "", false);
                patch_service(self.cluster.as_ref(), svc, &exposed).await?;
                if self.pending.remove(&key) {
                    info!(service = %key, %address, "Load balancer address assigned");
                }
            }
            None => {
                debug!(service = %key, "Waiting for a load balancer address");
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::FakeCluster;
    use crate::strategy::test_utils::{exposed_url, service, with_annotations};
    use k8s_openapi::api::core::v1::{LoadBalancerIngress, LoadBalancerStatus, ServiceStatus};

    fn with_address(mut svc: Service, ip: &str) -> Service {
        svc.status = Some(ServiceStatus {
            load_balancer: Some(LoadBalancerStatus {
                ingress: Some(vec![LoadBalancerIngress {
                    ip: Some(ip.to_owned()),
                    ..Default::default()
                }]),
            }),
            ..Default::default()
        });
        svc
    }

    #[tokio::test]
    async fn test_readiness_waits_for_address() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.add_service(service("svc1", &[80]));
        let mut s = LoadBalancerStrategy::new(cluster.clone());
        s.sync().await.unwrap();
        assert!(s.has_synced());

        s.add(&cluster.service("main", "svc1").unwrap()).await.unwrap();
        assert!(!s.has_synced());
        let svc = cluster.service("main", "svc1").unwrap();
        assert_eq!(svc.spec.as_ref().unwrap().type_.as_deref(), Some("LoadBalancer"));
        assert_eq!(exposed_url(&svc).as_deref(), Some(""));

        // Still no address: nothing to write, still waiting.
        cluster.clear_writes();
        s.add(&svc).await.unwrap();
        assert!(!s.has_synced());
        assert!(cluster.writes().is_empty());

        let svc = with_address(svc, "34.1.2.3");
        cluster.add_service(svc.clone());
        s.add(&svc).await.unwrap();
        assert!(s.has_synced());
        assert_eq!(
            exposed_url(&cluster.service("main", "svc1").unwrap()).as_deref(),
            Some("http://34.1.2.3")
        );
    }

    #[tokio::test]
    async fn test_failed_write_keeps_waiting() {
        let cluster = Arc::new(FakeCluster::new());
        let svc = with_address(service("svc1", &[80]), "34.1.2.3");
        cluster.add_service(svc.clone());
        let mut s = LoadBalancerStrategy::new(cluster.clone());
        s.pending.insert("main/svc1".to_owned());

        cluster.set_fail_writes(true);
        assert!(s.add(&svc).await.is_err());
        assert!(!s.has_synced());

        cluster.set_fail_writes(false);
        s.add(&svc).await.unwrap();
        assert!(s.has_synced());
    }

    #[tokio::test]
    async fn test_clean_restores_cluster_ip() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.add_service(service("svc1", &[80]));
        let mut s = LoadBalancerStrategy::new(cluster.clone());
        s.add(&cluster.service("main", "svc1").unwrap()).await.unwrap();

        let svc = cluster.service("main", "svc1").unwrap();
        s.clean(&svc).await.unwrap();
        assert!(s.has_synced());
        let svc = cluster.service("main", "svc1").unwrap();
        assert_eq!(svc.spec.as_ref().unwrap().type_.as_deref(), Some("ClusterIP"));
        assert_eq!(exposed_url(&svc), None);

        // Never exposed: left alone.
        cluster.clear_writes();
        let untouched = with_annotations(service("svc2", &[80]), &[]);
        cluster.add_service(untouched.clone());
        s.clean(&untouched).await.unwrap();
        assert!(cluster.writes().is_empty());
    }

    #[tokio::test]
    async fn test_delete_forgets_service() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.add_service(service("svc1", &[80]));
        let mut s = LoadBalancerStrategy::new(cluster.clone());
        s.add(&cluster.service("main", "svc1").unwrap()).await.unwrap();
        assert!(!s.has_synced());

        cluster.clear_writes();
        s.delete(&service("svc1", &[80])).await.unwrap();
        assert!(s.has_synced());
        assert!(cluster.writes().is_empty());
    }
}
