use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use exposer::cluster::{Cluster, KubeCluster};
use exposer::config::{Config, Opts};
use exposer::controller::watch_services;
use exposer::Controller;
use structopt::StructOpt;
use tracing::info;

const DEFAULT_NAMESPACE: &str = "default";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let opts = Opts::from_args();

    // Tries a kubeconfig file first, then falls back on an in-cluster configuration.
    let client = kube::Client::try_default().await?;
    let cluster = Arc::new(KubeCluster::new(client.clone()));

    let mut config = load_config(&opts, cluster.as_ref()).await?;
    if let Some(namespace) = &opts.namespace {
        config.namespace = namespace.clone();
    }
    info!(?config, "Loaded configuration");

    let namespace = Some(config.namespace.clone()).filter(|ns| !ns.is_empty());
    let controller = Controller::new(config, cluster).await?;
    let events = watch_services(client, namespace.as_deref());
    let timeout = Duration::from_secs(opts.timeout);

    if opts.daemon {
        controller
            .run_daemon(events, timeout, async {
                tokio::signal::ctrl_c().await.ok();
                info!("Received interrupt");
            })
            .await;
        Ok(())
    } else {
        controller.run_once(events, timeout).await
    }
}

async fn load_config(opts: &Opts, cluster: &dyn Cluster) -> anyhow::Result<Config> {
    let name = match &opts.config_map {
        Some(name) => name,
        None => return Config::load_file(&opts.config),
    };
    let namespace = opts.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE);
    let config_map = cluster
        .get_config_map(namespace, name)
        .await?
        .with_context(|| format!("ConfigMap {}/{} not found", namespace, name))?;
    Config::from_config_map_data(&config_map.data.unwrap_or_default())
}
