//! The reconciliation loop driving the exposure strategy from service events.
//!
//! Events are handled one at a time, in the order the watch delivers them. The
//! next event is not looked at before the strategy returned from the previous
//! one, which is what lets strategies keep plain owned caches.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, ListParams};
use kube::Client;
use kube_runtime::watcher::{self, Event};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::annotations::{is_exposed, service_key};
use crate::cluster::Cluster;
use crate::config::Config;
use crate::related::RelatedResources;
use crate::strategy::{new_strategy, ExposeStrategy};

#[derive(Debug)]
enum PrettyEvent {
    Applied { key: String },
    Deleted { key: String },
    Restarted { count: usize },
}

impl From<&Event<Service>> for PrettyEvent {
    fn from(event: &Event<Service>) -> Self {
        match event {
            Event::Applied(svc) => PrettyEvent::Applied {
                key: service_key(svc),
            },
            Event::Deleted(svc) => PrettyEvent::Deleted {
                key: service_key(svc),
            },
            Event::Restarted(services) => PrettyEvent::Restarted {
                count: services.len(),
            },
        }
    }
}

/// Watches services of the namespace, or of every namespace when `None`.
pub fn watch_services(
    client: Client,
    namespace: Option<&str>,
) -> impl Stream<Item = Result<Event<Service>, watcher::Error>> + Send {
    let api: Api<Service> = match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    watcher(api, ListParams::default())
}

/// A handle on the two convergence signals of a [`Controller`].
///
/// The first signal fires once the initial listing has been handled and the
/// strategy has no outstanding work. The second fires once an exposure was
/// attempted, successfully or not, or the initial listing has been handled,
/// and the strategy has no outstanding work.
///
/// The second signal is therefore weaker than "an exposure completed": it
/// holds whenever the first one does, so that a run over a namespace with
/// nothing to expose still converges. It only carries information of its own
/// before the listing is handled, when it reports that an exposure was
/// attempted and the strategy has drained.
#[derive(Clone, Debug)]
pub struct Readiness {
    synced: watch::Receiver<bool>,
    exposed: watch::Receiver<bool>,
}

impl Readiness {
    /// Whether the initial listing was handled and the strategy has synced.
    pub fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Whether an exposure was attempted or the initial listing was handled,
    /// and the strategy has synced. Always true when [`Readiness::is_synced`] is.
    pub fn is_exposed(&self) -> bool {
        *self.exposed.borrow()
    }

    /// Waits until both signals hold at the same time.
    ///
    /// Timing out is an error for the caller; it does not stop the controller.
    pub async fn wait(mut self, timeout: Duration) -> anyhow::Result<()> {
        let converged = async {
            loop {
                if *self.synced.borrow_and_update() && *self.exposed.borrow_and_update() {
                    return Ok(());
                }
                let changed = tokio::select! {
                    changed = self.synced.changed() => changed,
                    changed = self.exposed.changed() => changed,
                };
                if changed.is_err() {
                    anyhow::bail!("controller stopped before services were exposed");
                }
            }
        };
        match tokio::time::timeout(timeout, converged).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!(
                "timed out after {:?} waiting for services to be exposed",
                timeout
            )),
        }
    }
}

/// Exposes the services delivered by a watch through an [`ExposeStrategy`].
pub struct Controller {
    strategy: Box<dyn ExposeStrategy>,
    related: Option<RelatedResources>,
    allowed: HashSet<String>,
    cache: HashMap<String, Service>,
    listed: bool,
    attempted: bool,
    synced_tx: watch::Sender<bool>,
    exposed_tx: watch::Sender<bool>,
    readiness: Readiness,
}

impl Controller {
    /// Creates a controller with the strategy named by the configuration and
    /// propagation of URLs into ConfigMaps.
    pub async fn new(config: Config, cluster: Arc<dyn Cluster>) -> anyhow::Result<Self> {
        let strategy = new_strategy(&config, cluster.clone()).await?;
        let related = RelatedResources::new(&config, cluster);
        Ok(Self::with_strategy(&config, strategy, Some(related)))
    }

    /// Creates a controller driving the given strategy.
    pub fn with_strategy(
        config: &Config,
        strategy: Box<dyn ExposeStrategy>,
        related: Option<RelatedResources>,
    ) -> Self {
        let (synced_tx, synced) = watch::channel(false);
        let (exposed_tx, exposed) = watch::channel(false);
        Controller {
            strategy,
            related,
            allowed: config.services.iter().cloned().collect(),
            cache: HashMap::new(),
            listed: false,
            attempted: false,
            synced_tx,
            exposed_tx,
            readiness: Readiness { synced, exposed },
        }
    }

    /// A handle on the convergence signals, usable while the controller runs.
    pub fn readiness(&self) -> Readiness {
        self.readiness.clone()
    }

    /// Handles events until the stream ends or `stop` resolves.
    ///
    /// Stopping waits for the event being handled to finish. Watch errors are
    /// logged and skipped.
    pub async fn run<S, E, F>(&mut self, events: S, stop: F)
    where
        S: Stream<Item = Result<Event<Service>, E>>,
        E: std::fmt::Debug,
        F: Future<Output = ()>,
    {
        tokio::pin!(events);
        tokio::pin!(stop);
        loop {
            tokio::select! {
                biased;
                _ = &mut stop => {
                    info!("Stopping controller");
                    break;
                }
                next = events.next() => match next {
                    Some(Ok(event)) => self.handle_event(event).await,
                    Some(Err(error)) => warn!(?error, "Error streaming service events."),
                    None => {
                        info!("Service watch ended");
                        break;
                    }
                },
            }
        }
    }

    /// Runs until both convergence signals fire, then stops.
    ///
    /// Fails when `timeout` elapses first.
    pub async fn run_once<S, E>(self, events: S, timeout: Duration) -> anyhow::Result<()>
    where
        S: Stream<Item = Result<Event<Service>, E>> + Send + 'static,
        E: std::fmt::Debug + Send + 'static,
    {
        let readiness = self.readiness();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let mut controller = self;
        let handle = tokio::spawn(async move {
            controller
                .run(events, async {
                    stop_rx.await.ok();
                })
                .await;
        });

        let result = readiness.wait(timeout).await;
        match &result {
            Ok(()) => info!("Services exposed"),
            Err(error) => error!(%error, "Services were not exposed in time"),
        }
        stop_tx.send(()).ok();
        handle.await?;
        result
    }

    /// Runs until `stop` resolves, logging when the controller converged.
    pub async fn run_daemon<S, E, F>(mut self, events: S, timeout: Duration, stop: F)
    where
        S: Stream<Item = Result<Event<Service>, E>>,
        E: std::fmt::Debug,
        F: Future<Output = ()>,
    {
        let readiness = self.readiness();
        tokio::spawn(async move {
            match readiness.wait(timeout).await {
                Ok(()) => info!("Controller synced"),
                Err(error) => error!(%error, "Controller has not synced yet"),
            }
        });
        self.run(events, stop).await;
    }

    #[tracing::instrument(
        level = "debug",
        skip(self, event),
        fields(event = ?PrettyEvent::from(&event))
    )]
    async fn handle_event(&mut self, event: Event<Service>) {
        match event {
            Event::Restarted(services) => {
                info!("Got a watch restart. Resyncing services...");
                self.resync(services).await;
                self.listed = true;
                info!("Finished resync of services.");
            }
            Event::Applied(svc) => self.apply(svc).await,
            Event::Deleted(svc) => self.delete(svc).await,
        }
        self.update_readiness();
    }

    // Rebuilds the strategy caches, deletes services that vanished while the
    // watch was down, then handles every listed service as applied.
    async fn resync(&mut self, services: Vec<Service>) {
        if let Err(error) = self.strategy.sync().await {
            error!(?error, "Failed to sync exposer strategy");
        }

        let current: HashSet<String> = services.iter().map(service_key).collect();
        let vanished: Vec<Service> = self
            .cache
            .iter()
            .filter(|(key, _)| !current.contains(*key))
            .map(|(_, svc)| svc.clone())
            .collect();
        for svc in vanished {
            self.delete(svc).await;
        }

        for svc in services {
            self.apply(svc).await;
        }
    }

    fn is_allowed(&self, svc: &Service) -> bool {
        self.allowed.is_empty()
            || svc
                .metadata
                .name
                .as_ref()
                .map(|name| self.allowed.contains(name))
                .unwrap_or(false)
    }

    async fn apply(&mut self, svc: Service) {
        let key = service_key(&svc);
        let previous = self.cache.insert(key.clone(), svc.clone());
        if !self.is_allowed(&svc) {
            debug!(service = %key, "Service is not in the allowed services, ignoring");
            return;
        }

        if is_exposed(&svc) {
            match self.strategy.add(&svc).await {
                Ok(()) => debug!(service = %key, "Exposed service"),
                Err(error) => error!(service = %key, ?error, "Failed to expose service"),
            }
            self.attempted = true;
            if let Some(related) = &self.related {
                if let Err(error) = related.update(&svc).await {
                    error!(service = %key, ?error, "Failed to update related resources");
                }
            }
        } else if previous.as_ref().map(is_exposed).unwrap_or(true) {
            match self.strategy.clean(&svc).await {
                Ok(()) => debug!(service = %key, "Cleaned service"),
                Err(error) => error!(service = %key, ?error, "Failed to clean service"),
            }
        } else {
            debug!(service = %key, "Service is still not exposed, ignoring");
        }
    }

    async fn delete(&mut self, svc: Service) {
        let key = service_key(&svc);
        self.cache.remove(&key);
        if !self.is_allowed(&svc) {
            return;
        }
        match self.strategy.delete(&svc).await {
            Ok(()) => debug!(service = %key, "Released deleted service"),
            Err(error) => error!(service = %key, ?error, "Failed to release deleted service"),
        }
    }

    fn update_readiness(&self) {
        let strategy_synced = self.strategy.has_synced();
        let synced = self.listed && strategy_synced;
        let exposed = (self.attempted || self.listed) && strategy_synced;
        if *self.synced_tx.borrow() != synced {
            self.synced_tx.send(synced).ok();
        }
        if *self.exposed_tx.borrow() != exposed {
            self.exposed_tx.send(exposed).ok();
        }
    }
}
