//! A crate for exposing Kubernetes [Services](https://kubernetes.io/docs/concepts/services-networking/service/)
//! outside of the cluster.
//!
//! The crate provides the [`ExposeStrategy`] trait describing how a single
//! service gets exposed, four implementations of it (ingress, ambassador
//! annotations, load balancer and node port), and a [`Controller`] which
//! consumes a stream of service watch events and drives the selected strategy.
//!
//! # Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use exposer::cluster::KubeCluster;
//! use exposer::config::Config;
//! use exposer::Controller;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = kube::Client::try_default().await?;
//!     let config = Config::load("exposer: ingress\ndomain: example.com\n")?;
//!     let cluster = Arc::new(KubeCluster::new(client.clone()));
//!
//!     let controller = Controller::new(config, cluster).await?;
//!     controller
//!         .run_once(exposer::controller::watch_services(client, None), Duration::from_secs(60))
//!         .await
//! }
//! ```

#![warn(missing_docs)]
#![cfg_attr(feature = "docs", feature(doc_cfg))]

pub mod annotations;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod related;
pub mod strategy;

#[doc(inline)]
pub use controller::Controller;
#[doc(inline)]
pub use strategy::ExposeStrategy;
