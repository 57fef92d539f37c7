//! Configuration for the controller
//!
//! The configuration is a YAML document, read either from a file with
//! [`Config::load_file`] or from the data of a ConfigMap with
//! [`Config::from_config_map_data`]. Turning on the "cli" feature adds [`Opts`]
//! for the command line flags of the binary.

use std::collections::BTreeMap;
use std::path::Path;
#[cfg(feature = "cli")]
use std::path::PathBuf;

use anyhow::Context;
use serde::{Deserialize, Serialize};
#[cfg(feature = "cli")]
use structopt::StructOpt;
use tracing::info;

/// Name of the file holding the configuration, relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "config.yml";
/// Seconds a one-shot run waits for convergence.
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// The configuration of the controller and of its exposure strategy.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// The name of the strategy. Empty selects one from the shape of the cluster.
    pub exposer: String,
    /// The domain external host names are built under.
    pub domain: String,
    /// The domain used by services asking for the internal domain.
    pub internal_domain: String,
    /// Template for host names with `{{.Service}}`, `{{.Namespace}}` and `{{.Domain}}`.
    #[serde(rename = "urltemplate")]
    pub url_template: String,
    /// `path` shares the domain between services and routes on a path prefix.
    pub path_mode: String,
    /// The node address advertised by the node-port strategy.
    pub node_ip: String,
    /// Whether exposed URLs default to plain http.
    pub http: bool,
    /// Whether certificates are requested automatically for ingresses.
    pub tls_acme: bool,
    /// The secret holding the TLS certificate.
    pub tls_secret_name: String,
    /// Whether the TLS certificate is a wildcard for the whole domain.
    pub tls_use_wildcard: bool,
    /// The ingress class set on generated ingresses.
    pub ingress_class: String,
    /// A prefix for the names of generated ingresses.
    pub name_prefix: String,
    /// The namespace to watch. Empty watches all namespaces.
    #[serde(alias = "watch-namespaces")]
    pub namespace: String,
    /// Names of the only services to expose. Empty exposes every marked service.
    pub services: Vec<String>,
}

impl Config {
    /// Parses a YAML document. An empty document yields the defaults.
    pub fn load(content: &str) -> anyhow::Result<Self> {
        if content.trim().is_empty() {
            return Ok(Config::default());
        }
        serde_yaml::from_str(content).context("failed to unmarshal config")
    }

    /// Reads and parses the configuration file.
    ///
    /// A missing file is not an error: the defaults are returned instead.
    pub fn load_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => Self::load(&content)
                .with_context(|| format!("failed to read config file {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No config file found. Will try to figure out defaults");
                Ok(Config::default())
            }
            Err(e) => Err(e).with_context(|| format!("failed to read config file {}", path.display())),
        }
    }

    /// Builds the configuration from the data of a ConfigMap.
    ///
    /// Every value is parsed as a YAML scalar or list, so `"true"` becomes a
    /// boolean and `"[a, b]"` a list.
    pub fn from_config_map_data(data: &BTreeMap<String, String>) -> anyhow::Result<Self> {
        let mut mapping = serde_yaml::Mapping::new();
        for (key, value) in data {
            let parsed = if key == "services" {
                serde_yaml::from_str(value)
                    .with_context(|| format!("failed to parse config key {}", key))?
            } else {
                scalar(value)
            };
            mapping.insert(serde_yaml::Value::String(key.clone()), parsed);
        }
        serde_yaml::from_value(serde_yaml::Value::Mapping(mapping))
            .context("failed to convert ConfigMap data to config")
    }
}

fn scalar(value: &str) -> serde_yaml::Value {
    match value {
        "true" => serde_yaml::Value::Bool(true),
        "false" => serde_yaml::Value::Bool(false),
        _ => serde_yaml::Value::String(value.to_owned()),
    }
}

/// CLI options of the controller binary
///
/// These can be parsed from args using `Opts::from_args()`
#[derive(StructOpt, Clone, Debug)]
#[cfg(any(feature = "cli", feature = "docs"))]
#[cfg_attr(feature = "docs", doc(cfg(feature = "cli")))]
#[structopt(
    name = "exposecontroller",
    about = "Exposes Kubernetes services through ingresses, load balancers or node ports"
)]
pub struct Opts {
    /// Path to the configuration file
    #[structopt(
        long = "config",
        default_value = DEFAULT_CONFIG_FILE,
        env = "EXPOSECONTROLLER_CONFIG",
        help = "The path to the configuration file"
    )]
    pub config: PathBuf,

    /// ConfigMap to read the configuration from instead of the file
    #[structopt(
        long = "config-map",
        env = "EXPOSECONTROLLER_CONFIG_MAP",
        help = "Name of a ConfigMap in the watched namespace holding the configuration. Overrides --config"
    )]
    pub config_map: Option<String>,

    /// Namespace to watch
    #[structopt(
        short = "n",
        long = "namespace",
        env = "EXPOSECONTROLLER_NAMESPACE",
        help = "The namespace to watch. Overrides the namespace of the configuration"
    )]
    pub namespace: Option<String>,

    /// Keep running after convergence
    #[structopt(
        long = "daemon",
        help = "Run as a daemon until interrupted instead of exiting once converged"
    )]
    pub daemon: bool,

    /// Seconds to wait for convergence
    #[structopt(
        long = "timeout",
        default_value = "600",
        env = "EXPOSECONTROLLER_TIMEOUT",
        help = "Seconds to wait for the initial convergence"
    )]
    pub timeout: u64,
}
