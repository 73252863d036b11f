//! Runtime configuration.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The port used for the metrics & healthcheck HTTP server.
    pub http_port: u16,

    /// The Kubernetes namespace watched by this operator.
    pub namespace: String,
    /// The name of the pod on which this instance is running.
    pub pod_name: String,

    /// The interval in seconds at which every known Source is reconciled, even without changes.
    #[serde(default = "Config::default_resync_seconds")]
    pub resync_seconds: u64,
    /// The number of consecutive transient failures of a Component before it is reported as Failed.
    #[serde(default = "Config::default_retry_budget")]
    pub retry_budget: u32,
    /// The connector runner image used when a Source does not specify one.
    #[serde(default = "Config::default_image")]
    pub default_image: String,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routing just parses the runtime environment and builds the application
    /// config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        config.validate()
    }

    /// Check the bounds of the parsed values.
    pub(crate) fn validate(self) -> Result<Self> {
        anyhow::ensure!(self.resync_seconds > 0, "RESYNC_SECONDS must be greater than 0");
        anyhow::ensure!(self.retry_budget >= 2, "RETRY_BUDGET must be at least 2, got {}", self.retry_budget);
        Ok(self)
    }

    /// The periodic resync interval.
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_seconds)
    }

    fn default_resync_seconds() -> u64 {
        300
    }

    fn default_retry_budget() -> u32 {
        5
    }

    fn default_image() -> String {
        "ghcr.io/tributary-rs/connector-runner:latest".into()
    }
}
