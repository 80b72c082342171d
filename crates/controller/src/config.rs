//! Controller configuration

use anyhow::{Context, Result};
use costwatch_lib::annotations::{AnnotationKeys, DEFAULT_DOMAIN};
use costwatch_lib::controller::ControllerSettings;
use costwatch_lib::pricing::CatalogEntry;
use costwatch_lib::runtime::RunnerConfig;
use serde::Deserialize;
use std::time::Duration;

/// Environment variable naming an optional config file
pub const CONFIG_PATH_ENV: &str = "COSTWATCH_CONFIG";
const ENV_PREFIX: &str = "COSTWATCH";

/// Controller configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Prefix of every annotation key the controllers own
    #[serde(default = "default_annotation_domain")]
    pub annotation_domain: String,

    /// Age after which a cached node price is fetched again
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,

    #[serde(default = "default_requeue_delay")]
    pub requeue_delay_secs: u64,

    #[serde(default = "default_max_concurrent_reconciles")]
    pub max_concurrent_reconciles: usize,

    /// Deadline for each cluster API or pricing call
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Static price table used for cloud nodes
    #[serde(default)]
    pub catalog: Vec<CatalogEntry>,

    /// Publish object events to the cluster; when off they are only logged
    #[serde(default = "default_publish_events")]
    pub publish_events: bool,

    /// Pod name from the downward API, used as event reporter instance
    #[serde(default = "default_pod_name")]
    pub pod_name: Option<String>,
}

fn default_api_port() -> u16 {
    8080
}

fn default_annotation_domain() -> String {
    DEFAULT_DOMAIN.to_string()
}

fn default_refresh_interval() -> u64 {
    3600
}

fn default_requeue_delay() -> u64 {
    10
}

fn default_max_concurrent_reconciles() -> usize {
    4
}

fn default_request_timeout() -> u64 {
    10
}

fn default_publish_events() -> bool {
    true
}

fn default_pod_name() -> Option<String> {
    std::env::var("POD_NAME").ok()
}

impl ControllerConfig {
    /// Load configuration from the optional file and the environment
    pub fn load() -> Result<Self> {
        Self::load_from(std::env::var(CONFIG_PATH_ENV).ok().as_deref())
    }

    /// Load with an explicit file path; environment variables take precedence
    pub fn load_from(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .context("failed to read configuration")?;

        let parsed: Self = config
            .try_deserialize()
            .context("invalid configuration")?;
        parsed.validate()?;
        Ok(parsed)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.annotation_domain.is_empty(),
            "annotation_domain must not be empty"
        );
        anyhow::ensure!(
            self.refresh_interval_secs > 0,
            "refresh_interval_secs must be positive"
        );
        anyhow::ensure!(
            self.request_timeout_secs > 0,
            "request_timeout_secs must be positive"
        );
        anyhow::ensure!(
            self.max_concurrent_reconciles > 0,
            "max_concurrent_reconciles must be positive"
        );
        for entry in &self.catalog {
            anyhow::ensure!(
                entry.hourly.is_finite() && entry.hourly >= 0.0,
                "catalog price for {} must be a non-negative number",
                entry.instance_type
            );
        }
        Ok(())
    }

    pub fn settings(&self) -> ControllerSettings {
        ControllerSettings {
            refresh_interval: Duration::from_secs(self.refresh_interval_secs),
            requeue_delay: Duration::from_secs(self.requeue_delay_secs),
            call_timeout: Duration::from_secs(self.request_timeout_secs),
            keys: AnnotationKeys::new(&self.annotation_domain),
        }
    }

    pub fn runner(&self) -> RunnerConfig {
        RunnerConfig {
            workers: self.max_concurrent_reconciles,
            requeue_delay: Duration::from_secs(self.requeue_delay_secs),
        }
    }
}
