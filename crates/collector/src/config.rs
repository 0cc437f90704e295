//! Collector configuration

use anyhow::{Context, Result};
use collector_lib::{NamespacePolicy, RelayConfig, WatchConfig};
use serde::Deserialize;
use std::time::Duration;
use url::Url;

/// Collector configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CollectorConfig {
    /// Cluster name attached to every report
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,

    /// Customer GUID attached to every report
    #[serde(default)]
    pub customer_id: String,

    /// WebSocket endpoint receiving change reports
    #[serde(default = "default_report_url")]
    pub report_url: String,

    /// Comma-separated namespaces to watch; empty watches all
    #[serde(default)]
    pub include_namespaces: String,

    /// Comma-separated namespaces to ignore
    #[serde(default = "default_exclude_namespaces")]
    pub exclude_namespaces: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default = "default_watch_backoff")]
    pub watch_backoff_secs: u64,

    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,

    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    #[serde(default = "default_max_missed_pongs")]
    pub max_missed_pongs: u32,

    #[serde(default = "default_batch_delay")]
    pub batch_delay_millis: u64,
}

fn default_cluster_name() -> String {
    std::env::var("CLUSTER_NAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_report_url() -> String {
    "ws://report-receiver:7555/v1/reports".to_string()
}

fn default_exclude_namespaces() -> String {
    "kube-system,kube-public".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_watch_backoff() -> u64 {
    2
}

fn default_reconnect_delay() -> u64 {
    5
}

fn default_ping_interval() -> u64 {
    40
}

fn default_max_missed_pongs() -> u32 {
    3
}

fn default_batch_delay() -> u64 {
    1000
}

impl CollectorConfig {
    /// Load configuration from `COLLECTOR_*` environment variables
    pub fn load() -> Result<Self> {
        Self::from_source(config::Environment::with_prefix("COLLECTOR"))
    }

    fn from_source<S>(source: S) -> Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        config::Config::builder()
            .add_source(source)
            .build()
            .context("failed to read collector configuration")?
            .try_deserialize()
            .context("invalid collector configuration")
    }

    pub fn namespace_policy(&self) -> NamespacePolicy {
        NamespacePolicy::parse(&self.include_namespaces, &self.exclude_namespaces)
    }

    pub fn watch_config(&self) -> WatchConfig {
        WatchConfig {
            backoff: Duration::from_secs(self.watch_backoff_secs),
            policy: self.namespace_policy(),
        }
    }

    pub fn relay_config(&self) -> Result<RelayConfig> {
        let endpoint = Url::parse(&self.report_url)
            .with_context(|| format!("invalid report URL {:?}", self.report_url))?;
        anyhow::ensure!(
            matches!(endpoint.scheme(), "ws" | "wss"),
            "report URL must use ws:// or wss://, got {}",
            endpoint.scheme()
        );

        let mut relay = RelayConfig::new(endpoint, &self.cluster_name, &self.customer_id);
        relay.reconnect_delay = Duration::from_secs(self.reconnect_delay_secs);
        relay.ping_interval = Duration::from_secs(self.ping_interval_secs);
        relay.max_missed_pongs = self.max_missed_pongs;
        relay.batch_delay = Duration::from_millis(self.batch_delay_millis);
        Ok(relay)
    }
}
