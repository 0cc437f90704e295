//! Outbound report relay
//!
//! Holds a single persistent connection to the aggregation endpoint. The
//! sender task drains the [`ReportBuffer`](crate::report::ReportBuffer)
//! whenever new data is signalled; the keepalive task pings the endpoint and
//! forces a reconnect when pongs stop arriving.

mod sender;
mod transport;
mod websocket;

#[cfg(test)]
mod tests;

pub use sender::Relay;
pub use transport::{Connection, Connector, Frame, Liveness};
pub use websocket::WebSocketConnector;

use std::time::Duration;
use thiserror::Error;
use tokio_tungstenite::tungstenite;
use url::Url;

/// Configuration for the relay
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Report endpoint without the identifying query parameters
    pub endpoint: Url,
    pub cluster_name: String,
    pub customer_id: String,
    /// Wait between reconnect attempts (default: 5 seconds)
    pub reconnect_delay: Duration,
    /// Keepalive ping interval (default: 40 seconds)
    pub ping_interval: Duration,
    /// Unanswered pings before the connection is replaced (default: 3)
    pub max_missed_pongs: u32,
    /// Coalescing delay after a wake-up (default: 1 second)
    pub batch_delay: Duration,
    /// Restart every watch loop after the connection was re-established
    pub reset_watchers_on_reconnect: bool,
    /// Upper bound on a single connect attempt (default: 10 seconds)
    pub connect_timeout: Duration,
}

impl RelayConfig {
    pub fn new(endpoint: Url, cluster_name: impl Into<String>, customer_id: impl Into<String>) -> Self {
        Self {
            endpoint,
            cluster_name: cluster_name.into(),
            customer_id: customer_id.into(),
            reconnect_delay: Duration::from_secs(5),
            ping_interval: Duration::from_secs(40),
            max_missed_pongs: 3,
            batch_delay: Duration::from_secs(1),
            reset_watchers_on_reconnect: true,
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Endpoint URL carrying `customerGUID` and `clusterName`
    pub fn report_url(&self) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("customerGUID", &self.customer_id)
            .append_pair("clusterName", &self.cluster_name);
        url
    }

    /// Endpoint for logs, without query or credentials
    pub fn display_endpoint(&self) -> String {
        let mut url = self.endpoint.clone();
        url.set_query(None);
        let _ = url.set_password(None);
        let _ = url.set_username("");
        url.to_string()
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: tungstenite::Error,
    },

    #[error("timed out connecting to {endpoint}")]
    ConnectTimeout { endpoint: String },

    #[error("failed to send frame: {0}")]
    Send(#[source] tungstenite::Error),

    #[error("connection closed by peer")]
    Closed,

    #[error("not connected")]
    NotConnected,
}

#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn test_report_url_carries_identity() {
        let config = RelayConfig::new(
            Url::parse("wss://report.example.com/k8s/cluster-reports").unwrap(),
            "prod-eu",
            "1e3a88bf-92ce-44f8-914e-cbe71830d566",
        );

        let url = config.report_url();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("customerGUID".to_string(), "1e3a88bf-92ce-44f8-914e-cbe71830d566".to_string()),
                ("clusterName".to_string(), "prod-eu".to_string()),
            ]
        );
        assert_eq!(config.display_endpoint(), "wss://report.example.com/k8s/cluster-reports");
    }

    #[test]
    fn test_defaults() {
        let config = RelayConfig::new(Url::parse("ws://localhost:7555").unwrap(), "c", "g");
        assert_eq!(config.ping_interval, Duration::from_secs(40));
        assert_eq!(config.max_missed_pongs, 3);
        assert!(config.reset_watchers_on_reconnect);
    }
}
