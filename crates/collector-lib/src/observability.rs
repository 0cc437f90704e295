//! Observability infrastructure for the cluster collector
//!
//! Provides:
//! - Prometheus metrics (watch events, restarts, report relay, pending entries)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for report frame sizes (in bytes)
const REPORT_SIZE_BUCKETS: &[f64] = &[
    256.0, 1024.0, 4096.0, 16384.0, 65536.0, 262144.0, 1048576.0, 4194304.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<CollectorMetricsInner> = OnceLock::new();

/// Inner metrics structure that holds the actual Prometheus metrics
struct CollectorMetricsInner {
    watch_events: IntCounterVec,
    watch_restarts: IntCounterVec,
    unresolved_events: IntCounterVec,
    reports_sent: IntCounter,
    report_send_failures: IntCounter,
    relay_reconnects: IntCounter,
    report_entries_pending: IntGauge,
    report_bytes: Histogram,
    microservices_tracked: IntGauge,
}

impl CollectorMetricsInner {
    fn new() -> Self {
        Self {
            watch_events: register_int_counter_vec!(
                "cluster_collector_watch_events_total",
                "Watch events received, by resource kind and event type",
                &["kind", "event"]
            )
            .expect("Failed to register watch_events_total"),

            watch_restarts: register_int_counter_vec!(
                "cluster_collector_watch_restarts_total",
                "Watch stream restarts, by resource kind and cause",
                &["kind", "cause"]
            )
            .expect("Failed to register watch_restarts_total"),

            unresolved_events: register_int_counter_vec!(
                "cluster_collector_unresolved_events_total",
                "Modify or delete events dropped because the object was not tracked",
                &["kind"]
            )
            .expect("Failed to register unresolved_events_total"),

            reports_sent: register_int_counter!(
                "cluster_collector_reports_sent_total",
                "Change reports acknowledged by the report endpoint"
            )
            .expect("Failed to register reports_sent_total"),

            report_send_failures: register_int_counter!(
                "cluster_collector_report_send_failures_total",
                "Failed attempts to send a change report"
            )
            .expect("Failed to register report_send_failures_total"),

            relay_reconnects: register_int_counter!(
                "cluster_collector_relay_reconnects_total",
                "Re-established connections to the report endpoint"
            )
            .expect("Failed to register relay_reconnects_total"),

            report_entries_pending: register_int_gauge!(
                "cluster_collector_report_entries_pending",
                "Change report entries waiting to be sent"
            )
            .expect("Failed to register report_entries_pending"),

            report_bytes: register_histogram!(
                "cluster_collector_report_bytes",
                "Size of serialized change reports",
                REPORT_SIZE_BUCKETS.to_vec()
            )
            .expect("Failed to register report_bytes"),

            microservices_tracked: register_int_gauge!(
                "cluster_collector_microservices_tracked",
                "Microservices currently tracked"
            )
            .expect("Failed to register microservices_tracked"),
        }
    }
}

/// Collector metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct CollectorMetrics {
    _private: (),
}

impl Default for CollectorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl CollectorMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(CollectorMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &CollectorMetricsInner {
        GLOBAL_METRICS.get_or_init(CollectorMetricsInner::new)
    }

    pub fn inc_watch_event(&self, kind: &str, event: &str) {
        self.inner()
            .watch_events
            .with_label_values(&[kind, event])
            .inc();
    }

    pub fn add_watch_events(&self, kind: &str, event: &str, count: usize) {
        self.inner()
            .watch_events
            .with_label_values(&[kind, event])
            .inc_by(count as u64);
    }

    pub fn inc_watch_restart(&self, kind: &str, cause: &str) {
        self.inner()
            .watch_restarts
            .with_label_values(&[kind, cause])
            .inc();
    }

    pub fn inc_unresolved_event(&self, kind: &str) {
        self.inner()
            .unresolved_events
            .with_label_values(&[kind])
            .inc();
    }

    /// Record an acknowledged report and its size
    pub fn observe_report_sent(&self, bytes: usize) {
        self.inner().reports_sent.inc();
        self.inner().report_bytes.observe(bytes as f64);
    }

    pub fn inc_report_send_failures(&self) {
        self.inner().report_send_failures.inc();
    }

    pub fn inc_relay_reconnects(&self) {
        self.inner().relay_reconnects.inc();
    }

    pub fn set_report_entries_pending(&self, entries: usize) {
        self.inner().report_entries_pending.set(entries as i64);
    }

    pub fn set_microservices_tracked(&self, count: usize) {
        self.inner().microservices_tracked.set(count as i64);
    }
}

/// Structured logger for collector lifecycle events
///
/// Provides consistent JSON-formatted logging for startup, shutdown,
/// report delivery, and relay connectivity.
#[derive(Clone)]
pub struct StructuredLogger {
    cluster_name: String,
}

impl StructuredLogger {
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
        }
    }

    /// Log collector startup
    pub fn log_startup(&self, version: &str) {
        info!(
            event = "collector_started",
            cluster = %self.cluster_name,
            collector_version = %version,
            "Cluster collector started"
        );
    }

    /// Log collector shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "collector_shutdown",
            cluster = %self.cluster_name,
            reason = %reason,
            "Cluster collector shutting down"
        );
    }

    /// Log a delivered change report
    pub fn log_report_sent(&self, entries: usize, bytes: usize) {
        info!(
            event = "report_sent",
            cluster = %self.cluster_name,
            entries = entries,
            bytes = bytes,
            "Change report delivered"
        );
    }

    /// Log relay connectivity changes
    pub fn log_relay_connection(&self, connected: bool, endpoint: &str) {
        if connected {
            info!(
                event = "relay_connection",
                cluster = %self.cluster_name,
                connected = true,
                endpoint = %endpoint,
                "Connected to report endpoint"
            );
        } else {
            warn!(
                event = "relay_connection",
                cluster = %self.cluster_name,
                connected = false,
                endpoint = %endpoint,
                "Lost connection to report endpoint, reports are buffered"
            );
        }
    }
}
