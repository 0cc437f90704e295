//! Report delivery and connection upkeep

use super::transport::{Connection, Connector, Frame, Liveness};
use super::{RelayConfig, RelayError};
use crate::health::{components, HealthRegistry};
use crate::observability::{CollectorMetrics, StructuredLogger};
use crate::report::{ReportBuffer, Snapshot};
use crate::signal::{ResetReason, ResetSignal};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// A connection and the generation it was opened in
struct Live {
    generation: u64,
    connection: Box<dyn Connection>,
}

/// A failed send and the generation of the connection it was attempted on
///
/// Generation 0 means there was no connection.
#[derive(Debug)]
struct SendFailure {
    generation: u64,
    error: RelayError,
}

/// The relay between the report buffer and the aggregation endpoint
///
/// Shared by the sender and keepalive tasks; the connection slot is the
/// only state they contend on. Each connection gets a new generation, so a
/// task reporting a failed connection never replaces a newer one.
pub struct Relay {
    config: RelayConfig,
    connector: Arc<dyn Connector>,
    buffer: Arc<ReportBuffer>,
    reset: ResetSignal,
    connection: Mutex<Option<Live>>,
    generations: AtomicU64,
    liveness: Arc<Liveness>,
    connected_once: AtomicBool,
    health: Option<HealthRegistry>,
    metrics: CollectorMetrics,
    logger: StructuredLogger,
}

impl Relay {
    pub fn new(
        config: RelayConfig,
        connector: Arc<dyn Connector>,
        buffer: Arc<ReportBuffer>,
        reset: ResetSignal,
    ) -> Self {
        let logger = StructuredLogger::new(config.cluster_name.clone());
        Self {
            config,
            connector,
            buffer,
            reset,
            connection: Mutex::new(None),
            generations: AtomicU64::new(0),
            liveness: Arc::new(Liveness::new()),
            connected_once: AtomicBool::new(false),
            health: None,
            metrics: CollectorMetrics::new(),
            logger,
        }
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn liveness(&self) -> &Arc<Liveness> {
        &self.liveness
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.lock().await.is_some()
    }

    /// Generation of the current connection, `None` when disconnected
    pub(super) async fn generation(&self) -> Option<u64> {
        self.connection.lock().await.as_ref().map(|live| live.generation)
    }

    /// Sender task: connect, then flush on every new-data signal. Never returns.
    pub async fn run_sender(self: Arc<Self>) {
        info!(endpoint = %self.config.display_endpoint(), "Starting report relay");
        if let Some(health) = &self.health {
            health.register(components::RELAY).await;
        }
        if !self.is_connected().await {
            self.reconnect().await;
        }

        loop {
            self.flush().await;
            self.buffer.signal().notified().await;
            if !self.config.batch_delay.is_zero() {
                tokio::time::sleep(self.config.batch_delay).await;
            }
        }
    }

    /// Keepalive task: ping on every interval, reconnect after too many misses. Never returns.
    pub async fn run_keepalive(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.ping_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            self.keepalive_tick().await;
        }
    }

    /// Send a ping, and replace the connection once the count of unanswered
    /// pings reaches the limit
    pub async fn keepalive_tick(&self) {
        self.liveness.ping_sent();
        let generation = match self.send(Frame::Ping).await {
            Ok(generation) => generation,
            Err(failure) => {
                debug!(error = %failure.error, "Keepalive ping failed");
                failure.generation
            }
        };

        let missed = self.liveness.missed();
        if missed >= self.config.max_missed_pongs {
            warn!(missed, "Report endpoint stopped answering pings, reconnecting");
            self.replace(generation).await;
        }
    }

    /// Send snapshots until the buffer is empty
    ///
    /// Each snapshot is retried until delivered and only then acknowledged.
    pub async fn flush(&self) {
        loop {
            let snapshot = match self.buffer.snapshot().await {
                Ok(Some(snapshot)) => snapshot,
                Ok(None) => return,
                Err(error) => {
                    error!(error = %error, "Failed to serialize change report");
                    return;
                }
            };

            self.deliver(&snapshot).await;
            self.buffer.acknowledge(&snapshot).await;
            self.metrics.observe_report_sent(snapshot.payload().len());
            self.logger
                .log_report_sent(snapshot.entries(), snapshot.payload().len());
        }
    }

    /// Send once, resend once on the same connection, then reconnect and
    /// resend until it goes through
    async fn deliver(&self, snapshot: &Snapshot) {
        let frame = Frame::Report(snapshot.payload().to_string());

        let mut failed = 0;
        for attempt in ["initial", "immediate retry"] {
            match self.send(frame.clone()).await {
                Ok(_) => return,
                Err(failure) => {
                    self.metrics.inc_report_send_failures();
                    warn!(attempt, error = %failure.error, "Failed to send change report");
                    failed = failure.generation;
                }
            }
        }

        loop {
            self.replace(failed).await;
            match self.send(frame.clone()).await {
                Ok(_) => return,
                Err(failure) => {
                    self.metrics.inc_report_send_failures();
                    warn!(error = %failure.error, "Failed to send change report after reconnect");
                    failed = failure.generation;
                }
            }
        }
    }

    /// Send on the current connection. Returns the connection's generation.
    async fn send(&self, frame: Frame) -> Result<u64, SendFailure> {
        let mut slot = self.connection.lock().await;
        let Some(live) = slot.as_mut() else {
            return Err(SendFailure {
                generation: 0,
                error: RelayError::NotConnected,
            });
        };

        let generation = live.generation;
        live.connection
            .send(frame)
            .await
            .map(|()| generation)
            .map_err(|error| SendFailure { generation, error })
    }

    /// Replace the connection of generation `failed`
    ///
    /// Does nothing if another task already replaced it.
    pub(super) async fn replace(&self, failed: u64) {
        self.connect(Some(failed)).await;
    }

    /// Replace the connection, retrying with a fixed delay until connected
    ///
    /// Every connection after the first fires the reset signal so watch loops
    /// reconcile whatever changed while reports could not be delivered.
    pub async fn reconnect(&self) {
        self.connect(None).await;
    }

    async fn connect(&self, failed: Option<u64>) {
        let endpoint = self.config.display_endpoint();
        let url = self.config.report_url();
        let mut slot = self.connection.lock().await;

        if let (Some(failed), Some(current)) = (failed, slot.as_ref()) {
            if current.generation != failed {
                debug!(failed, current = current.generation, "Connection already replaced");
                return;
            }
        }

        if let Some(mut stale) = slot.take() {
            stale.connection.close().await;
            self.logger.log_relay_connection(false, &endpoint);
        }

        loop {
            match self.connector.connect(&url, self.liveness.clone()).await {
                Ok(connection) => {
                    let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
                    *slot = Some(Live {
                        generation,
                        connection,
                    });
                    break;
                }
                Err(error) => {
                    warn!(error = %error, delay_secs = self.config.reconnect_delay.as_secs(), "Report endpoint unreachable");
                    if let Some(health) = &self.health {
                        health
                            .set_degraded(components::RELAY, error.to_string())
                            .await;
                    }
                    tokio::time::sleep(self.config.reconnect_delay).await;
                }
            }
        }
        drop(slot);

        self.liveness.reset();
        if let Some(health) = &self.health {
            health.set_healthy(components::RELAY).await;
        }
        self.logger.log_relay_connection(true, &endpoint);

        if self.connected_once.swap(true, Ordering::SeqCst) {
            self.metrics.inc_relay_reconnects();
            if self.config.reset_watchers_on_reconnect {
                let loops = self.reset.trigger(ResetReason::SinkReconnected);
                info!(loops, "Restarting watch loops after reconnect");
            }
        }
    }
}
