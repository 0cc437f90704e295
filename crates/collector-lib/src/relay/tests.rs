//! Relay tests over an in-memory transport

use super::*;
use crate::ids::CorrelationId;
use crate::report::{ChangeKind, NodeReport, ReportBuffer, ReportEntry};
use crate::signal::{NewDataSignal, ResetReason, ResetSignal};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use url::Url;

/// Shared script and recording for [`MockConnector`] connections
#[derive(Default)]
struct Wire {
    connects: AtomicUsize,
    refuse_connects: AtomicUsize,
    fail_sends: AtomicUsize,
    answer_pings: AtomicBool,
    reports: Mutex<Vec<String>>,
    pings: AtomicUsize,
    /// Buffer length observed at each report send
    pending_at_send: Mutex<Vec<usize>>,
}

struct MockConnector {
    wire: Arc<Wire>,
    buffer: Arc<ReportBuffer>,
}

struct MockConnection {
    wire: Arc<Wire>,
    buffer: Arc<ReportBuffer>,
    liveness: Arc<Liveness>,
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &Url, liveness: Arc<Liveness>) -> Result<Box<dyn Connection>, RelayError> {
        assert!(url.query().unwrap_or_default().contains("clusterName=test-cluster"));
        if take_one(&self.wire.refuse_connects) {
            return Err(RelayError::ConnectTimeout {
                endpoint: url.host_str().unwrap_or_default().to_string(),
            });
        }
        self.wire.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            wire: self.wire.clone(),
            buffer: self.buffer.clone(),
            liveness,
        }))
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn send(&mut self, frame: Frame) -> Result<(), RelayError> {
        match frame {
            Frame::Report(payload) => {
                let pending = self.buffer.len().await;
                self.wire.pending_at_send.lock().unwrap().push(pending);
                self.wire.reports.lock().unwrap().push(payload);
                if take_one(&self.wire.fail_sends) {
                    return Err(RelayError::Closed);
                }
                Ok(())
            }
            Frame::Ping => {
                self.wire.pings.fetch_add(1, Ordering::SeqCst);
                if self.wire.answer_pings.load(Ordering::SeqCst) {
                    self.liveness.pong_received();
                }
                Ok(())
            }
        }
    }

    async fn close(&mut self) {}
}

struct Harness {
    wire: Arc<Wire>,
    buffer: Arc<ReportBuffer>,
    reset: ResetSignal,
    relay: Arc<Relay>,
}

fn harness(wire: Wire) -> Harness {
    let wire = Arc::new(wire);
    let buffer = Arc::new(ReportBuffer::new(NewDataSignal::new()));
    let reset = ResetSignal::new();

    let mut config = RelayConfig::new(Url::parse("ws://collector.test/reports").unwrap(), "test-cluster", "guid");
    config.reconnect_delay = std::time::Duration::ZERO;
    config.batch_delay = std::time::Duration::ZERO;

    let connector = MockConnector {
        wire: wire.clone(),
        buffer: buffer.clone(),
    };
    let relay = Arc::new(Relay::new(config, Arc::new(connector), buffer.clone(), reset.clone()));

    Harness {
        wire,
        buffer,
        reset,
        relay,
    }
}

fn node_entry(name: &str) -> ReportEntry {
    ReportEntry::Node(NodeReport {
        id: CorrelationId::from(1),
        name: name.to_string(),
        node: Node::default(),
    })
}

#[tokio::test]
async fn test_send_fails_twice_then_succeeds() {
    let h = harness(Wire {
        fail_sends: AtomicUsize::new(2),
        ..Default::default()
    });
    let mut watchers = h.reset.subscribe();
    h.buffer.add(node_entry("node-1"), ChangeKind::Created).await;

    h.relay.reconnect().await;
    h.relay.flush().await;

    let reports = h.wire.reports.lock().unwrap().clone();
    assert_eq!(reports.len(), 3);
    assert!(reports.iter().all(|payload| payload == &reports[0]));
    // Nothing was acknowledged before the third attempt went through
    assert_eq!(*h.wire.pending_at_send.lock().unwrap(), vec![1, 1, 1]);
    assert!(h.buffer.is_empty().await);

    // One reconnect after the immediate retry failed
    assert_eq!(h.wire.connects.load(Ordering::SeqCst), 2);
    assert_eq!(watchers.recv().await, ResetReason::SinkReconnected);
}

#[tokio::test]
async fn test_first_connect_does_not_reset_watchers() {
    let h = harness(Wire {
        refuse_connects: AtomicUsize::new(2),
        ..Default::default()
    });

    let mut watchers = h.reset.subscribe();

    h.relay.reconnect().await;

    assert!(h.relay.is_connected().await);
    assert_eq!(h.wire.connects.load(Ordering::SeqCst), 1);
    let fired = tokio::time::timeout(std::time::Duration::from_millis(50), watchers.recv()).await;
    assert!(fired.is_err());
}

#[tokio::test]
async fn test_missed_pongs_force_reconnect() {
    let h = harness(Wire::default());
    h.relay.reconnect().await;

    for _ in 0..2 {
        h.relay.keepalive_tick().await;
    }
    assert_eq!(h.relay.liveness().missed(), 2);
    assert_eq!(h.wire.connects.load(Ordering::SeqCst), 1);

    // The third unanswered ping reaches the limit
    h.relay.keepalive_tick().await;
    assert_eq!(h.wire.connects.load(Ordering::SeqCst), 2);
    assert_eq!(h.relay.liveness().missed(), 0);
    assert_eq!(h.wire.pings.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_stale_failure_does_not_replace_newer_connection() {
    let h = harness(Wire::default());
    let mut watchers = h.reset.subscribe();

    h.relay.reconnect().await;
    let first = h.relay.generation().await.unwrap();
    // Another task replaces the connection first
    h.relay.replace(first).await;
    let second = h.relay.generation().await.unwrap();
    assert_ne!(first, second);
    assert_eq!(watchers.recv().await, ResetReason::SinkReconnected);

    // A failure seen on the first connection arrives late
    h.relay.replace(first).await;

    assert_eq!(h.relay.generation().await, Some(second));
    assert_eq!(h.wire.connects.load(Ordering::SeqCst), 2);
    let fired = tokio::time::timeout(std::time::Duration::from_millis(50), watchers.recv()).await;
    assert!(fired.is_err());
}

#[tokio::test]
async fn test_failure_without_connection_connects() {
    let h = harness(Wire::default());

    h.relay.replace(0).await;

    assert!(h.relay.is_connected().await);
    assert_eq!(h.wire.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_pongs_keep_connection() {
    let h = harness(Wire {
        answer_pings: AtomicBool::new(true),
        ..Default::default()
    });
    h.relay.reconnect().await;

    for _ in 0..10 {
        h.relay.keepalive_tick().await;
    }

    assert_eq!(h.wire.connects.load(Ordering::SeqCst), 1);
    assert_eq!(h.relay.liveness().missed(), 0);
}

#[tokio::test]
async fn test_sender_drains_on_signal() {
    let h = harness(Wire::default());
    let sender = tokio::spawn(h.relay.clone().run_sender());

    h.buffer.add(node_entry("node-1"), ChangeKind::Created).await;

    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while !h.buffer.is_empty().await {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("sender should drain the buffer");

    let reports = h.wire.reports.lock().unwrap().clone();
    assert_eq!(reports.len(), 1);
    let value: serde_json::Value = serde_json::from_str(&reports[0]).unwrap();
    assert_eq!(value["node"]["create"][0]["name"], "node-1");
    sender.abort();
}

#[tokio::test]
async fn test_flush_with_empty_buffer_sends_nothing() {
    let h = harness(Wire::default());
    h.relay.reconnect().await;

    h.relay.flush().await;

    assert!(h.wire.reports.lock().unwrap().is_empty());
}
