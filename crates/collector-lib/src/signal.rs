//! Wake-up and reset signalling between watch loops and the relay

use std::sync::Arc;
use tokio::sync::broadcast::{
    self,
    error::{RecvError, TryRecvError},
};
use tokio::sync::Notify;

/// Wakes the relay sender when the report buffer goes from empty to non-empty
///
/// A notification sent while nobody waits is kept as a single permit, so the
/// sender never misses a transition that happens between two flushes.
#[derive(Debug, Clone, Default)]
pub struct NewDataSignal {
    notify: Arc<Notify>,
}

impl NewDataSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        self.notify.notify_one();
    }

    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// Why the watch loops were asked to restart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    /// The report connection was re-established
    SinkReconnected,
    /// Explicit request, e.g. from an operator endpoint
    Requested,
}

impl ResetReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResetReason::SinkReconnected => "sink_reconnected",
            ResetReason::Requested => "requested",
        }
    }
}

/// Broadcast that forces every watch loop to abandon its stream and restart
#[derive(Debug, Clone)]
pub struct ResetSignal {
    tx: broadcast::Sender<ResetReason>,
}

impl Default for ResetSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ResetSignal {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self { tx }
    }

    /// Fire a reset. Returns the number of loops that will observe it.
    pub fn trigger(&self, reason: ResetReason) -> usize {
        self.tx.send(reason).unwrap_or(0)
    }

    pub fn subscribe(&self) -> ResetListener {
        ResetListener {
            rx: self.tx.subscribe(),
        }
    }
}

/// One loop's subscription to the [`ResetSignal`]
#[derive(Debug)]
pub struct ResetListener {
    rx: broadcast::Receiver<ResetReason>,
}

impl ResetListener {
    /// Wait for the next reset. Cancel safe.
    pub async fn recv(&mut self) -> ResetReason {
        loop {
            match self.rx.recv().await {
                Ok(reason) => return reason,
                // Older resets were dropped; the next retained one still counts
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => std::future::pending::<()>().await,
            }
        }
    }

    /// Discard every reset already queued. Returns how many were dropped.
    pub fn drain(&mut self) -> usize {
        let mut drained = 0;
        loop {
            match self.rx.try_recv() {
                Ok(_) => drained += 1,
                Err(TryRecvError::Lagged(skipped)) => drained += skipped as usize,
                Err(TryRecvError::Empty | TryRecvError::Closed) => return drained,
            }
        }
    }
}
