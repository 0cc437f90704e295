//! Transport seam between the relay and the wire

use super::RelayError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use url::Url;

/// Outbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// One serialized change report
    Report(String),
    Ping,
}

/// An open connection to the report endpoint
#[async_trait]
pub trait Connection: Send {
    async fn send(&mut self, frame: Frame) -> Result<(), RelayError>;

    async fn close(&mut self);
}

/// Opens connections to the report endpoint
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `url`. The connection calls [`Liveness::pong_received`] for every pong.
    async fn connect(&self, url: &Url, liveness: Arc<Liveness>) -> Result<Box<dyn Connection>, RelayError>;
}

/// Count of pings sent since the last pong
#[derive(Debug, Default)]
pub struct Liveness {
    missed: AtomicU32,
}

impl Liveness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of unanswered pings including this one
    pub fn ping_sent(&self) -> u32 {
        self.missed.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn pong_received(&self) {
        self.missed.store(0, Ordering::SeqCst);
    }

    pub fn missed(&self) -> u32 {
        self.missed.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.pong_received();
    }
}
