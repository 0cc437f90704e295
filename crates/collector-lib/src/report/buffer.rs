//! Change report accumulation between flushes
//!
//! The buffer is append-only until the relay confirms a transmission.
//! A [`Snapshot`] records how far each sequence reached when it was taken,
//! and [`ReportBuffer::acknowledge`] drops exactly that prefix, so entries
//! appended while a frame is in flight survive into the next flush.

use super::entries::{
    ChangeKind, MicroServiceReport, NodeReport, PodReport, ReportEntry, ServiceReport,
};
use super::ReportError;
use crate::observability::CollectorMetrics;
use crate::signal::NewDataSignal;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

/// Created/updated/deleted sequences of one category, in detection order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bucket<T> {
    pub create: Vec<T>,
    pub update: Vec<T>,
    pub delete: Vec<T>,
}

// Manual impl: a derive would require `T: Default`.
impl<T> Default for Bucket<T> {
    fn default() -> Self {
        Self {
            create: Vec::new(),
            update: Vec::new(),
            delete: Vec::new(),
        }
    }
}

impl<T> Bucket<T> {
    fn push(&mut self, value: T, kind: ChangeKind) {
        match kind {
            ChangeKind::Created => self.create.push(value),
            ChangeKind::Updated => self.update.push(value),
            ChangeKind::Deleted => self.delete.push(value),
        }
    }

    pub fn len(&self) -> usize {
        self.create.len() + self.update.len() + self.delete.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn mark(&self) -> [usize; 3] {
        [self.create.len(), self.update.len(), self.delete.len()]
    }

    fn drain_through(&mut self, mark: [usize; 3]) {
        for (sequence, count) in [&mut self.create, &mut self.update, &mut self.delete]
            .into_iter()
            .zip(mark)
        {
            let count = count.min(sequence.len());
            sequence.drain(..count);
        }
    }
}

/// The document sent to the aggregation endpoint
///
/// All four categories and their three sequences are always serialized, so
/// the top-level schema never changes with content.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChangeReport {
    pub node: Bucket<NodeReport>,
    pub service: Bucket<ServiceReport>,
    pub microservice: Bucket<MicroServiceReport>,
    pub pod: Bucket<PodReport>,
}

impl ChangeReport {
    pub fn add(&mut self, entry: ReportEntry, kind: ChangeKind) {
        match entry {
            ReportEntry::Node(report) => self.node.push(report, kind),
            ReportEntry::Service(report) => self.service.push(report, kind),
            ReportEntry::MicroService(report) => self.microservice.push(report, kind),
            ReportEntry::Pod(report) => self.pod.push(report, kind),
        }
    }

    pub fn len(&self) -> usize {
        self.node.len() + self.service.len() + self.microservice.len() + self.pod.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn watermark(&self, generation: u64) -> Watermark {
        Watermark {
            generation,
            node: self.node.mark(),
            service: self.service.mark(),
            microservice: self.microservice.mark(),
            pod: self.pod.mark(),
        }
    }

    fn drain_through(&mut self, watermark: &Watermark) {
        self.node.drain_through(watermark.node);
        self.service.drain_through(watermark.service);
        self.microservice.drain_through(watermark.microservice);
        self.pod.drain_through(watermark.pod);
    }
}

/// Sequence lengths at the time a snapshot was taken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Watermark {
    /// Bumped by every clear; a stale watermark acknowledges nothing
    generation: u64,
    node: [usize; 3],
    service: [usize; 3],
    microservice: [usize; 3],
    pod: [usize; 3],
}

/// Serialized report plus the position it covers
#[derive(Debug, Clone)]
pub struct Snapshot {
    payload: String,
    entries: usize,
    watermark: Watermark,
}

impl Snapshot {
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Number of report entries carried by the payload
    pub fn entries(&self) -> usize {
        self.entries
    }
}

#[derive(Debug, Default)]
struct BufferState {
    report: ChangeReport,
    generation: u64,
}

/// Shared change report buffer
///
/// Has its own lock; callers must not hold a store lock while calling in.
pub struct ReportBuffer {
    state: Mutex<BufferState>,
    signal: NewDataSignal,
    metrics: CollectorMetrics,
}

impl ReportBuffer {
    pub fn new(signal: NewDataSignal) -> Self {
        Self {
            state: Mutex::new(BufferState::default()),
            signal,
            metrics: CollectorMetrics::new(),
        }
    }

    /// Signal fired on every empty to non-empty transition
    pub fn signal(&self) -> &NewDataSignal {
        &self.signal
    }

    /// Append one entry
    pub async fn add(&self, entry: ReportEntry, kind: ChangeKind) {
        self.extend([(entry, kind)]).await;
    }

    /// Append several entries in order under a single lock acquisition
    pub async fn extend(&self, entries: impl IntoIterator<Item = (ReportEntry, ChangeKind)>) {
        let (was_empty, pending) = {
            let mut state = self.state.lock().await;
            let was_empty = state.report.is_empty();
            for (entry, kind) in entries {
                debug!(category = ?entry.category(), change = kind.as_str(), "Report entry added");
                state.report.add(entry, kind);
            }
            (was_empty, state.report.len())
        };

        self.metrics.set_report_entries_pending(pending);
        if was_empty && pending > 0 {
            self.signal.notify();
        }
    }

    /// Serialize the whole report, or `None` when there is nothing to send
    ///
    /// Does not modify the buffer.
    pub async fn snapshot(&self) -> Result<Option<Snapshot>, ReportError> {
        let state = self.state.lock().await;
        if state.report.is_empty() {
            return Ok(None);
        }

        let payload = serde_json::to_string(&state.report)?;
        Ok(Some(Snapshot {
            payload,
            entries: state.report.len(),
            watermark: state.report.watermark(state.generation),
        }))
    }

    /// Drop the entries carried by a successfully transmitted snapshot
    pub async fn acknowledge(&self, snapshot: &Snapshot) {
        let pending = {
            let mut state = self.state.lock().await;
            if state.generation != snapshot.watermark.generation {
                debug!("Snapshot predates a clear, nothing to acknowledge");
                return;
            }
            state.report.drain_through(&snapshot.watermark);
            state.report.len()
        };
        self.metrics.set_report_entries_pending(pending);
    }

    /// Reset every bucket to empty
    pub async fn clear(&self) {
        {
            let mut state = self.state.lock().await;
            state.report = ChangeReport::default();
            state.generation = state.generation.wrapping_add(1);
        }
        self.metrics.set_report_entries_pending(0);
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.report.is_empty()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.report.len()
    }
}
