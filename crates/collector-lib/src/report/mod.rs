//! Change reports
//!
//! Watch loops append entries to the shared [`ReportBuffer`]; the relay
//! snapshots it and acknowledges what it delivered.

mod buffer;
mod entries;

pub use buffer::{Bucket, ChangeReport, ReportBuffer, Snapshot};
pub use entries::{
    Category, ChangeKind, MicroServiceReport, NodeReport, PodReport, ReportEntry, ServiceReport,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to serialize change report: {0}")]
    Serialize(#[from] serde_json::Error),
}
