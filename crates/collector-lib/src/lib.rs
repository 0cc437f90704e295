//! Cluster state collector library
//!
//! This crate provides the core functionality for:
//! - Watching cluster resources and keeping an in-memory model of them
//! - Grouping pods into microservices and resolving their owners
//! - Buffering change reports and relaying them over a WebSocket
//! - Health checks and observability

pub mod correlator;
pub mod health;
pub mod ids;
pub mod models;
pub mod observability;
pub mod owner;
pub mod relay;
pub mod report;
pub mod signal;
pub mod state;
pub mod store;
pub mod watch;

#[cfg(test)]
mod testing;

pub use correlator::PodCorrelator;
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use ids::{CorrelationId, IdAllocator};
pub use models::*;
pub use observability::{CollectorMetrics, StructuredLogger};
pub use owner::{KubeOwnerLookup, OwnerLookup, OwnerResolver};
pub use relay::{Relay, RelayConfig, WebSocketConnector};
pub use report::{ChangeKind, ReportBuffer};
pub use signal::{NewDataSignal, ResetReason, ResetSignal};
pub use state::{ClusterState, StateSummary};
pub use watch::{EntityHandler, KubeEventSource, NamespacePolicy, WatchConfig, WatchLoop};
