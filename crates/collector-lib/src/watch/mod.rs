//! Per-kind watch loops over the cluster API
//!
//! A [`WatchLoop`] lists every object of its kind from an [`EventSource`],
//! reconciles the store against that listing, then watches from the listed
//! resource version. Each object passes the restart boundary and namespace
//! policy before a [`ResourceHandler`] mutates the cluster state and appends
//! report entries. Loops restart themselves on every stream failure and
//! never exit.

mod entity;
mod r#loop;
mod policy;
mod source;


pub use entity::{EntityHandler, WatchedKind};
pub use policy::NamespacePolicy;
pub use r#loop::{LoopState, RestartCause, WatchConfig, WatchLoop};
pub use source::KubeEventSource;

pub use async_trait::async_trait;

use crate::models::ObjectKey;
use crate::store::StoreError;
use futures::stream::BoxStream;
use kube::api::WatchEvent;
use std::collections::HashSet;
use thiserror::Error;

/// Stream of watch events for one resource kind
pub type EventStream<K> = BoxStream<'static, Result<WatchEvent<K>, WatchError>>;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to list objects: {0}")]
    List(#[source] kube::Error),

    #[error("failed to open watch: {0}")]
    Connect(#[source] kube::Error),

    #[error("watch stream failed: {0}")]
    Stream(#[source] kube::Error),
}

/// Every object of a kind as of one resource version
#[derive(Debug)]
pub struct Listing<K> {
    pub objects: Vec<K>,
    pub resource_version: String,
}

/// Lists and watches one resource kind
#[async_trait]
pub trait EventSource<K>: Send + Sync {
    /// Current objects of the kind, with the version to watch from
    async fn list(&self) -> Result<Listing<K>, WatchError>;

    /// Watch changes made after `resource_version`
    async fn watch(&self, resource_version: &str) -> Result<EventStream<K>, WatchError>;
}

/// Failure to apply one event to the cluster state
///
/// Never fatal to the loop: the event is logged and dropped.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{kind} {key} is not tracked")]
    Unknown { kind: &'static str, key: ObjectKey },

    #[error("{kind} object has neither name nor generateName")]
    Unnamed { kind: &'static str },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Applies watch events of one kind to the cluster state
#[async_trait]
pub trait ResourceHandler<K: Send + 'static>: Send + Sync {
    /// Object created after the current restart boundary
    async fn added(&self, object: K) -> Result<(), HandlerError>;

    /// Object redelivered by a new watch that existed before the boundary
    async fn resynced(&self, object: K) -> Result<(), HandlerError>;

    async fn modified(&self, object: K) -> Result<(), HandlerError>;

    async fn deleted(&self, object: K) -> Result<(), HandlerError>;

    /// Forget every tracked object whose key is not in `live`, reporting
    /// each one as deleted. Returns how many were forgotten.
    async fn retain(&self, live: &HashSet<ObjectKey>) -> Result<usize, HandlerError>;
}
