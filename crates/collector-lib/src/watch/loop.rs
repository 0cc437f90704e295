//! The self-restarting watch loop
//!
//! A cycle lists the kind, reconciles the store against the listing, then
//! watches from the listed version. When the server merely ends a stream the
//! next cycle resumes from the last version seen instead of listing again.

use super::{EventSource, EventStream, HandlerError, NamespacePolicy, ResourceHandler, WatchError};
use crate::health::{components, HealthRegistry};
use crate::models::{strip_managed_fields, ObjectKey};
use crate::observability::CollectorMetrics;
use crate::signal::{ResetListener, ResetReason};
use chrono::{DateTime, SubsecRound, Utc};
use futures::StreamExt;
use kube::api::WatchEvent;
use kube::Resource;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for a watch loop
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Delay before reconnecting after a failure (default: 2 seconds)
    pub backoff: Duration,
    /// Namespaces to process; applied to namespaced objects only
    pub policy: NamespacePolicy,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(2),
            policy: NamespacePolicy::allow_all(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Connecting,
    Streaming,
    Restarting,
}

/// Why a watch stream was abandoned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartCause {
    StreamError(String),
    ApiError {
        code: u16,
        reason: String,
        message: String,
    },
    /// The server closed the stream (watch timeout)
    StreamEnded,
    Reset(ResetReason),
}

impl RestartCause {
    pub fn label(&self) -> &'static str {
        match self {
            RestartCause::StreamError(_) => "stream_error",
            RestartCause::ApiError { .. } => "api_error",
            RestartCause::StreamEnded => "stream_ended",
            RestartCause::Reset(_) => "reset",
        }
    }

    /// Failures wait out the backoff; orderly ends reconnect immediately
    pub fn backs_off(&self) -> bool {
        matches!(
            self,
            RestartCause::StreamError(_) | RestartCause::ApiError { .. }
        )
    }

    /// Only an orderly end keeps the resource version; everything else relists
    pub fn resumes(&self) -> bool {
        matches!(self, RestartCause::StreamEnded)
    }
}

/// Watch loop for one resource kind
pub struct WatchLoop<K: Send + 'static> {
    kind: String,
    source: Arc<dyn EventSource<K>>,
    handler: Arc<dyn ResourceHandler<K>>,
    config: WatchConfig,
    reset: ResetListener,
    health: Option<HealthRegistry>,
    metrics: CollectorMetrics,
    state: LoopState,
    /// Objects created before this instant were known before the current stream
    last_watch_event_creation_time: Option<DateTime<Utc>>,
    /// Version to resume watching from; `None` forces a relist
    resume_from: Option<String>,
}

impl<K> WatchLoop<K>
where
    K: Resource<DynamicType = ()> + Send + Sync + 'static,
{
    pub fn new(
        source: Arc<dyn EventSource<K>>,
        handler: Arc<dyn ResourceHandler<K>>,
        config: WatchConfig,
        reset: ResetListener,
    ) -> Self {
        Self {
            kind: K::kind(&()).into_owned(),
            source,
            handler,
            config,
            reset,
            health: None,
            metrics: CollectorMetrics::new(),
            state: LoopState::Connecting,
            last_watch_event_creation_time: None,
            resume_from: None,
        }
    }

    /// Report connection state to a health registry
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn restart_boundary(&self) -> Option<DateTime<Utc>> {
        self.last_watch_event_creation_time
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.resume_from.as_deref()
    }

    /// Run until the process exits
    pub async fn run(mut self) {
        info!(kind = %self.kind, "Starting watch loop");
        if let Some(health) = &self.health {
            health.register(&components::watch(&self.kind)).await;
        }

        loop {
            self.cycle().await;
        }
    }

    /// Connect, stream until the stream fails or a reset arrives, then
    /// record the restart boundary. Returns why the stream was abandoned.
    pub async fn cycle(&mut self) -> RestartCause {
        self.state = LoopState::Connecting;
        let cause = self.stream().await;

        self.state = LoopState::Restarting;
        self.mark_restart_boundary();
        if !cause.resumes() {
            self.resume_from = None;
        }
        self.metrics.inc_watch_restart(&self.kind, cause.label());

        match &cause {
            RestartCause::Reset(reason) => {
                info!(kind = %self.kind, reason = reason.as_str(), "Restarting watch on reset")
            }
            RestartCause::StreamEnded => {
                debug!(kind = %self.kind, "Watch stream ended, reconnecting")
            }
            cause => warn!(kind = %self.kind, cause = ?cause, "Watch stream failed, restarting"),
        }

        if cause.backs_off() {
            tokio::time::sleep(self.config.backoff).await;
        }
        cause
    }

    async fn stream(&mut self) -> RestartCause {
        let mut events = self.open().await;

        self.state = LoopState::Streaming;
        self.set_healthy().await;
        debug!(
            kind = %self.kind,
            boundary = ?self.last_watch_event_creation_time,
            version = ?self.resume_from,
            "Watch stream open"
        );

        loop {
            tokio::select! {
                biased;
                reason = self.reset.recv() => return RestartCause::Reset(reason),
                next = events.next() => match next {
                    Some(Ok(event)) => {
                        self.track_version(&event);
                        if let Some(cause) = self.dispatch(event).await {
                            return cause;
                        }
                    }
                    Some(Err(error)) => return RestartCause::StreamError(error.to_string()),
                    None => return RestartCause::StreamEnded,
                },
            }
        }
    }

    /// Open a watch, relisting first unless there is a version to resume from
    ///
    /// Resets raised before or during a relist are consumed by it. A reset
    /// raised while resuming turns the attempt into a relist.
    async fn open(&mut self) -> EventStream<K> {
        loop {
            if self.reset.drain() > 0 {
                self.resume_from = None;
            }
            let relisting = self.resume_from.is_none();

            let opened = match self.resume_from.clone() {
                Some(version) => self.source.watch(&version).await,
                None => match self.relist().await {
                    Ok(version) => {
                        let opened = self.source.watch(&version).await;
                        self.resume_from = Some(version);
                        opened
                    }
                    Err(error) => Err(error),
                },
            };

            match opened {
                Ok(events) => {
                    if self.reset.drain() > 0 && !relisting {
                        self.resume_from = None;
                        continue;
                    }
                    return events;
                }
                Err(error) => {
                    warn!(kind = %self.kind, error = %error, "Failed to open watch, retrying");
                    self.resume_from = None;
                    self.set_degraded(error.to_string()).await;
                    tokio::time::sleep(self.config.backoff).await;
                }
            }
        }
    }

    /// List every object, apply each one, and forget tracked objects the
    /// listing no longer contains. Returns the listing's resource version.
    async fn relist(&mut self) -> Result<String, WatchError> {
        let listing = self.source.list().await?;
        let listed = listing.objects.len();

        let mut live = HashSet::new();
        for object in listing.objects {
            let Some(object) = self.admit(object) else { continue };
            live.extend(ObjectKey::of(&object));
            let (label, result) = self.apply_added(object).await;
            self.metrics.inc_watch_event(&self.kind, label);
            if let Err(error) = result {
                self.log_handler_error(label, error);
            }
        }

        match self.handler.retain(&live).await {
            Ok(0) => {}
            Ok(pruned) => {
                self.metrics.add_watch_events(&self.kind, "pruned", pruned);
                info!(kind = %self.kind, pruned, "Forgot objects deleted while not watching");
            }
            Err(error) => warn!(kind = %self.kind, error = %error, "Failed to reconcile store with listing"),
        }

        debug!(kind = %self.kind, listed, version = %listing.resource_version, "Listed objects");
        Ok(listing.resource_version)
    }

    fn track_version(&mut self, event: &WatchEvent<K>) {
        let version = match event {
            WatchEvent::Added(object) | WatchEvent::Modified(object) | WatchEvent::Deleted(object) => {
                object.meta().resource_version.clone()
            }
            WatchEvent::Bookmark(bookmark) => Some(bookmark.metadata.resource_version.clone()),
            WatchEvent::Error(_) => None,
        };
        if let Some(version) = version {
            self.resume_from = Some(version);
        }
    }

    /// Hand an admitted Added object to the handler, split by the restart boundary
    async fn apply_added(&self, object: K) -> (&'static str, Result<(), HandlerError>) {
        if self.is_preexisting(&object) {
            ("resynced", self.handler.resynced(object).await)
        } else {
            ("added", self.handler.added(object).await)
        }
    }

    async fn dispatch(&mut self, event: WatchEvent<K>) -> Option<RestartCause> {
        let (label, result) = match event {
            WatchEvent::Added(object) => match self.admit(object) {
                Some(object) => self.apply_added(object).await,
                None => return None,
            },
            WatchEvent::Modified(object) => match self.admit(object) {
                Some(object) => ("modified", self.handler.modified(object).await),
                None => return None,
            },
            WatchEvent::Deleted(object) => match self.admit(object) {
                Some(object) => ("deleted", self.handler.deleted(object).await),
                None => return None,
            },
            WatchEvent::Bookmark(_) => {
                self.metrics.inc_watch_event(&self.kind, "bookmark");
                return None;
            }
            WatchEvent::Error(status) => {
                self.metrics.inc_watch_event(&self.kind, "error");
                return Some(RestartCause::ApiError {
                    code: status.code,
                    reason: status.reason,
                    message: status.message,
                });
            }
        };

        self.metrics.inc_watch_event(&self.kind, label);
        if let Err(error) = result {
            self.log_handler_error(label, error);
        }
        None
    }

    /// Sanitize the object and apply the namespace policy
    fn admit(&self, mut object: K) -> Option<K> {
        if let Some(namespace) = object.meta().namespace.as_deref() {
            if !self.config.policy.allows(namespace) {
                return None;
            }
        }
        strip_managed_fields(&mut object);
        Some(object)
    }

    fn is_preexisting(&self, object: &K) -> bool {
        match (
            self.last_watch_event_creation_time,
            object.meta().creation_timestamp.as_ref(),
        ) {
            (Some(boundary), Some(created)) => created.0 < boundary,
            _ => false,
        }
    }

    fn mark_restart_boundary(&mut self) {
        // Creation timestamps have second precision
        self.last_watch_event_creation_time = Some(Utc::now().trunc_subsecs(0));
    }

    fn log_handler_error(&self, event: &str, error: HandlerError) {
        match error {
            HandlerError::Unknown { .. } => {
                self.metrics.inc_unresolved_event(&self.kind);
                debug!(kind = %self.kind, event, error = %error, "Dropping event for untracked object");
            }
            error => warn!(kind = %self.kind, event, error = %error, "Failed to apply watch event"),
        }
    }

    async fn set_healthy(&self) {
        if let Some(health) = &self.health {
            health.set_healthy(&components::watch(&self.kind)).await;
        }
    }

    async fn set_degraded(&self, message: String) {
        if let Some(health) = &self.health {
            health
                .set_degraded(&components::watch(&self.kind), message)
                .await;
        }
    }
}
