//! Fixtures and fakes shared by unit tests

use crate::owner::OwnerLookup;
use crate::watch::{async_trait, EventSource, EventStream, Listing, WatchError};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time};
use kube::api::WatchEvent;
use kube::core::ErrorResponse;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Pod in `default` on `node-1` running a single container of `image`
pub fn pod(name: &str, image: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: image.to_string(),
                image: Some(image.to_string()),
                ..Default::default()
            }],
            node_name: Some("node-1".to_string()),
            ..Default::default()
        }),
        status: Some(PodStatus {
            pod_ip: Some("10.0.0.5".to_string()),
            ..Default::default()
        }),
    }
}

pub fn created_at(mut pod: Pod, time: DateTime<Utc>) -> Pod {
    pod.metadata.creation_timestamp = Some(Time(time));
    pod
}

pub fn owned_by(kind: &str, name: &str) -> OwnerReference {
    OwnerReference {
        api_version: "apps/v1".to_string(),
        kind: kind.to_string(),
        name: name.to_string(),
        uid: format!("uid-{name}"),
        controller: Some(true),
        ..Default::default()
    }
}

/// In-memory owner lookups
#[derive(Default)]
pub struct StaticOwners {
    replica_sets: Vec<ReplicaSet>,
    deployments: Vec<Deployment>,
}

impl StaticOwners {
    pub fn with_replica_set(mut self, replica_set: ReplicaSet) -> Self {
        self.replica_sets.push(replica_set);
        self
    }

    pub fn with_deployment(mut self, deployment: Deployment) -> Self {
        self.deployments.push(deployment);
        self
    }
}

fn named<'a, K: kube::Resource>(items: &'a [K], name: &str) -> Option<&'a K> {
    items
        .iter()
        .find(|item| item.meta().name.as_deref() == Some(name))
}

#[async_trait]
impl OwnerLookup for StaticOwners {
    async fn replica_set(&self, _: &str, name: &str) -> Result<Option<ReplicaSet>, kube::Error> {
        Ok(named(&self.replica_sets, name).cloned())
    }

    async fn deployment(&self, _: &str, name: &str) -> Result<Option<Deployment>, kube::Error> {
        Ok(named(&self.deployments, name).cloned())
    }

    async fn deployments(&self, _: &str) -> Result<Vec<Deployment>, kube::Error> {
        Ok(self.deployments.clone())
    }

    async fn controller(&self, _: &str, _: &str, _: &str) -> Result<Option<serde_json::Value>, kube::Error> {
        Ok(None)
    }
}

/// One scripted outcome of [`EventSource::watch`]
pub enum Script<K> {
    /// Opening the watch fails
    Refuse,
    /// The watch yields these events, then ends
    Events(Vec<Result<WatchEvent<K>, WatchError>>),
    /// The watch yields these events, then stays open without further events
    Hold(Vec<WatchEvent<K>>),
}

/// Event source replaying scripts in order
///
/// Each list call returns the next scripted listing, or nothing once they
/// run out; each watch holds forever once the scripts run out. Listings are
/// versioned `list-1`, `list-2` and so on.
pub struct ScriptedSource<K> {
    listings: Mutex<VecDeque<Vec<K>>>,
    scripts: Mutex<VecDeque<Script<K>>>,
    lists: Mutex<usize>,
    watched_from: Mutex<Vec<String>>,
}

impl<K> ScriptedSource<K> {
    pub fn new(scripts: impl IntoIterator<Item = Script<K>>) -> Self {
        Self {
            listings: Mutex::new(VecDeque::new()),
            scripts: Mutex::new(scripts.into_iter().collect()),
            lists: Mutex::new(0),
            watched_from: Mutex::new(Vec::new()),
        }
    }

    pub fn with_listings(self, listings: impl IntoIterator<Item = Vec<K>>) -> Self {
        *self.listings.lock().unwrap() = listings.into_iter().collect();
        self
    }

    /// Number of list calls so far
    pub fn lists(&self) -> usize {
        *self.lists.lock().unwrap()
    }

    /// Resource version passed to each watch call, in order
    pub fn watched_from(&self) -> Vec<String> {
        self.watched_from.lock().unwrap().clone()
    }
}

pub fn api_failure(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("scripted {reason}"),
        reason: reason.to_string(),
        code,
    })
}

pub fn stream_error() -> WatchError {
    WatchError::Stream(api_failure(500, "InternalError"))
}

#[async_trait]
impl<K: Send + 'static> EventSource<K> for ScriptedSource<K> {
    async fn list(&self) -> Result<Listing<K>, WatchError> {
        let objects = self.listings.lock().unwrap().pop_front().unwrap_or_default();
        let mut lists = self.lists.lock().unwrap();
        *lists += 1;
        Ok(Listing {
            objects,
            resource_version: format!("list-{lists}"),
        })
    }

    async fn watch(&self, resource_version: &str) -> Result<EventStream<K>, WatchError> {
        self.watched_from
            .lock()
            .unwrap()
            .push(resource_version.to_string());
        let next = self.scripts.lock().unwrap().pop_front();
        match next {
            Some(Script::Refuse) => Err(WatchError::Connect(api_failure(503, "ServiceUnavailable"))),
            Some(Script::Events(events)) => Ok(futures::stream::iter(events).boxed()),
            Some(Script::Hold(events)) => Ok(futures::stream::iter(events.into_iter().map(Ok))
                .chain(futures::stream::pending())
                .boxed()),
            None => Ok(futures::stream::pending().boxed()),
        }
    }
}
