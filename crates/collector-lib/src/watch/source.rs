//! Watch streams backed by the Kubernetes API

use super::{async_trait, EventSource, EventStream, Listing, WatchError};
use futures::{StreamExt, TryStreamExt};
use kube::api::{Api, ListParams, WatchParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use std::fmt::Debug;

/// Cluster-wide watch of one resource kind
pub struct KubeEventSource<K> {
    api: Api<K>,
    params: WatchParams,
}

impl<K> KubeEventSource<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    pub fn new(api: Api<K>) -> Self {
        Self {
            api,
            params: WatchParams::default(),
        }
    }

    /// Watch across all namespaces (or the cluster scope for cluster-level kinds)
    pub fn all(client: Client) -> Self {
        Self::new(Api::all(client))
    }
}

#[async_trait]
impl<K> EventSource<K> for KubeEventSource<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    async fn list(&self) -> Result<Listing<K>, WatchError> {
        let list = self
            .api
            .list(&ListParams::default())
            .await
            .map_err(WatchError::List)?;

        Ok(Listing {
            // Without a version the watch falls back to "0", which replays
            // every live object as Added
            resource_version: list
                .metadata
                .resource_version
                .filter(|version| !version.is_empty())
                .unwrap_or_else(|| "0".to_string()),
            objects: list.items,
        })
    }

    async fn watch(&self, resource_version: &str) -> Result<EventStream<K>, WatchError> {
        let stream = self
            .api
            .watch(&self.params, resource_version)
            .await
            .map_err(WatchError::Connect)?;

        Ok(stream.map_err(WatchError::Stream).boxed())
    }
}
