//! Pod owner resolution
//!
//! Owners are resolved with a fixed two-level rule:
//!
//! - Pod → ReplicaSet → Deployment. When the ReplicaSet has no controller
//!   reference, the Deployments of its namespace are matched by selector.
//!   Without a match the ReplicaSet itself is the owner.
//! - Any other controller (DaemonSet, StatefulSet, Job, CronJob, ...) owns
//!   the pod directly. A Job created by a CronJob resolves to the Job.
//! - A pod without a controller reference owns itself with kind `Pod`.

use crate::models::{strip_managed_fields, OwnerDescriptor};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector, LabelSelectorRequirement, ObjectMeta, OwnerReference,
};
use kube::api::{Api, ListParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, warn};

/// Read access to workload controllers
#[async_trait]
pub trait OwnerLookup: Send + Sync {
    async fn replica_set(&self, namespace: &str, name: &str) -> Result<Option<ReplicaSet>, kube::Error>;

    async fn deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>, kube::Error>;

    async fn deployments(&self, namespace: &str) -> Result<Vec<Deployment>, kube::Error>;

    /// Any other controller kind as raw JSON; `None` if absent or the kind is not supported
    async fn controller(
        &self,
        namespace: &str,
        kind: &str,
        name: &str,
    ) -> Result<Option<serde_json::Value>, kube::Error>;
}

/// [`OwnerLookup`] over the Kubernetes API
#[derive(Clone)]
pub struct KubeOwnerLookup {
    client: Client,
}

impl KubeOwnerLookup {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn get_raw<K>(&self, namespace: &str, name: &str) -> Result<Option<serde_json::Value>, kube::Error>
    where
        K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        match api.get_opt(name).await? {
            Some(mut object) => {
                strip_managed_fields(&mut object);
                serde_json::to_value(&object)
                    .map(Some)
                    .map_err(kube::Error::SerdeError)
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl OwnerLookup for KubeOwnerLookup {
    async fn replica_set(&self, namespace: &str, name: &str) -> Result<Option<ReplicaSet>, kube::Error> {
        Api::namespaced(self.client.clone(), namespace).get_opt(name).await
    }

    async fn deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>, kube::Error> {
        Api::namespaced(self.client.clone(), namespace).get_opt(name).await
    }

    async fn deployments(&self, namespace: &str) -> Result<Vec<Deployment>, kube::Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn controller(
        &self,
        namespace: &str,
        kind: &str,
        name: &str,
    ) -> Result<Option<serde_json::Value>, kube::Error> {
        match kind {
            "DaemonSet" => self.get_raw::<DaemonSet>(namespace, name).await,
            "StatefulSet" => self.get_raw::<StatefulSet>(namespace, name).await,
            "Job" => self.get_raw::<Job>(namespace, name).await,
            "CronJob" => self.get_raw::<CronJob>(namespace, name).await,
            "ReplicaSet" => self.get_raw::<ReplicaSet>(namespace, name).await,
            "Deployment" => self.get_raw::<Deployment>(namespace, name).await,
            _ => Ok(None),
        }
    }
}

/// Resolves the top-level controller of a pod
#[derive(Clone)]
pub struct OwnerResolver {
    lookup: Arc<dyn OwnerLookup>,
}

impl OwnerResolver {
    pub fn new(lookup: Arc<dyn OwnerLookup>) -> Self {
        Self { lookup }
    }

    /// Never fails: lookup errors degrade to a descriptor without the raw object
    pub async fn resolve(&self, pod: &Pod) -> OwnerDescriptor {
        let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");

        let Some(reference) = controller_of(&pod.metadata) else {
            let mut object = pod.clone();
            object.status = None;
            return describe("Pod", object.metadata.name.clone().unwrap_or_default(), &object);
        };

        match reference.kind.as_str() {
            "ReplicaSet" => self.through_replica_set(namespace, &reference.name).await,
            kind => {
                let raw = match self.lookup.controller(namespace, kind, &reference.name).await {
                    Ok(raw) => raw.unwrap_or_default(),
                    Err(error) => {
                        warn!(kind, name = %reference.name, error = %error, "Owner lookup failed");
                        serde_json::Value::Null
                    }
                };
                OwnerDescriptor {
                    name: reference.name.clone(),
                    kind: kind.to_string(),
                    raw,
                }
            }
        }
    }

    async fn through_replica_set(&self, namespace: &str, name: &str) -> OwnerDescriptor {
        let replica_set = match self.lookup.replica_set(namespace, name).await {
            Ok(Some(replica_set)) => replica_set,
            Ok(None) => return bare("ReplicaSet", name),
            Err(error) => {
                warn!(namespace, name, error = %error, "ReplicaSet lookup failed");
                return bare("ReplicaSet", name);
            }
        };

        match controller_of(&replica_set.metadata) {
            Some(owner) if owner.kind == "Deployment" => {
                match self.lookup.deployment(namespace, &owner.name).await {
                    Ok(Some(deployment)) => describe("Deployment", owner.name.clone(), &deployment),
                    Ok(None) => bare("Deployment", &owner.name),
                    Err(error) => {
                        warn!(namespace, name = %owner.name, error = %error, "Deployment lookup failed");
                        bare("Deployment", &owner.name)
                    }
                }
            }
            Some(owner) => bare(&owner.kind, &owner.name),
            None => match self.matching_deployment(namespace, &replica_set).await {
                Some(deployment) => {
                    let name = deployment.metadata.name.clone().unwrap_or_default();
                    describe("Deployment", name, &deployment)
                }
                None => describe("ReplicaSet", name.to_string(), &replica_set),
            },
        }
    }

    async fn matching_deployment(&self, namespace: &str, replica_set: &ReplicaSet) -> Option<Deployment> {
        let labels = replica_set.metadata.labels.as_ref()?;
        let deployments = match self.lookup.deployments(namespace).await {
            Ok(deployments) => deployments,
            Err(error) => {
                warn!(namespace, error = %error, "Deployment list failed");
                return None;
            }
        };

        let found = deployments.into_iter().find(|deployment| {
            deployment
                .spec
                .as_ref()
                .is_some_and(|spec| selector_matches(&spec.selector, labels))
        });
        debug!(namespace, matched = found.is_some(), "Resolved orphan ReplicaSet by selector");
        found
    }
}

/// The controller reference, or the first owner reference when none is marked
fn controller_of(meta: &ObjectMeta) -> Option<&OwnerReference> {
    let references = meta.owner_references.as_deref()?;
    references
        .iter()
        .find(|reference| reference.controller == Some(true))
        .or_else(|| references.first())
}

fn describe<K: Resource + Serialize + Clone>(kind: &str, name: String, object: &K) -> OwnerDescriptor {
    let mut object = object.clone();
    strip_managed_fields(&mut object);
    OwnerDescriptor {
        name,
        kind: kind.to_string(),
        raw: serde_json::to_value(&object).unwrap_or_default(),
    }
}

fn bare(kind: &str, name: &str) -> OwnerDescriptor {
    OwnerDescriptor {
        name: name.to_string(),
        kind: kind.to_string(),
        raw: serde_json::Value::Null,
    }
}

/// Label selector semantics; an empty selector selects nothing
pub fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    let match_labels = selector.match_labels.as_ref().filter(|m| !m.is_empty());
    let expressions = selector.match_expressions.as_deref().unwrap_or_default();
    if match_labels.is_none() && expressions.is_empty() {
        return false;
    }

    let labels_ok = match_labels.map_or(true, |wanted| {
        wanted
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
    });
    labels_ok && expressions.iter().all(|req| requirement_matches(req, labels))
}

fn requirement_matches(requirement: &LabelSelectorRequirement, labels: &BTreeMap<String, String>) -> bool {
    let values = requirement.values.as_deref().unwrap_or_default();
    let actual = labels.get(&requirement.key);
    match requirement.operator.as_str() {
        "In" => actual.is_some_and(|value| values.contains(value)),
        "NotIn" => actual.map_or(true, |value| !values.contains(value)),
        "Exists" => actual.is_some(),
        "DoesNotExist" => actual.is_none(),
        _ => false,
    }
}
