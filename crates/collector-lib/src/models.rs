//! Core data models for the cluster collector

use crate::ids::CorrelationId;
use k8s_openapi::api::core::v1::{Container, Pod};
use kube::Resource;
use serde::Serialize;
use std::fmt;

/// Identity of a cluster object across watch events
///
/// Objects are matched by name, falling back to `generateName` for objects
/// the API server has not named yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ObjectKey {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.map(str::to_string),
            name: name.into(),
        }
    }

    pub fn of<K: Resource>(object: &K) -> Option<Self> {
        let meta = object.meta();
        let name = meta.name.clone().or_else(|| meta.generate_name.clone())?;
        Some(Self {
            namespace: meta.namespace.clone(),
            name,
        })
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{}/{}", namespace, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Drop `metadata.managedFields`; they are large and carry nothing the reports need
pub fn strip_managed_fields<K: Resource>(object: &mut K) {
    object.meta_mut().managed_fields = None;
}

/// Containers of a pod, empty when the pod has no spec
pub fn containers(pod: &Pod) -> &[Container] {
    pod.spec
        .as_ref()
        .map(|spec| spec.containers.as_slice())
        .unwrap_or(&[])
}

/// Name and kind of a workload controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OwnerRef {
    pub name: String,
    pub kind: String,
}

/// Top-level controller that owns a group of pods
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OwnerDescriptor {
    pub name: String,
    pub kind: String,
    /// Controller object as last read from the API, managed fields stripped
    #[serde(rename = "object")]
    pub raw: serde_json::Value,
}

impl OwnerDescriptor {
    pub fn reference(&self) -> OwnerRef {
        OwnerRef {
            name: self.name.clone(),
            kind: self.kind.clone(),
        }
    }
}

/// A logical workload: every pod sharing one container specification
#[derive(Debug, Clone, PartialEq)]
pub struct MicroService {
    pub pod_spec_id: CorrelationId,
    pub namespace: String,
    pub owner: OwnerDescriptor,
    /// First pod observed with this container list, status removed
    pub template: Pod,
}

impl MicroService {
    pub fn containers(&self) -> &[Container] {
        containers(&self.template)
    }
}

/// One running replica of a microservice
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodMembership {
    pub name: String,
    pub namespace: String,
    pub node_name: Option<String>,
    pub pod_ip: Option<String>,
    pub owner: OwnerRef,
    /// Live memberships under the same microservice
    pub running: usize,
}

impl PodMembership {
    pub fn new(pod: &Pod, key: &ObjectKey, owner: OwnerRef) -> Self {
        let mut membership = Self {
            name: key.name.clone(),
            namespace: key.namespace.clone().unwrap_or_default(),
            node_name: None,
            pod_ip: None,
            owner,
            running: 0,
        };
        membership.place(pod);
        membership
    }

    pub fn matches(&self, key: &ObjectKey) -> bool {
        self.name == key.name && Some(self.namespace.as_str()) == key.namespace.as_deref()
    }

    /// Refresh node and IP from a newer pod revision. Returns true if either changed.
    pub fn place(&mut self, pod: &Pod) -> bool {
        let node_name = pod.spec.as_ref().and_then(|spec| spec.node_name.clone());
        let pod_ip = pod.status.as_ref().and_then(|status| status.pod_ip.clone());
        let changed = node_name != self.node_name || pod_ip != self.pod_ip;
        self.node_name = node_name;
        self.pod_ip = pod_ip;
        changed
    }
}

/// Stored form of a non-pod cluster object
#[derive(Debug, Clone, PartialEq)]
pub struct Entity<K> {
    pub id: CorrelationId,
    pub key: ObjectKey,
    pub object: K,
}
