//! Report entry payloads
//!
//! Field names follow the wire format consumed by the aggregation endpoint.

use crate::ids::CorrelationId;
use crate::models::{MicroService, OwnerDescriptor, OwnerRef, PodMembership};
use k8s_openapi::api::core::v1::{Node, Pod, Service};
use serde::Serialize;

/// What happened to an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Created => "create",
            ChangeKind::Updated => "update",
            ChangeKind::Deleted => "delete",
        }
    }
}

/// Top-level bucket a report entry lands in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Node,
    Service,
    MicroService,
    Pod,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeReport {
    pub id: CorrelationId,
    pub name: String,
    pub node: Node,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceReport {
    pub id: CorrelationId,
    pub name: String,
    pub namespace: String,
    pub service: Service,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MicroServiceReport {
    pub pod_spec_id: CorrelationId,
    pub namespace: String,
    pub owner: OwnerDescriptor,
    pub pod: Pod,
}

impl From<&MicroService> for MicroServiceReport {
    fn from(service: &MicroService) -> Self {
        Self {
            pod_spec_id: service.pod_spec_id,
            namespace: service.namespace.clone(),
            owner: service.owner.clone(),
            pod: service.template.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodReport {
    pub pod_spec_id: CorrelationId,
    pub name: String,
    pub node_name: Option<String>,
    #[serde(rename = "podIP")]
    pub pod_ip: Option<String>,
    pub namespace: String,
    pub owner: OwnerRef,
    pub number_of_running_pods: usize,
}

impl PodReport {
    pub fn new(pod_spec_id: CorrelationId, membership: &PodMembership) -> Self {
        Self {
            pod_spec_id,
            name: membership.name.clone(),
            node_name: membership.node_name.clone(),
            pod_ip: membership.pod_ip.clone(),
            namespace: membership.namespace.clone(),
            owner: membership.owner.clone(),
            number_of_running_pods: membership.running,
        }
    }
}

/// One change destined for the report
#[derive(Debug, Clone, PartialEq)]
pub enum ReportEntry {
    Node(NodeReport),
    Service(ServiceReport),
    MicroService(MicroServiceReport),
    Pod(PodReport),
}

impl ReportEntry {
    pub fn category(&self) -> Category {
        match self {
            ReportEntry::Node(_) => Category::Node,
            ReportEntry::Service(_) => Category::Service,
            ReportEntry::MicroService(_) => Category::MicroService,
            ReportEntry::Pod(_) => Category::Pod,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pod_report_wire_names() {
        let membership = PodMembership {
            name: "nginx-abc".to_string(),
            namespace: "default".to_string(),
            node_name: Some("node-1".to_string()),
            pod_ip: Some("10.0.0.5".to_string()),
            owner: OwnerRef {
                name: "nginx".to_string(),
                kind: "Deployment".to_string(),
            },
            running: 2,
        };
        let value = serde_json::to_value(PodReport::new(CorrelationId::from(4), &membership)).unwrap();

        assert_eq!(value["podSpecId"], 4);
        assert_eq!(value["nodeName"], "node-1");
        assert_eq!(value["podIP"], "10.0.0.5");
        assert_eq!(value["numberOfRunningPods"], 2);
        assert_eq!(value["owner"]["kind"], "Deployment");
    }

    #[test]
    fn test_entry_category() {
        let entry = ReportEntry::Node(NodeReport {
            id: CorrelationId::from(1),
            name: "node-1".to_string(),
            node: Node::default(),
        });
        assert_eq!(entry.category(), Category::Node);
        assert_eq!(ChangeKind::Deleted.as_str(), "delete");
    }
}
