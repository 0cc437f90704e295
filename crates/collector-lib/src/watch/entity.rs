//! Handler for kinds stored one entity per object

use super::{async_trait, HandlerError, ResourceHandler};
use crate::models::{Entity, ObjectKey, OwnerDescriptor};
use crate::report::{ChangeKind, MicroServiceReport, NodeReport, ReportBuffer, ReportEntry, ServiceReport};
use crate::state::{ClusterState, EntityStore};
use crate::store::ChainEntry;
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{Namespace, Node, Pod, Secret, Service};
use k8s_openapi::ByteString;
use kube::Resource;
use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;

/// A resource kind tracked as plain entities
pub trait WatchedKind:
    Resource<DynamicType = ()> + Clone + PartialEq + Debug + Send + Sync + 'static
{
    /// Name used in logs and errors
    const KIND: &'static str;

    /// Reduce the object to its stored form
    fn sanitize(self) -> Self {
        self
    }

    /// Report entry for an entity, `None` for kinds tracked but not reported
    fn report(entity: &Entity<Self>) -> Option<ReportEntry>;

    fn store(state: &ClusterState) -> &Arc<EntityStore<Self>>;
}

impl WatchedKind for Node {
    const KIND: &'static str = "Node";

    fn report(entity: &Entity<Self>) -> Option<ReportEntry> {
        Some(ReportEntry::Node(NodeReport {
            id: entity.id,
            name: entity.key.name.clone(),
            node: entity.object.clone(),
        }))
    }

    fn store(state: &ClusterState) -> &Arc<EntityStore<Self>> {
        &state.nodes
    }
}

impl WatchedKind for Service {
    const KIND: &'static str = "Service";

    fn report(entity: &Entity<Self>) -> Option<ReportEntry> {
        Some(ReportEntry::Service(ServiceReport {
            id: entity.id,
            name: entity.key.name.clone(),
            namespace: entity.key.namespace.clone().unwrap_or_default(),
            service: entity.object.clone(),
        }))
    }

    fn store(state: &ClusterState) -> &Arc<EntityStore<Self>> {
        &state.services
    }
}

impl WatchedKind for Secret {
    const KIND: &'static str = "Secret";

    /// Keep the key names, drop the values
    fn sanitize(mut self) -> Self {
        if let Some(data) = self.data.as_mut() {
            data.values_mut().for_each(|value| *value = ByteString(Vec::new()));
        }
        if let Some(data) = self.string_data.as_mut() {
            data.values_mut().for_each(String::clear);
        }
        self
    }

    fn report(_: &Entity<Self>) -> Option<ReportEntry> {
        None
    }

    fn store(state: &ClusterState) -> &Arc<EntityStore<Self>> {
        &state.secrets
    }
}

impl WatchedKind for Namespace {
    const KIND: &'static str = "Namespace";

    fn report(_: &Entity<Self>) -> Option<ReportEntry> {
        None
    }

    fn store(state: &ClusterState) -> &Arc<EntityStore<Self>> {
        &state.namespaces
    }
}

/// Cron jobs are reported as microservices whose template is the job's pod template
impl WatchedKind for CronJob {
    const KIND: &'static str = "CronJob";

    fn report(entity: &Entity<Self>) -> Option<ReportEntry> {
        let template = entity
            .object
            .spec
            .as_ref()
            .and_then(|spec| spec.job_template.spec.as_ref())
            .map(|job| job.template.clone())
            .unwrap_or_default();

        Some(ReportEntry::MicroService(MicroServiceReport {
            pod_spec_id: entity.id,
            namespace: entity.key.namespace.clone().unwrap_or_default(),
            owner: OwnerDescriptor {
                name: entity.key.name.clone(),
                kind: Self::KIND.to_string(),
                raw: serde_json::to_value(&entity.object).unwrap_or_default(),
            },
            pod: Pod {
                metadata: template.metadata.unwrap_or_default(),
                spec: template.spec,
                status: None,
            },
        }))
    }

    fn store(state: &ClusterState) -> &Arc<EntityStore<Self>> {
        &state.cron_jobs
    }
}

/// Maintains one entity per cluster object, matched by name
pub struct EntityHandler<K> {
    state: Arc<ClusterState>,
    buffer: Arc<ReportBuffer>,
    _kind: std::marker::PhantomData<fn() -> K>,
}

impl<K: WatchedKind> EntityHandler<K> {
    pub fn new(state: Arc<ClusterState>, buffer: Arc<ReportBuffer>) -> Self {
        Self {
            state,
            buffer,
            _kind: std::marker::PhantomData,
        }
    }

    fn key(object: &K) -> Result<ObjectKey, HandlerError> {
        ObjectKey::of(object).ok_or(HandlerError::Unnamed { kind: K::KIND })
    }

    /// Insert or refresh an entity. Returns the change to report, if any.
    ///
    /// Unknown objects count as created only when `announce` is set; known
    /// objects are reported as updated only when their stored form changed.
    async fn upsert(&self, object: K, announce: bool) -> Result<Option<(Entity<K>, ChangeKind)>, HandlerError> {
        let object = object.sanitize();
        let key = Self::key(&object)?;
        let mut chains = K::store(&self.state).write().await;

        match chains.lookup(&key) {
            Some(id) => {
                let entity = Entity { id, key, object };
                let previous = chains.update_front(id, entity.clone())?;
                let changed = previous.map_or(true, |previous| previous.object != entity.object);
                Ok(changed.then_some((entity, ChangeKind::Updated)))
            }
            None => {
                let id = self.state.allocator.allocate();
                let entity = Entity { id, key: key.clone(), object };
                chains.init(id);
                chains.bind(key, id);
                chains.push_back(id, ChainEntry::Entity(entity.clone()))?;
                Ok(announce.then_some((entity, ChangeKind::Created)))
            }
        }
    }

    async fn publish(&self, change: Option<(Entity<K>, ChangeKind)>) {
        if let Some((entity, kind)) = change {
            if let Some(entry) = K::report(&entity) {
                self.buffer.add(entry, kind).await;
            }
        }
    }
}

#[async_trait]
impl<K: WatchedKind> ResourceHandler<K> for EntityHandler<K> {
    async fn added(&self, object: K) -> Result<(), HandlerError> {
        let change = self.upsert(object, true).await?;
        self.publish(change).await;
        Ok(())
    }

    async fn resynced(&self, object: K) -> Result<(), HandlerError> {
        let change = self.upsert(object, false).await?;
        self.publish(change).await;
        Ok(())
    }

    async fn modified(&self, object: K) -> Result<(), HandlerError> {
        let object = object.sanitize();
        let key = Self::key(&object)?;

        let entity = {
            let mut chains = K::store(&self.state).write().await;
            let Some(id) = chains.lookup(&key) else {
                return Err(HandlerError::Unknown { kind: K::KIND, key });
            };
            let entity = Entity { id, key, object };
            chains.update_front(id, entity.clone())?;
            entity
        };

        self.publish(Some((entity, ChangeKind::Updated))).await;
        Ok(())
    }

    async fn deleted(&self, object: K) -> Result<(), HandlerError> {
        let object = object.sanitize();
        let key = Self::key(&object)?;
        let id = {
            let mut chains = K::store(&self.state).write().await;
            let Some(id) = chains.unbind(&key) else {
                return Err(HandlerError::Unknown { kind: K::KIND, key });
            };
            chains.remove(id);
            id
        };
        self.state.allocator.release(id);

        self.publish(Some((Entity { id, key, object }, ChangeKind::Deleted))).await;
        Ok(())
    }

    async fn retain(&self, live: &HashSet<ObjectKey>) -> Result<usize, HandlerError> {
        let removed: Vec<Entity<K>> = {
            let mut chains = K::store(&self.state).write().await;
            let stale: Vec<ObjectKey> = chains
                .bound_keys()
                .filter(|key| !live.contains(*key))
                .cloned()
                .collect();

            let mut removed = Vec::with_capacity(stale.len());
            for key in stale {
                let Some(id) = chains.unbind(&key) else { continue };
                let head = chains
                    .remove(id)
                    .and_then(|mut chain| chain.pop_front())
                    .and_then(ChainEntry::into_entity);
                self.state.allocator.release(id);
                removed.extend(head);
            }
            removed
        };

        let count = removed.len();
        self.buffer
            .extend(removed.iter().filter_map(|entity| {
                K::report(entity).map(|entry| (entry, ChangeKind::Deleted))
            }))
            .await;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::IdAllocator;
    use crate::signal::NewDataSignal;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn setup() -> (Arc<ClusterState>, Arc<ReportBuffer>) {
        (
            Arc::new(ClusterState::new(Arc::new(IdAllocator::new()))),
            Arc::new(ReportBuffer::new(NewDataSignal::new())),
        )
    }

    fn node(name: &str, label: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(BTreeMap::from([("zone".to_string(), label.to_string())])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    async fn report(buffer: &ReportBuffer) -> serde_json::Value {
        let snapshot = buffer.snapshot().await.unwrap().unwrap();
        serde_json::from_str(snapshot.payload()).unwrap()
    }

    #[tokio::test]
    async fn test_node_lifecycle_reports() {
        let (state, buffer) = setup();
        let handler = EntityHandler::<Node>::new(state.clone(), buffer.clone());

        handler.added(node("node-1", "a")).await.unwrap();
        handler.modified(node("node-1", "b")).await.unwrap();
        handler.deleted(node("node-1", "b")).await.unwrap();

        let value = report(&buffer).await;
        assert_eq!(value["node"]["create"][0]["name"], "node-1");
        assert_eq!(value["node"]["update"][0]["node"]["metadata"]["labels"]["zone"], "b");
        assert_eq!(value["node"]["delete"][0]["id"], value["node"]["create"][0]["id"]);
        assert!(state.nodes.is_empty().await);
        assert_eq!(state.allocator.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_resync_reports_only_changes() {
        let (state, buffer) = setup();
        let handler = EntityHandler::<Node>::new(state.clone(), buffer.clone());

        handler.resynced(node("node-1", "a")).await.unwrap();
        assert!(buffer.is_empty().await);

        handler.resynced(node("node-1", "a")).await.unwrap();
        assert!(buffer.is_empty().await);

        handler.resynced(node("node-1", "b")).await.unwrap();
        let value = report(&buffer).await;
        assert_eq!(value["node"]["update"].as_array().unwrap().len(), 1);
        assert_eq!(value["node"]["create"].as_array().unwrap().len(), 0);
        assert_eq!(state.nodes.len().await, 1);
    }

    #[tokio::test]
    async fn test_repeated_add_does_not_duplicate() {
        let (state, buffer) = setup();
        let handler = EntityHandler::<Node>::new(state.clone(), buffer.clone());

        handler.added(node("node-1", "a")).await.unwrap();
        handler.added(node("node-1", "a")).await.unwrap();

        assert_eq!(state.nodes.len().await, 1);
        assert_eq!(buffer.len().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_modify_and_delete() {
        let (state, buffer) = setup();
        let handler = EntityHandler::<Node>::new(state, buffer.clone());

        let err = handler.modified(node("ghost", "a")).await.unwrap_err();
        assert!(matches!(err, HandlerError::Unknown { kind: "Node", .. }));
        let err = handler.deleted(node("ghost", "a")).await.unwrap_err();
        assert!(matches!(err, HandlerError::Unknown { .. }));
        assert!(buffer.is_empty().await);
    }

    #[tokio::test]
    async fn test_secret_is_redacted_and_not_reported() {
        let (state, buffer) = setup();
        let handler = EntityHandler::<Secret>::new(state.clone(), buffer.clone());
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some("db".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                "password".to_string(),
                ByteString(b"hunter2".to_vec()),
            )])),
            ..Default::default()
        };

        handler.added(secret).await.unwrap();

        assert!(buffer.is_empty().await);
        let ids = state.secrets.keys().await;
        let stored = state.secrets.front(ids[0]).await.unwrap();
        let data = stored.object.data.unwrap();
        assert_eq!(data["password"], ByteString(Vec::new()));
    }

    #[tokio::test]
    async fn test_cron_job_reported_as_microservice() {
        use k8s_openapi::api::batch::v1::{CronJobSpec, JobSpec, JobTemplateSpec};
        use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};

        let (state, buffer) = setup();
        let handler = EntityHandler::<CronJob>::new(state, buffer.clone());
        let cron_job = CronJob {
            metadata: ObjectMeta {
                name: Some("backup".to_string()),
                namespace: Some("ops".to_string()),
                ..Default::default()
            },
            spec: Some(CronJobSpec {
                schedule: "0 * * * *".to_string(),
                job_template: JobTemplateSpec {
                    spec: Some(JobSpec {
                        template: PodTemplateSpec {
                            spec: Some(PodSpec {
                                containers: vec![Container {
                                    name: "backup".to_string(),
                                    image: Some("restic".to_string()),
                                    ..Default::default()
                                }],
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        };

        handler.added(cron_job).await.unwrap();

        let value = report(&buffer).await;
        let created = &value["microservice"]["create"][0];
        assert_eq!(created["owner"]["kind"], "CronJob");
        assert_eq!(created["owner"]["name"], "backup");
        assert_eq!(created["namespace"], "ops");
        assert_eq!(created["pod"]["spec"]["containers"][0]["image"], "restic");
    }

    #[tokio::test]
    async fn test_retain_forgets_and_reports_missing_objects() {
        let (state, buffer) = setup();
        let handler = EntityHandler::<Node>::new(state.clone(), buffer.clone());
        handler.resynced(node("node-1", "a")).await.unwrap();
        handler.resynced(node("node-2", "a")).await.unwrap();

        let live = HashSet::from([ObjectKey::new(None, "node-2")]);
        assert_eq!(handler.retain(&live).await.unwrap(), 1);
        assert_eq!(handler.retain(&live).await.unwrap(), 0);

        let value = report(&buffer).await;
        assert_eq!(value["node"]["delete"].as_array().unwrap().len(), 1);
        assert_eq!(value["node"]["delete"][0]["name"], "node-1");
        assert_eq!(state.nodes.len().await, 1);
        assert_eq!(state.allocator.outstanding(), 1);

        // The forgotten key is free to be created again
        handler.added(node("node-1", "b")).await.unwrap();
        assert_eq!(state.nodes.len().await, 2);
    }
}
