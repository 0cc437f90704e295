//! The in-memory cluster model shared by all watch loops

use crate::ids::IdAllocator;
use crate::models::{Entity, MicroService, PodMembership};
use crate::store::ResourceStore;
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{Namespace, Node, Secret, Service};
use serde::Serialize;
use std::sync::Arc;

/// Microservice chains: head is the microservice, members are its pods
pub type PodStore = ResourceStore<MicroService, PodMembership>;

pub type EntityStore<K> = ResourceStore<Entity<K>>;

/// One store per resource kind plus the allocator they draw ids from
pub struct ClusterState {
    pub allocator: Arc<IdAllocator>,
    pub pods: Arc<PodStore>,
    pub nodes: Arc<EntityStore<Node>>,
    pub services: Arc<EntityStore<Service>>,
    pub secrets: Arc<EntityStore<Secret>>,
    pub namespaces: Arc<EntityStore<Namespace>>,
    pub cron_jobs: Arc<EntityStore<CronJob>>,
}

/// Entity counts per store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StateSummary {
    pub microservices: usize,
    pub pods: usize,
    pub nodes: usize,
    pub services: usize,
    pub secrets: usize,
    pub namespaces: usize,
    pub cron_jobs: usize,
    pub ids_outstanding: usize,
}

impl ClusterState {
    pub fn new(allocator: Arc<IdAllocator>) -> Self {
        Self {
            allocator,
            pods: Arc::new(ResourceStore::new("microservice")),
            nodes: Arc::new(ResourceStore::new("node")),
            services: Arc::new(ResourceStore::new("service")),
            secrets: Arc::new(ResourceStore::new("secret")),
            namespaces: Arc::new(ResourceStore::new("namespace")),
            cron_jobs: Arc::new(ResourceStore::new("cronjob")),
        }
    }

    /// Counts are read one store at a time and may be mutually inconsistent
    pub async fn summary(&self) -> StateSummary {
        let (microservices, pods) = {
            let chains = self.pods.read().await;
            (chains.len(), chains.membership_count())
        };

        StateSummary {
            microservices,
            pods,
            nodes: self.nodes.len().await,
            services: self.services.len().await,
            secrets: self.secrets.len().await,
            namespaces: self.namespaces.len().await,
            cron_jobs: self.cron_jobs.len().await,
            ids_outstanding: self.allocator.outstanding(),
        }
    }
}
