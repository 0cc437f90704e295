//! Pod to microservice correlation
//!
//! Pods with structurally equal container lists form one microservice. The
//! microservice chain in the pod store holds the microservice as its head and
//! one membership record per live pod after it.
//!
//! Grouping is by container list only. Two workloads with identical
//! containers share one microservice, owned by whichever was seen first.
//! Find-or-create runs under the pod store's write lock, so concurrent
//! handlers can never create two microservices for one container list.
//!
//! The store index maps each pod key to its microservice, so locating a pod
//! scans only that microservice's chain.

use crate::ids::CorrelationId;
use crate::models::{containers, MicroService, ObjectKey, PodMembership};
use crate::observability::CollectorMetrics;
use crate::owner::OwnerResolver;
use crate::report::{ChangeKind, MicroServiceReport, PodReport, ReportBuffer, ReportEntry};
use crate::state::ClusterState;
use crate::store::{ChainEntry, Chains, StoreError};
use crate::watch::{async_trait, HandlerError, ResourceHandler};
use k8s_openapi::api::core::v1::Pod;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

const KIND: &str = "Pod";

type PodChains = Chains<MicroService, PodMembership>;

/// [`ResourceHandler`] for the pod watch loop
pub struct PodCorrelator {
    state: Arc<ClusterState>,
    buffer: Arc<ReportBuffer>,
    owners: OwnerResolver,
    metrics: CollectorMetrics,
}

/// Report entries produced while the store lock was held
type Changes = Vec<(ReportEntry, ChangeKind)>;

impl PodCorrelator {
    pub fn new(state: Arc<ClusterState>, buffer: Arc<ReportBuffer>, owners: OwnerResolver) -> Self {
        Self {
            state,
            buffer,
            owners,
            metrics: CollectorMetrics::new(),
        }
    }

    fn key(pod: &Pod) -> Result<ObjectKey, HandlerError> {
        ObjectKey::of(pod).ok_or(HandlerError::Unnamed { kind: KIND })
    }

    /// Add a pod to its microservice, creating the microservice if needed
    ///
    /// With `announce` unset only placement changes of already known pods
    /// are reported.
    async fn attach(&self, pod: Pod, announce: bool) -> Result<(), HandlerError> {
        let key = Self::key(&pod)?;

        let known = locate(&*self.state.pods.read().await, &key).is_some();
        let changes = if known {
            self.place(&pod, &key).await?
        } else {
            // Owner lookups hit the API server; no store lock is held
            let owner = self.owners.resolve(&pod).await;
            let mut chains = self.state.pods.write().await;

            match locate(&chains, &key) {
                Some(position) => refresh_placement(&mut chains, position, &pod)?,
                None => {
                    let (id, created) = match chains
                        .find(|service| service.containers() == containers(&pod))
                        .map(|(id, _)| id)
                    {
                        Some(id) => (id, None),
                        None => {
                            let id = self.state.allocator.allocate();
                            let mut template = pod.clone();
                            template.status = None;
                            let service = MicroService {
                                pod_spec_id: id,
                                namespace: key.namespace.clone().unwrap_or_default(),
                                owner: owner.clone(),
                                template,
                            };
                            chains.init(id);
                            chains.push_back(id, ChainEntry::Entity(service.clone()))?;
                            debug!(id = %id, owner = %owner.name, kind = %owner.kind, "New microservice");
                            (id, Some(service))
                        }
                    };

                    let membership = PodMembership::new(&pod, &key, owner.reference());
                    chains.push_back(id, ChainEntry::Membership(membership))?;
                    chains.bind(key.clone(), id);
                    let membership = refresh_running(&mut chains, id, &key)?;

                    let mut changes = Changes::new();
                    if let Some(service) = created {
                        changes.push((
                            ReportEntry::MicroService(MicroServiceReport::from(&service)),
                            ChangeKind::Created,
                        ));
                    }
                    changes.push((ReportEntry::Pod(PodReport::new(id, &membership)), ChangeKind::Created));
                    self.metrics.set_microservices_tracked(chains.len());
                    changes
                }
            }
        };

        if announce || known {
            self.buffer.extend(changes).await;
        }
        Ok(())
    }

    /// Refresh a known pod's placement; reports only when it changed
    async fn place(&self, pod: &Pod, key: &ObjectKey) -> Result<Changes, HandlerError> {
        let mut chains = self.state.pods.write().await;
        match locate(&chains, key) {
            Some(position) => refresh_placement(&mut chains, position, pod),
            None => Ok(Changes::new()),
        }
    }

    /// Remove a pod's membership, and its microservice with the last member
    fn detach(&self, chains: &mut PodChains, key: ObjectKey) -> Result<Changes, HandlerError> {
        let Some((id, index)) = locate(chains, &key) else {
            return Err(HandlerError::Unknown { kind: KIND, key });
        };
        chains.unbind(&key);

        let chain = chains
            .chain_mut(id)
            .ok_or(StoreError::MissingChain { kind: "microservice", id })?;
        let removed = chain.remove(index).and_then(|entry| match entry {
            ChainEntry::Membership(member) => Some(member),
            ChainEntry::Entity(_) => None,
        });
        let Some(mut membership) = removed else {
            return Err(StoreError::MissingChain { kind: "microservice", id }.into());
        };

        let remaining = chain.iter().filter(|entry| entry.as_membership().is_some()).count();
        for member in chain.iter_mut().filter_map(ChainEntry::as_membership_mut) {
            member.running = remaining;
        }
        membership.running = remaining;

        let mut changes = vec![(ReportEntry::Pod(PodReport::new(id, &membership)), ChangeKind::Deleted)];
        if remaining == 0 {
            if let Some(chain) = chains.remove(id) {
                if let Some(service) = chain.front().and_then(ChainEntry::as_entity) {
                    changes.push((
                        ReportEntry::MicroService(MicroServiceReport::from(service)),
                        ChangeKind::Deleted,
                    ));
                }
            }
            self.state.allocator.release(id);
            debug!(id = %id, "Last pod gone, microservice removed");
        }
        self.metrics.set_microservices_tracked(chains.len());
        Ok(changes)
    }
}

/// Position of a pod's membership: microservice id and chain index
fn locate(chains: &PodChains, key: &ObjectKey) -> Option<(CorrelationId, usize)> {
    let id = chains.lookup(key)?;
    chains
        .chain(id)?
        .iter()
        .position(|entry| entry.as_membership().is_some_and(|member| member.matches(key)))
        .map(|index| (id, index))
}

fn membership_mut(
    chains: &mut PodChains,
    (id, index): (CorrelationId, usize),
) -> Result<&mut PodMembership, StoreError> {
    chains
        .chain_mut(id)
        .and_then(|chain| chain.get_mut(index))
        .and_then(ChainEntry::as_membership_mut)
        .ok_or(StoreError::MissingChain { kind: "microservice", id })
}

fn refresh_placement(
    chains: &mut PodChains,
    position: (CorrelationId, usize),
    pod: &Pod,
) -> Result<Changes, HandlerError> {
    let membership = membership_mut(chains, position)?;
    if !membership.place(pod) {
        return Ok(Changes::new());
    }
    Ok(vec![(
        ReportEntry::Pod(PodReport::new(position.0, membership)),
        ChangeKind::Updated,
    )])
}

/// Set every member's running count to the chain's membership count and
/// return the membership for `key`
fn refresh_running(chains: &mut PodChains, id: CorrelationId, key: &ObjectKey) -> Result<PodMembership, StoreError> {
    let missing = StoreError::MissingChain { kind: "microservice", id };
    let chain = chains.chain_mut(id).ok_or(missing.clone())?;

    let running = chain.iter().filter(|entry| entry.as_membership().is_some()).count();
    let mut found = None;
    for member in chain.iter_mut().filter_map(ChainEntry::as_membership_mut) {
        member.running = running;
        if member.matches(key) {
            found = Some(member.clone());
        }
    }
    found.ok_or(missing)
}

#[async_trait]
impl ResourceHandler<Pod> for PodCorrelator {
    async fn added(&self, pod: Pod) -> Result<(), HandlerError> {
        self.attach(pod, true).await
    }

    async fn resynced(&self, pod: Pod) -> Result<(), HandlerError> {
        self.attach(pod, false).await
    }

    async fn modified(&self, pod: Pod) -> Result<(), HandlerError> {
        let key = Self::key(&pod)?;
        let changes = {
            let mut chains = self.state.pods.write().await;
            let Some(position) = locate(&chains, &key) else {
                return Err(HandlerError::Unknown { kind: KIND, key });
            };
            let membership = membership_mut(&mut chains, position)?;
            membership.place(&pod);
            vec![(
                ReportEntry::Pod(PodReport::new(position.0, membership)),
                ChangeKind::Updated,
            )]
        };

        self.buffer.extend(changes).await;
        Ok(())
    }

    async fn deleted(&self, pod: Pod) -> Result<(), HandlerError> {
        let key = Self::key(&pod)?;
        let changes = {
            let mut chains = self.state.pods.write().await;
            self.detach(&mut chains, key)?
        };

        self.buffer.extend(changes).await;
        Ok(())
    }

    async fn retain(&self, live: &HashSet<ObjectKey>) -> Result<usize, HandlerError> {
        let (pruned, changes) = {
            let mut chains = self.state.pods.write().await;
            let stale: Vec<ObjectKey> = chains
                .bound_keys()
                .filter(|key| !live.contains(*key))
                .cloned()
                .collect();

            let mut pruned = 0;
            let mut changes = Changes::new();
            for key in stale {
                match self.detach(&mut chains, key) {
                    Ok(detached) => {
                        pruned += 1;
                        changes.extend(detached);
                    }
                    Err(error) => warn!(error = %error, "Failed to forget pod"),
                }
            }
            (pruned, changes)
        };

        self.buffer.extend(changes).await;
        Ok(pruned)
    }
}
