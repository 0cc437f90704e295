//! Per-kind resource storage
//!
//! A store maps correlation ids to ordered version chains. The head of a
//! chain is the authoritative entity; for pods the remaining elements are the
//! per-replica membership records of that microservice.
//!
//! Every store instance owns exactly one reader/writer lock. Single
//! operations take it for their full duration; read-modify-write sequences
//! hold a guard from [`ResourceStore::read`] or [`ResourceStore::write`],
//! which expose the same operations on [`Chains`].
//!
//! Each store also keeps an index from object key to the chain holding that
//! object. Handlers bind a key when the object enters a chain and unbind it
//! when the object leaves.

use crate::ids::CorrelationId;
use crate::models::ObjectKey;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::convert::Infallible;
use thiserror::Error;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// One element of a version chain
#[derive(Debug, Clone, PartialEq)]
pub enum ChainEntry<E, M> {
    Entity(E),
    Membership(M),
}

impl<E, M> ChainEntry<E, M> {
    pub fn as_entity(&self) -> Option<&E> {
        match self {
            ChainEntry::Entity(entity) => Some(entity),
            ChainEntry::Membership(_) => None,
        }
    }

    pub fn as_membership(&self) -> Option<&M> {
        match self {
            ChainEntry::Membership(member) => Some(member),
            ChainEntry::Entity(_) => None,
        }
    }

    pub fn as_membership_mut(&mut self) -> Option<&mut M> {
        match self {
            ChainEntry::Membership(member) => Some(member),
            ChainEntry::Entity(_) => None,
        }
    }

    pub fn into_entity(self) -> Option<E> {
        match self {
            ChainEntry::Entity(entity) => Some(entity),
            ChainEntry::Membership(_) => None,
        }
    }
}

pub type Chain<E, M> = VecDeque<ChainEntry<E, M>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("{kind} store has no chain for id {id}")]
    MissingChain { kind: &'static str, id: CorrelationId },
}

/// The unlocked chain map behind a [`ResourceStore`]
///
/// Iteration is in ascending id order.
#[derive(Debug)]
pub struct Chains<E, M> {
    kind: &'static str,
    chains: BTreeMap<CorrelationId, Chain<E, M>>,
    index: HashMap<ObjectKey, CorrelationId>,
}

impl<E, M> Chains<E, M> {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            chains: BTreeMap::new(),
            index: HashMap::new(),
        }
    }

    /// Record that the object `key` lives in chain `id`
    pub fn bind(&mut self, key: ObjectKey, id: CorrelationId) {
        self.index.insert(key, id);
    }

    pub fn unbind(&mut self, key: &ObjectKey) -> Option<CorrelationId> {
        self.index.remove(key)
    }

    /// Chain holding the object `key`, if it is bound
    pub fn lookup(&self, key: &ObjectKey) -> Option<CorrelationId> {
        self.index.get(key).copied()
    }

    /// Every bound object key, in no particular order
    pub fn bound_keys(&self) -> impl Iterator<Item = &ObjectKey> {
        self.index.keys()
    }

    /// Create an empty chain for `id` if none exists
    pub fn init(&mut self, id: CorrelationId) {
        self.chains.entry(id).or_default();
    }

    pub fn push_back(&mut self, id: CorrelationId, entry: ChainEntry<E, M>) -> Result<(), StoreError> {
        let kind = self.kind;
        self.chains
            .get_mut(&id)
            .ok_or(StoreError::MissingChain { kind, id })?
            .push_back(entry);
        Ok(())
    }

    /// Current entity of a chain. `None` if the chain is absent or has no entity head.
    pub fn front(&self, id: CorrelationId) -> Option<&E> {
        self.chains.get(&id)?.front()?.as_entity()
    }

    /// Replace the chain head, returning the previous entity if there was one
    pub fn update_front(&mut self, id: CorrelationId, value: E) -> Result<Option<E>, StoreError> {
        let kind = self.kind;
        let chain = self
            .chains
            .get_mut(&id)
            .ok_or(StoreError::MissingChain { kind, id })?;

        match chain.front_mut() {
            Some(ChainEntry::Entity(current)) => Ok(Some(std::mem::replace(current, value))),
            _ => {
                chain.push_front(ChainEntry::Entity(value));
                Ok(None)
            }
        }
    }

    /// Drop a chain. Keys bound to it stay bound until unbound.
    pub fn remove(&mut self, id: CorrelationId) -> Option<Chain<E, M>> {
        self.chains.remove(&id)
    }

    pub fn keys(&self) -> Vec<CorrelationId> {
        self.chains.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    pub fn chain(&self, id: CorrelationId) -> Option<&Chain<E, M>> {
        self.chains.get(&id)
    }

    pub fn chain_mut(&mut self, id: CorrelationId) -> Option<&mut Chain<E, M>> {
        self.chains.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (CorrelationId, &Chain<E, M>)> {
        self.chains.iter().map(|(id, chain)| (*id, chain))
    }

    /// First chain (in id order) whose head entity satisfies `predicate`
    pub fn find(&self, mut predicate: impl FnMut(&E) -> bool) -> Option<(CorrelationId, &E)> {
        self.chains.iter().find_map(|(id, chain)| {
            chain
                .front()
                .and_then(ChainEntry::as_entity)
                .filter(|entity| predicate(entity))
                .map(|entity| (*id, entity))
        })
    }

    /// Total number of membership records across all chains
    pub fn membership_count(&self) -> usize {
        self.chains
            .values()
            .map(|chain| chain.iter().filter(|e| e.as_membership().is_some()).count())
            .sum()
    }
}

/// Concurrent keyed collection of version chains for one resource kind
///
/// Stores of kinds without membership records use the default
/// `M = Infallible`, which makes membership entries unrepresentable.
#[derive(Debug)]
pub struct ResourceStore<E, M = Infallible> {
    chains: RwLock<Chains<E, M>>,
}

impl<E, M> ResourceStore<E, M>
where
    E: Clone,
{
    pub fn new(kind: &'static str) -> Self {
        Self {
            chains: RwLock::new(Chains::new(kind)),
        }
    }

    /// Shared guard for multi-step reads
    pub async fn read(&self) -> RwLockReadGuard<'_, Chains<E, M>> {
        self.chains.read().await
    }

    /// Exclusive guard for multi-step mutations
    pub async fn write(&self) -> RwLockWriteGuard<'_, Chains<E, M>> {
        self.chains.write().await
    }

    pub async fn init(&self, id: CorrelationId) {
        self.write().await.init(id);
    }

    pub async fn push_back(&self, id: CorrelationId, entry: ChainEntry<E, M>) -> Result<(), StoreError> {
        self.write().await.push_back(id, entry)
    }

    pub async fn front(&self, id: CorrelationId) -> Option<E> {
        self.read().await.front(id).cloned()
    }

    pub async fn update_front(&self, id: CorrelationId, value: E) -> Result<Option<E>, StoreError> {
        self.write().await.update_front(id, value)
    }

    pub async fn remove(&self, id: CorrelationId) -> Option<Chain<E, M>> {
        self.write().await.remove(id)
    }

    pub async fn keys(&self) -> Vec<CorrelationId> {
        self.read().await.keys()
    }

    pub async fn len(&self) -> usize {
        self.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.read().await.is_empty()
    }

    pub async fn lookup(&self, key: &ObjectKey) -> Option<CorrelationId> {
        self.read().await.lookup(key)
    }

    pub async fn find(&self, predicate: impl FnMut(&E) -> bool) -> Option<(CorrelationId, E)> {
        self.read()
            .await
            .find(predicate)
            .map(|(id, entity)| (id, entity.clone()))
    }
}
