//! Correlation id allocation
//!
//! Correlation ids are the stable keys the collector hands out to logical
//! entities (microservices, nodes, services, secrets, namespaces, cron jobs).
//! They are independent of Kubernetes object uids and stay fixed for the
//! lifetime of the entity they are attached to.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Process-unique identifier of a logical entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(u64);

impl CorrelationId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for CorrelationId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
struct AllocatorState {
    next: u64,
    live: HashSet<u64>,
}

/// Issues correlation ids that are never handed out twice while live
///
/// A monotonically increasing counter proposes candidates and the liveness
/// set rejects any candidate still outstanding, so ids stay unique across
/// counter wraparound. Released ids become eligible again once the counter
/// reaches them.
#[derive(Debug)]
pub struct IdAllocator {
    state: Mutex<AllocatorState>,
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    fn starting_at(next: u64) -> Self {
        Self {
            state: Mutex::new(AllocatorState {
                next,
                live: HashSet::new(),
            }),
        }
    }

    /// Allocate an id that is not currently outstanding
    pub fn allocate(&self) -> CorrelationId {
        let mut state = self.lock();
        loop {
            let candidate = state.next;
            state.next = state.next.wrapping_add(1);
            if state.live.insert(candidate) {
                return CorrelationId(candidate);
            }
        }
    }

    /// Mark an id reusable. Returns false if it was not outstanding.
    pub fn release(&self, id: CorrelationId) -> bool {
        self.lock().live.remove(&id.0)
    }

    /// Number of ids currently outstanding
    pub fn outstanding(&self) -> usize {
        self.lock().live.len()
    }

    pub fn is_live(&self, id: CorrelationId) -> bool {
        self.lock().live.contains(&id.0)
    }

    // The critical sections never panic, so a poisoned lock still holds
    // consistent state.
    fn lock(&self) -> MutexGuard<'_, AllocatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
