//! The server pool: policy-driven backend selection with sticky sessions.

use std::num::NonZeroUsize;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use arc_swap::ArcSwap;
use lru::LruCache;
use std::sync::Arc;

use crate::domain::backend::SharedBackend;
use crate::error::{InvalidPolicy, SelectError};

/// The configured backend selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Visit alive backends in registration order.
    RoundRobin,
    /// Pick the alive backend with the fewest in-flight requests.
    LeastConnections,
}

impl FromStr for Policy {
    type Err = InvalidPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round-robin" => Ok(Self::RoundRobin),
            "least-connections" => Ok(Self::LeastConnections),
            other => Err(InvalidPolicy(other.to_string())),
        }
    }
}

/// State guarded by the one pool-wide lock: the round-robin cursor and the
/// sticky-session table. Backend connection counters live on the backends
/// themselves, so accounting on one backend never contends with selection.
#[derive(Debug)]
struct PoolState {
    cursor: usize,
    /// Session token -> index into the current backend list.
    ///
    /// Bounded by an LRU so the table cannot grow without limit; within
    /// capacity a binding lives for the life of the process.
    sessions: LruCache<String, usize>,
}

/// An ordered pool of backends with policy selection and sticky sessions.
///
/// The backend list itself is held in an `ArcSwap` so the topology can be
/// replaced atomically without blocking in-flight selections.
#[derive(Debug)]
pub struct ServerPool {
    backends: ArcSwap<Vec<SharedBackend>>,
    policy: Policy,
    state: Mutex<PoolState>,
}

impl ServerPool {
    /// Create a pool over the given ordered backends.
    ///
    /// `session_capacity` bounds the sticky-session table; it is clamped to
    /// at least one entry.
    pub fn new(backends: Vec<SharedBackend>, policy: Policy, session_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(session_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            backends: ArcSwap::from_pointee(backends),
            policy,
            state: Mutex::new(PoolState {
                cursor: 0,
                sessions: LruCache::new(capacity),
            }),
        }
    }

    /// The policy this pool resolves non-sticky requests with.
    pub fn policy(&self) -> Policy {
        self.policy
    }

    /// Atomically replace the entire set of backends.
    ///
    /// Session bindings that point past the new list are re-resolved (and
    /// re-bound) on their next request.
    pub fn update_backends(&self, new_backends: Vec<SharedBackend>) {
        self.backends.store(Arc::new(new_backends));
    }

    /// Retrieve a snapshot of the current backends.
    pub fn snapshot(&self) -> Arc<Vec<SharedBackend>> {
        self.backends.load_full()
    }

    /// Resolve a backend for a request.
    ///
    /// A non-empty session token that is already bound returns the bound
    /// backend unconditionally, bypassing the configured policy. An unbound
    /// token resolves via the policy and records the binding before
    /// returning, all under the same lock, so a token binds to exactly one
    /// backend even under concurrent first requests.
    pub fn select(&self, session: Option<&str>) -> Result<SharedBackend, SelectError> {
        let backends = self.backends.load();
        let mut state = self.lock_state();

        if let Some(token) = session.filter(|t| !t.is_empty()) {
            if let Some(&idx) = state.sessions.get(token) {
                if let Some(backend) = backends.get(idx) {
                    return Ok(Arc::clone(backend));
                }
                // Binding outlived a topology swap; fall through and re-bind.
            }
            let idx = self.pick_index(&mut state, &backends)?;
            state.sessions.put(token.to_string(), idx);
            return Ok(Arc::clone(&backends[idx]));
        }

        let idx = self.pick_index(&mut state, &backends)?;
        Ok(Arc::clone(&backends[idx]))
    }

    /// Advance the cursor to the next alive backend.
    ///
    /// Probes at most `len(backends)` slots so a fully-dead pool fails with
    /// [`SelectError::NoAvailableBackend`] instead of spinning forever.
    pub fn select_round_robin(&self) -> Result<SharedBackend, SelectError> {
        let backends = self.backends.load();
        let mut state = self.lock_state();
        Self::pick_round_robin(&mut state, &backends).map(|idx| Arc::clone(&backends[idx]))
    }

    /// Pick the alive backend with the fewest in-flight requests; ties break
    /// toward the earliest position in the backend list.
    pub fn select_least_conn(&self) -> Result<SharedBackend, SelectError> {
        let backends = self.backends.load();
        Self::pick_least_conn(&backends).map(|idx| Arc::clone(&backends[idx]))
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pick_index(
        &self,
        state: &mut PoolState,
        backends: &[SharedBackend],
    ) -> Result<usize, SelectError> {
        match self.policy {
            Policy::RoundRobin => Self::pick_round_robin(state, backends),
            Policy::LeastConnections => Self::pick_least_conn(backends),
        }
    }

    fn pick_round_robin(
        state: &mut PoolState,
        backends: &[SharedBackend],
    ) -> Result<usize, SelectError> {
        if backends.is_empty() {
            return Err(SelectError::NoAvailableBackend);
        }
        for _ in 0..backends.len() {
            let idx = state.cursor % backends.len();
            state.cursor = state.cursor.wrapping_add(1);
            if backends[idx].is_alive() {
                return Ok(idx);
            }
        }
        Err(SelectError::NoAvailableBackend)
    }

    fn pick_least_conn(backends: &[SharedBackend]) -> Result<usize, SelectError> {
        backends
            .iter()
            .enumerate()
            .filter(|(_, b)| b.is_alive())
            .min_by_key(|(_, b)| b.active_connections())
            .map(|(idx, _)| idx)
            .ok_or(SelectError::NoAvailableBackend)
    }
}
