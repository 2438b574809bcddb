use tracing::trace;

use crate::pool::{PoolState, ServerPool};

/// Per-server in-flight request counter.
///
/// Counts live inside the pool state, so removing a server removes its
/// count in the same critical section. Unknown endpoints are ignored.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    pool: ServerPool,
}

impl ConnectionTracker {
    pub fn new(pool: ServerPool) -> Self {
        Self { pool }
    }

    pub fn increment(&self, endpoint: &str) {
        let mut state = self.pool.write();
        if let Some(count) = state.connections.get_mut(endpoint) {
            *count += 1;
            trace!(backend = %endpoint, connections = *count, "connection opened");
        }
    }

    /// Floors at zero.
    pub fn decrement(&self, endpoint: &str) {
        let mut state = self.pool.write();
        if let Some(count) = state.connections.get_mut(endpoint) {
            *count = count.saturating_sub(1);
            trace!(backend = %endpoint, connections = *count, "connection closed");
        }
    }

    pub fn connections(&self, endpoint: &str) -> Option<usize> {
        self.pool.read().connections.get(endpoint).copied()
    }

    /// Count as seen under a lock the caller already holds.
    pub(crate) fn load_in(&self, state: &PoolState, endpoint: &str) -> usize {
        state.connections.get(endpoint).copied().unwrap_or(0)
    }

    /// Increments now and decrements exactly once when the guard is dropped.
    ///
    /// The guard is bound to the current incarnation of `endpoint`: if the
    /// server is removed and registered again meanwhile, dropping the guard
    /// leaves the new entry's count alone.
    pub fn track(&self, endpoint: &str) -> ConnectionGuard {
        let mut state = self.pool.write();
        let generation = state.generations.get(endpoint).copied();
        if let Some(count) = state.connections.get_mut(endpoint) {
            *count += 1;
            trace!(backend = %endpoint, connections = *count, "connection opened");
        }
        drop(state);

        ConnectionGuard {
            tracker: self.clone(),
            endpoint: endpoint.to_string(),
            generation,
        }
    }

    fn release(&self, endpoint: &str, generation: u64) {
        let mut state = self.pool.write();
        if state.generations.get(endpoint) != Some(&generation) {
            trace!(backend = %endpoint, "stale connection guard ignored");
            return;
        }
        if let Some(count) = state.connections.get_mut(endpoint) {
            *count = count.saturating_sub(1);
            trace!(backend = %endpoint, connections = *count, "connection closed");
        }
    }
}

/// Ties one request's lifecycle to one increment/decrement pair.
///
/// The dispatcher moves the guard into the response body, so it is dropped
/// when the body has been fully delivered, when the client goes away, or
/// when the request fails before a response exists.
#[derive(Debug)]
pub struct ConnectionGuard {
    tracker: ConnectionTracker,
    endpoint: String,
    /// `None` when the endpoint was unknown at `track` time.
    generation: Option<u64>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Some(generation) = self.generation {
            self.tracker.release(&self.endpoint, generation);
        }
    }
}
