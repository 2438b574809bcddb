use std::collections::HashMap;
use std::sync::Arc;

use http::Uri;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{BalancerError, BalancerResult};

/// Everything the strategies look at, kept behind a single lock so that a
/// server, its health flag and its connection count appear and disappear
/// together.
#[derive(Debug, Default)]
pub(crate) struct PoolState {
    /// Iteration order used by every strategy. New servers are appended.
    pub(crate) servers: Vec<String>,
    pub(crate) health: HashMap<String, bool>,
    pub(crate) connections: HashMap<String, usize>,
    /// Incarnation of each entry; a re-added endpoint gets a fresh one.
    pub(crate) generations: HashMap<String, u64>,
    next_generation: u64,
    /// Round-robin resume position, always `< servers.len()` or `0`.
    pub(crate) cursor: usize,
}

impl PoolState {
    pub(crate) fn is_healthy(&self, endpoint: &str) -> bool {
        self.health.get(endpoint).copied().unwrap_or(false)
    }
}

/// Point-in-time view of one registered server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerStatus {
    pub endpoint: String,
    pub healthy: bool,
    pub active_connections: usize,
}

/// Thread-safe registry of backend endpoints and their health.
///
/// Cloning is cheap and every clone shares the same state.
#[derive(Debug, Clone, Default)]
pub struct ServerPool {
    state: Arc<RwLock<PoolState>>,
}

impl ServerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `endpoint` as healthy with zero connections and returns its
    /// normalized identity.
    pub fn add_server(&self, endpoint: &str) -> BalancerResult<String> {
        let endpoint = normalize_endpoint(endpoint)?;
        let mut state = self.state.write();

        if state.health.contains_key(&endpoint) {
            return Err(BalancerError::DuplicateServer(endpoint));
        }

        state.servers.push(endpoint.clone());
        state.health.insert(endpoint.clone(), true);
        state.connections.insert(endpoint.clone(), 0);
        state.next_generation += 1;
        let generation = state.next_generation;
        state.generations.insert(endpoint.clone(), generation);
        drop(state);

        info!(backend = %endpoint, "server registered");
        Ok(endpoint)
    }

    /// Unregisters `endpoint` together with its health and connection entries.
    pub fn remove_server(&self, endpoint: &str) -> BalancerResult<()> {
        let endpoint = identity(endpoint);
        let mut state = self.state.write();

        let index = state
            .servers
            .iter()
            .position(|s| *s == endpoint)
            .ok_or_else(|| BalancerError::ServerNotFound(endpoint.clone()))?;

        state.servers.remove(index);
        state.health.remove(&endpoint);
        state.connections.remove(&endpoint);
        state.generations.remove(&endpoint);

        // Keep the cursor pointing at the server that was next in line.
        if index < state.cursor {
            state.cursor -= 1;
        }
        if state.cursor >= state.servers.len() {
            state.cursor = 0;
        }
        drop(state);

        info!(backend = %endpoint, "server removed");
        Ok(())
    }

    /// Snapshot of the registered endpoints in iteration order.
    pub fn list_servers(&self) -> Vec<String> {
        self.state.read().servers.clone()
    }

    /// Sets the health flag and returns the previous value, or `None` when the
    /// server is not (or no longer) registered.
    pub fn set_health(&self, endpoint: &str, healthy: bool) -> Option<bool> {
        let endpoint = identity(endpoint);
        let mut state = self.state.write();
        let previous = state
            .health
            .get_mut(&endpoint)
            .map(|flag| std::mem::replace(flag, healthy));

        if previous.is_none() {
            debug!(backend = %endpoint, "health update for unregistered server ignored");
        }
        previous
    }

    pub fn is_healthy(&self, endpoint: &str) -> Option<bool> {
        self.state.read().health.get(&identity(endpoint)).copied()
    }

    pub fn len(&self) -> usize {
        self.state.read().servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn healthy_count(&self) -> usize {
        self.state.read().health.values().filter(|h| **h).count()
    }

    pub fn status(&self) -> Vec<ServerStatus> {
        let state = self.state.read();
        state
            .servers
            .iter()
            .map(|endpoint| ServerStatus {
                endpoint: endpoint.clone(),
                healthy: state.is_healthy(endpoint),
                active_connections: state.connections.get(endpoint).copied().unwrap_or(0),
            })
            .collect()
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, PoolState> {
        self.state.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, PoolState> {
        self.state.write()
    }
}

/// Normalizes an endpoint into `http://authority[/prefix]`.
///
/// The scheme is lowercased, a trailing `/` is dropped and query strings are
/// rejected. Only plain `http` backends are supported.
pub fn normalize_endpoint(raw: &str) -> BalancerResult<String> {
    let trimmed = raw.trim();
    let invalid = || BalancerError::InvalidEndpoint(trimmed.to_string());

    let uri: Uri = trimmed.parse().map_err(|_| invalid())?;
    let scheme = uri.scheme_str().ok_or_else(invalid)?.to_ascii_lowercase();
    let authority = uri.authority().ok_or_else(invalid)?;

    if scheme != "http" || uri.query().is_some() || authority.host().is_empty() {
        return Err(invalid());
    }

    let prefix = uri.path().trim_end_matches('/');
    Ok(format!("{}://{}{}", scheme, authority.as_str(), prefix))
}

// Lookups accept anything that normalizes; otherwise the raw string is used
// and simply won't match.
fn identity(endpoint: &str) -> String {
    normalize_endpoint(endpoint).unwrap_or_else(|_| endpoint.trim().to_string())
}
