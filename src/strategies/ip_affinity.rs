use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;

use crate::error::{BalancerError, BalancerResult};
use crate::pool::ServerPool;
use crate::tracker::ConnectionTracker;

use super::strategy::{ServerSelectionStrategy, StrategyKind};

/// Routes each client address to a fixed healthy server.
///
/// The address is hashed on its own, so the result depends only on the
/// client and the current healthy set. When that set changes some clients
/// move to a different backend.
#[derive(Debug, Default)]
pub struct IpAffinityStrategy;

impl IpAffinityStrategy {
    pub fn new() -> Self {
        Self
    }
}

/// `DefaultHasher::new()` uses fixed keys, so this is stable for the life of
/// the binary. IPv4-mapped IPv6 addresses hash like their IPv4 form.
fn client_hash(client: IpAddr) -> u64 {
    let mut hasher = DefaultHasher::new();
    client.to_canonical().hash(&mut hasher);
    hasher.finish()
}

impl ServerSelectionStrategy for IpAffinityStrategy {
    fn pick_server(
        &self,
        pool: &ServerPool,
        _tracker: &ConnectionTracker,
        client: IpAddr,
    ) -> BalancerResult<String> {
        let state = pool.read();
        if state.servers.is_empty() {
            return Err(BalancerError::NoServersRegistered);
        }

        let healthy: Vec<&String> = state
            .servers
            .iter()
            .filter(|s| state.is_healthy(s))
            .collect();
        if healthy.is_empty() {
            return Err(BalancerError::NoHealthyServers);
        }

        let index = (client_hash(client) % healthy.len() as u64) as usize;
        Ok(healthy[index].clone())
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::IpAffinity
    }
}
