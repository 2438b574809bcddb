use std::net::IpAddr;

use crate::error::{BalancerError, BalancerResult};
use crate::pool::ServerPool;
use crate::tracker::ConnectionTracker;

use super::strategy::{ServerSelectionStrategy, StrategyKind};

/// Picks the healthy server with the fewest in-flight requests.
///
/// Ties go to the server that comes first in pool order. That tie-break is
/// deterministic, not load-fair: with equal counts the earliest registered
/// server keeps winning until its count rises.
#[derive(Debug, Default)]
pub struct LeastConnectionsStrategy;

impl LeastConnectionsStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl ServerSelectionStrategy for LeastConnectionsStrategy {
    fn pick_server(
        &self,
        pool: &ServerPool,
        tracker: &ConnectionTracker,
        _client: IpAddr,
    ) -> BalancerResult<String> {
        let state = pool.read();
        if state.servers.is_empty() {
            return Err(BalancerError::NoServersRegistered);
        }

        let mut best: Option<(&String, usize)> = None;
        for server in state.servers.iter().filter(|s| state.is_healthy(s)) {
            let load = tracker.load_in(&state, server);
            match best {
                Some((_, min)) if load >= min => {}
                _ => best = Some((server, load)),
            }
        }

        best.map(|(server, _)| server.clone())
            .ok_or(BalancerError::NoHealthyServers)
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::LeastConnections
    }

    fn tracks_connections(&self) -> bool {
        true
    }
}
