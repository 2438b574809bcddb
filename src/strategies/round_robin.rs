use std::net::IpAddr;

use crate::error::{BalancerError, BalancerResult};
use crate::pool::ServerPool;
use crate::tracker::ConnectionTracker;

use super::strategy::{ServerSelectionStrategy, StrategyKind};

/// Round-robin implementation of server selection strategy.
///
/// The cursor lives in the pool so that removals can keep it in range.
/// Starting at the cursor, at most one full cycle is scanned and the first
/// healthy server wins; the cursor then moves just past it.
#[derive(Debug, Default)]
pub struct RoundRobinStrategy;

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl ServerSelectionStrategy for RoundRobinStrategy {
    fn pick_server(
        &self,
        pool: &ServerPool,
        _tracker: &ConnectionTracker,
        _client: IpAddr,
    ) -> BalancerResult<String> {
        let mut state = pool.write();
        let len = state.servers.len();
        if len == 0 {
            return Err(BalancerError::NoServersRegistered);
        }

        let start = state.cursor % len;
        for offset in 0..len {
            let index = (start + offset) % len;
            if state.is_healthy(&state.servers[index]) {
                state.cursor = (index + 1) % len;
                return Ok(state.servers[index].clone());
            }
        }

        Err(BalancerError::NoHealthyServers)
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::RoundRobin
    }
}
