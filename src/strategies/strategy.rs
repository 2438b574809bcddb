use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{BalancerError, BalancerResult};
use crate::pool::ServerPool;
use crate::tracker::ConnectionTracker;

use super::{IpAffinityStrategy, LeastConnectionsStrategy, RoundRobinStrategy};

/// Trait for abstracting server selection strategies.
///
/// Implementations receive the pool and the tracker on every call and keep
/// no copy of the topology themselves. They fail with
/// [`BalancerError::NoServersRegistered`] on an empty pool and
/// [`BalancerError::NoHealthyServers`] when every server is down, and never
/// return an unhealthy server.
pub trait ServerSelectionStrategy: Send + Sync {
    fn pick_server(
        &self,
        pool: &ServerPool,
        tracker: &ConnectionTracker,
        client: IpAddr,
    ) -> BalancerResult<String>;

    fn kind(&self) -> StrategyKind;

    /// Whether the dispatcher should record in-flight requests for this
    /// strategy. Only least-connections reads the counts.
    fn tracks_connections(&self) -> bool {
        false
    }
}

/// Strategy names accepted by the factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyKind {
    RoundRobin,
    LeastConnections,
    IpAffinity,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::RoundRobin => "round_robin",
            StrategyKind::LeastConnections => "least_connections",
            StrategyKind::IpAffinity => "ip_affinity",
        }
    }

    pub fn build(self) -> Arc<dyn ServerSelectionStrategy> {
        match self {
            StrategyKind::RoundRobin => Arc::new(RoundRobinStrategy::new()),
            StrategyKind::LeastConnections => Arc::new(LeastConnectionsStrategy::new()),
            StrategyKind::IpAffinity => Arc::new(IpAffinityStrategy::new()),
        }
    }
}

impl FromStr for StrategyKind {
    type Err = BalancerError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.trim() {
            "round_robin" => Ok(StrategyKind::RoundRobin),
            "least_connections" => Ok(StrategyKind::LeastConnections),
            "ip_affinity" | "ip_hash" => Ok(StrategyKind::IpAffinity),
            other => Err(BalancerError::UnsupportedStrategy(other.to_string())),
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
