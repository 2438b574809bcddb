pub mod ip_affinity;
pub mod least_connections;
pub mod round_robin;
pub mod strategy;

pub use ip_affinity::IpAffinityStrategy;
pub use least_connections::LeastConnectionsStrategy;
pub use round_robin::RoundRobinStrategy;
pub use strategy::{ServerSelectionStrategy, StrategyKind};
