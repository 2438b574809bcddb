//! Backend pool and request dispatcher.
//!
//! A [`ServerPool`] holds the registered backends and their health, a
//! [`ServerSelectionStrategy`] picks one per request, and the
//! [`Dispatcher`] reverse-proxies the request to it. [`HealthProbe`] runs
//! out of band and is the only thing that changes health flags.
//!
//! ```rust,no_run
//! use backend_dispatcher::LoadBalancer;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), backend_dispatcher::BalancerError> {
//! let balancer = LoadBalancer::new("least_connections")?;
//! balancer.add_server("http://10.0.0.11:8080")?;
//! balancer.add_server("http://10.0.0.12:8080")?;
//!
//! let _probe = balancer.spawn_health_checks(Duration::from_secs(10));
//! balancer.start("0.0.0.0:8080").await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod load_balancer;
pub mod pool;
pub mod strategies;
pub mod tracker;

pub use config::BalancerConfig;
pub use dispatcher::Dispatcher;
pub use error::{BalancerError, BalancerResult};
pub use health::HealthProbe;
pub use load_balancer::LoadBalancer;
pub use pool::{ServerPool, ServerStatus};
pub use strategies::{ServerSelectionStrategy, StrategyKind};
pub use tracker::{ConnectionGuard, ConnectionTracker};
