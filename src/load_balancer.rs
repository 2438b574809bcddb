use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::dispatcher::Dispatcher;
use crate::error::BalancerResult;
use crate::health::HealthProbe;
use crate::pool::{ServerPool, ServerStatus};
use crate::strategies::{ServerSelectionStrategy, StrategyKind};
use crate::tracker::ConnectionTracker;

/// A fully wired balancer: pool, tracker, strategy, dispatcher and probe.
///
/// Clones share all state.
#[derive(Clone)]
pub struct LoadBalancer {
    pool: ServerPool,
    tracker: ConnectionTracker,
    strategy: Arc<dyn ServerSelectionStrategy>,
    dispatcher: Dispatcher,
    probe: HealthProbe,
}

impl LoadBalancer {
    /// Builds an empty balancer for `strategy_name` (`round_robin`,
    /// `least_connections` or `ip_affinity`).
    ///
    /// Fails with [`BalancerError::UnsupportedStrategy`] for anything else.
    ///
    /// [`BalancerError::UnsupportedStrategy`]: crate::error::BalancerError::UnsupportedStrategy
    pub fn new(strategy_name: &str) -> BalancerResult<Self> {
        let kind: StrategyKind = strategy_name.parse()?;
        Ok(Self::with_strategy(kind.build()))
    }

    pub fn with_strategy(strategy: Arc<dyn ServerSelectionStrategy>) -> Self {
        let pool = ServerPool::new();
        let tracker = ConnectionTracker::new(pool.clone());
        let dispatcher = Dispatcher::new(pool.clone(), tracker.clone(), Arc::clone(&strategy));

        Self {
            pool,
            tracker,
            strategy,
            dispatcher,
            probe: HealthProbe::default(),
        }
    }

    pub fn with_probe(mut self, probe: HealthProbe) -> Self {
        self.probe = probe;
        self
    }

    pub fn strategy_kind(&self) -> StrategyKind {
        self.strategy.kind()
    }

    pub fn add_server(&self, endpoint: &str) -> BalancerResult<String> {
        self.pool.add_server(endpoint)
    }

    pub fn remove_server(&self, endpoint: &str) -> BalancerResult<()> {
        self.pool.remove_server(endpoint)
    }

    pub fn list_servers(&self) -> Vec<String> {
        self.pool.list_servers()
    }

    /// Runs one selection without forwarding anything.
    pub fn next_server(&self, client: IpAddr) -> BalancerResult<String> {
        self.strategy.pick_server(&self.pool, &self.tracker, client)
    }

    pub async fn health_check(&self) -> HashMap<String, bool> {
        self.probe.check(&self.pool).await
    }

    /// Runs [`health_check`](Self::health_check) every `interval` until the
    /// returned task is aborted. Nothing calls this implicitly.
    pub fn spawn_health_checks(&self, interval: Duration) -> JoinHandle<()> {
        let balancer = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let results = balancer.health_check().await;
                let healthy = results.values().filter(|h| **h).count();
                debug!(healthy, total = results.len(), "periodic health check");
            }
        })
    }

    pub fn status(&self) -> Vec<ServerStatus> {
        self.pool.status()
    }

    pub fn requests_handled(&self) -> u64 {
        self.dispatcher.requests_handled()
    }

    pub fn pool(&self) -> &ServerPool {
        &self.pool
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    pub async fn handle(&self, req: Request<Body>, client_addr: SocketAddr) -> Response<Body> {
        self.dispatcher.handle(req, client_addr).await
    }

    /// Binds `bind_address` and serves until Ctrl-C.
    pub async fn start(&self, bind_address: &str) -> BalancerResult<()> {
        let listener = std::net::TcpListener::bind(bind_address)?;
        self.serve(listener, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
    }

    /// Serves on an already bound listener until `shutdown` resolves.
    pub async fn serve<F>(&self, listener: std::net::TcpListener, shutdown: F) -> BalancerResult<()>
    where
        F: Future<Output = ()>,
    {
        let addr = listener.local_addr()?;
        info!(
            address = %addr,
            strategy = %self.strategy.kind(),
            servers = ?self.pool.list_servers(),
            "HTTP load balancer listening"
        );

        let dispatcher = self.dispatcher.clone();
        let make_svc = make_service_fn(move |conn: &AddrStream| {
            let dispatcher = dispatcher.clone();
            let client_addr = conn.remote_addr();

            async move {
                Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                    let dispatcher = dispatcher.clone();
                    async move { Ok::<_, Infallible>(dispatcher.handle(req, client_addr).await) }
                }))
            }
        });

        hyper::Server::from_tcp(listener)?
            .serve(make_svc)
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BalancerError;
    use std::net::Ipv4Addr;

    const CLIENT: IpAddr = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));

    #[test]
    fn test_factory_builds_each_strategy() {
        assert_eq!(
            LoadBalancer::new("round_robin").unwrap().strategy_kind(),
            StrategyKind::RoundRobin
        );
        assert_eq!(
            LoadBalancer::new("least_connections").unwrap().strategy_kind(),
            StrategyKind::LeastConnections
        );
        assert_eq!(
            LoadBalancer::new("ip_affinity").unwrap().strategy_kind(),
            StrategyKind::IpAffinity
        );
    }

    #[test]
    fn test_factory_rejects_unknown() {
        let err = LoadBalancer::new("random").err().unwrap();
        assert!(matches!(err, BalancerError::UnsupportedStrategy(ref s) if s == "random"));
    }

    #[test]
    fn test_new_balancer_starts_empty() {
        let lb = LoadBalancer::new("least_connections").unwrap();
        assert!(lb.list_servers().is_empty());
        assert!(matches!(
            lb.next_server(CLIENT),
            Err(BalancerError::NoServersRegistered)
        ));
    }

    #[test]
    fn test_registration_facade() {
        let lb = LoadBalancer::new("round_robin").unwrap();
        lb.add_server("http://a:80").unwrap();
        lb.add_server("http://b:80").unwrap();
        assert!(lb.add_server("http://a:80").is_err());

        assert_eq!(lb.next_server(CLIENT).unwrap(), "http://a:80");
        lb.remove_server("http://b:80").unwrap();
        assert_eq!(lb.list_servers(), vec!["http://a:80".to_string()]);
        assert_eq!(lb.next_server(CLIENT).unwrap(), "http://a:80");
        assert_eq!(lb.status().len(), 1);
    }

    #[test]
    fn test_clones_share_state() {
        let lb = LoadBalancer::new("round_robin").unwrap();
        let other = lb.clone();
        other.add_server("http://a:80").unwrap();
        assert_eq!(lb.list_servers().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_selection_and_registration() {
        let lb = LoadBalancer::new("least_connections").unwrap();
        for i in 0..4 {
            lb.add_server(&format!("http://base-{}:80", i)).unwrap();
        }

        let mut handles = Vec::new();
        for t in 0..8 {
            let lb = lb.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..50 {
                    let endpoint = format!("http://w{}-{}:80", t, i);
                    lb.add_server(&endpoint).unwrap();
                    let picked = lb.next_server(CLIENT).unwrap();
                    assert!(picked.starts_with("http://"));
                    lb.remove_server(&endpoint).unwrap();
                    tokio::task::yield_now().await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut servers = lb.list_servers();
        servers.sort();
        assert_eq!(
            servers,
            vec![
                "http://base-0:80",
                "http://base-1:80",
                "http://base-2:80",
                "http://base-3:80",
            ]
        );
    }
}
