//! Active health probing.
//!
//! Every backend is expected to answer `GET {endpoint}/health` with `200 OK`
//! when it can take traffic. Anything else (another status, a connection
//! error or no answer within the timeout) marks it unhealthy.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use hyper::client::HttpConnector;
use hyper::{Body, Client, StatusCode, Uri};
use tracing::{debug, info, warn};

use crate::pool::ServerPool;

pub const DEFAULT_HEALTH_PATH: &str = "/health";
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// On-demand liveness check over every registered server.
///
/// The probe never schedules itself; callers decide when to run it.
#[derive(Debug, Clone)]
pub struct HealthProbe {
    client: Client<HttpConnector, Body>,
    path: String,
    timeout: Duration,
}

impl Default for HealthProbe {
    fn default() -> Self {
        Self::new(DEFAULT_HEALTH_PATH, DEFAULT_HEALTH_TIMEOUT)
    }
}

impl HealthProbe {
    pub fn new(path: impl Into<String>, timeout: Duration) -> Self {
        let mut path = path.into();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        Self {
            client: Client::new(),
            path,
            timeout,
        }
    }

    pub fn health_url(&self, endpoint: &str) -> String {
        format!("{}{}", endpoint, self.path)
    }

    /// Probes a snapshot of the pool and writes each verdict back as soon as
    /// it is known. Probes run concurrently, so one slow backend only delays
    /// its own result.
    pub async fn check(&self, pool: &ServerPool) -> HashMap<String, bool> {
        let started = Instant::now();
        let servers = pool.list_servers();
        let mut handles = Vec::with_capacity(servers.len());

        for endpoint in servers {
            let client = self.client.clone();
            let pool = pool.clone();
            let url = self.health_url(&endpoint);
            let timeout = self.timeout;

            let handle = tokio::spawn(async move {
                let healthy = probe(&client, &url, timeout).await;
                record(&pool, &endpoint, healthy);
                (endpoint, healthy)
            });
            handles.push(handle);
        }

        let mut results = HashMap::with_capacity(handles.len());
        for handle in handles {
            if let Ok((endpoint, healthy)) = handle.await {
                results.insert(endpoint, healthy);
            }
        }

        debug!(
            servers = results.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "health check cycle completed"
        );
        results
    }
}

async fn probe(client: &Client<HttpConnector, Body>, url: &str, timeout: Duration) -> bool {
    let uri: Uri = match url.parse() {
        Ok(uri) => uri,
        Err(e) => {
            debug!(url, error = %e, "invalid health check url");
            return false;
        }
    };

    match tokio::time::timeout(timeout, client.get(uri)).await {
        Ok(Ok(resp)) => resp.status() == StatusCode::OK,
        Ok(Err(e)) => {
            debug!(url, error = %e, "health check request failed");
            false
        }
        Err(_) => {
            debug!(url, timeout_ms = timeout.as_millis() as u64, "health check timed out");
            false
        }
    }
}

fn record(pool: &ServerPool, endpoint: &str, healthy: bool) {
    match (pool.set_health(endpoint, healthy), healthy) {
        (Some(true), false) => warn!(backend = %endpoint, "backend marked unhealthy"),
        (Some(false), true) => info!(backend = %endpoint, "backend recovered"),
        (Some(_), _) => debug!(backend = %endpoint, healthy, "health unchanged"),
        (None, _) => debug!(backend = %endpoint, "server removed during health check"),
    }
}
