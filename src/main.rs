use backend_dispatcher::{BalancerConfig, BalancerResult, HealthProbe, LoadBalancer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> BalancerResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // A config file path wins over BALANCER_* environment variables.
    let config = match std::env::args().nth(1) {
        Some(path) => BalancerConfig::from_json_file(path)?,
        None => BalancerConfig::from_env()?,
    };
    config.validate()?;

    let load_balancer = LoadBalancer::new(&config.strategy)?.with_probe(HealthProbe::new(
        config.health_path.clone(),
        config.health_timeout(),
    ));

    for backend in &config.backends {
        if let Err(e) = load_balancer.add_server(backend) {
            warn!(backend = %backend, error = %e, "skipping backend");
        }
    }
    if load_balancer.pool().is_empty() {
        warn!("no backends registered; every request will get 503");
    }

    if let Some(interval) = config.health_interval() {
        let _health_task = load_balancer.spawn_health_checks(interval);
    }

    if let Some(interval) = config.stats_interval() {
        let stats = load_balancer.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match serde_json::to_string(&stats.status()) {
                    Ok(backends) => info!(
                        total_requests = stats.requests_handled(),
                        backends = %backends,
                        "[METRICS] pool status"
                    ),
                    Err(e) => warn!(error = %e, "[METRICS] failed to encode pool status"),
                }
            }
        });
    }

    info!(strategy = %load_balancer.strategy_kind(), "starting HTTP load balancer");
    load_balancer.start(&config.bind_address).await
}
