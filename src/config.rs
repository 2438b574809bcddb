use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BalancerError, BalancerResult};
use crate::health::DEFAULT_HEALTH_PATH;
use crate::strategies::StrategyKind;

/// Service configuration for the dispatcher binary.
///
/// Loaded from a JSON file or from `BALANCER_*` environment variables. Every
/// field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    pub bind_address: String,
    pub strategy: String,
    pub backends: Vec<String>,
    pub health_path: String,
    pub health_timeout_secs: u64,
    /// `0` disables the periodic health check.
    pub health_interval_secs: u64,
    /// `0` disables the periodic stats log.
    pub stats_interval_secs: u64,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            strategy: StrategyKind::RoundRobin.as_str().to_string(),
            backends: Vec::new(),
            health_path: DEFAULT_HEALTH_PATH.to_string(),
            health_timeout_secs: 5,
            health_interval_secs: 10,
            stats_interval_secs: 30,
        }
    }
}

impl BalancerConfig {
    pub fn from_env() -> BalancerResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup; unset keys keep their
    /// defaults.
    pub fn from_lookup<F>(lookup: F) -> BalancerResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("BALANCER_BIND_ADDRESS") {
            config.bind_address = v;
        }
        if let Some(v) = lookup("BALANCER_STRATEGY") {
            config.strategy = v;
        }
        if let Some(v) = lookup("BALANCER_BACKENDS") {
            config.backends = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = lookup("BALANCER_HEALTH_PATH") {
            config.health_path = v;
        }
        if let Some(v) = lookup("BALANCER_HEALTH_TIMEOUT_SECS") {
            config.health_timeout_secs = parse_number("BALANCER_HEALTH_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("BALANCER_HEALTH_INTERVAL_SECS") {
            config.health_interval_secs = parse_number("BALANCER_HEALTH_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("BALANCER_STATS_INTERVAL_SECS") {
            config.stats_interval_secs = parse_number("BALANCER_STATS_INTERVAL_SECS", &v)?;
        }

        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> BalancerResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn validate(&self) -> BalancerResult<()> {
        StrategyKind::from_str(&self.strategy)?;
        self.bind_addr()?;
        if self.health_timeout_secs == 0 {
            return Err(BalancerError::Config(
                "health_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> BalancerResult<SocketAddr> {
        self.bind_address.parse().map_err(|_| {
            BalancerError::Config(format!("invalid bind address '{}'", self.bind_address))
        })
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn health_interval(&self) -> Option<Duration> {
        (self.health_interval_secs > 0).then(|| Duration::from_secs(self.health_interval_secs))
    }

    pub fn stats_interval(&self) -> Option<Duration> {
        (self.stats_interval_secs > 0).then(|| Duration::from_secs(self.stats_interval_secs))
    }
}

fn parse_number(key: &str, value: &str) -> BalancerResult<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| BalancerError::Config(format!("{} must be a number, got '{}'", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = BalancerConfig::default();
        assert_eq!(config.strategy, "round_robin");
        assert_eq!(config.health_path, "/health");
        assert_eq!(config.health_timeout(), Duration::from_secs(5));
        assert!(config.backends.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup() {
        let config = BalancerConfig::from_lookup(lookup_from(&[
            ("BALANCER_STRATEGY", "least_connections"),
            ("BALANCER_BACKENDS", "http://a:80, http://b:80,,"),
            ("BALANCER_HEALTH_INTERVAL_SECS", "0"),
            ("BALANCER_BIND_ADDRESS", "127.0.0.1:9000"),
        ]))
        .unwrap();

        assert_eq!(config.strategy, "least_connections");
        assert_eq!(config.backends, vec!["http://a:80", "http://b:80"]);
        assert_eq!(config.health_interval(), None);
        assert_eq!(config.stats_interval(), Some(Duration::from_secs(30)));
        assert_eq!(config.bind_addr().unwrap().port(), 9000);
    }

    #[test]
    fn test_bad_number() {
        let err = BalancerConfig::from_lookup(lookup_from(&[(
            "BALANCER_HEALTH_TIMEOUT_SECS",
            "soon",
        )]))
        .unwrap_err();
        assert!(matches!(err, BalancerError::Config(_)));
    }

    #[test]
    fn test_validate() {
        let mut config = BalancerConfig {
            strategy: "weighted".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(BalancerError::UnsupportedStrategy(_))
        ));

        config.strategy = "ip_affinity".to_string();
        config.health_timeout_secs = 0;
        assert!(matches!(config.validate(), Err(BalancerError::Config(_))));

        config.health_timeout_secs = 1;
        config.bind_address = "not-an-address".to_string();
        assert!(matches!(config.validate(), Err(BalancerError::Config(_))));
    }

    #[test]
    fn test_json_partial() {
        let config: BalancerConfig = serde_json::from_str(
            r#"{"strategy": "ip_affinity", "backends": ["http://10.0.0.1:8080"]}"#,
        )
        .unwrap();
        assert_eq!(config.strategy, "ip_affinity");
        assert_eq!(config.backends.len(), 1);
        assert_eq!(config.bind_address, "0.0.0.0:8080");
    }

    #[test]
    fn test_json_file() {
        let path = std::env::temp_dir().join(format!(
            "backend-dispatcher-config-{}.json",
            std::process::id()
        ));
        std::fs::write(&path, r#"{"health_timeout_secs": 2}"#).unwrap();

        let config = BalancerConfig::from_json_file(&path).unwrap();
        assert_eq!(config.health_timeout(), Duration::from_secs(2));

        std::fs::remove_file(&path).unwrap();
        assert!(matches!(
            BalancerConfig::from_json_file(&path),
            Err(BalancerError::Io(_))
        ));
    }
}
