//! Configuration types for the timeboard service

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::query::{QueryOptions, RetryPolicy};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Origin the endpoint paths are resolved against
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub devtools: DevtoolsConfig,
    #[serde(default)]
    pub dashboard: DashboardConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            endpoints: default_endpoints(),
            query: QueryConfig::default(),
            http: HttpConfig::default(),
            devtools: DevtoolsConfig::default(),
            dashboard: DashboardConfig::default(),
        }
    }
}

impl Config {
    /// Check the invariants serde cannot express
    pub fn validate(&self) -> crate::Result<()> {
        let url = reqwest::Url::parse(&self.base_url).map_err(|e| {
            crate::TimeboardError::Config(format!("Invalid base_url {:?}: {}", self.base_url, e))
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(crate::TimeboardError::Config(format!(
                "base_url must be http or https, got {:?}",
                url.scheme()
            )));
        }

        if self.endpoints.is_empty() {
            return Err(crate::TimeboardError::Config(
                "At least one endpoint is required".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for endpoint in &self.endpoints {
            if !endpoint.starts_with('/') {
                return Err(crate::TimeboardError::Config(format!(
                    "Endpoint {:?} must start with '/'",
                    endpoint
                )));
            }
            if !seen.insert(endpoint.as_str()) {
                return Err(crate::TimeboardError::Config(format!(
                    "Endpoint {:?} is listed more than once",
                    endpoint
                )));
            }
        }

        if self.query.refetch_interval_seconds == 0 {
            return Err(crate::TimeboardError::Config(
                "query.refetch_interval_seconds must be greater than zero".to_string(),
            ));
        }

        if self.http.timeout_seconds == 0 {
            return Err(crate::TimeboardError::Config(
                "http.timeout_seconds must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

/// Query cache tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// How long fetched data counts as fresh
    #[serde(default)]
    pub stale_time_ms: u64,
    #[serde(default = "default_refetch_interval")]
    pub refetch_interval_seconds: u64,
    /// Retries after the first failed attempt
    #[serde(default = "default_retry")]
    pub retry: u32,
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            stale_time_ms: 0,
            refetch_interval_seconds: default_refetch_interval(),
            retry: default_retry(),
            retry_base_delay_ms: default_retry_base_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
        }
    }
}

impl QueryConfig {
    pub fn refetch_interval(&self) -> Duration {
        Duration::from_secs(self.refetch_interval_seconds)
    }

    pub fn to_options(&self) -> QueryOptions {
        QueryOptions {
            stale_time: Duration::from_millis(self.stale_time_ms),
            retry: RetryPolicy {
                retries: self.retry,
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
                max_delay: Duration::from_millis(self.retry_max_delay_ms),
            },
        }
    }
}

/// HTTP client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout(),
        }
    }
}

/// Developer panel settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DevtoolsConfig {
    #[serde(default)]
    pub initially_open: bool,
}

/// Dashboard configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_dashboard_port")]
    pub port: u16,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_dashboard_port(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_endpoints() -> Vec<String> {
    vec!["/api/golang/".to_string(), "/api/node/".to_string()]
}

fn default_refetch_interval() -> u64 {
    5
}

fn default_retry() -> u32 {
    3
}

fn default_retry_base_delay() -> u64 {
    1000
}

fn default_retry_max_delay() -> u64 {
    30_000
}

fn default_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_dashboard_port() -> u16 {
    11116
}

/// Load configuration from a JSON file
pub fn load_config(path: &Path) -> crate::Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        crate::TimeboardError::Config(format!("Failed to read config file {:?}: {}", path, e))
    })?;
    let config: Config = serde_json::from_str(&content)?;
    Ok(config)
}
