//! Configuration for a dashboard session

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// What the per-site metrics query does when a fetch fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricsErrorPolicy {
    /// Resolve to an empty series and keep the card calm
    Degrade,
    /// Expose the failure as an error state
    Surface,
}

impl From<&str> for MetricsErrorPolicy {
    fn from(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "surface" | "error" | "strict" => MetricsErrorPolicy::Surface,
            _ => MetricsErrorPolicy::Degrade,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the monitoring API, without the `/api` suffix
    pub api_base_url: String,

    /// HTTP timeout for backend requests
    pub http_timeout: Duration,

    /// Polling period for the roster and every metrics card
    pub refresh_interval: Duration,

    /// Automatic retries for a failed roster fetch
    pub roster_retries: u32,

    /// Retry backoff base, doubled per attempt
    pub retry_backoff_ms: u64,

    /// Failure handling for per-site metrics
    pub metrics_error_policy: MetricsErrorPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000".to_string(),
            http_timeout: Duration::from_secs(10),
            refresh_interval: Duration::from_secs(30),
            roster_retries: 2,
            retry_backoff_ms: 1000,
            metrics_error_policy: MetricsErrorPolicy::Degrade,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(url) = lookup("SITEWATCH_API_URL") {
            config.api_base_url = url.trim_end_matches('/').to_string();
        }

        if let Some(timeout) = lookup("HTTP_TIMEOUT_SECONDS") {
            if let Ok(seconds) = timeout.parse::<u64>() {
                config.http_timeout = Duration::from_secs(seconds);
            }
        }

        if let Some(interval) = lookup("REFRESH_INTERVAL_SECONDS") {
            if let Ok(seconds) = interval.parse::<u64>() {
                config.refresh_interval = Duration::from_secs(seconds);
            }
        }

        if let Some(retries) = lookup("ROSTER_RETRIES") {
            if let Ok(retries) = retries.parse() {
                config.roster_retries = retries;
            }
        }

        if let Some(backoff) = lookup("RETRY_BACKOFF_MS") {
            if let Ok(ms) = backoff.parse() {
                config.retry_backoff_ms = ms;
            }
        }

        if let Some(policy) = lookup("METRICS_ERROR_POLICY") {
            config.metrics_error_policy = MetricsErrorPolicy::from(policy.as_str());
        }

        config
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.api_base_url.is_empty() {
            return Err("api_base_url cannot be empty".to_string());
        }

        if !self.api_base_url.starts_with("http://") && !self.api_base_url.starts_with("https://") {
            return Err(format!("api_base_url must be an http(s) URL, got {}", self.api_base_url));
        }

        if self.http_timeout.is_zero() {
            return Err("http_timeout must be greater than 0".to_string());
        }

        if self.refresh_interval.is_zero() {
            return Err("refresh_interval must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Delay before retry number `attempt` (1-based), capped at 30 seconds
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2_u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor).min(30_000))
    }
}
