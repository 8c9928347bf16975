//! Prober configuration.
//!
//! Built once at startup from command-line flags and passed explicitly to
//! every component that needs it.

use std::time::Duration;

use serde::Serialize;

/// Default value substituted for `{name}` when a request does not set one.
pub const DEFAULT_METRIC_NAME: &str = "azurerm_resource_metric";

#[derive(Debug, Clone, Serialize)]
pub struct ProberConfig {
    pub concurrency: ConcurrencyConfig,
    pub cache: CacheConfig,
    pub retry: RetryConfig,
    pub templates: TemplateConfig,
    /// Tag keys resolved when a request does not ask for specific ones.
    pub resource_tags: Vec<String>,
    /// Upper bound on a single probe request.
    pub request_timeout: Duration,
}

impl Default for ProberConfig {
    fn default() -> Self {
        Self {
            concurrency: ConcurrencyConfig::default(),
            cache: CacheConfig::default(),
            retry: RetryConfig::default(),
            templates: TemplateConfig::default(),
            resource_tags: vec!["owner".to_string()],
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Two-level fan-out budget.
#[derive(Debug, Clone, Serialize)]
pub struct ConcurrencyConfig {
    /// Subscriptions processed concurrently.
    pub subscriptions: usize,
    /// Resources fetched concurrently within one subscription.
    pub resources_per_subscription: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            subscriptions: 5,
            resources_per_subscription: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Lifetime of cached metric and tag entries unless a request overrides it.
    pub ttl: Duration,
    /// Lifetime of cached target listings (service discovery).
    pub resolution_ttl: Duration,
    /// Maximum entries per cache before LRU eviction.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl: Duration::from_secs(60),
            resolution_ttl: Duration::from_secs(30 * 60),
            max_entries: 10_000,
        }
    }
}

/// Bounded exponential backoff for throttled and transient failures.
#[derive(Debug, Clone, Serialize)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based), doubling up to `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

/// Metric name and help templates.
#[derive(Debug, Clone, Serialize)]
pub struct TemplateConfig {
    pub name_template: String,
    pub help_template: String,
    /// Lowercase dimension values before emitting them as labels.
    pub lowercase_dimensions: bool,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            name_template: "{name}".to_string(),
            help_template: "Azure monitor insight metric".to_string(),
            lowercase_dimensions: false,
        }
    }
}

impl ProberConfig {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = ProberConfig::default();
        assert_eq!(config.concurrency.subscriptions, 5);
        assert_eq!(config.concurrency.resources_per_subscription, 10);
        assert!(!config.cache.enabled);
        assert_eq!(config.cache.resolution_ttl, Duration::from_secs(1800));
        assert_eq!(config.templates.name_template, "{name}");
        assert_eq!(config.resource_tags, vec!["owner"]);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let retry = RetryConfig {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
        };
        assert_eq!(retry.backoff(1), Duration::from_secs(1));
        assert_eq!(retry.backoff(2), Duration::from_secs(2));
        assert_eq!(retry.backoff(3), Duration::from_secs(4));
        assert_eq!(retry.backoff(4), Duration::from_secs(5));
        assert_eq!(retry.backoff(30), Duration::from_secs(5));
    }

    #[test]
    fn serializes_to_json() {
        let json = ProberConfig::default().to_json();
        assert!(json.contains("\"resources_per_subscription\":10"));
    }
}
