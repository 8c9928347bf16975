//! Request and result types shared by the azmon crates.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resource;

/// How a probe request selects the resources it collects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMode {
    /// Explicit resource IDs within one subscription.
    Resource,
    /// Resources matching a filter expression in one subscription.
    List,
    /// Every resource of a type across one or more subscriptions.
    Subscription,
    /// Rows returned by a resource graph query.
    ResourceGraph,
    /// Pre-resolved resource IDs, subscriptions derived from the IDs.
    Scrape,
}

impl ProbeMode {
    /// Handler name used in instrumentation labels.
    pub fn handler(&self) -> &'static str {
        match self {
            ProbeMode::Resource => "resource",
            ProbeMode::List => "list",
            ProbeMode::Subscription => "subscription",
            ProbeMode::ResourceGraph => "resourcegraph",
            ProbeMode::Scrape => "scrape",
        }
    }
}

impl fmt::Display for ProbeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.handler())
    }
}

/// Statistical reduction applied within one time grain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    Average,
    Minimum,
    Maximum,
    Total,
    Count,
}

impl Aggregation {
    pub const ALL: [Aggregation; 5] = [
        Aggregation::Average,
        Aggregation::Minimum,
        Aggregation::Maximum,
        Aggregation::Total,
        Aggregation::Count,
    ];

    /// Lowercase form used in labels and metric names.
    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregation::Average => "average",
            Aggregation::Minimum => "minimum",
            Aggregation::Maximum => "maximum",
            Aggregation::Total => "total",
            Aggregation::Count => "count",
        }
    }

    /// Form expected by the Azure Monitor `aggregation` query parameter.
    pub fn api_name(&self) -> &'static str {
        match self {
            Aggregation::Average => "Average",
            Aggregation::Minimum => "Minimum",
            Aggregation::Maximum => "Maximum",
            Aggregation::Total => "Total",
            Aggregation::Count => "Count",
        }
    }

    /// Case-insensitive parse. Accepts `sum` as an alias for `total`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "average" | "avg" => Some(Aggregation::Average),
            "minimum" | "min" => Some(Aggregation::Minimum),
            "maximum" | "max" => Some(Aggregation::Maximum),
            "total" | "sum" => Some(Aggregation::Total),
            "count" => Some(Aggregation::Count),
            _ => None,
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed, validated probe request. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeSpec {
    pub mode: ProbeMode,
    /// Subscriptions in request order (deduplicated).
    pub subscriptions: Vec<String>,
    /// Explicit resource IDs (resource and scrape modes).
    pub targets: Vec<String>,
    /// Resource filter expression (list mode).
    pub filter: Option<String>,
    /// Resource type to enumerate (subscription mode).
    pub resource_type: Option<String>,
    /// Resource graph query (resourcegraph mode).
    pub query: Option<String>,
    /// Metric names, ordered and deduplicated.
    pub metrics: Vec<String>,
    pub metric_namespace: Option<String>,
    pub aggregations: Vec<Aggregation>,
    /// ISO-8601 duration or interval.
    pub timespan: String,
    /// ISO-8601 time grain.
    pub interval: Option<String>,
    /// Dimension filter expression passed through to the metrics API.
    pub metric_filter: Option<String>,
    pub metric_top: Option<u32>,
    pub metric_order_by: Option<String>,
    /// Value substituted for `{name}` in the templates.
    pub name: String,
    pub name_template: String,
    pub help_template: String,
    /// Tag keys to resolve into `tag_<key>` labels.
    pub tag_keys: Vec<String>,
    /// Per-request cache lifetime override.
    pub cache_ttl: Option<Duration>,
}

impl ProbeSpec {
    /// The filter expression recorded in instrumentation labels.
    pub fn filter_label(&self) -> &str {
        match self.mode {
            ProbeMode::List => self.filter.as_deref().unwrap_or(""),
            ProbeMode::Subscription => self.resource_type.as_deref().unwrap_or(""),
            ProbeMode::ResourceGraph => self.query.as_deref().unwrap_or(""),
            ProbeMode::Resource | ProbeMode::Scrape => "",
        }
    }

    /// The subscription list recorded in instrumentation labels.
    pub fn subscription_label(&self) -> String {
        self.subscriptions.join(",")
    }
}

/// A single resource to collect metrics for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedTarget {
    pub resource_id: String,
    pub subscription_id: String,
    /// Extra labels returned by resource graph queries.
    #[serde(default)]
    pub extra_labels: BTreeMap<String, String>,
}

impl ResolvedTarget {
    pub fn new(resource_id: impl Into<String>, subscription_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            subscription_id: subscription_id.into(),
            extra_labels: BTreeMap::new(),
        }
    }

    /// Build a target whose subscription is taken from the resource ID.
    ///
    /// Returns `None` if the ID does not contain a `/subscriptions/<id>/` segment.
    pub fn from_resource_id(resource_id: &str) -> Option<Self> {
        let subscription = resource::subscription_of(resource_id)?;
        Some(Self::new(resource_id, subscription))
    }

    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.extra_labels = labels;
        self
    }

    /// Resource group parsed from the resource ID, if present.
    pub fn resource_group(&self) -> Option<String> {
        resource::resource_group_of(&self.resource_id)
    }
}

/// One value returned by the remote metrics API for one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub metric: String,
    pub unit: String,
    /// Dimension name → value, as returned by the remote API.
    pub dimensions: BTreeMap<String, String>,
    pub aggregation: Aggregation,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Per-target fetch failure. Never fatal to the request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("invalid metric: {0}")]
    InvalidMetric(String),

    #[error("throttled: {0}")]
    Throttled(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("cancelled")]
    Cancelled,
}

impl FetchError {
    /// Whether a fetch failing with this error may be attempted again.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Throttled(_) | FetchError::Transient(_) => true,
            FetchError::NotFound(_) | FetchError::InvalidMetric(_) | FetchError::Cancelled => false,
        }
    }

    /// Short kind name used in instrumentation labels.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::NotFound(_) => "not_found",
            FetchError::InvalidMetric(_) => "invalid_metric",
            FetchError::Throttled(_) => "throttled",
            FetchError::Transient(_) => "transient",
            FetchError::Cancelled => "cancelled",
        }
    }
}

/// Result of fetching one target's metrics.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// Samples are shared with the metric cache.
    Success(Arc<Vec<MetricSample>>),
    Failure(FetchError),
}

impl FetchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, FetchOutcome::Success(_))
    }

    pub fn samples(&self) -> &[MetricSample] {
        match self {
            FetchOutcome::Success(samples) => samples,
            FetchOutcome::Failure(_) => &[],
        }
    }

    pub fn error(&self) -> Option<&FetchError> {
        match self {
            FetchOutcome::Success(_) => None,
            FetchOutcome::Failure(e) => Some(e),
        }
    }
}
