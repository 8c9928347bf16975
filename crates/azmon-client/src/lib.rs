//! azmon-client — the remote side of the metrics bridge.
//!
//! [`MetricsClient`] is the seam between the prober and Azure. The
//! production implementation, [`ArmClient`], speaks to Azure Resource
//! Manager, Azure Monitor, and Azure Resource Graph over HTTPS with a bearer
//! token from a [`TokenSource`]. With the `stub` feature, [`StubClient`]
//! provides a programmable in-memory implementation for tests.
//!
//! ```text
//! MetricsClient
//!   ├── list_resources()               ← list mode
//!   ├── list_subscription_resources()  ← subscription mode
//!   ├── query_resource_graph()         ← resourcegraph mode
//!   ├── fetch_metrics()                ← per-target fetch
//!   └── resource_tags()                ← tag enrichment
//! ```

pub mod arm;
pub mod auth;
pub mod error;
#[cfg(feature = "stub")]
pub mod stub;
pub mod types;

use std::collections::BTreeMap;

use async_trait::async_trait;
use azmon_core::MetricSample;

pub use arm::{ArmClient, AzureEnvironment};
pub use auth::{ClientSecretCredential, StaticToken, TokenSource};
pub use error::{ClientError, ClientResult};
#[cfg(feature = "stub")]
pub use stub::StubClient;
pub use types::{GraphRow, MetricQuery, ResourceRecord};

/// Authenticated access to the remote monitoring API.
///
/// Implementations page through large listings themselves; callers always
/// receive complete results.
#[async_trait]
pub trait MetricsClient: Send + Sync {
    /// Resources in one subscription matching an ARM `$filter` expression.
    async fn list_resources(
        &self,
        subscription_id: &str,
        filter: &str,
    ) -> ClientResult<Vec<ResourceRecord>>;

    /// All resources in one subscription, optionally restricted to a resource type.
    async fn list_subscription_resources(
        &self,
        subscription_id: &str,
        resource_type: Option<&str>,
    ) -> ClientResult<Vec<ResourceRecord>>;

    /// Rows returned by a resource graph query scoped to `subscriptions`.
    async fn query_resource_graph(
        &self,
        subscriptions: &[String],
        query: &str,
    ) -> ClientResult<Vec<GraphRow>>;

    /// Metric samples for one resource.
    async fn fetch_metrics(&self, query: &MetricQuery) -> ClientResult<Vec<MetricSample>>;

    /// Tags set on one resource.
    async fn resource_tags(&self, resource_id: &str) -> ClientResult<BTreeMap<String, String>>;
}
