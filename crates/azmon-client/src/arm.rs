//! Azure Resource Manager client.
//!
//! Implements [`MetricsClient`] with plain REST calls:
//!
//! | Operation | Endpoint |
//! |---|---|
//! | list resources | `GET /subscriptions/{id}/resources?$filter=` |
//! | resource graph | `POST /providers/Microsoft.ResourceGraph/resources` |
//! | metrics | `GET {resourceId}/providers/Microsoft.Insights/metrics` |
//! | tags | `GET {resourceId}/providers/Microsoft.Resources/tags/default` |

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use azmon_core::{Aggregation, MetricSample};
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{RequestBuilder, StatusCode};
use serde::Deserialize;
use tracing::{debug, trace};

use crate::MetricsClient;
use crate::auth::TokenSource;
use crate::error::{ClientError, ClientResult};
use crate::types::{GraphRow, MetricQuery, ResourceRecord};

const RESOURCES_API_VERSION: &str = "2021-04-01";
const METRICS_API_VERSION: &str = "2018-01-01";
const GRAPH_API_VERSION: &str = "2021-03-01";
const TAGS_API_VERSION: &str = "2021-04-01";

/// Safety stop for paginated listings.
const MAX_PAGES: usize = 1000;

/// Azure cloud endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AzureEnvironment {
    pub name: &'static str,
    pub resource_manager: &'static str,
    pub authority: &'static str,
}

impl AzureEnvironment {
    pub const PUBLIC: AzureEnvironment = AzureEnvironment {
        name: "AZUREPUBLICCLOUD",
        resource_manager: "https://management.azure.com",
        authority: "https://login.microsoftonline.com",
    };

    pub const CHINA: AzureEnvironment = AzureEnvironment {
        name: "AZURECHINACLOUD",
        resource_manager: "https://management.chinacloudapi.cn",
        authority: "https://login.chinacloudapi.cn",
    };

    pub const US_GOVERNMENT: AzureEnvironment = AzureEnvironment {
        name: "AZUREUSGOVERNMENTCLOUD",
        resource_manager: "https://management.usgovcloudapi.net",
        authority: "https://login.microsoftonline.us",
    };

    /// Look up an environment by its conventional name (case-insensitive).
    pub fn from_name(name: &str) -> Option<Self> {
        [Self::PUBLIC, Self::CHINA, Self::US_GOVERNMENT]
            .into_iter()
            .find(|env| env.name.eq_ignore_ascii_case(name.trim()))
    }
}

/// How a `400 Bad Request` should be interpreted for a given call.
#[derive(Debug, Clone, Copy)]
enum BadRequest {
    Filter,
    Query,
    Metric,
}

/// [`MetricsClient`] backed by Azure Resource Manager.
#[derive(Clone)]
pub struct ArmClient {
    http: reqwest::Client,
    environment: AzureEnvironment,
    tokens: Arc<dyn TokenSource>,
}

impl ArmClient {
    pub fn new(
        http: reqwest::Client,
        environment: AzureEnvironment,
        tokens: Arc<dyn TokenSource>,
    ) -> Self {
        Self {
            http,
            environment,
            tokens,
        }
    }

    pub fn environment(&self) -> &AzureEnvironment {
        &self.environment
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.environment.resource_manager, path)
    }

    /// Attach the bearer token, send, and map non-2xx statuses to errors.
    async fn send<T: for<'de> Deserialize<'de>>(
        &self,
        request: RequestBuilder,
        bad_request: BadRequest,
    ) -> ClientResult<T> {
        let token = self.tokens.token().await?;
        let resp = request.bearer_auth(token).send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp.json::<T>().await?);
        }

        let retry_after = parse_retry_after(resp.headers());
        let body = resp.text().await.unwrap_or_default();
        Err(classify(status, retry_after, &body, bad_request))
    }

    async fn list_pages(&self, subscription_id: &str, filter: Option<&str>) -> ClientResult<Vec<ResourceRecord>> {
        let mut records = Vec::new();
        let mut request = self
            .http
            .get(self.url(&format!("/subscriptions/{subscription_id}/resources")))
            .query(&[("api-version", RESOURCES_API_VERSION)]);
        if let Some(filter) = filter {
            request = request.query(&[("$filter", filter)]);
        }

        for page in 0..MAX_PAGES {
            let body: ResourceListPage = self.send(request, BadRequest::Filter).await?;
            trace!(page, items = body.value.len(), %subscription_id, "resource list page");
            records.extend(body.value.into_iter().map(ResourceRecord::from));
            match body.next_link {
                Some(next) if !next.is_empty() => request = self.http.get(next),
                _ => break,
            }
        }

        debug!(%subscription_id, resources = records.len(), "listed resources");
        Ok(records)
    }
}

#[async_trait]
impl MetricsClient for ArmClient {
    async fn list_resources(
        &self,
        subscription_id: &str,
        filter: &str,
    ) -> ClientResult<Vec<ResourceRecord>> {
        let filter = filter.trim();
        self.list_pages(subscription_id, (!filter.is_empty()).then_some(filter))
            .await
    }

    async fn list_subscription_resources(
        &self,
        subscription_id: &str,
        resource_type: Option<&str>,
    ) -> ClientResult<Vec<ResourceRecord>> {
        let filter = resource_type.map(|t| format!("resourceType eq '{}'", t.replace('\'', "''")));
        self.list_pages(subscription_id, filter.as_deref()).await
    }

    async fn query_resource_graph(
        &self,
        subscriptions: &[String],
        query: &str,
    ) -> ClientResult<Vec<GraphRow>> {
        let url = self.url("/providers/Microsoft.ResourceGraph/resources");
        let mut rows = Vec::new();
        let mut skip_token: Option<String> = None;

        for _ in 0..MAX_PAGES {
            let mut options = serde_json::json!({ "resultFormat": "objectArray" });
            if let Some(token) = &skip_token {
                options["$skipToken"] = serde_json::Value::String(token.clone());
            }
            let body = serde_json::json!({
                "subscriptions": subscriptions,
                "query": query,
                "options": options,
            });
            let request = self
                .http
                .post(&url)
                .query(&[("api-version", GRAPH_API_VERSION)])
                .json(&body);

            let page: GraphPage = self.send(request, BadRequest::Query).await?;
            rows.extend(page.data);
            match page.skip_token {
                Some(token) if !token.is_empty() => skip_token = Some(token),
                _ => break,
            }
        }

        debug!(rows = rows.len(), "resource graph query complete");
        Ok(rows)
    }

    async fn fetch_metrics(&self, query: &MetricQuery) -> ClientResult<Vec<MetricSample>> {
        let aggregation = query
            .aggregations
            .iter()
            .map(Aggregation::api_name)
            .collect::<Vec<_>>()
            .join(",");
        let mut params: Vec<(&str, String)> = vec![
            ("api-version", METRICS_API_VERSION.to_string()),
            ("metricnames", query.metrics.join(",")),
            ("timespan", query.timespan.clone()),
            ("aggregation", aggregation),
        ];
        if let Some(interval) = &query.interval {
            params.push(("interval", interval.clone()));
        }
        if let Some(namespace) = &query.namespace {
            params.push(("metricnamespace", namespace.clone()));
        }
        if let Some(filter) = &query.filter {
            params.push(("$filter", filter.clone()));
        }
        if let Some(top) = query.top {
            params.push(("top", top.to_string()));
        }
        if let Some(order_by) = &query.order_by {
            params.push(("orderby", order_by.clone()));
        }

        let url = self.url(&format!(
            "{}/providers/Microsoft.Insights/metrics",
            query.resource_id.trim_end_matches('/')
        ));
        let request = self.http.get(url).query(&params);
        let envelope: MetricsEnvelope = self.send(request, BadRequest::Metric).await?;
        Ok(envelope.into_samples(&query.aggregations))
    }

    async fn resource_tags(&self, resource_id: &str) -> ClientResult<BTreeMap<String, String>> {
        let url = self.url(&format!(
            "{}/providers/Microsoft.Resources/tags/default",
            resource_id.trim_end_matches('/')
        ));
        let request = self.http.get(url).query(&[("api-version", TAGS_API_VERSION)]);
        let body: TagsResource = self.send(request, BadRequest::Filter).await?;
        Ok(body.properties.tags.unwrap_or_default())
    }
}

// ── Status mapping ─────────────────────────────────────────────

#[derive(Deserialize, Default)]
struct ErrorEnvelope {
    #[serde(default)]
    error: Option<ErrorBody>,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

fn classify(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
    bad_request: BadRequest,
) -> ClientError {
    let envelope: ErrorEnvelope = serde_json::from_str(body).unwrap_or_default();
    let message = match envelope.error {
        Some(e) if !e.code.is_empty() => format!("{}: {}", e.code, e.message),
        Some(e) => e.message,
        None => body.chars().take(512).collect(),
    };

    match status {
        StatusCode::NOT_FOUND => ClientError::NotFound(message),
        StatusCode::TOO_MANY_REQUESTS => ClientError::Throttled {
            message,
            retry_after,
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ClientError::Auth(message),
        StatusCode::BAD_REQUEST => match bad_request {
            BadRequest::Filter => ClientError::InvalidFilter(message),
            BadRequest::Query => ClientError::InvalidQuery(message),
            BadRequest::Metric => ClientError::InvalidMetric(message),
        },
        StatusCode::REQUEST_TIMEOUT => ClientError::Transient(message),
        s if s.is_server_error() => ClientError::Transient(message),
        s => ClientError::Unexpected {
            status: s.as_u16(),
            message,
        },
    }
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

// ── Wire formats ───────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceListPage {
    #[serde(default)]
    value: Vec<WireResource>,
    #[serde(default)]
    next_link: Option<String>,
}

#[derive(Deserialize)]
struct WireResource {
    id: String,
    #[serde(default, rename = "type")]
    resource_type: Option<String>,
    #[serde(default)]
    tags: Option<BTreeMap<String, String>>,
}

impl From<WireResource> for ResourceRecord {
    fn from(w: WireResource) -> Self {
        ResourceRecord {
            id: w.id,
            resource_type: w.resource_type.unwrap_or_default(),
            tags: w.tags.unwrap_or_default(),
        }
    }
}

#[derive(Deserialize)]
struct GraphPage {
    #[serde(default)]
    data: Vec<GraphRow>,
    #[serde(default, rename = "$skipToken")]
    skip_token: Option<String>,
}

#[derive(Deserialize)]
struct TagsResource {
    properties: TagsProperties,
}

#[derive(Deserialize)]
struct TagsProperties {
    #[serde(default)]
    tags: Option<BTreeMap<String, String>>,
}

#[derive(Deserialize)]
struct MetricsEnvelope {
    #[serde(default)]
    value: Vec<MetricDefinition>,
}

#[derive(Deserialize)]
struct LocalizableString {
    value: String,
}

#[derive(Deserialize)]
struct MetricDefinition {
    name: LocalizableString,
    #[serde(default)]
    unit: String,
    #[serde(default)]
    timeseries: Vec<TimeSeries>,
}

#[derive(Deserialize)]
struct TimeSeries {
    #[serde(default)]
    metadatavalues: Vec<MetadataValue>,
    #[serde(default)]
    data: Vec<DataPoint>,
}

#[derive(Deserialize)]
struct MetadataValue {
    name: LocalizableString,
    #[serde(default)]
    value: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DataPoint {
    time_stamp: DateTime<Utc>,
    average: Option<f64>,
    minimum: Option<f64>,
    maximum: Option<f64>,
    total: Option<f64>,
    count: Option<f64>,
}

impl DataPoint {
    fn value(&self, aggregation: Aggregation) -> Option<f64> {
        match aggregation {
            Aggregation::Average => self.average,
            Aggregation::Minimum => self.minimum,
            Aggregation::Maximum => self.maximum,
            Aggregation::Total => self.total,
            Aggregation::Count => self.count,
        }
    }
}

impl MetricsEnvelope {
    /// Flatten the nested response into one sample per (series, point, aggregation).
    fn into_samples(self, aggregations: &[Aggregation]) -> Vec<MetricSample> {
        let mut samples = Vec::new();
        for metric in self.value {
            for series in &metric.timeseries {
                let dimensions: BTreeMap<String, String> = series
                    .metadatavalues
                    .iter()
                    .map(|m| (m.name.value.clone(), m.value.clone()))
                    .collect();
                for point in &series.data {
                    for &aggregation in aggregations {
                        if let Some(value) = point.value(aggregation) {
                            samples.push(MetricSample {
                                metric: metric.name.value.clone(),
                                unit: metric.unit.clone(),
                                dimensions: dimensions.clone(),
                                aggregation,
                                timestamp: point.time_stamp,
                                value,
                            });
                        }
                    }
                }
            }
        }
        samples
    }
}
