//! In-memory [`MetricsClient`] for tests.
//!
//! Responses are programmed per subscription / resource. Queued metric
//! errors are returned before the configured samples, which lets a test
//! script "throttled, throttled, success". Every call is counted, and the
//! peak number of concurrent metric fetches is tracked so tests can assert
//! on concurrency budgets.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use azmon_core::MetricSample;
use azmon_core::resource::normalize;

use crate::MetricsClient;
use crate::error::{ClientError, ClientResult};
use crate::types::{GraphRow, MetricQuery, ResourceRecord};

#[derive(Default)]
pub struct StubClient {
    resources: Mutex<HashMap<String, Vec<ResourceRecord>>>,
    listing_error: Mutex<Option<ClientError>>,
    graph_rows: Mutex<Vec<GraphRow>>,
    graph_error: Mutex<Option<ClientError>>,
    metrics: Mutex<HashMap<String, Vec<MetricSample>>>,
    metric_errors: Mutex<HashMap<String, VecDeque<ClientError>>>,
    tags: Mutex<HashMap<String, BTreeMap<String, String>>>,
    tag_errors: Mutex<HashMap<String, ClientError>>,
    latency: Mutex<Option<Duration>>,
    listing_latency: Mutex<Option<Duration>>,

    listing_calls: AtomicUsize,
    graph_calls: AtomicUsize,
    metric_calls: AtomicUsize,
    tag_calls: AtomicUsize,
    per_resource_calls: Mutex<HashMap<String, usize>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    listings_in_flight: AtomicUsize,
    peak_listings_in_flight: AtomicUsize,
}

impl StubClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resources returned for a subscription by both listing operations.
    pub fn with_resources(self, subscription_id: &str, records: Vec<ResourceRecord>) -> Self {
        self.resources
            .lock()
            .unwrap()
            .insert(subscription_id.to_string(), records);
        self
    }

    /// Every listing call fails with `error`.
    pub fn with_listing_error(self, error: ClientError) -> Self {
        *self.listing_error.lock().unwrap() = Some(error);
        self
    }

    pub fn with_graph_rows(self, rows: Vec<GraphRow>) -> Self {
        *self.graph_rows.lock().unwrap() = rows;
        self
    }

    pub fn with_graph_error(self, error: ClientError) -> Self {
        *self.graph_error.lock().unwrap() = Some(error);
        self
    }

    /// Samples returned for every successful fetch of `resource_id`.
    pub fn with_metrics(self, resource_id: &str, samples: Vec<MetricSample>) -> Self {
        self.metrics
            .lock()
            .unwrap()
            .insert(normalize(resource_id), samples);
        self
    }

    /// Queue an error returned by the next fetch of `resource_id`.
    pub fn push_metric_error(self, resource_id: &str, error: ClientError) -> Self {
        self.metric_errors
            .lock()
            .unwrap()
            .entry(normalize(resource_id))
            .or_default()
            .push_back(error);
        self
    }

    pub fn with_tags(self, resource_id: &str, tags: BTreeMap<String, String>) -> Self {
        self.tags
            .lock()
            .unwrap()
            .insert(normalize(resource_id), tags);
        self
    }

    /// Every tag lookup of `resource_id` fails with `error`.
    pub fn with_tag_error(self, resource_id: &str, error: ClientError) -> Self {
        self.tag_errors
            .lock()
            .unwrap()
            .insert(normalize(resource_id), error);
        self
    }

    /// Delay applied to every metric fetch.
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.lock().unwrap() = Some(latency);
        self
    }

    /// Delay applied to every listing and resource graph call.
    pub fn with_listing_latency(self, latency: Duration) -> Self {
        *self.listing_latency.lock().unwrap() = Some(latency);
        self
    }

    pub fn listing_calls(&self) -> usize {
        self.listing_calls.load(Ordering::SeqCst)
    }

    pub fn graph_calls(&self) -> usize {
        self.graph_calls.load(Ordering::SeqCst)
    }

    pub fn metric_calls(&self) -> usize {
        self.metric_calls.load(Ordering::SeqCst)
    }

    pub fn metric_calls_for(&self, resource_id: &str) -> usize {
        self.per_resource_calls
            .lock()
            .unwrap()
            .get(&normalize(resource_id))
            .copied()
            .unwrap_or(0)
    }

    pub fn tag_calls(&self) -> usize {
        self.tag_calls.load(Ordering::SeqCst)
    }

    /// Highest number of metric fetches observed running at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of listing calls observed running at once.
    pub fn peak_listings_in_flight(&self) -> usize {
        self.peak_listings_in_flight.load(Ordering::SeqCst)
    }

    async fn listing_delay(&self) -> InFlight<'_> {
        let current = self.listings_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_listings_in_flight.fetch_max(current, Ordering::SeqCst);
        let guard = InFlight(&self.listings_in_flight);
        let latency = *self.listing_latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        guard
    }

    async fn listing(&self, subscription_id: &str) -> ClientResult<Vec<ResourceRecord>> {
        self.listing_calls.fetch_add(1, Ordering::SeqCst);
        let _guard = self.listing_delay().await;
        if let Some(err) = self.listing_error.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(self
            .resources
            .lock()
            .unwrap()
            .get(subscription_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Decrements the in-flight counter when a fetch finishes or is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl MetricsClient for StubClient {
    async fn list_resources(
        &self,
        subscription_id: &str,
        _filter: &str,
    ) -> ClientResult<Vec<ResourceRecord>> {
        self.listing(subscription_id).await
    }

    async fn list_subscription_resources(
        &self,
        subscription_id: &str,
        resource_type: Option<&str>,
    ) -> ClientResult<Vec<ResourceRecord>> {
        let records = self.listing(subscription_id).await?;
        Ok(match resource_type {
            Some(t) => records
                .into_iter()
                .filter(|r| r.resource_type.is_empty() || r.resource_type.eq_ignore_ascii_case(t))
                .collect(),
            None => records,
        })
    }

    async fn query_resource_graph(
        &self,
        _subscriptions: &[String],
        _query: &str,
    ) -> ClientResult<Vec<GraphRow>> {
        self.graph_calls.fetch_add(1, Ordering::SeqCst);
        let _guard = self.listing_delay().await;
        if let Some(err) = self.graph_error.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(self.graph_rows.lock().unwrap().clone())
    }

    async fn fetch_metrics(&self, query: &MetricQuery) -> ClientResult<Vec<MetricSample>> {
        let key = normalize(&query.resource_id);
        self.metric_calls.fetch_add(1, Ordering::SeqCst);
        *self
            .per_resource_calls
            .lock()
            .unwrap()
            .entry(key.clone())
            .or_default() += 1;

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let queued = self
            .metric_errors
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(VecDeque::pop_front);
        if let Some(err) = queued {
            return Err(err);
        }

        self.metrics
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(query.resource_id.clone()))
    }

    async fn resource_tags(&self, resource_id: &str) -> ClientResult<BTreeMap<String, String>> {
        let key = normalize(resource_id);
        self.tag_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.tag_errors.lock().unwrap().get(&key).cloned() {
            return Err(err);
        }
        Ok(self.tags.lock().unwrap().get(&key).cloned().unwrap_or_default())
    }
}
