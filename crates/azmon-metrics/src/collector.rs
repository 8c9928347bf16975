//! Probe instrumentation — tracks the bridge's own request metrics.
//!
//! Counters are atomics behind a read-mostly map; a new label combination
//! takes the write lock once. Latency summaries keep a bounded window of
//! recent observations for quantiles plus running sum and count.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::prometheus::{MetricFamily, MetricKind, Sample};

/// Observations retained per summary series for quantile computation.
const SUMMARY_WINDOW: usize = 1024;

const QUANTILES: [f64; 3] = [0.5, 0.9, 0.99];

/// Outcome of a whole probe request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestResult {
    /// Every target returned samples.
    Success,
    /// At least one target failed but the request completed.
    PartialFailure,
    /// The request was rejected or its resolution failed.
    Failure,
}

impl RequestResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestResult::Success => "success",
            RequestResult::PartialFailure => "partial-failure",
            RequestResult::Failure => "failure",
        }
    }
}

/// Point-in-time statistics of one response cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub cache: &'static str,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

type LabelValues = Vec<String>;

/// Counter keyed by label values.
#[derive(Default)]
struct CounterVec {
    series: RwLock<BTreeMap<LabelValues, Arc<AtomicU64>>>,
}

impl CounterVec {
    async fn inc(&self, labels: LabelValues) {
        if let Some(counter) = self.series.read().await.get(&labels) {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let mut series = self.series.write().await;
        series
            .entry(labels)
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .fetch_add(1, Ordering::Relaxed);
    }

    async fn get(&self, labels: &[&str]) -> u64 {
        let key: LabelValues = labels.iter().map(|l| l.to_string()).collect();
        self.series
            .read()
            .await
            .get(&key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    async fn total(&self) -> u64 {
        self.series
            .read()
            .await
            .values()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }

    async fn samples(&self, names: &[&str]) -> Vec<Sample> {
        self.series
            .read()
            .await
            .iter()
            .map(|(values, counter)| {
                Sample::new(zip_labels(names, values), counter.load(Ordering::Relaxed) as f64)
            })
            .collect()
    }
}

/// One latency series.
#[derive(Default)]
struct Summary {
    count: AtomicU64,
    /// Sum of observations in microseconds.
    sum_us: AtomicU64,
    window: Mutex<VecDeque<f64>>,
}

#[derive(Default)]
struct SummaryVec {
    series: RwLock<BTreeMap<LabelValues, Arc<Summary>>>,
}

impl SummaryVec {
    async fn observe(&self, labels: LabelValues, elapsed: Duration) {
        let summary = {
            let existing = self.series.read().await.get(&labels).cloned();
            match existing {
                Some(s) => s,
                None => self.series.write().await.entry(labels).or_default().clone(),
            }
        };
        summary.count.fetch_add(1, Ordering::Relaxed);
        summary
            .sum_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        let mut window = summary.window.lock().await;
        if window.len() == SUMMARY_WINDOW {
            window.pop_front();
        }
        window.push_back(elapsed.as_secs_f64());
    }

    async fn samples(&self, names: &[&str]) -> Vec<Sample> {
        let series = self.series.read().await;
        let mut samples = Vec::new();
        for (values, summary) in series.iter() {
            let labels = zip_labels(names, values);
            let window: Vec<f64> = summary.window.lock().await.iter().copied().collect();
            for q in QUANTILES {
                let mut with_q = labels.clone();
                with_q.push(("quantile".to_string(), q.to_string()));
                samples.push(Sample::new(with_q, quantile(&window, q)));
            }
            let sum = summary.sum_us.load(Ordering::Relaxed) as f64 / 1_000_000.0;
            let count = summary.count.load(Ordering::Relaxed) as f64;
            samples.push(Sample::new(labels.clone(), sum).with_suffix("_sum"));
            samples.push(Sample::new(labels, count).with_suffix("_count"));
        }
        samples
    }
}

/// Process-wide probe instrumentation, injected into the prober.
#[derive(Default)]
pub struct ProbeMetrics {
    collect_time: SummaryVec,
    requests: CounterVec,
    fetch_failures: CounterVec,
    enrichment_failures: CounterVec,
}

impl ProbeMetrics {
    const COLLECT_TIME: &'static str = "azurerm_stats_metric_collecttime";
    const REQUESTS: &'static str = "azurerm_stats_metric_requests";
    const FETCH_FAILURES: &'static str = "azurerm_stats_metric_fetch_failures";
    const ENRICHMENT_FAILURES: &'static str = "azurerm_stats_tag_enrichment_failures";
    const CACHE_REQUESTS: &'static str = "azurerm_stats_cache_requests";
    const CACHE_ENTRIES: &'static str = "azurerm_stats_cache_entries";

    pub fn new() -> Self {
        Self::default()
    }

    /// Record the wall-clock time of one probe request.
    pub async fn observe_collect_time(
        &self,
        subscription: &str,
        handler: &str,
        filter: &str,
        elapsed: Duration,
    ) {
        self.collect_time
            .observe(
                vec![subscription.to_string(), handler.to_string(), filter.to_string()],
                elapsed,
            )
            .await;
    }

    /// Count one probe request by outcome.
    pub async fn record_request(
        &self,
        subscription: &str,
        handler: &str,
        filter: &str,
        result: RequestResult,
    ) {
        self.requests
            .inc(vec![
                subscription.to_string(),
                handler.to_string(),
                filter.to_string(),
                result.as_str().to_string(),
            ])
            .await;
        debug!(%subscription, %handler, result = result.as_str(), "probe request recorded");
    }

    /// Count one target whose metric fetch failed.
    pub async fn record_fetch_failure(&self, handler: &str, kind: &str) {
        self.fetch_failures
            .inc(vec![handler.to_string(), kind.to_string()])
            .await;
    }

    /// Count one target whose tags could not be resolved.
    pub async fn record_enrichment_failure(&self, handler: &str) {
        self.enrichment_failures.inc(vec![handler.to_string()]).await;
    }

    pub async fn request_count(
        &self,
        subscription: &str,
        handler: &str,
        filter: &str,
        result: RequestResult,
    ) -> u64 {
        self.requests
            .get(&[subscription, handler, filter, result.as_str()])
            .await
    }

    /// Fetch failures of one kind for a handler.
    pub async fn fetch_failure_count(&self, handler: &str, kind: &str) -> u64 {
        self.fetch_failures.get(&[handler, kind]).await
    }

    /// Fetch failures across every handler and kind.
    pub async fn total_fetch_failures(&self) -> u64 {
        self.fetch_failures.total().await
    }

    pub async fn enrichment_failure_count(&self, handler: &str) -> u64 {
        self.enrichment_failures.get(&[handler]).await
    }

    /// Build the `/metrics` families, including the given cache statistics.
    pub async fn families(&self, caches: &[CacheStats]) -> Vec<MetricFamily> {
        let mut collect = MetricFamily::new(
            Self::COLLECT_TIME,
            "Azure Insights stats collecttime",
            MetricKind::Summary,
        );
        collect.samples = self
            .collect_time
            .samples(&["subscriptionID", "handler", "filter"])
            .await;

        let mut requests = MetricFamily::new(
            Self::REQUESTS,
            "Azure Insights resource requests",
            MetricKind::Counter,
        );
        requests.samples = self
            .requests
            .samples(&["subscriptionID", "handler", "filter", "result"])
            .await;

        let mut failures = MetricFamily::new(
            Self::FETCH_FAILURES,
            "Azure Insights per-target metric fetch failures",
            MetricKind::Counter,
        );
        failures.samples = self.fetch_failures.samples(&["handler", "kind"]).await;

        let mut enrichment = MetricFamily::new(
            Self::ENRICHMENT_FAILURES,
            "Azure resource tag lookups that failed",
            MetricKind::Counter,
        );
        enrichment.samples = self.enrichment_failures.samples(&["handler"]).await;

        let mut cache_requests = MetricFamily::new(
            Self::CACHE_REQUESTS,
            "Response cache lookups",
            MetricKind::Counter,
        );
        let mut cache_entries = MetricFamily::new(
            Self::CACHE_ENTRIES,
            "Response cache entries",
            MetricKind::Gauge,
        );
        for stats in caches {
            for (result, value) in [
                ("hit", stats.hits),
                ("miss", stats.misses),
                ("eviction", stats.evictions),
            ] {
                cache_requests.samples.push(Sample::new(
                    vec![
                        ("cache".to_string(), stats.cache.to_string()),
                        ("result".to_string(), result.to_string()),
                    ],
                    value as f64,
                ));
            }
            cache_entries.samples.push(Sample::new(
                vec![("cache".to_string(), stats.cache.to_string())],
                stats.entries as f64,
            ));
        }

        vec![collect, requests, failures, enrichment, cache_requests, cache_entries]
    }
}

fn zip_labels(names: &[&str], values: &[String]) -> Vec<(String, String)> {
    names
        .iter()
        .zip(values)
        .map(|(n, v)| (n.to_string(), v.clone()))
        .collect()
}

/// Nearest-rank quantile. Returns NaN for an empty window.
fn quantile(window: &[f64], q: f64) -> f64 {
    if window.is_empty() {
        return f64::NAN;
    }
    let mut sorted = window.to_vec();
    sorted.sort_by(f64::total_cmp);
    let idx = (sorted.len() as f64 * q) as usize;
    sorted[idx.min(sorted.len() - 1)]
}
