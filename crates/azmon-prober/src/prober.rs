//! The probe orchestrator.
//!
//! One probe request moves through a fixed sequence of states:
//!
//! ```text
//! Parsing ─► Resolving ─► Fetching ─► Enriching ─► Formatting ─► Responding ─► Completed
//!    │           │
//!    └───────────┴──────────────────────────────────────────────────────────► Failed
//! ```
//!
//! Only parse and resolution errors fail a request. Per-target fetch and tag
//! failures flow through as partial data and are counted on `/metrics`.

use std::sync::Arc;
use std::time::Duration;

use azmon_client::MetricsClient;
use azmon_core::{FetchOutcome, ProbeMode, ProbeSpec, ProberConfig};
use azmon_metrics::{MetricFamily, ProbeMetrics, RequestResult, render_families};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::budget::{Cancellation, ConcurrencyBudget};
use crate::cache::Caches;
use crate::enricher::{TagEnricher, TagLabels};
use crate::error::ProbeResult;
use crate::fetcher::MetricFetcher;
use crate::formatter::MetricFormatter;
use crate::params::parse_probe_spec;
use crate::resolver::TargetResolver;

/// Margin subtracted from the scraper's timeout so the response is written
/// before the scraper gives up.
const SCRAPE_TIMEOUT_MARGIN: Duration = Duration::from_millis(500);

/// Lifecycle of a single probe request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Parsing,
    Resolving,
    Fetching,
    Enriching,
    Formatting,
    Responding,
    Completed,
    Failed,
}

impl ProbeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeState::Parsing => "parsing",
            ProbeState::Resolving => "resolving",
            ProbeState::Fetching => "fetching",
            ProbeState::Enriching => "enriching",
            ProbeState::Formatting => "formatting",
            ProbeState::Responding => "responding",
            ProbeState::Completed => "completed",
            ProbeState::Failed => "failed",
        }
    }
}

/// A completed probe.
#[derive(Debug)]
pub struct ProbeResponse {
    pub families: Vec<MetricFamily>,
    pub targets: usize,
    pub failed_targets: usize,
    pub result: RequestResult,
}

impl ProbeResponse {
    /// The exposition body. Empty when there are no samples.
    pub fn body(&self) -> String {
        render_families(&self.families)
    }
}

/// Runs probe requests against a [`MetricsClient`].
///
/// Cheap to share behind an `Arc`; caches and instrumentation are
/// process-wide.
pub struct Prober {
    config: Arc<ProberConfig>,
    caches: Arc<Caches>,
    metrics: Arc<ProbeMetrics>,
    resolver: TargetResolver,
    fetcher: MetricFetcher,
    enricher: TagEnricher,
    formatter: MetricFormatter,
}

impl Prober {
    pub fn new(client: Arc<dyn MetricsClient>, config: ProberConfig, metrics: Arc<ProbeMetrics>) -> Self {
        let caches = Arc::new(Caches::new(&config.cache));
        let budget = ConcurrencyBudget::from_config(&config.concurrency);
        Self {
            resolver: TargetResolver::new(client.clone(), caches.clone(), config.concurrency.subscriptions),
            fetcher: MetricFetcher::new(client.clone(), caches.clone(), budget, config.retry.clone()),
            enricher: TagEnricher::new(client, caches.clone(), budget),
            formatter: MetricFormatter::new(&config.templates),
            config: Arc::new(config),
            caches,
            metrics,
        }
    }

    pub fn config(&self) -> &ProberConfig {
        &self.config
    }

    pub fn caches(&self) -> &Caches {
        &self.caches
    }

    pub fn metrics(&self) -> &ProbeMetrics {
        &self.metrics
    }

    /// Deadline for a request, from the scraper's advertised timeout (less a
    /// safety margin) bounded by the configured request timeout.
    pub fn deadline(&self, scrape_timeout: Option<Duration>) -> Instant {
        let limit = self.config.request_timeout;
        let budget = scrape_timeout
            .map(|t| t.saturating_sub(SCRAPE_TIMEOUT_MARGIN))
            .filter(|t| !t.is_zero())
            .map_or(limit, |t| t.min(limit));
        Instant::now() + budget
    }

    /// Render process instrumentation, including cache statistics.
    pub async fn instrumentation(&self) -> String {
        render_families(&self.metrics.families(&self.caches.stats()).await)
    }

    /// Parse raw query parameters and run the probe.
    pub async fn probe(
        &self,
        mode: ProbeMode,
        params: &[(String, String)],
        cancel: Cancellation,
    ) -> ProbeResult<ProbeResponse> {
        let started = Instant::now();
        let handler = mode.handler();
        enter(handler, ProbeState::Parsing);

        let spec = match parse_probe_spec(mode, params, &self.config) {
            Ok(spec) => spec,
            Err(err) => {
                warn!(handler, error = %err, "probe request rejected");
                enter(handler, ProbeState::Failed);
                let subscription = raw_subscriptions(params);
                self.record(&subscription, handler, "", started, RequestResult::Failure)
                    .await;
                return Err(err.into());
            }
        };

        let result = self.execute(&spec, cancel).await;
        let outcome = match &result {
            Ok(response) => response.result,
            Err(_) => RequestResult::Failure,
        };
        self.record(
            &spec.subscription_label(),
            handler,
            spec.filter_label(),
            started,
            outcome,
        )
        .await;
        result
    }

    /// Run an already parsed probe. Does not record request-level
    /// instrumentation.
    pub async fn execute(&self, spec: &ProbeSpec, cancel: Cancellation) -> ProbeResult<ProbeResponse> {
        let handler = spec.mode.handler();

        enter(handler, ProbeState::Resolving);
        let targets = match self.resolver.resolve(spec, &cancel).await {
            Ok(targets) => targets,
            Err(err) => {
                warn!(handler, error = %err, "target resolution failed");
                enter(handler, ProbeState::Failed);
                return Err(err.into());
            }
        };

        enter(handler, ProbeState::Fetching);
        let outcomes = self.fetcher.fetch(spec, &targets, &cancel).await;
        let mut failed_targets = 0;
        for err in outcomes.iter().filter_map(FetchOutcome::error) {
            failed_targets += 1;
            self.metrics.record_fetch_failure(handler, err.kind()).await;
        }

        enter(handler, ProbeState::Enriching);
        let mut tags: Vec<Arc<TagLabels>> = Vec::with_capacity(targets.len());
        for result in self.enricher.enrich_all(spec, &targets, &outcomes, &cancel).await {
            match result {
                Ok(labels) => tags.push(labels),
                Err(err) => {
                    warn!(
                        handler,
                        kind = "enrichment",
                        resource_id = %err.resource_id,
                        error = %err.source,
                        "tag lookup failed"
                    );
                    self.metrics.record_enrichment_failure(handler).await;
                    tags.push(Arc::default());
                }
            }
        }

        enter(handler, ProbeState::Formatting);
        let families = self.formatter.format(spec, &targets, &outcomes, &tags);

        enter(handler, ProbeState::Responding);
        let result = match failed_targets {
            0 => RequestResult::Success,
            n if n == targets.len() => RequestResult::Failure,
            _ => RequestResult::PartialFailure,
        };
        info!(
            handler,
            targets = targets.len(),
            failed_targets,
            families = families.len(),
            result = result.as_str(),
            "probe completed"
        );
        enter(handler, ProbeState::Completed);

        Ok(ProbeResponse {
            families,
            targets: targets.len(),
            failed_targets,
            result,
        })
    }

    async fn record(
        &self,
        subscription: &str,
        handler: &str,
        filter: &str,
        started: Instant,
        result: RequestResult,
    ) {
        self.metrics
            .observe_collect_time(subscription, handler, filter, started.elapsed())
            .await;
        self.metrics
            .record_request(subscription, handler, filter, result)
            .await;
    }
}

fn enter(handler: &str, state: ProbeState) {
    debug!(handler, state = state.as_str(), "probe state");
}

/// Subscription label for a request that failed to parse.
fn raw_subscriptions(params: &[(String, String)]) -> String {
    params
        .iter()
        .filter(|(k, v)| k == "subscription" && !v.trim().is_empty())
        .map(|(_, v)| v.trim())
        .collect::<Vec<_>>()
        .join(",")
}
