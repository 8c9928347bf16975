//! Bounded concurrent metric fetching.
//!
//! Every target yields exactly one [`FetchOutcome`], in target order. A
//! failing target never affects its siblings; cancellation turns whatever
//! has not finished yet into [`FetchError::Cancelled`].

use std::sync::Arc;

use azmon_client::{ClientError, MetricQuery, MetricsClient};
use azmon_core::{
    FetchError, FetchOutcome, MetricSample, ProbeSpec, ResolvedTarget, RetryConfig, Signature,
    SignatureBuilder,
};
use tracing::{debug, warn};

use crate::budget::{Cancellation, ConcurrencyBudget};
use crate::cache::Caches;

pub struct MetricFetcher {
    client: Arc<dyn MetricsClient>,
    caches: Arc<Caches>,
    budget: ConcurrencyBudget,
    retry: RetryConfig,
}

impl MetricFetcher {
    pub fn new(
        client: Arc<dyn MetricsClient>,
        caches: Arc<Caches>,
        budget: ConcurrencyBudget,
        retry: RetryConfig,
    ) -> Self {
        Self {
            client,
            caches,
            budget,
            retry,
        }
    }

    /// Fetch metrics for every target under the concurrency budget.
    pub async fn fetch(
        &self,
        spec: &ProbeSpec,
        targets: &[ResolvedTarget],
        cancel: &Cancellation,
    ) -> Vec<FetchOutcome> {
        self.budget
            .run(
                targets,
                cancel,
                |_, target| self.fetch_target(spec, target),
                || FetchOutcome::Failure(FetchError::Cancelled),
            )
            .await
    }

    async fn fetch_target(&self, spec: &ProbeSpec, target: &ResolvedTarget) -> FetchOutcome {
        let query = metric_query(spec, target);
        let signature = metric_signature(&query);

        if let Some(samples) = self.caches.metrics.get(&signature) {
            return FetchOutcome::Success(samples);
        }

        match self.fetch_with_retry(&query).await {
            Ok(samples) => {
                let samples = Arc::new(samples);
                self.caches
                    .metrics
                    .insert(signature, samples.clone(), spec.cache_ttl);
                FetchOutcome::Success(samples)
            }
            Err(err) => {
                warn!(
                    resource_id = %target.resource_id,
                    kind = err.kind(),
                    error = %err,
                    "metric fetch failed"
                );
                FetchOutcome::Failure(err)
            }
        }
    }

    /// Call the client, retrying throttled and transient failures with
    /// exponential backoff. A server `Retry-After` hint replaces the computed
    /// delay, capped at the configured maximum.
    async fn fetch_with_retry(&self, query: &MetricQuery) -> Result<Vec<MetricSample>, FetchError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let err = match self.client.fetch_metrics(query).await {
                Ok(samples) => return Ok(samples),
                Err(err) => err,
            };

            let retry_after = err.retry_after();
            let err = fetch_error(err);
            if !err.is_retryable() || attempt >= max_attempts {
                return Err(err);
            }

            let delay = match retry_after {
                Some(hint) => hint.min(self.retry.max_delay),
                None => self.retry.backoff(attempt),
            };
            debug!(
                resource_id = %query.resource_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                kind = err.kind(),
                "retrying metric fetch"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// The metrics API query for one target.
pub fn metric_query(spec: &ProbeSpec, target: &ResolvedTarget) -> MetricQuery {
    MetricQuery {
        resource_id: target.resource_id.clone(),
        metrics: spec.metrics.clone(),
        namespace: spec.metric_namespace.clone(),
        aggregations: spec.aggregations.clone(),
        timespan: spec.timespan.clone(),
        interval: spec.interval.clone(),
        filter: spec.metric_filter.clone(),
        top: spec.metric_top,
        order_by: spec.metric_order_by.clone(),
    }
}

/// Cache key over everything that changes the metrics API response.
pub fn metric_signature(query: &MetricQuery) -> Signature {
    SignatureBuilder::new("metrics")
        .field_ci("resource", &query.resource_id)
        .set("metrics", &query.metrics)
        .opt("namespace", query.namespace.as_deref().map(str::to_lowercase).as_deref())
        .set("aggregations", query.aggregations.iter().map(|a| a.as_str()))
        .field("timespan", &query.timespan)
        .opt("interval", query.interval.as_deref())
        .opt("filter", query.filter.as_deref())
        .opt("top", query.top.map(|t| t.to_string()).as_deref())
        .opt("orderBy", query.order_by.as_deref())
        .finish()
}

/// Collapse a client error into the per-target failure kinds.
///
/// Authentication and unexpected responses are retried like transient
/// failures; credentials may be mid-rotation.
fn fetch_error(err: ClientError) -> FetchError {
    match err {
        ClientError::NotFound(m) => FetchError::NotFound(m),
        ClientError::InvalidMetric(m) | ClientError::InvalidFilter(m) | ClientError::InvalidQuery(m) => {
            FetchError::InvalidMetric(m)
        }
        ClientError::Throttled { message, .. } => FetchError::Throttled(message),
        other @ (ClientError::Transient(_)
        | ClientError::Auth(_)
        | ClientError::Unexpected { .. }
        | ClientError::Decode(_)) => FetchError::Transient(other.to_string()),
    }
}
