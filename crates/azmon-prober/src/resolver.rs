//! Target resolution: turns a probe request into the list of resources to
//! collect metrics for.
//!
//! Resource and scrape modes name their targets explicitly and never touch
//! the remote API. List, subscription and resource graph modes enumerate
//! targets remotely and cache the result under the resolution cache.
//! Remote enumeration is bound to the request's [`Cancellation`]: a listing
//! still running at the deadline fails the request.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use azmon_client::{GraphRow, MetricsClient, ResourceRecord};
use azmon_core::{ProbeMode, ProbeSpec, ResolvedTarget, Signature, SignatureBuilder, resource};
use futures::{StreamExt, TryStreamExt, stream};
use serde_json::Value;
use tracing::{debug, warn};

use crate::budget::Cancellation;
use crate::cache::Caches;
use crate::error::ResolutionError;

/// Resolves a [`ProbeSpec`] into concrete targets.
pub struct TargetResolver {
    client: Arc<dyn MetricsClient>,
    caches: Arc<Caches>,
    /// Subscriptions listed concurrently in subscription mode.
    subscription_limit: usize,
}

impl TargetResolver {
    pub fn new(client: Arc<dyn MetricsClient>, caches: Arc<Caches>, subscription_limit: usize) -> Self {
        Self {
            client,
            caches,
            subscription_limit: subscription_limit.max(1),
        }
    }

    /// Resolve targets for `spec`. An empty result is valid.
    pub async fn resolve(
        &self,
        spec: &ProbeSpec,
        cancel: &Cancellation,
    ) -> Result<Arc<Vec<ResolvedTarget>>, ResolutionError> {
        match spec.mode {
            ProbeMode::Resource => {
                let subscription = spec.subscriptions.first().map(String::as_str).unwrap_or("");
                let targets = spec
                    .targets
                    .iter()
                    .map(|id| ResolvedTarget::new(id.as_str(), subscription));
                Ok(Arc::new(dedupe(targets)))
            }
            ProbeMode::Scrape => {
                let targets = spec
                    .targets
                    .iter()
                    .filter_map(|id| ResolvedTarget::from_resource_id(id));
                Ok(Arc::new(dedupe(targets)))
            }
            ProbeMode::List | ProbeMode::Subscription | ProbeMode::ResourceGraph => {
                let signature = resolution_signature(spec);
                let lookup = self
                    .caches
                    .resolution
                    .get_or_fetch(signature, spec.cache_ttl, || self.resolve_remote(spec));
                let targets = tokio::select! {
                    biased;
                    result = lookup => result?,
                    _ = cancel.cancelled() => {
                        warn!(handler = spec.mode.handler(), "target resolution cancelled at deadline");
                        return Err(ResolutionError::DeadlineExceeded);
                    }
                };
                debug!(
                    handler = spec.mode.handler(),
                    targets = targets.len(),
                    "targets resolved"
                );
                Ok(targets)
            }
        }
    }

    async fn resolve_remote(&self, spec: &ProbeSpec) -> Result<Vec<ResolvedTarget>, ResolutionError> {
        match spec.mode {
            ProbeMode::List => {
                let filter = spec.filter.as_deref().unwrap_or("");
                let mut targets = Vec::new();
                for subscription in &spec.subscriptions {
                    let records = self.client.list_resources(subscription, filter).await?;
                    targets.extend(records_to_targets(subscription, records));
                }
                Ok(dedupe(targets))
            }
            ProbeMode::Subscription => {
                let resource_type = spec
                    .resource_type
                    .as_deref()
                    .or(spec.metric_namespace.as_deref());
                // `buffered` keeps subscription order in the result. The
                // futures are collected up front so the stream is `Send`.
                let lookups: Vec<_> = spec
                    .subscriptions
                    .iter()
                    .map(|subscription| async move {
                        let records = self
                            .client
                            .list_subscription_resources(subscription, resource_type)
                            .await?;
                        Ok::<Vec<ResolvedTarget>, ResolutionError>(
                            records_to_targets(subscription, records).collect(),
                        )
                    })
                    .collect();
                let listings: Vec<Vec<ResolvedTarget>> = stream::iter(lookups)
                    .buffered(self.subscription_limit)
                    .try_collect()
                    .await?;
                Ok(dedupe(listings.into_iter().flatten()))
            }
            ProbeMode::ResourceGraph => {
                let query = spec.query.as_deref().unwrap_or("");
                let rows = self
                    .client
                    .query_resource_graph(&spec.subscriptions, query)
                    .await?;
                Ok(dedupe(rows.iter().filter_map(row_to_target)))
            }
            ProbeMode::Resource | ProbeMode::Scrape => Ok(Vec::new()),
        }
    }
}

fn resolution_signature(spec: &ProbeSpec) -> Signature {
    SignatureBuilder::new("resolution")
        .field("mode", spec.mode.handler())
        .opt("filter", spec.filter.as_deref())
        .opt(
            "resourceType",
            spec.resource_type.as_deref().map(str::to_lowercase).as_deref(),
        )
        .opt("query", spec.query.as_deref())
        .set("subscriptions", &spec.subscriptions)
        .finish()
}

fn records_to_targets(
    subscription: &str,
    records: Vec<ResourceRecord>,
) -> impl Iterator<Item = ResolvedTarget> + '_ {
    records
        .into_iter()
        .map(move |record| ResolvedTarget::new(record.id, subscription))
}

/// One graph row becomes one target. Rows without an `id` are skipped.
fn row_to_target(row: &GraphRow) -> Option<ResolvedTarget> {
    let Some(id) = row.get("id").and_then(Value::as_str).filter(|id| !id.is_empty()) else {
        warn!(columns = row.len(), "resource graph row without id column, skipping");
        return None;
    };

    let subscription = row
        .get("subscriptionId")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or_else(|| resource::subscription_of(id))
        .unwrap_or_default();

    let labels: BTreeMap<String, String> = row
        .iter()
        .filter(|(column, _)| column.as_str() != "id" && column.as_str() != "subscriptionId")
        .filter_map(|(column, value)| {
            let value = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                // Null, arrays and objects have no label form.
                _ => return None,
            };
            Some((column.clone(), value))
        })
        .collect();

    Some(ResolvedTarget::new(id, subscription).with_labels(labels))
}

/// Drop duplicate resource IDs (case-insensitive). The first occurrence wins.
fn dedupe(targets: impl IntoIterator<Item = ResolvedTarget>) -> Vec<ResolvedTarget> {
    let mut seen = HashSet::new();
    targets
        .into_iter()
        .filter(|t| seen.insert(resource::normalize(&t.resource_id)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use azmon_client::{ClientError, StubClient};
    use azmon_core::{CacheConfig, ProberConfig};
    use serde_json::json;
    use std::time::Duration;

    use crate::params::parse_probe_spec;

    const SUB_A: &str = "00000000-0000-0000-0000-00000000000a";
    const SUB_B: &str = "00000000-0000-0000-0000-00000000000b";

    fn vm(sub: &str, name: &str) -> String {
        format!("/subscriptions/{sub}/resourceGroups/rg/providers/Microsoft.Compute/virtualMachines/{name}")
    }

    fn caches(enabled: bool) -> Arc<Caches> {
        Arc::new(Caches::new(&CacheConfig {
            enabled,
            ttl: Duration::from_secs(60),
            resolution_ttl: Duration::from_secs(60),
            max_entries: 100,
        }))
    }

    fn spec(mode: ProbeMode, raw: &[(&str, &str)]) -> ProbeSpec {
        let pairs: Vec<(String, String)> = raw
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        parse_probe_spec(mode, &pairs, &ProberConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn resource_mode_passes_targets_through() {
        let stub = Arc::new(StubClient::new());
        let resolver = TargetResolver::new(stub.clone(), caches(true), 5);
        let (a, b) = (vm(SUB_A, "a"), vm(SUB_A, "b"));
        let spec = spec(
            ProbeMode::Resource,
            &[("subscription", SUB_A), ("target", &a), ("target", &b), ("metric", "cpu")],
        );

        let targets = resolver.resolve(&spec, &Cancellation::never()).await.unwrap();
        let ids: Vec<_> = targets.iter().map(|t| t.resource_id.as_str()).collect();
        assert_eq!(ids, vec![a.as_str(), b.as_str()]);
        assert!(targets.iter().all(|t| t.subscription_id == SUB_A));
        assert_eq!(stub.listing_calls(), 0);
    }

    #[tokio::test]
    async fn scrape_mode_derives_subscription_per_target() {
        let stub = Arc::new(StubClient::new());
        let resolver = TargetResolver::new(stub, caches(true), 5);
        let (a, b) = (vm(SUB_A, "a"), vm(SUB_B, "b"));
        let spec = spec(
            ProbeMode::Scrape,
            &[("target", &a), ("target", &b), ("metric", "cpu")],
        );

        let targets = resolver.resolve(&spec, &Cancellation::never()).await.unwrap();
        assert_eq!(targets[0].subscription_id, SUB_A);
        assert_eq!(targets[1].subscription_id, SUB_B);
    }

    #[tokio::test]
    async fn list_mode_uses_filter_and_cache() {
        let stub = Arc::new(StubClient::new().with_resources(
            SUB_A,
            vec![
                ResourceRecord::new(vm(SUB_A, "a")),
                ResourceRecord::new(vm(SUB_A, "b")),
                ResourceRecord::new(vm(SUB_A, "A")),
            ],
        ));
        let resolver = TargetResolver::new(stub.clone(), caches(true), 5);
        let spec = spec(
            ProbeMode::List,
            &[("subscription", SUB_A), ("filter", "resourceType eq 'x'"), ("metric", "cpu")],
        );

        let first = resolver.resolve(&spec, &Cancellation::never()).await.unwrap();
        let second = resolver.resolve(&spec, &Cancellation::never()).await.unwrap();

        // Case-insensitive duplicate dropped, first wins.
        assert_eq!(first.len(), 2);
        assert_eq!(first.as_slice(), second.as_slice());
        assert_eq!(stub.listing_calls(), 1);
    }

    #[tokio::test]
    async fn list_mode_without_cache_calls_every_time() {
        let stub = Arc::new(StubClient::new().with_resources(SUB_A, vec![]));
        let resolver = TargetResolver::new(stub.clone(), caches(false), 5);
        let spec = spec(
            ProbeMode::List,
            &[("subscription", SUB_A), ("filter", "x"), ("metric", "cpu")],
        );

        assert!(resolver.resolve(&spec, &Cancellation::never()).await.unwrap().is_empty());
        assert!(resolver.resolve(&spec, &Cancellation::never()).await.unwrap().is_empty());
        assert_eq!(stub.listing_calls(), 2);
    }

    #[tokio::test]
    async fn list_mode_maps_filter_errors() {
        let stub = Arc::new(StubClient::new().with_listing_error(ClientError::InvalidFilter("bad".into())));
        let resolver = TargetResolver::new(stub, caches(true), 5);
        let spec = spec(
            ProbeMode::List,
            &[("subscription", SUB_A), ("filter", "nonsense"), ("metric", "cpu")],
        );

        let err = resolver.resolve(&spec, &Cancellation::never()).await.unwrap_err();
        assert_eq!(err, ResolutionError::InvalidFilter("bad".into()));
    }

    #[tokio::test]
    async fn subscription_mode_spans_subscriptions() {
        let mut vm_a = ResourceRecord::new(vm(SUB_A, "a"));
        vm_a.resource_type = "Microsoft.Compute/virtualMachines".into();
        let mut disk = ResourceRecord::new(format!("/subscriptions/{SUB_A}/resourceGroups/rg/providers/Microsoft.Compute/disks/d"));
        disk.resource_type = "Microsoft.Compute/disks".into();
        let mut vm_b = ResourceRecord::new(vm(SUB_B, "b"));
        vm_b.resource_type = "Microsoft.Compute/virtualMachines".into();

        let stub = Arc::new(
            StubClient::new()
                .with_resources(SUB_A, vec![vm_a, disk])
                .with_resources(SUB_B, vec![vm_b]),
        );
        let resolver = TargetResolver::new(stub, caches(true), 5);
        let subs = format!("{SUB_A},{SUB_B}");
        let spec = spec(
            ProbeMode::Subscription,
            &[
                ("subscription", &subs),
                ("metricNamespace", "Microsoft.Compute/virtualMachines"),
                ("metric", "cpu"),
            ],
        );

        let targets = resolver.resolve(&spec, &Cancellation::never()).await.unwrap();
        let pairs: Vec<_> = targets
            .iter()
            .map(|t| (t.subscription_id.as_str(), t.resource_id.rsplit('/').next().unwrap()))
            .collect();
        assert_eq!(pairs, vec![(SUB_A, "a"), (SUB_B, "b")]);
    }

    #[tokio::test]
    async fn subscription_mode_unavailable_remote() {
        let stub = Arc::new(StubClient::new().with_listing_error(ClientError::Transient("503".into())));
        let resolver = TargetResolver::new(stub, caches(true), 5);
        let spec = spec(
            ProbeMode::Subscription,
            &[("subscription", SUB_A), ("resourceType", "x"), ("metric", "cpu")],
        );

        let err = resolver.resolve(&spec, &Cancellation::never()).await.unwrap_err();
        assert!(matches!(err, ResolutionError::RemoteUnavailable(_)));
    }

    #[tokio::test]
    async fn graph_rows_become_targets_with_labels() {
        let rows = vec![
            json!({"id": vm(SUB_A, "a"), "subscriptionId": SUB_A, "location": "westeurope", "cores": 4, "tags": {"x": "y"}}),
            json!({"name": "no-id"}),
            json!({"id": vm(SUB_B, "b"), "spot": false, "zone": null}),
        ]
        .into_iter()
        .map(|v| v.as_object().cloned().unwrap())
        .collect();

        let stub = Arc::new(StubClient::new().with_graph_rows(rows));
        let resolver = TargetResolver::new(stub.clone(), caches(true), 5);
        let spec = spec(
            ProbeMode::ResourceGraph,
            &[("subscription", SUB_A), ("query", "Resources | project id"), ("metric", "cpu")],
        );

        let targets = resolver.resolve(&spec, &Cancellation::never()).await.unwrap();
        assert_eq!(targets.len(), 2);

        assert_eq!(targets[0].subscription_id, SUB_A);
        assert_eq!(targets[0].extra_labels.get("location").map(String::as_str), Some("westeurope"));
        assert_eq!(targets[0].extra_labels.get("cores").map(String::as_str), Some("4"));
        assert!(!targets[0].extra_labels.contains_key("tags"));

        // Subscription falls back to the resource ID.
        assert_eq!(targets[1].subscription_id, SUB_B);
        assert_eq!(targets[1].extra_labels.get("spot").map(String::as_str), Some("false"));
        assert!(!targets[1].extra_labels.contains_key("zone"));

        assert_eq!(stub.graph_calls(), 1);
    }

    #[tokio::test]
    async fn graph_syntax_errors_are_distinguished() {
        let stub = Arc::new(StubClient::new().with_graph_error(ClientError::InvalidQuery("parse error".into())));
        let resolver = TargetResolver::new(stub, caches(true), 5);
        let spec = spec(
            ProbeMode::ResourceGraph,
            &[("subscription", SUB_A), ("query", "Resources |"), ("metric", "cpu")],
        );

        let err = resolver.resolve(&spec, &Cancellation::never()).await.unwrap_err();
        assert_eq!(err, ResolutionError::GraphQuerySyntax("parse error".into()));
    }

    #[tokio::test]
    async fn subscription_listing_respects_subscription_budget() {
        let subs: Vec<String> = (0..6).map(|i| format!("00000000-0000-0000-0000-00000000010{i}")).collect();
        let mut stub = StubClient::new().with_listing_latency(Duration::from_millis(20));
        for sub in &subs {
            stub = stub.with_resources(sub, vec![ResourceRecord::new(vm(sub, "a"))]);
        }
        let stub = Arc::new(stub);
        let resolver = TargetResolver::new(stub.clone(), caches(false), 2);
        let joined = subs.join(",");
        let spec = spec(
            ProbeMode::Subscription,
            &[("subscription", &joined), ("resourceType", "x"), ("metric", "cpu")],
        );

        let targets = resolver.resolve(&spec, &Cancellation::never()).await.unwrap();

        let order: Vec<_> = targets.iter().map(|t| t.subscription_id.as_str()).collect();
        assert_eq!(order, subs.iter().map(String::as_str).collect::<Vec<_>>());
        assert_eq!(stub.listing_calls(), 6);
        assert_eq!(stub.peak_listings_in_flight(), 2);
    }

    #[tokio::test]
    async fn slow_listing_fails_at_deadline() {
        let stub = Arc::new(
            StubClient::new()
                .with_resources(SUB_A, vec![ResourceRecord::new(vm(SUB_A, "a"))])
                .with_listing_latency(Duration::from_secs(5)),
        );
        let resolver = TargetResolver::new(stub.clone(), caches(true), 5);
        let spec = spec(
            ProbeMode::List,
            &[("subscription", SUB_A), ("filter", "x"), ("metric", "cpu")],
        );
        let cancel = Cancellation::with_deadline(
            tokio::time::Instant::now() + Duration::from_millis(50),
        );

        let started = std::time::Instant::now();
        let err = resolver.resolve(&spec, &cancel).await.unwrap_err();

        assert_eq!(err, ResolutionError::DeadlineExceeded);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(stub.listing_calls(), 1);
        // Nothing is cached for an abandoned listing.
        assert!(resolver.caches.resolution.is_empty());
    }

    #[tokio::test]
    async fn explicit_targets_ignore_an_expired_deadline() {
        let stub = Arc::new(StubClient::new());
        let resolver = TargetResolver::new(stub, caches(true), 5);
        let a = vm(SUB_A, "a");
        let spec = spec(
            ProbeMode::Resource,
            &[("subscription", SUB_A), ("target", &a), ("metric", "cpu")],
        );
        let (handle, cancel) = Cancellation::new(None);
        handle.cancel();

        let targets = resolver.resolve(&spec, &cancel).await.unwrap();
        assert_eq!(targets.len(), 1);
    }

    #[test]
    fn signature_ignores_subscription_order() {
        let a = spec(
            ProbeMode::Subscription,
            &[("subscription", "x,y"), ("resourceType", "T"), ("metric", "cpu")],
        );
        let b = spec(
            ProbeMode::Subscription,
            &[("subscription", "y"), ("subscription", "x"), ("resourceType", "t"), ("metric", "other")],
        );
        assert_eq!(resolution_signature(&a), resolution_signature(&b));
    }
}
