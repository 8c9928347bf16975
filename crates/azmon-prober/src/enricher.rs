//! Tag enrichment: resolves configured tag keys on each successful target
//! into `tag_<key>` labels.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use azmon_client::MetricsClient;
use azmon_core::{FetchOutcome, ProbeSpec, ResolvedTarget, Signature, SignatureBuilder};

use crate::budget::{Cancellation, ConcurrencyBudget};
use crate::cache::Caches;
use crate::error::EnrichmentError;

/// Tag values for one target, keyed by the requested tag key.
pub type TagLabels = BTreeMap<String, String>;

pub struct TagEnricher {
    client: Arc<dyn MetricsClient>,
    caches: Arc<Caches>,
    budget: ConcurrencyBudget,
}

impl TagEnricher {
    pub fn new(client: Arc<dyn MetricsClient>, caches: Arc<Caches>, budget: ConcurrencyBudget) -> Self {
        Self {
            client,
            caches,
            budget,
        }
    }

    /// Look up `keys` on one resource. Tags the resource does not carry are
    /// absent from the result.
    pub async fn enrich(
        &self,
        target: &ResolvedTarget,
        keys: &[String],
        ttl: Option<Duration>,
    ) -> Result<Arc<TagLabels>, EnrichmentError> {
        if keys.is_empty() {
            return Ok(Arc::default());
        }
        let cached = self
            .caches
            .tags
            .get_or_fetch(tag_signature(target, keys), ttl, || async {
                self.client
                    .resource_tags(&target.resource_id)
                    .await
                    .map(|tags| select_tags(&tags, keys))
                    .map_err(|source| EnrichmentError {
                        resource_id: target.resource_id.clone(),
                        source,
                    })
            })
            .await?;
        Ok(Arc::new(as_requested(&cached, keys)))
    }

    /// Enrich every successfully fetched target under the budget.
    ///
    /// Failed and cancelled targets get no lookup and an empty label set.
    pub async fn enrich_all(
        &self,
        spec: &ProbeSpec,
        targets: &[ResolvedTarget],
        outcomes: &[FetchOutcome],
        cancel: &Cancellation,
    ) -> Vec<Result<Arc<TagLabels>, EnrichmentError>> {
        if spec.tag_keys.is_empty() {
            return vec![Ok(Arc::default()); targets.len()];
        }
        self.budget
            .run(
                targets,
                cancel,
                |idx, target| async move {
                    match outcomes.get(idx) {
                        Some(outcome) if outcome.is_success() => {
                            self.enrich(target, &spec.tag_keys, spec.cache_ttl).await
                        }
                        _ => Ok(Arc::default()),
                    }
                },
                || Ok(Arc::default()),
            )
            .await
    }
}

fn tag_signature(target: &ResolvedTarget, keys: &[String]) -> Signature {
    SignatureBuilder::new("tags")
        .field_ci("resource", &target.resource_id)
        .set("keys", keys)
        .finish()
}

/// Pick `keys` out of a resource's tags. Tag names match case-insensitively
/// and the result is keyed by the lowercased key, matching the signature.
fn select_tags(tags: &BTreeMap<String, String>, keys: &[String]) -> TagLabels {
    keys.iter()
        .filter_map(|key| {
            tags.iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(key))
                .map(|(_, value)| (key.to_lowercase(), value.clone()))
        })
        .collect()
}

/// Re-key cached tags by the casing this request asked for.
fn as_requested(cached: &TagLabels, keys: &[String]) -> TagLabels {
    keys.iter()
        .filter_map(|key| {
            cached
                .get(&key.to_lowercase())
                .map(|value| (key.clone(), value.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use azmon_client::{ClientError, StubClient};
    use azmon_core::{CacheConfig, FetchError};

    const SUB: &str = "sub";

    fn target(name: &str) -> ResolvedTarget {
        ResolvedTarget::new(format!("/subscriptions/{SUB}/resourceGroups/rg/providers/p/t/{name}"), SUB)
    }

    fn tags(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn enricher(stub: Arc<StubClient>) -> TagEnricher {
        let caches = Arc::new(Caches::new(&CacheConfig {
            enabled: true,
            ttl: Duration::from_secs(60),
            resolution_ttl: Duration::from_secs(60),
            max_entries: 100,
        }));
        TagEnricher::new(stub, caches, ConcurrencyBudget::new(5, 10))
    }

    #[tokio::test]
    async fn selects_requested_keys_case_insensitively() {
        let t = target("a");
        let stub = Arc::new(StubClient::new().with_tags(
            &t.resource_id,
            tags(&[("Owner", "team-a"), ("env", "prod"), ("cost", "1")]),
        ));
        let enricher = enricher(stub);

        let labels = enricher
            .enrich(&t, &["owner".into(), "env".into(), "missing".into()], None)
            .await
            .unwrap();
        assert_eq!(*labels, tags(&[("owner", "team-a"), ("env", "prod")]));
    }

    #[tokio::test]
    async fn lookups_are_cached() {
        let t = target("a");
        let stub = Arc::new(StubClient::new().with_tags(&t.resource_id, tags(&[("owner", "x")])));
        let enricher = enricher(stub.clone());
        let keys = vec!["owner".to_string()];

        enricher.enrich(&t, &keys, None).await.unwrap();
        enricher.enrich(&t, &keys, None).await.unwrap();
        assert_eq!(stub.tag_calls(), 1);
    }

    #[tokio::test]
    async fn cached_tags_follow_each_requests_key_casing() {
        let t = target("a");
        let stub = Arc::new(StubClient::new().with_tags(&t.resource_id, tags(&[("owner", "x")])));
        let enricher = enricher(stub.clone());

        let lower = enricher.enrich(&t, &["owner".into()], None).await.unwrap();
        let upper = enricher.enrich(&t, &["Owner".into()], None).await.unwrap();

        assert_eq!(*lower, tags(&[("owner", "x")]));
        assert_eq!(*upper, tags(&[("Owner", "x")]));
        assert_eq!(stub.tag_calls(), 1);
    }

    #[tokio::test]
    async fn no_keys_means_no_lookup() {
        let stub = Arc::new(StubClient::new());
        let enricher = enricher(stub.clone());
        let labels = enricher.enrich(&target("a"), &[], None).await.unwrap();
        assert!(labels.is_empty());
        assert_eq!(stub.tag_calls(), 0);
    }

    #[tokio::test]
    async fn failures_are_reported_per_target() {
        let (ok, bad) = (target("ok"), target("bad"));
        let stub = Arc::new(
            StubClient::new()
                .with_tags(&ok.resource_id, tags(&[("owner", "me")]))
                .with_tag_error(&bad.resource_id, ClientError::Auth("forbidden".into())),
        );
        let enricher = enricher(stub);
        let mut spec = crate::test_support::resource_spec(&[]);
        spec.tag_keys = vec!["owner".into()];

        let targets = vec![ok, bad];
        let outcomes = vec![
            FetchOutcome::Success(Arc::new(vec![])),
            FetchOutcome::Success(Arc::new(vec![])),
        ];
        let results = enricher
            .enrich_all(&spec, &targets, &outcomes, &Cancellation::never())
            .await;

        assert_eq!(results[0].as_ref().unwrap().get("owner").map(String::as_str), Some("me"));
        let err = results[1].as_ref().unwrap_err();
        assert_eq!(err.resource_id, targets[1].resource_id);
    }

    #[tokio::test]
    async fn failed_targets_are_skipped() {
        let t = target("a");
        let stub = Arc::new(StubClient::new().with_tags(&t.resource_id, tags(&[("owner", "x")])));
        let enricher = enricher(stub.clone());
        let mut spec = crate::test_support::resource_spec(&[]);
        spec.tag_keys = vec!["owner".into()];

        let results = enricher
            .enrich_all(
                &spec,
                &[t],
                &[FetchOutcome::Failure(FetchError::NotFound("x".into()))],
                &Cancellation::never(),
            )
            .await;

        assert!(results[0].as_ref().unwrap().is_empty());
        assert_eq!(stub.tag_calls(), 0);
    }
}
