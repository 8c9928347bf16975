//! Query parameter parsing into a [`ProbeSpec`].
//!
//! Parameters arrive as raw `(name, value)` pairs so repeated keys are kept.
//! List-valued parameters may also be comma-separated. Empty values are
//! treated as absent and unknown parameters are ignored.

use std::time::Duration;

use azmon_core::{
    Aggregation, ProbeMode, ProbeSpec, ProberConfig, config::DEFAULT_METRIC_NAME,
    is_iso8601_duration, parse_duration, resource,
};

use crate::error::ParseError;

const DEFAULT_TIMESPAN: &str = "PT1M";

/// Longest lifetime a request may ask for through `cache`.
pub const MAX_CACHE_TTL: Duration = Duration::from_secs(24 * 3600);

/// Read-only view over the raw request parameters.
struct Params<'a> {
    pairs: &'a [(String, String)],
}

impl<'a> Params<'a> {
    /// Every non-empty value for `name`, comma lists expanded.
    fn list(&self, name: &str) -> Vec<&'a str> {
        self.pairs
            .iter()
            .filter(|(k, _)| k == name)
            .flat_map(|(_, v)| v.split(','))
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .collect()
    }

    /// Every non-empty value for `name`, taken verbatim.
    fn raw(&self, name: &str) -> Vec<&'a str> {
        self.pairs
            .iter()
            .filter(|(k, _)| k == name)
            .map(|(_, v)| v.trim())
            .filter(|v| !v.is_empty())
            .collect()
    }

    /// At most one non-empty value for `name`.
    fn single(&self, name: &'static str) -> Result<Option<&'a str>, ParseError> {
        let values = self.raw(name);
        match values.as_slice() {
            [] => Ok(None),
            [one] => Ok(Some(*one)),
            _ => Err(ParseError::TooMany(name)),
        }
    }

    fn required(&self, name: &'static str) -> Result<&'a str, ParseError> {
        self.single(name)?.ok_or(ParseError::Missing(name))
    }
}

/// Build a [`ProbeSpec`] for `mode` from request parameters.
///
/// Defaults for templates and tag keys come from `config`.
pub fn parse_probe_spec(
    mode: ProbeMode,
    pairs: &[(String, String)],
    config: &ProberConfig,
) -> Result<ProbeSpec, ParseError> {
    let params = Params { pairs };

    let metrics = dedup_ci(params.list("metric"));
    if metrics.is_empty() {
        return Err(ParseError::Missing("metric"));
    }

    let aggregations = parse_aggregations(&params)?;

    let timespan = params.single("timespan")?.unwrap_or(DEFAULT_TIMESPAN);
    if !is_iso8601_duration(timespan) {
        return Err(invalid("timespan", format!("{timespan:?} is not an ISO-8601 duration")));
    }

    let interval = params.single("interval")?;
    if let Some(interval) = interval {
        if !is_iso8601_duration(interval) {
            return Err(invalid("interval", format!("{interval:?} is not an ISO-8601 duration")));
        }
    }

    let metric_top = match params.single("metricTop")? {
        Some(raw) => match raw.parse::<u32>() {
            Ok(n) if n > 0 => Some(n),
            _ => return Err(invalid("metricTop", format!("{raw:?} is not a positive integer"))),
        },
        None => None,
    };

    let cache_ttl = match params.single("cache")? {
        Some(raw) => Some(parse_ttl(raw)?),
        None => None,
    };

    let tag_keys = {
        let requested = params.list("tag");
        if requested.is_empty() {
            config.resource_tags.clone()
        } else {
            dedup_ci(requested)
        }
    };

    let mut spec = ProbeSpec {
        mode,
        subscriptions: Vec::new(),
        targets: Vec::new(),
        filter: None,
        resource_type: None,
        query: None,
        metrics,
        metric_namespace: params.single("metricNamespace")?.map(str::to_string),
        aggregations,
        timespan: timespan.to_string(),
        interval: interval.map(str::to_string),
        metric_filter: params.single("metricFilter")?.map(str::to_string),
        metric_top,
        metric_order_by: params.single("metricOrderBy")?.map(str::to_string),
        name: params
            .single("name")?
            .unwrap_or(DEFAULT_METRIC_NAME)
            .to_string(),
        name_template: params
            .single("template")?
            .map(str::to_string)
            .unwrap_or_else(|| config.templates.name_template.clone()),
        help_template: params
            .single("help")?
            .map(str::to_string)
            .unwrap_or_else(|| config.templates.help_template.clone()),
        tag_keys,
        cache_ttl,
    };

    match mode {
        ProbeMode::Resource => {
            spec.subscriptions = vec![params.required("subscription")?.to_string()];
            spec.targets = parse_targets(&params)?;
            if let Some(bad) = spec.targets.iter().find(|t| !t.starts_with('/')) {
                return Err(invalid("target", format!("{bad:?} is not a resource ID")));
            }
        }
        ProbeMode::Scrape => {
            spec.targets = parse_targets(&params)?;
            let mut subscriptions = Vec::new();
            for target in &spec.targets {
                let subscription = resource::subscription_of(target).ok_or_else(|| {
                    invalid("target", format!("{target:?} has no subscription segment"))
                })?;
                subscriptions.push(subscription);
            }
            spec.subscriptions = dedup_ci(subscriptions.iter().map(String::as_str));
        }
        ProbeMode::List => {
            spec.subscriptions = vec![params.required("subscription")?.to_string()];
            spec.filter = Some(params.required("filter")?.to_string());
        }
        ProbeMode::Subscription => {
            spec.subscriptions = parse_subscriptions(&params)?;
            spec.resource_type = params
                .single("resourceType")?
                .map(str::to_string)
                .or_else(|| spec.metric_namespace.clone());
            if spec.resource_type.is_none() {
                return Err(ParseError::Missing("resourceType"));
            }
        }
        ProbeMode::ResourceGraph => {
            spec.subscriptions = parse_subscriptions(&params)?;
            spec.query = Some(params.required("query")?.to_string());
        }
    }

    Ok(spec)
}

fn invalid(param: &'static str, reason: String) -> ParseError {
    ParseError::Invalid { param, reason }
}

fn parse_aggregations(params: &Params<'_>) -> Result<Vec<Aggregation>, ParseError> {
    let raw = params.list("aggregation");
    if raw.is_empty() {
        return Ok(vec![Aggregation::Average]);
    }
    let mut out = Vec::with_capacity(raw.len());
    for value in raw {
        let agg = Aggregation::parse(value)
            .ok_or_else(|| invalid("aggregation", format!("unknown aggregation {value:?}")))?;
        if !out.contains(&agg) {
            out.push(agg);
        }
    }
    Ok(out)
}

fn parse_ttl(raw: &str) -> Result<Duration, ParseError> {
    match parse_duration(raw) {
        Some(ttl) if ttl > MAX_CACHE_TTL => Err(invalid(
            "cache",
            format!("{raw:?} exceeds the maximum of {}s", MAX_CACHE_TTL.as_secs()),
        )),
        Some(ttl) if !ttl.is_zero() => Ok(ttl),
        _ => Err(invalid("cache", format!("{raw:?} is not a positive duration"))),
    }
}

fn parse_targets(params: &Params<'_>) -> Result<Vec<String>, ParseError> {
    let targets = dedup_ci(params.list("target"));
    if targets.is_empty() {
        return Err(ParseError::Missing("target"));
    }
    Ok(targets)
}

fn parse_subscriptions(params: &Params<'_>) -> Result<Vec<String>, ParseError> {
    let subscriptions = dedup_ci(params.list("subscription"));
    if subscriptions.is_empty() {
        return Err(ParseError::Missing("subscription"));
    }
    Ok(subscriptions)
}

/// Order-preserving, case-insensitive dedupe.
fn dedup_ci<'a>(values: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for value in values {
        if !out.iter().any(|v| v.eq_ignore_ascii_case(value)) {
            out.push(value.to_string());
        }
    }
    out
}
