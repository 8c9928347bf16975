//! Turns fetch outcomes into Prometheus metric families.
//!
//! Formatting is pure: the same spec, targets, outcomes, and tags always
//! produce byte-identical output, no matter in which order fetches
//! completed.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use azmon_core::{
    FetchOutcome, MetricSample, ProbeSpec, ResolvedTarget, TemplateConfig,
    config::DEFAULT_METRIC_NAME,
};
use azmon_metrics::{MetricFamily, MetricKind, Sample};

use crate::enricher::TagLabels;

/// Ordering of samples within a family.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct SortKey {
    metric: String,
    resource_id: String,
    dimensions: Vec<(String, String)>,
    labels: Vec<(String, String)>,
}

struct Row {
    family: String,
    help: String,
    key: SortKey,
    value: f64,
}

pub struct MetricFormatter {
    lowercase_dimensions: bool,
}

impl MetricFormatter {
    pub fn new(templates: &TemplateConfig) -> Self {
        Self {
            lowercase_dimensions: templates.lowercase_dimensions,
        }
    }

    /// Build families, sorted by name, from per-target outcomes.
    ///
    /// `tags` is index-aligned with `targets`; a missing entry means no tag
    /// labels. Failed targets contribute nothing.
    pub fn format(
        &self,
        spec: &ProbeSpec,
        targets: &[ResolvedTarget],
        outcomes: &[FetchOutcome],
        tags: &[Arc<TagLabels>],
    ) -> Vec<MetricFamily> {
        let mut rows = Vec::new();
        for (idx, (target, outcome)) in targets.iter().zip(outcomes).enumerate() {
            let tags = tags.get(idx).map(|t| t.as_ref());
            for sample in latest_per_series(outcome.samples()) {
                rows.push(self.row(spec, target, sample, tags));
            }
        }

        rows.sort_by(|a, b| a.family.cmp(&b.family).then_with(|| a.key.cmp(&b.key)));

        let mut families: Vec<MetricFamily> = Vec::new();
        let mut seen: HashSet<(String, Vec<(String, String)>)> = HashSet::new();
        for row in rows {
            // Identical series from duplicate inputs would be rejected by
            // Prometheus; keep the first.
            if !seen.insert((row.family.clone(), row.key.labels.clone())) {
                continue;
            }
            match families.last_mut() {
                Some(family) if family.name == row.family => {
                    family.samples.push(Sample::new(row.key.labels, row.value));
                }
                _ => {
                    let mut family = MetricFamily::new(row.family, row.help, MetricKind::Gauge);
                    family.samples.push(Sample::new(row.key.labels, row.value));
                    families.push(family);
                }
            }
        }
        families
    }

    fn row(
        &self,
        spec: &ProbeSpec,
        target: &ResolvedTarget,
        sample: &MetricSample,
        tags: Option<&TagLabels>,
    ) -> Row {
        let namespace = spec.metric_namespace.as_deref().unwrap_or("");
        let aggregation = sample.aggregation.as_str();

        let family = metric_name(&render(
            &spec.name_template,
            &[
                ("name", &name_part(&spec.name)),
                ("metric", &name_part(&sample.metric)),
                ("namespace", &name_part(namespace)),
                ("aggregation", aggregation),
                ("unit", &name_part(&sample.unit)),
            ],
        ));
        let help = render(
            &spec.help_template,
            &[
                ("name", &spec.name),
                ("metric", &sample.metric),
                ("namespace", namespace),
                ("aggregation", aggregation),
                ("unit", &sample.unit),
            ],
        );

        let mut labels: Vec<(String, String)> = vec![
            ("resourceID".into(), target.resource_id.clone()),
            ("subscriptionID".into(), target.subscription_id.clone()),
            ("resourceGroup".into(), target.resource_group().unwrap_or_default()),
            ("metric".into(), sample.metric.clone()),
            ("unit".into(), sample.unit.clone()),
            ("aggregation".into(), aggregation.to_string()),
            ("interval".into(), spec.interval.clone().unwrap_or_default()),
            ("timespan".into(), spec.timespan.clone()),
        ];

        let dimensions: Vec<(String, String)> = sample
            .dimensions
            .iter()
            .map(|(key, value)| {
                let value = if self.lowercase_dimensions {
                    value.to_lowercase()
                } else {
                    value.clone()
                };
                (dimension_label(key), value)
            })
            .collect();

        for (name, value) in &dimensions {
            push_unique(&mut labels, name.clone(), value.clone());
        }
        for (name, value) in &target.extra_labels {
            push_unique(&mut labels, label_name(name), value.clone());
        }
        for (name, value) in tags.into_iter().flatten() {
            push_unique(&mut labels, format!("tag_{}", label_name(name)), value.clone());
        }

        Row {
            family,
            help,
            key: SortKey {
                metric: sample.metric.clone(),
                resource_id: target.resource_id.to_lowercase(),
                dimensions,
                labels,
            },
            value: sample.value,
        }
    }
}

/// Append a label unless one with the same name is already present.
fn push_unique(labels: &mut Vec<(String, String)>, name: String, value: String) {
    if !labels.iter().any(|(existing, _)| *existing == name) {
        labels.push((name, value));
    }
}

/// For each (metric, aggregation, dimensions) series keep the sample with
/// the latest timestamp. NaN values are treated as missing.
fn latest_per_series(samples: &[MetricSample]) -> Vec<&MetricSample> {
    let mut latest: BTreeMap<(&str, &str, &BTreeMap<String, String>), &MetricSample> =
        BTreeMap::new();
    for sample in samples.iter().filter(|s| !s.value.is_nan()) {
        let key = (sample.metric.as_str(), sample.aggregation.as_str(), &sample.dimensions);
        match latest.get(&key) {
            Some(current) if current.timestamp >= sample.timestamp => {}
            _ => {
                latest.insert(key, sample);
            }
        }
    }
    latest.into_values().collect()
}

/// Replace `{placeholder}` occurrences with their values.
fn render(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (name, value) in values {
        out = out.replace(&format!("{{{name}}}"), value);
    }
    out
}

/// A value substituted into a metric name: lowercase, `_` for anything
/// outside `[a-z0-9_]`, runs of `_` collapsed, no leading or trailing `_`.
fn name_part(value: &str) -> String {
    let mapped: String = value
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' }
        })
        .collect();
    collapse_underscores(&mapped).trim_matches('_').to_string()
}

/// Final metric name matching `[a-zA-Z_:][a-zA-Z0-9_:]*`, lowercased.
fn metric_name(rendered: &str) -> String {
    let mapped: String = rendered
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '_' || c == ':' { c } else { '_' }
        })
        .collect();
    let name = collapse_underscores(&mapped).trim_matches('_').to_string();
    match name.chars().next() {
        None => DEFAULT_METRIC_NAME.to_string(),
        Some(c) if c.is_ascii_digit() => format!("_{name}"),
        Some(_) => name,
    }
}

/// A label name matching `[a-zA-Z_][a-zA-Z0-9_]*`. Case is kept.
fn label_name(raw: &str) -> String {
    let mapped: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    match mapped.chars().next() {
        None => "_".to_string(),
        Some(c) if c.is_ascii_digit() => format!("_{mapped}"),
        Some(_) => mapped,
    }
}

/// `dimension<Key>`, e.g. `LUN` → `dimensionLUN`, `diskName` → `dimensionDiskName`.
fn dimension_label(key: &str) -> String {
    let name = label_name(key);
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => format!("dimension{}{}", first.to_ascii_uppercase(), chars.as_str()),
        None => "dimension".to_string(),
    }
}

fn collapse_underscores(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c == '_' && out.ends_with('_') {
            continue;
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use azmon_core::{Aggregation, FetchError};
    use azmon_metrics::render_families;
    use chrono::{TimeZone, Utc};

    use crate::test_support::{resource_spec, vm};

    fn sample(metric: &str, minute: u32, value: f64) -> MetricSample {
        MetricSample {
            metric: metric.into(),
            unit: "Percent".into(),
            dimensions: BTreeMap::new(),
            aggregation: Aggregation::Average,
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, minute, 0).unwrap(),
            value,
        }
    }

    fn with_dims(mut s: MetricSample, dims: &[(&str, &str)]) -> MetricSample {
        s.dimensions = dims
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        s
    }

    fn formatter(lowercase: bool) -> MetricFormatter {
        MetricFormatter::new(&TemplateConfig {
            lowercase_dimensions: lowercase,
            ..TemplateConfig::default()
        })
    }

    fn success(samples: Vec<MetricSample>) -> FetchOutcome {
        FetchOutcome::Success(Arc::new(samples))
    }

    fn label<'a>(sample: &'a Sample, name: &str) -> Option<&'a str> {
        sample
            .labels
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn sanitizes_templated_names() {
        assert_eq!(name_part("Percentage CPU"), "percentage_cpu");
        assert_eq!(name_part("Microsoft.Compute/virtualMachines"), "microsoft_compute_virtualmachines");
        assert_eq!(metric_name("azure__{x}__"), "azure_x");
        assert_eq!(metric_name("1st"), "_1st");
        assert_eq!(metric_name("!!!"), DEFAULT_METRIC_NAME);
        assert_eq!(metric_name("ns:Metric"), "ns:metric");
    }

    #[test]
    fn dimension_labels_are_prefixed() {
        assert_eq!(dimension_label("LUN"), "dimensionLUN");
        assert_eq!(dimension_label("diskName"), "dimensionDiskName");
        assert_eq!(dimension_label("disk name"), "dimensionDisk_name");
    }

    #[test]
    fn default_template_yields_single_family() {
        let spec = resource_spec(&[vm("a")]);
        let targets = vec![ResolvedTarget::new(vm("a"), "sub")];
        let families = formatter(false).format(
            &spec,
            &targets,
            &[success(vec![sample("Percentage CPU", 0, 12.5)])],
            &[],
        );

        assert_eq!(families.len(), 1);
        assert_eq!(families[0].name, "azurerm_resource_metric");
        assert_eq!(families[0].help, "Azure monitor insight metric");
        let s = &families[0].samples[0];
        assert_eq!(s.value, 12.5);
        assert_eq!(label(s, "resourceID"), Some(vm("a").as_str()));
        assert_eq!(label(s, "subscriptionID"), Some("sub"));
        assert_eq!(label(s, "resourceGroup"), Some("rg"));
        assert_eq!(label(s, "metric"), Some("Percentage CPU"));
        assert_eq!(label(s, "aggregation"), Some("average"));
        assert_eq!(label(s, "timespan"), Some("PT1M"));
    }

    #[test]
    fn templates_split_families_per_metric() {
        let mut spec = resource_spec(&[vm("a")]);
        spec.name_template = "azure_{metric}_{aggregation}".into();
        spec.help_template = "{metric} ({unit})".into();
        let targets = vec![ResolvedTarget::new(vm("a"), "sub")];
        let families = formatter(false).format(
            &spec,
            &targets,
            &[success(vec![
                sample("Percentage CPU", 0, 1.0),
                sample("Disk Read Bytes", 0, 2.0),
            ])],
            &[],
        );

        let names: Vec<_> = families.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["azure_disk_read_bytes_average", "azure_percentage_cpu_average"]);
        assert_eq!(families[1].help, "Percentage CPU (Percent)");
    }

    #[test]
    fn latest_timestamp_wins_per_series() {
        let spec = resource_spec(&[vm("a")]);
        let targets = vec![ResolvedTarget::new(vm("a"), "sub")];
        let families = formatter(false).format(
            &spec,
            &targets,
            &[success(vec![
                sample("cpu", 2, 20.0),
                sample("cpu", 3, 30.0),
                sample("cpu", 1, 10.0),
                sample("cpu", 4, f64::NAN),
            ])],
            &[],
        );
        assert_eq!(families[0].samples.len(), 1);
        assert_eq!(families[0].samples[0].value, 30.0);
    }

    #[test]
    fn lowercases_dimension_values_only() {
        let spec = resource_spec(&[vm("a")]);
        let targets = vec![ResolvedTarget::new(vm("a"), "sub")];
        let outcomes = [success(vec![with_dims(sample("cpu", 0, 1.0), &[("Region", "East-US")])])];

        let families = formatter(true).format(&spec, &targets, &outcomes, &[]);
        let s = &families[0].samples[0];
        assert_eq!(label(s, "dimensionRegion"), Some("east-us"));
        assert_eq!(label(s, "metric"), Some("cpu"));
        assert_eq!(label(s, "resourceID"), Some(vm("a").as_str()));

        let families = formatter(false).format(&spec, &targets, &outcomes, &[]);
        assert_eq!(label(&families[0].samples[0], "dimensionRegion"), Some("East-US"));
    }

    #[test]
    fn failed_targets_contribute_nothing() {
        let spec = resource_spec(&[vm("a"), vm("b")]);
        let targets = vec![
            ResolvedTarget::new(vm("a"), "sub"),
            ResolvedTarget::new(vm("b"), "sub"),
        ];
        let families = formatter(false).format(
            &spec,
            &targets,
            &[
                FetchOutcome::Failure(FetchError::Throttled("x".into())),
                success(vec![sample("cpu", 0, 1.0)]),
            ],
            &[],
        );
        assert_eq!(families[0].samples.len(), 1);
        assert_eq!(label(&families[0].samples[0], "resourceID"), Some(vm("b").as_str()));
    }

    #[test]
    fn no_outcomes_no_families() {
        let spec = resource_spec(&[]);
        assert!(formatter(false).format(&spec, &[], &[], &[]).is_empty());
    }

    #[test]
    fn graph_and_tag_labels_are_attached() {
        let spec = resource_spec(&[vm("a")]);
        let mut extra = BTreeMap::new();
        extra.insert("location".to_string(), "westeurope".to_string());
        extra.insert("metric".to_string(), "shadowed".to_string());
        let targets = vec![ResolvedTarget::new(vm("a"), "sub").with_labels(extra)];
        let mut tags = TagLabels::new();
        tags.insert("owner".into(), "team-a".into());
        tags.insert("cost-center".into(), "42".into());

        let families = formatter(false).format(
            &spec,
            &targets,
            &[success(vec![sample("cpu", 0, 1.0)])],
            &[Arc::new(tags)],
        );
        let s = &families[0].samples[0];
        assert_eq!(label(s, "location"), Some("westeurope"));
        assert_eq!(label(s, "metric"), Some("cpu"));
        assert_eq!(label(s, "tag_owner"), Some("team-a"));
        assert_eq!(label(s, "tag_cost_center"), Some("42"));
    }

    #[test]
    fn output_is_independent_of_target_order() {
        let spec = resource_spec(&[vm("a"), vm("b")]);
        let a = ResolvedTarget::new(vm("a"), "sub");
        let b = ResolvedTarget::new(vm("b"), "sub");
        let oa = success(vec![
            with_dims(sample("cpu", 0, 1.0), &[("LUN", "1")]),
            with_dims(sample("cpu", 0, 2.0), &[("LUN", "0")]),
        ]);
        let ob = success(vec![sample("cpu", 0, 3.0)]);

        let f = formatter(false);
        let forward = render_families(&f.format(&spec, &[a.clone(), b.clone()], &[oa.clone(), ob.clone()], &[]));
        let reverse = render_families(&f.format(&spec, &[b, a], &[ob, oa], &[]));

        assert_eq!(forward, reverse);
        let resources: Vec<_> = forward
            .lines()
            .filter(|l| !l.starts_with('#'))
            .map(|l| if l.contains("virtualMachines/a") { "a" } else { "b" })
            .collect();
        assert_eq!(resources, vec!["a", "a", "b"]);
        // LUN 0 sorts before LUN 1 within the same resource.
        assert!(forward.find("dimensionLUN=\"0\"") < forward.find("dimensionLUN=\"1\""));
    }
}
