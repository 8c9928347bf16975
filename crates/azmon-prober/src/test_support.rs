//! Shared fixtures for unit tests.

use azmon_core::{Aggregation, ProbeMode, ProbeSpec, ProberConfig};

pub const SUB: &str = "sub";

/// A VM resource ID in subscription [`SUB`], resource group `rg`.
pub fn vm(name: &str) -> String {
    format!("/subscriptions/{SUB}/resourceGroups/rg/providers/Microsoft.Compute/virtualMachines/{name}")
}

/// A resource-mode spec with config defaults, built without validation.
pub fn resource_spec(targets: &[String]) -> ProbeSpec {
    let config = ProberConfig::default();
    ProbeSpec {
        mode: ProbeMode::Resource,
        subscriptions: vec![SUB.to_string()],
        targets: targets.to_vec(),
        filter: None,
        resource_type: None,
        query: None,
        metrics: vec!["Percentage CPU".to_string()],
        metric_namespace: None,
        aggregations: vec![Aggregation::Average],
        timespan: "PT1M".to_string(),
        interval: None,
        metric_filter: None,
        metric_top: None,
        metric_order_by: None,
        name: "azurerm_resource_metric".to_string(),
        name_template: config.templates.name_template,
        help_template: config.templates.help_template,
        tag_keys: Vec::new(),
        cache_ttl: None,
    }
}
