//! Remote request and response shapes.

use std::collections::BTreeMap;

use azmon_core::Aggregation;
use serde::{Deserialize, Serialize};

/// A resource returned by an ARM listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub id: String,
    #[serde(default, rename = "type")]
    pub resource_type: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl ResourceRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            resource_type: String::new(),
            tags: BTreeMap::new(),
        }
    }
}

/// One row of a resource graph result (`objectArray` format).
pub type GraphRow = serde_json::Map<String, serde_json::Value>;

/// Parameters of one metrics API call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricQuery {
    pub resource_id: String,
    pub metrics: Vec<String>,
    pub namespace: Option<String>,
    pub aggregations: Vec<Aggregation>,
    pub timespan: String,
    pub interval: Option<String>,
    pub filter: Option<String>,
    pub top: Option<u32>,
    pub order_by: Option<String>,
}
