//! azmon-metrics — exposition and self-instrumentation.
//!
//! Renders metric families in the Prometheus text exposition format (used
//! both for probe responses and for `/metrics`) and tracks the bridge's own
//! request latency and outcome counters.
//!
//! # Architecture
//!
//! ```text
//! ProbeMetrics
//!   ├── observe_collect_time() ← once per probe request
//!   ├── record_request()       ← once per probe request, tagged by outcome
//!   ├── record_fetch_failure() ← once per failed target
//!   └── families()             → Vec<MetricFamily> for /metrics
//!
//! Prometheus exposition
//!   └── render_families() → text/plain body
//! ```

pub mod collector;
pub mod prometheus;

pub use collector::{CacheStats, ProbeMetrics, RequestResult};
pub use prometheus::{CONTENT_TYPE, MetricFamily, MetricKind, Sample, render_families};
