//! azmon-prober — the probe engine.
//!
//! Turns one probe request into a Prometheus exposition body:
//!
//! ```text
//! query params ─► ProbeSpec ─► TargetResolver ─► MetricFetcher ─► TagEnricher ─► MetricFormatter
//!                 (params)     (resolution cache) (metrics cache)  (tags cache)     (pure)
//! ```
//!
//! Fetching and enrichment fan out under a two-level [`ConcurrencyBudget`]
//! (subscriptions × resources per subscription) and stop early when the
//! request's [`Cancellation`] fires.

pub mod budget;
pub mod cache;
pub mod enricher;
pub mod error;
pub mod fetcher;
pub mod formatter;
pub mod params;
pub mod prober;
pub mod resolver;

#[cfg(test)]
mod test_support;

pub use budget::{CancelHandle, Cancellation, ConcurrencyBudget};
pub use cache::{Caches, ResponseCache};
pub use enricher::{TagEnricher, TagLabels};
pub use error::{EnrichmentError, ParseError, ProbeError, ProbeResult, ResolutionError};
pub use fetcher::MetricFetcher;
pub use formatter::MetricFormatter;
pub use params::parse_probe_spec;
pub use prober::{ProbeResponse, ProbeState, Prober};
pub use resolver::TargetResolver;
