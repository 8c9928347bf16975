//! azmon-core — shared types for the azmon metrics bridge.
//!
//! Holds the request model (`ProbeSpec`, `ResolvedTarget`), the raw sample
//! and outcome types exchanged between the prober stages, the immutable
//! `ProberConfig` built once at startup, and the signature builder used to
//! key the response caches.

pub mod config;
pub mod duration;
pub mod resource;
pub mod signature;
pub mod types;

pub use config::{CacheConfig, ConcurrencyConfig, ProberConfig, RetryConfig, TemplateConfig};
pub use duration::{is_iso8601_duration, parse_duration};
pub use signature::{Signature, SignatureBuilder};
pub use types::*;
