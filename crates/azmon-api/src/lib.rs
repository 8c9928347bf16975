//! azmon-api — HTTP surface of the metrics bridge.
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/probe/metrics/resource` | Metrics for explicit resource IDs in one subscription |
//! | GET | `/probe/metrics/list` | Metrics for resources matching a filter |
//! | GET | `/probe/metrics/subscription` | Metrics for every resource of a type |
//! | GET | `/probe/metrics/resourcegraph` | Metrics for resources returned by a graph query |
//! | GET | `/probe/metrics/scrape` | Metrics for pre-resolved resource IDs |
//! | GET | `/metrics` | Process instrumentation |
//! | GET | `/healthz` | Liveness |
//! | GET | `/readyz` | Readiness |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use azmon_prober::Prober;
use tower_http::trace::TraceLayer;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub prober: Arc<Prober>,
}

/// Build the complete router.
pub fn build_router(prober: Arc<Prober>) -> Router {
    let state = ApiState { prober };

    let probe_routes = Router::new()
        .route("/resource", get(handlers::probe_resource))
        .route("/list", get(handlers::probe_list))
        .route("/subscription", get(handlers::probe_subscription))
        .route("/resourcegraph", get(handlers::probe_resourcegraph))
        .route("/scrape", get(handlers::probe_scrape));

    Router::new()
        .nest("/probe/metrics", probe_routes)
        .route("/metrics", get(handlers::instrumentation))
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
