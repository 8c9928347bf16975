//! HTTP handlers.
//!
//! Probe handlers hand the raw query pairs to the prober and return the
//! exposition body. Fatal probe errors are returned as plain text with the
//! status code the error maps to.

use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use azmon_core::ProbeMode;
use azmon_metrics::CONTENT_TYPE;
use azmon_prober::Cancellation;
use tracing::debug;

use crate::ApiState;

/// Header Prometheus sets to advertise its scrape timeout.
pub const SCRAPE_TIMEOUT_HEADER: &str = "x-prometheus-scrape-timeout-seconds";

type Params = Query<Vec<(String, String)>>;

// ── Probes ─────────────────────────────────────────────────────

/// GET /probe/metrics/resource
pub async fn probe_resource(State(state): State<ApiState>, headers: HeaderMap, Query(params): Params) -> Response {
    run_probe(&state, ProbeMode::Resource, &headers, &params).await
}

/// GET /probe/metrics/list
pub async fn probe_list(State(state): State<ApiState>, headers: HeaderMap, Query(params): Params) -> Response {
    run_probe(&state, ProbeMode::List, &headers, &params).await
}

/// GET /probe/metrics/subscription
pub async fn probe_subscription(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(params): Params,
) -> Response {
    run_probe(&state, ProbeMode::Subscription, &headers, &params).await
}

/// GET /probe/metrics/resourcegraph
pub async fn probe_resourcegraph(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(params): Params,
) -> Response {
    run_probe(&state, ProbeMode::ResourceGraph, &headers, &params).await
}

/// GET /probe/metrics/scrape
pub async fn probe_scrape(State(state): State<ApiState>, headers: HeaderMap, Query(params): Params) -> Response {
    run_probe(&state, ProbeMode::Scrape, &headers, &params).await
}

async fn run_probe(
    state: &ApiState,
    mode: ProbeMode,
    headers: &HeaderMap,
    params: &[(String, String)],
) -> Response {
    let deadline = state.prober.deadline(scrape_timeout(headers));
    // A dropped connection drops this future, which cancels in-flight fetches.
    let cancel = Cancellation::with_deadline(deadline);

    match state.prober.probe(mode, params, cancel).await {
        Ok(response) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, CONTENT_TYPE)],
            response.body(),
        )
            .into_response(),
        Err(err) => {
            let status =
                StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            plain_text(status, format!("{err}\n"))
        }
    }
}

/// Parse the scraper's advertised timeout, if present and sane.
fn scrape_timeout(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(SCRAPE_TIMEOUT_HEADER)?.to_str().ok()?;
    let secs: f64 = raw.trim().parse().ok()?;
    let timeout = Duration::try_from_secs_f64(secs).ok()?;
    debug!(timeout_ms = timeout.as_millis() as u64, "scrape timeout advertised");
    Some(timeout)
}

// ── Instrumentation ────────────────────────────────────────────

/// GET /metrics
pub async fn instrumentation(State(state): State<ApiState>) -> Response {
    let body = state.prober.instrumentation().await;
    (StatusCode::OK, [(header::CONTENT_TYPE, CONTENT_TYPE)], body).into_response()
}

// ── Health ─────────────────────────────────────────────────────

/// GET /healthz
pub async fn healthz() -> Response {
    plain_text(StatusCode::OK, "Ok".to_string())
}

/// GET /readyz
pub async fn readyz() -> Response {
    plain_text(StatusCode::OK, "Ok".to_string())
}

fn plain_text(status: StatusCode, body: String) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response()
}
