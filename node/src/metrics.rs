//! # Prometheus Metrics
//!
//! Operational counters for the node, in their own registry under the
//! `desci` namespace. Served at `/metrics` on the metrics port.
//!
//! Escrow counts are gauges refreshed from the escrow store on every
//! scrape, so escrows failed by the background sweep show up without the
//! sweeper knowing anything about Prometheus.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{MatchedPath, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounter, IntGaugeVec, Opts, Registry, TextEncoder};

use desci_protocol::escrow::EscrowStatistics;
use desci_protocol::market::Marketplace;

#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    /// Escrows by status: pending (opened, unsettled), completed, refunded, failed.
    pub escrows: IntGaugeVec,
    /// Lifetime escrows opened through this node.
    pub escrows_opened_total: IntCounter,
    pub models_published_total: IntCounter,
    /// Confirmations that ran out of poll budget.
    pub confirmations_timed_out_total: IntCounter,
    /// Request latency by route template and status code.
    pub http_request_duration_seconds: HistogramVec,
}

impl NodeMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Self {
        let registry =
            Registry::new_custom(Some("desci".into()), None).expect("failed to create prometheus registry");

        let escrows = IntGaugeVec::new(Opts::new("escrows", "Escrows tracked by this node, by status"), &["status"])
            .expect("metric creation");
        registry
            .register(Box::new(escrows.clone()))
            .expect("metric registration");

        let escrows_opened_total =
            IntCounter::new("escrows_opened_total", "Purchase escrows opened").expect("metric creation");
        registry
            .register(Box::new(escrows_opened_total.clone()))
            .expect("metric registration");

        let models_published_total = IntCounter::new(
            "models_published_total",
            "Models whose register transaction confirmed",
        )
        .expect("metric creation");
        registry
            .register(Box::new(models_published_total.clone()))
            .expect("metric registration");

        let confirmations_timed_out_total = IntCounter::new(
            "confirmations_timed_out_total",
            "Transaction confirmations that exhausted their poll budget",
        )
        .expect("metric creation");
        registry
            .register(Box::new(confirmations_timed_out_total.clone()))
            .expect("metric registration");

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new("http_request_duration_seconds", "HTTP request latency in seconds")
                .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 30.0]),
            &["route", "status"],
        )
        .expect("metric creation");
        registry
            .register(Box::new(http_request_duration_seconds.clone()))
            .expect("metric registration");

        Self {
            registry,
            escrows,
            escrows_opened_total,
            models_published_total,
            confirmations_timed_out_total,
            http_request_duration_seconds,
        }
    }

    /// Overwrite the per-status escrow gauges.
    pub fn observe_escrows(&self, stats: &EscrowStatistics) {
        for (status, count) in [
            ("pending", stats.pending),
            ("completed", stats.completed),
            ("refunded", stats.refunded),
            ("failed", stats.failed),
        ] {
            self.escrows.with_label_values(&[status]).set(count as i64);
        }
    }

    /// Encodes all registered metrics into the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedMetrics = Arc<NodeMetrics>;

/// State for the metrics router.
#[derive(Clone)]
pub struct MetricsState {
    pub metrics: SharedMetrics,
    pub market: Arc<Marketplace>,
}

/// `GET /metrics`
pub async fn metrics_handler(State(state): State<MetricsState>) -> impl IntoResponse {
    match state.market.escrow().statistics() {
        Ok(stats) => state.metrics.observe_escrows(&stats),
        Err(e) => tracing::warn!(error = %e, "escrow statistics unavailable for scrape"),
    }

    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

/// Middleware: time every API request.
pub async fn track_latency(State(metrics): State<SharedMetrics>, request: Request, next: Next) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned());
    let started = Instant::now();
    let response = next.run(request).await;
    metrics
        .http_request_duration_seconds
        .with_label_values(&[route.as_str(), response.status().as_str()])
        .observe(started.elapsed().as_secs_f64());
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauges_follow_statistics() {
        let metrics = NodeMetrics::new();
        metrics.observe_escrows(&EscrowStatistics {
            total: 4,
            pending: 1,
            completed: 2,
            refunded: 0,
            failed: 1,
            settled_volume: 500,
        });
        metrics.models_published_total.inc();

        let text = metrics.encode().unwrap();
        assert!(text.contains("desci_escrows{status=\"completed\"} 2"));
        assert!(text.contains("desci_escrows{status=\"failed\"} 1"));
        assert!(text.contains("desci_models_published_total 1"));
    }
}
