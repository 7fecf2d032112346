// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_vec_with_registry, Encoder,
    HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Registry, TextEncoder,
};

pub const METRICS_PATH: &str = "/metrics";

const CYCLE_LATENCY_SEC_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10., 20., 30., 60., 120., 300., 600.,
];

#[derive(Clone, Debug)]
pub struct RelayerMetrics {
    pub(crate) cycles_total: IntCounterVec,
    pub(crate) lease_not_acquired_total: IntCounterVec,
    pub(crate) tx_commit_retries_total: IntCounter,
    pub(crate) submitted_transactions_total: IntCounterVec,
    pub(crate) last_processed_block: IntGaugeVec,
    pub(crate) scheduler_state: IntGaugeVec,
    pub(crate) step_errors_total: IntCounterVec,
    pub(crate) cycle_latency_seconds: HistogramVec,
}

impl RelayerMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        Ok(Self {
            cycles_total: register_int_counter_vec_with_registry!(
                "relayer_cycles_total",
                "Total number of scheduler cycles by outcome",
                &["family", "outcome"],
                registry,
            )?,
            lease_not_acquired_total: register_int_counter_vec_with_registry!(
                "relayer_lease_not_acquired_total",
                "Ticks skipped because the job row was absent, locked or deferred",
                &["family"],
                registry,
            )?,
            tx_commit_retries_total: register_int_counter_with_registry!(
                "relayer_tx_commit_retries_total",
                "Total number of transactions replayed after a serialization conflict",
                registry,
            )?,
            submitted_transactions_total: register_int_counter_vec_with_registry!(
                "relayer_submitted_transactions_total",
                "Total number of on-chain transactions submitted by status",
                &["family", "status"],
                registry,
            )?,
            last_processed_block: register_int_gauge_vec_with_registry!(
                "relayer_last_processed_block",
                "Last processed block per progress marker",
                &["event"],
                registry,
            )?,
            scheduler_state: register_int_gauge_vec_with_registry!(
                "relayer_scheduler_state",
                "Current scheduler state (0 idle, 1 polling, 2 applying, 3 cancelled)",
                &["family"],
                registry,
            )?,
            step_errors_total: register_int_counter_vec_with_registry!(
                "relayer_step_errors_total",
                "Total number of failed cycles by error type",
                &["family", "error_type"],
                registry,
            )?,
            cycle_latency_seconds: register_histogram_vec_with_registry!(
                "relayer_cycle_latency_seconds",
                "Wall time of one acquired scheduler cycle",
                &["family"],
                CYCLE_LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )?,
        })
    }

    pub fn new_for_testing() -> Self {
        let registry = Registry::new();
        match Self::new(&registry) {
            Ok(metrics) => metrics,
            Err(e) => panic!("failed to register metrics on a fresh registry: {e}"),
        }
    }
}

pub fn make_metrics_router(registry: Registry) -> Router {
    Router::new()
        .route(METRICS_PATH, get(render_metrics))
        .route("/health", get(|| async { StatusCode::OK }))
        .with_state(registry)
}

/// Serves the registry on `/metrics` until the listener fails.
pub fn start_metrics_server(
    address: SocketAddr,
    registry: Registry,
) -> tokio::task::JoinHandle<anyhow::Result<()>> {
    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(address).await?;
        tracing::info!("[Metrics] Serving prometheus metrics on {}", address);
        axum::serve(listener, make_metrics_router(registry).into_make_service()).await?;
        Ok(())
    })
}

async fn render_metrics(State(registry): State<Registry>) -> (StatusCode, String) {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }
    match String::from_utf8(buffer) {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
