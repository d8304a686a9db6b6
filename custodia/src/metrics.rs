// Copyright (c) Custodia, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;

use anyhow::Context as _;
use axum::extract::State;
use axum::routing::get;
use axum::Router;
use prometheus::{
    register_histogram_vec_with_registry, register_histogram_with_registry,
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, Encoder, Histogram, HistogramVec, IntCounter, IntCounterVec,
    IntGauge, Registry, TextEncoder,
};
use tokio::task::JoinHandle;
use tracing::{error, info};

const LATENCY_SEC_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10., 20., 30., 60., 120., 240.,
];

#[derive(Clone, Debug)]
pub struct EngineMetrics {
    pub(crate) settlements_completed: IntCounter,
    pub(crate) settlements_rejected: IntCounterVec,
    pub(crate) settlement_latency: Histogram,
    pub(crate) withdrawal_amount_total: IntCounter,

    pub(crate) deposits_swept: IntCounter,
    pub(crate) deposit_amount_total: IntCounter,
    pub(crate) reinvests_completed: IntCounter,

    pub(crate) referral_bonuses_paid: IntCounter,
    pub(crate) referral_bonus_failures: IntCounter,

    pub(crate) rpc_queries: IntCounterVec,
    pub(crate) rpc_queries_latency: HistogramVec,

    pub(crate) reconcile_outcomes: IntCounterVec,

    pub(crate) inflight_settlements: IntGauge,
    pub(crate) treasury_balance: IntGauge,
    pub(crate) node_connected: IntGauge,
}

impl EngineMetrics {
    /// Record the last observed treasury balance, clamped into gauge range.
    pub fn record_treasury_balance(&self, balance: u64) {
        self.treasury_balance.set(balance.min(i64::MAX as u64) as i64);
    }

    pub fn new(registry: &Registry) -> Self {
        Self {
            settlements_completed: register_int_counter_with_registry!(
                "custodia_settlements_completed",
                "Total number of withdrawals that reached ledger commit",
                registry,
            )
            .unwrap(),
            settlements_rejected: register_int_counter_vec_with_registry!(
                "custodia_settlements_rejected",
                "Total number of rejected or failed settlement attempts",
                &["reason"],
                registry,
            )
            .unwrap(),
            settlement_latency: register_histogram_with_registry!(
                "custodia_settlement_latency",
                "Wall-clock duration of settlement attempts in seconds",
                LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            withdrawal_amount_total: register_int_counter_with_registry!(
                "custodia_withdrawal_amount_total",
                "Total withdrawn amount in smallest units",
                registry,
            )
            .unwrap(),
            deposits_swept: register_int_counter_with_registry!(
                "custodia_deposits_swept",
                "Total number of deposits swept into the treasury",
                registry,
            )
            .unwrap(),
            deposit_amount_total: register_int_counter_with_registry!(
                "custodia_deposit_amount_total",
                "Total deposited amount in smallest units",
                registry,
            )
            .unwrap(),
            reinvests_completed: register_int_counter_with_registry!(
                "custodia_reinvests_completed",
                "Total number of profit reinvestments",
                registry,
            )
            .unwrap(),
            referral_bonuses_paid: register_int_counter_with_registry!(
                "custodia_referral_bonuses_paid",
                "Total number of referral bonuses disbursed",
                registry,
            )
            .unwrap(),
            referral_bonus_failures: register_int_counter_with_registry!(
                "custodia_referral_bonus_failures",
                "Referral bonus disbursements that failed after retries",
                registry,
            )
            .unwrap(),
            rpc_queries: register_int_counter_vec_with_registry!(
                "custodia_rpc_queries",
                "Ledger RPC calls by method and result",
                &["method", "result"],
                registry,
            )
            .unwrap(),
            rpc_queries_latency: register_histogram_vec_with_registry!(
                "custodia_rpc_queries_latency",
                "Ledger RPC latency in seconds by method",
                &["method"],
                LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            reconcile_outcomes: register_int_counter_vec_with_registry!(
                "custodia_reconcile_outcomes",
                "Reconciliation pass outcomes by kind",
                &["outcome"],
                registry,
            )
            .unwrap(),
            inflight_settlements: register_int_gauge_with_registry!(
                "custodia_inflight_settlements",
                "Number of settlement pipelines currently holding a lock",
                registry,
            )
            .unwrap(),
            treasury_balance: register_int_gauge_with_registry!(
                "custodia_treasury_balance",
                "Last observed treasury balance in smallest units",
                registry,
            )
            .unwrap(),
            node_connected: register_int_gauge_with_registry!(
                "custodia_node_connected",
                "Whether the last ledger RPC round-trip succeeded",
                registry,
            )
            .unwrap(),
        }
    }
}

async fn metrics_handler(State(registry): State<Registry>) -> (axum::http::StatusCode, String) {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    match encoder.encode(&registry.gather(), &mut buffer) {
        Ok(()) => (
            axum::http::StatusCode::OK,
            String::from_utf8_lossy(&buffer).into_owned(),
        ),
        Err(e) => (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {}", e),
        ),
    }
}

/// Serve the Prometheus registry at `/metrics`.
pub async fn start_metrics_server(
    addr: SocketAddr,
    registry: Registry,
) -> anyhow::Result<JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(registry);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind metrics address")?;
    info!("Metrics server listening on {}", addr);

    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {:?}", e);
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_once() {
        let registry = Registry::new_custom(Some("custodia".into()), None).unwrap();
        let metrics = EngineMetrics::new(&registry);
        metrics.settlements_completed.inc();
        metrics
            .settlements_rejected
            .with_label_values(&["lock_contention"])
            .inc();
        metrics
            .rpc_queries
            .with_label_values(&["get_balance", "ok"])
            .inc();

        let families = registry.gather();
        assert!(!families.is_empty());
    }
}
