//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Ledger connection and validated ledger index
//! - Escrow ingestion and proposals
//! - Settlement submissions by engine result
//! - Liquidation triggers and expiry sweeps

use crate::error::{EngineError, EngineResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, Counter, CounterVec, Encoder, Gauge,
    TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Ledger metrics
    pub static ref LEDGER_CONNECTED: Gauge = register_gauge!(
        "escrow_engine_ledger_connected",
        "Ledger connection status (1=connected, 0=disconnected)"
    ).unwrap();

    pub static ref LEDGER_INDEX: Gauge = register_gauge!(
        "escrow_engine_ledger_index",
        "Last ledger index seen"
    ).unwrap();

    pub static ref LEDGER_RESETS: Counter = register_counter!(
        "escrow_engine_ledger_resets_total",
        "Forced ledger reconnects"
    ).unwrap();

    pub static ref BOOK_FETCH_ERRORS: Counter = register_counter!(
        "escrow_engine_book_fetch_errors_total",
        "Failed order book fetches"
    ).unwrap();

    // Escrow metrics
    pub static ref ESCROWS_PROPOSED: Counter = register_counter!(
        "escrow_engine_escrows_proposed_total",
        "EscrowCreate proposals built"
    ).unwrap();

    pub static ref ESCROWS_INGESTED: CounterVec = register_counter_vec!(
        "escrow_engine_escrows_ingested_total",
        "Escrows confirmed on ledger by currency",
        &["currency"]
    ).unwrap();

    // Settlement metrics
    pub static ref SUBMISSIONS: CounterVec = register_counter_vec!(
        "escrow_engine_submissions_total",
        "Custody submissions by transaction type and engine result",
        &["transaction_type", "engine_result"]
    ).unwrap();

    pub static ref LIQUIDATIONS: CounterVec = register_counter_vec!(
        "escrow_engine_liquidation_triggers_total",
        "Liquidation conditions detected by currency",
        &["currency"]
    ).unwrap();

    pub static ref SWEEPS: CounterVec = register_counter_vec!(
        "escrow_engine_sweep_outcomes_total",
        "Expiry sweep cancel outcomes",
        &["outcome"]
    ).unwrap();

    // Subscriber metrics
    pub static ref PUBSUB_CHANNELS: Gauge = register_gauge!(
        "escrow_engine_pubsub_channels",
        "Live account channels"
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: Counter = register_counter!(
        "escrow_engine_health_check_success_total",
        "Total successful health checks"
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: Counter = register_counter!(
        "escrow_engine_health_check_failure_total",
        "Total failed health checks"
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> EngineResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| EngineError::Internal(format!("metrics bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| EngineError::Internal(format!("metrics server: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, (StatusCode, String)> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

// Helper functions to record metrics

pub fn record_ledger_health(healthy: bool) {
    LEDGER_CONNECTED.set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_ledger_index(ledger_index: u32) {
    LEDGER_INDEX.set(f64::from(ledger_index));
}

pub fn record_ledger_reset() {
    LEDGER_RESETS.inc();
}

pub fn record_book_fetch_error() {
    BOOK_FETCH_ERRORS.inc();
}

pub fn record_escrow_proposed() {
    ESCROWS_PROPOSED.inc();
}

pub fn record_escrow_ingested(currency: &str) {
    ESCROWS_INGESTED.with_label_values(&[currency]).inc();
}

pub fn record_submission(transaction_type: &str, engine_result: &str) {
    SUBMISSIONS
        .with_label_values(&[transaction_type, engine_result])
        .inc();
}

pub fn record_liquidation_trigger(currency: &str) {
    LIQUIDATIONS.with_label_values(&[currency]).inc();
}

pub fn record_sweep(outcome: &str) {
    SWEEPS.with_label_values(&[outcome]).inc();
}

pub fn set_pubsub_channels(count: usize) {
    PUBSUB_CHANNELS.set(count as f64);
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.inc();
}
