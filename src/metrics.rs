//! Prometheus counters for provisioning and billing.
//!
//! Registered lazily in the global default registry and exposed on `/metrics`.

use once_cell::sync::Lazy;
use prometheus::{
    opts, register_counter, register_int_counter, register_int_counter_vec, Counter, Encoder,
    IntCounter, IntCounterVec, TextEncoder,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

static ENDPOINTS_PROVISIONED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("yvpn_endpoint_provisions_total", "Endpoint creation attempts by outcome"),
        &["outcome"]
    )
    .expect("failed to register yvpn_endpoint_provisions_total")
});

static ENDPOINT_TEARDOWNS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "yvpn_endpoint_teardowns_total",
        "Endpoints destroyed at the provider and removed from the ledger"
    ))
    .expect("failed to register yvpn_endpoint_teardowns_total")
});

static BILLING_TICKS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!("yvpn_billing_ticks_total", "Completed billing passes"))
        .expect("failed to register yvpn_billing_ticks_total")
});

static BILLING_TOKENS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("yvpn_billing_tokens_total", "Tokens processed by billing, by result"),
        &["result"]
    )
    .expect("failed to register yvpn_billing_tokens_total")
});

static FUNDS_CHARGED: Lazy<Counter> = Lazy::new(|| {
    register_counter!(opts!(
        "yvpn_funds_charged_total",
        "Funds debited by the billing scheduler"
    ))
    .expect("failed to register yvpn_funds_charged_total")
});

pub fn record_provisioning(success: bool) {
    let outcome = if success { "ready" } else { "failed" };
    ENDPOINTS_PROVISIONED.with_label_values(&[outcome]).inc();
}

pub fn record_teardown() {
    ENDPOINT_TEARDOWNS.inc();
}

/// `result` is one of `billed`, `depleted`, `expired`, `failed`.
pub fn record_billed_token(result: &str, charge: Decimal) {
    BILLING_TOKENS.with_label_values(&[result]).inc();
    if let Some(amount) = charge.to_f64() {
        if amount > 0.0 {
            FUNDS_CHARGED.inc_by(amount);
        }
    }
}

pub fn record_billing_tick() {
    BILLING_TICKS.inc();
}

/// Encode all registered metrics as Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap_or_default();
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorded_counters_are_exported() {
        record_provisioning(true);
        record_billed_token("billed", Decimal::new(2, 1));
        record_billing_tick();

        let output = encode_metrics();
        assert!(output.contains("yvpn_endpoint_provisions_total"));
        assert!(output.contains("yvpn_billing_tokens_total"));
        assert!(output.contains("yvpn_funds_charged_total"));
    }
}
