//! Prometheus metrics for the keel engine.
//!
//! Covers the stream connection, the signal pipeline, order execution,
//! the circuit breaker, and realized P&L.
//!
//! # Panics
//!
//! Metric registration uses `unwrap()` intentionally. A registration
//! failure means a duplicate metric name, which should crash at startup
//! rather than fail silently. These panics only occur during static
//! initialization, never at runtime.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram,
    register_histogram_vec, register_int_counter, register_int_gauge, CounterVec, Gauge, GaugeVec,
    Histogram, HistogramVec, IntCounter, IntGauge,
};

/// Stream connection state (1 = streaming, 0 = not).
pub static WS_CONNECTED: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!("keel_ws_connected", "Stream connection state (1=streaming)").unwrap()
});

/// Connection state machine current state.
/// Labels: state (disconnected/connecting/authenticating/subscribed/streaming/reconnecting)
pub static WS_STATE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "keel_ws_state",
        "Connection state machine current state (1=active, 0=inactive)",
        &["state"]
    )
    .unwrap()
});

/// Total reconnection attempts.
pub static WS_RECONNECT_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("keel_ws_reconnect_total", "Total reconnection attempts").unwrap()
});

/// Stream message latency in milliseconds.
pub static STREAM_LATENCY_MS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "keel_stream_latency_ms",
        "Stream message latency in milliseconds",
        &["channel"],
        vec![0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0, 1000.0]
    )
    .unwrap()
});

/// Total signals accepted by the pipeline.
pub static SIGNALS_ACCEPTED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "keel_signals_accepted_total",
        "Total signals accepted into the pipeline",
        &["symbol", "reason"]
    )
    .unwrap()
});

/// Total signals dropped as duplicates.
pub static SIGNALS_DEDUPED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "keel_signals_deduped_total",
        "Total signals dropped by the deduper",
        &["symbol"]
    )
    .unwrap()
});

/// Risk gate rejections by reason.
pub static GATE_REJECTED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "keel_gate_rejected_total",
        "Total risk gate rejections",
        &["reason", "symbol"]
    )
    .unwrap()
});

/// Order round-trip latency in milliseconds.
pub static ORDER_LATENCY_MS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "keel_order_latency_ms",
        "Order submission round-trip latency in milliseconds",
        vec![5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0, 1000.0, 2000.0, 5000.0, 10000.0]
    )
    .unwrap()
});

/// Order outcomes by result.
/// Labels: outcome (success/failure/timeout/rejected)
pub static ORDER_OUTCOME_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "keel_order_outcome_total",
        "Total order outcomes",
        &["outcome"]
    )
    .unwrap()
});

/// Circuit breaker state (0=closed, 1=open, 2=half-open).
pub static CIRCUIT_STATE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "keel_circuit_state",
        "Circuit breaker state (0=closed, 1=open, 2=half-open)"
    )
    .unwrap()
});

/// Daily realized P&L in quote currency.
pub static REALIZED_PNL: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "keel_realized_pnl",
        "Daily realized P&L in quote currency"
    )
    .unwrap()
});

/// Open position count.
pub static OPEN_POSITIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("keel_open_positions", "Number of open positions").unwrap()
});

/// Metrics facade for easy access.
pub struct Metrics;

impl Metrics {
    pub fn ws_connected() {
        WS_CONNECTED.set(1.0);
    }

    pub fn ws_disconnected() {
        WS_CONNECTED.set(0.0);
    }

    /// Set the connection state. Only the active state is 1.
    pub fn ws_state_set(state: &str) {
        for s in &[
            "disconnected",
            "connecting",
            "authenticating",
            "subscribed",
            "streaming",
            "reconnecting",
        ] {
            WS_STATE.with_label_values(&[s]).set(0.0);
        }
        WS_STATE.with_label_values(&[state]).set(1.0);
    }

    pub fn ws_reconnect() {
        WS_RECONNECT_TOTAL.inc();
    }

    pub fn stream_latency(channel: &str, latency_ms: f64) {
        STREAM_LATENCY_MS
            .with_label_values(&[channel])
            .observe(latency_ms);
    }

    pub fn signal_accepted(symbol: &str, reason: &str) {
        SIGNALS_ACCEPTED_TOTAL
            .with_label_values(&[symbol, reason])
            .inc();
    }

    pub fn signal_deduped(symbol: &str) {
        SIGNALS_DEDUPED_TOTAL.with_label_values(&[symbol]).inc();
    }

    pub fn gate_rejected(reason: &str, symbol: &str) {
        GATE_REJECTED_TOTAL
            .with_label_values(&[reason, symbol])
            .inc();
    }

    pub fn order_latency(latency_ms: f64) {
        ORDER_LATENCY_MS.observe(latency_ms);
    }

    pub fn order_outcome(outcome: &str) {
        ORDER_OUTCOME_TOTAL.with_label_values(&[outcome]).inc();
    }

    /// 0=closed, 1=open, 2=half-open.
    pub fn circuit_state(state: i64) {
        CIRCUIT_STATE.set(state);
    }

    pub fn realized_pnl(pnl: f64) {
        REALIZED_PNL.set(pnl);
    }

    pub fn open_positions(count: i64) {
        OPEN_POSITIONS.set(count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statics_register_once() {
        // Touching every metric forces registration; duplicates would panic.
        Metrics::ws_connected();
        Metrics::ws_state_set("streaming");
        Metrics::ws_reconnect();
        Metrics::stream_latency("ticker", 2.5);
        Metrics::signal_accepted("BTC/USD", "momentum");
        Metrics::signal_deduped("BTC/USD");
        Metrics::gate_rejected("below_confidence_floor", "BTC/USD");
        Metrics::order_latency(42.0);
        Metrics::order_outcome("success");
        Metrics::circuit_state(0);
        Metrics::realized_pnl(-3.5);
        Metrics::open_positions(2);
    }

    #[test]
    fn test_ws_state_is_exclusive() {
        Metrics::ws_state_set("reconnecting");
        Metrics::ws_state_set("streaming");
        assert_eq!(WS_STATE.with_label_values(&["streaming"]).get(), 1.0);
        assert_eq!(WS_STATE.with_label_values(&["reconnecting"]).get(), 0.0);
    }
}
