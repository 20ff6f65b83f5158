//! Prometheus metrics of the guardian daemon.
//!
//! All metrics live in a [`Registry`] owned by `main`, which also serves them on `/metrics`.

use prometheus::{
    register_histogram_vec_with_registry,
    register_histogram_with_registry,
    register_int_counter_vec_with_registry,
    register_int_counter_with_registry,
    register_int_gauge_vec_with_registry,
    register_int_gauge_with_registry,
    Encoder,
    Histogram,
    HistogramVec,
    IntCounter,
    IntCounterVec,
    IntGauge,
    IntGaugeVec,
    Registry,
    TextEncoder,
};

/// Latency buckets for RPC calls, in seconds.
const RPC_LATENCY_SEC_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 30.0, 60.0,
];

/// Duration buckets for a full guardian cycle, in seconds.
const CYCLE_DURATION_SEC_BUCKETS: &[f64] = &[0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0];

/// Every metric the daemon records.
#[derive(Clone, Debug)]
pub struct GuardianMetrics {
    /// RPC requests by method.
    pub rpc_requests: IntCounterVec,
    /// Failed RPC requests by method.
    pub rpc_errors: IntCounterVec,
    /// RPC latency by method.
    pub rpc_duration: HistogramVec,
    /// Published guardian messages by type.
    pub messages_sent: IntCounterVec,
    /// Duration of a guardian cycle.
    pub cycle_duration: Histogram,
    /// Failed guardian cycles.
    pub cycle_errors: IntCounter,
    /// Latest block processed.
    pub block_number: IntGauge,
    /// Deposit events held in the persisted cache.
    pub deposit_events_cached: IntGauge,
    /// Deposit events that failed verification.
    pub invalid_deposit_events: IntGauge,
    /// Key counts by module and classification.
    pub module_keys: IntGaugeVec,
}

impl GuardianMetrics {
    /// Registers every metric in `registry`.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        Ok(Self {
            rpc_requests: register_int_counter_vec_with_registry!(
                "guardian_rpc_requests_total",
                "Total number of JSON-RPC requests, by method",
                &["method"],
                registry
            )?,
            rpc_errors: register_int_counter_vec_with_registry!(
                "guardian_rpc_errors_total",
                "Total number of failed JSON-RPC requests, by method",
                &["method"],
                registry
            )?,
            rpc_duration: register_histogram_vec_with_registry!(
                "guardian_rpc_request_duration_seconds",
                "Latency of JSON-RPC requests, by method",
                &["method"],
                RPC_LATENCY_SEC_BUCKETS.to_vec(),
                registry
            )?,
            messages_sent: register_int_counter_vec_with_registry!(
                "guardian_messages_sent_total",
                "Total number of guardian messages handed to the transport, by type",
                &["type"],
                registry
            )?,
            cycle_duration: register_histogram_with_registry!(
                "guardian_cycle_duration_seconds",
                "Duration of a full guardian cycle",
                CYCLE_DURATION_SEC_BUCKETS.to_vec(),
                registry
            )?,
            cycle_errors: register_int_counter_with_registry!(
                "guardian_cycle_errors_total",
                "Number of guardian cycles that ended with an error",
                registry
            )?,
            block_number: register_int_gauge_with_registry!(
                "guardian_block_number",
                "Latest block processed by the guardian",
                registry
            )?,
            deposit_events_cached: register_int_gauge_with_registry!(
                "guardian_deposit_events_cached",
                "Number of deposit events in the persisted cache",
                registry
            )?,
            invalid_deposit_events: register_int_gauge_with_registry!(
                "guardian_invalid_deposit_events",
                "Number of known deposit events that failed verification",
                registry
            )?,
            module_keys: register_int_gauge_vec_with_registry!(
                "guardian_module_keys",
                "Number of keys per staking module, by classification",
                &["module", "kind"],
                registry
            )?,
        })
    }
}

/// Renders `registry` in the prometheus text format.
pub fn encode_metrics(registry: &Registry) -> Result<String, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
