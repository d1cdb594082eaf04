//! Thin wrapper over the `metrics` crate so call sites read as intent
//! (`telemetry.record_transaction("accepted")`) rather than scattering
//! macro invocations across every module.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Zero-sized handle: `metrics` macros record to the process-wide global
/// recorder, so there is no per-instance state to own. Kept as a struct
/// (rather than free functions) so call sites read `telemetry.foo()`
/// consistently with the rest of the subsystem handles.
#[derive(Debug, Clone, Copy, Default)]
pub struct Telemetry;

impl Telemetry {
    pub fn record_transaction(&self, status: &'static str) {
        counter!("transactions_total", "status" => status).increment(1);
    }

    pub fn record_batch(&self, status: &'static str) {
        counter!("batches_total", "status" => status).increment(1);
    }

    pub fn record_signing_operation(&self, status: &'static str) {
        counter!("signing_operations", "status" => status).increment(1);
    }

    pub fn record_failover(&self) {
        counter!("failovers_total").increment(1);
    }

    pub fn record_rotation(&self) {
        counter!("rotations_total").increment(1);
    }

    pub fn record_reconciler_repair(&self, kind: &'static str) {
        counter!("reconciler_repairs_total", "kind" => kind).increment(1);
    }

    pub fn record_transaction_latency(&self, d: Duration) {
        histogram!("transaction_latency_seconds").record(d.as_secs_f64());
    }

    pub fn record_batch_processing(&self, d: Duration) {
        histogram!("batch_processing_seconds").record(d.as_secs_f64());
    }

    pub fn record_signing_latency(&self, d: Duration) {
        histogram!("signing_latency_seconds").record(d.as_secs_f64());
    }

    pub fn set_queue_size(&self, size: usize) {
        gauge!("queue_size").set(size as f64);
    }

    pub fn set_active_connections(&self, n: usize) {
        gauge!("active_connections").set(n as f64);
    }

    pub fn set_current_signing_provider(&self, provider_index: u8) {
        gauge!("current_signing_provider").set(provider_index as f64);
    }

    pub fn set_emergency_mode(&self, active: bool) {
        gauge!("emergency_mode").set(if active { 1.0 } else { 0.0 });
    }
}
