#![allow(missing_docs)] // proc macros dont play nicely with docstrings

//! # metrics
//!
//! contains statistics for the reconciliation engine
use std::time::Instant;

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec,
};

lazy_static! {
    /// When the agent started
    pub static ref START_TIME: Instant = Instant::now();
    /// descriptor events received from the watcher
    pub static ref DESCRIPTOR_EVENTS: IntCounter = register_int_counter!(
        "guest_agent_descriptor_events_total",
        "descriptor events received from the metadata watcher"
    )
    .unwrap();
    /// reconciliations that performed work
    pub static ref RECONCILE_RUNS: IntCounter = register_int_counter!(
        "guest_agent_reconcile_runs_total",
        "reconciliations that rendered or reloaded configuration"
    )
    .unwrap();
    /// reconciliations short-circuited by the applied-state comparison
    pub static ref RECONCILE_NOOPS: IntCounter = register_int_counter!(
        "guest_agent_reconcile_noops_total",
        "reconciliations skipped because the descriptor was unchanged"
    )
    .unwrap();
    /// reconciliations that failed
    pub static ref RECONCILE_ERRORS: IntCounter = register_int_counter!(
        "guest_agent_reconcile_errors_total",
        "reconciliations aborted by an error"
    )
    .unwrap();
    /// rollback failures, always best-effort
    pub static ref ROLLBACK_ERRORS: IntCounter = register_int_counter!(
        "guest_agent_rollback_errors_total",
        "best-effort rollback operations that reported an error"
    )
    .unwrap();
    /// which backend detection settled on
    pub static ref BACKEND_DETECTED: IntCounterVec = register_int_counter_vec!(
        "guest_agent_backend_detected_total",
        "detections resolved, labelled by winning backend",
        &["backend"]
    )
    .unwrap();
}

/// Render the default registry for the diagnostics log
pub fn snapshot() -> String {
    use prometheus::Encoder;
    let mut buf = Vec::new();
    let encoder = prometheus::TextEncoder::new();
    if encoder
        .encode(&prometheus::default_registry().gather(), &mut buf)
        .is_err()
    {
        return String::new();
    }
    String::from_utf8_lossy(&buf).into_owned()
}
