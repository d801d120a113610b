//! Prometheus metrics for the scheduler.
//!
//! This module defines all metrics exported at the `/metrics` endpoint.
//!
//! # Metric Categories
//!
//! - **Fleet**: Connected node counts by role
//! - **Assets**: Active state machines, state transitions, pull dispatches
//! - **Election**: Elections run since start
//! - **Reports**: Workload report ingest outcomes
//! - **RPC**: Outbound node call latency by endpoint

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::sync::{Arc, Mutex};
use tracing::error;

/// Prometheus metrics collection for the scheduler.
///
/// All metrics are registered with the Prometheus registry on construction
/// and can be scraped via the `/metrics` HTTP endpoint.
#[derive(Clone)]
pub struct Metrics {
    pub registry: Arc<Mutex<Registry>>,

    /// Connected nodes. Label: type (edge/candidate)
    pub node_count: Family<[(String, String); 1], Gauge>,

    /// Asset machines currently alive
    pub assets_active: Gauge,
    /// State machine transitions. Label: state (entered state)
    pub asset_state_transitions: Family<[(String, String); 1], Counter>,
    /// Pull requests dispatched to nodes
    pub pull_dispatch_total: Counter,

    /// Elections performed
    pub elections_total: Counter,

    /// Workload report ingest outcomes. Label: result (accepted/rejected)
    pub workload_reports_total: Family<[(String, String); 1], Counter>,

    /// Outbound node RPC latency in seconds. Label: endpoint
    pub rpc_request_duration_seconds: Family<[(String, String); 1], Histogram>,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let node_count = Family::<[(String, String); 1], Gauge>::default();
        registry.register("node_count", "Number of nodes connected", node_count.clone());

        let assets_active = Gauge::default();
        registry.register(
            "assets_active",
            "Number of live asset state machines",
            assets_active.clone(),
        );

        let asset_state_transitions = Family::<[(String, String); 1], Counter>::default();
        registry.register(
            "asset_state_transitions_total",
            "Asset state machine transitions by entered state",
            asset_state_transitions.clone(),
        );

        let pull_dispatch_total = Counter::default();
        registry.register(
            "pull_dispatch_total",
            "Pull requests dispatched to nodes",
            pull_dispatch_total.clone(),
        );

        let elections_total = Counter::default();
        registry.register(
            "elections_total",
            "Validator elections performed",
            elections_total.clone(),
        );

        let workload_reports_total = Family::<[(String, String); 1], Counter>::default();
        registry.register(
            "workload_reports_total",
            "Workload report submissions by result",
            workload_reports_total.clone(),
        );

        let rpc_request_duration_seconds =
            Family::<[(String, String); 1], Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 14))
            });
        registry.register(
            "rpc_request_duration_seconds",
            "Outbound node RPC latency by endpoint",
            rpc_request_duration_seconds.clone(),
        );

        Self {
            registry: Arc::new(Mutex::new(registry)),
            node_count,
            assets_active,
            asset_state_transitions,
            pull_dispatch_total,
            elections_total,
            workload_reports_total,
            rpc_request_duration_seconds,
        }
    }

    /// Record entry into an asset machine state.
    pub fn record_transition(&self, state: &str) {
        self.asset_state_transitions
            .get_or_create(&[("state".to_string(), state.to_string())])
            .inc();
    }

    /// Record a workload report outcome.
    pub fn record_report(&self, result: &str) {
        self.workload_reports_total
            .get_or_create(&[("result".to_string(), result.to_string())])
            .inc();
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut buf = String::new();
        match self.registry.lock() {
            Ok(registry) => {
                if let Err(e) = encode(&mut buf, &registry) {
                    error!(error = %e, "failed to encode metrics");
                }
            }
            Err(e) => error!(error = %e, "metrics registry lock poisoned"),
        }
        buf
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_registered_metrics() {
        let metrics = Metrics::new();
        metrics.record_transition("servicing");
        metrics.record_report("accepted");
        metrics.elections_total.inc();

        let out = metrics.render();
        assert!(out.contains("asset_state_transitions_total"));
        assert!(out.contains("elections_total"));
        assert!(out.contains("workload_reports_total"));
    }
}
