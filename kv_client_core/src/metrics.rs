//! Metrics collection for the client runtime
//!
//! Counters are kept locally as atomics for [`ClientMetrics::summary`] and
//! mirrored to the `metrics` crate facade for any installed recorder.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Client-side counters shared by the cluster, nodes and commands
#[derive(Debug, Default)]
pub struct ClientMetrics {
    pub connections_opened: AtomicU64,
    pub connections_closed: AtomicU64,
    pub connection_errors: AtomicU64,
    pub command_retries: AtomicU64,
    pub client_timeouts: AtomicU64,
    pub server_timeouts: AtomicU64,
    pub tend_ticks: AtomicU64,
    pub tend_failures: AtomicU64,
    pub nodes_added: AtomicU64,
    pub nodes_removed: AtomicU64,
    pub partition_map_updates: AtomicU64,
}

/// Point-in-time copy of [`ClientMetrics`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetricsSummary {
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub connection_errors: u64,
    pub command_retries: u64,
    pub client_timeouts: u64,
    pub server_timeouts: u64,
    pub tend_ticks: u64,
    pub tend_failures: u64,
    pub nodes_added: u64,
    pub nodes_removed: u64,
    pub partition_map_updates: u64,
}

impl ClientMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("kv_client_connections_opened_total", 1);
    }

    pub fn record_connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("kv_client_connections_closed_total", 1);
    }

    pub fn record_connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("kv_client_connection_errors_total", 1);
    }

    /// Record a retried attempt and the reason for it
    pub fn record_retry(&self, reason: &str) {
        self.command_retries.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("kv_client_command_retries_total", 1, "reason" => reason.to_string());
        match reason {
            "client_timeout" => {
                self.client_timeouts.fetch_add(1, Ordering::Relaxed);
            }
            "server_timeout" => {
                self.server_timeouts.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    pub fn record_tend(&self, duration: Duration, node_count: usize, failures: usize) {
        self.tend_ticks.fetch_add(1, Ordering::Relaxed);
        self.tend_failures.fetch_add(failures as u64, Ordering::Relaxed);
        metrics::counter!("kv_client_tend_ticks_total", 1);
        metrics::gauge!("kv_client_cluster_nodes", node_count as f64);
        metrics::histogram!("kv_client_tend_duration_ms", duration.as_millis() as f64);
    }

    pub fn record_node_added(&self) {
        self.nodes_added.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("kv_client_nodes_added_total", 1);
    }

    pub fn record_node_removed(&self) {
        self.nodes_removed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("kv_client_nodes_removed_total", 1);
    }

    pub fn record_partition_map_update(&self) {
        self.partition_map_updates.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("kv_client_partition_map_updates_total", 1);
    }

    /// Snapshot of all counters
    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            command_retries: self.command_retries.load(Ordering::Relaxed),
            client_timeouts: self.client_timeouts.load(Ordering::Relaxed),
            server_timeouts: self.server_timeouts.load(Ordering::Relaxed),
            tend_ticks: self.tend_ticks.load(Ordering::Relaxed),
            tend_failures: self.tend_failures.load(Ordering::Relaxed),
            nodes_added: self.nodes_added.load(Ordering::Relaxed),
            nodes_removed: self.nodes_removed.load(Ordering::Relaxed),
            partition_map_updates: self.partition_map_updates.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_reasons_split_timeouts() {
        let metrics = ClientMetrics::new();
        metrics.record_retry("client_timeout");
        metrics.record_retry("server_timeout");
        metrics.record_retry("network");

        let summary = metrics.summary();
        assert_eq!(summary.command_retries, 3);
        assert_eq!(summary.client_timeouts, 1);
        assert_eq!(summary.server_timeouts, 1);
    }

    #[test]
    fn test_tend_counters() {
        let metrics = ClientMetrics::new();
        metrics.record_tend(Duration::from_millis(3), 2, 1);
        metrics.record_tend(Duration::from_millis(4), 2, 0);
        metrics.record_connection_opened();
        metrics.record_connection_closed();

        let summary = metrics.summary();
        assert_eq!(summary.tend_ticks, 2);
        assert_eq!(summary.tend_failures, 1);
        assert_eq!(summary.connections_opened, 1);
        assert_eq!(summary.connections_closed, 1);
    }
}
