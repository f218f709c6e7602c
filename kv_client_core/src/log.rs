//! Structured logging for the client runtime
//!
//! This module provides structured logging using the `tracing` crate and
//! span helpers for tend and command events.

use crate::config::{LogFormat, LogLevel, LoggingConfig};
use crate::error::{ClientError, Result};
use std::sync::Once;
use std::time::Duration;
use tracing_subscriber::fmt::{format::FmtSpan, time::UtcTime};
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Initialize the logging system based on configuration
///
/// Only the first call installs a subscriber. Later calls are no-ops.
/// `RUST_LOG` overrides the configured level when set.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let mut result = Ok(());
    INIT.call_once(|| {
        result = init_logging_inner(config);
    });
    result
}

fn init_logging_inner(config: &LoggingConfig) -> Result<()> {
    if !config.console {
        return Ok(());
    }
    let builder = tracing_subscriber::fmt()
        .with_target(config.structured)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_timer(UtcTime::rfc_3339())
        .with_env_filter(build_filter(&config.level));

    let installed = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Simple => builder.try_init(),
    };
    installed.map_err(|e| ClientError::Config(format!("failed to install logger: {}", e)))?;

    tracing::info!("Logging system initialized with level: {:?}", config.level);
    Ok(())
}

/// Filter from `RUST_LOG`, falling back to the configured level
fn build_filter(level: &LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_directive(level)))
}

fn level_directive(level: &LogLevel) -> &'static str {
    match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    }
}

/// Log one tend step for a node with structured fields
pub fn log_tend_operation(
    operation: &str,
    node: &str,
    success: bool,
    duration: Duration,
    error: Option<&ClientError>,
) {
    let span = tracing::debug_span!(
        "tend_operation",
        operation = operation,
        node = node,
        success = success,
        duration_ms = duration.as_millis() as u64,
    );
    let _enter = span.enter();

    match error {
        None => tracing::debug!("Tend operation completed"),
        Some(e) => tracing::warn!("Node {} {} failed: {}", node, operation, e),
    }
}

/// Log a retried command attempt
pub fn log_command_retry(command: &str, node: &str, iteration: u32, error: &ClientError) {
    let span = tracing::debug_span!(
        "command_retry",
        command = command,
        node = node,
        iteration = iteration,
        result_code = error.result_code(),
    );
    let _enter = span.enter();
    tracing::debug!("Retrying {} after: {}", command, error);
}

/// Log client startup settings
pub fn log_startup(config: &crate::config::ClientConfig) {
    tracing::info!("Starting key-value client");
    tracing::info!("Seeds: {}", config.cluster.seeds.join(","));
    tracing::info!(
        "Pools: {} x {} connections per node, async {}",
        config.cluster.conn_pools_per_node,
        config.cluster.max_conns_per_node,
        config.cluster.async_max_conns_per_node
    );
    if config.cluster.rack_aware {
        tracing::info!("Rack aware routing enabled: rack_id={}", config.cluster.rack_id);
    }
    if config.cluster.user.is_some() {
        tracing::info!("Authentication enabled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_directives_parse_as_filters() {
        let levels = [LogLevel::Error, LogLevel::Warn, LogLevel::Info, LogLevel::Debug, LogLevel::Trace];
        for level in &levels {
            assert!(EnvFilter::try_new(level_directive(level)).is_ok());
        }
    }

    #[test]
    fn test_logging_initialization() {
        let config = LoggingConfig::default();
        let _ = init_logging(&config);
        // Second call never installs again.
        assert!(init_logging(&config).is_ok());
    }
}
