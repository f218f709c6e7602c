//! Configuration for the key-value client runtime
//!
//! This module provides structured configuration using TOML/YAML files with
//! serde, environment overrides and validation. Command policies carry the
//! timeout and retry budget used by the execution engine.

use crate::error::{ClientError, Result};
use crate::net::Host;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::time::Duration;

/// Top-level client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Cluster discovery and connection settings
    pub cluster: ClusterPolicy,
    /// Default policy for single-record reads
    pub read: Policy,
    /// Default policy for writes and deletes
    pub write: WritePolicy,
    /// Default policy for batch requests
    pub batch: BatchPolicy,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Cluster discovery and connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterPolicy {
    /// Seed hosts in `host:port` form
    pub seeds: Vec<String>,
    /// User name, authentication is enabled when set
    pub user: Option<String>,
    /// Password for `user`
    pub password: Option<String>,
    /// Expected cluster name, verified on every new node
    pub cluster_name: Option<String>,
    /// Timeout for opening a connection in milliseconds
    pub connection_timeout_ms: u64,
    /// Timeout for login requests in milliseconds
    pub login_timeout_ms: u64,
    /// Interval between tend ticks in milliseconds
    pub tend_interval_ms: u64,
    /// Maximum synchronous connections per node
    pub max_conns_per_node: usize,
    /// Number of pool shards per node
    pub conn_pools_per_node: usize,
    /// Maximum asynchronous connections per node
    pub async_max_conns_per_node: usize,
    /// Idle connections older than this are trimmed, in seconds (0 = never)
    pub max_socket_idle_secs: u64,
    /// Prefer replicas on the local rack
    pub rack_aware: bool,
    /// Local rack id used with `rack_aware`
    pub rack_id: i32,
    /// Use `services-alternate` / `peers-clear-alt` addresses
    pub use_services_alternate: bool,
    /// Request TLS peer addresses
    pub tls: bool,
    /// Fail client creation when no seed could be reached
    pub fail_if_not_connected: bool,
    /// Fetch prole replicas in addition to masters
    pub request_prole_replicas: bool,
    /// Address translation applied to discovered hosts
    pub ip_map: HashMap<String, String>,
}

/// Replica selection for reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Replica {
    /// Always the master
    Master,
    /// Rotate through replicas on retry
    Sequence,
    /// Replicas on the local rack first, then sequence
    PreferRack,
}

/// Timeout and retry budget of a single command
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    /// Per-attempt socket timeout in milliseconds (0 = none)
    pub socket_timeout_ms: u64,
    /// Total deadline across all attempts in milliseconds (0 = none)
    pub total_timeout_ms: u64,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay between attempts in milliseconds
    pub sleep_between_retries_ms: u64,
    /// Replica selection
    pub replica: Replica,
    /// Send the user key along with the digest
    pub send_key: bool,
}

/// Write specific settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WritePolicy {
    pub base: Policy,
    /// Record time-to-live in seconds (0 = namespace default)
    pub expiration: u32,
    /// Expected generation, checked when non-zero
    pub generation: u32,
}

/// Batch specific settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchPolicy {
    pub base: Policy,
    /// Force the legacy per-namespace protocol
    pub use_batch_direct: bool,
    /// Parallel node requests for sync batches (0 = all at once)
    pub max_concurrent_threads: usize,
    /// Allow the server to process the batch in its service thread
    pub allow_inline: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: LogLevel,
    /// Log format
    pub format: LogFormat,
    /// Enable console output
    pub console: bool,
    /// Include targets and span fields
    pub structured: bool,
}

/// Log level
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Log format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogFormat {
    /// Simple text format
    Simple,
    /// JSON format
    Json,
    /// Pretty format with colors
    Pretty,
}

impl ClientConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| ClientError::Config(e.to_string()))
    }

    /// Load configuration from a YAML file
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&content).map_err(|e| ClientError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| ClientError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Save configuration to a YAML file
    pub fn save_to_yaml_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self).map_err(|e| ClientError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply `KV_CLIENT_*` environment overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(seeds) = env::var("KV_CLIENT_SEEDS") {
            self.cluster.seeds = seeds
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(user) = env::var("KV_CLIENT_USER") {
            self.cluster.user = Some(user);
        }
        if let Ok(password) = env::var("KV_CLIENT_PASSWORD") {
            self.cluster.password = Some(password);
        }
        if let Ok(interval) = env::var("KV_CLIENT_TEND_INTERVAL_MS") {
            self.cluster.tend_interval_ms = parse_env("KV_CLIENT_TEND_INTERVAL_MS", &interval)?;
        }
        if let Ok(max) = env::var("KV_CLIENT_MAX_CONNS_PER_NODE") {
            self.cluster.max_conns_per_node = parse_env("KV_CLIENT_MAX_CONNS_PER_NODE", &max)?;
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let cluster = &self.cluster;

        if cluster.seeds.is_empty() {
            errors.push("At least one seed host is required".to_string());
        }
        for seed in &cluster.seeds {
            if let Err(e) = Host::parse(seed, 3000) {
                errors.push(format!("Invalid seed host {}: {}", seed, e));
            }
        }
        if cluster.tend_interval_ms == 0 {
            errors.push("Tend interval cannot be 0".to_string());
        }
        if cluster.conn_pools_per_node == 0 {
            errors.push("Connection pools per node cannot be 0".to_string());
        }
        if cluster.max_conns_per_node < cluster.conn_pools_per_node {
            errors.push(format!(
                "Max connections per node {} must be at least the pool count {}",
                cluster.max_conns_per_node, cluster.conn_pools_per_node
            ));
        }
        if cluster.async_max_conns_per_node == 0 {
            errors.push("Async max connections per node cannot be 0".to_string());
        }
        if cluster.user.is_some() && cluster.password.is_none() {
            errors.push("Password is required when user is set".to_string());
        }
        if self.batch.max_concurrent_threads > 1024 {
            errors.push("Batch max concurrent threads cannot exceed 1024".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Parsed seed hosts
    pub fn seed_hosts(&self) -> Result<Vec<Host>> {
        self.cluster.seeds.iter().map(|s| Host::parse(s, 3000)).collect()
    }
}

impl ClusterPolicy {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_millis(self.login_timeout_ms)
    }

    pub fn tend_interval(&self) -> Duration {
        Duration::from_millis(self.tend_interval_ms)
    }

    /// Idle limit for pooled connections, `None` when trimming is disabled
    pub fn max_socket_idle(&self) -> Option<Duration> {
        if self.max_socket_idle_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.max_socket_idle_secs))
        }
    }

    /// Credentials when authentication is enabled
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.user, &self.password) {
            (Some(user), Some(password)) => Some((user.as_str(), password.as_str())),
            _ => None,
        }
    }
}

impl Policy {
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }

    pub fn total_timeout(&self) -> Duration {
        Duration::from_millis(self.total_timeout_ms)
    }

    pub fn sleep_between_retries(&self) -> Duration {
        Duration::from_millis(self.sleep_between_retries_ms)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ClientError::Config(format!("{} has invalid value {}", name, value)))
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            cluster: ClusterPolicy::default(),
            read: Policy::default(),
            write: WritePolicy::default(),
            batch: BatchPolicy::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ClusterPolicy {
    fn default() -> Self {
        Self {
            seeds: vec!["127.0.0.1:3000".to_string()],
            user: None,
            password: None,
            cluster_name: None,
            connection_timeout_ms: 1000,
            login_timeout_ms: 5000,
            tend_interval_ms: 1000,
            max_conns_per_node: 100,
            conn_pools_per_node: 1,
            async_max_conns_per_node: 100,
            max_socket_idle_secs: 55,
            rack_aware: false,
            rack_id: 0,
            use_services_alternate: false,
            tls: false,
            fail_if_not_connected: true,
            request_prole_replicas: true,
            ip_map: HashMap::new(),
        }
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            socket_timeout_ms: 30_000,
            total_timeout_ms: 1000,
            max_retries: 2,
            sleep_between_retries_ms: 0,
            replica: Replica::Sequence,
            send_key: false,
        }
    }
}

impl Default for WritePolicy {
    fn default() -> Self {
        Self {
            base: Policy {
                max_retries: 0,
                ..Policy::default()
            },
            expiration: 0,
            generation: 0,
        }
    }
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            base: Policy::default(),
            use_batch_direct: false,
            max_concurrent_threads: 1,
            allow_inline: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Simple,
            console: true,
            structured: true,
        }
    }
}
