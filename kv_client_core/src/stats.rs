//! Connection and cluster statistics

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Add;

/// Connection counts of one pool or a sum of pools
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStats {
    /// Idle connections waiting in the pool
    pub in_pool: usize,
    /// Connections currently leased to commands
    pub in_use: usize,
    /// Connections opened since start
    pub opened: u64,
    /// Connections closed since start
    pub closed: u64,
}

impl Add for ConnectionStats {
    type Output = ConnectionStats;

    fn add(self, other: ConnectionStats) -> ConnectionStats {
        ConnectionStats {
            in_pool: self.in_pool + other.in_pool,
            in_use: self.in_use + other.in_use,
            opened: self.opened + other.opened,
            closed: self.closed + other.closed,
        }
    }
}

impl fmt::Display for ConnectionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "in_use={} in_pool={} opened={} closed={}",
            self.in_use, self.in_pool, self.opened, self.closed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStats {
    pub name: String,
    pub host: String,
    pub active: bool,
    pub sync: ConnectionStats,
    pub asynchronous: ConnectionStats,
}

impl fmt::Display for NodeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} sync({}) async({})", self.name, self.host, self.sync, self.asynchronous)
    }
}

/// Snapshot of every node's connection usage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStats {
    pub nodes: Vec<NodeStats>,
    pub tend_count: u64,
    pub taken_at: DateTime<Utc>,
}

impl ClusterStats {
    pub fn new(nodes: Vec<NodeStats>, tend_count: u64) -> Self {
        Self {
            nodes,
            tend_count,
            taken_at: Utc::now(),
        }
    }

    /// Sum of the synchronous pools of all nodes
    pub fn total_sync(&self) -> ConnectionStats {
        self.nodes
            .iter()
            .fold(ConnectionStats::default(), |sum, node| sum + node.sync)
    }

    pub fn total_async(&self) -> ConnectionStats {
        self.nodes
            .iter()
            .fold(ConnectionStats::default(), |sum, node| sum + node.asynchronous)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for ClusterStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "tend_count={} taken_at={}", self.tend_count, self.taken_at.to_rfc3339())?;
        for node in &self.nodes {
            writeln!(f, "{}", node)?;
        }
        Ok(())
    }
}
