//! Cluster topology tracking
//!
//! This module provides the [`Cluster`], which owns every [`Node`], runs the
//! background tend thread and publishes immutable topology and partition map
//! snapshots that commands read without locking.

pub mod context;
pub mod partition;
pub mod tend;
pub mod topology;

pub use context::{ClusterContext, Connectors};
pub use partition::{Partition, PartitionMap, Partitions, Route, PARTITIONS};
pub use topology::Topology;

use crate::command::timeout_queue::AsyncTimeoutQueue;
use crate::config::ClusterPolicy;
use crate::error::{ClientError, Result};
use crate::metrics::ClientMetrics;
use crate::net::Host;
use crate::node::Node;
use crate::stats::ClusterStats;
use arc_swap::ArcSwap;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Upper bound on initial tend ticks while waiting for the node count to settle
const MAX_STABILIZE_TICKS: usize = 10;

pub struct Cluster {
    ctx: Arc<ClusterContext>,
    seeds: Vec<Host>,
    topology: ArcSwap<Topology>,
    partition_map: ArcSwap<PartitionMap>,
    /// Held for the duration of a tick
    tend_lock: Mutex<()>,
    tend_count: AtomicU64,
    node_index: AtomicUsize,
    tend_thread: Mutex<Option<JoinHandle<()>>>,
    timeout_queue: AsyncTimeoutQueue,
}

impl Cluster {
    /// Seed the cluster, wait for discovery to settle and start the tend thread
    pub fn new(
        policy: ClusterPolicy,
        connectors: Connectors,
        metrics: Arc<ClientMetrics>,
    ) -> Result<Arc<Cluster>> {
        let seeds = policy
            .seeds
            .iter()
            .map(|s| Host::parse(s, 3000).map(|h| h.translate(&policy.ip_map)))
            .collect::<Result<Vec<_>>>()?;
        if seeds.is_empty() {
            return Err(ClientError::InvalidArgument("no seed hosts".to_string()));
        }

        let (ctx, wake_rx) = ClusterContext::new(policy, connectors, metrics);
        let cluster = Arc::new(Cluster {
            ctx: Arc::new(ctx),
            seeds,
            topology: ArcSwap::from_pointee(Topology::default()),
            partition_map: ArcSwap::from_pointee(PartitionMap::default()),
            tend_lock: Mutex::new(()),
            tend_count: AtomicU64::new(0),
            node_index: AtomicUsize::new(0),
            tend_thread: Mutex::new(None),
            timeout_queue: AsyncTimeoutQueue::start()?,
        });

        cluster.wait_till_stabilized();

        if cluster.topology.load().is_empty() && cluster.ctx.policy.fail_if_not_connected {
            cluster.close();
            return Err(ClientError::Connection(format!(
                "failed to connect to seed host(s): {}",
                cluster
                    .seeds
                    .iter()
                    .map(Host::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }

        let handle = spawn_tend_thread(Arc::downgrade(&cluster), wake_rx, cluster.ctx.policy.tend_interval())?;
        *cluster.tend_thread.lock() = Some(handle);

        info!(
            "Cluster started with {} node(s)",
            cluster.topology.load().len()
        );
        Ok(cluster)
    }

    /// Tend until the node count stops changing
    fn wait_till_stabilized(&self) {
        let mut count = None;
        for _ in 0..MAX_STABILIZE_TICKS {
            self.tend();
            let current = self.topology.load().len();
            if count == Some(current) {
                break;
            }
            count = Some(current);
        }
    }

    pub fn context(&self) -> &Arc<ClusterContext> {
        &self.ctx
    }

    pub fn policy(&self) -> &ClusterPolicy {
        &self.ctx.policy
    }

    pub fn metrics(&self) -> &Arc<ClientMetrics> {
        &self.ctx.metrics
    }

    pub fn seeds(&self) -> &[Host] {
        &self.seeds
    }

    pub(crate) fn timeout_queue(&self) -> &AsyncTimeoutQueue {
        &self.timeout_queue
    }

    /// Current membership snapshot
    pub fn topology(&self) -> Arc<Topology> {
        self.topology.load_full()
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.topology.load().nodes.clone()
    }

    pub fn node_names(&self) -> Vec<String> {
        self.topology.load().nodes.iter().map(|n| n.name().to_string()).collect()
    }

    pub fn get_node(&self, name: &str) -> Result<Arc<Node>> {
        self.topology
            .load()
            .get(name)
            .cloned()
            .ok_or_else(|| ClientError::InvalidNode(format!("node {} not found", name)))
    }

    /// Next active node in round-robin order
    pub fn random_node(&self) -> Result<Arc<Node>> {
        let topology = self.topology.load();
        let count = topology.len();
        for _ in 0..count {
            let index = self.node_index.fetch_add(1, Ordering::Relaxed) % count;
            let node = &topology.nodes[index];
            if node.is_active() {
                return Ok(node.clone());
            }
        }
        Err(ClientError::InvalidNode("cluster is empty".to_string()))
    }

    /// Current partition map snapshot
    pub fn partition_map(&self) -> Arc<PartitionMap> {
        self.partition_map.load_full()
    }

    pub fn is_connected(&self) -> bool {
        let topology = self.topology.load();
        self.ctx.is_tend_valid() && topology.nodes.iter().any(|n| n.is_active())
    }

    pub fn tend_count(&self) -> u64 {
        self.tend_count.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ClusterStats {
        ClusterStats::new(
            self.topology.load().nodes.iter().map(|n| n.stats()).collect(),
            self.tend_count(),
        )
    }

    /// Stop tending and close every node
    pub fn close(&self) {
        if !self.ctx.is_tend_valid() && self.topology.load().is_empty() {
            return;
        }
        self.ctx.invalidate();

        if let Some(handle) = self.tend_thread.lock().take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("Tend thread panicked");
            }
        }
        self.timeout_queue.stop();

        let _tend = self.tend_lock.lock();
        let topology = self.topology.swap(Arc::new(Topology::default()));
        for node in &topology.nodes {
            node.close();
        }
        self.partition_map.store(Arc::new(PartitionMap::default()));
        info!("Cluster closed");
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_tend_thread(
    cluster: Weak<Cluster>,
    wake_rx: Receiver<()>,
    interval: Duration,
) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("tend".to_string())
        .spawn(move || loop {
            match wake_rx.recv_timeout(interval) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            let cluster = match cluster.upgrade() {
                Some(cluster) => cluster,
                None => break,
            };
            if !cluster.ctx.is_tend_valid() {
                break;
            }
            cluster.tend();
        })?;
    debug!("Tend thread started");
    Ok(handle)
}
