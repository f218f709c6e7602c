//! One tend tick
//!
//! Refreshes every node, runs peer discovery when a peers generation moved,
//! rebuilds the partition map for nodes whose partition generation moved,
//! then removes dead nodes and adds the ones staged during the tick.

use super::partition::PartitionMap;
use super::{Cluster, Topology};
use crate::log::log_tend_operation;
use crate::net::Host;
use crate::node::{Node, NodeValidator, Peers};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Consecutive refresh failures after which a lone node is replaced from the seeds
const SINGLE_NODE_MAX_FAILURES: u32 = 5;

/// Consecutive ticks a node may stay unreferenced before it is removed
const MAX_ABSENT_TICKS: u32 = 2;

impl Cluster {
    /// Run one tend tick
    ///
    /// Ticks are serialized, a manual call waits for a running background tick.
    pub fn tend(&self) {
        let _tend = self.tend_lock.lock();
        if !self.ctx.is_tend_valid() {
            return;
        }
        let started = Instant::now();

        let mut topology = self.topology.load_full();
        let mut peers = Peers::new();
        for node in &topology.nodes {
            node.reset_tend_state();
            if !node.has_peers() {
                peers.use_peers = false;
            }
        }

        if topology.is_empty() {
            let seeded = self.seed_nodes(&topology, &mut peers);
            if !seeded.is_empty() {
                topology = Arc::new(self.add_nodes(&topology, seeded, Default::default()));
                self.topology.store(topology.clone());
                peers.use_peers = topology.nodes.iter().all(|n| n.has_peers());
            }
        }

        for node in &topology.nodes {
            let refresh_started = Instant::now();
            let refreshed = node.refresh(&topology, &mut peers);
            log_tend_operation(
                "refresh",
                node.name(),
                refreshed.is_ok(),
                refresh_started.elapsed(),
                refreshed.as_ref().err(),
            );
        }

        if peers.gen_changed {
            peers.refresh_count = 0;
            for node in &topology.nodes {
                node.refresh_peers(&topology, &mut peers);
            }
        }

        let current_map = self.partition_map.load_full();
        let mut partition_map = (*current_map).clone();
        let mut map_modified = false;
        for node in &topology.nodes {
            if node.partition_changed() && node.refresh_partitions(&peers, &mut partition_map) {
                map_modified = true;
            }
        }

        if self.ctx.policy.rack_aware {
            for node in &topology.nodes {
                if node.rebalance_changed() {
                    node.refresh_racks();
                }
            }
        }

        let mut next = None;
        let removed = if peers.gen_changed || !peers.use_peers {
            self.find_nodes_to_remove(&topology, &partition_map, &mut peers)
        } else {
            self.find_absent_nodes(&topology, &partition_map)
        };
        if !removed.is_empty() {
            next = Some(self.remove_nodes(&topology, &removed));
        }

        if !peers.nodes.is_empty() || !peers.aliases.is_empty() {
            let base = next.take().unwrap_or_else(|| (*topology).clone());
            let staged = peers.nodes.drain().map(|(_, node)| node).collect();
            let aliases = std::mem::take(&mut peers.aliases);
            next = Some(self.add_nodes(&base, staged, aliases));
        }

        if let Some(next) = next {
            topology = Arc::new(next);
            self.topology.store(topology.clone());
        }

        if map_modified {
            self.partition_map.store(Arc::new(partition_map));
            self.ctx.metrics.record_partition_map_update();
        }

        for node in &topology.nodes {
            node.close_idle_connections();
        }

        self.tend_count.fetch_add(1, Ordering::AcqRel);
        let failures = topology.nodes.iter().filter(|n| n.failures() > 0).count();
        self.ctx
            .metrics
            .record_tend(started.elapsed(), topology.len(), failures);
    }

    /// Validate the seed hosts, returning nodes not already in the cluster
    fn seed_nodes(&self, topology: &Topology, peers: &mut Peers) -> Vec<Arc<Node>> {
        let mut seeded: Vec<Arc<Node>> = Vec::new();

        for seed in &self.seeds {
            let nv = match NodeValidator::validate(&self.ctx, seed) {
                Ok(nv) => nv,
                Err(e) => {
                    warn!(seed = %seed, error = %e, "Seed failed");
                    continue;
                }
            };

            let duplicate = topology.get(&nv.name).is_some()
                || peers.nodes.contains_key(&nv.name)
                || seeded.iter().any(|n| n.name() == nv.name);
            if duplicate {
                let mut conn = nv.conn;
                conn.close();
                continue;
            }
            seeded.push(Arc::new(Node::new(self.ctx.clone(), nv)));
        }
        seeded
    }

    fn find_nodes_to_remove(
        &self,
        topology: &Topology,
        partition_map: &PartitionMap,
        peers: &mut Peers,
    ) -> Vec<Arc<Node>> {
        let mut removed = Vec::new();

        for node in &topology.nodes {
            if !node.is_active() {
                removed.push(node.clone());
                continue;
            }

            if topology.len() == 1 {
                // A lone node is only replaced when a seed answers as another node.
                if node.failures() >= SINGLE_NODE_MAX_FAILURES {
                    let seeded = self.seed_nodes(topology, peers);
                    if !seeded.is_empty() {
                        for seed_node in seeded {
                            peers.nodes.insert(seed_node.name().to_string(), seed_node);
                        }
                        removed.push(node.clone());
                    }
                }
                continue;
            }

            if peers.refresh_count >= 1 && node.reference_count() == 0 {
                if self.count_absence(node, partition_map) {
                    removed.push(node.clone());
                }
            } else {
                node.clear_absent();
            }
        }
        removed
    }

    /// Keep counting nodes left unreferenced by the last peers refresh
    ///
    /// Peer lists are only fetched when a peers generation moves, so a node
    /// dropped from every peer list is tracked across the quiet ticks that follow.
    fn find_absent_nodes(&self, topology: &Topology, partition_map: &PartitionMap) -> Vec<Arc<Node>> {
        let mut removed = Vec::new();

        for node in &topology.nodes {
            if !node.is_active() {
                removed.push(node.clone());
            } else if topology.len() > 1
                && node.absent_ticks() > 0
                && self.count_absence(node, partition_map)
            {
                removed.push(node.clone());
            }
        }
        removed
    }

    /// Record one unreferenced tick, returning whether the node should go
    fn count_absence(&self, node: &Arc<Node>, partition_map: &PartitionMap) -> bool {
        let responding = node.failures() == 0;
        if responding && (partition_map.contains_node(node) || self.is_seed(node)) {
            node.clear_absent();
            return false;
        }
        node.record_absent() >= MAX_ABSENT_TICKS
    }

    fn is_seed(&self, node: &Node) -> bool {
        let is_seed_host = |host: &Host| self.seeds.contains(host);
        is_seed_host(node.host()) || node.aliases().iter().any(is_seed_host)
    }

    fn remove_nodes(&self, topology: &Topology, removed: &[Arc<Node>]) -> Topology {
        for node in removed {
            warn!(node = %node, absent_ticks = node.absent_ticks(), "Remove node");
            node.close();
            self.ctx.metrics.record_node_removed();
        }
        topology.with_removed(removed)
    }

    fn add_nodes(
        &self,
        topology: &Topology,
        added: Vec<Arc<Node>>,
        aliases: std::collections::HashMap<Host, Arc<Node>>,
    ) -> Topology {
        for node in &added {
            info!(node = %node, "Add node");
            self.ctx.metrics.record_node_added();
        }
        topology.with_added(added, aliases)
    }
}

impl PartitionMap {
    /// Node owns at least one partition replica
    pub fn contains_node(&self, node: &Arc<Node>) -> bool {
        self.namespaces().any(|namespace| {
            self.get(namespace).map_or(false, |partitions| {
                partitions
                    .replicas
                    .iter()
                    .flatten()
                    .flatten()
                    .any(|owner| Arc::ptr_eq(owner, node))
            })
        })
    }
}
