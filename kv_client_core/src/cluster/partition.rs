//! Partition map
//!
//! Every namespace is split into [`PARTITIONS`] partitions, each owned by a
//! master and zero or more prole replicas. The map is rebuilt copy-on-write
//! by the tend thread and read lock-free by commands.

use crate::config::Replica;
use crate::error::{ClientError, Result};
use crate::key::Key;
use crate::node::Node;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::collections::HashMap;
use std::sync::Arc;

/// Number of partitions per namespace
pub const PARTITIONS: usize = 4096;

const BITMAP_SIZE: usize = PARTITIONS / 8;
const MAX_NAMESPACE_LEN: usize = 31;

/// Replica owners of every partition of one namespace
#[derive(Debug, Clone)]
pub struct Partitions {
    /// Indexed by replica, then partition id
    pub replicas: Vec<Vec<Option<Arc<Node>>>>,
    /// Regime under which each partition owner was last assigned
    pub regimes: Vec<u32>,
}

impl Partitions {
    pub fn new(replica_count: usize) -> Self {
        Self {
            replicas: vec![vec![None; PARTITIONS]; replica_count],
            regimes: vec![0; PARTITIONS],
        }
    }

    /// Copy with a different replica count, keeping the overlapping replicas
    fn resized(&self, replica_count: usize) -> Self {
        let mut replicas = self.replicas.clone();
        replicas.resize_with(replica_count, || vec![None; PARTITIONS]);
        Self {
            replicas,
            regimes: self.regimes.clone(),
        }
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    pub fn master(&self, partition_id: usize) -> Option<&Arc<Node>> {
        self.replicas.first()?.get(partition_id)?.as_ref()
    }
}

/// Partition to node mapping for every namespace
#[derive(Debug, Clone, Default)]
pub struct PartitionMap {
    namespaces: HashMap<String, Arc<Partitions>>,
}

/// Layout of a replicas info response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicasFormat {
    /// `ns:regime,count,bitmap,...`
    Regime,
    /// `ns:count,bitmap,...`
    All,
    /// `ns:bitmap`
    Master,
}

impl ReplicasFormat {
    pub fn command(self) -> &'static str {
        match self {
            ReplicasFormat::Regime => "replicas",
            ReplicasFormat::All => "replicas-all",
            ReplicasFormat::Master => "replicas-master",
        }
    }
}

impl PartitionMap {
    pub fn get(&self, namespace: &str) -> Option<&Arc<Partitions>> {
        self.namespaces.get(namespace)
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.namespaces.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
    }

    /// Apply a replicas response from `node`
    ///
    /// Namespaces that change are copied on first write. Returns whether
    /// anything changed.
    pub fn apply(&mut self, node: &Arc<Node>, value: &str, format: ReplicasFormat) -> Result<bool> {
        let mut modified = false;

        for entry in value.split(';').filter(|e| !e.is_empty()) {
            let (namespace, rest) = entry
                .split_once(':')
                .ok_or_else(|| ClientError::Parse(format!("invalid replicas entry {}", entry)))?;
            if namespace.is_empty() || namespace.len() > MAX_NAMESPACE_LEN {
                return Err(ClientError::Parse(format!("invalid partition namespace {}", namespace)));
            }

            let mut fields = rest.split(',');
            let regime = match format {
                ReplicasFormat::Regime => parse_number(fields.next(), "regime")?,
                _ => 0,
            };
            let replica_count = match format {
                ReplicasFormat::Master => 1,
                _ => parse_number(fields.next(), "replica count")? as usize,
            };
            let bitmaps: Vec<&str> = fields.collect();
            if bitmaps.len() != replica_count {
                return Err(ClientError::Parse(format!(
                    "namespace {} declares {} replicas but sent {} bitmaps",
                    namespace,
                    replica_count,
                    bitmaps.len()
                )));
            }

            let partitions = self
                .namespaces
                .entry(namespace.to_string())
                .or_insert_with(|| {
                    modified = true;
                    Arc::new(Partitions::new(replica_count))
                });
            if partitions.replica_count() != replica_count {
                *partitions = Arc::new(partitions.resized(replica_count));
                modified = true;
            }

            for (replica, encoded) in bitmaps.iter().enumerate() {
                let bitmap = STANDARD
                    .decode(encoded)
                    .map_err(|e| ClientError::Parse(format!("invalid partition bitmap: {}", e)))?;
                if bitmap.len() != BITMAP_SIZE {
                    return Err(ClientError::Parse(format!(
                        "partition bitmap has {} bytes, expected {}",
                        bitmap.len(),
                        BITMAP_SIZE
                    )));
                }
                if apply_bitmap(partitions, replica, &bitmap, node, regime) {
                    modified = true;
                }
            }
        }
        Ok(modified)
    }

    /// Node to send a command for `partition_id` to
    pub fn node_for(
        &self,
        namespace: &str,
        partition_id: usize,
        route: &Route,
    ) -> Result<Arc<Node>> {
        let partitions = self.namespaces.get(namespace).ok_or_else(|| {
            ClientError::InvalidNode(format!("namespace {} not found in partition map", namespace))
        })?;

        let found = if route.is_write || route.replica == Replica::Master {
            partitions
                .master(partition_id)
                .filter(|node| node.is_active())
                .cloned()
        } else if route.replica == Replica::PreferRack {
            rack_node(partitions, namespace, partition_id, route)
                .or_else(|| sequence_node(partitions, partition_id, route.sequence))
        } else {
            sequence_node(partitions, partition_id, route.sequence)
        };

        found.ok_or_else(|| {
            ClientError::InvalidNode(format!(
                "no active node for partition {} of namespace {}",
                partition_id, namespace
            ))
        })
    }
}

fn parse_number(field: Option<&str>, what: &str) -> Result<u32> {
    field
        .and_then(|f| f.trim().parse().ok())
        .ok_or_else(|| ClientError::Parse(format!("invalid {} in replicas response", what)))
}

fn apply_bitmap(
    partitions: &mut Arc<Partitions>,
    replica: usize,
    bitmap: &[u8],
    node: &Arc<Node>,
    regime: u32,
) -> bool {
    let mut modified = false;

    for partition_id in 0..PARTITIONS {
        if bitmap[partition_id >> 3] & (0x80 >> (partition_id & 7)) == 0 {
            continue;
        }
        let current = &partitions.replicas[replica][partition_id];
        if current.as_ref().map_or(false, |old| Arc::ptr_eq(old, node)) {
            continue;
        }
        if regime < partitions.regimes[partition_id] {
            continue;
        }

        // The previous owner must refresh to learn what it lost.
        if let Some(old) = current {
            old.mark_partition_changed();
        }
        let owned = Arc::make_mut(partitions);
        owned.replicas[replica][partition_id] = Some(node.clone());
        owned.regimes[partition_id] = regime;
        modified = true;
    }
    modified
}

/// Routing inputs of one command attempt
#[derive(Debug, Clone)]
pub struct Route {
    pub replica: Replica,
    pub sequence: usize,
    pub rack_id: i32,
    pub is_write: bool,
}

fn sequence_node(partitions: &Partitions, partition_id: usize, sequence: usize) -> Option<Arc<Node>> {
    let count = partitions.replica_count();
    (0..count)
        .map(|i| (sequence + i) % count)
        .filter_map(|index| partitions.replicas[index][partition_id].as_ref())
        .find(|node| node.is_active())
        .cloned()
}

fn rack_node(
    partitions: &Partitions,
    namespace: &str,
    partition_id: usize,
    route: &Route,
) -> Option<Arc<Node>> {
    let count = partitions.replica_count();
    (0..count)
        .map(|i| (route.sequence + i) % count)
        .filter_map(|index| partitions.replicas[index][partition_id].as_ref())
        .find(|node| node.is_active() && node.has_rack(namespace, route.rack_id))
        .cloned()
}

/// Target partition of a key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Partition {
    pub namespace: String,
    pub partition_id: usize,
}

impl Partition {
    pub fn new(namespace: impl Into<String>, partition_id: usize) -> Self {
        Self {
            namespace: namespace.into(),
            partition_id,
        }
    }

    pub fn from_key(key: &Key) -> Self {
        Self::new(key.namespace.clone(), partition_id(&key.digest))
    }
}

/// Partition id of a record digest
pub fn partition_id(digest: &[u8; 20]) -> usize {
    usize::from(u16::from_le_bytes([digest[0], digest[1]])) % PARTITIONS
}

/// Parse a `rack-ids` response of `ns:rack` entries
pub fn parse_racks(value: &str) -> Result<HashMap<String, i32>> {
    value
        .split(';')
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (namespace, rack) = entry
                .split_once(':')
                .ok_or_else(|| ClientError::Parse(format!("invalid rack entry {}", entry)))?;
            let rack = rack
                .trim()
                .parse()
                .map_err(|_| ClientError::Parse(format!("invalid rack id in {}", entry)))?;
            Ok((namespace.to_string(), rack))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn bitmap_of(partition_ids: &[usize]) -> String {
        let mut bitmap = vec![0u8; BITMAP_SIZE];
        for id in partition_ids {
            bitmap[id >> 3] |= 0x80 >> (id & 7);
        }
        STANDARD.encode(bitmap)
    }

    #[test]
    fn test_partition_id_uses_first_two_digest_bytes() {
        let mut digest = [0u8; 20];
        digest[0] = 0x34;
        digest[1] = 0x12;
        assert_eq!(partition_id(&digest), 0x1234 % PARTITIONS);
        digest[1] = 0xff;
        assert!(partition_id(&digest) < PARTITIONS);
    }

    #[test]
    fn test_bitmap_bit_order() {
        let encoded = bitmap_of(&[0, 9]);
        let bitmap = STANDARD.decode(encoded).unwrap();
        assert_eq!(bitmap[0], 0x80);
        assert_eq!(bitmap[1], 0x40);
    }

    #[test]
    fn test_parse_racks() {
        let racks = parse_racks("test:1;bar:2").unwrap();
        assert_eq!(racks["test"], 1);
        assert_eq!(racks["bar"], 2);
        assert!(parse_racks("test").is_err());
    }

    #[test]
    fn test_replicas_format_commands() {
        assert_eq!(ReplicasFormat::Regime.command(), "replicas");
        assert_eq!(ReplicasFormat::All.command(), "replicas-all");
        assert_eq!(ReplicasFormat::Master.command(), "replicas-master");
    }
}
