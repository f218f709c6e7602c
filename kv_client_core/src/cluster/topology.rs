use crate::net::Host;
use crate::node::Node;
use std::collections::HashMap;
use std::sync::Arc;

/// Immutable snapshot of the cluster membership
///
/// The tend thread builds a new snapshot whenever nodes are added or
/// removed and swaps it in whole.
#[derive(Debug, Default, Clone)]
pub struct Topology {
    pub nodes: Vec<Arc<Node>>,
    pub nodes_map: HashMap<String, Arc<Node>>,
    /// Every known address of every node
    pub aliases: HashMap<Host, Arc<Node>>,
}

impl Topology {
    pub fn get(&self, name: &str) -> Option<&Arc<Node>> {
        self.nodes_map.get(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Snapshot with `added` appended
    pub fn with_added(&self, added: Vec<Arc<Node>>, aliases: HashMap<Host, Arc<Node>>) -> Topology {
        let mut next = self.clone();
        next.aliases.extend(aliases);
        for node in added {
            for alias in node.aliases() {
                next.aliases.insert(alias, node.clone());
            }
            next.nodes_map.insert(node.name().to_string(), node.clone());
            next.nodes.push(node);
        }
        next
    }

    /// Snapshot without `removed`
    pub fn with_removed(&self, removed: &[Arc<Node>]) -> Topology {
        let gone = |node: &Arc<Node>| removed.iter().any(|r| Arc::ptr_eq(r, node));
        Topology {
            nodes: self.nodes.iter().filter(|n| !gone(n)).cloned().collect(),
            nodes_map: self
                .nodes_map
                .iter()
                .filter(|(_, n)| !gone(n))
                .map(|(k, n)| (k.clone(), n.clone()))
                .collect(),
            aliases: self
                .aliases
                .iter()
                .filter(|(_, n)| !gone(n))
                .map(|(h, n)| (h.clone(), n.clone()))
                .collect(),
        }
    }
}
