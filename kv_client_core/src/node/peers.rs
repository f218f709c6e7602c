//! Peer discovery
//!
//! Nodes report the rest of the cluster either through the `peers-*` info
//! commands or, on servers without peers support, through `services`.
//! Newly found nodes are staged in [`Peers`] and only join the cluster at
//! the end of the tend tick.

use super::{Node, NodeValidator};
use crate::cluster::Topology;
use crate::error::{ClientError, Result};
use crate::info;
use crate::net::Host;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, warn};

/// Peer entry reported by a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub node_name: String,
    pub tls_name: Option<String>,
    pub hosts: Vec<Host>,
}

/// Per-tick discovery state
#[derive(Debug, Default)]
pub struct Peers {
    /// Peers parsed from the last `peers-*` response
    pub peers: Vec<Peer>,
    /// Hosts already tried during this tick
    pub hosts: HashSet<Host>,
    /// Nodes staged for addition
    pub nodes: HashMap<String, Arc<Node>>,
    /// Aliases of existing nodes learned during this tick
    pub aliases: HashMap<Host, Arc<Node>>,
    /// Nodes whose peers were refreshed during this tick
    pub refresh_count: usize,
    /// Some node reported a new peers generation
    pub gen_changed: bool,
    /// Discover through `peers-*`, `services` otherwise
    pub use_peers: bool,
}

impl Peers {
    pub fn new() -> Self {
        Self {
            use_peers: true,
            ..Self::default()
        }
    }

    /// Reset the per-tick state, keeping nothing staged
    pub fn reset(&mut self) {
        *self = Self {
            use_peers: self.use_peers,
            ..Self::default()
        };
    }
}

/// Parsed `peers-*` response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeersResponse {
    pub generation: i64,
    pub peers: Vec<Peer>,
}

struct PeerParser<'a> {
    input: &'a [u8],
    offset: usize,
    ip_map: &'a HashMap<String, String>,
}

impl<'a> PeerParser<'a> {
    fn error(&self, what: &str) -> ClientError {
        ClientError::Parse(format!(
            "invalid peers response at offset {}: {}",
            self.offset, what
        ))
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.offset).copied()
    }

    fn expect(&mut self, c: u8) -> Result<()> {
        if self.peek() != Some(c) {
            return Err(self.error(&format!("expected '{}'", c as char)));
        }
        self.offset += 1;
        Ok(())
    }

    fn token(&mut self, stops: &[u8]) -> Result<&'a str> {
        let begin = self.offset;
        while let Some(c) = self.peek() {
            if stops.contains(&c) {
                break;
            }
            self.offset += 1;
        }
        std::str::from_utf8(&self.input[begin..self.offset]).map_err(|_| self.error("not UTF-8"))
    }

    fn number(&mut self) -> Result<i64> {
        let token = self.token(b",")?;
        let value = token.trim().parse().map_err(|_| self.error("expected number"))?;
        self.expect(b',')?;
        Ok(value)
    }

    fn parse(mut self) -> Result<PeersResponse> {
        let generation = self.number()?;
        let default_port = u16::try_from(self.number()?).map_err(|_| self.error("invalid port"))?;
        let mut peers = Vec::new();

        self.expect(b'[')?;
        if self.peek() == Some(b']') {
            return Ok(PeersResponse { generation, peers });
        }
        loop {
            peers.push(self.parse_peer(default_port)?);
            match self.peek() {
                Some(b',') => self.offset += 1,
                Some(b']') => break,
                _ => return Err(self.error("expected ',' or ']' after peer")),
            }
        }
        Ok(PeersResponse { generation, peers })
    }

    fn parse_peer(&mut self, default_port: u16) -> Result<Peer> {
        self.expect(b'[')?;
        let node_name = self.token(b",")?.to_string();
        self.expect(b',')?;
        let tls_name = Some(self.token(b",")?.to_string()).filter(|n| !n.is_empty());
        self.expect(b',')?;

        let mut hosts = Vec::new();
        self.expect(b'[')?;
        if self.peek() != Some(b']') {
            loop {
                let mut host = self.parse_host(default_port)?.translate(self.ip_map);
                host.tls_name = tls_name.clone();
                hosts.push(host);
                match self.peek() {
                    Some(b',') => self.offset += 1,
                    Some(b']') => break,
                    _ => return Err(self.error("expected ',' or ']' after host")),
                }
            }
        }
        self.expect(b']')?;
        self.expect(b']')?;

        Ok(Peer {
            node_name,
            tls_name,
            hosts,
        })
    }

    fn parse_host(&mut self, default_port: u16) -> Result<Host> {
        let name = if self.peek() == Some(b'[') {
            self.offset += 1;
            let name = self.token(b"]")?;
            self.expect(b']')?;
            name
        } else {
            self.token(b":,]")?
        };
        if name.is_empty() {
            return Err(self.error("empty host"));
        }

        let port = if self.peek() == Some(b':') {
            self.offset += 1;
            let port = self.token(b",]")?;
            port.parse().map_err(|_| self.error("invalid port"))?
        } else {
            default_port
        };
        Ok(Host::new(name, port))
    }
}

/// Parse `generation,default_port,[[name,tls_name,[host,...]],...]`
pub fn parse_peers(value: &str, ip_map: &HashMap<String, String>) -> Result<PeersResponse> {
    PeerParser {
        input: value.trim().as_bytes(),
        offset: 0,
        ip_map,
    }
    .parse()
}

/// Parse a `services` list of `host:port` entries separated by `;`
pub fn parse_services(value: &str, ip_map: &HashMap<String, String>) -> Result<Vec<Host>> {
    value
        .split(';')
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (name, port) = entry
                .rsplit_once(':')
                .ok_or_else(|| ClientError::Parse(format!("invalid service address {}", entry)))?;
            let port = port
                .parse()
                .map_err(|_| ClientError::Parse(format!("invalid service port {}", entry)))?;
            Ok(Host::new(name, port).translate(ip_map))
        })
        .collect()
}

impl Node {
    pub(crate) fn peers_command(&self) -> &'static str {
        match (self.ctx.policy.tls, self.ctx.policy.use_services_alternate) {
            (true, true) => "peers-tls-alt",
            (true, false) => "peers-tls-std",
            (false, true) => "peers-clear-alt",
            (false, false) => "peers-clear-std",
        }
    }

    pub(crate) fn services_command(&self) -> &'static str {
        if self.ctx.policy.use_services_alternate {
            "services-alternate"
        } else {
            "services"
        }
    }

    /// Fetch the peers list and stage nodes that are not yet known
    pub fn refresh_peers(&self, topology: &Topology, peers: &mut Peers) {
        if self.failures() > 0 || !self.is_active() {
            return;
        }
        debug!(node = %self, "Update peers");

        if let Err(e) = self.try_refresh_peers(topology, peers) {
            self.refresh_failed(&e);
        }
    }

    fn try_refresh_peers(&self, topology: &Topology, peers: &mut Peers) -> Result<()> {
        let command = self.peers_command();
        let value = {
            let mut tend_conn = self.tend_conn.lock();
            let conn = tend_conn
                .as_mut()
                .ok_or_else(|| ClientError::Connection(format!("node {} has no tend connection", self)))?;
            info::request_value(conn.as_mut(), command)?
        };
        let response = parse_peers(&value, &self.ctx.policy.ip_map)?;
        self.peers_count.store(response.peers.len(), Ordering::Release);

        let mut validated_all = true;
        for peer in &response.peers {
            if find_peer_node(topology, peers, &peer.node_name) {
                continue;
            }
            if !self.stage_peer(topology, peers, peer) {
                validated_all = false;
            }
        }
        peers.peers = response.peers;

        // A generation is only accepted once every peer made it into the cluster.
        if validated_all {
            self.peers_generation.store(response.generation, Ordering::Release);
        }
        peers.refresh_count += 1;
        Ok(())
    }

    fn stage_peer(&self, topology: &Topology, peers: &mut Peers, peer: &Peer) -> bool {
        for host in &peer.hosts {
            let nv = match NodeValidator::validate(&self.ctx, host) {
                Ok(nv) => nv,
                Err(e) => {
                    warn!(host = %host, error = %e, "Add node failed");
                    continue;
                }
            };

            if nv.name != peer.node_name {
                warn!(
                    peer = %peer.node_name,
                    actual = %nv.name,
                    host = %host,
                    "Peer node is different than actual node"
                );
                if find_peer_node(topology, peers, &nv.name) {
                    let mut conn = nv.conn;
                    conn.close();
                    return true;
                }
            }

            let node = Arc::new(Node::new(self.ctx.clone(), nv));
            peers.nodes.insert(node.name().to_string(), node);
            return true;
        }
        false
    }

    /// Stage nodes listed in the `services` response
    pub(crate) fn add_friends(&self, topology: &Topology, value: &str, peers: &mut Peers) -> Result<()> {
        if value.is_empty() {
            self.peers_count.store(0, Ordering::Release);
            return Ok(());
        }
        let hosts = parse_services(value, &self.ctx.policy.ip_map)?;
        self.peers_count.store(hosts.len(), Ordering::Release);

        for host in hosts {
            let known = topology
                .aliases
                .get(&host)
                .or_else(|| peers.aliases.get(&host))
                .cloned();
            if let Some(node) = known {
                node.reference_count.fetch_add(1, Ordering::AcqRel);
            } else if !peers.hosts.contains(&host) {
                self.prepare_friend(topology, host, peers);
            }
        }
        Ok(())
    }

    fn prepare_friend(&self, topology: &Topology, host: Host, peers: &mut Peers) -> bool {
        let nv = match NodeValidator::validate(&self.ctx, &host) {
            Ok(nv) => nv,
            Err(e) => {
                warn!(host = %host, error = %e, "Add node failed");
                return false;
            }
        };

        // Same node reachable through several addresses, such as internal and external IPs.
        if let Some(node) = peers.nodes.get(&nv.name) {
            let mut conn = nv.conn;
            conn.close();
            node.add_alias(host.clone());
            peers.hosts.insert(host);
            return true;
        }

        if let Some(node) = topology.get(&nv.name) {
            let mut conn = nv.conn;
            conn.close();
            node.add_alias(host.clone());
            node.reference_count.fetch_add(1, Ordering::AcqRel);
            peers.aliases.insert(host.clone(), node.clone());
            peers.hosts.insert(host);
            return true;
        }

        let node = Arc::new(Node::new(self.ctx.clone(), nv));
        peers.hosts.insert(host);
        peers.nodes.insert(node.name().to_string(), node);
        true
    }
}

fn find_peer_node(topology: &Topology, peers: &Peers, name: &str) -> bool {
    match topology.get(name).or_else(|| peers.nodes.get(name)) {
        Some(node) => {
            node.reference_count.fetch_add(1, Ordering::AcqRel);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_peers_with_default_port_and_ipv6() {
        let value = "7,3000,[[BB9,,[10.0.0.2,10.0.0.3:3100]],[BB8,tls8,[[2001:db8::1]:3200,[::1]]]]";
        let response = parse_peers(value, &HashMap::new()).unwrap();

        assert_eq!(response.generation, 7);
        assert_eq!(response.peers.len(), 2);
        assert_eq!(response.peers[0].node_name, "BB9");
        assert_eq!(response.peers[0].tls_name, None);
        assert_eq!(
            response.peers[0].hosts,
            vec![Host::new("10.0.0.2", 3000), Host::new("10.0.0.3", 3100)]
        );

        let second = &response.peers[1];
        assert_eq!(second.tls_name.as_deref(), Some("tls8"));
        assert_eq!(second.hosts[0].name, "2001:db8::1");
        assert_eq!(second.hosts[0].port, 3200);
        assert_eq!(second.hosts[1].name, "::1");
        assert_eq!(second.hosts[1].port, 3000);
    }

    #[test]
    fn test_parse_empty_peers() {
        let response = parse_peers("3,3000,[]", &HashMap::new()).unwrap();
        assert_eq!(response.generation, 3);
        assert!(response.peers.is_empty());
    }

    #[test]
    fn test_parse_peers_applies_ip_map() {
        let mut ip_map = HashMap::new();
        ip_map.insert("10.0.0.2".to_string(), "203.0.113.2".to_string());
        let response = parse_peers("1,3000,[[BB9,,[10.0.0.2]]]", &ip_map).unwrap();
        assert_eq!(response.peers[0].hosts[0].name, "203.0.113.2");
    }

    #[test]
    fn test_parse_peers_rejects_garbage() {
        assert!(parse_peers("x,3000,[]", &HashMap::new()).is_err());
        assert!(parse_peers("1,3000,[[BB9,,[10.0.0.2]]", &HashMap::new()).is_err());
    }

    #[test]
    fn test_parse_services() {
        let hosts = parse_services("10.0.0.2:3000;10.0.0.3:3001", &HashMap::new()).unwrap();
        assert_eq!(hosts, vec![Host::new("10.0.0.2", 3000), Host::new("10.0.0.3", 3001)]);
        assert!(parse_services("10.0.0.2", &HashMap::new()).is_err());
    }
}
