//! Node refresh performed by the tend thread
//!
//! Every tick each node verifies its identity and generation counters over
//! the tend connection. Partition and rack data are only fetched when the
//! corresponding generation moved.

use super::Node;
use super::Peers;
use crate::cluster::partition::{parse_racks, PartitionMap, ReplicasFormat};
use crate::cluster::Topology;
use crate::error::{ClientError, Result};
use crate::info;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

impl Node {
    /// Clear the counters accumulated during the previous tick
    pub(crate) fn reset_tend_state(&self) {
        self.reference_count.store(0, Ordering::Release);
        self.partition_changed.store(false, Ordering::Release);
        self.rebalance_changed.store(false, Ordering::Release);
    }

    pub fn partition_changed(&self) -> bool {
        self.partition_changed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_partition_changed(&self) {
        self.partition_changed.store(true, Ordering::Release);
    }

    pub fn rebalance_changed(&self) -> bool {
        self.rebalance_changed.load(Ordering::Acquire)
    }

    pub(crate) fn absent_ticks(&self) -> u32 {
        self.absent_ticks.load(Ordering::Acquire)
    }

    /// Count one more tick without references, returning the new count
    pub(crate) fn record_absent(&self) -> u32 {
        self.absent_ticks.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn clear_absent(&self) {
        self.absent_ticks.store(0, Ordering::Release);
    }

    /// Verify node identity and generations, staging discovered nodes
    ///
    /// A failure is counted on the node and returned for the tend log.
    pub fn refresh(&self, topology: &Topology, peers: &mut Peers) -> Result<()> {
        if !self.is_active() {
            return Ok(());
        }

        match self.try_refresh(topology, peers) {
            Ok(()) => {
                peers.refresh_count += 1;
                self.failures.store(0, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                if peers.use_peers {
                    peers.gen_changed = true;
                }
                self.record_failure();
                Err(e)
            }
        }
    }

    fn try_refresh(&self, topology: &Topology, peers: &mut Peers) -> Result<()> {
        self.ensure_tend_connection()?;

        let rack_aware = self.ctx.policy.rack_aware;
        let mut names = vec!["node", "partition-generation"];
        if peers.use_peers {
            names.push("peers-generation");
        } else {
            names.push(self.services_command());
        }
        if rack_aware {
            names.push("rebalance-generation");
        }

        let mut map = self.tend_request(&names)?;

        self.verify_node_name(&map)?;
        self.verify_partition_generation(&map)?;
        if rack_aware {
            self.verify_rebalance_generation(&map)?;
        }
        if peers.use_peers {
            let generation = info::parse_generation(&map, "peers-generation")?;
            if generation != self.peers_generation() {
                peers.gen_changed = true;
            }
        } else {
            let services = map.remove(self.services_command()).unwrap_or_default();
            self.add_friends(topology, &services, peers)?;
        }
        Ok(())
    }

    /// Reopen and authenticate the tend connection when it was closed
    fn ensure_tend_connection(&self) -> Result<()> {
        let mut tend_conn = self.tend_conn.lock();

        let open = tend_conn.as_ref().map_or(false, |conn| !conn.is_closed());
        if open {
            drop(tend_conn);
            if self.ctx.policy.credentials().is_some() {
                self.ensure_login()?;
            }
            return Ok(());
        }

        let mut conn = self
            .ctx
            .connectors
            .sync
            .connect(&self.host, self.ctx.policy.connection_timeout())?;
        if let Err(e) = conn.set_timeout(Some(self.ctx.policy.connection_timeout())) {
            conn.close();
            return Err(e);
        }
        *tend_conn = Some(conn);
        drop(tend_conn);

        if let Some((user, _)) = self.ctx.policy.credentials() {
            let authenticated = self.ensure_login().and_then(|logged_in| {
                if logged_in {
                    return Ok(());
                }
                let accepted = match self.session() {
                    Some(session) if !session.token.is_empty() => {
                        let mut tend_conn = self.tend_conn.lock();
                        let conn = tend_conn.as_mut().ok_or(ClientError::Closed)?;
                        self.ctx
                            .connectors
                            .authenticator
                            .authenticate(conn.as_mut(), user, &session)?
                    }
                    _ => false,
                };
                if !accepted {
                    // Session token probably expired.
                    self.login()?;
                }
                Ok(())
            });
            if let Err(e) = authenticated {
                self.close_tend_connection();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Log in when requested or when the session expired
    ///
    /// Returns whether a login was performed.
    fn ensure_login(&self) -> Result<bool> {
        let expired = self
            .session()
            .map_or(false, |session| session.is_expired(Instant::now()));
        if self.login_requested() || expired {
            self.login()?;
            self.perform_login.store(false, Ordering::Release);
            return Ok(true);
        }
        Ok(false)
    }

    fn login(&self) -> Result<()> {
        let (user, password) = match self.ctx.policy.credentials() {
            Some(credentials) => credentials,
            None => return Ok(()),
        };
        let mut tend_conn = self.tend_conn.lock();
        let conn = tend_conn.as_mut().ok_or(ClientError::Closed)?;
        conn.set_timeout(Some(self.ctx.policy.login_timeout()))?;
        let session = self.ctx.connectors.authenticator.login(conn.as_mut(), user, password)?;
        conn.set_timeout(Some(self.ctx.policy.connection_timeout()))?;
        debug!(node = %self, "Logged in");
        self.session.store(Some(Arc::new(session)));
        Ok(())
    }

    fn tend_request(&self, names: &[&str]) -> Result<HashMap<String, String>> {
        let mut tend_conn = self.tend_conn.lock();
        let conn = tend_conn
            .as_mut()
            .ok_or_else(|| ClientError::Connection(format!("node {} has no tend connection", self)))?;
        info::request(conn.as_mut(), names)
    }

    fn close_tend_connection(&self) {
        if let Some(mut conn) = self.tend_conn.lock().take() {
            conn.close();
        }
    }

    fn verify_node_name(&self, map: &HashMap<String, String>) -> Result<()> {
        let name = map.get("node").map(String::as_str).unwrap_or("");
        if name.is_empty() {
            return Err(ClientError::Parse("node name is empty".to_string()));
        }
        if name != self.name {
            // A host name may now resolve to a different server.
            self.active.store(false, Ordering::Release);
            return Err(ClientError::InvalidNode(format!(
                "node name has changed. old={} new={}",
                self.name, name
            )));
        }
        Ok(())
    }

    fn verify_partition_generation(&self, map: &HashMap<String, String>) -> Result<()> {
        let generation = info::parse_generation(map, "partition-generation")?;
        if generation != self.partition_generation() {
            self.partition_changed.store(true, Ordering::Release);
        }
        Ok(())
    }

    fn verify_rebalance_generation(&self, map: &HashMap<String, String>) -> Result<()> {
        let generation = info::parse_generation(map, "rebalance-generation")?;
        if generation != self.rebalance_generation.load(Ordering::Acquire) {
            self.rebalance_changed.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Count a failed tend step and drop the tend connection
    fn record_failure(&self) -> u32 {
        let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
        self.close_tend_connection();
        failures
    }

    pub(crate) fn refresh_failed(&self, error: &ClientError) {
        let failures = self.record_failure();
        if self.ctx.is_tend_valid() {
            warn!(node = %self, failures, error = %error, "Node refresh failed");
        }
    }

    fn replicas_format(&self) -> ReplicasFormat {
        if !self.ctx.policy.request_prole_replicas {
            ReplicasFormat::Master
        } else if self.has_replicas() {
            ReplicasFormat::Regime
        } else if self.has_replicas_all() {
            ReplicasFormat::All
        } else {
            ReplicasFormat::Master
        }
    }

    /// Merge this node's partition ownership into the working map
    ///
    /// Returns whether the map changed.
    pub fn refresh_partitions(self: &Arc<Self>, peers: &Peers, partitions: &mut PartitionMap) -> bool {
        // A node that believes it is alone must not take over every partition.
        if self.failures() > 0
            || !self.is_active()
            || (self.peers_count() == 0 && peers.refresh_count > 1)
        {
            return false;
        }
        debug!(node = %self, "Update partition map");

        match self.try_refresh_partitions(partitions) {
            Ok(modified) => modified,
            Err(e) => {
                self.refresh_failed(&e);
                false
            }
        }
    }

    fn try_refresh_partitions(self: &Arc<Self>, partitions: &mut PartitionMap) -> Result<bool> {
        let format = self.replicas_format();
        let mut map = self.tend_request(&["partition-generation", format.command()])?;
        let generation = info::parse_generation(&map, "partition-generation")?;
        let value = info::take_value(&mut map, format.command())?;

        let modified = partitions.apply(self, &value, format)?;
        self.partition_generation.store(generation, Ordering::Release);
        Ok(modified)
    }

    /// Fetch the rack id of every namespace
    pub fn refresh_racks(&self) {
        if self.failures() > 0 || !self.is_active() {
            return;
        }
        debug!(node = %self, "Update racks");

        let refreshed = self
            .tend_request(&["rebalance-generation", "rack-ids"])
            .and_then(|mut map| {
                let generation = info::parse_generation(&map, "rebalance-generation")?;
                let racks = parse_racks(&info::take_value(&mut map, "rack-ids")?)?;
                self.set_racks(racks);
                self.rebalance_generation.store(generation, Ordering::Release);
                Ok(())
            });
        if let Err(e) = refreshed {
            self.refresh_failed(&e);
        }
    }
}
