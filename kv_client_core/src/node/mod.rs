//! Cluster node representation
//!
//! A [`Node`] owns the sharded synchronous connection pools, the async pool
//! and a dedicated tend connection used only for info requests. Topology
//! counters on the node are written by the tend thread alone.

pub mod lease;
pub mod peers;
pub mod pool;
pub mod refresh;
pub mod validator;

pub use lease::{AsyncPooledConnection, PooledConnection};
pub use peers::{Peer, Peers};
pub use pool::ConnectionPool;
pub use validator::NodeValidator;

use crate::auth::Session;
use crate::cluster::ClusterContext;
use crate::error::{ClientError, Result};
use crate::net::{AsyncConnection, Connection, Host};
use crate::stats::{ConnectionStats, NodeStats};
use arc_swap::{ArcSwap, ArcSwapOption};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const HAS_GEO: u32 = 1 << 0;
pub const HAS_DOUBLE: u32 = 1 << 1;
pub const HAS_BATCH_INDEX: u32 = 1 << 2;
pub const HAS_REPLICAS_ALL: u32 = 1 << 3;
pub const HAS_PEERS: u32 = 1 << 4;
pub const HAS_REPLICAS: u32 = 1 << 5;
pub const HAS_CLUSTER_STABLE: u32 = 1 << 6;
pub const HAS_LUT_NOW: u32 = 1 << 7;
pub const HAS_RACK_AWARE: u32 = 1 << 8;

/// Map the `features` info value to a capability bitset
pub fn parse_features(value: &str) -> u32 {
    value
        .split(';')
        .map(|feature| match feature.trim() {
            "geo" => HAS_GEO,
            "float" => HAS_DOUBLE,
            "batch-index" => HAS_BATCH_INDEX,
            "replicas-all" => HAS_REPLICAS_ALL,
            "peers" => HAS_PEERS,
            "replicas" => HAS_REPLICAS,
            "cluster-stable" => HAS_CLUSTER_STABLE,
            "lut-now" => HAS_LUT_NOW,
            "rack-aware" => HAS_RACK_AWARE,
            _ => 0,
        })
        .fold(0, |features, flag| features | flag)
}

/// One server node of the cluster
pub struct Node {
    name: String,
    host: Host,
    aliases: Mutex<Vec<Host>>,
    features: u32,
    ctx: Arc<ClusterContext>,
    session: ArcSwapOption<Session>,
    perform_login: AtomicBool,
    tend_conn: Mutex<Option<Box<dyn Connection>>>,
    pools: Vec<ConnectionPool<Box<dyn Connection>>>,
    async_pool: ConnectionPool<Box<dyn AsyncConnection>>,
    /// Rack id per namespace
    racks: ArcSwap<HashMap<String, i32>>,
    connection_iter: AtomicUsize,
    reference_count: AtomicU32,
    failures: AtomicU32,
    absent_ticks: AtomicU32,
    peers_generation: AtomicI64,
    partition_generation: AtomicI64,
    rebalance_generation: AtomicI64,
    peers_count: AtomicUsize,
    partition_changed: AtomicBool,
    rebalance_changed: AtomicBool,
    active: AtomicBool,
}

impl Node {
    /// Create a node from a validated connection
    pub fn new(ctx: Arc<ClusterContext>, nv: NodeValidator) -> Self {
        let shards = ctx.policy.conn_pools_per_node.max(1);
        let max = ctx.policy.max_conns_per_node / shards;
        let rem = ctx.policy.max_conns_per_node - max * shards;
        let pools = (0..shards)
            .map(|i| ConnectionPool::new(if i < rem { max + 1 } else { max }))
            .collect();
        let async_pool = ConnectionPool::new(ctx.policy.async_max_conns_per_node);

        Self {
            name: nv.name,
            host: nv.primary_host,
            aliases: Mutex::new(nv.aliases),
            features: nv.features,
            session: ArcSwapOption::new(nv.session.map(Arc::new)),
            perform_login: AtomicBool::new(false),
            tend_conn: Mutex::new(Some(nv.conn)),
            pools,
            async_pool,
            racks: ArcSwap::from_pointee(HashMap::new()),
            connection_iter: AtomicUsize::new(0),
            reference_count: AtomicU32::new(0),
            failures: AtomicU32::new(0),
            absent_ticks: AtomicU32::new(0),
            peers_generation: AtomicI64::new(-1),
            partition_generation: AtomicI64::new(-1),
            rebalance_generation: AtomicI64::new(-1),
            peers_count: AtomicUsize::new(0),
            partition_changed: AtomicBool::new(false),
            rebalance_changed: AtomicBool::new(false),
            active: AtomicBool::new(true),
            ctx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn aliases(&self) -> Vec<Host> {
        self.aliases.lock().clone()
    }

    pub(crate) fn add_alias(&self, host: Host) {
        let mut aliases = self.aliases.lock();
        if !aliases.contains(&host) {
            aliases.push(host);
        }
    }

    pub fn features(&self) -> u32 {
        self.features
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn has_batch_index(&self) -> bool {
        self.features & HAS_BATCH_INDEX != 0
    }

    pub fn has_peers(&self) -> bool {
        self.features & HAS_PEERS != 0
    }

    pub fn has_replicas(&self) -> bool {
        self.features & HAS_REPLICAS != 0
    }

    pub fn has_replicas_all(&self) -> bool {
        self.features & HAS_REPLICAS_ALL != 0
    }

    pub fn has_cluster_stable(&self) -> bool {
        self.features & HAS_CLUSTER_STABLE != 0
    }

    /// Use the batch index protocol unless the policy forces the legacy one
    pub fn use_batch_index(&self, use_batch_direct: bool) -> bool {
        !use_batch_direct && self.has_batch_index()
    }

    /// Rack the node belongs to for a namespace
    pub fn rack(&self, namespace: &str) -> Option<i32> {
        self.racks.load().get(namespace).copied()
    }

    pub fn has_rack(&self, namespace: &str, rack_id: i32) -> bool {
        self.rack(namespace) == Some(rack_id)
    }

    pub(crate) fn set_racks(&self, racks: HashMap<String, i32>) {
        self.racks.store(Arc::new(racks));
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    pub fn reference_count(&self) -> u32 {
        self.reference_count.load(Ordering::Acquire)
    }

    pub fn peers_count(&self) -> usize {
        self.peers_count.load(Ordering::Acquire)
    }

    pub fn partition_generation(&self) -> i64 {
        self.partition_generation.load(Ordering::Acquire)
    }

    pub fn peers_generation(&self) -> i64 {
        self.peers_generation.load(Ordering::Acquire)
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.load_full()
    }

    /// Request a full login on the next tend
    ///
    /// Only the first caller wakes the tend loop and gets `true` back.
    pub fn signal_login(&self) -> bool {
        let claimed = self
            .perform_login
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if claimed {
            self.ctx.wake_tend();
        }
        claimed
    }

    pub fn login_requested(&self) -> bool {
        self.perform_login.load(Ordering::Acquire)
    }

    /// Lease a synchronous connection
    ///
    /// Starts at a round-robin shard, probes lower shards, then higher ones.
    pub fn get_connection(self: &Arc<Self>, timeout: Option<Duration>) -> Result<PooledConnection> {
        let max = self.pools.len();
        let (initial, mut backward) = if max == 1 {
            (0, false)
        } else {
            (self.connection_iter.fetch_add(1, Ordering::Relaxed) % max, true)
        };
        let mut index = initial;

        loop {
            let pool = &self.pools[index];

            if let Some(mut conn) = pool.take() {
                if conn.is_valid() {
                    if let Err(e) = conn.set_timeout(timeout) {
                        self.close_connection(index, conn);
                        return Err(ClientError::Connection(format!("set timeout failed: {}", e)));
                    }
                    return Ok(PooledConnection::new(self.clone(), index, conn));
                }
                self.close_connection(index, conn);
                continue;
            }

            if pool.try_reserve() {
                let conn = match self.create_connection(timeout) {
                    Ok(conn) => conn,
                    Err(e) => {
                        pool.release();
                        self.ctx.metrics.record_connection_error();
                        return Err(e);
                    }
                };
                pool.record_opened();
                self.ctx.metrics.record_connection_opened();

                let mut lease = PooledConnection::new(self.clone(), index, conn);
                self.authenticate_connection(&mut *lease)?;
                return Ok(lease);
            }

            if backward {
                if index > 0 {
                    index -= 1;
                } else {
                    index = initial + 1;
                    if index >= max {
                        break;
                    }
                    backward = false;
                }
            } else {
                index += 1;
                if index >= max {
                    break;
                }
            }
        }

        Err(ClientError::NoMoreConnections {
            node: self.to_string(),
            max: self.ctx.policy.max_conns_per_node,
        })
    }

    fn create_connection(&self, timeout: Option<Duration>) -> Result<Box<dyn Connection>> {
        let mut conn = self
            .ctx
            .connectors
            .sync
            .connect(&self.host, self.ctx.policy.connection_timeout())?;
        if let Err(e) = conn.set_timeout(timeout) {
            conn.close();
            return Err(e);
        }
        Ok(conn)
    }

    fn authenticate_connection(&self, conn: &mut dyn Connection) -> Result<()> {
        let user = match self.ctx.policy.credentials() {
            Some((user, _)) => user,
            None => return Ok(()),
        };
        let session = match self.session() {
            Some(session) if !session.token.is_empty() => session,
            _ => return Ok(()),
        };
        if !self.ctx.connectors.authenticator.authenticate(conn, user, &session)? {
            self.signal_login();
            return Err(ClientError::Authentication(format!(
                "node {} rejected session token",
                self
            )));
        }
        Ok(())
    }

    /// Return a connection to its shard, closing it when the node is inactive
    pub(crate) fn put_connection(&self, pool_index: usize, conn: Box<dyn Connection>) {
        if !self.is_active() {
            self.close_connection(pool_index, conn);
            return;
        }
        if let Err(conn) = self.pools[pool_index].put(conn) {
            self.close_connection(pool_index, conn);
        }
    }

    /// Close a leased connection and free its slot
    pub(crate) fn close_connection(&self, pool_index: usize, mut conn: Box<dyn Connection>) {
        conn.close();
        let pool = &self.pools[pool_index];
        pool.release();
        pool.record_closed();
        self.ctx.metrics.record_connection_closed();
    }

    /// Lease an asynchronous connection
    pub async fn get_async_connection(self: &Arc<Self>) -> Result<AsyncPooledConnection> {
        while let Some(mut conn) = self.async_pool.take() {
            if conn.is_valid() {
                return Ok(AsyncPooledConnection::new(self.clone(), conn));
            }
            self.close_async_connection(conn);
        }

        if !self.async_pool.try_reserve() {
            return Err(ClientError::NoMoreConnections {
                node: self.to_string(),
                max: self.ctx.policy.async_max_conns_per_node,
            });
        }

        let connected = self
            .ctx
            .connectors
            .asynchronous
            .connect(&self.host, self.ctx.policy.connection_timeout())
            .await;
        let conn = match connected {
            Ok(conn) => conn,
            Err(e) => {
                self.async_pool.release();
                self.ctx.metrics.record_connection_error();
                return Err(e);
            }
        };
        self.async_pool.record_opened();
        self.ctx.metrics.record_connection_opened();

        let mut lease = AsyncPooledConnection::new(self.clone(), conn);
        if let (Some((user, _)), Some(session)) = (self.ctx.policy.credentials(), self.session()) {
            if !session.token.is_empty() {
                let accepted = self
                    .ctx
                    .connectors
                    .authenticator
                    .authenticate_async(&mut *lease, user, &session)
                    .await?;
                if !accepted {
                    self.signal_login();
                    return Err(ClientError::Authentication(format!(
                        "node {} rejected session token",
                        self
                    )));
                }
            }
        }
        Ok(lease)
    }

    pub(crate) fn put_async_connection(&self, conn: Box<dyn AsyncConnection>) {
        if !self.is_active() {
            self.close_async_connection(conn);
            return;
        }
        if let Err(conn) = self.async_pool.put(conn) {
            self.close_async_connection(conn);
        }
    }

    pub(crate) fn close_async_connection(&self, mut conn: Box<dyn AsyncConnection>) {
        conn.close();
        self.async_pool.release();
        self.async_pool.record_closed();
        self.ctx.metrics.record_connection_closed();
    }

    /// Close pooled connections idle for longer than the configured limit
    pub fn close_idle_connections(&self) {
        let max_idle = match self.ctx.policy.max_socket_idle() {
            Some(max_idle) => max_idle,
            None => return,
        };
        for pool in &self.pools {
            let trimmed = pool.trim_idle(max_idle, |mut conn| conn.close());
            self.record_trimmed(pool, trimmed);
        }
        let trimmed = self.async_pool.trim_idle(max_idle, |mut conn| conn.close());
        self.record_trimmed(&self.async_pool, trimmed);
    }

    fn record_trimmed<C>(&self, pool: &ConnectionPool<C>, trimmed: usize) {
        for _ in 0..trimmed {
            pool.record_closed();
            self.ctx.metrics.record_connection_closed();
        }
    }

    /// Deactivate the node and close every connection it owns
    pub fn close(&self) {
        self.active.store(false, Ordering::Release);

        if let Some(mut conn) = self.tend_conn.lock().take() {
            conn.close();
        }
        for pool in &self.pools {
            for mut conn in pool.drain() {
                conn.close();
                pool.record_closed();
                self.ctx.metrics.record_connection_closed();
            }
        }
        for mut conn in self.async_pool.drain() {
            conn.close();
            self.async_pool.record_closed();
            self.ctx.metrics.record_connection_closed();
        }
    }

    /// Combined statistics of the synchronous shards
    pub fn connection_stats(&self) -> ConnectionStats {
        self.pools
            .iter()
            .map(|pool| pool.stats())
            .fold(ConnectionStats::default(), |sum, stats| sum + stats)
    }

    pub fn async_connection_stats(&self) -> ConnectionStats {
        self.async_pool.stats()
    }

    pub fn stats(&self) -> NodeStats {
        NodeStats {
            name: self.name.clone(),
            host: self.host.to_string(),
            active: self.is_active(),
            sync: self.connection_stats(),
            asynchronous: self.async_connection_stats(),
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.host)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("active", &self.is_active())
            .finish()
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Node {}
