//! Leased connections
//!
//! A lease returns its connection to the owning pool through [`put_back`],
//! and closes it when dropped without being put back, so that a failed
//! command can never leave a half-read socket in the pool.
//!
//! [`put_back`]: PooledConnection::put_back

use super::Node;
use crate::error::{ClientError, Result};
use crate::net::proto::ProtoMessage;
use crate::net::{AsyncConnection, Connection};
use async_trait::async_trait;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

/// Stand-in left behind once a lease gave up its connection
struct Detached;

impl Connection for Detached {
    fn write_all(&mut self, _buf: &[u8]) -> Result<()> {
        Err(ClientError::Closed)
    }

    fn read_exact(&mut self, _buf: &mut [u8]) -> Result<()> {
        Err(ClientError::Closed)
    }

    fn set_timeout(&mut self, _timeout: Option<Duration>) -> Result<()> {
        Err(ClientError::Closed)
    }

    fn is_valid(&mut self) -> bool {
        false
    }

    fn is_closed(&self) -> bool {
        true
    }

    fn close(&mut self) {}
}

#[async_trait]
impl AsyncConnection for Detached {
    async fn write_all(&mut self, _buf: &[u8]) -> Result<()> {
        Err(ClientError::Closed)
    }

    async fn read_message(&mut self) -> Result<ProtoMessage> {
        Err(ClientError::Closed)
    }

    fn is_valid(&mut self) -> bool {
        false
    }

    fn is_closed(&self) -> bool {
        true
    }

    fn close(&mut self) {}
}

/// Synchronous connection leased from a node pool shard
pub struct PooledConnection {
    node: Arc<Node>,
    pool_index: usize,
    conn: Box<dyn Connection>,
    released: bool,
}

impl PooledConnection {
    pub(crate) fn new(node: Arc<Node>, pool_index: usize, conn: Box<dyn Connection>) -> Self {
        Self {
            node,
            pool_index,
            conn,
            released: false,
        }
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    fn detach(&mut self) -> Box<dyn Connection> {
        self.released = true;
        mem::replace(&mut self.conn, Box::new(Detached))
    }

    /// Return the connection to its shard
    pub fn put_back(mut self) {
        let conn = self.detach();
        self.node.put_connection(self.pool_index, conn);
    }

    /// Close the connection and free its pool slot
    pub fn close(mut self) {
        let conn = self.detach();
        self.node.close_connection(self.pool_index, conn);
    }
}

impl Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref()
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if !self.released {
            let conn = self.detach();
            self.node.close_connection(self.pool_index, conn);
        }
    }
}

/// Asynchronous connection leased from the node async pool
pub struct AsyncPooledConnection {
    node: Arc<Node>,
    conn: Box<dyn AsyncConnection>,
    released: bool,
}

impl AsyncPooledConnection {
    pub(crate) fn new(node: Arc<Node>, conn: Box<dyn AsyncConnection>) -> Self {
        Self {
            node,
            conn,
            released: false,
        }
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    fn detach(&mut self) -> Box<dyn AsyncConnection> {
        self.released = true;
        mem::replace(&mut self.conn, Box::new(Detached))
    }

    pub fn put_back(mut self) {
        let conn = self.detach();
        self.node.put_async_connection(conn);
    }

    pub fn close(mut self) {
        let conn = self.detach();
        self.node.close_async_connection(conn);
    }
}

impl Deref for AsyncPooledConnection {
    type Target = dyn AsyncConnection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref()
    }
}

impl DerefMut for AsyncPooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut()
    }
}

impl Drop for AsyncPooledConnection {
    fn drop(&mut self) {
        if !self.released {
            let conn = self.detach();
            self.node.close_async_connection(conn);
        }
    }
}
