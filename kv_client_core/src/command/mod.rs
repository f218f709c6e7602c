//! Command execution
//!
//! A [`Command`] knows how to route itself, encode its request and decode
//! its response. The executors in [`sync_exec`] and [`async_exec`] drive it
//! through routing, connecting, sending and receiving, retrying with the
//! policy's budget.

pub mod async_exec;
pub mod batch;
pub mod buffer;
pub mod listener;
pub mod parse;
pub mod retry;
pub mod single;
pub mod sync_exec;
pub mod timeout_queue;

pub use batch::{BatchCommand, BatchNamespace, BatchNode, BatchRequest, BatchSink};
pub use buffer::CommandBuffer;
pub use retry::{Failure, RetryState};
pub use single::{DeleteCommand, ExistsCommand, ReadCommand, WriteCommand};

use crate::cluster::partition::partition_id;
use crate::cluster::{Cluster, Route};
use crate::config::Policy;
use crate::error::Result;
use crate::key::Key;
use crate::net::ProtoMessage;
use crate::node::Node;
use std::sync::Arc;

/// Progress after one response message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parsed {
    /// More messages follow on the same connection
    More,
    Done,
}

/// One request kind run by the executors
pub trait Command: Send {
    fn name(&self) -> &'static str;

    fn policy(&self) -> &Policy;

    fn is_read(&self) -> bool {
        true
    }

    /// Target node for the attempt using `sequence` for replica rotation
    fn node(&self, cluster: &Cluster, sequence: usize) -> Result<Arc<Node>>;

    fn write_buffer(&mut self, buf: &mut CommandBuffer) -> Result<()>;

    /// Called before each attempt reads its response
    fn prepare_attempt(&mut self) {}

    fn parse_message(&mut self, message: &ProtoMessage) -> Result<Parsed>;

    /// Response spans several messages
    fn is_stream(&self) -> bool {
        false
    }

    fn should_retry_batch(&self) -> bool {
        false
    }

    /// Split the remaining work against the current partition map
    ///
    /// `None` means the work still maps to this command's node and the
    /// command is retried as is.
    fn retry_batch(&mut self, _cluster: &Cluster, _sequence: usize) -> Result<Option<Vec<Box<dyn Command>>>> {
        Ok(None)
    }

    /// Terminal failure of this command
    fn on_failure(&mut self) {}
}

impl<C: Command + ?Sized> Command for Box<C> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn policy(&self) -> &Policy {
        (**self).policy()
    }

    fn is_read(&self) -> bool {
        (**self).is_read()
    }

    fn node(&self, cluster: &Cluster, sequence: usize) -> Result<Arc<Node>> {
        (**self).node(cluster, sequence)
    }

    fn write_buffer(&mut self, buf: &mut CommandBuffer) -> Result<()> {
        (**self).write_buffer(buf)
    }

    fn prepare_attempt(&mut self) {
        (**self).prepare_attempt()
    }

    fn parse_message(&mut self, message: &ProtoMessage) -> Result<Parsed> {
        (**self).parse_message(message)
    }

    fn is_stream(&self) -> bool {
        (**self).is_stream()
    }

    fn should_retry_batch(&self) -> bool {
        (**self).should_retry_batch()
    }

    fn retry_batch(&mut self, cluster: &Cluster, sequence: usize) -> Result<Option<Vec<Box<dyn Command>>>> {
        (**self).retry_batch(cluster, sequence)
    }

    fn on_failure(&mut self) {
        (**self).on_failure()
    }
}

/// Resolve the node owning `key` in the current partition map
pub fn key_node(cluster: &Cluster, key: &Key, policy: &Policy, sequence: usize, is_write: bool) -> Result<Arc<Node>> {
    let route = Route {
        replica: policy.replica,
        sequence,
        rack_id: cluster.policy().rack_id,
        is_write,
    };
    cluster
        .partition_map()
        .node_for(&key.namespace, partition_id(&key.digest), &route)
}
