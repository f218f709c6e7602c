//! Polling of long-running server side tasks

use crate::cluster::Cluster;
use crate::error::{ClientError, Result};
use crate::info;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::debug;

/// Default interval between status polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Task running on the server that the client can wait for
pub trait ServerTask {
    /// Query the cluster once
    fn is_done(&self) -> Result<bool>;

    /// Done flag cached from earlier polls
    fn done_flag(&self) -> &AtomicBool;

    /// Block until the task completes, polling once per second
    fn wait(&self) -> Result<()> {
        self.wait_with_interval(DEFAULT_POLL_INTERVAL)
    }

    /// Block until the task completes, sleeping `interval` before each poll
    fn wait_with_interval(&self, interval: Duration) -> Result<()> {
        while !self.done_flag().load(Ordering::Acquire) {
            thread::sleep(interval);
            if self.is_done()? {
                self.done_flag().store(true, Ordering::Release);
            }
        }
        Ok(())
    }
}

type Predicate = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// Task complete once an info command satisfies a predicate on every node
pub struct InfoTask {
    cluster: Arc<Cluster>,
    command: String,
    predicate: Predicate,
    done: AtomicBool,
}

impl InfoTask {
    pub fn new(
        cluster: Arc<Cluster>,
        command: impl Into<String>,
        predicate: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            cluster,
            command: command.into(),
            predicate: Box::new(predicate),
            done: AtomicBool::new(false),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

impl ServerTask for InfoTask {
    fn is_done(&self) -> Result<bool> {
        let nodes = self.cluster.nodes();
        if nodes.is_empty() {
            return Err(ClientError::InvalidNode("cluster is empty".to_string()));
        }

        let timeout = Some(self.cluster.policy().connection_timeout());
        for node in nodes {
            let mut conn = node.get_connection(timeout)?;
            let value = info::request_value(&mut *conn, &self.command)?;
            conn.put_back();
            if !(self.predicate)(&value) {
                debug!(node = %node, command = %self.command, value = %value, "Task in progress");
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn done_flag(&self) -> &AtomicBool {
        &self.done
    }
}
