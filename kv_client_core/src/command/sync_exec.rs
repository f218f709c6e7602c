//! Blocking command execution
//!
//! Runs a command on the calling thread: route, lease a connection, send,
//! read until the command reports completion, and retry retryable failures
//! until the retry budget or total deadline is spent.

use super::batch::{BatchCommand, BatchRequest};
use super::buffer::CommandBuffer;
use super::retry::{Failure, RetryState};
use super::{Command, Parsed};
use crate::cluster::Cluster;
use crate::config::BatchPolicy;
use crate::error::{ClientError, Result};
use crate::log::log_command_retry;
use crate::node::Node;
use crossbeam_channel::unbounded;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;

/// Execute `command` with a fresh retry budget
pub fn execute(cluster: &Cluster, command: &mut dyn Command) -> Result<()> {
    let state = RetryState::new(command.policy(), command.is_read());
    let result = execute_with(cluster, command, state);
    if result.is_err() {
        command.on_failure();
    }
    result
}

/// Execute `command` continuing from an existing attempt descriptor
pub(crate) fn execute_with(cluster: &Cluster, command: &mut dyn Command, mut state: RetryState) -> Result<()> {
    let policy = command.policy().clone();
    let mut buf = CommandBuffer::new();
    let mut last_node: Option<Arc<Node>> = None;
    let mut last_error: Option<ClientError> = None;

    loop {
        let node = command
            .node(cluster, state.sequence)
            .map_err(|e| state.fail(e, last_node.as_deref()))?;

        let error = match attempt(command, &node, &mut state, &mut buf, &policy) {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        let failure = Failure::classify(&error);
        if failure == Failure::Fatal {
            return Err(state.fail(error, Some(&node)));
        }
        state.record_failure(failure);
        cluster.metrics().record_retry(failure.reason());
        log_command_retry(command.name(), node.name(), state.iteration, &error);
        last_error = Some(error);
        last_node = Some(node);

        let sleep = match state.prepare_retry(&policy) {
            Some(sleep) => sleep,
            None => break,
        };
        if !sleep.is_zero() {
            thread::sleep(sleep);
        }

        if command.should_retry_batch() {
            let children = command
                .retry_batch(cluster, state.sequence)
                .map_err(|e| state.fail(e, last_node.as_deref()))?;
            if let Some(children) = children {
                for mut child in children {
                    execute_with(cluster, &mut child, state.clone())?;
                }
                return Ok(());
            }
        }
    }

    Err(state.exhausted(last_error, last_node.as_deref()))
}

/// One attempt on `node`
///
/// The leased connection goes back to the pool on success and on server
/// errors that leave the stream in sync, and is closed otherwise.
fn attempt(
    command: &mut dyn Command,
    node: &Arc<Node>,
    state: &mut RetryState,
    buf: &mut CommandBuffer,
    policy: &crate::config::Policy,
) -> Result<()> {
    let mut conn = node.get_connection(state.attempt_timeout())?;

    command.write_buffer(buf)?;
    if state.total_timeout_changed(policy) {
        buf.patch_total_timeout(state.total_timeout_ms());
    }
    conn.write_all(buf.as_bytes())?;
    state.record_sent();
    command.prepare_attempt();

    loop {
        let message = conn.read_message()?;
        match command.parse_message(&message) {
            Ok(Parsed::More) => {}
            Ok(Parsed::Done) => break,
            Err(e) => {
                if e.keeps_connection() && !command.is_stream() {
                    conn.put_back();
                } else {
                    conn.close();
                }
                return Err(e);
            }
        }
    }
    conn.put_back();
    Ok(())
}

/// Run every node command of a batch
///
/// With `max_concurrent_threads == 1` node commands run one after another on
/// the calling thread. Otherwise a scoped worker pool pulls commands from a
/// channel, all of them at once when the limit is 0. The first failure stops
/// workers from starting further commands.
pub fn execute_batch(cluster: &Cluster, policy: &BatchPolicy, request: &Arc<BatchRequest>) -> Result<()> {
    let commands = request.plan(cluster, policy)?;
    if commands.is_empty() {
        return Ok(());
    }

    if policy.max_concurrent_threads == 1 || commands.len() == 1 {
        for mut command in commands {
            execute(cluster, &mut command)?;
        }
        return Ok(());
    }

    let workers = match policy.max_concurrent_threads {
        0 => commands.len(),
        max => max.min(commands.len()),
    };
    let (tx, rx) = unbounded::<BatchCommand>();
    for command in commands {
        // Receiver is alive until the scope below ends.
        let _ = tx.send(command);
    }
    drop(tx);

    let first_error: Mutex<Option<ClientError>> = Mutex::new(None);
    thread::scope(|scope| {
        for _ in 0..workers {
            let rx = rx.clone();
            let first_error = &first_error;
            scope.spawn(move || {
                for mut command in rx.iter() {
                    if request.is_done() {
                        break;
                    }
                    if let Err(e) = execute(cluster, &mut command) {
                        first_error.lock().get_or_insert(e);
                    }
                }
            });
        }
    });

    match first_error.into_inner() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
