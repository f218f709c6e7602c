//! Non-blocking command execution
//!
//! Each attempt takes ownership of the command and hands it back with its
//! outcome, so every exit path still holds the command for `on_failure`.
//! The attempt races its I/O against an [`AttemptTimer`] settled by the
//! timeout queue thread; losing the race drops the leased connection, which
//! closes it. Retry delays are scheduled sleeps, never blocking.

use super::batch::BatchRequest;
use super::buffer::CommandBuffer;
use super::retry::{Failure, RetryState};
use super::timeout_queue::AttemptTimer;
use super::{Command, Parsed};
use crate::cluster::Cluster;
use crate::config::BatchPolicy;
use crate::error::{ClientError, Result};
use crate::log::log_command_retry;
use crate::node::Node;
use futures::future::{join_all, BoxFuture};
use std::sync::Arc;

/// Execute `command`, returning it once it completed successfully
pub async fn execute<C: Command + 'static>(cluster: Arc<Cluster>, command: C) -> Result<C> {
    let state = RetryState::new(command.policy(), command.is_read());
    run(cluster, command, state).await
}

/// Outcome of one attempt
struct Attempt<C> {
    command: C,
    buf: CommandBuffer,
    sent: bool,
    result: Result<()>,
}

fn run<C: Command + 'static>(cluster: Arc<Cluster>, mut command: C, mut state: RetryState) -> BoxFuture<'static, Result<C>> {
    Box::pin(async move {
        let policy = command.policy().clone();
        let mut buf = CommandBuffer::new();
        let mut last_node: Option<Arc<Node>> = None;
        let mut last_error: Option<ClientError> = None;

        loop {
            let node = match command.node(&cluster, state.sequence) {
                Ok(node) => node,
                Err(e) => {
                    command.on_failure();
                    return Err(state.fail(e, last_node.as_deref()));
                }
            };

            let timer = match state.attempt_timeout() {
                Some(timeout) => {
                    let timer = AttemptTimer::new(timeout);
                    if let Err(e) = cluster.timeout_queue().add(timer.clone(), timeout) {
                        command.on_failure();
                        return Err(state.fail(e, Some(&node)));
                    }
                    Some(timer)
                }
                None => None,
            };
            let patch = if state.total_timeout_changed(&policy) {
                Some(state.total_timeout_ms())
            } else {
                None
            };

            let finished = attempt(node.clone(), command, buf, patch, timer, state.clone()).await;
            command = finished.command;
            buf = finished.buf;
            if finished.sent {
                state.record_sent();
            }

            let error = match finished.result {
                Ok(()) => return Ok(command),
                Err(e) => e,
            };

            let failure = Failure::classify(&error);
            if failure == Failure::Fatal {
                command.on_failure();
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
                tokio::time::sleep(sleep).await;
            }

            if command.should_retry_batch() {
                let children = match command.retry_batch(&cluster, state.sequence) {
                    Ok(children) => children,
                    Err(e) => {
                        command.on_failure();
                        return Err(state.fail(e, last_node.as_deref()));
                    }
                };
                if let Some(children) = children {
                    let runs = children
                        .into_iter()
                        .map(|child| run(cluster.clone(), child, state.clone()));
                    for result in join_all(runs).await {
                        result?;
                    }
                    return Ok(command);
                }
            }
        }

        command.on_failure();
        Err(state.exhausted(last_error, last_node.as_deref()))
    })
}

/// One attempt, raced against its timer
async fn attempt<C: Command>(
    node: Arc<Node>,
    mut command: C,
    mut buf: CommandBuffer,
    patch: Option<u64>,
    timer: Option<Arc<AttemptTimer>>,
    state: RetryState,
) -> Attempt<C> {
    let mut sent = false;
    let result = {
        let io = send_and_receive(&node, &mut command, &mut buf, patch, &mut sent);
        match &timer {
            Some(timer) => {
                tokio::select! {
                    result = io => result,
                    _ = timer.expired() => Err(state.timeout_error(true)),
                }
            }
            None => io.await,
        }
    };
    if let Some(timer) = &timer {
        timer.complete();
    }
    Attempt {
        command,
        buf,
        sent,
        result,
    }
}

async fn send_and_receive<C: Command>(
    node: &Arc<Node>,
    command: &mut C,
    buf: &mut CommandBuffer,
    patch: Option<u64>,
    sent: &mut bool,
) -> Result<()> {
    let mut conn = node.get_async_connection().await?;

    command.write_buffer(buf)?;
    if let Some(timeout_ms) = patch {
        buf.patch_total_timeout(timeout_ms);
    }
    conn.write_all(buf.as_bytes()).await?;
    *sent = true;
    command.prepare_attempt();

    loop {
        let message = conn.read_message().await?;
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

/// Run every node command of a batch concurrently
pub async fn execute_batch(cluster: Arc<Cluster>, policy: BatchPolicy, request: Arc<BatchRequest>) -> Result<()> {
    let commands = request.plan(&cluster, &policy)?;
    let runs = commands
        .into_iter()
        .map(|command| execute(cluster.clone(), command));
    let mut first_error = None;
    for result in join_all(runs).await {
        if let Err(e) = result {
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
