//! Attempt bookkeeping shared by the sync and async executors

use crate::config::Policy;
use crate::error::ClientError;
use crate::node::Node;
use std::time::{Duration, Instant};

/// How a failed attempt is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Server reported a transaction timeout
    ServerTimeout,
    /// Socket deadline or attempt timer elapsed
    ClientTimeout,
    /// Connection could not be leased, authenticated or used
    Network,
    /// Not retried
    Fatal,
}

impl Failure {
    pub fn classify(error: &ClientError) -> Failure {
        if error.is_server_timeout() {
            Failure::ServerTimeout
        } else if error.is_client_timeout() {
            Failure::ClientTimeout
        } else if error.is_network() {
            Failure::Network
        } else {
            Failure::Fatal
        }
    }

    /// Label used for retry metrics
    pub fn reason(self) -> &'static str {
        match self {
            Failure::ServerTimeout => "server_timeout",
            Failure::ClientTimeout => "client_timeout",
            Failure::Network => "network",
            Failure::Fatal => "fatal",
        }
    }
}

/// Attempt descriptor of one command
///
/// Cloned into batch retry children so they continue with the parent's
/// iteration, sequence and remaining deadline.
#[derive(Debug, Clone)]
pub struct RetryState {
    pub iteration: u32,
    pub sequence: usize,
    pub commands_sent: u32,
    pub socket_timeout: Duration,
    pub total_timeout: Duration,
    pub deadline: Option<Instant>,
    pub is_read: bool,
    client_timeout: bool,
    server_timeout: bool,
    /// Retries stopped because the total deadline passed
    deadline_reached: bool,
}

impl RetryState {
    pub fn new(policy: &Policy, is_read: bool) -> Self {
        let mut socket_timeout = policy.socket_timeout();
        let total_timeout = policy.total_timeout();
        let mut deadline = None;

        if !total_timeout.is_zero() {
            deadline = Some(Instant::now() + total_timeout);
            if socket_timeout.is_zero() || socket_timeout > total_timeout {
                socket_timeout = total_timeout;
            }
        }

        Self {
            iteration: 1,
            sequence: 0,
            commands_sent: 0,
            socket_timeout,
            total_timeout,
            deadline,
            is_read,
            client_timeout: false,
            server_timeout: false,
            deadline_reached: false,
        }
    }

    /// Read and write timeout for the next attempt
    pub fn attempt_timeout(&self) -> Option<Duration> {
        if self.socket_timeout.is_zero() {
            None
        } else {
            Some(self.socket_timeout)
        }
    }

    /// The request buffer still carries the policy total timeout
    pub fn total_timeout_changed(&self, policy: &Policy) -> bool {
        !self.total_timeout.is_zero() && self.total_timeout != policy.total_timeout()
    }

    pub fn total_timeout_ms(&self) -> u64 {
        self.total_timeout.as_millis() as u64
    }

    pub fn record_sent(&mut self) {
        self.commands_sent += 1;
    }

    /// Update replica rotation after a retryable failure
    pub fn record_failure(&mut self, failure: Failure) {
        match failure {
            Failure::ServerTimeout => {
                self.client_timeout = false;
                self.server_timeout = true;
                self.shift_sequence_on_read();
            }
            Failure::ClientTimeout => {
                self.client_timeout = true;
                self.server_timeout = false;
                self.shift_sequence_on_read();
            }
            Failure::Network => {
                self.client_timeout = false;
                self.server_timeout = false;
                self.sequence += 1;
            }
            Failure::Fatal => {}
        }
    }

    fn shift_sequence_on_read(&mut self) {
        if self.is_read {
            self.sequence += 1;
        }
    }

    /// Decide whether another attempt fits the budget
    ///
    /// Returns the delay to wait before the next attempt, or `None` when
    /// retries or the total deadline are exhausted. Shrinks the total and
    /// socket timeouts to what remains of the deadline.
    pub fn prepare_retry(&mut self, policy: &Policy) -> Option<Duration> {
        if self.iteration > policy.max_retries {
            return None;
        }

        let sleep = policy.sleep_between_retries();
        if let Some(deadline) = self.deadline {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .and_then(|left| left.checked_sub(sleep))
                .filter(|left| !left.is_zero());
            let remaining = match remaining {
                Some(remaining) => remaining,
                None => {
                    self.deadline_reached = true;
                    return None;
                }
            };
            if remaining < self.total_timeout {
                self.total_timeout = remaining;
                if self.socket_timeout > remaining {
                    self.socket_timeout = remaining;
                }
            }
        }

        self.iteration += 1;
        if self.client_timeout {
            Some(Duration::ZERO)
        } else {
            Some(sleep)
        }
    }

    /// A write may have reached the server
    pub fn in_doubt(&self) -> bool {
        !self.is_read && self.commands_sent > 0
    }

    /// Attach attempt context to a terminal error
    pub fn fail(&self, error: ClientError, node: Option<&Node>) -> ClientError {
        error.with_context(node.map(|n| n.to_string()), self.iteration, self.in_doubt())
    }

    pub fn timeout_error(&self, client: bool) -> ClientError {
        ClientError::Timeout {
            client,
            socket_timeout_ms: self.socket_timeout.as_millis() as u64,
            total_timeout_ms: self.total_timeout.as_millis() as u64,
        }
    }

    /// Terminal error once the retry budget is spent
    ///
    /// A passed total deadline always yields a client timeout.
    pub fn exhausted(&self, last: Option<ClientError>, node: Option<&Node>) -> ClientError {
        let error = if self.client_timeout || self.deadline_reached {
            self.timeout_error(true)
        } else if self.server_timeout {
            self.timeout_error(false)
        } else {
            last.unwrap_or_else(|| self.timeout_error(true))
        };
        self.fail(error, node)
    }
}
