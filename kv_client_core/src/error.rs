//! Error types for the client runtime
//!
//! Every error surfaced from a command is wrapped in [`ClientError::Command`]
//! so callers can inspect the node, the attempt count and whether a write
//! may have been applied.

use crate::result_code;
use std::io;
use thiserror::Error;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors produced by the client runtime
#[derive(Debug, Error)]
pub enum ClientError {
    /// Connection could not be created, authenticated or used
    #[error("connection error: {0}")]
    Connection(String),

    /// Every pool shard of a node is at capacity
    #[error("node {node} max connections {max} would be exceeded")]
    NoMoreConnections { node: String, max: usize },

    /// Deadline exceeded, on the client or reported by the server
    #[error("timeout: client={client} socket={socket_timeout_ms}ms total={total_timeout_ms}ms")]
    Timeout {
        client: bool,
        socket_timeout_ms: u64,
        total_timeout_ms: u64,
    },

    /// Non-zero result code returned by the server
    #[error("server error {result_code}: {message}")]
    Server { result_code: i32, message: String },

    /// Malformed or unexpected response
    #[error("parse error: {0}")]
    Parse(String),

    /// No active node could be resolved for a request
    #[error("invalid node: {0}")]
    InvalidNode(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Cluster or client has been closed
    #[error("cluster is closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Terminal command failure with attempt context
    #[error("{source} (node={}, iteration={iteration}, in_doubt={in_doubt})", .node.as_deref().unwrap_or("none"))]
    Command {
        source: Box<ClientError>,
        node: Option<String>,
        iteration: u32,
        in_doubt: bool,
    },
}

impl ClientError {
    /// Build a server error from a result code
    pub fn server(result_code: i32) -> Self {
        ClientError::Server {
            result_code,
            message: result_code::describe(result_code).to_string(),
        }
    }

    /// Attach command context, replacing any context already present
    pub fn with_context(self, node: Option<String>, iteration: u32, in_doubt: bool) -> Self {
        let source = match self {
            ClientError::Command { source, .. } => source,
            other => Box::new(other),
        };
        ClientError::Command {
            source,
            node,
            iteration,
            in_doubt,
        }
    }

    /// Innermost error, skipping command context
    pub fn root(&self) -> &ClientError {
        match self {
            ClientError::Command { source, .. } => source.root(),
            other => other,
        }
    }

    /// Result code equivalent of this error
    pub fn result_code(&self) -> i32 {
        match self.root() {
            ClientError::Server { result_code, .. } => *result_code,
            ClientError::Timeout { .. } => result_code::TIMEOUT,
            ClientError::NoMoreConnections { .. } => result_code::NO_MORE_CONNECTIONS,
            ClientError::Connection(_) | ClientError::Io(_) => result_code::SERVER_NOT_AVAILABLE,
            ClientError::Parse(_) => result_code::PARSE_ERROR,
            ClientError::InvalidNode(_) => result_code::INVALID_NODE_ERROR,
            ClientError::InvalidArgument(_) => result_code::PARAMETER_ERROR,
            ClientError::Authentication(_) => result_code::NOT_AUTHENTICATED,
            _ => result_code::CLIENT_ERROR,
        }
    }

    pub fn in_doubt(&self) -> bool {
        matches!(self, ClientError::Command { in_doubt: true, .. })
    }

    pub fn iteration(&self) -> Option<u32> {
        match self {
            ClientError::Command { iteration, .. } => Some(*iteration),
            _ => None,
        }
    }

    pub fn node(&self) -> Option<&str> {
        match self {
            ClientError::Command { node, .. } => node.as_deref(),
            _ => None,
        }
    }

    /// Socket read/write deadline elapsed or the client deadline fired
    pub fn is_client_timeout(&self) -> bool {
        match self.root() {
            ClientError::Timeout { client, .. } => *client,
            ClientError::Io(e) => matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock),
            _ => false,
        }
    }

    /// Server reported a transaction timeout
    pub fn is_server_timeout(&self) -> bool {
        match self.root() {
            ClientError::Server { result_code, .. } => *result_code == result_code::TIMEOUT,
            ClientError::Timeout { client, .. } => !*client,
            _ => false,
        }
    }

    /// Connection level failure that warrants trying again
    pub fn is_network(&self) -> bool {
        matches!(
            self.root(),
            ClientError::Connection(_)
                | ClientError::NoMoreConnections { .. }
                | ClientError::Io(_)
                | ClientError::Authentication(_)
        )
    }

    /// The stream is still in sync after this error
    pub fn keeps_connection(&self) -> bool {
        match self.root() {
            ClientError::Server { result_code, .. } => *result_code != result_code::TIMEOUT,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_wrapping_is_flat() {
        let err = ClientError::server(result_code::GENERATION_ERROR)
            .with_context(Some("A1".to_string()), 1, false)
            .with_context(Some("B2".to_string()), 3, true);

        assert_eq!(err.node(), Some("B2"));
        assert_eq!(err.iteration(), Some(3));
        assert!(err.in_doubt());
        assert_eq!(err.result_code(), result_code::GENERATION_ERROR);
        assert!(matches!(err.root(), ClientError::Server { .. }));
    }

    #[test]
    fn test_timeout_classification() {
        let io_timeout = ClientError::Io(io::Error::new(io::ErrorKind::TimedOut, "read"));
        assert!(io_timeout.is_client_timeout());
        assert!(!io_timeout.is_server_timeout());

        let server_timeout = ClientError::server(result_code::TIMEOUT);
        assert!(server_timeout.is_server_timeout());
        assert!(!server_timeout.keeps_connection());

        let key_exists = ClientError::server(result_code::KEY_EXISTS_ERROR);
        assert!(key_exists.keeps_connection());
        assert!(!key_exists.is_network());
    }

    #[test]
    fn test_display_includes_context() {
        let err = ClientError::Parse("bad header".to_string()).with_context(None, 2, false);
        let text = err.to_string();
        assert!(text.contains("bad header"));
        assert!(text.contains("node=none"));
        assert!(text.contains("iteration=2"));
    }
}
