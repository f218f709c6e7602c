pub mod auth;
pub mod client;
pub mod cluster;
pub mod command;
pub mod config;
pub mod error;
pub mod info;
pub mod key;
pub mod log;
pub mod metrics;
pub mod net;
pub mod node;
pub mod record;
pub mod result_code;
pub mod stats;
pub mod task;

pub use client::Client;
pub use cluster::{Cluster, Connectors};
pub use command::listener::{
    BatchListListener, DeleteListener, ExistsArrayListener, ExistsListener, RecordArrayListener,
    RecordListener, RecordSequenceListener, WriteListener,
};
pub use config::{BatchPolicy, ClientConfig, ClusterPolicy, LoggingConfig, Policy, Replica, WritePolicy};
pub use error::{ClientError, Result};
pub use key::{Key, UserKey};
pub use node::Node;
pub use record::{BatchRead, Bin, Particle, Record};
pub use stats::{ClusterStats, ConnectionStats, NodeStats};
pub use task::{InfoTask, ServerTask};
