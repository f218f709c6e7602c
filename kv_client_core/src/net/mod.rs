//! Transport layer: host addresses, proto framing and connections

pub mod connection;
pub mod host;
pub mod proto;

pub use connection::{
    AsyncConnection, AsyncConnector, Connection, Connector, TcpConnection, TcpConnector,
    TokioConnection, TokioConnector,
};
pub use host::Host;
pub use proto::{ProtoCodec, ProtoHeader, ProtoMessage};
