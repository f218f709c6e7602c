//! Connection abstractions
//!
//! Synchronous commands and the tend loop use [`Connection`], asynchronous
//! commands use [`AsyncConnection`]. Connectors create them so that TLS or
//! in-memory transports can be plugged in without touching the pools.

use crate::error::{ClientError, Result};
use crate::net::proto::{ProtoCodec, ProtoHeader, ProtoMessage, HEADER_SIZE};
use crate::net::Host;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tokio_util::codec::Framed;

/// Blocking connection to one server node
pub trait Connection: Send {
    fn write_all(&mut self, buf: &[u8]) -> Result<()>;

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Read and write timeout, `None` blocks indefinitely
    fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<()>;

    /// Connection is open and has no unread bytes pending
    fn is_valid(&mut self) -> bool;

    fn is_closed(&self) -> bool;

    fn close(&mut self);

    /// Read one framed message
    fn read_message(&mut self) -> Result<ProtoMessage> {
        let mut word = [0u8; HEADER_SIZE];
        self.read_exact(&mut word)?;
        let header = ProtoHeader::from_bytes(&word)?;
        let mut body = vec![0u8; header.size];
        self.read_exact(&mut body)?;
        Ok(ProtoMessage {
            header,
            body: Bytes::from(body),
        })
    }
}

/// Creates blocking connections
pub trait Connector: Send + Sync {
    fn connect(&self, host: &Host, timeout: Duration) -> Result<Box<dyn Connection>>;
}

/// Non-blocking connection to one server node
#[async_trait]
pub trait AsyncConnection: Send {
    async fn write_all(&mut self, buf: &[u8]) -> Result<()>;

    async fn read_message(&mut self) -> Result<ProtoMessage>;

    fn is_valid(&mut self) -> bool;

    fn is_closed(&self) -> bool;

    fn close(&mut self);
}

/// Creates non-blocking connections
#[async_trait]
pub trait AsyncConnector: Send + Sync {
    async fn connect(&self, host: &Host, timeout: Duration) -> Result<Box<dyn AsyncConnection>>;
}

/// Plain TCP connection backed by `std::net`
pub struct TcpConnection {
    stream: Option<TcpStream>,
}

impl TcpConnection {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream: Some(stream),
        }
    }

    fn stream(&mut self) -> Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| ClientError::Connection("connection is closed".to_string()))
    }
}

impl Connection for TcpConnection {
    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.stream()?.write_all(buf)?;
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.stream()?.read_exact(buf)?;
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        let timeout = timeout.filter(|t| !t.is_zero());
        let stream = self.stream()?;
        stream.set_read_timeout(timeout)?;
        stream.set_write_timeout(timeout)?;
        Ok(())
    }

    fn is_valid(&mut self) -> bool {
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return false,
        };
        if stream.set_nonblocking(true).is_err() {
            return false;
        }
        let mut probe = [0u8; 1];
        let valid = match stream.peek(&mut probe) {
            // Closed by peer or stray bytes from an earlier response.
            Ok(_) => false,
            Err(e) => e.kind() == io::ErrorKind::WouldBlock,
        };
        stream.set_nonblocking(false).is_ok() && valid
    }

    fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// Connector for plain TCP
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(&self, host: &Host, timeout: Duration) -> Result<Box<dyn Connection>> {
        let addrs = host.address().to_socket_addrs()?;
        let mut last_error = None;

        for addr in addrs {
            let attempt = if timeout.is_zero() {
                TcpStream::connect(addr)
            } else {
                TcpStream::connect_timeout(&addr, timeout)
            };
            match attempt {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    return Ok(Box::new(TcpConnection::new(stream)));
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(ClientError::Connection(match last_error {
            Some(e) => format!("failed to connect to {}: {}", host, e),
            None => format!("no address resolved for {}", host),
        }))
    }
}

/// Framed tokio TCP connection
pub struct TokioConnection {
    framed: Option<Framed<tokio::net::TcpStream, ProtoCodec>>,
}

impl TokioConnection {
    pub fn new(stream: tokio::net::TcpStream) -> Self {
        Self {
            framed: Some(Framed::new(stream, ProtoCodec)),
        }
    }

    fn framed(&mut self) -> Result<&mut Framed<tokio::net::TcpStream, ProtoCodec>> {
        self.framed
            .as_mut()
            .ok_or_else(|| ClientError::Connection("connection is closed".to_string()))
    }
}

#[async_trait]
impl AsyncConnection for TokioConnection {
    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.framed()?.send(Bytes::copy_from_slice(buf)).await
    }

    async fn read_message(&mut self) -> Result<ProtoMessage> {
        match self.framed()?.next().await {
            Some(message) => message,
            None => Err(ClientError::Connection(
                "connection closed by server".to_string(),
            )),
        }
    }

    fn is_valid(&mut self) -> bool {
        let framed = match self.framed.as_ref() {
            Some(framed) => framed,
            None => return false,
        };
        if !framed.read_buffer().is_empty() {
            return false;
        }
        let mut probe = [0u8; 1];
        match framed.get_ref().try_read(&mut probe) {
            Ok(_) => false,
            Err(e) => e.kind() == io::ErrorKind::WouldBlock,
        }
    }

    fn is_closed(&self) -> bool {
        self.framed.is_none()
    }

    fn close(&mut self) {
        self.framed = None;
    }
}

/// Connector for tokio TCP
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioConnector;

#[async_trait]
impl AsyncConnector for TokioConnector {
    async fn connect(&self, host: &Host, timeout: Duration) -> Result<Box<dyn AsyncConnection>> {
        let address = host.address();
        let stream = if timeout.is_zero() {
            tokio::net::TcpStream::connect(&address).await?
        } else {
            match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&address)).await {
                Ok(stream) => stream?,
                Err(_) => {
                    return Err(ClientError::Connection(format!(
                        "connect to {} timed out after {}ms",
                        host,
                        timeout.as_millis()
                    )))
                }
            }
        };
        stream.set_nodelay(true)?;
        Ok(Box::new(TokioConnection::new(stream)))
    }
}
