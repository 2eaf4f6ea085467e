//! Transport collaborator: opens duplex byte streams to `host:port`.
//!
//! The driver only needs "something that reads and writes bytes". Production
//! code uses [`TcpTransport`]; tests substitute in-memory streams or a
//! transport that fails on demand.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::error::{DriverError, DriverResult};

/// A duplex byte stream usable as a connection transport.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin + std::fmt::Debug {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + std::fmt::Debug {}

/// Owned, type-erased transport stream.
pub type BoxedStream = Box<dyn ByteStream>;

/// Boxed future alias for transport open results.
pub type OpenFuture<'a> = Pin<Box<dyn Future<Output = DriverResult<BoxedStream>> + Send + 'a>>;

/// Server endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Opens byte streams to a server. Injected for testability.
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Establish a new stream to `address`.
    fn open<'a>(&'a self, address: &'a Address) -> OpenFuture<'a>;
}

/// Plain TCP transport with a connect timeout.
#[derive(Clone, Debug)]
pub struct TcpTransport {
    connect_timeout: Duration,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Transport for TcpTransport {
    fn open<'a>(&'a self, address: &'a Address) -> OpenFuture<'a> {
        Box::pin(async move {
            let connect = TcpStream::connect((address.host.as_str(), address.port));
            let stream = match tokio::time::timeout(self.connect_timeout, connect).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => return Err(DriverError::Transport(format!("connect {address}: {e}"))),
                Err(_) => {
                    return Err(DriverError::Transport(format!(
                        "connect {address}: timed out after {:?}",
                        self.connect_timeout
                    )));
                }
            };
            stream
                .set_nodelay(true)
                .map_err(|e| DriverError::Transport(format!("set_nodelay: {e}")))?;

            tracing::debug!(address = %address, "tcp stream opened");
            Ok(Box::new(stream) as BoxedStream)
        })
    }
}
