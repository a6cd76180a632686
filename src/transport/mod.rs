//! # Transport Layer
//!
//! Byte streams and the [`Connection`](connection::Connection) that frames packets over them.
//!
//! ## Components
//! - **Stream**: any `AsyncRead + AsyncWrite` byte stream (TCP, TLS, in-memory duplex)
//! - **Acceptor / Connector**: optional TLS wrapping for the listener and dialer sides
//! - **Connection**: packet-level send/receive with deadlines and idempotent close
//! - **TLS**: rustls configuration built from certificate/key/CA files

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::ServerName;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

use crate::error::{ProtocolError, Result};

pub mod connection;
pub mod tls;

pub use connection::{Connection, ConnectionId, ConnectionOptions};
pub use tls::{TlsClientConfig, TlsServerConfig};

/// A bidirectional byte stream a connection can run over
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Stream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased stream, plain or secured
pub type BoxedStream = Box<dyn Stream>;

/// Listener-side stream wrapping
#[derive(Clone)]
pub enum Acceptor {
    Plain,
    Tls(TlsAcceptor),
}

impl Acceptor {
    /// Plain TCP unless server TLS material is supplied
    pub fn from_config(tls: Option<&TlsServerConfig>) -> Result<Self> {
        match tls {
            Some(config) => {
                let server_config = config.load_server_config()?;
                Ok(Acceptor::Tls(TlsAcceptor::from(Arc::new(server_config))))
            }
            None => Ok(Acceptor::Plain),
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Acceptor::Tls(_))
    }

    /// Wrap an accepted TCP stream, running the TLS handshake if configured.
    pub async fn accept(&self, stream: TcpStream) -> Result<BoxedStream> {
        stream.set_nodelay(true)?;
        match self {
            Acceptor::Plain => Ok(Box::new(stream)),
            Acceptor::Tls(acceptor) => {
                let tls_stream = acceptor
                    .accept(stream)
                    .await
                    .map_err(|e| ProtocolError::TlsError(format!("TLS handshake failed: {e}")))?;
                debug!("TLS handshake complete");
                Ok(Box::new(tls_stream))
            }
        }
    }
}

/// Dialer-side stream wrapping
#[derive(Clone)]
pub enum Connector {
    Plain,
    Tls {
        connector: TlsConnector,
        server_name: ServerName,
    },
}

impl Connector {
    /// Plain TCP unless client TLS material is supplied
    pub fn from_config(tls: Option<&TlsClientConfig>) -> Result<Self> {
        match tls {
            Some(config) => Ok(Connector::Tls {
                connector: TlsConnector::from(Arc::new(config.load_client_config()?)),
                server_name: config.server_name()?,
            }),
            None => Ok(Connector::Plain),
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Connector::Tls { .. })
    }

    /// Dial `addr` and wrap the stream, running the TLS handshake if configured.
    pub async fn connect(&self, addr: &str) -> Result<(BoxedStream, SocketAddr)> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;

        match self {
            Connector::Plain => Ok((Box::new(stream), peer)),
            Connector::Tls {
                connector,
                server_name,
            } => {
                let tls_stream = connector
                    .connect(server_name.clone(), stream)
                    .await
                    .map_err(|e| ProtocolError::TlsError(format!("TLS connection failed: {e}")))?;
                Ok((Box::new(tls_stream), peer))
            }
        }
    }
}
