//! # framenet
//!
//! Length-prefixed binary messaging over TCP and TLS.
//!
//! Payloads are framed into checksummed packets, dispatched on the server through
//! a bounded worker pool, and correlated with their responses on the client by
//! sequence number.
//!
//! ## Layers
//! - [`core`]: packet layout, codecs, payload serialization
//! - [`transport`]: byte streams, TLS, the framed [`Connection`]
//! - [`protocol`]: packet type numbering and handler dispatch
//! - [`service`]: [`Server`], [`Client`], worker pool, connection registry
//! - [`utils`]: buffer pool, logging setup, metrics, deadlines
//!
//! ## Quick Start
//! ```rust,no_run
//! use std::time::Duration;
//! use framenet::{Client, ClientConfig, Packet, Server, ServerConfig};
//!
//! # async fn run() -> framenet::Result<()> {
//! let server = Server::builder(ServerConfig::default())
//!     .handler(100, |conn, packet: Packet| async move {
//!         conn.send(Packet::reply(&packet, 100, packet.payload().clone())).await
//!     })
//!     .build();
//! let addr = server.start("127.0.0.1:0").await?;
//!
//! let client = Client::new(ClientConfig::default());
//! client.connect(&addr.to_string()).await?;
//! let echo = client
//!     .send_with_response(100, b"hello".to_vec(), Duration::from_secs(1))
//!     .await?;
//! assert_eq!(&echo.payload()[..], b"hello");
//!
//! client.close().await?;
//! server.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use crate::config::{ClientConfig, NetworkConfig, ServerConfig, TransportConfig};
pub use crate::core::packet::Packet;
pub use crate::error::{ProtocolError, Result};
pub use crate::service::{Client, Server};
pub use crate::transport::Connection;
