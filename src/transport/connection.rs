//! Packet-level connection over one byte stream.
//!
//! The stream is split into independently locked halves: concurrent `send` calls
//! queue on the writer lock so packets never interleave, while a `receive` only
//! contends with other receivers. `close` flips a one-way flag and cancels a token
//! that every in-flight `send`/`receive` races against, so a blocked call returns
//! `ConnectionClosed` instead of waiting out its deadline.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

use crate::config::{ClientConfig, ServerConfig, TransportConfig, MAX_PACKET_SIZE};
use crate::core::codec::{read_packet, PacketCodec};
use crate::core::packet::Packet;
use crate::error::{ProtocolError, Result};
use crate::transport::{BoxedStream, Stream};
use crate::utils::buffer_pool::BufferPool;
use crate::utils::metrics::Metrics;
use crate::utils::timeout::{with_timeout_error, DEFAULT_TIMEOUT};

/// Bound on flushing the transport shutdown during `close`
const CLOSE_GRACE: Duration = Duration::from_secs(1);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Deadlines and limits for one connection
#[derive(Clone)]
pub struct ConnectionOptions {
    /// Deadline for each `receive` (zero disables)
    pub read_timeout: Duration,
    /// Deadline for each `send` (zero disables)
    pub write_timeout: Duration,
    /// Largest payload accepted in either direction
    pub max_packet_size: usize,
    /// Scratch space for decoding, shared between connections
    pub buffers: BufferPool,
    /// Owner's counters for packets and bytes in both directions
    pub metrics: Option<Arc<Metrics>>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_TIMEOUT,
            write_timeout: DEFAULT_TIMEOUT,
            max_packet_size: MAX_PACKET_SIZE,
            buffers: BufferPool::default(),
            metrics: None,
        }
    }
}

impl ConnectionOptions {
    pub fn for_server(server: &ServerConfig, transport: &TransportConfig, buffers: BufferPool) -> Self {
        Self {
            read_timeout: server.read_timeout,
            write_timeout: server.write_timeout,
            max_packet_size: transport.max_packet_size,
            buffers,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn for_client(client: &ClientConfig, transport: &TransportConfig, buffers: BufferPool) -> Self {
        Self {
            read_timeout: client.read_timeout,
            write_timeout: client.write_timeout,
            max_packet_size: transport.max_packet_size,
            buffers,
            metrics: None,
        }
    }
}

/// One framed stream
pub struct Connection {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    reader: Mutex<ReadHalf<BoxedStream>>,
    writer: Mutex<FramedWrite<WriteHalf<BoxedStream>, PacketCodec>>,
    options: ConnectionOptions,
    closed: AtomicBool,
    cancel: CancellationToken,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
}

impl Connection {
    /// Take exclusive ownership of `stream`.
    pub fn new<S: Stream>(stream: S, peer: Option<SocketAddr>, options: ConnectionOptions) -> Self {
        let boxed: BoxedStream = Box::new(stream);
        let (read_half, write_half) = tokio::io::split(boxed);
        let codec = PacketCodec::new(options.max_packet_size);

        Self {
            id: ConnectionId::next(),
            peer,
            reader: Mutex::new(read_half),
            writer: Mutex::new(FramedWrite::new(write_half, codec)),
            options,
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(ProtocolError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    /// Write one whole packet. Concurrent senders are serialized.
    #[instrument(
        level = "trace",
        skip(self, packet),
        fields(conn_id = %self.id, packet_type = packet.packet_type(), sequence = packet.sequence())
    )]
    pub async fn send(&self, packet: Packet) -> Result<()> {
        self.ensure_open()?;
        let wire_len = packet.encoded_len() as u64;

        let write = async {
            let mut writer = self.writer.lock().await;
            self.ensure_open()?;
            with_timeout_error(writer.send(packet), self.options.write_timeout).await
        };

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ProtocolError::ConnectionClosed),
            result = write => result,
        };

        if result.is_ok() {
            self.packets_sent.fetch_add(1, Ordering::Relaxed);
            if let Some(metrics) = &self.options.metrics {
                metrics.packet_sent(wire_len);
            }
            trace!("Packet sent");
        }
        result
    }

    /// Read the next packet from the stream.
    ///
    /// Any error leaves the stream position undefined; callers close the connection.
    pub async fn receive(&self) -> Result<Packet> {
        self.ensure_open()?;

        let read = async {
            let mut reader = self.reader.lock().await;
            with_timeout_error(
                read_packet(
                    &mut *reader,
                    &self.options.buffers,
                    self.options.max_packet_size,
                ),
                self.options.read_timeout,
            )
            .await
        };

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ProtocolError::ConnectionClosed),
            result = read => result,
        };

        if let Ok(packet) = &result {
            self.packets_received.fetch_add(1, Ordering::Relaxed);
            if let Some(metrics) = &self.options.metrics {
                metrics.packet_received(packet.encoded_len() as u64);
            }
            trace!(
                conn_id = %self.id,
                packet_type = packet.packet_type(),
                sequence = packet.sequence(),
                "Packet received"
            );
        }
        result
    }

    /// Close the connection. Only the first call touches the transport.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.cancel.cancel();

        let mut writer = self.writer.lock().await;
        let shutdown = with_timeout_error(
            async { writer.get_mut().shutdown().await.map_err(ProtocolError::from) },
            CLOSE_GRACE,
        )
        .await;

        match shutdown {
            Ok(()) => {
                debug!(conn_id = %self.id, "Connection closed");
                Ok(())
            }
            // The peer may already be gone; the connection is closed either way.
            Err(ProtocolError::Io(e)) if is_disconnect(&e) => Ok(()),
            Err(ProtocolError::Timeout) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn is_disconnect(e: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(
        e.kind(),
        NotConnected | BrokenPipe | ConnectionReset | ConnectionAborted | UnexpectedEof
    )
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}
