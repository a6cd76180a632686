//! # Packet Client
//!
//! One connection to a server, with a background reader that routes each incoming
//! packet either to the request waiting for its sequence number or to the inbound
//! queue drained by [`Client::receive`].
//!
//! Sequence numbers come from one per-client counter starting at 1 that keeps
//! counting across reconnects, so a sequence is never reused while a response to
//! it could still arrive. That sequence is the only correlation key.
//!
//! ## Example
//! ```rust,no_run
//! use std::time::Duration;
//! use framenet::config::ClientConfig;
//! use framenet::service::client::Client;
//!
//! # async fn run() -> framenet::error::Result<()> {
//! let client = Client::new(ClientConfig::default());
//! client.connect("127.0.0.1:7070").await?;
//!
//! let response = client
//!     .send_with_response(5, b"ping".to_vec(), Duration::from_secs(1))
//!     .await?;
//! println!("{} bytes back", response.payload().len());
//!
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::{ClientConfig, TransportConfig};
use crate::core::packet::Packet;
use crate::core::serialization::{decode, encode, SerializationFormat};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::packet_type;
use crate::transport::connection::{Connection, ConnectionOptions};
use crate::transport::tls::TlsClientConfig;
use crate::transport::Connector;
use crate::utils::buffer_pool::BufferPool;
use crate::utils::metrics::Metrics;
use crate::utils::timeout::{with_timeout, with_timeout_error};

/// Timed-out sequences remembered so their late responses can be discarded
const ABANDONED_CAPACITY: usize = 1024;

/// Bound on waiting for the reader task during close
const READER_EXIT_TIMEOUT: Duration = Duration::from_secs(1);

fn poisoned() -> ProtocolError {
    ProtocolError::Custom(constants::ERR_LOCK_POISONED.to_string())
}

/// Waiters for correlated responses on one session
#[derive(Default)]
struct PendingRequests {
    waiters: StdMutex<HashMap<u32, oneshot::Sender<Packet>>>,
}

impl PendingRequests {
    fn register(&self, sequence: u32) -> Result<oneshot::Receiver<Packet>> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .map_err(|_| poisoned())?
            .insert(sequence, tx);
        Ok(rx)
    }

    fn take(&self, sequence: u32) -> Option<oneshot::Sender<Packet>> {
        self.waiters.lock().ok()?.remove(&sequence)
    }

    /// Drop every waiter; their receivers observe a closed channel.
    fn clear(&self) {
        if let Ok(mut waiters) = self.waiters.lock() {
            waiters.clear();
        }
    }

    fn len(&self) -> usize {
        self.waiters.lock().map(|w| w.len()).unwrap_or(0)
    }
}

/// Registration of one correlated request.
///
/// Dropping it while still armed (the request future was cancelled, or its
/// deadline passed) unregisters the waiter and remembers the sequence so a late
/// response is discarded instead of surfacing through `receive()`.
struct PendingGuard<'a> {
    pending: &'a PendingRequests,
    abandoned: &'a StdMutex<Abandoned>,
    sequence: u32,
    armed: bool,
}

impl<'a> PendingGuard<'a> {
    fn register(
        pending: &'a PendingRequests,
        abandoned: &'a StdMutex<Abandoned>,
        sequence: u32,
    ) -> Result<(Self, oneshot::Receiver<Packet>)> {
        let response = pending.register(sequence)?;
        let guard = Self {
            pending,
            abandoned,
            sequence,
            armed: true,
        };
        Ok((guard, response))
    }

    /// The waiter was consumed or cleared elsewhere.
    fn disarm(&mut self) {
        self.armed = false;
    }

    /// Unregister without expecting a response, e.g. the request was never sent.
    fn withdraw(&mut self) {
        self.armed = false;
        self.pending.take(self.sequence);
    }

    /// Give up on the response. Returns `false` when the reader had already
    /// claimed the waiter, in which case the response is in flight to it.
    fn abandon(&mut self) -> bool {
        self.armed = false;
        // Marked before the waiter goes away so the reader always finds one of the two.
        if let Ok(mut abandoned) = self.abandoned.lock() {
            abandoned.insert(self.sequence);
        }
        let unclaimed = self.pending.take(self.sequence).is_some();
        if !unclaimed {
            if let Ok(mut abandoned) = self.abandoned.lock() {
                abandoned.remove(self.sequence);
            }
        }
        unclaimed
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.abandon();
        }
    }
}

/// Bounded memory of sequences whose waiter gave up
struct Abandoned {
    set: HashSet<u32>,
    order: VecDeque<u32>,
}

impl Abandoned {
    fn new() -> Self {
        Self {
            set: HashSet::with_capacity(ABANDONED_CAPACITY),
            order: VecDeque::with_capacity(ABANDONED_CAPACITY),
        }
    }

    fn insert(&mut self, sequence: u32) {
        if !self.set.insert(sequence) {
            return;
        }
        self.order.push_back(sequence);
        if self.order.len() > ABANDONED_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
    }

    fn remove(&mut self, sequence: u32) -> bool {
        self.set.remove(&sequence)
    }
}

/// One live connection and its reader
struct Session {
    conn: Arc<Connection>,
    pending: Arc<PendingRequests>,
    inbound: Mutex<mpsc::Receiver<Packet>>,
    reader: StdMutex<Option<JoinHandle<()>>>,
}

impl Drop for Session {
    fn drop(&mut self) {
        // The reader holds the connection open; a dropped client must not leak it.
        if let Ok(reader) = self.reader.get_mut() {
            if let Some(handle) = reader.take() {
                handle.abort();
            }
        }
    }
}

pub struct Client {
    config: ClientConfig,
    transport: TransportConfig,
    connector: Connector,
    buffers: BufferPool,
    metrics: Arc<Metrics>,
    sequence: AtomicU32,
    session: StdMutex<Option<Arc<Session>>>,
    last_addr: StdMutex<Option<String>>,
    abandoned: Arc<StdMutex<Abandoned>>,
    // Serializes connect/close.
    lifecycle: Mutex<()>,
}

impl Client {
    /// Plain TCP client
    pub fn new(config: ClientConfig) -> Self {
        let transport = TransportConfig::default();
        Self {
            buffers: BufferPool::new(transport.buffer_pool_size, transport.max_pooled_buffer_size),
            transport,
            config,
            connector: Connector::Plain,
            metrics: Arc::new(Metrics::new()),
            sequence: AtomicU32::new(1),
            session: StdMutex::new(None),
            last_addr: StdMutex::new(None),
            abandoned: Arc::new(StdMutex::new(Abandoned::new())),
            lifecycle: Mutex::new(()),
        }
    }

    /// Client that wraps every connection in TLS
    pub fn with_tls(config: ClientConfig, tls: TlsClientConfig) -> Result<Self> {
        let mut client = Self::new(config);
        client.connector = Connector::from_config(Some(&tls))?;
        Ok(client)
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.buffers = BufferPool::new(transport.buffer_pool_size, transport.max_pooled_buffer_size);
        self.transport = transport;
        self
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.session
            .lock()
            .ok()
            .and_then(|session| session.as_ref().map(|s| !s.conn.is_closed()))
            .unwrap_or(false)
    }

    fn next_sequence(&self) -> u32 {
        loop {
            let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
            if sequence != 0 {
                return sequence;
            }
        }
    }

    fn current(&self) -> Result<Arc<Session>> {
        self.session
            .lock()
            .map_err(|_| poisoned())?
            .clone()
            .ok_or(ProtocolError::NotConnected)
    }

    /// Dial `addr` and start the background reader.
    #[instrument(skip(self), fields(tls = self.connector.is_tls()))]
    pub async fn connect(&self, addr: &str) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;

        // A session whose connection already died is replaced silently.
        let stale = {
            let mut slot = self.session.lock().map_err(|_| poisoned())?;
            match slot.as_ref() {
                Some(session) if !session.conn.is_closed() => {
                    return Err(ProtocolError::AlreadyConnected)
                }
                _ => slot.take(),
            }
        };
        if let Some(session) = stale {
            teardown(session).await;
        }

        let (stream, peer) =
            with_timeout_error(self.connector.connect(addr), self.config.connection_timeout).await?;

        let options = ConnectionOptions::for_client(&self.config, &self.transport, self.buffers.clone())
            .with_metrics(self.metrics.clone());
        let conn = Arc::new(Connection::new(stream, Some(peer), options));
        let pending = Arc::new(PendingRequests::default());
        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.inbound_capacity.max(1));

        let reader = tokio::spawn(read_loop(
            conn.clone(),
            pending.clone(),
            self.abandoned.clone(),
            inbound_tx,
            self.metrics.clone(),
        ));

        let session = Arc::new(Session {
            conn,
            pending,
            inbound: Mutex::new(inbound_rx),
            reader: StdMutex::new(Some(reader)),
        });

        *self.session.lock().map_err(|_| poisoned())? = Some(session);
        *self.last_addr.lock().map_err(|_| poisoned())? = Some(addr.to_string());
        self.metrics.connection_established();

        info!(peer = %peer, "Connected");
        Ok(())
    }

    /// Send one packet and return the sequence number it carried.
    pub async fn send(&self, packet_type: u16, payload: impl Into<Bytes>) -> Result<u32> {
        let session = self.current()?;
        let sequence = self.next_sequence();
        session
            .conn
            .send(Packet::try_new(packet_type, payload, sequence)?)
            .await?;
        Ok(sequence)
    }

    /// Next packet that no correlated request claimed.
    pub async fn receive(&self) -> Result<Packet> {
        let session = self.current()?;
        let mut inbound = session.inbound.lock().await;
        inbound.recv().await.ok_or(ProtocolError::ConnectionClosed)
    }

    /// Send a packet and wait up to `timeout` for the response carrying its sequence.
    ///
    /// A zero `timeout` waits indefinitely. After a timeout, a response that still
    /// arrives for this sequence is discarded.
    #[instrument(level = "debug", skip(self, payload))]
    pub async fn send_with_response(
        &self,
        packet_type: u16,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Packet> {
        let session = self.current()?;
        let sequence = self.next_sequence();
        let packet = Packet::try_new(packet_type, payload, sequence)?;
        let (mut guard, mut response) =
            PendingGuard::register(&session.pending, &self.abandoned, sequence)?;

        if let Err(e) = session.conn.send(packet).await {
            guard.withdraw();
            return Err(e);
        }

        match with_timeout(&mut response, timeout).await {
            Ok(Ok(packet)) => {
                guard.disarm();
                Ok(packet)
            }
            Ok(Err(_)) => {
                guard.disarm();
                Err(ProtocolError::ConnectionClosed)
            }
            Err(_) => {
                if guard.abandon() {
                    debug!(sequence, "Request timed out");
                    return Err(ProtocolError::Timeout);
                }
                // The reader claimed the waiter as the deadline passed and hands
                // the packet over without awaiting in between.
                response.await.map_err(|_| ProtocolError::ConnectionClosed)
            }
        }
    }

    /// Correlated heartbeat; returns the server's acknowledgement.
    pub async fn heartbeat(&self, timeout: Duration) -> Result<Packet> {
        let ack = self
            .send_with_response(packet_type::HEARTBEAT, Bytes::new(), timeout)
            .await?;
        self.metrics.heartbeat();
        Ok(ack)
    }

    /// Serialize `value` and send it.
    pub async fn send_value<T: Serialize + ?Sized>(
        &self,
        packet_type: u16,
        value: &T,
        format: SerializationFormat,
    ) -> Result<u32> {
        self.send(packet_type, encode(value, format)?).await
    }

    /// Serialize `value`, send it, and decode the response with the same format.
    ///
    /// Waits up to the configured `response_timeout`.
    pub async fn request_value<T, R>(
        &self,
        packet_type: u16,
        value: &T,
        format: SerializationFormat,
    ) -> Result<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let response = self
            .send_with_response(packet_type, encode(value, format)?, self.config.response_timeout)
            .await?;
        decode(response.payload(), format)
    }

    /// Drop the current connection and dial again, retrying with a delay.
    #[instrument(skip(self))]
    pub async fn reconnect(&self) -> Result<()> {
        let addr = {
            let last = self.last_addr.lock().map_err(|_| poisoned())?.clone();
            match last {
                Some(addr) => addr,
                None if !self.config.address.is_empty() => self.config.address.clone(),
                None => {
                    return Err(ProtocolError::ConfigError(
                        constants::ERR_NO_ADDRESS.to_string(),
                    ))
                }
            }
        };

        self.close().await?;

        let attempts = self.config.max_reconnect_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.connect(&addr).await {
                Ok(()) => {
                    info!(attempt, address = %addr, "Reconnected");
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, attempts, address = %addr, error = %e, "Reconnect attempt failed");
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.config.reconnect_delay).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or(ProtocolError::NotConnected))
    }

    /// Close the connection. Pending requests fail with `ConnectionClosed`. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let session = self.session.lock().map_err(|_| poisoned())?.take();
        match session {
            Some(session) => {
                teardown(session).await;
                debug!("Client closed");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

async fn teardown(session: Arc<Session>) {
    if let Err(e) = session.conn.close().await {
        debug!(error = %e, "Error closing connection");
    }
    let reader = session.reader.lock().ok().and_then(|mut r| r.take());
    if let Some(reader) = reader {
        if with_timeout(reader, READER_EXIT_TIMEOUT).await.is_err() {
            warn!("Reader task did not exit in time");
        }
    }
    session.pending.clear();
}

async fn read_loop(
    conn: Arc<Connection>,
    pending: Arc<PendingRequests>,
    abandoned: Arc<StdMutex<Abandoned>>,
    inbound: mpsc::Sender<Packet>,
    metrics: Arc<Metrics>,
) {
    loop {
        let packet = match conn.receive().await {
            Ok(packet) => packet,
            Err(ProtocolError::ConnectionClosed) => break,
            Err(e) => {
                if e.is_framing() {
                    metrics.framing_error();
                }
                warn!(conn_id = %conn.id(), error = %e, "Receive failed, closing connection");
                break;
            }
        };

        let sequence = packet.sequence();
        if let Some(waiter) = pending.take(sequence) {
            // The waiter may have been dropped with its request future.
            let _ = waiter.send(packet);
            continue;
        }

        let late = abandoned
            .lock()
            .map(|mut abandoned| abandoned.remove(sequence))
            .unwrap_or(false);
        if late {
            metrics.late_response();
            debug!(sequence, "Discarding late response");
            continue;
        }

        match inbound.try_send(packet) {
            Ok(()) => {}
            Err(TrySendError::Full(packet)) => {
                warn!(
                    sequence = packet.sequence(),
                    packet_type = packet.packet_type(),
                    "Inbound queue full, dropping packet"
                );
            }
            Err(TrySendError::Closed(_)) => break,
        }
    }

    pending.clear();
    if let Err(e) = conn.close().await {
        debug!(error = %e, "Error closing connection");
    }
    metrics.connection_closed();
    debug!(conn_id = %conn.id(), "Reader stopped");
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::config::ServerConfig;
    use crate::service::server::Server;

    #[test]
    fn test_abandoned_is_bounded() {
        let mut abandoned = Abandoned::new();
        for sequence in 0..(ABANDONED_CAPACITY as u32 + 10) {
            abandoned.insert(sequence);
        }
        assert_eq!(abandoned.set.len(), ABANDONED_CAPACITY);
        assert!(!abandoned.remove(0));
        assert!(abandoned.remove(ABANDONED_CAPACITY as u32 + 9));
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let client = Client::new(ClientConfig::default());
        assert!(!client.is_connected());
        assert!(matches!(
            client.send(5, b"x".to_vec()).await,
            Err(ProtocolError::NotConnected)
        ));
        assert!(matches!(
            client.receive().await,
            Err(ProtocolError::NotConnected)
        ));
        assert!(matches!(
            client
                .send_with_response(5, Bytes::new(), Duration::from_millis(10))
                .await,
            Err(ProtocolError::NotConnected)
        ));
        client.close().await.unwrap();
    }

    #[test]
    fn test_sequence_skips_zero_on_wrap() {
        let client = Client::new(ClientConfig::default());
        assert_eq!(client.next_sequence(), 1);
        assert_eq!(client.next_sequence(), 2);

        client.sequence.store(u32::MAX, Ordering::Relaxed);
        assert_eq!(client.next_sequence(), u32::MAX);
        assert_eq!(client.next_sequence(), 1);
    }

    #[test]
    fn test_abandon_marks_sequence_before_unregistering() {
        let pending = PendingRequests::default();
        let abandoned = StdMutex::new(Abandoned::new());

        let (mut guard, _response) = PendingGuard::register(&pending, &abandoned, 7).unwrap();
        assert!(guard.abandon());
        assert_eq!(pending.len(), 0);
        assert!(abandoned.lock().unwrap().set.contains(&7));

        // reader got there first: the response belongs to the request, not the late set
        let (mut guard, _response) = PendingGuard::register(&pending, &abandoned, 8).unwrap();
        let waiter = pending.take(8).unwrap();
        assert!(!guard.abandon());
        assert!(!abandoned.lock().unwrap().set.contains(&8));
        drop(waiter);
    }

    #[test]
    fn test_guard_drop_and_withdraw() {
        let pending = PendingRequests::default();
        let abandoned = StdMutex::new(Abandoned::new());

        let (guard, _response) = PendingGuard::register(&pending, &abandoned, 9).unwrap();
        assert_eq!(pending.len(), 1);
        drop(guard);
        assert_eq!(pending.len(), 0);
        assert!(abandoned.lock().unwrap().set.contains(&9));

        let (mut guard, _response) = PendingGuard::register(&pending, &abandoned, 10).unwrap();
        guard.withdraw();
        drop(guard);
        assert_eq!(pending.len(), 0);
        assert!(!abandoned.lock().unwrap().set.contains(&10));

        let (mut guard, _response) = PendingGuard::register(&pending, &abandoned, 11).unwrap();
        let _waiter = pending.take(11).unwrap();
        guard.disarm();
        drop(guard);
        assert!(!abandoned.lock().unwrap().set.contains(&11));
    }

    #[tokio::test]
    async fn test_cancelled_requests_leave_no_waiters() {
        const SILENT: u16 = 102;
        let server = Server::builder(ServerConfig::default())
            .handler(SILENT, |_conn, _packet: Packet| async { Ok(()) })
            .build();
        let addr = server.start("127.0.0.1:0").await.unwrap();

        let client = Arc::new(Client::new(ClientConfig::default()));
        client.connect(&addr.to_string()).await.unwrap();

        // outer deadline drops the request future
        for _ in 0..10 {
            let request =
                client.send_with_response(SILENT, b"x".to_vec(), Duration::from_secs(60));
            assert!(tokio::time::timeout(Duration::from_millis(10), request)
                .await
                .is_err());
        }

        // aborted task
        let task = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .send_with_response(SILENT, b"y".to_vec(), Duration::from_secs(60))
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        let session = client.current().unwrap();
        assert_eq!(session.pending.len(), 0);
        assert!(client.abandoned.lock().unwrap().set.len() >= 10);
        assert!(client.is_connected());

        client.close().await.unwrap();
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_without_address() {
        let client = Client::new(ClientConfig {
            address: String::new(),
            ..ClientConfig::default()
        });
        assert!(matches!(
            client.reconnect().await,
            Err(ProtocolError::ConfigError(m)) if m == constants::ERR_NO_ADDRESS
        ));
    }
}
