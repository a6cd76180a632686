//! # Packet Server
//!
//! Accepts stream connections (plain TCP or TLS), reads packets off each one on
//! its own task and hands them to registered handlers through a bounded
//! [`WorkerPool`].
//!
//! ## Lifecycle
//! `Created → Listening → Stopped`. A stopped server cannot be restarted.
//!
//! ## Per-connection loop
//! - Heartbeats are acknowledged inline with an `ACK` carrying the same sequence.
//! - Every other packet goes to the handler for its type, or the default handler.
//! - When the worker queue is full the [`OverflowPolicy`] decides between running
//!   the handler on the receive task and dropping the packet.
//! - Any receive error ends the loop and closes that connection only.
//!
//! ## Example
//! ```rust,no_run
//! use framenet::config::ServerConfig;
//! use framenet::core::packet::Packet;
//! use framenet::service::server::Server;
//!
//! # async fn run() -> framenet::error::Result<()> {
//! let server = Server::builder(ServerConfig::default())
//!     .handler(5, |conn, packet: Packet| async move {
//!         conn.send(Packet::reply(&packet, 5, packet.payload().clone())).await
//!     })
//!     .build();
//!
//! let addr = server.start("127.0.0.1:0").await?;
//! println!("listening on {addr}");
//! server.stop().await?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{OverflowPolicy, ServerConfig, TransportConfig};
use crate::core::packet::Packet;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::dispatcher::{Dispatcher, Handler};
use crate::service::registry::Registry;
use crate::service::worker_pool::WorkerPool;
use crate::transport::connection::{Connection, ConnectionOptions};
use crate::transport::tls::TlsServerConfig;
use crate::transport::Acceptor;
use crate::utils::buffer_pool::BufferPool;
use crate::utils::metrics::Metrics;
use crate::utils::timeout::{with_timeout, with_timeout_error};

/// Pause after a failed `accept` (e.g. file descriptor exhaustion)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Listening,
    Stopped,
}

impl ServerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ServerState::Created,
            1 => ServerState::Listening,
            _ => ServerState::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ServerState::Created => 0,
            ServerState::Listening => 1,
            ServerState::Stopped => 2,
        }
    }
}

/// Collects handlers and settings; handlers are frozen by [`build`](ServerBuilder::build).
pub struct ServerBuilder {
    config: ServerConfig,
    transport: TransportConfig,
    tls: Option<TlsServerConfig>,
    dispatcher: Dispatcher,
}

impl ServerBuilder {
    /// Handle packets of `packet_type` with an async closure.
    pub fn handler<F, Fut>(mut self, packet_type: u16, handler: F) -> Self
    where
        F: Fn(Arc<Connection>, Packet) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.dispatcher.register(packet_type, handler);
        self
    }

    /// Handle packets of `packet_type` with any [`Handler`].
    pub fn handler_impl<H: Handler>(mut self, packet_type: u16, handler: H) -> Self {
        self.dispatcher.register_handler(packet_type, handler);
        self
    }

    /// Handle every type without a dedicated handler.
    pub fn default_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Arc<Connection>, Packet) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.dispatcher.set_default(handler);
        self
    }

    pub fn tls(mut self, tls: TlsServerConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn build(self) -> Server {
        let buffers = BufferPool::new(
            self.transport.buffer_pool_size,
            self.transport.max_pooled_buffer_size,
        );

        Server {
            config: self.config,
            transport: self.transport,
            tls: self.tls,
            dispatcher: Arc::new(self.dispatcher),
            registry: Arc::new(Registry::new()),
            metrics: Arc::new(Metrics::new()),
            buffers,
            state: AtomicU8::new(ServerState::Created.as_u8()),
            local_addr: StdMutex::new(None),
            running: Mutex::new(None),
        }
    }
}

/// Resources that exist only while listening
struct Running {
    shutdown: CancellationToken,
    accept_task: JoinHandle<()>,
    pool: Arc<WorkerPool>,
    tracker: TaskTracker,
}

/// State shared by every connection task
struct ConnectionContext {
    acceptor: Acceptor,
    options: ConnectionOptions,
    handshake_timeout: Duration,
    dispatcher: Arc<Dispatcher>,
    pool: Arc<WorkerPool>,
    registry: Arc<Registry>,
    metrics: Arc<Metrics>,
    overflow_policy: OverflowPolicy,
    shutdown: CancellationToken,
}

pub struct Server {
    config: ServerConfig,
    transport: TransportConfig,
    tls: Option<TlsServerConfig>,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<Registry>,
    metrics: Arc<Metrics>,
    buffers: BufferPool,
    state: AtomicU8,
    local_addr: StdMutex<Option<SocketAddr>>,
    // Serializes start/stop.
    running: Mutex<Option<Running>>,
}

impl Server {
    pub fn builder(config: ServerConfig) -> ServerBuilder {
        ServerBuilder {
            config,
            transport: TransportConfig::default(),
            tls: None,
            dispatcher: Dispatcher::new(),
        }
    }

    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ServerState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Address actually bound, once listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.lock().ok().and_then(|addr| *addr)
    }

    /// Live registered connections
    pub fn connection_count(&self) -> usize {
        self.registry.count()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind `addr` and start accepting. Returns the bound address.
    #[instrument(skip(self), fields(tls = self.tls.is_some()))]
    pub async fn start(&self, addr: &str) -> Result<SocketAddr> {
        let mut running = self.running.lock().await;
        match self.state() {
            ServerState::Listening => return Err(ProtocolError::AlreadyListening),
            ServerState::Stopped => return Err(ProtocolError::ServerStopped),
            ServerState::Created => {}
        }
        if self.dispatcher.is_empty() {
            return Err(ProtocolError::ConfigError(
                constants::ERR_NO_HANDLERS.to_string(),
            ));
        }

        let acceptor = Acceptor::from_config(self.tls.as_ref())?;
        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;

        let pool = Arc::new(WorkerPool::new(
            self.config.worker_count,
            self.config.backpressure_limit,
        )?);
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();

        let ctx = Arc::new(ConnectionContext {
            acceptor,
            options: ConnectionOptions::for_server(&self.config, &self.transport, self.buffers.clone())
                .with_metrics(self.metrics.clone()),
            handshake_timeout: self.config.read_timeout,
            dispatcher: self.dispatcher.clone(),
            pool: pool.clone(),
            registry: self.registry.clone(),
            metrics: self.metrics.clone(),
            overflow_policy: self.config.overflow_policy,
            shutdown: shutdown.clone(),
        });
        let admission = Arc::new(Semaphore::new(self.config.max_connections));

        let accept_task = tokio::spawn(accept_loop(
            listener,
            ctx,
            admission,
            tracker.clone(),
            self.config.max_connections,
        ));

        if let Ok(mut local) = self.local_addr.lock() {
            *local = Some(bound);
        }
        *running = Some(Running {
            shutdown,
            accept_task,
            pool,
            tracker,
        });
        self.set_state(ServerState::Listening);

        info!(
            address = %bound,
            workers = self.config.worker_count,
            handlers = self.dispatcher.len(),
            default_handler = self.dispatcher.has_default(),
            "Server listening"
        );
        Ok(bound)
    }

    /// Stop accepting, drain the worker pool, then close every connection.
    ///
    /// Waits up to `shutdown_timeout` for connection tasks to finish. Idempotent.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        let previous = self.state();
        self.set_state(ServerState::Stopped);

        let Some(run) = running.take() else {
            if previous == ServerState::Created {
                debug!("Server stopped before it was started");
            }
            return Ok(());
        };

        info!("Shutting down server");

        run.shutdown.cancel();
        if let Err(e) = run.accept_task.await {
            error!(error = %e, "Accept loop failed");
        }

        run.pool.close().await;
        self.registry.close_all().await?;

        run.tracker.close();
        if with_timeout(run.tracker.wait(), self.config.shutdown_timeout)
            .await
            .is_err()
        {
            warn!(
                remaining = run.tracker.len(),
                "Shutdown timeout reached with connection tasks still running"
            );
        }

        self.metrics.log_metrics();
        info!("Server stopped");
        Ok(())
    }

    /// Start on `addr`, wait for Ctrl-C, then stop.
    pub async fn run_until_signal(&self, addr: &str) -> Result<()> {
        self.start(addr).await?;
        tokio::signal::ctrl_c().await?;
        info!("Received CTRL+C signal, shutting down");
        self.stop().await
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<ConnectionContext>,
    admission: Arc<Semaphore>,
    tracker: TaskTracker,
    max_connections: usize,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = ctx.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                let Ok(permit) = admission.clone().try_acquire_owned() else {
                    ctx.metrics.connection_rejected();
                    let reason = ProtocolError::ConnectionLimitReached(max_connections);
                    warn!(peer = %peer, error = %reason, "Rejecting connection");
                    drop(stream);
                    continue;
                };

                let ctx = ctx.clone();
                tracker.spawn(async move {
                    serve_connection(stream, peer, &ctx).await;
                    drop(permit);
                });
            }
            Err(e) => {
                error!(error = %e, "Accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
    debug!("Accept loop stopped");
}

async fn serve_connection(stream: TcpStream, peer: SocketAddr, ctx: &ConnectionContext) {
    let handshake = with_timeout_error(ctx.acceptor.accept(stream), ctx.handshake_timeout);
    let stream = tokio::select! {
        biased;
        _ = ctx.shutdown.cancelled() => return,
        result = handshake => match result {
            Ok(stream) => stream,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Connection setup failed");
                return;
            }
        },
    };

    let conn = Arc::new(Connection::new(stream, Some(peer), ctx.options.clone()));
    if let Err(e) = ctx.registry.add(&conn) {
        error!(peer = %peer, error = %e, "Failed to register connection");
        return;
    }
    ctx.metrics.connection_established();
    info!(peer = %peer, conn_id = %conn.id(), "Connection established");

    // Registered after shutdown began: close_all may already have run.
    if !ctx.shutdown.is_cancelled() {
        receive_loop(&conn, ctx).await;
    }

    if let Err(e) = ctx.registry.remove(conn.id()) {
        error!(conn_id = %conn.id(), error = %e, "Failed to unregister connection");
    }
    if let Err(e) = conn.close().await {
        debug!(conn_id = %conn.id(), error = %e, "Error closing connection");
    }
    ctx.metrics.connection_closed();
    info!(peer = %peer, conn_id = %conn.id(), "Connection closed");
}

async fn receive_loop(conn: &Arc<Connection>, ctx: &ConnectionContext) {
    loop {
        let packet = match conn.receive().await {
            Ok(packet) => packet,
            Err(ProtocolError::ConnectionClosed) => {
                debug!(conn_id = %conn.id(), "Connection closed by peer");
                break;
            }
            Err(e) if e.is_framing() => {
                ctx.metrics.framing_error();
                warn!(conn_id = %conn.id(), error = %e, "Malformed packet, dropping connection");
                break;
            }
            Err(e) => {
                debug!(conn_id = %conn.id(), error = %e, "Receive failed");
                break;
            }
        };

        if packet.is_heartbeat() {
            ctx.metrics.heartbeat();
            if let Err(e) = conn.send(Packet::ack(&packet)).await {
                debug!(conn_id = %conn.id(), error = %e, "Failed to acknowledge heartbeat");
                break;
            }
            continue;
        }

        dispatch(conn, packet, ctx).await;
    }
}

async fn dispatch(conn: &Arc<Connection>, packet: Packet, ctx: &ConnectionContext) {
    let Some(handler) = ctx.dispatcher.resolve(packet.packet_type()) else {
        ctx.metrics.unhandled_packet();
        warn!(
            conn_id = %conn.id(),
            packet_type = packet.packet_type(),
            "No handler registered for packet type"
        );
        return;
    };

    let task = run_handler(
        handler.clone(),
        conn.clone(),
        packet.clone(),
        ctx.metrics.clone(),
    );

    match ctx.pool.submit(task) {
        Ok(()) => ctx.metrics.task_submitted(),
        Err(ProtocolError::QueueFull) => {
            ctx.metrics.queue_full();
            match ctx.overflow_policy {
                OverflowPolicy::RunInline => {
                    ctx.metrics.inline_execution();
                    debug!(conn_id = %conn.id(), "Worker queue full, running handler inline");
                    run_handler(handler, conn.clone(), packet, ctx.metrics.clone()).await;
                }
                OverflowPolicy::Drop => {
                    warn!(
                        conn_id = %conn.id(),
                        packet_type = packet.packet_type(),
                        sequence = packet.sequence(),
                        "Worker queue full, dropping packet"
                    );
                }
            }
        }
        Err(e) => {
            debug!(conn_id = %conn.id(), error = %e, "Worker pool unavailable, dropping packet");
        }
    }
}

async fn run_handler(
    handler: Arc<dyn Handler>,
    conn: Arc<Connection>,
    packet: Packet,
    metrics: Arc<Metrics>,
) {
    let packet_type = packet.packet_type();
    let sequence = packet.sequence();
    let conn_id = conn.id();

    if let Err(e) = handler.handle(conn, packet).await {
        metrics.handler_error();
        warn!(conn_id = %conn_id, packet_type, sequence, error = %e, "Handler failed");
    }
}
