use crate::core::packet::Packet;
use crate::error::Result;
use crate::transport::connection::Connection;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Future returned by a handler invocation
pub type HandlerFuture = BoxFuture<'static, Result<()>>;

/// Something that processes packets of one type.
///
/// Async closures `Fn(Arc<Connection>, Packet) -> impl Future<Output = Result<()>>`
/// implement this directly. Handlers reply by sending on the connection they are given.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, conn: Arc<Connection>, packet: Packet) -> HandlerFuture;
}

impl<F, Fut> Handler for F
where
    F: Fn(Arc<Connection>, Packet) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn handle(&self, conn: Arc<Connection>, packet: Packet) -> HandlerFuture {
        Box::pin(self(conn, packet))
    }
}

/// Packet type → handler routing table, with an optional catch-all.
///
/// Filled before the server starts; the server only reads it afterwards.
#[derive(Clone, Default)]
pub struct Dispatcher {
    handlers: HashMap<u16, Arc<dyn Handler>>,
    fallback: Option<Arc<dyn Handler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `packet_type` to an async closure, replacing any previous registration.
    pub fn register<F, Fut>(&mut self, packet_type: u16, handler: F)
    where
        F: Fn(Arc<Connection>, Packet) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register_handler(packet_type, handler);
    }

    /// Route `packet_type` to any [`Handler`] implementation.
    pub fn register_handler<H: Handler>(&mut self, packet_type: u16, handler: H) {
        self.handlers.insert(packet_type, Arc::new(handler));
    }

    /// Async closure for types without a dedicated registration.
    pub fn set_default<F, Fut>(&mut self, handler: F)
    where
        F: Fn(Arc<Connection>, Packet) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.set_default_handler(handler);
    }

    /// [`Handler`] for types without a dedicated registration.
    pub fn set_default_handler<H: Handler>(&mut self, handler: H) {
        self.fallback = Some(Arc::new(handler));
    }

    /// Handler responsible for `packet_type`, falling back to the default.
    pub fn resolve(&self, packet_type: u16) -> Option<Arc<dyn Handler>> {
        self.handlers
            .get(&packet_type)
            .or(self.fallback.as_ref())
            .cloned()
    }

    /// Start the handler for `packet`. `None` when nothing claims its type.
    pub fn dispatch(&self, conn: Arc<Connection>, packet: Packet) -> Option<HandlerFuture> {
        self.resolve(packet.packet_type())
            .map(|handler| handler.handle(conn, packet))
    }

    pub fn has_default(&self) -> bool {
        self.fallback.is_some()
    }

    /// Number of dedicated registrations
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// No dedicated handler and no default
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty() && self.fallback.is_none()
    }
}
