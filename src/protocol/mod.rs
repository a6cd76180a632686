//! # Packet Routing
//!
//! Packet type numbering and the type → handler dispatch table used by the server.

pub mod dispatcher;
pub mod packet_type;

pub use dispatcher::{Dispatcher, Handler, HandlerFuture};
