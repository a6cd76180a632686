//! # Services
//!
//! The server and client built on the transport and protocol layers.
//!
//! ## Components
//! - **Server**: accept loop, admission control, per-connection receive loops
//! - **Client**: single connection with request/response correlation
//! - **Worker Pool**: bounded handler execution with backpressure
//! - **Registry**: index of live server connections

pub mod client;
pub mod registry;
pub mod server;
pub mod worker_pool;

pub use client::Client;
pub use registry::Registry;
pub use server::{Server, ServerBuilder, ServerState};
pub use worker_pool::WorkerPool;
