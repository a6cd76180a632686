//! # Utility Modules
//!
//! Supporting pieces shared by the wire layer, the server and the client.
//!
//! ## Components
//! - **Buffer Pool**: reusable scratch buffers for packet decoding
//! - **Logging**: `tracing-subscriber` setup driven by `LoggingConfig`
//! - **Metrics**: thread-safe observability counters
//! - **Timeout**: async deadline wrappers mapping elapsed deadlines to `ProtocolError::Timeout`

pub mod buffer_pool;
pub mod logging;
pub mod metrics;
pub mod timeout;

pub use buffer_pool::BufferPool;
pub use metrics::{Metrics, MetricsSnapshot};
