//! # Error Types
//!
//! Every fallible operation in the crate returns [`ProtocolError`].
//!
//! ## Error Categories
//! - **I/O Errors**: socket and file system failures
//! - **Framing Errors**: bad magic, oversized length, checksum or version mismatch, short reads
//! - **Capacity Errors**: worker queue full, connection ceiling reached
//! - **Lifecycle Errors**: operating on a closed pool/connection/client, double connect
//! - **Timeouts**: a deadline or a correlated request wait elapsed
//!
//! Framing errors terminate the receive loop of the connection they occurred on and
//! are never retried transparently. Capacity errors are reported immediately instead
//! of being queued.
//!
//! ## Example Usage
//! ```rust
//! use framenet::core::packet::Packet;
//! use framenet::error::ProtocolError;
//!
//! let mut bytes = Packet::new(5, b"ping".to_vec(), 1).to_bytes();
//! bytes[0] ^= 0xFF;
//! assert!(matches!(Packet::from_bytes(&bytes), Err(ProtocolError::InvalidMagic(_))));
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Lock errors
    pub const ERR_REGISTRY_READ_LOCK: &str = "Failed to acquire read lock on connection registry";
    pub const ERR_REGISTRY_WRITE_LOCK: &str =
        "Failed to acquire write lock on connection registry";
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";

    /// Server lifecycle
    pub const ERR_NO_HANDLERS: &str = "at least one packet handler must be registered";

    /// Client lifecycle
    pub const ERR_NO_ADDRESS: &str = "no address to reconnect to";
}

/// Why a fully read packet was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketFault {
    /// Payload checksum in the header does not match the payload.
    ChecksumMismatch { expected: u32, actual: u32 },
    /// Header carries a protocol version this build does not speak.
    UnsupportedVersion(u8),
}

impl std::fmt::Display for PacketFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PacketFault::ChecksumMismatch { expected, actual } => write!(
                f,
                "checksum mismatch: expected {expected:#010x}, got {actual:#010x}"
            ),
            PacketFault::UnsupportedVersion(v) => write!(f, "unsupported protocol version {v}"),
        }
    }
}

// ProtocolError is the primary error type for all framework operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid magic number: {0:#010x}")]
    InvalidMagic(u32),

    #[error("Packet too large: {size} bytes (max {max})")]
    PacketTooLarge { size: usize, max: usize },

    #[error("Invalid packet: {0}")]
    InvalidPacket(PacketFault),

    #[error("Short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    #[error("Worker pool queue is full")]
    QueueFull,

    #[error("Worker pool is closed")]
    PoolClosed,

    #[error("Connection limit reached ({0})")]
    ConnectionLimitReached(usize),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Client already connected")]
    AlreadyConnected,

    #[error("Client not connected")]
    NotConnected,

    #[error("Server is already listening")]
    AlreadyListening,

    #[error("Server is stopped")]
    ServerStopped,

    #[error("Timeout occurred")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Deserialize error: {0}")]
    DeserializeError(String),

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Malformed or corrupt wire data. The connection it came from is unusable.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            ProtocolError::InvalidMagic(_)
                | ProtocolError::PacketTooLarge { .. }
                | ProtocolError::InvalidPacket(_)
                | ProtocolError::ShortRead { .. }
        )
    }

    /// Overload rejections.
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            ProtocolError::QueueFull | ProtocolError::ConnectionLimitReached(_)
        )
    }

    /// Operations attempted in the wrong lifecycle state.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            ProtocolError::PoolClosed
                | ProtocolError::ConnectionClosed
                | ProtocolError::AlreadyConnected
                | ProtocolError::NotConnected
                | ProtocolError::AlreadyListening
                | ProtocolError::ServerStopped
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
