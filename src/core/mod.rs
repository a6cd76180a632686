//! # Core Protocol Components
//!
//! Packet framing, codecs and payload serialization.
//!
//! ## Components
//! - **Packet**: header layout, checksum and validation
//! - **Codec**: async packet reader and a `tokio_util` framing codec
//! - **Serialization**: pluggable payload encodings for handlers
//!
//! ## Wire Format
//! ```text
//! [Magic(4)] [Version(1)] [Type(2)] [Length(4)] [Checksum(4)] [Sequence(4)] [Payload(N)]
//! ```
//!
//! ## Security
//! - Maximum packet size: 10MB by default (prevents memory exhaustion)
//! - Magic number rejects foreign byte streams
//! - Length validation before allocation

pub mod codec;
pub mod packet;
pub mod serialization;
