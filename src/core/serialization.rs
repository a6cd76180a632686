//! # Payload Serialization
//!
//! Payload encodings for application handlers. The framing layer never looks
//! inside payloads; handlers pick a format and use [`encode`] / [`decode`] (or the
//! [`MultiFormat`] methods) on their own message types.
//!
//! ## Formats
//! - **Bincode**: binary, fastest (default)
//! - **JSON**: human-readable, for debugging and interop
//! - **MessagePack**: compact binary
//!
//! ## Usage
//! ```rust
//! use framenet::core::serialization::{decode, encode, SerializationFormat};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Login { user: String }
//!
//! let bytes = encode(&Login { user: "ada".into() }, SerializationFormat::Json).unwrap();
//! let back: Login = decode(&bytes, SerializationFormat::Json).unwrap();
//! assert_eq!(back.user, "ada");
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Payload encodings understood by [`encode`] and [`decode`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializationFormat {
    /// bincode 1.x, the default
    #[default]
    Bincode,
    /// serde_json, for interop with non-Rust peers
    Json,
    /// MessagePack via rmp-serde
    MessagePack,
}

impl SerializationFormat {
    /// Get the format identifier byte for self-describing payloads
    pub fn format_byte(self) -> u8 {
        match self {
            SerializationFormat::Bincode => 0x01,
            SerializationFormat::Json => 0x02,
            SerializationFormat::MessagePack => 0x03,
        }
    }

    /// Inverse of `format_byte`
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(SerializationFormat::Bincode),
            0x02 => Some(SerializationFormat::Json),
            0x03 => Some(SerializationFormat::MessagePack),
            _ => None,
        }
    }

    /// Display name
    pub fn name(self) -> &'static str {
        match self {
            SerializationFormat::Bincode => "Bincode",
            SerializationFormat::Json => "JSON",
            SerializationFormat::MessagePack => "MessagePack",
        }
    }
}

/// Serialize `value` with `format`.
pub fn encode<T: Serialize + ?Sized>(value: &T, format: SerializationFormat) -> Result<Vec<u8>> {
    match format {
        SerializationFormat::Bincode => {
            bincode::serialize(value).map_err(|e| ProtocolError::SerializeError(e.to_string()))
        }
        SerializationFormat::Json => {
            serde_json::to_vec(value).map_err(|e| ProtocolError::SerializeError(e.to_string()))
        }
        SerializationFormat::MessagePack => {
            rmp_serde::to_vec(value).map_err(|e| ProtocolError::SerializeError(e.to_string()))
        }
    }
}

/// Deserialize a `T` from `data` encoded with `format`.
pub fn decode<T: DeserializeOwned>(data: &[u8], format: SerializationFormat) -> Result<T> {
    match format {
        SerializationFormat::Bincode => {
            bincode::deserialize(data).map_err(|e| ProtocolError::DeserializeError(e.to_string()))
        }
        SerializationFormat::Json => serde_json::from_slice(data)
            .map_err(|e| ProtocolError::DeserializeError(e.to_string())),
        SerializationFormat::MessagePack => rmp_serde::from_slice(data)
            .map_err(|e| ProtocolError::DeserializeError(e.to_string())),
    }
}

/// Format-aware (de)serialization for any serde type
pub trait MultiFormat: Serialize + DeserializeOwned + Sized {
    /// Encode `self` as `format`
    fn serialize_format(&self, format: SerializationFormat) -> Result<Vec<u8>> {
        encode(self, format)
    }

    /// Serialize to bytes with a leading format byte
    fn serialize_with_header(&self, format: SerializationFormat) -> Result<Vec<u8>> {
        let mut data = vec![format.format_byte()];
        data.extend(self.serialize_format(format)?);
        Ok(data)
    }

    /// Decode bytes produced by `serialize_format`
    fn deserialize_format(data: &[u8], format: SerializationFormat) -> Result<Self> {
        decode(data, format)
    }

    /// Deserialize from bytes produced by `serialize_with_header`
    fn deserialize_with_header(data: &[u8]) -> Result<(Self, SerializationFormat)> {
        let (&first, rest) = data
            .split_first()
            .ok_or_else(|| ProtocolError::DeserializeError("Empty data".to_string()))?;

        let format = SerializationFormat::from_byte(first).ok_or_else(|| {
            ProtocolError::DeserializeError(format!("Unknown format byte: {first}"))
        })?;

        let value = Self::deserialize_format(rest, format)?;
        Ok((value, format))
    }
}

impl<T: Serialize + DeserializeOwned> MultiFormat for T {}
