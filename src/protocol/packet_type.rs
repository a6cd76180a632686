//! Packet type discriminants.
//!
//! Types below [`USER_TYPE_BASE`] are reserved for the framework. `HEARTBEAT` is
//! answered by the server's receive loop with an `ACK` carrying the same sequence
//! and payload and never reaches a handler.

/// Liveness probe, answered inline
pub const HEARTBEAT: u16 = 1;
/// Session handshake
pub const HANDSHAKE: u16 = 2;
/// Orderly disconnect notice
pub const DISCONNECT: u16 = 3;
/// Acknowledgement, used for heartbeat replies
pub const ACK: u16 = 4;
/// JSON-encoded data
pub const DATA_JSON: u16 = 5;
/// Structured (binary serde) data
pub const DATA_STRUCT: u16 = 6;
/// Error report
pub const ERROR: u16 = 7;

/// First type value free for application use
pub const USER_TYPE_BASE: u16 = 100;

/// Whether `packet_type` is one of the framework's reserved values
pub fn is_reserved(packet_type: u16) -> bool {
    packet_type < USER_TYPE_BASE
}

/// Display name for reserved types
pub fn name(packet_type: u16) -> Option<&'static str> {
    match packet_type {
        HEARTBEAT => Some("HEARTBEAT"),
        HANDSHAKE => Some("HANDSHAKE"),
        DISCONNECT => Some("DISCONNECT"),
        ACK => Some("ACK"),
        DATA_JSON => Some("DATA_JSON"),
        DATA_STRUCT => Some("DATA_STRUCT"),
        ERROR => Some("ERROR"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_range() {
        assert!(is_reserved(HEARTBEAT));
        assert!(is_reserved(99));
        assert!(!is_reserved(USER_TYPE_BASE));
        assert_eq!(name(ACK), Some("ACK"));
        assert_eq!(name(201), None);
    }
}
