//! Error types for conbus.

use thiserror::Error;

use crate::peer::PeerId;
use crate::protocol::{ErrorCode, MAX_PAYLOAD_SIZE};

/// Main error type for all bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// Payload does not fit in a single frame.
    #[error("Payload of {0} bytes exceeds maximum {max}", max = MAX_PAYLOAD_SIZE)]
    PayloadTooLarge(usize),

    /// Frame or reply bytes violate the wire format.
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// Outbound queue for the peer is at capacity (backpressure).
    #[error("Command queue for {0} is full")]
    QueueFull(PeerId),

    /// Peer stayed mid-transaction for the whole busy spin.
    #[error("Peer {0} is busy")]
    PeerBusy(PeerId),

    /// A bounded wait on the link expired.
    #[error("Timed out on {peer} link waiting for {what}")]
    Timeout {
        /// Link the wait happened on.
        peer: PeerId,
        /// What was being waited for.
        what: &'static str,
    },

    /// Peer is in degraded mode; commands are rejected immediately.
    #[error("Peer {0} has permanently failed")]
    PeerFailed(PeerId),

    /// Domain handlers may not claim protocol-reserved command ids.
    #[error("Command id {0:#04x} is reserved")]
    ReservedCommandId(u8),

    /// Serial peripheral failure.
    #[error("Link error: {0}")]
    Link(String),

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error (configuration files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (configuration, diagnostics).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The service task is no longer running.
    #[error("Bus service stopped")]
    ServiceStopped,
}

impl BusError {
    /// Wire error code this failure is reported as.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            BusError::Timeout { .. } | BusError::Link(_) => ErrorCode::COMMUNICATION_FAILURE,
            BusError::PeerBusy(_) | BusError::QueueFull(_) => ErrorCode::BUSY,
            BusError::Malformed(_) | BusError::ReservedCommandId(_) => ErrorCode::INVALID_COMMAND,
            BusError::PayloadTooLarge(_) => ErrorCode::INVALID_PARAMS,
            _ => ErrorCode::COMMUNICATION_FAILURE,
        }
    }

    /// True for faults of the physical link (handled by transport recovery).
    pub fn is_transport_fault(&self) -> bool {
        matches!(self, BusError::Timeout { .. } | BusError::Link(_))
    }
}

/// Result type alias using BusError.
pub type Result<T> = std::result::Result<T, BusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        let timeout = BusError::Timeout {
            peer: PeerId::Audio,
            what: "reply header",
        };
        assert_eq!(timeout.error_code(), ErrorCode::COMMUNICATION_FAILURE);
        assert!(timeout.is_transport_fault());

        assert_eq!(BusError::PeerBusy(PeerId::Graphics).error_code(), ErrorCode::BUSY);
        assert!(!BusError::PeerBusy(PeerId::Graphics).is_transport_fault());
        assert_eq!(
            BusError::Malformed("short".into()).error_code(),
            ErrorCode::INVALID_COMMAND
        );
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(
            BusError::QueueFull(PeerId::Graphics).to_string(),
            "Command queue for graphics is full"
        );
        assert!(BusError::PayloadTooLarge(300).to_string().contains("300"));
        assert_eq!(
            BusError::ReservedCommandId(0xFA).to_string(),
            "Command id 0xfa is reserved"
        );
    }
}
