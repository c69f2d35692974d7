//! Wire format constants and the 2-byte frame header.
//!
//! Every frame, in either direction, has the same layout:
//! ```text
//! ┌────────────┬──────────┬──────────────────────┐
//! │ Command ID │ Length   │ Payload              │
//! │ 1 byte     │ 1 byte   │ Length - 2 bytes     │
//! └────────────┴──────────┴──────────────────────┘
//! ```
//!
//! `Length` counts the whole frame, header included, so it is never below 2.
//! Multi-byte payload fields defined by this crate are Big Endian.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{BusError, Result};

/// Header size in bytes (command id + length).
pub const HEADER_SIZE: usize = 2;

/// Largest frame whose length still fits the length byte.
pub const MAX_FRAME_SIZE: usize = u8::MAX as usize;

/// Largest payload a single frame can carry: the `u8` length byte counts the
/// two header bytes too, so 255 - 2 = 253.
pub const MAX_PAYLOAD_SIZE: usize = MAX_FRAME_SIZE - HEADER_SIZE;

/// Size of ACK, ERROR and frame-boundary packets.
pub const REPLY_SIZE: usize = 4;

/// Byte a healthy peer answers a NOP ping with.
pub const PING_SENTINEL: u8 = 0xA5;

/// Reserved command ids.
///
/// Domain commands occupy every id for which [`is_reserved`](command::is_reserved)
/// returns false; the bus treats them as opaque.
pub mod command {
    /// No operation; used as the health-check ping.
    pub const NOP: u8 = 0x00;
    /// Peer soft reset (first bring-up command after a transport reset).
    pub const RESET: u8 = 0x01;
    /// Ask the peer to evict cached assets after a `MEMORY_FULL` report.
    pub const EVICT_CACHE: u8 = 0x02;
    /// Request a single frame-boundary notification.
    pub const SYNC_NOTIFY_REQUEST: u8 = 0x03;
    /// Cancel a pending single frame-boundary notification.
    pub const SYNC_NOTIFY_CANCEL: u8 = 0x04;
    /// Enable a frame-boundary notification on every frame.
    pub const FRAME_NOTIFY_ENABLE: u8 = 0x05;
    /// Disable continuous frame-boundary notifications.
    pub const FRAME_NOTIFY_DISABLE: u8 = 0x06;
    /// Clock-sync push from the host.
    pub const CLOCK_SYNC: u8 = 0xF1;
    /// Acknowledgment packet.
    pub const ACK: u8 = 0xFA;
    /// Frame-boundary notification packet.
    pub const FRAME_BOUNDARY: u8 = 0xFB;
    /// Error packet.
    pub const ERROR: u8 = 0xFE;

    /// Check if an id belongs to the protocol rather than a domain.
    #[inline]
    pub fn is_reserved(id: u8) -> bool {
        matches!(id, 0x00..=0x06 | CLOCK_SYNC | ACK | FRAME_BOUNDARY | ERROR)
    }
}

/// Error code carried in the status byte of an ERROR packet.
///
/// Kept as a transparent byte rather than an enum: code 3 is shared by
/// `INVALID_PARAMS` and `MEMORY_FULL`, and peers may send codes this crate
/// does not know.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(pub u8);

impl ErrorCode {
    /// No error (ACK status).
    pub const NONE: ErrorCode = ErrorCode(0);
    /// Peer-side operation timed out.
    pub const TIMEOUT: ErrorCode = ErrorCode(1);
    /// Unknown or malformed command id.
    pub const INVALID_COMMAND: ErrorCode = ErrorCode(2);
    /// Payload failed a domain precondition.
    pub const INVALID_PARAMS: ErrorCode = ErrorCode(3);
    /// Peer-side allocation failure (shares its value with `INVALID_PARAMS`).
    pub const MEMORY_FULL: ErrorCode = ErrorCode(3);
    /// Peer momentarily unable to accept work.
    pub const BUSY: ErrorCode = ErrorCode(4);
    /// Link unresponsive or corrupt.
    pub const COMMUNICATION_FAILURE: ErrorCode = ErrorCode(5);
    /// Peer clock lost synchronization with the host.
    pub const SYNC_LOST: ErrorCode = ErrorCode(6);

    /// Raw status byte.
    #[inline]
    pub fn as_u8(self) -> u8 {
        self.0
    }

    /// Check for the ACK status.
    #[inline]
    pub fn is_none(self) -> bool {
        self == Self::NONE
    }

    /// Human readable name.
    pub fn name(self) -> &'static str {
        match self {
            Self::NONE => "NONE",
            Self::TIMEOUT => "TIMEOUT",
            Self::INVALID_COMMAND => "INVALID_COMMAND",
            Self::MEMORY_FULL => "MEMORY_FULL/INVALID_PARAMS",
            Self::BUSY => "BUSY",
            Self::COMMUNICATION_FAILURE => "COMMUNICATION_FAILURE",
            Self::SYNC_LOST => "SYNC_LOST",
            _ => "UNKNOWN",
        }
    }
}

impl From<u8> for ErrorCode {
    fn from(value: u8) -> Self {
        ErrorCode(value)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.0)
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Command identifier.
    pub command_id: u8,
    /// Total frame length including this header.
    pub length: u8,
}

impl FrameHeader {
    /// Create a header for a payload of `payload_len` bytes.
    pub fn for_payload(command_id: u8, payload_len: usize) -> Result<Self> {
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(BusError::PayloadTooLarge(payload_len));
        }
        Ok(Self {
            command_id,
            length: (payload_len + HEADER_SIZE) as u8,
        })
    }

    /// Encode header to bytes.
    #[inline]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        [self.command_id, self.length]
    }

    /// Decode and validate a header.
    ///
    /// # Example
    ///
    /// ```
    /// use conbus::protocol::FrameHeader;
    ///
    /// let header = FrameHeader::decode([0x71, 6]).unwrap();
    /// assert_eq!(header.command_id, 0x71);
    /// assert_eq!(header.body_len(), 4);
    /// ```
    pub fn decode(buf: [u8; HEADER_SIZE]) -> Result<Self> {
        let header = Self {
            command_id: buf[0],
            length: buf[1],
        };
        header.validate()?;
        Ok(header)
    }

    /// Check that the length covers at least the header itself.
    pub fn validate(&self) -> Result<()> {
        if (self.length as usize) < HEADER_SIZE {
            return Err(BusError::Malformed(format!(
                "Frame length {} is shorter than the {}-byte header",
                self.length, HEADER_SIZE
            )));
        }
        Ok(())
    }

    /// Number of payload bytes following the header.
    #[inline]
    pub fn body_len(&self) -> usize {
        (self.length as usize).saturating_sub(HEADER_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = FrameHeader::for_payload(0x71, 4).unwrap();
        assert_eq!(header.encode(), [0x71, 6]);
    }

    #[test]
    fn test_header_rejects_short_length() {
        assert!(FrameHeader::decode([0x10, 0]).is_err());
        assert!(FrameHeader::decode([0x10, 1]).is_err());
        let empty = FrameHeader::decode([0x10, 2]).unwrap();
        assert_eq!(empty.body_len(), 0);
    }

    #[test]
    fn test_max_payload_fits_length_byte() {
        assert_eq!(MAX_PAYLOAD_SIZE, 253);
        let header = FrameHeader::for_payload(0x20, MAX_PAYLOAD_SIZE).unwrap();
        assert_eq!(header.length, u8::MAX);

        let result = FrameHeader::for_payload(0x20, MAX_PAYLOAD_SIZE + 1);
        assert!(matches!(result, Err(BusError::PayloadTooLarge(n)) if n == MAX_PAYLOAD_SIZE + 1));
    }

    #[test]
    fn test_reserved_ids() {
        for id in [0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0xF1, 0xFA, 0xFB, 0xFE] {
            assert!(command::is_reserved(id), "{id:#04x} should be reserved");
        }
        for id in [0x07, 0x10, 0x71, 0xF0, 0xFF] {
            assert!(!command::is_reserved(id), "{id:#04x} should be free");
        }
    }

    #[test]
    fn test_error_code_values() {
        assert_eq!(ErrorCode::NONE.as_u8(), 0);
        assert_eq!(ErrorCode::TIMEOUT.as_u8(), 1);
        assert_eq!(ErrorCode::INVALID_COMMAND.as_u8(), 2);
        assert_eq!(ErrorCode::INVALID_PARAMS, ErrorCode::MEMORY_FULL);
        assert_eq!(ErrorCode::BUSY.as_u8(), 4);
        assert!(ErrorCode::COMMUNICATION_FAILURE.as_u8() > 4);
        assert!(ErrorCode::SYNC_LOST.as_u8() > 4);
        assert_ne!(ErrorCode::COMMUNICATION_FAILURE, ErrorCode::SYNC_LOST);
        assert_eq!(ErrorCode(0x42).name(), "UNKNOWN");
    }
}
