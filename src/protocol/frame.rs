//! Commands and reply packets.
//!
//! A [`Command`] is one complete frame as placed on the wire. Its payload is a
//! `bytes::Bytes`, so a queued command and its retransmissions share a single
//! buffer.
//!
//! # Example
//!
//! ```
//! use conbus::protocol::{decode, encode, Command};
//!
//! let frame = encode(0x71, &[0, 1, 64, 200]).unwrap();
//! assert_eq!(&frame[..], &[0x71, 6, 0, 1, 64, 200]);
//!
//! let command = decode(&frame).unwrap();
//! assert_eq!(command.id(), 0x71);
//! assert_eq!(command.payload(), &[0, 1, 64, 200]);
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::wire_format::{command, ErrorCode, FrameHeader, HEADER_SIZE, REPLY_SIZE};
use crate::error::{BusError, Result};

/// A command frame: id, length and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    header: FrameHeader,
    payload: Bytes,
}

impl Command {
    /// Create a command, rejecting payloads that do not fit one frame.
    pub fn new(command_id: u8, payload: impl Into<Bytes>) -> Result<Self> {
        let payload = payload.into();
        let header = FrameHeader::for_payload(command_id, payload.len())?;
        Ok(Self { header, payload })
    }

    /// Create a command with no payload.
    pub fn empty(command_id: u8) -> Self {
        Self {
            header: FrameHeader {
                command_id,
                length: HEADER_SIZE as u8,
            },
            payload: Bytes::new(),
        }
    }

    /// Build from an already-validated header and its body.
    pub fn from_parts(header: FrameHeader, body: Bytes) -> Result<Self> {
        header.validate()?;
        if body.len() != header.body_len() {
            return Err(BusError::Malformed(format!(
                "Frame declares {} payload bytes but {} were read",
                header.body_len(),
                body.len()
            )));
        }
        Ok(Self {
            header,
            payload: body,
        })
    }

    /// Command id.
    #[inline]
    pub fn id(&self) -> u8 {
        self.header.command_id
    }

    /// Total frame length including the header.
    #[inline]
    pub fn length(&self) -> u8 {
        self.header.length
    }

    /// Decoded header.
    #[inline]
    pub fn header(&self) -> FrameHeader {
        self.header
    }

    /// Payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Cheap clone of the payload.
    #[inline]
    pub fn payload_bytes(&self) -> Bytes {
        self.payload.clone()
    }

    /// Check if the id is protocol-reserved.
    #[inline]
    pub fn is_reserved(&self) -> bool {
        command::is_reserved(self.header.command_id)
    }

    /// Encode the whole frame into one contiguous buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.header.length as usize);
        buf.put_slice(&self.header.encode());
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// Encode a frame from an id and payload.
pub fn encode(command_id: u8, payload: &[u8]) -> Result<Bytes> {
    Ok(Command::new(command_id, Bytes::copy_from_slice(payload))?.encode())
}

/// Decode one complete frame held in a single buffer.
///
/// The header is read first and decides how many body bytes follow; trailing
/// bytes beyond the declared length are rejected.
pub fn decode(bytes: &[u8]) -> Result<Command> {
    if bytes.len() < HEADER_SIZE {
        return Err(BusError::Malformed(format!(
            "Need {} header bytes, got {}",
            HEADER_SIZE,
            bytes.len()
        )));
    }
    let header = FrameHeader::decode([bytes[0], bytes[1]])?;
    Command::from_parts(header, Bytes::copy_from_slice(&bytes[HEADER_SIZE..]))
}

/// Kind of a fixed-size packet sent from a peer to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// Command executed.
    Ack,
    /// Command rejected or failed.
    Error,
    /// Peer reached a frame boundary.
    FrameBoundary,
}

impl ReplyKind {
    fn id(self) -> u8 {
        match self {
            ReplyKind::Ack => command::ACK,
            ReplyKind::Error => command::ERROR,
            ReplyKind::FrameBoundary => command::FRAME_BOUNDARY,
        }
    }

    /// Map a first byte to a reply kind.
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            command::ACK => Some(ReplyKind::Ack),
            command::ERROR => Some(ReplyKind::Error),
            command::FRAME_BOUNDARY => Some(ReplyKind::FrameBoundary),
            _ => None,
        }
    }
}

/// A 4-byte reply: `[kind, 4, original_command_id, status]`.
///
/// For frame-boundary packets the third byte is the low byte of the peer's
/// frame counter and the status is zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    /// Packet kind.
    pub kind: ReplyKind,
    /// Command being answered.
    pub command_id: u8,
    /// `NONE` for ACK, the failure reason for ERROR.
    pub status: ErrorCode,
}

impl Reply {
    /// Acknowledge a command.
    pub fn ack(command_id: u8) -> Self {
        Self {
            kind: ReplyKind::Ack,
            command_id,
            status: ErrorCode::NONE,
        }
    }

    /// Report a failed command.
    pub fn error(command_id: u8, code: ErrorCode) -> Self {
        Self {
            kind: ReplyKind::Error,
            command_id,
            status: code,
        }
    }

    /// Frame-boundary notification.
    pub fn frame_boundary(frame_counter: u32) -> Self {
        Self {
            kind: ReplyKind::FrameBoundary,
            command_id: frame_counter as u8,
            status: ErrorCode::NONE,
        }
    }

    /// Encode to the fixed wire layout.
    pub fn encode(&self) -> [u8; REPLY_SIZE] {
        [
            self.kind.id(),
            REPLY_SIZE as u8,
            self.command_id,
            self.status.as_u8(),
        ]
    }

    /// Decode from the fixed wire layout.
    ///
    /// # Example
    ///
    /// ```
    /// use conbus::protocol::{ErrorCode, Reply, ReplyKind};
    ///
    /// let reply = Reply::decode([0xFE, 0x04, 0x71, 3]).unwrap();
    /// assert_eq!(reply.kind, ReplyKind::Error);
    /// assert_eq!(reply.status, ErrorCode::MEMORY_FULL);
    /// ```
    pub fn decode(buf: [u8; REPLY_SIZE]) -> Result<Self> {
        let kind = ReplyKind::from_id(buf[0]).ok_or_else(|| {
            BusError::Malformed(format!("Unknown reply kind {:#04x}", buf[0]))
        })?;
        if buf[1] as usize != REPLY_SIZE {
            return Err(BusError::Malformed(format!(
                "Reply length must be {}, got {}",
                REPLY_SIZE, buf[1]
            )));
        }
        let status = ErrorCode(buf[3]);
        if kind == ReplyKind::Ack && !status.is_none() {
            return Err(BusError::Malformed(format!(
                "ACK carries non-zero status {}",
                status
            )));
        }
        Ok(Self {
            kind,
            command_id: buf[2],
            status,
        })
    }
}
