//! Protocol module - wire format, frame codec and reply packets.
//!
//! This module implements the frame codec shared by host and peers:
//! - 2-byte header (`command id`, `total length`) encoding/decoding
//! - [`FrameReader`] for frames arriving a few bytes at a time
//! - 4-byte [`Reply`] packets (ACK, ERROR, frame boundary)
//! - the [`ErrorCode`] byte and reserved command ids

mod frame;
mod frame_buffer;
mod wire_format;

pub use frame::{decode, encode, Command, Reply, ReplyKind};
pub use frame_buffer::FrameReader;
pub use wire_format::{
    command, ErrorCode, FrameHeader, HEADER_SIZE, MAX_FRAME_SIZE, MAX_PAYLOAD_SIZE, PING_SENTINEL,
    REPLY_SIZE,
};
