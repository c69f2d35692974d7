//! Incremental frame reader for bytes delivered on demand.
//!
//! The serial link only hands over bytes while the master clocks them, so a
//! frame can arrive split anywhere. The reader is a two-state machine:
//! - `WaitingForHeader`: need the 2 header bytes
//! - `WaitingForBody`: header parsed, need `length - 2` more bytes
//!
//! # Example
//!
//! ```
//! use conbus::protocol::FrameReader;
//!
//! let mut reader = FrameReader::new();
//! assert!(reader.push(&[0x71, 6, 0]).unwrap().is_empty());
//!
//! let commands = reader.push(&[1, 64, 200]).unwrap();
//! assert_eq!(commands.len(), 1);
//! assert_eq!(commands[0].payload(), &[0, 1, 64, 200]);
//! ```

use bytes::BytesMut;

use super::wire_format::{FrameHeader, HEADER_SIZE, MAX_FRAME_SIZE};
use super::Command;
use crate::error::Result;

/// State machine for frame parsing.
#[derive(Debug, Clone, Copy)]
enum State {
    /// Waiting for the 2 header bytes.
    WaitingForHeader,
    /// Header parsed, waiting for body bytes.
    WaitingForBody { header: FrameHeader },
}

/// Accumulates link bytes and extracts complete commands.
#[derive(Debug)]
pub struct FrameReader {
    buffer: BytesMut,
    state: State,
}

impl FrameReader {
    /// Create an empty reader sized for one maximum frame.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(MAX_FRAME_SIZE),
            state: State::WaitingForHeader,
        }
    }

    /// Push bytes and extract all complete commands.
    ///
    /// # Errors
    ///
    /// Returns `Malformed` if a header declares a length below 2. The reader
    /// is cleared in that case, since the byte stream has lost framing.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Command>> {
        let mut commands = Vec::new();
        self.push_into(data, &mut commands)?;
        Ok(commands)
    }

    /// Like [`push`](Self::push), appending to `out`. Commands completed
    /// before a framing error stay in `out`.
    pub fn push_into(&mut self, data: &[u8], out: &mut Vec<Command>) -> Result<()> {
        self.buffer.extend_from_slice(data);

        loop {
            match self.try_extract_one() {
                Ok(Some(command)) => out.push(command),
                Ok(None) => return Ok(()),
                Err(e) => {
                    self.clear();
                    return Err(e);
                }
            }
        }
    }

    /// Try to extract a single command from the buffer.
    fn try_extract_one(&mut self) -> Result<Option<Command>> {
        match self.state {
            State::WaitingForHeader => {
                if self.buffer.len() < HEADER_SIZE {
                    return Ok(None);
                }

                let header = FrameHeader::decode([self.buffer[0], self.buffer[1]])?;
                let _ = self.buffer.split_to(HEADER_SIZE);

                self.state = State::WaitingForBody { header };
                self.try_extract_one()
            }

            State::WaitingForBody { header } => {
                let body_len = header.body_len();
                if self.buffer.len() < body_len {
                    return Ok(None);
                }

                let body = self.buffer.split_to(body_len).freeze();
                self.state = State::WaitingForHeader;

                Command::from_parts(header, body).map(Some)
            }
        }
    }

    /// Bytes needed before the next state transition can happen.
    pub fn bytes_wanted(&self) -> usize {
        match self.state {
            State::WaitingForHeader => HEADER_SIZE.saturating_sub(self.buffer.len()),
            State::WaitingForBody { header } => header.body_len().saturating_sub(self.buffer.len()),
        }
    }

    /// True when a frame has been started but not finished.
    pub fn is_mid_frame(&self) -> bool {
        !self.buffer.is_empty() || matches!(self.state, State::WaitingForBody { .. })
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drop buffered bytes and return to `WaitingForHeader`.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForHeader;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForBody { .. } => "WaitingForBody",
        }
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BusError;
    use crate::protocol::encode;

    #[test]
    fn test_single_complete_frame() {
        let mut reader = FrameReader::new();
        let frame = encode(0x40, b"draw").unwrap();

        let commands = reader.push(&frame).unwrap();

        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].id(), 0x40);
        assert_eq!(commands[0].payload(), b"draw");
        assert!(reader.is_empty());
        assert!(!reader.is_mid_frame());
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut reader = FrameReader::new();
        let mut data = Vec::new();
        data.extend_from_slice(&encode(0x10, b"a").unwrap());
        data.extend_from_slice(&encode(0x11, b"").unwrap());
        data.extend_from_slice(&encode(0x12, b"ccc").unwrap());

        let commands = reader.push(&data).unwrap();

        let ids: Vec<u8> = commands.iter().map(|c| c.id()).collect();
        assert_eq!(ids, vec![0x10, 0x11, 0x12]);
        assert_eq!(commands[1].payload().len(), 0);
    }

    #[test]
    fn test_push_into_keeps_frames_before_bad_header() {
        let mut reader = FrameReader::new();
        let mut data = encode(0x10, b"ok").unwrap().to_vec();
        data.extend_from_slice(&[0x11, 1, 0xAA]);

        let mut commands = Vec::new();
        let result = reader.push_into(&data, &mut commands);

        assert!(matches!(result, Err(BusError::Malformed(_))));
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].id(), 0x10);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_header_then_body() {
        let mut reader = FrameReader::new();
        let frame = encode(0x71, &[0, 1, 64, 200]).unwrap();

        assert!(reader.push(&frame[..1]).unwrap().is_empty());
        assert_eq!(reader.state_name(), "WaitingForHeader");
        assert_eq!(reader.bytes_wanted(), 1);

        assert!(reader.push(&frame[1..2]).unwrap().is_empty());
        assert_eq!(reader.state_name(), "WaitingForBody");
        assert_eq!(reader.bytes_wanted(), 4);
        assert!(reader.is_mid_frame());

        let commands = reader.push(&frame[2..]).unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(reader.state_name(), "WaitingForHeader");
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut reader = FrameReader::new();
        let frame = encode(0x22, b"hi").unwrap();

        let mut all = Vec::new();
        for byte in frame.iter() {
            all.extend(reader.push(&[*byte]).unwrap());
        }

        assert_eq!(all.len(), 1);
        assert_eq!(all[0].payload(), b"hi");
    }

    #[test]
    fn test_short_length_clears_reader() {
        let mut reader = FrameReader::new();

        let result = reader.push(&[0x22, 1, 0x99]);

        assert!(matches!(result, Err(BusError::Malformed(_))));
        assert!(reader.is_empty());
        assert_eq!(reader.state_name(), "WaitingForHeader");
    }

    #[test]
    fn test_clear_resets_state() {
        let mut reader = FrameReader::new();
        reader.push(&[0x22, 10, 1, 2]).unwrap();
        assert_eq!(reader.state_name(), "WaitingForBody");

        reader.clear();

        assert_eq!(reader.state_name(), "WaitingForHeader");
        assert!(!reader.is_mid_frame());
    }
}
