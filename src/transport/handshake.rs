//! Select/ready handshake over a half-duplex link.
//!
//! The serial primitive has no notion of "the peer wants to talk", so every
//! transaction is framed by the control lines and every wait has a deadline.
//!
//! Host → peer command:
//! ```text
//! host:  wait peer select+ready idle (busy spin) ─► assert select ─► header ─► body ─► release select
//! ```
//!
//! Peer → host reply:
//! ```text
//! peer:  wait host select idle ─► assert ready ─► wait host select (reply timeout)
//!        ─► write reply ─► wait host select idle ─► release ready
//! host:  sees ready ─► assert select ─► read header ─► read body ─► release select
//! ```
//!
//! A peer that never sees the host select abandons its reply; the host's
//! retry timer covers the lost ACK.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::lines::{Link, Polarity};
use crate::error::{BusError, Result};
use crate::peer::PeerId;
use crate::protocol::{
    command, Command, FrameHeader, FrameReader, Reply, HEADER_SIZE, MAX_FRAME_SIZE, REPLY_SIZE,
};
use crate::time::{micros, wait_until, Clock};

/// Default spin while the peer is mid-transaction.
pub const DEFAULT_BUSY_WAIT: Duration = Duration::from_millis(1);

/// Default wait for the far end to answer a ready/select transition.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_millis(10);

/// Default wait for bytes once a transfer is selected.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(2);

/// Handshake timing and line polarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    /// How long the host spins on a busy peer before `PeerBusy`.
    pub busy_wait: Duration,
    /// How long a ready/select transition may take.
    pub reply_timeout: Duration,
    /// How long a selected transfer may stall between bytes.
    pub read_timeout: Duration,
    /// Control-line polarity.
    pub polarity: Polarity,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            busy_wait: DEFAULT_BUSY_WAIT,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            polarity: Polarity::default(),
        }
    }
}

/// Fill `buf` from the link, failing once `timeout` passes without progress.
fn read_exact<L: Link>(
    link: &mut L,
    clock: &dyn Clock,
    timeout: Duration,
    buf: &mut [u8],
    peer: PeerId,
    what: &'static str,
) -> Result<()> {
    let mut filled = 0;
    let mut deadline = clock.now_micros().saturating_add(micros(timeout));
    while filled < buf.len() {
        let n = link.read(&mut buf[filled..])?;
        if n > 0 {
            filled += n;
            deadline = clock.now_micros().saturating_add(micros(timeout));
            continue;
        }
        if clock.now_micros() >= deadline {
            return Err(BusError::Timeout { peer, what });
        }
        clock.relax();
    }
    Ok(())
}

/// Host (master) side of one link.
pub struct HostTransport<L> {
    peer: PeerId,
    link: L,
    clock: Arc<dyn Clock>,
    config: TransportConfig,
}

impl<L: Link> HostTransport<L> {
    /// Wrap a link and release both control lines.
    pub fn new(peer: PeerId, link: L, clock: Arc<dyn Clock>, config: TransportConfig) -> Self {
        let mut transport = Self {
            peer,
            link,
            clock,
            config,
        };
        transport.release_lines();
        transport
    }

    /// Peer on the other end.
    #[inline]
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Handshake configuration.
    #[inline]
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Underlying link.
    pub fn link(&self) -> &L {
        &self.link
    }

    /// Underlying link (mutable).
    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    fn select(&mut self, asserted: bool) {
        let level = self.config.polarity.level(asserted);
        self.link.drive_select(level);
    }

    fn release_lines(&mut self) {
        let idle = self.config.polarity.idle();
        self.link.drive_select(idle);
        self.link.drive_ready(idle);
    }

    /// Peer is driving its select line.
    pub fn peer_selecting(&self) -> bool {
        self.config.polarity.is_asserted(self.link.sense_select())
    }

    /// Peer is driving its ready line.
    pub fn peer_ready(&self) -> bool {
        self.config.polarity.is_asserted(self.link.sense_ready())
    }

    /// Neither peer line is asserted.
    pub fn is_peer_idle(&self) -> bool {
        !self.peer_selecting() && !self.peer_ready()
    }

    /// Peer has a reply waiting to be clocked out.
    pub fn has_pending_reply(&self) -> bool {
        self.peer_ready() && !self.peer_selecting()
    }

    /// Send one encoded frame: header then body as two writes under select.
    ///
    /// # Errors
    ///
    /// `PeerBusy` if the peer stays mid-transaction for the whole busy spin;
    /// link errors from the writes (select is released either way).
    pub fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        if frame.len() < HEADER_SIZE || frame.len() > MAX_FRAME_SIZE {
            return Err(BusError::Malformed(format!(
                "Cannot send a {}-byte frame",
                frame.len()
            )));
        }

        if !wait_until(&*self.clock, self.config.busy_wait, || self.is_peer_idle()) {
            return Err(BusError::PeerBusy(self.peer));
        }

        self.select(true);
        let result = self
            .link
            .write(&frame[..HEADER_SIZE])
            .and_then(|_| match &frame[HEADER_SIZE..] {
                [] => Ok(()),
                body => self.link.write(body),
            });
        self.select(false);
        result
    }

    /// Clock out a pending reply, if the peer has one.
    ///
    /// Returns `Ok(None)` when the peer's ready line is not asserted.
    pub fn poll_reply(&mut self) -> Result<Option<Reply>> {
        if !self.has_pending_reply() {
            return Ok(None);
        }

        self.discard_stale()?;
        self.select(true);
        let result = self.read_reply();
        self.select(false);
        self.wait_ready_released();

        if let Err(e) = &result {
            warn!("Dropping reply from {}: {}", self.peer, e);
        }
        result.map(Some)
    }

    /// Drop bytes the peer clocked out while no read was selected, such as a
    /// reply that raced with one of our own transmissions.
    fn discard_stale(&mut self) -> Result<()> {
        let mut scratch = [0u8; MAX_FRAME_SIZE];
        let mut dropped = 0;
        loop {
            let n = self.link.read(&mut scratch)?;
            if n == 0 {
                break;
            }
            dropped += n;
        }
        if dropped > 0 {
            debug!("Discarded {} stale bytes on {} link", dropped, self.peer);
        }
        Ok(())
    }

    /// Give the peer a bounded moment to drop ready after a read, so the next
    /// poll does not mistake the finished reply for a new one.
    fn wait_ready_released(&self) {
        wait_until(&*self.clock, self.config.reply_timeout, || !self.peer_ready());
    }

    fn read_reply(&mut self) -> Result<Reply> {
        let mut header = [0u8; HEADER_SIZE];
        read_exact(
            &mut self.link,
            &*self.clock,
            self.config.read_timeout,
            &mut header,
            self.peer,
            "reply header",
        )?;
        let header = FrameHeader::decode(header)?;

        // Consume the declared body even for unexpected packets so the next
        // transaction starts on a frame boundary.
        let mut body = [0u8; MAX_FRAME_SIZE];
        let body = &mut body[..header.body_len()];
        read_exact(
            &mut self.link,
            &*self.clock,
            self.config.read_timeout,
            body,
            self.peer,
            "reply body",
        )?;

        if header.length as usize != REPLY_SIZE {
            return Err(BusError::Malformed(format!(
                "Reply {:#04x} has length {}",
                header.command_id, header.length
            )));
        }
        Reply::decode([header.command_id, header.length, body[0], body[1]])
    }

    /// Health ping: send NOP and read back one sentinel byte.
    pub fn ping(&mut self, timeout: Duration) -> Result<u8> {
        self.discard_stale()?;
        self.send_frame(&Command::empty(command::NOP).encode())?;

        if !wait_until(&*self.clock, timeout, || self.peer_ready()) {
            return Err(BusError::Timeout {
                peer: self.peer,
                what: "ping reply",
            });
        }

        self.select(true);
        let mut sentinel = [0u8; 1];
        let result = read_exact(
            &mut self.link,
            &*self.clock,
            timeout,
            &mut sentinel,
            self.peer,
            "ping sentinel",
        );
        self.select(false);
        self.wait_ready_released();
        result.map(|_| sentinel[0])
    }

    /// Release both control lines and reinitialize the serial peripheral.
    pub fn reset(&mut self) -> Result<()> {
        debug!("Resetting {} link", self.peer);
        self.release_lines();
        self.link.reinit()
    }
}

/// Peer (slave) side of one link.
pub struct PeerTransport<L> {
    peer: PeerId,
    link: L,
    clock: Arc<dyn Clock>,
    config: TransportConfig,
    reader: FrameReader,
}

impl<L: Link> PeerTransport<L> {
    /// Wrap a link and release both control lines.
    pub fn new(peer: PeerId, link: L, clock: Arc<dyn Clock>, config: TransportConfig) -> Self {
        let mut transport = Self {
            peer,
            link,
            clock,
            config,
            reader: FrameReader::new(),
        };
        let idle = transport.config.polarity.idle();
        transport.link.drive_select(idle);
        transport.link.drive_ready(idle);
        transport
    }

    /// Which peer this end belongs to.
    #[inline]
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Underlying link.
    pub fn link(&self) -> &L {
        &self.link
    }

    fn ready(&mut self, asserted: bool) {
        let level = self.config.polarity.level(asserted);
        self.link.drive_ready(level);
    }

    /// Host is driving its select line.
    pub fn host_selecting(&self) -> bool {
        self.config.polarity.is_asserted(self.link.sense_select())
    }

    /// Receive every frame the host has written.
    ///
    /// Bytes clocked in during a selection that ended before this call are
    /// still buffered by the peripheral and are decoded first. While the host
    /// keeps select asserted the read continues, bounded by the reply
    /// timeout. A frame cut short by the host releasing select is discarded.
    pub fn receive(&mut self) -> Result<Vec<Command>> {
        let mut commands = Vec::new();
        let mut buf = [0u8; 64];
        let mut deadline = self
            .clock
            .now_micros()
            .saturating_add(micros(self.config.reply_timeout));
        loop {
            let n = self.link.read(&mut buf)?;
            if n > 0 {
                self.absorb(&buf[..n], &mut commands);
                deadline = self
                    .clock
                    .now_micros()
                    .saturating_add(micros(self.config.reply_timeout));
                continue;
            }
            if !self.host_selecting() {
                // Bytes may land between the last read and the release.
                let n = self.link.read(&mut buf)?;
                if n > 0 {
                    self.absorb(&buf[..n], &mut commands);
                }
                break;
            }
            if self.clock.now_micros() >= deadline {
                break;
            }
            self.clock.relax();
        }

        if self.reader.is_mid_frame() && !self.host_selecting() {
            warn!(
                "Discarding {} bytes of a truncated frame on {} link",
                self.reader.len(),
                self.peer
            );
            self.reader.clear();
        }
        Ok(commands)
    }

    fn absorb(&mut self, data: &[u8], commands: &mut Vec<Command>) {
        if let Err(e) = self.reader.push_into(data, commands) {
            warn!("Dropping unframed bytes on {} link: {}", self.peer, e);
        }
    }

    /// Send an ACK/ERROR/frame-boundary packet to the host.
    ///
    /// Returns `Ok(false)` when the host never selected and the reply was
    /// abandoned.
    pub fn send_reply(&mut self, reply: &Reply) -> Result<bool> {
        self.send_raw(&reply.encode())
    }

    /// Ready/select handshake around an arbitrary short payload.
    pub fn send_raw(&mut self, bytes: &[u8]) -> Result<bool> {
        let timeout = self.config.reply_timeout;

        if !wait_until(&*self.clock, timeout, || !self.host_selecting()) {
            debug!("Host never released select on {} link; reply abandoned", self.peer);
            return Ok(false);
        }

        self.ready(true);

        if !wait_until(&*self.clock, timeout, || self.host_selecting()) {
            self.ready(false);
            debug!("Host did not collect reply on {} link; abandoned", self.peer);
            return Ok(false);
        }

        let written = self.link.write(bytes);

        // Keep ready asserted until the host has finished reading.
        let released = wait_until(&*self.clock, timeout, || !self.host_selecting());
        self.ready(false);
        if !released {
            warn!("Host held select past the reply on {} link", self.peer);
        }
        written.map(|_| true)
    }

    /// Release both control lines, reinitialize the peripheral and drop any
    /// partially received frame.
    pub fn reset(&mut self) -> Result<()> {
        let idle = self.config.polarity.idle();
        self.link.drive_select(idle);
        self.link.drive_ready(idle);
        self.reader.clear();
        self.link.reinit()
    }
}
