//! Scripted peer for driving the host side without hardware.
//!
//! [`SimulatedPeer`] implements [`Link`] as seen from the host. It reacts to
//! the host's select line the way peer firmware does: frames written under
//! select are decoded as soon as they are complete, answered according to the
//! configured [`Behavior`], and the answer is offered by asserting ready. A
//! frame still incomplete when select is released is dropped.
//! Everything is synchronous and driven by the host's own calls, so tests are
//! fully deterministic.
//!
//! Clones share state: hand one clone to the transport and keep another to
//! inspect traffic and change behaviour mid-test.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use super::lines::{Level, Link, Polarity};
use crate::error::{BusError, Result};
use crate::protocol::{command, Command, FrameReader, Reply, PING_SENTINEL};
use crate::time::{Clock, Micros};

/// How the simulated peer answers a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Reply with ACK.
    AckAll,
    /// Never reply.
    Silent,
    /// Reply with an ERROR packet carrying this code.
    Reject(crate::protocol::ErrorCode),
}

/// A frame the host delivered, with the simulated time it arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Decoded command.
    pub command: Command,
    /// Clock reading when the last byte arrived.
    pub at: Micros,
}

struct SimState {
    polarity: Polarity,
    host_select: Level,
    serving: bool,
    ready_gap: bool,
    busy_polls: u32,
    reader: FrameReader,
    header_writes: usize,
    wrote_in_selection: bool,
    deliveries: Vec<Delivery>,
    pending: VecDeque<Vec<u8>>,
    outgoing: VecDeque<u8>,
    behavior: Behavior,
    overrides: HashMap<u8, Behavior>,
    ping_reply: Option<u8>,
    link_down: bool,
    fail_reinit: bool,
    reinit_count: usize,
    clock: Option<Arc<dyn Clock>>,
}

impl SimState {
    fn selected(&self) -> bool {
        self.polarity.is_asserted(self.host_select)
    }

    fn on_select_asserted(&mut self) {
        self.wrote_in_selection = false;
        if self.outgoing.is_empty() {
            if let Some(reply) = self.pending.pop_front() {
                self.outgoing.extend(reply);
                self.serving = true;
            }
        }
    }

    fn on_select_released(&mut self) {
        if self.serving {
            self.serving = false;
            self.ready_gap = true;
            self.outgoing.clear();
            return;
        }
        if self.wrote_in_selection && self.reader.is_mid_frame() {
            self.reader.clear();
        }
    }

    fn deliver(&mut self, frame: Command) {
        let at = self.clock.as_ref().map(|c| c.now_micros()).unwrap_or(0);
        let id = frame.id();
        self.deliveries.push(Delivery { command: frame, at });

        match id {
            command::NOP => {
                if let Some(byte) = self.ping_reply {
                    self.pending.push_back(vec![byte]);
                }
                return;
            }
            // Control commands are answered only on failure.
            id if command::is_reserved(id) => return,
            _ => {}
        }

        let behavior = self.overrides.get(&id).copied().unwrap_or(self.behavior);
        let reply = match behavior {
            Behavior::AckAll => Some(Reply::ack(id)),
            Behavior::Silent => None,
            Behavior::Reject(code) => Some(Reply::error(id, code)),
        };
        if let Some(reply) = reply {
            self.pending.push_back(reply.encode().to_vec());
        }
    }
}

/// Host-side view of a scripted peer.
#[derive(Clone)]
pub struct SimulatedPeer {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedPeer {
    /// Create a peer that ACKs everything and answers pings with the sentinel.
    pub fn new(polarity: Polarity) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                polarity,
                host_select: polarity.idle(),
                serving: false,
                ready_gap: false,
                busy_polls: 0,
                reader: FrameReader::new(),
                header_writes: 0,
                wrote_in_selection: false,
                deliveries: Vec::new(),
                pending: VecDeque::new(),
                outgoing: VecDeque::new(),
                behavior: Behavior::AckAll,
                overrides: HashMap::new(),
                ping_reply: Some(PING_SENTINEL),
                link_down: false,
                fail_reinit: false,
                reinit_count: 0,
                clock: None,
            })),
        }
    }

    /// Timestamp deliveries with this clock.
    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        self.lock().clock = Some(clock);
        self
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Default answer for every command.
    pub fn set_behavior(&self, behavior: Behavior) {
        self.lock().behavior = behavior;
    }

    /// Answer for one command id, overriding the default.
    pub fn set_behavior_for(&self, command_id: u8, behavior: Behavior) {
        self.lock().overrides.insert(command_id, behavior);
    }

    /// Byte returned to a NOP ping, or `None` to ignore pings.
    pub fn set_ping_reply(&self, reply: Option<u8>) {
        self.lock().ping_reply = reply;
    }

    /// Report select asserted (mid-transaction) for the next `polls` samples.
    pub fn set_busy_for(&self, polls: u32) {
        self.lock().busy_polls = polls;
    }

    /// Make every write fail as if the peripheral had died.
    pub fn set_link_down(&self, down: bool) {
        self.lock().link_down = down;
    }

    /// Make `reinit` fail.
    pub fn set_fail_reinit(&self, fail: bool) {
        self.lock().fail_reinit = fail;
    }

    /// Queue an unsolicited packet (e.g. an ERROR or frame boundary).
    pub fn inject(&self, reply: Reply) {
        self.lock().pending.push_back(reply.encode().to_vec());
    }

    /// Every frame delivered so far.
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.lock().deliveries.clone()
    }

    /// Every command delivered so far.
    pub fn received(&self) -> Vec<Command> {
        self.lock()
            .deliveries
            .iter()
            .map(|d| d.command.clone())
            .collect()
    }

    /// Delivery times of every frame with `command_id`.
    pub fn delivery_times(&self, command_id: u8) -> Vec<Micros> {
        self.lock()
            .deliveries
            .iter()
            .filter(|d| d.command.id() == command_id)
            .map(|d| d.at)
            .collect()
    }

    /// Number of frames delivered with `command_id`.
    pub fn count_of(&self, command_id: u8) -> usize {
        self.delivery_times(command_id).len()
    }

    /// Number of header writes seen (one per frame sent).
    pub fn header_writes(&self) -> usize {
        self.lock().header_writes
    }

    /// Number of `reinit` calls.
    pub fn reinit_count(&self) -> usize {
        self.lock().reinit_count
    }

    /// Whether the host currently asserts select.
    pub fn host_select_asserted(&self) -> bool {
        self.lock().selected()
    }

    /// Forget recorded deliveries.
    pub fn clear_deliveries(&self) {
        self.lock().deliveries.clear();
    }
}

impl Link for SimulatedPeer {
    fn drive_select(&mut self, level: Level) {
        let mut state = self.lock();
        let was = state.selected();
        state.host_select = level;
        match (was, state.selected()) {
            (false, true) => state.on_select_asserted(),
            (true, false) => state.on_select_released(),
            _ => {}
        }
    }

    fn drive_ready(&mut self, _level: Level) {}

    fn sense_select(&self) -> Level {
        let mut state = self.lock();
        let busy = state.busy_polls > 0;
        if busy && state.busy_polls != u32::MAX {
            state.busy_polls -= 1;
        }
        state.polarity.level(busy)
    }

    fn sense_ready(&self) -> Level {
        let mut state = self.lock();
        // Ready drops for one sample between back-to-back replies.
        if state.ready_gap {
            state.ready_gap = false;
            return state.polarity.idle();
        }
        let ready = state.serving || !state.pending.is_empty();
        state.polarity.level(ready)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let mut state = self.lock();
        if state.link_down {
            return Err(BusError::Link("simulated peripheral fault".to_string()));
        }
        if !state.selected() {
            return Ok(());
        }
        if !state.reader.is_mid_frame() {
            state.header_writes += 1;
        }
        state.wrote_in_selection = true;
        let frames = state.reader.push(bytes)?;
        for frame in frames {
            state.deliver(frame);
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.lock();
        if !state.selected() {
            return Ok(0);
        }
        let n = buf.len().min(state.outgoing.len());
        for (slot, byte) in buf.iter_mut().zip(state.outgoing.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn reinit(&mut self) -> Result<()> {
        let mut state = self.lock();
        state.reinit_count += 1;
        state.reader.clear();
        state.pending.clear();
        state.outgoing.clear();
        state.serving = false;
        state.ready_gap = false;
        if state.fail_reinit {
            return Err(BusError::Link("simulated reinit failure".to_string()));
        }
        state.link_down = false;
        Ok(())
    }
}
