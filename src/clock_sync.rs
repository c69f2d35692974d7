//! Master clock distribution.
//!
//! The host periodically pushes a `CLOCK_SYNC` frame carrying its frame
//! counter and microsecond timestamp. Each peer keeps the difference between
//! that timestamp and its own clock and derives master time from it until the
//! next push.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use tracing::debug;

use crate::error::{BusError, Result};
use crate::protocol::{command, Command};
use crate::time::{micros, Clock, Micros};

/// Default period between sync pushes.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_millis(1000);

/// Size of the sync payload: u32 frame counter + u64 timestamp.
pub const SYNC_PAYLOAD_SIZE: usize = 12;

/// Body of a `CLOCK_SYNC` frame, big-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPayload {
    /// Host frame counter.
    pub frame_counter: u32,
    /// Host time in microseconds.
    pub timestamp_us: u64,
}

impl SyncPayload {
    /// Encode to the 12-byte payload.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(SYNC_PAYLOAD_SIZE);
        buf.put_u32(self.frame_counter);
        buf.put_u64(self.timestamp_us);
        buf.freeze()
    }

    /// Decode a received payload.
    pub fn decode(mut payload: &[u8]) -> Result<Self> {
        if payload.len() != SYNC_PAYLOAD_SIZE {
            return Err(BusError::Malformed(format!(
                "Clock sync payload must be {} bytes, got {}",
                SYNC_PAYLOAD_SIZE,
                payload.len()
            )));
        }
        Ok(Self {
            frame_counter: payload.get_u32(),
            timestamp_us: payload.get_u64(),
        })
    }

    /// Wrap in a `CLOCK_SYNC` command.
    pub fn to_command(&self) -> Result<Command> {
        Command::new(command::CLOCK_SYNC, self.encode())
    }
}

/// Peer-side synchronization state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClockSyncState {
    /// Frame counter adopted from the latest sync.
    pub frame_counter: u32,
    /// Host timestamp carried by the latest sync.
    pub master_timestamp: u64,
    /// `master_timestamp - local time at receipt`.
    pub local_offset: i64,
    /// At least one sync received since start or the last reset.
    pub synced: bool,
}

/// Peer-side view of master time.
pub struct ClockSync {
    state: ClockSyncState,
    clock: Arc<dyn Clock>,
}

impl ClockSync {
    /// Start unsynchronized (offset zero).
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: ClockSyncState::default(),
            clock,
        }
    }

    /// Current state, for diagnostics.
    pub fn state(&self) -> ClockSyncState {
        self.state
    }

    /// Apply a received sync.
    pub fn on_sync(&mut self, sync: SyncPayload) {
        let local = self.clock.now_micros();
        self.state = ClockSyncState {
            frame_counter: sync.frame_counter,
            master_timestamp: sync.timestamp_us,
            local_offset: to_signed(sync.timestamp_us).saturating_sub(to_signed(local)),
            synced: true,
        };
        debug!(
            "Clock sync: frame {} offset {}us",
            sync.frame_counter, self.state.local_offset
        );
    }

    /// Host time estimate: local time plus the stored offset, never negative.
    pub fn master_time(&self) -> Micros {
        let local = to_signed(self.clock.now_micros());
        local.saturating_add(self.state.local_offset).max(0) as Micros
    }

    /// Frame counter from the latest sync.
    pub fn frame_counter(&self) -> u32 {
        self.state.frame_counter
    }

    /// Forget the offset after losing synchronization.
    pub fn reset(&mut self) {
        self.state.local_offset = 0;
        self.state.synced = false;
    }
}

fn to_signed(us: Micros) -> i64 {
    i64::try_from(us).unwrap_or(i64::MAX)
}

/// Host-side schedule for sync pushes.
#[derive(Debug, Clone)]
pub struct SyncScheduler {
    interval: Micros,
    last_sent: Option<Micros>,
    forced: bool,
}

impl SyncScheduler {
    /// Push every `interval`; the first push is due immediately.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: micros(interval),
            last_sent: None,
            forced: false,
        }
    }

    /// Whether a push should go out at `now`.
    pub fn due(&self, now: Micros) -> bool {
        self.forced
            || self
                .last_sent
                .map_or(true, |last| now.saturating_sub(last) >= self.interval)
    }

    /// Make the next check due regardless of the interval.
    pub fn force(&mut self) {
        self.forced = true;
    }

    /// Record a push at `now`.
    pub fn mark_sent(&mut self, now: Micros) {
        self.last_sent = Some(now);
        self.forced = false;
    }
}

impl Default for SyncScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_SYNC_INTERVAL)
    }
}
