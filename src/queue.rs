//! Per-peer outbound command queue.
//!
//! A fixed-capacity circular buffer of [`QueueEntry`]. The application side
//! appends at the tail; the service side inspects and removes at the head.
//! A full queue rejects new work with [`BusError::QueueFull`] and is left
//! untouched: nothing blocks and nothing is evicted. A closed queue (its peer
//! was given up on) rejects with [`BusError::PeerFailed`].
//!
//! The head entry is the only one that can be on the wire. An entry that
//! needs an ACK stays at the head from its first transmission until it is
//! acknowledged or fails permanently.

use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;

use crate::error::{BusError, Result};
use crate::peer::PeerId;
use crate::protocol::Command;
use crate::time::Micros;

/// Default number of entries per peer.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Lifecycle of a queued command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Waiting for its first transmission.
    Queued,
    /// On the wire, waiting for an ACK.
    Sent,
    /// Acknowledged; removed on the next service tick.
    Acked,
    /// Retries exhausted.
    FailedPermanently,
}

/// One command waiting in a peer's queue.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    /// Monotonic per-queue sequence number.
    pub seq: u64,
    /// The command.
    pub command: Command,
    frame: Bytes,
    /// Whether the peer must acknowledge it.
    pub requires_ack: bool,
    /// Enqueue time, then the time of the latest transmission.
    pub enqueued_at: Micros,
    /// Retransmissions so far.
    pub retry_count: u8,
    /// Current state.
    pub state: EntryState,
}

impl QueueEntry {
    /// Acknowledged or permanently failed.
    #[inline]
    pub fn completed(&self) -> bool {
        matches!(self.state, EntryState::Acked | EntryState::FailedPermanently)
    }

    /// Needs an ACK it has not received yet.
    #[inline]
    pub fn awaiting_ack(&self) -> bool {
        self.requires_ack && !self.completed()
    }

    /// Encoded frame; every retransmission reuses these exact bytes.
    #[inline]
    pub fn frame(&self) -> &Bytes {
        &self.frame
    }

    /// Command id shortcut.
    #[inline]
    pub fn command_id(&self) -> u8 {
        self.command.id()
    }
}

/// Fixed-capacity FIFO of commands for one peer.
#[derive(Debug)]
pub struct CommandQueue {
    peer: PeerId,
    slots: Vec<Option<QueueEntry>>,
    head: usize,
    tail: usize,
    count: usize,
    next_seq: u64,
    closed: bool,
}

impl CommandQueue {
    /// Create an empty queue. A zero capacity is raised to one.
    pub fn new(peer: PeerId, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            peer,
            slots: (0..capacity).map(|_| None).collect(),
            head: 0,
            tail: 0,
            count: 0,
            next_seq: 0,
            closed: false,
        }
    }

    /// Peer this queue feeds.
    #[inline]
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Maximum number of entries.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Current number of entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    /// Check if empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Check if at capacity.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.count == self.capacity()
    }

    /// Refuse all further enqueues. Permanent.
    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Whether [`close`](Self::close) has been called.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Append a command.
    ///
    /// Returns the entry's sequence number, or `PeerFailed` / `QueueFull`
    /// without touching the queue.
    pub fn enqueue(&mut self, command: Command, requires_ack: bool, now: Micros) -> Result<u64> {
        if self.closed {
            return Err(BusError::PeerFailed(self.peer));
        }
        if self.is_full() {
            return Err(BusError::QueueFull(self.peer));
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let frame = command.encode();
        self.slots[self.tail] = Some(QueueEntry {
            seq,
            command,
            frame,
            requires_ack,
            enqueued_at: now,
            retry_count: 0,
            state: EntryState::Queued,
        });
        self.tail = (self.tail + 1) % self.capacity();
        self.count += 1;
        Ok(seq)
    }

    /// Oldest entry.
    pub fn head(&self) -> Option<&QueueEntry> {
        if self.is_empty() {
            return None;
        }
        self.slots[self.head].as_ref()
    }

    /// Oldest entry (mutable).
    pub fn head_mut(&mut self) -> Option<&mut QueueEntry> {
        if self.is_empty() {
            return None;
        }
        self.slots[self.head].as_mut()
    }

    /// Remove and return the head unless it is still waiting for an ACK.
    ///
    /// Fire-and-forget entries and completed entries come out; an entry that
    /// requires an ACK and has not completed keeps the head, so at most one
    /// acknowledged command is in flight per peer.
    pub fn dequeue_ready(&mut self) -> Option<QueueEntry> {
        if self.head()?.awaiting_ack() {
            return None;
        }
        self.pop_head()
    }

    /// Remove and return the head regardless of its state.
    pub fn pop_head(&mut self) -> Option<QueueEntry> {
        if self.is_empty() {
            return None;
        }
        let entry = self.slots[self.head].take();
        self.head = (self.head + 1) % self.capacity();
        self.count -= 1;
        entry
    }

    /// Find the oldest transmitted entry with `command_id` still waiting for
    /// its ACK.
    pub fn find_pending_mut(&mut self, command_id: u8) -> Option<&mut QueueEntry> {
        let capacity = self.capacity();
        let head = self.head;
        let count = self.count;
        let index = (0..count).map(|i| (head + i) % capacity).find(|&i| {
            self.slots[i].as_ref().is_some_and(|e| {
                e.command_id() == command_id && e.requires_ack && e.state == EntryState::Sent
            })
        })?;
        self.slots[index].as_mut()
    }

    /// Iterate entries from head to tail.
    pub fn iter(&self) -> impl Iterator<Item = &QueueEntry> + '_ {
        let capacity = self.capacity();
        (0..self.count).filter_map(move |i| self.slots[(self.head + i) % capacity].as_ref())
    }

    /// Remove every entry, oldest first.
    pub fn drain_all(&mut self) -> Vec<QueueEntry> {
        let mut drained = Vec::with_capacity(self.count);
        while let Some(entry) = self.pop_head() {
            drained.push(entry);
        }
        drained
    }
}

/// A [`CommandQueue`] behind a mutex, shared by the application and the
/// service task. Holders must never perform link I/O while locked.
#[derive(Debug)]
pub struct SharedQueue {
    inner: Mutex<CommandQueue>,
}

impl SharedQueue {
    /// Wrap an empty queue.
    pub fn new(peer: PeerId, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CommandQueue::new(peer, capacity)),
        }
    }

    /// Lock the queue. A poisoned lock is recovered: queue state is updated
    /// in single steps and stays consistent.
    pub fn lock(&self) -> MutexGuard<'_, CommandQueue> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
