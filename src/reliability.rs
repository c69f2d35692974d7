//! ACK tracking, timed retransmission and permanent failure.
//!
//! Per entry the lifecycle is
//!
//! ```text
//! Queued ─► Sent ─┬─► Acked ─► (popped next tick)
//!                 └─► timed out ─► resend (≤ max_retries) ─► Sent
//!                                └─► FailedPermanently (popped)
//! ```
//!
//! The engine never performs I/O while holding a queue lock. Each step is
//! planned under the lock, the frame goes out with the lock released, and
//! the result is committed under the lock again by matching the head's
//! sequence number.

use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::error::{BusError, Result};
use crate::queue::{CommandQueue, EntryState, QueueEntry, SharedQueue};
use crate::time::{micros, Clock, Micros};

/// Default time an ACK may take before the frame is resent.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(50);

/// Default number of retransmissions after the first send.
pub const DEFAULT_MAX_RETRIES: u8 = 3;

/// Default number of queue steps per service invocation.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Retry timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Time after a transmission before it is considered lost.
    pub ack_timeout: Duration,
    /// Retransmissions before giving up.
    pub max_retries: u8,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// What the head of the queue needs next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Nothing to send: queue empty or waiting for an ACK.
    Idle,
    /// Put this frame on the wire.
    Transmit {
        /// Head entry's sequence number.
        seq: u64,
        /// Command id, for logging and events.
        command_id: u8,
        /// Encoded frame.
        frame: Bytes,
        /// 0 for the first send, then the retry number.
        attempt: u8,
    },
    /// Retries exhausted; the entry has been removed.
    Failed {
        /// Removed entry's sequence number.
        seq: u64,
        /// Command id of the failed entry.
        command_id: u8,
    },
}

/// Result of one step of [`ReliabilityEngine::drain_batch`].
#[derive(Debug)]
pub enum Outcome {
    /// A frame went out.
    Transmitted {
        /// Command id.
        command_id: u8,
        /// 0 for the first send, then the retry number.
        attempt: u8,
        /// Whether the entry now waits for an ACK.
        requires_ack: bool,
    },
    /// An entry exhausted its retries.
    Failed {
        /// Command id.
        command_id: u8,
    },
    /// The link failed while sending.
    LinkError {
        /// Command being sent.
        command_id: u8,
        /// Underlying failure.
        error: BusError,
    },
}

/// Retry state machine for one peer.
#[derive(Debug, Default)]
pub struct ReliabilityEngine {
    policy: RetryPolicy,
    pending_acks: usize,
}

impl ReliabilityEngine {
    /// Create an engine with the given policy.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            pending_acks: 0,
        }
    }

    /// Retry policy in use.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Entries transmitted and not yet acknowledged or failed.
    pub fn pending_acks(&self) -> usize {
        self.pending_acks
    }

    /// Decide the next step for the head of `queue`.
    ///
    /// Acknowledged heads are popped here, one tick after their ACK. A
    /// transmission is only planned; the entry changes when
    /// [`commit_send`](Self::commit_send) is called.
    pub fn plan(&mut self, queue: &mut CommandQueue, now: Micros) -> Step {
        loop {
            let Some(head) = queue.head() else {
                return Step::Idle;
            };

            let state = head.state;
            match state {
                EntryState::Acked | EntryState::FailedPermanently => {
                    queue.dequeue_ready();
                }
                EntryState::Queued => {
                    return Step::Transmit {
                        seq: head.seq,
                        command_id: head.command_id(),
                        frame: head.frame().clone(),
                        attempt: 0,
                    };
                }
                EntryState::Sent => {
                    let elapsed = now.saturating_sub(head.enqueued_at);
                    if elapsed <= micros(self.policy.ack_timeout) {
                        return Step::Idle;
                    }
                    if head.retry_count < self.policy.max_retries {
                        return Step::Transmit {
                            seq: head.seq,
                            command_id: head.command_id(),
                            frame: head.frame().clone(),
                            attempt: head.retry_count + 1,
                        };
                    }
                    return self.fail_head(queue);
                }
            }
        }
    }

    fn fail_head(&mut self, queue: &mut CommandQueue) -> Step {
        let Some(mut entry) = queue.pop_head() else {
            return Step::Idle;
        };
        entry.state = EntryState::FailedPermanently;
        self.pending_acks = self.pending_acks.saturating_sub(1);
        warn!(
            "Command {:#04x} to {} failed after {} retries",
            entry.command_id(),
            queue.peer(),
            entry.retry_count
        );
        Step::Failed {
            seq: entry.seq,
            command_id: entry.command_id(),
        }
    }

    /// Record that the planned transmission for `seq` went out at `now`.
    ///
    /// Fire-and-forget entries are removed. Entries that need an ACK move to
    /// `Sent` with their timer restarted. Returns `false` if the head is no
    /// longer the planned entry.
    pub fn commit_send(
        &mut self,
        queue: &mut CommandQueue,
        seq: u64,
        attempt: u8,
        now: Micros,
    ) -> bool {
        let Some(head) = queue.head_mut() else {
            return false;
        };
        if head.seq != seq {
            return false;
        }

        if !head.requires_ack {
            queue.dequeue_ready();
            return true;
        }

        if head.state == EntryState::Queued {
            self.pending_acks += 1;
        }
        head.state = EntryState::Sent;
        head.retry_count = attempt;
        head.enqueued_at = now;
        true
    }

    /// Apply an ACK for `command_id`.
    ///
    /// Returns the acknowledged entry's sequence number, or `None` when no
    /// transmitted entry was waiting for it (duplicate or stray ACK).
    pub fn on_ack(&mut self, queue: &mut CommandQueue, command_id: u8) -> Option<u64> {
        let entry = queue.find_pending_mut(command_id)?;
        entry.state = EntryState::Acked;
        self.pending_acks = self.pending_acks.saturating_sub(1);
        Some(entry.seq)
    }

    /// Apply an ERROR reply for `command_id`.
    ///
    /// The matching transmitted entry is settled as failed and popped on the
    /// next tick. Returns its sequence number, or `None` if nothing was
    /// waiting.
    pub fn on_error(&mut self, queue: &mut CommandQueue, command_id: u8) -> Option<u64> {
        let entry = queue.find_pending_mut(command_id)?;
        entry.state = EntryState::FailedPermanently;
        self.pending_acks = self.pending_acks.saturating_sub(1);
        Some(entry.seq)
    }

    /// Empty `queue`, returning the unfinished entries as failed, oldest
    /// first. Entries that already completed are dropped without a result.
    pub fn fail_all(&mut self, queue: &mut CommandQueue) -> Vec<QueueEntry> {
        self.pending_acks = 0;
        queue
            .drain_all()
            .into_iter()
            .filter(|entry| !entry.completed())
            .map(|mut entry| {
                entry.state = EntryState::FailedPermanently;
                entry
            })
            .collect()
    }

    /// Run up to `max_n` queue steps, sending frames through `send`.
    ///
    /// The queue lock is held only while planning and committing. The batch
    /// stops early when the queue goes idle, when the peer reports busy (no
    /// state change, the step is retried next time) or after a link error.
    /// A link error still counts as a transmission attempt for entries that
    /// need an ACK, so a dead link cannot hold the head forever.
    pub fn drain_batch<F>(
        &mut self,
        queue: &SharedQueue,
        clock: &dyn Clock,
        max_n: usize,
        mut send: F,
    ) -> Vec<Outcome>
    where
        F: FnMut(&[u8]) -> Result<()>,
    {
        let mut outcomes = Vec::new();

        for _ in 0..max_n {
            let step = {
                let mut guard = queue.lock();
                self.plan(&mut guard, clock.now_micros())
            };

            let (seq, command_id, frame, attempt) = match step {
                Step::Idle => break,
                Step::Failed { command_id, .. } => {
                    outcomes.push(Outcome::Failed { command_id });
                    continue;
                }
                Step::Transmit {
                    seq,
                    command_id,
                    frame,
                    attempt,
                } => (seq, command_id, frame, attempt),
            };

            if attempt > 0 {
                debug!("Resending {:#04x} (retry {})", command_id, attempt);
            }

            match send(&frame) {
                Ok(()) => {
                    let mut guard = queue.lock();
                    let requires_ack = guard.head().is_some_and(|e| e.requires_ack);
                    if self.commit_send(&mut guard, seq, attempt, clock.now_micros()) {
                        outcomes.push(Outcome::Transmitted {
                            command_id,
                            attempt,
                            requires_ack,
                        });
                    }
                }
                Err(BusError::PeerBusy(peer)) => {
                    debug!("{} busy; deferring {:#04x}", peer, command_id);
                    break;
                }
                Err(error) => {
                    let mut guard = queue.lock();
                    if guard.head().is_some_and(|e| e.seq == seq && e.requires_ack) {
                        self.commit_send(&mut guard, seq, attempt, clock.now_micros());
                    }
                    outcomes.push(Outcome::LinkError { command_id, error });
                    break;
                }
            }
        }

        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerId;
    use crate::protocol::Command;
    use crate::time::ManualClock;

    const MS: Micros = 1_000;

    fn queue_with(entries: &[(u8, bool)]) -> SharedQueue {
        let queue = SharedQueue::new(PeerId::Graphics, 64);
        for &(id, ack) in entries {
            queue
                .lock()
                .enqueue(Command::new(id, vec![0, 1, 64, 200]).unwrap(), ack, 0)
                .unwrap();
        }
        queue
    }

    #[test]
    fn test_first_send_marks_sent() {
        let queue = queue_with(&[(0x71, true)]);
        let clock = ManualClock::new();
        let mut engine = ReliabilityEngine::default();
        let mut sent = Vec::new();

        let outcomes = engine.drain_batch(&queue, &clock, 10, |f| {
            sent.push(f.to_vec());
            Ok(())
        });

        assert_eq!(sent, vec![vec![0x71, 6, 0, 1, 64, 200]]);
        assert_eq!(outcomes.len(), 1);
        assert_eq!(engine.pending_acks(), 1);
        assert_eq!(queue.lock().head().unwrap().state, EntryState::Sent);
    }

    #[test]
    fn test_no_resend_before_timeout() {
        let queue = queue_with(&[(0x71, true)]);
        let clock = ManualClock::new();
        let mut engine = ReliabilityEngine::default();
        let mut sends = 0;

        engine.drain_batch(&queue, &clock, 10, |_| {
            sends += 1;
            Ok(())
        });
        clock.advance_micros(50 * MS);
        engine.drain_batch(&queue, &clock, 10, |_| {
            sends += 1;
            Ok(())
        });

        assert_eq!(sends, 1);
    }

    #[test]
    fn test_retry_then_permanent_failure() {
        let queue = queue_with(&[(0x71, true)]);
        let clock = ManualClock::new();
        let mut engine = ReliabilityEngine::default();
        let mut sent_at = Vec::new();
        let mut failed = 0;

        for _ in 0..300 {
            for outcome in engine.drain_batch(&queue, &clock, 10, |_| {
                sent_at.push(clock.now_micros());
                Ok(())
            }) {
                if matches!(outcome, Outcome::Failed { command_id: 0x71 }) {
                    failed += 1;
                }
            }
            clock.advance_micros(MS);
        }

        assert_eq!(sent_at.len(), 4);
        assert!(sent_at.windows(2).all(|w| w[1] - w[0] >= 50 * MS));
        assert_eq!(failed, 1);
        assert!(queue.lock().is_empty());
        assert_eq!(engine.pending_acks(), 0);
    }

    #[test]
    fn test_ack_completes_and_pops_next_tick() {
        let queue = queue_with(&[(0x71, true), (0x72, false)]);
        let clock = ManualClock::new();
        let mut engine = ReliabilityEngine::default();
        let mut sent = Vec::new();

        engine.drain_batch(&queue, &clock, 10, |f| {
            sent.push(f[0]);
            Ok(())
        });
        assert_eq!(sent, vec![0x71]);

        assert!(engine.on_ack(&mut queue.lock(), 0x71).is_some());
        assert_eq!(queue.lock().head().unwrap().state, EntryState::Acked);
        assert_eq!(queue.lock().len(), 2);

        engine.drain_batch(&queue, &clock, 10, |f| {
            sent.push(f[0]);
            Ok(())
        });
        assert_eq!(sent, vec![0x71, 0x72]);
        assert!(queue.lock().is_empty());
    }

    #[test]
    fn test_duplicate_ack_is_ignored() {
        let queue = queue_with(&[(0x71, true), (0x71, true)]);
        let clock = ManualClock::new();
        let mut engine = ReliabilityEngine::default();

        engine.drain_batch(&queue, &clock, 10, |_| Ok(()));
        assert!(engine.on_ack(&mut queue.lock(), 0x71).is_some());
        assert!(engine.on_ack(&mut queue.lock(), 0x71).is_none());

        // The second 0x71 has not been sent yet, so it stays queued.
        let guard = queue.lock();
        let states: Vec<EntryState> = guard.iter().map(|e| e.state).collect();
        assert_eq!(states, vec![EntryState::Acked, EntryState::Queued]);
        drop(guard);
        assert_eq!(engine.pending_acks(), 0);
    }

    #[test]
    fn test_error_reply_settles_entry() {
        let queue = queue_with(&[(0x30, true), (0x31, false)]);
        let clock = ManualClock::new();
        let mut engine = ReliabilityEngine::default();
        let mut sent = Vec::new();

        engine.drain_batch(&queue, &clock, 10, |f| {
            sent.push(f[0]);
            Ok(())
        });
        assert!(engine.on_error(&mut queue.lock(), 0x30).is_some());
        assert!(engine.on_ack(&mut queue.lock(), 0x30).is_none());
        assert_eq!(engine.pending_acks(), 0);

        engine.drain_batch(&queue, &clock, 10, |f| {
            sent.push(f[0]);
            Ok(())
        });
        assert_eq!(sent, vec![0x30, 0x31]);
        assert!(queue.lock().is_empty());
    }

    #[test]
    fn test_busy_peer_leaves_entry_untouched() {
        let queue = queue_with(&[(0x71, true)]);
        let clock = ManualClock::new();
        let mut engine = ReliabilityEngine::default();

        let outcomes =
            engine.drain_batch(&queue, &clock, 10, |_| Err(BusError::PeerBusy(PeerId::Graphics)));

        assert!(outcomes.is_empty());
        assert_eq!(queue.lock().head().unwrap().state, EntryState::Queued);
        assert_eq!(engine.pending_acks(), 0);
    }

    #[test]
    fn test_link_error_counts_as_attempt() {
        let queue = queue_with(&[(0x71, true)]);
        let clock = ManualClock::new();
        let mut engine = ReliabilityEngine::default();

        let outcomes =
            engine.drain_batch(&queue, &clock, 10, |_| Err(BusError::Link("down".into())));

        assert!(matches!(
            outcomes.as_slice(),
            [Outcome::LinkError { command_id: 0x71, .. }]
        ));
        assert_eq!(queue.lock().head().unwrap().state, EntryState::Sent);
    }

    #[test]
    fn test_batch_cap() {
        let entries: Vec<(u8, bool)> = (0..20).map(|i| (i, false)).collect();
        let queue = queue_with(&entries);
        let clock = ManualClock::new();
        let mut engine = ReliabilityEngine::default();

        let outcomes = engine.drain_batch(&queue, &clock, DEFAULT_BATCH_SIZE, |_| Ok(()));

        assert_eq!(outcomes.len(), 10);
        assert_eq!(queue.lock().len(), 10);
    }

    #[test]
    fn test_commit_rejects_stale_seq() {
        let queue = queue_with(&[(0x10, true)]);
        let mut engine = ReliabilityEngine::default();
        let mut guard = queue.lock();

        assert!(!engine.commit_send(&mut guard, 99, 0, 0));
        assert_eq!(guard.head().unwrap().state, EntryState::Queued);
    }

    #[test]
    fn test_fail_all() {
        let queue = queue_with(&[(1, true), (2, false)]);
        let clock = ManualClock::new();
        let mut engine = ReliabilityEngine::default();
        engine.drain_batch(&queue, &clock, 1, |_| Ok(()));

        let failed = engine.fail_all(&mut queue.lock());

        assert_eq!(failed.len(), 2);
        assert!(failed.iter().all(|e| e.state == EntryState::FailedPermanently));
        assert_eq!(engine.pending_acks(), 0);
    }

    #[test]
    fn test_fail_all_skips_acked_head() {
        let queue = queue_with(&[(1, true), (2, true)]);
        let clock = ManualClock::new();
        let mut engine = ReliabilityEngine::default();
        engine.drain_batch(&queue, &clock, 1, |_| Ok(()));
        engine.on_ack(&mut queue.lock(), 1);

        let failed = engine.fail_all(&mut queue.lock());

        let ids: Vec<u8> = failed.iter().map(|e| e.command_id()).collect();
        assert_eq!(ids, vec![2]);
        assert!(queue.lock().is_empty());
    }
}
