//! Error classification and per-peer recovery.
//!
//! Every error reported by a peer, a failed health check or an exhausted
//! retry passes through [`ErrorRecoveryController::handle`], which records it
//! and picks an action:
//!
//! | Code | Action |
//! |---|---|
//! | `MEMORY_FULL` | ask the peer to evict caches |
//! | `SYNC_LOST` | wait for the next periodic sync |
//! | `COMMUNICATION_FAILURE` | reset the transport and resend bring-up commands |
//! | `BUSY` | back off |
//! | anything else | log |
//!
//! Transport resets are bounded per peer. One past the bound the peer is
//! marked permanently failed and stays that way.

use std::collections::VecDeque;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::peer::PeerId;
use crate::protocol::ErrorCode;
use crate::time::Micros;

/// Default transport resets before a peer is given up on.
pub const DEFAULT_MAX_RECOVERY_ATTEMPTS: u8 = 3;

/// Default number of error records kept.
pub const DEFAULT_ERROR_LOG_CAPACITY: usize = 32;

/// One recorded error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ErrorRecord {
    /// Peer the error concerns.
    pub peer: PeerId,
    /// Error code.
    pub error_code: ErrorCode,
    /// Command involved, if any.
    pub command_id: Option<u8>,
    /// Host time in microseconds.
    pub timestamp: Micros,
    /// Whether a recovery action was taken.
    pub handled: bool,
}

/// Fixed-capacity ring of recent errors; the oldest is overwritten.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorLog {
    #[serde(skip)]
    capacity: usize,
    records: VecDeque<ErrorRecord>,
}

impl ErrorLog {
    /// Create an empty log. A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            records: VecDeque::with_capacity(capacity),
        }
    }

    /// Append, dropping the oldest record when full.
    pub fn push(&mut self, record: ErrorRecord) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    /// Records, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &ErrorRecord> + '_ {
        self.records.iter()
    }

    /// Most recent record.
    pub fn latest(&self) -> Option<&ErrorRecord> {
        self.records.back()
    }

    /// Number of records held.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// What the caller must do about an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Enqueue a cache eviction request to the peer.
    EvictCache,
    /// Do nothing until the next periodic sync.
    AwaitSync,
    /// Reset lines, reinitialize the serial link and resend bring-up.
    ResetTransport,
    /// Leave state alone and retry later.
    BackOff,
    /// Nothing beyond the record.
    LogOnly,
    /// Bound exceeded: degrade the peer and notify the application once.
    Escalated,
    /// Peer already failed; the error is recorded and dropped.
    Ignored,
}

/// Lifecycle of a peer as seen by recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    /// Operating normally.
    Healthy,
    /// A transport reset is in progress.
    Recovering,
    /// Permanently failed; commands are rejected.
    Failed,
}

/// Recovery bookkeeping for one peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PeerHealth {
    /// Transport resets since the last passing health check.
    pub recovery_attempts: u8,
    /// A reset is in progress.
    pub in_recovery: bool,
    /// Permanently failed.
    pub failed: bool,
}

impl PeerHealth {
    /// Current lifecycle state.
    pub fn state(&self) -> PeerState {
        if self.failed {
            PeerState::Failed
        } else if self.in_recovery {
            PeerState::Recovering
        } else {
            PeerState::Healthy
        }
    }
}

/// Classifies errors and bounds recovery per peer.
#[derive(Debug, Clone)]
pub struct ErrorRecoveryController {
    max_attempts: u8,
    peers: [PeerHealth; PeerId::COUNT],
    log: ErrorLog,
}

impl ErrorRecoveryController {
    /// Create a controller.
    pub fn new(max_attempts: u8, log_capacity: usize) -> Self {
        Self {
            max_attempts,
            peers: [PeerHealth::default(); PeerId::COUNT],
            log: ErrorLog::new(log_capacity),
        }
    }

    /// Record an error and choose the action.
    pub fn handle(
        &mut self,
        peer: PeerId,
        code: ErrorCode,
        command_id: Option<u8>,
        now: Micros,
    ) -> RecoveryAction {
        let max_attempts = self.max_attempts;
        let health = &mut self.peers[peer.index()];

        let action = if health.failed {
            RecoveryAction::Ignored
        } else {
            match code {
                ErrorCode::MEMORY_FULL => RecoveryAction::EvictCache,
                ErrorCode::SYNC_LOST => RecoveryAction::AwaitSync,
                ErrorCode::BUSY => RecoveryAction::BackOff,
                ErrorCode::COMMUNICATION_FAILURE => {
                    health.recovery_attempts = health.recovery_attempts.saturating_add(1);
                    if health.recovery_attempts > max_attempts {
                        health.failed = true;
                        health.in_recovery = false;
                        RecoveryAction::Escalated
                    } else {
                        health.in_recovery = true;
                        RecoveryAction::ResetTransport
                    }
                }
                _ => RecoveryAction::LogOnly,
            }
        };

        match action {
            RecoveryAction::Escalated => {
                error!(
                    "{} exceeded {} recovery attempts; marking failed",
                    peer, max_attempts
                )
            }
            RecoveryAction::ResetTransport => warn!(
                "{} reported {}; transport reset {}/{}",
                peer, code, health.recovery_attempts, max_attempts
            ),
            RecoveryAction::Ignored => {}
            _ => info!("{} reported {}: {:?}", peer, code, action),
        }

        self.log.push(ErrorRecord {
            peer,
            error_code: code,
            command_id,
            timestamp: now,
            handled: !matches!(action, RecoveryAction::LogOnly | RecoveryAction::Ignored),
        });
        action
    }

    /// A transport reset finished.
    pub fn on_recovered(&mut self, peer: PeerId) {
        self.peers[peer.index()].in_recovery = false;
    }

    /// A health check passed: the link is sound again.
    pub fn on_health_pass(&mut self, peer: PeerId) {
        let health = &mut self.peers[peer.index()];
        if !health.failed {
            health.recovery_attempts = 0;
            health.in_recovery = false;
        }
    }

    /// Peer has been given up on.
    pub fn is_failed(&self, peer: PeerId) -> bool {
        self.peers[peer.index()].failed
    }

    /// Bookkeeping for a peer.
    pub fn peer_health(&self, peer: PeerId) -> PeerHealth {
        self.peers[peer.index()]
    }

    /// Recorded errors.
    pub fn log(&self) -> &ErrorLog {
        &self.log
    }
}

impl Default for ErrorRecoveryController {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECOVERY_ATTEMPTS, DEFAULT_ERROR_LOG_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let mut ctl = ErrorRecoveryController::default();
        let g = PeerId::Graphics;

        assert_eq!(
            ctl.handle(g, ErrorCode::MEMORY_FULL, Some(0x20), 0),
            RecoveryAction::EvictCache
        );
        assert_eq!(
            ctl.handle(g, ErrorCode::SYNC_LOST, None, 0),
            RecoveryAction::AwaitSync
        );
        assert_eq!(
            ctl.handle(g, ErrorCode::BUSY, None, 0),
            RecoveryAction::BackOff
        );
        assert_eq!(
            ctl.handle(g, ErrorCode::INVALID_COMMAND, Some(0x99), 0),
            RecoveryAction::LogOnly
        );
        assert_eq!(
            ctl.handle(g, ErrorCode::TIMEOUT, Some(0x71), 0),
            RecoveryAction::LogOnly
        );
        assert_eq!(ctl.peer_health(g).recovery_attempts, 0);
        assert_eq!(ctl.log().len(), 5);
    }

    #[test]
    fn test_escalates_after_bound() {
        let mut ctl = ErrorRecoveryController::new(3, 8);
        let a = PeerId::Audio;

        for _ in 0..3 {
            assert_eq!(
                ctl.handle(a, ErrorCode::COMMUNICATION_FAILURE, None, 0),
                RecoveryAction::ResetTransport
            );
            ctl.on_recovered(a);
        }
        assert_eq!(
            ctl.handle(a, ErrorCode::COMMUNICATION_FAILURE, None, 0),
            RecoveryAction::Escalated
        );
        assert!(ctl.is_failed(a));
        assert_eq!(ctl.peer_health(a).state(), PeerState::Failed);

        assert_eq!(
            ctl.handle(a, ErrorCode::COMMUNICATION_FAILURE, None, 0),
            RecoveryAction::Ignored
        );
        assert!(!ctl.is_failed(PeerId::Graphics));
    }

    #[test]
    fn test_health_pass_resets_attempts() {
        let mut ctl = ErrorRecoveryController::default();
        let g = PeerId::Graphics;

        ctl.handle(g, ErrorCode::COMMUNICATION_FAILURE, None, 0);
        assert_eq!(ctl.peer_health(g).state(), PeerState::Recovering);

        ctl.on_health_pass(g);

        assert_eq!(ctl.peer_health(g), PeerHealth::default());
    }

    #[test]
    fn test_failed_peer_stays_failed() {
        let mut ctl = ErrorRecoveryController::new(0, 4);
        let g = PeerId::Graphics;
        ctl.handle(g, ErrorCode::COMMUNICATION_FAILURE, None, 0);

        ctl.on_health_pass(g);

        assert!(ctl.is_failed(g));
    }

    #[test]
    fn test_log_ring_overwrites_oldest() {
        let mut log = ErrorLog::new(2);
        for t in 0..3 {
            log.push(ErrorRecord {
                peer: PeerId::Audio,
                error_code: ErrorCode::TIMEOUT,
                command_id: Some(t as u8),
                timestamp: t,
                handled: false,
            });
        }

        let ids: Vec<Option<u8>> = log.iter().map(|r| r.command_id).collect();
        assert_eq!(ids, vec![Some(1), Some(2)]);
        assert_eq!(log.latest().unwrap().timestamp, 2);
    }

    #[test]
    fn test_record_fields() {
        let mut ctl = ErrorRecoveryController::default();
        ctl.handle(PeerId::Graphics, ErrorCode::TIMEOUT, Some(0x71), 200_000);

        let record = *ctl.log().latest().unwrap();

        assert_eq!(record.command_id, Some(0x71));
        assert_eq!(record.error_code, ErrorCode::TIMEOUT);
        assert!(!record.handled);
        let json = serde_json::to_value(record).unwrap();
        assert_eq!(json["peer"], "graphics");
        assert_eq!(json["error_code"], 1);
    }
}
