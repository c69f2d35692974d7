//! Periodic liveness pings.
//!
//! Every few video frames the host sends each peer a NOP and expects the
//! sentinel byte back within a short timeout. A wrong byte or no answer is
//! reported to recovery as `COMMUNICATION_FAILURE`.

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::BusError;
use crate::protocol::{ErrorCode, PING_SENTINEL};
use crate::transport::{HostTransport, Link};

/// Default number of frames between pings.
pub const DEFAULT_HEALTH_INTERVAL_FRAMES: u32 = 10;

/// Default wait for the sentinel.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_millis(2);

/// Result of one ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "result", content = "byte")]
pub enum CheckResult {
    /// Sentinel received.
    Pass,
    /// Peer answered with something else.
    WrongSentinel(u8),
    /// No answer in time or the link failed.
    NoReply,
    /// Peer was mid-transaction; the check is retried next frame.
    Skipped,
}

impl CheckResult {
    /// Check passed.
    pub fn is_pass(self) -> bool {
        self == CheckResult::Pass
    }

    /// Check failed and must be reported.
    pub fn is_failure(self) -> bool {
        matches!(self, CheckResult::WrongSentinel(_) | CheckResult::NoReply)
    }

    /// Code reported to recovery for a failed check.
    pub fn error_code(self) -> Option<ErrorCode> {
        self.is_failure().then_some(ErrorCode::COMMUNICATION_FAILURE)
    }
}

/// Ping schedule and results for one peer.
#[derive(Debug, Clone, Serialize)]
pub struct HealthMonitor {
    interval_frames: u32,
    #[serde(skip)]
    ping_timeout: Duration,
    frames_since: u32,
    retry_next_frame: bool,
    checks: u64,
    consecutive_failures: u32,
    last: Option<CheckResult>,
}

impl HealthMonitor {
    /// Ping every `interval_frames` frames (at least one).
    pub fn new(interval_frames: u32, ping_timeout: Duration) -> Self {
        Self {
            interval_frames: interval_frames.max(1),
            ping_timeout,
            frames_since: 0,
            retry_next_frame: false,
            checks: 0,
            consecutive_failures: 0,
            last: None,
        }
    }

    /// Count a video frame; returns whether a check is due.
    pub fn on_frame(&mut self) -> bool {
        if self.retry_next_frame {
            self.retry_next_frame = false;
            self.frames_since = 0;
            return true;
        }
        self.frames_since += 1;
        if self.frames_since >= self.interval_frames {
            self.frames_since = 0;
            return true;
        }
        false
    }

    /// Ping the peer behind `transport` and record the result.
    pub fn check<L: Link>(&mut self, transport: &mut HostTransport<L>) -> CheckResult {
        let result = match transport.ping(self.ping_timeout) {
            Ok(PING_SENTINEL) => CheckResult::Pass,
            Ok(byte) => CheckResult::WrongSentinel(byte),
            Err(BusError::PeerBusy(_)) => CheckResult::Skipped,
            Err(e) => {
                debug!("Ping to {} failed: {}", transport.peer(), e);
                CheckResult::NoReply
            }
        };
        self.record(result);
        if result.is_failure() {
            warn!(
                "Health check failed for {}: {:?} ({} in a row)",
                transport.peer(),
                result,
                self.consecutive_failures
            );
        }
        result
    }

    fn record(&mut self, result: CheckResult) {
        match result {
            CheckResult::Pass => self.consecutive_failures = 0,
            CheckResult::WrongSentinel(_) | CheckResult::NoReply => {
                self.consecutive_failures += 1
            }
            CheckResult::Skipped => {
                self.retry_next_frame = true;
                return;
            }
        }
        self.checks += 1;
        self.last = Some(result);
    }

    /// Completed checks.
    pub fn checks(&self) -> u64 {
        self.checks
    }

    /// Failures since the last pass.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Latest completed check.
    pub fn last(&self) -> Option<CheckResult> {
        self.last
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_HEALTH_INTERVAL_FRAMES, DEFAULT_PING_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::peer::PeerId;
    use crate::time::ManualClock;
    use crate::transport::sim::SimulatedPeer;
    use crate::transport::{Polarity, TransportConfig};

    fn transport(sim: &SimulatedPeer) -> HostTransport<SimulatedPeer> {
        HostTransport::new(
            PeerId::Graphics,
            sim.clone(),
            Arc::new(ManualClock::new()),
            TransportConfig::default(),
        )
    }

    #[test]
    fn test_due_every_interval() {
        let mut monitor = HealthMonitor::new(10, DEFAULT_PING_TIMEOUT);
        let due: Vec<bool> = (0..20).map(|_| monitor.on_frame()).collect();

        assert_eq!(due.iter().filter(|d| **d).count(), 2);
        assert!(due[9]);
        assert!(due[19]);
    }

    #[test]
    fn test_pass() {
        let sim = SimulatedPeer::new(Polarity::ActiveLow);
        let mut monitor = HealthMonitor::default();

        let result = monitor.check(&mut transport(&sim));

        assert_eq!(result, CheckResult::Pass);
        assert_eq!(result.error_code(), None);
        assert_eq!(monitor.checks(), 1);
    }

    #[test]
    fn test_wrong_sentinel() {
        let sim = SimulatedPeer::new(Polarity::ActiveLow);
        sim.set_ping_reply(Some(0x00));
        let mut monitor = HealthMonitor::default();

        let result = monitor.check(&mut transport(&sim));

        assert_eq!(result, CheckResult::WrongSentinel(0x00));
        assert_eq!(result.error_code(), Some(ErrorCode::COMMUNICATION_FAILURE));
    }

    #[test]
    fn test_no_reply_counts_failures() {
        let sim = SimulatedPeer::new(Polarity::ActiveLow);
        sim.set_ping_reply(None);
        let mut monitor = HealthMonitor::default();
        let mut link = transport(&sim);

        monitor.check(&mut link);
        monitor.check(&mut link);

        assert_eq!(monitor.consecutive_failures(), 2);
        assert_eq!(monitor.last(), Some(CheckResult::NoReply));

        sim.set_ping_reply(Some(PING_SENTINEL));
        monitor.check(&mut link);
        assert_eq!(monitor.consecutive_failures(), 0);
    }

    #[test]
    fn test_busy_peer_is_rechecked_next_frame() {
        let sim = SimulatedPeer::new(Polarity::ActiveLow);
        sim.set_busy_for(u32::MAX);
        let mut monitor = HealthMonitor::default();

        let result = monitor.check(&mut transport(&sim));

        assert_eq!(result, CheckResult::Skipped);
        assert_eq!(monitor.checks(), 0);
        assert!(monitor.on_frame());
    }

    #[test]
    fn test_serializes_for_diagnostics() {
        let mut monitor = HealthMonitor::default();
        monitor.record(CheckResult::WrongSentinel(7));

        let json = serde_json::to_value(&monitor).unwrap();

        assert_eq!(json["consecutive_failures"], 1);
        assert_eq!(json["last"]["result"], "wrong_sentinel");
        assert_eq!(json["last"]["byte"], 7);
    }
}
