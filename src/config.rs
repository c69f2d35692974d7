//! Bus configuration.
//!
//! Every protocol constant lives in [`BusConfig`]. Defaults match the
//! reference hardware; any subset can be overridden from JSON:
//!
//! ```
//! use conbus::BusConfig;
//!
//! let config = BusConfig::from_json_str(r#"{ "ack_timeout_ms": 80, "polarity": "active_high" }"#).unwrap();
//! assert_eq!(config.ack_timeout_ms, 80);
//! assert_eq!(config.queue_capacity, 64);
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock_sync::DEFAULT_SYNC_INTERVAL;
use crate::error::{BusError, Result};
use crate::health::{DEFAULT_HEALTH_INTERVAL_FRAMES, DEFAULT_PING_TIMEOUT};
use crate::queue::DEFAULT_QUEUE_CAPACITY;
use crate::recovery::{DEFAULT_ERROR_LOG_CAPACITY, DEFAULT_MAX_RECOVERY_ATTEMPTS};
use crate::reliability::{RetryPolicy, DEFAULT_ACK_TIMEOUT, DEFAULT_BATCH_SIZE, DEFAULT_MAX_RETRIES};
use crate::transport::{
    Polarity, TransportConfig, DEFAULT_BUSY_WAIT, DEFAULT_READ_TIMEOUT, DEFAULT_REPLY_TIMEOUT,
};

/// Default service poll period when no mailbox event arrives.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Default mailbox capacity.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 64;

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Configuration for the host bus and peer nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Entries per peer queue.
    pub queue_capacity: usize,
    /// Queue steps per service invocation.
    pub batch_size: usize,
    /// ACK wait before a resend.
    pub ack_timeout_ms: u64,
    /// Resends before permanent failure.
    pub max_retries: u8,
    /// Spin on a busy peer before giving up on this attempt.
    pub busy_wait_us: u64,
    /// Bound on each ready/select transition.
    pub reply_timeout_ms: u64,
    /// Bound on byte gaps within a selected transfer.
    pub read_timeout_ms: u64,
    /// Period between clock sync pushes.
    pub sync_interval_ms: u64,
    /// Video frames between health pings.
    pub health_interval_frames: u32,
    /// Wait for the ping sentinel.
    pub ping_timeout_ms: u64,
    /// Transport resets before a peer is marked failed.
    pub max_recovery_attempts: u8,
    /// Error records kept for diagnostics.
    pub error_log_capacity: usize,
    /// Control-line polarity.
    pub polarity: Polarity,
    /// Service task poll period.
    pub poll_interval_ms: u64,
    /// Control mailbox capacity.
    pub mailbox_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            batch_size: DEFAULT_BATCH_SIZE,
            ack_timeout_ms: millis(DEFAULT_ACK_TIMEOUT),
            max_retries: DEFAULT_MAX_RETRIES,
            busy_wait_us: u64::try_from(DEFAULT_BUSY_WAIT.as_micros()).unwrap_or(u64::MAX),
            reply_timeout_ms: millis(DEFAULT_REPLY_TIMEOUT),
            read_timeout_ms: millis(DEFAULT_READ_TIMEOUT),
            sync_interval_ms: millis(DEFAULT_SYNC_INTERVAL),
            health_interval_frames: DEFAULT_HEALTH_INTERVAL_FRAMES,
            ping_timeout_ms: millis(DEFAULT_PING_TIMEOUT),
            max_recovery_attempts: DEFAULT_MAX_RECOVERY_ATTEMPTS,
            error_log_capacity: DEFAULT_ERROR_LOG_CAPACITY,
            polarity: Polarity::default(),
            poll_interval_ms: millis(DEFAULT_POLL_INTERVAL),
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
        }
    }
}

impl BusConfig {
    /// Parse and validate a JSON document. Missing fields take defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Render as pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject values the bus cannot run with.
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("queue_capacity", self.queue_capacity as u64),
            ("batch_size", self.batch_size as u64),
            ("ack_timeout_ms", self.ack_timeout_ms),
            ("reply_timeout_ms", self.reply_timeout_ms),
            ("read_timeout_ms", self.read_timeout_ms),
            ("sync_interval_ms", self.sync_interval_ms),
            ("health_interval_frames", u64::from(self.health_interval_frames)),
            ("ping_timeout_ms", self.ping_timeout_ms),
            ("error_log_capacity", self.error_log_capacity as u64),
            ("poll_interval_ms", self.poll_interval_ms),
            ("mailbox_capacity", self.mailbox_capacity as u64),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, v)| *v == 0) {
            return Err(BusError::Config(format!("{} must be greater than zero", name)));
        }
        if self.ack_timeout_ms <= self.reply_timeout_ms {
            return Err(BusError::Config(format!(
                "ack_timeout_ms ({}) must exceed reply_timeout_ms ({})",
                self.ack_timeout_ms, self.reply_timeout_ms
            )));
        }
        Ok(())
    }

    /// Handshake settings for one link.
    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            busy_wait: Duration::from_micros(self.busy_wait_us),
            reply_timeout: Duration::from_millis(self.reply_timeout_ms),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            polarity: self.polarity,
        }
    }

    /// Retry settings.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            max_retries: self.max_retries,
        }
    }

    /// Clock sync period.
    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    /// Health ping timeout.
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    /// Service poll period.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Set the per-peer queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the ACK timeout.
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout_ms = millis(timeout);
        self
    }

    /// Set the number of resends.
    pub fn with_max_retries(mut self, retries: u8) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the handshake reply timeout.
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout_ms = millis(timeout);
        self
    }

    /// Set the clock sync period.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval_ms = millis(interval);
        self
    }

    /// Set the health ping interval in frames.
    pub fn with_health_interval(mut self, frames: u32) -> Self {
        self.health_interval_frames = frames;
        self
    }

    /// Set the recovery bound.
    pub fn with_max_recovery_attempts(mut self, attempts: u8) -> Self {
        self.max_recovery_attempts = attempts;
        self
    }

    /// Set control-line polarity.
    pub fn with_polarity(mut self, polarity: Polarity) -> Self {
        self.polarity = polarity;
        self
    }

    /// Set the service poll period.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = millis(interval);
        self
    }
}
