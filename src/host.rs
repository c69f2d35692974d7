//! Host-side bus: queues, retries, clock sync, health and recovery for both
//! peers.
//!
//! [`HostBus`] is owned by the transport core. The application side talks to
//! it through a cloneable [`BusHandle`] that only touches the per-peer queues
//! and the degraded flags, so its lock hold times never include I/O.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use conbus::transport::{sim::SimulatedPeer, Polarity};
//! use conbus::{BusEvent, HostBus, ManualClock, PeerId};
//!
//! let graphics = SimulatedPeer::new(Polarity::ActiveLow);
//! let audio = SimulatedPeer::new(Polarity::ActiveLow);
//! let mut bus = HostBus::builder()
//!     .clock(Arc::new(ManualClock::new()))
//!     .build(graphics.clone(), audio)
//!     .unwrap();
//!
//! bus.handle().send(PeerId::Graphics, 0x71, vec![0, 1, 64, 200], true).unwrap();
//! bus.service_tick();
//! bus.service_tick();
//!
//! assert!(bus.take_events().contains(&BusEvent::CommandAcked {
//!     peer: PeerId::Graphics,
//!     command_id: 0x71,
//! }));
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::clock_sync::{SyncPayload, SyncScheduler};
use crate::config::BusConfig;
use crate::error::{BusError, Result};
use crate::health::{CheckResult, HealthMonitor};
use crate::peer::PeerId;
use crate::protocol::{command, Command, ErrorCode, Reply, ReplyKind};
use crate::queue::SharedQueue;
use crate::recovery::{ErrorRecord, ErrorRecoveryController, PeerState, RecoveryAction};
use crate::reliability::{Outcome, ReliabilityEngine};
use crate::time::{Clock, MonotonicClock};
use crate::transport::{HostTransport, Link};

/// Something the application should know about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum BusEvent {
    /// The peer acknowledged a command.
    CommandAcked {
        /// Peer.
        peer: PeerId,
        /// Acknowledged command.
        command_id: u8,
    },
    /// A command that needed an ACK will never get one.
    CommandFailed {
        /// Peer.
        peer: PeerId,
        /// Failed command.
        command_id: u8,
    },
    /// The peer reported an error.
    PeerError {
        /// Peer.
        peer: PeerId,
        /// Command the error refers to.
        command_id: u8,
        /// Reported code.
        code: ErrorCode,
    },
    /// The peer exceeded its recovery bound. Sent once.
    PeerFailed {
        /// Peer.
        peer: PeerId,
    },
    /// The peer reached a frame boundary it was asked to report.
    FrameBoundary {
        /// Peer.
        peer: PeerId,
        /// Low byte of the peer's frame counter.
        frame: u8,
    },
    /// A health ping failed.
    HealthCheckFailed {
        /// Peer.
        peer: PeerId,
    },
}

struct PeerSlot {
    queue: SharedQueue,
    failed: AtomicBool,
}

/// State shared between the application handle and the service side.
struct Shared {
    peers: [PeerSlot; PeerId::COUNT],
    clock: Arc<dyn Clock>,
}

impl Shared {
    fn slot(&self, peer: PeerId) -> &PeerSlot {
        &self.peers[peer.index()]
    }
}

/// Application-side handle: enqueue commands, check peer status.
///
/// Cheaply cloneable; every clone feeds the same queues.
#[derive(Clone)]
pub struct BusHandle {
    shared: Arc<Shared>,
}

impl BusHandle {
    /// Queue a command for `peer`.
    ///
    /// Returns the entry's sequence number.
    ///
    /// # Errors
    ///
    /// `PeerFailed` when the peer is degraded, `QueueFull` when its queue is
    /// at capacity. Neither changes the queue.
    pub fn enqueue(&self, peer: PeerId, command: Command, requires_ack: bool) -> Result<u64> {
        let now = self.shared.clock.now_micros();
        // The queue's closed flag is the authority; it flips under this lock.
        self.shared.slot(peer).queue.lock().enqueue(command, requires_ack, now)
    }

    /// Build and queue a command.
    pub fn send(
        &self,
        peer: PeerId,
        command_id: u8,
        payload: impl Into<Bytes>,
        requires_ack: bool,
    ) -> Result<u64> {
        self.enqueue(peer, Command::new(command_id, payload)?, requires_ack)
    }

    /// Entries waiting for `peer`.
    pub fn queue_len(&self, peer: PeerId) -> usize {
        self.shared.slot(peer).queue.lock().len()
    }

    /// Peer has been given up on.
    pub fn is_failed(&self, peer: PeerId) -> bool {
        self.shared.slot(peer).failed.load(Ordering::Acquire)
    }
}

/// Per-peer status for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct PeerStatus {
    /// Peer.
    pub peer: PeerId,
    /// Recovery lifecycle state.
    pub state: PeerState,
    /// Transport resets since the last passing health check.
    pub recovery_attempts: u8,
    /// Queued entries.
    pub queued: usize,
    /// Entries waiting for an ACK.
    pub pending_acks: usize,
    /// Health monitor snapshot.
    pub health: HealthMonitor,
}

/// Bus-wide status for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct BusStatus {
    /// Host frame counter.
    pub frame_counter: u32,
    /// One entry per peer.
    pub peers: Vec<PeerStatus>,
    /// Recent errors, oldest first.
    pub errors: Vec<ErrorRecord>,
}

struct PeerLink<L> {
    transport: HostTransport<L>,
    engine: ReliabilityEngine,
    health: HealthMonitor,
    bring_up: Vec<Command>,
}

/// Builder for a [`HostBus`].
pub struct HostBusBuilder {
    config: BusConfig,
    clock: Option<Arc<dyn Clock>>,
    bring_up: [Vec<Command>; PeerId::COUNT],
}

impl HostBusBuilder {
    fn new() -> Self {
        Self {
            config: BusConfig::default(),
            clock: None,
            bring_up: [vec![Command::empty(command::RESET)], vec![Command::empty(command::RESET)]],
        }
    }

    /// Use this configuration.
    pub fn config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    /// Use this clock. Defaults to [`MonotonicClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Append a command resent to `peer` after every transport reset, after
    /// the default `RESET`.
    pub fn bring_up(mut self, peer: PeerId, command: Command) -> Self {
        self.bring_up[peer.index()].push(command);
        self
    }

    /// Build the bus over the two links.
    pub fn build<L: Link>(self, graphics: L, audio: L) -> Result<HostBus<L>> {
        self.config.validate()?;
        let config = self.config;
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(MonotonicClock::new()) as Arc<dyn Clock>);
        let [graphics_bring_up, audio_bring_up] = self.bring_up;

        let peer_link = |peer: PeerId, link: L, bring_up: Vec<Command>| PeerLink {
            transport: HostTransport::new(peer, link, clock.clone(), config.transport()),
            engine: ReliabilityEngine::new(config.retry_policy()),
            health: HealthMonitor::new(config.health_interval_frames, config.ping_timeout()),
            bring_up,
        };
        let links = [
            peer_link(PeerId::Graphics, graphics, graphics_bring_up),
            peer_link(PeerId::Audio, audio, audio_bring_up),
        ];

        let slot = |peer: PeerId| PeerSlot {
            queue: SharedQueue::new(peer, config.queue_capacity),
            failed: AtomicBool::new(false),
        };
        let shared = Arc::new(Shared {
            peers: [slot(PeerId::Graphics), slot(PeerId::Audio)],
            clock: clock.clone(),
        });

        Ok(HostBus {
            shared,
            links,
            recovery: ErrorRecoveryController::new(
                config.max_recovery_attempts,
                config.error_log_capacity,
            ),
            sync: SyncScheduler::new(config.sync_interval()),
            clock,
            config,
            frame_counter: 0,
            events: Vec::new(),
        })
    }
}

/// Host (master) end of both peer links.
pub struct HostBus<L> {
    shared: Arc<Shared>,
    links: [PeerLink<L>; PeerId::COUNT],
    recovery: ErrorRecoveryController,
    sync: SyncScheduler,
    clock: Arc<dyn Clock>,
    config: BusConfig,
    frame_counter: u32,
    events: Vec<BusEvent>,
}

impl HostBus<()> {
    /// Start building a host bus.
    pub fn builder() -> HostBusBuilder {
        HostBusBuilder::new()
    }
}

impl<L: Link> HostBus<L> {
    /// Handle for the application side.
    pub fn handle(&self) -> BusHandle {
        BusHandle {
            shared: self.shared.clone(),
        }
    }

    /// Configuration in use.
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Frames counted so far.
    pub fn frame_counter(&self) -> u32 {
        self.frame_counter
    }

    /// Recovery state and error log.
    pub fn recovery(&self) -> &ErrorRecoveryController {
        &self.recovery
    }

    /// Transport for `peer`.
    pub fn transport(&self, peer: PeerId) -> &HostTransport<L> {
        &self.links[peer.index()].transport
    }

    /// Take the events produced since the last call.
    pub fn take_events(&mut self) -> Vec<BusEvent> {
        std::mem::take(&mut self.events)
    }

    fn is_failed(&self, peer: PeerId) -> bool {
        self.shared.slot(peer).failed.load(Ordering::Acquire)
    }

    /// One service pass: collect replies, drain a batch from each queue and
    /// push a clock sync when one is due.
    pub fn service_tick(&mut self) {
        for peer in PeerId::ALL {
            if self.is_failed(peer) {
                continue;
            }
            self.collect_replies(peer);
            if self.is_failed(peer) {
                continue;
            }
            self.drain(peer);
        }
        self.push_sync_if_due();
    }

    /// Count a video frame and run the health checks that are due.
    pub fn on_frame(&mut self) {
        self.frame_counter = self.frame_counter.wrapping_add(1);
        for peer in PeerId::ALL {
            if self.is_failed(peer) {
                continue;
            }
            let link = &mut self.links[peer.index()];
            if !link.health.on_frame() {
                continue;
            }
            match link.health.check(&mut link.transport) {
                CheckResult::Pass => self.recovery.on_health_pass(peer),
                CheckResult::Skipped => {}
                CheckResult::WrongSentinel(_) | CheckResult::NoReply => {
                    self.events.push(BusEvent::HealthCheckFailed { peer });
                    self.report(peer, ErrorCode::COMMUNICATION_FAILURE, None);
                }
            }
        }
    }

    fn collect_replies(&mut self, peer: PeerId) {
        for _ in 0..self.config.batch_size {
            match self.links[peer.index()].transport.poll_reply() {
                Ok(None) => break,
                Ok(Some(reply)) => self.on_reply(peer, reply),
                Err(e) if e.is_transport_fault() => {
                    self.report(peer, ErrorCode::COMMUNICATION_FAILURE, None);
                    break;
                }
                Err(_) => break,
            }
        }
    }

    fn on_reply(&mut self, peer: PeerId, reply: Reply) {
        let i = peer.index();
        match reply.kind {
            ReplyKind::Ack => {
                let acked = {
                    let mut queue = self.shared.peers[i].queue.lock();
                    self.links[i].engine.on_ack(&mut queue, reply.command_id)
                };
                match acked {
                    Some(_) => self.events.push(BusEvent::CommandAcked {
                        peer,
                        command_id: reply.command_id,
                    }),
                    None => debug!("Ignoring stray ACK {:#04x} from {}", reply.command_id, peer),
                }
            }
            ReplyKind::Error => {
                self.events.push(BusEvent::PeerError {
                    peer,
                    command_id: reply.command_id,
                    code: reply.status,
                });
                // A rejected command is settled unless the peer only asked us
                // to back off, in which case the retry timer resends it.
                if reply.status != ErrorCode::BUSY {
                    let rejected = {
                        let mut queue = self.shared.peers[i].queue.lock();
                        self.links[i].engine.on_error(&mut queue, reply.command_id)
                    };
                    if rejected.is_some() {
                        self.events.push(BusEvent::CommandFailed {
                            peer,
                            command_id: reply.command_id,
                        });
                    }
                }
                self.report(peer, reply.status, Some(reply.command_id));
            }
            ReplyKind::FrameBoundary => self.events.push(BusEvent::FrameBoundary {
                peer,
                frame: reply.command_id,
            }),
        }
    }

    fn drain(&mut self, peer: PeerId) {
        let i = peer.index();
        let outcomes = {
            let PeerLink {
                transport, engine, ..
            } = &mut self.links[i];
            engine.drain_batch(
                &self.shared.peers[i].queue,
                &*self.clock,
                self.config.batch_size,
                |frame| transport.send_frame(frame),
            )
        };

        for outcome in outcomes {
            match outcome {
                Outcome::Transmitted {
                    command_id,
                    attempt,
                    requires_ack,
                } => debug!(
                    "Sent {:#04x} to {} (attempt {}, ack {})",
                    command_id, peer, attempt, requires_ack
                ),
                Outcome::Failed { command_id } => {
                    self.events.push(BusEvent::CommandFailed { peer, command_id });
                    self.report(peer, ErrorCode::TIMEOUT, Some(command_id));
                }
                Outcome::LinkError { command_id, error } => {
                    warn!("Sending {:#04x} to {} failed: {}", command_id, peer, error);
                    if error.is_transport_fault() {
                        self.report(peer, ErrorCode::COMMUNICATION_FAILURE, Some(command_id));
                    }
                }
            }
        }
    }

    fn push_sync_if_due(&mut self) {
        let now = self.clock.now_micros();
        if !self.sync.due(now) {
            return;
        }
        self.sync.mark_sent(now);

        let sync = SyncPayload {
            frame_counter: self.frame_counter,
            timestamp_us: now,
        };
        let frame = match sync.to_command() {
            Ok(command) => command.encode(),
            Err(e) => {
                error!("Cannot build clock sync: {}", e);
                return;
            }
        };

        for peer in PeerId::ALL {
            if self.is_failed(peer) {
                continue;
            }
            match self.links[peer.index()].transport.send_frame(&frame) {
                Ok(()) => {}
                Err(BusError::PeerBusy(_)) => self.sync.force(),
                Err(e) => {
                    warn!("Clock sync to {} failed: {}", peer, e);
                    if e.is_transport_fault() {
                        self.report(peer, ErrorCode::COMMUNICATION_FAILURE, None);
                    }
                }
            }
        }
    }

    /// Feed an error through recovery and carry out the chosen action.
    pub fn report(&mut self, peer: PeerId, code: ErrorCode, command_id: Option<u8>) {
        let now = self.clock.now_micros();
        let action = self.recovery.handle(peer, code, command_id, now);
        self.apply(peer, action);
    }

    fn apply(&mut self, peer: PeerId, action: RecoveryAction) {
        match action {
            RecoveryAction::EvictCache => {
                let evict = Command::empty(command::EVICT_CACHE);
                if let Err(e) = self.handle().enqueue(peer, evict, false) {
                    warn!("Cannot request cache eviction from {}: {}", peer, e);
                }
            }
            RecoveryAction::ResetTransport => self.reset_transport(peer),
            RecoveryAction::Escalated => self.escalate(peer),
            RecoveryAction::AwaitSync
            | RecoveryAction::BackOff
            | RecoveryAction::LogOnly
            | RecoveryAction::Ignored => {}
        }
    }

    fn reset_transport(&mut self, peer: PeerId) {
        let i = peer.index();
        loop {
            match self.links[i].transport.reset() {
                Ok(()) => break,
                Err(e) => {
                    warn!("Reinitializing {} link failed: {}", peer, e);
                    let now = self.clock.now_micros();
                    match self
                        .recovery
                        .handle(peer, ErrorCode::COMMUNICATION_FAILURE, None, now)
                    {
                        RecoveryAction::ResetTransport => continue,
                        RecoveryAction::Escalated => {
                            self.escalate(peer);
                            return;
                        }
                        _ => return,
                    }
                }
            }
        }

        let link = &mut self.links[i];
        for step in &link.bring_up {
            if let Err(e) = link.transport.send_frame(&step.encode()) {
                warn!(
                    "Bring-up command {:#04x} to {} failed: {}",
                    step.id(),
                    peer,
                    e
                );
            }
        }
        self.sync.force();
        self.recovery.on_recovered(peer);
        info!("{} link recovered", peer);
    }

    fn escalate(&mut self, peer: PeerId) {
        let i = peer.index();
        let failed = {
            let mut queue = self.shared.peers[i].queue.lock();
            if queue.is_closed() {
                return;
            }
            queue.close();
            self.shared.peers[i].failed.store(true, Ordering::Release);
            self.links[i].engine.fail_all(&mut queue)
        };
        error!(
            "{} permanently failed; dropping {} queued commands",
            peer,
            failed.len()
        );
        self.events
            .extend(failed.into_iter().map(|entry| BusEvent::CommandFailed {
                peer,
                command_id: entry.command_id(),
            }));
        self.events.push(BusEvent::PeerFailed { peer });
    }

    /// Diagnostic snapshot.
    pub fn status(&self) -> BusStatus {
        let peers = PeerId::ALL
            .iter()
            .map(|&peer| {
                let link = &self.links[peer.index()];
                let health = self.recovery.peer_health(peer);
                PeerStatus {
                    peer,
                    state: health.state(),
                    recovery_attempts: health.recovery_attempts,
                    queued: self.shared.slot(peer).queue.lock().len(),
                    pending_acks: link.engine.pending_acks(),
                    health: link.health.clone(),
                }
            })
            .collect();
        BusStatus {
            frame_counter: self.frame_counter,
            peers,
            errors: self.recovery.log().iter().copied().collect(),
        }
    }

    /// Diagnostic snapshot as JSON.
    pub fn status_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.status())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;
    use crate::transport::sim::{Behavior, SimulatedPeer};
    use crate::transport::Polarity;

    struct Rig {
        bus: HostBus<SimulatedPeer>,
        graphics: SimulatedPeer,
        audio: SimulatedPeer,
        clock: ManualClock,
    }

    fn rig(config: BusConfig) -> Rig {
        let clock = ManualClock::new();
        let graphics = SimulatedPeer::new(config.polarity).with_clock(Arc::new(clock.clone()));
        let audio = SimulatedPeer::new(config.polarity).with_clock(Arc::new(clock.clone()));
        let bus = HostBus::builder()
            .config(config)
            .clock(Arc::new(clock.clone()))
            .build(graphics.clone(), audio.clone())
            .unwrap();
        Rig {
            bus,
            graphics,
            audio,
            clock,
        }
    }

    #[test]
    fn test_ack_round_trip() {
        let mut r = rig(BusConfig::default());
        let handle = r.bus.handle();

        handle.send(PeerId::Graphics, 0x71, vec![1], true).unwrap();
        r.bus.service_tick();
        r.bus.service_tick();

        assert_eq!(
            r.bus.take_events(),
            vec![BusEvent::CommandAcked {
                peer: PeerId::Graphics,
                command_id: 0x71
            }]
        );
        r.bus.service_tick();
        assert_eq!(handle.queue_len(PeerId::Graphics), 0);
    }

    #[test]
    fn test_first_tick_pushes_sync() {
        let mut r = rig(BusConfig::default());

        r.bus.service_tick();

        assert_eq!(r.graphics.count_of(command::CLOCK_SYNC), 1);
        assert_eq!(r.audio.count_of(command::CLOCK_SYNC), 1);

        r.clock.advance_micros(999_000);
        r.bus.service_tick();
        assert_eq!(r.graphics.count_of(command::CLOCK_SYNC), 1);

        r.clock.advance_micros(2_000);
        r.bus.service_tick();
        assert_eq!(r.graphics.count_of(command::CLOCK_SYNC), 2);
    }

    #[test]
    fn test_memory_full_requests_eviction() {
        let mut r = rig(BusConfig::default());
        r.audio
            .set_behavior_for(0x30, Behavior::Reject(ErrorCode::MEMORY_FULL));

        r.bus.handle().send(PeerId::Audio, 0x30, vec![9], true).unwrap();
        r.bus.service_tick();
        r.bus.service_tick();
        r.bus.service_tick();

        assert_eq!(r.audio.count_of(command::EVICT_CACHE), 1);
        assert_eq!(r.audio.reinit_count(), 0);
        let events = r.bus.take_events();
        assert!(events.contains(&BusEvent::PeerError {
            peer: PeerId::Audio,
            command_id: 0x30,
            code: ErrorCode::MEMORY_FULL
        }));
        assert!(events.contains(&BusEvent::CommandFailed {
            peer: PeerId::Audio,
            command_id: 0x30
        }));
    }

    #[test]
    fn test_busy_error_keeps_entry_for_retry() {
        let mut r = rig(BusConfig::default());
        r.graphics
            .set_behavior_for(0x40, Behavior::Reject(ErrorCode::BUSY));

        r.bus.handle().send(PeerId::Graphics, 0x40, vec![], true).unwrap();
        r.bus.service_tick();
        r.bus.service_tick();

        assert_eq!(r.bus.handle().queue_len(PeerId::Graphics), 1);
        r.graphics.set_behavior_for(0x40, Behavior::AckAll);
        r.clock.advance_micros(60_000);
        r.bus.service_tick();
        r.bus.service_tick();

        assert!(r.bus.take_events().contains(&BusEvent::CommandAcked {
            peer: PeerId::Graphics,
            command_id: 0x40
        }));
        assert_eq!(r.graphics.count_of(0x40), 2);
    }

    #[test]
    fn test_frame_boundary_event() {
        let mut r = rig(BusConfig::default());
        r.graphics.inject(Reply::frame_boundary(0x1234));

        r.bus.service_tick();

        assert_eq!(
            r.bus.take_events(),
            vec![BusEvent::FrameBoundary {
                peer: PeerId::Graphics,
                frame: 0x34
            }]
        );
    }

    #[test]
    fn test_health_failure_resets_transport_and_resends_bring_up() {
        let config = BusConfig::default().with_health_interval(1);
        let clock = ManualClock::new();
        let graphics = SimulatedPeer::new(config.polarity);
        let audio = SimulatedPeer::new(config.polarity);
        let mut bus = HostBus::builder()
            .config(config)
            .clock(Arc::new(clock.clone()))
            .bring_up(PeerId::Graphics, Command::new(0x60, vec![1, 2]).unwrap())
            .build(graphics.clone(), audio.clone())
            .unwrap();
        graphics.set_ping_reply(Some(0x00));

        bus.on_frame();

        assert_eq!(graphics.reinit_count(), 1);
        assert_eq!(graphics.count_of(command::RESET), 1);
        assert_eq!(graphics.count_of(0x60), 1);
        assert_eq!(audio.reinit_count(), 0);
        assert_eq!(
            bus.recovery().peer_health(PeerId::Graphics).recovery_attempts,
            1
        );

        graphics.set_ping_reply(Some(crate::protocol::PING_SENTINEL));
        bus.on_frame();
        assert_eq!(
            bus.recovery().peer_health(PeerId::Graphics).recovery_attempts,
            0
        );
    }

    #[test]
    fn test_escalation_fails_queue_and_rejects() {
        let config = BusConfig::default().with_health_interval(1);
        let mut r = rig(config);
        r.graphics.set_ping_reply(None);
        let handle = r.bus.handle();
        handle.send(PeerId::Graphics, 0x10, vec![], true).unwrap();
        handle.send(PeerId::Graphics, 0x11, vec![], false).unwrap();

        for _ in 0..4 {
            r.bus.on_frame();
        }

        assert!(handle.is_failed(PeerId::Graphics));
        assert!(matches!(
            handle.send(PeerId::Graphics, 0x12, vec![], false),
            Err(BusError::PeerFailed(PeerId::Graphics))
        ));
        let events = r.bus.take_events();
        let failed: Vec<&BusEvent> = events
            .iter()
            .filter(|e| matches!(e, BusEvent::PeerFailed { .. }))
            .collect();
        assert_eq!(failed.len(), 1);
        assert!(events.contains(&BusEvent::CommandFailed {
            peer: PeerId::Graphics,
            command_id: 0x10
        }));

        // Audio is unaffected.
        assert!(!handle.is_failed(PeerId::Audio));
        handle.send(PeerId::Audio, 0x12, vec![], false).unwrap();
    }

    #[test]
    fn test_status_json() {
        let mut r = rig(BusConfig::default());
        r.bus.report(PeerId::Audio, ErrorCode::SYNC_LOST, None);

        let json: serde_json::Value = serde_json::from_str(&r.bus.status_json().unwrap()).unwrap();

        assert_eq!(json["peers"][0]["peer"], "graphics");
        assert_eq!(json["peers"][1]["state"], "healthy");
        assert_eq!(json["errors"][0]["error_code"], 6);
    }

    #[test]
    fn test_stray_ack_ignored() {
        let mut r = rig(BusConfig::default());
        r.graphics.inject(Reply::ack(0x55));

        r.bus.service_tick();

        assert!(r.bus.take_events().is_empty());
    }
}
