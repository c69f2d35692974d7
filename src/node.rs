//! Peer-side runtime: receive, dispatch, reply.
//!
//! A [`PeerNode`] runs on a coprocessor's transport core. Each
//! [`poll`](PeerNode::poll) drains frames the host wrote, answers the
//! protocol-reserved commands itself and routes everything else to the
//! [`HandlerRegistry`].
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use conbus::node::PeerNode;
//! use conbus::protocol::ErrorCode;
//! use conbus::transport::{loopback, Polarity};
//! use conbus::{ManualClock, PeerId};
//!
//! let (_host_end, peer_end) = loopback::pair(Polarity::ActiveLow);
//! let node = PeerNode::builder(PeerId::Audio)
//!     .clock(Arc::new(ManualClock::new()))
//!     .handle(0x30, |payload, _ctx| {
//!         if payload.is_empty() { Err(ErrorCode::INVALID_PARAMS) } else { Ok(()) }
//!     })
//!     .build(peer_end)
//!     .unwrap();
//! assert_eq!(node.peer(), PeerId::Audio);
//! ```

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::clock_sync::{ClockSync, ClockSyncState, SyncPayload};
use crate::config::BusConfig;
use crate::error::{BusError, Result};
use crate::handler::{CommandContext, HandlerRegistry, HandlerResult, ReplyPolicy};
use crate::peer::PeerId;
use crate::protocol::{command, Command, ErrorCode, Reply, PING_SENTINEL};
use crate::time::{Clock, MonotonicClock, Micros};
use crate::transport::{Link, PeerTransport};

type ResetHook = Box<dyn FnMut() + Send>;
type EvictHook = Box<dyn FnMut() -> HandlerResult + Send>;

/// Builder for a [`PeerNode`].
pub struct PeerNodeBuilder {
    peer: PeerId,
    config: BusConfig,
    clock: Option<Arc<dyn Clock>>,
    registry: HandlerRegistry,
    on_reset: Option<ResetHook>,
    on_evict_cache: Option<EvictHook>,
    error: Option<BusError>,
}

impl PeerNodeBuilder {
    fn new(peer: PeerId) -> Self {
        Self {
            peer,
            config: BusConfig::default(),
            clock: None,
            registry: HandlerRegistry::new(),
            on_reset: None,
            on_evict_cache: None,
            error: None,
        }
    }

    /// Use this configuration (polarity and handshake timeouts).
    pub fn config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    /// Use this clock. Defaults to [`MonotonicClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    fn register<F>(mut self, command_id: u8, policy: ReplyPolicy, handler: F) -> Self
    where
        F: FnMut(&[u8], &CommandContext) -> HandlerResult + Send + 'static,
    {
        if let Err(e) = self.registry.register(command_id, policy, handler) {
            self.error.get_or_insert(e);
        }
        self
    }

    /// Register a handler that is acknowledged on success.
    ///
    /// Registering a reserved id makes [`build`](Self::build) fail.
    pub fn handle<F>(self, command_id: u8, handler: F) -> Self
    where
        F: FnMut(&[u8], &CommandContext) -> HandlerResult + Send + 'static,
    {
        self.register(command_id, ReplyPolicy::Ack, handler)
    }

    /// Register a handler that stays silent on success.
    pub fn handle_silent<F>(self, command_id: u8, handler: F) -> Self
    where
        F: FnMut(&[u8], &CommandContext) -> HandlerResult + Send + 'static,
    {
        self.register(command_id, ReplyPolicy::Silent, handler)
    }

    /// Called when the host sends `RESET`.
    pub fn on_reset<F>(mut self, hook: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        self.on_reset = Some(Box::new(hook));
        self
    }

    /// Called when the host asks for cache eviction.
    pub fn on_evict_cache<F>(mut self, hook: F) -> Self
    where
        F: FnMut() -> HandlerResult + Send + 'static,
    {
        self.on_evict_cache = Some(Box::new(hook));
        self
    }

    /// Build the node on `link`.
    pub fn build<L: Link>(self, link: L) -> Result<PeerNode<L>> {
        if let Some(e) = self.error {
            return Err(e);
        }
        self.config.validate()?;
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(MonotonicClock::new()) as Arc<dyn Clock>);
        Ok(PeerNode {
            transport: PeerTransport::new(self.peer, link, clock.clone(), self.config.transport()),
            registry: self.registry,
            clock_sync: ClockSync::new(clock),
            on_reset: self.on_reset,
            on_evict_cache: self.on_evict_cache,
            notify_once: false,
            notify_continuous: false,
        })
    }
}

/// What to send back for one command.
enum Response {
    None,
    Reply(Reply),
    Sentinel,
}

/// Peer-side bus endpoint.
pub struct PeerNode<L> {
    transport: PeerTransport<L>,
    registry: HandlerRegistry,
    clock_sync: ClockSync,
    on_reset: Option<ResetHook>,
    on_evict_cache: Option<EvictHook>,
    notify_once: bool,
    notify_continuous: bool,
}

impl PeerNode<()> {
    /// Start building a node for `peer`.
    pub fn builder(peer: PeerId) -> PeerNodeBuilder {
        PeerNodeBuilder::new(peer)
    }
}

impl<L: Link> PeerNode<L> {
    /// Which peer this node is.
    pub fn peer(&self) -> PeerId {
        self.transport.peer()
    }

    /// Host time estimate.
    pub fn master_time(&self) -> Micros {
        self.clock_sync.master_time()
    }

    /// Synchronization state.
    pub fn sync_state(&self) -> ClockSyncState {
        self.clock_sync.state()
    }

    /// Whether a frame-boundary notification would be sent now.
    pub fn notifications_pending(&self) -> bool {
        self.notify_once || self.notify_continuous
    }

    /// Receive and handle everything the host has sent.
    ///
    /// Returns the number of commands handled. Replies the host never
    /// collects are abandoned; the host's retry timer covers them.
    ///
    /// # Errors
    ///
    /// A link failure while replying does not stop dispatch: every received
    /// command is still handled and the first failure is returned at the end.
    pub fn poll(&mut self) -> Result<usize> {
        let commands = self.transport.receive()?;
        let handled = commands.len();
        let mut first_error = None;
        for frame in commands {
            let sent = match self.handle(&frame) {
                Response::None => continue,
                Response::Reply(reply) => self.transport.send_reply(&reply),
                Response::Sentinel => self.transport.send_raw(&[PING_SENTINEL]),
            };
            if let Err(e) = sent {
                warn!("Reply to {:#04x} on {} link failed: {}", frame.id(), self.peer(), e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(handled),
        }
    }

    fn handle(&mut self, frame: &Command) -> Response {
        let id = frame.id();
        match id {
            command::NOP => Response::Sentinel,
            command::RESET => {
                info!("{} reset by host", self.peer());
                self.notify_once = false;
                self.notify_continuous = false;
                if let Some(hook) = self.on_reset.as_mut() {
                    hook();
                }
                Response::None
            }
            command::EVICT_CACHE => match self.on_evict_cache.as_mut().map(|hook| hook()) {
                Some(Err(code)) => Response::Reply(Reply::error(id, code)),
                _ => Response::None,
            },
            command::CLOCK_SYNC => match SyncPayload::decode(frame.payload()) {
                Ok(sync) => {
                    self.clock_sync.on_sync(sync);
                    Response::None
                }
                Err(e) => {
                    warn!("Rejecting clock sync: {}", e);
                    Response::Reply(Reply::error(id, ErrorCode::INVALID_PARAMS))
                }
            },
            command::SYNC_NOTIFY_REQUEST => {
                self.notify_once = true;
                Response::None
            }
            command::SYNC_NOTIFY_CANCEL => {
                self.notify_once = false;
                Response::None
            }
            command::FRAME_NOTIFY_ENABLE => {
                self.notify_continuous = true;
                Response::None
            }
            command::FRAME_NOTIFY_DISABLE => {
                self.notify_continuous = false;
                Response::None
            }
            command::ACK | command::ERROR | command::FRAME_BOUNDARY => {
                debug!("Host sent reply-only id {:#04x}", id);
                Response::Reply(Reply::error(id, ErrorCode::INVALID_COMMAND))
            }
            _ => {
                let ctx = CommandContext::new(
                    id,
                    self.clock_sync.master_time(),
                    self.clock_sync.frame_counter(),
                );
                self.registry
                    .dispatch(frame, &ctx)
                    .map_or(Response::None, Response::Reply)
            }
        }
    }

    /// Signal the end of a local frame to the host, if it asked for it.
    ///
    /// Returns whether a notification was delivered.
    pub fn notify_frame_boundary(&mut self) -> Result<bool> {
        if !self.notifications_pending() {
            return Ok(false);
        }
        let reply = Reply::frame_boundary(self.clock_sync.frame_counter());
        let sent = self.transport.send_reply(&reply)?;
        if sent {
            self.notify_once = false;
        }
        Ok(sent)
    }

    /// Report an error the host did not ask about (e.g. a full cache).
    pub fn report_error(&mut self, command_id: u8, code: ErrorCode) -> Result<bool> {
        self.transport.send_reply(&Reply::error(command_id, code))
    }

    /// Drop synchronization and tell the host. Master time falls back to the
    /// local clock until the next periodic sync.
    pub fn report_sync_lost(&mut self) -> Result<bool> {
        warn!("{} lost clock synchronization", self.peer());
        self.clock_sync.reset();
        self.report_error(command::CLOCK_SYNC, ErrorCode::SYNC_LOST)
    }

    /// Reset the link after a local fault.
    pub fn reset_link(&mut self) -> Result<()> {
        self.transport.reset()
    }
}
