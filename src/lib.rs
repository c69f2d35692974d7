//! # conbus
//!
//! Reliable command bus between a console's host controller and its graphics
//! and audio coprocessors.
//!
//! The host drives each peer over a half-duplex serial link framed by two
//! control lines (select and ready). On top of that handshake the bus adds
//! bounded per-peer command queues, ACK tracking with timed retransmission,
//! periodic clock synchronization, health pings and bounded error recovery.
//!
//! ## Architecture
//!
//! - **Host** ([`HostBus`]): queues, retries, sync pushes, health and recovery
//!   for both peers, usually driven by [`spawn_service_task`]
//! - **Peer** ([`PeerNode`]): frame reception, dispatch to registered domain
//!   handlers, ACK/ERROR replies and the synchronized clock
//! - **Transport** ([`transport`]): the select/ready handshake over any
//!   [`Link`](transport::Link)
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use conbus::transport::{sim::SimulatedPeer, Polarity};
//! use conbus::{BusConfig, HostBus, ManualClock, PeerId};
//!
//! let graphics = SimulatedPeer::new(Polarity::ActiveLow);
//! let audio = SimulatedPeer::new(Polarity::ActiveLow);
//! let mut bus = HostBus::builder()
//!     .config(BusConfig::default())
//!     .clock(Arc::new(ManualClock::new()))
//!     .build(graphics.clone(), audio)
//!     .unwrap();
//!
//! bus.handle().send(PeerId::Graphics, 0x71, vec![0, 1, 64, 200], false).unwrap();
//! bus.service_tick();
//!
//! assert_eq!(graphics.count_of(0x71), 1);
//! ```

pub mod clock_sync;
pub mod config;
pub mod error;
pub mod handler;
pub mod health;
pub mod host;
pub mod node;
pub mod peer;
pub mod protocol;
pub mod queue;
pub mod recovery;
pub mod reliability;
pub mod service;
pub mod time;
pub mod transport;

pub use config::BusConfig;
pub use error::{BusError, Result};
pub use handler::{CommandContext, HandlerResult, ReplyPolicy};
pub use host::{BusEvent, BusHandle, BusStatus, HostBus, HostBusBuilder};
pub use node::{PeerNode, PeerNodeBuilder};
pub use peer::PeerId;
pub use protocol::{Command, ErrorCode, Reply};
pub use service::{spawn_service_task, ControlEvent, ServiceHandle};
pub use time::{Clock, ManualClock, MonotonicClock};
