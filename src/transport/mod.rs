//! Transport module - the select/ready handshake and link implementations.
//!
//! Provides:
//! - [`Link`] - one end of a synchronous serial link with two control lines
//! - [`HostTransport`] / [`PeerTransport`] - the bounded handshake state machine
//! - [`sim::SimulatedPeer`] - scripted peer for deterministic host tests
//! - [`loopback::pair`] - in-memory link pair for host/peer runs in one process

mod handshake;
mod lines;
pub mod loopback;
pub mod sim;

pub use handshake::{
    HostTransport, PeerTransport, TransportConfig, DEFAULT_BUSY_WAIT, DEFAULT_READ_TIMEOUT,
    DEFAULT_REPLY_TIMEOUT,
};
pub use lines::{Level, Link, Polarity};
pub use loopback::LoopbackLink;
