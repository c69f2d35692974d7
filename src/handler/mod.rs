//! Handler module - peer-side command dispatch.
//!
//! Provides:
//! - [`HandlerRegistry`] - maps command ids to domain handlers
//! - [`CommandContext`] - what a handler may know besides its payload
//!
//! # Example
//!
//! ```
//! use conbus::handler::{CommandContext, HandlerRegistry, ReplyPolicy};
//! use conbus::protocol::{Command, ErrorCode, ReplyKind};
//!
//! let mut registry = HandlerRegistry::new();
//! registry
//!     .register(0x71, ReplyPolicy::Ack, |payload: &[u8], _ctx: &CommandContext| {
//!         if payload.len() == 4 { Ok(()) } else { Err(ErrorCode::INVALID_PARAMS) }
//!     })
//!     .unwrap();
//!
//! let ctx = CommandContext::new(0x71, 0, 0);
//! let reply = registry.dispatch(&Command::new(0x71, vec![0, 1, 64, 200]).unwrap(), &ctx);
//! assert_eq!(reply.unwrap().kind, ReplyKind::Ack);
//! ```

mod context;
mod registry;

pub use context::CommandContext;
pub use registry::{Handler, HandlerRegistry, HandlerResult, ReplyPolicy};
