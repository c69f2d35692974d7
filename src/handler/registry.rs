//! Handler registry for dispatching commands by id.
//!
//! Domain code registers one handler per command id together with a
//! [`ReplyPolicy`]. Protocol-reserved ids are handled by the peer node itself
//! and cannot be registered.

use std::collections::HashMap;

use tracing::{debug, warn};

use super::CommandContext;
use crate::error::{BusError, Result};
use crate::protocol::{command, Command, ErrorCode, Reply};

/// Result type for handler functions: the error becomes an ERROR packet.
pub type HandlerResult = std::result::Result<(), ErrorCode>;

/// Trait for command handlers.
pub trait Handler: Send + 'static {
    /// Handle one command payload.
    fn call(&mut self, payload: &[u8], ctx: &CommandContext) -> HandlerResult;
}

impl<F> Handler for F
where
    F: FnMut(&[u8], &CommandContext) -> HandlerResult + Send + 'static,
{
    fn call(&mut self, payload: &[u8], ctx: &CommandContext) -> HandlerResult {
        self(payload, ctx)
    }
}

/// Whether a successful command is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyPolicy {
    /// Send an ACK on success.
    Ack,
    /// Stay silent on success. Failures are still reported.
    Silent,
}

/// Entry for a registered command.
struct CommandEntry {
    handler: Box<dyn Handler>,
    policy: ReplyPolicy,
}

/// Registry mapping command ids to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    commands: HashMap<u8, CommandEntry>,
}

impl HandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a closure, replacing any previous handler for `command_id`.
    ///
    /// # Errors
    ///
    /// `ReservedCommandId` for protocol-reserved ids.
    pub fn register<F>(&mut self, command_id: u8, policy: ReplyPolicy, handler: F) -> Result<()>
    where
        F: FnMut(&[u8], &CommandContext) -> HandlerResult + Send + 'static,
    {
        self.register_handler(command_id, policy, handler)
    }

    /// Register any [`Handler`] implementation.
    pub fn register_handler<H: Handler>(
        &mut self,
        command_id: u8,
        policy: ReplyPolicy,
        handler: H,
    ) -> Result<()> {
        if command::is_reserved(command_id) {
            return Err(BusError::ReservedCommandId(command_id));
        }
        let entry = CommandEntry {
            handler: Box::new(handler),
            policy,
        };
        if self.commands.insert(command_id, entry).is_some() {
            debug!("Replaced handler for {:#04x}", command_id);
        }
        Ok(())
    }

    /// Check if a handler is registered.
    pub fn contains(&self, command_id: u8) -> bool {
        self.commands.contains_key(&command_id)
    }

    /// Reply policy of a registered command.
    pub fn reply_policy(&self, command_id: u8) -> Option<ReplyPolicy> {
        self.commands.get(&command_id).map(|e| e.policy)
    }

    /// Number of registered commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Run the handler for `command` and build the reply to send, if any.
    pub fn dispatch(&mut self, command: &Command, ctx: &CommandContext) -> Option<Reply> {
        let id = command.id();
        let Some(entry) = self.commands.get_mut(&id) else {
            warn!("No handler for command {:#04x}", id);
            return Some(Reply::error(id, ErrorCode::INVALID_COMMAND));
        };

        match entry.handler.call(command.payload(), ctx) {
            Ok(()) => match entry.policy {
                ReplyPolicy::Ack => Some(Reply::ack(id)),
                ReplyPolicy::Silent => None,
            },
            Err(code) => {
                debug!("Handler for {:#04x} failed: {}", id, code);
                Some(Reply::error(id, code))
            }
        }
    }
}
