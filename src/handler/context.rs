//! Context handed to command handlers.
//!
//! Domain code on a peer never reads the local clock directly: master time and
//! the master frame counter come from the latest clock sync, through here.

use crate::time::Micros;

/// Per-command view of bus state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandContext {
    command_id: u8,
    master_time: Micros,
    frame_counter: u32,
}

impl CommandContext {
    /// Create a context.
    pub fn new(command_id: u8, master_time: Micros, frame_counter: u32) -> Self {
        Self {
            command_id,
            master_time,
            frame_counter,
        }
    }

    /// Id of the command being handled.
    #[inline]
    pub fn command_id(&self) -> u8 {
        self.command_id
    }

    /// Host time in microseconds when the command was dispatched.
    #[inline]
    pub fn master_time(&self) -> Micros {
        self.master_time
    }

    /// Host frame counter from the latest sync.
    #[inline]
    pub fn frame_counter(&self) -> u32 {
        self.frame_counter
    }
}
