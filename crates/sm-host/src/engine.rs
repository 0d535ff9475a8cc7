//! The AT engine seam
//!
//! The host only routes command lines; an [`AtEngine`] executes them. While running a
//! command the engine reaches back into the host through [`HostContext`].

use sm_pipe::UrcError;

use crate::datamode::DataModeHandler;
use crate::error::{EngineError, ModeError};

/// What the engine produced for a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtReply {
    /// Response text ending in a final result code; the host frames it
    Response(String),
    /// Nothing to send, the engine answered through the context or will later
    Silent,
}

impl AtReply {
    /// Plain `OK`
    pub fn ok() -> Self {
        AtReply::Response("OK\r\n".to_string())
    }
}

/// Executes AT commands that passed the envelope check
///
/// `command` starts at "AT" and is passed through as received. Only the command name is
/// checked by the host; parameters may hold any bytes, including quoted binary or
/// Latin-1 text.
pub trait AtEngine: Send {
    fn execute(&mut self, command: &[u8], ctx: &mut dyn HostContext)
        -> Result<AtReply, EngineError>;
}

/// Host services available to the engine and to data mode handlers
pub trait HostContext {
    /// Send text to the host on the AT channel, as is
    fn send_response(&mut self, text: &str);

    /// Queue an unsolicited notification
    ///
    /// Never blocks. Delivery is deferred while the host is not in command mode.
    fn send_urgent(&mut self, text: &str) -> Result<(), UrcError>;

    /// Send raw payload to the host
    fn send_data(&mut self, data: &[u8]);

    /// Switch to data mode with `handler`
    ///
    /// With `expected_len > 0` the session ends by itself after that many bytes;
    /// otherwise it ends on the quit string.
    fn enter_data_mode(
        &mut self,
        handler: Box<dyn DataModeHandler>,
        expected_len: usize,
    ) -> Result<(), ModeError>;

    /// Abort the data mode session; further bytes are dropped until the quit string
    fn exit_data_mode_forcibly(&mut self, result: i32);

    fn in_data_mode(&self) -> bool;

    fn in_command_mode(&self) -> bool;
}
