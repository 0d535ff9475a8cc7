//! Data mode handlers
//!
//! A command that switches to data mode registers a [`DataModeHandler`]. The host
//! feeds it buffered payload and tells it when the session ends.

use crate::engine::HostContext;

/// Flags passed with every handler call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataModeFlags {
    /// More payload is already waiting behind this chunk
    pub more_data: bool,
    /// The session is ending because the handler side gave up
    pub exit_handler: bool,
}

impl DataModeFlags {
    pub const MORE_DATA: Self = Self {
        more_data: true,
        exit_handler: false,
    };

    pub const EXIT_HANDLER: Self = Self {
        more_data: false,
        exit_handler: true,
    };
}

/// Consumer of data mode payload
///
/// Called from the worker only.
pub trait DataModeHandler: Send {
    /// Take payload
    ///
    /// `Ok(n)` with `n > 0` means `n` bytes were consumed and the host offers the rest
    /// again; `Ok(0)` means everything was consumed. `Err(code)` aborts the session.
    fn send(&mut self, data: &[u8], flags: DataModeFlags) -> Result<usize, i32>;

    /// The session ended
    fn exit(&mut self, flags: DataModeFlags, ctx: &mut dyn HostContext);
}
