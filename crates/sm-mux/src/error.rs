//! Error types for the multiplexer

use thiserror::Error;

/// Errors that can occur in the multiplexer
#[derive(Debug, Error)]
pub enum MuxError {
    /// Multiplexer is not running
    #[error("multiplexer not started")]
    NotStarted,

    /// Multiplexer is already running
    #[error("multiplexer already started")]
    AlreadyStarted,

    /// DLCI outside 1..=channel count
    #[error("invalid channel: {0}")]
    InvalidChannel(u8),

    /// The channel carries AT traffic and cannot be reserved
    #[error("channel {0} is the AT channel")]
    AtChannel(u8),

    /// Channel already handed to a consumer
    #[error("channel {0} already reserved")]
    AlreadyReserved(u8),

    /// Release of a channel that was never reserved
    #[error("channel {0} not reserved")]
    NotReserved(u8),

    /// Pipe error
    #[error("pipe error: {0}")]
    Pipe(#[from] sm_pipe::PipeError),
}
