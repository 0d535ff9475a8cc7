//! Error types for the AT host

use sm_mux::MuxError;
use sm_pipe::PipeError;
use thiserror::Error;

use crate::mode::OperationMode;

/// Errors from operation mode changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ModeError {
    /// The current mode does not allow this change
    #[error("invalid mode transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: OperationMode,
        to: OperationMode,
    },

    /// A data mode handler is already registered
    #[error("data mode handler already active")]
    AlreadyActive,

    /// No data mode handler is registered
    #[error("no data mode handler")]
    NoHandler,
}

/// Errors returned by an AT engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine does not know the command
    #[error("unsupported command: {0}")]
    Unsupported(String),

    /// The command's parameters are not acceptable
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Entering or leaving data mode failed
    #[error("mode error: {0}")]
    Mode(#[from] ModeError),

    /// The command was accepted but failed
    #[error("{0}")]
    Failed(String),
}

/// Errors from the host worker and its handle
#[derive(Debug, Error)]
pub enum HostError {
    /// The physical link closed
    #[error("serial link closed")]
    LinkClosed,

    /// No multiplexer is running
    #[error("multiplexer not started")]
    NotStarted,

    /// The worker has stopped
    #[error("host worker stopped")]
    WorkerStopped,

    /// Mode error
    #[error("mode error: {0}")]
    Mode(#[from] ModeError),

    /// Multiplexer error
    #[error("multiplexer error: {0}")]
    Mux(#[from] MuxError),

    /// Pipe error
    #[error("pipe error: {0}")]
    Pipe(#[from] PipeError),
}
