//! Error types for pipes and URC buffering

use thiserror::Error;

/// Errors returned by [`Pipe`](crate::Pipe) operations
#[derive(Debug, Error)]
pub enum PipeError {
    /// `open()` on a pipe that is already open
    #[error("pipe already open")]
    AlreadyOpen,

    /// `close()` on a pipe that is not open
    #[error("pipe already closed")]
    AlreadyClosed,

    /// Data operation on a closed pipe
    #[error("pipe not open")]
    NotOpen,

    /// The pipe cannot be opened yet (previous session still shutting down, no runtime)
    #[error("pipe not ready: {0}")]
    NotReady(&'static str),

    /// Invalid argument (empty transmit, unknown channel)
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port error
    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),
}

/// Errors returned by the non-blocking URC path
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum UrcError {
    /// Not enough room in the URC buffer; the message was dropped
    #[error("URC buffer full: {requested} bytes requested, {available} available")]
    BufferFull { requested: usize, available: usize },
}
