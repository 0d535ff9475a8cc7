//! Error types for envelope checking and frame decoding

use thiserror::Error;

/// Errors that can occur while decoding multiplexer frames
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Buffer is incomplete - need more data
    #[error("incomplete data: need {needed} more bytes")]
    Incomplete { needed: usize },

    /// Invalid frame structure
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Frame information field exceeds the negotiated maximum
    #[error("frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },

    /// Frame check sequence mismatch
    #[error("checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    ChecksumMismatch { expected: u8, actual: u8 },
}

/// Reasons a completed command line fails the AT envelope check
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeError {
    /// Line does not start with "AT"
    #[error("command does not start with AT")]
    MissingPrefix,

    /// Character after "AT" is not one of `+`, `%`, `#`
    #[error("missing command separator")]
    MissingSeparator,

    /// Nothing between the separator and the suffix
    #[error("empty command body")]
    EmptyBody,

    /// Body contains something other than alphanumerics or '_'
    #[error("invalid character {0:?} in command")]
    InvalidCharacter(char),

    /// Trailing characters after a read suffix
    #[error("invalid command suffix")]
    InvalidSuffix,
}
