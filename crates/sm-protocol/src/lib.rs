//! Serial Modem Protocol Library
//!
//! This crate provides the byte-level codecs used by the serial modem host:
//!
//! - **AT envelope**: the minimal grammar check applied to a completed command line
//!   before it is routed to the AT engine
//! - **Response framing**: TS 27.007 style formatting of final result codes
//! - **Quit string**: streaming detection of the byte sequence that ends raw data mode
//! - **CMUX**: 3GPP TS 27.010 basic-mode frames used to multiplex the serial link
//!
//! # Architecture
//!
//! Nothing in this crate touches I/O. Every codec is a plain state machine fed with
//! bytes, so the same code runs against a real UART, a `tokio::io::duplex` pair in tests,
//! or a multiplexed channel.
//!
//! # Example
//!
//! ```rust
//! use sm_protocol::cmux::{CmuxCodec, Frame, FrameType};
//! use sm_protocol::ProtocolCodec;
//!
//! let frame = Frame::uih(1, b"AT\r".to_vec());
//! let mut codec = CmuxCodec::new(127);
//! codec.push_bytes(&frame.encode());
//!
//! let decoded = codec.next_frame().unwrap();
//! assert_eq!(decoded.dlci, 1);
//! assert_eq!(decoded.frame_type, FrameType::Uih);
//! assert_eq!(decoded.info, b"AT\r");
//! ```

pub mod cmux;
pub mod envelope;
pub mod error;
pub mod framing;
pub mod quit;
pub mod termination;

pub use envelope::{find_command_start, parse_envelope, CommandOp, Envelope};
pub use error::{EnvelopeError, ParseError};
pub use framing::{datamode_exit_line, format_final_result, CRLF, ERROR_RESPONSE, OK_RESPONSE};
pub use quit::{QuitMatcher, QuitStep, DEFAULT_QUIT_STRING};
pub use termination::LineTermination;

/// Trait for codecs that parse frames out of an incoming byte stream
pub trait ProtocolCodec {
    /// The frame type produced by this codec
    type Frame;

    /// Push raw bytes into the codec's buffer
    fn push_bytes(&mut self, data: &[u8]);

    /// Try to extract the next complete frame from the buffer
    fn next_frame(&mut self) -> Option<Self::Frame>;

    /// Try to extract the next complete frame along with its raw bytes
    ///
    /// Useful for traffic logging where the exact wire bytes matter.
    fn next_frame_with_bytes(&mut self) -> Option<(Self::Frame, Vec<u8>)>;

    /// Clear the internal buffer
    fn clear(&mut self);
}
