//! Command line accumulator
//!
//! Collects command-mode bytes until a line terminator outside double quotes, handling
//! backspace editing and overlong lines.

use sm_protocol::LineTermination;

/// Initial capacity and growth step of the line buffer
pub const AT_BUF_MIN: usize = 128;

const BACKSPACE: u8 = 0x08;
const DELETE: u8 = 0x7F;

/// Result of pushing one byte
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Accumulated {
    /// The byte was stored
    Stored,
    /// The byte removed the previously stored one
    Erased,
    /// The byte belongs to an overlong line and was dropped
    Discarded,
    /// The line exceeded the maximum; reported once per line
    Overflow,
    /// The byte terminated an empty line
    Empty,
    /// The byte terminated a line
    Complete(Vec<u8>),
}

/// Accumulates one command line at a time
#[derive(Debug)]
pub struct CommandAccumulator {
    buf: Vec<u8>,
    max_len: usize,
    termination: LineTermination,
    in_quotes: bool,
    previous: Option<u8>,
    discarding: bool,
}

impl CommandAccumulator {
    pub fn new(termination: LineTermination, max_len: usize) -> Self {
        Self {
            buf: Vec::with_capacity(AT_BUF_MIN),
            max_len,
            termination,
            in_quotes: false,
            previous: None,
            discarding: false,
        }
    }

    /// Number of bytes stored for the current line
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Whether the last stored byte opened a quoted string
    pub fn in_quotes(&self) -> bool {
        self.in_quotes
    }

    /// Current buffer capacity
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    pub fn termination(&self) -> LineTermination {
        self.termination
    }

    /// Drop the current line and all parse state
    pub fn reset(&mut self) {
        self.clear_line();
        self.previous = None;
        self.discarding = false;
    }

    fn clear_line(&mut self) {
        self.buf.clear();
        if self.buf.capacity() > AT_BUF_MIN {
            self.buf.shrink_to(AT_BUF_MIN);
        }
        self.in_quotes = false;
    }

    pub fn push(&mut self, byte: u8) -> Accumulated {
        let previous = self.previous.replace(byte);

        if self.discarding {
            if self.termination.terminates(byte, previous) {
                self.discarding = false;
            }
            return Accumulated::Discarded;
        }

        if byte == BACKSPACE || byte == DELETE {
            if let Some(removed) = self.buf.pop() {
                if removed == b'"' {
                    self.in_quotes = !self.in_quotes;
                }
            }
            return Accumulated::Erased;
        }

        if !self.in_quotes && self.termination.terminates(byte, previous) {
            if self.termination == LineTermination::CrLf && self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
            let line = std::mem::take(&mut self.buf);
            self.clear_line();
            self.buf.reserve(AT_BUF_MIN);
            return if line.is_empty() {
                Accumulated::Empty
            } else {
                Accumulated::Complete(line)
            };
        }

        if self.buf.len() >= self.max_len {
            self.clear_line();
            // The rest of the line goes too, unless this byte already ended it
            self.discarding = !self.termination.terminates(byte, previous);
            return Accumulated::Overflow;
        }

        if byte == b'"' {
            self.in_quotes = !self.in_quotes;
        }
        if self.buf.len() == self.buf.capacity() {
            self.buf.reserve_exact(AT_BUF_MIN);
        }
        self.buf.push(byte);
        Accumulated::Stored
    }
}
