//! AT command envelope check
//!
//! The host does not understand AT commands; it only verifies that a completed line
//! has the shape `AT[<sep><body>[?|=|=?|=<params>]]` before handing it to the engine.
//! `ATE0`/`ATE1` and `ATD*...` are accepted as special forms.

use crate::error::EnvelopeError;

/// Separators allowed between "AT" and the command body
pub const SEPARATORS: [u8; 3] = [b'+', b'%', b'#'];

/// Kind of AT command, derived from its suffix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOp {
    /// `AT+CMD`
    Action,
    /// `AT+CMD?`
    Read,
    /// `AT+CMD=?`
    Test,
    /// `AT+CMD=<params>`
    Set,
}

/// A command line that passed the envelope check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope<'a> {
    /// The full command, starting at "AT"
    pub line: &'a str,
    /// Command name including the "AT" prefix, e.g. `AT+CGMR` or `ATE1`
    pub name: &'a str,
    /// Suffix kind
    pub op: CommandOp,
    /// Everything after '=' for set commands, empty otherwise
    pub params: &'a str,
}

impl Envelope<'_> {
    /// Case-insensitive comparison of the command name
    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// Find where the AT command starts in a completed line
///
/// Serial lines can carry noise at power-up, so everything before the first
/// case-insensitive "AT" is ignored. Returns `None` when the line contains no "AT".
pub fn find_command_start(line: &[u8]) -> Option<usize> {
    line.windows(2).position(|w| w.eq_ignore_ascii_case(b"AT"))
}

/// Check that `line` is a syntactically acceptable AT command
pub fn parse_envelope(line: &str) -> Result<Envelope<'_>, EnvelopeError> {
    let bytes = line.as_bytes();
    if bytes.len() < 2 || !bytes[..2].eq_ignore_ascii_case(b"AT") {
        return Err(EnvelopeError::MissingPrefix);
    }

    let simple = |name| Envelope {
        line,
        name,
        op: CommandOp::Action,
        params: "",
    };

    let rest = &bytes[2..];
    let Some(&first) = rest.first() else {
        return Ok(simple(line));
    };

    // ATE0 / ATE1
    if first.eq_ignore_ascii_case(&b'E') && matches!(rest, [_, b'0' | b'1']) {
        return Ok(simple(line));
    }

    // ATD is only valid as ATD*<dial string>
    if first.eq_ignore_ascii_case(&b'D') {
        return match rest.get(1) {
            Some(b'*') => Ok(Envelope {
                line,
                name: &line[..3],
                op: CommandOp::Set,
                params: &line[3..],
            }),
            _ => Err(EnvelopeError::MissingSeparator),
        };
    }

    if !SEPARATORS.contains(&first) {
        return Err(EnvelopeError::MissingSeparator);
    }

    let body_len = rest[1..]
        .iter()
        .take_while(|&&c| c.is_ascii_alphanumeric() || c == b'_')
        .count();
    if body_len == 0 {
        return Err(EnvelopeError::EmptyBody);
    }

    let name_end = 3 + body_len;
    let name = &line[..name_end];
    let suffix = &line[name_end..];

    let (op, params) = match suffix.as_bytes() {
        [] => (CommandOp::Action, ""),
        [b'?'] => (CommandOp::Read, ""),
        [b'?', ..] => return Err(EnvelopeError::InvalidSuffix),
        [b'=', b'?'] => (CommandOp::Test, ""),
        [b'=', b'?', ..] => return Err(EnvelopeError::InvalidSuffix),
        [b'=', ..] => (CommandOp::Set, &suffix[1..]),
        _ => {
            let c = suffix.chars().next().unwrap_or('\0');
            return Err(EnvelopeError::InvalidCharacter(c));
        }
    };

    Ok(Envelope {
        line,
        name,
        op,
        params,
    })
}
