//! Command line termination conventions

/// How the host terminates command lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum LineTermination {
    /// Bare carriage return
    #[default]
    Cr,
    /// Bare line feed
    Lf,
    /// Carriage return followed by line feed
    CrLf,
}

impl LineTermination {
    /// Bytes sent as terminator
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            LineTermination::Cr => b"\r",
            LineTermination::Lf => b"\n",
            LineTermination::CrLf => b"\r\n",
        }
    }

    /// Number of bytes in the terminator
    pub fn byte_count(&self) -> usize {
        self.as_bytes().len()
    }

    /// Whether `byte` ends a command, given the previously received byte
    pub fn terminates(&self, byte: u8, previous: Option<u8>) -> bool {
        match self {
            LineTermination::Cr => byte == b'\r',
            LineTermination::Lf => byte == b'\n',
            LineTermination::CrLf => byte == b'\n' && previous == Some(b'\r'),
        }
    }
}
