//! CMUX frame codec (3GPP TS 27.010, basic option)
//!
//! Frame layout:
//!
//! ```text
//! F9 | address | control | length (1-2 bytes) | information | FCS | F9
//! ```
//!
//! - Address: EA bit (always 1), C/R bit, DLCI in the upper six bits
//! - Length: EA bit set means a single byte holding 7 bits of length, otherwise a
//!   second byte supplies the upper 8 bits
//! - FCS: CRC-8 over address, control and length, complemented

use tracing::warn;

use crate::error::ParseError;
use crate::ProtocolCodec;

/// Opening and closing flag
pub const FLAG: u8 = 0xF9;

/// Poll/Final bit in the control field
pub const PF: u8 = 0x10;

/// Control channel DLCI
pub const CONTROL_DLCI: u8 = 0;

/// Highest DLCI representable in the address field
pub const MAX_DLCI: u8 = 63;

const EA: u8 = 0x01;
const CR: u8 = 0x02;

/// Value left in the CRC register after running a frame's header and FCS through it
const FCS_GOOD: u8 = 0xCF;

const CRC_TABLE: [u8; 256] = build_crc_table();

/// Reflected CRC-8 (polynomial x^8 + x^2 + x + 1) used by TS 27.010
const fn build_crc_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x01 != 0 {
                (crc >> 1) ^ 0xE0
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

fn crc(data: &[u8]) -> u8 {
    data.iter().fold(0xFF, |crc, &b| CRC_TABLE[(crc ^ b) as usize])
}

/// Frame check sequence for the given header bytes
pub fn fcs(header: &[u8]) -> u8 {
    0xFF - crc(header)
}

/// Frame types of the basic option
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Set asynchronous balanced mode (open a DLCI)
    Sabm,
    /// Unnumbered acknowledgement
    Ua,
    /// Disconnected mode
    Dm,
    /// Disconnect (close a DLCI)
    Disc,
    /// Unnumbered information with header check
    Uih,
}

impl FrameType {
    /// Control field value without the P/F bit
    pub fn control(&self) -> u8 {
        match self {
            FrameType::Sabm => 0x2F,
            FrameType::Ua => 0x63,
            FrameType::Dm => 0x0F,
            FrameType::Disc => 0x43,
            FrameType::Uih => 0xEF,
        }
    }

    /// Decode a control field, ignoring the P/F bit
    pub fn from_control(control: u8) -> Option<Self> {
        match control & !PF {
            0x2F => Some(FrameType::Sabm),
            0x63 => Some(FrameType::Ua),
            0x0F => Some(FrameType::Dm),
            0x43 => Some(FrameType::Disc),
            0xEF => Some(FrameType::Uih),
            _ => None,
        }
    }
}

/// A decoded CMUX frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Data link connection identifier
    pub dlci: u8,
    /// Command/response bit as found in the address field
    pub cr: bool,
    /// Frame type
    pub frame_type: FrameType,
    /// Poll/final bit
    pub pf: bool,
    /// Information field
    pub info: Vec<u8>,
}

impl Frame {
    /// Create a frame
    pub fn new(dlci: u8, frame_type: FrameType, cr: bool, pf: bool, info: Vec<u8>) -> Self {
        Self {
            dlci,
            cr,
            frame_type,
            pf,
            info,
        }
    }

    /// Data frame as sent by the responding station
    pub fn uih(dlci: u8, info: Vec<u8>) -> Self {
        Self::new(dlci, FrameType::Uih, false, false, info)
    }

    /// Encode to wire bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.info.len() + 7);
        out.push(FLAG);
        out.push(((self.dlci & MAX_DLCI) << 2) | if self.cr { CR } else { 0 } | EA);
        out.push(self.frame_type.control() | if self.pf { PF } else { 0 });

        let len = self.info.len();
        if len <= 0x7F {
            out.push(((len as u8) << 1) | EA);
        } else {
            out.push(((len & 0x7F) as u8) << 1);
            out.push((len >> 7) as u8);
        }

        let fcs = fcs(&out[1..]);
        out.extend_from_slice(&self.info);
        out.push(fcs);
        out.push(FLAG);
        out
    }
}

/// Parse one complete frame, flags included
pub fn parse_frame(frame: &[u8]) -> Result<Frame, ParseError> {
    if frame.len() < 6 {
        return Err(ParseError::Incomplete {
            needed: 6 - frame.len(),
        });
    }
    if frame[0] != FLAG || frame[frame.len() - 1] != FLAG {
        return Err(ParseError::InvalidFrame("missing flag".into()));
    }

    let address = frame[1];
    if address & EA == 0 {
        return Err(ParseError::InvalidFrame("extended address".into()));
    }
    let control = frame[2];
    let frame_type = FrameType::from_control(control)
        .ok_or_else(|| ParseError::InvalidFrame(format!("unknown control 0x{control:02X}")))?;

    let (len, header_len) = if frame[3] & EA != 0 {
        ((frame[3] >> 1) as usize, 4)
    } else {
        let high = *frame.get(4).ok_or(ParseError::Incomplete { needed: 1 })?;
        (((frame[3] >> 1) as usize) | ((high as usize) << 7), 5)
    };

    let expected_total = header_len + len + 2;
    if frame.len() != expected_total {
        return Err(ParseError::InvalidFrame(format!(
            "length field says {expected_total} bytes, frame has {}",
            frame.len()
        )));
    }

    let header = &frame[1..header_len];
    let received = frame[header_len + len];
    if CRC_TABLE[(crc(header) ^ received) as usize] != FCS_GOOD {
        return Err(ParseError::ChecksumMismatch {
            expected: fcs(header),
            actual: received,
        });
    }

    Ok(Frame {
        dlci: address >> 2,
        cr: address & CR != 0,
        frame_type,
        pf: control & PF != 0,
        info: frame[header_len..header_len + len].to_vec(),
    })
}

/// Streaming CMUX decoder
pub struct CmuxCodec {
    buffer: Vec<u8>,
    max_info: usize,
}

impl CmuxCodec {
    /// Create a decoder accepting information fields up to `max_info` bytes
    pub fn new(max_info: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(max_info + 8),
            max_info,
        }
    }

    /// Number of bytes waiting for a complete frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop everything before the next flag; `false` when no flag is buffered
    fn sync_to_flag(&mut self) -> bool {
        match self.buffer.iter().position(|&b| b == FLAG) {
            Some(pos) => {
                self.buffer.drain(..pos);
                // A closing flag may directly precede the next opening flag
                let extra = self.buffer.iter().take_while(|&&b| b == FLAG).count();
                if extra > 1 {
                    self.buffer.drain(..extra - 1);
                }
                true
            }
            None => {
                self.buffer.clear();
                false
            }
        }
    }

    /// Total size of the frame at the start of the buffer, if its header is complete
    fn frame_len(&self) -> Result<Option<usize>, ParseError> {
        let Some(&len_byte) = self.buffer.get(3) else {
            return Ok(None);
        };
        let (len, header_len) = if len_byte & EA != 0 {
            ((len_byte >> 1) as usize, 4)
        } else {
            let Some(&high) = self.buffer.get(4) else {
                return Ok(None);
            };
            (((len_byte >> 1) as usize) | ((high as usize) << 7), 5)
        };
        if len > self.max_info {
            return Err(ParseError::FrameTooLarge {
                len,
                max: self.max_info,
            });
        }
        Ok(Some(header_len + len + 2))
    }
}

impl ProtocolCodec for CmuxCodec {
    type Frame = Frame;

    fn push_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);

        // Prevent unbounded growth on a stream that never yields a valid frame
        let limit = (self.max_info + 8) * 4;
        if self.buffer.len() > limit {
            let start = self.buffer.len() - (self.max_info + 8);
            self.buffer.drain(..start);
        }
    }

    fn next_frame(&mut self) -> Option<Self::Frame> {
        self.next_frame_with_bytes().map(|(frame, _)| frame)
    }

    fn next_frame_with_bytes(&mut self) -> Option<(Self::Frame, Vec<u8>)> {
        loop {
            if !self.sync_to_flag() {
                return None;
            }

            let total = match self.frame_len() {
                Ok(Some(total)) => total,
                Ok(None) => return None,
                Err(e) => {
                    warn!("Dropping CMUX frame: {}", e);
                    self.buffer.drain(..1);
                    continue;
                }
            };
            if self.buffer.len() < total {
                return None;
            }

            let raw = self.buffer[..total].to_vec();
            match parse_frame(&raw) {
                Ok(frame) => {
                    // Keep the closing flag, it may open the next frame
                    self.buffer.drain(..total - 1);
                    return Some((frame, raw));
                }
                Err(e) => {
                    warn!("Failed to parse CMUX frame: {}", e);
                    self.buffer.drain(..1);
                }
            }
        }
    }

    fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// Multiplexer control message types carried on DLCI 0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlType {
    /// Multiplexer close down
    CloseDown,
    /// Modem status command
    ModemStatus,
    /// Anything else, carried as the raw type bits
    Other(u8),
}

impl ControlType {
    fn bits(&self) -> u8 {
        match self {
            ControlType::CloseDown => 0xC0,
            ControlType::ModemStatus => 0xE0,
            ControlType::Other(bits) => *bits & !(CR | EA),
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & !(CR | EA) {
            0xC0 => ControlType::CloseDown,
            0xE0 => ControlType::ModemStatus,
            other => ControlType::Other(other),
        }
    }
}

/// A control channel message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    /// Message type
    pub kind: ControlType,
    /// Set for commands, clear for responses
    pub command: bool,
    /// Value octets
    pub values: Vec<u8>,
}

impl ControlMessage {
    /// Decode the information field of a DLCI 0 UIH frame
    pub fn decode(info: &[u8]) -> Result<Self, ParseError> {
        let (&type_byte, rest) = info
            .split_first()
            .ok_or(ParseError::Incomplete { needed: 2 })?;
        let (&len_byte, values) = rest
            .split_first()
            .ok_or(ParseError::Incomplete { needed: 1 })?;
        if len_byte & EA == 0 {
            return Err(ParseError::InvalidFrame(
                "multi-byte control length".into(),
            ));
        }
        let len = (len_byte >> 1) as usize;
        if values.len() < len {
            return Err(ParseError::Incomplete {
                needed: len - values.len(),
            });
        }
        Ok(Self {
            kind: ControlType::from_bits(type_byte),
            command: type_byte & CR != 0,
            values: values[..len].to_vec(),
        })
    }

    /// Encode as an information field
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.values.len() + 2);
        out.push(self.kind.bits() | if self.command { CR } else { 0 } | EA);
        out.push(((self.values.len() as u8) << 1) | EA);
        out.extend_from_slice(&self.values);
        out
    }

    /// The response acknowledging this command
    pub fn response(&self) -> Self {
        Self {
            kind: self.kind,
            command: false,
            values: self.values.clone(),
        }
    }
}
