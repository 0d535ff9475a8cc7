//! Host configuration

use serde::{Deserialize, Serialize};
use sm_mux::MultiplexerConfig;
use sm_protocol::LineTermination;

/// Quiet period before a data mode session is flushed when nothing else applies
const FALLBACK_TIME_LIMIT_MS: u64 = 1000;

/// Margin added to the time needed to fill one UART receive buffer
const UART_RX_MARGIN_MS: u64 = 10;

/// Configuration of the AT host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// How command lines are terminated
    pub line_termination: LineTermination,
    /// Echo received command bytes at startup
    pub echo: bool,
    /// Most bytes echoed per command
    pub echo_max_len: usize,
    /// How long URCs are held back after echoing part of an incomplete command
    pub urc_delay_with_incomplete_echo_ms: u64,
    /// Byte sequence that ends data mode
    pub quit_string: String,
    /// Longest accepted command line
    pub command_buffer_max: usize,
    /// Size of the raw data ring used in data mode
    pub datamode_buffer_size: usize,
    /// Data mode inactivity limit; 0 derives it from the link rate
    pub datamode_time_limit_ms: u64,
    /// Report every data mode flush with a `#XDATAMODE: <size>` line
    pub datamode_urc: bool,
    /// Link rate of the serial line
    pub baud_rate: u32,
    /// Size of the shared URC ring
    pub urc_buffer_size: usize,
    /// Line sent once when the worker starts
    pub ready_message: Option<String>,
    /// Multiplexer settings used by `AT#XCMUX`
    pub mux: MultiplexerConfig,
    /// Size of one UART receive buffer, used to derive the data mode limit
    pub rx_buffer_size: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            line_termination: LineTermination::Cr,
            echo: false,
            echo_max_len: 64,
            urc_delay_with_incomplete_echo_ms: 100,
            quit_string: "+++".to_string(),
            command_buffer_max: 8192,
            datamode_buffer_size: 4096,
            datamode_time_limit_ms: 0,
            datamode_urc: false,
            baud_rate: 115_200,
            urc_buffer_size: 1024,
            ready_message: Some("Ready".to_string()),
            mux: MultiplexerConfig::default(),
            rx_buffer_size: 256,
        }
    }
}

impl HostConfig {
    /// Time the link needs to fill one receive buffer, plus a margin
    ///
    /// This is both the smallest accepted `AT#XDATACTRL` value and the derived default.
    pub fn min_time_limit_ms(&self) -> u64 {
        if self.baud_rate == 0 {
            return FALLBACK_TIME_LIMIT_MS;
        }
        // 10 bits per byte on the wire
        (self.rx_buffer_size as u64) * 10 * 1000 / u64::from(self.baud_rate) + UART_RX_MARGIN_MS
    }
}
