//! Events the host asks the worker to carry out

/// Transport change requested by a local command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRequest {
    /// Start multiplexing with AT traffic on `at_dlci`
    StartMux { at_dlci: u8 },
    /// Move AT traffic to another channel once the current reply is out
    SetAtChannel(u8),
}

/// Output of the host engine, drained by the worker in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// Bytes for the current AT link
    Transmit(Vec<u8>),
    /// The host returned to command mode; held URCs may go out
    CommandModeEntered,
    /// Switch transport
    Link(LinkRequest),
}
