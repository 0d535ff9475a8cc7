//! Multiplexer events delivered to the worker

/// Events emitted by the multiplexer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxEvent {
    /// The peer opened the control channel
    Connected,
    /// A data channel opened
    ChannelOpened(u8),
    /// A data channel closed
    ChannelClosed(u8),
    /// Data is waiting on the AT channel
    AtReceiveReady,
    /// A deferred AT channel change took effect
    AtChannelChanged { from: u8, to: u8 },
    /// The link was torn down; every channel is closed
    Disconnected,
}
