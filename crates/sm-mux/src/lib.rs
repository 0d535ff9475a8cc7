//! Serial Modem Channel Multiplexer
//!
//! Splits one physical [`Pipe`](sm_pipe::Pipe) into a small, fixed number of logical
//! channels (DLCIs) using 3GPP TS 27.010 basic-mode framing. Each channel is itself a
//! pipe, so the AT host, PPP or a trace backend can run on top of one without knowing
//! it is multiplexed.
//!
//! # Channel ownership
//!
//! By default the multiplexer handles every channel itself: data on the designated AT
//! channel is announced to the worker with [`MuxEvent::AtReceiveReady`], data on any
//! other channel is discarded. A consumer that wants a channel calls
//! [`Multiplexer::reserve`], attaches its own handler, and gives it back with
//! [`Multiplexer::release`].
//!
//! # Two write paths
//!
//! - [`Multiplexer::write_urc`] never blocks. It queues a whole message in the shared
//!   URC buffer or fails with `BufferFull`.
//! - [`Multiplexer::write_blocking`] is for the single worker only. It parks on the
//!   channel's transmit-idle signal until every byte is accepted or the channel closes.
//!
//! # Example
//!
//! ```rust,ignore
//! use sm_mux::{Multiplexer, MultiplexerConfig};
//!
//! let (event_tx, mut event_rx) = tokio::sync::mpsc::channel(64);
//! let mux = Multiplexer::new(physical, MultiplexerConfig::default(), urc_sender, event_tx, 1)?;
//! mux.start(Vec::new())?;
//!
//! while let Some(event) = event_rx.recv().await {
//!     // MuxEvent::AtReceiveReady => mux.receive_at(&mut buf) ...
//! }
//! ```

pub mod channel;
mod demux;
pub mod engine;
pub mod error;
pub mod events;

pub use channel::{DlciPipe, DlciState};
pub use engine::{Multiplexer, MultiplexerConfig};
pub use error::MuxError;
pub use events::MuxEvent;
