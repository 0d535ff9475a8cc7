//! Serial Modem Transport Pipe
//!
//! A [`Pipe`] is a bidirectional byte link with edge-triggered events. The physical
//! UART is one ([`UartPipe`]); each multiplexed CMUX channel is another. Everything
//! above this crate talks to a `dyn Pipe` and does not care which one it has.
//!
//! # Events
//!
//! Events are delivered to a single attached handler:
//!
//! - `Opened` / `Closed` once per transition
//! - `ReceiveReady` when data arrives; not repeated until a `receive()` call has
//!   drained everything that was queued
//! - `TransmitIdle` when everything handed to `transmit()` has left the pipe, or a
//!   transmit error aborted it
//!
//! Handlers run in whatever context raised the event (a reader task, the writer task,
//! the caller of `receive()`), so they must only hand off work, never block.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sm_pipe::{Pipe, PipeEvent, UartConfig, UartPipe};
//!
//! # async fn example() -> Result<(), sm_pipe::PipeError> {
//! let pipe = UartPipe::open_serial("/dev/ttyACM0", 115_200, UartConfig::default())?;
//! pipe.attach(Arc::new(|event: PipeEvent| println!("{event:?}")));
//! pipe.open()?;
//! pipe.transmit(b"\r\nReady\r\n")?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod events;
pub mod pool;
pub mod ring;
pub mod uart;
pub mod urc;
pub mod write;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use error::{PipeError, UrcError};
pub use events::{PipeEvent, PipeEventHandler, PipeEvents};
pub use pool::{RxBlock, RxBufferPool};
pub use ring::ByteRing;
pub use uart::{UartConfig, UartPipe};
pub use urc::{UrcBuffer, UrcOwner, UrcRecord, UrcSender, AT_CHANNEL};
pub use write::write_all_blocking;

/// A bidirectional byte link
///
/// All methods are non-blocking. Flow control is expressed through the return
/// values of [`transmit`](Pipe::transmit) and [`receive`](Pipe::receive) together with
/// the events delivered to the attached handler.
pub trait Pipe: Send + Sync {
    /// Attach the event handler, replacing any previous one
    ///
    /// If received data is already waiting, `ReceiveReady` is raised immediately so the
    /// new owner does not miss it.
    fn attach(&self, handler: PipeEventHandler);

    /// Detach the event handler
    fn release(&self);

    /// Open the pipe; raises `Opened`
    fn open(&self) -> Result<(), PipeError>;

    /// Queue bytes for transmission, returning how many were accepted
    ///
    /// Fewer than `data.len()` bytes are accepted when the transmit buffer is full;
    /// the caller retries the remainder after `TransmitIdle`.
    fn transmit(&self, data: &[u8]) -> Result<usize, PipeError>;

    /// Copy received bytes into `buf`, returning 0 when nothing is pending
    fn receive(&self, buf: &mut [u8]) -> Result<usize, PipeError>;

    /// Close the pipe; raises `Closed` once both directions have stopped
    fn close(&self) -> Result<(), PipeError>;

    /// Whether the pipe is open
    fn is_open(&self) -> bool;
}

/// Lock a std mutex, recovering the data if a previous holder panicked
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
