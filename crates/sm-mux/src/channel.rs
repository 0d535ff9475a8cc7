//! Logical channels
//!
//! Each DLCI owns a private receive buffer and its own event slot. The handle handed
//! out to users is [`DlciPipe`], which implements [`Pipe`] on top of the shared
//! multiplexer state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sm_pipe::{lock, ByteRing, Pipe, PipeError, PipeEventHandler, PipeEvents};
use sm_protocol::cmux::{Frame, FrameType};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::engine::MuxShared;

/// Channel link state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DlciState {
    /// No link
    Closed,
    /// SABM sent, waiting for UA
    Opening,
    /// Link established
    Open,
}

/// Per-channel state
pub(crate) struct DlciChannel {
    pub(crate) dlci: u8,
    pub(crate) state: Mutex<DlciState>,
    /// Bumped on every local open so a stale timeout cannot close a newer attempt
    pub(crate) open_generation: AtomicU64,
    pub(crate) rx: Mutex<ByteRing>,
    pub(crate) events: PipeEvents,
    pub(crate) reserved: AtomicBool,
    /// Wakes the worker's blocking writes; independent of the attached handler
    pub(crate) tx_idle: Notify,
}

impl DlciChannel {
    pub(crate) fn new(dlci: u8, rx_capacity: usize, internal: PipeEventHandler) -> Self {
        let events = PipeEvents::new();
        events.attach(internal);
        Self {
            dlci,
            state: Mutex::new(DlciState::Closed),
            open_generation: AtomicU64::new(0),
            rx: Mutex::new(ByteRing::new(rx_capacity)),
            events,
            reserved: AtomicBool::new(false),
            tx_idle: Notify::new(),
        }
    }

    pub(crate) fn state(&self) -> DlciState {
        *lock(&self.state)
    }

    pub(crate) fn is_reserved(&self) -> bool {
        self.reserved.load(Ordering::Acquire)
    }

    /// Queue received payload, dropping what does not fit
    pub(crate) fn deliver(&self, data: &[u8]) {
        let stored = lock(&self.rx).put(data);
        if stored < data.len() {
            warn!(
                dlci = self.dlci,
                dropped = data.len() - stored,
                "CMUX channel receive buffer full"
            );
        }
        if stored > 0 {
            self.events.receive_ready();
        }
    }

    pub(crate) fn has_pending_rx(&self) -> bool {
        !lock(&self.rx).is_empty()
    }
}

/// Pipe handle for one logical channel
#[derive(Clone)]
pub struct DlciPipe {
    shared: Arc<MuxShared>,
    dlci: u8,
}

impl DlciPipe {
    pub(crate) fn new(shared: Arc<MuxShared>, dlci: u8) -> Self {
        Self { shared, dlci }
    }

    /// Channel address
    pub fn dlci(&self) -> u8 {
        self.dlci
    }

    /// Link state
    pub fn state(&self) -> DlciState {
        self.channel().state()
    }

    fn channel(&self) -> &DlciChannel {
        // Handles are only created for valid DLCIs
        self.shared.channel_unchecked(self.dlci)
    }
}

impl Pipe for DlciPipe {
    fn attach(&self, handler: PipeEventHandler) {
        let ch = self.channel();
        ch.events.attach(handler);
        if ch.has_pending_rx() {
            ch.events.rearm_receive();
            ch.events.receive_ready();
        }
    }

    fn release(&self) {
        self.channel().events.release();
    }

    fn open(&self) -> Result<(), PipeError> {
        if !self.shared.is_running() {
            return Err(PipeError::NotReady("multiplexer not running"));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| PipeError::NotReady("no tokio runtime"))?;

        let ch = self.channel();
        {
            let mut state = lock(&ch.state);
            if *state != DlciState::Closed {
                return Err(PipeError::AlreadyOpen);
            }
            *state = DlciState::Opening;
        }
        let generation = ch.open_generation.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(dlci = self.dlci, "Opening CMUX channel");
        self.shared
            .send_frame(Frame::new(self.dlci, FrameType::Sabm, false, true, Vec::new()));

        let weak = Arc::downgrade(&self.shared);
        let dlci = self.dlci;
        let timeout = Duration::from_millis(self.shared.config.open_timeout_ms);
        runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(shared) = weak.upgrade() {
                shared.expire_open(dlci, generation);
            }
        });
        Ok(())
    }

    fn transmit(&self, data: &[u8]) -> Result<usize, PipeError> {
        let ch = self.channel();
        if ch.state() != DlciState::Open {
            return Err(PipeError::NotOpen);
        }
        if data.is_empty() {
            return Err(PipeError::InvalidArgument("empty transmit"));
        }
        ch.events.arm_transmit();
        Ok(self.shared.queue_data(self.dlci, data))
    }

    fn receive(&self, buf: &mut [u8]) -> Result<usize, PipeError> {
        let ch = self.channel();
        let (n, drained) = {
            let mut rx = lock(&ch.rx);
            let data = rx.take(buf.len());
            buf[..data.len()].copy_from_slice(&data);
            (data.len(), rx.is_empty())
        };
        if drained {
            ch.events.rearm_receive();
            if ch.has_pending_rx() {
                ch.events.receive_ready();
            }
        }
        Ok(n)
    }

    fn close(&self) -> Result<(), PipeError> {
        let ch = self.channel();
        let previous = std::mem::replace(&mut *lock(&ch.state), DlciState::Closed);
        if previous == DlciState::Closed {
            return Err(PipeError::AlreadyClosed);
        }
        debug!(dlci = self.dlci, "Closing CMUX channel");
        self.shared
            .send_frame(Frame::new(self.dlci, FrameType::Disc, false, true, Vec::new()));
        self.shared.channel_closed(ch);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.channel().state() == DlciState::Open
    }
}
