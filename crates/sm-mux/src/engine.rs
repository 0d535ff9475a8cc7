//! Multiplexer engine
//!
//! Shared state behind every [`DlciPipe`] and the [`Multiplexer`] handle: channel
//! table, AT channel designation, the transmit staging ring and the frame handling
//! that the demux task drives.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};
use sm_pipe::{
    lock, write_all_blocking, ByteRing, Pipe, PipeError, PipeEvent, PipeEventHandler, UrcError,
    UrcOwner, UrcSender, AT_CHANNEL,
};
use sm_protocol::cmux::{ControlMessage, ControlType, Frame, FrameType, CONTROL_DLCI};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::channel::{DlciChannel, DlciPipe, DlciState};
use crate::demux;
use crate::error::MuxError;
use crate::events::MuxEvent;

/// Multiplexer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiplexerConfig {
    /// Number of data channels (DLCI 1..=channel_count)
    pub channel_count: u8,
    /// Largest information field per frame
    pub mtu: usize,
    /// Per-channel receive buffer size
    pub channel_rx_buffer: usize,
    /// Transmit staging ring size, shared by all channels
    pub staging_buffer: usize,
    /// How long a locally opened channel waits for UA
    pub open_timeout_ms: u64,
    /// Delay before returning to direct AT mode after a disconnect
    pub disconnect_grace_ms: u64,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            channel_count: 3,
            mtu: 127,
            channel_rx_buffer: 2048,
            staging_buffer: 4096,
            open_timeout_ms: 10_000,
            disconnect_grace_ms: 100,
        }
    }
}

struct MuxState {
    at_dlci: u8,
    requested_at_dlci: Option<u8>,
    running: bool,
    connected: bool,
}

/// Handler the multiplexer keeps on channels nobody has reserved
fn internal_handler(weak: Weak<MuxShared>, dlci: u8) -> PipeEventHandler {
    Arc::new(move |event| {
        if event != PipeEvent::ReceiveReady {
            return;
        }
        if let Some(shared) = weak.upgrade() {
            shared.internal_receive(dlci);
        }
    })
}

pub(crate) struct MuxShared {
    pub(crate) config: MultiplexerConfig,
    pub(crate) physical: Arc<dyn Pipe>,
    channels: Vec<DlciChannel>,
    state: Mutex<MuxState>,
    staging: Mutex<ByteRing>,
    pub(crate) rx_wake: Notify,
    pub(crate) physical_closed: AtomicBool,
    pub(crate) stopping: AtomicBool,
    events_tx: mpsc::Sender<MuxEvent>,
    urc: UrcSender,
    self_ref: Weak<MuxShared>,
}

impl MuxShared {
    pub(crate) fn channel(&self, dlci: u8) -> Option<&DlciChannel> {
        if dlci == CONTROL_DLCI {
            return None;
        }
        self.channels.get(usize::from(dlci) - 1)
    }

    pub(crate) fn channel_unchecked(&self, dlci: u8) -> &DlciChannel {
        &self.channels[usize::from(dlci) - 1]
    }

    pub(crate) fn is_running(&self) -> bool {
        lock(&self.state).running
    }

    fn at_dlci(&self) -> u8 {
        lock(&self.state).at_dlci
    }

    pub(crate) fn emit(&self, event: MuxEvent) {
        if let Err(e) = self.events_tx.try_send(event) {
            warn!("Dropping multiplexer event: {}", e);
        }
    }

    fn internal_receive(&self, dlci: u8) {
        if dlci == self.at_dlci() {
            self.emit(MuxEvent::AtReceiveReady);
            return;
        }
        let Some(ch) = self.channel(dlci) else {
            return;
        };
        let dropped = {
            let mut rx = lock(&ch.rx);
            let n = rx.len();
            rx.reset();
            n
        };
        ch.events.rearm_receive();
        debug!(dlci, dropped, "Discarding data on unreserved channel");
    }

    /// Move staged frame bytes into the physical pipe
    fn pump_locked(&self, staging: &mut ByteRing) {
        loop {
            let chunk = staging.claim(usize::MAX);
            if chunk.is_empty() {
                break;
            }
            match self.physical.transmit(chunk) {
                Ok(0) => break,
                Ok(n) => staging.finish(n),
                Err(e) => {
                    debug!("Physical pipe rejected CMUX data: {}", e);
                    break;
                }
            }
        }
    }

    pub(crate) fn send_frame(&self, frame: Frame) {
        let bytes = frame.encode();
        let mut staging = lock(&self.staging);
        if !staging.put_all(&bytes) {
            warn!(
                dlci = frame.dlci,
                "CMUX staging buffer full, dropping {:?} frame", frame.frame_type
            );
        }
        self.pump_locked(&mut staging);
    }

    /// Frame as much of `data` as fits whole into the staging ring
    pub(crate) fn queue_data(&self, dlci: u8, data: &[u8]) -> usize {
        let mtu = self.config.mtu.max(1);
        let mut staging = lock(&self.staging);
        let mut accepted = 0;
        for chunk in data.chunks(mtu) {
            if !staging.put_all(&Frame::uih(dlci, chunk.to_vec()).encode()) {
                break;
            }
            accepted += chunk.len();
        }
        self.pump_locked(&mut staging);
        accepted
    }

    pub(crate) fn on_physical_idle(&self) {
        let drained = {
            let mut staging = lock(&self.staging);
            self.pump_locked(&mut staging);
            staging.is_empty()
        };
        if drained {
            for ch in &self.channels {
                ch.events.transmit_idle();
                ch.tx_idle.notify_one();
            }
        }
    }

    fn channel_opened(&self, ch: &DlciChannel) {
        *lock(&ch.state) = DlciState::Open;
        info!(dlci = ch.dlci, "CMUX channel opened");
        ch.events.notify(PipeEvent::Opened);
        self.emit(MuxEvent::ChannelOpened(ch.dlci));
    }

    pub(crate) fn channel_closed(&self, ch: &DlciChannel) {
        *lock(&ch.state) = DlciState::Closed;
        lock(&ch.rx).reset();
        info!(dlci = ch.dlci, "CMUX channel closed");
        ch.events.notify(PipeEvent::Closed);
        ch.tx_idle.notify_one();
        self.emit(MuxEvent::ChannelClosed(ch.dlci));
    }

    pub(crate) fn expire_open(&self, dlci: u8, generation: u64) {
        let Some(ch) = self.channel(dlci) else {
            return;
        };
        if ch.state() == DlciState::Opening
            && ch.open_generation.load(Ordering::Acquire) == generation
        {
            warn!(dlci, "CMUX channel open timed out");
            self.channel_closed(ch);
        }
    }

    pub(crate) fn handle_frame(&self, frame: Frame) {
        if frame.dlci == CONTROL_DLCI {
            self.handle_control(frame);
            return;
        }

        let Some(ch) = self.channel(frame.dlci) else {
            debug!(dlci = frame.dlci, "Frame for unknown DLCI");
            if frame.frame_type == FrameType::Sabm {
                self.send_frame(Frame::new(frame.dlci, FrameType::Dm, true, true, Vec::new()));
            }
            return;
        };

        match frame.frame_type {
            FrameType::Sabm => {
                self.send_frame(Frame::new(ch.dlci, FrameType::Ua, true, true, Vec::new()));
                if ch.state() != DlciState::Open {
                    self.channel_opened(ch);
                }
            }
            FrameType::Ua => {
                if ch.state() == DlciState::Opening {
                    self.channel_opened(ch);
                }
            }
            FrameType::Dm => {
                if ch.state() == DlciState::Opening {
                    warn!(dlci = ch.dlci, "Peer refused CMUX channel");
                    self.channel_closed(ch);
                }
            }
            FrameType::Disc => {
                self.send_frame(Frame::new(ch.dlci, FrameType::Ua, true, true, Vec::new()));
                if ch.state() != DlciState::Closed {
                    self.channel_closed(ch);
                }
            }
            FrameType::Uih => {
                if ch.state() == DlciState::Open {
                    ch.deliver(&frame.info);
                } else {
                    debug!(dlci = ch.dlci, "Data on closed channel dropped");
                }
            }
        }
    }

    fn handle_control(&self, frame: Frame) {
        match frame.frame_type {
            FrameType::Sabm => {
                self.send_frame(Frame::new(CONTROL_DLCI, FrameType::Ua, true, true, Vec::new()));
                let newly = !std::mem::replace(&mut lock(&self.state).connected, true);
                if newly {
                    info!("CMUX connected");
                    self.emit(MuxEvent::Connected);
                }
            }
            FrameType::Disc => {
                self.send_frame(Frame::new(CONTROL_DLCI, FrameType::Ua, true, true, Vec::new()));
                self.disconnect();
            }
            FrameType::Uih => match ControlMessage::decode(&frame.info) {
                Ok(msg) if msg.command => {
                    let reply = Frame::uih(CONTROL_DLCI, msg.response().encode());
                    match msg.kind {
                        ControlType::CloseDown => {
                            self.send_frame(reply);
                            self.disconnect();
                        }
                        ControlType::ModemStatus => self.send_frame(reply),
                        ControlType::Other(bits) => {
                            debug!("Unsupported CMUX control message 0x{:02X}", bits)
                        }
                    }
                }
                Ok(msg) => debug!("CMUX control response {:?}", msg.kind),
                Err(e) => warn!("Malformed CMUX control message: {}", e),
            },
            other => debug!("Ignoring {:?} on control channel", other),
        }
    }

    pub(crate) fn disconnect(&self) {
        if self.teardown() {
            info!("CMUX disconnected");
            self.emit(MuxEvent::Disconnected);
        }
    }

    /// Close every channel and stop the demux task; `false` if not running
    fn teardown(&self) -> bool {
        {
            let mut state = lock(&self.state);
            if !state.running {
                return false;
            }
            state.running = false;
            state.connected = false;
            state.requested_at_dlci = None;
        }
        self.stopping.store(true, Ordering::Release);
        for ch in &self.channels {
            if ch.state() != DlciState::Closed {
                self.channel_closed(ch);
            }
            ch.tx_idle.notify_one();
        }
        lock(&self.staging).reset();
        self.rx_wake.notify_one();
        true
    }

    fn apply_requested_at_channel(&self) {
        let change = {
            let mut state = lock(&self.state);
            match state.requested_at_dlci.take() {
                Some(to) if to != state.at_dlci => {
                    let from = state.at_dlci;
                    state.at_dlci = to;
                    Some((from, to))
                }
                _ => None,
            }
        };
        if let Some((from, to)) = change {
            info!(from, to, "AT channel changed");
            self.emit(MuxEvent::AtChannelChanged { from, to });
            if self.channel(to).is_some_and(DlciChannel::has_pending_rx) {
                self.emit(MuxEvent::AtReceiveReady);
            }
        }
    }
}

/// Handle to a multiplexer instance
///
/// Cheap to clone. A multiplexer is created for one CMUX session; after a disconnect
/// the owner drops it and builds a fresh one for the next session.
#[derive(Clone)]
pub struct Multiplexer {
    shared: Arc<MuxShared>,
}

impl Multiplexer {
    /// Create a multiplexer over `physical` with `at_dlci` carrying AT traffic
    ///
    /// Nothing happens on the link until [`start`](Self::start). Fails with
    /// [`MuxError::InvalidChannel`] when `at_dlci` is not one of the configured channels.
    pub fn new(
        physical: Arc<dyn Pipe>,
        config: MultiplexerConfig,
        urc: UrcSender,
        events_tx: mpsc::Sender<MuxEvent>,
        at_dlci: u8,
    ) -> Result<Self, MuxError> {
        if !(1..=config.channel_count).contains(&at_dlci) {
            return Err(MuxError::InvalidChannel(at_dlci));
        }
        let shared = Arc::new_cyclic(|weak: &Weak<MuxShared>| {
            let channels = (1..=config.channel_count)
                .map(|dlci| {
                    DlciChannel::new(
                        dlci,
                        config.channel_rx_buffer,
                        internal_handler(weak.clone(), dlci),
                    )
                })
                .collect();
            MuxShared {
                physical,
                channels,
                state: Mutex::new(MuxState {
                    at_dlci,
                    requested_at_dlci: None,
                    running: false,
                    connected: false,
                }),
                staging: Mutex::new(ByteRing::new(config.staging_buffer)),
                rx_wake: Notify::new(),
                physical_closed: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                events_tx,
                urc,
                self_ref: weak.clone(),
                config,
            }
        });
        Ok(Self { shared })
    }

    /// Take over the physical pipe and start demultiplexing
    ///
    /// `leftover` holds bytes already read from the physical pipe that belong to the
    /// multiplexed stream; they are decoded before anything else.
    pub fn start(&self, leftover: Vec<u8>) -> Result<(), MuxError> {
        let shared = &self.shared;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| PipeError::NotReady("no tokio runtime"))?;
        {
            let mut state = lock(&shared.state);
            if state.running {
                return Err(MuxError::AlreadyStarted);
            }
            state.running = true;
        }
        shared.stopping.store(false, Ordering::Release);
        shared.physical_closed.store(false, Ordering::Release);

        if !shared.urc.buffer().acquire(UrcOwner::Mux) {
            warn!(
                "URC buffer still owned by {:?}",
                shared.urc.buffer().owner()
            );
        }

        shared.physical.attach(demux::physical_handler(Arc::downgrade(shared)));
        runtime.spawn(demux::run_demux(shared.clone(), leftover));
        info!(at_dlci = self.at_channel(), "CMUX started");
        Ok(())
    }

    /// Tear down every channel and let go of the physical pipe and the URC buffer
    pub fn stop(&self) {
        if self.shared.teardown() {
            info!("CMUX stopped");
        }
        self.shared.physical.release();
        self.shared.urc.buffer().release(UrcOwner::Mux);
    }

    /// Whether the multiplexer is running
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Whether the peer has opened the control channel
    pub fn is_connected(&self) -> bool {
        lock(&self.shared.state).connected
    }

    /// Number of data channels
    pub fn channel_count(&self) -> u8 {
        self.shared.config.channel_count
    }

    /// Link state of a channel
    pub fn channel_state(&self, dlci: u8) -> Result<DlciState, MuxError> {
        self.shared
            .channel(dlci)
            .map(DlciChannel::state)
            .ok_or(MuxError::InvalidChannel(dlci))
    }

    /// Pipe handle for a channel without taking it over
    pub fn channel(&self, dlci: u8) -> Result<DlciPipe, MuxError> {
        self.shared
            .channel(dlci)
            .ok_or(MuxError::InvalidChannel(dlci))?;
        Ok(DlciPipe::new(self.shared.clone(), dlci))
    }

    /// Hand a channel to an external consumer
    ///
    /// The multiplexer stops handling the channel's events; the caller attaches its
    /// own handler to the returned pipe.
    pub fn reserve(&self, dlci: u8) -> Result<DlciPipe, MuxError> {
        if !self.is_running() {
            return Err(MuxError::NotStarted);
        }
        let ch = self
            .shared
            .channel(dlci)
            .ok_or(MuxError::InvalidChannel(dlci))?;
        if dlci == self.at_channel() {
            return Err(MuxError::AtChannel(dlci));
        }
        if ch.reserved.swap(true, Ordering::AcqRel) {
            return Err(MuxError::AlreadyReserved(dlci));
        }
        ch.events.release();
        info!(dlci, "CMUX channel reserved");
        Ok(DlciPipe::new(self.shared.clone(), dlci))
    }

    /// Take a reserved channel back
    pub fn release(&self, dlci: u8) -> Result<(), MuxError> {
        let ch = self
            .shared
            .channel(dlci)
            .ok_or(MuxError::InvalidChannel(dlci))?;
        if !ch.reserved.swap(false, Ordering::AcqRel) {
            return Err(MuxError::NotReserved(dlci));
        }
        ch.events
            .attach(internal_handler(self.shared.self_ref.clone(), dlci));
        if ch.has_pending_rx() {
            ch.events.rearm_receive();
            ch.events.receive_ready();
        }
        info!(dlci, "CMUX channel released");
        Ok(())
    }

    /// Whether a channel is reserved by an external consumer
    pub fn is_reserved(&self, dlci: u8) -> bool {
        self.shared
            .channel(dlci)
            .is_some_and(DlciChannel::is_reserved)
    }

    /// DLCI currently carrying AT traffic
    pub fn at_channel(&self) -> u8 {
        self.shared.at_dlci()
    }

    /// Pending AT channel change, if any
    pub fn requested_at_channel(&self) -> Option<u8> {
        lock(&self.shared.state).requested_at_dlci
    }

    /// Move AT traffic to `dlci`
    ///
    /// Before [`start`](Self::start) this takes effect immediately. While running, the
    /// change is deferred until the next blocking write on the current AT channel has
    /// completed, so a response is never split across channels.
    pub fn set_at_channel(&self, dlci: u8) -> Result<(), MuxError> {
        let ch = self
            .shared
            .channel(dlci)
            .ok_or(MuxError::InvalidChannel(dlci))?;
        if ch.is_reserved() {
            return Err(MuxError::AlreadyReserved(dlci));
        }
        let mut state = lock(&self.shared.state);
        if !state.running {
            state.at_dlci = dlci;
        } else if dlci != state.at_dlci {
            state.requested_at_dlci = Some(dlci);
        } else {
            state.requested_at_dlci = None;
        }
        Ok(())
    }

    /// Read from the AT channel
    pub fn receive_at(&self, buf: &mut [u8]) -> usize {
        let pipe = DlciPipe::new(self.shared.clone(), self.at_channel());
        pipe.receive(buf).unwrap_or(0)
    }

    /// Queue a URC for `dlci` ([`AT_CHANNEL`] for the current AT channel)
    ///
    /// Never blocks; fails with `BufferFull` and drops the message if there is no room.
    pub fn write_urc(&self, dlci: u8, data: &[u8]) -> Result<(), UrcError> {
        self.shared.urc.send_to(dlci, data)
    }

    /// Write all of `data` to `dlci`, waiting for transmit space as needed
    ///
    /// Only the worker may call this. Returns the number of bytes sent; if the channel
    /// is or becomes closed, the remainder is dropped.
    pub async fn write_blocking(&self, dlci: u8, data: &[u8]) -> usize {
        let Some(ch) = self.shared.channel(dlci) else {
            warn!(dlci, "Write to invalid channel dropped");
            return 0;
        };
        let pipe = DlciPipe::new(self.shared.clone(), dlci);
        let sent = write_all_blocking(&pipe, data, &ch.tx_idle).await;
        if dlci == self.at_channel() {
            self.shared.apply_requested_at_channel();
        }
        sent
    }

    /// Deliver queued URCs; worker only
    ///
    /// Returns the number of messages taken off the queue.
    pub async fn flush_urc(&self) -> usize {
        let buffer = self.shared.urc.buffer().clone();
        let mut delivered = 0;
        while let Some(record) = buffer.front() {
            let dlci = if record.channel == AT_CHANNEL {
                self.at_channel()
            } else {
                record.channel
            };
            let open = self
                .shared
                .channel(dlci)
                .is_some_and(|ch| ch.state() == DlciState::Open);
            if open {
                self.write_blocking(dlci, &record.data).await;
            } else {
                debug!(dlci, "URC for closed channel dropped");
                buffer.count_dropped(record.data.len());
            }
            buffer.pop_front();
            delivered += 1;
        }
        delivered
    }
}
