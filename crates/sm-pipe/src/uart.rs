//! UART pipe
//!
//! Wraps any `AsyncRead + AsyncWrite` byte stream (a tokio-serial port, or a
//! `tokio::io::duplex` half in tests) as a [`Pipe`].
//!
//! # Tasks
//!
//! `open()` spawns two tasks that own the two halves of the stream:
//!
//! - **Reader**: takes a block from the [`RxBufferPool`], reads into it and queues each
//!   read as a sub-range event referencing the block. When the pool is exhausted or the
//!   event queue is full it stops reading until the consumer releases something.
//! - **Writer**: drains the transmit ring to the stream and raises `TransmitIdle`.
//!
//! `close()` stops both; each hands its half back so the pipe can be reopened, and
//! `Closed` is raised once both are back.

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Notify};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, error, info, warn};

use crate::error::PipeError;
use crate::events::{PipeEvent, PipeEventHandler, PipeEvents};
use crate::lock;
use crate::pool::{RxBlock, RxBufferPool};
use crate::ring::ByteRing;
use crate::Pipe;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Largest chunk handed to the stream in one write
const TX_CHUNK: usize = 1024;

/// UART pipe configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UartConfig {
    /// Size of each receive block
    pub rx_buffer_size: usize,
    /// Number of receive blocks in the pool
    pub rx_buffer_count: usize,
    /// Maximum number of queued receive events
    pub rx_event_capacity: usize,
    /// Transmit ring size
    pub tx_buffer_size: usize,
    /// Consecutive read errors tolerated before the pipe gives up
    pub rx_recovery_attempts: u32,
    /// Pause before retrying after a read error
    pub rx_recovery_delay_ms: u64,
    /// How long `close()` lets pending transmit data drain
    pub close_flush_timeout_ms: u64,
}

impl Default for UartConfig {
    fn default() -> Self {
        Self {
            rx_buffer_size: 256,
            rx_buffer_count: 4,
            rx_event_capacity: 32,
            tx_buffer_size: 4096,
            rx_recovery_attempts: 5,
            rx_recovery_delay_ms: 10,
            close_flush_timeout_ms: 50,
        }
    }
}

/// A queued receive completion: `len` bytes at `offset` within `block`
struct RxEvent {
    block: RxBlock,
    offset: usize,
    len: usize,
}

struct Shared {
    config: UartConfig,
    pool: RxBufferPool,
    rx_queue: Mutex<VecDeque<RxEvent>>,
    rx_space: Notify,
    tx: Mutex<ByteRing>,
    tx_kick: Notify,
    events: PipeEvents,
    open: AtomicBool,
    rx_enabled: AtomicBool,
    closed_pending: AtomicBool,
    reader: Mutex<Option<BoxedReader>>,
    writer: Mutex<Option<BoxedWriter>>,
    stop: Mutex<Option<watch::Sender<bool>>>,
}

impl Shared {
    fn queue_full(&self) -> bool {
        lock(&self.rx_queue).len() >= self.config.rx_event_capacity
    }

    fn stop_tasks(&self) {
        if let Some(stop) = lock(&self.stop).take() {
            let _ = stop.send(true);
        }
    }

    /// Link failure: mark closed and let the tasks wind down
    fn fail(&self) {
        if self
            .open
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            error!("UART link failed, closing pipe");
            self.closed_pending.store(true, Ordering::Release);
            self.stop_tasks();
        }
    }

    /// Raise `Closed` once the pipe is closed and both halves are back
    fn check_closed(&self) {
        let quiescent = lock(&self.reader).is_some() && lock(&self.writer).is_some();
        if quiescent
            && !self.open.load(Ordering::Acquire)
            && self.closed_pending.swap(false, Ordering::AcqRel)
        {
            info!("UART pipe closed");
            self.events.notify(PipeEvent::Closed);
        }
    }
}

/// [`Pipe`] over a byte stream
#[derive(Clone)]
pub struct UartPipe {
    shared: Arc<Shared>,
}

impl UartPipe {
    /// Wrap a byte stream
    pub fn new<T>(io: T, config: UartConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        let pool = RxBufferPool::new(config.rx_buffer_size, config.rx_buffer_count);
        let tx = ByteRing::new(config.tx_buffer_size);
        Self {
            shared: Arc::new(Shared {
                pool,
                rx_queue: Mutex::new(VecDeque::with_capacity(config.rx_event_capacity)),
                rx_space: Notify::new(),
                tx: Mutex::new(tx),
                tx_kick: Notify::new(),
                events: PipeEvents::new(),
                open: AtomicBool::new(false),
                rx_enabled: AtomicBool::new(false),
                closed_pending: AtomicBool::new(false),
                reader: Mutex::new(Some(Box::new(reader))),
                writer: Mutex::new(Some(Box::new(writer))),
                stop: Mutex::new(None),
                config,
            }),
        }
    }

    /// Wrap a serial port
    ///
    /// Must be called from within a tokio runtime.
    pub fn open_serial(port: &str, baud_rate: u32, config: UartConfig) -> Result<Self, PipeError> {
        let stream = tokio_serial::new(port, baud_rate)
            .timeout(Duration::from_millis(100))
            .open_native_async()?;
        info!("Opened serial port {} at {} baud", port, baud_rate);
        Ok(Self::new(stream, config))
    }

    /// Whether the reader is currently accepting data
    pub fn rx_enabled(&self) -> bool {
        self.shared.rx_enabled.load(Ordering::Acquire)
    }

    /// Number of free receive blocks
    pub fn free_rx_blocks(&self) -> usize {
        self.shared.pool.available()
    }

    /// Bytes waiting in the transmit ring
    pub fn tx_pending(&self) -> usize {
        lock(&self.shared.tx).len()
    }
}

impl Pipe for UartPipe {
    fn attach(&self, handler: PipeEventHandler) {
        self.shared.events.attach(handler);
        if !lock(&self.shared.rx_queue).is_empty() {
            self.shared.events.rearm_receive();
            self.shared.events.receive_ready();
        }
    }

    fn release(&self) {
        self.shared.events.release();
    }

    fn open(&self) -> Result<(), PipeError> {
        let shared = &self.shared;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| PipeError::NotReady("no tokio runtime"))?;

        if shared
            .open
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(PipeError::AlreadyOpen);
        }

        let reader = lock(&shared.reader).take();
        let writer = lock(&shared.writer).take();
        let (reader, writer) = match (reader, writer) {
            (Some(r), Some(w)) => (r, w),
            (r, w) => {
                *lock(&shared.reader) = r;
                *lock(&shared.writer) = w;
                shared.open.store(false, Ordering::Release);
                return Err(PipeError::NotReady("previous session still closing"));
            }
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        *lock(&shared.stop) = Some(stop_tx);
        shared.closed_pending.store(false, Ordering::Release);
        lock(&shared.tx).reset();

        runtime.spawn(reader_task(shared.clone(), reader, stop_rx.clone()));
        runtime.spawn(writer_task(shared.clone(), writer, stop_rx));

        debug!("UART pipe opened");
        shared.events.rearm_receive();
        shared.events.notify(PipeEvent::Opened);
        Ok(())
    }

    fn transmit(&self, data: &[u8]) -> Result<usize, PipeError> {
        if !self.is_open() {
            return Err(PipeError::NotOpen);
        }
        if data.is_empty() {
            return Err(PipeError::InvalidArgument("empty transmit"));
        }
        let accepted = lock(&self.shared.tx).put(data);
        self.shared.events.arm_transmit();
        if accepted > 0 {
            self.shared.tx_kick.notify_one();
        }
        Ok(accepted)
    }

    fn receive(&self, buf: &mut [u8]) -> Result<usize, PipeError> {
        let mut queue = lock(&self.shared.rx_queue);
        let mut copied = 0;
        while copied < buf.len() {
            let Some(mut event) = queue.pop_front() else {
                break;
            };
            let n = event.len.min(buf.len() - copied);
            event
                .block
                .read(event.offset, &mut buf[copied..copied + n]);
            copied += n;
            if n < event.len {
                event.offset += n;
                event.len -= n;
                queue.push_front(event);
                break;
            }
        }
        let drained = queue.is_empty();
        drop(queue);

        if copied > 0 {
            self.shared.rx_space.notify_one();
        }
        if drained {
            self.shared.events.rearm_receive();
            // The reader may have queued between the drain check and re-arming
            if !lock(&self.shared.rx_queue).is_empty() {
                self.shared.events.receive_ready();
            }
        }
        Ok(copied)
    }

    fn close(&self) -> Result<(), PipeError> {
        let shared = &self.shared;
        if shared
            .open
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(PipeError::AlreadyClosed);
        }
        debug!("Closing UART pipe");
        shared.closed_pending.store(true, Ordering::Release);
        shared.stop_tasks();
        lock(&shared.rx_queue).clear();
        shared.check_closed();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }
}

/// Wait until the stop flag is raised (or its sender is gone)
async fn stopped(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}

async fn reader_task(
    shared: Arc<Shared>,
    mut reader: BoxedReader,
    mut stop: watch::Receiver<bool>,
) {
    let block_size = shared.pool.block_size();
    let attempts = shared.config.rx_recovery_attempts;
    let delay = Duration::from_millis(shared.config.rx_recovery_delay_ms);
    let mut scratch = vec![0u8; block_size];
    let mut failures = 0u32;
    let mut link_lost = false;

    'run: loop {
        let block = loop {
            if shared.queue_full() {
                shared.rx_enabled.store(false, Ordering::Release);
                debug!("RX event queue full, pausing UART RX");
                tokio::select! {
                    _ = stopped(&mut stop) => break 'run,
                    _ = shared.rx_space.notified() => continue,
                }
            }
            match shared.pool.try_alloc() {
                Some(block) => break block,
                None => {
                    shared.rx_enabled.store(false, Ordering::Release);
                    warn!("Disabling UART RX: no free buffers");
                    tokio::select! {
                        _ = stopped(&mut stop) => break 'run,
                        _ = shared.pool.released() => debug!("UART RX recovery: buffer released"),
                    }
                }
            }
        };
        shared.rx_enabled.store(true, Ordering::Release);

        let mut offset = 0;
        while offset < block_size {
            if shared.queue_full() {
                tokio::select! {
                    _ = stopped(&mut stop) => break 'run,
                    _ = shared.rx_space.notified() => continue,
                }
            }

            let read = tokio::select! {
                _ = stopped(&mut stop) => break 'run,
                r = reader.read(&mut scratch[..block_size - offset]) => r,
            };

            match read {
                Ok(0) => {
                    info!("UART RX reached end of stream");
                    link_lost = true;
                    break 'run;
                }
                Ok(n) => {
                    failures = 0;
                    block.write(offset, &scratch[..n]);
                    lock(&shared.rx_queue).push_back(RxEvent {
                        block: block.clone(),
                        offset,
                        len: n,
                    });
                    offset += n;
                    shared.events.receive_ready();
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(e) => {
                    failures += 1;
                    warn!(attempt = failures, "UART RX error: {}", e);
                    if failures > attempts {
                        error!("UART RX recovery failed after {} attempts", attempts);
                        link_lost = true;
                        break 'run;
                    }
                    shared.rx_enabled.store(false, Ordering::Release);
                    // Recover on a fresh block once the consumer has caught up
                    drop(block);
                    tokio::select! {
                        _ = stopped(&mut stop) => break 'run,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue 'run;
                }
            }
        }
    }

    shared.rx_enabled.store(false, Ordering::Release);
    *lock(&shared.reader) = Some(reader);
    if link_lost {
        shared.fail();
    }
    shared.check_closed();
}

/// Write everything in the transmit ring to the stream
async fn drain_tx(shared: &Shared, writer: &mut BoxedWriter) -> std::io::Result<()> {
    loop {
        let chunk = lock(&shared.tx).claim(TX_CHUNK).to_vec();
        if chunk.is_empty() {
            break;
        }
        writer.write_all(&chunk).await?;
        lock(&shared.tx).finish(chunk.len());
    }
    writer.flush().await
}

async fn writer_task(
    shared: Arc<Shared>,
    mut writer: BoxedWriter,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = stopped(&mut stop) => break,
            _ = shared.tx_kick.notified() => {}
        }
        if let Err(e) = drain_tx(&shared, &mut writer).await {
            warn!("UART TX failed, aborting transmission: {}", e);
            lock(&shared.tx).reset();
        }
        shared.events.transmit_idle();
    }

    let flush_timeout = Duration::from_millis(shared.config.close_flush_timeout_ms);
    match tokio::time::timeout(flush_timeout, drain_tx(&shared, &mut writer)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("UART TX flush on close failed: {}", e),
        Err(_) => debug!("UART TX flush on close timed out"),
    }
    let abandoned = {
        let mut tx = lock(&shared.tx);
        let n = tx.len();
        tx.reset();
        n
    };
    if abandoned > 0 {
        debug!(abandoned, "Dropped unsent UART TX data");
    }
    shared.events.transmit_idle();

    *lock(&shared.writer) = Some(writer);
    shared.check_closed();
}
