//! Host worker
//!
//! The worker is the single serialized context of the host. It owns the [`AtHost`] and
//! the AT engine, reads the AT link, performs every blocking write and switches the
//! transport between the direct serial link and the CMUX multiplexer. Other tasks and
//! threads reach it through a [`HostHandle`].
//!
//! # Example
//!
//! ```rust,ignore
//! use sm_host::{spawn_host_worker, HostConfig};
//!
//! let (handle, worker) = spawn_host_worker(HostConfig::default(), physical, Box::new(engine));
//! handle.send_urgent("\r\n+CEREG: 1\r\n")?;
//! handle.shutdown().await?;
//! worker.await??;
//! ```

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use sm_mux::{DlciPipe, Multiplexer, MuxEvent};
use sm_pipe::{
    lock, write_all_blocking, Pipe, PipeError, PipeEvent, PipeEventHandler, UrcBuffer, UrcError,
    UrcOwner, UrcSender, AT_CHANNEL,
};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::config::HostConfig;
use crate::engine::{AtEngine, HostContext};
use crate::error::HostError;
use crate::events::{HostEvent, LinkRequest};
use crate::host::{AtHost, HostShared};
use crate::mode::OperationMode;

/// Capacity of the command and event queues feeding the worker
const QUEUE_CAPACITY: usize = 64;

/// Work run inside the worker with access to the host
pub type HostJob = Box<dyn FnOnce(&mut dyn HostContext) + Send>;

/// Commands sent to the worker
pub enum HostCommand {
    /// Stop the worker
    Shutdown,
    /// Run a job in the worker context
    Run(HostJob),
    /// Abort the data mode session with `result`
    ExitDataModeForcibly(i32),
}

impl std::fmt::Debug for HostCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostCommand::Shutdown => write!(f, "Shutdown"),
            HostCommand::Run(_) => write!(f, "Run(..)"),
            HostCommand::ExitDataModeForcibly(result) => {
                write!(f, "ExitDataModeForcibly({result})")
            }
        }
    }
}

/// Handle to a running host worker
///
/// Clonable and usable from any task or thread.
#[derive(Clone)]
pub struct HostHandle {
    cmd_tx: mpsc::Sender<HostCommand>,
    shared: Arc<HostShared>,
    urc: UrcSender,
}

impl HostHandle {
    /// Create a handle for `host`, whose worker will read `cmd_tx`'s receiver
    pub fn new(host: &AtHost, cmd_tx: mpsc::Sender<HostCommand>) -> Self {
        Self {
            cmd_tx,
            shared: host.shared().clone(),
            urc: host.urc().clone(),
        }
    }

    /// Queue an unsolicited notification; never blocks
    pub fn send_urgent(&self, text: &str) -> Result<(), UrcError> {
        self.urc.send(text)
    }

    /// Run `job` in the worker context
    pub async fn run<F>(&self, job: F) -> Result<(), HostError>
    where
        F: FnOnce(&mut dyn HostContext) + Send + 'static,
    {
        self.command(HostCommand::Run(Box::new(job))).await
    }

    /// Abort the current data mode session
    pub async fn exit_data_mode_forcibly(&self, result: i32) -> Result<(), HostError> {
        self.command(HostCommand::ExitDataModeForcibly(result)).await
    }

    pub fn in_data_mode(&self) -> bool {
        self.shared.mode() == OperationMode::Data
    }

    pub fn in_command_mode(&self) -> bool {
        self.shared.mode() == OperationMode::Command
    }

    /// Take a multiplexer channel for exclusive use
    pub fn reserve(&self, dlci: u8) -> Result<DlciPipe, HostError> {
        let mux = lock(&self.shared.mux).clone().ok_or(HostError::NotStarted)?;
        Ok(mux.reserve(dlci)?)
    }

    /// Give a reserved channel back
    pub fn release(&self, dlci: u8) -> Result<(), HostError> {
        let mux = lock(&self.shared.mux).clone().ok_or(HostError::NotStarted)?;
        Ok(mux.release(dlci)?)
    }

    /// Whether the link is currently multiplexed
    pub fn is_multiplexed(&self) -> bool {
        lock(&self.shared.mux).is_some()
    }

    /// Stop the worker
    pub async fn shutdown(&self) -> Result<(), HostError> {
        self.command(HostCommand::Shutdown).await
    }

    async fn command(&self, cmd: HostCommand) -> Result<(), HostError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| HostError::WorkerStopped)
    }
}

/// Build a host and spawn its worker on `physical`
pub fn spawn_host_worker(
    config: HostConfig,
    physical: Arc<dyn Pipe>,
    engine: Box<dyn AtEngine>,
) -> (HostHandle, JoinHandle<Result<(), HostError>>) {
    let urc = UrcSender::new(
        Arc::new(UrcBuffer::new(config.urc_buffer_size)),
        Arc::new(Notify::new()),
    );
    let host = AtHost::new(config, urc);
    let (cmd_tx, cmd_rx) = mpsc::channel(QUEUE_CAPACITY);
    let handle = HostHandle::new(&host, cmd_tx);
    let worker = tokio::spawn(run_host_worker(host, engine, physical, cmd_rx));
    (handle, worker)
}

/// Run the host worker until shutdown or until the physical link closes
pub async fn run_host_worker(
    host: AtHost,
    engine: Box<dyn AtEngine>,
    physical: Arc<dyn Pipe>,
    cmd_rx: mpsc::Receiver<HostCommand>,
) -> Result<(), HostError> {
    let (pipe_tx, pipe_rx) = mpsc::channel(QUEUE_CAPACITY);
    let rx_len = host.config().rx_buffer_size.max(1);
    let mut worker = Worker {
        host,
        engine,
        physical,
        cmd_rx,
        pipe_tx,
        pipe_rx,
        tx_idle: Arc::new(Notify::new()),
        mux: None,
        mux_rx: None,
        leftover: Vec::new(),
        rx_buf: vec![0u8; rx_len],
    };
    worker.run().await
}

struct Worker {
    host: AtHost,
    engine: Box<dyn AtEngine>,
    physical: Arc<dyn Pipe>,
    cmd_rx: mpsc::Receiver<HostCommand>,
    pipe_tx: mpsc::Sender<PipeEvent>,
    pipe_rx: mpsc::Receiver<PipeEvent>,
    tx_idle: Arc<Notify>,
    mux: Option<Multiplexer>,
    mux_rx: Option<mpsc::Receiver<MuxEvent>>,
    leftover: Vec<u8>,
    rx_buf: Vec<u8>,
}

impl Worker {
    async fn run(&mut self) -> Result<(), HostError> {
        self.attach_direct();
        match self.physical.open() {
            Ok(()) | Err(PipeError::AlreadyOpen) => {}
            Err(e) => return Err(e.into()),
        }
        self.host.urc().buffer().acquire(UrcOwner::Host);
        info!("AT host worker started");

        if let Some(ready) = self.host.config().ready_message.clone() {
            self.write(format!("\r\n{ready}\r\n").as_bytes()).await;
        }
        // Anything that arrived before the handler was attached
        self.drain_physical().await?;

        let urc_wake = self.host.urc().wake().clone();
        loop {
            let inactivity = self.host.inactivity_deadline();
            let echo = self.host.echo_deadline();

            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        None | Some(HostCommand::Shutdown) => break,
                        Some(HostCommand::Run(job)) => job(&mut self.host),
                        Some(HostCommand::ExitDataModeForcibly(result)) => {
                            self.host.exit_data_mode_forcibly(result)
                        }
                    }
                }
                Some(event) = self.pipe_rx.recv() => {
                    match event {
                        PipeEvent::ReceiveReady => self.drain_physical().await?,
                        PipeEvent::Closed => {
                            error!("Serial link closed");
                            return Err(HostError::LinkClosed);
                        }
                        PipeEvent::Opened | PipeEvent::TransmitIdle => {}
                    }
                }
                Some(event) = next_mux_event(&mut self.mux_rx) => {
                    self.handle_mux_event(event).await?;
                }
                _ = urc_wake.notified() => {}
                _ = sleep_until_opt(inactivity) => self.host.on_inactivity_timeout(),
                _ = sleep_until_opt(echo) => self.host.expire_echo_deadline(Instant::now()),
            }

            self.process_events().await?;
            self.flush_urcs().await;
        }

        self.shutdown();
        info!("AT host worker stopped");
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Some(mux) = self.mux.take() {
            mux.stop();
            self.host.set_multiplexer(None);
        }
        self.physical.release();
        self.host.urc().buffer().release(UrcOwner::Host);
    }

    /// Route physical pipe events into the worker
    fn attach_direct(&self) {
        let tx = self.pipe_tx.clone();
        let idle = self.tx_idle.clone();
        let handler: PipeEventHandler = Arc::new(move |event| {
            if matches!(event, PipeEvent::TransmitIdle | PipeEvent::Closed) {
                idle.notify_one();
            }
            if tx.try_send(event).is_err() {
                debug!("Worker queue full, pipe event {:?} dropped", event);
            }
        });
        self.physical.attach(handler);
    }

    async fn drain_physical(&mut self) -> Result<(), HostError> {
        while self.mux.is_none() {
            let n = match self.physical.receive(&mut self.rx_buf) {
                Ok(n) => n,
                Err(e) => {
                    warn!("Serial receive failed: {}", e);
                    0
                }
            };
            if n == 0 {
                break;
            }
            let consumed = self.host.receive(&self.rx_buf[..n], self.engine.as_mut());
            if consumed < n {
                self.leftover = self.rx_buf[consumed..n].to_vec();
            }
            self.process_events().await?;
        }
        Ok(())
    }

    async fn drain_mux(&mut self) -> Result<(), HostError> {
        loop {
            let Some(mux) = self.mux.clone() else {
                return Ok(());
            };
            let n = mux.receive_at(&mut self.rx_buf);
            if n == 0 {
                return Ok(());
            }
            self.host.receive(&self.rx_buf[..n], self.engine.as_mut());
            self.process_events().await?;
        }
    }

    async fn process_events(&mut self) -> Result<(), HostError> {
        for event in self.host.drain_events() {
            match event {
                HostEvent::Transmit(bytes) => self.write(&bytes).await,
                HostEvent::CommandModeEntered => self.flush_urcs().await,
                HostEvent::Link(LinkRequest::StartMux { at_dlci }) => {
                    self.start_mux(at_dlci).await?
                }
                HostEvent::Link(LinkRequest::SetAtChannel(dlci)) => match &self.mux {
                    Some(mux) => {
                        if let Err(e) = mux.set_at_channel(dlci) {
                            warn!(dlci, "AT channel change refused: {}", e);
                        }
                    }
                    None => warn!(dlci, "AT channel change without multiplexer"),
                },
            }
        }
        Ok(())
    }

    /// Blocking write on the current AT link
    async fn write(&mut self, bytes: &[u8]) {
        let sent = match &self.mux {
            Some(mux) => mux.write_blocking(mux.at_channel(), bytes).await,
            None => write_all_blocking(self.physical.as_ref(), bytes, &self.tx_idle).await,
        };
        if sent < bytes.len() {
            debug!(dropped = bytes.len() - sent, "AT link write incomplete");
        }
    }

    async fn flush_urcs(&mut self) {
        if !self.host.urc_allowed(Instant::now()) {
            return;
        }
        if let Some(mux) = &self.mux {
            mux.flush_urc().await;
            return;
        }
        let buffer = self.host.urc().buffer().clone();
        while let Some(record) = buffer.front() {
            if record.channel == AT_CHANNEL {
                write_all_blocking(self.physical.as_ref(), &record.data, &self.tx_idle).await;
            } else {
                debug!(channel = record.channel, "URC for a channel without multiplexer dropped");
                buffer.count_dropped(record.data.len());
            }
            buffer.pop_front();
        }
    }

    async fn start_mux(&mut self, at_dlci: u8) -> Result<(), HostError> {
        let (events_tx, events_rx) = mpsc::channel(QUEUE_CAPACITY);
        let mux = Multiplexer::new(
            self.physical.clone(),
            self.host.config().mux.clone(),
            self.host.urc().clone(),
            events_tx,
            at_dlci,
        )?;

        // URCs queued so far belong to the direct link
        self.flush_urcs().await;
        self.host.urc().buffer().release(UrcOwner::Host);
        let leftover = std::mem::take(&mut self.leftover);
        if let Err(e) = mux.start(leftover) {
            error!("Failed to start CMUX: {}", e);
            self.host.urc().buffer().acquire(UrcOwner::Host);
            return Err(e.into());
        }
        // Stale direct-link events must not be read as multiplexer traffic
        while self.pipe_rx.try_recv().is_ok() {}

        self.host.set_multiplexer(Some(mux.clone()));
        self.mux = Some(mux);
        self.mux_rx = Some(events_rx);
        info!(at_dlci, "AT host switched to CMUX");
        Ok(())
    }

    async fn handle_mux_event(&mut self, event: MuxEvent) -> Result<(), HostError> {
        match event {
            MuxEvent::AtReceiveReady => self.drain_mux().await?,
            MuxEvent::Disconnected => self.stop_mux().await?,
            MuxEvent::AtChannelChanged { from, to } => info!(from, to, "AT channel changed"),
            MuxEvent::ChannelOpened(dlci) => {
                debug!(dlci, "CMUX channel opened");
                if self.mux.as_ref().is_some_and(|m| m.at_channel() == dlci) {
                    // Pending URCs can go out now that the AT channel is up
                    self.flush_urcs().await;
                }
            }
            MuxEvent::ChannelClosed(dlci) => debug!(dlci, "CMUX channel closed"),
            MuxEvent::Connected => info!("CMUX link up"),
        }
        Ok(())
    }

    /// Return to direct AT mode after the multiplexer went down
    async fn stop_mux(&mut self) -> Result<(), HostError> {
        let Some(mux) = self.mux.take() else {
            return Ok(());
        };
        self.mux_rx = None;
        self.host.set_multiplexer(None);

        sleep(Duration::from_millis(self.host.config().mux.disconnect_grace_ms)).await;
        mux.stop();
        drop(mux);

        self.host.reset();
        self.host.urc().buffer().acquire(UrcOwner::Host);
        if !self.physical.is_open() {
            error!("Serial link lost with the multiplexer");
            return Err(HostError::LinkClosed);
        }
        self.attach_direct();
        info!("AT host back on the direct link");
        self.drain_physical().await
    }
}

async fn next_mux_event(rx: &mut Option<mpsc::Receiver<MuxEvent>>) -> Option<MuxEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}
