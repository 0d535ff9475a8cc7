//! Command/data-mode engine
//!
//! [`AtHost`] classifies every received byte by the current [`OperationMode`]:
//!
//! - **Command**: bytes are accumulated into a command line, echoed if enabled, and the
//!   completed line is checked and dispatched to the [`AtEngine`]
//! - **Data**: bytes are payload for the registered [`DataModeHandler`], except the quit
//!   string which ends the session
//! - **Null**: bytes are dropped until the quit string, after an aborted session
//!
//! The engine is synchronous. Everything it wants done on the link is collected as
//! [`HostEvent`]s which the worker drains and carries out in order.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use sm_mux::Multiplexer;
use sm_pipe::{lock, ByteRing, UrcError, UrcSender};
use sm_protocol::{
    datamode_exit_line, find_command_start, format_final_result, parse_envelope, QuitMatcher,
    QuitStep, ERROR_RESPONSE, OK_RESPONSE,
};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::accumulator::{Accumulated, CommandAccumulator};
use crate::commands;
use crate::config::HostConfig;
use crate::datamode::{DataModeFlags, DataModeHandler};
use crate::engine::{AtEngine, AtReply, HostContext};
use crate::error::ModeError;
use crate::events::{HostEvent, LinkRequest};
use crate::mode::{OperationMode, Transition};

/// DLCI carrying AT traffic when multiplexing starts without an explicit choice
pub const DEFAULT_AT_DLCI: u8 = 1;

struct DataSession {
    handler: Box<dyn DataModeHandler>,
    expected_len: usize,
    received: usize,
    time_limit: Option<Duration>,
}

/// Mode and session, guarded together
pub(crate) struct ModeState {
    mode: OperationMode,
    session: Option<DataSession>,
    result: i32,
}

impl ModeState {
    fn transition(&mut self, transition: Transition) -> Result<(), ModeError> {
        let next = self.mode.apply(transition)?;
        debug!("Mode changed: {:?} -> {:?}", self.mode, next);
        self.mode = next;
        Ok(())
    }
}

/// State shared with [`HostHandle`](crate::HostHandle)s
pub(crate) struct HostShared {
    pub(crate) mode: Mutex<ModeState>,
    pub(crate) mux: Mutex<Option<Multiplexer>>,
}

impl HostShared {
    pub(crate) fn mode(&self) -> OperationMode {
        lock(&self.mode).mode
    }
}

/// The command/data-mode engine
pub struct AtHost {
    config: HostConfig,
    shared: Arc<HostShared>,
    accumulator: CommandAccumulator,
    quit: QuitMatcher,
    data: Mutex<ByteRing>,
    urc: UrcSender,
    events: Vec<HostEvent>,
    echo: bool,
    echoed: usize,
    echo_truncated: bool,
    echo_deadline: Option<Instant>,
    inactivity_deadline: Option<Instant>,
    time_limit_ms: u64,
    at_dlci: u8,
    null_dropped: usize,
    halted: bool,
}

impl AtHost {
    /// Create a host in command mode; URCs are queued through `urc`
    pub fn new(config: HostConfig, urc: UrcSender) -> Self {
        let shared = Arc::new(HostShared {
            mode: Mutex::new(ModeState {
                mode: OperationMode::Command,
                session: None,
                result: 0,
            }),
            mux: Mutex::new(None),
        });
        Self {
            accumulator: CommandAccumulator::new(config.line_termination, config.command_buffer_max),
            quit: QuitMatcher::new(config.quit_string.as_bytes()),
            data: Mutex::new(ByteRing::new(config.datamode_buffer_size)),
            echo: config.echo,
            time_limit_ms: config.datamode_time_limit_ms,
            config,
            shared,
            urc,
            events: Vec::new(),
            echoed: 0,
            echo_truncated: false,
            echo_deadline: None,
            inactivity_deadline: None,
            at_dlci: DEFAULT_AT_DLCI,
            null_dropped: 0,
            halted: false,
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn urc(&self) -> &UrcSender {
        &self.urc
    }

    pub(crate) fn shared(&self) -> &Arc<HostShared> {
        &self.shared
    }

    /// Current operation mode
    pub fn mode(&self) -> OperationMode {
        self.shared.mode()
    }

    /// Whether command echo is on
    pub fn echo_enabled(&self) -> bool {
        self.echo
    }

    pub(crate) fn set_echo(&mut self, on: bool) {
        self.echo = on;
    }

    /// Data mode inactivity limit set by configuration or `AT#XDATACTRL`; 0 derives it
    pub fn time_limit_ms(&self) -> u64 {
        self.time_limit_ms
    }

    pub(crate) fn set_time_limit_ms(&mut self, ms: u64) {
        self.time_limit_ms = ms;
    }

    /// DLCI that will carry AT traffic when multiplexing starts
    pub fn at_dlci(&self) -> u8 {
        self.at_dlci
    }

    pub(crate) fn set_at_dlci(&mut self, dlci: u8) {
        self.at_dlci = dlci;
    }

    /// The running multiplexer, if any
    pub fn multiplexer(&self) -> Option<Multiplexer> {
        lock(&self.shared.mux).clone()
    }

    pub(crate) fn set_multiplexer(&self, mux: Option<Multiplexer>) {
        *lock(&self.shared.mux) = mux;
    }

    /// When the data mode inactivity timer fires
    pub fn inactivity_deadline(&self) -> Option<Instant> {
        self.inactivity_deadline
    }

    /// Until when URCs are held back because of an incomplete echoed command
    pub fn echo_deadline(&self) -> Option<Instant> {
        self.echo_deadline
    }

    /// Forget an echo deadline that has passed
    pub fn expire_echo_deadline(&mut self, now: Instant) {
        if self.echo_deadline.is_some_and(|d| d <= now) {
            self.echo_deadline = None;
        }
    }

    /// Whether queued URCs may be written now
    pub fn urc_allowed(&self, now: Instant) -> bool {
        self.mode() == OperationMode::Command && !self.echo_deadline.is_some_and(|d| d > now)
    }

    /// Take the events produced so far
    pub fn drain_events(&mut self) -> Vec<HostEvent> {
        std::mem::take(&mut self.events)
    }

    /// Return to the startup state
    pub fn reset(&mut self) {
        {
            let mut state = lock(&self.shared.mode);
            state.mode = OperationMode::Command;
            state.session = None;
            state.result = 0;
        }
        self.accumulator.reset();
        self.quit.reset();
        lock(&self.data).reset();
        self.echo = self.config.echo;
        self.echoed = 0;
        self.echo_truncated = false;
        self.echo_deadline = None;
        self.inactivity_deadline = None;
        self.null_dropped = 0;
        self.halted = false;
        info!("AT host reset");
    }

    /// Feed received bytes; returns how many were consumed
    ///
    /// Everything is consumed unless a command switched the link to multiplexing, in
    /// which case the bytes after that command are left for the multiplexer.
    pub fn receive(&mut self, data: &[u8], engine: &mut dyn AtEngine) -> usize {
        self.halted = false;
        self.inactivity_deadline = None;

        let mut consumed = 0;
        while consumed < data.len() && !self.halted {
            let mode = self.mode();
            let rest = &data[consumed..];
            let n = match mode {
                OperationMode::Command => self.command_receive(rest, engine),
                OperationMode::Data => self.data_receive(rest),
                OperationMode::Null => self.null_receive(rest),
            };
            consumed += n;
            if n == 0 && self.mode() == mode {
                break;
            }
        }

        if self.mode() == OperationMode::Data {
            let limit = lock(&self.shared.mode)
                .session
                .as_ref()
                .and_then(|s| s.time_limit);
            self.inactivity_deadline = limit.map(|l| Instant::now() + l);
        }
        consumed
    }

    pub(crate) fn transmit(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        if let Some(HostEvent::Transmit(buf)) = self.events.last_mut() {
            buf.extend_from_slice(bytes);
        } else {
            self.events.push(HostEvent::Transmit(bytes.to_vec()));
        }
    }

    pub(crate) fn send_ok(&mut self) {
        self.transmit(OK_RESPONSE.as_bytes());
    }

    pub(crate) fn send_error(&mut self) {
        self.transmit(ERROR_RESPONSE.as_bytes());
    }

    /// Ask the worker to switch transport; with `halt`, stop consuming input
    pub(crate) fn request_link(&mut self, request: LinkRequest, halt: bool) {
        self.events.push(HostEvent::Link(request));
        self.halted |= halt;
    }

    // ------------------------------------------------------------------------
    // Command mode
    // ------------------------------------------------------------------------

    fn command_receive(&mut self, bytes: &[u8], engine: &mut dyn AtEngine) -> usize {
        for (i, &byte) in bytes.iter().enumerate() {
            match self.accumulator.push(byte) {
                Accumulated::Stored | Accumulated::Erased => self.echo_byte(byte, false),
                Accumulated::Discarded => {}
                Accumulated::Empty => self.echo_byte(byte, true),
                Accumulated::Overflow => {
                    warn!(
                        max = self.config.command_buffer_max,
                        "AT command buffer overflow"
                    );
                    self.finish_echo();
                    self.send_error();
                }
                Accumulated::Complete(line) => {
                    self.echo_byte(byte, true);
                    self.dispatch(&line, engine);
                    return i + 1;
                }
            }
        }
        bytes.len()
    }

    fn echo_byte(&mut self, byte: u8, ends_line: bool) {
        if !self.echo {
            return;
        }
        if ends_line {
            if self.echo_truncated {
                self.transmit(self.accumulator.termination().as_bytes());
            } else {
                self.transmit(&[byte]);
            }
            self.finish_echo();
            return;
        }
        // Keep room for the terminator
        let reserved = self.accumulator.termination().byte_count();
        if self.echoed + reserved < self.config.echo_max_len {
            self.transmit(&[byte]);
            self.echoed += 1;
            self.echo_deadline = Some(
                Instant::now() + Duration::from_millis(self.config.urc_delay_with_incomplete_echo_ms),
            );
        } else {
            self.echo_truncated = true;
        }
    }

    fn finish_echo(&mut self) {
        self.echoed = 0;
        self.echo_truncated = false;
        self.echo_deadline = None;
    }

    fn dispatch(&mut self, line: &[u8], engine: &mut dyn AtEngine) {
        let Some(start) = find_command_start(line) else {
            debug!(len = line.len(), "No AT prefix in command line");
            self.send_error();
            return;
        };
        let raw = &line[start..];
        // The envelope is ASCII; invalid UTF-8 can only sit in the parameters
        let command = String::from_utf8_lossy(raw);
        let envelope = match parse_envelope(&command) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(command = %command, "Rejected AT command: {}", e);
                self.send_error();
                return;
            }
        };

        debug!(command = %command, "AT command");
        if commands::handle_local(self, &envelope) {
            return;
        }

        match engine.execute(raw, self) {
            Ok(AtReply::Response(text)) => {
                let framed = format_final_result(&text);
                self.transmit(framed.as_bytes());
            }
            Ok(AtReply::Silent) => {}
            Err(e) => {
                warn!(command = %command, "AT command failed: {}", e);
                self.send_error();
            }
        }
    }

    // ------------------------------------------------------------------------
    // Data mode
    // ------------------------------------------------------------------------

    fn data_receive(&mut self, bytes: &[u8]) -> usize {
        let progress = lock(&self.shared.mode)
            .session
            .as_ref()
            .map(|s| (s.expected_len, s.received));
        let Some((expected_len, received)) = progress else {
            warn!(dropped = bytes.len(), "Data mode without a session");
            return bytes.len();
        };

        if expected_len > 0 {
            let n = expected_len.saturating_sub(received).min(bytes.len());
            self.buffer_payload(&bytes[..n]);
            if let Some(session) = lock(&self.shared.mode).session.as_mut() {
                session.received += n;
            }
            if received + n >= expected_len && self.mode() == OperationMode::Data {
                debug!(expected_len, "Expected data length reached");
                self.exit_data_mode();
            }
            return n;
        }

        for (i, &byte) in bytes.iter().enumerate() {
            match self.quit.feed(byte) {
                QuitStep::Pending => {}
                QuitStep::Release { prefix, byte: with_byte } => {
                    let mut payload = self.quit.pattern()[..prefix].to_vec();
                    if with_byte {
                        payload.push(byte);
                    }
                    self.buffer_payload(&payload);
                    if self.mode() != OperationMode::Data {
                        return i + 1;
                    }
                }
                QuitStep::Complete => {
                    debug!("Quit string received");
                    self.exit_data_mode();
                    return i + 1;
                }
            }
        }
        bytes.len()
    }

    /// Append payload to the data ring, flushing to the handler whenever it fills up
    fn buffer_payload(&mut self, payload: &[u8]) {
        let mut rest = payload;
        while !rest.is_empty() {
            let stored = {
                let mut ring = lock(&self.data);
                if ring.is_empty() {
                    ring.reset();
                }
                ring.put(rest)
            };
            rest = &rest[stored..];
            if !rest.is_empty() {
                self.flush_data(DataModeFlags::MORE_DATA);
                if self.mode() != OperationMode::Data {
                    return;
                }
            }
        }
    }

    /// Hand everything in the data ring to the handler
    fn flush_data(&mut self, flags: DataModeFlags) {
        let data = lock(&self.data).take(usize::MAX);
        if data.is_empty() {
            return;
        }

        // The handler may query the mode, so it runs without the lock held
        let Some(mut session) = lock(&self.shared.mode).session.take() else {
            warn!(dropped = data.len(), "No data mode handler");
            return;
        };
        let mut offset = 0;
        let mut failure = None;
        while offset < data.len() {
            match session.handler.send(&data[offset..], flags) {
                Ok(0) => offset = data.len(),
                Ok(n) => offset += n.min(data.len() - offset),
                Err(code) => {
                    failure = Some(code);
                    break;
                }
            }
        }
        lock(&self.shared.mode).session = Some(session);

        if let Some(code) = failure {
            error!(code, dropped = data.len(), "Data mode send failed");
            self.exit_data_mode_forcibly(code);
            return;
        }

        debug!(size = data.len(), "Data mode payload sent");
        if self.config.datamode_urc {
            self.transmit(datamode_exit_line(data.len() as i32).as_bytes());
        }
    }

    /// End data mode normally
    ///
    /// Flushes buffered payload, lets the handler finish, reports the session outcome
    /// and returns to command mode. Returns `false` when not in data mode.
    pub fn exit_data_mode(&mut self) -> bool {
        if self.mode() != OperationMode::Data {
            return false;
        }

        self.flush_data(DataModeFlags::default());
        if self.mode() != OperationMode::Data {
            // The flush failed and aborted the session
            return true;
        }

        let session = lock(&self.shared.mode).session.take();
        if let Some(mut session) = session {
            session.handler.exit(DataModeFlags::default(), self);
        }

        let result = {
            let mut state = lock(&self.shared.mode);
            if let Err(e) = state.transition(Transition::ExitClean) {
                warn!("Data mode exit failed: {}", e);
                return false;
            }
            std::mem::take(&mut state.result)
        };
        self.leave_data_session();
        self.report_exit(result);
        info!("Exit data mode");
        true
    }

    fn leave_data_session(&mut self) {
        self.quit.reset();
        self.inactivity_deadline = None;
        lock(&self.data).reset();
    }

    fn report_exit(&mut self, result: i32) {
        if result != 0 {
            error!(result, "Data mode handler error");
        }
        let code = if result != 0 { -1 } else { 0 };
        self.transmit(datamode_exit_line(code).as_bytes());
        self.events.push(HostEvent::CommandModeEntered);
    }

    /// The inactivity timer expired
    ///
    /// A held partial quit string is given up as payload and everything buffered is sent.
    /// The session stays open.
    pub fn on_inactivity_timeout(&mut self) {
        self.inactivity_deadline = None;
        if self.mode() != OperationMode::Data {
            return;
        }
        debug!("Data mode time limit reached");
        let held = self.quit.take_pending().to_vec();
        self.buffer_payload(&held);
        if self.mode() == OperationMode::Data {
            self.flush_data(DataModeFlags::default());
        }
    }

    // ------------------------------------------------------------------------
    // Null mode
    // ------------------------------------------------------------------------

    fn null_receive(&mut self, bytes: &[u8]) -> usize {
        if self.null_dropped == 0 {
            warn!("Data pipe broken, dropping data until the quit string");
        }
        for (i, &byte) in bytes.iter().enumerate() {
            self.null_dropped += 1;
            if self.quit.feed(byte) != QuitStep::Complete {
                continue;
            }

            let dropped = self.null_dropped.saturating_sub(self.quit.pattern().len());
            self.null_dropped = 0;
            let result = {
                let mut state = lock(&self.shared.mode);
                if let Err(e) = state.transition(Transition::QuitDetected) {
                    warn!("Leaving null mode failed: {}", e);
                    return i + 1;
                }
                std::mem::take(&mut state.result)
            };
            info!(dropped, "Terminating data mode");
            self.leave_data_session();
            self.report_exit(result);
            return i + 1;
        }
        bytes.len()
    }
}

impl HostContext for AtHost {
    fn send_response(&mut self, text: &str) {
        self.transmit(text.as_bytes());
    }

    fn send_urgent(&mut self, text: &str) -> Result<(), UrcError> {
        self.urc.send(text)
    }

    fn send_data(&mut self, data: &[u8]) {
        self.transmit(data);
    }

    fn enter_data_mode(
        &mut self,
        handler: Box<dyn DataModeHandler>,
        expected_len: usize,
    ) -> Result<(), ModeError> {
        let time_limit = match (self.time_limit_ms, expected_len) {
            (0, 0) => Some(Duration::from_millis(self.config.min_time_limit_ms())),
            (0, _) => None,
            (ms, _) => Some(Duration::from_millis(ms)),
        };
        {
            let mut state = lock(&self.shared.mode);
            let next = state.mode.apply(Transition::EnterData)?;
            if state.session.is_some() {
                return Err(ModeError::AlreadyActive);
            }
            state.mode = next;
            state.session = Some(DataSession {
                handler,
                expected_len,
                received: 0,
                time_limit,
            });
            state.result = 0;
        }
        lock(&self.data).reset();
        self.quit.reset();
        info!(expected_len, ?time_limit, "Enter data mode");
        Ok(())
    }

    fn exit_data_mode_forcibly(&mut self, result: i32) {
        let session = {
            let mut state = lock(&self.shared.mode);
            if state.transition(Transition::ForceExit).is_err() {
                return;
            }
            state.result = result;
            state.session.take()
        };
        lock(&self.data).reset();
        self.quit.reset();
        self.inactivity_deadline = None;
        self.null_dropped = 0;
        if let Some(mut session) = session {
            session.handler.exit(DataModeFlags::EXIT_HANDLER, self);
        }
        warn!(result, "Data mode aborted");
    }

    fn in_data_mode(&self) -> bool {
        self.mode() == OperationMode::Data
    }

    fn in_command_mode(&self) -> bool {
        self.mode() == OperationMode::Command
    }
}
