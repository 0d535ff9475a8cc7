//! Simulated AT engine
//!
//! Answers a handful of identification and test commands the way a cellular modem
//! would, and opens data mode sessions whose payload is looped back to the host.

use serde::{Deserialize, Serialize};
use sm_host::{AtEngine, AtReply, DataModeFlags, DataModeHandler, EngineError, HostContext};
use sm_protocol::{parse_envelope, CommandOp};
use tracing::{debug, info, warn};

use crate::handler::RecordingHandler;

/// `-ENOMEM`, reported when a loopback session outgrows its buffer
const ENOMEM: i32 = -12;

/// Identity reported by the simulated modem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimModemConfig {
    pub manufacturer: String,
    pub model: String,
    pub revision: String,
    /// Most payload bytes a loopback session holds before failing
    pub loopback_capacity: usize,
}

impl Default for SimModemConfig {
    fn default() -> Self {
        Self {
            manufacturer: "Simulated Modems".to_string(),
            model: "SIM-9160".to_string(),
            revision: "sim_fw_1.0.0".to_string(),
            loopback_capacity: 16 * 1024,
        }
    }
}

/// An [`AtEngine`] that needs no hardware
#[derive(Debug, Default)]
pub struct SimModem {
    config: SimModemConfig,
    recorder: Option<RecordingHandler>,
    commands: usize,
}

impl SimModem {
    pub fn new(config: SimModemConfig) -> Self {
        Self {
            config,
            recorder: None,
            commands: 0,
        }
    }

    /// Route `AT#XSEND` sessions to `handler` instead of looping them back
    pub fn record_sessions(&mut self, handler: RecordingHandler) {
        self.recorder = Some(handler);
    }

    pub fn config(&self) -> &SimModemConfig {
        &self.config
    }

    /// Number of commands executed so far
    pub fn commands(&self) -> usize {
        self.commands
    }

    fn start_session(
        &mut self,
        op: CommandOp,
        params: &str,
        ctx: &mut dyn HostContext,
    ) -> Result<AtReply, EngineError> {
        let expected_len = match op {
            CommandOp::Action => 0,
            CommandOp::Set => params
                .trim()
                .parse::<usize>()
                .map_err(|_| EngineError::InvalidParameter(params.to_string()))?,
            CommandOp::Test => return Ok(AtReply::Response("#XSEND=<len>\r\nOK\r\n".into())),
            CommandOp::Read => return Err(EngineError::Unsupported("AT#XSEND?".into())),
        };

        let handler: Box<dyn DataModeHandler> = match &self.recorder {
            Some(recorder) => Box::new(recorder.clone()),
            None => Box::new(LoopbackHandler::new(self.config.loopback_capacity)),
        };
        ctx.enter_data_mode(handler, expected_len)?;
        info!(expected_len, "Simulated send session started");
        Ok(AtReply::ok())
    }
}

impl AtEngine for SimModem {
    fn execute(
        &mut self,
        command: &[u8],
        ctx: &mut dyn HostContext,
    ) -> Result<AtReply, EngineError> {
        self.commands += 1;
        let command = String::from_utf8_lossy(command);
        let envelope =
            parse_envelope(&command).map_err(|e| EngineError::InvalidParameter(e.to_string()))?;
        debug!(name = envelope.name, "Simulated modem command");

        if envelope.is("AT") {
            return Ok(AtReply::ok());
        }
        if envelope.is("AT+CGMI") {
            let c = &self.config;
            return Ok(AtReply::Response(format!(
                "{}\r\n{}\r\nOK\r\n",
                c.manufacturer, c.model
            )));
        }
        if envelope.is("AT+CGMR") {
            return Ok(AtReply::Response(format!(
                "{}\r\nOK\r\n",
                self.config.revision
            )));
        }
        if envelope.is("AT+CME") {
            return Ok(AtReply::Response("+CME ERROR: 100\r\n".into()));
        }
        if envelope.is("AT#XSEND") {
            return self.start_session(envelope.op, envelope.params, ctx);
        }
        if envelope.is("AT#XURC") && envelope.op == CommandOp::Set {
            let text = envelope.params.trim().trim_matches('"');
            ctx.send_urgent(&format!("\r\n{text}\r\n"))
                .map_err(|e| EngineError::Failed(e.to_string()))?;
            return Ok(AtReply::ok());
        }

        warn!(command = %command, "Simulated modem does not know this command");
        Err(EngineError::Unsupported(command.into_owned()))
    }
}

/// Collects a session's payload and sends it back when the session ends normally
#[derive(Debug)]
pub struct LoopbackHandler {
    payload: Vec<u8>,
    capacity: usize,
}

impl LoopbackHandler {
    pub fn new(capacity: usize) -> Self {
        Self {
            payload: Vec::new(),
            capacity,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

impl DataModeHandler for LoopbackHandler {
    fn send(&mut self, data: &[u8], _flags: DataModeFlags) -> Result<usize, i32> {
        if self.payload.len() + data.len() > self.capacity {
            warn!(
                held = self.payload.len(),
                incoming = data.len(),
                "Loopback buffer full"
            );
            return Err(ENOMEM);
        }
        self.payload.extend_from_slice(data);
        Ok(data.len())
    }

    fn exit(&mut self, flags: DataModeFlags, ctx: &mut dyn HostContext) {
        if flags.exit_handler {
            debug!(dropped = self.payload.len(), "Loopback session aborted");
        } else if !self.payload.is_empty() {
            ctx.send_data(&self.payload);
        }
        self.payload.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sm_host::{AtHost, HostConfig, HostEvent, OperationMode};
    use sm_pipe::{UrcBuffer, UrcSender};
    use std::sync::Arc;
    use tokio::sync::Notify;

    fn host() -> AtHost {
        let urc = UrcSender::new(Arc::new(UrcBuffer::new(128)), Arc::new(Notify::new()));
        AtHost::new(HostConfig::default(), urc)
    }

    fn run(host: &mut AtHost, modem: &mut SimModem, input: &[u8]) -> String {
        host.receive(input, modem);
        let out: Vec<u8> = host
            .drain_events()
            .into_iter()
            .filter_map(|e| match e {
                HostEvent::Transmit(bytes) => Some(bytes),
                _ => None,
            })
            .flatten()
            .collect();
        String::from_utf8_lossy(&out).into_owned()
    }

    #[test]
    fn test_identification() {
        let mut host = host();
        let mut modem = SimModem::default();
        assert_eq!(run(&mut host, &mut modem, b"AT\r"), "\r\nOK\r\n");
        assert_eq!(
            run(&mut host, &mut modem, b"AT+CGMI\r"),
            "\r\nSimulated Modems\r\nSIM-9160\r\n\r\nOK\r\n"
        );
        assert_eq!(
            run(&mut host, &mut modem, b"at+cgmr\r"),
            "\r\nsim_fw_1.0.0\r\n\r\nOK\r\n"
        );
        assert_eq!(modem.commands(), 3);
    }

    #[test]
    fn test_errors() {
        let mut host = host();
        let mut modem = SimModem::default();
        assert_eq!(
            run(&mut host, &mut modem, b"AT+CME\r"),
            "\r\n+CME ERROR: 100\r\n"
        );
        assert_eq!(run(&mut host, &mut modem, b"AT+COPS?\r"), "\r\nERROR\r\n");
        assert_eq!(run(&mut host, &mut modem, b"AT#XSEND=x\r"), "\r\nERROR\r\n");
    }

    #[test]
    fn test_urc_is_queued() {
        let mut host = host();
        let mut modem = SimModem::default();
        assert_eq!(
            run(&mut host, &mut modem, b"AT#XURC=\"+CEREG: 1\"\r"),
            "\r\nOK\r\n"
        );
        let record = host.urc().buffer().front().expect("URC queued");
        assert_eq!(record.data, b"\r\n+CEREG: 1\r\n");
    }

    #[test]
    fn test_loopback_echoes_before_exit_line() {
        let mut host = host();
        let mut modem = SimModem::default();
        assert_eq!(run(&mut host, &mut modem, b"AT#XSEND\r"), "\r\nOK\r\n");
        assert_eq!(
            run(&mut host, &mut modem, b"ping+++"),
            "ping\r\n#XDATAMODE: 0\r\n"
        );
        assert_eq!(host.mode(), OperationMode::Command);
    }

    #[test]
    fn test_loopback_overflow_aborts_session() {
        let mut host = host();
        let mut modem = SimModem::new(SimModemConfig {
            loopback_capacity: 4,
            ..SimModemConfig::default()
        });
        run(&mut host, &mut modem, b"AT#XSEND=8\r");
        assert_eq!(run(&mut host, &mut modem, b"12345678"), "");
        assert_eq!(host.mode(), OperationMode::Null);
        assert_eq!(
            run(&mut host, &mut modem, b"+++"),
            "\r\n#XDATAMODE: -1\r\n"
        );
    }

    #[test]
    fn test_recorded_session() {
        let mut host = host();
        let mut modem = SimModem::default();
        let recorder = RecordingHandler::new();
        modem.record_sessions(recorder.clone());

        run(&mut host, &mut modem, b"AT#XSEND=3\rabcAT\r");
        let recording = recorder.recording();
        assert_eq!(recording.payload(), b"abc");
        assert_eq!(recording.exits, vec![DataModeFlags::default()]);
        assert_eq!(host.mode(), OperationMode::Command);
    }
}
