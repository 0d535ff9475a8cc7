//! Commands the host answers itself
//!
//! These never reach the AT engine: echo control, the data mode time limit and the
//! multiplexer switch.

use sm_protocol::{CommandOp, Envelope};
use tracing::{info, warn};

use crate::events::LinkRequest;
use crate::host::AtHost;

/// Highest DLCI that may carry AT traffic
const MAX_AT_DLCI: u8 = 2;

/// Handle `envelope` if it is a local command; `false` passes it on to the engine
pub(crate) fn handle_local(host: &mut AtHost, envelope: &Envelope<'_>) -> bool {
    if envelope.is("ATE0") || envelope.is("ATE1") {
        let on = envelope.name.ends_with('1');
        host.set_echo(on);
        host.send_ok();
        return true;
    }
    if envelope.is("AT#XDATACTRL") {
        datactrl(host, envelope);
        return true;
    }
    if envelope.is("AT#XCMUX") {
        cmux(host, envelope);
        return true;
    }
    false
}

fn datactrl(host: &mut AtHost, envelope: &Envelope<'_>) {
    let min = host.config().min_time_limit_ms();
    match envelope.op {
        CommandOp::Set => {
            let Ok(limit) = envelope.params.trim().parse::<u64>() else {
                host.send_error();
                return;
            };
            if limit > 0 && limit < min {
                warn!(limit, min, "Data mode time limit too small");
                host.send_error();
                return;
            }
            host.set_time_limit_ms(limit);
            host.send_ok();
        }
        CommandOp::Read => {
            let line = format!("\r\n#XDATACTRL: {},{}\r\n", host.time_limit_ms(), min);
            host.transmit(line.as_bytes());
            host.send_ok();
        }
        CommandOp::Test => {
            host.transmit(b"\r\n#XDATACTRL=<time_limit>\r\n");
            host.send_ok();
        }
        CommandOp::Action => host.send_error(),
    }
}

fn cmux(host: &mut AtHost, envelope: &Envelope<'_>) {
    let mux = host.multiplexer();
    match envelope.op {
        CommandOp::Read => {
            let at_dlci = mux.as_ref().map_or(host.at_dlci(), |m| m.at_channel());
            let line = format!(
                "\r\n#XCMUX: {},{}\r\n",
                at_dlci,
                host.config().mux.channel_count
            );
            host.transmit(line.as_bytes());
            host.send_ok();
        }
        CommandOp::Test => {
            host.transmit(b"\r\n#XCMUX: (1,2)\r\n");
            host.send_ok();
        }
        CommandOp::Action => {
            if mux.is_some() {
                host.send_error();
                return;
            }
            start_mux(host);
        }
        CommandOp::Set => {
            let max = MAX_AT_DLCI.min(host.config().mux.channel_count);
            let dlci = match envelope.params.trim().parse::<u8>() {
                Ok(dlci) if (1..=max).contains(&dlci) => dlci,
                _ => {
                    host.send_error();
                    return;
                }
            };
            match mux {
                None => {
                    host.set_at_dlci(dlci);
                    start_mux(host);
                }
                Some(mux) if mux.is_reserved(dlci) => {
                    warn!(dlci, "AT channel requested on a reserved channel");
                    host.send_error();
                }
                Some(_) => {
                    info!(dlci, "AT channel change requested");
                    // Applied once the OK below has gone out on the current channel
                    host.request_link(LinkRequest::SetAtChannel(dlci), false);
                    host.send_ok();
                }
            }
        }
    }
}

fn start_mux(host: &mut AtHost) {
    let at_dlci = host.at_dlci();
    info!(at_dlci, "Starting CMUX");
    host.send_ok();
    host.request_link(LinkRequest::StartMux { at_dlci }, true);
}
