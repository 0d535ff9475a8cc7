//! Demultiplexer task
//!
//! Reads the physical pipe, decodes CMUX frames and routes them through the engine.
//! The task lives from [`Multiplexer::start`](crate::Multiplexer::start) until the
//! multiplexer stops or the physical pipe closes.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use sm_pipe::{PipeEvent, PipeEventHandler};
use sm_protocol::{cmux::CmuxCodec, ProtocolCodec};
use tracing::{debug, warn};

use crate::engine::MuxShared;

/// Event handler installed on the physical pipe while the multiplexer owns it
pub(crate) fn physical_handler(weak: Weak<MuxShared>) -> PipeEventHandler {
    Arc::new(move |event| {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        match event {
            PipeEvent::ReceiveReady => shared.rx_wake.notify_one(),
            PipeEvent::TransmitIdle => shared.on_physical_idle(),
            PipeEvent::Closed => {
                shared.physical_closed.store(true, Ordering::Release);
                shared.rx_wake.notify_one();
            }
            PipeEvent::Opened => {}
        }
    })
}

pub(crate) async fn run_demux(shared: Arc<MuxShared>, leftover: Vec<u8>) {
    let mut codec = CmuxCodec::new(shared.config.mtu);
    let mut buf = vec![0u8; shared.config.mtu + 8];

    codec.push_bytes(&leftover);
    while let Some(frame) = codec.next_frame() {
        shared.handle_frame(frame);
    }

    loop {
        if shared.stopping.load(Ordering::Acquire) {
            break;
        }

        let n = match shared.physical.receive(&mut buf) {
            Ok(n) => n,
            Err(e) => {
                warn!("Physical receive failed: {}", e);
                0
            }
        };

        if n > 0 {
            codec.push_bytes(&buf[..n]);
            while let Some(frame) = codec.next_frame() {
                shared.handle_frame(frame);
            }
            continue;
        }

        if shared.physical_closed.load(Ordering::Acquire) {
            warn!("Physical pipe closed under the multiplexer");
            shared.disconnect();
            break;
        }

        shared.rx_wake.notified().await;
    }

    debug!("Demux task finished");
}
