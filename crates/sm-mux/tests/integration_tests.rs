//! Integration tests for the CMUX multiplexer
//!
//! A UART pipe over an in-memory duplex stream stands in for the serial line; the far
//! end plays the CMUX initiator with its own codec.

use std::sync::Arc;
use std::time::Duration;

use sm_mux::{DlciState, Multiplexer, MultiplexerConfig, MuxError, MuxEvent};
use sm_pipe::{Pipe, PipeEvent, UartConfig, UartPipe, UrcBuffer, UrcSender, AT_CHANNEL};
use sm_protocol::cmux::{CmuxCodec, ControlMessage, ControlType, Frame, FrameType};
use sm_protocol::ProtocolCodec;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;

// ============================================================================
// Helper Functions
// ============================================================================

mod helpers {
    use super::*;

    pub const WAIT: Duration = Duration::from_secs(2);

    /// The far end of the serial line
    pub struct Peer {
        pub io: DuplexStream,
        codec: CmuxCodec,
    }

    impl Peer {
        pub async fn send(&mut self, frame: Frame) {
            self.io.write_all(&frame.encode()).await.unwrap();
        }

        /// Send a command frame the way an initiator does
        pub async fn command(&mut self, dlci: u8, frame_type: FrameType, info: &[u8]) {
            let pf = frame_type != FrameType::Uih;
            self.send(Frame::new(dlci, frame_type, true, pf, info.to_vec()))
                .await;
        }

        pub async fn next_frame(&mut self) -> Frame {
            timeout(WAIT, async {
                loop {
                    if let Some(frame) = self.codec.next_frame() {
                        return frame;
                    }
                    let mut buf = [0u8; 256];
                    let n = self.io.read(&mut buf).await.unwrap();
                    assert!(n > 0, "link closed while waiting for a frame");
                    self.codec.push_bytes(&buf[..n]);
                }
            })
            .await
            .expect("timed out waiting for a frame")
        }
    }

    pub struct Harness {
        pub mux: Multiplexer,
        pub events: mpsc::Receiver<MuxEvent>,
        pub peer: Peer,
        pub urc: UrcSender,
    }

    pub fn setup(config: MultiplexerConfig, at_dlci: u8) -> Harness {
        let (local, remote) = tokio::io::duplex(4096);
        let physical = UartPipe::new(local, UartConfig::default());
        physical.open().unwrap();

        let urc = UrcSender::new(Arc::new(UrcBuffer::new(256)), Arc::new(Notify::new()));
        let (events_tx, events) = mpsc::channel(64);
        let mux = Multiplexer::new(Arc::new(physical), config, urc.clone(), events_tx, at_dlci)
            .unwrap();
        mux.start(Vec::new()).unwrap();

        Harness {
            mux,
            events,
            peer: Peer {
                io: remote,
                codec: CmuxCodec::new(1024),
            },
            urc,
        }
    }

    pub async fn wait_for(events: &mut mpsc::Receiver<MuxEvent>, expected: MuxEvent) {
        timeout(WAIT, async {
            loop {
                match events.recv().await {
                    Some(event) if event == expected => return,
                    Some(_) => continue,
                    None => panic!("event channel closed"),
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {expected:?}"));
    }

    /// Open the control channel from the peer side
    pub async fn connect(h: &mut Harness) {
        h.peer.command(0, FrameType::Sabm, &[]).await;
        let ua = h.peer.next_frame().await;
        assert_eq!((ua.dlci, ua.frame_type), (0, FrameType::Ua));
        wait_for(&mut h.events, MuxEvent::Connected).await;
    }

    /// Open a data channel from the peer side
    pub async fn open_channel(h: &mut Harness, dlci: u8) {
        h.peer.command(dlci, FrameType::Sabm, &[]).await;
        let ua = h.peer.next_frame().await;
        assert_eq!((ua.dlci, ua.frame_type), (dlci, FrameType::Ua));
        wait_for(&mut h.events, MuxEvent::ChannelOpened(dlci)).await;
    }

    pub fn pipe_events(pipe: &dyn Pipe) -> mpsc::UnboundedReceiver<PipeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        pipe.attach(Arc::new(move |event| {
            let _ = tx.send(event);
        }));
        rx
    }
}

use helpers::*;

// ============================================================================
// Link Management Tests
// ============================================================================

mod link_tests {
    use super::*;

    #[tokio::test]
    async fn test_peer_opens_control_and_data_channels() {
        let mut h = setup(MultiplexerConfig::default(), 1);
        connect(&mut h).await;
        assert!(h.mux.is_connected());

        open_channel(&mut h, 1).await;
        assert_eq!(h.mux.channel_state(1).unwrap(), DlciState::Open);
        assert_eq!(h.mux.channel_state(2).unwrap(), DlciState::Closed);
    }

    #[tokio::test]
    async fn test_responses_carry_response_bit() {
        let mut h = setup(MultiplexerConfig::default(), 1);
        h.peer.command(0, FrameType::Sabm, &[]).await;
        let ua = h.peer.next_frame().await;
        assert!(ua.cr);
        assert!(ua.pf);
    }

    #[tokio::test]
    async fn test_unknown_dlci_is_refused() {
        let mut h = setup(MultiplexerConfig::default(), 1);
        connect(&mut h).await;
        h.peer.command(5, FrameType::Sabm, &[]).await;
        let dm = h.peer.next_frame().await;
        assert_eq!((dm.dlci, dm.frame_type), (5, FrameType::Dm));
    }

    #[tokio::test]
    async fn test_disc_on_control_channel_disconnects() {
        let mut h = setup(MultiplexerConfig::default(), 1);
        connect(&mut h).await;
        open_channel(&mut h, 1).await;
        open_channel(&mut h, 2).await;

        h.peer.command(0, FrameType::Disc, &[]).await;
        let ua = h.peer.next_frame().await;
        assert_eq!((ua.dlci, ua.frame_type), (0, FrameType::Ua));
        wait_for(&mut h.events, MuxEvent::Disconnected).await;

        assert!(!h.mux.is_running());
        assert_eq!(h.mux.channel_state(1).unwrap(), DlciState::Closed);
        assert_eq!(h.mux.channel_state(2).unwrap(), DlciState::Closed);
    }

    #[tokio::test]
    async fn test_close_down_message_disconnects() {
        let mut h = setup(MultiplexerConfig::default(), 1);
        connect(&mut h).await;

        let cld = ControlMessage {
            kind: ControlType::CloseDown,
            command: true,
            values: Vec::new(),
        };
        h.peer.command(0, FrameType::Uih, &cld.encode()).await;

        let reply = h.peer.next_frame().await;
        assert_eq!(reply.frame_type, FrameType::Uih);
        let msg = ControlMessage::decode(&reply.info).unwrap();
        assert_eq!(msg.kind, ControlType::CloseDown);
        assert!(!msg.command);
        wait_for(&mut h.events, MuxEvent::Disconnected).await;
    }

    #[tokio::test]
    async fn test_modem_status_is_acknowledged() {
        let mut h = setup(MultiplexerConfig::default(), 1);
        connect(&mut h).await;

        let msc = ControlMessage {
            kind: ControlType::ModemStatus,
            command: true,
            values: vec![0x07, 0x0D],
        };
        h.peer.command(0, FrameType::Uih, &msc.encode()).await;

        let reply = h.peer.next_frame().await;
        let msg = ControlMessage::decode(&reply.info).unwrap();
        assert_eq!(msg, msc.response());
        assert!(h.mux.is_running());
    }

    #[tokio::test]
    async fn test_peer_disc_closes_single_channel() {
        let mut h = setup(MultiplexerConfig::default(), 1);
        connect(&mut h).await;
        open_channel(&mut h, 2).await;

        h.peer.command(2, FrameType::Disc, &[]).await;
        let ua = h.peer.next_frame().await;
        assert_eq!((ua.dlci, ua.frame_type), (2, FrameType::Ua));
        wait_for(&mut h.events, MuxEvent::ChannelClosed(2)).await;
        assert!(h.mux.is_running());
    }

    #[tokio::test]
    async fn test_local_open_completes_on_ua() {
        let mut h = setup(MultiplexerConfig::default(), 1);
        connect(&mut h).await;

        let pipe = h.mux.channel(3).unwrap();
        pipe.open().unwrap();
        assert_eq!(pipe.state(), DlciState::Opening);
        assert!(matches!(pipe.open(), Err(sm_pipe::PipeError::AlreadyOpen)));

        let sabm = h.peer.next_frame().await;
        assert_eq!((sabm.dlci, sabm.frame_type, sabm.cr), (3, FrameType::Sabm, false));
        h.peer.send(Frame::new(3, FrameType::Ua, false, true, Vec::new())).await;

        wait_for(&mut h.events, MuxEvent::ChannelOpened(3)).await;
        assert!(pipe.is_open());
    }

    #[tokio::test]
    async fn test_local_open_times_out() {
        let config = MultiplexerConfig {
            open_timeout_ms: 50,
            ..Default::default()
        };
        let mut h = setup(config, 1);
        connect(&mut h).await;

        let pipe = h.mux.channel(3).unwrap();
        pipe.open().unwrap();
        wait_for(&mut h.events, MuxEvent::ChannelClosed(3)).await;
        assert_eq!(pipe.state(), DlciState::Closed);
    }

    #[tokio::test]
    async fn test_physical_hangup_disconnects() {
        let mut h = setup(MultiplexerConfig::default(), 1);
        connect(&mut h).await;
        open_channel(&mut h, 1).await;

        drop(h.peer);
        wait_for(&mut h.events, MuxEvent::Disconnected).await;
        assert!(!h.mux.is_running());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let h = setup(MultiplexerConfig::default(), 1);
        assert!(matches!(h.mux.start(Vec::new()), Err(MuxError::AlreadyStarted)));
    }

    #[tokio::test]
    async fn test_leftover_bytes_are_decoded_first() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let physical = UartPipe::new(local, UartConfig::default());
        physical.open().unwrap();
        let urc = UrcSender::new(Arc::new(UrcBuffer::new(64)), Arc::new(Notify::new()));
        let (events_tx, mut events) = mpsc::channel(16);
        let mux = Multiplexer::new(
            Arc::new(physical),
            MultiplexerConfig::default(),
            urc,
            events_tx,
            1,
        )
        .unwrap();

        let sabm = Frame::new(0, FrameType::Sabm, true, true, Vec::new()).encode();
        mux.start(sabm).unwrap();
        wait_for(&mut events, MuxEvent::Connected).await;

        let mut buf = [0u8; 6];
        timeout(WAIT, remote.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(buf, [0xF9, 0x03, 0x73, 0x01, 0xD7, 0xF9]);
    }
}

// ============================================================================
// Channel Routing Tests
// ============================================================================

mod routing_tests {
    use super::*;

    #[tokio::test]
    async fn test_at_channel_data_signals_worker() {
        let mut h = setup(MultiplexerConfig::default(), 1);
        connect(&mut h).await;
        open_channel(&mut h, 1).await;

        h.peer.command(1, FrameType::Uih, b"AT+CFUN?\r").await;
        wait_for(&mut h.events, MuxEvent::AtReceiveReady).await;

        let mut buf = [0u8; 32];
        let n = h.mux.receive_at(&mut buf);
        assert_eq!(&buf[..n], b"AT+CFUN?\r");
    }

    #[tokio::test]
    async fn test_unreserved_channel_discards_data() {
        let mut h = setup(MultiplexerConfig::default(), 1);
        connect(&mut h).await;
        open_channel(&mut h, 1).await;
        open_channel(&mut h, 2).await;

        h.peer.command(2, FrameType::Uih, b"lost").await;
        // Frames are handled in order, so once this arrives the first was handled too
        h.peer.command(1, FrameType::Uih, b"AT\r").await;
        wait_for(&mut h.events, MuxEvent::AtReceiveReady).await;

        let pipe = h.mux.reserve(2).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(pipe.receive(&mut buf).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reserved_channel_receives_data() {
        let mut h = setup(MultiplexerConfig::default(), 1);
        connect(&mut h).await;
        open_channel(&mut h, 2).await;

        let pipe = h.mux.reserve(2).unwrap();
        let mut events = pipe_events(&pipe);
        h.peer.command(2, FrameType::Uih, b"payload").await;

        let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
        assert_eq!(event, PipeEvent::ReceiveReady);
        let mut buf = [0u8; 16];
        let n = pipe.receive(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"payload");
    }

    #[tokio::test]
    async fn test_reserved_channel_transmits() {
        let mut h = setup(MultiplexerConfig::default(), 1);
        connect(&mut h).await;
        open_channel(&mut h, 3).await;

        let pipe = h.mux.reserve(3).unwrap();
        assert_eq!(pipe.transmit(b"GPS fix").unwrap(), 7);
        let frame = h.peer.next_frame().await;
        assert_eq!((frame.dlci, frame.frame_type), (3, FrameType::Uih));
        assert_eq!(frame.info, b"GPS fix");
    }

    #[tokio::test]
    async fn test_reservation_rules() {
        let h = setup(MultiplexerConfig::default(), 1);

        assert!(matches!(h.mux.reserve(1), Err(MuxError::AtChannel(1))));
        assert!(matches!(h.mux.reserve(0), Err(MuxError::InvalidChannel(0))));
        assert!(matches!(h.mux.reserve(9), Err(MuxError::InvalidChannel(9))));

        let _pipe = h.mux.reserve(2).unwrap();
        assert!(h.mux.is_reserved(2));
        assert!(matches!(h.mux.reserve(2), Err(MuxError::AlreadyReserved(2))));
        assert!(matches!(
            h.mux.set_at_channel(2),
            Err(MuxError::AlreadyReserved(2))
        ));

        assert!(matches!(h.mux.release(3), Err(MuxError::NotReserved(3))));
        h.mux.release(2).unwrap();
        assert!(!h.mux.is_reserved(2));
    }
}

// ============================================================================
// Write Path Tests
// ============================================================================

mod write_tests {
    use super::*;

    #[tokio::test]
    async fn test_write_blocking_splits_at_mtu() {
        let config = MultiplexerConfig {
            mtu: 16,
            ..Default::default()
        };
        let mut h = setup(config, 1);
        connect(&mut h).await;
        open_channel(&mut h, 1).await;

        let data: Vec<u8> = (0..40).collect();
        assert_eq!(h.mux.write_blocking(1, &data).await, 40);

        let mut lengths = Vec::new();
        let mut received = Vec::new();
        while received.len() < data.len() {
            let frame = h.peer.next_frame().await;
            assert_eq!((frame.dlci, frame.frame_type), (1, FrameType::Uih));
            lengths.push(frame.info.len());
            received.extend_from_slice(&frame.info);
        }
        assert_eq!(lengths, vec![16, 16, 8]);
        assert_eq!(received, data);
    }

    #[tokio::test]
    async fn test_write_waits_for_staging_space() {
        let config = MultiplexerConfig {
            mtu: 32,
            staging_buffer: 64,
            ..Default::default()
        };
        let mut h = setup(config, 1);
        connect(&mut h).await;
        open_channel(&mut h, 1).await;

        let data = vec![0x55u8; 1000];
        let mux = h.mux.clone();
        let writer = tokio::spawn(async move { mux.write_blocking(1, &data).await });

        let mut received = 0;
        while received < 1000 {
            received += h.peer.next_frame().await.info.len();
        }
        assert_eq!(timeout(WAIT, writer).await.unwrap().unwrap(), 1000);
    }

    #[tokio::test]
    async fn test_write_to_closed_channel_sends_nothing() {
        let mut h = setup(MultiplexerConfig::default(), 1);
        connect(&mut h).await;
        assert_eq!(h.mux.write_blocking(2, b"dropped").await, 0);
        assert_eq!(h.mux.write_blocking(9, b"dropped").await, 0);
    }

    #[tokio::test]
    async fn test_at_channel_change_waits_for_write() {
        let mut h = setup(MultiplexerConfig::default(), 1);
        connect(&mut h).await;
        open_channel(&mut h, 1).await;
        open_channel(&mut h, 2).await;

        h.mux.set_at_channel(2).unwrap();
        assert_eq!(h.mux.at_channel(), 1);
        assert_eq!(h.mux.requested_at_channel(), Some(2));

        h.mux.write_blocking(1, b"\r\nOK\r\n").await;
        assert_eq!(h.mux.at_channel(), 2);
        assert_eq!(h.mux.requested_at_channel(), None);
        wait_for(&mut h.events, MuxEvent::AtChannelChanged { from: 1, to: 2 }).await;

        let ok = h.peer.next_frame().await;
        assert_eq!((ok.dlci, ok.info.as_slice()), (1, &b"\r\nOK\r\n"[..]));
    }

    #[tokio::test]
    async fn test_at_channel_set_before_start_applies_immediately() {
        let (local, _remote) = tokio::io::duplex(64);
        let urc = UrcSender::new(Arc::new(UrcBuffer::new(64)), Arc::new(Notify::new()));
        let (events_tx, _events) = mpsc::channel(4);
        let mux = Multiplexer::new(
            Arc::new(UartPipe::new(local, UartConfig::default())),
            MultiplexerConfig::default(),
            urc,
            events_tx,
            1,
        )
        .unwrap();
        mux.set_at_channel(3).unwrap();
        assert_eq!(mux.at_channel(), 3);
        assert_eq!(mux.requested_at_channel(), None);
        assert!(matches!(mux.reserve(2), Err(MuxError::NotStarted)));
    }

    #[tokio::test]
    async fn test_at_channel_outside_configured_channels_is_rejected() {
        let config = MultiplexerConfig {
            channel_count: 1,
            ..MultiplexerConfig::default()
        };
        for at_dlci in [0, 2] {
            let (local, _remote) = tokio::io::duplex(64);
            let urc = UrcSender::new(Arc::new(UrcBuffer::new(64)), Arc::new(Notify::new()));
            let (events_tx, _events) = mpsc::channel(4);
            let result = Multiplexer::new(
                Arc::new(UartPipe::new(local, UartConfig::default())),
                config.clone(),
                urc,
                events_tx,
                at_dlci,
            );
            assert!(matches!(result, Err(MuxError::InvalidChannel(d)) if d == at_dlci));
        }
    }
}

// ============================================================================
// URC Tests
// ============================================================================

mod urc_tests {
    use super::*;

    #[tokio::test]
    async fn test_flush_routes_urcs_and_drops_closed_channels() {
        let mut h = setup(MultiplexerConfig::default(), 1);
        connect(&mut h).await;
        open_channel(&mut h, 1).await;

        h.mux.write_urc(AT_CHANNEL, b"+CEREG: 1\r\n").unwrap();
        h.mux.write_urc(3, b"#XGPS: fix\r\n").unwrap();
        h.urc.send("+CSCON: 0\r\n").unwrap();

        assert_eq!(h.mux.flush_urc().await, 3);
        assert!(h.urc.buffer().is_empty());
        assert_eq!(h.urc.buffer().dropped_bytes(), b"#XGPS: fix\r\n".len());

        let first = h.peer.next_frame().await;
        assert_eq!((first.dlci, first.info.as_slice()), (1, &b"+CEREG: 1\r\n"[..]));
        let second = h.peer.next_frame().await;
        assert_eq!(second.info, b"+CSCON: 0\r\n");
    }

    #[tokio::test]
    async fn test_urcs_from_many_threads_stay_whole() {
        let mut h = setup(MultiplexerConfig::default(), 1);
        connect(&mut h).await;
        open_channel(&mut h, 1).await;

        let threads: Vec<_> = (0..2u8)
            .map(|id| {
                let urc = h.urc.clone();
                std::thread::spawn(move || {
                    for i in 0..5 {
                        let _ = urc.send(&format!("+T{id}: {i}\r\n"));
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(h.mux.flush_urc().await, 10);
        let mut next = [0u32; 2];
        for _ in 0..10 {
            let frame = h.peer.next_frame().await;
            let text = String::from_utf8(frame.info).unwrap();
            let id: usize = text[2..3].parse().unwrap();
            let seq: u32 = text[5..6].parse().unwrap();
            assert_eq!(seq, next[id]);
            next[id] += 1;
        }
    }

    #[tokio::test]
    async fn test_full_urc_buffer_rejects_message() {
        let h = setup(MultiplexerConfig::default(), 1);
        let big = vec![b'x'; 300];
        assert!(matches!(
            h.mux.write_urc(AT_CHANNEL, &big),
            Err(sm_pipe::UrcError::BufferFull { requested: 300, .. })
        ));
    }
}
