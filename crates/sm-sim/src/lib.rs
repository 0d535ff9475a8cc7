//! Serial Modem Simulation Library
//!
//! Stands in for the modem side of the AT host so the host can run without cellular
//! hardware. It includes:
//!
//! - **SimModem**: an [`AtEngine`](sm_host::AtEngine) answering identification commands
//!   and opening loopback data mode sessions with `AT#XSEND`
//! - **RecordingHandler**: a data mode handler that records payload, flags and exits
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use sm_host::{AtHost, HostConfig, HostEvent};
//! use sm_pipe::{UrcBuffer, UrcSender};
//! use sm_sim::SimModem;
//! use tokio::sync::Notify;
//!
//! let urc = UrcSender::new(Arc::new(UrcBuffer::new(256)), Arc::new(Notify::new()));
//! let mut host = AtHost::new(HostConfig::default(), urc);
//! let mut modem = SimModem::default();
//!
//! host.receive(b"AT+CGMR\r", &mut modem);
//! for event in host.drain_events() {
//!     if let HostEvent::Transmit(bytes) = event {
//!         println!("Host output: {:?}", String::from_utf8_lossy(&bytes));
//!     }
//! }
//! ```

pub mod handler;
pub mod modem;

pub use handler::{Recording, RecordingHandler};
pub use modem::{LoopbackHandler, SimModem, SimModemConfig};
