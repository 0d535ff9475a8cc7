//! Serial Modem AT Host
//!
//! The command/data-mode engine that sits between the serial link and the AT engine,
//! plus the worker that drives it.
//!
//! # Architecture
//!
//! - [`AtHost`] is a synchronous state machine. It is fed received bytes, decides per
//!   byte whether they are command text, payload or noise, and records what has to go
//!   out as [`HostEvent`]s.
//! - [`run_host_worker`] is the single serialized context. It reads the AT link (the
//!   physical pipe, or the AT channel of the multiplexer once `AT#XCMUX` started it),
//!   feeds the host and carries out its events with blocking writes.
//! - [`HostHandle`] is how everything else talks to the worker: URCs, jobs that need
//!   the [`HostContext`], and channel reservation for PPP-style consumers.
//!
//! The AT engine itself is not part of this crate. Anything implementing [`AtEngine`]
//! can be plugged in.

pub mod accumulator;
mod commands;
pub mod config;
pub mod datamode;
pub mod engine;
pub mod error;
pub mod events;
pub mod host;
pub mod mode;
pub mod worker;

pub use config::HostConfig;
pub use datamode::{DataModeFlags, DataModeHandler};
pub use engine::{AtEngine, AtReply, HostContext};
pub use error::{EngineError, HostError, ModeError};
pub use events::{HostEvent, LinkRequest};
pub use host::AtHost;
pub use mode::{OperationMode, Transition};
pub use worker::{run_host_worker, spawn_host_worker, HostCommand, HostHandle, HostJob};
