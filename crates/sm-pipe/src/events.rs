//! Pipe events and edge-triggered delivery

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::lock;

/// Events raised by a pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeEvent {
    /// The pipe was opened
    Opened,
    /// The pipe closed and both directions are quiescent
    Closed,
    /// Received data is waiting
    ReceiveReady,
    /// Everything queued for transmission has been sent (or aborted)
    TransmitIdle,
}

/// Handler invoked for every pipe event
pub type PipeEventHandler = Arc<dyn Fn(PipeEvent) + Send + Sync>;

/// Handler slot plus arming state shared by pipe implementations
pub struct PipeEvents {
    handler: Mutex<Option<PipeEventHandler>>,
    receive_armed: AtomicBool,
    transmit_armed: AtomicBool,
}

impl PipeEvents {
    /// Create with `ReceiveReady` armed and `TransmitIdle` disarmed
    pub fn new() -> Self {
        Self {
            handler: Mutex::new(None),
            receive_armed: AtomicBool::new(true),
            transmit_armed: AtomicBool::new(false),
        }
    }

    /// Install the handler
    pub fn attach(&self, handler: PipeEventHandler) {
        *lock(&self.handler) = Some(handler);
    }

    /// Remove the handler
    pub fn release(&self) {
        *lock(&self.handler) = None;
    }

    /// Whether a handler is attached
    pub fn is_attached(&self) -> bool {
        lock(&self.handler).is_some()
    }

    /// Deliver an event unconditionally
    pub fn notify(&self, event: PipeEvent) {
        // Never call out with the slot locked; the handler may re-attach.
        let handler = lock(&self.handler).clone();
        if let Some(handler) = handler {
            handler(event);
        }
    }

    /// Raise `ReceiveReady` if armed
    pub fn receive_ready(&self) {
        if self.receive_armed.swap(false, Ordering::AcqRel) {
            self.notify(PipeEvent::ReceiveReady);
        }
    }

    /// Re-arm `ReceiveReady` after the receive queue was drained
    pub fn rearm_receive(&self) {
        self.receive_armed.store(true, Ordering::Release);
    }

    /// Arm `TransmitIdle` for the data just queued
    pub fn arm_transmit(&self) {
        self.transmit_armed.store(true, Ordering::Release);
    }

    /// Raise `TransmitIdle` if armed
    pub fn transmit_idle(&self) {
        if self.transmit_armed.swap(false, Ordering::AcqRel) {
            self.notify(PipeEvent::TransmitIdle);
        }
    }
}

impl Default for PipeEvents {
    fn default() -> Self {
        Self::new()
    }
}
