//! Unsolicited result code buffering
//!
//! URCs can be raised from any context, including ones that must never wait for
//! buffer space. They are appended whole to a shared record ring and delivered later
//! by the single worker, which is the only reader.
//!
//! Record layout: `[channel][len lo][len hi][payload]`. Channel [`AT_CHANNEL`] means
//! "whatever channel carries AT traffic at delivery time".
//!
//! Exactly one party formats and drains the ring at a time: the AT host while the link
//! is direct, the multiplexer while CMUX runs. Ownership is a compare-and-set tag.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::warn;

use crate::error::UrcError;
use crate::lock;
use crate::ring::ByteRing;

/// Channel tag addressing the current AT channel
pub const AT_CHANNEL: u8 = 0;

const HEADER_LEN: usize = 3;

/// Who currently drains the URC ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UrcOwner {
    /// Unclaimed
    None = 0,
    /// The AT host, writing straight to the physical pipe
    Host = 1,
    /// The multiplexer, writing to the AT channel
    Mux = 2,
}

impl UrcOwner {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => UrcOwner::Host,
            2 => UrcOwner::Mux,
            _ => UrcOwner::None,
        }
    }
}

/// One queued URC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrcRecord {
    /// Target channel, [`AT_CHANNEL`] for the current AT channel
    pub channel: u8,
    /// Message bytes
    pub data: Vec<u8>,
}

/// Shared URC record ring
pub struct UrcBuffer {
    ring: Mutex<ByteRing>,
    owner: AtomicU8,
    dropped: AtomicUsize,
}

impl UrcBuffer {
    /// Create a buffer holding `capacity` bytes of records (headers included)
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(ByteRing::new(capacity)),
            owner: AtomicU8::new(UrcOwner::None as u8),
            dropped: AtomicUsize::new(0),
        }
    }

    /// Append a message, or drop it whole when it does not fit
    ///
    /// Producers never need the owner tag: the ring lock keeps records whole, and the
    /// tag only decides who drains them. A URC raised during the hand-over to the
    /// multiplexer is queued and goes out with the next owner.
    pub fn push(&self, channel: u8, data: &[u8]) -> Result<(), UrcError> {
        let mut ring = lock(&self.ring);
        let needed = data.len() + HEADER_LEN;
        if data.len() > u16::MAX as usize || needed > ring.space() {
            let available = ring.space().saturating_sub(HEADER_LEN);
            drop(ring);
            let total = self.dropped.fetch_add(data.len(), Ordering::Relaxed) + data.len();
            warn!(
                dropped = data.len(),
                total_dropped = total,
                "URC buffer full, message dropped"
            );
            return Err(UrcError::BufferFull {
                requested: data.len(),
                available,
            });
        }

        let len = (data.len() as u16).to_le_bytes();
        ring.put(&[channel, len[0], len[1]]);
        ring.put(data);
        Ok(())
    }

    /// Copy out the oldest record without removing it
    pub fn front(&self) -> Option<UrcRecord> {
        let ring = lock(&self.ring);
        let mut header = [0u8; HEADER_LEN];
        if ring.peek(&mut header) < HEADER_LEN {
            return None;
        }
        let len = u16::from_le_bytes([header[1], header[2]]) as usize;
        let mut record = vec![0u8; HEADER_LEN + len];
        ring.peek(&mut record);
        Some(UrcRecord {
            channel: header[0],
            data: record.split_off(HEADER_LEN),
        })
    }

    /// Remove the oldest record
    pub fn pop_front(&self) {
        let mut ring = lock(&self.ring);
        let mut header = [0u8; HEADER_LEN];
        if ring.peek(&mut header) == HEADER_LEN {
            let len = u16::from_le_bytes([header[1], header[2]]) as usize;
            ring.finish(HEADER_LEN + len);
        }
    }

    /// Drop every queued record
    pub fn clear(&self) {
        lock(&self.ring).reset();
    }

    /// Whether no record is queued
    pub fn is_empty(&self) -> bool {
        lock(&self.ring).is_empty()
    }

    /// Total payload bytes dropped because the buffer was full
    pub fn dropped_bytes(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Record bytes dropped for another reason (e.g. target channel closed)
    pub fn count_dropped(&self, bytes: usize) {
        self.dropped.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Claim the ring for `owner`; succeeds if unclaimed or already held by `owner`
    pub fn acquire(&self, owner: UrcOwner) -> bool {
        match self.owner.compare_exchange(
            UrcOwner::None as u8,
            owner as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => true,
            Err(current) => current == owner as u8,
        }
    }

    /// Give up the claim; fails if `owner` does not hold it
    pub fn release(&self, owner: UrcOwner) -> bool {
        self.owner
            .compare_exchange(
                owner as u8,
                UrcOwner::None as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Current owner
    pub fn owner(&self) -> UrcOwner {
        UrcOwner::from_u8(self.owner.load(Ordering::Acquire))
    }
}

/// Cloneable, `Send` handle for raising URCs from any context
#[derive(Clone)]
pub struct UrcSender {
    buffer: Arc<UrcBuffer>,
    wake: Arc<Notify>,
}

impl UrcSender {
    /// Create a sender; `wake` is notified after every successful push
    pub fn new(buffer: Arc<UrcBuffer>, wake: Arc<Notify>) -> Self {
        Self { buffer, wake }
    }

    /// Queue a URC for the AT channel
    pub fn send(&self, text: &str) -> Result<(), UrcError> {
        self.send_to(AT_CHANNEL, text.as_bytes())
    }

    /// Queue a URC for a specific channel
    pub fn send_to(&self, channel: u8, data: &[u8]) -> Result<(), UrcError> {
        self.buffer.push(channel, data)?;
        self.wake.notify_one();
        Ok(())
    }

    /// The underlying buffer
    pub fn buffer(&self) -> &Arc<UrcBuffer> {
        &self.buffer
    }

    /// The wake-up signal
    pub fn wake(&self) -> &Arc<Notify> {
        &self.wake
    }
}
