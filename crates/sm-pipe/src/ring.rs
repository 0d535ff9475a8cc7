//! Byte ring buffer
//!
//! Used for the UART transmit buffer, the raw data-mode buffer and the multiplexer's
//! transmit staging area. Callers wrap it in a mutex; the ring itself is plain data.

use std::collections::VecDeque;

/// Bounded FIFO of bytes
#[derive(Debug, Clone)]
pub struct ByteRing {
    buf: VecDeque<u8>,
    capacity: usize,
}

impl ByteRing {
    /// Create an empty ring holding at most `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append as much of `data` as fits, returning the number of bytes stored
    pub fn put(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.space());
        self.buf.extend(&data[..n]);
        n
    }

    /// Append all of `data`, or nothing if it does not fit
    pub fn put_all(&mut self, data: &[u8]) -> bool {
        if data.len() > self.space() {
            return false;
        }
        self.buf.extend(data);
        true
    }

    /// Longest contiguous run of buffered bytes, capped at `max`
    pub fn claim(&self, max: usize) -> &[u8] {
        let (front, _) = self.buf.as_slices();
        &front[..front.len().min(max)]
    }

    /// Copy buffered bytes into `out` without consuming them
    pub fn peek(&self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.buf.len());
        for (dst, src) in out.iter_mut().zip(self.buf.iter()) {
            *dst = *src;
        }
        n
    }

    /// Consume `n` bytes from the front
    pub fn finish(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        self.buf.drain(..n);
    }

    /// Remove and return up to `max` bytes from the front
    pub fn take(&mut self, max: usize) -> Vec<u8> {
        let n = max.min(self.buf.len());
        self.buf.drain(..n).collect()
    }

    /// Free space in bytes
    pub fn space(&self) -> usize {
        self.capacity - self.buf.len()
    }

    /// Buffered bytes
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Whether no more bytes fit
    pub fn is_full(&self) -> bool {
        self.buf.len() >= self.capacity
    }

    /// Maximum number of buffered bytes
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop everything buffered
    pub fn reset(&mut self) {
        self.buf.clear();
    }
}
