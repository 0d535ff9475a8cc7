//! Reference-counted receive buffer pool
//!
//! The UART reader fills fixed-size blocks and reports sub-ranges of the same block as
//! separate receive events before moving on to the next one. Each event holds its own
//! [`RxBlock`] handle; the block returns to the pool only when the last handle is
//! dropped. Counts are atomic so handles can be cloned and dropped from any context
//! without taking the pool lock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::lock;

struct Slot {
    refs: AtomicUsize,
    data: Mutex<Box<[u8]>>,
}

struct PoolInner {
    block_size: usize,
    slots: Vec<Slot>,
    free: Mutex<Vec<usize>>,
    released: Notify,
}

impl PoolInner {
    fn free_slot(&self, index: usize) {
        lock(&self.free).push(index);
        self.released.notify_one();
    }
}

/// A fixed-size slab of receive blocks
#[derive(Clone)]
pub struct RxBufferPool {
    inner: Arc<PoolInner>,
}

impl RxBufferPool {
    /// Create a pool of `count` blocks of `block_size` bytes
    pub fn new(block_size: usize, count: usize) -> Self {
        let slots = (0..count)
            .map(|_| Slot {
                refs: AtomicUsize::new(0),
                data: Mutex::new(vec![0u8; block_size].into_boxed_slice()),
            })
            .collect();
        // Reversed so that allocation order starts at block 0
        let free = (0..count).rev().collect();
        Self {
            inner: Arc::new(PoolInner {
                block_size,
                slots,
                free: Mutex::new(free),
                released: Notify::new(),
            }),
        }
    }

    /// Take a free block with a reference count of 1
    ///
    /// Returns `None` when every block is referenced.
    pub fn try_alloc(&self) -> Option<RxBlock> {
        let index = lock(&self.inner.free).pop()?;
        self.inner.slots[index].refs.store(1, Ordering::Release);
        Some(RxBlock {
            pool: self.inner.clone(),
            index,
        })
    }

    /// Number of free blocks
    pub fn available(&self) -> usize {
        lock(&self.inner.free).len()
    }

    /// Total number of blocks
    pub fn capacity(&self) -> usize {
        self.inner.slots.len()
    }

    /// Size of each block in bytes
    pub fn block_size(&self) -> usize {
        self.inner.block_size
    }

    /// Wait until a block has been returned to the pool
    ///
    /// A release that happened since the last wait completes this immediately.
    pub async fn released(&self) {
        self.inner.released.notified().await;
    }
}

/// Handle to one referenced block
///
/// Cloning adds a reference; dropping removes one and frees the block at zero.
pub struct RxBlock {
    pool: Arc<PoolInner>,
    index: usize,
}

impl RxBlock {
    fn slot(&self) -> &Slot {
        &self.pool.slots[self.index]
    }

    /// Block size in bytes
    pub fn capacity(&self) -> usize {
        self.pool.block_size
    }

    /// Current number of references
    pub fn ref_count(&self) -> usize {
        self.slot().refs.load(Ordering::Acquire)
    }

    /// Copy `data` into the block at `offset`, returning the number of bytes stored
    pub fn write(&self, offset: usize, data: &[u8]) -> usize {
        let mut buf = lock(&self.slot().data);
        let end = (offset + data.len()).min(buf.len());
        let n = end.saturating_sub(offset);
        buf[offset..offset + n].copy_from_slice(&data[..n]);
        n
    }

    /// Copy bytes starting at `offset` into `out`, returning the number copied
    pub fn read(&self, offset: usize, out: &mut [u8]) -> usize {
        let buf = lock(&self.slot().data);
        let end = (offset + out.len()).min(buf.len());
        let n = end.saturating_sub(offset);
        out[..n].copy_from_slice(&buf[offset..offset + n]);
        n
    }
}

impl Clone for RxBlock {
    fn clone(&self) -> Self {
        self.slot().refs.fetch_add(1, Ordering::AcqRel);
        Self {
            pool: self.pool.clone(),
            index: self.index,
        }
    }
}

impl Drop for RxBlock {
    fn drop(&mut self) {
        if self.slot().refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.pool.free_slot(self.index);
        }
    }
}

impl std::fmt::Debug for RxBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RxBlock")
            .field("index", &self.index)
            .field("refs", &self.ref_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_exhaustion_and_release() {
        let pool = RxBufferPool::new(16, 3);
        let mut blocks: Vec<_> = (0..3).map(|_| pool.try_alloc().unwrap()).collect();
        assert!(pool.try_alloc().is_none());
        assert_eq!(pool.available(), 0);

        blocks.pop();
        assert_eq!(pool.available(), 1);
        assert!(pool.try_alloc().is_some());
    }

    #[test]
    fn test_releasing_one_makes_exactly_one_available() {
        let pool = RxBufferPool::new(16, 2);
        let a = pool.try_alloc().unwrap();
        let _b = pool.try_alloc().unwrap();
        drop(a);
        let _c = pool.try_alloc().unwrap();
        assert!(pool.try_alloc().is_none());
    }

    #[test]
    fn test_block_freed_after_last_reference() {
        let pool = RxBufferPool::new(16, 1);
        let block = pool.try_alloc().unwrap();
        let second = block.clone();
        assert_eq!(block.ref_count(), 2);

        drop(block);
        assert_eq!(pool.available(), 0);
        assert_eq!(second.ref_count(), 1);

        drop(second);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_sub_ranges_share_a_block() {
        let pool = RxBufferPool::new(8, 1);
        let block = pool.try_alloc().unwrap();
        assert_eq!(block.write(0, b"AT"), 2);
        assert_eq!(block.write(2, b"+CGMR\r"), 6);
        assert_eq!(block.write(8, b"x"), 0);

        let first = block.clone();
        let second = block.clone();
        drop(block);

        let mut out = [0u8; 2];
        assert_eq!(first.read(0, &mut out), 2);
        assert_eq!(&out, b"AT");
        let mut out = [0u8; 16];
        assert_eq!(second.read(2, &mut out), 6);
        assert_eq!(&out[..6], b"+CGMR\r");
    }

    #[tokio::test]
    async fn test_released_wakes_waiter() {
        let pool = RxBufferPool::new(4, 1);
        let block = pool.try_alloc().unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.released().await;
                pool.try_alloc().is_some()
            })
        };
        drop(block);
        assert!(waiter.await.unwrap());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Alloc,
        Share(usize),
        Release(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Alloc),
            any::<usize>().prop_map(Op::Share),
            any::<usize>().prop_map(Op::Release),
        ]
    }

    proptest! {
        #[test]
        fn ref_counts_track_live_handles(ops in prop::collection::vec(op(), 0..200)) {
            let pool = RxBufferPool::new(8, 4);
            let mut handles: Vec<RxBlock> = Vec::new();
            for op in ops {
                match op {
                    Op::Alloc => {
                        if let Some(block) = pool.try_alloc() {
                            handles.push(block);
                        }
                    }
                    Op::Share(i) if !handles.is_empty() => {
                        let block = handles[i % handles.len()].clone();
                        handles.push(block);
                    }
                    Op::Release(i) if !handles.is_empty() => {
                        let i = i % handles.len();
                        handles.swap_remove(i);
                    }
                    _ => {}
                }

                let mut live: Vec<usize> = handles.iter().map(|h| h.index).collect();
                for handle in &handles {
                    let count = live.iter().filter(|&&i| i == handle.index).count();
                    prop_assert_eq!(handle.ref_count(), count);
                }
                live.sort_unstable();
                live.dedup();
                prop_assert_eq!(pool.available(), pool.capacity() - live.len());
            }
            drop(handles);
            prop_assert_eq!(pool.available(), pool.capacity());
        }
    }
}
