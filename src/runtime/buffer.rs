//! Shared buffer pool for I/O.
//!
//! Fixed-size slices are pre-carved from larger region allocations, so the
//! hot path recycles memory instead of hitting the allocator per request.
//! Acquire and release happen from I/O threads and task threads
//! concurrently, so the free list is a lock-free queue.
//!
//! Exhaustion never blocks and never fails: `acquire` falls back to a fresh
//! overflow allocation, and `release` of an overflow slice (or of any slice
//! once the free list is full) simply drops it.

use bytes::BytesMut;
use crossbeam_queue::ArrayQueue;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Number of slices carved out of one backing region.
const SLICES_PER_REGION: usize = 64;

/// Pool of fixed-size byte slices.
pub struct BufferPool {
    /// Lock-free LIFO-ish free list of recycled slices.
    free: ArrayQueue<BytesMut>,
    /// Size of every slice handed out.
    slice_size: usize,
    /// Slices currently leased out.
    leased: AtomicUsize,
    /// Allocations made because the free list was empty.
    overflow_allocs: AtomicUsize,
}

impl BufferPool {
    /// Create a pool of `count` slices of `slice_size` bytes each.
    ///
    /// Slices are split off shared regions of up to [`SLICES_PER_REGION`]
    /// slices, so `count` slices cost `count / SLICES_PER_REGION` backing
    /// allocations rather than `count`.
    pub fn new(count: usize, slice_size: usize) -> Self {
        assert!(slice_size > 0, "slice_size must be nonzero");
        assert!(count > 0, "count must be nonzero");

        let free = ArrayQueue::new(count);
        let mut remaining = count;
        while remaining > 0 {
            let in_region = remaining.min(SLICES_PER_REGION);
            let mut region = BytesMut::zeroed(in_region * slice_size);
            for _ in 0..in_region {
                let mut slice = region.split_to(slice_size);
                slice.clear();
                // Queue was sized for exactly `count` slices.
                let _ = free.push(slice);
            }
            remaining -= in_region;
        }

        Self {
            free,
            slice_size,
            leased: AtomicUsize::new(0),
            overflow_allocs: AtomicUsize::new(0),
        }
    }

    /// Lease a cleared slice with `slice_size` capacity.
    ///
    /// Falls back to allocating an overflow slice when the pool is empty.
    pub fn acquire(&self) -> BytesMut {
        self.leased.fetch_add(1, Ordering::Relaxed);
        match self.free.pop() {
            Some(buf) => buf,
            None => {
                self.overflow_allocs.fetch_add(1, Ordering::Relaxed);
                BytesMut::with_capacity(self.slice_size)
            }
        }
    }

    /// Return a leased slice to the pool.
    ///
    /// Slices that lost capacity (the caller split them) and slices
    /// arriving while the free list is full are dropped.
    pub fn release(&self, mut buf: BytesMut) {
        self.leased.fetch_sub(1, Ordering::Relaxed);
        if buf.capacity() < self.slice_size {
            return;
        }
        buf.clear();
        let _ = self.free.push(buf);
    }

    /// Size of each slice in bytes.
    pub fn slice_size(&self) -> usize {
        self.slice_size
    }

    /// Slices currently sitting in the free list.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Slices currently leased out.
    pub fn leased(&self) -> usize {
        self.leased.load(Ordering::Relaxed)
    }

    /// Allocations made beyond the preallocated regions.
    pub fn overflow_allocations(&self) -> usize {
        self.overflow_allocs.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_basic() {
        let pool = BufferPool::new(4, 1024);
        assert_eq!(pool.available(), 4);
        assert_eq!(pool.slice_size(), 1024);

        let b0 = pool.acquire();
        let b1 = pool.acquire();
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.leased(), 2);
        assert!(b0.is_empty());
        assert!(b0.capacity() >= 1024);

        pool.release(b0);
        pool.release(b1);
        assert_eq!(pool.available(), 4);
        assert_eq!(pool.leased(), 0);
    }

    #[test]
    fn test_no_backing_growth_across_cycles() {
        let pool = BufferPool::new(2, 256);

        for _ in 0..1000 {
            let mut buf = pool.acquire();
            buf.extend_from_slice(b"request bytes");
            pool.release(buf);
        }

        assert_eq!(pool.overflow_allocations(), 0);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_exhaustion_allocates_overflow() {
        let pool = BufferPool::new(1, 128);

        let held = pool.acquire();
        let overflow = pool.acquire();
        assert_eq!(pool.overflow_allocations(), 1);
        assert!(overflow.capacity() >= 128);

        // Releasing both: one refills the free list, the other is dropped
        // because the list is full again.
        pool.release(held);
        pool.release(overflow);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.leased(), 0);
    }

    #[test]
    fn test_grown_slice_not_recycled() {
        let pool = BufferPool::new(2, 64);

        let mut buf = pool.acquire();
        // Force a reallocation past the slice size.
        buf.extend_from_slice(&[0u8; 1024]);
        assert!(buf.capacity() > 64);
        pool.release(buf);

        // The grown slice re-enters the free list with its new allocation;
        // the next acquire hands out a cleared buffer either way.
        let next = pool.acquire();
        assert!(next.is_empty());
        assert!(next.capacity() >= 64);
    }

    #[test]
    fn test_concurrent_acquire_release() {
        use std::sync::Arc;

        let pool = Arc::new(BufferPool::new(8, 512));
        let mut handles = Vec::new();

        for _ in 0..4 {
            let pool = Arc::clone(&pool);
            handles.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    let mut buf = pool.acquire();
                    buf.extend_from_slice(b"payload");
                    pool.release(buf);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.leased(), 0);
    }
}
