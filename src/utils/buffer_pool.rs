//! # Buffer Pool
//!
//! Scratch buffers for packet decoding, recycled between reads to keep the
//! allocator out of the receive hot path.
//!
//! A [`PooledBuffer`] is only ever lent out for the duration of one decode. Callers
//! copy what they need out of it before it drops back into the pool, so recycled
//! storage is never visible outside the decoding function.
//!
//! ## Usage
//! ```rust
//! use framenet::utils::buffer_pool::BufferPool;
//!
//! let pool = BufferPool::new(4, 64 * 1024);
//! let mut scratch = pool.acquire(128);
//! scratch[0] = 1;
//! let owned = scratch.to_vec();
//! drop(scratch); // back into the pool
//! assert_eq!(owned.len(), 128);
//! assert_eq!(pool.available(), 4);
//! ```

use std::sync::{Arc, Mutex};

/// Initial capacity of pre-allocated buffers
const DEFAULT_BUFFER_CAPACITY: usize = 4096;

/// Scratch space lent out by a [`BufferPool`]; goes back on drop
pub struct PooledBuffer {
    buffer: Vec<u8>,
    free: Arc<Mutex<Vec<Vec<u8>>>>,
    max_retained: usize,
    max_idle: usize,
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        // Oversized buffers, and any beyond the pool size, go back to the allocator
        if self.buffer.capacity() <= self.max_retained {
            self.buffer.clear();
            if let Ok(mut free) = self.free.lock() {
                if free.len() < self.max_idle {
                    free.push(std::mem::take(&mut self.buffer));
                }
            }
        }
    }
}

impl std::ops::Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buffer
    }
}

/// Shared free list of decode buffers; clones share the same list
#[derive(Clone)]
pub struct BufferPool {
    free: Arc<Mutex<Vec<Vec<u8>>>>,
    max_retained: usize,
    max_idle: usize,
}

impl BufferPool {
    /// Create a pool with `pool_size` pre-allocated buffers. At most `pool_size`
    /// buffers are kept idle; extra ones lent during a burst are freed on return, as
    /// are buffers that grew past `max_retained` bytes of capacity.
    pub fn new(pool_size: usize, max_retained: usize) -> Self {
        let initial = DEFAULT_BUFFER_CAPACITY.min(max_retained);
        let free = (0..pool_size)
            .map(|_| Vec::with_capacity(initial))
            .collect::<Vec<_>>();

        Self {
            free: Arc::new(Mutex::new(free)),
            max_retained,
            max_idle: pool_size,
        }
    }

    /// Acquire a zero-filled buffer of exactly `len` bytes
    pub fn acquire(&self, len: usize) -> PooledBuffer {
        let mut buffer = self
            .free
            .lock()
            .ok()
            .and_then(|mut free| free.pop())
            .unwrap_or_default();
        buffer.resize(len, 0);

        PooledBuffer {
            buffer,
            free: self.free.clone(),
            max_retained: self.max_retained,
            max_idle: self.max_idle,
        }
    }

    /// Whether a buffer of `len` bytes would be recycled after use
    pub fn retains(&self, len: usize) -> bool {
        len <= self.max_retained
    }

    /// Idle buffers ready to be lent
    pub fn available(&self) -> usize {
        self.free.lock().map(|free| free.len()).unwrap_or(0)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(32, 64 * 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_return() {
        let pool = BufferPool::new(10, 1024);
        assert_eq!(pool.available(), 10);

        let mut buf = pool.acquire(8);
        assert_eq!(pool.available(), 9);
        assert_eq!(buf.len(), 8);

        buf[0] = 42;
        assert_eq!(buf[0], 42);

        drop(buf);
        assert_eq!(pool.available(), 10);
    }

    #[test]
    fn test_burst_does_not_grow_idle_list() {
        let pool = BufferPool::new(2, 1024);
        let burst: Vec<_> = (0..8).map(|_| pool.acquire(64)).collect();
        assert_eq!(pool.available(), 0);

        drop(burst);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_recycled_buffer_is_zeroed() {
        let pool = BufferPool::new(1, 1024);

        {
            let mut buf = pool.acquire(4);
            buf.copy_from_slice(b"test");
        }

        let buf = pool.acquire(4);
        assert_eq!(&buf[..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_exhausted_pool_allocates() {
        let pool = BufferPool::new(1, 1024);
        let _buf1 = pool.acquire(1);
        let _buf2 = pool.acquire(1); // fresh allocation
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_oversized_buffers_not_retained() {
        let pool = BufferPool::new(1, 16);
        assert!(pool.retains(16));
        assert!(!pool.retains(17));

        drop(pool.acquire(17));
        assert_eq!(pool.available(), 0);

        drop(pool.acquire(16));
        assert_eq!(pool.available(), 1);
    }
}
