//! Reusable byte-buffer pool
//!
//! Splicing a rendered page allocates a working buffer roughly the size of
//! the shell plus the fragment; the pool recycles those buffers across
//! requests on the hot render path.

use parking_lot::Mutex;

/// Thread-safe pool of growable byte buffers.
#[derive(Debug)]
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    max_pooled: usize,
}

impl BufferPool {
    /// Creates a pool retaining at most `max_pooled` idle buffers.
    pub fn new(max_pooled: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
            max_pooled,
        }
    }

    /// Returns an empty buffer, reusing a pooled allocation when available.
    pub fn get(&self) -> Vec<u8> {
        self.buffers.lock().pop().unwrap_or_default()
    }

    /// Returns `buf` to the pool. The buffer is cleared first; excess
    /// buffers beyond the retention cap are dropped.
    pub fn put(&self, mut buf: Vec<u8>) {
        buf.clear();
        let mut buffers = self.buffers.lock();
        if buffers.len() < self.max_pooled {
            buffers.push(buf);
        }
    }

    /// Number of idle buffers currently held.
    pub fn idle(&self) -> usize {
        self.buffers.lock().len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_empty_buffer() {
        let pool = BufferPool::new(4);
        let mut buf = pool.get();
        buf.extend_from_slice(b"hello");
        pool.put(buf);

        let reused = pool.get();
        assert!(reused.is_empty());
        assert!(reused.capacity() >= 5);
    }

    #[test]
    fn retention_cap_drops_excess() {
        let pool = BufferPool::new(1);
        pool.put(Vec::with_capacity(8));
        pool.put(Vec::with_capacity(8));
        assert_eq!(pool.idle(), 1);
    }
}
