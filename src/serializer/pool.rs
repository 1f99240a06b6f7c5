//! Pooled atom buffers
//!
//! Serialization happens once per request, so buffers are recycled instead
//! of being allocated for every call.

use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;

use super::AtomSource;

/// Bounded pool of reusable byte buffers
pub struct BufferPool {
    buffers: Mutex<Vec<BytesMut>>,
    max_pooled: usize,
    buffer_capacity: usize,
}

impl BufferPool {
    /// Default number of idle buffers retained
    pub const DEFAULT_MAX_POOLED: usize = 256;

    /// Default capacity of a freshly allocated buffer
    pub const DEFAULT_BUFFER_CAPACITY: usize = 256;

    /// Create a pool retaining at most `max_pooled` idle buffers
    pub fn new(max_pooled: usize, buffer_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            buffers: Mutex::new(Vec::with_capacity(max_pooled)),
            max_pooled,
            buffer_capacity,
        })
    }

    /// Take a cleared buffer from the pool (or allocate one)
    pub fn acquire(self: &Arc<Self>) -> PooledAtom {
        let buffer = self
            .buffers
            .lock()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.buffer_capacity));

        PooledAtom {
            buffer,
            pool: Arc::clone(self),
        }
    }

    /// Number of idle buffers currently pooled
    pub fn idle(&self) -> usize {
        self.buffers.lock().len()
    }

    fn release(&self, mut buffer: BytesMut) {
        buffer.clear();
        let mut buffers = self.buffers.lock();
        if buffers.len() < self.max_pooled {
            buffers.push(buffer);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
            max_pooled: Self::DEFAULT_MAX_POOLED,
            buffer_capacity: Self::DEFAULT_BUFFER_CAPACITY,
        }
    }
}

/// Atom source backed by a pooled buffer; the buffer returns to its pool on drop
pub struct PooledAtom {
    buffer: BytesMut,
    pool: Arc<BufferPool>,
}

impl PooledAtom {
    /// Mutable access for serializers writing into the buffer
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl AtomSource for PooledAtom {
    fn atom(&self) -> &[u8] {
        &self.buffer
    }
}

impl Drop for PooledAtom {
    fn drop(&mut self) {
        let buffer = std::mem::take(&mut self.buffer);
        self.pool.release(buffer);
    }
}
