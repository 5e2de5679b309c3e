//! Scratch buffers for TX packet gather.
//!
//! A TX kick concatenates a descriptor chain into one contiguous packet.
//! Those buffers churn at packet rate, so freed ones are kept on a free
//! list instead of going back to the allocator. Buffers above the retain
//! cap are allocated fresh and dropped on release rather than pinned in
//! the pool.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

/// Largest buffer the pool will keep around (256 KiB).
pub const TX_POOL_MAX: usize = 256 * 1024;

/// Thread-safe free list of TX gather buffers.
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    retain_cap: usize,
}

impl BufferPool {
    pub fn new(retain_cap: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::new()),
            retain_cap,
        })
    }

    /// Take a buffer sized to `len`, reusing a pooled one when possible.
    /// Ownership moves through [`TxPacket`]; dropping it returns the buffer
    /// here.
    pub fn take(self: &Arc<Self>, len: usize) -> TxPacket {
        let mut buf = self.free.lock().unwrap().pop().unwrap_or_default();
        buf.clear();
        buf.resize(len, 0);
        TxPacket {
            buf,
            pool: self.clone(),
        }
    }

    fn put(&self, mut buf: Vec<u8>) {
        if buf.capacity() <= self.retain_cap {
            buf.clear();
            self.free.lock().unwrap().push(buf);
        }
    }

    /// Number of buffers currently on the free list.
    pub fn free_count(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

/// One outbound packet, backed by a pooled buffer.
///
/// Ownership moves to the backend with the `handle_tx` call; releasing is
/// dropping (or the explicit [`release`](TxPacket::release), for backends
/// that want to name the point of hand-back). Either way the buffer returns
/// to its pool exactly once; the move makes a double release unrepresentable.
pub struct TxPacket {
    buf: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl TxPacket {
    /// Return the buffer to the pool.
    pub fn release(self) {}

    pub(crate) fn buf_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Deref for TxPacket {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for TxPacket {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for TxPacket {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.buf));
    }
}
