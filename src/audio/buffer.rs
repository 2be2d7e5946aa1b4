//! Bounded byte ring buffer for audio handoff
//!
//! A fixed-capacity FIFO of raw bytes shared between one producer and one
//! consumer thread. `put` accepts at most the free capacity and never
//! blocks, so it is safe to call from the audio capture callback; `get`
//! returns what is available and never blocks. Callers that must move all
//! bytes loop over the partial counts (see the session backpressure loops).

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct Inner {
    buf: Box<[u8]>,
    /// Index of the oldest byte
    head: usize,
    /// Number of buffered bytes
    len: usize,
}

/// Fixed-capacity single-producer single-consumer byte FIFO
pub struct ByteRing {
    inner: Mutex<Inner>,
    capacity: usize,
    overflow_bytes: AtomicUsize,
    underrun_count: AtomicUsize,
}

impl ByteRing {
    /// Create a new ring with the specified capacity in bytes
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be non-zero");
        Self {
            inner: Mutex::new(Inner {
                buf: vec![0u8; capacity].into_boxed_slice(),
                head: 0,
                len: 0,
            }),
            capacity,
            overflow_bytes: AtomicUsize::new(0),
            underrun_count: AtomicUsize::new(0),
        }
    }

    /// Append bytes, returning how many were accepted.
    ///
    /// Bytes beyond the free capacity are not stored; the shortfall is
    /// added to the overflow counter and the caller must retry the
    /// remainder if it cannot afford to lose it.
    pub fn put(&self, data: &[u8]) -> usize {
        let mut inner = self.inner.lock();
        let free = self.capacity - inner.len;
        let n = data.len().min(free);
        if n < data.len() {
            self.overflow_bytes
                .fetch_add(data.len() - n, Ordering::Relaxed);
        }
        if n == 0 {
            return 0;
        }
        let tail = (inner.head + inner.len) % self.capacity;
        let first = n.min(self.capacity - tail);
        inner.buf[tail..tail + first].copy_from_slice(&data[..first]);
        if first < n {
            inner.buf[..n - first].copy_from_slice(&data[first..n]);
        }
        inner.len += n;
        n
    }

    /// Read up to `out.len()` bytes in FIFO order, returning the count.
    /// Returns 0 when the ring is empty.
    pub fn get(&self, out: &mut [u8]) -> usize {
        let mut inner = self.inner.lock();
        let n = out.len().min(inner.len);
        if n == 0 {
            if !out.is_empty() {
                self.underrun_count.fetch_add(1, Ordering::Relaxed);
            }
            return 0;
        }
        let head = inner.head;
        let first = n.min(self.capacity - head);
        out[..first].copy_from_slice(&inner.buf[head..head + first]);
        if first < n {
            out[first..n].copy_from_slice(&inner.buf[..n - first]);
        }
        inner.head = (head + n) % self.capacity;
        inner.len -= n;
        n
    }

    /// Discard all buffered bytes
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.head = 0;
        inner.len = 0;
    }

    /// Number of buffered bytes
    pub fn available_data(&self) -> usize {
        self.inner.lock().len
    }

    /// Free capacity in bytes
    pub fn available_space(&self) -> usize {
        self.capacity - self.inner.lock().len
    }

    /// Total capacity in bytes
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.available_data() == 0
    }

    /// Bytes rejected because the ring was full
    pub fn overflow_bytes(&self) -> usize {
        self.overflow_bytes.load(Ordering::Relaxed)
    }

    /// Reads that found the ring empty
    pub fn underrun_count(&self) -> usize {
        self.underrun_count.load(Ordering::Relaxed)
    }
}

/// Thread-safe handle to a byte ring
pub type SharedByteRing = Arc<ByteRing>;

/// Create a new shared byte ring
pub fn create_shared_ring(capacity: usize) -> SharedByteRing {
    Arc::new(ByteRing::new(capacity))
}
