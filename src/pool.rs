// ABOUTME: Ref-counted buffer leasing backing every frame payload (C1)
// ABOUTME: Scratch buffers recycle through a free list; leases track a separate atomic refcount

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};

/// Pool of reusable scratch buffers for outbound payload assembly, plus the
/// factory for [`Lease`] handles wrapping completed payloads.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    free: Mutex<Vec<BytesMut>>,
    default_capacity: usize,
    outstanding: AtomicUsize,
}

impl BufferPool {
    pub fn new(default_capacity: usize) -> Self {
        BufferPool {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::new()),
                default_capacity,
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    /// Number of leases currently live (not yet disposed to zero refcount).
    /// Exposed for tests verifying no leaked leases at connection teardown.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    /// Acquire a writable scratch buffer sized for at least `size_hint`
    /// bytes, reusing a freed buffer when one is large enough.
    pub fn acquire(&self, size_hint: usize) -> BytesMut {
        let mut free = self.inner.free.lock().unwrap();
        if let Some(pos) = free.iter().position(|b| b.capacity() >= size_hint) {
            let mut buf = free.swap_remove(pos);
            buf.clear();
            return buf;
        }
        drop(free);
        BytesMut::with_capacity(size_hint.max(self.inner.default_capacity))
    }

    /// Return a scratch buffer to the free list once its lease work is done
    /// (used by the frame builder between frames; not used once a buffer has
    /// been frozen into a [`Lease`]).
    pub fn release_scratch(&self, mut buf: BytesMut) {
        buf.clear();
        self.inner.free.lock().unwrap().push(buf);
    }

    /// Freeze a filled buffer into a ref-counted [`Lease`] with an initial
    /// refcount of 1.
    pub fn lease(&self, payload: BytesMut) -> Lease {
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        Lease {
            bytes: payload.freeze(),
            shared: Arc::new(Shared {
                refcount: AtomicUsize::new(1),
                pinned: AtomicUsize::new(0),
                pool: self.clone(),
            }),
        }
    }

    fn on_last_dispose(&self) {
        self.inner.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

struct Shared {
    refcount: AtomicUsize,
    pinned: AtomicUsize,
    pool: BufferPool,
}

/// An outstanding reference to a pooled buffer (§4.1 "Lease").
///
/// `preserve` increments the refcount and returns a second handle sharing
/// the same backing bytes; `dispose` decrements it and, at zero, notifies
/// the pool. Every live `Frame` holds exactly one `Lease`; forwarding a
/// frame without copying means cloning its lease via `preserve` and
/// disposing the original.
pub struct Lease {
    bytes: Bytes,
    shared: Arc<Shared>,
}

impl Lease {
    pub fn memory(&self) -> &[u8] {
        &self.bytes
    }

    pub fn bytes(&self) -> Bytes {
        self.bytes.clone()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Increment the refcount and return a new handle to the same buffer.
    pub fn preserve(&self) -> Lease {
        self.shared.refcount.fetch_add(1, Ordering::AcqRel);
        Lease {
            bytes: self.bytes.clone(),
            shared: self.shared.clone(),
        }
    }

    /// Decrement the refcount; at zero, the buffer is considered returned.
    pub fn dispose(self) {
        let prev = self.shared.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev >= 1, "lease disposed more times than it was preserved");
        if prev == 1 {
            self.shared.pool.on_last_dispose();
        }
    }

    /// Pinning is a separate ref dimension from `preserve`/`dispose`, for
    /// interop with native I/O APIs that need the memory to stay put for the
    /// duration of a syscall.
    pub fn pin(&self) {
        self.shared.pinned.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unpin(&self) {
        let prev = self.shared.pinned.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev >= 1, "lease unpinned more times than it was pinned");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserve_then_dispose_leaves_outstanding_unchanged() {
        let pool = BufferPool::new(64);
        let mut buf = pool.acquire(4);
        buf.extend_from_slice(b"abcd");
        let lease = pool.lease(buf);
        assert_eq!(pool.outstanding(), 1);

        let forwarded = lease.preserve();
        assert_eq!(forwarded.memory(), b"abcd");

        lease.dispose();
        assert_eq!(pool.outstanding(), 1, "second handle still live");

        forwarded.dispose();
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn scratch_buffer_is_reused_after_release() {
        let pool = BufferPool::new(64);
        let buf = pool.acquire(32);
        let ptr = buf.as_ptr();
        pool.release_scratch(buf);
        let buf2 = pool.acquire(16);
        assert_eq!(buf2.as_ptr(), ptr, "expected the freed buffer to be reused");
    }

    #[test]
    #[should_panic(expected = "disposed more times")]
    fn double_dispose_panics_in_debug() {
        let pool = BufferPool::new(16);
        let lease = pool.lease(pool.acquire(4));
        let clone = Lease {
            bytes: lease.bytes.clone(),
            shared: lease.shared.clone(),
        };
        lease.dispose();
        clone.dispose();
    }
}
