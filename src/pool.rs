// src/pool.rs - Refcounted buffer pool
//
// Fixed-size buffers handed out as shared-ownership references. The pool
// grows on demand (doubling, capped at max_buffers) and shrinks
// opportunistically when the free list sits above the high watermark, no
// client is slow-flagged, and the pool expanded since the last shrink.
// A small control-class reservation keeps HTTP responses and SSE events
// deliverable when media traffic has drained the general pool.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

/// Buffer capacity: header + payload of one upstream datagram.
pub const BUFFER_SIZE: usize = 2048;

/// Media pool sizing.
pub const POOL_INITIAL_SIZE: usize = 1024;
pub const POOL_LOW_WATERMARK: usize = 256;
pub const POOL_HIGH_WATERMARK: usize = POOL_INITIAL_SIZE * 3;

/// Control-class reservation sizing.
pub const CONTROL_POOL_INITIAL_SIZE: usize = 256;
pub const CONTROL_POOL_MAX_BUFFERS: usize = 4096;
pub const CONTROL_POOL_LOW_WATERMARK: usize = 64;
pub const CONTROL_POOL_HIGH_WATERMARK: usize = CONTROL_POOL_INITIAL_SIZE * 2;

/// Bounded batch released per shrink pass.
const POOL_SHRINK_BATCH: usize = 256;

struct PoolCore {
    free: Vec<Box<[u8]>>,
    num_buffers: usize,
    initial_buffers: usize,
    max_buffers: usize,
    low_watermark: usize,
    high_watermark: usize,
    expansions: u64,
    exhaustions: u64,
    shrinks: u64,
    expanded_since_shrink: bool,
    label: &'static str,
}

impl PoolCore {
    fn expand(&mut self) -> bool {
        if self.num_buffers >= self.max_buffers {
            return false;
        }
        // Double, capped at max_buffers.
        let grow = self
            .num_buffers
            .max(1)
            .min(self.max_buffers - self.num_buffers);
        for _ in 0..grow {
            self.free.push(vec![0u8; BUFFER_SIZE].into_boxed_slice());
        }
        self.num_buffers += grow;
        self.expansions += 1;
        self.expanded_since_shrink = true;
        log::debug!(
            "{} pool expanded by {} to {} buffers",
            self.label,
            grow,
            self.num_buffers
        );
        true
    }
}

/// Counters snapshot for status reporting.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub num_buffers: usize,
    pub num_free: usize,
    pub max_buffers: usize,
    pub expansions: u64,
    pub exhaustions: u64,
    pub shrinks: u64,
}

/// One buffer pool. Cloning the handle shares the pool.
#[derive(Clone)]
pub struct Pool {
    core: Rc<RefCell<PoolCore>>,
}

impl Pool {
    pub fn new(
        label: &'static str,
        initial: usize,
        max: usize,
        low_watermark: usize,
        high_watermark: usize,
    ) -> Self {
        let mut core = PoolCore {
            free: Vec::with_capacity(initial),
            num_buffers: 0,
            initial_buffers: initial,
            max_buffers: max.max(initial),
            low_watermark,
            high_watermark,
            expansions: 0,
            exhaustions: 0,
            shrinks: 0,
            expanded_since_shrink: false,
            label,
        };
        for _ in 0..initial {
            core.free.push(vec![0u8; BUFFER_SIZE].into_boxed_slice());
        }
        core.num_buffers = initial;
        Pool {
            core: Rc::new(RefCell::new(core)),
        }
    }

    /// Obtain a buffer with refcount 1 and data size 0, growing the pool if
    /// needed. Returns `None` only when the pool sits at `max_buffers` with
    /// every buffer in flight.
    pub fn alloc(&self) -> Option<BufRef> {
        let storage = {
            let mut core = self.core.borrow_mut();
            if core.free.is_empty() && !core.expand() {
                core.exhaustions += 1;
                return None;
            }
            match core.free.pop() {
                Some(storage) => storage,
                None => return None,
            }
        };
        Some(BufRef {
            inner: Rc::new(BufInner {
                storage: RefCell::new(storage),
                len: Cell::new(0),
                offset: Cell::new(0),
                rtp_seq: Cell::new(None),
                home: Rc::downgrade(&self.core),
            }),
        })
    }

    /// Release a bounded batch of free buffers back to the allocator.
    /// Never reduces below the initial size; a no-op unless the pool
    /// expanded since the last shrink and the free list exceeds the high
    /// watermark.
    pub fn try_shrink(&self) {
        let mut core = self.core.borrow_mut();
        if !core.expanded_since_shrink
            || core.free.len() <= core.high_watermark
            || core.num_buffers <= core.initial_buffers
        {
            return;
        }
        let above_initial = core.num_buffers - core.initial_buffers;
        let above_watermark = core.free.len() - core.high_watermark;
        let release = POOL_SHRINK_BATCH.min(above_initial).min(above_watermark);
        for _ in 0..release {
            core.free.pop();
        }
        core.num_buffers -= release;
        core.shrinks += 1;
        core.expanded_since_shrink = false;
        log::debug!(
            "{} pool shrank by {} to {} buffers",
            core.label,
            release,
            core.num_buffers
        );
    }

    pub fn stats(&self) -> PoolStats {
        let core = self.core.borrow();
        PoolStats {
            num_buffers: core.num_buffers,
            num_free: core.free.len(),
            max_buffers: core.max_buffers,
            expansions: core.expansions,
            exhaustions: core.exhaustions,
            shrinks: core.shrinks,
        }
    }

    pub fn num_buffers(&self) -> usize {
        self.core.borrow().num_buffers
    }

    pub fn num_free(&self) -> usize {
        self.core.borrow().free.len()
    }

    pub fn max_buffers(&self) -> usize {
        self.core.borrow().max_buffers
    }

    pub fn low_watermark(&self) -> usize {
        self.core.borrow().low_watermark
    }
}

struct BufInner {
    storage: RefCell<Box<[u8]>>,
    len: Cell<usize>,
    offset: Cell<usize>,
    rtp_seq: Cell<Option<u16>>,
    home: Weak<RefCell<PoolCore>>,
}

impl Drop for BufInner {
    fn drop(&mut self) {
        // Last reference gone: hand the storage back to the owning pool's
        // free list. If the pool itself is gone the storage just drops.
        if let Some(core) = self.home.upgrade() {
            let storage = std::mem::replace(
                &mut *self.storage.borrow_mut(),
                Vec::new().into_boxed_slice(),
            );
            core.borrow_mut().free.push(storage);
        }
    }
}

/// Shared-ownership buffer handle. Every queue or transient holder keeps one
/// clone; when the last clone drops the buffer returns to its pool.
#[derive(Clone)]
pub struct BufRef {
    inner: Rc<BufInner>,
}

impl BufRef {
    pub fn capacity(&self) -> usize {
        BUFFER_SIZE
    }

    /// Bytes of valid data starting at `offset`.
    pub fn len(&self) -> usize {
        self.inner.len.get()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_len(&self, len: usize) {
        debug_assert!(self.inner.offset.get() + len <= BUFFER_SIZE);
        self.inner.len.set(len);
    }

    /// Offset of the data start within the storage. Advancing it past a
    /// header is how zero-copy payload stripping works.
    pub fn offset(&self) -> usize {
        self.inner.offset.get()
    }

    pub fn set_offset(&self, offset: usize) {
        debug_assert!(offset <= BUFFER_SIZE);
        self.inner.offset.set(offset);
    }

    /// Cached RTP sequence number, set by the receive path when the
    /// datagram parsed as RTP.
    pub fn rtp_seq(&self) -> Option<u16> {
        self.inner.rtp_seq.get()
    }

    pub fn set_rtp_seq(&self, seq: Option<u16>) {
        self.inner.rtp_seq.set(seq);
    }

    pub fn refcount(&self) -> usize {
        Rc::strong_count(&self.inner)
    }

    /// Copy `data` to the start of the buffer and make it the valid region.
    pub fn fill(&self, data: &[u8]) {
        debug_assert!(data.len() <= BUFFER_SIZE);
        self.inner.storage.borrow_mut()[..data.len()].copy_from_slice(data);
        self.inner.offset.set(0);
        self.inner.len.set(data.len());
    }

    /// Run `f` over the valid data region (`offset .. offset + len`).
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let storage = self.inner.storage.borrow();
        let off = self.inner.offset.get();
        let len = self.inner.len.get();
        f(&storage[off..off + len])
    }

    /// Run `f` over the whole storage, e.g. as a receive target. The caller
    /// sets len/offset afterwards.
    pub fn with_storage_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut storage = self.inner.storage.borrow_mut();
        f(&mut storage)
    }

    /// Borrow the raw storage for scatter-gather assembly. The guard must be
    /// held for as long as any pointer derived from it is in use.
    pub(crate) fn borrow_storage(&self) -> std::cell::Ref<'_, Box<[u8]>> {
        self.inner.storage.borrow()
    }
}

/// Per-worker pool set plus the streaming-client census the queue-limit
/// controller divides the pool by.
pub struct Pools {
    pub media: Pool,
    pub control: Pool,
    active_streams: Cell<usize>,
    slow_clients: Cell<usize>,
}

pub type PoolsRef = Rc<Pools>;

impl Pools {
    pub fn new(media_max_buffers: usize) -> PoolsRef {
        Rc::new(Pools {
            media: Pool::new(
                "media",
                POOL_INITIAL_SIZE,
                media_max_buffers,
                POOL_LOW_WATERMARK,
                POOL_HIGH_WATERMARK,
            ),
            control: Pool::new(
                "control",
                CONTROL_POOL_INITIAL_SIZE,
                CONTROL_POOL_MAX_BUFFERS,
                CONTROL_POOL_LOW_WATERMARK,
                CONTROL_POOL_HIGH_WATERMARK,
            ),
            active_streams: Cell::new(0),
            slow_clients: Cell::new(0),
        })
    }

    /// Media ingestion always draws from the general pool.
    pub fn alloc_media(&self) -> Option<BufRef> {
        self.media.alloc()
    }

    /// Control plane draws from the reservation first so status responses
    /// survive media pressure, falling back to the general pool.
    pub fn alloc_control(&self) -> Option<BufRef> {
        self.control.alloc().or_else(|| self.media.alloc())
    }

    pub fn register_stream_client(&self) {
        self.active_streams.set(self.active_streams.get() + 1);
    }

    pub fn unregister_stream_client(&self) {
        let n = self.active_streams.get();
        if n > 0 {
            self.active_streams.set(n - 1);
        }
    }

    pub fn active_streams(&self) -> usize {
        self.active_streams.get()
    }

    pub fn note_slow_entered(&self) {
        self.slow_clients.set(self.slow_clients.get() + 1);
    }

    pub fn note_slow_exited(&self) {
        let n = self.slow_clients.get();
        if n > 0 {
            self.slow_clients.set(n - 1);
        }
    }

    pub fn any_slow_client(&self) -> bool {
        self.slow_clients.get() > 0
    }

    /// Opportunistic shrink, invoked on connection close.
    pub fn try_shrink(&self) {
        if self.any_slow_client() {
            return;
        }
        self.media.try_shrink();
        self.control.try_shrink();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool(initial: usize, max: usize) -> Pool {
        Pool::new("test", initial, max, 2, initial * 3)
    }

    #[test]
    fn test_alloc_release_roundtrip() {
        let pool = small_pool(4, 8);
        assert_eq!(pool.num_free(), 4);

        let buf = pool.alloc().expect("alloc");
        assert_eq!(buf.refcount(), 1);
        assert_eq!(buf.len(), 0);
        assert_eq!(pool.num_free(), 3);

        drop(buf);
        assert_eq!(pool.num_free(), 4);

        // Fresh allocation after a release starts clean again.
        let buf = pool.alloc().expect("alloc");
        assert_eq!(buf.refcount(), 1);
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.offset(), 0);
    }

    #[test]
    fn test_clone_holds_buffer_out_of_pool() {
        let pool = small_pool(2, 2);
        let buf = pool.alloc().expect("alloc");
        let held = buf.clone();
        assert_eq!(buf.refcount(), 2);
        drop(buf);
        // One holder remains; storage must not be back in the free list.
        assert_eq!(pool.num_free(), 1);
        drop(held);
        assert_eq!(pool.num_free(), 2);
    }

    #[test]
    fn test_grows_by_doubling_up_to_max() {
        let pool = small_pool(2, 5);
        let a = pool.alloc().expect("alloc");
        let b = pool.alloc().expect("alloc");
        assert_eq!(pool.num_buffers(), 2);

        // Free list empty: next alloc doubles (2 -> 4).
        let c = pool.alloc().expect("alloc");
        assert_eq!(pool.num_buffers(), 4);
        let d = pool.alloc().expect("alloc");

        // 4 -> 5 (capped at max).
        let e = pool.alloc().expect("alloc");
        assert_eq!(pool.num_buffers(), 5);

        // At max with nothing free: allocation fails gracefully.
        assert!(pool.alloc().is_none());
        assert_eq!(pool.stats().exhaustions, 1);

        drop((a, b, c, d, e));
        assert_eq!(pool.num_free(), 5);
    }

    #[test]
    fn test_shrink_requires_growth_and_headroom() {
        let pool = small_pool(2, 64);
        // Not grown yet: shrink is a no-op.
        pool.try_shrink();
        assert_eq!(pool.num_buffers(), 2);

        // Force growth well past the high watermark (2 * 3 = 6).
        let held: Vec<_> = (0..32).map(|_| pool.alloc().expect("alloc")).collect();
        let grown = pool.num_buffers();
        assert!(grown > 6);
        drop(held);

        pool.try_shrink();
        assert!(pool.num_buffers() < grown);
        assert!(pool.num_buffers() >= 2);
        assert_eq!(pool.stats().shrinks, 1);

        // Second pass without new growth does nothing.
        let after = pool.num_buffers();
        pool.try_shrink();
        assert_eq!(pool.num_buffers(), after);
    }

    #[test]
    fn test_quiescent_pool_fully_free() {
        let pool = small_pool(8, 16);
        {
            let bufs: Vec<_> = (0..12).map(|_| pool.alloc().expect("alloc")).collect();
            for b in &bufs {
                b.fill(b"data");
            }
        }
        // Every buffer acquired was returned.
        assert_eq!(pool.num_free(), pool.num_buffers());
    }

    #[test]
    fn test_control_alloc_falls_back_to_media() {
        let pools = Pools::new(64);
        // Drain the control reservation completely.
        let mut held = Vec::new();
        while let Some(b) = pools.control.alloc() {
            held.push(b);
        }
        // Fallback still yields a buffer (from the media pool).
        let media_free_before = pools.media.num_free();
        let buf = pools.alloc_control().expect("fallback alloc");
        assert_eq!(pools.media.num_free(), media_free_before - 1);
        drop(buf);
        drop(held);
    }

    #[test]
    fn test_payload_offset_view() {
        let pool = small_pool(1, 1);
        let buf = pool.alloc().expect("alloc");
        buf.fill(b"HDRpayload");
        buf.set_offset(3);
        buf.set_len(7);
        buf.with_data(|d| assert_eq!(d, b"payload"));
    }

    #[test]
    fn test_stream_client_census() {
        let pools = Pools::new(64);
        assert_eq!(pools.active_streams(), 0);
        pools.register_stream_client();
        pools.register_stream_client();
        assert_eq!(pools.active_streams(), 2);
        pools.unregister_stream_client();
        pools.unregister_stream_client();
        pools.unregister_stream_client();
        assert_eq!(pools.active_streams(), 0);
    }
}
