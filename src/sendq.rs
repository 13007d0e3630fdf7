// src/sendq.rs - Zero-copy send queue
//
// Two ordered lists per connection: *ready* (buffers and file slices waiting
// to be handed to the kernel) and *pending* (buffers passed via MSG_ZEROCOPY,
// awaiting completion notifications from the socket error queue). A
// connection may not be freed until both are empty.
//
// Batching: data sits in *ready* until the queue holds enough entries or
// bytes, or the oldest entry has aged past the flush deadline; only then does
// the connection request writability.

use crate::pool::BufRef;
use std::collections::VecDeque;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, RawFd};

/// Maximum iovec entries per sendmsg().
pub const MAX_IOVECS: usize = 64;
/// Flush once this many bytes have accumulated.
pub const BATCH_BYTES: usize = 65536;
/// Flush once this many entries have accumulated.
pub const BATCH_PACKETS: usize = 64;
/// Flush once the oldest queued entry is this old.
pub const FLUSH_DEADLINE_MS: i64 = 100;

const MSG_ZEROCOPY: libc::c_int = 0x4000000;
const SO_EE_ORIGIN_ZEROCOPY: u8 = 5;
const SO_EE_CODE_ZEROCOPY_COPIED: u8 = 1;
const IP_RECVERR: libc::c_int = 11;
const IPV6_RECVERR: libc::c_int = 25;

/// Mirrors struct sock_extended_err from linux/errqueue.h.
#[repr(C)]
#[derive(Clone, Copy)]
struct SockExtendedErr {
    ee_errno: u32,
    ee_origin: u8,
    ee_type: u8,
    ee_code: u8,
    ee_pad: u8,
    ee_info: u32,
    ee_data: u32,
}

enum Segment {
    /// Pool buffer; start/end are absolute offsets into the storage and
    /// advance across partial sends.
    Memory {
        buf: BufRef,
        start: usize,
        end: usize,
    },
    /// File slice sent via sendfile(); holds the fd open until drained.
    File {
        file: File,
        offset: i64,
        remaining: usize,
    },
}

struct Pending {
    buf: BufRef,
    zc_id: u32,
}

/// Outcome of one drain attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStatus {
    /// Kernel accepted this many bytes (possibly zero).
    Drained(usize),
    /// Would block; caller keeps writability interest.
    Blocked,
    /// Fatal transport error; close the connection.
    Closed,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SendQueueStats {
    pub sends: u64,
    pub completions: u64,
    pub copied: u64,
    pub eagain: u64,
    pub enobufs: u64,
}

pub struct SendQueue {
    ready: VecDeque<Segment>,
    pending: VecDeque<Pending>,
    total_bytes: usize,
    next_zc_id: u32,
    oldest_ms: Option<i64>,
    stats: SendQueueStats,
}

impl SendQueue {
    pub fn new() -> Self {
        SendQueue {
            ready: VecDeque::with_capacity(64),
            pending: VecDeque::new(),
            total_bytes: 0,
            next_zc_id: 0,
            oldest_ms: None,
            stats: SendQueueStats::default(),
        }
    }

    /// Queue a buffer reference for sending. The queue takes one hold on the
    /// buffer. A zero-length buffer is a no-op.
    pub fn enqueue_buffer(&mut self, buf: &BufRef, now: i64) {
        if buf.len() == 0 {
            return;
        }
        let start = buf.offset();
        let end = start + buf.len();
        self.total_bytes += end - start;
        if self.ready.is_empty() {
            self.oldest_ms = Some(now);
        }
        self.ready.push_back(Segment::Memory {
            buf: buf.clone(),
            start,
            end,
        });
    }

    /// Queue a file slice. File segments flush immediately and do not count
    /// towards the byte batching designed for small media packets.
    pub fn enqueue_file(&mut self, file: File, offset: u64, len: usize) {
        if len == 0 {
            return;
        }
        self.ready.push_back(Segment::File {
            file,
            offset: offset as i64,
            remaining: len,
        });
    }

    /// True when enough data (or time) has accumulated to warrant asking the
    /// kernel for writability.
    pub fn should_flush(&self, now: i64) -> bool {
        if self.ready.is_empty() {
            return false;
        }
        if self.ready.len() >= BATCH_PACKETS || self.total_bytes >= BATCH_BYTES {
            return true;
        }
        // File segments skip batching entirely.
        if matches!(self.ready.front(), Some(Segment::File { .. })) {
            return true;
        }
        match self.oldest_ms {
            Some(t) => now - t >= FLUSH_DEADLINE_MS,
            None => false,
        }
    }

    /// Absolute deadline by which queued data must be flushed, if any.
    /// Drives the worker's readiness-wait timeout.
    pub fn flush_deadline(&self) -> Option<i64> {
        if self.ready.is_empty() {
            return None;
        }
        self.oldest_ms.map(|t| t + FLUSH_DEADLINE_MS)
    }

    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }

    pub fn pending_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Fully drained: nothing ready and nothing retained by the kernel.
    /// Gating predicate for connection destruction.
    pub fn fully_drained(&self) -> bool {
        self.ready.is_empty() && self.pending.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn num_queued(&self) -> usize {
        self.ready.len()
    }

    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> SendQueueStats {
        self.stats
    }

    /// Release every held reference. Only used at teardown.
    pub fn clear(&mut self) {
        self.ready.clear();
        self.pending.clear();
        self.total_bytes = 0;
        self.oldest_ms = None;
    }

    /// Hand as much of *ready* to the kernel as it will take: one sendfile()
    /// for a file head, otherwise one scatter-gather sendmsg() of up to
    /// MAX_IOVECS memory segments.
    pub fn drain(&mut self, fd: RawFd, zerocopy: bool, now: i64) -> DrainStatus {
        if self.ready.is_empty() {
            return DrainStatus::Drained(0);
        }

        if matches!(self.ready.front(), Some(Segment::File { .. })) {
            return self.drain_file_head(fd);
        }

        let mut iovecs: Vec<libc::iovec> = Vec::with_capacity(MAX_IOVECS.min(self.ready.len()));
        let mut guards = Vec::with_capacity(iovecs.capacity());
        for seg in self.ready.iter() {
            if iovecs.len() == MAX_IOVECS {
                break;
            }
            match seg {
                Segment::Memory { buf, start, end } => {
                    let guard = buf.borrow_storage();
                    iovecs.push(libc::iovec {
                        iov_base: guard[*start..].as_ptr() as *mut libc::c_void,
                        iov_len: end - start,
                    });
                    guards.push(guard);
                }
                Segment::File { .. } => break,
            }
        }

        // SAFETY: msghdr is zero-initialized then pointed at iovecs, whose
        // base pointers stay valid for the duration of the call because the
        // storage borrows in `guards` outlive it.
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = iovecs.as_mut_ptr();
        msg.msg_iovlen = iovecs.len();

        let mut flags = libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL;
        if zerocopy {
            flags |= MSG_ZEROCOPY;
        }

        // SAFETY: fd is a live socket, msg points at valid iovecs.
        let sent = unsafe { libc::sendmsg(fd, &msg, flags) };
        drop(guards);
        drop(iovecs);

        if sent < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EAGAIN) => {
                    self.stats.eagain += 1;
                    DrainStatus::Blocked
                }
                // Socket send buffer full or too many in-flight zero-copy
                // operations; back off and retry later.
                Some(libc::ENOBUFS) => {
                    self.stats.enobufs += 1;
                    DrainStatus::Blocked
                }
                _ => {
                    log::debug!("sendmsg failed: {}", err);
                    DrainStatus::Closed
                }
            };
        }

        self.stats.sends += 1;
        self.account_sent(sent as usize, zerocopy);
        self.oldest_ms = if self.ready.is_empty() { None } else { Some(now) };
        DrainStatus::Drained(sent as usize)
    }

    fn drain_file_head(&mut self, fd: RawFd) -> DrainStatus {
        let (sent, done) = {
            let Some(Segment::File {
                file,
                offset,
                remaining,
            }) = self.ready.front_mut()
            else {
                return DrainStatus::Drained(0);
            };
            let mut off: libc::off_t = *offset;
            // SAFETY: both fds are live; off is a valid in/out pointer.
            let n = unsafe { libc::sendfile(fd, file.as_raw_fd(), &mut off, *remaining) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EAGAIN) {
                    self.stats.eagain += 1;
                    return DrainStatus::Blocked;
                }
                log::debug!("sendfile failed: {}", err);
                return DrainStatus::Closed;
            }
            *offset = off;
            *remaining -= n as usize;
            (n as usize, *remaining == 0)
        };
        if done {
            // Dropping the segment closes the file fd.
            self.ready.pop_front();
        }
        self.stats.sends += 1;
        DrainStatus::Drained(sent)
    }

    /// Move sent bytes out of *ready*: fully-sent buffers go to *pending*
    /// under one fresh generation id (zero-copy) or are released immediately
    /// (regular send); a partially-sent head advances in place and earns a
    /// new id on its next send.
    fn account_sent(&mut self, sent: usize, zerocopy: bool) {
        let zc_id = self.next_zc_id;
        if zerocopy && sent > 0 {
            self.next_zc_id = self.next_zc_id.wrapping_add(1);
        }
        let mut remaining = sent;
        while remaining > 0 {
            // File segments are never part of a sendmsg batch.
            let seg_len = match self.ready.front() {
                Some(Segment::Memory { start, end, .. }) => end - start,
                _ => break,
            };
            if seg_len <= remaining {
                remaining -= seg_len;
                self.total_bytes -= seg_len;
                let Some(Segment::Memory { buf, .. }) = self.ready.pop_front() else {
                    break;
                };
                if zerocopy {
                    self.pending.push_back(Pending { buf, zc_id });
                }
                // Regular send: the kernel copied, the reference drops here.
            } else {
                if let Some(Segment::Memory { start, .. }) = self.ready.front_mut() {
                    *start += remaining;
                }
                self.total_bytes -= remaining;
                remaining = 0;
            }
        }
    }

    /// Drop exactly the pending holds whose generation id falls in
    /// [lo, hi], wraparound-aware. Returns the number released.
    pub fn complete_range(&mut self, lo: u32, hi: u32) -> usize {
        let before = self.pending.len();
        self.pending.retain(|p| {
            let completed = if lo <= hi {
                p.zc_id >= lo && p.zc_id <= hi
            } else {
                p.zc_id >= lo || p.zc_id <= hi
            };
            !completed
        });
        let released = before - self.pending.len();
        self.stats.completions += released as u64;
        released
    }

    /// Read MSG_ZEROCOPY completion notifications from the socket error
    /// queue and release the matching pending holds.
    pub fn handle_completions(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut released = 0usize;

        loop {
            let mut control = [0u8; 128];
            let mut dummy = 0u8;
            let mut iov = libc::iovec {
                iov_base: &mut dummy as *mut u8 as *mut libc::c_void,
                iov_len: 1,
            };
            // SAFETY: zero-init then filled with valid pointers.
            let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
            msg.msg_iov = &mut iov;
            msg.msg_iovlen = 1;
            msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = control.len();

            // SAFETY: fd is a live socket; msg is fully initialized.
            let rc = unsafe {
                libc::recvmsg(fd, &mut msg, libc::MSG_ERRQUEUE | libc::MSG_DONTWAIT)
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EAGAIN) => break,
                    Some(libc::EINTR) => continue,
                    _ => return Err(err),
                }
            }

            // SAFETY: CMSG traversal over the control buffer recvmsg filled;
            // bounds come from msg.msg_controllen.
            unsafe {
                let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
                while !cmsg.is_null() {
                    let level = (*cmsg).cmsg_level;
                    let ctype = (*cmsg).cmsg_type;
                    let is_err = (level == libc::SOL_IP && ctype == IP_RECVERR)
                        || (level == libc::SOL_IPV6 && ctype == IPV6_RECVERR);
                    if is_err {
                        let serr = libc::CMSG_DATA(cmsg) as *const SockExtendedErr;
                        if (*serr).ee_origin == SO_EE_ORIGIN_ZEROCOPY {
                            let lo = (*serr).ee_info;
                            let hi = (*serr).ee_data;
                            if (*serr).ee_code & SO_EE_CODE_ZEROCOPY_COPIED != 0 {
                                self.stats.copied += 1;
                            }
                            let n = self.complete_range(lo, hi);
                            if n == 0 {
                                log::error!(
                                    "zero-copy completion for ids {}-{} matched no pending buffer (pending: {})",
                                    lo,
                                    hi,
                                    self.pending.len()
                                );
                            }
                            released += n;
                        }
                    }
                    cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
                }
            }
        }

        Ok(released)
    }

    #[cfg(test)]
    fn push_pending(&mut self, buf: BufRef, zc_id: u32) {
        self.pending.push_back(Pending { buf, zc_id });
    }
}

impl Default for SendQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Pool;
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};

    fn test_pool() -> Pool {
        Pool::new("test", 32, 64, 2, 96)
    }

    fn buf_with(pool: &Pool, data: &[u8]) -> BufRef {
        let buf = pool.alloc().expect("alloc");
        buf.fill(data);
        buf
    }

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind");
        let addr = listener.local_addr().expect("Failed to get address");
        let client = TcpStream::connect(addr).expect("Failed to connect");
        let (server, _) = listener.accept().expect("Failed to accept");
        server.set_nonblocking(true).expect("Failed to set nonblocking");
        (server, client)
    }

    #[test]
    fn test_enqueue_zero_length_is_noop() {
        let pool = test_pool();
        let mut q = SendQueue::new();
        let buf = pool.alloc().expect("alloc");
        q.enqueue_buffer(&buf, 0);
        assert!(q.is_empty());
        assert_eq!(q.total_bytes(), 0);
    }

    #[test]
    fn test_drain_regular_send_releases_refs() {
        let pool = test_pool();
        let (server, mut client) = socket_pair();
        let mut q = SendQueue::new();

        q.enqueue_buffer(&buf_with(&pool, b"hello "), 0);
        q.enqueue_buffer(&buf_with(&pool, b"world"), 0);
        assert_eq!(q.num_queued(), 2);
        assert_eq!(q.total_bytes(), 11);

        use std::os::fd::AsRawFd;
        let status = q.drain(server.as_raw_fd(), false, 0);
        assert!(matches!(status, DrainStatus::Drained(11)));
        assert!(q.fully_drained());
        // References released: every buffer is back in the pool.
        assert_eq!(pool.num_free(), pool.num_buffers());

        let mut out = [0u8; 16];
        client.set_read_timeout(Some(std::time::Duration::from_millis(200))).ok();
        let n = client.read(&mut out).expect("read");
        assert_eq!(&out[..n], b"hello world");
    }

    #[test]
    fn test_drain_respects_payload_offset() {
        let pool = test_pool();
        let (server, mut client) = socket_pair();
        let mut q = SendQueue::new();

        let buf = buf_with(&pool, b"RTPHDRpayload");
        buf.set_offset(6);
        buf.set_len(7);
        q.enqueue_buffer(&buf, 0);
        drop(buf);

        use std::os::fd::AsRawFd;
        let status = q.drain(server.as_raw_fd(), false, 0);
        assert!(matches!(status, DrainStatus::Drained(7)));

        let mut out = [0u8; 16];
        client.set_read_timeout(Some(std::time::Duration::from_millis(200))).ok();
        let n = client.read(&mut out).expect("read");
        assert_eq!(&out[..n], b"payload");
    }

    #[test]
    fn test_drain_blocked_keeps_entries() {
        let pool = test_pool();
        let (server, _client) = socket_pair();
        let mut q = SendQueue::new();
        use std::os::fd::AsRawFd;

        // Keep enqueueing and draining until the socket buffer fills.
        let payload = [0x47u8; crate::pool::BUFFER_SIZE];
        let mut blocked = false;
        for _ in 0..4096 {
            let buf = pool.alloc().expect("alloc");
            buf.fill(&payload);
            q.enqueue_buffer(&buf, 0);
            match q.drain(server.as_raw_fd(), false, 0) {
                DrainStatus::Blocked => {
                    blocked = true;
                    break;
                }
                DrainStatus::Drained(_) => {}
                DrainStatus::Closed => panic!("unexpected close"),
            }
        }
        assert!(blocked, "socket never blocked");
        assert!(!q.is_empty());
        assert!(q.stats().eagain >= 1);
    }

    #[test]
    fn test_drain_closed_peer() {
        let pool = test_pool();
        let (server, client) = socket_pair();
        drop(client);
        // Give the kernel a moment to process the FIN/RST.
        std::thread::sleep(std::time::Duration::from_millis(20));

        let mut q = SendQueue::new();
        use std::os::fd::AsRawFd;
        // First send may be accepted into the buffer; a follow-up fails.
        let mut closed = false;
        for _ in 0..4 {
            q.enqueue_buffer(&buf_with(&pool, b"data"), 0);
            if q.drain(server.as_raw_fd(), false, 0) == DrainStatus::Closed {
                closed = true;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(closed);
    }

    #[test]
    fn test_completion_drops_exactly_one_hold() {
        let pool = test_pool();
        let mut q = SendQueue::new();

        let a = buf_with(&pool, b"a");
        let b = buf_with(&pool, b"b");
        let c = buf_with(&pool, b"c");
        q.push_pending(a.clone(), 1);
        q.push_pending(b.clone(), 2);
        q.push_pending(c.clone(), 3);
        assert_eq!(a.refcount(), 2);

        assert_eq!(q.complete_range(2, 2), 1);
        assert_eq!(q.num_pending(), 2);
        assert_eq!(b.refcount(), 1);
        assert_eq!(a.refcount(), 2);

        // Completing the same range again must not double-drop.
        assert_eq!(q.complete_range(2, 2), 0);
        assert_eq!(q.num_pending(), 2);

        assert_eq!(q.complete_range(1, 3), 2);
        assert!(q.pending_empty());
    }

    #[test]
    fn test_completion_range_wraparound() {
        let pool = test_pool();
        let mut q = SendQueue::new();
        q.push_pending(buf_with(&pool, b"x"), u32::MAX);
        q.push_pending(buf_with(&pool, b"y"), 0);
        q.push_pending(buf_with(&pool, b"z"), 7);

        assert_eq!(q.complete_range(u32::MAX, 0), 2);
        assert_eq!(q.num_pending(), 1);
    }

    #[test]
    fn test_fully_drained_gates_on_pending() {
        let pool = test_pool();
        let mut q = SendQueue::new();
        q.push_pending(buf_with(&pool, b"x"), 9);
        assert!(q.is_empty());
        assert!(!q.fully_drained());
        q.complete_range(9, 9);
        assert!(q.fully_drained());
    }

    #[test]
    fn test_should_flush_thresholds() {
        let pool = test_pool();
        let mut q = SendQueue::new();
        assert!(!q.should_flush(0));
        assert_eq!(q.flush_deadline(), None);

        q.enqueue_buffer(&buf_with(&pool, b"small"), 1000);
        assert!(!q.should_flush(1000));
        assert_eq!(q.flush_deadline(), Some(1000 + FLUSH_DEADLINE_MS));
        // Deadline elapses.
        assert!(q.should_flush(1000 + FLUSH_DEADLINE_MS));

        // Byte threshold.
        let mut q = SendQueue::new();
        let payload = [0u8; crate::pool::BUFFER_SIZE];
        for _ in 0..(BATCH_BYTES / crate::pool::BUFFER_SIZE) {
            let buf = pool.alloc().expect("alloc");
            buf.fill(&payload);
            q.enqueue_buffer(&buf, 1000);
        }
        assert!(q.should_flush(1000));
    }

    #[test]
    fn test_file_segment_drains_via_sendfile() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("tsgate-sendq-test-{}", std::process::id()));
        std::fs::write(&path, b"0123456789").expect("write temp file");
        let file = File::open(&path).expect("open temp file");

        let (server, mut client) = socket_pair();
        let mut q = SendQueue::new();
        q.enqueue_file(file, 2, 6);
        // File at the head makes the queue flushable immediately.
        assert!(q.should_flush(0));

        use std::os::fd::AsRawFd;
        let status = q.drain(server.as_raw_fd(), false, 0);
        assert!(matches!(status, DrainStatus::Drained(6)));
        assert!(q.fully_drained());

        let mut out = [0u8; 16];
        client.set_read_timeout(Some(std::time::Duration::from_millis(200))).ok();
        let n = client.read(&mut out).expect("read");
        assert_eq!(&out[..n], b"234567");

        std::fs::remove_file(&path).ok();
    }
}
