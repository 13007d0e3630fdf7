// src/worker.rs - Per-worker event loop
//
// One thread, one epoll, one buffer pool, one slab of connections. Each
// iteration: wait for readiness (capped by the nearest flush deadline),
// dispatch events through the fd map, run the periodic tick (stream timers,
// SSE heartbeats), walk the flush-pending list, and reap connections in
// Closing whose pending list has drained.

use crate::config::Config;
use crate::connection::{ConnState, Connection, WriteResult};
use crate::fetch::FetchRegistry;
use crate::m3u;
use crate::poller::{Event, Interest, Poller};
use crate::pool::{Pools, PoolsRef};
use crate::service::Service;
use crate::sock;
use crate::status::{StatusShared, EVENT_DISCONNECT_REQUEST, EVENT_SSE_UPDATE};
use crate::stream::{CleanupStatus, StreamAction};
use slab::Slab;
use std::cell::RefCell;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Set by the signal handler; every worker loop checks it.
pub static STOP: AtomicBool = AtomicBool::new(false);

const TICK_INTERVAL_MS: i64 = 100;
/// Upper bound on waiting for zero-copy completions after Closing.
const CLOSING_GRACE_MS: i64 = 15_000;

/// fd -> connection slab key. A flat array indexed by fd: sparse but
/// constant-time, sized to the process fd limit.
pub struct FdMap {
    slots: Vec<i32>,
}

impl FdMap {
    pub fn new(capacity: usize) -> FdMap {
        FdMap {
            slots: vec![-1; capacity.max(64)],
        }
    }

    /// Sized from RLIMIT_NOFILE so every possible fd indexes in bounds.
    pub fn with_fd_limit() -> FdMap {
        let mut rlim = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        // SAFETY: rlim is a valid out-pointer.
        let limit = if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) } == 0 {
            rlim.rlim_cur as usize
        } else {
            4096
        };
        FdMap::new(limit.clamp(1024, 1 << 20))
    }

    pub fn set(&mut self, fd: RawFd, conn: usize) {
        let idx = fd as usize;
        if idx >= self.slots.len() {
            self.slots.resize(idx + 1, -1);
        }
        self.slots[idx] = conn as i32;
    }

    pub fn get(&self, fd: RawFd) -> Option<usize> {
        let v = *self.slots.get(fd as usize)?;
        if v < 0 {
            None
        } else {
            Some(v as usize)
        }
    }

    pub fn del(&mut self, fd: RawFd) {
        if let Some(slot) = self.slots.get_mut(fd as usize) {
            *slot = -1;
        }
    }
}

pub struct Worker {
    id: usize,
    poller: Poller,
    listener: OwnedFd,
    notif_rx: OwnedFd,
    conns: Slab<Connection>,
    fdmap: FdMap,
    /// Connections with queued writes whose batching deadline has not yet
    /// armed writability (dirty tracking for O(m) instead of O(n)).
    pending_flush: HashSet<usize>,
    pools: PoolsRef,
    status: Arc<StatusShared>,
    cfg: Arc<Config>,
    services: Rc<RefCell<Vec<Service>>>,
    fetches: FetchRegistry,
    zerocopy: bool,
    last_tick_ms: i64,
    last_playlist_refresh_ms: i64,
}

impl Worker {
    pub fn new(
        id: usize,
        listener: OwnedFd,
        notif_rx: OwnedFd,
        cfg: Arc<Config>,
        status: Arc<StatusShared>,
        services: Vec<Service>,
        zerocopy: bool,
    ) -> std::io::Result<Worker> {
        let mut poller = Poller::new()?;
        poller.register(listener.as_raw_fd(), Interest::READABLE)?;
        poller.register(notif_rx.as_raw_fd(), Interest::READABLE)?;
        let now = crate::now_ms();
        Ok(Worker {
            id,
            poller,
            listener,
            notif_rx,
            conns: Slab::with_capacity(64),
            fdmap: FdMap::with_fd_limit(),
            pending_flush: HashSet::with_capacity(256),
            pools: Pools::new(cfg.pool_max_buffers),
            status,
            cfg,
            services: Rc::new(RefCell::new(services)),
            fetches: FetchRegistry::new(),
            zerocopy,
            last_tick_ms: now,
            last_playlist_refresh_ms: now,
        })
    }

    pub fn run(&mut self) -> std::io::Result<()> {
        log::info!("worker {} started", self.id);

        while !STOP.load(Ordering::Acquire) {
            // 1. Wait with a timeout capped by the sooner of the periodic
            //    tick and the nearest batching flush deadline.
            let timeout = self.next_poll_timeout_ms();
            let events = self.poller.poll(Some(Duration::from_millis(timeout)))?;
            let now = crate::now_ms();

            let mut to_close: Vec<usize> = Vec::new();

            for ev in events {
                if ev.fd == self.listener.as_raw_fd() {
                    self.accept_loop();
                    continue;
                }
                if ev.fd == self.notif_rx.as_raw_fd() {
                    self.handle_notifications(now, &mut to_close);
                    continue;
                }
                if self.fetches.owns(ev.fd) {
                    self.fetches.handle_event(ev.fd, self.poller.raw());
                    continue;
                }
                let Some(id) = self.fdmap.get(ev.fd) else {
                    continue;
                };
                let Some(conn) = self.conns.get(id) else {
                    self.fdmap.del(ev.fd);
                    continue;
                };
                if conn.fd() == ev.fd {
                    self.handle_client_event(id, &ev, now, &mut to_close);
                } else {
                    self.handle_stream_event(id, &ev, now, &mut to_close);
                }
            }

            if now - self.last_tick_ms >= TICK_INTERVAL_MS {
                self.last_tick_ms = now;
                self.run_tick(now, &mut to_close);
            }

            // 4. Walk the flush-pending list and arm writability where due.
            self.walk_pending_flush(now);

            to_close.sort_unstable();
            to_close.dedup();
            for id in to_close {
                self.close_connection(id, now);
            }
            self.reap_closing(now);
        }

        log::info!("worker {} stopping", self.id);
        self.fetches.cancel_all(self.poller.raw());
        let ids: Vec<usize> = self.conns.iter().map(|(id, _)| id).collect();
        let now = crate::now_ms();
        for id in ids {
            self.close_connection(id, now);
            // Shutdown is final: free regardless of pending completions.
            if self.conns.contains(id) {
                self.free_connection(id);
            }
        }
        Ok(())
    }

    /// Readiness-wait cap: min(next tick deadline, nearest flush deadline).
    fn next_poll_timeout_ms(&self) -> u64 {
        let now = crate::now_ms();
        let mut deadline = self.last_tick_ms + TICK_INTERVAL_MS;
        for &id in &self.pending_flush {
            if let Some(conn) = self.conns.get(id) {
                if let Some(d) = conn.sendq.flush_deadline() {
                    deadline = deadline.min(d);
                }
            }
        }
        (deadline - now).clamp(0, TICK_INTERVAL_MS) as u64
    }

    /// O(m) walk of connections with queued-but-unarmed writes (m =
    /// flush-pending entries): request writability once the batching
    /// deadline or size threshold is due, drop entries whose queues drained.
    fn walk_pending_flush(&mut self, now: i64) {
        if self.pending_flush.is_empty() {
            return;
        }
        let ids: Vec<usize> = self.pending_flush.drain().collect();
        for id in ids {
            let Some(conn) = self.conns.get_mut(id) else {
                continue;
            };
            if conn.sendq.is_empty() {
                continue;
            }
            if conn.sendq.should_flush(now) {
                conn.request_writeout();
            } else {
                // Deadline still ahead; keep it on the list.
                self.pending_flush.insert(id);
            }
        }
    }

    // ------------------------------------------------------------------
    // Accept
    // ------------------------------------------------------------------

    fn accept_loop(&mut self) {
        loop {
            let mut sa: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let mut slen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            // SAFETY: sa/slen form a valid out-parameter pair.
            let cfd = unsafe {
                libc::accept4(
                    self.listener.as_raw_fd(),
                    &mut sa as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                    &mut slen,
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if cfd < 0 {
                let err = std::io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EAGAIN) | Some(libc::EINTR) => break,
                    _ => {
                        log::error!("accept failed: {}", err);
                        break;
                    }
                }
            }
            // SAFETY: cfd is a fresh fd owned from here on.
            let owned = unsafe { OwnedFd::from_raw_fd(cfd) };
            let peer = sock::sockaddr_storage_to_std(&sa).unwrap_or_else(|| {
                SocketAddr::V4(std::net::SocketAddrV4::new(
                    std::net::Ipv4Addr::UNSPECIFIED,
                    0,
                ))
            });

            let conn = Connection::new(
                owned,
                self.poller.raw(),
                peer,
                self.pools.clone(),
                self.status.clone(),
                self.id,
                self.zerocopy,
            );
            let key = self.conns.insert(conn);
            self.conns[key].id = key;
            if let Err(e) = self.poller.register(cfd, Interest::READABLE) {
                log::error!("failed to register client fd: {}", e);
                let mut conn = self.conns.remove(key);
                conn.on_free();
                continue;
            }
            self.fdmap.set(cfd, key);
            log::debug!("worker {} accepted {} (conn {})", self.id, peer, key);
        }
    }

    // ------------------------------------------------------------------
    // Event dispatch
    // ------------------------------------------------------------------

    fn handle_client_event(
        &mut self,
        id: usize,
        ev: &Event,
        now: i64,
        to_close: &mut Vec<usize>,
    ) {
        let Some(conn) = self.conns.get_mut(id) else {
            return;
        };

        if ev.error {
            // EPOLLERR is either a MSG_ZEROCOPY completion batch or a real
            // socket error; the error queue distinguishes them.
            let mut had_completions = false;
            if conn.zerocopy_enabled {
                match conn.handle_completions() {
                    Ok(n) if n > 0 => {
                        had_completions = true;
                        if conn.ready_to_free() {
                            to_close.push(id);
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::debug!("error queue read failed: {}", e);
                        to_close.push(id);
                        return;
                    }
                }
            }
            if !had_completions {
                let mut err: libc::c_int = 0;
                let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
                // SAFETY: err/len form a valid out-parameter pair.
                let rc = unsafe {
                    libc::getsockopt(
                        conn.fd(),
                        libc::SOL_SOCKET,
                        libc::SO_ERROR,
                        &mut err as *mut libc::c_int as *mut libc::c_void,
                        &mut len,
                    )
                };
                if rc == 0 && err != 0 {
                    log::debug!(
                        "client error: {}",
                        std::io::Error::from_raw_os_error(err)
                    );
                    to_close.push(id);
                    return;
                }
            }
        }

        if ev.hangup {
            log::debug!("client disconnected");
            to_close.push(id);
            return;
        }

        if ev.readable {
            if conn.state == ConnState::Streaming {
                // Streaming/SSE clients should not send; drain to detect
                // close and discard anything else.
                let mut scratch = [0u8; 1024];
                // SAFETY: scratch is a valid writable buffer.
                let r = unsafe {
                    libc::recv(
                        conn.fd(),
                        scratch.as_mut_ptr() as *mut libc::c_void,
                        scratch.len(),
                        libc::MSG_DONTWAIT,
                    )
                };
                if r == 0 {
                    to_close.push(id);
                    return;
                }
                if r < 0 {
                    let err = std::io::Error::last_os_error();
                    if err.raw_os_error() != Some(libc::EAGAIN) {
                        to_close.push(id);
                        return;
                    }
                } else {
                    log::debug!("client sent {} bytes mid-stream (discarded)", r);
                }
            } else if conn.state != ConnState::Closing {
                let cfg = self.cfg.clone();
                let services = self.services.clone();
                let services = services.borrow();
                conn.handle_read(&cfg, &services, &mut self.fdmap, now);
                if conn.state == ConnState::Closing && conn.sendq.fully_drained() {
                    to_close.push(id);
                    return;
                }
            }
        }

        if ev.writable {
            let Some(conn) = self.conns.get_mut(id) else {
                return;
            };
            if conn.handle_write(now) == WriteResult::Closed {
                to_close.push(id);
            }
        }
    }

    fn handle_stream_event(
        &mut self,
        id: usize,
        ev: &Event,
        now: i64,
        to_close: &mut Vec<usize>,
    ) {
        let Some(conn) = self.conns.get_mut(id) else {
            return;
        };
        let Some(mut stream) = conn.stream.take() else {
            // Stale map entry for a fd the stream no longer owns.
            self.fdmap.del(ev.fd);
            return;
        };
        if !stream.owns_fd(ev.fd) {
            self.fdmap.del(ev.fd);
            conn.stream = Some(stream);
            return;
        }
        let action =
            stream.handle_fd_event(conn, ev.fd, ev.readable, ev.writable, &mut self.fdmap, now);
        conn.stream = Some(stream);
        // Media may have been enqueued without reaching a flush threshold;
        // track the connection for the flush-deadline walk.
        if !conn.sendq.is_empty() {
            self.pending_flush.insert(id);
        }
        if action == StreamAction::CloseConn {
            to_close.push(id);
        }
    }

    fn handle_notifications(&mut self, now: i64, to_close: &mut Vec<usize>) {
        let mut has_sse = false;
        let mut has_disconnect = false;
        loop {
            let mut buf = [0u8; 256];
            // SAFETY: buf is a valid writable buffer.
            let r = unsafe {
                libc::read(
                    self.notif_rx.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if r <= 0 {
                break;
            }
            for &b in &buf[..r as usize] {
                match b {
                    EVENT_SSE_UPDATE => has_sse = true,
                    EVENT_DISCONNECT_REQUEST => has_disconnect = true,
                    _ => {}
                }
            }
        }

        if has_sse {
            let ids: Vec<usize> = self
                .conns
                .iter()
                .filter(|(_, c)| c.sse.active)
                .map(|(id, _)| id)
                .collect();
            for id in ids {
                if let Some(conn) = self.conns.get_mut(id) {
                    conn.push_sse(now);
                }
            }
        }

        if has_disconnect {
            for (id, conn) in self.conns.iter() {
                if conn.status_index >= 0 && self.status.take_disconnect_request(conn.status_index)
                {
                    log::info!("disconnect requested for {} via API", conn.peer);
                    to_close.push(id);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Periodic tick
    // ------------------------------------------------------------------

    fn run_tick(&mut self, now: i64, to_close: &mut Vec<usize>) {
        let ids: Vec<usize> = self.conns.iter().map(|(id, _)| id).collect();
        for id in ids {
            let Some(conn) = self.conns.get_mut(id) else {
                continue;
            };

            if conn.streaming {
                let Some(mut stream) = conn.stream.take() else {
                    continue;
                };
                let action = stream.tick(conn, &mut self.fdmap, now);
                conn.stream = Some(stream);
                if !conn.sendq.is_empty() {
                    self.pending_flush.insert(id);
                }
                if action == StreamAction::CloseConn {
                    to_close.push(id);
                    continue;
                }
            } else if conn.state == ConnState::Closing {
                // Deferred RTSP teardown: bound the wait.
                let expired = conn
                    .stream
                    .as_ref()
                    .and_then(|s| s.rtsp.as_ref())
                    .map(|r| r.teardown_expired(now))
                    .unwrap_or(false);
                if expired {
                    if let Some(stream) = conn.stream.as_mut() {
                        stream.finish_deferred_cleanup(conn.epfd, &mut self.fdmap);
                    }
                    conn.stream = None;
                }
            }

            let Some(conn) = self.conns.get_mut(id) else {
                continue;
            };

            // SSE heartbeat once per second keeps idle dashboards live.
            if conn.sse.active && now - conn.sse.last_beat_ms >= 1000 {
                conn.push_sse(now);
            }
        }

        self.maybe_refresh_playlist(now);
    }

    fn maybe_refresh_playlist(&mut self, now: i64) {
        let Some(url) = self.cfg.playlist.clone() else {
            return;
        };
        if self.cfg.playlist_refresh == 0 || !url.starts_with("http") {
            return;
        }
        // Stagger workers by a second each so refreshes do not stampede.
        let interval_ms = self.cfg.playlist_refresh as i64 * 1000 + self.id as i64 * 1000;
        if now - self.last_playlist_refresh_ms < interval_ms || !self.fetches.is_empty() {
            return;
        }
        self.last_playlist_refresh_ms = now;

        let services = self.services.clone();
        let worker_id = self.id;
        let callback = Box::new(move |content: Option<String>| {
            let Some(content) = content else {
                return;
            };
            let fresh = m3u::parse_services(&content);
            let mut list = services.borrow_mut();
            let kept = list.len();
            list.retain(|s| !s.source_external);
            let inline = list.len();
            list.extend(fresh);
            log::info!(
                "worker {} refreshed playlist: {} services ({} inline, was {})",
                worker_id,
                list.len(),
                inline,
                kept
            );
        });
        if let Err(e) = self.fetches.start(&url, self.poller.raw(), callback) {
            log::warn!("playlist refresh failed to start: {}", e);
        }
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Initiate connection teardown. Streaming resources are released
    /// first; the free itself waits for the pending zero-copy list (and a
    /// possible RTSP TEARDOWN exchange).
    fn close_connection(&mut self, id: usize, now: i64) {
        let Some(conn) = self.conns.get_mut(id) else {
            return;
        };

        if conn.streaming {
            conn.streaming = false;
            if let Some(mut stream) = conn.stream.take() {
                let status = conn.status.clone();
                match stream.cleanup(conn.epfd, &mut self.fdmap, &status, now) {
                    CleanupStatus::Deferred => {
                        log::debug!("deferring teardown for RTSP TEARDOWN response");
                        conn.stream = Some(stream);
                        conn.state = ConnState::Closing;
                        conn.closing_since_ms = now;
                        return;
                    }
                    CleanupStatus::Done => {
                        conn.stream = Some(stream);
                    }
                }
            }
        } else if let Some(stream) = conn.stream.as_mut() {
            if stream.teardown_pending() {
                // TEARDOWN response still outstanding; the completion event
                // or its timeout re-enters here.
                return;
            }
            // A deferred teardown resolved (response, error, or timeout).
            stream.finish_deferred_cleanup(conn.epfd, &mut self.fdmap);
        }

        conn.state = ConnState::Closing;
        if conn.closing_since_ms == 0 {
            conn.closing_since_ms = now;
        }

        if conn.sendq.pending_empty() {
            self.free_connection(id);
        }
        // Otherwise the kernel still references buffers; completions or the
        // closing grace period trigger the free.
    }

    fn free_connection(&mut self, id: usize) {
        let mut conn = self.conns.remove(id);
        self.pending_flush.remove(&id);
        self.fdmap.del(conn.fd());
        if let Err(e) = self.poller.deregister(conn.fd()) {
            log::debug!("client fd deregister failed: {}", e);
        }
        conn.on_free();
        log::debug!("worker {} freed connection {}", self.id, id);
    }

    /// Reap Closing connections whose queues drained, and force out those
    /// whose completions never arrived within the grace period.
    fn reap_closing(&mut self, now: i64) {
        let ids: Vec<usize> = self
            .conns
            .iter()
            .filter(|(_, c)| {
                c.state == ConnState::Closing
                    && !c
                        .stream
                        .as_ref()
                        .map(|s| s.teardown_pending())
                        .unwrap_or(false)
            })
            .filter(|(_, c)| {
                c.sendq.pending_empty()
                    || (c.closing_since_ms > 0 && now - c.closing_since_ms >= CLOSING_GRACE_MS)
            })
            .map(|(id, _)| id)
            .collect();
        for id in ids {
            self.free_connection(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sendq::FLUSH_DEADLINE_MS;
    use clap::Parser;
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::IntoRawFd;

    fn test_worker() -> Worker {
        let cfg = Config::parse_from(["tsgate", "--listen", "127.0.0.1:0"]);
        let listener = sock::tcp_listener(cfg.listen).expect("Failed to bind");
        let mut pipe_fds = [0i32; 2];
        // SAFETY: pipe_fds is a valid out-array.
        let rc = unsafe { libc::pipe2(pipe_fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(rc, 0);
        // SAFETY: fresh pipe fd owned from here on.
        let notif_rx = unsafe { OwnedFd::from_raw_fd(pipe_fds[0]) };
        Worker::new(
            0,
            listener,
            notif_rx,
            Arc::new(cfg),
            StatusShared::new(0),
            Vec::new(),
            false,
        )
        .expect("Failed to create worker")
    }

    fn add_connection(worker: &mut Worker) -> (usize, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind");
        let addr = listener.local_addr().expect("Failed to get address");
        let client = TcpStream::connect(addr).expect("Failed to connect");
        let (server, peer) = listener.accept().expect("Failed to accept");
        // SAFETY: fd from into_raw_fd, ownership transferred.
        let owned = unsafe { OwnedFd::from_raw_fd(server.into_raw_fd()) };
        let conn = Connection::new(
            owned,
            worker.poller.raw(),
            peer,
            worker.pools.clone(),
            worker.status.clone(),
            0,
            false,
        );
        let id = worker.conns.insert(conn);
        worker.conns[id].id = id;
        (id, client)
    }

    #[test]
    fn test_pending_flush_arms_writeout_at_deadline() {
        let mut worker = test_worker();
        let (id, _client) = add_connection(&mut worker);

        let buf = worker.pools.alloc_media().expect("alloc");
        buf.fill(b"ts data");
        worker.conns[id].sendq.enqueue_buffer(&buf, 1000);
        worker.pending_flush.insert(id);

        // Before the deadline the entry stays queued on the list.
        worker.walk_pending_flush(1000 + FLUSH_DEADLINE_MS - 1);
        assert!(worker.pending_flush.contains(&id));

        // At the deadline writability is armed and the entry drops off.
        worker.walk_pending_flush(1000 + FLUSH_DEADLINE_MS);
        assert!(worker.pending_flush.is_empty());
    }

    #[test]
    fn test_pending_flush_drops_drained_and_stale_entries() {
        let mut worker = test_worker();
        let (id, _client) = add_connection(&mut worker);

        // Drained queue: the walk discards the entry without arming.
        worker.pending_flush.insert(id);
        worker.walk_pending_flush(0);
        assert!(worker.pending_flush.is_empty());

        // Entries for freed connections are tolerated and discarded.
        worker.pending_flush.insert(id + 100);
        worker.walk_pending_flush(0);
        assert!(worker.pending_flush.is_empty());
    }

    #[test]
    fn test_poll_timeout_honors_flush_deadline() {
        let mut worker = test_worker();
        let (id, _client) = add_connection(&mut worker);
        worker.last_tick_ms = crate::now_ms();

        // No flush pending: the tick interval caps the wait.
        assert!(worker.next_poll_timeout_ms() <= TICK_INTERVAL_MS as u64);

        // An already-expired flush deadline demands an immediate pass.
        let buf = worker.pools.alloc_media().expect("alloc");
        buf.fill(b"ts data");
        worker
            .conns[id]
            .sendq
            .enqueue_buffer(&buf, crate::now_ms() - FLUSH_DEADLINE_MS - 50);
        worker.pending_flush.insert(id);
        assert_eq!(worker.next_poll_timeout_ms(), 0);
    }

    #[test]
    fn test_fdmap_set_get_del() {
        let mut map = FdMap::new(8);
        assert_eq!(map.get(5), None);
        map.set(5, 42);
        assert_eq!(map.get(5), Some(42));
        map.del(5);
        assert_eq!(map.get(5), None);
        // Negative-range fds never resolve.
        assert_eq!(map.get(0), None);
    }

    #[test]
    fn test_fdmap_grows_on_demand() {
        let mut map = FdMap::new(8);
        map.set(5000, 7);
        assert_eq!(map.get(5000), Some(7));
        assert_eq!(map.get(4999), None);
    }

    #[test]
    fn test_fdmap_reuse_after_del() {
        let mut map = FdMap::new(64);
        map.set(10, 1);
        map.del(10);
        map.set(10, 2);
        assert_eq!(map.get(10), Some(2));
    }
}
