// src/connection.rs - Client connection lifecycle and backpressure
//
// State machine: ReadRequestLine -> ReadHeaders -> Route -> Streaming (media
// or SSE) or Closing (response-then-close endpoints). A connection in
// Closing is freed only once the send queue's pending list has drained.
//
// The queue-limit controller gives each streaming client a fair share of
// pool bytes, permits short bursts, latches a slow-flag on chronically deep
// queues, and sheds load by dropping packets rather than disconnecting.

use crate::config::Config;
use crate::error::StreamError;
use crate::http::{self, ContentType, HttpRequest, HttpStatus, ParseResult};
use crate::m3u;
use crate::poller::{self, Interest};
use crate::pool::{BufRef, Pool, PoolsRef, BUFFER_SIZE};
use crate::sendq::{DrainStatus, SendQueue};
use crate::service::Service;
use crate::sock;
use crate::status::{ClientState, QueueReport, StatusShared};
use crate::stream::StreamContext;
use crate::worker::FdMap;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

const INBUF_MAX: usize = 8192;

// Queue-limit controller tuning.
const QUEUE_MIN_BUFFERS: usize = 64;
const BURST_FACTOR: f64 = 3.0;
const BURST_FACTOR_CONGESTED: f64 = 1.5;
const BURST_FACTOR_DRAIN: f64 = 1.0;
const EWMA_ALPHA: f64 = 0.2;
const SLOW_FACTOR: f64 = 1.5;
const SLOW_EXIT_FACTOR: f64 = 1.1;
const SLOW_DEBOUNCE_MS: i64 = 3000;
const HIGH_UTIL_THRESHOLD: f64 = 0.85;
const DRAIN_UTIL_THRESHOLD: f64 = 0.95;
const SLOW_LIMIT_RATIO: f64 = 0.9;
const SLOW_EXIT_LIMIT_RATIO: f64 = 0.75;
const SLOW_CLAMP_FACTOR: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    ReadRequestLine,
    ReadHeaders,
    Route,
    Streaming,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteResult {
    Idle,
    Pending,
    Blocked,
    Closed,
}

/// Fair-share admission control for one connection's send queue.
pub struct QueueController {
    pub avg_bytes: f64,
    pub slow_active: bool,
    slow_candidate_since: i64,
    pub limit_bytes: usize,
}

impl QueueController {
    pub fn new() -> Self {
        QueueController {
            avg_bytes: 0.0,
            slow_active: false,
            slow_candidate_since: 0,
            limit_bytes: 0,
        }
    }

    fn limit_from(pool: &Pool, fair_bytes: usize, burst: f64) -> usize {
        let mut limit = (fair_bytes as f64 * burst) as usize;
        let global_cap = pool.max_buffers() * BUFFER_SIZE;
        let reserve = QUEUE_MIN_BUFFERS * BUFFER_SIZE;
        let hard_cap = if global_cap > reserve {
            global_cap - reserve
        } else {
            global_cap
        };
        if limit > hard_cap {
            limit = hard_cap;
        }
        limit.max(BUFFER_SIZE * 4)
    }

    /// Recompute the byte limit for this connection. `queued_buffers` is the
    /// connection's current queue depth in pool buffers.
    pub fn update(
        &mut self,
        pool: &Pool,
        active_streams: usize,
        queued_buffers: usize,
        now: i64,
    ) -> usize {
        let active = active_streams.max(1);
        let total_buffers = pool.num_buffers().max(1);
        let share_buffers = (total_buffers / active).max(QUEUE_MIN_BUFFERS);
        let fair_bytes = share_buffers * BUFFER_SIZE;

        let max_buffers = pool.max_buffers();
        let used = total_buffers.saturating_sub(pool.num_free());
        let util = used as f64 / max_buffers.max(1) as f64;

        let mut burst = BURST_FACTOR;
        if total_buffers >= max_buffers || util >= HIGH_UTIL_THRESHOLD {
            burst = BURST_FACTOR_CONGESTED;
        }
        if pool.num_free() < pool.low_watermark() / 2 || util >= DRAIN_UTIL_THRESHOLD {
            burst = BURST_FACTOR_DRAIN;
        }

        let queue_mem_bytes = (queued_buffers * BUFFER_SIZE) as f64;
        if self.avg_bytes <= 0.0 {
            self.avg_bytes = queue_mem_bytes;
        } else {
            self.avg_bytes = (1.0 - EWMA_ALPHA) * self.avg_bytes + EWMA_ALPHA * queue_mem_bytes;
        }

        let bursted = Self::limit_from(pool, fair_bytes, burst);

        // Slow thresholds, capped as fractions of the bursted limit so that
        // exit < entry holds at every pool state.
        let mut slow_entry = fair_bytes as f64 * SLOW_FACTOR;
        slow_entry = slow_entry.min(bursted as f64 * SLOW_LIMIT_RATIO);
        let mut slow_exit = fair_bytes as f64 * SLOW_EXIT_FACTOR;
        slow_exit = slow_exit.min(bursted as f64 * SLOW_EXIT_LIMIT_RATIO);
        if slow_exit >= slow_entry {
            slow_exit = slow_entry * SLOW_EXIT_LIMIT_RATIO;
        }

        if self.avg_bytes > slow_entry {
            if self.slow_candidate_since == 0 {
                self.slow_candidate_since = now;
            } else if !self.slow_active && now - self.slow_candidate_since >= SLOW_DEBOUNCE_MS {
                self.slow_active = true;
            }
        } else {
            self.slow_candidate_since = 0;
        }

        if self.slow_active && self.avg_bytes < slow_exit {
            self.slow_active = false;
            self.slow_candidate_since = 0;
        }

        let burst = if self.slow_active {
            burst.min(SLOW_CLAMP_FACTOR)
        } else {
            burst
        };
        self.limit_bytes = Self::limit_from(pool, fair_bytes, burst);
        self.limit_bytes
    }
}

impl Default for QueueController {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
pub struct SseState {
    pub active: bool,
    pub last_log_seq: u64,
    pub last_beat_ms: i64,
}

pub struct Connection {
    fd: OwnedFd,
    pub epfd: RawFd,
    /// Slab key in the worker; set right after insertion.
    pub id: usize,
    pub state: ConnState,
    inbuf: Vec<u8>,
    pub req: HttpRequest,
    pub service: Option<Service>,
    pub stream: Option<StreamContext>,
    pub sendq: SendQueue,
    pub pools: PoolsRef,
    pub status: Arc<StatusShared>,
    pub status_index: i32,
    pub peer: SocketAddr,
    worker_id: usize,

    controller: QueueController,
    queue_bytes_hw: u64,
    queue_buffers_hw: u32,
    dropped_packets: u64,
    dropped_bytes: u64,
    backpressure_events: u32,

    pub zerocopy_enabled: bool,
    pub stream_registered: bool,
    pub streaming: bool,
    pub sse: SseState,
    /// When Closing was entered; bounds how long unacknowledged zero-copy
    /// completions may defer the free.
    pub closing_since_ms: i64,
    control_class: bool,
    writeout_enabled: bool,
}

impl Connection {
    pub fn new(
        fd: OwnedFd,
        epfd: RawFd,
        peer: SocketAddr,
        pools: PoolsRef,
        status: Arc<StatusShared>,
        worker_id: usize,
        zerocopy_wanted: bool,
    ) -> Connection {
        let raw = fd.as_raw_fd();
        if let Err(e) = sock::set_tcp_nodelay(raw) {
            log::debug!("TCP_NODELAY failed: {}", e);
        }
        if let Err(e) = sock::set_tcp_user_timeout(raw) {
            log::debug!("TCP_USER_TIMEOUT failed: {}", e);
        }
        let zerocopy_enabled = zerocopy_wanted && sock::enable_so_zerocopy(raw);

        Connection {
            fd,
            epfd,
            id: usize::MAX,
            state: ConnState::ReadRequestLine,
            inbuf: Vec::with_capacity(512),
            req: HttpRequest::new(),
            service: None,
            stream: None,
            sendq: SendQueue::new(),
            pools,
            status,
            status_index: -1,
            peer,
            worker_id,
            controller: QueueController::new(),
            queue_bytes_hw: 0,
            queue_buffers_hw: 0,
            dropped_packets: 0,
            dropped_bytes: 0,
            backpressure_events: 0,
            zerocopy_enabled,
            stream_registered: false,
            streaming: false,
            sse: SseState::default(),
            closing_since_ms: 0,
            control_class: true,
            writeout_enabled: false,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn slow_active(&self) -> bool {
        self.controller.slow_active
    }

    /// Set EPOLLOUT interest; idempotent.
    pub fn request_writeout(&mut self) {
        if !self.writeout_enabled {
            poller::set_interest(self.epfd, self.fd(), Interest::READABLE.add_writable());
            self.writeout_enabled = true;
        }
    }

    fn clear_writeout(&mut self) {
        if self.writeout_enabled {
            poller::set_interest(self.epfd, self.fd(), Interest::READABLE);
            self.writeout_enabled = false;
        }
    }

    // ------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------

    /// Client socket readable while in the request phase.
    pub fn handle_read(
        &mut self,
        cfg: &Config,
        services: &[Service],
        fdmap: &mut FdMap,
        now: i64,
    ) {
        let mut chunk = [0u8; 2048];
        // SAFETY: chunk is a valid writable buffer for the fd.
        let r = unsafe {
            libc::read(
                self.fd(),
                chunk.as_mut_ptr() as *mut libc::c_void,
                chunk.len(),
            )
        };
        if r == 0 {
            self.state = ConnState::Closing;
            return;
        }
        if r < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EAGAIN) {
                self.state = ConnState::Closing;
            }
            return;
        }
        self.inbuf.extend_from_slice(&chunk[..r as usize]);
        if self.inbuf.len() > INBUF_MAX {
            self.send_error(HttpStatus::BadRequest400);
            return;
        }

        if matches!(self.state, ConnState::ReadRequestLine | ConnState::ReadHeaders) {
            match http::parse_request(&mut self.inbuf, &mut self.req) {
                ParseResult::NeedMore => {
                    if self.req.past_request_line() {
                        self.state = ConnState::ReadHeaders;
                    }
                }
                ParseResult::Complete => {
                    self.state = ConnState::Route;
                    self.route_and_start(cfg, services, fdmap, now);
                }
                ParseResult::Error => {
                    self.send_error(HttpStatus::BadRequest400);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------

    fn route_and_start(
        &mut self,
        cfg: &Config,
        services: &[Service],
        fdmap: &mut FdMap,
        now: i64,
    ) {
        log::info!(
            "{} requested {} {}",
            self.peer,
            self.req.method,
            self.req.url
        );

        if !self.check_admission(cfg) {
            return;
        }

        let path = self.req.path().to_string();
        let query = self.req.query().map(str::to_string);
        let rel = path.trim_start_matches('/').trim_end_matches('/').to_string();

        let sroute = cfg.status_route.trim_matches('/');
        if !sroute.is_empty() && rel == sroute {
            self.serve_status_page();
            return;
        }
        let sse_route = format!("{}/sse", sroute);
        if rel == sse_route.trim_start_matches('/') {
            self.start_sse(now);
            return;
        }
        let api_prefix = format!("{}/api/", sroute);
        if let Some(api) = rel.strip_prefix(api_prefix.trim_start_matches('/')) {
            match api {
                "disconnect" => self.api_disconnect(),
                "log-level" => self.api_log_level(),
                _ => self.send_error(HttpStatus::NotFound404),
            }
            return;
        }
        if rel == "playlist.m3u" {
            self.serve_playlist(cfg, services);
            return;
        }

        // Configured services, then UDPxy/RTSP dynamic parsing.
        let Some(decoded) = http::url_decode(&rel) else {
            self.send_error(HttpStatus::BadRequest400);
            return;
        };
        let mut service = services
            .iter()
            .find(|s| s.name == decoded)
            .map(|s| s.with_query_merge(query.as_deref()));
        if service.is_none() && cfg.udpxy_enabled() {
            service = Service::from_udpxy_path(&path, query.as_deref())
                .or_else(|| Service::from_rtsp_path(&path, query.as_deref()));
        }
        let Some(mut service) = service else {
            self.send_error(HttpStatus::NotFound404);
            return;
        };
        if !self.req.user_agent.is_empty() {
            service.user_agent = Some(self.req.user_agent.clone());
        }

        // HEAD: success headers, no upstream join.
        if self.req.method.eq_ignore_ascii_case("HEAD") {
            self.send_headers(HttpStatus::Ok200, ContentType::Mp2t, None);
            self.state = ConnState::Closing;
            return;
        }

        if self.status.total_clients() >= cfg.maxclients {
            self.send_error(HttpStatus::Unavailable503);
            return;
        }

        let display_url = match &query {
            Some(q) => format!("/{}?{}", decoded, q),
            None => format!("/{}", decoded),
        };
        self.status_index =
            self.status
                .register_client(&self.peer.to_string(), &display_url, self.worker_id, now);

        self.send_headers(HttpStatus::Ok200, ContentType::Mp2t, None);

        match StreamContext::init(self, service.clone(), cfg, fdmap, now) {
            Ok(ctx) => {
                self.stream = Some(ctx);
                self.service = Some(service);
                self.streaming = true;
                self.state = ConnState::Streaming;
                self.control_class = false;
                if !self.stream_registered {
                    self.pools.register_stream_client();
                    self.stream_registered = true;
                }
            }
            Err(e) => {
                log::error!("stream setup failed for {}: {}", display_url, e);
                self.state = ConnState::Closing;
            }
        }
    }

    /// Host-header and bearer-token admission checks.
    fn check_admission(&mut self, cfg: &Config) -> bool {
        if let Some(expected) = &cfg.hostname {
            if self.req.hostname.is_empty() {
                log::warn!("request rejected: missing Host header");
                self.send_error(HttpStatus::BadRequest400);
                return false;
            }
            let host = self
                .req
                .hostname
                .split(':')
                .next()
                .unwrap_or(&self.req.hostname);
            if !host.eq_ignore_ascii_case(expected) {
                log::warn!(
                    "request rejected: Host mismatch (got {}, expected {})",
                    host,
                    expected
                );
                self.send_error(HttpStatus::BadRequest400);
                return false;
            }
        }

        if let Some(token) = &cfg.r2h_token {
            let presented = self
                .req
                .query()
                .and_then(|q| http::query_param(q, "r2h-token"))
                .and_then(http::url_decode);
            if presented.as_deref() != Some(token.as_str()) {
                log::warn!("request rejected: missing or invalid r2h-token");
                self.send_error(HttpStatus::Unauthorized401);
                return false;
            }
        }
        true
    }

    fn serve_status_page(&mut self) {
        self.send_headers(
            HttpStatus::Ok200,
            ContentType::Html,
            Some(&format!(
                "Content-Length: {}\r\n",
                crate::status::STATUS_PAGE_HTML.len()
            )),
        );
        self.queue_control(crate::status::STATUS_PAGE_HTML.as_bytes(), true);
        self.state = ConnState::Closing;
    }

    fn serve_playlist(&mut self, cfg: &Config, services: &[Service]) {
        let host = if self.req.hostname.is_empty() {
            cfg.listen.to_string()
        } else {
            self.req.hostname.clone()
        };
        let playlist = m3u::build_playlist(services, &host);
        self.send_headers(
            HttpStatus::Ok200,
            ContentType::M3u,
            Some(&format!("Content-Length: {}\r\n", playlist.len())),
        );
        self.queue_control(playlist.as_bytes(), true);
        self.state = ConnState::Closing;
    }

    fn start_sse(&mut self, now: i64) {
        self.send_headers(HttpStatus::Ok200, ContentType::Sse, None);
        self.sse.active = true;
        self.sse.last_log_seq = 0;
        self.state = ConnState::Streaming;
        self.push_sse(now);
    }

    /// Build and queue one SSE snapshot frame.
    pub fn push_sse(&mut self, now: i64) {
        if !self.sse.active {
            return;
        }
        let json = self.status.build_sse_json(&mut self.sse.last_log_seq);
        let frame = format!("data: {}\n\n", json);
        self.queue_control(frame.as_bytes(), true);
        self.sse.last_beat_ms = now;
    }

    fn api_disconnect(&mut self) {
        let body = String::from_utf8_lossy(&self.req.body).into_owned();
        let ok = http::query_param(&body, "client_id")
            .and_then(|v| v.parse::<i32>().ok())
            .map(|idx| self.status.request_disconnect(idx))
            .unwrap_or(false);
        self.respond_json(if ok { "{\"ok\":true}" } else { "{\"ok\":false}" });
    }

    fn api_log_level(&mut self) {
        let body = String::from_utf8_lossy(&self.req.body).into_owned();
        let level = http::query_param(&body, "level").and_then(crate::status::parse_level);
        match level {
            Some(level) => {
                self.status.set_log_level(level);
                log::info!("log level changed to {}", level);
                self.respond_json("{\"ok\":true}");
            }
            None => self.respond_json("{\"ok\":false}"),
        }
    }

    fn respond_json(&mut self, body: &str) {
        self.send_headers(
            HttpStatus::Ok200,
            ContentType::Json,
            Some(&format!("Content-Length: {}\r\n", body.len())),
        );
        self.queue_control(body.as_bytes(), true);
        self.state = ConnState::Closing;
    }

    // ------------------------------------------------------------------
    // Output
    // ------------------------------------------------------------------

    pub fn send_headers(&mut self, status: HttpStatus, ctype: ContentType, extra: Option<&str>) {
        let headers = http::build_headers(status, ctype, extra);
        self.queue_control(&headers, true);
    }

    /// Queue a 4xx/5xx response and move to Closing.
    pub fn send_error(&mut self, status: HttpStatus) {
        let response = http::build_error_response(status);
        self.queue_control(&response, true);
        self.state = ConnState::Closing;
    }

    /// Copy control-plane data into pool buffers and queue it. Control
    /// traffic flushes immediately.
    pub fn queue_control(&mut self, data: &[u8], flush: bool) -> bool {
        let now = crate::now_ms();
        for chunk in data.chunks(BUFFER_SIZE) {
            let buf = if self.control_class {
                self.pools.alloc_control()
            } else {
                self.pools.alloc_media()
            };
            let Some(buf) = buf else {
                log::warn!("buffer pool exhausted, dropping {} control bytes", data.len());
                return false;
            };
            buf.fill(chunk);
            self.sendq.enqueue_buffer(&buf, now);
        }
        if flush {
            self.request_writeout();
        }
        true
    }

    /// Queue one media buffer, applying the queue-limit controller. On limit
    /// excess the unit is dropped (never a disconnect).
    pub fn queue_media(&mut self, buf: &BufRef, now: i64) -> Result<usize, StreamError> {
        if buf.len() == 0 {
            return Ok(0);
        }
        let was_slow = self.controller.slow_active;
        let limit = self.controller.update(
            &self.pools.media,
            self.pools.active_streams(),
            self.sendq.num_queued(),
            now,
        );
        if self.controller.slow_active != was_slow {
            if self.controller.slow_active {
                log::warn!("{} flagged slow (EWMA {:.0} bytes)", self.peer, self.controller.avg_bytes);
                self.pools.note_slow_entered();
            } else {
                log::info!("{} recovered from slow state", self.peer);
                self.pools.note_slow_exited();
            }
        }

        let queued_bytes = self.sendq.num_queued() * BUFFER_SIZE;
        if queued_bytes + buf.len() > limit {
            self.record_drop(buf.len());
            return Err(StreamError::Backpressure);
        }

        self.sendq.enqueue_buffer(buf, now);

        let queued_bytes = (self.sendq.num_queued() * BUFFER_SIZE) as u64;
        if queued_bytes > self.queue_bytes_hw {
            self.queue_bytes_hw = queued_bytes;
        }
        if self.sendq.num_queued() as u32 > self.queue_buffers_hw {
            self.queue_buffers_hw = self.sendq.num_queued() as u32;
        }
        self.report_queue();

        // Batching: only request writability once a flush is due; until then
        // enqueued data sits accumulating.
        if self.sendq.should_flush(now) {
            self.request_writeout();
        }
        Ok(buf.len())
    }

    fn record_drop(&mut self, len: usize) {
        self.dropped_packets += 1;
        self.dropped_bytes += len as u64;
        self.backpressure_events += 1;
        if self.backpressure_events == 1 || self.backpressure_events % 200 == 0 {
            log::debug!(
                "backpressure: dropping {} bytes for {} (queued={} limit={} drops={})",
                len,
                self.peer,
                self.sendq.num_queued() * BUFFER_SIZE,
                self.controller.limit_bytes,
                self.dropped_packets
            );
        }
        self.report_queue();
    }

    /// Push queue counters into this client's status cell.
    pub fn report_queue(&self) {
        if self.status_index < 0 {
            return;
        }
        self.status.update_queue(
            self.status_index,
            &QueueReport {
                queue_bytes: (self.sendq.num_queued() * BUFFER_SIZE) as u64,
                queue_buffers: self.sendq.num_queued() as u32,
                queue_limit_bytes: self.controller.limit_bytes as u64,
                queue_bytes_highwater: self.queue_bytes_hw,
                queue_buffers_highwater: self.queue_buffers_hw,
                dropped_packets: self.dropped_packets,
                dropped_bytes: self.dropped_bytes,
                backpressure_events: self.backpressure_events,
                slow: self.controller.slow_active,
            },
        );
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    /// Client socket writable: drain as much as the kernel accepts.
    pub fn handle_write(&mut self, now: i64) -> WriteResult {
        if self.sendq.is_empty() {
            self.clear_writeout();
            self.report_queue();
            if self.state == ConnState::Closing && self.sendq.pending_empty() {
                return WriteResult::Closed;
            }
            return WriteResult::Idle;
        }

        match self.sendq.drain(self.fd(), self.zerocopy_enabled, now) {
            DrainStatus::Closed => {
                self.state = ConnState::Closing;
                self.report_queue();
                WriteResult::Closed
            }
            DrainStatus::Blocked => {
                self.report_queue();
                WriteResult::Blocked
            }
            DrainStatus::Drained(_) => {
                self.report_queue();
                if !self.sendq.is_empty() {
                    return WriteResult::Pending;
                }
                self.clear_writeout();
                if self.state == ConnState::Closing && self.sendq.pending_empty() {
                    return WriteResult::Closed;
                }
                WriteResult::Idle
            }
        }
    }

    /// MSG_ZEROCOPY completion notifications arrived on the error queue.
    pub fn handle_completions(&mut self) -> std::io::Result<usize> {
        let n = self.sendq.handle_completions(self.fd())?;
        if n > 0 {
            self.report_queue();
        }
        Ok(n)
    }

    /// Destruction gate: Closing and both queue lists empty.
    pub fn ready_to_free(&self) -> bool {
        self.state == ConnState::Closing && self.sendq.fully_drained()
    }

    /// Final accounting on teardown; the worker removes fds and drops us.
    pub fn on_free(&mut self) {
        if self.stream_registered {
            self.pools.unregister_stream_client();
            self.stream_registered = false;
        }
        if self.controller.slow_active {
            self.pools.note_slow_exited();
            self.controller.slow_active = false;
        }
        self.sendq.clear();
        if self.status_index >= 0 {
            let bytes = self
                .stream
                .as_ref()
                .map(|s| s.total_bytes_sent)
                .unwrap_or(0);
            self.status.unregister_client(self.status_index, bytes);
            self.status_index = -1;
        }
        self.pools.try_shrink();
    }
}
