// src/status.rs - Shared status region, SSE payloads, status page
//
// One cell per streaming client, single-writer: only the worker owning the
// client writes its counters, any thread may read. Identity fields (address,
// display URL) are written once at registration under a short mutex that is
// never taken on the media path. Workers are woken for SSE updates and
// disconnect requests through per-worker notification pipes registered in
// their epoll.

use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const STATUS_MAX_CLIENTS: usize = 256;
pub const STATUS_MAX_LOG_ENTRIES: usize = 100;

/// Notification bytes written to worker pipes.
pub const EVENT_SSE_UPDATE: u8 = 1;
pub const EVENT_DISCONNECT_REQUEST: u8 = 2;

/// Client state shown on the status page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientState {
    Connecting = 0,
    FccRequested,
    FccUnicastPending,
    FccUnicastActive,
    FccMcastRequested,
    FccMcastActive,
    RtspConnecting,
    RtspHandshaking,
    RtspPlaying,
    RtspTeardown,
    Error,
}

impl ClientState {
    pub fn name(self) -> &'static str {
        match self {
            ClientState::Connecting => "connecting",
            ClientState::FccRequested => "fcc-requested",
            ClientState::FccUnicastPending => "fcc-unicast-pending",
            ClientState::FccUnicastActive => "fcc-unicast-active",
            ClientState::FccMcastRequested => "fcc-mcast-requested",
            ClientState::FccMcastActive => "mcast-active",
            ClientState::RtspConnecting => "rtsp-connecting",
            ClientState::RtspHandshaking => "rtsp-handshaking",
            ClientState::RtspPlaying => "rtsp-playing",
            ClientState::RtspTeardown => "rtsp-teardown",
            ClientState::Error => "error",
        }
    }

    fn from_u8(v: u8) -> ClientState {
        match v {
            1 => ClientState::FccRequested,
            2 => ClientState::FccUnicastPending,
            3 => ClientState::FccUnicastActive,
            4 => ClientState::FccMcastRequested,
            5 => ClientState::FccMcastActive,
            6 => ClientState::RtspConnecting,
            7 => ClientState::RtspHandshaking,
            8 => ClientState::RtspPlaying,
            9 => ClientState::RtspTeardown,
            10 => ClientState::Error,
            _ => ClientState::Connecting,
        }
    }
}

/// Queue counters reported after every enqueue/drop/completion.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueReport {
    pub queue_bytes: u64,
    pub queue_buffers: u32,
    pub queue_limit_bytes: u64,
    pub queue_bytes_highwater: u64,
    pub queue_buffers_highwater: u32,
    pub dropped_packets: u64,
    pub dropped_bytes: u64,
    pub backpressure_events: u32,
    pub slow: bool,
}

#[derive(Default)]
struct ClientIdent {
    addr: String,
    url: String,
}

struct ClientCell {
    active: AtomicBool,
    disconnect_requested: AtomicBool,
    state: AtomicU8,
    worker: AtomicU32,
    connect_time_ms: AtomicI64,
    bytes_sent: AtomicU64,
    bandwidth: AtomicU32,
    queue_bytes: AtomicU64,
    queue_buffers: AtomicU32,
    queue_limit: AtomicU64,
    queue_bytes_hw: AtomicU64,
    queue_buffers_hw: AtomicU32,
    dropped_packets: AtomicU64,
    dropped_bytes: AtomicU64,
    backpressure_events: AtomicU32,
    slow: AtomicBool,
    ident: Mutex<ClientIdent>,
}

impl ClientCell {
    fn new() -> Self {
        ClientCell {
            active: AtomicBool::new(false),
            disconnect_requested: AtomicBool::new(false),
            state: AtomicU8::new(0),
            worker: AtomicU32::new(0),
            connect_time_ms: AtomicI64::new(0),
            bytes_sent: AtomicU64::new(0),
            bandwidth: AtomicU32::new(0),
            queue_bytes: AtomicU64::new(0),
            queue_buffers: AtomicU32::new(0),
            queue_limit: AtomicU64::new(0),
            queue_bytes_hw: AtomicU64::new(0),
            queue_buffers_hw: AtomicU32::new(0),
            dropped_packets: AtomicU64::new(0),
            dropped_bytes: AtomicU64::new(0),
            backpressure_events: AtomicU32::new(0),
            slow: AtomicBool::new(false),
            ident: Mutex::new(ClientIdent::default()),
        }
    }

    fn reset_counters(&self) {
        self.state.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.bandwidth.store(0, Ordering::Relaxed);
        self.queue_bytes.store(0, Ordering::Relaxed);
        self.queue_buffers.store(0, Ordering::Relaxed);
        self.queue_limit.store(0, Ordering::Relaxed);
        self.queue_bytes_hw.store(0, Ordering::Relaxed);
        self.queue_buffers_hw.store(0, Ordering::Relaxed);
        self.dropped_packets.store(0, Ordering::Relaxed);
        self.dropped_bytes.store(0, Ordering::Relaxed);
        self.backpressure_events.store(0, Ordering::Relaxed);
        self.slow.store(false, Ordering::Relaxed);
        self.disconnect_requested.store(false, Ordering::Relaxed);
    }
}

struct LogEntry {
    seq: u64,
    timestamp_ms: i64,
    level: log::Level,
    message: String,
}

#[derive(Default)]
struct LogRing {
    entries: VecDeque<LogEntry>,
    next_seq: u64,
}

pub struct StatusShared {
    pub start_time_ms: i64,
    total_clients: AtomicUsize,
    cumulative_bytes: AtomicU64,
    clients: Vec<ClientCell>,
    log_ring: Mutex<LogRing>,
    notif_pipes: Mutex<Vec<RawFd>>,
    log_level: AtomicU8,
}

impl StatusShared {
    pub fn new(start_time_ms: i64) -> Arc<StatusShared> {
        Arc::new(StatusShared {
            start_time_ms,
            total_clients: AtomicUsize::new(0),
            cumulative_bytes: AtomicU64::new(0),
            clients: (0..STATUS_MAX_CLIENTS).map(|_| ClientCell::new()).collect(),
            log_ring: Mutex::new(LogRing::default()),
            notif_pipes: Mutex::new(Vec::new()),
            log_level: AtomicU8::new(level_to_u8(log::max_level())),
        })
    }

    /// Allocate a status slot for a new streaming client. Returns -1 when
    /// the table is full (the client still streams, just untracked).
    pub fn register_client(&self, addr: &str, url: &str, worker: usize, now_ms: i64) -> i32 {
        for (i, cell) in self.clients.iter().enumerate() {
            if cell
                .active
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                cell.reset_counters();
                cell.worker.store(worker as u32, Ordering::Relaxed);
                cell.connect_time_ms.store(now_ms, Ordering::Relaxed);
                {
                    let mut ident = cell.ident.lock().expect("ident lock");
                    ident.addr = addr.to_string();
                    ident.url = url.to_string();
                }
                self.total_clients.fetch_add(1, Ordering::AcqRel);
                self.trigger_event(EVENT_SSE_UPDATE);
                return i as i32;
            }
        }
        log::warn!("status table full, client {} untracked", addr);
        -1
    }

    pub fn unregister_client(&self, index: i32, bytes_sent: u64) {
        let Some(cell) = self.cell(index) else { return };
        self.cumulative_bytes.fetch_add(bytes_sent, Ordering::Relaxed);
        cell.active.store(false, Ordering::Release);
        self.total_clients.fetch_sub(1, Ordering::AcqRel);
        self.trigger_event(EVENT_SSE_UPDATE);
    }

    fn cell(&self, index: i32) -> Option<&ClientCell> {
        if index < 0 {
            return None;
        }
        self.clients.get(index as usize)
    }

    pub fn total_clients(&self) -> usize {
        self.total_clients.load(Ordering::Acquire)
    }

    pub fn update_state(&self, index: i32, state: ClientState) {
        if let Some(cell) = self.cell(index) {
            cell.state.store(state as u8, Ordering::Relaxed);
            self.trigger_event(EVENT_SSE_UPDATE);
        }
    }

    pub fn update_bytes(&self, index: i32, bytes_sent: u64, bandwidth: u32) {
        if let Some(cell) = self.cell(index) {
            cell.bytes_sent.store(bytes_sent, Ordering::Relaxed);
            cell.bandwidth.store(bandwidth, Ordering::Relaxed);
            self.trigger_event(EVENT_SSE_UPDATE);
        }
    }

    pub fn update_queue(&self, index: i32, report: &QueueReport) {
        let Some(cell) = self.cell(index) else { return };
        cell.queue_bytes.store(report.queue_bytes, Ordering::Relaxed);
        cell.queue_buffers.store(report.queue_buffers, Ordering::Relaxed);
        cell.queue_limit.store(report.queue_limit_bytes, Ordering::Relaxed);
        cell.queue_bytes_hw
            .store(report.queue_bytes_highwater, Ordering::Relaxed);
        cell.queue_buffers_hw
            .store(report.queue_buffers_highwater, Ordering::Relaxed);
        cell.dropped_packets
            .store(report.dropped_packets, Ordering::Relaxed);
        cell.dropped_bytes.store(report.dropped_bytes, Ordering::Relaxed);
        cell.backpressure_events
            .store(report.backpressure_events, Ordering::Relaxed);
        cell.slow.store(report.slow, Ordering::Relaxed);
    }

    /// API request: flag a client for disconnection; its worker acts on the
    /// next notification.
    pub fn request_disconnect(&self, index: i32) -> bool {
        let Some(cell) = self.cell(index) else {
            return false;
        };
        if !cell.active.load(Ordering::Acquire) {
            return false;
        }
        cell.disconnect_requested.store(true, Ordering::Release);
        self.trigger_event(EVENT_DISCONNECT_REQUEST);
        true
    }

    /// Check-and-clear the disconnect flag (called by the owning worker).
    pub fn take_disconnect_request(&self, index: i32) -> bool {
        match self.cell(index) {
            Some(cell) => cell.disconnect_requested.swap(false, Ordering::AcqRel),
            None => false,
        }
    }

    pub fn set_log_level(&self, level: log::LevelFilter) {
        log::set_max_level(level);
        self.log_level.store(level_to_u8(level), Ordering::Relaxed);
    }

    pub fn log_level_name(&self) -> &'static str {
        u8_to_level(self.log_level.load(Ordering::Relaxed)).as_str()
    }

    /// Register a worker's notification pipe write end.
    pub fn add_notif_pipe(&self, write_fd: RawFd) {
        self.notif_pipes.lock().expect("pipe lock").push(write_fd);
    }

    /// Wake every worker with an event byte. Writes are non-blocking; a full
    /// pipe already guarantees a pending wakeup.
    pub fn trigger_event(&self, event: u8) {
        let pipes = self.notif_pipes.lock().expect("pipe lock");
        for &fd in pipes.iter() {
            // SAFETY: one-byte write to an owned pipe fd; errors ignored.
            unsafe {
                libc::write(fd, &event as *const u8 as *const libc::c_void, 1);
            }
        }
    }

    pub fn push_log(&self, level: log::Level, message: String) {
        let mut ring = self.log_ring.lock().expect("log lock");
        let seq = ring.next_seq;
        ring.next_seq += 1;
        if ring.entries.len() >= STATUS_MAX_LOG_ENTRIES {
            ring.entries.pop_front();
        }
        ring.entries.push_back(LogEntry {
            seq,
            timestamp_ms: crate::realtime_ms(),
            level,
            message,
        });
    }

    /// Build one SSE JSON snapshot. Log entries newer than `last_log_seq`
    /// are included and the cursor advanced.
    pub fn build_sse_json(&self, last_log_seq: &mut u64) -> String {
        let mut out = String::with_capacity(2048);
        out.push_str("{\"clients\":[");
        let mut first = true;
        for (i, cell) in self.clients.iter().enumerate() {
            if !cell.active.load(Ordering::Acquire) {
                continue;
            }
            if !first {
                out.push(',');
            }
            first = false;
            let (addr, url) = {
                let ident = cell.ident.lock().expect("ident lock");
                (ident.addr.clone(), ident.url.clone())
            };
            let state = ClientState::from_u8(cell.state.load(Ordering::Relaxed));
            out.push_str(&format!(
                "{{\"id\":{},\"addr\":\"{}\",\"url\":\"{}\",\"state\":\"{}\",\"worker\":{},\
                 \"connect_time\":{},\"bytes\":{},\"bandwidth\":{},\"queue_bytes\":{},\
                 \"queue_limit\":{},\"queue_bytes_hw\":{},\"dropped\":{},\"dropped_bytes\":{},\
                 \"backpressure\":{},\"slow\":{}}}",
                i,
                json_escape(&addr),
                json_escape(&url),
                state.name(),
                cell.worker.load(Ordering::Relaxed),
                cell.connect_time_ms.load(Ordering::Relaxed),
                cell.bytes_sent.load(Ordering::Relaxed),
                cell.bandwidth.load(Ordering::Relaxed),
                cell.queue_bytes.load(Ordering::Relaxed),
                cell.queue_limit.load(Ordering::Relaxed),
                cell.queue_bytes_hw.load(Ordering::Relaxed),
                cell.dropped_packets.load(Ordering::Relaxed),
                cell.dropped_bytes.load(Ordering::Relaxed),
                cell.backpressure_events.load(Ordering::Relaxed),
                cell.slow.load(Ordering::Relaxed),
            ));
        }
        out.push_str(&format!(
            "],\"total_clients\":{},\"cumulative_bytes\":{},\"uptime_ms\":{},\"log_level\":\"{}\",\"logs\":[",
            self.total_clients(),
            self.cumulative_bytes.load(Ordering::Relaxed),
            crate::realtime_ms() - self.start_time_ms,
            self.log_level_name(),
        ));
        {
            let ring = self.log_ring.lock().expect("log lock");
            let mut first = true;
            for entry in ring.entries.iter().filter(|e| e.seq >= *last_log_seq) {
                if !first {
                    out.push(',');
                }
                first = false;
                out.push_str(&format!(
                    "{{\"ts\":{},\"level\":\"{}\",\"msg\":\"{}\"}}",
                    entry.timestamp_ms,
                    entry.level,
                    json_escape(&entry.message)
                ));
            }
            *last_log_seq = ring.next_seq;
        }
        out.push_str("]}");
        out
    }
}

fn level_to_u8(level: log::LevelFilter) -> u8 {
    match level {
        log::LevelFilter::Off => 0,
        log::LevelFilter::Error => 1,
        log::LevelFilter::Warn => 2,
        log::LevelFilter::Info => 3,
        log::LevelFilter::Debug => 4,
        log::LevelFilter::Trace => 5,
    }
}

fn u8_to_level(v: u8) -> log::LevelFilter {
    match v {
        0 => log::LevelFilter::Off,
        1 => log::LevelFilter::Error,
        2 => log::LevelFilter::Warn,
        4 => log::LevelFilter::Debug,
        5 => log::LevelFilter::Trace,
        _ => log::LevelFilter::Info,
    }
}

/// Parse a level name or numeric value from the log-level API.
pub fn parse_level(value: &str) -> Option<log::LevelFilter> {
    match value.to_ascii_lowercase().as_str() {
        "0" | "off" => Some(log::LevelFilter::Off),
        "1" | "error" => Some(log::LevelFilter::Error),
        "2" | "warn" => Some(log::LevelFilter::Warn),
        "3" | "info" => Some(log::LevelFilter::Info),
        "4" | "debug" => Some(log::LevelFilter::Debug),
        "5" | "trace" => Some(log::LevelFilter::Trace),
        _ => None,
    }
}

fn json_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

/// Logger that forwards to env_logger and mirrors records into the status
/// log ring so the status page shows recent activity.
pub struct GatewayLogger {
    inner: env_logger::Logger,
    shared: Arc<StatusShared>,
}

impl GatewayLogger {
    /// Install as the global logger. The env_logger instance should be built
    /// with a permissive filter; `initial` sets the effective level, which
    /// the log-level API can change at runtime via `set_log_level`.
    pub fn install(inner: env_logger::Logger, shared: Arc<StatusShared>, initial: log::LevelFilter) {
        shared.log_level.store(level_to_u8(initial), Ordering::Relaxed);
        let logger = GatewayLogger { inner, shared };
        if log::set_boxed_logger(Box::new(logger)).is_ok() {
            log::set_max_level(initial);
        }
    }
}

impl log::Log for GatewayLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if record.level() > log::max_level() {
            return;
        }
        self.inner.log(record);
        self.shared
            .push_log(record.level(), format!("{}", record.args()));
    }

    fn flush(&self) {
        self.inner.flush()
    }
}

/// The status page: a self-contained document that subscribes to the SSE
/// feed and renders the client table. The full operator UI is an external
/// application; this page covers diagnostics.
pub const STATUS_PAGE_HTML: &str = r#"<!DOCTYPE html>
<html><head><meta charset="utf-8"><title>tsgate status</title>
<style>
body{font-family:sans-serif;margin:1em;background:#111;color:#ddd}
table{border-collapse:collapse;width:100%}
td,th{border:1px solid #444;padding:4px 8px;font-size:13px;text-align:left}
th{background:#222}
.slow{color:#f66}
#logs{font-family:monospace;font-size:12px;white-space:pre-wrap;margin-top:1em}
</style></head>
<body>
<h2>tsgate</h2>
<div id="totals"></div>
<table><thead><tr>
<th>#</th><th>client</th><th>url</th><th>state</th><th>worker</th><th>sent</th>
<th>bw</th><th>queue</th><th>drops</th><th>slow</th><th></th>
</tr></thead><tbody id="clients"></tbody></table>
<div id="logs"></div>
<script>
const fmt=n=>n>1048576?(n/1048576).toFixed(1)+"M":n>1024?(n/1024).toFixed(1)+"K":n;
const es=new EventSource("sse");
es.onmessage=e=>{
  const d=JSON.parse(e.data);
  document.getElementById("totals").textContent=
    d.total_clients+" client(s), log level "+d.log_level;
  document.getElementById("clients").innerHTML=d.clients.map(c=>
    "<tr><td>"+c.id+"</td><td>"+c.addr+"</td><td>"+c.url+"</td><td>"+c.state+
    "</td><td>"+c.worker+"</td><td>"+fmt(c.bytes)+"</td><td>"+fmt(c.bandwidth)+
    "/s</td><td>"+fmt(c.queue_bytes)+"/"+fmt(c.queue_limit)+"</td><td>"+c.dropped+
    "</td><td"+(c.slow?" class=slow>slow":">")+"</td>"+
    "<td><button onclick=\"disconnectClient("+c.id+")\">kick</button></td></tr>").join("");
  const logs=document.getElementById("logs");
  for(const l of d.logs){logs.textContent+=l.level+" "+l.msg+"\n";}
  logs.scrollTop=logs.scrollHeight;
};
function disconnectClient(id){
  fetch("api/disconnect",{method:"POST",headers:{"Content-Type":"application/x-www-form-urlencoded"},body:"client_id="+id});
}
</script></body></html>
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_unregister_cycle() {
        let shared = StatusShared::new(0);
        let idx = shared.register_client("10.0.0.1:4242", "/ch1", 0, 100);
        assert!(idx >= 0);
        assert_eq!(shared.total_clients(), 1);

        shared.update_state(idx, ClientState::FccMcastActive);
        shared.update_bytes(idx, 1_000_000, 500_000);

        shared.unregister_client(idx, 1_000_000);
        assert_eq!(shared.total_clients(), 0);

        // Slot is reusable.
        let idx2 = shared.register_client("10.0.0.2:4243", "/ch2", 1, 200);
        assert_eq!(idx, idx2);
    }

    #[test]
    fn test_table_full_returns_unregistered() {
        let shared = StatusShared::new(0);
        let mut slots = Vec::new();
        for i in 0..STATUS_MAX_CLIENTS {
            let idx = shared.register_client("a", "u", 0, i as i64);
            assert!(idx >= 0);
            slots.push(idx);
        }
        assert_eq!(shared.register_client("late", "u", 0, 0), -1);
        for idx in slots {
            shared.unregister_client(idx, 0);
        }
    }

    #[test]
    fn test_disconnect_request_roundtrip() {
        let shared = StatusShared::new(0);
        let idx = shared.register_client("c", "/x", 0, 0);
        assert!(!shared.take_disconnect_request(idx));
        assert!(shared.request_disconnect(idx));
        assert!(shared.take_disconnect_request(idx));
        // Cleared after take.
        assert!(!shared.take_disconnect_request(idx));
        // Unknown/inactive indices refuse.
        assert!(!shared.request_disconnect(-1));
        assert!(!shared.request_disconnect(STATUS_MAX_CLIENTS as i32 + 5));
    }

    #[test]
    fn test_sse_json_contains_client_and_logs() {
        let shared = StatusShared::new(0);
        let idx = shared.register_client("10.1.1.1:9000", "/tv\"quoted\"", 2, 0);
        shared.update_queue(
            idx,
            &QueueReport {
                queue_bytes: 4096,
                dropped_packets: 7,
                slow: true,
                ..Default::default()
            },
        );
        shared.push_log(log::Level::Info, "hello \"log\"".into());

        let mut cursor = 0u64;
        let json = shared.build_sse_json(&mut cursor);
        assert!(json.contains("\"addr\":\"10.1.1.1:9000\""));
        assert!(json.contains("\\\"quoted\\\""));
        assert!(json.contains("\"dropped\":7"));
        assert!(json.contains("\"slow\":true"));
        assert!(json.contains("hello \\\"log\\\""));
        assert_eq!(cursor, 1);

        // Cursor advanced: same logs are not resent.
        let json2 = shared.build_sse_json(&mut cursor);
        assert!(!json2.contains("hello"));
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug"), Some(log::LevelFilter::Debug));
        assert_eq!(parse_level("2"), Some(log::LevelFilter::Warn));
        assert_eq!(parse_level("bogus"), None);
    }

    #[test]
    fn test_log_ring_bounded() {
        let shared = StatusShared::new(0);
        for i in 0..(STATUS_MAX_LOG_ENTRIES + 50) {
            shared.push_log(log::Level::Debug, format!("entry {}", i));
        }
        let mut cursor = 0u64;
        let json = shared.build_sse_json(&mut cursor);
        // Oldest entries were evicted.
        assert!(!json.contains("\"msg\":\"entry 0\""));
        assert!(json.contains(&format!("entry {}", STATUS_MAX_LOG_ENTRIES + 49)));
    }
}
