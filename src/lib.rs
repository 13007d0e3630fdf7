//! **tsgate** turns an operator's IPTV multicast network into plain HTTP.
//!
//! The gateway ingests live streams over multicast RTP/UDP (optionally
//! primed by a vendor Fast Channel Change server) or RTSP, and re-serves
//! them to any number of HTTP clients as open-ended MPEG-TS bodies. It is
//! built for constrained edge devices that already sit on the IPTV VLAN:
//! consumer routers, small ARM boxes.
//!
//! # Architecture
//!
//! N worker threads share a port via `SO_REUSEPORT`; each worker owns one
//! epoll instance and drives all of its connections and upstream sockets
//! from a single thread:
//!
//! - [`poller`]: thin epoll wrapper (level-triggered, interest toggling)
//! - [`pool`]: refcounted fixed-size buffer pool with elastic capacity
//! - [`sendq`]: per-connection zero-copy send queue (`sendmsg` scatter-gather,
//!   `MSG_ZEROCOPY` completion tracking, `sendfile` segments)
//! - [`connection`]: HTTP lifecycle plus the queue-limit backpressure controller
//! - [`rtp`]: RTP payload extraction and the 16-slot reordering window
//! - [`fcc`]: Fast Channel Change rendezvous state machine
//! - [`rtsp`]: RTSP client session (interleaved TCP or UDP media)
//! - [`stream`]: per-client composition of the above
//! - [`worker`]: the event loop tying everything together
//!
//! There are no locks on the media path; the only cross-worker state is the
//! [`status`] region (single-writer cells) used by the status page and SSE.

pub mod config;
pub mod connection;
pub mod error;
pub mod fcc;
pub mod fetch;
pub mod http;
pub mod m3u;
pub mod multicast;
pub mod poller;
pub mod pool;
pub mod rtp;
pub mod rtsp;
pub mod sendq;
pub mod service;
pub mod sock;
pub mod status;
pub mod stream;
pub mod worker;

/// Monotonic milliseconds since an unspecified epoch.
///
/// All engine timers (reorder timeout, FCC fallbacks, keepalives, bandwidth
/// snapshots) run off this clock so wall-clock jumps cannot fire them.
pub fn now_ms() -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid out-pointer; CLOCK_MONOTONIC is always available
    // on the kernels this crate targets.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        return 0;
    }
    ts.tv_sec as i64 * 1000 + ts.tv_nsec as i64 / 1_000_000
}

/// Wall-clock milliseconds since the Unix epoch (status page timestamps).
pub fn realtime_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
