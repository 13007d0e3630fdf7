// src/rtsp.rs - RTSP client session
//
// Drives OPTIONS -> DESCRIBE -> SETUP -> PLAY against the upstream server
// over a non-blocking TCP control socket; every transition is triggered by
// the 2xx response to the outstanding CSeq. Media arrives either interleaved
// on the control socket ($<channel><len16> framing) or on a separate UDP
// port pair. TEARDOWN is asynchronous: stream teardown waits for the
// response (bounded) before the context is destroyed.

use crate::sock;
use crate::status::{ClientState, StatusShared};
use std::io;
use std::net::{SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Bound on waiting for the TEARDOWN response.
pub const TEARDOWN_TIMEOUT_MS: i64 = 2000;
/// Give up on an unresponsive control connection during the handshake.
pub const HANDSHAKE_TIMEOUT_MS: i64 = 10_000;

const RTSP_DEFAULT_PORT: u16 = 554;
const CONTROL_BUF_MAX: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtspState {
    Idle,
    Connecting,
    OptionsSent,
    DescribeSent,
    SetupSent,
    PlaySent,
    Playing,
    Teardown,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtspTransport {
    Interleaved,
    Udp,
}

/// Outcome of a control-socket event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtspEvent {
    Continue,
    /// Fatal: close the client stream.
    CloseStream,
    /// Graceful TEARDOWN finished; deferred destruction may proceed.
    TeardownComplete,
}

pub(crate) struct ParsedMessage {
    pub code: u16,
    pub cseq: Option<u32>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub consumed: usize,
}

impl ParsedMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Parse one complete RTSP response from the head of `buf`, if present.
pub(crate) fn parse_message(buf: &[u8]) -> Option<ParsedMessage> {
    let head_end = buf.windows(4).position(|w| w == b"\r\n\r\n")?;
    let head = std::str::from_utf8(&buf[..head_end]).ok()?;
    let mut lines = head.split("\r\n");
    let status_line = lines.next()?;
    let mut parts = status_line.split_whitespace();
    let proto = parts.next()?;
    if !proto.starts_with("RTSP/") {
        return None;
    }
    let code: u16 = parts.next()?.parse().ok()?;

    let mut headers = Vec::new();
    let mut cseq = None;
    let mut content_length = 0usize;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().to_string();
        if name.eq_ignore_ascii_case("CSeq") {
            cseq = value.parse().ok();
        } else if name.eq_ignore_ascii_case("Content-Length") {
            content_length = value.parse().unwrap_or(0);
        }
        headers.push((name.trim().to_string(), value));
    }

    let body_start = head_end + 4;
    if buf.len() < body_start + content_length {
        return None;
    }
    Some(ParsedMessage {
        code,
        cseq,
        headers,
        body: buf[body_start..body_start + content_length].to_vec(),
        consumed: body_start + content_length,
    })
}

/// Split an rtsp:// URL into host, port and keep the full URL for requests.
pub(crate) fn parse_server_url(url: &str) -> Option<(String, u16)> {
    let rest = url.strip_prefix("rtsp://")?;
    let authority = rest.split(['/', '?']).next()?;
    if authority.is_empty() {
        return None;
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => Some((host.to_string(), port.parse().ok()?)),
        None => Some((authority.to_string(), RTSP_DEFAULT_PORT)),
    }
}

/// Extract the media control attribute from an SDP body and resolve it
/// against the base URL.
pub(crate) fn control_url_from_sdp(sdp: &str, base: &str) -> String {
    for line in sdp.lines() {
        let line = line.trim();
        if let Some(value) = line.strip_prefix("a=control:") {
            let value = value.trim();
            if value == "*" || value.is_empty() {
                return base.to_string();
            }
            if value.starts_with("rtsp://") {
                return value.to_string();
            }
            let sep = if base.ends_with('/') { "" } else { "/" };
            return format!("{}{}{}", base, sep, value);
        }
    }
    base.to_string()
}

/// Parse `Session: <id>[;timeout=<secs>]`; keepalives run at half the
/// server timeout.
pub(crate) fn parse_session_header(value: &str) -> (String, i64) {
    let mut parts = value.split(';');
    let id = parts.next().unwrap_or("").trim().to_string();
    let mut keepalive_ms = 0i64;
    for param in parts {
        if let Some(timeout) = param.trim().strip_prefix("timeout=") {
            if let Ok(secs) = timeout.trim().parse::<i64>() {
                keepalive_ms = (secs * 1000 / 2).max(1000);
            }
        }
    }
    (id, keepalive_ms)
}

pub struct RtspSession {
    pub state: RtspState,
    sock: Option<OwnedFd>,
    url: String,
    control_url: Option<String>,
    cseq: u32,
    pending_cseq: u32,
    pub session_id: String,
    pub transport: RtspTransport,
    pub rtp_sock: Option<OwnedFd>,
    pub rtcp_sock: Option<OwnedFd>,
    client_rtp_port: u16,
    pub keepalive_interval_ms: i64,
    pub last_keepalive_ms: i64,
    playseek: Option<String>,
    user_agent: Option<String>,
    inbuf: Vec<u8>,
    pub handshake_started_ms: i64,
    teardown_started_ms: i64,
    pub status_index: i32,
}

impl RtspSession {
    pub fn new(
        url: String,
        playseek: Option<String>,
        user_agent: Option<String>,
        prefer_udp: bool,
    ) -> RtspSession {
        RtspSession {
            state: RtspState::Idle,
            sock: None,
            url,
            control_url: None,
            cseq: 0,
            pending_cseq: 0,
            session_id: String::new(),
            transport: if prefer_udp {
                RtspTransport::Udp
            } else {
                RtspTransport::Interleaved
            },
            rtp_sock: None,
            rtcp_sock: None,
            client_rtp_port: 0,
            keepalive_interval_ms: 0,
            last_keepalive_ms: 0,
            playseek,
            user_agent,
            inbuf: Vec::with_capacity(2048),
            handshake_started_ms: 0,
            teardown_started_ms: 0,
            status_index: -1,
        }
    }

    pub fn sock_fd(&self) -> Option<RawFd> {
        self.sock.as_ref().map(|s| s.as_raw_fd())
    }

    pub fn rtp_fd(&self) -> Option<RawFd> {
        self.rtp_sock.as_ref().map(|s| s.as_raw_fd())
    }

    pub fn rtcp_fd(&self) -> Option<RawFd> {
        self.rtcp_sock.as_ref().map(|s| s.as_raw_fd())
    }

    /// Start the non-blocking connect. Returns the control fd for readiness
    /// registration.
    pub fn connect(
        &mut self,
        interface: Option<&str>,
        status: &StatusShared,
        now: i64,
    ) -> io::Result<RawFd> {
        let (host, port) = parse_server_url(&self.url)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "bad rtsp url"))?;
        let addr = (host.as_str(), port)
            .to_socket_addrs()?
            .find(|a| matches!(a, SocketAddr::V4(_)))
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address"))?;
        let SocketAddr::V4(addr) = addr else {
            unreachable!("filtered to v4 above")
        };

        // SAFETY: plain socket(), result checked.
        let fd = unsafe {
            libc::socket(
                libc::AF_INET,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd is valid and owned from here on.
        let sock = unsafe { OwnedFd::from_raw_fd(fd) };
        if let Some(ifname) = interface {
            sock::bind_to_interface(fd, ifname)?;
        }

        let sa = sock::sockaddr_in_from(addr);
        // SAFETY: sa is a fully initialized sockaddr_in.
        let rc = unsafe {
            libc::connect(
                fd,
                &sa as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINPROGRESS) {
                return Err(err);
            }
        }

        self.sock = Some(sock);
        self.state = RtspState::Connecting;
        self.handshake_started_ms = now;
        status.update_state(self.status_index, ClientState::RtspConnecting);
        log::debug!("RTSP: connecting to {} for {}", addr, self.url);
        Ok(fd)
    }

    fn send_raw(&mut self, data: &[u8]) -> io::Result<()> {
        let Some(sock) = self.sock.as_ref() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "no socket"));
        };
        // SAFETY: data pointer/length pair is valid.
        let rc = unsafe {
            libc::send(
                sock.as_raw_fd(),
                data.as_ptr() as *const libc::c_void,
                data.len(),
                libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        // Control messages are small; a short send here means the socket
        // buffer is pathologically full and the session is doomed anyway.
        if (rc as usize) < data.len() {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "short send"));
        }
        Ok(())
    }

    fn send_request(&mut self, method: &str, url: &str, extra: &str) -> io::Result<u32> {
        self.cseq += 1;
        let cseq = self.cseq;
        let mut req = format!("{} {} RTSP/1.0\r\nCSeq: {}\r\n", method, url, cseq);
        if let Some(agent) = &self.user_agent {
            req.push_str(&format!("User-Agent: {}\r\n", agent));
        }
        if !self.session_id.is_empty() {
            req.push_str(&format!("Session: {}\r\n", self.session_id));
        }
        req.push_str(extra);
        req.push_str("\r\n");
        self.send_raw(req.as_bytes())?;
        self.pending_cseq = cseq;
        log::debug!("RTSP: sent {} (CSeq {})", method, cseq);
        Ok(cseq)
    }

    /// Bind the UDP media pair (even RTP port, odd RTCP). Returns the fds
    /// for readiness registration.
    fn setup_udp_pair(&mut self) -> io::Result<(RawFd, RawFd)> {
        for _ in 0..16 {
            let rtp = sock::udp_socket(Some(SocketAddrV4::new(
                std::net::Ipv4Addr::UNSPECIFIED,
                0,
            )))?;
            let port = sock::local_port(rtp.as_raw_fd())?;
            let base = if port % 2 == 0 { port } else { port + 1 };
            let rtp = if port == base {
                rtp
            } else {
                match sock::udp_socket(Some(
                    SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, base),
                )) {
                    Ok(s) => s,
                    Err(_) => continue,
                }
            };
            match sock::udp_socket(Some(SocketAddrV4::new(
                std::net::Ipv4Addr::UNSPECIFIED,
                base + 1,
            ))) {
                Ok(rtcp) => {
                    let fds = (rtp.as_raw_fd(), rtcp.as_raw_fd());
                    self.client_rtp_port = base;
                    self.rtp_sock = Some(rtp);
                    self.rtcp_sock = Some(rtcp);
                    return Ok(fds);
                }
                Err(_) => continue,
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            "no free UDP port pair",
        ))
    }

    /// Control socket event. `udp_ready` receives the UDP media fds when a
    /// UDP transport is set up mid-handshake so the caller can register
    /// them. `media_sink` receives interleaved RTP frames.
    pub fn handle_control_event(
        &mut self,
        readable: bool,
        writable: bool,
        status: &StatusShared,
        udp_ready: &mut dyn FnMut(RawFd, RawFd),
        media_sink: &mut dyn FnMut(&[u8]),
    ) -> RtspEvent {
        if self.state == RtspState::Connecting && writable {
            let Some(fd) = self.sock_fd() else {
                return RtspEvent::CloseStream;
            };
            let mut err: libc::c_int = 0;
            let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
            // SAFETY: err/len form a valid out-parameter pair.
            let rc = unsafe {
                libc::getsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_ERROR,
                    &mut err as *mut libc::c_int as *mut libc::c_void,
                    &mut len,
                )
            };
            if rc < 0 || err != 0 {
                log::error!(
                    "RTSP: connect failed: {}",
                    io::Error::from_raw_os_error(err)
                );
                return RtspEvent::CloseStream;
            }
            status.update_state(self.status_index, ClientState::RtspHandshaking);
            if self.send_request("OPTIONS", &self.url.clone(), "").is_err() {
                return RtspEvent::CloseStream;
            }
            self.state = RtspState::OptionsSent;
        }

        if !readable {
            return RtspEvent::Continue;
        }

        // Drain the socket.
        loop {
            let Some(fd) = self.sock_fd() else {
                return RtspEvent::CloseStream;
            };
            let mut chunk = [0u8; 4096];
            // SAFETY: chunk is a valid writable buffer.
            let r = unsafe {
                libc::recv(
                    fd,
                    chunk.as_mut_ptr() as *mut libc::c_void,
                    chunk.len(),
                    libc::MSG_DONTWAIT,
                )
            };
            if r == 0 {
                return if self.state == RtspState::Teardown {
                    self.state = RtspState::Closed;
                    RtspEvent::TeardownComplete
                } else {
                    log::debug!("RTSP: server closed control connection");
                    RtspEvent::CloseStream
                };
            }
            if r < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EAGAIN) {
                    break;
                }
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return RtspEvent::CloseStream;
            }
            self.inbuf.extend_from_slice(&chunk[..r as usize]);
            if self.inbuf.len() > CONTROL_BUF_MAX {
                log::error!("RTSP: control buffer overflow");
                return RtspEvent::CloseStream;
            }
        }

        self.process_inbuf(status, udp_ready, media_sink)
    }

    /// Demultiplex the control buffer: interleaved `$`-framed media and
    /// RTSP responses can arrive back to back.
    pub(crate) fn process_inbuf(
        &mut self,
        status: &StatusShared,
        udp_ready: &mut dyn FnMut(RawFd, RawFd),
        media_sink: &mut dyn FnMut(&[u8]),
    ) -> RtspEvent {
        loop {
            if self.inbuf.is_empty() {
                return RtspEvent::Continue;
            }
            if self.inbuf[0] == b'$' {
                if self.inbuf.len() < 4 {
                    return RtspEvent::Continue;
                }
                let channel = self.inbuf[1];
                let len = u16::from_be_bytes([self.inbuf[2], self.inbuf[3]]) as usize;
                if self.inbuf.len() < 4 + len {
                    return RtspEvent::Continue;
                }
                if channel == 0 {
                    media_sink(&self.inbuf[4..4 + len]);
                }
                self.inbuf.drain(..4 + len);
                continue;
            }

            let Some(msg) = parse_message(&self.inbuf) else {
                // Not a complete response. Guard against desync: a buffer
                // that cannot ever parse is a protocol error.
                return RtspEvent::Continue;
            };
            self.inbuf.drain(..msg.consumed);
            match self.handle_response(msg, status, udp_ready) {
                RtspEvent::Continue => continue,
                other => return other,
            }
        }
    }

    fn handle_response(
        &mut self,
        msg: ParsedMessage,
        status: &StatusShared,
        udp_ready: &mut dyn FnMut(RawFd, RawFd),
    ) -> RtspEvent {
        if self.state == RtspState::Teardown {
            self.state = RtspState::Closed;
            return RtspEvent::TeardownComplete;
        }
        if let Some(cseq) = msg.cseq {
            if cseq != self.pending_cseq {
                log::debug!(
                    "RTSP: ignoring response CSeq {} (expected {})",
                    cseq,
                    self.pending_cseq
                );
                return RtspEvent::Continue;
            }
        }
        if self.state == RtspState::Playing {
            // Keepalive responses need no action.
            return RtspEvent::Continue;
        }
        if !(200..300).contains(&msg.code) {
            log::error!("RTSP: server returned {} in {:?}", msg.code, self.state);
            return RtspEvent::CloseStream;
        }

        match self.state {
            RtspState::OptionsSent => {
                let url = self.url.clone();
                if self
                    .send_request("DESCRIBE", &url, "Accept: application/sdp\r\n")
                    .is_err()
                {
                    return RtspEvent::CloseStream;
                }
                self.state = RtspState::DescribeSent;
                RtspEvent::Continue
            }
            RtspState::DescribeSent => {
                let sdp = String::from_utf8_lossy(&msg.body);
                self.control_url = Some(control_url_from_sdp(&sdp, &self.url));

                let transport_header = match self.transport {
                    RtspTransport::Interleaved => {
                        "Transport: RTP/AVP/TCP;interleaved=0-1\r\n".to_string()
                    }
                    RtspTransport::Udp => {
                        let (rtp_fd, rtcp_fd) = match self.setup_udp_pair() {
                            Ok(fds) => fds,
                            Err(e) => {
                                log::error!("RTSP: UDP pair setup failed: {}", e);
                                return RtspEvent::CloseStream;
                            }
                        };
                        udp_ready(rtp_fd, rtcp_fd);
                        format!(
                            "Transport: RTP/AVP;unicast;client_port={}-{}\r\n",
                            self.client_rtp_port,
                            self.client_rtp_port + 1
                        )
                    }
                };
                let setup_url = self
                    .control_url
                    .clone()
                    .unwrap_or_else(|| self.url.clone());
                if self
                    .send_request("SETUP", &setup_url, &transport_header)
                    .is_err()
                {
                    return RtspEvent::CloseStream;
                }
                self.state = RtspState::SetupSent;
                RtspEvent::Continue
            }
            RtspState::SetupSent => {
                if let Some(session) = msg.header("Session") {
                    let (id, keepalive) = parse_session_header(session);
                    self.session_id = id;
                    self.keepalive_interval_ms = keepalive;
                }
                let range = match &self.playseek {
                    Some(seek) => {
                        let seek = if seek.contains('-') {
                            seek.clone()
                        } else {
                            format!("{}-", seek)
                        };
                        format!("Range: npt={}\r\n", seek)
                    }
                    None => String::new(),
                };
                let url = self.url.clone();
                if self.send_request("PLAY", &url, &range).is_err() {
                    return RtspEvent::CloseStream;
                }
                self.state = RtspState::PlaySent;
                RtspEvent::Continue
            }
            RtspState::PlaySent => {
                self.state = RtspState::Playing;
                status.update_state(self.status_index, ClientState::RtspPlaying);
                log::info!("RTSP: playing {}", self.url);
                RtspEvent::Continue
            }
            _ => RtspEvent::Continue,
        }
    }

    /// Periodic keepalive (UDP transport only; the interleaved control
    /// socket carries media and keeps the session alive by itself).
    pub fn maybe_keepalive(&mut self, now: i64) {
        if self.state != RtspState::Playing
            || self.transport != RtspTransport::Udp
            || self.keepalive_interval_ms <= 0
            || self.session_id.is_empty()
        {
            return;
        }
        if self.last_keepalive_ms == 0 {
            self.last_keepalive_ms = now;
            return;
        }
        if now - self.last_keepalive_ms >= self.keepalive_interval_ms {
            let url = self.url.clone();
            match self.send_request("OPTIONS", &url, "") {
                Ok(_) => self.last_keepalive_ms = now,
                Err(e) => log::warn!("RTSP: keepalive failed: {}", e),
            }
        }
    }

    /// Begin asynchronous TEARDOWN. Returns true when the caller must defer
    /// destruction until the response (or timeout).
    pub fn begin_teardown(&mut self, status: &StatusShared, now: i64) -> bool {
        if self.state != RtspState::Playing {
            self.state = RtspState::Closed;
            return false;
        }
        let url = self.url.clone();
        match self.send_request("TEARDOWN", &url, "") {
            Ok(_) => {
                self.state = RtspState::Teardown;
                self.teardown_started_ms = now;
                status.update_state(self.status_index, ClientState::RtspTeardown);
                true
            }
            Err(e) => {
                log::debug!("RTSP: TEARDOWN send failed: {}", e);
                self.state = RtspState::Closed;
                false
            }
        }
    }

    /// True when an in-flight TEARDOWN has outlived its grace period.
    pub fn teardown_expired(&self, now: i64) -> bool {
        self.state == RtspState::Teardown
            && now - self.teardown_started_ms >= TEARDOWN_TIMEOUT_MS
    }

    /// True when the handshake has stalled beyond the timeout.
    pub fn handshake_expired(&self, now: i64) -> bool {
        matches!(
            self.state,
            RtspState::Connecting
                | RtspState::OptionsSent
                | RtspState::DescribeSent
                | RtspState::SetupSent
                | RtspState::PlaySent
        ) && now - self.handshake_started_ms >= HANDSHAKE_TIMEOUT_MS
    }

    /// Drop all sockets. The caller has already removed them from its
    /// readiness facility and fd map.
    pub fn close(&mut self) {
        self.sock = None;
        self.rtp_sock = None;
        self.rtcp_sock = None;
        self.state = RtspState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status() -> std::sync::Arc<StatusShared> {
        StatusShared::new(0)
    }

    fn playing_session() -> RtspSession {
        let mut s = RtspSession::new("rtsp://srv/ch".into(), None, None, false);
        s.state = RtspState::Playing;
        s
    }

    #[test]
    fn test_parse_server_url() {
        assert_eq!(
            parse_server_url("rtsp://host:8554/live/1"),
            Some(("host".into(), 8554))
        );
        assert_eq!(
            parse_server_url("rtsp://10.0.0.1/ch?x=1"),
            Some(("10.0.0.1".into(), 554))
        );
        assert_eq!(parse_server_url("http://host/x"), None);
        assert_eq!(parse_server_url("rtsp://"), None);
    }

    #[test]
    fn test_parse_message_with_body() {
        let raw = b"RTSP/1.0 200 OK\r\nCSeq: 3\r\nContent-Length: 5\r\nSession: ABC;timeout=60\r\n\r\nhello extra";
        let msg = parse_message(raw).expect("parse");
        assert_eq!(msg.code, 200);
        assert_eq!(msg.cseq, Some(3));
        assert_eq!(msg.body, b"hello");
        assert_eq!(msg.header("session"), Some("ABC;timeout=60"));
        assert_eq!(msg.consumed, raw.len() - " extra".len());

        // Incomplete body: not parseable yet.
        let partial = b"RTSP/1.0 200 OK\r\nContent-Length: 10\r\n\r\nshort";
        assert!(parse_message(partial).is_none());
    }

    #[test]
    fn test_parse_session_header() {
        let (id, ka) = parse_session_header("12345678;timeout=60");
        assert_eq!(id, "12345678");
        assert_eq!(ka, 30_000);

        let (id, ka) = parse_session_header("opaque-id");
        assert_eq!(id, "opaque-id");
        assert_eq!(ka, 0);
    }

    #[test]
    fn test_control_url_resolution() {
        let base = "rtsp://srv/live/ch1";
        assert_eq!(
            control_url_from_sdp("v=0\r\na=control:track1\r\n", base),
            "rtsp://srv/live/ch1/track1"
        );
        assert_eq!(
            control_url_from_sdp("a=control:rtsp://other/abs\r\n", base),
            "rtsp://other/abs"
        );
        assert_eq!(control_url_from_sdp("a=control:*\r\n", base), base);
        assert_eq!(control_url_from_sdp("v=0\r\n", base), base);
    }

    #[test]
    fn test_interleaved_demux() {
        let status = status();
        let mut s = playing_session();

        // Two frames on channel 0, one on channel 1 (RTCP, skipped),
        // followed by a keepalive response and a partial frame.
        s.inbuf.extend_from_slice(&[b'$', 0, 0, 3]);
        s.inbuf.extend_from_slice(b"abc");
        s.inbuf.extend_from_slice(&[b'$', 1, 0, 2]);
        s.inbuf.extend_from_slice(b"xx");
        s.inbuf.extend_from_slice(&[b'$', 0, 0, 2]);
        s.inbuf.extend_from_slice(b"de");
        s.inbuf.extend_from_slice(b"RTSP/1.0 200 OK\r\nCSeq: 0\r\n\r\n");
        s.inbuf.extend_from_slice(&[b'$', 0, 0, 99, 1, 2]);

        let mut media = Vec::new();
        let ev = s.process_inbuf(&status, &mut |_, _| {}, &mut |frame| {
            media.push(frame.to_vec())
        });
        assert_eq!(ev, RtspEvent::Continue);
        assert_eq!(media, vec![b"abc".to_vec(), b"de".to_vec()]);
        // The partial frame stays buffered.
        assert_eq!(s.inbuf.len(), 6);
    }

    #[test]
    fn test_response_state_machine_via_loopback() {
        use std::io::{Read, Write};
        use std::net::TcpListener;

        let status = status();
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().unwrap().port();

        let mut s = RtspSession::new(format!("rtsp://127.0.0.1:{}/ch", port), None, None, false);
        s.connect(None, &status, 0).expect("connect");
        let (mut server, _) = listener.accept().expect("accept");
        std::thread::sleep(std::time::Duration::from_millis(30));

        // Connect completes; OPTIONS goes out.
        let ev = s.handle_control_event(false, true, &status, &mut |_, _| {}, &mut |_| {});
        assert_eq!(ev, RtspEvent::Continue);
        assert_eq!(s.state, RtspState::OptionsSent);

        let mut buf = [0u8; 1024];
        let n = server.read(&mut buf).expect("read options");
        let text = std::str::from_utf8(&buf[..n]).unwrap();
        assert!(text.starts_with("OPTIONS rtsp://"));
        assert!(text.contains("CSeq: 1"));

        // 200 to OPTIONS -> DESCRIBE.
        server
            .write_all(b"RTSP/1.0 200 OK\r\nCSeq: 1\r\nPublic: DESCRIBE, SETUP, PLAY\r\n\r\n")
            .expect("write");
        std::thread::sleep(std::time::Duration::from_millis(30));
        let ev = s.handle_control_event(true, false, &status, &mut |_, _| {}, &mut |_| {});
        assert_eq!(ev, RtspEvent::Continue);
        assert_eq!(s.state, RtspState::DescribeSent);
        let n = server.read(&mut buf).expect("read describe");
        assert!(std::str::from_utf8(&buf[..n]).unwrap().starts_with("DESCRIBE"));

        // 200 + SDP -> SETUP (interleaved).
        let sdp = "v=0\r\nm=video 0 RTP/AVP 33\r\na=control:track1\r\n";
        server
            .write_all(
                format!(
                    "RTSP/1.0 200 OK\r\nCSeq: 2\r\nContent-Length: {}\r\n\r\n{}",
                    sdp.len(),
                    sdp
                )
                .as_bytes(),
            )
            .expect("write");
        std::thread::sleep(std::time::Duration::from_millis(30));
        let ev = s.handle_control_event(true, false, &status, &mut |_, _| {}, &mut |_| {});
        assert_eq!(ev, RtspEvent::Continue);
        assert_eq!(s.state, RtspState::SetupSent);
        let n = server.read(&mut buf).expect("read setup");
        let text = std::str::from_utf8(&buf[..n]).unwrap();
        assert!(text.starts_with("SETUP rtsp://"));
        assert!(text.contains("track1"));
        assert!(text.contains("interleaved=0-1"));

        // 200 + Session -> PLAY.
        server
            .write_all(b"RTSP/1.0 200 OK\r\nCSeq: 3\r\nSession: 42;timeout=30\r\n\r\n")
            .expect("write");
        std::thread::sleep(std::time::Duration::from_millis(30));
        let ev = s.handle_control_event(true, false, &status, &mut |_, _| {}, &mut |_| {});
        assert_eq!(ev, RtspEvent::Continue);
        assert_eq!(s.state, RtspState::PlaySent);
        assert_eq!(s.session_id, "42");
        assert_eq!(s.keepalive_interval_ms, 15_000);
        let n = server.read(&mut buf).expect("read play");
        let text = std::str::from_utf8(&buf[..n]).unwrap();
        assert!(text.starts_with("PLAY"));
        assert!(text.contains("Session: 42"));

        // 200 -> Playing.
        server
            .write_all(b"RTSP/1.0 200 OK\r\nCSeq: 4\r\n\r\n")
            .expect("write");
        std::thread::sleep(std::time::Duration::from_millis(30));
        let ev = s.handle_control_event(true, false, &status, &mut |_, _| {}, &mut |_| {});
        assert_eq!(ev, RtspEvent::Continue);
        assert_eq!(s.state, RtspState::Playing);

        // Async teardown.
        assert!(s.begin_teardown(&status, 1000));
        assert_eq!(s.state, RtspState::Teardown);
        let n = server.read(&mut buf).expect("read teardown");
        assert!(std::str::from_utf8(&buf[..n]).unwrap().starts_with("TEARDOWN"));
        assert!(!s.teardown_expired(1000 + TEARDOWN_TIMEOUT_MS - 1));
        assert!(s.teardown_expired(1000 + TEARDOWN_TIMEOUT_MS));

        server
            .write_all(b"RTSP/1.0 200 OK\r\nCSeq: 5\r\n\r\n")
            .expect("write");
        std::thread::sleep(std::time::Duration::from_millis(30));
        let ev = s.handle_control_event(true, false, &status, &mut |_, _| {}, &mut |_| {});
        assert_eq!(ev, RtspEvent::TeardownComplete);
    }

    #[test]
    fn test_playseek_becomes_range_header() {
        use std::io::{Read, Write};
        use std::net::TcpListener;

        let status = status();
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().unwrap().port();

        let mut s = RtspSession::new(
            format!("rtsp://127.0.0.1:{}/tv", port),
            Some("20240101T000000".into()),
            Some("test-agent".into()),
            false,
        );
        s.connect(None, &status, 0).expect("connect");
        let (mut server, _) = listener.accept().expect("accept");
        std::thread::sleep(std::time::Duration::from_millis(30));

        let _ = s.handle_control_event(false, true, &status, &mut |_, _| {}, &mut |_| {});
        let mut buf = [0u8; 2048];
        let n = server.read(&mut buf).expect("read");
        assert!(std::str::from_utf8(&buf[..n]).unwrap().contains("User-Agent: test-agent"));

        // Drive to SETUP-complete so PLAY is sent.
        server.write_all(b"RTSP/1.0 200 OK\r\nCSeq: 1\r\n\r\n").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(30));
        let _ = s.handle_control_event(true, false, &status, &mut |_, _| {}, &mut |_| {});
        server.read(&mut buf).expect("describe");
        server
            .write_all(b"RTSP/1.0 200 OK\r\nCSeq: 2\r\nContent-Length: 0\r\n\r\n")
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(30));
        let _ = s.handle_control_event(true, false, &status, &mut |_, _| {}, &mut |_| {});
        server.read(&mut buf).expect("setup");
        server
            .write_all(b"RTSP/1.0 200 OK\r\nCSeq: 3\r\nSession: 7\r\n\r\n")
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(30));
        let _ = s.handle_control_event(true, false, &status, &mut |_, _| {}, &mut |_| {});
        let n = server.read(&mut buf).expect("play");
        let text = std::str::from_utf8(&buf[..n]).unwrap();
        assert!(text.starts_with("PLAY"));
        // A bare timestamp gets an open range.
        assert!(text.contains("Range: npt=20240101T000000-"));
    }
}
