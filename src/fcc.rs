// src/fcc.rs - Fast Channel Change session
//
// The FCC server primes a joining client with a unicast burst of recent
// stream data before it switches to the multicast group, hiding the IGMP
// join latency. Control packets are RTCP-shaped APP messages distinguished
// by the first byte: 0x82 request, 0x83 response/redirect, 0x84 sync
// notification, 0x81 terminate.
//
// State machine:
//   Init -> Requested -> UnicastPending -> UnicastActive -> McastRequested
//        -> McastActive
// with a fallback edge from any state to McastActive (plain multicast join)
// on signaling or media timeouts.

use crate::pool::BufRef;
use crate::rtp::seq_diff;
use crate::status::{ClientState, StatusShared};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddrV4;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

pub const FCC_PK_LEN_REQ: usize = 40;
pub const FCC_PK_LEN_TERM: usize = 16;
pub const FCC_MAX_REDIRECTS: u32 = 5;

/// Waiting for the server response or the first unicast packet.
pub const FCC_TIMEOUT_SIGNALING_MS: i64 = 3000;
/// Unicast media silence while the burst should be running.
pub const FCC_TIMEOUT_UNICAST_MS: i64 = 2000;
/// Upper bound on waiting for the server's sync notification.
pub const FCC_TIMEOUT_SYNC_WAIT_MS: i64 = 15_000;

pub const TAG_TERMINATE: u8 = 0x81;
pub const TAG_REQUEST: u8 = 0x82;
pub const TAG_RESPONSE: u8 = 0x83;
pub const TAG_SYNC: u8 = 0x84;

const RTCP_PT_APP: u8 = 205;

/// Cap on multicast packets parked during the unicast->multicast hand-off.
const PENDING_MAX: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FccState {
    Init,
    Requested,
    UnicastPending,
    UnicastActive,
    McastRequested,
    McastActive,
}

impl FccState {
    fn client_state(self) -> ClientState {
        match self {
            FccState::Init => ClientState::Connecting,
            FccState::Requested => ClientState::FccRequested,
            FccState::UnicastPending => ClientState::FccUnicastPending,
            FccState::UnicastActive => ClientState::FccUnicastActive,
            FccState::McastRequested => ClientState::FccMcastRequested,
            FccState::McastActive => ClientState::FccMcastActive,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FccResponse {
    Accept { media_port: u16 },
    Redirect { server: SocketAddrV4 },
    Reject,
}

pub struct FccSession {
    pub state: FccState,
    pub sock: Option<OwnedFd>,
    pub server: Option<SocketAddrV4>,
    /// Port the unicast burst arrives from, announced in the response.
    pub media_port: u16,
    /// Sequence number of the last RTP packet forwarded downstream.
    pub current_seqn: u16,
    pub not_first_packet: bool,
    term_sent: bool,
    redirect_count: u32,
    /// When the unicast burst started, for the sync-wait cap.
    pub unicast_start_ms: i64,
    /// Multicast packets parked while unicast catches up.
    pending: VecDeque<BufRef>,
    pub status_index: i32,
}

impl FccSession {
    pub fn new() -> Self {
        FccSession {
            state: FccState::Init,
            sock: None,
            server: None,
            media_port: 0,
            current_seqn: 0,
            not_first_packet: false,
            term_sent: false,
            redirect_count: 0,
            unicast_start_ms: 0,
            pending: VecDeque::new(),
            status_index: -1,
        }
    }

    pub fn active(&self) -> bool {
        self.sock.is_some()
    }

    pub fn sock_fd(&self) -> Option<RawFd> {
        self.sock.as_ref().map(|s| s.as_raw_fd())
    }

    /// Transition with logging and status reporting. Returns false when the
    /// session was already in `new_state`.
    pub fn set_state(&mut self, new_state: FccState, reason: &str, status: &StatusShared) -> bool {
        if self.state == new_state {
            return false;
        }
        log::debug!("FCC: {:?} -> {:?} ({})", self.state, new_state, reason);
        self.state = new_state;
        status.update_state(self.status_index, new_state.client_state());
        true
    }

    /// Open (or reopen, on redirect) the control socket towards `server`.
    /// The caller registers the returned fd with its readiness facility.
    pub fn open_socket(
        &mut self,
        server: SocketAddrV4,
        interface: Option<&str>,
    ) -> io::Result<RawFd> {
        let sock = crate::sock::udp_socket(Some(SocketAddrV4::new(
            std::net::Ipv4Addr::UNSPECIFIED,
            0,
        )))?;
        if let Some(ifname) = interface {
            crate::sock::bind_to_interface(sock.as_raw_fd(), ifname)?;
        }
        let fd = sock.as_raw_fd();
        self.sock = Some(sock);
        self.server = Some(server);
        Ok(fd)
    }

    /// Send the FCC request for `group`. Valid in Init (first attempt) and
    /// Requested (redirect retry).
    pub fn send_request(&mut self, group: SocketAddrV4, status: &StatusShared) -> io::Result<()> {
        let (Some(sock), Some(server)) = (self.sock.as_ref(), self.server) else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "no FCC socket"));
        };
        let pkt = build_request(group);
        crate::sock::send_to(sock.as_raw_fd(), &pkt, server)?;
        self.set_state(FccState::Requested, "request sent", status);
        Ok(())
    }

    /// Follow a server redirect: reopen towards the new server and re-send.
    /// Errors out once the redirect allowance is exhausted.
    pub fn redirect(
        &mut self,
        new_server: SocketAddrV4,
        group: SocketAddrV4,
        interface: Option<&str>,
        status: &StatusShared,
    ) -> io::Result<RawFd> {
        self.redirect_count += 1;
        if self.redirect_count > FCC_MAX_REDIRECTS {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "too many FCC redirects",
            ));
        }
        log::info!(
            "FCC: redirect {} to {}",
            self.redirect_count,
            new_server
        );
        self.sock = None;
        let fd = self.open_socket(new_server, interface)?;
        let pkt = build_request(group);
        crate::sock::send_to(fd, &pkt, new_server)?;
        self.set_state(FccState::Requested, "redirect", status);
        Ok(fd)
    }

    /// Send the termination message carrying the last forwarded sequence.
    /// Sent once on the normal cut-over; cleanup falls back to an emergency
    /// send if the normal flow never got there.
    pub fn send_terminate(&mut self) {
        if self.term_sent {
            return;
        }
        if let (Some(sock), Some(server)) = (self.sock.as_ref(), self.server) {
            let pkt = build_terminate(self.current_seqn.wrapping_add(1));
            if let Err(e) = crate::sock::send_to(sock.as_raw_fd(), &pkt, server) {
                log::debug!("FCC: terminate send failed: {}", e);
            }
            self.term_sent = true;
        }
    }

    /// Drop the unicast socket. Returns the fd the caller must remove from
    /// its readiness facility and fd map before the close.
    pub fn take_socket(&mut self) -> Option<OwnedFd> {
        self.sock.take()
    }

    /// Park a multicast packet during the transition window.
    pub fn push_pending(&mut self, buf: BufRef) {
        if self.pending.len() >= PENDING_MAX {
            self.pending.pop_front();
        }
        self.pending.push_back(buf);
    }

    pub fn pending_first_seqn(&self) -> Option<u16> {
        self.pending.front().and_then(|b| b.rtp_seq())
    }

    pub fn take_pending(&mut self) -> VecDeque<BufRef> {
        std::mem::take(&mut self.pending)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// The unicast burst has caught up with the parked multicast data when
    /// the next pending packet is at or before the next expected sequence.
    pub fn unicast_caught_up(&self) -> bool {
        match self.pending_first_seqn() {
            Some(first) => seq_diff(first, self.current_seqn.wrapping_add(1)) <= 0,
            None => false,
        }
    }

    /// Cleanup at stream teardown: emergency-terminate if needed, release
    /// parked buffers. Socket removal is the caller's job (fd map / epoll).
    pub fn cleanup(&mut self) {
        if self.active() && !self.term_sent && self.state != FccState::Init {
            self.send_terminate();
        }
        self.pending.clear();
    }
}

impl Default for FccSession {
    fn default() -> Self {
        Self::new()
    }
}

/// FCC request (RTCP APP, 40 bytes): tag, packet type, length in words - 1,
/// zero sender SSRC, then the requested group address and port.
pub fn build_request(group: SocketAddrV4) -> [u8; FCC_PK_LEN_REQ] {
    let mut pkt = [0u8; FCC_PK_LEN_REQ];
    pkt[0] = TAG_REQUEST;
    pkt[1] = RTCP_PT_APP;
    let words = (FCC_PK_LEN_REQ / 4 - 1) as u16;
    pkt[2..4].copy_from_slice(&words.to_be_bytes());
    pkt[8..12].copy_from_slice(&group.ip().octets());
    pkt[12..14].copy_from_slice(&group.port().to_be_bytes());
    pkt
}

/// FCC terminate (16 bytes): carries the first multicast sequence the
/// client now receives, so the server stops the burst there.
pub fn build_terminate(seqn: u16) -> [u8; FCC_PK_LEN_TERM] {
    let mut pkt = [0u8; FCC_PK_LEN_TERM];
    pkt[0] = TAG_TERMINATE;
    pkt[1] = RTCP_PT_APP;
    let words = (FCC_PK_LEN_TERM / 4 - 1) as u16;
    pkt[2..4].copy_from_slice(&words.to_be_bytes());
    pkt[8..10].copy_from_slice(&seqn.to_be_bytes());
    pkt
}

/// Parse a server response (0x83). Result code 0 accepts and announces the
/// unicast media port; 1 redirects to another FCC server.
pub fn parse_response(data: &[u8]) -> Option<FccResponse> {
    if data.len() < FCC_PK_LEN_TERM || data[0] != TAG_RESPONSE {
        return None;
    }
    match data[8] {
        0 => {
            let media_port = u16::from_be_bytes([data[10], data[11]]);
            if media_port == 0 {
                return Some(FccResponse::Reject);
            }
            Some(FccResponse::Accept { media_port })
        }
        1 => {
            if data.len() < 18 {
                return Some(FccResponse::Reject);
            }
            let ip = std::net::Ipv4Addr::new(data[12], data[13], data[14], data[15]);
            let port = u16::from_be_bytes([data[16], data[17]]);
            if port == 0 {
                return Some(FccResponse::Reject);
            }
            Some(FccResponse::Redirect {
                server: SocketAddrV4::new(ip, port),
            })
        }
        _ => Some(FccResponse::Reject),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Pool;

    fn status() -> std::sync::Arc<StatusShared> {
        StatusShared::new(0)
    }

    #[test]
    fn test_request_packet_layout() {
        let group: SocketAddrV4 = "239.3.1.241:8000".parse().unwrap();
        let pkt = build_request(group);
        assert_eq!(pkt.len(), FCC_PK_LEN_REQ);
        assert_eq!(pkt[0], TAG_REQUEST);
        assert_eq!(pkt[1], 205);
        assert_eq!(u16::from_be_bytes([pkt[2], pkt[3]]) as usize, FCC_PK_LEN_REQ / 4 - 1);
        assert_eq!(&pkt[8..12], &[239, 3, 1, 241]);
        assert_eq!(u16::from_be_bytes([pkt[12], pkt[13]]), 8000);
    }

    #[test]
    fn test_terminate_packet_layout() {
        let pkt = build_terminate(0xABCD);
        assert_eq!(pkt.len(), FCC_PK_LEN_TERM);
        assert_eq!(pkt[0], TAG_TERMINATE);
        assert_eq!(u16::from_be_bytes([pkt[8], pkt[9]]), 0xABCD);
    }

    #[test]
    fn test_parse_accept_and_redirect() {
        let mut resp = [0u8; 18];
        resp[0] = TAG_RESPONSE;
        resp[8] = 0;
        resp[10..12].copy_from_slice(&15_970u16.to_be_bytes());
        assert_eq!(
            parse_response(&resp),
            Some(FccResponse::Accept { media_port: 15_970 })
        );

        resp[8] = 1;
        resp[12..16].copy_from_slice(&[10, 0, 0, 9]);
        resp[16..18].copy_from_slice(&8027u16.to_be_bytes());
        assert_eq!(
            parse_response(&resp),
            Some(FccResponse::Redirect {
                server: "10.0.0.9:8027".parse().unwrap()
            })
        );

        resp[8] = 9;
        assert_eq!(parse_response(&resp), Some(FccResponse::Reject));
        assert_eq!(parse_response(&resp[..4]), None);
        resp[0] = TAG_SYNC;
        assert_eq!(parse_response(&resp), None);
    }

    #[test]
    fn test_state_transitions_report_status() {
        let status = status();
        let idx = status.register_client("t", "/ch", 0, 0);
        let mut fcc = FccSession::new();
        fcc.status_index = idx;

        assert!(fcc.set_state(FccState::Requested, "test", &status));
        assert!(!fcc.set_state(FccState::Requested, "noop", &status));
        assert!(fcc.set_state(FccState::UnicastPending, "test", &status));
        assert!(fcc.set_state(FccState::UnicastActive, "test", &status));
        assert!(fcc.set_state(FccState::McastRequested, "test", &status));
        assert!(fcc.set_state(FccState::McastActive, "test", &status));
    }

    #[test]
    fn test_redirect_limit() {
        let status = status();
        let group: SocketAddrV4 = "239.0.0.1:1000".parse().unwrap();
        let server: SocketAddrV4 = "127.0.0.1:9".parse().unwrap();
        let mut fcc = FccSession::new();
        fcc.open_socket(server, None).expect("open");

        for _ in 0..FCC_MAX_REDIRECTS {
            fcc.redirect(server, group, None, &status).expect("redirect");
        }
        assert!(fcc.redirect(server, group, None, &status).is_err());
    }

    #[test]
    fn test_pending_catchup_logic() {
        let pool = Pool::new("test", 8, 2048, 2, 24);
        let mut fcc = FccSession::new();
        fcc.current_seqn = 100;

        let park = |seq: u16| {
            let b = pool.alloc().expect("alloc");
            b.fill(&[0u8; 4]);
            b.set_rtp_seq(Some(seq));
            b
        };

        // Multicast starts at 105 while unicast is at 100: not caught up.
        fcc.push_pending(park(105));
        fcc.push_pending(park(106));
        assert!(!fcc.unicast_caught_up());

        // Unicast advances to 104; next expected is 105 which is parked.
        fcc.current_seqn = 104;
        assert!(fcc.unicast_caught_up());

        let drained = fcc.take_pending();
        let seqs: Vec<u16> = drained.iter().map(|b| b.rtp_seq().unwrap()).collect();
        assert_eq!(seqs, vec![105, 106]);
        assert_eq!(fcc.pending_len(), 0);
    }

    #[test]
    fn test_pending_bounded() {
        let pool = Pool::new("test", 8, 4096, 2, 24);
        let mut fcc = FccSession::new();
        for i in 0..(PENDING_MAX + 10) {
            let b = pool.alloc().expect("alloc");
            b.set_rtp_seq(Some(i as u16));
            fcc.push_pending(b);
        }
        assert_eq!(fcc.pending_len(), PENDING_MAX);
        // Oldest were evicted.
        assert_eq!(fcc.pending_first_seqn(), Some(10));
    }
}
