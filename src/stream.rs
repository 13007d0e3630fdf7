// src/stream.rs - Per-client stream context
//
// Composes the upstream path for one client: direct multicast, FCC-assisted
// multicast, or RTSP. Owns the upstream sockets, routes their readiness
// events, and runs the per-tick maintenance (rejoin, timeouts, reorder
// recovery, bandwidth reporting).

use crate::config::Config;
use crate::connection::Connection;
use crate::fcc::{
    self, FccResponse, FccSession, FccState, FCC_TIMEOUT_SIGNALING_MS, FCC_TIMEOUT_SYNC_WAIT_MS,
    FCC_TIMEOUT_UNICAST_MS,
};
use crate::multicast;
use crate::poller::{self, Interest};
use crate::pool::BufRef;
use crate::rtp::{self, seq_diff, ReorderWindow, RtpPayload};
use crate::rtsp::{RtspEvent, RtspSession, RtspState, RtspTransport};
use crate::service::{Service, ServiceKind};
use crate::sock;
use crate::status::StatusShared;
use crate::worker::FdMap;
use std::io;
use std::net::SocketAddrV4;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

/// Close the client when the joined group stays silent this long.
pub const MCAST_TIMEOUT_MS: i64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamAction {
    Continue,
    /// Fatal for this client; the worker tears the connection down.
    CloseConn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupStatus {
    Done,
    /// RTSP TEARDOWN in flight; destruction is deferred until the response
    /// arrives or times out.
    Deferred,
}

pub struct StreamContext {
    service: Service,
    mcast_sock: Option<OwnedFd>,
    pub fcc: FccSession,
    pub rtsp: Option<RtspSession>,
    pub reorder: ReorderWindow,
    pub reorder_enabled: bool,
    /// Last forwarded sequence on the reorder-disabled path.
    direct_seqn: u16,
    direct_not_first: bool,

    pub total_bytes_sent: u64,
    last_bytes_sent: u64,
    last_status_update_ms: i64,
    last_mcast_data_ms: i64,
    last_fcc_data_ms: i64,
    last_mcast_rejoin_ms: i64,
    mcast_rejoin_interval_ms: i64,
    interface: Option<String>,
    status_index: i32,
}

impl StreamContext {
    /// Pick the upstream path for `service` and register its sockets with
    /// the worker's readiness facility and fd map.
    pub fn init(
        conn: &mut Connection,
        service: Service,
        cfg: &Config,
        fdmap: &mut FdMap,
        now: i64,
    ) -> io::Result<StreamContext> {
        let mut ctx = StreamContext {
            service,
            mcast_sock: None,
            fcc: FccSession::new(),
            rtsp: None,
            reorder: ReorderWindow::new(),
            reorder_enabled: true,
            direct_seqn: 0,
            direct_not_first: false,
            total_bytes_sent: 0,
            last_bytes_sent: 0,
            last_status_update_ms: now,
            last_mcast_data_ms: now,
            last_fcc_data_ms: now,
            last_mcast_rejoin_ms: now,
            mcast_rejoin_interval_ms: cfg.mcast_rejoin_interval as i64 * 1000,
            interface: cfg.upstream_interface.clone(),
            status_index: conn.status_index,
        };
        ctx.fcc.status_index = conn.status_index;

        match ctx.service.kind.clone() {
            ServiceKind::Rtsp { url, playseek } => {
                let mut session = RtspSession::new(
                    url,
                    playseek,
                    ctx.service.user_agent.clone(),
                    cfg.rtsp_udp,
                );
                session.status_index = conn.status_index;
                let fd = session.connect(ctx.interface.as_deref(), &conn.status, now)?;
                // Writable fires once the non-blocking connect resolves.
                poller::add_fd(conn.epfd, fd, Interest::READABLE.add_writable())?;
                fdmap.set(fd, conn.id);
                // TCP orders for us; the window would only add latency.
                ctx.reorder_enabled = session.transport == RtspTransport::Udp;
                ctx.rtsp = Some(session);
            }
            ServiceKind::Multicast {
                group,
                fcc: Some(server),
                ..
            } => {
                match ctx.start_fcc(conn, fdmap, group, server) {
                    Ok(()) => {}
                    Err(e) => {
                        // Any FCC failure degrades to a plain join.
                        log::warn!("FCC setup failed ({}), joining multicast directly", e);
                        ctx.join_mcast(conn, fdmap, now)?;
                        ctx.fcc
                            .set_state(FccState::McastActive, "FCC unavailable", &conn.status);
                    }
                }
            }
            ServiceKind::Multicast { .. } => {
                ctx.join_mcast(conn, fdmap, now)?;
                ctx.fcc
                    .set_state(FccState::McastActive, "Direct multicast", &conn.status);
            }
        }
        Ok(ctx)
    }

    fn start_fcc(
        &mut self,
        conn: &mut Connection,
        fdmap: &mut FdMap,
        group: SocketAddrV4,
        server: SocketAddrV4,
    ) -> io::Result<()> {
        let fd = self.fcc.open_socket(server, self.interface.as_deref())?;
        poller::add_fd(conn.epfd, fd, Interest::READABLE)?;
        fdmap.set(fd, conn.id);
        self.fcc.send_request(group, &conn.status)?;
        Ok(())
    }

    fn group(&self) -> Option<(SocketAddrV4, Option<std::net::Ipv4Addr>)> {
        match &self.service.kind {
            ServiceKind::Multicast { group, source, .. } => Some((*group, *source)),
            ServiceKind::Rtsp { .. } => None,
        }
    }

    /// Join the service's multicast group and reset the silence timer so a
    /// fresh join cannot trip the timeout immediately.
    fn join_mcast(&mut self, conn: &mut Connection, fdmap: &mut FdMap, now: i64) -> io::Result<()> {
        if self.mcast_sock.is_some() {
            return Ok(());
        }
        let Some((group, source)) = self.group() else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "not multicast"));
        };
        let sock = multicast::join_group(group, source, self.interface.as_deref())?;
        let fd = sock.as_raw_fd();
        poller::add_fd(conn.epfd, fd, Interest::READABLE)?;
        fdmap.set(fd, conn.id);
        self.mcast_sock = Some(sock);
        self.last_mcast_data_ms = now;
        self.last_mcast_rejoin_ms = now;
        Ok(())
    }

    pub fn owns_fd(&self, fd: RawFd) -> bool {
        self.mcast_sock.as_ref().map(|s| s.as_raw_fd()) == Some(fd)
            || self.fcc.sock_fd() == Some(fd)
            || self
                .rtsp
                .as_ref()
                .map(|r| {
                    r.sock_fd() == Some(fd) || r.rtp_fd() == Some(fd) || r.rtcp_fd() == Some(fd)
                })
                .unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Event dispatch
    // ------------------------------------------------------------------

    /// Handle readiness on an fd this context owns.
    pub fn handle_fd_event(
        &mut self,
        conn: &mut Connection,
        fd: RawFd,
        readable: bool,
        writable: bool,
        fdmap: &mut FdMap,
        now: i64,
    ) -> StreamAction {
        if self.fcc.sock_fd() == Some(fd) {
            if readable {
                return self.handle_fcc_readable(conn, fdmap, now);
            }
            return StreamAction::Continue;
        }

        if self.mcast_sock.as_ref().map(|s| s.as_raw_fd()) == Some(fd) {
            if readable {
                let Some((buf, _peer)) = recv_datagram(fd, conn) else {
                    self.last_mcast_data_ms = now;
                    return StreamAction::Continue;
                };
                self.last_mcast_data_ms = now;
                return self.handle_mcast_packet(conn, fdmap, buf, now);
            }
            return StreamAction::Continue;
        }

        let (is_control, is_rtp, is_rtcp) = match &self.rtsp {
            Some(r) => (
                r.sock_fd() == Some(fd),
                r.rtp_fd() == Some(fd),
                r.rtcp_fd() == Some(fd),
            ),
            None => (false, false, false),
        };
        if is_control {
            return self.handle_rtsp_control(conn, fdmap, readable, writable, now);
        }
        if is_rtp {
            if let Some((buf, _)) = recv_datagram(fd, conn) {
                self.forward_media(conn, buf, now);
            }
            return StreamAction::Continue;
        }
        if is_rtcp {
            // Consume and discard; RTCP is not processed.
            let _ = recv_datagram(fd, conn);
        }

        StreamAction::Continue
    }

    fn handle_rtsp_control(
        &mut self,
        conn: &mut Connection,
        fdmap: &mut FdMap,
        readable: bool,
        writable: bool,
        now: i64,
    ) -> StreamAction {
        let Some(mut rtsp) = self.rtsp.take() else {
            return StreamAction::Continue;
        };

        let epfd = conn.epfd;
        let conn_id = conn.id;
        let status = conn.status.clone();
        let mut media_frames: Vec<Vec<u8>> = Vec::new();
        let event = {
            let mut udp_ready = |rtp_fd: RawFd, rtcp_fd: RawFd| {
                if poller::add_fd(epfd, rtp_fd, Interest::READABLE).is_ok() {
                    fdmap.set(rtp_fd, conn_id);
                }
                if poller::add_fd(epfd, rtcp_fd, Interest::READABLE).is_ok() {
                    fdmap.set(rtcp_fd, conn_id);
                }
            };
            let mut media_sink = |frame: &[u8]| {
                media_frames.push(frame.to_vec());
            };
            rtsp.handle_control_event(readable, writable, &status, &mut udp_ready, &mut media_sink)
        };

        // Once connected, the control socket only needs read interest.
        if rtsp.state != crate::rtsp::RtspState::Connecting && writable {
            if let Some(fd) = rtsp.sock_fd() {
                poller::set_interest(epfd, fd, Interest::READABLE);
            }
        }

        self.rtsp = Some(rtsp);

        for frame in media_frames {
            self.forward_tcp_frame(conn, &frame, now);
        }

        match event {
            RtspEvent::Continue => StreamAction::Continue,
            RtspEvent::CloseStream => StreamAction::CloseConn,
            RtspEvent::TeardownComplete => {
                log::debug!("RTSP: graceful TEARDOWN completed");
                StreamAction::CloseConn
            }
        }
    }

    /// Interleaved RTP frame from the RTSP control socket. The transport
    /// already ordered it; only the backward filter applies.
    fn forward_tcp_frame(&mut self, conn: &mut Connection, frame: &[u8], now: i64) {
        let Some(buf) = conn.pools.alloc_media() else {
            log::debug!("pool exhausted, dropping interleaved frame");
            return;
        };
        if frame.len() > buf.capacity() {
            return;
        }
        buf.fill(frame);
        self.forward_media(conn, buf, now);
    }

    fn handle_fcc_readable(
        &mut self,
        conn: &mut Connection,
        fdmap: &mut FdMap,
        now: i64,
    ) -> StreamAction {
        let Some(fd) = self.fcc.sock_fd() else {
            return StreamAction::Continue;
        };
        let Some((buf, peer)) = recv_datagram(fd, conn) else {
            self.last_fcc_data_ms = now;
            return StreamAction::Continue;
        };
        self.last_fcc_data_ms = now;

        let Some(server) = self.fcc.server else {
            return StreamAction::Continue;
        };
        if peer.ip() != server.ip() {
            return StreamAction::Continue;
        }

        if peer.port() == server.port() {
            let tag = buf.with_data(|d| d.first().copied()).unwrap_or(0);
            match tag {
                fcc::TAG_RESPONSE => {
                    let response = buf.with_data(fcc::parse_response);
                    return self.handle_fcc_response(conn, fdmap, response, now);
                }
                fcc::TAG_SYNC => {
                    self.handle_fcc_sync(conn, fdmap, now, "server sync notification");
                }
                other => {
                    log::debug!("FCC: unexpected control tag {:#04x}", other);
                }
            }
            return StreamAction::Continue;
        }

        if peer.port() == self.fcc.media_port {
            if self.fcc.state == FccState::UnicastPending {
                self.fcc
                    .set_state(FccState::UnicastActive, "first unicast packet", &conn.status);
                self.fcc.unicast_start_ms = now;
            }
            if matches!(
                self.fcc.state,
                FccState::UnicastActive | FccState::McastRequested
            ) {
                self.forward_media(conn, buf, now);
                if self.fcc.state == FccState::McastRequested && self.fcc.unicast_caught_up() {
                    self.complete_handoff(conn, fdmap, now);
                }
            }
        }
        StreamAction::Continue
    }

    fn handle_fcc_response(
        &mut self,
        conn: &mut Connection,
        fdmap: &mut FdMap,
        response: Option<FccResponse>,
        now: i64,
    ) -> StreamAction {
        match response {
            Some(FccResponse::Accept { media_port }) => {
                self.fcc.media_port = media_port;
                self.fcc
                    .set_state(FccState::UnicastPending, "server accepted", &conn.status);
                StreamAction::Continue
            }
            Some(FccResponse::Redirect { server }) => {
                let Some((group, _)) = self.group() else {
                    return StreamAction::CloseConn;
                };
                // Self-transition with a side effect: reopen towards the new
                // server and re-send the request.
                if let Some(old) = self.fcc.take_socket() {
                    poller::del_fd(conn.epfd, old.as_raw_fd());
                    fdmap.del(old.as_raw_fd());
                }
                match self
                    .fcc
                    .redirect(server, group, self.interface.as_deref(), &conn.status)
                {
                    Ok(fd) => {
                        if poller::add_fd(conn.epfd, fd, Interest::READABLE).is_err() {
                            return StreamAction::CloseConn;
                        }
                        fdmap.set(fd, conn.id);
                        StreamAction::Continue
                    }
                    Err(e) => {
                        log::warn!("FCC: redirect failed ({}), falling back", e);
                        self.fallback_to_mcast(conn, fdmap, now, "redirect failure")
                    }
                }
            }
            Some(FccResponse::Reject) | None => {
                self.fallback_to_mcast(conn, fdmap, now, "server rejected request")
            }
        }
    }

    /// Sync notification (or its timeout): join the group while unicast
    /// keeps flowing.
    fn handle_fcc_sync(
        &mut self,
        conn: &mut Connection,
        fdmap: &mut FdMap,
        now: i64,
        reason: &str,
    ) {
        if self.join_mcast(conn, fdmap, now).is_err() {
            log::error!("FCC: multicast join failed during sync");
            return;
        }
        self.fcc
            .set_state(FccState::McastRequested, reason, &conn.status);
    }

    fn handle_mcast_packet(
        &mut self,
        conn: &mut Connection,
        fdmap: &mut FdMap,
        buf: BufRef,
        now: i64,
    ) -> StreamAction {
        match self.fcc.state {
            FccState::McastActive => {
                self.forward_media(conn, buf, now);
            }
            FccState::McastRequested => match buf.with_data(rtp::parse_payload) {
                RtpPayload::Rtp { start, len, seq } => {
                    buf.set_offset(start);
                    buf.set_len(len);
                    buf.set_rtp_seq(Some(seq));
                    if self.fcc.not_first_packet
                        && seq_diff(seq, self.fcc.current_seqn.wrapping_add(1)) <= 0
                    {
                        // Multicast reached our position: cut over now.
                        self.complete_handoff(conn, fdmap, now);
                        if seq_diff(seq, self.fcc.current_seqn) > 0 {
                            self.push_reorder(conn, buf, seq, now);
                        }
                    } else {
                        self.fcc.push_pending(buf);
                    }
                }
                RtpPayload::Raw => {
                    self.forward_media(conn, buf, now);
                }
                RtpPayload::Discard => {}
            },
            _ => {
                log::debug!(
                    "multicast data in unexpected FCC state {:?}",
                    self.fcc.state
                );
            }
        }
        StreamAction::Continue
    }

    /// Unicast -> multicast cut-over: flush parked packets that continue
    /// the sequence, terminate the burst, drop the unicast socket.
    fn complete_handoff(&mut self, conn: &mut Connection, fdmap: &mut FdMap, now: i64) {
        let parked = self.fcc.take_pending();
        for buf in parked {
            if let Some(seq) = buf.rtp_seq() {
                if seq_diff(seq, self.fcc.current_seqn) > 0 {
                    self.push_reorder(conn, buf, seq, now);
                }
            }
        }
        self.fcc.send_terminate();
        if let Some(sock) = self.fcc.take_socket() {
            poller::del_fd(conn.epfd, sock.as_raw_fd());
            fdmap.del(sock.as_raw_fd());
        }
        self.fcc
            .set_state(FccState::McastActive, "multicast took over", &conn.status);
    }

    fn fallback_to_mcast(
        &mut self,
        conn: &mut Connection,
        fdmap: &mut FdMap,
        now: i64,
        reason: &str,
    ) -> StreamAction {
        if let Some(sock) = self.fcc.take_socket() {
            poller::del_fd(conn.epfd, sock.as_raw_fd());
            fdmap.del(sock.as_raw_fd());
        }
        if self.mcast_sock.is_none() && self.join_mcast(conn, fdmap, now).is_err() {
            log::error!("multicast fallback join failed");
            return StreamAction::CloseConn;
        }
        self.fcc
            .set_state(FccState::McastActive, reason, &conn.status);
        StreamAction::Continue
    }

    // ------------------------------------------------------------------
    // Media forwarding
    // ------------------------------------------------------------------

    /// Classify one upstream datagram and queue its payload downstream.
    pub fn forward_media(&mut self, conn: &mut Connection, buf: BufRef, now: i64) {
        match buf.with_data(rtp::parse_payload) {
            RtpPayload::Discard => {}
            RtpPayload::Raw => {
                if conn.queue_media(&buf, now).is_ok() {
                    self.total_bytes_sent += buf.len() as u64;
                }
            }
            RtpPayload::Rtp { start, len, seq } => {
                buf.set_offset(start);
                buf.set_len(len);
                buf.set_rtp_seq(Some(seq));
                if self.reorder_enabled {
                    self.push_reorder(conn, buf, seq, now);
                } else {
                    self.enqueue_rtp_direct(conn, buf, seq, now);
                }
            }
        }
    }

    /// Feed the reordering window; emissions land in the send queue in
    /// sequence order and advance the hand-off cursor.
    fn push_reorder(&mut self, conn: &mut Connection, buf: BufRef, seq: u16, now: i64) {
        let fcc_seq = &mut self.fcc.current_seqn;
        let fcc_first = &mut self.fcc.not_first_packet;
        let total = &mut self.total_bytes_sent;
        let mut sink = |b: BufRef| {
            if let Some(s) = b.rtp_seq() {
                *fcc_seq = s;
                *fcc_first = true;
            }
            if conn.queue_media(&b, now).is_ok() {
                *total += b.len() as u64;
            }
        };
        self.reorder.push(buf, seq, now, &mut sink);
    }

    /// Reorder-disabled path (RTSP interleaved): forward in arrival order,
    /// discarding duplicates and backward jumps.
    fn enqueue_rtp_direct(&mut self, conn: &mut Connection, buf: BufRef, seq: u16, now: i64) {
        if self.direct_not_first {
            let diff = seq_diff(seq, self.direct_seqn);
            if diff <= 0 {
                self.reorder.stats.duplicates += 1;
                return;
            }
            if diff > 1 {
                log::debug!(
                    "upstream RTP loss: expected {}, got {} ({} missing)",
                    self.direct_seqn.wrapping_add(1),
                    seq,
                    diff - 1
                );
            }
        }
        self.direct_seqn = seq;
        self.direct_not_first = true;
        self.fcc.current_seqn = seq;
        self.fcc.not_first_packet = true;
        if conn.queue_media(&buf, now).is_ok() {
            self.total_bytes_sent += buf.len() as u64;
        }
    }

    // ------------------------------------------------------------------
    // Periodic maintenance
    // ------------------------------------------------------------------

    /// Called once per worker-loop tick.
    pub fn tick(&mut self, conn: &mut Connection, fdmap: &mut FdMap, now: i64) -> StreamAction {
        // Periodic multicast rejoin.
        if self.mcast_rejoin_interval_ms > 0 && self.mcast_sock.is_some() {
            if now - self.last_mcast_rejoin_ms >= self.mcast_rejoin_interval_ms {
                if let (Some(sock), Some((group, source))) = (&self.mcast_sock, self.group()) {
                    match multicast::rejoin_group(sock.as_raw_fd(), group, source) {
                        Ok(()) => self.last_mcast_rejoin_ms = now,
                        Err(e) => log::error!("multicast rejoin failed: {}", e),
                    }
                }
            }
        }

        // Multicast silence.
        if self.mcast_sock.is_some() && now - self.last_mcast_data_ms >= MCAST_TIMEOUT_MS {
            log::error!(
                "multicast silent for {} ms, closing client",
                now - self.last_mcast_data_ms
            );
            return StreamAction::CloseConn;
        }

        // FCC timers.
        if self.fcc.active() {
            let elapsed = now - self.last_fcc_data_ms;
            match self.fcc.state {
                FccState::Requested | FccState::UnicastPending => {
                    if elapsed >= FCC_TIMEOUT_SIGNALING_MS {
                        let reason = if self.fcc.state == FccState::Requested {
                            "Signaling timeout"
                        } else {
                            "First unicast packet timeout"
                        };
                        log::warn!("FCC: {} after {} ms, falling back to multicast", reason, elapsed);
                        if self.fallback_to_mcast(conn, fdmap, now, reason)
                            == StreamAction::CloseConn
                        {
                            return StreamAction::CloseConn;
                        }
                    }
                }
                FccState::UnicastActive | FccState::McastRequested => {
                    if elapsed >= FCC_TIMEOUT_UNICAST_MS {
                        log::warn!("FCC: unicast stream interrupted, falling back to multicast");
                        if self.fallback_to_mcast(conn, fdmap, now, "Unicast interrupted")
                            == StreamAction::CloseConn
                        {
                            return StreamAction::CloseConn;
                        }
                    } else if self.fcc.state == FccState::UnicastActive
                        && self.fcc.unicast_start_ms > 0
                        && now - self.fcc.unicast_start_ms >= FCC_TIMEOUT_SYNC_WAIT_MS
                    {
                        // Server never sent the sync notification.
                        self.handle_fcc_sync(conn, fdmap, now, "sync wait timeout");
                    }
                }
                _ => {}
            }
        }

        // RTSP keepalive and timers.
        if let Some(rtsp) = self.rtsp.as_mut() {
            rtsp.maybe_keepalive(now);
            if rtsp.handshake_expired(now) {
                log::error!("RTSP: handshake timed out");
                return StreamAction::CloseConn;
            }
            if rtsp.teardown_expired(now) {
                log::debug!("RTSP: TEARDOWN response timeout, finishing cleanup");
                return StreamAction::CloseConn;
            }
        }

        // Reorder hole timeout.
        if self.reorder.waiting() {
            let fcc_seq = &mut self.fcc.current_seqn;
            let fcc_first = &mut self.fcc.not_first_packet;
            let total = &mut self.total_bytes_sent;
            let mut sink = |b: BufRef| {
                if let Some(s) = b.rtp_seq() {
                    *fcc_seq = s;
                    *fcc_first = true;
                }
                if conn.queue_media(&b, now).is_ok() {
                    *total += b.len() as u64;
                }
            };
            self.reorder.tick(now, &mut sink);
        }

        // Bandwidth snapshot once per second.
        if now - self.last_status_update_ms >= 1000 {
            let elapsed = now - self.last_status_update_ms;
            let delta = self.total_bytes_sent - self.last_bytes_sent;
            let bandwidth = if elapsed > 0 {
                (delta * 1000 / elapsed as u64) as u32
            } else {
                0
            };
            conn.status
                .update_bytes(self.status_index, self.total_bytes_sent, bandwidth);
            self.last_bytes_sent = self.total_bytes_sent;
            self.last_status_update_ms = now;
        }

        StreamAction::Continue
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Release upstream resources. The connection (and its service) stays
    /// owned by the caller. Returns `Deferred` when an RTSP TEARDOWN is in
    /// flight; the control socket then stays registered until the response
    /// or its timeout.
    pub fn cleanup(
        &mut self,
        epfd: RawFd,
        fdmap: &mut FdMap,
        status: &StatusShared,
        now: i64,
    ) -> CleanupStatus {
        self.reorder.clear();
        let stats = self.reorder.stats;
        if stats.out_of_order > 0 || stats.duplicates > 0 || stats.drops > 0 || stats.recovered > 0
        {
            log::debug!(
                "RTP reorder stats: out_of_order={} duplicates={} recovered={} drops={}",
                stats.out_of_order,
                stats.duplicates,
                stats.recovered,
                stats.drops
            );
        }

        self.fcc.cleanup();
        if let Some(sock) = self.fcc.take_socket() {
            poller::del_fd(epfd, sock.as_raw_fd());
            fdmap.del(sock.as_raw_fd());
        }

        if let Some(sock) = self.mcast_sock.take() {
            poller::del_fd(epfd, sock.as_raw_fd());
            fdmap.del(sock.as_raw_fd());
        }

        if let Some(rtsp) = self.rtsp.as_mut() {
            // Media sockets go now; the control socket may linger for the
            // TEARDOWN exchange.
            if let Some(fd) = rtsp.rtp_fd() {
                poller::del_fd(epfd, fd);
                fdmap.del(fd);
            }
            if let Some(fd) = rtsp.rtcp_fd() {
                poller::del_fd(epfd, fd);
                fdmap.del(fd);
            }
            rtsp.rtp_sock = None;
            rtsp.rtcp_sock = None;

            if rtsp.begin_teardown(status, now) {
                return CleanupStatus::Deferred;
            }
            if let Some(fd) = rtsp.sock_fd() {
                poller::del_fd(epfd, fd);
                fdmap.del(fd);
            }
            rtsp.close();
        }
        CleanupStatus::Done
    }

    /// True while an RTSP TEARDOWN response is still awaited.
    pub fn teardown_pending(&self) -> bool {
        self.rtsp
            .as_ref()
            .map(|r| r.state == RtspState::Teardown)
            .unwrap_or(false)
    }

    /// Final socket removal after a deferred RTSP cleanup resolves.
    pub fn finish_deferred_cleanup(&mut self, epfd: RawFd, fdmap: &mut FdMap) {
        if let Some(rtsp) = self.rtsp.as_mut() {
            if let Some(fd) = rtsp.sock_fd() {
                poller::del_fd(epfd, fd);
                fdmap.del(fd);
            }
            rtsp.close();
        }
    }
}

/// Receive one datagram into a pool buffer. On pool exhaustion the datagram
/// is drained into a scratch buffer and dropped so a level-triggered poll
/// cannot spin on it.
fn recv_datagram(fd: RawFd, conn: &Connection) -> Option<(BufRef, SocketAddrV4)> {
    let Some(buf) = conn.pools.alloc_media() else {
        log::debug!("buffer pool exhausted, dropping datagram");
        let mut scratch = [0u8; crate::pool::BUFFER_SIZE];
        // SAFETY: scratch is a valid writable buffer.
        unsafe {
            libc::recv(
                fd,
                scratch.as_mut_ptr() as *mut libc::c_void,
                scratch.len(),
                libc::MSG_DONTWAIT,
            )
        };
        return None;
    };

    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut slen = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let n = buf.with_storage_mut(|storage| {
        // SAFETY: storage is a valid writable buffer; sa/slen form a valid
        // out-parameter pair.
        unsafe {
            libc::recvfrom(
                fd,
                storage.as_mut_ptr() as *mut libc::c_void,
                storage.len(),
                libc::MSG_DONTWAIT,
                &mut sa as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut slen,
            )
        }
    });
    if n <= 0 {
        return None;
    }
    buf.set_offset(0);
    buf.set_len(n as usize);
    Some((buf, sock::sockaddr_v4_from(&sa)))
}
