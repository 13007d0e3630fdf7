// src/multicast.rs - IGMP group membership
//
// Join sockets bind to the group address/port so the kernel filters foreign
// traffic, then add (source-specific) membership. Periodic rejoin issues a
// drop+add on the same socket to force a fresh IGMP Report; some access
// networks silently expire memberships otherwise.

use crate::sock;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

fn in_addr(ip: Ipv4Addr) -> libc::in_addr {
    libc::in_addr {
        s_addr: u32::from_ne_bytes(ip.octets()),
    }
}

fn membership_op(
    fd: RawFd,
    group: Ipv4Addr,
    source: Option<Ipv4Addr>,
    add: bool,
) -> io::Result<()> {
    let rc = match source {
        Some(src) => {
            let req = libc::ip_mreq_source {
                imr_multiaddr: in_addr(group),
                imr_interface: in_addr(Ipv4Addr::UNSPECIFIED),
                imr_sourceaddr: in_addr(src),
            };
            let name = if add {
                libc::IP_ADD_SOURCE_MEMBERSHIP
            } else {
                libc::IP_DROP_SOURCE_MEMBERSHIP
            };
            // SAFETY: req is fully initialized and outlives the call.
            unsafe {
                libc::setsockopt(
                    fd,
                    libc::IPPROTO_IP,
                    name,
                    &req as *const libc::ip_mreq_source as *const libc::c_void,
                    std::mem::size_of::<libc::ip_mreq_source>() as libc::socklen_t,
                )
            }
        }
        None => {
            let req = libc::ip_mreq {
                imr_multiaddr: in_addr(group),
                imr_interface: in_addr(Ipv4Addr::UNSPECIFIED),
            };
            let name = if add {
                libc::IP_ADD_MEMBERSHIP
            } else {
                libc::IP_DROP_MEMBERSHIP
            };
            // SAFETY: req is fully initialized and outlives the call.
            unsafe {
                libc::setsockopt(
                    fd,
                    libc::IPPROTO_IP,
                    name,
                    &req as *const libc::ip_mreq as *const libc::c_void,
                    std::mem::size_of::<libc::ip_mreq>() as libc::socklen_t,
                )
            }
        }
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Create a socket joined to `group`, optionally source-specific and bound
/// to a specific upstream interface.
pub fn join_group(
    group: SocketAddrV4,
    source: Option<Ipv4Addr>,
    interface: Option<&str>,
) -> io::Result<OwnedFd> {
    let sock = sock::udp_socket(Some(group))?;
    if let Some(ifname) = interface {
        sock::bind_to_interface(sock.as_raw_fd(), ifname)?;
    }
    membership_op(sock.as_raw_fd(), *group.ip(), source, true)?;
    log::debug!("joined multicast group {}", group);
    Ok(sock)
}

/// Refresh membership on an existing socket: leave then join again so the
/// kernel emits a new IGMP Report.
pub fn rejoin_group(
    fd: RawFd,
    group: SocketAddrV4,
    source: Option<Ipv4Addr>,
) -> io::Result<()> {
    // Drop may fail if the membership already expired upstream; the join is
    // what matters.
    if let Err(e) = membership_op(fd, *group.ip(), source, false) {
        log::debug!("multicast leave before rejoin failed: {}", e);
    }
    membership_op(fd, *group.ip(), source, true)?;
    log::debug!("rejoined multicast group {}", group);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_and_rejoin() {
        let group: SocketAddrV4 = "239.255.42.42:5004".parse().unwrap();
        // Multicast joins need a multicast-capable interface; skip quietly
        // in environments without one.
        let sock = match join_group(group, None, None) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("skipping: multicast unavailable ({})", e);
                return;
            }
        };
        rejoin_group(sock.as_raw_fd(), group, None).expect("rejoin on same socket");
    }

    #[test]
    fn test_join_bad_interface_fails() {
        let group: SocketAddrV4 = "239.255.42.43:5004".parse().unwrap();
        let err = join_group(group, None, Some("no-such-if0"));
        assert!(err.is_err());
    }
}
