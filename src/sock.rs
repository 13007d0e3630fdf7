// src/sock.rs - Socket creation and option helpers

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

/// Unacknowledged data fails the connection after this long, so stuck-ack
/// clients release their resources quickly.
pub const TCP_USER_TIMEOUT_MS: libc::c_int = 10_000;

const SO_ZEROCOPY: libc::c_int = 60;

pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a valid fd; flags round-tripped unchanged apart from
    // O_NONBLOCK.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn setsockopt_int(fd: RawFd, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
    // SAFETY: value is a valid c_int with correct size reported.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn set_tcp_nodelay(fd: RawFd) -> io::Result<()> {
    setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1)
}

pub fn set_tcp_user_timeout(fd: RawFd) -> io::Result<()> {
    setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_USER_TIMEOUT, TCP_USER_TIMEOUT_MS)
}

/// Enable MSG_ZEROCOPY sends on a socket. Returns false when the kernel
/// lacks support (pre-4.14).
pub fn enable_so_zerocopy(fd: RawFd) -> bool {
    setsockopt_int(fd, libc::SOL_SOCKET, SO_ZEROCOPY, 1).is_ok()
}

/// Probe MSG_ZEROCOPY support once at startup on a throwaway socket.
pub fn detect_zerocopy_support() -> bool {
    // SAFETY: plain socket(), checked and closed below.
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return false;
    }
    let ok = enable_so_zerocopy(fd);
    // SAFETY: fd was just created here.
    unsafe { libc::close(fd) };
    ok
}

pub fn sockaddr_in_from(addr: SocketAddrV4) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: addr.port().to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(addr.ip().octets()),
        },
        sin_zero: [0; 8],
    }
}

/// Convert an accept()-filled sockaddr_storage into a std address.
pub fn sockaddr_storage_to_std(sa: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match sa.ss_family as libc::c_int {
        libc::AF_INET => {
            // SAFETY: ss_family says this storage holds a sockaddr_in.
            let v4 = unsafe { &*(sa as *const libc::sockaddr_storage as *const libc::sockaddr_in) };
            Some(SocketAddr::V4(sockaddr_v4_from(v4)))
        }
        libc::AF_INET6 => {
            // SAFETY: ss_family says this storage holds a sockaddr_in6.
            let v6 =
                unsafe { &*(sa as *const libc::sockaddr_storage as *const libc::sockaddr_in6) };
            Some(SocketAddr::V6(std::net::SocketAddrV6::new(
                std::net::Ipv6Addr::from(v6.sin6_addr.s6_addr),
                u16::from_be(v6.sin6_port),
                v6.sin6_flowinfo,
                v6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

pub fn sockaddr_v4_from(raw: &libc::sockaddr_in) -> SocketAddrV4 {
    SocketAddrV4::new(
        Ipv4Addr::from(raw.sin_addr.s_addr.to_ne_bytes()),
        u16::from_be(raw.sin_port),
    )
}

/// Non-blocking IPv4 UDP socket, optionally bound.
pub fn udp_socket(bind: Option<SocketAddrV4>) -> io::Result<OwnedFd> {
    // SAFETY: plain socket(), result checked.
    let fd = unsafe {
        libc::socket(
            libc::AF_INET,
            libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd is valid and owned from here on.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    if let Some(addr) = bind {
        setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
        let sa = sockaddr_in_from(addr);
        // SAFETY: sa is a fully initialized sockaddr_in.
        let rc = unsafe {
            libc::bind(
                fd,
                &sa as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(owned)
}

/// Local port of a bound socket.
pub fn local_port(fd: RawFd) -> io::Result<u16> {
    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    // SAFETY: sa/len form a valid out-parameter pair.
    let rc = unsafe {
        libc::getsockname(
            fd,
            &mut sa as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(u16::from_be(sa.sin_port))
}

/// Send a datagram, ignoring EAGAIN (control packets are fire-and-forget).
pub fn send_to(fd: RawFd, data: &[u8], dest: SocketAddrV4) -> io::Result<usize> {
    let sa = sockaddr_in_from(dest);
    // SAFETY: data pointer/length pair is valid; sa fully initialized.
    let rc = unsafe {
        libc::sendto(
            fd,
            data.as_ptr() as *const libc::c_void,
            data.len(),
            libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
            &sa as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(rc as usize)
}

/// Bind a `SO_REUSEPORT` TCP listener so sibling workers load-balance
/// accepted connections in the kernel.
pub fn tcp_listener(addr: SocketAddr) -> io::Result<OwnedFd> {
    let SocketAddr::V4(v4) = addr else {
        return bind_v6_listener(addr);
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
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
    setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, 1)?;
    let sa = sockaddr_in_from(v4);
    // SAFETY: sa is a fully initialized sockaddr_in.
    let rc = unsafe {
        libc::bind(
            fd,
            &sa as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd is a bound socket.
    if unsafe { libc::listen(fd, 128) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(owned)
}

fn bind_v6_listener(addr: SocketAddr) -> io::Result<OwnedFd> {
    let SocketAddr::V6(v6) = addr else {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "not an inet address"));
    };
    // SAFETY: plain socket(), result checked.
    let fd = unsafe {
        libc::socket(
            libc::AF_INET6,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd is valid and owned from here on.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
    setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, 1)?;
    setsockopt_int(fd, libc::IPPROTO_IPV6, libc::IPV6_V6ONLY, 1)?;
    let mut sa: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
    sa.sin6_family = libc::AF_INET6 as libc::sa_family_t;
    sa.sin6_port = v6.port().to_be();
    sa.sin6_addr.s6_addr = v6.ip().octets();
    // SAFETY: sa is a fully initialized sockaddr_in6.
    let rc = unsafe {
        libc::bind(
            fd,
            &sa as *const libc::sockaddr_in6 as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd is a bound socket.
    if unsafe { libc::listen(fd, 128) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(owned)
}

/// Bind the socket to a specific upstream interface (SO_BINDTODEVICE),
/// used when the IPTV VLAN is not the default route.
pub fn bind_to_interface(fd: RawFd, interface: &str) -> io::Result<()> {
    // SAFETY: name pointer/length pair is valid for the call duration.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            interface.as_ptr() as *const libc::c_void,
            interface.len() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn test_udp_socket_bind_and_port() {
        let sock = udp_socket(Some(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)))
            .expect("Failed to create socket");
        let port = local_port(sock.as_raw_fd()).expect("Failed to get port");
        assert!(port > 0);
    }

    #[test]
    fn test_sockaddr_roundtrip() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(239, 1, 2, 3), 5000);
        let raw = sockaddr_in_from(addr);
        assert_eq!(sockaddr_v4_from(&raw), addr);
    }

    #[test]
    fn test_reuseport_allows_double_bind() {
        let a = tcp_listener("127.0.0.1:0".parse().unwrap()).expect("Failed to bind");
        let port = local_port(a.as_raw_fd()).expect("Failed to get port");
        let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
        let _b = tcp_listener(addr).expect("second SO_REUSEPORT bind should succeed");
    }

    #[test]
    fn test_send_to_loopback() {
        let rx = udp_socket(Some(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)))
            .expect("Failed to create socket");
        let port = local_port(rx.as_raw_fd()).expect("Failed to get port");
        let tx = udp_socket(None).expect("Failed to create socket");
        let n = send_to(
            tx.as_raw_fd(),
            b"ping",
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, port),
        )
        .expect("send");
        assert_eq!(n, 4);
    }
}
