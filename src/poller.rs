// src/poller.rs - epoll readiness facility
//
// One instance per worker. Level-triggered: the send path toggles EPOLLOUT
// interest per connection (batching keeps it off until a flush is due), and
// UDP media sockets are drained one datagram per event so a level report
// re-fires while data remains.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Event interest flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const READABLE: Interest = Interest {
        readable: true,
        writable: false,
    };

    pub const WRITABLE: Interest = Interest {
        readable: false,
        writable: true,
    };

    pub fn add_writable(self) -> Interest {
        Interest {
            writable: true,
            ..self
        }
    }
}

/// IO event as reported by `poll`. The token is the ready fd; owners are
/// resolved through the worker's fd map.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hangup: bool,
}

const MAX_EVENTS: usize = 1024;

fn interest_to_epoll(interest: Interest) -> u32 {
    let mut events = (libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32;
    if interest.readable {
        events |= libc::EPOLLIN as u32;
    }
    if interest.writable {
        events |= libc::EPOLLOUT as u32;
    }
    events
}

fn epoll_ctl(epfd: RawFd, op: libc::c_int, fd: RawFd, interest: Option<Interest>) -> io::Result<()> {
    let mut ev = libc::epoll_event {
        events: interest.map(interest_to_epoll).unwrap_or(0),
        u64: fd as u64,
    };
    let evp = if interest.is_some() {
        &mut ev as *mut libc::epoll_event
    } else {
        std::ptr::null_mut()
    };
    // SAFETY: epfd is a valid epoll fd, ev is a properly initialized event
    // (or null, which EPOLL_CTL_DEL permits).
    let rc = unsafe { libc::epoll_ctl(epfd, op, fd, evp) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Update interest on an already-registered fd without going through the
/// `Poller` borrow. Connections store the raw epoll fd and use this to
/// toggle EPOLLOUT, exactly like the interest updates in the worker itself.
pub fn set_interest(epfd: RawFd, fd: RawFd, interest: Interest) {
    if let Err(e) = epoll_ctl(epfd, libc::EPOLL_CTL_MOD, fd, Some(interest)) {
        log::debug!("epoll MOD failed for fd {}: {}", fd, e);
    }
}

/// Register an upstream fd from stream code that only holds the raw epoll
/// fd. Errors are fatal for the stream, not the worker.
pub fn add_fd(epfd: RawFd, fd: RawFd, interest: Interest) -> io::Result<()> {
    epoll_ctl(epfd, libc::EPOLL_CTL_ADD, fd, Some(interest))
}

/// Remove an fd ahead of close(); tolerates the fd not being registered.
pub fn del_fd(epfd: RawFd, fd: RawFd) {
    if let Err(e) = epoll_ctl(epfd, libc::EPOLL_CTL_DEL, fd, None) {
        log::debug!("epoll DEL failed for fd {}: {}", fd, e);
    }
}

pub struct Poller {
    epfd: RawFd,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        // SAFETY: plain syscall, result checked immediately.
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Poller { epfd })
    }

    /// Raw epoll fd, handed to connections for interest toggling.
    pub fn raw(&self) -> RawFd {
        self.epfd
    }

    pub fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, Some(interest))
    }

    pub fn modify(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, Some(interest))
    }

    pub fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, None)
    }

    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Event>> {
        let timeout_ms = timeout.map(|d| d.as_millis() as i32).unwrap_or(-1);

        let mut events: [libc::epoll_event; MAX_EVENTS] =
            // SAFETY: epoll_event is POD; all-zero is a valid (empty) event
            // and the array is only read up to the count epoll_wait returns.
            unsafe { std::mem::zeroed() };

        loop {
            // SAFETY: events points to MAX_EVENTS writable entries; the
            // result is checked, EINTR retried.
            let n = unsafe {
                libc::epoll_wait(self.epfd, events.as_mut_ptr(), MAX_EVENTS as i32, timeout_ms)
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }

            let mut out = Vec::with_capacity(n as usize);
            for ev in events.iter().take(n as usize) {
                out.push(Event {
                    fd: ev.u64 as RawFd,
                    readable: ev.events & libc::EPOLLIN as u32 != 0,
                    writable: ev.events & libc::EPOLLOUT as u32 != 0,
                    error: ev.events & libc::EPOLLERR as u32 != 0,
                    hangup: ev.events & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0,
                });
            }
            return Ok(out);
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        // SAFETY: epfd is owned exclusively by self and closed exactly once.
        unsafe { libc::close(self.epfd) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::AsRawFd;

    #[test]
    fn test_poller_read_write_readiness() {
        let mut poller = Poller::new().expect("Failed to create poller");

        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind");
        let addr = listener.local_addr().expect("Failed to get address");
        let client = TcpStream::connect(addr).expect("Failed to connect");
        client.set_nonblocking(true).expect("Failed to set nonblocking");
        let (mut server, _) = listener.accept().expect("Failed to accept");
        server.set_nonblocking(true).expect("Failed to set nonblocking");

        poller
            .register(client.as_raw_fd(), Interest::READABLE)
            .expect("Failed to register");
        poller
            .register(server.as_raw_fd(), Interest::WRITABLE)
            .expect("Failed to register");

        let events = poller
            .poll(Some(Duration::from_millis(100)))
            .expect("Failed to poll");
        assert!(events.iter().any(|e| e.fd == server.as_raw_fd() && e.writable));

        server.write_all(b"hello").expect("Failed to write");

        let events = poller
            .poll(Some(Duration::from_millis(100)))
            .expect("Failed to poll");
        assert!(events.iter().any(|e| e.fd == client.as_raw_fd() && e.readable));

        poller.deregister(client.as_raw_fd()).expect("Failed to deregister");
        poller.deregister(server.as_raw_fd()).expect("Failed to deregister");
    }

    #[test]
    fn test_deregistered_fd_reports_nothing() {
        let mut poller = Poller::new().expect("Failed to create poller");

        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind");
        let addr = listener.local_addr().expect("Failed to get address");
        let client = TcpStream::connect(addr).expect("Failed to connect");
        let (mut server, _) = listener.accept().expect("Failed to accept");

        poller
            .register(client.as_raw_fd(), Interest::READABLE)
            .expect("Failed to register");
        poller.deregister(client.as_raw_fd()).expect("Failed to deregister");

        server.write_all(b"x").expect("Failed to write");
        let events = poller
            .poll(Some(Duration::from_millis(50)))
            .expect("Failed to poll");
        assert!(!events.iter().any(|e| e.fd == client.as_raw_fd()));
    }

    #[test]
    fn test_interest_modify_toggles_writable() {
        let mut poller = Poller::new().expect("Failed to create poller");

        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind");
        let addr = listener.local_addr().expect("Failed to get address");
        let _client = TcpStream::connect(addr).expect("Failed to connect");
        let (server, _) = listener.accept().expect("Failed to accept");
        let fd = server.as_raw_fd();

        poller.register(fd, Interest::READABLE).expect("Failed to register");
        let events = poller
            .poll(Some(Duration::from_millis(50)))
            .expect("Failed to poll");
        assert!(!events.iter().any(|e| e.fd == fd && e.writable));

        set_interest(poller.raw(), fd, Interest::READABLE.add_writable());
        let events = poller
            .poll(Some(Duration::from_millis(50)))
            .expect("Failed to poll");
        assert!(events.iter().any(|e| e.fd == fd && e.writable));
    }
}
