// src/fetch.rs - Asynchronous HTTP(S) fetch for external playlists
//
// Runs curl as a child process with its stdout piped through the worker's
// epoll, so playlist refreshes never block the event loop. The completion
// callback receives the body, or None on failure/cancellation.

use crate::poller::{self, Interest};
use std::io::Read;
use std::os::fd::{AsRawFd, RawFd};
use std::process::{Child, Command, Stdio};

const FETCH_MAX_BYTES: usize = 4 * 1024 * 1024;

type FetchCallback = Box<dyn FnOnce(Option<String>)>;

struct HttpFetch {
    child: Child,
    stdout: std::process::ChildStdout,
    buf: Vec<u8>,
    url: String,
    callback: Option<FetchCallback>,
}

/// Active fetches of one worker.
pub struct FetchRegistry {
    active: Vec<HttpFetch>,
}

impl FetchRegistry {
    pub fn new() -> Self {
        FetchRegistry { active: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Spawn curl for `url` and register its pipe with the epoll instance.
    pub fn start(
        &mut self,
        url: &str,
        epfd: RawFd,
        callback: FetchCallback,
    ) -> std::io::Result<()> {
        let mut child = Command::new("curl")
            .args(["-fsSL", "--max-time", "30", url])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let stdout = child.stdout.take().expect("stdout piped above");
        let fd = stdout.as_raw_fd();
        crate::sock::set_nonblocking(fd)?;
        poller::add_fd(epfd, fd, Interest::READABLE)?;
        log::debug!("fetch started for {} (pid {})", url, child.id());
        self.active.push(HttpFetch {
            child,
            stdout,
            buf: Vec::with_capacity(8192),
            url: url.to_string(),
            callback: Some(callback),
        });
        Ok(())
    }

    pub fn owns(&self, fd: RawFd) -> bool {
        self.active.iter().any(|f| f.stdout.as_raw_fd() == fd)
    }

    /// Pipe readiness: read available data; on EOF reap the child and fire
    /// the callback.
    pub fn handle_event(&mut self, fd: RawFd, epfd: RawFd) {
        let Some(pos) = self.active.iter().position(|f| f.stdout.as_raw_fd() == fd) else {
            return;
        };

        let mut done = false;
        {
            let fetch = &mut self.active[pos];
            let mut chunk = [0u8; 8192];
            loop {
                match fetch.stdout.read(&mut chunk) {
                    Ok(0) => {
                        done = true;
                        break;
                    }
                    Ok(n) => {
                        fetch.buf.extend_from_slice(&chunk[..n]);
                        if fetch.buf.len() > FETCH_MAX_BYTES {
                            log::error!("fetch of {} exceeded size cap", fetch.url);
                            done = true;
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        log::error!("fetch read error for {}: {}", fetch.url, e);
                        done = true;
                        break;
                    }
                }
            }
        }
        if !done {
            return;
        }

        let mut fetch = self.active.swap_remove(pos);
        poller::del_fd(epfd, fd);
        let success = match fetch.child.wait() {
            Ok(exit) => exit.success() && fetch.buf.len() <= FETCH_MAX_BYTES,
            Err(_) => false,
        };
        let body_len = fetch.buf.len();
        let content = if success {
            String::from_utf8(std::mem::take(&mut fetch.buf)).ok()
        } else {
            None
        };
        if content.is_none() {
            log::warn!("fetch of {} failed", fetch.url);
        } else {
            log::debug!("fetch of {} complete ({} bytes)", fetch.url, body_len);
        }
        if let Some(cb) = fetch.callback.take() {
            cb(content);
        }
    }

    /// Kill every in-flight fetch; callbacks fire with None.
    pub fn cancel_all(&mut self, epfd: RawFd) {
        for mut fetch in self.active.drain(..) {
            poller::del_fd(epfd, fetch.stdout.as_raw_fd());
            let _ = fetch.child.kill();
            let _ = fetch.child.wait();
            if let Some(cb) = fetch.callback.take() {
                cb(None);
            }
        }
    }
}

impl Default for FetchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Blocking fetch for startup-time playlist loading, before the event loop
/// runs.
pub fn fetch_blocking(url: &str) -> Option<String> {
    let output = Command::new("curl")
        .args(["-fsSL", "--max-time", "30", url])
        .stderr(Stdio::null())
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout).ok()
}
