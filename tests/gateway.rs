// End-to-end checks against a live worker: real listener, real epoll loop,
// real HTTP clients. Everything runs inside one test body because the
// worker stop flag is process-global.

use clap::Parser;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tsgate::config::Config;
use tsgate::sock;
use tsgate::status::StatusShared;
use tsgate::worker::{Worker, STOP};

fn request(port: u16, req: &str) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .expect("timeout");
    stream.write_all(req.as_bytes()).expect("write");
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Read from a stream until `marker` appears or the timeout runs out.
fn read_until(stream: &mut TcpStream, marker: &str, attempts: usize) -> String {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    for _ in 0..attempts {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                out.extend_from_slice(&buf[..n]);
                if String::from_utf8_lossy(&out).contains(marker) {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[test]
fn test_http_surface_end_to_end() {
    STOP.store(false, Ordering::Release);

    let cfg = Config::parse_from([
        "tsgate",
        "--listen",
        "127.0.0.1:0",
        "--r2h-token",
        "secret",
        "--service",
        "ch1=rtp://239.1.2.3:5000",
    ]);
    let status = StatusShared::new(0);
    let services = cfg.inline_services().expect("services");

    let listener = sock::tcp_listener(cfg.listen).expect("bind");
    let port = sock::local_port(listener.as_raw_fd()).expect("port");

    let mut pipe_fds = [0i32; 2];
    // SAFETY: pipe_fds is a valid out-array.
    let rc = unsafe { libc::pipe2(pipe_fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    assert_eq!(rc, 0);
    // SAFETY: fresh pipe fd owned from here on.
    let notif_rx = unsafe { OwnedFd::from_raw_fd(pipe_fds[0]) };
    status.add_notif_pipe(pipe_fds[1]);

    // The worker is single-threaded state; build it on its own thread.
    let worker_status = status.clone();
    let handle = std::thread::spawn(move || {
        let mut worker = Worker::new(
            0,
            listener,
            notif_rx,
            std::sync::Arc::new(cfg),
            worker_status,
            services,
            false,
        )
        .expect("worker");
        worker.run()
    });
    std::thread::sleep(Duration::from_millis(50));

    // HEAD on a configured service: success headers, no upstream join.
    let resp = request(
        port,
        "HEAD /ch1?r2h-token=secret HTTP/1.1\r\nHost: gw\r\n\r\n",
    );
    assert!(resp.starts_with("HTTP/1.1 200 OK"), "got: {}", resp);
    assert!(resp.contains("Content-Type: video/mp2t"));
    assert_eq!(status.total_clients(), 0, "HEAD must not register a client");

    // Missing token: 401 on every route.
    let resp = request(port, "GET /ch1 HTTP/1.1\r\nHost: gw\r\n\r\n");
    assert!(resp.starts_with("HTTP/1.1 401"), "got: {}", resp);

    // Unknown service: 404.
    let resp = request(
        port,
        "GET /nope?r2h-token=secret HTTP/1.1\r\nHost: gw\r\n\r\n",
    );
    assert!(resp.starts_with("HTTP/1.1 404"), "got: {}", resp);

    // Status page.
    let resp = request(
        port,
        "GET /status?r2h-token=secret HTTP/1.1\r\nHost: gw\r\n\r\n",
    );
    assert!(resp.starts_with("HTTP/1.1 200 OK"), "got: {}", resp);
    assert!(resp.contains("text/html"));
    assert!(resp.contains("tsgate"));

    // Transformed playlist points back at this gateway.
    let resp = request(
        port,
        "GET /playlist.m3u?r2h-token=secret HTTP/1.1\r\nHost: gw.local:5140\r\n\r\n",
    );
    assert!(resp.starts_with("HTTP/1.1 200 OK"), "got: {}", resp);
    assert!(resp.contains("audio/x-mpegurl"));
    assert!(resp.contains("#EXTM3U"));
    assert!(resp.contains("http://gw.local:5140/ch1"));

    // Log-level API round-trip.
    let body = "level=debug";
    let resp = request(
        port,
        &format!(
            "POST /status/api/log-level?r2h-token=secret HTTP/1.1\r\nHost: gw\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        ),
    );
    assert!(resp.contains("{\"ok\":true}"), "got: {}", resp);

    // SSE: headers plus at least one data frame.
    let mut sse = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    sse.set_read_timeout(Some(Duration::from_millis(500))).expect("timeout");
    sse.write_all(b"GET /status/sse?r2h-token=secret HTTP/1.1\r\nHost: gw\r\n\r\n")
        .expect("write");
    let head = read_until(&mut sse, "\n\n", 10);
    assert!(head.starts_with("HTTP/1.1 200 OK"), "got: {}", head);
    assert!(head.contains("text/event-stream"));
    let frame = if head.contains("data: ") {
        head
    } else {
        read_until(&mut sse, "data: ", 10)
    };
    assert!(frame.contains("data: {"), "got: {}", frame);
    drop(sse);

    STOP.store(true, Ordering::Release);
    handle.join().expect("join").expect("worker run");
}
