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

fn main() {
    STOP.store(false, Ordering::Release);
    let cfg = Config::parse_from([
        "tsgate", "--listen", "127.0.0.1:0", "--r2h-token", "secret",
        "--service", "ch1=rtp://239.1.2.3:5000",
    ]);
    let status = StatusShared::new(0);
    let services = cfg.inline_services().expect("services");
    let listener = sock::tcp_listener(cfg.listen).expect("bind");
    let port = sock::local_port(listener.as_raw_fd()).expect("port");
    let mut pipe_fds = [0i32; 2];
    let rc = unsafe { libc::pipe2(pipe_fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    assert_eq!(rc, 0);
    let notif_rx = unsafe { OwnedFd::from_raw_fd(pipe_fds[0]) };
    status.add_notif_pipe(pipe_fds[1]);
    let worker_status = status.clone();
    let handle = std::thread::spawn(move || {
        let mut worker = Worker::new(0, listener, notif_rx, std::sync::Arc::new(cfg), worker_status, services, false).expect("worker");
        eprintln!("worker created, running");
        let r = worker.run();
        eprintln!("worker run returned: {:?}", r);
        r
    });
    std::thread::sleep(Duration::from_millis(200));
    eprintln!("connecting");
    let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    stream.set_read_timeout(Some(Duration::from_secs(2))).expect("timeout");
    stream.write_all(b"HEAD /ch1?r2h-token=secret HTTP/1.1\r\nHost: gw\r\n\r\n").expect("write");
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) => { eprintln!("read err: {:?}", e); break; }
        }
    }
    println!("resp: {}", String::from_utf8_lossy(&out));
    STOP.store(true, Ordering::Release);
    let _ = handle.join();
}
