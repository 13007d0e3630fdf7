// src/main.rs - Process setup: config, logging, listeners, workers

use clap::Parser;
use std::io::Write;
use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::Arc;
use tsgate::config::Config;
use tsgate::error::{GatewayError, EXIT_SOCK_FATAL};
use tsgate::status::{GatewayLogger, StatusShared};
use tsgate::worker::{Worker, STOP};
use tsgate::{fetch, m3u, service::Service, sock};

extern "C" fn term_handler(_signum: libc::c_int) {
    STOP.store(true, std::sync::atomic::Ordering::Release);
}

fn install_signal_handlers() {
    let handler = term_handler as extern "C" fn(libc::c_int) as libc::sighandler_t;
    // SAFETY: term_handler only touches an atomic; SIGPIPE is ignored so
    // writes to dead sockets surface as EPIPE.
    unsafe {
        libc::signal(libc::SIGTERM, handler);
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

fn load_playlist_services(cfg: &Config) -> Result<Vec<Service>, GatewayError> {
    let Some(source) = &cfg.playlist else {
        return Ok(Vec::new());
    };
    let content = if source.starts_with("http://") || source.starts_with("https://") {
        fetch::fetch_blocking(source)
            .ok_or_else(|| GatewayError::Config(format!("cannot fetch playlist {}", source)))?
    } else {
        std::fs::read_to_string(source)
            .map_err(|e| GatewayError::Config(format!("cannot read playlist {}: {}", source, e)))?
    };
    let services = m3u::parse_services(&content);
    if services.is_empty() {
        log::warn!("playlist {} contained no usable services", source);
    }
    Ok(services)
}

fn run(cfg: Config) -> Result<(), GatewayError> {
    let status = StatusShared::new(tsgate::realtime_ms());

    // env_logger prints; the wrapper mirrors records into the status log
    // ring. Runtime level changes go through log::set_max_level.
    let printer = env_logger::Builder::new()
        .filter_level(log::LevelFilter::Trace)
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {} {}",
                buf.timestamp_millis(),
                record.level(),
                record.args()
            )
        })
        .build();
    GatewayLogger::install(printer, status.clone(), cfg.log_filter());

    let mut services = cfg.inline_services()?;
    services.extend(load_playlist_services(&cfg)?);
    log::info!("{} service(s) configured", services.len());

    let zerocopy = cfg.zerocopy && sock::detect_zerocopy_support();
    if cfg.zerocopy && !zerocopy {
        log::warn!("MSG_ZEROCOPY unavailable (kernel 4.14+ required), using regular send");
    } else if zerocopy {
        log::info!("MSG_ZEROCOPY sends enabled");
    }

    install_signal_handlers();

    let cfg = Arc::new(cfg);
    let workers = cfg.workers.max(1);
    let mut handles = Vec::with_capacity(workers);

    for worker_id in 0..workers {
        // Bind in the parent so failures surface as a clean exit code.
        let listener = sock::tcp_listener(cfg.listen).map_err(|e| GatewayError::Bind {
            addr: cfg.listen.to_string(),
            source: e,
        })?;

        let mut pipe_fds = [0i32; 2];
        // SAFETY: pipe_fds is a valid out-array.
        let rc = unsafe { libc::pipe2(pipe_fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rc < 0 {
            return Err(GatewayError::Poller(std::io::Error::last_os_error()));
        }
        // SAFETY: fresh pipe fd owned from here on.
        let notif_rx = unsafe { OwnedFd::from_raw_fd(pipe_fds[0]) };
        status.add_notif_pipe(pipe_fds[1]);

        let cfg = cfg.clone();
        let status = status.clone();
        let services = services.clone();
        let builder = std::thread::Builder::new().name(format!("worker-{}", worker_id));
        let handle = builder
            .spawn(move || {
                let mut worker =
                    match Worker::new(worker_id, listener, notif_rx, cfg, status, services, zerocopy)
                    {
                        Ok(w) => w,
                        Err(e) => {
                            log::error!("worker {} setup failed: {}", worker_id, e);
                            std::process::exit(EXIT_SOCK_FATAL);
                        }
                    };
                if let Err(e) = worker.run() {
                    log::error!("worker {} failed: {}", worker_id, e);
                    std::process::exit(EXIT_SOCK_FATAL);
                }
            })
            .map_err(GatewayError::Poller)?;
        handles.push(handle);
    }

    log::info!(
        "listening on {} with {} worker(s)",
        cfg.listen,
        workers
    );

    for handle in handles {
        let _ = handle.join();
    }
    Ok(())
}

fn main() {
    let cfg = Config::parse();
    if let Err(e) = run(cfg) {
        eprintln!("tsgate: {}", e);
        std::process::exit(e.exit_code());
    }
}
