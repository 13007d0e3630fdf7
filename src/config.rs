// src/config.rs - CLI flags and runtime configuration

use crate::error::GatewayError;
use crate::service::Service;
use clap::Parser;
use std::net::SocketAddr;

/// IPTV multicast/RTSP to HTTP MPEG-TS gateway.
#[derive(Parser, Debug, Clone)]
#[command(name = "tsgate", version, about)]
pub struct Config {
    /// Listen address for the HTTP side.
    #[arg(long, default_value = "0.0.0.0:5140")]
    pub listen: SocketAddr,

    /// Worker threads; the kernel load-balances accepted connections across
    /// them via SO_REUSEPORT.
    #[arg(long, default_value_t = 1)]
    pub workers: usize,

    /// If set, the Host header must match (case-insensitive, :port ignored).
    #[arg(long)]
    pub hostname: Option<String>,

    /// Shared bearer token; when set, every request must carry
    /// ?r2h-token=<value>.
    #[arg(long = "r2h-token")]
    pub r2h_token: Option<String>,

    /// Global cap on concurrently streaming clients.
    #[arg(long, default_value_t = 64)]
    pub maxclients: usize,

    /// Upper bound on media buffer pool size, per worker.
    #[arg(long = "pool-max-buffers", default_value_t = 16384)]
    pub pool_max_buffers: usize,

    /// Use MSG_ZEROCOPY sends when the kernel supports it.
    #[arg(long, default_value_t = false)]
    pub zerocopy: bool,

    /// Disable UDPxy-compatible /rtp/... and /udp/... request paths.
    #[arg(long = "no-udpxy", default_value_t = false)]
    pub no_udpxy: bool,

    /// Re-issue the IGMP join every N seconds (0 = never). Some access
    /// networks silently expire memberships.
    #[arg(long = "mcast-rejoin-interval", default_value_t = 0)]
    pub mcast_rejoin_interval: u64,

    /// Route of the status page (and its /sse and /api/* children).
    #[arg(long = "status-route", default_value = "status")]
    pub status_route: String,

    /// M3U playlist to load services from: a local path or an http(s) URL.
    #[arg(long)]
    pub playlist: Option<String>,

    /// Refresh an http(s) playlist every N seconds (0 = never).
    #[arg(long = "playlist-refresh", default_value_t = 0)]
    pub playlist_refresh: u64,

    /// Bind upstream (multicast/FCC/RTSP) sockets to this interface.
    #[arg(long = "upstream-interface")]
    pub upstream_interface: Option<String>,

    /// Inline service definition, repeatable: NAME=rtp://group:port[?fcc=..]
    /// or NAME=rtsp://server/path.
    #[arg(long = "service", value_name = "NAME=URL")]
    pub services: Vec<String>,

    /// Prefer UDP transport for RTSP upstreams (default: interleaved TCP).
    #[arg(long = "rtsp-udp", default_value_t = false)]
    pub rtsp_udp: bool,

    /// Increase verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Config {
    pub fn udpxy_enabled(&self) -> bool {
        !self.no_udpxy
    }

    pub fn log_filter(&self) -> log::LevelFilter {
        match self.verbose {
            0 => log::LevelFilter::Info,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }

    /// Parse the inline --service definitions. Playlist services are loaded
    /// separately (and possibly refreshed at runtime).
    pub fn inline_services(&self) -> Result<Vec<Service>, GatewayError> {
        let mut out = Vec::with_capacity(self.services.len());
        for def in &self.services {
            match Service::from_definition(def) {
                Some(svc) => out.push(svc),
                None => {
                    return Err(GatewayError::Config(format!(
                        "invalid service definition: {}",
                        def
                    )))
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::parse_from(["tsgate"]);
        assert_eq!(cfg.listen.port(), 5140);
        assert_eq!(cfg.workers, 1);
        assert!(cfg.udpxy_enabled());
        assert_eq!(cfg.log_filter(), log::LevelFilter::Info);
        assert!(cfg.inline_services().expect("services").is_empty());
    }

    #[test]
    fn test_service_flags() {
        let cfg = Config::parse_from([
            "tsgate",
            "--service",
            "ch1=rtp://239.1.1.1:5000",
            "--service",
            "vod=rtsp://srv:554/a",
            "-vv",
        ]);
        let services = cfg.inline_services().expect("services");
        assert_eq!(services.len(), 2);
        assert_eq!(services[0].name, "ch1");
        assert_eq!(cfg.log_filter(), log::LevelFilter::Trace);
    }

    #[test]
    fn test_bad_service_definition_is_config_error() {
        let cfg = Config::parse_from(["tsgate", "--service", "broken"]);
        assert!(cfg.inline_services().is_err());
    }
}
