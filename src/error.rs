// src/error.rs - Error types and process exit codes

use std::io;
use thiserror::Error;

/// Exit code domains. Per-client conditions never terminate the process;
/// these cover the fatal startup/loop failures only.
pub const EXIT_OK: i32 = 0;
pub const EXIT_CONFIG: i32 = 2;
pub const EXIT_BIND: i32 = 3;
pub const EXIT_SOCK_FATAL: i32 = 4;

/// Top-level gateway error.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("readiness facility failed: {0}")]
    Poller(#[from] io::Error),
}

impl GatewayError {
    /// Map an error to its process exit code.
    pub fn exit_code(&self) -> i32 {
        match self {
            GatewayError::Config(_) => EXIT_CONFIG,
            GatewayError::Bind { .. } => EXIT_BIND,
            GatewayError::Poller(_) => EXIT_SOCK_FATAL,
        }
    }
}

/// Error kinds the streaming core distinguishes. Per-packet kinds
/// (`Backpressure`, `PoolExhausted`) are accounted and the stream continues;
/// the rest transition the owning connection towards `Closing`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("client gone")]
    ClientGone,

    #[error("queue limit exceeded, unit dropped")]
    Backpressure,

    #[error("buffer pool exhausted")]
    PoolExhausted,

    #[error("upstream timeout: {0}")]
    UpstreamTimeout(&'static str),

    #[error("protocol error: {0}")]
    Protocol(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_distinct() {
        let config = GatewayError::Config("x".into());
        let bind = GatewayError::Bind {
            addr: "0.0.0.0:1".into(),
            source: io::Error::from(io::ErrorKind::PermissionDenied),
        };
        assert_eq!(config.exit_code(), EXIT_CONFIG);
        assert_eq!(bind.exit_code(), EXIT_BIND);
        assert_ne!(EXIT_CONFIG, EXIT_BIND);
        assert_ne!(EXIT_BIND, EXIT_SOCK_FATAL);
    }
}
