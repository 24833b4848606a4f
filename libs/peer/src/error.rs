use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to start mDNS daemon: {0}")]
    DaemonStart(String),

    #[error("failed to register service: {0}")]
    Registration(String),

    #[error("could not determine local IPv4 address: {0}")]
    NoLocalAddress(String),
}

#[derive(Debug, Error)]
pub enum AuthenticationError {
    #[error("authentication rejected by peer")]
    Rejected,

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("request to peer failed: {0}")]
    Request(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("not authenticated with peer")]
    NotAuthenticated,

    #[error("peer reported insufficient space: need {required} bytes, have {available} bytes")]
    InsufficientSpace { required: u64, available: u64 },

    #[error("transfer request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("local I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Runtime(String),
}
