use thiserror::Error;

pub type Result<T> = std::result::Result<T, TunnelError>;

/// Unified error type for the tunnel endpoint
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Internal hardware/OS error: {0}")]
    Internal(String),

    #[error("Invalid configuration provided: {0}")]
    InvalidConfig(String),

    #[error("Malformed relay frame: {0}")]
    MalformedFrame(String),

    #[error("Relay channel closed")]
    ChannelClosed,

    #[error("Relay connect request timed out")]
    ConnectTimeout,

    #[error("Relay host reported connect failure: {0}")]
    RelayConnectFailed(String),

    #[error("Network error during data transfer: {0}")]
    NetworkError(#[from] std::io::Error),

    #[error("Virtual interface write failed: {0}")]
    InterfaceWriteFailed(String),
}
