use thiserror::Error;

/// Errors produced by the remo protocol and tunnel layers.
#[derive(Debug, Error)]
pub enum RemoError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("handshake rejected: {0}")]
    Handshake(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("identity error: {0}")]
    Identity(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("tunnel closed")]
    TunnelClosed,

    #[error("timeout")]
    Timeout,

    #[error("store error: {0}")]
    Store(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for RemoError {
    fn from(e: serde_json::Error) -> Self {
        RemoError::Protocol(e.to_string())
    }
}

impl From<base64::DecodeError> for RemoError {
    fn from(e: base64::DecodeError) -> Self {
        RemoError::Protocol(format!("invalid base64: {e}"))
    }
}

pub type RemoResult<T> = Result<T, RemoError>;
