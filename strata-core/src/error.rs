use thiserror::Error;

#[derive(Error, Debug)]
pub enum StrataError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request timed out after {elapsed_ms}ms [sequence={sequence}]")]
    RequestTimeout { sequence: String, elapsed_ms: u64 },

    #[error("Connection wait timed out after {0}ms")]
    ConnectTimeout(u64),

    #[error("Not connected: {0}")]
    Disconnected(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown peer node [node_id={0}]")]
    PeerNotFound(u32),

    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),
}

pub type Result<T> = std::result::Result<T, StrataError>;
