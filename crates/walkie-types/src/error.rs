use thiserror::Error;

/// Result type used across the walkie workspace's shared types.
pub type Result<T> = std::result::Result<T, WalkieError>;

/// Errors that can occur while building, parsing, or exchanging walkie
/// protocol messages.
#[derive(Error, Debug)]
pub enum WalkieError {
    #[error("network I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed datagram: {0}")]
    MalformedDatagram(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("rpc timed out waiting for a response")]
    RpcTimeout,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
