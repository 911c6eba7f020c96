use thiserror::Error;

pub type Result<T> = std::result::Result<T, NetError>;

/// Errors surfaced by the UDP control/data client.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed datagram: {0}")]
    MalformedDatagram(String),

    #[error("rpc timed out waiting for a reply")]
    RpcTimeout,

    #[error("jitter buffer error: {0}")]
    Jitter(#[from] walkie_jitter::JitterError),
}
