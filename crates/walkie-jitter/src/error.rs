use thiserror::Error;

pub type Result<T> = std::result::Result<T, JitterError>;

/// Errors local to the jitter-buffer/codec boundary. Mirrors the
/// one-variant-per-failure-domain shape of `neteq::error::NetEqError`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum JitterError {
    #[error("decoder error: {0}")]
    Codec(String),

    #[error("malformed broadcast datagram: {0}")]
    MalformedDatagram(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
