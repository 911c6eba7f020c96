use thiserror::Error;

pub type Result<T> = std::result::Result<T, AudioError>;

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("no input audio device available")]
    NoInputDevice,

    #[error("no output audio device available")]
    NoOutputDevice,

    #[error("unsupported sample format: {0}")]
    UnsupportedSampleFormat(String),

    #[error("audio device error: {0}")]
    Device(String),

    #[error("codec error: {0}")]
    Codec(String),
}
